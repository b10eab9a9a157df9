//! Datagram bundles
//!
//! One UDP datagram carries a `u8` count followed by up to
//! [`MAX_BUNDLE_SIZE`] framed messages, newest first.

use crate::net::framing::{FrameBuilder, FrameReader};
use crate::net::protocol::{MessageError, ParseError, V086Message, MAX_BUNDLE_SIZE};

/// Errors raised while building a bundle for sending
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BundleError {
    #[error("bundle must carry at least one message")]
    Empty,
    #[error("bundle holds {0} messages (max {MAX_BUNDLE_SIZE})")]
    TooManyMessages(usize),
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Ordered group of messages sent in one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    messages: Vec<V086Message>,
}

/// Result of decoding a datagram: everything read before the first failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBundle {
    pub messages: Vec<V086Message>,
    pub error: Option<ParseError>,
}

impl DecodedBundle {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Whether `number` comes after `last` in 16-bit wrapping order
pub fn is_newer(number: u16, last: u16) -> bool {
    let distance = number.wrapping_sub(last);
    distance != 0 && distance < 0x8000
}

impl Bundle {
    pub fn new(messages: Vec<V086Message>) -> Result<Self, BundleError> {
        if messages.is_empty() {
            return Err(BundleError::Empty);
        }
        if messages.len() > MAX_BUNDLE_SIZE {
            return Err(BundleError::TooManyMessages(messages.len()));
        }
        Ok(Self { messages })
    }

    pub fn single(message: V086Message) -> Self {
        Self {
            messages: vec![message],
        }
    }

    pub fn messages(&self) -> &[V086Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<V086Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        1 + self.messages.iter().map(V086Message::encoded_len).sum::<usize>()
    }

    /// Count byte followed by every message in order
    pub fn encode(&self) -> Result<Vec<u8>, BundleError> {
        let mut out = FrameBuilder::with_capacity(self.encoded_len());
        out.write_u8(self.messages.len() as u8);
        for message in &self.messages {
            message.write_to(&mut out)?;
        }
        Ok(out.build())
    }

    /// Decode every message in a datagram.
    ///
    /// Reading stops at the first malformed message; the messages read
    /// before it are still returned.
    pub fn decode(bytes: &[u8]) -> DecodedBundle {
        Self::decode_newer_than(bytes, None)
    }

    /// Decode, stopping at the first message not newer than `last`
    pub fn decode_newer_than(bytes: &[u8], last: Option<u16>) -> DecodedBundle {
        let mut reader = FrameReader::new(bytes);
        let mut messages = Vec::new();

        let count = match reader.read_u8() {
            Some(0) => {
                return DecodedBundle {
                    messages,
                    error: Some(ParseError::EmptyBundle),
                }
            }
            Some(count) => usize::from(count).min(MAX_BUNDLE_SIZE),
            None => {
                return DecodedBundle {
                    messages,
                    error: Some(ParseError::Truncated {
                        message: "bundle",
                        needed: 1,
                        remaining: 0,
                    }),
                }
            }
        };

        for _ in 0..count {
            match V086Message::read_from(&mut reader) {
                Ok(message) => {
                    if let Some(last) = last {
                        if !is_newer(message.number, last) {
                            break;
                        }
                    }
                    messages.push(message);
                }
                Err(error) => {
                    return DecodedBundle {
                        messages,
                        error: Some(error),
                    }
                }
            }
        }

        DecodedBundle {
            messages,
            error: None,
        }
    }
}
