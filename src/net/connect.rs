//! Connect server
//!
//! Clients first talk to the well-known connect port: `PING` is answered
//! with `PONG`, and `HELLO<protocol>` with `HELLOD00D<port>` naming the
//! session port, or `TOO` when the server is full. Every message is an
//! ASCII string terminated by a 0x00 byte.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::controller::V086Controller;
use super::framing::STOP_BYTE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMessage {
    Hello { protocol: String },
    HelloD00d { port: u16 },
    TooMany,
    Ping,
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("connect message is not 0x00-terminated")]
    Unterminated,
    #[error("unknown connect message '{0}'")]
    Unknown(String),
    #[error("invalid port in HELLOD00D: '{0}'")]
    InvalidPort(String),
}

impl ConnectMessage {
    pub fn encode(&self) -> Vec<u8> {
        let text = match self {
            ConnectMessage::Hello { protocol } => format!("HELLO{}", protocol),
            ConnectMessage::HelloD00d { port } => format!("HELLOD00D{}", port),
            ConnectMessage::TooMany => "TOO".to_string(),
            ConnectMessage::Ping => "PING".to_string(),
            ConnectMessage::Pong => "PONG".to_string(),
        };
        let mut bytes = text.into_bytes();
        bytes.push(STOP_BYTE);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ConnectError> {
        let Some((&STOP_BYTE, body)) = bytes.split_last() else {
            return Err(ConnectError::Unterminated);
        };
        let text = String::from_utf8_lossy(body);

        // HELLOD00D shares its prefix with HELLO
        if let Some(port) = text.strip_prefix("HELLOD00D") {
            return port
                .parse()
                .map(|port| ConnectMessage::HelloD00d { port })
                .map_err(|_| ConnectError::InvalidPort(port.to_string()));
        }
        if let Some(protocol) = text.strip_prefix("HELLO") {
            return Ok(ConnectMessage::Hello {
                protocol: protocol.to_string(),
            });
        }
        match text.as_ref() {
            "TOO" => Ok(ConnectMessage::TooMany),
            "PING" => Ok(ConnectMessage::Ping),
            "PONG" => Ok(ConnectMessage::Pong),
            other => Err(ConnectError::Unknown(other.to_string())),
        }
    }
}

/// UDP listener on the connect port
pub struct ConnectServer {
    socket: Arc<UdpSocket>,
    controller: Arc<V086Controller>,
}

impl ConnectServer {
    pub async fn bind(addr: SocketAddr, controller: Arc<V086Controller>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Connect server listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            controller,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until the socket fails
    pub async fn run(&self) -> io::Result<()> {
        let mut buf = [0u8; 1024];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            };

            match ConnectMessage::decode(&buf[..len]) {
                Ok(ConnectMessage::Ping) => {
                    debug!("PING from {}", from);
                    self.reply(from, ConnectMessage::Pong).await;
                }
                Ok(ConnectMessage::Hello { protocol }) => self.admit(from, protocol),
                Ok(other) => warn!("Unexpected {:?} from {}", other, from),
                Err(e) => warn!("Bad connect message from {}: {}", from, e),
            }
        }
    }

    async fn reply(&self, to: SocketAddr, message: ConnectMessage) {
        if let Err(e) = self.socket.send_to(&message.encode(), to).await {
            warn!("Failed to send {:?} to {}: {}", message, to, e);
        }
    }

    /// Admission binds sockets and may sleep between attempts, so it runs
    /// off the receive loop
    fn admit(&self, from: SocketAddr, protocol: String) {
        let socket = Arc::clone(&self.socket);
        let controller = Arc::clone(&self.controller);
        tokio::spawn(async move {
            let reply = match controller.new_connection(from, &protocol).await {
                Ok(port) => ConnectMessage::HelloD00d { port },
                Err(e) if e.is_capacity() => {
                    info!("Turning away {}: {}", from, e);
                    ConnectMessage::TooMany
                }
                Err(e) => {
                    info!("Not answering HELLO{} from {}: {}", protocol, from, e);
                    return;
                }
            };
            if let Err(e) = socket.send_to(&reply.encode(), from).await {
                warn!("Failed to answer HELLO from {}: {}", from, e);
            }
        });
    }
}
