//! Byte-level framing helpers for the v086 wire format
//!
//! All integers are little-endian. Strings are raw bytes followed by a
//! single `0x00` stop byte.

/// String terminator used by every v086 string field
pub const STOP_BYTE: u8 = 0x00;

/// Encoded size of a string field (bytes plus stop byte)
pub fn string_len(value: &str) -> usize {
    value.len() + 1
}

/// Frame builder for constructing messages
pub struct FrameBuilder {
    buffer: Vec<u8>,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Write raw bytes
    pub fn write(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self
    }

    /// Write a u8
    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    /// Write a u16 (little-endian)
    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a u32 (little-endian)
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Write a string followed by the stop byte
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.buffer.extend_from_slice(value.as_bytes());
        self.buffer.push(STOP_BYTE);
        self
    }

    /// Get the built frame
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }

    /// Get the current length
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame reader for parsing messages
pub struct FrameReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read n bytes
    pub fn read(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.remaining() {
            return None;
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Some(slice)
    }

    /// Read a u8
    pub fn read_u8(&mut self) -> Option<u8> {
        self.read(1).map(|b| b[0])
    }

    /// Read a u16 (little-endian)
    pub fn read_u16(&mut self) -> Option<u16> {
        self.read(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a u32 (little-endian)
    pub fn read_u32(&mut self) -> Option<u32> {
        self.read(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a stop-byte terminated string.
    ///
    /// Returns `None` when no stop byte is left in the buffer; the position
    /// is untouched in that case. Invalid UTF-8 is replaced, not rejected.
    pub fn read_string(&mut self) -> Option<String> {
        let rest = self.remaining_bytes();
        let end = rest.iter().position(|&b| b == STOP_BYTE)?;
        let value = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.position += end + 1;
        Some(value)
    }

    /// Number of unread bytes
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    /// Unread bytes
    pub fn remaining_bytes(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    /// Check if there are more bytes to read
    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    /// Get current position
    pub fn position(&self) -> usize {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_builder() {
        let mut builder = FrameBuilder::new();
        builder
            .write_u8(0x01)
            .write_u16(1234)
            .write_u32(56789)
            .write_string("abc")
            .write(b"xy");
        let frame = builder.build();

        assert_eq!(frame.len(), 1 + 2 + 4 + 4 + 2);
        assert_eq!(&frame[7..11], b"abc\0");
    }

    #[test]
    fn test_frame_reader() {
        let mut builder = FrameBuilder::new();
        builder
            .write_u8(42)
            .write_u16(1000)
            .write_u32(999999)
            .write_string("player");
        let data = builder.build();

        let mut reader = FrameReader::new(&data);

        assert_eq!(reader.read_u8(), Some(42));
        assert_eq!(reader.read_u16(), Some(1000));
        assert_eq!(reader.read_u32(), Some(999999));
        assert_eq!(reader.read_string().as_deref(), Some("player"));
        assert!(!reader.has_remaining());
    }

    #[test]
    fn test_little_endian_layout() {
        let mut builder = FrameBuilder::new();
        builder.write_u16(0x1234).write_u32(0xAABBCCDD);
        assert_eq!(builder.build(), vec![0x34, 0x12, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_frame_reader_overflow() {
        let data = vec![1, 2, 3];
        let mut reader = FrameReader::new(&data);

        assert!(reader.read_u16().is_some());
        assert!(reader.read_u16().is_none());
        assert_eq!(reader.remaining(), 1);
        assert!(reader.read_u8().is_some());
        assert!(reader.read_u8().is_none()); // No more data
    }

    #[test]
    fn test_unterminated_string() {
        let data = b"no stop byte";
        let mut reader = FrameReader::new(data);

        assert!(reader.read_string().is_none());
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_empty_string() {
        let data = [0x00, 0x07];
        let mut reader = FrameReader::new(&data);

        assert_eq!(reader.read_string().as_deref(), Some(""));
        assert_eq!(reader.read_u8(), Some(7));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let data = [0xFF, b'a', 0x00];
        let mut reader = FrameReader::new(&data);

        let value = reader.read_string().unwrap();
        assert!(value.ends_with('a'));
        assert_eq!(string_len("abc"), 4);
    }
}
