use bytes::{BufMut, BytesMut};

use crate::proto::frame::Frame;

/// A RESP encoder that converts [`Frame`] types to bytes.
///
/// The encoder accumulates data in an internal buffer so several frames
/// (for example `ASKING` followed by the redirected command) can be
/// written with one syscall.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Encodes a frame into the internal buffer using RESP protocol.
    ///
    /// # Arguments
    ///
    /// * `frame` - The frame to encode
    pub fn encode(&mut self, frame: &Frame) {
        self.buf.reserve(encoded_len(frame));
        self.put(frame);
    }

    fn put(&mut self, frame: &Frame) {
        match frame {
            Frame::SimpleString(s) => self.line(b'+', s),
            Frame::Error(e) => self.line(b'-', e),
            Frame::Integer(n) => self.line(b':', n.to_string().as_bytes()),
            Frame::BulkString(Some(data)) => {
                self.line(b'$', data.len().to_string().as_bytes());
                self.buf.extend_from_slice(data);
                self.buf.extend_from_slice(b"\r\n");
            }
            Frame::BulkString(None) | Frame::Null => self.buf.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                self.line(b'*', items.len().to_string().as_bytes());
                for item in items {
                    self.put(item);
                }
            }
        }
    }

    fn line(&mut self, tag: u8, body: &[u8]) {
        self.buf.put_u8(tag);
        self.buf.extend_from_slice(body);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Takes the encoded data from the buffer, leaving it empty.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }
}

/// Number of bytes [`Encoder::encode`] will produce for `frame`.
pub(crate) fn encoded_len(frame: &Frame) -> usize {
    fn digits(n: usize) -> usize {
        n.checked_ilog10().map_or(1, |d| d as usize + 1)
    }
    match frame {
        Frame::SimpleString(s) | Frame::Error(s) => s.len() + 3,
        Frame::Integer(n) => n.to_string().len() + 3,
        Frame::BulkString(Some(data)) => 1 + digits(data.len()) + 2 + data.len() + 2,
        Frame::BulkString(None) | Frame::Null => 5,
        Frame::Array(items) => {
            1 + digits(items.len()) + 2 + items.iter().map(encoded_len).sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_simple_string() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::ok());
        assert_eq!(encoder.take().as_ref(), b"+OK\r\n");
    }

    #[test]
    fn test_encode_integer() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::Integer(-42));
        assert_eq!(encoder.take().as_ref(), b":-42\r\n");
    }

    #[test]
    fn test_encode_command_array() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::Array(vec![Frame::bulk("GET"), Frame::bulk("foo")]));
        assert_eq!(
            encoder.take().as_ref(),
            b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n"
        );
    }

    #[test]
    fn test_encode_two_frames_back_to_back() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::Array(vec![Frame::bulk("ASKING")]));
        encoder.encode(&Frame::Array(vec![Frame::bulk("GET"), Frame::bulk("k")]));
        assert_eq!(
            encoder.take().as_ref(),
            b"*1\r\n$6\r\nASKING\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"
        );
        assert!(encoder.take().is_empty());
    }

    #[test]
    fn test_encoded_len_matches_output() {
        let frame = Frame::Array(vec![
            Frame::bulk(vec![b'x'; 120]),
            Frame::Integer(12345),
            Frame::Null,
            Frame::ok(),
        ]);
        let mut encoder = Encoder::new();
        encoder.encode(&frame);
        assert_eq!(encoder.take().len(), encoded_len(&frame));
    }
}
