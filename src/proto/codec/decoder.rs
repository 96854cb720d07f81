use bytes::{Buf, Bytes, BytesMut};

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024; // 512 MB default
/// Deepest array nesting accepted in one frame.
const MAX_DEPTH: usize = 64;

/// A RESP decoder that converts bytes to [`Frame`] types.
///
/// Input is buffered until a whole frame is available. A frame is parsed
/// against a cursor and the buffer only advances once it is complete, so a
/// reply split across several reads never loses bytes.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a new decoder with a custom maximum frame size.
    ///
    /// # Arguments
    ///
    /// * `max_frame_size` - Maximum size in bytes for a single frame
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends raw bytes to the internal buffer.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns true if no undecoded bytes remain.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Attempts to decode a frame from the buffer.
    ///
    /// # Returns
    ///
    /// `Ok(Some(frame))` for a complete frame, `Ok(None)` if more data is
    /// needed, or [`Error::Protocol`] if the data is malformed
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.len() > self.max_frame_size {
            return Err(Error::protocol("buffer size exceeded maximum frame size"));
        }

        let mut cursor = 0;
        match self.parse(&mut cursor, 0)? {
            Some(frame) => {
                self.buf.advance(cursor);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    fn parse(&self, cursor: &mut usize, depth: usize) -> Result<Option<Frame>> {
        let Some(&tag) = self.buf.get(*cursor) else {
            return Ok(None);
        };
        let Some(line) = self.line(*cursor + 1) else {
            return Ok(None);
        };
        let body = &self.buf[*cursor + 1..line];
        *cursor = line + 2;

        match tag {
            b'+' => Ok(Some(Frame::SimpleString(body.to_vec()))),
            b'-' => Ok(Some(Frame::Error(body.to_vec()))),
            b':' => Ok(Some(Frame::Integer(parse_int(body)?))),
            b'$' => {
                let len = parse_int(body)?;
                if len == -1 {
                    return Ok(Some(Frame::BulkString(None)));
                }
                let len = usize::try_from(len)
                    .map_err(|_| Error::protocol("negative bulk string length"))?;
                if len > self.max_frame_size {
                    return Err(Error::protocol(
                        "bulk string length exceeds maximum frame size",
                    ));
                }
                if self.buf.len() < *cursor + len + 2 {
                    return Ok(None);
                }
                if &self.buf[*cursor + len..*cursor + len + 2] != b"\r\n" {
                    return Err(Error::protocol("bulk string missing terminator"));
                }
                let data = Bytes::copy_from_slice(&self.buf[*cursor..*cursor + len]);
                *cursor += len + 2;
                Ok(Some(Frame::BulkString(Some(data))))
            }
            b'*' => {
                let len = parse_int(body)?;
                if len == -1 {
                    return Ok(Some(Frame::Null));
                }
                let len =
                    usize::try_from(len).map_err(|_| Error::protocol("negative array length"))?;
                if depth >= MAX_DEPTH {
                    return Err(Error::protocol("array nesting exceeds maximum depth"));
                }
                // Assume minimum 16 bytes per item
                if len > self.max_frame_size / 16 {
                    return Err(Error::protocol("array length exceeds reasonable maximum"));
                }
                let mut items = Vec::new();
                items
                    .try_reserve_exact(len)
                    .map_err(|_| Error::OutOfMemory)?;
                for _ in 0..len {
                    match self.parse(cursor, depth + 1)? {
                        Some(frame) => items.push(frame),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Frame::Array(items)))
            }
            other => Err(Error::protocol(format!(
                "unknown frame type: {}",
                other as char
            ))),
        }
    }

    /// Index of the next CRLF at or after `from`.
    fn line(&self, from: usize) -> Option<usize> {
        if self.buf.len() < from + 2 {
            return None;
        }
        self.buf[from..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| from + i)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_int(body: &[u8]) -> Result<i64> {
    std::str::from_utf8(body)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::protocol(format!("invalid integer: {:?}", String::from_utf8_lossy(body))))
}
