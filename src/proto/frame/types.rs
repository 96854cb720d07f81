use bytes::Bytes;

/// A RESP (Redis Serialization Protocol) frame.
///
/// Replies handed back to callers are frames; the router only inspects
/// their type tag (status, error, integer, string, array, nil).
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string (+OK).
    SimpleString(Vec<u8>),
    /// Error (-ERR).
    Error(Vec<u8>),
    /// Integer (:1000).
    Integer(i64),
    /// Bulk string ($6\r\nfoobar).
    BulkString(Option<Bytes>),
    /// Array (*2\r\n...).
    Array(Vec<Frame>),
    /// Null ($-1 or *-1).
    Null,
}

impl Frame {
    /// Builds a bulk string frame.
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(data.into()))
    }

    /// Builds a `+OK` status frame.
    #[inline]
    pub fn ok() -> Self {
        Frame::SimpleString(b"OK".to_vec())
    }

    /// Returns true if this frame is an error reply.
    #[inline]
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns true if this frame is nil.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }

    /// Returns the error text if this is an error reply.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Frame::Error(e) => Some(String::from_utf8_lossy(e).into_owned()),
            _ => None,
        }
    }

    /// Returns the payload of a string-like frame.
    ///
    /// # Returns
    ///
    /// The bytes of a simple or bulk string, None for anything else
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::SimpleString(s) => Some(s),
            Frame::BulkString(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Returns the value of an integer frame.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Frame::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Approximate heap footprint, used when reserving memory for a reply.
    pub(crate) fn weight(&self) -> usize {
        match self {
            Frame::SimpleString(s) | Frame::Error(s) => s.len(),
            Frame::BulkString(Some(b)) => b.len(),
            Frame::Array(items) => {
                items.len() * std::mem::size_of::<Frame>()
                    + items.iter().map(Frame::weight).sum::<usize>()
            }
            Frame::Integer(_) | Frame::BulkString(None) | Frame::Null => 0,
        }
    }
}

#[cfg(test)]
impl Frame {
    /// Converts the frame to a human-readable string representation.
    pub fn to_string(&self) -> Option<String> {
        match self {
            Frame::SimpleString(s) => String::from_utf8(s.clone()).ok(),
            Frame::Error(e) => String::from_utf8(e.clone()).ok(),
            Frame::Integer(i) => Some(i.to_string()),
            Frame::BulkString(b) => b.as_ref().map(|s| String::from_utf8_lossy(s).into_owned()),
            Frame::Array(a) => Some(format!(
                "[{}]",
                a.iter()
                    .filter_map(|f| f.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            Frame::Null => Some("nil".to_string()),
        }
    }
}
