use bytes::Bytes;

/// A raw reply (or request) on the wire.
///
/// The core never interprets replies beyond the few cases it needs for
/// routing; everything else is handed to a per-command decoder.
///
/// - SimpleString: status replies like "OK" or "QUEUED"
/// - Error: error replies, including cluster redirects
/// - Integer: numeric replies
/// - BulkString: binary-safe payloads (`None` is the null bulk string)
/// - Array: requests and multi-value replies
/// - Null: the null array, returned e.g. by an aborted `EXEC`
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
    /// Null (*-1).
    Null,
}

impl Frame {
    /// Builds a non-null bulk string frame.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(data.into()))
    }

    /// Builds a simple string frame.
    pub fn simple(status: &str) -> Self {
        Frame::SimpleString(status.as_bytes().to_vec())
    }

    /// Builds an error frame.
    pub fn error(message: &str) -> Self {
        Frame::Error(message.as_bytes().to_vec())
    }

    /// Returns true for error replies.
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    /// Returns true for both null encodings (`$-1` and `*-1`).
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }

    /// Returns true if this is the simple string `status`.
    pub fn is_status(&self, status: &str) -> bool {
        matches!(self, Frame::SimpleString(s) if s.eq_ignore_ascii_case(status.as_bytes()))
    }

    /// Short human-readable name of the frame kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::SimpleString(_) => "simple string",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::BulkString(Some(_)) => "bulk string",
            Frame::BulkString(None) => "null bulk string",
            Frame::Array(_) => "array",
            Frame::Null => "null",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constructors() {
        assert_eq!(Frame::bulk("hello"), Frame::BulkString(Some(Bytes::from("hello"))));
        assert_eq!(Frame::simple("OK"), Frame::SimpleString(b"OK".to_vec()));
        assert_eq!(Frame::error("ERR x"), Frame::Error(b"ERR x".to_vec()));
    }

    #[test]
    fn test_frame_is_null() {
        assert!(Frame::Null.is_null());
        assert!(Frame::BulkString(None).is_null());
        assert!(!Frame::Integer(42).is_null());
    }

    #[test]
    fn test_frame_is_status() {
        assert!(Frame::simple("QUEUED").is_status("QUEUED"));
        assert!(Frame::simple("ok").is_status("OK"));
        assert!(!Frame::bulk("OK").is_status("OK"));
    }

    #[test]
    fn test_frame_kind() {
        assert_eq!(Frame::Integer(1).kind(), "integer");
        assert_eq!(Frame::BulkString(None).kind(), "null bulk string");
        assert!(Frame::error("ERR").is_error());
    }
}
