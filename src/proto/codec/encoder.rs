use bytes::{BufMut, Bytes, BytesMut};

use crate::proto::frame::Frame;

/// A RESP encoder that accumulates frames in one buffer.
///
/// Pipelines encode every queued request into the same buffer and flush it
/// with a single write.
///
/// # Example
///
/// ```
/// use shardis::proto::codec::Encoder;
/// use shardis::proto::frame::Frame;
///
/// let mut encoder = Encoder::new();
/// encoder.encode(&Frame::SimpleString(b"OK".to_vec()));
/// assert_eq!(encoder.take().as_ref(), b"+OK\r\n");
/// ```
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

    /// Encodes a frame into the internal buffer.
    pub fn encode(&mut self, frame: &Frame) {
        match frame {
            Frame::SimpleString(s) => self.line(b'+', s),
            Frame::Error(e) => self.line(b'-', e),
            Frame::Integer(n) => self.line(b':', n.to_string().as_bytes()),
            Frame::BulkString(Some(data)) => self.bulk(data),
            Frame::BulkString(None) => self.buf.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                self.line(b'*', items.len().to_string().as_bytes());
                for item in items {
                    self.encode(item);
                }
            }
            Frame::Null => self.buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// Encodes a request (an array of bulk strings) without building a frame.
    pub fn encode_request<'a, I>(&mut self, args: I)
    where
        I: ExactSizeIterator<Item = &'a Bytes>,
    {
        self.line(b'*', args.len().to_string().as_bytes());
        for arg in args {
            self.bulk(arg);
        }
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Takes the encoded bytes, leaving the encoder reusable.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    fn line(&mut self, tag: u8, body: &[u8]) {
        self.buf.put_u8(tag);
        self.buf.extend_from_slice(body);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn bulk(&mut self, data: &[u8]) {
        self.line(b'$', data.len().to_string().as_bytes());
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
    }
}
