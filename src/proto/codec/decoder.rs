use bytes::{Buf, BytesMut};

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Incremental RESP decoder.
///
/// Bytes are appended as they arrive from the socket; [`decode`](Decoder::decode)
/// yields a frame only once the whole frame is buffered. A partial frame
/// leaves the buffer untouched, so pipelined replies that straddle several
/// reads decode correctly.
///
/// # Example
///
/// ```
/// use shardis::proto::codec::Decoder;
/// use shardis::proto::frame::Frame;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"+OK\r\n:1\r\n");
/// assert_eq!(decoder.decode().unwrap(), Some(Frame::SimpleString(b"OK".to_vec())));
/// assert_eq!(decoder.decode().unwrap(), Some(Frame::Integer(1)));
/// assert_eq!(decoder.decode().unwrap(), None);
/// ```
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

    /// Creates a decoder that rejects frames larger than `max_frame_size` bytes.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends raw bytes read from the network.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drops any buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Decodes the next complete frame.
    ///
    /// Returns `Ok(None)` when more data is needed and an
    /// [`Error::Protocol`] when the buffered bytes are not valid RESP.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        match self.parse(0)? {
            Some((frame, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            None => {
                if self.buf.len() > self.max_frame_size {
                    return Err(protocol("buffered frame exceeds maximum frame size"));
                }
                Ok(None)
            }
        }
    }

    /// Parses one frame starting at `pos` without consuming anything.
    fn parse(&self, pos: usize) -> Result<Option<(Frame, usize)>> {
        let Some(&tag) = self.buf.get(pos) else {
            return Ok(None);
        };
        let Some(line_end) = self.find_crlf(pos + 1) else {
            return Ok(None);
        };
        let line = &self.buf[pos + 1..line_end];
        let next = line_end + 2;

        match tag {
            b'+' => Ok(Some((Frame::SimpleString(line.to_vec()), next))),
            b'-' => Ok(Some((Frame::Error(line.to_vec()), next))),
            b':' => Ok(Some((Frame::Integer(parse_int(line)?), next))),
            b'$' => {
                let len = parse_int(line)?;
                if len == -1 {
                    return Ok(Some((Frame::BulkString(None), next)));
                }
                let len = usize::try_from(len).map_err(|_| protocol("negative bulk length"))?;
                if len > self.max_frame_size {
                    return Err(protocol("bulk string length exceeds maximum frame size"));
                }
                if self.buf.len() < next + len + 2 {
                    return Ok(None);
                }
                if &self.buf[next + len..next + len + 2] != b"\r\n" {
                    return Err(protocol("bulk string is not terminated by CRLF"));
                }
                let data = self.buf[next..next + len].to_vec();
                Ok(Some((Frame::BulkString(Some(data.into())), next + len + 2)))
            }
            b'*' => {
                let len = parse_int(line)?;
                if len == -1 {
                    return Ok(Some((Frame::Null, next)));
                }
                let len = usize::try_from(len).map_err(|_| protocol("negative array length"))?;
                // every element takes at least 3 bytes on the wire
                if len > self.max_frame_size / 3 {
                    return Err(protocol("array length exceeds maximum frame size"));
                }
                let mut items = Vec::with_capacity(len.min(1024));
                let mut cursor = next;
                for _ in 0..len {
                    match self.parse(cursor)? {
                        Some((frame, after)) => {
                            items.push(frame);
                            cursor = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((Frame::Array(items), cursor)))
            }
            other => Err(protocol(&format!("unknown frame type: {:?}", other as char))),
        }
    }

    fn find_crlf(&self, from: usize) -> Option<usize> {
        self.buf
            .get(from..)?
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

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol("invalid integer"))
}

fn protocol(message: &str) -> Error {
    Error::Protocol {
        message: message.to_string(),
    }
}
