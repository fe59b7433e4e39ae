use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::utils::error::ProtocolError;

/// Largest bulk string the client accepts from Redis.
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// A RESP2 value.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

impl Frame {
    /// Builds a command: an array of bulk strings.
    pub fn command<I, A>(args: I) -> Frame
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        Frame::Array(args.into_iter().map(|a| Frame::Bulk(a.into())).collect())
    }

    /// Returns `Ok(())` once `src` holds a complete frame, advancing past it.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), ProtocolError> {
        match get_u8(src)? {
            b'+' | b'-' | b':' => {
                get_line(src)?;
                Ok(())
            }
            b'$' => match get_length(src)? {
                None => Ok(()),
                Some(len) => skip(src, len + 2),
            },
            b'*' => {
                if let Some(count) = get_length(src)? {
                    for _ in 0..count {
                        Frame::check(src)?;
                    }
                }
                Ok(())
            }
            byte => Err(ProtocolError::InvalidFrameType(byte)),
        }
    }

    /// Parses a frame previously validated with [`Frame::check`].
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, ProtocolError> {
        match get_u8(src)? {
            b'+' => Ok(Frame::Simple(get_string(src)?)),
            b'-' => Ok(Frame::Error(get_string(src)?)),
            b':' => Ok(Frame::Integer(get_decimal(src)?)),
            b'$' => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(len) => {
                    if src.remaining() < len + 2 {
                        return Err(ProtocolError::Incomplete);
                    }
                    let start = src.position() as usize;
                    let data = Bytes::copy_from_slice(&src.get_ref()[start..start + len]);
                    skip(src, len + 2)?;
                    Ok(Frame::Bulk(data))
                }
            },
            b'*' => match get_length(src)? {
                None => Ok(Frame::Null),
                Some(count) => {
                    let mut frames = Vec::with_capacity(count.min(64));
                    for _ in 0..count {
                        frames.push(Frame::parse(src)?);
                    }
                    Ok(Frame::Array(frames))
                }
            },
            byte => Err(ProtocolError::InvalidFrameType(byte)),
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(b'+');
                dst.put(s.as_bytes());
                dst.put(&b"\r\n"[..]);
            }
            Frame::Error(s) => {
                dst.put_u8(b'-');
                dst.put(s.as_bytes());
                dst.put(&b"\r\n"[..]);
            }
            Frame::Integer(n) => {
                dst.put_u8(b':');
                dst.put(n.to_string().as_bytes());
                dst.put(&b"\r\n"[..]);
            }
            Frame::Bulk(data) => {
                dst.put_u8(b'$');
                dst.put(data.len().to_string().as_bytes());
                dst.put(&b"\r\n"[..]);
                dst.put(data.as_ref());
                dst.put(&b"\r\n"[..]);
            }
            Frame::Null => dst.put(&b"$-1\r\n"[..]),
            Frame::Array(frames) => {
                dst.put_u8(b'*');
                dst.put(frames.len().to_string().as_bytes());
                dst.put(&b"\r\n"[..]);
                for frame in frames {
                    frame.encode(dst);
                }
            }
        }
    }

    /// Bulk or simple string contents as UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(data) => std::str::from_utf8(data).ok(),
            _ => None,
        }
    }
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    if !src.has_remaining() {
        return Err(ProtocolError::Incomplete);
    }
    Ok(src.get_u8())
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    match buf[start..].windows(2).position(|w| w == b"\r\n") {
        Some(offset) => {
            src.set_position((start + offset + 2) as u64);
            Ok(&buf[start..start + offset])
        }
        None => Err(ProtocolError::Incomplete),
    }
}

fn get_string(src: &mut Cursor<&[u8]>) -> Result<String, ProtocolError> {
    let line = get_line(src)?;
    String::from_utf8(line.to_vec()).map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = get_line(src)?;
    let s = std::str::from_utf8(line).map_err(|e| ProtocolError::InvalidInteger(e.to_string()))?;
    s.parse::<i64>()
        .map_err(|e| ProtocolError::InvalidInteger(e.to_string()))
}

/// Length prefix of a bulk string or array; `None` for the `-1` null marker.
fn get_length(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, ProtocolError> {
    match get_decimal(src)? {
        -1 => Ok(None),
        len if len < 0 => Err(ProtocolError::InvalidBulkLength(len)),
        len if len as usize > MAX_BULK_SIZE => Err(ProtocolError::FrameTooLarge(len as usize)),
        len => Ok(Some(len as usize)),
    }
}

fn skip(src: &mut Cursor<&[u8]>, n: usize) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        return Err(ProtocolError::Incomplete);
    }
    src.set_position(src.position() + n as u64);
    Ok(())
}
