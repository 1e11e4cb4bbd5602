//! RESP2 framing for the document-cache client.
//!
//! Only what a client needs: commands go out as arrays of bulk strings, replies
//! come back as any RESP2 type. Encoding of every reply type is kept so loopback
//! fixtures can speak the same protocol.

use bytes::{BufMut, Bytes, BytesMut};

pub const MAX_NESTING_DEPTH: usize = 32;

/// 512 MiB, the largest bulk string a Redis server accepts.
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

pub const MAX_ELEMENTS: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Array(Vec<Reply>),
    Nil,
}

impl Reply {
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Self::Bulk(data.into())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Integer(n) => {
                buf.put_u8(b':');
                buf.put_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            Self::Bulk(data) => put_bulk(buf, data),
            Self::Array(items) => {
                buf.put_u8(b'*');
                buf.put_slice(items.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for item in items {
                    item.encode(buf);
                }
            }
            Self::Nil => buf.put_slice(b"$-1\r\n"),
        }
    }
}

pub fn encode_command<A: AsRef<[u8]>>(args: &[A], buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(args.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    for arg in args {
        put_bulk(buf, arg.as_ref());
    }
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(b'$');
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

/// Outcome of decoding the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete reply and the number of bytes it occupied.
    Frame(Reply, usize),
    /// The buffer holds a partial frame; nothing can complete it before
    /// `data.len()` reaches this many bytes.
    Incomplete(usize),
}

/// Decodes one frame from the front of `data`.
///
/// `Ok(None)` means more bytes are needed; on success the second element is the
/// number of bytes consumed.
pub fn decode(data: &[u8]) -> Result<Option<(Reply, usize)>, String> {
    match decode_frame(data)? {
        Decoded::Frame(reply, used) => Ok(Some((reply, used))),
        Decoded::Incomplete(_) => Ok(None),
    }
}

/// Like [`decode`], but a partial frame reports the buffer length worth retrying at.
pub fn decode_frame(data: &[u8]) -> Result<Decoded, String> {
    decode_at(data, 0)
}

fn decode_at(data: &[u8], depth: usize) -> Result<Decoded, String> {
    if depth > MAX_NESTING_DEPTH {
        return Err("maximum nesting depth exceeded".to_string());
    }
    let Some((&prefix, rest)) = data.split_first() else {
        return Ok(Decoded::Incomplete(1));
    };
    let Some(line_end) = find_crlf(rest) else {
        return Ok(Decoded::Incomplete(data.len() + 1));
    };
    let line = &rest[..line_end];
    // prefix byte + line + CRLF
    let header_len = 1 + line_end + 2;

    match prefix {
        b'+' => Ok(Decoded::Frame(Reply::Simple(lossy(line)), header_len)),
        b'-' => Ok(Decoded::Frame(Reply::Error(lossy(line)), header_len)),
        b':' => Ok(Decoded::Frame(Reply::Integer(parse_int(line)?), header_len)),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Decoded::Frame(Reply::Nil, header_len));
            }
            let len = usize::try_from(len).map_err(|_| "invalid bulk string length")?;
            if len > MAX_BULK_SIZE {
                return Err(format!("bulk string too large: {len} > {MAX_BULK_SIZE}"));
            }
            let end = header_len + len;
            if data.len() < end + 2 {
                return Ok(Decoded::Incomplete(end + 2));
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err("missing CRLF after bulk string".to_string());
            }
            let bytes = Bytes::copy_from_slice(&data[header_len..end]);
            Ok(Decoded::Frame(Reply::Bulk(bytes), end + 2))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Decoded::Frame(Reply::Nil, header_len));
            }
            let len = usize::try_from(len).map_err(|_| "invalid array length")?;
            if len > MAX_ELEMENTS {
                return Err(format!("array too large: {len} > {MAX_ELEMENTS}"));
            }
            let mut items = Vec::with_capacity(len.min(1024));
            let mut offset = header_len;
            for _ in 0..len {
                match decode_at(&data[offset..], depth + 1)? {
                    Decoded::Frame(item, used) => {
                        items.push(item);
                        offset += used;
                    }
                    Decoded::Incomplete(need) => return Ok(Decoded::Incomplete(offset + need)),
                }
            }
            Ok(Decoded::Frame(Reply::Array(items), offset))
        }
        other => Err(format!("unexpected reply type byte: 0x{other:02x}")),
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn parse_int(line: &[u8]) -> Result<i64, String> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| format!("invalid integer: {}", lossy(line)))
}
