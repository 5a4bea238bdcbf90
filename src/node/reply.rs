//! RESP2 replies from a storage node.
//!
//! The parser works on a buffered byte slice and never consumes input on
//! its own: it returns `Ok(None)` when the buffer holds only part of a
//! reply so the caller can read more and retry.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::Cursor;

use crate::common::{Error, Result};

/// Nesting limit for array replies.
const MAX_NESTING_DEPTH: usize = 32;

/// A single parsed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`
    Bulk(Bytes),
    /// `*2\r\n...`
    Array(Vec<Reply>),
    /// `$-1\r\n` or `*-1\r\n`
    Null,
}

impl Reply {
    /// Textual view of simple and bulk replies.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Simple(s) => Some(s),
            Reply::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Integer view; bulk strings holding digits are accepted too.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            Reply::Bulk(_) | Reply::Simple(_) => self.as_str()?.parse().ok(),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }
}

/// Serialize a command as an array of bulk strings.
pub fn encode_command(cmd: &str, args: &[&str], dst: &mut BytesMut) {
    dst.put_u8(b'*');
    dst.put_slice((args.len() + 1).to_string().as_bytes());
    dst.put_slice(b"\r\n");
    for part in std::iter::once(cmd).chain(args.iter().copied()) {
        dst.put_u8(b'$');
        dst.put_slice(part.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
        dst.put_slice(part.as_bytes());
        dst.put_slice(b"\r\n");
    }
}

/// Try to parse one reply from `buf`.
///
/// Returns `Ok(Some((reply, consumed)))` for a complete reply, `Ok(None)`
/// if more data is needed, or `Error::Protocol` for malformed input.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    match try_parse(&mut cursor, 0) {
        Ok(reply) => Ok(Some((reply, cursor.position() as usize))),
        Err(Incomplete::Yes) => Ok(None),
        Err(Incomplete::Malformed(msg)) => Err(Error::Protocol(msg)),
    }
}

enum Incomplete {
    Yes,
    Malformed(String),
}

fn try_parse(cursor: &mut Cursor<&[u8]>, depth: usize) -> std::result::Result<Reply, Incomplete> {
    match read_byte(cursor)? {
        b'+' => Ok(Reply::Simple(read_string(cursor)?)),
        b'-' => Ok(Reply::Error(read_string(cursor)?)),
        b':' => Ok(Reply::Integer(read_integer(cursor)?)),
        b'$' => {
            let len = read_integer(cursor)?;
            if len < 0 {
                return Ok(Reply::Null);
            }
            let len = len as usize;
            let pos = cursor.position() as usize;
            let buf = *cursor.get_ref();
            if buf.len() < pos + len + 2 {
                return Err(Incomplete::Yes);
            }
            if &buf[pos + len..pos + len + 2] != b"\r\n" {
                return Err(Incomplete::Malformed(format!(
                    "bulk string of length {} not terminated",
                    len
                )));
            }
            cursor.set_position((pos + len + 2) as u64);
            Ok(Reply::Bulk(Bytes::copy_from_slice(&buf[pos..pos + len])))
        }
        b'*' => {
            if depth + 1 > MAX_NESTING_DEPTH {
                return Err(Incomplete::Malformed("reply nested too deep".into()));
            }
            let count = read_integer(cursor)?;
            if count < 0 {
                return Ok(Reply::Null);
            }
            let mut items = Vec::with_capacity((count as usize).min(64));
            for _ in 0..count {
                items.push(try_parse(cursor, depth + 1)?);
            }
            Ok(Reply::Array(items))
        }
        other => Err(Incomplete::Malformed(format!(
            "invalid reply prefix {:?}",
            other as char
        ))),
    }
}

fn read_byte(cursor: &mut Cursor<&[u8]>) -> std::result::Result<u8, Incomplete> {
    let pos = cursor.position() as usize;
    let buf = *cursor.get_ref();
    if pos >= buf.len() {
        return Err(Incomplete::Yes);
    }
    cursor.set_position((pos + 1) as u64);
    Ok(buf[pos])
}

/// Bytes up to the next `\r\n`; the cursor moves past it.
fn read_line<'a>(cursor: &mut Cursor<&'a [u8]>) -> std::result::Result<&'a [u8], Incomplete> {
    let buf: &'a [u8] = *cursor.get_ref();
    let start = cursor.position() as usize;
    if start >= buf.len() {
        return Err(Incomplete::Yes);
    }
    let end = buf[start..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| start + i)
        .ok_or(Incomplete::Yes)?;
    cursor.set_position((end + 2) as u64);
    Ok(&buf[start..end])
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> std::result::Result<String, Incomplete> {
    let line = read_line(cursor)?;
    String::from_utf8(line.to_vec())
        .map_err(|_| Incomplete::Malformed("invalid utf-8 in status line".into()))
}

fn read_integer(cursor: &mut Cursor<&[u8]>) -> std::result::Result<i64, Incomplete> {
    let line = read_line(cursor)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Incomplete::Malformed("invalid integer".into()))
}
