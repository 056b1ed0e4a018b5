//! # RESP Wire Codec
//!
//! Purpose: the one RESP2 encoder/decoder shared by the server's client
//! connections and the AOF writer/replayer — both read and write the same
//! "array of bulk strings" command framing, so it lives here instead of
//! being duplicated in each crate.
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: `RespParser::parse` consumes only as much of
//!    the buffer as one complete command needs and returns `Ok(None)` on a
//!    partial frame, so callers can feed it directly from a growing socket
//!    buffer without pre-framing.

use crate::reply::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespError {
    /// Malformed framing (bad type byte, negative bulk length, non-numeric
    /// length field, ...).
    Protocol,
}

/// Encodes a command as a RESP multi-bulk array of bulk strings — the
/// format both client input and AOF records use on the wire.
pub fn encode_command(args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Encodes a command reply in RESP2.
pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    let mut out = Vec::new();
    write_reply(&mut out, reply);
    out
}

fn write_reply(out: &mut Vec<u8>, reply: &Reply) {
    match reply {
        Reply::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Error(message) => {
            out.push(b'-');
            if message.split(' ').next().map(|w| w.chars().all(|c| c.is_ascii_uppercase())).unwrap_or(false) {
                out.extend_from_slice(message.as_bytes());
            } else {
                out.extend_from_slice(b"ERR ");
                out.extend_from_slice(message.as_bytes());
            }
            out.extend_from_slice(b"\r\n");
        }
        Reply::Integer(value) => {
            out.push(b':');
            out.extend_from_slice(value.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Double(value) => {
            let rendered = value.to_string();
            out.push(b'$');
            out.extend_from_slice(rendered.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(rendered.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Bulk(None) => out.extend_from_slice(b"$-1\r\n"),
        Reply::Bulk(Some(bytes)) => {
            out.push(b'$');
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(bytes);
            out.extend_from_slice(b"\r\n");
        }
        Reply::NullArray => out.extend_from_slice(b"*-1\r\n"),
        Reply::Array(items) => {
            out.push(b'*');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            for item in items {
                write_reply(out, item);
            }
        }
        Reply::Multi(items) => {
            for item in items {
                write_reply(out, item);
            }
        }
    }
}

/// Encodes the Redis 3-element pub/sub push envelope: `message`, channel, payload.
pub fn encode_pubsub_message(channel: &str, payload: &[u8]) -> Vec<u8> {
    let envelope = Reply::Array(vec![Reply::bulk(b"message".to_vec()), Reply::bulk(channel.as_bytes().to_vec()), Reply::bulk(payload.to_vec())]);
    encode_reply(&envelope)
}

/// Incremental RESP2 multi-bulk parser; holds no buffer of its own, it
/// reads directly from whatever byte slice the caller passes in.
#[derive(Default)]
pub struct RespParser;

impl RespParser {
    pub fn new() -> Self {
        RespParser
    }

    /// Attempts to parse one complete command from the front of `buf`.
    /// On success, drains the consumed bytes from `buf` and returns the
    /// command's argument vector. `Ok(None)` means the buffer holds only a
    /// partial frame; try again once more bytes arrive.
    pub fn parse(&mut self, buf: &mut Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, RespError> {
        match parse_command(buf) {
            Ok(Some((args, consumed))) => {
                buf.drain(..consumed);
                Ok(Some(args))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Parses one reply value (any of the six wire shapes) from the front of
/// `buf`, draining the consumed bytes on success. Used by the cluster
/// transport, which talks to a peer's ordinary client-command port and so
/// has to decode whatever reply shape comes back, not just command frames.
pub fn parse_reply(buf: &mut Vec<u8>) -> Result<Option<Reply>, RespError> {
    match parse_reply_value(buf, 0) {
        Ok(Some((reply, consumed))) => {
            buf.drain(..consumed);
            Ok(Some(reply))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(e),
    }
}

fn parse_reply_value(buf: &[u8], start: usize) -> Result<Option<(Reply, usize)>, RespError> {
    if start >= buf.len() {
        return Ok(None);
    }
    match buf[start] {
        b'+' => {
            let Some(end) = find_crlf(buf, start + 1) else { return Ok(None) };
            let text = String::from_utf8_lossy(&buf[start + 1..end]).into_owned();
            Ok(Some((Reply::Simple(text), end + 2)))
        }
        b'-' => {
            let Some(end) = find_crlf(buf, start + 1) else { return Ok(None) };
            let text = String::from_utf8_lossy(&buf[start + 1..end]).into_owned();
            Ok(Some((Reply::Error(text), end + 2)))
        }
        b':' => match parse_line_i64(buf, start + 1)? {
            Some((value, consumed)) => Ok(Some((Reply::Integer(value), consumed))),
            None => Ok(None),
        },
        b'$' => {
            let Some((len, after_len)) = parse_line_i64(buf, start + 1)? else { return Ok(None) };
            if len < 0 {
                return Ok(Some((Reply::Bulk(None), after_len)));
            }
            let len = len as usize;
            let data_end = after_len + len;
            if data_end + 2 > buf.len() {
                return Ok(None);
            }
            if &buf[data_end..data_end + 2] != b"\r\n" {
                return Err(RespError::Protocol);
            }
            Ok(Some((Reply::Bulk(Some(buf[after_len..data_end].to_vec())), data_end + 2)))
        }
        b'*' => {
            let Some((count, mut pos)) = parse_line_i64(buf, start + 1)? else { return Ok(None) };
            if count < 0 {
                return Ok(Some((Reply::NullArray, pos)));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match parse_reply_value(buf, pos)? {
                    Some((item, consumed)) => {
                        items.push(item);
                        pos = consumed;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(items), pos)))
        }
        _ => Err(RespError::Protocol),
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].windows(2).position(|w| w == b"\r\n").map(|p| from + p)
}

fn parse_line_i64(buf: &[u8], start: usize) -> Result<Option<(i64, usize)>, RespError> {
    let Some(end) = find_crlf(buf, start) else { return Ok(None) };
    let text = std::str::from_utf8(&buf[start..end]).map_err(|_| RespError::Protocol)?;
    let value = text.parse::<i64>().map_err(|_| RespError::Protocol)?;
    Ok(Some((value, end + 2)))
}

/// Parses one multi-bulk array of bulk strings starting at `buf[0]`,
/// returning `(args, total_bytes_consumed)`.
fn parse_command(buf: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>, RespError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'*' {
        return Err(RespError::Protocol);
    }
    let Some((count, mut pos)) = parse_line_i64(buf, 1)? else { return Ok(None) };
    if count < 0 {
        return Ok(Some((Vec::new(), pos)));
    }
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= buf.len() || buf[pos] != b'$' {
            if pos >= buf.len() {
                return Ok(None);
            }
            return Err(RespError::Protocol);
        }
        let Some((len, after_len)) = parse_line_i64(buf, pos + 1)? else { return Ok(None) };
        if len < 0 {
            return Err(RespError::Protocol);
        }
        let len = len as usize;
        let data_end = after_len + len;
        if data_end + 2 > buf.len() {
            return Ok(None);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(RespError::Protocol);
        }
        args.push(buf[after_len..data_end].to_vec());
        pos = data_end + 2;
    }
    Ok(Some((args, pos)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_command_and_drains_it() {
        let mut buf = b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n".to_vec();
        let mut parser = RespParser::new();
        let parsed = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(parsed, vec![b"GET".to_vec(), b"k".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_returns_none_without_consuming() {
        let mut buf = b"*2\r\n$3\r\nGET\r\n$1\r\n".to_vec();
        let mut parser = RespParser::new();
        let original_len = buf.len();
        assert_eq!(parser.parse(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), original_len);
    }

    #[test]
    fn two_commands_back_to_back_parse_one_at_a_time() {
        let mut buf = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n".to_vec();
        let mut parser = RespParser::new();
        assert!(parser.parse(&mut buf).unwrap().is_some());
        assert!(parser.parse(&mut buf).unwrap().is_some());
        assert!(parser.parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_non_array_type_byte() {
        let mut buf = b"+PING\r\n".to_vec();
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf), Err(RespError::Protocol));
    }

    #[test]
    fn round_trips_command_encoding() {
        let args = vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()];
        let encoded = encode_command(&args);
        let mut buf = encoded.clone();
        let mut parser = RespParser::new();
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap(), args);
    }

    #[test]
    fn parse_reply_round_trips_every_variant() {
        let replies = vec![
            Reply::Simple("OK".to_string()),
            Reply::Error("ERR bad".to_string()),
            Reply::Integer(-7),
            Reply::Bulk(Some(b"hi".to_vec())),
            Reply::Bulk(None),
            Reply::NullArray,
            Reply::Array(vec![Reply::Integer(1), Reply::bulk(b"x".to_vec())]),
        ];
        for reply in replies {
            let mut buf = encode_reply(&reply);
            assert_eq!(parse_reply(&mut buf).unwrap(), Some(reply));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn parse_reply_on_partial_buffer_returns_none() {
        let mut buf = b"$5\r\nhel".to_vec();
        assert_eq!(parse_reply(&mut buf).unwrap(), None);
    }
}
