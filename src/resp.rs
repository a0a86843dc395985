//! The wire-surface types named in spec §3/§6.
//!
//! Encoding/decoding of *individual frames* is nominally an external
//! collaborator (spec §1); since no such collaborator is threaded through
//! the public API (§6 only names `open_socket` and `refresh_shard_map`),
//! this module carries a minimal, direct RESP2 codec so the crate is
//! self-contained. It is intentionally unoptimized and untuned for
//! exhaustive wire-format coverage — that depth of testing belongs to the
//! real frame parser this crate assumes exists upstream.

use crate::error::{ClusterError, ErrorKind};

/// A request: an array of bulk-string argument tokens, e.g. `["GET", "x"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request(pub Vec<Vec<u8>>);

impl Request {
    pub fn new(tokens: Vec<Vec<u8>>) -> Self {
        Request(tokens)
    }

    /// Convenience constructor from string-like arguments.
    pub fn from_strs<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Request(tokens.into_iter().map(|s| s.as_ref().as_bytes().to_vec()).collect())
    }

    pub fn arg(&self, i: usize) -> Option<&[u8]> {
        self.0.get(i).map(|v| v.as_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercased command name (first token), used throughout routing and
    /// cleaning as the case-insensitive lookup key.
    pub fn name_lowercase(&self) -> Option<String> {
        self.0.first().map(|t| String::from_utf8_lossy(t).to_ascii_lowercase())
    }
}

/// The tagged sum named in spec §6's wire surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    SimpleString(String),
    Error(Vec<u8>),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Vec<Reply>),
}

impl Reply {
    /// First whitespace-delimited token of an `Error` payload — the tight,
    /// non-regex parser spec §9 asks for when classifying redirection
    /// errors by leading token.
    pub fn error_token(&self) -> Option<&[u8]> {
        match self {
            Reply::Error(payload) => payload.split(|&b| b == b' ').find(|t| !t.is_empty()),
            _ => None,
        }
    }
}

pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(format!("*{}\r\n", request.0.len()).as_bytes());
    for token in &request.0 {
        buf.extend_from_slice(format!("${}\r\n", token.len()).as_bytes());
        buf.extend_from_slice(token);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Decodes a single reply frame from the front of `buf`. Returns `Ok(None)`
/// when `buf` doesn't yet hold a complete frame (the caller should read
/// more and retry, per spec §4.6's carry-over buffer).
pub fn decode_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, ClusterError> {
    decode_at(buf, 0)
}

fn decode_at(buf: &[u8], pos: usize) -> Result<Option<(Reply, usize)>, ClusterError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    let sigil = buf[pos];
    let line_end = match find_crlf(buf, pos + 1) {
        Some(e) => e,
        None => return Ok(None),
    };
    let line = &buf[pos + 1..line_end];
    let after_line = line_end + 2;

    match sigil {
        b'+' => Ok(Some((
            Reply::SimpleString(String::from_utf8_lossy(line).into_owned()),
            after_line,
        ))),
        b'-' => Ok(Some((Reply::Error(line.to_vec()), after_line))),
        b':' => Ok(Some((Reply::Integer(parse_int(line)?), after_line))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                Ok(Some((Reply::Bulk(None), after_line)))
            } else {
                let len = len as usize;
                if buf.len() < after_line + len + 2 {
                    return Ok(None);
                }
                let data = buf[after_line..after_line + len].to_vec();
                Ok(Some((Reply::Bulk(Some(data)), after_line + len + 2)))
            }
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Reply::Array(Vec::new()), after_line)));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut cursor = after_line;
            for _ in 0..count {
                match decode_at(buf, cursor)? {
                    Some((reply, next)) => {
                        items.push(reply);
                        cursor = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(items), cursor)))
        }
        _ => Err(ClusterError::from((
            ErrorKind::ConnectionClosed,
            "malformed frame: unrecognized type sigil",
        ))),
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from > buf.len() {
        return None;
    }
    buf[from..].windows(2).position(|w| w == b"\r\n").map(|p| p + from)
}

fn parse_int(bytes: &[u8]) -> Result<i64, ClusterError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ClusterError::from((ErrorKind::ConnectionClosed, "malformed frame: bad integer")))
}
