//! HTTP request model.
//!
//! The control server only needs a small slice of HTTP/1.1: the request
//! line, a header map and whatever body bytes arrived with the head. Body
//! streaming is left to the caller.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

/// Upper bound on the request head (request line + headers).
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Errors while parsing a request head.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// The head terminator has not been received yet.
    #[error("Request head incomplete")]
    Incomplete,

    #[error("Request head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,

    #[error("Malformed request: {0}")]
    Malformed(String),

    /// Attempted to move the parse state backwards.
    #[error("Request phase cannot go from {from:?} back to {to:?}")]
    PhaseRegression { from: RequestPhase, to: RequestPhase },
}

/// Request method, classified by the leading token of the first chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Options,
    Unsupported,
}

impl Method {
    pub fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "OPTIONS" => Method::Options,
            _ => Method::Unsupported,
        }
    }

    /// Classify raw bytes by their leading token.
    pub fn classify(chunk: &[u8]) -> Self {
        let end = chunk
            .iter()
            .position(|&b| b == b' ' || b == b'\r')
            .unwrap_or(chunk.len());
        std::str::from_utf8(&chunk[..end])
            .map(Method::from_token)
            .unwrap_or(Method::Unsupported)
    }
}

/// Parse progress of a request. Ordered; only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestPhase {
    AwaitingMethod,
    AwaitingBoundary,
    StreamingBody,
    Complete,
}

/// A parsed request head plus the body bytes received so far.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw request target, including any query string.
    pub target: String,
    /// Target without the query string.
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// Header names are lower-cased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    phase: RequestPhase,
}

impl Request {
    /// Parse a request head from the bytes received so far.
    ///
    /// Bytes after the blank line that ends the head become the initial
    /// body.
    pub fn parse(buf: &[u8]) -> Result<Self, RequestError> {
        let Some(head_end) = find_subsequence(buf, b"\r\n\r\n") else {
            return Err(if buf.len() > MAX_HEAD_LEN {
                RequestError::HeadTooLarge
            } else {
                RequestError::Incomplete
            });
        };
        let head = std::str::from_utf8(&buf[..head_end])
            .map_err(|_| RequestError::Malformed("head is not UTF-8".to_string()))?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Err(RequestError::Malformed(format!(
                "bad request line {:?}",
                request_line
            )));
        };

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (target, BTreeMap::new()),
        };

        Ok(Self {
            method: Method::from_token(method),
            target: target.to_string(),
            path: path.to_string(),
            query,
            headers,
            body: buf[head_end + 4..].to_vec(),
            phase: RequestPhase::AwaitingMethod,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.parse().ok()
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Move to a later phase. Staying in the same phase is allowed.
    pub fn advance(&mut self, next: RequestPhase) -> Result<(), RequestError> {
        if next < self.phase {
            return Err(RequestError::PhaseRegression {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }
}

/// Parse `a=1&b=two` into a map. Pairs without `=` are ignored.
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (percent_decode(key), percent_decode(value)))
        .collect()
}

/// Decode `%XX` escapes and `+`. Invalid escapes are kept literally.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Find the first occurrence of `needle` in `haystack`.
pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
