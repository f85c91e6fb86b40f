//! Streaming `multipart/form-data` parser.
//!
//! The parser is fed the request body in arbitrary chunks and emits events
//! as soon as bytes are known to belong to the file. It never needs the
//! whole body in memory: while in the body it only holds back as many
//! bytes as the closing delimiter is long, so a delimiter split across two
//! reads is still recognised.
//!
//! ```text
//! --<boundary>\r\n
//! Content-Disposition: form-data; name="file"; filename="cat.ppm"\r\n
//! Content-Type: image/x-portable-pixmap\r\n
//! \r\n
//! <file bytes>
//! \r\n--<boundary>--\r\n
//! ```
//!
//! Only the first part is extracted; anything after its closing delimiter
//! is discarded.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::request::find_subsequence;

/// Upper bound on one part's header block.
pub const MAX_PART_HEADER_LEN: usize = 8 * 1024;

/// Errors raised while parsing a multipart body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultipartError {
    #[error("No multipart boundary found")]
    MissingBoundary,

    #[error("Part headers exceed {MAX_PART_HEADER_LEN} bytes")]
    HeadersTooLarge,

    #[error("Part headers are not valid UTF-8")]
    InvalidHeaders,
}

/// Observable parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitingBoundary,
    InHeaders,
    InBody,
    Done,
}

/// Output of [`MultipartParser::feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartEvent {
    /// Part headers parsed. `filename` is `None` for plain form fields.
    PartStart { filename: Option<String> },
    /// File bytes, in order.
    Data(Vec<u8>),
    /// Closing delimiter of the part seen.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    DelimiterTail,
    Headers,
    Body,
    Done,
}

/// Incremental parser for a single-file multipart body.
#[derive(Debug)]
pub struct MultipartParser {
    boundary: String,
    /// `--<boundary>`
    delimiter: Vec<u8>,
    /// `\r\n--<boundary>`
    body_delimiter: Vec<u8>,
    state: State,
    buf: Vec<u8>,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let delimiter = format!("--{}", boundary).into_bytes();
        let mut body_delimiter = b"\r\n".to_vec();
        body_delimiter.extend_from_slice(&delimiter);
        Self {
            boundary: boundary.to_string(),
            delimiter,
            body_delimiter,
            state: State::Preamble,
            buf: Vec::new(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn state(&self) -> ParseState {
        match self.state {
            State::Preamble | State::DelimiterTail => ParseState::AwaitingBoundary,
            State::Headers => ParseState::InHeaders,
            State::Body => ParseState::InBody,
            State::Done => ParseState::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feed the next chunk of the body.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<MultipartEvent>, MultipartError> {
        let mut events = Vec::new();
        if self.state == State::Done {
            return Ok(events);
        }
        self.buf.extend_from_slice(chunk);

        loop {
            match self.state {
                State::Preamble => match find_subsequence(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        self.buf.drain(..pos + self.delimiter.len());
                        self.state = State::DelimiterTail;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            self.buf.drain(..self.buf.len() - keep);
                        }
                        break;
                    }
                },
                State::DelimiterTail => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    if self.buf.starts_with(b"--") {
                        // Close delimiter before any part: empty form.
                        self.finish(&mut events);
                        break;
                    }
                    if self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                        self.state = State::Headers;
                    } else {
                        // `--<boundary>` was a prefix of something else.
                        self.state = State::Preamble;
                    }
                }
                State::Headers => {
                    let header_end = if self.buf.starts_with(b"\r\n") {
                        Some((0, 2))
                    } else {
                        find_subsequence(&self.buf, b"\r\n\r\n").map(|pos| (pos, pos + 4))
                    };
                    let Some((end, skip)) = header_end else {
                        if self.buf.len() > MAX_PART_HEADER_LEN {
                            return Err(MultipartError::HeadersTooLarge);
                        }
                        break;
                    };
                    let headers = std::str::from_utf8(&self.buf[..end])
                        .map_err(|_| MultipartError::InvalidHeaders)?;
                    let filename = extract_filename(headers);
                    self.buf.drain(..skip);
                    self.state = State::Body;
                    events.push(MultipartEvent::PartStart { filename });
                }
                State::Body => match find_subsequence(&self.buf, &self.body_delimiter) {
                    Some(pos) => {
                        if pos > 0 {
                            events.push(MultipartEvent::Data(self.buf[..pos].to_vec()));
                        }
                        self.finish(&mut events);
                        break;
                    }
                    None => {
                        let keep = self.body_delimiter.len() - 1;
                        if self.buf.len() > keep {
                            let safe = self.buf.len() - keep;
                            events.push(MultipartEvent::Data(self.buf.drain(..safe).collect()));
                        }
                        break;
                    }
                },
                State::Done => break,
            }
        }

        Ok(events)
    }

    fn finish(&mut self, events: &mut Vec<MultipartEvent>) {
        self.buf.clear();
        self.state = State::Done;
        events.push(MultipartEvent::Finished);
    }
}

fn boundary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bboundary=(?:"([^"]+)"|([^;,\s]+))"#).expect("valid boundary regex")
    })
}

fn filename_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bfilename=(?:"([^"]*)"|([^;\r\n\s]+))"#).expect("valid filename regex")
    })
}

/// Boundary from a `Content-Type: multipart/form-data; boundary=...` value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let captures = boundary_regex().captures(content_type)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string())
        .filter(|b| !b.is_empty())
}

/// Recover the boundary from the first delimiter line of a body whose
/// boundary starts with `prefix`.
pub fn boundary_from_body(body: &[u8], prefix: &str) -> Option<String> {
    let marker = format!("--{}", prefix);
    let start = find_subsequence(body, marker.as_bytes())? + 2;
    let line_len = find_subsequence(&body[start..], b"\r\n")?;
    let boundary = std::str::from_utf8(&body[start..start + line_len]).ok()?;
    let boundary = boundary.trim_end();
    (!boundary.is_empty()).then(|| boundary.to_string())
}

/// `filename` parameter of a part's `Content-Disposition` header.
pub fn extract_filename(headers: &str) -> Option<String> {
    let captures = filename_regex().captures(headers)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().to_string())
        .filter(|name| !name.is_empty())
}
