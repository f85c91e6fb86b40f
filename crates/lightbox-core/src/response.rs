//! HTTP response head construction.

use std::fmt::Write as _;

/// Status codes the control plane answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    UnprocessableEntity,
    InternalServerError,
    InsufficientStorage,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::UnprocessableEntity => 422,
            StatusCode::InternalServerError => 500,
            StatusCode::InsufficientStorage => 507,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::UnprocessableEntity => "Unprocessable Entity",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::InsufficientStorage => "Insufficient Storage",
        }
    }
}

/// HTTP Content Encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
        }
    }
}

/// Cross-origin headers attached to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cors {
    None,
    AllowOrigin,
    Preflight,
}

/// Builder for a response head.
#[derive(Debug, Clone)]
pub struct ResponseHeaders {
    status: StatusCode,
    content_type: Option<String>,
    content_encoding: Option<ContentEncoding>,
    content_length: Option<usize>,
    cors: Cors,
}

impl ResponseHeaders {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            content_type: None,
            content_encoding: None,
            content_length: None,
            cors: Cors::None,
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok)
    }

    /// CORS preflight answer: allows the browser UI to POST from any origin.
    pub fn preflight(status: StatusCode) -> Self {
        Self {
            cors: Cors::Preflight,
            ..Self::new(status)
        }
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_content_encoding(mut self, encoding: ContentEncoding) -> Self {
        self.content_encoding = Some(encoding);
        self
    }

    #[must_use]
    pub fn with_content_length(mut self, length: usize) -> Self {
        self.content_length = Some(length);
        self
    }

    /// Add `Access-Control-Allow-Origin: *`.
    #[must_use]
    pub fn with_cors(mut self) -> Self {
        if self.cors == Cors::None {
            self.cors = Cors::AllowOrigin;
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Render the head, terminated by the blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = String::with_capacity(160);
        // Writing into a String cannot fail.
        let _ = write!(head, "HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason());
        if let Some(content_type) = &self.content_type {
            let _ = write!(head, "Content-Type: {}\r\n", content_type);
        }
        if let Some(encoding) = self.content_encoding {
            let _ = write!(head, "Content-Encoding: {}\r\n", encoding.as_str());
        }
        if let Some(length) = self.content_length {
            let _ = write!(head, "Content-Length: {}\r\n", length);
        }
        match self.cors {
            Cors::None => {}
            Cors::AllowOrigin => head.push_str("Access-Control-Allow-Origin: *\r\n"),
            Cors::Preflight => head.push_str(
                "Access-Control-Allow-Origin: *\r\n\
                 Access-Control-Allow-Methods: POST, OPTIONS\r\n\
                 Access-Control-Allow-Headers: Content-Type\r\n",
            ),
        }
        head.push_str("Connection: close\r\n\r\n");
        head.into_bytes()
    }
}

/// Head plus a small in-memory body.
pub fn full_response(headers: ResponseHeaders, body: &[u8]) -> Vec<u8> {
    let mut out = headers.with_content_length(body.len()).to_bytes();
    out.extend_from_slice(body);
    out
}

/// Plain-text response for status-only answers.
pub fn status_response(status: StatusCode) -> Vec<u8> {
    let body = format!("{} {}", status.code(), status.reason());
    full_response(
        ResponseHeaders::new(status)
            .with_content_type("text/plain")
            .with_cors(),
        body.as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preflight_headers() {
        let head = String::from_utf8(ResponseHeaders::preflight(StatusCode::Ok).to_bytes()).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Access-Control-Allow-Methods: POST, OPTIONS\r\n"));
        assert!(head.contains("Access-Control-Allow-Headers: Content-Type\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_content_headers() {
        let head = ResponseHeaders::ok()
            .with_content_type("text/html")
            .with_content_encoding(ContentEncoding::Gzip)
            .with_content_length(42)
            .with_cors()
            .to_bytes();
        let head = String::from_utf8(head).unwrap();
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.contains("Content-Encoding: gzip\r\n"));
        assert!(head.contains("Content-Length: 42\r\n"));
        assert!(head.contains("Access-Control-Allow-Origin: *\r\n"));
    }

    #[test]
    fn test_status_response() {
        let raw = status_response(StatusCode::InsufficientStorage);
        let text = String::from_utf8(raw).unwrap();
        assert!(text.starts_with("HTTP/1.1 507 Insufficient Storage\r\n"));
        assert!(text.ends_with("507 Insufficient Storage"));
    }
}
