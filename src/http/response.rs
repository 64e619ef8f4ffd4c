//! HTTP/1.1 response: a growable output buffer that filters and handlers write
//! into, plus the wire serialization the transport sends.

use std::fmt::Write as _;
use std::io;

use bytes::{BufMut, BytesMut};
use thiserror::Error;

use super::{Cookie, Headers, StatusCode};

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response already committed")]
    Committed,
}

/// Response payload.
#[derive(Debug)]
pub enum Body {
    /// In-memory bytes written by filters and handlers.
    Buffer(BytesMut),
    /// A file streamed by the transport after the header block.
    File { file: tokio::fs::File, len: u64 },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Buffer(buf) => buf.len() as u64,
            Body::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An HTTP/1.1 response.
///
/// Built either fluently (`Response::new(..).header(..).body(..)`) or mutated in
/// place by request code through [`write`](Self::write),
/// [`set_header`](Self::set_header) and friends.
///
/// # Examples
///
/// ```
/// use bridgeway::http::{Response, StatusCode};
///
/// let mut response = Response::new(StatusCode::Ok);
/// response.set_content_type("application/json");
/// response.write_str(r#"{"status":"ok"}"#);
/// response.flush();
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    buffer: BytesMut,
    // Set only by `Response::file`; any write switches back to the buffer.
    file: Option<(tokio::fs::File, u64)>,
    keep_alive: bool,
    committed: bool,
}

impl Response {
    /// Creates a response with the given status and an empty buffer.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            buffer: BytesMut::new(),
            file: None,
            keep_alive: true,
            committed: false,
        }
    }

    /// Plain-text failure response in the shape every error path uses.
    pub fn error(status: StatusCode) -> Self {
        let mut response = Self::new(status);
        response.send_error(status, None);
        response
    }

    /// A response whose body is streamed from `file` by the transport.
    pub fn file(file: tokio::fs::File, len: u64, content_type: &str) -> Self {
        let mut response = Self::new(StatusCode::Ok);
        response.set_content_type(content_type);
        response.file = Some((file, len));
        response
    }

    /// Appends a header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replaces the body with a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.file = None;
        self.buffer = BytesMut::from(body.into().as_bytes());
        self
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.append(name, value);
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.headers.set("Content-Type", content_type);
    }

    pub fn add_cookie(&mut self, cookie: &Cookie) {
        self.headers.append("Set-Cookie", cookie.to_string());
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Appends bytes to the output buffer. A file body is discarded first.
    pub fn write(&mut self, bytes: &[u8]) {
        self.buffer_mut().put_slice(bytes);
    }

    pub fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    /// Bytes written so far; empty for file bodies.
    pub fn buffer(&self) -> &[u8] {
        if self.file.is_some() {
            &[]
        } else {
            &self.buffer
        }
    }

    pub fn body_len(&self) -> u64 {
        match &self.file {
            Some((_, len)) => *len,
            None => self.buffer.len() as u64,
        }
    }

    fn buffer_mut(&mut self) -> &mut BytesMut {
        self.file = None;
        &mut self.buffer
    }

    /// Replaces status and body with a plain-text failure page.
    ///
    /// `message`, when given, becomes the body with CR, LF and other control
    /// characters replaced by spaces.
    pub fn send_error(&mut self, status: StatusCode, message: Option<&str>) {
        self.status = status;
        let text = match message {
            Some(msg) => sanitize_message(msg),
            None => format!("Failure: {status}"),
        };
        let buf = self.buffer_mut();
        buf.clear();
        buf.put_slice(text.as_bytes());
        buf.put_slice(b"\r\n");
        self.headers.set("Content-Type", "text/plain; charset=utf-8");
        self.headers.set("Cache-Control", "no-cache");
        self.headers.set("Pragma", "no-cache");
    }

    /// `302 Found` with a `Location` header.
    pub fn send_redirect(&mut self, location: &str) {
        self.status = StatusCode::Found;
        self.headers.set("Location", location);
    }

    /// Clears status, headers and buffer.
    ///
    /// # Errors
    ///
    /// [`ResponseError::Committed`] once [`flush`](Self::flush) has run.
    pub fn reset(&mut self) -> Result<(), ResponseError> {
        if self.committed {
            return Err(ResponseError::Committed);
        }
        self.status = StatusCode::Ok;
        self.headers.clear();
        self.file = None;
        self.buffer.clear();
        Ok(())
    }

    /// Clears the buffer only.
    ///
    /// # Errors
    ///
    /// [`ResponseError::Committed`] once [`flush`](Self::flush) has run.
    pub fn reset_buffer(&mut self) -> Result<(), ResponseError> {
        if self.committed {
            return Err(ResponseError::Committed);
        }
        self.buffer_mut().clear();
        Ok(())
    }

    /// Finalizes `Content-Length` from the current body and marks the response committed.
    pub fn flush(&mut self) {
        let len = self.body_len();
        self.headers.set("Content-Length", len.to_string());
        self.committed = true;
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Serializes the status line and headers.
    ///
    /// Adds `Content-Type: text/plain; charset=utf-8` for a non-empty body without
    /// one, `Content-Length` matching the body, and
    /// `Connection: keep-alive` or `Connection: close`.
    pub fn into_parts(mut self) -> (BytesMut, Body) {
        let content_length = self.body_len();

        if content_length > 0 && !self.headers.contains("content-type") {
            self.headers
                .set("Content-Type", "text/plain; charset=utf-8");
        }
        self.headers
            .set("Content-Length", content_length.to_string());
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let mut head = String::with_capacity(128 + self.headers.len() * 64);
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\n{}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason(),
            self.headers
        );

        let body = match self.file {
            Some((file, len)) => Body::File { file, len },
            None => Body::Buffer(self.buffer),
        };
        (BytesMut::from(head.as_bytes()), body)
    }

    /// Serializes a buffered response in full. File bodies contribute only their head.
    pub fn into_bytes(self) -> BytesMut {
        let (mut head, body) = self.into_parts();
        if let Body::Buffer(buf) = body {
            head.put(buf);
        }
        head
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

impl io::Write for Response {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Response::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Response::flush(self);
        Ok(())
    }
}

/// Replaces control characters so a message is safe in a single text line.
pub fn sanitize_message(message: &str) -> String {
    message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}
