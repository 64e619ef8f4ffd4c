//! Structured HTTP request, parsed from the wire with [`httparse`] or assembled
//! by a transport that already decoded the message.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use super::{Cookie, Headers, Method};
use crate::session::SESSION_COOKIE_NAME;

/// Locale reported when the client sends no usable `Accept-Language`.
pub const DEFAULT_LOCALE: &str = "en";

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("request body exceeds maximum allowed size of {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },

    #[error("invalid {name} header")]
    InvalidHeader { name: &'static str },

    #[error("malformed chunked body")]
    InvalidChunk,
}

/// A parsed HTTP request as seen by filters and handlers.
///
/// Query parameters keep every value per key in arrival order, headers are
/// case-insensitive, and cookies are decoded from every `Cookie` header.
///
/// # Examples
///
/// ```
/// use bridgeway::http::Request;
///
/// let raw = b"GET /search?tag=a&tag=b HTTP/1.1\r\nHost: localhost\r\nCookie: sid=1\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.path(), "/search");
/// assert_eq!(request.parameter_values("tag"), Some(&["a".to_owned(), "b".to_owned()][..]));
/// assert_eq!(request.cookie("sid").map(|c| c.value()), Some("1"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    params: HashMap<String, Vec<String>>,
    cookies: Vec<Cookie>,
    body: Bytes,
    route_path: String,
    path_info: Option<String>,
    default_locale: String,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Builds a request from already-decoded parts. `uri` may carry a query string.
    pub fn new(method: Method, uri: &str) -> Self {
        let (path, query) = split_uri(uri);
        let params = query.as_deref().map(parse_query_string).unwrap_or_default();
        Self {
            method,
            path,
            version: 1,
            headers: Headers::new(),
            query,
            params,
            cookies: Vec::new(),
            body: Bytes::new(),
            route_path: String::new(),
            path_info: None,
            default_locale: DEFAULT_LOCALE.to_owned(),
        }
    }

    /// Appends a header, keeping the decoded cookie list in sync.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        if name.eq_ignore_ascii_case("cookie") {
            self.cookies.extend(Cookie::parse_header(&value));
        }
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the HTTP minor version (0 = HTTP/1.0, 1 = HTTP/1.1).
    #[must_use]
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the request and the offset at which its body begins in `buf`. The
    /// body holds at most `Content-Length` bytes of whatever follows the headers,
    /// so callers should wait for the full body before parsing a final time.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the header block is not complete yet.
    /// - [`RequestError::Parse`]: the data is malformed.
    /// - [`RequestError::MissingField`]: method, path, or version is absent.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method: Method = match raw_req.method {
            Some(m) => m.parse().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut request = Request::new(method, raw_path).with_version(version);
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                request = request.with_header(header.name, value);
            }
        }

        // Chunked bodies are framed separately with `decode_chunked`.
        if !request.is_chunked() {
            if request.headers.contains("content-length") && request.content_length().is_none() {
                return Err(RequestError::InvalidHeader {
                    name: "Content-Length",
                });
            }
            let available = &buf[body_offset..];
            let body_len = request.content_length().unwrap_or(0).min(available.len());
            request.body = Bytes::copy_from_slice(&available[..body_len]);
        }

        Ok((request, body_offset))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path plus `?query` as it arrived on the request line.
    pub fn uri(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// First value of a query parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params.get(name)?.first().map(String::as_str)
    }

    /// Every value of a query parameter in arrival order.
    pub fn parameter_values(&self, name: &str) -> Option<&[String]> {
        self.params.get(name).map(Vec::as_slice)
    }

    pub fn parameter_map(&self) -> &HashMap<String, Vec<String>> {
        &self.params
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    /// First cookie named `name`.
    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name() == name)
    }

    /// Every cookie named `name`; clients may send duplicates across paths.
    pub fn cookies_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Cookie> + 'a {
        self.cookies.iter().filter(move |c| c.name() == name)
    }

    /// Session identifier the client presented, whether or not it is still valid.
    pub fn requested_session_id(&self) -> Option<&str> {
        self.cookie(SESSION_COOKIE_NAME).map(Cookie::value)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Reader over the request body.
    pub fn body_reader(&self) -> bytes::buf::Reader<Bytes> {
        self.body.clone().reader()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    /// Charset named in `Content-Type`, e.g. `utf-8` from `text/plain; charset=utf-8`.
    pub fn character_encoding(&self) -> Option<&str> {
        self.content_type()?.split(';').skip(1).find_map(|param| {
            let (key, value) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches('"'))
        })
    }

    /// Value of the `Content-Length` header, if present and well formed.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get_parsed("content-length")
    }

    /// `true` when `chunked` is the final `Transfer-Encoding`, which then
    /// overrides any `Content-Length`.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .get_all("transfer-encoding")
            .flat_map(|value| value.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    /// `true` when the connection should stay open after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 needs an explicit
    /// `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1,
        }
    }

    /// `true` when the client sent `Expect: 100-continue` on HTTP/1.1.
    pub fn expects_continue(&self) -> bool {
        self.version >= 1
            && self
                .headers
                .get("expect")
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
    }

    /// Preferred locale: the highest-weighted `Accept-Language` entry, or the default.
    pub fn locale(&self) -> String {
        self.locales()
            .into_iter()
            .next()
            .unwrap_or_else(|| self.default_locale.clone())
    }

    /// `Accept-Language` entries ordered by q-weight (stable for ties).
    pub fn locales(&self) -> Vec<String> {
        let Some(header) = self.headers.get("accept-language") else {
            return Vec::new();
        };

        let mut weighted: Vec<(f32, String)> = header
            .split(',')
            .filter_map(|entry| {
                let mut parts = entry.split(';');
                let tag = parts.next()?.trim();
                if tag.is_empty() || tag == "*" {
                    return None;
                }
                let q = parts
                    .find_map(|p| p.trim().strip_prefix("q="))
                    .and_then(|q| q.parse::<f32>().ok())
                    .unwrap_or(1.0);
                (q > 0.0).then(|| (q, tag.to_owned()))
            })
            .collect();

        weighted.sort_by(|a, b| b.0.total_cmp(&a.0));
        weighted.into_iter().map(|(_, tag)| tag).collect()
    }

    /// Prefix of the path consumed by the matched handler pattern (`""` for `/*`).
    pub fn route_path(&self) -> &str {
        &self.route_path
    }

    /// Remainder of the path after [`route_path`](Self::route_path), if any.
    pub fn path_info(&self) -> Option<&str> {
        self.path_info.as_deref()
    }

    pub(crate) fn bind_route(&mut self, sanitized_pattern: &str) {
        let route_path = if self.path.starts_with(sanitized_pattern) {
            sanitized_pattern
        } else {
            ""
        };
        let rest = &self.path[route_path.len()..];
        self.route_path = route_path.to_owned();
        self.path_info = (!rest.is_empty()).then(|| rest.to_owned());
    }

    pub(crate) fn set_default_locale(&mut self, locale: &str) {
        self.default_locale = locale.to_owned();
    }
}

/// Decodes a `Transfer-Encoding: chunked` body from the start of `buf`.
///
/// Returns the reassembled body and the number of bytes consumed, including
/// the terminating zero-size chunk and any trailer lines (which are dropped).
///
/// # Errors
///
/// - [`RequestError::Incomplete`]: more bytes are needed.
/// - [`RequestError::BodyTooLarge`]: the decoded body would exceed `max_bytes`.
/// - [`RequestError::InvalidChunk`]: a size line or chunk delimiter is malformed.
pub fn decode_chunked(buf: &[u8], max_bytes: usize) -> Result<(Bytes, usize), RequestError> {
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let (consumed, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(pair)) => pair,
            Ok(httparse::Status::Partial) => return Err(RequestError::Incomplete),
            Err(httparse::InvalidChunkSize) => return Err(RequestError::InvalidChunk),
        };
        pos += consumed;

        if size == 0 {
            // Trailer section: header lines up to an empty line.
            loop {
                let line_len = buf[pos..]
                    .windows(2)
                    .position(|w| w == b"\r\n")
                    .ok_or(RequestError::Incomplete)?;
                pos += line_len + 2;
                if line_len == 0 {
                    return Ok((body.freeze(), pos));
                }
            }
        }

        let size = usize::try_from(size)
            .ok()
            .filter(|size| body.len().checked_add(*size).is_some_and(|total| total <= max_bytes))
            .ok_or(RequestError::BodyTooLarge { max_bytes })?;

        let data_end = pos + size;
        if buf.len() < data_end + 2 {
            return Err(RequestError::Incomplete);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(RequestError::InvalidChunk);
        }
        body.extend_from_slice(&buf[pos..data_end]);
        pos = data_end + 2;
    }
}

fn split_uri(uri: &str) -> (String, Option<String>) {
    match uri.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (uri.to_owned(), None),
    }
}

/// Parses `key=value&key=other` into ordered value lists per key.
///
/// `+` decodes to a space and `%XX` sequences are percent-decoded; sequences
/// that do not decode to UTF-8 are kept verbatim.
fn parse_query_string(query: &str) -> HashMap<String, Vec<String>> {
    let mut params: HashMap<String, Vec<String>> = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(decode_component(key))
            .or_default()
            .push(decode_component(value));
    }
    params
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}
