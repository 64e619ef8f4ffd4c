//! Cookie decoding for `Cookie` request headers and encoding for `Set-Cookie`.

use std::fmt;

/// A single HTTP cookie with its optional attributes.
///
/// Request cookies usually carry only a name and value; RFC 2965 style
/// `$Path` / `$Domain` / `$Version` attributes following a pair are attached to
/// the preceding cookie.
///
/// # Examples
///
/// ```
/// use bridgeway::http::Cookie;
///
/// let cookie = Cookie::new("SESSIONID", "abc").path("/").http_only(true);
/// assert_eq!(cookie.to_string(), "SESSIONID=abc; Path=/; HttpOnly");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cookie {
    name: String,
    value: String,
    path: Option<String>,
    domain: Option<String>,
    max_age: Option<i64>,
    version: Option<u8>,
    secure: bool,
    http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Sets `Max-Age` in seconds. Negative values are not written (session cookie).
    #[must_use]
    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn path_attr(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn domain_attr(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn max_age_attr(&self) -> Option<i64> {
        self.max_age
    }

    pub fn version(&self) -> Option<u8> {
        self.version
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn is_http_only(&self) -> bool {
        self.http_only
    }

    /// Decodes one `Cookie` request header value (`a=1; b="2"; $Path=/`).
    ///
    /// Malformed pairs (no `=`, empty name) are skipped rather than failing the
    /// whole header.
    pub fn parse_header(header: &str) -> Vec<Cookie> {
        let mut cookies: Vec<Cookie> = Vec::new();
        let mut version = None;

        for pair in header.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim();
            let value = unquote(value.trim());
            if name.is_empty() {
                continue;
            }

            if let Some(attr) = name.strip_prefix('$') {
                match (attr.to_ascii_lowercase().as_str(), cookies.last_mut()) {
                    ("version", _) => version = value.parse().ok(),
                    ("path", Some(last)) => last.path = Some(value.to_owned()),
                    ("domain", Some(last)) => last.domain = Some(value.to_owned()),
                    _ => {}
                }
                continue;
            }

            let mut cookie = Cookie::new(name, value);
            cookie.version = version;
            cookies.push(cookie);
        }

        cookies
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// `Set-Cookie` wire form.
impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(max_age) = self.max_age.filter(|age| *age >= 0) {
            write!(f, "; Max-Age={max_age}")?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={domain}")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        Ok(())
    }
}
