//! URL pattern compilation and matching.
//!
//! A pattern is a path with `*` wildcards, each matching any run of characters
//! (including `/`). Matching is all-or-nothing against a normalized path:
//!
//! 1. anything from `?` onwards is dropped,
//! 2. a trailing `/` is appended when missing,
//! 3. the whole compiled pattern must match the whole result.
//!
//! Patterns are normalized the same way at compile time (a trailing `/` is added
//! unless the pattern already ends in `/` or `*`), so `/status` matches `/status`
//! and `/status/` but not `/status/deep`.
//!
//! | Pattern    | Matches                         | Sanitized |
//! |------------|---------------------------------|-----------|
//! | `/*`       | everything                      | `""`      |
//! | `/api/*`   | `/api`, `/api/`, `/api/users/7` | `/api`    |
//! | `*.txt`    | `/notes.txt`, `/a/b.txt`        | `""`      |
//! | `/status`  | `/status`, `/status/`           | `/status` |

use thiserror::Error;

/// Pattern used when a component is registered without any.
pub const DEFAULT_URL_PATTERN: &str = "/*";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("URL pattern must not be empty")]
    Empty,

    #[error("URL pattern '{pattern}' must start with '/' or '*'")]
    BadStart { pattern: String },

    #[error("URL pattern '{pattern}' contains whitespace or control characters")]
    IllegalCharacter { pattern: String },
}

/// One compiled URL pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    raw: String,
    // Literal pieces between wildcards; `n` wildcards give `n + 1` pieces.
    pieces: Vec<String>,
    sanitized: String,
}

impl UrlPattern {
    /// Compiles `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`PatternError`] when the pattern is empty, does not start with
    /// `/` or `*`, or contains whitespace or control characters.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }
        if !pattern.starts_with('/') && !pattern.starts_with('*') {
            return Err(PatternError::BadStart {
                pattern: pattern.to_owned(),
            });
        }
        if pattern.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(PatternError::IllegalCharacter {
                pattern: pattern.to_owned(),
            });
        }

        let mut normalized = pattern.to_owned();
        if !normalized.ends_with('/') && !normalized.ends_with('*') {
            normalized.push('/');
        }
        let pieces = normalized.split('*').map(str::to_owned).collect();

        let prefix = pattern.split('*').next().unwrap_or_default();
        let sanitized = prefix.strip_suffix('/').unwrap_or(prefix).to_owned();

        Ok(Self {
            raw: pattern.to_owned(),
            pieces,
            sanitized,
        })
    }

    /// The pattern as registered.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Literal text before the first wildcard, trailing `/` stripped.
    pub fn sanitized(&self) -> &str {
        &self.sanitized
    }

    /// Tests an already-normalized path.
    fn matches_normalized(&self, path: &str) -> bool {
        let (first, rest) = match self.pieces.split_first() {
            Some(split) => split,
            None => return false,
        };
        let Some((last, middle)) = rest.split_last() else {
            return path == first;
        };

        let Some(mut remaining) = path.strip_prefix(first.as_str()) else {
            return false;
        };
        for piece in middle {
            match remaining.find(piece.as_str()) {
                Some(at) => remaining = &remaining[at + piece.len()..],
                None => return false,
            }
        }
        remaining.ends_with(last.as_str())
    }

    /// `true` when this pattern matches `uri` (query string allowed).
    pub fn matches(&self, uri: &str) -> bool {
        self.matches_normalized(&normalize(uri))
    }
}

/// Strips the query string and guarantees a trailing `/`.
pub fn normalize(uri: &str) -> String {
    let path = uri.split_once('?').map_or(uri, |(path, _)| path);
    let mut normalized = String::with_capacity(path.len() + 1);
    normalized.push_str(path);
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    normalized
}

/// The ordered set of patterns one component is registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlMatcher {
    patterns: Vec<UrlPattern>,
}

impl UrlMatcher {
    /// Compiles every pattern; an empty list yields the catch-all `/*`.
    ///
    /// # Errors
    ///
    /// The first [`PatternError`] encountered.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }
        let patterns = patterns
            .iter()
            .map(|p| UrlPattern::compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, uri: &str) -> bool {
        self.matching_pattern(uri).is_some()
    }

    /// Sanitized form of the first pattern (in registration order) that matches `uri`.
    pub fn matching_pattern(&self, uri: &str) -> Option<&str> {
        let path = normalize(uri);
        self.patterns
            .iter()
            .find(|p| p.matches_normalized(&path))
            .map(UrlPattern::sanitized)
    }

    pub fn patterns(&self) -> &[UrlPattern] {
        &self.patterns
    }
}

impl Default for UrlMatcher {
    fn default() -> Self {
        Self {
            patterns: vec![UrlPattern {
                raw: DEFAULT_URL_PATTERN.to_owned(),
                pieces: vec!["/".to_owned(), String::new()],
                sanitized: String::new(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(p: &str) -> UrlPattern {
        UrlPattern::compile(p).unwrap()
    }

    #[test]
    fn catch_all_matches_everything() {
        let p = pat("/*");
        assert!(p.matches("/"));
        assert!(p.matches(""));
        assert!(p.matches("/a/b/c.txt"));
        assert!(p.matches("/x?y=1"));
        assert_eq!(p.sanitized(), "");
    }

    #[test]
    fn default_matcher_equals_compiled_catch_all() {
        let compiled = UrlMatcher::new(&["/*"]).unwrap();
        assert_eq!(UrlMatcher::default(), compiled);
    }

    #[test]
    fn prefix_wildcard() {
        let p = pat("/api/*");
        assert!(p.matches("/api"));
        assert!(p.matches("/api/"));
        assert!(p.matches("/api/users/42"));
        assert!(p.matches("/api/users?page=2"));
        assert!(!p.matches("/apix"));
        assert!(!p.matches("/other/api/"));
        assert_eq!(p.sanitized(), "/api");
    }

    #[test]
    fn exact_pattern_matches_with_or_without_slash() {
        let p = pat("/status");
        assert!(p.matches("/status"));
        assert!(p.matches("/status/"));
        assert!(p.matches("/status?verbose=1"));
        assert!(!p.matches("/status/deep"));
        assert!(!p.matches("/statusx"));
        assert_eq!(p.sanitized(), "/status");
    }

    #[test]
    fn suffix_wildcard() {
        let p = pat("*.txt");
        assert!(p.matches("/notes.txt"));
        assert!(p.matches("/a/b/readme.txt"));
        assert!(!p.matches("/notes.txt.bak"));
        assert_eq!(p.sanitized(), "");
    }

    #[test]
    fn embedded_wildcard() {
        let p = pat("/users/*/posts/*");
        assert!(p.matches("/users/7/posts/99"));
        assert!(p.matches("/users/7/posts"));
        assert!(!p.matches("/users/7/comments/1"));
        assert_eq!(p.sanitized(), "/users");
    }

    #[test]
    fn no_partial_prefix_match_without_wildcard() {
        let p = pat("/api");
        assert!(!p.matches("/api/users"));
    }

    #[test]
    fn dots_are_literal() {
        let p = pat("/index.html");
        assert!(p.matches("/index.html"));
        assert!(!p.matches("/indexXhtml"));
    }

    #[test]
    fn rejects_bad_patterns() {
        assert_eq!(UrlPattern::compile(""), Err(PatternError::Empty));
        assert!(matches!(
            UrlPattern::compile("api/*"),
            Err(PatternError::BadStart { .. })
        ));
        assert!(matches!(
            UrlPattern::compile("/a b"),
            Err(PatternError::IllegalCharacter { .. })
        ));
    }

    #[test]
    fn matcher_reports_first_matching_pattern() {
        let m = UrlMatcher::new(&["/admin/*", "/api/*", "/*"]).unwrap();
        assert_eq!(m.matching_pattern("/api/users"), Some("/api"));
        assert_eq!(m.matching_pattern("/admin"), Some("/admin"));
        assert_eq!(m.matching_pattern("/elsewhere"), Some(""));
    }

    #[test]
    fn matcher_without_hit() {
        let m = UrlMatcher::new(&["/api/*"]).unwrap();
        assert!(!m.matches("/public/index.html"));
        assert_eq!(m.matching_pattern("/public/index.html"), None);
    }

    #[test]
    fn normalize_strips_query_and_appends_slash() {
        assert_eq!(normalize("/a?b=c"), "/a/");
        assert_eq!(normalize("/a/"), "/a/");
        assert_eq!(normalize(""), "/");
    }
}
