//! Fallback file serving for requests no handler matched.
//!
//! | Condition                                    | Status |
//! |----------------------------------------------|--------|
//! | method other than `GET`                      | 405    |
//! | path escapes the root or cannot be decoded   | 403    |
//! | target resolves (via links) outside the root | 403    |
//! | target missing or hidden (`.` prefix)        | 404    |
//! | target exists but is not a regular file      | 403    |
//! | regular file                                 | 200, streamed by the transport |

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::http::{Method, Request, Response, StatusCode};

/// Serves regular files below a fixed root directory.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    /// Serves below `root`, resolved to its canonical form when it exists so
    /// that symlinked targets can be checked against it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a request path onto the root. `None` when the decoded path would
    /// leave the root or is not valid UTF-8.
    pub fn map_path(&self, request_path: &str) -> Option<PathBuf> {
        let path = request_path.split_once('?').map_or(request_path, |(p, _)| p);
        let decoded = urlencoding::decode(path).ok()?;
        if decoded.contains('\0') {
            return None;
        }

        let mut mapped = self.root.clone();
        for component in Path::new(decoded.trim_start_matches('/')).components() {
            match component {
                Component::Normal(segment) => mapped.push(segment),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(mapped)
    }

    /// Produces the response for `request`. Never fails: every problem maps to
    /// an error status.
    pub async fn serve(&self, request: &Request) -> Response {
        let response = self.lookup(request).await;
        response.keep_alive(request.is_keep_alive())
    }

    async fn lookup(&self, request: &Request) -> Response {
        if *request.method() != Method::Get {
            debug!(method = %request.method(), path = %request.path(), "static: method not allowed");
            return Response::error(StatusCode::MethodNotAllowed);
        }

        let Some(path) = self.map_path(request.path()) else {
            debug!(path = %request.path(), "static: rejected path");
            return Response::error(StatusCode::Forbidden);
        };

        if is_hidden(&path, &self.root) {
            debug!(path = %path.display(), "static: hidden file");
            return Response::error(StatusCode::NotFound);
        }

        let resolved = match tokio::fs::canonicalize(&path).await {
            Ok(resolved) => resolved,
            Err(_) => {
                debug!(path = %path.display(), "static: not found");
                return Response::error(StatusCode::NotFound);
            }
        };
        if !resolved.starts_with(&self.root) {
            debug!(path = %path.display(), target = %resolved.display(), "static: link leaves the root");
            return Response::error(StatusCode::Forbidden);
        }

        let metadata = match tokio::fs::metadata(&resolved).await {
            Ok(metadata) => metadata,
            Err(_) => {
                debug!(path = %path.display(), "static: not found");
                return Response::error(StatusCode::NotFound);
            }
        };
        if !metadata.is_file() {
            debug!(path = %path.display(), "static: not a regular file");
            return Response::error(StatusCode::Forbidden);
        }

        match tokio::fs::File::open(&resolved).await {
            Ok(file) => Response::file(file, metadata.len(), content_type(&path)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "static: open failed");
                Response::error(StatusCode::NotFound)
            }
        }
    }
}

fn is_hidden(path: &Path, root: &Path) -> bool {
    path.strip_prefix(root).is_ok_and(|relative| {
        relative
            .components()
            .any(|c| matches!(c, Component::Normal(s) if s.to_string_lossy().starts_with('.')))
    })
}

/// `Content-Type` for a file, by extension.
pub fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::Body;

    fn fixture() -> (tempfile::TempDir, StaticFiles) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hello world").unwrap();
        std::fs::write(dir.path().join(".secret"), "hidden").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs").join("my page.html"), "<p>hi</p>").unwrap();
        let files = StaticFiles::new(dir.path());
        (dir, files)
    }

    #[test]
    fn map_path_rejects_traversal() {
        let files = StaticFiles::new("/srv/public");
        assert!(files.map_path("/../../etc/passwd").is_none());
        assert!(files.map_path("/docs/%2e%2e/%2e%2e/etc/passwd").is_none());
        assert_eq!(
            files.map_path("/docs/./a.txt?x=1"),
            Some(PathBuf::from("/srv/public/docs/a.txt"))
        );
    }

    #[tokio::test]
    async fn serves_regular_file() {
        let (_dir, files) = fixture();
        let response = files.serve(&Request::new(Method::Get, "/hello.txt")).await;
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.body_len(), 11);
        assert_eq!(
            response.headers().get("content-type"),
            Some("text/plain; charset=utf-8")
        );
        let (head, body) = response.into_parts();
        assert!(String::from_utf8_lossy(&head).contains("Content-Length: 11\r\n"));
        assert!(matches!(body, Body::File { len: 11, .. }));
    }

    #[tokio::test]
    async fn decodes_percent_escapes() {
        let (_dir, files) = fixture();
        let response = files.serve(&Request::new(Method::Get, "/docs/my%20page.html")).await;
        assert_eq!(response.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn status_mapping() {
        let (_dir, files) = fixture();
        let cases = [
            (Method::Post, "/hello.txt", StatusCode::MethodNotAllowed),
            (Method::Get, "/missing.txt", StatusCode::NotFound),
            (Method::Get, "/.secret", StatusCode::NotFound),
            (Method::Get, "/docs", StatusCode::Forbidden),
            (Method::Get, "/../../etc/passwd", StatusCode::Forbidden),
        ];
        for (method, path, expected) in cases {
            let response = files.serve(&Request::new(method.clone(), path)).await;
            assert_eq!(response.status(), expected, "{method} {path}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_confined_to_root() {
        let (dir, files) = fixture();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "outside").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("leak")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("elsewhere")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("hello.txt"), dir.path().join("alias.txt")).unwrap();

        let leak = files.serve(&Request::new(Method::Get, "/leak")).await;
        assert_eq!(leak.status(), StatusCode::Forbidden);

        let nested = files.serve(&Request::new(Method::Get, "/elsewhere/secret.txt")).await;
        assert_eq!(nested.status(), StatusCode::Forbidden);

        let alias = files.serve(&Request::new(Method::Get, "/alias.txt")).await;
        assert_eq!(alias.status(), StatusCode::Ok);
        assert_eq!(alias.body_len(), 11);
    }

    #[tokio::test]
    async fn error_bodies_use_failure_shape() {
        let (_dir, files) = fixture();
        let response = files.serve(&Request::new(Method::Get, "/missing.txt")).await;
        assert_eq!(response.buffer(), b"Failure: 404 Not Found\r\n");
        assert_eq!(response.headers().get("pragma"), Some("no-cache"));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type(Path::new("a.CSS")), "text/css");
        assert_eq!(content_type(Path::new("app.wasm")), "application/wasm");
        assert_eq!(content_type(Path::new("noext")), "application/octet-stream");
    }
}
