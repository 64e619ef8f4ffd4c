//! Async TCP transport for a [`Webapp`] using Tokio.
//!
//! Accepts connections, frames HTTP/1.1 requests, hands each one to
//! [`Webapp::dispatch`] and writes the response back. Connections are persistent
//! unless the request or response says otherwise, and are closed after
//! [`ServerConfig::idle_timeout`] without traffic.
//!
//! Transport-level answers:
//!
//! - `100 Continue` before reading the body of an `Expect: 100-continue` request;
//! - `400 Bad Request` (then close) for malformed or oversized requests,
//!   including malformed chunked bodies;
//! - `404 Not Found` (then close) when the webapp has no route for the request.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::context::ConnectionInfo;
use crate::http::request::{Request, RequestError, decode_chunked};
use crate::http::response::{Body, Response};
use crate::http::StatusCode;
use crate::webapp::Webapp;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Largest request (head plus body) buffered before answering 400.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Time a connection may sit without receiving bytes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Chunk size for file bodies on encrypted connections.
const FILE_CHUNK_SIZE: usize = 8192;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Transport settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_request_size: usize,
    pub idle_timeout: Duration,
    /// Whether connections are encrypted. File bodies are then written in
    /// buffered chunks instead of a direct copy.
    pub secure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            secure: false,
        }
    }
}

/// A bound listener serving one webapp.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use bridgeway::chain::handler_fn;
/// use bridgeway::server::Server;
/// use bridgeway::webapp::{Webapp, WebappConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = WebappConfig::new("hello").add_handler(
///         handler_fn(|exchange| {
///             exchange.response.write_str("Hello!");
///             Ok(())
///         }),
///         &["/*"],
///     )?;
///     let webapp = Arc::new(Webapp::start(config).await);
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(webapp).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
}

impl Server {
    /// Binds with the default [`ServerConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        Self::bind_with(addr, ServerConfig::default()).await
    }

    /// # Errors
    ///
    /// See [`bind`](Self::bind).
    pub async fn bind_with(addr: impl AsRef<str>, config: ServerConfig) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            config,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serves until the process ends.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run(self, webapp: Arc<Webapp>) -> Result<(), ServerError> {
        self.run_until(webapp, std::future::pending()).await
    }

    /// Serves until `shutdown` resolves. Connections already accepted keep
    /// running on their own tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run_until<F>(self, webapp: Arc<Webapp>, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let config = Arc::new(self.config);
        let mut next_connection_id: u64 = 0;
        tokio::pin!(shutdown);

        info!(address = %self.local_addr, webapp = %webapp.name(), "listening");

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!(address = %self.local_addr, "listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
            };

            next_connection_id += 1;
            let connection = ConnectionInfo::new(next_connection_id)
                .with_peer(peer_addr)
                .with_local(self.local_addr)
                .with_secure(config.secure);
            debug!(peer = %peer_addr, connection = next_connection_id, "connection accepted");

            let webapp = Arc::clone(&webapp);
            let config = Arc::clone(&config);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, connection, &webapp, &config).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Outcome of waiting for more request bytes.
enum Read {
    Data,
    Closed,
    Idle,
}

async fn read_more<S>(stream: &mut S, buf: &mut BytesMut, idle_timeout: Duration) -> std::io::Result<Read>
where
    S: AsyncRead + Unpin,
{
    match time::timeout(idle_timeout, stream.read_buf(buf)).await {
        Err(_) => Ok(Read::Idle),
        Ok(Ok(0)) => Ok(Read::Closed),
        Ok(Ok(_)) => Ok(Read::Data),
        Ok(Err(e)) => Err(e),
    }
}

/// Serves every request on one connection.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection, signals
/// `Connection: close`, or stays idle past the configured timeout.
///
/// # Errors
///
/// I/O errors from the underlying stream.
pub async fn serve_connection<S>(
    mut stream: S,
    connection: ConnectionInfo,
    webapp: &Webapp,
    config: &ServerConfig,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    let mut continue_sent = false;

    loop {
        let (request, consumed) = match frame_request(&buf, config.max_request_size) {
            Ok(Framing::Complete { request, consumed }) => (request, consumed),
            // Headers are in; wait for the rest of the body.
            Ok(Framing::AwaitingBody { expects_continue }) => {
                if expects_continue && !continue_sent {
                    stream.write_all(CONTINUE_RESPONSE).await?;
                    stream.flush().await?;
                    continue_sent = true;
                }
                match read_more(&mut stream, &mut buf, config.idle_timeout).await? {
                    Read::Data => continue,
                    Read::Closed | Read::Idle => {
                        debug!(connection = connection.id(), "connection ended mid-request");
                        return Ok(());
                    }
                }
            }
            Err(RequestError::Incomplete) => {
                match read_more(&mut stream, &mut buf, config.idle_timeout).await? {
                    Read::Data => continue,
                    Read::Closed => {
                        debug!(connection = connection.id(), "connection closed by peer");
                        return Ok(());
                    }
                    Read::Idle => {
                        debug!(connection = connection.id(), "closing idle connection");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                warn!(connection = connection.id(), error = %e, "bad request, sending 400");
                let response = Response::error(StatusCode::BadRequest).keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                stream.flush().await?;
                return Ok(());
            }
        };

        let _ = buf.split_to(consumed);
        continue_sent = false;

        match webapp.dispatch(request, connection.clone()).await {
            Ok(response) => {
                let keep_alive = response.is_keep_alive();
                write_response(&mut stream, response, config.secure).await?;
                if !keep_alive {
                    debug!(connection = connection.id(), "Connection: close, shutting down");
                    return Ok(());
                }
            }
            Err(e) => {
                debug!(connection = connection.id(), error = %e, "sending 404");
                let response = Response::error(StatusCode::NotFound).keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                stream.flush().await?;
                return Ok(());
            }
        }
    }
}

/// Where the request at the front of the buffer stands.
enum Framing {
    Complete { request: Request, consumed: usize },
    AwaitingBody { expects_continue: bool },
}

/// Frames one request from `buf`: headers, then a `Content-Length` or chunked
/// body. Anything that would exceed `max_request_size` is rejected.
fn frame_request(buf: &[u8], max_request_size: usize) -> Result<Framing, RequestError> {
    let too_large = RequestError::BodyTooLarge {
        max_bytes: max_request_size,
    };

    let (request, body_offset) = match Request::parse(buf) {
        Err(RequestError::Incomplete) if buf.len() > max_request_size => return Err(too_large),
        parsed => parsed?,
    };

    if request.is_chunked() {
        let body_limit = max_request_size.saturating_sub(body_offset);
        return match decode_chunked(&buf[body_offset..], body_limit) {
            Ok((body, len)) => Ok(Framing::Complete {
                request: request.with_body(body),
                consumed: body_offset + len,
            }),
            Err(RequestError::Incomplete) if buf.len() > max_request_size => Err(too_large),
            Err(RequestError::Incomplete) => Ok(Framing::AwaitingBody {
                expects_continue: request.expects_continue(),
            }),
            Err(e) => Err(e),
        };
    }

    let total = body_offset
        .checked_add(request.content_length().unwrap_or(0))
        .filter(|total| *total <= max_request_size)
        .ok_or(too_large)?;

    if buf.len() < total {
        Ok(Framing::AwaitingBody {
            expects_continue: request.expects_continue(),
        })
    } else {
        Ok(Framing::Complete {
            request,
            consumed: total,
        })
    }
}

async fn write_response<S>(stream: &mut S, response: Response, secure: bool) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let (head, body) = response.into_parts();
    stream.write_all(&head).await?;

    match body {
        Body::Buffer(bytes) => stream.write_all(&bytes).await?,
        Body::File { file, len } => {
            let mut file = file.take(len);
            if secure {
                let mut chunk = vec![0u8; FILE_CHUNK_SIZE];
                loop {
                    let n = file.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    stream.write_all(&chunk[..n]).await?;
                }
            } else {
                tokio::io::copy(&mut file, stream).await?;
            }
        }
    }

    stream.flush().await
}

#[cfg(test)]
mod tests {
    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::chain::handler_fn;
    use crate::webapp::WebappConfig;

    async fn echo_webapp() -> Arc<Webapp> {
        let config = WebappConfig::new("echo")
            .add_handler(
                handler_fn(|ex| {
                    let body = String::from_utf8_lossy(ex.request.body()).into_owned();
                    ex.response.write_str(&format!("{} {}", ex.request.path(), body));
                    Ok(())
                }),
                &["/echo/*"],
            )
            .unwrap();
        Arc::new(Webapp::start(config).await)
    }

    fn spawn_connection(webapp: Arc<Webapp>, config: ServerConfig) -> DuplexStream {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = serve_connection(server, ConnectionInfo::new(1), &webapp, &config).await;
        });
        client
    }

    async fn read_to_string(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn keep_alive_serves_two_requests() {
        let mut client = spawn_connection(echo_webapp().await, ServerConfig::default());
        client
            .write_all(b"GET /echo/a HTTP/1.1\r\nHost: x\r\n\r\nGET /echo/b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let text = read_to_string(&mut client).await;
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("/echo/b "));
    }

    #[tokio::test]
    async fn malformed_request_gets_400_and_close() {
        let mut client = spawn_connection(echo_webapp().await, ServerConfig::default());
        client.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();

        let text = read_to_string(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn oversized_body_gets_400() {
        let config = ServerConfig {
            max_request_size: 64,
            ..ServerConfig::default()
        };
        let mut client = spawn_connection(echo_webapp().await, config);
        client
            .write_all(b"POST /echo/x HTTP/1.1\r\nContent-Length: 1000\r\n\r\n")
            .await
            .unwrap();

        let text = read_to_string(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn overflowing_content_length_gets_400() {
        let mut client = spawn_connection(echo_webapp().await, ServerConfig::default());
        client
            .write_all(b"POST /echo/x HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n")
            .await
            .unwrap();

        let text = read_to_string(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn chunked_body_is_decoded_and_connection_reused() {
        let mut client = spawn_connection(echo_webapp().await, ServerConfig::default());
        client
            .write_all(
                b"POST /echo/up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n\
                  GET /echo/next HTTP/1.1\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();

        let text = read_to_string(&mut client).await;
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
        assert!(text.contains("/echo/up hello world"));
        assert!(text.ends_with("/echo/next "));
    }

    #[tokio::test]
    async fn chunked_body_over_limit_gets_400() {
        let config = ServerConfig {
            max_request_size: 96,
            ..ServerConfig::default()
        };
        let mut client = spawn_connection(echo_webapp().await, config);
        client
            .write_all(b"POST /echo/x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n400\r\n")
            .await
            .unwrap();

        let text = read_to_string(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn malformed_chunk_gets_400() {
        let mut client = spawn_connection(echo_webapp().await, ServerConfig::default());
        client
            .write_all(b"POST /echo/x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nxyz\r\nhello\r\n")
            .await
            .unwrap();

        let text = read_to_string(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn expect_continue_gets_interim_response() {
        let mut client = spawn_connection(echo_webapp().await, ServerConfig::default());
        client
            .write_all(b"POST /echo/up HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut interim = vec![0u8; CONTINUE_RESPONSE.len()];
        client.read_exact(&mut interim).await.unwrap();
        assert_eq!(interim, CONTINUE_RESPONSE);

        client.write_all(b"hello").await.unwrap();
        let text = read_to_string(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("/echo/up hello"));
    }

    #[tokio::test]
    async fn no_route_gets_404_and_close() {
        let mut client = spawn_connection(echo_webapp().await, ServerConfig::default());
        client
            .write_all(b"GET /elsewhere HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let text = read_to_string(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Failure: 404 Not Found\r\n"));
    }

    #[tokio::test]
    async fn idle_connection_is_closed() {
        let config = ServerConfig {
            idle_timeout: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let mut client = spawn_connection(echo_webapp().await, config);
        let text = time::timeout(Duration::from_secs(2), read_to_string(&mut client))
            .await
            .unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn secure_connection_streams_files_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let content = "x".repeat(FILE_CHUNK_SIZE * 2 + 17);
        std::fs::write(dir.path().join("big.txt"), &content).unwrap();
        let config = WebappConfig::new("files")
            .static_resources_root(dir.path())
            .unwrap();
        let webapp = Arc::new(Webapp::start(config).await);

        let server_config = ServerConfig {
            secure: true,
            ..ServerConfig::default()
        };
        let mut client = spawn_connection(webapp, server_config);
        client
            .write_all(b"GET /big.txt HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let text = read_to_string(&mut client).await;
        assert!(text.contains(&format!("Content-Length: {}\r\n", content.len())));
        assert!(text.ends_with(&content));
    }
}
