//! # bridgeway
//!
//! Request dispatch and session management between an async HTTP/1.1 transport
//! and a filter/handler processing model.
//!
//! A [`Webapp`] owns the route table, the interceptor pipeline and the session
//! store. For every request it resolves the matching filters and handler, binds
//! the connection and session into a per-request context, runs the chain, and
//! releases the context again whether the chain succeeded or failed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bridgeway::chain::handler_fn;
//! use bridgeway::server::Server;
//! use bridgeway::webapp::{Webapp, WebappConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WebappConfig::new("counter").add_handler(
//!         handler_fn(|exchange| {
//!             let session = exchange.session_or_create();
//!             let visits = session.attribute::<u32>("visits").map_or(1, |v| *v + 1);
//!             session.set_attribute("visits", visits);
//!             exchange.response.write_str(&format!("visit #{visits}"));
//!             Ok(())
//!         }),
//!         &["/*"],
//!     )?;
//!
//!     let webapp = Arc::new(Webapp::start(config).await);
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(webapp).await?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod chain;
pub mod context;
pub mod http;
pub mod interceptor;
pub mod router;
pub mod server;
pub mod session;
pub mod static_files;
pub mod webapp;

pub use chain::{ChainState, DispatchChain, DispatchError, Filter, FilterChain, Handler, handler_fn};
pub use context::{ConnectionInfo, Exchange, RequestContext};
pub use http::{Cookie, Headers, Method, Request, Response, StatusCode};
pub use router::{Resolution, RouteTable, RoutingError};
pub use server::{Server, ServerConfig, ServerError};
pub use session::{InMemorySessionStore, Session, SessionStore};
pub use webapp::{Webapp, WebappConfig, WebappSettings};
