//! An embeddable HTTP/1.0 and HTTP/1.1 server engine.
//!
//! The crate is a library, not a framework: the application supplies a
//! [`Handler`] and picks a scheduling [`Mode`]; the engine owns the
//! sockets, the per-connection memory pools and the protocol state
//! machines. Requests are parsed incrementally without copying the
//! header data out of the connection's pool, uploads are streamed to
//! the handler, and responses are reference-counted objects that can
//! be shared between requests and threads.
//!
//! ```no_run
//! use tiny_httpd::{Builder, Handler, Mode, Request, Response, Status};
//!
//! struct Hello;
//!
//! impl Handler for Hello {
//!     fn request_received(&self, request: &mut Request<'_>) {
//!         let body = format!("hello, {}", request.url());
//!         let response = Response::from_buffer(Status::OK, body.into_bytes());
//!         request.queue_response(response).expect("first response");
//!     }
//! }
//!
//! let daemon = Builder::new()
//!     .bind("127.0.0.1:8080".parse().unwrap())
//!     .mode(Mode::Internal)
//!     .start(Hello)
//!     .expect("daemon start");
//! println!("listening on {}", daemon.local_addr());
//! ```

mod connection;
mod daemon;
mod error;
mod handler;
mod headers;
mod pool;
mod request;
mod response;
mod status;
mod table;
mod version;

pub use crate::connection::Transport;
pub use crate::daemon::{AcceptPolicy, Builder, ConnectionHandle, Daemon, Mode};
pub use crate::error::{ProtocolError, StartError};
pub use crate::handler::{Completion, Handler};
pub use crate::pool::DEFAULT_POOL_SIZE;
pub use crate::request::{AlreadyQueued, Request};
pub use crate::response::{Chunk, PullFn, Response, ResponseShared};
pub use crate::status::Status;
pub use crate::table::{KindMask, ValueKind};
pub use crate::version::Version;
