//! Borrow-view of the request currently being processed, handed to
//! handler callbacks.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;

use crate::connection::{Connection, RequestState};
use crate::daemon::ConnectionHandle;
use crate::response::Response;
use crate::table::{KindMask, ValueKind};
use crate::version::Version;

/// A response was already queued for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyQueued;

impl fmt::Display for AlreadyQueued {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a response is already queued for this request")
    }
}

impl std::error::Error for AlreadyQueued {}

/// The in-flight request, borrowed from its connection for the duration
/// of a handler callback. All string accessors return data interned in
/// the connection pool, valid until the callback returns.
pub struct Request<'c> {
    pub(crate) conn: &'c mut Connection,
}

impl<'c> Request<'c> {
    fn req(&self) -> &RequestState {
        match self.conn.req {
            Some(ref r) => r,
            // a Request is only constructed while a request is in flight
            None => unreachable!("request view outside a request"),
        }
    }

    fn req_mut(&mut self) -> &mut RequestState {
        match self.conn.req {
            Some(ref mut r) => r,
            None => unreachable!("request view outside a request"),
        }
    }

    pub fn method(&self) -> &str {
        self.req().method.get(&self.conn.pool)
    }

    /// Percent-decoded request path, without the query string.
    pub fn url(&self) -> &str {
        self.req().url.get(&self.conn.pool)
    }

    pub fn version(&self) -> Version {
        self.req().version
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.conn.addr
    }

    /// First value under the kind mask for `name`, in insertion order.
    pub fn lookup(&self, mask: KindMask, name: &str) -> Option<&str> {
        self.req().table.lookup(&self.conn.pool, mask, name)
    }

    /// All values for `name` under the mask, in insertion order.
    pub fn lookup_all<'a>(
        &'a self,
        mask: KindMask,
        name: &'a str,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.req().table.lookup_all(&self.conn.pool, mask, name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.lookup(ValueKind::Header.mask(), name)
    }

    pub fn query_arg(&self, name: &str) -> Option<&str> {
        self.lookup(ValueKind::QueryArg.mask(), name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.lookup(ValueKind::Cookie.mask(), name)
    }

    pub fn footer(&self, name: &str) -> Option<&str> {
        self.lookup(ValueKind::Footer.mask(), name)
    }

    /// Visits every entry under the mask; stops when the visitor
    /// returns `false`. Returns the number visited.
    pub fn visit_values<F>(&self, mask: KindMask, f: F) -> usize
    where
        F: FnMut(ValueKind, &str, &str) -> bool,
    {
        self.req().table.visit(&self.conn.pool, mask, f)
    }

    pub fn value_count(&self, mask: KindMask) -> usize {
        self.req().table.count(mask)
    }

    /// Declared `Content-Length`, absent for chunked uploads and
    /// bodyless requests.
    pub fn content_length(&self) -> Option<u64> {
        self.req().content_length
    }

    /// True when the upload arrives with chunked transfer coding.
    pub fn chunked_upload(&self) -> bool {
        self.req().chunked
    }

    /// Body bytes pending delivery. Only meaningful inside
    /// [`Handler::upload_chunk`](crate::Handler::upload_chunk).
    pub fn upload_data(&self) -> &[u8] {
        &self.conn.pool.tail()[..self.conn.upload_window]
    }

    /// Queues the response to send once the request is complete. Fails
    /// if one is already queued.
    pub fn queue_response(&mut self, response: Response) -> Result<(), AlreadyQueued> {
        if self.conn.pending_response.is_some() || self.conn.responding() {
            return Err(AlreadyQueued);
        }
        self.conn.pending_response = Some(response);
        Ok(())
    }

    /// Takes the connection out of event processing until it is resumed
    /// through its [`ConnectionHandle`]. No timeout applies while
    /// suspended.
    pub fn suspend(&mut self) {
        self.conn.suspended = true;
    }

    /// Handle usable from any thread to resume a suspended connection.
    /// Absent only for connections driven outside a daemon (tests).
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.conn.wake.clone()
    }

    /// Stores per-request application state, returned through
    /// [`Handler::request_finished`](crate::Handler::request_finished).
    pub fn set_context(&mut self, context: Box<dyn Any + Send>) {
        self.req_mut().app_data = Some(context);
    }

    pub fn context_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.req_mut().app_data.as_deref_mut()
    }

    pub fn take_context(&mut self) -> Option<Box<dyn Any + Send>> {
        self.req_mut().app_data.take()
    }
}

impl<'c> fmt::Debug for Request<'c> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method())
            .field("url", &self.url())
            .field("version", &self.version())
            .field("peer", &self.conn.addr)
            .finish()
    }
}
