//! Application callback interface.

use std::any::Any;

use crate::request::Request;
use crate::status::Status;

/// Why a request stopped being processed. Reported exactly once per
/// request through [`Handler::request_finished`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Response fully sent.
    Ok,
    /// Protocol or internal error ended the request.
    WithError,
    /// The connection sat idle past the daemon's timeout.
    TimeoutReached,
    /// The daemon was stopped while the request was in flight.
    DaemonShutdown,
    /// The peer closed or broke the connection while the engine was
    /// still reading the request.
    ReadError,
    /// The peer went away while the response was being sent.
    ClientAbort,
}

/// Per-daemon application logic.
///
/// One handler instance serves every connection, possibly from many
/// threads at once, so it borrows itself shared; per-request state goes
/// through [`Request::set_context`].
pub trait Handler: Send + Sync + 'static {
    /// Called once the request head is parsed, before any body byte is
    /// consumed. Returning an error status sends a best-effort error
    /// response and closes the connection after it. Queueing a response
    /// here skips the remaining body for the same effect.
    fn headers_received(&self, _request: &mut Request<'_>) -> Result<(), Status> {
        Ok(())
    }

    /// Incremental upload delivery; the pending bytes are available
    /// through [`Request::upload_data`]. Returns how many of them were
    /// consumed. Consuming zero takes the connection out of the
    /// readable set until it is resumed, so the data can be retried
    /// once the application catches up.
    fn upload_chunk(&self, request: &mut Request<'_>) -> usize {
        request.upload_data().len()
    }

    /// The request (head and body) is complete; the handler is expected
    /// to queue a response. A handler that wants to respond later calls
    /// [`Request::suspend`] instead and will be called here again after
    /// the connection is resumed.
    fn request_received(&self, request: &mut Request<'_>);

    /// End-of-request notification with the per-request context the
    /// application stored, if any.
    fn request_finished(&self, _context: Option<Box<dyn Any + Send>>, _completion: Completion) {}
}
