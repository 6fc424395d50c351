//! Application-built reply objects.
//!
//! A [`Response`] is reference-counted: thread-per-connection and
//! worker-pool modes hand responses between threads, and one response
//! may be queued for many requests over its lifetime. Headers and the
//! body descriptor are mutable only while the application holds the
//! sole reference; once queued (cloned onto a connection) the object is
//! frozen, which `Arc::get_mut` enforces at compile-for-free cost.

use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::sync::{Arc, Mutex};

use crate::status::Status;
use crate::table::ValueKind;

/// Result of one pull-callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// `n` bytes were produced into the slot.
    Data(usize),
    /// Nothing to send right now; the connection leaves the writable
    /// set until it is resumed.
    Again,
    /// End of stream.
    End,
    /// Application error; the connection is aborted.
    Error,
}

/// Callback producing response body bytes on demand.
///
/// Called with the absolute body position and a slot of at most
/// `block_size` bytes.
pub type PullFn = Box<dyn FnMut(u64, &mut [u8]) -> Chunk + Send>;

pub(crate) enum BodySource {
    Empty,
    Buffer(Cow<'static, [u8]>),
    File {
        file: File,
        offset: u64,
        size: u64,
    },
    Pull {
        cb: Mutex<PullFn>,
        block_size: usize,
        size: Option<u64>,
    },
}

struct Inner {
    status: Status,
    headers: Vec<(ValueKind, String, String)>,
    body: BodySource,
    icy: bool,
    /// Frame an unknown-size body with chunked coding for HTTP/1.1
    /// clients; when cleared the engine falls back to close-framing.
    chunked_on_unknown: bool,
}

/// Attempted to mutate a response that has already been queued (or is
/// otherwise shared).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseShared;

impl fmt::Display for ResponseShared {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("response is already queued and immutable")
    }
}

impl std::error::Error for ResponseShared {}

#[derive(Clone)]
pub struct Response {
    inner: Arc<Inner>,
}

impl Response {
    fn from_source(status: Status, body: BodySource) -> Response {
        Response {
            inner: Arc::new(Inner {
                status,
                headers: Vec::new(),
                body,
                icy: false,
                chunked_on_unknown: true,
            }),
        }
    }

    /// Response without a body.
    pub fn empty(status: Status) -> Response {
        Response::from_source(status, BodySource::Empty)
    }

    /// Response backed by a fixed buffer. Borrowed `'static` data is
    /// served without copying.
    pub fn from_buffer<B>(status: Status, body: B) -> Response
    where
        B: Into<Cow<'static, [u8]>>,
    {
        Response::from_source(status, BodySource::Buffer(body.into()))
    }

    /// Response served from an open file, starting at its beginning.
    pub fn from_file(status: Status, file: File, size: u64) -> Response {
        Response::from_file_at(status, file, 0, size)
    }

    /// Response served from `size` bytes of an open file starting at
    /// `offset`. Transmitted with `sendfile(2)` where possible.
    pub fn from_file_at(status: Status, file: File, offset: u64, size: u64) -> Response {
        Response::from_source(status, BodySource::File { file, offset, size })
    }

    /// Response produced incrementally by a pull callback.
    ///
    /// `size` of `None` means unknown: the engine uses chunked framing
    /// for HTTP/1.1 clients and close-framing for HTTP/1.0.
    pub fn from_callback<F>(
        status: Status,
        size: Option<u64>,
        block_size: usize,
        cb: F,
    ) -> Response
    where
        F: FnMut(u64, &mut [u8]) -> Chunk + Send + 'static,
    {
        Response::from_source(
            status,
            BodySource::Pull {
                cb: Mutex::new(Box::new(cb)),
                block_size: block_size.max(1),
                size,
            },
        )
    }

    fn inner_mut(&mut self) -> Result<&mut Inner, ResponseShared> {
        Arc::get_mut(&mut self.inner).ok_or(ResponseShared)
    }

    /// Appends a response header. Fails once the response is queued.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), ResponseShared> {
        self.inner_mut()?.headers.push((
            ValueKind::ResponseHeader,
            name.to_owned(),
            value.to_owned(),
        ));
        Ok(())
    }

    /// Appends a trailer sent after the last chunk of a chunked body.
    /// Ignored for responses that end up non-chunked on the wire.
    pub fn add_footer(&mut self, name: &str, value: &str) -> Result<(), ResponseShared> {
        self.inner_mut()?.headers.push((
            ValueKind::ResponseFooter,
            name.to_owned(),
            value.to_owned(),
        ));
        Ok(())
    }

    /// Uses `ICY` in place of `HTTP/1.x` on the status line, for
    /// SHOUTcast-compatible clients.
    pub fn set_icy(&mut self) -> Result<(), ResponseShared> {
        self.inner_mut()?.icy = true;
        Ok(())
    }

    /// Frames an unknown-size body by connection close even for
    /// HTTP/1.1 clients, instead of chunked coding.
    pub fn set_close_framing(&mut self) -> Result<(), ResponseShared> {
        self.inner_mut()?.chunked_on_unknown = false;
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.inner.status
    }

    /// Declared body size, when known.
    pub fn body_size(&self) -> Option<u64> {
        match self.inner.body {
            BodySource::Empty => Some(0),
            BodySource::Buffer(ref b) => Some(b.len() as u64),
            BodySource::File { size, .. } => Some(size),
            BodySource::Pull { size, .. } => size,
        }
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner
            .headers
            .iter()
            .find(|(k, n, _)| {
                *k == ValueKind::ResponseHeader && n.eq_ignore_ascii_case(name)
            })
            .map(|(_, _, v)| v.as_str())
    }

    pub(crate) fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .headers
            .iter()
            .filter(|(k, _, _)| *k == ValueKind::ResponseHeader)
            .map(|(_, n, v)| (n.as_str(), v.as_str()))
    }

    pub(crate) fn footers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .headers
            .iter()
            .filter(|(k, _, _)| *k == ValueKind::ResponseFooter)
            .map(|(_, n, v)| (n.as_str(), v.as_str()))
    }

    pub(crate) fn body(&self) -> &BodySource {
        &self.inner.body
    }

    pub(crate) fn icy(&self) -> bool {
        self.inner.icy
    }

    pub(crate) fn chunked_on_unknown(&self) -> bool {
        self.inner.chunked_on_unknown
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let body = match self.inner.body {
            BodySource::Empty => "empty",
            BodySource::Buffer(_) => "buffer",
            BodySource::File { .. } => "file",
            BodySource::Pull { .. } => "callback",
        };
        f.debug_struct("Response")
            .field("status", &self.inner.status)
            .field("body", &body)
            .field("headers", &self.inner.headers.len())
            .finish()
    }
}
