//! Per-connection protocol state machine.
//!
//! A [`Connection`] owns its transport, its memory pool and the state
//! of at most one in-flight request. The scheduler only feeds it
//! readiness: `process` reads what the socket has, advances the state
//! machine (invoking handler callbacks), and writes what it can. All
//! blocking is expressed by returning; nothing here ever waits.

use std::any::Any;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, trace};

use crate::daemon::ConnectionHandle;
use crate::error::ProtocolError;
use crate::handler::{Completion, Handler};
use crate::headers;
use crate::pool::{Pool, PoolStr};
use crate::request::Request;
use crate::response::{BodySource, Chunk, Response};
use crate::status::Status;
use crate::table::{Table, ValueKind};
use crate::version::Version;

pub(crate) mod parse;

const CONTINUE_100: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Reserved space in the staging area for the chunk-size line and the
/// trailing CRLF of one chunk.
const CHUNK_HEAD: usize = 10;
const CHUNK_OVERHEAD: usize = CHUNK_HEAD + 2;

/// Staging area size for file reads and pull callbacks, before clamping
/// to what the pool has left.
const STAGE_SIZE: usize = 8 * 1024;

/// Byte-stream under the protocol engine. Implemented by plain TCP
/// sockets; a TLS session would implement it over its plaintext side.
pub trait Transport: Read + Write + Send {
    /// Descriptor registered with the poller.
    fn raw_fd(&self) -> RawFd;

    /// Descriptor for zero-copy file transmission. `None` for
    /// transports that transform the byte stream.
    fn sendfile_fd(&self) -> Option<RawFd> {
        None
    }
}

impl Transport for mio::net::TcpStream {
    fn raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.as_raw_fd()
    }

    fn sendfile_fd(&self) -> Option<RawFd> {
        Some(self.raw_fd())
    }
}

/// Protocol position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Waiting for (more of) the request line.
    Init,
    /// Request line parsed.
    UrlReceived,
    /// At least one header line parsed.
    HeaderPartReceived,
    /// Empty line after the headers seen.
    HeadersReceived,
    /// Header values digested into framing decisions.
    HeadersProcessed,
    /// `100 Continue` queued for the wire.
    ContinueSending,
    ContinueSent,
    BodyReceiving,
    BodyReceived,
    /// Inside the trailer section of a chunked upload.
    FooterPartReceived,
    /// Request complete; waiting for the application's response.
    FootersReceived,
    HeadersSending,
    HeadersSent,
    /// Identity response body with bytes ready to push.
    NormalBodyReady,
    /// Identity body stalled on the application (pull returned `Again`).
    NormalBodyUnready,
    ChunkedBodyReady,
    ChunkedBodyUnready,
    BodySent,
    FootersSending,
    FootersSent,
    Closed,
}

/// Everything parsed out of one request.
pub(crate) struct RequestState {
    pub method: PoolStr,
    pub url: PoolStr,
    pub version: Version,
    pub table: Table,
    pub content_length: Option<u64>,
    pub chunked: bool,
    /// Identity upload bytes still expected.
    pub remaining: u64,
    /// Data bytes left in the current chunk.
    pub chunk_left: u64,
    /// The CRLF after chunk data is still owed.
    pub chunk_crlf: bool,
    pub expect_continue: bool,
    pub client_close: bool,
    pub client_keep_alive: bool,
    pub app_data: Option<Box<dyn Any + Send>>,
}

impl RequestState {
    fn new(line: parse::RequestLine) -> RequestState {
        RequestState {
            method: line.method,
            url: line.url,
            version: line.version,
            table: Table::new(),
            content_length: None,
            chunked: false,
            remaining: 0,
            chunk_left: 0,
            chunk_crlf: false,
            expect_continue: false,
            client_close: false,
            client_keep_alive: false,
            app_data: None,
        }
    }
}

/// The response currently on the wire.
struct Outgoing {
    response: Response,
    close: bool,
    chunked: bool,
    suppress_body: bool,
    head_off: usize,
    head_len: usize,
    head_sent: usize,
    /// Staging region for file reads, pull callbacks and chunk framing.
    stage: Option<(usize, usize)>,
    /// Absolute span of staged wire bytes and how much of it was sent.
    staged: Option<(usize, usize)>,
    staged_sent: usize,
    body_pos: u64,
    body_size: Option<u64>,
    trailer: Vec<u8>,
    trailer_sent: usize,
}

pub struct Connection {
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) addr: SocketAddr,
    pub(crate) pool: Pool,
    pub(crate) state: State,
    pub(crate) req: Option<RequestState>,
    pub(crate) pending_response: Option<Response>,
    outgoing: Option<Outgoing>,
    /// Bytes of the tail currently offered to `upload_chunk`.
    pub(crate) upload_window: usize,
    upload_stalled: bool,
    continue_sent: usize,
    read_closed: bool,
    write_closed: bool,
    io_error: bool,
    no_sendfile: bool,
    error_completion: Option<Completion>,
    pub(crate) suspended: bool,
    /// Whether this connection currently occupies a global accept slot.
    /// Suspended connections give theirs back until resumed.
    pub(crate) holds_slot: bool,
    last_activity: Instant,
    server_header: Option<Arc<str>>,
    pub(crate) wake: Option<ConnectionHandle>,
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn error_response(status: Status) -> Response {
    let mut resp = Response::from_buffer(status, format!("{}\r\n", status).into_bytes());
    let _ = resp.add_header("Content-Type", "text/plain");
    resp
}

#[cfg(target_os = "linux")]
fn sendfile(socket: RawFd, file: &File, pos: u64, count: usize) -> io::Result<usize> {
    use std::os::unix::io::AsRawFd;
    let mut off = pos as libc::off_t;
    let n = unsafe { libc::sendfile(socket, file.as_raw_fd(), &mut off, count) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(not(target_os = "linux"))]
fn sendfile(_socket: RawFd, _file: &File, _pos: u64, _count: usize) -> io::Result<usize> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

impl Connection {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        addr: SocketAddr,
        pool_size: usize,
        server_header: Option<Arc<str>>,
    ) -> Connection {
        Connection {
            transport,
            addr,
            pool: Pool::with_capacity(pool_size),
            state: State::Init,
            req: None,
            pending_response: None,
            outgoing: None,
            upload_window: 0,
            upload_stalled: false,
            continue_sent: 0,
            read_closed: false,
            write_closed: false,
            io_error: false,
            no_sendfile: false,
            error_completion: None,
            suspended: false,
            holds_slot: true,
            last_activity: Instant::now(),
            server_header,
            wake: None,
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.transport.raw_fd()
    }

    pub(crate) fn set_wake(&mut self, handle: ConnectionHandle) {
        self.wake = Some(handle);
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub(crate) fn responding(&self) -> bool {
        self.outgoing.is_some()
    }

    fn reading_state(&self) -> bool {
        matches!(
            self.state,
            State::Init
                | State::UrlReceived
                | State::HeaderPartReceived
                | State::ContinueSent
                | State::BodyReceiving
                | State::FooterPartReceived
        )
    }

    fn wants_read(&self) -> bool {
        self.reading_state()
            && !self.read_closed
            && !self.suspended
            && !self.upload_stalled
            && self.pool.free() > 0
    }

    /// Brings a suspended connection back into event processing.
    pub(crate) fn resume(&mut self) {
        self.suspended = false;
        self.upload_stalled = false;
        match self.state {
            State::NormalBodyUnready => self.state = State::NormalBodyReady,
            State::ChunkedBodyUnready => self.state = State::ChunkedBodyReady,
            _ => {}
        }
    }

    /// Forced teardown from the scheduler (timeout, shutdown).
    pub(crate) fn close_with(&mut self, handler: &dyn Handler, completion: Completion) {
        self.abort(handler, completion);
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Runs the connection as far as the socket and the application
    /// allow. Safe to call spuriously.
    pub(crate) fn process(&mut self, handler: &dyn Handler) {
        loop {
            let read = self.fill_from_socket();
            self.advance(handler);
            let wrote = self.flush_to_socket(handler);
            self.advance(handler);
            if matches!(self.state, State::Closed) {
                return;
            }
            if read == 0 && wrote == 0 {
                return;
            }
        }
    }

    fn fill_from_socket(&mut self) -> usize {
        if !self.wants_read() {
            return 0;
        }
        let mut total = 0;
        loop {
            let buf = self.pool.reserve_tail();
            if buf.is_empty() {
                return total;
            }
            match self.transport.read(buf) {
                Ok(0) => {
                    self.read_closed = true;
                    return total;
                }
                Ok(n) => {
                    self.pool.fill_tail(n);
                    total += n;
                    self.touch();
                }
                Err(ref e) if would_block(e) => return total,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("read error on {}: {}", self.addr, e);
                    self.read_closed = true;
                    self.io_error = true;
                    return total;
                }
            }
        }
    }

    /// Advances protocol state until blocked on the socket or the
    /// application.
    fn advance(&mut self, handler: &dyn Handler) {
        loop {
            trace!("connection {} in state {:?}", self.addr, self.state);
            match self.state {
                State::Init => {
                    // skip blank lines between pipelined requests
                    loop {
                        let tail = self.pool.tail();
                        if tail.first() == Some(&b'\r') && tail.get(1) == Some(&b'\n') {
                            self.pool.discard_tail(2);
                        } else if tail.first() == Some(&b'\n') {
                            self.pool.discard_tail(1);
                        } else {
                            break;
                        }
                    }
                    if self.pool.tail_len() == 0 {
                        if self.read_closed {
                            self.state = State::Closed;
                        }
                        return;
                    }
                    match parse::next_line(&mut self.pool, false, self.read_closed) {
                        Ok(Some(line)) => {
                            match parse::parse_request_line(&mut self.pool, line) {
                                Ok(rl) => {
                                    let query = rl.query_raw;
                                    let mut req = RequestState::new(rl);
                                    if let Some(raw) = query {
                                        parse::parse_query(&mut self.pool, raw, &mut req.table);
                                    }
                                    self.req = Some(req);
                                    self.state = State::UrlReceived;
                                }
                                Err(e) => self.fault(handler, e),
                            }
                        }
                        Ok(None) => {
                            if self.read_closed {
                                self.abort(handler, Completion::ReadError);
                            }
                            return;
                        }
                        Err(e) => self.fault(handler, e),
                    }
                }
                State::UrlReceived | State::HeaderPartReceived => {
                    match parse::next_line(&mut self.pool, true, self.read_closed) {
                        Ok(Some(line)) if line.is_empty() => {
                            self.state = State::HeadersReceived;
                        }
                        Ok(Some(line)) => match parse::parse_header_line(&self.pool, line) {
                            Ok((name, value)) => {
                                let cookie =
                                    headers::eq_ignore_case(name.bytes(&self.pool), b"cookie");
                                if let Some(ref mut req) = self.req {
                                    req.table.push(ValueKind::Header, name, value);
                                    if cookie {
                                        parse::parse_cookies(&self.pool, value, &mut req.table);
                                    }
                                }
                                self.state = State::HeaderPartReceived;
                            }
                            Err(e) => self.fault(handler, e),
                        },
                        Ok(None) => {
                            if self.read_closed {
                                self.abort(handler, Completion::ReadError);
                            }
                            return;
                        }
                        Err(e) => self.fault(handler, e),
                    }
                }
                State::HeadersReceived => self.process_headers(handler),
                State::HeadersProcessed => {
                    let (has_body, expect) = match self.req {
                        Some(ref r) => (r.chunked || r.remaining > 0, r.expect_continue),
                        None => (false, false),
                    };
                    if self.pending_response.is_some() {
                        // responding before the body is read forfeits reuse
                        self.begin_response(handler, has_body);
                    } else if expect && has_body {
                        self.state = State::ContinueSending;
                        return;
                    } else if has_body {
                        self.state = State::BodyReceiving;
                    } else {
                        self.state = State::FootersReceived;
                    }
                }
                State::ContinueSending => return,
                State::ContinueSent => self.state = State::BodyReceiving,
                State::BodyReceiving => {
                    if !self.feed_body(handler) {
                        return;
                    }
                }
                State::BodyReceived => self.state = State::FootersReceived,
                State::FooterPartReceived => {
                    match parse::next_line(&mut self.pool, true, self.read_closed) {
                        Ok(Some(line)) if line.is_empty() => {
                            self.state = State::FootersReceived;
                        }
                        Ok(Some(line)) => match parse::parse_header_line(&self.pool, line) {
                            Ok((name, value)) => {
                                if let Some(ref mut req) = self.req {
                                    req.table.push(ValueKind::Footer, name, value);
                                }
                            }
                            Err(_) => self.fault(handler, ProtocolError::BadTrailer),
                        },
                        Ok(None) => {
                            if self.read_closed {
                                self.abort(handler, Completion::ReadError);
                            }
                            return;
                        }
                        Err(_) => self.fault(handler, ProtocolError::BadTrailer),
                    }
                }
                State::FootersReceived => {
                    if self.suspended {
                        return;
                    }
                    if self.pending_response.is_none() {
                        handler.request_received(&mut Request { conn: self });
                    }
                    if self.pending_response.is_some() {
                        self.begin_response(handler, false);
                    } else if self.suspended {
                        return;
                    } else {
                        error!(
                            "handler for {} neither queued a response nor suspended",
                            self.addr
                        );
                        self.pending_response =
                            Some(error_response(Status::INTERNAL_SERVER_ERROR));
                        self.error_completion = Some(Completion::WithError);
                        self.begin_response(handler, false);
                    }
                }
                State::HeadersSending => return,
                State::HeadersSent => {
                    let next = match self.outgoing {
                        Some(ref o) => {
                            if o.suppress_body {
                                State::FootersSent
                            } else if o.chunked {
                                State::ChunkedBodyReady
                            } else if o.body_size == Some(0) {
                                State::BodySent
                            } else {
                                State::NormalBodyReady
                            }
                        }
                        None => State::Closed,
                    };
                    self.state = next;
                }
                State::NormalBodyReady | State::ChunkedBodyReady => return,
                State::NormalBodyUnready | State::ChunkedBodyUnready => return,
                State::BodySent => {
                    let next = match self.outgoing {
                        Some(ref mut o) => {
                            if o.chunked && !o.suppress_body {
                                o.trailer = build_trailer(&o.response);
                                State::FootersSending
                            } else {
                                State::FootersSent
                            }
                        }
                        None => State::Closed,
                    };
                    self.state = next;
                }
                State::FootersSending => return,
                State::FootersSent => self.retire(handler),
                State::Closed => return,
            }
        }
    }

    /// Digests headers into framing decisions and runs the
    /// `headers_received` callback.
    fn process_headers(&mut self, handler: &dyn Handler) {
        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut expect_continue = false;
        let mut client_close = false;
        let mut client_keep_alive = false;
        let mut host_seen = false;
        let mut fault: Option<ProtocolError> = None;
        let version = match self.req {
            Some(ref r) => r.version,
            None => Version::Http11,
        };

        if let Some(ref req) = self.req {
            req.table
                .visit(&self.pool, ValueKind::Header.mask(), |_, name, value| {
                    if name.eq_ignore_ascii_case("content-length") {
                        match value.trim().parse::<u64>() {
                            Ok(n) => match content_length {
                                Some(old) if old != n => {
                                    fault = Some(ProtocolError::DuplicateContentLength);
                                    return false;
                                }
                                _ => content_length = Some(n),
                            },
                            Err(e) => {
                                fault = Some(ProtocolError::BadContentLength(e));
                                return false;
                            }
                        }
                    } else if name.eq_ignore_ascii_case("transfer-encoding") {
                        if headers::is_chunked(value.as_bytes()) {
                            chunked = true;
                        } else {
                            fault = Some(ProtocolError::BadTransferEncoding);
                            return false;
                        }
                    } else if name.eq_ignore_ascii_case("expect") {
                        if headers::is_100_continue(value.as_bytes()) {
                            expect_continue = true;
                        }
                    } else if name.eq_ignore_ascii_case("connection") {
                        if headers::is_close(value.as_bytes()) {
                            client_close = true;
                        }
                        if headers::is_keep_alive(value.as_bytes()) {
                            client_keep_alive = true;
                        }
                    } else if name.eq_ignore_ascii_case("host") {
                        host_seen = true;
                    }
                    true
                });
        }

        if let Some(e) = fault {
            self.fault(handler, e);
            return;
        }
        if version == Version::Http11 && !host_seen {
            self.fault(handler, ProtocolError::MissingHost);
            return;
        }
        if chunked {
            // chunked framing wins over any Content-Length (RFC 7230
            // section 3.3.3)
            content_length = None;
        }
        if let Some(ref mut req) = self.req {
            req.content_length = content_length;
            req.chunked = chunked;
            req.remaining = content_length.unwrap_or(0);
            req.expect_continue = expect_continue && version == Version::Http11;
            req.client_close = client_close;
            req.client_keep_alive = client_keep_alive;
        }
        self.state = State::HeadersProcessed;

        if let Err(status) = handler.headers_received(&mut Request { conn: self }) {
            self.pending_response = Some(error_response(status));
        }
    }

    /// Delivers buffered upload bytes to the handler. Returns false
    /// when blocked on the socket or the application.
    fn feed_body(&mut self, handler: &dyn Handler) -> bool {
        if self.suspended {
            return false;
        }
        let (chunked, chunk_left, chunk_crlf, remaining) = match self.req {
            Some(ref r) => (r.chunked, r.chunk_left, r.chunk_crlf, r.remaining),
            None => {
                self.state = State::Closed;
                return false;
            }
        };

        if !chunked {
            if remaining == 0 {
                self.state = State::BodyReceived;
                return true;
            }
            let avail = (self.pool.tail_len() as u64).min(remaining) as usize;
            if avail == 0 {
                if self.read_closed {
                    self.abort(handler, Completion::ReadError);
                }
                return false;
            }
            let consumed = self.deliver_upload(handler, avail);
            if let Some(ref mut req) = self.req {
                req.remaining -= consumed as u64;
            }
            return consumed > 0;
        }

        // chunked upload
        if chunk_left > 0 {
            let avail = (self.pool.tail_len() as u64).min(chunk_left) as usize;
            if avail == 0 {
                if self.read_closed {
                    self.abort(handler, Completion::ReadError);
                }
                return false;
            }
            let consumed = self.deliver_upload(handler, avail);
            if let Some(ref mut req) = self.req {
                req.chunk_left -= consumed as u64;
                if req.chunk_left == 0 {
                    req.chunk_crlf = true;
                }
            }
            return consumed > 0;
        }
        if chunk_crlf {
            let tail = self.pool.tail();
            let skip = if tail.starts_with(b"\r\n") {
                Some(2)
            } else if tail.starts_with(b"\n") {
                Some(1)
            } else if tail.len() >= 2 {
                None
            } else {
                if self.read_closed {
                    self.abort(handler, Completion::ReadError);
                }
                return false;
            };
            match skip {
                Some(n) => {
                    self.pool.discard_tail(n);
                    if let Some(ref mut req) = self.req {
                        req.chunk_crlf = false;
                    }
                    return true;
                }
                None => {
                    self.fault(handler, ProtocolError::BadChunkTerminator);
                    return true;
                }
            }
        }
        // expecting a chunk-size line
        match parse::peek_line(&self.pool) {
            Ok(Some((content, total))) => {
                let size = {
                    let line = &self.pool.tail()[..content];
                    parse::parse_chunk_size(line)
                };
                match size {
                    Ok(0) => {
                        self.pool.discard_tail(total);
                        self.state = State::FooterPartReceived;
                        true
                    }
                    Ok(n) => {
                        self.pool.discard_tail(total);
                        if let Some(ref mut req) = self.req {
                            req.chunk_left = n;
                        }
                        true
                    }
                    Err(e) => {
                        self.fault(handler, e);
                        true
                    }
                }
            }
            Ok(None) => {
                if self.read_closed {
                    self.abort(handler, Completion::ReadError);
                }
                false
            }
            Err(e) => {
                self.fault(handler, e);
                true
            }
        }
    }

    /// Offers `avail` tail bytes to the handler and discards what it
    /// consumed. Marks the connection stalled when nothing was taken.
    fn deliver_upload(&mut self, handler: &dyn Handler, avail: usize) -> usize {
        self.upload_window = avail;
        let consumed = handler
            .upload_chunk(&mut Request { conn: self })
            .min(avail);
        self.upload_window = 0;
        self.pool.discard_tail(consumed);
        if consumed == 0 && !self.suspended {
            self.upload_stalled = true;
        }
        consumed
    }

    /// Protocol fault: queue a best-effort error response and arrange
    /// for the connection to close after it.
    fn fault(&mut self, handler: &dyn Handler, err: ProtocolError) {
        debug!("protocol error on {}: {}", self.addr, err);
        if self.outgoing.is_some() {
            self.abort(handler, Completion::WithError);
            return;
        }
        self.pending_response = Some(error_response(err.http_status()));
        self.error_completion = Some(Completion::WithError);
        if self.pool.free() < 256 {
            // the request head may have filled the pool; the request is
            // dead anyway, so drop it and reclaim the space for the
            // error response
            if let Some(req) = self.req.take() {
                handler.request_finished(req.app_data, Completion::WithError);
                self.error_completion = None;
            }
            self.pool.reclaim_keeping_tail_bytes(0);
        }
        self.begin_response(handler, true);
    }

    /// Immediate teardown without a response on the wire.
    fn abort(&mut self, handler: &dyn Handler, completion: Completion) {
        if let Some(req) = self.req.take() {
            handler.request_finished(req.app_data, completion);
        }
        self.pending_response = None;
        self.outgoing = None;
        self.state = State::Closed;
    }

    /// Computes framing, serializes the header block into the pool and
    /// moves to the sending side of the state machine.
    fn begin_response(&mut self, handler: &dyn Handler, body_unread: bool) {
        let response = match self.pending_response.take() {
            Some(r) => r,
            None => return,
        };
        let (version, is_head, client_close, client_keep_alive) = match self.req {
            Some(ref r) => (
                r.version,
                r.method.bytes(&self.pool) == b"HEAD",
                r.client_close,
                r.client_keep_alive,
            ),
            // faults before a request line; answer as 1.1 and close
            None => (Version::Http11, false, true, false),
        };
        let status = response.status();
        let suppress_body = is_head || !status.allows_body();
        let size = response.body_size();

        let mut close = client_close || body_unread || self.read_closed;
        if version == Version::Http10 && !client_keep_alive {
            close = true;
        }
        if response.header("connection").map_or(false, |v| {
            headers::is_close(v.as_bytes())
        }) {
            close = true;
        }

        let mut chunked = response
            .header("transfer-encoding")
            .map_or(false, |v| headers::is_chunked(v.as_bytes()));
        if chunked && version == Version::Http10 {
            // cannot chunk to a 1.0 client, fall back to close-framing
            chunked = false;
            close = true;
        }
        if !chunked && size.is_none() && !suppress_body {
            if version == Version::Http11 && response.chunked_on_unknown() {
                chunked = true;
            } else {
                close = true;
            }
        }

        let mut head = String::new();
        if response.icy() {
            head.push_str(&format!("ICY {} {}\r\n", status.0, status.reason()));
        } else {
            head.push_str(&format!(
                "{} {} {}\r\n",
                version.as_str(),
                status.0,
                status.reason()
            ));
        }
        let mut has_cl = false;
        let mut has_conn = false;
        let mut has_date = false;
        let mut has_server = false;
        for (name, value) in response.headers() {
            if name.eq_ignore_ascii_case("transfer-encoding") {
                // replaced below with the framing actually used
                continue;
            }
            if name.eq_ignore_ascii_case("content-length") {
                if chunked {
                    continue;
                }
                has_cl = true;
            }
            has_conn |= name.eq_ignore_ascii_case("connection");
            has_date |= name.eq_ignore_ascii_case("date");
            has_server |= name.eq_ignore_ascii_case("server");
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if chunked {
            head.push_str("Transfer-Encoding: chunked\r\n");
        } else if !has_cl && status.allows_body() {
            if let Some(n) = size {
                head.push_str(&format!("Content-Length: {}\r\n", n));
            }
        }
        if !has_conn {
            if close {
                head.push_str("Connection: close\r\n");
            } else if version == Version::Http10 {
                head.push_str("Connection: keep-alive\r\n");
            }
        }
        if !has_date {
            head.push_str(&format!(
                "Date: {}\r\n",
                httpdate::fmt_http_date(std::time::SystemTime::now())
            ));
        }
        if !has_server {
            if let Some(ref server) = self.server_header {
                head.push_str(&format!("Server: {}\r\n", server));
            }
        }
        head.push_str("\r\n");

        let head_len = head.len();
        let head_off = match self.pool.alloc_from_end(head_len) {
            Ok(off) => off,
            Err(_) => {
                error!("pool exhausted serializing response head for {}", self.addr);
                self.abort(handler, Completion::WithError);
                return;
            }
        };
        self.pool
            .bytes_mut(head_off, head_len)
            .copy_from_slice(head.as_bytes());

        let needs_stage = !suppress_body
            && match response.body() {
                BodySource::Empty => false,
                BodySource::Buffer(_) => chunked,
                BodySource::File { .. } | BodySource::Pull { .. } => true,
            };
        let stage = if needs_stage {
            let desired = match response.body() {
                BodySource::Pull { block_size, .. } => *block_size + CHUNK_OVERHEAD,
                _ => STAGE_SIZE,
            };
            let cap = desired.min(self.pool.free());
            if cap < CHUNK_OVERHEAD + 64 {
                error!("pool exhausted staging response body for {}", self.addr);
                self.abort(handler, Completion::WithError);
                return;
            }
            match self.pool.alloc_from_end(cap) {
                Ok(off) => Some((off, cap)),
                Err(_) => {
                    self.abort(handler, Completion::WithError);
                    return;
                }
            }
        } else {
            None
        };

        self.outgoing = Some(Outgoing {
            response,
            close,
            chunked,
            suppress_body,
            head_off,
            head_len,
            head_sent: 0,
            stage,
            staged: None,
            staged_sent: 0,
            body_pos: 0,
            body_size: size,
            trailer: Vec::new(),
            trailer_sent: 0,
        });
        self.state = State::HeadersSending;
    }

    /// Pushes queued wire bytes to the socket. Returns bytes written.
    fn flush_to_socket(&mut self, handler: &dyn Handler) -> usize {
        let mut total = 0;
        loop {
            if self.write_closed {
                return total;
            }
            match self.state {
                State::ContinueSending => {
                    match self.write_bytes_at(&CONTINUE_100[self.continue_sent..]) {
                        WriteStep::Wrote(n) => {
                            self.continue_sent += n;
                            total += n;
                            if self.continue_sent == CONTINUE_100.len() {
                                self.continue_sent = 0;
                                self.state = State::ContinueSent;
                                return total;
                            }
                        }
                        WriteStep::Blocked => return total,
                        WriteStep::Broken => {
                            self.abort(handler, Completion::ClientAbort);
                            return total;
                        }
                    }
                }
                State::HeadersSending => {
                    let (off, len, sent) = match self.outgoing {
                        Some(ref o) => (o.head_off, o.head_len, o.head_sent),
                        None => return total,
                    };
                    let step = {
                        let data = &self.pool.bytes(off, len)[sent..];
                        write_to(&mut *self.transport, data)
                    };
                    match step {
                        WriteStep::Wrote(n) => {
                            total += n;
                            self.touch();
                            if let Some(ref mut o) = self.outgoing {
                                o.head_sent += n;
                                if o.head_sent == o.head_len {
                                    self.state = State::HeadersSent;
                                    return total;
                                }
                            }
                        }
                        WriteStep::Blocked => return total,
                        WriteStep::Broken => {
                            self.abort(handler, Completion::ClientAbort);
                            return total;
                        }
                    }
                }
                State::NormalBodyReady => match self.push_plain_body(handler) {
                    PushStep::Wrote(n) => total += n,
                    PushStep::Blocked => return total,
                    PushStep::StateChanged => return total,
                },
                State::ChunkedBodyReady => match self.push_chunked_body(handler) {
                    PushStep::Wrote(n) => total += n,
                    PushStep::Blocked => return total,
                    PushStep::StateChanged => return total,
                },
                State::FootersSending => {
                    let step = {
                        let (data, sent) = match self.outgoing {
                            Some(ref o) => (&o.trailer[..], o.trailer_sent),
                            None => return total,
                        };
                        write_to(&mut *self.transport, &data[sent..])
                    };
                    match step {
                        WriteStep::Wrote(n) => {
                            total += n;
                            self.touch();
                            if let Some(ref mut o) = self.outgoing {
                                o.trailer_sent += n;
                                if o.trailer_sent == o.trailer.len() {
                                    self.state = State::FootersSent;
                                    return total;
                                }
                            }
                        }
                        WriteStep::Blocked => return total,
                        WriteStep::Broken => {
                            self.abort(handler, Completion::ClientAbort);
                            return total;
                        }
                    }
                }
                _ => return total,
            }
        }
    }

    fn write_bytes_at(&mut self, data: &[u8]) -> WriteStep {
        let step = write_to(&mut *self.transport, data);
        if let WriteStep::Wrote(_) = step {
            self.touch();
        }
        step
    }

    /// One step of identity body transmission.
    fn push_plain_body(&mut self, handler: &dyn Handler) -> PushStep {
        // staged bytes (file fallback, pull callback) go out first
        if let Some(step) = self.flush_staged(handler) {
            return step;
        }
        // the response is taken out for the step so teardown paths can
        // borrow the whole connection
        let mut out = match self.outgoing.take() {
            Some(o) => o,
            None => {
                self.state = State::Closed;
                return PushStep::StateChanged;
            }
        };
        let step = self.plain_body_step(handler, &mut out);
        if !matches!(self.state, State::Closed) {
            self.outgoing = Some(out);
        }
        step
    }

    fn plain_body_step(&mut self, handler: &dyn Handler, out: &mut Outgoing) -> PushStep {
        match *out.response.body() {
            BodySource::Empty => {
                self.state = State::BodySent;
                PushStep::StateChanged
            }
            BodySource::Buffer(ref data) => {
                let rest = &data[out.body_pos as usize..];
                if rest.is_empty() {
                    self.state = State::BodySent;
                    return PushStep::StateChanged;
                }
                match write_to(&mut *self.transport, rest) {
                    WriteStep::Wrote(n) => {
                        out.body_pos += n as u64;
                        self.last_activity = Instant::now();
                        if out.body_pos == data.len() as u64 {
                            self.state = State::BodySent;
                            return PushStep::StateChanged;
                        }
                        PushStep::Wrote(n)
                    }
                    WriteStep::Blocked => PushStep::Blocked,
                    WriteStep::Broken => {
                        self.abort(handler, Completion::ClientAbort);
                        PushStep::StateChanged
                    }
                }
            }
            BodySource::File {
                ref file,
                offset,
                size,
            } => {
                let remaining = size - out.body_pos;
                if remaining == 0 {
                    self.state = State::BodySent;
                    return PushStep::StateChanged;
                }
                let pos = offset + out.body_pos;
                if !self.no_sendfile {
                    if let Some(fd) = self.transport.sendfile_fd() {
                        match sendfile(fd, file, pos, remaining.min(1 << 20) as usize) {
                            Ok(0) => {
                                debug!("file truncated while sending to {}", self.addr);
                                self.abort(handler, Completion::WithError);
                                return PushStep::StateChanged;
                            }
                            Ok(n) => {
                                out.body_pos += n as u64;
                                self.last_activity = Instant::now();
                                if out.body_pos == size {
                                    self.state = State::BodySent;
                                    return PushStep::StateChanged;
                                }
                                return PushStep::Wrote(n);
                            }
                            Err(ref e) if would_block(e) => return PushStep::Blocked,
                            Err(ref e)
                                if matches!(
                                    e.raw_os_error(),
                                    Some(libc::EINVAL) | Some(libc::ENOSYS)
                                ) =>
                            {
                                self.no_sendfile = true;
                                // fall through to the read path below
                            }
                            Err(e) => {
                                debug!("sendfile to {} failed: {}", self.addr, e);
                                self.abort(handler, Completion::ClientAbort);
                                return PushStep::StateChanged;
                            }
                        }
                    } else {
                        self.no_sendfile = true;
                    }
                }
                // stage a block read from the file
                let Some((stage_off, stage_cap)) = out.stage else {
                    self.abort(handler, Completion::WithError);
                    return PushStep::StateChanged;
                };
                let want = (remaining.min(stage_cap as u64)) as usize;
                let read = {
                    use std::os::unix::fs::FileExt;
                    file.read_at(self.pool.bytes_mut(stage_off, want), pos)
                };
                match read {
                    Ok(0) => {
                        debug!("file truncated while sending to {}", self.addr);
                        self.abort(handler, Completion::WithError);
                        PushStep::StateChanged
                    }
                    Ok(n) => {
                        out.body_pos += n as u64;
                        out.staged = Some((stage_off, n));
                        out.staged_sent = 0;
                        PushStep::Wrote(0)
                    }
                    Err(e) => {
                        debug!("file read failed while sending to {}: {}", self.addr, e);
                        self.abort(handler, Completion::WithError);
                        PushStep::StateChanged
                    }
                }
            }
            BodySource::Pull {
                ref cb,
                block_size: _,
                size,
            } => {
                if let Some(limit) = size {
                    if out.body_pos >= limit {
                        self.state = State::BodySent;
                        return PushStep::StateChanged;
                    }
                }
                let Some((stage_off, stage_cap)) = out.stage else {
                    self.abort(handler, Completion::WithError);
                    return PushStep::StateChanged;
                };
                let mut slot_len = stage_cap;
                if let Some(limit) = size {
                    slot_len = slot_len.min((limit - out.body_pos) as usize);
                }
                let result = {
                    let slot = self.pool.bytes_mut(stage_off, slot_len);
                    match cb.lock() {
                        Ok(mut cb) => (*cb)(out.body_pos, slot),
                        Err(_) => Chunk::Error,
                    }
                };
                match result {
                    Chunk::Data(n) if n > 0 => {
                        let n = n.min(slot_len);
                        out.body_pos += n as u64;
                        out.staged = Some((stage_off, n));
                        out.staged_sent = 0;
                        PushStep::Wrote(0)
                    }
                    Chunk::Data(_) | Chunk::Again => {
                        self.state = State::NormalBodyUnready;
                        PushStep::StateChanged
                    }
                    Chunk::End => {
                        if size.map_or(false, |limit| out.body_pos < limit) {
                            debug!("pull callback ended short of declared size");
                            self.abort(handler, Completion::WithError);
                        } else {
                            self.state = State::BodySent;
                        }
                        PushStep::StateChanged
                    }
                    Chunk::Error => {
                        self.abort(handler, Completion::WithError);
                        PushStep::StateChanged
                    }
                }
            }
        }
    }

    /// One step of chunked body transmission: frame a chunk into the
    /// staging area, then push it.
    fn push_chunked_body(&mut self, handler: &dyn Handler) -> PushStep {
        if let Some(step) = self.flush_staged(handler) {
            return step;
        }
        let mut out = match self.outgoing.take() {
            Some(o) => o,
            None => {
                self.state = State::Closed;
                return PushStep::StateChanged;
            }
        };
        let step = self.chunked_body_step(handler, &mut out);
        if !matches!(self.state, State::Closed) {
            self.outgoing = Some(out);
        }
        step
    }

    fn chunked_body_step(&mut self, handler: &dyn Handler, out: &mut Outgoing) -> PushStep {
        let Some((stage_off, stage_cap)) = out.stage else {
            self.abort(handler, Completion::WithError);
            return PushStep::StateChanged;
        };
        let content_cap = stage_cap - CHUNK_OVERHEAD;
        let data_off = stage_off + CHUNK_HEAD;

        enum Produced {
            Bytes(usize),
            Finished,
            NotReady,
            Failed,
        }
        let produced = match *out.response.body() {
            BodySource::Empty => Produced::Finished,
            BodySource::Buffer(ref data) => {
                let rest = &data[out.body_pos as usize..];
                let n = rest.len().min(content_cap);
                if n == 0 {
                    Produced::Finished
                } else {
                    self.pool
                        .bytes_mut(data_off, n)
                        .copy_from_slice(&rest[..n]);
                    Produced::Bytes(n)
                }
            }
            BodySource::File {
                ref file,
                offset,
                size,
            } => {
                let remaining = (size - out.body_pos) as usize;
                let want = remaining.min(content_cap);
                if want == 0 {
                    Produced::Finished
                } else {
                    use std::os::unix::fs::FileExt;
                    match file.read_at(
                        self.pool.bytes_mut(data_off, want),
                        offset + out.body_pos,
                    ) {
                        Ok(0) => Produced::Failed,
                        Ok(n) => Produced::Bytes(n),
                        Err(_) => Produced::Failed,
                    }
                }
            }
            BodySource::Pull { ref cb, .. } => {
                let slot = self.pool.bytes_mut(data_off, content_cap);
                match cb.lock() {
                    Ok(mut cb) => match (*cb)(out.body_pos, slot) {
                        Chunk::Data(0) | Chunk::Again => Produced::NotReady,
                        Chunk::Data(n) => Produced::Bytes(n.min(content_cap)),
                        Chunk::End => Produced::Finished,
                        Chunk::Error => Produced::Failed,
                    },
                    Err(_) => Produced::Failed,
                }
            }
        };

        match produced {
            Produced::Bytes(n) => {
                out.body_pos += n as u64;
                // chunk-size line ends right where the data starts
                let hdr = format!("{:x}\r\n", n);
                let hdr_start = data_off - hdr.len();
                self.pool
                    .bytes_mut(hdr_start, hdr.len())
                    .copy_from_slice(hdr.as_bytes());
                self.pool
                    .bytes_mut(data_off + n, 2)
                    .copy_from_slice(b"\r\n");
                out.staged = Some((hdr_start, hdr.len() + n + 2));
                out.staged_sent = 0;
                PushStep::Wrote(0)
            }
            Produced::Finished => {
                self.state = State::BodySent;
                PushStep::StateChanged
            }
            Produced::NotReady => {
                self.state = State::ChunkedBodyUnready;
                PushStep::StateChanged
            }
            Produced::Failed => {
                self.abort(handler, Completion::WithError);
                PushStep::StateChanged
            }
        }
    }

    /// Writes out any staged span. `None` means nothing was staged and
    /// the caller should produce more.
    fn flush_staged(&mut self, handler: &dyn Handler) -> Option<PushStep> {
        let (off, len, sent) = match self.outgoing {
            Some(ref o) => match o.staged {
                Some((off, len)) => (off, len, o.staged_sent),
                None => return None,
            },
            None => return None,
        };
        let step = {
            let data = &self.pool.bytes(off, len)[sent..];
            write_to(&mut *self.transport, data)
        };
        match step {
            WriteStep::Wrote(n) => {
                self.touch();
                if let Some(ref mut o) = self.outgoing {
                    o.staged_sent += n;
                    if o.staged_sent == len {
                        o.staged = None;
                        o.staged_sent = 0;
                    }
                }
                Some(PushStep::Wrote(n))
            }
            WriteStep::Blocked => Some(PushStep::Blocked),
            WriteStep::Broken => {
                self.abort(handler, Completion::ClientAbort);
                Some(PushStep::StateChanged)
            }
        }
    }

    /// Response fully on the wire: report completion and either reset
    /// for the next pipelined request or close.
    fn retire(&mut self, handler: &dyn Handler) {
        let close = match self.outgoing.take() {
            Some(o) => o.close,
            None => true,
        };
        let completion = self.error_completion.take().unwrap_or(Completion::Ok);
        if let Some(req) = self.req.take() {
            handler.request_finished(req.app_data, completion);
        }
        if close || self.read_closed {
            self.state = State::Closed;
            return;
        }
        let keep = self.pool.tail_len();
        self.pool.reclaim_keeping_tail_bytes(keep);
        self.continue_sent = 0;
        self.upload_stalled = false;
        self.upload_window = 0;
        self.state = State::Init;
    }
}

enum WriteStep {
    Wrote(usize),
    Blocked,
    Broken,
}

enum PushStep {
    Wrote(usize),
    Blocked,
    StateChanged,
}

fn write_to(transport: &mut dyn Transport, data: &[u8]) -> WriteStep {
    if data.is_empty() {
        return WriteStep::Wrote(0);
    }
    loop {
        match transport.write(data) {
            Ok(0) => return WriteStep::Broken,
            Ok(n) => return WriteStep::Wrote(n),
            Err(ref e) if would_block(e) => return WriteStep::Blocked,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("write error: {}", e);
                return WriteStep::Broken;
            }
        }
    }
}

fn build_trailer(response: &Response) -> Vec<u8> {
    let mut trailer = Vec::from(&b"0\r\n"[..]);
    for (name, value) in response.footers() {
        trailer.extend_from_slice(name.as_bytes());
        trailer.extend_from_slice(b": ");
        trailer.extend_from_slice(value.as_bytes());
        trailer.extend_from_slice(b"\r\n");
    }
    trailer.extend_from_slice(b"\r\n");
    trailer
}

#[cfg(test)]
mod test {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use crate::handler::{Completion, Handler};
    use crate::pool::DEFAULT_POOL_SIZE;
    use crate::request::Request;
    use crate::response::{Chunk, Response};
    use crate::status::Status;

    use super::{Connection, State, Transport};

    struct MockTransport {
        input: Vec<u8>,
        pos: usize,
        eof: bool,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl Read for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.input.len() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MockTransport {
        fn raw_fd(&self) -> i32 {
            -1
        }
    }

    fn conn_with(input: &[u8], eof: bool) -> (Connection, Arc<Mutex<Vec<u8>>>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport {
            input: input.to_vec(),
            pos: 0,
            eof,
            output: output.clone(),
        };
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let conn = Connection::new(
            Box::new(transport),
            addr,
            DEFAULT_POOL_SIZE,
            Some("test-server".into()),
        );
        (conn, output)
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        finished: Mutex<Vec<Completion>>,
        suspend_first: bool,
        respond: Option<Box<dyn Fn(&mut Request) -> Response + Send + Sync>>,
    }

    impl Recorder {
        fn log(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Handler for Recorder {
        fn upload_chunk(&self, request: &mut Request<'_>) -> usize {
            let data = request.upload_data().to_vec();
            self.log(format!("upload:{}", String::from_utf8_lossy(&data)));
            data.len()
        }

        fn request_received(&self, request: &mut Request<'_>) {
            if self.suspend_first && !self.events().contains(&"suspended".to_string()) {
                self.log("suspended".into());
                request.suspend();
                return;
            }
            self.log(format!("recv:{} {}", request.method(), request.url()));
            let response = match self.respond {
                Some(ref f) => f(request),
                None => {
                    let body = format!("echo {}", request.url());
                    Response::from_buffer(Status::OK, body.into_bytes())
                }
            };
            request.queue_response(response).unwrap();
        }

        fn request_finished(
            &self,
            _context: Option<Box<dyn std::any::Any + Send>>,
            completion: Completion,
        ) {
            self.finished.lock().unwrap().push(completion);
        }
    }

    fn output_str(output: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(output.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn simple_get_keeps_alive() {
        let (mut conn, output) = conn_with(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n", false);
        let handler = Recorder::default();
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
        assert!(out.contains("Content-Length: 11\r\n"), "{}", out);
        assert!(out.contains("Server: test-server\r\n"), "{}", out);
        assert!(out.contains("Date: "), "{}", out);
        assert!(out.ends_with("echo /hello"), "{}", out);
        assert_eq!(conn.state, State::Init);
        assert_eq!(handler.finished.lock().unwrap().as_slice(), &[Completion::Ok]);
    }

    #[test]
    fn http10_closes_by_default() {
        let (mut conn, output) = conn_with(b"GET / HTTP/1.0\r\n\r\n", false);
        let handler = Recorder::default();
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"), "{}", out);
        assert!(out.contains("Connection: close\r\n"), "{}", out);
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn http10_keep_alive_honored() {
        let (mut conn, output) =
            conn_with(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", false);
        let handler = Recorder::default();
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.contains("Connection: keep-alive\r\n"), "{}", out);
        assert_eq!(conn.state, State::Init);
    }

    #[test]
    fn missing_host_is_rejected() {
        let (mut conn, output) = conn_with(b"GET / HTTP/1.1\r\n\r\n", false);
        let handler = Recorder::default();
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", out);
        assert_eq!(conn.state, State::Closed);
        assert!(handler.events().is_empty());
        assert_eq!(
            handler.finished.lock().unwrap().as_slice(),
            &[Completion::WithError]
        );
    }

    #[test]
    fn bad_request_line_gets_error_response() {
        let (mut conn, output) = conn_with(b"BROKEN\r\n", false);
        let handler = Recorder::default();
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", out);
        assert!(out.contains("Connection: close\r\n"), "{}", out);
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn query_args_reach_the_handler() {
        let (mut conn, output) =
            conn_with(b"GET /p?name=a+b&x=%31 HTTP/1.1\r\nHost: h\r\n\r\n", false);
        let handler = Recorder {
            respond: Some(Box::new(|req: &mut Request| {
                let name = req.query_arg("name").unwrap_or("?").to_owned();
                let x = req.query_arg("x").unwrap_or("?").to_owned();
                Response::from_buffer(Status::OK, format!("{}|{}", name, x).into_bytes())
            })),
            ..Recorder::default()
        };
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.ends_with("a b|1"), "{}", out);
        assert_eq!(conn.state, State::Init);
    }

    #[test]
    fn head_elides_body_but_keeps_length() {
        let (mut conn, output) = conn_with(b"HEAD /x HTTP/1.1\r\nHost: h\r\n\r\n", false);
        let handler = Recorder::default();
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.contains("Content-Length: 7\r\n"), "{}", out);
        assert!(out.ends_with("\r\n\r\n"), "{}", out);
        assert_eq!(conn.state, State::Init);
    }

    #[test]
    fn identity_upload_is_delivered() {
        let (mut conn, output) = conn_with(
            b"POST /up HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello",
            false,
        );
        let handler = Recorder::default();
        conn.process(&handler);
        let events = handler.events();
        assert!(events.contains(&"upload:hello".to_string()), "{:?}", events);
        assert!(events.contains(&"recv:POST /up".to_string()), "{:?}", events);
        assert!(output_str(&output).starts_with("HTTP/1.1 200"));
        assert_eq!(conn.state, State::Init);
    }

    #[test]
    fn chunked_upload_with_trailer() {
        let (mut conn, output) = conn_with(
            b"POST /c HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6;ext=x\r\n world\r\n0\r\nX-Sum: 11\r\n\r\n",
            false,
        );
        let handler = Recorder {
            respond: Some(Box::new(|req: &mut Request| {
                let footer = req.footer("x-sum").unwrap_or("none").to_owned();
                Response::from_buffer(Status::OK, footer.into_bytes())
            })),
            ..Recorder::default()
        };
        conn.process(&handler);
        let events = handler.events();
        assert!(events.contains(&"upload:hello".to_string()), "{:?}", events);
        assert!(events.contains(&"upload: world".to_string()), "{:?}", events);
        let out = output_str(&output);
        assert!(out.ends_with("11"), "{}", out);
        assert_eq!(conn.state, State::Init);
    }

    #[test]
    fn expect_continue_interim_reply() {
        let (mut conn, output) = conn_with(
            b"PUT /c HTTP/1.1\r\nHost: h\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\nok",
            false,
        );
        let handler = Recorder::default();
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200"), "{}", out);
        assert_eq!(conn.state, State::Init);
    }

    #[test]
    fn pipelined_requests_both_answered() {
        let (mut conn, output) = conn_with(
            b"GET /one HTTP/1.1\r\nHost: h\r\n\r\nGET /two HTTP/1.1\r\nHost: h\r\n\r\n",
            false,
        );
        let handler = Recorder::default();
        conn.process(&handler);
        let events = handler.events();
        assert_eq!(
            events,
            vec!["recv:GET /one".to_string(), "recv:GET /two".to_string()]
        );
        let out = output_str(&output);
        assert!(out.contains("echo /one"), "{}", out);
        assert!(out.ends_with("echo /two"), "{}", out);
        assert_eq!(handler.finished.lock().unwrap().len(), 2);
    }

    #[test]
    fn chunked_response_framing() {
        let (mut conn, output) = conn_with(b"GET /s HTTP/1.1\r\nHost: h\r\n\r\n", false);
        let handler = Recorder {
            respond: Some(Box::new(|_req: &mut Request| {
                let mut sent = false;
                let mut resp = Response::from_callback(Status::OK, None, 512, move |_, buf| {
                    if sent {
                        return Chunk::End;
                    }
                    sent = true;
                    buf[..7].copy_from_slice(b"stream!");
                    Chunk::Data(7)
                });
                resp.add_footer("X-Total", "7").unwrap();
                resp
            })),
            ..Recorder::default()
        };
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.contains("Transfer-Encoding: chunked\r\n"), "{}", out);
        assert!(out.contains("7\r\nstream!\r\n"), "{}", out);
        assert!(out.ends_with("0\r\nX-Total: 7\r\n\r\n"), "{}", out);
        assert_eq!(conn.state, State::Init);
    }

    #[test]
    fn unknown_size_to_http10_close_frames() {
        let (mut conn, output) = conn_with(b"GET /s HTTP/1.0\r\n\r\n", false);
        let handler = Recorder {
            respond: Some(Box::new(|_req: &mut Request| {
                let mut done = false;
                Response::from_callback(Status::OK, None, 512, move |_, buf| {
                    if done {
                        return Chunk::End;
                    }
                    done = true;
                    buf[..4].copy_from_slice(b"data");
                    Chunk::Data(4)
                })
            })),
            ..Recorder::default()
        };
        conn.process(&handler);
        let out = output_str(&output);
        assert!(!out.contains("Transfer-Encoding"), "{}", out);
        assert!(out.contains("Connection: close\r\n"), "{}", out);
        assert!(out.ends_with("data"), "{}", out);
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn oversize_head_answered_431() {
        let mut input = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        input.extend(std::iter::repeat(b'a').take(2048));
        let output = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport {
            input,
            pos: 0,
            eof: false,
            output: output.clone(),
        };
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let mut conn = Connection::new(Box::new(transport), addr, 1024, None);
        let handler = Recorder::default();
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.starts_with("HTTP/1.1 431 "), "{}", out);
        assert_eq!(conn.state, State::Closed);
        assert_eq!(
            handler.finished.lock().unwrap().as_slice(),
            &[Completion::WithError]
        );
    }

    #[test]
    fn file_body_staged_when_sendfile_unavailable() {
        let mut path = std::env::temp_dir();
        path.push(format!("tiny-httpd-file-body-{}", std::process::id()));
        std::fs::write(&path, b"0123456789").unwrap();
        let file = File::open(&path).unwrap();
        let handler = Recorder {
            respond: Some(Box::new(move |_| {
                Response::from_file_at(Status::OK, file.try_clone().unwrap(), 2, 6)
            })),
            ..Recorder::default()
        };
        let (mut conn, output) = conn_with(b"GET /f HTTP/1.1\r\nHost: x\r\n\r\n", false);
        conn.process(&handler);
        std::fs::remove_file(&path).unwrap();
        let out = output_str(&output);
        assert!(out.contains("Content-Length: 6\r\n"), "{}", out);
        assert!(out.ends_with("234567"), "{}", out);
        assert_eq!(handler.finished.lock().unwrap().as_slice(), &[Completion::Ok]);
    }

    #[test]
    fn icy_status_line_on_the_wire() {
        let handler = Recorder {
            respond: Some(Box::new(|_| {
                let mut resp = Response::from_buffer(Status::OK, &b"icecast"[..]);
                resp.set_icy().unwrap();
                resp
            })),
            ..Recorder::default()
        };
        let (mut conn, output) = conn_with(b"GET /stream HTTP/1.0\r\n\r\n", false);
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.starts_with("ICY 200 OK\r\n"), "{}", out);
        assert!(out.ends_with("icecast"), "{}", out);
    }

    #[test]
    fn close_framing_for_unknown_size_body() {
        let handler = Recorder {
            respond: Some(Box::new(|_| {
                let mut sent = false;
                let mut resp = Response::from_callback(Status::OK, None, 64, move |_, slot| {
                    if sent {
                        return Chunk::End;
                    }
                    sent = true;
                    slot[..3].copy_from_slice(b"abc");
                    Chunk::Data(3)
                });
                resp.set_close_framing().unwrap();
                resp
            })),
            ..Recorder::default()
        };
        let (mut conn, output) = conn_with(b"GET /s HTTP/1.1\r\nHost: x\r\n\r\n", false);
        conn.process(&handler);
        let out = output_str(&output);
        assert!(out.contains("Connection: close\r\n"), "{}", out);
        assert!(!out.contains("Transfer-Encoding"), "{}", out);
        assert!(!out.contains("Content-Length"), "{}", out);
        assert!(out.ends_with("\r\n\r\nabc"), "{}", out);
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        let (mut conn, output) = conn_with(
            b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\nContent-Length: 5\r\n\r\nabc",
            false,
        );
        let handler = Recorder::default();
        conn.process(&handler);
        assert!(output_str(&output).starts_with("HTTP/1.1 400"));
        assert_eq!(conn.state, State::Closed);
    }

    #[test]
    fn suspend_then_resume_redelivers() {
        let (mut conn, output) = conn_with(b"GET /later HTTP/1.1\r\nHost: h\r\n\r\n", false);
        let handler = Recorder {
            suspend_first: true,
            ..Recorder::default()
        };
        conn.process(&handler);
        assert_eq!(handler.events(), vec!["suspended".to_string()]);
        assert!(output_str(&output).is_empty());
        assert!(conn.suspended);

        conn.resume();
        conn.process(&handler);
        assert_eq!(
            handler.events(),
            vec!["suspended".to_string(), "recv:GET /later".to_string()]
        );
        assert!(output_str(&output).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn eof_mid_request_reports_read_error() {
        let (mut conn, output) = conn_with(b"GET /partial HTTP/1.1\r\nHos", true);
        let handler = Recorder::default();
        conn.process(&handler);
        assert!(output_str(&output).is_empty());
        assert_eq!(conn.state, State::Closed);
        assert_eq!(
            handler.finished.lock().unwrap().as_slice(),
            &[Completion::ReadError]
        );
    }

    #[test]
    fn clean_eof_between_requests_is_quiet() {
        let (mut conn, _output) = conn_with(b"", true);
        let handler = Recorder::default();
        conn.process(&handler);
        assert_eq!(conn.state, State::Closed);
        assert!(handler.finished.lock().unwrap().is_empty());
    }
}
