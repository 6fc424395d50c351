//! Event loops. One [`Reactor`] multiplexes a listener plus its
//! connections over a `mio::Poll`; thread-per-connection mode instead
//! runs a tiny poll loop per socket.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::connection::Connection;
use crate::handler::Completion;

use super::{ConnectionHandle, Notifier, Shared};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN: usize = 2;

/// Binds a nonblocking listener. `reuse_port` lets the worker-pool
/// mode bind one listener per thread on the same address, with the
/// kernel balancing accepts.
pub(crate) fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into()))
}

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    conns: HashMap<usize, Connection>,
    notifier: Arc<Notifier>,
    shared: Arc<Shared>,
    next_token: usize,
}

impl Reactor {
    pub(crate) fn new(listener: Option<TcpListener>, shared: Arc<Shared>) -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let mut listener = listener;
        if let Some(ref mut l) = listener {
            poll.registry().register(l, LISTENER, Interest::READABLE)?;
        }
        let waker = Waker::new(poll.registry(), WAKER)?;
        let notifier = Arc::new(Notifier::new(waker));
        shared.add_notifier(&notifier);
        Ok(Reactor {
            poll,
            events: Events::with_capacity(256),
            listener,
            conns: HashMap::new(),
            notifier,
            shared,
            next_token: FIRST_CONN,
        })
    }

    pub(crate) fn readiness_fd(&self) -> RawFd {
        self.poll.as_raw_fd()
    }

    /// Time until the earliest connection timeout fires. Suspended
    /// connections never time out.
    pub(crate) fn next_timeout(&self) -> Option<Duration> {
        let timeout = self.shared.tuning.timeout?;
        let now = Instant::now();
        self.conns
            .values()
            .filter(|c| !c.suspended)
            .map(|c| (c.last_activity() + timeout).saturating_duration_since(now))
            .min()
    }

    /// Blocks in the poll loop until shutdown.
    pub(crate) fn run_loop(&mut self) {
        while !self.shared.is_shutdown() {
            let timeout = self.next_timeout();
            if let Err(e) = self.run_once(timeout) {
                warn!("poll failed: {}", e);
                break;
            }
        }
        self.teardown();
    }

    /// One scheduling iteration: poll, accept, dispatch readiness,
    /// apply resumes, sweep timeouts.
    pub(crate) fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        let mut accept = false;
        let mut ready = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                LISTENER => accept = true,
                WAKER => {}
                Token(t) => ready.push(t),
            }
        }
        if accept {
            self.accept_ready();
        }
        for t in ready {
            self.process_conn(t);
        }
        for token in self.notifier.drain() {
            if let Some(conn) = self.conns.get_mut(&token.0) {
                conn.resume();
            }
            self.process_conn(token.0);
        }
        if self.shared.quiesce_requested() {
            self.surrender_listener();
        }
        self.sweep_timeouts();
        Ok(())
    }

    fn accept_ready(&mut self) {
        loop {
            let accepted = match self.listener {
                Some(ref mut l) => l.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        if !self.shared.try_admit(addr) {
            // dropping the stream closes it
            return;
        }
        let _ = stream.set_nodelay(true);
        let token = self.next_token;
        self.next_token += 1;
        let fd = stream.as_raw_fd();
        if let Err(e) = self.poll.registry().register(
            &mut SourceFd(&fd),
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!("registering {} failed: {}", addr, e);
            self.shared.release(addr.ip(), true);
            return;
        }
        trace!("accepted {} as token {}", addr, token);
        let mut conn = Connection::new(
            Box::new(stream),
            addr,
            self.shared.tuning.pool_size,
            self.shared.tuning.server_header.clone(),
        );
        conn.set_wake(ConnectionHandle {
            notifier: self.notifier.clone(),
            token: Token(token),
        });
        self.conns.insert(token, conn);
        // the client may have sent its request already
        self.process_conn(token);
    }

    fn process_conn(&mut self, token: usize) {
        let conn = match self.conns.get_mut(&token) {
            Some(c) => c,
            None => return,
        };
        if conn.suspended {
            return;
        }
        if !conn.holds_slot {
            self.shared.unpark_slot();
            conn.holds_slot = true;
        }
        conn.process(self.shared.handler.as_ref());
        if conn.suspended && conn.holds_slot {
            self.shared.park_slot();
            conn.holds_slot = false;
        }
        if conn.is_closed() {
            self.remove_conn(token);
        }
    }

    fn remove_conn(&mut self, token: usize) {
        if let Some(conn) = self.conns.remove(&token) {
            let fd = conn.raw_fd();
            if fd >= 0 {
                let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
            }
            self.shared.release(conn.addr.ip(), conn.holds_slot);
            trace!("closed token {}", token);
        }
    }

    fn sweep_timeouts(&mut self) {
        let timeout = match self.shared.tuning.timeout {
            Some(t) => t,
            None => return,
        };
        let now = Instant::now();
        let due: Vec<usize> = self
            .conns
            .iter()
            .filter(|(_, c)| !c.suspended && now.duration_since(c.last_activity()) >= timeout)
            .map(|(&t, _)| t)
            .collect();
        for token in due {
            debug!("connection token {} timed out", token);
            if let Some(conn) = self.conns.get_mut(&token) {
                conn.close_with(self.shared.handler.as_ref(), Completion::TimeoutReached);
            }
            self.remove_conn(token);
        }
    }

    /// Quiesce: deregister the listener and hand it back through the
    /// shared state, still bound and nonblocking.
    fn surrender_listener(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
            let std_listener =
                unsafe { std::net::TcpListener::from_raw_fd(listener.into_raw_fd()) };
            self.shared.push_listener(std_listener);
        }
    }

    /// Closes every connection with `DaemonShutdown`.
    pub(crate) fn teardown(&mut self) {
        let tokens: Vec<usize> = self.conns.keys().copied().collect();
        for token in tokens {
            if let Some(conn) = self.conns.get_mut(&token) {
                conn.close_with(self.shared.handler.as_ref(), Completion::DaemonShutdown);
            }
            self.remove_conn(token);
        }
        // a quiesce that raced the shutdown still gets its listener back
        if self.shared.quiesce_requested() {
            self.surrender_listener();
        } else {
            self.listener = None;
        }
        self.shared.remove_notifier(&self.notifier);
    }
}

/// Accept loop for thread-per-connection mode. Each admitted socket
/// gets its own thread running [`run_connection`].
pub(crate) fn run_acceptor(listener: TcpListener, shared: Arc<Shared>) {
    let mut listener = Some(listener);
    let poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            warn!("acceptor poll setup failed: {}", e);
            return;
        }
    };
    if let Some(ref mut l) = listener {
        if let Err(e) = poll.registry().register(l, LISTENER, Interest::READABLE) {
            warn!("acceptor registration failed: {}", e);
            return;
        }
    }
    let waker = match Waker::new(poll.registry(), WAKER) {
        Ok(w) => w,
        Err(e) => {
            warn!("acceptor waker setup failed: {}", e);
            return;
        }
    };
    let notifier = Arc::new(Notifier::new(waker));
    shared.add_notifier(&notifier);

    let mut poll = poll;
    let mut events = Events::with_capacity(8);
    while !shared.is_shutdown() {
        if shared.quiesce_requested() {
            if let Some(mut l) = listener.take() {
                let _ = poll.registry().deregister(&mut l);
                let std_listener =
                    unsafe { std::net::TcpListener::from_raw_fd(l.into_raw_fd()) };
                shared.push_listener(std_listener);
            }
        }
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("acceptor poll failed: {}", e);
                break;
            }
        }
        loop {
            let accepted = match listener {
                Some(ref mut l) => l.accept(),
                None => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if !shared.try_admit(addr) {
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    let shared = shared.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("tiny-httpd-{}", addr))
                        .spawn(move || run_connection(stream, addr, shared));
                    if let Err(e) = spawned {
                        warn!("spawning connection thread failed: {}", e);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }
    if shared.quiesce_requested() {
        if let Some(mut l) = listener.take() {
            let _ = poll.registry().deregister(&mut l);
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(l.into_raw_fd()) };
            shared.push_listener(std_listener);
        }
    }
    shared.remove_notifier(&notifier);
}

/// Dedicated poll loop for one connection (thread-per-connection
/// mode). The thread parks in its own poller, also while the
/// connection is suspended, and is woken through the notifier.
fn run_connection(stream: TcpStream, addr: SocketAddr, shared: Arc<Shared>) {
    const CONN: Token = Token(0);
    let fd = stream.as_raw_fd();
    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            warn!("poll setup for {} failed: {}", addr, e);
            shared.release(addr.ip(), true);
            return;
        }
    };
    let registered = poll.registry().register(
        &mut SourceFd(&fd),
        CONN,
        Interest::READABLE | Interest::WRITABLE,
    );
    if let Err(e) = registered {
        warn!("registering {} failed: {}", addr, e);
        shared.release(addr.ip(), true);
        return;
    }
    let waker = match Waker::new(poll.registry(), WAKER) {
        Ok(w) => w,
        Err(e) => {
            warn!("waker setup for {} failed: {}", addr, e);
            shared.release(addr.ip(), true);
            return;
        }
    };
    let notifier = Arc::new(Notifier::new(waker));
    shared.add_notifier(&notifier);

    let mut conn = Connection::new(
        Box::new(stream),
        addr,
        shared.tuning.pool_size,
        shared.tuning.server_header.clone(),
    );
    conn.set_wake(ConnectionHandle {
        notifier: notifier.clone(),
        token: CONN,
    });

    let mut events = Events::with_capacity(8);
    loop {
        if shared.is_shutdown() {
            conn.close_with(shared.handler.as_ref(), Completion::DaemonShutdown);
            break;
        }
        for token in notifier.drain() {
            if token == CONN {
                conn.resume();
            }
        }
        if !conn.suspended {
            if !conn.holds_slot {
                shared.unpark_slot();
                conn.holds_slot = true;
            }
            conn.process(shared.handler.as_ref());
        }
        if conn.suspended && conn.holds_slot {
            shared.park_slot();
            conn.holds_slot = false;
        }
        if conn.is_closed() {
            break;
        }
        let timeout = if conn.suspended {
            None
        } else {
            shared.tuning.timeout.map(|t| {
                (conn.last_activity() + t).saturating_duration_since(Instant::now())
            })
        };
        if timeout == Some(Duration::ZERO) {
            conn.close_with(shared.handler.as_ref(), Completion::TimeoutReached);
            break;
        }
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("poll for {} failed: {}", addr, e);
                conn.close_with(shared.handler.as_ref(), Completion::WithError);
                break;
            }
        }
        if let Some(t) = shared.tuning.timeout {
            if !conn.suspended && Instant::now().duration_since(conn.last_activity()) >= t {
                conn.close_with(shared.handler.as_ref(), Completion::TimeoutReached);
                break;
            }
        }
    }
    let _ = poll.registry().deregister(&mut SourceFd(&fd));
    shared.remove_notifier(&notifier);
    shared.release(addr.ip(), conn.holds_slot);
}
