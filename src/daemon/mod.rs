//! Daemon lifecycle: configuration, startup, the four scheduling
//! modes, and cross-thread wakeups.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use mio::Token;

use crate::error::StartError;
use crate::handler::Handler;
use crate::pool::DEFAULT_POOL_SIZE;

mod reactor;

use self::reactor::Reactor;

/// Decides whether a new connection from this peer is accepted.
/// Rejected peers are disconnected before any byte is read.
pub type AcceptPolicy = Box<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// How the daemon schedules its connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No threads; the application drives the daemon by watching
    /// [`Daemon::readiness_fd`] and calling [`Daemon::run`].
    External,
    /// One background thread multiplexes every connection.
    Internal,
    /// One thread per accepted connection, each blocking on its own
    /// poller.
    ThreadPerConnection,
    /// N threads, each with its own poller and its own `SO_REUSEPORT`
    /// listener; the kernel spreads accepts across them.
    WorkerPool(usize),
}

/// Configuration shared by every connection of a daemon.
pub(crate) struct Tuning {
    pub timeout: Option<Duration>,
    pub pool_size: usize,
    pub connection_limit: usize,
    pub per_ip_limit: usize,
    pub server_header: Option<Arc<str>>,
    pub accept_policy: Option<AcceptPolicy>,
}

/// State shared between the daemon front object and its reactors.
pub(crate) struct Shared {
    pub handler: Arc<dyn Handler>,
    pub tuning: Tuning,
    shutdown: AtomicBool,
    quiesce: AtomicBool,
    conn_count: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, usize>>,
    notifiers: Mutex<Vec<Arc<Notifier>>>,
    idle: Condvar,
    idle_lock: Mutex<()>,
    returned: Mutex<Vec<std::net::TcpListener>>,
    returned_cv: Condvar,
}

impl Shared {
    fn new(handler: Arc<dyn Handler>, tuning: Tuning) -> Shared {
        Shared {
            handler,
            tuning,
            shutdown: AtomicBool::new(false),
            quiesce: AtomicBool::new(false),
            conn_count: AtomicUsize::new(0),
            per_ip: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(Vec::new()),
            idle: Condvar::new(),
            idle_lock: Mutex::new(()),
            returned: Mutex::new(Vec::new()),
            returned_cv: Condvar::new(),
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn quiesce_requested(&self) -> bool {
        self.quiesce.load(Ordering::SeqCst)
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    fn request_quiesce(&self) {
        self.quiesce.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    pub(crate) fn add_notifier(&self, notifier: &Arc<Notifier>) {
        self.notifiers.lock().unwrap_or_else(|e| e.into_inner()).push(notifier.clone());
    }

    pub(crate) fn remove_notifier(&self, notifier: &Arc<Notifier>) {
        self.notifiers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|n| !Arc::ptr_eq(n, notifier));
    }

    fn wake_all(&self) {
        for n in self.notifiers.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            n.wake();
        }
    }

    /// Admission control for a new connection, in order: global limit,
    /// per-IP limit, application policy. Books the slot on success.
    pub(crate) fn try_admit(&self, addr: SocketAddr) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let limit = self.tuning.connection_limit;
        let admitted = self
            .conn_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n < limit {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if !admitted {
            debug!("connection limit reached, dropping {}", addr);
            return false;
        }
        if self.tuning.per_ip_limit > 0 {
            let mut per_ip = self.per_ip.lock().unwrap_or_else(|e| e.into_inner());
            let count = per_ip.entry(addr.ip()).or_insert(0);
            if *count >= self.tuning.per_ip_limit {
                drop(per_ip);
                self.conn_count.fetch_sub(1, Ordering::SeqCst);
                debug!("per-IP limit reached, dropping {}", addr);
                return false;
            }
            *count += 1;
        }
        if let Some(ref policy) = self.tuning.accept_policy {
            if !policy(addr) {
                self.release(addr.ip(), true);
                debug!("accept policy rejected {}", addr);
                return false;
            }
        }
        true
    }

    /// Gives a connection slot back. `counted` is false when the
    /// connection already returned its global slot by suspending.
    pub(crate) fn release(&self, ip: IpAddr, counted: bool) {
        if self.tuning.per_ip_limit > 0 {
            let mut per_ip = self.per_ip.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(count) = per_ip.get_mut(&ip) {
                *count -= 1;
                if *count == 0 {
                    per_ip.remove(&ip);
                }
            }
        }
        if counted {
            self.conn_count.fetch_sub(1, Ordering::SeqCst);
        }
        self.idle.notify_all();
    }

    /// A suspended connection stops counting against the global limit;
    /// its per-IP count keeps applying.
    pub(crate) fn park_slot(&self) {
        self.conn_count.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_all();
    }

    /// Re-books the global slot on resume. The count may momentarily
    /// exceed the limit; new accepts stall until it drops back.
    pub(crate) fn unpark_slot(&self) {
        self.conn_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Blocks until every connection has been torn down.
    fn wait_idle(&self) {
        let mut guard = self.idle_lock.lock().unwrap_or_else(|e| e.into_inner());
        while self.conn_count.load(Ordering::SeqCst) > 0 {
            let (g, _) = self
                .idle
                .wait_timeout(guard, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }

    pub(crate) fn push_listener(&self, listener: std::net::TcpListener) {
        self.returned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
        self.returned_cv.notify_all();
    }

    fn wait_listeners(&self, n: usize) -> Vec<std::net::TcpListener> {
        let mut returned = self.returned.lock().unwrap_or_else(|e| e.into_inner());
        while returned.len() < n {
            let (g, _) = self
                .returned_cv
                .wait_timeout(returned, Duration::from_millis(50))
                .unwrap_or_else(|e| e.into_inner());
            returned = g;
        }
        returned.drain(..).collect()
    }
}

/// Wakes a reactor from any thread and carries resume requests to it.
pub(crate) struct Notifier {
    waker: mio::Waker,
    resumed: Mutex<Vec<Token>>,
}

impl Notifier {
    pub(crate) fn new(waker: mio::Waker) -> Notifier {
        Notifier {
            waker,
            resumed: Mutex::new(Vec::new()),
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("reactor wakeup failed: {}", e);
        }
    }

    fn resume(&self, token: Token) {
        self.resumed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(token);
        self.wake();
    }

    pub(crate) fn drain(&self) -> Vec<Token> {
        std::mem::take(&mut *self.resumed.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Cheap cloneable handle to one connection, valid across threads.
/// Obtained through [`Request::handle`](crate::Request::handle).
#[derive(Clone)]
pub struct ConnectionHandle {
    pub(crate) notifier: Arc<Notifier>,
    pub(crate) token: Token,
}

impl ConnectionHandle {
    /// Puts a suspended connection back into event processing. Safe to
    /// call at any time; resuming a connection that is not suspended is
    /// a no-op, resuming one that is already gone is ignored.
    pub fn resume(&self) {
        self.notifier.resume(self.token);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ConnectionHandle").field(&self.token.0).finish()
    }
}

/// Daemon configuration, consumed by [`Builder::start`].
pub struct Builder {
    addr: SocketAddr,
    mode: Mode,
    timeout: Option<Duration>,
    pool_size: usize,
    connection_limit: usize,
    per_ip_limit: usize,
    server_header: Option<String>,
    accept_policy: Option<AcceptPolicy>,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            addr: "0.0.0.0:8080".parse().expect("static address"),
            mode: Mode::Internal,
            timeout: Some(Duration::from_secs(30)),
            pool_size: DEFAULT_POOL_SIZE,
            connection_limit: 1024,
            per_ip_limit: 0,
            server_header: Some(concat!("tiny-httpd/", env!("CARGO_PKG_VERSION")).to_owned()),
            accept_policy: None,
        }
    }

    /// Address to listen on. Port zero picks a free port, reported by
    /// [`Daemon::local_addr`] after start.
    pub fn bind(mut self, addr: SocketAddr) -> Builder {
        self.addr = addr;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Builder {
        self.mode = mode;
        self
    }

    /// Idle timeout per connection; `None` disables the sweep.
    /// Suspended connections are exempt.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Builder {
        self.timeout = timeout;
        self
    }

    /// Per-connection memory pool size. The whole request head must fit
    /// into it.
    pub fn pool_size(mut self, size: usize) -> Builder {
        self.pool_size = size;
        self
    }

    /// Maximum simultaneously open connections; excess accepts are
    /// dropped immediately.
    pub fn connection_limit(mut self, limit: usize) -> Builder {
        self.connection_limit = limit;
        self
    }

    /// Maximum simultaneous connections per client IP; zero disables
    /// the check.
    pub fn per_ip_limit(mut self, limit: usize) -> Builder {
        self.per_ip_limit = limit;
        self
    }

    /// Value for the auto-added `Server` header.
    pub fn server_header(mut self, value: impl Into<String>) -> Builder {
        self.server_header = Some(value.into());
        self
    }

    /// Suppresses the auto-added `Server` header entirely.
    pub fn no_server_header(mut self) -> Builder {
        self.server_header = None;
        self
    }

    pub fn accept_policy<F>(mut self, policy: F) -> Builder
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.accept_policy = Some(Box::new(policy));
        self
    }

    /// Binds the listener(s) and starts the daemon in the configured
    /// mode.
    pub fn start<H: Handler>(self, handler: H) -> Result<Daemon, StartError> {
        if self.pool_size < 256 {
            return Err(StartError::BadConfig("pool size below 256 bytes"));
        }
        if self.connection_limit == 0 {
            return Err(StartError::BadConfig("connection limit of zero"));
        }
        if let Mode::WorkerPool(0) = self.mode {
            return Err(StartError::BadConfig("worker pool of zero threads"));
        }

        let tuning = Tuning {
            timeout: self.timeout,
            pool_size: self.pool_size,
            connection_limit: self.connection_limit,
            per_ip_limit: self.per_ip_limit,
            server_header: self.server_header.map(Arc::from),
            accept_policy: self.accept_policy,
        };
        let shared = Arc::new(Shared::new(Arc::new(handler), tuning));

        let mut threads = Vec::new();
        let mut front_reactor = None;
        let listener_count;
        let local_addr;

        match self.mode {
            Mode::External => {
                let listener = reactor::bind_listener(self.addr, false)?;
                local_addr = listener.local_addr()?;
                listener_count = 1;
                front_reactor = Some(Reactor::new(Some(listener), shared.clone())?);
            }
            Mode::Internal => {
                let listener = reactor::bind_listener(self.addr, false)?;
                local_addr = listener.local_addr()?;
                listener_count = 1;
                let mut r = Reactor::new(Some(listener), shared.clone())?;
                threads.push(
                    thread::Builder::new()
                        .name("tiny-httpd".to_owned())
                        .spawn(move || r.run_loop())?,
                );
            }
            Mode::ThreadPerConnection => {
                let listener = reactor::bind_listener(self.addr, false)?;
                local_addr = listener.local_addr()?;
                listener_count = 1;
                let shared = shared.clone();
                threads.push(
                    thread::Builder::new()
                        .name("tiny-httpd-accept".to_owned())
                        .spawn(move || reactor::run_acceptor(listener, shared))?,
                );
            }
            Mode::WorkerPool(n) => {
                listener_count = n;
                let first = reactor::bind_listener(self.addr, true)?;
                local_addr = first.local_addr()?;
                let mut listeners = vec![first];
                for _ in 1..n {
                    listeners.push(reactor::bind_listener(local_addr, true)?);
                }
                for (i, listener) in listeners.into_iter().enumerate() {
                    let mut r = Reactor::new(Some(listener), shared.clone())?;
                    threads.push(
                        thread::Builder::new()
                            .name(format!("tiny-httpd-{}", i))
                            .spawn(move || r.run_loop())?,
                    );
                }
            }
        }

        info!("daemon listening on {} ({:?})", local_addr, self.mode);
        Ok(Daemon {
            shared,
            local_addr,
            listener_count,
            reactor: front_reactor,
            threads,
            stopped: false,
        })
    }
}

/// A running server. Dropping it stops it.
pub struct Daemon {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    listener_count: usize,
    /// Present in [`Mode::External`] only.
    reactor: Option<Reactor>,
    threads: Vec<thread::JoinHandle<()>>,
    stopped: bool,
}

impl Daemon {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// External mode: descriptor that becomes readable whenever the
    /// daemon has work, suitable for the application's own poll set.
    pub fn readiness_fd(&self) -> Option<RawFd> {
        self.reactor.as_ref().map(|r| r.readiness_fd())
    }

    /// External mode: how long until the earliest connection timeout is
    /// due, as an upper bound for the application's poll wait.
    pub fn next_timeout(&self) -> Option<Duration> {
        self.reactor.as_ref().and_then(|r| r.next_timeout())
    }

    /// External mode: performs one non-blocking scheduling iteration.
    /// Call when [`Daemon::readiness_fd`] signals or the timeout from
    /// [`Daemon::next_timeout`] elapses.
    pub fn run(&mut self) -> io::Result<()> {
        match self.reactor {
            Some(ref mut r) => r.run_once(Some(Duration::ZERO)),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "daemon runs its own threads",
            )),
        }
    }

    /// Stops accepting new connections and hands the listener socket(s)
    /// back, still bound. Existing connections keep being served.
    pub fn quiesce(&mut self) -> Vec<std::net::TcpListener> {
        if self.shared.quiesce_requested() {
            return Vec::new();
        }
        self.shared.request_quiesce();
        if let Some(ref mut r) = self.reactor {
            if let Err(e) = r.run_once(Some(Duration::ZERO)) {
                warn!("poll failed during quiesce: {}", e);
            }
        }
        self.shared.wait_listeners(self.listener_count)
    }

    /// Shuts the daemon down: in-flight requests complete with
    /// `DaemonShutdown`, threads are joined, sockets closed.
    pub fn stop(self) {
        // Drop does the work; stop() is the explicit spelling.
    }

    fn shutdown_impl(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.request_shutdown();
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                warn!("daemon thread panicked");
            }
        }
        if let Some(mut r) = self.reactor.take() {
            r.teardown();
        }
        // thread-per-connection workers are detached; wait them out
        self.shared.wait_idle();
        debug!("daemon on {} stopped", self.local_addr);
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}
