//! A small readiness reactor over `mio`.
//!
//! [`Core`] owns the poll loop; a cloneable [`Handle`] is what
//! everything else touches: listeners, outbound connects, and
//! cancellable timers. Dispatch is single-threaded and cooperative:
//! one callback runs to completion at a time and none may block.
//!
//! Any reactor offering the same surface (readable/writable edges
//! into [`TcpConn`], timers, connects) can stand in for this one;
//! the protocol layers only see [`crate::conn::Transport`] and
//! [`Handle`].

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;

use crate::conn::{TcpConn, Transport};

/// A cancellable timer handle returned by [`Handle::timeout`].
pub struct Timeout {
    cancelled: Rc<Cell<bool>>,
}

impl Timeout {
    /// A handle to nothing; cancelling it is a no-op.
    pub(crate) fn idle() -> Timeout {
        Timeout { cancelled: Rc::new(Cell::new(true)) }
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }
}

struct TimerEntry {
    at: Instant,
    seq: u64,
    cancelled: Rc<Cell<bool>>,
    cb: Box<dyn FnOnce()>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        // Reversed so the max-heap yields the earliest deadline, with
        // FIFO order between timers at the same instant.
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

struct Pending {
    sock: TcpStream,
    host: String,
    port: u16,
    connect: Box<dyn FnOnce(Rc<TcpConn>)>,
    error: Box<dyn FnOnce(String)>,
    timer: Timeout,
}

enum Entry {
    Listener {
        sock: TcpListener,
        accept: Box<dyn FnMut(Rc<TcpConn>)>,
    },
    Connecting(Option<Pending>),
    Stream(Rc<TcpConn>),
    /// Placeholder while an entry is temporarily taken out for
    /// dispatch.
    Hold,
}

struct Inner {
    registry: Registry,
    entries: Slab<Entry>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    running: bool,
}

/// The event loop. Create one, grab a [`Handle`], set up listeners
/// and clients, then [`Core::run`].
pub struct Core {
    poll: Poll,
    events: Events,
    inner: Rc<RefCell<Inner>>,
    dead: Rc<RefCell<Vec<Token>>>,
}

/// A cheap reference to the reactor, usable from inside callbacks.
#[derive(Clone)]
pub struct Handle {
    inner: Weak<RefCell<Inner>>,
    dead: Weak<RefCell<Vec<Token>>>,
}

struct MioTransport {
    sock: TcpStream,
    registry: Registry,
    token: Token,
    dead: Weak<RefCell<Vec<Token>>>,
    read: bool,
    write: bool,
    registered: bool,
    closed: bool,
}

impl io::Read for MioTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.sock, buf)
    }
}

impl io::Write for MioTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut self.sock, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        io::Write::flush(&mut self.sock)
    }
}

impl Transport for MioTransport {
    fn arm(&mut self, read: bool, write: bool) -> io::Result<()> {
        if self.closed || (read == self.read && write == self.write) {
            return Ok(());
        }
        self.read = read;
        self.write = write;
        if !read && !write {
            if self.registered {
                self.registry.deregister(&mut self.sock)?;
                self.registered = false;
            }
            return Ok(());
        }
        let interest = match (read, write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => unreachable!(),
        };
        if self.registered {
            self.registry.reregister(&mut self.sock, self.token, interest)
        } else {
            self.registered = true;
            self.registry.register(&mut self.sock, self.token, interest)
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.registered {
            let _ = self.registry.deregister(&mut self.sock);
            self.registered = false;
        }
        let _ = self.sock.shutdown(Shutdown::Both);
        if let Some(dead) = self.dead.upgrade() {
            dead.borrow_mut().push(self.token);
        }
    }
}

impl Core {
    pub fn new() -> io::Result<Core> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Core {
            poll: poll,
            events: Events::with_capacity(256),
            inner: Rc::new(RefCell::new(Inner {
                registry: registry,
                entries: Slab::new(),
                timers: BinaryHeap::new(),
                timer_seq: 0,
                running: false,
            })),
            dead: Rc::new(RefCell::new(Vec::new())),
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            inner: Rc::downgrade(&self.inner),
            dead: Rc::downgrade(&self.dead),
        }
    }

    /// Run until [`Handle::stop`] is called or there is nothing left
    /// to wait for.
    pub fn run(&mut self) {
        self.inner.borrow_mut().running = true;
        loop {
            let timeout = {
                let inner = self.inner.borrow();
                if !inner.running {
                    break;
                }
                if inner.entries.is_empty() && inner.timers.is_empty() {
                    break;
                }
                inner.timers.peek().map(|t| {
                    t.at.saturating_duration_since(Instant::now())
                })
            };
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("poll failed: {}", e);
                break;
            }
            // Error and hup conditions are folded into both edges so
            // failed connects and resets reach their handlers.
            let ready: Vec<(Token, bool, bool)> = self.events.iter()
                .map(|ev| {
                    (ev.token(),
                     ev.is_readable() || ev.is_error()
                        || ev.is_read_closed(),
                     ev.is_writable() || ev.is_error()
                        || ev.is_write_closed())
                })
                .collect();
            for (token, readable, writable) in ready {
                self.dispatch(token, readable, writable);
            }
            self.fire_timers();
            self.sweep();
        }
        self.inner.borrow_mut().running = false;
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        enum Target {
            Conn(Rc<TcpConn>),
            Listener,
            Connect,
            Gone,
        }
        let target = {
            let inner = self.inner.borrow();
            match inner.entries.get(token.0) {
                Some(&Entry::Stream(ref conn)) => Target::Conn(conn.clone()),
                Some(&Entry::Listener { .. }) => Target::Listener,
                Some(&Entry::Connecting(..)) => Target::Connect,
                Some(&Entry::Hold) | None => Target::Gone,
            }
        };
        match target {
            Target::Conn(conn) => {
                if writable {
                    conn.on_writable();
                }
                if readable {
                    conn.on_readable();
                }
            }
            Target::Listener => self.do_accept(token),
            Target::Connect => {
                if writable || readable {
                    self.finish_connect(token);
                }
            }
            Target::Gone => {}
        }
    }

    fn do_accept(&mut self, token: Token) {
        // Take the listener out of the slab so its callback is free
        // to use the handle.
        let taken = {
            let mut inner = self.inner.borrow_mut();
            match inner.entries.get_mut(token.0) {
                Some(entry @ &mut Entry::Listener { .. }) => {
                    mem::replace(entry, Entry::Hold)
                }
                _ => return,
            }
        };
        let (sock, mut accept) = match taken {
            Entry::Listener { sock, accept } => (sock, accept),
            _ => unreachable!(),
        };
        loop {
            match sock.accept() {
                Ok((stream, peer)) => {
                    let host = peer.ip().to_string();
                    match self.register_stream(stream, &host, peer.port()) {
                        Ok(conn) => accept(conn),
                        Err(e) => warn!("cannot register accepted \
                            connection: {}", e),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entries.get_mut(token.0) {
            if matches!(*entry, Entry::Hold) {
                *entry = Entry::Listener { sock: sock, accept: accept };
            }
        }
    }

    fn register_stream(&self, stream: TcpStream, host: &str, port: u16)
        -> io::Result<Rc<TcpConn>>
    {
        let mut stream = stream;
        let handle = self.handle();
        let (token, registry) = {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;
            let vacant = inner.entries.vacant_entry();
            let token = Token(vacant.key());
            inner.registry.register(&mut stream, token,
                Interest::READABLE)?;
            vacant.insert(Entry::Hold);
            (token, inner.registry.try_clone()?)
        };
        let transport = MioTransport {
            sock: stream,
            registry: registry,
            token: token,
            dead: Rc::downgrade(&self.dead),
            read: true,
            write: false,
            registered: true,
            closed: false,
        };
        let conn = TcpConn::new(Box::new(transport), host, port, handle);
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.entries.get_mut(token.0) {
            *entry = Entry::Stream(conn.clone());
        }
        Ok(conn)
    }

    fn finish_connect(&mut self, token: Token) {
        let pending = {
            let mut inner = self.inner.borrow_mut();
            match inner.entries.get_mut(token.0) {
                Some(&mut Entry::Connecting(ref mut p)) => p.take(),
                _ => return,
            }
        };
        let pending = match pending {
            Some(p) => p,
            None => return,
        };
        let so_error = pending.sock.take_error().unwrap_or(None);
        if so_error.is_none() {
            match pending.sock.peer_addr() {
                Ok(_) => {
                    pending.timer.cancel();
                    self.promote(token, pending);
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected
                    || e.raw_os_error() == Some(115 /* EINPROGRESS */) =>
                {
                    // Spurious wakeup; keep waiting for the connect.
                    let mut inner = self.inner.borrow_mut();
                    if let Some(&mut Entry::Connecting(ref mut p)) =
                        inner.entries.get_mut(token.0)
                    {
                        *p = Some(pending);
                    }
                    return;
                }
                Err(e) => self.fail_connect(token, pending, e),
            }
        } else {
            let e = so_error.unwrap();
            self.fail_connect(token, pending, e);
        }
    }

    fn promote(&mut self, token: Token, pending: Pending) {
        let Pending { sock, host, port, connect, error, .. } = pending;
        let registry = {
            let inner = self.inner.borrow();
            inner.registry.try_clone()
        };
        let registry = match registry {
            Ok(r) => r,
            Err(e) => {
                self.inner.borrow_mut().entries.remove(token.0);
                error(format!("{}", e));
                return;
            }
        };
        let transport = MioTransport {
            sock: sock,
            registry: registry,
            token: token,
            dead: Rc::downgrade(&self.dead),
            read: false,
            write: true,
            registered: true,
            closed: false,
        };
        // TcpConn::new rearms the transport for reading.
        let conn = TcpConn::new(Box::new(transport), &host, port,
            self.handle());
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(entry) = inner.entries.get_mut(token.0) {
                *entry = Entry::Stream(conn.clone());
            }
        }
        debug!("connected to {}:{}", host, port);
        connect(conn);
    }

    fn fail_connect(&mut self, token: Token, pending: Pending,
        err: io::Error)
    {
        let Pending { mut sock, host, port, error, timer, .. } = pending;
        timer.cancel();
        {
            let mut inner = self.inner.borrow_mut();
            let _ = inner.registry.deregister(&mut sock);
            if inner.entries.contains(token.0) {
                inner.entries.remove(token.0);
            }
        }
        debug!("connect to {}:{} failed: {}", host, port, err);
        error(format!("{}", err));
    }

    fn fire_timers(&mut self) {
        loop {
            let entry = {
                let mut inner = self.inner.borrow_mut();
                let due = match inner.timers.peek() {
                    Some(t) => t.at <= Instant::now(),
                    None => false,
                };
                if due { inner.timers.pop() } else { None }
            };
            match entry {
                Some(t) => {
                    if !t.cancelled.get() {
                        (t.cb)();
                    }
                }
                None => return,
            }
        }
    }

    fn sweep(&mut self) {
        let mut removed = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            let mut dead = self.dead.borrow_mut();
            for token in dead.drain(..) {
                if inner.entries.contains(token.0) {
                    removed.push(inner.entries.remove(token.0));
                }
            }
        }
        // Entries are dropped outside the borrow: dropping a
        // connection releases its callbacks, which may own protocol
        // state with handles back into the reactor.
        drop(removed);
    }
}

impl Handle {
    /// Stop the loop after the current turn.
    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().running = false;
        }
    }

    /// Schedule `f` to run once after `delay`. Timers with the same
    /// deadline fire in the order they were scheduled.
    pub fn timeout<F>(&self, delay: Duration, f: F) -> Timeout
        where F: FnOnce() + 'static
    {
        let inner = match self.inner.upgrade() {
            Some(inner) => inner,
            None => return Timeout::idle(),
        };
        let mut inner = inner.borrow_mut();
        let cancelled = Rc::new(Cell::new(false));
        inner.timer_seq += 1;
        let seq = inner.timer_seq;
        inner.timers.push(TimerEntry {
            at: Instant::now() + delay,
            seq: seq,
            cancelled: cancelled.clone(),
            cb: Box::new(f),
        });
        Timeout { cancelled: cancelled }
    }

    /// Listen on `host:port`; `accept` is called with each incoming
    /// connection. Returns the bound address.
    pub fn listen<F>(&self, host: &str, port: u16, accept: F)
        -> io::Result<SocketAddr>
        where F: FnMut(Rc<TcpConn>) + 'static
    {
        let inner_rc = self.inner.upgrade().ok_or_else(reactor_gone)?;
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        let addr = resolve(host, port)?;
        let mut sock = TcpListener::bind(addr)?;
        let local = sock.local_addr()?;
        {
            let mut inner = inner_rc.borrow_mut();
            let inner = &mut *inner;
            let vacant = inner.entries.vacant_entry();
            let token = Token(vacant.key());
            inner.registry.register(&mut sock, token,
                Interest::READABLE)?;
            vacant.insert(Entry::Listener {
                sock: sock,
                accept: Box::new(accept),
            });
        }
        info!("listening on {}", local);
        Ok(local)
    }

    /// Start a non-blocking connect to `host:port`. Exactly one of
    /// the two callbacks fires: `on_connect` with the established
    /// connection, or `on_error` with a description (a timeout after
    /// `timeout` included).
    pub fn connect<F, E>(&self, host: &str, port: u16, timeout: Duration,
        on_connect: F, on_error: E)
        where F: FnOnce(Rc<TcpConn>) + 'static,
              E: FnOnce(String) + 'static
    {
        let inner_rc = match self.inner.upgrade() {
            Some(inner) => inner,
            None => {
                on_error("reactor is gone".to_string());
                return;
            }
        };
        // Name resolution is synchronous by design; resolution
        // policy is the embedder's problem.
        let addr = match resolve(host, port) {
            Ok(addr) => addr,
            Err(e) => {
                on_error(format!("{}", e));
                return;
            }
        };
        let mut sock = match TcpStream::connect(addr) {
            Ok(sock) => sock,
            Err(e) => {
                on_error(format!("{}", e));
                return;
            }
        };
        let mut cbs = Some((on_connect, on_error));
        let token = {
            let mut inner = inner_rc.borrow_mut();
            let inner = &mut *inner;
            let vacant = inner.entries.vacant_entry();
            let token = Token(vacant.key());
            match inner.registry.register(&mut sock, token,
                Interest::WRITABLE)
            {
                Ok(()) => {
                    let (on_connect, on_error) = cbs.take().unwrap();
                    vacant.insert(Entry::Connecting(Some(Pending {
                        sock: sock,
                        host: host.to_string(),
                        port: port,
                        connect: Box::new(on_connect),
                        error: Box::new(on_error),
                        timer: Timeout::idle(),
                    })));
                    Some(token)
                }
                Err(_) => None,
            }
        };
        let token = match token {
            Some(token) => token,
            None => {
                let (_, on_error) = cbs.take().unwrap();
                on_error("cannot register socket".to_string());
                return;
            }
        };
        // Arm the connect timeout.
        let weak = self.inner.clone();
        let timer = self.timeout(timeout, move || {
            let inner_rc = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let pending = {
                let mut inner = inner_rc.borrow_mut();
                let taken = match inner.entries.get_mut(token.0) {
                    Some(&mut Entry::Connecting(ref mut p)) => p.take(),
                    _ => None,
                };
                if taken.is_some() {
                    inner.entries.remove(token.0);
                }
                taken
            };
            if let Some(pending) = pending {
                let Pending { mut sock, host, port, error, .. } = pending;
                let _ = inner_rc.borrow_mut().registry
                    .deregister(&mut sock);
                debug!("connect to {}:{} timed out", host, port);
                error("connection timed out".to_string());
            }
        });
        let mut inner = inner_rc.borrow_mut();
        if let Some(&mut Entry::Connecting(Some(ref mut p))) =
            inner.entries.get_mut(token.0)
        {
            p.timer = timer;
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other,
            format!("no address found for {}", host)))
}

fn reactor_gone() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "reactor is gone")
}
