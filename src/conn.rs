//! Push-driven TCP connection.
//!
//! The reactor pushes readable/writable edges in; the owner pushes
//! data out with [`TcpConn::write`] and gets bytes back through its
//! read callback. Backpressure travels both ways: a full write
//! buffer pauses the producer through the pause callback, and the
//! consumer can pause reads with [`TcpConn::pause`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Duration;

use crate::reactor::Handle;

/// Default size of a single read from the socket.
pub const READ_BUFSIZE: usize = 16 * 1024;

/// Default write-buffer high-water mark, counted in buffered chunks.
pub const WRITE_BUFSIZE: usize = 16;

/// The interface a readiness reactor must satisfy for one socket.
///
/// Reads and writes are non-blocking; `arm` declares which readiness
/// edges the connection wants to hear about next.
pub trait Transport: Read + Write {
    fn arm(&mut self, read: bool, write: bool) -> io::Result<()>;
    /// Tear down the socket and forget its registration. Idempotent.
    fn close(&mut self);
}

struct Inner {
    transport: Box<dyn Transport>,
    write_buf: VecDeque<Vec<u8>>,
    connected: bool,
    paused: bool,
    closing: bool,
    above_watermark: bool,
    read_bufsize: usize,
    write_bufsize: usize,
}

impl Inner {
    fn rearm(&mut self) {
        if !self.connected {
            return;
        }
        let read = !self.paused && !self.closing;
        let write = !self.write_buf.is_empty();
        let _ = self.transport.arm(read, write);
    }

    fn teardown(&mut self) {
        self.connected = false;
        self.closing = false;
        self.write_buf.clear();
        self.transport.close();
    }
}

struct Callbacks {
    read: Option<Box<dyn FnMut(&[u8])>>,
    close: Option<Box<dyn FnMut()>>,
    pause: Option<Box<dyn FnMut(bool)>>,
    close_called: bool,
}

enum ReadOutcome {
    Data(Vec<u8>),
    Closed,
    Wait,
}

/// A buffered, pausable TCP connection.
pub struct TcpConn {
    host: String,
    port: u16,
    handle: Handle,
    inner: RefCell<Inner>,
    cbs: RefCell<Callbacks>,
}

impl TcpConn {
    pub fn new(transport: Box<dyn Transport>, host: &str, port: u16,
        handle: Handle) -> Rc<TcpConn>
    {
        let mut transport = transport;
        let _ = transport.arm(true, false);
        Rc::new(TcpConn {
            host: host.to_string(),
            port: port,
            handle: handle,
            inner: RefCell::new(Inner {
                transport: transport,
                write_buf: VecDeque::new(),
                connected: true,
                paused: false,
                closing: false,
                above_watermark: false,
                read_bufsize: READ_BUFSIZE,
                write_bufsize: WRITE_BUFSIZE,
            }),
            cbs: RefCell::new(Callbacks {
                read: None,
                close: None,
                pause: None,
                close_called: false,
            }),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    pub fn set_bufsizes(&self, read: usize, write: usize) {
        let mut inner = self.inner.borrow_mut();
        inner.read_bufsize = read;
        inner.write_bufsize = write;
    }

    /// Install the owner's callback set, replacing any previous one.
    pub fn set_callbacks(&self,
        read: Box<dyn FnMut(&[u8])>,
        close: Box<dyn FnMut()>,
        pause: Box<dyn FnMut(bool)>)
    {
        let mut cbs = self.cbs.borrow_mut();
        cbs.read = Some(read);
        cbs.close = Some(close);
        cbs.pause = Some(pause);
    }

    /// Queue data for the peer. Crossing the high-water mark invokes
    /// the pause callback with `true`; ignoring it only grows the
    /// buffer.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let newly_over = {
            let mut inner = self.inner.borrow_mut();
            if !inner.connected || inner.closing {
                trace!("{}:{}: dropping {} bytes written after close",
                    self.host, self.port, data.len());
                return;
            }
            inner.write_buf.push_back(data.to_vec());
            inner.rearm();
            let over = inner.write_buf.len() > inner.write_bufsize;
            if over && !inner.above_watermark {
                inner.above_watermark = true;
                true
            } else {
                false
            }
        };
        if newly_over {
            self.call_pause(true);
        }
    }

    /// Stop or restart read callbacks. While paused, bytes pile up
    /// in the kernel buffers.
    pub fn pause(&self, paused: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.paused = paused;
        inner.rearm();
    }

    /// Flush buffered data (if any) and close the connection.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.connected {
            return;
        }
        inner.paused = true;
        if inner.write_buf.is_empty() {
            inner.teardown();
        } else {
            inner.closing = true;
            inner.rearm();
        }
    }

    /// The reactor saw a readable edge.
    pub fn on_readable(self: &Rc<Self>) {
        loop {
            let outcome = {
                let mut inner = self.inner.borrow_mut();
                if !inner.connected || inner.paused {
                    return;
                }
                let mut tmp = vec![0u8; inner.read_bufsize];
                match inner.transport.read(&mut tmp) {
                    Ok(0) => ReadOutcome::Closed,
                    Ok(n) => {
                        tmp.truncate(n);
                        ReadOutcome::Data(tmp)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        ReadOutcome::Wait
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                        continue;
                    }
                    Err(e) => {
                        // ECONNRESET and friends read as a peer close.
                        debug!("{}:{}: read error: {}",
                            self.host, self.port, e);
                        ReadOutcome::Closed
                    }
                }
            };
            match outcome {
                ReadOutcome::Data(data) => self.call_read(&data),
                ReadOutcome::Closed => {
                    self.peer_closed();
                    return;
                }
                ReadOutcome::Wait => return,
            }
        }
    }

    /// The reactor saw a writable edge: drain what we can.
    pub fn on_writable(self: &Rc<Self>) {
        enum After {
            Resume(bool),
            Closed,
        }
        let after = {
            let mut inner = self.inner.borrow_mut();
            if !inner.connected {
                return;
            }
            let mut broken = false;
            while let Some(chunk) = inner.write_buf.pop_front() {
                match inner.transport.write(&chunk) {
                    Ok(n) if n == 0 || n < chunk.len() => {
                        inner.write_buf.push_front(chunk[n..].to_vec());
                        break;
                    }
                    Ok(_) => continue,
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock =>
                    {
                        inner.write_buf.push_front(chunk);
                        break;
                    }
                    Err(ref e)
                        if e.kind() == io::ErrorKind::Interrupted =>
                    {
                        inner.write_buf.push_front(chunk);
                        continue;
                    }
                    Err(e) => {
                        debug!("{}:{}: write error: {}",
                            self.host, self.port, e);
                        broken = true;
                        break;
                    }
                }
            }
            if broken {
                inner.teardown();
                After::Closed
            } else {
                let resume = inner.above_watermark
                    && inner.write_buf.len() < inner.write_bufsize;
                if resume {
                    inner.above_watermark = false;
                }
                if inner.closing && inner.write_buf.is_empty() {
                    inner.teardown();
                } else {
                    inner.rearm();
                }
                After::Resume(resume)
            }
        };
        match after {
            After::Resume(true) => self.call_pause(false),
            After::Resume(false) => {}
            After::Closed => self.peer_closed(),
        }
    }

    fn peer_closed(self: &Rc<Self>) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.connected {
                inner.teardown();
            }
        }
        self.notify_close();
    }

    fn notify_close(self: &Rc<Self>) {
        let cb = {
            let mut cbs = self.cbs.borrow_mut();
            if cbs.close_called {
                return;
            }
            match cbs.close.take() {
                Some(cb) => {
                    cbs.close_called = true;
                    Some(cb)
                }
                None => None,
            }
        };
        match cb {
            Some(mut cb) => {
                cb();
                let mut cbs = self.cbs.borrow_mut();
                if cbs.close.is_none() {
                    cbs.close = Some(cb);
                }
            }
            None => {
                // Uncomfortable race: nobody has attached a close
                // callback yet, so try again shortly.
                trace!("{}:{}: peer close with no close callback yet",
                    self.host, self.port);
                let weak = Rc::downgrade(self);
                self.handle.timeout(Duration::from_secs(1), move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.notify_close();
                    }
                });
            }
        }
    }

    fn call_read(&self, data: &[u8]) {
        let cb = self.cbs.borrow_mut().read.take();
        match cb {
            Some(mut cb) => {
                cb(data);
                let mut cbs = self.cbs.borrow_mut();
                if cbs.read.is_none() {
                    cbs.read = Some(cb);
                }
            }
            None => {
                warn!("{}:{}: {} bytes read with no read callback",
                    self.host, self.port, data.len());
            }
        }
    }

    fn call_pause(&self, paused: bool) {
        let cb = self.cbs.borrow_mut().pause.take();
        if let Some(mut cb) = cb {
            cb(paused);
            let mut cbs = self.cbs.borrow_mut();
            if cbs.pause.is_none() {
                cbs.pause = Some(cb);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use crate::mock::ScriptedTransport;
    use crate::reactor::Core;

    use super::TcpConn;

    fn conn_with(t: ScriptedTransport) -> (Core, Rc<TcpConn>) {
        let core = Core::new().unwrap();
        let handle = core.handle();
        let conn = TcpConn::new(Box::new(t), "test", 80, handle);
        (core, conn)
    }

    #[test]
    fn read_chunks_reach_callback() {
        let t = ScriptedTransport::new();
        t.push_read(b"hello ");
        t.push_read(b"world");
        let (_core, conn) = conn_with(t.clone());
        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        conn.set_callbacks(
            Box::new(move |data| got2.borrow_mut().extend_from_slice(data)),
            Box::new(|| {}),
            Box::new(|_| {}));
        conn.on_readable();
        assert_eq!(&got.borrow()[..], b"hello world");
    }

    #[test]
    fn peer_close_fires_once() {
        let t = ScriptedTransport::new();
        t.push_eof();
        let (_core, conn) = conn_with(t.clone());
        let closes = Rc::new(Cell::new(0));
        let c2 = closes.clone();
        conn.set_callbacks(
            Box::new(|_| {}),
            Box::new(move || c2.set(c2.get() + 1)),
            Box::new(|_| {}));
        conn.on_readable();
        conn.on_readable();
        assert_eq!(closes.get(), 1);
        assert!(!conn.is_connected());
        assert!(t.is_closed());
    }

    #[test]
    fn paused_connection_does_not_read() {
        let t = ScriptedTransport::new();
        t.push_read(b"data");
        let (_core, conn) = conn_with(t.clone());
        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        conn.set_callbacks(
            Box::new(move |data| got2.borrow_mut().extend_from_slice(data)),
            Box::new(|| {}),
            Box::new(|_| {}));
        conn.pause(true);
        conn.on_readable();
        assert!(got.borrow().is_empty());
        conn.pause(false);
        conn.on_readable();
        assert_eq!(&got.borrow()[..], b"data");
    }

    #[test]
    fn watermark_pauses_and_drain_resumes() {
        let t = ScriptedTransport::new();
        let (_core, conn) = conn_with(t.clone());
        let pauses = Rc::new(RefCell::new(Vec::new()));
        let p2 = pauses.clone();
        conn.set_callbacks(
            Box::new(|_| {}),
            Box::new(|| {}),
            Box::new(move |flag| p2.borrow_mut().push(flag)));
        conn.set_bufsizes(1024, 2);
        conn.write(b"a");
        conn.write(b"b");
        assert!(pauses.borrow().is_empty());
        conn.write(b"c");
        assert_eq!(&pauses.borrow()[..], &[true]);
        conn.on_writable();
        assert_eq!(&pauses.borrow()[..], &[true, false]);
        assert_eq!(&t.written()[..], b"abc");
    }

    #[test]
    fn close_drains_buffer_first() {
        let t = ScriptedTransport::new();
        t.limit_write(2);
        let (_core, conn) = conn_with(t.clone());
        conn.set_callbacks(Box::new(|_| {}), Box::new(|| {}),
            Box::new(|_| {}));
        conn.write(b"abcd");
        conn.close();
        assert!(conn.is_connected());
        conn.on_writable();
        conn.on_writable();
        assert_eq!(&t.written()[..], b"abcd");
        assert!(!conn.is_connected());
        assert!(t.is_closed());
    }

    #[test]
    fn write_after_close_is_dropped() {
        let t = ScriptedTransport::new();
        let (_core, conn) = conn_with(t.clone());
        conn.close();
        conn.write(b"late");
        assert!(t.written().is_empty());
    }
}
