//! HTTP server protocol implementation.
//!
//! Each TCP connection gets a [`ServerConn`]: a message parser, a
//! FIFO queue of requests (pipelined requests are parsed as they
//! arrive and answered strictly in order), and the response
//! serializer. Application code only sees the [`Service`] contract.

mod config;

pub use self::config::Config;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use netbuf::Buf;

use crate::conn::TcpConn;
use crate::error::Error;
use crate::handler::{
    BodySink, PauseHandle, Request, Responder, Service, StartResponse,
    WriteBody,
};
use crate::headers::{self, Headers};
use crate::parser::{Delimit, HeaderFacts, MessageParser, MessageSink};
use crate::reactor::Handle;
use crate::serializer;
use crate::version::Version;

/// An HTTP origin server: a listener plus a service.
pub struct Server;

impl Server {
    /// Listen on `host:port` and hand every request on every
    /// connection to `service`. Returns the bound address.
    pub fn bind<S>(handle: &Handle, host: &str, port: u16,
        config: &Rc<Config>, service: S) -> io::Result<SocketAddr>
        where S: Service + 'static
    {
        let service: Rc<RefCell<dyn Service>> =
            Rc::new(RefCell::new(service));
        let config = config.clone();
        handle.listen(host, port, move |conn| {
            ServerConn::attach(conn, service.clone(), &config);
        })
    }
}

enum ResState {
    Waiting,
    Streaming(Delimit),
}

struct ResOut {
    state: ResState,
    pause_cb: Option<Box<dyn FnMut(bool)>>,
}

struct ReqState {
    method: String,
    target: String,
    version: Version,
    headers: Option<Headers>,
    close_requested: bool,
    /// Pre-start fault, answered with a synthetic response once this
    /// request reaches the head of the queue.
    err: Option<Error>,
    started: bool,
    sink: Option<Box<dyn BodySink>>,
    /// Body data received before the handler was started.
    pending: VecDeque<Vec<u8>>,
    pending_end: Option<Option<Error>>,
    end_delivered: bool,
    res_done: bool,
}

/// Per-connection server state. Owned by the callbacks installed in
/// its [`TcpConn`]; applications normally never touch this directly.
pub struct ServerConn {
    conn: Weak<TcpConn>,
    service: Rc<RefCell<dyn Service>>,
    parser: RefCell<MessageParser>,
    requests: RefCell<HashMap<u64, ReqState>>,
    /// Response order; the front entry owns the wire.
    order: RefCell<VecDeque<u64>>,
    /// The request currently being parsed (receives body events).
    tail: Cell<u64>,
    next_id: Cell<u64>,
    res: RefCell<ResOut>,
}

struct ServerSink<'a> {
    conn: &'a Rc<ServerConn>,
}

impl<'a> MessageSink for ServerSink<'a> {
    fn start(&mut self, top_line: &str, headers: Headers,
        facts: &HeaderFacts) -> Result<bool, ()>
    {
        self.conn.input_start(top_line, headers, facts)
    }

    fn body(&mut self, chunk: &[u8]) {
        self.conn.input_body(chunk);
    }

    fn end(&mut self) {
        self.conn.input_end();
    }

    fn fault(&mut self, err: Error) {
        self.conn.input_fault(err);
    }
}

enum Item {
    Chunk(Vec<u8>),
    End(Option<Error>),
}

impl ServerConn {
    /// Wire a server connection onto an established socket.
    pub fn attach(conn: Rc<TcpConn>, service: Rc<RefCell<dyn Service>>,
        config: &Rc<Config>)
    {
        conn.set_bufsizes(config.read_bufsize, config.write_bufsize);
        let sc = Rc::new(ServerConn {
            conn: Rc::downgrade(&conn),
            service: service,
            parser: RefCell::new(MessageParser::new()),
            requests: RefCell::new(HashMap::new()),
            order: RefCell::new(VecDeque::new()),
            tail: Cell::new(0),
            next_id: Cell::new(1),
            res: RefCell::new(ResOut {
                state: ResState::Waiting,
                pause_cb: None,
            }),
        });
        let read = sc.clone();
        let close = sc.clone();
        let pause = sc;
        conn.set_callbacks(
            Box::new(move |data| read.feed(data)),
            Box::new(move || close.input_closed()),
            Box::new(move |flag| pause.forward_pause(flag)));
    }

    fn feed(self: &Rc<Self>, data: &[u8]) {
        let mut parser = self.parser.borrow_mut();
        parser.feed(data, &mut ServerSink { conn: self });
    }

    fn input_start(self: &Rc<Self>, top_line: &str, headers: Headers,
        facts: &HeaderFacts) -> Result<bool, ()>
    {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let mut err = None;
        let mut method = String::new();
        let mut target = String::new();
        let mut version = Version::Http11;
        let tokens: Vec<&str> = top_line.split_whitespace().collect();
        if tokens.len() < 3 {
            err = Some(Error::HttpVersion);
        } else {
            match Version::parse(tokens[tokens.len() - 1]) {
                Some(v) => {
                    version = v;
                    method = tokens[0].to_string();
                    target = tokens[1..tokens.len() - 1].join(" ");
                }
                None => err = Some(Error::HttpVersion),
            }
        }
        if err.is_none() {
            if version == Version::Http11 && !headers.contains("host") {
                err = Some(Error::HostRequired);
            } else if !facts.transfer.is_empty()
                && !facts.transfer.iter().any(|t| t == "chunked")
            {
                err = Some(Error::TransferCode);
            } else if facts.whitespace_first {
                err = Some(Error::WhitespaceHeader);
            }
        }
        let bad = err.is_some();
        if bad {
            warn!("bad request: {}", err.as_ref().unwrap());
        } else {
            debug!("request {} {} {}", method, target, version);
        }

        let allows_body = facts.content_length.is_some()
            || !facts.transfer.is_empty();
        let close_requested =
            facts.connection.iter().any(|t| t == "close");
        self.requests.borrow_mut().insert(id, ReqState {
            method: method,
            target: target,
            version: version,
            headers: Some(headers),
            close_requested: close_requested,
            err: err,
            started: false,
            sink: None,
            pending: VecDeque::new(),
            pending_end: None,
            end_delivered: false,
            res_done: false,
        });
        self.order.borrow_mut().push_back(id);
        self.tail.set(id);

        let is_head = self.order.borrow().len() == 1;
        if is_head {
            self.start_request(id);
        }
        if bad { Err(()) } else { Ok(allows_body) }
    }

    fn input_body(self: &Rc<Self>, chunk: &[u8]) {
        let id = self.tail.get();
        {
            let mut requests = self.requests.borrow_mut();
            if let Some(st) = requests.get_mut(&id) {
                st.pending.push_back(chunk.to_vec());
            }
        }
        self.pump(id);
    }

    fn input_end(self: &Rc<Self>) {
        let id = self.tail.get();
        {
            let mut requests = self.requests.borrow_mut();
            if let Some(st) = requests.get_mut(&id) {
                if st.pending_end.is_none() {
                    st.pending_end = Some(None);
                }
            }
        }
        self.pump(id);
    }

    /// A parse fault mid-request-body (bad chunk, extra data). The
    /// input stream is unusable: fail the request body and close.
    fn input_fault(self: &Rc<Self>, err: Error) {
        let id = self.tail.get();
        debug!("request {} input fault: {}", id, err);
        {
            let mut requests = self.requests.borrow_mut();
            if let Some(st) = requests.get_mut(&id) {
                if st.pending_end.is_none() {
                    st.pending_end = Some(Some(err));
                }
            }
        }
        self.pump(id);
        if let Some(conn) = self.conn.upgrade() {
            conn.close();
        }
    }

    fn input_closed(self: &Rc<Self>) {
        trace!("client closed the connection");
        let _ = self.parser.borrow_mut()
            .connection_closed(&mut ServerSink { conn: self });
        // Whatever is still in flight never completes.
        let stranded: Vec<u64> = self.requests.borrow().iter()
            .filter(|&(_, st)| {
                st.started && !st.end_delivered && st.pending_end.is_none()
            })
            .map(|(&id, _)| id)
            .collect();
        for id in stranded {
            {
                let mut requests = self.requests.borrow_mut();
                if let Some(st) = requests.get_mut(&id) {
                    st.pending_end = Some(Some(Error::Connect(
                        "client closed the connection".to_string())));
                }
            }
            self.pump(id);
        }
    }

    /// Deliver buffered body data and completion to the handler's
    /// sink, if it is attached and it is this request's turn.
    fn pump(self: &Rc<Self>, id: u64) {
        loop {
            let (item, mut sink) = {
                let mut requests = self.requests.borrow_mut();
                let st = match requests.get_mut(&id) {
                    Some(st) => st,
                    None => return,
                };
                if st.sink.is_none() || st.end_delivered {
                    return;
                }
                let item = if let Some(chunk) = st.pending.pop_front() {
                    Item::Chunk(chunk)
                } else if st.pending_end.is_some() {
                    st.end_delivered = true;
                    Item::End(st.pending_end.take().unwrap())
                } else {
                    return;
                };
                (item, st.sink.take().unwrap())
            };
            match item {
                Item::Chunk(chunk) => sink.data(&chunk),
                Item::End(err) => sink.end(err),
            }
            {
                let mut requests = self.requests.borrow_mut();
                if let Some(st) = requests.get_mut(&id) {
                    if st.sink.is_none() {
                        st.sink = Some(sink);
                    }
                }
            }
            self.maybe_remove(id);
        }
    }

    fn maybe_remove(&self, id: u64) {
        let mut requests = self.requests.borrow_mut();
        let done = requests.get(&id)
            .map(|st| st.end_delivered && st.res_done)
            .unwrap_or(false);
        if done {
            requests.remove(&id);
        }
    }

    fn start_request(self: &Rc<Self>, id: u64) {
        enum Go {
            Synthetic(Error),
            Run(Request),
            Gone,
        }
        let go = {
            let mut requests = self.requests.borrow_mut();
            match requests.get_mut(&id) {
                None => Go::Gone,
                Some(st) => {
                    st.started = true;
                    match st.err.take() {
                        Some(err) => Go::Synthetic(err),
                        None => Go::Run(Request {
                            method: st.method.clone(),
                            target: st.target.clone(),
                            version: st.version,
                            headers: st.headers.take()
                                .unwrap_or_else(Headers::new),
                        }),
                    }
                }
            }
        };
        match go {
            Go::Gone => {}
            Go::Synthetic(err) => self.synthetic_error(id, err),
            Go::Run(req) => {
                let responder = Responder {
                    inner: Box::new(HttpResponder {
                        server: Rc::downgrade(self),
                        id: id,
                    }),
                };
                let pause = match self.conn.upgrade() {
                    Some(ref conn) => PauseHandle::new(conn),
                    None => PauseHandle::dead(),
                };
                let sink = self.service.borrow_mut()
                    .call(req, responder, pause);
                {
                    let mut requests = self.requests.borrow_mut();
                    if let Some(st) = requests.get_mut(&id) {
                        if st.sink.is_none() {
                            st.sink = Some(sink);
                        }
                    }
                }
                self.pump(id);
            }
        }
    }

    /// Emit an error page for a request the application never saw.
    fn synthetic_error(self: &Rc<Self>, id: u64, err: Error) {
        let (code, phrase) = err.status();
        let mut hdrs = Headers::new();
        hdrs.push("Content-Type", "text/plain");
        self.res_start(id, code, phrase, &hdrs, None);
        let body = format!("{}\n", err);
        self.res_body(id, body.as_bytes());
        self.res_done(id, Some(err));
    }

    fn res_start(self: &Rc<Self>, id: u64, code: u16, phrase: &str,
        headers: &Headers, pause_cb: Option<Box<dyn FnMut(bool)>>)
    {
        {
            let order = self.order.borrow();
            assert_eq!(order.front().copied(), Some(id),
                "response started out of request order");
        }
        let (close_requested, version) = {
            let requests = self.requests.borrow();
            let st = requests.get(&id).expect("request state");
            (st.close_requested, st.version)
        };
        let mut res = self.res.borrow_mut();
        assert!(matches!(res.state, ResState::Waiting),
            "response already started");
        res.pause_cb = pause_cb;

        let mut buf = Buf::new();
        serializer::response_line(&mut buf, Version::Http11, code, phrase);
        let mut res_len: Option<u64> = None;
        for (name, value) in headers.iter() {
            if headers::is_hop_by_hop(name) {
                continue;
            }
            if name.eq_ignore_ascii_case("content-length") {
                res_len = value.trim().parse().ok();
            }
            serializer::header(&mut buf, name, value);
        }
        let delimit = if close_requested {
            serializer::header(&mut buf, "Connection", "close");
            Delimit::Close
        } else if res_len.is_some() {
            serializer::header(&mut buf, "Connection", "keep-alive");
            Delimit::Counted
        } else if version == Version::Http11 {
            serializer::header(&mut buf, "Transfer-Encoding", "chunked");
            Delimit::Chunked
        } else {
            serializer::header(&mut buf, "Connection", "close");
            Delimit::Close
        };
        serializer::blank_line(&mut buf);
        res.state = ResState::Streaming(delimit);
        drop(res);
        debug!("response {} {}", code, phrase);
        if let Some(conn) = self.conn.upgrade() {
            conn.write(&buf[..]);
        }
    }

    fn res_body(self: &Rc<Self>, id: u64, data: &[u8]) {
        {
            let order = self.order.borrow();
            assert_eq!(order.front().copied(), Some(id),
                "response body out of request order");
        }
        let delimit = match self.res.borrow().state {
            ResState::Streaming(delimit) => delimit,
            ResState::Waiting => panic!("response body before start"),
        };
        let conn = match self.conn.upgrade() {
            Some(conn) => conn,
            None => return,
        };
        trace!("response body chunk of {} bytes", data.len());
        match delimit {
            Delimit::Chunked => {
                let mut buf = Buf::new();
                serializer::chunk(&mut buf, data);
                conn.write(&buf[..]);
            }
            _ => conn.write(data),
        }
    }

    fn res_done(self: &Rc<Self>, id: u64, err: Option<Error>) {
        let delimit = {
            let mut res = self.res.borrow_mut();
            let delimit = match res.state {
                ResState::Streaming(delimit) => delimit,
                ResState::Waiting => panic!("response done before start"),
            };
            res.state = ResState::Waiting;
            res.pause_cb = None;
            delimit
        };
        if let Some(conn) = self.conn.upgrade() {
            if delimit == Delimit::Chunked {
                let mut buf = Buf::new();
                serializer::last_chunk(&mut buf);
                conn.write(&buf[..]);
            }
        }
        if let Some(ref e) = err {
            debug!("response aborted: {}", e);
        }
        {
            let popped = self.order.borrow_mut().pop_front();
            assert_eq!(popped, Some(id),
                "finished response is not the head request");
        }
        {
            let mut requests = self.requests.borrow_mut();
            if let Some(st) = requests.get_mut(&id) {
                st.res_done = true;
            }
        }
        self.maybe_remove(id);
        if delimit == Delimit::Close || err.is_some() {
            if let Some(conn) = self.conn.upgrade() {
                conn.close();
            }
            return;
        }
        let next = self.order.borrow().front().copied();
        if let Some(next) = next {
            let started = self.requests.borrow()
                .get(&next)
                .map(|st| st.started)
                .unwrap_or(true);
            if !started {
                self.start_request(next);
            }
        }
    }

    /// Outbound backpressure from the socket, forwarded to the
    /// response producer's pause callback.
    fn forward_pause(&self, paused: bool) {
        let cb = self.res.borrow_mut().pause_cb.take();
        if let Some(mut cb) = cb {
            cb(paused);
            let mut res = self.res.borrow_mut();
            if res.pause_cb.is_none() {
                res.pause_cb = Some(cb);
            }
        }
    }
}

struct HttpResponder {
    server: Weak<ServerConn>,
    id: u64,
}

impl StartResponse for HttpResponder {
    fn start(self: Box<Self>, code: u16, phrase: &str, headers: &Headers,
        pause_cb: Option<Box<dyn FnMut(bool)>>) -> Box<dyn WriteBody>
    {
        let HttpResponder { server, id } = *self;
        if let Some(sc) = server.upgrade() {
            sc.res_start(id, code, phrase, headers, pause_cb);
        }
        Box::new(HttpResponseBody { server: server, id: id })
    }
}

struct HttpResponseBody {
    server: Weak<ServerConn>,
    id: u64,
}

impl WriteBody for HttpResponseBody {
    fn write(&mut self, data: &[u8]) {
        if let Some(sc) = self.server.upgrade() {
            sc.res_body(self.id, data);
        }
    }

    fn done(self: Box<Self>, err: Option<Error>) {
        if let Some(sc) = self.server.upgrade() {
            sc.res_done(self.id, err);
        }
    }
}
