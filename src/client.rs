//! HTTP client implementation.
//!
//! A [`Client`] drives exactly one request/response exchange, the
//! response pushed into the [`ResponseHandler`] supplied up front.
//! Connections come from the [`ClientContext`]'s idle pool and go
//! back to it after a cleanly completed, reusable response. If the
//! peer closes an idle connection before any response byte arrives,
//! idempotent requests are retried on a fresh connection.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use url::Url;

use crate::conn::{TcpConn, READ_BUFSIZE, WRITE_BUFSIZE};
use crate::error::Error;
use crate::handler::{
    BodySink, NullSink, PauseHandle, ResponseHandler, ResponseHead,
};
use crate::headers::{self, Headers};
use crate::parser::{
    CloseOutcome, HeaderFacts, MessageParser, MessageSink,
};
use crate::pool::{self, Pool};
use crate::reactor::{Handle, Timeout};
use crate::serializer;
use crate::version::Version;

/// Fine-grained configuration of the HTTP client.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) read_bufsize: usize,
    pub(crate) write_bufsize: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) retry_limit: u32,
}

impl Config {
    /// Create a config with defaults.
    pub fn new() -> Config {
        Config {
            read_bufsize: READ_BUFSIZE,
            write_bufsize: WRITE_BUFSIZE,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(10),
            retry_limit: 2,
        }
    }

    pub fn read_bufsize(&mut self, value: usize) -> &mut Self {
        self.read_bufsize = value;
        self
    }

    pub fn write_bufsize(&mut self, value: usize) -> &mut Self {
        self.write_bufsize = value;
        self
    }

    /// Timeout for establishing a connection (pool misses dial with
    /// this; forward proxies typically raise it).
    pub fn connect_timeout(&mut self, value: Duration) -> &mut Self {
        self.connect_timeout = value;
        self
    }

    /// Inactivity timeout while a response is outstanding.
    pub fn read_timeout(&mut self, value: Duration) -> &mut Self {
        self.read_timeout = value;
        self
    }

    /// How many times an idempotent request may be resent.
    pub fn retry_limit(&mut self, value: u32) -> &mut Self {
        self.retry_limit = value;
        self
    }

    /// Create an Rc'd config clone to pass to the constructor.
    pub fn done(&mut self) -> Rc<Config> {
        Rc::new(self.clone())
    }
}

/// Shared client machinery: the reactor handle, the idle pool, and
/// the config. One per reactor is plenty.
pub struct ClientContext {
    pub(crate) handle: Handle,
    pub(crate) pool: Rc<RefCell<Pool>>,
    pub(crate) config: Rc<Config>,
}

impl ClientContext {
    pub fn new(handle: &Handle, config: &Rc<Config>) -> Rc<ClientContext> {
        Rc::new(ClientContext {
            handle: handle.clone(),
            pool: Rc::new(RefCell::new(Pool::new())),
            config: config.clone(),
        })
    }

    /// Find an idle connection for `(host, port)` or dial a new one.
    fn attach(&self, host: &str, port: u16,
        on_conn: Box<dyn FnOnce(Rc<TcpConn>)>,
        on_err: Box<dyn FnOnce(String)>)
    {
        let pooled = self.pool.borrow_mut().checkout(host, port);
        match pooled {
            Some(conn) => on_conn(conn),
            None => self.handle.connect(host, port,
                self.config.connect_timeout, on_conn, on_err),
        }
    }
}

struct State {
    method: String,
    host: String,
    port: u16,
    head: Vec<u8>,
    /// Body bytes sent so far, kept around until a response byte is
    /// observed so a retry can resend them.
    body: Vec<u8>,
    body_done: bool,
    content_length: Option<u64>,
    sent: u64,
    conn: Option<Weak<TcpConn>>,
    reusable: bool,
    retries: u32,
    req_pause_cb: Option<Box<dyn FnMut(bool)>>,
    sink: Option<Box<dyn BodySink>>,
    started: bool,
    response_started: bool,
    completed: bool,
    failed: bool,
    read_timer: Option<Timeout>,
}

/// A single in-flight HTTP request.
pub struct Client {
    ctx: Rc<ClientContext>,
    handler: RefCell<Option<Box<dyn ResponseHandler>>>,
    parser: RefCell<MessageParser>,
    state: RefCell<State>,
}

/// The request body channel returned by [`Client::req_start`].
pub struct RequestBody {
    client: Weak<Client>,
}

impl RequestBody {
    /// Write request body bytes. Requires a declared Content-Length;
    /// writing past it is a caller bug and panics.
    pub fn write(&self, data: &[u8]) {
        if let Some(client) = self.client.upgrade() {
            client.req_body(data);
        }
    }

    /// The request body is complete. An error aborts the exchange.
    pub fn done(self, err: Option<Error>) {
        if let Some(client) = self.client.upgrade() {
            client.req_done(err);
        }
    }
}

struct ClientSink<'a> {
    client: &'a Rc<Client>,
}

impl<'a> MessageSink for ClientSink<'a> {
    fn start(&mut self, top_line: &str, headers: Headers,
        facts: &HeaderFacts) -> Result<bool, ()>
    {
        self.client.input_start(top_line, headers, facts)
    }

    fn body(&mut self, chunk: &[u8]) {
        self.client.input_body(chunk);
    }

    fn end(&mut self) {
        self.client.finish(None);
    }

    fn fault(&mut self, err: Error) {
        self.client.finish(Some(err));
    }
}

impl Client {
    /// Create a client for one request; the response goes to
    /// `handler`.
    pub fn new(ctx: &Rc<ClientContext>, handler: Box<dyn ResponseHandler>)
        -> Rc<Client>
    {
        Rc::new(Client {
            ctx: ctx.clone(),
            handler: RefCell::new(Some(handler)),
            parser: RefCell::new(MessageParser::new()),
            state: RefCell::new(State {
                method: String::new(),
                host: String::new(),
                port: 0,
                head: Vec::new(),
                body: Vec::new(),
                body_done: false,
                content_length: None,
                sent: 0,
                conn: None,
                reusable: false,
                retries: 0,
                req_pause_cb: None,
                sink: None,
                started: false,
                response_started: false,
                completed: false,
                failed: false,
                read_timer: None,
            }),
        })
    }

    /// Start a request to the absolute `uri`. Hop-by-hop and Host
    /// headers in `headers` are dropped; Host and keep-alive are
    /// appended from the URI. Returns the request body channel.
    ///
    /// URI and connect problems do not surface here: they arrive as
    /// a synthetic error response through the handler.
    pub fn req_start(self: &Rc<Self>, method: &str, uri: &str,
        headers: &Headers, pause_cb: Box<dyn FnMut(bool)>) -> RequestBody
    {
        {
            let mut st = self.state.borrow_mut();
            assert!(!st.started, "req_start called twice");
            st.started = true;
            st.method = method.to_string();
            st.req_pause_cb = Some(pause_cb);
        }
        let channel = RequestBody { client: Rc::downgrade(self) };

        let url = match Url::parse(uri) {
            Ok(url) => url,
            Err(e) => {
                self.handle_error(Error::Url(format!("{}", e)));
                return channel;
            }
        };
        if url.scheme() != "http" {
            self.handle_error(Error::Url(
                format!("unsupported scheme {:?}", url.scheme())));
            return channel;
        }
        let host = match url.host_str() {
            Some(host) => host.to_string(),
            None => {
                self.handle_error(Error::Url("missing host".to_string()));
                return channel;
            }
        };
        let port = url.port().unwrap_or(80);
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.clone(),
        };
        let mut path = url.path().to_string();
        if path.is_empty() {
            path = "/".to_string();
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut content_length = None;
        let mut head = Vec::new();
        serializer::request_line(&mut head, method, &path, Version::Http11);
        for (name, value) in headers.iter() {
            if name.eq_ignore_ascii_case("host")
                || headers::is_hop_by_hop(name)
            {
                continue;
            }
            if name.eq_ignore_ascii_case("content-length")
                && content_length.is_none()
            {
                content_length = value.trim().parse().ok();
            }
            serializer::header(&mut head, name, value);
        }
        serializer::header(&mut head, "Host", &authority);
        serializer::header(&mut head, "Connection", "keep-alive");
        serializer::blank_line(&mut head);

        {
            let mut st = self.state.borrow_mut();
            st.host = host;
            st.port = port;
            st.head = head;
            st.content_length = content_length;
        }
        debug!("req_start {} {}", method, uri);
        self.attach_conn();
        channel
    }

    fn attach_conn(self: &Rc<Self>) {
        let (host, port) = {
            let st = self.state.borrow();
            (st.host.clone(), st.port)
        };
        let on_conn = self.clone();
        let on_err = self.clone();
        self.ctx.clone().attach(&host, port,
            Box::new(move |conn| on_conn.handle_connect(conn)),
            Box::new(move |detail| on_err.handle_connect_error(detail)));
    }

    fn handle_connect(self: &Rc<Self>, conn: Rc<TcpConn>) {
        conn.set_bufsizes(self.ctx.config.read_bufsize,
            self.ctx.config.write_bufsize);
        let read = self.clone();
        let close = self.clone();
        let pause = self.clone();
        conn.set_callbacks(
            Box::new(move |data| read.feed(data)),
            Box::new(move || close.conn_closed()),
            Box::new(move |flag| pause.forward_req_pause(flag)));
        let (head, body) = {
            let mut st = self.state.borrow_mut();
            st.conn = Some(Rc::downgrade(&conn));
            (st.head.clone(), st.body.clone())
        };
        conn.write(&head);
        if !body.is_empty() {
            conn.write(&body);
        }
        self.reset_read_timer();
    }

    fn handle_connect_error(self: &Rc<Self>, detail: String) {
        let retry = {
            let st = self.state.borrow();
            !st.completed && !st.failed
                && headers::is_idempotent(&st.method)
                && st.retries < self.ctx.config.retry_limit
        };
        if retry {
            let attempt = {
                let mut st = self.state.borrow_mut();
                st.retries += 1;
                st.retries
            };
            debug!("connect failed ({}), retry {}", detail, attempt);
            self.attach_conn();
        } else {
            self.handle_error(Error::Connect(detail));
        }
    }

    fn feed(self: &Rc<Self>, data: &[u8]) {
        self.reset_read_timer();
        let mut parser = self.parser.borrow_mut();
        parser.feed(data, &mut ClientSink { client: self });
    }

    fn conn_closed(self: &Rc<Self>) {
        if self.state.borrow().completed {
            return;
        }
        // A close-delimited body may just have ended cleanly.
        let outcome = self.parser.borrow_mut()
            .connection_closed(&mut ClientSink { client: self });
        if outcome == CloseOutcome::BodyDone {
            return;
        }
        let retry = {
            let st = self.state.borrow();
            let observed = st.response_started
                || self.parser.borrow().mid_message();
            !observed && !st.failed && !st.completed
                && headers::is_idempotent(&st.method)
                && st.retries < self.ctx.config.retry_limit
        };
        if retry {
            let attempt = {
                let mut st = self.state.borrow_mut();
                st.retries += 1;
                st.conn = None;
                if let Some(timer) = st.read_timer.take() {
                    timer.cancel();
                }
                st.retries
            };
            debug!("peer closed before response, retry {}", attempt);
            self.attach_conn();
        } else if !self.state.borrow().response_started {
            self.handle_error(Error::Connect(
                "Server closed the connection.".to_string()));
        } else {
            self.finish(Some(Error::Connect(
                "Server closed the connection.".to_string())));
        }
    }

    fn forward_req_pause(&self, paused: bool) {
        let cb = self.state.borrow_mut().req_pause_cb.take();
        if let Some(mut cb) = cb {
            cb(paused);
            let mut st = self.state.borrow_mut();
            if st.req_pause_cb.is_none() {
                st.req_pause_cb = Some(cb);
            }
        }
    }

    fn reset_read_timer(self: &Rc<Self>) {
        let me = Rc::downgrade(self);
        let timer = self.ctx.handle.timeout(self.ctx.config.read_timeout,
            move || {
                if let Some(client) = me.upgrade() {
                    client.read_timed_out();
                }
            });
        let mut st = self.state.borrow_mut();
        if let Some(old) = st.read_timer.take() {
            old.cancel();
        }
        st.read_timer = Some(timer);
    }

    fn read_timed_out(self: &Rc<Self>) {
        let (done, conn, started) = {
            let mut st = self.state.borrow_mut();
            (st.completed,
             st.conn.take().and_then(|weak| weak.upgrade()),
             st.response_started)
        };
        if done {
            return;
        }
        debug!("read timeout on {}:{}",
            self.state.borrow().host, self.state.borrow().port);
        if let Some(conn) = conn {
            conn.close();
        }
        if started {
            self.finish(Some(Error::Connect("read timeout".to_string())));
        } else {
            self.handle_error(Error::Connect("read timeout".to_string()));
        }
    }

    fn req_body(self: &Rc<Self>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        enum Out {
            NoLength,
            Write(Option<Rc<TcpConn>>),
        }
        let out = {
            let mut st = self.state.borrow_mut();
            if st.completed || st.failed {
                return;
            }
            assert!(st.started && !st.body_done,
                "request body written after done");
            match st.content_length {
                // TODO: chunked request bodies
                None => Out::NoLength,
                Some(declared) => {
                    st.sent += data.len() as u64;
                    assert!(st.sent <= declared,
                        "request body exceeds the declared \
                         Content-Length ({} > {})", st.sent, declared);
                    st.body.extend_from_slice(data);
                    Out::Write(st.conn.as_ref()
                        .and_then(|weak| weak.upgrade()))
                }
            }
        };
        match out {
            Out::NoLength => {
                self.handle_error(Error::ContentLengthRequired);
            }
            Out::Write(Some(conn)) => conn.write(data),
            // Not connected yet: flushed from the buffer on connect.
            Out::Write(None) => {}
        }
    }

    fn req_done(self: &Rc<Self>, err: Option<Error>) {
        {
            let mut st = self.state.borrow_mut();
            if st.completed || st.failed {
                return;
            }
            st.body_done = true;
        }
        if let Some(e) = err {
            debug!("request aborted by caller: {}", e);
            let conn = self.state.borrow_mut().conn.take()
                .and_then(|weak| weak.upgrade());
            if let Some(conn) = conn {
                conn.close();
            }
            self.handle_error(Error::Connect(
                format!("request aborted: {}", e)));
        }
    }

    fn input_start(self: &Rc<Self>, top_line: &str, headers: Headers,
        facts: &HeaderFacts) -> Result<bool, ()>
    {
        if self.state.borrow().completed {
            // Stray bytes on a finished exchange; ignore them.
            return Err(());
        }
        let (version_tok, rest) = split_token(top_line);
        let version = match Version::parse(version_tok) {
            Some(version) => version,
            None => {
                self.handle_error(Error::HttpVersion);
                return Err(());
            }
        };
        let (code_tok, phrase) = split_token(rest);
        let code: u16 = match code_tok.parse() {
            Ok(code) => code,
            Err(_) => {
                self.handle_error(Error::HttpVersion);
                return Err(());
            }
        };
        let close = facts.connection.iter().any(|t| t == "close");
        let keep_alive = facts.connection.iter().any(|t| t == "keep-alive");
        let reusable = !close
            && (version == Version::Http11 || keep_alive);
        let is_head = {
            let mut st = self.state.borrow_mut();
            st.response_started = true;
            st.reusable = reusable;
            // The retry window is over; drop the resend buffer.
            st.body = Vec::new();
            st.method == "HEAD"
        };
        let allows_body = !headers::NO_BODY_STATUS.contains(&code)
            && !is_head;
        debug!("res_start {} {}", code, phrase);
        let head = ResponseHead {
            version: version,
            code: code,
            reason: phrase.to_string(),
            headers: headers,
        };
        let pause = {
            let st = self.state.borrow();
            match st.conn.as_ref().and_then(|weak| weak.upgrade()) {
                Some(ref conn) => PauseHandle::new(conn),
                None => PauseHandle::dead(),
            }
        };
        let handler = self.handler.borrow_mut().take();
        let sink = match handler {
            Some(mut handler) => handler.response_start(head, pause),
            None => Box::new(NullSink) as Box<dyn BodySink>,
        };
        self.state.borrow_mut().sink = Some(sink);
        Ok(allows_body)
    }

    fn input_body(&self, chunk: &[u8]) {
        let sink = self.state.borrow_mut().sink.take();
        if let Some(mut sink) = sink {
            sink.data(chunk);
            let mut st = self.state.borrow_mut();
            if st.sink.is_none() {
                st.sink = Some(sink);
            }
        }
    }

    /// Response complete (cleanly or not): settle the connection and
    /// deliver the one completion signal.
    fn finish(self: &Rc<Self>, err: Option<Error>) {
        let (sink, conn, reusable) = {
            let mut st = self.state.borrow_mut();
            if st.completed {
                return;
            }
            st.completed = true;
            if let Some(timer) = st.read_timer.take() {
                timer.cancel();
            }
            (st.sink.take(),
             st.conn.take().and_then(|weak| weak.upgrade()),
             st.reusable)
        };
        if let Some(conn) = conn {
            if err.is_none() && reusable && conn.is_connected() {
                pool::release(&self.ctx.pool, conn);
            } else {
                conn.close();
            }
        }
        if let Some(mut sink) = sink {
            sink.end(err);
        }
    }

    /// Report an error as a synthetic response, then complete.
    fn handle_error(self: &Rc<Self>, err: Error) {
        {
            let mut st = self.state.borrow_mut();
            if st.completed || st.failed {
                return;
            }
            st.failed = true;
        }
        let conn = self.state.borrow_mut().conn.take()
            .and_then(|weak| weak.upgrade());
        if let Some(conn) = conn {
            conn.close();
        }
        warn!("request failed: {}", err);
        let (code, phrase) = err.status();
        let mut hdrs = Headers::new();
        hdrs.push("Content-Type", "text/plain");
        hdrs.push("Connection", "close");
        let head = ResponseHead {
            version: Version::Http11,
            code: code,
            reason: phrase.to_string(),
            headers: hdrs,
        };
        let handler = self.handler.borrow_mut().take();
        if let Some(mut handler) = handler {
            let mut sink = handler.response_start(head,
                PauseHandle::dead());
            sink.data(format!("{}", err).as_bytes());
            self.state.borrow_mut().sink = Some(sink);
        }
        self.finish(Some(err));
    }
}

fn split_token(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(i) => (&line[..i], line[i..].trim_start()),
        None => (line, ""),
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::conn::TcpConn;
    use crate::handler::{handler_fn, BodySink, PauseHandle, ResponseHead};
    use crate::headers::Headers;
    use crate::mock::{RecordingSink, ScriptedTransport, SinkRecord};
    use crate::pool;
    use crate::reactor::Core;

    use super::{Client, ClientContext, Config};

    struct Got {
        head: Option<ResponseHead>,
        record: Rc<RefCell<SinkRecord>>,
    }

    fn context(core: &Core) -> Rc<ClientContext> {
        ClientContext::new(&core.handle(), &Config::new().done())
    }

    /// A handler that records the response head and body.
    fn recording_handler(got: &Rc<RefCell<Got>>)
        -> impl FnMut(ResponseHead, PauseHandle) -> Box<dyn BodySink>
    {
        let got = got.clone();
        move |head: ResponseHead, _pause: PauseHandle| {
            let (sink, record) = RecordingSink::new();
            let mut g = got.borrow_mut();
            g.head = Some(head);
            g.record = record;
            Box::new(sink) as Box<dyn BodySink>
        }
    }

    fn new_got() -> Rc<RefCell<Got>> {
        Rc::new(RefCell::new(Got {
            head: None,
            record: Rc::new(RefCell::new(SinkRecord::default())),
        }))
    }

    /// Preload the context's pool with a scripted connection to
    /// `h:80` so requests do not hit the real connector.
    fn preload(core: &Core, ctx: &Rc<ClientContext>)
        -> (ScriptedTransport, Rc<TcpConn>)
    {
        let t = ScriptedTransport::new();
        let conn = TcpConn::new(Box::new(t.clone()), "h", 80,
            core.handle());
        pool::release(&ctx.pool, conn.clone());
        (t, conn)
    }

    #[test]
    fn simple_get_round_trip() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        let (t, conn) = preload(&core, &ctx);
        let got = new_got();
        let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
        let mut hdrs = Headers::new();
        hdrs.push("Accept", "*/*");
        let body = client.req_start("GET", "http://h/a?x=1", &hdrs,
            Box::new(|_| {}));
        body.done(None);
        conn.on_writable();
        assert_eq!(t.take_written(),
            b"GET /a?x=1 HTTP/1.1\r\nAccept: */*\r\nHost: h\r\n\
              Connection: keep-alive\r\n\r\n".to_vec());
        t.push_read(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        conn.on_readable();
        let g = got.borrow();
        let head = g.head.as_ref().unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(&g.record.borrow().data[..], b"hello");
        assert_eq!(g.record.borrow().end_count, 1);
        assert!(g.record.borrow().err.is_none());
        // Reusable response: the connection went back to the pool.
        assert_eq!(ctx.pool.borrow().idle_count("h", 80), 1);
    }

    #[test]
    fn hop_by_hop_and_host_are_scrubbed() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        let t = ScriptedTransport::new();
        let conn = TcpConn::new(Box::new(t.clone()), "h", 8080,
            core.handle());
        pool::release(&ctx.pool, conn.clone());
        let got = new_got();
        let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
        let mut hdrs = Headers::new();
        hdrs.push("Host", "spoofed");
        hdrs.push("Connection", "upgrade");
        hdrs.push("Transfer-Encoding", "chunked");
        hdrs.push("X-Keep", "yes");
        client.req_start("GET", "http://h:8080/", &hdrs,
            Box::new(|_| {}));
        conn.on_writable();
        let text = String::from_utf8(t.take_written()).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\n"), "sent: {}", text);
        assert!(!text.contains("spoofed"));
        assert!(!text.contains("upgrade"));
        assert!(!text.contains("Transfer-Encoding"));
        assert!(text.contains("X-Keep: yes\r\n"));
        // The authority from the URI wins, port included.
        assert!(text.contains("Host: h:8080\r\n"));
    }

    #[test]
    fn no_body_for_204_and_head() {
        for &(method, status) in
            &[("GET", "204 No Content"), ("HEAD", "200 OK")]
        {
            let core = Core::new().unwrap();
            let ctx = context(&core);
            let (t, conn) = preload(&core, &ctx);
            let got = new_got();
            let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
            client.req_start(method, "http://h/", &Headers::new(),
                Box::new(|_| {}));
            conn.on_writable();
            t.take_written();
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 10\r\n\r\n", status);
            t.push_read(response.as_bytes());
            conn.on_readable();
            let g = got.borrow();
            assert!(g.head.is_some(), "{} {}", method, status);
            assert!(g.record.borrow().data.is_empty());
            assert_eq!(g.record.borrow().end_count, 1);
        }
    }

    #[test]
    fn extra_data_after_counted_body() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        let (t, conn) = preload(&core, &ctx);
        let got = new_got();
        let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
        client.req_start("GET", "http://h/", &Headers::new(),
            Box::new(|_| {}));
        conn.on_writable();
        t.push_read(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabcde");
        conn.on_readable();
        let g = got.borrow();
        assert_eq!(&g.record.borrow().data[..], b"abc");
        assert_eq!(g.record.borrow().end_count, 1);
        let err = g.record.borrow().err.clone().unwrap();
        assert!(err.contains("2 bytes past the end"), "err: {}", err);
        // Broken framing: the connection must not be reused.
        assert_eq!(ctx.pool.borrow().idle_count("h", 80), 0);
        assert!(!conn.is_connected());
    }

    #[test]
    fn retry_after_idle_close_resends_request() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        // Two pooled connections: the first dies before responding.
        let (t1, conn1) = preload(&core, &ctx);
        let (t2, conn2) = preload(&core, &ctx);
        let got = new_got();
        let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
        client.req_start("GET", "http://h/", &Headers::new(),
            Box::new(|_| {}));
        // LIFO: conn2 is used first.
        conn2.on_writable();
        assert!(t2.take_written().starts_with(b"GET / HTTP/1.1\r\n"));
        t2.push_eof();
        conn2.on_readable();
        // The request was resent on the remaining pooled connection.
        conn1.on_writable();
        assert!(t1.take_written().starts_with(b"GET / HTTP/1.1\r\n"));
        t1.push_read(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        conn1.on_readable();
        let g = got.borrow();
        assert_eq!(g.head.as_ref().unwrap().code, 200);
        assert_eq!(&g.record.borrow().data[..], b"ok");
    }

    #[test]
    fn post_is_not_retried() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        let (_t1, conn1) = preload(&core, &ctx);
        let (t2, conn2) = preload(&core, &ctx);
        let got = new_got();
        let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
        let mut hdrs = Headers::new();
        hdrs.push("Content-Length", "2");
        let body = client.req_start("POST", "http://h/", &hdrs,
            Box::new(|_| {}));
        body.write(b"hi");
        body.done(None);
        conn2.on_writable();
        t2.take_written();
        t2.push_eof();
        conn2.on_readable();
        // No resend: a synthetic 504 reports the failure instead.
        let g = got.borrow();
        let head = g.head.as_ref().unwrap();
        assert_eq!(head.code, 504);
        assert_eq!(head.reason, "Gateway Timeout");
        let rec = g.record.borrow();
        assert!(String::from_utf8_lossy(&rec.data)
            .contains("Server closed the connection."));
        assert_eq!(rec.end_count, 1);
        assert!(rec.err.is_some());
        drop(rec);
        drop(g);
        assert!(conn1.is_connected(), "other pooled conn untouched");
    }

    #[test]
    fn retry_limit_is_enforced() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        // Three pooled connections all slam the door: the initial
        // try plus two retries, then the error surfaces.
        let (t1, c1) = preload(&core, &ctx);
        let (t2, c2) = preload(&core, &ctx);
        let (t3, c3) = preload(&core, &ctx);
        let got = new_got();
        let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
        client.req_start("GET", "http://h/", &Headers::new(),
            Box::new(|_| {}));
        // Pool is LIFO, so attempts run c3, c2, c1.
        for &(t, conn) in &[(&t3, &c3), (&t2, &c2), (&t1, &c1)] {
            assert!(got.borrow().head.is_none(),
                "error surfaced too early");
            conn.on_writable();
            assert!(t.take_written().starts_with(b"GET / HTTP/1.1\r\n"));
            t.push_eof();
            conn.on_readable();
        }
        let g = got.borrow();
        let head = g.head.as_ref().unwrap();
        assert_eq!(head.code, 504);
        let rec = g.record.borrow();
        assert!(String::from_utf8_lossy(&rec.data)
            .contains("Server closed the connection."));
        assert_eq!(rec.end_count, 1);
    }

    #[test]
    fn unsupported_scheme_is_a_url_error() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        let got = new_got();
        let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
        client.req_start("GET", "ftp://h/file", &Headers::new(),
            Box::new(|_| {}));
        let g = got.borrow();
        let head = g.head.as_ref().unwrap();
        assert_eq!(head.code, 400);
        assert!(String::from_utf8_lossy(&g.record.borrow().data)
            .contains("unsupported scheme"));
        assert_eq!(g.record.borrow().end_count, 1);
    }

    #[test]
    fn body_without_content_length_is_rejected() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        let (_t, _conn) = preload(&core, &ctx);
        let got = new_got();
        let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
        let body = client.req_start("POST", "http://h/",
            &Headers::new(), Box::new(|_| {}));
        body.write(b"oops");
        let g = got.borrow();
        assert_eq!(g.head.as_ref().unwrap().code, 400);
        assert!(String::from_utf8_lossy(&g.record.borrow().data)
            .contains("Content-Length"));
    }

    #[test]
    fn connection_close_response_is_not_pooled() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        let (t, conn) = preload(&core, &ctx);
        let got = new_got();
        let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
        client.req_start("GET", "http://h/", &Headers::new(),
            Box::new(|_| {}));
        conn.on_writable();
        t.push_read(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\
            Content-Length: 2\r\n\r\nok");
        conn.on_readable();
        assert_eq!(got.borrow().record.borrow().end_count, 1);
        assert_eq!(ctx.pool.borrow().idle_count("h", 80), 0);
        assert!(!conn.is_connected());
    }

    #[test]
    fn pooled_connection_serves_two_requests() {
        let core = Core::new().unwrap();
        let ctx = context(&core);
        let (t, conn) = preload(&core, &ctx);
        for path in &["/one", "/two"] {
            let got = new_got();
            let client = Client::new(&ctx, Box::new(handler_fn(recording_handler(&got))));
            let uri = format!("http://h{}", path);
            client.req_start("GET", &uri, &Headers::new(),
                Box::new(|_| {}));
            conn.on_writable();
            let text = String::from_utf8(t.take_written()).unwrap();
            assert!(text.starts_with(&format!("GET {} ", path)),
                "sent: {}", text);
            t.push_read(
                b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody");
            conn.on_readable();
            let g = got.borrow();
            assert_eq!(&g.record.borrow().data[..], b"body");
            assert_eq!(g.record.borrow().end_count, 1);
            assert_eq!(ctx.pool.borrow().idle_count("h", 80), 1,
                "connection re-pooled after {}", path);
        }
    }
}
