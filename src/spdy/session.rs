//! SPDY session: multiplexed streams over one TCP connection.
//!
//! A session owns the frame parser and the two zlib streams; every
//! header block on the wire advances the shared compression state,
//! so frames are handled strictly in arrival order. The server side
//! exposes the same [`Service`] contract as the HTTP server, with
//! `method`/`url`/`version` pseudo-headers in and `status`/`version`
//! out.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;
use std::rc::{Rc, Weak};

use crate::conn::TcpConn;
use crate::error::Error;
use crate::handler::{
    BodySink, PauseHandle, Request, Responder, ResponseHandler,
    ResponseHead, Service, StartResponse, WriteBody,
};
use crate::headers::{self, Headers};
use crate::version::Version;

use super::frame::{self, CtlType, FrameParser, FrameSink, FLAG_FIN,
    FLAG_NONE};
use super::zlib::{Compressor, Decompressor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

struct Stream {
    /// Consumer of the inbound body (request on the server side,
    /// response on the client side).
    sink: Option<Box<dyn BodySink>>,
    /// Client side only: waiting for SYN_REPLY.
    handler: Option<Box<dyn ResponseHandler>>,
    /// Outbound producer's pause hook.
    pause_cb: Option<Box<dyn FnMut(bool)>>,
    remote_done: bool,
    local_done: bool,
    end_delivered: bool,
}

impl Stream {
    fn new() -> Stream {
        Stream {
            sink: None,
            handler: None,
            pause_cb: None,
            remote_done: false,
            local_done: false,
            end_delivered: false,
        }
    }
}

/// One SPDY session over one connection.
pub struct SpdySession {
    conn: Weak<TcpConn>,
    role: Role,
    framer: RefCell<FrameParser>,
    zin: RefCell<Decompressor>,
    zout: RefCell<Compressor>,
    streams: RefCell<HashMap<u32, Stream>>,
    service: Option<Rc<RefCell<dyn Service>>>,
    /// Next outbound stream id: odd for clients, even for servers.
    next_local: Cell<u32>,
    last_remote: Cell<u32>,
    goaway: Cell<bool>,
}

struct SessionSink<'a> {
    session: &'a Rc<SpdySession>,
}

impl<'a> FrameSink for SessionSink<'a> {
    fn data_frame(&mut self, stream_id: u32, flags: u8, payload: &[u8]) {
        self.session.on_data(stream_id, flags, payload);
    }

    fn control_frame(&mut self, ctl: CtlType, flags: u8, payload: &[u8]) {
        self.session.on_control(ctl, flags, payload);
    }

    fn unknown_frame(&mut self, code: u16, _flags: u8) {
        warn!("ignoring unknown frame type {:#x}", code);
    }
}

impl SpdySession {
    /// Server end of a session: every inbound SYN_STREAM becomes a
    /// call on `service`.
    pub fn server(conn: &Rc<TcpConn>, service: Rc<RefCell<dyn Service>>)
        -> Rc<SpdySession>
    {
        SpdySession::attach(conn, Role::Server, Some(service))
    }

    /// Client end of a session; start requests with
    /// [`SpdySession::request`].
    pub fn client(conn: &Rc<TcpConn>) -> Rc<SpdySession> {
        SpdySession::attach(conn, Role::Client, None)
    }

    fn attach(conn: &Rc<TcpConn>, role: Role,
        service: Option<Rc<RefCell<dyn Service>>>) -> Rc<SpdySession>
    {
        let session = Rc::new(SpdySession {
            conn: Rc::downgrade(conn),
            role: role,
            framer: RefCell::new(FrameParser::new()),
            zin: RefCell::new(Decompressor::new()),
            zout: RefCell::new(Compressor::new()),
            streams: RefCell::new(HashMap::new()),
            service: service,
            next_local: Cell::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            last_remote: Cell::new(0),
            goaway: Cell::new(false),
        });
        let read = session.clone();
        let close = session.clone();
        let pause = session.clone();
        conn.set_callbacks(
            Box::new(move |data| read.feed(data)),
            Box::new(move || close.conn_closed()),
            Box::new(move |flag| pause.forward_pause(flag)));
        session
    }

    /// Start a request on this session. The response arrives through
    /// `handler`; the returned channel carries the request body.
    pub fn request(self: &Rc<Self>, method: &str, uri: &str,
        headers: &Headers, handler: Box<dyn ResponseHandler>,
        pause_cb: Box<dyn FnMut(bool)>) -> SpdyRequestBody
    {
        let id = self.next_local.get();
        self.next_local.set(id + 2);
        {
            let mut streams = self.streams.borrow_mut();
            let mut stream = Stream::new();
            stream.handler = Some(handler);
            stream.pause_cb = Some(pause_cb);
            streams.insert(id, stream);
        }
        let mut pairs = vec![
            ("method".to_string(), method.to_string()),
            ("url".to_string(), uri.to_string()),
            ("version".to_string(), "HTTP/1.1".to_string()),
        ];
        for (name, value) in headers.iter() {
            if name.eq_ignore_ascii_case("host")
                || headers::is_hop_by_hop(name)
            {
                continue;
            }
            pairs.push((name.to_string(), value.to_string()));
        }
        debug!("stream {} request {} {}", id, method, uri);
        let bytes = frame::syn_frame(CtlType::SynStream, FLAG_NONE, id,
            &pairs, &mut self.zout.borrow_mut());
        if let Some(conn) = self.conn.upgrade() {
            conn.write(&bytes);
        }
        SpdyRequestBody { session: Rc::downgrade(self), id: id }
    }

    /// True while the underlying connection is usable.
    pub fn is_alive(&self) -> bool {
        self.conn.upgrade().map(|c| c.is_connected()).unwrap_or(false)
    }

    fn feed(self: &Rc<Self>, data: &[u8]) {
        let mut framer = self.framer.borrow_mut();
        framer.feed(data, &mut SessionSink { session: self });
    }

    fn conn_closed(self: &Rc<Self>) {
        debug!("session connection closed");
        self.shutdown("Server closed the connection.");
    }

    /// Stream backpressure is coarse: a congested connection pauses
    /// every stream's producer.
    fn forward_pause(&self, paused: bool) {
        let ids: Vec<u32> =
            self.streams.borrow().keys().cloned().collect();
        for id in ids {
            let cb = self.streams.borrow_mut()
                .get_mut(&id)
                .and_then(|stream| stream.pause_cb.take());
            if let Some(mut cb) = cb {
                cb(paused);
                let mut streams = self.streams.borrow_mut();
                if let Some(stream) = streams.get_mut(&id) {
                    if stream.pause_cb.is_none() {
                        stream.pause_cb = Some(cb);
                    }
                }
            }
        }
    }

    fn on_data(self: &Rc<Self>, id: u32, flags: u8, payload: &[u8]) {
        let sink = {
            let mut streams = self.streams.borrow_mut();
            match streams.get_mut(&id) {
                Some(stream) if !stream.end_delivered => {
                    stream.sink.take()
                }
                Some(_) => None,
                None => {
                    warn!("data frame for unknown stream {}", id);
                    return;
                }
            }
        };
        if let Some(mut sink) = sink {
            if !payload.is_empty() {
                sink.data(payload);
            }
            let mut streams = self.streams.borrow_mut();
            if let Some(stream) = streams.get_mut(&id) {
                if stream.sink.is_none() {
                    stream.sink = Some(sink);
                }
            }
        }
        if flags & FLAG_FIN != 0 {
            self.end_remote(id);
        }
    }

    fn on_control(self: &Rc<Self>, ctl: CtlType, flags: u8,
        payload: &[u8])
    {
        match ctl {
            CtlType::SynStream => self.on_syn_stream(flags, payload),
            CtlType::SynReply => self.on_syn_reply(flags, payload),
            CtlType::FinStream => self.on_fin_stream(payload),
            CtlType::Hello | CtlType::Noop | CtlType::Ping => {
                trace!("ignoring {:?} frame", ctl);
            }
            CtlType::Goaway => {
                debug!("peer sent GOAWAY");
                self.shutdown("session going away");
            }
        }
    }

    fn on_syn_stream(self: &Rc<Self>, flags: u8, payload: &[u8]) {
        let id = match frame::read_stream_id(payload) {
            Some(id) if payload.len() >= 6 => id,
            _ => {
                warn!("truncated SYN_STREAM");
                return;
            }
        };
        // Decode before any validation: every header block advances
        // the shared inflater, even one for a stream we reject.
        let pairs = match frame::decode_header_block(&payload[6..],
            &mut self.zin.borrow_mut())
        {
            Ok(pairs) => pairs,
            Err(()) => {
                // The shared decompressor is out of sync now; the
                // whole session is unusable.
                warn!("bad header block on stream {}", id);
                self.shutdown("bad header block");
                return;
            }
        };
        let service = match self.service {
            Some(ref service) => service.clone(),
            None => {
                warn!("unexpected SYN_STREAM on a client session");
                self.send_fin(id);
                return;
            }
        };
        if self.goaway.get() {
            self.send_fin(id);
            return;
        }
        // Peer-initiated ids must keep their parity and grow.
        let parity = match self.role { Role::Server => 1, Role::Client => 0 };
        if id == 0 || id % 2 != parity || id <= self.last_remote.get() {
            warn!("rejecting stream {}: bad stream id", id);
            self.send_fin(id);
            return;
        }
        self.last_remote.set(id);
        let mut method = None;
        let mut url = None;
        let mut version = None;
        let mut hdrs = Headers::new();
        for (name, value) in pairs {
            match name.as_str() {
                "method" => method = Some(value),
                "url" => url = Some(value),
                "version" => version = Some(value),
                _ => hdrs.push(&name, &value),
            }
        }
        let (method, url) = match (method, url) {
            (Some(method), Some(url)) => (method, url),
            _ => {
                warn!("stream {} missing method/url pseudo-headers", id);
                self.send_fin(id);
                return;
            }
        };
        let version = version
            .and_then(|v| Version::parse(&v))
            .unwrap_or(Version::Http11);
        self.streams.borrow_mut().insert(id, Stream::new());
        debug!("stream {} request {} {}", id, method, url);
        let responder = Responder {
            inner: Box::new(SpdyResponder {
                session: Rc::downgrade(self),
                id: id,
            }),
        };
        let pause = match self.conn.upgrade() {
            Some(ref conn) => PauseHandle::new(conn),
            None => PauseHandle::dead(),
        };
        let req = Request {
            method: method,
            target: url,
            version: version,
            headers: hdrs,
        };
        let sink = service.borrow_mut().call(req, responder, pause);
        {
            let mut streams = self.streams.borrow_mut();
            if let Some(stream) = streams.get_mut(&id) {
                if stream.sink.is_none() {
                    stream.sink = Some(sink);
                }
            }
        }
        if flags & FLAG_FIN != 0 {
            self.end_remote(id);
        }
    }

    fn on_syn_reply(self: &Rc<Self>, flags: u8, payload: &[u8]) {
        let id = match frame::read_stream_id(payload) {
            Some(id) if payload.len() >= 6 => id,
            _ => {
                warn!("truncated SYN_REPLY");
                return;
            }
        };
        let pairs = match frame::decode_header_block(&payload[6..],
            &mut self.zin.borrow_mut())
        {
            Ok(pairs) => pairs,
            Err(()) => {
                warn!("bad header block on stream {}", id);
                self.shutdown("bad header block");
                return;
            }
        };
        let handler = self.streams.borrow_mut()
            .get_mut(&id)
            .and_then(|stream| stream.handler.take());
        let mut handler = match handler {
            Some(handler) => handler,
            None => {
                warn!("SYN_REPLY for unknown stream {}", id);
                return;
            }
        };
        let mut status = None;
        let mut version = None;
        let mut hdrs = Headers::new();
        for (name, value) in pairs {
            match name.as_str() {
                "status" => status = Some(value),
                "version" => version = Some(value),
                _ => hdrs.push(&name, &value),
            }
        }
        let (code, phrase) = match status {
            Some(ref status) => {
                let mut split = status.splitn(2, ' ');
                let code = split.next().unwrap_or("").parse().ok();
                match code {
                    Some(code) => {
                        (code, split.next().unwrap_or("").to_string())
                    }
                    None => {
                        warn!("stream {} has a bad status {:?}",
                            id, status);
                        synthetic_response(&mut handler, Error::Connect(
                            "bad status in reply".to_string()));
                        self.drop_stream(id);
                        return;
                    }
                }
            }
            None => {
                warn!("stream {} reply missing status", id);
                synthetic_response(&mut handler, Error::Connect(
                    "reply missing status".to_string()));
                self.drop_stream(id);
                return;
            }
        };
        let version = version
            .and_then(|v| Version::parse(&v))
            .unwrap_or(Version::Http11);
        debug!("stream {} reply {} {}", id, code, phrase);
        let head = ResponseHead {
            version: version,
            code: code,
            reason: phrase,
            headers: hdrs,
        };
        let pause = match self.conn.upgrade() {
            Some(ref conn) => PauseHandle::new(conn),
            None => PauseHandle::dead(),
        };
        let sink = handler.response_start(head, pause);
        {
            let mut streams = self.streams.borrow_mut();
            if let Some(stream) = streams.get_mut(&id) {
                if stream.sink.is_none() {
                    stream.sink = Some(sink);
                }
            }
        }
        if flags & FLAG_FIN != 0 {
            self.end_remote(id);
        }
    }

    /// FIN_STREAM is a reset: the stream dies, the session lives.
    fn on_fin_stream(self: &Rc<Self>, payload: &[u8]) {
        let id = match frame::read_stream_id(payload) {
            Some(id) => id,
            None => return,
        };
        debug!("stream {} reset by peer", id);
        let stream = self.streams.borrow_mut().remove(&id);
        if let Some(mut stream) = stream {
            if stream.end_delivered {
                return;
            }
            if let Some(mut sink) = stream.sink.take() {
                sink.end(Some(Error::Connect(
                    "stream reset by peer".to_string())));
            } else if let Some(mut handler) = stream.handler.take() {
                synthetic_response(&mut handler, Error::Connect(
                    "stream reset by peer".to_string()));
            }
        }
    }

    fn end_remote(self: &Rc<Self>, id: u32) {
        let sink = {
            let mut streams = self.streams.borrow_mut();
            match streams.get_mut(&id) {
                Some(stream) if !stream.end_delivered => {
                    stream.remote_done = true;
                    stream.end_delivered = true;
                    stream.sink.take()
                }
                _ => None,
            }
        };
        if let Some(mut sink) = sink {
            sink.end(None);
        }
        self.maybe_remove(id);
    }

    fn maybe_remove(&self, id: u32) {
        let mut streams = self.streams.borrow_mut();
        let done = streams.get(&id)
            .map(|stream| stream.remote_done && stream.local_done)
            .unwrap_or(false);
        if done {
            trace!("stream {} complete", id);
            streams.remove(&id);
        }
    }

    fn drop_stream(&self, id: u32) {
        self.streams.borrow_mut().remove(&id);
    }

    fn send_fin(&self, id: u32) {
        if let Some(conn) = self.conn.upgrade() {
            conn.write(&frame::fin_stream_frame(id));
        }
    }

    /// Fail every open stream and close the connection.
    fn shutdown(self: &Rc<Self>, reason: &str) {
        if self.goaway.replace(true) {
            return;
        }
        let streams = mem::replace(&mut *self.streams.borrow_mut(),
            HashMap::new());
        for (id, mut stream) in streams {
            if stream.end_delivered {
                continue;
            }
            trace!("failing stream {}: {}", id, reason);
            if let Some(mut sink) = stream.sink.take() {
                sink.end(Some(Error::Connect(reason.to_string())));
            } else if let Some(mut handler) = stream.handler.take() {
                synthetic_response(&mut handler,
                    Error::Connect(reason.to_string()));
            }
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.close();
        }
    }

    fn res_start(&self, id: u32, code: u16, phrase: &str,
        headers: &Headers, pause_cb: Option<Box<dyn FnMut(bool)>>)
    {
        {
            let mut streams = self.streams.borrow_mut();
            match streams.get_mut(&id) {
                Some(stream) => stream.pause_cb = pause_cb,
                None => return,
            }
        }
        let mut pairs = vec![
            ("status".to_string(), format!("{} {}", code, phrase)),
            ("version".to_string(), "HTTP/1.1".to_string()),
        ];
        for (name, value) in headers.iter() {
            if headers::is_hop_by_hop(name) {
                continue;
            }
            pairs.push((name.to_string(), value.to_string()));
        }
        debug!("stream {} reply {} {}", id, code, phrase);
        let bytes = frame::syn_frame(CtlType::SynReply, FLAG_NONE, id,
            &pairs, &mut self.zout.borrow_mut());
        if let Some(conn) = self.conn.upgrade() {
            conn.write(&bytes);
        }
    }

    fn write_body(&self, id: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if !self.streams.borrow().contains_key(&id) {
            return;
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.write(&frame::data_frame(id, FLAG_NONE, data));
        }
    }

    fn finish_local(&self, id: u32, err: Option<Error>) {
        if !self.streams.borrow().contains_key(&id) {
            return;
        }
        match err {
            None => {
                if let Some(conn) = self.conn.upgrade() {
                    conn.write(&frame::data_frame(id, FLAG_FIN, b""));
                }
                let mut streams = self.streams.borrow_mut();
                if let Some(stream) = streams.get_mut(&id) {
                    stream.local_done = true;
                }
            }
            Some(e) => {
                debug!("stream {} aborted: {}", id, e);
                self.send_fin(id);
                self.drop_stream(id);
                return;
            }
        }
        self.maybe_remove(id);
    }
}

/// Report a failure to a response handler that never got a real
/// response, as a synthetic error response.
pub(crate) fn synthetic_response(handler: &mut Box<dyn ResponseHandler>,
    err: Error)
{
    let (code, phrase) = err.status();
    let mut hdrs = Headers::new();
    hdrs.push("Content-Type", "text/plain");
    let head = ResponseHead {
        version: Version::Http11,
        code: code,
        reason: phrase.to_string(),
        headers: hdrs,
    };
    let mut sink = handler.response_start(head, PauseHandle::dead());
    sink.data(format!("{}", err).as_bytes());
    sink.end(Some(err));
}

struct SpdyResponder {
    session: Weak<SpdySession>,
    id: u32,
}

impl StartResponse for SpdyResponder {
    fn start(self: Box<Self>, code: u16, phrase: &str, headers: &Headers,
        pause_cb: Option<Box<dyn FnMut(bool)>>) -> Box<dyn WriteBody>
    {
        let SpdyResponder { session, id } = *self;
        if let Some(s) = session.upgrade() {
            s.res_start(id, code, phrase, headers, pause_cb);
        }
        Box::new(SpdyStreamBody { session: session, id: id })
    }
}

struct SpdyStreamBody {
    session: Weak<SpdySession>,
    id: u32,
}

impl WriteBody for SpdyStreamBody {
    fn write(&mut self, data: &[u8]) {
        if let Some(s) = self.session.upgrade() {
            s.write_body(self.id, data);
        }
    }

    fn done(self: Box<Self>, err: Option<Error>) {
        if let Some(s) = self.session.upgrade() {
            s.finish_local(self.id, err);
        }
    }
}

/// The request body channel of a stream started with
/// [`SpdySession::request`].
pub struct SpdyRequestBody {
    session: Weak<SpdySession>,
    id: u32,
}

impl SpdyRequestBody {
    pub fn write(&self, data: &[u8]) {
        if let Some(s) = self.session.upgrade() {
            s.write_body(self.id, data);
        }
    }

    pub fn done(self) {
        if let Some(s) = self.session.upgrade() {
            s.finish_local(self.id, None);
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::conn::TcpConn;
    use crate::handler::{
        handler_fn, service_fn, BodySink, NullSink, PauseHandle,
        Request, Responder, ResponseHead,
    };
    use crate::headers::Headers;
    use crate::mock::{RecordingSink, ScriptedTransport, SinkRecord};
    use crate::reactor::Core;
    use crate::spdy::frame::{self, CtlType, FrameParser, FrameSink,
        FLAG_FIN, FLAG_NONE};
    use crate::spdy::zlib::{Compressor, Decompressor};

    use super::SpdySession;

    /// Decode the frames a session wrote, with a peer-side inflater.
    #[derive(Default)]
    struct PeerView {
        events: Vec<(String, u32, u8, Vec<(String, String)>, Vec<u8>)>,
    }

    struct PeerSink<'a> {
        view: &'a mut PeerView,
        zin: &'a mut Decompressor,
    }

    impl<'a> FrameSink for PeerSink<'a> {
        fn data_frame(&mut self, stream_id: u32, flags: u8,
            payload: &[u8])
        {
            self.view.events.push(("data".to_string(), stream_id,
                flags, Vec::new(), payload.to_vec()));
        }
        fn control_frame(&mut self, ctl: CtlType, flags: u8,
            payload: &[u8])
        {
            let name = format!("{:?}", ctl);
            let id = frame::read_stream_id(payload).unwrap_or(0);
            let headers = if payload.len() > 6 {
                frame::decode_header_block(&payload[6..], self.zin)
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
            self.view.events.push((name, id, flags, headers,
                Vec::new()));
        }
        fn unknown_frame(&mut self, code: u16, _flags: u8) {
            panic!("unknown frame {}", code);
        }
    }

    fn parse_written(t: &ScriptedTransport, zin: &mut Decompressor)
        -> PeerView
    {
        let mut view = PeerView::default();
        let mut parser = FrameParser::new();
        let bytes = t.take_written();
        parser.feed(&bytes, &mut PeerSink { view: &mut view, zin: zin });
        view
    }

    fn server_session<S>(service: S)
        -> (Core, ScriptedTransport, Rc<TcpConn>)
        where S: FnMut(Request, Responder, PauseHandle)
            -> Box<dyn BodySink> + 'static
    {
        let core = Core::new().unwrap();
        let t = ScriptedTransport::new();
        let conn = TcpConn::new(Box::new(t.clone()), "peer", 4242,
            core.handle());
        SpdySession::server(&conn,
            Rc::new(RefCell::new(service_fn(service))));
        (core, t, conn)
    }

    #[test]
    fn syn_stream_with_fin_runs_the_service() {
        let seen: Rc<RefCell<Vec<(String, String)>>> =
            Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let record: Rc<RefCell<Option<Rc<RefCell<SinkRecord>>>>> =
            Rc::new(RefCell::new(None));
        let record2 = record.clone();
        let service = move |req: Request, res: Responder,
            _p: PauseHandle| -> Box<dyn BodySink>
        {
            seen2.borrow_mut().push((req.method.clone(),
                req.target.clone()));
            let mut hdrs = Headers::new();
            hdrs.push("Content-Type", "text/plain");
            let mut body = res.start(200, "OK", &hdrs, Box::new(|_| {}));
            body.write(b"hi");
            body.done(None);
            let (sink, rec) = RecordingSink::new();
            *record2.borrow_mut() = Some(rec);
            Box::new(sink)
        };
        let (_core, t, conn) = server_session(service);

        // Client half: its own zlib streams.
        let mut zout = Compressor::new();
        let mut zin = Decompressor::new();
        let pairs = vec![
            ("method".to_string(), "GET".to_string()),
            ("url".to_string(), "http://h/p".to_string()),
            ("version".to_string(), "HTTP/1.1".to_string()),
        ];
        let syn = frame::syn_frame(CtlType::SynStream, FLAG_FIN, 1,
            &pairs, &mut zout);
        t.push_read(&syn);
        conn.on_readable();

        assert_eq!(&seen.borrow()[..],
            &[("GET".to_string(), "http://h/p".to_string())][..]);
        // The request had FLAG_FIN: its (empty) body completed.
        let rec = record.borrow().clone().unwrap();
        assert_eq!(rec.borrow().end_count, 1);
        assert!(rec.borrow().err.is_none());

        conn.on_writable();
        let view = parse_written(&t, &mut zin);
        assert_eq!(view.events.len(), 3);
        let &(ref kind, id, flags, ref headers, _) = &view.events[0];
        assert_eq!(kind, "SynReply");
        assert_eq!(id, 1);
        assert_eq!(flags, FLAG_NONE);
        assert!(headers.contains(
            &("status".to_string(), "200 OK".to_string())));
        assert!(headers.contains(
            &("version".to_string(), "HTTP/1.1".to_string())));
        assert!(headers.contains(
            &("content-type".to_string(), "text/plain".to_string())));
        assert_eq!(view.events[1],
            ("data".to_string(), 1, FLAG_NONE, Vec::new(),
             b"hi".to_vec()));
        assert_eq!(view.events[2],
            ("data".to_string(), 1, FLAG_FIN, Vec::new(), Vec::new()));
    }

    #[test]
    fn data_frames_feed_the_request_sink() {
        let record: Rc<RefCell<Option<Rc<RefCell<SinkRecord>>>>> =
            Rc::new(RefCell::new(None));
        let record2 = record.clone();
        let service = move |_req: Request, res: Responder,
            _p: PauseHandle| -> Box<dyn BodySink>
        {
            let mut hdrs = Headers::new();
            hdrs.push("Content-Type", "text/plain");
            res.start(200, "OK", &hdrs, Box::new(|_| {})).done(None);
            let (sink, rec) = RecordingSink::new();
            *record2.borrow_mut() = Some(rec);
            Box::new(sink)
        };
        let (_core, t, conn) = server_session(service);
        let mut zout = Compressor::new();
        let pairs = vec![
            ("method".to_string(), "POST".to_string()),
            ("url".to_string(), "http://h/upload".to_string()),
            ("version".to_string(), "HTTP/1.1".to_string()),
        ];
        let mut bytes = frame::syn_frame(CtlType::SynStream, FLAG_NONE,
            1, &pairs, &mut zout);
        bytes.extend_from_slice(
            &frame::data_frame(1, FLAG_NONE, b"hello "));
        bytes.extend_from_slice(
            &frame::data_frame(1, FLAG_FIN, b"world"));
        t.push_read(&bytes);
        conn.on_readable();
        let rec = record.borrow().clone().unwrap();
        assert_eq!(&rec.borrow().data[..], b"hello world");
        assert_eq!(rec.borrow().end_count, 1);
    }

    #[test]
    fn decompressor_state_spans_streams() {
        // Scenario: two SYN_STREAMs on one session; the second only
        // decodes if the server's inflater kept the first's state.
        let seen: Rc<RefCell<Vec<String>>> =
            Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let service = move |req: Request, res: Responder,
            _p: PauseHandle| -> Box<dyn BodySink>
        {
            seen2.borrow_mut().push(req.target.clone());
            res.start(200, "OK", &Headers::new(), Box::new(|_| {}))
                .done(None);
            Box::new(NullSink)
        };
        let (_core, t, conn) = server_session(service);
        let mut zout = Compressor::new();
        for (id, url) in &[(1u32, "http://h/one"), (3, "http://h/two")] {
            let pairs = vec![
                ("method".to_string(), "GET".to_string()),
                ("url".to_string(), url.to_string()),
                ("version".to_string(), "HTTP/1.1".to_string()),
            ];
            let syn = frame::syn_frame(CtlType::SynStream, FLAG_FIN,
                *id, &pairs, &mut zout);
            t.push_read(&syn);
        }
        conn.on_readable();
        assert_eq!(&seen.borrow()[..],
            &["http://h/one".to_string(), "http://h/two".to_string()][..]);
    }

    #[test]
    fn even_or_stale_stream_ids_are_reset() {
        let called = Rc::new(RefCell::new(0));
        let c2 = called.clone();
        let service = move |_req: Request, _res: Responder,
            _p: PauseHandle| -> Box<dyn BodySink>
        {
            *c2.borrow_mut() += 1;
            Box::new(NullSink)
        };
        let (_core, t, conn) = server_session(service);
        let mut zout = Compressor::new();
        let pairs = vec![
            ("method".to_string(), "GET".to_string()),
            ("url".to_string(), "http://h/".to_string()),
        ];
        // Server-parity id from a client: rejected.
        let syn = frame::syn_frame(CtlType::SynStream, FLAG_FIN, 2,
            &pairs, &mut zout);
        t.push_read(&syn);
        conn.on_readable();
        assert_eq!(*called.borrow(), 0);
        conn.on_writable();
        let mut zin = Decompressor::new();
        let view = parse_written(&t, &mut zin);
        assert_eq!(view.events.len(), 1);
        assert_eq!(view.events[0].0, "FinStream");
        assert_eq!(view.events[0].1, 2);
    }

    #[test]
    fn goaway_fails_open_streams_and_closes() {
        let record: Rc<RefCell<Option<Rc<RefCell<SinkRecord>>>>> =
            Rc::new(RefCell::new(None));
        let record2 = record.clone();
        let service = move |_req: Request, _res: Responder,
            _p: PauseHandle| -> Box<dyn BodySink>
        {
            // Response intentionally left hanging.
            let (sink, rec) = RecordingSink::new();
            *record2.borrow_mut() = Some(rec);
            Box::new(sink)
        };
        let (_core, t, conn) = server_session(service);
        let mut zout = Compressor::new();
        let pairs = vec![
            ("method".to_string(), "POST".to_string()),
            ("url".to_string(), "http://h/".to_string()),
            ("version".to_string(), "HTTP/1.1".to_string()),
        ];
        let mut bytes = frame::syn_frame(CtlType::SynStream, FLAG_NONE,
            1, &pairs, &mut zout);
        bytes.extend_from_slice(
            &frame::control_frame(CtlType::Goaway, FLAG_NONE, b""));
        t.push_read(&bytes);
        conn.on_readable();
        let rec = record.borrow().clone().unwrap();
        assert_eq!(rec.borrow().end_count, 1);
        assert!(rec.borrow().err.as_ref().unwrap()
            .contains("session going away"));
        assert!(!conn.is_connected());
    }

    #[test]
    fn client_session_round_trip() {
        let core = Core::new().unwrap();
        let t = ScriptedTransport::new();
        let conn = TcpConn::new(Box::new(t.clone()), "h", 4242,
            core.handle());
        let session = SpdySession::client(&conn);
        let got: Rc<RefCell<Option<ResponseHead>>> =
            Rc::new(RefCell::new(None));
        let record: Rc<RefCell<Option<Rc<RefCell<SinkRecord>>>>> =
            Rc::new(RefCell::new(None));
        let (g2, r2) = (got.clone(), record.clone());
        let handler = move |head: ResponseHead, _p: PauseHandle|
            -> Box<dyn BodySink>
        {
            *g2.borrow_mut() = Some(head);
            let (sink, rec) = RecordingSink::new();
            *r2.borrow_mut() = Some(rec);
            Box::new(sink)
        };
        let body = session.request("GET", "http://h/x", &Headers::new(),
            Box::new(handler_fn(handler)), Box::new(|_| {}));
        body.done();
        conn.on_writable();
        // Peer view of what the client sent.
        let mut zin = Decompressor::new();
        let view = parse_written(&t, &mut zin);
        assert_eq!(view.events[0].0, "SynStream");
        assert_eq!(view.events[0].1, 1, "client ids start odd");
        assert!(view.events[0].3.contains(
            &("method".to_string(), "GET".to_string())));
        assert!(view.events[0].3.contains(
            &("url".to_string(), "http://h/x".to_string())));
        // Peer replies.
        let mut zout = Compressor::new();
        let reply = frame::syn_frame(CtlType::SynReply, FLAG_NONE, 1,
            &[("status".to_string(), "200 OK".to_string()),
              ("version".to_string(), "HTTP/1.1".to_string()),
              ("content-type".to_string(), "text/plain".to_string())],
            &mut zout);
        t.push_read(&reply);
        t.push_read(&frame::data_frame(1, FLAG_FIN, b"payload"));
        conn.on_readable();
        let head = got.borrow_mut().take().unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.headers.get("content-type"), Some("text/plain"));
        let rec = record.borrow().clone().unwrap();
        assert_eq!(&rec.borrow().data[..], b"payload");
        assert_eq!(rec.borrow().end_count, 1);
    }
}
