//! The contract between connections and application handlers.
//!
//! Connections *push*: a server connection hands each request to a
//! [`Service`] along with a [`Responder`] capability for answering
//! it; a client hands each response to a [`ResponseHandler`]. Body
//! bytes flow into the [`BodySink`] the handler returns. All
//! capabilities are weak: after the underlying connection is torn
//! down they become no-ops rather than errors.

use std::rc::{Rc, Weak};

use crate::conn::TcpConn;
use crate::error::Error;
use crate::headers::Headers;
use crate::version::Version;

/// Head of a request, as handed to a [`Service`].
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

/// Head of a response, as handed to a [`ResponseHandler`].
#[derive(Debug)]
pub struct ResponseHead {
    pub version: Version,
    pub code: u16,
    pub reason: String,
    pub headers: Headers,
}

/// Consumer of one message body.
///
/// `data` is called in byte order with no gaps; `end` exactly once,
/// with `None` on clean completion. No `data` follows `end`.
pub trait BodySink {
    fn data(&mut self, chunk: &[u8]);
    fn end(&mut self, err: Option<Error>);
}

/// A sink for bodies nobody cares about.
pub struct NullSink;

impl BodySink for NullSink {
    fn data(&mut self, _chunk: &[u8]) {}
    fn end(&mut self, _err: Option<Error>) {}
}

/// Server-side application handler, shared by the HTTP and SPDY
/// servers.
///
/// The handler may answer synchronously through `res` or stash the
/// capability and answer later; either way exactly one response per
/// request. The returned sink receives the request body. `pause`
/// lets the handler throttle that body.
pub trait Service {
    fn call(&mut self, req: Request, res: Responder, pause: PauseHandle)
        -> Box<dyn BodySink>;
}

/// Wrap a closure as a [`Service`].
pub fn service_fn<F>(f: F) -> ServiceFn<F>
    where F: FnMut(Request, Responder, PauseHandle) -> Box<dyn BodySink>
{
    ServiceFn(f)
}

pub struct ServiceFn<F>(F);

impl<F> Service for ServiceFn<F>
    where F: FnMut(Request, Responder, PauseHandle) -> Box<dyn BodySink>
{
    fn call(&mut self, req: Request, res: Responder, pause: PauseHandle)
        -> Box<dyn BodySink>
    {
        (self.0)(req, res, pause)
    }
}

/// Client-side response receiver, shared by the HTTP and SPDY
/// clients.
pub trait ResponseHandler {
    fn response_start(&mut self, head: ResponseHead, pause: PauseHandle)
        -> Box<dyn BodySink>;
}

/// Wrap a closure as a [`ResponseHandler`].
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
    where F: FnMut(ResponseHead, PauseHandle) -> Box<dyn BodySink>
{
    HandlerFn(f)
}

pub struct HandlerFn<F>(F);

impl<F> ResponseHandler for HandlerFn<F>
    where F: FnMut(ResponseHead, PauseHandle) -> Box<dyn BodySink>
{
    fn response_start(&mut self, head: ResponseHead, pause: PauseHandle)
        -> Box<dyn BodySink>
    {
        (self.0)(head, pause)
    }
}

/// Capability to pause the flow of the peer's body bytes.
///
/// Held by a handler; toggling it arms or disarms reads on the
/// underlying connection. No-op once the connection is gone.
#[derive(Clone)]
pub struct PauseHandle {
    conn: Weak<TcpConn>,
}

impl PauseHandle {
    pub(crate) fn new(conn: &Rc<TcpConn>) -> PauseHandle {
        PauseHandle { conn: Rc::downgrade(conn) }
    }

    pub(crate) fn dead() -> PauseHandle {
        PauseHandle { conn: Weak::new() }
    }

    pub fn set(&self, paused: bool) {
        if let Some(conn) = self.conn.upgrade() {
            conn.pause(paused);
        }
    }
}

/// One response per request: `start` consumes the capability.
///
/// The connection picks the body delimitation (counted, chunked, or
/// close-delimited) from the request and the headers given here;
/// hop-by-hop headers are stripped before anything hits the wire.
pub struct Responder {
    pub(crate) inner: Box<dyn StartResponse>,
}

impl Responder {
    /// Emit the status line and headers. `pause_cb` is invoked with
    /// `true`/`false` as the connection wants the body producer to
    /// stop and resume.
    pub fn start(self, code: u16, phrase: &str, headers: &Headers,
        pause_cb: Box<dyn FnMut(bool)>) -> ResponseBody
    {
        ResponseBody { inner: self.inner.start(code, phrase, headers,
            Some(pause_cb)) }
    }
}

/// Streaming body of a response in progress. `done` consumes the
/// writer: exactly one completion signal per response.
pub struct ResponseBody {
    pub(crate) inner: Box<dyn WriteBody>,
}

impl ResponseBody {
    pub fn write(&mut self, data: &[u8]) {
        self.inner.write(data);
    }

    pub fn done(self, err: Option<Error>) {
        self.inner.done(err);
    }
}

/// Backend of [`Responder`], implemented by each protocol.
pub(crate) trait StartResponse {
    fn start(self: Box<Self>, code: u16, phrase: &str, headers: &Headers,
        pause_cb: Option<Box<dyn FnMut(bool)>>) -> Box<dyn WriteBody>;
}

/// Backend of [`ResponseBody`], implemented by each protocol.
pub(crate) trait WriteBody {
    fn write(&mut self, data: &[u8]);
    fn done(self: Box<Self>, err: Option<Error>);
}
