//! SPDY/1 protocol implementation.
//!
//! The server side speaks the same [`Service`] contract as the HTTP
//! server, so a handler (or a proxy built on one) works unchanged
//! over either wire. The client multiplexes requests over one
//! session per origin.

mod frame;
mod session;
mod zlib;

pub use self::session::{SpdyRequestBody, SpdySession};
pub use self::zlib::DICTIONARY;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::rc::Rc;

use url::Url;

use crate::client;
use crate::conn::TcpConn;
use crate::error::Error;
use crate::handler::{ResponseHandler, Service};
use crate::headers::Headers;
use crate::reactor::Handle;
use crate::server;

/// A SPDY origin server.
pub struct SpdyServer;

impl SpdyServer {
    /// Listen on `host:port`; every stream on every session becomes
    /// a call on `service`. Returns the bound address.
    pub fn bind<S>(handle: &Handle, host: &str, port: u16,
        config: &Rc<server::Config>, service: S) -> io::Result<SocketAddr>
        where S: Service + 'static
    {
        let service: Rc<RefCell<dyn Service>> =
            Rc::new(RefCell::new(service));
        let config = config.clone();
        handle.listen(host, port, move |conn| {
            conn.set_bufsizes(config.read_bufsize, config.write_bufsize);
            SpdySession::server(&conn, service.clone());
        })
    }
}

enum ReqChannel {
    /// Buffered until the session finishes connecting.
    Pending { chunks: Vec<Vec<u8>>, done: bool },
    Live(SpdyRequestBody),
    Dead,
}

/// Request body channel handed out by [`SpdyClient::req_start`].
/// Body bytes written before the session is up are buffered.
pub struct SpdyRequest {
    inner: Rc<RefCell<ReqChannel>>,
}

impl SpdyRequest {
    pub fn write(&self, data: &[u8]) {
        let mut channel = self.inner.borrow_mut();
        match *channel {
            ReqChannel::Pending { ref mut chunks, .. } => {
                chunks.push(data.to_vec());
            }
            ReqChannel::Live(ref body) => body.write(data),
            ReqChannel::Dead => {}
        }
    }

    pub fn done(self) {
        let prev = mem::replace(&mut *self.inner.borrow_mut(),
            ReqChannel::Dead);
        match prev {
            ReqChannel::Pending { chunks, .. } => {
                *self.inner.borrow_mut() =
                    ReqChannel::Pending { chunks: chunks, done: true };
            }
            ReqChannel::Live(body) => body.done(),
            ReqChannel::Dead => {}
        }
    }
}

struct PendingReq {
    method: String,
    uri: String,
    headers: Headers,
    handler: Box<dyn ResponseHandler>,
    pause_cb: Box<dyn FnMut(bool)>,
    channel: Rc<RefCell<ReqChannel>>,
}

enum Slot {
    Connecting(Rc<RefCell<Vec<PendingReq>>>),
    Ready(Rc<SpdySession>),
}

/// A SPDY client: one session per `(host, port)`, requests
/// multiplexed over it.
pub struct SpdyClient {
    handle: Handle,
    config: Rc<client::Config>,
    sessions: RefCell<HashMap<(String, u16), Slot>>,
}

impl SpdyClient {
    pub fn new(handle: &Handle, config: &Rc<client::Config>)
        -> Rc<SpdyClient>
    {
        Rc::new(SpdyClient {
            handle: handle.clone(),
            config: config.clone(),
            sessions: RefCell::new(HashMap::new()),
        })
    }

    /// Start a request to the absolute `uri`; the response arrives
    /// through `handler`. Bad URIs and connect failures surface as
    /// synthetic error responses.
    pub fn req_start(self: &Rc<Self>, method: &str, uri: &str,
        headers: &Headers, handler: Box<dyn ResponseHandler>,
        pause_cb: Box<dyn FnMut(bool)>) -> SpdyRequest
    {
        let channel = Rc::new(RefCell::new(ReqChannel::Pending {
            chunks: Vec::new(),
            done: false,
        }));
        let request = SpdyRequest { inner: channel.clone() };
        let mut handler = handler;

        let url = match Url::parse(uri) {
            Ok(url) => url,
            Err(e) => {
                session::synthetic_response(&mut handler,
                    Error::Url(format!("{}", e)));
                *channel.borrow_mut() = ReqChannel::Dead;
                return request;
            }
        };
        let host = match url.host_str() {
            Some(host) if url.scheme() == "http" => host.to_string(),
            _ => {
                session::synthetic_response(&mut handler,
                    Error::Url(format!("not a proxyable URI: {}", uri)));
                *channel.borrow_mut() = ReqChannel::Dead;
                return request;
            }
        };
        let port = url.port().unwrap_or(80);
        let key = (host.clone(), port);

        let mut pending = Some(PendingReq {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: headers.clone(),
            handler: handler,
            pause_cb: pause_cb,
            channel: channel,
        });
        let mut dial = false;
        let ready = {
            let mut sessions = self.sessions.borrow_mut();
            // A session whose connection died is no use; dial again.
            let stale = match sessions.get(&key) {
                Some(&Slot::Ready(ref session)) => !session.is_alive(),
                _ => false,
            };
            if stale {
                sessions.remove(&key);
            }
            match sessions.get(&key) {
                Some(&Slot::Ready(ref session)) => Some(session.clone()),
                Some(&Slot::Connecting(ref queue)) => {
                    queue.borrow_mut().push(pending.take().unwrap());
                    None
                }
                None => {
                    let queue = Rc::new(RefCell::new(
                        vec![pending.take().unwrap()]));
                    sessions.insert(key.clone(),
                        Slot::Connecting(queue));
                    dial = true;
                    None
                }
            }
        };
        if let Some(session) = ready {
            start_on_session(&session, pending.take().unwrap());
        } else if dial {
            let me = self.clone();
            let me2 = self.clone();
            let key2 = key.clone();
            self.handle.connect(&host, port,
                self.config.connect_timeout,
                move |conn| me.session_ready(key, conn),
                move |detail| me2.session_failed(key2, detail));
        }
        request
    }

    fn session_ready(self: &Rc<Self>, key: (String, u16),
        conn: Rc<TcpConn>)
    {
        conn.set_bufsizes(self.config.read_bufsize,
            self.config.write_bufsize);
        let session = SpdySession::client(&conn);
        let queued = {
            let mut sessions = self.sessions.borrow_mut();
            let prev = sessions.insert(key,
                Slot::Ready(session.clone()));
            match prev {
                Some(Slot::Connecting(queue)) => {
                    mem::replace(&mut *queue.borrow_mut(), Vec::new())
                }
                _ => Vec::new(),
            }
        };
        for pending in queued {
            start_on_session(&session, pending);
        }
    }

    fn session_failed(self: &Rc<Self>, key: (String, u16),
        detail: String)
    {
        debug!("session to {}:{} failed: {}", key.0, key.1, detail);
        let queued = {
            let mut sessions = self.sessions.borrow_mut();
            match sessions.remove(&key) {
                Some(Slot::Connecting(queue)) => {
                    mem::replace(&mut *queue.borrow_mut(), Vec::new())
                }
                _ => Vec::new(),
            }
        };
        for mut pending in queued {
            session::synthetic_response(&mut pending.handler,
                Error::Connect(detail.clone()));
            *pending.channel.borrow_mut() = ReqChannel::Dead;
        }
    }
}

fn start_on_session(session: &Rc<SpdySession>, pending: PendingReq) {
    let PendingReq { method, uri, headers, handler, pause_cb, channel } =
        pending;
    let body = session.request(&method, &uri, &headers, handler,
        pause_cb);
    let prev = mem::replace(&mut *channel.borrow_mut(),
        ReqChannel::Dead);
    match prev {
        ReqChannel::Pending { chunks, done } => {
            for chunk in chunks {
                body.write(&chunk);
            }
            if done {
                body.done();
            } else {
                *channel.borrow_mut() = ReqChannel::Live(body);
            }
        }
        other => {
            *channel.borrow_mut() = other;
        }
    }
}
