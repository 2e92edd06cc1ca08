//! Push-model asynchronous HTTP/1.1 and SPDY/1.
//!
//! The network pushes data at you through callbacks, and you push
//! data at the network with direct method calls. On top of that sit
//! an HTTP origin server, an HTTP client with an idle-connection
//! pool and idempotent retry, and a SPDY server and client speaking
//! the same handler contract, so the pieces compose into forward and
//! reverse proxies that bridge across protocol versions.
#[macro_use(quick_error)] extern crate quick_error;
#[macro_use] extern crate log;

pub mod client;
pub mod conn;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod spdy;

mod error;
mod handler;
mod headers;
mod serializer;
mod version;

#[cfg(test)]
mod mock;

pub use error::Error;
pub use handler::{
    handler_fn, service_fn, BodySink, HandlerFn, NullSink, PauseHandle,
    Request, Responder, ResponseBody, ResponseHandler, ResponseHead,
    Service, ServiceFn,
};
pub use headers::Headers;
pub use version::Version;
