use std::rc::Rc;

use crate::conn::{READ_BUFSIZE, WRITE_BUFSIZE};

/// Fine-grained configuration of the HTTP server.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) read_bufsize: usize,
    pub(crate) write_bufsize: usize,
}

impl Config {
    /// Create a config with defaults.
    pub fn new() -> Config {
        Config {
            read_bufsize: READ_BUFSIZE,
            write_bufsize: WRITE_BUFSIZE,
        }
    }

    /// Bytes read from the socket per readable edge.
    pub fn read_bufsize(&mut self, value: usize) -> &mut Self {
        self.read_bufsize = value;
        self
    }

    /// Number of buffered write chunks before the response producer
    /// is asked to pause.
    pub fn write_bufsize(&mut self, value: usize) -> &mut Self {
        self.write_bufsize = value;
        self
    }

    /// Create an Rc'd config clone to pass to the constructor.
    ///
    /// This is just a convenience method.
    pub fn done(&mut self) -> Rc<Config> {
        Rc::new(self.clone())
    }
}
