//! In-memory test doubles: a scripted transport standing in for the
//! reactor's sockets, and a recording body sink.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::rc::Rc;

use crate::conn::Transport;
use crate::error::Error;
use crate::handler::BodySink;

enum Step {
    Data(Vec<u8>),
    Eof,
}

struct State {
    input: VecDeque<Step>,
    written: Vec<u8>,
    write_limit: Option<usize>,
    read_armed: bool,
    write_armed: bool,
    closed: bool,
}

/// A transport whose reads come from a script and whose writes are
/// captured for inspection. Clones share the same state, so a test
/// can keep a handle after giving the transport to a connection.
#[derive(Clone)]
pub struct ScriptedTransport(Rc<RefCell<State>>);

impl ScriptedTransport {
    pub fn new() -> ScriptedTransport {
        ScriptedTransport(Rc::new(RefCell::new(State {
            input: VecDeque::new(),
            written: Vec::new(),
            write_limit: None,
            read_armed: false,
            write_armed: false,
            closed: false,
        })))
    }

    pub fn push_read(&self, data: &[u8]) {
        self.0.borrow_mut().input.push_back(Step::Data(data.to_vec()));
    }

    pub fn push_eof(&self) {
        self.0.borrow_mut().input.push_back(Step::Eof);
    }

    /// Cap the number of bytes accepted by a single write call.
    pub fn limit_write(&self, n: usize) {
        self.0.borrow_mut().write_limit = Some(n);
    }

    pub fn written(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        mem::replace(&mut self.0.borrow_mut().written, Vec::new())
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    pub fn armed(&self) -> (bool, bool) {
        let st = self.0.borrow();
        (st.read_armed, st.write_armed)
    }
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.0.borrow_mut();
        match st.input.pop_front() {
            None => Err(io::Error::new(io::ErrorKind::WouldBlock,
                "script exhausted")),
            Some(Step::Eof) => Ok(0),
            Some(Step::Data(mut data)) => {
                if data.len() > buf.len() {
                    let rest = data.split_off(buf.len());
                    st.input.push_front(Step::Data(rest));
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
        }
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut st = self.0.borrow_mut();
        let n = match st.write_limit {
            Some(limit) => limit.min(buf.len()),
            None => buf.len(),
        };
        st.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn arm(&mut self, read: bool, write: bool) -> io::Result<()> {
        let mut st = self.0.borrow_mut();
        st.read_armed = read;
        st.write_armed = write;
        Ok(())
    }

    fn close(&mut self) {
        self.0.borrow_mut().closed = true;
    }
}

/// What a [`RecordingSink`] saw.
#[derive(Debug, Default)]
pub struct SinkRecord {
    pub data: Vec<u8>,
    pub end_count: usize,
    pub err: Option<String>,
}

/// A body sink that accumulates data and counts completions.
pub struct RecordingSink(Rc<RefCell<SinkRecord>>);

impl RecordingSink {
    pub fn new() -> (RecordingSink, Rc<RefCell<SinkRecord>>) {
        let record = Rc::new(RefCell::new(SinkRecord::default()));
        (RecordingSink(record.clone()), record)
    }
}

impl BodySink for RecordingSink {
    fn data(&mut self, chunk: &[u8]) {
        let mut rec = self.0.borrow_mut();
        assert_eq!(rec.end_count, 0, "body data after end");
        rec.data.extend_from_slice(chunk);
    }

    fn end(&mut self, err: Option<Error>) {
        let mut rec = self.0.borrow_mut();
        rec.end_count += 1;
        rec.err = err.map(|e| format!("{}", e));
    }
}
