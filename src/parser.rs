//! Byte-stream HTTP/1.x message parser.
//!
//! The parser is message-type agnostic: it splits the header block,
//! delimits the body, and pushes everything through a [`MessageSink`].
//! Whether the message is a request or a response (and whether its
//! start line makes sense) is the sink's business.

use std::cmp::min;

use httparse::parse_chunk_size;
use netbuf::Buf;

use crate::error::Error;
use crate::headers::Headers;

/// How the end of the message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimit {
    /// No body; the message ends with its headers.
    None,
    /// Exactly `Content-Length` bytes follow.
    Counted,
    /// Size-prefixed chunks, terminated by a zero chunk.
    Chunked,
    /// The body runs until the peer closes the connection.
    Close,
}

/// Facts pulled out of the header block that connection layers need
/// beyond the raw header list.
#[derive(Debug)]
pub struct HeaderFacts {
    /// Lowercased `Connection` tokens.
    pub connection: Vec<String>,
    /// Lowercased `Transfer-Encoding` codings.
    pub transfer: Vec<String>,
    /// First parseable `Content-Length`. Always `None` when a
    /// Transfer-Encoding is present: the transfer coding wins.
    pub content_length: Option<u64>,
    /// The first header line began with whitespace.
    pub whitespace_first: bool,
}

/// Receiver of parse events for one connection, one message at a time.
pub trait MessageSink {
    /// A complete header block arrived. Returns whether the message
    /// may carry a body, or `Err(())` to abandon this connection's
    /// input entirely (the sink has already decided how to answer).
    fn start(&mut self, top_line: &str, headers: Headers,
        facts: &HeaderFacts) -> Result<bool, ()>;

    /// A slice of body data, in order, without gaps.
    fn body(&mut self, chunk: &[u8]);

    /// The message completed cleanly. Never followed by more `body`
    /// calls for the same message.
    fn end(&mut self);

    /// Parsing failed; no further events will be delivered.
    fn fault(&mut self, err: Error);
}

/// What a peer close means to the message in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Between messages; nothing was lost.
    Idle,
    /// A close-delimited body just completed; `end` has fired.
    BodyDone,
    /// The peer closed mid-message.
    Truncated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Body,
    Failed,
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    /// Expecting a hex size line.
    Size,
    /// Inside a chunk payload with this many bytes left.
    Data(u64),
    /// Expecting the line break that terminates a chunk payload.
    DataEnd,
    /// After the zero chunk: discard trailers up to the blank line.
    Trailers,
}

enum Advance {
    NeedData,
    NextMessage,
    Stop,
}

/// The parser state machine. Owns its pending input buffer.
pub struct MessageParser {
    buf: Buf,
    state: State,
    delimit: Delimit,
    body_left: u64,
    chunk: ChunkState,
}

impl MessageParser {
    pub fn new() -> MessageParser {
        MessageParser {
            buf: Buf::new(),
            state: State::Waiting,
            delimit: Delimit::None,
            body_left: 0,
            chunk: ChunkState::Size,
        }
    }

    /// Feed bytes from the network and drive the sink. Any packet
    /// fragmentation yields the same event sequence.
    pub fn feed(&mut self, data: &[u8], sink: &mut dyn MessageSink) {
        if self.state == State::Failed {
            return;
        }
        use std::io::Write;
        self.buf.write_all(data).unwrap();
        self.process(sink);
    }

    /// True if a message is partially received (including buffered
    /// partial headers).
    pub fn mid_message(&self) -> bool {
        self.state == State::Body || self.buf.len() > 0
    }

    /// The peer closed the connection; resolve the message in
    /// progress, completing a close-delimited body if there is one.
    pub fn connection_closed(&mut self, sink: &mut dyn MessageSink)
        -> CloseOutcome
    {
        match self.state {
            State::Waiting | State::Failed => CloseOutcome::Idle,
            State::Body => {
                if self.delimit == Delimit::Close {
                    self.state = State::Waiting;
                    sink.end();
                    CloseOutcome::BodyDone
                } else {
                    self.state = State::Failed;
                    CloseOutcome::Truncated
                }
            }
        }
    }

    fn process(&mut self, sink: &mut dyn MessageSink) {
        loop {
            match self.state {
                State::Failed => {
                    let n = self.buf.len();
                    self.buf.consume(n);
                    return;
                }
                State::Waiting => {
                    let found = find_block_end(&self.buf[..]);
                    match found {
                        Some((top_end, consumed)) => {
                            let block = self.buf[..top_end].to_vec();
                            self.buf.consume(consumed);
                            if !self.parse_block(&block, sink) {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                State::Body => match self.advance_body(sink) {
                    Advance::NeedData | Advance::Stop => return,
                    Advance::NextMessage => continue,
                },
            }
        }
    }

    /// Process a complete header block. Returns false when input
    /// processing must stop.
    fn parse_block(&mut self, block: &[u8], sink: &mut dyn MessageSink)
        -> bool
    {
        let text = String::from_utf8_lossy(block);
        let mut top_line: Option<&str> = None;
        let mut lines: Vec<String> = Vec::new();
        let mut whitespace_first = false;
        for raw in text.split('\n') {
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            if line.is_empty() {
                continue;
            }
            if top_line.is_none() {
                top_line = Some(line);
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation line: unfold into the previous header.
                match lines.last_mut() {
                    Some(prev) => {
                        prev.push(' ');
                        prev.push_str(line.trim());
                    }
                    None => whitespace_first = true,
                }
                continue;
            }
            lines.push(line.to_string());
        }
        let top_line = match top_line {
            Some(t) => t.trim().to_string(),
            None => return true, // stray blank lines before the message
        };

        let mut headers = Headers::new();
        let mut connection = Vec::new();
        let mut transfer = Vec::new();
        let mut content_length: Option<u64> = None;
        for line in &lines {
            let colon = match line.find(':') {
                Some(i) => i,
                None => continue, // malformed line, discard
            };
            let name = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if name.is_empty() {
                continue;
            }
            headers.push(name, value);
            if name.eq_ignore_ascii_case("connection") {
                connection.extend(lower_tokens(value));
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                transfer.extend(lower_tokens(value));
            } else if name.eq_ignore_ascii_case("content-length") {
                // Only the first one counts.
                if content_length.is_none() {
                    content_length = value.parse().ok();
                }
            }
        }
        if !transfer.is_empty() {
            content_length = None;
        }
        let facts = HeaderFacts {
            connection: connection,
            transfer: transfer,
            content_length: content_length,
            whitespace_first: whitespace_first,
        };
        let allows_body = match sink.start(&top_line, headers, &facts) {
            Ok(allows_body) => allows_body,
            Err(()) => {
                self.state = State::Failed;
                return false;
            }
        };

        if !allows_body {
            sink.end();
            return true;
        }
        if !facts.transfer.is_empty() {
            if facts.transfer.iter().any(|t| t == "chunked") {
                self.delimit = Delimit::Chunked;
                self.chunk = ChunkState::Size;
            } else {
                self.delimit = Delimit::Close;
            }
            self.state = State::Body;
        } else if let Some(n) = facts.content_length {
            self.delimit = Delimit::Counted;
            self.body_left = n;
            self.state = State::Body;
        } else if facts.connection.iter().any(|t| t == "close") {
            self.delimit = Delimit::Close;
            self.state = State::Body;
        } else {
            // No body: the message is already complete.
            sink.end();
        }
        true
    }

    fn advance_body(&mut self, sink: &mut dyn MessageSink) -> Advance {
        match self.delimit {
            Delimit::None => unreachable!("no body to read"),
            Delimit::Close => {
                if self.buf.len() == 0 {
                    return Advance::NeedData;
                }
                let chunk = self.buf[..].to_vec();
                self.buf.consume(chunk.len());
                sink.body(&chunk);
                Advance::NeedData
            }
            Delimit::Counted => {
                if self.body_left > 0 && self.buf.len() > 0 {
                    let take = min(self.body_left, self.buf.len() as u64)
                        as usize;
                    let chunk = self.buf[..take].to_vec();
                    self.buf.consume(take);
                    self.body_left -= take as u64;
                    sink.body(&chunk);
                }
                if self.body_left > 0 {
                    return Advance::NeedData;
                }
                if self.buf.len() > 0 {
                    // Catches excess that isn't on a packet boundary.
                    let extra = self.buf[..].to_vec();
                    self.buf.consume(extra.len());
                    self.state = State::Failed;
                    sink.fault(Error::ExtraData(extra));
                    return Advance::Stop;
                }
                self.state = State::Waiting;
                sink.end();
                Advance::NextMessage
            }
            Delimit::Chunked => self.advance_chunked(sink),
        }
    }

    fn advance_chunked(&mut self, sink: &mut dyn MessageSink) -> Advance {
        loop {
            match self.chunk {
                ChunkState::Size => {
                    match parse_chunk_size(&self.buf[..]) {
                        Ok(httparse::Status::Complete((used, size))) => {
                            self.buf.consume(used);
                            self.chunk = if size == 0 {
                                ChunkState::Trailers
                            } else {
                                ChunkState::Data(size)
                            };
                        }
                        Ok(httparse::Status::Partial) => {
                            return Advance::NeedData;
                        }
                        Err(_) => {
                            return self.chunk_fault(sink);
                        }
                    }
                }
                ChunkState::Data(left) => {
                    if self.buf.len() == 0 {
                        return Advance::NeedData;
                    }
                    let take = min(left, self.buf.len() as u64) as usize;
                    let chunk = self.buf[..take].to_vec();
                    self.buf.consume(take);
                    sink.body(&chunk);
                    let left = left - take as u64;
                    self.chunk = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataEnd => {
                    // The CRLF that terminates the chunk payload.
                    if self.buf.len() == 0 {
                        return Advance::NeedData;
                    }
                    if self.buf[..][0] == b'\n' {
                        self.buf.consume(1);
                        self.chunk = ChunkState::Size;
                    } else if self.buf[..][0] == b'\r' {
                        if self.buf.len() < 2 {
                            return Advance::NeedData;
                        }
                        if self.buf[..][1] == b'\n' {
                            self.buf.consume(2);
                            self.chunk = ChunkState::Size;
                        } else {
                            return self.chunk_fault(sink);
                        }
                    } else {
                        return self.chunk_fault(sink);
                    }
                }
                ChunkState::Trailers => {
                    if self.buf.len() == 0 {
                        return Advance::NeedData;
                    }
                    // Empty trailer section: a blank line right away.
                    if self.buf[..][0] == b'\n' {
                        self.buf.consume(1);
                        return self.chunked_done(sink);
                    }
                    if self.buf[..][0] == b'\r' {
                        if self.buf.len() < 2 {
                            return Advance::NeedData;
                        }
                        if self.buf[..][1] == b'\n' {
                            self.buf.consume(2);
                            return self.chunked_done(sink);
                        }
                    }
                    // Header-like trailer lines: discard through the
                    // terminating blank line.
                    match find_block_end(&self.buf[..]) {
                        Some((_, consumed)) => {
                            self.buf.consume(consumed);
                            return self.chunked_done(sink);
                        }
                        None => return Advance::NeedData,
                    }
                }
            }
        }
    }

    fn chunked_done(&mut self, sink: &mut dyn MessageSink) -> Advance {
        self.state = State::Waiting;
        sink.end();
        Advance::NextMessage
    }

    fn chunk_fault(&mut self, sink: &mut dyn MessageSink) -> Advance {
        let line_end = self.buf[..]
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
            .unwrap_or_else(|| min(self.buf.len(), 32));
        let detail = String::from_utf8_lossy(
            &self.buf[..min(line_end, 32)]).into_owned();
        let n = self.buf.len();
        self.buf.consume(n);
        self.state = State::Failed;
        sink.fault(Error::Chunk(detail));
        Advance::Stop
    }
}

fn lower_tokens(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Find the end of the header block: CRLFCRLF or LFLF (and the mixed
/// forms a lenient reader must take). Returns the end of the last
/// line and the number of bytes to consume including the blank line.
fn find_block_end(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len() {
        if buf[i] != b'\n' {
            continue;
        }
        if i + 1 < buf.len() && buf[i + 1] == b'\n' {
            return Some((i + 1, i + 2));
        }
        if i + 2 < buf.len() && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
            return Some((i + 1, i + 3));
        }
    }
    None
}
