quick_error! {
    /// Everything that can go wrong with a message or a connection.
    ///
    /// These are error *kinds*: each one carries a suggested status
    /// pair so that errors discovered before a response has started
    /// can be reported as a synthetic response.
    #[derive(Debug, Clone)]
    pub enum Error {
        /// Malformed request URI or unsupported scheme.
        Url(detail: String) {
            description("malformed or unsupported request URI")
            display("bad URL: {}", detail)
        }
        /// Connect failed, timed out, or the peer closed prematurely.
        Connect(detail: String) {
            description("connection failed or closed prematurely")
            display("connect error: {}", detail)
        }
        /// Start line could not be parsed.
        HttpVersion {
            description("unparseable start line")
        }
        /// HTTP/1.1 request without a Host header.
        HostRequired {
            description("HTTP/1.1 request requires a Host header")
        }
        /// The first header line begins with whitespace.
        WhitespaceHeader {
            description("first header starts with whitespace")
        }
        /// Transfer-Encoding with an unknown transfer-coding.
        TransferCode {
            description("unknown transfer-coding")
        }
        /// Malformed chunk size line.
        Chunk(detail: String) {
            description("malformed chunk size")
            display("malformed chunk size: {:?}", detail)
        }
        /// Bytes past the end of a counted or empty body.
        ExtraData(extra: Vec<u8>) {
            description("data past the end of the message body")
            display("{} bytes past the end of the message body", extra.len())
        }
        /// A request body was written without declaring Content-Length.
        ContentLengthRequired {
            description("request body requires a Content-Length")
        }
    }
}

impl Error {
    /// Suggested status pair for a synthetic response reporting this
    /// error: the 504 family for connect-side faults, 400 for input
    /// faults.
    pub fn status(&self) -> (u16, &'static str) {
        match *self {
            Error::Connect(..) => (504, "Gateway Timeout"),
            _ => (400, "Bad Request"),
        }
    }
}
