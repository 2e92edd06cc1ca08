//! This contains the common part of message serialization between
//! the client and server implementation.

use std::io::Write;

use crate::version::Version;

fn invalid_header(value: &[u8]) -> bool {
    value.iter().any(|&x| x == b'\r' || x == b'\n')
}

/// Write a response status line into the buffer.
pub fn response_line<W: Write>(buf: &mut W, version: Version,
    code: u16, phrase: &str)
{
    write!(buf, "{} {} {}\r\n", version, code, phrase).unwrap();
}

/// Write a request line into the buffer.
pub fn request_line<W: Write>(buf: &mut W, method: &str, path: &str,
    version: Version)
{
    write!(buf, "{} {} {}\r\n", method, path, version).unwrap();
}

/// Write a single header field.
///
/// Fields whose name or value embed CR or LF are dropped rather than
/// emitted, since they would split the message.
pub fn header<W: Write>(buf: &mut W, name: &str, value: &str) {
    if invalid_header(name.as_bytes()) || invalid_header(value.as_bytes()) {
        warn!("dropping header with embedded line break: {:?}", name);
        return;
    }
    write!(buf, "{}: {}\r\n", name, value.trim()).unwrap();
}

/// Terminate the header block.
pub fn blank_line<W: Write>(buf: &mut W) {
    buf.write_all(b"\r\n").unwrap();
}

/// Write one chunk of a chunked body, with the hex-size prefix and
/// trailing CRLF. Empty chunks are ignored: a zero-size chunk would
/// terminate the body.
pub fn chunk<W: Write>(buf: &mut W, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    write!(buf, "{:x}\r\n", data.len()).unwrap();
    buf.write_all(data).unwrap();
    buf.write_all(b"\r\n").unwrap();
}

/// Write the zero chunk that ends a chunked body. No trailers.
pub fn last_chunk<W: Write>(buf: &mut W) {
    buf.write_all(b"0\r\n\r\n").unwrap();
}
