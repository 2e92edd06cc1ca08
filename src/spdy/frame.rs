//! SPDY/1 frame codec: 8-byte frame headers in network byte order
//! plus the compressed header-block format used by SYN_STREAM and
//! SYN_REPLY.

use byteorder::{BigEndian, ByteOrder};
use netbuf::Buf;

use super::zlib::{Compressor, Decompressor};

pub const FLAG_NONE: u8 = 0x00;
pub const FLAG_FIN: u8 = 0x01;

pub const STREAM_MASK: u32 = 0x7fff_ffff;

/// Protocol version carried in control frame headers.
pub const VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtlType {
    SynStream = 1,
    SynReply = 2,
    FinStream = 3,
    Hello = 4,
    Noop = 5,
    Ping = 6,
    Goaway = 7,
}

impl CtlType {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<CtlType> {
        match code {
            1 => Some(CtlType::SynStream),
            2 => Some(CtlType::SynReply),
            3 => Some(CtlType::FinStream),
            4 => Some(CtlType::Hello),
            5 => Some(CtlType::Noop),
            6 => Some(CtlType::Ping),
            7 => Some(CtlType::Goaway),
            _ => None,
        }
    }
}

/// Receiver of parsed frames, one session at a time.
pub trait FrameSink {
    fn data_frame(&mut self, stream_id: u32, flags: u8, payload: &[u8]);
    fn control_frame(&mut self, ctl: CtlType, flags: u8, payload: &[u8]);
    fn unknown_frame(&mut self, code: u16, flags: u8);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    ReadingFrameData,
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Data { stream_id: u32 },
    Control { code: u16 },
}

/// Incremental frame parser; handles arbitrary packet boundaries.
pub struct FrameParser {
    buf: Buf,
    state: State,
    kind: Kind,
    flags: u8,
    len: usize,
}

impl FrameParser {
    pub fn new() -> FrameParser {
        FrameParser {
            buf: Buf::new(),
            state: State::Waiting,
            kind: Kind::Data { stream_id: 0 },
            flags: 0,
            len: 0,
        }
    }

    pub fn feed(&mut self, data: &[u8], sink: &mut dyn FrameSink) {
        use std::io::Write;
        self.buf.write_all(data).unwrap();
        loop {
            match self.state {
                State::Waiting => {
                    if self.buf.len() < 8 {
                        return;
                    }
                    let head = &self.buf[..8];
                    let word = BigEndian::read_u32(&head[0..4]);
                    self.flags = head[4];
                    self.len = ((head[5] as usize) << 16)
                        | BigEndian::read_u16(&head[6..8]) as usize;
                    self.kind = if word & 0x8000_0000 != 0 {
                        Kind::Control { code: (word & 0xffff) as u16 }
                    } else {
                        Kind::Data { stream_id: word & STREAM_MASK }
                    };
                    self.buf.consume(8);
                    self.state = State::ReadingFrameData;
                    trace!("frame {:?} flags {:#x} len {}",
                        self.kind, self.flags, self.len);
                }
                State::ReadingFrameData => {
                    if self.buf.len() < self.len {
                        return;
                    }
                    let payload = self.buf[..self.len].to_vec();
                    self.buf.consume(self.len);
                    self.state = State::Waiting;
                    match self.kind {
                        Kind::Data { stream_id } => {
                            sink.data_frame(stream_id, self.flags,
                                &payload);
                        }
                        Kind::Control { code } => {
                            match CtlType::from_code(code) {
                                Some(ctl) => sink.control_frame(ctl,
                                    self.flags, &payload),
                                None => sink.unknown_frame(code,
                                    self.flags),
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Build a data frame.
pub fn data_frame(stream_id: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 8];
    BigEndian::write_u32(&mut frame[0..4], stream_id & STREAM_MASK);
    BigEndian::write_u32(&mut frame[4..8],
        ((flags as u32) << 24) | payload.len() as u32);
    frame.extend_from_slice(payload);
    frame
}

/// Build a control frame.
pub fn control_frame(ctl: CtlType, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 8];
    BigEndian::write_u16(&mut frame[0..2], 0x8000 | VERSION);
    BigEndian::write_u16(&mut frame[2..4], ctl.code());
    BigEndian::write_u32(&mut frame[4..8],
        ((flags as u32) << 24) | payload.len() as u32);
    frame.extend_from_slice(payload);
    frame
}

/// Build a SYN_STREAM or SYN_REPLY frame: stream id, two unused
/// bytes, then the compressed header block.
pub fn syn_frame(ctl: CtlType, flags: u8, stream_id: u32,
    pairs: &[(String, String)], z: &mut Compressor) -> Vec<u8>
{
    let block = encode_header_block(pairs, z);
    let mut payload = vec![0u8; 6];
    BigEndian::write_u32(&mut payload[0..4], stream_id & STREAM_MASK);
    payload.extend_from_slice(&block);
    control_frame(ctl, flags, &payload)
}

/// Build a FIN_STREAM (reset) frame.
pub fn fin_stream_frame(stream_id: u32) -> Vec<u8> {
    let mut payload = vec![0u8; 4];
    BigEndian::write_u32(&mut payload[0..4], stream_id & STREAM_MASK);
    control_frame(CtlType::FinStream, FLAG_NONE, &payload)
}

/// Stream id from the head of a SYN/FIN payload.
pub fn read_stream_id(payload: &[u8]) -> Option<u32> {
    if payload.len() < 4 {
        return None;
    }
    Some(BigEndian::read_u32(&payload[0..4]) & STREAM_MASK)
}

/// Serialize and compress a header block: `u16` pair count, then
/// length-prefixed names and values. Names go out lowercase and the
/// list sorted, which Chromium requires.
pub fn encode_header_block(pairs: &[(String, String)],
    z: &mut Compressor) -> Vec<u8>
{
    let mut sorted: Vec<(String, &str)> = pairs.iter()
        .map(|&(ref name, ref value)| {
            (name.to_ascii_lowercase(), value.as_str())
        })
        .collect();
    sorted.sort();
    let mut plain = Vec::new();
    let mut word = [0u8; 2];
    BigEndian::write_u16(&mut word, sorted.len() as u16);
    plain.extend_from_slice(&word);
    for &(ref name, value) in &sorted {
        write_prefixed(&mut plain, name.as_bytes());
        write_prefixed(&mut plain, value.as_bytes());
    }
    z.compress(&plain)
}

/// Decompress and parse a header block. Values joined with NUL
/// separators come back as separate pairs.
pub fn decode_header_block(block: &[u8], z: &mut Decompressor)
    -> Result<Vec<(String, String)>, ()>
{
    let plain = match z.decompress(block) {
        Ok(plain) => plain,
        Err(e) => {
            debug!("header block inflate failed: {}", e);
            return Err(());
        }
    };
    if plain.len() < 2 {
        return Err(());
    }
    let count = BigEndian::read_u16(&plain[0..2]) as usize;
    let mut pairs = Vec::with_capacity(count);
    let mut cursor = 2;
    while cursor < plain.len() {
        let name = read_prefixed(&plain, &mut cursor).ok_or(())?;
        let value = read_prefixed(&plain, &mut cursor).ok_or(())?;
        let name = String::from_utf8_lossy(name).into_owned();
        for piece in value.split(|&b| b == 0) {
            pairs.push((name.clone(),
                String::from_utf8_lossy(piece).into_owned()));
        }
    }
    Ok(pairs)
}

fn write_prefixed(out: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(data.len() <= u16::max_value() as usize);
    let mut word = [0u8; 2];
    BigEndian::write_u16(&mut word, data.len() as u16);
    out.extend_from_slice(&word);
    out.extend_from_slice(data);
}

fn read_prefixed<'x>(data: &'x [u8], cursor: &mut usize)
    -> Option<&'x [u8]>
{
    if *cursor + 2 > data.len() {
        return None;
    }
    let len = BigEndian::read_u16(&data[*cursor..*cursor + 2]) as usize;
    *cursor += 2;
    if *cursor + len > data.len() {
        return None;
    }
    let slice = &data[*cursor..*cursor + len];
    *cursor += len;
    Some(slice)
}
