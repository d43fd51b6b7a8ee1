//! Improv serial framing.
//!
//! Frame layout:
//! `"IMPROV"` | version (1) | type | length | payload (length bytes) | checksum
//!
//! The checksum is the 8-bit wrapping sum of every preceding frame byte,
//! header included.

use tracing::{debug, trace};

pub const HEADER: &[u8; 6] = b"IMPROV";
pub const VERSION: u8 = 1;
/// Bytes before the payload: header, version, type, length.
const PREAMBLE: usize = HEADER.len() + 3;
/// Decoder buffer cap. Older bytes are discarded beyond this.
pub const MAX_BUFFER: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    CurrentState = 0x01,
    ErrorState = 0x02,
    RpcCommand = 0x03,
    RpcResult = 0x04,
}

impl FrameType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameType::CurrentState),
            0x02 => Some(FrameType::ErrorState),
            0x03 => Some(FrameType::RpcCommand),
            0x04 => Some(FrameType::RpcResult),
            _ => None,
        }
    }
}

/// Device state reported in `CurrentState` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImprovState {
    AwaitingAuthorization = 0x01,
    Authorized = 0x02,
    Provisioning = 0x03,
    Provisioned = 0x04,
}

/// Error code reported in `ErrorState` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImprovError {
    None = 0x00,
    InvalidRpc = 0x01,
    UnknownRpc = 0x02,
    UnableToConnect = 0x03,
    NotAuthorized = 0x04,
    Unknown = 0xFF,
}

pub mod command {
    pub const WIFI_SETTINGS: u8 = 0x01;
    /// Identify; also answered with the current state.
    pub const IDENTIFY: u8 = 0x02;
    pub const DEVICE_INFO: u8 = 0x03;
    pub const SCAN: u8 = 0x04;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw type byte; see [`FrameType::from_byte`].
    pub kind: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// A header was found but the frame failed its checksum.
    Corrupt,
}

/// Decoded RPC request.
#[derive(Clone, PartialEq, Eq)]
pub enum Rpc {
    WifiSettings { ssid: String, password: String },
    Identify,
    DeviceInfo,
    Scan,
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rpc::WifiSettings { ssid, .. } => f
                .debug_struct("WifiSettings")
                .field("ssid", ssid)
                .field("password", &"<redacted>")
                .finish(),
            Rpc::Identify => f.write_str("Identify"),
            Rpc::DeviceInfo => f.write_str("DeviceInfo"),
            Rpc::Scan => f.write_str("Scan"),
        }
    }
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Build a complete frame. Payloads longer than 255 bytes are truncated.
pub fn encode(kind: FrameType, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(u8::MAX as usize)];
    let mut frame = Vec::with_capacity(PREAMBLE + payload.len() + 1);
    frame.extend_from_slice(HEADER);
    frame.push(VERSION);
    frame.push(kind as u8);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}

pub fn state_frame(state: ImprovState) -> Vec<u8> {
    encode(FrameType::CurrentState, &[state as u8])
}

pub fn error_frame(error: ImprovError) -> Vec<u8> {
    encode(FrameType::ErrorState, &[error as u8])
}

/// RPC result payload: `command, total length, (length, bytes)*`.
///
/// Strings that would overflow the frame are dropped.
pub fn rpc_result(command: u8, values: &[&str]) -> Vec<u8> {
    let mut data = Vec::new();
    for value in values {
        let bytes = &value.as_bytes()[..value.len().min(u8::MAX as usize)];
        if data.len() + 1 + bytes.len() > u8::MAX as usize - 2 {
            debug!(command, "rpc result truncated");
            break;
        }
        data.push(bytes.len() as u8);
        data.extend_from_slice(bytes);
    }
    let mut payload = Vec::with_capacity(data.len() + 2);
    payload.push(command);
    payload.push(data.len() as u8);
    payload.extend_from_slice(&data);
    encode(FrameType::RpcResult, &payload)
}

/// Parse an RPC command payload: `command, length, data`.
pub fn parse_rpc(payload: &[u8]) -> Result<Rpc, ImprovError> {
    let [code, len, data @ ..] = payload else {
        return Err(ImprovError::InvalidRpc);
    };
    if data.len() != *len as usize {
        return Err(ImprovError::InvalidRpc);
    }
    match *code {
        command::WIFI_SETTINGS => {
            let mut fields = LengthPrefixed { rest: data };
            let ssid = fields.next_string()?;
            let password = fields.next_string()?;
            Ok(Rpc::WifiSettings { ssid, password })
        }
        command::IDENTIFY => Ok(Rpc::Identify),
        command::DEVICE_INFO => Ok(Rpc::DeviceInfo),
        command::SCAN => Ok(Rpc::Scan),
        _ => Err(ImprovError::UnknownRpc),
    }
}

struct LengthPrefixed<'a> {
    rest: &'a [u8],
}

impl LengthPrefixed<'_> {
    fn next_string(&mut self) -> Result<String, ImprovError> {
        let [len, rest @ ..] = self.rest else {
            return Err(ImprovError::InvalidRpc);
        };
        let len = *len as usize;
        if rest.len() < len {
            return Err(ImprovError::InvalidRpc);
        }
        let (value, rest) = rest.split_at(len);
        self.rest = rest;
        String::from_utf8(value.to_vec()).map_err(|_| ImprovError::InvalidRpc)
    }
}

/// Incremental frame decoder over an unreliable byte stream.
///
/// Bytes that do not belong to a frame (log output sharing the line) are
/// skipped. A bad version byte resyncs silently; a bad checksum resyncs and
/// yields [`Decoded::Corrupt`] once.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_BUFFER {
            let excess = self.buf.len() - MAX_BUFFER;
            trace!(excess, "decoder buffer full, dropping oldest bytes");
            self.buf.drain(..excess);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Option<Decoded> {
        loop {
            let Some(start) = find_header(&self.buf) else {
                // Keep a possible partial header at the tail.
                let keep = self.buf.len().min(HEADER.len() - 1);
                self.buf.drain(..self.buf.len() - keep);
                return None;
            };
            self.buf.drain(..start);
            if self.buf.len() < PREAMBLE {
                return None;
            }
            if self.buf[HEADER.len()] != VERSION {
                trace!(version = self.buf[HEADER.len()], "unsupported improv version");
                self.buf.drain(..1);
                continue;
            }
            let kind = self.buf[HEADER.len() + 1];
            let len = self.buf[HEADER.len() + 2] as usize;
            let end = PREAMBLE + len;
            if self.buf.len() < end + 1 {
                return None;
            }
            if checksum(&self.buf[..end]) != self.buf[end] {
                debug!(kind, len, "improv checksum mismatch");
                self.buf.drain(..1);
                return Some(Decoded::Corrupt);
            }
            let payload = self.buf[PREAMBLE..end].to_vec();
            self.buf.drain(..=end);
            return Some(Decoded::Frame(Frame { kind, payload }));
        }
    }
}

fn find_header(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER.len()).position(|window| window == HEADER)
}
