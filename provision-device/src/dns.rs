//! Wildcard DNS responder for the captive portal.
//!
//! Every A query is answered with the portal address and a zero TTL so
//! clients do not cache the redirect once the device leaves the portal.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};

use tracing::{debug, info};

use provision::io::services::CaptiveDns;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;

pub struct UdpCaptiveDns {
    port: u16,
    socket: Option<UdpSocket>,
    address: Ipv4Addr,
    recv_buf: Vec<u8>,
}

impl UdpCaptiveDns {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            socket: None,
            address: Ipv4Addr::UNSPECIFIED,
            recv_buf: vec![0u8; 512],
        }
    }
}

impl CaptiveDns for UdpCaptiveDns {
    fn start(&mut self, address: Ipv4Addr) -> io::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", self.port))?;
        socket.set_nonblocking(true)?;
        info!(port = self.port, %address, "captive dns listening");
        self.socket = Some(socket);
        self.address = address;
        Ok(())
    }

    fn process_next(&mut self) {
        let Some(socket) = &self.socket else {
            return;
        };
        let (len, peer) = match socket.recv_from(&mut self.recv_buf) {
            Ok(received) => received,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                debug!(error = %e, "dns receive failed");
                return;
            }
        };
        let Some(reply) = build_reply(&self.recv_buf[..len], self.address) else {
            debug!(%peer, len, "ignoring malformed dns query");
            return;
        };
        if let Err(e) = socket.send_to(&reply, peer) {
            debug!(%peer, error = %e, "dns reply failed");
        }
    }
}

/// Answer the first question of `query`. A and ANY questions get one A
/// record for `address`; other types get an empty answer section.
pub fn build_reply(query: &[u8], address: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let flags = u16::from_be_bytes([query[2], query[3]]);
    let qdcount = u16::from_be_bytes([query[4], query[5]]);
    if flags & 0x8000 != 0 || qdcount == 0 {
        return None;
    }

    // Walk the first question's labels.
    let mut pos = HEADER_LEN;
    loop {
        let len = usize::from(*query.get(pos)?);
        pos += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        pos += len;
    }
    let qtype = u16::from_be_bytes([*query.get(pos)?, *query.get(pos + 1)?]);
    let qclass = u16::from_be_bytes([*query.get(pos + 2)?, *query.get(pos + 3)?]);
    let question = &query[HEADER_LEN..pos + 4];
    let answer = (qtype == TYPE_A || qtype == TYPE_ANY) && qclass == CLASS_IN;

    let mut reply = Vec::with_capacity(HEADER_LEN + question.len() + 16);
    reply.extend_from_slice(&query[..2]);
    // QR + AA, echo RD, RA.
    let reply_flags = 0x8400 | (flags & 0x0100) | 0x0080;
    reply.extend_from_slice(&reply_flags.to_be_bytes());
    reply.extend_from_slice(&1u16.to_be_bytes());
    reply.extend_from_slice(&u16::from(answer).to_be_bytes());
    reply.extend_from_slice(&[0, 0, 0, 0]);
    reply.extend_from_slice(question);
    if answer {
        reply.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
        reply.extend_from_slice(&TYPE_A.to_be_bytes());
        reply.extend_from_slice(&CLASS_IN.to_be_bytes());
        reply.extend_from_slice(&0u32.to_be_bytes());
        reply.extend_from_slice(&4u16.to_be_bytes());
        reply.extend_from_slice(&address.octets());
    }
    Some(reply)
}
