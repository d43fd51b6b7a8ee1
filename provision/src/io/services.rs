//! Network-facing services started by the portal.

use std::io;
use std::net::Ipv4Addr;

/// DNS responder that answers every query with the device's own address.
pub trait CaptiveDns: Send {
    fn start(&mut self, address: Ipv4Addr) -> io::Result<()>;
    /// Handle at most one pending query. Must not block.
    fn process_next(&mut self);
}

/// The HTTP transport exposing the config surface.
pub trait ConfigServer: Send {
    /// Start serving (idempotent). `access_point` enables captive redirects.
    fn start(&mut self, address: Ipv4Addr, access_point: bool) -> io::Result<()>;
}
