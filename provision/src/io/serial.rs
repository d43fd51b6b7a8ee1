//! Byte-oriented serial line carrying the Improv handshake.

use std::io;

pub trait SerialPort: Send {
    /// Append any bytes that arrived since the last call. Never blocks.
    fn read_available(&mut self, buf: &mut Vec<u8>);
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}
