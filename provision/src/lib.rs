//! Headless WiFi provisioning for devices without a display or buttons.
//!
//! Two channels deliver configuration to the device: an Improv handshake on
//! the serial line, and a JSON HTTP surface that becomes reachable once the
//! device has joined a network or fallen back to access-point ("portal")
//! mode. The crate is split the same way the data flows:
//!
//! - **[`core`]**: Pure, deterministic logic (JSON escaping, lenient numeric
//!   parsing, typed parameters). No I/O, fully testable in isolation.
//! - **[`io`]**: The hardware seams (byte store, radio, clock, serial, system)
//!   plus persisted credentials and TOML configuration.
//!
//! [`registry`] and [`surface`] turn parameter declarations into readable and
//! writable endpoints; [`provisioner`] sequences first contact, timed joins,
//! the portal and the serial handshake decoded by [`improv`].

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod improv;
pub mod io;
pub mod logging;
pub mod provisioner;
pub mod registry;
pub mod surface;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod web;

pub use error::{ProvisionError, Result};
