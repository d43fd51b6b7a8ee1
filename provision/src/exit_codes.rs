//! Stable exit codes for the `provision` CLI and the device simulator.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments, configuration or any error without a dedicated code.
pub const INVALID: i32 = 1;
/// Unknown endpoint or dropdown.
pub const NOT_FOUND: i32 = 2;
/// The byte store rejected a write or delete.
pub const PERSISTENCE: i32 = 3;
/// A join attempt elapsed its wait budget and no portal fallback was requested.
pub const CONNECT_FAILED: i32 = 4;
/// The device asked to be restarted (new credentials were stored).
pub const RESTART: i32 = 5;
