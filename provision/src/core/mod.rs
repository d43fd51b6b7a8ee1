//! Deterministic, pure logic shared by the provisioning core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod json;
pub mod numeric;
pub mod parameter;
