//! Hardware seams and persisted state.
//!
//! Each collaborator the provisioner drives is a trait here so the state
//! machine can run against scripted fakes in tests and against the simulator
//! on a host.

pub mod clock;
pub mod config;
pub mod credentials;
pub mod radio;
pub mod serial;
pub mod services;
pub mod store;
pub mod system;
