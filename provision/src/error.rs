//! Error kinds surfaced by the registry, config surface and provisioner.

use std::time::Duration;

use thiserror::Error;

use crate::exit_codes;
use crate::io::store::StoreError;

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Unknown endpoint, or a dropdown lookup that found nothing usable.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The byte store failed a write or delete.
    #[error("persisting '{key}' failed")]
    Persistence {
        key: String,
        #[source]
        source: StoreError,
    },

    /// The wait budget elapsed before the radio reported a joined network.
    #[error("joining '{ssid}' timed out after {waited:?}")]
    ConnectTimeout { ssid: String, waited: Duration },

    /// Malformed input, e.g. blank credentials.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ProvisionError {
    pub fn endpoint_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "endpoint",
            name: name.to_string(),
        }
    }

    pub fn dropdown_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "dropdown",
            name: name.to_string(),
        }
    }

    pub fn persistence(key: &str, source: StoreError) -> Self {
        Self::Persistence {
            key: key.to_string(),
            source,
        }
    }

    /// Exit code a binary should use when this error ends the process.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } => exit_codes::NOT_FOUND,
            Self::Persistence { .. } => exit_codes::PERSISTENCE,
            Self::ConnectTimeout { .. } => exit_codes::CONNECT_FAILED,
            Self::Rejected(_) => exit_codes::INVALID,
        }
    }
}
