//! Network credentials and the pending-provisioning marker.
//!
//! Credentials live under fixed keys, independent of any endpoint. The
//! presence of a non-empty SSID is the only signal that the device has ever
//! been configured.

use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::io::store::{ByteStore, read_text, write_text};

pub const SSID_KEY: &str = "wifi-ssid";
pub const PASSWORD_KEY: &str = "wifi-password";
/// Set after a serial-channel credential write, cleared after the next join.
pub const PENDING_KEY: &str = "improv-pending";

/// Keys whose change means the device must rejoin.
pub const CREDENTIAL_KEYS: [&str; 2] = [SSID_KEY, PASSWORD_KEY];

#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn is_provisioned(&self) -> bool {
        !self.ssid.is_empty()
    }
}

/// Load stored credentials. Read errors are treated like missing keys.
pub fn load(store: &dyn ByteStore) -> Credentials {
    let read = |key: &str| {
        read_text(store, key).unwrap_or_else(|err| {
            warn!(key, error = %err, "reading credential failed");
            String::new()
        })
    };
    Credentials {
        ssid: read(SSID_KEY),
        password: read(PASSWORD_KEY),
    }
}

/// Persist credentials. The SSID is written first; a failure on the
/// password leaves the SSID written.
pub fn save(store: &dyn ByteStore, credentials: &Credentials) -> Result<()> {
    debug!(ssid = %credentials.ssid, "saving credentials");
    write_text(store, SSID_KEY, &credentials.ssid)
        .map_err(|err| ProvisionError::persistence(SSID_KEY, err))?;
    write_text(store, PASSWORD_KEY, &credentials.password)
        .map_err(|err| ProvisionError::persistence(PASSWORD_KEY, err))?;
    Ok(())
}

/// Remove both credential keys, returning the device to first contact.
pub fn forget(store: &dyn ByteStore) -> Result<()> {
    for key in CREDENTIAL_KEYS {
        store
            .delete(key)
            .map_err(|err| ProvisionError::persistence(key, err))?;
    }
    info!("credentials forgotten");
    Ok(())
}

pub fn has_pending(store: &dyn ByteStore) -> bool {
    matches!(store.get(PENDING_KEY), Ok(Some(bytes)) if !bytes.is_empty())
}

pub fn set_pending(store: &dyn ByteStore) -> Result<()> {
    write_text(store, PENDING_KEY, "1")
        .map_err(|err| ProvisionError::persistence(PENDING_KEY, err))
}

/// Clear the marker, reporting whether it was set.
pub fn take_pending(store: &dyn ByteStore) -> Result<bool> {
    if !has_pending(store) {
        return Ok(false);
    }
    store
        .delete(PENDING_KEY)
        .map_err(|err| ProvisionError::persistence(PENDING_KEY, err))?;
    Ok(true)
}
