//! Shared state for the HTTP handlers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use provision::surface::ConfigSurface;

use crate::sim::SimRadio;

/// How the server is reachable, updated each time the provisioner starts it.
#[derive(Debug, Clone, Default)]
pub struct ServeMode {
    /// Address clients should use; requests for other hosts are redirected
    /// here while in access point mode.
    pub own_host: String,
    pub access_point: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub surface: Arc<Mutex<ConfigSurface>>,
    pub radio: SimRadio,
    pub mode: Arc<RwLock<ServeMode>>,
}

impl AppState {
    pub fn new(surface: Arc<Mutex<ConfigSurface>>, radio: SimRadio) -> Self {
        Self {
            surface,
            radio,
            mode: Arc::default(),
        }
    }

    pub fn surface(&self) -> MutexGuard<'_, ConfigSurface> {
        self.surface.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> ServeMode {
        self.mode
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_mode(&self, mode: ServeMode) {
        *self.mode.write().unwrap_or_else(PoisonError::into_inner) = mode;
    }
}
