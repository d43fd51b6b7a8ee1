//! Parameter declarations grouped into named endpoints.
//!
//! The [`Registry`] is the context object application setup code declares
//! parameters against. Each declaration loads the stored value, appends the
//! parameter to the currently selected endpoint and hands back the effective
//! typed value. An endpoint named [`MAIN_ENDPOINT`] is created on the first
//! declaration if none was selected explicitly.

use tracing::{debug, warn};

use crate::core::parameter::{ParamKind, Parameter};
use crate::error::{ProvisionError, Result};
use crate::io::credentials::{PASSWORD_KEY, SSID_KEY};
use crate::io::store::{SharedStore, read_text, validate_key, write_text};

pub const MAIN_ENDPOINT: &str = "main";

/// A named, ordered group of parameters served under one HTTP path.
#[derive(Debug, Clone)]
pub struct Endpoint {
    name: String,
    params: Vec<Parameter>,
}

impl Endpoint {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Attributes shared by every declaration.
#[derive(Debug, Clone, Default)]
pub struct Decl {
    name: String,
    label: String,
    min: Option<i64>,
    max: Option<i64>,
}

impl Decl {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    /// Numeric bounds, or length bounds for text kinds.
    pub fn bounds(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }
}

pub struct Registry {
    store: SharedStore,
    endpoints: Vec<Endpoint>,
    current: Option<usize>,
}

impl Registry {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            endpoints: Vec::new(),
            current: None,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Select the endpoint later declarations append to, creating it if needed.
    pub fn mark_endpoint(&mut self, name: &str) {
        self.current = Some(self.index_or_create(name));
    }

    pub fn current_endpoint(&self) -> Option<&str> {
        self.current.map(|idx| self.endpoints[idx].name.as_str())
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn endpoint_mut(&mut self, name: &str) -> Option<&mut Endpoint> {
        self.endpoints.iter_mut().find(|e| e.name == name)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// First parameter called `name` in any endpoint, in endpoint order.
    pub fn find(&self, name: &str) -> Option<&Parameter> {
        self.endpoints.iter().find_map(|e| e.get(name))
    }

    pub fn string(&mut self, decl: Decl, init: &str) -> Result<String> {
        let param = self.declare(decl, ParamKind::String, init.to_string())?;
        Ok(param.effective().to_string())
    }

    pub fn password(&mut self, decl: Decl, init: &str) -> Result<String> {
        let param = self.declare(decl, ParamKind::Password, init.to_string())?;
        Ok(param.effective().to_string())
    }

    pub fn integer(&mut self, decl: Decl, init: i64) -> Result<i64> {
        let param = self.declare(decl, ParamKind::Int, init.to_string())?;
        Ok(param.as_int())
    }

    pub fn floating(&mut self, decl: Decl, init: f64) -> Result<f64> {
        let param = self.declare(decl, ParamKind::Float, init.to_string())?;
        Ok(param.as_float())
    }

    pub fn checkbox(&mut self, decl: Decl, init: bool) -> Result<bool> {
        let init = if init { "1" } else { "0" };
        let param = self.declare(decl, ParamKind::Bool, init.to_string())?;
        if param.value.is_empty() {
            param.value = param.init.clone();
        }
        Ok(param.as_bool())
    }

    /// Declare a selection; returns the selected code.
    pub fn dropdown(&mut self, decl: Decl, options: Vec<String>, init: i64) -> Result<i64> {
        let param = self.declare(decl, ParamKind::Dropdown { options }, init.to_string())?;
        Ok(param.as_int())
    }

    /// Expose the network credentials as parameters of the current endpoint,
    /// so the HTTP channel can write them like any other field.
    pub fn declare_credentials(&mut self) -> Result<()> {
        self.string(Decl::new(SSID_KEY).label("WiFi SSID").bounds(None, Some(32)), "")?;
        self.password(
            Decl::new(PASSWORD_KEY)
                .label("WiFi password")
                .bounds(None, Some(63)),
            "",
        )?;
        Ok(())
    }

    /// Set a parameter of the current endpoint and persist it.
    pub fn set_and_store(&mut self, name: &str, raw: &str) -> Result<()> {
        let store = self.store.clone();
        let param = self
            .current
            .and_then(|idx| self.endpoints[idx].params.iter_mut().find(|p| p.name == name))
            .ok_or_else(|| ProvisionError::NotFound {
                kind: "parameter",
                name: name.to_string(),
            })?;
        param.set(raw);
        write_text(store.as_ref(), &param.name, &param.value)
            .map_err(|err| ProvisionError::persistence(name, err))
    }

    fn index_or_create(&mut self, name: &str) -> usize {
        match self.endpoints.iter().position(|e| e.name == name) {
            Some(idx) => idx,
            None => {
                debug!(endpoint = name, "creating endpoint");
                self.endpoints.push(Endpoint::new(name));
                self.endpoints.len() - 1
            }
        }
    }

    fn declare(&mut self, decl: Decl, kind: ParamKind, init: String) -> Result<&mut Parameter> {
        validate_key(&decl.name).map_err(|_| {
            ProvisionError::Rejected(format!("invalid parameter name '{}'", decl.name))
        })?;
        let idx = match self.current {
            Some(idx) => idx,
            None => {
                let idx = self.index_or_create(MAIN_ENDPOINT);
                self.current = Some(idx);
                idx
            }
        };

        let endpoint = &mut self.endpoints[idx];
        if let Some(pos) = endpoint.params.iter().position(|p| p.name == decl.name) {
            debug!(endpoint = %endpoint.name, name = %decl.name, "parameter already declared");
            return Ok(&mut endpoint.params[pos]);
        }

        let mut param = Parameter::new(&decl.name, kind, init, &decl.label);
        param.min = decl.min;
        param.max = decl.max;
        param.value = read_text(self.store.as_ref(), &param.name).unwrap_or_else(|err| {
            warn!(name = %param.name, error = %err, "loading parameter failed, using default");
            String::new()
        });
        debug!(
            endpoint = %endpoint.name,
            name = %param.name,
            kind = param.kind.as_str(),
            stored = !param.value.is_empty(),
            "declared parameter"
        );
        endpoint.params.push(param);
        let last = endpoint.params.len() - 1;
        Ok(&mut endpoint.params[last])
    }
}
