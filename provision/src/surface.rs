//! Read/write operations over registry endpoints, as served over HTTP.

use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::json::ObjectWriter;
use crate::error::{ProvisionError, Result};
use crate::io::credentials::CREDENTIAL_KEYS;
use crate::io::store::write_text;
use crate::registry::Registry;

/// Notification emitted after a fully persisted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    Saved {
        endpoint: String,
        /// A credential key took a new value; the device must rejoin.
        credentials_changed: bool,
    },
    /// At least one field could not be persisted.
    WriteFailed {
        endpoint: String,
        key: String,
        reason: String,
    },
}

pub struct ConfigSurface {
    registry: Registry,
    events: Option<Sender<ConfigEvent>>,
}

impl ConfigSurface {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            events: None,
        }
    }

    /// Deliver [`ConfigEvent`]s to `events` (typically the provisioner).
    pub fn with_events(mut self, events: Sender<ConfigEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Render `{"values":{..},"defaults":{..}}` for an endpoint.
    pub fn read(&self, endpoint: &str) -> Result<String> {
        let endpoint = self
            .registry
            .endpoint(endpoint)
            .ok_or_else(|| ProvisionError::endpoint_not_found(endpoint))?;

        let mut values = ObjectWriter::new();
        let mut defaults = ObjectWriter::new();
        for param in endpoint.params() {
            if let Some(rendered) = param.render_value() {
                values.member(&param.name, &rendered);
            }
            if let Some(rendered) = param.render_default() {
                defaults.member(&param.name, &rendered);
            }
        }

        let mut body = ObjectWriter::new();
        body.member("values", &values.finish())
            .member("defaults", &defaults.finish());
        Ok(body.finish())
    }

    /// Apply form fields to every parameter of an endpoint and persist each.
    ///
    /// Not atomic: a failed persist does not roll back fields already applied
    /// or stored, and later fields are still attempted. The first persistence
    /// error is returned; [`ConfigEvent::Saved`] is only sent when all succeeded.
    pub fn write(&mut self, endpoint: &str, form: &BTreeMap<String, String>) -> Result<()> {
        let store = self.registry.store().clone();
        let target = self
            .registry
            .endpoint_mut(endpoint)
            .ok_or_else(|| ProvisionError::endpoint_not_found(endpoint))?;

        let mut first_error = None;
        let mut credentials_changed = false;
        for param in target.params_mut() {
            let before = CREDENTIAL_KEYS
                .contains(&param.name.as_str())
                .then(|| param.value.clone());
            param.set(form.get(&param.name).map(String::as_str).unwrap_or(""));
            if before.is_some_and(|before| before != param.value) {
                credentials_changed = true;
            }

            if let Err(err) = write_text(store.as_ref(), &param.name, &param.value) {
                warn!(endpoint, name = %param.name, error = %err, "persisting parameter failed");
                if first_error.is_none() {
                    first_error = Some(ProvisionError::persistence(&param.name, err));
                }
            }
        }

        if let Some(err) = first_error {
            if let ProvisionError::Persistence { key, source } = &err {
                self.emit(ConfigEvent::WriteFailed {
                    endpoint: endpoint.to_string(),
                    key: key.clone(),
                    reason: source.to_string(),
                });
            }
            return Err(err);
        }

        info!(endpoint, credentials_changed, "configuration saved");
        self.emit(ConfigEvent::Saved {
            endpoint: endpoint.to_string(),
            credentials_changed,
        });
        Ok(())
    }

    fn emit(&self, event: ConfigEvent) {
        if let Some(events) = &self.events
            && events.send(event).is_err()
        {
            debug!("config event receiver dropped");
        }
    }

    /// Like [`write`](Self::write), taking a JSON object body instead of form fields.
    pub fn write_json(&mut self, endpoint: &str, body: &Value) -> Result<()> {
        let form = form_from_json(body)?;
        self.write(endpoint, &form)
    }

    /// Options of the first parameter called `name` across all endpoints.
    pub fn options(&self, name: &str) -> Result<&[String]> {
        self.registry
            .find(name)
            .and_then(|param| param.options())
            .ok_or_else(|| ProvisionError::dropdown_not_found(name))
    }
}

/// Convert a JSON object into form fields.
///
/// `false` and `null` become the empty string (an unchecked box), `true`
/// becomes `"1"`, numbers keep their literal text.
pub fn form_from_json(body: &Value) -> Result<BTreeMap<String, String>> {
    let object = body
        .as_object()
        .ok_or_else(|| ProvisionError::Rejected("expected a JSON object".to_string()))?;

    let mut form = BTreeMap::new();
    for (name, value) in object {
        let raw = match value {
            Value::String(text) => text.clone(),
            Value::Bool(true) => "1".to_string(),
            Value::Bool(false) | Value::Null => String::new(),
            Value::Number(number) => number.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(ProvisionError::Rejected(format!(
                    "field '{name}' must be a scalar"
                )));
            }
        };
        form.insert(name.clone(), raw);
    }
    Ok(form)
}
