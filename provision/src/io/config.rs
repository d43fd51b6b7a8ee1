//! Device configuration stored as TOML.
//!
//! Every field is defaulted, so an empty or missing file is a valid
//! configuration. Parameter declarations listed under `[[endpoints]]` are
//! applied to a [`Registry`] in file order.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::registry::{Decl, MAIN_ENDPOINT, Registry};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Station hostname. A trailing `-` gets the device suffix appended.
    pub hostname: String,
    pub connect: ConnectConfig,
    pub portal: PortalConfig,
    pub improv: ImprovConfig,
    pub http: HttpConfig,
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            hostname: "esp32-".to_string(),
            connect: ConnectConfig::default(),
            portal: PortalConfig::default(),
            improv: ImprovConfig::default(),
            http: HttpConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectConfig {
    /// Overall join budget. Negative waits forever.
    pub wait_seconds: i32,
    pub fallback_to_portal: bool,
    pub poll_interval_ms: u64,
    /// Re-issue the join request after this long without success.
    pub rejoin_after_secs: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            wait_seconds: 30,
            fallback_to_portal: true,
            poll_interval_ms: 100,
            rejoin_after_secs: 60,
        }
    }
}

impl ConnectConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rejoin_after(&self) -> Duration {
        Duration::from_secs(self.rejoin_after_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortalConfig {
    /// Protect the access point with a password (generated when none is stored).
    pub secure: bool,
    /// Initial access point password when `secure` is set.
    pub password: String,
    /// Interval of the heartbeat log line in portal mode. 0 disables it.
    pub heartbeat_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ImprovConfig {
    pub firmware_name: String,
    pub firmware_version: String,
    /// Empty means the resolved hostname.
    pub device_name: String,
    /// Empty means `http://<station ip>/`.
    pub device_url: String,
    /// Accept credentials with an empty secret.
    pub allow_open_networks: bool,
}

impl Default for ImprovConfig {
    fn default() -> Self {
        Self {
            firmware_name: env!("CARGO_PKG_NAME").to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            device_name: String::new(),
            device_url: String::new(),
            allow_open_networks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HttpConfig {
    /// Declare the credential keys on the `main` endpoint.
    pub expose_credentials: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            expose_credentials: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
}

/// One declarative parameter, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ParamDecl {
    String {
        name: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        init: String,
        min: Option<i64>,
        max: Option<i64>,
    },
    Password {
        name: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        init: String,
        min: Option<i64>,
        max: Option<i64>,
    },
    Int {
        name: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        init: i64,
        min: Option<i64>,
        max: Option<i64>,
    },
    Float {
        name: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        init: f64,
        min: Option<i64>,
        max: Option<i64>,
    },
    Bool {
        name: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        init: bool,
    },
    Dropdown {
        name: String,
        #[serde(default)]
        label: String,
        #[serde(default)]
        init: i64,
        options: Vec<String>,
    },
}

impl ParamDecl {
    pub fn name(&self) -> &str {
        match self {
            ParamDecl::String { name, .. }
            | ParamDecl::Password { name, .. }
            | ParamDecl::Int { name, .. }
            | ParamDecl::Float { name, .. }
            | ParamDecl::Bool { name, .. }
            | ParamDecl::Dropdown { name, .. } => name,
        }
    }

    fn declare(&self, registry: &mut Registry) -> crate::Result<()> {
        let decl = |name: &str, label: &str| Decl::new(name).label(label);
        match self {
            ParamDecl::String {
                name,
                label,
                init,
                min,
                max,
            } => {
                registry.string(decl(name, label).bounds(*min, *max), init)?;
            }
            ParamDecl::Password {
                name,
                label,
                init,
                min,
                max,
            } => {
                registry.password(decl(name, label).bounds(*min, *max), init)?;
            }
            ParamDecl::Int {
                name,
                label,
                init,
                min,
                max,
            } => {
                registry.integer(decl(name, label).bounds(*min, *max), *init)?;
            }
            ParamDecl::Float {
                name,
                label,
                init,
                min,
                max,
            } => {
                registry.floating(decl(name, label).bounds(*min, *max), *init)?;
            }
            ParamDecl::Bool { name, label, init } => {
                registry.checkbox(decl(name, label), *init)?;
            }
            ParamDecl::Dropdown {
                name,
                label,
                init,
                options,
            } => {
                registry.dropdown(decl(name, label), options.clone(), *init)?;
            }
        }
        Ok(())
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(anyhow!("hostname must be non-empty"));
        }
        if self.connect.poll_interval_ms == 0 {
            return Err(anyhow!("connect.poll_interval_ms must be > 0"));
        }
        if self.connect.rejoin_after_secs == 0 {
            return Err(anyhow!("connect.rejoin_after_secs must be > 0"));
        }
        let password_len = self.portal.password.len();
        if password_len != 0 && !(8..=63).contains(&password_len) {
            return Err(anyhow!("portal.password must be 8..=63 bytes"));
        }

        for endpoint in &self.endpoints {
            if endpoint.name.trim().is_empty() {
                return Err(anyhow!("endpoints.name must be non-empty"));
            }
            let mut seen = BTreeSet::new();
            for param in &endpoint.params {
                let name = param.name();
                if name.trim().is_empty() {
                    return Err(anyhow!(
                        "endpoint '{}' has a parameter without a name",
                        endpoint.name
                    ));
                }
                if !seen.insert(name) {
                    return Err(anyhow!(
                        "endpoint '{}' declares '{}' twice",
                        endpoint.name,
                        name
                    ));
                }
                if let ParamDecl::Dropdown { options, .. } = param
                    && options.is_empty()
                {
                    return Err(anyhow!("dropdown '{name}' must list at least one option"));
                }
            }
        }
        Ok(())
    }

    /// Hostname with the device suffix appended when it ends in `-`.
    pub fn hostname_for(&self, device_suffix: &str) -> String {
        if self.hostname.ends_with('-') {
            format!("{}{device_suffix}", self.hostname)
        } else {
            self.hostname.clone()
        }
    }

    /// Declare the configured parameters (and credentials, when exposed).
    ///
    /// Leaves the last declared endpoint selected.
    pub fn declare_parameters(&self, registry: &mut Registry) -> crate::Result<()> {
        if self.http.expose_credentials {
            registry.mark_endpoint(MAIN_ENDPOINT);
            registry.declare_credentials()?;
        }
        for endpoint in &self.endpoints {
            registry.mark_endpoint(&endpoint.name);
            for param in &endpoint.params {
                param.declare(registry)?;
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DeviceConfig::default()`.
pub fn load_config(path: &Path) -> Result<DeviceConfig> {
    if !path.exists() {
        let cfg = DeviceConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DeviceConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DeviceConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
