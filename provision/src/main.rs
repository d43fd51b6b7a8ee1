//! Offline access to a device's provisioning state.
//!
//! Operates on the same directory store and configuration file the device
//! simulator uses, so endpoints can be inspected and edited without a
//! running device.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use provision::core::parameter::{PASSWORD_MASK, ParamKind};
use provision::exit_codes;
use provision::io::config::{DeviceConfig, load_config, write_config};
use provision::io::credentials::{self, Credentials};
use provision::io::store::{DirStore, SharedStore};
use provision::registry::Registry;
use provision::surface::ConfigSurface;
use provision::{ProvisionError, logging, web};

#[derive(Parser)]
#[command(
    name = "provision",
    version,
    about = "Inspect and edit headless WiFi provisioning state"
)]
struct Cli {
    /// Device configuration (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = "provision.toml")]
    config: PathBuf,

    /// Directory holding one file per stored key.
    #[arg(long, global = true, default_value = ".provision/store")]
    store_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a configuration file with every setting at its default.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print `{"values":..,"defaults":..}` for an endpoint.
    Show { endpoint: String },
    /// Write fields of an endpoint. Fields not given keep their value.
    Set {
        endpoint: String,
        /// `name=value` pairs.
        #[arg(required = true, value_parser = parse_assignment)]
        fields: Vec<(String, String)>,
    },
    /// Print the options of a dropdown parameter.
    Options { name: String },
    /// Store network credentials.
    Credentials { ssid: String, password: String },
    /// Delete stored network credentials.
    Forget,
    /// Summarize credentials, pending marker and endpoints.
    Status,
}

fn main() {
    logging::init("warn");
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        let code = err
            .downcast_ref::<ProvisionError>()
            .map_or(exit_codes::INVALID, ProvisionError::exit_code);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    // An existing but invalid file must not block `init --force`.
    if let Command::Init { force } = cli.command {
        return cmd_init(&cli.config, force);
    }
    let config = load_config(&cli.config)?;
    let store: SharedStore = Arc::new(
        DirStore::open(&cli.store_dir)
            .with_context(|| format!("open store {}", cli.store_dir.display()))?,
    );

    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force)?,
        Command::Show { endpoint } => {
            let surface = surface(&config, store)?;
            println!("{}", surface.read(&endpoint)?);
        }
        Command::Set { endpoint, fields } => {
            let mut surface = surface(&config, store)?;
            let mut form = current_form(&surface, &endpoint)?;
            form.extend(fields);
            surface.write(&endpoint, &form)?;
        }
        Command::Options { name } => {
            let surface = surface(&config, store)?;
            println!("{}", web::options_json(surface.options(&name)?));
        }
        Command::Credentials { ssid, password } => {
            if ssid.trim().is_empty() {
                return Err(ProvisionError::Rejected("blank network name".into()).into());
            }
            if password.is_empty() && !config.improv.allow_open_networks {
                return Err(ProvisionError::Rejected("blank network secret".into()).into());
            }
            credentials::save(store.as_ref(), &Credentials { ssid, password })?;
        }
        Command::Forget => credentials::forget(store.as_ref())?,
        Command::Status => {
            let surface = surface(&config, store.clone())?;
            let stored = credentials::load(store.as_ref());
            let endpoints: Vec<&str> = surface
                .registry()
                .endpoints()
                .iter()
                .map(|e| e.name())
                .collect();
            let status = json!({
                "hostname": config.hostname,
                "provisioned": stored.is_provisioned(),
                "ssid": stored.ssid,
                "pending": credentials::has_pending(store.as_ref()),
                "endpoints": endpoints,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&status).context("serialize status")?
            );
        }
    }
    Ok(())
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        eprintln!("{} exists; pass --force to overwrite", path.display());
        return Ok(());
    }
    write_config(path, &DeviceConfig::default())
}

fn surface(config: &DeviceConfig, store: SharedStore) -> Result<ConfigSurface> {
    let mut registry = Registry::new(store);
    config.declare_parameters(&mut registry)?;
    Ok(ConfigSurface::new(registry))
}

/// Form fields that reproduce the endpoint's stored state when written back.
fn current_form(surface: &ConfigSurface, endpoint: &str) -> Result<BTreeMap<String, String>> {
    let endpoint = surface
        .registry()
        .endpoint(endpoint)
        .ok_or_else(|| ProvisionError::endpoint_not_found(endpoint))?;
    Ok(endpoint
        .params()
        .iter()
        .map(|param| {
            let raw = match param.kind {
                ParamKind::Password => PASSWORD_MASK.to_string(),
                ParamKind::Bool if param.as_bool() => "1".to_string(),
                ParamKind::Bool => String::new(),
                _ => param.value.clone(),
            };
            (param.name.clone(), raw)
        })
        .collect())
}

fn parse_assignment(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    if name.is_empty() {
        return Err(format!("missing name in '{raw}'"));
    }
    Ok((name.to_string(), value.to_string()))
}
