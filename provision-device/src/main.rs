//! Simulated headless device.
//!
//! Runs the provisioning state machine against a simulated radio, serves the
//! configuration surface over HTTP, answers captive DNS on a UDP port and
//! speaks Improv over stdin/stdout. A requested restart ends the process with
//! the `RESTART` exit code so a supervisor can start it again.

mod dns;
mod routes;
mod server;
mod sim;
mod state;

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use tracing::{info, warn};

use provision::exit_codes;
use provision::io::clock::SystemClock;
use provision::io::store::{DirStore, SharedStore};
use provision::logging;
use provision::provisioner::{ConnectOutcome, LoopExit, Peripherals, Provisioner};
use provision::registry::Registry;
use provision::surface::ConfigSurface;

use crate::dns::UdpCaptiveDns;
use crate::server::AxumServer;
use crate::sim::{SimFile, SimRadio, SimSystem, StdioSerial};
use crate::state::AppState;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "provision-device")]
#[command(about = "Simulated headless device running WiFi provisioning")]
struct Args {
    /// Device configuration with an optional [sim] table
    #[arg(long, default_value = "provision.toml")]
    config: PathBuf,

    /// Directory holding one file per stored key
    #[arg(long, default_value = ".provision/store")]
    store_dir: PathBuf,

    /// Address to bind the HTTP server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// HTTP port
    #[arg(long, default_value = "8080")]
    port: u16,

    /// UDP port for the captive DNS responder
    #[arg(long, default_value = "5353")]
    dns_port: u16,

    /// Override `connect.wait_seconds` (negative waits forever)
    #[arg(long, allow_hyphen_values = true)]
    wait: Option<i32>,

    /// Do not bridge Improv over stdin/stdout
    #[arg(long)]
    no_serial: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init("provision=info,provision_device=info");

    let args = Args::parse();
    let file = load_sim_file(&args.config)?;
    let device = file.device;
    let sim = Arc::new(file.sim);

    let store: SharedStore = Arc::new(
        DirStore::open(&args.store_dir)
            .with_context(|| format!("open store {}", args.store_dir.display()))?,
    );
    let mut registry = Registry::new(store.clone());
    device.declare_parameters(&mut registry)?;

    let (events_tx, events_rx) = mpsc::channel();
    let surface = Arc::new(Mutex::new(
        ConfigSurface::new(registry).with_events(events_tx),
    ));

    let radio = SimRadio::new(sim.clone());
    let system = SimSystem::new(&sim);
    let app_state = AppState::new(surface.clone(), radio.clone());
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    let fallback = device.connect.fallback_to_portal;
    let wait_seconds = args.wait.unwrap_or(device.connect.wait_seconds);
    let mut provisioner = Provisioner::new(
        device,
        store,
        Peripherals {
            radio: Box::new(radio),
            clock: Box::new(SystemClock::new()),
            system: Box::new(system.clone()),
            dns: Box::new(UdpCaptiveDns::new(args.dns_port)),
            server: Box::new(AxumServer::new(
                addr,
                tokio::runtime::Handle::current(),
                app_state,
                app_routes(),
            )),
        },
    );
    {
        let mut surface = surface.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        provisioner.begin(surface.registry_mut())?;
    }
    provisioner.watch_config(events_rx);
    if !args.no_serial {
        provisioner.begin_serial_improv(Box::new(StdioSerial::spawn()));
    }
    info!(hostname = %provisioner.hostname(), store = %args.store_dir.display(), "device booting");

    let shutdown = provisioner.shutdown_handle();
    let mut running =
        tokio::task::spawn_blocking(move || run_device(provisioner, fallback, wait_seconds));

    let exit = tokio::select! {
        joined = &mut running => joined.context("device thread panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            shutdown.shutdown();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut running).await {
                Ok(joined) => joined.context("device thread panicked")?,
                Err(_) => {
                    warn!("device loop did not stop in time");
                    LoopExit::Shutdown
                }
            }
        }
    };

    if system.restarted() {
        info!(?exit, "restart requested");
        std::process::exit(exit_codes::RESTART);
    }
    Ok(())
}

/// Boot sequence of a device: join (or portal), then serve until told to stop.
fn run_device(mut provisioner: Provisioner, fallback: bool, wait_seconds: i32) -> LoopExit {
    match provisioner.connect(fallback, wait_seconds) {
        Ok(ConnectOutcome::Portal(exit)) => exit,
        Ok(ConnectOutcome::Connected) => provisioner.run_service_loop(),
        Err(err) => {
            warn!(error = %err, "continuing without network");
            provisioner.run_service_loop()
        }
    }
}

/// Routes the simulated application serves next to the configuration surface.
fn app_routes() -> Router {
    Router::new().route("/health", get(|| async { "ok" }))
}

/// Load the device file. A missing file means defaults.
fn load_sim_file(path: &Path) -> Result<SimFile> {
    let file = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<SimFile>(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        SimFile::default()
    };
    file.device
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(file)
}
