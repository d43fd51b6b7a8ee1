//! Simulated hardware: radio, system and serial line.

use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use provision::io::config::DeviceConfig;
use provision::io::radio::{JoinStatus, Network, Radio, RadioMode};
use provision::io::serial::SerialPort;
use provision::io::system::System;

/// Device configuration plus the `[sim]` table describing the fake world.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimFile {
    #[serde(flatten)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimConfig {
    pub station_ip: Ipv4Addr,
    pub ap_ip: Ipv4Addr,
    pub mac: String,
    pub chip: String,
    pub networks: Vec<SimNetwork>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            station_ip: Ipv4Addr::new(192, 168, 1, 50),
            ap_ip: Ipv4Addr::new(192, 168, 4, 1),
            mac: "24:0a:c4:12:34:56".to_string(),
            chip: "ESP32".to_string(),
            networks: Vec::new(),
        }
    }
}

impl SimConfig {
    /// Last three MAC octets, lowercase hex without separators.
    pub fn device_suffix(&self) -> String {
        let octets: Vec<&str> = self.mac.split([':', '-']).collect();
        octets[octets.len().saturating_sub(3)..]
            .concat()
            .to_ascii_lowercase()
    }
}

/// A network the simulated radio can see.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SimNetwork {
    pub ssid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_rssi")]
    pub rssi: i32,
    #[serde(default = "default_secured")]
    pub secured: bool,
    /// Status polls until a join completes.
    #[serde(default = "default_join_polls")]
    pub join_polls: usize,
}

fn default_rssi() -> i32 {
    -60
}

fn default_secured() -> bool {
    true
}

fn default_join_polls() -> usize {
    5
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug)]
struct RadioState {
    mode: RadioMode,
    hostname: String,
    status: JoinStatus,
    polls_left: usize,
}

/// Radio over the networks listed in `[sim]`.
///
/// Cloned handles share state, so the HTTP scan route sees what the
/// provisioner sees.
#[derive(Debug, Clone)]
pub struct SimRadio {
    config: Arc<SimConfig>,
    state: Arc<Mutex<RadioState>>,
}

impl SimRadio {
    pub fn new(config: Arc<SimConfig>) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(RadioState {
                mode: RadioMode::Off,
                hostname: String::new(),
                status: JoinStatus::Idle,
                polls_left: 0,
            })),
        }
    }

    pub fn visible(&self) -> Vec<Network> {
        self.config
            .networks
            .iter()
            .map(|n| Network {
                ssid: n.ssid.clone(),
                rssi: n.rssi,
                secured: n.secured,
            })
            .collect()
    }
}

impl Radio for SimRadio {
    fn mode(&self) -> RadioMode {
        lock(&self.state).mode
    }

    fn set_mode(&mut self, mode: RadioMode) {
        let mut state = lock(&self.state);
        debug!(?mode, "radio mode");
        state.mode = mode;
        if mode != RadioMode::Station {
            state.status = JoinStatus::Idle;
        }
    }

    fn disable_auto_reconnect(&mut self) {}

    fn set_hostname(&mut self, hostname: &str) {
        lock(&self.state).hostname = hostname.to_string();
    }

    fn begin(&mut self, ssid: &str, password: &str) -> JoinStatus {
        let mut state = lock(&self.state);
        state.mode = RadioMode::Station;
        let target = self.config.networks.iter().find(|n| n.ssid == ssid);
        state.status = match target {
            None => JoinStatus::NoNetwork,
            Some(n) if n.secured && n.password != password => JoinStatus::AuthFailed,
            Some(n) => {
                state.polls_left = n.join_polls;
                if n.join_polls == 0 {
                    JoinStatus::Joined
                } else {
                    JoinStatus::Connecting
                }
            }
        };
        info!(ssid, hostname = %state.hostname, status = ?state.status, "join requested");
        state.status
    }

    fn status(&mut self) -> JoinStatus {
        let mut state = lock(&self.state);
        if state.status == JoinStatus::Connecting {
            state.polls_left = state.polls_left.saturating_sub(1);
            if state.polls_left == 0 {
                state.status = JoinStatus::Joined;
            }
        }
        state.status
    }

    fn disconnect(&mut self) {
        lock(&self.state).status = JoinStatus::Disconnected;
    }

    fn start_access_point(&mut self, ssid: &str, password: Option<&str>) -> bool {
        lock(&self.state).mode = RadioMode::AccessPoint;
        info!(ssid, secured = password.is_some(), ip = %self.config.ap_ip, "access point up");
        true
    }

    fn access_point_ip(&self) -> Ipv4Addr {
        self.config.ap_ip
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        lock(&self.state)
            .status
            .is_joined()
            .then_some(self.config.station_ip)
    }

    fn scan(&mut self) -> Vec<Network> {
        self.visible()
    }
}

/// Restart requests become a flag the host process acts on.
#[derive(Debug, Clone)]
pub struct SimSystem {
    suffix: String,
    chip: String,
    restarted: Arc<AtomicBool>,
}

impl SimSystem {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            suffix: config.device_suffix(),
            chip: config.chip.clone(),
            restarted: Arc::default(),
        }
    }

    pub fn restarted(&self) -> bool {
        self.restarted.load(Ordering::SeqCst)
    }
}

impl System for SimSystem {
    fn restart(&mut self) {
        self.restarted.store(true, Ordering::SeqCst);
    }

    fn feed_watchdog(&mut self) {}

    fn device_suffix(&self) -> String {
        self.suffix.clone()
    }

    fn chip_family(&self) -> String {
        self.chip.clone()
    }
}

/// Serial line over the process's stdin and stdout.
///
/// A reader thread forwards stdin chunks so `read_available` never blocks.
pub struct StdioSerial {
    inbound: Receiver<Vec<u8>>,
}

impl StdioSerial {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buf = [0u8; 256];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        warn!(error = %err, "serial read failed");
                        break;
                    }
                }
            }
        });
        Self { inbound: rx }
    }
}

impl SerialPort for StdioSerial {
    fn read_available(&mut self, buf: &mut Vec<u8>) {
        for chunk in self.inbound.try_iter() {
            buf.extend_from_slice(&chunk);
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(bytes)?;
        stdout.flush()
    }
}
