//! WiFi radio abstraction.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    Off,
    Station,
    AccessPoint,
}

/// Station status as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Idle,
    Connecting,
    Joined,
    NoNetwork,
    AuthFailed,
    Disconnected,
}

impl JoinStatus {
    pub fn is_joined(self) -> bool {
        self == JoinStatus::Joined
    }
}

/// One scan result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub ssid: String,
    pub rssi: i32,
    pub secured: bool,
}

pub trait Radio: Send {
    fn mode(&self) -> RadioMode;
    fn set_mode(&mut self, mode: RadioMode);
    /// Stop the driver from persisting credentials or reconnecting on its own.
    fn disable_auto_reconnect(&mut self);
    fn set_hostname(&mut self, hostname: &str);
    /// Issue a join request and return the immediate status.
    fn begin(&mut self, ssid: &str, password: &str) -> JoinStatus;
    fn status(&mut self) -> JoinStatus;
    fn disconnect(&mut self);
    /// Start an access point. Returns `false` if the driver refused.
    fn start_access_point(&mut self, ssid: &str, password: Option<&str>) -> bool;
    fn access_point_ip(&self) -> Ipv4Addr;
    /// Address obtained as a station, once joined.
    fn station_ip(&self) -> Option<Ipv4Addr>;
    fn scan(&mut self) -> Vec<Network>;
}

/// Deduplicate scan results by SSID keeping the strongest signal.
/// Hidden networks (empty SSID) are dropped.
pub fn strongest_networks(networks: &[Network]) -> BTreeMap<String, Network> {
    let mut best: BTreeMap<String, Network> = BTreeMap::new();
    for network in networks {
        if network.ssid.is_empty() {
            continue;
        }
        match best.get(&network.ssid) {
            Some(existing) if existing.rssi >= network.rssi => {}
            _ => {
                best.insert(network.ssid.clone(), network.clone());
            }
        }
    }
    best
}
