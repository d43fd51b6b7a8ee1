//! Scripted fakes of every hardware seam, for unit and integration tests.
//!
//! Each fake is a cheap handle over shared state: clone it, box one clone into
//! the [`Provisioner`] and keep the other to script behavior and inspect what
//! happened.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::ProvisionError;
use crate::improv::frame::{FrameType, command, encode};
use crate::io::clock::Clock;
use crate::io::config::DeviceConfig;
use crate::io::radio::{JoinStatus, Network, Radio, RadioMode};
use crate::io::serial::SerialPort;
use crate::io::services::{CaptiveDns, ConfigServer};
use crate::io::store::{ByteStore, StoreError};
use crate::io::system::System;
use crate::provisioner::{Peripherals, Provisioner, ShutdownHandle};
use crate::registry::Registry;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// In-memory byte store with per-key failure injection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later put or delete of `key` fail.
    pub fn fail_key(&self, key: &str) {
        lock(&self.failing).insert(key.to_string());
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if lock(&self.failing).contains(key) {
            return Err(StoreError::Unavailable(format!("injected failure on '{key}'")));
        }
        Ok(())
    }
}

impl ByteStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(lock(&self.entries).get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.check(key)?;
        lock(&self.entries).insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check(key)?;
        lock(&self.entries).remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ClockState {
    now: Duration,
    sleeps: usize,
    shutdown_at: Option<(usize, ShutdownHandle)>,
}

/// Clock that only advances when slept on.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ClockState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        lock(&self.state).now += by;
    }

    pub fn sleeps(&self) -> usize {
        lock(&self.state).sleeps
    }

    /// Fire `handle` once `count` more sleeps have happened.
    pub fn shutdown_after(&self, count: usize, handle: ShutdownHandle) {
        let mut state = lock(&self.state);
        let at = state.sleeps + count;
        state.shutdown_at = Some((at, handle));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        lock(&self.state).now
    }

    fn sleep(&mut self, duration: Duration) {
        let mut state = lock(&self.state);
        state.now += duration;
        state.sleeps += 1;
        if let Some((at, handle)) = &state.shutdown_at
            && state.sleeps >= *at
        {
            handle.shutdown();
        }
    }
}

#[derive(Debug)]
struct RadioState {
    mode: RadioMode,
    auto_reconnect_disabled: bool,
    hostname: String,
    join_requests: Vec<(String, String)>,
    begin_status: JoinStatus,
    join_after_polls: Option<usize>,
    polls_since_begin: usize,
    status_polls: usize,
    joined: bool,
    access_point: Option<(String, Option<String>)>,
    ap_ip: Ipv4Addr,
    station_ip: Ipv4Addr,
    networks: Vec<Network>,
}

/// Radio whose join outcome is scripted in status polls.
///
/// By default a join never completes.
#[derive(Debug, Clone)]
pub struct ScriptedRadio {
    state: Arc<Mutex<RadioState>>,
}

impl Default for ScriptedRadio {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState {
                mode: RadioMode::Off,
                auto_reconnect_disabled: false,
                hostname: String::new(),
                join_requests: Vec::new(),
                begin_status: JoinStatus::Connecting,
                join_after_polls: None,
                polls_since_begin: 0,
                status_polls: 0,
                joined: false,
                access_point: None,
                ap_ip: Ipv4Addr::new(192, 168, 4, 1),
                station_ip: Ipv4Addr::new(10, 0, 0, 7),
                networks: Vec::new(),
            })),
        }
    }
}

impl ScriptedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report joined on the `polls`-th status poll after each join request.
    pub fn join_after_polls(&self, polls: usize) {
        lock(&self.state).join_after_polls = Some(polls);
    }

    /// Status returned directly by the join request.
    pub fn set_begin_status(&self, status: JoinStatus) {
        lock(&self.state).begin_status = status;
    }

    pub fn set_networks(&self, networks: Vec<Network>) {
        lock(&self.state).networks = networks;
    }

    pub fn join_requests(&self) -> Vec<(String, String)> {
        lock(&self.state).join_requests.clone()
    }

    pub fn status_polls(&self) -> usize {
        lock(&self.state).status_polls
    }

    pub fn mode_now(&self) -> RadioMode {
        lock(&self.state).mode
    }

    pub fn hostname(&self) -> String {
        lock(&self.state).hostname.clone()
    }

    pub fn auto_reconnect_disabled(&self) -> bool {
        lock(&self.state).auto_reconnect_disabled
    }

    /// Last access point started: SSID and password.
    pub fn access_point(&self) -> Option<(String, Option<String>)> {
        lock(&self.state).access_point.clone()
    }

    pub fn ap_ip(&self) -> Ipv4Addr {
        lock(&self.state).ap_ip
    }

    pub fn station(&self) -> Ipv4Addr {
        lock(&self.state).station_ip
    }
}

impl Radio for ScriptedRadio {
    fn mode(&self) -> RadioMode {
        lock(&self.state).mode
    }

    fn set_mode(&mut self, mode: RadioMode) {
        let mut state = lock(&self.state);
        state.mode = mode;
        if mode != RadioMode::Station {
            state.joined = false;
        }
    }

    fn disable_auto_reconnect(&mut self) {
        lock(&self.state).auto_reconnect_disabled = true;
    }

    fn set_hostname(&mut self, hostname: &str) {
        lock(&self.state).hostname = hostname.to_string();
    }

    fn begin(&mut self, ssid: &str, password: &str) -> JoinStatus {
        let mut state = lock(&self.state);
        state.mode = RadioMode::Station;
        state
            .join_requests
            .push((ssid.to_string(), password.to_string()));
        state.polls_since_begin = 0;
        state.joined = state.begin_status.is_joined();
        state.begin_status
    }

    fn status(&mut self) -> JoinStatus {
        let mut state = lock(&self.state);
        state.status_polls += 1;
        state.polls_since_begin += 1;
        if let Some(polls) = state.join_after_polls
            && state.polls_since_begin >= polls
        {
            state.joined = true;
        }
        if state.joined {
            JoinStatus::Joined
        } else {
            JoinStatus::Connecting
        }
    }

    fn disconnect(&mut self) {
        lock(&self.state).joined = false;
    }

    fn start_access_point(&mut self, ssid: &str, password: Option<&str>) -> bool {
        let mut state = lock(&self.state);
        state.mode = RadioMode::AccessPoint;
        state.access_point = Some((ssid.to_string(), password.map(str::to_string)));
        true
    }

    fn access_point_ip(&self) -> Ipv4Addr {
        lock(&self.state).ap_ip
    }

    fn station_ip(&self) -> Option<Ipv4Addr> {
        let state = lock(&self.state);
        state.joined.then_some(state.station_ip)
    }

    fn scan(&mut self) -> Vec<Network> {
        lock(&self.state).networks.clone()
    }
}

#[derive(Debug, Default)]
struct SystemState {
    restarts: usize,
    watchdog_feeds: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingSystem {
    state: Arc<Mutex<SystemState>>,
}

impl RecordingSystem {
    pub fn suffix(&self) -> String {
        "a1b2c3".to_string()
    }

    pub fn restarts(&self) -> usize {
        lock(&self.state).restarts
    }

    pub fn watchdog_feeds(&self) -> usize {
        lock(&self.state).watchdog_feeds
    }
}

impl System for RecordingSystem {
    fn restart(&mut self) {
        lock(&self.state).restarts += 1;
    }

    fn feed_watchdog(&mut self) {
        lock(&self.state).watchdog_feeds += 1;
    }

    fn device_suffix(&self) -> String {
        self.suffix()
    }

    fn chip_family(&self) -> String {
        "ESP32".to_string()
    }
}

#[derive(Debug, Default)]
struct DnsState {
    started: Option<Ipv4Addr>,
    processed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDns {
    state: Arc<Mutex<DnsState>>,
}

impl RecordingDns {
    pub fn started(&self) -> Option<Ipv4Addr> {
        lock(&self.state).started
    }

    pub fn processed(&self) -> usize {
        lock(&self.state).processed
    }
}

impl CaptiveDns for RecordingDns {
    fn start(&mut self, address: Ipv4Addr) -> io::Result<()> {
        lock(&self.state).started = Some(address);
        Ok(())
    }

    fn process_next(&mut self) {
        lock(&self.state).processed += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingServer {
    starts: Arc<Mutex<Vec<(Ipv4Addr, bool)>>>,
}

impl RecordingServer {
    /// Every start call: address and access point flag.
    pub fn starts(&self) -> Vec<(Ipv4Addr, bool)> {
        lock(&self.starts).clone()
    }
}

impl ConfigServer for RecordingServer {
    fn start(&mut self, address: Ipv4Addr, access_point: bool) -> io::Result<()> {
        lock(&self.starts).push((address, access_point));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SerialState {
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
}

/// Serial line fed by the test; records each write as one frame.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSerial {
    state: Arc<Mutex<SerialState>>,
}

impl ScriptedSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, bytes: &[u8]) {
        lock(&self.state).inbound.extend(bytes);
    }

    /// Queue an RPC command frame.
    pub fn feed_rpc(&self, code: u8, data: &[u8]) {
        let mut payload = vec![code, data.len() as u8];
        payload.extend_from_slice(data);
        self.feed(&encode(FrameType::RpcCommand, &payload));
    }

    pub fn feed_credentials(&self, ssid: &str, password: &str) {
        let mut data = vec![ssid.len() as u8];
        data.extend_from_slice(ssid.as_bytes());
        data.push(password.len() as u8);
        data.extend_from_slice(password.as_bytes());
        self.feed_rpc(command::WIFI_SETTINGS, &data);
    }

    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.state).written.clone()
    }

    pub fn clear_written(&self) {
        lock(&self.state).written.clear();
    }
}

impl SerialPort for ScriptedSerial {
    fn read_available(&mut self, buf: &mut Vec<u8>) {
        buf.extend(lock(&self.state).inbound.drain(..));
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        lock(&self.state).written.push(bytes.to_vec());
        Ok(())
    }
}

/// Records hook invocations by name.
#[derive(Debug, Clone, Default)]
pub struct HookLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl HookLog {
    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    fn recorder(&self, name: &'static str) -> Option<Box<dyn FnMut() + Send>> {
        let entries = self.entries.clone();
        Some(Box::new(move || lock(&entries).push(name.to_string())))
    }

    /// Install a recorder on every notification hook (not the delay hooks).
    pub fn attach(&self, provisioner: &mut Provisioner) {
        let hooks = &mut provisioner.hooks;
        hooks.on_connect = self.recorder("connect");
        hooks.on_success = self.recorder("success");
        hooks.on_portal = self.recorder("portal");
        hooks.on_config_saved = self.recorder("config_saved");
        hooks.on_restart = self.recorder("restart");
        hooks.on_identify = self.recorder("identify");
        let entries = self.entries.clone();
        hooks.on_failure = Some(Box::new(move |_: &ProvisionError| {
            lock(&entries).push("failure".to_string());
        }));
    }
}

/// A full set of fakes sharing one store.
#[derive(Debug, Clone, Default)]
pub struct TestDevice {
    pub store: Arc<MemoryStore>,
    pub radio: ScriptedRadio,
    pub clock: ManualClock,
    pub system: RecordingSystem,
    pub dns: RecordingDns,
    pub server: RecordingServer,
    pub serial: ScriptedSerial,
}

impl TestDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> Registry {
        Registry::new(self.store.clone())
    }

    pub fn provisioner(&self, config: DeviceConfig) -> Provisioner {
        Provisioner::new(
            config,
            self.store.clone(),
            Peripherals {
                radio: Box::new(self.radio.clone()),
                clock: Box::new(self.clock.clone()),
                system: Box::new(self.system.clone()),
                dns: Box::new(self.dns.clone()),
                server: Box::new(self.server.clone()),
            },
        )
    }

    /// Shut `provisioner`'s loops down after `ticks` more clock sleeps.
    pub fn shutdown_after_ticks(&self, provisioner: &Provisioner, ticks: usize) {
        self.clock
            .shutdown_after(ticks, provisioner.shutdown_handle());
    }
}
