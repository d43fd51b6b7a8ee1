//! Connection and provisioning state machine.
//!
//! A [`Provisioner`] owns the hardware seams and drives them through first
//! contact, timed joins, the access point portal and the Improv handshake.
//! Every loop is cooperative: it sleeps through the injected [`Clock`] and
//! hands control to the application only through [`Hooks`].
//!
//! Loops that never end on hardware (the portal, the service loop) return a
//! [`LoopExit`] here once a restart was requested or the [`ShutdownHandle`]
//! fired, so hosts and tests can unwind.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::error::{ProvisionError, Result};
use crate::improv::frame::{ImprovError, ImprovState, command};
use crate::improv::{DeviceInfo, ImprovAdapter, ImprovEvent};
use crate::io::clock::Clock;
use crate::io::config::DeviceConfig;
use crate::io::credentials::{self, Credentials};
use crate::io::radio::{Radio, RadioMode};
use crate::io::serial::SerialPort;
use crate::io::services::{CaptiveDns, ConfigServer};
use crate::io::store::{SharedStore, StoreError};
use crate::io::system::System;
use crate::registry::{Decl, Registry};
use crate::surface::ConfigEvent;

pub const PORTAL_SECURE_KEY: &str = "portal-secure";
pub const PORTAL_PASSWORD_KEY: &str = "portal-password";

/// Characters that cannot be confused with one another on a label.
const PASSWORD_ALPHABET: &[u8] = b"ABCEFGHJKLMNPRSTUXYZabcdefhkmnorstvxz23456789-#@?!";
const PASSWORD_LEN: usize = 16;

const AP_SETTLE: Duration = Duration::from_millis(500);
const PORTAL_TICK: Duration = Duration::from_millis(1);
const SERVICE_TICK: Duration = Duration::from_millis(10);

type Hook = Option<Box<dyn FnMut() + Send>>;
type DelayHook = Option<Box<dyn FnMut() -> Duration + Send>>;

/// Application callbacks, invoked synchronously from the provisioning loops.
#[derive(Default)]
pub struct Hooks {
    /// Before the first join request.
    pub on_connect: Hook,
    /// Between join polls; returns the next poll delay.
    pub on_wait_loop: DelayHook,
    pub on_success: Hook,
    /// Join timeout or persistence failure on any channel.
    pub on_failure: Option<Box<dyn FnMut(&ProvisionError) + Send>>,
    /// After the access point and DNS responder are up.
    pub on_portal: Hook,
    /// Portal heartbeat; returns the delay until the next call.
    pub on_portal_wait_loop: DelayHook,
    pub on_config_saved: Hook,
    /// Right before the device restarts.
    pub on_restart: Hook,
    pub on_identify: Hook,
}

/// The hardware the provisioner drives.
pub struct Peripherals {
    pub radio: Box<dyn Radio>,
    pub clock: Box<dyn Clock>,
    pub system: Box<dyn System>,
    pub dns: Box<dyn CaptiveDns>,
    pub server: Box<dyn ConfigServer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    /// Nothing attempted yet, or the last attempt failed without fallback.
    Idle,
    /// No stored network identity.
    Unprovisioned,
    Connecting,
    Connected,
    Portal,
}

/// Why a portal or service loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Restart,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    /// The attempt ended in the portal, which ran until `LoopExit`.
    Portal(LoopExit),
}

/// External termination signal for the blocking loops.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Provisioner {
    config: DeviceConfig,
    hostname: String,
    store: SharedStore,
    radio: Box<dyn Radio>,
    clock: Box<dyn Clock>,
    system: Box<dyn System>,
    dns: Box<dyn CaptiveDns>,
    server: Box<dyn ConfigServer>,
    pub hooks: Hooks,
    improv: Option<ImprovAdapter>,
    config_events: Option<Receiver<ConfigEvent>>,
    state: ProvisionState,
    portal_password: Option<String>,
    begun: bool,
    restart_requested: bool,
    shutdown: ShutdownHandle,
}

impl Provisioner {
    pub fn new(config: DeviceConfig, store: SharedStore, peripherals: Peripherals) -> Self {
        let hostname = config.hostname_for(&peripherals.system.device_suffix());
        Self {
            config,
            hostname,
            store,
            radio: peripherals.radio,
            clock: peripherals.clock,
            system: peripherals.system,
            dns: peripherals.dns,
            server: peripherals.server,
            hooks: Hooks::default(),
            improv: None,
            config_events: None,
            state: ProvisionState::Idle,
            portal_password: None,
            begun: false,
            restart_requested: false,
            shutdown: ShutdownHandle::default(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Access point password in effect, if the portal is secured.
    pub fn portal_password(&self) -> Option<&str> {
        self.portal_password.as_deref()
    }

    /// Declare the provisioner's own parameters. Idempotent.
    ///
    /// With `portal.secure`, a `portal-secure` checkbox and (unless the
    /// configuration fixes one) a `portal-password` field are declared on the
    /// current endpoint. A missing password is generated and stored.
    pub fn begin(&mut self, registry: &mut Registry) -> Result<()> {
        if self.begun {
            return Ok(());
        }
        self.begun = true;

        if !self.config.portal.secure {
            return Ok(());
        }
        let secure = registry.checkbox(
            Decl::new(PORTAL_SECURE_KEY).label("Secure portal"),
            true,
        )?;
        if !secure {
            info!("portal security disabled by stored setting");
            return Ok(());
        }

        if !self.config.portal.password.is_empty() {
            self.portal_password = Some(self.config.portal.password.clone());
            return Ok(());
        }
        let mut password = registry.password(
            Decl::new(PORTAL_PASSWORD_KEY)
                .label("Portal password")
                .bounds(Some(8), Some(63)),
            "",
        )?;
        if password.is_empty() {
            password = generate_password(&mut rand::thread_rng());
            info!("generated portal password");
            if let Err(err) = registry.set_and_store(PORTAL_PASSWORD_KEY, &password) {
                warn!(error = %err, "storing generated portal password failed");
                self.fail(&err);
            }
        }
        self.portal_password = Some(password);
        Ok(())
    }

    /// Attach the Improv handshake to a serial line.
    pub fn begin_serial_improv(&mut self, port: Box<dyn SerialPort>) {
        let improv = &self.config.improv;
        let device_name = if improv.device_name.is_empty() {
            self.hostname.clone()
        } else {
            improv.device_name.clone()
        };
        let info = DeviceInfo {
            firmware_name: improv.firmware_name.clone(),
            firmware_version: improv.firmware_version.clone(),
            chip_family: self.system.chip_family(),
            device_name,
        };
        info!(device = %info.device_name, "improv serial ready");
        let mut adapter = ImprovAdapter::new(port, info);
        adapter.send_state(self.improv_state());
        self.improv = Some(adapter);
    }

    /// Receive save notifications from the configuration surface.
    pub fn watch_config(&mut self, events: Receiver<ConfigEvent>) {
        self.config_events = Some(events);
    }

    /// Join the stored network.
    ///
    /// Without stored credentials the portal starts immediately. When the
    /// join does not complete within `wait_seconds` (negative waits forever)
    /// the failure hook runs and either the portal starts (`fallback`) or
    /// [`ProvisionError::ConnectTimeout`] is returned.
    #[instrument(skip(self), fields(hostname = %self.hostname))]
    pub fn connect(&mut self, fallback: bool, wait_seconds: i32) -> Result<ConnectOutcome> {
        if self.radio.mode() != RadioMode::Off {
            self.radio.set_mode(RadioMode::Off);
        }
        self.radio.disable_auto_reconnect();

        let Credentials { ssid, password } = credentials::load(self.store.as_ref());
        if ssid.is_empty() {
            info!("first contact, no stored network");
            self.set_state(ProvisionState::Unprovisioned);
            return Ok(ConnectOutcome::Portal(self.portal()));
        }

        self.set_state(ProvisionState::Connecting);
        info!(ssid = %ssid, wait_seconds, "joining network");
        notify(&mut self.hooks.on_connect);

        self.radio.set_hostname(&self.hostname);
        let mut status = self.radio.begin(&ssid, &password);

        let budget = u64::try_from(wait_seconds).ok().map(Duration::from_secs);
        let rejoin_after = self.config.connect.rejoin_after();
        let started = self.clock.now();
        let mut last_begin = started;
        while !status.is_joined() {
            if self.clock.now().saturating_sub(last_begin) > rejoin_after {
                last_begin = self.clock.now();
                warn!(ssid = %ssid, "join stalled, re-issuing request");
                self.radio.disconnect();
                status = self.radio.begin(&ssid, &password);
            } else {
                status = self.radio.status();
            }

            let delay = match &mut self.hooks.on_wait_loop {
                Some(hook) => hook(),
                None => self.config.connect.poll_interval(),
            };
            self.clock.sleep(delay);

            if let Some(budget) = budget
                && self.clock.now().saturating_sub(started) > budget
            {
                break;
            }
        }

        if !status.is_joined() {
            let err = ProvisionError::ConnectTimeout {
                ssid,
                waited: self.clock.now().saturating_sub(started),
            };
            warn!(?status, error = %err, "join failed");
            if credentials::has_pending(self.store.as_ref())
                && let Some(improv) = self.improv.as_mut()
            {
                improv.send_error(ImprovError::UnableToConnect);
            }
            self.fail(&err);
            if fallback {
                return Ok(ConnectOutcome::Portal(self.portal()));
            }
            self.set_state(ProvisionState::Idle);
            return Err(err);
        }

        self.set_state(ProvisionState::Connected);
        let ip = self.radio.station_ip();
        info!(ip = ?ip, "joined network");
        self.report_pending();
        if let Err(err) = self.server.start(ip.unwrap_or(Ipv4Addr::UNSPECIFIED), false) {
            warn!(error = %err, "starting config server failed");
        }
        notify(&mut self.hooks.on_success);
        Ok(ConnectOutcome::Connected)
    }

    /// Run the access point portal until a restart or shutdown.
    #[instrument(skip(self), fields(hostname = %self.hostname))]
    pub fn portal(&mut self) -> LoopExit {
        self.set_state(ProvisionState::Portal);
        self.radio.disconnect();
        self.radio.set_mode(RadioMode::AccessPoint);

        let password = self.portal_password.clone();
        info!(ssid = %self.hostname, secured = password.is_some(), "starting access point");
        if !self
            .radio
            .start_access_point(&self.hostname, password.as_deref())
        {
            warn!("failed to start access point");
        }
        self.clock.sleep(AP_SETTLE);

        let ip = self.radio.access_point_ip();
        if let Err(err) = self.dns.start(ip) {
            warn!(error = %err, "starting captive dns failed");
        }
        notify(&mut self.hooks.on_portal);
        info!(%ip, "portal ready");
        if let Err(err) = self.server.start(ip, true) {
            warn!(error = %err, "starting config server failed");
        }

        let heartbeat = Duration::from_millis(self.config.portal.heartbeat_ms);
        let mut last_beat = self.clock.now();
        let mut next_beat = Duration::ZERO;
        loop {
            self.dns.process_next();
            self.service_channels();
            if let Some(exit) = self.exit_requested() {
                return exit;
            }

            let now = self.clock.now();
            if now.saturating_sub(last_beat) > next_beat {
                if let Some(hook) = &mut self.hooks.on_portal_wait_loop {
                    next_beat = hook();
                    last_beat = now;
                } else if !heartbeat.is_zero() {
                    info!(%ip, "portal waiting for configuration");
                    next_beat = heartbeat;
                    last_beat = now;
                }
            }

            self.system.feed_watchdog();
            self.clock.sleep(PORTAL_TICK);
        }
    }

    /// Handle pending serial frames and configuration events once.
    ///
    /// Returns the exit reason once a restart was requested or shutdown
    /// signalled; the caller's loop should stop then.
    pub fn service(&mut self) -> Option<LoopExit> {
        self.service_channels();
        self.exit_requested()
    }

    /// Call [`service`](Self::service) until it asks to stop.
    pub fn run_service_loop(&mut self) -> LoopExit {
        loop {
            if let Some(exit) = self.service() {
                return exit;
            }
            self.system.feed_watchdog();
            self.clock.sleep(SERVICE_TICK);
        }
    }

    /// Fire the restart hook and ask the system to restart.
    pub fn request_restart(&mut self) {
        if self.restart_requested {
            return;
        }
        info!("restarting");
        notify(&mut self.hooks.on_restart);
        self.restart_requested = true;
        self.system.restart();
    }

    fn service_channels(&mut self) {
        let events = self.improv.as_mut().map(ImprovAdapter::poll).unwrap_or_default();
        for event in events {
            self.handle_improv(event);
        }
        self.drain_config_events();
    }

    fn handle_improv(&mut self, event: ImprovEvent) {
        match event {
            ImprovEvent::CredentialsReceived { ssid, password } => {
                self.receive_credentials(&Credentials { ssid, password });
            }
            ImprovEvent::IdentifyRequested => {
                debug!("improv identify");
                notify(&mut self.hooks.on_identify);
                let state = self.improv_state();
                let url = self.device_url();
                if let Some(improv) = self.improv.as_mut() {
                    improv.send_state(state);
                    if let Some(url) = &url {
                        improv.send_result(command::IDENTIFY, &[url.as_str()]);
                    }
                }
            }
            ImprovEvent::ScanRequested => {
                let networks = self.radio.scan();
                debug!(count = networks.len(), "improv scan");
                if let Some(improv) = self.improv.as_mut() {
                    improv.send_networks(&networks);
                }
            }
        }
    }

    /// Persist credentials from the serial channel and restart into them.
    fn receive_credentials(&mut self, received: &Credentials) {
        let rejected = if received.ssid.trim().is_empty() {
            Some("blank network name")
        } else if received.password.is_empty() && !self.config.improv.allow_open_networks {
            Some("blank network secret")
        } else {
            None
        };
        if let Some(reason) = rejected {
            let err = ProvisionError::Rejected(reason.to_string());
            warn!(error = %err, "improv credentials rejected");
            self.send_improv_error(ImprovError::InvalidRpc);
            self.fail(&err);
            return;
        }

        if let Some(improv) = self.improv.as_mut() {
            improv.send_state(ImprovState::Provisioning);
        }
        let stored = credentials::save(self.store.as_ref(), received)
            .and_then(|()| credentials::set_pending(self.store.as_ref()));
        if let Err(err) = stored {
            warn!(error = %err, "storing improv credentials failed");
            self.send_improv_error(ImprovError::Unknown);
            self.fail(&err);
            return;
        }

        info!(ssid = %received.ssid, "improv credentials stored");
        notify(&mut self.hooks.on_config_saved);
        self.request_restart();
    }

    fn drain_config_events(&mut self) {
        let pending: Vec<ConfigEvent> = match &self.config_events {
            Some(events) => events.try_iter().collect(),
            None => return,
        };

        for event in pending {
            match event {
                ConfigEvent::Saved {
                    endpoint,
                    credentials_changed,
                } => {
                    info!(endpoint = %endpoint, credentials_changed, "config saved over http");
                    notify(&mut self.hooks.on_config_saved);
                    if credentials_changed || self.state == ProvisionState::Portal {
                        self.request_restart();
                    }
                }
                ConfigEvent::WriteFailed {
                    endpoint,
                    key,
                    reason,
                } => {
                    warn!(endpoint = %endpoint, key = %key, "config write failed");
                    let err = ProvisionError::persistence(&key, StoreError::Unavailable(reason));
                    self.fail(&err);
                }
            }
        }
    }

    /// Emit the deferred success report if a serial write preceded this join.
    fn report_pending(&mut self) {
        match credentials::take_pending(self.store.as_ref()) {
            Ok(false) => {}
            Ok(true) => {
                let url = self.device_url();
                match self.improv.as_mut() {
                    Some(improv) => improv.report_provisioned(url.as_deref()),
                    None => warn!("pending provisioning cleared without a serial channel"),
                }
            }
            Err(err) => {
                warn!(error = %err, "clearing pending marker failed");
                self.fail(&err);
            }
        }
    }

    fn improv_state(&self) -> ImprovState {
        if self.state == ProvisionState::Connected {
            ImprovState::Provisioned
        } else {
            ImprovState::Authorized
        }
    }

    fn device_url(&self) -> Option<String> {
        if self.state != ProvisionState::Connected {
            return None;
        }
        if !self.config.improv.device_url.is_empty() {
            return Some(self.config.improv.device_url.clone());
        }
        self.radio.station_ip().map(|ip| format!("http://{ip}/"))
    }

    fn send_improv_error(&mut self, error: ImprovError) {
        if let Some(improv) = self.improv.as_mut() {
            improv.send_error(error);
        }
    }

    fn fail(&mut self, err: &ProvisionError) {
        if let Some(hook) = &mut self.hooks.on_failure {
            hook(err);
        }
    }

    fn set_state(&mut self, state: ProvisionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state change");
            self.state = state;
        }
    }

    fn exit_requested(&self) -> Option<LoopExit> {
        if self.restart_requested {
            Some(LoopExit::Restart)
        } else if self.shutdown.is_shutdown() {
            Some(LoopExit::Shutdown)
        } else {
            None
        }
    }
}

fn notify(hook: &mut Hook) {
    if let Some(hook) = hook {
        hook();
    }
}

/// Random access point password over [`PASSWORD_ALPHABET`].
pub fn generate_password(rng: &mut impl Rng) -> String {
    (0..PASSWORD_LEN)
        .map(|_| PASSWORD_ALPHABET[rng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::improv::frame::{self, rpc_result};
    use crate::io::credentials::{PASSWORD_KEY, PENDING_KEY, SSID_KEY};
    use crate::io::radio::JoinStatus;
    use crate::io::store::ByteStore;
    use crate::registry::MAIN_ENDPOINT;
    use crate::surface::ConfigSurface;
    use crate::test_support::{HookLog, TestDevice};

    fn config() -> DeviceConfig {
        DeviceConfig::default()
    }

    fn provisioned(device: &TestDevice) {
        device.store.put(SSID_KEY, b"home").expect("ssid");
        device.store.put(PASSWORD_KEY, b"hunter22").expect("password");
    }

    #[test]
    fn first_contact_enters_portal_without_joining() {
        let device = TestDevice::new();
        let mut provisioner = device.provisioner(config());
        device.shutdown_after_ticks(&provisioner, 5);

        let outcome = provisioner.connect(true, 30).expect("connect");

        assert_eq!(outcome, ConnectOutcome::Portal(LoopExit::Shutdown));
        assert_eq!(provisioner.state(), ProvisionState::Portal);
        assert!(device.radio.join_requests().is_empty());
        assert_eq!(device.radio.mode_now(), RadioMode::AccessPoint);
        assert_eq!(device.dns.started(), Some(device.radio.ap_ip()));
        assert_eq!(device.server.starts(), [(device.radio.ap_ip(), true)]);
    }

    #[test]
    fn join_succeeds_after_polling() {
        let device = TestDevice::new();
        provisioned(&device);
        device.radio.join_after_polls(3);
        let log = HookLog::default();
        let mut provisioner = device.provisioner(config());
        log.attach(&mut provisioner);

        let outcome = provisioner.connect(true, 30).expect("connect");

        assert_eq!(outcome, ConnectOutcome::Connected);
        assert_eq!(provisioner.state(), ProvisionState::Connected);
        assert_eq!(device.radio.join_requests(), [("home".to_string(), "hunter22".to_string())]);
        assert_eq!(device.radio.hostname(), format!("esp32-{}", device.system.suffix()));
        assert!(device.radio.auto_reconnect_disabled());
        assert_eq!(log.entries(), ["connect", "success"]);
        assert_eq!(device.server.starts(), [(device.radio.station(), false)]);
    }

    #[test]
    fn timeout_without_fallback_returns_error() {
        let device = TestDevice::new();
        provisioned(&device);
        let log = HookLog::default();
        let mut provisioner = device.provisioner(config());
        log.attach(&mut provisioner);

        let err = provisioner.connect(false, 1).expect_err("timeout");

        let ProvisionError::ConnectTimeout { ssid, waited } = &err else {
            panic!("expected timeout, got {err:?}");
        };
        assert_eq!(ssid, "home");
        assert!(*waited > Duration::from_secs(1));
        assert!(*waited <= Duration::from_secs(1) + Duration::from_millis(100));
        assert_eq!(provisioner.state(), ProvisionState::Idle);
        assert_eq!(log.entries(), ["connect", "failure"]);
    }

    #[test]
    fn timeout_with_fallback_enters_portal() {
        let device = TestDevice::new();
        provisioned(&device);
        let mut provisioner = device.provisioner(config());
        device.shutdown_after_ticks(&provisioner, 3);

        let outcome = provisioner.connect(true, 1).expect("connect");

        assert_eq!(outcome, ConnectOutcome::Portal(LoopExit::Shutdown));
        assert_eq!(device.radio.mode_now(), RadioMode::AccessPoint);
    }

    #[test]
    fn wait_hook_drives_poll_delay() {
        let device = TestDevice::new();
        provisioned(&device);
        let mut provisioner = device.provisioner(config());
        provisioner.hooks.on_wait_loop = Some(Box::new(|| Duration::from_millis(250)));

        provisioner.connect(false, 1).expect_err("timeout");

        // 250 ms steps: the budget is exceeded after the fifth sleep.
        assert_eq!(device.radio.status_polls(), 5);
    }

    #[test]
    fn stalled_join_is_reissued_after_a_minute() {
        let device = TestDevice::new();
        provisioned(&device);
        let mut provisioner = device.provisioner(config());

        provisioner.connect(false, 130).expect_err("timeout");

        assert_eq!(device.radio.join_requests().len(), 3);
    }

    #[test]
    fn short_budget_never_rejoins() {
        let device = TestDevice::new();
        provisioned(&device);
        let mut provisioner = device.provisioner(config());

        provisioner.connect(false, 59).expect_err("timeout");

        assert_eq!(device.radio.join_requests().len(), 1);
    }

    #[test]
    fn pending_marker_reports_success_once() {
        let device = TestDevice::new();
        provisioned(&device);
        device.store.put(PENDING_KEY, b"1").expect("marker");
        device.radio.join_after_polls(1);
        let mut provisioner = device.provisioner(config());
        provisioner.begin_serial_improv(Box::new(device.serial.clone()));
        device.serial.clear_written();

        provisioner.connect(false, 30).expect("connect");

        assert_eq!(device.store.get(PENDING_KEY).expect("get"), None);
        let url = format!("http://{}/", device.radio.station());
        assert_eq!(
            device.serial.written_frames(),
            [
                frame::state_frame(ImprovState::Provisioned),
                rpc_result(command::WIFI_SETTINGS, &[url.as_str()])
            ]
        );

        device.serial.clear_written();
        provisioner.connect(false, 30).expect("connect again");
        assert!(device.serial.written_frames().is_empty());
    }

    #[test]
    fn pending_marker_survives_failed_join() {
        let device = TestDevice::new();
        provisioned(&device);
        device.store.put(PENDING_KEY, b"1").expect("marker");
        let mut provisioner = device.provisioner(config());
        provisioner.begin_serial_improv(Box::new(device.serial.clone()));
        device.serial.clear_written();

        provisioner.connect(false, 1).expect_err("timeout");

        assert_eq!(device.store.get(PENDING_KEY).expect("get"), Some(b"1".to_vec()));
        assert_eq!(
            device.serial.written_frames(),
            [frame::error_frame(ImprovError::UnableToConnect)]
        );
    }

    #[test]
    fn improv_credentials_persist_mark_and_restart() {
        let device = TestDevice::new();
        let log = HookLog::default();
        let mut provisioner = device.provisioner(config());
        log.attach(&mut provisioner);
        provisioner.begin_serial_improv(Box::new(device.serial.clone()));
        device.serial.clear_written();
        device.serial.feed_credentials("home", "hunter22");

        assert_eq!(provisioner.service(), Some(LoopExit::Restart));

        assert_eq!(device.store.get(SSID_KEY).expect("get"), Some(b"home".to_vec()));
        assert_eq!(device.store.get(PENDING_KEY).expect("get"), Some(b"1".to_vec()));
        assert_eq!(log.entries(), ["config_saved", "restart"]);
        assert_eq!(device.system.restarts(), 1);
        assert_eq!(
            device.serial.written_frames(),
            [frame::state_frame(ImprovState::Provisioning)]
        );
    }

    #[test]
    fn improv_persistence_failure_reports_without_restart() {
        let device = TestDevice::new();
        device.store.fail_key(SSID_KEY);
        let log = HookLog::default();
        let mut provisioner = device.provisioner(config());
        log.attach(&mut provisioner);
        provisioner.begin_serial_improv(Box::new(device.serial.clone()));
        device.serial.clear_written();
        device.serial.feed_credentials("home", "hunter22");

        assert_eq!(provisioner.service(), None);

        assert_eq!(log.entries(), ["failure"]);
        assert_eq!(device.system.restarts(), 0);
        assert!(!credentials::has_pending(device.store.as_ref()));
        assert_eq!(
            device.serial.written_frames().last(),
            Some(&frame::error_frame(ImprovError::Unknown))
        );
    }

    #[test]
    fn blank_secret_is_rejected_over_serial() {
        let device = TestDevice::new();
        let mut provisioner = device.provisioner(config());
        provisioner.begin_serial_improv(Box::new(device.serial.clone()));
        device.serial.clear_written();
        device.serial.feed_credentials("home", "");

        assert_eq!(provisioner.service(), None);
        assert_eq!(
            device.serial.written_frames(),
            [frame::error_frame(ImprovError::InvalidRpc)]
        );
        assert_eq!(device.store.get(SSID_KEY).expect("get"), None);

        let mut open = config();
        open.improv.allow_open_networks = true;
        let mut provisioner = device.provisioner(open);
        provisioner.begin_serial_improv(Box::new(device.serial.clone()));
        device.serial.feed_credentials("cafe", "");
        assert_eq!(provisioner.service(), Some(LoopExit::Restart));
    }

    #[test]
    fn identify_runs_hook_and_reports_state() {
        let device = TestDevice::new();
        let log = HookLog::default();
        let mut provisioner = device.provisioner(config());
        log.attach(&mut provisioner);
        provisioner.begin_serial_improv(Box::new(device.serial.clone()));
        device.serial.clear_written();
        device.serial.feed_rpc(command::IDENTIFY, &[]);

        assert_eq!(provisioner.service(), None);
        assert_eq!(log.entries(), ["identify"]);
        assert_eq!(
            device.serial.written_frames(),
            [frame::state_frame(ImprovState::Authorized)]
        );
    }

    #[test]
    fn http_credential_change_restarts() {
        let device = TestDevice::new();
        let (tx, rx) = mpsc::channel();
        let mut provisioner = device.provisioner(config());
        provisioner.watch_config(rx);

        tx.send(ConfigEvent::Saved {
            endpoint: "main".into(),
            credentials_changed: false,
        })
        .expect("send");
        assert_eq!(provisioner.service(), None);

        tx.send(ConfigEvent::Saved {
            endpoint: "main".into(),
            credentials_changed: true,
        })
        .expect("send");
        assert_eq!(provisioner.service(), Some(LoopExit::Restart));
        assert_eq!(device.system.restarts(), 1);
    }

    #[test]
    fn any_save_in_portal_restarts() {
        let device = TestDevice::new();
        let (tx, rx) = mpsc::channel();
        let mut provisioner = device.provisioner(config());
        provisioner.watch_config(rx);
        tx.send(ConfigEvent::Saved {
            endpoint: "extras".into(),
            credentials_changed: false,
        })
        .expect("send");

        assert_eq!(provisioner.portal(), LoopExit::Restart);
    }

    #[test]
    fn write_failure_event_runs_failure_hook() {
        let device = TestDevice::new();
        let (tx, rx) = mpsc::channel();
        let log = HookLog::default();
        let mut provisioner = device.provisioner(config());
        log.attach(&mut provisioner);
        provisioner.watch_config(rx);
        tx.send(ConfigEvent::WriteFailed {
            endpoint: "main".into(),
            key: "mqtt_port".into(),
            reason: "disk full".into(),
        })
        .expect("send");

        assert_eq!(provisioner.service(), None);
        assert_eq!(log.entries(), ["failure"]);
    }

    #[test]
    fn portal_heartbeat_hook_sets_its_own_interval() {
        let device = TestDevice::new();
        let mut provisioner = device.provisioner(config());
        let beats = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = beats.clone();
        provisioner.hooks.on_portal_wait_loop = Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Duration::from_millis(100)
        }));
        device.shutdown_after_ticks(&provisioner, 350);

        assert_eq!(provisioner.portal(), LoopExit::Shutdown);
        // First beat after 1 ms, then one per elapsed 100 ms.
        let beats = beats.load(Ordering::SeqCst);
        assert!((3..=4).contains(&beats), "beats = {beats}");
        assert!(device.system.watchdog_feeds() >= 300);
    }

    #[test]
    fn secure_portal_generates_and_stores_password() {
        let device = TestDevice::new();
        let mut cfg = config();
        cfg.portal.secure = true;
        let mut registry = device.registry();
        let mut provisioner = device.provisioner(cfg);

        provisioner.begin(&mut registry).expect("begin");

        let password = provisioner.portal_password().expect("password").to_string();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert_eq!(
            device.store.get(PORTAL_PASSWORD_KEY).expect("get"),
            Some(password.clone().into_bytes())
        );
        assert!(registry.find(PORTAL_SECURE_KEY).is_some());

        let surface = ConfigSurface::new(registry);
        let body = surface.read(MAIN_ENDPOINT).expect("read");
        assert!(!body.contains(&password), "{body}");
        assert!(body.contains(r#""portal-password":"********""#), "{body}");

        device.shutdown_after_ticks(&provisioner, 2);
        provisioner.portal();
        assert_eq!(device.radio.access_point(), Some((provisioner.hostname().to_string(), Some(password))));
    }

    #[test]
    fn open_portal_by_default() {
        let device = TestDevice::new();
        let mut registry = device.registry();
        let mut provisioner = device.provisioner(config());
        provisioner.begin(&mut registry).expect("begin");
        assert_eq!(provisioner.portal_password(), None);
        assert!(registry.endpoints().is_empty());
    }

    #[test]
    fn join_status_is_polled_until_joined() {
        let device = TestDevice::new();
        provisioned(&device);
        device.radio.set_begin_status(JoinStatus::Joined);
        let mut provisioner = device.provisioner(config());
        assert_eq!(provisioner.connect(false, 0).expect("connect"), ConnectOutcome::Connected);
        assert_eq!(device.radio.status_polls(), 0);
    }

    #[test]
    fn generated_passwords_use_unambiguous_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        let password = generate_password(&mut rng);
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.bytes().all(|b| PASSWORD_ALPHABET.contains(&b)));
        assert!(!password.contains(['0', 'O', 'l', '1', 'I']));
    }
}
