//! Multi-boot provisioning scenarios.
//!
//! Each "boot" builds a fresh registry, surface and provisioner over the same
//! store, the way a restarted device would, and drives it with scripted
//! hardware fakes.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use provision::improv::frame::{ImprovState, command, rpc_result, state_frame};
use provision::io::config::DeviceConfig;
use provision::io::credentials::{self, PASSWORD_KEY, PENDING_KEY, SSID_KEY};
use provision::io::store::{ByteStore, DirStore, SharedStore};
use provision::provisioner::{ConnectOutcome, LoopExit, Peripherals, ProvisionState, Provisioner};
use provision::registry::Registry;
use provision::surface::ConfigSurface;
use provision::test_support::{HookLog, TestDevice};

const CONFIG: &str = r#"
hostname = "sensor-"

[[endpoints]]
name = "main"

[[endpoints.params]]
kind = "string"
name = "mqtt_server"
init = "mqtt.example.com"
"#;

fn config() -> DeviceConfig {
    toml::from_str(CONFIG).expect("config")
}

/// Declare parameters and wire the surface's events into the provisioner.
fn boot(
    device: &TestDevice,
    store: SharedStore,
    cfg: &DeviceConfig,
) -> (ConfigSurface, Provisioner) {
    let mut registry = Registry::new(store.clone());
    cfg.declare_parameters(&mut registry).expect("declare");
    let (tx, rx) = mpsc::channel();
    let mut provisioner = Provisioner::new(
        cfg.clone(),
        store,
        Peripherals {
            radio: Box::new(device.radio.clone()),
            clock: Box::new(device.clock.clone()),
            system: Box::new(device.system.clone()),
            dns: Box::new(device.dns.clone()),
            server: Box::new(device.server.clone()),
        },
    );
    provisioner.begin(&mut registry).expect("begin");
    provisioner.watch_config(rx);
    (ConfigSurface::new(registry).with_events(tx), provisioner)
}

fn form(fields: &[(&str, &str)]) -> BTreeMap<String, String> {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// First contact over HTTP, then a clean join on the next boot.
#[test]
fn portal_credentials_lead_to_a_join() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store: SharedStore = Arc::new(DirStore::open(temp.path()).expect("store"));
    let device = TestDevice::new();
    device.radio.join_after_polls(2);
    let cfg = config();

    // Boot 1: nothing stored, portal opens; a client submits credentials.
    let (surface, mut provisioner) = boot(&device, store.clone(), &cfg);
    let surface = Arc::new(Mutex::new(surface));
    let client = surface.clone();
    provisioner.hooks.on_portal = Some(Box::new(move || {
        let fields = form(&[
            (SSID_KEY, "home"),
            (PASSWORD_KEY, "hunter22"),
            ("mqtt_server", "broker.lan"),
        ]);
        client.lock().expect("surface").write("main", &fields).expect("write");
    }));
    let outcome = provisioner.connect(true, 30).expect("connect");
    assert_eq!(outcome, ConnectOutcome::Portal(LoopExit::Restart));
    assert!(device.radio.join_requests().is_empty());
    assert_eq!(device.system.restarts(), 1);
    assert!(temp.path().join(SSID_KEY).exists());
    drop(surface);

    // Boot 2: the stored network is joined and nothing is reported on serial.
    let (surface, mut provisioner) = boot(&device, store.clone(), &cfg);
    provisioner.begin_serial_improv(Box::new(device.serial.clone()));
    device.serial.clear_written();
    assert_eq!(provisioner.connect(true, 30).expect("connect"), ConnectOutcome::Connected);
    assert_eq!(provisioner.state(), ProvisionState::Connected);
    assert_eq!(device.radio.join_requests(), [("home".to_string(), "hunter22".to_string())]);
    assert!(device.serial.written_frames().is_empty());

    let body: serde_json::Value =
        serde_json::from_str(&surface.read("main").expect("read")).expect("json");
    assert_eq!(body["values"]["mqtt_server"], "broker.lan");
    assert_eq!(body["values"][PASSWORD_KEY], "********");
}

/// Serial provisioning: credentials, restart, then the deferred success report.
#[test]
fn improv_provisioning_reports_after_restart() {
    let device = TestDevice::new();
    let store: SharedStore = device.store.clone();
    let cfg = config();
    let log = HookLog::default();

    // Boot 1: no credentials and no portal fallback; the host sends them over serial.
    let (_surface, mut provisioner) = boot(&device, store.clone(), &cfg);
    log.attach(&mut provisioner);
    provisioner.begin_serial_improv(Box::new(device.serial.clone()));
    device.serial.feed_credentials("home", "hunter22");
    assert_eq!(provisioner.run_service_loop(), LoopExit::Restart);
    assert!(credentials::has_pending(store.as_ref()));
    assert_eq!(log.entries(), ["config_saved", "restart"]);

    // Boot 2: the join succeeds and the report goes out exactly once.
    device.radio.join_after_polls(1);
    device.serial.clear_written();
    let (_surface, mut provisioner) = boot(&device, store.clone(), &cfg);
    provisioner.begin_serial_improv(Box::new(device.serial.clone()));
    assert_eq!(provisioner.connect(false, 10).expect("connect"), ConnectOutcome::Connected);

    let url = format!("http://{}/", device.radio.station());
    assert_eq!(
        device.serial.written_frames(),
        [
            state_frame(ImprovState::Authorized),
            state_frame(ImprovState::Provisioned),
            rpc_result(command::WIFI_SETTINGS, &[url.as_str()])
        ]
    );
    assert_eq!(device.store.get(PENDING_KEY).expect("get"), None);

    // Boot 3: nothing pending, nothing reported.
    device.serial.clear_written();
    let (_surface, mut provisioner) = boot(&device, store, &cfg);
    provisioner.begin_serial_improv(Box::new(device.serial.clone()));
    provisioner.connect(false, 10).expect("connect");
    assert_eq!(
        device.serial.written_frames(),
        [state_frame(ImprovState::Authorized)]
    );
}

/// A failed join without fallback stays reachable over serial.
#[test]
fn failed_join_keeps_serial_channel_alive() {
    let device = TestDevice::new();
    device.store.put(SSID_KEY, b"gone").expect("ssid");
    device.store.put(PASSWORD_KEY, b"hunter22").expect("password");
    let cfg = config();

    let (_surface, mut provisioner) = boot(&device, device.store.clone(), &cfg);
    provisioner.begin_serial_improv(Box::new(device.serial.clone()));
    provisioner.connect(false, 1).expect_err("timeout");
    assert_eq!(provisioner.state(), ProvisionState::Idle);

    device.serial.feed_credentials("home", "hunter22");
    assert_eq!(provisioner.service(), Some(LoopExit::Restart));
    assert_eq!(device.store.get(SSID_KEY).expect("get"), Some(b"home".to_vec()));
}

/// HTTP edits that do not touch credentials keep a connected device running.
#[test]
fn connected_device_restarts_only_for_credential_edits() {
    let device = TestDevice::new();
    device.store.put(SSID_KEY, b"home").expect("ssid");
    device.store.put(PASSWORD_KEY, b"hunter22").expect("password");
    device.radio.join_after_polls(1);
    let cfg = config();

    let (mut surface, mut provisioner) = boot(&device, device.store.clone(), &cfg);
    provisioner.connect(false, 5).expect("connect");

    surface
        .write(
            "main",
            &form(&[(SSID_KEY, "home"), (PASSWORD_KEY, "********"), ("mqtt_server", "b")]),
        )
        .expect("write");
    assert_eq!(provisioner.service(), None);

    surface
        .write("main", &form(&[(SSID_KEY, "office"), ("mqtt_server", "b")]))
        .expect("write");
    assert_eq!(provisioner.service(), Some(LoopExit::Restart));
}
