//! Improv handshake over a serial line.
//!
//! The adapter turns decoded RPC frames into [`ImprovEvent`]s for the
//! provisioner and writes the protocol's replies. Requests it can answer on
//! its own (device info, malformed or unknown RPCs) never surface as events.

pub mod frame;

use tracing::{debug, info, warn};

use crate::io::radio::{Network, strongest_networks};
use crate::io::serial::SerialPort;

use self::frame::{Decoded, FrameDecoder, FrameType, ImprovError, ImprovState, Rpc, command};

/// Identity answered to the device-info RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub firmware_name: String,
    pub firmware_version: String,
    pub chip_family: String,
    pub device_name: String,
}

#[derive(Clone, PartialEq, Eq)]
pub enum ImprovEvent {
    CredentialsReceived { ssid: String, password: String },
    IdentifyRequested,
    ScanRequested,
}

impl std::fmt::Debug for ImprovEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImprovEvent::CredentialsReceived { ssid, .. } => f
                .debug_struct("CredentialsReceived")
                .field("ssid", ssid)
                .field("password", &"<redacted>")
                .finish(),
            ImprovEvent::IdentifyRequested => f.write_str("IdentifyRequested"),
            ImprovEvent::ScanRequested => f.write_str("ScanRequested"),
        }
    }
}

pub struct ImprovAdapter {
    port: Box<dyn SerialPort>,
    decoder: FrameDecoder,
    info: DeviceInfo,
    scratch: Vec<u8>,
}

impl ImprovAdapter {
    pub fn new(port: Box<dyn SerialPort>, info: DeviceInfo) -> Self {
        Self {
            port,
            decoder: FrameDecoder::new(),
            info,
            scratch: Vec::new(),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Drain the serial line and return the requests that need the provisioner.
    pub fn poll(&mut self) -> Vec<ImprovEvent> {
        self.scratch.clear();
        self.port.read_available(&mut self.scratch);
        if !self.scratch.is_empty() {
            self.decoder.push(&self.scratch);
        }

        let mut events = Vec::new();
        while let Some(decoded) = self.decoder.next_frame() {
            let frame = match decoded {
                Decoded::Frame(frame) => frame,
                Decoded::Corrupt => {
                    self.send_error(ImprovError::InvalidRpc);
                    continue;
                }
            };
            if FrameType::from_byte(frame.kind) != Some(FrameType::RpcCommand) {
                debug!(kind = frame.kind, "ignoring non-rpc improv frame");
                continue;
            }
            match frame::parse_rpc(&frame.payload) {
                Ok(Rpc::WifiSettings { ssid, password }) => {
                    info!(ssid = %ssid, "improv credentials received");
                    events.push(ImprovEvent::CredentialsReceived { ssid, password });
                }
                Ok(Rpc::Identify) => events.push(ImprovEvent::IdentifyRequested),
                Ok(Rpc::DeviceInfo) => self.send_device_info(),
                Ok(Rpc::Scan) => events.push(ImprovEvent::ScanRequested),
                Err(error) => {
                    debug!(?error, "rejecting improv rpc");
                    self.send_error(error);
                }
            }
        }
        events
    }

    pub fn send_state(&mut self, state: ImprovState) {
        debug!(?state, "improv state");
        self.write(&frame::state_frame(state));
    }

    pub fn send_error(&mut self, error: ImprovError) {
        debug!(?error, "improv error");
        self.write(&frame::error_frame(error));
    }

    pub fn send_result(&mut self, command: u8, values: &[&str]) {
        self.write(&frame::rpc_result(command, values));
    }

    pub fn send_device_info(&mut self) {
        let frame = frame::rpc_result(
            command::DEVICE_INFO,
            &[
                self.info.firmware_name.as_str(),
                self.info.firmware_version.as_str(),
                self.info.chip_family.as_str(),
                self.info.device_name.as_str(),
            ],
        );
        self.write(&frame);
    }

    /// One result per visible network, then an empty terminating result.
    pub fn send_networks(&mut self, networks: &[Network]) {
        for network in strongest_networks(networks).values() {
            let rssi = network.rssi.to_string();
            let secured = if network.secured { "YES" } else { "NO" };
            self.send_result(command::SCAN, &[network.ssid.as_str(), rssi.as_str(), secured]);
        }
        self.send_result(command::SCAN, &[]);
    }

    /// Report a completed provisioning: state, then the device URL if any.
    pub fn report_provisioned(&mut self, url: Option<&str>) {
        self.send_state(ImprovState::Provisioned);
        let values: Vec<&str> = url.into_iter().collect();
        self.send_result(command::WIFI_SETTINGS, &values);
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Err(err) = self.port.write_all(bytes) {
            warn!(error = %err, "improv serial write failed");
        }
    }
}
