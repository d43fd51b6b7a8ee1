//! Transport-neutral HTTP handling for the configuration surface.
//!
//! A server maps `/wifi/scan`, `/wifi/options/<name>` and `/wifi/<endpoint>`
//! onto these functions with decoded path segments. Anything else goes to
//! [`fallback`].

use std::collections::BTreeMap;

use crate::core::json::{ObjectWriter, quoted};
use crate::error::{ProvisionError, Result};
use crate::io::radio::{Network, strongest_networks};
use crate::surface::ConfigSurface;

pub const ENDPOINT_NOT_FOUND: &str = "Endpoint not found";
pub const DROPDOWN_NOT_FOUND: &str = "Dropdown not found";
pub const WRITE_FAILED: &str = "Error writing to flash filesystem";
pub const NOT_FOUND: &str = "404";

const JSON: &str = "application/json";
const TEXT: &str = "text/plain";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    /// Set on redirects.
    pub location: Option<String>,
}

impl Response {
    fn json(body: String) -> Self {
        Self {
            status: 200,
            content_type: JSON,
            body,
            location: None,
        }
    }

    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: TEXT,
            body: body.to_string(),
            location: None,
        }
    }

    fn redirect(location: String) -> Self {
        Self {
            status: 302,
            content_type: TEXT,
            body: String::new(),
            location: Some(location),
        }
    }
}

/// `GET /wifi/<endpoint>`
pub fn read_endpoint(surface: &ConfigSurface, endpoint: &str) -> Response {
    match surface.read(endpoint) {
        Ok(body) => Response::json(body),
        Err(_) => Response::text(404, ENDPOINT_NOT_FOUND),
    }
}

/// `POST /wifi/<endpoint>` with form fields.
pub fn write_endpoint(
    surface: &mut ConfigSurface,
    endpoint: &str,
    form: &BTreeMap<String, String>,
) -> Response {
    write_response(surface.write(endpoint, form))
}

/// Map the outcome of a surface write onto a response.
pub fn write_response(result: Result<()>) -> Response {
    match result {
        Ok(()) => Response::text(200, ""),
        Err(ProvisionError::NotFound { .. }) => Response::text(404, ENDPOINT_NOT_FOUND),
        Err(ProvisionError::Rejected(reason)) => Response::text(400, &reason),
        Err(ProvisionError::Persistence { .. } | ProvisionError::ConnectTimeout { .. }) => {
            Response::text(500, WRITE_FAILED)
        }
    }
}

/// `GET /wifi/options/<name>`
pub fn options(surface: &ConfigSurface, name: &str) -> Response {
    match surface.options(name) {
        Ok(options) => Response::json(options_json(options)),
        Err(_) => Response::text(404, DROPDOWN_NOT_FOUND),
    }
}

/// `GET /wifi/scan`
pub fn scan(networks: &[Network]) -> Response {
    Response::json(scan_json(networks))
}

/// Anything else: a captive redirect in access point mode when the request
/// was addressed to another host, otherwise 404.
///
/// `own_host` is the authority clients use for the device, with a port when
/// it is not 80. Ports are ignored when comparing hosts.
pub fn fallback(host: Option<&str>, own_host: &str, access_point: bool) -> Response {
    match host {
        Some(host) if access_point && !same_host(host, own_host) => {
            Response::redirect(format!("http://{own_host}/"))
        }
        _ => Response::text(404, NOT_FOUND),
    }
}

fn same_host(a: &str, b: &str) -> bool {
    host_name(a).eq_ignore_ascii_case(host_name(b))
}

/// Host part of an authority, without any `:port`.
fn host_name(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split_once(']').map_or(authority, |(ip, _)| ip);
    }
    match authority.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => authority,
    }
}

pub fn options_json(options: &[String]) -> String {
    let items: Vec<String> = options.iter().map(|option| quoted(option)).collect();
    format!("[{}]", items.join(","))
}

/// `{"networks":{"<ssid>":<rssi>,..}}`, strongest signal per SSID.
pub fn scan_json(networks: &[Network]) -> String {
    let mut by_ssid = ObjectWriter::new();
    for (ssid, network) in strongest_networks(networks) {
        by_ssid.member(&ssid, &network.rssi.to_string());
    }
    let mut body = ObjectWriter::new();
    body.member("networks", &by_ssid.finish());
    body.finish()
}
