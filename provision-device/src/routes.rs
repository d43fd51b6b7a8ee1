//! HTTP transport for the configuration surface.
//!
//! Handlers decode the path and body, then hand over to [`provision::web`],
//! so the simulator answers exactly what the device does.

use std::collections::BTreeMap;

use axum::Router;
use axum::extract::{Form, FromRequest, Json, Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use provision::surface::form_from_json;
use provision::web;

use crate::state::AppState;

/// Build the device router. `app_routes` are served next to the `/wifi`
/// routes and must not overlap them.
pub fn router(state: AppState, app_routes: Router) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/wifi/scan", get(scan).fallback(fallback))
        .route("/wifi/options/{name}", get(options).fallback(fallback))
        .route(
            "/wifi/{endpoint}",
            get(read_endpoint).post(write_endpoint).fallback(fallback),
        )
        .fallback(fallback)
        .with_state(state)
        .merge(app_routes)
        .layer(cors)
}

/// GET /wifi/scan
async fn scan(State(state): State<AppState>) -> Response {
    into_response(web::scan(&state.radio.visible()))
}

/// GET /wifi/options/{name}
async fn options(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    into_response(web::options(&state.surface(), &name))
}

/// GET /wifi/{endpoint}
async fn read_endpoint(State(state): State<AppState>, Path(endpoint): Path<String>) -> Response {
    into_response(web::read_endpoint(&state.surface(), &endpoint))
}

/// POST /wifi/{endpoint}
async fn write_endpoint(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    request: Request,
) -> Response {
    let form = match read_form(request, &state).await {
        Ok(form) => form,
        Err(rejection) => return rejection,
    };
    debug!(endpoint = %endpoint, fields = form.len(), "write");
    into_response(web::write_endpoint(&mut state.surface(), &endpoint, &form))
}

/// Captive redirect or 404.
async fn fallback(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());
    let mode = state.mode();
    debug!(?host, own_host = %mode.own_host, mode.access_point, "unrouted request");
    into_response(web::fallback(host, &mode.own_host, mode.access_point))
}

/// Form fields from a urlencoded or JSON body.
async fn read_form(
    request: Request,
    state: &AppState,
) -> Result<BTreeMap<String, String>, Response> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    if is_json {
        let Json(body) = Json::<Value>::from_request(request, state)
            .await
            .map_err(IntoResponse::into_response)?;
        form_from_json(&body).map_err(|err| into_response(web::write_response(Err(err))))
    } else {
        let Form(form) = Form::<BTreeMap<String, String>>::from_request(request, state)
            .await
            .map_err(IntoResponse::into_response)?;
        Ok(form)
    }
}

fn into_response(response: web::Response) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = (
        status,
        [(header::CONTENT_TYPE, response.content_type)],
        response.body,
    )
        .into_response();
    if let Some(location) = response.location
        && let Ok(value) = HeaderValue::from_str(&location)
    {
        out.headers_mut().insert(header::LOCATION, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use provision::io::config::DeviceConfig;
    use provision::io::store::{ByteStore, DirStore, SharedStore};
    use provision::registry::Registry;
    use provision::surface::ConfigSurface;

    use super::*;
    use crate::sim::{SimConfig, SimNetwork, SimRadio};
    use crate::state::ServeMode;

    const CONFIG: &str = r#"
[[endpoints]]
name = "main"

[[endpoints.params]]
kind = "int"
name = "mqtt_port"
init = 1883

[[endpoints.params]]
kind = "dropdown"
name = "mode"
options = ["eco", "boost"]

[[endpoints]]
name = "living room"

[[endpoints.params]]
kind = "dropdown"
name = "fan mode"
options = ["low", "high"]
"#;

    async fn serve(store: SharedStore, access_point: bool) -> SocketAddr {
        serve_with(store, access_point, Router::new()).await
    }

    async fn serve_with(store: SharedStore, access_point: bool, app_routes: Router) -> SocketAddr {
        let cfg: DeviceConfig = toml::from_str(CONFIG).expect("config");
        let mut registry = Registry::new(store);
        cfg.declare_parameters(&mut registry).expect("declare");
        let sim = SimConfig {
            networks: vec![SimNetwork {
                ssid: "home".into(),
                password: "hunter22".into(),
                rssi: -42,
                secured: true,
                join_polls: 1,
            }],
            ..SimConfig::default()
        };
        let state = AppState::new(
            Arc::new(Mutex::new(ConfigSurface::new(registry))),
            SimRadio::new(Arc::new(sim)),
        );
        state.set_mode(ServeMode {
            own_host: "192.168.4.1".into(),
            access_point,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router(state, app_routes))
                .await
                .expect("serve");
        });
        addr
    }

    async fn http(addr: SocketAddr, request: String) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(request.as_bytes()).await.expect("send");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    async fn get(addr: SocketAddr, host: &str, path: &str) -> String {
        http(
            addr,
            format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"),
        )
        .await
    }

    async fn post(addr: SocketAddr, path: &str, content_type: &str, body: &str) -> String {
        http(
            addr,
            format!(
                "POST {path} HTTP/1.1\r\nHost: 192.168.4.1\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ),
        )
        .await
    }

    fn store() -> (tempfile::TempDir, Arc<DirStore>) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(DirStore::open(temp.path()).expect("store"));
        (temp, store)
    }

    #[tokio::test]
    async fn endpoint_read_and_form_write() {
        let (_temp, store) = store();
        let addr = serve(store.clone(), true).await;

        let read = get(addr, "192.168.4.1", "/wifi/main").await;
        assert!(read.starts_with("HTTP/1.1 200"), "{read}");
        assert!(read.contains(r#""mqtt_port":1883"#), "{read}");

        let write = post(
            addr,
            "/wifi/main",
            "application/x-www-form-urlencoded",
            "mqtt_port=8883&mode=1",
        )
        .await;
        assert!(write.starts_with("HTTP/1.1 200"), "{write}");
        assert_eq!(store.get("mqtt_port").expect("get"), Some(b"8883".to_vec()));
    }

    #[tokio::test]
    async fn json_bodies_are_accepted() {
        let (_temp, store) = store();
        let addr = serve(store.clone(), false).await;
        let write = post(addr, "/wifi/main", "application/json", r#"{"mqtt_port":1884}"#).await;
        assert!(write.starts_with("HTTP/1.1 200"), "{write}");
        assert_eq!(store.get("mqtt_port").expect("get"), Some(b"1884".to_vec()));

        let nested = post(addr, "/wifi/main", "application/json", r#"{"mqtt_port":[1]}"#).await;
        assert!(nested.starts_with("HTTP/1.1 400"), "{nested}");
    }

    #[tokio::test]
    async fn lookups_and_scan() {
        let (_temp, store) = store();
        let addr = serve(store, true).await;

        let options = get(addr, "192.168.4.1", "/wifi/options/mode").await;
        assert!(options.ends_with(r#"["eco","boost"]"#), "{options}");

        let missing = get(addr, "192.168.4.1", "/wifi/options/mqtt_port").await;
        assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");
        assert!(missing.ends_with(web::DROPDOWN_NOT_FOUND), "{missing}");

        let unknown = get(addr, "192.168.4.1", "/wifi/nope").await;
        assert!(unknown.ends_with(web::ENDPOINT_NOT_FOUND), "{unknown}");

        let scan = get(addr, "192.168.4.1", "/wifi/scan").await;
        assert!(scan.ends_with(r#"{"networks":{"home":-42}}"#), "{scan}");
    }

    #[tokio::test]
    async fn foreign_hosts_are_redirected_in_portal() {
        let (_temp, store) = store();
        let addr = serve(store.clone(), true).await;
        let redirect = get(addr, "connectivitycheck.gstatic.com", "/generate_204").await;
        assert!(redirect.starts_with("HTTP/1.1 302"), "{redirect}");
        assert!(
            redirect
                .to_ascii_lowercase()
                .contains("location: http://192.168.4.1/"),
            "{redirect}"
        );

        let own = get(addr, "192.168.4.1", "/").await;
        assert!(own.starts_with("HTTP/1.1 404"), "{own}");

        let station = serve(store, false).await;
        let plain = get(station, "example.com", "/").await;
        assert!(plain.starts_with("HTTP/1.1 404"), "{plain}");
    }

    #[tokio::test]
    async fn percent_encoded_names_are_decoded() {
        let (_temp, store) = store();
        let addr = serve(store.clone(), true).await;

        let options = get(addr, "192.168.4.1", "/wifi/options/fan%20mode").await;
        assert!(options.starts_with("HTTP/1.1 200"), "{options}");
        assert!(options.ends_with(r#"["low","high"]"#), "{options}");

        let read = get(addr, "192.168.4.1", "/wifi/living%20room").await;
        assert!(read.starts_with("HTTP/1.1 200"), "{read}");

        let write = post(
            addr,
            "/wifi/living%20room",
            "application/x-www-form-urlencoded",
            "fan+mode=1",
        )
        .await;
        assert!(write.starts_with("HTTP/1.1 200"), "{write}");
        assert_eq!(store.get("fan mode").expect("get"), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn other_methods_fall_through() {
        let (_temp, store) = store();
        let addr = serve(store, false).await;
        let response = post(addr, "/wifi/options/mode", "text/plain", "").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
        assert!(response.ends_with(web::NOT_FOUND), "{response}");
    }

    #[tokio::test]
    async fn application_routes_are_served() {
        let (_temp, store) = store();
        let app_routes = Router::new().route("/status", axum::routing::get(|| async { "ready" }));
        let addr = serve_with(store, true, app_routes).await;

        let status = get(addr, "192.168.4.1", "/status").await;
        assert!(status.starts_with("HTTP/1.1 200"), "{status}");
        assert!(status.ends_with("ready"), "{status}");

        let scan = get(addr, "192.168.4.1", "/wifi/scan").await;
        assert!(scan.starts_with("HTTP/1.1 200"), "{scan}");
        let captive = get(addr, "captive.apple.com", "/hotspot-detect.html").await;
        assert!(captive.starts_with("HTTP/1.1 302"), "{captive}");
    }
}
