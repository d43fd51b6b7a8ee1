//! [`ConfigServer`] backed by axum on the host's tokio runtime.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use axum::Router;
use tokio::runtime::Handle;
use tracing::{info, warn};

use provision::io::services::ConfigServer;

use crate::routes;
use crate::state::{AppState, ServeMode};

/// Binds once on the first start; later starts only switch the mode.
pub struct AxumServer {
    bind: SocketAddr,
    runtime: Handle,
    state: AppState,
    app_routes: Router,
    serving: bool,
}

impl AxumServer {
    /// `app_routes` are the application's own routes, served alongside the
    /// configuration surface.
    pub fn new(bind: SocketAddr, runtime: Handle, state: AppState, app_routes: Router) -> Self {
        Self {
            bind,
            runtime,
            state,
            app_routes,
            serving: false,
        }
    }
}

impl ConfigServer for AxumServer {
    fn start(&mut self, address: Ipv4Addr, access_point: bool) -> io::Result<()> {
        let own_host = match self.bind.port() {
            80 => address.to_string(),
            port => format!("{address}:{port}"),
        };
        self.state.set_mode(ServeMode {
            own_host,
            access_point,
        });
        if self.serving {
            return Ok(());
        }

        let listener = std::net::TcpListener::bind(self.bind)?;
        listener.set_nonblocking(true)?;
        let listener = {
            let _guard = self.runtime.enter();
            tokio::net::TcpListener::from_std(listener)?
        };
        let app = routes::router(self.state.clone(), self.app_routes.clone());
        self.runtime.spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(error = %err, "config server stopped");
            }
        });
        self.serving = true;
        info!(addr = %self.bind, device_ip = %address, access_point, "config server listening");
        Ok(())
    }
}
