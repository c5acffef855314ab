use tracing::info;

use crate::{
    config::TunnelOptions,
    connection::{CancelHandle, TunnelConnection, TunnelState, TunnelTarget},
    error::Result,
    http::{HttpRequestSpec, HttpResponse},
    route::RouteDescriptor,
};

/// Run a single request through a fresh tunnel
///
/// Parses `route`, connects, sends `request` and closes the tunnel again,
/// whatever the outcome. A bad descriptor fails before any I/O.
pub async fn perform_tunneled_request(
    route: &str,
    target: TunnelTarget,
    request: &HttpRequestSpec,
    options: TunnelOptions,
) -> Result<HttpResponse> {
    let route = RouteDescriptor::parse(route)?;
    let mut tunnel = TunnelConnection::new(route, target, options)?;

    let result = match tunnel.connect().await {
        Ok(()) => tunnel.send_request(request).await,
        Err(e) => Err(e),
    };

    tunnel.close();
    result
}

/// Long-lived tunnel for a sequence of requests
///
/// Requests take `&mut self`, so only one is in flight at a time; they all
/// share the route handshake done in `open`.
#[derive(Debug)]
pub struct TunnelSession {
    tunnel: TunnelConnection,
    requests: u64,
}

impl TunnelSession {
    pub async fn open(route: &str, target: TunnelTarget, options: TunnelOptions) -> Result<Self> {
        let route = RouteDescriptor::parse(route)?;
        let mut tunnel = TunnelConnection::new(route, target, options)?;
        tunnel.connect().await?;

        Ok(Self {
            tunnel,
            requests: 0,
        })
    }

    pub async fn request(&mut self, request: &HttpRequestSpec) -> Result<HttpResponse> {
        self.requests += 1;
        self.tunnel.send_request(request).await
    }

    pub fn is_open(&self) -> bool {
        self.tunnel.is_open()
    }

    pub fn state(&self) -> TunnelState {
        self.tunnel.state()
    }

    pub fn tunnel_id(&self) -> &str {
        self.tunnel.id()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.tunnel.cancel_handle()
    }

    /// Number of requests issued, failed ones included
    pub fn request_count(&self) -> u64 {
        self.requests
    }

    pub fn close(mut self) {
        info!(
            "Closing session {} after {} request(s)",
            self.tunnel.id(),
            self.requests
        );
        self.tunnel.close();
    }
}
