//! HTTP/1.1 through a SAP-router style route tunnel
//!
//! The crate parses route descriptors (`/H/<host>/S/<port>`), runs the
//! binary route handshake against the router and then relays HTTP/1.1
//! requests to the destination over the established tunnel.

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod route;
pub mod tls;
pub mod utils;
pub mod validation;


// Re-export commonly used types for convenience
pub use config::{MultiHopPolicy, TunnelOptions, TunnelTimeouts};
pub use connection::{CancelHandle, TunnelConnection, TunnelState, TunnelTarget};
pub use error::{ConnectFailure, Phase, Result, TunnelError};
pub use http::{ChunkedBody, HttpRequestSpec, HttpResponse};
pub use lifecycle::{TunnelSession, perform_tunneled_request};
pub use route::{RouteDescriptor, RouteHop, RouteReply};
pub use tls::TlsOptions;
