use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        CONNECT_TIMEOUT_SECS, HANDSHAKE_GRACE_MS, HANDSHAKE_TIMEOUT_SECS, MAX_RESPONSE_BYTES,
        RESPONSE_TIMEOUT_SECS,
    },
    http::ChunkedBody,
    tls::TlsOptions,
};

/// Bounds on every suspension point of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelTimeouts {
    /// TCP connect toward the router
    pub connect: Duration,

    /// Silence after the route packet that is taken as acceptance
    pub handshake_grace: Duration,

    /// Upper bound for the whole route handshake
    pub handshake: Duration,

    /// One request/response exchange, from first write to last byte
    pub response: Duration,
}

impl Default for TunnelTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            handshake_grace: Duration::from_millis(HANDSHAKE_GRACE_MS),
            handshake: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            response: Duration::from_secs(RESPONSE_TIMEOUT_SECS),
        }
    }
}

/// What to do with a route descriptor naming more than one router
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiHopPolicy {
    /// Fail with `UnsupportedRoute`
    #[default]
    Reject,
    /// Connect to the first router and ignore the rest of the chain
    FirstHopOnly,
}

/// Per-tunnel settings
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub timeouts: TunnelTimeouts,
    pub multi_hop: MultiHopPolicy,
    pub chunked_body: ChunkedBody,
    /// Largest response accepted, headers included
    pub max_response_bytes: usize,
    pub tls: TlsOptions,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            timeouts: TunnelTimeouts::default(),
            multi_hop: MultiHopPolicy::default(),
            chunked_body: ChunkedBody::default(),
            max_response_bytes: MAX_RESPONSE_BYTES,
            tls: TlsOptions::default(),
        }
    }
}

impl TunnelOptions {
    pub fn with_timeouts(mut self, timeouts: TunnelTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_multi_hop(mut self, policy: MultiHopPolicy) -> Self {
        self.multi_hop = policy;
        self
    }

    pub fn with_chunked_body(mut self, chunked_body: ChunkedBody) -> Self {
        self.chunked_body = chunked_body;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = TunnelTimeouts::default();
        assert_eq!(timeouts.connect, Duration::from_secs(30));
        assert_eq!(timeouts.handshake_grace, Duration::from_secs(2));
        assert_eq!(timeouts.handshake, Duration::from_secs(10));
        assert_eq!(timeouts.response, Duration::from_secs(30));
        assert!(timeouts.handshake_grace < timeouts.handshake);
    }

    #[test]
    fn test_default_options() {
        let options = TunnelOptions::default();
        assert_eq!(options.multi_hop, MultiHopPolicy::Reject);
        assert_eq!(options.chunked_body, ChunkedBody::Decode);
        assert_eq!(options.max_response_bytes, MAX_RESPONSE_BYTES);
        assert!(options.tls.extra_roots.is_empty());
    }

    #[test]
    fn test_timeouts_serde() {
        let timeouts = TunnelTimeouts {
            response: Duration::from_millis(1500),
            ..Default::default()
        };

        let json = serde_json::to_string(&timeouts).unwrap();
        let back: TunnelTimeouts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, timeouts);

        let policy: MultiHopPolicy = serde_json::from_str("\"FirstHopOnly\"").unwrap();
        assert_eq!(policy, MultiHopPolicy::FirstHopOnly);
    }
}
