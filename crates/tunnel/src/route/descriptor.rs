use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::{
    constants::DEFAULT_ROUTER_PORT,
    error::{Result, TunnelError},
    validation::validate_host,
};

/// One `/H/<host>[/S/<port>]` hop of a route descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteHop {
    pub host: String,
    pub port: u16,
}

/// Router address parsed from a route descriptor such as `/H/saprouter/S/3299`
///
/// The first hop is the router the tunnel connects to. Any later hops are
/// kept so callers can tell a multi-hop descriptor apart from a single hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDescriptor {
    router_host: String,
    router_port: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    further_hops: Vec<RouteHop>,
}

impl RouteDescriptor {
    /// Parse a route descriptor
    ///
    /// # Examples
    ///
    /// ```
    /// use router_tunnel::RouteDescriptor;
    ///
    /// let route = RouteDescriptor::parse("/H/203.0.113.9/S/3298").unwrap();
    /// assert_eq!(route.router_host(), "203.0.113.9");
    /// assert_eq!(route.router_port(), 3298);
    ///
    /// let route = RouteDescriptor::parse("/H/saprouter.example.com").unwrap();
    /// assert_eq!(route.router_port(), 3299);
    /// ```
    pub fn parse(descriptor: &str) -> Result<Self> {
        let mut hops: Vec<RouteHop> = Vec::new();
        // Only the first S after an H names that hop's port
        let mut port_pending = false;
        let mut segments = descriptor.split('/').filter(|s| !s.is_empty());

        while let Some(tag) = segments.next() {
            if tag.eq_ignore_ascii_case("H") {
                let host = segments
                    .next()
                    .ok_or_else(|| invalid(descriptor, "H segment without a host"))?;
                validate_host(host).map_err(|e| invalid(descriptor, e))?;
                hops.push(RouteHop {
                    host: host.to_string(),
                    port: DEFAULT_ROUTER_PORT,
                });
                port_pending = true;
            } else if tag.eq_ignore_ascii_case("S") {
                let value = segments
                    .next()
                    .ok_or_else(|| invalid(descriptor, "S segment without a port"))?;
                let port = parse_port(value).ok_or_else(|| {
                    invalid(descriptor, format!("port must be 1-65535, got {:?}", value))
                })?;
                if port_pending {
                    if let Some(hop) = hops.last_mut() {
                        hop.port = port;
                    }
                    port_pending = false;
                }
            } else if tag.eq_ignore_ascii_case("W") || tag.eq_ignore_ascii_case("P") {
                // Password / protocol values are not used for the socket and never logged
                segments.next();
            }
        }

        let mut hops = hops.into_iter();
        let first = hops
            .next()
            .ok_or_else(|| invalid(descriptor, "no /H/ segment"))?;

        Ok(Self {
            router_host: first.host,
            router_port: first.port,
            further_hops: hops.collect(),
        })
    }

    pub fn router_host(&self) -> &str {
        &self.router_host
    }

    pub fn router_port(&self) -> u16 {
        self.router_port
    }

    /// Hops after the first router, empty for a single-hop descriptor
    pub fn further_hops(&self) -> &[RouteHop] {
        &self.further_hops
    }

    pub fn is_multi_hop(&self) -> bool {
        !self.further_hops.is_empty()
    }

    /// `host:port` of the router the socket connects to
    pub fn router_addr(&self) -> String {
        format!("{}:{}", self.router_host, self.router_port)
    }
}

impl FromStr for RouteDescriptor {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for RouteDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/H/{}/S/{}", self.router_host, self.router_port)?;
        for hop in &self.further_hops {
            write!(f, "/H/{}/S/{}", hop.host, hop.port)?;
        }
        Ok(())
    }
}

fn parse_port(value: &str) -> Option<u16> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<u16>().ok().filter(|port| *port != 0)
}

fn invalid(descriptor: &str, reason: impl fmt::Display) -> TunnelError {
    TunnelError::InvalidRouteFormat(format!(
        "{} ({})",
        descriptor.chars().take(100).collect::<String>(),
        reason
    ))
}
