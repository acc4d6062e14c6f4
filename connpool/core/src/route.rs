//! Route
//!
//! A `Route` names the destination a connection is bound to: origin host and
//! port, an optional proxy hop, and whether the exchange is secure. The pool
//! uses it only as a partition key, so equality and hashing are by value.
//!
//! Host names are compared case-insensitively; they are normalised to lower
//! case when the route is built. A missing port resolves to the scheme
//! default (80 for plain HTTP, 443 for secure).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default port for plain HTTP
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default port for secure HTTP
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// A proxy hop in front of the origin
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyHop {
    /// Proxy host (lower case)
    pub host: String,
    /// Proxy port
    pub port: u16,
}

/// Immutable destination key for pooled connections
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RouteSpec", into = "RouteSpec")]
pub struct Route {
    host: String,
    port: u16,
    proxy: Option<ProxyHop>,
    secure: bool,
}

impl Route {
    /// Create a route, resolving a missing port to the scheme default
    pub fn new(host: impl AsRef<str>, port: Option<u16>, secure: bool) -> Self {
        let default_port = if secure {
            DEFAULT_HTTPS_PORT
        } else {
            DEFAULT_HTTP_PORT
        };
        Self {
            host: host.as_ref().trim().to_ascii_lowercase(),
            port: port.unwrap_or(default_port),
            proxy: None,
            secure,
        }
    }

    /// Plain HTTP route
    pub fn http(host: impl AsRef<str>, port: u16) -> Self {
        Self::new(host, Some(port), false)
    }

    /// Secure HTTP route
    pub fn https(host: impl AsRef<str>, port: u16) -> Self {
        Self::new(host, Some(port), true)
    }

    /// Return a copy of this route that goes through the given proxy
    #[must_use]
    pub fn via_proxy(mut self, host: impl AsRef<str>, port: u16) -> Self {
        self.proxy = Some(ProxyHop {
            host: host.as_ref().trim().to_ascii_lowercase(),
            port,
        });
        self
    }

    /// Origin host
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Origin port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Proxy hop, if any
    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyHop> {
        self.proxy.as_ref()
    }

    /// Whether the exchange is secure
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether the route goes through a proxy
    #[must_use]
    pub fn is_proxied(&self) -> bool {
        self.proxy.is_some()
    }

    /// Whether the route tunnels through its proxy
    ///
    /// A secure exchange through a proxy is tunnelled, so the proxy is
    /// transparent to the messages on the connection.
    #[must_use]
    pub fn is_tunnelled(&self) -> bool {
        self.secure && self.proxy.is_some()
    }

    /// Whether messages on this route pass through a non-transparent proxy
    ///
    /// Such hops answer with `Proxy-Connection` rather than `Connection`.
    #[must_use]
    pub fn has_visible_proxy(&self) -> bool {
        self.proxy.is_some() && !self.secure
    }

    /// The host and port a transport should actually connect to
    #[must_use]
    pub fn connect_target(&self) -> (&str, u16) {
        match &self.proxy {
            Some(proxy) => (&proxy.host, proxy.port),
            None => (&self.host, self.port),
        }
    }

    /// URI scheme for this route
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {}:{}", proxy.host, proxy.port)?;
        }
        Ok(())
    }
}

/// Serialized form of a route, as written in configuration files
#[derive(Clone, Debug, Serialize, Deserialize)]
struct RouteSpec {
    host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default)]
    secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proxy_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proxy_port: Option<u16>,
}

impl From<RouteSpec> for Route {
    fn from(spec: RouteSpec) -> Self {
        let route = Route::new(&spec.host, spec.port, spec.secure);
        match spec.proxy_host {
            Some(proxy_host) => {
                let proxy_port = spec.proxy_port.unwrap_or(DEFAULT_HTTP_PORT);
                route.via_proxy(proxy_host, proxy_port)
            }
            None => route,
        }
    }
}

impl From<Route> for RouteSpec {
    fn from(route: Route) -> Self {
        let (proxy_host, proxy_port) = match route.proxy {
            Some(proxy) => (Some(proxy.host), Some(proxy.port)),
            None => (None, None),
        };
        Self {
            host: route.host,
            port: Some(route.port),
            secure: route.secure,
            proxy_host,
            proxy_port,
        }
    }
}
