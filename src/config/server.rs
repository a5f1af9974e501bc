//! Parsing of `host[:port]` server strings from the configuration.

use std::fmt;
use std::net::Ipv6Addr;

/// Default port for queue and aggregator servers.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// A server address split into host and optional port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// Hostname, IPv4 address, or IPv6 address without brackets.
    pub host: String,
    /// Port, if one was given.
    pub port: Option<u16>,
}

impl ServerAddr {
    /// Splits a host/port string the way it appears in the host part of a
    /// URL (RFC 2732).
    ///
    /// Accepts `host`, `host:port`, `[v6]`, `[v6]:port` and a bare IPv6
    /// address. Returns `None` for anything else.
    pub fn parse(both: &str) -> Option<Self> {
        if let Some(rest) = both.strip_prefix('[') {
            let (addr, tail) = rest.split_once(']')?;
            addr.parse::<Ipv6Addr>().ok()?;
            let port = match tail {
                "" => None,
                _ => Some(parse_port(tail.strip_prefix(':')?)?),
            };
            return Some(Self {
                host: addr.to_string(),
                port,
            });
        }

        match both.matches(':').count() {
            0 if !both.is_empty() => Some(Self {
                host: both.to_string(),
                port: None,
            }),
            0 => None,
            1 => {
                let (host, port) = both.split_once(':')?;
                if host.is_empty() {
                    return None;
                }
                Some(Self {
                    host: host.to_string(),
                    port: Some(parse_port(port)?),
                })
            }
            // Too many colons for anything but a bare IPv6 address
            _ => {
                both.parse::<Ipv6Addr>().ok()?;
                Some(Self {
                    host: both.to_string(),
                    port: None,
                })
            }
        }
    }

    /// Returns the port, falling back to the default Redis port.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_REDIS_PORT)
    }

    /// Builds a `redis://` connection URL for this server.
    pub fn redis_url(&self, password: Option<&str>) -> String {
        let auth = match password {
            Some(pw) if !pw.is_empty() => format!(":{}@", urlencoding::encode(pw)),
            _ => String::new(),
        };
        format!("redis://{}{}:{}/", auth, self.url_host(), self.port_or_default())
    }

    fn url_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.url_host(), port),
            None => write!(f, "{}", self.url_host()),
        }
    }
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
