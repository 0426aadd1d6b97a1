use anyhow::bail;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// The TFTP well-known port, used when neither the listen spec nor its
///  scheme carries one.
const FALLBACK_PORT: u16 = 69;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen spec: `[scheme://]host[:port]`. `*` (or an empty host) binds
    ///  `0.0.0.0`. A missing port is looked up from the scheme, falling
    ///  back to 69.
    pub listen: String,

    /// Hard cap on concurrent connections; a request arriving at the cap
    ///  is dropped with a server-level error event.
    pub max_connections: usize,

    /// Retransmit budget per connection. This is the number of
    ///  *retransmissions*: the decrement that would take the remaining
    ///  budget below zero abandons the connection.
    pub retries: u32,

    /// Idle/retransmit timeout per connection. Clients may lower or raise
    ///  it per transfer via the RFC 2349 `timeout` option.
    pub retransmit_timeout: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen: "*".to_string(),
            max_connections: 1000,
            retries: 3,
            retransmit_timeout: Duration::from_secs(2),
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit_timeout must be non-zero");
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Resolves the listen spec to a bindable address.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let spec = self.listen.as_str();
        let (scheme, rest) = match spec.split_once("://") {
            Some((scheme, rest)) => (Some(scheme), rest),
            None => (None, spec),
        };

        let (host, explicit_port) = split_host_port(rest)?;
        let port = explicit_port
            .or_else(|| scheme.and_then(service_port))
            .unwrap_or(FALLBACK_PORT);

        let host = match host {
            "" | "*" => "0.0.0.0",
            other => other,
        };

        match (host, port).to_socket_addrs()?.next() {
            Some(addr) => Ok(addr),
            None => bail!("listen spec {:?} does not resolve to an address", spec),
        }
    }
}

/// Splits `host[:port]`, handling bracketed and bare IPv6 literals.
fn split_host_port(s: &str) -> anyhow::Result<(&str, Option<u16>)> {
    if let Some(rest) = s.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            bail!("unclosed '[' in listen spec {:?}", s);
        };
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse()?),
            None if tail.is_empty() => None,
            None => bail!("malformed listen spec {:?}", s),
        };
        return Ok((host, port));
    }

    // more than one ':' means a bare IPv6 literal without a port
    if s.matches(':').count() > 1 {
        return Ok((s, None));
    }

    match s.split_once(':') {
        Some((host, port)) => Ok((host, Some(port.parse()?))),
        None => Ok((s, None)),
    }
}

/// The service database of the listen grammar, keyed by scheme.
fn service_port(scheme: &str) -> Option<u16> {
    match scheme {
        "tftp" => Some(69),
        _ => None,
    }
}
