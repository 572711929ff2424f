//! Maps `ip:port` keys to the virtual hosts served there.

use crate::error::ConfigError;
use crate::host::VirtualHost;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_HTTP_PORT: u16 = 80;

/// A parsed `[ip][:port]` specification. `ip == None` is the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressSpec {
    pub ip: Option<String>,
    pub port: u16,
}

impl AddressSpec {
    /// Accepts `*`, `8080`, `*:8080`, `10.0.0.1`, `10.0.0.1:8080` and
    /// bracketed IPv6 forms such as `[::1]:8080`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        let bad = || ConfigError::BadAddress(spec.to_string());
        if spec.is_empty() || spec == "*" {
            return Ok(AddressSpec::wildcard(DEFAULT_HTTP_PORT));
        }
        if spec.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(AddressSpec::wildcard(spec.parse().map_err(|_| bad())?));
        }

        let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
            match tail.strip_prefix(':') {
                Some(p) => (host, Some(p)),
                None if tail.is_empty() => (host, None),
                None => return Err(bad()),
            }
        } else {
            match spec.rsplit_once(':') {
                Some((h, p)) if !h.contains(':') => (h, Some(p)),
                _ => (spec, None),
            }
        };
        let port = match port {
            Some(p) => p.parse().map_err(|_| bad())?,
            None => DEFAULT_HTTP_PORT,
        };
        let ip = match host {
            "" | "*" | "0.0.0.0" => None,
            h => Some(h.to_string()),
        };
        Ok(AddressSpec { ip, port })
    }

    pub fn wildcard(port: u16) -> Self {
        AddressSpec { ip: None, port }
    }

    pub fn is_wildcard(&self) -> bool {
        self.ip.is_none()
    }

    /// Registry key. The wildcard address is written `0.0.0.0`.
    pub fn key(&self) -> String {
        canonical_key(self.ip.as_deref(), self.port)
    }
}

pub fn canonical_key(ip: Option<&str>, port: u16) -> String {
    format!("{}:{}", ip.filter(|s| !s.is_empty()).unwrap_or("0.0.0.0"), port)
}

/// Every virtual host bound to one `ip:port`, in binding order.
#[derive(Debug, Clone)]
pub struct HostAddress {
    pub ip: Option<String>,
    pub port: u16,
    pub named_vhost: bool,
    pub vhosts: Vec<Arc<VirtualHost>>,
}

impl HostAddress {
    pub fn new(ip: Option<String>, port: u16) -> Self {
        HostAddress {
            ip,
            port,
            named_vhost: false,
            vhosts: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        canonical_key(self.ip.as_deref(), self.port)
    }

    /// First bound host, used before the Host header has been read.
    pub fn provisional(&self) -> Option<&Arc<VirtualHost>> {
        self.vhosts.first()
    }

    /// Pick the host named by a `Host` header. The header and each host
    /// name are compared without their port; a host matches when its name
    /// is a case-sensitive prefix of the header value.
    pub fn find_host(&self, header: &str) -> Option<&Arc<VirtualHost>> {
        let wanted = strip_port(header.trim());
        if wanted.is_empty() {
            return None;
        }
        self.vhosts.iter().find(|vh| {
            let name = strip_port(vh.name());
            !name.is_empty() && wanted.starts_with(name)
        })
    }

    fn contains(&self, host: &Arc<VirtualHost>) -> bool {
        self.vhosts.iter().any(|vh| Arc::ptr_eq(vh, host))
    }
}

/// `host[:port]` or `[v6]:port` without the port. Brackets are kept.
fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        }
    } else {
        authority.split(':').next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default)]
pub struct HostAddressRegistry {
    entries: HashMap<String, HostAddress>,
}

impl HostAddressRegistry {
    pub fn new() -> Self {
        HostAddressRegistry::default()
    }

    /// Append `host` to the entry for `ip:port`, creating it if needed.
    /// A host is bound at most once per entry.
    pub fn insert_vhost(&mut self, ip: Option<&str>, port: u16, host: Arc<VirtualHost>) {
        let key = canonical_key(ip, port);
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| HostAddress::new(ip.map(str::to_string), port));
        if !entry.contains(&host) {
            entry.vhosts.push(host);
        }
    }

    pub fn lookup(&self, key: &str) -> Option<&HostAddress> {
        self.entries.get(key)
    }

    pub fn set_named_vhost(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.named_vhost = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostAddress> {
        self.entries.values()
    }
}
