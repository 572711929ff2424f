use crate::address::canonical_key;
use crate::error::TransportError;
use crate::tls::TlsHostConfig;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

/// No port was given; the default was used.
pub const DEFAULT_PORT: u32 = 0x1;
/// Listen on every port a host asks for.
pub const WILD_PORT: u32 = 0x2;
/// Listen on every address.
pub const WILD_IP: u32 = 0x4;
/// Wildcard written as `*` rather than left empty.
pub const WILD_IP2: u32 = 0x8;

/// One listening socket, optionally terminating TLS.
#[derive(Debug)]
pub struct ListenEndpoint {
    address: String,
    port: u16,
    flags: u32,
    secure: bool,
    tls: Option<Arc<TlsHostConfig>>,
    socket: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ListenEndpoint {
    /// `address` may be empty, `*` or `0.0.0.0` for every interface.
    pub fn new(address: &str, port: u16, flags: u32) -> Self {
        let mut flags = flags;
        let address = match address.trim() {
            "*" => {
                flags |= WILD_IP | WILD_IP2;
                String::new()
            }
            "" | "0.0.0.0" => {
                flags |= WILD_IP;
                String::new()
            }
            a => a.to_string(),
        };
        ListenEndpoint {
            address,
            port,
            flags,
            secure: false,
            tls: None,
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn is_wildcard(&self) -> bool {
        self.address.is_empty()
    }

    /// Registry key: `address:port`, with the wildcard written `0.0.0.0`.
    pub fn key(&self) -> String {
        canonical_key(Some(&self.address), self.port)
    }

    /// True if a host bound to `ip:port` is served through this endpoint.
    pub fn matches(&self, ip: Option<&str>, port: u16) -> bool {
        if self.port != port && self.flags & WILD_PORT == 0 {
            return false;
        }
        match ip {
            None => true,
            Some(ip) => self.is_wildcard() || self.address == ip,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn tls(&self) -> Option<&Arc<TlsHostConfig>> {
        self.tls.as_ref()
    }

    pub fn set_tls(&mut self, config: Arc<TlsHostConfig>) {
        self.tls = Some(config);
        self.secure = true;
    }

    /// Drop the TLS config and serve plaintext.
    pub fn clear_tls(&mut self) {
        self.tls = None;
        self.secure = false;
    }

    /// Bind the socket in non-blocking mode.
    pub fn open(&self) -> Result<SocketAddr, TransportError> {
        let host = if self.is_wildcard() {
            "0.0.0.0"
        } else {
            self.address.as_str()
        };
        let listener = TcpListener::bind((host, self.port))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        *self.socket.lock() = Some(listener);
        *self.local_addr.lock() = Some(local);
        log::info!(
            "Listening on {}{}",
            local,
            if self.secure { " (TLS)" } else { "" }
        );
        Ok(local)
    }

    pub fn is_open(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Address actually bound, which differs from the configured one for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// A handle for an accept loop.
    pub fn try_clone_listener(&self) -> Option<TcpListener> {
        self.socket.lock().as_ref().and_then(|l| l.try_clone().ok())
    }

    pub fn close(&self) {
        if self.socket.lock().take().is_some() {
            log::debug!("Closed listener {}", self.key());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_forms() {
        let star = ListenEndpoint::new("*", 80, 0);
        assert!(star.is_wildcard());
        assert_eq!(star.flags() & (WILD_IP | WILD_IP2), WILD_IP | WILD_IP2);
        assert_eq!(star.key(), "0.0.0.0:80");
        let any = ListenEndpoint::new("0.0.0.0", 8080, DEFAULT_PORT);
        assert_eq!(any.flags(), DEFAULT_PORT | WILD_IP);
        assert_eq!(ListenEndpoint::new("127.0.0.1", 81, 0).key(), "127.0.0.1:81");
    }

    #[test]
    fn test_matches() {
        let wild = ListenEndpoint::new("", 8443, 0);
        assert!(wild.matches(None, 8443));
        assert!(wild.matches(Some("10.0.0.1"), 8443));
        assert!(!wild.matches(None, 8080));

        let fixed = ListenEndpoint::new("10.0.0.1", 80, 0);
        assert!(fixed.matches(None, 80));
        assert!(fixed.matches(Some("10.0.0.1"), 80));
        assert!(!fixed.matches(Some("10.0.0.2"), 80));

        let any_port = ListenEndpoint::new("", 80, WILD_PORT);
        assert!(any_port.matches(None, 9999));
    }

    #[test]
    fn test_open_and_close() {
        let listen = ListenEndpoint::new("127.0.0.1", 0, 0);
        let local = listen.open().unwrap();
        assert_ne!(local.port(), 0);
        assert!(listen.is_open());
        assert!(listen.try_clone_listener().is_some());
        listen.close();
        assert!(!listen.is_open());
        assert!(listen.try_clone_listener().is_none());
        listen.close();
    }

    #[test]
    fn test_open_conflict_fails() {
        let first = ListenEndpoint::new("127.0.0.1", 0, 0);
        let local = first.open().unwrap();
        let second = ListenEndpoint::new("127.0.0.1", local.port(), 0);
        assert!(second.open().is_err());
    }
}
