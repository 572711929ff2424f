//! Provider-neutral TLS transport.
//!
//! A provider turns per-host [`TlsSettings`] into a started context and wraps
//! accepted sockets into [`Transport`]s. Two providers exist:
//!
//! - `session`: the TLS library owns all record buffering.
//! - `record`: the server owns ciphertext and plaintext buffers and feeds the
//!   library one record at a time.
//!
//! Providers are chosen by name once, at config time, and stored in
//! [`ProviderKind`]. Hosts hold a [`TlsHostConfig`] which dispatches to the
//! provider that created it.

pub mod buffer;
pub mod context;
pub mod record;
pub mod session;
pub mod settings;
#[cfg(test)]
pub mod testing;

use crate::error::{ConfigError, TransportError};
use once_cell::sync::OnceCell;
use rustls::crypto::CryptoProvider;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use record::{RecordHostConfig, RecordLimits, RecordProvider};
pub use session::{SessionHostConfig, SessionProvider};
pub use settings::TlsSettings;

/// Readiness a caller can wait for on a raw socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// The OS socket underneath a transport.
pub trait RawSocket: Read + Write + Send {
    /// Switch blocking mode. `write_timeout` bounds blocking writes.
    fn set_blocking(&mut self, blocking: bool, write_timeout: Option<Duration>) -> io::Result<()>;

    /// Wait until the socket is ready. `Ok(false)` on timeout.
    fn wait(&self, interest: Interest, timeout: Duration) -> io::Result<bool>;

    fn shutdown(&mut self);
}

impl RawSocket for TcpStream {
    fn set_blocking(&mut self, blocking: bool, write_timeout: Option<Duration>) -> io::Result<()> {
        self.set_nonblocking(!blocking)?;
        self.set_write_timeout(if blocking { write_timeout } else { None })
    }

    fn wait(&self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        let events = match interest {
            Interest::Read => libc::POLLIN,
            Interest::Write => libc::POLLOUT,
        };
        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0)
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, std::net::Shutdown::Both);
    }
}

/// Connection state, shared by plain and TLS transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Uninitialized,
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// Result of one transport read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Nothing available yet, wait for readiness and call again.
    WouldBlock,
    Data(usize),
    Eof,
    Error(TransportError),
}

/// Result of one transport write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(usize),
    /// Output is still buffered; call again with the same length.
    Retry,
}

/// Byte stream handed to the HTTP layer.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome;

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, TransportError>;

    /// Push buffered output. `Ok(true)` once nothing is left.
    fn flush(&mut self) -> Result<bool, TransportError>;

    /// Best-effort close notification, then release buffers and socket.
    fn close(&mut self);

    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool>;

    fn state(&self) -> TlsState;

    fn is_secure(&self) -> bool;
}

/// Unencrypted transport over a raw socket.
pub struct PlainTransport {
    sock: Option<Box<dyn RawSocket>>,
}

impl PlainTransport {
    pub fn new(sock: Box<dyn RawSocket>) -> Self {
        PlainTransport { sock: Some(sock) }
    }
}

impl Transport for PlainTransport {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let sock = match self.sock.as_mut() {
            Some(s) => s,
            None => return ReadOutcome::Eof,
        };
        match sock.read(buf) {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::WouldBlock,
            Err(e) => ReadOutcome::Error(e.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, TransportError> {
        let sock = self.sock.as_mut().ok_or(TransportError::Closed)?;
        match sock.write(buf) {
            Ok(n) => Ok(WriteOutcome::Written(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::Retry),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(WriteOutcome::Retry),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }

    fn close(&mut self) {
        if let Some(mut sock) = self.sock.take() {
            sock.shutdown();
        }
    }

    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        match self.sock.as_ref() {
            Some(s) => s.wait(interest, timeout),
            None => Ok(true),
        }
    }

    fn state(&self) -> TlsState {
        if self.sock.is_some() {
            TlsState::Established
        } else {
            TlsState::Closed
        }
    }

    fn is_secure(&self) -> bool {
        false
    }
}

/// Process-wide TLS state: the crypto provider, set up once.
#[derive(Debug, Default)]
pub struct TlsRuntime {
    crypto: OnceCell<Arc<CryptoProvider>>,
    inits: AtomicUsize,
}

impl TlsRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(TlsRuntime::default())
    }

    /// The crypto provider, installing it as the process default on first use.
    pub fn crypto(&self) -> Arc<CryptoProvider> {
        self.crypto
            .get_or_init(|| {
                self.inits.fetch_add(1, Ordering::SeqCst);
                let provider = rustls::crypto::ring::default_provider();
                if provider.clone().install_default().is_err() {
                    log::debug!("A process-wide crypto provider was already installed");
                }
                log::info!(
                    "TLS runtime initialised with {} cipher suites",
                    provider.cipher_suites.len()
                );
                Arc::new(provider)
            })
            .clone()
    }

    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }
}

/// Contract each TLS backend implements.
pub trait TlsProvider {
    type HostConfig;
    type Connection: Transport + 'static;

    fn name(&self) -> &'static str;

    fn new_config(&self, host: &str) -> Self::HostConfig;

    fn start(&self, config: &Self::HostConfig) -> Result<(), ConfigError>;

    fn stop(&self, config: &Self::HostConfig);

    /// Wrap an accepted socket. The handshake runs on first read.
    fn accept(
        &self,
        config: &Self::HostConfig,
        sock: Box<dyn RawSocket>,
    ) -> Result<Self::Connection, TransportError>;
}

/// Registered providers, resolved by name when the config is loaded.
#[derive(Debug, Clone)]
pub enum ProviderKind {
    Session(SessionProvider),
    Record(RecordProvider),
}

pub const PROVIDER_NAMES: &[&str] = &["session", "record"];

impl ProviderKind {
    pub fn by_name(
        name: &str,
        runtime: Arc<TlsRuntime>,
        limits: RecordLimits,
    ) -> Result<Self, ConfigError> {
        match name {
            "session" | "openssl" => Ok(ProviderKind::Session(SessionProvider::new(runtime))),
            "record" | "matrixssl" => {
                Ok(ProviderKind::Record(RecordProvider::new(runtime, limits)))
            }
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Session(p) => p.name(),
            ProviderKind::Record(p) => p.name(),
        }
    }

    pub fn new_config(&self, host: &str) -> TlsHostConfig {
        match self {
            ProviderKind::Session(p) => TlsHostConfig::Session(p.clone(), p.new_config(host)),
            ProviderKind::Record(p) => TlsHostConfig::Record(p.clone(), p.new_config(host)),
        }
    }
}

/// A host's TLS configuration, tagged with the provider that owns it.
#[derive(Debug)]
pub enum TlsHostConfig {
    Session(SessionProvider, SessionHostConfig),
    Record(RecordProvider, RecordHostConfig),
}

impl TlsHostConfig {
    pub fn settings(&self) -> &TlsSettings {
        match self {
            TlsHostConfig::Session(_, c) => c.context().settings(),
            TlsHostConfig::Record(_, c) => c.context().settings(),
        }
    }

    pub fn settings_mut(&mut self) -> &mut TlsSettings {
        match self {
            TlsHostConfig::Session(_, c) => c.context_mut().settings_mut(),
            TlsHostConfig::Record(_, c) => c.context_mut().settings_mut(),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            TlsHostConfig::Session(p, _) => p.name(),
            TlsHostConfig::Record(p, _) => p.name(),
        }
    }

    pub fn start(&self) -> Result<(), ConfigError> {
        match self {
            TlsHostConfig::Session(p, c) => p.start(c),
            TlsHostConfig::Record(p, c) => p.start(c),
        }
    }

    pub fn stop(&self) {
        match self {
            TlsHostConfig::Session(p, c) => p.stop(c),
            TlsHostConfig::Record(p, c) => p.stop(c),
        }
    }

    pub fn is_started(&self) -> bool {
        match self {
            TlsHostConfig::Session(_, c) => c.context().is_started(),
            TlsHostConfig::Record(_, c) => c.context().is_started(),
        }
    }

    pub fn accept(&self, sock: Box<dyn RawSocket>) -> Result<Box<dyn Transport>, TransportError> {
        Ok(match self {
            TlsHostConfig::Session(p, c) => Box::new(p.accept(c, sock)?),
            TlsHostConfig::Record(p, c) => Box::new(p.accept(c, sock)?),
        })
    }
}
