//! The server: listen endpoints, virtual hosts and the accept loops that
//! hand connections to workers.

use crate::address::{AddressSpec, HostAddressRegistry};
use crate::connection::Connection;
use crate::error::{ConfigError, StartupError, TransportError};
use crate::host::VirtualHost;
use crate::listen::ListenEndpoint;
use crate::log_writer::LogSender;
use crate::tls::{PlainTransport, ProviderKind, RawSocket, TlsRuntime, Transport};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Everything a running server shares with its workers. Read-only once
/// built.
#[derive(Debug)]
pub struct ServingState {
    name: String,
    listens: Vec<Arc<ListenEndpoint>>,
    hosts: Vec<Arc<VirtualHost>>,
    registry: HostAddressRegistry,
    log: Option<LogSender>,
}

impl ServingState {
    pub fn listens(&self) -> &[Arc<ListenEndpoint>] {
        &self.listens
    }

    pub fn hosts(&self) -> &[Arc<VirtualHost>] {
        &self.hosts
    }

    pub fn registry(&self) -> &HostAddressRegistry {
        &self.registry
    }

    /// Bind an accepted socket to the hosts served on `endpoint` and wrap it
    /// in TLS when the endpoint is secure. The handshake runs on first read.
    pub fn accept(
        &self,
        mut raw: Box<dyn RawSocket>,
        peer_ip: &str,
        peer_port: u16,
        endpoint: &ListenEndpoint,
    ) -> Result<Connection, TransportError> {
        let key = endpoint.key();
        let address = match self.registry.lookup(&key) {
            Some(a) => a,
            None => {
                log::error!("No host address for {}, dropping {}", key, peer_ip);
                raw.shutdown();
                return Err(TransportError::NoHostAddress(key));
            }
        };
        let host = match address.provisional() {
            Some(h) => h.clone(),
            None => {
                log::error!("No virtual host on {}, dropping {}", key, peer_ip);
                raw.shutdown();
                return Err(TransportError::NoVirtualHost(key));
            }
        };

        let transport: Box<dyn Transport> = match endpoint.tls() {
            Some(tls) if endpoint.is_secure() => tls.accept(raw)?,
            _ => Box::new(PlainTransport::new(raw)),
        };
        log::debug!(
            "Accepted {}:{} on {} for {}",
            peer_ip,
            peer_port,
            key,
            host.name()
        );
        Ok(Connection::new(
            transport,
            address.clone(),
            host,
            peer_ip,
            peer_port,
            &self.name,
            self.log.clone(),
        ))
    }

    /// Serve one accepted TCP stream to completion on the calling thread.
    pub fn serve_stream(&self, stream: TcpStream, peer: SocketAddr, endpoint: &ListenEndpoint) {
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("Cannot make {} non-blocking: {}", peer, e);
            return;
        }
        let _ = stream.set_nodelay(true);
        let peer_ip = peer.ip().to_string();
        match self.accept(Box::new(stream), &peer_ip, peer.port(), endpoint) {
            Ok(conn) => {
                let served = conn.serve();
                log::debug!("Closed {} after {} requests", peer, served);
            }
            Err(e) => log::warn!("Rejected connection from {}: {}", peer, e),
        }
    }
}

/// A configured server. Mutators are only available before `start`.
pub struct Server {
    name: String,
    runtime: Arc<TlsRuntime>,
    provider: ProviderKind,
    listens: Vec<ListenEndpoint>,
    hosts: Vec<VirtualHost>,
    named_vhosts: Vec<String>,
    log: Option<LogSender>,
    state: Option<Arc<ServingState>>,
    started: bool,
}

impl Server {
    pub fn new(name: &str, runtime: Arc<TlsRuntime>, provider: ProviderKind) -> Self {
        Server {
            name: name.to_string(),
            runtime,
            provider,
            listens: Vec::new(),
            hosts: Vec::new(),
            named_vhosts: Vec::new(),
            log: None,
            state: None,
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &ProviderKind {
        &self.provider
    }

    pub fn set_log_sender(&mut self, log: LogSender) {
        self.log = Some(log);
    }

    // ─── Configuration ──────────────────────────────────────

    /// Add a listen endpoint. Each `address:port` may be listed once.
    pub fn add_listen(
        &mut self,
        address: &str,
        port: u16,
        flags: u32,
    ) -> Result<&mut ListenEndpoint, ConfigError> {
        let endpoint = ListenEndpoint::new(address, port, flags);
        let key = endpoint.key();
        if self.listens.iter().any(|l| l.key() == key) {
            return Err(ConfigError::DuplicateListen(key));
        }
        self.listens.push(endpoint);
        let last = self.listens.len() - 1;
        Ok(&mut self.listens[last])
    }

    pub fn listens(&self) -> &[ListenEndpoint] {
        &self.listens
    }

    /// Create a virtual host bound to `address`. The first host created is
    /// the default host; later ones start from its settings.
    pub fn new_virtual_host(
        &mut self,
        name: &str,
        address: &str,
    ) -> Result<&mut VirtualHost, ConfigError> {
        AddressSpec::parse(address)?;
        let mut host = VirtualHost::new(name, address);
        if let Some(default) = self.hosts.first() {
            host.inherit_from(default);
        }
        self.hosts.push(host);
        let last = self.hosts.len() - 1;
        Ok(&mut self.hosts[last])
    }

    /// Create a host serving `document_root`, named after its address.
    pub fn new_host(
        &mut self,
        document_root: &Path,
        address: &str,
    ) -> Result<&mut VirtualHost, ConfigError> {
        let host = self.new_virtual_host(address, address)?;
        host.set_document_root(document_root)?;
        Ok(host)
    }

    /// Mark `address` as serving name-based virtual hosts.
    pub fn set_name_virtual_host(&mut self, address: &str) -> Result<(), ConfigError> {
        AddressSpec::parse(address)?;
        self.named_vhosts.push(address.to_string());
        Ok(())
    }

    pub fn default_host(&self) -> Option<&VirtualHost> {
        match &self.state {
            Some(state) => state.hosts.first().map(|h| h.as_ref()),
            None => self.hosts.first(),
        }
    }

    pub fn default_host_mut(&mut self) -> Option<&mut VirtualHost> {
        self.hosts.first_mut()
    }

    pub fn find_host(&self, name: &str) -> Option<&VirtualHost> {
        match &self.state {
            Some(state) => state
                .hosts
                .iter()
                .map(|h| h.as_ref())
                .find(|h| h.name() == name),
            None => self.hosts.iter().find(|h| h.name() == name),
        }
    }

    pub fn host_mut(&mut self, name: &str) -> Option<&mut VirtualHost> {
        self.hosts.iter_mut().find(|h| h.name() == name)
    }

    pub fn hosts(&self) -> &[VirtualHost] {
        &self.hosts
    }

    /// Attach `host_name`'s TLS config to every listen that serves its
    /// address and is not already secure. Returns how many were marked.
    pub fn set_ssl_listeners(&mut self, host_name: &str) -> usize {
        let Some(host) = self.hosts.iter().find(|h| h.name() == host_name) else {
            return 0;
        };
        let Some(tls) = host.tls() else {
            return 0;
        };
        let spec = host.address();
        let mut marked = 0;
        for listen in &mut self.listens {
            if listen.tls().is_none() && listen.matches(spec.ip.as_deref(), spec.port) {
                listen.set_tls(tls.clone());
                marked += 1;
            }
        }
        marked
    }

    // ─── Lifecycle ──────────────────────────────────────────

    pub fn is_serving(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&Arc<ServingState>> {
        self.state.as_ref()
    }

    /// Start TLS, bind every listen and freeze the host tables. A server
    /// starts once.
    pub fn start(&mut self) -> Result<Arc<ServingState>, StartupError> {
        if self.started {
            return Err(StartupError::AlreadyStarted);
        }
        if self.listens.is_empty() {
            return Err(StartupError::NoListens);
        }
        if self.hosts.is_empty() {
            return Err(StartupError::NoHosts);
        }
        self.runtime.crypto();

        let secure: Vec<String> = self
            .hosts
            .iter()
            .filter(|h| h.is_secure())
            .map(|h| h.name().to_string())
            .collect();
        for name in &secure {
            if self.set_ssl_listeners(name) == 0 {
                log::warn!("Host {} enables TLS but no listen serves its address", name);
            }
        }
        self.start_host_tls();

        let total = self.listens.len();
        let mut bound = 0;
        for listen in &self.listens {
            match listen.open() {
                Ok(_) => bound += 1,
                Err(e) => log::error!("Cannot open {}: {}", listen.key(), e),
            }
        }
        if bound == 0 {
            self.release_tls();
            return Err(StartupError::NoListeners(total));
        }
        if bound < total {
            log::warn!("Bound {} of {} listen endpoints", bound, total);
        }

        let hosts: Vec<Arc<VirtualHost>> = std::mem::take(&mut self.hosts)
            .into_iter()
            .map(Arc::new)
            .collect();
        let listens: Vec<Arc<ListenEndpoint>> = std::mem::take(&mut self.listens)
            .into_iter()
            .map(Arc::new)
            .collect();
        let registry = self.build_registry(&hosts, &listens);

        let state = Arc::new(ServingState {
            name: self.name.clone(),
            listens,
            hosts,
            registry,
            log: self.log.clone(),
        });
        self.state = Some(state.clone());
        self.started = true;
        log::info!(
            "{} serving {} hosts on {} endpoints",
            self.name,
            state.hosts.len(),
            bound
        );
        Ok(state)
    }

    /// Start each secure host's TLS context. A host that fails is reverted
    /// to plaintext on every listen it had marked secure.
    fn start_host_tls(&mut self) {
        for host in &mut self.hosts {
            let Some(tls) = host.tls().cloned() else {
                continue;
            };
            match tls.start() {
                Ok(()) => log::info!(
                    "TLS ready for {} ({} provider)",
                    host.name(),
                    tls.provider_name()
                ),
                Err(e) => {
                    log::warn!("TLS disabled for {}: {}", host.name(), e);
                    for listen in &mut self.listens {
                        if listen.tls().is_some_and(|t| Arc::ptr_eq(t, &tls)) {
                            listen.clear_tls();
                            log::warn!("Listen {} falls back to plaintext", listen.key());
                        }
                    }
                    host.disable_tls();
                    tls.stop();
                }
            }
        }
    }

    /// Undo `set_ssl_listeners` and `start_host_tls` after a failed start.
    /// Hosts keep their TLS configuration so a later start can retry.
    fn release_tls(&mut self) {
        for listen in &mut self.listens {
            listen.clear_tls();
        }
        for host in &self.hosts {
            if let Some(tls) = host.tls().filter(|t| t.is_started()) {
                tls.stop();
                log::debug!("Released TLS for {}", host.name());
            }
        }
    }

    fn build_registry(
        &self,
        hosts: &[Arc<VirtualHost>],
        listens: &[Arc<ListenEndpoint>],
    ) -> HostAddressRegistry {
        let mut registry = HostAddressRegistry::new();
        for host in hosts {
            let spec = host.address();
            let mut bound = false;
            for listen in listens {
                if listen.matches(spec.ip.as_deref(), spec.port) {
                    registry.insert_vhost(listen_ip(listen), listen.port(), host.clone());
                    bound = true;
                }
            }
            if !bound {
                log::warn!("Host {} address {} has no listen", host.name(), spec.key());
                registry.insert_vhost(spec.ip.as_deref(), spec.port, host.clone());
            }
        }
        // The default host answers last on every endpoint.
        if let Some(default) = hosts.first() {
            for listen in listens {
                registry.insert_vhost(listen_ip(listen), listen.port(), default.clone());
            }
        }
        for spec in &self.named_vhosts {
            if let Ok(parsed) = AddressSpec::parse(spec) {
                if !registry.set_named_vhost(&parsed.key()) {
                    log::warn!("NameVirtualHost {} matches no host address", spec);
                }
            }
        }
        registry
    }

    /// Accept a raw connection on `endpoint`.
    pub fn accept(
        &self,
        raw: Box<dyn RawSocket>,
        peer_ip: &str,
        peer_port: u16,
        endpoint: &ListenEndpoint,
    ) -> Result<Connection, TransportError> {
        match &self.state {
            Some(state) => state.accept(raw, peer_ip, peer_port, endpoint),
            None => Err(TransportError::NotServing),
        }
    }

    /// Accept on every bound endpoint until `shutdown` is set. Each
    /// connection is served by a blocking worker.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) -> Result<(), TransportError> {
        let state = self.state.clone().ok_or(TransportError::NotServing)?;
        let mut loops = Vec::new();
        for endpoint in &state.listens {
            let Some(std_listener) = endpoint.try_clone_listener() else {
                continue;
            };
            let listener = tokio::net::TcpListener::from_std(std_listener)?;
            loops.push(accept_loop(
                state.clone(),
                endpoint.clone(),
                listener,
                shutdown.clone(),
            ));
        }
        futures::future::join_all(loops).await;
        Ok(())
    }

    /// Close listens, release TLS contexts once and drop the access-log
    /// channel so its writer flushes.
    pub fn stop(&mut self) {
        if let Some(state) = self.state.take() {
            for listen in &state.listens {
                listen.close();
            }
            for host in &state.hosts {
                if let Some(tls) = host.tls() {
                    tls.stop();
                }
            }
            log::info!("{} stopped", self.name);
        }
        self.log = None;
    }
}

fn listen_ip(listen: &ListenEndpoint) -> Option<&str> {
    (!listen.is_wildcard()).then(|| listen.address())
}

async fn accept_loop(
    state: Arc<ServingState>,
    endpoint: Arc<ListenEndpoint>,
    listener: tokio::net::TcpListener,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let stream = match stream.into_std() {
                        Ok(s) => s,
                        Err(e) => {
                            log::warn!("Cannot detach {}: {}", peer, e);
                            continue;
                        }
                    };
                    let state = state.clone();
                    let endpoint = endpoint.clone();
                    tokio::task::spawn_blocking(move || {
                        state.serve_stream(stream, peer, &endpoint)
                    });
                }
                Err(e) => {
                    log::warn!("Accept on {} failed: {}", endpoint.key(), e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        if shutdown.load(Ordering::SeqCst) {
            log::debug!("Accept loop on {} stopping", endpoint.key());
            break;
        }
    }
}
