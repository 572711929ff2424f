//! One accepted connection, served to completion by a single worker.

use crate::access_control::{check_access, AccessResult};
use crate::address::HostAddress;
use crate::auth::{authenticate, AuthRequest, AuthState};
use crate::error::{AuthError, TransportError};
use crate::error_pages::serve_error_page;
use crate::host::{HostStats, VirtualHost};
use crate::log_writer::{format_clf, AccessRecord, LogEntry, LogSender};
use crate::request::{Request, Response};
use crate::router::{self, Handler};
use crate::static_files::{resolve_index, serve_static_file, Conditions};
use crate::tls::{Interest, ReadOutcome, TlsState, Transport, WriteOutcome};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Largest accepted request head.
pub const MAX_HEAD: usize = 8 * 1024;
/// Largest slice handed to one transport write.
const WRITE_CHUNK: usize = 16 * 1024;

pub struct Connection {
    transport: Box<dyn Transport>,
    address: HostAddress,
    host: Arc<VirtualHost>,
    peer_ip: String,
    peer_port: u16,
    server_name: String,
    log: Option<LogSender>,
    buf: Vec<u8>,
    served: u32,
}

enum HeadResult {
    Request(Request),
    Closed,
    Reject(u16),
}

impl Connection {
    pub fn new(
        transport: Box<dyn Transport>,
        address: HostAddress,
        host: Arc<VirtualHost>,
        peer_ip: &str,
        peer_port: u16,
        server_name: &str,
        log: Option<LogSender>,
    ) -> Self {
        Connection {
            transport,
            address,
            host,
            peer_ip: peer_ip.to_string(),
            peer_port,
            server_name: server_name.to_string(),
            log,
            buf: Vec::with_capacity(4096),
            served: 0,
        }
    }

    /// Host the connection is currently bound to.
    pub fn host(&self) -> &Arc<VirtualHost> {
        &self.host
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    pub fn tls_state(&self) -> TlsState {
        self.transport.state()
    }

    pub fn requests_served(&self) -> u32 {
        self.served
    }

    /// Serve requests until the peer leaves, keep-alive ends or an error
    /// occurs, then close the transport.
    pub fn serve(mut self) -> u32 {
        log::debug!("Serving {}:{} on {}", self.peer_ip, self.peer_port, self.address.key());
        loop {
            let idle = if self.served == 0 {
                self.host.limits().timeout
            } else {
                self.host.limits().keep_alive_timeout
            };
            let request = match self.read_head(idle) {
                HeadResult::Request(r) => r,
                HeadResult::Closed => break,
                HeadResult::Reject(status) => {
                    let resp = serve_error_page(&self.host, status, "Bad request");
                    let _ = self.send(&resp, false);
                    break;
                }
            };
            if !self.serve_one(request) {
                break;
            }
        }
        self.transport.close();
        self.served
    }

    /// Handle one parsed request. Returns whether to keep the connection.
    fn serve_one(&mut self, request: Request) -> bool {
        if let Some(header) = request.host() {
            if let Some(found) = self.address.find_host(header) {
                if !Arc::ptr_eq(found, &self.host) {
                    log::debug!("Host {} selects {}", header, found.name());
                    self.host = found.clone();
                }
            }
        }
        let host = self.host.clone();
        HostStats::bump(&host.stats().requests);
        if self.served > 0 {
            HostStats::bump(&host.stats().kept_alive);
        }

        let body_ok = self.discard_body(&request, &host);
        let (mut resp, user) = if body_ok {
            self.handle(&host, &request)
        } else {
            (serve_error_page(&host, 413, "Request body too large"), None)
        };
        if request.method.eq_ignore_ascii_case("HEAD") {
            resp.head_only = true;
        }

        let limits = host.limits();
        let keep_alive = body_ok
            && limits.keep_alive
            && request.wants_keep_alive()
            && self.served + 1 < limits.max_keep_alive;
        if resp.status >= 500 {
            HostStats::bump(&host.stats().errors);
        }

        let sent = self.send(&resp, keep_alive);
        self.served += 1;
        self.log_access(&host, &request, user.as_deref(), &resp);
        match sent {
            Ok(()) => keep_alive,
            Err(e) => {
                log::debug!("Write to {} failed: {}", self.peer_ip, e);
                false
            }
        }
    }

    fn handle(&self, host: &VirtualHost, request: &Request) -> (Response, Option<String>) {
        let path = match request.canonical_path() {
            Some(p) => p,
            None => {
                log::warn!("Rejected path {} from {}", request.uri, self.peer_ip);
                return (serve_error_page(host, 400, "Bad request path"), None);
            }
        };
        let route = router::resolve(host, &path);

        let storage = match &route.storage {
            Some(s) => s.clone(),
            None if host.document_root().is_some() => {
                return (serve_error_page(host, 400, "Bad request path"), None)
            }
            None => return (serve_error_page(host, 404, "No document root"), None),
        };

        let peer: Option<IpAddr> = self.peer_ip.parse().ok();
        if check_access(route.policy.access(), peer.as_ref()) == AccessResult::Denied {
            HostStats::bump(&host.stats().access_errors);
            let err = AuthError::AddressDenied;
            log::warn!("{}: {} {} from {}", err, request.method, request.uri, self.peer_ip);
            return (serve_error_page(host, err.status(), err.user_message()), None);
        }

        let index = route
            .directory
            .map(|d| d.index.as_str())
            .unwrap_or("index.html");
        let file = resolve_index(&storage, index);
        let etag = VirtualHost::entity_tag(&file).unwrap_or_default();

        let mut auth_req = AuthRequest::new(&request.method, &path).with_etag(&etag);
        if let Some((scheme, details)) = request.authorization() {
            auth_req = auth_req.with_authorization(scheme, details);
        }
        let user = match authenticate(&mut auth_req, route.policy, host) {
            AuthState::NoAuthRequired => None,
            AuthState::Accepted(identity) => Some(identity.user),
            AuthState::AwaitingCredentials { challenge } => {
                let resp = serve_error_page(host, 401, AuthError::MissingDetails.user_message())
                    .with_header("WWW-Authenticate", challenge);
                return (resp, None);
            }
            AuthState::Rejected { error, challenge } => {
                let mut resp = serve_error_page(host, error.status(), error.user_message());
                if let Some(challenge) = challenge {
                    resp.set_header("WWW-Authenticate", challenge);
                }
                return (resp, None);
            }
        };

        let resp = match &route.handler {
            Handler::Unsupported(name) => {
                log::debug!("No handler {} for {}", name, request.uri);
                serve_error_page(host, 501, "Handler not available")
            }
            Handler::Static => {
                let method = request.method.to_ascii_uppercase();
                if method != "GET" && method != "HEAD" {
                    serve_error_page(host, 405, "Method not allowed").with_header("Allow", "GET, HEAD")
                } else {
                    let cond = Conditions {
                        if_modified_since: request.header("if-modified-since"),
                        if_none_match: request.header("if-none-match"),
                    };
                    serve_static_file(host, &file, cond)
                        .unwrap_or_else(|| serve_error_page(host, 404, "Not found"))
                }
            }
        };
        (resp, user)
    }

    // ─── Reading ────────────────────────────────────────────

    fn read_head(&mut self, idle: Duration) -> HeadResult {
        let mut chunk = [0u8; 4096];
        loop {
            if !self.buf.is_empty() {
                match Request::parse(&self.buf) {
                    Ok(Some((request, len))) => {
                        self.buf.drain(..len);
                        return HeadResult::Request(request);
                    }
                    Ok(None) if self.buf.len() >= MAX_HEAD => return HeadResult::Reject(431),
                    Ok(None) => {}
                    Err(e) => {
                        log::debug!("Malformed request from {}: {}", self.peer_ip, e);
                        return HeadResult::Reject(400);
                    }
                }
            }
            match self.read_some(&mut chunk, idle) {
                Some(n) => self.buf.extend_from_slice(&chunk[..n]),
                None => return HeadResult::Closed,
            }
        }
    }

    /// Read at least one byte, waiting up to `idle`. `None` on EOF, error or
    /// timeout.
    fn read_some(&mut self, chunk: &mut [u8], idle: Duration) -> Option<usize> {
        loop {
            match self.transport.read(chunk) {
                ReadOutcome::Data(n) if n > 0 => return Some(n),
                ReadOutcome::Data(_) | ReadOutcome::WouldBlock => {}
                ReadOutcome::Eof => return None,
                ReadOutcome::Error(e) => {
                    log::debug!("Read from {} failed: {}", self.peer_ip, e);
                    HostStats::bump(&self.host.stats().errors);
                    return None;
                }
            }
            if let Err(e) = self.transport.flush() {
                log::debug!("Flush to {} failed: {}", self.peer_ip, e);
                return None;
            }
            match self.transport.wait(Interest::Read, idle) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("Idle timeout for {}", self.peer_ip);
                    HostStats::bump(&self.host.stats().timeouts);
                    return None;
                }
                Err(e) => {
                    log::debug!("Wait on {} failed: {}", self.peer_ip, e);
                    return None;
                }
            }
        }
    }

    /// Skip a request body. False if it is larger than the host allows or
    /// the peer went away.
    fn discard_body(&mut self, request: &Request, host: &VirtualHost) -> bool {
        let mut remaining = request.content_length();
        if remaining > host.limits().max_body {
            log::warn!(
                "Request body of {} bytes exceeds limit on {}",
                remaining,
                host.name()
            );
            return false;
        }
        let buffered = remaining.min(self.buf.len());
        self.buf.drain(..buffered);
        remaining -= buffered;
        let mut chunk = [0u8; 4096];
        while remaining > 0 {
            let want = remaining.min(chunk.len());
            match self.read_some(&mut chunk[..want], host.limits().timeout) {
                Some(n) => remaining -= n.min(remaining),
                None => return false,
            }
        }
        true
    }

    // ─── Writing ────────────────────────────────────────────

    fn send(&mut self, resp: &Response, keep_alive: bool) -> Result<(), TransportError> {
        let data = resp.serialize(&self.server_name, keep_alive);
        self.write_all(&data)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let timeout = self.host.limits().timeout;
        let mut offset = 0;
        while offset < data.len() {
            // A retried write must repeat the same slice.
            let end = (offset + WRITE_CHUNK).min(data.len());
            match self.transport.write(&data[offset..end])? {
                WriteOutcome::Written(0) => return Err(TransportError::Closed),
                WriteOutcome::Written(n) => offset += n,
                WriteOutcome::Retry => self.wait_writable(timeout)?,
            }
        }
        while !self.transport.flush()? {
            self.wait_writable(timeout)?;
        }
        Ok(())
    }

    fn wait_writable(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.transport.wait(Interest::Write, timeout)? {
            Ok(())
        } else {
            HostStats::bump(&self.host.stats().timeouts);
            Err(TransportError::FlushTimeout(0))
        }
    }

    fn log_access(&self, host: &VirtualHost, request: &Request, user: Option<&str>, resp: &Response) {
        let (path, tx) = match (host.access_log(), &self.log) {
            (Some(p), Some(tx)) => (p, tx),
            _ => return,
        };
        let line = format_clf(&AccessRecord {
            client: &self.peer_ip,
            user,
            time: chrono::Local::now(),
            request_line: &request.request_line(),
            status: resp.status,
            bytes: resp.body_len(),
        });
        let _ = tx.send(LogEntry {
            file_path: path.to_path_buf(),
            line,
        });
    }
}
