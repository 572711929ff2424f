//! In-memory socket and certificate helpers shared by the TLS tests.

use super::{Interest, RawSocket, Transport};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Wire {
    to_server: VecDeque<u8>,
    to_client: VecDeque<u8>,
    /// Bytes the server end may still write while non-blocking.
    budget: Option<usize>,
    blocking: bool,
    blocking_switches: usize,
    client_closed: bool,
}

/// Two ends of an in-memory duplex byte stream.
#[derive(Clone, Default)]
pub struct MemPipe {
    wire: Arc<Mutex<Wire>>,
}

impl MemPipe {
    pub fn new() -> Self {
        MemPipe::default()
    }

    pub fn server_end(&self) -> Box<dyn RawSocket> {
        Box::new(ServerEnd(self.clone()))
    }

    pub fn client_end(&self) -> ClientEnd {
        ClientEnd(self.clone())
    }

    /// Limit what non-blocking server writes may accept from now on.
    pub fn set_budget(&self, budget: Option<usize>) {
        self.wire.lock().budget = budget;
    }

    pub fn push_to_server(&self, data: &[u8]) {
        self.wire.lock().to_server.extend(data);
    }

    pub fn pending_to_client(&self) -> usize {
        self.wire.lock().to_client.len()
    }

    pub fn blocking_switches(&self) -> usize {
        self.wire.lock().blocking_switches
    }

    pub fn close_client(&self) {
        self.wire.lock().client_closed = true;
    }

    /// Everything the server has written so far.
    pub fn take_to_client(&self) -> Vec<u8> {
        self.wire.lock().to_client.drain(..).collect()
    }
}

pub struct ServerEnd(MemPipe);

impl Read for ServerEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.0.wire.lock();
        if wire.to_server.is_empty() {
            if wire.client_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(wire.to_server.len());
        for (dst, src) in buf.iter_mut().zip(wire.to_server.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for ServerEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = self.0.wire.lock();
        let n = if wire.blocking {
            buf.len()
        } else {
            match wire.budget {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(b) => {
                    let n = b.min(buf.len());
                    wire.budget = Some(b - n);
                    n
                }
                None => buf.len(),
            }
        };
        wire.to_client.extend(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RawSocket for ServerEnd {
    fn set_blocking(&mut self, blocking: bool, _timeout: Option<Duration>) -> io::Result<()> {
        let mut wire = self.0.wire.lock();
        if blocking && !wire.blocking {
            wire.blocking_switches += 1;
        }
        wire.blocking = blocking;
        Ok(())
    }

    fn wait(&self, _interest: Interest, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }

    fn shutdown(&mut self) {}
}

pub struct ClientEnd(MemPipe);

impl Read for ClientEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut wire = self.0.wire.lock();
        if wire.to_client.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(wire.to_client.len());
        for (dst, src) in buf.iter_mut().zip(wire.to_client.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for ClientEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.wire.lock().to_server.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Write a self-signed certificate and key for `name`, returning their paths.
pub fn write_self_signed(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    std::fs::write(&cert, certified.cert.pem()).unwrap();
    std::fs::write(&key, certified.key_pair.serialize_pem()).unwrap();
    (cert, key)
}

/// A client connection that trusts the certificate at `cert`.
pub fn client_for(cert: &Path, name: &str) -> ClientConnection {
    client_with_config(client_config(cert), name)
}

pub fn client_config(cert: &Path) -> Arc<ClientConfig> {
    let pem = std::fs::read(cert).unwrap();
    let mut roots = RootCertStore::empty();
    for c in rustls_pemfile::certs(&mut &pem[..]) {
        roots.add(c.unwrap()).unwrap();
    }
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

pub fn client_with_config(config: Arc<ClientConfig>, name: &str) -> ClientConnection {
    let server_name = ServerName::try_from(name.to_string()).unwrap();
    ClientConnection::new(config, server_name).unwrap()
}

/// Move client output to the server.
pub fn client_send(client: &mut ClientConnection, pipe: &MemPipe) {
    let mut end = pipe.client_end();
    while client.wants_write() {
        client.write_tls(&mut end).unwrap();
    }
}

/// Feed everything the server wrote into the client.
pub fn client_receive(client: &mut ClientConnection, pipe: &MemPipe) {
    let mut end = pipe.client_end();
    while pipe.pending_to_client() > 0 {
        client.read_tls(&mut end).unwrap();
        client.process_new_packets().unwrap();
    }
}

/// Run the handshake to completion, pumping the server through `read`.
pub fn handshake(client: &mut ClientConnection, server: &mut dyn Transport, pipe: &MemPipe) {
    let mut scratch = [0u8; 64];
    for _ in 0..32 {
        client_send(client, pipe);
        let _ = server.read(&mut scratch);
        let _ = server.flush();
        client_receive(client, pipe);
        if !client.is_handshaking() && !client.wants_write() {
            break;
        }
    }
    assert!(!client.is_handshaking(), "handshake did not complete");
    // The server sees the client's Finished on this pump.
    client_send(client, pipe);
    let _ = server.read(&mut scratch);
    let _ = server.flush();
    client_receive(client, pipe);
}

/// Collect decrypted bytes the client has received.
pub fn client_plaintext(client: &mut ClientConnection) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match client.reader().read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(_) => break,
        }
    }
    out
}
