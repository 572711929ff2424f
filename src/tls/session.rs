//! Provider where the TLS session buffers records itself.
//!
//! The session reads ciphertext straight from the socket and keeps decoded
//! plaintext and pending ciphertext internally. This connection only pumps
//! bytes between the socket and the session.

use super::context::{check_peer_depth, TlsContext};
use super::{Interest, RawSocket, ReadOutcome, TlsProvider, TlsRuntime, TlsState, Transport, WriteOutcome};
use crate::error::{ConfigError, TransportError};
use rustls::{ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionProvider {
    runtime: Arc<TlsRuntime>,
}

impl SessionProvider {
    pub fn new(runtime: Arc<TlsRuntime>) -> Self {
        SessionProvider { runtime }
    }
}

#[derive(Debug)]
pub struct SessionHostConfig {
    context: TlsContext,
}

impl SessionHostConfig {
    pub fn context(&self) -> &TlsContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TlsContext {
        &mut self.context
    }
}

impl TlsProvider for SessionProvider {
    type HostConfig = SessionHostConfig;
    type Connection = SessionConnection;

    fn name(&self) -> &'static str {
        "session"
    }

    fn new_config(&self, host: &str) -> SessionHostConfig {
        SessionHostConfig {
            context: TlsContext::new(host),
        }
    }

    fn start(&self, config: &SessionHostConfig) -> Result<(), ConfigError> {
        config.context.start(&self.runtime)
    }

    fn stop(&self, config: &SessionHostConfig) {
        config.context.stop();
    }

    fn accept(
        &self,
        config: &SessionHostConfig,
        sock: Box<dyn RawSocket>,
    ) -> Result<SessionConnection, TransportError> {
        let server_config = config
            .context
            .server_config()
            .ok_or(TransportError::NotServing)?;
        let settings = config.context.settings();
        Ok(SessionConnection {
            sock,
            config: server_config,
            conn: None,
            state: TlsState::Uninitialized,
            verify_depth: settings.verify_client().then(|| settings.verify_depth()),
            eof: false,
        })
    }
}

pub struct SessionConnection {
    sock: Box<dyn RawSocket>,
    config: Arc<ServerConfig>,
    conn: Option<ServerConnection>,
    state: TlsState,
    verify_depth: Option<usize>,
    eof: bool,
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl SessionConnection {
    fn ensure_session(&mut self) -> Result<(), TransportError> {
        if self.conn.is_none() {
            let conn = ServerConnection::new(self.config.clone())
                .map_err(|e| TransportError::Decode(e.to_string()))?;
            self.conn = Some(conn);
            self.state = TlsState::Handshaking;
        }
        Ok(())
    }

    /// Write out whatever ciphertext the session holds, stopping at would-block.
    fn push_tls(&mut self) -> Result<bool, TransportError> {
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return Ok(true),
        };
        while conn.wants_write() {
            match conn.write_tls(&mut self.sock) {
                Ok(0) => return Ok(false),
                Ok(_) => {}
                Err(e) if would_block(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn fail(&mut self, err: TransportError) -> ReadOutcome {
        log::debug!("TLS session failed: {}", err);
        self.eof = true;
        self.state = TlsState::Closing;
        ReadOutcome::Error(err)
    }

    fn note_progress(&mut self) -> Result<(), TransportError> {
        if self.state != TlsState::Handshaking {
            return Ok(());
        }
        if let Some(conn) = self.conn.as_ref() {
            if !conn.is_handshaking() {
                if let Some(depth) = self.verify_depth {
                    check_peer_depth(conn, depth)?;
                }
                self.state = TlsState::Established;
            }
        }
        Ok(())
    }
}

impl Transport for SessionConnection {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.eof || self.state == TlsState::Closed {
            return ReadOutcome::Eof;
        }
        if let Err(e) = self.ensure_session() {
            return self.fail(e);
        }
        loop {
            let conn = match self.conn.as_mut() {
                Some(c) => c,
                None => return ReadOutcome::Eof,
            };
            match conn.reader().read(buf) {
                Ok(0) if !buf.is_empty() => {
                    self.eof = true;
                    return ReadOutcome::Eof;
                }
                Ok(n) => return ReadOutcome::Data(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    return ReadOutcome::Eof;
                }
                Err(e) => return self.fail(e.into()),
            }

            match conn.read_tls(&mut self.sock) {
                Ok(0) => {
                    self.eof = true;
                    return ReadOutcome::Eof;
                }
                Ok(_) => {}
                Err(e) if would_block(&e) => return ReadOutcome::WouldBlock,
                Err(e) => return self.fail(e.into()),
            }

            if let Err(e) = conn.process_new_packets() {
                // The session queues an alert describing the failure.
                let _ = self.push_tls();
                let err = match e {
                    rustls::Error::AlertReceived(desc) => {
                        TransportError::Alert(format!("{:?}", desc))
                    }
                    other => TransportError::Decode(other.to_string()),
                };
                return self.fail(err);
            }
            if let Err(e) = self.note_progress() {
                return self.fail(e);
            }
            if let Err(e) = self.push_tls() {
                return self.fail(e);
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, TransportError> {
        if self.state == TlsState::Closed {
            return Err(TransportError::Closed);
        }
        self.ensure_session()?;
        let accepted = match self.conn.as_mut() {
            Some(conn) => conn.writer().write(buf)?,
            None => return Err(TransportError::Closed),
        };
        self.push_tls()?;
        if accepted == 0 && !buf.is_empty() {
            return Ok(WriteOutcome::Retry);
        }
        Ok(WriteOutcome::Written(accepted))
    }

    fn flush(&mut self) -> Result<bool, TransportError> {
        self.push_tls()
    }

    fn close(&mut self) {
        if self.state == TlsState::Closed {
            return;
        }
        self.state = TlsState::Closing;
        if let Some(conn) = self.conn.as_mut() {
            conn.send_close_notify();
            let _ = self.push_tls();
        }
        self.conn = None;
        self.sock.shutdown();
        self.state = TlsState::Closed;
    }

    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        self.sock.wait(interest, timeout)
    }

    fn state(&self) -> TlsState {
        self.state
    }

    fn is_secure(&self) -> bool {
        true
    }
}

impl Drop for SessionConnection {
    fn drop(&mut self) {
        self.close();
    }
}
