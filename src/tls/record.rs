//! Provider that owns the ciphertext and plaintext buffers itself.
//!
//! Ciphertext read from the socket accumulates in `in_sock` until one whole
//! TLS record is present. That record alone is handed to rustls, and the
//! decoded plaintext lands in a scratch buffer sized from the caller's
//! request. Anything the caller could not take waits in `in_plain`.
//! Outgoing records are encoded into `out_sock` and flushed by hand, so a
//! short write leaves bytes there until the caller retries.

use super::buffer::{RecordBuffer, TailWriter};
use super::context::{check_peer_depth, TlsContext};
use super::{Interest, RawSocket, ReadOutcome, TlsProvider, TlsRuntime, TlsState, Transport, WriteOutcome};
use crate::error::{ConfigError, TransportError};
use bytes::{Buf, BytesMut};
use rustls::{AlertDescription, ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Largest plaintext a single write may carry.
pub const MAX_PLAINTEXT: usize = 16384;

const RECORD_HEADER: usize = 5;

/// Buffer sizing and flush bounds for record-buffered connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLimits {
    pub initial: usize,
    pub ceiling: usize,
    pub flush_timeout: Duration,
}

impl Default for RecordLimits {
    fn default() -> Self {
        RecordLimits {
            initial: 4096,
            ceiling: 64 * 1024,
            flush_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordProvider {
    runtime: Arc<TlsRuntime>,
    limits: RecordLimits,
}

impl RecordProvider {
    pub fn new(runtime: Arc<TlsRuntime>, limits: RecordLimits) -> Self {
        RecordProvider { runtime, limits }
    }
}

#[derive(Debug)]
pub struct RecordHostConfig {
    context: TlsContext,
    limits: RecordLimits,
}

impl RecordHostConfig {
    pub fn context(&self) -> &TlsContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut TlsContext {
        &mut self.context
    }

    pub fn limits(&self) -> RecordLimits {
        self.limits
    }
}

impl TlsProvider for RecordProvider {
    type HostConfig = RecordHostConfig;
    type Connection = RecordConnection;

    fn name(&self) -> &'static str {
        "record"
    }

    fn new_config(&self, host: &str) -> RecordHostConfig {
        RecordHostConfig {
            context: TlsContext::new(host),
            limits: self.limits,
        }
    }

    fn start(&self, config: &RecordHostConfig) -> Result<(), ConfigError> {
        config.context.start(&self.runtime)
    }

    fn stop(&self, config: &RecordHostConfig) {
        config.context.stop();
    }

    fn accept(
        &self,
        config: &RecordHostConfig,
        sock: Box<dyn RawSocket>,
    ) -> Result<RecordConnection, TransportError> {
        let server_config = config
            .context
            .server_config()
            .ok_or(TransportError::NotServing)?;
        let settings = config.context.settings();
        let verify_depth = settings.verify_client().then(|| settings.verify_depth());
        Ok(RecordConnection::new(
            sock,
            server_config,
            config.limits,
            verify_depth,
        ))
    }
}

/// What one pass over the buffered ciphertext produced.
enum Decoded {
    /// A whole record was consumed.
    Record {
        plaintext: usize,
        response: bool,
        closed: bool,
    },
    /// More ciphertext is needed before a record is complete.
    Partial,
    Alert(AlertDescription),
    Failed(TransportError),
}

pub struct RecordConnection {
    sock: Box<dyn RawSocket>,
    config: Arc<ServerConfig>,
    conn: Option<ServerConnection>,
    state: TlsState,
    in_sock: RecordBuffer,
    in_plain: BytesMut,
    out_sock: RecordBuffer,
    pending_write: Option<usize>,
    limits: RecordLimits,
    verify_depth: Option<usize>,
    eof: bool,
}

impl RecordConnection {
    pub fn new(
        sock: Box<dyn RawSocket>,
        config: Arc<ServerConfig>,
        limits: RecordLimits,
        verify_depth: Option<usize>,
    ) -> Self {
        RecordConnection {
            sock,
            config,
            conn: None,
            state: TlsState::Uninitialized,
            in_sock: RecordBuffer::new(limits.initial, limits.ceiling),
            in_plain: BytesMut::new(),
            out_sock: RecordBuffer::new(limits.initial, limits.ceiling),
            pending_write: None,
            limits,
            verify_depth,
            eof: false,
        }
    }

    pub fn buffered_ciphertext(&self) -> usize {
        self.in_sock.len()
    }

    pub fn buffered_plaintext(&self) -> usize {
        self.in_plain.len()
    }

    pub fn input_capacity(&self) -> usize {
        self.in_sock.capacity()
    }

    fn ensure_session(&mut self) -> Result<(), TransportError> {
        if self.conn.is_none() {
            let conn = ServerConnection::new(self.config.clone())
                .map_err(|e| TransportError::Decode(e.to_string()))?;
            self.conn = Some(conn);
            self.state = TlsState::Handshaking;
        }
        Ok(())
    }

    /// Hand exactly one complete record to the session, if one is buffered.
    fn decode_one(&mut self) -> Decoded {
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return Decoded::Failed(TransportError::Closed),
        };
        let data = self.in_sock.data();
        if data.len() < RECORD_HEADER {
            return Decoded::Partial;
        }
        let total = RECORD_HEADER + u16::from_be_bytes([data[3], data[4]]) as usize;
        if data.len() < total {
            return Decoded::Partial;
        }

        let mut fed = 0;
        while fed < total {
            let mut record = &data[fed..total];
            match conn.read_tls(&mut record) {
                Ok(0) => break,
                Ok(n) => fed += n,
                Err(e) => return Decoded::Failed(TransportError::Decode(e.to_string())),
            }
        }
        self.in_sock.consume(fed);

        match conn.process_new_packets() {
            Ok(io) => Decoded::Record {
                plaintext: io.plaintext_bytes_to_read(),
                response: conn.wants_write(),
                closed: io.peer_has_closed(),
            },
            Err(rustls::Error::AlertReceived(desc)) => Decoded::Alert(desc),
            Err(e) => Decoded::Failed(TransportError::Decode(e.to_string())),
        }
    }

    /// Encode whatever the session has queued into `out_sock`.
    fn encode_pending(&mut self) -> Result<(), TransportError> {
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };
        while conn.wants_write() {
            if self.out_sock.tail_len() == 0 {
                self.out_sock.compact();
                if self.out_sock.tail_len() == 0 {
                    self.out_sock.grow()?;
                }
            }
            let n = conn.write_tls(&mut TailWriter(&mut self.out_sock))?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Write buffered ciphertext without blocking. `Ok(true)` once empty.
    fn flush_nonblocking(&mut self) -> Result<bool, TransportError> {
        while !self.out_sock.is_empty() {
            match self.sock.write(self.out_sock.data()) {
                Ok(0) => return Ok(false),
                Ok(n) => self.out_sock.consume(n),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return Ok(false)
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.out_sock.release();
        Ok(true)
    }

    /// Send a handshake response in full, blocking for at most the flush
    /// timeout if the socket cannot take it at once.
    fn flush_response(&mut self) -> Result<(), TransportError> {
        self.encode_pending()?;
        if self.flush_nonblocking()? {
            return Ok(());
        }
        self.sock
            .set_blocking(true, Some(self.limits.flush_timeout))?;
        let result = self.flush_blocking();
        if let Err(e) = self.sock.set_blocking(false, None) {
            log::warn!("Could not restore non-blocking mode: {}", e);
        }
        result
    }

    fn flush_blocking(&mut self) -> Result<(), TransportError> {
        while !self.out_sock.is_empty() {
            match self.sock.write(self.out_sock.data()) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => self.out_sock.consume(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(TransportError::FlushTimeout(self.out_sock.len()))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn fail(&mut self, err: TransportError) -> ReadOutcome {
        log::debug!("TLS connection failed: {}", err);
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
                log::debug!(
                    "TLS established ({:?})",
                    conn.negotiated_cipher_suite().map(|s| s.suite())
                );
            }
        }
        Ok(())
    }

    /// Copy up to `plaintext` decoded bytes into the caller's buffer,
    /// keeping the rest for later calls.
    fn deliver(&mut self, buf: &mut [u8], plaintext: usize) -> ReadOutcome {
        let mut scratch_len = buf.len().max(1);
        while scratch_len < plaintext {
            scratch_len *= 2;
            if scratch_len > self.limits.ceiling {
                return self.fail(TransportError::BufferCeiling {
                    ceiling: self.limits.ceiling,
                });
            }
        }
        let mut scratch = vec![0u8; scratch_len];
        let mut got = 0;
        if let Some(conn) = self.conn.as_mut() {
            while got < plaintext {
                match conn.reader().read(&mut scratch[got..]) {
                    Ok(0) => break,
                    Ok(n) => got += n,
                    Err(_) => break,
                }
            }
        }
        let n = got.min(buf.len());
        buf[..n].copy_from_slice(&scratch[..n]);
        if got > n {
            self.in_plain.extend_from_slice(&scratch[n..got]);
        }
        ReadOutcome::Data(n)
    }

    fn read_records(&mut self, buf: &mut [u8]) -> ReadOutcome {
        self.in_sock.compact();
        let mut last_read = None;
        if self.in_sock.is_empty() {
            match self.in_sock.fill_from(&mut *self.sock) {
                Ok(0) => {
                    self.eof = true;
                    return ReadOutcome::Eof;
                }
                Ok(n) => last_read = Some(n),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return ReadOutcome::WouldBlock
                }
                Err(e) => return self.fail(e.into()),
            }
        }

        let mut first_retry = true;
        loop {
            match self.decode_one() {
                Decoded::Record {
                    plaintext,
                    response,
                    closed,
                } => {
                    if response {
                        if let Err(e) = self.flush_response() {
                            return self.fail(e);
                        }
                    }
                    if let Err(e) = self.note_progress() {
                        return self.fail(e);
                    }
                    if plaintext > 0 {
                        return self.deliver(buf, plaintext);
                    }
                    if closed {
                        self.eof = true;
                        return ReadOutcome::Eof;
                    }
                    if self.in_sock.is_empty() {
                        return ReadOutcome::WouldBlock;
                    }
                }
                Decoded::Partial => {
                    if !first_retry && last_read == Some(0) {
                        return ReadOutcome::WouldBlock;
                    }
                    first_retry = false;
                    self.in_sock.compact();
                    if self.in_sock.is_full() {
                        if let Err(e) = self.in_sock.grow() {
                            log::warn!(
                                "TLS record exceeds buffer ceiling of {} bytes",
                                self.in_sock.ceiling()
                            );
                            return self.fail(e);
                        }
                    }
                    match self.in_sock.fill_from(&mut *self.sock) {
                        Ok(0) => {
                            self.eof = true;
                            return ReadOutcome::Eof;
                        }
                        Ok(n) => last_read = Some(n),
                        Err(e)
                            if e.kind() == io::ErrorKind::WouldBlock
                                || e.kind() == io::ErrorKind::Interrupted =>
                        {
                            last_read = Some(0)
                        }
                        Err(e) => return self.fail(e.into()),
                    }
                }
                Decoded::Alert(AlertDescription::CloseNotify) => {
                    self.eof = true;
                    return ReadOutcome::Eof;
                }
                Decoded::Alert(desc) => {
                    return self.fail(TransportError::Alert(format!("{:?}", desc)));
                }
                Decoded::Failed(e) => {
                    // Let the peer see our alert if the socket will take it.
                    if self.encode_pending().is_ok() {
                        let _ = self.flush_nonblocking();
                    }
                    return self.fail(e);
                }
            }
        }
    }
}

impl Transport for RecordConnection {
    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if !self.in_plain.is_empty() {
            let n = buf.len().min(self.in_plain.len());
            buf[..n].copy_from_slice(&self.in_plain[..n]);
            self.in_plain.advance(n);
            if self.in_plain.is_empty() {
                self.in_plain = BytesMut::new();
            }
            return ReadOutcome::Data(n);
        }
        if self.eof || self.state == TlsState::Closed {
            return ReadOutcome::Eof;
        }
        if let Err(e) = self.ensure_session() {
            return self.fail(e);
        }
        self.read_records(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<WriteOutcome, TransportError> {
        if self.state == TlsState::Closed {
            return Err(TransportError::Closed);
        }
        let len = buf.len().min(MAX_PLAINTEXT);
        if let Some(pending) = self.pending_write {
            if pending != len {
                return Err(TransportError::WriteMismatch { pending, got: len });
            }
            if self.flush_nonblocking()? {
                self.pending_write = None;
                return Ok(WriteOutcome::Written(len));
            }
            return Ok(WriteOutcome::Retry);
        }

        self.ensure_session()?;
        if let Some(conn) = self.conn.as_mut() {
            conn.writer().write_all(&buf[..len])?;
        }
        self.encode_pending()?;
        if self.flush_nonblocking()? {
            Ok(WriteOutcome::Written(len))
        } else {
            self.pending_write = Some(len);
            Ok(WriteOutcome::Retry)
        }
    }

    fn flush(&mut self) -> Result<bool, TransportError> {
        self.encode_pending()?;
        self.flush_nonblocking()
    }

    fn close(&mut self) {
        if self.state == TlsState::Closed {
            return;
        }
        self.state = TlsState::Closing;
        if let Some(conn) = self.conn.as_mut() {
            conn.send_close_notify();
            if self.encode_pending().is_ok() {
                let _ = self.flush_nonblocking();
            }
        }
        self.conn = None;
        self.in_sock.release();
        self.out_sock.release();
        self.in_plain = BytesMut::new();
        self.pending_write = None;
        self.sock.shutdown();
        self.state = TlsState::Closed;
    }

    fn wait(&mut self, interest: Interest, timeout: Duration) -> io::Result<bool> {
        if interest == Interest::Read && !self.in_plain.is_empty() {
            return Ok(true);
        }
        self.sock.wait(interest, timeout)
    }

    fn state(&self) -> TlsState {
        self.state
    }

    fn is_secure(&self) -> bool {
        true
    }
}

impl Drop for RecordConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::testing::*;
    use rustls::ClientConnection;
    use std::path::PathBuf;

    fn started_config(limits: RecordLimits) -> (tempfile::TempDir, PathBuf, RecordProvider, RecordHostConfig) {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_self_signed(dir.path(), "localhost");
        let provider = RecordProvider::new(TlsRuntime::new(), limits);
        let mut config = provider.new_config("localhost");
        config.context_mut().settings_mut().set_cert_file(&cert).set_key_file(key);
        provider.start(&config).unwrap();
        (dir, cert, provider, config)
    }

    fn established(limits: RecordLimits) -> (tempfile::TempDir, MemPipe, ClientConnection, RecordConnection) {
        let (dir, cert, provider, config) = started_config(limits);
        let pipe = MemPipe::new();
        let mut server = provider.accept(&config, pipe.server_end()).unwrap();
        let mut client = client_for(&cert, "localhost");
        handshake(&mut client, &mut server, &pipe);
        (dir, pipe, client, server)
    }

    #[test]
    fn test_handshake_is_lazy() {
        let (_dir, _cert, provider, config) = started_config(RecordLimits::default());
        let pipe = MemPipe::new();
        let server = provider.accept(&config, pipe.server_end()).unwrap();
        assert_eq!(server.state(), TlsState::Uninitialized);
        assert_eq!(pipe.pending_to_client(), 0);
    }

    #[test]
    fn test_accept_requires_started_context() {
        let provider = RecordProvider::new(TlsRuntime::new(), RecordLimits::default());
        let config = provider.new_config("idle");
        let pipe = MemPipe::new();
        assert!(matches!(
            provider.accept(&config, pipe.server_end()),
            Err(TransportError::NotServing)
        ));
    }

    #[test]
    fn test_handshake_reaches_established() {
        let (_dir, _pipe, _client, server) = established(RecordLimits::default());
        assert_eq!(server.state(), TlsState::Established);
    }

    #[test]
    fn test_small_reads_drain_record_exactly() {
        let (_dir, pipe, mut client, mut server) = established(RecordLimits::default());
        let message: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        client.writer().write_all(&message).unwrap();
        client_send(&mut client, &pipe);

        let mut received = Vec::new();
        let mut buf = [0u8; 7];
        for _ in 0..1000 {
            match server.read(&mut buf) {
                ReadOutcome::Data(n) => received.extend_from_slice(&buf[..n]),
                ReadOutcome::WouldBlock => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(received, message);
        assert_eq!(server.buffered_plaintext(), 0);
    }

    #[test]
    fn test_record_split_across_socket_reads() {
        let (_dir, pipe, mut client, mut server) = established(RecordLimits::default());
        client.writer().write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut wire = Vec::new();
        while client.wants_write() {
            client.write_tls(&mut wire).unwrap();
        }

        let mut buf = [0u8; 64];
        pipe.push_to_server(&wire[..3]);
        assert!(matches!(server.read(&mut buf), ReadOutcome::WouldBlock));
        assert_eq!(server.buffered_ciphertext(), 3);
        pipe.push_to_server(&wire[3..]);
        match server.read(&mut buf) {
            ReadOutcome::Data(n) => assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n\r\n"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_server_write_reaches_client() {
        let (_dir, pipe, mut client, mut server) = established(RecordLimits::default());
        assert_eq!(server.write(b"hello").unwrap(), WriteOutcome::Written(5));
        client_receive(&mut client, &pipe);
        assert_eq!(client_plaintext(&mut client), b"hello");
    }

    #[test]
    fn test_short_write_requires_same_length() {
        let (_dir, pipe, mut client, mut server) = established(RecordLimits::default());
        pipe.set_budget(Some(10));
        let body = vec![b'x'; 100];
        assert_eq!(server.write(&body).unwrap(), WriteOutcome::Retry);

        match server.write(&body[..50]) {
            Err(TransportError::WriteMismatch { pending, got }) => {
                assert_eq!(pending, 100);
                assert_eq!(got, 50);
            }
            other => panic!("unexpected {:?}", other),
        }

        pipe.set_budget(None);
        assert_eq!(server.write(&body).unwrap(), WriteOutcome::Written(100));
        client_receive(&mut client, &pipe);
        assert_eq!(client_plaintext(&mut client), body);
    }

    #[test]
    fn test_write_truncates_to_record_size() {
        let (_dir, pipe, mut client, mut server) = established(RecordLimits::default());
        let body = vec![b'y'; MAX_PLAINTEXT + 100];
        assert_eq!(
            server.write(&body).unwrap(),
            WriteOutcome::Written(MAX_PLAINTEXT)
        );
        client_receive(&mut client, &pipe);
        assert_eq!(client_plaintext(&mut client).len(), MAX_PLAINTEXT);
    }

    #[test]
    fn test_handshake_response_flushes_blocking() {
        let (_dir, cert, provider, config) = started_config(RecordLimits::default());
        let pipe = MemPipe::new();
        let mut server = provider.accept(&config, pipe.server_end()).unwrap();
        let mut client = client_for(&cert, "localhost");
        pipe.set_budget(Some(16));
        handshake(&mut client, &mut server, &pipe);
        assert!(pipe.blocking_switches() > 0);
        assert_eq!(server.state(), TlsState::Established);
    }

    #[test]
    fn test_oversized_record_hits_ceiling() {
        let limits = RecordLimits {
            initial: 1024,
            ceiling: 4096,
            flush_timeout: Duration::from_secs(1),
        };
        let (_dir, _cert, provider, config) = started_config(limits);
        let pipe = MemPipe::new();
        let mut server = provider.accept(&config, pipe.server_end()).unwrap();

        let mut crafted = vec![0x16, 0x03, 0x03, 0xff, 0xff];
        crafted.extend(std::iter::repeat(0u8).take(8192));
        pipe.push_to_server(&crafted);

        let mut buf = [0u8; 16];
        match server.read(&mut buf) {
            ReadOutcome::Error(TransportError::BufferCeiling { ceiling }) => {
                assert_eq!(ceiling, 4096)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(server.input_capacity() <= 4096);
        assert!(matches!(server.read(&mut buf), ReadOutcome::Eof));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let (_dir, _cert, provider, config) = started_config(RecordLimits::default());
        let pipe = MemPipe::new();
        let mut server = provider.accept(&config, pipe.server_end()).unwrap();
        pipe.push_to_server(&[0x99, 0x03, 0x03, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef]);
        let mut buf = [0u8; 16];
        assert!(matches!(
            server.read(&mut buf),
            ReadOutcome::Error(TransportError::Decode(_))
        ));
    }

    #[test]
    fn test_close_notify_is_eof() {
        let (_dir, pipe, mut client, mut server) = established(RecordLimits::default());
        client.send_close_notify();
        client_send(&mut client, &pipe);
        let mut buf = [0u8; 16];
        assert!(matches!(server.read(&mut buf), ReadOutcome::Eof));
    }

    #[test]
    fn test_close_sends_alert_and_releases() {
        let (_dir, pipe, mut client, mut server) = established(RecordLimits::default());
        server.close();
        assert_eq!(server.state(), TlsState::Closed);
        assert_eq!(server.input_capacity(), 0);
        client_receive(&mut client, &pipe);
        let mut buf = [0u8; 8];
        assert!(matches!(client.reader().read(&mut buf), Ok(0)));
    }

    #[test]
    fn test_close_with_refused_alert_still_releases() {
        let (_dir, pipe, _client, mut server) = established(RecordLimits::default());
        pipe.set_budget(Some(0));
        server.close();
        assert_eq!(server.state(), TlsState::Closed);
        assert_eq!(server.buffered_ciphertext(), 0);
    }
}
