//! Byte-level transport (C1's wire half).
//!
//! Spec §1 frames both the XML tokenizer and the TLS transport as external
//! collaborators: the core only needs a send/receive contract. [`Transport`]
//! is that contract; [`RustlsTransport`] is the concrete outbound-TLS
//! implementation a caller gets by default, grounded on
//! `kimberlite-server/src/connection.rs`'s buffered read/write idiom
//! (`BytesMut`, explicit `WouldBlock` handling) and
//! `kimberlite-server/src/tls.rs`'s config-builder pattern, adapted from a
//! server accepting connections to a client dialing out.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use bytes::BytesMut;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};

use crate::error::{ClientError, ClientResult};

/// Minimal byte-pipe contract the event loop drives. Implementations are
/// expected to be non-blocking: `write_pending`/`read_available` return
/// immediately, reporting `WouldBlock` via `Ok(0)` rather than parking the
/// calling (event-loop) thread, per spec §4.4's "handlers must not block".
pub trait Transport: Send {
    /// Appends `data` to the outbound buffer and attempts to flush it.
    /// Returns the number of bytes actually written to the wire.
    fn write_pending(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Drains any bytes the peer has sent since the last call.
    fn read_available(&mut self) -> io::Result<Vec<u8>>;

    /// True once the peer has closed the connection or a fatal I/O error
    /// has been observed.
    fn is_closed(&self) -> bool;
}

/// TLS configuration for the outbound connection, mirroring
/// `kimberlite-server/src/tls.rs`'s `TlsConfig` builder but pointed at
/// `rustls::ClientConfig` instead of `ServerConfig` since this crate only
/// ever dials out.
pub struct TlsConfig {
    root_store: rustls::RootCertStore,
}

impl TlsConfig {
    /// Trusts the Mozilla root program bundled via `webpki-roots`, the
    /// usual default for an outbound client with no private CA.
    pub fn webpki_roots() -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self { root_store }
    }

    fn build_client_config(self) -> ClientConfig {
        ClientConfig::builder()
            .with_root_certificates(self.root_store)
            .with_no_client_auth()
    }
}

/// Outbound TLS transport over a `std::net::TcpStream`.
pub struct RustlsTransport {
    stream: StreamOwned<ClientConnection, TcpStream>,
    read_buf: BytesMut,
    closed: bool,
}

impl RustlsTransport {
    /// Opens a TCP connection to `addr` and performs the TLS handshake
    /// against `server_name`.
    pub fn connect(addr: &str, server_name: &str, tls: TlsConfig) -> ClientResult<Self> {
        let tcp = TcpStream::connect(addr)?;
        tcp.set_nonblocking(true)?;

        let config = Arc::new(tls.build_client_config());
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        let conn = ClientConnection::new(config, name).map_err(|e| ClientError::Tls(e.to_string()))?;

        Ok(Self {
            stream: StreamOwned::new(conn, tcp),
            read_buf: BytesMut::with_capacity(8192),
            closed: false,
        })
    }
}

impl Transport for RustlsTransport {
    fn write_pending(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.stream.write(data) {
            Ok(n) => {
                let _ = self.stream.flush();
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.closed = true;
                Err(e)
            }
        }
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let mut temp = [0u8; 4096];
        loop {
            match self.stream.read(&mut temp) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => self.read_buf.extend_from_slice(&temp[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.closed = true;
                    return Err(e);
                }
            }
        }
        Ok(self.read_buf.split().to_vec())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// In-memory loopback used by tests and by `SPEC_FULL.md`'s end-to-end
/// scenarios, which run against a fake peer rather than a live server.
/// One side's outbound queue is the other side's inbound queue.
#[derive(Clone)]
pub struct LoopbackTransport {
    outbound: Arc<std::sync::Mutex<Vec<u8>>>,
    inbound: Arc<std::sync::Mutex<Vec<u8>>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl LoopbackTransport {
    /// Builds a connected pair: bytes written to `.0` are read by `.1`
    /// and vice versa.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(std::sync::Mutex::new(Vec::new()));
        let b_to_a = Arc::new(std::sync::Mutex::new(Vec::new()));
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let client = LoopbackTransport {
            outbound: a_to_b.clone(),
            inbound: b_to_a.clone(),
            closed: closed.clone(),
        };
        let server = LoopbackTransport {
            outbound: b_to_a,
            inbound: a_to_b,
            closed,
        };
        (client, server)
    }
}

impl Transport for LoopbackTransport {
    fn write_pending(&mut self, data: &[u8]) -> io::Result<usize> {
        self.outbound.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        Ok(std::mem::take(&mut *self.inbound.lock().unwrap()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_pair_delivers_bytes_to_the_peer() {
        let (mut client, mut server) = LoopbackTransport::pair();
        client.write_pending(b"hello").unwrap();
        let received = server.read_available().unwrap();
        assert_eq!(received, b"hello");
        assert!(server.read_available().unwrap().is_empty());
    }

    #[test]
    fn loopback_is_bidirectional() {
        let (mut client, mut server) = LoopbackTransport::pair();
        server.write_pending(b"pong").unwrap();
        assert_eq!(client.read_available().unwrap(), b"pong");
    }
}
