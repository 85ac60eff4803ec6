//! Non-blocking TLS connection driven by readiness polling
//!
//! A [`TlsConnection`] owns a non-blocking TCP socket, a rustls session and
//! two ring buffers. All traffic moves through [`TlsConnection::process_io`],
//! which polls the socket once and then services whichever direction became
//! ready. Failures on the steady-state path are reported through
//! [`ConnectionStatus`] rather than errors, and the socket is torn down as
//! soon as any status other than `NoError` is recorded.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::poll::{self, Interest};
use crate::ring::RingBuffer;

/// Segment count for the inbound plaintext ring
const INPUT_RING_SEGMENTS: usize = 64;
/// Segment count for the outbound staging ring
const OUTPUT_RING_SEGMENTS: usize = 16;
/// Poll timeout used while flushing backpressured writes
const FLUSH_POLL_TIMEOUT: Duration = Duration::from_millis(10);
/// Flush attempts before a stalled peer is treated as a write failure
const MAX_FLUSH_ATTEMPTS: usize = 100;

/// Failure to establish a connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid server name {0:?}")]
    ServerName(String),
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },
    #[error("tls session setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Health of a connection after the most recent I/O attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    NoError,
    ConnectError,
    ReadError,
    WriteError,
    PollError,
    PollHangup,
    PollInvalid,
    SocketError,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::NoError => "no error",
            ConnectionStatus::ConnectError => "connect error",
            ConnectionStatus::ReadError => "read error",
            ConnectionStatus::WriteError => "write error",
            ConnectionStatus::PollError => "poll error",
            ConnectionStatus::PollHangup => "peer hung up",
            ConnectionStatus::PollInvalid => "invalid descriptor",
            ConnectionStatus::SocketError => "socket error",
        };
        f.write_str(name)
    }
}

/// Shared client-side TLS configuration, built once per process
fn tls_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                rustls::ClientConfig::builder_with_protocol_versions(&[
                    &rustls::version::TLS13,
                    &rustls::version::TLS12,
                ])
                .with_root_certificates(roots)
                .with_no_client_auth(),
            )
        })
        .clone()
}

fn strip_scheme(host: &str) -> &str {
    host.trim_start_matches("https://")
        .trim_start_matches("wss://")
        .trim_end_matches('/')
}

fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    let enable: libc::c_int = 1;
    // Safety: the fd is open and the option buffer is a c_int
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A TLS session over a non-blocking TCP socket
pub struct TlsConnection {
    socket: Option<TcpStream>,
    tls: Option<rustls::ClientConnection>,
    status: ConnectionStatus,
    input_ring: RingBuffer,
    output_ring: RingBuffer,
    // Plaintext the output ring already handed out but the TLS session did
    // not accept. The ring consumes whole segments, so the unaccepted tail
    // is carried here until the session drains.
    staged: Vec<u8>,
    bytes_read: u64,
    // rustls may demand the opposite readiness from the direction being
    // serviced, for example a write that first needs to read a handshake
    // flight. These flags remember which handler to resume once the socket
    // reports the readiness it asked for.
    write_want_read: bool,
    write_want_write: bool,
    read_want_read: bool,
    read_want_write: bool,
}

impl TlsConnection {
    /// Establish a TLS connection to `host:port`, completing the handshake
    /// on a blocking socket before switching to non-blocking mode.
    pub fn connect(host: &str, port: u16) -> Result<Self, ConnectError> {
        assert!(!host.is_empty(), "host must not be empty");
        let host = strip_scheme(host);

        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ConnectError::Resolve {
                host: host.to_owned(),
                port,
            })?;
        let mut socket = TcpStream::connect(addr)?;
        socket.set_nodelay(true)?;
        enable_keepalive(&socket)?;

        let server_name = rustls::pki_types::ServerName::try_from(host.to_owned())
            .map_err(|_| ConnectError::ServerName(host.to_owned()))?;
        let mut tls = rustls::ClientConnection::new(tls_config(), server_name)?;
        while tls.is_handshaking() {
            tls.complete_io(&mut socket)?;
        }
        socket.set_nonblocking(true)?;
        debug!(host, port, "tls connection established");

        Ok(TlsConnection {
            socket: Some(socket),
            tls: Some(tls),
            status: ConnectionStatus::NoError,
            input_ring: RingBuffer::new(INPUT_RING_SEGMENTS),
            output_ring: RingBuffer::new(OUTPUT_RING_SEGMENTS),
            staged: Vec::new(),
            bytes_read: 0,
            write_want_read: false,
            write_want_write: false,
            read_want_read: false,
            read_want_write: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Total plaintext bytes handed to the caller so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Stage `data` for transmission. With `priority` set the data is also
    /// flushed to the socket before returning. Backpressure from a full
    /// staging ring is absorbed by polling for writability a bounded number
    /// of times; a peer that never drains turns into a write error.
    pub fn write_data(&mut self, data: &[u8], priority: bool) -> ConnectionStatus {
        if self.socket.is_none() {
            return self.status;
        }
        let mut remaining = data;
        let mut attempts = 0;
        while !remaining.is_empty() {
            let chunk_len = remaining.len().min(self.output_ring.writable_space());
            if chunk_len == 0 {
                attempts += 1;
                if attempts > MAX_FLUSH_ATTEMPTS {
                    warn!("output ring never drained, giving up on write");
                    self.status = ConnectionStatus::WriteError;
                    self.disconnect();
                    return self.status;
                }
                self.process_io(FLUSH_POLL_TIMEOUT);
                if self.status != ConnectionStatus::NoError {
                    return self.status;
                }
                continue;
            }
            if self.output_ring.write(&remaining[..chunk_len]).is_err() {
                self.status = ConnectionStatus::WriteError;
                self.disconnect();
                return self.status;
            }
            remaining = &remaining[chunk_len..];
        }
        if priority {
            attempts = 0;
            while self.has_pending_output() {
                attempts += 1;
                if attempts > MAX_FLUSH_ATTEMPTS {
                    warn!("priority flush stalled, giving up on write");
                    self.status = ConnectionStatus::WriteError;
                    self.disconnect();
                    return self.status;
                }
                self.process_io(FLUSH_POLL_TIMEOUT);
                if self.status != ConnectionStatus::NoError {
                    return self.status;
                }
            }
        }
        self.status
    }

    fn has_pending_output(&self) -> bool {
        if self.output_ring.used_space() > 0 || !self.staged.is_empty() {
            return true;
        }
        match &self.tls {
            Some(tls) => tls.wants_write(),
            None => false,
        }
    }

    /// Poll the socket once and service whichever direction became ready.
    /// Returns the connection status afterwards; anything other than
    /// `NoError` means the socket has been torn down.
    pub fn process_io(&mut self, timeout: Duration) -> ConnectionStatus {
        let Some(socket) = &self.socket else {
            return self.status;
        };
        let mut interest = Interest::READ;
        if self.has_pending_output() || self.write_want_write || self.read_want_write {
            interest.write = true;
        }
        let readiness = match poll::wait(socket.as_raw_fd(), interest, timeout) {
            Ok(Some(readiness)) => readiness,
            Ok(None) => return self.status,
            Err(err) => {
                warn!(%err, "poll failed");
                self.status = ConnectionStatus::PollError;
                self.disconnect();
                return self.status;
            }
        };
        if readiness.invalid {
            self.status = ConnectionStatus::PollInvalid;
        } else if readiness.hangup {
            self.status = ConnectionStatus::PollHangup;
        } else if readiness.error {
            self.status = ConnectionStatus::SocketError;
        }
        if self.status != ConnectionStatus::NoError {
            self.disconnect();
            return self.status;
        }

        if readiness.writable {
            if self.write_want_write {
                self.write_want_write = false;
                self.process_write_data();
            } else if self.read_want_write {
                self.read_want_write = false;
                self.process_read_data();
            } else {
                self.process_write_data();
            }
        }
        if readiness.readable && self.status == ConnectionStatus::NoError {
            if self.read_want_read {
                self.read_want_read = false;
                self.process_read_data();
            } else if self.write_want_read {
                self.write_want_read = false;
                self.process_write_data();
            } else {
                self.process_read_data();
            }
        }
        if self.status != ConnectionStatus::NoError {
            self.disconnect();
        }
        self.status
    }

    /// Move staged plaintext into the TLS session and push ciphertext to the
    /// socket until it would block. The session caps how much plaintext it
    /// buffers, so plaintext is fed and ciphertext flushed in alternating
    /// rounds until both the carry and the ring are empty.
    fn process_write_data(&mut self) {
        let (Some(socket), Some(tls)) = (&mut self.socket, &mut self.tls) else {
            return;
        };
        loop {
            if let Err(err) =
                feed_plaintext(&mut self.staged, &mut self.output_ring, &mut tls.writer())
            {
                warn!(%err, "tls writer rejected plaintext");
                self.status = ConnectionStatus::WriteError;
                return;
            }
            let mut flushed = false;
            while tls.wants_write() {
                match tls.write_tls(socket) {
                    Ok(0) => {
                        self.status = ConnectionStatus::WriteError;
                        return;
                    }
                    Ok(written) => {
                        flushed = true;
                        trace!(written, "flushed tls bytes");
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.write_want_write = true;
                        return;
                    }
                    Err(err) => {
                        warn!(%err, "socket write failed");
                        self.status = ConnectionStatus::WriteError;
                        return;
                    }
                }
            }
            if self.staged.is_empty() && self.output_ring.used_space() == 0 {
                break;
            }
            if !flushed {
                // The session is full but nothing left the socket either;
                // wait for writability instead of spinning.
                self.write_want_write = true;
                return;
            }
        }
        if tls.is_handshaking() && tls.wants_read() {
            self.write_want_read = true;
        }
    }

    /// Pull ciphertext from the socket, decrypt it and stage the plaintext in
    /// the inbound ring. Stops when the socket would block or the ring is
    /// full; a full ring simply leaves ciphertext queued in the kernel.
    fn process_read_data(&mut self) {
        let (Some(socket), Some(tls)) = (&mut self.socket, &mut self.tls) else {
            return;
        };
        let mut peer_closed = false;
        while !self.input_ring.is_full() && !peer_closed {
            match tls.read_tls(socket) {
                Ok(0) => peer_closed = true,
                Ok(received) => trace!(received, "pulled tls bytes"),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.read_want_read = true;
                    break;
                }
                Err(err) => {
                    warn!(%err, "socket read failed");
                    self.status = ConnectionStatus::ReadError;
                    return;
                }
            }
            let state = match tls.process_new_packets() {
                Ok(state) => state,
                Err(err) => {
                    warn!(%err, "tls session error");
                    self.status = ConnectionStatus::ReadError;
                    return;
                }
            };
            if state.peer_has_closed() {
                peer_closed = true;
            }
            let mut to_read = state.plaintext_bytes_to_read();
            while to_read > 0 {
                let Some(slot) = self.input_ring.write_slot() else {
                    break;
                };
                match tls.reader().read(slot) {
                    Ok(0) => break,
                    Ok(copied) => {
                        self.input_ring.commit(copied);
                        to_read = to_read.saturating_sub(copied);
                    }
                    Err(err) => {
                        warn!(%err, "tls reader failed");
                        self.status = ConnectionStatus::ReadError;
                        return;
                    }
                }
            }
            if tls.is_handshaking() && tls.wants_write() {
                self.read_want_write = true;
                break;
            }
        }
        if peer_closed {
            debug!("peer closed the tls session");
            self.disconnect_socket_only();
        }
    }

    /// Decrypted bytes received so far, consumed from the inbound ring. The
    /// returned slice stays valid until the next write into the ring.
    pub fn read_data(&mut self) -> &[u8] {
        let data = self.input_ring.read_data();
        self.bytes_read += data.len() as u64;
        data
    }

    /// Tear down the socket and session. Staged output is discarded; already
    /// decrypted input stays readable. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        self.disconnect_socket_only();
        self.output_ring.clear();
        self.staged.clear();
        self.write_want_read = false;
        self.write_want_write = false;
        self.read_want_read = false;
        self.read_want_write = false;
    }

    fn disconnect_socket_only(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
        self.tls = None;
    }
}

/// Feed plaintext from `staged` and then `ring` into `writer`, honoring short
/// writes. A zero-length write means the writer cannot take more right now;
/// whatever the ring handed out but the writer refused is parked in `staged`
/// for the next round.
fn feed_plaintext<W: Write>(
    staged: &mut Vec<u8>,
    ring: &mut RingBuffer,
    writer: &mut W,
) -> io::Result<()> {
    while !staged.is_empty() {
        let accepted = writer.write(staged)?;
        if accepted == 0 {
            return Ok(());
        }
        staged.drain(..accepted);
    }
    while ring.used_space() > 0 {
        let chunk = ring.read_data();
        let mut offset = 0;
        while offset < chunk.len() {
            let accepted = writer.write(&chunk[offset..])?;
            if accepted == 0 {
                staged.extend_from_slice(&chunk[offset..]);
                return Ok(());
            }
            offset += accepted;
        }
    }
    Ok(())
}

/// Poll every connection in `connections` with a single syscall and service
/// the ones that became ready. Returns the keys whose connections failed and
/// should be dropped by the caller.
pub fn process_io_batch<K>(
    connections: &mut HashMap<K, TlsConnection>,
    timeout: Duration,
) -> Vec<K>
where
    K: Clone + Eq + std::hash::Hash,
{
    let mut keys = Vec::with_capacity(connections.len());
    let mut fds = Vec::with_capacity(connections.len());
    let mut dead = Vec::new();
    for (key, connection) in connections.iter() {
        let Some(socket) = &connection.socket else {
            dead.push(key.clone());
            continue;
        };
        let mut interest = Interest::READ;
        if connection.has_pending_output()
            || connection.write_want_write
            || connection.read_want_write
        {
            interest.write = true;
        }
        keys.push(key.clone());
        fds.push((socket.as_raw_fd(), interest));
    }
    if fds.is_empty() {
        return dead;
    }
    let ready = match poll::wait_many(&fds, timeout) {
        Ok(Some(ready)) => ready,
        Ok(None) => return dead,
        Err(err) => {
            warn!(%err, "batch poll failed");
            for key in &keys {
                if let Some(connection) = connections.get_mut(key) {
                    connection.status = ConnectionStatus::PollError;
                    connection.disconnect();
                }
            }
            dead.extend(keys);
            return dead;
        }
    };
    for (key, readiness) in keys.into_iter().zip(ready) {
        let Some(connection) = connections.get_mut(&key) else {
            continue;
        };
        if readiness.invalid {
            connection.status = ConnectionStatus::PollInvalid;
        } else if readiness.hangup {
            connection.status = ConnectionStatus::PollHangup;
        } else if readiness.error {
            connection.status = ConnectionStatus::SocketError;
        }
        if connection.status != ConnectionStatus::NoError {
            connection.disconnect();
            dead.push(key);
            continue;
        }
        if readiness.writable {
            connection.process_write_data();
        }
        if readiness.readable && connection.status == ConnectionStatus::NoError {
            connection.process_read_data();
        }
        if connection.status != ConnectionStatus::NoError {
            connection.disconnect();
            dead.push(key);
        }
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_scheme_variants() {
        assert_eq!(strip_scheme("https://api.courier.chat/"), "api.courier.chat");
        assert_eq!(strip_scheme("wss://gateway.courier.chat"), "gateway.courier.chat");
        assert_eq!(strip_scheme("api.courier.chat"), "api.courier.chat");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::NoError.to_string(), "no error");
        assert_eq!(ConnectionStatus::PollHangup.to_string(), "peer hung up");
    }

    #[test]
    #[should_panic(expected = "host must not be empty")]
    fn test_connect_rejects_empty_host() {
        let _ = TlsConnection::connect("", 443);
    }

    #[test]
    fn test_connect_error_on_unresolvable_host() {
        let result = TlsConnection::connect("host.invalid", 443);
        assert!(result.is_err());
    }

    /// Accepts bytes up to a fixed capacity and then reports short writes,
    /// like a TLS session whose plaintext buffer is full.
    struct CappedWriter {
        accepted: Vec<u8>,
        capacity: usize,
    }

    impl Write for CappedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let take = (self.capacity - self.accepted.len()).min(buf.len());
            self.accepted.extend_from_slice(&buf[..take]);
            Ok(take)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_feed_plaintext_carries_bytes_past_writer_capacity() {
        let mut ring = RingBuffer::new(16);
        let payload = vec![7u8; 100_000];
        ring.write(&payload).unwrap();
        let mut staged = Vec::new();
        let mut writer = CappedWriter {
            accepted: Vec::new(),
            capacity: 64 * 1024,
        };

        feed_plaintext(&mut staged, &mut ring, &mut writer).unwrap();
        assert_eq!(writer.accepted.len(), 64 * 1024);
        assert!(!staged.is_empty() || ring.used_space() > 0);

        writer.accepted.clear();
        feed_plaintext(&mut staged, &mut ring, &mut writer).unwrap();
        assert!(staged.is_empty());
        assert_eq!(ring.used_space(), 0);
        assert_eq!(writer.accepted.len(), 100_000 - 64 * 1024);
        assert!(writer.accepted.iter().all(|&byte| byte == 7));
    }

    fn stub_connection(socket: Option<TcpStream>) -> TlsConnection {
        TlsConnection {
            socket,
            tls: None,
            status: ConnectionStatus::NoError,
            input_ring: RingBuffer::new(1),
            output_ring: RingBuffer::new(1),
            staged: Vec::new(),
            bytes_read: 0,
            write_want_read: false,
            write_want_write: false,
            read_want_read: false,
            read_want_write: false,
        }
    }

    #[test]
    fn test_process_io_batch_reports_socketless_connections() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let live = TcpStream::connect(listener.local_addr().expect("local addr")).expect("connect");
        live.set_nonblocking(true).expect("set nonblocking");
        let (_peer, _) = listener.accept().expect("accept");

        let mut connections = HashMap::new();
        connections.insert("dead", stub_connection(None));
        connections.insert("live", stub_connection(Some(live)));

        let dead = process_io_batch(&mut connections, Duration::from_millis(10));
        assert_eq!(dead, vec!["dead"]);
        assert!(connections["live"].is_connected());
        assert_eq!(connections["live"].status(), ConnectionStatus::NoError);
    }
}
