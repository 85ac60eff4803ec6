//! Byte-stream transport abstraction
//!
//! Higher layers drive I/O through this trait instead of a concrete socket
//! type, which keeps the request and response machinery testable against
//! scripted transports.

use std::time::Duration;

use crate::connection::{ConnectionStatus, TlsConnection};

/// A poll-driven, non-blocking byte stream
pub trait Transport {
    /// Whether the underlying stream is still open
    fn is_connected(&self) -> bool;

    /// Status recorded by the most recent I/O attempt
    fn status(&self) -> ConnectionStatus;

    /// Stage bytes for transmission, flushing before return when `priority`
    fn write_data(&mut self, data: &[u8], priority: bool) -> ConnectionStatus;

    /// Poll once and service whichever direction became ready
    fn process_io(&mut self, timeout: Duration) -> ConnectionStatus;

    /// Bytes received since the last call; valid until the next write
    fn read_data(&mut self) -> &[u8];

    /// Tear the stream down; safe to call repeatedly
    fn disconnect(&mut self);
}

impl Transport for TlsConnection {
    fn is_connected(&self) -> bool {
        TlsConnection::is_connected(self)
    }

    fn status(&self) -> ConnectionStatus {
        TlsConnection::status(self)
    }

    fn write_data(&mut self, data: &[u8], priority: bool) -> ConnectionStatus {
        TlsConnection::write_data(self, data, priority)
    }

    fn process_io(&mut self, timeout: Duration) -> ConnectionStatus {
        TlsConnection::process_io(self, timeout)
    }

    fn read_data(&mut self) -> &[u8] {
        TlsConnection::read_data(self)
    }

    fn disconnect(&mut self) {
        TlsConnection::disconnect(self)
    }
}
