//! One pooled HTTPS connection
//!
//! Pairs a transport with the response parser and drives a single
//! request/response exchange to completion under an overall deadline.

use std::time::{Duration, Instant};

use courier_core::workload::HttpResponse;
use courier_net::{ConnectionStatus, Transport};
use tracing::trace;

use crate::response::ResponseParser;

/// Poll granularity while waiting on response bytes
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Why a response could not be driven to completion. All variants are
/// transport-shaped failures eligible for reconnect-retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveError {
    /// The deadline elapsed before the parse completed
    Timeout,
    /// The peer sent something the parser cannot make sense of
    Malformed,
    /// The transport itself failed
    Transport(ConnectionStatus),
}

/// A transport bound to the host it was connected to
pub struct HttpsConnection<T> {
    transport: T,
    host: String,
}

impl<T: Transport> HttpsConnection<T> {
    pub fn new(transport: T, host: impl Into<String>) -> Self {
        HttpsConnection {
            transport,
            host: host.into(),
        }
    }

    /// Host this connection was established against
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    /// Write a serialized request, flushing before return
    pub fn send_request(&mut self, wire: &[u8]) -> ConnectionStatus {
        self.transport.write_data(wire, true)
    }

    /// Pump the transport and feed arriving bytes through the response
    /// parser until it completes, fails, or the deadline elapses.
    pub fn get_response(&mut self, deadline: Duration) -> Result<HttpResponse, DriveError> {
        let mut parser = ResponseParser::new();
        let deadline = Instant::now() + deadline;
        loop {
            if Instant::now() >= deadline {
                return Err(DriveError::Timeout);
            }
            let status = self.transport.process_io(POLL_TIMEOUT);
            if status != ConnectionStatus::NoError {
                return Err(DriveError::Transport(status));
            }
            loop {
                let data = self.transport.read_data();
                if data.is_empty() {
                    break;
                }
                trace!(bytes = data.len(), "feeding response parser");
                parser.feed(data);
            }
            if parser.is_malformed() {
                return Err(DriveError::Malformed);
            }
            if parser.is_complete() {
                return Ok(parser.into_response());
            }
            if !self.transport.is_connected() {
                // Peer closed mid-response with no parse error recorded
                return Err(DriveError::Transport(self.transport.status()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedTransport {
        chunks: VecDeque<Vec<u8>>,
        pending: Vec<u8>,
        handed_out: Vec<u8>,
        status: ConnectionStatus,
        connected: bool,
    }

    impl ScriptedTransport {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            ScriptedTransport {
                chunks: chunks.into(),
                pending: Vec::new(),
                handed_out: Vec::new(),
                status: ConnectionStatus::NoError,
                connected: true,
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn is_connected(&self) -> bool {
            self.connected
        }

        fn status(&self) -> ConnectionStatus {
            self.status
        }

        fn write_data(&mut self, _data: &[u8], _priority: bool) -> ConnectionStatus {
            self.status
        }

        fn process_io(&mut self, _timeout: Duration) -> ConnectionStatus {
            if self.status == ConnectionStatus::NoError {
                if let Some(chunk) = self.chunks.pop_front() {
                    self.pending.extend_from_slice(&chunk);
                }
            }
            self.status
        }

        fn read_data(&mut self) -> &[u8] {
            self.handed_out = std::mem::take(&mut self.pending);
            &self.handed_out
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    #[test]
    fn test_response_across_many_polls() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let chunks = wire.iter().map(|&b| vec![b]).collect();
        let mut connection = HttpsConnection::new(ScriptedTransport::new(chunks), "host");
        let response = connection.get_response(Duration::from_secs(2)).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_silent_transport_times_out() {
        let mut connection = HttpsConnection::new(ScriptedTransport::new(Vec::new()), "host");
        let result = connection.get_response(Duration::from_millis(50));
        assert_eq!(result.unwrap_err(), DriveError::Timeout);
    }
}
