//! Poll-driven TCP and TLS plumbing for the Courier client
//!
//! This crate provides the byte-level transport the HTTP layer is built on:
//! a segmented ring buffer, a thin readiness-polling wrapper, and a
//! non-blocking TLS connection that surfaces failures as a status rather
//! than an error on the steady-state path.

pub mod connection;
pub mod poll;
pub mod ring;
pub mod transport;

pub use connection::{process_io_batch, ConnectError, ConnectionStatus, TlsConnection};
pub use ring::{BufferFull, RingBuffer, SEGMENT_SIZE};
pub use transport::Transport;
