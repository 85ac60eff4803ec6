//! HTTPS client for the Courier REST surface
//!
//! Ties the transport layer to the protocol layer: request serialization,
//! incremental response parsing, per-endpoint rate-limit admission, and the
//! retry/redirect orchestration around them.

pub mod client;
pub mod connection;
pub mod error;
pub mod rate_limit;
pub mod request;
pub mod response;

pub use client::{Connect, HttpsClient, TlsConnector};
pub use connection::{DriveError, HttpsConnection};
pub use error::{Error, Result};
pub use rate_limit::{BucketGuard, RateLimitQueue};
pub use request::build_request;
pub use response::{trim_to_json, ResponseParser, ResponseState};
