//! Client configuration
//!
//! Everything the transport stack consumes from the environment: the target
//! API host, the credential, and the timing/retry policy knobs. Defaults
//! match the platform's documented behavior; the special-bucket constants
//! are deliberate policy overrides, not measurements (see the fields'
//! comments).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default API host for the platform's REST surface
pub const DEFAULT_API_HOST: &str = "api.courier.chat";

/// HTTPS port
pub const DEFAULT_PORT: u16 = 443;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target API host; overridable for testing against a staging host
    pub api_host: String,
    pub port: u16,
    /// Bot/API token injected into the Authorization header
    pub token: String,
    pub user_agent: String,
    /// Overall deadline for one response to finish parsing
    pub response_deadline_ms: u64,
    /// Upper bound on waiting for rate-limit admission
    pub admission_timeout_ms: u64,
    /// Reconnect budget before a transport failure is surfaced
    pub max_reconnect_tries: u32,
    /// Pinned interval for the message create/edit endpoint classes. The
    /// server's generic bucket headers are unreliable for these routes, so
    /// the client imposes a conservative fixed cadence instead.
    pub special_bucket_interval_ms: u64,
    /// Fixed reset floor for bulk message deletion, same caveat as above
    pub delete_message_reset_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_host: DEFAULT_API_HOST.to_string(),
            port: DEFAULT_PORT,
            token: String::new(),
            user_agent: "CourierBot (https://courier.chat, 0.1)".to_string(),
            response_deadline_ms: 9500,
            admission_timeout_ms: 25_000,
            max_reconnect_tries: 3,
            special_bucket_interval_ms: 1000,
            delete_message_reset_ms: 4000,
        }
    }
}

impl ClientConfig {
    pub fn new(token: impl Into<String>) -> Self {
        ClientConfig {
            token: token.into(),
            ..Default::default()
        }
    }

    pub fn response_deadline(&self) -> Duration {
        Duration::from_millis(self.response_deadline_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn special_bucket_interval(&self) -> Duration {
        Duration::from_millis(self.special_bucket_interval_ms)
    }

    pub fn delete_message_reset(&self) -> Duration {
        Duration::from_millis(self.delete_message_reset_ms)
    }
}
