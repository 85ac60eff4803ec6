//! HTTPS client orchestration
//!
//! [`HttpsClient`] owns the rate-limit queue and a connection pool keyed by
//! endpoint class. A submitted workload is admitted through its bucket,
//! serialized, written to a pooled connection and driven to a parsed
//! response. Transport-shaped failures are retried against a bounded
//! reconnect budget; 429 responses wait out the server's `retry_after` and
//! resend without consuming that budget.

use std::collections::HashMap;

use courier_core::workload::{EndpointClass, HttpResponse, HttpWorkload};
use courier_core::ClientConfig;
use courier_net::{ConnectError, ConnectionStatus, TlsConnection, Transport};
use tracing::{debug, warn};

use crate::connection::{DriveError, HttpsConnection};
use crate::error::{Error, Result};
use crate::rate_limit::RateLimitQueue;
use crate::request::build_request;
use crate::response::trim_to_json;

/// Factory for new transports; the seam that lets tests drive the client
/// against scripted byte streams
pub trait Connect {
    type Transport: Transport;

    fn connect(&mut self, host: &str, port: u16) -> std::result::Result<Self::Transport, ConnectError>;
}

/// Production connector backed by [`TlsConnection`]
#[derive(Debug, Default)]
pub struct TlsConnector;

impl Connect for TlsConnector {
    type Transport = TlsConnection;

    fn connect(&mut self, host: &str, port: u16) -> std::result::Result<TlsConnection, ConnectError> {
        TlsConnection::connect(host, port)
    }
}

pub struct HttpsClient<C: Connect = TlsConnector> {
    config: ClientConfig,
    queue: RateLimitQueue,
    connector: C,
    pool: HashMap<EndpointClass, HttpsConnection<C::Transport>>,
}

impl HttpsClient<TlsConnector> {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, TlsConnector)
    }
}

impl<C: Connect> HttpsClient<C> {
    pub fn with_connector(config: ClientConfig, connector: C) -> Self {
        let queue = RateLimitQueue::new(&config);
        HttpsClient {
            config,
            queue,
            connector,
            pool: HashMap::new(),
        }
    }

    pub fn rate_limits(&self) -> &RateLimitQueue {
        &self.queue
    }

    /// Submit one workload and return its parsed response. See the module
    /// docs for the retry behavior; the bucket stays held for the whole
    /// call, including 429 resends, and is released on every exit path.
    pub fn submit_request(&mut self, mut workload: HttpWorkload) -> Result<HttpResponse> {
        let class = workload.endpoint_class;
        let HttpsClient {
            config,
            queue,
            connector,
            pool,
        } = self;

        if !config.token.is_empty() && !workload.headers.contains_key("Authorization") {
            workload
                .headers
                .insert("Authorization".to_owned(), format!("Bot {}", config.token));
        }
        let user_agent = config.user_agent.clone();
        workload
            .headers
            .entry("User-Agent".to_owned())
            .or_insert(user_agent);
        if workload.method.has_body() {
            let content_type = workload.payload_kind.content_type().to_owned();
            workload
                .headers
                .entry("Content-Type".to_owned())
                .or_insert(content_type);
        }

        let _guard = queue.acquire(class)?;
        let mut host = if workload.base_host.is_empty() {
            config.api_host.clone()
        } else {
            workload.base_host.clone()
        };
        let max_tries = config.max_reconnect_tries;
        let mut tries = 0u32;
        loop {
            let needs_new = match pool.get(&class) {
                Some(connection) => !connection.is_connected() || connection.host() != host,
                None => true,
            };
            if needs_new {
                match connector.connect(&host, config.port) {
                    Ok(transport) => {
                        pool.insert(class, HttpsConnection::new(transport, host.clone()));
                    }
                    Err(err) => {
                        warn!(%err, %host, "connection establishment failed");
                        tries += 1;
                        if tries > max_tries {
                            return Err(err.into());
                        }
                        continue;
                    }
                }
            }
            let Some(connection) = pool.get_mut(&class) else {
                continue;
            };

            let wire = build_request(&workload, &host);
            let status = connection.send_request(&wire);
            if status != ConnectionStatus::NoError {
                warn!(%status, "request write failed");
                pool.remove(&class);
                tries += 1;
                if tries > max_tries {
                    return Err(Error::Transport(status));
                }
                continue;
            }

            let response = match connection.get_response(config.response_deadline()) {
                Ok(response) => response,
                Err(drive) => {
                    warn!(?drive, "response drive failed");
                    if let Some(mut dead) = pool.remove(&class) {
                        dead.disconnect();
                    }
                    tries += 1;
                    if tries > max_tries {
                        return Err(match drive {
                            DriveError::Timeout | DriveError::Malformed => Error::ResponseTimeout,
                            DriveError::Transport(status) => Error::Transport(status),
                        });
                    }
                    continue;
                }
            };

            match response.status {
                302 => {
                    let Some(location) = response.headers.get("location") else {
                        return Err(Error::BadRedirect);
                    };
                    debug!(%location, "following redirect");
                    tries += 1;
                    if tries > max_tries {
                        return Err(Error::Status {
                            status: 302,
                            body: location.clone(),
                        });
                    }
                    let target = location.trim_start_matches("https://");
                    if location.starts_with('/') {
                        workload.relative_path = location.clone();
                    } else if let Some((new_host, path)) = target.split_once('/') {
                        host = new_host.to_owned();
                        workload.relative_path = format!("/{path}");
                    } else {
                        host = target.to_owned();
                        workload.relative_path = "/".to_owned();
                    }
                    continue;
                }
                429 => {
                    queue.record_too_many_requests(class, &response);
                    queue.wait_until_reset(class);
                    continue;
                }
                _ => {
                    queue.update_from_response(class, &response);
                    if response.is_success() {
                        let mut response = response;
                        let trimmed = trim_to_json(&response.body);
                        if trimmed.len() != response.body.len() {
                            response.body = trimmed.to_vec();
                        }
                        return Ok(response);
                    }
                    debug!(status = response.status, "terminal error status");
                    return Err(Error::Status {
                        status: response.status,
                        body: response.text(),
                    });
                }
            }
        }
    }
}
