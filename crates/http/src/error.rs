//! Error type for the HTTPS request path

use courier_core::workload::EndpointClass;
use courier_net::ConnectionStatus;

/// Failures surfaced to callers of the HTTPS client
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The rate-limit queue never granted access within the admission budget
    #[error("rate-limit admission timed out for {0:?}")]
    AdmissionTimeout(EndpointClass),

    /// Could not establish the underlying TLS connection
    #[error(transparent)]
    Connect(#[from] courier_net::ConnectError),

    /// The transport failed mid-request and the reconnect budget is spent
    #[error("transport failure: {0}")]
    Transport(ConnectionStatus),

    /// The response never finished parsing within the response deadline
    #[error("response deadline exceeded")]
    ResponseTimeout,

    /// A redirect response carried no usable location header
    #[error("redirect without a location header")]
    BadRedirect,

    /// The server answered with a terminal non-success status
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, Error>;
