//! HTTP workload and response boundary types
//!
//! Endpoint wrapper code (out of scope here) builds an [`HttpWorkload`] and
//! hands it to the HTTPS client; the client hands back an [`HttpResponse`]
//! whose body the caller deserializes itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Logical category of API operation, used as the rate-limit and
/// connection-pool key. Multiple endpoint classes may share one server-side
/// bucket; the queue discovers that from response headers.
///
/// This is a representative set, not the full per-resource catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointClass {
    Unset,
    GetGateway,
    GetGatewayBot,
    GetChannel,
    GetChannelMessages,
    PostMessage,
    PatchMessage,
    DeleteMessage,
    DeleteMessageOld,
    PutReaction,
    DeleteReaction,
    GetGuild,
    GetGuildMembers,
    GetUser,
    GetCurrentUser,
    GetInvite,
    PostThread,
    PostWebhookMessage,
    GetAuditLog,
}

impl EndpointClass {
    /// Every class, in a fixed order; the rate-limit queue seeds one bucket
    /// per entry at client construction
    pub const ALL: [EndpointClass; 19] = [
        EndpointClass::Unset,
        EndpointClass::GetGateway,
        EndpointClass::GetGatewayBot,
        EndpointClass::GetChannel,
        EndpointClass::GetChannelMessages,
        EndpointClass::PostMessage,
        EndpointClass::PatchMessage,
        EndpointClass::DeleteMessage,
        EndpointClass::DeleteMessageOld,
        EndpointClass::PutReaction,
        EndpointClass::DeleteReaction,
        EndpointClass::GetGuild,
        EndpointClass::GetGuildMembers,
        EndpointClass::GetUser,
        EndpointClass::GetCurrentUser,
        EndpointClass::GetInvite,
        EndpointClass::PostThread,
        EndpointClass::PostWebhookMessage,
        EndpointClass::GetAuditLog,
    ];
}

/// HTTP method for a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// Whether requests of this method carry a body on the wire
    pub fn has_body(self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }
}

/// Kind of payload carried by a bodied request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    Json,
    Multipart,
}

impl PayloadKind {
    pub fn content_type(self) -> &'static str {
        match self {
            PayloadKind::Json => "application/json",
            PayloadKind::Multipart => "multipart/form-data; boundary=boundary25",
        }
    }
}

/// One unit of work for the HTTPS client
#[derive(Debug, Clone)]
pub struct HttpWorkload {
    pub endpoint_class: EndpointClass,
    pub method: HttpMethod,
    /// Target host override; empty means the configured API host
    pub base_host: String,
    pub relative_path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub payload_kind: PayloadKind,
}

impl HttpWorkload {
    pub fn new(
        endpoint_class: EndpointClass,
        method: HttpMethod,
        relative_path: impl Into<String>,
    ) -> Self {
        HttpWorkload {
            endpoint_class,
            method,
            base_host: String::new(),
            relative_path: relative_path.into(),
            headers: HashMap::new(),
            body: Vec::new(),
            payload_kind: PayloadKind::Json,
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>, payload_kind: PayloadKind) -> Self {
        self.body = body.into();
        self.payload_kind = payload_kind;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A completed HTTPS response
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Header keys lower-cased for case-insensitive lookup
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Body as text, lossily converted
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, 200..=299)
    }
}

/// Human-readable reason phrase for the platform's documented status codes
pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "The request completed successfully",
        201 => "The entity was created successfully",
        204 => "The request completed successfully but returned no content",
        304 => "The entity was not modified (no action was taken)",
        400 => "The request was improperly formatted, or the server couldn't understand it",
        401 => "The Authorization header was missing or invalid",
        403 => "The Authorization token you passed did not have permission to the resource",
        404 => "The resource at the location specified doesn't exist",
        405 => "The HTTP method used is not valid for the location specified",
        429 => "You are being rate limited",
        500 => "The server had an error processing your request",
        502 => "There was not a gateway available to process your request; wait a bit and retry",
        _ => "Unknown status code",
    }
}
