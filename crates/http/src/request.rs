//! HTTP/1.1 request serialization

use courier_core::workload::HttpWorkload;

/// Serialize `workload` into a complete HTTP/1.1 request. `host` is the
/// value of the `Host` header, already resolved by the caller from the
/// workload's base-host override or the configured API host.
pub fn build_request(workload: &HttpWorkload, host: &str) -> Vec<u8> {
    let mut path = workload.relative_path.as_str();
    if path.is_empty() {
        path = "/";
    }
    let mut out = Vec::with_capacity(256 + workload.body.len());
    out.extend_from_slice(workload.method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (key, value) in &workload.headers {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Pragma: no-cache\r\n");
    out.extend_from_slice(b"Connection: keep-alive\r\n");
    out.extend_from_slice(b"Host: ");
    out.extend_from_slice(host.as_bytes());
    out.extend_from_slice(b"\r\n");
    if workload.method.has_body() || !workload.body.is_empty() {
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(workload.body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
        out.extend_from_slice(&workload.body);
    } else {
        out.extend_from_slice(b"\r\n");
    }
    out
}
