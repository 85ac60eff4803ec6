//! Incremental HTTP/1.1 response parsing
//!
//! [`ResponseParser`] is fed whatever bytes the transport produced and walks
//! a small state machine: headers first, then either a known-length body or
//! chunked transfer encoding. Incomplete input simply leaves the parser
//! where it is; the caller's response deadline decides when a stalled parse
//! becomes a failure. Structurally broken input parks the parser in
//! `Malformed`, which the client treats like a transport failure.

use std::collections::HashMap;

use courier_core::workload::HttpResponse;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseState {
    #[default]
    CollectingHeaders,
    CollectingContents,
    CollectingChunkedContents,
    Complete,
    Malformed,
}

#[derive(Debug, Default)]
pub struct ResponseParser {
    state: ResponseState,
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    buffer: Vec<u8>,
    content_length: usize,
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn is_complete(&self) -> bool {
        self.state == ResponseState::Complete
    }

    pub fn is_malformed(&self) -> bool {
        self.state == ResponseState::Malformed
    }

    /// Append freshly received bytes and advance as far as they allow
    pub fn feed(&mut self, bytes: &[u8]) -> ResponseState {
        self.buffer.extend_from_slice(bytes);
        loop {
            let progressed = match self.state {
                ResponseState::CollectingHeaders => self.parse_headers(),
                ResponseState::CollectingContents => self.parse_contents(),
                ResponseState::CollectingChunkedContents => self.parse_chunk(),
                ResponseState::Complete | ResponseState::Malformed => false,
            };
            if !progressed {
                return self.state;
            }
        }
    }

    /// Convert a completed parse into the caller-facing response
    pub fn into_response(self) -> HttpResponse {
        HttpResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }

    fn parse_headers(&mut self) -> bool {
        let Some(end) = find_subsequence(&self.buffer, b"\r\n\r\n") else {
            return false;
        };
        let head = match std::str::from_utf8(&self.buffer[..end]) {
            Ok(head) => head.to_owned(),
            Err(_) => {
                self.state = ResponseState::Malformed;
                return false;
            }
        };
        self.buffer.drain(..end + 4);

        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let code = status_line
            .strip_prefix("HTTP/")
            .and_then(|rest| rest.split_whitespace().nth(1))
            .and_then(|code| code.parse::<u16>().ok());
        let Some(code) = code else {
            self.state = ResponseState::Malformed;
            return false;
        };
        self.status = code;
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                self.headers
                    .insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
            }
        }
        trace!(status = self.status, headers = self.headers.len(), "parsed response head");

        // A redirect is resolved by reconnecting to the location target, so
        // whatever body it carries is never collected.
        if self.status == 302 {
            self.state = ResponseState::Complete;
            return false;
        }
        let chunked = self
            .headers
            .get("transfer-encoding")
            .is_some_and(|encoding| encoding.to_ascii_lowercase().contains("chunked"));
        match self.headers.get("content-length") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(0) => self.state = ResponseState::Complete,
                Ok(length) => {
                    self.content_length = length;
                    self.state = ResponseState::CollectingContents;
                }
                Err(_) => self.state = ResponseState::Malformed,
            },
            None if chunked => self.state = ResponseState::CollectingChunkedContents,
            // An error status with no body framing at all is already done;
            // waiting on chunks that will never come would stall the parse
            None if self.status >= 400 => self.state = ResponseState::Complete,
            None => self.state = ResponseState::CollectingChunkedContents,
        }
        true
    }

    fn parse_contents(&mut self) -> bool {
        if self.buffer.len() < self.content_length {
            return false;
        }
        self.body = self.buffer.drain(..self.content_length).collect();
        self.state = ResponseState::Complete;
        false
    }

    fn parse_chunk(&mut self) -> bool {
        let Some(line_end) = find_subsequence(&self.buffer, b"\r\n") else {
            return false;
        };
        let size_text = match std::str::from_utf8(&self.buffer[..line_end]) {
            Ok(line) => line.split(';').next().unwrap_or_default().trim(),
            Err(_) => {
                self.state = ResponseState::Malformed;
                return false;
            }
        };
        let Ok(size) = usize::from_str_radix(size_text, 16) else {
            self.state = ResponseState::Malformed;
            return false;
        };
        if size == 0 {
            // Terminal chunk; require its trailing CRLF, ignore trailers
            if self.buffer.len() < line_end + 4 {
                return false;
            }
            self.buffer.clear();
            self.state = ResponseState::Complete;
            return false;
        }
        let needed = line_end + 2 + size + 2;
        if self.buffer.len() < needed {
            return false;
        }
        self.body
            .extend_from_slice(&self.buffer[line_end + 2..line_end + 2 + size]);
        self.buffer.drain(..needed);
        true
    }
}

/// Trim a response body to its first balanced JSON object or array.
///
/// Some responses arrive with wire noise around the payload. This scans for
/// the first `{` or `[`, then walks to its matching closer, skipping over
/// string literals and escapes. Only the first balanced group is kept; if no
/// opener or no balanced closer is found the body is returned unchanged.
pub fn trim_to_json(body: &[u8]) -> &[u8] {
    let Some(start) = body.iter().position(|&b| b == b'{' || b == b'[') else {
        return body;
    };
    let (open, close) = if body[start] == b'{' {
        (b'{', b'}')
    } else {
        (b'[', b']')
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in body[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            _ if byte == open => depth += 1,
            _ if byte == close => {
                depth -= 1;
                if depth == 0 {
                    return &body[start..start + offset + 1];
                }
            }
            _ => {}
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_length_response() {
        let mut parser = ResponseParser::new();
        let state = parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(state, ResponseState::Complete);
        let response = parser.into_response();
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("content-length").unwrap(), "5");
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut parser = ResponseParser::new();
        for &byte in wire.iter() {
            parser.feed(&[byte]);
        }
        assert!(parser.is_complete());
        assert_eq!(parser.into_response().body, b"hello");
    }

    #[test]
    fn test_chunked_matches_fixed_length() {
        let mut fixed = ResponseParser::new();
        fixed.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world");

        let mut chunked = ResponseParser::new();
        chunked.feed(b"HTTP/1.1 200 OK\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n");

        assert!(fixed.is_complete());
        assert!(chunked.is_complete());
        assert_eq!(fixed.into_response().body, chunked.into_response().body);
    }

    #[test]
    fn test_chunked_split_across_feeds() {
        let wire = b"HTTP/1.1 200 OK\r\n\r\nb\r\nhello world\r\n0\r\n\r\n";
        let mut parser = ResponseParser::new();
        for piece in wire.chunks(3) {
            parser.feed(piece);
        }
        assert!(parser.is_complete());
        assert_eq!(parser.into_response().body, b"hello world");
    }

    #[test]
    fn test_chunk_extension_ignored() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\n\r\n5;ext=1\r\nhello\r\n0\r\n\r\n");
        assert!(parser.is_complete());
        assert_eq!(parser.into_response().body, b"hello");
    }

    #[test]
    fn test_zero_content_length_completes_without_body() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n");
        assert!(parser.is_complete());
        assert!(parser.into_response().body.is_empty());
    }

    #[test]
    fn test_redirect_completes_at_headers() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 302 Found\r\nLocation: https://elsewhere.courier.chat/x\r\n\r\n");
        assert!(parser.is_complete());
        assert_eq!(parser.status(), 302);
        assert_eq!(
            parser.headers().get("location").unwrap(),
            "https://elsewhere.courier.chat/x"
        );
    }

    #[test]
    fn test_unframed_error_status_completes_at_headers() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 500 Internal Server Error\r\n\r\n");
        assert!(parser.is_complete());
        let response = parser.into_response();
        assert_eq!(response.status, 500);
        assert!(response.body.is_empty());
    }

    #[test]
    fn test_framed_error_status_still_collects_body() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 429 Too Many Requests\r\nContent-Length: 20\r\n\r\n{\"retry_after\":0.01}");
        assert!(parser.is_complete());
        assert_eq!(parser.into_response().body, br#"{"retry_after":0.01}"#);
    }

    #[test]
    fn test_chunked_error_status_still_collects_body() {
        let mut parser = ResponseParser::new();
        parser.feed(
            b"HTTP/1.1 429 Too Many Requests\r\nTransfer-Encoding: chunked\r\n\r\n\
              14\r\n{\"retry_after\":0.01}\r\n0\r\n\r\n",
        );
        assert!(parser.is_complete());
        let response = parser.into_response();
        assert_eq!(response.status, 429);
        assert_eq!(response.body, br#"{"retry_after":0.01}"#);
    }

    #[test]
    fn test_malformed_status_line() {
        let mut parser = ResponseParser::new();
        parser.feed(b"NOT-HTTP nonsense\r\n\r\n");
        assert!(parser.is_malformed());
    }

    #[test]
    fn test_malformed_chunk_size() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\n\r\nzz\r\n");
        assert!(parser.is_malformed());
    }

    #[test]
    fn test_incomplete_input_stays_pending() {
        let mut parser = ResponseParser::new();
        let state = parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhel");
        assert_eq!(state, ResponseState::CollectingContents);
        assert!(!parser.is_complete());
    }

    #[test]
    fn test_header_keys_lower_cased() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\nX-RateLimit-Bucket: abc\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(parser.headers().get("x-ratelimit-bucket").unwrap(), "abc");
    }

    #[test]
    fn test_trim_to_json_strips_noise() {
        assert_eq!(trim_to_json(b"noise{\"a\":1}trailing"), b"{\"a\":1}");
        assert_eq!(trim_to_json(b"xx[1,2,[3]]yy"), b"[1,2,[3]]");
    }

    #[test]
    fn test_trim_to_json_ignores_braces_in_strings() {
        assert_eq!(trim_to_json(br#"{"a":"}"}"#), br#"{"a":"}"}"#);
        assert_eq!(trim_to_json(br#"{"a":"\"}"}x"#), br#"{"a":"\"}"}"#);
    }

    #[test]
    fn test_trim_to_json_keeps_first_balanced_group_only() {
        assert_eq!(trim_to_json(b"{\"a\":1}{\"b\":2}"), b"{\"a\":1}");
    }

    #[test]
    fn test_trim_to_json_unbalanced_left_alone() {
        assert_eq!(trim_to_json(b"{\"a\":1"), b"{\"a\":1");
        assert_eq!(trim_to_json(b"no json here"), b"no json here");
    }
}
