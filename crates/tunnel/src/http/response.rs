use std::{borrow::Cow, collections::HashMap};

use bytes::Bytes;

use crate::utils::headers_to_header_map;

/// Response reassembled from the tunnel byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code (200, 404, 500, etc.)
    pub status_code: u16,

    /// Response headers, names lower-cased; a repeated header keeps its last value
    pub headers: HashMap<String, String>,

    /// Response body; chunk framing is removed unless raw chunked mode was requested
    pub body: Bytes,
}

impl HttpResponse {
    /// Create a new HTTP response
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// Look up a header by name, ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Headers as an `http::HeaderMap`, dropping entries `http` cannot represent
    pub fn header_map(&self) -> http::HeaderMap {
        headers_to_header_map(&self.headers)
    }

    /// Check if the response has a body
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// Check if the response is successful (2xx status code)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Check if the response is a client error (4xx status code)
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    /// Check if the response is a server error (5xx status code)
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status_code)
    }

    /// Whether the server announced it will close the connection
    pub fn closes_connection(&self) -> bool {
        self.header("connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("close"))
            })
            .unwrap_or(false)
    }
}
