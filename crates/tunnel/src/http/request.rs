use bytes::{Bytes, BytesMut};

use crate::{
    error::{Result, TunnelError},
    utils::basic_auth_value,
    validation::{validate_header_name, validate_header_value, validate_path},
};

/// HTTP request to send through an open tunnel
///
/// Headers keep insertion order and the case they were supplied in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequestSpec {
    /// HTTP method (GET, POST, PUT, DELETE, etc.)
    pub method: String,

    /// Request target, e.g. "/sap/bc/ping?sap-client=100"
    pub path: String,

    /// Ordered header list; setting an existing name replaces its value in place
    pub headers: Vec<(String, String)>,

    pub body: Option<Bytes>,
}

impl HttpRequestSpec {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new("POST", path).with_body(body)
    }

    /// Add or replace a header, builder style
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    /// Add `Authorization: Basic ...` for the given credentials
    pub fn basic_auth(self, user: &str, password: &str) -> Self {
        self.header("Authorization", basic_auth_value(user, password))
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Add or replace a header; a name that matches exactly keeps its position
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    /// Whether a header with this name was supplied, ignoring case
    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
    }

    /// Check if the request has a body
    pub fn has_body(&self) -> bool {
        self.body.as_ref().is_some_and(|body| !body.is_empty())
    }

    /// HEAD responses never carry a body, whatever their headers say
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }
}

/// Serialize a request for the wire
///
/// `authority` is used for the `Host` header when the caller did not set
/// one. A body without `Content-Length` or `Transfer-Encoding` gets a
/// `Content-Length`.
pub fn encode_request(request: &HttpRequestSpec, authority: &str) -> Result<Bytes> {
    let method = http::Method::from_bytes(request.method.as_bytes()).map_err(|_| {
        TunnelError::InvalidRequest(format!("invalid method {:?}", request.method))
    })?;
    let path = validate_path(&request.path)?;

    let mut head = String::with_capacity(256);
    head.push_str(method.as_str());
    head.push(' ');
    head.push_str(&path);
    head.push_str(" HTTP/1.1\r\n");

    if !request.has_header("host") {
        push_header(&mut head, "Host", authority);
    }

    for (name, value) in &request.headers {
        validate_header_name(name)?;
        validate_header_value(name, value)?;
        push_header(&mut head, name, value);
    }

    if let Some(body) = &request.body {
        if !request.has_header("content-length") && !request.has_header("transfer-encoding") {
            push_header(&mut head, "Content-Length", &body.len().to_string());
        }
    }

    head.push_str("\r\n");

    let body = request.body.as_deref().unwrap_or_default();
    let mut wire = BytesMut::with_capacity(head.len() + body.len());
    wire.extend_from_slice(head.as_bytes());
    wire.extend_from_slice(body);
    Ok(wire.freeze())
}

fn push_header(head: &mut String, name: &str, value: &str) {
    head.push_str(name);
    head.push_str(": ");
    head.push_str(value);
    head.push_str("\r\n");
}
