//! Input validation for text that ends up on the wire
//!
//! Route hosts and everything serialized into the HTTP request head are
//! checked here, so a caller-supplied value can never smuggle a CR/LF into
//! the request or an unexpected separator into the route string.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::error::TunnelError;

/// Hostname, IPv4 or (bracketless) IPv6 literal as it appears in a route string
static HOST_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9:][A-Za-z0-9._:-]{0,252}$").unwrap());

/// RFC 9110 token, used for header field names
static TOKEN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[!#$%&'*+.^_`|~0-9A-Za-z-]+$").unwrap());

/// Maximum length for HTTP header values
pub const MAX_HEADER_VALUE_LENGTH: usize = 8192;

/// Maximum length for HTTP paths
pub const MAX_PATH_LENGTH: usize = 2048;

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Path too long: {0} bytes (max: {1})")]
    PathTooLong(usize, usize),

    #[error("Path contains whitespace or control characters")]
    InvalidPath,

    #[error("Invalid header name: {0}")]
    InvalidHeaderName(String),

    #[error("Header value too long: {0} bytes (max: {1})")]
    HeaderValueTooLong(usize, usize),

    #[error("Header value for {0} contains control characters")]
    InvalidHeaderValue(String),
}

impl From<ValidationError> for TunnelError {
    fn from(err: ValidationError) -> Self {
        TunnelError::InvalidRequest(err.to_string())
    }
}

/// Validate a router or destination host
///
/// # Examples
///
/// ```
/// use router_tunnel::validation::validate_host;
///
/// assert!(validate_host("saprouter.example.com").is_ok());
/// assert!(validate_host("10.0.0.5").is_ok());
/// assert!(validate_host("bad host").is_err());
/// ```
pub fn validate_host(host: &str) -> Result<(), ValidationError> {
    if !HOST_REGEX.is_match(host) {
        return Err(ValidationError::InvalidHost(
            host.chars().take(50).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Validate and normalize an HTTP request target
///
/// - Rejects whitespace and control characters
/// - Enforces length limits
/// - Ensures origin-form paths start with /
pub fn validate_path(path: &str) -> Result<String, ValidationError> {
    if path.len() > MAX_PATH_LENGTH {
        return Err(ValidationError::PathTooLong(path.len(), MAX_PATH_LENGTH));
    }

    if path.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ValidationError::InvalidPath);
    }

    if path.is_empty() {
        Ok("/".to_string())
    } else if path.starts_with('/') || path == "*" || path.contains("://") {
        Ok(path.to_string())
    } else {
        Ok(format!("/{}", path))
    }
}

/// Validate an HTTP header name, keeping its case as supplied
pub fn validate_header_name(name: &str) -> Result<(), ValidationError> {
    if !TOKEN_REGEX.is_match(name) {
        return Err(ValidationError::InvalidHeaderName(
            name.escape_debug().take(50).collect::<String>(),
        ));
    }
    Ok(())
}

/// Validate an HTTP header value
///
/// Tab is the only control character allowed in a field value.
pub fn validate_header_value(name: &str, value: &str) -> Result<(), ValidationError> {
    if value.len() > MAX_HEADER_VALUE_LENGTH {
        return Err(ValidationError::HeaderValueTooLong(
            value.len(),
            MAX_HEADER_VALUE_LENGTH,
        ));
    }

    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(ValidationError::InvalidHeaderValue(name.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_host_valid() {
        assert!(validate_host("saprouter.example.com").is_ok());
        assert!(validate_host("203.0.113.9").is_ok());
        assert!(validate_host("fe80::1").is_ok());
        assert!(validate_host("host-01").is_ok());
    }

    #[test]
    fn test_validate_host_invalid() {
        assert!(validate_host("").is_err());
        assert!(validate_host("-leading").is_err());
        assert!(validate_host("with space").is_err());
        assert!(validate_host("host/path").is_err());
        assert!(validate_host(&"a".repeat(300)).is_err());
    }

    #[test]
    fn test_validate_path() {
        assert_eq!(validate_path("/sap/bc/ping").unwrap(), "/sap/bc/ping");
        assert_eq!(validate_path("sap/bc/ping").unwrap(), "/sap/bc/ping");
        assert_eq!(validate_path("").unwrap(), "/");
        assert_eq!(validate_path("*").unwrap(), "*");
        assert_eq!(
            validate_path("http://10.0.0.5:8000/ping").unwrap(),
            "http://10.0.0.5:8000/ping"
        );

        assert!(matches!(
            validate_path("/ping HTTP/1.1\r\nX: y"),
            Err(ValidationError::InvalidPath)
        ));

        let long_path = "/".to_string() + &"a".repeat(3000);
        assert!(matches!(
            validate_path(&long_path),
            Err(ValidationError::PathTooLong(_, MAX_PATH_LENGTH))
        ));
    }

    #[test]
    fn test_validate_header_name() {
        assert!(validate_header_name("Content-Type").is_ok());
        assert!(validate_header_name("X-Custom_Header").is_ok());
        assert!(validate_header_name("").is_err());
        assert!(validate_header_name("Bad Name").is_err());
        assert!(validate_header_name("Bad:Name").is_err());
        assert!(validate_header_name("header™").is_err());
    }

    #[test]
    fn test_validate_header_value() {
        assert!(validate_header_value("Accept", "application/json").is_ok());
        assert!(validate_header_value("X", "value\twith\ttabs").is_ok());
        assert!(validate_header_value("X", "value\r\nInjected: yes").is_err());
        assert!(validate_header_value("X", "nul\x00").is_err());
        assert!(matches!(
            validate_header_value("X", &"a".repeat(10000)),
            Err(ValidationError::HeaderValueTooLong(10000, MAX_HEADER_VALUE_LENGTH))
        ));
    }

    #[test]
    fn test_validation_error_converts_to_invalid_request() {
        let err: TunnelError = ValidationError::InvalidPath.into();
        assert!(matches!(err, TunnelError::InvalidRequest(_)));
    }
}
