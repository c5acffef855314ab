use base64::{Engine as _, engine::general_purpose::STANDARD};

/// Value for an `Authorization` header using HTTP basic authentication
pub fn basic_auth_value(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, password)))
}
