use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

/// Convert parsed response headers to an `http::HeaderMap`
///
/// Entries whose name or value `http` rejects are skipped.
pub fn headers_to_header_map(map: &HashMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(map.len());

    for (name, value) in map.iter() {
        if let (Ok(header_name), Ok(header_value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(header_name, header_value);
        }
    }

    headers
}
