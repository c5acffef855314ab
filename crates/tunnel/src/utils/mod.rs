mod encoding;
mod headers;
mod id;

pub use encoding::basic_auth_value;
pub use headers::headers_to_header_map;
pub use id::generate_tunnel_id;
