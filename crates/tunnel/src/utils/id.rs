use uuid::Uuid;

/// Generate a unique tunnel identifier using UUID v4
///
/// The id only shows up in tracing spans; it never goes on the wire.
pub fn generate_tunnel_id() -> String {
    Uuid::new_v4().to_string()
}
