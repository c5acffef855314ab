/// Port a router listens on when the descriptor carries no `S` segment
pub const DEFAULT_ROUTER_PORT: u16 = 3299;

/// Length of the fixed route packet header (4 x u32)
pub const ROUTE_HEADER_LEN: u32 = 16;

/// NI protocol version sent in route requests
pub const ROUTE_PROTOCOL_VERSION: u32 = 38;

/// Packet type of a route request
pub const ROUTE_PACKET_TYPE: u32 = 1;

/// Eyecatcher the router puts in front of error packets
pub const ROUTE_ERROR_EYECATCHER: &[u8] = b"NI_RTERR";

/// Leading bytes of a reply searched for the error eyecatcher
pub const ERROR_EYECATCHER_WINDOW: usize = 12;

/// TCP connect timeout toward the router (30 seconds)
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// How long to wait for an explicit route reply before assuming success (2 seconds)
pub const HANDSHAKE_GRACE_MS: u64 = 2000;

/// Upper bound for the whole route handshake (10 seconds)
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Time allowed for a complete HTTP response (30 seconds)
pub const RESPONSE_TIMEOUT_SECS: u64 = 30;

/// Maximum size of the response status line plus header block (64 KB)
pub const MAX_HEADER_SECTION_BYTES: usize = 64 * 1024;

/// Maximum size of a buffered response (16 MB)
pub const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// Read buffer reservation per socket read
pub const READ_CHUNK_BYTES: usize = 8 * 1024;
