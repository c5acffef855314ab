use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    constants::{
        ERROR_EYECATCHER_WINDOW, ROUTE_ERROR_EYECATCHER, ROUTE_HEADER_LEN, ROUTE_PACKET_TYPE,
        ROUTE_PROTOCOL_VERSION,
    },
    error::{Result, TunnelError},
};

/// Offset of the response code in a regular route reply
const REPLY_CODE_OFFSET: usize = 12;

/// Offset of the return code in an `NI_RTERR` packet
const ERROR_CODE_OFFSET: usize = 16;

/// Offset of the error text length in an `NI_RTERR` packet
const ERROR_TEXT_LEN_OFFSET: usize = 20;

/// Offset of the error text in an `NI_RTERR` packet
const ERROR_TEXT_OFFSET: usize = 24;

/// Marker field that opens the router's error text
const ERROR_TEXT_MARKER: &str = "*ERR*";

/// Classified router reply to a route request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteReply {
    /// Router acknowledged the route, the socket now carries destination traffic
    Established,
    /// No structured reply yet; routers that proxy silently end up here
    Pending,
    /// Router refused the route
    Rejected { code: i32, detail: Option<String> },
}

impl RouteReply {
    /// Whether the tunnel may move to `Open` on this reply
    pub fn opens_tunnel(&self) -> bool {
        matches!(self, RouteReply::Established | RouteReply::Pending)
    }
}

/// Build the route request for `target_host:target_port`
///
/// Layout (big-endian): total length, header length (16), protocol
/// version, packet type (1), then `"{host}/{port}"` without terminator.
pub fn encode_route_packet(target_host: &str, target_port: u16) -> Bytes {
    let route = format!("{}/{}", target_host, target_port);
    let total_len = ROUTE_HEADER_LEN as usize + route.len();

    let mut packet = BytesMut::with_capacity(total_len);
    packet.put_u32(total_len as u32);
    packet.put_u32(ROUTE_HEADER_LEN);
    packet.put_u32(ROUTE_PROTOCOL_VERSION);
    packet.put_u32(ROUTE_PACKET_TYPE);
    packet.put_slice(route.as_bytes());
    packet.freeze()
}

/// Classify the bytes a router sent back after a route request
///
/// Fewer than 4 bytes cannot be classified and yield `MalformedReply`. An
/// error eyecatcher in the first 12 bytes wins over everything else; a
/// 16-byte reply carries its response code at offset 12; anything shorter
/// is `Pending`.
pub fn decode_route_reply(reply: &[u8]) -> Result<RouteReply> {
    if reply.len() < 4 {
        return Err(TunnelError::MalformedReply(reply.len()));
    }

    if is_error_packet(reply) {
        return Ok(RouteReply::Rejected {
            code: read_i32(reply, ERROR_CODE_OFFSET).unwrap_or(-1),
            detail: error_detail(reply),
        });
    }

    match read_i32(reply, REPLY_CODE_OFFSET) {
        Some(0 | 2) => Ok(RouteReply::Established),
        Some(code) => Ok(RouteReply::Rejected { code, detail: None }),
        None => Ok(RouteReply::Pending),
    }
}

/// Whether `reply` starts with a router error packet
pub fn is_error_packet(reply: &[u8]) -> bool {
    let head = &reply[..reply.len().min(ERROR_EYECATCHER_WINDOW)];
    head.windows(ROUTE_ERROR_EYECATCHER.len())
        .any(|window| window == ROUTE_ERROR_EYECATCHER)
}

/// Whether the declared length of an error packet has fully arrived
pub fn error_packet_complete(reply: &[u8]) -> bool {
    match read_u32(reply, 0) {
        Some(total_len) => reply.len() >= total_len as usize,
        None => false,
    }
}

/// Human-readable description of a router response code
pub fn router_error_message(code: i32) -> &'static str {
    match code {
        78 => "invalid route",
        79 => "access denied",
        80 => "connection limit reached",
        81 => "connection refused",
        82 => "route not found",
        83 => "route syntax error",
        -1 => "unspecified error",
        -5 => "connection timed out",
        -6 => "unknown host",
        _ => "unknown router error",
    }
}

/// Text the router put in an error packet, e.g. "connection timed out ..."
///
/// The text section is a run of null-separated fields opened by `*ERR*`
/// and a format version; the message is the field after those two.
fn error_detail(reply: &[u8]) -> Option<String> {
    let declared = read_u32(reply, ERROR_TEXT_LEN_OFFSET)? as usize;
    let text = reply.get(ERROR_TEXT_OFFSET..)?;
    let text = &text[..declared.min(text.len())];

    let mut fields = text
        .split(|b| *b == 0)
        .map(|field| String::from_utf8_lossy(field).trim().to_string());

    if fields.next()? != ERROR_TEXT_MARKER {
        return None;
    }
    fields.nth(1).filter(|message| !message.is_empty())
}

fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    let mut field = buf.get(offset..offset + 4)?;
    Some(field.get_i32())
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let mut field = buf.get(offset..offset + 4)?;
    Some(field.get_u32())
}
