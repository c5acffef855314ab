//! Route layer: descriptor parsing and the binary route handshake packets

mod descriptor;
mod packet;

pub use descriptor::{RouteDescriptor, RouteHop};
pub use packet::{
    RouteReply, decode_route_reply, encode_route_packet, error_packet_complete, is_error_packet,
    router_error_message,
};

#[cfg(test)]
pub(crate) use packet::tests::{error_packet, reply_with_code};
