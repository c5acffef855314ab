//! HTTP/1.1 relay codec: request serialization and incremental response parsing

mod assembler;
mod chunked;
mod request;
mod response;

pub use assembler::{ChunkedBody, ResponseAssembler};
pub use chunked::ChunkedDecoder;
pub use request::{HttpRequestSpec, encode_request};
pub use response::HttpResponse;
