use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use tracing::debug;

use super::{chunked::ChunkedDecoder, response::HttpResponse};
use crate::{
    constants::MAX_HEADER_SECTION_BYTES,
    error::{Phase, Result, TunnelError},
};

/// Header lines accepted in one response head
const MAX_HEADERS: usize = 128;

/// What to return as the body of a chunked response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkedBody {
    /// Strip chunk framing and return the payload
    #[default]
    Decode,
    /// Return the body exactly as received, chunk-size lines included
    Raw,
}

/// How the end of the body is found
#[derive(Debug)]
enum Framing {
    /// No body at all (HEAD, 204, 304, 101)
    Empty,
    ContentLength(usize),
    Chunked(ChunkedDecoder),
    /// Body runs until the peer closes the connection
    UntilClose,
}

#[derive(Debug)]
struct ResponseHead {
    status_code: u16,
    headers: HashMap<String, String>,
}

/// Incremental HTTP/1.1 response parser for one request/response cycle
///
/// Bytes may be pushed in arbitrarily sized pieces; the resulting response
/// does not depend on how the stream was split.
#[derive(Debug)]
pub struct ResponseAssembler {
    buf: BytesMut,
    head: Option<(ResponseHead, Framing)>,
    /// Bytes of `buf` already fed to the chunk decoder
    chunk_consumed: usize,
    decoded: BytesMut,
    head_request: bool,
    chunked_body: ChunkedBody,
    max_response_bytes: usize,
    received: usize,
}

impl ResponseAssembler {
    pub fn new(head_request: bool, chunked_body: ChunkedBody, max_response_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            head: None,
            chunk_consumed: 0,
            decoded: BytesMut::new(),
            head_request,
            chunked_body,
            max_response_bytes,
            received: 0,
        }
    }

    pub fn headers_parsed(&self) -> bool {
        self.head.is_some()
    }

    /// Add received bytes; returns the response once it is complete
    pub fn push(&mut self, data: &[u8]) -> Result<Option<HttpResponse>> {
        self.received += data.len();
        if self.received > self.max_response_bytes {
            return Err(TunnelError::ResponseTooLarge(self.max_response_bytes));
        }
        self.buf.extend_from_slice(data);

        loop {
            if self.head.is_none() {
                let Some((len, head)) = parse_head(&self.buf)? else {
                    if self.buf.len() > MAX_HEADER_SECTION_BYTES {
                        return Err(TunnelError::InvalidResponse(format!(
                            "header section exceeds {} bytes",
                            MAX_HEADER_SECTION_BYTES
                        )));
                    }
                    return Ok(None);
                };
                self.buf.advance(len);

                if is_interim(head.status_code) {
                    debug!(status = head.status_code, "skipping interim response");
                    continue;
                }

                let framing = self.framing_for(&head)?;
                debug!(status = head.status_code, framing = ?framing, "response head parsed");
                self.head = Some((head, framing));
            }

            return self.try_complete();
        }
    }

    /// The peer closed the stream; completes responses framed by connection close
    pub fn finish(&mut self) -> Result<HttpResponse> {
        match &self.head {
            Some((_, Framing::UntilClose)) => {
                let body = self.buf.split();
                self.complete(body)
            }
            Some(_) => Err(TunnelError::broken(
                Phase::Response,
                "connection closed before the body was complete",
            )),
            None if self.buf.is_empty() && self.received == 0 => Err(TunnelError::broken(
                Phase::Response,
                "connection closed before any response arrived",
            )),
            None => Err(TunnelError::broken(
                Phase::Response,
                "connection closed inside the response header section",
            )),
        }
    }

    /// Bytes received after the end of the completed response
    pub fn take_remainder(&mut self) -> BytesMut {
        self.buf.split()
    }

    fn framing_for(&self, head: &ResponseHead) -> Result<Framing> {
        if self.head_request || matches!(head.status_code, 101 | 204 | 304) {
            return Ok(Framing::Empty);
        }

        if let Some(value) = head.headers.get("content-length") {
            let length = value.trim().parse::<usize>().map_err(|_| {
                TunnelError::InvalidResponse(format!("invalid content-length {:?}", value))
            })?;
            if length > self.max_response_bytes {
                return Err(TunnelError::ResponseTooLarge(self.max_response_bytes));
            }
            return Ok(Framing::ContentLength(length));
        }

        let chunked = head
            .headers
            .get("transfer-encoding")
            .and_then(|value| value.rsplit(',').next())
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        if chunked {
            return Ok(Framing::Chunked(ChunkedDecoder::new()));
        }

        Ok(Framing::UntilClose)
    }

    fn try_complete(&mut self) -> Result<Option<HttpResponse>> {
        let Some((_, framing)) = self.head.as_mut() else {
            return Ok(None);
        };

        let body = match framing {
            Framing::Empty => BytesMut::new(),
            Framing::ContentLength(length) => {
                if self.buf.len() < *length {
                    return Ok(None);
                }
                self.buf.split_to(*length)
            }
            Framing::Chunked(decoder) => {
                let out = match self.chunked_body {
                    ChunkedBody::Decode => Some(&mut self.decoded),
                    ChunkedBody::Raw => None,
                };
                self.chunk_consumed += decoder.decode(&self.buf[self.chunk_consumed..], out)?;
                if !decoder.is_done() {
                    return Ok(None);
                }

                let raw = self.buf.split_to(self.chunk_consumed);
                self.chunk_consumed = 0;
                match self.chunked_body {
                    ChunkedBody::Decode => self.decoded.split(),
                    ChunkedBody::Raw => raw,
                }
            }
            Framing::UntilClose => return Ok(None),
        };

        self.complete(body).map(Some)
    }

    fn complete(&mut self, body: BytesMut) -> Result<HttpResponse> {
        let (head, _) = self.head.take().ok_or_else(|| {
            TunnelError::InvalidResponse("response completed before its head".to_string())
        })?;
        Ok(HttpResponse {
            status_code: head.status_code,
            headers: head.headers,
            body: body.freeze(),
        })
    }
}

fn is_interim(status_code: u16) -> bool {
    (100..200).contains(&status_code) && status_code != 101
}

/// Parse the status line and header section at the start of `buf`
///
/// Returns `None` while the section is incomplete, otherwise its length in
/// bytes and the parsed head. Header names are lower-cased; a repeated
/// header keeps its last value.
fn parse_head(buf: &[u8]) -> Result<Option<(usize, ResponseHead)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let status = httparse::ParserConfig::default()
        .allow_spaces_after_header_name_in_responses(true)
        .ignore_invalid_headers_in_responses(true)
        .parse_response(&mut res, buf)
        .map_err(|e| TunnelError::InvalidResponse(format!("invalid response head: {}", e)))?;

    let httparse::Status::Complete(len) = status else {
        return Ok(None);
    };

    let status_code = res
        .code
        .filter(|code| *code >= 100)
        .ok_or_else(|| TunnelError::InvalidResponse(format!("invalid status code {:?}", res.code)))?;

    let headers = res
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect::<HashMap<_, _>>();

    Ok(Some((
        len,
        ResponseHead {
            status_code,
            headers,
        },
    )))
}
