use bytes::BytesMut;

use crate::error::{Result, TunnelError};

/// Longest chunk-size or trailer line accepted
const MAX_LINE_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading a `<hex-size>[;ext]\r\n` line
    Size,
    /// Inside chunk data, with this many bytes left
    Data(u64),
    /// Expecting the CR after chunk data
    DataCr,
    /// Expecting the LF after chunk data
    DataLf,
    /// After the zero-size chunk, reading trailer lines until an empty one
    Trailer,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked` bodies
///
/// Input may be split anywhere. The decoder stops consuming once the
/// terminating zero-size chunk and its trailer section have been read, so
/// `is_done` flips exactly when the final `\r\n` arrives.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    line: Vec<u8>,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            line: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decode as much of `input` as possible
    ///
    /// Chunk payload is appended to `out` when given. Returns the number of
    /// input bytes consumed; anything after the terminator is left alone.
    pub fn decode(&mut self, input: &[u8], mut out: Option<&mut BytesMut>) -> Result<usize> {
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                State::Done => break,
                State::Size | State::Trailer => {
                    let rest = &input[pos..];
                    let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
                        self.push_line(rest)?;
                        pos = input.len();
                        break;
                    };
                    self.push_line(&rest[..newline])?;
                    pos += newline + 1;

                    let line = std::mem::take(&mut self.line);
                    let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);
                    self.state = if self.state == State::Size {
                        match parse_size_line(line)? {
                            0 => State::Trailer,
                            size => State::Data(size),
                        }
                    } else if line.is_empty() {
                        State::Done
                    } else {
                        State::Trailer
                    };
                }
                State::Data(remaining) => {
                    let available = (input.len() - pos) as u64;
                    let take = remaining.min(available) as usize;
                    if let Some(out) = out.as_deref_mut() {
                        out.extend_from_slice(&input[pos..pos + take]);
                    }
                    pos += take;
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        State::DataCr
                    } else {
                        State::Data(left)
                    };
                }
                State::DataCr => {
                    self.state = match input[pos] {
                        b'\r' => State::DataLf,
                        // Tolerate a bare LF after chunk data
                        b'\n' => State::Size,
                        other => return Err(unexpected_after_data(other)),
                    };
                    pos += 1;
                }
                State::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(unexpected_after_data(input[pos]));
                    }
                    self.state = State::Size;
                    pos += 1;
                }
            }
        }

        Ok(pos)
    }

    fn push_line(&mut self, bytes: &[u8]) -> Result<()> {
        if self.line.len() + bytes.len() > MAX_LINE_BYTES {
            return Err(TunnelError::InvalidResponse(format!(
                "chunk line exceeds {} bytes",
                MAX_LINE_BYTES
            )));
        }
        self.line.extend_from_slice(bytes);
        Ok(())
    }
}

/// Parse a `<hex-size>[;ext]` line, given without its line ending
fn parse_size_line(line: &[u8]) -> Result<u64> {
    let invalid = || {
        TunnelError::InvalidResponse(format!(
            "invalid chunk size line {:?}",
            String::from_utf8_lossy(line)
        ))
    };
    if line.is_empty() {
        return Err(invalid());
    }

    let mut framed = Vec::with_capacity(line.len() + 2);
    framed.extend_from_slice(line);
    framed.extend_from_slice(b"\r\n");
    match httparse::parse_chunk_size(&framed) {
        Ok(httparse::Status::Complete((_, size))) => Ok(size),
        Ok(httparse::Status::Partial) | Err(_) => Err(invalid()),
    }
}

fn unexpected_after_data(byte: u8) -> TunnelError {
    TunnelError::InvalidResponse(format!(
        "expected CRLF after chunk data, found 0x{:02x}",
        byte
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> (ChunkedDecoder, BytesMut, usize) {
        let mut decoder = ChunkedDecoder::new();
        let mut out = BytesMut::new();
        let consumed = decoder.decode(input, Some(&mut out)).unwrap();
        (decoder, out, consumed)
    }

    #[test]
    fn test_decode_simple_body() {
        let input = b"5\r\nHello\r\n7\r\n, world\r\n0\r\n\r\n";
        let (decoder, out, consumed) = decode_all(input);

        assert!(decoder.is_done());
        assert_eq!(&out[..], b"Hello, world");
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let input = b"4\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut out = BytesMut::new();

        for (i, byte) in input.iter().enumerate() {
            assert!(!decoder.is_done(), "Done too early at byte {}", i);
            let consumed = decoder.decode(&[*byte], Some(&mut out)).unwrap();
            assert_eq!(consumed, 1);
        }

        assert!(decoder.is_done());
        assert_eq!(&out[..], b"Wikipedia in\r\n\r\nchunks.");
    }

    #[test]
    fn test_terminator_inside_chunk_data_does_not_finish() {
        // Payload contains the literal terminator sequence
        let input = b"5\r\n0\r\n\r\n\r\n";
        let (decoder, out, _) = decode_all(input);

        assert!(!decoder.is_done());
        assert_eq!(&out[..], b"0\r\n\r\n");
    }

    #[test]
    fn test_stops_at_terminator() {
        let input = b"3\r\nabc\r\n0\r\n\r\nHTTP/1.1 200 OK";
        let (decoder, out, consumed) = decode_all(input);

        assert!(decoder.is_done());
        assert_eq!(&out[..], b"abc");
        assert_eq!(consumed, input.len() - b"HTTP/1.1 200 OK".len());
    }

    #[test]
    fn test_extensions_and_trailers() {
        let input = b"3;name=value\r\nabc\r\n0\r\nExpires: never\r\nX-Trace: 1\r\n\r\n";
        let (decoder, out, consumed) = decode_all(input);

        assert!(decoder.is_done());
        assert_eq!(&out[..], b"abc");
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn test_uppercase_hex_size() {
        let input = b"A\r\n0123456789\r\n0\r\n\r\n";
        let (decoder, out, _) = decode_all(input);
        assert!(decoder.is_done());
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_without_output_buffer() {
        let mut decoder = ChunkedDecoder::new();
        let input = b"3\r\nabc\r\n0\r\n\r\n";
        assert_eq!(decoder.decode(input, None).unwrap(), input.len());
        assert!(decoder.is_done());
    }

    #[test]
    fn test_invalid_size_line() {
        let mut decoder = ChunkedDecoder::new();
        let result = decoder.decode(b"zz\r\n", None);
        assert!(matches!(result, Err(TunnelError::InvalidResponse(_))));

        let mut decoder = ChunkedDecoder::new();
        assert!(decoder.decode(b"\r\n", None).is_err());

        let mut decoder = ChunkedDecoder::new();
        let overflow = b"10000000000000000\r\n";
        assert!(decoder.decode(overflow, None).is_err());
    }

    #[test]
    fn test_missing_crlf_after_data() {
        let mut decoder = ChunkedDecoder::new();
        let result = decoder.decode(b"3\r\nabcX", None);
        assert!(matches!(result, Err(TunnelError::InvalidResponse(_))));
    }

    #[test]
    fn test_overlong_size_line() {
        let mut decoder = ChunkedDecoder::new();
        let line = vec![b'1'; MAX_LINE_BYTES + 1];
        assert!(decoder.decode(&line, None).is_err());
    }
}
