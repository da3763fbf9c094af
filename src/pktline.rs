//! Git pkt-line framing (`gitprotocol-common(5)`).
//!
//! A pkt-line is a four hex digit, big-endian length prefix (counting the
//! prefix itself) followed by that many bytes of payload. Two lengths are
//! reserved as sentinels rather than real payloads: `0000` is a *flush*
//! packet (end of section) and `0001` is a *delimiter* packet, used by
//! protocol v2 to separate a command's capability/argument sections.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;

pub const FLUSH_LEN: &[u8; 4] = b"0000";
pub const DELIM_LEN: &[u8; 4] = b"0001";

const MAX_PAYLOAD: usize = 65516; // 0xffff - 4 (length prefix) - 1 (response-end, unused here)

/// One framed chunk, as produced by the pkt-line decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A line of payload, without the trailing flush/delim framing.
    Data(Bytes),
    /// `0000`: end of section.
    Flush,
    /// `0001`: end of a command's argument/capability section.
    Delim,
}

impl PktLine {
    pub fn as_data(&self) -> Option<&Bytes> {
        match self {
            PktLine::Data(b) => Some(b),
            _ => None,
        }
    }
}

/// Encode a single data pkt-line (length prefix + payload, no trailing LF is
/// added: callers pass a payload that already ends in `\n` where Git expects
/// one).
pub fn encode_data(payload: &[u8]) -> Bytes {
    assert!(payload.len() <= MAX_PAYLOAD, "pkt-line payload too large");
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

pub fn encode_flush() -> Bytes {
    Bytes::from_static(FLUSH_LEN)
}

pub fn encode_delim() -> Bytes {
    Bytes::from_static(DELIM_LEN)
}

/// Encode a protocol-v2 error packet: `ERR <message>\n`, framed as a single
/// data pkt-line. Git clients recognize the `ERR ` prefix and surface the
/// remainder verbatim instead of trying to parse it as protocol data.
pub fn encode_error(message: &str) -> Bytes {
    encode_data(format!("ERR {message}\n").as_bytes())
}

/// A cursor-based decoder over an already-buffered request body. Requests in
/// this protocol are small enough (and HTTP request bodies are already
/// collected up front by the proxy) that streaming decode isn't needed.
pub struct PktLineParser {
    buf: Bytes,
}

impl PktLineParser {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Returns `Ok(None)` at end of input, `Ok(Some(line))` for a decoded
    /// pkt-line, or `Err` if the remaining bytes are too short to contain a
    /// complete line or the length prefix isn't valid hex.
    pub fn next(&mut self) -> Result<Option<PktLine>, Error> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.len() < 4 {
            return Err(Error::InvalidArgument("truncated pkt-line length".into()));
        }
        let len_hex = std::str::from_utf8(&self.buf[..4])
            .map_err(|_| Error::InvalidArgument("non-hex pkt-line length".into()))?;
        let len = usize::from_str_radix(len_hex, 16)
            .map_err(|_| Error::InvalidArgument("non-hex pkt-line length".into()))?;

        match len {
            0 => {
                self.buf = self.buf.slice(4..);
                Ok(Some(PktLine::Flush))
            }
            1 => {
                self.buf = self.buf.slice(4..);
                Ok(Some(PktLine::Delim))
            }
            2 | 3 => Err(Error::InvalidArgument(format!(
                "reserved pkt-line length {len}"
            ))),
            len => {
                if self.buf.len() < len {
                    return Err(Error::InvalidArgument("truncated pkt-line payload".into()));
                }
                let payload = self.buf.slice(4..len);
                self.buf = self.buf.slice(len..);
                Ok(Some(PktLine::Data(payload)))
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Remaining, undecoded bytes — used to tolerate trailing garbage after
    /// the last recognized command.
    pub fn remainder(&self) -> &Bytes {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_data_line() {
        let encoded = encode_data(b"command=ls-refs\n");
        let mut parser = PktLineParser::new(encoded);
        assert_eq!(
            parser.next().unwrap(),
            Some(PktLine::Data(Bytes::from_static(b"command=ls-refs\n")))
        );
        assert_eq!(parser.next().unwrap(), None);
    }

    #[test]
    fn decodes_flush_and_delim() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_flush());
        buf.extend_from_slice(&encode_delim());
        let mut parser = PktLineParser::new(buf.freeze());
        assert_eq!(parser.next().unwrap(), Some(PktLine::Flush));
        assert_eq!(parser.next().unwrap(), Some(PktLine::Delim));
        assert_eq!(parser.next().unwrap(), None);
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut parser = PktLineParser::new(Bytes::from_static(b"0010short"));
        assert!(parser.next().is_err());
    }

    #[test]
    fn rejects_non_hex_length() {
        let mut parser = PktLineParser::new(Bytes::from_static(b"zzzzgarbage"));
        assert!(parser.next().is_err());
    }

    #[test]
    fn error_packet_has_err_prefix() {
        let pkt = encode_error("boom");
        let mut parser = PktLineParser::new(pkt);
        let PktLine::Data(payload) = parser.next().unwrap().unwrap() else {
            panic!("expected data line")
        };
        assert_eq!(&payload[..], b"ERR boom\n");
    }
}
