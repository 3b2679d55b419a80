//! Length-prefixed framing over a byte stream.
//!
//! One frame on the wire is: a MessagePack-encoded unsigned length, then
//! exactly that many bytes holding the header map immediately followed by
//! the body map. [`Framer`] only concerns itself with the length prefix; the
//! caller ([`crate::writer`] / [`crate::reader`]) is responsible for
//! splitting the payload into header and body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

/// A reserved, fixed-width MessagePack uint32 marker: `0xce` followed by 4
/// big-endian bytes. Every frame this client writes uses this fixed-width
/// form regardless of how small the payload is, so the length is always
/// known before any body bytes are written.
const LENGTH_PREFIX_LEN: usize = 5;
const LENGTH_PREFIX_MARKER: u8 = 0xce;

/// Largest frame this client will accept from a peer. Guards against a
/// corrupt or hostile length prefix causing an unbounded allocation.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct Framer {
    // Length of the frame currently being assembled, once known.
    frame_len: Option<usize>,
}

impl Framer {
    pub fn new() -> Framer {
        Framer { frame_len: None }
    }
}

impl Decoder for Framer {
    type Item = BytesMut;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame_len = match self.frame_len {
            Some(len) => len,
            None => match decode_length_prefix(src)? {
                Some((len, consumed)) => {
                    src.advance(consumed);
                    self.frame_len = Some(len);
                    len
                }
                None => return Ok(None),
            },
        };

        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        self.frame_len = None;
        Ok(Some(src.split_to(frame_len)))
    }
}

/// Peek at the start of `src` for a complete MessagePack unsigned integer
/// length prefix. Returns `(length, bytes_consumed)` or `None` if more bytes
/// are needed. Tolerates any valid msgpack uint encoding on read, even
/// though this client always writes the fixed 5-byte form.
fn decode_length_prefix(src: &[u8]) -> Result<Option<(usize, usize)>, TransportError> {
    if src.is_empty() {
        return Ok(None);
    }

    let marker = src[0];
    let needed = match marker {
        0x00..=0x7f => 1,
        0xcc => 2,
        0xcd => 3,
        0xce => 5,
        0xcf => 9,
        other => {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad length prefix marker 0x{other:02x}"),
            )))
        }
    };

    if src.len() < needed {
        return Ok(None);
    }

    let mut cursor = &src[..needed];
    let len = rmp::decode::read_int::<u64, _>(&mut cursor).map_err(|_| {
        TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "malformed length prefix",
        ))
    })? as usize;

    if len > MAX_FRAME_LEN {
        return Err(TransportError::Truncated {
            expected: len,
            actual: MAX_FRAME_LEN,
        });
    }

    Ok(Some((len, needed)))
}

impl Encoder<Bytes> for Framer {
    type Error = TransportError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u8(LENGTH_PREFIX_MARKER);
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
