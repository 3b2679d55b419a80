//! MessagePack encode/decode of IPROTO bodies.
//!
//! This module owns value-level (de)serialization only; framing (length
//! prefixes, socket reads/writes) lives in [`crate::framer`].

use bytes::{Bytes, BytesMut};
use rmpv::Value;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::ProtocolError;

/// Encode a MessagePack map or array value into `dst`.
pub fn encode_value(value: &Value, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut writer = dst.writer();
    rmpv::encode::write_value(&mut writer, value)
        .map_err(|e| ProtocolError::Malformed(format!("encode failure: {e}")))
}

/// Decode a single MessagePack value from `src`, generically, as an
/// untyped tree. Used for header maps and for callers that want the raw
/// shape of a body before deciding how to interpret it.
pub fn decode_value(src: &[u8]) -> Result<Value, ProtocolError> {
    let mut cursor = src;
    rmpv::decode::read_value(&mut cursor)
        .map_err(|e| ProtocolError::Malformed(format!("decode failure: {e}")))
}

/// Decode a single MessagePack value from `src`, returning the value and the
/// number of bytes consumed, so the caller can keep decoding further values
/// from the same buffer (a body map followed immediately by more maps, as in
/// multi-part push frames).
pub fn decode_value_prefix(src: &[u8]) -> Result<(Value, usize), ProtocolError> {
    let mut cursor = src;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| ProtocolError::Malformed(format!("decode failure: {e}")))?;
    let consumed = src.len() - cursor.len();
    Ok((value, consumed))
}

/// Decode a MessagePack body into a caller-supplied `Deserialize` type. Used
/// by [`crate::request::Response`] implementors that want typed decoding
/// instead of walking an untyped [`Value`] tree by hand.
pub fn decode_typed<T: DeserializeOwned>(src: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(src).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Encode a caller-supplied `Serialize` value as a MessagePack body.
pub fn encode_typed<T: Serialize>(value: &T, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let bytes =
        rmp_serde::to_vec_named(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    dst.extend_from_slice(&bytes);
    Ok(())
}

/// Helper used by encoders: wraps a `BytesMut` so `rmpv`'s `std::io::Write`
/// based encoder can append directly into the outbound buffer.
trait BytesMutWriterExt {
    fn writer(&mut self) -> BytesMutWriter<'_>;
}

impl BytesMutWriterExt for BytesMut {
    fn writer(&mut self) -> BytesMutWriter<'_> {
        BytesMutWriter(self)
    }
}

struct BytesMutWriter<'a>(&'a mut BytesMut);

impl std::io::Write for BytesMutWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A body buffer handed to a [`crate::request::Response`] decoder: the raw
/// bytes of the MessagePack body map, after the header has been stripped.
pub type Body = Bytes;

/// Encode a header followed immediately by a body map into one frame
/// payload, ready to hand to [`crate::framer::Framer`].
pub fn encode_frame(header: &crate::frame::Header, body: &Value) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_value(&header.to_value(), &mut buf)?;
    encode_value(body, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a header followed by an already-MessagePack-encoded body.
pub fn encode_frame_raw_body(
    header: &crate::frame::Header,
    body: &[u8],
) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_value(&header.to_value(), &mut buf)?;
    buf.extend_from_slice(body);
    Ok(buf.freeze())
}

/// Split a raw frame payload (as produced by [`crate::framer::Framer`])
/// into its decoded header and the remaining body bytes, undecoded.
pub fn split_frame(payload: &[u8]) -> Result<(crate::frame::Header, Bytes), ProtocolError> {
    let (header_value, consumed) = decode_value_prefix(payload)?;
    let header = crate::frame::Header::from_value(&header_value)?;
    Ok((header, Bytes::copy_from_slice(&payload[consumed..])))
}
