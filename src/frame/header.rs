use rmpv::Value;

use super::{body_key, header_key, Opcode, TYPE_ERROR_FLAG};
use crate::error::{ProtocolError, ServerErrorFrame};

/// The decoded IPROTO header map, shared by requests and responses.
#[derive(Debug, Clone)]
pub struct Header {
    pub opcode: Opcode,
    pub sync: u32,
    pub schema_version: Option<u64>,
    pub stream_id: Option<u64>,
    pub is_error: bool,
}

impl Header {
    pub fn request(opcode: Opcode, sync: u32, stream_id: Option<u64>) -> Header {
        Header {
            opcode,
            sync,
            schema_version: None,
            stream_id,
            is_error: false,
        }
    }

    /// Encode this header as a MessagePack map value.
    pub fn to_value(&self) -> Value {
        let mut code = self.opcode.code();
        if self.is_error {
            code |= TYPE_ERROR_FLAG;
        }

        let mut entries = vec![
            (Value::from(header_key::CODE as u64), Value::from(code)),
            (Value::from(header_key::SYNC as u64), Value::from(self.sync)),
        ];

        if let Some(stream_id) = self.stream_id {
            if stream_id != 0 {
                entries.push((
                    Value::from(header_key::STREAM_ID as u64),
                    Value::from(stream_id),
                ));
            }
        }

        Value::Map(entries)
    }

    /// Decode a header map received from the peer.
    pub fn from_value(value: &Value) -> Result<Header, ProtocolError> {
        let map = value
            .as_map()
            .ok_or_else(|| ProtocolError::Malformed("header is not a map".into()))?;

        let mut raw_code = None;
        let mut sync = None;
        let mut schema_version = None;
        let mut stream_id = None;

        for (k, v) in map {
            let key = k
                .as_u64()
                .ok_or_else(|| ProtocolError::Malformed("non-integer header key".into()))?;
            match key as u8 {
                header_key::CODE => raw_code = v.as_u64(),
                header_key::SYNC => sync = v.as_u64(),
                header_key::SCHEMA_VERSION => schema_version = v.as_u64(),
                header_key::STREAM_ID => stream_id = v.as_u64(),
                _ => {}
            }
        }

        let raw_code =
            raw_code.ok_or_else(|| ProtocolError::Malformed("header missing code".into()))? as u32;
        let sync = sync.ok_or_else(|| ProtocolError::Malformed("header missing sync".into()))? as u32;

        let is_error = raw_code & TYPE_ERROR_FLAG != 0;
        let opcode = Opcode::from_code(raw_code & !TYPE_ERROR_FLAG);

        Ok(Header {
            opcode,
            sync,
            schema_version,
            stream_id,
            is_error,
        })
    }
}

/// Pull a `ServerError` out of an error-flagged response body map.
///
/// Matches the source bit-for-bit on the "second element" ambiguity: a
/// `0x52` entry holding a map is a single error frame, one holding an array
/// is a stack of chained error frames (oldest cause last).
pub fn decode_server_error(body: &Value) -> (String, Option<Value>, Vec<ServerErrorFrame>) {
    let legacy_message = body
        .as_map()
        .and_then(|m| m.iter().find(|(k, _)| k.as_u64() == Some(body_key::ERROR_24 as u64)))
        .and_then(|(_, v)| v.as_str())
        .map(|s| s.to_string());

    let stack_entry = body
        .as_map()
        .and_then(|m| m.iter().find(|(k, _)| k.as_u64() == Some(body_key::ERROR as u64)))
        .map(|(_, v)| v.clone());

    let mut frames = Vec::new();
    let mut message = legacy_message.unwrap_or_else(|| "unknown server error".to_string());

    match stack_entry {
        Some(Value::Array(stack)) => {
            for entry in &stack {
                if let Some(frame) = parse_error_frame(entry) {
                    frames.push(frame);
                }
            }
            if let Some(first) = frames.first() {
                message = first.message.clone();
            }
        }
        Some(ref single @ Value::Map(_)) => {
            if let Some(frame) = parse_error_frame(single) {
                message = frame.message.clone();
                frames.push(frame);
            }
        }
        _ => {}
    }

    (message, None, frames)
}

fn parse_error_frame(value: &Value) -> Option<ServerErrorFrame> {
    let map = value.as_map()?;
    let mut code = 0u32;
    let mut message = String::new();
    for (k, v) in map {
        match k.as_str()? {
            "code" => code = v.as_u64().unwrap_or(0) as u32,
            "message" => message = v.as_str().unwrap_or_default().to_string(),
            _ => {}
        }
    }
    Some(ServerErrorFrame { code, message })
}
