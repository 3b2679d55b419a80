//! Minimal `Request` implementations standing in for the request-kind
//! crates this engine is meant to be driven by. Just enough of SELECT,
//! INSERT, UPDATE, BEGIN/COMMIT/ROLLBACK and PING to exercise the engine
//! end-to-end; not a complete or public request API.

use bytes::BytesMut;
use iproto_client::error::ProtocolError;
use iproto_client::frame::{body_key, Iterator as IprotoIterator, Opcode};
use iproto_client::{CancelToken, IndexRef, Request, SchemaResolver, SpaceRef};
use rmpv::Value;

pub struct Ping;

impl Request for Ping {
    type Response = ();

    fn opcode(&self) -> Opcode {
        Opcode::Ping
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        iproto_client::codec::encode_value(&Value::Map(vec![]), dst)
    }

    fn decode_response(&self, _body: &[u8]) -> Result<Self::Response, ProtocolError> {
        Ok(())
    }
}

/// A `PING` carrying an attached cancellation token, for exercising
/// cooperative cancellation independent of the connection-wide deadline.
pub struct CancellablePing {
    pub cancel: CancelToken,
}

impl Request for CancellablePing {
    type Response = ();

    fn opcode(&self) -> Opcode {
        Opcode::Ping
    }

    fn cancellation(&self) -> Option<&CancelToken> {
        Some(&self.cancel)
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        iproto_client::codec::encode_value(&Value::Map(vec![]), dst)
    }

    fn decode_response(&self, _body: &[u8]) -> Result<Self::Response, ProtocolError> {
        Ok(())
    }
}

pub struct Select {
    pub space: SpaceRef,
    pub index: IndexRef,
    pub key: Vec<Value>,
    pub iterator: IprotoIterator,
    pub limit: u32,
}

impl Select {
    pub fn by_name(space: &str, index: &str, key: Vec<Value>) -> Select {
        Select {
            space: SpaceRef::Name(space.to_string()),
            index: IndexRef::Name(index.to_string()),
            key,
            iterator: IprotoIterator::Eq,
            limit: u32::MAX,
        }
    }
}

impl Request for Select {
    type Response = Vec<Value>;

    fn opcode(&self) -> Opcode {
        Opcode::Select
    }

    fn is_idempotent(&self) -> bool {
        true
    }

    fn encode_body(&self, resolver: &dyn SchemaResolver, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut entries = Vec::new();

        // A peer that understands name-based addressing resolves space and
        // index names itself; only a peer that doesn't forces a local
        // schema-cache lookup down to numeric ids.
        if resolver.peer_supports_names() {
            space_or_index_name_entries(&self.space, &self.index, &mut entries);
        } else {
            let space_id = resolver.resolve_space(&self.space)?;
            let index_id = resolver.resolve_index(&self.index, space_id)?;
            entries.push((Value::from(body_key::SPACE_ID as u64), Value::from(space_id)));
            entries.push((Value::from(body_key::INDEX_ID as u64), Value::from(index_id)));
        }

        entries.push((Value::from(body_key::ITERATOR as u64), Value::from(self.iterator as u8)));
        entries.push((Value::from(body_key::OFFSET as u64), Value::from(0u32)));
        entries.push((Value::from(body_key::LIMIT as u64), Value::from(self.limit)));
        entries.push((Value::from(body_key::KEY as u64), Value::Array(self.key.clone())));

        iproto_client::codec::encode_value(&Value::Map(entries), dst)
    }

    fn decode_response(&self, body: &[u8]) -> Result<Self::Response, ProtocolError> {
        let value = iproto_client::codec::decode_value(body)?;
        Ok(extract_data(&value))
    }
}

pub struct Update {
    pub space_id: u32,
    pub index_id: u32,
    pub key: Vec<Value>,
    pub ops: Vec<Value>,
}

impl Request for Update {
    type Response = Vec<Value>;

    fn opcode(&self) -> Opcode {
        Opcode::Update
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = Value::Map(vec![
            (Value::from(body_key::SPACE_ID as u64), Value::from(self.space_id)),
            (Value::from(body_key::INDEX_ID as u64), Value::from(self.index_id)),
            (Value::from(body_key::KEY as u64), Value::Array(self.key.clone())),
            (Value::from(body_key::OPS as u64), Value::Array(self.ops.clone())),
        ]);
        iproto_client::codec::encode_value(&body, dst)
    }

    fn decode_response(&self, body: &[u8]) -> Result<Self::Response, ProtocolError> {
        let value = iproto_client::codec::decode_value(body)?;
        Ok(extract_data(&value))
    }
}

pub struct Insert {
    pub space_id: u32,
    pub tuple: Vec<Value>,
}

impl Request for Insert {
    type Response = Vec<Value>;

    fn opcode(&self) -> Opcode {
        Opcode::Insert
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = Value::Map(vec![
            (Value::from(body_key::SPACE_ID as u64), Value::from(self.space_id)),
            (Value::from(body_key::TUPLE as u64), Value::Array(self.tuple.clone())),
        ]);
        iproto_client::codec::encode_value(&body, dst)
    }

    fn decode_response(&self, body: &[u8]) -> Result<Self::Response, ProtocolError> {
        let value = iproto_client::codec::decode_value(body)?;
        Ok(extract_data(&value))
    }
}

pub enum TxnControl {
    Begin,
    Commit,
    Rollback,
}

impl Request for TxnControl {
    type Response = ();

    fn opcode(&self) -> Opcode {
        match self {
            TxnControl::Begin => Opcode::Begin,
            TxnControl::Commit => Opcode::Commit,
            TxnControl::Rollback => Opcode::Rollback,
        }
    }

    fn encode_body(&self, _resolver: &dyn SchemaResolver, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        iproto_client::codec::encode_value(&Value::Map(vec![]), dst)
    }

    fn decode_response(&self, _body: &[u8]) -> Result<Self::Response, ProtocolError> {
        Ok(())
    }
}

fn space_or_index_name_entries(space: &SpaceRef, index: &IndexRef, entries: &mut Vec<(Value, Value)>) {
    match space {
        SpaceRef::Name(name) => entries.push((Value::from(body_key::SPACE_NAME as u64), Value::from(name.as_str()))),
        SpaceRef::Id(id) => entries.push((Value::from(body_key::SPACE_ID as u64), Value::from(*id))),
    }
    match index {
        IndexRef::Name(name) => entries.push((Value::from(body_key::INDEX_NAME as u64), Value::from(name.as_str()))),
        IndexRef::Id(id) => entries.push((Value::from(body_key::INDEX_ID as u64), Value::from(*id))),
    }
}

fn extract_data(value: &Value) -> Vec<Value> {
    value
        .as_map()
        .and_then(|m| m.iter().find(|(k, _)| k.as_u64() == Some(body_key::DATA as u64)))
        .and_then(|(_, v)| v.as_array())
        .cloned()
        .unwrap_or_default()
}
