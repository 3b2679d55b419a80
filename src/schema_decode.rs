//! Builds a [`SchemaSnapshot`] from the raw `_vspace`/`_vindex` tuples
//! returned by the two system-space `SELECT`s the supervisor issues during
//! a schema refresh.

use std::collections::HashMap;
use std::sync::Arc;

use rmpv::Value;

use crate::error::ProtocolError;
use crate::schema::{FieldDef, IndexRecord, KeyPart, SchemaSnapshot, SpaceRecord};

// `_vspace` tuple: [id, owner, name, engine, field_count, flags, format]
const VSPACE_ID: usize = 0;
const VSPACE_NAME: usize = 2;
const VSPACE_ENGINE: usize = 3;
const VSPACE_FORMAT: usize = 6;

// `_vindex` tuple: [space_id, index_id, name, kind, opts, parts]
const VINDEX_SPACE_ID: usize = 0;
const VINDEX_INDEX_ID: usize = 1;
const VINDEX_NAME: usize = 2;
const VINDEX_KIND: usize = 3;
const VINDEX_OPTS: usize = 4;
const VINDEX_PARTS: usize = 5;

pub fn build_snapshot(vspace_rows: Vec<Value>, vindex_rows: Vec<Value>) -> Result<SchemaSnapshot, ProtocolError> {
    let mut spaces: HashMap<u32, SpaceRecord> = HashMap::new();

    for row in &vspace_rows {
        let tuple = as_tuple(row)?;
        let id = field_u32(tuple, VSPACE_ID)?;
        let name = field_str(tuple, VSPACE_NAME)?.to_string();
        let engine = field_str(tuple, VSPACE_ENGINE).unwrap_or("memtx").to_string();
        let fields = tuple
            .get(VSPACE_FORMAT)
            .and_then(|v| v.as_array())
            .map(|entries| entries.iter().filter_map(decode_field_def).collect())
            .unwrap_or_default();

        spaces.insert(
            id,
            SpaceRecord {
                id,
                name,
                engine,
                fields,
                indexes_by_name: HashMap::new(),
                indexes_by_id: HashMap::new(),
            },
        );
    }

    for row in &vindex_rows {
        let tuple = as_tuple(row)?;
        let space_id = field_u32(tuple, VINDEX_SPACE_ID)?;
        let index_id = field_u32(tuple, VINDEX_INDEX_ID)?;
        let name = field_str(tuple, VINDEX_NAME)?.to_string();
        let kind = field_str(tuple, VINDEX_KIND).unwrap_or("tree").to_string();
        let unique = tuple
            .get(VINDEX_OPTS)
            .and_then(|v| v.as_map())
            .and_then(|m| m.iter().find(|(k, _)| k.as_str() == Some("unique")))
            .and_then(|(_, v)| v.as_bool())
            .unwrap_or(true);
        let parts = tuple
            .get(VINDEX_PARTS)
            .and_then(|v| v.as_array())
            .map(|entries| entries.iter().filter_map(decode_key_part).collect())
            .unwrap_or_default();

        let Some(space) = spaces.get_mut(&space_id) else {
            continue;
        };
        space.indexes_by_name.insert(name.clone(), index_id);
        space.indexes_by_id.insert(
            index_id,
            IndexRecord {
                id: index_id,
                name,
                kind,
                unique,
                parts,
            },
        );
    }

    let mut snapshot = SchemaSnapshot::empty();
    for (id, space) in spaces {
        let space = Arc::new(space);
        snapshot.spaces_by_name.insert(space.name.clone(), space.clone());
        snapshot.spaces_by_id.insert(id, space);
    }
    Ok(snapshot)
}

fn as_tuple(row: &Value) -> Result<&[Value], ProtocolError> {
    row.as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| ProtocolError::Malformed("schema row not a tuple".into()))
}

fn field_u32(tuple: &[Value], index: usize) -> Result<u32, ProtocolError> {
    tuple
        .get(index)
        .and_then(|v| v.as_u64())
        .map(|n| n as u32)
        .ok_or_else(|| ProtocolError::Malformed(format!("schema row missing numeric field {index}")))
}

fn field_str(tuple: &[Value], index: usize) -> Result<&str, ProtocolError> {
    tuple
        .get(index)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProtocolError::Malformed(format!("schema row missing string field {index}")))
}

fn decode_field_def(entry: &Value) -> Option<FieldDef> {
    let map = entry.as_map()?;
    let mut name = None;
    let mut field_type = None;
    let mut is_nullable = false;
    for (k, v) in map {
        match k.as_str() {
            Some("name") => name = v.as_str().map(|s| s.to_string()),
            Some("type") => field_type = v.as_str().map(|s| s.to_string()),
            Some("is_nullable") => is_nullable = v.as_bool().unwrap_or(false),
            _ => {}
        }
    }
    Some(FieldDef {
        name: name?,
        field_type: field_type.unwrap_or_else(|| "any".to_string()),
        is_nullable,
    })
}

fn decode_key_part(entry: &Value) -> Option<KeyPart> {
    // Tarantool 2.x+ parts are maps; older snapshots used `[field, type]`
    // positional arrays. Accept either.
    if let Some(map) = entry.as_map() {
        let mut field = None;
        let mut field_type = None;
        let mut collation = None;
        let mut is_nullable = false;
        for (k, v) in map {
            match k.as_str() {
                Some("field") => field = v.as_u64().map(|n| n as u32),
                Some("type") => field_type = v.as_str().map(|s| s.to_string()),
                Some("collation") => collation = v.as_str().map(|s| s.to_string()),
                Some("is_nullable") => is_nullable = v.as_bool().unwrap_or(false),
                _ => {}
            }
        }
        return Some(KeyPart {
            field: field?,
            field_type: field_type.unwrap_or_else(|| "any".to_string()),
            collation,
            is_nullable,
        });
    }

    let arr = entry.as_array()?;
    Some(KeyPart {
        field: arr.first()?.as_u64()? as u32,
        field_type: arr.get(1).and_then(|v| v.as_str()).unwrap_or("any").to_string(),
        collation: None,
        is_nullable: false,
    })
}
