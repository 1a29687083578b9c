//! Little-endian buffer codec for record bodies.
//!
//! Entity layout: `class flag (u8) [class string] property count (u32)`
//! followed by `key string, tagged value` pairs. Strings and byte arrays are
//! `u32` length-prefixed. Record ids are `cluster (i32) position (i64)`.
//! Blob bodies are stored verbatim.

use std::collections::BTreeMap;
use std::convert::TryInto;

use crate::record::links::{LinkBag, LinkList, LinkMap, LinkSet};
use crate::record::{Entity, Record, RecordData, RecordKind, Value};
use crate::types::{RecordId, Result, SessionError};

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LINK: u8 = 0x10;
const TAG_LINK_LIST: u8 = 0x11;
const TAG_LINK_SET: u8 = 0x12;
const TAG_LINK_MAP: u8 = 0x13;
const TAG_LINK_BAG: u8 = 0x14;
const TAG_EMBEDDED: u8 = 0x20;
const TAG_EMBEDDED_LIST: u8 = 0x21;

/// Encodes the body of `record`.
pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    match record.data() {
        RecordData::Blob(bytes) => Ok(bytes.clone()),
        RecordData::Entity(entity) => encode_entity(entity),
    }
}

/// Decodes a stored body into a clean record.
pub fn decode_record(id: RecordId, version: i32, kind: RecordKind, bytes: &[u8]) -> Result<Record> {
    let data = if kind.is_entity() {
        RecordData::Entity(decode_entity(bytes)?)
    } else {
        RecordData::Blob(bytes.to_vec())
    };
    Ok(Record::from_parts(id, version, kind, data))
}

fn encode_entity(entity: &Entity) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match entity.class() {
        Some(class) => {
            buf.push(1);
            write_string(&mut buf, class)?;
        }
        None => buf.push(0),
    }
    let properties = entity.raw();
    write_len(&mut buf, properties.len(), "too many properties to serialize")?;
    for (key, value) in properties {
        write_string(&mut buf, key)?;
        write_value(&mut buf, value)?;
    }
    Ok(buf)
}

fn decode_entity(bytes: &[u8]) -> Result<Entity> {
    let mut cursor = Cursor::new(bytes);
    let class = match cursor.read_u8()? {
        0 => None,
        1 => Some(cursor.read_string()?),
        _ => return Err(SessionError::Corruption("invalid class flag")),
    };
    let properties = cursor.read_properties()?;
    cursor.ensure_consumed()?;
    Ok(Entity::from_raw(class, properties))
}

fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(v) => {
            buf.push(TAG_BOOL);
            buf.push(u8::from(*v));
        }
        Value::Int(v) => {
            buf.push(TAG_INT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::String(s) => {
            buf.push(TAG_STRING);
            write_string(buf, s)?;
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            write_bytes(buf, b)?;
        }
        Value::Link(id) => {
            buf.push(TAG_LINK);
            write_rid(buf, *id);
        }
        Value::LinkList(list) => {
            buf.push(TAG_LINK_LIST);
            write_len(buf, list.len(), "link list too large")?;
            list.iter().for_each(|id| write_rid(buf, id));
        }
        Value::LinkSet(set) => {
            buf.push(TAG_LINK_SET);
            write_len(buf, set.len(), "link set too large")?;
            set.iter().for_each(|id| write_rid(buf, id));
        }
        Value::LinkMap(map) => {
            buf.push(TAG_LINK_MAP);
            write_len(buf, map.len(), "link map too large")?;
            for (key, id) in map.iter() {
                write_string(buf, key)?;
                write_rid(buf, id);
            }
        }
        Value::LinkBag(bag) => {
            buf.push(TAG_LINK_BAG);
            let entries = bag.entries();
            write_len(buf, entries.len(), "link bag too large")?;
            for (id, count) in entries {
                write_rid(buf, id);
                buf.extend_from_slice(&count.to_le_bytes());
            }
        }
        Value::Embedded(map) => {
            buf.push(TAG_EMBEDDED);
            write_len(buf, map.len(), "embedded map too large")?;
            for (key, value) in map {
                write_string(buf, key)?;
                write_value(buf, value)?;
            }
        }
        Value::EmbeddedList(items) => {
            buf.push(TAG_EMBEDDED_LIST);
            write_len(buf, items.len(), "embedded list too large")?;
            for item in items {
                write_value(buf, item)?;
            }
        }
    }
    Ok(())
}

fn write_len(buf: &mut Vec<u8>, len: usize, what: &'static str) -> Result<()> {
    let len: u32 = len
        .try_into()
        .map_err(|_| SessionError::invalid(what))?;
    buf.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    write_bytes(buf, value.as_bytes())
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    write_len(buf, bytes.len(), "byte array length exceeds u32::MAX")?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn write_rid(buf: &mut Vec<u8>, id: RecordId) {
    buf.extend_from_slice(&id.cluster().to_le_bytes());
    buf.extend_from_slice(&id.position().to_le_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .index
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(SessionError::Corruption("unexpected end of payload"))?;
        let start = self.index;
        self.index = end;
        Ok(&self.data[start..end])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.read_exact(N)?
            .try_into()
            .map_err(|_| SessionError::Corruption("short read"))
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exact(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_len(&mut self) -> Result<usize> {
        let len = self.read_u32()? as usize;
        // every element takes at least one byte, so a longer count is garbage
        if len > self.data.len() - self.index {
            return Err(SessionError::Corruption("length prefix exceeds payload"));
        }
        Ok(len)
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.read_exact(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SessionError::Corruption("invalid UTF-8 string"))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_len()?;
        Ok(self.read_exact(len)?.to_vec())
    }

    fn read_rid(&mut self) -> Result<RecordId> {
        let cluster = i32::from_le_bytes(self.read_array()?);
        let position = i64::from_le_bytes(self.read_array()?);
        Ok(RecordId::new(cluster, position))
    }

    fn read_properties(&mut self) -> Result<BTreeMap<String, Value>> {
        let count = self.read_len()?;
        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_string()?;
            if key.is_empty() {
                return Err(SessionError::Corruption("empty property key encountered"));
            }
            let value = self.read_value()?;
            if properties.insert(key, value).is_some() {
                return Err(SessionError::Corruption("duplicate property key encountered"));
            }
        }
        Ok(properties)
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_u8()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => match self.read_u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                _ => Err(SessionError::Corruption("invalid boolean encoding")),
            },
            TAG_INT => Ok(Value::Int(i64::from_le_bytes(self.read_array()?))),
            TAG_FLOAT => Ok(Value::Float(f64::from_le_bytes(self.read_array()?))),
            TAG_STRING => Ok(Value::String(self.read_string()?)),
            TAG_BYTES => Ok(Value::Bytes(self.read_bytes()?)),
            TAG_LINK => Ok(Value::Link(self.read_rid()?)),
            TAG_LINK_LIST => {
                let len = self.read_len()?;
                let ids = (0..len).map(|_| self.read_rid()).collect::<Result<Vec<_>>>()?;
                Ok(Value::LinkList(ids.into_iter().collect::<LinkList>()))
            }
            TAG_LINK_SET => {
                let len = self.read_len()?;
                let ids = (0..len).map(|_| self.read_rid()).collect::<Result<Vec<_>>>()?;
                Ok(Value::LinkSet(ids.into_iter().collect::<LinkSet>()))
            }
            TAG_LINK_MAP => {
                let len = self.read_len()?;
                let mut map = LinkMap::new();
                for _ in 0..len {
                    let key = self.read_string()?;
                    let id = self.read_rid()?;
                    if map.insert(key, id).is_some() {
                        return Err(SessionError::Corruption("duplicate link map key"));
                    }
                }
                Ok(Value::LinkMap(map))
            }
            TAG_LINK_BAG => {
                let len = self.read_len()?;
                let mut bag = LinkBag::new();
                for _ in 0..len {
                    let id = self.read_rid()?;
                    let count = self.read_u32()?;
                    if count == 0 {
                        return Err(SessionError::Corruption("zero link bag count"));
                    }
                    for _ in 0..count {
                        bag.add(id);
                    }
                }
                Ok(Value::LinkBag(bag))
            }
            TAG_EMBEDDED => Ok(Value::Embedded(self.read_properties()?)),
            TAG_EMBEDDED_LIST => {
                let len = self.read_len()?;
                let items = (0..len).map(|_| self.read_value()).collect::<Result<Vec<_>>>()?;
                Ok(Value::EmbeddedList(items))
            }
            _ => Err(SessionError::Corruption("unknown property value tag")),
        }
    }

    fn ensure_consumed(&self) -> Result<()> {
        if self.index != self.data.len() {
            return Err(SessionError::Corruption(
                "unexpected trailing bytes in payload",
            ));
        }
        Ok(())
    }
}
