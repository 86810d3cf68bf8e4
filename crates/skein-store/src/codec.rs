//! Event and key codec
//!
//! On-disk key: `uvarint(len(object)) ‖ object ‖ BE-u64(timestamp)`. The
//! length prefix keeps object keyspaces prefix-free, so a range scan for one
//! object can never run into another object whose id shares a byte prefix.
//! The big-endian timestamp makes lexicographic order chronological.
//!
//! Event body: `uvarint(body-len) ‖ BE-u64(timestamp) ‖ body`, where the body
//! is a sequence of `(zigzag-varint property-id, tag u8, payload)` triples.
//! Absent properties are simply absent; there is no null tag.

use crate::error::{Result, StoreError};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use skein_core::{Event, Value};

pub const TAG_INT: u8 = 1;
pub const TAG_FLOAT: u8 = 2;
pub const TAG_BOOL: u8 = 3;
pub const TAG_STRING: u8 = 4;
pub const TAG_ID: u8 = 5;

pub fn write_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub fn read_uvarint(input: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = input
            .read_u8()
            .map_err(|_| StoreError::Corruption("truncated varint".to_string()))?;
        if shift >= 64 {
            return Err(StoreError::Corruption("varint overflow".to_string()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Physical key for an event: length-prefixed object id plus the timestamp.
pub fn object_key(object: &str, timestamp: i64) -> Vec<u8> {
    let mut key = object_prefix(object);
    key.write_u64::<BigEndian>(timestamp as u64).unwrap();
    key
}

/// Key prefix shared by all events of an object.
pub fn object_prefix(object: &str) -> Vec<u8> {
    let bytes = object.as_bytes();
    let mut key = Vec::with_capacity(bytes.len() + 10);
    write_uvarint(&mut key, bytes.len() as u64);
    key.extend_from_slice(bytes);
    key
}

/// Smallest byte string strictly greater than every key with this prefix.
/// `None` when the prefix is all `0xff` and no such bound exists.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(bound);
        }
        bound.pop();
    }
    None
}

/// Splits a physical key into its object id and timestamp.
pub fn decode_key(mut key: &[u8]) -> Result<(String, i64)> {
    let len = read_uvarint(&mut key)? as usize;
    if key.len() < len + 8 {
        return Err(StoreError::Corruption("bad key length".to_string()));
    }
    let object = std::str::from_utf8(&key[..len])
        .map_err(|_| StoreError::Corruption("object id is not utf-8".to_string()))?
        .to_string();
    let mut suffix = &key[len..];
    let timestamp = suffix
        .read_u64::<BigEndian>()
        .map_err(|_| StoreError::Corruption("bad key length".to_string()))? as i64;
    Ok((object, timestamp))
}

/// Serializes one event.
pub fn encode_event(event: &Event) -> Vec<u8> {
    let mut body = Vec::with_capacity(16 * event.data.len());
    for (property_id, value) in &event.data {
        if value.is_null() {
            continue;
        }
        write_uvarint(&mut body, zigzag_encode(*property_id));
        match value {
            Value::Int(n) => {
                body.push(TAG_INT);
                write_uvarint(&mut body, zigzag_encode(*n));
            }
            Value::Float(n) => {
                body.push(TAG_FLOAT);
                body.write_f64::<LittleEndian>(*n).unwrap();
            }
            Value::Bool(b) => {
                body.push(TAG_BOOL);
                body.push(u8::from(*b));
            }
            Value::Str(s) => {
                body.push(TAG_STRING);
                write_uvarint(&mut body, s.len() as u64);
                body.extend_from_slice(s.as_bytes());
            }
            Value::Id(n) => {
                body.push(TAG_ID);
                write_uvarint(&mut body, *n);
            }
            Value::Null => unreachable!(),
        }
    }

    let mut out = Vec::with_capacity(body.len() + 16);
    write_uvarint(&mut out, body.len() as u64);
    out.write_u64::<BigEndian>(event.timestamp as u64).unwrap();
    out.extend_from_slice(&body);
    out
}

/// Deserializes one event.
pub fn decode_event(mut input: &[u8]) -> Result<Event> {
    let body_len = read_uvarint(&mut input)? as usize;
    let timestamp = input
        .read_u64::<BigEndian>()
        .map_err(|_| StoreError::Corruption("truncated event header".to_string()))?
        as i64;
    if input.len() < body_len {
        return Err(StoreError::Corruption("truncated event body".to_string()));
    }

    let mut event = Event::new(timestamp);
    let mut body = &input[..body_len];
    while !body.is_empty() {
        let property_id = zigzag_decode(read_uvarint(&mut body)?);
        let value = decode_value(&mut body)?;
        event.data.insert(property_id, value);
    }
    Ok(event)
}

fn decode_value(body: &mut &[u8]) -> Result<Value> {
    let tag = body
        .read_u8()
        .map_err(|_| StoreError::Corruption("truncated value tag".to_string()))?;
    let value = match tag {
        TAG_INT => Value::Int(zigzag_decode(read_uvarint(body)?)),
        TAG_FLOAT => Value::Float(
            body.read_f64::<LittleEndian>()
                .map_err(|_| StoreError::Corruption("truncated float value".to_string()))?,
        ),
        TAG_BOOL => Value::Bool(
            body.read_u8()
                .map_err(|_| StoreError::Corruption("truncated bool value".to_string()))?
                != 0,
        ),
        TAG_STRING => {
            let len = read_uvarint(body)? as usize;
            if body.len() < len {
                return Err(StoreError::Corruption("truncated string value".to_string()));
            }
            let s = std::str::from_utf8(&body[..len])
                .map_err(|_| StoreError::Corruption("string value is not utf-8".to_string()))?
                .to_string();
            *body = &body[len..];
            Value::Str(s)
        }
        TAG_ID => Value::Id(read_uvarint(body)?),
        other => {
            return Err(StoreError::Corruption(format!(
                "unknown value tag: {}",
                other
            )))
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_uvarint(&mut buf, value);
            let mut slice = buf.as_slice();
            assert_eq!(read_uvarint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_zigzag() {
        for value in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
    }

    #[test]
    fn test_object_keys_sort_by_timestamp() {
        let k1 = object_key("bar", 1);
        let k2 = object_key("bar", 2);
        let k3 = object_key("bar", 300);
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn test_object_prefixes_are_prefix_free() {
        // "bar" and "barx" must not share a scan range.
        let bar = object_prefix("bar");
        let barx = object_prefix("barx");
        assert!(!barx.starts_with(&bar));
    }

    #[test]
    fn test_prefix_successor_bounds_scan() {
        let prefix = object_prefix("bar");
        let bound = prefix_successor(&prefix).unwrap();
        let key = object_key("bar", i64::MAX);
        assert!(key < bound);
        let other = object_key("baz", 0);
        assert!(!(prefix.as_slice() <= &other[..] && other < bound));
    }

    #[test]
    fn test_decode_key() {
        let key = object_key("bar", 42);
        let (object, timestamp) = decode_key(&key).unwrap();
        assert_eq!(object, "bar");
        assert_eq!(timestamp, 42);
    }

    #[test]
    fn test_event_roundtrip() {
        let event = Event::new(946_684_800_000_000)
            .with_field(1, "john")
            .with_field(2, 100i64)
            .with_field(-1, Value::Float(0.5))
            .with_field(3, true)
            .with_field(4, Value::Id(7));
        let encoded = encode_event(&event);
        let decoded = decode_event(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_null_fields_are_dropped() {
        let event = Event::new(0).with_field(1, Value::Null).with_field(2, 3i64);
        let decoded = decode_event(&encode_event(&event)).unwrap();
        assert_eq!(decoded.get(1), None);
        assert_eq!(decoded.get(2), Some(&Value::Int(3)));
    }

    #[test]
    fn test_truncated_body_is_corruption() {
        let event = Event::new(0).with_field(1, "john");
        let encoded = encode_event(&event);
        let err = decode_event(&encoded[..encoded.len() - 2]).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }
}
