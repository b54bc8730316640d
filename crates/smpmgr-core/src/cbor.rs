//! Helpers for reading decoded CBOR payloads
//!
//! SMP payloads are CBOR maps keyed by short text strings. These helpers keep
//! the field lookups in command groups and the processor short.

use ciborium::value::Value;

/// Look up a text key in a CBOR map
///
/// Returns `None` if `map` is not a map or has no such key.
pub fn map_get<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    map.as_map()?
        .iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

/// Read an integer field that fits in an `i64`
pub fn get_i64(map: &Value, key: &str) -> Option<i64> {
    to_i64(map_get(map, key)?)
}

/// Read an integer field that fits in a `u64`
pub fn get_u64(map: &Value, key: &str) -> Option<u64> {
    let integer = map_get(map, key)?.as_integer()?;
    u64::try_from(i128::from(integer)).ok()
}

/// Read a text field
pub fn get_text<'a>(map: &'a Value, key: &str) -> Option<&'a str> {
    map_get(map, key)?.as_text()
}

/// Read a byte string field
pub fn get_bytes<'a>(map: &'a Value, key: &str) -> Option<&'a [u8]> {
    map_get(map, key)?.as_bytes().map(Vec::as_slice)
}

/// Read a boolean field, treating a missing key as `false`
pub fn get_flag(map: &Value, key: &str) -> bool {
    map_get(map, key).and_then(Value::as_bool).unwrap_or(false)
}

/// Convert an integer value to `i64`
pub fn to_i64(value: &Value) -> Option<i64> {
    let integer = value.as_integer()?;
    i64::try_from(i128::from(integer)).ok()
}
