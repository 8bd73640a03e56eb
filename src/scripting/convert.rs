//! Conversion between JSON payloads and Rhai values

use crate::message::{Message, Metadata, Payload, Scalar};
use rhai::{Array, Dynamic, Map, FLOAT, INT};
use serde_json::{Number, Value};
use std::fmt;

/// A JSON integer outside the range of [`INT`]
///
/// Carried through scripts as an opaque value so it converts back to the
/// exact same number.
#[derive(Debug, Clone, PartialEq)]
pub struct WideInt(Number);

impl WideInt {
    pub fn to_float(&self) -> FLOAT {
        self.0.as_f64().unwrap_or(f64::NAN) as FLOAT
    }
}

impl fmt::Display for WideInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Convert a JSON value into a Rhai value
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from_int(i as INT),
            None if n.is_u64() => Dynamic::from(WideInt(n.clone())),
            None => Dynamic::from_float(n.as_f64().unwrap_or(f64::NAN) as FLOAT),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            Dynamic::from_array(items.iter().map(json_to_dynamic).collect::<Array>())
        }
        Value::Object(map) => Dynamic::from_map(payload_to_map(map)),
    }
}

/// Convert a JSON object into a Rhai object map
pub fn payload_to_map(payload: &Payload) -> Map {
    payload
        .iter()
        .map(|(k, v)| (k.as_str().into(), json_to_dynamic(v)))
        .collect()
}

/// Convert a Rhai value back into JSON
///
/// Fails for values with no JSON form (functions, custom types) and for
/// non-finite floats.
pub fn dynamic_to_json(value: Dynamic) -> std::result::Result<Value, String> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if value.is_bool() {
        return value.as_bool().map(Value::Bool).map_err(str::to_string);
    }
    if value.is_int() {
        return value
            .as_int()
            .map(|i| Value::from(i as i64))
            .map_err(str::to_string);
    }
    if value.is_float() {
        let f = value.as_float().map_err(str::to_string)? as f64;
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite number {}", f));
    }
    if value.is::<WideInt>() {
        let type_name = value.type_name();
        return value
            .try_cast::<WideInt>()
            .map(|wide| Value::Number(wide.0))
            .ok_or_else(|| format!("expected integer, got '{}'", type_name));
    }
    if value.is_char() {
        return value
            .as_char()
            .map(|c| Value::String(c.to_string()))
            .map_err(str::to_string);
    }
    if value.is_string() {
        return value.into_string().map(Value::String).map_err(str::to_string);
    }
    if value.is_array() {
        let items = value.into_array().map_err(str::to_string)?;
        return items
            .into_iter()
            .map(dynamic_to_json)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    if value.is_map() {
        let type_name = value.type_name();
        let map = value
            .try_cast::<Map>()
            .ok_or_else(|| format!("expected map, got '{}'", type_name))?;
        return map_to_payload(map).map(Value::Object);
    }
    Err(format!("value of type '{}' has no JSON form", value.type_name()))
}

/// Convert a Rhai object map into a JSON object
pub fn map_to_payload(map: Map) -> std::result::Result<Payload, String> {
    map.into_iter()
        .map(|(k, v)| dynamic_to_json(v).map(|json| (k.to_string(), json)))
        .collect()
}

fn scalar_to_dynamic(value: &Scalar) -> Dynamic {
    match value {
        Scalar::Bool(b) => Dynamic::from_bool(*b),
        Scalar::Int(i) => Dynamic::from_int(*i as INT),
        Scalar::Float(f) => Dynamic::from_float(*f as FLOAT),
        Scalar::Text(s) => Dynamic::from(s.clone()),
    }
}

fn dynamic_to_scalar(key: &str, value: Dynamic) -> std::result::Result<Option<Scalar>, String> {
    match dynamic_to_json(value)? {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(Scalar::Bool(b))),
        Value::Number(n) => Ok(Some(match n.as_i64() {
            Some(i) => Scalar::Int(i),
            None => Scalar::Float(n.as_f64().unwrap_or(f64::NAN)),
        })),
        Value::String(s) => Ok(Some(Scalar::Text(s))),
        _ => Err(format!("metadata '{}' must be a scalar", key)),
    }
}

/// Convert metadata into a Rhai object map
pub fn metadata_to_map(metadata: &Metadata) -> Map {
    metadata
        .iter()
        .map(|(k, v)| (k.as_str().into(), scalar_to_dynamic(v)))
        .collect()
}

/// Convert a Rhai object map into metadata; unit values remove the key
pub fn map_to_metadata(map: Map) -> std::result::Result<Metadata, String> {
    let mut metadata = Metadata::new();
    for (key, value) in map {
        if let Some(scalar) = dynamic_to_scalar(key.as_str(), value)? {
            metadata.insert(key.to_string(), scalar);
        }
    }
    Ok(metadata)
}

/// Build the `msg` map handed to transform scripts
pub fn message_to_dynamic(message: &Message) -> Dynamic {
    let mut map = Map::new();
    map.insert(
        "payload".into(),
        Dynamic::from_map(payload_to_map(message.payload())),
    );
    map.insert(
        "metadata".into(),
        Dynamic::from_map(metadata_to_map(message.metadata())),
    );
    map.insert(
        "source".into(),
        Dynamic::from(message.source().as_str().to_string()),
    );
    map.insert(
        "timestamp".into(),
        Dynamic::from(message.timestamp().to_rfc3339()),
    );
    Dynamic::from_map(map)
}
