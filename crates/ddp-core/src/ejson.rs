//! Extended JSON (EJSON) values and codec.
//!
//! Plain JSON loses dates, binary blobs and non-finite numbers. EJSON keeps
//! them by encoding each as a single-key marker object:
//!
//! | value | wire form |
//! |---|---|
//! | date | `{"$date": <ms since epoch>}` |
//! | bytes | `{"$binary": "<base64>"}` |
//! | `Infinity` / `-Infinity` / `NaN` | `{"$InfNaN": 1 \| -1 \| 0}` |
//!
//! A user object that happens to look like one of those markers is wrapped
//! as `{"$escape": {...}}` so that it decodes back to a plain object.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number};

use crate::errors::CodecError;

/// Named fields of a document or object value.
pub type Fields = BTreeMap<String, Value>;

const DATE: &str = "$date";
const BINARY: &str = "$binary";
const INF_NAN: &str = "$InfNaN";
const ESCAPE: &str = "$escape";
const TYPE: &str = "$type";
const VALUE: &str = "$value";

/// A floating point value JSON cannot express.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NonFinite {
    /// Positive infinity.
    Infinity,
    /// Negative infinity.
    NegInfinity,
    /// Not a number.
    NaN,
}

impl NonFinite {
    fn marker(self) -> i8 {
        match self {
            Self::Infinity => 1,
            Self::NegInfinity => -1,
            Self::NaN => 0,
        }
    }

    fn from_marker(raw: &serde_json::Value) -> Option<Self> {
        let n = raw.as_f64()?;
        if n > 0.0 {
            Some(Self::Infinity)
        } else if n < 0.0 {
            Some(Self::NegInfinity)
        } else {
            Some(Self::NaN)
        }
    }

    /// The `f64` this stands for.
    pub fn to_f64(self) -> f64 {
        match self {
            Self::Infinity => f64::INFINITY,
            Self::NegInfinity => f64::NEG_INFINITY,
            Self::NaN => f64::NAN,
        }
    }
}

/// An EJSON value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Value {
    /// `null`.
    #[default]
    Null,
    /// `true` / `false`.
    Bool(bool),
    /// Finite number.
    Number(Number),
    /// `Infinity`, `-Infinity` or `NaN`.
    NonFinite(NonFinite),
    /// UTF-8 string.
    String(String),
    /// Millisecond-precision UTC timestamp.
    Date(DateTime<Utc>),
    /// Raw bytes.
    Binary(Vec<u8>),
    /// Ordered list.
    Array(Vec<Value>),
    /// Key/value object.
    Object(Fields),
}

impl Value {
    /// Wrap raw bytes.
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Binary(bytes.into())
    }

    /// Decode a plain JSON tree, interpreting EJSON markers.
    pub fn from_json(json: serde_json::Value) -> Result<Self, CodecError> {
        Ok(match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => Self::Array(
                items
                    .into_iter()
                    .map(Self::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => Self::from_json_object(map)?,
        })
    }

    fn from_json_object(mut map: Map<String, serde_json::Value>) -> Result<Self, CodecError> {
        if map.len() == 1 {
            if let Some(raw) = map.remove(DATE) {
                return decode_date(&raw);
            }
            if let Some(raw) = map.remove(BINARY) {
                let text = raw
                    .as_str()
                    .ok_or_else(|| CodecError::InvalidBinary(raw.to_string()))?;
                return STANDARD
                    .decode(text)
                    .map(Self::Binary)
                    .map_err(|e| CodecError::InvalidBinary(e.to_string()));
            }
            if let Some(raw) = map.remove(INF_NAN) {
                return NonFinite::from_marker(&raw)
                    .map(Self::NonFinite)
                    .ok_or_else(|| CodecError::InvalidInfNaN(raw.to_string()));
            }
            if let Some(raw) = map.remove(ESCAPE) {
                let serde_json::Value::Object(inner) = raw else {
                    return Err(CodecError::InvalidEscape);
                };
                return decode_fields(inner).map(Self::Object);
            }
        }
        if map.len() == 2 && map.contains_key(TYPE) && map.contains_key(VALUE) {
            let name = match map.get(TYPE) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            return Err(CodecError::UnsupportedType(name));
        }
        decode_fields(map).map(Self::Object)
    }

    /// Encode into a plain JSON tree with EJSON markers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::NonFinite(v) => marker(INF_NAN, v.marker().into()),
            Self::Date(d) => marker(DATE, d.timestamp_millis().into()),
            Self::Binary(bytes) => marker(BINARY, STANDARD.encode(bytes).into()),
            Self::Array(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Object(fields) => {
                let map: Map<String, serde_json::Value> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                if needs_escape(fields) {
                    marker(ESCAPE, serde_json::Value::Object(map))
                } else {
                    serde_json::Value::Object(map)
                }
            }
        }
    }

    /// Whether this is `null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Boolean payload.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric payload, including non-finite values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            Self::NonFinite(v) => Some(v.to_f64()),
            _ => None,
        }
    }

    /// Integer payload.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Array payload.
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Object payload.
    pub fn as_object(&self) -> Option<&Fields> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Consume into the object payload.
    pub fn into_object(self) -> Option<Fields> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Field lookup on objects; `None` for every other variant.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|fields| fields.get(key))
    }

    /// Short lowercase name of the variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) | Self::NonFinite(_) => "number",
            Self::String(_) => "string",
            Self::Date(_) => "date",
            Self::Binary(_) => "binary",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
        }
    }
}

fn decode_date(raw: &serde_json::Value) -> Result<Value, CodecError> {
    #[allow(clippy::cast_possible_truncation)]
    let millis = raw
        .as_i64()
        .or_else(|| raw.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        .ok_or_else(|| CodecError::InvalidDate(raw.to_string()))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Value::Date)
        .ok_or_else(|| CodecError::InvalidDate(raw.to_string()))
}

fn decode_fields(map: Map<String, serde_json::Value>) -> Result<Fields, CodecError> {
    map.into_iter()
        .map(|(k, v)| -> Result<(String, Value), CodecError> { Ok((k, Value::from_json(v)?)) })
        .collect()
}

fn marker(key: &str, value: serde_json::Value) -> serde_json::Value {
    let mut map = Map::with_capacity(1);
    let _ = map.insert(key.to_owned(), value);
    serde_json::Value::Object(map)
}

/// Whether a plain object would be mistaken for a marker on decode.
fn needs_escape(fields: &Fields) -> bool {
    match fields.len() {
        1 => fields
            .keys()
            .all(|k| matches!(k.as_str(), DATE | BINARY | INF_NAN | ESCAPE)),
        2 => fields.contains_key(TYPE) && fields.contains_key(VALUE),
        _ => false,
    }
}

fn single_entry<S, T>(serializer: S, key: &str, value: &T) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + ?Sized,
{
    let mut map = serializer.serialize_map(Some(1))?;
    map.serialize_entry(key, value)?;
    map.end()
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => n.serialize(serializer),
            Self::String(s) => serializer.serialize_str(s),
            Self::NonFinite(v) => single_entry(serializer, INF_NAN, &v.marker()),
            Self::Date(d) => single_entry(serializer, DATE, &d.timestamp_millis()),
            Self::Binary(bytes) => single_entry(serializer, BINARY, &STANDARD.encode(bytes)),
            Self::Array(items) => items.serialize(serializer),
            Self::Object(fields) if needs_escape(fields) => {
                single_entry(serializer, ESCAPE, fields)
            }
            Self::Object(fields) => fields.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Self::from_json(raw).map_err(D::Error::custom)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => Err(fmt::Error),
        }
    }
}

/// Parse EJSON text.
pub fn parse(text: &str) -> Result<Value, CodecError> {
    let raw: serde_json::Value = serde_json::from_str(text)?;
    Value::from_json(raw)
}

/// Render anything serializable (typically a [`Value`] or a frame) as EJSON text.
pub fn stringify<T: Serialize + ?Sized>(value: &T) -> Result<String, CodecError> {
    Ok(serde_json::to_string(value)?)
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        match Number::from_f64(n) {
            Some(n) => Self::Number(n),
            None if n.is_nan() => Self::NonFinite(NonFinite::NaN),
            None if n > 0.0 => Self::NonFinite(NonFinite::Infinity),
            None => Self::NonFinite(NonFinite::NegInfinity),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<Fields> for Value {
    fn from(fields: Fields) -> Self {
        Self::Object(fields)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl FromIterator<(String, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self::Object(iter.into_iter().collect())
    }
}
