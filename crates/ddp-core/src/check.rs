//! Structural validation of method and publication arguments.
//!
//! ```ignore
//! let pattern = Pattern::shape([("title", Pattern::String), ("tags", Pattern::array_of(Pattern::String))]);
//! check(&params[0], &pattern)?;
//! ```

use std::fmt;

use thiserror::Error;

use crate::ejson::Value;
use crate::errors::MethodError;

static UNDEFINED: Value = Value::Null;

/// Expected shape of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Anything, including a missing value.
    Any,
    /// A string.
    String,
    /// A number, finite or not.
    Number,
    /// A boolean.
    Boolean,
    /// `null`.
    Null,
    /// A date.
    Date,
    /// Binary data.
    Binary,
    /// Any object.
    Object,
    /// Missing, `null`, or matching the inner pattern.
    Optional(Box<Pattern>),
    /// An array whose every element matches.
    ArrayOf(Box<Pattern>),
    /// An object including at least the listed keys.
    Shape(Vec<(String, Pattern)>),
}

impl Pattern {
    /// [`Pattern::Optional`] helper.
    pub fn optional(inner: Pattern) -> Self {
        Self::Optional(Box::new(inner))
    }

    /// [`Pattern::ArrayOf`] helper.
    pub fn array_of(inner: Pattern) -> Self {
        Self::ArrayOf(Box::new(inner))
    }

    /// [`Pattern::Shape`] helper.
    pub fn shape<K: Into<String>>(keys: impl IntoIterator<Item = (K, Pattern)>) -> Self {
        Self::Shape(keys.into_iter().map(|(k, p)| (k.into(), p)).collect())
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("anything"),
            Self::String => f.write_str("string"),
            Self::Number => f.write_str("number"),
            Self::Boolean => f.write_str("boolean"),
            Self::Null => f.write_str("null"),
            Self::Date => f.write_str("date"),
            Self::Binary => f.write_str("binary"),
            Self::Object | Self::Shape(_) => f.write_str("object"),
            Self::Optional(inner) => write!(f, "optional {inner}"),
            Self::ArrayOf(_) => f.write_str("array"),
        }
    }
}

/// A value did not match its pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Match failed for '{value}', expected {expected}")]
pub struct MatchError {
    /// Rendering of the offending value (`undefined` when missing).
    pub value: String,
    /// What was expected instead.
    pub expected: String,
}

impl MatchError {
    fn new(value: Option<&Value>, expected: impl Into<String>) -> Self {
        Self {
            value: value.map_or_else(|| "undefined".to_owned(), ToString::to_string),
            expected: expected.into(),
        }
    }
}

impl From<MatchError> for MethodError {
    fn from(err: MatchError) -> Self {
        MethodError::with_kind("Match.Error", err.to_string())
    }
}

/// Check `value` against `pattern`.
pub fn check(value: &Value, pattern: &Pattern) -> Result<(), MatchError> {
    check_slot(Some(value), pattern)
}

/// Check the positional argument at `index`, returning it on success.
///
/// A missing argument reads as `null` when the pattern allows it.
pub fn check_param<'a>(
    params: &'a [Value],
    index: usize,
    pattern: &Pattern,
) -> Result<&'a Value, MatchError> {
    let slot = params.get(index);
    check_slot(slot, pattern)?;
    Ok(slot.unwrap_or(&UNDEFINED))
}

fn check_slot(value: Option<&Value>, pattern: &Pattern) -> Result<(), MatchError> {
    let matches = match (pattern, value) {
        (Pattern::Any, _) => true,
        (Pattern::Optional(_), None | Some(Value::Null)) => true,
        (Pattern::Optional(inner), Some(_)) => return check_slot(value, inner),
        (_, None) => false,
        (Pattern::String, Some(v)) => matches!(v, Value::String(_)),
        (Pattern::Number, Some(v)) => matches!(v, Value::Number(_) | Value::NonFinite(_)),
        (Pattern::Boolean, Some(v)) => matches!(v, Value::Bool(_)),
        (Pattern::Null, Some(v)) => v.is_null(),
        (Pattern::Date, Some(v)) => matches!(v, Value::Date(_)),
        (Pattern::Binary, Some(v)) => matches!(v, Value::Binary(_)),
        (Pattern::Object, Some(v)) => matches!(v, Value::Object(_)),
        (Pattern::ArrayOf(inner), Some(Value::Array(items))) => {
            return items.iter().try_for_each(|item| check_slot(Some(item), inner));
        }
        (Pattern::ArrayOf(_), Some(_)) => false,
        (Pattern::Shape(keys), Some(Value::Object(fields))) => {
            for (key, inner) in keys {
                match fields.get(key) {
                    Some(field) => check_slot(Some(field), inner)?,
                    None if matches!(inner, Pattern::Optional(_) | Pattern::Any) => {}
                    None => {
                        return Err(MatchError::new(
                            value,
                            format!("object including '{key}'"),
                        ));
                    }
                }
            }
            return Ok(());
        }
        (Pattern::Shape(_), Some(_)) => false,
    };
    if matches {
        Ok(())
    } else {
        Err(MatchError::new(value, pattern.to_string()))
    }
}
