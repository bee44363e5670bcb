//! JSON value conversion helpers.
//!
//! Topic entries hold opaque [`serde_json::Value`] documents. Connections
//! read and write strongly-typed values; these helpers do the conversion at
//! the API boundary. Readers always receive deep copies, so a caller can
//! never alias state owned by a topic.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Error converting between a typed value and its JSON representation.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("value is not serializable as a JSON document: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("stored value does not deserialize into the requested type: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Serializes a typed value into a JSON document.
pub fn to_json_value<T: Serialize>(value: &T) -> Result<Value, ValueError> {
    serde_json::to_value(value).map_err(ValueError::Serialize)
}

/// Deserializes a stored JSON document into a typed value.
///
/// The input is cloned first; stored documents stay untouched.
pub fn from_json_value<T: DeserializeOwned>(value: &Value) -> Result<T, ValueError> {
    serde_json::from_value(value.clone()).map_err(ValueError::Deserialize)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Cursor {
        x: i32,
        y: i32,
    }

    #[test]
    fn typed_round_trip() {
        let cursor = Cursor { x: 4, y: -2 };
        let json = to_json_value(&cursor).expect("serialize");
        let back: Cursor = from_json_value(&json).expect("deserialize");
        assert_eq!(back, cursor);
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let json = to_json_value(&"just a string").expect("serialize");
        let result: Result<Cursor, _> = from_json_value(&json);
        assert!(matches!(result, Err(ValueError::Deserialize(_))));
    }
}
