//! Subsonic servers are inconsistent about whether a field is a bare object
//! or an array when there's exactly one of them, and whether ids are sent as
//! numbers or strings. These deserializers normalize both quirks.

use serde::de::{Deserialize, Deserializer};
use serde::de::Error as DeError;
use serde_json::Value;

/// Deserializes a field that may be absent, a single object, or an array,
/// always producing a `Vec`.
pub fn single_or_seq<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| T::deserialize(item).map_err(DeError::custom))
            .collect(),
        Some(single) => {
            let item = T::deserialize(single).map_err(DeError::custom)?;
            Ok(vec![item])
        }
    }
}

/// Deserializes an id that may arrive as a JSON number or a numeric string.
pub fn tolerant_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| DeError::custom(format!("id out of range: {n}"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| DeError::custom(format!("id is not numeric: {s}"))),
        other => Err(DeError::custom(format!("unexpected id shape: {other}"))),
    }
}

/// Same as `tolerant_id` but for optional ids (e.g. a song's `artistId`,
/// absent for untagged files).
pub fn tolerant_id_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| DeError::custom(format!("id out of range: {n}"))),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|_| DeError::custom(format!("id is not numeric: {s}"))),
        Some(other) => Err(DeError::custom(format!("unexpected id shape: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(default, deserialize_with = "single_or_seq")]
        child: Vec<i32>,
    }

    #[test]
    fn single_or_seq_handles_all_three_shapes() {
        let none: Wrapper = serde_json::from_str("{}").unwrap();
        assert!(none.child.is_empty());

        let single: Wrapper = serde_json::from_str(r#"{"child": 5}"#).unwrap();
        assert_eq!(single.child, vec![5]);

        let many: Wrapper = serde_json::from_str(r#"{"child": [1, 2, 3]}"#).unwrap();
        assert_eq!(many.child, vec![1, 2, 3]);
    }

    #[derive(Deserialize)]
    struct IdWrapper {
        #[serde(deserialize_with = "tolerant_id")]
        id: u64,
    }

    #[test]
    fn tolerant_id_accepts_number_or_string() {
        let from_number: IdWrapper = serde_json::from_str(r#"{"id": 42}"#).unwrap();
        assert_eq!(from_number.id, 42);

        let from_string: IdWrapper = serde_json::from_str(r#"{"id": "42"}"#).unwrap();
        assert_eq!(from_string.id, 42);
    }
}
