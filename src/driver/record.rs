//! Record helpers shared by every driver: ids, timestamps, merging, lookup.

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::ast::{Record, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use crate::error::{EngineError, EngineResult};

/// Current time as an RFC 3339 UTC string with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A fresh opaque identifier (uuid v4, simple form).
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The record's id as a string. Numeric ids are accepted and stringified.
pub fn record_id(record: &Record) -> Option<String> {
    match record.get(ID_FIELD)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Prepare a record for insertion: resolve its id (using `next_id` when the
/// caller supplied none) and stamp both timestamps.
pub fn prepare_create(
    object: &str,
    mut data: Record,
    next_id: impl FnOnce() -> String,
) -> EngineResult<(String, Record)> {
    let id = match data.get(ID_FIELD) {
        None | Some(Value::Null) => next_id(),
        Some(_) => record_id(&data).ok_or_else(|| {
            EngineError::InvalidQuery(format!("{object}: id must be a non-empty string"))
        })?,
    };
    let now = now_timestamp();
    data.insert(ID_FIELD.to_string(), Value::String(id.clone()));
    data.insert(CREATED_AT_FIELD.to_string(), Value::String(now.clone()));
    data.insert(UPDATED_AT_FIELD.to_string(), Value::String(now));
    Ok((id, data))
}

/// Merge a partial payload onto an existing record. `id` and `created_at`
/// are never overwritten; `updated_at` is refreshed.
pub fn merge_update(existing: &mut Record, patch: Record) {
    for (key, value) in patch {
        if key == ID_FIELD || key == CREATED_AT_FIELD {
            continue;
        }
        existing.insert(key, value);
    }
    existing.insert(
        UPDATED_AT_FIELD.to_string(),
        Value::String(now_timestamp()),
    );
}

/// Resolve a possibly dotted field path (`owner.name`, `tags.0`) inside a
/// record. A numeric segment indexes an array; a negative one counts from
/// the end (`tags.-1` is the last element), as PostgreSQL's `#>` does.
pub fn lookup<'a>(record: &'a Record, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(array_index(part, items.len())?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn array_index(segment: &str, len: usize) -> Option<usize> {
    let index: i64 = segment.parse().ok()?;
    if index >= 0 {
        usize::try_from(index).ok()
    } else {
        len.checked_sub(usize::try_from(index.unsigned_abs()).ok()?)
    }
}

/// Keep exactly the requested top-level fields that exist on the record.
/// An empty projection keeps the whole record.
pub fn project(record: Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return record;
    }
    let mut out = Record::new();
    for field in fields {
        if let Some(value) = record.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out
}

/// Whether an object name is safe to use as a table or file name.
pub fn validate_object_name(object: &str) -> EngineResult<()> {
    let valid = !object.is_empty()
        && object.len() <= 63
        && object
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidQuery(format!(
            "invalid object name '{object}'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_prepare_create_generates_id_and_stamps() {
        let (id, data) = prepare_create("users", record(json!({"name": "Alice"})), generate_id)
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(data["id"], json!(id));
        assert_eq!(data["name"], "Alice");
        assert_eq!(data["created_at"], data["updated_at"]);
    }

    #[test]
    fn test_prepare_create_keeps_caller_id() {
        let (id, _) = prepare_create("users", record(json!({"id": 7})), || unreachable!()).unwrap();
        assert_eq!(id, "7");
        assert!(prepare_create("users", record(json!({"id": ""})), generate_id).is_err());
        assert!(prepare_create("users", record(json!({"id": [1]})), generate_id).is_err());
    }

    #[test]
    fn test_lookup_paths() {
        let r = record(json!({
            "owner": {"name": "Ada", "langs": ["rust", "go"]},
            "tags": ["a", "b", "c"],
            "n": 1
        }));
        assert_eq!(lookup(&r, "owner.name"), Some(&json!("Ada")));
        assert_eq!(lookup(&r, "owner.langs.1"), Some(&json!("go")));
        assert_eq!(lookup(&r, "tags.0"), Some(&json!("a")));
        assert_eq!(lookup(&r, "tags.-1"), Some(&json!("c")));
        assert_eq!(lookup(&r, "tags.-3"), Some(&json!("a")));
        assert_eq!(lookup(&r, "tags.-4"), None);
        assert_eq!(lookup(&r, "tags.3"), None);
        assert_eq!(lookup(&r, "tags.x"), None);
        assert_eq!(lookup(&r, "n.0"), None);
    }

    #[test]
    fn test_merge_update_protects_identity() {
        let mut existing = record(json!({
            "id": "a", "name": "Alice", "created_at": "t0", "updated_at": "t0"
        }));
        merge_update(
            &mut existing,
            record(json!({"id": "b", "created_at": "t9", "name": "Alicia", "age": 31})),
        );
        assert_eq!(existing["id"], "a");
        assert_eq!(existing["created_at"], "t0");
        assert_eq!(existing["name"], "Alicia");
        assert_eq!(existing["age"], 31);
        assert_ne!(existing["updated_at"], "t0");
    }

    #[test]
    fn test_lookup_dotted_path() {
        let r = record(json!({"owner": {"name": "Bob", "tags": [1]}, "n": 1}));
        assert_eq!(lookup(&r, "owner.name"), Some(&json!("Bob")));
        assert_eq!(lookup(&r, "n"), Some(&json!(1)));
        assert_eq!(lookup(&r, "n.x"), None);
        assert_eq!(lookup(&r, "missing"), None);
    }

    #[test]
    fn test_project() {
        let r = record(json!({"id": "1", "name": "A", "age": 3}));
        let p = project(r.clone(), &["name".into(), "nope".into()]);
        assert_eq!(Value::Object(p), json!({"name": "A"}));
        assert_eq!(project(r.clone(), &[]), r);
    }

    #[test]
    fn test_validate_object_name() {
        assert!(validate_object_name("users").is_ok());
        assert!(validate_object_name("order_items-2").is_ok());
        assert!(validate_object_name("").is_err());
        assert!(validate_object_name("../etc").is_err());
        assert!(validate_object_name("a\"b").is_err());
    }
}
