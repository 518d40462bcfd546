//! Property chains and the built-in `date` namespace.

use chrono::{Datelike, Local};
use flowlang::{RuntimeError, RuntimeResult, Value};

/// Walk `path` over `base` by keyed lookup. Objects use their keys; nested entities use
/// their properties, then their metadata. Anything else, or a missing segment, fails.
pub fn get_nested_value(base: &Value, path: &[String]) -> RuntimeResult<Value> {
    let mut current = base.clone();
    for segment in path {
        current = match &current {
            Value::Object(map) => map
                .get(segment)
                .cloned()
                .ok_or_else(|| RuntimeError::KeyNotFound(segment.clone()))?,
            Value::NestedEntity(entity) => entity
                .property(segment)
                .cloned()
                .or_else(|| entity.metadata(segment).map(Value::from))
                .ok_or_else(|| {
                    RuntimeError::KeyNotFound(format!("{}.{}", entity.name(), segment))
                })?,
            other => {
                return Err(RuntimeError::KeyNotFound(format!(
                    "'{}' on {} value",
                    segment,
                    other.type_name()
                )))
            }
        };
    }
    Ok(current)
}

pub fn date_field(field: &str) -> RuntimeResult<Value> {
    let now = Local::now();
    let value = match field {
        "today" => Value::String(now.format("%Y-%m-%d").to_string()),
        "now" => Value::String(now.to_rfc3339()),
        "year" => Value::Number(now.year() as f64),
        "month" => Value::Number(now.month() as f64),
        "day" => Value::Number(now.day() as f64),
        "time" => Value::String(now.format("%H:%M:%S").to_string()),
        other => return Err(RuntimeError::KeyNotFound(format!("date.{}", other))),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowlang::{Entity, EntityKind};

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn walks_objects_and_entities() {
        let agent = Entity::new(EntityKind::Agent, "writer")
            .with_property("model", Value::from("gpt-4o"))
            .with_metadata("owner", "docs-team");
        let base = Value::object([("agent", Value::entity(agent))]);
        assert_eq!(
            get_nested_value(&base, &path(&["agent", "model"])).unwrap(),
            Value::from("gpt-4o")
        );
        assert_eq!(
            get_nested_value(&base, &path(&["agent", "owner"])).unwrap(),
            Value::from("docs-team")
        );
    }

    #[test]
    fn missing_segments_fail() {
        let base = Value::object([("a", Value::Number(1.0))]);
        assert!(matches!(
            get_nested_value(&base, &path(&["b"])),
            Err(RuntimeError::KeyNotFound(_))
        ));
        assert!(matches!(
            get_nested_value(&base, &path(&["a", "deeper"])),
            Err(RuntimeError::KeyNotFound(_))
        ));
    }

    #[test]
    fn date_today_is_iso_formatted() {
        let today = date_field("today").unwrap();
        let text = today.as_str().unwrap();
        assert_eq!(text.len(), 10);
        assert_eq!(&text[4..5], "-");
        assert!(date_field("fortnight").is_err());
    }
}
