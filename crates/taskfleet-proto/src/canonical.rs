//! Canonical JSON: sorted object keys, no insignificant whitespace.
//!
//! Both sides of a signed exchange hash this form, so key order and
//! formatting chosen by a serializer never affect the signature.

use serde_json::Value;

/// Encode `value` canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Strings serialize infallibly.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_value(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [3, {"y": null, "x": "s"}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"m":[3,{"x":"s","y":null}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_independent_of_input_formatting() {
        let a: Value = serde_json::from_str(r#"{ "taskId" : "t1",  "prompt":"hi" }"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"prompt":"hi","taskId":"t1"}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_escapes_strings() {
        let value = json!({"k\"": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"k\"":"line\nbreak"}"#);
    }
}
