use serde_json::Value;

// Keywords the upstream schema validator rejects.
const STRIP_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "additionalProperties",
    "default",
    "examples",
    "deprecated",
    "readOnly",
    "writeOnly",
    "minLength",
    "maxLength",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "uniqueItems",
    "const",
];

// Rewrite a tool JSON schema into the subset the upstream accepts: strip
// unsupported keywords and collapse `type` arrays to their primary type.
pub fn sanitize_schema(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for key in STRIP_KEYS {
                map.remove(*key);
            }

            if let Some(type_value) = map.get_mut("type") {
                if let Value::Array(types) = type_value {
                    let primary = types
                        .iter()
                        .filter_map(|t| t.as_str())
                        .find(|t| *t != "null")
                        .or_else(|| types.first().and_then(|t| t.as_str()))
                        .unwrap_or("string")
                        .to_string();
                    *type_value = Value::String(primary);
                }
            }

            for (_, child) in map.iter_mut() {
                sanitize_schema(child);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                sanitize_schema(child);
            }
        }
        _ => {}
    }
}
