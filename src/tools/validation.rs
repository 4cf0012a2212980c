//! Check tool call input against the tool's declared JSON Schema.
//!
//! Supports the subset tools here actually declare: `type`, `required`,
//! `properties`, `additionalProperties: false`, `enum`, string `pattern`
//! and array `items`.
//! Nested objects and array items are checked recursively; the error names
//! the offending path (`$.filters.tags[2]`).

use regex::Regex;
use serde_json::Value;

/// Validate tool input against a schema, returning the first violation.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), String> {
    validate_at("$", args, schema)
}

fn validate_at(path: &str, value: &Value, schema: &Value) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !value_matches_type(value, expected) {
            return Err(format!(
                "{path}: expected {expected}, got {}",
                json_type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value {value} is not one of {}", Value::Array(allowed.clone())));
        }
    }

    if let (Some(text), Some(pattern)) = (
        value.as_str(),
        schema.get("pattern").and_then(Value::as_str),
    ) {
        let regex = Regex::new(pattern)
            .map_err(|e| format!("{path}: schema pattern '{pattern}' is invalid: {e}"))?;
        if !regex.is_match(text) {
            return Err(format!("{path}: '{text}' does not match pattern '{pattern}'"));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            if let Some(missing) = required
                .iter()
                .filter_map(Value::as_str)
                .find(|name| !obj.contains_key(*name))
            {
                return Err(format!("{path}: missing required field '{missing}'"));
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));
        for (key, field) in obj {
            match properties.and_then(|props| props.get(key)) {
                Some(field_schema) => validate_at(&format!("{path}.{key}"), field, field_schema)?,
                None if closed => return Err(format!("{path}: unexpected field '{key}'")),
                None => {}
            }
        }
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (index, item) in items.iter().enumerate() {
            validate_at(&format!("{path}[{index}]"), item, item_schema)?;
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
