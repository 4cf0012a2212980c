//! Typed reads from a tool call's (already validated) input object.

use serde_json::Value;

use crate::error::ConductorError;

/// The `input` of a [`ToolCall`](crate::types::ToolCall) as seen by a handler.
#[derive(Debug, Clone)]
pub struct ToolArguments {
    value: Value,
}

impl ToolArguments {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// Required string field.
    pub fn get_str(&self, key: &str) -> Result<&str, ConductorError> {
        self.field(key, "a string", Value::as_str)
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    /// Required integer field.
    pub fn get_i64(&self, key: &str) -> Result<i64, ConductorError> {
        self.field(key, "an integer", Value::as_i64)
    }

    /// String entries of an optional array field; absent means empty and
    /// non-string entries are dropped.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        let Some(items) = self.value.get(key).and_then(Value::as_array) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()
    }

    fn field<'a, T>(
        &'a self,
        key: &str,
        expected: &str,
        read: impl FnOnce(&'a Value) -> Option<T>,
    ) -> Result<T, ConductorError> {
        match self.value.get(key) {
            None | Some(Value::Null) => Err(ConductorError::InvalidArgument(format!(
                "argument '{key}' is required"
            ))),
            Some(raw) => read(raw).ok_or_else(|| {
                ConductorError::InvalidArgument(format!("argument '{key}' must be {expected}"))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_and_mistyped_fields_name_the_argument() {
        let args = ToolArguments::new(json!({ "role": 7, "description": null }));

        let err = args.get_str("role").unwrap_err().to_string();
        assert!(err.contains("argument 'role' must be a string"), "{err}");
        let err = args.get_str("description").unwrap_err().to_string();
        assert!(err.contains("argument 'description' is required"), "{err}");
        let err = args.get_i64("max_iterations").unwrap_err().to_string();
        assert!(err.contains("'max_iterations' is required"), "{err}");
    }
}
