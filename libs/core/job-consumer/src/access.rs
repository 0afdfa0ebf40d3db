//! Typed member access into parsed payload values
//!
//! Every lookup walks object members along a path and asserts the type of the
//! leaf, so a wrong payload shape surfaces as an [`AccessError`] instead of a
//! silently wrong value.

use crate::error::AccessError;
use serde_json::{Map, Value};

/// Path-based typed reader over one root value (`meta` or `data`).
#[derive(Debug, Clone, Copy)]
pub struct Fields<'a> {
    root_name: &'static str,
    root: &'a Value,
}

impl<'a> Fields<'a> {
    pub fn new(root_name: &'static str, root: &'a Value) -> Self {
        Self { root_name, root }
    }

    /// Raw member at `path`, any type
    pub fn value(&self, path: &[&str]) -> Result<&'a Value, AccessError> {
        let mut current = self.root;
        for (depth, member) in path.iter().enumerate() {
            let object = current.as_object().ok_or_else(|| AccessError::TypeMismatch {
                path: self.render(&path[..depth]),
                expected: "object",
                found: kind_of(current),
            })?;
            current = object.get(*member).ok_or_else(|| AccessError::Missing {
                path: self.render(&path[..=depth]),
            })?;
        }
        Ok(current)
    }

    pub fn str(&self, path: &[&str]) -> Result<&'a str, AccessError> {
        let value = self.value(path)?;
        value.as_str().ok_or_else(|| self.mismatch(path, "string", value))
    }

    pub fn i64(&self, path: &[&str]) -> Result<i64, AccessError> {
        let value = self.value(path)?;
        value.as_i64().ok_or_else(|| self.mismatch(path, "integer", value))
    }

    pub fn f64(&self, path: &[&str]) -> Result<f64, AccessError> {
        let value = self.value(path)?;
        value.as_f64().ok_or_else(|| self.mismatch(path, "number", value))
    }

    pub fn bool(&self, path: &[&str]) -> Result<bool, AccessError> {
        let value = self.value(path)?;
        value.as_bool().ok_or_else(|| self.mismatch(path, "boolean", value))
    }

    pub fn array(&self, path: &[&str]) -> Result<&'a Vec<Value>, AccessError> {
        let value = self.value(path)?;
        value.as_array().ok_or_else(|| self.mismatch(path, "array", value))
    }

    pub fn object(&self, path: &[&str]) -> Result<&'a Map<String, Value>, AccessError> {
        let value = self.value(path)?;
        value.as_object().ok_or_else(|| self.mismatch(path, "object", value))
    }

    fn mismatch(&self, path: &[&str], expected: &'static str, found: &Value) -> AccessError {
        AccessError::TypeMismatch {
            path: self.render(path),
            expected,
            found: kind_of(found),
        }
    }

    fn render(&self, path: &[&str]) -> String {
        std::iter::once(self.root_name)
            .chain(path.iter().copied())
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "user": {"email": "a@b.c", "age": 31, "score": 0.5, "active": true},
            "tags": ["x", "y"]
        })
    }

    #[test]
    fn test_typed_leaves() {
        let value = sample();
        let fields = Fields::new("data", &value);

        assert_eq!(fields.str(&["user", "email"]), Ok("a@b.c"));
        assert_eq!(fields.i64(&["user", "age"]), Ok(31));
        assert_eq!(fields.f64(&["user", "score"]), Ok(0.5));
        assert_eq!(fields.bool(&["user", "active"]), Ok(true));
        assert_eq!(fields.array(&["tags"]).map(Vec::len), Ok(2));
        assert!(fields.object(&["user"]).is_ok());
    }

    #[test]
    fn test_type_mismatch_reports_path() {
        let value = sample();
        let fields = Fields::new("data", &value);

        assert_eq!(
            fields.str(&["user", "age"]),
            Err(AccessError::TypeMismatch {
                path: "data.user.age".to_string(),
                expected: "string",
                found: "integer",
            })
        );
        assert_eq!(
            fields.i64(&["user", "score"]),
            Err(AccessError::TypeMismatch {
                path: "data.user.score".to_string(),
                expected: "integer",
                found: "number",
            })
        );
    }

    #[test]
    fn test_traversal_through_non_object() {
        let value = sample();
        let fields = Fields::new("meta", &value);

        assert_eq!(
            fields.str(&["tags", "first"]),
            Err(AccessError::TypeMismatch {
                path: "meta.tags".to_string(),
                expected: "object",
                found: "array",
            })
        );
    }

    #[test]
    fn test_missing_member() {
        let value = sample();
        let fields = Fields::new("data", &value);

        assert_eq!(
            fields.bool(&["user", "deleted"]),
            Err(AccessError::Missing {
                path: "data.user.deleted".to_string()
            })
        );
    }
}
