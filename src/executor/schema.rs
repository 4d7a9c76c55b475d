//! JSON-schema validation for decision payloads.
//!
//! Thin wrapper over the `jsonschema` crate, compiled against the draft-07
//! contract in `schemas/decision_output.json`. The schema describes a
//! single decision object; an array payload validates each element.

use crate::errors::FleetError;
use jsonschema::{Draft, JSONSchema};
use serde_json::Value;
use std::fs;
use std::path::Path;

pub struct SchemaValidator {
    schema: JSONSchema,
}

impl SchemaValidator {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(FleetError::Schema("schema path cannot be empty".into()));
        }
        let raw = fs::read_to_string(path)
            .map_err(|e| FleetError::Schema(format!("read schema {}: {}", path.display(), e)))?;
        let document: Value = serde_json::from_str(&raw)
            .map_err(|e| FleetError::Schema(format!("parse schema {}: {}", path.display(), e)))?;
        Self::from_value(document)
    }

    pub fn from_value(document: Value) -> Result<Self, FleetError> {
        let schema = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&document)
            .map_err(|e| FleetError::Schema(format!("compile schema: {}", e)))?;
        Ok(Self { schema })
    }

    /// Validates a raw payload string. An array payload validates each
    /// element against the schema.
    pub fn validate_str(&self, raw: &str) -> Result<(), FleetError> {
        if raw.trim().is_empty() {
            return Ok(());
        }
        let instance: Value = serde_json::from_str(raw)
            .map_err(|e| FleetError::Schema(format!("payload is not valid JSON: {}", e)))?;
        self.validate_value(&instance)
    }

    pub fn validate_value(&self, instance: &Value) -> Result<(), FleetError> {
        if let Value::Array(items) = instance {
            for (idx, item) in items.iter().enumerate() {
                self.validate_one(item, &format!("[{}]", idx))?;
            }
            return Ok(());
        }
        self.validate_one(instance, "$")
    }

    fn validate_one(&self, instance: &Value, path: &str) -> Result<(), FleetError> {
        if let Err(mut errors) = self.schema.validate(instance) {
            if let Some(first) = errors.next() {
                return Err(FleetError::Schema(format!("{}: {}", path, first)));
            }
            return Err(FleetError::Schema(format!("{}: validation failed", path)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn probe_schema() -> SchemaValidator {
        SchemaValidator::from_value(json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "required": ["foo"],
            "properties": {
                "foo": {"type": "string"},
                "count": {"type": "integer", "minimum": 0, "maximum": 100}
            },
            "additionalProperties": false
        }))
        .unwrap()
    }

    #[test]
    fn accepts_valid_payload() {
        let v = probe_schema();
        assert!(v.validate_str(r#"{"foo":"bar","count":5}"#).is_ok());
    }

    #[test]
    fn rejects_missing_required() {
        let v = probe_schema();
        assert!(v.validate_str(r#"{"count":5}"#).is_err());
    }

    #[test]
    fn rejects_additional_property() {
        let v = probe_schema();
        let err = v.validate_str(r#"{"foo":"bar","extra":1}"#).unwrap_err();
        assert!(err
            .to_string()
            .to_lowercase()
            .contains("additional properties"));
    }

    #[test]
    fn rejects_out_of_range_integer() {
        let v = probe_schema();
        assert!(v.validate_str(r#"{"foo":"bar","count":101}"#).is_err());
    }

    #[test]
    fn validates_each_array_element() {
        let v = probe_schema();
        assert!(v.validate_str(r#"[{"foo":"a"},{"foo":"b"}]"#).is_ok());
        assert!(v.validate_str(r#"[{"foo":"a"},{"bad":1}]"#).is_err());
    }

    #[test]
    fn rejects_malformed_schema_document() {
        assert!(SchemaValidator::from_value(json!({"type": 42})).is_err());
    }
}
