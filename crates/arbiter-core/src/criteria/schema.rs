//! JSON Schema validation for criteria definitions.
//!
//! Definitions are checked against `schema/criteria.schema.json` before they
//! are deserialized, so structural mistakes are reported with their location.

use std::sync::OnceLock;

/// Embedded criteria schema (loaded at compile time).
const CRITERIA_SCHEMA_JSON: &str = include_str!("../../schema/criteria.schema.json");

/// Compiled JSON Schema validator (initialized once, reused).
static COMPILED_SCHEMA: OnceLock<Result<jsonschema::Validator, String>> = OnceLock::new();

fn get_validator() -> Result<&'static jsonschema::Validator, String> {
    COMPILED_SCHEMA
        .get_or_init(|| {
            let schema_value: serde_json::Value = serde_json::from_str(CRITERIA_SCHEMA_JSON)
                .map_err(|e| format!("Invalid schema JSON: {}", e))?;

            jsonschema::options()
                .build(&schema_value)
                .map_err(|e| format!("Failed to compile schema: {}", e))
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Validate a criteria document against the schema.
///
/// # Returns
///
/// * `Ok(())` - Document is structurally valid
/// * `Err(Vec<String>)` - One message per violation, with its instance path
pub fn validate_criteria_schema(value: &serde_json::Value) -> Result<(), Vec<String>> {
    let validator = get_validator().map_err(|e| vec![e])?;

    let errors: Vec<String> = validator
        .iter_errors(value)
        .map(|e| format!("{} at {}", e, e.instance_path))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
