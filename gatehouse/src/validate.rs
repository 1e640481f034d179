//! Request validation
//!
//! Checks run in a fixed order and the first failure short-circuits:
//! content type, required headers, forbidden headers, body regex, JSON
//! schema. Binary bodies skip the regex and schema checks.

use axum::http::{header::CONTENT_TYPE, HeaderMap};
use regex::Regex;
use serde_json::Value;

use crate::body::RequestBody;
use crate::catalog::ValidationRules;

/// Validate a request against the endpoint's rules
///
/// Returns the failure description on the first violated rule.
pub fn validate_request(
    rules: &ValidationRules,
    headers: &HeaderMap,
    body: &RequestBody,
) -> Result<(), String> {
    if rules.is_empty() {
        return Ok(());
    }

    if let Some(expected) = &rules.content_type {
        let actual = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let media_type = actual.split(';').next().unwrap_or("").trim();
        if !media_type.eq_ignore_ascii_case(expected) {
            return Err(format!(
                "content type {:?} does not match required {:?}",
                media_type, expected
            ));
        }
    }

    for required in &rules.required_headers {
        if !headers.contains_key(required.as_str()) {
            return Err(format!("missing required header {required}"));
        }
    }

    for forbidden in &rules.forbidden_headers {
        if headers.contains_key(forbidden.as_str()) {
            return Err(format!("forbidden header {forbidden} present"));
        }
    }

    if body.is_binary() {
        return Ok(());
    }

    if let Some(pattern) = &rules.body_pattern {
        // Patterns are validated at boot for static catalogs; a bad
        // pattern from elsewhere counts as a validation failure.
        let regex = Regex::new(pattern).map_err(|e| format!("invalid body pattern: {e}"))?;
        let text = body.as_text().unwrap_or("");
        if !regex.is_match(text) {
            return Err("body does not match required pattern".to_string());
        }
    }

    if let Some(schema) = &rules.body_schema {
        let text = body.as_text().unwrap_or("");
        let value: Value = serde_json::from_str(text)
            .map_err(|e| format!("body is not valid JSON: {e}"))?;
        check_schema(schema, &value, "$")?;
    }

    Ok(())
}

/// Structural JSON schema check
///
/// Supports the subset the catalog uses: `type`, `required`,
/// `properties`, `items`, `enum`, `minLength`/`maxLength`,
/// `minimum`/`maximum`. Unknown keywords are ignored.
fn check_schema(schema: &Value, value: &Value, path: &str) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(type_spec) = schema_obj.get("type") {
        let allowed: Vec<&str> = match type_spec {
            Value::String(s) => vec![s.as_str()],
            Value::Array(types) => types.iter().filter_map(Value::as_str).collect(),
            _ => vec![],
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, value)) {
            return Err(format!(
                "{path}: expected type {}, got {}",
                allowed.join("|"),
                type_name(value)
            ));
        }
    }

    if let Some(options) = schema_obj.get("enum").and_then(Value::as_array) {
        if !options.contains(value) {
            return Err(format!("{path}: value not in enum"));
        }
    }

    if let Some(text) = value.as_str() {
        if let Some(min) = schema_obj.get("minLength").and_then(Value::as_u64) {
            if (text.chars().count() as u64) < min {
                return Err(format!("{path}: shorter than minLength {min}"));
            }
        }
        if let Some(max) = schema_obj.get("maxLength").and_then(Value::as_u64) {
            if (text.chars().count() as u64) > max {
                return Err(format!("{path}: longer than maxLength {max}"));
            }
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = schema_obj.get("minimum").and_then(Value::as_f64) {
            if number < min {
                return Err(format!("{path}: below minimum {min}"));
            }
        }
        if let Some(max) = schema_obj.get("maximum").and_then(Value::as_f64) {
            if number > max {
                return Err(format!("{path}: above maximum {max}"));
            }
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    return Err(format!("{path}: missing required property {name}"));
                }
            }
        }
        if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
            for (name, child_schema) in properties {
                if let Some(child) = object.get(name) {
                    check_schema(child_schema, child, &format!("{path}.{name}"))?;
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(item_schema) = schema_obj.get("items") {
            for (index, item) in items.iter().enumerate() {
                check_schema(item_schema, item, &format!("{path}[{index}]"))?;
            }
        }
    }

    Ok(())
}

fn type_matches(name: &str, value: &Value) -> bool {
    match name {
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

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
