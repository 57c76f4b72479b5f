//! JSON Schema subset validation for tool arguments
//!
//! Supported keywords: `type` (string or list), `properties`, `required`,
//! `enum`, `items`, `additionalProperties` (boolean or schema). Unknown
//! keywords are ignored, so richer schemas from protocol servers still pass
//! through the checks we do understand.

use serde_json::{Map, Value};

/// Validate `instance` against `schema`
///
/// # Errors
///
/// Returns a human-readable message naming the first failing location,
/// e.g. `$.path: expected string, got number`
pub fn validate(schema: &Value, instance: &Value) -> Result<(), String> {
    check(schema, instance, "$")
}

fn check(schema: &Value, instance: &Value, path: &str) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        // `true`, `{}` or anything non-object accepts all
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        check_type(expected, instance, path)?;
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(instance) {
            return Err(format!("{path}: value {instance} is not one of {}", Value::Array(allowed.clone())));
        }
    }

    if let Value::Object(object) = instance {
        check_object(schema, object, path)?;
    }

    if let (Some(items), Value::Array(elements)) = (schema.get("items"), instance) {
        for (i, element) in elements.iter().enumerate() {
            check(items, element, &format!("{path}[{i}]"))?;
        }
    }

    Ok(())
}

fn check_object(schema: &Map<String, Value>, object: &Map<String, Value>, path: &str) -> Result<(), String> {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                return Err(format!("{path}: missing required property `{name}`"));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let additional = schema.get("additionalProperties");

    for (name, value) in object {
        let child = format!("{path}.{name}");
        match properties.and_then(|p| p.get(name)) {
            Some(sub) => check(sub, value, &child)?,
            None => match additional {
                Some(Value::Bool(false)) => {
                    return Err(format!("{path}: unexpected property `{name}`"));
                }
                Some(sub @ Value::Object(_)) => check(sub, value, &child)?,
                _ => {}
            },
        }
    }

    Ok(())
}

fn check_type(expected: &Value, instance: &Value, path: &str) -> Result<(), String> {
    let matches = match expected {
        Value::String(name) => type_matches(name, instance),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| type_matches(name, instance)),
        _ => true,
    };

    if matches {
        Ok(())
    } else {
        Err(format!(
            "{path}: expected {}, got {}",
            match expected {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            type_name(instance)
        ))
    }
}

fn type_matches(name: &str, instance: &Value) -> bool {
    match name {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        "number" => instance.is_number(),
        "integer" => {
            instance.is_i64()
                || instance.is_u64()
                || instance.as_f64().is_some_and(|f| f.fract().abs() < f64::EPSILON)
        }
        // Unknown type names are not ours to reject
        _ => true,
    }
}

const fn type_name(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
