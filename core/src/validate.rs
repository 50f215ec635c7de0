use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::schema::{FieldSpec, Shape};

/// Which constraint an answer violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Nothing usable was supplied for a required field.
    Required,
    /// The answer could not be read as the declared shape.
    Parse,
    Pattern,
    Enum,
    Length,
    Range,
    MultipleOf,
    /// The field's own constraint is unusable (e.g. an invalid pattern).
    InvalidConstraint,
}

/// A rejected answer. Always recoverable: the caller is re-prompted.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{message}")]
pub struct ValidationFailure {
    pub field: String,
    pub kind: FailureKind,
    pub message: String,
}

impl ValidationFailure {
    fn new(spec: &FieldSpec, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            field: spec.name.clone(),
            kind,
            message: message.into(),
        }
    }
}

/// Coerce a free-form answer to the field's shape and check its constraints.
///
/// Blank input is a `Required` failure for required fields and `Value::Null`
/// (nothing supplied) otherwise.
pub fn validate(raw: &str, spec: &FieldSpec) -> Result<Value, ValidationFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return if spec.is_required() {
            Err(required_failure(spec))
        } else {
            Ok(Value::Null)
        };
    }

    match spec.shape {
        Shape::String => validate_string(trimmed, spec),
        Shape::Number => validate_number(trimmed, spec),
        Shape::Boolean => validate_boolean(trimmed, spec),
        Shape::Array => validate_array(trimmed, spec),
        Shape::Object => validate_object(trimmed, spec),
    }
}

fn required_failure(spec: &FieldSpec) -> ValidationFailure {
    ValidationFailure::new(
        spec,
        FailureKind::Required,
        format!("A value for '{}' is required.", spec.name),
    )
}

fn validate_string(value: &str, spec: &FieldSpec) -> Result<Value, ValidationFailure> {
    let constraints = &spec.constraints;
    let length = value.chars().count();

    if let Some(min) = constraints.min_length
        && length < min
    {
        return Err(ValidationFailure::new(
            spec,
            FailureKind::Length,
            format!("Value must be at least {min} characters long."),
        ));
    }
    if let Some(max) = constraints.max_length
        && length > max
    {
        return Err(ValidationFailure::new(
            spec,
            FailureKind::Length,
            format!("Value must be at most {max} characters long."),
        ));
    }

    if let Some(allowed) = &constraints.allowed
        && !allowed.iter().any(|candidate| candidate == value)
    {
        return Err(ValidationFailure::new(
            spec,
            FailureKind::Enum,
            format!("Value must be one of: {}.", allowed.join(", ")),
        ));
    }

    if let Some(pattern) = &constraints.pattern {
        let anchored = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            ValidationFailure::new(
                spec,
                FailureKind::InvalidConstraint,
                format!("Field pattern for '{}' is invalid: {e}", spec.name),
            )
        })?;
        if !anchored.is_match(value) {
            return Err(ValidationFailure::new(
                spec,
                FailureKind::Pattern,
                format!("Value must match the pattern {pattern}."),
            ));
        }
    }

    Ok(Value::String(value.to_string()))
}

fn validate_number(value: &str, spec: &FieldSpec) -> Result<Value, ValidationFailure> {
    let number = value
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| {
            ValidationFailure::new(spec, FailureKind::Parse, "Value must be a valid number.")
        })?;
    let constraints = &spec.constraints;

    if let Some(minimum) = constraints.minimum
        && number < minimum
    {
        return Err(ValidationFailure::new(
            spec,
            FailureKind::Range,
            format!("Value must be at least {minimum}."),
        ));
    }
    if let Some(maximum) = constraints.maximum
        && number > maximum
    {
        return Err(ValidationFailure::new(
            spec,
            FailureKind::Range,
            format!("Value must be at most {maximum}."),
        ));
    }
    if let Some(step) = constraints.multiple_of
        && step > 0.0
    {
        let quotient = number / step;
        if (quotient - quotient.round()).abs() > 1e-9 {
            return Err(ValidationFailure::new(
                spec,
                FailureKind::MultipleOf,
                format!("Value must be a multiple of {step}."),
            ));
        }
    }

    Ok(number_value(number))
}

/// Integral numbers become JSON integers, everything else a float.
pub(crate) fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < 9_007_199_254_740_992.0 {
        Value::from(number as i64)
    } else {
        serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn validate_boolean(value: &str, spec: &FieldSpec) -> Result<Value, ValidationFailure> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(Value::Bool(true)),
        "false" | "no" | "0" => Ok(Value::Bool(false)),
        _ => Err(ValidationFailure::new(
            spec,
            FailureKind::Parse,
            "Value must be a boolean (true/false, yes/no, 1/0).",
        )),
    }
}

fn validate_array(value: &str, spec: &FieldSpec) -> Result<Value, ValidationFailure> {
    let items = match serde_json::from_str::<Value>(value) {
        Ok(Value::Array(items)) => items,
        _ => value
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| Value::String(token.to_string()))
            .collect(),
    };

    if items.is_empty() {
        return if spec.is_required() {
            Err(required_failure(spec))
        } else {
            Ok(Value::Null)
        };
    }

    let constraints = &spec.constraints;
    if let Some(min) = constraints.min_length
        && items.len() < min
    {
        return Err(ValidationFailure::new(
            spec,
            FailureKind::Length,
            format!("Value must contain at least {min} items."),
        ));
    }
    if let Some(max) = constraints.max_length
        && items.len() > max
    {
        return Err(ValidationFailure::new(
            spec,
            FailureKind::Length,
            format!("Value must contain at most {max} items."),
        ));
    }

    Ok(Value::Array(items))
}

fn validate_object(value: &str, spec: &FieldSpec) -> Result<Value, ValidationFailure> {
    // Free-text object entry is error-prone; keep the text instead of failing.
    let object = match serde_json::from_str::<Value>(value) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), Value::String(value.to_string()));
            wrapped
        }
    };

    if object.is_empty() {
        return if spec.is_required() {
            Err(required_failure(spec))
        } else {
            Ok(Value::Null)
        };
    }
    Ok(Value::Object(object))
}
