//! Conversion of extracted JSON values into metric observations.

use crate::error::ValueError;
use serde_json::Value;

/// Token a stringified null carries; treated like an absent value.
pub const NIL_TOKEN: &str = "<nil>";

/// Convert an extracted value into a number a metric can observe.
///
/// Numbers pass through, booleans become `1.0`/`0.0`, null becomes NaN.
/// Strings are tried as a float literal, then as a boolean literal, then as
/// [`NIL_TOKEN`]; anything else is an error carrying both parse failures.
pub fn sanitize_value(value: &Value) -> Result<f64, ValueError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ValueError::Unparsable(format!("number {n} out of range"))),
        Value::Bool(b) => Ok(bool_to_f64(*b)),
        Value::Null => Ok(f64::NAN),
        Value::String(s) => sanitize_str(s),
        Value::Array(_) => Err(ValueError::UnsupportedType {
            value: value.to_string(),
            kind: "array",
        }),
        Value::Object(_) => Err(ValueError::UnsupportedType {
            value: value.to_string(),
            kind: "object",
        }),
    }
}

fn sanitize_str(s: &str) -> Result<f64, ValueError> {
    let float_err = match s.parse::<f64>() {
        Ok(v) => return Ok(v),
        Err(err) => err,
    };

    let bool_err = match parse_bool(s) {
        Ok(b) => return Ok(bool_to_f64(b)),
        Err(err) => err,
    };

    if s == NIL_TOKEN {
        return Ok(f64::NAN);
    }

    Err(ValueError::Unparsable(format!(
        "parsing {s:?}: {float_err}; {bool_err}"
    )))
}

/// Boolean literals in every spelling the exporter has always accepted.
fn parse_bool(s: &str) -> Result<bool, String> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(format!("parsing {s:?}: invalid boolean literal")),
    }
}

fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}
