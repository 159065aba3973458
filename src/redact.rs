//! Sensitive-data masking for log output
//!
//! Produces a masked deep copy of a JSON value. Only used at logging call
//! sites; values returned to clients are never passed through here.

use serde_json::{Map, Value};

/// Field names masked by default when logging credential-bearing records
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "pass",
    "client_secret",
    "refresh_token",
    "access_token",
    "secret_key",
    "key",
    "iv",
];

/// Number of leading and trailing characters kept visible for long values
const VISIBLE_EDGE: usize = 4;

/// Mask sensitive fields in a JSON value
///
/// Objects and arrays are traversed recursively. A string stored under a
/// field listed in `sensitive` is masked; everything else is copied as-is.
/// Field matching is exact and case-sensitive.
pub fn mask(value: &Value, sensitive: &[&str]) -> Value {
    match value {
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (name, field) in fields {
                let masked = match field {
                    Value::String(s) if sensitive.contains(&name.as_str()) => {
                        Value::String(mask_str(s))
                    }
                    other => mask(other, sensitive),
                };
                out.insert(name.clone(), masked);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| mask(v, sensitive)).collect()),
        other => other.clone(),
    }
}

/// Mask a single string value
///
/// Values of up to 8 characters are fully replaced; longer values keep the
/// first and last 4 characters.
pub fn mask_str(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len();
    if len <= VISIBLE_EDGE * 2 {
        return "*".repeat(len);
    }

    let mut out = String::with_capacity(input.len());
    out.extend(&chars[..VISIBLE_EDGE]);
    out.push_str(&"*".repeat(len - VISIBLE_EDGE * 2));
    out.extend(&chars[len - VISIBLE_EDGE..]);
    out
}
