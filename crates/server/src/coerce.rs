//! Coercion of loose JSON scalars into strict typed fields.
//!
//! The upstream wire formats disagree about scalar encodings: `online` may be
//! a boolean, the string "1", or a number; client counts arrive as floats;
//! node ids are occasionally numeric. These helpers apply one uniform set of
//! rules so the snapshot builder only ever sees a single shape.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Booleans accept `true`, the strings "true"/"1"/"yes", and non-zero numbers.
pub fn as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.as_str(), "true" | "1" | "yes"),
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        _ => false,
    }
}

/// Integers truncate floats and parse a leading numeric prefix from strings.
pub fn as_i64(v: &Value) -> i64 {
    match v {
        Value::Number(n) => n
            .as_i64()
            .unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        Value::String(s) => leading_int(s),
        _ => 0,
    }
}

/// Floats parse a leading numeric prefix from strings.
pub fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => leading_float(s),
        _ => 0.0,
    }
}

/// Strings render integral numbers without a decimal point; nil becomes "".
pub fn as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return i.to_string();
            }
            let f = n.as_f64().unwrap_or(0.0);
            if f.is_finite() && f == f.trunc() {
                format!("{f:.0}")
            } else {
                f.to_string()
            }
        }
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => String::new(),
    }
}

fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let mut end = 0;
    for (i, c) in s.char_indices() {
        if i == 0 && (c == '+' || c == '-') {
            end = c.len_utf8();
            continue;
        }
        if c.is_ascii_digit() {
            end = i + 1;
        } else {
            break;
        }
    }
    s[..end].parse().unwrap_or(0)
}

fn leading_float(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = 0;
    for (i, c) in s.char_indices() {
        let numeric = c.is_ascii_digit()
            || c == '.'
            || c == 'e'
            || c == 'E'
            || ((c == '+' || c == '-') && (i == 0 || matches!(s[..i].chars().last(), Some('e' | 'E'))));
        if numeric {
            end = i + 1;
        } else {
            break;
        }
    }
    // Trim back until the prefix parses ("1e" -> "1").
    let mut prefix = &s[..end];
    while !prefix.is_empty() {
        if let Ok(f) = prefix.parse::<f64>() {
            return f;
        }
        prefix = &prefix[..prefix.len() - 1];
    }
    0.0
}

// serde field adapters for the wire-format structs.

pub fn flex_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(as_bool(&Value::deserialize(d)?))
}

pub fn flex_int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    Ok(as_i64(&Value::deserialize(d)?))
}

pub fn flex_float<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(as_f64(&Value::deserialize(d)?))
}

pub fn flex_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(as_string(&Value::deserialize(d)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bools_from_strings_and_numbers() {
        assert!(as_bool(&json!(true)));
        assert!(as_bool(&json!("true")));
        assert!(as_bool(&json!("1")));
        assert!(as_bool(&json!("yes")));
        assert!(as_bool(&json!(1)));
        assert!(as_bool(&json!(0.5)));
        assert!(!as_bool(&json!("0")));
        assert!(!as_bool(&json!("no")));
        assert!(!as_bool(&json!(0)));
        assert!(!as_bool(&json!(null)));
        assert!(!as_bool(&json!(["true"])));
    }

    #[test]
    fn ints_truncate_floats_and_parse_prefixes() {
        assert_eq!(as_i64(&json!(7)), 7);
        assert_eq!(as_i64(&json!(7.9)), 7);
        assert_eq!(as_i64(&json!(-3.2)), -3);
        assert_eq!(as_i64(&json!("42")), 42);
        assert_eq!(as_i64(&json!("17 nodes")), 17);
        assert_eq!(as_i64(&json!("-5x")), -5);
        assert_eq!(as_i64(&json!("abc")), 0);
        assert_eq!(as_i64(&json!(null)), 0);
    }

    #[test]
    fn floats_parse_leading_prefixes() {
        assert_eq!(as_f64(&json!(2.5)), 2.5);
        assert_eq!(as_f64(&json!("12.5")), 12.5);
        assert_eq!(as_f64(&json!("12.5abc")), 12.5);
        assert_eq!(as_f64(&json!("1e3")), 1000.0);
        assert_eq!(as_f64(&json!("1e")), 1.0);
        assert_eq!(as_f64(&json!("-0.25")), -0.25);
        assert_eq!(as_f64(&json!("x")), 0.0);
        assert_eq!(as_f64(&json!(null)), 0.0);
    }

    #[test]
    fn strings_render_integral_numbers_without_decimals() {
        assert_eq!(as_string(&json!("id-1")), "id-1");
        assert_eq!(as_string(&json!(12)), "12");
        assert_eq!(as_string(&json!(4.0)), "4");
        assert_eq!(as_string(&json!(12.5)), "12.5");
        assert_eq!(as_string(&json!(true)), "true");
        assert_eq!(as_string(&json!(null)), "");
    }

    #[test]
    fn flex_adapters_apply_on_deserialize() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "flex_bool")]
            online: bool,
            #[serde(deserialize_with = "flex_int")]
            clients: i64,
            #[serde(deserialize_with = "flex_string")]
            id: String,
        }

        let p: Probe =
            serde_json::from_str(r#"{"online":"1","clients":4.0,"id":12345}"#).expect("parse");
        assert!(p.online);
        assert_eq!(p.clients, 4);
        assert_eq!(p.id, "12345");
    }
}
