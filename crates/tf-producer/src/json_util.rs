//! Shared JSON parsing helpers for exchange sources.
//!
//! Exchanges encode numbers either as JSON strings (`"30000.5"`) or as
//! native numbers (`30000.5`); these helpers accept both.

/// Parse a JSON value (string or number) as `f64`.
#[inline]
pub fn parse_str_f64(v: Option<&serde_json::Value>) -> Option<f64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        fast_float2::parse(s).ok()
    } else {
        v.as_f64()
    }
}

/// Parse a JSON value (string or number) as `u64`.
#[inline]
pub fn parse_str_u64(v: Option<&serde_json::Value>) -> Option<u64> {
    let v = v?;
    if let Some(s) = v.as_str() {
        s.parse().ok()
    } else {
        v.as_u64()
    }
}

/// Parse a named field on a JSON object as `f64` (string or number).
#[inline]
pub fn parse_f64_field(v: &serde_json::Value, key: &str) -> Option<f64> {
    parse_str_f64(v.get(key))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_strings_and_numbers() {
        let v = json!({ "a": "16500.50", "b": 3.25, "c": "nope", "t": "1700000000000" });
        assert_eq!(parse_f64_field(&v, "a"), Some(16500.5));
        assert_eq!(parse_f64_field(&v, "b"), Some(3.25));
        assert_eq!(parse_f64_field(&v, "c"), None);
        assert_eq!(parse_f64_field(&v, "missing"), None);
        assert_eq!(parse_str_u64(v.get("t")), Some(1_700_000_000_000));
    }
}
