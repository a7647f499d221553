//! Attribute values stored in keys and rows.
//!
//! Values are immutable scalars. Floats compare and hash by bit pattern so
//! that keys containing them can live in hash sets; mixed int/float
//! comparisons used by restrictions go through [`Value::compare`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Content address of a large object kept outside the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobRef {
    pub blob: String,
}

/// A single attribute value.
///
/// Serialized untagged (`3`, `2.5`, `"low"`, `{"blob": ..}`). JSON has no
/// literal for NaN or the infinities, so non-finite floats are written as
/// `{"float": "nan" | "inf" | "-inf"}`. NaN payload bits are not kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ValueRepr", into = "ValueRepr")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(BlobRef),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ValueRepr {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(BlobRef),
    NonFinite { float: NonFinite },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum NonFinite {
    #[serde(rename = "nan")]
    Nan,
    #[serde(rename = "inf")]
    Inf,
    #[serde(rename = "-inf")]
    NegInf,
}

impl From<Value> for ValueRepr {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => ValueRepr::Bool(b),
            Value::Int(v) => ValueRepr::Int(v),
            Value::Float(v) if v.is_nan() => ValueRepr::NonFinite {
                float: NonFinite::Nan,
            },
            Value::Float(v) if v == f64::INFINITY => ValueRepr::NonFinite {
                float: NonFinite::Inf,
            },
            Value::Float(v) if v == f64::NEG_INFINITY => ValueRepr::NonFinite {
                float: NonFinite::NegInf,
            },
            Value::Float(v) => ValueRepr::Float(v),
            Value::Text(s) => ValueRepr::Text(s),
            Value::Blob(b) => ValueRepr::Blob(b),
        }
    }
}

impl From<ValueRepr> for Value {
    fn from(repr: ValueRepr) -> Self {
        match repr {
            ValueRepr::Bool(b) => Value::Bool(b),
            ValueRepr::Int(v) => Value::Int(v),
            ValueRepr::Float(v) => Value::Float(v),
            ValueRepr::Text(s) => Value::Text(s),
            ValueRepr::Blob(b) => Value::Blob(b),
            ValueRepr::NonFinite { float } => Value::Float(match float {
                NonFinite::Nan => f64::NAN,
                NonFinite::Inf => f64::INFINITY,
                NonFinite::NegInf => f64::NEG_INFINITY,
            }),
        }
    }
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn blob(address: impl Into<String>) -> Self {
        Value::Blob(BlobRef {
            blob: address.into(),
        })
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }

    /// Loose comparison used by restriction predicates.
    ///
    /// Ints and floats compare numerically; other mixed-type pairs are
    /// incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (a, b) if a.rank() == b.rank() => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Feed a type-tagged encoding of this value into a digest.
    pub(crate) fn digest_into(&self, hasher: &mut impl sha2::Digest) {
        hasher.update([self.rank()]);
        match self {
            Value::Bool(b) => hasher.update([*b as u8]),
            Value::Int(v) => hasher.update(v.to_be_bytes()),
            Value::Float(v) => hasher.update(v.to_bits().to_be_bytes()),
            Value::Text(s) => hasher.update(s.as_bytes()),
            Value::Blob(b) => hasher.update(b.blob.as_bytes()),
        }
        hasher.update([0u8]);
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Blob(_) => 4,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Bool(b) => b.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Blob(b) => b.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Blob(b) => write!(f, "blob:{}", b.blob),
        }
    }
}

impl FromStr for Value {
    type Err = std::convert::Infallible;

    /// Parse a literal as typed by a user: quoted strings stay strings (with
    /// the escapes `Display` writes undone), `true`/`false` are bools,
    /// numbers are ints or floats, `blob:` marks a blob reference, anything
    /// else is bare text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() >= 2
            && ((s.starts_with('"') && s.ends_with('"'))
                || (s.starts_with('\'') && s.ends_with('\'')))
        {
            return Ok(Value::Text(unescape(&s[1..s.len() - 1])));
        }
        if let Some(address) = s.strip_prefix("blob:") {
            return Ok(Value::blob(address));
        }
        match s {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            _ => {}
        }
        if let Ok(v) = s.parse::<i64>() {
            return Ok(Value::Int(v));
        }
        if s.chars().any(|c| c.is_ascii_digit()) {
            if let Ok(v) = s.parse::<f64>() {
                return Ok(Value::Float(v));
            }
        }
        Ok(Value::Text(s.to_string()))
    }
}

/// Undo the escapes of `str`'s `Debug` output. Unknown escapes are kept
/// verbatim, so a lone backslash in a quoted path survives.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(c @ ('\\' | '"' | '\'')) => out.push(c),
            Some('u') => {
                let rest = chars.as_str();
                let decoded = rest
                    .strip_prefix('{')
                    .and_then(|r| r.split_once('}'))
                    .and_then(|(hex, tail)| {
                        u32::from_str_radix(hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .map(|c| (c, tail))
                    });
                match decoded {
                    Some((c, tail)) => {
                        out.push(c);
                        chars = tail.chars();
                    }
                    None => out.push_str("\\u"),
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Value {
        s.parse().unwrap()
    }

    #[test]
    fn literal_parsing_infers_types() {
        assert_eq!(parse("1"), Value::Int(1));
        assert_eq!(parse("-4"), Value::Int(-4));
        assert_eq!(parse("2.5"), Value::Float(2.5));
        assert_eq!(parse("true"), Value::Bool(true));
        assert_eq!(parse("\"42\""), Value::text("42"));
        assert_eq!(parse("'low'"), Value::text("low"));
        assert_eq!(parse("low"), Value::text("low"));
        assert_eq!(parse("blob:sha256-abc"), Value::blob("sha256-abc"));
        // words that f64 would accept stay text
        assert_eq!(parse("inf"), Value::text("inf"));
        assert_eq!(parse("nan"), Value::text("nan"));
    }

    #[test]
    fn floats_are_hashable_by_bits() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(Value::Float(0.5));
        set.insert(Value::Float(0.5));
        set.insert(Value::Float(f64::NAN));
        set.insert(Value::Float(f64::NAN));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn compare_crosses_int_and_float() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.0)), Some(Ordering::Equal));
        assert_eq!(Value::Float(1.5).compare(&Value::Int(2)), Some(Ordering::Less));
        assert_eq!(Value::text("a").compare(&Value::Int(1)), None);
        assert_eq!(Value::text("a").compare(&Value::text("b")), Some(Ordering::Less));
    }

    #[test]
    fn json_roundtrip_keeps_types() {
        let values = vec![
            Value::Int(3),
            Value::Float(3.25),
            Value::Bool(false),
            Value::text("high"),
            Value::blob("sha256-00ff"),
        ];
        let json = serde_json::to_string(&values).unwrap();
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(values, back);
    }

    #[test]
    fn non_finite_floats_survive_json() {
        let values = vec![
            Value::Float(f64::NAN),
            Value::Float(f64::INFINITY),
            Value::Float(f64::NEG_INFINITY),
            Value::Float(-0.0),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert!(!json.contains("null"), "{json}");
        assert!(json.contains(r#"{"float":"nan"}"#), "{json}");

        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn quoted_text_round_trips_through_display() {
        for text in ["a\"b", r"C:\raw\day1", "tab\there", "bell\u{7}", "plain"] {
            let value = Value::text(text);
            assert_eq!(parse(&value.to_string()), value, "{value}");
        }
        // backslashes that escape nothing are kept
        assert_eq!(parse(r#""C:\data""#), Value::text(r"C:\data"));
    }

    #[test]
    fn display_quotes_text() {
        assert_eq!(Value::text("low").to_string(), "\"low\"");
        assert_eq!(Value::Float(1.0).to_string(), "1.0");
        assert_eq!(Value::Int(7).to_string(), "7");
    }
}
