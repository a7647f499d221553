//! Restriction predicates over key attributes.
//!
//! A restriction is a conjunction of comparisons such as
//! `session_id >= 3 AND filter_name = "low"`. `&` may stand in for `AND`.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{PipelineError, PipelineResult};
use crate::key::{Key, unquoted_chars};
use crate::row::Row;
use crate::value::Value;

static CONDITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(<=|>=|!=|==|=|<|>)\s*(.+?)\s*$")
        .expect("condition pattern is valid")
});

static CONJUNCTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+and\s+|\s*&\s*").expect("conjunction pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "=" | "==" => CompareOp::Eq,
            "!=" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            _ => return None,
        })
    }

    fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn holds(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (CompareOp::Ne, None) => true,
            (_, None) => false,
            (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
            (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
            (CompareOp::Lt, Some(o)) => o == Ordering::Less,
            (CompareOp::Le, Some(o)) => o != Ordering::Greater,
            (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
            (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub attribute: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    fn holds(&self, actual: Option<&Value>) -> bool {
        match actual {
            Some(v) => self.op.holds(v.compare(&self.value)),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Restriction {
    conditions: Vec<Condition>,
}

impl Restriction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, attribute: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            attribute: attribute.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().map(|c| c.attribute.as_str())
    }

    pub fn matches(&self, key: &Key) -> bool {
        self.conditions.iter().all(|c| c.holds(key.get(&c.attribute)))
    }

    /// Match against key and secondary attributes.
    pub fn matches_row(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.holds(row.get(&c.attribute)))
    }

    /// Fails when the restriction names an attribute outside `schema`.
    pub fn check_attributes<S: AsRef<str>>(&self, table: &str, schema: &[S]) -> PipelineResult<()> {
        for attr in self.attributes() {
            if !schema.iter().any(|s| s.as_ref() == attr) {
                return Err(PipelineError::InvalidRestriction(format!(
                    "{attr} is not a key attribute of {table} (expected one of: {})",
                    schema.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(", ")
                )));
            }
        }
        Ok(())
    }
}

impl From<&Key> for Restriction {
    fn from(key: &Key) -> Self {
        Self {
            conditions: key
                .iter()
                .map(|(name, value)| Condition {
                    attribute: name.to_string(),
                    op: CompareOp::Eq,
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

impl FromStr for Restriction {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut restriction = Restriction::new();
        if s.trim().is_empty() {
            return Ok(restriction);
        }
        for part in split_conjunctions(s.trim()) {
            let caps = CONDITION
                .captures(part)
                .ok_or_else(|| PipelineError::InvalidRestriction(format!("cannot parse {part:?}")))?;
            let op = CompareOp::parse(&caps[2])
                .ok_or_else(|| PipelineError::InvalidRestriction(format!("unknown operator {}", &caps[2])))?;
            let value = match caps[3].parse::<Value>() {
                Ok(v) => v,
                Err(never) => match never {},
            };
            restriction.conditions.push(Condition {
                attribute: caps[1].to_string(),
                op,
                value,
            });
        }
        Ok(restriction)
    }
}

/// Split on `AND` / `&` separators that sit outside quoted literals.
fn split_conjunctions(s: &str) -> Vec<&str> {
    let unquoted: HashSet<usize> = unquoted_chars(s).map(|(i, _)| i).collect();
    let mut parts = Vec::new();
    let mut start = 0;
    for separator in CONJUNCTION.find_iter(s) {
        if unquoted.contains(&separator.start()) {
            parts.push(&s[start..separator.start()]);
            start = separator.end();
        }
    }
    parts.push(&s[start..]);
    parts
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "{} {} {}", c.attribute, c.op.symbol(), c.value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(session: i64, filter: &str) -> Key {
        Key::new().with("session_id", session).with("filter_name", filter)
    }

    #[test]
    fn parses_conjunctions() {
        let r: Restriction = "session_id >= 2 AND filter_name = \"low\"".parse().unwrap();
        assert_eq!(r.conditions().len(), 2);
        assert!(r.matches(&key(2, "low")));
        assert!(!r.matches(&key(1, "low")));
        assert!(!r.matches(&key(3, "high")));

        let amp: Restriction = "session_id=1 & filter_name!=high".parse().unwrap();
        assert!(amp.matches(&key(1, "low")));
        assert!(!amp.matches(&key(1, "high")));
    }

    #[test]
    fn conjunctions_inside_quotes_are_literal() {
        let r: Restriction = r#"filter_name = "sand and gravel""#.parse().unwrap();
        assert_eq!(r.conditions().len(), 1);
        assert!(r.matches(&key(1, "sand and gravel")));

        let r: Restriction = r#"session_id = 1 AND filter_name = 'a & b'"#.parse().unwrap();
        assert_eq!(r.conditions().len(), 2);
        assert!(r.matches(&key(1, "a & b")));
        assert!(!r.matches(&key(1, "a")));

        let again: Restriction = r.to_string().parse().unwrap();
        assert_eq!(again, r);
    }

    #[test]
    fn lowercase_and_is_accepted() {
        let r: Restriction = "session_id < 3 and session_id > 1".parse().unwrap();
        assert!(r.matches(&key(2, "x")));
        assert!(!r.matches(&key(3, "x")));
    }

    #[test]
    fn missing_attribute_never_matches() {
        let r: Restriction = "unit_id = 1".parse().unwrap();
        assert!(!r.matches(&key(1, "low")));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("session_id".parse::<Restriction>().is_err());
        assert!("= 3".parse::<Restriction>().is_err());
        assert!("session_id ~ 3".parse::<Restriction>().is_err());
    }

    #[test]
    fn empty_restriction_matches_everything() {
        let r: Restriction = "  ".parse().unwrap();
        assert!(r.is_empty());
        assert!(r.matches(&key(1, "low")));
    }

    #[test]
    fn check_attributes_reports_unknown_names() {
        let r: Restriction = "subject = rat1".parse().unwrap();
        let err = r.check_attributes("FilteredSignal", &["session_id", "filter_name"]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRestriction(_)));
    }

    #[test]
    fn numeric_comparison_mixes_int_and_float() {
        let r: Restriction = "cutoff > 2.5".parse().unwrap();
        assert!(r.matches(&Key::new().with("cutoff", 3)));
        assert!(!r.matches(&Key::new().with("cutoff", 2)));
    }

    #[test]
    fn display_roundtrips() {
        let r: Restriction = "session_id >= 2 & filter_name = low".parse().unwrap();
        let again: Restriction = r.to_string().parse().unwrap();
        assert_eq!(r, again);
    }
}
