//! Row identity: an ordered mapping of primary-key attribute names to values.
//!
//! Keys are the unit of dependency tracking. Attribute names are kept
//! sorted, so equality, hashing, and the digest are independent of the
//! order attributes were inserted in.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};
use crate::value::Value;

/// Number of hex characters kept from a key digest.
const DIGEST_HEX_LEN: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(BTreeMap<String, Value>);

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Sub-key restricted to the named attributes. Names the key does not
    /// carry are skipped.
    pub fn project<S: AsRef<str>>(&self, attributes: &[S]) -> Key {
        let mut out = BTreeMap::new();
        for name in attributes {
            if let Some((k, v)) = self.0.get_key_value(name.as_ref()) {
                out.insert(k.clone(), v.clone());
            }
        }
        Key(out)
    }

    /// Merge two keys. Shared attributes must agree.
    pub fn join(&self, other: &Key) -> PipelineResult<Key> {
        let mut out = self.0.clone();
        for (name, value) in &other.0 {
            match out.get(name) {
                Some(existing) if existing != value => {
                    return Err(PipelineError::KeyConflict {
                        attribute: name.clone(),
                        left: existing.clone(),
                        right: value.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    out.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(Key(out))
    }

    /// True when every attribute of `partial` is present here with an equal value.
    pub fn matches(&self, partial: &Key) -> bool {
        partial
            .0
            .iter()
            .all(|(name, value)| self.0.get(name) == Some(value))
    }

    pub fn contains_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|n| self.0.contains_key(n.as_ref()))
    }

    /// True when the key carries exactly the given attribute names.
    pub fn has_schema<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.0.len() == names.len() && self.contains_all(names)
    }

    /// Deterministic 32-hex-character digest of the key.
    pub fn hash_hex(&self) -> String {
        let mut hasher = Sha256::new();
        self.digest_into(&mut hasher);
        truncate_digest(hasher)
    }

    fn digest_into(&self, hasher: &mut Sha256) {
        for (name, value) in &self.0 {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            value.digest_into(hasher);
        }
    }
}

/// Digest of a key scoped by a namespace string, e.g. a source table name.
pub fn scoped_digest(scope: &str, key: &Key) -> String {
    let mut hasher = Sha256::new();
    hasher.update(scope.as_bytes());
    hasher.update([0xffu8]);
    key.digest_into(&mut hasher);
    truncate_digest(hasher)
}

fn truncate_digest(hasher: Sha256) -> String {
    let mut out = hex::encode(hasher.finalize());
    out.truncate(DIGEST_HEX_LEN);
    out
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

impl FromStr for Key {
    type Err = PipelineError;

    /// Parse `name=value` pairs separated by commas, optionally wrapped in braces.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s.trim();
        let body = body
            .strip_prefix('{')
            .and_then(|b| b.strip_suffix('}'))
            .unwrap_or(body);
        let mut key = Key::new();
        for pair in split_outside_quotes(body, ',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair
                .split_once('=')
                .ok_or_else(|| PipelineError::InvalidKey(format!("expected name=value, got {pair:?}")))?;
            let name = name.trim();
            if !crate::table::is_identifier(name) {
                return Err(PipelineError::InvalidKey(format!(
                    "invalid attribute name {name:?}"
                )));
            }
            if key.contains(name) {
                return Err(PipelineError::InvalidKey(format!(
                    "attribute {name} given twice"
                )));
            }
            let value = match value.parse::<Value>() {
                Ok(v) => v,
                Err(never) => match never {},
            };
            key.insert(name, value);
        }
        if key.is_empty() {
            return Err(PipelineError::InvalidKey(format!("empty key: {s:?}")));
        }
        Ok(key)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Key {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Key(iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect())
    }
}

/// Characters of `s` that sit outside single or double quotes, with their
/// byte offsets. Inside quotes a backslash escapes the next character.
pub(crate) fn unquoted_chars(s: &str) -> impl Iterator<Item = (usize, char)> + '_ {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    s.char_indices().filter(move |&(_, c)| match quote {
        Some(_) if escaped => {
            escaped = false;
            false
        }
        Some(_) if c == '\\' => {
            escaped = true;
            false
        }
        Some(q) => {
            if c == q {
                quote = None;
            }
            false
        }
        None if c == '"' || c == '\'' => {
            quote = Some(c);
            false
        }
        None => true,
    })
}

/// Split on `sep` while ignoring separators inside single or double quotes.
pub(crate) fn split_outside_quotes(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, c) in unquoted_chars(s).filter(|&(_, c)| c == sep) {
        parts.push(&s[start..i]);
        start = i + c.len_utf8();
    }
    parts.push(&s[start..]);
    parts
}
