//! Immutable, ordered property maps.

use std::fmt;
use std::sync::Arc;

use super::Value;

/// Key comparison mode for entity lookups, distinct and grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseSensitivity {
    #[default]
    Sensitive,
    Insensitive,
}

impl CaseSensitivity {
    pub fn keys_match(self, a: &str, b: &str) -> bool {
        match self {
            CaseSensitivity::Sensitive => a == b,
            CaseSensitivity::Insensitive => a.eq_ignore_ascii_case(b),
        }
    }

    /// Normalise a key for hashing.
    pub fn fold(self, key: &str) -> String {
        match self {
            CaseSensitivity::Sensitive => key.to_owned(),
            CaseSensitivity::Insensitive => key.to_lowercase(),
        }
    }
}

/// An ordered property-name → value map.  Cloning shares the properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    properties: Arc<Vec<(String, Value)>>,
}

impl Entity {
    /// Build from pairs.  A repeated name keeps its first position and its
    /// last value.
    pub fn new(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut properties: Vec<(String, Value)> = Vec::new();
        for (name, value) in pairs {
            match properties.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) => slot.1 = value,
                None => properties.push((name, value)),
            }
        }
        Entity { properties: Arc::new(properties) }
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.get_with(name, CaseSensitivity::Sensitive)
    }

    pub fn get_with(&self, name: &str, case: CaseSensitivity) -> Option<&Value> {
        self.properties
            .iter()
            .find(|(n, _)| case.keys_match(n, name))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str, case: CaseSensitivity) -> bool {
        self.get_with(name, case).is_some()
    }

    /// A copy with `name` set to `value`, replacing in place or appending.
    pub fn with_value(&self, name: &str, value: Value) -> Entity {
        let mut properties = (*self.properties).clone();
        match properties.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => properties.push((name.to_owned(), value)),
        }
        Entity { properties: Arc::new(properties) }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.properties.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.properties.iter().map(|(n, _)| n.as_str())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (name, value)) in self.properties.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "'{name}': ")?;
            value.fmt_nested(f)?;
        }
        f.write_str(")")
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Entity {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Entity::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order_and_last_value() {
        let e: Entity = [("a", 1i64), ("b", 2), ("a", 3)].into_iter().collect();
        assert_eq!(e.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(e.get("a"), Some(&Value::Int(3)));
    }

    #[test]
    fn case_insensitive_lookup() {
        let e: Entity = [("Name", "x")].into_iter().collect();
        assert!(e.get("name").is_none());
        assert_eq!(
            e.get_with("name", CaseSensitivity::Insensitive),
            Some(&Value::from("x"))
        );
    }

    #[test]
    fn with_value_is_a_copy() {
        let e: Entity = [("a", 1i64)].into_iter().collect();
        let f = e.with_value("b", Value::Bool(true));
        assert_eq!(e.len(), 1);
        assert_eq!(f.len(), 2);
        assert_eq!(f.to_string(), "('a': 1 'b': true)");
    }

    #[test]
    fn display_quotes_nested_strings() {
        let e: Entity = [("s", "hi")].into_iter().collect();
        assert_eq!(e.to_string(), "('s': \"hi\")");
    }
}
