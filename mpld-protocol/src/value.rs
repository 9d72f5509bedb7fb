// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use std::fmt;

/// A small symbolic name, encoded with its own extension tag so the peer can
/// tell it apart from an ordinary string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Atom(String);

impl Atom {
    pub fn new(name: impl Into<String>) -> Self {
        Atom(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Atom {
    fn from(name: &str) -> Self {
        Atom(name.to_owned())
    }
}

impl From<String> for Atom {
    fn from(name: String) -> Self {
        Atom(name)
    }
}

/// Attribute keys are either plain strings or atoms; lookups compare by name
/// in both cases.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrKey {
    Str(String),
    Atom(Atom),
}

impl AttrKey {
    pub fn as_str(&self) -> &str {
        match self {
            AttrKey::Str(s) => s,
            AttrKey::Atom(a) => a.as_str(),
        }
    }
}

impl From<&str> for AttrKey {
    fn from(key: &str) -> Self {
        AttrKey::Str(key.to_owned())
    }
}

impl From<String> for AttrKey {
    fn from(key: String) -> Self {
        AttrKey::Str(key)
    }
}

impl From<Atom> for AttrKey {
    fn from(key: Atom) -> Self {
        AttrKey::Atom(key)
    }
}

/// The closed sum of values an attribute may carry. Anything outside this
/// set is rejected at the producing side by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
    List(Vec<AttrValue>),
    Map(AttrMap),
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_owned())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v.into())
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for AttrValue {
    fn from(v: DateTime<Utc>) -> Self {
        AttrValue::Timestamp(v)
    }
}

impl From<AttrMap> for AttrValue {
    fn from(v: AttrMap) -> Self {
        AttrValue::Map(v)
    }
}

impl From<Vec<AttrValue>> for AttrValue {
    fn from(v: Vec<AttrValue>) -> Self {
        AttrValue::List(v)
    }
}

/// An insertion-ordered attribute mapping. Inserting an existing key keeps
/// its original position and replaces the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrMap {
    entries: Vec<(AttrKey, AttrValue)>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<AttrKey>, value: impl Into<AttrValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k.as_str() == key.as_str()) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(AttrKey, AttrValue)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(AttrKey, AttrValue)> for AttrMap {
    fn from_iter<I: IntoIterator<Item = (AttrKey, AttrValue)>>(iter: I) -> Self {
        let mut map = AttrMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl<'a> IntoIterator for &'a AttrMap {
    type Item = &'a (AttrKey, AttrValue);
    type IntoIter = std::slice::Iter<'a, (AttrKey, AttrValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_preserves_position_and_replaces_value() {
        let mut map = AttrMap::new();
        map.insert("a", 1i64);
        map.insert("b", 2i64);
        map.insert("a", 3i64);

        let keys: Vec<&str> = map.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["a", "b"]);
        assert_eq!(map.get("a"), Some(&AttrValue::Int(3)));
    }

    #[test]
    fn atom_and_string_keys_collide_by_name() {
        let mut map = AttrMap::new();
        map.insert(Atom::new("k"), "first");
        map.insert("k", "second");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("k"), Some(&AttrValue::Str("second".into())));
    }
}
