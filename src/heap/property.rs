// src/heap/property.rs
//! Property keys and insertion-ordered property storage

use ahash::RandomState;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Own-property key. Integer indices and names are separate key spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKey {
    Index(u32),
    Name(String),
}

impl PropertyKey {
    /// Parse a canonical array index ("0", "17"; not "017", "-1" or 2^32 - 1).
    fn parse_index(name: &str) -> Option<u32> {
        if name.is_empty() || (name.len() > 1 && name.starts_with('0')) {
            return None;
        }
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        name.parse::<u32>().ok().filter(|&index| index != u32::MAX)
    }

    pub fn as_index(&self) -> Option<u32> {
        match self {
            PropertyKey::Index(index) => Some(*index),
            PropertyKey::Name(_) => None,
        }
    }
}

impl From<u32> for PropertyKey {
    fn from(index: u32) -> Self {
        PropertyKey::Index(index)
    }
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        match Self::parse_index(name) {
            Some(index) => PropertyKey::Index(index),
            None => PropertyKey::Name(name.to_string()),
        }
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        match Self::parse_index(&name) {
            Some(index) => PropertyKey::Index(index),
            None => PropertyKey::Name(name),
        }
    }
}

impl From<&PropertyKey> for PropertyKey {
    fn from(key: &PropertyKey) -> Self {
        key.clone()
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyKey::Index(index) => write!(f, "{}", index),
            PropertyKey::Name(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property<V> {
    pub value: V,
    pub enumerable: bool,
}

/// Own properties of one object
#[derive(Debug, Clone)]
pub struct PropertyMap<V> {
    entries: IndexMap<PropertyKey, Property<V>, RandomState>,
}

impl<V> Default for PropertyMap<V> {
    fn default() -> Self {
        Self {
            entries: IndexMap::with_hasher(RandomState::new()),
        }
    }
}

impl<V> PropertyMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign a value; a new key becomes enumerable, an existing key keeps its attributes.
    pub fn set(&mut self, key: PropertyKey, value: V) {
        match self.entries.get_mut(&key) {
            Some(property) => property.value = value,
            None => {
                self.entries.insert(
                    key,
                    Property {
                        value,
                        enumerable: true,
                    },
                );
            }
        }
    }

    /// Create or redefine a property with explicit enumerability.
    pub fn define(&mut self, key: PropertyKey, value: V, enumerable: bool) {
        self.entries.insert(key, Property { value, enumerable });
    }

    pub fn get(&self, key: &PropertyKey) -> Option<&V> {
        self.entries.get(key).map(|property| &property.value)
    }

    pub fn contains(&self, key: &PropertyKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Own enumerable keys in JS order: indices ascending, then names in insertion order.
    pub fn enumerable_keys(&self) -> Vec<PropertyKey> {
        let mut indices: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, property)| property.enumerable)
            .filter_map(|(key, _)| key.as_index())
            .collect();
        indices.sort_unstable();

        let names = self
            .entries
            .iter()
            .filter(|(key, property)| property.enumerable && key.as_index().is_none())
            .map(|(key, _)| key.clone());

        indices
            .into_iter()
            .map(PropertyKey::Index)
            .chain(names)
            .collect()
    }

    /// Every stored value, enumerable or not
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|property| &property.value)
    }
}
