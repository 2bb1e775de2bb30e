// src/heap/elements.rs
//! Array element storage
//!
//! Elements are kept sparsely, keyed by index, next to an explicit length.
//! Memory and iteration cost follow the number of present elements, so a
//! write like `a[4294967294] = 1` is as cheap as `a[0] = 1`.

use super::arena::AllocError;
use std::collections::BTreeMap;

/// Largest array length (2^32 - 1); valid indices are below it.
pub const MAX_ARRAY_LENGTH: usize = u32::MAX as usize;

#[derive(Debug, Clone, PartialEq)]
pub struct Elements<V> {
    present: BTreeMap<u32, V>,
    length: u32,
}

impl<V> Default for Elements<V> {
    fn default() -> Self {
        Self {
            present: BTreeMap::new(),
            length: 0,
        }
    }
}

impl<V> Elements<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `length` holes.
    pub fn with_length(length: usize) -> Result<Self, AllocError> {
        Ok(Self {
            present: BTreeMap::new(),
            length: checked_length(length)?,
        })
    }

    /// Dense elements in iteration order.
    pub fn from_values<I>(values: I) -> Result<Self, AllocError>
    where
        I: IntoIterator<Item = V>,
    {
        let mut elements = Self::new();
        for (index, value) in values.into_iter().enumerate() {
            elements.set(index, value)?;
        }
        Ok(elements)
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of elements that are not holes
    pub fn present(&self) -> usize {
        self.present.len()
    }

    /// `None` for a hole or an index past the end.
    pub fn get(&self, index: usize) -> Option<&V> {
        u32::try_from(index)
            .ok()
            .and_then(|index| self.present.get(&index))
    }

    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Store an element, extending the length when `index` is past the end.
    pub fn set(&mut self, index: usize, value: V) -> Result<(), AllocError> {
        let length = checked_length(index.saturating_add(1))?;
        // `length` fits in u32, so `index` does too.
        let index = length - 1;
        self.present.insert(index, value);
        self.length = self.length.max(length);
        Ok(())
    }

    /// Turn an element into a hole; the length is unchanged.
    pub fn remove(&mut self, index: usize) -> Option<V> {
        u32::try_from(index)
            .ok()
            .and_then(|index| self.present.remove(&index))
    }

    /// Present elements, indices ascending
    pub fn iter(&self) -> impl Iterator<Item = (usize, &V)> + '_ {
        self.present
            .iter()
            .map(|(index, value)| (*index as usize, value))
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.present.keys().map(|index| *index as usize)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.present.values()
    }
}

fn checked_length(length: usize) -> Result<u32, AllocError> {
    u32::try_from(length).map_err(|_| AllocError::InvalidArrayLength { length })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_values_and_holes() {
        let mut elements = Elements::from_values(["a", "b", "c"]).unwrap();
        assert_eq!(elements.len(), 3);
        assert_eq!(elements.remove(1), Some("b"));
        assert_eq!(elements.len(), 3);
        assert!(!elements.contains(1));
        assert_eq!(elements.iter().collect::<Vec<_>>(), vec![(0, &"a"), (2, &"c")]);
    }

    #[test]
    fn test_largest_index_is_sparse() {
        let mut elements = Elements::new();
        elements.set(MAX_ARRAY_LENGTH - 1, 1).unwrap();
        assert_eq!(elements.len(), MAX_ARRAY_LENGTH);
        assert_eq!(elements.present(), 1);
        assert_eq!(elements.get(MAX_ARRAY_LENGTH - 1), Some(&1));
        assert_eq!(elements.get(0), None);
    }

    #[test]
    fn test_length_past_the_limit_is_rejected() {
        let mut elements = Elements::new();
        assert_eq!(
            elements.set(MAX_ARRAY_LENGTH, 1),
            Err(AllocError::InvalidArrayLength {
                length: MAX_ARRAY_LENGTH + 1
            })
        );
        assert!(elements.is_empty());
        assert!(Elements::<i32>::with_length(MAX_ARRAY_LENGTH).is_ok());
        assert!(Elements::<i32>::with_length(usize::MAX).is_err());
    }
}
