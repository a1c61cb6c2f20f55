use serde::{Deserialize, Serialize};

use crate::firestore::value::{values_equal, FirestoreValue};

/// Ordered list of values. Membership uses Firestore value equality, so `1` and `1.0` match.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|value| values_equal(value, needle))
    }

    /// Appends each element not already present, keeping existing order.
    pub fn union(mut self, elements: &[FirestoreValue]) -> Self {
        for element in elements {
            if !self.contains(element) {
                self.values.push(element.clone());
            }
        }
        self
    }

    /// Drops every occurrence of each element.
    pub fn remove_all(self, elements: &[FirestoreValue]) -> Self {
        let values = self
            .values
            .into_iter()
            .filter(|value| !elements.iter().any(|element| values_equal(value, element)))
            .collect();
        Self { values }
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<FirestoreValue> {
        values.iter().copied().map(FirestoreValue::from_integer).collect()
    }

    #[test]
    fn contains_uses_numeric_equality() {
        let array = ArrayValue::new(ints(&[1]));
        assert!(array.contains(&FirestoreValue::from_double(1.0)));
        assert!(!array.contains(&FirestoreValue::from_string("1")));
    }

    #[test]
    fn union_skips_present_elements() {
        let array = ArrayValue::new(ints(&[1, 2])).union(&ints(&[2, 3, 3]));
        assert_eq!(array.into_values(), ints(&[1, 2, 3]));
    }

    #[test]
    fn remove_all_drops_duplicates() {
        let array = ArrayValue::new(ints(&[1, 2, 1, 3])).remove_all(&ints(&[1]));
        assert_eq!(array.values(), ints(&[2, 3]).as_slice());
        assert!(ArrayValue::new(ints(&[4])).remove_all(&ints(&[4])).is_empty());
    }
}
