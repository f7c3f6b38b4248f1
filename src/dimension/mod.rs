use crate::event::FieldValue;

/// A canonical, hashable ordered sequence of (path, value) pairs extracted
/// from an atom. Ordering follows the event's field order, which follows the
/// atom schema; two keys built from the same slice of the same atom compare
/// equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HashableDimensionKey {
    values: Vec<FieldValue>,
}

impl HashableDimensionKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    pub fn add_value(&mut self, value: FieldValue) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether every (path, value) pair of `sub` is present in `self`.
    /// The empty key is a sub-dimension of every key.
    pub fn contains(&self, sub: &HashableDimensionKey) -> bool {
        sub.values.iter().all(|v| self.values.contains(v))
    }
}

/// The pair of keys identifying a slice: the projection of the event itself
/// and the projection of any external state atoms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MetricDimensionKey {
    dimension_key_in_what: HashableDimensionKey,
    state_values_key: HashableDimensionKey,
}

impl MetricDimensionKey {
    pub fn new(
        dimension_key_in_what: HashableDimensionKey,
        state_values_key: HashableDimensionKey,
    ) -> Self {
        Self {
            dimension_key_in_what,
            state_values_key,
        }
    }

    pub fn dimension_key_in_what(&self) -> &HashableDimensionKey {
        &self.dimension_key_in_what
    }

    pub fn state_values_key(&self) -> &HashableDimensionKey {
        &self.state_values_key
    }
}

/// Identity of a de-duplicated atom snapshot within a bucket: the atom id
/// plus the full projected field tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtomDimensionKey {
    atom_id: i32,
    atom_field_values: HashableDimensionKey,
}

impl AtomDimensionKey {
    pub fn new(atom_id: i32, atom_field_values: HashableDimensionKey) -> Self {
        Self {
            atom_id,
            atom_field_values,
        }
    }

    pub fn atom_id(&self) -> i32 {
        self.atom_id
    }

    pub fn atom_field_values(&self) -> &HashableDimensionKey {
        &self.atom_field_values
    }
}
