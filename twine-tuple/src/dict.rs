//! Tuple dictionary: field name to field number resolution.

use std::collections::HashMap;

/// Maps schema field names to 0-based field numbers.
///
/// Updates may address top-level fields by name; the dictionary is the
/// schema-supplied lookup the operation decoder consults before falling
/// back to JSON path parsing.
#[derive(Debug, Default, Clone)]
pub struct TupleDict {
    by_name: HashMap<String, u32>,
}

impl TupleDict {
    /// An empty dictionary: every name misses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dictionary from field names in field-number order.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let by_name = names
            .into_iter()
            .enumerate()
            .map(|(no, name)| (name.to_string(), no as u32))
            .collect();
        Self { by_name }
    }

    /// Register one name.
    pub fn insert(&mut self, name: &str, field_no: u32) {
        self.by_name.insert(name.to_string(), field_no);
    }

    /// Resolve a name to its 0-based field number.
    pub fn field_no(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }
}
