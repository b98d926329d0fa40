//! Buffered result state shared by all backends.
//!
//! Rust drivers tie their row streams to a borrow of the connection, so each
//! backend drains the stream inside the execute call and iterates the buffer
//! afterwards. The buffer holds the current row, the ordered column metadata,
//! and the fetched/affected counters.

use std::collections::VecDeque;

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::DbValue;

/// Metadata for one result column, with classification flags derived from
/// the backend's native type table.
#[derive(Debug, Clone, Default)]
pub struct FieldInfo {
    pub name: String,
    /// Backend-native type name (e.g. "INT8", "NVARCHAR", "timestamptz").
    pub type_name: String,
    pub binary: bool,
    pub numeric: bool,
    pub datetime: bool,
    pub string: bool,
}

/// Rows and counters of the most recent query execution.
///
/// Valid between query execution and `free_result`; the current row is only
/// set after a successful `fetch_row`.
#[derive(Debug, Default)]
pub struct ResultBuffer {
    fields: Vec<FieldInfo>,
    rows: VecDeque<Vec<DbValue>>,
    current: Option<Vec<DbValue>>,
    fetched: u64,
    affected: u64,
}

impl ResultBuffer {
    /// Drop all rows, metadata, and counters.
    pub fn reset(&mut self) {
        self.fields.clear();
        self.rows.clear();
        self.current = None;
        self.fetched = 0;
        self.affected = 0;
    }

    pub fn set_fields(&mut self, fields: Vec<FieldInfo>) {
        self.fields = fields;
    }

    pub fn push_row(&mut self, row: Vec<DbValue>) {
        self.rows.push_back(row);
    }

    pub fn add_affected(&mut self, count: u64) {
        self.affected += count;
    }

    /// Advance to the next row. Returns false when the buffer is exhausted.
    pub fn advance(&mut self) -> bool {
        match self.rows.pop_front() {
            Some(row) => {
                self.current = Some(row);
                self.fetched += 1;
                true
            }
            None => {
                self.current = None;
                false
            }
        }
    }

    pub fn has_current_row(&self) -> bool {
        self.current.is_some()
    }

    pub fn fetched_count(&self) -> u64 {
        self.fetched
    }

    pub fn affected_count(&self) -> u64 {
        self.affected
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_name(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(|f| f.name.as_str())
    }

    pub fn field_info(&self, index: usize) -> Option<&FieldInfo> {
        self.fields.get(index)
    }

    /// Raw value of the current row by column index.
    ///
    /// Returns `None` (after a warning) without a current row or for an
    /// unknown index, matching the contract's lenient field accessors.
    pub fn value_by_num(&self, index: usize) -> Option<&DbValue> {
        let Some(row) = self.current.as_ref() else {
            tracing::warn!("field access without a fetched row");
            return None;
        };
        let value = row.get(index);
        if value.is_none() {
            tracing::warn!(index, "field access with an unknown column index");
        }
        value
    }

    /// Raw value of the current row by column name.
    pub fn value_by_name(&self, name: &str) -> Option<&DbValue> {
        let Some(index) = self.field_index(name) else {
            tracing::warn!(name, "field access with an unknown column name");
            return None;
        };
        self.value_by_num(index)
    }

    /// Drain the remaining rows into `target`, grouping by the values of the
    /// designated dimension columns.
    ///
    /// With no dimension columns the rows accumulate as a flat JSON array.
    /// Otherwise each row descends one nesting level per dimension column (in
    /// the given order) and the remaining columns become the leaf object.
    /// Returns the number of rows consumed.
    pub fn fetch_all_grouped(&mut self, target: &mut JsonValue, dimension_keys: &[String]) -> u64 {
        let mut consumed = 0;
        if dimension_keys.is_empty() && !target.is_array() {
            *target = JsonValue::Array(Vec::new());
        }
        if !dimension_keys.is_empty() && !target.is_object() {
            *target = JsonValue::Object(JsonMap::new());
        }

        while self.advance() {
            consumed += 1;
            let mut row = JsonMap::new();
            let mut path = Vec::with_capacity(dimension_keys.len());
            if let Some(values) = self.current.as_ref() {
                for (field, value) in self.fields.iter().zip(values.iter()) {
                    if dimension_keys.iter().any(|k| *k == field.name) {
                        path.push(value.as_text());
                    } else {
                        row.insert(field.name.clone(), value.to_json());
                    }
                }
            }

            if dimension_keys.is_empty() {
                if let Some(list) = target.as_array_mut() {
                    list.push(JsonValue::Object(row));
                }
            } else {
                insert_grouped(target, &path, row);
            }
        }
        consumed
    }
}

/// Descend/create nested objects level by level and assign the leaf.
pub(crate) fn insert_grouped(target: &mut JsonValue, path: &[String], leaf: JsonMap<String, JsonValue>) {
    let mut node = target;
    for key in path {
        if !node.is_object() {
            *node = JsonValue::Object(JsonMap::new());
        }
        let map = match node.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        node = map
            .entry(key.clone())
            .or_insert_with(|| JsonValue::Object(JsonMap::new()));
    }
    *node = JsonValue::Object(leaf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str) -> FieldInfo {
        FieldInfo {
            name: name.into(),
            type_name: "VARCHAR".into(),
            string: true,
            ..Default::default()
        }
    }

    fn populated() -> ResultBuffer {
        let mut buffer = ResultBuffer::default();
        buffer.set_fields(vec![field("REGION"), field("COUNTRY"), field("POP")]);
        buffer.push_row(vec!["EU".into(), "DE".into(), DbValue::Int(80)]);
        buffer.push_row(vec!["EU".into(), "FR".into(), DbValue::Int(65)]);
        buffer.push_row(vec!["NA".into(), "US".into(), DbValue::Int(330)]);
        buffer
    }

    #[test]
    fn fetch_row_advances_and_counts() {
        let mut buffer = populated();
        assert!(!buffer.has_current_row());
        assert!(buffer.advance());
        assert_eq!(buffer.value_by_name("COUNTRY"), Some(&DbValue::Text("DE".into())));
        assert!(buffer.advance());
        assert!(buffer.advance());
        assert!(!buffer.advance());
        assert_eq!(buffer.fetched_count(), 3);
    }

    #[test]
    fn unknown_field_returns_none() {
        let mut buffer = populated();
        buffer.advance();
        assert!(buffer.value_by_name("MISSING").is_none());
        assert!(buffer.value_by_num(17).is_none());
    }

    #[test]
    fn grouping_nests_by_dimension_columns() {
        let mut buffer = populated();
        let mut target = JsonValue::Null;
        let consumed =
            buffer.fetch_all_grouped(&mut target, &["REGION".to_string(), "COUNTRY".to_string()]);
        assert_eq!(consumed, 3);
        assert_eq!(
            target,
            json!({
                "EU": {"DE": {"POP": 80}, "FR": {"POP": 65}},
                "NA": {"US": {"POP": 330}}
            })
        );
    }

    #[test]
    fn no_dimensions_yields_flat_list() {
        let mut buffer = populated();
        let mut target = JsonValue::Null;
        buffer.fetch_all_grouped(&mut target, &[]);
        assert_eq!(
            target,
            json!([
                {"REGION": "EU", "COUNTRY": "DE", "POP": 80},
                {"REGION": "EU", "COUNTRY": "FR", "POP": 65},
                {"REGION": "NA", "COUNTRY": "US", "POP": 330}
            ])
        );
    }
}
