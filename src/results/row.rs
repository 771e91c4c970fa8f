use std::collections::HashMap;
use std::sync::Arc;

use crate::types::RowValues;

/// One row of a [`QueryResult`](super::QueryResult).
///
/// Values are kept in column order; column names and the name lookup table are shared
/// with every other row of the same result.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    /// Column names, shared across all rows of a result
    pub column_names: Arc<Vec<String>>,
    /// Values, in column order
    pub values: Vec<RowValues>,
    #[doc(hidden)]
    pub(crate) column_index: Arc<HashMap<String, usize>>,
}

impl ResultRow {
    /// Build a standalone row. Rows produced by the executor share their lookup table instead.
    #[must_use]
    pub fn new(column_names: Arc<Vec<String>>, values: Vec<RowValues>) -> Self {
        let column_index = Arc::new(index_columns(&column_names));
        Self {
            column_names,
            values,
            column_index,
        }
    }

    /// Position of `column_name`, or `None` if the result has no such column.
    #[must_use]
    pub fn get_column_index(&self, column_name: &str) -> Option<usize> {
        self.column_index.get(column_name).copied()
    }

    /// Value of the named column.
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<&RowValues> {
        self.get_column_index(column_name)
            .and_then(|idx| self.values.get(idx))
    }

    #[must_use]
    pub fn get_by_index(&self, index: usize) -> Option<&RowValues> {
        self.values.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// First occurrence wins when a result repeats a column name (`SELECT a.id, b.id ...`).
pub(crate) fn index_columns(column_names: &[String]) -> HashMap<String, usize> {
    let mut index = HashMap::with_capacity(column_names.len());
    for (i, name) in column_names.iter().enumerate() {
        index.entry(name.clone()).or_insert(i);
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name_and_index() {
        let names = Arc::new(vec!["id".to_string(), "name".to_string()]);
        let row = ResultRow::new(names, vec![RowValues::Int(7), RowValues::Text("ada".into())]);
        assert_eq!(row.get("name"), Some(&RowValues::Text("ada".into())));
        assert_eq!(row.get_by_index(0), Some(&RowValues::Int(7)));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn duplicate_column_names_resolve_to_first() {
        let names = Arc::new(vec!["id".to_string(), "id".to_string()]);
        let row = ResultRow::new(names, vec![RowValues::Int(1), RowValues::Int(2)]);
        assert_eq!(row.get("id"), Some(&RowValues::Int(1)));
    }
}
