use std::collections::HashMap;
use std::sync::Arc;

use super::row::{ResultRow, index_columns};
use crate::types::RowValues;

/// Tabular outcome of one executed statement.
///
/// Produced fresh per execution. An empty `rows` is a normal outcome, not an error:
/// turning "no row" into a not-found response is the caller's decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names in select order (empty for statements that return no rows)
    pub columns: Arc<Vec<String>>,
    /// Rows, in the order the engine produced them
    pub rows: Vec<ResultRow>,
    /// Rows changed by a write statement; 0 for reads
    pub rows_affected: u64,
    /// Rowid of the last insert performed by this statement, if it inserted anything
    pub last_insert_rowid: Option<i64>,
    column_index: Arc<HashMap<String, usize>>,
}

impl QueryResult {
    #[must_use]
    pub fn with_columns(columns: Vec<String>) -> Self {
        let column_index = Arc::new(index_columns(&columns));
        Self {
            columns: Arc::new(columns),
            column_index,
            ..Self::default()
        }
    }

    /// Outcome of a write that returned no rows.
    #[must_use]
    pub fn affected(rows_affected: u64, last_insert_rowid: Option<i64>) -> Self {
        Self {
            rows_affected,
            last_insert_rowid,
            ..Self::default()
        }
    }

    /// Append a row; `values` must be in column order.
    pub fn push_row(&mut self, values: Vec<RowValues>) {
        self.rows.push(ResultRow {
            column_names: Arc::clone(&self.columns),
            values,
            column_index: Arc::clone(&self.column_index),
        });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn first(&self) -> Option<&ResultRow> {
        self.rows.first()
    }

    /// Every value of one column, in row order.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<&RowValues>> {
        let idx = *self.column_index.get(name)?;
        Some(self.rows.iter().filter_map(|row| row.values.get(idx)).collect())
    }
}
