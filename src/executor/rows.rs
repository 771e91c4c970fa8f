use libsql::{Row, Rows, Value};

use crate::error::ReplicaDbError;
use crate::results::QueryResult;
use crate::types::RowValues;

/// Drain `rows` into a [`QueryResult`], one `RowValues` per column in statement order.
pub(crate) async fn build_result(
    statement: &str,
    mut rows: Rows,
) -> Result<QueryResult, ReplicaDbError> {
    let column_count = rows.column_count();
    let columns = (0..column_count)
        .map(|i| {
            rows.column_name(i)
                .map_or_else(|| format!("column_{i}"), str::to_string)
        })
        .collect();

    let mut result = QueryResult::with_columns(columns);
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| ReplicaDbError::query(statement, e))?
    {
        let mut values = Vec::with_capacity(result.columns.len());
        for idx in 0..column_count {
            values.push(extract_value(statement, &row, idx)?);
        }
        result.push_row(values);
    }
    Ok(result)
}

fn extract_value(statement: &str, row: &Row, idx: i32) -> Result<RowValues, ReplicaDbError> {
    let value = row
        .get_value(idx)
        .map_err(|e| ReplicaDbError::query(statement, format!("column {idx}: {e}")))?;
    Ok(match value {
        Value::Null => RowValues::Null,
        Value::Integer(i) => RowValues::Int(i),
        Value::Real(f) => RowValues::Float(f),
        Value::Text(s) => RowValues::Text(s),
        Value::Blob(bytes) => RowValues::Blob(bytes),
    })
}
