//! Running statements on a borrowed handle.
//!
//! Values are always bound, never interpolated into the text. Reads run under the shared
//! file gate; writes additionally take the pool's writer lock (see [`CommitMode`] for how
//! long they keep it).
//!
//! [`CommitMode`]: crate::config::CommitMode

mod params;
mod rows;
mod statement;

use libsql::Connection;
use libsql::params::Params;
use tracing::{debug, warn};

pub use statement::{Placeholders, StatementKind, StatementShape};

use crate::error::ReplicaDbError;
use crate::pool::ConnectionHandle;
use crate::results::QueryResult;
use crate::types::{QueryAndParams, RowValues};

/// Run one statement with positional parameters (`?` or `?N`).
///
/// Reads (and writes with `RETURNING`) yield rows; other writes yield `rows_affected`
/// and, for inserts, `last_insert_rowid`. An empty result is not an error.
///
/// # Errors
/// Returns `ReplicaDbError::ParameterError` if the bindings do not match the
/// placeholders, `ReplicaDbError::QueryError` if the statement is empty, contains more
/// than one statement, is transaction control, or fails to prepare or step, and
/// `ReplicaDbError::ConnectionError` if the handle was released or force-closed.
pub async fn execute(
    handle: &mut ConnectionHandle,
    statement: &str,
    params: &[RowValues],
) -> Result<QueryResult, ReplicaDbError> {
    let shape = StatementShape::scan(statement);
    shape.check_single(statement)?;
    shape.check_positional(params.len())?;
    run(handle, statement, &shape, params::positional(params)).await
}

/// Run one statement with named parameters (`:name`, `@name` or `$name`). Names may be
/// given with or without their prefix.
///
/// # Errors
/// As [`execute`]; every placeholder must be bound exactly once.
pub async fn execute_named(
    handle: &mut ConnectionHandle,
    statement: &str,
    params: &[(&str, RowValues)],
) -> Result<QueryResult, ReplicaDbError> {
    let shape = StatementShape::scan(statement);
    shape.check_single(statement)?;
    let names: Vec<&str> = params.iter().map(|(name, _)| *name).collect();
    let resolved = shape.check_named(&names)?;
    run(handle, statement, &shape, params::named(resolved, params)).await
}

/// Run a parameterless multi-statement script, e.g. schema setup.
///
/// In autocommit mode the whole script runs in one transaction; in explicit mode it joins
/// the handle's transaction.
///
/// # Errors
/// Returns `ReplicaDbError::ParameterError` if the script has placeholders and
/// `ReplicaDbError::QueryError` if it is empty, contains transaction control, or any
/// statement fails (nothing from the script is kept in autocommit mode).
pub async fn execute_batch(handle: &mut ConnectionHandle, script: &str) -> Result<(), ReplicaDbError> {
    let shape = StatementShape::scan(script);
    if shape.statement_count() == 0 {
        return Err(ReplicaDbError::query(script, "empty statement"));
    }
    if shape.has_transaction_control() {
        return Err(ReplicaDbError::query(
            script,
            "transaction control is managed by the connection handle",
        ));
    }
    shape.check_positional(0)?;

    let conn = handle.connection()?;
    let access = handle.write_access().await?;
    let outcome = if access.commits_on_completion() {
        atomically(&conn, async {
            conn.execute_batch(script)
                .await
                .map_err(|e| ReplicaDbError::query(script, e))
                .map(drop)
        })
        .await
    } else {
        conn.execute_batch(script)
            .await
            .map_err(|e| ReplicaDbError::query(script, e))
            .map(drop)
    };
    if outcome.is_ok() && access.commits_on_completion() {
        handle.write_committed();
    }
    drop(access);
    debug!(
        session = handle.id(),
        statements = shape.statement_count(),
        ok = outcome.is_ok(),
        "batch executed"
    );
    outcome
}

/// Run several statements in order, all or nothing.
///
/// In autocommit mode a bundle containing writes runs in one transaction under the
/// writer lock; in explicit mode it joins the handle's transaction. Stops at the first
/// failure.
///
/// # Errors
/// As [`execute`], for the first statement that fails.
pub async fn execute_all(
    handle: &mut ConnectionHandle,
    statements: &[QueryAndParams],
) -> Result<Vec<QueryResult>, ReplicaDbError> {
    let shapes = prepare(statements)?;
    if statements.is_empty() {
        return Ok(Vec::new());
    }

    let conn = handle.connection()?;
    let writes = shapes.iter().any(StatementShape::is_write);
    let access = if writes {
        handle.write_access().await?
    } else {
        handle.read_access().await?
    };

    let outcome = if access.commits_on_completion() {
        atomically(&conn, run_each(&conn, statements, &shapes)).await
    } else {
        run_each(&conn, statements, &shapes).await
    };
    if outcome.is_ok() && access.commits_on_completion() {
        handle.write_committed();
    }
    drop(access);
    debug!(
        session = handle.id(),
        statements = statements.len(),
        ok = outcome.is_ok(),
        "statement bundle executed"
    );
    outcome
}

/// Replay a statement delta in one transaction; on failure nothing is kept.
///
/// The caller holds the file gate exclusively.
pub(crate) async fn apply_statements(
    conn: &Connection,
    statements: &[QueryAndParams],
) -> Result<(), ReplicaDbError> {
    let shapes = prepare(statements)?;
    if statements.is_empty() {
        return Ok(());
    }
    atomically(conn, run_each(conn, statements, &shapes))
        .await
        .map(drop)
}

fn prepare(statements: &[QueryAndParams]) -> Result<Vec<StatementShape>, ReplicaDbError> {
    statements
        .iter()
        .map(|item| {
            let shape = StatementShape::scan(&item.query);
            shape.check_single(&item.query)?;
            shape.check_positional(item.params.len())?;
            Ok(shape)
        })
        .collect()
}

async fn run(
    handle: &mut ConnectionHandle,
    statement: &str,
    shape: &StatementShape,
    params: Params,
) -> Result<QueryResult, ReplicaDbError> {
    let conn = handle.connection()?;
    let access = if shape.kind() == Some(StatementKind::Read) {
        handle.read_access().await?
    } else {
        handle.write_access().await?
    };

    let outcome = run_statement(&conn, statement, shape, params).await;
    if outcome.is_ok() && access.commits_on_completion() {
        handle.write_committed();
    }
    drop(access);

    match &outcome {
        Ok(result) => debug!(
            session = handle.id(),
            statement,
            rows = result.len(),
            rows_affected = result.rows_affected,
            "statement executed"
        ),
        Err(err) => debug!(session = handle.id(), error = %err, "statement failed"),
    }
    outcome
}

async fn run_each(
    conn: &Connection,
    statements: &[QueryAndParams],
    shapes: &[StatementShape],
) -> Result<Vec<QueryResult>, ReplicaDbError> {
    let mut results = Vec::with_capacity(statements.len());
    for (item, shape) in statements.iter().zip(shapes) {
        let params = params::positional(&item.params);
        results.push(run_statement(conn, &item.query, shape, params).await?);
    }
    Ok(results)
}

async fn run_statement(
    conn: &Connection,
    statement: &str,
    shape: &StatementShape,
    params: Params,
) -> Result<QueryResult, ReplicaDbError> {
    if shape.returns_rows() {
        let rows = conn
            .query(statement, params)
            .await
            .map_err(|e| ReplicaDbError::query(statement, e))?;
        let mut result = rows::build_result(statement, rows).await?;
        if shape.is_write() {
            result.rows_affected = conn.changes();
            result.last_insert_rowid = shape.is_insert().then(|| conn.last_insert_rowid());
        }
        return Ok(result);
    }

    let affected = conn
        .execute(statement, params)
        .await
        .map_err(|e| ReplicaDbError::query(statement, e))?;
    let rowid = shape.is_insert().then(|| conn.last_insert_rowid());
    Ok(QueryResult::affected(affected, rowid))
}

/// Wrap `work` in `BEGIN IMMEDIATE` / `COMMIT`, rolling back if it fails.
async fn atomically<T>(
    conn: &Connection,
    work: impl std::future::Future<Output = Result<T, ReplicaDbError>>,
) -> Result<T, ReplicaDbError> {
    conn.execute("BEGIN IMMEDIATE", ())
        .await
        .map_err(|e| ReplicaDbError::query("BEGIN IMMEDIATE", e))?;

    match work.await {
        Ok(value) => {
            if let Err(e) = conn.execute("COMMIT", ()).await {
                rollback_quietly(conn).await;
                return Err(ReplicaDbError::query("COMMIT", e));
            }
            Ok(value)
        }
        Err(err) => {
            rollback_quietly(conn).await;
            Err(err)
        }
    }
}

async fn rollback_quietly(conn: &Connection) {
    if let Err(e) = conn.execute("ROLLBACK", ()).await {
        warn!(error = %e, "rollback failed");
    }
}
