mod common;

use chrono::NaiveDate;
use common::{count_users, create_users, local_builder, scratch};
use replica_middleware::prelude::*;
use serde_json::json;

async fn pool_with_users() -> Result<(tempfile::TempDir, ReplicaPool), ReplicaDbError> {
    let (dir, path) = scratch();
    let pool = local_builder(&path).pool_size(2).build().await?;
    create_users(&pool).await?;
    Ok((dir, pool))
}

#[tokio::test]
async fn insert_then_select_by_id() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;

    let inserted = conn
        .execute(
            "INSERT INTO users (name) VALUES (?1)",
            &[RowValues::Text("ada".into())],
        )
        .await?;
    assert_eq!(inserted.rows_affected, 1);
    let id = inserted.last_insert_rowid.expect("insert reports its rowid");

    let found = conn
        .execute("SELECT id, name FROM users WHERE id = ?1", &[RowValues::Int(id)])
        .await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found.columns.as_slice(), ["id", "name"]);
    let row = found.first().unwrap();
    assert_eq!(row.get("id").and_then(RowValues::as_int), Some(&id));
    assert_eq!(row.get("name").and_then(RowValues::as_text), Some("ada"));

    pool.release(&mut conn).await;
    Ok(())
}

#[tokio::test]
async fn missing_id_yields_zero_rows() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;

    let result = conn
        .execute("SELECT id, name FROM users WHERE id = ?1", &[RowValues::Int(424_242)])
        .await?;
    assert!(result.is_empty());
    assert_eq!(result.columns.len(), 2);

    pool.release(&mut conn).await;
    Ok(())
}

#[tokio::test]
async fn injection_shaped_values_are_stored_literally() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;
    let hostile = "Robert'); DROP TABLE users;--";

    conn.execute(
        "INSERT INTO users (name) VALUES (?1)",
        &[RowValues::Text(hostile.into())],
    )
    .await?;
    let found = conn
        .execute(
            "SELECT name FROM users WHERE name = ?1",
            &[RowValues::Text(hostile.into())],
        )
        .await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found.rows[0].get("name").and_then(RowValues::as_text), Some(hostile));
    pool.release(&mut conn).await;

    assert_eq!(count_users(&pool).await?, 1);
    Ok(())
}

#[tokio::test]
async fn errors_never_echo_parameter_values() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;
    let secret = "s3cr3t-value";

    let err = conn
        .execute(
            "INSERT INTO users (id, name) VALUES (?1, ?2)",
            &[RowValues::Text(secret.into())],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicaDbError::ParameterError(_)));
    assert!(!err.to_string().contains(secret));

    conn.execute(
        "INSERT INTO users (id, name) VALUES (?1, ?2)",
        &[RowValues::Int(1), RowValues::Text(secret.into())],
    )
    .await?;
    let err = conn
        .execute(
            "INSERT INTO users (id, name) VALUES (?1, ?2)",
            &[RowValues::Int(1), RowValues::Text(secret.into())],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicaDbError::QueryError { .. }));
    assert!(!err.to_string().contains(secret));

    pool.release(&mut conn).await;
    Ok(())
}

#[tokio::test]
async fn named_parameters_bind_by_name() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;

    conn.execute_named(
        "INSERT INTO users (id, name) VALUES (:id, :name)",
        &[("name", RowValues::from("grace")), (":id", RowValues::Int(5))],
    )
    .await?;
    let found = conn
        .execute_named(
            "SELECT name FROM users WHERE id = :id",
            &[("id", RowValues::Int(5))],
        )
        .await?;
    assert_eq!(found.rows[0].get("name").and_then(RowValues::as_text), Some("grace"));

    let err = conn
        .execute_named("SELECT name FROM users WHERE id = :id", &[])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Parameter error: missing binding for :id");

    pool.release(&mut conn).await;
    Ok(())
}

#[tokio::test]
async fn returning_clause_yields_rows() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;

    let result = conn
        .execute(
            "INSERT INTO users (name) VALUES (?1), (?2) RETURNING id, name",
            &[RowValues::from("a"), RowValues::from("b")],
        )
        .await?;
    assert_eq!(result.len(), 2);
    assert_eq!(result.rows_affected, 2);
    assert_eq!(
        result.column("name").unwrap(),
        vec![&RowValues::from("a"), &RowValues::from("b")]
    );

    pool.release(&mut conn).await;
    Ok(())
}

#[tokio::test]
async fn non_native_values_round_trip_as_storage_classes() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;
    conn.execute_batch(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, happened TEXT, ok INTEGER, body TEXT, raw BLOB, note TEXT)",
    )
    .await?;

    let ts = NaiveDate::from_ymd_opt(2024, 5, 17)
        .unwrap()
        .and_hms_opt(8, 15, 0)
        .unwrap();
    conn.execute(
        "INSERT INTO events (happened, ok, body, raw, note) VALUES (?1, ?2, ?3, ?4, ?5)",
        &[
            RowValues::Timestamp(ts),
            RowValues::Bool(true),
            RowValues::JSON(json!({"kind": "login"})),
            RowValues::Blob(vec![0, 1, 2]),
            RowValues::Null,
        ],
    )
    .await?;

    let result = conn
        .execute("SELECT happened, ok, body, raw, note FROM events", &[])
        .await?;
    let row = result.first().unwrap();
    assert_eq!(row.get("happened").and_then(RowValues::as_timestamp), Some(ts));
    assert_eq!(row.get("ok").and_then(RowValues::as_bool), Some(true));
    assert_eq!(
        row.get("body").and_then(RowValues::as_text),
        Some(r#"{"kind":"login"}"#)
    );
    assert_eq!(row.get("raw").and_then(RowValues::as_blob), Some(&[0u8, 1, 2][..]));
    assert!(row.get("note").unwrap().is_null());

    pool.release(&mut conn).await;
    Ok(())
}

#[tokio::test]
async fn statement_shape_is_enforced() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;

    for refused in ["COMMIT", "BEGIN", "", "SELECT 1; SELECT 2"] {
        let err = conn.execute(refused, &[]).await.unwrap_err();
        assert!(
            matches!(err, ReplicaDbError::QueryError { .. }),
            "{refused:?} should be refused, got {err}"
        );
    }

    let err = conn.execute("SELECT * FROM no_such_table", &[]).await.unwrap_err();
    assert!(matches!(
        err,
        ReplicaDbError::QueryError { ref statement, .. } if statement == "SELECT * FROM no_such_table"
    ));

    // The handle stays usable after a failed statement.
    conn.execute("SELECT 1", &[]).await?;
    pool.release(&mut conn).await;
    Ok(())
}

#[tokio::test]
async fn batch_is_all_or_nothing_in_autocommit_mode() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;

    let err = conn
        .execute_batch(
            "INSERT INTO users (name) VALUES ('one');
             INSERT INTO missing_table VALUES (1);",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicaDbError::QueryError { .. }));
    pool.release(&mut conn).await;
    assert_eq!(count_users(&pool).await?, 0);

    let mut conn = pool.acquire().await?;
    let err = conn.execute_batch("BEGIN; SELECT 1;").await.unwrap_err();
    assert!(matches!(err, ReplicaDbError::QueryError { .. }));
    pool.release(&mut conn).await;
    Ok(())
}

#[tokio::test]
async fn bundles_run_in_order_and_roll_back_together() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;

    let results = conn
        .execute_all(&[
            QueryAndParams::new("INSERT INTO users (name) VALUES (?1)", vec!["x".into()]),
            QueryAndParams::new("INSERT INTO users (name) VALUES (?1)", vec!["y".into()]),
            QueryAndParams::new_without_params("SELECT count(*) AS n FROM users"),
        ])
        .await?;
    assert_eq!(results.len(), 3);
    assert_eq!(
        results[2].rows[0].get("n").and_then(RowValues::as_int),
        Some(&2)
    );

    let err = conn
        .execute_all(&[
            QueryAndParams::new("INSERT INTO users (name) VALUES (?1)", vec!["z".into()]),
            QueryAndParams::new("INSERT INTO users (id, name) VALUES (?1, ?2)", vec![
                RowValues::Null,
                RowValues::Null,
            ]),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicaDbError::QueryError { .. }));
    pool.release(&mut conn).await;

    assert_eq!(count_users(&pool).await?, 2);
    Ok(())
}

#[tokio::test]
async fn free_functions_match_handle_methods() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;

    execute(
        &mut conn,
        "INSERT INTO users (name) VALUES (?1)",
        &[RowValues::from("via fn")],
    )
    .await?;
    let result = execute_named(
        &mut conn,
        "SELECT count(*) AS n FROM users WHERE name = @name",
        &[("name", RowValues::from("via fn"))],
    )
    .await?;
    assert_eq!(result.rows[0].get("n").and_then(RowValues::as_int), Some(&1));

    pool.release(&mut conn).await;
    Ok(())
}

#[tokio::test]
async fn cte_read_calling_replace_returns_rows() -> Result<(), ReplicaDbError> {
    let (_dir, pool) = pool_with_users().await?;
    let mut conn = pool.acquire().await?;
    conn.execute("INSERT INTO users (name) VALUES (?1)", &[RowValues::from("ada")])
        .await?;

    let result = conn
        .execute(
            "WITH u AS (SELECT name FROM users) SELECT replace(name, 'a', 'o') AS n FROM u",
            &[],
        )
        .await?;
    assert_eq!(result.len(), 1);
    assert_eq!(
        result.first().and_then(|row| row.get("n")).and_then(RowValues::as_text),
        Some("odo")
    );
    assert_eq!(result.rows_affected, 0);

    pool.release(&mut conn).await;
    Ok(())
}
