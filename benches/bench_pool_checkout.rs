#![allow(clippy::cast_possible_wrap, clippy::cast_precision_loss)]

//! Criterion benchmark for concurrent checkout and single-row lookups against a local
//! replica file. Each iteration fans a batch of lookups out across several tasks, so
//! gate and pool overheads show up the way they would behind an async web server.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use replica_middleware::prelude::*;
use std::hint::black_box;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tokio::task::JoinSet;

const SELECT_BY_ID: &str = "SELECT id, name, score, active FROM test WHERE id = ?1";

/// Pool over a pre-populated file plus deterministic lookup ids.
struct Dataset {
    _dir: TempDir,
    pool: ReplicaPool,
    ids: Vec<i64>,
}

static TOKIO_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("create tokio runtime"));

static BENCH_CONCURRENCY: LazyLock<usize> = LazyLock::new(|| concurrency_to_run().max(1));

static DATASET: LazyLock<Dataset> = LazyLock::new(|| {
    let row_count = lookup_row_count_to_run();
    let dir = tempfile::tempdir().expect("bench tempdir");
    let path = dir.path().join("bench_replica.db");

    let pool = TOKIO_RUNTIME
        .block_on(async {
            let pool = ReplicaPool::builder(&path)
                .pool_size(*BENCH_CONCURRENCY)
                .build()
                .await?;
            prepare_dataset(&pool, row_count).await?;
            Ok::<_, ReplicaDbError>(pool)
        })
        .expect("prepare replica dataset");

    let mut ids: Vec<i64> = (1..=row_count as i64).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(9_876_543_210);
    ids.shuffle(&mut rng);

    Dataset {
        _dir: dir,
        pool,
        ids,
    }
});

fn lookup_row_count_to_run() -> usize {
    std::env::var("BENCH_LOOKUPS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(1024)
}

fn concurrency_to_run() -> usize {
    std::env::var("BENCH_CONCURRENCY")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8)
}

async fn prepare_dataset(pool: &ReplicaPool, row_count: usize) -> Result<(), ReplicaDbError> {
    let mut conn = pool.acquire().await?;
    conn.execute_batch(
        "CREATE TABLE test (
            id      INTEGER PRIMARY KEY,
            name    TEXT NOT NULL,
            score   REAL NOT NULL,
            active  INTEGER NOT NULL
        );",
    )
    .await?;

    let inserts: Vec<QueryAndParams> = (1..=row_count as i64)
        .map(|id| {
            QueryAndParams::new(
                "INSERT INTO test (id, name, score, active) VALUES (?1, ?2, ?3, ?4)",
                vec![
                    RowValues::Int(id),
                    RowValues::Text(format!("name-{id}")),
                    RowValues::Float(id as f64 * 0.5),
                    RowValues::Bool(id % 2 == 0),
                ],
            )
        })
        .collect();
    conn.execute_all(&inserts).await?;
    pool.release(&mut conn).await;
    Ok(())
}

async fn parallel_select(
    pool: &ReplicaPool,
    ids: &[i64],
    concurrency: usize,
) -> Result<(), ReplicaDbError> {
    let per_worker = ids.len().div_ceil(concurrency.max(1)).max(1);
    let mut join_set = JoinSet::new();

    for chunk in ids.chunks(per_worker) {
        let pool = pool.clone();
        let chunk = chunk.to_vec();
        join_set.spawn(async move {
            let mut conn = pool.acquire().await?;
            let mut params = [RowValues::Int(0)];
            for id in chunk {
                params[0] = RowValues::Int(id);
                let result = conn.execute(SELECT_BY_ID, &params).await?;
                let row = result.first().ok_or_else(|| {
                    ReplicaDbError::NotFoundError(format!("test row {id}"))
                })?;
                black_box(row);
            }
            pool.release(&mut conn).await;
            Ok::<(), ReplicaDbError>(())
        });
    }

    while let Some(outcome) = join_set.join_next().await {
        outcome.expect("select worker panicked")?;
    }
    Ok(())
}

async fn parallel_checkout(pool: &ReplicaPool, concurrency: usize) -> Result<(), ReplicaDbError> {
    let mut join_set = JoinSet::new();
    for _ in 0..concurrency.max(1) {
        let pool = pool.clone();
        join_set.spawn(async move {
            let mut conn = pool.acquire().await?;
            pool.release(&mut conn).await;
            Ok::<(), ReplicaDbError>(())
        });
    }

    while let Some(outcome) = join_set.join_next().await {
        outcome.expect("checkout worker panicked")?;
    }
    Ok(())
}

fn timed<F, Fut>(b: &mut criterion::Bencher<'_>, run: F)
where
    F: Fn() -> Fut + Clone + 'static,
    Fut: std::future::Future<Output = Result<(), ReplicaDbError>>,
{
    b.to_async(&*TOKIO_RUNTIME).iter_custom(move |iters| {
        let run = run.clone();
        async move {
            let mut total = Duration::default();
            for _ in 0..iters {
                let start = Instant::now();
                run().await.expect("benchmark iteration");
                total += start.elapsed();
            }
            total
        }
    });
}

fn bench_pool(c: &mut Criterion) {
    let dataset = &*DATASET;
    let concurrency = *BENCH_CONCURRENCY;

    let mut group = c.benchmark_group("replica_pool");
    group.throughput(Throughput::Elements(dataset.ids.len() as u64));

    group.bench_function(BenchmarkId::new("parallel_select", concurrency), |b| {
        let pool = dataset.pool.clone();
        let ids = dataset.ids.clone();
        timed(b, move || {
            let pool = pool.clone();
            let ids = ids.clone();
            async move { parallel_select(&pool, &ids, concurrency).await }
        });
    });

    group.throughput(Throughput::Elements(concurrency as u64));
    group.bench_function(BenchmarkId::new("pool_checkout", concurrency), |b| {
        let pool = dataset.pool.clone();
        timed(b, move || {
            let pool = pool.clone();
            async move { parallel_checkout(&pool, concurrency).await }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_pool);
criterion_main!(benches);
