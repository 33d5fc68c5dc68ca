//! PostgreSQL/PostGIS integration tests.
//!
//! Run with `cargo test --features postgres-integration` and `DATABASE_URL`
//! pointing at a server with PostGIS available.

#![cfg(feature = "postgres-integration")]

use sqlx::PgPool;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trail_progress_worker::listener::NotificationListener;
use trail_progress_worker::models::PipelineStage;
use trail_progress_worker::processing::{
    wake_channel, BatchClaimConfig, BatchClaimEngine, BatchOutcome, ConflictClass,
    ErrorClassifier, StandardErrorClassifier,
};
use trail_progress_worker::store::{PgWorkStore, StoreError, StoreTransaction, WorkStore};
use uuid::Uuid;

type TestResult = Result<(), Box<dyn Error>>;

const ROUTE: &str = "SRID=4326;LINESTRING(-3.0 54.0, -3.0 54.01)";
const ALONG_ROUTE: &str = "SRID=4326;LINESTRING(-3.0001 53.995, -3.0001 54.005)";
const FAR_AWAY: &str = "SRID=4326;LINESTRING(2.0 48.0, 2.0 48.01)";

async fn seed_route(pool: &PgPool) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar("INSERT INTO routes (name, track) VALUES ('ridge', ST_GeogFromText($1)) RETURNING id")
        .bind(ROUTE)
        .fetch_one(pool)
        .await
}

async fn seed_activity(
    pool: &PgPool,
    id: i64,
    track: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO athletes (id) VALUES (1) ON CONFLICT DO NOTHING")
        .execute(pool)
        .await?;
    sqlx::query(
        "INSERT INTO activities (id, athlete_id, summary_track) VALUES ($1, 1, ST_GeogFromText($2))",
    )
    .bind(id)
    .bind(track)
    .execute(pool)
    .await?;
    Ok(())
}

async fn seed_work(pool: &PgPool, activity_id: i64, route_id: Uuid) -> Result<Uuid, sqlx::Error> {
    sqlx::query_scalar("INSERT INTO processing (activity_id, route_id) VALUES ($1, $2) RETURNING id")
        .bind(activity_id)
        .bind(route_id)
        .fetch_one(pool)
        .await
}

async fn processed(pool: &PgPool, id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT processed FROM processing WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
}

#[sqlx::test(migrations = "./migrations")]
async fn test_pipeline_completes_every_outcome(pool: PgPool) -> TestResult {
    let route = seed_route(&pool).await?;
    seed_activity(&pool, 1, None).await?;
    seed_activity(&pool, 2, Some(FAR_AWAY)).await?;
    seed_activity(&pool, 3, Some(ALONG_ROUTE)).await?;
    let unmapped = seed_work(&pool, 1, route).await?;
    let irrelevant = seed_work(&pool, 2, route).await?;
    let relevant = seed_work(&pool, 3, route).await?;

    let engine = BatchClaimEngine::new(
        Arc::new(PgWorkStore::new(pool.clone())),
        BatchClaimConfig::default(),
    );

    assert_eq!(engine.process_batch(10).await?, BatchOutcome::Processed(3));
    assert_eq!(engine.process_batch(10).await?, BatchOutcome::NothingLeft);

    for id in [unmapped, irrelevant, relevant] {
        assert!(processed(&pool, id).await?);
    }

    let relevance: Vec<(i64, bool)> = sqlx::query_as(
        "SELECT activity_id, relevant FROM relevant_activities ORDER BY activity_id",
    )
    .fetch_all(&pool)
    .await?;
    assert_eq!(relevance, vec![(2, false), (3, true)]);

    let intersections: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM intersections WHERE activity_id = 3")
            .fetch_one(&pool)
            .await?;
    assert!(intersections >= 1);

    let stats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM route_stats WHERE route_id = $1")
        .bind(route)
        .fetch_one(&pool)
        .await?;
    assert_eq!(stats, 1);

    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_open_transactions_skip_each_others_claims(pool: PgPool) -> TestResult {
    let route = seed_route(&pool).await?;
    for id in 1..=3 {
        seed_activity(&pool, id, Some(ALONG_ROUTE)).await?;
        seed_work(&pool, id, route).await?;
    }
    let store = PgWorkStore::new(pool.clone());
    let lease = Duration::from_secs(600);

    let mut first = store.begin().await?;
    let mut second = store.begin().await?;
    let a = first.claim_batch(2, lease).await?;
    let b = second.claim_batch(2, lease).await?;

    assert_eq!(a.len(), 2);
    assert_eq!(b.len(), 1);
    assert!(b.ids().iter().all(|id| !a.contains(*id)));

    first.rollback().await?;
    second.rollback().await?;

    let claimed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM processing WHERE processing_started_at IS NOT NULL",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(claimed, 0);

    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_unique_violation_is_fatal(pool: PgPool) -> TestResult {
    sqlx::query("INSERT INTO athletes (id) VALUES (7)")
        .execute(&pool)
        .await?;
    let err = sqlx::query("INSERT INTO athletes (id) VALUES (7)")
        .execute(&pool)
        .await
        .unwrap_err();

    let store_error = StoreError::from(err);
    assert_eq!(store_error.sqlstate(), Some("23505"));
    assert_eq!(
        StandardErrorClassifier::new().classify(&store_error),
        ConflictClass::Fatal
    );

    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn test_insert_notification_wakes_scheduler(pool: PgPool) -> TestResult {
    let route = seed_route(&pool).await?;
    seed_activity(&pool, 1, Some(ALONG_ROUTE)).await?;

    let (waker, mut receiver) = wake_channel();
    let listener = Arc::new(NotificationListener::new(
        pool.clone(),
        "processing_ready",
        vec![waker],
    ));
    let cancel = CancellationToken::new();
    let task = {
        let listener = Arc::clone(&listener);
        let cancel = cancel.clone();
        tokio::spawn(async move { listener.run(cancel).await })
    };

    // LISTEN must be registered before the insert fires the trigger
    tokio::time::timeout(Duration::from_secs(5), async {
        while listener.stats().connections == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    seed_work(&pool, 1, route).await?;

    tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await?;
    assert_eq!(listener.stats().notifications, 1);

    cancel.cancel();
    task.await?;
    Ok(())
}

const SOUTH_HALF: &str = "SRID=4326;LINESTRING(-3.0001 53.995, -3.0001 54.005)";
const NORTH_HALF: &str = "SRID=4326;LINESTRING(-3.0001 54.005, -3.0001 54.015)";

#[sqlx::test(migrations = "./migrations")]
async fn test_route_stats_include_sections_from_concurrent_batch(pool: PgPool) -> TestResult {
    let route = seed_route(&pool).await?;
    seed_activity(&pool, 1, Some(SOUTH_HALF)).await?;
    seed_activity(&pool, 2, Some(NORTH_HALF)).await?;
    seed_work(&pool, 1, route).await?;
    seed_work(&pool, 2, route).await?;

    let store = PgWorkStore::new(pool.clone());
    let lease = Duration::from_secs(600);

    // First batch runs its whole pipeline but holds the commit
    let mut first = store.begin().await?;
    let first_batch = first.claim_batch(1, lease).await?;
    for stage in PipelineStage::ORDERED {
        first.run_stage(stage, &first_batch).await?;
    }

    // Second batch derives its section, then waits on the route lock
    let mut second = store.begin().await?;
    let second_batch = second.claim_batch(1, lease).await?;
    assert_eq!(second_batch.len(), 1);
    let finish_second = tokio::spawn(async move {
        for stage in PipelineStage::ORDERED {
            second.run_stage(stage, &second_batch).await?;
        }
        second.commit().await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!finish_second.is_finished());
    first.commit().await?;
    finish_second.await??;

    let sections: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM route_sections WHERE route_id = $1")
        .bind(route)
        .fetch_one(&pool)
        .await?;
    assert_eq!(sections, 2);

    let union_length: f64 = sqlx::query_scalar(
        "SELECT ST_Length(ST_Union(section_track::geometry)::geography) FROM route_sections WHERE route_id = $1",
    )
    .bind(route)
    .fetch_one(&pool)
    .await?;
    let stored: f64 = sqlx::query_scalar(
        "SELECT covered_length FROM route_stats WHERE route_id = $1 AND athlete_id = 1",
    )
    .bind(route)
    .fetch_one(&pool)
    .await?;

    assert!(union_length > 0.0);
    assert!(
        (stored - union_length).abs() < 0.01,
        "stored coverage {stored} should equal union of all sections {union_length}"
    );

    Ok(())
}
