//! Concurrency Integration Tests
//!
//! Exercises the row-lock contracts against a real PostgreSQL instance:
//! incident dedup under concurrent writers, pattern counters under racing
//! outcome captures, and exclusive queue claims.
//!
//! These tests require a database at AEGIS_TEST_DATABASE_URL. If the
//! variable is unset, tests are skipped (not failed).

use aegis::storage::incidents::{create_or_update_incident, NewIncident};
use aegis::storage::{patterns, queue};
use aegis::types::{AnomalyCategory, Severity};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

/// Connect to the test database or skip.
async fn try_connect() -> Option<PgPool> {
    let url = match std::env::var("AEGIS_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("SKIP: AEGIS_TEST_DATABASE_URL not set — skipping concurrency test");
            return None;
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(30)
        .connect(&url)
        .await
        .expect("failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    Some(pool)
}

fn new_incident(service: &str, description: &str) -> NewIncident {
    NewIncident {
        title: format!("Anomalies detected in {service}"),
        description: description.to_string(),
        severity: Severity::High,
        affected_service: service.to_string(),
        affected_components: vec![service.to_string()],
        metrics_snapshot: serde_json::json!({}),
        context: serde_json::json!({}),
    }
}

#[tokio::test]
async fn concurrent_identical_incidents_collapse_to_one_row() {
    let Some(pool) = try_connect().await else {
        return;
    };

    // Unique service name per run so reruns don't collide
    let service = format!("api-{}", Uuid::new_v4());
    let description = "High error rate";

    let mut handles = Vec::new();
    for _ in 0..2 {
        let pool = pool.clone();
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let mut tx = pool.begin().await.expect("begin");
            let (incident, created) =
                create_or_update_incident(&mut tx, new_incident(&service, description), 60)
                    .await
                    .expect("create_or_update");
            tx.commit().await.expect("commit");
            (incident.id, created)
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.expect("task"));
    }

    // Exactly one creation; both calls resolve to the same row
    let created_count = results.iter().filter(|(_, created)| *created).count();
    assert_eq!(created_count, 1);
    assert_eq!(results[0].0, results[1].0);

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM incidents WHERE affected_service = $1")
            .bind(&service)
            .fetch_one(&pool)
            .await
            .expect("count");
    assert_eq!(count, 1);

    // The duplicate merge bumped the counter
    let (context,): (serde_json::Value,) =
        sqlx::query_as("SELECT context FROM incidents WHERE affected_service = $1")
            .bind(&service)
            .fetch_one(&pool)
            .await
            .expect("context");
    assert_eq!(context["duplicate_count"], 1);
}

#[tokio::test]
async fn severity_only_escalates_on_merge() {
    let Some(pool) = try_connect().await else {
        return;
    };

    let service = format!("svc-{}", Uuid::new_v4());

    let mut tx = pool.begin().await.expect("begin");
    let mut first = new_incident(&service, "DB conn timeout");
    first.severity = Severity::Medium;
    create_or_update_incident(&mut tx, first, 60)
        .await
        .expect("first");
    tx.commit().await.expect("commit");

    // Higher severity escalates
    let mut tx = pool.begin().await.expect("begin");
    let mut second = new_incident(&service, "DB conn timeout");
    second.severity = Severity::Critical;
    let (merged, created) = create_or_update_incident(&mut tx, second, 60)
        .await
        .expect("second");
    tx.commit().await.expect("commit");
    assert!(!created);
    assert_eq!(merged.severity, Severity::Critical);

    // Lower severity does not downgrade
    let mut tx = pool.begin().await.expect("begin");
    let mut third = new_incident(&service, "DB conn timeout");
    third.severity = Severity::Low;
    let (merged, created) = create_or_update_incident(&mut tx, third, 60)
        .await
        .expect("third");
    tx.commit().await.expect("commit");
    assert!(!created);
    assert_eq!(merged.severity, Severity::Critical);
}

#[tokio::test]
async fn pattern_counters_are_exact_under_race() {
    let Some(pool) = try_connect().await else {
        return;
    };

    let service = format!("payment-{}", Uuid::new_v4());
    let category = AnomalyCategory::MemoryLeak;

    // 20 concurrent captures: 15 correct, 5 incorrect
    let mut handles = Vec::new();
    for i in 0..20 {
        let pool = pool.clone();
        let service = service.clone();
        let correct = i < 15;
        handles.push(tokio::spawn(async move {
            let mut tx = pool.begin().await.expect("begin");
            patterns::record_outcome(&mut tx, &service, category, &[], correct)
                .await
                .expect("record_outcome");
            tx.commit().await.expect("commit");
        }));
    }
    for handle in handles {
        handle.await.expect("task");
    }

    let pattern_id = format!("{service}:memory_leak");
    let pattern = patterns::get_pattern(&pool, &pattern_id)
        .await
        .expect("get_pattern")
        .expect("pattern exists");

    assert_eq!(pattern.occurrence_count, 20);
    assert!((pattern.success_rate - 0.75).abs() < 1e-9);
    // 0.3 ≤ 0.75 ≤ 0.8 → no adjustment
    assert!((pattern.confidence_adjustment).abs() < f64::EPSILON);

    // The learning engine's L1 cache picks the row up at warmup and
    // serves the committed adjustment
    let engine = aegis::LearningEngine::new(pool.clone());
    engine.warmup().await.expect("warmup");
    assert!((engine.confidence_adjustment(&service, category)).abs() < f64::EPSILON);
    let cached = engine.cached_pattern(&pattern_id).expect("cached");
    assert_eq!(cached.occurrence_count, 20);
}

#[tokio::test]
async fn queue_claims_are_exclusive() {
    let Some(pool) = try_connect().await else {
        return;
    };

    let incident_id = Uuid::new_v4();
    // Seed a minimal incident so the job references something real
    sqlx::query(
        "INSERT INTO incidents (id, title, description, status, severity, affected_service) \
         VALUES ($1, 'q', 'q', 'analyzing', 'high', 'queue-test')",
    )
    .bind(incident_id)
    .execute(&pool)
    .await
    .expect("seed incident");

    let job_id = queue::enqueue_job(
        &pool,
        queue::job_type::ANALYZE_INCIDENT,
        incident_id,
        serde_json::Value::Null,
    )
    .await
    .expect("enqueue");

    // Two concurrent claims: exactly one wins this job
    let (a, b) = tokio::join!(queue::claim_job(&pool), queue::claim_job(&pool));
    let a = a.expect("claim a");
    let b = b.expect("claim b");

    // Other tests may have left pending jobs, so only assert exclusivity
    // over our job: it must not be claimed by both calls.
    let claimed_ids: Vec<Uuid> = [a, b].into_iter().flatten().map(|j| j.id).collect();
    let ours = claimed_ids.iter().filter(|id| **id == job_id).count();
    assert!(ours <= 1, "job claimed twice");
}
