//! Incident Persistence & Thread-Safe Deduplication
//!
//! Two-layer deduplication, safe under concurrent writers across replicas:
//!
//! 1. **Exact match** — stable fingerprint over (service, description,
//!    components) searched within a severity-aware lookback window. The
//!    newest candidate row is locked `FOR UPDATE` before the fingerprint
//!    comparison, so two replicas racing on the same fingerprint serialise
//!    on the row instead of double-inserting.
//! 2. **Fuzzy match** — normalised text + Jaccard token similarity over
//!    the most recent candidates; a match re-acquires the row lock.
//!
//! Merging a duplicate unions the metrics snapshot and context, bumps the
//! duplicate counter, and escalates severity only upward.

use crate::storage::StorageError;
use crate::types::{Incident, IncidentStatus, Severity};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

/// Token overlap required for a fuzzy match.
pub const FUZZY_SIMILARITY_THRESHOLD: f64 = 0.7;

/// How many recent candidates the fuzzy pass examines.
const FUZZY_CANDIDATE_LIMIT: i64 = 10;

/// Abbreviation table applied during normalisation.
const WORD_NORMALIZATIONS: [(&str, &str); 9] = [
    ("db", "database"),
    ("svc", "service"),
    ("srv", "server"),
    ("conn", "connection"),
    ("auth", "authentication"),
    ("err", "error"),
    ("msg", "message"),
    ("req", "request"),
    ("resp", "response"),
];

// ─── Pure helpers ─────────────────────────────────────────────────────────────

/// Normalise text for fuzzy matching: lowercase, strip punctuation,
/// collapse whitespace, expand common abbreviations.
pub fn normalize_text(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    stripped
        .split_whitespace()
        .map(|word| {
            WORD_NORMALIZATIONS
                .iter()
                .find(|(from, _)| *from == word)
                .map(|(_, to)| *to)
                .unwrap_or(word)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Jaccard similarity over normalised token sets.
pub fn token_similarity(text1: &str, text2: &str) -> f64 {
    let tokens1: HashSet<&str> = text1.split_whitespace().collect();
    let tokens2: HashSet<&str> = text2.split_whitespace().collect();

    if tokens1.is_empty() || tokens2.is_empty() {
        return 0.0;
    }

    let intersection = tokens1.intersection(&tokens2).count();
    let union = tokens1.union(&tokens2).count();
    intersection as f64 / union as f64
}

/// Stable incident fingerprint over normalised service, description and
/// sorted components. 32 hex characters.
pub fn incident_fingerprint(service: &str, description: &str, components: &[String]) -> String {
    let service_norm = service.to_lowercase();
    let desc_norm = description.to_lowercase();
    let mut components_norm: Vec<String> = components
        .iter()
        .map(|c| c.to_lowercase().trim().to_string())
        .collect();
    components_norm.sort();

    let fingerprint_str = format!(
        "{}|{}|{}",
        service_norm.trim(),
        desc_norm.trim(),
        components_norm.join(",")
    );
    let digest = md5::compute(fingerprint_str.as_bytes());
    format!("{digest:x}")
}

/// Whether two incidents are similar enough to be fuzzy duplicates.
/// The service must match exactly (case-insensitive); descriptions are
/// compared by normalised token overlap.
pub fn is_fuzzy_match(service1: &str, desc1: &str, service2: &str, desc2: &str) -> bool {
    if !service1.eq_ignore_ascii_case(service2) {
        return false;
    }

    let similarity = token_similarity(&normalize_text(desc1), &normalize_text(desc2));
    if similarity >= FUZZY_SIMILARITY_THRESHOLD {
        debug!(similarity, "fuzzy match found");
        true
    } else {
        false
    }
}

// ─── Row mapping ──────────────────────────────────────────────────────────────

type IncidentRow = (
    Uuid,
    String,
    String,
    String,
    String,
    String,
    serde_json::Value,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    serde_json::Value,
    serde_json::Value,
);

const INCIDENT_COLUMNS: &str = "id, title, description, status, severity, affected_service, \
     affected_components, detected_at, resolved_at, metrics_snapshot, context";

fn incident_from_row(row: IncidentRow) -> Result<Incident, StorageError> {
    let (
        id,
        title,
        description,
        status,
        severity,
        affected_service,
        affected_components,
        detected_at,
        resolved_at,
        metrics_snapshot,
        context,
    ) = row;

    let status = IncidentStatus::parse(&status)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown incident status: {status}")))?;
    let severity = Severity::parse(&severity)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown severity: {severity}")))?;
    let affected_components: Vec<String> =
        serde_json::from_value(affected_components).unwrap_or_default();

    Ok(Incident {
        id,
        title,
        description,
        status,
        severity,
        affected_service,
        affected_components,
        detected_at,
        resolved_at,
        metrics_snapshot,
        context,
    })
}

// ─── Queries ──────────────────────────────────────────────────────────────────

/// Fetch one incident by id.
pub async fn get_incident(pool: &PgPool, id: Uuid) -> Result<Option<Incident>, StorageError> {
    let row: Option<IncidentRow> = sqlx::query_as(&format!(
        "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(incident_from_row).transpose()
}

/// Fetch one incident by id inside a transaction, locking the row.
pub async fn get_incident_for_update(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<Incident>, StorageError> {
    let row: Option<IncidentRow> = sqlx::query_as(&format!(
        "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await?;

    row.map(incident_from_row).transpose()
}

/// List recent incidents, newest first.
pub async fn list_incidents(pool: &PgPool, limit: i64) -> Result<Vec<Incident>, StorageError> {
    let rows: Vec<IncidentRow> = sqlx::query_as(&format!(
        "SELECT {INCIDENT_COLUMNS} FROM incidents ORDER BY detected_at DESC LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(incident_from_row).collect()
}

/// Update an incident's status inside a transaction; stamps `resolved_at`
/// iff the new status is resolved.
pub async fn set_incident_status(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    status: IncidentStatus,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE incidents \
         SET status = $1, \
             resolved_at = CASE WHEN $2 THEN NOW() ELSE resolved_at END \
         WHERE id = $3",
    )
    .bind(status.as_str())
    .bind(status == IncidentStatus::Resolved)
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Find a duplicate for the given incident inputs within the lookback
/// window, taking a row lock on the match.
///
/// Exact pass: lock the newest non-terminal candidate for the service and
/// compare fingerprints under the lock. Fuzzy pass: scan the most recent
/// candidates lock-free, then re-lock the matched row.
pub async fn find_duplicate_incident(
    tx: &mut Transaction<'_, Postgres>,
    service: &str,
    description: &str,
    components: &[String],
    lookback_minutes: i64,
) -> Result<Option<Incident>, StorageError> {
    let fingerprint = incident_fingerprint(service, description, components);
    let cutoff = Utc::now() - Duration::minutes(lookback_minutes);
    let statuses: Vec<&str> = IncidentStatus::dedup_candidates()
        .iter()
        .map(|s| s.as_str())
        .collect();

    // Exact pass: newest candidate under row lock
    let row: Option<IncidentRow> = sqlx::query_as(&format!(
        "SELECT {INCIDENT_COLUMNS} FROM incidents \
         WHERE affected_service = $1 \
           AND detected_at >= $2 \
           AND status = ANY($3) \
         ORDER BY detected_at DESC \
         LIMIT 1 \
         FOR UPDATE"
    ))
    .bind(service)
    .bind(cutoff)
    .bind(&statuses)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(row) = row {
        let candidate = incident_from_row(row)?;
        let candidate_fingerprint = incident_fingerprint(
            &candidate.affected_service,
            &candidate.description,
            &candidate.affected_components,
        );
        if candidate_fingerprint == fingerprint {
            info!(incident_id = %candidate.id, %fingerprint, "found exact duplicate incident");
            return Ok(Some(candidate));
        }
    }

    // Fuzzy pass: recent candidates without locks
    let rows: Vec<IncidentRow> = sqlx::query_as(&format!(
        "SELECT {INCIDENT_COLUMNS} FROM incidents \
         WHERE affected_service = $1 \
           AND detected_at >= $2 \
           AND status = ANY($3) \
         ORDER BY detected_at DESC \
         LIMIT $4"
    ))
    .bind(service)
    .bind(cutoff)
    .bind(&statuses)
    .bind(FUZZY_CANDIDATE_LIMIT)
    .fetch_all(&mut **tx)
    .await?;

    for row in rows {
        let candidate = incident_from_row(row)?;
        if is_fuzzy_match(
            service,
            description,
            &candidate.affected_service,
            &candidate.description,
        ) {
            info!(incident_id = %candidate.id, "found fuzzy duplicate incident");
            // Lock the row now that we found a match
            let locked: Option<IncidentRow> = sqlx::query_as(&format!(
                "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = $1 FOR UPDATE"
            ))
            .bind(candidate.id)
            .fetch_optional(&mut **tx)
            .await?;
            return locked.map(incident_from_row).transpose();
        }
    }

    Ok(None)
}

/// Inputs for incident creation.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub affected_service: String,
    pub affected_components: Vec<String>,
    pub metrics_snapshot: serde_json::Value,
    pub context: serde_json::Value,
}

/// Create a new incident or merge into an existing duplicate.
///
/// Returns `(incident, created)`. Runs inside the caller's transaction so
/// the dedup lock and the insert/update commit atomically — the caller
/// decides between immediate and deferred commit.
pub async fn create_or_update_incident(
    tx: &mut Transaction<'_, Postgres>,
    new: NewIncident,
    lookback_minutes: i64,
) -> Result<(Incident, bool), StorageError> {
    // Serialise same-fingerprint creators. The row lock below can only
    // cover rows that are already visible; two first writers racing on an
    // empty window would otherwise both insert. The advisory lock is
    // transaction-scoped and released at commit/rollback.
    let fingerprint = incident_fingerprint(
        &new.affected_service,
        &new.description,
        &new.affected_components,
    );
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(&fingerprint)
        .execute(&mut **tx)
        .await?;

    let duplicate = find_duplicate_incident(
        tx,
        &new.affected_service,
        &new.description,
        &new.affected_components,
        lookback_minutes,
    )
    .await?;

    if let Some(mut existing) = duplicate {
        info!(incident_id = %existing.id, "deduplicating: updating existing incident");

        // Merge metrics snapshot
        if let (Some(existing_map), Some(new_map)) = (
            existing.metrics_snapshot.as_object_mut(),
            new.metrics_snapshot.as_object(),
        ) {
            for (k, v) in new_map {
                existing_map.insert(k.clone(), v.clone());
            }
        } else if !new.metrics_snapshot.is_null() {
            existing.metrics_snapshot = new.metrics_snapshot.clone();
        }

        // Merge context, bump duplicate counter, stamp merge time
        let mut context = existing
            .context
            .as_object()
            .cloned()
            .unwrap_or_default();
        if let Some(new_ctx) = new.context.as_object() {
            for (k, v) in new_ctx {
                context.insert(k.clone(), v.clone());
            }
        }
        let duplicate_count = context
            .get("duplicate_count")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0)
            + 1;
        context.insert("duplicate_count".to_string(), duplicate_count.into());
        context.insert(
            "last_duplicate_at".to_string(),
            Utc::now().to_rfc3339().into(),
        );
        existing.context = serde_json::Value::Object(context);

        // Escalate severity only upward
        if new.severity > existing.severity {
            info!(
                from = existing.severity.as_str(),
                to = new.severity.as_str(),
                "escalating severity"
            );
            existing.severity = new.severity;
        }

        sqlx::query(
            "UPDATE incidents \
             SET severity = $1, metrics_snapshot = $2, context = $3 \
             WHERE id = $4",
        )
        .bind(existing.severity.as_str())
        .bind(&existing.metrics_snapshot)
        .bind(&existing.context)
        .bind(existing.id)
        .execute(&mut **tx)
        .await?;

        return Ok((existing, false));
    }

    // No duplicate: insert a fresh row. Snapshot and context columns are
    // always objects so later jsonb merges (`context || ...`) are valid.
    let id = Uuid::new_v4();
    let detected_at = Utc::now();
    let components_json = serde_json::to_value(&new.affected_components)
        .unwrap_or(serde_json::Value::Array(Vec::new()));
    let metrics_snapshot = if new.metrics_snapshot.is_object() {
        new.metrics_snapshot.clone()
    } else {
        serde_json::Value::Object(serde_json::Map::new())
    };
    let context = if new.context.is_object() {
        new.context.clone()
    } else {
        serde_json::Value::Object(serde_json::Map::new())
    };

    sqlx::query(
        "INSERT INTO incidents \
         (id, title, description, status, severity, affected_service, \
          affected_components, detected_at, metrics_snapshot, context) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(IncidentStatus::Detected.as_str())
    .bind(new.severity.as_str())
    .bind(&new.affected_service)
    .bind(&components_json)
    .bind(detected_at)
    .bind(&metrics_snapshot)
    .bind(&context)
    .execute(&mut **tx)
    .await?;

    info!(incident_id = %id, "created new incident (no duplicates found)");

    Ok((
        Incident {
            id,
            title: new.title,
            description: new.description,
            status: IncidentStatus::Detected,
            severity: new.severity,
            affected_service: new.affected_service,
            affected_components: new.affected_components,
            detected_at,
            resolved_at: None,
            metrics_snapshot,
            context,
        },
        true,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalisation_expands_abbreviations() {
        assert_eq!(
            normalize_text("DB conn timeout!!"),
            "database connection timeout"
        );
        assert_eq!(normalize_text("  Svc   err:  500s  "), "service error 500s");
    }

    #[test]
    fn normalisation_strips_punctuation_and_case() {
        assert_eq!(
            normalize_text("High Error-Rate (5xx) in API!"),
            "high error rate 5xx in api"
        );
    }

    #[test]
    fn token_similarity_bounds() {
        assert!((token_similarity("a b c", "a b c") - 1.0).abs() < f64::EPSILON);
        assert!((token_similarity("a b", "c d")).abs() < f64::EPSILON);
        assert!((token_similarity("", "a")).abs() < f64::EPSILON);
        // {a,b,c} ∩ {b,c,d} = 2, ∪ = 4
        assert!((token_similarity("a b c", "b c d") - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn fingerprint_is_stable_and_component_order_free() {
        let f1 = incident_fingerprint(
            "API",
            "High error rate",
            &["Gateway".to_string(), "auth".to_string()],
        );
        let f2 = incident_fingerprint(
            "api",
            "high error rate",
            &["auth".to_string(), "gateway".to_string()],
        );
        assert_eq!(f1, f2);
        assert_eq!(f1.len(), 32);

        let f3 = incident_fingerprint("api", "different description", &[]);
        assert_ne!(f1, f3);
    }

    #[test]
    fn fuzzy_match_requires_same_service() {
        assert!(is_fuzzy_match(
            "api",
            "db conn timeout in pool",
            "API",
            "database connection timeout in pool"
        ));
        assert!(!is_fuzzy_match(
            "api",
            "db conn timeout in pool",
            "payment",
            "database connection timeout in pool"
        ));
    }

    #[test]
    fn fuzzy_match_threshold() {
        // Nearly identical after normalisation
        assert!(is_fuzzy_match(
            "api",
            "High error rate on checkout",
            "api",
            "high error-rate on checkout"
        ));
        // Unrelated descriptions
        assert!(!is_fuzzy_match(
            "api",
            "memory leak in worker pool",
            "api",
            "tls certificate expired"
        ));
    }
}
