//! Pattern Counters — pessimistically locked learning rows
//!
//! One row per `"{service}:{category}"`. Counters are always recomputed
//! from the locked row, never from in-memory state, so concurrent replicas
//! cannot read stale values and overwrite each other's aggregates.

use crate::storage::StorageError;
use crate::types::{AnomalyCategory, IncidentPattern};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

type PatternRow = (String, String, String, serde_json::Value, f64, i64, f64);

const PATTERN_COLUMNS: &str = "pattern_id, name, category, signal_indicators, \
     confidence_adjustment, occurrence_count, success_rate";

fn pattern_from_row(row: PatternRow) -> IncidentPattern {
    let (
        pattern_id,
        name,
        category,
        signal_indicators,
        confidence_adjustment,
        occurrence_count,
        success_rate,
    ) = row;

    IncidentPattern {
        pattern_id,
        name,
        category: AnomalyCategory::parse(&category),
        signal_indicators: serde_json::from_value(signal_indicators).unwrap_or_default(),
        confidence_adjustment,
        occurrence_count,
        success_rate,
    }
}

/// Confidence adjustment derived from the success rate: trusted patterns
/// (> 0.8) get +0.10, failing patterns (< 0.3) get −0.10.
pub fn adjustment_for(success_rate: f64) -> f64 {
    if success_rate > 0.8 {
        0.10
    } else if success_rate < 0.3 {
        -0.10
    } else {
        0.0
    }
}

/// Atomically record one outcome for a pattern, inside the caller's
/// transaction.
///
/// Locks the row `FOR UPDATE`, recomputes
/// `new_success = (success_rate · count + correct) / (count + 1)` from the
/// locked values, and persists. Absent rows are inserted fresh with
/// occurrence_count = 1.
pub async fn record_outcome(
    tx: &mut Transaction<'_, Postgres>,
    service: &str,
    category: AnomalyCategory,
    signal_indicators: &[String],
    was_correct: bool,
) -> Result<IncidentPattern, StorageError> {
    let pattern_id = IncidentPattern::pattern_key(service, category);

    let row: Option<PatternRow> = sqlx::query_as(&format!(
        "SELECT {PATTERN_COLUMNS} FROM incident_patterns \
         WHERE pattern_id = $1 FOR UPDATE"
    ))
    .bind(&pattern_id)
    .fetch_optional(&mut **tx)
    .await?;

    let updated = match row {
        Some(row) => {
            let existing = pattern_from_row(row);

            let new_count = existing.occurrence_count + 1;
            let successes =
                existing.success_rate * existing.occurrence_count as f64 + f64::from(was_correct as u8);
            let new_success_rate = successes / new_count as f64;
            let new_adjustment = adjustment_for(new_success_rate);

            sqlx::query(
                "UPDATE incident_patterns \
                 SET occurrence_count = $1, success_rate = $2, confidence_adjustment = $3 \
                 WHERE pattern_id = $4",
            )
            .bind(new_count)
            .bind(new_success_rate)
            .bind(new_adjustment)
            .bind(&pattern_id)
            .execute(&mut **tx)
            .await?;

            info!(
                pattern = %pattern_id,
                occurrences = new_count,
                success_rate = new_success_rate,
                "updated pattern counters"
            );

            IncidentPattern {
                occurrence_count: new_count,
                success_rate: new_success_rate,
                confidence_adjustment: new_adjustment,
                ..existing
            }
        }
        None => {
            let success_rate = if was_correct { 1.0 } else { 0.0 };
            let fresh = IncidentPattern {
                pattern_id: pattern_id.clone(),
                name: format!("{} pattern for {}", category, service),
                category,
                signal_indicators: signal_indicators.to_vec(),
                confidence_adjustment: adjustment_for(success_rate),
                occurrence_count: 1,
                success_rate,
            };

            let indicators = serde_json::to_value(&fresh.signal_indicators)
                .unwrap_or(serde_json::Value::Array(Vec::new()));

            sqlx::query(
                "INSERT INTO incident_patterns \
                 (pattern_id, name, category, signal_indicators, \
                  confidence_adjustment, occurrence_count, success_rate) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&fresh.pattern_id)
            .bind(&fresh.name)
            .bind(fresh.category.as_str())
            .bind(&indicators)
            .bind(fresh.confidence_adjustment)
            .bind(fresh.occurrence_count)
            .bind(fresh.success_rate)
            .execute(&mut **tx)
            .await?;

            info!(pattern = %pattern_id, "inserted fresh pattern row");
            fresh
        }
    };

    Ok(updated)
}

/// Fetch one pattern row (unlocked).
pub async fn get_pattern(
    pool: &PgPool,
    pattern_id: &str,
) -> Result<Option<IncidentPattern>, StorageError> {
    let row: Option<PatternRow> = sqlx::query_as(&format!(
        "SELECT {PATTERN_COLUMNS} FROM incident_patterns WHERE pattern_id = $1"
    ))
    .bind(pattern_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(pattern_from_row))
}

/// Load all pattern rows, for cache warmup. The bound is small
/// (#services × #categories), so no pagination.
pub async fn load_all(pool: &PgPool) -> Result<Vec<IncidentPattern>, StorageError> {
    let rows: Vec<PatternRow> = sqlx::query_as(&format!(
        "SELECT {PATTERN_COLUMNS} FROM incident_patterns"
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(pattern_from_row).collect())
}
