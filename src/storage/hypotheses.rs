//! Hypothesis persistence — dense-ranked rows linked to an incident

use crate::reasoning::hypothesis::RankedHypothesis;
use crate::reasoning::llm_client::LlmResponse;
use crate::storage::StorageError;
use crate::types::{AnomalyCategory, Evidence, Hypothesis};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

type HypothesisRow = (
    Uuid,
    Uuid,
    String,
    String,
    f64,
    i32,
    serde_json::Value,
    String,
    String,
    i64,
    i64,
);

const HYPOTHESIS_COLUMNS: &str = "id, incident_id, description, category, confidence_score, \
     rank, evidence, reasoning, model_id, prompt_tokens, completion_tokens";

fn hypothesis_from_row(row: HypothesisRow) -> Hypothesis {
    let (
        id,
        incident_id,
        description,
        category,
        confidence_score,
        rank,
        evidence,
        reasoning,
        model_id,
        prompt_tokens,
        completion_tokens,
    ) = row;

    let evidence: Vec<Evidence> = serde_json::from_value(evidence).unwrap_or_default();

    Hypothesis {
        id,
        incident_id,
        description,
        category: AnomalyCategory::parse(&category),
        confidence_score,
        rank,
        evidence,
        reasoning,
        model_id,
        prompt_tokens,
        completion_tokens,
    }
}

/// Persist a batch of ranked hypotheses for an incident inside the
/// caller's transaction. Ranks are already dense 1..N from the ranker.
pub async fn insert_hypotheses(
    tx: &mut Transaction<'_, Postgres>,
    incident_id: Uuid,
    hypotheses: &[RankedHypothesis],
    llm_response: &LlmResponse,
) -> Result<Vec<Uuid>, StorageError> {
    let mut ids = Vec::with_capacity(hypotheses.len());

    for hypothesis in hypotheses {
        let id = Uuid::new_v4();
        let evidence = serde_json::to_value(&hypothesis.evidence)
            .unwrap_or(serde_json::Value::Array(Vec::new()));

        sqlx::query(
            "INSERT INTO hypotheses \
             (id, incident_id, description, category, confidence_score, rank, \
              evidence, reasoning, model_id, prompt_tokens, completion_tokens) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(id)
        .bind(incident_id)
        .bind(&hypothesis.description)
        .bind(hypothesis.category.as_str())
        .bind(hypothesis.confidence_score)
        .bind(hypothesis.rank)
        .bind(&evidence)
        .bind(&hypothesis.reasoning)
        .bind(&llm_response.model)
        .bind(llm_response.prompt_tokens)
        .bind(llm_response.completion_tokens)
        .execute(&mut **tx)
        .await?;

        ids.push(id);
    }

    Ok(ids)
}

/// Hypotheses for an incident, ordered by rank.
pub async fn list_for_incident(
    pool: &PgPool,
    incident_id: Uuid,
) -> Result<Vec<Hypothesis>, StorageError> {
    let rows: Vec<HypothesisRow> = sqlx::query_as(&format!(
        "SELECT {HYPOTHESIS_COLUMNS} FROM hypotheses \
         WHERE incident_id = $1 ORDER BY rank ASC"
    ))
    .bind(incident_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(hypothesis_from_row).collect())
}

/// Fetch one hypothesis by id.
pub async fn get_hypothesis(
    pool: &PgPool,
    id: Uuid,
) -> Result<Option<Hypothesis>, StorageError> {
    let row: Option<HypothesisRow> = sqlx::query_as(&format!(
        "SELECT {HYPOTHESIS_COLUMNS} FROM hypotheses WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(hypothesis_from_row))
}

/// Record operator validation feedback on a hypothesis row, inside the
/// caller's transaction.
pub async fn record_validation(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    validated: bool,
    feedback: &str,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE hypotheses SET validated = $1, validation_feedback = $2 WHERE id = $3")
        .bind(validated)
        .bind(feedback)
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
