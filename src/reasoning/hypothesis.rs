//! Hypothesis Generation — model-proposed causes, deterministically scored
//!
//! The model emits candidate hypotheses with evidence and reasoning but no
//! confidence scores; scoring is a pure function over the evidence, the
//! triggering anomalies, and the service topology. For fixed inputs the
//! computed confidence is byte-for-byte reproducible and always lands in
//! [0.01, 0.99].

use crate::cache::SharedCache;
use crate::perception::anomaly_detector::Anomaly;
use crate::reasoning::llm_client::{self, LlmClient, LlmError, LlmRequest, LlmResponse};
use crate::topology::DependencyGraph;
use crate::types::{AnomalyCategory, Evidence, ServiceContext};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Confidence combination weights: base / evidence / anomaly strength.
const WEIGHT_BASE: f64 = 0.40;
const WEIGHT_EVIDENCE: f64 = 0.35;
const WEIGHT_ANOMALY: f64 = 0.25;

/// Clamp bounds for the final confidence.
const CONFIDENCE_FLOOR: f64 = 0.01;
const CONFIDENCE_CEIL: f64 = 0.99;

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("no anomalies provided for hypothesis generation")]
    NoAnomalies,

    #[error("model call failed: {0}")]
    Llm(#[from] LlmError),

    /// Structural: the model response did not conform to the schema.
    /// Fail fast — the caller retries the unit of work or marks it failed.
    #[error("structured output parse failed: {0}")]
    StructuredOutput(#[from] serde_json::Error),
}

/// Hypothesis as emitted by the model. Carries no confidence field; the
/// schema never asks for one.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmHypothesis {
    pub description: String,
    pub category: String,
    pub evidence: Vec<Evidence>,
    pub reasoning: String,
}

/// Top-level structured model output.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmHypothesesResponse {
    pub hypotheses: Vec<LlmHypothesis>,
    pub overall_assessment: String,
}

/// Hypothesis after deterministic scoring and ranking.
#[derive(Debug, Clone)]
pub struct RankedHypothesis {
    /// 1-based dense rank, descending confidence.
    pub rank: i32,
    pub description: String,
    pub category: AnomalyCategory,
    pub confidence_score: f64,
    pub evidence: Vec<Evidence>,
    pub reasoning: String,
}

/// Final reasoning output for one incident.
#[derive(Debug, Clone)]
pub struct HypothesesResponse {
    pub hypotheses: Vec<RankedHypothesis>,
    pub overall_assessment: String,
}

// ─── Deterministic confidence ─────────────────────────────────────────────────

/// Base confidence by category, from historical incident data.
fn category_base_confidence(category: AnomalyCategory) -> f64 {
    match category {
        AnomalyCategory::MemoryLeak => 0.70,
        AnomalyCategory::CpuSpike => 0.75,
        AnomalyCategory::TrafficSpike => 0.80,
        AnomalyCategory::LatencySpike => 0.65,
        AnomalyCategory::ErrorSpike => 0.85,
        AnomalyCategory::DatabaseIssue => 0.60,
        AnomalyCategory::NetworkIssue => 0.55,
        AnomalyCategory::DeploymentIssue => 0.80,
        _ => 0.50,
    }
}

/// Evidence quality: `avg_relevance · 0.6 + diversity_bonus + count_bonus`,
/// where diversity is +0.05 per distinct signal type (max +0.15) and count
/// is +0.03 per item (max +0.10). Empty evidence scores 0.
fn evidence_score(evidence: &[Evidence]) -> f64 {
    if evidence.is_empty() {
        return 0.0;
    }

    let avg_relevance = evidence.iter().map(|e| e.relevance).sum::<f64>() / evidence.len() as f64;

    let distinct_types = evidence
        .iter()
        .map(|e| e.signal_type.as_str())
        .collect::<std::collections::HashSet<_>>()
        .len();
    let diversity_bonus = (distinct_types as f64 * 0.05).min(0.15);
    let count_bonus = (evidence.len() as f64 * 0.03).min(0.10);

    avg_relevance * 0.6 + diversity_bonus + count_bonus
}

/// Anomaly strength: `avg_confidence · 0.7 + deviation_score · 0.3` where
/// deviation normalises the strongest σ against 6.0 (3σ = 0.5, 6σ = 1.0).
fn anomaly_score(anomalies: &[Anomaly]) -> f64 {
    if anomalies.is_empty() {
        return 0.0;
    }

    let avg_confidence =
        anomalies.iter().map(|a| a.confidence).sum::<f64>() / anomalies.len() as f64;
    let max_deviation = anomalies
        .iter()
        .map(|a| a.deviation_sigma)
        .fold(0.0, f64::max);
    let deviation_score = (max_deviation / 6.0).min(1.0);

    avg_confidence * 0.7 + deviation_score * 0.3
}

/// Search the evidence for a known service other than the affected one.
/// Matching is by substring over signal names and observations so that
/// evidence like "upstream database connection pool exhausted" implicates
/// the `database` node.
fn implicated_service<'a>(
    evidence: &[Evidence],
    affected_service: &str,
    graph: &'a DependencyGraph,
) -> Option<&'a str> {
    let haystacks: Vec<String> = evidence
        .iter()
        .flat_map(|e| [e.signal_name.to_lowercase(), e.observation.to_lowercase()])
        .collect();

    graph
        .services()
        .filter(|s| *s != affected_service)
        .find(|service| {
            let needle = service.to_lowercase();
            haystacks.iter().any(|h| h.contains(&needle))
        })
}

/// Deterministic confidence for one hypothesis.
///
/// `0.4·base + 0.35·evidence + 0.25·anomaly + topology boost`, clamped to
/// [0.01, 0.99].
pub fn calculate_confidence(
    category: AnomalyCategory,
    evidence: &[Evidence],
    anomalies: &[Anomaly],
    affected_service: &str,
    graph: &DependencyGraph,
) -> f64 {
    let base = category_base_confidence(category);
    let evidence_quality = evidence_score(evidence);
    let anomaly_strength = anomaly_score(anomalies);

    let mut confidence =
        base * WEIGHT_BASE + evidence_quality * WEIGHT_EVIDENCE + anomaly_strength * WEIGHT_ANOMALY;

    if let Some(cause) = implicated_service(evidence, affected_service, graph) {
        let boost = graph.dependency_boost(affected_service, cause);
        if boost != 0.0 {
            debug!(
                affected = affected_service,
                cause,
                boost,
                "applying topology boost"
            );
            confidence += boost;
        }
    }

    confidence.clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEIL)
}

// ─── Prompt construction ──────────────────────────────────────────────────────

const SYSTEM_PROMPT: &str = "You are an expert Site Reliability Engineer (SRE) with deep experience in incident response and root cause analysis.

Your task is to analyze metric anomalies and generate hypotheses about the root cause.

Guidelines:
- Think like an experienced SRE: consider common failure modes and patterns
- Generate 2-5 hypotheses with detailed evidence and reasoning
- DO NOT provide confidence scores (these will be calculated separately)
- Show your reasoning (chain-of-thought)
- Consider dependencies and system interactions
- Be specific and actionable
- List supporting evidence with relevance scores

Focus on generating insightful hypotheses. Confidence will be scored deterministically.";

/// JSON schema embedded in the prompt to constrain the model's output.
const RESPONSE_SCHEMA: &str = r#"{
  "type": "object",
  "required": ["hypotheses", "overall_assessment"],
  "properties": {
    "hypotheses": {
      "type": "array",
      "minItems": 1,
      "maxItems": 5,
      "items": {
        "type": "object",
        "required": ["description", "category", "evidence", "reasoning"],
        "properties": {
          "description": {"type": "string"},
          "category": {"type": "string", "description": "memory_leak, cpu_spike, network_issue, database_issue, etc."},
          "evidence": {
            "type": "array",
            "items": {
              "type": "object",
              "required": ["signal_type", "signal_name", "observation", "relevance"],
              "properties": {
                "signal_type": {"type": "string"},
                "signal_name": {"type": "string"},
                "observation": {"type": "string"},
                "relevance": {"type": "number", "minimum": 0.0, "maximum": 1.0}
              }
            }
          },
          "reasoning": {"type": "string"}
        }
      }
    },
    "overall_assessment": {"type": "string"}
  }
}"#;

/// Build the analysis prompt: service, numbered anomalies, optional
/// context, task instruction and the response schema.
pub fn build_prompt(
    anomalies: &[Anomaly],
    service_name: &str,
    service_context: Option<&ServiceContext>,
) -> String {
    let mut parts: Vec<String> = vec![
        "## Incident Analysis Request".to_string(),
        String::new(),
        format!("**Service:** {service_name}"),
        String::new(),
        "## Detected Anomalies".to_string(),
        String::new(),
    ];

    for (i, anomaly) in anomalies.iter().enumerate() {
        parts.push(format!(
            "Anomaly #{n}:\n\
             - Metric: {metric}\n\
             - Current Value: {current:.2}\n\
             - Expected Value: {expected:.2}\n\
             - Deviation: {sigma:.2} standard deviations\n\
             - Confidence: {confidence:.2}\n\
             - Timestamp: {ts}\n\
             - Labels: {labels:?}",
            n = i + 1,
            metric = anomaly.metric_name,
            current = anomaly.current_value,
            expected = anomaly.expected_value,
            sigma = anomaly.deviation_sigma,
            confidence = anomaly.confidence,
            ts = anomaly.timestamp,
            labels = anomaly.labels,
        ));
    }

    if let Some(ctx) = service_context {
        parts.push(String::new());
        parts.push("## Service Context".to_string());
        parts.push(String::new());
        if !ctx.dependencies.is_empty() {
            parts.push(format!("**Dependencies:** {}", ctx.dependencies.join(", ")));
        }
        if let Some(deployments) = &ctx.recent_deployments {
            parts.push(format!("**Recent Deployments:** {deployments}"));
        }
        if let Some(tier) = &ctx.tier {
            parts.push(format!("**Service Tier:** {tier}"));
        }
        if let Some(team) = &ctx.team {
            parts.push(format!("**Owning Team:** {team}"));
        }
    }

    parts.extend([
        String::new(),
        "## Task".to_string(),
        String::new(),
        "Based on the anomalies above, generate 2-5 hypotheses for the root cause.".to_string(),
        String::new(),
        "For each hypothesis:".to_string(),
        "1. Provide a clear description of what you think is happening".to_string(),
        "2. Categorize the issue (memory_leak, cpu_spike, network_issue, etc.)".to_string(),
        "3. List the supporting evidence from the anomalies with relevance scores (0.0-1.0)"
            .to_string(),
        "4. Explain your reasoning (chain-of-thought)".to_string(),
        String::new(),
        "Note: Confidence scores will be calculated deterministically based on your evidence."
            .to_string(),
        String::new(),
        "You must respond with valid JSON that conforms to this schema:".to_string(),
        String::new(),
        RESPONSE_SCHEMA.to_string(),
    ]);

    parts.join("\n")
}

// ─── Generator ────────────────────────────────────────────────────────────────

/// Generates root-cause hypotheses via the model, then scores and ranks
/// them deterministically.
pub struct HypothesisGenerator {
    llm: Arc<dyn LlmClient>,
    cache: Option<SharedCache>,
    graph: Arc<DependencyGraph>,
    temperature: f64,
    max_tokens: u32,
    cache_ttl_seconds: u64,
}

impl HypothesisGenerator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        cache: Option<SharedCache>,
        graph: Arc<DependencyGraph>,
        temperature: f64,
        max_tokens: u32,
        cache_ttl_seconds: u64,
    ) -> Self {
        Self {
            llm,
            cache,
            graph,
            temperature,
            max_tokens,
            cache_ttl_seconds,
        }
    }

    /// Generate, score and rank hypotheses for a set of anomalies.
    ///
    /// Returns the ranked response plus the raw model response for token
    /// accounting. Parse failures are structural errors — no retry here.
    pub async fn generate(
        &self,
        anomalies: &[Anomaly],
        service_name: &str,
        service_context: Option<&ServiceContext>,
    ) -> Result<(HypothesesResponse, LlmResponse), ReasoningError> {
        if anomalies.is_empty() {
            return Err(ReasoningError::NoAnomalies);
        }

        let request = LlmRequest {
            system_prompt: SYSTEM_PROMPT.to_string(),
            user_prompt: build_prompt(anomalies, service_name, service_context),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let llm_response = llm_client::generate(
            self.llm.as_ref(),
            self.cache.as_ref(),
            self.cache_ttl_seconds,
            &request,
        )
        .await?;

        let json = llm_client::extract_json(&llm_response.content);
        let parsed: LlmHypothesesResponse = serde_json::from_str(json)?;

        let ranked = rank_hypotheses(parsed.hypotheses, anomalies, service_name, &self.graph);

        info!(
            service = service_name,
            hypotheses = ranked.len(),
            total_tokens = llm_response.total_tokens,
            "generated hypotheses with deterministic confidence"
        );

        Ok((
            HypothesesResponse {
                hypotheses: ranked,
                overall_assessment: parsed.overall_assessment,
            },
            llm_response,
        ))
    }
}

/// Score and rank model hypotheses: sort by confidence descending, assign
/// dense ranks 1..N. Ties keep insertion order (stable sort).
pub fn rank_hypotheses(
    hypotheses: Vec<LlmHypothesis>,
    anomalies: &[Anomaly],
    affected_service: &str,
    graph: &DependencyGraph,
) -> Vec<RankedHypothesis> {
    let mut scored: Vec<RankedHypothesis> = hypotheses
        .into_iter()
        .map(|h| {
            let category = AnomalyCategory::parse(&h.category);
            let confidence =
                calculate_confidence(category, &h.evidence, anomalies, affected_service, graph);
            RankedHypothesis {
                rank: 0,
                description: h.description,
                category,
                confidence_score: confidence,
                evidence: h.evidence,
                reasoning: h.reasoning,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.confidence_score
            .partial_cmp(&a.confidence_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    for (i, hypothesis) in scored.iter_mut().enumerate() {
        hypothesis.rank = i as i32 + 1;
    }
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Criticality, ServiceDependency};
    use std::collections::HashMap;

    fn anomaly(confidence: f64, sigma: f64) -> Anomaly {
        Anomaly {
            metric_name: "error_rate".to_string(),
            is_anomaly: true,
            current_value: 10.0,
            expected_value: 1.0,
            deviation_sigma: sigma,
            confidence,
            timestamp: 0.0,
            labels: HashMap::new(),
        }
    }

    fn evidence(signal_type: &str, relevance: f64) -> Evidence {
        Evidence {
            signal_type: signal_type.to_string(),
            signal_name: "error_rate".to_string(),
            observation: "elevated".to_string(),
            relevance,
        }
    }

    #[test]
    fn confidence_is_pure_and_clamped() {
        let graph = DependencyGraph::default();
        let evidence = vec![evidence("metric", 0.9), evidence("log", 0.8)];
        let anomalies = vec![anomaly(0.9, 6.0)];

        let c1 = calculate_confidence(
            AnomalyCategory::ErrorSpike,
            &evidence,
            &anomalies,
            "api",
            &graph,
        );
        let c2 = calculate_confidence(
            AnomalyCategory::ErrorSpike,
            &evidence,
            &anomalies,
            "api",
            &graph,
        );
        assert_eq!(c1.to_bits(), c2.to_bits());
        assert!((CONFIDENCE_FLOOR..=CONFIDENCE_CEIL).contains(&c1));
    }

    #[test]
    fn confidence_matches_formula_by_hand() {
        let graph = DependencyGraph::default();
        let ev = vec![evidence("metric", 0.8), evidence("log", 0.6)];
        let anomalies = vec![anomaly(0.9, 6.0)];

        // base = 0.85 (error_spike)
        // evidence = 0.7*0.6 + min(0.15, 2*0.05) + min(0.10, 2*0.03) = 0.42 + 0.10 + 0.06
        // anomaly = 0.9*0.7 + min(1, 6/6)*0.3 = 0.63 + 0.30
        let expected = 0.85 * 0.40 + (0.7 * 0.6 + 0.10 + 0.06) * 0.35 + (0.63 + 0.30) * 0.25;
        let got = calculate_confidence(AnomalyCategory::ErrorSpike, &ev, &anomalies, "api", &graph);
        assert!((got - expected).abs() < 1e-12);
    }

    #[test]
    fn empty_evidence_scores_zero() {
        assert!((evidence_score(&[])).abs() < f64::EPSILON);
    }

    #[test]
    fn no_anomalies_scores_zero_strength() {
        assert!((anomaly_score(&[])).abs() < f64::EPSILON);
    }

    #[test]
    fn upstream_implication_boosts_confidence() {
        let graph = DependencyGraph::from_services(vec![
            ServiceDependency {
                service: "api".to_string(),
                depends_on: vec!["database".to_string()],
                depended_by: Vec::new(),
                tier: None,
                team: None,
                criticality: Criticality::High,
            },
            ServiceDependency {
                service: "database".to_string(),
                depends_on: Vec::new(),
                depended_by: Vec::new(),
                tier: None,
                team: None,
                criticality: Criticality::Critical,
            },
        ]);

        let anomalies = vec![anomaly(0.8, 4.0)];
        let plain = vec![evidence("metric", 0.7)];
        let mut implicating = plain.clone();
        implicating[0].observation = "database connection pool exhausted".to_string();

        let without = calculate_confidence(
            AnomalyCategory::DatabaseIssue,
            &plain,
            &anomalies,
            "api",
            &graph,
        );
        let with = calculate_confidence(
            AnomalyCategory::DatabaseIssue,
            &implicating,
            &anomalies,
            "api",
            &graph,
        );
        assert!((with - without - 0.15).abs() < 1e-9);
    }

    #[test]
    fn ranking_is_dense_and_descending() {
        let graph = DependencyGraph::default();
        let anomalies = vec![anomaly(0.9, 5.0)];
        let hypotheses = vec![
            LlmHypothesis {
                description: "weak".to_string(),
                category: "network_issue".to_string(),
                evidence: vec![],
                reasoning: String::new(),
            },
            LlmHypothesis {
                description: "strong".to_string(),
                category: "error_spike".to_string(),
                evidence: vec![evidence("metric", 0.9), evidence("log", 0.9)],
                reasoning: String::new(),
            },
            LlmHypothesis {
                description: "middle".to_string(),
                category: "memory_leak".to_string(),
                evidence: vec![evidence("metric", 0.5)],
                reasoning: String::new(),
            },
        ];

        let ranked = rank_hypotheses(hypotheses, &anomalies, "api", &graph);
        assert_eq!(ranked.len(), 3);
        assert_eq!(
            ranked.iter().map(|h| h.rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        for pair in ranked.windows(2) {
            assert!(pair[0].confidence_score >= pair[1].confidence_score);
        }
        assert_eq!(ranked[0].description, "strong");
    }

    #[test]
    fn structured_response_parses_from_fenced_block() {
        let raw = r#"```json
{
  "hypotheses": [
    {
      "description": "Memory leak in worker pool",
      "category": "memory_leak",
      "evidence": [
        {"signal_type": "metric", "signal_name": "heap_used_bytes", "observation": "monotonic growth", "relevance": 0.9}
      ],
      "reasoning": "Heap growth without traffic growth."
    }
  ],
  "overall_assessment": "Likely a leak."
}
```"#;
        let json = llm_client::extract_json(raw);
        let parsed: LlmHypothesesResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.hypotheses.len(), 1);
        assert_eq!(parsed.hypotheses[0].category, "memory_leak");
    }

    #[test]
    fn prompt_contains_required_sections() {
        let anomalies = vec![anomaly(0.9, 4.5)];
        let ctx = ServiceContext {
            dependencies: vec!["database".to_string()],
            recent_deployments: Some("v2.3.1 at 10:05".to_string()),
            tier: Some("tier-1".to_string()),
            ..ServiceContext::default()
        };
        let prompt = build_prompt(&anomalies, "payment-service", Some(&ctx));
        assert!(prompt.contains("**Service:** payment-service"));
        assert!(prompt.contains("Anomaly #1"));
        assert!(prompt.contains("**Dependencies:** database"));
        assert!(prompt.contains("generate 2-5 hypotheses"));
        assert!(prompt.contains("valid JSON"));
    }
}
