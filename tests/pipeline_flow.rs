//! Pipeline Flow Tests
//!
//! Exercises perception → reasoning → decision end to end with a scripted
//! model backend. No external services: the metric series are synthetic,
//! the model is a canned responder, and the runbook registry is the
//! built-in starter set.

use aegis::decision::{ActionSelector, RunbookRegistry};
use aegis::metrics_client::series_from_values;
use aegis::perception::{AnomalyDetector, Signal, SignalCorrelator, SignalType};
use aegis::reasoning::hypothesis::{rank_hypotheses, HypothesisGenerator, LlmHypothesis};
use aegis::reasoning::llm_client::{LlmClient, LlmError, LlmRequest, LlmResponse};
use aegis::topology::DependencyGraph;
use aegis::types::{ActionType, AnomalyCategory, Evidence};
use async_trait::async_trait;
use std::sync::Arc;

/// Model backend that returns a fixed structured response, wrapped in a
/// fenced code block the way real model output arrives.
struct CannedLlm {
    body: String,
}

#[async_trait]
impl LlmClient for CannedLlm {
    async fn generate_raw(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        Ok(LlmResponse {
            content: format!("```json\n{}\n```", self.body),
            prompt_tokens: 420,
            completion_tokens: 180,
            total_tokens: 600,
            model: "canned".to_string(),
        })
    }

    fn model_id(&self) -> &str {
        "canned"
    }
}

fn spiking_series(metric: &str, service: &str) -> aegis::metrics_client::MetricSeries {
    let mut values = vec![50.0, 51.0, 49.0, 50.5, 50.0, 49.5, 50.2, 50.8, 49.2, 50.1];
    values.extend_from_slice(&[50.3, 49.7, 50.4, 49.9, 50.6, 49.4, 50.0, 50.2, 49.8, 50.1]);
    values.push(240.0);
    series_from_values(metric, &[("service", service)], &values)
}

#[test]
fn detection_feeds_correlation() {
    let detector = AnomalyDetector::new(3.0);
    let series = vec![
        spiking_series("http_errors_total", "payment-service"),
        spiking_series("request_duration_p95", "payment-service"),
    ];

    let anomalies = detector.detect_multiple(&series);
    assert_eq!(anomalies.len(), 2);
    for anomaly in &anomalies {
        assert!(anomaly.deviation_sigma > 3.0);
        assert!(anomaly.confidence > 0.5);
    }

    // Bridge detector output into the correlator alongside a log signal
    let mut signals = Signal::from_anomalies(&anomalies);
    let mut log = signals[0].clone();
    log.signal_type = SignalType::Log;
    log.name = "error_burst".to_string();
    log.anomaly_score = 0.8;
    signals.push(log);

    let candidates = SignalCorrelator::default().correlate(&signals, None);
    assert_eq!(candidates.len(), 1);
    let candidate = &candidates[0];
    assert_eq!(candidate.service, "payment-service");
    assert!(candidate.confidence >= 0.6);
    assert!(candidate.signals.len() >= 2);
}

#[tokio::test]
async fn reasoning_ranks_and_decision_selects() {
    let body = r#"{
        "hypotheses": [
            {
                "description": "Heap growth from unbounded request buffering",
                "category": "memory_leak",
                "evidence": [
                    {"signal_type": "metric", "signal_name": "heap_used_bytes", "observation": "monotonic growth over 30m", "relevance": 0.9},
                    {"signal_type": "log", "signal_name": "gc_pause_lines", "observation": "GC pauses lengthening", "relevance": 0.7}
                ],
                "reasoning": "Memory climbs while traffic is flat."
            },
            {
                "description": "Upstream congestion",
                "category": "network_issue",
                "evidence": [],
                "reasoning": "Speculative."
            }
        ],
        "overall_assessment": "Likely a leak in the worker pool."
    }"#;

    let detector = AnomalyDetector::new(3.0);
    let anomalies = detector.detect_multiple(&[spiking_series("heap_used_bytes", "api")]);
    assert!(!anomalies.is_empty());

    let generator = HypothesisGenerator::new(
        Arc::new(CannedLlm {
            body: body.to_string(),
        }),
        None,
        Arc::new(DependencyGraph::default()),
        0.3,
        2048,
        0,
    );

    let (response, llm_response) = generator.generate(&anomalies, "api", None).await.unwrap();

    assert_eq!(llm_response.total_tokens, 600);
    assert_eq!(response.hypotheses.len(), 2);
    // Evidence-backed memory_leak must outrank the evidence-free guess
    assert_eq!(response.hypotheses[0].category, AnomalyCategory::MemoryLeak);
    assert_eq!(response.hypotheses[0].rank, 1);
    assert_eq!(response.hypotheses[1].rank, 2);
    assert!(
        response.hypotheses[0].confidence_score > response.hypotheses[1].confidence_score
    );

    // Decision: starter runbook allows restart_pod for memory_leak
    let selector = ActionSelector::new(RunbookRegistry::starter(), 0.70);
    let recommendation = selector
        .select_best(&response.hypotheses, "api", None)
        .unwrap();
    assert_eq!(recommendation.action_type, ActionType::RestartPod);
    assert!(recommendation.requires_approval);
    assert_eq!(recommendation.target_service, "api");
}

#[test]
fn refusal_path_produces_no_recommendation() {
    // A runbook that allows only scale_up for memory_leak must refuse the
    // restart the category rule asks for.
    use aegis::decision::runbooks::{Runbook, RunbookAction};
    use aegis::types::RiskLevel;

    let registry = RunbookRegistry::from_runbooks(vec![Runbook {
        id: "rb-restricted".to_string(),
        symptom: "memory growth".to_string(),
        category: AnomalyCategory::MemoryLeak,
        service: Some("payment-service".to_string()),
        allowed_actions: vec![RunbookAction {
            action_type: ActionType::ScaleUp,
            approval_required: true,
            risk_level: RiskLevel::Low,
            parameters_template: serde_json::Value::Null,
            prerequisites: Vec::new(),
            max_auto_executions_per_day: None,
        }],
        diagnostic_queries: Vec::new(),
        escalation_criteria: Vec::new(),
    }]);

    let hypotheses = rank_hypotheses(
        vec![LlmHypothesis {
            description: "leak".to_string(),
            category: "memory_leak".to_string(),
            evidence: vec![Evidence {
                signal_type: "metric".to_string(),
                signal_name: "heap_used_bytes".to_string(),
                observation: "growth".to_string(),
                relevance: 0.9,
            }],
            reasoning: String::new(),
        }],
        &[],
        "payment-service",
        &DependencyGraph::default(),
    );

    let selector = ActionSelector::new(registry, 0.70);
    assert!(selector
        .select_best(&hypotheses, "payment-service", None)
        .is_none());
}

#[tokio::test]
async fn confidence_is_reproducible_across_generations() {
    let body = r#"{
        "hypotheses": [
            {
                "description": "Error spike after deploy",
                "category": "error_spike",
                "evidence": [
                    {"signal_type": "metric", "signal_name": "http_errors_total", "observation": "5xx spiking", "relevance": 0.85}
                ],
                "reasoning": "Deploy correlates with error onset."
            }
        ],
        "overall_assessment": "Deployment regression."
    }"#;

    let detector = AnomalyDetector::new(3.0);
    let anomalies = detector.detect_multiple(&[spiking_series("http_errors_total", "api")]);

    let make_generator = || {
        HypothesisGenerator::new(
            Arc::new(CannedLlm {
                body: body.to_string(),
            }),
            None,
            Arc::new(DependencyGraph::default()),
            0.3,
            2048,
            0,
        )
    };

    let (first, _) = make_generator()
        .generate(&anomalies, "api", None)
        .await
        .unwrap();
    let (second, _) = make_generator()
        .generate(&anomalies, "api", None)
        .await
        .unwrap();

    assert_eq!(
        first.hypotheses[0].confidence_score.to_bits(),
        second.hypotheses[0].confidence_score.to_bits()
    );
}
