//! Reasoning Layer — language-model-assisted root cause analysis
//!
//! The language model is a reasoning assistant, never a controller: it
//! proposes hypotheses with evidence and chain-of-thought reasoning, and a
//! deterministic formula scores confidence downstream. Model responses are
//! cache-fronted and retried with exponential backoff.

pub mod hypothesis;
pub mod llm_client;

pub use hypothesis::{
    HypothesesResponse, HypothesisGenerator, RankedHypothesis, calculate_confidence,
};
pub use llm_client::{HttpLlmClient, LlmClient, LlmError, LlmRequest, LlmResponse};
