//! LLM query generator: message analysis, registration extraction, generation of
//! storage/read statements and formatting of query results.
//!
//! Without a configured LLM every operation falls back to the deterministic
//! heuristics in [`heuristics`], and results say so through [`AnalysisSource`].

pub mod heuristics;
mod types;

pub use types::{
    ActionsNeeded, AnalysisSource, ConversationType, Entities, Intent, IntentAnalysis,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::llm::{is_retryable, LlmClient};
use crate::prompts;
use crate::registration::{RegistrationExtraction, RegistrationField, RegistrationState};
use crate::resilience::{services, FailoverManager, RetryPolicy};
use crate::storage::{validate_generated, GeneratedKind};

/// Turns farmer messages into structured analysis and SQL, with or without an LLM.
pub struct QueryGenerator {
    llm: Option<LlmClient>,
    failover: Arc<FailoverManager>,
    retry: RetryPolicy,
}

impl QueryGenerator {
    pub fn new(llm: Option<LlmClient>, failover: Arc<FailoverManager>, retry: RetryPolicy) -> Self {
        if llm.is_none() {
            warn!("No LLM configured, query generator running in heuristic mode");
        }
        Self {
            llm,
            failover,
            retry,
        }
    }

    pub fn is_llm_configured(&self) -> bool {
        self.llm.is_some()
    }

    /// One LLM completion under the openai circuit breaker with the shared retry policy.
    async fn complete(
        &self,
        llm: &LlmClient,
        label: &str,
        system: &str,
        user: &str,
        json_output: bool,
    ) -> AppResult<String> {
        let policy = self.retry;
        self.failover
            .call(services::OPENAI, || {
                policy.run_if(
                    label,
                    || llm.complete(system, user, json_output),
                    is_retryable,
                )
            })
            .await
            .map_err(AppError::from)
    }

    /// Classify a message. Never fails: a failed or malformed LLM call yields
    /// [`IntentAnalysis::fallback`].
    pub async fn analyze_message(&self, message: &str, context: &str) -> IntentAnalysis {
        let Some(llm) = &self.llm else {
            return heuristics::analyze(message);
        };

        let input = prompts::analysis_input(message, context);
        let raw = match self
            .complete(llm, "analyze_message", prompts::ANALYSIS_PROMPT, &input, true)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Message analysis failed, using fallback");
                return IntentAnalysis::fallback(e.to_string());
            }
        };

        let parsed = heuristics::parse_json_object(&raw)
            .ok_or_else(|| "analysis was not JSON".to_string())
            .and_then(|value| IntentAnalysis::from_llm_json(&value));
        match parsed {
            Ok(analysis) => {
                debug!(intent = analysis.intent.as_str(), confidence = analysis.confidence, "Message analyzed");
                analysis
            }
            Err(e) => {
                warn!(error = %e, "Malformed analysis, using fallback");
                IntentAnalysis::fallback(e)
            }
        }
    }

    /// A single INSERT/UPDATE recording what the message reports, or `None` when
    /// nothing should be stored or no valid statement could be produced.
    pub async fn generate_storage_query(
        &self,
        message: &str,
        analysis: &IntentAnalysis,
        farmer_id: i64,
    ) -> Option<String> {
        if !analysis.actions_needed.store_data {
            return None;
        }
        let llm = self.llm.as_ref()?;

        let entities = serde_json::to_string(&analysis.entities).unwrap_or_default();
        let request = format!("{}\nEntities: {}", message, entities);
        let input = prompts::query_input(farmer_id, &request);
        let raw = self
            .complete(llm, "storage_query", prompts::STORAGE_QUERY_PROMPT, &input, false)
            .await
            .map_err(|e| warn!(error = %e, "Storage query generation failed"))
            .ok()?;

        validate_generated(&raw, GeneratedKind::Write)
            .map_err(|e| warn!(error = %e, "Discarding generated storage query"))
            .ok()
    }

    /// A single SELECT answering the question, scoped to the farmer.
    pub async fn generate_read_query(
        &self,
        question: &str,
        farmer_id: i64,
        context: &str,
    ) -> Option<String> {
        let Some(llm) = &self.llm else {
            return heuristics::read_query(question, farmer_id);
        };

        let request = if context.is_empty() {
            question.to_string()
        } else {
            format!("{}\nContext:\n{}", question, context)
        };
        let input = prompts::query_input(farmer_id, &request);
        let raw = match self
            .complete(llm, "read_query", prompts::READ_QUERY_PROMPT, &input, false)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Read query generation failed, using keyword query");
                return heuristics::read_query(question, farmer_id);
            }
        };

        validate_generated(&raw, GeneratedKind::Read)
            .map_err(|e| warn!(error = %e, "Discarding generated read query"))
            .ok()
    }

    /// Answer a question from query rows. Empty rows produce a clarifying
    /// question rather than an invented answer.
    pub async fn generate_response_from_data(
        &self,
        question: &str,
        rows: &[Value],
        context: &str,
    ) -> String {
        if rows.is_empty() {
            return heuristics::clarifying_question();
        }
        let Some(llm) = &self.llm else {
            return heuristics::format_rows(rows);
        };

        let records = serde_json::to_string(rows).unwrap_or_default();
        let input = format!(
            "Question: {}\nRecords: {}\nRecent conversation:\n{}",
            question, records, context
        );
        match self
            .complete(llm, "format_response", prompts::RESPONSE_PROMPT, &input, false)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => heuristics::format_rows(rows),
            Err(e) => {
                warn!(error = %e, "Response formatting failed, listing records");
                heuristics::format_rows(rows)
            }
        }
    }

    /// General farming advice when no records are involved. `None` without an LLM.
    pub async fn advise(&self, question: &str, context: &str) -> Option<String> {
        let llm = self.llm.as_ref()?;
        let input = prompts::analysis_input(question, context);
        self.complete(llm, "advise", prompts::ADVICE_PROMPT, &input, false)
            .await
            .map_err(|e| warn!(error = %e, "Advice generation failed"))
            .ok()
            .filter(|text| !text.trim().is_empty())
    }

    /// Registration values in a message. Fields already present in
    /// `current_state` are never reported unless the message is a correction.
    pub async fn extract_registration_data(
        &self,
        message: &str,
        current_state: &RegistrationState,
    ) -> RegistrationExtraction {
        let Some(llm) = &self.llm else {
            return heuristics::extract_registration(message, current_state);
        };

        let known: Vec<&str> = RegistrationField::ALL
            .iter()
            .filter(|f| current_state.has(**f))
            .map(|f| f.as_str())
            .collect();
        let input = format!(
            "Already known: {}\nMissing: {}\nMessage: {}",
            if known.is_empty() { "none".to_string() } else { known.join(", ") },
            current_state
                .missing_fields()
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            message
        );

        let raw = match self
            .complete(
                llm,
                "extract_registration",
                prompts::REGISTRATION_EXTRACTION_PROMPT,
                &input,
                true,
            )
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Registration extraction failed, using heuristics");
                return heuristics::extract_registration(message, current_state);
            }
        };

        match heuristics::parse_json_object(&raw) {
            Some(value) => extraction_from_json(&value, current_state),
            None => {
                warn!("Malformed registration extraction, using heuristics");
                heuristics::extract_registration(message, current_state)
            }
        }
    }
}

fn extraction_from_json(value: &Value, state: &RegistrationState) -> RegistrationExtraction {
    let correction = value
        .get("correction")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut values = BTreeMap::new();
    if let Some(extracted) = value.get("extracted").and_then(Value::as_object) {
        for (key, v) in extracted {
            let (Some(field), Some(text)) = (RegistrationField::from_key(key), v.as_str()) else {
                continue;
            };
            let text = match field {
                RegistrationField::WaPhoneNumber => match heuristics::phone_like(text) {
                    Some(phone) => phone,
                    None => continue,
                },
                _ => text.to_string(),
            };
            values.insert(field, text);
        }
    }

    RegistrationExtraction::against(state, values, correction)
}
