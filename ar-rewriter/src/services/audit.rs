//! Append-only JSONL audit trail of thread outcomes.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};
use crate::models::{DecisionKind, Finding, IterationData, QuestionAnswerExchange, Thread};

/// How a thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    /// The loop converged on a policy-valid answer.
    ValidResponse,
    /// The iteration cap was hit before convergence.
    MaxIterationsReached,
    /// The model concluded no compliant answer exists.
    ImpossibleQuery,
    /// Processing failed.
    ProcessingError,
}

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEvent,
    pub thread_id: String,
    pub prompt: String,
    pub response: Option<String>,
    pub model_id: String,
    pub total_iterations: u32,
    /// Findings from the last validation call before the thread ended.
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// One line per rewrite round; populated when the iteration budget ran
    /// out so the unconverged trail is reviewable without the full thread.
    #[serde(default)]
    pub iteration_summaries: Vec<String>,
    /// The complete last finding, kept alongside the summaries for
    /// postmortem on MAX_ITERATIONS_REACHED records.
    #[serde(default)]
    pub last_finding: Option<Finding>,
    pub qa_exchanges: Vec<QuestionAnswerExchange>,
    pub warning_message: Option<String>,
}

/// Writes one JSON object per line to the configured file. Writes are
/// serialized through a mutex so concurrent thread completions never
/// interleave within a line.
pub struct AuditLogger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Record how a thread ended.
    pub fn log_completion(&self, thread: &Thread, event: AuditEvent) -> ServiceResult<()> {
        let (iteration_summaries, last_finding) = if event == AuditEvent::MaxIterationsReached {
            (
                summarize_iterations(thread),
                thread.current_findings.last().cloned(),
            )
        } else {
            (Vec::new(), None)
        };
        let record = AuditRecord {
            timestamp: Utc::now(),
            event_type: event,
            thread_id: thread.thread_id.clone(),
            prompt: thread.user_prompt.clone(),
            response: thread.final_response.clone(),
            model_id: thread.model_id.clone(),
            total_iterations: thread.iteration_counter,
            findings: thread.current_findings.clone(),
            iteration_summaries,
            last_finding,
            qa_exchanges: thread.all_clarifications.clone(),
            warning_message: thread.warning_message.clone(),
        };
        self.append(&record)
    }

    fn append(&self, record: &AuditRecord) -> ServiceResult<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| ServiceError::operation("audit_serialize", e.into()))?;
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ServiceError::operation("audit_open", e.into()))?;
        writeln!(file, "{line}").map_err(|e| ServiceError::operation("audit_write", e.into()))?;
        Ok(())
    }
}

/// One short line per rewrite round of a thread, in order. The initial
/// generation and still-pending clarifications are not rounds.
fn summarize_iterations(thread: &Thread) -> Vec<String> {
    thread
        .iterations
        .iter()
        .filter_map(|iteration| match &iteration.data {
            IterationData::ArValidation(data) if data.llm_decision != DecisionKind::Initial => {
                Some(format!(
                    "Iteration {}: {} ({}) - {} finding(s)",
                    iteration.iteration_number,
                    data.validation_output,
                    data.llm_decision.as_str(),
                    data.findings.len()
                ))
            }
            IterationData::UserClarification(data) => {
                let output = data.validation_output?;
                Some(format!(
                    "Iteration {}: {} (REWRITE after clarification) - {} finding(s)",
                    iteration.iteration_number,
                    output,
                    data.validation_findings.len()
                ))
            }
            IterationData::ArValidation(_) => None,
        })
        .collect()
}
