//! Data models for conversation threads and validation findings.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Verdict categories produced by the automated reasoning policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationOutput {
    Valid,
    Invalid,
    Satisfiable,
    Impossible,
    TranslationAmbiguous,
    TooComplex,
    NoTranslations,
}

impl ValidationOutput {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationOutput::Valid => "VALID",
            ValidationOutput::Invalid => "INVALID",
            ValidationOutput::Satisfiable => "SATISFIABLE",
            ValidationOutput::Impossible => "IMPOSSIBLE",
            ValidationOutput::TranslationAmbiguous => "TRANSLATION_AMBIGUOUS",
            ValidationOutput::TooComplex => "TOO_COMPLEX",
            ValidationOutput::NoTranslations => "NO_TRANSLATIONS",
        }
    }
}

impl std::fmt::Display for ValidationOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One validation signal from the policy check. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub validation_output: ValidationOutput,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl Finding {
    pub fn new(validation_output: ValidationOutput) -> Self {
        Self {
            validation_output,
            details: Map::new(),
        }
    }
}

/// Aggregate result of one policy-check call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub output: ValidationOutput,
    pub findings: Vec<Finding>,
}

/// A question/answer round between the model and the user.
///
/// `answers` stays `None` with `skipped = true` when the user never responded
/// and the timeout sweeper auto-skipped the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAnswerExchange {
    pub questions: Vec<String>,
    pub answers: Option<Vec<String>>,
    #[serde(default)]
    pub skipped: bool,
}

impl QuestionAnswerExchange {
    pub fn pending(questions: Vec<String>) -> Self {
        Self {
            questions,
            answers: None,
            skipped: false,
        }
    }
}

/// The decision the model took for a given iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    /// The first generation, before any feedback.
    Initial,
    Rewrite,
    AskQuestions,
    Impossible,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Initial => "INITIAL",
            DecisionKind::Rewrite => "REWRITE",
            DecisionKind::AskQuestions => "ASK_QUESTIONS",
            DecisionKind::Impossible => "IMPOSSIBLE",
        }
    }
}

/// Data recorded for an AR-validation (rewrite) iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArIterationData {
    pub findings: Vec<Finding>,
    pub validation_output: ValidationOutput,
    /// Index of the finding this rewrite round targeted, within the sorted
    /// finding list. `None` for the initial generation.
    pub processed_finding_index: Option<usize>,
    pub llm_decision: DecisionKind,
}

/// Data recorded for a clarification iteration.
///
/// The post-clarification validation outcome is recorded on the same
/// iteration once the thread resumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationIterationData {
    pub qa_exchange: QuestionAnswerExchange,
    pub context_augmentation: Option<String>,
    pub llm_decision: Option<DecisionKind>,
    pub validation_output: Option<ValidationOutput>,
    #[serde(default)]
    pub validation_findings: Vec<Finding>,
}

/// Kind of a thread iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationType {
    ArValidation,
    UserClarification,
}

/// Type-specific payload of an iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "iteration_type", rename_all = "snake_case")]
pub enum IterationData {
    ArValidation(ArIterationData),
    UserClarification(ClarificationIterationData),
}

/// One step of a thread's processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    /// 1-based position within the thread, gap-free.
    pub iteration_number: u32,
    /// The answer this iteration started from ("" for the initial generation).
    pub original_answer: String,
    /// The answer this iteration produced ("" while awaiting user input).
    pub rewritten_answer: String,
    /// The prompt that produced `rewritten_answer`.
    pub rewriting_prompt: String,
    #[serde(flatten)]
    pub data: IterationData,
}

impl Iteration {
    pub fn iteration_type(&self) -> IterationType {
        match self.data {
            IterationData::ArValidation(_) => IterationType::ArValidation,
            IterationData::UserClarification(_) => IterationType::UserClarification,
        }
    }
}

/// Status of a conversation thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadStatus {
    Processing,
    AwaitingUserInput,
    Completed,
    Error,
}

impl ThreadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ThreadStatus::Completed | ThreadStatus::Error)
    }
}

/// One end-to-end processing of a single user prompt, spanning possibly
/// several validate/rewrite/clarify rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub user_prompt: String,
    pub model_id: String,
    pub status: ThreadStatus,
    pub final_response: Option<String>,
    pub warning_message: Option<String>,
    pub iterations: Vec<Iteration>,
    /// Counts AR-validation rounds; clarification rounds do not increment it.
    pub iteration_counter: u32,
    pub max_iterations: u32,
    /// Indices (within the sorted finding list) already targeted by a
    /// rewrite round, so the same finding is never re-selected as the focus.
    pub processed_finding_indices: HashSet<usize>,
    /// Findings from the most recent validation call. Working state, not
    /// history.
    pub current_findings: Vec<Finding>,
    /// Every answered clarification, folded into later rewrite prompts.
    pub all_clarifications: Vec<QuestionAnswerExchange>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub awaiting_input_since: Option<DateTime<Utc>>,
}

impl Thread {
    pub fn new(user_prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            thread_id: Self::generate_id(),
            user_prompt: user_prompt.into(),
            model_id: model_id.into(),
            status: ThreadStatus::Processing,
            final_response: None,
            warning_message: None,
            iterations: Vec::new(),
            iteration_counter: 0,
            max_iterations: 5,
            processed_finding_indices: HashSet::new(),
            current_findings: Vec::new(),
            all_clarifications: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            awaiting_input_since: None,
        }
    }

    /// Generate a unique thread ID.
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Reference data for an automated reasoning policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArPolicy {
    pub arn: String,
    pub name: String,
    pub description: Option<String>,
}

/// Role of a conversation message sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of the conversation history passed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}
