//! Model access and rewrite prompt construction.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::PolicyDefinition;
use crate::error::ServiceResult;
use crate::models::{ChatMessage, Finding, QuestionAnswerExchange, ValidationOutput};
use crate::retry::{retry_api_call, RetryPolicy};
use crate::services::parser::{parse_response, ParsedDecision, MAX_QUESTIONS};
use crate::services::policy::format_policy_context;

/// Conversational model backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn converse(&self, model_id: &str, messages: &[ChatMessage]) -> ServiceResult<String>;
}

/// Everything a rewrite prompt is built from.
pub struct RewritePromptInput<'a> {
    pub user_prompt: &'a str,
    pub current_answer: &'a str,
    /// Sorted findings from the latest validation call.
    pub findings: &'a [Finding],
    /// Which finding this round must fix.
    pub target_index: usize,
    pub clarifications: &'a [QuestionAnswerExchange],
    /// Whether the model may answer with ASK_QUESTIONS this round.
    pub allow_questions: bool,
}

pub struct LlmService {
    client: Arc<dyn ModelClient>,
    /// Rendered once at construction from the configured policy and
    /// prepended to every initial generation.
    policy_context: Option<String>,
    retry: RetryPolicy,
}

impl LlmService {
    pub fn new(
        client: Arc<dyn ModelClient>,
        policy_definition: &PolicyDefinition,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            policy_context: format_policy_context(policy_definition),
            retry,
        }
    }

    /// First answer to the user's prompt, before any validation feedback.
    /// When a policy is configured the model sees its rules and variables
    /// up front instead of discovering them through findings.
    pub async fn generate_initial(&self, model_id: &str, user_prompt: &str) -> ServiceResult<String> {
        let prompt = match &self.policy_context {
            Some(context) => format!(
                "Answer the question below. Your answer must comply with the \
                 following policy.\n\n{context}\n\n## Question\n{user_prompt}"
            ),
            None => user_prompt.to_string(),
        };
        let messages = [ChatMessage::user(prompt)];
        retry_api_call("converse", self.retry, || {
            self.client.converse(model_id, &messages)
        })
        .await
    }

    /// Send a rewrite prompt and parse the structured decision out of the
    /// response.
    pub async fn request_rewrite(
        &self,
        model_id: &str,
        prompt: &str,
    ) -> ServiceResult<ParsedDecision> {
        let messages = [ChatMessage::user(prompt)];
        let raw = retry_api_call("converse", self.retry, || {
            self.client.converse(model_id, &messages)
        })
        .await?;
        let decision = parse_response(&raw);
        debug!(model_id, decision = ?decision_name(&decision), "rewrite decision parsed");
        Ok(decision)
    }
}

fn decision_name(decision: &ParsedDecision) -> &'static str {
    match decision {
        ParsedDecision::Rewrite { .. } => "REWRITE",
        ParsedDecision::AskQuestions { .. } => "ASK_QUESTIONS",
        ParsedDecision::Impossible { .. } => "IMPOSSIBLE",
    }
}

/// Build the rewrite prompt for one feedback round.
///
/// All findings are shown for context but exactly one is marked as the
/// target. Every answered clarification so far is folded in, so knowledge
/// gained in earlier rounds is never lost to later rewrites.
pub fn build_rewrite_prompt(input: &RewritePromptInput<'_>) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "An automated reasoning policy checked the answer below against formal rules \
         and found problems. Revise the answer so it complies.\n\n",
    );
    prompt.push_str(&format!("Original question:\n{}\n\n", input.user_prompt));
    prompt.push_str(&format!("Current answer:\n{}\n\n", input.current_answer));

    prompt.push_str("Validation findings:\n");
    for (idx, finding) in input.findings.iter().enumerate() {
        let marker = if idx == input.target_index {
            " <-- fix this one now"
        } else {
            ""
        };
        prompt.push_str(&format!(
            "{}. [{}]{} {}\n",
            idx + 1,
            finding.validation_output,
            marker,
            describe_finding(finding)
        ));
    }
    prompt.push('\n');

    if !input.clarifications.is_empty() {
        prompt.push_str("The user has already clarified:\n");
        for exchange in input.clarifications {
            let answers = exchange.answers.as_deref().unwrap_or(&[]);
            for (question, answer) in exchange.questions.iter().zip(answers) {
                prompt.push_str(&format!("Q: {question}\nA: {answer}\n"));
            }
        }
        prompt.push('\n');
    }

    prompt.push_str("Respond in exactly this format:\n");
    if input.allow_questions {
        prompt.push_str(&format!(
            "DECISION: REWRITE or ASK_QUESTIONS\n\
             If REWRITE, follow with:\n\
             ANSWER: <the full revised answer>\n\
             If ASK_QUESTIONS, follow with up to {MAX_QUESTIONS} lines:\n\
             QUESTION: <a question whose answer lets you fix the finding>\n\
             Only ask questions the user can actually answer; otherwise rewrite.\n"
        ));
    } else if target_is_impossible(input) {
        prompt.push_str(
            "DECISION: REWRITE or IMPOSSIBLE\n\
             If REWRITE, follow with:\n\
             ANSWER: <the full revised answer>\n\
             If the premises contradict the policy and no compliant answer exists, \
             use IMPOSSIBLE and follow with:\n\
             ANSWER: <a plain explanation of why no valid answer exists>\n",
        );
    } else {
        prompt.push_str(
            "DECISION: REWRITE\n\
             ANSWER: <the full revised answer>\n",
        );
    }
    prompt
}

fn target_is_impossible(input: &RewritePromptInput<'_>) -> bool {
    input
        .findings
        .get(input.target_index)
        .map(|f| f.validation_output == ValidationOutput::Impossible)
        .unwrap_or(false)
}

/// Human-readable summary of a finding's detail payload.
fn describe_finding(finding: &Finding) -> String {
    if finding.details.is_empty() {
        return String::new();
    }
    serde_json::to_string(&finding.details).unwrap_or_default()
}
