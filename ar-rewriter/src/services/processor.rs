//! The validate/rewrite/clarify processing loop.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{ServiceError, ServiceResult};
use crate::models::{
    ArIterationData, ClarificationIterationData, DecisionKind, Finding, Iteration, IterationData,
    QuestionAnswerExchange, Thread, ThreadStatus, ValidationOutput,
};
use crate::services::audit::{AuditEvent, AuditLogger};
use crate::services::llm::{build_rewrite_prompt, LlmService, RewritePromptInput};
use crate::services::parser::{detect_questions, ParsedDecision};
use crate::services::policy::{next_unprocessed_finding, questions_allowed};
use crate::services::store::ThreadStore;
use crate::services::validation::ValidationService;

const MAX_ITERATIONS_WARNING: &str =
    "Maximum rewrite iterations reached; the final answer may still violate the policy.";
const NO_TRANSLATIONS_WARNING: &str =
    "The policy could not translate this content, so the answer was not checked.";
const UNRESOLVED_FINDINGS_WARNING: &str =
    "Every finding was addressed once but the answer still does not fully satisfy the policy.";
const TOO_COMPLEX_MESSAGE: &str =
    "The content is too complex for the policy to analyze.";

/// Drives a thread from creation to a terminal status.
///
/// One processor instance is shared by all threads; per-thread state lives
/// in the [`ThreadStore`]. Each public entry point operates on a claimed
/// PROCESSING thread and ends with the thread either terminal or parked in
/// AWAITING_USER_INPUT.
pub struct ThreadProcessor {
    store: Arc<ThreadStore>,
    llm: Arc<LlmService>,
    validation: Arc<ValidationService>,
    audit: Arc<AuditLogger>,
}

impl ThreadProcessor {
    pub fn new(
        store: Arc<ThreadStore>,
        llm: Arc<LlmService>,
        validation: Arc<ValidationService>,
        audit: Arc<AuditLogger>,
    ) -> Self {
        Self {
            store,
            llm,
            validation,
            audit,
        }
    }

    /// Process a freshly created thread to completion or suspension.
    /// Failures land the thread in ERROR rather than propagating.
    pub async fn run_new(&self, thread_id: &str) {
        if let Err(err) = self.process_new(thread_id).await {
            self.fail_thread(thread_id, &err);
        }
    }

    /// Continue a thread that was just resumed from AWAITING_USER_INPUT.
    /// The thread must already be claimed via [`ThreadProcessor::prepare_resume`].
    pub async fn run_resume(&self, thread_id: &str) {
        if let Err(err) = self.process_resume(thread_id).await {
            self.fail_thread(thread_id, &err);
        }
    }

    /// Synchronous half of resumption: verify the answers fit the pending
    /// questions, then atomically claim the thread and record them.
    ///
    /// `answers = None` marks the exchange as skipped (timeout path).
    /// Nothing about the thread changes if validation fails, so callers can
    /// surface the error and let the user try again.
    pub fn prepare_resume(
        &self,
        thread_id: &str,
        answers: Option<Vec<String>>,
    ) -> ServiceResult<()> {
        let thread = self.store.get(thread_id)?;
        let pending_idx = pending_clarification_index(&thread).ok_or_else(|| {
            ServiceError::InvalidRequest(format!(
                "thread {thread_id} has no pending clarification"
            ))
        })?;

        if let Some(answers) = &answers {
            let expected = match &thread.iterations[pending_idx].data {
                IterationData::UserClarification(data) => data.qa_exchange.questions.len(),
                IterationData::ArValidation(_) => 0,
            };
            if answers.len() != expected {
                return Err(ServiceError::InvalidRequest(format!(
                    "expected {expected} answers, got {}",
                    answers.len()
                )));
            }
        }

        self.store.begin_resume(thread_id)?;
        self.store.update(thread_id, |t| {
            if let IterationData::UserClarification(data) = &mut t.iterations[pending_idx].data {
                match &answers {
                    Some(answers) => {
                        data.qa_exchange.answers = Some(answers.clone());
                        data.context_augmentation = Some(format_exchange(
                            &data.qa_exchange.questions,
                            answers,
                        ));
                        // Skipped exchanges stay out of all_clarifications;
                        // only answered ones feed later rewrite prompts.
                        t.all_clarifications.push(data.qa_exchange.clone());
                    }
                    None => {
                        data.qa_exchange.skipped = true;
                    }
                }
            }
        })?;
        Ok(())
    }

    async fn process_new(&self, thread_id: &str) -> ServiceResult<()> {
        let thread = self.store.get(thread_id)?;
        info!(thread_id, "generating initial answer");

        let answer = self
            .llm
            .generate_initial(&thread.model_id, &thread.user_prompt)
            .await?;
        let result = self.validation.validate(&thread.user_prompt, &answer).await?;

        self.store.update(thread_id, |t| {
            t.current_findings = result.findings.clone();
            let number = t.iterations.len() as u32 + 1;
            t.iterations.push(Iteration {
                iteration_number: number,
                original_answer: String::new(),
                rewritten_answer: answer.clone(),
                rewriting_prompt: t.user_prompt.clone(),
                data: IterationData::ArValidation(ArIterationData {
                    findings: result.findings.clone(),
                    validation_output: result.output,
                    processed_finding_index: None,
                    llm_decision: DecisionKind::Initial,
                }),
            });
        })?;

        // The initial answer sometimes opens with questions of its own.
        // Honor them only when the verdict is one the user can influence.
        let questions = detect_questions(&answer);
        if !questions.is_empty() && questions_allowed(result.output) {
            info!(thread_id, count = questions.len(), "initial answer asks for clarification");
            self.store.update(thread_id, |t| {
                let number = t.iterations.len() as u32 + 1;
                t.iterations.push(Iteration {
                    iteration_number: number,
                    original_answer: answer.clone(),
                    rewritten_answer: String::new(),
                    rewriting_prompt: String::new(),
                    data: IterationData::UserClarification(ClarificationIterationData {
                        qa_exchange: QuestionAnswerExchange::pending(questions.clone()),
                        context_augmentation: None,
                        llm_decision: Some(DecisionKind::AskQuestions),
                        validation_output: None,
                        validation_findings: Vec::new(),
                    }),
                });
            })?;
            self.store
                .set_status(thread_id, ThreadStatus::AwaitingUserInput)?;
            return Ok(());
        }

        self.rewrite_loop(thread_id, answer).await
    }

    async fn process_resume(&self, thread_id: &str) -> ServiceResult<()> {
        let thread = self.store.get(thread_id)?;
        let answer = latest_answer(&thread);

        let target = next_unprocessed_finding(&thread.current_findings, &thread.processed_finding_indices);
        let Some(target) = target else {
            return self.rewrite_loop(thread_id, answer).await;
        };

        // Questions are never offered on the round that consumes an
        // exchange, so a thread cannot ping-pong between asking and asking
        // again about the same finding.
        let prompt = build_rewrite_prompt(&RewritePromptInput {
            user_prompt: &thread.user_prompt,
            current_answer: &answer,
            findings: &thread.current_findings,
            target_index: target,
            clarifications: &thread.all_clarifications,
            allow_questions: false,
        });

        let decision = self.llm.request_rewrite(&thread.model_id, &prompt).await?;
        let clar_idx = last_clarification_index(&thread).ok_or_else(|| {
            ServiceError::InvalidRequest(format!(
                "thread {thread_id} resumed without a clarification iteration"
            ))
        })?;

        match decision {
            ParsedDecision::Rewrite { answer: new_answer } => {
                let result = self
                    .validation
                    .validate(&thread.user_prompt, &new_answer)
                    .await?;
                self.store.update(thread_id, |t| {
                    t.iteration_counter += 1;
                    t.processed_finding_indices.insert(target);
                    t.current_findings = result.findings.clone();
                    let iteration = &mut t.iterations[clar_idx];
                    iteration.rewritten_answer = new_answer.clone();
                    iteration.rewriting_prompt = prompt.clone();
                    if let IterationData::UserClarification(data) = &mut iteration.data {
                        data.llm_decision = Some(DecisionKind::Rewrite);
                        data.validation_output = Some(result.output);
                        data.validation_findings = result.findings.clone();
                    }
                })?;
                self.rewrite_loop(thread_id, new_answer).await
            }
            ParsedDecision::Impossible { explanation } => {
                self.store.update(thread_id, |t| {
                    t.iteration_counter += 1;
                    t.processed_finding_indices.insert(target);
                    if let IterationData::UserClarification(data) =
                        &mut t.iterations[clar_idx].data
                    {
                        data.llm_decision = Some(DecisionKind::Impossible);
                    }
                })?;
                self.complete(
                    thread_id,
                    Some(explanation),
                    None,
                    ThreadStatus::Completed,
                    AuditEvent::ImpossibleQuery,
                )
            }
            ParsedDecision::AskQuestions { .. } => {
                warn!(thread_id, "model asked questions on a resume round, keeping current answer");
                self.store.update(thread_id, |t| {
                    t.processed_finding_indices.insert(target);
                })?;
                self.rewrite_loop(thread_id, answer).await
            }
        }
    }

    /// Core loop: evaluate the latest verdict, then either finish the
    /// thread, park it for user input, or run another rewrite round.
    async fn rewrite_loop(&self, thread_id: &str, mut answer: String) -> ServiceResult<()> {
        loop {
            let thread = self.store.get(thread_id)?;
            let output = overall_output(&thread.current_findings);
            info!(
                thread_id,
                output = %output,
                iteration = thread.iteration_counter,
                "evaluating validation result"
            );

            match output {
                ValidationOutput::Valid => {
                    return self.complete(
                        thread_id,
                        Some(answer),
                        None,
                        ThreadStatus::Completed,
                        AuditEvent::ValidResponse,
                    );
                }
                ValidationOutput::NoTranslations => {
                    return self.complete(
                        thread_id,
                        Some(answer),
                        Some(NO_TRANSLATIONS_WARNING.to_string()),
                        ThreadStatus::Completed,
                        AuditEvent::ValidResponse,
                    );
                }
                ValidationOutput::TooComplex => {
                    return self.complete(
                        thread_id,
                        None,
                        Some(TOO_COMPLEX_MESSAGE.to_string()),
                        ThreadStatus::Error,
                        AuditEvent::ProcessingError,
                    );
                }
                _ => {}
            }

            if thread.iteration_counter >= thread.max_iterations {
                return self.complete(
                    thread_id,
                    Some(answer),
                    Some(MAX_ITERATIONS_WARNING.to_string()),
                    ThreadStatus::Completed,
                    AuditEvent::MaxIterationsReached,
                );
            }

            let Some(target) =
                next_unprocessed_finding(&thread.current_findings, &thread.processed_finding_indices)
            else {
                return self.complete(
                    thread_id,
                    Some(answer),
                    Some(UNRESOLVED_FINDINGS_WARNING.to_string()),
                    ThreadStatus::Completed,
                    AuditEvent::MaxIterationsReached,
                );
            };

            let allow_questions =
                questions_allowed(thread.current_findings[target].validation_output);
            let prompt = build_rewrite_prompt(&RewritePromptInput {
                user_prompt: &thread.user_prompt,
                current_answer: &answer,
                findings: &thread.current_findings,
                target_index: target,
                clarifications: &thread.all_clarifications,
                allow_questions,
            });

            let decision = self.llm.request_rewrite(&thread.model_id, &prompt).await?;
            match decision {
                ParsedDecision::Rewrite { answer: new_answer } => {
                    let result = self
                        .validation
                        .validate(&thread.user_prompt, &new_answer)
                        .await?;
                    self.store.update(thread_id, |t| {
                        t.iteration_counter += 1;
                        t.processed_finding_indices.insert(target);
                        t.current_findings = result.findings.clone();
                        let number = t.iterations.len() as u32 + 1;
                        t.iterations.push(Iteration {
                            iteration_number: number,
                            original_answer: answer.clone(),
                            rewritten_answer: new_answer.clone(),
                            rewriting_prompt: prompt.clone(),
                            data: IterationData::ArValidation(ArIterationData {
                                findings: result.findings.clone(),
                                validation_output: result.output,
                                processed_finding_index: Some(target),
                                llm_decision: DecisionKind::Rewrite,
                            }),
                        });
                    })?;
                    answer = new_answer;
                }
                ParsedDecision::AskQuestions { questions } => {
                    info!(thread_id, count = questions.len(), "awaiting user clarification");
                    self.store.update(thread_id, |t| {
                        let number = t.iterations.len() as u32 + 1;
                        t.iterations.push(Iteration {
                            iteration_number: number,
                            original_answer: answer.clone(),
                            rewritten_answer: String::new(),
                            rewriting_prompt: prompt.clone(),
                            data: IterationData::UserClarification(ClarificationIterationData {
                                qa_exchange: QuestionAnswerExchange::pending(questions.clone()),
                                context_augmentation: None,
                                llm_decision: Some(DecisionKind::AskQuestions),
                                validation_output: None,
                                validation_findings: Vec::new(),
                            }),
                        });
                    })?;
                    self.store
                        .set_status(thread_id, ThreadStatus::AwaitingUserInput)?;
                    return Ok(());
                }
                ParsedDecision::Impossible { explanation } => {
                    self.store.update(thread_id, |t| {
                        t.iteration_counter += 1;
                        t.processed_finding_indices.insert(target);
                        let number = t.iterations.len() as u32 + 1;
                        t.iterations.push(Iteration {
                            iteration_number: number,
                            original_answer: answer.clone(),
                            rewritten_answer: explanation.clone(),
                            rewriting_prompt: prompt.clone(),
                            data: IterationData::ArValidation(ArIterationData {
                                findings: t.current_findings.clone(),
                                validation_output: overall_output(&t.current_findings),
                                processed_finding_index: Some(target),
                                llm_decision: DecisionKind::Impossible,
                            }),
                        });
                    })?;
                    return self.complete(
                        thread_id,
                        Some(explanation),
                        None,
                        ThreadStatus::Completed,
                        AuditEvent::ImpossibleQuery,
                    );
                }
            }
        }
    }

    fn complete(
        &self,
        thread_id: &str,
        final_response: Option<String>,
        warning: Option<String>,
        status: ThreadStatus,
        event: AuditEvent,
    ) -> ServiceResult<()> {
        self.store.update(thread_id, |t| {
            t.final_response = final_response.clone();
            t.warning_message = warning.clone();
        })?;
        let thread = self.store.set_status(thread_id, status)?;
        info!(thread_id, status = ?status, event = ?event, "thread finished");
        if let Err(err) = self.audit.log_completion(&thread, event) {
            warn!(thread_id, error = %err, "failed to write audit record");
        }
        Ok(())
    }

    fn fail_thread(&self, thread_id: &str, err: &ServiceError) {
        error!(thread_id, error = %err, "thread processing failed");
        // The full error goes to the log above; the thread carries only the
        // failure category so collaborator error codes never reach users.
        let warning = format!("Processing failed: {}.", err.category());
        let result = self
            .store
            .update(thread_id, |t| {
                t.warning_message = Some(warning.clone());
            })
            .and_then(|_| self.store.set_status(thread_id, ThreadStatus::Error));
        match result {
            Ok(thread) => {
                if let Err(audit_err) = self
                    .audit
                    .log_completion(&thread, AuditEvent::ProcessingError)
                {
                    warn!(thread_id, error = %audit_err, "failed to write audit record");
                }
            }
            Err(store_err) => {
                error!(thread_id, error = %store_err, "failed to mark thread as errored");
            }
        }
    }
}

/// Q/A pairs rendered as extra context for later rewrite prompts. Callers
/// verify the counts match before recording the exchange.
fn format_exchange(questions: &[String], answers: &[String]) -> String {
    questions
        .iter()
        .zip(answers)
        .map(|(q, a)| format!("Q: {q}\nA: {a}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Overall verdict of a sorted finding list. No findings means the policy
/// raised no objection.
fn overall_output(findings: &[Finding]) -> ValidationOutput {
    findings
        .first()
        .map(|f| f.validation_output)
        .unwrap_or(ValidationOutput::Valid)
}

/// The most recent answer text a thread has produced.
fn latest_answer(thread: &Thread) -> String {
    thread
        .iterations
        .iter()
        .rev()
        .find(|i| !i.rewritten_answer.is_empty())
        .map(|i| i.rewritten_answer.clone())
        .unwrap_or_default()
}

/// Index of the clarification iteration still waiting for answers.
fn pending_clarification_index(thread: &Thread) -> Option<usize> {
    thread.iterations.iter().rposition(|i| match &i.data {
        IterationData::UserClarification(data) => {
            data.qa_exchange.answers.is_none() && !data.qa_exchange.skipped
        }
        IterationData::ArValidation(_) => false,
    })
}

/// Index of the most recent clarification iteration, answered or not.
fn last_clarification_index(thread: &Thread) -> Option<usize> {
    thread
        .iterations
        .iter()
        .rposition(|i| matches!(i.data, IterationData::UserClarification(_)))
}
