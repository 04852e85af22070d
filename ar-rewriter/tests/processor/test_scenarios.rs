//! End-to-end scenarios for the validate/rewrite/clarify loop.

use std::sync::Arc;
use std::time::Duration;

use ar_rewriter::config::{PolicyDefinition, PolicyRule, PolicyVariable};
use ar_rewriter::models::{DecisionKind, IterationData, ValidationOutput};
use ar_rewriter::services::audit::AuditEvent;
use ar_rewriter::{AppConfig, ConfigUpdate, ServiceContainer, ServiceError, ThreadStatus};

use super::common::*;

#[tokio::test]
async fn test_valid_on_first_attempt() {
    let harness = Harness::new(
        MockModel::new(vec![Ok("The speed limit is 65 mph.".into())]),
        MockGuardrail::new(vec![Ok(vec![valid_finding()])]),
    );

    let id = harness.run_thread("What is the speed limit?", 5).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(thread.final_response.as_deref(), Some("The speed limit is 65 mph."));
    assert!(thread.warning_message.is_none());
    assert_eq!(thread.iteration_counter, 0);
    assert_eq!(thread.iterations.len(), 1);
    assert!(thread.completed_at.is_some());

    let records = harness.audit_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_type, AuditEvent::ValidResponse);
    assert_eq!(records[0].total_iterations, 0);
}

#[tokio::test]
async fn test_invalid_finding_triggers_one_rewrite() {
    let harness = Harness::new(
        MockModel::new(vec![
            Ok("You get 30 days of leave.".into()),
            Ok("DECISION: REWRITE\nANSWER: You get 20 days of leave.".into()),
        ]),
        MockGuardrail::new(vec![
            Ok(vec![invalid_finding()]),
            Ok(vec![valid_finding()]),
        ]),
    );

    let id = harness.run_thread("How much leave do I get?", 5).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(
        thread.final_response.as_deref(),
        Some("You get 20 days of leave.")
    );
    assert_eq!(thread.iteration_counter, 1);
    assert_eq!(thread.iterations.len(), 2);
    assert_eq!(thread.iterations[0].iteration_number, 1);
    assert_eq!(thread.iterations[1].iteration_number, 2);

    match &thread.iterations[1].data {
        IterationData::ArValidation(data) => {
            assert_eq!(data.llm_decision, DecisionKind::Rewrite);
            assert_eq!(data.processed_finding_index, Some(0));
            assert_eq!(data.validation_output, ValidationOutput::Valid);
        }
        other => panic!("expected an AR iteration, got {other:?}"),
    }

    // The rewrite prompt names the finding but must not offer questions
    // for an INVALID target.
    let prompts = harness.model.recorded_prompts();
    assert!(prompts[1].contains("[INVALID]"));
    assert!(!prompts[1].contains("ASK_QUESTIONS"));
}

#[tokio::test]
async fn test_iteration_cap_completes_with_warning() {
    let harness = Harness::new(
        MockModel::new(vec![
            Ok("attempt zero".into()),
            Ok("DECISION: REWRITE\nANSWER: attempt one".into()),
            Ok("DECISION: REWRITE\nANSWER: attempt two".into()),
        ]),
        MockGuardrail::repeating(vec![
            invalid_finding(),
            invalid_finding(),
            invalid_finding(),
        ]),
    );

    let id = harness.run_thread("prompt", 2).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(thread.final_response.as_deref(), Some("attempt two"));
    assert!(thread.warning_message.is_some());
    assert_eq!(thread.iteration_counter, 2);

    let records = harness.audit_records();
    assert_eq!(records[0].event_type, AuditEvent::MaxIterationsReached);
    // One short summary per rewrite round, plus the full last finding.
    assert_eq!(records[0].iteration_summaries.len(), 2);
    assert!(records[0].iteration_summaries[0].contains("INVALID"));
    assert!(records[0].last_finding.is_some());
}

#[tokio::test]
async fn test_clarification_roundtrip() {
    let harness = Harness::new(
        MockModel::new(vec![
            Ok("It depends on your state.".into()),
            Ok("DECISION: ASK_QUESTIONS\nQUESTION: Which state do you live in?".into()),
            Ok("DECISION: REWRITE\nANSWER: In California the limit is 65 mph.".into()),
        ]),
        MockGuardrail::new(vec![
            Ok(vec![satisfiable_finding()]),
            Ok(vec![valid_finding()]),
        ]),
    );

    let id = harness.run_thread("What is the speed limit?", 5).await;
    let thread = harness.store.get(&id).unwrap();
    assert_eq!(thread.status, ThreadStatus::AwaitingUserInput);
    assert!(thread.awaiting_input_since.is_some());

    harness
        .processor
        .prepare_resume(&id, Some(vec!["California".into()]))
        .unwrap();
    harness.processor.run_resume(&id).await;

    let thread = harness.store.get(&id).unwrap();
    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(
        thread.final_response.as_deref(),
        Some("In California the limit is 65 mph.")
    );
    assert_eq!(thread.iteration_counter, 1);
    assert_eq!(thread.all_clarifications.len(), 1);
    assert_eq!(
        thread.all_clarifications[0].answers.as_deref(),
        Some(&["California".to_string()][..])
    );

    // The clarification iteration carries the post-resume validation.
    match &thread.iterations[1].data {
        IterationData::UserClarification(data) => {
            assert_eq!(data.llm_decision, Some(DecisionKind::Rewrite));
            assert_eq!(data.validation_output, Some(ValidationOutput::Valid));
        }
        other => panic!("expected a clarification iteration, got {other:?}"),
    }

    // The resume prompt folds in the answer and never re-offers questions.
    let prompts = harness.model.recorded_prompts();
    assert!(prompts[2].contains("Q: Which state do you live in?"));
    assert!(prompts[2].contains("A: California"));
    assert!(!prompts[2].contains("ASK_QUESTIONS"));

    let records = harness.audit_records();
    assert_eq!(records[0].qa_exchanges.len(), 1);
}

#[tokio::test]
async fn test_questions_in_initial_answer_park_the_thread() {
    let harness = Harness::new(
        MockModel::new(vec![
            Ok("QUESTION: Do you mean calendar days or business days?".into()),
            Ok("DECISION: REWRITE\nANSWER: You get 20 business days.".into()),
        ]),
        MockGuardrail::new(vec![
            Ok(vec![satisfiable_finding()]),
            Ok(vec![valid_finding()]),
        ]),
    );

    let id = harness.run_thread("How much leave?", 5).await;
    let thread = harness.store.get(&id).unwrap();
    assert_eq!(thread.status, ThreadStatus::AwaitingUserInput);
    // Only the initial generation ran; no rewrite prompt was sent.
    assert_eq!(harness.model.call_count(), 1);

    harness
        .processor
        .prepare_resume(&id, Some(vec!["Business days".into()]))
        .unwrap();
    harness.processor.run_resume(&id).await;

    let thread = harness.store.get(&id).unwrap();
    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(
        thread.final_response.as_deref(),
        Some("You get 20 business days.")
    );
}

#[tokio::test]
async fn test_answer_count_mismatch_leaves_thread_untouched() {
    let harness = Harness::new(
        MockModel::new(vec![
            Ok("initial".into()),
            Ok("DECISION: ASK_QUESTIONS\nQUESTION: Q1?\nQUESTION: Q2?".into()),
        ]),
        MockGuardrail::new(vec![Ok(vec![satisfiable_finding()])]),
    );

    let id = harness.run_thread("prompt", 5).await;
    let result = harness.processor.prepare_resume(&id, Some(vec!["only one".into()]));
    assert!(matches!(result, Err(ServiceError::InvalidRequest(_))));

    let thread = harness.store.get(&id).unwrap();
    assert_eq!(thread.status, ThreadStatus::AwaitingUserInput);
    assert!(thread.all_clarifications.is_empty());
}

#[tokio::test]
async fn test_concurrent_resume_claims_exactly_once() {
    let harness = Harness::new(
        MockModel::new(vec![
            Ok("initial".into()),
            Ok("DECISION: ASK_QUESTIONS\nQUESTION: Q1?".into()),
        ]),
        MockGuardrail::new(vec![Ok(vec![satisfiable_finding()])]),
    );

    let id = harness.run_thread("prompt", 5).await;

    let first = harness.processor.prepare_resume(&id, Some(vec!["A".into()]));
    let second = harness.processor.prepare_resume(&id, Some(vec!["B".into()]));

    assert!(first.is_ok());
    assert!(matches!(second, Err(ServiceError::InvalidRequest(_))));

    let thread = harness.store.get(&id).unwrap();
    assert_eq!(thread.all_clarifications.len(), 1);
    assert_eq!(
        thread.all_clarifications[0].answers.as_deref(),
        Some(&["A".to_string()][..])
    );
}

#[tokio::test]
async fn test_impossible_decision_completes_with_explanation() {
    let harness = Harness::new(
        MockModel::new(vec![
            Ok("initial".into()),
            Ok("DECISION: IMPOSSIBLE\nANSWER: The requirements contradict each other.".into()),
        ]),
        MockGuardrail::new(vec![Ok(vec![impossible_finding()])]),
    );

    let id = harness.run_thread("prompt", 5).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(
        thread.final_response.as_deref(),
        Some("The requirements contradict each other.")
    );
    assert_eq!(harness.audit_records()[0].event_type, AuditEvent::ImpossibleQuery);
}

#[tokio::test]
async fn test_too_complex_fails_the_thread() {
    let harness = Harness::new(
        MockModel::new(vec![Ok("initial".into())]),
        MockGuardrail::new(vec![Ok(vec![too_complex_finding()])]),
    );

    let id = harness.run_thread("prompt", 5).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Error);
    assert!(thread.final_response.is_none());
    assert!(thread.warning_message.is_some());
    assert_eq!(harness.audit_records()[0].event_type, AuditEvent::ProcessingError);
}

#[tokio::test]
async fn test_empty_findings_complete_cleanly_as_valid() {
    let harness = Harness::new(
        MockModel::new(vec![Ok("4".into())]),
        MockGuardrail::new(vec![Ok(vec![])]),
    );

    let id = harness.run_thread("2+2?", 5).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(thread.final_response.as_deref(), Some("4"));
    assert!(thread.warning_message.is_none());

    let records = harness.audit_records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_type, AuditEvent::ValidResponse);
}

#[tokio::test]
async fn test_no_translations_completes_with_warning() {
    let harness = Harness::new(
        MockModel::new(vec![Ok("initial answer".into())]),
        MockGuardrail::new(vec![Ok(vec![no_translations_finding()])]),
    );

    let id = harness.run_thread("prompt", 5).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(thread.final_response.as_deref(), Some("initial answer"));
    assert!(thread.warning_message.is_some());
}

#[tokio::test]
async fn test_permanent_api_error_marks_thread_errored() {
    let harness = Harness::new(
        MockModel::new(vec![Err(ServiceError::api(
            "AccessDeniedException",
            "not allowed",
        ))]),
        MockGuardrail::new(vec![]),
    );

    let id = harness.run_thread("prompt", 5).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Error);
    // The raw collaborator error code stays in the logs; users see only
    // the failure category.
    let warning = thread.warning_message.as_deref().unwrap();
    assert!(!warning.contains("AccessDeniedException"));
    assert!(warning.contains("a backend service call failed"));
    assert_eq!(harness.model.call_count(), 1);
    assert_eq!(harness.guardrail.call_count(), 0);
}

#[tokio::test]
async fn test_transient_error_is_retried_transparently() {
    let harness = Harness::new(
        MockModel::new(vec![
            Err(ServiceError::api("ThrottlingException", "busy")),
            Ok("initial".into()),
        ]),
        MockGuardrail::new(vec![Ok(vec![valid_finding()])]),
    );

    let id = harness.run_thread("prompt", 5).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(harness.model.call_count(), 2);
}

#[tokio::test]
async fn test_multiple_findings_are_worked_in_severity_order() {
    let harness = Harness::new(
        MockModel::new(vec![
            Ok("initial".into()),
            Ok("DECISION: REWRITE\nANSWER: round one".into()),
            Ok("DECISION: REWRITE\nANSWER: round two".into()),
        ]),
        MockGuardrail::new(vec![
            // Unsorted on the wire; the service sorts by severity.
            Ok(vec![satisfiable_finding(), invalid_finding()]),
            Ok(vec![satisfiable_finding(), invalid_finding()]),
            Ok(vec![valid_finding()]),
        ]),
    );

    let id = harness.run_thread("prompt", 5).await;
    let thread = harness.store.get(&id).unwrap();

    assert_eq!(thread.status, ThreadStatus::Completed);
    assert_eq!(thread.iteration_counter, 2);

    // Round one targets the INVALID finding (sorted first), round two the
    // SATISFIABLE one since index 0 is already processed.
    let prompts = harness.model.recorded_prompts();
    assert!(prompts[1].contains("[INVALID] <-- fix this one now"));
    assert!(prompts[2].contains("[SATISFIABLE] <-- fix this one now"));
}

#[tokio::test]
async fn test_configured_policy_shapes_both_prompts() {
    let definition = PolicyDefinition {
        rules: vec![PolicyRule {
            id: "LEAVE-1".into(),
            expression: "leave_days <= 20".into(),
            alternate_expression: Some("Annual leave is at most 20 days".into()),
            description: Some("annual leave cap".into()),
        }],
        variables: vec![PolicyVariable {
            name: "leave_days".into(),
            var_type: Some("integer".into()),
            description: Some("days of annual leave".into()),
        }],
    };
    let harness = Harness::with_policy(
        MockModel::new(vec![
            Ok("You get 30 days.".into()),
            Ok("DECISION: REWRITE\nANSWER: You get 20 days.".into()),
        ]),
        MockGuardrail::new(vec![
            Ok(vec![invalid_finding_for("LEAVE-1")]),
            Ok(vec![valid_finding()]),
        ]),
        definition,
    );

    let id = harness.run_thread("How much leave do I get?", 5).await;
    let thread = harness.store.get(&id).unwrap();
    assert_eq!(thread.status, ThreadStatus::Completed);

    let prompts = harness.model.recorded_prompts();
    // The very first generation already sees the policy's rules and
    // variables, not just the bare question.
    assert!(prompts[0].contains("## Policy Context"));
    assert!(prompts[0].contains("LEAVE-1: Annual leave is at most 20 days"));
    assert!(prompts[0].contains("leave_days: days of annual leave"));
    assert!(prompts[0].contains("How much leave do I get?"));

    // The rewrite prompt shows the contradicted rule's logic, resolved from
    // the identifier the finding carried.
    assert!(prompts[1].contains("leave_days <= 20"));
}

fn invalid_finding_for(rule_id: &str) -> serde_json::Value {
    serde_json::json!({"invalid": {"contradictingRules": [{"identifier": rule_id}]}})
}

fn container_with(model: MockModel, max_iterations: u32) -> ServiceContainer {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        guardrail_id: "gr-test".into(),
        model_id: "test-model".into(),
        max_iterations,
        retry_base_delay_seconds: 0.001,
        audit_log_path: dir.path().join("audit.jsonl").to_string_lossy().into_owned(),
        ..AppConfig::default()
    };
    // The tempdir guard is dropped here; the audit file only needs to be
    // creatable, so leak the dir for the test's lifetime.
    std::mem::forget(dir);
    ServiceContainer::new(
        config,
        Arc::new(MockGuardrail::repeating(vec![valid_finding()])),
        Arc::new(model),
        Arc::new(MockPolicies),
    )
    .unwrap()
}

async fn wait_for_terminal(container: &ServiceContainer, thread_id: &str) -> ThreadStatus {
    for _ in 0..200 {
        let thread = container.get_thread(thread_id).unwrap();
        if thread.status.is_terminal() {
            return thread.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("thread {thread_id} never reached a terminal status");
}

#[tokio::test]
async fn test_container_rejects_empty_prompt() {
    let container = container_with(MockModel::new(vec![]), 5);
    assert!(matches!(
        container.submit_prompt("   "),
        Err(ServiceError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn test_container_processes_submitted_prompt() {
    let container = container_with(MockModel::new(vec![Ok("fine answer".into())]), 5);
    let thread = container.submit_prompt("a question").unwrap();
    assert_eq!(thread.status, ThreadStatus::Processing);

    let status = wait_for_terminal(&container, &thread.thread_id).await;
    assert_eq!(status, ThreadStatus::Completed);

    let listed = container.list_threads();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].thread_id, thread.thread_id);
}

#[tokio::test]
async fn test_container_config_update() {
    let container = container_with(MockModel::new(vec![]), 5);

    let updated = container
        .update_config(ConfigUpdate {
            max_iterations: Some(7),
            ..ConfigUpdate::default()
        })
        .unwrap();
    assert_eq!(updated.max_iterations, 7);

    let rejected = container.update_config(ConfigUpdate {
        max_iterations: Some(0),
        ..ConfigUpdate::default()
    });
    assert!(rejected.is_err());
    assert_eq!(container.get_config().max_iterations, 7);
}

#[tokio::test]
async fn test_container_lists_policies() {
    let container = container_with(MockModel::new(vec![]), 5);
    let policies = container.list_policies().await.unwrap();
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].name, "test-policy");
}
