//! Local console runner.
//!
//! Runs one prompt through the processing loop with in-process demo
//! backends, answering clarification questions from stdin. Real
//! deployments embed [`ServiceContainer`] with their own backend clients.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use ar_rewriter::models::{ArPolicy, ChatMessage, Role};
use ar_rewriter::services::llm::ModelClient;
use ar_rewriter::services::policy::PolicyClient;
use ar_rewriter::services::validation::{GuardrailClient, GuardrailRequest};
use ar_rewriter::{AppConfig, ServiceContainer, ServiceResult, ThreadStatus};

#[derive(Parser)]
#[command(name = "ar-rewriter", about = "Run a prompt through the policy rewrite loop")]
struct Args {
    /// Path to a YAML config file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<String>,

    /// The user prompt to process.
    #[arg(long)]
    prompt: String,
}

/// Demo guardrail: flags answers containing "draft" as invalid once,
/// accepts everything else.
struct DemoGuardrail;

#[async_trait]
impl GuardrailClient for DemoGuardrail {
    async fn apply_guardrail(&self, request: GuardrailRequest) -> ServiceResult<Vec<Value>> {
        let answer = request
            .content
            .iter()
            .find(|block| block.qualifiers.iter().any(|q| q == "guard_content"))
            .map(|block| block.text.as_str())
            .unwrap_or("");
        if answer.contains("draft") {
            Ok(vec![json!({"invalid": {"reason": "draft wording"}})])
        } else {
            Ok(vec![json!({"valid": {}})])
        }
    }
}

/// Demo model: produces a canned first answer, then follows rewrite
/// instructions by dropping the flagged wording.
struct DemoModel;

#[async_trait]
impl ModelClient for DemoModel {
    async fn converse(&self, _model_id: &str, messages: &[ChatMessage]) -> ServiceResult<String> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text.as_str())
            .unwrap_or("");
        if prompt.contains("Validation findings:") {
            Ok("DECISION: REWRITE\nANSWER: Here is the final wording.".to_string())
        } else {
            Ok("Here is a draft answer.".to_string())
        }
    }
}

struct DemoPolicies;

#[async_trait]
impl PolicyClient for DemoPolicies {
    async fn list_policies(&self) -> ServiceResult<Vec<ArPolicy>> {
        Ok(vec![ArPolicy {
            arn: "arn:demo:policy/local".to_string(),
            name: "local-demo".to_string(),
            description: Some("In-process demo policy".to_string()),
        }])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig {
            guardrail_id: "demo-guardrail".to_string(),
            ..AppConfig::default()
        },
    };

    let container = ServiceContainer::new(
        config,
        Arc::new(DemoGuardrail),
        Arc::new(DemoModel),
        Arc::new(DemoPolicies),
    )?;
    container.start_sweeper();

    let thread = container.submit_prompt(&args.prompt)?;
    let thread_id = thread.thread_id.clone();

    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let thread = container.get_thread(&thread_id)?;
        match thread.status {
            ThreadStatus::Processing => continue,
            ThreadStatus::AwaitingUserInput => {
                let questions = pending_questions(&thread);
                let mut answers = Vec::with_capacity(questions.len());
                for question in &questions {
                    print!("{question}\n> ");
                    std::io::stdout().flush().context("flushing stdout")?;
                    let mut line = String::new();
                    std::io::stdin()
                        .read_line(&mut line)
                        .context("reading answer")?;
                    answers.push(line.trim().to_string());
                }
                container.submit_answers(&thread_id, answers)?;
            }
            ThreadStatus::Completed | ThreadStatus::Error => {
                println!("{}", serde_json::to_string_pretty(&thread)?);
                break;
            }
        }
    }

    container.shutdown().await;
    Ok(())
}

fn pending_questions(thread: &ar_rewriter::Thread) -> Vec<String> {
    use ar_rewriter::models::IterationData;
    thread
        .iterations
        .iter()
        .rev()
        .find_map(|i| match &i.data {
            IterationData::UserClarification(data) if data.qa_exchange.answers.is_none() => {
                Some(data.qa_exchange.questions.clone())
            }
            _ => None,
        })
        .unwrap_or_default()
}
