//! Automated reasoning policy metadata and finding selection.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::PolicyDefinition;
use crate::error::ServiceResult;
use crate::models::{ArPolicy, Finding, ValidationOutput};
use crate::retry::{retry_api_call, RetryPolicy};

/// Backend that knows which automated reasoning policies exist.
#[async_trait]
pub trait PolicyClient: Send + Sync {
    async fn list_policies(&self) -> ServiceResult<Vec<ArPolicy>>;
}

pub struct PolicyService {
    client: Arc<dyn PolicyClient>,
    retry: RetryPolicy,
}

impl PolicyService {
    pub fn new(client: Arc<dyn PolicyClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub async fn list_policies(&self) -> ServiceResult<Vec<ArPolicy>> {
        retry_api_call("list_policies", self.retry, || self.client.list_policies()).await
    }
}

/// Whether a finding of this kind may trigger a clarification exchange.
///
/// Only findings where user input can actually change the verdict qualify.
/// For ambiguity the user picks an interpretation; for a satisfiable claim
/// the user supplies the missing premise.
pub fn questions_allowed(output: ValidationOutput) -> bool {
    matches!(
        output,
        ValidationOutput::TranslationAmbiguous | ValidationOutput::Satisfiable
    )
}

/// Index of the next finding a rewrite round should target.
///
/// Findings are assumed sorted by severity. Already-processed indices are
/// skipped so one finding can never monopolize the loop, and VALID or
/// NO_TRANSLATIONS findings are never targets.
pub fn next_unprocessed_finding(
    findings: &[Finding],
    processed: &HashSet<usize>,
) -> Option<usize> {
    findings.iter().enumerate().position(|(idx, finding)| {
        !processed.contains(&idx)
            && !matches!(
                finding.validation_output,
                ValidationOutput::Valid | ValidationOutput::NoTranslations
            )
    })
}

/// Detail keys under which findings reference policy rules. INVALID and
/// IMPOSSIBLE findings carry contradicting rules, VALID findings supporting
/// ones.
const RULE_LIST_KEYS: &[&str] = &["contradictingRules", "supportingRules"];

/// Replace rule identifiers in finding details with the readable rule logic
/// from the configured policy, so rewrite prompts show the model what the
/// rule actually says instead of an opaque ID.
pub fn enrich_findings(findings: &mut [Finding], definition: &PolicyDefinition) {
    if definition.rules.is_empty() {
        return;
    }
    for finding in findings {
        for key in RULE_LIST_KEYS {
            let Some(Value::Array(rules)) = finding.details.get_mut(*key) else {
                continue;
            };
            for rule_ref in rules.iter_mut() {
                let id = match rule_ref {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(obj) => obj
                        .get("identifier")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    _ => None,
                };
                let Some(rule) = id.as_deref().and_then(|id| definition.rule(id)) else {
                    continue;
                };
                *rule_ref = json!({
                    "identifier": rule.id,
                    "expression": rule.expression,
                    "alternate_expression": rule.alternate_expression,
                    "description": rule.description,
                });
            }
        }
    }
}

/// Render the configured policy's rules and variables as prompt context.
///
/// Returns `None` when the definition has nothing worth rendering, so the
/// initial generation can fall back to the bare user prompt.
pub fn format_policy_context(definition: &PolicyDefinition) -> Option<String> {
    let rule_lines: Vec<String> = definition
        .rules
        .iter()
        .map(|rule| {
            let text = rule.alternate_expression.as_deref().unwrap_or(&rule.expression);
            format!("- {}: {}", rule.id, text)
        })
        .collect();
    let variable_lines: Vec<String> = definition
        .variables
        .iter()
        .filter_map(|variable| {
            let description = variable.description.as_deref()?;
            Some(format!("- {}: {}", variable.name, description))
        })
        .collect();

    if rule_lines.is_empty() && variable_lines.is_empty() {
        return None;
    }

    let mut sections = vec!["## Policy Context".to_string()];
    if !rule_lines.is_empty() {
        sections.push("\n### Rules".to_string());
        sections.extend(rule_lines);
    }
    if !variable_lines.is_empty() {
        sections.push("\n### Variables".to_string());
        sections.extend(variable_lines);
    }
    Some(sections.join("\n"))
}
