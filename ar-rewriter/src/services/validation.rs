//! Policy validation against a guardrail backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::PolicyDefinition;
use crate::error::{ServiceError, ServiceResult};
use crate::models::{Finding, ValidationOutput, ValidationResult};
use crate::retry::{retry_api_call, RetryPolicy};
use crate::services::policy::enrich_findings;

/// Discriminant keys on a raw finding, checked in this order. Each raw
/// finding carries exactly one of them.
const FINDING_KEYS: &[(&str, ValidationOutput)] = &[
    ("valid", ValidationOutput::Valid),
    ("invalid", ValidationOutput::Invalid),
    ("satisfiable", ValidationOutput::Satisfiable),
    ("impossible", ValidationOutput::Impossible),
    ("translationAmbiguous", ValidationOutput::TranslationAmbiguous),
    ("tooComplex", ValidationOutput::TooComplex),
    ("noTranslations", ValidationOutput::NoTranslations),
];

/// Severity order for findings. Lower sorts first and wins the overall
/// verdict. Ambiguity outranks everything because nothing downstream is
/// trustworthy until the translation is pinned down. VALID still outranks
/// NO_TRANSLATIONS: a confirmed claim beats untranslatable filler.
pub fn finding_priority(output: ValidationOutput) -> u32 {
    match output {
        ValidationOutput::TooComplex => 0,
        ValidationOutput::TranslationAmbiguous => 1,
        ValidationOutput::Impossible => 2,
        ValidationOutput::Invalid => 3,
        ValidationOutput::Satisfiable => 4,
        ValidationOutput::Valid => 6,
        ValidationOutput::NoTranslations => 99,
    }
}

/// One block of content submitted to the guardrail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailContentBlock {
    pub text: String,
    pub qualifiers: Vec<String>,
}

/// A single apply-guardrail call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailRequest {
    pub guardrail_id: String,
    pub guardrail_version: String,
    pub content: Vec<GuardrailContentBlock>,
}

/// Backend that runs content through a configured guardrail and returns
/// the raw automated reasoning findings.
#[async_trait]
pub trait GuardrailClient: Send + Sync {
    async fn apply_guardrail(&self, request: GuardrailRequest) -> ServiceResult<Vec<Value>>;
}

/// Validates question/answer pairs against an automated reasoning policy.
pub struct ValidationService {
    client: Arc<dyn GuardrailClient>,
    guardrail_id: String,
    guardrail_version: String,
    policy_definition: PolicyDefinition,
    retry: RetryPolicy,
}

impl ValidationService {
    pub fn new(
        client: Arc<dyn GuardrailClient>,
        guardrail_id: impl Into<String>,
        guardrail_version: impl Into<String>,
        policy_definition: PolicyDefinition,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            guardrail_id: guardrail_id.into(),
            guardrail_version: guardrail_version.into(),
            policy_definition,
            retry,
        }
    }

    /// Validate an answer in the context of the user's question.
    ///
    /// Findings come back sorted by severity; the overall output is the
    /// most severe one. An empty finding list means the policy raised no
    /// objection, which is VALID.
    pub async fn validate(&self, user_prompt: &str, answer: &str) -> ServiceResult<ValidationResult> {
        let request = GuardrailRequest {
            guardrail_id: self.guardrail_id.clone(),
            guardrail_version: self.guardrail_version.clone(),
            content: vec![
                GuardrailContentBlock {
                    text: user_prompt.to_string(),
                    qualifiers: vec!["query".to_string()],
                },
                GuardrailContentBlock {
                    text: answer.to_string(),
                    qualifiers: vec!["guard_content".to_string()],
                },
            ],
        };

        let raw = retry_api_call("apply_guardrail", self.retry, || {
            self.client.apply_guardrail(request.clone())
        })
        .await?;

        let mut findings = parse_findings(&raw)?;
        findings.sort_by_key(|f| finding_priority(f.validation_output));
        enrich_findings(&mut findings, &self.policy_definition);

        let output = findings
            .first()
            .map(|f| f.validation_output)
            .unwrap_or(ValidationOutput::Valid);

        debug!(output = %output, count = findings.len(), "validation complete");
        Ok(ValidationResult { output, findings })
    }
}

/// Decode raw guardrail findings into typed [`Finding`]s.
///
/// A finding with no recognized discriminant key is an error rather than
/// a silent skip; a verdict must never be invented from partial data.
fn parse_findings(raw: &[Value]) -> ServiceResult<Vec<Finding>> {
    raw.iter()
        .map(|value| {
            let obj = value.as_object().ok_or_else(|| {
                ServiceError::MalformedResponse(format!("finding is not an object: {value}"))
            })?;
            let (key, output) = FINDING_KEYS
                .iter()
                .find(|(key, _)| obj.contains_key(*key))
                .ok_or_else(|| {
                    ServiceError::MalformedResponse(format!(
                        "finding has no recognized discriminant: {value}"
                    ))
                })?;
            let details = match obj.get(*key) {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            Ok(Finding {
                validation_output: *output,
                details,
            })
        })
        .collect()
}
