//! Validation and rewriting loop for model answers checked against
//! automated reasoning policies.
//!
//! A submitted prompt becomes a [`models::Thread`]. The processor generates
//! an answer, validates it against a guardrail-backed policy, and keeps
//! rewriting it based on the findings until the answer is valid, the
//! iteration cap is hit, or the model needs the user to clarify something.
//! Backends are injected through the [`services::validation::GuardrailClient`],
//! [`services::llm::ModelClient`] and [`services::policy::PolicyClient`] traits.

pub mod config;
pub mod error;
pub mod models;
pub mod retry;
pub mod services;

pub use config::{AppConfig, ConfigUpdate};
pub use error::{ServiceError, ServiceResult};
pub use models::{Thread, ThreadStatus, ValidationOutput};
pub use services::container::ServiceContainer;
