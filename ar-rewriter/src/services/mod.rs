//! Service layer: storage, backend clients, and the processing loop.

pub mod audit;
pub mod container;
pub mod llm;
pub mod parser;
pub mod policy;
pub mod processor;
pub mod store;
pub mod timeout;
pub mod validation;
