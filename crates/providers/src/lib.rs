//! Completion service clients for Turnkeep.
//!
//! Every backend implements `turnkeep_core::Provider`. The router builds
//! them from `[providers.*]` config and hands the engine the default one.

pub mod openai_compat;
pub mod router;

pub use openai_compat::{OpenAiCompatProvider, RetryPolicy};
pub use router::{ProviderRouter, build_from_config};
