//! Errors that end a turn before it can commit.
//!
//! Anything recoverable (unparseable model output, rejected tool arguments,
//! blocked steps) is handled inside the turn and never becomes an
//! `EngineError`.

use thiserror::Error;
use turnkeep_core::error::{ProviderError, RegistryError, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("{stage} output could not be parsed after {attempts} attempts: {reason}")]
    Unparseable {
        stage: &'static str,
        attempts: usize,
        reason: String,
    },

    #[error("Unknown mode: {0}")]
    UnknownMode(String),
}

impl EngineError {
    /// Short message suitable for a user-facing error event.
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(ProviderError::RateLimited { .. }) => {
                "The assistant is busy right now. Please try again shortly.".into()
            }
            Self::Provider(_) => "The assistant could not be reached. Please try again.".into(),
            Self::UnknownMode(mode) => format!("There is no '{mode}' mode."),
            _ => "Something went wrong while handling that message.".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_names_stage() {
        let err = EngineError::Unparseable {
            stage: "plan",
            attempts: 3,
            reason: "missing field `decision`".into(),
        };
        assert!(err.to_string().starts_with("plan output"));
    }

    #[test]
    fn user_message_hides_internals() {
        let err = EngineError::Provider(ProviderError::Network("connection reset".into()));
        assert!(!err.user_message().contains("reset"));
        assert!(EngineError::UnknownMode("chef".into()).user_message().contains("chef"));
    }
}
