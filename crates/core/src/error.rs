//! Errors raised at the seams of a turn: the completion service, the
//! session store, datastore tools and the entity registry.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether sending the same request again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) => true,
            Self::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Version conflict for session {session_id}: expected {expected}, found {found}")]
    VersionConflict {
        session_id: String,
        expected: u64,
        found: u64,
    },

    #[error("Corrupt session document {session_id}: {reason}")]
    Corrupt { session_id: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Tool execution failed on {collection}: {reason}")]
    ExecutionFailed { collection: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Unknown reference token: {0}")]
    UnknownRef(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Token {token} already bound to type '{existing}', cannot adopt it as '{requested}'")]
    TokenTypeConflict {
        token: String,
        existing: String,
        requested: String,
    },

    #[error("Token {token} already bound to a different underlying id")]
    TokenIdConflict { token: String },

    #[error("Entity ({entity_type}, {underlying_id}) already holds token {existing}")]
    IdentityConflict {
        entity_type: String,
        underlying_id: String,
        existing: String,
    },

    #[error("Malformed reference token: {0}")]
    MalformedToken(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_shows_status_and_body() {
        let err = ProviderError::ApiError {
            status_code: 502,
            message: "upstream timeout".into(),
        };
        assert!(err.to_string().contains("502"));
        assert!(err.to_string().contains("upstream timeout"));
    }

    #[test]
    fn retryable_provider_errors() {
        assert!(ProviderError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
        let unavailable = ProviderError::ApiError {
            status_code: 503,
            message: String::new(),
        };
        assert!(unavailable.is_retryable());
        let bad_request = ProviderError::ApiError {
            status_code: 400,
            message: String::new(),
        };
        assert!(!bad_request.is_retryable());
        assert!(!ProviderError::AuthenticationFailed("no".into()).is_retryable());
    }

    #[test]
    fn registry_conflict_names_both_types() {
        let err = RegistryError::TokenTypeConflict {
            token: "recipe_1".into(),
            existing: "recipe".into(),
            requested: "meal".into(),
        };
        let text = err.to_string();
        assert!(text.contains("recipe_1"));
        assert!(text.contains("meal"));
    }

    #[test]
    fn version_conflict_displays_versions() {
        let err = StoreError::VersionConflict {
            session_id: "s1".into(),
            expected: 3,
            found: 4,
        };
        assert!(err.to_string().contains("expected 3"));
    }
}
