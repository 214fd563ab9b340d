//! Understanding: curate which entities stay in view.
//!
//! The model sees every entity in every tier and answers with two lists.
//! The registry applies them; tokens it does not know are ignored there.

use crate::client::ModelClient;
use crate::context::StageContext;
use crate::error::EngineError;
use crate::parse::parse_json;
use crate::prompts;
use crate::stage::Stage;
use serde::Deserialize;
use tracing::warn;

const DEFAULT_REASON: &str = "still relevant";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CurationDecision {
    #[serde(default, alias = "keep")]
    pub retain: Vec<RetainEntry>,
    #[serde(default, alias = "drop", alias = "forget")]
    pub demote: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RetainEntry {
    Token(String),
    WithReason {
        #[serde(rename = "ref", alias = "ref_token", alias = "token")]
        token: String,
        #[serde(default)]
        reason: String,
    },
}

impl CurationDecision {
    /// Retained `(token, reason)` pairs, reasons defaulted.
    pub fn retained(&self) -> Vec<(String, String)> {
        self.retain
            .iter()
            .map(|entry| match entry {
                RetainEntry::Token(token) => (token.trim().to_string(), DEFAULT_REASON.into()),
                RetainEntry::WithReason { token, reason } => {
                    let reason = reason.trim();
                    let reason = if reason.is_empty() { DEFAULT_REASON } else { reason };
                    (token.trim().to_string(), reason.to_string())
                }
            })
            .collect()
    }

    pub fn demoted(&self) -> Vec<String> {
        self.demote.iter().map(|t| t.trim().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.retain.is_empty() && self.demote.is_empty()
    }
}

pub async fn understand(
    client: &ModelClient,
    ctx: &StageContext,
    message: &str,
) -> Result<CurationDecision, EngineError> {
    let engine = &client.config().engine;
    let messages = ModelClient::messages(Stage::Understand, prompts::UNDERSTAND, Some(ctx), message);
    match client
        .structured(
            Stage::Understand,
            engine.stages.understand,
            messages,
            parse_json::<CurationDecision>,
        )
        .await
    {
        Ok(decision) => Ok(decision),
        Err(EngineError::Unparseable { reason, .. }) => {
            warn!(%reason, "Curation output unusable, leaving entities as they are");
            Ok(CurationDecision::default())
        }
        Err(e) => Err(e),
    }
}
