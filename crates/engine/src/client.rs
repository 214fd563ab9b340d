//! Stage-aware access to the completion service.

use crate::context::StageContext;
use crate::context::token::estimate_messages_tokens;
use crate::error::EngineError;
use crate::stage::Stage;
use crate::tiers::request_for;
use std::sync::Arc;
use tracing::{debug, warn};
use turnkeep_config::AppConfig;
use turnkeep_core::error::ProviderError;
use turnkeep_core::message::Message;
use turnkeep_core::plan::Complexity;
use turnkeep_core::provider::{Provider, ProviderRequest};

#[derive(Clone)]
pub struct ModelClient {
    provider: Arc<dyn Provider>,
    config: Arc<AppConfig>,
}

impl ModelClient {
    pub fn new(provider: Arc<dyn Provider>, config: Arc<AppConfig>) -> Self {
        Self { provider, config }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// System message (stage header, instructions, context) plus one user
    /// message.
    pub fn messages(
        stage: Stage,
        instructions: &str,
        context: Option<&StageContext>,
        user: impl Into<String>,
    ) -> Vec<Message> {
        let mut system = format!("{}\n{}", stage.header(), instructions.trim());
        if let Some(ctx) = context {
            let rendered = ctx.render();
            if !rendered.is_empty() {
                system.push_str("\n\n");
                system.push_str(&rendered);
            }
        }
        vec![Message::system(system), Message::user(user)]
    }

    pub fn request(&self, complexity: Complexity, messages: Vec<Message>) -> ProviderRequest {
        request_for(&self.config, complexity, messages)
    }

    /// One completion, returned as text.
    pub async fn text(
        &self,
        stage: Stage,
        complexity: Complexity,
        messages: Vec<Message>,
        max_tokens: Option<u32>,
    ) -> Result<String, ProviderError> {
        let mut request = self.request(complexity, messages);
        if max_tokens.is_some() {
            request.max_tokens = max_tokens;
        }
        self.send(stage, complexity, request).await
    }

    async fn send(
        &self,
        stage: Stage,
        complexity: Complexity,
        request: ProviderRequest,
    ) -> Result<String, ProviderError> {
        debug!(
            stage = stage.as_str(),
            model = %request.model,
            tier = complexity.as_str(),
            json = request.json_output,
            estimated_tokens = estimate_messages_tokens(&request.messages),
            "Model call"
        );
        let response = self.provider.complete(request).await?;
        Ok(response.message.content)
    }

    /// Call until `convert` accepts the output.
    ///
    /// A rejected reply is sent back with the rejection reason, at most
    /// `max_parse_repairs` times. Nothing unparsed is ever acted on.
    pub async fn structured<T, F>(
        &self,
        stage: Stage,
        complexity: Complexity,
        mut messages: Vec<Message>,
        convert: F,
    ) -> Result<T, EngineError>
    where
        F: Fn(&str) -> Result<T, String>,
    {
        let attempts = self.config.engine.limits.max_parse_repairs + 1;
        let mut last_reason = String::new();

        for attempt in 1..=attempts {
            let mut request = self.request(complexity, messages.clone());
            request.json_output = true;
            let raw = self.send(stage, complexity, request).await?;
            match convert(&raw) {
                Ok(value) => return Ok(value),
                Err(reason) => {
                    warn!(stage = stage.as_str(), attempt, %reason, "Model output rejected");
                    messages.push(Message::assistant(raw));
                    messages.push(Message::user(format!(
                        "That reply could not be used: {reason}. Reply again with a single JSON \
                         object and nothing else."
                    )));
                    last_reason = reason;
                }
            }
        }

        Err(EngineError::Unparseable {
            stage: stage.as_str(),
            attempts,
            reason: last_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_json;
    use crate::test_helpers::ScriptedProvider;

    #[tokio::test]
    async fn structured_retries_with_feedback() {
        let provider = Arc::new(ScriptedProvider::new().script(
            Stage::Route,
            ["not json at all", r#"{"intent": "greeting", "scope": []}"#],
        ));
        let client = ModelClient::new(provider.clone(), Arc::new(AppConfig::default()));
        let messages = ModelClient::messages(Stage::Route, "Classify.", None, "hi");

        let value: serde_json::Value = client
            .structured(Stage::Route, Complexity::Low, messages, parse_json)
            .await
            .unwrap();
        assert_eq!(value["intent"], "greeting");

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.json_output));
        let retry = &requests[1].messages;
        assert!(retry.last().unwrap().content.contains("could not be used"));
    }

    #[tokio::test]
    async fn structured_gives_up_after_repairs() {
        let provider = Arc::new(
            ScriptedProvider::new().script(Stage::Route, ["nope", "still nope", "never"]),
        );
        let client = ModelClient::new(provider.clone(), Arc::new(AppConfig::default()));
        let messages = ModelClient::messages(Stage::Route, "Classify.", None, "hi");

        let err = client
            .structured(Stage::Route, Complexity::Low, messages, parse_json::<serde_json::Value>)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unparseable { attempts: 3, .. }));
        assert_eq!(provider.requests().len(), 3);
    }
}
