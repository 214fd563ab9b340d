//! Bypass modes.
//!
//! A turn in a bypass mode skips the pipeline: no routing, planning or
//! datastore access, just the mode's instructions, the mode transcript so far
//! and one streamed completion. Deltas go out as `chunk` events as they
//! arrive.
//!
//! Leaving the mode produces an [`ExitHandoff`]: a summary of the exchange
//! plus what should happen to it. The summary is folded into conversation
//! history and the transcript is dropped.

use crate::client::ModelClient;
use crate::commit::TurnDraft;
use crate::error::EngineError;
use crate::parse::parse_json;
use crate::prompts;
use crate::stage::Stage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use turnkeep_config::ModeConfig;
use turnkeep_core::event::{EventBus, ProgressEvent};
use turnkeep_core::message::Message;
use turnkeep_core::session::ModeExchange;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffAction {
    Save,
    Update,
    #[default]
    #[serde(alias = "none")]
    Close,
}

/// What leaving a bypass mode hands back to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitHandoff {
    #[serde(default)]
    pub mode: String,
    pub summary: String,
    #[serde(default)]
    pub action: HandoffAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_detail: Option<String>,
}

impl ExitHandoff {
    /// The sentence folded into the history narrative.
    pub fn narrative(&self) -> String {
        let mut line = format!("In {} mode: {}", self.mode, self.summary.trim());
        if !line.ends_with('.') {
            line.push('.');
        }
        let detail = self.action_detail.as_deref().map(str::trim).unwrap_or("");
        match (self.action, detail.is_empty()) {
            (HandoffAction::Save, false) => line.push_str(&format!(" To save: {detail}.")),
            (HandoffAction::Update, false) => line.push_str(&format!(" To update: {detail}.")),
            _ => {}
        }
        line
    }

    fn fallback(mode: &str, transcript: &[ModeExchange]) -> Self {
        let summary = if transcript.is_empty() {
            "nothing was discussed".to_string()
        } else {
            format!("{} exchange(s) with the user", transcript.len())
        };
        Self {
            mode: mode.to_string(),
            summary,
            action: HandoffAction::Close,
            action_detail: None,
        }
    }
}

/// One streamed turn in `mode`. Returns the full reply.
pub async fn run_bypass(
    client: &ModelClient,
    draft: &mut TurnDraft,
    mode: &ModeConfig,
    message: &str,
    mode_init: Option<&Value>,
    bus: &EventBus,
) -> Result<String, EngineError> {
    if draft.doc().active_mode.as_deref() != Some(mode.name.as_str()) {
        info!(mode = %mode.name, "Entering bypass mode");
        draft.enter_mode(&mode.name);
    }

    let mut system = format!("{}\n{}", Stage::Bypass.header(), mode.instructions.trim());
    let summary = &draft.doc().history.history_summary;
    if !summary.is_empty() {
        system.push_str(&format!("\n\n[Earlier Conversation]\n{summary}"));
    }
    if let Some(init) = mode_init {
        system.push_str(&format!("\n\n[Mode Setup]\n{init}"));
    }

    let mut messages = vec![Message::system(system)];
    for exchange in &draft.doc().mode_transcript {
        messages.push(Message::user(exchange.user.clone()));
        messages.push(Message::assistant(exchange.assistant.clone()));
    }
    messages.push(Message::user(message));

    let request = client.request(mode.tier, messages);
    let mut rx = client.provider().stream(request).await?;
    let mut reply = String::new();
    while let Some(chunk) = rx.recv().await {
        let chunk = chunk?;
        if let Some(content) = chunk.content.filter(|c| !c.is_empty()) {
            reply.push_str(&content);
            bus.publish(ProgressEvent::Chunk { content });
        }
        if chunk.done {
            break;
        }
    }
    debug!(mode = %mode.name, chars = reply.len(), "Bypass completion finished");

    draft.push_mode_exchange(message, &reply);
    Ok(reply)
}

#[derive(Debug, Deserialize)]
struct HandoffOutput {
    summary: String,
    #[serde(default)]
    action: HandoffAction,
    #[serde(default)]
    action_detail: Option<String>,
}

/// Leave the active mode, if any, folding its handoff into history.
pub async fn exit_mode(
    client: &ModelClient,
    draft: &mut TurnDraft,
) -> Result<Option<ExitHandoff>, EngineError> {
    let Some(mode) = draft.doc().active_mode.clone() else {
        return Ok(None);
    };
    let transcript = draft.exit_mode();

    let handoff = if transcript.is_empty() {
        ExitHandoff::fallback(&mode, &transcript)
    } else {
        let rendered = transcript
            .iter()
            .map(|e| format!("User: {}\nAssistant: {}", e.user, e.assistant))
            .collect::<Vec<_>>()
            .join("\n");
        let messages = ModelClient::messages(Stage::Handoff, prompts::HANDOFF, None, rendered);
        let complexity = client.config().engine.stages.summarize;
        match client
            .structured(Stage::Handoff, complexity, messages, parse_json::<HandoffOutput>)
            .await
        {
            Ok(output) => ExitHandoff {
                mode: mode.clone(),
                summary: output.summary,
                action: output.action,
                action_detail: output.action_detail.filter(|d| !d.trim().is_empty()),
            },
            Err(EngineError::Unparseable { reason, .. }) => {
                warn!(%mode, %reason, "Handoff output unusable, closing mode");
                ExitHandoff::fallback(&mode, &transcript)
            }
            Err(e) => return Err(e),
        }
    };

    draft.append_narrative(&handoff.narrative());
    info!(%mode, action = ?handoff.action, "Left bypass mode");
    Ok(Some(handoff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedProvider;
    use std::sync::Arc;
    use turnkeep_config::AppConfig;
    use turnkeep_core::session::{SessionDocument, SessionKey};

    fn setup(provider: Arc<ScriptedProvider>) -> (ModelClient, TurnDraft, ModeConfig) {
        let config = AppConfig::default();
        let mode = config.engine.mode("freeform").cloned().unwrap();
        let client = ModelClient::new(provider, Arc::new(config));
        let draft = TurnDraft::new(SessionKey::new("u1", "s1"), SessionDocument::new());
        (client, draft, mode)
    }

    #[tokio::test]
    async fn bypass_streams_and_keeps_transcript() {
        let provider = Arc::new(
            ScriptedProvider::new().script(Stage::Bypass, ["Bread needs time.", "Try a poolish."]),
        );
        let (client, mut draft, mode) = setup(provider.clone());
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let init = serde_json::json!({"topic": "baking"});
        let reply = run_bypass(&client, &mut draft, &mode, "tell me about bread", Some(&init), &bus)
            .await
            .unwrap();
        assert_eq!(reply, "Bread needs time.");
        match rx.recv().await.unwrap().as_ref() {
            ProgressEvent::Chunk { content } => assert_eq!(content, "Bread needs time."),
            other => panic!("expected chunk, got {other:?}"),
        }

        run_bypass(&client, &mut draft, &mode, "and a starter?", None, &bus)
            .await
            .unwrap();
        assert_eq!(draft.doc().mode_transcript.len(), 2);

        // Second call carries the first exchange, and no planning happened
        let second = &provider.requests_for(Stage::Bypass)[1];
        assert_eq!(second.messages.len(), 4);
        assert!(provider.requests_for(Stage::Bypass)[0].messages[0].content.contains("baking"));
        assert!(provider.requests_for(Stage::Plan).is_empty());
    }

    #[tokio::test]
    async fn exit_folds_handoff_into_history() {
        let provider = Arc::new(ScriptedProvider::new().script(
            Stage::Handoff,
            [r#"{"summary": "Discussed sourdough starters", "action": "save", "action_detail": "a starter recipe"}"#],
        ));
        let (client, mut draft, mode) = setup(provider);
        run_bypass(&client, &mut draft, &mode, "starter?", None, &EventBus::default())
            .await
            .unwrap();

        let handoff = exit_mode(&client, &mut draft).await.unwrap().unwrap();
        assert_eq!(handoff.action, HandoffAction::Save);
        assert!(draft.doc().active_mode.is_none());
        assert!(draft.doc().mode_transcript.is_empty());
        assert_eq!(
            draft.doc().history.history_summary,
            "In freeform mode: Discussed sourdough starters. To save: a starter recipe."
        );

        // Nothing left to exit
        assert!(exit_mode(&client, &mut draft).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unusable_handoff_closes_mode() {
        let provider = Arc::new(ScriptedProvider::new().script(Stage::Handoff, ["?", "?", "?"]));
        let (client, mut draft, mode) = setup(provider);
        run_bypass(&client, &mut draft, &mode, "hi", None, &EventBus::default())
            .await
            .unwrap();
        let handoff = exit_mode(&client, &mut draft).await.unwrap().unwrap();
        assert_eq!(handoff.action, HandoffAction::Close);
        assert!(handoff.summary.contains("1 exchange"));
    }
}
