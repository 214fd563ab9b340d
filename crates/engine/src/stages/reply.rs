//! Reply composition.

use crate::client::ModelClient;
use crate::context::StageContext;
use crate::error::EngineError;
use crate::parse::parse_json;
use crate::prompts;
use crate::stage::Stage;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ReplyOutput {
    #[serde(alias = "text", alias = "message")]
    reply: String,
    #[serde(default)]
    tone: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposedReply {
    pub text: String,
    pub tone: String,
}

const NEUTRAL: &str = "neutral";

/// JSON `{"reply", "tone"}` when the model gives it, the raw text otherwise.
pub fn read_reply(raw: &str) -> ComposedReply {
    if let Ok(output) = parse_json::<ReplyOutput>(raw) {
        if !output.reply.trim().is_empty() {
            let tone = output.tone.trim();
            return ComposedReply {
                text: output.reply.trim().to_string(),
                tone: if tone.is_empty() { NEUTRAL } else { tone }.to_lowercase(),
            };
        }
    }
    ComposedReply {
        text: raw.trim().to_string(),
        tone: NEUTRAL.into(),
    }
}

pub async fn reply(
    client: &ModelClient,
    ctx: &StageContext,
    message: &str,
) -> Result<ComposedReply, EngineError> {
    let engine = &client.config().engine;
    let messages = ModelClient::messages(Stage::Reply, prompts::REPLY, Some(ctx), message);
    let raw = client
        .text(Stage::Reply, engine.stages.reply, messages, None)
        .await?;
    Ok(read_reply(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_reply_carries_tone() {
        let composed = read_reply(r#"```json
{"reply": "You have rice and cod.", "tone": "Upbeat"}
```"#);
        assert_eq!(composed.text, "You have rice and cod.");
        assert_eq!(composed.tone, "upbeat");
    }

    #[test]
    fn plain_text_is_used_as_is() {
        let composed = read_reply("  Sure, cod is off the list.  ");
        assert_eq!(composed.text, "Sure, cod is off the list.");
        assert_eq!(composed.tone, "neutral");
    }
}
