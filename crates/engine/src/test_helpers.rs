//! Shared test helpers for engine tests.

use crate::stage::Stage;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use turnkeep_core::error::ProviderError;
use turnkeep_core::message::Message;
use turnkeep_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};

/// A mock provider with one reply queue per stage.
///
/// The stage is read from the system prompt header. When a stage's queue is
/// empty the provider answers with a neutral default for that stage, so a
/// test only scripts the stages it cares about.
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<Stage, VecDeque<String>>>,
    failing: Mutex<Vec<Stage>>,
    exhaustible: Mutex<Vec<Stage>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            failing: Mutex::new(Vec::new()),
            exhaustible: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn script<I, S>(self, stage: Stage, replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scripts
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .extend(replies.into_iter().map(Into::into));
        self
    }

    /// Make every call for `stage` fail with a network error.
    pub fn failing(self, stage: Stage) -> Self {
        self.failing.lock().unwrap().push(stage);
        self
    }

    /// Make calls for `stage` fail once its script has run out, instead of
    /// falling back to the default reply.
    pub fn failing_after_script(self, stage: Stage) -> Self {
        self.exhaustible.lock().unwrap().push(stage);
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, stage: Stage) -> Vec<ProviderRequest> {
        self.requests()
            .into_iter()
            .filter(|r| stage_of(r) == Some(stage))
            .collect()
    }

    fn default_reply(stage: Stage) -> &'static str {
        match stage {
            Stage::Route => r#"{"intent": "general", "scope": ["general"]}"#,
            Stage::Understand => r#"{"retain": [], "demote": []}"#,
            Stage::Plan => r#"{"decision": "direct", "goal": "", "steps": []}"#,
            Stage::Execute => r#"{"action": "step_complete", "note": "done"}"#,
            Stage::Reply => "Done.",
            Stage::Summarize => "An earlier exchange was folded away.",
            Stage::Bypass => "Happy to chat.",
            Stage::Handoff => r#"{"summary": "Chatted freely.", "action": "close"}"#,
        }
    }
}

pub fn stage_of(request: &ProviderRequest) -> Option<Stage> {
    request
        .messages
        .first()
        .and_then(|m| Stage::from_header(&m.content))
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let stage = stage_of(&request);
        self.requests.lock().unwrap().push(request);

        let Some(stage) = stage else {
            return Err(ProviderError::ApiError {
                status_code: 400,
                message: "request without a stage header".into(),
            });
        };
        if self.failing.lock().unwrap().contains(&stage) {
            return Err(ProviderError::Network("scripted failure".into()));
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&stage)
            .and_then(VecDeque::pop_front);
        let reply = match scripted {
            Some(reply) => reply,
            None if self.exhaustible.lock().unwrap().contains(&stage) => {
                return Err(ProviderError::Network("script exhausted".into()));
            }
            None => Self::default_reply(stage).to_string(),
        };

        Ok(ProviderResponse {
            message: Message::assistant(reply),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: "mock-model".into(),
        })
    }
}
