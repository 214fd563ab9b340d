//! Planning: act directly, propose, or ask.

use crate::client::ModelClient;
use crate::context::StageContext;
use crate::error::EngineError;
use crate::parse::parse_json;
use crate::prompts;
use crate::stage::Stage;
use tracing::{info, warn};
use turnkeep_config::AppConfig;
use turnkeep_core::plan::{PlanDecision, PlannedStep};

/// Section the replanner reads the blocked step from.
pub const BLOCKED: &str = "Blocked";

pub async fn plan(
    client: &ModelClient,
    ctx: &StageContext,
    message: &str,
) -> Result<PlanDecision, EngineError> {
    let decision = call(client, prompts::PLAN, ctx, message).await?;
    let decision = match decision {
        Some(decision) => decision,
        None => PlanDecision::Direct {
            goal: message.to_string(),
            steps: Vec::new(),
        },
    };
    info!(decision = decision.kind(), "Planned");
    Ok(decision)
}

/// Ask for replacement steps around a blocked one.
///
/// `None` when the replanner's output was unusable.
pub async fn replan(
    client: &ModelClient,
    ctx: StageContext,
    blocked: &str,
    message: &str,
) -> Result<Option<PlanDecision>, EngineError> {
    let ctx = ctx.with_section(BLOCKED, blocked);
    call(client, prompts::REPLAN, &ctx, message).await
}

async fn call(
    client: &ModelClient,
    instructions: &str,
    ctx: &StageContext,
    message: &str,
) -> Result<Option<PlanDecision>, EngineError> {
    let config = client.config();
    let messages = ModelClient::messages(Stage::Plan, instructions, Some(ctx), message);
    let convert = |raw: &str| parse_json::<PlanDecision>(raw).and_then(|d| normalize(d, config));

    match client
        .structured(Stage::Plan, config.engine.stages.plan, messages, convert)
        .await
    {
        Ok(decision) => Ok(Some(decision)),
        Err(EngineError::Unparseable { reason, .. }) => {
            warn!(%reason, "Plan output unusable");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Check a decision against the configuration and fill in defaults.
///
/// Errors are phrased for the model; they go back to it as repair feedback.
pub fn normalize(decision: PlanDecision, config: &AppConfig) -> Result<PlanDecision, String> {
    match decision {
        PlanDecision::Direct { goal, mut steps } => {
            check_steps(&mut steps, config)?;
            Ok(PlanDecision::Direct { goal, steps })
        }
        PlanDecision::Propose {
            goal,
            assumptions,
            mut steps,
        } => {
            check_steps(&mut steps, config)?;
            Ok(PlanDecision::Propose {
                goal,
                assumptions,
                steps,
            })
        }
        PlanDecision::Clarify { context, questions } => {
            let questions: Vec<String> = questions
                .into_iter()
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect();
            if questions.is_empty() && context.trim().is_empty() {
                return Err("a clarify decision needs at least one question".into());
            }
            Ok(PlanDecision::Clarify { context, questions })
        }
    }
}

fn check_steps(steps: &mut [PlannedStep], config: &AppConfig) -> Result<(), String> {
    let engine = &config.engine;
    let max = engine.limits.max_steps_per_plan;
    if steps.len() > max {
        return Err(format!("the plan has {} steps; at most {max} are allowed", steps.len()));
    }
    for (i, step) in steps.iter_mut().enumerate() {
        if step.description.trim().is_empty() {
            return Err(format!("step {} has no description", i + 1));
        }
        let subdomain = step.subdomain.trim().to_lowercase();
        step.subdomain = if subdomain.is_empty() {
            engine.default_subdomain().to_string()
        } else if engine.subdomain(&subdomain).is_some() {
            subdomain
        } else {
            let known: Vec<&str> = engine.subdomains.iter().map(|s| s.name.as_str()).collect();
            return Err(format!(
                "step {} uses unknown subdomain '{}'; choose from: {}",
                i + 1,
                step.subdomain,
                known.join(", ")
            ));
        };
        if step.complexity.is_none() {
            step.complexity = Some(engine.complexity_rules.for_step(step.step_type));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedProvider;
    use std::sync::Arc;
    use turnkeep_core::plan::{Complexity, StepType};

    fn ctx() -> StageContext {
        let doc = turnkeep_core::session::SessionDocument::new();
        let engine = turnkeep_config::EngineConfig::default();
        crate::context::ContextBuilder::new(&doc, &engine, 1)
            .for_planning(&Default::default(), &[])
    }

    #[test]
    fn normalize_fills_subdomain_and_complexity() {
        let config = AppConfig::default();
        let decision: PlanDecision = parse_json(
            r#"{"decision": "direct", "goal": "g", "steps": [{"description": "read stock", "step_type": "read"}]}"#,
        )
        .unwrap();
        let PlanDecision::Direct { steps, .. } = normalize(decision, &config).unwrap() else {
            panic!("expected direct");
        };
        assert_eq!(steps[0].subdomain, "general");
        assert_eq!(steps[0].complexity, Some(Complexity::Low));
        assert_eq!(steps[0].step_type, StepType::Read);
    }

    #[test]
    fn normalize_rejects_unknown_subdomain_and_long_plans() {
        let config = AppConfig::default();
        let unknown: PlanDecision = parse_json(
            r#"{"decision": "direct", "steps": [{"description": "x", "subdomain": "garden", "step_type": "read"}]}"#,
        )
        .unwrap();
        assert!(normalize(unknown, &config).unwrap_err().contains("general"));

        let step = r#"{"description": "x", "step_type": "read"}"#;
        let many = format!(
            r#"{{"decision": "direct", "steps": [{}]}}"#,
            vec![step; 9].join(",")
        );
        let long: PlanDecision = parse_json(&many).unwrap();
        assert!(normalize(long, &config).is_err());

        let empty_clarify = PlanDecision::Clarify {
            context: " ".into(),
            questions: vec!["".into()],
        };
        assert!(normalize(empty_clarify, &config).is_err());
    }

    #[tokio::test]
    async fn invalid_plan_is_repaired_by_model() {
        let provider = Arc::new(ScriptedProvider::new().script(
            Stage::Plan,
            [
                r#"{"decision": "direct", "steps": [{"description": "", "step_type": "read"}]}"#,
                r#"{"decision": "clarify", "questions": ["Which week?"]}"#,
            ],
        ));
        let client = ModelClient::new(provider.clone(), Arc::new(AppConfig::default()));
        let decision = plan(&client, &ctx(), "plan meals").await.unwrap();
        assert_eq!(decision.kind(), "clarify");
        let retry = &provider.requests_for(Stage::Plan)[1];
        assert!(retry.messages.last().unwrap().content.contains("no description"));
    }

    #[tokio::test]
    async fn unusable_plan_degrades_to_empty_direct() {
        let provider = Arc::new(ScriptedProvider::new().script(Stage::Plan, ["x", "y", "z"]));
        let client = ModelClient::new(provider, Arc::new(AppConfig::default()));
        let decision = plan(&client, &ctx(), "hi").await.unwrap();
        assert_eq!(
            decision,
            PlanDecision::Direct {
                goal: "hi".into(),
                steps: vec![]
            }
        );
    }

    #[tokio::test]
    async fn replan_sees_blocked_section() {
        let provider = Arc::new(ScriptedProvider::new());
        let client = ModelClient::new(provider.clone(), Arc::new(AppConfig::default()));
        replan(&client, ctx(), "Step 2 failed: connection refused", "plan meals")
            .await
            .unwrap();
        let system = &provider.requests_for(Stage::Plan)[0].messages[0].content;
        assert!(system.contains("[Blocked]\nStep 2 failed"));
        assert!(system.contains("is blocked"));
    }
}
