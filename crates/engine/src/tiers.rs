//! Complexity → execution tier.
//!
//! A pure mapping from a complexity label to model settings, all of it read
//! from configuration. Steps resolve their tier before their first action.

use turnkeep_config::AppConfig;
use turnkeep_core::message::Message;
use turnkeep_core::plan::{Complexity, PlannedStep};
use turnkeep_core::provider::ProviderRequest;

/// Complexity a step runs at: its own label, or the configured rule for its
/// step type.
pub fn step_complexity(config: &AppConfig, step: &PlannedStep) -> Complexity {
    step.complexity
        .unwrap_or_else(|| config.engine.complexity_rules.for_step(step.step_type))
}

/// Build a completion request on the tier for `complexity`.
pub fn request_for(
    config: &AppConfig,
    complexity: Complexity,
    messages: Vec<Message>,
) -> ProviderRequest {
    let tier = config.engine.tiers.for_complexity(complexity);
    let mut request = ProviderRequest::new(config.model_for(tier), messages);
    request.temperature = tier.temperature;
    request.max_tokens = Some(tier.max_tokens);
    request.reasoning_effort = tier.reasoning_effort.clone();
    request
}
