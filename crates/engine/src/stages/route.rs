//! Routing: intent label and subdomain scope.

use crate::client::ModelClient;
use crate::context::StageContext;
use crate::error::EngineError;
use crate::parse::parse_json;
use crate::prompts;
use crate::stage::Stage;
use serde::Deserialize;
use tracing::{debug, warn};
use turnkeep_config::EngineConfig;
use turnkeep_core::history::RoutingDecision;

#[derive(Debug, Deserialize)]
struct RouteOutput {
    #[serde(default)]
    intent: String,
    #[serde(default, alias = "subdomains")]
    scope: Vec<String>,
}

pub async fn route(
    client: &ModelClient,
    ctx: &StageContext,
    message: &str,
) -> Result<RoutingDecision, EngineError> {
    let engine = &client.config().engine;
    let messages = ModelClient::messages(Stage::Route, prompts::ROUTE, Some(ctx), message);

    let output = match client
        .structured(Stage::Route, engine.stages.route, messages, parse_json::<RouteOutput>)
        .await
    {
        Ok(output) => output,
        Err(EngineError::Unparseable { reason, .. }) => {
            warn!(%reason, "Routing output unusable, using the default subdomain");
            RouteOutput {
                intent: String::new(),
                scope: Vec::new(),
            }
        }
        Err(e) => return Err(e),
    };

    let decision = normalize(output, engine);
    debug!(intent = %decision.intent, scope = ?decision.scope, "Routed");
    Ok(decision)
}

/// Keep known subdomains only; never leave the scope empty.
fn normalize(output: RouteOutput, engine: &EngineConfig) -> RoutingDecision {
    let mut scope: Vec<String> = Vec::new();
    for name in output.scope {
        let name = name.trim().to_lowercase();
        if engine.subdomain(&name).is_some() && !scope.contains(&name) {
            scope.push(name);
        }
    }
    if scope.is_empty() {
        scope.push(engine.default_subdomain().to_string());
    }
    let intent = match output.intent.trim() {
        "" => "general".to_string(),
        intent => intent.to_string(),
    };
    RoutingDecision { intent, scope }
}
