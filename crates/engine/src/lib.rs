//! The Turnkeep turn engine.
//!
//! A pipeline turn moves through fixed stages:
//!
//! 1. **Route**: classify intent and pick the subdomain scope
//! 2. **Understand**: curate which entity refs stay in view
//! 3. **Plan**: act directly, propose, or ask clarifying questions
//! 4. **Execute**: run planned steps in order, each a bounded action loop
//! 5. **Reply**: compose the user-facing text
//! 6. **Summarize**: record the turn, compress history, commit once
//!
//! Each stage sees one purpose-built context (see [`context`]), and nothing
//! is written to the session store until the single commit at the end.
//! Bypass modes ([`bypass`]) skip the pipeline and stream raw completions.

pub mod bypass;
pub mod client;
pub mod commit;
pub mod compression;
pub mod context;
pub mod error;
pub mod escalation;
pub mod executor;
pub mod orchestrator;
pub mod parse;
pub mod prompts;
pub mod results;
pub mod stage;
pub mod stages;
pub mod tiers;

#[cfg(test)]
mod test_helpers;

pub use bypass::{ExitHandoff, HandoffAction};
pub use client::ModelClient;
pub use commit::{SessionCommitter, TurnDraft};
pub use context::{ContextBuilder, StageContext};
pub use error::EngineError;
pub use escalation::{EscalationPolicy, ReplanScope, Resolution};
pub use executor::{StepEnd, StepExecutor, StepRun};
pub use orchestrator::{TurnEngine, TurnRequest, TurnResult};
pub use results::{StepResult, StepResults};
pub use stage::Stage;
