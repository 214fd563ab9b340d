//! # Turnkeep Core
//!
//! Domain types, traits, and error definitions for the Turnkeep multi-turn
//! conversation engine. This crate has **no framework dependencies**: it
//! defines the model every other crate implements against.
//!
//! ## Layout
//!
//! - [`entity`]: the entity reference registry (stable `recipe_1`-style tokens)
//! - [`history`] and [`reasoning`]: bounded conversation and reasoning memory
//! - [`plan`] and [`action`]: planner output and the step action protocol
//! - [`session`]: the versioned session document and the `SessionStore` trait
//! - [`provider`] and [`tool`]: the completion service and datastore seams

pub mod action;
pub mod entity;
pub mod error;
pub mod event;
pub mod history;
pub mod message;
pub mod pending;
pub mod plan;
pub mod provider;
pub mod reasoning;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use action::{BlockedReason, BlockedSignal, GeneratedContent, StepAction, SuggestedNext};
pub use entity::{
    ActivityTier, CurationOutcome, EntityRef, EntityRegistry, EntityStatus, EntityView,
    SnapshotMode,
};
pub use error::{ProviderError, RegistryError, StoreError, ToolError};
pub use event::{EventBus, ProgressEvent};
pub use history::{ConversationHistory, ConversationTurn, RoutingDecision};
pub use message::{Message, Role};
pub use pending::{PendingKind, PendingState};
pub use plan::{Complexity, PlanDecision, PlannedStep, StepType};
pub use provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
pub use reasoning::{
    ConversationPhase, CurationSummary, ReasoningTrace, StepExecutionSummary, StepOutcome,
    TurnExecutionSummary,
};
pub use session::{LastReply, ModeExchange, SessionDocument, SessionKey, SessionStore};
pub use tool::{Datastore, FilterClause, FilterOp, ToolOp, ToolOutput, ToolRequest};
