//! Stage context assembly.
//!
//! Every stage gets exactly one view built from the same three sources (the
//! entity registry, conversation history, and the reasoning trace), each
//! cut to what that stage needs:
//!
//! | Stage | Entities | History | Reasoning |
//! |-------|----------|---------|-----------|
//! | Understand | everything, all tiers, with payloads | recent + summary + pending | own curation history |
//! | Plan | active refs and labels | recent + summary + pending | last turn's steps and curation |
//! | Execute | active + generated, with payloads | recent turns only | this turn's steps |
//! | Reply | active labels only | recent + summary | step outcomes and phase |

pub mod builders;
pub mod token;

pub use builders::{ContextBuilder, ContextSection, StageContext};
