//! Model-facing pipeline stages around step execution.
//!
//! Each stage takes the context its builder produced, makes one structured
//! call (with repair retries), and degrades to a safe default when the
//! output cannot be used. Only provider and store failures propagate.

pub mod plan;
pub mod reply;
pub mod route;
pub mod summarize;
pub mod understand;
