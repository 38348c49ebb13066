//! Dialog definitions: the multi-step flows a user can run and the
//! validation behind each step.

pub mod flows;
pub mod state;
pub mod validate;

pub use flows::{Advance, Commit, Committed, FlowContext, Notice, Start};
pub use state::{DialogSession, Draft, Flow, Prompt, Step};
