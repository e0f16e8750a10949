//! Git worktree provisioning library
//!
//! Creates, lists, and destroys isolated working copies of a source tree,
//! each on a distinct named branch, so parallel agent workstreams cannot
//! corrupt one another's edits.

mod commands;
mod error;
mod provider;

pub use commands::{current_branch, is_git_repository};
pub use error::{Result, WorktreeError};
pub use provider::{WorktreeConfig, WorktreeInfo, WorktreeProvider};
