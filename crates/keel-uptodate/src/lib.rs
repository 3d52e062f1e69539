//! Up-to-date checking for Keel work items.
//!
//! [`BuildSession::run`] loads a work item's history, picks the execution record whose outputs
//! overlap the current outputs the most, and asks a fixed sequence of rules whether anything
//! changed since. Only out-of-date items execute; their new state is recorded afterwards.

mod change;
mod error;
mod evaluation;
mod session;
mod summary;
mod work;

pub use change::ChangeReason;
pub use error::{Result, UpToDateError};
pub use evaluation::Evaluation;
pub use session::{BuildSession, SessionConfig, WorkOutcome};
pub use summary::{first_change, summarize, ChangeIter, ChangeSummary, DEFAULT_MAX_REASONS};
pub use work::{work_node, InputChanges, WorkGraph, WorkItem};
