//! Structured CLI output.
//!
//! Handles the machine-readable side of the CLI:
//! - `OutputWriter`: JSON emission with a single object per invocation
//! - Typed output records for claim, branch, integrate, and status

mod writer;

pub use writer::{
    BranchOutput, ChangesetStatusOutput, ClaimOutput, EpicStatusOutput, IntegrateOutput,
    OutputWriter,
};
