//! Git CLI operations.
//!
//! `GitRunner` wraps the `git` binary with an explicit repository path per
//! instance. Nothing in this crate talks to git in-process; every mutation
//! is an auditable CLI invocation.

mod runner;

pub use runner::GitRunner;
