//! Epic-to-git mapping store.
//!
//! Persists which worktree and which branches belong to each epic, one JSON
//! file per epic under `.crew/mappings/`. Branch names stay derivable from
//! ids alone, so losing a mapping file never orphans a branch name.

mod store;

pub use store::{changeset_branch_name, MappingStore, WorktreeMapping};
