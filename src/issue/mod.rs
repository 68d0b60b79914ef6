//! Issue store client.
//!
//! The store is an external CLI returning JSON; orchestration state beyond
//! the canonical fields rides in the description metadata side-channel.

mod record;
mod store;

pub use record::{
    meta_apply, meta_get, meta_remove, meta_upsert, IssueRecord, TYPE_AGENT, TYPE_EPIC,
    TYPE_MESSAGE,
};
pub use store::{IssueCli, IssueFilter, IssueStore, IssueUpdate};
