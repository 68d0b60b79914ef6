//! Configuration types and loading.
//!
//! Provides all configuration structures for crew-pilot:
//! - `CrewConfig`: Top-level configuration with validation
//! - Section configs: git, sync, gc, issues, integration
//! - `ProjectPaths`: resolved on-disk layout under `.crew/`

mod settings;

pub use settings::{
    CrewConfig, GcConfig, GitConfig, IntegrationConfig, IssuesConfig, ProjectPaths, SyncConfig,
    MIN_SYNC_INTERVAL_SECS,
};
