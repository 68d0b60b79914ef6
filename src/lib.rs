pub mod cli;
pub mod config;
pub mod error;
pub mod gc;
pub mod git;
pub mod integrate;
pub mod issue;
pub mod lifecycle;
pub mod mapping;
pub mod output;
pub mod process;
pub mod sync;

pub use config::{CrewConfig, ProjectPaths};
pub use error::{CrewError, Result};
pub use gc::{GcAction, GcEngine, GcReport};
pub use git::GitRunner;
pub use integrate::{HistoryMode, IntegrationEngine, IntegrationOutcome, IntegrationSignal};
pub use issue::{IssueCli, IssueRecord, IssueStore};
pub use lifecycle::{Lifecycle, PrState, WorkStatus};
pub use mapping::{MappingStore, WorktreeMapping};
pub use sync::{PlannerSyncService, SyncCore, SyncOutcome};
