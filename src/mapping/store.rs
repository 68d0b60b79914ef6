use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::config::GitConfig;
use crate::error::{CrewError, Result};

/// One epic's git footprint: its worktree, its root branch, and the branches
/// and worktrees of its changesets. One JSON file per epic.
///
/// Paths are stored relative to the repository root so the file survives
/// clones at different locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeMapping {
    pub epic_id: String,
    pub worktree_path: String,
    pub root_branch: String,
    #[serde(default)]
    pub changesets: BTreeMap<String, String>,
    #[serde(default)]
    pub changeset_worktrees: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorktreeMapping {
    /// Every branch this mapping accounts for: the root branch plus all
    /// recorded changeset branches.
    pub fn all_branches(&self) -> Vec<String> {
        let mut branches = vec![self.root_branch.clone()];
        branches.extend(self.changesets.values().cloned());
        branches
    }
}

/// Derive a changeset's branch from ids alone. When the changeset id is
/// `<epic_id>.<suffix>` the branch is `<root_branch>-<suffix>`, otherwise
/// `<root_branch>-<changeset_id>`. Deterministic, so a lost mapping file
/// never loses the branch.
pub fn changeset_branch_name(root_branch: &str, epic_id: &str, changeset_id: &str) -> String {
    let qualified = format!("{}.", epic_id);
    match changeset_id.strip_prefix(&qualified) {
        Some(suffix) if !suffix.is_empty() => format!("{}-{}", root_branch, suffix),
        _ => format!("{}-{}", root_branch, changeset_id),
    }
}

fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(CrewError::Validation(format!("{} id must not be empty", kind)));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") {
        return Err(CrewError::Validation(format!(
            "{} id {:?} must not contain path separators",
            kind, id
        )));
    }
    Ok(())
}

pub struct MappingStore {
    mappings_dir: PathBuf,
    git: GitConfig,
}

impl MappingStore {
    pub fn new(mappings_dir: impl Into<PathBuf>, git: GitConfig) -> Self {
        Self {
            mappings_dir: mappings_dir.into(),
            git,
        }
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.mappings_dir).await?;
        self.recover_interrupted_writes().await;
        Ok(())
    }

    fn mapping_path(&self, epic_id: &str) -> PathBuf {
        self.mappings_dir.join(format!("{}.json", epic_id))
    }

    /// Default root branch for an epic with no explicit one.
    pub fn default_root_branch(&self, epic_id: &str) -> String {
        format!("{}/{}", self.git.branch_prefix, epic_id)
    }

    fn default_worktree_path(&self, id: &str) -> String {
        format!("{}/{}", self.git.worktrees_dir, id)
    }

    /// Idempotently create or return the epic's mapping, with the default
    /// worktree path and root branch.
    pub async fn ensure_mapping(&self, epic_id: &str) -> Result<WorktreeMapping> {
        let root = self.default_root_branch(epic_id);
        self.ensure_mapping_with_root(epic_id, &root).await
    }

    /// Like [`ensure_mapping`](Self::ensure_mapping) with an explicit root
    /// branch. An existing mapping is returned unmodified; its recorded root
    /// branch is never rewritten.
    pub async fn ensure_mapping_with_root(
        &self,
        epic_id: &str,
        root_branch: &str,
    ) -> Result<WorktreeMapping> {
        validate_id("epic", epic_id)?;
        if root_branch.trim().is_empty() {
            return Err(CrewError::Validation("root branch must not be empty".into()));
        }

        if let Some(existing) = self.load(epic_id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let mapping = WorktreeMapping {
            epic_id: epic_id.to_string(),
            worktree_path: self.default_worktree_path(epic_id),
            root_branch: root_branch.to_string(),
            changesets: BTreeMap::new(),
            changeset_worktrees: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        };
        self.save(&mapping).await?;
        debug!(epic = %epic_id, root = %root_branch, "Created worktree mapping");
        Ok(mapping)
    }

    /// Idempotently derive and record a changeset's branch.
    pub async fn ensure_changeset_branch(
        &self,
        epic_id: &str,
        changeset_id: &str,
    ) -> Result<(String, WorktreeMapping)> {
        validate_id("changeset", changeset_id)?;
        let mut mapping = self.ensure_mapping(epic_id).await?;

        if let Some(branch) = mapping.changesets.get(changeset_id) {
            return Ok((branch.clone(), mapping));
        }

        let branch = changeset_branch_name(&mapping.root_branch, epic_id, changeset_id);
        mapping
            .changesets
            .insert(changeset_id.to_string(), branch.clone());
        mapping.updated_at = Utc::now();
        self.save(&mapping).await?;
        Ok((branch, mapping))
    }

    /// Idempotently record a changeset's worktree path.
    pub async fn ensure_changeset_worktree(
        &self,
        epic_id: &str,
        changeset_id: &str,
    ) -> Result<(String, WorktreeMapping)> {
        validate_id("changeset", changeset_id)?;
        let mut mapping = self.ensure_mapping(epic_id).await?;

        if let Some(path) = mapping.changeset_worktrees.get(changeset_id) {
            return Ok((path.clone(), mapping));
        }

        let path = self.default_worktree_path(changeset_id);
        mapping
            .changeset_worktrees
            .insert(changeset_id.to_string(), path.clone());
        mapping.updated_at = Utc::now();
        self.save(&mapping).await?;
        Ok((path, mapping))
    }

    pub async fn load(&self, epic_id: &str) -> Result<Option<WorktreeMapping>> {
        validate_id("epic", epic_id)?;
        let path = self.mapping_path(epic_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        let mapping =
            serde_json::from_str(&content).map_err(|e| CrewError::MappingCorrupt {
                path: path.clone(),
                message: e.to_string(),
            })?;
        Ok(Some(mapping))
    }

    /// All parseable mappings. Corrupt files are logged and skipped so one
    /// bad file cannot take down a reconciliation sweep.
    pub async fn list(&self) -> Result<Vec<WorktreeMapping>> {
        let mut mappings = Vec::new();

        if !self.mappings_dir.exists() {
            return Ok(mappings);
        }

        let mut entries = fs::read_dir(&self.mappings_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let content = fs::read_to_string(&path).await?;
                match serde_json::from_str::<WorktreeMapping>(&content) {
                    Ok(mapping) => mappings.push(mapping),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping corrupt mapping file")
                    }
                }
            }
        }

        mappings.sort_by(|a, b| a.epic_id.cmp(&b.epic_id));
        Ok(mappings)
    }

    pub async fn save(&self, mapping: &WorktreeMapping) -> Result<()> {
        let path = self.mapping_path(&mapping.epic_id);
        let content = serde_json::to_string_pretty(mapping)?;
        self.write_atomic(&path, &content).await
    }

    pub async fn remove(&self, epic_id: &str) -> Result<()> {
        let path = self.mapping_path(epic_id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");

        fs::write(&tmp_path, content).await?;

        let tmp_path_clone = tmp_path.clone();
        let sync_result = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&tmp_path_clone).and_then(|file| file.sync_all())
        })
        .await;
        match sync_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to sync temp file to disk"),
            Err(e) => warn!(error = %e, "Failed to sync temp file to disk"),
        }

        fs::rename(&tmp_path, path).await?;

        debug!(path = %path.display(), "Atomic write completed");
        Ok(())
    }

    async fn recover_interrupted_writes(&self) {
        if let Ok(mut entries) = fs::read_dir(&self.mappings_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing interrupted write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_changeset_uses_suffix() {
        assert_eq!(
            changeset_branch_name("feat/e1", "E1", "E1.1"),
            "feat/e1-1"
        );
        assert_eq!(
            changeset_branch_name("feat/e1", "E1", "E1.api-v2"),
            "feat/e1-api-v2"
        );
    }

    #[test]
    fn unqualified_changeset_uses_full_id() {
        assert_eq!(
            changeset_branch_name("feat/e1", "E1", "X9"),
            "feat/e1-X9"
        );
        // Prefix of a different epic does not strip.
        assert_eq!(
            changeset_branch_name("feat/e1", "E1", "E10.2"),
            "feat/e1-E10.2"
        );
    }

    #[test]
    fn dot_with_empty_suffix_keeps_full_id() {
        assert_eq!(
            changeset_branch_name("feat/e1", "E1", "E1."),
            "feat/e1-E1."
        );
    }

    #[test]
    fn id_validation_rejects_separators() {
        assert!(validate_id("epic", "E1").is_ok());
        assert!(validate_id("epic", "E1.2").is_ok());
        assert!(validate_id("epic", "").is_err());
        assert!(validate_id("epic", "a/b").is_err());
        assert!(validate_id("epic", "..").is_err());
    }
}
