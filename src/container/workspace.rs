//! Shared workspace bootstrap.
//!
//! Every container launched on a host shares one root directory for mounts
//! handed into containers. This module makes sure that directory exists
//! before any container is created.
//!
//! # Bookkeeping
//!
//! Directories are only ever created on demand, and every directory created
//! here is recorded (parents first) so that `rollback()` can reverse exactly
//! what this utility did and nothing else.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace, warn};

use crate::error::WorkspaceError;

/// The shared root directory used by all containers.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    created: Vec<PathBuf>,
}

impl Workspace {
    /// Creates a workspace handle. Nothing is touched on disk.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            created: Vec::new(),
        }
    }

    /// Returns the workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directories created by this utility, parents first.
    #[must_use]
    pub fn created_dirs(&self) -> &[PathBuf] {
        &self.created
    }

    /// Ensures the workspace root exists, creating it and missing parents.
    ///
    /// Safe to call repeatedly: if the directory already exists this is a
    /// no-op and performs no filesystem mutation.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::InitFailed` if the root is missing and cannot
    /// be created, or exists but is not a directory.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn check_workspace(&mut self) -> Result<(), WorkspaceError> {
        if self.root.is_dir() {
            trace!("Workspace root already present");
            return Ok(());
        }

        if self.root.exists() {
            return Err(WorkspaceError::InitFailed {
                path: self.root.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "path exists and is not a directory",
                ),
            });
        }

        debug!("Workspace root does not exist, trying to create");
        let missing = missing_ancestors(&self.root);

        fs::create_dir_all(&self.root).map_err(|e| WorkspaceError::InitFailed {
            path: self.root.clone(),
            source: e,
        })?;

        self.created.extend(missing);
        debug!(created = self.created.len(), "Workspace root created");
        Ok(())
    }

    /// Removes the directories this utility created, deepest first.
    ///
    /// Directories that are no longer empty are left in place. Returns the
    /// number of directories removed.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn rollback(&mut self) -> usize {
        let mut removed = 0;
        while let Some(dir) = self.created.pop() {
            match fs::remove_dir(&dir) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Could not remove workspace directory");
                }
            }
        }
        debug!(removed, "Workspace rollback complete");
        removed
    }
}

/// Returns the ancestors of `path` (including itself) that do not exist, outermost first.
fn missing_ancestors(path: &Path) -> Vec<PathBuf> {
    let mut missing: Vec<PathBuf> = path
        .ancestors()
        .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
        .map(Path::to_path_buf)
        .collect();
    missing.reverse();
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_check_workspace_creates_missing_root() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let root = temp_dir.path().join("a").join("b");

        let mut workspace = Workspace::new(&root);
        workspace.check_workspace().expect("check_workspace failed");

        assert!(root.is_dir());
        assert_eq!(
            workspace.created_dirs(),
            &[temp_dir.path().join("a"), root.clone()]
        );
    }

    #[test]
    fn test_check_workspace_existing_is_noop() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let mut workspace = Workspace::new(temp_dir.path());

        workspace.check_workspace().expect("first check failed");
        workspace.check_workspace().expect("second check failed");

        assert!(workspace.created_dirs().is_empty());
    }

    #[test]
    fn test_check_workspace_rejects_file() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let file_path = temp_dir.path().join("file");
        File::create(&file_path).expect("failed to create file");

        let mut workspace = Workspace::new(&file_path);
        let err = workspace.check_workspace().unwrap_err();
        assert!(matches!(err, WorkspaceError::InitFailed { .. }));
    }

    #[test]
    fn test_rollback_only_removes_created() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let root = temp_dir.path().join("x").join("y");

        let mut workspace = Workspace::new(&root);
        workspace.check_workspace().expect("check_workspace failed");
        assert_eq!(workspace.rollback(), 2);

        assert!(!temp_dir.path().join("x").exists());
        assert!(temp_dir.path().exists());
        assert!(workspace.created_dirs().is_empty());
    }

    #[test]
    fn test_rollback_keeps_non_empty_dirs() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let root = temp_dir.path().join("outer").join("inner");

        let mut workspace = Workspace::new(&root);
        workspace.check_workspace().expect("check_workspace failed");
        File::create(temp_dir.path().join("outer").join("keep")).expect("failed to create file");

        assert_eq!(workspace.rollback(), 1);
        assert!(temp_dir.path().join("outer").exists());
        assert!(!root.exists());
    }
}
