use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use uuid::Uuid;

/// Creates and removes the per-job scratch directories
///
/// Every workspace is a fresh directory named after a random UUID directly
/// under `root`. A [`Workspace`] removes its directory when released or, as a
/// last resort, when dropped.
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Prepares the workspace root and checks that it is writable
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create workspace root {}", root.display()))?;

        let probe = root.join(format!(".probe-{}", Uuid::new_v4()));
        fs::write(&probe, b"")
            .with_context(|| format!("Workspace root {} is not writable", root.display()))?;
        fs::remove_file(&probe)?;

        log::info!("Workspaces will be created under {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates a fresh, uniquely named directory for one job
    pub fn allocate(&self) -> Result<Workspace> {
        let id = Uuid::new_v4();
        let path = self.root.join(format!("job-{id}"));
        // `create_dir` fails on an existing path, so two jobs never share one
        fs::create_dir(&path).map_err(|e| {
            anyhow!("Failed to create workspace {}: {e}", path.display())
        })?;

        log::debug!("Allocated workspace {}", path.display());
        Ok(Workspace {
            id,
            path,
            released: false,
        })
    }
}

/// An exclusively owned job directory
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the directory tree. Failures are logged and swallowed.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            log::warn!("Failed to remove workspace {}: {e}", self.path.display());
        } else {
            log::debug!("Removed workspace {}", self.path.display());
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Reached when a job is dropped without finishing (panic, shutdown)
        if let Err(e) = fs::remove_dir_all(&self.path) {
            log::warn!("Failed to remove workspace {}: {e}", self.path.display());
        } else {
            log::debug!("Removed abandoned workspace {}", self.path.display());
        }
    }
}
