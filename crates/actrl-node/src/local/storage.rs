//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Directory-backed activity storage."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use actrl_lifecycle::ActivityFilesystem;
use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::collaborators::StorageProvider;

/// Lays activities out as `<root>/<uuid>/{install,log,data,tmp}`.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn layout(&self, uuid: &str) -> Result<ActivityFilesystem> {
        let valid = !uuid.is_empty()
            && uuid != "."
            && uuid != ".."
            && !uuid.contains(['/', '\\']);
        if !valid {
            bail!("activity uuid {uuid:?} cannot be used as a directory name");
        }
        Ok(ActivityFilesystem::under(self.root.join(uuid)))
    }

    fn recreate(dir: &Path) -> Result<()> {
        if dir.exists() {
            fs::remove_dir_all(dir).with_context(|| format!("failed to remove {}", dir.display()))?;
        }
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
    }
}

impl StorageProvider for DirectoryStorage {
    fn filesystem_for(&self, uuid: &str) -> Result<ActivityFilesystem> {
        let filesystem = self.layout(uuid)?;
        for dir in [
            &filesystem.install_dir,
            &filesystem.log_dir,
            &filesystem.permanent_data_dir,
            &filesystem.temp_data_dir,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        }
        debug!(activity = %uuid, root = %self.root.display(), "activity directories ready");
        Ok(filesystem)
    }

    fn clean_temp_data(&self, uuid: &str) -> Result<()> {
        Self::recreate(&self.layout(uuid)?.temp_data_dir)
    }

    fn clean_permanent_data(&self, uuid: &str) -> Result<()> {
        Self::recreate(&self.layout(uuid)?.permanent_data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn directories_are_created_and_cleaned_independently() {
        let dir = tempdir().expect("tempdir");
        let storage = DirectoryStorage::new(dir.path());
        let filesystem = storage.filesystem_for("u1").expect("filesystem");
        assert!(filesystem.install_dir.is_dir());
        assert!(filesystem.log_dir.is_dir());

        fs::write(filesystem.temp_data_dir.join("scratch"), b"x").expect("write tmp");
        fs::write(filesystem.permanent_data_dir.join("keep"), b"y").expect("write data");
        storage.clean_temp_data("u1").expect("clean tmp");

        assert!(filesystem.temp_data_dir.is_dir());
        assert!(!filesystem.temp_data_dir.join("scratch").exists());
        assert!(filesystem.permanent_data_dir.join("keep").exists());

        storage.clean_permanent_data("u1").expect("clean data");
        assert!(!filesystem.permanent_data_dir.join("keep").exists());
    }

    #[test]
    fn path_like_uuids_are_rejected() {
        let storage = DirectoryStorage::new("/srv/activities");
        assert!(storage.filesystem_for("../etc").is_err());
        assert!(storage.clean_temp_data("..").is_err());
    }
}
