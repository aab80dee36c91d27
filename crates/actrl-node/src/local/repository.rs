//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Activity repository backed by a TOML manifest."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use actrl_lifecycle::InstalledActivity;
use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{info, warn};

use crate::collaborators::ActivityRepository;

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default, rename = "activity")]
    activities: Vec<InstalledActivity>,
}

impl FromStr for Manifest {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(content).context("invalid activity manifest")?;
        for activity in &manifest.activities {
            if activity.uuid.trim().is_empty() {
                bail!("activity manifest contains an entry without a uuid");
            }
        }
        Ok(manifest)
    }
}

/// Installed activities listed as `[[activity]]` tables in a TOML file.
///
/// ```toml
/// [[activity]]
/// uuid = "3f1c..."
/// name = "sensor-bridge"
/// autostart = "activate"
/// ```
#[derive(Debug)]
pub struct ManifestActivityRepository {
    path: PathBuf,
    activities: RwLock<IndexMap<String, InstalledActivity>>,
}

impl ManifestActivityRepository {
    /// Load the manifest at `path`. A missing file yields an empty repository.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repository = Self {
            path: path.as_ref().to_path_buf(),
            activities: RwLock::new(IndexMap::new()),
        };
        repository.reload()?;
        Ok(repository)
    }

    /// Re-read the manifest, replacing the known activities.
    pub fn reload(&self) -> Result<usize> {
        let manifest = match fs::read_to_string(&self.path) {
            Ok(content) => content
                .parse::<Manifest>()
                .with_context(|| format!("failed to parse {}", self.path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "activity manifest not found; no activities installed");
                Manifest::default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        let mut activities = IndexMap::new();
        for activity in manifest.activities {
            if let Some(previous) = activities.insert(activity.uuid.clone(), activity) {
                warn!(activity = %previous.uuid, "duplicate manifest entry; last one wins");
            }
        }
        let count = activities.len();
        *self.activities.write() = activities;
        info!(path = %self.path.display(), activities = count, "activity manifest loaded");
        Ok(count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ActivityRepository for ManifestActivityRepository {
    fn lookup(&self, uuid: &str) -> Result<Option<InstalledActivity>> {
        Ok(self.activities.read().get(uuid).cloned())
    }

    fn list_all(&self) -> Result<Vec<InstalledActivity>> {
        Ok(self.activities.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actrl_lifecycle::AutostartPolicy;
    use tempfile::tempdir;

    #[test]
    fn manifest_entries_are_listed_in_file_order() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("activities.toml");
        fs::write(
            &path,
            r#"
[[activity]]
uuid = "b"
name = "bridge"
autostart = "activate"

[[activity]]
uuid = "a"
"#,
        )
        .expect("write manifest");

        let repository = ManifestActivityRepository::open(&path).expect("open");
        let all = repository.list_all().expect("list");
        assert_eq!(
            all.iter().map(|a| a.uuid.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
        assert_eq!(all[0].autostart, AutostartPolicy::Activate);
        assert_eq!(all[1].autostart, AutostartPolicy::None);
        assert!(repository.lookup("missing").expect("lookup").is_none());
    }

    #[test]
    fn missing_manifest_is_empty_and_reload_picks_up_changes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("activities.toml");
        let repository = ManifestActivityRepository::open(&path).expect("open");
        assert!(repository.list_all().expect("list").is_empty());

        fs::write(&path, "[[activity]]\nuuid = \"u1\"\n").expect("write manifest");
        assert_eq!(repository.reload().expect("reload"), 1);
        assert!(repository.lookup("u1").expect("lookup").is_some());
    }

    #[test]
    fn entries_without_uuid_are_rejected() {
        assert!("[[activity]]\nuuid = \" \"\n".parse::<Manifest>().is_err());
    }
}
