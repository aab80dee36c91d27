//! ---
//! actrl_section: "04-node"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "TOML-file activity configuration with persisted overrides."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
//! Activity configuration read from `activity.toml` in the install directory.
//!
//! Nested tables flatten to dotted keys, so `[activity] executable = "x"`
//! becomes `activity.executable`. Updates are written to an overrides file
//! in the permanent data directory and win over the shipped values.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use actrl_lifecycle::{ActivityConfiguration, ActivityFilesystem, InstalledActivity};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use toml::{Table, Value};
use tracing::debug;

use crate::collaborators::ConfigurationProvider;

const BASE_FILE: &str = "activity.toml";
const OVERRIDES_FILE: &str = "activity-overrides.toml";

/// Hands out a [`TomlActivityConfiguration`] per activity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlConfigurationProvider;

impl ConfigurationProvider for TomlConfigurationProvider {
    fn configuration_for(
        &self,
        activity: &InstalledActivity,
        filesystem: &ActivityFilesystem,
    ) -> Result<Box<dyn ActivityConfiguration>> {
        debug!(activity = %activity.uuid, "using toml activity configuration");
        Ok(Box::new(TomlActivityConfiguration::new(
            filesystem.install_dir.join(BASE_FILE),
            filesystem.permanent_data_dir.join(OVERRIDES_FILE),
        )))
    }
}

#[derive(Debug, Clone)]
pub struct TomlActivityConfiguration {
    base: PathBuf,
    overrides: PathBuf,
    values: IndexMap<String, String>,
}

impl TomlActivityConfiguration {
    pub fn new(base: impl Into<PathBuf>, overrides: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            overrides: overrides.into(),
            values: IndexMap::new(),
        }
    }

    fn write_overrides(&self, overrides: &IndexMap<String, String>) -> Result<()> {
        if let Some(parent) = self.overrides.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = toml::to_string(overrides).context("failed to render overrides")?;
        fs::write(&self.overrides, content)
            .with_context(|| format!("failed to write {}", self.overrides.display()))
    }
}

impl ActivityConfiguration for TomlActivityConfiguration {
    fn load(&mut self) -> Result<()> {
        let mut values = read_flat(&self.base)?;
        values.extend(read_flat(&self.overrides)?);
        debug!(path = %self.base.display(), keys = values.len(), "activity configuration loaded");
        self.values = values;
        Ok(())
    }

    fn update(&mut self, update: &IndexMap<String, String>) -> Result<()> {
        let mut overrides = read_flat(&self.overrides)?;
        for (key, value) in update {
            overrides.insert(key.clone(), value.clone());
            self.values.insert(key.clone(), value.clone());
        }
        self.write_overrides(&overrides)
    }

    fn set_value(&mut self, key: &str, value: String) {
        self.values.insert(key.to_owned(), value);
    }

    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn snapshot(&self) -> IndexMap<String, String> {
        self.values.clone()
    }
}

fn read_flat(path: &Path) -> Result<IndexMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(IndexMap::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    let table: Table = content
        .parse()
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let mut values = IndexMap::new();
    flatten(None, &table, &mut values);
    Ok(values)
}

fn flatten(prefix: Option<&str>, table: &Table, out: &mut IndexMap<String, String>) {
    for (key, value) in table {
        let key = match prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.clone(),
        };
        match value {
            Value::Table(nested) => flatten(Some(&key), nested, out),
            Value::Array(items) => {
                let joined = items.iter().map(render).collect::<Vec<_>>().join(" ");
                out.insert(key, joined);
            }
            other => {
                out.insert(key, render(other));
            }
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
