//! Applied containers remembered between invocations

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

/// What `apply` resolved for one container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    /// systemd unit owning the cgroups
    pub unit: String,

    /// Controller name to cgroup directory
    pub paths: HashMap<String, PathBuf>,
}

/// One JSON file per container below a state directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// File holding the state of container `name`
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn save(&self, name: &str, state: &ContainerState) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create state directory {:?}", self.dir))?;

        let path = self.path(name);
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&path, content).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// State of `name`, `None` if it was never applied
    pub fn load(&self, name: &str) -> Result<Option<ContainerState>> {
        let path = self.path(name);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
        };

        let state = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt state file {:?}", path))?;
        Ok(Some(state))
    }

    /// Forget `name`; forgetting an unknown container succeeds
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
        }
    }
}
