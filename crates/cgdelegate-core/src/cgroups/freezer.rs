//! Freeze/thaw bracket around disruptive updates
//!
//! systemd rewrites the devices cgroup from scratch when `DeviceAllow`
//! changes, briefly denying every device. Freezing the container for the
//! duration keeps its processes from observing that window.

use std::path::Path;

use tracing::{debug, warn};

use super::config::FreezerState;
use super::controller::FreezerController;
use super::io::CgroupIo;
use crate::error::Result;

pub struct FreezerCoordinator<'a> {
    io: &'a dyn CgroupIo,
    path: Option<&'a Path>,
}

impl<'a> FreezerCoordinator<'a> {
    /// `path` is the container's freezer cgroup, if the controller was resolved
    pub fn new(io: &'a dyn CgroupIo, path: Option<&'a Path>) -> Self {
        Self { io, path }
    }

    /// Live state; `Thawed` when nothing is known
    pub fn state(&self) -> Result<FreezerState> {
        let Some(path) = self.path else {
            return Ok(FreezerState::Thawed);
        };

        match FreezerController::get_state(self.io, path)? {
            FreezerState::Undefined => Ok(FreezerState::Thawed),
            state => Ok(state),
        }
    }

    /// Run `critical` with the container frozen, then put back the prior state
    ///
    /// Freeze and restore failures are logged, not returned: the outcome of
    /// `critical` is what the caller gets.
    pub fn run<T>(&self, critical: impl FnOnce() -> Result<T>) -> Result<T> {
        let Some(path) = self.path else {
            debug!("No freezer cgroup, running update without freezing");
            return critical();
        };

        let original = self.state()?;

        if let Err(e) = FreezerController::set(self.io, path, FreezerState::Frozen) {
            warn!("Failed to freeze container before property update: {}", e);
        }

        let result = critical();

        if let Err(e) = FreezerController::set(self.io, path, original) {
            warn!("Failed to restore freezer state {}: {}", original, e);
        }

        result
    }
}
