//! Operator-tunable timing and feed parameters.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::position_store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleSettings {
    /// Dwell after suction-on, letting the vacuum grip the blade.
    pub grab_delay_ms: u64,
    /// Dwell after suction release, letting the blade settle on its hook.
    pub release_delay_ms: u64,
    /// Feed rate for scripted moves.
    pub feedrate_mm_min: u32,
    /// Feed rate for manual jogs.
    pub jog_feedrate_mm_min: u32,
    /// Wrap the cursor back to hook 0 at end of rack instead of stopping.
    pub loop_cycle: bool,
}

impl Default for CycleSettings {
    fn default() -> Self {
        Self {
            grab_delay_ms: 500,
            release_delay_ms: 300,
            feedrate_mm_min: 3000,
            jog_feedrate_mm_min: 1000,
            loop_cycle: false,
        }
    }
}

impl CycleSettings {
    pub fn grab_delay(&self) -> Duration {
        Duration::from_millis(self.grab_delay_ms)
    }

    pub fn release_delay(&self) -> Duration {
        Duration::from_millis(self.release_delay_ms)
    }

    /// Defaults when the file is absent; a present-but-unreadable file is an
    /// error rather than a silent fallback.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("no settings file at {path:?}, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}
