//! Taught waypoints and their JSON persistence.
//!
//! The store keeps a pick position, its hover/approach position, and two
//! paired lists: `hooks` (drop points on the rack) and `hook_approaches`
//! (the hover point directly above each hook).  Every mutation is written
//! straight back to disk so a power cut never loses a taught position.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use derive_new::new;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("position file {path:?} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to encode positions: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A point in the arm's Cartesian frame, millimeters.  Any finite value is
/// accepted; nothing here knows what the arm can actually reach.
#[derive(new, Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl FromStr for Point {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(format!("expected x,y,z but got '{s}'"));
        }
        let mut coords = [0.0; 3];
        for (slot, part) in coords.iter_mut().zip(&parts) {
            *slot = part
                .parse::<f64>()
                .map_err(|e| format!("bad coordinate '{part}': {e}"))?;
        }
        Ok(Point::new(coords[0], coords[1], coords[2]))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PositionSet {
    pub pick: Option<Point>,
    pub pick_approach: Option<Point>,
    #[serde(default)]
    pub hooks: Vec<Point>,
    #[serde(default)]
    pub hook_approaches: Vec<Point>,
}

impl PositionSet {
    pub fn num_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// The (approach, drop) pair for one hook, if taught.
    pub fn hook_pair(&self, index: usize) -> Option<(Point, Point)> {
        Some((*self.hook_approaches.get(index)?, *self.hooks.get(index)?))
    }
}

pub struct PositionStore {
    path: PathBuf,
    set: PositionSet,
}

impl PositionStore {
    /// Loads the store, starting from an empty set when the file does not
    /// exist yet.  A file that parses but pairs up wrong is rejected rather
    /// than silently repaired.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let set = match fs::read_to_string(&path) {
            Ok(raw) => {
                let set: PositionSet =
                    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                if set.hooks.len() != set.hook_approaches.len() {
                    return Err(StoreError::Corrupt {
                        path,
                        reason: format!(
                            "{} hooks but {} approaches",
                            set.hooks.len(),
                            set.hook_approaches.len()
                        ),
                    });
                }
                set
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("no position file at {path:?} yet, starting empty");
                PositionSet::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, set })
    }

    pub fn positions(&self) -> &PositionSet {
        &self.set
    }

    pub fn set_pick(&mut self, point: Point) -> Result<(), StoreError> {
        self.set.pick = Some(point);
        self.save()
    }

    pub fn set_pick_approach(&mut self, point: Point) -> Result<(), StoreError> {
        self.set.pick_approach = Some(point);
        self.save()
    }

    /// Appends a new hook, keeping the two lists paired.  Returns the new
    /// hook's index.
    pub fn add_hook(&mut self, approach: Point, drop: Point) -> Result<usize, StoreError> {
        self.set.hook_approaches.push(approach);
        self.set.hooks.push(drop);
        self.save()?;
        Ok(self.set.hooks.len() - 1)
    }

    pub fn delete_hook(&mut self, index: usize) -> Result<(), StoreError> {
        if index >= self.set.hooks.len() {
            warn!("delete_hook: no hook {index}, ignoring");
            return Ok(());
        }
        self.set.hooks.remove(index);
        self.set.hook_approaches.remove(index);
        self.save()
    }

    pub fn clear_hooks(&mut self) -> Result<(), StoreError> {
        self.set.hooks.clear();
        self.set.hook_approaches.clear();
        self.save()
    }

    /// Write-then-rename so an interrupted save never leaves a half-written
    /// file behind.
    fn save(&self) -> Result<(), StoreError> {
        let encoded = serde_json::to_string_pretty(&self.set)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> PositionStore {
        PositionStore::load(dir.path().join("positions.json")).unwrap()
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert_eq!(*store.positions(), PositionSet::default());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let mut store = PositionStore::load(&path).unwrap();
        store.set_pick(Point::new(150.0, 200.0, -50.0)).unwrap();
        store.set_pick_approach(Point::new(150.0, 200.0, 0.0)).unwrap();
        store
            .add_hook(Point::new(-50.0, 280.0, 0.0), Point::new(-50.0, 280.0, -30.0))
            .unwrap();

        let reloaded = PositionStore::load(&path).unwrap();
        assert_eq!(reloaded.positions(), store.positions());
    }

    #[test]
    fn test_hooks_stay_paired() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        for i in 0..4 {
            let z = f64::from(i);
            store
                .add_hook(Point::new(0.0, 280.0, 0.0), Point::new(0.0, 280.0, -z))
                .unwrap();
            let set = store.positions();
            assert_eq!(set.hooks.len(), set.hook_approaches.len());
        }
        store.delete_hook(1).unwrap();
        let set = store.positions();
        assert_eq!(set.hooks.len(), 3);
        assert_eq!(set.hook_approaches.len(), 3);
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        fs::write(&path, "not json at all").unwrap();
        assert!(matches!(
            PositionStore::load(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_unpaired_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        fs::write(
            &path,
            r#"{"pick":null,"pick_approach":null,"hooks":[{"x":1.0,"y":2.0,"z":3.0}],"hook_approaches":[]}"#,
        )
        .unwrap();
        assert!(matches!(
            PositionStore::load(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_point_from_str() {
        assert_eq!(
            "150, 200, -50".parse::<Point>().unwrap(),
            Point::new(150.0, 200.0, -50.0)
        );
        assert!("1,2".parse::<Point>().is_err());
        assert!("a,b,c".parse::<Point>().is_err());
    }
}
