//! # Profile Persistence
//!
//! Every profile the server transmits is saved through a [`ProfileStore`].
//! Two implementations are provided: [`MemoryStore`] for tests and one-shot
//! CLI runs, and [`JsonDirStore`], which keeps one JSON document per profile
//! in a directory.
//!
//! A profile must carry a position and a timestamp to be saved.

use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{MetadataError, Position, ProbeType, Profile, SensorType};

const FILE_PREFIX: &str = "svp_";
const FILE_SUFFIX: &str = ".json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("profile cannot be stored: {0}")]
    Metadata(#[from] MetadataError),

    #[error("store IO: {0}")]
    Io(#[from] io::Error),

    #[error("store JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identifier assigned by a store on save.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProfileId(pub u64);

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ProfileId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ProfileId)
    }
}

/// What `list` shows about a stored profile.
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileSummary {
    pub timestamp: DateTime<Utc>,
    pub position: Position,
    pub sensor: SensorType,
    pub probe: ProbeType,
    pub samples: usize,
    pub max_depth: Option<f64>,
}

impl ProfileSummary {
    pub fn of(profile: &Profile) -> Result<Self, MetadataError> {
        let (position, timestamp) = profile.meta.require_fix()?;
        Ok(Self {
            timestamp,
            position,
            sensor: profile.meta.sensor,
            probe: profile.meta.probe,
            samples: profile.processed.valid_count(),
            max_depth: profile.processed.depth_range().map(|(_, deepest)| deepest),
        })
    }
}

pub trait ProfileStore: Send + Sync {
    fn save(&self, profile: &Profile) -> Result<ProfileId, StoreError>;
    /// Stored profiles in id order.
    fn list(&self) -> Vec<(ProfileId, ProfileSummary)>;
    fn get(&self, id: ProfileId) -> Option<Profile>;
    /// True if a profile was removed.
    fn delete(&self, id: ProfileId) -> bool;
}

#[derive(Default)]
struct MemoryInner {
    next: u64,
    profiles: BTreeMap<ProfileId, Profile>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryStore {
    fn save(&self, profile: &Profile) -> Result<ProfileId, StoreError> {
        profile.meta.require_fix()?;
        let mut inner = self.inner.lock();
        inner.next += 1;
        let id = ProfileId(inner.next);
        inner.profiles.insert(id, profile.clone());
        Ok(id)
    }

    fn list(&self) -> Vec<(ProfileId, ProfileSummary)> {
        self.inner
            .lock()
            .profiles
            .iter()
            .filter_map(|(id, p)| ProfileSummary::of(p).ok().map(|s| (*id, s)))
            .collect()
    }

    fn get(&self, id: ProfileId) -> Option<Profile> {
        self.inner.lock().profiles.get(&id).cloned()
    }

    fn delete(&self, id: ProfileId) -> bool {
        self.inner.lock().profiles.remove(&id).is_some()
    }
}

/// One `svp_<id>.json` file per profile.
pub struct JsonDirStore {
    dir: PathBuf,
    next: Mutex<u64>,
}

impl JsonDirStore {
    /// Open (creating if needed) the store directory. New ids continue after
    /// the highest id already present.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let highest = stored_ids(&dir)?.into_iter().max().map_or(0, |id| id.0);
        debug!(dir = %dir.display(), highest, "profile store opened");
        Ok(Self {
            dir,
            next: Mutex::new(highest),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: ProfileId) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{:06}{FILE_SUFFIX}", id.0))
    }

    fn read(&self, id: ProfileId) -> Result<Profile, StoreError> {
        let data = fs::read(self.path(id))?;
        Ok(serde_json::from_slice(&data)?)
    }
}

fn stored_ids(dir: &Path) -> Result<Vec<ProfileId>, io::Error> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let id = name
            .to_str()
            .and_then(|n| n.strip_prefix(FILE_PREFIX))
            .and_then(|n| n.strip_suffix(FILE_SUFFIX))
            .and_then(|n| n.parse().ok());
        if let Some(id) = id {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

impl ProfileStore for JsonDirStore {
    fn save(&self, profile: &Profile) -> Result<ProfileId, StoreError> {
        profile.meta.require_fix()?;
        let data = serde_json::to_vec_pretty(profile)?;
        let mut next = self.next.lock();
        let id = ProfileId(*next + 1);
        fs::write(self.path(id), data)?;
        *next = id.0;
        debug!(%id, path = %self.path(id).display(), "profile saved");
        Ok(id)
    }

    fn list(&self) -> Vec<(ProfileId, ProfileSummary)> {
        let ids = match stored_ids(&self.dir) {
            Ok(ids) => ids,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot list profiles");
                return Vec::new();
            }
        };
        ids.into_iter()
            .filter_map(|id| match self.read(id) {
                Ok(profile) => ProfileSummary::of(&profile).ok().map(|s| (id, s)),
                Err(e) => {
                    warn!(%id, error = %e, "skipping unreadable profile");
                    None
                }
            })
            .collect()
    }

    fn get(&self, id: ProfileId) -> Option<Profile> {
        self.read(id).ok()
    }

    fn delete(&self, id: ProfileId) -> bool {
        fs::remove_file(self.path(id)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Metadata, ProfileSamples, Sample};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn profile(hour: u32) -> Profile {
        let meta = Metadata {
            position: Some(Position::new(43.0265, -70.3188)),
            timestamp: Some(Utc.with_ymd_and_hms(2024, 6, 16, hour, 0, 0).unwrap()),
            sensor: SensorType::Synthetic,
            ..Metadata::default()
        };
        let samples = ProfileSamples::from(vec![
            Sample::new(0.0, 1500.0),
            Sample::new(50.0, 1490.0),
            Sample::new(200.0, 1485.0),
        ]);
        Profile::new(meta, samples)
    }

    #[test]
    fn test_save_requires_fix() {
        let store = MemoryStore::new();
        let mut p = profile(1);
        p.meta.timestamp = None;
        assert!(matches!(
            store.save(&p),
            Err(StoreError::Metadata(MetadataError::MissingTimestamp))
        ));
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_memory_store_lifecycle() {
        let store = MemoryStore::new();
        let a = store.save(&profile(1)).unwrap();
        let b = store.save(&profile(2)).unwrap();
        assert_ne!(a, b);

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0, a);
        assert_eq!(listed[1].1.samples, 3);
        assert_eq!(listed[1].1.max_depth, Some(200.0));

        assert_eq!(store.get(b), Some(profile(2)));
        assert!(store.delete(a));
        assert!(!store.delete(a));
        assert!(store.get(a).is_none());
    }

    #[test]
    fn test_json_dir_store_persists_across_open() {
        let dir = TempDir::new().unwrap();
        let first = {
            let store = JsonDirStore::open(dir.path()).unwrap();
            store.save(&profile(3)).unwrap()
        };

        let store = JsonDirStore::open(dir.path()).unwrap();
        assert_eq!(store.get(first), Some(profile(3)));
        let second = store.save(&profile(4)).unwrap();
        assert!(second > first);

        let listed = store.list();
        assert_eq!(listed.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![first, second]);
        assert_eq!(listed[0].1.sensor, SensorType::Synthetic);
    }

    #[test]
    fn test_json_dir_store_skips_foreign_and_corrupt_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        fs::write(dir.path().join("svp_000007.json"), "{ not json").unwrap();

        let store = JsonDirStore::open(dir.path()).unwrap();
        assert!(store.list().is_empty());
        // Ids continue after the corrupt file's id
        assert_eq!(store.save(&profile(5)).unwrap(), ProfileId(8));
        assert!(store.delete(ProfileId(7)));
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_profile_id_parse() {
        assert_eq!("42".parse::<ProfileId>(), Ok(ProfileId(42)));
        assert!("x".parse::<ProfileId>().is_err());
        assert_eq!(ProfileId(7).to_string(), "7");
    }
}
