//! # Oceanographic Atlas Sources
//!
//! A [`GridSource`] turns a position and time into a synthetic [`Profile`]
//! by looking up temperature and salinity in a gridded atlas and deriving
//! sound speed.
//!
//! ## Sources
//! - [`climatology::ClimatologyAtlas`]: monthly levels extended by deeper
//!   seasonal levels, with a ± one standard deviation envelope
//! - [`forecast::ForecastAtlas`]: daily global or regional ocean forecast,
//!   potential temperature converted to in-situ
//!
//! ## Grid Residency
//! Each source keeps at most one grid generation in memory, keyed by its time
//! bucket (forecast day or climatology month). A query for another bucket
//! evicts the resident grid and loads the new one:
//!
//! ```text
//! Absent ──load──▶ Loaded{bucket} ──bucket mismatch──▶ (evict) ──load──▶ Loaded{bucket'}
//!                        │
//!                      close ──▶ Closed
//! ```
//!
//! ## Error Handling
//! Network and parsing errors never escape [`GridSource::query`]; they are
//! logged and the query answers `None`.

use std::{fmt::Debug, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::oceanography::{depth_to_pressure, sound_speed};
use crate::{
    AtlasKind, Metadata, MetadataError, Position, ProbeType, Profile, ProfileSamples, Sample,
    SampleSource, SensorType,
};

pub mod climatology;
pub mod fetch;
pub mod forecast;
pub mod grid;

pub use grid::{Axis, Grid, GridCell, Slab};

/// Errors raised while loading or reading an atlas grid.
#[derive(Error, Debug)]
pub enum AtlasError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("grid not found: {0}")]
    NotFound(String),

    #[error("grid decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("grid IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("source is closed")]
    Closed,

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

/// A gridded atlas that can synthesize profiles.
pub trait GridSource: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> AtlasKind;

    fn is_enabled(&self) -> bool;

    /// Existence probe for the grid covering `timestamp`.
    fn has_data(&self, timestamp: DateTime<Utc>) -> bool;

    /// Synthetic profile at (`lat`, `lon`) for `timestamp`, or `None` when
    /// the atlas has nothing there.
    fn query(&self, lat: f64, lon: f64, timestamp: DateTime<Utc>) -> Option<Profile>;

    /// Node of the resident grid nearest to (`lat`, `lon`). `None` when no
    /// grid is loaded or the point is off-grid.
    fn cell_index(&self, lat: f64, lon: f64) -> Option<GridCell>;

    /// Release the resident grid. Later queries answer `None`.
    fn close(&self);
}

enum SlotState<B, T> {
    Absent,
    Loaded { bucket: B, data: Arc<T> },
    Closed,
}

/// Holder for the single resident grid generation of a source.
pub(crate) struct GridSlot<B, T> {
    state: Mutex<SlotState<B, T>>,
}

impl<B: PartialEq + Clone + Debug, T> GridSlot<B, T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Absent),
        }
    }

    /// Resident data for `bucket`, loading it (and evicting any other
    /// bucket) first if needed. The lock is held while loading so concurrent
    /// queries never load the same bucket twice.
    pub(crate) fn ensure<F>(&self, bucket: B, load: F) -> Result<Arc<T>, AtlasError>
    where
        F: FnOnce(&B) -> Result<T, AtlasError>,
    {
        let mut state = self.state.lock();
        match &*state {
            SlotState::Closed => return Err(AtlasError::Closed),
            SlotState::Loaded { bucket: resident, data } if *resident == bucket => {
                return Ok(Arc::clone(data));
            }
            SlotState::Loaded { bucket: resident, .. } => {
                debug!(?resident, requested = ?bucket, "evicting stale grid");
                *state = SlotState::Absent;
            }
            SlotState::Absent => {}
        }

        let data = Arc::new(load(&bucket)?);
        *state = SlotState::Loaded {
            bucket,
            data: Arc::clone(&data),
        };
        Ok(data)
    }

    pub(crate) fn resident(&self) -> Option<Arc<T>> {
        match &*self.state.lock() {
            SlotState::Loaded { data, .. } => Some(Arc::clone(data)),
            _ => None,
        }
    }

    pub(crate) fn close(&self) {
        *self.state.lock() = SlotState::Closed;
    }
}

/// One depth level picked from the search window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Level {
    pub depth: f64,
    pub temperature: f64,
    pub salinity: f64,
}

/// For each depth level, the value of the nearest node in `nodes` (sorted
/// nearest first) for which `pick` answers `Some`.
pub(crate) fn closest_per_level<F>(
    depths: &[f64],
    nodes: &[(GridCell, f64)],
    mut pick: F,
) -> Vec<Level>
where
    F: FnMut(usize, GridCell) -> Option<(f64, f64)>,
{
    depths
        .iter()
        .enumerate()
        .filter_map(|(k, &depth)| {
            nodes.iter().find_map(|&(cell, _)| {
                pick(k, cell).map(|(temperature, salinity)| Level {
                    depth,
                    temperature,
                    salinity,
                })
            })
        })
        .collect()
}

/// Samples with Chen–Millero sound speed for atlas levels at `latitude`.
pub(crate) fn levels_to_samples(levels: &[Level], latitude: f64, kind: AtlasKind) -> ProfileSamples {
    let samples = levels
        .iter()
        .map(|level| {
            let pressure = depth_to_pressure(level.depth, latitude);
            Sample {
                pressure,
                depth: level.depth,
                speed: sound_speed(level.temperature, level.salinity, pressure),
                temperature: level.temperature,
                conductivity: 0.0,
                salinity: level.salinity,
                source: SampleSource::Atlas(kind),
                flag: Default::default(),
            }
        })
        .collect::<Vec<_>>();
    ProfileSamples::from(samples)
}

/// Metadata for a synthetic cast at `position`.
pub(crate) fn synthetic_metadata(
    position: Position,
    timestamp: DateTime<Utc>,
    kind: AtlasKind,
    model: &str,
) -> Metadata {
    Metadata {
        position: Some(position),
        timestamp: Some(timestamp),
        sensor: SensorType::Synthetic,
        probe: ProbeType::Atlas(kind),
        serial: Some(model.to_string()),
        ..Metadata::default()
    }
}
