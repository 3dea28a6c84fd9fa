//! # SVP Server Core Library
//!
//! This library delivers sound-speed-versus-depth profiles to multibeam echo
//! sounder control systems. Profiles are synthesized from gridded
//! oceanographic atlases (climatology and daily ocean forecasts) keyed by the
//! vessel's position, thinned to fit a datagram, and transmitted to one or more
//! listening clients with an optional confirming echo.
//!
//! ## Design Philosophy
//!
//! ### Explicit Ownership
//! - **Single owner**: a [`Profile`] is held by exactly one component at a
//!   time (the CLI import path or the server loop via [`session::Session`])
//!   and handed off by value or shared reference, never mutated concurrently
//! - **Derived views**: the device view is always rebuilt from the processed
//!   view, never edited on its own
//!
//! ### Samples as Records
//! The profile is an ordered sequence of [`Sample`] records rather than a set
//! of parallel arrays. Insertions and interpolations are pure functions that
//! return a new [`ProfileSamples`] (see [`profile`]), so a partially updated
//! profile can never be observed.
//!
//! ### Data Flow
//! 1. **Resolve**: atlas lookup by position and time → [`Profile`]
//! 2. **Correct**: optional surface sound speed splice at the transducer draft
//! 3. **Thin**: Douglas–Peucker simplification within a speed tolerance
//! 4. **Encode**: ASCII sentence for the client protocol
//! 5. **Deliver**: UDP datagram, optional confirmation by echoed telemetry
//!
//! ## Core Types
//!
//! - [`Sample`]: one measurement level
//! - [`ProfileSamples`]: ordered sequence of samples (one view of a profile)
//! - [`Metadata`]: position, time and instrument information
//! - [`Profile`]: raw, processed and device views plus metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Module declarations
pub mod atlas;
pub mod config;
pub mod oceanography;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod renderer;
pub mod server;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod thinning;
pub mod transmission;

/// Family of gridded data set a synthetic profile was taken from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtlasKind {
    /// Global monthly/seasonal climatology (World Ocean Atlas style)
    Climatology,
    /// Global daily ocean forecast
    GlobalForecast,
    /// Regional ocean forecast model
    RegionalForecast,
}

/// Where a sample came from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleSource {
    /// As imported from the sensor or atlas
    #[default]
    Raw,
    /// Edited by the operator
    UserEdited,
    /// Extended with values from an atlas
    Atlas(AtlasKind),
    /// Surface sound speed spliced in at the transducer draft
    TssInsert,
    /// Synthesized for the echo sounder (surface or abyssal extension)
    SisInsert,
    /// Produced by smoothing
    Smoothing,
}

/// Validity of a sample within its view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFlag {
    #[default]
    Valid,
    /// Cast direction reversal (e.g. upcast samples in a downcast profile)
    DirectionInvalid,
    /// Rejected by the operator
    UserInvalid,
    /// Discarded by thinning
    Thinned,
    /// Excluded from the echo sounder view by the edge policy
    SisExcluded,
    Filtered,
    Smoothed,
}

/// A single level of a sound speed profile.
///
/// Units: pressure in dbar, depth in metres, speed in m/s, temperature in °C,
/// conductivity in mS/cm and salinity in PSU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub pressure: f64,
    pub depth: f64,
    pub speed: f64,
    pub temperature: f64,
    pub conductivity: f64,
    pub salinity: f64,
    pub source: SampleSource,
    pub flag: SampleFlag,
}

impl Sample {
    /// Convenience constructor for a valid raw depth/speed sample.
    ///
    /// # Example
    /// ```
    /// use svp_lib::{Sample, SampleFlag};
    ///
    /// let s = Sample::new(10.0, 1500.0);
    /// assert_eq!(s.flag, SampleFlag::Valid);
    /// ```
    pub fn new(depth: f64, speed: f64) -> Self {
        Self {
            depth,
            speed,
            ..Self::default()
        }
    }

    /// Builder-style setter for temperature and salinity.
    pub fn with_ts(mut self, temperature: f64, salinity: f64) -> Self {
        self.temperature = temperature;
        self.salinity = salinity;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.flag == SampleFlag::Valid
    }
}

/// Ordered sequence of samples forming one view of a profile.
///
/// Order is significant: index order is cast order. Within the subsequence of
/// [`SampleFlag::Valid`] samples, depth is non-decreasing.
///
/// # Example
/// ```
/// use svp_lib::{ProfileSamples, Sample};
///
/// let samples = ProfileSamples::from(vec![
///     Sample::new(0.0, 1500.0),
///     Sample::new(10.0, 1498.2),
/// ]);
/// assert_eq!(samples.len(), 2);
/// assert!(samples.is_depth_monotonic());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSamples {
    pub samples: Vec<Sample>,
}

impl From<Vec<Sample>> for ProfileSamples {
    fn from(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl ProfileSamples {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Iterator over the valid samples, in order.
    pub fn valid(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter().filter(|s| s.is_valid())
    }

    pub fn valid_count(&self) -> usize {
        self.valid().count()
    }

    /// Depth/speed pairs of the valid samples.
    pub fn depth_speed_pairs(&self) -> Vec<(f64, f64)> {
        self.valid().map(|s| (s.depth, s.speed)).collect()
    }

    /// True if depth never decreases along the valid subsequence.
    pub fn is_depth_monotonic(&self) -> bool {
        let depths: Vec<f64> = self.valid().map(|s| s.depth).collect();
        depths.windows(2).all(|w| w[0] <= w[1])
    }

    /// Shallowest and deepest valid sample, if any.
    pub fn depth_range(&self) -> Option<(f64, f64)> {
        let first = self.valid().next()?;
        let last = self.valid().last()?;
        Some((first.depth, last.depth))
    }
}

/// Geographic position in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl Position {
    /// Create a position, normalizing longitude to [-180, 180].
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude: normalize_longitude(longitude),
        }
    }

    /// Latitude within [-90, 90] and finite coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
    }

    /// Longitude in [0, 360), the convention used for grid math.
    pub fn longitude_360(&self) -> f64 {
        longitude_360(self.longitude)
    }
}

/// Normalize a longitude to [-180, 180].
pub fn normalize_longitude(longitude: f64) -> f64 {
    let wrapped = longitude_360(longitude);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Normalize a longitude to [0, 360).
pub fn longitude_360(longitude: f64) -> f64 {
    let wrapped = longitude.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Instrument family that produced a profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorType {
    #[default]
    Unknown,
    Ctd,
    Xbt,
    Xsv,
    Svp,
    /// Synthesized from an atlas
    Synthetic,
}

/// Probe model, or the atlas used for a synthetic profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeType {
    #[default]
    Unknown,
    Deep,
    Shallow,
    Atlas(AtlasKind),
}

/// Returned when a profile lacks the position or time needed for grid lookups
/// or persistence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetadataError {
    #[error("profile has no position")]
    MissingPosition,

    #[error("profile has no timestamp")]
    MissingTimestamp,

    #[error("invalid position: lat {latitude}, lon {longitude}")]
    InvalidPosition { latitude: f64, longitude: f64 },
}

/// Descriptive information attached to a profile.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub position: Option<Position>,
    pub timestamp: Option<DateTime<Utc>>,
    pub sensor: SensorType,
    pub probe: ProbeType,
    pub survey: Option<String>,
    pub vessel: Option<String>,
    pub serial: Option<String>,
}

impl Metadata {
    /// Position and timestamp, both required before any grid lookup or
    /// persistence.
    pub fn require_fix(&self) -> Result<(Position, DateTime<Utc>), MetadataError> {
        let position = self.position.ok_or(MetadataError::MissingPosition)?;
        if !position.is_valid() {
            return Err(MetadataError::InvalidPosition {
                latitude: position.latitude,
                longitude: position.longitude,
            });
        }
        let timestamp = self.timestamp.ok_or(MetadataError::MissingTimestamp)?;
        Ok((position, timestamp))
    }
}

/// Minimum/maximum profiles at plus/minus one standard deviation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min: ProfileSamples,
    pub max: ProfileSamples,
}

/// A sound speed profile with its three views.
///
/// - `raw`: as imported
/// - `processed`: filtered/edited, the working copy
/// - `device`: thinned and ready for transmission, derived from `processed`
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub meta: Metadata,
    pub raw: ProfileSamples,
    pub processed: ProfileSamples,
    pub device: ProfileSamples,
    pub envelope: Option<Envelope>,
}

impl Profile {
    /// Create a profile whose raw and processed views start out identical.
    pub fn new(meta: Metadata, samples: ProfileSamples) -> Self {
        Self {
            meta,
            processed: samples.clone(),
            raw: samples,
            device: ProfileSamples::default(),
            envelope: None,
        }
    }

    /// Replace the processed view; the device view is invalidated.
    pub fn replace_processed(&mut self, samples: ProfileSamples) {
        self.processed = samples;
        self.device = ProfileSamples::default();
    }

    /// Rebuild the device view from the processed view at `tolerance` m/s.
    pub fn rebuild_device_view(&mut self, tolerance: f64) {
        self.device = thinning::thin(&self.processed, tolerance, self.reference_latitude());
    }

    /// Latitude for depth to pressure conversion; the equator when the
    /// position is unknown.
    pub fn reference_latitude(&self) -> f64 {
        self.meta.position.map_or(0.0, |p| p.latitude)
    }

    /// Sound speed at the shallowest valid processed sample.
    pub fn surface_speed(&self) -> Option<f64> {
        self.processed.valid().next().map(|s| s.speed)
    }
}
