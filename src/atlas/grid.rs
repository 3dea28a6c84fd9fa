//! Gridded temperature/salinity document and index arithmetic.
//!
//! Values are stored flat in `[depth][lat][lon]` order. Longitudes may be
//! given in either [-180, 180) or [0, 360); lookups try both conventions.

use std::io::Read;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use super::AtlasError;
use crate::oceanography::great_circle_distance;
use crate::normalize_longitude;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const DEFAULT_REFERENCE_PRESSURE: f64 = 2000.0;

/// Coordinate axis of a grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Axis {
    Regular { start: f64, step: f64, count: usize },
    Explicit(Vec<f64>),
}

impl Axis {
    pub fn len(&self) -> usize {
        match self {
            Axis::Regular { count, .. } => *count,
            Axis::Explicit(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self, index: usize) -> Option<f64> {
        match self {
            Axis::Regular { start, step, count } => {
                (index < *count).then(|| start + step * index as f64)
            }
            Axis::Explicit(values) => values.get(index).copied(),
        }
    }

    /// Typical spacing between adjacent values.
    fn spacing(&self) -> f64 {
        match self {
            Axis::Regular { step, .. } => step.abs(),
            Axis::Explicit(values) if values.len() > 1 => {
                ((values[values.len() - 1] - values[0]) / (values.len() - 1) as f64).abs()
            }
            Axis::Explicit(_) => 0.0,
        }
    }

    /// Index of the value nearest `x`, if `x` lies within half a step of the
    /// axis.
    pub fn nearest(&self, x: f64) -> Option<usize> {
        match self {
            Axis::Regular { start, step, count } => {
                if *count == 0 || *step == 0.0 {
                    return None;
                }
                let index = ((x - start) / step).round();
                (index >= 0.0 && (index as usize) < *count).then_some(index as usize)
            }
            Axis::Explicit(values) => {
                let (index, distance) = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i, (v - x).abs()))
                    .min_by(|a, b| a.1.total_cmp(&b.1))?;
                let limit = if values.len() > 1 {
                    self.spacing() / 2.0 + 1e-9
                } else {
                    1e-9
                };
                (distance <= limit).then_some(index)
            }
        }
    }

    /// Nearest index treating the axis as periodic over 360 degrees.
    fn nearest_wrapped(&self, x: f64) -> Option<usize> {
        let count = self.len();
        let start = self.value(0)?;
        let step = self.spacing();
        if step == 0.0 {
            return None;
        }
        let offset = (x - start).rem_euclid(360.0);
        let index = (offset / step).round() as usize;
        Some(index % count)
    }
}

/// Indices of one horizontal grid node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCell {
    pub lat: usize,
    pub lon: usize,
}

/// One time slab of a grid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slab {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    pub temperature: Vec<f64>,
    pub salinity: Vec<f64>,
    #[serde(default)]
    pub temperature_sd: Option<Vec<f64>>,
    #[serde(default)]
    pub salinity_sd: Option<Vec<f64>>,
}

fn default_reference_pressure() -> f64 {
    DEFAULT_REFERENCE_PRESSURE
}

/// A gridded atlas document as downloaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub model: String,
    pub latitudes: Axis,
    pub longitudes: Axis,
    pub depths: Vec<f64>,
    pub fill_value: f64,
    #[serde(default = "default_reference_pressure")]
    pub reference_pressure: f64,
    #[serde(default)]
    pub land: Option<Vec<bool>>,
    pub slabs: Vec<Slab>,
}

impl Grid {
    /// Decode a JSON document, gunzipping it first if it carries the gzip
    /// magic bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AtlasError> {
        let grid: Grid = if bytes.starts_with(&GZIP_MAGIC) {
            let mut json = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut json)?;
            serde_json::from_slice(&json)?
        } else {
            serde_json::from_slice(bytes)?
        };
        grid.validate()?;
        Ok(grid)
    }

    /// Check that every array matches the axis dimensions.
    pub fn validate(&self) -> Result<(), AtlasError> {
        let nodes = self.latitudes.len() * self.longitudes.len();
        let values = nodes * self.depths.len();
        if nodes == 0 || self.depths.is_empty() {
            return Err(AtlasError::InvalidGrid(format!("{}: empty axis", self.model)));
        }
        if self.slabs.is_empty() {
            return Err(AtlasError::InvalidGrid(format!("{}: no slabs", self.model)));
        }
        if self.land.as_ref().is_some_and(|land| land.len() != nodes) {
            return Err(AtlasError::InvalidGrid(format!(
                "{}: land mask has wrong length",
                self.model
            )));
        }
        for (i, slab) in self.slabs.iter().enumerate() {
            let arrays = [
                Some(&slab.temperature),
                Some(&slab.salinity),
                slab.temperature_sd.as_ref(),
                slab.salinity_sd.as_ref(),
            ];
            if arrays.iter().flatten().any(|a| a.len() != values) {
                return Err(AtlasError::InvalidGrid(format!(
                    "{}: slab {i} expected {values} values",
                    self.model
                )));
            }
        }
        Ok(())
    }

    /// True if the longitude axis covers the whole globe.
    pub fn is_global(&self) -> bool {
        let n = self.longitudes.len();
        n > 1 && self.longitudes.spacing() * n as f64 >= 360.0 - 1e-6
    }

    /// Grid node nearest to (`lat`, `lon`), or `None` outside the grid.
    pub fn cell(&self, lat: f64, lon: f64) -> Option<GridCell> {
        let lat_index = self.latitudes.nearest(lat)?;
        let lon_index = if self.is_global() {
            self.longitudes.nearest_wrapped(lon)?
        } else {
            let lon = normalize_longitude(lon);
            [lon, lon + 360.0, lon - 360.0]
                .into_iter()
                .find_map(|x| self.longitudes.nearest(x))?
        };
        Some(GridCell {
            lat: lat_index,
            lon: lon_index,
        })
    }

    /// Nodes within `radius` indices of `center`. Latitude clamps at the
    /// edges; longitude wraps on global grids and clamps otherwise.
    pub fn window(&self, center: GridCell, radius: usize) -> Vec<GridCell> {
        let nlat = self.latitudes.len();
        let nlon = self.longitudes.len();
        let lat_lo = center.lat.saturating_sub(radius);
        let lat_hi = (center.lat + radius).min(nlat - 1);

        let lons: Vec<usize> = if self.is_global() && 2 * radius + 1 < nlon {
            (0..=2 * radius)
                .map(|k| (center.lon + nlon - radius + k) % nlon)
                .collect()
        } else if self.is_global() {
            (0..nlon).collect()
        } else {
            (center.lon.saturating_sub(radius)..=(center.lon + radius).min(nlon - 1)).collect()
        };

        let mut cells = Vec::with_capacity((lat_hi - lat_lo + 1) * lons.len());
        for lat in lat_lo..=lat_hi {
            for &lon in &lons {
                cells.push(GridCell { lat, lon });
            }
        }
        cells
    }

    /// Geographic position of a node, longitude in [-180, 180].
    pub fn node_position(&self, cell: GridCell) -> Option<(f64, f64)> {
        let lat = self.latitudes.value(cell.lat)?;
        let lon = self.longitudes.value(cell.lon)?;
        Some((lat, normalize_longitude(lon)))
    }

    pub fn is_land(&self, cell: GridCell) -> bool {
        self.land
            .as_ref()
            .and_then(|land| land.get(cell.lat * self.longitudes.len() + cell.lon))
            .copied()
            .unwrap_or(false)
    }

    fn offset(&self, level: usize, cell: GridCell) -> usize {
        (level * self.latitudes.len() + cell.lat) * self.longitudes.len() + cell.lon
    }

    /// A stored value, or `None` if it equals the fill value or is not finite.
    pub fn value(&self, field: &[f64], level: usize, cell: GridCell) -> Option<f64> {
        let v = *field.get(self.offset(level, cell))?;
        let tolerance = 1e-6 * self.fill_value.abs().max(1.0);
        (v.is_finite() && (v - self.fill_value).abs() > tolerance).then_some(v)
    }

    /// True if the node has data at any depth in `slab`.
    pub fn has_data(&self, slab: &Slab, cell: GridCell) -> bool {
        (0..self.depths.len()).any(|k| {
            self.value(&slab.temperature, k, cell).is_some()
                && self.value(&slab.salinity, k, cell).is_some()
        })
    }

    /// Slab whose time is closest to `timestamp`; the first slab when none
    /// carry a time.
    pub fn nearest_slab(&self, timestamp: DateTime<Utc>) -> &Slab {
        self.slabs
            .iter()
            .filter_map(|s| s.time.map(|t| (s, (t - timestamp).num_seconds().abs())))
            .min_by_key(|(_, d)| *d)
            .map(|(s, _)| s)
            .unwrap_or(&self.slabs[0])
    }

    /// Window nodes with their great-circle distance to (`lat`, `lon`),
    /// nearest first. Ties keep window order.
    pub fn nodes_by_distance(
        &self,
        lat: f64,
        lon: f64,
        center: GridCell,
        radius: usize,
    ) -> Vec<(GridCell, f64)> {
        let mut nodes: Vec<(GridCell, f64)> = self
            .window(center, radius)
            .into_iter()
            .filter_map(|cell| {
                let (node_lat, node_lon) = self.node_position(cell)?;
                Some((cell, great_circle_distance(lat, lon, node_lat, node_lon)))
            })
            .collect();
        nodes.sort_by(|a, b| a.1.total_cmp(&b.1));
        nodes
    }
}
