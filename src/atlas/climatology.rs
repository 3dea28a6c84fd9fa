//! Monthly/seasonal climatology source.
//!
//! The monthly document covers the upper ocean; levels of the seasonal
//! document deeper than the monthly bottom level are appended. Each level
//! takes the value of the nearest plausible non-land node in the search
//! window, and the ± one standard deviation fields give the profile envelope.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, warn};

use super::fetch::{expand_template, season_code, GridFetcher};
use super::{
    closest_per_level, levels_to_samples, synthetic_metadata, AtlasError, Grid, GridCell,
    GridSlot, GridSource, Level,
};
use crate::config::ClimatologyConfig;
use crate::{AtlasKind, Envelope, Position, Profile};

/// Name under which the climatology is selected in configuration.
pub const CLIMATOLOGY_NAME: &str = "climatology";

const MAX_PLAUSIBLE_TEMPERATURE: f64 = 50.0;
const MAX_PLAUSIBLE_SALINITY: f64 = 500.0;

/// Month and season of the resident climatology grids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClimatologyBucket {
    pub month: u32,
    pub season: u32,
}

impl ClimatologyBucket {
    pub fn of(timestamp: DateTime<Utc>) -> Self {
        let month = timestamp.month();
        Self {
            month,
            season: season_code(month),
        }
    }
}

struct ClimatologyGrids {
    monthly: Grid,
    seasonal: Option<Grid>,
}

/// Levels found around one query point in one grid.
struct Cast {
    mean: Vec<Level>,
    min: Vec<Level>,
    max: Vec<Level>,
    origin: Position,
}

impl Cast {
    /// Append the levels of `deeper` below this cast's deepest level.
    fn extend_with(&mut self, deeper: Cast) {
        fn append(levels: &mut Vec<Level>, more: Vec<Level>) {
            let bottom = levels.last().map_or(f64::NEG_INFINITY, |l| l.depth);
            levels.extend(more.into_iter().filter(|l| l.depth > bottom));
        }
        append(&mut self.mean, deeper.mean);
        append(&mut self.min, deeper.min);
        append(&mut self.max, deeper.max);
    }
}

pub struct ClimatologyAtlas {
    enabled: bool,
    monthly_template: String,
    seasonal_template: Option<String>,
    radius: usize,
    fetcher: Arc<dyn GridFetcher>,
    slot: GridSlot<ClimatologyBucket, ClimatologyGrids>,
}

impl ClimatologyAtlas {
    pub fn new(config: &ClimatologyConfig, fetcher: Arc<dyn GridFetcher>) -> Self {
        Self {
            enabled: config.enabled,
            monthly_template: config.url_template.clone(),
            seasonal_template: config.seasonal_url_template.clone(),
            radius: config.search_radius,
            fetcher,
            slot: GridSlot::new(),
        }
    }

    fn load(&self, timestamp: DateTime<Utc>) -> Result<Arc<ClimatologyGrids>, AtlasError> {
        let date = timestamp.date_naive();
        self.slot.ensure(ClimatologyBucket::of(timestamp), |bucket| {
            let url = expand_template(&self.monthly_template, CLIMATOLOGY_NAME, date);
            let monthly = Grid::from_bytes(&self.fetcher.get(&url)?)?;
            let seasonal = self.seasonal_template.as_ref().and_then(|template| {
                let url = expand_template(template, CLIMATOLOGY_NAME, date);
                self.fetcher
                    .get(&url)
                    .and_then(|bytes| Grid::from_bytes(&bytes))
                    .map_err(|e| warn!(url = %url, error = %e, "seasonal climatology unavailable"))
                    .ok()
            });
            debug!(?bucket, deep = seasonal.is_some(), "loaded climatology");
            Ok(ClimatologyGrids { monthly, seasonal })
        })
    }
}

fn plausible(temperature: f64, salinity: f64) -> Option<(f64, f64)> {
    (temperature < MAX_PLAUSIBLE_TEMPERATURE && (0.0..MAX_PLAUSIBLE_SALINITY).contains(&salinity))
        .then_some((temperature, salinity))
}

/// Nearest-node levels of `grid` around (`lat`, `lon`).
fn search(grid: &Grid, lat: f64, lon: f64, radius: usize) -> Option<Cast> {
    let center = grid.cell(lat, lon)?;
    let nodes: Vec<(GridCell, f64)> = grid
        .nodes_by_distance(lat, lon, center, radius)
        .into_iter()
        .filter(|(cell, _)| !grid.is_land(*cell))
        .collect();
    let (closest, _) = *nodes.first()?;
    let (origin_lat, origin_lon) = grid.node_position(closest)?;

    let slab = &grid.slabs[0];
    let mean = closest_per_level(&grid.depths, &nodes, |k, cell| {
        plausible(
            grid.value(&slab.temperature, k, cell)?,
            grid.value(&slab.salinity, k, cell)?,
        )
    });

    let (min, max) = match (&slab.temperature_sd, &slab.salinity_sd) {
        (Some(t_sd), Some(s_sd)) => {
            let bound = |sign: f64| {
                closest_per_level(&grid.depths, &nodes, |k, cell| {
                    let (t, s) = plausible(
                        grid.value(&slab.temperature, k, cell)?,
                        grid.value(&slab.salinity, k, cell)?,
                    )?;
                    let dt = grid.value(t_sd, k, cell)?;
                    let ds = grid.value(s_sd, k, cell)?;
                    plausible(t + sign * dt, (s + sign * ds).max(0.0))
                })
            };
            (bound(-1.0), bound(1.0))
        }
        _ => (Vec::new(), Vec::new()),
    };

    Some(Cast {
        mean,
        min,
        max,
        origin: Position::new(origin_lat, origin_lon),
    })
}

impl GridSource for ClimatologyAtlas {
    fn name(&self) -> &str {
        CLIMATOLOGY_NAME
    }

    fn kind(&self) -> AtlasKind {
        AtlasKind::Climatology
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn has_data(&self, timestamp: DateTime<Utc>) -> bool {
        let url = expand_template(&self.monthly_template, CLIMATOLOGY_NAME, timestamp.date_naive());
        self.fetcher.probe(&url).unwrap_or_else(|e| {
            warn!(url = %url, error = %e, "climatology probe failed");
            false
        })
    }

    fn query(&self, lat: f64, lon: f64, timestamp: DateTime<Utc>) -> Option<Profile> {
        if !self.enabled || !Position::new(lat, lon).is_valid() {
            return None;
        }
        let grids = match self.load(timestamp) {
            Ok(grids) => grids,
            Err(e) => {
                warn!(error = %e, "climatology load failed");
                return None;
            }
        };

        let mut cast = search(&grids.monthly, lat, lon, self.radius);
        if let Some(deep) = grids
            .seasonal
            .as_ref()
            .and_then(|g| search(g, lat, lon, self.radius))
        {
            cast = match cast {
                Some(mut upper) => {
                    upper.extend_with(deep);
                    Some(upper)
                }
                None => Some(deep),
            };
        }

        let cast = cast?;
        if cast.mean.is_empty() {
            debug!(lat, lon, "no climatology levels near position");
            return None;
        }

        let kind = AtlasKind::Climatology;
        let meta = synthetic_metadata(cast.origin, timestamp, kind, &grids.monthly.model);
        let mut profile = Profile::new(meta, levels_to_samples(&cast.mean, lat, kind));
        if !cast.min.is_empty() && !cast.max.is_empty() {
            profile.envelope = Some(Envelope {
                min: levels_to_samples(&cast.min, lat, kind),
                max: levels_to_samples(&cast.max, lat, kind),
            });
        }
        Some(profile)
    }

    fn cell_index(&self, lat: f64, lon: f64) -> Option<GridCell> {
        self.slot.resident()?.monthly.cell(lat, lon)
    }

    fn close(&self) {
        self.slot.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::fetch::tests::MapFetcher;
    use crate::atlas::grid::tests::layered_grid;
    use crate::oceanography::sound_speed;
    use chrono::TimeZone;

    const LAT: f64 = 43.0265;
    const LON: f64 = -70.3188;

    fn june() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 16, 12, 0, 0).unwrap()
    }

    fn config() -> ClimatologyConfig {
        ClimatologyConfig {
            enabled: true,
            url_template: "woa_{month}.json".into(),
            seasonal_url_template: Some("woa_{season}.json".into()),
            search_radius: 2,
        }
    }

    fn monthly() -> Grid {
        let mut grid = layered_grid(&[0.0, 100.0], |k, i, j| {
            20.0 - 10.0 * k as f64 - i as f64 * 0.1 + j as f64 * 0.01
        });
        let n = grid.slabs[0].temperature.len();
        grid.slabs[0].temperature_sd = Some(vec![0.5; n]);
        grid.slabs[0].salinity_sd = Some(vec![0.1; n]);
        grid
    }

    fn seasonal() -> Grid {
        layered_grid(&[0.0, 100.0, 500.0, 1500.0], |k, _, _| 18.0 - 4.0 * k as f64)
    }

    fn atlas_with(monthly: Grid) -> (ClimatologyAtlas, Arc<MapFetcher>) {
        let fetcher = Arc::new(MapFetcher::default());
        fetcher.insert("woa_06.json", &monthly);
        fetcher.insert("woa_14.json", &seasonal());
        (ClimatologyAtlas::new(&config(), fetcher.clone()), fetcher)
    }

    #[test]
    fn test_query_merges_monthly_and_seasonal_levels() {
        let (atlas, _) = atlas_with(monthly());
        let profile = atlas.query(LAT, LON, june()).unwrap();

        let depths: Vec<f64> = profile.processed.valid().map(|s| s.depth).collect();
        assert_eq!(depths, vec![0.0, 100.0, 500.0, 1500.0]);

        // Nearest node is (43 N, 290 E) = lat index 3, lon index 4
        let surface = profile.processed.samples[0];
        assert!((surface.temperature - 19.74).abs() < 1e-9);
        assert!((surface.speed - sound_speed(19.74, 35.0, 0.0)).abs() < 1e-9);
        // Deep levels come from the seasonal grid
        assert_eq!(profile.processed.samples[2].temperature, 10.0);

        let origin = profile.meta.position.unwrap();
        assert!((origin.latitude - 43.0).abs() < 1e-9);
        assert!((origin.longitude + 70.0).abs() < 1e-9);
        assert_eq!(profile.meta.timestamp, Some(june()));
        assert_eq!(profile.meta.sensor, crate::SensorType::Synthetic);
        assert_eq!(profile.raw, profile.processed);
    }

    #[test]
    fn test_envelope_brackets_mean() {
        let (atlas, _) = atlas_with(monthly());
        let profile = atlas.query(LAT, LON, june()).unwrap();
        let envelope = profile.envelope.unwrap();
        let mean = profile.processed.samples[0].speed;
        assert!(envelope.min.samples[0].speed < mean);
        assert!(envelope.max.samples[0].speed > mean);
        assert!((envelope.min.samples[0].temperature - 19.24).abs() < 1e-9);
    }

    #[test]
    fn test_land_and_implausible_nodes_are_skipped() {
        let mut grid = monthly();
        let mut land = vec![false; 49];
        land[3 * 7 + 4] = true;
        grid.land = Some(land);
        // Second nearest node (43 N, 289 E) carries an implausible surface value
        grid.slabs[0].temperature[3 * 7 + 3] = 60.0;

        let (atlas, _) = atlas_with(grid);
        let profile = atlas.query(LAT, LON, june()).unwrap();
        let origin = profile.meta.position.unwrap();
        assert!((origin.longitude + 71.0).abs() < 1e-9);

        let surface = profile.processed.samples[0].temperature;
        assert!(surface < 50.0);
        assert!((surface - 19.74).abs() > 1e-9);
    }

    #[test]
    fn test_grid_loaded_once_per_month() {
        let (atlas, fetcher) = atlas_with(monthly());
        let first = atlas.query(LAT, LON, june());
        let second = atlas.query(LAT, LON, june());
        assert_eq!(first, second);
        assert_eq!(fetcher.downloads.lock().len(), 2);
        assert_eq!(atlas.cell_index(LAT, LON), Some(GridCell { lat: 3, lon: 4 }));
    }

    #[test]
    fn test_missing_grid_and_off_grid_answer_none() {
        let (atlas, _) = atlas_with(monthly());
        let january = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        assert!(!atlas.has_data(january));
        assert!(atlas.query(LAT, LON, january).is_none());

        assert!(atlas.has_data(june()));
        assert!(atlas.query(10.0, 10.0, june()).is_none());
        assert!(atlas.query(95.0, 10.0, june()).is_none());
    }

    #[test]
    fn test_closed_source_answers_none() {
        let (atlas, _) = atlas_with(monthly());
        atlas.close();
        atlas.close();
        assert!(atlas.query(LAT, LON, june()).is_none());
        assert!(atlas.cell_index(LAT, LON).is_none());
    }
}
