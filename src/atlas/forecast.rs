//! Daily ocean forecast source, global or regional.
//!
//! Forecast grids store potential temperature referenced to the grid's
//! reference pressure; each level is converted to in-situ temperature at the
//! level's own pressure before sound speed is derived.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, warn};

use super::fetch::{expand_template, GridFetcher};
use super::{
    closest_per_level, levels_to_samples, synthetic_metadata, AtlasError, Grid, GridCell,
    GridSlot, GridSource,
};
use crate::config::{ForecastConfig, RegionalConfig};
use crate::oceanography::{depth_to_pressure, in_situ_temperature};
use crate::{AtlasKind, Position, Profile};

/// Name under which the global forecast is selected in configuration.
pub const GLOBAL_FORECAST_NAME: &str = "global_forecast";

pub struct ForecastAtlas {
    name: String,
    kind: AtlasKind,
    model: String,
    template: String,
    enabled: bool,
    radius: usize,
    fetcher: Arc<dyn GridFetcher>,
    slot: GridSlot<NaiveDate, Grid>,
}

impl ForecastAtlas {
    pub fn global(config: &ForecastConfig, fetcher: Arc<dyn GridFetcher>) -> Self {
        Self {
            name: GLOBAL_FORECAST_NAME.to_string(),
            kind: AtlasKind::GlobalForecast,
            model: config.model.clone(),
            template: config.url_template.clone(),
            enabled: config.enabled,
            radius: config.search_radius,
            fetcher,
            slot: GridSlot::new(),
        }
    }

    pub fn regional(config: &RegionalConfig, fetcher: Arc<dyn GridFetcher>) -> Self {
        Self {
            name: config.name.clone(),
            kind: AtlasKind::RegionalForecast,
            model: config.model.clone(),
            template: config.url_template.clone(),
            enabled: config.enabled,
            radius: config.search_radius,
            fetcher,
            slot: GridSlot::new(),
        }
    }

    fn url(&self, day: NaiveDate) -> String {
        expand_template(&self.template, &self.model, day)
    }

    fn fetch_day(&self, day: NaiveDate) -> Result<Grid, AtlasError> {
        Grid::from_bytes(&self.fetcher.get(&self.url(day))?)
    }

    /// Grid for the day of `timestamp`. When that day is not published yet
    /// the previous day's forecast is used instead, once.
    fn load(&self, timestamp: DateTime<Utc>) -> Result<Arc<Grid>, AtlasError> {
        self.slot.ensure(timestamp.date_naive(), |day| {
            match self.fetch_day(*day) {
                Ok(grid) => Ok(grid),
                Err(e) => {
                    let previous = day.pred_opt().ok_or(e)?;
                    info!(source = %self.name, %day, "forecast unavailable, trying previous day");
                    self.fetch_day(previous)
                }
            }
        })
    }

    fn probe(&self, day: NaiveDate) -> bool {
        let url = self.url(day);
        self.fetcher.probe(&url).unwrap_or_else(|e| {
            warn!(source = %self.name, url = %url, error = %e, "forecast probe failed");
            false
        })
    }
}

impl GridSource for ForecastAtlas {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> AtlasKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn has_data(&self, timestamp: DateTime<Utc>) -> bool {
        let day = timestamp.date_naive();
        self.probe(day) || day.pred_opt().is_some_and(|previous| self.probe(previous))
    }

    fn query(&self, lat: f64, lon: f64, timestamp: DateTime<Utc>) -> Option<Profile> {
        if !self.enabled || !Position::new(lat, lon).is_valid() {
            return None;
        }
        let grid = match self.load(timestamp) {
            Ok(grid) => grid,
            Err(e) => {
                warn!(source = %self.name, error = %e, "forecast load failed");
                return None;
            }
        };

        let center = grid.cell(lat, lon)?;
        let slab = grid.nearest_slab(timestamp);
        let nodes: Vec<(GridCell, f64)> = grid
            .nodes_by_distance(lat, lon, center, self.radius)
            .into_iter()
            .filter(|(cell, _)| !grid.is_land(*cell) && grid.has_data(slab, *cell))
            .collect();
        let Some(&(closest, _)) = nodes.first() else {
            debug!(source = %self.name, lat, lon, "no forecast data near position");
            return None;
        };

        let levels = closest_per_level(&grid.depths, &nodes, |k, cell| {
            let potential = grid.value(&slab.temperature, k, cell)?;
            let salinity = grid.value(&slab.salinity, k, cell)?;
            let pressure = depth_to_pressure(grid.depths[k], lat);
            let temperature =
                in_situ_temperature(salinity, potential, grid.reference_pressure, pressure);
            Some((temperature, salinity))
        });
        if levels.is_empty() {
            return None;
        }

        let (origin_lat, origin_lon) = grid.node_position(closest)?;
        let meta = synthetic_metadata(
            Position::new(origin_lat, origin_lon),
            timestamp,
            self.kind,
            &self.model,
        );
        Some(Profile::new(meta, levels_to_samples(&levels, lat, self.kind)))
    }

    fn cell_index(&self, lat: f64, lon: f64) -> Option<GridCell> {
        self.slot.resident()?.cell(lat, lon)
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
    use crate::oceanography::potential_temperature;
    use chrono::TimeZone;

    const LAT: f64 = 43.0265;
    const LON: f64 = -70.3188;

    fn config() -> ForecastConfig {
        ForecastConfig {
            enabled: true,
            model: "rtofs".into(),
            url_template: "{model}_{date}.json".into(),
            search_radius: 5,
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, day, 6, 0, 0).unwrap()
    }

    fn forecast_grid() -> Grid {
        let mut grid = layered_grid(&[0.0, 50.0, 1000.0], |k, _, _| 12.0 - 3.0 * k as f64);
        grid.reference_pressure = 2000.0;
        grid
    }

    #[test]
    fn test_query_converts_potential_temperature() {
        let fetcher = Arc::new(MapFetcher::default());
        fetcher.insert("rtofs_20240616.json", &forecast_grid());
        let atlas = ForecastAtlas::global(&config(), fetcher);

        let profile = atlas.query(LAT, LON, at(16)).unwrap();
        assert_eq!(profile.processed.len(), 3);
        assert_eq!(profile.meta.probe, crate::ProbeType::Atlas(AtlasKind::GlobalForecast));

        let deep = profile.processed.samples[2];
        let pressure = depth_to_pressure(1000.0, LAT);
        // Inverting the conversion recovers the stored potential temperature
        let theta = potential_temperature(35.0, deep.temperature, pressure, 2000.0);
        assert!((theta - 6.0).abs() < 1e-3, "got {theta}");
        assert!(deep.temperature != 6.0);
    }

    #[test]
    fn test_missing_cells_are_masked() {
        let mut grid = forecast_grid();
        // Blank the nearest node at every level
        let nodes = 49;
        for k in 0..3 {
            grid.slabs[0].temperature[k * nodes + 3 * 7 + 4] = -999.0;
        }
        let fetcher = Arc::new(MapFetcher::default());
        fetcher.insert("rtofs_20240616.json", &grid);
        let atlas = ForecastAtlas::global(&config(), fetcher);

        let profile = atlas.query(LAT, LON, at(16)).unwrap();
        let origin = profile.meta.position.unwrap();
        assert!((origin.longitude + 71.0).abs() < 1e-9);
        assert_eq!(profile.processed.len(), 3);
    }

    #[test]
    fn test_falls_back_to_previous_day() {
        let fetcher = Arc::new(MapFetcher::default());
        fetcher.insert("rtofs_20240615.json", &forecast_grid());
        let atlas = ForecastAtlas::global(&config(), fetcher.clone());

        assert!(atlas.has_data(at(16)));
        assert!(atlas.query(LAT, LON, at(16)).is_some());
        assert_eq!(
            *fetcher.downloads.lock(),
            vec!["rtofs_20240616.json".to_string(), "rtofs_20240615.json".to_string()]
        );

        // Two days missing: no data, no panic
        assert!(atlas.query(LAT, LON, at(18)).is_none());
    }

    #[test]
    fn test_new_day_evicts_resident_grid() {
        let fetcher = Arc::new(MapFetcher::default());
        fetcher.insert("rtofs_20240616.json", &forecast_grid());
        fetcher.insert("rtofs_20240617.json", &forecast_grid());
        let atlas = ForecastAtlas::global(&config(), fetcher.clone());

        atlas.query(LAT, LON, at(16)).unwrap();
        atlas.query(LAT, LON, at(16)).unwrap();
        atlas.query(LAT, LON, at(17)).unwrap();
        assert_eq!(fetcher.downloads.lock().len(), 2);
    }

    #[test]
    fn test_regional_source_identity() {
        let regional = RegionalConfig {
            name: "gulf_of_maine".into(),
            enabled: true,
            model: "gomofs".into(),
            url_template: "{model}_{date}.json".into(),
            search_radius: 3,
        };
        let fetcher = Arc::new(MapFetcher::default());
        fetcher.insert("gomofs_20240616.json", &forecast_grid());
        let atlas = ForecastAtlas::regional(&regional, fetcher);

        assert_eq!(atlas.name(), "gulf_of_maine");
        assert_eq!(atlas.kind(), AtlasKind::RegionalForecast);
        let profile = atlas.query(LAT, LON, at(16)).unwrap();
        assert_eq!(profile.meta.serial.as_deref(), Some("gomofs"));
    }

    #[test]
    fn test_query_is_deterministic() {
        let fetcher = Arc::new(MapFetcher::default());
        fetcher.insert("rtofs_20240616.json", &forecast_grid());
        let atlas = ForecastAtlas::global(&config(), fetcher);
        let a = atlas.query(LAT, LON, at(16)).unwrap();
        let b = atlas.query(LAT, LON, at(16)).unwrap();
        assert_eq!(a, b);
    }
}
