//! # Synthetic Profile Server
//!
//! Periodically turns the vessel's latest position into an atlas profile and
//! delivers it to every live client.
//!
//! ## States
//! `Stopped → Running → Stopped | Faulted`
//!
//! ## One Iteration
//! 1. Read the latest navigation fix; without a fresh one wait out the
//!    recovery window.
//! 2. Skip when the position is still in the last grid cell and the surface
//!    sound speed has not moved by the threshold, unless a refresh was forced.
//! 3. Query the source on the blocking pool.
//! 4. Splice in the surface sound speed reading and rebuild the device view.
//! 5. Check that confirming clients still apply what they last confirmed.
//! 6. Transmit, persist, and remember cell and surface speed.
//!
//! Per-iteration failures are logged and the loop continues. A protocol
//! fault or the loss of every client stops the server as `Faulted`.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{sync::watch, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::atlas::{GridCell, GridSource};
use crate::config::Config;
use crate::profile::insert_surface_reading;
use crate::registry::{BatchReport, ClientRegistry, RegistryError};
use crate::session::Session;
use crate::store::ProfileId;
use crate::telemetry::{NavigationFix, Received, SurfaceReading, TelemetryHub};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running,
    Faulted,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("cannot start: {0}")]
    Settings(String),

    #[error("client {client} applies profile {echoed}, last confirmed {expected}")]
    ProtocolFault {
        client: String,
        expected: DateTime<Utc>,
        echoed: DateTime<Utc>,
    },

    #[error("no live clients")]
    NoLiveClients,

    #[error("grid task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ServerError {
    /// Errors that stop the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServerError::ProtocolFault { .. } | ServerError::NoLiveClients
        )
    }
}

impl From<RegistryError> for ServerError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::MarkerMismatch {
                client,
                expected,
                echoed,
            } => ServerError::ProtocolFault {
                client,
                expected,
                echoed,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerSettings {
    pub poll_interval: Duration,
    pub recovery: Duration,
    /// Telemetry older than this counts as missing
    pub stale_after: Duration,
    pub surface_correction: bool,
    /// Surface speed change (m/s) that forces a new profile in the same cell
    pub speed_delta_threshold: f64,
    /// Tolerance (m/s) used for the stored device view
    pub device_tolerance: f64,
}

impl From<&Config> for ServerSettings {
    fn from(config: &Config) -> Self {
        let server = &config.server;
        Self {
            poll_interval: Duration::from_secs(server.poll_secs.max(1)),
            recovery: Duration::from_secs(server.recovery_secs),
            stale_after: Duration::from_secs(server.stale_after_secs),
            surface_correction: server.surface_correction,
            speed_delta_threshold: server.speed_delta_threshold,
            device_tolerance: config.clients.tolerances.first().copied().unwrap_or(0.01),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Handle that makes the next iteration ignore the skip rule once.
#[derive(Clone, Debug, Default)]
pub struct ForceRefresh(Arc<AtomicBool>);

impl ForceRefresh {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum StepOutcome {
    NoTelemetry,
    /// Same cell, surface speed steady
    Skipped,
    /// The source had nothing at this position
    NoData,
    /// `stored` is `None` when the store refused the profile
    Transmitted {
        report: BatchReport,
        stored: Option<ProfileId>,
    },
}

pub struct SyntheticProfileServer {
    source: Arc<dyn GridSource>,
    registry: ClientRegistry,
    session: Session,
    navigation: watch::Receiver<Option<Received<NavigationFix>>>,
    surface: watch::Receiver<Option<Received<SurfaceReading>>>,
    settings: ServerSettings,
    force: ForceRefresh,
    state: ServerState,
    last_cell: Option<GridCell>,
    last_surface_speed: Option<f64>,
}

impl SyntheticProfileServer {
    pub fn new(
        source: Arc<dyn GridSource>,
        registry: ClientRegistry,
        session: Session,
        telemetry: &TelemetryHub,
        settings: ServerSettings,
    ) -> Self {
        Self {
            source,
            registry,
            session,
            navigation: telemetry.navigation(),
            surface: telemetry.surface(),
            settings,
            force: ForceRefresh::default(),
            state: ServerState::Stopped,
            last_cell: None,
            last_surface_speed: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn force_refresh(&self) -> ForceRefresh {
        self.force.clone()
    }

    fn fresh<T: Clone>(&self, rx: &watch::Receiver<Option<Received<T>>>) -> Option<T> {
        rx.borrow()
            .as_ref()
            .filter(|r| r.at.elapsed() <= self.settings.stale_after)
            .map(|r| r.value.clone())
    }

    /// Refuse to start unless the source is usable, navigation is live (and
    /// surface sound speed too when surface correction is on) and a
    /// confirming client answers.
    pub async fn check_settings(&mut self, cancel: &CancellationToken) -> Result<(), ServerError> {
        if !self.source.is_enabled() {
            return Err(ServerError::Settings(format!(
                "source {} is disabled",
                self.source.name()
            )));
        }
        let source = self.source.clone();
        let now = Utc::now();
        if !tokio::task::spawn_blocking(move || source.has_data(now)).await? {
            return Err(ServerError::Settings(format!(
                "source {} has no data for {}",
                self.source.name(),
                now.date_naive()
            )));
        }
        if self.fresh(&self.navigation).is_none() {
            return Err(ServerError::Settings("no live navigation telemetry".into()));
        }
        if self.settings.surface_correction && self.fresh(&self.surface).is_none() {
            return Err(ServerError::Settings(
                "surface correction is on but no live surface sound speed".into(),
            ));
        }
        if self.registry.check_round_trip(cancel).await == 0 {
            return Err(ServerError::Settings(
                "no confirming client answered a profile request".into(),
            ));
        }
        Ok(())
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// One iteration of the server loop.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<StepOutcome, ServerError> {
        if self.registry.live_count() == 0 {
            return Err(ServerError::NoLiveClients);
        }

        let Some(fix) = self.fresh(&self.navigation) else {
            debug!("no fresh navigation fix");
            self.sleep(self.settings.recovery, cancel).await;
            return Ok(StepOutcome::NoTelemetry);
        };
        let (lat, lon) = (fix.position.latitude, fix.position.longitude);
        let reading = self.fresh(&self.surface);

        let cell = self.source.cell_index(lat, lon);
        let speed_delta = match (reading.map(|r| r.speed), self.last_surface_speed) {
            (Some(now), Some(last)) => (now - last).abs(),
            (Some(_), None) => f64::INFINITY,
            (None, _) => 0.0,
        };
        let forced = self.force.take();
        if !forced
            && cell.is_some()
            && cell == self.last_cell
            && speed_delta < self.settings.speed_delta_threshold
        {
            return Ok(StepOutcome::Skipped);
        }

        let source = self.source.clone();
        let time = fix.time;
        let Some(mut profile) =
            tokio::task::spawn_blocking(move || source.query(lat, lon, time)).await?
        else {
            info!(source = %self.source.name(), lat, lon, "no atlas data at position");
            return Ok(StepOutcome::NoData);
        };

        if self.settings.surface_correction {
            if let Some(reading) = reading {
                let corrected =
                    insert_surface_reading(&profile.processed, reading.draft, reading.speed, lat);
                profile.replace_processed(corrected);
            }
        }
        profile.rebuild_device_view(self.settings.device_tolerance);

        self.registry.verify_confirmed_markers(cancel).await?;

        let report = self.registry.transmit_all(&profile, cancel).await;
        info!(
            lat,
            lon,
            clients = report.outcomes.len(),
            confirmed = report.confirmed(),
            success = report.success,
            "profile transmitted"
        );
        let stored = match self.session.commit(profile) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, lat, lon, "transmitted profile not stored, continuing");
                None
            }
        };

        self.last_cell = self.source.cell_index(lat, lon);
        self.last_surface_speed = reading.map(|r| r.speed);

        if self.registry.live_count() == 0 {
            return Err(ServerError::NoLiveClients);
        }
        Ok(StepOutcome::Transmitted { report, stored })
    }

    /// Run until `cancel` fires or a fatal error occurs.
    pub async fn run(&mut self, cancel: CancellationToken) -> ServerState {
        self.state = ServerState::Running;
        info!(source = %self.source.name(), clients = self.registry.live_count(), "server started");

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.step(&cancel).await {
                Ok(outcome) => debug!(?outcome, "iteration done"),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "server faulted");
                    self.state = ServerState::Faulted;
                    self.source.close();
                    return self.state;
                }
                Err(e) => warn!(error = %e, "iteration failed"),
            }
        }

        self.source.close();
        self.state = ServerState::Stopped;
        info!("server stopped");
        self.state
    }
}
