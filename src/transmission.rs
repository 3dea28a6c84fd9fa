//! # Profile Transmission
//!
//! A [`TransmissionClient`] delivers a profile to one echo sounder control
//! system as a single UDP datagram and, for protocols that report back the
//! profile they applied, confirms the delivery against that echo.
//!
//! ## State Machine
//! ```text
//! Idle → Encoding → Sent → AwaitingConfirmation → Confirmed | Rejected | TimedOut
//!                        ↘ Unconfirmable
//! ```
//!
//! ## Size Budget
//! The device view is thinned with the first tolerance of the configured
//! list; while the encoded sentence exceeds the payload budget the next,
//! coarser tolerance is tried. Nothing is sent when no tolerance fits.
//!
//! ## Confirmation
//! The first applied-profile echo that arrives after sending is compared
//! with the transmitted depth/speed pairs by interpolating the echo at the
//! sent depths that fall inside its depth range. The delivery is confirmed
//! when the largest speed difference is within the speed tolerance.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{net::UdpSocket, sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientsConfig;
use crate::profile::interpolate;
use crate::protocol::{self, EncodeError, SentenceLayout, WireFormat};
use crate::telemetry::{AppliedProfile, Received};
use crate::{thinning, Profile, ProfileSamples};

/// Slack added to the speed tolerance so a difference of exactly the
/// tolerance is accepted despite rounding.
const TOLERANCE_EPSILON: f64 = 1e-9;

/// Control system protocol of a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientProtocol {
    /// Kongsberg SIS: positioned sentence with checksum, echoes the applied
    /// profile
    Sis,
    Hypack,
    Pds2000,
    Qinsy,
}

impl ClientProtocol {
    pub fn wire_format(self) -> WireFormat {
        match self {
            ClientProtocol::Sis => WireFormat::new(SentenceLayout::DepthSpeedTempSal, true),
            ClientProtocol::Hypack => WireFormat::new(SentenceLayout::DepthSpeed, false),
            ClientProtocol::Pds2000 => WireFormat::new(SentenceLayout::DepthSpeedTempSal, false),
            ClientProtocol::Qinsy => WireFormat::new(SentenceLayout::DepthTempSal, false),
        }
    }

    /// True if the client reports the profile it applied.
    pub fn confirms(self) -> bool {
        matches!(self, ClientProtocol::Sis)
    }
}

impl fmt::Display for ClientProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ClientProtocol::Sis => "SIS",
            ClientProtocol::Hypack => "HYPACK",
            ClientProtocol::Pds2000 => "PDS2000",
            ClientProtocol::Qinsy => "QINSY",
        };
        f.write_str(tag)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TargetParseError {
    #[error("expected name:ip:port:protocol[:echo_port], got {0:?}")]
    Format(String),

    #[error("invalid address in {0:?}")]
    Address(String),

    #[error("unknown protocol {0:?}")]
    Protocol(String),
}

impl FromStr for ClientProtocol {
    type Err = TargetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SIS" => Ok(ClientProtocol::Sis),
            "HYPACK" => Ok(ClientProtocol::Hypack),
            "PDS2000" | "PDS" => Ok(ClientProtocol::Pds2000),
            "QINSY" => Ok(ClientProtocol::Qinsy),
            _ => Err(TargetParseError::Protocol(s.to_string())),
        }
    }
}

/// A configured client endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientTarget {
    pub name: String,
    pub address: SocketAddr,
    pub protocol: ClientProtocol,
    /// Local port on which this client's applied-profile echo arrives
    pub echo_port: Option<u16>,
}

impl FromStr for ClientTarget {
    type Err = TargetParseError;

    /// Parse `name:ip:port:protocol[:echo_port]` (IPv4).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').map(str::trim).collect();
        if !(4..=5).contains(&parts.len()) || parts[0].is_empty() {
            return Err(TargetParseError::Format(s.to_string()));
        }
        let address = format!("{}:{}", parts[1], parts[2])
            .parse()
            .map_err(|_| TargetParseError::Address(s.to_string()))?;
        let echo_port = parts
            .get(4)
            .map(|p| p.parse().map_err(|_| TargetParseError::Address(s.to_string())))
            .transpose()?;
        Ok(ClientTarget {
            name: parts[0].to_string(),
            address,
            protocol: parts[3].parse()?,
            echo_port,
        })
    }
}

/// Encoding and confirmation policy shared by all clients.
#[derive(Clone, Debug, PartialEq)]
pub struct TransmitSettings {
    /// Thinning tolerances (m/s), finest first
    pub tolerances: Vec<f64>,
    pub max_payload: usize,
    /// Largest accepted |Δspeed| between sent and echoed profile
    pub speed_tolerance: f64,
    pub confirm_wait: Duration,
    pub poll_interval: Duration,
}

impl From<&ClientsConfig> for TransmitSettings {
    fn from(config: &ClientsConfig) -> Self {
        Self {
            tolerances: config.tolerances.clone(),
            max_payload: config.max_payload,
            speed_tolerance: config.speed_tolerance,
            confirm_wait: Duration::from_secs(config.confirm_wait_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }
}

impl Default for TransmitSettings {
    fn default() -> Self {
        Self::from(&ClientsConfig::default())
    }
}

#[derive(Error, Debug)]
pub enum TransmitError {
    #[error("encoded profile is {size} bytes, budget is {budget}")]
    EncodingOverflow { size: usize, budget: usize },

    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("client {0} has no echo channel")]
    NoEcho(String),
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub enum TransmissionOutcome {
    /// Sent to a client that cannot confirm
    DeliveredUnconfirmed,
    /// Echo matched; carries the echoed profile time
    DeliveredConfirmed { profile_time: DateTime<Utc> },
    /// Echo differed by `max_delta` m/s at `depth` m
    DeliveredRejected { max_delta: f64, depth: f64 },
    TimedOut,
    SendFailed(TransmitError),
}

impl TransmissionOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, TransmissionOutcome::DeliveredRejected { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionState {
    Idle,
    Encoding,
    Sent,
    AwaitingConfirmation,
    Unconfirmable,
    Confirmed,
    Rejected,
    TimedOut,
    Failed,
}

/// The encoded device view chosen for a client.
#[derive(Clone, Debug, PartialEq)]
pub struct FittedProfile {
    pub tolerance: f64,
    pub device: ProfileSamples,
    pub bytes: Vec<u8>,
}

/// Thin and encode `profile` with the finest tolerance whose sentence fits
/// in `settings.max_payload`.
pub fn fit(
    profile: &Profile,
    format: WireFormat,
    settings: &TransmitSettings,
) -> Result<FittedProfile, TransmitError> {
    let mut size = 0;
    for &tolerance in &settings.tolerances {
        let device = thinning::thin(&profile.processed, tolerance, profile.reference_latitude());
        let bytes = protocol::encode(&device, &profile.meta, format)?;
        if bytes.len() <= settings.max_payload {
            return Ok(FittedProfile {
                tolerance,
                device,
                bytes,
            });
        }
        debug!(tolerance, size = bytes.len(), "sentence over budget, coarsening");
        size = bytes.len();
    }
    Err(TransmitError::EncodingOverflow {
        size,
        budget: settings.max_payload,
    })
}

/// Depth/speed pairs as the client reads them from the sentence, rounded to
/// the sentence's two decimals.
fn wire_pairs(fitted: &FittedProfile) -> Vec<(f64, f64)> {
    match protocol::decode(&fitted.bytes) {
        Ok(sentence) => sentence.depth_speed_pairs(),
        Err(e) => {
            warn!(error = %e, "own sentence does not decode, comparing unrounded values");
            fitted.device.depth_speed_pairs()
        }
    }
}

/// Largest speed difference between `sent` and the `echoed` profile and the
/// depth where it occurs, over the sent depths inside the echoed range.
/// `None` when the ranges do not overlap.
pub fn max_speed_difference(sent: &[(f64, f64)], echoed: &[(f64, f64)]) -> Option<(f64, f64)> {
    let mut echoed = echoed.to_vec();
    echoed.sort_by(|a, b| a.0.total_cmp(&b.0));

    sent.iter()
        .filter_map(|&(depth, speed)| {
            interpolate(&echoed, depth).map(|echo| ((echo - speed).abs(), depth))
        })
        .fold(None, |worst: Option<(f64, f64)>, candidate| match worst {
            Some(w) if w.0 >= candidate.0 => Some(w),
            _ => Some(candidate),
        })
}

type EchoReceiver = watch::Receiver<Option<Received<AppliedProfile>>>;

/// Delivery to one client.
pub struct TransmissionClient {
    target: ClientTarget,
    settings: TransmitSettings,
    echo: Option<EchoReceiver>,
    state: TransmissionState,
    alive: bool,
    consecutive_timeouts: u32,
    last_confirmed: Option<DateTime<Utc>>,
}

impl TransmissionClient {
    pub fn new(target: ClientTarget, settings: TransmitSettings) -> Self {
        Self {
            target,
            settings,
            echo: None,
            state: TransmissionState::Idle,
            alive: true,
            consecutive_timeouts: 0,
            last_confirmed: None,
        }
    }

    /// Attach the applied-profile channel fed by this client's echo listener.
    pub fn with_echo(mut self, echo: EchoReceiver) -> Self {
        self.echo = Some(echo);
        self
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn target(&self) -> &ClientTarget {
        &self.target
    }

    pub fn state(&self) -> TransmissionState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// True if this client can confirm deliveries.
    pub fn confirms(&self) -> bool {
        self.target.protocol.confirms() && self.echo.is_some()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Profile time echoed by this client's last confirmed delivery.
    pub fn last_confirmed(&self) -> Option<DateTime<Utc>> {
        self.last_confirmed
    }

    pub(crate) fn mark_dead(&mut self) {
        self.alive = false;
    }

    pub(crate) fn revive(&mut self) {
        self.alive = true;
        self.consecutive_timeouts = 0;
    }

    async fn send_datagram(&self, bytes: &[u8]) -> Result<(), TransmitError> {
        let local: SocketAddr = match self.target.address {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        socket.send_to(bytes, self.target.address).await?;
        Ok(())
    }

    /// Forget any echo that arrived before now.
    fn mark_echo_seen(&mut self) {
        if let Some(echo) = self.echo.as_mut() {
            drop(echo.borrow_and_update());
        }
    }

    /// Wait for the next echo within the confirmation budget, polling at
    /// the configured interval. `None` on timeout or cancellation.
    async fn await_echo(&mut self, cancel: &CancellationToken) -> Option<AppliedProfile> {
        let echo = self.echo.as_mut()?;
        let deadline = Instant::now() + self.settings.confirm_wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let wait = remaining.min(self.settings.poll_interval);
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return None,

                changed = tokio::time::timeout(wait, echo.changed()) => match changed {
                    Ok(Ok(())) => {
                        if let Some(received) = echo.borrow_and_update().clone() {
                            return Some(received.value);
                        }
                    }
                    // Listener gone: no echo can arrive any more
                    Ok(Err(_)) => return None,
                    Err(_) => {}
                },
            }
        }
    }

    /// Deliver `profile` and, if possible, confirm it.
    pub async fn send(
        &mut self,
        profile: &Profile,
        cancel: &CancellationToken,
    ) -> TransmissionOutcome {
        self.state = TransmissionState::Encoding;
        let fitted = match fit(profile, self.target.protocol.wire_format(), &self.settings) {
            Ok(fitted) => fitted,
            Err(e) => {
                warn!(client = %self.target.name, error = %e, "profile not sent");
                self.state = TransmissionState::Failed;
                return TransmissionOutcome::SendFailed(e);
            }
        };

        self.mark_echo_seen();
        if let Err(e) = self.send_datagram(&fitted.bytes).await {
            warn!(client = %self.target.name, error = %e, "send failed");
            self.state = TransmissionState::Failed;
            return TransmissionOutcome::SendFailed(e);
        }
        self.state = TransmissionState::Sent;
        debug!(
            client = %self.target.name,
            bytes = fitted.bytes.len(),
            tolerance = fitted.tolerance,
            samples = fitted.device.valid_count(),
            "profile sent"
        );

        if !self.confirms() {
            self.state = TransmissionState::Unconfirmable;
            return TransmissionOutcome::DeliveredUnconfirmed;
        }

        self.state = TransmissionState::AwaitingConfirmation;
        let Some(applied) = self.await_echo(cancel).await else {
            self.consecutive_timeouts += 1;
            self.state = TransmissionState::TimedOut;
            warn!(
                client = %self.target.name,
                consecutive = self.consecutive_timeouts,
                "no confirmation received"
            );
            return TransmissionOutcome::TimedOut;
        };
        self.consecutive_timeouts = 0;

        let sent = wire_pairs(&fitted);
        match max_speed_difference(&sent, &applied.pairs) {
            Some((max_delta, depth))
                if max_delta <= self.settings.speed_tolerance + TOLERANCE_EPSILON =>
            {
                self.state = TransmissionState::Confirmed;
                self.last_confirmed = Some(applied.profile_time);
                info!(client = %self.target.name, max_delta, depth, "transmission confirmed");
                TransmissionOutcome::DeliveredConfirmed {
                    profile_time: applied.profile_time,
                }
            }
            Some((max_delta, depth)) => {
                self.state = TransmissionState::Rejected;
                warn!(client = %self.target.name, max_delta, depth, "transmission rejected");
                TransmissionOutcome::DeliveredRejected { max_delta, depth }
            }
            None => {
                self.state = TransmissionState::Rejected;
                let depth = sent.first().map_or(0.0, |p| p.0);
                warn!(client = %self.target.name, "echoed profile does not overlap sent depths");
                TransmissionOutcome::DeliveredRejected {
                    max_delta: f64::INFINITY,
                    depth,
                }
            }
        }
    }

    /// Ask the client for the profile it currently applies.
    ///
    /// `Ok(None)` when no echo arrives within the confirmation budget.
    pub async fn request_applied_profile(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<AppliedProfile>, TransmitError> {
        if !self.confirms() {
            return Err(TransmitError::NoEcho(self.target.name.clone()));
        }
        self.mark_echo_seen();
        self.send_datagram(&protocol::encode_profile_request())
            .await?;
        Ok(self.await_echo(cancel).await)
    }
}
