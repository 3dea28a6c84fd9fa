//! # Telemetry Datagrams and Listeners
//!
//! Navigation and echo sounder systems publish small binary datagrams over
//! UDP. A [`Listener`] task owns one socket, decodes every datagram and
//! publishes the result into a [`TelemetryHub`]: one single-slot
//! `tokio::sync::watch` channel per stream, last write wins. Consumers read
//! the latest value whenever they need it and never call into the listener.
//!
//! ## Frame Layout (little-endian)
//! ```text
//! 0x02 | kind u8 | payload_len u16 | date u32 (YYYYMMDD) | time u32 (ms of day)
//!      | payload | 0x03 | checksum u16
//! ```
//! The checksum is the wrapping 16-bit sum of the bytes from `kind` through
//! the end of the payload.
//!
//! | Kind | Stream                | Payload                                          |
//! |------|-----------------------|--------------------------------------------------|
//! | `P`  | position              | lat i32, lon i32 (1e-7 degree)                   |
//! | `G`  | surface sound speed   | speed u32 (cm/s), draft u32 (mm)                 |
//! | `U`  | applied profile       | date u32, time u32, count u16, count × (depth u32 cm, speed u32 cm/s) |

use std::{net::SocketAddr, sync::Arc, time::Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use thiserror::Error;
use tokio::{net::UdpSocket, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Position;

const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const HEADER_LEN: usize = 12;
const TRAILER_LEN: usize = 3;

pub const KIND_POSITION: u8 = b'P';
pub const KIND_SURFACE: u8 = b'G';
pub const KIND_APPLIED: u8 = b'U';

/// Fixed-point scale of position datagrams.
const DEGREE_SCALE: f64 = 1e7;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("bad framing: {0}")]
    Framing(&'static str),

    #[error("checksum mismatch: computed {computed:#06x}, datagram says {stated:#06x}")]
    Checksum { computed: u16, stated: u16 },

    #[error("unknown datagram kind {0:#04x}")]
    UnknownKind(u8),

    #[error("invalid date/time field")]
    BadTimestamp,
}

/// Vessel position report.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NavigationFix {
    pub time: DateTime<Utc>,
    pub position: Position,
}

/// Surface sound speed measured at the transducer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceReading {
    pub time: DateTime<Utc>,
    /// m/s
    pub speed: f64,
    /// Transducer depth (m)
    pub draft: f64,
}

/// Profile an echo sounder reports as currently applied.
#[derive(Clone, Debug, PartialEq)]
pub struct AppliedProfile {
    pub time: DateTime<Utc>,
    /// Acquisition time of the applied profile, as sent to the device
    pub profile_time: DateTime<Utc>,
    /// (depth m, speed m/s)
    pub pairs: Vec<(f64, f64)>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Datagram {
    Position(NavigationFix),
    Surface(SurfaceReading),
    Applied(AppliedProfile),
}

/// A telemetry value with its local arrival time.
#[derive(Clone, Debug, PartialEq)]
pub struct Received<T> {
    pub value: T,
    pub at: Instant,
}

fn sum16(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}

fn put_timestamp(buf: &mut BytesMut, time: DateTime<Utc>) {
    let date = time.year() as u32 * 10_000 + time.month() * 100 + time.day();
    let millis = time.num_seconds_from_midnight() * 1000 + time.nanosecond() / 1_000_000;
    buf.put_u32_le(date);
    buf.put_u32_le(millis);
}

fn get_timestamp(buf: &mut impl Buf) -> Result<DateTime<Utc>, TelemetryError> {
    let date = buf.get_u32_le();
    let millis = buf.get_u32_le();
    let day = NaiveDate::from_ymd_opt((date / 10_000) as i32, (date / 100) % 100, date % 100)
        .ok_or(TelemetryError::BadTimestamp)?;
    let time = NaiveTime::from_num_seconds_from_midnight_opt(millis / 1000, (millis % 1000) * 1_000_000)
        .ok_or(TelemetryError::BadTimestamp)?;
    Ok(Utc.from_utc_datetime(&day.and_time(time)))
}

/// Most depth/speed pairs an applied-profile frame carries: timestamp, count
/// and pairs must fit the `u16` payload length.
pub const MAX_APPLIED_PAIRS: usize = (u16::MAX as usize - 10) / 8;

fn to_fixed(value: f64, scale: f64) -> u32 {
    (value * scale).round().clamp(0.0, u32::MAX as f64) as u32
}

/// Serialize a datagram into one frame.
pub fn encode(datagram: &Datagram) -> Bytes {
    let mut payload = BytesMut::new();
    let (kind, time) = match datagram {
        Datagram::Position(fix) => {
            payload.put_i32_le((fix.position.latitude * DEGREE_SCALE).round() as i32);
            payload.put_i32_le((fix.position.longitude * DEGREE_SCALE).round() as i32);
            (KIND_POSITION, fix.time)
        }
        Datagram::Surface(reading) => {
            payload.put_u32_le(to_fixed(reading.speed, 100.0));
            payload.put_u32_le(to_fixed(reading.draft, 1000.0));
            (KIND_SURFACE, reading.time)
        }
        Datagram::Applied(applied) => {
            put_timestamp(&mut payload, applied.profile_time);
            let count = applied.pairs.len().min(MAX_APPLIED_PAIRS);
            if count < applied.pairs.len() {
                warn!(pairs = applied.pairs.len(), kept = count, "applied profile truncated");
            }
            payload.put_u16_le(count as u16);
            for &(depth, speed) in applied.pairs.iter().take(count) {
                payload.put_u32_le(to_fixed(depth, 100.0));
                payload.put_u32_le(to_fixed(speed, 100.0));
            }
            (KIND_APPLIED, applied.time)
        }
    };

    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    frame.put_u8(STX);
    frame.put_u8(kind);
    frame.put_u16_le(payload.len() as u16);
    put_timestamp(&mut frame, time);
    frame.put_slice(&payload);
    let checksum = sum16(&frame[1..]);
    frame.put_u8(ETX);
    frame.put_u16_le(checksum);
    frame.freeze()
}

/// Parse one frame.
pub fn decode(bytes: &[u8]) -> Result<Datagram, TelemetryError> {
    if bytes.len() < HEADER_LEN + TRAILER_LEN {
        return Err(TelemetryError::Truncated(bytes.len()));
    }
    if bytes[0] != STX {
        return Err(TelemetryError::Framing("missing start byte"));
    }
    let kind = bytes[1];
    let payload_len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    let end = HEADER_LEN + payload_len;
    if bytes.len() != end + TRAILER_LEN {
        return Err(TelemetryError::Framing("length does not match payload size"));
    }
    if bytes[end] != ETX {
        return Err(TelemetryError::Framing("missing end byte"));
    }
    let stated = u16::from_le_bytes([bytes[end + 1], bytes[end + 2]]);
    let computed = sum16(&bytes[1..end]);
    if stated != computed {
        return Err(TelemetryError::Checksum { computed, stated });
    }

    let mut header = &bytes[4..HEADER_LEN];
    let time = get_timestamp(&mut header)?;
    let mut payload = &bytes[HEADER_LEN..end];

    let datagram = match kind {
        KIND_POSITION => {
            if payload.remaining() < 8 {
                return Err(TelemetryError::Truncated(bytes.len()));
            }
            let latitude = f64::from(payload.get_i32_le()) / DEGREE_SCALE;
            let longitude = f64::from(payload.get_i32_le()) / DEGREE_SCALE;
            Datagram::Position(NavigationFix {
                time,
                position: Position::new(latitude, longitude),
            })
        }
        KIND_SURFACE => {
            if payload.remaining() < 8 {
                return Err(TelemetryError::Truncated(bytes.len()));
            }
            Datagram::Surface(SurfaceReading {
                time,
                speed: f64::from(payload.get_u32_le()) / 100.0,
                draft: f64::from(payload.get_u32_le()) / 1000.0,
            })
        }
        KIND_APPLIED => {
            if payload.remaining() < 10 {
                return Err(TelemetryError::Truncated(bytes.len()));
            }
            let profile_time = get_timestamp(&mut payload)?;
            let count = payload.get_u16_le() as usize;
            if payload.remaining() != count * 8 {
                return Err(TelemetryError::Framing("pair count does not match payload"));
            }
            let pairs = (0..count)
                .map(|_| {
                    let depth = f64::from(payload.get_u32_le()) / 100.0;
                    let speed = f64::from(payload.get_u32_le()) / 100.0;
                    (depth, speed)
                })
                .collect();
            Datagram::Applied(AppliedProfile {
                time,
                profile_time,
                pairs,
            })
        }
        other => return Err(TelemetryError::UnknownKind(other)),
    };
    Ok(datagram)
}

/// Latest-value channels for every telemetry stream.
pub struct TelemetryHub {
    navigation: watch::Sender<Option<Received<NavigationFix>>>,
    surface: watch::Sender<Option<Received<SurfaceReading>>>,
    applied: watch::Sender<Option<Received<AppliedProfile>>>,
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryHub {
    pub fn new() -> Self {
        Self {
            navigation: watch::channel(None).0,
            surface: watch::channel(None).0,
            applied: watch::channel(None).0,
        }
    }

    /// Replace the latest value of the datagram's stream.
    pub fn publish(&self, datagram: Datagram) {
        let at = Instant::now();
        match datagram {
            Datagram::Position(value) => {
                self.navigation.send_replace(Some(Received { value, at }));
            }
            Datagram::Surface(value) => {
                self.surface.send_replace(Some(Received { value, at }));
            }
            Datagram::Applied(value) => {
                self.applied.send_replace(Some(Received { value, at }));
            }
        }
    }

    pub fn navigation(&self) -> watch::Receiver<Option<Received<NavigationFix>>> {
        self.navigation.subscribe()
    }

    pub fn surface(&self) -> watch::Receiver<Option<Received<SurfaceReading>>> {
        self.surface.subscribe()
    }

    pub fn applied(&self) -> watch::Receiver<Option<Received<AppliedProfile>>> {
        self.applied.subscribe()
    }
}

/// UDP listener task feeding a [`TelemetryHub`].
pub struct Listener {
    name: String,
    socket: UdpSocket,
    hub: Arc<TelemetryHub>,
}

impl Listener {
    pub async fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        hub: Arc<TelemetryHub>,
    ) -> Result<Self, TelemetryError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            name: name.into(),
            socket,
            hub,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TelemetryError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive until `shutdown` is cancelled. Undecodable datagrams are
    /// dropped.
    pub async fn run(self, shutdown: CancellationToken) {
        let addr = self.socket.local_addr().ok();
        info!(listener = %self.name, ?addr, "telemetry listener started");
        let mut buf = vec![0u8; 65_536];
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => match decode(&buf[..len]) {
                        Ok(datagram) => self.hub.publish(datagram),
                        Err(e) => debug!(listener = %self.name, %from, error = %e, "dropped datagram"),
                    },
                    Err(e) => warn!(listener = %self.name, error = %e, "receive failed"),
                },
            }
        }
        info!(listener = %self.name, "telemetry listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 16, 14, 5, 9).unwrap() + chrono::Duration::milliseconds(250)
    }

    #[test]
    fn test_position_frame_layout() {
        let fix = NavigationFix {
            time: time(),
            position: Position::new(43.0265, -70.3188),
        };
        let frame = encode(&Datagram::Position(fix));
        assert_eq!(frame.len(), HEADER_LEN + 8 + TRAILER_LEN);
        assert_eq!(frame[0], STX);
        assert_eq!(frame[1], b'P');
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 8);
        assert_eq!(u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]), 20240616);
        assert_eq!(frame[frame.len() - 3], ETX);

        let Datagram::Position(back) = decode(&frame).unwrap() else {
            panic!("wrong kind");
        };
        assert_eq!(back.time, time());
        assert!((back.position.latitude - 43.0265).abs() < 1e-7);
        assert!((back.position.longitude + 70.3188).abs() < 1e-7);
    }

    #[test]
    fn test_applied_profile_decodes() {
        let applied = AppliedProfile {
            time: time(),
            profile_time: Utc.with_ymd_and_hms(2024, 6, 16, 13, 0, 0).unwrap(),
            pairs: vec![(0.0, 1500.12), (12.5, 1495.5), (12_000.0, 1675.8)],
        };
        let frame = encode(&Datagram::Applied(applied.clone()));
        assert_eq!(decode(&frame).unwrap(), Datagram::Applied(applied));
    }

    #[test]
    fn test_oversized_applied_profile_is_truncated() {
        let applied = AppliedProfile {
            time: time(),
            profile_time: time(),
            pairs: (0..10_000).map(|i| (i as f64, 1500.0)).collect(),
        };
        let frame = encode(&Datagram::Applied(applied.clone()));
        let payload_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        assert_eq!(frame.len(), HEADER_LEN + payload_len + TRAILER_LEN);

        let Datagram::Applied(back) = decode(&frame).unwrap() else {
            panic!("wrong kind");
        };
        assert_eq!(back.pairs.len(), MAX_APPLIED_PAIRS);
        assert_eq!(back.pairs[..], applied.pairs[..MAX_APPLIED_PAIRS]);
    }

    #[test]
    fn test_surface_reading_units() {
        let reading = SurfaceReading {
            time: time(),
            speed: 1502.37,
            draft: 4.25,
        };
        let frame = encode(&Datagram::Surface(reading));
        assert_eq!(decode(&frame).unwrap(), Datagram::Surface(reading));
    }

    #[test]
    fn test_corrupt_frames_are_rejected() {
        let frame = encode(&Datagram::Surface(SurfaceReading {
            time: time(),
            speed: 1500.0,
            draft: 5.0,
        }))
        .to_vec();

        let mut bad_sum = frame.clone();
        bad_sum[HEADER_LEN] ^= 0x01;
        assert!(matches!(decode(&bad_sum), Err(TelemetryError::Checksum { .. })));

        assert!(matches!(decode(&frame[..10]), Err(TelemetryError::Truncated(10))));

        let mut bad_kind = frame.clone();
        bad_kind[1] = b'Z';
        let len = bad_kind.len();
        let sum = sum16(&bad_kind[1..len - 3]);
        bad_kind[len - 2..].copy_from_slice(&sum.to_le_bytes());
        assert!(matches!(decode(&bad_kind), Err(TelemetryError::UnknownKind(b'Z'))));
    }

    #[test]
    fn test_hub_keeps_latest_value() {
        let hub = TelemetryHub::new();
        let rx = hub.navigation();
        assert!(rx.borrow().is_none());
        for lat in [10.0, 20.0] {
            hub.publish(Datagram::Position(NavigationFix {
                time: time(),
                position: Position::new(lat, 0.0),
            }));
        }
        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.value.position.latitude, 20.0);
    }

    #[tokio::test]
    async fn test_listener_publishes_and_stops() {
        let hub = Arc::new(TelemetryHub::new());
        let listener = Listener::bind("nav", "127.0.0.1:0".parse().unwrap(), hub.clone())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(listener.run(shutdown.clone()));

        let mut rx = hub.surface();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"garbage", addr).await.unwrap();
        let reading = SurfaceReading {
            time: time(),
            speed: 1499.5,
            draft: 3.0,
        };
        sender
            .send_to(&encode(&Datagram::Surface(reading)), addr)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().value, reading);

        shutdown.cancel();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
