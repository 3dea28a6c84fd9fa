//! Position in, datagram out: climatology lookup at 43.0265 N 70.3188 W,
//! delivery to an unconfirming and a confirming client, and the server loop
//! on top of both.

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use svp_lib::{
    atlas::GridSource,
    protocol,
    registry::ClientRegistry,
    server::{ServerError, ServerSettings, StepOutcome, SyntheticProfileServer},
    session::Session,
    store::{MemoryStore, ProfileStore},
    telemetry::{Datagram, NavigationFix, TelemetryHub},
    thinning,
    transmission::TransmissionOutcome,
    Position, SensorType,
};

use super::fixtures::*;

fn served_atlas() -> (TempDir, Arc<dyn GridSource>) {
    let dir = TempDir::new().unwrap();
    write_grid(dir.path(), "woa_t06.json.gz", &june_grid());
    let atlas: Arc<dyn GridSource> = Arc::new(climatology(dir.path()));
    (dir, atlas)
}

#[test]
fn climatology_profile_at_gulf_of_maine() {
    let (_dir, atlas) = served_atlas();
    assert!(atlas.has_data(june()));

    let profile = atlas.query(LAT, LON, june()).unwrap();
    let origin = profile.meta.position.unwrap();
    assert!((origin.latitude - 43.0).abs() < 1e-9);
    assert!((origin.longitude + 70.0).abs() < 1e-9);
    assert_eq!(profile.meta.sensor, SensorType::Synthetic);
    assert_eq!(profile.meta.timestamp, Some(june()));

    assert_eq!(profile.processed.valid_count(), 8);
    assert!(profile.processed.is_depth_monotonic());
    // Warm surface over cold deep water
    let speeds: Vec<f64> = profile.processed.valid().map(|s| s.speed).collect();
    assert!(speeds[0] > speeds[4]);
    assert!(speeds.iter().all(|s| (1440.0..1540.0).contains(s)));
}

#[test]
fn forty_level_cast_thins_within_its_levels() {
    let dir = TempDir::new().unwrap();
    write_grid(dir.path(), "woa_t06.json.gz", &june_grid_40_levels());
    let profile = climatology(dir.path()).query(LAT, LON, june()).unwrap();
    assert_eq!(profile.processed.valid_count(), 40);

    let keep = thinning::simplify(&profile.processed, 0.01);
    assert!(keep.iter().filter(|k| **k).count() <= 40);
    assert!(keep[0]);
    assert!(keep[keep.len() - 1]);

    let device = thinning::thin(&profile.processed, 0.01, profile.reference_latitude());
    let depths: Vec<f64> = device.valid().map(|s| s.depth).collect();
    assert_eq!(depths.first(), Some(&0.0));
    assert!(depths.contains(&600.0));
    assert_eq!(depths.last(), Some(&12_000.0));
    assert!(device.is_depth_monotonic());
}

#[tokio::test]
async fn unconfirming_client_receives_decodable_sentence() {
    let (_dir, atlas) = served_atlas();
    let profile = atlas.query(LAT, LON, june()).unwrap();

    let (client, socket) = hypack_client().await;
    let mut registry = ClientRegistry::new(vec![client]);
    let report = registry.transmit_all(&profile, &CancellationToken::new()).await;
    assert!(report.success);
    assert!(matches!(
        report.outcome("Hypack"),
        Some(TransmissionOutcome::DeliveredUnconfirmed)
    ));

    let mut buf = vec![0u8; 65_536];
    let (len, _) = socket.recv_from(&mut buf).await.unwrap();
    let sentence = protocol::decode(&buf[..len]).unwrap();
    assert_eq!(sentence.format.code(), "S00");
    assert!(sentence.position.is_none());
    let pairs = sentence.depth_speed_pairs();
    // Atlas levels plus the abyssal extension
    assert_eq!(pairs.last().unwrap().0, 12_000.0);
    assert!((pairs[0].1 - profile.processed.samples[0].speed).abs() < 0.006);
}

#[tokio::test]
async fn confirming_client_confirms_and_rejects() {
    let (_dir, atlas) = served_atlas();
    let profile = atlas.query(LAT, LON, june()).unwrap();

    let mut sis = MockSis::start().await;
    let mut registry = ClientRegistry::new(vec![sis.client.take().unwrap()]);
    let cancel = CancellationToken::new();

    let report = registry.transmit_all(&profile, &cancel).await;
    assert!(report.success, "{:?}", report.outcomes);
    match report.outcome("SIS") {
        Some(TransmissionOutcome::DeliveredConfirmed { profile_time }) => {
            assert_eq!(*profile_time, june());
        }
        other => panic!("expected confirmation, got {other:?}"),
    }
    assert_eq!(registry.clients()[0].last_confirmed(), Some(june()));
    assert!(registry.verify_confirmed_markers(&cancel).await.is_ok());

    // Off by exactly the speed tolerance from what went on the wire
    *sis.speed_offset.lock() = 0.2;
    let report = registry.transmit_all(&profile, &cancel).await;
    assert!(report.success, "{:?}", report.outcomes);
    assert_eq!(report.confirmed(), 1);

    // The device applies something else than what was sent
    *sis.speed_offset.lock() = 0.5;
    let report = registry.transmit_all(&profile, &cancel).await;
    assert!(!report.success);
    match report.outcome("SIS") {
        Some(TransmissionOutcome::DeliveredRejected { max_delta, .. }) => {
            assert!((max_delta - 0.5).abs() < 0.01, "delta {max_delta}");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    // A rejection does not kill the client
    assert_eq!(registry.live_count(), 1);

    sis.stop().await;
}

fn publish_fix(hub: &TelemetryHub, lat: f64, lon: f64) {
    hub.publish(Datagram::Position(NavigationFix {
        time: june(),
        position: Position::new(lat, lon),
    }));
}

#[tokio::test]
async fn server_serves_and_faults_on_marker_mismatch() {
    let (_dir, atlas) = served_atlas();
    let mut sis = MockSis::start().await;
    let (hypack, _hypack_socket) = hypack_client().await;
    let registry = ClientRegistry::new(vec![sis.client.take().unwrap(), hypack]);

    let hub = TelemetryHub::new();
    let store = Arc::new(MemoryStore::new());
    let mut server = SyntheticProfileServer::new(
        atlas,
        registry,
        Session::new(store.clone()),
        &hub,
        ServerSettings::default(),
    );
    let cancel = CancellationToken::new();

    publish_fix(&hub, LAT, LON);
    let outcome = server.step(&cancel).await.unwrap();
    let StepOutcome::Transmitted { report, stored } = outcome else {
        panic!("expected a transmission, got {outcome:?}");
    };
    assert!(report.success);
    assert_eq!(report.confirmed(), 1);
    assert_eq!(store.list().iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![stored.unwrap()]);

    // Same cell: nothing new is queried or sent
    publish_fix(&hub, LAT + 0.2, LON);
    assert!(matches!(server.step(&cancel).await.unwrap(), StepOutcome::Skipped));

    // The device now reports a profile nobody confirmed
    if let Some(applied) = sis.applied.lock().as_mut() {
        applied.profile_time -= chrono::Duration::hours(1);
    }
    publish_fix(&hub, LAT + 1.0, LON);
    let err = server.step(&cancel).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, ServerError::ProtocolFault { ref client, .. } if client == "SIS"));
    assert_eq!(store.list().len(), 1);

    sis.stop().await;
}
