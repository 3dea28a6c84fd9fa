//! A dense 5,000-sample cast does not fit in one datagram at fine
//! tolerances; the encoder escalates to the finest tolerance that fits.

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use svp_lib::{
    protocol::{self, MAX_DATAGRAM_PAYLOAD},
    thinning,
    transmission::{fit, ClientProtocol, TransmissionOutcome, TransmitError, TransmitSettings},
    Metadata, Position, Profile, ProfileSamples, Sample,
};

use super::fixtures::hypack_client;

/// Linear trend with ±0.2 m/s alternating noise: every sample matters below
/// 0.2 m/s tolerance, almost none above it.
fn dense_cast() -> Profile {
    let samples = (0..5000)
        .map(|i| {
            let depth = i as f64;
            let noise = if i % 2 == 0 { 0.2 } else { -0.2 };
            Sample::new(depth, 1500.0 - depth * 0.01 + noise).with_ts(12.0, 35.0)
        })
        .collect::<Vec<_>>();
    let meta = Metadata {
        position: Some(Position::new(43.0265, -70.3188)),
        timestamp: Some(Utc.with_ymd_and_hms(2024, 6, 16, 12, 0, 0).unwrap()),
        ..Metadata::default()
    };
    Profile::new(meta, ProfileSamples::from(samples))
}

#[test]
fn escalates_to_smallest_fitting_tolerance() {
    let profile = dense_cast();
    let settings = TransmitSettings::default();
    let format = ClientProtocol::Sis.wire_format();

    let fitted = fit(&profile, format, &settings).unwrap();
    assert_eq!(fitted.tolerance, 0.5);
    assert!(fitted.bytes.len() <= MAX_DATAGRAM_PAYLOAD);

    // Every finer tolerance overflows
    for &tolerance in settings.tolerances.iter().filter(|t| **t < fitted.tolerance) {
        let device = thinning::thin(&profile.processed, tolerance, profile.reference_latitude());
        let bytes = protocol::encode(&device, &profile.meta, format).unwrap();
        assert!(bytes.len() > MAX_DATAGRAM_PAYLOAD, "tolerance {tolerance} fits");
    }
}

#[tokio::test]
async fn nothing_is_sent_when_no_tolerance_fits() {
    let profile = dense_cast();
    let (client, socket) = hypack_client().await;
    let mut registry = svp_lib::registry::ClientRegistry::new(vec![client]);
    // Only tolerances below the noise level
    let settings = TransmitSettings {
        tolerances: vec![0.01, 0.1],
        ..super::fixtures::fast_settings()
    };
    assert!(matches!(
        fit(&profile, ClientProtocol::Hypack.wire_format(), &settings),
        Err(TransmitError::EncodingOverflow { budget: MAX_DATAGRAM_PAYLOAD, .. })
    ));

    let mut narrow = svp_lib::transmission::TransmissionClient::new(
        registry.clients()[0].target().clone(),
        settings,
    );
    let outcome = narrow.send(&profile, &CancellationToken::new()).await;
    assert!(matches!(
        outcome,
        TransmissionOutcome::SendFailed(TransmitError::EncodingOverflow { .. })
    ));
    // Overflow is not a transport failure: the client stays alive
    assert!(narrow.is_alive());

    // The default tolerance list does fit and is delivered
    let report = registry.transmit_all(&profile, &CancellationToken::new()).await;
    assert!(report.success);
    let mut buf = vec![0u8; 65_536];
    let (len, _) = socket.recv_from(&mut buf).await.unwrap();
    assert!(len <= MAX_DATAGRAM_PAYLOAD);
}
