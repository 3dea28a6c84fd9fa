//! # Profile Thinning
//!
//! Reduces a dense depth/speed series to the few samples an echo sounder
//! needs, within a sound speed tolerance, using Douglas–Peucker line
//! simplification in (depth, speed) space.
//!
//! ## Algorithm
//! 1. Retain the first and last valid sample.
//! 2. Fit a line between the retained endpoints and measure the speed
//!    deviation of every interior sample from it.
//! 3. If the largest deviation is within tolerance, drop the interior;
//!    otherwise retain the worst sample and repeat on both halves.
//!
//! Short profiles (fewer than [`MIN_THINNING_SAMPLES`] valid samples) are
//! kept whole.
//!
//! ## Edge Policy
//! [`thin`] builds the device view: retained depths closer than
//! [`MIN_DEPTH_SEPARATION`] are collapsed, depths outside
//! [0, [`MAX_ABYSSAL_DEPTH`]] are excluded, and synthetic surface and abyssal
//! samples are added so the echo sounder always sees a full water column.

use crate::oceanography::{
    depth_to_pressure, ABYSSAL_SALINITY, ABYSSAL_SPEED, ABYSSAL_TEMPERATURE, MAX_ABYSSAL_DEPTH,
};
use crate::{ProfileSamples, Sample, SampleFlag, SampleSource};

/// Profiles with fewer valid samples than this are not thinned.
pub const MIN_THINNING_SAMPLES: usize = 100;

/// Minimum depth separation (m) between retained samples.
pub const MIN_DEPTH_SEPARATION: f64 = 0.02;

/// Compute which samples survive thinning at `tolerance` m/s.
///
/// Returns one flag per input sample; only valid samples can be retained.
/// The retained subsequence keeps the input order.
///
/// # Example
/// ```
/// use svp_lib::{ProfileSamples, Sample};
/// use svp_lib::thinning::simplify;
///
/// // A straight line collapses to its endpoints
/// let samples = ProfileSamples::from(
///     (0..200).map(|i| Sample::new(i as f64, 1500.0 - 0.01 * i as f64)).collect::<Vec<_>>(),
/// );
/// let keep = simplify(&samples, 0.01);
/// assert_eq!(keep.iter().filter(|k| **k).count(), 2);
/// ```
pub fn simplify(samples: &ProfileSamples, tolerance: f64) -> Vec<bool> {
    let mut keep = vec![false; samples.len()];
    let valid: Vec<usize> = samples
        .samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_valid())
        .map(|(i, _)| i)
        .collect();

    if valid.len() < MIN_THINNING_SAMPLES {
        for &i in &valid {
            keep[i] = true;
        }
        return keep;
    }

    let points: Vec<(f64, f64)> = valid
        .iter()
        .map(|&i| (samples.samples[i].depth, samples.samples[i].speed))
        .collect();

    let retained = douglas_peucker(&points, tolerance);
    for (pos, &i) in valid.iter().enumerate() {
        keep[i] = retained[pos];
    }
    keep
}

/// Douglas–Peucker over (depth, speed) points, one flag per point. The
/// endpoints are always retained.
fn douglas_peucker(points: &[(f64, f64)], tolerance: f64) -> Vec<bool> {
    let mut retained = vec![false; points.len()];
    if points.is_empty() {
        return retained;
    }
    retained[0] = true;
    retained[points.len() - 1] = true;

    // Explicit work stack of (first, last) ranges instead of recursion
    let mut ranges = vec![(0usize, points.len() - 1)];
    while let Some((first, last)) = ranges.pop() {
        if last <= first + 1 {
            continue;
        }
        let (index, deviation) = max_deviation(points, first, last);
        if deviation > tolerance {
            retained[index] = true;
            ranges.push((index, last));
            ranges.push((first, index));
        }
    }

    retained
}

/// Largest speed deviation of the interior of `points[first..=last]` from the
/// chord between its endpoints. Ties resolve to the lowest index.
fn max_deviation(points: &[(f64, f64)], first: usize, last: usize) -> (usize, f64) {
    let (d0, s0) = points[first];
    let (d1, s1) = points[last];
    let span = d1 - d0;

    let mut worst = (first + 1, f64::NEG_INFINITY);
    for (offset, &(depth, speed)) in points[first + 1..last].iter().enumerate() {
        let on_line = if span != 0.0 {
            s0 + (depth - d0) / span * (s1 - s0)
        } else {
            s0
        };
        let deviation = (speed - on_line).abs();
        if deviation > worst.1 {
            worst = (first + 1 + offset, deviation);
        }
    }
    worst
}

/// Build the device view of `samples` thinned at `tolerance` m/s.
///
/// The result holds every input sample, re-flagged (`Thinned` for discarded,
/// `SisExcluded` for edge-policy exclusions), plus any synthetic surface and
/// abyssal samples. Its valid subsequence is what gets transmitted. The
/// abyssal sample's pressure is computed at `latitude`.
pub fn thin(samples: &ProfileSamples, tolerance: f64, latitude: f64) -> ProfileSamples {
    let keep = simplify(samples, tolerance);
    let mut out: Vec<Sample> = Vec::with_capacity(samples.len() + 2);
    let mut last_kept_depth: Option<f64> = None;

    for (sample, retained) in samples.samples.iter().zip(keep) {
        let mut s = *sample;
        if !s.is_valid() {
            out.push(s);
            continue;
        }
        if !retained {
            s.flag = SampleFlag::Thinned;
        } else if !(0.0..=MAX_ABYSSAL_DEPTH).contains(&s.depth) {
            s.flag = SampleFlag::SisExcluded;
        } else if last_kept_depth.is_some_and(|d| s.depth - d < MIN_DEPTH_SEPARATION) {
            s.flag = SampleFlag::SisExcluded;
        } else {
            last_kept_depth = Some(s.depth);
        }
        out.push(s);
    }

    if let Some(first) = out.iter().position(|s| s.is_valid()) {
        let shallowest = out[first];
        if shallowest.depth < MIN_DEPTH_SEPARATION {
            out[first].depth = 0.0;
            out[first].pressure = 0.0;
        } else {
            let surface = Sample {
                depth: 0.0,
                pressure: 0.0,
                source: SampleSource::SisInsert,
                ..shallowest
            };
            out.insert(first, surface);
        }
    }

    let needs_abyssal = out
        .iter()
        .rfind(|s| s.is_valid())
        .is_some_and(|s| s.depth < MAX_ABYSSAL_DEPTH);
    if needs_abyssal {
        out.push(Sample {
            pressure: depth_to_pressure(MAX_ABYSSAL_DEPTH, latitude),
            depth: MAX_ABYSSAL_DEPTH,
            speed: ABYSSAL_SPEED,
            temperature: ABYSSAL_TEMPERATURE,
            conductivity: 0.0,
            salinity: ABYSSAL_SALINITY,
            source: SampleSource::SisInsert,
            flag: SampleFlag::Valid,
        });
    }

    ProfileSamples::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LATITUDE: f64 = 43.0265;

    /// Dense synthetic cast with a thermocline between 50 and 150 m.
    fn dense_cast(n: usize) -> ProfileSamples {
        let samples = (0..n)
            .map(|i| {
                let depth = i as f64 * 2.0;
                let speed = if depth < 50.0 {
                    1510.0
                } else if depth < 150.0 {
                    1510.0 - (depth - 50.0) * 0.2
                } else {
                    1490.0 + (depth - 150.0) * 0.016
                };
                Sample::new(depth, speed)
            })
            .collect::<Vec<_>>();
        ProfileSamples::from(samples)
    }

    fn retained_count(keep: &[bool]) -> usize {
        keep.iter().filter(|k| **k).count()
    }

    #[test]
    fn test_short_profiles_are_kept_whole() {
        let samples = dense_cast(40);
        let keep = simplify(&samples, 0.5);
        assert_eq!(retained_count(&keep), 40);
    }

    #[test]
    fn test_piecewise_linear_keeps_breakpoints() {
        let samples = dense_cast(500);
        let keep = simplify(&samples, 0.01);
        let depths: Vec<f64> = samples
            .samples
            .iter()
            .zip(&keep)
            .filter(|(_, k)| **k)
            .map(|(s, _)| s.depth)
            .collect();
        assert_eq!(depths, vec![0.0, 50.0, 150.0, 998.0]);
    }

    #[test]
    fn test_invalid_samples_never_retained() {
        let mut samples = dense_cast(300);
        samples.samples[75].flag = SampleFlag::UserInvalid;
        samples.samples[75].speed = 2000.0;
        let keep = simplify(&samples, 0.01);
        assert!(!keep[75]);
    }

    #[test]
    fn test_thin_adds_surface_and_abyssal_samples() {
        let mut samples = dense_cast(300);
        samples.samples.remove(0); // shallowest is now 2 m
        let device = thin(&samples, 0.01, LATITUDE);
        let valid: Vec<&Sample> = device.valid().collect();

        assert_eq!(valid[0].depth, 0.0);
        assert_eq!(valid[0].source, SampleSource::SisInsert);
        assert_eq!(valid[0].speed, valid[1].speed);

        let last = valid[valid.len() - 1];
        assert_eq!(last.depth, MAX_ABYSSAL_DEPTH);
        assert_eq!(last.speed, ABYSSAL_SPEED);
        assert_eq!(last.pressure, depth_to_pressure(MAX_ABYSSAL_DEPTH, LATITUDE));
        assert!(last.pressure > MAX_ABYSSAL_DEPTH);
        assert!(device.is_depth_monotonic());
    }

    #[test]
    fn test_thin_collapses_close_depths_and_excludes_out_of_range() {
        let samples = ProfileSamples::from(vec![
            Sample::new(0.0, 1500.0),
            Sample::new(1.0, 1499.0),
            Sample::new(1.01, 1498.0),
            Sample::new(12_500.0, 1700.0),
        ]);
        let device = thin(&samples, 0.01, LATITUDE);
        assert_eq!(device.samples[2].flag, SampleFlag::SisExcluded);
        assert_eq!(device.samples[3].flag, SampleFlag::SisExcluded);
        let depths: Vec<f64> = device.valid().map(|s| s.depth).collect();
        assert_eq!(depths, vec![0.0, 1.0, MAX_ABYSSAL_DEPTH]);
    }

    #[test]
    fn test_thin_snaps_near_surface_sample() {
        let samples = ProfileSamples::from(vec![Sample::new(0.01, 1500.0), Sample::new(5.0, 1499.0)]);
        let device = thin(&samples, 0.01, LATITUDE);
        let first = device.valid().next().unwrap();
        assert_eq!(first.depth, 0.0);
        assert_eq!(first.source, SampleSource::Raw);
    }

    fn arbitrary_cast() -> impl Strategy<Value = ProfileSamples> {
        prop::collection::vec((0.0f64..5.0, -2.0f64..2.0), 100..400).prop_map(|steps| {
            let mut depth = 0.0;
            let mut speed = 1500.0;
            let samples = steps
                .into_iter()
                .map(|(dz, ds)| {
                    depth += dz;
                    speed += ds;
                    Sample::new(depth, speed)
                })
                .collect::<Vec<_>>();
            ProfileSamples::from(samples)
        })
    }

    proptest! {
        #[test]
        fn prop_retained_depths_keep_input_order(cast in arbitrary_cast(), tol in 0.01f64..2.0) {
            let keep = simplify(&cast, tol);
            let depths: Vec<f64> = cast.samples.iter().zip(&keep)
                .filter(|(_, k)| **k)
                .map(|(s, _)| s.depth)
                .collect();
            prop_assert!(depths.windows(2).all(|w| w[0] <= w[1]));
            prop_assert!(keep[0]);
            prop_assert!(keep[keep.len() - 1]);
        }

        #[test]
        fn prop_douglas_peucker_is_idempotent(cast in arbitrary_cast(), tol in 0.01f64..2.0) {
            let points: Vec<(f64, f64)> = cast.samples.iter().map(|s| (s.depth, s.speed)).collect();
            let keep = douglas_peucker(&points, tol);
            let reduced: Vec<(f64, f64)> = points.iter().zip(&keep).filter(|(_, k)| **k).map(|(p, _)| *p).collect();
            let again = douglas_peucker(&reduced, tol);
            prop_assert!(again.iter().all(|k| *k));
        }

        #[test]
        fn prop_coarser_tolerance_retains_no_more(cast in arbitrary_cast(), t1 in 0.01f64..1.0, extra in 0.0f64..1.0) {
            let fine = retained_count(&simplify(&cast, t1));
            let coarse = retained_count(&simplify(&cast, t1 + extra));
            prop_assert!(coarse <= fine);
        }
    }
}
