//! # Profile Sample Operations
//!
//! Pure functions over [`ProfileSamples`]. Nothing here mutates its input:
//! every edit returns a new sequence, so the caller swaps the whole view at
//! once (see [`crate::Profile::replace_processed`]).

use crate::oceanography::depth_to_pressure;
use crate::{ProfileSamples, Sample, SampleFlag, SampleSource};

/// Linear interpolation of `y` at `x` over points sorted by `x`.
///
/// Returns `None` when `x` lies outside the covered range or fewer than one
/// point is available.
///
/// # Example
/// ```
/// use svp_lib::profile::interpolate;
///
/// let pts = [(0.0, 1500.0), (10.0, 1490.0)];
/// assert_eq!(interpolate(&pts, 5.0), Some(1495.0));
/// assert_eq!(interpolate(&pts, 11.0), None);
/// ```
pub fn interpolate(points: &[(f64, f64)], x: f64) -> Option<f64> {
    let first = points.first()?;
    let last = points.last()?;
    if x < first.0 || x > last.0 {
        return None;
    }

    // Index of the first point at or beyond x
    let upper = points.partition_point(|p| p.0 < x);
    if upper == 0 {
        return Some(first.1);
    }
    let (x1, y1) = points[upper];
    if x1 == x {
        return Some(y1);
    }
    let (x0, y0) = points[upper - 1];
    if x1 == x0 {
        return Some(y0);
    }
    let alpha = (x - x0) / (x1 - x0);
    Some(y0 + alpha * (y1 - y0))
}

/// Interpolate every field of the valid samples at `depth`.
///
/// Values outside the valid depth range are flat-extrapolated from the
/// nearest end. Returns `None` if there are no valid samples.
pub fn sample_at_depth(samples: &ProfileSamples, depth: f64) -> Option<Sample> {
    let valid: Vec<&Sample> = samples.valid().collect();
    let first = *valid.first()?;
    let last = *valid.last()?;

    if depth <= first.depth {
        return Some(Sample { depth, ..*first });
    }
    if depth >= last.depth {
        return Some(Sample { depth, ..*last });
    }

    let upper = valid.partition_point(|s| s.depth < depth);
    let below = valid[upper];
    let above = valid[upper - 1];
    let span = below.depth - above.depth;
    let alpha = if span > 0.0 {
        (depth - above.depth) / span
    } else {
        0.0
    };
    let lerp = |a: f64, b: f64| a + alpha * (b - a);

    Some(Sample {
        pressure: lerp(above.pressure, below.pressure),
        depth,
        speed: lerp(above.speed, below.speed),
        temperature: lerp(above.temperature, below.temperature),
        conductivity: lerp(above.conductivity, below.conductivity),
        salinity: lerp(above.salinity, below.salinity),
        source: above.source,
        flag: SampleFlag::Valid,
    })
}

/// Splice a surface sound speed reading into `samples` at the transducer
/// `draft`.
///
/// Temperature, salinity and conductivity at the draft are interpolated from
/// the surrounding valid samples; the speed is the measured one. An existing
/// valid sample at exactly the draft depth is replaced instead of duplicated.
/// Returns the input unchanged (cloned) when it has no valid samples or the
/// reading is not finite.
pub fn insert_surface_reading(
    samples: &ProfileSamples,
    draft: f64,
    speed: f64,
    latitude: f64,
) -> ProfileSamples {
    if !draft.is_finite() || !speed.is_finite() || draft < 0.0 {
        return samples.clone();
    }
    let Some(base) = sample_at_depth(samples, draft) else {
        return samples.clone();
    };

    let inserted = Sample {
        pressure: depth_to_pressure(draft, latitude),
        speed,
        source: SampleSource::TssInsert,
        flag: SampleFlag::Valid,
        ..base
    };

    let mut out = Vec::with_capacity(samples.len() + 1);
    let mut placed = false;
    for sample in &samples.samples {
        if !placed && sample.is_valid() && sample.depth >= draft {
            placed = true;
            out.push(inserted);
            if sample.depth == draft {
                continue;
            }
        }
        out.push(*sample);
    }
    if !placed {
        out.push(inserted);
    }

    ProfileSamples::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cast() -> ProfileSamples {
        ProfileSamples::from(vec![
            Sample::new(0.0, 1500.0).with_ts(20.0, 35.0),
            Sample::new(10.0, 1495.0).with_ts(15.0, 35.0),
            Sample::new(20.0, 1490.0).with_ts(10.0, 34.0),
        ])
    }

    #[test]
    fn test_interpolate_inside_and_outside() {
        let pts = [(0.0, 1.0), (2.0, 3.0), (4.0, 3.0)];
        assert_eq!(interpolate(&pts, 1.0), Some(2.0));
        assert_eq!(interpolate(&pts, 2.0), Some(3.0));
        assert_eq!(interpolate(&pts, 0.0), Some(1.0));
        assert_eq!(interpolate(&pts, -0.1), None);
        assert_eq!(interpolate(&[], 1.0), None);
    }

    #[test]
    fn test_sample_at_depth_interpolates_all_fields() {
        let s = sample_at_depth(&cast(), 15.0).unwrap();
        assert!((s.speed - 1492.5).abs() < 1e-9);
        assert!((s.temperature - 12.5).abs() < 1e-9);
        assert!((s.salinity - 34.5).abs() < 1e-9);
    }

    #[test]
    fn test_insert_surface_reading_between_samples() {
        let out = insert_surface_reading(&cast(), 5.0, 1502.0, 43.0);
        assert_eq!(out.len(), 4);
        let tss = out.samples[1];
        assert_eq!(tss.depth, 5.0);
        assert_eq!(tss.speed, 1502.0);
        assert_eq!(tss.source, SampleSource::TssInsert);
        assert!((tss.temperature - 17.5).abs() < 1e-9);
        assert!(out.is_depth_monotonic());
    }

    #[test]
    fn test_insert_surface_reading_replaces_same_depth() {
        let out = insert_surface_reading(&cast(), 10.0, 1499.0, 43.0);
        assert_eq!(out.len(), 3);
        assert_eq!(out.samples[1].speed, 1499.0);
    }

    #[test]
    fn test_insert_surface_reading_below_profile() {
        let out = insert_surface_reading(&cast(), 30.0, 1488.0, 43.0);
        assert_eq!(out.len(), 4);
        assert_eq!(out.samples[3].depth, 30.0);
        // Flat extrapolation of temperature
        assert_eq!(out.samples[3].temperature, 10.0);
    }

    #[test]
    fn test_insert_surface_reading_leaves_input_untouched() {
        let original = cast();
        let _ = insert_surface_reading(&original, 5.0, 1502.0, 43.0);
        assert_eq!(original, cast());
        let empty = ProfileSamples::default();
        assert!(insert_surface_reading(&empty, 5.0, 1500.0, 0.0).is_empty());
    }
}
