//! # Seawater Equations
//!
//! Standard oceanographic formulas used to turn atlas temperature/salinity
//! levels into sound speed:
//!
//! - **Sound speed**: Chen & Millero (1977), UNESCO 1983 coefficients
//! - **Pressure from depth**: Saunders (1981)
//! - **Potential ↔ in-situ temperature**: Fofonoff & Millard (1983), adiabatic
//!   lapse rate integrated with a fourth-order Runge–Kutta step
//! - **Distances**: haversine great-circle distance on a spherical Earth
//!
//! All functions are pure and work in SI-ish oceanographic units: °C, PSU,
//! dbar, metres and m/s.

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Deepest depth accepted in a transmitted profile (m).
pub const MAX_ABYSSAL_DEPTH: f64 = 12_000.0;

/// Literature values used for the synthetic terminal sample at
/// [`MAX_ABYSSAL_DEPTH`].
pub const ABYSSAL_SPEED: f64 = 1675.8;
pub const ABYSSAL_TEMPERATURE: f64 = 2.46;
pub const ABYSSAL_SALINITY: f64 = 34.70;

/// Speed of sound in seawater (m/s).
///
/// Chen–Millero equation, valid for 0–40 °C, 0–40 PSU and 0–1000 bar.
///
/// # Arguments
/// * `temperature` - In-situ temperature in °C
/// * `salinity` - Salinity in PSU
/// * `pressure` - Pressure in dbar
pub fn sound_speed(temperature: f64, salinity: f64, pressure: f64) -> f64 {
    let t = temperature;
    let s = salinity;
    let p = pressure / 10.0; // dbar → bar

    let cw = 1402.388 + 5.03711 * t - 5.80852e-2 * t.powi(2) + 3.3420e-4 * t.powi(3)
        - 1.47800e-6 * t.powi(4)
        + 3.1464e-9 * t.powi(5)
        + (0.153563 + 6.8982e-4 * t - 8.1788e-6 * t.powi(2) + 1.3621e-7 * t.powi(3)
            - 6.1185e-10 * t.powi(4))
            * p
        + (3.1260e-5 - 1.7107e-6 * t + 2.5974e-8 * t.powi(2) - 2.5335e-10 * t.powi(3)
            + 1.0405e-12 * t.powi(4))
            * p.powi(2)
        + (-9.7729e-9 + 3.8504e-10 * t - 2.3643e-12 * t.powi(2)) * p.powi(3);

    let a = 1.389 - 1.262e-2 * t + 7.164e-5 * t.powi(2) + 2.006e-6 * t.powi(3)
        - 3.21e-8 * t.powi(4)
        + (9.4742e-5 - 1.258e-5 * t - 6.4885e-8 * t.powi(2) + 1.0507e-8 * t.powi(3)
            - 2.0122e-10 * t.powi(4))
            * p
        + (-3.9064e-7 + 9.1041e-9 * t - 1.6002e-10 * t.powi(2) + 7.988e-12 * t.powi(3))
            * p.powi(2)
        + (1.100e-10 + 6.649e-12 * t - 3.389e-13 * t.powi(2)) * p.powi(3);

    let b = -1.922e-2 - 4.42e-5 * t + (7.3637e-5 + 1.7945e-7 * t) * p;

    let d = 1.727e-3 - 7.9836e-6 * p;

    cw + a * s + b * s.powf(1.5) + d * s.powi(2)
}

/// Pressure (dbar) at `depth` metres and `latitude` degrees (Saunders 1981).
pub fn depth_to_pressure(depth: f64, latitude: f64) -> f64 {
    if depth <= 0.0 {
        return 0.0;
    }
    let sin_lat = latitude.to_radians().sin();
    let c1 = (5.92 + 5.25 * sin_lat * sin_lat) * 1.0e-3;
    let root = ((1.0 - c1).powi(2) - 8.84e-6 * depth).max(0.0);
    ((1.0 - c1) - root.sqrt()) / 4.42e-6
}

/// Adiabatic lapse rate (°C/dbar), UNESCO 1983.
pub fn adiabatic_gradient(salinity: f64, temperature: f64, pressure: f64) -> f64 {
    let t = temperature;
    let p = pressure;
    let ds = salinity - 35.0;
    (((-2.1687e-16 * t + 1.8676e-14) * t - 4.6206e-13) * p
        + ((2.7759e-12 * t - 1.1351e-10) * ds
            + ((-5.4481e-14 * t + 8.733e-12) * t - 6.7795e-10) * t
            + 1.8741e-8))
        * p
        + (-4.2393e-8 * t + 1.8932e-6) * ds
        + ((6.6228e-10 * t - 6.836e-8) * t + 8.5258e-6) * t
        + 3.5803e-5
}

/// Temperature a parcel at (`temperature`, `pressure`) would have if moved
/// adiabatically to `reference_pressure` (Fofonoff & Millard 1983).
pub fn potential_temperature(
    salinity: f64,
    temperature: f64,
    pressure: f64,
    reference_pressure: f64,
) -> f64 {
    let h = reference_pressure - pressure;

    let mut xk = h * adiabatic_gradient(salinity, temperature, pressure);
    let mut t = temperature + 0.5 * xk;
    let mut q = xk;
    let mut p = pressure + 0.5 * h;

    xk = h * adiabatic_gradient(salinity, t, p);
    t += 0.292_893_22 * (xk - q);
    q = 0.585_786_44 * xk + 0.121_320_344 * q;

    xk = h * adiabatic_gradient(salinity, t, p);
    t += 1.707_106_781 * (xk - q);
    q = 3.414_213_562 * xk - 4.121_320_344 * q;

    p += 0.5 * h;
    xk = h * adiabatic_gradient(salinity, t, p);
    t + (xk - 2.0 * q) / 6.0
}

/// In-situ temperature at `pressure` from a potential temperature referenced
/// to `reference_pressure`.
pub fn in_situ_temperature(
    salinity: f64,
    potential: f64,
    reference_pressure: f64,
    pressure: f64,
) -> f64 {
    potential_temperature(salinity, potential, reference_pressure, pressure)
}

/// Haversine great-circle distance in metres.
pub fn great_circle_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}
