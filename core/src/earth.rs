//! Earth-related constants and functions.
//!
//! This module contains the constants and models of the Earth used by the
//! ECEF-frame navigation filter and its simulation tooling. The filter
//! itself uses a deliberately simple gravity model: a point-mass field
//! directed along the geocentric radius, scaled by a configured magnitude
//! (see [`radial_gravity`]). Oblateness and centrifugal corrections are
//! absorbed into process noise rather than modeled explicitly. The
//! higher-fidelity Somigliana model is kept for generating simulation truth.
//!
//! Positional conversions between geodetic (WGS84) and Cartesian (ECEF)
//! coordinates are delegated to the `nav-types` crate; this module only adds
//! thin adapters so the rest of the crate can stay in `nalgebra` types.

use ::nalgebra::{Matrix3, RealField, Vector3};
use ::nav_types::{ECEF, WGS84};

// Earth constants (WGS84)
pub const RATE: f64 = 7.2921159e-5; // rad/s (omega_ie)
pub const EQUATORIAL_RADIUS: f64 = 6378137.0; // meters
pub const POLAR_RADIUS: f64 = 6356752.31425; // meters
pub const ECCENTRICITY: f64 = 0.0818191908425; // unit-less
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;
pub const GE: f64 = 9.7803253359; // m/s^2, equatorial
pub const GP: f64 = 9.8321849378; // m/s^2, polar
pub const K: f64 = (POLAR_RADIUS * GP - EQUATORIAL_RADIUS * GE) / (EQUATORIAL_RADIUS * GE); // Somigliana's constant
/// Standard gravity, the default magnitude for the radial field model.
pub const STANDARD_GRAVITY: f64 = 9.80665; // m/s^2
/// Speed of light, relating receiver clock offsets to equivalent range error.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0; // m/s

/// Convert a three-element vector to a skew-symmetric (cross-product) matrix.
///
/// Given a vector `v = [v1, v2, v3]`, the skew-symmetric matrix is
///
/// ```text
/// skew = |  0  -v3   v2 |
///        | v3   0   -v1 |
///        |-v2   v1   0  |
/// ```
///
/// so that `skew * w == v.cross(&w)`. Generic over the scalar type because
/// the filter builds its covariance Jacobian blocks in single precision
/// while the mean dynamics run in double.
pub fn vector_to_skew_symmetric<T: RealField + Copy>(v: &Vector3<T>) -> Matrix3<T> {
    let mut skew: Matrix3<T> = Matrix3::zeros();
    skew[(0, 1)] = -v[2];
    skew[(0, 2)] = v[1];
    skew[(1, 0)] = v[2];
    skew[(1, 2)] = -v[0];
    skew[(2, 0)] = -v[1];
    skew[(2, 1)] = v[0];
    skew
}

/// Convert a skew-symmetric matrix back to its three-element vector. Inverse
/// of [`vector_to_skew_symmetric`].
pub fn skew_symmetric_to_vector<T: RealField + Copy>(skew: &Matrix3<T>) -> Vector3<T> {
    Vector3::new(skew[(2, 1)], skew[(0, 2)], skew[(1, 0)])
}

/// Local gravity in the ECEF frame under the radial point-mass model.
///
/// Returns `unit(position) * magnitude`: the specific force an accelerometer
/// at rest senses, directed along the outward geocentric radius. Subtracting
/// this from the sensed acceleration yields the inertial acceleration used
/// by the kinematic update. A position at the frame origin has no defined
/// radial direction and yields the zero vector.
///
/// # Example
/// ```rust
/// use nalgebra::Vector3;
/// use qnav::earth::{radial_gravity, EQUATORIAL_RADIUS, STANDARD_GRAVITY};
/// let position = Vector3::new(EQUATORIAL_RADIUS, 0.0, 0.0);
/// let g = radial_gravity(&position, STANDARD_GRAVITY);
/// assert!((g[0] - STANDARD_GRAVITY).abs() < 1e-12);
/// ```
pub fn radial_gravity(position: &Vector3<f64>, magnitude: f64) -> Vector3<f64> {
    match position.try_normalize(0.0) {
        Some(up) => up * magnitude,
        None => Vector3::zeros(),
    }
}

/// Calculate the WGS84 gravity scalar via the Somigliana model with free-air
/// correction. Used by the simulator to synthesize accelerometer truth;
/// the filter itself runs on [`radial_gravity`].
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in degrees
/// - `altitude` - The WGS84 altitude in meters
pub fn gravity(latitude: &f64, altitude: &f64) -> f64 {
    let sin_lat: f64 = (latitude).to_radians().sin();
    let g0: f64 =
        (GE * (1.0 + K * sin_lat * sin_lat)) / (1.0 - ECCENTRICITY_SQUARED * sin_lat * sin_lat).sqrt();
    g0 - 3.08e-6 * altitude
}

/// Convert a geodetic position (degrees, degrees, meters) to an ECEF vector.
pub fn geodetic_to_ecef(latitude: f64, longitude: f64, altitude: f64) -> Vector3<f64> {
    let ecef: ECEF<f64> = ECEF::from(WGS84::from_degrees_and_meters(latitude, longitude, altitude));
    Vector3::new(ecef.x(), ecef.y(), ecef.z())
}

/// Convert an ECEF vector to a geodetic position (degrees, degrees, meters).
pub fn ecef_to_geodetic(position: &Vector3<f64>) -> (f64, f64, f64) {
    let wgs: WGS84<f64> = WGS84::from(ECEF::new(position[0], position[1], position[2]));
    (
        wgs.latitude_degrees(),
        wgs.longitude_degrees(),
        wgs.altitude(),
    )
}

/// Outward local vertical (unit radial) at an ECEF position, or `None` at
/// the frame origin.
pub fn up_direction(position: &Vector3<f64>) -> Option<Vector3<f64>> {
    position.try_normalize(0.0)
}

/// Rotation matrix taking local East-North-Up vectors at the given geodetic
/// location into the ECEF frame. Columns are the east, north, and up unit
/// vectors.
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in degrees
/// - `longitude` - The WGS84 longitude in degrees
pub fn enu_to_ecef_rotation(latitude: f64, longitude: f64) -> Matrix3<f64> {
    let lat = latitude.to_radians();
    let lon = longitude.to_radians();
    Matrix3::new(
        -lon.sin(),
        -lat.sin() * lon.cos(),
        lat.cos() * lon.cos(),
        lon.cos(),
        -lat.sin() * lon.sin(),
        lat.cos() * lon.sin(),
        0.0,
        lat.cos(),
        lat.sin(),
    )
}
