//! Quaternion error-state navigation filter for GNSS-aided strapdown INS
//!
//! This crate implements an Earth-Centered Earth-Fixed (ECEF) inertial
//! navigation filter that fuses a strapdown IMU (three-axis gyroscope and
//! accelerometer) with GNSS pseudorange and deltarange observations. The
//! mean estimate carries position, velocity, attitude, sensor biases, and
//! the receiver clock bias; uncertainty is carried in a
//! minimal-parameterization error state, with attitude error expressed as a
//! small-angle rotation vector rather than a quaternion. This keeps the
//! unit-norm constraint out of the covariance entirely: corrections re-enter
//! the mean through the exponential map on the right of the quaternion.
//!
//! The crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the linear algebra tools for the filter.
//! - [`nav-types`](https://crates.io/crates/nav-types): Provides coordinate types and geodetic conversions for scenario setup.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provides random number generation for simulated sensor noise.
//!
//! ## Crate overview
//!
//! - [earth]: Earth constants, the radial gravity model, and geodetic
//!   conversions.
//! - [linalg]: Quaternion exponential/logarithmic maps and related
//!   fixed-size kernels.
//! - [kalman]: The error-state filter itself: inertial propagation,
//!   measurement updates, and diagnostics.
//! - [measurements]: Observation value types and the multi-satellite
//!   accumulator loop.
//! - [sim]: Synthetic scenario generation, a closed-loop runner, and CSV
//!   result I/O.
//!
//! ## State and covariance layout
//!
//! The mean state ([`NavState`]) keeps position, velocity, orientation, and
//! clock bias in double precision; the gyro and accelerometer biases and
//! both covariance matrices are single precision. The covariance is split
//! into two disjoint blocks:
//!
//! - a 12×12 inertial block ordered `[gyro bias, attitude, velocity,
//!   accel bias]`, and
//! - a 4×4 position/clock block ordered `[position, clock bias]`.
//!
//! Position and clock are observed almost exclusively through GNSS and
//! evolve on a slower timescale than the inertial states, so decoupling
//! them cuts the dense covariance propagation from 16×16 down to 12×12.
//! The blocks re-couple only through a deterministic `dt²` transfer of
//! velocity covariance into position during prediction.
//!
//! ## Usage
//!
//! Callers drive the filter one epoch at a time: one
//! [`kalman::QuaternionKalmanFilter::predict_ecef`] per IMU interval, then
//! any number of observation updates. The filter is a plain value with
//! synchronous methods; it owns no threads, queues, or handles, and callers
//! needing concurrency must serialize externally.

pub mod earth;
pub mod kalman;
pub mod linalg;
pub mod measurements;
pub mod sim;

use nalgebra::{Quaternion, SVector, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Error-state correction for the inertial block, ordered
/// `[gyro bias, attitude, velocity, accel bias]`.
pub type InertialCorrection = SVector<f32, 12>;
/// Error-state correction for the position/clock block, ordered
/// `[position, clock bias]`.
pub type PositionClockCorrection = SVector<f32, 4>;
/// Full 16-element error vector ordered
/// `[gyro bias, attitude, velocity, accel bias, position, clock bias]`.
pub type StateDifference = SVector<f32, 16>;

/// Basic structure for holding raw IMU data in the form of sensed
/// acceleration and angular rate vectors.
///
/// The vectors are in the body frame of the vehicle as perceived by the IMU
/// (i.e. not compensating for gravity or sensor biases). This crate is not
/// a hardware driver; samples are assumed pre-synchronized by the caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct IMUData {
    /// Acceleration in m/s^2, body frame x, y, z axis
    pub accel: Vector3<f64>,
    /// Angular rate in rad/s, body frame x, y, z axis
    pub gyro: Vector3<f64>,
}

impl IMUData {
    pub fn new(accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        IMUData { accel, gyro }
    }
}

impl Display for IMUData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IMUData {{ accel: [{:.4}, {:.4}, {:.4}], gyro: [{:.4}, {:.4}, {:.4}] }}",
            self.accel[0], self.accel[1], self.accel[2], self.gyro[0], self.gyro[1], self.gyro[2]
        )
    }
}

/// The filter's mean estimate of the vehicle state.
///
/// Position, velocity, orientation, and clock bias are double precision;
/// the slowly-varying sensor biases are single precision, matching the
/// precision of the covariance they are estimated under. `inertial_accel`
/// and `body_rate` are caches of the most recent prediction inputs for
/// downstream consumers (logging, control); they are not part of the
/// estimated dynamical state and carry no covariance.
#[derive(Clone, Copy, Debug)]
pub struct NavState {
    /// Position in meters, ECEF
    pub position: Vector3<f64>,
    /// Velocity in m/s, ECEF
    pub velocity: Vector3<f64>,
    /// Unit quaternion carrying the body/ECEF attitude. Corrections apply
    /// on the right via the exponential map; renormalization is
    /// incremental.
    pub orientation: Quaternion<f64>,
    /// Gyroscope bias in rad/s, body frame
    pub gyro_bias: Vector3<f32>,
    /// Accelerometer bias in m/s^2, body frame
    pub accel_bias: Vector3<f32>,
    /// Receiver clock bias expressed as equivalent range, meters
    pub clock_bias: f64,
    /// Gravity-compensated acceleration from the latest prediction, ECEF
    pub inertial_accel: Vector3<f64>,
    /// Bias-corrected angular rate from the latest prediction, body frame
    pub body_rate: Vector3<f64>,
}

impl Default for NavState {
    fn default() -> Self {
        NavState {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            orientation: Quaternion::identity(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            clock_bias: 0.0,
            inertial_accel: Vector3::zeros(),
            body_rate: Vector3::zeros(),
        }
    }
}

impl Display for NavState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NavState {{ pos: [{:.2}, {:.2}, {:.2}] m, vel: [{:.3}, {:.3}, {:.3}] m/s, q: [{:.5}, {:.5}, {:.5}, {:.5}], gyro_bias: [{:.5}, {:.5}, {:.5}] rad/s, accel_bias: [{:.4}, {:.4}, {:.4}] m/s^2, clock: {:.2} m }}",
            self.position[0],
            self.position[1],
            self.position[2],
            self.velocity[0],
            self.velocity[1],
            self.velocity[2],
            self.orientation.scalar(),
            self.orientation.vector()[0],
            self.orientation.vector()[1],
            self.orientation.vector()[2],
            self.gyro_bias[0],
            self.gyro_bias[1],
            self.gyro_bias[2],
            self.accel_bias[0],
            self.accel_bias[1],
            self.accel_bias[2],
            self.clock_bias
        )
    }
}

impl NavState {
    /// Apply a 12-element inertial error-state correction.
    ///
    /// Biases and velocity are additive; the attitude segment is a rotation
    /// vector applied on the right of the orientation through the
    /// exponential map, followed by incremental renormalization.
    pub fn apply_inertial_correction(&mut self, correction: &InertialCorrection) {
        self.gyro_bias += correction.fixed_rows::<3>(0).into_owned();
        let delta = rotation_segment(correction, 3);
        let posterior = linalg::rotation_vector_to_quaternion(&delta);
        self.orientation = linalg::incremental_normalize(&(self.orientation * posterior));
        self.velocity += correction.fixed_rows::<3>(6).into_owned().cast::<f64>();
        self.accel_bias += correction.fixed_rows::<3>(9).into_owned();
    }

    /// Apply a 4-element position/clock error-state correction. Both
    /// segments are additive.
    pub fn apply_position_correction(&mut self, correction: &PositionClockCorrection) {
        self.position += correction.fixed_rows::<3>(0).into_owned().cast::<f64>();
        self.clock_bias += correction[3] as f64;
    }

    /// True when no field contains a NaN.
    pub fn has_nan(&self) -> bool {
        self.position.iter().any(|x| x.is_nan())
            || self.velocity.iter().any(|x| x.is_nan())
            || self.orientation.coords.iter().any(|x| x.is_nan())
            || self.gyro_bias.iter().any(|x| x.is_nan())
            || self.accel_bias.iter().any(|x| x.is_nan())
            || self.inertial_accel.iter().any(|x| x.is_nan())
            || self.body_rate.iter().any(|x| x.is_nan())
            || self.clock_bias.is_nan()
    }

    /// True when no field contains an infinity.
    pub fn has_inf(&self) -> bool {
        self.position.iter().any(|x| x.is_infinite())
            || self.velocity.iter().any(|x| x.is_infinite())
            || self.orientation.coords.iter().any(|x| x.is_infinite())
            || self.gyro_bias.iter().any(|x| x.is_infinite())
            || self.accel_bias.iter().any(|x| x.is_infinite())
            || self.inertial_accel.iter().any(|x| x.is_infinite())
            || self.body_rate.iter().any(|x| x.is_infinite())
            || self.clock_bias.is_infinite()
    }

    /// True when every field is finite.
    pub fn is_real(&self) -> bool {
        !self.has_nan() && !self.has_inf()
    }

    /// Minimal 16-element error vector taking `mean` to `point`, ordered
    /// `[gyro bias, attitude, velocity, accel bias, position, clock]`.
    ///
    /// The attitude segment is `log(mean⁻¹ · point)`. A quaternion and its
    /// negation are the same rotation, but the covariance relation through
    /// the log map only holds on one branch, so the point's quaternion is
    /// negated first whenever the two quaternions lie on opposite
    /// hemispheres.
    pub fn sigma_point_difference(mean: &NavState, point: &NavState) -> StateDifference {
        let mut ret = StateDifference::zeros();
        ret.fixed_rows_mut::<3>(0)
            .copy_from(&(point.gyro_bias - mean.gyro_bias));
        let point_orientation = if mean.orientation.dot(&point.orientation) < 0.0 {
            -point.orientation
        } else {
            point.orientation
        };
        let attitude =
            linalg::quaternion_to_rotation_vector(&(mean.orientation.conjugate() * point_orientation));
        ret.fixed_rows_mut::<3>(3).copy_from(&attitude.cast::<f32>());
        ret.fixed_rows_mut::<3>(6)
            .copy_from(&(point.velocity - mean.velocity).cast::<f32>());
        ret.fixed_rows_mut::<3>(9)
            .copy_from(&(point.accel_bias - mean.accel_bias));
        ret.fixed_rows_mut::<3>(12)
            .copy_from(&(point.position - mean.position).cast::<f32>());
        ret[15] = (point.clock_bias - mean.clock_bias) as f32;
        ret
    }
}

/// Pull a 3-element rotation-vector segment out of a single-precision
/// correction, widened for the quaternion math.
fn rotation_segment(correction: &InertialCorrection, offset: usize) -> Vector3<f64> {
    Vector3::new(
        correction[offset] as f64,
        correction[offset + 1] as f64,
        correction[offset + 2] as f64,
    )
}

// ============= Process noise utilities =============

/// Tunable process-noise densities and the gravity magnitude. Supplied at
/// filter construction and constant thereafter.
///
/// The vector noises are variance rates (variance accumulated per second)
/// applied to the diagonal of the matching covariance block during
/// prediction.
#[derive(Clone, Copy, Debug)]
pub struct ProcessNoise {
    /// Gyro bias random-walk density, (rad/s)^2 per second
    pub gyro_stability_noise: Vector3<f32>,
    /// Gyro white-noise (angle random walk) density, rad^2 per second
    pub gyro_white_noise: Vector3<f32>,
    /// Accelerometer white-noise (velocity random walk) density, (m/s)^2 per second
    pub accel_white_noise: Vector3<f32>,
    /// Accelerometer bias random-walk density, (m/s^2)^2 per second
    pub accel_stability_noise: Vector3<f32>,
    /// Receiver clock random-walk density, m^2 per second of equivalent range
    pub clock_stability_noise: f32,
    /// Magnitude of the radial gravity model, m/s^2
    pub accel_gravity_norm: f64,
}

impl Default for ProcessNoise {
    fn default() -> Self {
        ImuGrade::default().process_noise()
    }
}

/// Enum for characterizing the performance quality of an IMU as it relates
/// to the filter's process noise. Provides order-of-magnitude presets.
///
/// Benchmarks for typical IMU grades:
///
/// | Grade      | Gyro Bias Instability (°/h) | Gyro ARW (°/√h) | Accel Bias Instability (m/s^2) | Accel VRW (m/s/√h) |
/// |------------|-----------------------------|-----------------|--------------------------------|--------------------|
/// | Consumer   | 100                         | 1.0             | 0.1                            | 0.1                |
/// | Industrial | 50                          | 0.1             | 0.05                           | 0.03               |
/// | Tactical   | 1                           | 0.01            | 0.001                          | 0.01               |
/// | Navigation | 0.01                        | 0.005           | 0.0001                         | 0.005              |
///
/// The random-walk terms map directly onto white-noise densities; the bias
/// instability terms are treated as a bias random walk reaching the quoted
/// value over one hour. Both are approximations adequate for tuning, not a
/// substitute for an Allan-variance characterization of the actual sensor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImuGrade {
    /// Low-cost MEMS found in consumer electronics and basic drones
    #[default]
    Consumer,
    /// High-end MEMS found in automotive, robotics, and commercial drones
    Industrial,
    /// FOG/high-MEMS units robust to short GNSS denial
    Tactical,
    /// FOG/RLG units for aircraft and marine use
    Navigation,
}

impl ImuGrade {
    /// Gyro angle-random-walk coefficient in degrees per root hour.
    fn gyro_angle_random_walk_dprh(&self) -> f64 {
        match self {
            ImuGrade::Consumer => 1.0,
            ImuGrade::Industrial => 0.1,
            ImuGrade::Tactical => 0.01,
            ImuGrade::Navigation => 0.005,
        }
    }
    /// Gyro bias instability in degrees per hour.
    fn gyro_bias_instability_dph(&self) -> f64 {
        match self {
            ImuGrade::Consumer => 100.0,
            ImuGrade::Industrial => 50.0,
            ImuGrade::Tactical => 1.0,
            ImuGrade::Navigation => 0.01,
        }
    }
    /// Accelerometer velocity-random-walk coefficient in m/s per root hour.
    fn accel_velocity_random_walk_mprh(&self) -> f64 {
        match self {
            ImuGrade::Consumer => 0.1,
            ImuGrade::Industrial => 0.03,
            ImuGrade::Tactical => 0.01,
            ImuGrade::Navigation => 0.005,
        }
    }
    /// Accelerometer bias instability in m/s^2.
    fn accel_bias_instability_mps2(&self) -> f64 {
        match self {
            ImuGrade::Consumer => 0.1,
            ImuGrade::Industrial => 0.05,
            ImuGrade::Tactical => 0.001,
            ImuGrade::Navigation => 0.0001,
        }
    }

    /// Process-noise densities for this grade, with standard gravity and a
    /// modest TCXO-class receiver clock.
    pub fn process_noise(&self) -> ProcessNoise {
        // deg/√h -> rad/√s, then squared to a variance rate
        let arw = (self.gyro_angle_random_walk_dprh().to_radians() / 60.0).powi(2) as f32;
        // deg/h treated as a random walk reaching that rate over an hour
        let gyro_rw = (self.gyro_bias_instability_dph().to_radians() / 3600.0).powi(2) as f32;
        // m/s/√h -> m/s/√s
        let vrw = (self.accel_velocity_random_walk_mprh() / 60.0).powi(2) as f32;
        let accel_rw = (self.accel_bias_instability_mps2() / 60.0).powi(2) as f32;
        ProcessNoise {
            gyro_stability_noise: Vector3::from_element(gyro_rw),
            gyro_white_noise: Vector3::from_element(arw),
            accel_white_noise: Vector3::from_element(vrw),
            accel_stability_noise: Vector3::from_element(accel_rw),
            clock_stability_noise: 1.0,
            accel_gravity_norm: earth::STANDARD_GRAVITY,
        }
    }
}
