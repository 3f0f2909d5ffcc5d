//! Quaternion error-state Kalman filter over the split ECEF covariance.
//!
//! This module contains the filter itself: a 16-state GNSS-aided inertial
//! navigator whose mean is carried in [`NavState`] and whose uncertainty is
//! carried in two disjoint single-precision blocks, a 12×12 inertial
//! covariance and a 4×4 position/clock covariance. The covariance
//! propagation exploits the known sparsity of the state-transition Jacobian:
//! over one interval `dt` the inertial error state evolves as
//!
//! ```text
//!           gyro   att    vel   accel
//! gyro   [   I      0      0     0   ]
//! att    [  dtR     I      0     0   ]
//! vel    [   0     dtQ     I    dtR  ]
//! accel  [   0      0      0     I   ]
//! ```
//!
//! with `dtR = -dt * R`, the body-to-ECEF rotation scaled by `-dt`, and
//! `dtQ = -dt * [a_sens]x`, the cross-product matrix of the negated
//! sensible acceleration. Only nine 3×3 blocks are nonzero and four of
//! those are identity, so `F·P·Fᵀ` is computed blockwise with three small
//! primitives (`sgemm`, `ssyr2k`, `sgemmm`) instead of a dense 12×12
//! triple product. The update writes the upper triangle and mirrors six
//! off-diagonal blocks afterward; symmetry is an explicit step, not a
//! consequence of the algebra.
//!
//! Measurement updates are scalar or rank-one: a direction observation in
//! the body frame, GNSS pseudoranges and deltaranges threaded through
//! caller-owned accumulators (so a whole epoch of satellites shares one
//! linearization point), and a bundled position/velocity report applied as
//! sequential per-axis updates.

use crate::earth::{radial_gravity, vector_to_skew_symmetric};
use crate::linalg::{
    self, quaternion_from_two_vectors, quaternion_to_rotation_vector, rotation_matrix,
    rotation_vector_to_quaternion,
};
use crate::{IMUData, InertialCorrection, NavState, PositionClockCorrection, ProcessNoise};

use log::{debug, info};
use nalgebra::{Matrix3, Quaternion, SMatrix, SVector, Vector3};
use std::f64::consts::PI;

/// Covariance of the 12-dimensional inertial error state.
pub type InertialCovariance = SMatrix<f32, 12, 12>;
/// Covariance of the 4-dimensional position/clock error state.
pub type PositionClockCovariance = SMatrix<f32, 4, 4>;

/// Row/column offset of the gyro-bias block in the inertial covariance.
pub const GYRO_BIAS_BLOCK: usize = 0;
/// Row/column offset of the attitude-error block in the inertial covariance.
pub const ATTITUDE_BLOCK: usize = 3;
/// Row/column offset of the velocity block in the inertial covariance.
pub const VELOCITY_BLOCK: usize = 6;
/// Row/column offset of the accelerometer-bias block in the inertial covariance.
pub const ACCEL_BIAS_BLOCK: usize = 9;
/// Sentinel offset selecting the position/clock covariance in
/// [`QuaternionKalmanFilter::clear_covariance_block`].
pub const POSITION_CLOCK_BLOCK: usize = 12;

// Default a-priori error bounds
const DEFAULT_GYRO_BIAS_STD: f32 = 3.0 * (PI as f32) / 180.0; // 3 deg/s
const DEFAULT_ACCEL_BIAS_STD: f32 = 0.3; // m/s^2
const DEFAULT_VELOCITY_VAR: f32 = 100.0; // (m/s)^2
const DEFAULT_ATTITUDE_VAR: f32 = (PI as f32) * (PI as f32) * 0.5; // unknown orientation
const DEFAULT_POSITION_STD: f32 = 100e3; // m
const DEFAULT_CLOCK_STD: f32 = 300.0; // m, ~1 us of light time

/// Separation threshold between the reference direction and the normalized
/// attitude residual below which the vector-observation tangent basis falls
/// back to a coordinate axis. A tuning constant.
pub fn residual_separation_eps() -> f32 {
    (1000.0 * f32::EPSILON).sqrt()
}

/// Error-state Kalman filter fusing strapdown IMU mechanization with GNSS
/// range-domain observations, all in the ECEF frame.
///
/// The filter is a plain value: every public operation is synchronous,
/// mutates the state in place, and completes in bounded time on fixed-size
/// stack storage. The expected per-epoch sequence is one
/// [`predict_ecef`](Self::predict_ecef) followed by any number of
/// observation updates; interleaving predictions and observations is
/// allowed but moves the linearization point between updates.
///
/// Corruption of the estimate (a non-finite entry anywhere, or the
/// orientation drifting off the unit sphere) is unrecoverable: the
/// positive-semidefinite structure of the covariance cannot be restored
/// once poisoned. Every public mutation therefore ends with an invariant
/// assertion rather than limping onward. Recovery is a caller decision,
/// via the `init_*` methods.
#[derive(Clone, Debug)]
pub struct QuaternionKalmanFilter {
    /// Mean estimate
    pub avg_state: NavState,
    /// 12×12 inertial error covariance: gyro bias, attitude, velocity,
    /// accelerometer bias
    pub cov: InertialCovariance,
    /// 4×4 position/clock error covariance
    pub pt_cov: PositionClockCovariance,
    /// Process-noise densities and gravity magnitude
    pub noise: ProcessNoise,
}

impl Default for QuaternionKalmanFilter {
    fn default() -> Self {
        Self::new(ProcessNoise::default())
    }
}

impl QuaternionKalmanFilter {
    /// Create a filter with wide a-priori uncertainty: the mean sits at the
    /// frame origin with identity attitude and zero velocity, and the
    /// covariance spans a 3 deg/s gyro bias, a 0.3 m/s^2 accelerometer
    /// bias, a completely unknown orientation, 10 m/s of velocity error
    /// per axis, 100 km of position error, and 300 m of clock error.
    pub fn new(noise: ProcessNoise) -> Self {
        let mut cov = InertialCovariance::zeros();
        cov.fixed_view_mut::<3, 3>(GYRO_BIAS_BLOCK, GYRO_BIAS_BLOCK)
            .fill_diagonal(DEFAULT_GYRO_BIAS_STD * DEFAULT_GYRO_BIAS_STD);
        cov.fixed_view_mut::<3, 3>(ATTITUDE_BLOCK, ATTITUDE_BLOCK)
            .fill_diagonal(DEFAULT_ATTITUDE_VAR);
        cov.fixed_view_mut::<3, 3>(VELOCITY_BLOCK, VELOCITY_BLOCK)
            .fill_diagonal(DEFAULT_VELOCITY_VAR);
        cov.fixed_view_mut::<3, 3>(ACCEL_BIAS_BLOCK, ACCEL_BIAS_BLOCK)
            .fill_diagonal(DEFAULT_ACCEL_BIAS_STD * DEFAULT_ACCEL_BIAS_STD);

        let mut pt_cov = PositionClockCovariance::zeros();
        pt_cov
            .fixed_view_mut::<3, 3>(0, 0)
            .fill_diagonal(DEFAULT_POSITION_STD * DEFAULT_POSITION_STD);
        pt_cov[(3, 3)] = DEFAULT_CLOCK_STD * DEFAULT_CLOCK_STD;

        let filter = QuaternionKalmanFilter {
            avg_state: NavState::default(),
            cov,
            pt_cov,
            noise,
        };
        debug!("constructed navigation filter with default priors");
        filter.assert_invariants();
        filter
    }

    // ----- Initialization -----

    /// Seed the attitude estimate and its 3×3 rotation-vector covariance.
    /// All cross-covariance between attitude and the other inertial states
    /// is dropped: the seeded estimate is independent of them by assumption.
    pub fn init_attitude(&mut self, attitude: Quaternion<f64>, attitude_error: Matrix3<f32>) {
        self.avg_state.orientation = attitude;
        self.clear_covariance_block(ATTITUDE_BLOCK, &attitude_error);
        info!("attitude initialized externally");
        self.assert_invariants();
    }

    /// Seed the velocity estimate with a per-axis error variance.
    pub fn init_velocity(&mut self, velocity: Vector3<f64>, velocity_error: Vector3<f32>) {
        self.avg_state.velocity = velocity;
        self.clear_covariance_block(VELOCITY_BLOCK, &Matrix3::from_diagonal(&velocity_error));
        info!("velocity initialized externally");
        self.assert_invariants();
    }

    /// Seed the position estimate with a per-axis error variance. The clock
    /// variance is reset to its default alongside.
    pub fn init_position(&mut self, position: Vector3<f64>, position_error: Vector3<f32>) {
        self.avg_state.position = position;
        self.clear_covariance_block(POSITION_CLOCK_BLOCK, &Matrix3::from_diagonal(&position_error));
        info!("position initialized externally");
        self.assert_invariants();
    }

    /// Zero a 3×3 block's row and column strips and overwrite its diagonal
    /// block with `replacement`. Inertial offsets (0, 3, 6, 9) address the
    /// inertial covariance; the sentinel [`POSITION_CLOCK_BLOCK`] resets
    /// the entire position/clock covariance, restoring the default clock
    /// variance.
    pub fn clear_covariance_block(&mut self, offset: usize, replacement: &Matrix3<f32>) {
        if offset <= ACCEL_BIAS_BLOCK {
            self.cov.fixed_view_mut::<3, 12>(offset, 0).fill(0.0);
            self.cov.fixed_view_mut::<12, 3>(0, offset).fill(0.0);
            self.cov
                .fixed_view_mut::<3, 3>(offset, offset)
                .copy_from(replacement);
        } else {
            self.pt_cov.fill(0.0);
            self.pt_cov.fixed_view_mut::<3, 3>(0, 0).copy_from(replacement);
            self.pt_cov[(3, 3)] = DEFAULT_CLOCK_STD * DEFAULT_CLOCK_STD;
        }
    }

    // ----- Prediction -----

    /// Advance the mean and covariance through one IMU interval.
    ///
    /// `imu_data` carries the raw body-frame angular rate (rad/s) and
    /// specific force (m/s^2); `dt` is the interval in seconds and must be
    /// non-negative. The covariance moves first, linearized about the
    /// pre-update mean, then the mean integrates: attitude by the
    /// exponential map of the bias-corrected body rate, velocity and
    /// position by the gravity-compensated acceleration. The quaternion is
    /// not renormalized here; the exponential map yields an exactly-unit
    /// factor, and renormalization happens in the measurement updates.
    pub fn predict_ecef(&mut self, imu_data: IMUData, dt: f64) {
        assert!(dt >= 0.0 && dt.is_finite(), "IMU interval must be a non-negative time");
        let dt32 = dt as f32;

        // Sensible acceleration rotated into ECEF, and the local gravity it
        // must overcome at rest.
        let body_to_ecef = self.avg_state.orientation.conjugate();
        let accel_body = imu_data.accel - self.avg_state.accel_bias.cast::<f64>();
        let accel_sensible = linalg::rotate_vector(&body_to_ecef, &accel_body);
        let accel_gravity = radial_gravity(&self.avg_state.position, self.noise.accel_gravity_norm);
        self.avg_state.inertial_accel = accel_sensible - accel_gravity;

        // Jacobian blocks shared by several covariance updates
        let dt_r: Matrix3<f32> = rotation_matrix(&body_to_ecef).cast::<f32>() * -dt32;
        let dt_q: Matrix3<f32> =
            vector_to_skew_symmetric(&(-accel_sensible).cast::<f32>()) * -dt32;

        // Full snapshot so every cross-block update reads the prior value.
        let prior = self.cov;

        // Gyro-bias row: the bias itself is a random walk, so its diagonal
        // block is untouched; only the couplings into attitude and velocity
        // pick up terms.
        sgemm(&mut self.cov, 0, 3, &dt_r, &prior, 0, 0);
        sgemm(&mut self.cov, 0, 6, &dt_q, &prior, 0, 3);
        sgemm(&mut self.cov, 0, 6, &dt_r, &prior, 0, 9);

        // Attitude row
        sgemmm(&mut self.cov, 3, 3, &dt_r, &prior, 0, 0);
        ssyr2k(&mut self.cov, 3, 3, &dt_r, &prior, 0, 3);
        add_block(
            &mut self.cov,
            3,
            6,
            &(dt_r * prior.fixed_view::<3, 3>(0, 6)
                + dt_r * prior.fixed_view::<3, 3>(0, 3) * dt_q.transpose()),
        );
        sgemmm(&mut self.cov, 3, 6, &dt_r, &prior, 0, 9);
        sgemm(&mut self.cov, 3, 6, &dt_r, &prior, 3, 9);
        sgemm(&mut self.cov, 3, 6, &dt_q, &prior, 3, 3);
        add_block(&mut self.cov, 3, 9, &(dt_r * prior.fixed_view::<3, 3>(0, 9)));

        // Velocity row
        ssyr2k(&mut self.cov, 6, 6, &dt_q, &prior, 3, 6);
        ssyr2k(&mut self.cov, 6, 6, &dt_r, &prior, 9, 6);
        {
            let tmp: Matrix3<f32> =
                dt_r * (dt_q * prior.fixed_view::<3, 3>(3, 9)).transpose();
            add_block(&mut self.cov, 6, 6, &(tmp + tmp.transpose()));
        }
        sgemmm(&mut self.cov, 6, 6, &dt_q, &prior, 3, 3);
        sgemmm(&mut self.cov, 6, 6, &dt_r, &prior, 9, 9);
        add_block(
            &mut self.cov,
            6,
            9,
            &(dt_q * prior.fixed_view::<3, 3>(3, 9) + dt_r * prior.fixed_view::<3, 3>(9, 9)),
        );

        // Accelerometer-bias row is, like the gyro row, a pure random walk.

        // Only the upper triangle was written; mirror the six off-diagonal
        // blocks to restore symmetric form.
        for (row, col) in [(3, 0), (6, 0), (6, 3), (9, 0), (9, 3), (9, 6)] {
            let mirrored = self.cov.fixed_view::<3, 3>(col, row).transpose();
            self.cov.fixed_view_mut::<3, 3>(row, col).copy_from(&mirrored);
        }

        // The position block's only coupling to the inertial state: the
        // prior velocity uncertainty integrates into position over dt.
        add_pt_block(
            &mut self.pt_cov,
            &(prior.fixed_view::<3, 3>(6, 6).into_owned() * (dt32 * dt32)),
        );

        // Additive process noise
        add_block(
            &mut self.cov,
            0,
            0,
            &Matrix3::from_diagonal(&(self.noise.gyro_stability_noise * dt32)),
        );
        add_block(
            &mut self.cov,
            3,
            3,
            &Matrix3::from_diagonal(&(self.noise.gyro_white_noise * dt32)),
        );
        add_block(
            &mut self.cov,
            6,
            6,
            &Matrix3::from_diagonal(&(self.noise.accel_white_noise * dt32)),
        );
        add_block(
            &mut self.cov,
            9,
            9,
            &Matrix3::from_diagonal(&(self.noise.accel_stability_noise * dt32)),
        );
        add_pt_block(
            &mut self.pt_cov,
            &Matrix3::from_diagonal(&(self.noise.accel_white_noise * (0.5 * dt32 * dt32))),
        );
        self.pt_cov[(3, 3)] += self.noise.clock_stability_noise * dt32;

        // Project the mean forward
        let accel = self.avg_state.inertial_accel;
        self.avg_state.body_rate = imu_data.gyro - self.avg_state.gyro_bias.cast::<f64>();
        let orientation =
            rotation_vector_to_quaternion(&(self.avg_state.body_rate * dt)) * self.avg_state.orientation;
        let position =
            self.avg_state.position + self.avg_state.velocity * dt + 0.5 * accel * dt * dt;
        let velocity = self.avg_state.velocity + accel * dt;

        self.avg_state.position = position;
        self.avg_state.velocity = velocity;
        // Renormalization occurs during the measurement updates.
        self.avg_state.orientation = orientation;

        self.assert_invariants();
    }

    // ----- Measurement updates -----

    /// Fuse a reference unit vector known in the inertial frame with its
    /// measurement in the body frame (gravity-aided tilt correction, a star
    /// tracker fix, and the like). `error` is the observation variance and
    /// must be positive.
    ///
    /// The residual is the rotation vector of the shortest arc taking the
    /// reference onto the rotated observation. Only the two directions
    /// normal to the reference are observable, so the update runs as two
    /// sequential rank-one corrections over an orthonormal basis of that
    /// plane. When the residual lies along the reference (or vanishes) the
    /// basis falls back to whichever coordinate axis is farther from the
    /// reference, which keeps the geometry non-degenerate for
    /// (anti-)aligned observations.
    pub fn obs_vector(&mut self, reference: &Vector3<f64>, observation: &Vector3<f64>, error: f32) {
        let body_to_ecef = self.avg_state.orientation.conjugate();
        let obs_ref = linalg::rotate_vector(&body_to_ecef, observation);
        let residual: Vector3<f32> =
            quaternion_to_rotation_vector(&quaternion_from_two_vectors(reference, &obs_ref))
                .cast::<f32>();
        let reference: Vector3<f32> = reference.cast::<f32>();

        let eps = residual_separation_eps();
        let partner = match residual.try_normalize(0.0) {
            Some(direction) if (reference - direction).norm() > eps => direction,
            _ => {
                if reference.dot(&Vector3::x()).abs() < 0.707 {
                    Vector3::x()
                } else {
                    Vector3::y()
                }
            }
        };
        let col0 = reference.cross(&partner).normalize();
        let col1 = -reference.cross(&col0);

        // A pair of rank-one updates over the tangent basis is a strict win
        // over assembling the 2-row observation matrix.
        let mut update = InertialCorrection::zeros();
        for h in [col0, col1] {
            let obs_cov = h.dot(&(self.cov.fixed_view::<3, 3>(3, 3) * h));
            let gain: SVector<f32, 12> =
                self.cov.fixed_view::<12, 3>(0, 3) * h / (error + obs_cov);
            update += gain * h.dot(&residual);
            let decrement = gain * (h.transpose() * self.cov.fixed_view::<3, 12>(3, 0));
            self.cov -= decrement;
        }

        self.avg_state.apply_inertial_correction(&update);
        self.assert_invariants();
    }

    /// Scalar pseudorange update against a satellite at a known ECEF
    /// position. `accum` is the position/clock correction being threaded
    /// across the satellites of one epoch: the predicted range is formed
    /// from the mean plus the accumulated-but-unapplied correction, the
    /// gain is folded into the accumulator, and the mean is left untouched.
    /// Apply the accumulator once after the last satellite (see
    /// [`crate::measurements::GnssEpoch`]).
    pub fn obs_gps_pseudorange(
        &mut self,
        accum: &mut PositionClockCorrection,
        sat_pos: &Vector3<f64>,
        pseudorange: f64,
        error: f32,
    ) {
        let corrected =
            self.avg_state.position + accum.fixed_rows::<3>(0).into_owned().cast::<f64>();
        let mut direction = corrected - sat_pos;
        let mut prediction = direction.norm();
        direction /= prediction;
        prediction += self.avg_state.clock_bias + accum[3] as f64;

        let mut observation = SVector::<f32, 4>::zeros();
        observation
            .fixed_rows_mut::<3>(0)
            .copy_from(&direction.cast::<f32>());
        observation[3] = 1.0;

        let innovation_cov = observation.dot(&(self.pt_cov * observation));
        let residual = pseudorange - prediction;
        let gain: PositionClockCorrection = self.pt_cov * observation / (innovation_cov + error);
        *accum += gain * residual as f32;
        let decrement = gain * (observation.transpose() * self.pt_cov);
        self.pt_cov -= decrement;

        self.assert_invariants();
    }

    /// Scalar deltarange update against a satellite with a known ECEF
    /// velocity. The observation is the magnitude of the relative velocity;
    /// `accum` threads the 12-element inertial correction across the epoch
    /// the same way the pseudorange accumulator does.
    pub fn obs_gps_deltarange(
        &mut self,
        accum: &mut InertialCorrection,
        sat_vel: &Vector3<f64>,
        deltarange: f64,
        error: f32,
    ) {
        let corrected =
            self.avg_state.velocity + accum.fixed_rows::<3>(6).into_owned().cast::<f64>();
        let mut direction = corrected - sat_vel;
        let prediction = direction.norm();
        direction /= prediction;

        let observation: Vector3<f32> = direction.cast::<f32>();

        let innovation_cov = observation.dot(&(self.cov.fixed_view::<3, 3>(6, 6) * observation));
        let residual = deltarange - prediction;
        let gain: InertialCorrection =
            self.cov.fixed_view::<12, 3>(0, 6) * observation / (innovation_cov + error);
        *accum += gain * residual as f32;
        let decrement = gain * (observation.transpose() * self.cov.fixed_view::<3, 12>(6, 0));
        self.cov -= decrement;

        self.assert_invariants();
    }

    /// Fuse an external position/velocity fix with per-axis error
    /// variances, applying the corrections internally.
    ///
    /// Each leg runs as three sequential scalar updates, one per axis,
    /// against that axis's diagonal variance plus the supplied error;
    /// sequentializing is benign because the axes are observed with
    /// diagonal measurement covariance. The residual seen by axis `i` is
    /// reduced by the correction already accumulated along that axis, which
    /// is what makes the sequence equivalent to the joint update.
    pub fn obs_gps_pv_report(
        &mut self,
        position: &Vector3<f64>,
        velocity: &Vector3<f64>,
        position_error: &Vector3<f32>,
        velocity_error: &Vector3<f32>,
    ) {
        // Position leg, against the position/clock block
        {
            let residual = position - self.avg_state.position;
            let mut update = PositionClockCorrection::zeros();
            for i in 0..3 {
                let innovation_cov_inv = 1.0 / (self.pt_cov[(i, i)] + position_error[i]);
                let gain: PositionClockCorrection =
                    self.pt_cov.column(i).into_owned() * innovation_cov_inv;
                update += gain * (residual[i] as f32 - update[i]);
                let decrement = gain * self.pt_cov.row(i).into_owned();
                self.pt_cov -= decrement;
            }
            self.avg_state.apply_position_correction(&update);
        }

        // Velocity leg, against the velocity diagonal of the inertial block
        {
            let residual: Vector3<f32> = (velocity - self.avg_state.velocity).cast::<f32>();
            let mut update = InertialCorrection::zeros();
            for i in 0..3 {
                let innovation_cov_inv = 1.0 / (self.cov[(6 + i, 6 + i)] + velocity_error[i]);
                let gain: InertialCorrection =
                    self.cov.column(6 + i).into_owned() * innovation_cov_inv;
                update += gain * (residual[i] - update[6 + i]);
                let decrement = gain * self.cov.row(6 + i).into_owned();
                self.cov -= decrement;
            }
            self.avg_state.apply_inertial_correction(&update);
        }

        self.assert_invariants();
    }

    // ----- Diagnostics -----

    /// Angular distance in radians between a reference attitude and the
    /// current estimate.
    pub fn angular_error(&self, reference: &Quaternion<f64>) -> f64 {
        linalg::angular_distance(reference, &self.avg_state.orientation)
    }

    /// Euclidean distance between a reference gyro bias and the estimate.
    pub fn gyro_bias_error(&self, gyro_bias: &Vector3<f32>) -> f32 {
        (self.avg_state.gyro_bias - gyro_bias).norm()
    }

    /// Euclidean distance between a reference accelerometer bias and the
    /// estimate.
    pub fn accel_bias_error(&self, accel_bias: &Vector3<f32>) -> f32 {
        (self.avg_state.accel_bias - accel_bias).norm()
    }

    /// Covariance-weighted distance from the mean to a test state:
    /// `sqrt(d' P⁻¹ d)` evaluated blockwise over the 12- and 4-dimensional
    /// error partitions via LU solves. Returns `None` when either solve
    /// fails, which is the symptom of an ill-conditioned covariance.
    pub fn mahalanobis_distance(&self, point: &NavState) -> Option<f32> {
        let delta = NavState::sigma_point_difference(&self.avg_state, point);
        let inertial = delta.fixed_rows::<12>(0).into_owned();
        let position = delta.fixed_rows::<4>(12).into_owned();

        let inertial_solved = self.cov.lu().solve(&inertial)?;
        let position_solved = self.pt_cov.lu().solve(&position)?;

        Some((inertial.dot(&inertial_solved) + position.dot(&position_solved)).sqrt())
    }

    // ----- Invariants -----

    /// True when every entry of the mean state and both covariance blocks
    /// is finite.
    pub fn is_real(&self) -> bool {
        self.cov.iter().all(|x| x.is_finite())
            && self.pt_cov.iter().all(|x| x.is_finite())
            && self.avg_state.is_real()
    }

    /// True when the filter is finite and the orientation quaternion is
    /// within tolerance of unit norm.
    pub fn invariants_met(&self) -> bool {
        self.is_real()
            && (1.0 - 1.0 / self.avg_state.orientation.norm()).abs()
                < linalg::quaternion_norm_tolerance()
    }

    fn assert_invariants(&self) {
        assert!(
            self.invariants_met(),
            "navigation filter state is no longer finite and normalized; the estimate cannot be recovered"
        );
    }
}

// The covariance propagation decomposes into three small primitives on 3x3
// sub-blocks, applied at each nonzero entry of the transition Jacobian.

/// `dst[dst_row, dst_col] += src[src_row, src_col] * mult'`
fn sgemm(
    dst: &mut InertialCovariance,
    dst_row: usize,
    dst_col: usize,
    mult: &Matrix3<f32>,
    src: &InertialCovariance,
    src_row: usize,
    src_col: usize,
) {
    let product = src.fixed_view::<3, 3>(src_row, src_col) * mult.transpose();
    add_block(dst, dst_row, dst_col, &product);
}

/// `dst[dst_row, dst_col] += mult * src[src_row, src_col] + src[src_col, src_row] * mult'`
/// for symmetric `dst`.
fn ssyr2k(
    dst: &mut InertialCovariance,
    dst_row: usize,
    dst_col: usize,
    mult: &Matrix3<f32>,
    src: &InertialCovariance,
    src_row: usize,
    src_col: usize,
) {
    let product = mult * src.fixed_view::<3, 3>(src_row, src_col)
        + src.fixed_view::<3, 3>(src_col, src_row) * mult.transpose();
    add_block(dst, dst_row, dst_col, &product);
}

/// `dst[dst_row, dst_col] += mult * src[src_row, src_col] * mult'` for
/// symmetric `dst` and symmetric source block.
fn sgemmm(
    dst: &mut InertialCovariance,
    dst_row: usize,
    dst_col: usize,
    mult: &Matrix3<f32>,
    src: &InertialCovariance,
    src_row: usize,
    src_col: usize,
) {
    let product = mult * src.fixed_view::<3, 3>(src_row, src_col) * mult.transpose();
    add_block(dst, dst_row, dst_col, &product);
}

fn add_block(dst: &mut InertialCovariance, row: usize, col: usize, increment: &Matrix3<f32>) {
    let mut block = dst.fixed_view_mut::<3, 3>(row, col);
    block += increment;
}

fn add_pt_block(dst: &mut PositionClockCovariance, increment: &Matrix3<f32>) {
    let mut block = dst.fixed_view_mut::<3, 3>(0, 0);
    block += increment;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use earth::STANDARD_GRAVITY;

    fn quiet_noise() -> ProcessNoise {
        crate::ImuGrade::Navigation.process_noise()
    }

    /// A filter parked on the equator with tight, well-conditioned
    /// covariance, ready for measurement tests.
    fn settled_filter() -> QuaternionKalmanFilter {
        let mut filter = QuaternionKalmanFilter::new(quiet_noise());
        filter.init_position(
            Vector3::new(earth::EQUATORIAL_RADIUS, 0.0, 0.0),
            Vector3::from_element(100.0),
        );
        filter.init_velocity(Vector3::zeros(), Vector3::from_element(1.0));
        filter.init_attitude(Quaternion::identity(), Matrix3::from_diagonal_element(1e-2));
        filter
    }

    #[test]
    fn default_priors_match_documentation() {
        let filter = QuaternionKalmanFilter::default();
        let gyro_var = DEFAULT_GYRO_BIAS_STD * DEFAULT_GYRO_BIAS_STD;
        for i in 0..3 {
            assert_approx_eq!(filter.cov[(i, i)], gyro_var, 1e-6);
            assert_approx_eq!(filter.cov[(3 + i, 3 + i)], DEFAULT_ATTITUDE_VAR, 1e-5);
            assert_approx_eq!(filter.cov[(6 + i, 6 + i)], DEFAULT_VELOCITY_VAR, 1e-4);
            assert_approx_eq!(filter.cov[(9 + i, 9 + i)], 0.09, 1e-6);
            assert_approx_eq!(filter.pt_cov[(i, i)], 1e10, 1e4);
        }
        assert_approx_eq!(filter.pt_cov[(3, 3)], 9e4, 1e-1);
        // all off-diagonals zero
        for i in 0..12 {
            for j in 0..12 {
                if i != j {
                    assert_eq!(filter.cov[(i, j)], 0.0);
                }
            }
        }
        assert!(filter.invariants_met());
    }

    #[test]
    fn init_zeroes_cross_covariance() {
        let mut filter = QuaternionKalmanFilter::default();
        // Seed every off-diagonal entry of the velocity strips
        for i in 0..12 {
            for j in 0..12 {
                filter.cov[(i, j)] = 0.5;
            }
        }
        let velocity = Vector3::new(1.0, -2.0, 3.0);
        filter.init_velocity(velocity, Vector3::new(4.0, 5.0, 6.0));
        assert_eq!(filter.avg_state.velocity, velocity);
        for i in 6..9 {
            for j in 0..12 {
                let expected = if i == j {
                    (i - 5) as f32 + 3.0
                } else {
                    0.0
                };
                assert_eq!(filter.cov[(i, j)], expected);
                assert_eq!(filter.cov[(j, i)], expected);
            }
        }
    }

    #[test]
    fn init_position_resets_clock_variance() {
        let mut filter = QuaternionKalmanFilter::default();
        filter.pt_cov[(3, 3)] = 1.0;
        filter.init_position(Vector3::new(earth::EQUATORIAL_RADIUS, 0.0, 0.0), Vector3::from_element(25.0));
        assert_approx_eq!(filter.pt_cov[(3, 3)], 9e4, 1e-1);
        for i in 0..3 {
            assert_approx_eq!(filter.pt_cov[(i, i)], 25.0, 1e-6);
        }
        assert_eq!(filter.pt_cov[(0, 1)], 0.0);
        assert_eq!(filter.pt_cov[(0, 3)], 0.0);
    }

    #[test]
    fn zero_interval_predict_is_identity() {
        let mut filter = settled_filter();
        let before = filter.clone();
        filter.predict_ecef(IMUData::default(), 0.0);
        assert_eq!(filter.avg_state.position, before.avg_state.position);
        assert_eq!(filter.avg_state.velocity, before.avg_state.velocity);
        assert_eq!(filter.avg_state.orientation, before.avg_state.orientation);
        for i in 0..12 {
            for j in 0..12 {
                assert_approx_eq!(filter.cov[(i, j)], before.cov[(i, j)], 1e-9);
            }
        }
        for i in 0..4 {
            for j in 0..4 {
                assert_approx_eq!(filter.pt_cov[(i, j)], before.pt_cov[(i, j)], 1e-9);
            }
        }
    }

    #[test]
    fn predict_caches_kinematics() {
        let mut filter = settled_filter();
        let gyro = Vector3::new(0.01, -0.02, 0.005);
        let accel = Vector3::new(STANDARD_GRAVITY, 0.1, 0.0);
        filter.predict_ecef(IMUData::new(accel, gyro), 0.01);
        assert_approx_eq!(filter.avg_state.body_rate[0], 0.01, 1e-9);
        assert_approx_eq!(filter.avg_state.body_rate[1], -0.02, 1e-9);
        // At the equator with identity attitude, gravity cancels the x
        // specific force; the y channel remains.
        assert_approx_eq!(filter.avg_state.inertial_accel[0], 0.0, 1e-6);
        assert_approx_eq!(filter.avg_state.inertial_accel[1], 0.1, 1e-9);
    }

    #[test]
    fn predict_integrates_constant_acceleration() {
        let mut filter = settled_filter();
        let dt = 0.5;
        // 1 m/s^2 along +y on top of gravity compensation
        let accel = Vector3::new(STANDARD_GRAVITY, 1.0, 0.0);
        filter.predict_ecef(IMUData::new(accel, Vector3::zeros()), dt);
        assert_approx_eq!(filter.avg_state.velocity[1], 0.5, 1e-9);
        assert_approx_eq!(
            filter.avg_state.position[1],
            0.5 * 1.0 * dt * dt,
            1e-9
        );
    }

    #[test]
    fn predict_couples_velocity_into_position() {
        let mut filter = settled_filter();
        let velocity_var = filter.cov[(6, 6)];
        let position_var = filter.pt_cov[(0, 0)];
        let dt = 0.1;
        filter.predict_ecef(
            IMUData::new(Vector3::new(STANDARD_GRAVITY, 0.0, 0.0), Vector3::zeros()),
            dt,
        );
        let dt2 = (dt * dt) as f32;
        let expected = position_var
            + dt2 * velocity_var
            + 0.5 * dt2 * quiet_noise().accel_white_noise[0];
        assert_approx_eq!(filter.pt_cov[(0, 0)], expected, expected * 1e-5);
    }

    #[test]
    fn aligned_vector_observation_contracts_attitude_covariance() {
        let mut filter = settled_filter();
        let up = Vector3::x();
        let trace_before: f32 = (0..3).map(|i| filter.cov[(3 + i, 3 + i)]).sum();
        filter.obs_vector(&up, &up, 1e-6);
        let trace_after: f32 = (0..3).map(|i| filter.cov[(3 + i, 3 + i)]).sum();
        assert!(trace_after < trace_before);
        // Zero residual: the mean must not move.
        assert_approx_eq!(filter.angular_error(&Quaternion::identity()), 0.0, 1e-9);
        assert_eq!(filter.avg_state.gyro_bias, Vector3::zeros());
    }

    #[test]
    fn tilted_vector_observation_corrects_attitude() {
        let mut filter = settled_filter();
        // True attitude tilted 0.05 rad about y; filter believes identity.
        let tilt = rotation_vector_to_quaternion(&Vector3::new(0.0, 0.05, 0.0));
        let reference = Vector3::x();
        // What a body-frame sensor would report for the reference direction
        // under the true attitude: obs = R_true(ref).
        let observation = linalg::rotate_vector(&tilt, &reference);
        let error_before = filter.angular_error(&tilt);
        for _ in 0..8 {
            filter.obs_vector(&reference, &observation, 1e-4);
        }
        let error_after = filter.angular_error(&tilt);
        assert!(
            error_after < error_before,
            "attitude error should shrink: {} -> {}",
            error_before,
            error_after
        );
    }

    #[test]
    fn vector_observation_survives_antiparallel_geometry() {
        let mut filter = settled_filter();
        // Observation antiparallel to the reference forces the fallback
        // basis; the filter must stay finite.
        filter.obs_vector(&Vector3::x(), &(-Vector3::x()), 1e-2);
        assert!(filter.invariants_met());
        // And with a reference along x, the fallback partner axis is y.
        filter.obs_vector(&Vector3::z(), &Vector3::z(), 1e-2);
        assert!(filter.invariants_met());
    }

    #[test]
    fn pseudorange_update_contracts_position_covariance() {
        let mut filter = settled_filter();
        let sat = Vector3::new(2.6e7, 0.0, 0.0);
        let range = (filter.avg_state.position - sat).norm();
        let mut accum = PositionClockCorrection::zeros();
        let trace_before: f32 = (0..4).map(|i| filter.pt_cov[(i, i)]).sum();
        filter.obs_gps_pseudorange(&mut accum, &sat, range, 4.0);
        let trace_after: f32 = (0..4).map(|i| filter.pt_cov[(i, i)]).sum();
        assert!(trace_after < trace_before);
        // Consistent measurement: no accumulated correction.
        for i in 0..4 {
            assert_approx_eq!(accum[i], 0.0, 1e-4);
        }
    }

    #[test]
    fn deltarange_update_contracts_velocity_covariance() {
        let mut filter = settled_filter();
        let sat_vel = Vector3::new(0.0, 3874.0, 0.0);
        let rate = (filter.avg_state.velocity - sat_vel).norm();
        let mut accum = InertialCorrection::zeros();
        let trace_before: f32 = (0..3).map(|i| filter.cov[(6 + i, 6 + i)]).sum();
        filter.obs_gps_deltarange(&mut accum, &sat_vel, rate, 0.25);
        let trace_after: f32 = (0..3).map(|i| filter.cov[(6 + i, 6 + i)]).sum();
        assert!(trace_after < trace_before);
    }

    #[test]
    fn pv_report_pulls_mean_toward_fix() {
        let mut filter = settled_filter();
        let fix_position = filter.avg_state.position + Vector3::new(30.0, -20.0, 10.0);
        let fix_velocity = Vector3::new(1.0, 2.0, -1.0);
        filter.obs_gps_pv_report(
            &fix_position,
            &fix_velocity,
            &Vector3::from_element(1.0),
            &Vector3::from_element(0.01),
        );
        // Position prior variance 100 m^2 against 1 m^2 of measurement
        // noise: the mean should move nearly all the way.
        for i in 0..3 {
            assert_approx_eq!(
                filter.avg_state.position[i],
                fix_position[i],
                1.0
            );
            assert_approx_eq!(filter.avg_state.velocity[i], fix_velocity[i], 0.1);
        }
    }

    #[test]
    fn mahalanobis_distance_to_self_is_zero() {
        let filter = settled_filter();
        let d = filter
            .mahalanobis_distance(&filter.avg_state)
            .expect("well-conditioned covariance must solve");
        assert_approx_eq!(d, 0.0, 1e-6);
    }

    #[test]
    fn mahalanobis_distance_scales_with_uncertainty() {
        let filter = settled_filter();
        let mut point = filter.avg_state;
        point.position[0] += 10.0;
        let d = filter.mahalanobis_distance(&point).unwrap();
        // 10 m offset at 10 m std is one sigma
        assert_approx_eq!(d, 1.0, 1e-3);
    }

    #[test]
    fn bias_error_diagnostics() {
        let filter = settled_filter();
        assert_approx_eq!(
            filter.gyro_bias_error(&Vector3::new(0.3, 0.0, 0.4)),
            0.5,
            1e-6
        );
        assert_approx_eq!(
            filter.accel_bias_error(&Vector3::new(0.0, 0.0, 0.0)),
            0.0,
            1e-6
        );
    }

    #[test]
    #[should_panic(expected = "non-negative")]
    fn negative_interval_is_rejected() {
        let mut filter = settled_filter();
        filter.predict_ecef(IMUData::default(), -0.01);
    }
}
