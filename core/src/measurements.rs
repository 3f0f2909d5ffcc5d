//! Observation value types for the navigation filter.
//!
//! The filter's update methods are deliberately low-level: scalar GNSS
//! updates thread caller-owned accumulators so that a whole epoch of
//! satellites shares one linearization point. This module provides the
//! value types that sit on top of that interface: a direction observation,
//! a per-satellite GNSS observation, an epoch that runs the canonical
//! multi-satellite loop, and a bundled position/velocity fix.

use crate::kalman::QuaternionKalmanFilter;
use crate::{InertialCorrection, PositionClockCorrection};

use log::debug;
use nalgebra::Vector3;
use std::fmt::{self, Display};

/// A unit reference direction known in the inertial frame together with its
/// measurement in the body frame; gravity-aided tilt corrections and star
/// tracker fixes both take this shape.
#[derive(Clone, Copy, Debug)]
pub struct DirectionObservation {
    /// Reference unit vector, ECEF
    pub reference: Vector3<f64>,
    /// Observed unit vector, body frame
    pub observed: Vector3<f64>,
    /// Observation variance, rad^2
    pub variance: f32,
}

impl DirectionObservation {
    pub fn apply(&self, filter: &mut QuaternionKalmanFilter) {
        filter.obs_vector(&self.reference, &self.observed, self.variance);
    }
}

impl Display for DirectionObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DirectionObservation(ref: [{:.4}, {:.4}, {:.4}], obs: [{:.4}, {:.4}, {:.4}], var: {})",
            self.reference[0],
            self.reference[1],
            self.reference[2],
            self.observed[0],
            self.observed[1],
            self.observed[2],
            self.variance
        )
    }
}

/// One satellite's range-domain observations for a single epoch.
#[derive(Clone, Copy, Debug)]
pub struct SatelliteObservation {
    /// Satellite position in meters, ECEF
    pub position: Vector3<f64>,
    /// Satellite velocity in m/s, ECEF
    pub velocity: Vector3<f64>,
    /// Measured pseudorange in meters
    pub pseudorange: f64,
    /// Measured deltarange in m/s
    pub deltarange: f64,
    /// Pseudorange variance, m^2
    pub pseudorange_variance: f32,
    /// Deltarange variance, (m/s)^2
    pub deltarange_variance: f32,
}

impl Display for SatelliteObservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SatelliteObservation(pos: [{:.0}, {:.0}, {:.0}] m, rho: {:.2} m, rho_dot: {:.3} m/s)",
            self.position[0],
            self.position[1],
            self.position[2],
            self.pseudorange,
            self.deltarange
        )
    }
}

/// All satellites observed at one GNSS epoch.
///
/// [`apply`](Self::apply) runs the canonical sequential update: both
/// accumulators are threaded through every satellite and only applied to
/// the mean after the last one. The Kalman gains depend on the covariance,
/// which the scalar updates do advance, but the mean's linearization point
/// stays fixed for the whole epoch; the accumulators carry the un-applied
/// correction instead. This sequential form is equivalent to a joint batch
/// update when the residuals are consistent, and never factors a large
/// innovation matrix.
#[derive(Clone, Debug, Default)]
pub struct GnssEpoch {
    pub satellites: Vec<SatelliteObservation>,
}

impl GnssEpoch {
    pub fn new(satellites: Vec<SatelliteObservation>) -> Self {
        GnssEpoch { satellites }
    }

    /// Apply every satellite's pseudorange and deltarange to the filter,
    /// then fold the accumulated corrections into the mean.
    pub fn apply(&self, filter: &mut QuaternionKalmanFilter) {
        if self.satellites.is_empty() {
            return;
        }
        let mut range_accum = PositionClockCorrection::zeros();
        let mut rate_accum = InertialCorrection::zeros();
        for satellite in &self.satellites {
            filter.obs_gps_pseudorange(
                &mut range_accum,
                &satellite.position,
                satellite.pseudorange,
                satellite.pseudorange_variance,
            );
            filter.obs_gps_deltarange(
                &mut rate_accum,
                &satellite.velocity,
                satellite.deltarange,
                satellite.deltarange_variance,
            );
        }
        filter.avg_state.apply_position_correction(&range_accum);
        filter.avg_state.apply_inertial_correction(&rate_accum);
        debug!(
            "applied GNSS epoch with {} satellites (position correction norm {:.3} m)",
            self.satellites.len(),
            range_accum.fixed_rows::<3>(0).norm()
        );
        assert!(
            filter.invariants_met(),
            "navigation filter state is no longer finite and normalized; the estimate cannot be recovered"
        );
    }
}

impl Display for GnssEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GnssEpoch({} satellites)", self.satellites.len())
    }
}

/// An external position/velocity fix with per-axis error variances, e.g. a
/// receiver's own navigation solution.
#[derive(Clone, Copy, Debug)]
pub struct PvFix {
    /// Position in meters, ECEF
    pub position: Vector3<f64>,
    /// Velocity in m/s, ECEF
    pub velocity: Vector3<f64>,
    /// Per-axis position variance, m^2
    pub position_variance: Vector3<f32>,
    /// Per-axis velocity variance, (m/s)^2
    pub velocity_variance: Vector3<f32>,
}

impl PvFix {
    pub fn apply(&self, filter: &mut QuaternionKalmanFilter) {
        filter.obs_gps_pv_report(
            &self.position,
            &self.velocity,
            &self.position_variance,
            &self.velocity_variance,
        );
    }
}

impl Display for PvFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PvFix(pos: [{:.1}, {:.1}, {:.1}] m, vel: [{:.2}, {:.2}, {:.2}] m/s)",
            self.position[0],
            self.position[1],
            self.position[2],
            self.velocity[0],
            self.velocity[1],
            self.velocity[2]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::earth;
    use crate::ImuGrade;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{Matrix3, Quaternion};

    fn test_filter() -> QuaternionKalmanFilter {
        let mut filter = QuaternionKalmanFilter::new(ImuGrade::Navigation.process_noise());
        filter.init_position(
            earth::geodetic_to_ecef(0.0, 0.0, 100.0),
            Vector3::from_element(2500.0),
        );
        filter.init_velocity(Vector3::zeros(), Vector3::from_element(4.0));
        filter.init_attitude(Quaternion::identity(), Matrix3::from_diagonal_element(1e-2));
        filter
    }

    /// Satellites above the test site, with MEO-class tangential velocities.
    fn consistent_epoch(filter: &QuaternionKalmanFilter) -> GnssEpoch {
        let directions = [
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.8, 0.5, 0.0),
            Vector3::new(0.7, 0.0, 0.6),
            Vector3::new(0.8, -0.3, -0.4),
        ];
        let satellites = directions
            .iter()
            .map(|d| {
                let position = d.normalize() * 2.66e7;
                let velocity = d.cross(&Vector3::z()).normalize() * 3874.0;
                SatelliteObservation {
                    position,
                    velocity,
                    pseudorange: (filter.avg_state.position - position).norm()
                        + filter.avg_state.clock_bias,
                    deltarange: (filter.avg_state.velocity - velocity).norm(),
                    pseudorange_variance: 9.0,
                    deltarange_variance: 0.25,
                }
            })
            .collect();
        GnssEpoch::new(satellites)
    }

    #[test]
    fn epoch_contracts_covariance_without_moving_consistent_mean() {
        let mut filter = test_filter();
        let epoch = consistent_epoch(&filter);
        let position_before = filter.avg_state.position;
        let pt_trace_before: f32 = (0..4).map(|i| filter.pt_cov[(i, i)]).sum();
        let vel_trace_before: f32 = (0..3).map(|i| filter.cov[(6 + i, 6 + i)]).sum();

        epoch.apply(&mut filter);

        let pt_trace_after: f32 = (0..4).map(|i| filter.pt_cov[(i, i)]).sum();
        let vel_trace_after: f32 = (0..3).map(|i| filter.cov[(6 + i, 6 + i)]).sum();
        assert!(pt_trace_after < pt_trace_before);
        assert!(vel_trace_after < vel_trace_before);
        // Residuals consistent with the mean: the mean barely moves.
        for i in 0..3 {
            assert_approx_eq!(filter.avg_state.position[i], position_before[i], 1e-2);
        }
    }

    #[test]
    fn empty_epoch_is_a_no_op() {
        let mut filter = test_filter();
        let before_position = filter.avg_state.position;
        let before_cov = filter.pt_cov;
        GnssEpoch::default().apply(&mut filter);
        assert_eq!(filter.avg_state.position, before_position);
        assert_eq!(filter.pt_cov, before_cov);
    }

    #[test]
    fn direction_observation_applies() {
        let mut filter = test_filter();
        let up = earth::up_direction(&filter.avg_state.position).unwrap();
        let trace_before: f32 = (0..3).map(|i| filter.cov[(3 + i, 3 + i)]).sum();
        DirectionObservation {
            reference: up,
            observed: up,
            variance: 1e-4,
        }
        .apply(&mut filter);
        let trace_after: f32 = (0..3).map(|i| filter.cov[(3 + i, 3 + i)]).sum();
        assert!(trace_after < trace_before);
    }

    #[test]
    fn pv_fix_applies() {
        let mut filter = test_filter();
        let fix = PvFix {
            position: filter.avg_state.position + Vector3::new(5.0, 0.0, 0.0),
            velocity: Vector3::new(0.5, 0.0, 0.0),
            position_variance: Vector3::from_element(4.0),
            velocity_variance: Vector3::from_element(0.04),
        };
        fix.apply(&mut filter);
        assert!(filter.avg_state.position[0] > earth::geodetic_to_ecef(0.0, 0.0, 100.0)[0]);
        assert!(filter.avg_state.velocity[0] > 0.0);
    }

    #[test]
    fn display_formats() {
        let epoch = GnssEpoch::default();
        assert!(format!("{}", epoch).contains("0 satellites"));
        let obs = DirectionObservation {
            reference: Vector3::x(),
            observed: Vector3::x(),
            variance: 1.0,
        };
        assert!(format!("{}", obs).contains("DirectionObservation"));
        let fix = PvFix {
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            position_variance: Vector3::from_element(1.0),
            velocity_variance: Vector3::from_element(1.0),
        };
        assert!(format!("{}", fix).contains("PvFix"));
    }
}
