//! Synthetic scenarios and closed-loop simulation for the navigation filter.
//!
//! This module provides:
//! - [`ScenarioConfig`]: a serde-backed scenario description readable and
//!   writable as JSON, YAML, or TOML (chosen by file extension)
//! - Synthetic truth, IMU, and GNSS generation for stationary or
//!   constant-velocity trajectories
//! - [`run_closed_loop`]: a driver that feeds the filter IMU predictions
//!   and GNSS epochs and records the solution
//! - [`NavigationResult`]: one row of the navigation solution, with CSV
//!   import/export
//!
//! The simulated world is deliberately simple. The vehicle moves at a
//! constant ECEF velocity with a level, non-rotating body frame, so the
//! accelerometer truth is the local specific force of unaccelerated motion
//! and the gyro truth is zero. The GNSS constellation is synthesized
//! directly in ECEF at fixed look angles from the site and frozen for the
//! run; ephemeris evolution is an external concern. Every stochastic
//! element draws from a seeded generator, so a scenario re-runs exactly.

use crate::earth;
use crate::kalman::QuaternionKalmanFilter;
use crate::measurements::{DirectionObservation, GnssEpoch, SatelliteObservation};
use crate::{IMUData, ImuGrade};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use nalgebra::{Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Default seed value for reproducible simulations
fn default_seed() -> u64 {
    42
}

/// Description of a synthetic navigation scenario.
///
/// Angles are degrees, distances meters, rates SI. The per-sample IMU
/// noise standard deviations describe discrete samples at `imu_rate_hz`,
/// not continuous densities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Total scenario length in seconds
    pub duration_s: f64,
    /// IMU sample rate in Hz
    pub imu_rate_hz: f64,
    /// Interval between GNSS epochs in seconds
    pub gnss_interval_s: f64,
    /// Site latitude in degrees
    pub latitude_deg: f64,
    /// Site longitude in degrees
    pub longitude_deg: f64,
    /// Site altitude in meters
    pub altitude_m: f64,
    /// Constant vehicle velocity in the local East-North-Up frame, m/s
    pub velocity_enu: [f64; 3],
    /// IMU quality preset selecting the filter's process noise
    #[serde(default)]
    pub imu_grade: ImuGrade,
    /// Per-sample gyro noise standard deviation, rad/s
    pub gyro_noise_std: f64,
    /// Per-sample accelerometer noise standard deviation, m/s^2
    pub accel_noise_std: f64,
    /// True gyro bias, rad/s
    pub gyro_bias: [f64; 3],
    /// True accelerometer bias, m/s^2
    pub accel_bias: [f64; 3],
    /// True receiver clock bias as equivalent range, meters
    pub clock_bias_m: f64,
    /// Number of satellites in the synthesized constellation
    pub satellite_count: usize,
    /// Pseudorange noise standard deviation, meters
    pub pseudorange_noise_std: f64,
    /// Deltarange noise standard deviation, m/s
    pub deltarange_noise_std: f64,
    /// Feed a gravity-aided tilt observation at each GNSS epoch
    pub tilt_aiding: bool,
    /// Random number generator seed for deterministic reruns
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            duration_s: 60.0,
            imu_rate_hz: 100.0,
            gnss_interval_s: 1.0,
            latitude_deg: 39.0,
            longitude_deg: -77.0,
            altitude_m: 120.0,
            velocity_enu: [0.0, 0.0, 0.0],
            imu_grade: ImuGrade::default(),
            gyro_noise_std: 1e-3,
            accel_noise_std: 1e-2,
            gyro_bias: [2e-3, -1e-3, 5e-4],
            accel_bias: [0.05, -0.03, 0.02],
            clock_bias_m: 120.0,
            satellite_count: 6,
            pseudorange_noise_std: 3.0,
            deltarange_noise_std: 0.5,
            tilt_aiding: true,
            seed: default_seed(),
        }
    }
}

impl ScenarioConfig {
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }

    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }

    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

/// One row of the navigation solution, recorded at each GNSS epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NavigationResult {
    /// ISO UTC timestamp of the epoch
    pub timestamp: String,
    /// Seconds since the start of the scenario
    pub elapsed_s: f64,
    /// Estimated ECEF position, meters
    pub pos_x: f64,
    pub pos_y: f64,
    pub pos_z: f64,
    /// Estimated ECEF velocity, m/s
    pub vel_x: f64,
    pub vel_y: f64,
    pub vel_z: f64,
    /// Estimated attitude quaternion
    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    /// Estimated gyro bias, rad/s
    pub gyro_bias_x: f64,
    pub gyro_bias_y: f64,
    pub gyro_bias_z: f64,
    /// Estimated accelerometer bias, m/s^2
    pub accel_bias_x: f64,
    pub accel_bias_y: f64,
    pub accel_bias_z: f64,
    /// Estimated receiver clock bias, meters
    pub clock_bias: f64,
    /// Trace of the position covariance block, m^2
    pub position_variance: f64,
    /// Trace of the velocity covariance block, (m/s)^2
    pub velocity_variance: f64,
    /// Trace of the attitude covariance block, rad^2
    pub attitude_variance: f64,
    /// Distance from the estimated to the true position, meters
    pub position_error_m: f64,
    /// Distance from the estimated to the true velocity, m/s
    pub velocity_error_mps: f64,
}

impl NavigationResult {
    fn from_filter(
        filter: &QuaternionKalmanFilter,
        timestamp: DateTime<Utc>,
        elapsed_s: f64,
        truth_position: &Vector3<f64>,
        truth_velocity: &Vector3<f64>,
    ) -> Self {
        let state = &filter.avg_state;
        NavigationResult {
            timestamp: timestamp.format("%Y-%m-%d %H:%M:%S%.3f+00:00").to_string(),
            elapsed_s,
            pos_x: state.position[0],
            pos_y: state.position[1],
            pos_z: state.position[2],
            vel_x: state.velocity[0],
            vel_y: state.velocity[1],
            vel_z: state.velocity[2],
            qw: state.orientation.scalar(),
            qx: state.orientation.vector()[0],
            qy: state.orientation.vector()[1],
            qz: state.orientation.vector()[2],
            gyro_bias_x: state.gyro_bias[0] as f64,
            gyro_bias_y: state.gyro_bias[1] as f64,
            gyro_bias_z: state.gyro_bias[2] as f64,
            accel_bias_x: state.accel_bias[0] as f64,
            accel_bias_y: state.accel_bias[1] as f64,
            accel_bias_z: state.accel_bias[2] as f64,
            clock_bias: state.clock_bias,
            position_variance: (0..3).map(|i| filter.pt_cov[(i, i)] as f64).sum(),
            velocity_variance: (0..3).map(|i| filter.cov[(6 + i, 6 + i)] as f64).sum(),
            attitude_variance: (0..3).map(|i| filter.cov[(3 + i, 3 + i)] as f64).sum(),
            position_error_m: (state.position - truth_position).norm(),
            velocity_error_mps: (state.velocity - truth_velocity).norm(),
        }
    }

    /// Write navigation results to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record).map_err(io::Error::other)?;
        }
        writer.flush()
    }

    /// Read navigation results back from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> io::Result<Vec<Self>> {
        let mut reader = csv::Reader::from_path(path)?;
        reader
            .deserialize()
            .collect::<Result<Vec<Self>, _>>()
            .map_err(io::Error::other)
    }
}

/// Synthesize a frozen GNSS constellation above a site: `count` satellites
/// spread in azimuth at elevations between roughly 35 and 65 degrees, each
/// with an MEO-class tangential velocity.
pub fn make_constellation(site: &Vector3<f64>, count: usize) -> Vec<(Vector3<f64>, Vector3<f64>)> {
    let (lat, lon, _) = earth::ecef_to_geodetic(site);
    let enu = earth::enu_to_ecef_rotation(lat, lon);
    let east = enu * Vector3::x();
    let north = enu * Vector3::y();
    let up = enu * Vector3::z();

    (0..count)
        .map(|k| {
            let azimuth = 2.0 * std::f64::consts::PI * (k as f64) / (count as f64);
            let elevation = (35.0 + 30.0 * ((k % 3) as f64) / 2.0).to_radians();
            let direction = (up * elevation.sin()
                + (east * azimuth.cos() + north * azimuth.sin()) * elevation.cos())
            .normalize();
            let position = direction * 2.66e7;
            let velocity = match direction.cross(&Vector3::z()).try_normalize(1e-9) {
                Some(tangent) => tangent * 3874.0,
                None => Vector3::new(3874.0, 0.0, 0.0),
            };
            (position, velocity)
        })
        .collect()
}

/// Run a closed-loop GNSS-aided navigation scenario and return the recorded
/// solution, one row per GNSS epoch.
///
/// The filter is seeded near but not at the truth: tens of meters of
/// position error, a knot of velocity error, and a few degrees of tilt,
/// with honest covariance to match. IMU samples predict at `imu_rate_hz`;
/// each GNSS epoch applies every satellite's pseudorange and deltarange
/// through the shared accumulators, followed by an optional gravity-aided
/// tilt observation.
pub fn run_closed_loop(config: &ScenarioConfig) -> io::Result<Vec<NavigationResult>> {
    if config.imu_rate_hz <= 0.0 || config.gnss_interval_s <= 0.0 || config.satellite_count == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "scenario requires a positive IMU rate, a positive GNSS interval, and at least one satellite",
        ));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let gyro_noise = Normal::new(0.0, config.gyro_noise_std).map_err(io::Error::other)?;
    let accel_noise = Normal::new(0.0, config.accel_noise_std).map_err(io::Error::other)?;
    let range_noise = Normal::new(0.0, config.pseudorange_noise_std).map_err(io::Error::other)?;
    let rate_noise = Normal::new(0.0, config.deltarange_noise_std).map_err(io::Error::other)?;

    // Truth: constant ECEF velocity, level non-rotating body frame.
    let site = earth::geodetic_to_ecef(config.latitude_deg, config.longitude_deg, config.altitude_m);
    let enu = earth::enu_to_ecef_rotation(config.latitude_deg, config.longitude_deg);
    let truth_velocity = enu * Vector3::from_column_slice(&config.velocity_enu);
    let gravity_magnitude = earth::gravity(&config.latitude_deg, &config.altitude_m);
    let true_gyro_bias = Vector3::from_column_slice(&config.gyro_bias);
    let true_accel_bias = Vector3::from_column_slice(&config.accel_bias);

    let constellation = make_constellation(&site, config.satellite_count);
    info!(
        "running closed-loop scenario: {:.0} s at {:.0} Hz, {} satellites",
        config.duration_s, config.imu_rate_hz, constellation.len()
    );

    // Seed the filter near the truth with honest uncertainty.
    let mut filter = QuaternionKalmanFilter::new(config.imu_grade.process_noise());
    filter.init_position(site + Vector3::new(30.0, -40.0, 20.0), Vector3::from_element(2500.0));
    filter.init_velocity(truth_velocity + Vector3::new(0.5, -0.5, 0.2), Vector3::from_element(1.0));
    filter.init_attitude(
        crate::linalg::rotation_vector_to_quaternion(&Vector3::new(0.03, -0.02, 0.05)),
        Matrix3::from_diagonal_element(0.01),
    );

    let start = Utc::now();
    let dt = 1.0 / config.imu_rate_hz;
    let steps = (config.duration_s * config.imu_rate_hz).round() as usize;
    let epoch_stride = (config.gnss_interval_s * config.imu_rate_hz).round().max(1.0) as usize;

    let mut truth_position = site;
    let mut results = Vec::new();

    for step in 1..=steps {
        truth_position += truth_velocity * dt;

        // Unaccelerated motion: the accelerometer senses the reaction to
        // gravity along the local vertical, plus bias and noise.
        let up = earth::up_direction(&truth_position).unwrap_or_else(Vector3::zeros);
        let specific_force = up * gravity_magnitude;
        let accel = specific_force
            + true_accel_bias
            + Vector3::new(
                accel_noise.sample(&mut rng),
                accel_noise.sample(&mut rng),
                accel_noise.sample(&mut rng),
            );
        let gyro = true_gyro_bias
            + Vector3::new(
                gyro_noise.sample(&mut rng),
                gyro_noise.sample(&mut rng),
                gyro_noise.sample(&mut rng),
            );
        filter.predict_ecef(IMUData::new(accel, gyro), dt);

        if step % epoch_stride == 0 {
            let satellites = constellation
                .iter()
                .map(|(sat_pos, sat_vel)| SatelliteObservation {
                    position: *sat_pos,
                    velocity: *sat_vel,
                    pseudorange: (truth_position - sat_pos).norm()
                        + config.clock_bias_m
                        + range_noise.sample(&mut rng),
                    deltarange: (truth_velocity - sat_vel).norm() + rate_noise.sample(&mut rng),
                    pseudorange_variance: (config.pseudorange_noise_std as f32).powi(2).max(1e-4),
                    deltarange_variance: (config.deltarange_noise_std as f32).powi(2).max(1e-6),
                })
                .collect();
            GnssEpoch::new(satellites).apply(&mut filter);

            if config.tilt_aiding {
                // A level body frame observes the local vertical directly.
                DirectionObservation {
                    reference: up,
                    observed: up,
                    variance: (config.accel_noise_std as f32 / 9.81).powi(2).max(1e-6),
                }
                .apply(&mut filter);
            }

            let elapsed = step as f64 * dt;
            let timestamp = start + Duration::milliseconds((elapsed * 1000.0) as i64);
            let row = NavigationResult::from_filter(
                &filter,
                timestamp,
                elapsed,
                &truth_position,
                &truth_velocity,
            );
            debug!(
                "epoch at {:.1} s: position error {:.2} m, clock {:.1} m",
                elapsed, row.position_error_m, row.clock_bias
            );
            results.push(row);
        }
    }

    info!(
        "scenario complete: {} epochs, final position error {:.2} m",
        results.len(),
        results.last().map(|r| r.position_error_m).unwrap_or(f64::NAN)
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn short_config() -> ScenarioConfig {
        ScenarioConfig {
            duration_s: 5.0,
            imu_rate_hz: 50.0,
            gnss_interval_s: 1.0,
            ..ScenarioConfig::default()
        }
    }

    #[test]
    fn config_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.json");
        let config = ScenarioConfig::default();
        config.to_file(&path).unwrap();
        let loaded = ScenarioConfig::from_file(&path).unwrap();
        assert_eq!(loaded.seed, config.seed);
        assert_approx_eq!(loaded.duration_s, config.duration_s, 1e-12);
        assert_eq!(loaded.imu_grade, config.imu_grade);
    }

    #[test]
    fn config_toml_and_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScenarioConfig::default();
        for name in ["scenario.toml", "scenario.yaml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let loaded = ScenarioConfig::from_file(&path).unwrap();
            assert_approx_eq!(loaded.clock_bias_m, config.clock_bias_m, 1e-12);
        }
    }

    #[test]
    fn config_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.xml");
        assert!(ScenarioConfig::default().to_file(&path).is_err());
    }

    #[test]
    fn constellation_sits_above_the_site() {
        let site = earth::geodetic_to_ecef(39.0, -77.0, 120.0);
        let up = earth::up_direction(&site).unwrap();
        let constellation = make_constellation(&site, 6);
        assert_eq!(constellation.len(), 6);
        for (position, velocity) in &constellation {
            // Above the horizon and well outside the atmosphere
            assert!((position - site).normalize().dot(&up) > 0.3);
            assert!(position.norm() > 2.0e7);
            // Tangential velocity, roughly orbital speed
            assert_approx_eq!(velocity.norm(), 3874.0, 1.0);
        }
    }

    #[test]
    fn closed_loop_run_converges_and_stays_finite() {
        let results = run_closed_loop(&short_config()).unwrap();
        assert_eq!(results.len(), 5);
        let first = results.first().unwrap();
        let last = results.last().unwrap();
        assert!(last.position_error_m.is_finite());
        // Started 50-odd meters off; GNSS should have pulled it well in.
        assert!(last.position_error_m < first.position_error_m.max(30.0));
        assert!(last.position_error_m < 30.0);
        assert!(last.velocity_error_mps < 2.0);
        // Clock estimate heads toward the configured 120 m offset.
        assert!((last.clock_bias - 120.0).abs() < 60.0);
        assert!(last.position_variance < first.position_variance);
    }

    #[test]
    fn closed_loop_is_deterministic_for_a_seed() {
        let a = run_closed_loop(&short_config()).unwrap();
        let b = run_closed_loop(&short_config()).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.pos_x, y.pos_x);
            assert_eq!(x.clock_bias, y.clock_bias);
        }
    }

    #[test]
    fn rejects_degenerate_configuration() {
        let mut config = short_config();
        config.satellite_count = 0;
        assert!(run_closed_loop(&config).is_err());
        let mut config = short_config();
        config.imu_rate_hz = 0.0;
        assert!(run_closed_loop(&config).is_err());
    }

    #[test]
    fn results_csv_round_trip() {
        let results = run_closed_loop(&short_config()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        NavigationResult::to_csv(&results, &path).unwrap();
        let loaded = NavigationResult::from_csv(&path).unwrap();
        assert_eq!(loaded.len(), results.len());
        assert_approx_eq!(loaded[0].pos_x, results[0].pos_x, 1e-9);
        assert_approx_eq!(loaded[0].elapsed_s, results[0].elapsed_s, 1e-9);
    }
}
