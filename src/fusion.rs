use crate::types::{Finger, Hand, Orientation};
use ahrs::{Ahrs, Madgwick};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};

/// Telemetry arrives at ~100 Hz; the filter integrates at that fixed step.
const SAMPLE_PERIOD: f32 = 1.0 / 100.0;
/// Madgwick gain tuned for the controller IMU.
const BETA: f32 = 0.0315;

/// Per-hand sensor fusion: corrected gyro + accel in, oriented quaternion out.
///
/// Uses relative orientation only — the magnetometer is deliberately left
/// out of the filter because absolute fusion drifts too much on this
/// hardware. The raw filter quaternion is remapped per hand and composed
/// with a yaw correction derived from finger curl (see
/// [`finger_avg_curl`]), which compensates a known drift artifact.
pub struct OrientationEstimator {
    hand: Hand,
    filter: Madgwick<f32>,
}

impl OrientationEstimator {
    pub fn new(hand: Hand) -> Self {
        OrientationEstimator {
            hand,
            filter: Madgwick::new(SAMPLE_PERIOD, BETA),
        }
    }

    /// Advance the filter by one sample and read back the oriented state.
    ///
    /// `gyro` in rad/s (bias-corrected), `accel` in g, `curl_deg` from
    /// [`finger_avg_curl`]. A degenerate accel sample (zero norm) skips the
    /// filter step and re-reports the previous orientation.
    pub fn update(
        &mut self,
        gyro: Vector3<f32>,
        accel: Vector3<f32>,
        curl_deg: f32,
    ) -> Orientation {
        if self.filter.update_imu(&gyro, &accel).is_err() {
            log::trace!("degenerate accel sample, filter step skipped");
        }

        // Filter quaternion coords are [x, y, z, w].
        let c = self.filter.quat.coords;
        let (qx, qy, qz, qw) = (c[0], c[1], c[2], c[3]);

        let roll = (2.0 * (qw * qx + qy * qz))
            .atan2(1.0 - 2.0 * (qx * qx + qy * qy))
            .to_degrees();
        let pitch = (-2.0 * (qx * qz - qw * qy))
            .clamp(-1.0, 1.0)
            .asin()
            .to_degrees();
        let yaw = (2.0 * (qx * qy + qw * qz))
            .atan2(1.0 - 2.0 * (qy * qy + qz * qz))
            .to_degrees();

        let mirrored = match self.hand {
            Hand::Right => Quaternion::new(qw, -qy, qx, qz),
            Hand::Left => Quaternion::new(qw, qy, -qx, qz),
        };
        let yaw_correction = UnitQuaternion::from_axis_angle(
            &Vector3::y_axis(),
            (curl_deg - 45.0).to_radians(),
        );
        let quat = UnitQuaternion::from_quaternion(mirrored) * yaw_correction;

        let (er, ep, ey) = quat.euler_angles();
        Orientation {
            quat,
            roll,
            pitch,
            yaw,
            euler: Vector3::new(er.to_degrees(), ep.to_degrees(), ey.to_degrees()),
        }
    }
}

/// Average finger curl in degrees, 0..=45.
///
/// Mean of (pull + force) / 2 over index..pinky, then scaled by 45/90. The
/// thumb does not participate.
pub fn finger_avg_curl(fingers: &[Finger; 5]) -> f32 {
    let avg = fingers[1..]
        .iter()
        .map(|f| (f.pull + f.force) / 2.0)
        .sum::<f32>()
        / 4.0;
    45.0 * avg / 90.0
}
