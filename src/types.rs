use crate::gesture::TapDetector;
use nalgebra::{UnitQuaternion, Vector3};

/// Which controller of the pair a frame or query refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hand {
    Left,
    Right,
}

impl Hand {
    pub const BOTH: [Hand; 2] = [Hand::Left, Hand::Right];

    /// Array index for per-hand storage.
    pub fn index(self) -> usize {
        match self {
            Hand::Left => 0,
            Hand::Right => 1,
        }
    }

    /// Command prefix letter: `BL+...` / `BR+...`.
    pub fn letter(self) -> char {
        match self {
            Hand::Left => 'L',
            Hand::Right => 'R',
        }
    }
}

impl std::fmt::Display for Hand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Hand::Left => "left",
            Hand::Right => "right",
        })
    }
}

bitflags::bitflags! {
    /// Click/button bitmap carried in payload byte 0.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const SYSTEM_BUTTON  = 1 << 0;
        const TRACKPAD_CLICK = 1 << 1;
        const TRACKPAD_TOUCH = 1 << 2;
        const THUMB_CLICK    = 1 << 3;
        const INDEX_CLICK    = 1 << 4;
        const MIDDLE_CLICK   = 1 << 5;
        const RING_CLICK     = 1 << 6;
        const PINKY_CLICK    = 1 << 7;
    }
}

/// Finger identifiers, in packet order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerId {
    Thumb = 0,
    Index = 1,
    Middle = 2,
    Ring = 3,
    Pinky = 4,
}

impl FingerId {
    pub const ALL: [FingerId; 5] = [
        FingerId::Thumb,
        FingerId::Index,
        FingerId::Middle,
        FingerId::Ring,
        FingerId::Pinky,
    ];
}

/// One finger's sensor readings. Pull is light contact pressure,
/// force is the harder press range; both 0..=126 raw.
#[derive(Debug, Clone, Copy, Default)]
pub struct Finger {
    pub pull: f32,
    pub force: f32,
    pub touched: bool,
    pub clicked: bool,
}

impl Finger {
    /// (pull, force) pair.
    pub fn pressures(&self) -> (f32, f32) {
        (self.pull, self.force)
    }
}

/// Trackpad surface state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trackpad {
    pub x: u8,
    pub y: u8,
    pub pull: f32,
    pub force: f32,
    pub touched: bool,
    pub clicked: bool,
    /// Software-derived touch flag, mirrors `touched` each frame.
    pub tapped: bool,
}

/// Slider strip on the controller face.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slider {
    pub value: f32,
    pub button: bool,
    pub up_button: bool,
    pub down_button: bool,
}

/// Optional eteeTracker attachment state.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracker {
    pub connected: bool,
    pub prox_touched: bool,
    pub prox_clicked: bool,
    pub prox_value: f32,
}

/// Discrete gesture flags and their analog companions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gestures {
    pub squeeze: bool,
    pub grip_touched: bool,
    pub grip_clicked: bool,
    pub grip_pull: f32,
    pub grip_force: f32,
    pub point_independent: bool,
    /// Not populated by the current firmware; always 0.
    pub point_independent_analog: f32,
    pub point_exclude_trackpad: bool,
    pub pinch_trackpad: bool,
    pub pinch_trackpad_analog: f32,
    pub pinch_thumb_finger: bool,
    pub pinch_thumb_finger_analog: f32,
}

/// Raw IMU sample in SI-ish units: accel in g, gyro in rad/s, mag in µT.
#[derive(Debug, Clone, Copy)]
pub struct Imu {
    pub accel: Vector3<f32>,
    pub gyro: Vector3<f32>,
    pub mag: Vector3<f32>,
}

impl Default for Imu {
    fn default() -> Self {
        Imu {
            accel: Vector3::zeros(),
            gyro: Vector3::zeros(),
            mag: Vector3::zeros(),
        }
    }
}

/// Fused orientation, after the per-hand mirror and yaw correction.
#[derive(Debug, Clone, Copy)]
pub struct Orientation {
    pub quat: UnitQuaternion<f32>,
    /// Filter-frame angles in degrees, pre-mirror.
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    /// Euler angles of the oriented quaternion, degrees.
    pub euler: Vector3<f32>,
}

impl Default for Orientation {
    fn default() -> Self {
        Orientation {
            quat: UnitQuaternion::identity(),
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            euler: Vector3::zeros(),
        }
    }
}

/// Everything decoded from one hand's telemetry, updated in place per frame.
///
/// One instance exists per hand for the lifetime of the connection; it is
/// reset to zero on reconnect, never reallocated.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub fingers: [Finger; 5],
    pub flags: PacketFlags,
    pub system_button: bool,

    pub battery: f32,
    pub charging_in_progress: bool,
    pub charging_complete: bool,

    pub slider: Slider,
    pub trackpad: Trackpad,
    pub tracker: Tracker,
    pub gestures: Gestures,

    pub imu: Imu,

    pub gyro_calibrated: bool,
    pub gyro_offset: Vector3<f32>,
    pub mag_calibrated: bool,
    pub mag_offset: Vector3<f32>,
    pub calibrating: bool,

    pub orientation: Orientation,

    pub tap: bool,
    pub double_tap: bool,
    pub(crate) tap_detector: TapDetector,
}

impl DeviceState {
    pub fn finger(&self, id: FingerId) -> &Finger {
        &self.fingers[id as usize]
    }

    pub fn fingers_pull(&self) -> [f32; 5] {
        self.fingers.map(|f| f.pull)
    }

    pub fn fingers_force(&self) -> [f32; 5] {
        self.fingers.map(|f| f.force)
    }

    /// (tap, double_tap) pair.
    pub fn taps(&self) -> (bool, bool) {
        (self.tap, self.double_tap)
    }

    /// Zero out all decoded values. Calibration offsets survive a reset so a
    /// reconnecting hand does not lose its learned bias.
    pub fn reset(&mut self) {
        let gyro_calibrated = self.gyro_calibrated;
        let gyro_offset = self.gyro_offset;
        let mag_calibrated = self.mag_calibrated;
        let mag_offset = self.mag_offset;
        *self = DeviceState::default();
        self.gyro_calibrated = gyro_calibrated;
        self.gyro_offset = gyro_offset;
        self.mag_calibrated = mag_calibrated;
        self.mag_offset = mag_offset;
    }
}
