use crate::types::Hand;
use nalgebra::Vector3;

// -- USB identifiers (dongle CDC interface) --
pub const VID: u16 = 0x239A;
pub const PID: u16 = 0x8029;

// -- Frame geometry --
/// Telemetry payload length per hand, excluding the terminator pair.
pub const FRAME_LEN: usize = 42;
/// Repeated end-of-frame marker byte.
pub const SENTINEL: u8 = 0xFF;
/// Payload byte carrying the handedness / status bits.
pub const HAND_BYTE: usize = 11;
/// Bit of [`HAND_BYTE`]: set = right hand, clear = left.
pub const HAND_BIT: u8 = 3;

/// One complete telemetry payload for exactly one hand.
pub type RawFrame = [u8; FRAME_LEN];

// -- IMU scale factors --
/// Accelerometer: ±4 g over ±32768.
pub const ACCEL_SCALE: f32 = 4.0 / 32768.0;
/// Gyroscope: ±2000 °/s over ±32768, emitted in rad/s.
pub const GYRO_SCALE: f32 = 2000.0 / 32768.0 * (core::f32::consts::PI / 180.0);
/// Magnetometer: µT per LSB, per axis.
pub const MAG_SCALE: [f32; 3] = [0.38, 0.38, 0.61];

// -- Outbound command lines --
pub const CMD_START_CALIBRATION: &str = "BP+RB";
pub const CMD_CANCEL_CALIBRATION: &str = "BP+CC";
pub const CMD_START_STREAMING: &str = "BP+AG";
pub const CMD_STOP_STREAMING: &str = "BP+AS";
pub const CMD_REQUEST_GYRO_OFFSETS: &str = "BP+gf";
pub const CMD_REQUEST_MAG_OFFSETS: &str = "BP+mf";
pub const CMD_ENABLE_HAPTICS: &str = "BP+h1";
pub const CMD_DISABLE_HAPTICS: &str = "BP+h0";
pub const CMD_VIBRATE: &str = "BL+MR=100";

/// Which IMU sensor an offset query/response refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetKind {
    Gyro,
    Mag,
}

impl OffsetKind {
    /// Tag used in both the query command and the response line.
    pub fn tag(self) -> &'static str {
        match self {
            OffsetKind::Gyro => "gf",
            OffsetKind::Mag => "mf",
        }
    }
}

/// Boolean test of a single bit, LSB = position 0.
#[inline]
pub fn bit(byte: u8, pos: u8) -> bool {
    byte & (1 << pos) != 0
}

/// Unsigned value of `count` bits starting at `start`, LSB-first.
#[inline]
pub fn bits(byte: u8, count: u8, start: u8) -> u8 {
    ((1u16 << count) - 1) as u8 & (byte >> start)
}

/// Hand a payload belongs to, from bit 3 of byte 11.
pub fn hand_of(frame: &RawFrame) -> Hand {
    if bit(frame[HAND_BYTE], HAND_BIT) {
        Hand::Right
    } else {
        Hand::Left
    }
}

/// Three consecutive little-endian i16 words starting at `offset`.
/// Accelerometer and gyroscope use this layout.
pub fn read_vec3_le(frame: &RawFrame, offset: usize) -> Vector3<f32> {
    Vector3::new(
        i16::from_le_bytes([frame[offset], frame[offset + 1]]) as f32,
        i16::from_le_bytes([frame[offset + 2], frame[offset + 3]]) as f32,
        i16::from_le_bytes([frame[offset + 4], frame[offset + 5]]) as f32,
    )
}

/// Three consecutive big-endian i16 words starting at `offset`.
/// Only the magnetometer uses this layout; the asymmetry is part of the
/// wire format.
pub fn read_vec3_be(frame: &RawFrame, offset: usize) -> Vector3<f32> {
    Vector3::new(
        i16::from_be_bytes([frame[offset], frame[offset + 1]]) as f32,
        i16::from_be_bytes([frame[offset + 2], frame[offset + 3]]) as f32,
        i16::from_be_bytes([frame[offset + 4], frame[offset + 5]]) as f32,
    )
}

/// Build the per-hand gyro offset upload line: `B{L|R}+gf=a<x>,<y>,<z>`.
pub fn build_gyro_offset_cmd(hand: Hand, offset: &Vector3<f32>) -> String {
    format!(
        "B{}+gf=a{},{},{}",
        hand.letter(),
        offset.x,
        offset.y,
        offset.z
    )
}

/// Build one axis of the per-hand mag offset upload: `B{L|R}+mf=<axis><v>`.
pub fn build_mag_offset_cmd(hand: Hand, axis: char, value: f32) -> String {
    format!("B{}+mf={}{}", hand.letter(), axis, value)
}

/// Parse an inbound offset response line: `"<R|L>:<tag>=<x> <y> <z>"`.
///
/// Returns `None` for anything that does not carry the expected tag or three
/// parseable floats; callers retry the query rather than treating this as an
/// error.
pub fn parse_offset_line(line: &str, kind: OffsetKind) -> Option<(Hand, Vector3<f32>)> {
    let tag = kind.tag();
    let hand = if line.contains(&format!("R:{}=", tag)) {
        Hand::Right
    } else if line.contains(&format!("L:{}=", tag)) {
        Hand::Left
    } else {
        return None;
    };

    let values = line.split('=').nth(1)?;
    let mut parts = values.split_whitespace().map(|p| p.trim().parse::<f32>());
    let x = parts.next()?.ok()?;
    let y = parts.next()?.ok()?;
    let z = parts.next()?.ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((hand, Vector3::new(x, y, z)))
}
