use crate::protocol::{
    bit, bits, read_vec3_be, read_vec3_le, RawFrame, ACCEL_SCALE, GYRO_SCALE, MAG_SCALE,
};
use crate::types::{DeviceState, PacketFlags};
use nalgebra::Vector3;

/// Decode one telemetry payload into the hand's state, in place.
///
/// Deterministic for a given payload except for the gyro/mag offset
/// subtraction, which consults the calibration already stored on `state`.
///
/// Payload layout (0-indexed):
/// - `[0]`: click/button flags (see [`PacketFlags`])
/// - `[1..=5]`: finger touch bit + 7-bit pull, thumb..pinky
/// - `[6..=7]`: trackpad x, y
/// - `[8]`: tracker proximity touch bit + 7-bit value
/// - `[9]`: slider button bit + 7-bit value
/// - `[10..=11]`: grip bits, handedness, slider up/down, charging, tracker
/// - `[12]`: charging-complete bit + 7-bit battery
/// - `[13..=16]`: trackpad pull, gesture bits + analogs
/// - `[17]`: trackpad force
/// - `[18..=22]`: finger force, thumb..pinky
/// - `[23..=28]`: accelerometer, 3x i16 LE
/// - `[29..=34]`: magnetometer, 3x i16 BE
/// - `[35..=40]`: gyroscope, 3x i16 LE
/// - `[41]`: squeeze gesture bit
pub fn decode_frame(frame: &RawFrame, state: &mut DeviceState) {
    let flags = PacketFlags::from_bits_truncate(frame[0]);
    state.flags = flags;
    state.system_button = flags.contains(PacketFlags::SYSTEM_BUTTON);

    decode_fingers(frame, state, flags);
    decode_battery(frame, state);
    decode_slider(frame, state);
    decode_tracker(frame, state);
    decode_trackpad(frame, state, flags);
    decode_imu(frame, state);
    decode_gestures(frame, state);

    // Tap events ride on the derived trackpad touch flag.
    state.trackpad.tapped = state.trackpad.touched;
    let (tap, double_tap) = state.tap_detector.update(state.trackpad.tapped);
    state.tap = tap;
    state.double_tap = double_tap;
}

fn decode_fingers(frame: &RawFrame, state: &mut DeviceState, flags: PacketFlags) {
    const CLICKS: [PacketFlags; 5] = [
        PacketFlags::THUMB_CLICK,
        PacketFlags::INDEX_CLICK,
        PacketFlags::MIDDLE_CLICK,
        PacketFlags::RING_CLICK,
        PacketFlags::PINKY_CLICK,
    ];

    for (i, finger) in state.fingers.iter_mut().enumerate() {
        finger.pull = bits(frame[1 + i], 7, 1) as f32;
        finger.force = bits(frame[18 + i], 7, 1) as f32;
        finger.touched = bit(frame[1 + i], 0);
        finger.clicked = flags.contains(CLICKS[i]);
    }
}

fn decode_battery(frame: &RawFrame, state: &mut DeviceState) {
    state.battery = bits(frame[12], 7, 1) as f32;
    state.charging_in_progress = bit(frame[11], 4);
    // Firmware only reports completion while the charger is attached; the
    // bit is stale otherwise, so it is only sampled while charging.
    if state.charging_in_progress {
        state.charging_complete = bit(frame[12], 0);
    }
}

fn decode_slider(frame: &RawFrame, state: &mut DeviceState) {
    state.slider.value = bits(frame[9], 7, 1) as f32;
    state.slider.button = bit(frame[9], 0);
    state.slider.up_button = bit(frame[11], 5);
    state.slider.down_button = bit(frame[11], 6);
}

fn decode_tracker(frame: &RawFrame, state: &mut DeviceState) {
    state.tracker.connected = bit(frame[11], 2);
    state.tracker.prox_clicked = bit(frame[11], 1);
    state.tracker.prox_touched = bit(frame[8], 0);
    state.tracker.prox_value = bits(frame[8], 7, 1) as f32;
}

fn decode_trackpad(frame: &RawFrame, state: &mut DeviceState, flags: PacketFlags) {
    state.trackpad.x = frame[6];
    state.trackpad.y = frame[7];
    state.trackpad.pull = bits(frame[13], 7, 1) as f32;
    state.trackpad.force = bits(frame[17], 7, 1) as f32;
    state.trackpad.clicked = flags.contains(PacketFlags::TRACKPAD_CLICK);
    state.trackpad.touched = flags.contains(PacketFlags::TRACKPAD_TOUCH);
}

fn decode_imu(frame: &RawFrame, state: &mut DeviceState) {
    state.imu.accel = read_vec3_le(frame, 23) * ACCEL_SCALE;

    let mag = read_vec3_be(frame, 29);
    let mut mag = Vector3::new(
        mag.x * MAG_SCALE[0],
        mag.y * MAG_SCALE[1],
        mag.z * MAG_SCALE[2],
    );
    if state.mag_calibrated {
        mag -= state.mag_offset;
    }
    state.imu.mag = mag;

    let mut gyro = read_vec3_le(frame, 35) * GYRO_SCALE;
    if state.gyro_calibrated {
        gyro -= state.gyro_offset;
    }
    state.imu.gyro = gyro;
}

fn decode_gestures(frame: &RawFrame, state: &mut DeviceState) {
    let g = &mut state.gestures;
    g.grip_touched = bit(frame[10], 0);
    g.grip_clicked = bit(frame[11], 0);
    g.grip_pull = bits(frame[10], 7, 1) as f32;
    g.grip_force = bits(frame[14], 7, 1) as f32;
    g.squeeze = bit(frame[41], 0);

    g.point_independent = bit(frame[13], 0);
    g.point_independent_analog = 0.0;
    g.point_exclude_trackpad = bit(frame[14], 0);
    g.pinch_trackpad = bit(frame[15], 0);
    g.pinch_trackpad_analog = bits(frame[15], 7, 1) as f32;
    g.pinch_thumb_finger = bit(frame[16], 0);
    g.pinch_thumb_finger_analog = bits(frame[16], 7, 1) as f32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FRAME_LEN;
    use crate::types::FingerId;

    fn decode(frame: &RawFrame) -> DeviceState {
        let mut state = DeviceState::default();
        decode_frame(frame, &mut state);
        state
    }

    #[test]
    fn test_finger_fields() {
        let mut frame = [0u8; FRAME_LEN];
        // Index finger: touched, pull 100; clicked via byte 0 bit 4; force 55.
        frame[2] = (100 << 1) | 1;
        frame[0] = 1 << 4;
        frame[19] = 55 << 1;

        let state = decode(&frame);
        let index = state.finger(FingerId::Index);
        assert_eq!(index.pressures(), (100.0, 55.0));
        assert!(index.touched);
        assert!(index.clicked);
        assert!(!state.finger(FingerId::Thumb).touched);
        assert!(!state.finger(FingerId::Pinky).clicked);
    }

    #[test]
    fn test_trackpad_and_slider() {
        let mut frame = [0u8; FRAME_LEN];
        frame[6] = 200;
        frame[7] = 17;
        frame[13] = 40 << 1;
        frame[17] = 90 << 1;
        frame[0] = 0b0000_0110; // trackpad click + touch
        frame[9] = (77 << 1) | 1;
        frame[11] = (1 << 5) | (1 << 6);

        let state = decode(&frame);
        assert_eq!((state.trackpad.x, state.trackpad.y), (200, 17));
        assert_eq!((state.trackpad.pull, state.trackpad.force), (40.0, 90.0));
        assert!(state.trackpad.clicked && state.trackpad.touched);
        assert!(state.trackpad.tapped);
        assert_eq!(state.slider.value, 77.0);
        assert!(state.slider.button);
        assert!(state.slider.up_button && state.slider.down_button);
    }

    #[test]
    fn test_battery_and_charging() {
        let mut frame = [0u8; FRAME_LEN];
        frame[12] = (85 << 1) | 1;

        // Not charging: completion bit is ignored.
        let state = decode(&frame);
        assert_eq!(state.battery, 85.0);
        assert!(!state.charging_in_progress);
        assert!(!state.charging_complete);

        frame[11] = 1 << 4;
        let state = decode(&frame);
        assert!(state.charging_in_progress);
        assert!(state.charging_complete);
    }

    #[test]
    fn test_tracker_fields() {
        let mut frame = [0u8; FRAME_LEN];
        frame[11] = (1 << 2) | (1 << 1);
        frame[8] = (33 << 1) | 1;

        let state = decode(&frame);
        assert!(state.tracker.connected);
        assert!(state.tracker.prox_clicked);
        assert!(state.tracker.prox_touched);
        assert_eq!(state.tracker.prox_value, 33.0);
    }

    #[test]
    fn test_gesture_fields() {
        let mut frame = [0u8; FRAME_LEN];
        frame[10] = (25 << 1) | 1;
        frame[11] = 1;
        frame[14] = (50 << 1) | 1;
        frame[13] = 1;
        frame[15] = (60 << 1) | 1;
        frame[16] = (70 << 1) | 1;
        frame[41] = 1;

        let state = decode(&frame);
        let g = &state.gestures;
        assert!(g.grip_touched && g.grip_clicked);
        assert_eq!((g.grip_pull, g.grip_force), (25.0, 50.0));
        assert!(g.squeeze);
        assert!(g.point_independent && g.point_exclude_trackpad);
        assert_eq!(g.point_independent_analog, 0.0);
        assert!(g.pinch_trackpad && g.pinch_thumb_finger);
        assert_eq!(g.pinch_trackpad_analog, 60.0);
        assert_eq!(g.pinch_thumb_finger_analog, 70.0);
    }

    #[test]
    fn test_imu_scaling_and_offsets() {
        let mut frame = [0u8; FRAME_LEN];
        // Accel x = 8192 LE -> 1 g.
        frame[23] = 0x00;
        frame[24] = 0x20;
        // Mag x = 256 BE -> 256 * 0.38 µT.
        frame[29] = 0x01;
        frame[30] = 0x00;
        // Gyro z = 16384 LE -> 1000 °/s in rad/s.
        frame[39] = 0x00;
        frame[40] = 0x40;

        let state = decode(&frame);
        assert!((state.imu.accel.x - 1.0).abs() < 1e-6);
        assert!((state.imu.mag.x - 256.0 * 0.38).abs() < 1e-3);
        assert!((state.imu.gyro.z - 1000f32.to_radians()).abs() < 1e-4);

        // A calibrated state subtracts its stored offsets.
        let mut state = DeviceState::default();
        state.gyro_calibrated = true;
        state.gyro_offset = Vector3::new(0.0, 0.0, 0.1);
        state.mag_calibrated = true;
        state.mag_offset = Vector3::new(5.0, 0.0, 0.0);
        decode_frame(&frame, &mut state);
        assert!((state.imu.gyro.z - (1000f32.to_radians() - 0.1)).abs() < 1e-4);
        assert!((state.imu.mag.x - (256.0 * 0.38 - 5.0)).abs() < 1e-3);
    }

    #[test]
    fn test_decode_is_deterministic() {
        let mut frame = [0u8; FRAME_LEN];
        for (i, b) in frame.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37);
        }

        let a = decode(&frame);
        let b = decode(&frame);
        assert_eq!(a.battery, b.battery);
        assert_eq!(a.fingers_pull(), b.fingers_pull());
        assert_eq!(a.imu.gyro, b.imu.gyro);
        assert_eq!(a.flags, b.flags);
    }
}
