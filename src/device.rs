use crate::calibration::{CalibrationAction, CalibrationController, CalibrationOutcome};
use crate::decoder::decode_frame;
use crate::fusion::{finger_avg_curl, OrientationEstimator};
use crate::protocol::{
    OffsetKind, RawFrame, CMD_CANCEL_CALIBRATION, CMD_DISABLE_HAPTICS, CMD_ENABLE_HAPTICS,
    CMD_START_CALIBRATION, CMD_START_STREAMING, CMD_STOP_STREAMING, CMD_VIBRATE,
};
use crate::stream::{StreamEvent, TelemetryStream};
use crate::transport::{self, SerialTransport, Transport};
use crate::types::{DeviceState, FingerId, Gestures, Hand, Tracker};
use crate::{EteeError, Result};
use nalgebra::{UnitQuaternion, Vector3};
use std::time::{Duration, Instant};

/// Tunables for a controller pair session. The composition root builds one
/// and hands it to [`Device::open`]; nothing here is read from global state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Serial port override; auto-discovered by USB VID/PID when `None`.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Ticks without frames before a hand is considered disconnected.
    pub disconnect_threshold: u32,
    /// Pacing of the bring-up offset query.
    pub offset_request_interval: Duration,
    /// Bring-up attempts before giving up and streaming uncalibrated.
    pub offset_retry_budget: u32,
    pub request_gyro_offsets: bool,
    /// Mag offsets only matter for absolute orientation, which the fusion
    /// deliberately avoids; off by default.
    pub request_mag_offsets: bool,
    /// Pause between reconnect attempts after an I/O failure.
    pub reconnect_interval: Duration,
    pub frame_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: None,
            baud_rate: 115_200,
            disconnect_threshold: 10,
            offset_request_interval: Duration::from_millis(100),
            offset_retry_budget: 100,
            request_gyro_offsets: true,
            request_mag_offsets: false,
            reconnect_interval: Duration::from_millis(500),
            frame_channel_capacity: 256,
        }
    }
}

/// An open controller pair: the reader thread plus all per-hand state.
///
/// The owner calls [`Device::poll`] once per control-loop tick; everything
/// else is non-blocking queries over the decoded state or fire-and-forget
/// commands.
pub struct Device {
    stream: TelemetryStream,
    states: [DeviceState; 2],
    estimators: [OrientationEstimator; 2],
    calibration: CalibrationController,
    connected: [bool; 2],
    silent_ticks: [u32; 2],
    dongle_connected: bool,
    streaming: bool,
    last_outcome: Option<CalibrationOutcome>,
    port_name: String,
    disconnect_threshold: u32,
}

impl Device {
    /// Discover the dongle and open it with default settings.
    pub fn open_first() -> Result<Device> {
        Device::open(Config::default())
    }

    /// Block until the dongle appears, retrying discovery at `interval`.
    /// A missing dongle is a persistent "not connected" condition, not a
    /// reason to give up; other errors still propagate.
    pub fn open_blocking(config: Config, interval: Duration) -> Result<Device> {
        loop {
            match Device::open(config.clone()) {
                Ok(device) => return Ok(device),
                Err(EteeError::DongleNotFound) => {
                    log::info!("dongle not detected, retrying");
                    std::thread::sleep(interval);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open the dongle described by `config`.
    pub fn open(config: Config) -> Result<Device> {
        let port_name = match &config.port {
            Some(port) => port.clone(),
            None => transport::discover()?,
        };
        let serial = SerialTransport::open(&port_name, config.baud_rate)?;
        log::info!("Opened etee dongle at {}", port_name);
        Device::from_transport(Box::new(serial), port_name, config)
    }

    /// Build a device over an arbitrary transport (tests, simulators).
    pub fn from_transport(
        transport: Box<dyn Transport>,
        port_name: String,
        config: Config,
    ) -> Result<Device> {
        let stream = TelemetryStream::start(transport, &config)?;
        Ok(Device {
            stream,
            states: [DeviceState::default(), DeviceState::default()],
            estimators: [
                OrientationEstimator::new(Hand::Left),
                OrientationEstimator::new(Hand::Right),
            ],
            calibration: CalibrationController::new(),
            connected: [false; 2],
            silent_ticks: [0; 2],
            dongle_connected: true,
            streaming: false,
            last_outcome: None,
            port_name,
            disconnect_threshold: config.disconnect_threshold,
        })
    }

    /// Drain and apply everything pending: stream events, queued frames for
    /// both hands (in arrival order), disconnect debounce, and calibration
    /// deadlines. Never blocks; call once per tick.
    pub fn poll(&mut self) {
        let now = Instant::now();

        while let Some(event) = self.stream.try_recv_event() {
            self.apply_event(event);
        }

        for hand in Hand::BOTH {
            let mut received = false;
            while let Some(frame) = self.stream.try_recv_frame(hand) {
                if !received && !self.connected[hand.index()] {
                    // Fresh (re)connect: decoded values restart from zero.
                    self.states[hand.index()].reset();
                    self.connected[hand.index()] = true;
                    log::info!("{hand} hand connected");
                }
                received = true;
                self.process_frame(hand, frame, now);
            }
            self.debounce(hand, received);
        }

        let actions = self.calibration.tick(now);
        self.apply_actions(actions);
    }

    fn apply_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Offsets { hand, kind, offset } => {
                let state = &mut self.states[hand.index()];
                match kind {
                    OffsetKind::Gyro => {
                        state.gyro_offset = offset;
                        state.gyro_calibrated = true;
                    }
                    OffsetKind::Mag => {
                        state.mag_offset = offset;
                        state.mag_calibrated = true;
                    }
                }
            }
            StreamEvent::BringUpTimedOut { kind } => {
                self.last_outcome = Some(CalibrationOutcome::TimedOut { kind });
            }
            StreamEvent::StreamingStarted => self.streaming = true,
            StreamEvent::TransportLost => self.dongle_connected = false,
            StreamEvent::TransportRecovered => self.dongle_connected = true,
        }
    }

    fn process_frame(&mut self, hand: Hand, frame: RawFrame, now: Instant) {
        let mut actions = Vec::new();
        {
            let state = &mut self.states[hand.index()];
            decode_frame(&frame, state);

            if let Some(kind) = self.calibration.active_kind() {
                if self.calibration.is_accumulating(hand, kind) {
                    let raw = match kind {
                        OffsetKind::Gyro => state.imu.gyro,
                        OffsetKind::Mag => state.imu.mag,
                    };
                    actions = self.calibration.feed(hand, raw, now);
                }
            }

            let curl = finger_avg_curl(&state.fingers);
            state.orientation =
                self.estimators[hand.index()].update(state.imu.gyro, state.imu.accel, curl);
        }
        self.apply_actions(actions);
    }

    fn apply_actions(&mut self, actions: Vec<CalibrationAction>) {
        for action in actions {
            match action {
                CalibrationAction::Send(hand, cmd) => self.stream.queue_command(hand, cmd),
                CalibrationAction::SendGlobal(cmd) => self.send_pair_command(cmd),
                CalibrationAction::Completed { hand, kind, offset } => {
                    let state = &mut self.states[hand.index()];
                    match kind {
                        OffsetKind::Gyro => {
                            state.gyro_offset = offset;
                            state.gyro_calibrated = true;
                        }
                        OffsetKind::Mag => {
                            state.mag_offset = offset;
                            state.mag_calibrated = true;
                        }
                    }
                    state.calibrating = false;
                    self.streaming = false;
                    self.last_outcome =
                        Some(CalibrationOutcome::Completed { hand, kind, offset });
                }
            }
        }
    }

    fn debounce(&mut self, hand: Hand, received: bool) {
        let i = hand.index();
        if received {
            self.silent_ticks[i] = 0;
            return;
        }
        self.silent_ticks[i] = self.silent_ticks[i].saturating_add(1);
        if self.connected[i] && self.silent_ticks[i] > self.disconnect_threshold {
            self.connected[i] = false;
            // Anything still queued for a sleeping hand is stale.
            self.stream.clear_commands(hand);
            log::info!("{hand} hand disconnected");
        }
    }

    /// `BP+`-prefixed lines are broadcast by the dongle to both hands; they
    /// ride the left queue purely as a writer slot.
    fn send_pair_command(&self, cmd: impl Into<String>) {
        self.stream.queue_command(Hand::Left, cmd);
    }

    // ==== status ====

    pub fn is_dongle_connected(&self) -> bool {
        self.dongle_connected && self.stream.is_active()
    }

    pub fn is_hand_connected(&self, hand: Hand) -> bool {
        self.connected[hand.index()]
    }

    pub fn is_any_hand_connected(&self) -> bool {
        self.connected.iter().any(|&c| c)
    }

    pub fn are_both_hands_connected(&self) -> bool {
        self.connected.iter().all(|&c| c)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Most recent calibration outcome, consumed on read.
    pub fn take_calibration_outcome(&mut self) -> Option<CalibrationOutcome> {
        self.last_outcome.take()
    }

    // ==== per-hand queries (thin forwarders over the decoded state) ====

    pub fn state(&self, hand: Hand) -> &DeviceState {
        &self.states[hand.index()]
    }

    pub fn battery(&self, hand: Hand) -> f32 {
        self.state(hand).battery
    }

    /// (pull, force) for one finger.
    pub fn finger(&self, hand: Hand, finger: FingerId) -> (f32, f32) {
        self.state(hand).finger(finger).pressures()
    }

    pub fn fingers_pull(&self, hand: Hand) -> [f32; 5] {
        self.state(hand).fingers_pull()
    }

    pub fn fingers_force(&self, hand: Hand) -> [f32; 5] {
        self.state(hand).fingers_force()
    }

    pub fn trackpad_position(&self, hand: Hand) -> (u8, u8) {
        let tp = &self.state(hand).trackpad;
        (tp.x, tp.y)
    }

    pub fn trackpad_pressures(&self, hand: Hand) -> (f32, f32) {
        let tp = &self.state(hand).trackpad;
        (tp.pull, tp.force)
    }

    pub fn trackpad_tapped(&self, hand: Hand) -> bool {
        self.state(hand).trackpad.tapped
    }

    /// (tap, double_tap) pair.
    pub fn taps(&self, hand: Hand) -> (bool, bool) {
        self.state(hand).taps()
    }

    pub fn slider_position(&self, hand: Hand) -> f32 {
        self.state(hand).slider.value
    }

    pub fn slider_touched(&self, hand: Hand) -> bool {
        self.state(hand).slider.button
    }

    /// (up, down) slider buttons.
    pub fn slider_up_down(&self, hand: Hand) -> (bool, bool) {
        let s = &self.state(hand).slider;
        (s.up_button, s.down_button)
    }

    pub fn tracker(&self, hand: Hand) -> &Tracker {
        &self.state(hand).tracker
    }

    pub fn gestures(&self, hand: Hand) -> &Gestures {
        &self.state(hand).gestures
    }

    pub fn quaternion(&self, hand: Hand) -> UnitQuaternion<f32> {
        self.state(hand).orientation.quat
    }

    /// Filter-frame (roll, pitch, yaw) in degrees.
    pub fn rotations(&self, hand: Hand) -> Vector3<f32> {
        let o = &self.state(hand).orientation;
        Vector3::new(o.roll, o.pitch, o.yaw)
    }

    pub fn euler(&self, hand: Hand) -> Vector3<f32> {
        self.state(hand).orientation.euler
    }

    pub fn accelerometer(&self, hand: Hand) -> Vector3<f32> {
        self.state(hand).imu.accel
    }

    pub fn gyroscope(&self, hand: Hand) -> Vector3<f32> {
        self.state(hand).imu.gyro
    }

    pub fn magnetometer(&self, hand: Hand) -> Vector3<f32> {
        self.state(hand).imu.mag
    }

    pub fn is_gyro_calibrated(&self, hand: Hand) -> bool {
        self.state(hand).gyro_calibrated
    }

    pub fn is_mag_calibrated(&self, hand: Hand) -> bool {
        self.state(hand).mag_calibrated
    }

    /// Zero a hand's decoded values (calibration offsets survive).
    pub fn reset_values(&mut self, hand: Hand) {
        self.states[hand.index()].reset();
    }

    // ==== commands ====

    /// Start the device-side finger calibration routine.
    pub fn calibrate_fingers(&self) {
        self.send_pair_command(CMD_START_CALIBRATION);
    }

    pub fn cancel_finger_calibration(&self) {
        self.send_pair_command(CMD_CANCEL_CALIBRATION);
    }

    /// Begin gyro bias recalibration for both hands. Keep the controllers
    /// still: the next 700 samples per hand become the new bias.
    pub fn calibrate_gyro(&mut self) {
        self.start_imu_calibration(OffsetKind::Gyro);
    }

    /// Begin magnetometer offset recalibration for both hands.
    pub fn calibrate_mag(&mut self) {
        self.start_imu_calibration(OffsetKind::Mag);
    }

    fn start_imu_calibration(&mut self, kind: OffsetKind) {
        if !self.calibration.start(kind) {
            log::warn!("ignoring {:?} calibration request: another is running", kind);
            return;
        }
        for state in self.states.iter_mut() {
            state.calibrating = true;
            // Accumulation wants raw readings, so the old correction is
            // dropped for the duration.
            match kind {
                OffsetKind::Gyro => {
                    state.gyro_calibrated = false;
                    state.gyro_offset = Vector3::zeros();
                }
                OffsetKind::Mag => {
                    state.mag_calibrated = false;
                    state.mag_offset = Vector3::zeros();
                }
            }
        }
    }

    pub fn cancel_imu_calibration(&mut self) {
        self.calibration.cancel();
        for state in self.states.iter_mut() {
            state.calibrating = false;
        }
    }

    pub fn enable_haptics(&self) {
        self.send_pair_command(CMD_ENABLE_HAPTICS);
    }

    pub fn disable_haptics(&self) {
        self.send_pair_command(CMD_DISABLE_HAPTICS);
    }

    /// Queue a vibration pulse for `hand`. Dropped (queue cleared) if the
    /// hand disconnects before the writer gets to it.
    pub fn vibrate(&self, hand: Hand) {
        self.stream.queue_command(hand, CMD_VIBRATE);
    }

    pub fn enable_streaming(&self) {
        self.send_pair_command(CMD_START_STREAMING);
    }

    pub fn disable_streaming(&self) {
        self.send_pair_command(CMD_STOP_STREAMING);
    }

    /// Stop and re-enable telemetry. The writer drains one line per hand
    /// queue per pass, so the two lines ride different queues to go out in
    /// one pass, left first.
    pub fn restart_streaming(&self) {
        self.stream.queue_command(Hand::Left, CMD_STOP_STREAMING);
        self.stream.queue_command(Hand::Right, CMD_START_STREAMING);
    }

    /// Politely stop streaming, then halt and join the reader thread.
    pub fn shutdown(self) {
        self.disable_streaming();
        // One short beat so the writer can flush the stop command; the
        // reader would otherwise be joined before its next pass.
        std::thread::sleep(Duration::from_millis(20));
        self.stream.stop();
    }
}
