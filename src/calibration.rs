use crate::protocol::{
    build_gyro_offset_cmd, build_mag_offset_cmd, OffsetKind, CMD_STOP_STREAMING,
};
use crate::types::Hand;
use nalgebra::Vector3;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples averaged into a bias estimate during recalibration.
pub const CALIBRATION_SAMPLES: usize = 700;

/// Result of a calibration procedure, surfaced to the consumer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationOutcome {
    Completed {
        hand: Hand,
        kind: OffsetKind,
        offset: Vector3<f32>,
    },
    /// Bring-up offset polling exhausted its retry budget.
    TimedOut { kind: OffsetKind },
}

/// Commands and state changes a [`CalibrationController`] wants applied.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationAction {
    /// Queue a line on one hand's outbound queue.
    Send(Hand, String),
    /// Queue a pair-wide line (the dongle broadcasts `BP+` commands).
    SendGlobal(String),
    /// A hand finished accumulating; the new offset should be stored and the
    /// hand marked calibrated.
    Completed {
        hand: Hand,
        kind: OffsetKind,
        offset: Vector3<f32>,
    },
}

/// Running vector sum over a fixed sample count.
#[derive(Debug, Clone)]
pub struct OffsetAccumulator {
    target: usize,
    sum: Vector3<f32>,
    samples: usize,
}

impl OffsetAccumulator {
    pub fn new(target: usize) -> Self {
        OffsetAccumulator {
            target,
            sum: Vector3::zeros(),
            samples: 0,
        }
    }

    /// Add one raw sample; yields the averaged offset exactly once, on the
    /// sample that reaches the target.
    pub fn push(&mut self, raw: Vector3<f32>) -> Option<Vector3<f32>> {
        if self.samples >= self.target {
            return None;
        }
        self.sum += raw;
        self.samples += 1;
        (self.samples == self.target).then(|| self.sum / self.samples as f32)
    }

    pub fn samples(&self) -> usize {
        self.samples
    }
}

/// A timed outbound command script: one line per deadline, driven from the
/// control loop's tick rather than a sleeping thread.
#[derive(Debug)]
pub struct CommandSequence {
    hand: Hand,
    steps: VecDeque<(Duration, String)>,
    next_due: Option<Instant>,
}

impl CommandSequence {
    pub fn new(hand: Hand, now: Instant, steps: Vec<(Duration, String)>) -> Self {
        let steps: VecDeque<_> = steps.into();
        let next_due = steps.front().map(|(delay, _)| now + *delay);
        CommandSequence {
            hand,
            steps,
            next_due,
        }
    }

    /// The gyro offset upload: a short settle pause, then one set command.
    /// The hands are staggered so their uploads never interleave on the
    /// shared stream.
    pub fn gyro_upload(hand: Hand, offset: Vector3<f32>, now: Instant) -> Self {
        let settle = match hand {
            Hand::Left => Duration::from_millis(300),
            Hand::Right => Duration::from_millis(500),
        };
        CommandSequence::new(hand, now, vec![(settle, build_gyro_offset_cmd(hand, &offset))])
    }

    /// The mag offset upload. Each axis command is transmitted twice with a
    /// pause between: the firmware only persists a repeated command. This is
    /// a device quirk every conforming client has to reproduce.
    pub fn mag_upload(hand: Hand, offset: Vector3<f32>, now: Instant) -> Self {
        let gap = Duration::from_secs(1);
        let start = match hand {
            Hand::Left => Duration::from_secs(1),
            Hand::Right => Duration::from_secs(2),
        };
        let mut steps = Vec::new();
        for (i, (axis, value)) in [('X', offset.x), ('Y', offset.y), ('Z', offset.z)]
            .into_iter()
            .enumerate()
        {
            let cmd = build_mag_offset_cmd(hand, axis, value);
            steps.push((if i == 0 { start } else { gap }, cmd.clone()));
            steps.push((gap, cmd));
        }
        CommandSequence::new(hand, now, steps)
    }

    /// Emit the next command if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<(Hand, String)> {
        let due = self.next_due?;
        if now < due {
            return None;
        }
        let (_, cmd) = self.steps.pop_front()?;
        self.next_due = self.steps.front().map(|(delay, _)| due + *delay);
        Some((self.hand, cmd))
    }

    pub fn is_finished(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug)]
enum Phase {
    Accumulating(OffsetAccumulator),
    Uploading(CommandSequence),
    Done,
}

/// Runtime gyro/mag bias recalibration for the hand pair.
///
/// One procedure runs at a time. Both hands accumulate raw sensor vectors
/// from their own telemetry; each hand independently finishes, uploads its
/// offset, and the session is dropped once both are done. Streaming is
/// stopped when the first hand finishes and is *not* re-enabled here —
/// callers restart it explicitly.
#[derive(Debug, Default)]
pub struct CalibrationController {
    session: Option<Session>,
}

#[derive(Debug)]
struct Session {
    kind: OffsetKind,
    phases: [Phase; 2],
    streaming_stopped: bool,
}

impl CalibrationController {
    pub fn new() -> Self {
        CalibrationController { session: None }
    }

    /// Begin recalibration for both hands. Returns false while another
    /// procedure is still running.
    pub fn start(&mut self, kind: OffsetKind) -> bool {
        if self.session.is_some() {
            return false;
        }
        log::info!("starting {:?} recalibration ({CALIBRATION_SAMPLES} samples)", kind);
        self.session = Some(Session {
            kind,
            phases: [
                Phase::Accumulating(OffsetAccumulator::new(CALIBRATION_SAMPLES)),
                Phase::Accumulating(OffsetAccumulator::new(CALIBRATION_SAMPLES)),
            ],
            streaming_stopped: false,
        });
        true
    }

    pub fn in_progress(&self) -> bool {
        self.session.is_some()
    }

    /// Whether `hand` is currently accumulating samples of `kind`.
    pub fn is_accumulating(&self, hand: Hand, kind: OffsetKind) -> bool {
        matches!(
            self.session.as_ref(),
            Some(s) if s.kind == kind
                && matches!(s.phases[hand.index()], Phase::Accumulating(_))
        )
    }

    pub fn active_kind(&self) -> Option<OffsetKind> {
        self.session.as_ref().map(|s| s.kind)
    }

    /// Feed one raw sensor vector decoded from `hand`'s telemetry.
    pub fn feed(
        &mut self,
        hand: Hand,
        raw: Vector3<f32>,
        now: Instant,
    ) -> Vec<CalibrationAction> {
        let mut actions = Vec::new();
        let Some(session) = self.session.as_mut() else {
            return actions;
        };
        let kind = session.kind;

        if let Phase::Accumulating(acc) = &mut session.phases[hand.index()] {
            if let Some(offset) = acc.push(raw) {
                log::info!("{hand} {:?} offset accumulated: {:?}", kind, offset);
                if !session.streaming_stopped {
                    session.streaming_stopped = true;
                    actions.push(CalibrationAction::SendGlobal(CMD_STOP_STREAMING.into()));
                }
                actions.push(CalibrationAction::Completed { hand, kind, offset });
                let seq = match kind {
                    OffsetKind::Gyro => CommandSequence::gyro_upload(hand, offset, now),
                    OffsetKind::Mag => CommandSequence::mag_upload(hand, offset, now),
                };
                session.phases[hand.index()] = Phase::Uploading(seq);
            }
        }
        actions
    }

    /// Advance upload sequences; called once per control-loop tick.
    pub fn tick(&mut self, now: Instant) -> Vec<CalibrationAction> {
        let mut actions = Vec::new();
        let Some(session) = self.session.as_mut() else {
            return actions;
        };

        for phase in session.phases.iter_mut() {
            if let Phase::Uploading(seq) = phase {
                while let Some((hand, cmd)) = seq.poll(now) {
                    actions.push(CalibrationAction::Send(hand, cmd));
                }
                if seq.is_finished() {
                    *phase = Phase::Done;
                }
            }
        }

        if session.phases.iter().all(|p| matches!(p, Phase::Done)) {
            log::info!("{:?} recalibration finished for both hands", session.kind);
            self.session = None;
        }
        actions
    }

    /// Drop any running session without uploading.
    pub fn cancel(&mut self) {
        if self.session.take().is_some() {
            log::info!("recalibration cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_mean_once() {
        let mut acc = OffsetAccumulator::new(CALIBRATION_SAMPLES);
        let sample = Vector3::new(0.01, -0.02, 0.005);
        for _ in 0..CALIBRATION_SAMPLES - 1 {
            assert!(acc.push(sample).is_none());
        }
        let offset = acc.push(sample).expect("final sample yields the mean");
        assert!((offset - sample).norm() < 1e-6);
        // Further pushes never re-trigger.
        assert!(acc.push(sample).is_none());
        assert_eq!(acc.samples(), CALIBRATION_SAMPLES);
    }

    #[test]
    fn test_accumulator_varying_samples() {
        let mut acc = OffsetAccumulator::new(4);
        acc.push(Vector3::new(1.0, 0.0, 0.0));
        acc.push(Vector3::new(3.0, 0.0, 0.0));
        acc.push(Vector3::new(5.0, 0.0, 0.0));
        let offset = acc.push(Vector3::new(7.0, 0.0, 0.0)).unwrap();
        assert!((offset.x - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_sequence_respects_deadlines() {
        let t0 = Instant::now();
        let mut seq = CommandSequence::new(
            Hand::Left,
            t0,
            vec![
                (Duration::from_millis(300), "a".into()),
                (Duration::from_millis(100), "b".into()),
            ],
        );
        assert!(seq.poll(t0).is_none());
        assert!(seq.poll(t0 + Duration::from_millis(299)).is_none());
        assert_eq!(
            seq.poll(t0 + Duration::from_millis(300)),
            Some((Hand::Left, "a".into()))
        );
        assert!(seq.poll(t0 + Duration::from_millis(350)).is_none());
        assert_eq!(
            seq.poll(t0 + Duration::from_millis(400)),
            Some((Hand::Left, "b".into()))
        );
        assert!(seq.is_finished());
    }

    #[test]
    fn test_mag_upload_sends_each_axis_twice() {
        let t0 = Instant::now();
        let mut seq =
            CommandSequence::mag_upload(Hand::Right, Vector3::new(1.0, 2.0, 3.0), t0);
        let mut cmds = Vec::new();
        // Far-future poll drains the whole script in order.
        while let Some((_, cmd)) = seq.poll(t0 + Duration::from_secs(60)) {
            cmds.push(cmd);
        }
        assert_eq!(
            cmds,
            vec![
                "BR+mf=X1", "BR+mf=X1", "BR+mf=Y2", "BR+mf=Y2", "BR+mf=Z3", "BR+mf=Z3",
            ]
        );
    }

    #[test]
    fn test_controller_full_gyro_cycle() {
        let t0 = Instant::now();
        let mut ctl = CalibrationController::new();
        assert!(ctl.start(OffsetKind::Gyro));
        assert!(!ctl.start(OffsetKind::Mag), "one procedure at a time");
        assert!(ctl.is_accumulating(Hand::Left, OffsetKind::Gyro));

        let sample = Vector3::new(0.02, 0.0, -0.01);
        let mut completion = Vec::new();
        for _ in 0..CALIBRATION_SAMPLES {
            completion = ctl.feed(Hand::Left, sample, t0);
        }
        assert!(completion.contains(&CalibrationAction::SendGlobal("BP+AS".into())));
        assert!(completion.iter().any(|a| matches!(
            a,
            CalibrationAction::Completed { hand: Hand::Left, kind: OffsetKind::Gyro, offset }
                if (offset - sample).norm() < 1e-5
        )));
        assert!(!ctl.is_accumulating(Hand::Left, OffsetKind::Gyro));
        assert!(ctl.is_accumulating(Hand::Right, OffsetKind::Gyro));

        // Upload command fires after the settle pause.
        assert!(ctl.tick(t0).is_empty());
        let actions = ctl.tick(t0 + Duration::from_millis(300));
        assert!(matches!(
            &actions[..],
            [CalibrationAction::Send(Hand::Left, cmd)] if cmd.starts_with("BL+gf=a")
        ));

        // Right hand finishes; session clears once both uploads drain.
        for _ in 0..CALIBRATION_SAMPLES {
            ctl.feed(Hand::Right, sample, t0 + Duration::from_secs(1));
        }
        ctl.tick(t0 + Duration::from_secs(5));
        assert!(!ctl.in_progress());
    }

    #[test]
    fn test_cancel_clears_session() {
        let mut ctl = CalibrationController::new();
        ctl.start(OffsetKind::Mag);
        ctl.feed(Hand::Left, Vector3::new(1.0, 1.0, 1.0), Instant::now());
        ctl.cancel();
        assert!(!ctl.in_progress());
        assert!(ctl.feed(Hand::Left, Vector3::zeros(), Instant::now()).is_empty());
    }
}
