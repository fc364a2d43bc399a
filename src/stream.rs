use crate::device::Config;
use crate::framer::Framer;
use crate::protocol::{
    self, OffsetKind, RawFrame, CMD_REQUEST_GYRO_OFFSETS, CMD_REQUEST_MAG_OFFSETS,
    CMD_START_STREAMING,
};
use crate::transport::Transport;
use crate::types::Hand;
use crate::{EteeError, Result};
use crossbeam_channel::{Receiver, Sender};
use nalgebra::Vector3;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Notifications from the reader thread to the control loop.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A bring-up offset response was parsed for one hand.
    Offsets {
        hand: Hand,
        kind: OffsetKind,
        offset: Vector3<f32>,
    },
    /// Offset polling exhausted its retry budget; streaming proceeds with
    /// that sensor uncalibrated.
    BringUpTimedOut { kind: OffsetKind },
    /// Bring-up finished and the enable-streaming command went out.
    StreamingStarted,
    TransportLost,
    TransportRecovered,
}

/// Lock-protected per-hand outbound command queue. The reader thread is the
/// only writer to the stream; consumers just enqueue lines here.
pub(crate) type CommandQueue = Arc<Mutex<VecDeque<String>>>;

fn take_one_clear_rest(queue: &CommandQueue) -> Option<String> {
    let mut q = queue.lock().ok()?;
    let cmd = q.pop_front();
    q.clear();
    cmd
}

/// Handle to the telemetry reader thread.
///
/// The thread owns the transport exclusively: it runs the offset bring-up
/// exchange, then frames the binary stream, routing each payload to its
/// hand's bounded channel. Consumers poll; nothing here blocks them.
pub struct TelemetryStream {
    frames: [Receiver<RawFrame>; 2],
    events: Receiver<StreamEvent>,
    commands: [CommandQueue; 2],
    stop_flag: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

struct ReaderCtx {
    frame_tx: [Sender<RawFrame>; 2],
    event_tx: Sender<StreamEvent>,
    commands: [CommandQueue; 2],
    stop_flag: Arc<AtomicBool>,
    offset_request_interval: Duration,
    offset_retry_budget: u32,
    request_gyro_offsets: bool,
    request_mag_offsets: bool,
    reconnect_interval: Duration,
}

impl TelemetryStream {
    /// Spawn the reader thread over an already-open transport.
    pub fn start(transport: Box<dyn Transport>, config: &Config) -> Result<TelemetryStream> {
        let (left_tx, left_rx) = crossbeam_channel::bounded(config.frame_channel_capacity);
        let (right_tx, right_rx) = crossbeam_channel::bounded(config.frame_channel_capacity);
        let (event_tx, event_rx) = crossbeam_channel::bounded(32);
        let commands: [CommandQueue; 2] = [
            Arc::new(Mutex::new(VecDeque::new())),
            Arc::new(Mutex::new(VecDeque::new())),
        ];
        let stop_flag = Arc::new(AtomicBool::new(false));

        let ctx = ReaderCtx {
            frame_tx: [left_tx, right_tx],
            event_tx,
            commands: [commands[0].clone(), commands[1].clone()],
            stop_flag: stop_flag.clone(),
            offset_request_interval: config.offset_request_interval,
            offset_retry_budget: config.offset_retry_budget,
            request_gyro_offsets: config.request_gyro_offsets,
            request_mag_offsets: config.request_mag_offsets,
            reconnect_interval: config.reconnect_interval,
        };

        let thread = std::thread::Builder::new()
            .name("etee-reader".into())
            .spawn(move || reader_loop(transport, ctx))
            .map_err(EteeError::Io)?;

        Ok(TelemetryStream {
            frames: [left_rx, right_rx],
            events: event_rx,
            commands,
            stop_flag,
            thread: Some(thread),
        })
    }

    /// Next queued frame for `hand`, if any. Frames arrive in wire order.
    pub fn try_recv_frame(&self, hand: Hand) -> Option<RawFrame> {
        self.frames[hand.index()].try_recv().ok()
    }

    /// Receive the next frame for `hand`, waiting up to `timeout`. For
    /// consumers without a tick loop; the control loop polls
    /// [`try_recv_frame`](Self::try_recv_frame) instead.
    pub fn recv_frame_timeout(&self, hand: Hand, timeout: Duration) -> Result<RawFrame> {
        self.frames[hand.index()]
            .recv_timeout(timeout)
            .map_err(|e| match e {
                crossbeam_channel::RecvTimeoutError::Timeout => EteeError::Timeout,
                crossbeam_channel::RecvTimeoutError::Disconnected => EteeError::StreamStopped,
            })
    }

    /// Next reader-thread notification, if any.
    pub fn try_recv_event(&self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Enqueue a command line on `hand`'s outbound queue. At most one line
    /// per hand is written per reader iteration; anything still queued at
    /// that point is dropped, matching the device's fire-and-forget model.
    pub fn queue_command(&self, hand: Hand, line: impl Into<String>) {
        if let Ok(mut q) = self.commands[hand.index()].lock() {
            q.push_back(line.into());
        }
    }

    /// Drop everything pending for `hand` (used when a hand disconnects).
    pub fn clear_commands(&self, hand: Hand) {
        if let Ok(mut q) = self.commands[hand.index()].lock() {
            q.clear();
        }
    }

    /// Whether the reader thread is still running.
    pub fn is_active(&self) -> bool {
        !self.stop_flag.load(Ordering::Relaxed)
    }

    /// Stop the reader and wait for it to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TelemetryStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stopped(ctx: &ReaderCtx) -> bool {
    ctx.stop_flag.load(Ordering::Relaxed)
}

/// The reader loop: bring-up first, then binary framing until stopped.
fn reader_loop(mut transport: Box<dyn Transport>, ctx: ReaderCtx) {
    log::info!("telemetry reader started");

    if ctx.request_gyro_offsets {
        request_offsets(&mut *transport, &ctx, OffsetKind::Gyro);
    }
    if ctx.request_mag_offsets {
        request_offsets(&mut *transport, &ctx, OffsetKind::Mag);
    }

    if !stopped(&ctx) {
        if let Err(e) = transport
            .write_line(CMD_START_STREAMING)
            .and_then(|_| transport.flush())
        {
            log::warn!("enable-streaming write failed: {}", e);
        }
        let _ = ctx.event_tx.try_send(StreamEvent::StreamingStarted);
        streaming_loop(&mut *transport, &ctx);
    }

    let _ = transport.flush();
    ctx.stop_flag.store(true, Ordering::Relaxed);
    log::info!("telemetry reader stopped");
}

/// Bring-up: poll one offset query at a fixed pace until both hands answer
/// or the retry budget runs out. The stream is read line-oriented here;
/// binary framing only starts afterwards.
fn request_offsets(transport: &mut dyn Transport, ctx: &ReaderCtx, kind: OffsetKind) {
    let query = match kind {
        OffsetKind::Gyro => CMD_REQUEST_GYRO_OFFSETS,
        OffsetKind::Mag => CMD_REQUEST_MAG_OFFSETS,
    };
    let mut seen = [false; 2];

    for attempt in 0..ctx.offset_retry_budget {
        if stopped(ctx) {
            return;
        }
        let started = Instant::now();

        if let Err(e) = transport.write_line(query) {
            log::warn!("{:?} offset query failed: {}", kind, e);
            recover_transport(transport, ctx);
        } else {
            match transport.read_line(ctx.offset_request_interval) {
                Ok(Some(line)) => {
                    // Anything without the expected tag is ignored and the
                    // query simply retried.
                    if let Some((hand, offset)) = protocol::parse_offset_line(&line, kind) {
                        seen[hand.index()] = true;
                        let _ = ctx.event_tx.try_send(StreamEvent::Offsets {
                            hand,
                            kind,
                            offset,
                        });
                        if seen.iter().all(|&s| s) {
                            log::info!("{:?} offsets received for both hands", kind);
                            return;
                        }
                    } else {
                        log::debug!("ignoring response line {:?} (attempt {})", line, attempt);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("{:?} offset read failed: {}", kind, e);
                    recover_transport(transport, ctx);
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed < ctx.offset_request_interval {
            std::thread::sleep(ctx.offset_request_interval - elapsed);
        }
    }

    log::warn!(
        "{:?} offset polling exhausted {} attempts; continuing uncalibrated",
        kind,
        ctx.offset_retry_budget
    );
    let _ = ctx.event_tx.try_send(StreamEvent::BringUpTimedOut { kind });
}

fn streaming_loop(transport: &mut dyn Transport, ctx: &ReaderCtx) {
    let mut framer = Framer::new();
    let mut buf = [0u8; 512];

    while !stopped(ctx) {
        // One outbound line per hand per iteration; the rest of the queue is
        // dropped so stale bursts never pile onto the wire.
        for hand in Hand::BOTH {
            if let Some(cmd) = take_one_clear_rest(&ctx.commands[hand.index()]) {
                log::debug!("sending {:?} to {hand}", cmd);
                if let Err(e) = transport.write_line(&cmd).and_then(|_| transport.flush()) {
                    log::warn!("command write failed: {}", e);
                }
            }
        }

        match transport.read(&mut buf) {
            Ok(0) => std::thread::sleep(Duration::from_millis(1)),
            Ok(n) => {
                for &byte in &buf[..n] {
                    if let Some(frame) = framer.push(byte) {
                        route_frame(ctx, frame);
                    }
                }
            }
            Err(e) => {
                log::warn!("telemetry read error: {}", e);
                recover_transport(transport, ctx);
            }
        }
    }
}

fn route_frame(ctx: &ReaderCtx, frame: RawFrame) {
    let hand = protocol::hand_of(&frame);
    match ctx.frame_tx[hand.index()].try_send(frame) {
        Ok(()) => {}
        Err(crossbeam_channel::TrySendError::Full(_)) => {
            log::trace!("{hand} frame channel full, dropping frame");
        }
        Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
            log::info!("{hand} frame channel disconnected, stopping reader");
            ctx.stop_flag.store(true, Ordering::Relaxed);
        }
    }
}

/// Bounded-interval reconnect after an I/O failure. Never gives up on its
/// own; only the stop flag ends the attempt.
fn recover_transport(transport: &mut dyn Transport, ctx: &ReaderCtx) {
    let _ = ctx.event_tx.try_send(StreamEvent::TransportLost);
    while !stopped(ctx) {
        std::thread::sleep(ctx.reconnect_interval);
        match transport.reopen() {
            Ok(()) => {
                let _ = ctx.event_tx.try_send(StreamEvent::TransportRecovered);
                return;
            }
            Err(e) => log::debug!("reopen failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FRAME_LEN, HAND_BIT, HAND_BYTE, SENTINEL};
    use crate::transport::MockTransport;

    fn test_config() -> Config {
        Config {
            offset_request_interval: Duration::from_millis(1),
            offset_retry_budget: 5,
            ..Config::default()
        }
    }

    fn wire_frame(hand: Hand, fill: u8) -> Vec<u8> {
        let mut payload = [fill; FRAME_LEN];
        payload[HAND_BYTE] = match hand {
            Hand::Right => 1 << HAND_BIT,
            Hand::Left => 0,
        };
        let mut bytes = payload.to_vec();
        bytes.extend([SENTINEL, SENTINEL]);
        bytes
    }

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(v) = f() {
                return v;
            }
            assert!(Instant::now() < deadline, "timed out waiting");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_bring_up_then_streaming() {
        let mock = MockTransport::new();
        mock.inject_line("junk line");
        mock.inject_line("L:gf=0.1 0.2 0.3");
        mock.inject_line("R:gf=-0.1 -0.2 -0.3");

        let stream = TelemetryStream::start(Box::new(mock.clone()), &test_config()).unwrap();

        let mut events = Vec::new();
        wait_for(|| {
            while let Some(e) = stream.try_recv_event() {
                events.push(e);
            }
            events.contains(&StreamEvent::StreamingStarted).then_some(())
        });

        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::Offsets { hand: Hand::Left, kind: OffsetKind::Gyro, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::Offsets { hand: Hand::Right, kind: OffsetKind::Gyro, .. }
        )));

        let written = mock.written_lines();
        assert!(written.iter().any(|l| l == CMD_REQUEST_GYRO_OFFSETS));
        assert_eq!(written.last().map(String::as_str), Some(CMD_START_STREAMING));
        stream.stop();
    }

    #[test]
    fn test_bring_up_budget_exhaustion() {
        let mock = MockTransport::new();
        let stream = TelemetryStream::start(Box::new(mock), &test_config()).unwrap();

        let event = wait_for(|| {
            stream
                .try_recv_event()
                .filter(|e| matches!(e, StreamEvent::BringUpTimedOut { .. }))
        });
        assert_eq!(event, StreamEvent::BringUpTimedOut { kind: OffsetKind::Gyro });

        // The stream still comes up, just uncalibrated.
        wait_for(|| {
            stream
                .try_recv_event()
                .filter(|e| *e == StreamEvent::StreamingStarted)
        });
        stream.stop();
    }

    #[test]
    fn test_frames_routed_per_hand_in_order() {
        let mock = MockTransport::new();
        let mut config = test_config();
        config.request_gyro_offsets = false;

        let stream = TelemetryStream::start(Box::new(mock.clone()), &config).unwrap();
        let mut bytes = Vec::new();
        bytes.extend(wire_frame(Hand::Left, 0x01));
        bytes.extend(wire_frame(Hand::Right, 0x02));
        bytes.extend(wire_frame(Hand::Left, 0x03));
        mock.inject_bytes(&bytes);

        let first_left = wait_for(|| stream.try_recv_frame(Hand::Left));
        let second_left = wait_for(|| stream.try_recv_frame(Hand::Left));
        let right = wait_for(|| stream.try_recv_frame(Hand::Right));
        assert_eq!(first_left[0], 0x01);
        assert_eq!(second_left[0], 0x03);
        assert_eq!(right[0], 0x02);
        stream.stop();
    }

    #[test]
    fn test_command_queue_writes_one_and_clears() {
        let mock = MockTransport::new();
        let mut config = test_config();
        config.request_gyro_offsets = false;

        let stream = TelemetryStream::start(Box::new(mock.clone()), &config).unwrap();
        wait_for(|| {
            stream
                .try_recv_event()
                .filter(|e| *e == StreamEvent::StreamingStarted)
        });

        stream.queue_command(Hand::Left, "BL+MR=100");
        wait_for(|| {
            mock.written_lines()
                .iter()
                .any(|l| l == "BL+MR=100")
                .then_some(())
        });
        stream.stop();
    }

    #[test]
    fn test_stop_joins_reader() {
        let mock = MockTransport::new();
        let mut config = test_config();
        config.request_gyro_offsets = false;

        let stream = TelemetryStream::start(Box::new(mock), &config).unwrap();
        assert!(stream.is_active());
        stream.stop();
    }
}
