// Shared stream engine state and self-paced packet scheduling
//
// The scheduling model maps wall-clock time to byte position linearly:
//
//   position = start_position + bytes(now - start_time - glitch_adjust)
//
// Each Run re-anchors `start_time`/`start_position`, so pause/resume cycles
// never produce a position discontinuity. When a packet deadline is found to
// be in the past, the overrun is folded into `glitch_adjust` and the missed
// completion is delivered synchronously from an explicit loop.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{PresentationPosition, StreamState, MAX_CATCH_UP_PASSES};
use crate::clock::PerformanceClock;
use crate::error::{DspError, Result};
use crate::format::StreamFormat;
use crate::notify::{PacketNotification, PacketNotifier};
use crate::packets::RtPackets;
use crate::timer::NotificationTimer;

#[derive(Debug, Default)]
pub(crate) struct Timing {
    pub state: StreamState,
    /// Bytes; frozen at Pause, recomputed from the clock while running.
    pub position: u64,
    /// 100ns units.
    pub start_time: u64,
    pub start_position: u64,
    /// Accumulated scheduling overrun, 100ns units.
    pub glitch_adjust: u64,
    /// Counter values.
    pub current_packet_start: u64,
    pub last_packet_start: u64,
    pub packet_size: u64,
    pub packet_count: usize,
}

/// Outcome of one scheduling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    /// Timer armed for the next packet deadline.
    Scheduled,
    /// Deadline already passed; the caller owes a synchronous pass.
    Overdue,
    /// Stream is not running.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct CatchUp {
    pub passes: usize,
    pub deferred: bool,
}

/// Engines driven by the notification timer.
pub(crate) trait PacketEngine: Send + Sync + 'static {
    fn core(&self) -> &StreamCore;

    /// Complete exactly one packet.
    fn stream_pass(&self);
}

/// Timer callback: complete the due packet, then schedule the next one.
pub(crate) fn notification_callback<E: PacketEngine>(
    engine: Weak<E>,
) -> impl Fn() + Send + Sync + 'static {
    move || {
        if let Some(engine) = engine.upgrade() {
            engine.stream_pass();
            engine.core().drive_passes(|| engine.stream_pass());
        }
    }
}

pub(crate) struct StreamCore {
    name: &'static str,
    format: StreamFormat,
    clock: Arc<dyn PerformanceClock>,
    notifier: Arc<dyn PacketNotifier>,
    timing: Mutex<Timing>,
    current_packet: AtomicU64,
    packets: Mutex<Option<RtPackets>>,
    timer: Mutex<Option<Arc<NotificationTimer>>>,
}

impl StreamCore {
    pub fn new(
        name: &'static str,
        format: StreamFormat,
        clock: Arc<dyn PerformanceClock>,
        notifier: Arc<dyn PacketNotifier>,
    ) -> Result<Self> {
        format.validate()?;
        Ok(Self {
            name,
            format,
            clock,
            notifier,
            timing: Mutex::new(Timing::default()),
            current_packet: AtomicU64::new(0),
            packets: Mutex::new(None),
            timer: Mutex::new(None),
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn clock(&self) -> &Arc<dyn PerformanceClock> {
        &self.clock
    }

    pub fn notifier(&self) -> &Arc<dyn PacketNotifier> {
        &self.notifier
    }

    pub fn state(&self) -> StreamState {
        self.timing.lock().state
    }

    pub fn current_packet(&self) -> u64 {
        self.current_packet.load(Ordering::SeqCst)
    }

    pub fn packet_size(&self) -> usize {
        self.timing.lock().packet_size as usize
    }

    pub fn packet_count(&self) -> usize {
        self.timing.lock().packet_count
    }

    #[cfg(test)]
    pub fn glitch_adjust(&self) -> u64 {
        self.timing.lock().glitch_adjust
    }

    pub fn with_packets<R>(&self, f: impl FnOnce(Option<&mut RtPackets>) -> R) -> R {
        let mut packets = self.packets.lock();
        f(packets.as_mut())
    }

    fn check_state(&self, allowed: &[StreamState], to: StreamState) -> Result<()> {
        let from = self.state();
        if allowed.contains(&from) {
            Ok(())
        } else {
            Err(DspError::InvalidStateTransition { from, to })
        }
    }

    pub fn check_prepare(&self) -> Result<()> {
        self.check_state(&[StreamState::Stop], StreamState::Pause)
    }

    pub fn check_pause(&self) -> Result<()> {
        self.check_state(&[StreamState::Run], StreamState::Pause)
    }

    pub fn check_release(&self) -> Result<()> {
        self.check_state(&[StreamState::Pause, StreamState::Run], StreamState::Stop)
    }

    pub fn commit_prepare(&self, timer: NotificationTimer) -> Result<()> {
        let mut timing = self.timing.lock();
        if timing.state != StreamState::Stop {
            return Err(DspError::InvalidStateTransition {
                from: timing.state,
                to: StreamState::Pause,
            });
        }
        *self.timer.lock() = Some(Arc::new(timer));
        timing.state = StreamState::Pause;
        log::info!("{} stream prepared", self.name);
        Ok(())
    }

    /// Stop -> Pause for engines paced by the one-shot packet timer.
    pub fn prepare<E: PacketEngine>(&self, engine: Weak<E>) -> Result<()> {
        self.check_prepare()?;
        let timer = NotificationTimer::new(
            format!("{}-stream", self.name),
            notification_callback(engine),
        )?;
        self.commit_prepare(timer)
    }

    /// Pause -> Run, then schedule the first packet deadline.
    pub fn run(&self, pass: impl Fn()) -> Result<()> {
        self.begin_run()?;
        self.drive_passes(pass);
        Ok(())
    }

    pub fn timer(&self) -> Option<Arc<NotificationTimer>> {
        self.timer.lock().clone()
    }

    /// Re-anchor the time/position mapping and enter Run.
    pub fn begin_run(&self) -> Result<()> {
        let mut timing = self.timing.lock();
        if timing.state != StreamState::Pause {
            return Err(DspError::InvalidStateTransition {
                from: timing.state,
                to: StreamState::Run,
            });
        }
        if timing.packet_count == 0 {
            return Err(DspError::NotPrepared);
        }
        timing.start_time = self.clock.now_hns();
        timing.start_position = timing.position;
        timing.glitch_adjust = 0;
        timing.state = StreamState::Run;
        log::info!(
            "{} stream running from position {} (packet {})",
            self.name,
            timing.start_position,
            self.current_packet()
        );
        Ok(())
    }

    /// Cancel the notification timer, waiting out any in-flight callback.
    pub fn stop_timer(&self) {
        let timer = self.timer.lock().clone();
        if let Some(timer) = timer {
            timer.stop();
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.check_pause()?;
        self.stop_timer();

        let mut timing = self.timing.lock();
        self.update_position_locked(&mut timing);
        timing.state = StreamState::Pause;
        log::info!("{} stream paused at position {}", self.name, timing.position);
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        self.check_release()?;

        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.stop();
            drop(timer);
        }

        {
            let mut timing = self.timing.lock();
            timing.position = 0;
            timing.start_time = 0;
            timing.start_position = 0;
            timing.glitch_adjust = 0;
            timing.current_packet_start = 0;
            timing.last_packet_start = 0;
            timing.state = StreamState::Stop;
        }
        self.current_packet.store(0, Ordering::SeqCst);
        self.free_packets();

        log::info!("{} stream released", self.name);
        Ok(())
    }

    pub fn allocate_packets(&self, count: usize, size: usize) -> Result<()> {
        if self.state() == StreamState::Run {
            return Err(DspError::InvalidParameter(
                "cannot reallocate packets while the stream is running".to_string(),
            ));
        }
        let packets = RtPackets::allocate(count, size)?;
        *self.packets.lock() = Some(packets);

        let mut timing = self.timing.lock();
        timing.packet_size = size as u64;
        timing.packet_count = count;
        Ok(())
    }

    pub fn free_packets(&self) {
        let released = self.packets.lock().take();
        if released.is_some() {
            log::debug!("{} stream packets freed", self.name);
        }
        let mut timing = self.timing.lock();
        timing.packet_size = 0;
        timing.packet_count = 0;
    }

    fn update_position_locked(&self, timing: &mut Timing) {
        if timing.state != StreamState::Run {
            return;
        }
        let elapsed = self
            .clock
            .now_hns()
            .saturating_sub(timing.start_time)
            .saturating_sub(timing.glitch_adjust);
        timing.position = timing.start_position + self.format.hns_to_bytes(elapsed);
    }

    pub fn linear_position(&self) -> u64 {
        let mut timing = self.timing.lock();
        self.update_position_locked(&mut timing);
        timing.position
    }

    pub fn presentation_position(&self) -> PresentationPosition {
        PresentationPosition {
            frames: self.format.bytes_to_frames(self.linear_position()),
            qpc: self.clock.query_counter(),
        }
    }

    /// Last completed packet and the counter value its transfer started at.
    pub fn last_completed_packet(&self) -> (u64, u64) {
        let current = self.current_packet();
        let timing = self.timing.lock();
        (current.saturating_sub(1), timing.last_packet_start)
    }

    /// Hardware FIFO size in bytes and pipeline delay in 100ns units.
    /// The virtual device has neither.
    pub fn hw_latency(&self) -> (u32, u32) {
        (0, 0)
    }

    /// Work out when the next packet is due and arm the timer for it.
    pub fn schedule_next_pass(&self) -> Pass {
        let mut timing = self.timing.lock();
        if timing.state != StreamState::Run {
            return Pass::Idle;
        }

        let next_packet = self.current_packet() + 1;
        let offset_bytes =
            (next_packet * timing.packet_size) as i128 - timing.start_position as i128;
        let offset_hns = if offset_bytes >= 0 {
            self.format.bytes_to_hns(offset_bytes as u64) as i128
        } else {
            -(self.format.bytes_to_hns((-offset_bytes) as u64) as i128)
        };
        let next_packet_time =
            timing.start_time as i128 + timing.glitch_adjust as i128 + offset_hns;
        let now = self.clock.now_hns() as i128;
        let delay = next_packet_time - now;

        if delay <= 0 {
            let overrun = (-delay) as u64;
            timing.glitch_adjust += overrun;
            log::debug!(
                "{} stream glitch: packet {} overdue by {} hns (total adjust {})",
                self.name,
                next_packet,
                overrun,
                timing.glitch_adjust
            );
            return Pass::Overdue;
        }

        self.arm_timer(delay as u64);
        Pass::Scheduled
    }

    fn arm_timer(&self, delay_hns: u64) {
        let timer = self.timer.lock().clone();
        if let Some(timer) = timer {
            timer.start(Duration::from_nanos(delay_hns.saturating_mul(100)));
        }
    }

    /// Schedule the next pass, delivering overdue packets synchronously.
    ///
    /// At most `MAX_CATCH_UP_PASSES` packets are completed inline; any backlog
    /// beyond that is handed to the timer thread with a zero-delay deadline.
    pub fn drive_passes(&self, pass: impl Fn()) -> CatchUp {
        let mut catch_up = CatchUp::default();
        loop {
            match self.schedule_next_pass() {
                Pass::Scheduled | Pass::Idle => return catch_up,
                Pass::Overdue if catch_up.passes < MAX_CATCH_UP_PASSES => {
                    pass();
                    catch_up.passes += 1;
                }
                Pass::Overdue => {
                    log::warn!(
                        "{} stream still behind after {} catch-up passes; deferring",
                        self.name,
                        catch_up.passes
                    );
                    self.arm_timer(0);
                    catch_up.deferred = true;
                    return catch_up;
                }
            }
        }
    }

    /// Advance the packet counter and publish the packet start pair.
    /// Returns the number of the packet just completed.
    pub fn advance_packet(&self, qpc: u64) -> u64 {
        let completed = self.current_packet.fetch_add(1, Ordering::SeqCst);
        let mut timing = self.timing.lock();
        timing.last_packet_start = timing.current_packet_start;
        timing.current_packet_start = qpc;
        completed
    }

    pub fn notify(&self, packet_number: u64, qpc: u64) {
        self.notifier.packet_completed(PacketNotification { packet_number, qpc });
    }

    /// Process the packet that just finished, then advance and notify.
    pub fn complete_pass<F>(&self, process: F) -> u64
    where
        F: FnOnce(&mut [u8], u64) -> Result<()>,
    {
        let qpc = self.clock.query_counter();
        let completed = self.current_packet();
        {
            let mut packets = self.packets.lock();
            if let Some(packets) = packets.as_mut() {
                let index = (completed % packets.count() as u64) as usize;
                let result = packets.packet_mut(index).and_then(|buffer| process(buffer, completed));
                if let Err(e) = result {
                    log::warn!("{} stream packet {} not processed: {}", self.name, completed, e);
                }
            }
        }
        let completed = self.advance_packet(qpc);
        self.notify(completed, qpc);
        completed
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: StreamState) {
        self.timing.lock().state = state;
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::format::HNS_PER_SEC;
    use crate::notify::{ChannelNotifier, NotifierEvent};
    use crossbeam::channel::Receiver;
    use std::sync::atomic::AtomicBool;

    /// 10 second packets so real timers never fire during a test.
    const SLOW_PACKET: usize = 320_000;

    struct TestEngine {
        core: StreamCore,
        clock: Arc<ManualClock>,
        stall: AtomicBool,
    }

    impl PacketEngine for TestEngine {
        fn core(&self) -> &StreamCore {
            &self.core
        }

        fn stream_pass(&self) {
            if self.stall.load(Ordering::SeqCst) {
                // Processing takes longer than a packet.
                self.clock.advance_ms(11_000);
            }
            self.core.complete_pass(|buffer, n| {
                buffer[0] = n as u8;
                Ok(())
            });
        }
    }

    fn engine() -> (Arc<TestEngine>, Receiver<NotifierEvent>) {
        let clock = Arc::new(ManualClock::new(HNS_PER_SEC));
        let (tx, rx) = crossbeam::channel::unbounded();
        let core = StreamCore::new(
            "test",
            StreamFormat::default(),
            clock.clone(),
            Arc::new(ChannelNotifier::new(tx)),
        )
        .unwrap();
        core.allocate_packets(1, SLOW_PACKET).unwrap();
        core.force_state(StreamState::Pause);
        let engine = Arc::new(TestEngine {
            core,
            clock,
            stall: AtomicBool::new(false),
        });
        (engine, rx)
    }

    fn completed(rx: &Receiver<NotifierEvent>) -> Vec<u64> {
        rx.try_iter()
            .filter_map(|event| match event {
                NotifierEvent::PacketCompleted(n) => Some(n.packet_number),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_on_time_pass_schedules_without_glitch() {
        let (engine, rx) = engine();
        engine.core.begin_run().unwrap();
        assert_eq!(engine.core.schedule_next_pass(), Pass::Scheduled);

        engine.clock.advance_ms(10_000);
        engine.stream_pass();
        let catch_up = engine.core.drive_passes(|| engine.stream_pass());

        assert_eq!(catch_up, CatchUp::default());
        assert_eq!(engine.core.current_packet(), 1);
        assert_eq!(engine.core.glitch_adjust(), 0);
        assert_eq!(completed(&rx), vec![0]);
    }

    #[test]
    fn test_overdue_deadline_is_absorbed_and_delivered() {
        let (engine, rx) = engine();
        engine.core.begin_run().unwrap();

        // Clock frozen past the next two packet boundaries.
        engine.clock.advance_ms(35_000);
        engine.stream_pass();
        let catch_up = engine.core.drive_passes(|| engine.stream_pass());

        assert_eq!(catch_up.passes, 1);
        assert!(!catch_up.deferred);
        assert_eq!(engine.core.current_packet(), 2);
        assert_eq!(engine.core.glitch_adjust(), 15 * HNS_PER_SEC);
        assert_eq!(completed(&rx), vec![0, 1]);

        // Back on schedule: next deadline is 45s, clock is at 45s - 1ms.
        engine.clock.advance_ms(9_999);
        assert_eq!(engine.core.schedule_next_pass(), Pass::Scheduled);
        assert_eq!(engine.core.glitch_adjust(), 15 * HNS_PER_SEC);
    }

    #[test]
    fn test_catch_up_is_bounded() {
        let (engine, rx) = engine();
        engine.core.begin_run().unwrap();
        engine.stall.store(true, Ordering::SeqCst);

        engine.clock.advance_ms(10_000);
        engine.stream_pass();
        let catch_up = engine.core.drive_passes(|| engine.stream_pass());

        assert_eq!(catch_up.passes, MAX_CATCH_UP_PASSES);
        assert!(catch_up.deferred);
        let numbers = completed(&rx);
        assert_eq!(numbers.len(), MAX_CATCH_UP_PASSES + 1);
        assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_idle_when_not_running() {
        let (engine, _rx) = engine();
        assert_eq!(engine.core.schedule_next_pass(), Pass::Idle);
        let catch_up = engine.core.drive_passes(|| engine.stream_pass());
        assert_eq!(catch_up.passes, 0);
        assert_eq!(engine.core.current_packet(), 0);
    }

    #[test]
    fn test_position_freezes_on_pause_and_continues_on_run() {
        let (engine, _rx) = engine();
        engine.core.begin_run().unwrap();
        engine.clock.advance_ms(250);
        let before_pause = engine.core.linear_position();
        assert_eq!(before_pause, 8_000);

        engine.core.pause().unwrap();
        engine.clock.advance_ms(5_000);
        assert_eq!(engine.core.linear_position(), before_pause);

        engine.core.begin_run().unwrap();
        assert_eq!(engine.core.linear_position(), before_pause);
        engine.clock.advance_ms(250);
        assert_eq!(engine.core.linear_position(), 16_000);
    }

    #[test]
    fn test_last_completed_packet_tracks_start_pair() {
        let (engine, _rx) = engine();
        engine.core.begin_run().unwrap();
        engine.core.advance_packet(100);
        engine.core.advance_packet(200);
        assert_eq!(engine.core.last_completed_packet(), (1, 100));
    }

    #[test]
    fn test_prepare_names_timer_after_stream() {
        let (engine, _rx) = engine();
        engine.core.force_state(StreamState::Stop);
        engine.core.prepare(Arc::downgrade(&engine)).unwrap();

        let timer = engine.core.timer().unwrap();
        assert_eq!(timer.name(), "test-stream");
        assert!(!timer.is_armed());
        assert_eq!(engine.core.state(), StreamState::Pause);
    }
}
