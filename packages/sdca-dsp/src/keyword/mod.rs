// Keyword spotter: VAD port state machine and detection pre-buffer
//
// Two independent lock domains:
// - `VadPort::state` (blocking mutex) owns the armed flags, detector payloads
//   and the composite prepared/suspended port state. It is held across the
//   downstream SDCA requests so transitions are atomic.
// - `buffering` (spin lock) owns the capture window driven from the stream
//   timer. It is never held across I/O.
// Lock order is VAD state -> buffering -> FIFO leaf locks.
//
// A dedicated notification thread applies suspend/resume signals from the
// downstream codec through the same transition function used by arm/disarm.

pub mod fifo;
pub mod sdca;

use crossbeam::channel::{self, select, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::clock::PerformanceClock;
use crate::config::DetectorConfig;
use crate::error::{DspError, Result};
use crate::format::StreamFormat;
use crate::notify::PacketNotification;
use crate::packets::RtPackets;

pub use fifo::{FifoStats, PacketFifo, ReadPacket};
pub use sdca::{SdcaProperty, SdcaRequest, SdcaTarget, SimulatedSdcaDevice, REQUEST_TIMEOUT};

/// Event id of the first keyword detector.
pub const KEYWORD_DETECTOR_1: Uuid = Uuid::from_u128(0x6f5b_3c6e_8a3d_4d2a_9b1e_0c7f_4a21_d001);
/// Event id of the second keyword detector.
pub const KEYWORD_DETECTOR_2: Uuid = Uuid::from_u128(0x6f5b_3c6e_8a3d_4d2a_9b1e_0c7f_4a21_d002);

const KEYWORD_IDS: [Uuid; 2] = [KEYWORD_DETECTOR_1, KEYWORD_DETECTOR_2];

/// Composite VAD port state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VadPortState {
    Disarmed,
    /// Armed while the codec is suspended; the port is torn down.
    ArmedSuspended,
    ArmedPrepared,
    /// Flags disagree, typically while a transition request is failing.
    Transitional,
}

/// Descriptors read from the downstream device at initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorCapabilities {
    pub function_descriptor: Vec<u8>,
    pub entity_descriptor: Vec<u8>,
}

/// Result of one producer pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DpcOutcome {
    /// The FIFO went from empty to non-empty during this pass.
    pub is_realtime: bool,
    /// Packet at the head of the FIFO.
    pub next: Option<PacketNotification>,
}

#[derive(Debug, Default)]
struct VadState {
    armed: [bool; 2],
    data: [Option<Vec<u8>>; 2],
    prepared: bool,
    suspended: bool,
}

impl VadState {
    fn any_armed(&self) -> bool {
        self.armed.iter().any(|&armed| armed)
    }
}

#[derive(Debug, Default)]
struct BufferingState {
    /// Counter value the window starts at; zero while not buffering.
    qpc_start_capture: u64,
    last_queued_packet: u64,
    stream_running: bool,
}

/// The downstream VAD port and the state guarding it.
struct VadPort {
    target: Arc<dyn SdcaTarget>,
    port: u32,
    format: StreamFormat,
    timeout: Duration,
    state: Mutex<VadState>,
}

impl VadPort {
    fn configure(&self) -> Result<()> {
        let request = SdcaRequest::ConfigureVadPort {
            format: self.format,
            port: self.port,
        };
        self.target.send_request(&request, self.timeout)
    }

    fn cleanup(&self) -> Result<()> {
        self.target
            .send_request(&SdcaRequest::CleanupVadPort { port: self.port }, self.timeout)
    }

    /// Drive the port toward the state implied by the flags.
    /// Leaves `prepared` untouched if the request fails.
    fn update_stream_state(&self, vad: &mut VadState) -> Result<()> {
        let armed = vad.any_armed();
        if armed && !vad.prepared && !vad.suspended {
            self.configure()?;
            vad.prepared = true;
            log::debug!("VAD port {} configured", self.port);
        } else if armed && vad.prepared && vad.suspended {
            self.cleanup()?;
            vad.prepared = false;
            log::debug!("VAD port {} cleaned up for suspend", self.port);
        } else if !armed && vad.prepared {
            self.cleanup()?;
            vad.prepared = false;
            log::debug!("VAD port {} cleaned up after disarm", self.port);
        }
        Ok(())
    }

    fn set_suspended(&self, suspended: bool) {
        let mut vad = self.state.lock();
        vad.suspended = suspended;
        if let Err(e) = self.update_stream_state(&mut vad) {
            log::warn!(
                "VAD port {} {} transition failed: {}",
                self.port,
                if suspended { "suspend" } else { "resume" },
                e
            );
        }
    }
}

/// Signal from the downstream codec, applied in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadNotification {
    Suspend,
    Resume,
}

fn handle_notifications(
    port: Arc<VadPort>,
    notifications: Receiver<VadNotification>,
    exit: Receiver<()>,
) {
    log::debug!("Keyword notification thread started");
    loop {
        select! {
            recv(notifications) -> msg => match msg {
                Ok(VadNotification::Suspend) => port.set_suspended(true),
                Ok(VadNotification::Resume) => port.set_suspended(false),
                Err(_) => break,
            },
            recv(exit) -> _ => {
                log::debug!("Keyword notification thread exiting");
                break;
            }
        }
    }
}

/// Signals from the downstream codec.
#[derive(Debug, Clone)]
pub struct VadNotificationHandle {
    notifications: Sender<VadNotification>,
}

impl VadNotificationHandle {
    pub fn signal_suspend(&self) {
        self.send(VadNotification::Suspend);
    }

    pub fn signal_resume(&self) {
        self.send(VadNotification::Resume);
    }

    fn send(&self, notification: VadNotification) {
        if self.notifications.send(notification).is_err() {
            log::warn!("Dropping {:?}: notification thread is gone", notification);
        }
    }
}

struct NotificationThread {
    exit: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct KeywordDetector {
    config: DetectorConfig,
    clock: Arc<dyn PerformanceClock>,
    port: Arc<VadPort>,
    buffering: spin::Mutex<BufferingState>,
    fifo: PacketFifo,
    keyword_start: AtomicU64,
    keyword_stop: AtomicU64,
    handle: VadNotificationHandle,
    notifications: Receiver<VadNotification>,
    thread: Mutex<Option<NotificationThread>>,
    capabilities: Mutex<Option<DetectorCapabilities>>,
}

impl KeywordDetector {
    pub fn new(
        target: Arc<dyn SdcaTarget>,
        clock: Arc<dyn PerformanceClock>,
        config: DetectorConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let fifo = PacketFifo::new(config.pool_capacity(), config.packet_bytes())?;
        let port = Arc::new(VadPort {
            target,
            port: config.vad_port,
            format: config.format(),
            timeout: config.request_timeout(),
            state: Mutex::new(VadState::default()),
        });
        let (notify_tx, notify_rx) = channel::unbounded();

        Ok(Arc::new(Self {
            config,
            clock,
            port,
            buffering: spin::Mutex::new(BufferingState::default()),
            fifo,
            keyword_start: AtomicU64::new(0),
            keyword_stop: AtomicU64::new(0),
            handle: VadNotificationHandle {
                notifications: notify_tx,
            },
            notifications: notify_rx,
            thread: Mutex::new(None),
            capabilities: Mutex::new(None),
        }))
    }

    /// Start the notification thread and read the device descriptors.
    /// Runs once; later calls return immediately.
    pub fn initialize(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let target = self.port.target.as_ref();
        let timeout = self.port.timeout;
        let capabilities = DetectorCapabilities {
            function_descriptor: sdca::query_property(target, SdcaProperty::FunctionDescriptor, timeout)?,
            entity_descriptor: sdca::query_property(target, SdcaProperty::EntityDescriptor, timeout)?,
        };

        let (exit_tx, exit_rx) = channel::bounded(1);
        let port = Arc::clone(&self.port);
        let notifications = self.notifications.clone();
        let handle = std::thread::Builder::new()
            .name("keyword-notifications".to_string())
            .spawn(move || handle_notifications(port, notifications, exit_rx))
            .map_err(|e| {
                DspError::InsufficientResources(format!(
                    "failed to spawn keyword notification thread: {}",
                    e
                ))
            })?;

        *self.capabilities.lock() = Some(capabilities);
        *thread = Some(NotificationThread {
            exit: exit_tx,
            handle,
        });
        log::info!("Keyword detector initialized on VAD port {}", self.port.port);
        Ok(())
    }

    pub fn capabilities(&self) -> Option<DetectorCapabilities> {
        self.capabilities.lock().clone()
    }

    pub fn notification_handle(&self) -> VadNotificationHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn format(&self) -> StreamFormat {
        self.port.format
    }

    fn slot(id: &Uuid) -> Result<usize> {
        KEYWORD_IDS
            .iter()
            .position(|known| known == id)
            .ok_or_else(|| DspError::InvalidParameter(format!("unknown keyword event {}", id)))
    }

    /// Put the port back in line with the flags after a failed change.
    fn roll_back(&self, vad: &mut VadState) {
        if let Err(e) = self.port.update_stream_state(vad) {
            log::error!("VAD port {} rollback failed: {}", self.port.port, e);
            debug_assert!(false, "VAD port rollback failed: {}", e);
        }
    }

    pub fn set_armed(&self, id: &Uuid, armed: bool) -> Result<()> {
        let slot = Self::slot(id)?;
        self.initialize()?;

        let mut vad = self.port.state.lock();
        let previous = vad.armed[slot];
        vad.armed[slot] = armed;
        if let Err(e) = self.port.update_stream_state(&mut vad) {
            vad.armed[slot] = previous;
            self.roll_back(&mut vad);
            return Err(e);
        }
        self.update_buffering_state(&vad);
        log::debug!("Keyword {} armed={}", id, armed);
        Ok(())
    }

    pub fn get_armed(&self, id: &Uuid) -> Result<bool> {
        let slot = Self::slot(id)?;
        Ok(self.port.state.lock().armed[slot])
    }

    /// Disarm `id` and drop its detector payload.
    pub fn reset_detector(&self, id: &Uuid) -> Result<()> {
        let slot = Self::slot(id)?;
        self.initialize()?;

        let mut vad = self.port.state.lock();
        let previous_armed = vad.armed[slot];
        let previous_data = vad.data[slot].take();
        vad.armed[slot] = false;
        if let Err(e) = self.port.update_stream_state(&mut vad) {
            vad.armed[slot] = previous_armed;
            vad.data[slot] = previous_data;
            self.roll_back(&mut vad);
            return Err(e);
        }
        self.update_buffering_state(&vad);
        Ok(())
    }

    pub fn download_detector_data(&self, id: &Uuid, data: Vec<u8>) -> Result<()> {
        let slot = Self::slot(id)?;
        log::debug!("Keyword {} detector data: {} bytes", id, data.len());
        self.port.state.lock().data[slot] = Some(data);
        Ok(())
    }

    pub fn detector_data(&self, id: &Uuid) -> Result<Option<Vec<u8>>> {
        let slot = Self::slot(id)?;
        Ok(self.port.state.lock().data[slot].clone())
    }

    pub fn vad_port_state(&self) -> VadPortState {
        let vad = self.port.state.lock();
        match (vad.any_armed(), vad.prepared, vad.suspended) {
            (false, false, _) => VadPortState::Disarmed,
            (true, false, true) => VadPortState::ArmedSuspended,
            (true, true, false) => VadPortState::ArmedPrepared,
            _ => VadPortState::Transitional,
        }
    }

    pub fn is_prepared(&self) -> bool {
        self.port.state.lock().prepared
    }

    pub fn is_suspended(&self) -> bool {
        self.port.state.lock().suspended
    }

    /// Poll until the port reaches `expected` or `timeout` elapses.
    pub fn wait_for_port_state(&self, expected: VadPortState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.vad_port_state() == expected {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn run(&self) {
        self.set_stream_running(true);
    }

    pub fn stop(&self) {
        self.set_stream_running(false);
    }

    pub fn is_stream_running(&self) -> bool {
        self.buffering.lock().stream_running
    }

    /// Capture window start; zero while not buffering.
    pub fn capture_start(&self) -> u64 {
        self.buffering.lock().qpc_start_capture
    }

    fn set_stream_running(&self, running: bool) {
        let vad = self.port.state.lock();
        self.buffering.lock().stream_running = running;
        self.update_buffering_state(&vad);
    }

    /// Open or close the capture window. Called with the VAD state held.
    fn update_buffering_state(&self, vad: &VadState) {
        let mut buffering = self.buffering.lock();
        let active = vad.any_armed() || buffering.stream_running;
        let buffering_now = buffering.qpc_start_capture > 0;

        if active && !buffering_now {
            buffering.qpc_start_capture = self.clock.query_counter().max(1);
            buffering.last_queued_packet = 0;
            log::debug!("Keyword buffering started at {}", buffering.qpc_start_capture);
        } else if !active && buffering_now {
            buffering.qpc_start_capture = 0;
            buffering.last_queued_packet = 0;
            self.fifo.reset();
            log::debug!("Keyword buffering stopped");
        }
    }

    fn packet_end_qpc(&self, start: u64, packet_number: u64, frequency: u64) -> u64 {
        let samples = (packet_number + 1) as u128 * self.config.samples_per_packet as u128;
        start + (samples * frequency as u128 / self.config.samples_per_second as u128) as u64
    }

    /// Queue every packet that has become due by `perf_counter`.
    ///
    /// The buffering lock is held across production so a window reset from
    /// `run`/`stop`/`notify_detection` never interleaves with a push.
    pub fn dpc_routine(&self, perf_counter: u64, perf_frequency: u64) -> DpcOutcome {
        let mut buffering = self.buffering.lock();
        if buffering.qpc_start_capture == 0 {
            return DpcOutcome::default();
        }
        let start = buffering.qpc_start_capture;
        let elapsed = perf_counter.saturating_sub(start) as u128;
        let due = (elapsed * self.config.samples_per_second as u128
            / (perf_frequency.max(1) as u128 * self.config.samples_per_packet as u128))
            as u64;
        let first = buffering.last_queued_packet;
        buffering.last_queued_packet = due.max(first);

        // Anything older than a full pool would be evicted again at once.
        let capacity = self.fifo.capacity() as u64;
        let produce_from = first.max(due.saturating_sub(capacity));
        if produce_from > first {
            log::warn!(
                "Keyword buffer overrun: skipping packets {}..{}",
                first,
                produce_from
            );
            self.fifo.record_dropped(produce_from - first);
        }

        let mut is_realtime = false;
        for packet_number in produce_from..due {
            let qpc = self.packet_end_qpc(start, packet_number, perf_frequency);
            is_realtime |= self.fifo.produce(packet_number, qpc);
        }
        drop(buffering);

        DpcOutcome {
            is_realtime,
            next: self.fifo_front(),
        }
    }

    /// Move the oldest buffered packet into its slot of `packets`.
    pub fn get_read_packet(&self, packets: &mut RtPackets) -> Result<ReadPacket> {
        let count = packets.count() as u64;
        let mut copied = Ok(());
        let read = self
            .fifo
            .consume(|packet_number, data| {
                copied = packets
                    .packet_mut((packet_number % count) as usize)
                    .map(|slot| {
                        let len = slot.len().min(data.len());
                        slot[..len].copy_from_slice(&data[..len]);
                    });
            })
            .ok_or(DspError::NoData)?;
        copied?;
        Ok(read)
    }

    pub fn fifo_front(&self) -> Option<PacketNotification> {
        self.fifo
            .front()
            .map(|(packet_number, qpc)| PacketNotification { packet_number, qpc })
    }

    pub fn fifo_stats(&self) -> FifoStats {
        self.fifo.stats()
    }

    /// Simulate a keyword hit ending now.
    ///
    /// Without a running stream the capture window is moved back one second
    /// so the stream that follows starts with the keyword audio. With a
    /// running stream the keyword start is clamped to the buffered window.
    pub fn notify_detection(&self) {
        let now = self.clock.query_counter();
        let one_second = self.clock.frequency();

        let start = {
            let mut buffering = self.buffering.lock();
            if buffering.stream_running {
                now.saturating_sub(one_second).max(buffering.qpc_start_capture)
            } else {
                let start = now.saturating_sub(one_second).max(1);
                buffering.qpc_start_capture = start;
                buffering.last_queued_packet = 0;
                self.fifo.reset();
                start
            }
        };

        let start = self.config.keyword_start_override.unwrap_or(start);
        let stop = self.config.keyword_stop_override.unwrap_or(now);
        self.keyword_start.store(start, Ordering::SeqCst);
        self.keyword_stop.store(stop, Ordering::SeqCst);
        log::info!("Keyword detected: [{}, {})", start, stop);
    }

    /// Start and stop counter values of the last detected keyword.
    pub fn keyword_timestamps(&self) -> (u64, u64) {
        (
            self.keyword_start.load(Ordering::SeqCst),
            self.keyword_stop.load(Ordering::SeqCst),
        )
    }
}

impl Drop for KeywordDetector {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.get_mut().take() {
            let _ = thread.exit.send(());
            if thread.handle.join().is_err() {
                log::error!("Keyword notification thread panicked");
            }
        }
    }
}
