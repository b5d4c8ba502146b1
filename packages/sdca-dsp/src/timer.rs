//! High-resolution notification timer.
//!
//! Each timer owns one thread that sleeps until the armed deadline and then
//! runs the callback. Callbacks are serialized on that thread. `stop()` waits
//! for an in-flight callback and discards any re-arm it made, so once it
//! returns no callback can observe torn-down state.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{DspError, Result};

type Callback = Box<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct Schedule {
    deadline: Option<Instant>,
    period: Option<Duration>,
    in_callback: bool,
    /// Callers blocked in `stop()`; re-arms made meanwhile are dropped.
    stopping: usize,
    exit: bool,
    fired: u64,
}

struct Shared {
    schedule: Mutex<Schedule>,
    changed: Condvar,
}

pub struct NotificationTimer {
    name: String,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl NotificationTimer {
    pub fn new<F>(name: impl Into<String>, callback: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule::default()),
            changed: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let callback: Callback = Box::new(callback);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_thread_main(thread_shared, callback))
            .map_err(|e| {
                DspError::InsufficientResources(format!(
                    "failed to spawn timer thread '{}': {}",
                    name, e
                ))
            })?;
        let thread_id = thread.thread().id();

        log::debug!("Timer '{}' created", name);

        Ok(Self {
            name,
            shared,
            thread: Some(thread),
            thread_id,
        })
    }

    /// Arm a one-shot deadline `delay` from now, replacing any pending one.
    pub fn start(&self, delay: Duration) {
        let mut schedule = self.shared.schedule.lock();
        schedule.deadline = Some(Instant::now() + delay);
        schedule.period = None;
        self.shared.changed.notify_all();
    }

    /// Arm a periodic schedule. Deadlines advance by `period` from the first
    /// one, so a late callback does not push later ticks back.
    pub fn start_periodic(&self, first_delay: Duration, period: Duration) {
        let mut schedule = self.shared.schedule.lock();
        schedule.deadline = Some(Instant::now() + first_delay);
        schedule.period = Some(period.max(Duration::from_micros(1)));
        self.shared.changed.notify_all();
    }

    /// Cancel the schedule and wait for an in-flight callback to return.
    pub fn stop(&self) {
        let mut schedule = self.shared.schedule.lock();
        schedule.deadline = None;
        schedule.period = None;
        if thread::current().id() != self.thread_id {
            schedule.stopping += 1;
            while schedule.in_callback {
                self.shared.changed.wait(&mut schedule);
            }
            schedule.stopping -= 1;
        }
        schedule.deadline = None;
        schedule.period = None;
    }

    pub fn is_armed(&self) -> bool {
        self.shared.schedule.lock().deadline.is_some()
    }

    /// Number of callbacks delivered so far.
    pub fn fired(&self) -> u64 {
        self.shared.schedule.lock().fired
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn timer_thread_main(shared: Arc<Shared>, callback: Callback) {
    let mut schedule = shared.schedule.lock();
    loop {
        if schedule.exit {
            break;
        }
        let Some(deadline) = schedule.deadline else {
            shared.changed.wait(&mut schedule);
            continue;
        };
        if Instant::now() < deadline {
            shared.changed.wait_until(&mut schedule, deadline);
            continue;
        }

        schedule.deadline = schedule.period.map(|period| deadline + period);
        schedule.in_callback = true;
        schedule.fired += 1;
        MutexGuard::unlocked(&mut schedule, || callback());
        schedule.in_callback = false;
        if schedule.stopping > 0 {
            schedule.deadline = None;
            schedule.period = None;
        }
        shared.changed.notify_all();
    }
}

impl Drop for NotificationTimer {
    fn drop(&mut self) {
        {
            let mut schedule = self.shared.schedule.lock();
            schedule.exit = true;
            schedule.deadline = None;
            schedule.period = None;
            self.shared.changed.notify_all();
        }
        if thread::current().id() == self.thread_id {
            // Dropped from its own callback; the thread exits on its next check.
            return;
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Timer '{}' thread panicked", self.name);
            }
        }
        log::debug!("Timer '{}' deleted", self.name);
    }
}
