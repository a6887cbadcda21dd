//! One-shot, cancelable, resettable callback timers.
//!
//! All timers of a [`TimerService`] share one dedicated thread. Handles talk
//! to it over a command channel, so starting or canceling a timer never
//! blocks the caller. Callbacks run on the timer thread and must return
//! quickly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{Error, Result};

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Generation value meaning "not armed".
const DISARMED: u64 = 0;

enum Command {
    Arm {
        id: u64,
        generation: u64,
        deadline: Instant,
        callback: Callback,
        armed: Arc<AtomicU64>,
    },
    Cancel {
        id: u64,
    },
}

struct Entry {
    generation: u64,
    deadline: Instant,
    callback: Callback,
    armed: Arc<AtomicU64>,
}

/// Handle to a timer thread. Cheap to clone; the thread exits once every
/// clone and every [`Timer`] created from it is dropped.
#[derive(Clone)]
pub struct TimerService {
    tx: Sender<Command>,
    next_id: Arc<AtomicU64>,
    next_generation: Arc<AtomicU64>,
}

impl TimerService {
    /// Spawn the timer thread.
    pub fn spawn(thread_name: &str) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || run_timer_thread(rx))?;
        log::debug!("Timer thread '{}' started", thread_name);

        Ok(Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            next_generation: Arc::new(AtomicU64::new(1)),
        })
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn allocate_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// A value never handed out before by this service, never zero. Owners
    /// of timers use it to tag which arming an expiry belongs to.
    pub(crate) fn next_token(&self) -> u64 {
        self.allocate_generation()
    }
}

fn run_timer_thread(rx: Receiver<Command>) {
    let mut armed: HashMap<u64, Entry> = HashMap::new();

    loop {
        let next_deadline = armed.values().map(|e| e.deadline).min();
        let command = match next_deadline {
            Some(deadline) => match rx.recv_deadline(deadline) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };

        match command {
            Some(Command::Arm {
                id,
                generation,
                deadline,
                callback,
                armed: flag,
            }) => {
                armed.insert(
                    id,
                    Entry {
                        generation,
                        deadline,
                        callback,
                        armed: flag,
                    },
                );
            }
            Some(Command::Cancel { id }) => {
                armed.remove(&id);
            }
            None => {}
        }

        fire_expired(&mut armed);
    }

    log::debug!("Timer thread exiting");
}

fn fire_expired(armed: &mut HashMap<u64, Entry>) {
    let now = Instant::now();
    let due: Vec<u64> = armed
        .iter()
        .filter(|(_, e)| e.deadline <= now)
        .map(|(&id, _)| id)
        .collect();

    for id in due {
        let Some(entry) = armed.remove(&id) else {
            continue;
        };
        // A handle that stopped or re-armed since this entry was queued has
        // already moved the generation on.
        if entry
            .armed
            .compare_exchange(entry.generation, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            (entry.callback)();
        }
    }
}

/// A single-shot timer. Dropping the handle cancels it.
pub struct Timer {
    id: u64,
    name: String,
    interval: Duration,
    service: TimerService,
    on_reset: Option<Box<dyn Fn() + Send + Sync>>,
    on_expire: Callback,
    armed: Arc<AtomicU64>,
}

impl Timer {
    pub fn new<F>(
        service: &TimerService,
        name: impl Into<String>,
        interval: Duration,
        on_reset: Option<Box<dyn Fn() + Send + Sync>>,
        on_expire: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            id: service.allocate_id(),
            name: name.into(),
            interval,
            service: service.clone(),
            on_reset,
            on_expire: Arc::new(on_expire),
            armed: Arc::new(AtomicU64::new(DISARMED)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Arm the timer. Re-arming a running timer restarts its interval.
    pub fn start(&self) -> Result<()> {
        let generation = self.service.allocate_generation();
        self.armed.store(generation, Ordering::Release);

        let command = Command::Arm {
            id: self.id,
            generation,
            deadline: Instant::now() + self.interval,
            callback: Arc::clone(&self.on_expire),
            armed: Arc::clone(&self.armed),
        };
        if self.service.tx.send(command).is_err() {
            self.armed.store(DISARMED, Ordering::Release);
            return Err(Error::TimerStartFailed(self.name.clone()));
        }
        Ok(())
    }

    /// Run the reset hook, then restart the interval.
    pub fn reset(&self) -> Result<()> {
        if let Some(hook) = &self.on_reset {
            hook();
        }
        self.start()
    }

    pub fn stop(&self) {
        if self.armed.swap(DISARMED, Ordering::AcqRel) != DISARMED {
            let _ = self.service.tx.send(Command::Cancel { id: self.id });
        }
    }

    /// True from `start` until the callback fires or the timer is stopped.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire) != DISARMED
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}
