//! Render-pipeline idle detection layered on top of the touch state machine.
//!
//! While a screen's touch state is `Up`, a short "no frame produced" window
//! runs. Each time the window lapses a retry is spent; once the retries are
//! gone the pipeline is considered idle and `IdleTimeout` is driven into the
//! state machine, well before the long up-timeout would fire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::registry::lock;
use crate::timer::{Timer, TimerService};
use crate::types::ScreenId;

use super::state_machine::{TouchEvent, TouchState, TouchStateMachine};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(200);
pub const DEFAULT_RS_IDLE_CNT: u32 = 3;
pub const DEFAULT_FRAME_ACTIVE_THRESHOLD: Duration = Duration::from_millis(1000);

const NO_FRAME: u64 = u64::MAX;

/// Timestamp of the most recent composited frame.
pub struct FrameRefreshDetector {
    epoch: Instant,
    /// Nanoseconds since `epoch`, or `NO_FRAME`.
    last_frame: AtomicU64,
    threshold: Duration,
}

impl FrameRefreshDetector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_frame: AtomicU64::new(NO_FRAME),
            threshold,
        }
    }

    pub fn record_frame(&self) {
        let nanos = self.epoch.elapsed().as_nanos().min(u128::from(NO_FRAME - 1)) as u64;
        self.last_frame.store(nanos, Ordering::Release);
    }

    pub fn since_last_frame(&self) -> Option<Duration> {
        match self.last_frame.load(Ordering::Acquire) {
            NO_FRAME => None,
            nanos => Some(self.epoch.elapsed().saturating_sub(Duration::from_nanos(nanos))),
        }
    }

    /// True iff a frame was produced within the threshold.
    pub fn is_active(&self) -> bool {
        self.since_last_frame().is_some_and(|d| d < self.threshold)
    }
}

impl Default for FrameRefreshDetector {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_ACTIVE_THRESHOLD)
    }
}

#[derive(Default)]
struct IdleWindow {
    timer: Option<Timer>,
    expired: bool,
    retries_left: u32,
    token: u64,
}

impl IdleWindow {
    fn stop(&mut self, token: u64) {
        self.token = token;
        self.timer = None;
        self.expired = false;
    }
}

enum Action {
    None,
    /// Carries the machine token the decision was based on.
    DriveIdle(u64),
}

pub struct TouchManager {
    machine: Arc<TouchStateMachine>,
    detector: Arc<FrameRefreshDetector>,
    timers: TimerService,
    idle_timeout: Duration,
    rs_idle_cnt: u32,
    windows: Mutex<HashMap<ScreenId, IdleWindow>>,
    this: Weak<TouchManager>,
}

impl TouchManager {
    pub fn new(
        machine: Arc<TouchStateMachine>,
        detector: Arc<FrameRefreshDetector>,
        timers: TimerService,
        idle_timeout: Duration,
        rs_idle_cnt: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            machine,
            detector,
            timers,
            idle_timeout,
            rs_idle_cnt,
            windows: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn machine(&self) -> &Arc<TouchStateMachine> {
        &self.machine
    }

    pub fn detector(&self) -> &Arc<FrameRefreshDetector> {
        &self.detector
    }

    /// A frame was composited for `screen`.
    pub fn on_frame(&self, screen: ScreenId) -> Result<()> {
        self.detector.record_frame();
        self.handle_frame_update(screen, false)
    }

    /// Advance the idle window of `screen`, either because a frame arrived
    /// or because the window lapsed (`idle_timer_expired`).
    pub fn handle_frame_update(&self, screen: ScreenId, idle_timer_expired: bool) -> Result<()> {
        self.advance(screen, idle_timer_expired, None)
    }

    fn advance(&self, screen: ScreenId, idle_timer_expired: bool, window_token: Option<u64>) -> Result<()> {
        // Read before taking our own lock; the machine is never called with
        // `windows` held.
        let (touch_state, machine_token) = self.machine.state_and_token(screen);

        let action = {
            let mut windows = lock(&self.windows);
            let window = match window_token {
                None => windows.entry(screen).or_default(),
                Some(token) => match windows.get_mut(&screen) {
                    Some(window) if window.token == token => window,
                    _ => {
                        log::debug!("[idle] stale window expiry for screen {}", screen);
                        return Ok(());
                    }
                },
            };
            if idle_timer_expired {
                window.expired = true;
            }

            if touch_state != TouchState::Up {
                window.stop(self.timers.next_token());
                Action::None
            } else if window.expired && window.retries_left > 0 {
                window.retries_left -= 1;
                window.expired = false;
                log::debug!(
                    "[idle] screen {} window lapsed, {} retries left",
                    screen,
                    window.retries_left
                );
                self.restart(screen, window)?;
                Action::None
            } else if window.expired {
                window.stop(self.timers.next_token());
                Action::DriveIdle(machine_token)
            } else if window.timer.as_ref().is_some_and(Timer::is_armed) {
                // A frame inside the window pushes it out.
                self.restart(screen, window)?;
                Action::None
            } else {
                window.retries_left = self.rs_idle_cnt;
                self.restart(screen, window)?;
                Action::None
            }
        };

        if let Action::DriveIdle(token) = action {
            log::debug!("[idle] screen {} render pipeline idle", screen);
            // Dropped by the machine if the finger came back meanwhile.
            self.machine
                .handle_event_if_current(screen, TouchEvent::IdleTimeout, token)?;
        }
        Ok(())
    }

    fn restart(&self, screen: ScreenId, window: &mut IdleWindow) -> Result<()> {
        window.token = self.timers.next_token();
        let token = window.token;
        let this = self.this.clone();
        let timer = Timer::new(
            &self.timers,
            format!("rs_idle_{}", screen),
            self.idle_timeout,
            None,
            move || {
                if let Some(manager) = this.upgrade() {
                    manager.on_window_lapsed(screen, token);
                }
            },
        );
        timer.start()?;
        window.timer = Some(timer);
        Ok(())
    }

    fn on_window_lapsed(&self, screen: ScreenId, token: u64) {
        if let Err(e) = self.advance(screen, true, Some(token)) {
            log::warn!("[idle] screen {}: {}", screen, e);
        }
    }

    #[cfg(test)]
    fn window_token(&self, screen: ScreenId) -> Option<u64> {
        lock(&self.windows).get(&screen).map(|w| w.token)
    }

    pub fn live_timer_count(&self, screen: ScreenId) -> usize {
        lock(&self.windows)
            .get(&screen)
            .and_then(|w| w.timer.as_ref())
            .map_or(0, |t| usize::from(t.is_armed()))
    }

    pub fn remove_screen(&self, screen: ScreenId) {
        lock(&self.windows).remove(&screen);
    }
}
