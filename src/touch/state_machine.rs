//! Per-screen Down/Up/Idle touch interaction state.
//!
//! Lifting the finger starts a one-shot up-timeout; the screen only counts
//! as idle once that timer fires or the idle detector reports the render
//! pipeline went quiet. Each screen owns at most one live timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::Result;
use crate::registry::lock;
use crate::timer::{Timer, TimerService};
use crate::types::ScreenId;

pub const DEFAULT_UP_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TouchState {
    Down,
    Up,
    #[default]
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchEvent {
    Down,
    Up,
    UpTimeout,
    IdleTimeout,
}

impl fmt::Display for TouchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TouchState::Down => write!(f, "down"),
            TouchState::Up => write!(f, "up"),
            TouchState::Idle => write!(f, "idle"),
        }
    }
}

pub type IdleCallback = Box<dyn Fn(ScreenId) + Send + Sync>;

#[derive(Default)]
struct TouchContext {
    state: TouchState,
    timer: Option<Timer>,
    /// Replaced from the timer service whenever the timer is replaced or
    /// canceled; an expiry carrying any other token lost a race with a
    /// cancel and is dropped. Zero until the first transition.
    token: u64,
}

impl TouchContext {
    fn cancel_timer(&mut self, token: u64) {
        self.token = token;
        // Dropping the handle cancels it.
        self.timer = None;
    }
}

pub struct TouchStateMachine {
    timers: TimerService,
    up_timeout: Duration,
    contexts: Mutex<HashMap<ScreenId, TouchContext>>,
    on_idle: IdleCallback,
    this: Weak<TouchStateMachine>,
}

impl TouchStateMachine {
    pub fn new(timers: TimerService, up_timeout: Duration, on_idle: IdleCallback) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            timers,
            up_timeout,
            contexts: Mutex::new(HashMap::new()),
            on_idle,
            this: this.clone(),
        })
    }

    /// Feed one event for `screen` and return the resulting state.
    pub fn handle_event(&self, screen: ScreenId, event: TouchEvent) -> Result<TouchState> {
        self.transition(screen, event, None)
    }

    /// Like [`handle_event`](Self::handle_event), but only if no transition
    /// happened on `screen` since `token` was read with
    /// [`state_and_token`](Self::state_and_token). Otherwise the event is
    /// dropped and the current state returned.
    pub fn handle_event_if_current(
        &self,
        screen: ScreenId,
        event: TouchEvent,
        token: u64,
    ) -> Result<TouchState> {
        self.transition(screen, event, Some(token))
    }

    pub(crate) fn state_and_token(&self, screen: ScreenId) -> (TouchState, u64) {
        lock(&self.contexts)
            .get(&screen)
            .map_or((TouchState::Idle, 0), |ctx| (ctx.state, ctx.token))
    }

    fn transition(
        &self,
        screen: ScreenId,
        event: TouchEvent,
        expected_token: Option<u64>,
    ) -> Result<TouchState> {
        let mut fire_idle = false;

        let state = {
            let mut contexts = lock(&self.contexts);
            let ctx = match expected_token {
                None => contexts.entry(screen).or_default(),
                Some(token) => match contexts.get_mut(&screen) {
                    Some(ctx) if ctx.token == token => ctx,
                    other => {
                        log::debug!("[touch] stale {:?} for screen {}", event, screen);
                        return Ok(other.map_or(TouchState::Idle, |ctx| ctx.state));
                    }
                },
            };
            let from = ctx.state;

            match (from, event) {
                (_, TouchEvent::Down) => {
                    ctx.cancel_timer(self.timers.next_token());
                    ctx.state = TouchState::Down;
                }
                (TouchState::Down, TouchEvent::Up) => {
                    ctx.cancel_timer(self.timers.next_token());
                    let timer = self.up_timer(screen, ctx.token);
                    timer.start()?;
                    ctx.timer = Some(timer);
                    ctx.state = TouchState::Up;
                }
                (TouchState::Up, TouchEvent::UpTimeout | TouchEvent::IdleTimeout) => {
                    ctx.cancel_timer(self.timers.next_token());
                    ctx.state = TouchState::Idle;
                    fire_idle = true;
                }
                (from, event) => {
                    log::debug!("[touch] screen {} ignores {:?} while {}", screen, event, from);
                }
            }

            if from != ctx.state {
                log::debug!("[touch] screen {}: {} -> {} on {:?}", screen, from, ctx.state, event);
            }
            ctx.state
        };

        if fire_idle {
            (self.on_idle)(screen);
        }
        Ok(state)
    }

    fn up_timer(&self, screen: ScreenId, token: u64) -> Timer {
        let this = self.this.clone();
        Timer::new(
            &self.timers,
            format!("up_timeout_{}", screen),
            self.up_timeout,
            None,
            move || {
                if let Some(machine) = this.upgrade() {
                    machine.on_up_timeout(screen, token);
                }
            },
        )
    }

    fn on_up_timeout(&self, screen: ScreenId, token: u64) {
        if let Err(e) = self.handle_event_if_current(screen, TouchEvent::UpTimeout, token) {
            log::warn!("[touch] up-timeout for screen {} failed: {}", screen, e);
        }
    }

    pub fn state(&self, screen: ScreenId) -> TouchState {
        lock(&self.contexts)
            .get(&screen)
            .map(|ctx| ctx.state)
            .unwrap_or_default()
    }

    /// Number of armed timers held for `screen` (0 or 1).
    pub fn live_timer_count(&self, screen: ScreenId) -> usize {
        lock(&self.contexts)
            .get(&screen)
            .and_then(|ctx| ctx.timer.as_ref())
            .map_or(0, |t| usize::from(t.is_armed()))
    }

    /// Forget `screen`, canceling its timer.
    pub fn remove_screen(&self, screen: ScreenId) {
        lock(&self.contexts).remove(&screen);
    }
}
