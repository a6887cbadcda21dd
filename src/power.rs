//! Animation idle power policy.
//!
//! Once the system reports animations as idle and one has kept running past
//! the grace window, its requested frame rate is clamped to a low idle rate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::registry::lock;
use crate::types::FrameRateRange;

pub const DEFAULT_IDLE_FPS: u32 = 60;
pub const DEFAULT_IDLE_DURATION_MS: u64 = 2000;

pub const KEY_POWER_ENABLE: &str = "animation_ltpo_power_enable";
pub const KEY_IDLE_FPS: &str = "animation_idle_fps";
pub const KEY_IDLE_DURATION: &str = "animation_idle_duration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerConfig {
    pub enabled: bool,
    pub idle_fps: u32,
    pub idle_duration_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_fps: DEFAULT_IDLE_FPS,
            idle_duration_ms: DEFAULT_IDLE_DURATION_MS,
        }
    }
}

/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdlePolicyState {
    pub is_idle: bool,
    pub first_animation_timestamp: u64,
    pub last_animation_timestamp: u64,
}

#[derive(Default)]
struct Inner {
    config: PowerConfig,
    state: IdlePolicyState,
}

pub struct AnimationIdlePowerPolicy {
    inner: Mutex<Inner>,
}

impl AnimationIdlePowerPolicy {
    pub fn new(config: PowerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                state: IdlePolicyState::default(),
            }),
        }
    }

    /// Apply string-keyed settings. Unparseable values keep the current one.
    pub fn set_config(&self, settings: &HashMap<String, String>) {
        let mut inner = lock(&self.inner);
        let config = &mut inner.config;

        if let Some(value) = settings.get(KEY_POWER_ENABLE) {
            config.enabled = value == "true";
        }
        if let Some(value) = settings.get(KEY_IDLE_FPS) {
            match value.parse() {
                Ok(fps) => config.idle_fps = fps,
                Err(_) => log::warn!("[power] ignoring {}={}", KEY_IDLE_FPS, value),
            }
        }
        if let Some(value) = settings.get(KEY_IDLE_DURATION) {
            match value.parse() {
                Ok(ms) => config.idle_duration_ms = ms,
                Err(_) => log::warn!("[power] ignoring {}={}", KEY_IDLE_DURATION, value),
            }
        }
        log::info!("[power] config {:?}", config);
    }

    pub fn config(&self) -> PowerConfig {
        lock(&self.inner).config
    }

    pub fn set_idle(&self, is_idle: bool) {
        let mut inner = lock(&self.inner);
        if !inner.config.enabled || inner.state.is_idle == is_idle {
            return;
        }

        inner.state = if is_idle {
            let now = now_ms();
            IdlePolicyState {
                is_idle: true,
                first_animation_timestamp: now,
                last_animation_timestamp: now,
            }
        } else {
            IdlePolicyState::default()
        };
        log::debug!("[power] idle -> {}", is_idle);
    }

    /// A cold-started animation restarts the grace window.
    pub fn on_new_animation_started(&self) {
        let mut inner = lock(&self.inner);
        if !inner.state.is_idle {
            return;
        }
        let now = now_ms();
        inner.state.first_animation_timestamp = now;
        inner.state.last_animation_timestamp = now;
    }

    pub fn record_animation_tick(&self, timestamp: u64) {
        let mut inner = lock(&self.inner);
        if !inner.state.is_idle {
            return;
        }
        inner.state.last_animation_timestamp = timestamp;
    }

    pub fn clamp(&self, range: &mut FrameRateRange) {
        let inner = lock(&self.inner);
        if !inner.config.enabled || !inner.state.is_idle {
            return;
        }
        let running = inner
            .state
            .last_animation_timestamp
            .saturating_sub(inner.state.first_animation_timestamp);
        if running < inner.config.idle_duration_ms {
            return;
        }

        let idle_fps = inner.config.idle_fps;
        range.min = range.min.min(idle_fps);
        range.max = range.max.min(idle_fps);
        range.preferred = range.preferred.min(idle_fps);
    }

    pub fn state(&self) -> IdlePolicyState {
        lock(&self.inner).state
    }

    pub fn apply(&self, event: AnimationEvent) {
        match event {
            AnimationEvent::Started => self.on_new_animation_started(),
            AnimationEvent::Tick(timestamp) => self.record_animation_tick(timestamp),
            AnimationEvent::Idle(is_idle) => self.set_idle(is_idle),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Animation activity reported by producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationEvent {
    Started,
    Tick(u64),
    Idle(bool),
}

/// Producer side of the animation event channel.
#[derive(Clone)]
pub struct AnimationSender {
    tx: Sender<AnimationEvent>,
}

impl AnimationSender {
    /// Returns false once the receiving side is gone.
    pub fn send(&self, event: AnimationEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

pub fn animation_channel() -> (AnimationSender, Receiver<AnimationEvent>) {
    let (tx, rx) = unbounded();
    (AnimationSender { tx }, rx)
}
