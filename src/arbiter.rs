//! Composition root: owns every component and turns their signals into one
//! committed refresh rate per screen.
//!
//! Per screen, the requested range is clamped by the animation idle policy,
//! boosted while a finger is on (or just left) the screen, overridden by an
//! active video vote, capped by active scenes and finally bounded by the
//! current mode's strategy before being committed through the registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::error::{Error, Result};
use crate::power::{animation_channel, AnimationEvent, AnimationIdlePowerPolicy, AnimationSender, PowerConfig};
use crate::registry::{lock, ScreenRegistry, StrategyTable};
use crate::timer::TimerService;
use crate::touch::{
    FrameRefreshDetector, IdleCallback, TouchEvent, TouchManager, TouchState, TouchStateMachine,
    DEFAULT_FRAME_ACTIVE_THRESHOLD, DEFAULT_IDLE_TIMEOUT, DEFAULT_RS_IDLE_CNT, DEFAULT_UP_TIMEOUT,
};
use crate::types::{
    ActiveMode, FrameRateRange, Pid, RefreshRateMode, ScreenId, ScreenSpec, Strategy, SurfaceId,
};
use crate::video::{NotificationSink, VideoRateVoteAggregator};

/// Everything the engine needs from the config provider.
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    pub table: StrategyTable,
    pub initial_mode: RefreshRateMode,
    pub power: PowerConfig,
    pub up_timeout: Duration,
    pub idle_timeout: Duration,
    pub rs_idle_cnt: u32,
    pub frame_active_threshold: Duration,
    pub touch_boost: bool,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            table: default_strategy_table(),
            initial_mode: RefreshRateMode::Auto,
            power: PowerConfig::default(),
            up_timeout: DEFAULT_UP_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            rs_idle_cnt: DEFAULT_RS_IDLE_CNT,
            frame_active_threshold: DEFAULT_FRAME_ACTIVE_THRESHOLD,
            touch_boost: true,
        }
    }
}

pub fn default_strategy_table() -> StrategyTable {
    let strategies: BTreeMap<RefreshRateMode, Strategy> = [
        (RefreshRateMode::Auto, Strategy::new(30, 120)),
        (RefreshRateMode::Low, Strategy::new(30, 60)),
        (RefreshRateMode::Medium, Strategy::new(60, 90)),
        (RefreshRateMode::High, Strategy::new(60, 120)),
    ]
    .into_iter()
    .collect();

    StrategyTable {
        strategies,
        bundle_deny_list: HashSet::new(),
    }
}

pub struct FrameRateArbiter {
    registry: ScreenRegistry,
    touch: Arc<TouchManager>,
    video: VideoRateVoteAggregator,
    power: AnimationIdlePowerPolicy,
    animation_tx: AnimationSender,
    animation_rx: Receiver<AnimationEvent>,
    touch_boost: bool,
    last_requested: Mutex<HashMap<ScreenId, FrameRateRange>>,
}

impl FrameRateArbiter {
    /// Build the engine. Touch going idle re-arbitrates that screen through
    /// a weak self-reference, so the arbiter is handed out behind an `Arc`.
    pub fn new(
        config: ArbiterConfig,
        sink: Arc<dyn NotificationSink>,
        on_idle: Option<IdleCallback>,
    ) -> Result<Arc<Self>> {
        let timers = TimerService::spawn("hz-timer")
            .map_err(|e| Error::TimerStartFailed(format!("timer thread: {}", e)))?;

        Ok(Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            // Runs after the machine released its lock.
            let on_idle: IdleCallback = Box::new(move |screen| {
                log::debug!("[touch] screen {} idle", screen);
                if let Some(arbiter) = this.upgrade() {
                    arbiter.on_touch_idle(screen);
                }
                if let Some(callback) = &on_idle {
                    callback(screen);
                }
            });
            let machine = TouchStateMachine::new(timers.clone(), config.up_timeout, on_idle);
            let detector = Arc::new(FrameRefreshDetector::new(config.frame_active_threshold));
            let touch =
                TouchManager::new(machine, detector, timers, config.idle_timeout, config.rs_idle_cnt);

            let (animation_tx, animation_rx) = animation_channel();

            Self {
                registry: ScreenRegistry::new(config.table, config.initial_mode),
                touch,
                video: VideoRateVoteAggregator::new(sink),
                power: AnimationIdlePowerPolicy::new(config.power),
                animation_tx,
                animation_rx,
                touch_boost: config.touch_boost,
                last_requested: Mutex::new(HashMap::new()),
            }
        }))
    }

    /// Hotplug-add. A screen re-added under a known id starts from scratch.
    pub fn add_screen(&self, id: ScreenId, rates: &[u32], default_mode: usize) -> Result<()> {
        self.forget_screen_state(id);
        self.registry.add_screen(id, rates, default_mode)
    }

    /// Register a batch of screens; an id listed twice rejects the batch.
    pub fn add_screens(&self, screens: &[ScreenSpec]) -> Result<()> {
        let mut seen = HashSet::new();
        if let Some(dup) = screens.iter().find(|s| !seen.insert(s.id)) {
            return Err(Error::DuplicateScreen(dup.id));
        }
        for spec in screens {
            self.add_screen(spec.id, &spec.rates, spec.default_mode)?;
        }
        Ok(())
    }

    /// Hotplug-remove: cancels the screen's timers and erases its state.
    pub fn remove_screen(&self, id: ScreenId) -> Result<()> {
        self.registry.remove_screen(id)?;
        self.forget_screen_state(id);
        Ok(())
    }

    fn forget_screen_state(&self, id: ScreenId) {
        self.touch.machine().remove_screen(id);
        self.touch.remove_screen(id);
        lock(&self.last_requested).remove(&id);
    }

    pub fn handle_touch(&self, screen: ScreenId, event: TouchEvent) -> Result<TouchState> {
        if !self.registry.contains_screen(screen) {
            return Err(Error::UnknownScreen(screen));
        }
        self.touch.machine().handle_event(screen, event)
    }

    /// The touch boost no longer applies; commit the screen's rate again
    /// from its last request without waiting for a frame.
    fn on_touch_idle(&self, screen: ScreenId) {
        if !self.registry.contains_screen(screen) {
            return;
        }
        let requested = lock(&self.last_requested)
            .get(&screen)
            .copied()
            .unwrap_or_default();
        self.arbitrate_screen(screen, requested);
    }

    /// Record a video vote; a new winner is applied to every screen at once.
    pub fn on_video_vote(&self, surface: SurfaceId, pid: Pid, rate: u32) -> bool {
        let changed = self.video.vote(surface, pid, rate);
        if changed {
            self.rearbitrate();
        }
        changed
    }

    pub fn release_video_surface(&self, surface: SurfaceId) -> bool {
        let changed = self.video.release_surface(surface);
        if changed {
            self.rearbitrate();
        }
        changed
    }

    pub fn animation_sender(&self) -> AnimationSender {
        self.animation_tx.clone()
    }

    pub fn set_refresh_rate_mode(&self, mode: RefreshRateMode) -> Result<()> {
        self.registry.set_refresh_rate_mode(mode)
    }

    pub fn refresh_bundle_name(&self, name: &str) -> Result<()> {
        self.registry.refresh_bundle_name(name)
    }

    /// One composited frame: feed the idle detector, drain animation events
    /// and arbitrate every screen against `requested`.
    pub fn on_frame(&self, requested: FrameRateRange) {
        for id in self.registry.screen_ids() {
            if let Err(e) = self.touch.on_frame(id) {
                log::warn!("[idle] screen {}: {}", id, e);
            }
        }
        self.settle(requested);
    }

    /// Arbitrate every screen against `requested` without counting a frame.
    pub fn settle(&self, requested: FrameRateRange) {
        self.pump_animation_events();
        for id in self.registry.screen_ids() {
            self.arbitrate_screen(id, requested);
        }
    }

    fn pump_animation_events(&self) {
        for event in self.animation_rx.try_iter() {
            self.power.apply(event);
        }
    }

    fn rearbitrate(&self) {
        let requested = lock(&self.last_requested).clone();
        for id in self.registry.screen_ids() {
            let range = requested.get(&id).copied().unwrap_or_default();
            self.arbitrate_screen(id, range);
        }
    }

    /// Decide and commit one screen. Failures leave the previous rate in
    /// place.
    pub fn arbitrate_screen(&self, id: ScreenId, requested: FrameRateRange) -> Option<ActiveMode> {
        if !self.registry.contains_screen(id) {
            log::warn!("Not arbitrating unknown screen {}", id);
            return None;
        }
        lock(&self.last_requested).insert(id, requested);

        let result = self
            .resolve_target(id, requested)
            .and_then(|rate| self.registry.set_screen_refresh_rate(id, rate as i32));

        match result {
            Ok(mode) => Some(mode),
            Err(e) => {
                log::warn!("Keeping current rate of screen {}: {}", id, e);
                None
            }
        }
    }

    /// The rate screen `id` should run at, before mode resolution.
    pub fn resolve_target(&self, id: ScreenId, requested: FrameRateRange) -> Result<u32> {
        let mode = self.registry.current_mode();
        let strategy = self.registry.strategy(mode).ok_or(Error::NoStrategy(mode))?;

        // Nothing animating: settle at the bottom of the mode.
        let mut range = if requested.is_empty() {
            FrameRateRange::exact(strategy.min)
        } else {
            requested
        };
        self.power.clamp(&mut range);

        let mut target = range.target();

        if self.touch_boost
            && matches!(self.touch.machine().state(id), TouchState::Down | TouchState::Up)
        {
            target = strategy.max;
        }

        if let Some(vote) = self.video.active_vote() {
            target = vote.rate;
        }

        if let Some(cap) = self.registry.scene_preferred_rate() {
            target = target.min(cap);
        }

        Ok(strategy.clamp(target))
    }

    pub fn take_pending_modes(&self) -> HashMap<ScreenId, ActiveMode> {
        self.registry.take_pending_modes()
    }

    /// True while the render pipeline produced a frame recently.
    pub fn is_pipeline_active(&self) -> bool {
        self.touch.detector().is_active()
    }

    pub fn registry(&self) -> &ScreenRegistry {
        &self.registry
    }

    pub fn touch_machine(&self) -> &Arc<TouchStateMachine> {
        self.touch.machine()
    }

    pub fn touch_manager(&self) -> &Arc<TouchManager> {
        &self.touch
    }

    pub fn video(&self) -> &VideoRateVoteAggregator {
        &self.video
    }

    pub fn power(&self) -> &AnimationIdlePowerPolicy {
        &self.power
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SceneType;
    use crate::video::EventInfo;

    fn arbiter(config: ArbiterConfig) -> Arc<FrameRateArbiter> {
        let sink = Arc::new(|_: Pid, _: EventInfo| {});
        let arbiter = FrameRateArbiter::new(config, sink, None).unwrap();
        arbiter.add_screen(0, &[30, 60, 90, 120], 1).unwrap();
        arbiter
    }

    fn high_arbiter() -> Arc<FrameRateArbiter> {
        let arbiter = arbiter(ArbiterConfig::default());
        arbiter.set_refresh_rate_mode(RefreshRateMode::High).unwrap();
        arbiter.take_pending_modes();
        arbiter
    }

    #[test]
    fn test_request_bounded_by_mode() {
        let arbiter = high_arbiter();
        let mode = arbiter.arbitrate_screen(0, FrameRateRange::new(0, 144, 144)).unwrap();
        assert_eq!(mode.rate, 120);
        let mode = arbiter.arbitrate_screen(0, FrameRateRange::new(0, 30, 30)).unwrap();
        assert_eq!(mode.rate, 60);
    }

    #[test]
    fn test_empty_request_settles_at_mode_min() {
        let arbiter = high_arbiter();
        let mode = arbiter.arbitrate_screen(0, FrameRateRange::default()).unwrap();
        assert_eq!(mode.rate, 60);
    }

    #[test]
    fn test_video_vote_overrides_request() {
        let arbiter = high_arbiter();
        arbiter.arbitrate_screen(0, FrameRateRange::exact(120));
        assert!(arbiter.on_video_vote(1, 100, 90));
        assert_eq!(arbiter.registry().current_refresh_rate(0), Some(90));

        assert!(arbiter.on_video_vote(1, 100, 0));
        assert_eq!(arbiter.registry().current_refresh_rate(0), Some(120));
    }

    #[test]
    fn test_video_vote_beats_idle_clamp() {
        let arbiter = arbiter(ArbiterConfig {
            power: PowerConfig {
                enabled: true,
                ..PowerConfig::default()
            },
            ..ArbiterConfig::default()
        });
        arbiter.set_refresh_rate_mode(RefreshRateMode::High).unwrap();
        arbiter.power().set_idle(true);
        let first = arbiter.power().state().first_animation_timestamp;
        arbiter.power().record_animation_tick(first + 5000);

        assert_eq!(arbiter.resolve_target(0, FrameRateRange::exact(120)).unwrap(), 60);
        arbiter.on_video_vote(1, 100, 90);
        assert_eq!(arbiter.resolve_target(0, FrameRateRange::exact(120)).unwrap(), 90);
    }

    #[test]
    fn test_touch_boost_while_down() {
        let arbiter = high_arbiter();
        arbiter.handle_touch(0, TouchEvent::Down).unwrap();
        assert_eq!(arbiter.resolve_target(0, FrameRateRange::default()).unwrap(), 120);
        arbiter.handle_touch(0, TouchEvent::Up).unwrap();
        arbiter.handle_touch(0, TouchEvent::IdleTimeout).unwrap();
        assert_eq!(arbiter.resolve_target(0, FrameRateRange::default()).unwrap(), 60);
    }

    #[test]
    fn test_touch_boost_disabled() {
        let arbiter = arbiter(ArbiterConfig {
            touch_boost: false,
            ..ArbiterConfig::default()
        });
        arbiter.set_refresh_rate_mode(RefreshRateMode::High).unwrap();
        arbiter.handle_touch(0, TouchEvent::Down).unwrap();
        assert_eq!(arbiter.resolve_target(0, FrameRateRange::default()).unwrap(), 60);
    }

    #[test]
    fn test_screen_record_caps_rate() {
        let arbiter = high_arbiter();
        arbiter.registry().start_scene(SceneType::ScreenRecord);
        arbiter.on_video_vote(1, 100, 120);
        assert_eq!(arbiter.resolve_target(0, FrameRateRange::exact(120)).unwrap(), 60);
    }

    #[test]
    fn test_failure_keeps_previous_rate() {
        let mut config = ArbiterConfig::default();
        config.table.strategies.remove(&RefreshRateMode::Auto);
        let arbiter = arbiter(config);
        assert!(arbiter.arbitrate_screen(0, FrameRateRange::exact(120)).is_none());
        assert_eq!(arbiter.registry().current_refresh_rate(0), Some(60));
        assert!(arbiter.take_pending_modes().is_empty());
    }

    #[test]
    fn test_touch_idle_drops_boost_without_frame() {
        let arbiter = high_arbiter();
        arbiter.handle_touch(0, TouchEvent::Down).unwrap();
        assert_eq!(arbiter.arbitrate_screen(0, FrameRateRange::default()).unwrap().rate, 120);

        arbiter.handle_touch(0, TouchEvent::Up).unwrap();
        arbiter.handle_touch(0, TouchEvent::IdleTimeout).unwrap();
        assert_eq!(arbiter.touch_machine().state(0), TouchState::Idle);
        assert_eq!(arbiter.registry().current_refresh_rate(0), Some(60));
        assert_eq!(arbiter.take_pending_modes()[&0].rate, 60);
    }

    #[test]
    fn test_touch_idle_keeps_last_request() {
        let arbiter = high_arbiter();
        arbiter.handle_touch(0, TouchEvent::Down).unwrap();
        arbiter.arbitrate_screen(0, FrameRateRange::exact(90));
        assert_eq!(arbiter.registry().current_refresh_rate(0), Some(120));

        arbiter.handle_touch(0, TouchEvent::Up).unwrap();
        arbiter.handle_touch(0, TouchEvent::IdleTimeout).unwrap();
        assert_eq!(arbiter.registry().current_refresh_rate(0), Some(90));
    }

    #[test]
    fn test_unknown_screen_leaves_no_state() {
        let arbiter = high_arbiter();
        assert_eq!(arbiter.handle_touch(9, TouchEvent::Down), Err(Error::UnknownScreen(9)));
        assert_eq!(arbiter.handle_touch(9, TouchEvent::Up), Err(Error::UnknownScreen(9)));
        assert_eq!(arbiter.touch_machine().state_and_token(9), (TouchState::Idle, 0));
        assert!(arbiter.arbitrate_screen(9, FrameRateRange::exact(120)).is_none());
        assert!(!lock(&arbiter.last_requested).contains_key(&9));
    }

    #[test]
    fn test_settle_does_not_count_a_frame() {
        let arbiter = high_arbiter();
        arbiter.settle(FrameRateRange::default());
        assert!(!arbiter.is_pipeline_active());
        assert_eq!(arbiter.registry().current_refresh_rate(0), Some(60));
    }

    #[test]
    fn test_duplicate_batch_rejected() {
        let arbiter = arbiter(ArbiterConfig::default());
        let spec = |id| ScreenSpec {
            id,
            rates: vec![60],
            default_mode: 0,
        };
        assert_eq!(
            arbiter.add_screens(&[spec(1), spec(2), spec(1)]),
            Err(Error::DuplicateScreen(1))
        );
        assert!(arbiter.registry().screen(2).is_none());
    }

    #[test]
    fn test_remove_screen_clears_touch_state() {
        let arbiter = high_arbiter();
        arbiter.handle_touch(0, TouchEvent::Down).unwrap();
        arbiter.handle_touch(0, TouchEvent::Up).unwrap();
        arbiter.remove_screen(0).unwrap();
        assert_eq!(arbiter.touch_machine().state(0), TouchState::Idle);
        assert_eq!(arbiter.touch_machine().live_timer_count(0), 0);
        assert_eq!(arbiter.remove_screen(0), Err(Error::UnknownScreen(0)));
    }

    #[test]
    fn test_animation_events_applied_on_frame() {
        let arbiter = arbiter(ArbiterConfig {
            power: PowerConfig {
                enabled: true,
                ..PowerConfig::default()
            },
            ..ArbiterConfig::default()
        });
        let tx = arbiter.animation_sender();
        tx.send(AnimationEvent::Idle(true));
        arbiter.on_frame(FrameRateRange::exact(120));
        assert!(arbiter.power().state().is_idle);
        assert!(arbiter.is_pipeline_active());
    }
}
