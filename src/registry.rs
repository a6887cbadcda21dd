//! Known physical screens, the active refresh-rate mode and the hand-off of
//! committed modes to the presentation thread.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::screen::{Screen, ScreenInfo};
use crate::types::{ActiveMode, RefreshRateMode, SceneType, ScreenId, Strategy, OLED_60_HZ};

/// Mode strategies and bundle deny-list, already parsed and validated.
#[derive(Debug, Clone, Default)]
pub struct StrategyTable {
    pub strategies: BTreeMap<RefreshRateMode, Strategy>,
    pub bundle_deny_list: HashSet<String>,
}

impl StrategyTable {
    pub fn get(&self, mode: RefreshRateMode) -> Option<Strategy> {
        self.strategies.get(&mode).copied()
    }
}

#[derive(Debug, Default)]
struct PolicyState {
    mode: RefreshRateMode,
    bundle_name: String,
    scenes: HashSet<SceneType>,
    active_screen: Option<ScreenId>,
}

pub struct ScreenRegistry {
    table: StrategyTable,
    screens: Mutex<BTreeMap<ScreenId, Screen>>,
    policy: Mutex<PolicyState>,
    /// Lock order: `screens` before `pending`.
    pending: Mutex<HashMap<ScreenId, ActiveMode>>,
}

impl ScreenRegistry {
    pub fn new(table: StrategyTable, initial_mode: RefreshRateMode) -> Self {
        Self {
            table,
            screens: Mutex::new(BTreeMap::new()),
            policy: Mutex::new(PolicyState {
                mode: initial_mode,
                ..PolicyState::default()
            }),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a screen, replacing any previous screen with the same id.
    pub fn add_screen(&self, id: ScreenId, supported_rates: &[u32], default_mode: usize) -> Result<()> {
        let mut screen = Screen::new(id, supported_rates, default_mode)?;

        if let Some(strategy) = self.table.get(self.current_mode()) {
            screen.set_refresh_rate_range(strategy.min, strategy.max);
        }

        let mut screens = lock(&self.screens);
        if screens.contains_key(&id) {
            log::info!("Screen {} re-added, tearing down previous instance", id);
            lock(&self.pending).remove(&id);
        }
        screens.insert(id, screen);
        log::info!("Added screen {} (screens: {})", id, screens.len());
        Ok(())
    }

    pub fn remove_screen(&self, id: ScreenId) -> Result<()> {
        let mut screens = lock(&self.screens);
        if screens.remove(&id).is_none() {
            return Err(Error::UnknownScreen(id));
        }
        lock(&self.pending).remove(&id);
        drop(screens);

        let mut policy = lock(&self.policy);
        if policy.active_screen == Some(id) {
            policy.active_screen = None;
        }
        log::info!("Removed screen {}", id);
        Ok(())
    }

    /// Add a supported rate to an existing screen (late mode enumeration).
    pub fn add_supported_rate(&self, id: ScreenId, rate: u32) -> Result<()> {
        if rate == 0 {
            return Err(Error::InvalidRate(0));
        }
        let mut screens = lock(&self.screens);
        let screen = screens.get_mut(&id).ok_or(Error::UnknownScreen(id))?;
        screen.add_supported_rate(rate);
        Ok(())
    }

    /// Switch the system mode and push its strategy to every screen.
    ///
    /// Every screen is attempted; the first failure is returned afterwards.
    pub fn set_refresh_rate_mode(&self, mode: RefreshRateMode) -> Result<()> {
        let strategy = self.table.get(mode).ok_or(Error::NoStrategy(mode))?;
        if strategy.min == 0 || strategy.max == 0 {
            log::warn!("Strategy for mode {} has an illegal rate {:?}", mode, strategy);
            return Err(Error::InvalidRate(0));
        }

        lock(&self.policy).mode = mode;

        let rate = if mode == RefreshRateMode::Auto {
            OLED_60_HZ
        } else {
            strategy.max
        };
        log::info!(
            "Switching to mode {} (range {}..={}, target {}Hz)",
            mode,
            strategy.min,
            strategy.max,
            rate
        );

        let mut first_error = None;
        for id in self.screen_ids() {
            if let Some(screen) = lock(&self.screens).get_mut(&id) {
                screen.set_refresh_rate_range(strategy.min, strategy.max);
            }
            if let Err(e) = self.set_screen_refresh_rate(id, rate as i32) {
                log::warn!("Failed to apply mode {} to screen {}: {}", mode, id, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolve `rate` to a mode of screen `id` and queue it for the next
    /// hardware commit.
    pub fn set_screen_refresh_rate(&self, id: ScreenId, rate: i32) -> Result<ActiveMode> {
        if rate <= 0 {
            log::warn!("Refusing illegal refresh rate {} for screen {}", rate, id);
            return Err(Error::InvalidRate(rate));
        }
        let rate = self.request_bundle_permission(rate as u32);

        let mut screens = lock(&self.screens);
        let screen = screens.get_mut(&id).ok_or_else(|| {
            log::warn!("Failed to get screen {}", id);
            Error::UnknownScreen(id)
        })?;

        let mode = screen.set_active_refresh_rate(rate);
        lock(&self.pending).insert(id, mode);
        log::debug!(
            "Rate {}Hz accepted for screen {}, target mode {} ({}Hz)",
            rate,
            id,
            mode.mode_id,
            mode.rate
        );
        Ok(mode)
    }

    /// Drain the modes queued since the last commit.
    pub fn take_pending_modes(&self) -> HashMap<ScreenId, ActiveMode> {
        std::mem::take(&mut *lock(&self.pending))
    }

    /// Track the foreground bundle; re-applies the mode so the deny-list
    /// takes effect.
    pub fn refresh_bundle_name(&self, name: &str) -> Result<()> {
        let mode = {
            let mut policy = lock(&self.policy);
            if policy.bundle_name == name {
                return Ok(());
            }
            policy.bundle_name = name.to_string();
            policy.mode
        };

        if mode == RefreshRateMode::Auto {
            return Ok(());
        }
        self.set_refresh_rate_mode(mode)?;
        log::info!("Re-applied mode {} for bundle {}", mode, name);
        Ok(())
    }

    fn request_bundle_permission(&self, rate: u32) -> u32 {
        if rate <= OLED_60_HZ {
            return rate;
        }
        let policy = lock(&self.policy);
        if policy.mode.is_restrictive() && self.table.bundle_deny_list.contains(&policy.bundle_name) {
            log::debug!("Bundle {} is deny-listed, capping at {}Hz", policy.bundle_name, OLED_60_HZ);
            return OLED_60_HZ;
        }
        rate
    }

    pub fn start_scene(&self, scene: SceneType) {
        lock(&self.policy).scenes.insert(scene);
    }

    pub fn stop_scene(&self, scene: SceneType) {
        lock(&self.policy).scenes.remove(&scene);
    }

    /// Lowest preferred rate among active scenes.
    pub fn scene_preferred_rate(&self) -> Option<u32> {
        lock(&self.policy).scenes.iter().map(|s| s.preferred_rate()).min()
    }

    pub fn set_active_screen(&self, id: ScreenId) {
        lock(&self.policy).active_screen = Some(id);
    }

    pub fn active_screen(&self) -> Option<ScreenInfo> {
        let id = lock(&self.policy).active_screen?;
        self.screen(id)
    }

    pub fn current_mode(&self) -> RefreshRateMode {
        lock(&self.policy).mode
    }

    pub fn bundle_name(&self) -> String {
        lock(&self.policy).bundle_name.clone()
    }

    pub fn strategy(&self, mode: RefreshRateMode) -> Option<Strategy> {
        self.table.get(mode)
    }

    pub fn strategy_table(&self) -> &StrategyTable {
        &self.table
    }

    pub fn screen(&self, id: ScreenId) -> Option<ScreenInfo> {
        lock(&self.screens).get(&id).map(Screen::info)
    }

    pub fn contains_screen(&self, id: ScreenId) -> bool {
        lock(&self.screens).contains_key(&id)
    }

    pub fn screen_ids(&self) -> Vec<ScreenId> {
        lock(&self.screens).keys().copied().collect()
    }

    pub fn current_refresh_rate(&self, id: ScreenId) -> Option<u32> {
        lock(&self.screens).get(&id).map(Screen::active_rate)
    }

    pub fn supported_rates(&self, id: ScreenId) -> Option<Vec<u32>> {
        lock(&self.screens).get(&id).map(|s| s.supported_rates().to_vec())
    }
}

/// Lock a mutex, recovering the data if another thread panicked with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StrategyTable {
        let mut strategies = BTreeMap::new();
        strategies.insert(RefreshRateMode::Auto, Strategy::new(30, 120));
        strategies.insert(RefreshRateMode::Medium, Strategy::new(60, 90));
        strategies.insert(RefreshRateMode::High, Strategy::new(60, 120));
        StrategyTable {
            strategies,
            bundle_deny_list: ["com.example.slow".to_string()].into_iter().collect(),
        }
    }

    fn registry() -> ScreenRegistry {
        let registry = ScreenRegistry::new(table(), RefreshRateMode::Auto);
        registry.add_screen(1, &[30, 60, 90, 120], 1).unwrap();
        registry
    }

    #[test]
    fn test_invalid_rate_for_every_screen() {
        let registry = registry();
        registry.add_screen(2, &[60, 120], 0).unwrap();
        for id in registry.screen_ids() {
            assert_eq!(registry.set_screen_refresh_rate(id, -5), Err(Error::InvalidRate(-5)));
            assert_eq!(registry.set_screen_refresh_rate(id, 0), Err(Error::InvalidRate(0)));
        }
    }

    #[test]
    fn test_unknown_screen() {
        let registry = registry();
        assert_eq!(registry.set_screen_refresh_rate(9, 60), Err(Error::UnknownScreen(9)));
        assert_eq!(registry.remove_screen(9), Err(Error::UnknownScreen(9)));
    }

    #[test]
    fn test_missing_strategy() {
        let registry = registry();
        assert_eq!(
            registry.set_refresh_rate_mode(RefreshRateMode::Low),
            Err(Error::NoStrategy(RefreshRateMode::Low))
        );
        assert_eq!(registry.current_mode(), RefreshRateMode::Auto);
    }

    #[test]
    fn test_mode_fans_out_to_all_screens() {
        let registry = registry();
        registry.add_screen(2, &[60, 90], 0).unwrap();
        registry.set_refresh_rate_mode(RefreshRateMode::High).unwrap();

        let pending = registry.take_pending_modes();
        assert_eq!(pending[&1].rate, 120);
        assert_eq!(pending[&2].rate, 90);
        assert_eq!(registry.screen(1).unwrap().range, (60, 120));
        assert!(registry.take_pending_modes().is_empty());
    }

    #[test]
    fn test_auto_mode_targets_60() {
        let registry = registry();
        registry.set_refresh_rate_mode(RefreshRateMode::Auto).unwrap();
        assert_eq!(registry.current_refresh_rate(1), Some(60));
    }

    #[test]
    fn test_deny_listed_bundle_capped_at_60() {
        let registry = registry();
        registry.set_refresh_rate_mode(RefreshRateMode::High).unwrap();
        assert_eq!(registry.current_refresh_rate(1), Some(120));

        registry.refresh_bundle_name("com.example.slow").unwrap();
        assert_eq!(registry.current_refresh_rate(1), Some(60));

        registry.refresh_bundle_name("com.example.fast").unwrap();
        assert_eq!(registry.current_refresh_rate(1), Some(120));
    }

    #[test]
    fn test_deny_list_ignored_in_auto() {
        let registry = registry();
        registry.refresh_bundle_name("com.example.slow").unwrap();
        let mode = registry.set_screen_refresh_rate(1, 120).unwrap();
        assert_eq!(mode.rate, 120);
    }

    #[test]
    fn test_readd_replaces_screen_and_drops_pending() {
        let registry = registry();
        registry.set_screen_refresh_rate(1, 90).unwrap();
        registry.add_screen(1, &[60], 0).unwrap();
        assert!(registry.take_pending_modes().is_empty());
        assert_eq!(registry.supported_rates(1), Some(vec![60]));
    }

    #[test]
    fn test_remove_clears_active_screen() {
        let registry = registry();
        registry.set_active_screen(1);
        assert_eq!(registry.active_screen().map(|s| s.id), Some(1));
        registry.remove_screen(1).unwrap();
        assert!(registry.active_screen().is_none());
    }

    #[test]
    fn test_scene_preferred_rate() {
        let registry = registry();
        assert_eq!(registry.scene_preferred_rate(), None);
        registry.start_scene(SceneType::ScreenRecord);
        assert_eq!(registry.scene_preferred_rate(), Some(60));
        registry.stop_scene(SceneType::ScreenRecord);
        assert_eq!(registry.scene_preferred_rate(), None);
    }
}
