mod cli;
mod file;

pub use cli::{Cli, Command};
pub use file::{load_from_path, parse, FileConfig};

use std::collections::BTreeMap;
use std::time::Duration;

use crate::arbiter::{default_strategy_table, ArbiterConfig};
use crate::power::{PowerConfig, DEFAULT_IDLE_DURATION_MS, DEFAULT_IDLE_FPS};
use crate::registry::StrategyTable;
use crate::touch::{
    DEFAULT_FRAME_ACTIVE_THRESHOLD, DEFAULT_IDLE_TIMEOUT, DEFAULT_RS_IDLE_CNT, DEFAULT_UP_TIMEOUT,
};
use crate::types::{RefreshRateMode, ScreenSpec, Strategy};

/// Merged configuration from CLI args and TOML file.
#[derive(Debug, Clone)]
pub struct Config {
    pub default_mode: RefreshRateMode,
    pub bundle: Option<String>,
    pub strategies: BTreeMap<RefreshRateMode, Strategy>,
    pub bundle_deny_list: Vec<String>,
    pub touch_boost: bool,
    pub power: PowerConfig,
    pub up_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub rs_idle_cnt: u32,
    pub frame_active_threshold_ms: u64,
    pub screens: Vec<ScreenSpec>,
}

impl Config {
    /// Load configuration by merging TOML file with CLI overrides.
    pub fn load(cli: &Cli) -> Self {
        let file_config = cli
            .config
            .as_ref()
            .and_then(|p| file::load_from_path(p))
            .or_else(file::load_from_default_paths)
            .unwrap_or_default();

        Self::merge(cli, file_config)
    }

    pub fn merge(cli: &Cli, file_config: FileConfig) -> Self {
        let power_section = file_config.animation_power;
        let touch_section = file_config.touch;

        Self {
            default_mode: cli.mode.or(file_config.default_mode).unwrap_or_default(),
            bundle: cli.bundle.clone().or(file_config.bundle),
            strategies: file_config
                .strategies
                .unwrap_or_else(|| default_strategy_table().strategies),
            bundle_deny_list: file_config.bundle_deny_list,
            touch_boost: !cli.no_touch_boost && file_config.touch_boost.unwrap_or(true),
            power: PowerConfig {
                enabled: if cli.no_animation_power {
                    false
                } else {
                    cli.animation_power || power_section.enabled.unwrap_or(false)
                },
                idle_fps: power_section.idle_fps.unwrap_or(DEFAULT_IDLE_FPS),
                idle_duration_ms: power_section
                    .idle_duration_ms
                    .unwrap_or(DEFAULT_IDLE_DURATION_MS),
            },
            up_timeout_ms: cli
                .up_timeout_ms
                .or(touch_section.up_timeout_ms)
                .unwrap_or(DEFAULT_UP_TIMEOUT.as_millis() as u64),
            idle_timeout_ms: touch_section
                .idle_timeout_ms
                .unwrap_or(DEFAULT_IDLE_TIMEOUT.as_millis() as u64),
            rs_idle_cnt: touch_section.rs_idle_cnt.unwrap_or(DEFAULT_RS_IDLE_CNT),
            frame_active_threshold_ms: touch_section
                .frame_active_threshold_ms
                .unwrap_or(DEFAULT_FRAME_ACTIVE_THRESHOLD.as_millis() as u64),
            screens: if file_config.screens.is_empty() {
                vec![default_screen()]
            } else {
                file_config.screens
            },
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.strategies.contains_key(&self.default_mode) {
            return Err(format!("No strategy configured for default mode '{}'", self.default_mode));
        }
        for (mode, strategy) in &self.strategies {
            if strategy.min == 0 || strategy.min > strategy.max {
                return Err(format!(
                    "Strategy '{}' must satisfy 0 < min <= max (got {}..{})",
                    mode, strategy.min, strategy.max
                ));
            }
        }
        for screen in &self.screens {
            if !screen.rates.iter().any(|&r| r > 0) {
                return Err(format!("Screen {} lists no usable refresh rate", screen.id));
            }
        }
        if self.up_timeout_ms == 0 || self.idle_timeout_ms == 0 {
            return Err("Touch timeouts must be greater than zero".into());
        }
        if self.power.idle_fps == 0 {
            return Err("animation_power.idle_fps must be greater than zero".into());
        }
        Ok(())
    }

    pub fn strategy_table(&self) -> StrategyTable {
        StrategyTable {
            strategies: self.strategies.clone(),
            bundle_deny_list: self.bundle_deny_list.iter().cloned().collect(),
        }
    }

    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig {
            table: self.strategy_table(),
            initial_mode: self.default_mode,
            power: self.power,
            up_timeout: Duration::from_millis(self.up_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            rs_idle_cnt: self.rs_idle_cnt,
            frame_active_threshold: Duration::from_millis(self.frame_active_threshold_ms),
            touch_boost: self.touch_boost,
        }
    }
}

fn default_screen() -> ScreenSpec {
    ScreenSpec {
        id: 0,
        rates: vec![30, 60, 90, 120],
        default_mode: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("hz-arbiter").chain(args.iter().copied()))
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::merge(&cli(&[]), FileConfig::default());
        assert_eq!(config.default_mode, RefreshRateMode::Auto);
        assert_eq!(config.strategies.len(), 4);
        assert_eq!(config.up_timeout_ms, 3000);
        assert_eq!(config.idle_timeout_ms, 200);
        assert_eq!(config.rs_idle_cnt, 3);
        assert!(config.touch_boost);
        assert!(!config.power.enabled);
        assert_eq!(config.screens, vec![default_screen()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = parse(
            r#"
            default_mode = "low"
            [animation_power]
            enabled = true
            "#,
        )
        .unwrap();
        let config = Config::merge(
            &cli(&["--mode", "high", "--no-animation-power", "--up-timeout-ms", "1500"]),
            file,
        );
        assert_eq!(config.default_mode, RefreshRateMode::High);
        assert!(!config.power.enabled);
        assert_eq!(config.up_timeout_ms, 1500);
    }

    #[test]
    fn test_validate_rejects_missing_default_strategy() {
        let file = parse(
            r#"
            default_mode = "medium"
            [strategies.high]
            min = 60
            max = 120
            "#,
        )
        .unwrap();
        let config = Config::merge(&cli(&[]), file);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_strategy() {
        let file = parse("[strategies.auto]\nmin = 120\nmax = 60").unwrap();
        let config = Config::merge(&cli(&[]), file);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_arbiter_config_carries_deny_list() {
        let file = parse(r#"bundle_deny_list = ["com.example.game"]"#).unwrap();
        let config = Config::merge(&cli(&[]), file).arbiter_config();
        assert!(config.table.bundle_deny_list.contains("com.example.game"));
        assert_eq!(config.up_timeout, Duration::from_millis(3000));
    }
}
