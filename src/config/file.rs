use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{RefreshRateMode, ScreenSpec, Strategy};

const CONFIG_FILE_NAME: &str = "hz-arbiter.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub default_mode: Option<RefreshRateMode>,
    pub bundle: Option<String>,
    pub strategies: Option<BTreeMap<RefreshRateMode, Strategy>>,
    #[serde(default)]
    pub bundle_deny_list: Vec<String>,
    pub touch_boost: Option<bool>,
    #[serde(default)]
    pub animation_power: AnimationPowerSection,
    #[serde(default)]
    pub touch: TouchSection,
    #[serde(default)]
    pub screens: Vec<ScreenSpec>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnimationPowerSection {
    pub enabled: Option<bool>,
    pub idle_fps: Option<u32>,
    pub idle_duration_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TouchSection {
    pub up_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub rs_idle_cnt: Option<u32>,
    pub frame_active_threshold_ms: Option<u64>,
}

pub fn parse(content: &str) -> Result<FileConfig, toml::de::Error> {
    toml::from_str(content)
}

pub fn load_from_path(path: &Path) -> Option<FileConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("Cannot read {}: {}", path.display(), e);
            return None;
        }
    };
    parse(&content)
        .inspect(|_| log::debug!("Loaded config from {}", path.display()))
        .inspect_err(|e| log::warn!("Failed to parse {}: {}", path.display(), e))
        .ok()
}

pub fn load_from_default_paths() -> Option<FileConfig> {
    search_paths(
        std::env::var_os("XDG_CONFIG_HOME").map(PathBuf::from),
        std::env::var_os("HOME").map(PathBuf::from),
    )
    .into_iter()
    .filter(|path| path.is_file())
    .find_map(|path| load_from_path(&path))
}

/// Working directory first, then the user config directory.
fn search_paths(xdg_config_home: Option<PathBuf>, home: Option<PathBuf>) -> Vec<PathBuf> {
    let user_dir = xdg_config_home
        .filter(|dir| dir.is_absolute())
        .or_else(|| home.map(|home| home.join(".config")));

    std::iter::once(PathBuf::from(CONFIG_FILE_NAME))
        .chain(user_dir.map(|dir| dir.join(CONFIG_FILE_NAME)))
        .collect()
}
