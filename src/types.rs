//! Value types shared by every component of the arbiter.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Physical screen identity as reported by hotplug.
pub type ScreenId = u64;

/// Content surface identity (one per video playback surface).
pub type SurfaceId = u64;

/// Process id of a vote owner.
pub type Pid = i32;

/// Rate every panel is guaranteed to support; used as the safe fallback.
pub const OLED_60_HZ: u32 = 60;

/// Coarse refresh-rate policy selected by the system settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshRateMode {
    #[default]
    Auto,
    Low,
    Medium,
    High,
}

impl RefreshRateMode {
    pub const ALL: [RefreshRateMode; 4] = [
        RefreshRateMode::Auto,
        RefreshRateMode::Low,
        RefreshRateMode::Medium,
        RefreshRateMode::High,
    ];

    /// Modes under which the bundle deny-list caps rates at 60 Hz.
    pub fn is_restrictive(&self) -> bool {
        matches!(self, RefreshRateMode::Medium | RefreshRateMode::High)
    }
}

impl fmt::Display for RefreshRateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshRateMode::Auto => write!(f, "auto"),
            RefreshRateMode::Low => write!(f, "low"),
            RefreshRateMode::Medium => write!(f, "medium"),
            RefreshRateMode::High => write!(f, "high"),
        }
    }
}

impl FromStr for RefreshRateMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "-1" => Ok(RefreshRateMode::Auto),
            "low" | "1" => Ok(RefreshRateMode::Low),
            "medium" | "2" => Ok(RefreshRateMode::Medium),
            "high" | "3" => Ok(RefreshRateMode::High),
            _ => Err(format!(
                "Invalid refresh rate mode '{}'. Valid values: auto, low, medium, high",
                s
            )),
        }
    }
}

/// Configured `[min, max]` bounds of a refresh-rate mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Strategy {
    pub min: u32,
    pub max: u32,
}

impl Strategy {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, rate: u32) -> u32 {
        rate.clamp(self.min, self.max.max(self.min))
    }
}

/// A requested frame-rate range. Never a commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameRateRange {
    pub min: u32,
    pub max: u32,
    pub preferred: u32,
}

impl FrameRateRange {
    pub const fn new(min: u32, max: u32, preferred: u32) -> Self {
        Self { min, max, preferred }
    }

    /// A range pinned to a single rate.
    pub const fn exact(rate: u32) -> Self {
        Self::new(rate, rate, rate)
    }

    pub fn is_empty(&self) -> bool {
        self.max == 0 && self.preferred == 0
    }

    /// The rate this range asks for: `preferred`, or `max` when no
    /// preference was given, never below `min`.
    pub fn target(&self) -> u32 {
        let want = if self.preferred > 0 { self.preferred } else { self.max };
        want.max(self.min)
    }
}

/// Mode chosen for a screen: index into its supported rates plus the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveMode {
    pub mode_id: usize,
    pub rate: u32,
}

/// A screen announced at startup or on hotplug.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScreenSpec {
    pub id: ScreenId,
    pub rates: Vec<u32>,
    /// Index into the sorted `rates` of the initially active rate.
    #[serde(default)]
    pub default_mode: usize,
}

/// System scenes that impose their own preferred rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneType {
    ScreenRecord,
}

impl SceneType {
    pub fn preferred_rate(&self) -> u32 {
        match self {
            SceneType::ScreenRecord => OLED_60_HZ,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_str() {
        assert_eq!("high".parse::<RefreshRateMode>().unwrap(), RefreshRateMode::High);
        assert_eq!("Medium".parse::<RefreshRateMode>().unwrap(), RefreshRateMode::Medium);
        assert_eq!("-1".parse::<RefreshRateMode>().unwrap(), RefreshRateMode::Auto);
        assert!("turbo".parse::<RefreshRateMode>().is_err());
    }

    #[test]
    fn test_mode_display_round_trips() {
        for mode in RefreshRateMode::ALL {
            assert_eq!(mode.to_string().parse::<RefreshRateMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_range_target() {
        assert_eq!(FrameRateRange::new(30, 120, 90).target(), 90);
        assert_eq!(FrameRateRange::new(30, 120, 0).target(), 120);
        assert_eq!(FrameRateRange::new(60, 120, 30).target(), 60);
    }

    #[test]
    fn test_strategy_clamp() {
        let s = Strategy::new(60, 120);
        assert_eq!(s.clamp(30), 60);
        assert_eq!(s.clamp(90), 90);
        assert_eq!(s.clamp(144), 120);
    }
}
