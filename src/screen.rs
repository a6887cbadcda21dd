//! A physical screen: its supported discrete rates and the one it runs at.

use crate::error::{Error, Result};
use crate::types::{ActiveMode, ScreenId};

#[derive(Debug, Clone)]
pub struct Screen {
    id: ScreenId,
    /// Ascending, deduplicated.
    supported_rates: Vec<u32>,
    active_mode: ActiveMode,
    range: (u32, u32),
}

/// Read-only copy of a screen handed out by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenInfo {
    pub id: ScreenId,
    pub supported_rates: Vec<u32>,
    pub active_mode: ActiveMode,
    pub range: (u32, u32),
}

impl Screen {
    /// `default_mode` indexes the sorted rate list; out-of-range indices fall
    /// back to the highest rate.
    pub fn new(id: ScreenId, rates: &[u32], default_mode: usize) -> Result<Self> {
        let mut supported_rates: Vec<u32> = rates.iter().copied().filter(|&r| r > 0).collect();
        supported_rates.sort_unstable();
        supported_rates.dedup();

        let Some(&highest) = supported_rates.last() else {
            return Err(Error::NoSupportedRate(id));
        };
        let lowest = supported_rates[0];

        let mode_id = default_mode.min(supported_rates.len() - 1);
        let active_mode = ActiveMode {
            mode_id,
            rate: supported_rates[mode_id],
        };

        Ok(Self {
            id,
            supported_rates,
            active_mode,
            range: (lowest, highest),
        })
    }

    pub fn id(&self) -> ScreenId {
        self.id
    }

    pub fn supported_rates(&self) -> &[u32] {
        &self.supported_rates
    }

    pub fn active_rate(&self) -> u32 {
        self.active_mode.rate
    }

    pub fn active_mode(&self) -> ActiveMode {
        self.active_mode
    }

    pub fn range(&self) -> (u32, u32) {
        self.range
    }

    pub fn add_supported_rate(&mut self, rate: u32) {
        if rate == 0 || self.supported_rates.contains(&rate) {
            return;
        }
        self.supported_rates.push(rate);
        self.supported_rates.sort_unstable();
        // Indices shifted; re-anchor the active mode on its rate.
        if let Some(idx) = self.index_of(self.active_mode.rate) {
            self.active_mode.mode_id = idx;
        }
    }

    pub fn set_refresh_rate_range(&mut self, min: u32, max: u32) {
        self.range = (min.min(max), max.max(min));
    }

    /// Resolve `rate` to a supported mode and make it active.
    pub fn set_active_refresh_rate(&mut self, rate: u32) -> ActiveMode {
        let resolved = self.resolve(rate);
        self.active_mode = ActiveMode {
            mode_id: self.index_of(resolved).unwrap_or(0),
            rate: resolved,
        };
        self.active_mode
    }

    /// Smallest supported rate at or above `rate` inside the range, else the
    /// largest one inside it. When the range admits no supported rate at
    /// all, the same rule runs over every supported rate.
    fn resolve(&self, rate: u32) -> u32 {
        let (min, max) = self.range;
        let restrict = self.supported_rates.iter().any(|r| (min..=max).contains(r));
        let candidates = || {
            self.supported_rates
                .iter()
                .copied()
                .filter(move |r| !restrict || (min..=max).contains(r))
        };

        candidates()
            .find(|&r| r >= rate)
            .or_else(|| candidates().last())
            .unwrap_or(self.active_mode.rate)
    }

    fn index_of(&self, rate: u32) -> Option<usize> {
        self.supported_rates.iter().position(|&r| r == rate)
    }

    pub fn info(&self) -> ScreenInfo {
        ScreenInfo {
            id: self.id,
            supported_rates: self.supported_rates.clone(),
            active_mode: self.active_mode,
            range: self.range,
        }
    }
}
