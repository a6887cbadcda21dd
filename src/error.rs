//! Error taxonomy for the arbitration engine.
//!
//! Every variant is recoverable: callers log it and keep the last committed
//! refresh rate.

use thiserror::Error;

use crate::types::{RefreshRateMode, ScreenId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("unknown screen {0}")]
    UnknownScreen(ScreenId),

    #[error("screen {0} registered more than once")]
    DuplicateScreen(ScreenId),

    #[error("illegal refresh rate {0}")]
    InvalidRate(i32),

    #[error("no strategy configured for refresh rate mode {0}")]
    NoStrategy(RefreshRateMode),

    #[error("failed to start timer '{0}'")]
    TimerStartFailed(String),

    #[error("screen {0} has no supported refresh rate")]
    NoSupportedRate(ScreenId),
}

pub type Result<T> = std::result::Result<T, Error>;
