//! Refresh-rate arbitration for variable refresh displays.
//!
//! Touch, video playback, animation and mode signals are folded into one
//! committed rate per screen by [`FrameRateArbiter`].

pub mod arbiter;
pub mod config;
pub mod control;
pub mod error;
pub mod power;
pub mod registry;
pub mod screen;
pub mod timer;
pub mod touch;
pub mod types;
pub mod video;

pub use arbiter::{ArbiterConfig, FrameRateArbiter};
pub use error::{Error, Result};
pub use types::{ActiveMode, FrameRateRange, RefreshRateMode, ScreenId};
