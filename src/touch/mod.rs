mod manager;
mod state_machine;

pub use manager::{
    FrameRefreshDetector, TouchManager, DEFAULT_FRAME_ACTIVE_THRESHOLD, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_RS_IDLE_CNT,
};
pub use state_machine::{IdleCallback, TouchEvent, TouchState, TouchStateMachine, DEFAULT_UP_TIMEOUT};
