//! Line-oriented producer commands read by the `run` binary.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::arbiter::FrameRateArbiter;
use crate::error::Result;
use crate::power::{now_ms, AnimationEvent};
use crate::touch::TouchEvent;
use crate::types::{FrameRateRange, Pid, RefreshRateMode, SceneType, ScreenId, SurfaceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Touch { screen: ScreenId, event: TouchEvent },
    Vote { surface: SurfaceId, pid: Pid, rate: u32 },
    Release { surface: SurfaceId },
    Mode(RefreshRateMode),
    Bundle(String),
    Anim(AnimationEvent),
    Scene { scene: SceneType, active: bool },
    Request(FrameRateRange),
    AddScreen { id: ScreenId, rates: Vec<u32> },
    RemoveScreen(ScreenId),
    Active(ScreenId),
    Set { key: String, value: String },
    Status,
    Quit,
}

/// Parse one input line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> std::result::Result<Option<ControlCommand>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let words: Vec<&str> = line.split_whitespace().collect();
    let command = match words.as_slice() {
        ["touch", event, screen] => ControlCommand::Touch {
            screen: number(screen)?,
            event: touch_event(event)?,
        },
        ["vote", surface, pid, rate] => ControlCommand::Vote {
            surface: number(surface)?,
            pid: number(pid)?,
            rate: number(rate)?,
        },
        ["release", surface] => ControlCommand::Release {
            surface: number(surface)?,
        },
        ["mode", mode] => ControlCommand::Mode(mode.parse()?),
        ["bundle", name] => ControlCommand::Bundle((*name).to_string()),
        ["anim", "start"] => ControlCommand::Anim(AnimationEvent::Started),
        ["anim", "tick"] => ControlCommand::Anim(AnimationEvent::Tick(now_ms())),
        ["anim", "tick", ts] => ControlCommand::Anim(AnimationEvent::Tick(number(ts)?)),
        ["anim", "idle", flag] => ControlCommand::Anim(AnimationEvent::Idle(on_off(flag)?)),
        ["scene", "record", flag] => ControlCommand::Scene {
            scene: SceneType::ScreenRecord,
            active: on_off(flag)?,
        },
        ["request", rate] => ControlCommand::Request(FrameRateRange::exact(number(rate)?)),
        ["request", min, max, preferred] => ControlCommand::Request(FrameRateRange::new(
            number(min)?,
            number(max)?,
            number(preferred)?,
        )),
        ["screen", "add", id, rates] => ControlCommand::AddScreen {
            id: number(id)?,
            rates: rates
                .split(',')
                .map(number::<u32>)
                .collect::<std::result::Result<_, _>>()?,
        },
        ["screen", "remove", id] => ControlCommand::RemoveScreen(number(id)?),
        ["active", id] => ControlCommand::Active(number(id)?),
        ["set", key, value] => ControlCommand::Set {
            key: (*key).to_string(),
            value: (*value).to_string(),
        },
        ["status"] => ControlCommand::Status,
        ["quit"] | ["exit"] => ControlCommand::Quit,
        _ => return Err(format!("Unrecognized command '{}'", line)),
    };
    Ok(Some(command))
}

fn number<T: std::str::FromStr>(s: &str) -> std::result::Result<T, String> {
    s.parse().map_err(|_| format!("Invalid number '{}'", s))
}

fn on_off(s: &str) -> std::result::Result<bool, String> {
    match s {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(format!("Expected on/off, got '{}'", s)),
    }
}

fn touch_event(s: &str) -> std::result::Result<TouchEvent, String> {
    match s {
        "down" => Ok(TouchEvent::Down),
        "up" => Ok(TouchEvent::Up),
        "up-timeout" => Ok(TouchEvent::UpTimeout),
        "idle-timeout" => Ok(TouchEvent::IdleTimeout),
        _ => Err(format!("Unknown touch event '{}'", s)),
    }
}

/// Apply a command that acts on the arbiter directly. `Request`, `Status`
/// and `Quit` belong to the caller's loop and are ignored here.
pub fn apply(arbiter: &FrameRateArbiter, command: ControlCommand) -> Result<()> {
    match command {
        ControlCommand::Touch { screen, event } => {
            let state = arbiter.handle_touch(screen, event)?;
            log::debug!("[touch] screen {} now {}", screen, state);
        }
        ControlCommand::Vote { surface, pid, rate } => {
            arbiter.on_video_vote(surface, pid, rate);
        }
        ControlCommand::Release { surface } => {
            arbiter.release_video_surface(surface);
        }
        ControlCommand::Mode(mode) => arbiter.set_refresh_rate_mode(mode)?,
        ControlCommand::Bundle(name) => arbiter.refresh_bundle_name(&name)?,
        ControlCommand::Anim(event) => {
            arbiter.animation_sender().send(event);
        }
        ControlCommand::Scene { scene, active } => {
            if active {
                arbiter.registry().start_scene(scene);
            } else {
                arbiter.registry().stop_scene(scene);
            }
        }
        ControlCommand::AddScreen { id, rates } => arbiter.add_screen(id, &rates, 0)?,
        ControlCommand::RemoveScreen(id) => arbiter.remove_screen(id)?,
        ControlCommand::Active(id) => arbiter.registry().set_active_screen(id),
        ControlCommand::Set { key, value } => {
            let settings: HashMap<String, String> = [(key, value)].into_iter().collect();
            arbiter.power().set_config(&settings);
        }
        ControlCommand::Request(_) | ControlCommand::Status | ControlCommand::Quit => {}
    }
    Ok(())
}

/// Composition tick. A frame is only produced while something requests a
/// rate; an empty request settles every screen once and then stays quiet so
/// the render-idle window can lapse. Returns when `requests` disconnects.
pub fn run_compositor(
    arbiter: &FrameRateArbiter,
    requests: &Receiver<FrameRateRange>,
    interval: Duration,
) {
    let mut requested = FrameRateRange::default();
    loop {
        match requests.recv_timeout(interval) {
            Ok(range) => {
                requested = range;
                if requested.is_empty() {
                    arbiter.settle(requested);
                }
            }
            Err(RecvTimeoutError::Timeout) if !requested.is_empty() => arbiter.on_frame(requested),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
