use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use hz_arbiter::config::{Cli, Command, Config};
use hz_arbiter::control::{self, ControlCommand};
use hz_arbiter::types::Pid;
use hz_arbiter::video::EventInfo;
use hz_arbiter::{FrameRateArbiter, FrameRateRange};

const COMPOSE_INTERVAL: Duration = Duration::from_millis(16);
const PRESENT_INTERVAL: Duration = Duration::from_millis(8);

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Some(Command::Dump) => "warn",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = Config::load(&cli);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    match cli.command {
        Some(Command::Dump) => {
            dump(&config);
            Ok(())
        }
        Some(Command::Run) | None => run(&config),
    }
}

fn dump(config: &Config) {
    println!("default mode: {}", config.default_mode);
    println!("strategies:");
    for (mode, strategy) in &config.strategies {
        println!("  {:<7} {:>3}..{:<3} Hz", mode.to_string(), strategy.min, strategy.max);
    }
    if !config.bundle_deny_list.is_empty() {
        println!("deny-list: {}", config.bundle_deny_list.join(", "));
    }
    println!(
        "animation power: {} (idle {} fps after {} ms)",
        if config.power.enabled { "on" } else { "off" },
        config.power.idle_fps,
        config.power.idle_duration_ms
    );
    println!("screens:");
    for screen in &config.screens {
        println!("  {} rates={:?} default_mode={}", screen.id, screen.rates, screen.default_mode);
    }
}

fn run(config: &Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let sink = Arc::new(|pid: Pid, info: EventInfo| {
        log::info!(
            "[notify] pid {} {} {} ({}..{})",
            pid,
            info.name,
            if info.enabled { "enabled" } else { "cancelled" },
            info.min,
            info.max
        );
    });
    let arbiter = FrameRateArbiter::new(config.arbiter_config(), sink, None)?;

    arbiter.add_screens(&config.screens)?;
    arbiter.set_refresh_rate_mode(config.default_mode)?;
    if let Some(bundle) = &config.bundle {
        arbiter.refresh_bundle_name(bundle)?;
    }

    log::info!(
        "hz-arbiter starting (mode={}, screens={}, animation_power={}, touch_boost={})",
        config.default_mode,
        config.screens.len(),
        if config.power.enabled { "on" } else { "off" },
        if config.touch_boost { "on" } else { "off" }
    );

    let running = Arc::new(AtomicBool::new(true));
    let (request_tx, request_rx) = crossbeam_channel::unbounded::<FrameRateRange>();

    let compose_arbiter = arbiter.clone();
    let compose_handle = thread::spawn(move || {
        log::info!("[compose] thread starting");
        control::run_compositor(&compose_arbiter, &request_rx, COMPOSE_INTERVAL);
        log::info!("[compose] thread stopped");
    });

    let present_arbiter = arbiter.clone();
    let present_running = running.clone();
    let present_handle = thread::spawn(move || {
        log::info!("[present] thread starting");
        while present_running.load(Ordering::Relaxed) {
            let mut modes: Vec<_> = present_arbiter.take_pending_modes().into_iter().collect();
            modes.sort_by_key(|(id, _)| *id);
            for (id, mode) in modes {
                log::info!("[present] screen {} -> {} Hz (mode {})", id, mode.rate, mode.mode_id);
            }
            thread::sleep(PRESENT_INTERVAL);
        }
        log::info!("[present] thread stopped");
    });

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let command = match control::parse_line(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                log::warn!("[stdin] {}", e);
                continue;
            }
        };
        match command {
            ControlCommand::Quit => break,
            ControlCommand::Request(range) => {
                if request_tx.send(range).is_err() {
                    break;
                }
            }
            ControlCommand::Status => print_status(&arbiter),
            other => {
                if let Err(e) = control::apply(&arbiter, other) {
                    log::warn!("[stdin] {}", e);
                }
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    drop(request_tx);
    compose_handle.join().unwrap();
    present_handle.join().unwrap();

    Ok(())
}

fn print_status(arbiter: &FrameRateArbiter) {
    let registry = arbiter.registry();
    println!(
        "mode={} bundle={:?} pipeline_active={}",
        registry.current_mode(),
        registry.bundle_name(),
        arbiter.is_pipeline_active()
    );
    if let Some(vote) = arbiter.video().active_vote() {
        println!("video vote: pid {} at {} Hz", vote.pid, vote.rate);
    }
    for id in registry.screen_ids() {
        if let Some(info) = registry.screen(id) {
            println!(
                "screen {}: {} Hz range {}..{} rates {:?} touch {}",
                info.id,
                info.active_mode.rate,
                info.range.0,
                info.range.1,
                info.supported_rates,
                arbiter.touch_machine().state(id)
            );
        }
    }
}
