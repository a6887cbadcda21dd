use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::types::RefreshRateMode;

#[derive(Parser)]
#[command(name = "hz-arbiter")]
#[command(about = "Decide the refresh rate each screen should run at")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Refresh rate mode (auto, low, medium, high)
    #[arg(long, env = "HZ_ARBITER_MODE", value_parser = clap::value_parser!(RefreshRateMode))]
    pub mode: Option<RefreshRateMode>,

    /// Foreground bundle name, checked against the deny-list
    #[arg(long)]
    pub bundle: Option<String>,

    /// Enable the animation idle power policy
    #[arg(long)]
    pub animation_power: bool,

    /// Disable the animation idle power policy (overrides config file)
    #[arg(long)]
    pub no_animation_power: bool,

    /// Do not raise the rate while the screen is touched
    #[arg(long)]
    pub no_touch_boost: bool,

    /// Touch up-timeout in milliseconds
    #[arg(long)]
    pub up_timeout_ms: Option<u64>,

    /// Path to config file
    #[arg(long, env = "HZ_ARBITER_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the arbiter, reading producer commands from stdin
    Run,
    /// Print the resolved strategy table and screens
    Dump,
}
