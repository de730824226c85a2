//! CLI argument parsing via clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use desk_hands::config::{parse_duration, ModelChoice, SafetyLevel};

/// Drive a desktop (a Chromium viewport) with a vision model.
#[derive(Debug, Parser)]
#[command(name = "desk-hands", version)]
pub struct Args {
    /// Run the browser without a window.
    #[arg(long, global = true)]
    pub headless: bool,

    /// Page to open before running the command.
    #[arg(long, global = true)]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a task end to end.
    Do {
        task: String,
        #[arg(short, long)]
        verbose: bool,
        /// flash, pro, or any model id.
        #[arg(long, value_parser = ModelChoice::from_str)]
        model: Option<ModelChoice>,
        /// Task deadline, e.g. 90s or 5m.
        #[arg(long, value_parser = parse_duration)]
        timeout: Option<Duration>,
        #[arg(long)]
        max_actions: Option<usize>,
        /// minimal, normal or strict.
        #[arg(long, value_parser = SafetyLevel::from_str)]
        safety: Option<SafetyLevel>,
        /// Append guardrail decisions as JSON lines to this file.
        #[arg(long)]
        audit_log: Option<PathBuf>,
        /// JSON list of sensitive patterns to use instead of the built-in set.
        #[arg(long)]
        patterns: Option<PathBuf>,
    },
    /// Click at logical coordinates.
    Click { x: f64, y: f64 },
    /// Type text into the focused element.
    Type { text: String },
    /// Save a PNG of the screen.
    Screenshot {
        #[arg(default_value = "screenshot.png")]
        file: PathBuf,
    },
    /// List interactive elements.
    Elements {
        #[arg(long)]
        role: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Print display geometry.
    Screen,
}
