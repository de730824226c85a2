use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::error::CuaError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_ACTIONS: usize = 50;
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
pub const DEFAULT_MAX_SCREENSHOT_DIM: u32 = 1280;
pub const DEFAULT_JPEG_QUALITY: u8 = 60;

/// How many parent directories above the cwd are searched for `.env`.
const DOTENV_PARENT_DEPTH: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Minimal,
    #[default]
    Normal,
    Strict,
}

impl FromStr for SafetyLevel {
    type Err = CuaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "minimal" => Ok(SafetyLevel::Minimal),
            "normal" => Ok(SafetyLevel::Normal),
            "strict" => Ok(SafetyLevel::Strict),
            other => Err(CuaError::Config(format!("unknown safety level: {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelChoice {
    #[default]
    Flash,
    Pro,
    /// Any other provider model id, passed through unchanged.
    Custom(String),
}

impl ModelChoice {
    pub fn model_id(&self) -> &str {
        match self {
            ModelChoice::Flash => "gemini-2.5-flash",
            ModelChoice::Pro => "gemini-2.5-pro",
            ModelChoice::Custom(id) => id,
        }
    }
}

impl FromStr for ModelChoice {
    type Err = CuaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "flash" => Ok(ModelChoice::Flash),
            "pro" => Ok(ModelChoice::Pro),
            "" => Err(CuaError::Config("empty model name".into())),
            _ => Ok(ModelChoice::Custom(s.trim().to_string())),
        }
    }
}

/// Which control flow drives a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopStrategy {
    /// The model decides when to look at the screen.
    #[default]
    React,
    /// A perception screenshot is taken before every model turn.
    ObserveFirst,
}

/// Option bag accepted by [`crate::Agent::new`]. Unset fields fall back to defaults.
#[derive(Clone, Debug)]
pub struct Options {
    pub api_key: Option<String>,
    pub model: ModelChoice,
    pub safety_level: SafetyLevel,
    pub timeout: Duration,
    pub max_actions: usize,
    pub verbose: bool,
    pub headless: bool,
    pub rate_limit_per_minute: u32,
    pub screen_index: usize,
    pub max_consecutive_failures: u32,
    pub max_screenshot_dim: u32,
    pub jpeg_quality: u8,
    pub audit_log_path: Option<PathBuf>,
    /// JSON list of sensitive patterns replacing the built-in set.
    pub patterns_path: Option<PathBuf>,
    pub escalate_blocked_actions: bool,
    pub strategy: LoopStrategy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            api_key: api_key_from_env(),
            model: ModelChoice::default(),
            safety_level: SafetyLevel::default(),
            timeout: DEFAULT_TIMEOUT,
            max_actions: DEFAULT_MAX_ACTIONS,
            verbose: false,
            headless: false,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            screen_index: 0,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            max_screenshot_dim: DEFAULT_MAX_SCREENSHOT_DIM,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            audit_log_path: None,
            patterns_path: None,
            escalate_blocked_actions: false,
            strategy: LoopStrategy::default(),
        }
    }
}

/// Resolved, validated configuration. Handed out by value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub api_key: String,
    pub model: ModelChoice,
    pub safety_level: SafetyLevel,
    pub timeout: Duration,
    pub max_actions: usize,
    pub verbose: bool,
    pub headless: bool,
    pub rate_limit_per_minute: u32,
    pub screen_index: usize,
    pub max_consecutive_failures: u32,
    pub max_screenshot_dim: u32,
    pub jpeg_quality: u8,
    pub audit_log_path: Option<PathBuf>,
    pub patterns_path: Option<PathBuf>,
    pub escalate_blocked_actions: bool,
    pub strategy: LoopStrategy,
}

impl Config {
    /// Applies fallbacks. A missing key is only an error when `require_key` is set;
    /// agents built around a caller-supplied model don't need one.
    pub fn resolve(opts: Options, require_key: bool) -> Result<Self, CuaError> {
        let api_key = opts
            .api_key
            .filter(|k| !k.trim().is_empty())
            .or_else(api_key_from_env)
            .unwrap_or_default();
        if require_key && api_key.is_empty() {
            return Err(CuaError::NoApiKey);
        }
        let rate_limit_per_minute = if opts.rate_limit_per_minute == 0 {
            DEFAULT_RATE_LIMIT_PER_MINUTE
        } else {
            opts.rate_limit_per_minute
        };
        let max_actions =
            if opts.max_actions == 0 { DEFAULT_MAX_ACTIONS } else { opts.max_actions };
        let timeout = if opts.timeout.is_zero() { DEFAULT_TIMEOUT } else { opts.timeout };
        let max_consecutive_failures = if opts.max_consecutive_failures == 0 {
            DEFAULT_MAX_CONSECUTIVE_FAILURES
        } else {
            opts.max_consecutive_failures
        };
        let max_screenshot_dim = if opts.max_screenshot_dim == 0 {
            DEFAULT_MAX_SCREENSHOT_DIM
        } else {
            opts.max_screenshot_dim
        };
        let jpeg_quality = opts.jpeg_quality.clamp(1, 100);

        Ok(Self {
            api_key,
            model: opts.model,
            safety_level: opts.safety_level,
            timeout,
            max_actions,
            verbose: opts.verbose,
            headless: opts.headless,
            rate_limit_per_minute,
            screen_index: opts.screen_index,
            max_consecutive_failures,
            max_screenshot_dim,
            jpeg_quality,
            audit_log_path: opts.audit_log_path,
            patterns_path: opts.patterns_path,
            escalate_blocked_actions: opts.escalate_blocked_actions,
            strategy: opts.strategy,
        })
    }
}

/// `GOOGLE_API_KEY` wins over `GEMINI_API_KEY`.
pub fn api_key_from_env() -> Option<String> {
    ["GOOGLE_API_KEY", "GEMINI_API_KEY"]
        .iter()
        .filter_map(|name| env::var(name).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

/// Loads the first `.env` found in `start` or up to three parents. Missing files are fine.
pub fn load_dotenv_from(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    for _ in 0..=DOTENV_PARENT_DEPTH {
        let Some(current) = dir else { break };
        let candidate = current.join(".env");
        if candidate.is_file() {
            match dotenvy::from_path(&candidate) {
                Ok(()) => {
                    debug!(path = %candidate.display(), "loaded .env");
                    return Some(candidate);
                }
                Err(e) => {
                    debug!(path = %candidate.display(), error = %e, "ignoring unreadable .env")
                }
            }
        }
        dir = current.parent();
    }
    None
}

pub fn load_dotenv() -> Option<PathBuf> {
    let cwd = env::current_dir().ok()?;
    load_dotenv_from(&cwd)
}

/// Parses `90s`, `2m`, `1h`, `500ms` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, CuaError> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| CuaError::Config(format!("invalid duration: {s:?}")))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(CuaError::Config(format!("unknown duration unit: {other:?}"))),
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(CuaError::Config(format!("invalid duration: {s:?}")));
    }
    Ok(Duration::from_secs_f64(secs))
}
