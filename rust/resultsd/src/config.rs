use crate::model::DEFAULT_PASS_PERCENT;
use anyhow::{anyhow, Context};
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_WORKSPACE: &str = "RESULTSD_WORKSPACE";
pub const ENV_PASS_PERCENT: &str = "RESULTSD_PASS_PERCENT";
pub const ENV_UPLOAD_TICK_MS: &str = "RESULTSD_UPLOAD_TICK_MS";

const DEFAULT_UPLOAD_TICK_MS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace opened at start-up, before any `workspace.select`.
    pub workspace: Option<PathBuf>,
    pub pass_percent: f64,
    pub upload_tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            pass_percent: DEFAULT_PASS_PERCENT,
            upload_tick: Duration::from_millis(DEFAULT_UPLOAD_TICK_MS),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();

        if let Some(v) = get(ENV_WORKSPACE).filter(|v| !v.trim().is_empty()) {
            cfg.workspace = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_PASS_PERCENT) {
            let pct: f64 = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_PASS_PERCENT} must be a number, got {v:?}"))?;
            if !(0.0..=100.0).contains(&pct) {
                return Err(anyhow!("{ENV_PASS_PERCENT} must be within 0..=100, got {pct}"));
            }
            cfg.pass_percent = pct;
        }
        if let Some(v) = get(ENV_UPLOAD_TICK_MS) {
            let ms: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_UPLOAD_TICK_MS} must be milliseconds, got {v:?}"))?;
            cfg.upload_tick = Duration::from_millis(ms);
        }
        Ok(cfg)
    }
}
