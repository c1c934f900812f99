use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::decision::TieBreak;
use crate::engine::ReconcilerConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub manifest: Option<PathBuf>,
    pub resync_interval: Duration,
    pub advisor_poll_interval: Duration,
    pub generation_retry_interval: Duration,
    pub max_concurrent: usize,
    pub tie_break: TieBreak,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secs = |name: &str, default: u64| -> Result<Duration> {
            match lookup(name) {
                Some(value) => {
                    let secs: u64 = value.trim().parse().with_context(|| {
                        format!("{name} must be a whole number of seconds, got '{value}'")
                    })?;
                    if secs == 0 {
                        return Err(anyhow!("{name} must be greater than zero"));
                    }
                    Ok(Duration::from_secs(secs))
                }
                None => Ok(Duration::from_secs(default)),
            }
        };

        let log_level = lookup("PLACEMENT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let manifest = lookup("PLACEMENT_MANIFEST")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        let resync_interval = secs("PLACEMENT_RESYNC_INTERVAL_SECS", 30)?;
        let advisor_poll_interval = secs("PLACEMENT_ADVISOR_POLL_INTERVAL_SECS", 10)?;
        let generation_retry_interval = secs("PLACEMENT_GENERATION_RETRY_SECS", 5)?;

        let max_concurrent = match lookup("PLACEMENT_MAX_CONCURRENT") {
            Some(value) => {
                let n: usize = value.trim().parse().with_context(|| {
                    format!("PLACEMENT_MAX_CONCURRENT must be a positive integer, got '{value}'")
                })?;
                if n == 0 {
                    return Err(anyhow!("PLACEMENT_MAX_CONCURRENT must be greater than zero"));
                }
                n
            }
            None => 8,
        };

        let tie_break = match lookup("PLACEMENT_TIE_BREAK") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e: String| anyhow!("PLACEMENT_TIE_BREAK: {e}"))?,
            None => TieBreak::default(),
        };

        Ok(Self {
            log_level,
            manifest,
            resync_interval,
            advisor_poll_interval,
            generation_retry_interval,
            max_concurrent,
            tie_break,
        })
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            advisor_poll_interval: self.advisor_poll_interval,
            generation_retry_interval: self.generation_retry_interval,
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            resync_interval: self.resync_interval,
            max_concurrent: self.max_concurrent,
            ..WorkerConfig::default()
        }
    }
}
