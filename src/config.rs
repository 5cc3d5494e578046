use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::MAX_NEGOTIATION_TIMEOUT_MS;
use crate::time::{HOUR, Ms};

/// How `declare_slot` scopes its overlap check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapScope {
    /// Online and onsite slots are separate pools.
    PerModality,
    Global,
}

impl FromStr for OverlapScope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_modality" | "modality" => Ok(OverlapScope::PerModality),
            "global" => Ok(OverlapScope::Global),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Journal directory. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Deadline for an unanswered proposal, measured from the last transition.
    pub negotiation_timeout_ms: Ms,
    pub sweep_interval: Duration,
    /// Maximum proposals in one request's history.
    pub max_rounds: usize,
    pub overlap_scope: OverlapScope,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            negotiation_timeout_ms: 24 * HOUR,
            sweep_interval: Duration::from_secs(60),
            max_rounds: 6,
            overlap_scope: OverlapScope::PerModality,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
            metrics_port: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Seconds to milliseconds, `None` unless the result is positive and within
/// `MAX_NEGOTIATION_TIMEOUT_MS`.
fn timeout_ms(secs: u64) -> Option<Ms> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| s.checked_mul(1000))
        .filter(|ms| (1..=MAX_NEGOTIATION_TIMEOUT_MS).contains(ms))
}

impl EngineConfig {
    /// Read `PARLEY_*` environment variables; anything missing or malformed keeps its default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("PARLEY_DATA_DIR").ok().map(PathBuf::from),
            negotiation_timeout_ms: env_parse::<u64>("PARLEY_NEGOTIATION_TIMEOUT_SECS")
                .and_then(timeout_ms)
                .unwrap_or(defaults.negotiation_timeout_ms),
            sweep_interval: env_parse::<u64>("PARLEY_SWEEP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map_or(defaults.sweep_interval, Duration::from_secs),
            max_rounds: env_parse::<usize>("PARLEY_MAX_ROUNDS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_rounds),
            overlap_scope: env_parse("PARLEY_OVERLAP_SCOPE").unwrap_or(defaults.overlap_scope),
            compact_threshold: env_parse("PARLEY_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            compact_interval: defaults.compact_interval,
            metrics_port: env_parse("PARLEY_METRICS_PORT"),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn journal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("parley.journal"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.negotiation_timeout_ms, 24 * HOUR);
        assert_eq!(cfg.overlap_scope, OverlapScope::PerModality);
        assert!(cfg.journal_path().is_none());
    }

    #[test]
    fn timeout_seconds_are_bounded() {
        assert_eq!(timeout_ms(90), Some(90_000));
        assert_eq!(timeout_ms(365 * 24 * 3600), Some(MAX_NEGOTIATION_TIMEOUT_MS));
        assert_eq!(timeout_ms(0), None);
        assert_eq!(timeout_ms(365 * 24 * 3600 + 1), None);
        assert_eq!(timeout_ms(u64::MAX), None);
        assert_eq!(timeout_ms(i64::MAX as u64), None);
    }

    #[test]
    fn overlap_scope_parses() {
        assert_eq!("global".parse(), Ok(OverlapScope::Global));
        assert_eq!(" Per_Modality ".parse(), Ok(OverlapScope::PerModality));
        assert!("everything".parse::<OverlapScope>().is_err());
    }

    #[test]
    fn journal_lives_in_data_dir() {
        let cfg = EngineConfig::default().with_data_dir("/tmp/parley");
        assert_eq!(
            cfg.journal_path().unwrap(),
            PathBuf::from("/tmp/parley/parley.journal")
        );
    }
}
