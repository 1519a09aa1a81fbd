//! Configuration (§6 "recognized options", expanded in §10.3).
//!
//! Loaded once, validated, and frozen into an immutable [`RuntimeConfig`]
//! before [`crate::dispatch::Dispatch::new`] creates any context. There is no
//! hot-reconfiguration path — it is an explicit non-goal.

use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_STACK_SIZE: usize = 7 * 4096;
const MIN_STACK_SIZE: usize = 4096;

/// Validated, immutable configuration snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of OS-thread contexts `Dispatch` creates.
    pub contexts: u32,
    /// Spin iterations before yielding while contending on the poller token.
    pub event_lock_spin_limit: u32,
    /// Iterations to spin polling for new events before halting.
    pub event_poll_spin_limit: u32,
    /// Default fiber stack size in bytes, rounded up to page size.
    pub fiber_stack_size: usize,
    /// Floor on worker fibers per context.
    pub workers_min: u32,
    /// Ceiling on worker fibers per context.
    pub workers_max: u32,
    /// Minimum level emitted through the logging front-end.
    pub log_level: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            contexts: num_cpus::get().max(1) as u32,
            event_lock_spin_limit: 1000,
            event_poll_spin_limit: 4000,
            fiber_stack_size: DEFAULT_STACK_SIZE,
            workers_min: 2,
            workers_max: 16,
            log_level: "info".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load defaults overridden by a TOML file at `path`, then validate.
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&text)
            .map_err(|e| Error::InvalidConfig(format!("{path:?}: {e}")))?;
        cfg.validated()
    }

    /// Load defaults overridden by a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validated()
    }

    /// Validate invariants, never silently clamping a bad value.
    pub fn validated(self) -> Result<Self> {
        if self.contexts == 0 {
            return Err(Error::InvalidConfig("contexts must be >= 1".into()));
        }
        if self.workers_min > self.workers_max {
            return Err(Error::InvalidConfig(
                "workers.min must be <= workers.max".into(),
            ));
        }
        if self.event_lock_spin_limit == 0 || self.event_poll_spin_limit == 0 {
            return Err(Error::InvalidConfig("spin limits must be nonzero".into()));
        }
        if self.fiber_stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "fiber.stack-size must be at least one page ({MIN_STACK_SIZE} bytes)"
            )));
        }
        if parse_level(&self.log_level).is_none() {
            return Err(Error::InvalidConfig(format!(
                "unrecognized log.level: {}",
                self.log_level
            )));
        }
        Ok(Self {
            fiber_stack_size: round_up_to_page(self.fiber_stack_size),
            ..self
        })
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        parse_level(&self.log_level).unwrap_or(log::LevelFilter::Info)
    }
}

fn parse_level(s: &str) -> Option<log::LevelFilter> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(log::LevelFilter::Trace),
        "debug" => Some(log::LevelFilter::Debug),
        "info" => Some(log::LevelFilter::Info),
        "warn" => Some(log::LevelFilter::Warn),
        "error" => Some(log::LevelFilter::Error),
        "off" => Some(log::LevelFilter::Off),
        _ => None,
    }
}

fn round_up_to_page(size: usize) -> usize {
    let page = 4096;
    (size + page - 1) / page * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RuntimeConfig::default().validated().unwrap();
    }

    #[test]
    fn rejects_inverted_worker_bounds() {
        let cfg = RuntimeConfig {
            workers_min: 10,
            workers_max: 2,
            ..RuntimeConfig::default()
        };
        match cfg.validated() {
            Err(Error::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn rejects_zero_spin_limit() {
        let cfg = RuntimeConfig {
            event_poll_spin_limit: 0,
            ..RuntimeConfig::default()
        };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn rounds_stack_size_up_to_page() {
        let cfg = RuntimeConfig {
            fiber_stack_size: MIN_STACK_SIZE + 1,
            ..RuntimeConfig::default()
        }
        .validated()
        .unwrap();
        assert_eq!(cfg.fiber_stack_size, MIN_STACK_SIZE * 2);
    }

    #[test]
    fn json_round_trip() {
        let json = r#"{"contexts": 4, "workers_min": 1, "workers_max": 8}"#;
        let cfg = RuntimeConfig::from_json_str(json).unwrap();
        assert_eq!(cfg.contexts, 4);
    }
}
