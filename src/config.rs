//! Scheduling tuning constants.
//!
//! The dispatch contract fixes the ordering and preemption guarantees; the
//! concrete timing margins and the overload threshold are tunable. The
//! defaults work on anything from a fast desktop to a slow embedded host;
//! hosts with very coarse timers may want larger margins.

use crate::error::{PipeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunable scheduling constants of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    /// How many milliseconds before a record's release time the producer
    /// thread hands it to the queue. Too small and timed records may arrive
    /// slightly late; too large and they are dropped or preempt without
    /// need when differently-prioritised records follow closely.
    pub overhead_reduction_ms: u64,

    /// Approximate cost of the path from the queue to the sink call, in
    /// milliseconds. Should not exceed `overhead_reduction_ms`.
    pub delivery_lead_ms: u64,

    /// Lateness a timed delivery may accumulate before it counts as behind
    /// schedule and is logged as a warning.
    pub max_behind_ms: u64,

    /// Ready-record backlog above which the queue starts evicting the
    /// lowest-priority ready records.
    pub drop_backlog_threshold: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            overhead_reduction_ms: 10,
            delivery_lead_ms: 2,
            max_behind_ms: 300,
            drop_backlog_threshold: 64,
        }
    }
}

impl Tuning {
    /// Parse from a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let tuning: Tuning =
            toml::from_str(text).map_err(|e| PipeError::Config(e.to_string()))?;
        tuning.validate()?;
        Ok(tuning)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.delivery_lead_ms > self.overhead_reduction_ms {
            return Err(PipeError::Config(format!(
                "delivery_lead_ms ({}) must not exceed overhead_reduction_ms ({})",
                self.delivery_lead_ms, self.overhead_reduction_ms
            )));
        }
        if self.drop_backlog_threshold == 0 {
            return Err(PipeError::Config(
                "drop_backlog_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Tuning::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let tuning = Tuning::from_toml("max_behind_ms = 500\n").unwrap();
        assert_eq!(tuning.max_behind_ms, 500);
        assert_eq!(tuning.overhead_reduction_ms, 10);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(Tuning::from_toml("no_such_knob = 1\n").is_err());
    }

    #[test]
    fn test_lead_larger_than_reduction_rejected() {
        let err = Tuning::from_toml("delivery_lead_ms = 50\n").unwrap_err();
        assert!(matches!(err, PipeError::Config(_)));
    }

    #[test]
    fn test_zero_backlog_rejected() {
        assert!(Tuning::from_toml("drop_backlog_threshold = 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(file, "overhead_reduction_ms = 20").unwrap();
        let tuning = Tuning::load(file.path()).unwrap();
        assert_eq!(tuning.overhead_reduction_ms, 20);
    }
}
