//! Built-in record transforms.
//!
//! Transforms run on the consumer thread, between the dispatch queue and
//! the sinks. A transform fanning one record into many produces clones that
//! reference the original as their parent.

use crate::error::StageError;
use crate::record::Record;
use crate::stage::{Setting, SettingValue, Stage, StageBase, Transform};
use std::sync::Arc;

/// Identity transform; forwards every record unchanged.
pub struct PassThrough {
    base: StageBase,
}

impl PassThrough {
    pub fn new() -> Self {
        Self {
            base: StageBase::sealed("pass-through", []),
        }
    }
}

impl Default for PassThrough {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for PassThrough {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

impl Transform for PassThrough {
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, StageError> {
        Ok(vec![record.clone()])
    }
}

/// Fans each record out into `copies` derived records, each carrying the
/// original as parent.
pub struct FanOut {
    base: StageBase,
    copies: u32,
}

impl FanOut {
    pub fn new(copies: u32) -> Self {
        Self {
            base: StageBase::sealed(
                "fan-out",
                [Setting::new("copies", SettingValue::Int(copies as i64))],
            ),
            copies,
        }
    }
}

impl Stage for FanOut {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    fn on_configure(&mut self) -> Result<(), StageError> {
        if let Some(copies) = self.base.setting("copies").and_then(|v| v.as_int()) {
            if copies < 1 {
                return Err(StageError::permanent(format!(
                    "fan-out needs at least one copy, got {}",
                    copies
                )));
            }
            self.copies = copies as u32;
        }
        Ok(())
    }
}

impl Transform for FanOut {
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, StageError> {
        let parent = Arc::new(record.clone());
        Ok((0..self.copies)
            .map(|_| Record::derived(parent.values().to_vec(), parent.clone()))
            .collect())
    }
}
