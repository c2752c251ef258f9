//! Lifecycle state shared by every pipeline stage.
//!
//! The legal order is strict and cycle-free:
//!
//! ```text
//! Constructing → Constructed → Configured ⇄ Initialized
//!                                  ↺ (configure, repeatable)
//! ```
//!
//! Declaring configuration slots is legal only while Constructing; sealing
//! moves to Constructed and permanently forbids further declarations.
//! `configure` is repeatable from Constructed or Configured, `init` acquires
//! exclusive external resources and is legal only from Configured, `close`
//! releases them and returns to Configured. Every guarded operation invoked
//! from the wrong state fails with an error naming the expected and actual
//! states.

use crate::error::{PipeError, Result};
use std::path::PathBuf;

/// The four lifecycle states of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// The stage is still being built; settings may be declared.
    Constructing,
    /// Built but not yet configured.
    Constructed,
    /// Configured and ready to be initialized.
    Configured,
    /// Holding its external resources, ready for use.
    Initialized,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Constructing => "Constructing",
            LifecycleState::Constructed => "Constructed",
            LifecycleState::Configured => "Configured",
            LifecycleState::Initialized => "Initialized",
        };
        write!(f, "{}", name)
    }
}

/// A typed configuration value held by a setting slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Flag(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Path(PathBuf),
}

impl SettingValue {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            SettingValue::Flag(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SettingValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            SettingValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SettingValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&PathBuf> {
        match self {
            SettingValue::Path(v) => Some(v),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            SettingValue::Flag(_) => "flag",
            SettingValue::Int(_) => "int",
            SettingValue::Float(_) => "float",
            SettingValue::Text(_) => "text",
            SettingValue::Path(_) => "path",
        }
    }
}

/// A declared configuration slot with its current value.
#[derive(Debug, Clone)]
pub struct Setting {
    key: String,
    value: SettingValue,
}

impl Setting {
    pub fn new(key: impl Into<String>, value: SettingValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &SettingValue {
        &self.value
    }
}

/// Per-stage lifecycle state and settings registry.
///
/// Embedded by every stage implementation; the state is an explicit enum
/// checked by ordinary branches.
#[derive(Debug)]
pub struct StageBase {
    name: String,
    state: LifecycleState,
    settings: Vec<Setting>,
}

impl StageBase {
    /// A base in the Constructing state; callers declare settings and then
    /// [`seal`](Self::seal) it.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: LifecycleState::Constructing,
            settings: Vec::new(),
        }
    }

    /// A ready-sealed base for constructors whose settings are fixed.
    pub fn sealed(name: impl Into<String>, settings: impl IntoIterator<Item = Setting>) -> Self {
        Self {
            name: name.into(),
            state: LifecycleState::Constructed,
            settings: settings.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Declare a configuration slot. Legal only while Constructing.
    pub fn declare(&mut self, setting: Setting) -> Result<()> {
        self.ensure_constructing()?;
        if self.settings.iter().any(|s| s.key == setting.key) {
            return Err(PipeError::Config(format!(
                "setting '{}' declared twice on '{}'",
                setting.key, self.name
            )));
        }
        self.settings.push(setting);
        Ok(())
    }

    /// Finish construction; further declarations are permanently forbidden.
    pub fn seal(&mut self) -> Result<()> {
        self.ensure_constructing()?;
        self.set_state(LifecycleState::Constructed);
        Ok(())
    }

    /// The current value of a declared setting.
    pub fn setting(&self, key: &str) -> Option<&SettingValue> {
        self.settings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value())
    }

    pub fn settings(&self) -> &[Setting] {
        &self.settings
    }

    /// Update a declared setting; the new value must keep the declared type.
    /// Legal from Constructed on; the stage picks the value up on its next
    /// `configure`.
    pub fn set(&mut self, key: &str, value: SettingValue) -> Result<()> {
        self.ensure_constructed()?;
        let name = &self.name;
        let slot = self
            .settings
            .iter_mut()
            .find(|s| s.key == key)
            .ok_or_else(|| PipeError::Config(format!("no setting '{}' on '{}'", key, name)))?;
        if std::mem::discriminant(&slot.value) != std::mem::discriminant(&value) {
            return Err(PipeError::Config(format!(
                "setting '{}' on '{}' is a {}, not a {}",
                key,
                name,
                slot.value.kind_name(),
                value.kind_name()
            )));
        }
        slot.value = value;
        Ok(())
    }

    // ── Guards ──

    pub fn ensure_constructing(&self) -> Result<()> {
        match self.state {
            LifecycleState::Constructing => Ok(()),
            actual => Err(self.wrong_state("Constructing", actual)),
        }
    }

    pub fn ensure_constructed(&self) -> Result<()> {
        match self.state {
            LifecycleState::Constructed | LifecycleState::Configured => Ok(()),
            actual => Err(self.wrong_state("Constructed or Configured", actual)),
        }
    }

    pub fn ensure_configured(&self) -> Result<()> {
        match self.state {
            LifecycleState::Configured => Ok(()),
            actual => Err(self.wrong_state("Configured", actual)),
        }
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        match self.state {
            LifecycleState::Initialized => Ok(()),
            actual => Err(self.wrong_state("Initialized", actual)),
        }
    }

    fn wrong_state(&self, expected: &'static str, actual: LifecycleState) -> PipeError {
        PipeError::State {
            stage: self.name.clone(),
            expected,
            actual,
        }
    }

    /// Transition after a successful guard; the guards in the lifecycle
    /// wrappers make every call site a legal edge.
    pub(crate) fn set_state(&mut self, to: LifecycleState) {
        tracing::trace!(stage = %self.name, from = %self.state, to = %to, "state change");
        self.state = to;
    }
}
