//! The structured unit flowing through the pipeline.
//!
//! A [`Record`] is an ordered sequence of [`Value`]s plus scheduling
//! metadata: a priority in [-99, +99] (higher = more urgent) and an optional
//! release-time offset in milliseconds relative to pipeline start. Records
//! are immutable once built. A record derived by a transform keeps a shared
//! handle to the record it came from; following the chain to the end yields
//! the root that was originally read from a producer.
//!
//! The wire codecs live in [`ascii`] and [`binary`]; both are invoked only
//! at serialization boundaries (files, sockets, consoles).

pub mod ascii;
pub mod binary;
pub mod syntax;
pub mod value;

pub use syntax::{Syntax, SyntaxKind};
pub use value::{Value, ValueKind};

use crate::error::{PipeError, Result};
use std::io::Read;
use std::sync::Arc;

/// Priority assumed when none is given.
pub const PRIORITY_DEFAULT: i8 = 0;
/// The lowest possible priority.
pub const PRIORITY_LOWEST: i8 = -99;
/// The highest possible priority.
pub const PRIORITY_HIGHEST: i8 = 99;

/// One command/sensor record.
#[derive(Debug, Clone)]
pub struct Record {
    values: Vec<Value>,
    priority: i8,
    time: Option<u32>,
    parent: Option<Arc<Record>>,
}

impl Record {
    /// A record with default priority and no release time.
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            priority: PRIORITY_DEFAULT,
            time: None,
            parent: None,
        }
    }

    /// A record with explicit scheduling metadata.
    pub fn with_meta(values: Vec<Value>, priority: i8, time: Option<u32>) -> Result<Self> {
        if !(PRIORITY_LOWEST..=PRIORITY_HIGHEST).contains(&priority) {
            return Err(PipeError::InvalidRecord(format!(
                "priority {} not between {} and {}",
                priority, PRIORITY_LOWEST, PRIORITY_HIGHEST
            )));
        }
        Ok(Self {
            values,
            priority,
            time,
            parent: None,
        })
    }

    /// A record derived from `parent`, inheriting its priority and time.
    pub fn derived(values: Vec<Value>, parent: Arc<Record>) -> Self {
        Self {
            values,
            priority: parent.priority,
            time: parent.time,
            parent: Some(parent),
        }
    }

    /// A derived record with its own metadata; the default priority and a
    /// missing time fall back to the parent's values.
    pub fn derived_with_meta(
        values: Vec<Value>,
        parent: Arc<Record>,
        priority: i8,
        time: Option<u32>,
    ) -> Result<Self> {
        if !(PRIORITY_LOWEST..=PRIORITY_HIGHEST).contains(&priority) {
            return Err(PipeError::InvalidRecord(format!(
                "priority {} not between {} and {}",
                priority, PRIORITY_LOWEST, PRIORITY_HIGHEST
            )));
        }
        Ok(Self {
            priority: if priority == PRIORITY_DEFAULT {
                parent.priority
            } else {
                priority
            },
            time: time.or(parent.time),
            values,
            parent: Some(parent),
        })
    }

    /// Decoder-side constructor; metadata has already been range-checked
    /// against the wire grammar.
    pub(crate) fn from_wire(values: Vec<Value>, priority: i8, time: Option<u32>) -> Self {
        Self {
            values,
            priority,
            time,
            parent: None,
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The value at `index`, if present.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn priority(&self) -> i8 {
        self.priority
    }

    /// Release-time offset in milliseconds relative to pipeline start;
    /// `None` means "deliver as soon as it reaches the front".
    pub fn time(&self) -> Option<u32> {
        self.time
    }

    pub fn parent(&self) -> Option<&Arc<Record>> {
        self.parent.as_ref()
    }

    /// The first cause of this record: itself if it was read directly from
    /// a producer, otherwise the end of the parent chain.
    pub fn root(&self) -> &Record {
        let mut current = self;
        while let Some(parent) = &current.parent {
            current = parent;
        }
        current
    }

    // ── Wire forms ──

    /// Parse the ascii form from a string (with or without the newline).
    pub fn from_ascii(text: &str) -> Result<Self> {
        ascii::decode_line(text.as_bytes(), None)
    }

    /// Decode the binary form from a reader.
    pub fn from_binary<R: Read>(r: &mut R) -> Result<Self> {
        binary::decode_record(r, None)
    }

    /// Encode into the ascii form.
    pub fn to_ascii(&self, newline: bool) -> Vec<u8> {
        ascii::encode_record(self, newline)
    }

    /// Encode into the binary form. Fails for 0 or more than 8 values.
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        binary::encode_record(self)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
            && self.priority == other.priority
            && self.time == other.time
            && match (&self.parent, &other.parent) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = self.to_ascii(false);
        write!(f, "{}", String::from_utf8_lossy(&text))
    }
}
