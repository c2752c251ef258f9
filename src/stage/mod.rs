//! Stage contract shared by producers, transforms, and sinks.
//!
//! Every stage embeds a [`StageBase`] and implements [`Stage`]; the
//! lifecycle wrappers in [`StageExt`] guard the transitions uniformly so the
//! orchestrator can sequence configure→init→drain→close across
//! heterogeneous stages. The role traits add the data-path hooks:
//!
//! - [`Producer`] — "more data available?" / "read one record or signal end
//!   of stream"
//! - [`Transform`] — one record in, zero/one/many records out
//! - [`Sink`] — accept one record, distinguishing delivered, interrupted,
//!   and rejected outcomes; recoverable vs. fatal failure travels in
//!   [`StageError`]'s permanence flag
//!
//! The data-path entry points (`read_record`, `transform_record`,
//! `deliver`) check that the stage is Initialized before dispatching to the
//! implementation hook, mirroring the lifecycle contract.

pub mod producers;
pub mod sinks;
pub mod state;
pub mod transforms;

pub use state::{LifecycleState, Setting, SettingValue, StageBase};

use crate::error::{PipeError, Result, StageError};
use crate::interrupt::InterruptFlag;
use crate::record::Record;

/// Wire format selection for file and stream stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Ascii,
    Binary,
}

/// Base trait of every pipeline stage.
pub trait Stage: Send {
    fn base(&self) -> &StageBase;

    fn base_mut(&mut self) -> &mut StageBase;

    /// Configuration hook; may run repeatedly.
    fn on_configure(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Acquire exclusive external resources.
    fn on_init(&mut self) -> Result<(), StageError> {
        Ok(())
    }

    /// Release resources acquired in [`on_init`](Stage::on_init).
    fn on_close(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// Guarded lifecycle operations, available on every [`Stage`].
pub trait StageExt: Stage {
    fn name(&self) -> &str {
        self.base().name()
    }

    /// Constructed/Configured → Configured. Repeatable; three consecutive
    /// calls reapply the same configuration without further state change.
    fn configure(&mut self) -> Result<()> {
        self.base().ensure_constructed()?;
        self.on_configure().map_err(PipeError::Stage)?;
        self.base_mut().set_state(LifecycleState::Configured);
        Ok(())
    }

    /// Configured → Initialized.
    fn init(&mut self) -> Result<()> {
        self.base().ensure_configured()?;
        self.on_init().map_err(PipeError::Stage)?;
        self.base_mut().set_state(LifecycleState::Initialized);
        Ok(())
    }

    /// Initialized → Configured.
    fn close(&mut self) -> Result<()> {
        self.base().ensure_initialized()?;
        self.base_mut().set_state(LifecycleState::Configured);
        self.on_close().map_err(PipeError::Stage)?;
        Ok(())
    }
}

impl<T: Stage + ?Sized> StageExt for T {}

/// A source of records, driven on its own thread.
pub trait Producer: Stage {
    /// Whether more records may still be available.
    fn has_more(&self) -> bool;

    /// Read one record; `None` signals end of stream.
    fn produce(&mut self) -> Result<Option<Record>, StageError>;

    /// Lifecycle-guarded read used by the orchestrator.
    fn read_record(&mut self) -> Result<Option<Record>, StageError> {
        self.base()
            .ensure_initialized()
            .map_err(StageError::from_guard)?;
        self.produce()
    }
}

/// Rewrites one record into zero, one, or many records.
pub trait Transform: Stage {
    fn apply(&mut self, record: &Record) -> Result<Vec<Record>, StageError>;

    /// Lifecycle-guarded application used by the orchestrator.
    fn transform_record(&mut self, record: &Record) -> Result<Vec<Record>, StageError> {
        self.base()
            .ensure_initialized()
            .map_err(StageError::from_guard)?;
        self.apply(record)
    }
}

/// Outcome of handing one record to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The record was accepted and fully processed.
    Delivered,
    /// The delivery was cut short by the cancellation token; whether the
    /// record is retried or abandoned is the sink's concern.
    Interrupted,
    /// The sink does not handle records of this shape.
    Rejected,
}

/// A consumer of records.
///
/// Deliveries run strictly serially; a sink never sees concurrent calls.
/// The `interrupt` token may be raised at any moment; sinks must route every
/// blocking operation through it.
pub trait Sink: Stage {
    fn consume(
        &mut self,
        record: &Record,
        interrupt: &InterruptFlag,
    ) -> Result<Delivery, StageError>;

    /// Lifecycle-guarded delivery used by the orchestrator.
    fn deliver(
        &mut self,
        record: &Record,
        interrupt: &InterruptFlag,
    ) -> Result<Delivery, StageError> {
        self.base()
            .ensure_initialized()
            .map_err(StageError::from_guard)?;
        self.consume(record, interrupt)
    }
}
