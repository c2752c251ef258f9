//! # recpipe: priority-aware record pipeline
//!
//! A soft-real-time pipeline that ingests structured command/sensor records
//! from arbitrary sources, optionally transforms them, and delivers them to
//! actuators or sinks under priority- and time-aware scheduling.
//!
//! ## Architecture
//!
//! - **Records**: an ordered sequence of typed values plus priority and
//!   release-time metadata, with byte-exact binary and human-editable ascii
//!   wire forms ([`record`])
//! - **Stages**: producers, transforms, and sinks share one strict
//!   lifecycle contract ([`stage`])
//! - **Dispatch queue**: the sole shared structure between producer threads
//!   and the consumer loop, ordering ready records priority-major and
//!   arrival-minor while holding timed records back ([`queue`])
//! - **Preemption**: an explicit cancellation token reaches the consumer
//!   even inside a blocking sink call ([`interrupt`])
//! - **Orchestrator**: one thread per producer, one serial consumer,
//!   aggregated run counters ([`pipeline`], [`feedback`])
//!
//! ## Example
//!
//! ```no_run
//! use recpipe::{
//!     pipeline::Pipeline,
//!     stage::producers::TextProducer,
//!     stage::sinks::CommandSink,
//!     stage::StageExt,
//! };
//!
//! fn main() -> recpipe::Result<()> {
//!     let mut pipe = Pipeline::new();
//!     pipe.add_producer(TextProducer::from_string(
//!         "SC|SLEEP|100\n[P10]SC|ECHO|urgent\n",
//!     ))?;
//!     pipe.add_sink(CommandSink::new())?;
//!
//!     pipe.configure()?;
//!     let stats = pipe.run()?;
//!     println!("delivered {} record(s)", stats.records_delivered);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod feedback;
pub mod interrupt;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod stage;

// Re-export commonly used types
pub use config::Tuning;
pub use error::{PipeError, Result, StageError};
pub use feedback::{FeedbackSnapshot, RunFeedback};
pub use interrupt::InterruptFlag;
pub use pipeline::{AbortHandle, Pipeline};
pub use queue::{DispatchQueue, PutOutcome};
pub use record::{Record, Syntax, SyntaxKind, Value, ValueKind};
pub use stage::{
    Delivery, LifecycleState, Producer, Sink, Stage, StageBase, StageExt, Transform,
};
