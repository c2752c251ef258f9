//! The pipeline orchestrator.
//!
//! Owns one thread per producer and a consumer loop that pulls ready
//! records from the dispatch queue, runs them through the transform chain,
//! and delivers them serially to every live sink. The pipeline itself
//! follows the same lifecycle contract as its stages, so embedding code
//! sequences it with the identical configure→init→run→close calls.
//!
//! ```text
//! [Producers]                  [DispatchQueue]               [Sinks]
//!    file ────┐ thread each                     consumer ┌──→ device
//!    text  ───┼──→ put() ──→ priority/time ──→ get() ─┬──┼──→ file
//!    binary ──┘              ordering, holds   transforms └──→ channel
//! ```
//!
//! A run ends when every producer has signalled end-of-input and the queue
//! has drained, or when a permanent error has disabled every sink. One
//! failed record never aborts a run: codec and stage errors are classified
//! temporary or permanent, counted, and the run continues wherever a usable
//! stage remains.

use crate::config::Tuning;
use crate::error::Result;
use crate::feedback::{FeedbackSnapshot, RunFeedback};
use crate::interrupt::InterruptFlag;
use crate::queue::DispatchQueue;
use crate::record::Record;
use crate::stage::{
    Delivery, LifecycleState, Producer, Sink, Stage, StageBase, StageExt, Transform,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Slot<T: ?Sized> {
    stage: Box<T>,
    ignored: bool,
}

impl<T: ?Sized> Slot<T> {
    fn new(stage: Box<T>) -> Self {
        Self {
            stage,
            ignored: false,
        }
    }
}

/// Handle for aborting a running pipeline from another thread.
#[derive(Clone)]
pub struct AbortHandle {
    abort: Arc<InterruptFlag>,
    interrupt: Arc<InterruptFlag>,
    queue: Arc<DispatchQueue>,
}

impl AbortHandle {
    /// Stop the current run: wake every blocked producer, consumer, and
    /// sink, reject further input, and discard undelivered records.
    pub fn abort(&self) {
        tracing::info!("aborting pipeline run");
        self.abort.raise();
        self.interrupt.raise();
        self.queue.close();
        let discarded = self.queue.discard_remaining();
        if discarded > 0 {
            tracing::warn!(discarded, "undelivered records discarded on abort");
        }
    }
}

/// The central processing point connecting producers, transforms, and
/// sinks.
pub struct Pipeline {
    base: StageBase,
    tuning: Tuning,
    producers: Vec<Slot<dyn Producer>>,
    transforms: Vec<Slot<dyn Transform>>,
    sinks: Vec<Slot<dyn Sink>>,
    queue: Arc<DispatchQueue>,
    feedback: Arc<RunFeedback>,
    interrupt: Arc<InterruptFlag>,
    abort: Arc<InterruptFlag>,
}

impl Pipeline {
    pub fn new() -> Self {
        // the defaults always validate
        Self::assemble(Tuning::default())
    }

    pub fn with_tuning(tuning: Tuning) -> Result<Self> {
        tuning.validate()?;
        Ok(Self::assemble(tuning))
    }

    fn assemble(tuning: Tuning) -> Self {
        let queue = Arc::new(DispatchQueue::new(
            tuning.drop_backlog_threshold,
            tuning.overhead_reduction_ms,
        ));
        Self {
            base: StageBase::sealed("pipeline", []),
            tuning,
            producers: Vec::new(),
            transforms: Vec::new(),
            sinks: Vec::new(),
            queue,
            feedback: Arc::new(RunFeedback::new()),
            interrupt: Arc::new(InterruptFlag::new()),
            abort: Arc::new(InterruptFlag::new()),
        }
    }

    /// Connect a producer. Legal while Constructed or Configured.
    pub fn add_producer(&mut self, producer: impl Producer + 'static) -> Result<()> {
        self.base.ensure_constructed()?;
        tracing::debug!(producer = producer.name(), "connecting producer");
        self.producers.push(Slot::new(Box::new(producer)));
        Ok(())
    }

    /// Connect a transform. Legal while Constructed or Configured.
    pub fn add_transform(&mut self, transform: impl Transform + 'static) -> Result<()> {
        self.base.ensure_constructed()?;
        tracing::debug!(transform = transform.name(), "connecting transform");
        self.transforms.push(Slot::new(Box::new(transform)));
        Ok(())
    }

    /// Connect a sink. Legal while Constructed or Configured.
    pub fn add_sink(&mut self, sink: impl Sink + 'static) -> Result<()> {
        self.base.ensure_constructed()?;
        tracing::debug!(sink = sink.name(), "connecting sink");
        self.sinks.push(Slot::new(Box::new(sink)));
        Ok(())
    }

    /// The counters of the current (or most recent) run.
    pub fn feedback(&self) -> Arc<RunFeedback> {
        self.feedback.clone()
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// A handle that can abort a run from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            abort: self.abort.clone(),
            interrupt: self.interrupt.clone(),
            queue: self.queue.clone(),
        }
    }

    /// Execute one run: initialize every stage, pump all records from the
    /// producers through the queue to the sinks, then close every stage.
    ///
    /// Requires the pipeline to be Configured.
    pub fn run(&mut self) -> Result<FeedbackSnapshot> {
        self.base.ensure_configured()?;
        self.feedback = Arc::new(RunFeedback::new());
        self.abort.clear();
        self.interrupt.clear();
        StageExt::init(self)?;
        self.queue.reset()?;
        self.feedback.start();
        tracing::info!("pipeline run started");

        let tuning = &self.tuning;
        let queue: &DispatchQueue = &self.queue;
        let feedback: &RunFeedback = &self.feedback;
        let interrupt: &InterruptFlag = &self.interrupt;
        let abort: &InterruptFlag = &self.abort;
        let producers = &mut self.producers;
        let transforms = &mut self.transforms;
        let sinks = &mut self.sinks;

        let live = producers.iter().filter(|s| !s.ignored).count();
        if live == 0 {
            tracing::info!("no usable producers, closing queue");
            queue.close();
        }
        let remaining = AtomicUsize::new(live);

        std::thread::scope(|scope| {
            for slot in producers.iter_mut().filter(|s| !s.ignored) {
                let remaining = &remaining;
                scope.spawn(move || {
                    producer_loop(&mut *slot.stage, queue, feedback, interrupt, abort, tuning);
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        tracing::debug!("last producer finished, closing queue");
                        queue.close();
                    }
                });
            }

            consumer_loop(transforms, sinks, queue, feedback, interrupt, abort, tuning);

            // stop any producer still waiting on a release time or a put
            queue.close();
            abort.raise();
        });

        let leftover = self.queue.discard_remaining();
        if leftover > 0 {
            tracing::warn!(leftover, "undelivered records dropped at end of run");
            self.feedback.inc_drops(leftover as u64);
        }
        self.feedback.stop();
        StageExt::close(self)?;
        let snapshot = self.feedback.snapshot();
        tracing::info!(%snapshot, "pipeline finished and closed");
        Ok(snapshot)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Pipeline {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    fn on_configure(&mut self) -> Result<(), crate::error::StageError> {
        configure_all(&mut self.producers);
        configure_all(&mut self.transforms);
        configure_all(&mut self.sinks);
        Ok(())
    }

    fn on_init(&mut self) -> Result<(), crate::error::StageError> {
        init_all(&mut self.producers, &self.feedback);
        init_all(&mut self.transforms, &self.feedback);
        init_all(&mut self.sinks, &self.feedback);
        Ok(())
    }

    fn on_close(&mut self) -> Result<(), crate::error::StageError> {
        close_all(&mut self.producers);
        close_all(&mut self.transforms);
        close_all(&mut self.sinks);
        Ok(())
    }
}

fn configure_all<T: Stage + ?Sized>(slots: &mut [Slot<T>]) {
    for slot in slots {
        slot.ignored = false;
        if let Err(e) = slot.stage.configure() {
            tracing::error!(stage = slot.stage.name(), error = %e, "stage failed to configure");
            slot.ignored = true;
        }
    }
}

fn init_all<T: Stage + ?Sized>(slots: &mut [Slot<T>], feedback: &RunFeedback) {
    for slot in slots.iter_mut().filter(|s| !s.ignored) {
        if let Err(e) = slot.stage.init() {
            tracing::error!(stage = slot.stage.name(), error = %e, "stage failed to initialize");
            feedback.record_error(e.to_string(), true);
            slot.ignored = true;
        }
    }
}

fn close_all<T: Stage + ?Sized>(slots: &mut [Slot<T>]) {
    for slot in slots.iter_mut() {
        if !slot.ignored && slot.stage.base().state() == LifecycleState::Initialized {
            if let Err(e) = slot.stage.close() {
                tracing::error!(stage = slot.stage.name(), error = %e, "stage failed to close");
            }
        }
        slot.ignored = false;
    }
}

/// Body of one producer thread: read, wait out most of a record's release
/// delay, then hand it to the queue and react to the outcome.
fn producer_loop(
    producer: &mut dyn Producer,
    queue: &DispatchQueue,
    feedback: &RunFeedback,
    interrupt: &InterruptFlag,
    abort: &InterruptFlag,
    tuning: &Tuning,
) {
    tracing::debug!(producer = producer.name(), "producer thread started");
    loop {
        if abort.is_raised() {
            break;
        }
        match producer.read_record() {
            Ok(Some(record)) => {
                feedback.inc_read();
                if let Some(t) = record.time() {
                    // hand timed records over just before their release so
                    // the put-time preemption check matches readiness
                    let target = (t as u64).saturating_sub(tuning.overhead_reduction_ms);
                    let elapsed = queue.elapsed_ms();
                    if target > elapsed
                        && abort.wait_interruptible(Duration::from_millis(target - elapsed))
                    {
                        break;
                    }
                }
                match queue.put(record) {
                    Ok(outcome) => {
                        if !outcome.stored {
                            feedback.inc_drops(1);
                        }
                        feedback.inc_drops(outcome.evicted as u64);
                        if outcome.preempts {
                            tracing::info!(
                                "interrupting in-flight delivery for higher-priority record"
                            );
                            interrupt.raise();
                        }
                    }
                    Err(_) => break,
                }
            }
            Ok(None) => {
                tracing::debug!(producer = producer.name(), "producer end of input");
                break;
            }
            Err(e) if e.is_permanent() => {
                tracing::error!(producer = producer.name(), error = %e, "producer failed permanently");
                feedback.record_error(e.to_string(), true);
                break;
            }
            Err(e) => {
                tracing::warn!(producer = producer.name(), error = %e, "skipping one record");
                feedback.record_error(e.to_string(), false);
            }
        }
    }
    tracing::debug!(producer = producer.name(), "producer thread finished");
}

/// Body of the consumer: pull ready records, transform, deliver serially.
fn consumer_loop(
    transforms: &mut [Slot<dyn Transform>],
    sinks: &mut [Slot<dyn Sink>],
    queue: &DispatchQueue,
    feedback: &RunFeedback,
    interrupt: &InterruptFlag,
    abort: &InterruptFlag,
    tuning: &Tuning,
) {
    tracing::debug!("consumer loop started");
    while let Some(record) = queue.get() {
        if abort.is_raised() {
            queue.delivery_done();
            break;
        }
        if sinks.iter().all(|s| s.ignored) {
            tracing::info!("every sink is unusable, ending run");
            queue.delivery_done();
            break;
        }

        note_lateness(&record, queue, feedback, tuning);

        let batch = apply_transforms(transforms, record, feedback);
        for out in &batch {
            interrupt.clear();
            deliver_to_sinks(sinks, out, feedback, interrupt);
            if abort.is_raised() {
                break;
            }
        }
        queue.delivery_done();
    }
    tracing::debug!("consumer loop finished");
}

/// Measure how far behind its release time a record is being delivered.
fn note_lateness(
    record: &Record,
    queue: &DispatchQueue,
    feedback: &RunFeedback,
    tuning: &Tuning,
) {
    let Some(t) = record.time() else { return };
    let elapsed = queue.elapsed_ms();
    if elapsed <= t as u64 {
        return;
    }
    let behind = elapsed - t as u64;
    let significant = behind > tuning.max_behind_ms;
    feedback.record_behind(behind, significant);
    if significant {
        if let Some(started) = feedback.started_at() {
            let intended = started + chrono::Duration::milliseconds(t as i64);
            tracing::warn!(
                record = %record,
                behind_ms = behind,
                "delivery behind schedule, should have run at {}",
                intended.format("%H:%M:%S%.3f")
            );
        }
    } else {
        tracing::trace!(record = %record, behind_ms = behind, "delivery slightly late");
    }
}

/// Run a record through the transform chain. A failing transform is skipped
/// for that record (permanent failures disable it for the rest of the run);
/// the record continues unchanged past it.
fn apply_transforms(
    transforms: &mut [Slot<dyn Transform>],
    record: Record,
    feedback: &RunFeedback,
) -> Vec<Record> {
    let mut batch = vec![record];
    for slot in transforms.iter_mut() {
        if slot.ignored {
            continue;
        }
        let mut next = Vec::with_capacity(batch.len());
        for rec in &batch {
            if slot.ignored {
                next.push(rec.clone());
                continue;
            }
            feedback.inc_transformed();
            match slot.stage.transform_record(rec) {
                Ok(outputs) => next.extend(outputs),
                Err(e) => {
                    let permanent = e.is_permanent();
                    feedback.record_error(e.to_string(), permanent);
                    if permanent {
                        tracing::error!(transform = slot.stage.name(), error = %e, "transform failed permanently");
                        slot.ignored = true;
                    } else {
                        tracing::warn!(transform = slot.stage.name(), error = %e, "transform skipped for one record");
                    }
                    next.push(rec.clone());
                }
            }
        }
        batch = next;
    }
    batch
}

/// Deliver one record to every live sink, strictly serially.
fn deliver_to_sinks(
    sinks: &mut [Slot<dyn Sink>],
    record: &Record,
    feedback: &RunFeedback,
    interrupt: &InterruptFlag,
) {
    let mut accepted = false;
    for slot in sinks.iter_mut() {
        if slot.ignored {
            continue;
        }
        match slot.stage.deliver(record, interrupt) {
            Ok(Delivery::Delivered) => {
                accepted = true;
                feedback.inc_delivered();
            }
            Ok(Delivery::Interrupted) => {
                accepted = true;
                feedback.inc_delivered();
                feedback.inc_interruptions();
                tracing::debug!(sink = slot.stage.name(), record = %record, "delivery interrupted");
            }
            Ok(Delivery::Rejected) => {}
            Err(e) => {
                // a failed attempt still counts as a handled delivery
                accepted = true;
                feedback.inc_delivered();
                let permanent = e.is_permanent();
                feedback.record_error(e.to_string(), permanent);
                if permanent {
                    tracing::error!(sink = slot.stage.name(), error = %e, "removing no longer working sink");
                    if let Err(close_err) = slot.stage.close() {
                        tracing::debug!(sink = slot.stage.name(), error = %close_err, "sink close failed");
                    }
                    slot.ignored = true;
                } else {
                    tracing::warn!(sink = slot.stage.name(), error = %e, "skipping sink for one record");
                }
            }
        }
    }
    if !accepted {
        let message = format!(
            "skipping record '{}' because no fitting sink has been found",
            record
        );
        tracing::error!("{}", message);
        feedback.record_error(message, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipeError;
    use crate::stage::producers::TextProducer;
    use crate::stage::sinks::CommandSink;

    #[test]
    fn test_run_requires_configured() {
        let mut pipe = Pipeline::new();
        assert!(matches!(pipe.run(), Err(PipeError::State { .. })));
    }

    #[test]
    fn test_empty_pipeline_runs_clean() {
        let mut pipe = Pipeline::new();
        pipe.configure().unwrap();
        let snapshot = pipe.run().unwrap();
        assert_eq!(snapshot.records_read, 0);
        assert_eq!(snapshot.records_delivered, 0);
        assert!(snapshot.permanent_errors.is_empty());
        // back in Configured, a second run is legal
        let snapshot = pipe.run().unwrap();
        assert_eq!(snapshot.records_read, 0);
    }

    #[test]
    fn test_add_stage_after_init_fails() {
        let mut pipe = Pipeline::new();
        pipe.add_sink(CommandSink::new()).unwrap();
        pipe.configure().unwrap();
        StageExt::init(&mut pipe).unwrap();
        assert!(pipe.add_producer(TextProducer::from_string("")).is_err());
        StageExt::close(&mut pipe).unwrap();
        pipe.add_producer(TextProducer::from_string("")).unwrap();
    }

    #[test]
    fn test_invalid_tuning_rejected() {
        let tuning = Tuning {
            delivery_lead_ms: 100,
            overhead_reduction_ms: 10,
            ..Tuning::default()
        };
        assert!(Pipeline::with_tuning(tuning).is_err());
    }
}
