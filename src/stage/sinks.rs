//! Built-in record sinks.
//!
//! `CommandSink` interprets internal `SC` commands and is the standard test
//! harness for scheduling behavior; `WriterSink`/`FileSink` serialize
//! records back into a wire form; `ChannelSink` hands delivered records to
//! an embedding application over a crossbeam channel.

use crate::error::StageError;
use crate::interrupt::InterruptFlag;
use crate::record::Record;
use crate::stage::{Delivery, Sink, Stage, StageBase, WireFormat};
use anyhow::Context;
use crossbeam_channel::Sender;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Executes internal commands of the form `SC|<COMMAND>|<ARG>`:
///
/// - `SC|SLEEP|<ms>` blocks for the given duration; the sleep goes through
///   the cancellation token, so a preempting record cuts it short.
/// - `SC|ECHO|<text>` logs the text.
///
/// Unknown `SC` commands are temporary errors; records not starting with
/// `SC` are rejected so another sink can claim them.
pub struct CommandSink {
    base: StageBase,
}

impl CommandSink {
    pub fn new() -> Self {
        Self {
            base: StageBase::sealed("command-sink", []),
        }
    }
}

impl Default for CommandSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for CommandSink {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

impl Sink for CommandSink {
    fn consume(
        &mut self,
        record: &Record,
        interrupt: &InterruptFlag,
    ) -> Result<Delivery, StageError> {
        if record.value(0).and_then(|v| v.as_str()) != Some("SC") {
            return Ok(Delivery::Rejected);
        }
        let command = record.value(1).and_then(|v| v.as_str()).unwrap_or("");
        match command {
            "SLEEP" => {
                let ms = record.value(2).and_then(|v| v.as_i64()).unwrap_or(0).max(0) as u64;
                if interrupt.wait_interruptible(Duration::from_millis(ms)) {
                    tracing::debug!(ms, "sleep command interrupted");
                    return Ok(Delivery::Interrupted);
                }
                Ok(Delivery::Delivered)
            }
            "ECHO" => {
                let text = record.value(2).and_then(|v| v.as_str()).unwrap_or("");
                tracing::info!(target: "recpipe::echo", "{}", text);
                Ok(Delivery::Delivered)
            }
            other => Err(StageError::temporary(format!(
                "unknown internal command: '{}' in '{}'",
                other, record
            ))),
        }
    }
}

/// Serializes every record into a writer, one wire-form record at a time.
pub struct WriterSink<W> {
    base: StageBase,
    writer: W,
    format: WireFormat,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W, format: WireFormat) -> Self {
        Self {
            base: StageBase::sealed("writer-sink", []),
            writer,
            format,
        }
    }

    /// The wrapped writer, for tests inspecting what was written.
    pub fn writer(&self) -> &W {
        &self.writer
    }
}

impl<W: Write + Send> Stage for WriterSink<W> {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

fn write_record<W: Write>(
    writer: &mut W,
    record: &Record,
    format: WireFormat,
) -> Result<(), StageError> {
    let bytes = match format {
        WireFormat::Ascii => record.to_ascii(true),
        WireFormat::Binary => record
            .to_binary()
            .map_err(|e| StageError::temporary(e.to_string()))?,
    };
    writer
        .write_all(&bytes)
        .and_then(|_| writer.flush())
        .map_err(|e| StageError::temporary("cannot write record").with_source(e))
}

impl<W: Write + Send> Sink for WriterSink<W> {
    fn consume(
        &mut self,
        record: &Record,
        _interrupt: &InterruptFlag,
    ) -> Result<Delivery, StageError> {
        write_record(&mut self.writer, record, self.format)?;
        Ok(Delivery::Delivered)
    }
}

/// Serializes records into a file created during `init`.
pub struct FileSink {
    base: StageBase,
    path: PathBuf,
    format: WireFormat,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, format: WireFormat) -> Self {
        Self {
            base: StageBase::sealed("file-sink", []),
            path: path.into(),
            format,
            writer: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Stage for FileSink {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    fn on_init(&mut self) -> Result<(), StageError> {
        let file = File::create(&self.path)
            .with_context(|| format!("cannot create '{}'", self.path.display()))
            .map_err(|e| StageError::permanent("cannot initialize file sink").with_source(e))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn on_close(&mut self) -> Result<(), StageError> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| StageError::temporary("cannot flush file sink").with_source(e))?;
        }
        Ok(())
    }
}

impl Sink for FileSink {
    fn consume(
        &mut self,
        record: &Record,
        _interrupt: &InterruptFlag,
    ) -> Result<Delivery, StageError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StageError::permanent("file sink has no open file"))?;
        write_record(writer, record, self.format)?;
        Ok(Delivery::Delivered)
    }
}

/// Forwards delivered records into a crossbeam channel, the hand-off point
/// for an embedding application (UI, device transport, ...).
pub struct ChannelSink {
    base: StageBase,
    tx: Sender<Record>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Record>) -> Self {
        Self {
            base: StageBase::sealed("channel-sink", []),
            tx,
        }
    }
}

impl Stage for ChannelSink {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

impl Sink for ChannelSink {
    fn consume(
        &mut self,
        record: &Record,
        _interrupt: &InterruptFlag,
    ) -> Result<Delivery, StageError> {
        self.tx
            .send(record.clone())
            .map_err(|_| StageError::permanent("channel receiver disconnected"))?;
        Ok(Delivery::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use crate::stage::StageExt;
    use std::time::Instant;

    fn init<S: Sink>(sink: &mut S) {
        sink.configure().unwrap();
        sink.init().unwrap();
    }

    fn sc(command: &str, arg: &str) -> Record {
        Record::from_ascii(&format!("SC|{}|{}", command, arg)).unwrap()
    }

    #[test]
    fn test_command_sink_rejects_non_sc() {
        let mut sink = CommandSink::new();
        init(&mut sink);
        let flag = InterruptFlag::new();
        let record = Record::from_ascii("MOVE|1|2").unwrap();
        assert_eq!(sink.deliver(&record, &flag).unwrap(), Delivery::Rejected);
    }

    #[test]
    fn test_command_sink_sleep_blocks() {
        let mut sink = CommandSink::new();
        init(&mut sink);
        let flag = InterruptFlag::new();
        let start = Instant::now();
        let outcome = sink.deliver(&sc("SLEEP", "60"), &flag).unwrap();
        assert_eq!(outcome, Delivery::Delivered);
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_command_sink_sleep_interruptible() {
        let mut sink = CommandSink::new();
        init(&mut sink);
        let flag = InterruptFlag::new();
        flag.raise();
        let start = Instant::now();
        let outcome = sink.deliver(&sc("SLEEP", "5000"), &flag).unwrap();
        assert_eq!(outcome, Delivery::Interrupted);
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn test_command_sink_unknown_command_is_temporary() {
        let mut sink = CommandSink::new();
        init(&mut sink);
        let flag = InterruptFlag::new();
        let err = sink.deliver(&sc("FAIL", ""), &flag).unwrap_err();
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_writer_sink_ascii_output() {
        let mut sink = WriterSink::new(Vec::new(), WireFormat::Ascii);
        init(&mut sink);
        let flag = InterruptFlag::new();
        let record = Record::new(vec![Value::int64(25), Value::float64(7.5)]);
        sink.deliver(&record, &flag).unwrap();
        assert_eq!(sink.writer().as_slice(), b"25 | 7.5\n");
    }

    #[test]
    fn test_writer_sink_binary_rejects_empty_record() {
        let mut sink = WriterSink::new(Vec::new(), WireFormat::Binary);
        init(&mut sink);
        let flag = InterruptFlag::new();
        let err = sink.deliver(&Record::new(vec![]), &flag).unwrap_err();
        assert!(!err.is_permanent());
    }

    #[test]
    fn test_file_sink_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let mut sink = FileSink::new(&path, WireFormat::Ascii);
        init(&mut sink);
        let flag = InterruptFlag::new();
        sink.deliver(&Record::new(vec![Value::int64(1)]), &flag)
            .unwrap();
        sink.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n");
    }

    #[test]
    fn test_file_sink_unwritable_path_fails_init() {
        let mut sink = FileSink::new("/can/not/be/created", WireFormat::Ascii);
        sink.configure().unwrap();
        assert!(sink.init().is_err());
    }

    #[test]
    fn test_channel_sink_forwards_records() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut sink = ChannelSink::new(tx);
        init(&mut sink);
        let flag = InterruptFlag::new();
        let record = Record::new(vec![Value::int64(9)]);
        sink.deliver(&record, &flag).unwrap();
        assert_eq!(rx.try_recv().unwrap(), record);
    }

    #[test]
    fn test_channel_sink_disconnected_is_permanent() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        init(&mut sink);
        let flag = InterruptFlag::new();
        let err = sink
            .deliver(&Record::new(vec![Value::int64(9)]), &flag)
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
