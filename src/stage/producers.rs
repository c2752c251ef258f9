//! Built-in record producers.
//!
//! `TextProducer` and `BinaryProducer` wrap any reader; `FileProducer` owns
//! its path and opens the file in `init` (the file handle is the exclusive
//! resource of the lifecycle contract).
//!
//! Error classification: a malformed ascii line only poisons that line;
//! the producer reports a temporary error and continues with the next one.
//! A malformed binary stream cannot be re-synchronised, so binary decode
//! errors are permanent. IO failures of the underlying reader are always
//! permanent.

use crate::error::StageError;
use crate::record::{ascii, binary, Record};
use crate::stage::{Producer, Setting, SettingValue, Stage, StageBase, WireFormat};
use anyhow::Context;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

/// Read one newline-terminated ascii record from a buffered reader.
fn read_ascii_record<R: BufRead>(
    reader: &mut R,
    line: &mut Vec<u8>,
    done: &mut bool,
) -> Result<Option<Record>, StageError> {
    if *done {
        return Ok(None);
    }
    line.clear();
    let n = reader
        .read_until(b'\n', line)
        .map_err(|e| StageError::permanent("cannot read from text source").with_source(e))?;
    if n == 0 {
        *done = true;
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        *done = true;
        return Err(StageError::temporary("record not terminated by newline"));
    }
    let body = &line[..line.len() - 1];
    match ascii::decode_line(body, None) {
        Ok(record) => Ok(Some(record)),
        Err(e) => Err(StageError::temporary(e.to_string())),
    }
}

/// Read one binary record from a reader; clean EOF is end of stream.
fn read_binary_record<R: Read>(
    reader: &mut R,
    done: &mut bool,
) -> Result<Option<Record>, StageError> {
    if *done {
        return Ok(None);
    }
    match binary::decode_record_opt(reader, None) {
        Ok(Some(record)) => Ok(Some(record)),
        Ok(None) => {
            *done = true;
            Ok(None)
        }
        Err(e) => {
            *done = true;
            Err(StageError::permanent(e.to_string()))
        }
    }
}

/// Produces ascii records line by line from any buffered reader.
pub struct TextProducer<R> {
    base: StageBase,
    reader: R,
    line: Vec<u8>,
    done: bool,
}

impl<R: BufRead + Send> TextProducer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            base: StageBase::sealed("text-producer", []),
            reader,
            line: Vec::new(),
            done: false,
        }
    }
}

impl TextProducer<Cursor<Vec<u8>>> {
    /// A producer over a fixed block of ascii input, mainly for tests and
    /// scripted runs.
    pub fn from_string(input: impl Into<String>) -> Self {
        Self::new(Cursor::new(input.into().into_bytes()))
    }
}

impl<R: BufRead + Send> Stage for TextProducer<R> {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

impl<R: BufRead + Send> Producer for TextProducer<R> {
    fn has_more(&self) -> bool {
        !self.done
    }

    fn produce(&mut self) -> Result<Option<Record>, StageError> {
        read_ascii_record(&mut self.reader, &mut self.line, &mut self.done)
    }
}

/// Produces binary records from any reader.
pub struct BinaryProducer<R> {
    base: StageBase,
    reader: R,
    done: bool,
}

impl<R: Read + Send> BinaryProducer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            base: StageBase::sealed("binary-producer", []),
            reader,
            done: false,
        }
    }
}

impl<R: Read + Send> Stage for BinaryProducer<R> {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }
}

impl<R: Read + Send> Producer for BinaryProducer<R> {
    fn has_more(&self) -> bool {
        !self.done
    }

    fn produce(&mut self) -> Result<Option<Record>, StageError> {
        read_binary_record(&mut self.reader, &mut self.done)
    }
}

/// Produces records from a file in either wire format.
pub struct FileProducer {
    base: StageBase,
    format: WireFormat,
    path: PathBuf,
    reader: Option<BufReader<File>>,
    line: Vec<u8>,
    done: bool,
}

impl FileProducer {
    pub fn new(path: impl Into<PathBuf>, format: WireFormat) -> Self {
        let path = path.into();
        Self {
            base: StageBase::sealed(
                "file-producer",
                [Setting::new("path", SettingValue::Path(path.clone()))],
            ),
            format,
            path,
            reader: None,
            line: Vec::new(),
            done: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_reader(path: &Path) -> anyhow::Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("cannot open '{}'", path.display()))?;
    Ok(BufReader::new(file))
}

impl Stage for FileProducer {
    fn base(&self) -> &StageBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StageBase {
        &mut self.base
    }

    fn on_configure(&mut self) -> Result<(), StageError> {
        if let Some(path) = self.base.setting("path").and_then(|v| v.as_path()) {
            self.path = path.clone();
        }
        Ok(())
    }

    fn on_init(&mut self) -> Result<(), StageError> {
        let reader = open_reader(&self.path)
            .map_err(|e| StageError::permanent("cannot initialize file producer").with_source(e))?;
        self.reader = Some(reader);
        self.done = false;
        Ok(())
    }

    fn on_close(&mut self) -> Result<(), StageError> {
        self.reader = None;
        Ok(())
    }
}

impl Producer for FileProducer {
    fn has_more(&self) -> bool {
        !self.done && self.reader.is_some()
    }

    fn produce(&mut self) -> Result<Option<Record>, StageError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| StageError::permanent("file producer has no open file"))?;
        match self.format {
            WireFormat::Ascii => read_ascii_record(reader, &mut self.line, &mut self.done),
            WireFormat::Binary => read_binary_record(reader, &mut self.done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;
    use crate::stage::StageExt;
    use std::io::Write;

    fn init<P: Producer>(producer: &mut P) {
        producer.configure().unwrap();
        producer.init().unwrap();
    }

    #[test]
    fn test_text_producer_reads_lines() {
        let mut producer = TextProducer::from_string("1|2\nS:x\n");
        init(&mut producer);
        let first = producer.read_record().unwrap().unwrap();
        assert_eq!(first.values().len(), 2);
        let second = producer.read_record().unwrap().unwrap();
        assert_eq!(second.values()[0].as_str(), Some("x"));
        assert!(producer.read_record().unwrap().is_none());
        assert!(!producer.has_more());
    }

    #[test]
    fn test_text_producer_bad_line_is_temporary() {
        let mut producer = TextProducer::from_string("ß\n25\n");
        init(&mut producer);
        let err = producer.read_record().unwrap_err();
        assert!(!err.is_permanent());
        // the next line still parses
        let record = producer.read_record().unwrap().unwrap();
        assert_eq!(record.values()[0].as_i64(), Some(25));
    }

    #[test]
    fn test_text_producer_unterminated_line() {
        let mut producer = TextProducer::from_string("SC|HELP");
        init(&mut producer);
        let err = producer.read_record().unwrap_err();
        assert!(!err.is_permanent());
        assert!(producer.read_record().unwrap().is_none());
    }

    #[test]
    fn test_read_before_init_is_permanent_error() {
        let mut producer = TextProducer::from_string("1\n");
        let err = producer.read_record().unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_binary_producer_stream() {
        let mut bytes = Vec::new();
        for i in 0..3 {
            let record = Record::new(vec![Value::int64(i)]);
            bytes.extend_from_slice(&record.to_binary().unwrap());
        }
        let mut producer = BinaryProducer::new(Cursor::new(bytes));
        init(&mut producer);
        for i in 0..3 {
            let record = producer.read_record().unwrap().unwrap();
            assert_eq!(record.values()[0].as_i64(), Some(i));
        }
        assert!(producer.read_record().unwrap().is_none());
    }

    #[test]
    fn test_binary_producer_truncated_stream_is_permanent() {
        let record = Record::new(vec![Value::int64(5)]);
        let mut bytes = record.to_binary().unwrap();
        bytes.truncate(bytes.len() - 1);
        let mut producer = BinaryProducer::new(Cursor::new(bytes));
        init(&mut producer);
        let err = producer.read_record().unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_file_producer_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "25|7.5").unwrap();
        writeln!(file, "SC|ECHO|hi").unwrap();
        file.flush().unwrap();

        let mut producer = FileProducer::new(file.path(), WireFormat::Ascii);
        init(&mut producer);
        assert!(producer.has_more());
        let first = producer.read_record().unwrap().unwrap();
        assert_eq!(first.values()[1].as_f64(), Some(7.5));
        let second = producer.read_record().unwrap().unwrap();
        assert_eq!(second.values()[0].as_str(), Some("SC"));
        assert!(producer.read_record().unwrap().is_none());
        producer.close().unwrap();
    }

    #[test]
    fn test_file_producer_missing_file_fails_init() {
        let mut producer = FileProducer::new("/does/not/exist", WireFormat::Ascii);
        producer.configure().unwrap();
        assert!(producer.init().is_err());
    }
}
