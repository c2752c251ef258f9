//! Binary wire form of a record.
//!
//! Layout (big-endian throughout): a 32-bit header whose top 5 bits are
//! flags (bit 0: priority byte present, bit 1: release-time present, bits
//! 2–4 reserved and must be zero), next 3 bits the field count minus one,
//! and low 24 bits eight 3-bit type tags, tag *i* at bits `[3i, 3i+2]`.
//! Tags beyond the field count are ignored. The optional 1-byte signed
//! priority and 4-byte unsigned release time (milliseconds) follow the
//! header, then the field contents back to back, each using its own width.

use crate::error::{PipeError, Result};
use crate::record::syntax::{note, Syntax, SyntaxKind};
use crate::record::value::{Value, ValueKind};
use crate::record::{Record, PRIORITY_HIGHEST, PRIORITY_LOWEST};
use std::io::Read;

const FLAG_PRIORITY: u32 = 0x01;
const FLAG_TIME: u32 = 0x02;
const FLAG_RESERVED_MASK: u32 = 0x1C;

/// Decode one record, or `None` if the input is already exhausted.
///
/// The distinction lets stream producers tell a clean end of input apart
/// from a record truncated mid-way, which is a format error.
pub fn decode_record_opt<R: Read>(
    r: &mut R,
    mut syntax: Option<&mut Vec<Syntax>>,
) -> Result<Option<Record>> {
    let mut header = [0u8; 4];
    let mut filled = 0usize;
    while filled < header.len() {
        let n = r.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(PipeError::format(filled, "unexpected end of input"));
        }
        filled += n;
    }
    decode_after_header(u32::from_be_bytes(header), r, syntax.take()).map(Some)
}

/// Decode one record from the reader.
pub fn decode_record<R: Read>(r: &mut R, syntax: Option<&mut Vec<Syntax>>) -> Result<Record> {
    match decode_record_opt(r, syntax)? {
        Some(record) => Ok(record),
        None => Err(PipeError::format(0, "unexpected end of input")),
    }
}

fn decode_after_header<R: Read>(
    header: u32,
    r: &mut R,
    mut syntax: Option<&mut Vec<Syntax>>,
) -> Result<Record> {
    tracing::trace!(header = format_args!("0x{:08X}", header), "decoding binary record");
    let flags = header >> 27 & 0x1F;
    let count = (header >> 24 & 0x07) as usize + 1;
    if flags & FLAG_RESERVED_MASK != 0 {
        return Err(PipeError::format(
            0,
            format!("reserved flags have been set: 0x{:02X}", flags),
        ));
    }
    note(&mut syntax, SyntaxKind::Flags, 0);
    note(&mut syntax, SyntaxKind::TypeIdent, 1);
    let mut pos = 4usize;

    let mut priority = 0i8;
    if flags & FLAG_PRIORITY != 0 {
        let byte = read_at(r, pos, 1)?[0] as i8;
        if !(PRIORITY_LOWEST..=PRIORITY_HIGHEST).contains(&byte) {
            return Err(PipeError::format(
                pos,
                format!(
                    "priority is out of range: {} not between {} and {}",
                    byte, PRIORITY_LOWEST, PRIORITY_HIGHEST
                ),
            ));
        }
        note(&mut syntax, SyntaxKind::FlagPriority, pos);
        pos += 1;
        priority = byte;
    }

    let mut time = None;
    if flags & FLAG_TIME != 0 {
        note(&mut syntax, SyntaxKind::FlagTime, pos);
        let bytes = read_at(r, pos, 4)?;
        time = Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
        pos += 4;
    }

    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        let tag = (header >> (i * 3) & 0x07) as u8;
        // all eight 3-bit patterns are valid tags
        let kind = match ValueKind::from_tag(tag) {
            Some(kind) => kind,
            None => return Err(PipeError::format(pos, format!("unknown type tag {}", tag))),
        };
        note(&mut syntax, field_syntax(kind), pos);
        let (value, consumed) = Value::read_binary(kind, r)
            .map_err(|e| map_field_error(e, pos))?;
        pos += consumed;
        values.push(value);
    }

    Ok(Record::from_wire(values, priority, time))
}

/// Encode the record into its binary form.
///
/// Fails for records holding no values or more than eight.
pub fn encode_record(record: &Record) -> Result<Vec<u8>> {
    let values = record.values();
    if values.is_empty() {
        return Err(PipeError::Encode(
            "cannot write binary data without any values assigned to it".into(),
        ));
    }
    if values.len() > 8 {
        return Err(PipeError::Encode(
            "cannot handle more than 8 values for binary data".into(),
        ));
    }

    let mut flags = 0u32;
    if record.priority() != 0 {
        flags |= FLAG_PRIORITY;
    }
    if record.time().is_some() {
        flags |= FLAG_TIME;
    }
    let mut header = (flags & 0x1F) << 27 | ((values.len() as u32 - 1) & 0x07) << 24;
    for (i, value) in values.iter().enumerate() {
        header |= (value.kind().tag() as u32 & 0x07) << (i * 3);
    }

    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&header.to_be_bytes());
    if record.priority() != 0 {
        out.push(record.priority() as u8);
    }
    if let Some(time) = record.time() {
        out.extend_from_slice(&time.to_be_bytes());
    }
    for value in values {
        value.write_binary(&mut out)?;
    }
    Ok(out)
}

fn field_syntax(kind: ValueKind) -> SyntaxKind {
    match kind {
        ValueKind::Int8 | ValueKind::Int32 | ValueKind::Int64 => SyntaxKind::IntField,
        ValueKind::Float32 | ValueKind::Float64 => SyntaxKind::FloatField,
        ValueKind::UtfString | ValueKind::NullTermString => SyntaxKind::StringField,
        ValueKind::Blob => SyntaxKind::BlobField,
    }
}

fn read_at<R: Read>(r: &mut R, pos: usize, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(|e| map_field_error(e, pos))?;
    Ok(buf)
}

fn map_field_error(e: std::io::Error, pos: usize) -> PipeError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => PipeError::format(pos, "unexpected end of input"),
        std::io::ErrorKind::InvalidData => PipeError::format(pos, e.to_string()),
        _ => PipeError::Io(e),
    }
}
