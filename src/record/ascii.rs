//! Human-editable ascii wire form of a record.
//!
//! A record is a sequence of fields separated by `|` and terminated by a
//! newline. Whitespace around field bodies is ignored. A field may carry an
//! explicit type prefix `I:`, `F:`, `S:` or `B:` (integer, float, string,
//! blob), optionally with an `x` modifier (`Bx:`) marking the body as an
//! even-length hex string that is decoded before interpretation, the
//! mechanism for embedding bytes unsafe for plain text. A record may start
//! with a flag section between `[` and `]`:
//!
//! - `P` + optional `-` + exactly two digits: priority
//! - `T` + digits + `ms` or `s`: release time relative to pipeline start
//!
//! Unprefixed fields are type-autodetected by classifying every byte;
//! a single invalid byte fails the whole record with that byte's offset.
//!
//! Examples:
//!
//! ```text
//! 25|7.3|Hello
//! [P-05]I:3|F:2.0|S:Some String
//! S: 12345678 | 100 | F: 100 | Bx: F0DD35007E | Sx: 48454C4C4F
//! [T1sP99]S:Very High Priority, executed after 1 second
//! ```

use crate::error::{PipeError, Result};
use crate::record::syntax::{note, Syntax, SyntaxKind};
use crate::record::value::{Value, ValueKind};
use crate::record::{Record, PRIORITY_HIGHEST, PRIORITY_LOWEST};

/// Byte classification for type autodetection:
/// 8 = may be part of a decimal number (string otherwise),
/// 9 = may be part of a floating point (string otherwise),
/// 10 = decimal / floating point digit,
/// 30 = valid string byte,
/// 40 = invalid for every type.
#[rustfmt::skip]
const AUTODETECT: [u8; 256] = [
    40, 40, 40, 40, 40, 40, 40, 40, // 00 - 07
    40, 30, 40, 40, 40, 40, 40, 40, // 08 - 0F
    40, 40, 40, 40, 40, 40, 40, 40, // 10 - 17
    40, 40, 40, 40, 40, 40, 40, 40, // 18 - 1F
    30, 30, 30, 30, 30, 30, 30, 30, // 20 - 27
    30, 30, 30,  8, 30,  8,  9, 30, // 28 - 2F
    10, 10, 10, 10, 10, 10, 10, 10, // 30 - 37
    10, 10, 30, 30, 30, 30, 30, 30, // 38 - 3F
    30, 30, 30, 30, 30,  9, 30, 30, // 40 - 47
    30, 30, 30, 30, 30, 30, 30, 30, // 48 - 4F
    30, 30, 30, 30, 30, 30, 30, 30, // 50 - 57
    30, 30, 30, 30, 30, 30, 30, 30, // 58 - 5F
    30, 30, 30, 30, 30,  9, 30, 30, // 60 - 67
    30, 30, 30, 30, 30, 30, 30, 30, // 68 - 6F
    30, 30, 30, 30, 30, 30, 30, 30, // 70 - 77
    30, 30, 30, 30, 40, 30, 30, 40, // 78 - 7F
    40, 40, 40, 40, 40, 40, 40, 40, // 80 - 87
    40, 40, 40, 40, 40, 40, 40, 40, // 88 - 8F
    40, 40, 40, 40, 40, 40, 40, 40, // 90 - 97
    40, 40, 40, 40, 40, 40, 40, 40, // 98 - 9F
    40, 40, 40, 40, 40, 40, 40, 40, // A0 - A7
    40, 40, 40, 40, 40, 40, 40, 40, // A8 - AF
    40, 40, 40, 40, 40, 40, 40, 40, // B0 - B7
    40, 40, 40, 40, 40, 40, 40, 40, // B8 - BF
    40, 40, 40, 40, 40, 40, 40, 40, // C0 - C7
    40, 40, 40, 40, 40, 40, 40, 40, // C8 - CF
    40, 40, 40, 40, 40, 40, 40, 40, // D0 - D7
    40, 40, 40, 40, 40, 40, 40, 40, // D8 - DF
    40, 40, 40, 40, 40, 40, 40, 40, // E0 - E7
    40, 40, 40, 40, 40, 40, 40, 40, // E8 - EF
    40, 40, 40, 40, 40, 40, 40, 40, // F0 - F7
    40, 40, 40, 40, 40, 40, 40, 40, // F8 - FF
];

const HEX_TABLE: &[u8; 16] = b"0123456789ABCDEF";

/// Decode one ascii record from a single line. The line may carry its
/// trailing newline or not; input past an embedded newline is ignored.
pub fn decode_line(line: &[u8], syntax: Option<&mut Vec<Syntax>>) -> Result<Record> {
    let mut parser = Parser {
        line,
        pos: 0,
        buf: Vec::with_capacity(64),
        kind: None,
        is_hex: false,
        values: Vec::new(),
        priority: 0,
        time: None,
        syntax,
    };
    parser.run()?;
    Ok(Record::from_wire(parser.values, parser.priority, parser.time))
}

/// Encode the record into its ascii form, optionally newline-terminated.
pub fn encode_record(record: &Record, newline: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    write_flags(record, &mut out);

    let mut first = true;
    for value in record.values() {
        if !first {
            out.extend_from_slice(b" | ");
        }
        first = false;

        let body = value.ascii_bytes();
        if value.must_write_hex() {
            out.push(value.kind().type_char());
            out.extend_from_slice(b"x: ");
            for b in body {
                out.push(HEX_TABLE[(b >> 4) as usize]);
                out.push(HEX_TABLE[(b & 0x0F) as usize]);
            }
        } else {
            if needs_type_prefix(value, &body) {
                out.push(value.kind().type_char());
                out.push(b':');
            }
            out.extend_from_slice(&body);
        }
    }

    if newline {
        out.push(b'\n');
    }
    out
}

/// A plain string body consisting only of digit-class bytes would re-detect
/// as a number, so such fields carry an explicit `S:` prefix.
fn needs_type_prefix(value: &Value, body: &[u8]) -> bool {
    if !matches!(value, Value::Str { .. }) {
        return false;
    }
    let mut res = 0u8;
    for &b in body {
        res = res.max(AUTODETECT[b as usize]);
    }
    res == 10
}

fn write_flags(record: &Record, out: &mut Vec<u8>) {
    if record.priority() == 0 && record.time().is_none() {
        return;
    }
    out.extend_from_slice(b"[ ");
    if record.priority() != 0 {
        out.push(b'P');
        if record.priority() < 0 {
            out.push(b'-');
        }
        let abs = record.priority().unsigned_abs();
        out.push(b'0' + abs / 10);
        out.push(b'0' + abs % 10);
        out.push(b' ');
    }
    if let Some(time) = record.time() {
        out.push(b'T');
        let in_sec = time % 1000 == 0;
        let shown = if in_sec { time / 1000 } else { time };
        out.extend_from_slice(shown.to_string().as_bytes());
        if !in_sec {
            out.push(b'm');
        }
        out.push(b's');
        out.push(b' ');
    }
    out.extend_from_slice(b"] ");
}

struct Parser<'a, 'b> {
    line: &'a [u8],
    /// Position of the byte currently being handled.
    pos: usize,
    buf: Vec<u8>,
    kind: Option<ValueKind>,
    is_hex: bool,
    values: Vec<Value>,
    priority: i8,
    time: Option<u32>,
    syntax: Option<&'b mut Vec<Syntax>>,
}

impl Parser<'_, '_> {
    fn run(&mut self) -> Result<()> {
        loop {
            let b = self.current();
            match b {
                b'\n' => {
                    let sole = self.values.is_empty();
                    self.parse_value(sole)?;
                    return Ok(());
                }
                b'|' => {
                    self.parse_value(false)?;
                    note(&mut self.syntax, SyntaxKind::FieldDelim, self.pos);
                    self.kind = None;
                    self.is_hex = false;
                    self.buf.clear();
                }
                b'[' if self.pos == 0 => self.parse_flags()?,
                b':' if self.kind.is_none() && (self.buf.len() == 1 || self.buf.len() == 2) => {
                    self.parse_type_ident()?;
                }
                // leading whitespace is skipped, inner whitespace kept
                b' ' if self.buf.is_empty() => {}
                _ => self.buf.push(b),
            }
            self.pos += 1;
        }
    }

    /// Byte at the cursor; running off the end acts as the terminator.
    fn current(&self) -> u8 {
        if self.pos < self.line.len() {
            self.line[self.pos]
        } else {
            b'\n'
        }
    }

    fn advance(&mut self) -> Result<u8> {
        self.pos += 1;
        let b = self.current();
        if b == b'\n' && self.pos >= self.line.len() {
            return Err(PipeError::format(self.pos, "unexpected end of input"));
        }
        Ok(b)
    }

    fn parse_flags(&mut self) -> Result<()> {
        note(&mut self.syntax, SyntaxKind::Flags, self.pos);
        loop {
            let b = self.advance()?;
            match b {
                b' ' => {}
                b']' => {
                    note(&mut self.syntax, SyntaxKind::Flags, self.pos);
                    return Ok(());
                }
                b'P' | b'p' => self.parse_flag_priority()?,
                b'T' | b't' => self.parse_flag_time()?,
                _ => {
                    return Err(PipeError::format(
                        self.pos,
                        format!("invalid character 0x{:02X} in flag list", b),
                    ))
                }
            }
        }
    }

    fn parse_flag_priority(&mut self) -> Result<()> {
        note(&mut self.syntax, SyntaxKind::FlagPriority, self.pos);
        let mut b = self.advance()?;
        let negative = b == b'-';
        if negative {
            b = self.advance()?;
        }
        if !b.is_ascii_digit() {
            return Err(PipeError::format(
                self.pos,
                format!("invalid character 0x{:02X} in priority", b),
            ));
        }
        let mut res = ((b - b'0') as i16) * 10;
        b = self.advance()?;
        if !b.is_ascii_digit() {
            return Err(PipeError::format(
                self.pos,
                format!("invalid character 0x{:02X} in priority", b),
            ));
        }
        res += (b - b'0') as i16;
        if negative {
            res = -res;
        }
        tracing::trace!(priority = res, "parsed priority flag");
        if res < PRIORITY_LOWEST as i16 || res > PRIORITY_HIGHEST as i16 {
            return Err(PipeError::format(
                self.pos,
                format!(
                    "priority is out of range: {} not between {} and {}",
                    res, PRIORITY_LOWEST, PRIORITY_HIGHEST
                ),
            ));
        }
        self.priority = res as i8;
        Ok(())
    }

    fn parse_flag_time(&mut self) -> Result<()> {
        note(&mut self.syntax, SyntaxKind::FlagTime, self.pos);
        let mut res: u64 = 0;
        loop {
            let b = self.advance()?;
            if b == b'm' {
                let b2 = self.advance()?;
                if b2 != b's' {
                    return Err(PipeError::format(
                        self.pos,
                        format!("invalid character 0x{:02X} in time", b2),
                    ));
                }
                break;
            }
            if b == b's' {
                res = res.saturating_mul(1000);
                break;
            }
            if !b.is_ascii_digit() {
                return Err(PipeError::format(
                    self.pos,
                    format!("invalid character 0x{:02X} in time", b),
                ));
            }
            res = res.saturating_mul(10).saturating_add((b - b'0') as u64);
        }
        tracing::trace!(time_ms = res, "parsed time flag");
        if res > u32::MAX as u64 {
            return Err(PipeError::format(
                self.pos,
                format!("time is out of range: {} not between 0 and 0xFFFFFFFF", res),
            ));
        }
        self.time = Some(res as u32);
        Ok(())
    }

    fn parse_type_ident(&mut self) -> Result<()> {
        let start = self.pos - self.buf.len();
        note(&mut self.syntax, SyntaxKind::TypeIdent, start);
        let kind = ValueKind::for_type_char(self.buf[0]).ok_or_else(|| {
            PipeError::format(
                start,
                format!("invalid type identifier: 0x{:02X}", self.buf[0]),
            )
        })?;
        if self.buf.len() == 2 {
            if self.buf[1] != b'x' {
                return Err(PipeError::format(
                    self.pos - 1,
                    format!("invalid type modifier: 0x{:02X}", self.buf[1]),
                ));
            }
            self.is_hex = true;
        } else {
            self.is_hex = false;
        }
        self.kind = Some(kind);
        self.buf.clear();
        Ok(())
    }

    fn parse_value(&mut self, ignore_if_empty: bool) -> Result<()> {
        let orig_len = self.buf.len();
        let mut len = orig_len;
        while len > 0 && self.buf[len - 1] == b' ' {
            len -= 1;
        }

        if ignore_if_empty && len == 0 {
            return Ok(());
        }

        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                self.is_hex = false;
                self.detect_kind(len, orig_len)?
            }
        };

        let start = self.pos - orig_len;
        // a blob annotation has precedence over a plain hex one
        if self.is_hex && kind != ValueKind::Blob {
            note(&mut self.syntax, SyntaxKind::HexField, start);
        } else {
            let field = match kind {
                ValueKind::Int8 | ValueKind::Int32 | ValueKind::Int64 => SyntaxKind::IntField,
                ValueKind::Float32 | ValueKind::Float64 => SyntaxKind::FloatField,
                ValueKind::UtfString | ValueKind::NullTermString => SyntaxKind::StringField,
                ValueKind::Blob => SyntaxKind::BlobField,
            };
            note(&mut self.syntax, field, start);
        }

        let value = if self.is_hex {
            let decoded = self.decode_hex(len, orig_len)?;
            Value::read_ascii(kind, &decoded).map_err(|m| PipeError::format(start, m))?
        } else {
            Value::read_ascii(kind, &self.buf[..len]).map_err(|m| PipeError::format(start, m))?
        };
        self.values.push(value);
        Ok(())
    }

    fn decode_hex(&self, len: usize, orig_len: usize) -> Result<Vec<u8>> {
        let base = self.pos - orig_len;
        let mut out = Vec::with_capacity(len / 2);
        let mut i = 0usize;
        while i < len {
            let d1 = hex_digit(self.buf[i]);
            i += 1;
            let at = base + i;
            if i == len {
                return Err(PipeError::format(
                    at - 1,
                    format!(
                        "broken hexadecimal data: length must be multiple of two but is {}",
                        len
                    ),
                ));
            }
            let d2 = hex_digit(self.buf[i]);
            i += 1;
            let d1 = d1.ok_or_else(|| {
                PipeError::format(
                    at - 1,
                    format!(
                        "broken hexadecimal data: invalid character: 0x{:02X}",
                        self.buf[i - 2]
                    ),
                )
            })?;
            let d2 = d2.ok_or_else(|| {
                PipeError::format(
                    at,
                    format!(
                        "broken hexadecimal data: invalid character: 0x{:02X}",
                        self.buf[i - 1]
                    ),
                )
            })?;
            out.push(d1 << 4 | d2);
        }
        Ok(out)
    }

    /// Returns the most specific kind that can read the trimmed buffer.
    fn detect_kind(&mut self, len: usize, orig_len: usize) -> Result<ValueKind> {
        let mut res = 0u8;
        let mut float_marker = false;
        for i in 0..len {
            let class = AUTODETECT[self.buf[i] as usize];
            if class == 9 {
                float_marker = true;
            }
            res = res.max(class);
            if res == 40 {
                return Err(PipeError::format(
                    self.pos - orig_len + i,
                    format!(
                        "invalid character for any known data type: 0x{:02X}",
                        self.buf[i]
                    ),
                ));
            }
        }
        // empty and incomplete-number fields fall back to a plain string
        Ok(match res {
            10 => {
                if float_marker {
                    ValueKind::Float64
                } else {
                    ValueKind::Int64
                }
            }
            _ => ValueKind::NullTermString,
        })
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
