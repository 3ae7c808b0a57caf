//! JSON text sink for decoded records, and the timestamp string convention:
//! `yyyy-mm-ddThh:mm:ss.uuuuuu`, UTC, microsecond precision.

use std::io::Write;

use chrono::{DateTime, NaiveDateTime};

use crate::decoder::{RecordValueHandler, ValueHandler, ValueParser};
use crate::dictionary::Dictionary;
use crate::errparse;
use crate::error::Result;
use crate::source::ByteSource;

/// Length of a convertible timestamp string.
pub const TIME_STR_LEN: usize = "yyyy-mm-ddThh:mm:ss.uuuuuu".len();

/// Formats nanoseconds since the Unix epoch, truncating to microseconds.
pub fn format_time(nanos: i64) -> String {
    DateTime::from_timestamp_nanos(nanos)
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

/// Parses a timestamp string of exactly the canonical shape; anything else
/// returns None.
pub fn parse_time(s: &str) -> Option<i64> {
    let bytes = s.as_bytes();
    if bytes.len() != TIME_STR_LEN {
        return None;
    }
    for (i, &b) in bytes.iter().enumerate() {
        let ok = match i {
            4 | 7 => b == b'-',
            10 => b == b'T',
            13 | 16 => b == b':',
            19 => b == b'.',
            _ => b.is_ascii_digit(),
        };
        if !ok {
            return None;
        }
    }
    let dt = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    dt.and_utc().timestamp_nanos_opt()
}

/// Prints each record as one line of JSON text. Dictionary references are
/// resolved through the live dictionary at output time.
pub struct JsonOutputHandler<W: Write> {
    out: W,
}

impl<W: Write> JsonOutputHandler<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<S: ByteSource, W: Write> RecordValueHandler<S> for JsonOutputHandler<W> {
    fn on_record_value(&mut self, source: &mut S, dict: &Dictionary, _len: u64) -> Result<()> {
        {
            let mut visitor = JsonVisitor {
                out: &mut self.out,
                dict,
                stack: vec![(Kind::Bare, 0)],
                buf: Vec::new(),
            };
            ValueParser::new(source, &mut visitor).value()?;
        }
        writeln!(self.out)?;
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Bare,
    Object,
    Array,
}

struct JsonVisitor<'a, W: Write> {
    out: &'a mut W,
    dict: &'a Dictionary,
    stack: Vec<(Kind, usize)>,
    buf: Vec<u8>,
}

impl<W: Write> JsonVisitor<'_, W> {
    fn top(&self) -> (Kind, usize) {
        *self.stack.last().unwrap_or(&(Kind::Bare, 0))
    }

    /// Object elements alternate key, value, key, value.
    fn at_key(&self) -> bool {
        let (kind, count) = self.top();
        kind == Kind::Object && count % 2 == 0
    }

    /// Writes the separator owed before the next element.
    fn sep(&mut self) -> Result<()> {
        let (kind, count) = self.top();
        match kind {
            Kind::Object if count == 0 => {}
            Kind::Object if count % 2 == 0 => write!(self.out, ",")?,
            Kind::Object => write!(self.out, ":")?,
            Kind::Array if count > 0 => write!(self.out, ",")?,
            _ => {}
        }
        Ok(())
    }

    fn bump(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.1 += 1;
        }
    }

    /// Non-string tokens cannot appear in key position.
    fn expect_value(&mut self, pos: u64, what: &str) -> Result<()> {
        if self.at_key() {
            return errparse!("{what} at {pos} in object key position");
        }
        Ok(())
    }

    fn scalar(&mut self, text: impl std::fmt::Display) -> Result<()> {
        self.sep()?;
        write!(self.out, "{text}")?;
        self.bump();
        Ok(())
    }

    fn string(&mut self, s: &str) -> Result<()> {
        self.sep()?;
        serde_json::to_writer(&mut *self.out, s)?;
        self.bump();
        Ok(())
    }
}

impl<W: Write> ValueHandler for JsonVisitor<'_, W> {
    fn on_null(&mut self, pos: u64) -> Result<()> {
        self.expect_value(pos, "null")?;
        self.scalar("null")
    }

    fn on_bool(&mut self, pos: u64, value: bool) -> Result<()> {
        self.expect_value(pos, "bool")?;
        self.scalar(value)
    }

    fn on_int(&mut self, pos: u64, value: i64) -> Result<()> {
        self.expect_value(pos, "int")?;
        self.scalar(value)
    }

    fn on_uint(&mut self, pos: u64, value: u64) -> Result<()> {
        self.expect_value(pos, "uint")?;
        self.scalar(value)
    }

    fn on_double(&mut self, pos: u64, value: f64) -> Result<()> {
        self.expect_value(pos, "double")?;
        if value.is_finite() {
            self.sep()?;
            serde_json::to_writer(&mut *self.out, &value)?;
            self.bump();
            Ok(())
        } else if value.is_nan() {
            self.scalar("NaN")
        } else if value > 0.0 {
            self.scalar("Infinity")
        } else {
            self.scalar("-Infinity")
        }
    }

    fn on_time(&mut self, pos: u64, nanos: i64) -> Result<()> {
        self.expect_value(pos, "timestamp")?;
        self.sep()?;
        write!(self.out, "\"{}\"", format_time(nanos))?;
        self.bump();
        Ok(())
    }

    fn on_string_start(&mut self, _pos: u64, len: u64) -> Result<()> {
        self.buf.clear();
        self.buf.reserve(len.min(1 << 16) as usize);
        Ok(())
    }

    fn on_string_fragment(&mut self, fragment: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(fragment);
        Ok(())
    }

    fn on_string_end(&mut self) -> Result<()> {
        let bytes = std::mem::take(&mut self.buf);
        let s = String::from_utf8(bytes)
            .map_err(|e| crate::Error::Parse(format!("string is not valid UTF-8: {e}")))?;
        self.string(&s)
    }

    fn on_dict_ref(&mut self, _pos: u64, index: u64) -> Result<()> {
        let s = self.dict.get(index)?.to_string();
        self.string(&s)
    }

    fn on_object_start(&mut self) -> Result<()> {
        self.sep()?;
        write!(self.out, "{{")?;
        self.stack.push((Kind::Object, 0));
        Ok(())
    }

    fn on_object_end(&mut self) -> Result<()> {
        self.stack.pop();
        write!(self.out, "}}")?;
        self.bump();
        Ok(())
    }

    fn on_array_start(&mut self) -> Result<()> {
        self.sep()?;
        write!(self.out, "[")?;
        self.stack.push((Kind::Array, 0));
        Ok(())
    }

    fn on_array_end(&mut self) -> Result<()> {
        self.stack.pop();
        write!(self.out, "]")?;
        self.bump();
        Ok(())
    }
}
