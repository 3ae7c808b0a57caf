//! Record search: a value handler that inspects each record for a pattern
//! match, a linear driver with before/after context output, and a bisect
//! driver that narrows a key-ordered stream by seek + resync before handing
//! off to a bounded linear scan.

use std::io::Write;

use crate::decoder::{
    DictRecordHandler, RecordParser, RecordValueHandler, Resync, ValueHandler, ValueParser,
};
use crate::dictionary::Dictionary;
use crate::errparse;
use crate::error::Result;
use crate::json::JsonOutputHandler;
use crate::source::{ByteSource, FileByteSource};

/// String match: substring by default, whole-value with `full_match`.
#[derive(Debug, Clone)]
pub struct StrPattern {
    pub text: String,
    pub full_match: bool,
}

/// What to look for and how to report it.
#[derive(Debug, Clone, Default)]
pub struct Pattern {
    /// Restrict value matches to values under this object key.
    pub key: Option<String>,
    pub int_value: Option<i64>,
    pub uint_value: Option<u64>,
    pub double_value: Option<f64>,
    pub str_value: Option<StrPattern>,
    /// Half-open interval of nanoseconds since the epoch.
    pub timestamp_range: Option<(i64, i64)>,
    /// Stop after this many matches.
    pub num_matches: Option<u64>,
    /// Stop once the cursor is this far past the most recent match.
    pub scan_suffix: Option<u64>,
    pub before_context: u32,
    pub after_context: u32,
    pub bisect: bool,
    /// Suppress output, print only the final count.
    pub count: bool,
}

impl Pattern {
    fn requires_key_match(&self) -> bool {
        self.key.is_some()
    }

    fn matches_key(&self, key: &str) -> bool {
        self.key.as_deref().map_or(true, |k| k == key)
    }

    fn matches_int(&self, value: i64) -> bool {
        self.int_value == Some(value)
    }

    fn matches_uint(&self, value: u64) -> bool {
        self.uint_value == Some(value)
    }

    fn matches_double(&self, value: f64) -> bool {
        self.double_value == Some(value)
    }

    fn matches_time(&self, nanos: i64) -> bool {
        self.timestamp_range
            .map_or(false, |(start, end)| nanos >= start && nanos < end)
    }

    fn matches_str(&self, s: &str) -> bool {
        match &self.str_value {
            None => false,
            Some(p) if p.full_match => p.text == s,
            Some(p) => s.contains(&p.text),
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Context {
    Bare,
    Object,
    Array,
}

struct Frame {
    context: Context,
    counter: usize,
    check_val: bool,
}

/// Inspects one record's value tree for a pattern match. Tracks a stack of
/// containers so it knows whether a string is an object key or a value, and
/// whether values at the current depth are eligible to match.
pub struct GrepHandler<'p> {
    pattern: &'p Pattern,
    matched: bool,
    precedes: bool,
    stack: Vec<Frame>,
    buf: Vec<u8>,
}

impl<'p> GrepHandler<'p> {
    pub fn new(pattern: &'p Pattern) -> Self {
        Self {
            pattern,
            matched: false,
            precedes: false,
            stack: Vec::new(),
            buf: Vec::new(),
        }
    }

    /// Whether the most recently inspected record matched.
    pub fn matched(&self) -> bool {
        self.matched
    }

    /// Whether the record's checkable ordering value strictly precedes the
    /// pattern. Drives the bisect narrowing step.
    pub fn record_precedes_pattern(&self) -> bool {
        self.precedes
    }

    fn top(&mut self) -> &mut Frame {
        self.stack.last_mut().expect("value callbacks outside a record")
    }

    fn is_key(&mut self) -> bool {
        let frame = self.top();
        frame.context == Context::Object && frame.counter % 2 == 0
    }

    fn bump(&mut self) {
        self.top().counter += 1;
    }

    fn check_val(&mut self) -> bool {
        self.top().check_val
    }

    /// A key string selects whether the following value is checked; a value
    /// string is matched against the string pattern.
    fn check_string(&mut self, s: &str) {
        if self.is_key() {
            let eligible = self.pattern.matches_key(s);
            self.top().check_val = eligible;
        } else if self.check_val() && self.pattern.matches_str(s) {
            self.matched = true;
        }
    }

    /// String content only matters for key selection or a string pattern.
    fn wants_string(&mut self) -> bool {
        self.pattern.str_value.is_some() || (self.pattern.requires_key_match() && self.is_key())
    }
}

impl<S: ByteSource> RecordValueHandler<S> for GrepHandler<'_> {
    fn on_record_value(&mut self, source: &mut S, dict: &Dictionary, _len: u64) -> Result<()> {
        self.stack.clear();
        self.stack.push(Frame {
            context: Context::Bare,
            counter: 0,
            check_val: !self.pattern.requires_key_match(),
        });
        self.matched = false;
        self.precedes = false;
        let mut visitor = GrepVisitor { state: self, dict };
        ValueParser::new(source, &mut visitor).value()
    }
}

struct GrepVisitor<'a, 'p> {
    state: &'a mut GrepHandler<'p>,
    dict: &'a Dictionary,
}

impl ValueHandler for GrepVisitor<'_, '_> {
    fn on_null(&mut self, _pos: u64) -> Result<()> {
        self.state.bump();
        Ok(())
    }

    fn on_bool(&mut self, _pos: u64, _value: bool) -> Result<()> {
        self.state.bump();
        Ok(())
    }

    fn on_int(&mut self, _pos: u64, value: i64) -> Result<()> {
        if self.state.check_val() {
            if self.state.pattern.matches_int(value) {
                self.state.matched = true;
            }
            if let Some(target) = self.state.pattern.int_value {
                if value < target {
                    self.state.precedes = true;
                }
            }
        }
        self.state.bump();
        Ok(())
    }

    fn on_uint(&mut self, _pos: u64, value: u64) -> Result<()> {
        if self.state.check_val() {
            if self.state.pattern.matches_uint(value) {
                self.state.matched = true;
            }
            if let Some(target) = self.state.pattern.uint_value {
                if value < target {
                    self.state.precedes = true;
                }
            }
        }
        self.state.bump();
        Ok(())
    }

    fn on_double(&mut self, _pos: u64, value: f64) -> Result<()> {
        if self.state.check_val() && self.state.pattern.matches_double(value) {
            self.state.matched = true;
        }
        self.state.bump();
        Ok(())
    }

    fn on_time(&mut self, _pos: u64, nanos: i64) -> Result<()> {
        if self.state.check_val() {
            if self.state.pattern.matches_time(nanos) {
                self.state.matched = true;
            }
            if let Some((start, _)) = self.state.pattern.timestamp_range {
                if nanos < start {
                    self.state.precedes = true;
                }
            }
        }
        self.state.bump();
        Ok(())
    }

    fn on_string_start(&mut self, _pos: u64, len: u64) -> Result<()> {
        if self.state.wants_string() {
            self.state.buf.clear();
            self.state.buf.reserve(len.min(1 << 16) as usize);
        }
        Ok(())
    }

    fn on_string_fragment(&mut self, fragment: &[u8]) -> Result<()> {
        if self.state.wants_string() {
            self.state.buf.extend_from_slice(fragment);
        }
        Ok(())
    }

    fn on_string_end(&mut self) -> Result<()> {
        let bytes = std::mem::take(&mut self.state.buf);
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| crate::Error::Parse(format!("string is not valid UTF-8: {e}")))?;
        self.state.check_string(s);
        self.state.bump();
        Ok(())
    }

    fn on_dict_ref(&mut self, _pos: u64, index: u64) -> Result<()> {
        let s = self.dict.get(index)?;
        self.state.check_string(s);
        self.state.bump();
        Ok(())
    }

    fn on_object_start(&mut self) -> Result<()> {
        // Keys inside a nested object must match on their own.
        self.state.stack.push(Frame {
            context: Context::Object,
            counter: 0,
            check_val: false,
        });
        Ok(())
    }

    fn on_object_end(&mut self) -> Result<()> {
        self.state.stack.pop();
        self.state.bump();
        Ok(())
    }

    fn on_array_start(&mut self) -> Result<()> {
        // Array elements inherit eligibility from the array itself.
        let check_val = self.state.check_val();
        self.state.stack.push(Frame {
            context: Context::Array,
            counter: 0,
            check_val,
        });
        Ok(())
    }

    fn on_array_end(&mut self) -> Result<()> {
        self.state.stack.pop();
        self.state.bump();
        Ok(())
    }
}

/// Linear scan. Emits matching records (with surrounding context) as JSON
/// lines, or just the count in count mode. Returns the number of matches.
pub fn grep<S: ByteSource, W: Write>(
    pattern: &Pattern,
    dict: &mut Dictionary,
    source: &mut S,
    out: &mut W,
) -> Result<u64> {
    let before_context = if pattern.count { 0 } else { pattern.before_context as usize };
    let after_context = if pattern.count { 0 } else { pattern.after_context as u64 };
    let num_matches = pattern.num_matches.unwrap_or(u64::MAX);
    let suffix_len = pattern.scan_suffix.unwrap_or(u64::MAX);

    let mut grep_handler = GrepHandler::new(pattern);
    // Start positions of the last before_context+1 records, oldest first.
    let mut pos_buffer: Vec<u64> = Vec::with_capacity(before_context + 1);
    let mut force: u64 = 0;
    let mut total: u64 = 0;
    let mut match_pos = source.pos();

    while source.peek()?.is_some() {
        if force == 0 {
            if total >= num_matches {
                break;
            }
            if source.pos() - match_pos > suffix_len {
                break;
            }
        }

        if pos_buffer.len() == before_context + 1 {
            pos_buffer.remove(0);
        }
        pos_buffer.push(source.pos());
        let proceeded = {
            let mut handler = DictRecordHandler::new(dict, &mut grep_handler);
            RecordParser::new(source, &mut handler).parse_until_value()?
        };
        if !proceeded {
            break;
        }

        if grep_handler.matched() && total < num_matches {
            match_pos = *pos_buffer.last().unwrap();
            total += 1;
            if pattern.count {
                continue;
            }
            // Rewind to the oldest retained record and replay the context
            // plus the match through the JSON sink.
            source.seek(pos_buffer[0])?;
            let mut json_out = JsonOutputHandler::new(&mut *out);
            while !pos_buffer.is_empty() {
                let mut handler = DictRecordHandler::new(dict, &mut json_out);
                RecordParser::new(source, &mut handler).parse_until_value()?;
                pos_buffer.pop();
            }
            force = after_context;
        } else if force > 0 {
            source.seek(*pos_buffer.last().unwrap())?;
            let mut json_out = JsonOutputHandler::new(&mut *out);
            let mut handler = DictRecordHandler::new(dict, &mut json_out);
            RecordParser::new(source, &mut handler).parse_until_value()?;
            force -= 1;
        }
    }

    if pattern.count {
        writeln!(out, "{total}")?;
    }
    Ok(total)
}

/// Narrow band the final linear scan is allowed to cover.
const SCAN_THRESHOLD: u64 = 256 * 1024;
/// How far before the narrowed start the scan begins, to be safe against
/// landing mid-record.
const PREFIX_AMOUNT: u64 = 512 * 1024;
/// The scan gives up this far past its last match. It must cover the whole
/// candidate band, so the first match cannot be missed.
const SUFFIX_AMOUNT: u64 = SCAN_THRESHOLD + PREFIX_AMOUNT + 266 * 1024;
const _: () = assert!(SUFFIX_AMOUNT > PREFIX_AMOUNT + SCAN_THRESHOLD);

fn seek_sync<S: ByteSource>(source: &mut S, dict: &mut Dictionary, pos: u64) -> Result<()> {
    source.seek(pos)?;
    if !Resync::new(source, dict).sync()? {
        return errparse!("failed to find a record at or after position {pos}");
    }
    Ok(())
}

/// Binary search over a stream whose checkable ordering value is
/// non-decreasing, then a bounded linear grep over the narrowed band.
pub fn bisect_grep<S: ByteSource, W: Write>(
    pattern: &Pattern,
    source: &mut S,
    out: &mut W,
) -> Result<u64> {
    let mut dict = Dictionary::new();
    let mut grep_handler = GrepHandler::new(pattern);
    let mut start: u64 = 0;
    let mut end: u64 = source.end_pos()?;

    while end > start {
        if end - start <= SCAN_THRESHOLD {
            seek_sync(source, &mut dict, start.saturating_sub(PREFIX_AMOUNT))?;
            let mut scan = pattern.clone();
            scan.scan_suffix = Some(SUFFIX_AMOUNT);
            return grep(&scan, &mut dict, source, out);
        }

        let mid = start + (end - start) / 2;
        seek_sync(source, &mut dict, mid)?;
        let record_begin = source.pos();
        let proceeded = {
            let mut handler = DictRecordHandler::new(&mut dict, &mut grep_handler);
            RecordParser::new(source, &mut handler).parse_until_value()?
        };
        if !proceeded {
            break;
        }
        if grep_handler.record_precedes_pattern() {
            start = record_begin;
        } else {
            end = record_begin;
        }
    }
    Ok(0)
}

/// CLI entry point: grep one file (or stdin for `-`).
pub fn grep_file<W: Write>(pattern: &Pattern, fname: &str, out: &mut W) -> Result<u64> {
    let mut source = FileByteSource::open(fname, false)?;
    if pattern.bisect {
        bisect_grep(pattern, &mut source, out)
    } else {
        let mut dict = Dictionary::new();
        grep(pattern, &mut dict, &mut source, out)
    }
}
