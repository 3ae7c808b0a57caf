//! Stream statistics: frame counts, value counts, and a size histogram for
//! the integer varints, with an optional dump of dictionary additions.

use std::io::Write;

use itertools::Itertools as _;

use crate::decoder::{RecordHandler, RecordParser, ValueHandler, ValueParser};
use crate::error::Result;
use crate::source::{ByteSource, FileByteSource};
use crate::varint;

#[derive(Debug, Clone, Copy, Default)]
pub struct StatsOptions {
    /// Print every string as it is appended to the dictionary.
    pub dict_dump: bool,

    /// Print the integer varint-size histogram.
    pub int_histogram: bool,
}

#[derive(Debug, Default)]
pub struct StreamStats {
    pub records: u64,
    pub headers: u64,
    pub dict_clears: u64,
    pub dict_adds: u64,
    pub values: u64,
    pub doubles: u64,
    /// Count of integers by encoded varint length (index = length - 1).
    pub int_sizes: [u64; varint::MAX_LEN],
    pub total_read: u64,
}

impl StreamStats {
    pub fn total_ints(&self) -> u64 {
        self.int_sizes.iter().sum()
    }
}

struct StatsHandler<'a, W: Write> {
    options: StatsOptions,
    out: &'a mut W,
    stats: StreamStats,
    accum: Vec<u8>,
}

impl<'a, W: Write> StatsHandler<'a, W> {
    fn new(options: StatsOptions, out: &'a mut W) -> Self {
        Self {
            options,
            out,
            stats: StreamStats::default(),
            accum: Vec::new(),
        }
    }
}

impl<S: ByteSource, W: Write> RecordHandler<S> for StatsHandler<'_, W> {
    fn on_record_start(&mut self, _pos: u64) -> Result<()> {
        self.stats.records += 1;
        Ok(())
    }

    fn on_header(&mut self, _version: u64) -> Result<()> {
        self.stats.headers += 1;
        Ok(())
    }

    fn on_dict_clear(&mut self, _pos: u64) -> Result<()> {
        self.stats.dict_clears += 1;
        if self.options.dict_dump {
            writeln!(self.out, "Dictionary cleared:")?;
        }
        Ok(())
    }

    fn on_dict_add_start(&mut self, _pos: u64, _backref: u64) -> Result<()> {
        if self.options.dict_dump {
            writeln!(self.out, "Dictionary appended:")?;
        }
        Ok(())
    }

    fn on_string_start(&mut self, _pos: u64, _len: u64) -> Result<()> {
        self.accum.clear();
        Ok(())
    }

    fn on_string_fragment(&mut self, fragment: &[u8]) -> Result<()> {
        if self.options.dict_dump {
            self.accum.extend_from_slice(fragment);
        }
        Ok(())
    }

    fn on_string_end(&mut self) -> Result<()> {
        self.stats.dict_adds += 1;
        if self.options.dict_dump {
            writeln!(self.out, "\t{}", String::from_utf8_lossy(&self.accum))?;
        }
        Ok(())
    }

    fn on_value(&mut self, _pos: u64, _backref: u64, _len: u64, source: &mut S) -> Result<()> {
        self.stats.values += 1;
        let mut visitor = ValueSizeVisitor { stats: &mut self.stats };
        ValueParser::new(source, &mut visitor).value()
    }
}

/// Counts doubles and buckets integers by their encoded width.
struct ValueSizeVisitor<'a> {
    stats: &'a mut StreamStats,
}

impl ValueHandler for ValueSizeVisitor<'_> {
    fn on_int(&mut self, _pos: u64, value: i64) -> Result<()> {
        self.stats.int_sizes[varint::encoded_len_i64(value) - 1] += 1;
        Ok(())
    }

    fn on_uint(&mut self, _pos: u64, value: u64) -> Result<()> {
        self.stats.int_sizes[varint::encoded_len(value) - 1] += 1;
        Ok(())
    }

    fn on_double(&mut self, _pos: u64, _value: f64) -> Result<()> {
        self.stats.doubles += 1;
        Ok(())
    }
}

/// Collects statistics over one source, consuming it to the end.
pub fn collect<S: ByteSource, W: Write>(
    source: &mut S,
    options: StatsOptions,
    out: &mut W,
) -> (StreamStats, Result<()>) {
    let mut handler = StatsHandler::new(options, out);
    let result = RecordParser::new(source, &mut handler).parse_stream();
    handler.stats.total_read = source.pos();
    (handler.stats, result)
}

/// Runs stats over one file (or stdin for `-`) and prints the report. A
/// parse error still reports what was read before it, then propagates.
pub fn stats_file<W: Write>(fname: &str, options: StatsOptions, out: &mut W) -> Result<()> {
    let mut source = FileByteSource::open(fname, false)?;
    let (stats, result) = collect(&mut source, options, out);
    if let Err(e) = &result {
        writeln!(out, "{e}")?;
    }
    report(&stats, source.name(), options, out)?;
    result
}

/// Prints the report in the fixed layout.
pub fn report<W: Write>(
    stats: &StreamStats,
    name: &str,
    options: StatsOptions,
    out: &mut W,
) -> Result<()> {
    writeln!(out, "Stats for {name}:")?;
    writeln!(out, "  Total read: {}", pretty_bytes(stats.total_read))?;
    writeln!(out, "  Records: {}", commafy(stats.records))?;
    writeln!(out, "     Version headers: {}", commafy(stats.headers))?;
    writeln!(out, "     Dictionary resets: {}", commafy(stats.dict_clears))?;
    writeln!(out, "     Dictionary adds: {}", commafy(stats.dict_adds))?;
    writeln!(out, "     Values: {}", commafy(stats.values))?;
    writeln!(out, "  Values:")?;
    writeln!(out, "     Doubles: {}", commafy(stats.doubles))?;
    let total_ints = stats.total_ints();
    writeln!(out, "     Integers: {}", commafy(total_ints))?;
    if options.int_histogram && total_ints > 0 {
        writeln!(out, "       By length:")?;
        for (i, &count) in stats.int_sizes.iter().enumerate() {
            if count > 0 {
                writeln!(
                    out,
                    "        {:3}: {} ({}%)",
                    i + 1,
                    commafy(count),
                    100 * count / total_ints
                )?;
            }
        }
    }
    Ok(())
}

/// Thousands-separated decimal.
fn commafy(value: u64) -> String {
    let digits = value.to_string();
    digits
        .as_bytes()
        .rchunks(3)
        .rev()
        .map(|chunk| std::str::from_utf8(chunk).unwrap())
        .join(",")
}

const BYTE_SUFFIXES: [&str; 7] = [" bytes", "K", "M", "G", "T", "P", "E"];

/// Power-of-1024 human size, one decimal unless whole.
fn pretty_bytes(bytes: u64) -> String {
    let mut count = bytes as f64;
    let mut suffix = 0;
    while count >= 1024.0 && suffix < BYTE_SUFFIXES.len() - 1 {
        suffix += 1;
        count /= 1024.0;
    }
    if count.fract() == 0.0 {
        format!("{}{}", count as u64, BYTE_SUFFIXES[suffix])
    } else {
        format!("{count:.1}{}", BYTE_SUFFIXES[suffix])
    }
}
