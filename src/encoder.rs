//! Record encoder. Each record is built in a scratch buffer and committed as
//! an optional dict-add frame followed by one length-prefixed value frame, so
//! an aborted record never leaves partial bytes in the output.

use std::collections::HashMap;
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::dictionary::{Dictionary, InternCache, StringMode};
use crate::error::Result;
use crate::format;
use crate::varint;

/// Encoder tuning knobs.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Soft cap on dictionary entries; crossing it emits a dict-clear before
    /// the next record (default: 250,000).
    pub dict_cap: usize,

    /// Maximum entries in the admission cache (default: 64 Ki).
    pub hash_cap: usize,

    /// Occurrences a string must exceed before admission (default: 10).
    pub intern_threshold: u64,

    /// Minimum admissible string length in bytes (default: 4).
    pub intern_min_len: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            dict_cap: 250_000,
            hash_cap: 64 * 1024,
            intern_threshold: 10,
            intern_min_len: 4,
        }
    }
}

impl EncoderConfig {
    /// Set the dictionary soft cap
    pub fn dict_cap(mut self, cap: usize) -> Self {
        self.dict_cap = cap;
        self
    }

    /// Set the admission cache entry cap
    pub fn hash_cap(mut self, cap: usize) -> Self {
        self.hash_cap = cap;
        self
    }

    /// Set the admission hit-count threshold
    pub fn intern_threshold(mut self, threshold: u64) -> Self {
        self.intern_threshold = threshold;
        self
    }

    /// Set the minimum admissible string length
    pub fn intern_min_len(mut self, len: usize) -> Self {
        self.intern_min_len = len;
        self
    }
}

/// Streaming encoder over any byte sink.
///
/// The header frame is written at construction, so even a stream with zero
/// records is well-formed. The first dict-clear is emitted lazily before the
/// first record's frames.
pub struct Encoder<W: Write> {
    out: W,
    pos: u64,
    dict: Dictionary,
    cache: InternCache,
    config: EncoderConfig,
    scratch: Vec<u8>,
    pending: Vec<String>,
    records: u64,
}

impl<W: Write> Encoder<W> {
    pub fn new(out: W) -> Result<Self> {
        Self::with_config(out, EncoderConfig::default())
    }

    pub fn with_config(out: W, config: EncoderConfig) -> Result<Self> {
        let cache = InternCache::new(config.intern_threshold, config.intern_min_len, config.hash_cap);
        let mut encoder = Self {
            out,
            pos: 0,
            dict: Dictionary::new(),
            cache,
            config,
            scratch: Vec::new(),
            pending: Vec::new(),
            records: 0,
        };
        let mut header = vec![format::HEADER];
        varint::write_u64(&mut header, format::VERSION);
        header.extend_from_slice(format::MAGIC);
        encoder.emit(&header)?;
        Ok(encoder)
    }

    /// Encodes one record. The callback drives an [`AuWriter`] to describe
    /// the value; on success the record is committed to the output, on error
    /// nothing is written and the dictionary state is rolled back.
    pub fn encode<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AuWriter<'_>) -> Result<()>,
    {
        if self.dict.last_clear().is_none() || self.dict.size() >= self.config.dict_cap {
            self.emit_clear()?;
        }

        self.scratch.clear();
        self.pending.clear();
        let result = f(&mut AuWriter {
            body: &mut self.scratch,
            dict: &mut self.dict,
            cache: &mut self.cache,
            pending: &mut self.pending,
        });
        if let Err(e) = result {
            self.dict.truncate_last(self.pending.len());
            for s in self.pending.drain(..) {
                self.cache.demote(&s);
            }
            self.scratch.clear();
            return Err(e);
        }
        self.commit()
    }

    /// Writes the optional end frame. The stream stays valid for further
    /// records (a header-then-records tail is legal after an end marker).
    pub fn end(&mut self) -> Result<()> {
        self.emit(&[format::END])
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Emits a dict-clear frame, re-basing dictionary indices at 0.
    pub fn clear_dict(&mut self) -> Result<()> {
        self.emit_clear()
    }

    /// Bytes written so far.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Per-encoder statistics, string-keyed.
    pub fn stats(&self) -> HashMap<&'static str, u64> {
        HashMap::from([
            ("Records", self.records),
            ("DictSize", self.dict.size() as u64),
            ("HashSize", self.cache.len() as u64),
            ("HashBucketCount", self.cache.capacity() as u64),
            ("CacheSize", self.cache.cached_bytes() as u64),
        ])
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    fn emit_clear(&mut self) -> Result<()> {
        let pos = self.pos;
        let mut frame = vec![format::DICT_CLEAR];
        varint::write_u64(&mut frame, self.dict.last_clear().unwrap_or(0));
        self.emit(&frame)?;
        self.dict.note_clear(pos);
        self.cache.clear();
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let anchor = |dict: &Dictionary| {
            dict.anchor()
                .expect("dictionary is anchored by the clear preceding the first record")
        };

        if !self.pending.is_empty() {
            let pos = self.pos;
            let mut frame = vec![format::DICT_ADD];
            varint::write_u64(&mut frame, pos - anchor(&self.dict));
            varint::write_u64(&mut frame, self.pending.len() as u64);
            for s in &self.pending {
                varint::write_u64(&mut frame, s.len() as u64);
                frame.extend_from_slice(s.as_bytes());
            }
            self.emit(&frame)?;
            self.dict.set_anchor(pos);
            self.pending.clear();
        }

        let pos = self.pos;
        let mut frame = vec![format::VALUE];
        varint::write_u64(&mut frame, pos - anchor(&self.dict));
        varint::write_u64(&mut frame, self.scratch.len() as u64);
        self.out.write_all(&frame)?;
        self.out.write_all(&self.scratch)?;
        self.pos += (frame.len() + self.scratch.len()) as u64;
        self.records += 1;
        Ok(())
    }
}

/// Writer for one record's value body. Strings are encoded per occurrence as
/// either inline bytes or a dictionary reference, according to the admission
/// cache and the caller's intern hint.
pub struct AuWriter<'a> {
    body: &'a mut Vec<u8>,
    dict: &'a mut Dictionary,
    cache: &'a mut InternCache,
    pending: &'a mut Vec<String>,
}

impl AuWriter<'_> {
    pub fn null(&mut self) {
        self.body.push(format::NULL);
    }

    pub fn boolean(&mut self, value: bool) {
        self.body.push(if value { format::TRUE } else { format::FALSE });
    }

    /// Signed integer; non-negative values take the unsigned encoding.
    pub fn int(&mut self, value: i64) {
        if value >= 0 {
            self.uint(value as u64);
        } else {
            self.body.push(format::INT);
            varint::write_i64(self.body, value);
        }
    }

    pub fn uint(&mut self, value: u64) {
        self.body.push(format::UINT);
        varint::write_u64(self.body, value);
    }

    pub fn double(&mut self, value: f64) {
        self.body.push(format::DOUBLE);
        self.body.write_f64::<LittleEndian>(value).unwrap();
    }

    /// Timestamp as signed nanoseconds since the Unix epoch.
    pub fn time_nanos(&mut self, nanos: i64) {
        self.body.push(format::TIME);
        varint::write_i64(self.body, nanos);
    }

    /// A string occurrence. `intern` forces the encoding: `Some(false)`
    /// always inline, `Some(true)` admit to the dictionary immediately,
    /// `None` frequency-gated.
    pub fn string(&mut self, s: &str, intern: Option<bool>) {
        match self.cache.observe(s, intern, self.dict) {
            StringMode::Inline => {
                self.body.push(format::STRING);
                varint::write_u64(self.body, s.len() as u64);
                self.body.extend_from_slice(s.as_bytes());
            }
            StringMode::Ref(index) => self.dict_ref(index),
            StringMode::Admit(index) => {
                self.pending.push(s.to_string());
                self.dict_ref(index);
            }
        }
    }

    /// An object key: interned immediately, since key sets repeat heavily.
    pub fn key(&mut self, s: &str) {
        self.string(s, Some(true));
    }

    pub fn start_object(&mut self) {
        self.body.push(format::OBJECT_START);
    }

    pub fn end_object(&mut self) {
        self.body.push(format::OBJECT_END);
    }

    pub fn start_array(&mut self) {
        self.body.push(format::ARRAY_START);
    }

    pub fn end_array(&mut self) {
        self.body.push(format::ARRAY_END);
    }

    fn dict_ref(&mut self, index: u64) {
        self.body.push(format::DICT_REF);
        varint::write_u64(self.body, index);
    }
}
