//! Streaming decoder: a record-level pull parser that drives callback
//! handlers over the frame structure, and a value-level parser (see
//! [`value`]) for the token tree inside each value frame.
//!
//! The two handler traits mirror the two framing levels. All methods have
//! no-op defaults so handlers implement only what they observe. Callbacks
//! return `Result` so a handler can reject a stream (for example, a
//! dictionary reference to an entry the stream never announced).

pub mod sync;
pub mod value;

use crate::dictionary::Dictionary;
use crate::errparse;
use crate::error::Result;
use crate::format;
use crate::source::ByteSource;
use crate::varint;

pub use sync::Resync;
pub use value::ValueParser;

/// Token-level callbacks inside one value frame.
pub trait ValueHandler {
    fn on_null(&mut self, _pos: u64) -> Result<()> {
        Ok(())
    }
    fn on_bool(&mut self, _pos: u64, _value: bool) -> Result<()> {
        Ok(())
    }
    fn on_int(&mut self, _pos: u64, _value: i64) -> Result<()> {
        Ok(())
    }
    fn on_uint(&mut self, _pos: u64, _value: u64) -> Result<()> {
        Ok(())
    }
    fn on_double(&mut self, _pos: u64, _value: f64) -> Result<()> {
        Ok(())
    }
    /// Timestamp in signed nanoseconds since the Unix epoch.
    fn on_time(&mut self, _pos: u64, _nanos: i64) -> Result<()> {
        Ok(())
    }
    fn on_string_start(&mut self, _pos: u64, _len: u64) -> Result<()> {
        Ok(())
    }
    fn on_string_fragment(&mut self, _fragment: &[u8]) -> Result<()> {
        Ok(())
    }
    fn on_string_end(&mut self) -> Result<()> {
        Ok(())
    }
    fn on_dict_ref(&mut self, _pos: u64, _index: u64) -> Result<()> {
        Ok(())
    }
    fn on_object_start(&mut self) -> Result<()> {
        Ok(())
    }
    fn on_object_end(&mut self) -> Result<()> {
        Ok(())
    }
    fn on_array_start(&mut self) -> Result<()> {
        Ok(())
    }
    fn on_array_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Frame-level callbacks. String callbacks deliver dict-add payloads.
pub trait RecordHandler<S: ByteSource> {
    /// First frame of a record (its dict-adds, if any, else its value).
    fn on_record_start(&mut self, _pos: u64) -> Result<()> {
        Ok(())
    }
    fn on_header(&mut self, _version: u64) -> Result<()> {
        Ok(())
    }
    fn on_dict_clear(&mut self, _pos: u64) -> Result<()> {
        Ok(())
    }
    fn on_dict_add_start(&mut self, _pos: u64, _backref: u64) -> Result<()> {
        Ok(())
    }
    fn on_string_start(&mut self, _pos: u64, _len: u64) -> Result<()> {
        Ok(())
    }
    fn on_string_fragment(&mut self, _fragment: &[u8]) -> Result<()> {
        Ok(())
    }
    fn on_string_end(&mut self) -> Result<()> {
        Ok(())
    }
    /// The value frame body. The source is positioned at the first body
    /// byte; the handler must consume (or skip) exactly `len` bytes. The
    /// default skips the body using the length prefix.
    fn on_value(&mut self, _pos: u64, _backref: u64, len: u64, source: &mut S) -> Result<()> {
        source.skip(len)
    }
    fn on_end(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Frame-structure parser.
pub struct RecordParser<'a, S: ByteSource, H: RecordHandler<S>> {
    source: &'a mut S,
    handler: &'a mut H,
}

impl<'a, S: ByteSource, H: RecordHandler<S>> RecordParser<'a, S, H> {
    pub fn new(source: &'a mut S, handler: &'a mut H) -> Self {
        Self { source, handler }
    }

    /// Parses frames to the end of the stream.
    pub fn parse_stream(&mut self) -> Result<()> {
        while self.parse_until_value()? {}
        Ok(())
    }

    /// Advances through header / dict-clear / dict-add frames and consumes
    /// one value frame, returning true. Returns false at a clean end of
    /// stream. End of stream after a dict-add but before its value frame is
    /// a parse error: the record was truncated.
    pub fn parse_until_value(&mut self) -> Result<bool> {
        let mut record_open = false;
        loop {
            let pos = self.source.pos();
            let byte = match self.source.peek()? {
                Some(b) => b,
                None if record_open => {
                    return errparse!(
                        "{}: eof at {pos} inside a record (dict-add without a value)",
                        self.source.name()
                    )
                }
                None => return Ok(false),
            };
            match byte {
                format::HEADER => {
                    self.source.next()?;
                    let version = varint::read_u64(self.source)?;
                    self.expect_magic(pos)?;
                    self.handler.on_header(version)?;
                }
                format::DICT_CLEAR => {
                    self.source.next()?;
                    let _prev_clear = varint::read_u64(self.source)?;
                    self.handler.on_dict_clear(pos)?;
                }
                format::END => {
                    self.source.next()?;
                    self.handler.on_end()?;
                }
                format::DICT_ADD => {
                    if !record_open {
                        self.handler.on_record_start(pos)?;
                        record_open = true;
                    }
                    self.dict_add(pos)?;
                }
                format::VALUE => {
                    if !record_open {
                        self.handler.on_record_start(pos)?;
                    }
                    self.source.next()?;
                    let backref = varint::read_u64(self.source)?;
                    let len = varint::read_u64(self.source)?;
                    let body = self.source.pos();
                    self.handler.on_value(pos, backref, len, &mut *self.source)?;
                    if self.source.pos() != body + len {
                        return errparse!(
                            "{}: value at {pos} consumed {} bytes but the frame announced {len}",
                            self.source.name(),
                            self.source.pos() - body
                        );
                    }
                    return Ok(true);
                }
                other => {
                    return errparse!(
                        "{}: invalid frame byte {:#04x} at {pos}",
                        self.source.name(),
                        other
                    )
                }
            }
        }
    }

    fn dict_add(&mut self, pos: u64) -> Result<()> {
        self.source.next()?;
        let backref = varint::read_u64(self.source)?;
        self.handler.on_dict_add_start(pos, backref)?;
        let count = varint::read_u64(self.source)?;
        for _ in 0..count {
            let spos = self.source.pos();
            let len = varint::read_u64(self.source)?;
            self.handler.on_string_start(spos, len)?;
            let Self { source, handler } = self;
            source.read_exact(len, &mut |fragment| handler.on_string_fragment(fragment))?;
            self.handler.on_string_end()?;
        }
        Ok(())
    }

    fn expect_magic(&mut self, pos: u64) -> Result<()> {
        let mut magic = [0u8; 3];
        let mut filled = 0;
        self.source.read_exact(format::MAGIC.len() as u64, &mut |chunk| {
            magic[filled..filled + chunk.len()].copy_from_slice(chunk);
            filled += chunk.len();
            Ok(())
        })?;
        if &magic != format::MAGIC {
            return errparse!(
                "{}: bad magic {:02x?} in header at {pos}",
                self.source.name(),
                magic
            );
        }
        Ok(())
    }
}

/// A value body handler invoked once per record, with the live dictionary.
pub trait RecordValueHandler<S: ByteSource> {
    fn on_record_value(&mut self, source: &mut S, dict: &Dictionary, len: u64) -> Result<()>;
}

/// The standard record handler: maintains the shadow dictionary from
/// dict-clear / dict-add frames and hands each value frame, together with
/// the dictionary, to a [`RecordValueHandler`].
///
/// Frames at or before the dictionary's anchor are recognized as already
/// applied and skipped, which is what lets grep re-walk records for context
/// output without corrupting the dictionary.
pub struct DictRecordHandler<'a, V> {
    dict: &'a mut Dictionary,
    value_handler: &'a mut V,
    accum: Vec<u8>,
    applying: bool,
}

impl<'a, V> DictRecordHandler<'a, V> {
    pub fn new(dict: &'a mut Dictionary, value_handler: &'a mut V) -> Self {
        Self {
            dict,
            value_handler,
            accum: Vec::new(),
            applying: false,
        }
    }
}

impl<S: ByteSource, V: RecordValueHandler<S>> RecordHandler<S> for DictRecordHandler<'_, V> {
    fn on_dict_clear(&mut self, pos: u64) -> Result<()> {
        if self.dict.anchor().map_or(true, |anchor| pos > anchor) {
            self.dict.note_clear(pos);
        }
        Ok(())
    }

    fn on_dict_add_start(&mut self, pos: u64, backref: u64) -> Result<()> {
        match self.dict.anchor() {
            None => errparse!("dict-add at {pos} before any dict-clear"),
            Some(anchor) if pos <= anchor => {
                // Already applied on a previous pass over these bytes.
                self.applying = false;
                Ok(())
            }
            Some(anchor) => {
                if pos - backref != anchor {
                    return errparse!(
                        "dict-add chain mismatch at {pos}: back-offset {backref} \
                         does not reach the previous dictionary frame at {anchor}"
                    );
                }
                self.applying = true;
                self.dict.set_anchor(pos);
                Ok(())
            }
        }
    }

    fn on_string_start(&mut self, _pos: u64, len: u64) -> Result<()> {
        self.accum.clear();
        self.accum.reserve(len.min(1 << 16) as usize);
        Ok(())
    }

    fn on_string_fragment(&mut self, fragment: &[u8]) -> Result<()> {
        if self.applying {
            self.accum.extend_from_slice(fragment);
        }
        Ok(())
    }

    fn on_string_end(&mut self) -> Result<()> {
        if self.applying {
            let s = String::from_utf8(std::mem::take(&mut self.accum))
                .map_err(|e| crate::Error::Parse(format!("dictionary entry is not valid UTF-8: {e}")))?;
            self.dict.add(s);
        }
        Ok(())
    }

    fn on_value(&mut self, _pos: u64, _backref: u64, len: u64, source: &mut S) -> Result<()> {
        self.value_handler.on_record_value(source, self.dict, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Encoder, EncoderConfig};
    use crate::source::file::FileByteSource;
    use std::io::Cursor;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Null,
        Bool(bool),
        Int(i64),
        Uint(u64),
        Double(f64),
        Time(i64),
        Str(String),
        ObjStart,
        ObjEnd,
        ArrStart,
        ArrEnd,
    }

    /// Collects every value token, resolving dictionary references and
    /// concatenating string fragments.
    #[derive(Default, Debug)]
    struct Collector {
        events: Vec<Event>,
        records: usize,
    }

    struct CollectorVisitor<'a> {
        events: &'a mut Vec<Event>,
        dict: &'a Dictionary,
        buf: Vec<u8>,
    }

    impl ValueHandler for CollectorVisitor<'_> {
        fn on_null(&mut self, _pos: u64) -> Result<()> {
            self.events.push(Event::Null);
            Ok(())
        }
        fn on_bool(&mut self, _pos: u64, value: bool) -> Result<()> {
            self.events.push(Event::Bool(value));
            Ok(())
        }
        fn on_int(&mut self, _pos: u64, value: i64) -> Result<()> {
            self.events.push(Event::Int(value));
            Ok(())
        }
        fn on_uint(&mut self, _pos: u64, value: u64) -> Result<()> {
            self.events.push(Event::Uint(value));
            Ok(())
        }
        fn on_double(&mut self, _pos: u64, value: f64) -> Result<()> {
            self.events.push(Event::Double(value));
            Ok(())
        }
        fn on_time(&mut self, _pos: u64, nanos: i64) -> Result<()> {
            self.events.push(Event::Time(nanos));
            Ok(())
        }
        fn on_string_start(&mut self, _pos: u64, _len: u64) -> Result<()> {
            self.buf.clear();
            Ok(())
        }
        fn on_string_fragment(&mut self, fragment: &[u8]) -> Result<()> {
            self.buf.extend_from_slice(fragment);
            Ok(())
        }
        fn on_string_end(&mut self) -> Result<()> {
            let s = String::from_utf8(std::mem::take(&mut self.buf)).expect("invalid utf-8");
            self.events.push(Event::Str(s));
            Ok(())
        }
        fn on_dict_ref(&mut self, _pos: u64, index: u64) -> Result<()> {
            self.events.push(Event::Str(self.dict.get(index)?.to_string()));
            Ok(())
        }
        fn on_object_start(&mut self) -> Result<()> {
            self.events.push(Event::ObjStart);
            Ok(())
        }
        fn on_object_end(&mut self) -> Result<()> {
            self.events.push(Event::ObjEnd);
            Ok(())
        }
        fn on_array_start(&mut self) -> Result<()> {
            self.events.push(Event::ArrStart);
            Ok(())
        }
        fn on_array_end(&mut self) -> Result<()> {
            self.events.push(Event::ArrEnd);
            Ok(())
        }
    }

    impl<S: ByteSource> RecordValueHandler<S> for Collector {
        fn on_record_value(&mut self, source: &mut S, dict: &Dictionary, _len: u64) -> Result<()> {
            self.records += 1;
            let mut visitor = CollectorVisitor {
                events: &mut self.events,
                dict,
                buf: Vec::new(),
            };
            ValueParser::new(source, &mut visitor).value()
        }
    }

    fn decode_all(bytes: Vec<u8>) -> Result<Collector> {
        let mut source = FileByteSource::new(Cursor::new(bytes), "<test>", false, 1);
        let mut dict = Dictionary::new();
        let mut collector = Collector::default();
        let mut handler = DictRecordHandler::new(&mut dict, &mut collector);
        RecordParser::new(&mut source, &mut handler).parse_stream()?;
        Ok(collector)
    }

    #[test]
    fn header_only_stream_has_no_records() {
        let mut out = Vec::new();
        Encoder::new(&mut out).expect("construction failed");
        let collector = decode_all(out).expect("decode failed");
        assert_eq!(collector.records, 0);
        assert!(collector.events.is_empty());
    }

    #[test]
    fn round_trip_of_nested_values() {
        let mut out = Vec::new();
        let mut encoder = Encoder::new(&mut out).expect("construction failed");
        encoder
            .encode(|w| {
                w.start_object();
                w.key("id");
                w.uint(42);
                w.key("negative");
                w.int(-7);
                w.key("pi");
                w.double(3.5);
                w.key("when");
                w.time_nanos(123_456_789);
                w.key("tags");
                w.start_array();
                w.string("one", None);
                w.null();
                w.boolean(true);
                w.boolean(false);
                w.end_array();
                w.end_object();
                Ok(())
            })
            .expect("encode failed");
        let collector = decode_all(out).expect("decode failed");
        assert_eq!(collector.records, 1);
        assert_eq!(
            collector.events,
            vec![
                Event::ObjStart,
                Event::Str("id".into()),
                Event::Uint(42),
                Event::Str("negative".into()),
                Event::Int(-7),
                Event::Str("pi".into()),
                Event::Double(3.5),
                Event::Str("when".into()),
                Event::Time(123_456_789),
                Event::Str("tags".into()),
                Event::ArrStart,
                Event::Str("one".into()),
                Event::Null,
                Event::Bool(true),
                Event::Bool(false),
                Event::ArrEnd,
                Event::ObjEnd,
            ]
        );
    }

    #[test]
    fn interned_strings_resolve_through_the_dictionary() {
        let mut out = Vec::new();
        let config = EncoderConfig::default().intern_threshold(2).intern_min_len(1);
        let mut encoder = Encoder::with_config(&mut out, config).expect("construction failed");
        for _ in 0..5 {
            encoder
                .encode(|w| {
                    w.string("repeated", None);
                    Ok(())
                })
                .expect("encode failed");
        }
        let collector = decode_all(out).expect("decode failed");
        assert_eq!(collector.events, vec![Event::Str("repeated".into()); 5]);
    }

    #[test]
    fn long_strings_arrive_fragmented_but_whole() {
        // Value body far larger than the 1 KiB decode buffer.
        let big: String = "abcdefgh".repeat(1000);
        let mut out = Vec::new();
        let mut encoder = Encoder::new(&mut out).expect("construction failed");
        encoder
            .encode(|w| {
                w.string(&big, None);
                Ok(())
            })
            .expect("encode failed");
        let collector = decode_all(out).expect("decode failed");
        assert_eq!(collector.events, vec![Event::Str(big)]);
    }

    #[test]
    fn truncated_value_is_a_parse_error() {
        let mut out = Vec::new();
        let mut encoder = Encoder::new(&mut out).expect("construction failed");
        encoder
            .encode(|w| {
                w.string("a string long enough to truncate", None);
                Ok(())
            })
            .expect("encode failed");
        for cut in [out.len() - 1, out.len() - 10, out.len() - 20] {
            let err = decode_all(out[..cut].to_vec()).unwrap_err();
            assert!(matches!(err, crate::Error::Parse(_)), "cut {cut}: {err:?}");
        }
    }

    #[test]
    fn truncated_dict_add_is_a_parse_error() {
        let mut out = Vec::new();
        let config = EncoderConfig::default().intern_threshold(1).intern_min_len(1);
        let mut encoder = Encoder::with_config(&mut out, config).expect("construction failed");
        encoder
            .encode(|w| {
                w.string("interned", None);
                Ok(())
            })
            .expect("encode failed");
        let before_add = encoder.pos() as usize;
        encoder
            .encode(|w| {
                w.string("interned", None);
                Ok(())
            })
            .expect("encode failed");
        // Cut inside the second record's dict-add frame.
        let err = decode_all(out[..before_add + 3].to_vec()).unwrap_err();
        assert!(matches!(err, crate::Error::Parse(_)), "got {err:?}");
    }

    #[test]
    fn out_of_range_dict_ref_is_a_parse_error() {
        let mut bytes = b"H\x01au\x00C\x00".to_vec();
        // Value frame whose body references dictionary entry 9.
        bytes.extend_from_slice(b"V\x02\x02X\x09");
        let err = decode_all(bytes).unwrap_err();
        assert!(matches!(err, crate::Error::Parse(_)), "got {err:?}");
    }

    #[test]
    fn value_length_mismatch_is_a_parse_error() {
        // Announces a 3-byte body but carries a 1-byte null value; the next
        // frame byte would be consumed as part of the body otherwise.
        let mut bytes = b"H\x01au\x00C\x00".to_vec();
        bytes.extend_from_slice(b"V\x02\x03N");
        bytes.extend_from_slice(b"V\x06\x01N");
        let err = decode_all(bytes).unwrap_err();
        assert!(matches!(err, crate::Error::Parse(_)), "got {err:?}");
    }

    #[test]
    fn end_frame_is_tolerated() {
        let mut out = Vec::new();
        let mut encoder = Encoder::new(&mut out).expect("construction failed");
        encoder
            .encode(|w| {
                w.null();
                Ok(())
            })
            .expect("encode failed");
        encoder.end().expect("end failed");
        let collector = decode_all(out).expect("decode failed");
        assert_eq!(collector.events, vec![Event::Null]);
    }

    #[test]
    fn garbage_frame_byte_is_a_parse_error() {
        let mut bytes = b"H\x01au\x00".to_vec();
        bytes.push(b'Q');
        let err = decode_all(bytes).unwrap_err();
        assert!(matches!(err, crate::Error::Parse(_)), "got {err:?}");
    }
}
