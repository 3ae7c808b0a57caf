//! JSON front-end: streams whitespace-separated JSON values from a reader
//! and encodes each one as a record.

use std::io::Read;

use serde_json::Value;

use crate::encoder::{AuWriter, Encoder};
use crate::error::Result;
use crate::json;

/// Ingest tuning.
pub struct IngestOptions<'a> {
    /// Stop after this many records.
    pub max_records: u64,

    /// Per-key intern hint for the value under that key: `Some(false)`
    /// forces inline, `Some(true)` forces admission, `None` leaves the
    /// value to the frequency gate. Keys themselves are always interned.
    pub value_intern: Option<&'a dyn Fn(&str) -> Option<bool>>,
}

impl Default for IngestOptions<'_> {
    fn default() -> Self {
        Self {
            max_records: u64::MAX,
            value_intern: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct IngestStats {
    pub records: u64,
    pub time_attempts: u64,
    pub time_failures: u64,
}

/// Reads JSON values from `input` until EOF (or `max_records`) and encodes
/// them. JSON syntax errors surface as parse errors.
pub fn json_to_au<R: Read, W: std::io::Write>(
    input: R,
    encoder: &mut Encoder<W>,
    options: &IngestOptions,
) -> Result<IngestStats> {
    let mut stats = IngestStats::default();
    for value in serde_json::Deserializer::from_reader(input).into_iter::<Value>() {
        if stats.records >= options.max_records {
            break;
        }
        let value = value?;
        encoder.encode(|w| {
            emit_value(w, &value, None, options, &mut stats);
            Ok(())
        })?;
        stats.records += 1;
        if stats.records % 10_000 == 0 {
            let s = encoder.stats();
            tracing::info!(
                records = stats.records,
                dict_size = s["DictSize"],
                hash_size = s["HashSize"],
                cache_bytes = s["CacheSize"],
                "ingest progress"
            );
        }
    }
    if stats.time_attempts > 0 {
        tracing::info!(
            attempts = stats.time_attempts,
            failures = stats.time_failures,
            "timestamp conversion"
        );
    }
    Ok(stats)
}

fn emit_value(
    w: &mut AuWriter<'_>,
    value: &Value,
    intern: Option<bool>,
    options: &IngestOptions,
    stats: &mut IngestStats,
) {
    match value {
        Value::Null => w.null(),
        Value::Bool(b) => w.boolean(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                w.uint(u);
            } else if let Some(i) = n.as_i64() {
                w.int(i);
            } else {
                w.double(n.as_f64().unwrap_or(f64::NAN));
            }
        }
        Value::String(s) => {
            if s.len() == json::TIME_STR_LEN {
                stats.time_attempts += 1;
                if let Some(nanos) = json::parse_time(s) {
                    w.time_nanos(nanos);
                    return;
                }
                stats.time_failures += 1;
            }
            w.string(s, intern);
        }
        Value::Array(items) => {
            w.start_array();
            for item in items {
                emit_value(w, item, None, options, stats);
            }
            w.end_array();
        }
        Value::Object(fields) => {
            w.start_object();
            for (key, field) in fields {
                w.key(key);
                let hint = options.value_intern.and_then(|policy| policy(key));
                emit_value(w, field, hint, options, stats);
            }
            w.end_object();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DictRecordHandler, RecordParser};
    use crate::dictionary::Dictionary;
    use crate::json::JsonOutputHandler;
    use crate::source::file::FileByteSource;
    use std::io::Cursor;

    fn ingest(input: &str, options: &IngestOptions) -> (Vec<u8>, IngestStats) {
        let mut bytes = Vec::new();
        let mut encoder = Encoder::new(&mut bytes).expect("construction failed");
        let stats =
            json_to_au(input.as_bytes(), &mut encoder, options).expect("ingest failed");
        drop(encoder);
        (bytes, stats)
    }

    fn decode_to_json(bytes: Vec<u8>) -> String {
        let mut source = FileByteSource::new(Cursor::new(bytes), "<test>", false, 1);
        let mut dict = Dictionary::new();
        let mut output = JsonOutputHandler::new(Vec::new());
        {
            let mut handler = DictRecordHandler::new(&mut dict, &mut output);
            RecordParser::new(&mut source, &mut handler)
                .parse_stream()
                .expect("decode failed");
        }
        String::from_utf8(output.into_inner()).expect("invalid utf-8 output")
    }

    #[test]
    fn json_round_trips_through_the_binary_form() {
        let input = "{\"id\":7,\"name\":\"widget\",\"weight\":-3,\"ratio\":0.25,\"tags\":[\"a\",null,false]}\n";
        let (bytes, stats) = ingest(input, &IngestOptions::default());
        assert_eq!(stats.records, 1);
        assert_eq!(decode_to_json(bytes), input);
    }

    #[test]
    fn empty_input_produces_a_bare_header() {
        let (bytes, stats) = ingest("", &IngestOptions::default());
        assert_eq!(stats.records, 0);
        assert_eq!(bytes, b"H\x01au\x00");
    }

    #[test]
    fn timestamp_strings_round_trip_via_time_values() {
        let input = "{\"at\":\"1970-01-01T00:00:00.123456\"}\n";
        let (bytes, stats) = ingest(input, &IngestOptions::default());
        assert_eq!(stats.time_attempts, 1);
        assert_eq!(stats.time_failures, 0);
        // The value travels as a timestamp, not as string text...
        assert!(!bytes.windows(4).any(|w| w == b"1970"));
        // ...and prints back identically.
        assert_eq!(decode_to_json(bytes), input);
    }

    #[test]
    fn non_timestamp_26_byte_strings_stay_strings() {
        let input = "\"abcdefghijklmnopqrstuvwxyz\"\n";
        let (bytes, stats) = ingest(input, &IngestOptions::default());
        assert_eq!(stats.time_attempts, 1);
        assert_eq!(stats.time_failures, 1);
        assert_eq!(decode_to_json(bytes), input);
    }

    #[test]
    fn max_records_bounds_the_ingest() {
        let input = "1 2 3 4 5";
        let options = IngestOptions {
            max_records: 3,
            ..IngestOptions::default()
        };
        let (bytes, stats) = ingest(input, &options);
        assert_eq!(stats.records, 3);
        assert_eq!(decode_to_json(bytes), "1\n2\n3\n");
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let mut bytes = Vec::new();
        let mut encoder = Encoder::new(&mut bytes).expect("construction failed");
        let err = json_to_au("{\"broken\": ".as_bytes(), &mut encoder, &IngestOptions::default());
        assert!(matches!(err, Err(crate::Error::Parse(_))), "got {err:?}");
    }

    #[test]
    fn value_intern_policy_forces_inline() {
        // With the policy, the value under "trace" never earns a dict entry
        // no matter how often it repeats.
        let input = "{\"trace\":\"abcdef\"} ".repeat(50);
        let policy = |key: &str| if key == "trace" { Some(false) } else { None };
        let options = IngestOptions {
            value_intern: Some(&policy),
            ..IngestOptions::default()
        };
        let (with_policy, _) = ingest(&input, &options);
        let (without_policy, _) = ingest(&input, &IngestOptions::default());
        let count = |bytes: &[u8]| {
            bytes
                .windows(b"abcdef".len())
                .filter(|w| w == b"abcdef")
                .count()
        };
        assert_eq!(count(&with_policy), 50, "every occurrence stays inline");
        assert!(count(&without_policy) < 50, "the default gate interns the value");
    }
}
