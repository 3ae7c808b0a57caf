//! Au: a self-describing, append-friendly binary encoding for
//! semi-structured records, with the tooling to produce, consume, search,
//! and inspect streams in that format.
//!
//! A stream is a header followed by frames: dictionary clears, dictionary
//! adds, and length-prefixed value frames. Repeated strings are interned in
//! an evolving per-stream dictionary with frequency-gated admission, and the
//! frame back-chains let a reader recover both record alignment and the full
//! dictionary state from an arbitrary byte offset, which is what makes
//! logarithmic-time search over large key-ordered streams possible.

pub mod decoder;
pub mod dictionary;
pub mod encoder;
pub mod error;
pub mod format;
pub mod grep;
pub mod ingest;
pub mod json;
pub mod source;
pub mod stats;
pub mod varint;

pub use dictionary::Dictionary;
pub use encoder::{AuWriter, Encoder, EncoderConfig};
pub use error::{Error, Result};
pub use source::{ByteSource, FileByteSource};
