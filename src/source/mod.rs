//! Byte stream abstraction for the decoder side: a forward reader with a
//! rolling in-memory buffer, absolute position tracking, limited back-seek,
//! and a pin that extends retained history.

pub mod file;

use crate::error::Result;

pub use file::{FileByteSource, Pipe, RawSource};

/// A bidirectional byte stream over some underlying data.
///
/// Positions are absolute offsets into the underlying stream. Seeking
/// backward is guaranteed to succeed within the retained history window
/// (see [`FileByteSource`]); anything further requires a seekable backend.
pub trait ByteSource {
    /// Display name for diagnostics.
    fn name(&self) -> &str;

    /// Position in the underlying data stream.
    fn pos(&self) -> u64;

    /// Consumes and returns one byte, or None at end of stream.
    fn next(&mut self) -> Result<Option<u8>>;

    /// Returns the next byte without consuming it, or None at end of stream.
    fn peek(&mut self) -> Result<Option<u8>>;

    /// Consumes exactly `len` bytes, delivering them to `sink` in one or more
    /// contiguous fragments. Reaching end of stream first is a parse error.
    fn read_exact(&mut self, len: u64, sink: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;

    /// Advances the cursor by `len` bytes.
    fn skip(&mut self, len: u64) -> Result<()>;

    /// Moves the cursor to an absolute position. Positions inside the
    /// buffered window move the cursor only; anything else reseeks the
    /// underlying stream and drops the pin.
    fn seek(&mut self, abspos: u64) -> Result<()>;

    /// Asks the source to retain history back to `abspos` so that a later
    /// `seek(abspos)` stays buffer-local. `abspos` must not precede the
    /// currently buffered window.
    fn set_pin(&mut self, abspos: u64);

    /// Releases the pin set by `set_pin`.
    fn clear_pin(&mut self);

    /// Advances the cursor to the next occurrence of `needle`, leaving it at
    /// the needle's first byte. Returns false if the stream ends first.
    fn scan_to(&mut self, needle: &[u8]) -> Result<bool>;

    /// Total length of the underlying stream, if known.
    fn end_pos(&self) -> Result<u64>;

    /// Whether the backend supports arbitrary seeks. Fixed at construction.
    fn is_seekable(&self) -> bool;
}
