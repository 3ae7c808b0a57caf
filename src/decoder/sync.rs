//! Record re-synchronization. From an arbitrary byte offset, scan forward
//! for a plausible frame opcode and validate it by walking the frame's
//! back-chain (value → dict-add → … → dict-clear). A candidate whose chain
//! resolves is a real boundary: the dictionary is rebuilt by replaying the
//! chained dict-adds from the root clear, so dictionary references in the
//! records that follow resolve even though decoding did not start at the
//! beginning of the stream.

use crate::dictionary::Dictionary;
use crate::error::{Error, Result};
use crate::format;
use crate::source::ByteSource;
use crate::varint;

/// Upper bound on back-chain hops; a chain longer than this is treated as a
/// false positive rather than walked forever.
const MAX_CHAIN: usize = 1 << 20;

pub struct Resync<'a, S: ByteSource> {
    source: &'a mut S,
    dict: &'a mut Dictionary,
}

/// Maps parse failures during candidate validation to "not a frame";
/// IO and allocation failures stay fatal.
fn check<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(Error::Parse(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

impl<'a, S: ByteSource> Resync<'a, S> {
    pub fn new(source: &'a mut S, dict: &'a mut Dictionary) -> Self {
        Self { source, dict }
    }

    /// Positions the cursor at the next valid record boundary at or after
    /// the current position, rebuilding the dictionary for that position.
    /// Returns false if the stream ends first. A cursor already at a
    /// boundary does not move.
    pub fn sync(&mut self) -> Result<bool> {
        loop {
            let byte = match self.source.peek()? {
                Some(b) => b,
                None => return Ok(false),
            };
            if format::is_frame_opcode(byte) {
                let pos = self.source.pos();
                if self.validate(pos, byte)? {
                    self.source.seek(pos)?;
                    return Ok(true);
                }
                self.source.seek(pos)?;
            }
            self.source.next()?;
        }
    }

    fn validate(&mut self, pos: u64, byte: u8) -> Result<bool> {
        self.source.next()?;
        match byte {
            format::HEADER => self.validate_header(),
            format::END => self.validate_end(),
            format::DICT_CLEAR => self.validate_clear(pos),
            format::DICT_ADD | format::VALUE => self.validate_chained(pos, byte),
            _ => Ok(false),
        }
    }

    /// A header is self-validating: version varint followed by the magic.
    fn validate_header(&mut self) -> Result<bool> {
        if check(varint::read_u64(self.source))?.is_none() {
            return Ok(false);
        }
        for &expected in format::MAGIC {
            match self.source.next()? {
                Some(b) if b == expected => {}
                _ => return Ok(false),
            }
        }
        self.dict.reset();
        Ok(true)
    }

    /// An end frame is valid at end of stream or before another header.
    fn validate_end(&mut self) -> Result<bool> {
        match self.source.peek()? {
            None => {
                self.dict.reset();
                Ok(true)
            }
            Some(format::HEADER) => {
                self.source.next()?;
                self.validate_header()
            }
            Some(_) => Ok(false),
        }
    }

    /// A dict-clear carries the absolute position of the previous clear,
    /// which must both precede it and itself look like a clear. If a
    /// chained frame follows, its back-offset must point exactly here.
    fn validate_clear(&mut self, pos: u64) -> Result<bool> {
        match check(varint::read_u64(self.source))? {
            Some(prev) if prev < pos => {
                let next_pos = self.source.pos();
                if !self.clear_chain_ok(prev)? {
                    return Ok(false);
                }
                self.source.seek(next_pos)?;
            }
            _ => return Ok(false),
        }
        let next_pos = self.source.pos();
        match self.source.peek()? {
            Some(format::DICT_ADD) | Some(format::VALUE) => {
                self.source.next()?;
                match check(varint::read_u64(self.source))? {
                    Some(backref) if backref == next_pos - pos => {}
                    _ => return Ok(false),
                }
            }
            None | Some(format::DICT_CLEAR) | Some(format::HEADER) | Some(format::END) => {}
            Some(_) => return Ok(false),
        }
        self.dict.reset();
        Ok(true)
    }

    /// The previous-clear pointer of a clear frame: zero, or the position
    /// of an earlier clear.
    fn clear_chain_ok(&mut self, prev: u64) -> Result<bool> {
        if prev == 0 {
            return Ok(true);
        }
        Ok(self.byte_at(prev)? == Some(format::DICT_CLEAR))
    }

    /// A value frame's announced body must end exactly at the stream end or
    /// at another frame boundary. Skipped when the stream length is unknown.
    fn value_body_ok(&mut self, body_start: u64, len: u64) -> Result<bool> {
        let Ok(end) = self.source.end_pos() else {
            return Ok(true);
        };
        let Some(body_end) = body_start.checked_add(len) else {
            return Ok(false);
        };
        if body_end > end {
            return Ok(false);
        }
        if body_end == end {
            return Ok(true);
        }
        Ok(matches!(self.byte_at(body_end)?, Some(b) if format::is_frame_opcode(b)))
    }

    /// The byte at an absolute position, or None if it is not reachable.
    fn byte_at(&mut self, pos: u64) -> Result<Option<u8>> {
        if self.seek_checked(pos)?.is_none() {
            return Ok(None);
        }
        self.source.peek()
    }

    /// Walks a dict-add / value frame's back-chain to its root clear, then
    /// rebuilds the dictionary by replaying the chained adds in order. The
    /// candidate's own dict-add (if that is what it is) is left for the
    /// record parser.
    fn validate_chained(&mut self, pos: u64, byte: u8) -> Result<bool> {
        let backref = match check(varint::read_u64(self.source))? {
            Some(b) => b,
            None => return Ok(false),
        };
        if byte == format::VALUE {
            let len = match check(varint::read_u64(self.source))? {
                Some(l) => l,
                None => return Ok(false),
            };
            if !self.value_body_ok(self.source.pos(), len)? {
                return Ok(false);
            }
        }
        if backref == 0 || backref > pos {
            return Ok(false);
        }

        let mut adds = Vec::new();
        let mut cur = pos - backref;
        let root = loop {
            if adds.len() >= MAX_CHAIN {
                return Ok(false);
            }
            if self.seek_checked(cur)?.is_none() {
                return Ok(false);
            }
            match self.source.next()? {
                Some(format::DICT_CLEAR) => match check(varint::read_u64(self.source))? {
                    Some(prev) if prev < cur && self.clear_chain_ok(prev)? => break cur,
                    _ => return Ok(false),
                },
                Some(format::DICT_ADD) => {
                    match check(varint::read_u64(self.source))? {
                        Some(br) if br > 0 && br <= cur => {
                            adds.push(cur);
                            cur -= br;
                        }
                        _ => return Ok(false),
                    }
                }
                _ => return Ok(false),
            }
        };

        self.dict.reset();
        self.dict.note_clear(root);
        for i in (0..adds.len()).rev() {
            if check(self.replay_add(adds[i]))?.is_none() {
                // The chain looked plausible but one add frame does not
                // parse: restart the dictionary and reject the candidate.
                self.dict.reset();
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Re-parses one dict-add frame into the dictionary.
    fn replay_add(&mut self, pos: u64) -> Result<()> {
        self.source.seek(pos)?;
        self.source.next()?; // opcode, validated during the walk
        let _backref = varint::read_u64(self.source)?;
        let count = varint::read_u64(self.source)?;
        for _ in 0..count {
            let len = varint::read_u64(self.source)?;
            let mut bytes = Vec::with_capacity(len.min(1 << 16) as usize);
            self.source.read_exact(len, &mut |fragment| {
                bytes.extend_from_slice(fragment);
                Ok(())
            })?;
            let s = String::from_utf8(bytes)
                .map_err(|e| Error::Parse(format!("dictionary entry is not valid UTF-8: {e}")))?;
            self.dict.add(s);
        }
        self.dict.set_anchor(pos);
        Ok(())
    }

    /// Seeks, treating an out-of-stream target as a validation failure.
    fn seek_checked(&mut self, pos: u64) -> Result<Option<()>> {
        match self.source.seek(pos) {
            Ok(()) => Ok(Some(())),
            Err(Error::Io(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
