use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::thread;
use std::time::Duration;

use crate::errparse;
use crate::error::{Error, Result};
use crate::source::ByteSource;

/// Minimum amount of consumed data kept in the buffer so short back-seeks
/// work even on non-seekable streams.
const MIN_HIST: usize = 1024;

/// Default working buffer size (and growth increment), in KiB.
pub const DEFAULT_BUFFER_KIB: usize = 256;

/// The raw byte supplier behind a [`FileByteSource`]: a file, a pipe, or an
/// in-memory cursor. Seekability is a fixed property of the backend.
pub trait RawSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn seek_to(&mut self, abspos: u64) -> io::Result<()>;
    fn end_pos(&self) -> io::Result<u64>;
    fn is_seekable(&self) -> bool;
}

impl RawSource for File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn seek_to(&mut self, abspos: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(abspos)).map(|_| ())
    }

    fn end_pos(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

impl RawSource for Cursor<Vec<u8>> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn seek_to(&mut self, abspos: u64) -> io::Result<()> {
        self.set_position(abspos);
        Ok(())
    }

    fn end_pos(&self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

/// A non-seekable stream such as stdin.
pub struct Pipe<R: Read>(pub R);

impl<R: Read> RawSource for Pipe<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }

    fn seek_to(&mut self, _abspos: u64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "stream is not seekable"))
    }

    fn end_pos(&self) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "stream length unknown"))
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

impl RawSource for Box<dyn RawSource> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn seek_to(&mut self, abspos: u64) -> io::Result<()> {
        (**self).seek_to(abspos)
    }

    fn end_pos(&self) -> io::Result<u64> {
        (**self).end_pos()
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }
}

/// Buffered [`ByteSource`] over a [`RawSource`].
///
/// A single contiguous working buffer holds a window of the stream. `cur`
/// and `limit` index into it; `pos` is the absolute stream position of
/// `cur`. On refill, at least [`MIN_HIST`] bytes of consumed history (or
/// enough to cover the pin, whichever is larger) are kept ahead of the
/// compaction so short back-seeks never touch the backend. When the buffer
/// fills and cannot be compacted it grows by a constant increment.
pub struct FileByteSource<R: RawSource> {
    raw: R,
    name: String,
    buf: Vec<u8>,
    pos: u64,
    cur: usize,
    limit: usize,
    pin: Option<u64>,
    wait_for_data: bool,
    grow_increment: usize,
}

impl FileByteSource<Box<dyn RawSource>> {
    /// Opens `fname` (or stdin for `-`) with the default buffer size.
    /// `wait_for_data` selects tail mode: reads at end of stream sleep and
    /// retry instead of reporting EOF.
    pub fn open(fname: &str, wait_for_data: bool) -> Result<Self> {
        let (raw, name): (Box<dyn RawSource>, &str) = if fname == "-" {
            (Box::new(Pipe(io::stdin())), "<stdin>")
        } else {
            let file = File::open(fname)
                .map_err(|e| Error::Io(format!("open: {e} ({fname})")))?;
            (Box::new(file), fname)
        };
        Ok(Self::new(raw, name, wait_for_data, DEFAULT_BUFFER_KIB))
    }
}

impl<R: RawSource> FileByteSource<R> {
    pub fn new(raw: R, name: &str, wait_for_data: bool, buffer_size_kib: usize) -> Self {
        let size = buffer_size_kib.max(1) * 1024;
        Self {
            raw,
            name: name.to_string(),
            buf: vec![0; size],
            pos: 0,
            cur: 0,
            limit: 0,
            pin: None,
            wait_for_data,
            grow_increment: size,
        }
    }

    /// Bytes buffered ahead of the cursor.
    fn avail(&self) -> usize {
        self.limit - self.cur
    }

    /// Refills the buffer from the backend, compacting or growing first as
    /// needed. Returns false if the backend had no more bytes to give.
    fn fill(&mut self) -> Result<bool> {
        let mut hist = MIN_HIST;
        if let Some(pin) = self.pin {
            if pin < self.pos {
                hist = hist.max((self.pos - pin) as usize);
            }
        }
        if self.cur > hist {
            let start = self.cur - hist;
            self.buf.copy_within(start..self.limit, 0);
            self.cur -= start;
            self.limit -= start;
        }

        if self.limit == self.buf.len() {
            let target = self.buf.len() + self.grow_increment;
            self.buf
                .try_reserve_exact(self.grow_increment)
                .map_err(|e| Error::Grow(format!("unable to grow buffer to {target} bytes: {e}")))?;
            self.buf.resize(target, 0);
        }

        loop {
            let n = self
                .raw
                .read(&mut self.buf[self.limit..])
                .map_err(|e| Error::Io(format!("error reading {}: {e}", self.name)))?;
            if n == 0 {
                if self.wait_for_data {
                    thread::sleep(Duration::from_secs(1));
                    continue;
                }
                return Ok(false);
            }
            self.limit += n;
            return Ok(true);
        }
    }
}

impl<R: RawSource> ByteSource for FileByteSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn pos(&self) -> u64 {
        self.pos
    }

    fn next(&mut self) -> Result<Option<u8>> {
        while self.cur == self.limit {
            if !self.fill()? {
                return Ok(None);
            }
        }
        let byte = self.buf[self.cur];
        self.cur += 1;
        self.pos += 1;
        Ok(Some(byte))
    }

    fn peek(&mut self) -> Result<Option<u8>> {
        while self.cur == self.limit {
            if !self.fill()? {
                return Ok(None);
            }
        }
        Ok(Some(self.buf[self.cur]))
    }

    fn read_exact(&mut self, mut len: u64, sink: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        while len > 0 {
            while self.cur == self.limit {
                if !self.fill()? {
                    return errparse!(
                        "{}: reached eof at {} while trying to read {} more bytes",
                        self.name,
                        self.pos,
                        len
                    );
                }
            }
            let chunk = (self.avail() as u64).min(len) as usize;
            sink(&self.buf[self.cur..self.cur + chunk])?;
            self.cur += chunk;
            self.pos += chunk as u64;
            len -= chunk as u64;
        }
        Ok(())
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        self.seek(self.pos + len)
    }

    fn seek(&mut self, abspos: u64) -> Result<()> {
        let history = self.cur as u64;
        let ahead = self.avail() as u64;
        if abspos <= self.pos && self.pos - abspos <= history {
            let rel = (self.pos - abspos) as usize;
            self.cur -= rel;
            self.pos = abspos;
        } else if abspos > self.pos && abspos - self.pos <= ahead {
            let rel = (abspos - self.pos) as usize;
            self.cur += rel;
            self.pos = abspos;
        } else {
            self.raw
                .seek_to(abspos)
                .map_err(|e| Error::Io(format!("seek in {} failed: {e}", self.name)))?;
            self.cur = 0;
            self.limit = 0;
            self.pos = abspos;
            // Having to seek the backend invalidates any pinned history.
            self.pin = None;
            if !self.fill()? {
                return Err(Error::Io(format!(
                    "{}: failed to read from new location {abspos}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn set_pin(&mut self, abspos: u64) {
        // The pin must lie within the currently buffered window.
        debug_assert!(abspos >= self.pos - self.cur as u64);
        self.pin = Some(abspos);
    }

    fn clear_pin(&mut self) {
        self.pin = None;
    }

    fn scan_to(&mut self, needle: &[u8]) -> Result<bool> {
        if needle.is_empty() {
            return Ok(true);
        }
        loop {
            while self.avail() < needle.len() {
                if !self.fill()? {
                    return Ok(false);
                }
            }
            let window = &self.buf[self.cur..self.limit];
            if let Some(off) = window.windows(needle.len()).position(|w| w == needle) {
                self.cur += off;
                self.pos += off as u64;
                return Ok(true);
            }
            // Keep the last len-1 bytes in case the needle straddles the
            // refill boundary.
            let advance = self.avail() - (needle.len() - 1);
            self.cur += advance;
            self.pos += advance as u64;
        }
    }

    fn end_pos(&self) -> Result<u64> {
        self.raw
            .end_pos()
            .map_err(|e| Error::Io(format!("stat {} failed: {e}", self.name)))
    }

    fn is_seekable(&self) -> bool {
        self.raw.is_seekable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_of(bytes: Vec<u8>) -> FileByteSource<Cursor<Vec<u8>>> {
        FileByteSource::new(Cursor::new(bytes), "<test>", false, 1)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn next_and_peek() {
        let mut src = source_of(vec![1, 2, 3]);
        assert_eq!(src.peek().unwrap(), Some(1));
        assert_eq!(src.next().unwrap(), Some(1));
        assert_eq!(src.next().unwrap(), Some(2));
        assert_eq!(src.pos(), 2);
        assert_eq!(src.next().unwrap(), Some(3));
        assert_eq!(src.next().unwrap(), None);
        assert_eq!(src.peek().unwrap(), None);
    }

    #[test]
    fn read_exact_delivers_fragments() {
        // 5000 bytes through a 1 KiB buffer must arrive in multiple chunks.
        let data = pattern(5000);
        let mut src = source_of(data.clone());
        let mut collected = Vec::new();
        let mut fragments = 0;
        src.read_exact(5000, &mut |chunk| {
            fragments += 1;
            collected.extend_from_slice(chunk);
            Ok(())
        })
        .expect("read_exact failed");
        assert_eq!(collected, data);
        assert!(fragments > 1, "expected multiple fragments, got {fragments}");
        assert_eq!(src.pos(), 5000);
    }

    #[test]
    fn read_exact_past_end_is_parse_error() {
        let mut src = source_of(vec![0; 10]);
        let err = src.read_exact(11, &mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got {err:?}");
    }

    #[test]
    fn back_seek_within_history() {
        // A pipe cannot reseek, so this only passes if the history window
        // satisfies the seek from the buffer alone.
        let data = pattern(4000);
        let mut src = FileByteSource::new(Pipe(Cursor::new(data.clone())), "<pipe>", false, 1);
        for _ in 0..3000 {
            src.next().unwrap();
        }
        src.seek(3000 - 1024).expect("back-seek failed");
        assert_eq!(src.next().unwrap(), Some(data[3000 - 1024]));
    }

    #[test]
    fn pin_extends_retained_history() {
        let data = pattern(64 * 1024);
        let mut src = FileByteSource::new(Pipe(Cursor::new(data.clone())), "<pipe>", false, 1);
        for _ in 0..100 {
            src.next().unwrap();
        }
        src.set_pin(100);
        // Drain far past MIN_HIST; the pin must keep position 100 reachable
        // without any backend seek.
        for _ in 0..40_000 {
            src.next().unwrap();
        }
        src.seek(100).expect("seek back to pin failed");
        assert_eq!(src.next().unwrap(), Some(data[100]));
    }

    #[test]
    fn forward_seek_within_buffer() {
        let data = pattern(512);
        let mut src = source_of(data.clone());
        src.peek().unwrap();
        src.seek(200).expect("forward seek failed");
        assert_eq!(src.next().unwrap(), Some(data[200]));
    }

    #[test]
    fn out_of_window_seek_on_seekable_backend() {
        let data = pattern(100_000);
        let mut src = source_of(data.clone());
        src.seek(90_000).expect("far seek failed");
        assert_eq!(src.next().unwrap(), Some(data[90_000]));
        src.seek(10).expect("rewind failed");
        assert_eq!(src.next().unwrap(), Some(data[10]));
    }

    #[test]
    fn seek_past_end_is_io_error() {
        let mut src = source_of(vec![0; 16]);
        let err = src.seek(4096).unwrap_err();
        assert!(matches!(err, Error::Io(_)), "got {err:?}");
    }

    #[test]
    fn scan_to_finds_needle_across_refills() {
        // Put the needle right across the first 1 KiB buffer boundary.
        let mut data = vec![b'x'; 1022];
        data.extend_from_slice(b"NEEDLE");
        data.extend_from_slice(&vec![b'y'; 500]);
        let mut src = source_of(data);
        assert!(src.scan_to(b"NEEDLE").expect("scan failed"));
        assert_eq!(src.pos(), 1022);
        assert_eq!(src.next().unwrap(), Some(b'N'));
    }

    #[test]
    fn scan_to_reports_missing_needle() {
        let mut src = source_of(vec![b'z'; 3000]);
        assert!(!src.scan_to(b"NEEDLE").expect("scan failed"));
    }

    #[test]
    fn pipe_backend_is_not_seekable() {
        let mut src = FileByteSource::new(Pipe(&b"abc"[..]), "<pipe>", false, 1);
        assert!(!src.is_seekable());
        assert_eq!(src.next().unwrap(), Some(b'a'));
        assert!(src.end_pos().is_err());
    }
}
