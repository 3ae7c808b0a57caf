//! Variable-width integers: unsigned LEB128-style little-endian 7-bit groups
//! with a continuation bit, signed values via zig-zag mapping. A 64-bit value
//! takes at most 10 bytes; encodings are always minimal length.

use crate::errparse;
use crate::error::Result;
use crate::source::ByteSource;

/// Longest possible encoding of a 64-bit value.
pub const MAX_LEN: usize = 10;

/// Appends the minimal-length encoding of `value` to `out`.
pub fn write_u64(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Appends the zig-zag encoding of `value` to `out`.
pub fn write_i64(out: &mut Vec<u8>, value: i64) {
    write_u64(out, zigzag(value));
}

/// Number of bytes `value` occupies on the wire.
pub fn encoded_len(value: u64) -> usize {
    let mut len = 1;
    let mut v = value >> 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Reads one unsigned varint from the source. Premature EOF mid-varint and
/// encodings that would overflow 64 bits are parse errors.
pub fn read_u64<S: ByteSource>(source: &mut S) -> Result<u64> {
    let start = source.pos();
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = match source.next()? {
            Some(b) => b,
            None => return errparse!("unexpected eof mid-varint at {start}"),
        };
        if shift == 63 && byte > 1 {
            return errparse!("varint at {start} overflows 64 bits");
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return errparse!("varint at {start} overflows 64 bits");
        }
    }
}

/// Reads one zig-zag-encoded signed varint from the source.
pub fn read_i64<S: ByteSource>(source: &mut S) -> Result<i64> {
    Ok(unzigzag(read_u64(source)?))
}

/// Number of bytes the zig-zag encoding of `value` occupies on the wire.
pub fn encoded_len_i64(value: i64) -> usize {
    encoded_len(zigzag(value))
}

fn zigzag(value: i64) -> u64 {
    ((value as u64) << 1) ^ ((value >> 63) as u64)
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::file::FileByteSource;
    use std::io::Cursor;

    fn source_of(bytes: Vec<u8>) -> FileByteSource<Cursor<Vec<u8>>> {
        FileByteSource::new(Cursor::new(bytes), "<test>", false, 256)
    }

    #[test]
    fn unsigned_round_trip() {
        let cases = [
            0u64,
            1,
            127,
            128,
            129,
            300,
            16_383,
            16_384,
            u32::MAX as u64,
            u64::MAX - 1,
            u64::MAX,
        ];
        for &v in &cases {
            let mut buf = Vec::new();
            write_u64(&mut buf, v);
            assert_eq!(buf.len(), encoded_len(v));
            let mut src = source_of(buf);
            assert_eq!(read_u64(&mut src).expect("decode failed"), v);
            assert_eq!(src.peek().expect("peek failed"), None, "trailing bytes for {v}");
        }
    }

    #[test]
    fn signed_round_trip() {
        let cases = [0i64, 1, -1, 63, -64, 64, -65, i64::MAX, i64::MIN];
        for &v in &cases {
            let mut buf = Vec::new();
            write_i64(&mut buf, v);
            let mut src = source_of(buf);
            assert_eq!(read_i64(&mut src).expect("decode failed"), v);
        }
    }

    #[test]
    fn minimal_length_boundaries() {
        assert_eq!(encoded_len(0), 1);
        assert_eq!(encoded_len(127), 1);
        assert_eq!(encoded_len(128), 2);
        assert_eq!(encoded_len((1 << 14) - 1), 2);
        assert_eq!(encoded_len(1 << 14), 3);
        assert_eq!(encoded_len(u64::MAX), 10);
    }

    #[test]
    fn truncated_varint_is_parse_error() {
        let mut src = source_of(vec![0x80, 0x80]);
        match read_u64(&mut src) {
            Err(crate::Error::Parse(msg)) => assert!(msg.contains("eof")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn overlong_varint_is_parse_error() {
        // Eleven continuation groups can never fit in 64 bits.
        let mut src = source_of(vec![0x80; 10].into_iter().chain([0x01]).collect());
        assert!(read_u64(&mut src).is_err());

        // Ten bytes whose final group sets bits above 63.
        let mut bytes = vec![0x80; 9];
        bytes.push(0x02);
        let mut src = source_of(bytes);
        assert!(read_u64(&mut src).is_err());
    }
}
