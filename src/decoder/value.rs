//! Pull parser for the body of one value frame. Drives a [`ValueHandler`]
//! callback for every token; strings are delivered as start / fragment(s) /
//! end so bodies larger than the source buffer never need to be assembled.

use byteorder::{ByteOrder, LittleEndian};

use crate::decoder::ValueHandler;
use crate::errparse;
use crate::error::Result;
use crate::format;
use crate::source::ByteSource;
use crate::varint;

pub struct ValueParser<'a, S: ByteSource, H: ValueHandler> {
    source: &'a mut S,
    handler: &'a mut H,
}

impl<'a, S: ByteSource, H: ValueHandler> ValueParser<'a, S, H> {
    pub fn new(source: &'a mut S, handler: &'a mut H) -> Self {
        Self { source, handler }
    }

    /// Parses exactly one value (scalars recurse through arrays and
    /// objects). The callback position of each scalar is its opcode byte.
    pub fn value(&mut self) -> Result<()> {
        let pos = self.source.pos();
        let byte = match self.source.next()? {
            Some(b) => b,
            None => {
                return errparse!("{}: unexpected eof at {pos} expecting a value", self.source.name())
            }
        };
        match byte {
            format::NULL => self.handler.on_null(pos),
            format::TRUE => self.handler.on_bool(pos, true),
            format::FALSE => self.handler.on_bool(pos, false),
            format::INT => {
                let value = varint::read_i64(self.source)?;
                self.handler.on_int(pos, value)
            }
            format::UINT => {
                let value = varint::read_u64(self.source)?;
                self.handler.on_uint(pos, value)
            }
            format::DOUBLE => {
                let mut bytes = [0u8; 8];
                let mut filled = 0;
                self.source.read_exact(8, &mut |chunk| {
                    bytes[filled..filled + chunk.len()].copy_from_slice(chunk);
                    filled += chunk.len();
                    Ok(())
                })?;
                self.handler.on_double(pos, LittleEndian::read_f64(&bytes))
            }
            format::TIME => {
                let nanos = varint::read_i64(self.source)?;
                self.handler.on_time(pos, nanos)
            }
            format::STRING => {
                let len = varint::read_u64(self.source)?;
                self.string(pos, len)
            }
            format::DICT_REF => {
                let index = varint::read_u64(self.source)?;
                self.handler.on_dict_ref(pos, index)
            }
            format::OBJECT_START => {
                self.handler.on_object_start()?;
                self.sequence(format::OBJECT_END)?;
                self.handler.on_object_end()
            }
            format::ARRAY_START => {
                self.handler.on_array_start()?;
                self.sequence(format::ARRAY_END)?;
                self.handler.on_array_end()
            }
            other => errparse!(
                "{}: invalid value opcode {:#04x} at {pos}",
                self.source.name(),
                other
            ),
        }
    }

    /// Parses values until the given terminator byte.
    fn sequence(&mut self, terminator: u8) -> Result<()> {
        loop {
            match self.source.peek()? {
                Some(b) if b == terminator => {
                    self.source.next()?;
                    return Ok(());
                }
                Some(_) => self.value()?,
                None => {
                    return errparse!(
                        "{}: unexpected eof at {} inside a container",
                        self.source.name(),
                        self.source.pos()
                    )
                }
            }
        }
    }

    fn string(&mut self, pos: u64, len: u64) -> Result<()> {
        self.handler.on_string_start(pos, len)?;
        let Self { source, handler } = self;
        source.read_exact(len, &mut |fragment| handler.on_string_fragment(fragment))?;
        self.handler.on_string_end()
    }
}
