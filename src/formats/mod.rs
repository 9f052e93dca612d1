//! Waveform file codecs.
//!
//! Readers turn a file into a list of [`ImportedChannel`]s; writers take
//! named waveforms. The import and export filters in `crate::filters` wrap
//! these for use in a graph.
//!
//! | Module | Direction |
//! |---|---|
//! | [`vcd`] | in / out |
//! | [`csv`] | in / out |
//! | [`wav`] | in |
//! | [`agilent_bin`] | in |
//! | [`siglent_bin`] | in |
//! | [`touchstone`] | in / out |

pub mod agilent_bin;
pub mod csv;
pub mod siglent_bin;
pub mod touchstone;
pub mod vcd;
pub mod wav;

use crate::types::Unit;
use crate::waveform::Waveform;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Truncated file: {0}")]
    Truncated(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Bad magic: {0}")]
    BadMagic(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

impl FormatError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        FormatError::Parse {
            line,
            message: message.into(),
        }
    }
}

pub type FormatResult<T> = std::result::Result<T, FormatError>;

/// One stream read from a file.
#[derive(Debug)]
pub struct ImportedChannel {
    pub name: String,
    pub x_unit: Unit,
    pub y_unit: Unit,
    pub waveform: Waveform,
}

impl ImportedChannel {
    pub fn new(name: impl Into<String>, y_unit: Unit, waveform: impl Into<Waveform>) -> Self {
        Self {
            name: name.into(),
            x_unit: Unit::Femtoseconds,
            y_unit,
            waveform: waveform.into(),
        }
    }

    pub fn with_x_unit(mut self, unit: Unit) -> Self {
        self.x_unit = unit;
        self
    }

    pub fn is_digital(&self) -> bool {
        self.waveform.is_digital()
    }
}

/// Little-endian cursor over a byte slice.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! read_le {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self) -> FormatResult<$ty> {
                let bytes = self.bytes(std::mem::size_of::<$ty>())?;
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(raw))
            }
        )*
    };
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn skip(&mut self, n: usize) -> FormatResult<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn bytes(&mut self, n: usize) -> FormatResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len()).ok_or_else(|| {
            FormatError::Truncated(format!("need {n} bytes at offset {:#x}, file is {:#x}", self.pos, self.buf.len()))
        })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Fixed-width, NUL-padded text field.
    pub fn fixed_str(&mut self, n: usize) -> FormatResult<String> {
        let raw = self.bytes(n)?;
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..len]).trim().to_string())
    }

    pub fn u8(&mut self) -> FormatResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    read_le!(i16: i16, u16: u16, i32: i32, u32: u32, f32: f32, f64: f64);
}

/// Remove the longest common prefix ending in `sep` from every name.
///
/// A lone name keeps only its last component.
pub fn strip_common_prefix(names: &mut [String], sep: char) {
    let Some(first) = names.first() else {
        return;
    };
    let mut prefix_len = first.len();
    for n in names.iter().skip(1) {
        prefix_len = first
            .char_indices()
            .zip(n.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map_or(0, |((i, c), _)| i + c.len_utf8())
            .min(prefix_len);
    }
    // Only cut on a separator so "clk" and "clk_div" stay whole
    let cut = first[..prefix_len].rfind(sep).map_or(0, |i| i + sep.len_utf8());
    if cut == 0 {
        return;
    }
    for n in names.iter_mut() {
        n.replace_range(..cut, "");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_reader() {
        let data = [0x01, 0x00, 0x00, 0x00, b'A', b'G', 0, 0, 0x00, 0x00, 0x80, 0x3f];
        let mut r = ByteReader::new(&data);
        assert_eq!(r.u32().unwrap(), 1);
        assert_eq!(r.fixed_str(4).unwrap(), "AG");
        assert_eq!(r.f32().unwrap(), 1.0);
        assert_eq!(r.remaining(), 0);
        assert!(matches!(r.u8(), Err(FormatError::Truncated(_))));
    }

    #[test]
    fn test_strip_common_prefix() {
        let mut names = vec!["top.cpu.clk".to_string(), "top.cpu.rst".into(), "top.mem.we".into()];
        strip_common_prefix(&mut names, '.');
        assert_eq!(names, vec!["cpu.clk", "cpu.rst", "mem.we"]);
    }

    #[test]
    fn test_strip_common_prefix_keeps_partial_words() {
        let mut names = vec!["top.clk".to_string(), "top.clk_div".into()];
        strip_common_prefix(&mut names, '.');
        assert_eq!(names, vec!["clk", "clk_div"]);

        let mut single = vec!["tb.dut.sda".to_string()];
        strip_common_prefix(&mut single, '.');
        assert_eq!(single, vec!["sda"]);
    }
}
