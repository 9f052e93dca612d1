//! Siglent `.bin` waveform files, layout revisions 2 and 4.
//!
//! Revision 4 inserts four bytes after the version word; every header offset
//! below is shifted by that amount. Offsets are for revision 2.
//!
//! | Offset | Field |
//! |---|---|
//! | 0x000 | version u32 |
//! | 0x004 | analog enable, 4 × i32 |
//! | 0x014 | V/div, 4 × value block |
//! | 0x0B4 | offset, 4 × value block |
//! | 0x154 | digital enable i32 |
//! | 0x158 | per-bit enable, 16 × i32 |
//! | 0x198 | time/div, value block |
//! | 0x1C0 | trigger delay, value block |
//! | 0x1E8 | analog sample count u32 |
//! | 0x1EC | analog sample rate, value block |
//! | 0x214 | digital sample count u32 |
//! | 0x218 | digital sample rate, value block |
//! | 0x240 | probe attenuation, 4 × f64 |
//! | 0x260 | data width i8 (0: one byte, 1: two bytes) |
//! | 0x261 | byte order i8 (0: little endian) |
//! | 0x268 | horizontal divisions i32 |
//! | 0x26C | codes per division, 4 × i32 |
//! | 0x27C | math enable, 4 × i32 |
//! | 0x28C | math V/div, 4 × value block |
//!
//! A value block is an f64 followed by 32 bytes of unit information.
//!
//! Sample data starts at 0x800 (revision 2) or 0x1000 (revision 4): every
//! enabled analog channel in order, then every enabled digital bit packed
//! eight samples per byte, LSB first.

use super::{ByteReader, FormatError, FormatResult, ImportedChannel};
use crate::types::Unit;
use crate::waveform::{UniformWaveform, WaveformBase, WaveformHeader, FS_PER_SECOND};

const ANALOG_CHANNELS: usize = 4;
const DIGITAL_CHANNELS: usize = 16;
const VALUE_BLOCK_LEN: usize = 40;

/// Acquisition settings from the file header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiglentHeader {
    pub version: u32,
    pub analog_enabled: [bool; ANALOG_CHANNELS],
    pub volts_per_div: [f64; ANALOG_CHANNELS],
    pub offset: [f64; ANALOG_CHANNELS],
    pub digital_enabled: bool,
    pub bit_enabled: [bool; DIGITAL_CHANNELS],
    pub time_per_div: f64,
    pub delay: f64,
    pub analog_len: usize,
    pub sample_rate: f64,
    pub digital_len: usize,
    pub digital_rate: f64,
    pub probe: [f64; ANALOG_CHANNELS],
    /// Bytes per analog sample
    pub data_width: usize,
    pub big_endian: bool,
    pub horizontal_divs: i32,
    pub codes_per_div: [i32; ANALOG_CHANNELS],
    pub math_enabled: [bool; ANALOG_CHANNELS],
    pub math_volts_per_div: [f64; ANALOG_CHANNELS],
}

impl SiglentHeader {
    /// Offset of the sample data.
    pub fn data_offset(&self) -> usize {
        if self.version >= 4 {
            0x1000
        } else {
            0x800
        }
    }

    /// Code of 0 V before the channel offset.
    fn center_code(&self) -> f64 {
        let bits = 8 * self.data_width as u32;
        f64::from((1u32 << (bits - 1)) - 1)
    }

    /// Volts per ADC code on channel `ch`.
    fn gain(&self, ch: usize) -> f64 {
        self.volts_per_div[ch] * self.probe[ch] / f64::from(self.codes_per_div[ch].max(1))
    }

    /// Sample placement for data at `rate` samples per second.
    fn timing(&self, rate: f64) -> FormatResult<WaveformHeader> {
        if rate <= 0.0 {
            return Err(FormatError::Unsupported(format!("sample rate {rate}")));
        }
        let timescale = (FS_PER_SECOND as f64 / rate).round() as i64;
        // First sample sits half a screen before the trigger
        let start = -(self.time_per_div * f64::from(self.horizontal_divs) / 2.0) - self.delay;
        Ok(WaveformHeader::new(timescale.max(1), (start * FS_PER_SECOND as f64).round() as i64))
    }
}

fn value_block(r: &mut ByteReader<'_>) -> FormatResult<f64> {
    let v = r.f64()?;
    r.skip(VALUE_BLOCK_LEN - 8)?;
    Ok(v)
}

/// Parse the header.
pub fn read_header(data: &[u8]) -> FormatResult<SiglentHeader> {
    let mut r = ByteReader::new(data);
    let version = r.u32()?;
    if !matches!(version, 2 | 4) {
        return Err(FormatError::Unsupported(format!("Siglent BIN version {version}")));
    }
    if version == 4 {
        r.skip(4)?;
    }
    let mut h = SiglentHeader {
        version,
        ..Default::default()
    };
    for en in h.analog_enabled.iter_mut() {
        *en = r.i32()? != 0;
    }
    for v in h.volts_per_div.iter_mut() {
        *v = value_block(&mut r)?;
    }
    for v in h.offset.iter_mut() {
        *v = value_block(&mut r)?;
    }
    h.digital_enabled = r.i32()? != 0;
    for en in h.bit_enabled.iter_mut() {
        *en = r.i32()? != 0;
    }
    h.time_per_div = value_block(&mut r)?;
    h.delay = value_block(&mut r)?;
    h.analog_len = r.u32()? as usize;
    h.sample_rate = value_block(&mut r)?;
    h.digital_len = r.u32()? as usize;
    h.digital_rate = value_block(&mut r)?;
    for p in h.probe.iter_mut() {
        *p = r.f64()?;
    }
    h.data_width = match r.u8()? {
        0 => 1,
        1 => 2,
        other => return Err(FormatError::Unsupported(format!("data width code {other}"))),
    };
    h.big_endian = r.u8()? != 0;
    r.skip(6)?;
    h.horizontal_divs = r.i32()?;
    for c in h.codes_per_div.iter_mut() {
        *c = r.i32()?;
    }
    for en in h.math_enabled.iter_mut() {
        *en = r.i32()? != 0;
    }
    for v in h.math_volts_per_div.iter_mut() {
        *v = value_block(&mut r)?;
    }
    Ok(h)
}

/// Parse a whole file.
///
/// Math traces are described in the header but carry no sample data, so only
/// analog and digital channels are returned.
pub fn read_siglent_bin(data: &[u8]) -> FormatResult<Vec<ImportedChannel>> {
    let h = read_header(data)?;
    tracing::debug!("Siglent BIN v{}: {:?}", h.version, h);
    if h.math_enabled.iter().any(|&m| m) {
        tracing::warn!("Siglent BIN: math traces are not stored in the file and are skipped");
    }
    let mut r = ByteReader::at(data, h.data_offset());
    let mut out = Vec::new();

    let center = h.center_code();
    for ch in (0..ANALOG_CHANNELS).filter(|&c| h.analog_enabled[c]) {
        let raw = r.bytes(h.analog_len * h.data_width)?;
        let gain = h.gain(ch);
        let samples: Vec<f32> = match h.data_width {
            1 => raw.iter().map(|&b| f64::from(b)).collect::<Vec<_>>(),
            _ => raw
                .chunks_exact(2)
                .map(|c| {
                    let pair = [c[0], c[1]];
                    f64::from(if h.big_endian {
                        u16::from_be_bytes(pair)
                    } else {
                        u16::from_le_bytes(pair)
                    })
                })
                .collect(),
        }
        .into_iter()
        .map(|code| ((code - center) * gain + h.offset[ch]) as f32)
        .collect();
        let mut w = UniformWaveform::from_samples(samples, 1, 0);
        *w.header_mut() = h.timing(h.sample_rate)?;
        out.push(ImportedChannel::new(format!("C{}", ch + 1), Unit::Volts, w));
    }

    if h.digital_enabled {
        let packed_len = h.digital_len.div_ceil(8);
        for bit in (0..DIGITAL_CHANNELS).filter(|&b| h.bit_enabled[b]) {
            let packed = r.bytes(packed_len)?;
            let samples: Vec<bool> = (0..h.digital_len).map(|i| packed[i / 8] >> (i % 8) & 1 == 1).collect();
            let mut w = UniformWaveform::from_samples(samples, 1, 0);
            *w.header_mut() = h.timing(h.digital_rate)?;
            out.push(ImportedChannel::new(format!("D{bit}"), Unit::Counts, w));
        }
    }
    tracing::info!("Siglent BIN: {} streams", out.len());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes a header image field by field at revision-2 offsets.
    struct Image {
        version: u32,
        buf: Vec<u8>,
    }

    impl Image {
        fn new(version: u32) -> Self {
            let mut img = Self {
                version,
                buf: vec![0; if version >= 4 { 0x1000 } else { 0x800 }],
            };
            img.buf[0..4].copy_from_slice(&version.to_le_bytes());
            img
        }

        fn put(&mut self, offset: usize, bytes: &[u8]) {
            let at = offset + if self.version >= 4 { 4 } else { 0 };
            self.buf[at..at + bytes.len()].copy_from_slice(bytes);
        }

        fn put_i32(&mut self, offset: usize, v: i32) {
            self.put(offset, &v.to_le_bytes());
        }

        fn put_f64(&mut self, offset: usize, v: f64) {
            self.put(offset, &v.to_le_bytes());
        }
    }

    /// C2 enabled at 1 V/div, probe 10x, 25 codes/div, 0.5 V offset, 1 GS/s.
    fn sample_image(version: u32, width_code: u8) -> Image {
        let mut img = Image::new(version);
        img.put_i32(0x04 + 4, 1);
        img.put_f64(0x14 + VALUE_BLOCK_LEN, 1.0);
        img.put_f64(0xB4 + VALUE_BLOCK_LEN, 0.5);
        img.put_f64(0x198, 1e-6);
        img.put_i32(0x1E8, 3);
        img.put_f64(0x1EC, 1e9);
        img.put_f64(0x240 + 8, 10.0);
        img.put(0x260, &[width_code, 0]);
        img.put_i32(0x268, 10);
        img.put_i32(0x26C + 4, 25);
        img
    }

    #[test]
    fn test_v2_eight_bit() {
        let mut img = sample_image(2, 0);
        img.buf.extend_from_slice(&[127, 152, 102]);
        let ch = read_siglent_bin(&img.buf).unwrap();
        assert_eq!(ch.len(), 1);
        assert_eq!(ch[0].name, "C2");
        let w = ch[0].waveform.as_uniform_analog().unwrap();
        // 0.4 V per code
        assert_eq!(w.samples.to_vec(), vec![0.5, 10.5, -9.5]);
        assert_eq!(w.header.timescale, 1_000_000);
        assert_eq!(w.header.trigger_phase, -5_000_000_000);
    }

    #[test]
    fn test_v4_sixteen_bit() {
        let mut img = sample_image(4, 1);
        for code in [32767u16, 32792, 32742] {
            img.buf.extend_from_slice(&code.to_le_bytes());
        }
        let h = read_header(&img.buf).unwrap();
        assert_eq!(h.version, 4);
        assert_eq!(h.data_width, 2);
        assert_eq!(h.data_offset(), 0x1000);
        let ch = read_siglent_bin(&img.buf).unwrap();
        assert_eq!(ch[0].waveform.analog_samples().unwrap(), &[0.5, 10.5, -9.5]);
    }

    #[test]
    fn test_digital_bits() {
        let mut img = sample_image(2, 0);
        img.put_i32(0x04 + 4, 0);
        img.put_i32(0x154, 1);
        img.put_i32(0x158 + 3 * 4, 1);
        img.put_i32(0x214, 10);
        img.put_f64(0x218, 1e8);
        img.buf.extend_from_slice(&[0b1000_0101, 0b10]);
        let ch = read_siglent_bin(&img.buf).unwrap();
        assert_eq!(ch.len(), 1);
        assert_eq!(ch[0].name, "D3");
        assert_eq!(
            ch[0].waveform.digital_samples().unwrap(),
            &[true, false, true, false, false, false, false, true, false, true]
        );
        assert_eq!(ch[0].waveform.header().timescale, 10_000_000);
    }

    #[test]
    fn test_unknown_version() {
        let mut img = Image::new(2);
        img.buf[0] = 3;
        assert!(matches!(read_siglent_bin(&img.buf), Err(FormatError::Unsupported(_))));
    }

    #[test]
    fn test_missing_samples() {
        let mut img = sample_image(2, 0);
        img.buf.push(127);
        assert!(matches!(read_siglent_bin(&img.buf), Err(FormatError::Truncated(_))));
    }
}
