//! Agilent, Keysight and Rigol `.bin` waveform files.
//!
//! ```text
//! file header   magic[2] ("AG" or "RG"), version[2], file size u32, waveform count u32
//! per waveform  header (header size u32 first), then `buffers` data blocks
//! per buffer    header {size u32, type i16, bytes per point i16, length u32}, then data
//! ```
//!
//! Waveform types 5 and 6 are logic pods: every data byte packs eight
//! digital channels, bit 0 first. Everything else is float32 analog.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use super::{ByteReader, FormatError, FormatResult, ImportedChannel};
use crate::types::Unit;
use crate::waveform::{UniformWaveform, WaveformBase, WaveformHeader, FS_PER_SECOND};

const FILE_HEADER_LEN: usize = 12;

/// Logic pod holding D0 to D7.
const TYPE_LOGIC_LOW: u32 = 5;
/// Logic pod holding D8 to D15.
const TYPE_LOGIC_HIGH: u32 = 6;

#[derive(Debug, Clone, Default)]
struct WaveHeader {
    wave_type: u32,
    buffers: u32,
    samples: u32,
    interval: f64,
    origin: f64,
    date: String,
    time: String,
    hardware: String,
    label: String,
}

impl WaveHeader {
    fn read(r: &mut ByteReader<'_>) -> FormatResult<Self> {
        let start = r.position();
        let header_size = r.u32()? as usize;
        let wave_type = r.u32()?;
        let buffers = r.u32()?;
        let samples = r.u32()?;
        let _averaging = r.u32()?;
        let _duration = r.f32()?;
        let _display_start = r.f64()?;
        let interval = r.f64()?;
        let origin = r.f64()?;
        let _x_units = r.u32()?;
        let _y_units = r.u32()?;
        let date = r.fixed_str(16)?;
        let time = r.fixed_str(16)?;
        let hardware = r.fixed_str(24)?;
        let label = r.fixed_str(16)?;
        // Newer files carry time tag and segment index after the label
        r.seek(start + header_size);
        Ok(Self {
            wave_type,
            buffers,
            samples,
            interval,
            origin,
            date,
            time,
            hardware,
            label,
        })
    }

    fn is_logic(&self) -> bool {
        matches!(self.wave_type, TYPE_LOGIC_LOW | TYPE_LOGIC_HIGH)
    }

    /// Acquisition time from the date and time fields.
    fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        let date = ["%d %b %Y", "%d-%b-%Y", "%Y-%m-%d", "%Y/%m/%d"]
            .iter()
            .find_map(|f| NaiveDate::parse_from_str(&self.date, f).ok())?;
        let time = NaiveTime::parse_from_str(&self.time, "%H:%M:%S%.f")
            .or_else(|_| NaiveTime::parse_from_str(&self.time, "%H:%M:%S"))
            .ok()?;
        Some(NaiveDateTime::new(date, time).and_utc())
    }

    fn waveform_header(&self) -> WaveformHeader {
        let timescale = (self.interval * FS_PER_SECOND as f64).round().max(1.0) as i64;
        let mut header = WaveformHeader::new(timescale, (self.origin * FS_PER_SECOND as f64).round() as i64);
        if let Some(t) = self.timestamp() {
            header.set_start_time(t);
        }
        header
    }
}

#[derive(Debug, Clone, Copy)]
struct DataHeader {
    bytes_per_point: i16,
    length: usize,
}

impl DataHeader {
    fn read(r: &mut ByteReader<'_>) -> FormatResult<Self> {
        let start = r.position();
        let header_size = r.u32()? as usize;
        let _buffer_type = r.i16()?;
        let bytes_per_point = r.i16()?;
        let length = r.u32()? as usize;
        r.seek(start + header_size);
        Ok(Self {
            bytes_per_point,
            length,
        })
    }
}

/// Parse a whole `.bin` file.
pub fn read_agilent_bin(data: &[u8]) -> FormatResult<Vec<ImportedChannel>> {
    let mut r = ByteReader::new(data);
    let magic = r.bytes(2)?;
    if magic != b"AG" && magic != b"RG" {
        return Err(FormatError::BadMagic(String::from_utf8_lossy(magic).into_owned()));
    }
    let _version = r.bytes(2)?;
    let _file_size = r.u32()?;
    let count = r.u32()?;
    debug_assert_eq!(r.position(), FILE_HEADER_LEN);

    let mut out = Vec::new();
    for index in 0..count {
        let wave = WaveHeader::read(&mut r)?;
        tracing::debug!(
            "BIN waveform {}: type {}, {} buffers, {} samples, {} ({})",
            index,
            wave.wave_type,
            wave.buffers,
            wave.samples,
            wave.label,
            wave.hardware
        );
        for buffer in 0..wave.buffers {
            let dh = DataHeader::read(&mut r)?;
            let payload = r.bytes(dh.length)?;
            let name = if wave.label.is_empty() {
                format!("CH{}", index + 1)
            } else {
                wave.label.clone()
            };
            // Extra buffers hold min/max envelopes
            let name = if buffer == 0 { name } else { format!("{name}_{buffer}") };

            if wave.is_logic() {
                out.extend(logic_channels(&wave, payload));
            } else {
                if dh.bytes_per_point != 4 {
                    return Err(FormatError::Unsupported(format!(
                        "{} bytes per analog point in '{name}'",
                        dh.bytes_per_point
                    )));
                }
                let samples: Vec<f32> = payload
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                let mut w = UniformWaveform::from_samples(samples, 1, 0);
                *w.header_mut() = wave.waveform_header();
                out.push(ImportedChannel::new(name, Unit::Volts, w));
            }
        }
    }
    tracing::info!("BIN: {} waveforms, {} streams", count, out.len());
    Ok(out)
}

fn logic_channels(wave: &WaveHeader, payload: &[u8]) -> Vec<ImportedChannel> {
    let first = if wave.wave_type == TYPE_LOGIC_HIGH { 8 } else { 0 };
    (0..8)
        .map(|bit| {
            let samples = payload.iter().map(|b| b >> bit & 1 == 1).collect();
            let mut w = UniformWaveform::from_samples(samples, 1, 0);
            *w.header_mut() = wave.waveform_header();
            ImportedChannel::new(format!("D{}", first + bit), Unit::Counts, w)
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::encode::{file, Wave};
    use super::*;

    fn analog<'a>(label: &'a str, values: &[f32]) -> Wave<'a> {
        Wave {
            wave_type: 1,
            interval: 1e-9,
            origin: -5e-9,
            label,
            date: "12 MAR 2024",
            time: "14:03:22",
            bytes_per_point: 4,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    #[test]
    fn test_analog_waveforms() {
        let bytes = file(b"AG", &[analog("1", &[0.5, -0.25, 1.0]), analog("", &[2.0])]);
        let ch = read_agilent_bin(&bytes).unwrap();
        assert_eq!(ch.len(), 2);
        assert_eq!(ch[0].name, "1");
        assert_eq!(ch[1].name, "CH2");
        let w = ch[0].waveform.as_uniform_analog().unwrap();
        assert_eq!(w.samples.to_vec(), vec![0.5, -0.25, 1.0]);
        assert_eq!(w.header.timescale, 1_000_000);
        assert_eq!(w.header.trigger_phase, -5_000_000);
        let start = w.header.start_time().unwrap();
        assert_eq!(start.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-03-12 14:03:22");
    }

    #[test]
    fn test_logic_pod() {
        let mut wave = analog("", &[]);
        wave.wave_type = 6;
        wave.bytes_per_point = 1;
        wave.data = vec![0b0000_0001, 0b1000_0000, 0b1000_0001];
        let ch = read_agilent_bin(&file(b"RG", &[wave])).unwrap();
        assert_eq!(ch.len(), 8);
        assert_eq!(ch[0].name, "D8");
        assert_eq!(ch[0].waveform.digital_samples().unwrap(), &[true, false, true]);
        assert_eq!(ch[7].name, "D15");
        assert_eq!(ch[7].waveform.digital_samples().unwrap(), &[false, true, true]);
        assert_eq!(ch[3].waveform.digital_samples().unwrap(), &[false, false, false]);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = file(b"AG", &[analog("1", &[1.0])]);
        bytes[0] = b'X';
        assert!(matches!(read_agilent_bin(&bytes), Err(FormatError::BadMagic(_))));
    }

    #[test]
    fn test_truncated() {
        let bytes = file(b"AG", &[analog("1", &[1.0, 2.0])]);
        assert!(matches!(
            read_agilent_bin(&bytes[..bytes.len() - 3]),
            Err(FormatError::Truncated(_))
        ));
    }

    #[test]
    fn test_unparseable_date_is_ignored() {
        let mut wave = analog("1", &[1.0]);
        wave.date = "garbage";
        let ch = read_agilent_bin(&file(b"AG", &[wave])).unwrap();
        assert_eq!(ch[0].waveform.header().start_timestamp, 0);
    }
}
