//! RIFF/WAVE import.
//!
//! PCM 8 and 16 bit and IEEE float 32 bit are accepted. Integer samples are
//! normalized to [-1, 1]. Each WAV channel becomes one uniform analog stream.

use std::io::Read;

use hound::{SampleFormat, WavReader};

use super::{FormatError, FormatResult, ImportedChannel};
use crate::types::Unit;
use crate::waveform::{UniformWaveform, FS_PER_SECOND};

/// Read every channel of a WAV file.
pub fn read_wav(reader: impl Read) -> FormatResult<Vec<ImportedChannel>> {
    let mut wav = WavReader::new(reader)?;
    let spec = wav.spec();
    if spec.sample_rate == 0 {
        return Err(FormatError::Unsupported("sample rate of 0 Hz".into()));
    }
    let nchans = usize::from(spec.channels);

    let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        // hound hands 8-bit data over as u8 - 128; scale the unsigned value as (v - 127) / 127
        (SampleFormat::Int, 8) => wav
            .samples::<i8>()
            .map(|s| s.map(|v| (f32::from(v) + 1.0) / 127.0))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Int, 16) => wav
            .samples::<i16>()
            .map(|s| s.map(|v| f32::from(v) / 32768.0))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Float, 32) => wav.samples::<f32>().collect::<Result<_, _>>()?,
        (format, bits) => {
            return Err(FormatError::Unsupported(format!("{bits}-bit {format:?} samples")));
        }
    };

    let timescale = FS_PER_SECOND / i64::from(spec.sample_rate);
    let per_channel = interleaved.len() / nchans.max(1);
    let channels = (0..nchans)
        .map(|c| {
            let samples: Vec<f32> = interleaved.iter().skip(c).step_by(nchans).copied().take(per_channel).collect();
            ImportedChannel::new(
                format!("CH{}", c + 1),
                Unit::Unitless,
                UniformWaveform::from_samples(samples, timescale, 0),
            )
        })
        .collect::<Vec<_>>();
    tracing::info!(
        "WAV: {} channels, {} Hz, {} samples each",
        nchans,
        spec.sample_rate,
        per_channel
    );
    Ok(channels)
}
