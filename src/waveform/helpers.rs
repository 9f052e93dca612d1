//! Sample-level helpers used across the filter library.
//!
//! All helpers read the host copy; callers prepare for CPU access first.

use super::timing::get_offset_scaled;
use super::{SparseWaveform, Waveform, WaveformBase};
use crate::accel::{kernels::histogram_bin, AccelResult, Element};

/// A threshold crossing or digital edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing {
    /// Time of the crossing in X units.
    pub timestamp: i64,
    /// True when the signal goes from low to high.
    pub rising: bool,
}

/// Copy offsets, durations and timing from `src`, resizing `dst.samples` to match.
pub fn copy_timestamps<T: Element, U: Element>(
    dst: &mut SparseWaveform<T>,
    src: &SparseWaveform<U>,
) -> AccelResult<()> {
    dst.offsets.copy_from(&src.offsets)?;
    dst.durations.copy_from(&src.durations)?;
    dst.samples.prepare_for_cpu_access_ignoring_gpu_data()?;
    dst.samples.resize(src.len())?;
    dst.header.copy_timing_from(&src.header);
    Ok(())
}

/// Analog value of sample `i`, if `w` is analog.
pub fn analog_value(w: &Waveform, i: usize) -> Option<f32> {
    w.analog_samples().and_then(|s| s.get(i).copied())
}

/// Digital value of sample `i`, if `w` is digital.
pub fn digital_value(w: &Waveform, i: usize) -> Option<bool> {
    w.digital_samples().and_then(|s| s.get(i).copied())
}

/// Linearly interpolated crossings of `threshold`, with direction.
///
/// A sample counts as high when strictly above the threshold. Non-analog
/// waveforms have no crossings.
pub fn find_zero_crossings_directed(w: &Waveform, threshold: f32) -> Vec<Crossing> {
    let samples = match w.analog_samples() {
        Some(s) if s.len() >= 2 => s,
        _ => return Vec::new(),
    };

    let mut out = Vec::new();
    let mut prev_high = samples[0] > threshold;
    for i in 1..samples.len() {
        let high = samples[i] > threshold;
        if high == prev_high {
            continue;
        }
        let (v0, v1) = (samples[i - 1] as f64, samples[i] as f64);
        let t0 = get_offset_scaled(w, i - 1) as f64;
        let t1 = get_offset_scaled(w, i) as f64;
        let frac = if v1 != v0 {
            ((threshold as f64 - v0) / (v1 - v0)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        out.push(Crossing {
            timestamp: (t0 + frac * (t1 - t0)).round() as i64,
            rising: high,
        });
        prev_high = high;
    }
    out
}

/// Timestamps of every crossing of `threshold`.
pub fn find_zero_crossings(w: &Waveform, threshold: f32) -> Vec<i64> {
    find_zero_crossings_directed(w, threshold)
        .into_iter()
        .map(|c| c.timestamp)
        .collect()
}

/// Edges of a digital waveform, timed at the start of the first sample with
/// the new value.
pub fn find_edges(w: &Waveform) -> Vec<Crossing> {
    let samples = match w.digital_samples() {
        Some(s) => s,
        None => return Vec::new(),
    };
    samples
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[0] != pair[1])
        .map(|(i, pair)| Crossing {
            timestamp: get_offset_scaled(w, i + 1),
            rising: pair[1],
        })
        .collect()
}

/// Smallest and largest finite analog sample.
pub fn get_min_max(w: &Waveform) -> Option<(f32, f32)> {
    w.analog_samples()?
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Mean of the analog samples.
pub fn get_average(w: &Waveform) -> Option<f32> {
    let samples = w.analog_samples()?;
    if samples.is_empty() {
        return None;
    }
    let sum: f64 = samples.iter().map(|&v| v as f64).sum();
    Some((sum / samples.len() as f64) as f32)
}

/// `nbins`-bin histogram of the analog samples over `[vmin, vmax]`.
/// Out-of-range samples land in the first or last bin.
pub fn make_histogram(w: &Waveform, vmin: f32, vmax: f32, nbins: usize) -> Vec<i64> {
    let mut bins = vec![0i64; nbins];
    let (Some(samples), true) = (w.analog_samples(), nbins > 0) else {
        return bins;
    };
    let range = (vmax - vmin).max(f32::MIN_POSITIVE);
    for &v in samples {
        bins[histogram_bin(v, vmin, range, nbins)] += 1;
    }
    bins
}
