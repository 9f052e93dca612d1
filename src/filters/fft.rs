//! Spectrum of a uniformly sampled analog waveform.
//!
//! The output is a uniform waveform whose X axis is frequency: its timescale
//! is the bin width in Hz and sample `k` is bin `k` in dB relative to one
//! unit of input amplitude.

use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

use crate::pipeline::{
    is_analog, Filter, FilterCategory, FilterCore, FilterParameter, PipelineError, PipelineResult, RefreshContext,
    Stream, StreamType,
};
use crate::types::{Color, Unit};
use crate::waveform::{UniformWaveform, WaveformBase, FS_PER_SECOND};

/// Floor for empty bins.
const MIN_DB: f32 = -200.0;

/// Window function applied before the transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowFunction {
    /// No windowing
    Rectangular,
    /// Good general purpose
    #[default]
    Hann,
    /// Reduced side lobes
    Hamming,
    /// Very low side lobes
    Blackman,
    /// Accurate amplitude measurement
    FlatTop,
}

impl WindowFunction {
    pub fn display_name(&self) -> &'static str {
        match self {
            WindowFunction::Rectangular => "Rectangular",
            WindowFunction::Hann => "Hann",
            WindowFunction::Hamming => "Hamming",
            WindowFunction::Blackman => "Blackman",
            WindowFunction::FlatTop => "Flat-Top",
        }
    }

    pub fn all() -> &'static [WindowFunction] {
        &[
            WindowFunction::Rectangular,
            WindowFunction::Hann,
            WindowFunction::Hamming,
            WindowFunction::Blackman,
            WindowFunction::FlatTop,
        ]
    }

    /// Value of the "Window" parameter that selects this window.
    pub fn id(self) -> i64 {
        self as i64
    }

    pub fn from_id(id: i64) -> Option<Self> {
        Self::all().iter().copied().find(|w| w.id() == id)
    }

    /// Coefficient at position i out of n samples
    pub fn coefficient(&self, i: usize, n: usize) -> f64 {
        let x = 2.0 * PI * i as f64 / n as f64;
        match self {
            WindowFunction::Rectangular => 1.0,
            WindowFunction::Hann => 0.5 * (1.0 - x.cos()),
            WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
            // Exactly 0 at the endpoints, but rounding can dip below
            WindowFunction::Blackman => (0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()).max(0.0),
            WindowFunction::FlatTop => {
                0.21557895 - 0.41663158 * x.cos() + 0.277263158 * (2.0 * x).cos()
                    - 0.083578947 * (3.0 * x).cos()
                    + 0.006947368 * (4.0 * x).cos()
            }
        }
    }

    pub fn generate(&self, n: usize) -> Vec<f64> {
        (0..n).map(|i| self.coefficient(i, n)).collect()
    }

    /// Mean coefficient, used to undo the window's amplitude loss.
    fn coherent_gain(&self, n: usize) -> f64 {
        self.generate(n).iter().sum::<f64>() / n as f64
    }
}

/// One-sided amplitude spectrum.
#[derive(Debug, Clone)]
pub struct Spectrum {
    /// Bin width in Hz
    pub bin_hz: f64,
    /// Amplitude per bin (linear)
    pub magnitudes: Vec<f64>,
}

impl Spectrum {
    /// Frequency and magnitude of the strongest non-DC bin.
    pub fn peak(&self) -> Option<(f64, f64)> {
        self.magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(k, &m)| (k as f64 * self.bin_hz, m))
    }

    pub fn db(&self) -> Vec<f32> {
        self.magnitudes
            .iter()
            .map(|&m| if m > 1e-10 { (20.0 * m.log10()) as f32 } else { MIN_DB })
            .collect()
    }
}

/// Spectrum of `samples` taken at `sample_rate` Hz.
pub fn compute_spectrum(
    planner: &mut FftPlanner<f64>,
    samples: &[f32],
    sample_rate: f64,
    window: WindowFunction,
    remove_dc: bool,
) -> Spectrum {
    let n = samples.len();
    if n == 0 {
        return Spectrum {
            bin_hz: 0.0,
            magnitudes: Vec::new(),
        };
    }

    let mean = if remove_dc {
        samples.iter().map(|&s| f64::from(s)).sum::<f64>() / n as f64
    } else {
        0.0
    };
    let coeffs = window.generate(n);
    let mut buffer: Vec<Complex<f64>> = samples
        .iter()
        .zip(&coeffs)
        .map(|(&s, &w)| Complex::new((f64::from(s) - mean) * w, 0.0))
        .collect();

    planner.plan_fft_forward(n).process(&mut buffer);

    let scale = 2.0 / (n as f64 * window.coherent_gain(n));
    let magnitudes = buffer
        .iter()
        .take(n / 2 + 1)
        .enumerate()
        .map(|(k, c)| {
            // DC and Nyquist have no mirror image
            let m = c.norm() * scale;
            if k == 0 || (n % 2 == 0 && k == n / 2) {
                m / 2.0
            } else {
                m
            }
        })
        .collect();

    Spectrum {
        bin_hz: sample_rate / n as f64,
        magnitudes,
    }
}

pub struct FftFilter {
    core: FilterCore,
    planner: FftPlanner<f64>,
}

impl FftFilter {
    pub const PROTOCOL: &'static str = "FFT";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Rf, Color::rgb(0xff, 0x60, 0x60));
        core.add_input("din");
        core.add_stream(Stream::new("spectrum", StreamType::Analog, Unit::Hertz, Unit::Decibels));
        core.add_stream(Stream::scalar("peak", Unit::Hertz));

        // Default window first
        let mut windows: Vec<(&str, i64)> = vec![(WindowFunction::Hann.display_name(), WindowFunction::Hann.id())];
        windows.extend(
            WindowFunction::all()
                .iter()
                .filter(|&&w| w != WindowFunction::Hann)
                .map(|w| (w.display_name(), w.id())),
        );
        core.parameters.insert("Window", FilterParameter::enumeration(&windows));
        core.parameters.insert("Remove DC", FilterParameter::bool(true));
        Self {
            core,
            planner: FftPlanner::new(),
        }
    }
}

impl Default for FftFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for FftFilter {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        slot == 0 && is_analog(stream) && stream.x_unit == Unit::Femtoseconds
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let window = WindowFunction::from_id(self.core.parameters.int("Window")).unwrap_or_default();
        let remove_dc = self.core.parameters.bool("Remove DC");

        let input = ctx.inputs.require_waveform(0)?;
        let uniform = input
            .as_uniform_analog()
            .ok_or_else(|| PipelineError::invalid("din", "FFT needs uniformly sampled input"))?;
        if uniform.len() < 2 {
            return Err(PipelineError::WaveformTooShort(format!("{} samples", uniform.len())));
        }

        let sample_rate = FS_PER_SECOND as f64 / uniform.header().timescale as f64;
        let spectrum = compute_spectrum(
            &mut self.planner,
            uniform.samples.as_slice(),
            sample_rate,
            window,
            remove_dc,
        );
        let bin_hz = spectrum.bin_hz.round() as i64;
        if bin_hz <= 0 {
            return Err(PipelineError::Degenerate(format!(
                "bin width {:.3} Hz is below 1 Hz",
                spectrum.bin_hz
            )));
        }

        let mut out = UniformWaveform::from_samples(spectrum.db(), bin_hz, 0);
        out.header.start_timestamp = input.header().start_timestamp;
        out.header.start_femtoseconds = input.header().start_femtoseconds;
        tracing::debug!(
            "FFT: {} points, {} window, {} Hz/bin",
            uniform.len(),
            window.display_name(),
            bin_hz
        );
        self.core.set_output(0, out.into());
        if let Some((freq, _)) = spectrum.peak() {
            self.core.set_scalar(1, freq);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::test_util::{analog_source, wire};
    use crate::pipeline::{FilterGraph, StreamDescriptor};

    /// 1 MS/s
    const TIMESCALE: i64 = 1_000_000_000;

    fn tone(freq: f64, amplitude: f64, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (amplitude * (2.0 * PI * freq * i as f64 / 1e6).sin()) as f32)
            .collect()
    }

    #[test]
    fn test_window_functions() {
        for window in WindowFunction::all() {
            let coeffs = window.generate(100);
            assert_eq!(coeffs.len(), 100);
            // Flat-top has small negative side lobes
            for &c in &coeffs {
                assert!((-0.1..=1.5).contains(&c), "{} coefficient {c}", window.display_name());
            }
        }
    }

    #[test]
    fn test_window_id_round_trip() {
        for &w in WindowFunction::all() {
            assert_eq!(WindowFunction::from_id(w.id()), Some(w));
        }
        assert_eq!(WindowFunction::from_id(99), None);
    }

    #[test]
    fn test_bin_centred_tone_amplitude() {
        // 10 kHz lands exactly on bin 10 with 1 kHz bins
        let mut planner = FftPlanner::new();
        let s = compute_spectrum(&mut planner, &tone(10_000.0, 0.5, 1000), 1e6, WindowFunction::Rectangular, true);
        assert!((s.bin_hz - 1000.0).abs() < 1e-9);
        let (freq, mag) = s.peak().unwrap();
        assert_eq!(freq, 10_000.0);
        assert!((mag - 0.5).abs() < 1e-3, "magnitude {mag}");
    }

    #[test]
    fn test_dc_removal() {
        let mut planner = FftPlanner::new();
        let s = compute_spectrum(&mut planner, &[5.0; 1000], 1e6, WindowFunction::Hann, true);
        assert!(s.magnitudes[0] < 1e-9);
        let s = compute_spectrum(&mut planner, &[5.0; 1000], 1e6, WindowFunction::Hann, false);
        assert!((s.magnitudes[0] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_filter_output_axis() {
        let mut graph = FilterGraph::new();
        let src = analog_source(&mut graph, tone(50_000.0, 1.0, 2000), TIMESCALE, 0);
        let fft = wire(&mut graph, Box::new(FftFilter::new()), &[src]);
        graph.refresh().unwrap();
        assert!(graph.errors(fft).is_empty(), "{:?}", graph.errors(fft));

        let stream = graph.stream(StreamDescriptor::new(fft, 0)).unwrap();
        assert_eq!(stream.x_unit, Unit::Hertz);
        let w = stream.waveform().unwrap().as_uniform_analog().unwrap();
        assert_eq!(w.header.timescale, 500);
        assert_eq!(w.len(), 1001);
        assert!(w.samples[100] > -1.0, "{} dB at 50 kHz", w.samples[100]);

        let peak = graph.stream(StreamDescriptor::new(fft, 1)).unwrap().scalar_value();
        assert_eq!(peak, Some(50_000.0));
    }

    #[test]
    fn test_sparse_input_rejected() {
        let mut graph = FilterGraph::new();
        let src = crate::filters::test_util::digital_source(&mut graph, &[(0, 10, true)]);
        let fft = wire(&mut graph, Box::new(FftFilter::new()), &[src]);
        graph.refresh().unwrap();
        assert_eq!(graph.errors(fft).len(), 1);
    }
}
