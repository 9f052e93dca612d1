//! Base (low settled level) of a pulse train.
//!
//! A 128-bin histogram over the sample range locates the global base: the
//! centre of the modal bin in the lowest quarter. Each low phase of the signal
//! (a falling crossing of the midpoint followed by a rising one) then yields
//! the mean of the samples in its middle half that lie within 10% of the
//! range around the global base.

use super::stage_on_device;
use crate::accel::kernels::{HistogramArgs, HISTOGRAM};
use crate::accel::{AcceleratorBuffer, ComputeDevice, ComputePipeline};
use crate::pipeline::{
    is_analog, DataLocation, Filter, FilterCategory, FilterCore, GpuContext, PipelineError, PipelineResult,
    RefreshContext, Stream,
};
use crate::types::{Color, Unit};
use crate::waveform::{
    find_zero_crossings_directed, get_min_max, get_offset_scaled, make_histogram, SparseWaveform, UniformWaveform,
    Waveform, WaveformBase,
};

pub const BASE_HISTOGRAM_BINS: usize = 128;

/// Fraction of the range around the global base a sample must fall within.
const BAND: f32 = 0.1;

struct HistogramGpu {
    device: ComputeDevice,
    pipeline: ComputePipeline,
    bins: AcceleratorBuffer<i64>,
    scratch: AcceleratorBuffer<f32>,
}

impl HistogramGpu {
    fn new(device: &ComputeDevice) -> PipelineResult<Self> {
        Ok(Self {
            device: device.clone(),
            pipeline: ComputePipeline::new(device, HISTOGRAM, 2, 0, 0, std::mem::size_of::<HistogramArgs>())?,
            bins: AcceleratorBuffer::with_device(device),
            scratch: AcceleratorBuffer::with_device(device),
        })
    }

    fn histogram(
        &mut self,
        w: &mut UniformWaveform<f32>,
        gpu: &mut GpuContext<'_>,
        vmin: f32,
        vrange: f32,
    ) -> PipelineResult<Vec<i64>> {
        let len = w.samples.len();
        let input = stage_on_device(&mut w.samples, &mut self.scratch, gpu.device, false)?;
        self.pipeline.bind_buffer(1, input, gpu.cmd, false)?;
        // The program adds onto the bins, so they go up zeroed.
        self.bins.prepare_for_cpu_access_ignoring_gpu_data()?;
        self.bins.resize(BASE_HISTOGRAM_BINS)?;
        self.bins.as_mut_slice().fill(0);
        self.bins.mark_modified_from_cpu();
        self.pipeline.bind_buffer(0, &mut self.bins, gpu.cmd, false)?;
        let args = HistogramArgs {
            len: len as u32,
            nbins: BASE_HISTOGRAM_BINS as u32,
            vmin,
            vrange,
        };
        let groups = self.pipeline.groups_for(len);
        self.pipeline.dispatch(gpu.cmd, &args, groups, 1, 1)?;
        self.bins.mark_modified_from_gpu();
        gpu.submit()?;
        self.bins.prepare_for_cpu_access()?;
        Ok(self.bins.to_vec())
    }
}

pub struct BaseFilter {
    core: FilterCore,
    gpu: Option<HistogramGpu>,
}

impl BaseFilter {
    pub const PROTOCOL: &'static str = "Base";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Measurement, Color::rgb(0xff, 0x80, 0x40));
        core.add_input("din");
        core.add_stream(Stream::analog("trend", Unit::Volts));
        core.add_stream(Stream::scalar("base", Unit::Volts));
        Self { core, gpu: None }
    }

    fn histogram(&mut self, ctx: &mut RefreshContext<'_>, vmin: f32, vrange: f32) -> PipelineResult<Vec<i64>> {
        let w = ctx.inputs.require_waveform_mut(0)?;
        if let (Waveform::UniformAnalog(u), Some(gpu)) = (&mut *w, ctx.gpu.as_mut()) {
            if gpu.device.capabilities().int64_atomics {
                if !self.gpu.as_ref().is_some_and(|g| g.device.same_device(gpu.device)) {
                    self.gpu = Some(HistogramGpu::new(gpu.device)?);
                }
                if let Some(state) = self.gpu.as_mut() {
                    return state.histogram(u, gpu, vmin, vrange);
                }
            }
        }
        w.prepare_for_cpu_access()?;
        Ok(make_histogram(w, vmin, vmin + vrange, BASE_HISTOGRAM_BINS))
    }
}

impl Default for BaseFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Centre of the modal bin in the lowest quarter of `bins`.
pub fn global_base(bins: &[i64], vmin: f32, vrange: f32) -> f32 {
    let quarter = (bins.len() / 4).max(1).min(bins.len());
    let idx = bins[..quarter]
        .iter()
        .enumerate()
        .fold((0, i64::MIN), |best, (i, &n)| if n > best.1 { (i, n) } else { best })
        .0;
    vmin + (idx as f32 + 0.5) / bins.len() as f32 * vrange
}

impl Filter for BaseFilter {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        slot == 0 && is_analog(stream)
    }

    fn input_location(&self) -> DataLocation {
        DataLocation::DontCare
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let y_unit = ctx.inputs.require_stream(0)?.y_unit;
        for s in &mut self.core.channel.streams {
            s.y_unit = y_unit;
        }

        ctx.inputs.require_waveform_mut(0)?.prepare_for_cpu_access()?;
        let (vmin, vmax) = get_min_max(ctx.inputs.require_waveform(0)?)
            .ok_or_else(|| PipelineError::WaveformTooShort("no samples".into()))?;
        let vrange = vmax - vmin;
        if vrange <= 0.0 {
            return Err(PipelineError::Degenerate("signal is flat".into()));
        }

        let bins = self.histogram(ctx, vmin, vrange)?;
        let base = global_base(&bins, vmin, vrange);
        let band = BAND * vrange;

        let w = ctx.inputs.require_waveform_mut(0)?;
        w.prepare_for_cpu_access()?;
        let w: &Waveform = w;
        let samples = w.analog_samples().unwrap_or_default();
        let times: Vec<i64> = (0..w.len()).map(|i| get_offset_scaled(w, i)).collect();
        let crossings = find_zero_crossings_directed(w, (vmin + vmax) / 2.0);

        let mut trend = SparseWaveform::<f32>::new(1, 0);
        trend.header.start_timestamp = w.header().start_timestamp;
        trend.header.start_femtoseconds = w.header().start_femtoseconds;
        for pair in crossings.windows(2) {
            if pair[0].rising || !pair[1].rising {
                continue;
            }
            let (fall, rise) = (pair[0].timestamp, pair[1].timestamp);
            let quarter = (rise - fall) / 4;
            let lo = times.partition_point(|&t| t < fall + quarter);
            let hi = times.partition_point(|&t| t <= rise - quarter);
            let (sum, n) = samples[lo..hi.max(lo)]
                .iter()
                .filter(|&&v| (v - base).abs() <= band)
                .fold((0.0f64, 0usize), |(s, n), &v| (s + v as f64, n + 1));
            if n > 0 {
                trend.push(fall, rise - fall, (sum / n as f64) as f32);
            }
        }

        if trend.is_empty() {
            return Err(PipelineError::WaveformTooShort("no complete low phase".into()));
        }
        let mean = trend.samples.iter().map(|&v| v as f64).sum::<f64>() / trend.len() as f64;
        tracing::debug!("Base: global {:.4}, {} cycles, mean {:.4}", base, trend.len(), mean);
        self.core.set_output(0, trend.into());
        self.core.set_scalar(1, mean);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::DeviceCapabilities;
    use crate::filters::test_util::{analog_source, wire};
    use crate::pipeline::{ErrorKind, FilterGraph, StreamDescriptor};

    /// Square wave oscillating in [0, 1], 20 samples per level, with uniform
    /// noise in ±0.05 clipped to the swing.
    fn noisy_square(cycles: usize) -> Vec<f32> {
        (0..cycles * 40)
            .map(|k| {
                let level = if k % 40 >= 20 { 1.0 } else { 0.0 };
                let noise = 0.05 * (2.0 * (k as f64 * 0.618).fract() - 1.0);
                (level + noise).clamp(0.0, 1.0) as f32
            })
            .collect()
    }

    #[test]
    fn test_noise_spans_both_signs() {
        let raw: Vec<f64> = (0..320).map(|k| 0.05 * (2.0 * (k as f64 * 0.618).fract() - 1.0)).collect();
        assert!(raw.iter().any(|&n| n < -0.045));
        assert!(raw.iter().any(|&n| n > 0.045));
        assert!(raw.iter().all(|&n| n.abs() <= 0.05));
    }

    #[test]
    fn test_noisy_square_wave_base() {
        for mut graph in [
            FilterGraph::new(),
            FilterGraph::with_device(ComputeDevice::new(DeviceCapabilities::default())),
        ] {
            let src = analog_source(&mut graph, noisy_square(8), 100, 0);
            let base = wire(&mut graph, Box::new(BaseFilter::new()), &[src]);
            graph.refresh().unwrap();
            assert!(graph.errors(base).is_empty(), "{:?}", graph.errors(base));

            let out = graph.stream(StreamDescriptor::new(base, 0)).unwrap();
            let trend = out.waveform().unwrap().as_sparse_analog().unwrap();
            assert_eq!(trend.len(), 7);
            assert!(trend.samples.iter().all(|&v| (0.0..=0.1).contains(&v)));
            let mean = graph.stream(StreamDescriptor::new(base, 1)).unwrap().scalar_value().unwrap();
            assert!(mean.abs() < 0.025, "mean {mean}");
        }
    }

    #[test]
    fn test_global_base_lowest_quarter() {
        let mut bins = vec![0i64; 128];
        bins[3] = 10;
        bins[100] = 50;
        let base = global_base(&bins, 0.0, 1.28);
        assert!((base - 0.035).abs() < 1e-6);
    }

    #[test]
    fn test_flat_signal_degenerate() {
        let mut graph = FilterGraph::new();
        let src = analog_source(&mut graph, vec![0.5; 32], 100, 0);
        let base = wire(&mut graph, Box::new(BaseFilter::new()), &[src]);
        graph.refresh().unwrap();
        assert_eq!(graph.errors(base)[0].kind, ErrorKind::Degenerate);
    }
}
