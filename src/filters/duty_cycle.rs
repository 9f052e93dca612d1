//! Duty cycle of a periodic analog or digital signal.
//!
//! Analog inputs are sliced at their mean (reduced on the compute device when
//! one is available); digital inputs use their edges. Each full period, from
//! crossing `i` to crossing `i + 2`, yields one trend sample; the scalar
//! output is the mean of the trend.

use super::stage_on_device;
use crate::accel::kernels::{ReduceArgs, REDUCE_BLOCK, REDUCE_SUM};
use crate::accel::{AcceleratorBuffer, ComputeDevice, ComputePipeline};
use crate::pipeline::{
    is_analog, is_digital, DataLocation, Filter, FilterCategory, FilterCore, GpuContext, PipelineError,
    PipelineResult, RefreshContext, Stream,
};
use crate::types::{Color, Unit};
use crate::waveform::{
    find_edges, find_zero_crossings_directed, get_average, Crossing, SparseWaveform, UniformWaveform, Waveform,
    WaveformBase,
};

/// Sum of a device-resident sample buffer, one partial per block.
struct MeanReducer {
    device: ComputeDevice,
    pipeline: ComputePipeline,
    partials: AcceleratorBuffer<f32>,
    scratch: AcceleratorBuffer<f32>,
}

impl MeanReducer {
    fn new(device: &ComputeDevice) -> PipelineResult<Self> {
        Ok(Self {
            device: device.clone(),
            pipeline: ComputePipeline::new(device, REDUCE_SUM, 2, 0, 0, std::mem::size_of::<ReduceArgs>())?,
            partials: AcceleratorBuffer::with_device(device),
            scratch: AcceleratorBuffer::with_device(device),
        })
    }

    /// Mean of `w`'s samples. Submits and waits for the reduction.
    fn mean(&mut self, w: &mut UniformWaveform<f32>, gpu: &mut GpuContext<'_>) -> PipelineResult<Option<f32>> {
        let len = w.samples.len();
        if len == 0 {
            return Ok(None);
        }
        let groups = len.div_ceil(REDUCE_BLOCK as usize);
        let input = stage_on_device(&mut w.samples, &mut self.scratch, gpu.device, false)?;
        self.pipeline.bind_buffer(1, input, gpu.cmd, false)?;
        self.partials.prepare_for_cpu_access_ignoring_gpu_data()?;
        self.partials.resize(groups)?;
        self.pipeline.bind_buffer(0, &mut self.partials, gpu.cmd, true)?;
        let args = ReduceArgs {
            len: len as u32,
            block: REDUCE_BLOCK,
        };
        self.pipeline.dispatch(gpu.cmd, &args, groups as u32, 1, 1)?;
        self.partials.mark_modified_from_gpu();
        gpu.submit()?;
        self.partials.prepare_for_cpu_access()?;
        let sum: f64 = self.partials.iter().map(|&v| v as f64).sum();
        Ok(Some((sum / len as f64) as f32))
    }
}

pub struct DutyCycleFilter {
    core: FilterCore,
    reducer: Option<MeanReducer>,
}

impl DutyCycleFilter {
    pub const PROTOCOL: &'static str = "Duty Cycle";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Measurement, Color::rgb(0x40, 0xa0, 0xff));
        core.add_input("din");
        core.add_stream(Stream::analog("trend", Unit::Percent));
        core.add_stream(Stream::scalar("average", Unit::Percent));
        Self { core, reducer: None }
    }

    /// Mean of the input, on the device when possible.
    fn midpoint(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<f32> {
        let w = ctx.inputs.require_waveform_mut(0)?;
        if let (Waveform::UniformAnalog(u), Some(gpu)) = (&mut *w, ctx.gpu.as_mut()) {
            if !self.reducer.as_ref().is_some_and(|r| r.device.same_device(gpu.device)) {
                self.reducer = Some(MeanReducer::new(gpu.device)?);
            }
            if let Some(reducer) = self.reducer.as_mut() {
                if let Some(mean) = reducer.mean(u, gpu)? {
                    return Ok(mean);
                }
            }
        }
        w.prepare_for_cpu_access()?;
        get_average(w).ok_or_else(|| PipelineError::WaveformTooShort("no samples".into()))
    }
}

impl Default for DutyCycleFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-period high fraction. Each sample spans crossing `i` to `i + 2`.
pub fn duty_cycle_trend(crossings: &[Crossing]) -> SparseWaveform<f32> {
    let mut trend = SparseWaveform::new(1, 0);
    let Some(first) = crossings.first() else {
        return trend;
    };
    let high_first = first.rising;
    for i in (0..crossings.len().saturating_sub(2)).step_by(2) {
        let (c0, c1, c2) = (crossings[i].timestamp, crossings[i + 1].timestamp, crossings[i + 2].timestamp);
        let period = c2 - c0;
        if period <= 0 {
            continue;
        }
        let high = if high_first { c1 - c0 } else { c2 - c1 };
        trend.push(c0, period, (high as f64 / period as f64) as f32);
    }
    trend
}

impl Filter for DutyCycleFilter {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        slot == 0 && (is_analog(stream) || is_digital(stream))
    }

    fn input_location(&self) -> DataLocation {
        DataLocation::DontCare
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let analog = ctx.inputs.require_waveform(0)?.is_analog();
        let midpoint = if analog { Some(self.midpoint(ctx)?) } else { None };

        let w = ctx.inputs.require_waveform_mut(0)?;
        w.prepare_for_cpu_access()?;
        let crossings = match midpoint {
            Some(mid) => find_zero_crossings_directed(w, mid),
            None => find_edges(w),
        };
        if crossings.len() < 2 {
            return Err(PipelineError::WaveformTooShort(format!(
                "{} crossings, need at least 2",
                crossings.len()
            )));
        }

        let mut trend = duty_cycle_trend(&crossings);
        trend.header.start_timestamp = w.header().start_timestamp;
        trend.header.start_femtoseconds = w.header().start_femtoseconds;
        let n = trend.len();
        let mean = if n > 0 {
            trend.samples.iter().map(|&v| v as f64).sum::<f64>() / n as f64
        } else {
            f64::NAN
        };
        tracing::debug!("Duty cycle: {} periods, mean {:.4}", n, mean);
        self.core.set_output(0, trend.into());
        self.core.set_scalar(1, mean);
        Ok(())
    }
}
