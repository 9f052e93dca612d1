//! Difference of two analog inputs.
//!
//! | IN+ | IN- | Output |
//! |---|---|---|
//! | scalar | scalar | scalar |
//! | waveform | waveform | waveform over the overlap of both inputs |
//! | waveform | scalar | waveform of the same density, minus a constant |
//! | scalar | waveform | constant minus waveform |
//!
//! Uniform pairs are aligned on trigger phase: the input with the later
//! phase skips `ceil(|phase_a - phase_b| / timescale)` samples and the output
//! takes the later phase. Phase-valued inputs (Y unit degrees) wrap into
//! (-180, 180]. Non-degree uniform pairs run on the compute device when one
//! is available.
//!
//! Sparse pairs are walked in time order: each output sample spans an
//! interval over which both inputs hold a single value.

use super::stage_on_device;
use crate::accel::kernels::{SubtractArgs, SUBTRACT};
use crate::accel::{AcceleratorBuffer, ComputeDevice, ComputePipeline};
use crate::pipeline::trend::DEFAULT_TREND_DEPTH;
use crate::pipeline::{
    is_analog, is_scalar, DataLocation, Filter, FilterCategory, FilterCore, GpuContext, InputView,
    PipelineError, PipelineResult, RefreshContext, Stream, StreamType,
};
use crate::types::{Color, Unit};
use crate::waveform::{
    advance_to_timestamp_scaled, copy_timestamps, get_duration_scaled, get_next_event_timestamp_scaled, get_offset_scaled,
    SparseWaveform, UniformWaveform, Waveform, WaveformBase, WaveformHeader,
};

const IN_A: usize = 0;
const IN_B: usize = 1;

/// Wrap a phase difference into (-180, 180].
pub fn wrap_degrees(v: f32) -> f32 {
    180.0 - (180.0 - v).rem_euclid(360.0)
}

/// Sample ranges of two uniform waveforms that overlap in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub offset_a: usize,
    pub offset_b: usize,
    pub len: usize,
    pub trigger_phase: i64,
}

impl Alignment {
    /// Align two uniform waveforms of equal timescale.
    pub fn between(a: &WaveformHeader, len_a: usize, b: &WaveformHeader, len_b: usize) -> Option<Self> {
        if a.timescale != b.timescale || a.timescale <= 0 {
            return None;
        }
        let delta = (a.trigger_phase - b.trigger_phase).unsigned_abs() as i64;
        let skip = (delta + a.timescale - 1) / a.timescale;
        let skip = skip as usize;
        let (offset_a, offset_b) = if b.trigger_phase > a.trigger_phase {
            (0, skip)
        } else {
            (skip, 0)
        };
        Some(Self {
            offset_a,
            offset_b,
            len: len_a.saturating_sub(offset_a).min(len_b.saturating_sub(offset_b)),
            trigger_phase: a.trigger_phase.max(b.trigger_phase),
        })
    }
}

struct SubtractGpu {
    device: ComputeDevice,
    pipeline: ComputePipeline,
    scratch_a: AcceleratorBuffer<f32>,
    scratch_b: AcceleratorBuffer<f32>,
}

impl SubtractGpu {
    fn new(device: &ComputeDevice) -> PipelineResult<Self> {
        let pipeline = ComputePipeline::new(device, SUBTRACT, 3, 0, 0, std::mem::size_of::<SubtractArgs>())?;
        Ok(Self {
            device: device.clone(),
            pipeline,
            scratch_a: AcceleratorBuffer::with_device(device),
            scratch_b: AcceleratorBuffer::with_device(device),
        })
    }
}

pub struct SubtractFilter {
    core: FilterCore,
    gpu: Option<SubtractGpu>,
}

impl SubtractFilter {
    pub const PROTOCOL: &'static str = "Subtract";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Math, Color::rgb(0x80, 0xc0, 0xff));
        core.add_input("IN+");
        core.add_input("IN-");
        core.add_stream(Stream::analog("data", Unit::Volts));
        Self { core, gpu: None }
    }

    /// Switch the output between waveform and scalar form.
    fn set_output_kind(&mut self, scalar: bool, x_unit: Unit, y_unit: Unit) {
        let Some(out) = self.core.stream_mut(0) else { return };
        out.y_unit = y_unit;
        if scalar {
            out.stream_type = StreamType::AnalogScalar;
            out.x_unit = Unit::Unitless;
            if out.trend().is_none() {
                out.enable_trend(DEFAULT_TREND_DEPTH);
            }
        } else {
            out.stream_type = StreamType::Analog;
            out.x_unit = x_unit;
        }
    }

    fn refresh_gpu(&mut self, inputs: &mut InputView<'_>, gpu: &mut GpuContext<'_>, al: Alignment) -> PipelineResult<()> {
        if !self.gpu.as_ref().is_some_and(|g| g.device.same_device(gpu.device)) {
            self.gpu = Some(SubtractGpu::new(gpu.device)?);
        }
        let Some(state) = self.gpu.as_mut() else {
            return Ok(());
        };
        // Binding one allocation twice in a dispatch is not allowed.
        let same_stream = inputs.descriptor(IN_A) == inputs.descriptor(IN_B);

        let header = *inputs.require_waveform(IN_A)?.header();
        for (slot, binding) in [(IN_A, 1), (IN_B, 2)] {
            let w = inputs.require_waveform_mut(slot)?;
            let u = match w {
                Waveform::UniformAnalog(u) => u,
                _ => return Err(PipelineError::invalid(input_name(slot), "expected a uniform analog waveform")),
            };
            let scratch = if slot == IN_A { &mut state.scratch_a } else { &mut state.scratch_b };
            let buf = stage_on_device(&mut u.samples, scratch, gpu.device, slot == IN_B && same_stream)?;
            state.pipeline.bind_buffer(binding, buf, gpu.cmd, false)?;
        }

        let mut out = match self.core.take_output(0) {
            Some(Waveform::UniformAnalog(w)) if w.samples.device().is_some_and(|d| d.same_device(gpu.device)) => w,
            _ => UniformWaveform::on(Some(gpu.device), header.timescale, 0),
        };
        out.header.copy_timing_from(&header);
        out.header.trigger_phase = al.trigger_phase;
        out.samples.prepare_for_cpu_access_ignoring_gpu_data()?;
        out.samples.resize(al.len)?;
        state.pipeline.bind_buffer(0, &mut out.samples, gpu.cmd, true)?;

        let args = SubtractArgs {
            offset_a: al.offset_a as u32,
            offset_b: al.offset_b as u32,
            len: al.len as u32,
        };
        let groups = state.pipeline.groups_for(al.len);
        state.pipeline.dispatch(gpu.cmd, &args, groups, 1, 1)?;
        out.samples.mark_modified_from_gpu();
        self.core.set_output(0, out.into());
        Ok(())
    }
}

impl Default for SubtractFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn input_name(slot: usize) -> &'static str {
    if slot == IN_A {
        "IN+"
    } else {
        "IN-"
    }
}

/// Apply `f` to every sample, keeping the waveform's density and timing.
fn map_samples(w: &Waveform, slot: usize, f: impl Fn(f32) -> f32) -> PipelineResult<Waveform> {
    match w {
        Waveform::UniformAnalog(u) => {
            let samples: Vec<f32> = u.samples.iter().map(|&v| f(v)).collect();
            let mut out = UniformWaveform::from_samples(samples, u.header.timescale, u.header.trigger_phase);
            out.header.copy_timing_from(&u.header);
            Ok(out.into())
        }
        Waveform::SparseAnalog(s) => {
            let mut out = SparseWaveform::<f32>::new(s.header.timescale, s.header.trigger_phase);
            copy_timestamps(&mut out, s)?;
            for (o, &v) in out.samples.as_mut_slice().iter_mut().zip(s.samples.iter()) {
                *o = f(v);
            }
            out.mark_modified_from_cpu();
            Ok(out.into())
        }
        _ => Err(PipelineError::invalid(input_name(slot), "expected an analog waveform")),
    }
}

/// Elementwise `a - b` on the host.
fn subtract_cpu(a: &Waveform, b: &Waveform, wrap: impl Fn(f32) -> f32) -> PipelineResult<Waveform> {
    match (a, b) {
        (Waveform::UniformAnalog(ua), Waveform::UniformAnalog(ub)) => {
            let al = Alignment::between(&ua.header, ua.len(), &ub.header, ub.len()).ok_or_else(|| {
                PipelineError::invalid(
                    "IN-",
                    format!("timescale {} does not match {}", ub.header.timescale, ua.header.timescale),
                )
            })?;
            let xa = &ua.samples.as_slice()[al.offset_a..al.offset_a + al.len];
            let xb = &ub.samples.as_slice()[al.offset_b..al.offset_b + al.len];
            let samples: Vec<f32> = xa.iter().zip(xb).map(|(&x, &y)| wrap(x - y)).collect();
            let mut out = UniformWaveform::from_samples(samples, ua.header.timescale, al.trigger_phase);
            out.header.copy_timing_from(&ua.header);
            out.header.trigger_phase = al.trigger_phase;
            Ok(out.into())
        }
        (Waveform::SparseAnalog(sa), Waveform::SparseAnalog(sb)) => Ok(subtract_sparse(sa, sb, wrap).into()),
        _ => Err(PipelineError::invalid("IN-", "inputs must both be uniform or both be sparse")),
    }
}

/// Walk two sparse inputs in time order and emit one sample per interval
/// where both are defined. Gaps in either input produce no output.
///
/// The output timescale is the gcd of both timescales and the phase offset
/// between them, so every event lands on a whole unit.
fn subtract_sparse(
    sa: &SparseWaveform<f32>,
    sb: &SparseWaveform<f32>,
    wrap: impl Fn(f32) -> f32,
) -> SparseWaveform<f32> {
    let (ha, hb) = (&sa.header, &sb.header);
    let unit = gcd(gcd(ha.timescale, hb.timescale), (ha.trigger_phase - hb.trigger_phase).abs()).max(1);
    let mut out = SparseWaveform::new(unit, ha.trigger_phase);
    out.header.copy_timing_from(ha);
    out.header.timescale = unit;

    let (la, lb) = (sa.len(), sb.len());
    if la == 0 || lb == 0 {
        return out;
    }
    let covers = |w: &SparseWaveform<f32>, i: usize, t: i64| {
        let start = get_offset_scaled(w, i);
        start <= t && t < start + get_duration_scaled(w, i)
    };

    let (a_samples, b_samples) = (sa.samples.as_slice(), sb.samples.as_slice());
    let (mut ia, mut ib) = (0usize, 0usize);
    let mut t = get_offset_scaled(sa, 0).max(get_offset_scaled(sb, 0));
    loop {
        advance_to_timestamp_scaled(sa, &mut ia, la, t);
        advance_to_timestamp_scaled(sb, &mut ib, lb, t);
        let next = get_next_event_timestamp_scaled(sa, ia, la, t).min(get_next_event_timestamp_scaled(sb, ib, lb, t));
        if next == i64::MAX {
            break;
        }
        if covers(sa, ia, t) && covers(sb, ib, t) {
            out.push(
                (t - ha.trigger_phase) / unit,
                (next - t) / unit,
                wrap(a_samples[ia] - b_samples[ib]),
            );
        }
        t = next;
    }
    out
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.abs()
}

impl Filter for SubtractFilter {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        slot < 2 && (is_analog(stream) || is_scalar(stream))
    }

    fn input_location(&self) -> DataLocation {
        DataLocation::DontCare
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let a = ctx.inputs.require_stream(IN_A)?;
        let b = ctx.inputs.require_stream(IN_B)?;
        let (a_scalar, b_scalar) = (a.stream_type.is_scalar(), b.stream_type.is_scalar());
        let (x_unit, y_unit) = (if a_scalar { b.x_unit } else { a.x_unit }, a.y_unit);
        let degrees = y_unit == Unit::Degrees;
        let wrap = move |v: f32| if degrees { wrap_degrees(v) } else { v };
        self.set_output_kind(a_scalar && b_scalar, x_unit, y_unit);

        match (a_scalar, b_scalar) {
            (true, true) => {
                let v = ctx.inputs.require_scalar(IN_A)? - ctx.inputs.require_scalar(IN_B)?;
                let v = if degrees { wrap_degrees(v as f32) as f64 } else { v };
                self.core.set_scalar(0, v);
                Ok(())
            }
            (false, true) => {
                let c = ctx.inputs.require_scalar(IN_B)? as f32;
                let w = ctx.inputs.require_waveform_mut(IN_A)?;
                w.prepare_for_cpu_access()?;
                let out = map_samples(w, IN_A, |v| wrap(v - c))?;
                self.core.set_output(0, out);
                Ok(())
            }
            (true, false) => {
                let c = ctx.inputs.require_scalar(IN_A)? as f32;
                let w = ctx.inputs.require_waveform_mut(IN_B)?;
                w.prepare_for_cpu_access()?;
                let out = map_samples(w, IN_B, |v| wrap(c - v))?;
                self.core.set_output(0, out);
                Ok(())
            }
            (false, false) => {
                let wa = ctx.inputs.require_waveform(IN_A)?;
                let wb = ctx.inputs.require_waveform(IN_B)?;
                let alignment = match (wa, wb) {
                    (Waveform::UniformAnalog(ua), Waveform::UniformAnalog(ub)) => {
                        Alignment::between(&ua.header, ua.len(), &ub.header, ub.len())
                    }
                    _ => None,
                };
                if let (Some(al), Some(gpu), false) = (alignment, ctx.gpu.as_mut(), degrees) {
                    if al.len > 0 {
                        return self.refresh_gpu(&mut ctx.inputs, gpu, al);
                    }
                }

                ctx.inputs.require_waveform_mut(IN_A)?.prepare_for_cpu_access()?;
                ctx.inputs.require_waveform_mut(IN_B)?.prepare_for_cpu_access()?;
                let out = subtract_cpu(ctx.inputs.require_waveform(IN_A)?, ctx.inputs.require_waveform(IN_B)?, wrap)?;
                self.core.set_output(0, out);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::DeviceCapabilities;
    use crate::filters::test_util::{analog_source, wire};
    use crate::filters::WaveformSource;
    use crate::pipeline::{ErrorKind, FilterGraph, NodeId, StreamDescriptor};
    use proptest::prelude::*;

    fn ramp() -> Vec<f32> {
        (1..=8).map(|v| v as f32).collect()
    }

    fn output(graph: &mut FilterGraph, id: NodeId) -> (Vec<f32>, i64) {
        let w = graph
            .stream_mut(StreamDescriptor::new(id, 0))
            .and_then(Stream::waveform_mut)
            .expect("output waveform");
        w.prepare_for_cpu_access().unwrap();
        (w.analog_samples().unwrap().to_vec(), w.header().trigger_phase)
    }

    fn run(graph: &mut FilterGraph, phase_b: i64) -> NodeId {
        let a = analog_source(graph, ramp(), 100, 0);
        let b = analog_source(graph, ramp(), 100, phase_b);
        let sub = wire(graph, Box::new(SubtractFilter::new()), &[a, b]);
        graph.refresh().unwrap();
        sub
    }

    #[test]
    fn test_identical_waveforms_subtract_to_zero() {
        let mut graph = FilterGraph::new();
        let sub = run(&mut graph, 0);
        let (samples, phase) = output(&mut graph, sub);
        assert_eq!(samples, vec![0.0; 8]);
        assert_eq!(phase, 0);
    }

    #[test]
    fn test_skewed_inputs_are_aligned() {
        let mut graph = FilterGraph::new();
        let sub = run(&mut graph, 50);
        let (samples, phase) = output(&mut graph, sub);
        assert_eq!(samples, vec![-1.0; 7]);
        assert_eq!(phase, 50);
    }

    #[test]
    fn test_device_path_matches_host() {
        for phase_b in [0, 50, 250] {
            let mut host = FilterGraph::new();
            let host_sub = run(&mut host, phase_b);
            let mut dev = FilterGraph::with_device(ComputeDevice::new(DeviceCapabilities::default()));
            let dev_sub = run(&mut dev, phase_b);
            assert_eq!(output(&mut host, host_sub), output(&mut dev, dev_sub));
        }
    }

    #[test]
    fn test_same_stream_on_both_inputs_on_device() {
        let mut graph = FilterGraph::with_device(ComputeDevice::new(DeviceCapabilities::default()));
        let a = analog_source(&mut graph, ramp(), 100, 0);
        let sub = wire(&mut graph, Box::new(SubtractFilter::new()), &[a, a]);
        graph.refresh().unwrap();
        assert!(graph.errors(sub).is_empty());
        assert_eq!(output(&mut graph, sub).0, vec![0.0; 8]);
    }

    #[test]
    fn test_bound_set_device_refreshes_twice() {
        let caps = DeviceCapabilities {
            push_descriptors: false,
            ..DeviceCapabilities::default()
        };
        let mut graph = FilterGraph::with_device(ComputeDevice::new(caps));
        let sub = run(&mut graph, 0);
        graph.refresh_all().unwrap();
        assert!(graph.errors(sub).is_empty());
        assert_eq!(output(&mut graph, sub).0, vec![0.0; 8]);
    }

    #[test]
    fn test_degrees_wrap() {
        let mut graph = FilterGraph::new();
        let mk = |graph: &mut FilterGraph, v: Vec<f32>| {
            let mut src = WaveformSource::new();
            src.add_stream(Stream::analog("phase", Unit::Degrees));
            let id = graph.add_node(Box::new(src));
            graph.publish(id, 0, UniformWaveform::from_samples(v, 10, 0).into()).unwrap();
            id
        };
        let a = mk(&mut graph, vec![170.0, -170.0, 90.0]);
        let b = mk(&mut graph, vec![-170.0, 170.0, -90.0]);
        let sub = wire(&mut graph, Box::new(SubtractFilter::new()), &[a, b]);
        graph.refresh().unwrap();
        let (samples, _) = output(&mut graph, sub);
        assert_eq!(samples, vec![-20.0, 20.0, 180.0]);
    }

    #[test]
    fn test_scalar_inputs_give_scalar() {
        let mut graph = FilterGraph::new();
        let a = graph.add_node(Box::new(WaveformSource::with_streams([Stream::scalar("x", Unit::Volts)])));
        let b = graph.add_node(Box::new(WaveformSource::with_streams([Stream::scalar("y", Unit::Volts)])));
        graph.publish_scalar(a, 0, 3.5).unwrap();
        graph.publish_scalar(b, 0, 1.0).unwrap();
        let sub = wire(&mut graph, Box::new(SubtractFilter::new()), &[a, b]);
        graph.refresh().unwrap();
        let out = graph.stream(StreamDescriptor::new(sub, 0)).unwrap();
        assert_eq!(out.stream_type, StreamType::AnalogScalar);
        assert_eq!(out.scalar_value(), Some(2.5));
    }

    #[test]
    fn test_waveform_minus_scalar_keeps_density() {
        let mut graph = FilterGraph::new();
        let a = analog_source(&mut graph, vec![1.0, 2.0, 3.0], 100, 0);
        let b = graph.add_node(Box::new(WaveformSource::with_streams([Stream::scalar("dc", Unit::Volts)])));
        graph.publish_scalar(b, 0, 1.0).unwrap();
        let sub = wire(&mut graph, Box::new(SubtractFilter::new()), &[a, b]);
        let sub2 = wire(&mut graph, Box::new(SubtractFilter::new()), &[b, a]);
        graph.refresh().unwrap();
        assert_eq!(output(&mut graph, sub).0, vec![0.0, 1.0, 2.0]);
        assert_eq!(output(&mut graph, sub2).0, vec![0.0, -1.0, -2.0]);
        let w = graph.stream(StreamDescriptor::new(sub, 0)).unwrap().waveform().unwrap();
        assert!(w.is_uniform());
    }

    #[test]
    fn test_timescale_mismatch_is_invalid_input() {
        let mut graph = FilterGraph::new();
        let a = analog_source(&mut graph, ramp(), 100, 0);
        let b = analog_source(&mut graph, ramp(), 200, 0);
        let sub = wire(&mut graph, Box::new(SubtractFilter::new()), &[a, b]);
        graph.refresh().unwrap();
        assert_eq!(graph.errors(sub)[0].kind, ErrorKind::InvalidInput);
        assert!(graph.stream(StreamDescriptor::new(sub, 0)).unwrap().waveform().is_none());
    }

    #[test]
    fn test_sparse_pair_uses_shorter_length() {
        let mut graph = FilterGraph::new();
        let mk = |graph: &mut FilterGraph, n: usize| {
            let id = graph.add_node(Box::new(WaveformSource::with_streams([Stream::analog("s", Unit::Volts)])));
            let offsets: Vec<i64> = (0..n as i64).map(|i| i * 3).collect();
            let w = SparseWaveform::from_parts(offsets, vec![3; n], vec![2.0f32; n], 10);
            graph.publish(id, 0, w.into()).unwrap();
            id
        };
        let a = mk(&mut graph, 5);
        let b = mk(&mut graph, 3);
        let sub = wire(&mut graph, Box::new(SubtractFilter::new()), &[a, b]);
        graph.refresh().unwrap();
        let w = graph.stream(StreamDescriptor::new(sub, 0)).unwrap().waveform().unwrap();
        let s = w.as_sparse_analog().unwrap();
        assert_eq!(s.len(), 3);
        assert!(s.is_well_formed());
        assert_eq!(s.offset(2), 6);
    }

    fn sparse(runs: &[(i64, i64, f32)], timescale: i64, phase: i64) -> SparseWaveform<f32> {
        let mut w = SparseWaveform::new(timescale, phase);
        for &(offset, duration, value) in runs {
            w.push(offset, duration, value);
        }
        w
    }

    fn parts(w: &SparseWaveform<f32>) -> (Vec<i64>, Vec<i64>, Vec<f32>) {
        (
            w.offsets.as_slice().to_vec(),
            w.durations.as_slice().to_vec(),
            w.samples.as_slice().to_vec(),
        )
    }

    #[test]
    fn test_sparse_pair_walks_time_order_with_skewed_offsets() {
        // A covers [0,40) [40,100) [100,150) fs, B covers [20,70) [70,120) fs.
        let a = sparse(&[(0, 4, 5.0), (4, 6, 7.0), (10, 5, 9.0)], 10, 0);
        let b = sparse(&[(0, 5, 1.0), (5, 5, 2.0)], 10, 20);
        let out = subtract_sparse(&a, &b, |v| v);
        assert_eq!(out.header.timescale, 10);
        assert_eq!(out.header.trigger_phase, 0);
        assert_eq!(parts(&out), (vec![2, 4, 7, 10], vec![2, 3, 3, 2], vec![4.0, 6.0, 5.0, 7.0]));
        assert!(out.is_well_formed());
    }

    #[test]
    fn test_sparse_pair_with_different_timescales() {
        let a = sparse(&[(0, 2, 3.0)], 6, 0);
        let b = sparse(&[(0, 1, 1.0), (1, 2, 2.0)], 4, 0);
        let out = subtract_sparse(&a, &b, |v| v);
        assert_eq!(out.header.timescale, 2);
        assert_eq!(parts(&out), (vec![0, 2], vec![2, 4], vec![2.0, 1.0]));
    }

    #[test]
    fn test_sparse_pair_skips_gaps() {
        let a = sparse(&[(0, 2, 4.0), (5, 2, 6.0)], 1, 0);
        let b = sparse(&[(0, 10, 1.0)], 1, 0);
        let out = subtract_sparse(&a, &b, |v| v);
        assert_eq!(parts(&out), (vec![0, 5], vec![2, 2], vec![3.0, 5.0]));
        assert!(subtract_sparse(&a, &sparse(&[], 1, 0), |v| v).is_empty());
    }

    #[test]
    fn test_sparse_pair_in_graph_uses_time_order() {
        let mut graph = FilterGraph::new();
        let mk = |graph: &mut FilterGraph, w: SparseWaveform<f32>| {
            let id = graph.add_node(Box::new(WaveformSource::with_streams([Stream::analog("s", Unit::Volts)])));
            graph.publish(id, 0, w.into()).unwrap();
            id
        };
        let a = mk(&mut graph, sparse(&[(0, 4, 5.0), (4, 6, 7.0), (10, 5, 9.0)], 10, 0));
        let b = mk(&mut graph, sparse(&[(0, 5, 1.0), (5, 5, 2.0)], 10, 20));
        let sub = wire(&mut graph, Box::new(SubtractFilter::new()), &[a, b]);
        graph.refresh().unwrap();
        let w = graph.stream(StreamDescriptor::new(sub, 0)).unwrap().waveform().unwrap();
        let s = w.as_sparse_analog().unwrap();
        assert_eq!(s.samples.as_slice(), &[4.0, 6.0, 5.0, 7.0]);
        assert_eq!(s.offset(0), 2);
    }

    proptest! {
        #[test]
        fn prop_wrap_degrees_in_range(v in -1000.0f32..1000.0) {
            let w = wrap_degrees(v);
            prop_assert!(w > -180.0 - 1e-3 && w <= 180.0 + 1e-3);
        }

        #[test]
        fn prop_alignment_stays_in_bounds(pa in 0i64..1000, pb in 0i64..1000, la in 0usize..64, lb in 0usize..64) {
            let ha = WaveformHeader::new(100, pa);
            let hb = WaveformHeader::new(100, pb);
            let al = Alignment::between(&ha, la, &hb, lb).unwrap();
            prop_assert!(al.offset_a + al.len <= la.max(al.offset_a));
            prop_assert!(al.offset_b + al.len <= lb.max(al.offset_b));
            prop_assert_eq!(al.trigger_phase, pa.max(pb));
        }
    }
}
