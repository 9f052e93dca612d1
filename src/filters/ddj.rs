//! Data-dependent jitter.
//!
//! Each data bit from the eighth on is tagged with the 8-bit history ending
//! at it (oldest bit in the MSB). Every TIE sample that falls within the bit's
//! interval is added to that history's sum. DDJ is the spread between the
//! largest and smallest per-history mean.
//!
//! The host path sums in `f64`. The device table holds `f32` sums, so the two
//! paths agree to single precision.

use crate::accel::kernels::{DdjArgs, DDJ, DDJ_PATTERNS};
use crate::accel::{AcceleratorBuffer, ComputeDevice, ComputePipeline};
use crate::pipeline::{
    is_analog, is_digital, Filter, FilterCategory, FilterCore, GpuContext, PipelineError, PipelineResult,
    RefreshContext, Stream,
};
use crate::types::{Color, Unit};
use crate::waveform::{get_duration_scaled, get_offset_scaled, Waveform, WaveformBase};

use super::device_buffer;

const IN_TIE: usize = 0;
const IN_DATA: usize = 1;

/// History length in bits.
pub const HISTORY_BITS: usize = 8;

/// Flattened inputs shared by both paths.
struct DdjInputs {
    bits: Vec<u32>,
    starts: Vec<i64>,
    ends: Vec<i64>,
    tie_times: Vec<i64>,
    tie_values: Vec<f32>,
}

impl DdjInputs {
    fn gather(tie: &Waveform, data: &Waveform) -> PipelineResult<Self> {
        let bits: Vec<u32> = data
            .digital_samples()
            .ok_or_else(|| PipelineError::invalid("Data", "expected digital samples"))?
            .iter()
            .map(|&b| u32::from(b))
            .collect();
        let starts: Vec<i64> = (0..data.len()).map(|i| get_offset_scaled(data, i)).collect();
        let ends = starts
            .iter()
            .enumerate()
            .map(|(i, s)| s + get_duration_scaled(data, i))
            .collect();
        let tie_values = tie
            .analog_samples()
            .ok_or_else(|| PipelineError::invalid("TIE", "expected analog samples"))?
            .to_vec();
        let tie_times = (0..tie.len()).map(|i| get_offset_scaled(tie, i)).collect();
        Ok(Self {
            bits,
            starts,
            ends,
            tie_times,
            tie_values,
        })
    }
}

/// TIE sum (fs) and sample count per 8-bit history.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSums {
    pub sums: Vec<f64>,
    pub counts: Vec<u64>,
}

impl PatternSums {
    fn new() -> Self {
        Self {
            sums: vec![0.0; DDJ_PATTERNS],
            counts: vec![0; DDJ_PATTERNS],
        }
    }

    /// Unpack the device table: sums in `[..256]`, counts in `[256..]`.
    fn from_device_table(table: &[f32]) -> Self {
        let (sums, counts) = table.split_at(DDJ_PATTERNS.min(table.len()));
        Self {
            sums: sums.iter().map(|&v| v as f64).collect(),
            counts: counts.iter().map(|&n| n as u64).collect(),
        }
    }

    /// Mean TIE per history, `None` where no sample landed.
    pub fn means(&self) -> Vec<Option<f64>> {
        self.sums
            .iter()
            .zip(&self.counts)
            .map(|(&sum, &n)| (n > 0).then(|| sum / n as f64))
            .collect()
    }
}

fn ddj_sums_cpu(input: &DdjInputs) -> PatternSums {
    let mut out = PatternSums::new();
    let mut first = 0;
    // Bit i closes the history bits[i + 1 - HISTORY_BITS..=i].
    for i in HISTORY_BITS - 1..input.bits.len() {
        let window = input.bits[i + 1 - HISTORY_BITS..=i]
            .iter()
            .fold(0usize, |w, &b| (w << 1) | (b & 1) as usize);
        let (start, end) = (input.starts[i], input.ends[i]);
        while first < input.tie_times.len() && input.tie_times[first] < start {
            first += 1;
        }
        for j in first..input.tie_times.len() {
            if input.tie_times[j] >= end {
                break;
            }
            out.sums[window] += input.tie_values[j] as f64;
            out.counts[window] += 1;
        }
    }
    out
}

struct DdjGpu {
    device: ComputeDevice,
    pipeline: ComputePipeline,
    out: AcceleratorBuffer<f32>,
}

impl DdjGpu {
    fn new(device: &ComputeDevice) -> PipelineResult<Self> {
        Ok(Self {
            device: device.clone(),
            pipeline: ComputePipeline::new(device, DDJ, 6, 0, 0, std::mem::size_of::<DdjArgs>())?,
            out: AcceleratorBuffer::with_device(device),
        })
    }

    fn sums(&mut self, input: &DdjInputs, gpu: &mut GpuContext<'_>) -> PipelineResult<PatternSums> {
        let mut bits = device_buffer(gpu.device, input.bits.clone())?;
        let mut starts = device_buffer(gpu.device, input.starts.clone())?;
        let mut ends = device_buffer(gpu.device, input.ends.clone())?;
        let mut tie_times = device_buffer(gpu.device, input.tie_times.clone())?;
        let mut tie_values = device_buffer(gpu.device, input.tie_values.clone())?;

        self.out.prepare_for_cpu_access_ignoring_gpu_data()?;
        self.out.resize(2 * DDJ_PATTERNS)?;
        self.pipeline.bind_buffer(0, &mut self.out, gpu.cmd, true)?;
        self.pipeline.bind_buffer(1, &mut bits, gpu.cmd, false)?;
        self.pipeline.bind_buffer(2, &mut starts, gpu.cmd, false)?;
        self.pipeline.bind_buffer(3, &mut ends, gpu.cmd, false)?;
        self.pipeline.bind_buffer(4, &mut tie_times, gpu.cmd, false)?;
        self.pipeline.bind_buffer(5, &mut tie_values, gpu.cmd, false)?;

        let args = DdjArgs {
            nbits: input.bits.len() as u32,
            ntie: input.tie_times.len() as u32,
        };
        // One invocation per history.
        let groups = self.pipeline.groups_for(DDJ_PATTERNS);
        self.pipeline.dispatch(gpu.cmd, &args, groups, 1, 1)?;
        self.out.mark_modified_from_gpu();
        // The staged inputs are dropped on return, so finish before then.
        gpu.submit()?;
        self.out.prepare_for_cpu_access()?;
        Ok(PatternSums::from_device_table(self.out.as_slice()))
    }
}

pub struct DdjFilter {
    core: FilterCore,
    gpu: Option<DdjGpu>,
    table: Vec<Option<f64>>,
}

impl DdjFilter {
    pub const PROTOCOL: &'static str = "DDJ";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Clock, Color::rgb(0xff, 0x40, 0xa0));
        core.add_input("TIE");
        core.add_input("Data");
        core.add_stream(Stream::scalar("ddj", Unit::Femtoseconds));
        Self {
            core,
            gpu: None,
            table: vec![None; DDJ_PATTERNS],
        }
    }

    /// Mean TIE (fs) per 8-bit history from the last refresh, oldest bit in the MSB.
    pub fn table(&self) -> &[Option<f64>] {
        &self.table
    }
}

impl Default for DdjFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for DdjFilter {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool {
        match slot {
            IN_TIE => is_analog(stream),
            IN_DATA => is_digital(stream),
            _ => false,
        }
    }

    fn clear_outputs(&mut self) {
        self.core.channel.clear();
        self.table.fill(None);
    }

    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        let input = DdjInputs::gather(ctx.inputs.require_waveform(IN_TIE)?, ctx.inputs.require_waveform(IN_DATA)?)?;
        if input.bits.len() < HISTORY_BITS {
            return Err(PipelineError::WaveformTooShort(format!(
                "{} bits, need at least {}",
                input.bits.len(),
                HISTORY_BITS
            )));
        }

        let sums = match ctx.gpu.as_mut() {
            Some(gpu) if gpu.device.capabilities().int64_atomics && gpu.device.capabilities().float_atomics => {
                if !self.gpu.as_ref().is_some_and(|g| g.device.same_device(gpu.device)) {
                    self.gpu = Some(DdjGpu::new(gpu.device)?);
                }
                match self.gpu.as_mut() {
                    Some(state) => state.sums(&input, gpu)?,
                    None => ddj_sums_cpu(&input),
                }
            }
            _ => ddj_sums_cpu(&input),
        };

        self.table = sums.means();
        let (lo, hi) = self
            .table
            .iter()
            .flatten()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &m| (lo.min(m), hi.max(m)));
        if lo > hi {
            return Err(PipelineError::Degenerate("no TIE samples fall inside data bits".into()));
        }
        tracing::debug!(
            "DDJ: {} bits, {} patterns populated, {:.1} fs",
            input.bits.len(),
            self.table.iter().flatten().count(),
            hi - lo
        );
        self.core.set_scalar(0, hi - lo);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::DeviceCapabilities;
    use crate::filters::test_util::prbs7;
    use crate::filters::WaveformSource;
    use crate::pipeline::{FilterGraph, NodeId, StreamDescriptor};
    use crate::waveform::SparseWaveform;
    use proptest::prelude::*;

    const UI: i64 = 1000;

    /// Sampled data, one bit per UI, and TIE samples at each transition whose
    /// value depends on the bits before it.
    fn waveforms(bits: &[bool], jitter: impl Fn(&[bool]) -> f32) -> (SparseWaveform<f32>, SparseWaveform<bool>) {
        let mut data = SparseWaveform::<bool>::new(1, 0);
        let mut tie = SparseWaveform::<f32>::new(1, 0);
        for (i, &b) in bits.iter().enumerate() {
            data.push(i as i64 * UI, UI, b);
            if i > 0 && bits[i - 1] != b {
                tie.push(i as i64 * UI + UI / 4, UI, jitter(&bits[..=i]));
            }
        }
        (tie, data)
    }

    fn connect_ddj(mut graph: FilterGraph, tie: SparseWaveform<f32>, data: SparseWaveform<bool>) -> (FilterGraph, NodeId) {
        let src = graph.add_node(Box::new(WaveformSource::with_streams([
            Stream::analog("tie", Unit::Femtoseconds),
            Stream::digital("data"),
        ])));
        graph.publish(src, 0, tie.into()).unwrap();
        graph.publish(src, 1, Waveform::SparseDigital(data)).unwrap();
        let ddj = graph.add_node(Box::new(DdjFilter::new()));
        graph.connect(StreamDescriptor::new(src, 0), ddj, IN_TIE).unwrap();
        graph.connect(StreamDescriptor::new(src, 1), ddj, IN_DATA).unwrap();
        graph.refresh().unwrap();
        (graph, ddj)
    }

    fn ddj_graph(graph: FilterGraph, bits: &[bool], jitter: impl Fn(&[bool]) -> f32) -> (FilterGraph, NodeId) {
        let (tie, data) = waveforms(bits, jitter);
        connect_ddj(graph, tie, data)
    }

    fn two_bit_jitter(history: &[bool]) -> f32 {
        let n = history.len();
        if history[n - 2] { 30.0 } else { -10.0 }
    }

    #[test]
    fn test_ddj_spread() {
        let (graph, ddj) = ddj_graph(FilterGraph::new(), &prbs7(300), two_bit_jitter);
        assert!(graph.errors(ddj).is_empty(), "{:?}", graph.errors(ddj));
        let value = graph.stream(StreamDescriptor::new(ddj, 0)).unwrap().scalar_value().unwrap();
        assert!((value - 40.0).abs() < 1e-9, "ddj {value}");

        let table = graph.filter::<DdjFilter>(ddj).unwrap().table();
        assert_eq!(table.len(), 256);
        // A history ending in 0 then 1 means the transition followed a 0
        for (pattern, mean) in table.iter().enumerate() {
            if let Some(m) = mean {
                let expected = if pattern & 0b10 != 0 { 30.0 } else { -10.0 };
                assert_eq!(*m, expected, "pattern {pattern:08b}");
            }
        }
    }

    #[test]
    fn test_device_and_host_agree() {
        let bits = prbs7(500);
        let jitter = |h: &[bool]| h.iter().rev().take(4).filter(|&&b| b).count() as f32 * 7.3 - 11.0;
        let (cpu, cpu_id) = ddj_graph(FilterGraph::new(), &bits, jitter);
        let (gpu, gpu_id) = ddj_graph(
            FilterGraph::with_device(ComputeDevice::new(DeviceCapabilities::default())),
            &bits,
            jitter,
        );
        let close = |a: f64, b: f64| (a - b).abs() <= 1e-4 * a.abs().max(b.abs()).max(1.0);

        let cpu_table = cpu.filter::<DdjFilter>(cpu_id).unwrap().table();
        let gpu_table = gpu.filter::<DdjFilter>(gpu_id).unwrap().table();
        for (pattern, (a, b)) in cpu_table.iter().zip(gpu_table).enumerate() {
            match (a, b) {
                (Some(a), Some(b)) => assert!(close(*a, *b), "pattern {pattern:08b}: {a} vs {b}"),
                (None, None) => {}
                _ => panic!("pattern {pattern:08b} populated on one path only"),
            }
        }
        let a = cpu.stream(StreamDescriptor::new(cpu_id, 0)).unwrap().scalar_value().unwrap();
        let b = gpu.stream(StreamDescriptor::new(gpu_id, 0)).unwrap().scalar_value().unwrap();
        assert!(close(a, b), "{a} vs {b}");
    }

    #[test]
    fn test_without_float_atomics_uses_host() {
        let caps = DeviceCapabilities {
            float_atomics: false,
            ..DeviceCapabilities::default()
        };
        let (graph, ddj) = ddj_graph(FilterGraph::with_device(ComputeDevice::new(caps)), &prbs7(300), two_bit_jitter);
        let value = graph.stream(StreamDescriptor::new(ddj, 0)).unwrap().scalar_value().unwrap();
        assert!((value - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_data_rejected() {
        let seven = [true, false, true, false, true, false, true];
        let (graph, ddj) = ddj_graph(FilterGraph::new(), &seven, two_bit_jitter);
        assert_eq!(graph.errors(ddj).len(), 1);
        assert!(graph.filter::<DdjFilter>(ddj).unwrap().table().iter().all(Option::is_none));
    }

    #[test]
    fn test_minimum_length_counts_first_history() {
        let bits = [true, false, true, true, false, false, true, false];
        for graph in [
            FilterGraph::new(),
            FilterGraph::with_device(ComputeDevice::new(DeviceCapabilities::default())),
        ] {
            let mut data = SparseWaveform::<bool>::new(1, 0);
            for (i, &b) in bits.iter().enumerate() {
                data.push(i as i64 * UI, UI, b);
            }
            let mut tie = SparseWaveform::<f32>::new(1, 0);
            tie.push(7 * UI + UI / 4, UI, 12.5);

            let (graph, ddj) = connect_ddj(graph, tie, data);
            assert!(graph.errors(ddj).is_empty(), "{:?}", graph.errors(ddj));
            let table = graph.filter::<DdjFilter>(ddj).unwrap().table();
            assert_eq!(table[0b1011_0010], Some(12.5));
            assert_eq!(table.iter().flatten().count(), 1);
            let value = graph.stream(StreamDescriptor::new(ddj, 0)).unwrap().scalar_value();
            assert_eq!(value, Some(0.0));
        }
    }

    #[test]
    fn test_host_sums_keep_fractional_tie() {
        let bits: Vec<u32> = vec![0, 1, 0, 1, 0, 1, 0, 1, 1];
        let input = DdjInputs {
            starts: (0..9).map(|i| i * UI).collect(),
            ends: (1..10).map(|i| i * UI).collect(),
            tie_times: vec![7 * UI + 10, 7 * UI + 20, 8 * UI],
            tie_values: vec![0.25, 0.5, -3.0],
            bits,
        };
        let sums = ddj_sums_cpu(&input);
        assert_eq!(sums.counts[0b0101_0101], 2);
        assert_eq!(sums.sums[0b0101_0101], 0.75);
        assert_eq!(sums.means()[0b1010_1011], Some(-3.0));
    }

    proptest! {
        #[test]
        fn prop_means_lie_within_tie_range(seed in 1u8..127, offset in -50.0f32..50.0) {
            let mut state = seed;
            let bits: Vec<bool> = (0..200)
                .map(|_| {
                    let bit = ((state >> 6) ^ (state >> 5)) & 1;
                    state = ((state << 1) | bit) & 0x7f;
                    bit == 1
                })
                .collect();
            let (graph, ddj) = ddj_graph(FilterGraph::new(), &bits, |h| offset + h.len() as f32 % 5.0);
            for m in graph.filter::<DdjFilter>(ddj).unwrap().table().iter().flatten() {
                prop_assert!(*m >= (offset - 1.0).floor() as f64 && *m <= (offset + 5.0).ceil() as f64);
            }
        }
    }
}
