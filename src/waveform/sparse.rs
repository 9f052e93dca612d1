//! Sparse waveforms: every sample carries its own offset and duration.

use super::{WaveformBase, WaveformHeader};
use crate::accel::{AccelResult, AcceleratorBuffer, ComputeDevice, Element};

/// Offsets and durations are in timescale units relative to `trigger_phase`.
/// Offsets are non-decreasing; gaps and overlaps between samples are allowed.
#[derive(Debug)]
pub struct SparseWaveform<T: Element> {
    pub header: WaveformHeader,
    pub offsets: AcceleratorBuffer<i64>,
    pub durations: AcceleratorBuffer<i64>,
    pub samples: AcceleratorBuffer<T>,
}

impl<T: Element> SparseWaveform<T> {
    pub fn new(timescale: i64, trigger_phase: i64) -> Self {
        Self {
            header: WaveformHeader::new(timescale, trigger_phase),
            offsets: AcceleratorBuffer::new(),
            durations: AcceleratorBuffer::new(),
            samples: AcceleratorBuffer::new(),
        }
    }

    pub fn on(device: Option<&ComputeDevice>, timescale: i64, trigger_phase: i64) -> Self {
        Self {
            header: WaveformHeader::new(timescale, trigger_phase),
            offsets: AcceleratorBuffer::on(device),
            durations: AcceleratorBuffer::on(device),
            samples: AcceleratorBuffer::on(device),
        }
    }

    pub fn from_parts(offsets: Vec<i64>, durations: Vec<i64>, samples: Vec<T>, timescale: i64) -> Self {
        debug_assert_eq!(offsets.len(), durations.len());
        debug_assert_eq!(offsets.len(), samples.len());
        Self {
            header: WaveformHeader::new(timescale, 0),
            offsets: AcceleratorBuffer::from_vec(offsets),
            durations: AcceleratorBuffer::from_vec(durations),
            samples: AcceleratorBuffer::from_vec(samples),
        }
    }

    /// Append one sample.
    pub fn push(&mut self, offset: i64, duration: i64, value: T) {
        debug_assert!(
            self.offsets.is_empty() || self.offsets[self.offsets.len() - 1] <= offset,
            "sparse offsets must be non-decreasing"
        );
        self.offsets.push(offset);
        self.durations.push(duration);
        self.samples.push(value);
    }

    /// Stretch the last sample so it ends at `end`.
    pub fn extend_last(&mut self, end: i64) {
        if let Some(i) = self.len().checked_sub(1) {
            self.durations[i] = end - self.offsets[i];
        }
    }

    #[inline]
    pub fn offset(&self, i: usize) -> i64 {
        self.offsets[i]
    }

    #[inline]
    pub fn duration(&self, i: usize) -> i64 {
        self.durations[i]
    }

    /// Offsets are non-decreasing and all three buffers agree in length.
    pub fn is_well_formed(&self) -> bool {
        self.offsets.len() == self.durations.len()
            && self.offsets.len() == self.samples.len()
            && self.offsets.as_slice().windows(2).all(|w| w[0] <= w[1])
    }
}

impl<T: Element> WaveformBase for SparseWaveform<T> {
    fn header(&self) -> &WaveformHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut WaveformHeader {
        &mut self.header
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn clear(&mut self) {
        self.offsets.clear();
        self.durations.clear();
        self.samples.clear();
    }

    fn resize(&mut self, len: usize) -> AccelResult<()> {
        self.offsets.resize(len)?;
        self.durations.resize(len)?;
        self.samples.resize(len)
    }

    fn prepare_for_cpu_access(&mut self) -> AccelResult<()> {
        self.offsets.prepare_for_cpu_access()?;
        self.durations.prepare_for_cpu_access()?;
        self.samples.prepare_for_cpu_access()
    }

    fn prepare_for_gpu_access(&mut self) -> AccelResult<()> {
        self.offsets.prepare_for_gpu_access(false)?;
        self.durations.prepare_for_gpu_access(false)?;
        self.samples.prepare_for_gpu_access(false)
    }

    fn mark_modified_from_cpu(&mut self) {
        self.offsets.mark_modified_from_cpu();
        self.durations.mark_modified_from_cpu();
        self.samples.mark_modified_from_cpu();
    }

    fn mark_modified_from_gpu(&mut self) {
        self.offsets.mark_modified_from_gpu();
        self.durations.mark_modified_from_gpu();
        self.samples.mark_modified_from_gpu();
    }

    fn sparse_offsets(&self) -> Option<&AcceleratorBuffer<i64>> {
        Some(&self.offsets)
    }

    fn sparse_durations(&self) -> Option<&AcceleratorBuffer<i64>> {
        Some(&self.durations)
    }
}
