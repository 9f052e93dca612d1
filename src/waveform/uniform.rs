//! Dense waveforms: one sample every `timescale` starting at `trigger_phase`.

use super::{WaveformBase, WaveformHeader};
use crate::accel::{AccelResult, AcceleratorBuffer, ComputeDevice, Element};

#[derive(Debug)]
pub struct UniformWaveform<T: Element> {
    pub header: WaveformHeader,
    pub samples: AcceleratorBuffer<T>,
}

impl<T: Element> UniformWaveform<T> {
    pub fn new(timescale: i64, trigger_phase: i64) -> Self {
        Self {
            header: WaveformHeader::new(timescale, trigger_phase),
            samples: AcceleratorBuffer::new(),
        }
    }

    /// Empty waveform whose samples may live on `device`.
    pub fn on(device: Option<&ComputeDevice>, timescale: i64, trigger_phase: i64) -> Self {
        Self {
            header: WaveformHeader::new(timescale, trigger_phase),
            samples: AcceleratorBuffer::on(device),
        }
    }

    pub fn from_samples(samples: Vec<T>, timescale: i64, trigger_phase: i64) -> Self {
        Self {
            header: WaveformHeader::new(timescale, trigger_phase),
            samples: AcceleratorBuffer::from_vec(samples),
        }
    }

    pub fn push(&mut self, value: T) {
        self.samples.push(value);
    }
}

impl<T: Element> WaveformBase for UniformWaveform<T> {
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
        self.samples.clear();
    }

    fn resize(&mut self, len: usize) -> AccelResult<()> {
        self.samples.resize(len)
    }

    fn prepare_for_cpu_access(&mut self) -> AccelResult<()> {
        self.samples.prepare_for_cpu_access()
    }

    fn prepare_for_gpu_access(&mut self) -> AccelResult<()> {
        self.samples.prepare_for_gpu_access(false)
    }

    fn mark_modified_from_cpu(&mut self) {
        self.samples.mark_modified_from_cpu();
    }

    fn mark_modified_from_gpu(&mut self) {
        self.samples.mark_modified_from_gpu();
    }
}
