//! Waveform model.
//!
//! A waveform is one of four concrete sample layouts plus type-erased protocol
//! data:
//!
//! | Variant | Layout |
//! |---|---|
//! | `UniformAnalog` | `f32` samples, implicit timing |
//! | `UniformDigital` | `bool` samples, implicit timing |
//! | `SparseAnalog` | offsets + durations + `f32` samples |
//! | `SparseDigital` | offsets + durations + `bool` samples |
//! | `Protocol` | offsets + durations + decoder symbols |
//!
//! Every layout implements [`WaveformBase`]; the timing helpers in [`timing`]
//! work on any of them.

pub mod header;
pub mod helpers;
pub mod protocol;
pub mod sparse;
pub mod timing;
pub mod uniform;

pub use header::{WaveformHeader, FLAG_CLIPPING, FS_PER_NANOSECOND, FS_PER_PICOSECOND, FS_PER_SECOND};
pub use helpers::{
    analog_value, copy_timestamps, digital_value, find_edges, find_zero_crossings,
    find_zero_crossings_directed, get_average, get_min_max, make_histogram, Crossing,
};
pub use protocol::{ProtocolSymbol, ProtocolWaveform};
pub use sparse::SparseWaveform;
pub use timing::{
    advance_to_timestamp_scaled, get_duration_scaled, get_next_event_timestamp_scaled,
    get_offset_scaled,
};
pub use uniform::UniformWaveform;

use crate::accel::{AccelResult, AcceleratorBuffer};

/// Operations shared by every waveform layout.
pub trait WaveformBase {
    fn header(&self) -> &WaveformHeader;
    fn header_mut(&mut self) -> &mut WaveformHeader;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
    fn resize(&mut self, len: usize) -> AccelResult<()>;

    /// Make every buffer host-readable (blocking).
    fn prepare_for_cpu_access(&mut self) -> AccelResult<()>;
    /// Make every buffer device-readable (blocking).
    fn prepare_for_gpu_access(&mut self) -> AccelResult<()>;
    fn mark_modified_from_cpu(&mut self);
    fn mark_modified_from_gpu(&mut self);

    /// Per-sample offsets, for sparse layouts.
    fn sparse_offsets(&self) -> Option<&AcceleratorBuffer<i64>> {
        None
    }

    fn sparse_durations(&self) -> Option<&AcceleratorBuffer<i64>> {
        None
    }

    fn is_sparse(&self) -> bool {
        self.sparse_offsets().is_some()
    }
}

#[derive(Debug)]
pub enum Waveform {
    UniformAnalog(UniformWaveform<f32>),
    UniformDigital(UniformWaveform<bool>),
    SparseAnalog(SparseWaveform<f32>),
    SparseDigital(SparseWaveform<bool>),
    Protocol(Box<dyn ProtocolWaveform>),
}

macro_rules! each_variant {
    ($self:expr, $w:ident => $body:expr) => {
        match $self {
            Waveform::UniformAnalog($w) => $body,
            Waveform::UniformDigital($w) => $body,
            Waveform::SparseAnalog($w) => $body,
            Waveform::SparseDigital($w) => $body,
            Waveform::Protocol($w) => $body,
        }
    };
}

impl Waveform {
    /// Wrap a protocol waveform.
    pub fn protocol<S: ProtocolSymbol>(w: SparseWaveform<S>) -> Self {
        Waveform::Protocol(Box::new(w))
    }

    pub fn is_analog(&self) -> bool {
        matches!(self, Waveform::UniformAnalog(_) | Waveform::SparseAnalog(_))
    }

    pub fn is_digital(&self) -> bool {
        matches!(self, Waveform::UniformDigital(_) | Waveform::SparseDigital(_))
    }

    pub fn is_uniform(&self) -> bool {
        matches!(self, Waveform::UniformAnalog(_) | Waveform::UniformDigital(_))
    }

    pub fn as_uniform_analog(&self) -> Option<&UniformWaveform<f32>> {
        match self {
            Waveform::UniformAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_uniform_digital(&self) -> Option<&UniformWaveform<bool>> {
        match self {
            Waveform::UniformDigital(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_sparse_analog(&self) -> Option<&SparseWaveform<f32>> {
        match self {
            Waveform::SparseAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_sparse_digital(&self) -> Option<&SparseWaveform<bool>> {
        match self {
            Waveform::SparseDigital(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_uniform_analog_mut(&mut self) -> Option<&mut UniformWaveform<f32>> {
        match self {
            Waveform::UniformAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_sparse_analog_mut(&mut self) -> Option<&mut SparseWaveform<f32>> {
        match self {
            Waveform::SparseAnalog(w) => Some(w),
            _ => None,
        }
    }

    pub fn as_sparse_digital_mut(&mut self) -> Option<&mut SparseWaveform<bool>> {
        match self {
            Waveform::SparseDigital(w) => Some(w),
            _ => None,
        }
    }

    /// Concrete protocol waveform of symbol type `S`.
    pub fn as_protocol<S: ProtocolSymbol>(&self) -> Option<&SparseWaveform<S>> {
        match self {
            Waveform::Protocol(w) => w.downcast_ref::<S>(),
            _ => None,
        }
    }

    pub fn as_protocol_mut<S: ProtocolSymbol>(&mut self) -> Option<&mut SparseWaveform<S>> {
        match self {
            Waveform::Protocol(w) => w.downcast_mut::<S>(),
            _ => None,
        }
    }

    /// Analog samples as a slice (host copy must be current).
    pub fn analog_samples(&self) -> Option<&[f32]> {
        match self {
            Waveform::UniformAnalog(w) => Some(w.samples.as_slice()),
            Waveform::SparseAnalog(w) => Some(w.samples.as_slice()),
            _ => None,
        }
    }

    pub fn digital_samples(&self) -> Option<&[bool]> {
        match self {
            Waveform::UniformDigital(w) => Some(w.samples.as_slice()),
            Waveform::SparseDigital(w) => Some(w.samples.as_slice()),
            _ => None,
        }
    }

    /// Renderer text for sample `i`.
    pub fn text(&self, i: usize) -> String {
        match self {
            Waveform::Protocol(w) => w.text(i),
            Waveform::UniformAnalog(w) => w.samples[i].to_string(),
            Waveform::SparseAnalog(w) => w.samples[i].to_string(),
            Waveform::UniformDigital(w) => u8::from(w.samples[i]).to_string(),
            Waveform::SparseDigital(w) => u8::from(w.samples[i]).to_string(),
        }
    }
}

impl WaveformBase for Waveform {
    fn header(&self) -> &WaveformHeader {
        each_variant!(self, w => w.header())
    }

    fn header_mut(&mut self) -> &mut WaveformHeader {
        each_variant!(self, w => w.header_mut())
    }

    fn len(&self) -> usize {
        each_variant!(self, w => w.len())
    }

    fn clear(&mut self) {
        each_variant!(self, w => w.clear())
    }

    fn resize(&mut self, len: usize) -> AccelResult<()> {
        each_variant!(self, w => w.resize(len))
    }

    fn prepare_for_cpu_access(&mut self) -> AccelResult<()> {
        each_variant!(self, w => w.prepare_for_cpu_access())
    }

    fn prepare_for_gpu_access(&mut self) -> AccelResult<()> {
        each_variant!(self, w => w.prepare_for_gpu_access())
    }

    fn mark_modified_from_cpu(&mut self) {
        each_variant!(self, w => w.mark_modified_from_cpu())
    }

    fn mark_modified_from_gpu(&mut self) {
        each_variant!(self, w => w.mark_modified_from_gpu())
    }

    fn sparse_offsets(&self) -> Option<&AcceleratorBuffer<i64>> {
        each_variant!(self, w => w.sparse_offsets())
    }

    fn sparse_durations(&self) -> Option<&AcceleratorBuffer<i64>> {
        each_variant!(self, w => w.sparse_durations())
    }
}

impl From<UniformWaveform<f32>> for Waveform {
    fn from(w: UniformWaveform<f32>) -> Self {
        Waveform::UniformAnalog(w)
    }
}

impl From<UniformWaveform<bool>> for Waveform {
    fn from(w: UniformWaveform<bool>) -> Self {
        Waveform::UniformDigital(w)
    }
}

impl From<SparseWaveform<f32>> for Waveform {
    fn from(w: SparseWaveform<f32>) -> Self {
        Waveform::SparseAnalog(w)
    }
}

impl From<SparseWaveform<bool>> for Waveform {
    fn from(w: SparseWaveform<bool>) -> Self {
        Waveform::SparseDigital(w)
    }
}
