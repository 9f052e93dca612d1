//! Built-in filter library.
//!
//! Each filter embeds a [`FilterCore`](crate::pipeline::FilterCore) and is
//! registered under its protocol name by [`register_builtins`].

pub mod base;
pub mod block66;
pub mod clock_recovery;
pub mod ddj;
pub mod duty_cycle;
pub mod ethernet;
pub mod export;
pub mod fft;
pub mod import;
pub mod j1939;
pub mod rgb_led;
pub mod source;
pub mod subtract;
pub mod swd;
pub mod swd_memap;
pub mod tie;

pub use base::BaseFilter;
pub use block66::{Block66, Block66Decoder};
pub use clock_recovery::ClockRecoveryFilter;
pub use ddj::DdjFilter;
pub use duty_cycle::DutyCycleFilter;
pub use ethernet::{EthernetSymbol, TenGBaseRDecoder};
pub use export::{CsvExportFilter, TouchstoneExportFilter, VcdExportFilter};
pub use fft::{FftFilter, WindowFunction};
pub use import::{
    BinImportFilter, CsvImportFilter, SiglentBinImportFilter, TouchstoneImportFilter, VcdImportFilter,
    WavImportFilter,
};
pub use j1939::{J1939Pdu, J1939TransportDecoder, J1939TransportSymbol};
pub use rgb_led::{RgbLedDecoder, RgbLedSymbol, RgbLedTiming};
pub use source::WaveformSource;
pub use subtract::SubtractFilter;
pub use swd::{SwdDecoder, SwdSymbol};
pub use swd_memap::{MemApSymbol, SwdMemApDecoder};
pub use tie::TieFilter;

use crate::accel::{AccelResult, AcceleratorBuffer, ComputeDevice, Element};
use crate::pipeline::registry::FilterConstructor;
use crate::waveform::{
    advance_to_timestamp_scaled, analog_value, digital_value, find_edges, find_zero_crossings_directed,
    get_duration_scaled, get_offset_scaled, Crossing, Waveform, WaveformBase,
};

/// Hand every built-in constructor to `register`.
pub fn register_builtins(mut register: impl FnMut(&'static str, FilterConstructor)) {
    let builtins: [(&'static str, FilterConstructor); 23] = [
        (WaveformSource::PROTOCOL, || Box::new(WaveformSource::new())),
        (SubtractFilter::PROTOCOL, || Box::new(SubtractFilter::new())),
        (DutyCycleFilter::PROTOCOL, || Box::new(DutyCycleFilter::new())),
        (BaseFilter::PROTOCOL, || Box::new(BaseFilter::new())),
        (DdjFilter::PROTOCOL, || Box::new(DdjFilter::new())),
        (TieFilter::PROTOCOL, || Box::new(TieFilter::new())),
        (ClockRecoveryFilter::PROTOCOL, || Box::new(ClockRecoveryFilter::new())),
        (RgbLedDecoder::PROTOCOL, || Box::new(RgbLedDecoder::new())),
        (SwdDecoder::PROTOCOL, || Box::new(SwdDecoder::new())),
        (SwdMemApDecoder::PROTOCOL, || Box::new(SwdMemApDecoder::new())),
        (Block66Decoder::PROTOCOL, || Box::new(Block66Decoder::new())),
        (TenGBaseRDecoder::PROTOCOL, || Box::new(TenGBaseRDecoder::new())),
        (J1939TransportDecoder::PROTOCOL, || Box::new(J1939TransportDecoder::new())),
        (FftFilter::PROTOCOL, || Box::new(FftFilter::new())),
        (VcdImportFilter::PROTOCOL, || Box::new(VcdImportFilter::new())),
        (CsvImportFilter::PROTOCOL, || Box::new(CsvImportFilter::new())),
        (WavImportFilter::PROTOCOL, || Box::new(WavImportFilter::new())),
        (BinImportFilter::PROTOCOL, || Box::new(BinImportFilter::new())),
        (SiglentBinImportFilter::PROTOCOL, || Box::new(SiglentBinImportFilter::new())),
        (TouchstoneImportFilter::PROTOCOL, || Box::new(TouchstoneImportFilter::new())),
        (VcdExportFilter::PROTOCOL, || Box::new(VcdExportFilter::new())),
        (CsvExportFilter::PROTOCOL, || Box::new(CsvExportFilter::new())),
        (TouchstoneExportFilter::PROTOCOL, || Box::new(TouchstoneExportFilter::new())),
    ];
    for (name, ctor) in builtins {
        register(name, ctor);
    }
}

/// A buffer that can be bound on `device`.
///
/// Returns `buf` itself when it already lives there (and `force_copy` is not
/// set), otherwise copies its host contents into `scratch`, which must have
/// been created on `device`.
pub(crate) fn stage_on_device<'b, T: Element>(
    buf: &'b mut AcceleratorBuffer<T>,
    scratch: &'b mut AcceleratorBuffer<T>,
    device: &ComputeDevice,
    force_copy: bool,
) -> AccelResult<&'b mut AcceleratorBuffer<T>> {
    if !force_copy && buf.device().is_some_and(|d| d.same_device(device)) {
        return Ok(buf);
    }
    buf.prepare_for_cpu_access()?;
    scratch.copy_from(buf)?;
    tracing::trace!("Staged {} elements onto {}", buf.len(), device.name());
    Ok(scratch)
}

/// A buffer on `device` holding a copy of `data`.
pub(crate) fn device_buffer<T: Element>(device: &ComputeDevice, data: Vec<T>) -> AccelResult<AcceleratorBuffer<T>> {
    let mut buf = AcceleratorBuffer::with_device(device);
    buf.copy_from(&AcceleratorBuffer::from_vec(data))?;
    Ok(buf)
}

/// Level of `w` at time `t` (fs), walking `cursor` forward.
///
/// Analog waveforms are sliced at `threshold`. Returns `None` past the end.
pub(crate) fn level_at(w: &Waveform, cursor: &mut usize, t: i64, threshold: f32) -> Option<bool> {
    let len = w.len();
    advance_to_timestamp_scaled(w, cursor, len, t);
    if *cursor >= len || get_offset_scaled(w, *cursor) + get_duration_scaled(w, *cursor) <= t {
        return None;
    }
    digital_value(w, *cursor).or_else(|| analog_value(w, *cursor).map(|v| v > threshold))
}

/// Threshold crossings of an analog waveform, or edges of a digital one.
pub(crate) fn transitions(w: &Waveform, threshold: f32) -> Vec<Crossing> {
    if w.is_digital() {
        find_edges(w)
    } else {
        find_zero_crossings_directed(w, threshold)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    //! Graph builders shared by the filter tests.

    use crate::pipeline::{FilterGraph, NodeId, Stream, StreamDescriptor};
    use crate::types::Unit;
    use crate::waveform::{ProtocolSymbol, SparseWaveform, UniformWaveform, Waveform};

    use super::WaveformSource;

    /// Add a source with one analog stream and publish `samples` on it.
    pub fn analog_source(graph: &mut FilterGraph, samples: Vec<f32>, timescale: i64, phase: i64) -> NodeId {
        let mut src = WaveformSource::new();
        src.add_stream(Stream::analog("CH1", Unit::Volts));
        let id = graph.add_node(Box::new(src));
        graph
            .publish(id, 0, UniformWaveform::from_samples(samples, timescale, phase).into())
            .unwrap();
        id
    }

    /// Add a source with one digital stream built from `(offset, duration, value)` runs.
    pub fn digital_source(graph: &mut FilterGraph, runs: &[(i64, i64, bool)]) -> NodeId {
        let mut src = WaveformSource::new();
        src.add_stream(Stream::digital("D0"));
        let id = graph.add_node(Box::new(src));
        let mut w = SparseWaveform::<bool>::new(1, 0);
        for &(offset, duration, value) in runs {
            w.push(offset, duration, value);
        }
        graph.publish(id, 0, Waveform::SparseDigital(w)).unwrap();
        id
    }

    /// Add a source with one protocol stream carrying `w`.
    pub fn protocol_source<S: ProtocolSymbol>(graph: &mut FilterGraph, w: SparseWaveform<S>) -> NodeId {
        let mut src = WaveformSource::new();
        src.add_stream(Stream::protocol("data"));
        let id = graph.add_node(Box::new(src));
        graph.publish(id, 0, Waveform::protocol(w)).unwrap();
        id
    }

    /// PRBS-7 bit sequence.
    pub fn prbs7(n: usize) -> Vec<bool> {
        let mut state = 0x7fu8;
        (0..n)
            .map(|_| {
                let bit = ((state >> 6) ^ (state >> 5)) & 1;
                state = ((state << 1) | bit) & 0x7f;
                bit == 1
            })
            .collect()
    }

    /// Add `filter` and bind its inputs to stream 0 of each node in `from`.
    pub fn wire(graph: &mut FilterGraph, filter: Box<dyn crate::pipeline::Filter>, from: &[NodeId]) -> NodeId {
        let id = graph.add_node(filter);
        for (slot, &src) in from.iter().enumerate() {
            graph.connect(StreamDescriptor::new(src, 0), id, slot).unwrap();
        }
        id
    }
}
