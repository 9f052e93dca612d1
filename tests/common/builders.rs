//! Test data builders for graphs and waveforms

use scopeflow::filters::WaveformSource;
use scopeflow::pipeline::{Filter, FilterGraph, NodeId, Stream, StreamDescriptor};
use scopeflow::types::Unit;
use scopeflow::waveform::{SparseWaveform, UniformWaveform, Waveform};

/// Builder for a `WaveformSource` node with published waveforms
#[derive(Default)]
pub struct SourceBuilder {
    streams: Vec<(Stream, Waveform)>,
}

impl SourceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uniform analog stream in volts
    pub fn analog(mut self, name: &str, samples: Vec<f32>, timescale: i64, phase: i64) -> Self {
        self.streams.push((
            Stream::analog(name, Unit::Volts),
            UniformWaveform::from_samples(samples, timescale, phase).into(),
        ));
        self
    }

    /// Sparse digital stream from `(offset, duration, value)` runs, timescale 1 fs
    pub fn digital(mut self, name: &str, runs: &[(i64, i64, bool)]) -> Self {
        let mut w = SparseWaveform::<bool>::new(1, 0);
        for &(offset, duration, value) in runs {
            w.push(offset, duration, value);
        }
        self.streams.push((Stream::digital(name), w.into()));
        self
    }

    pub fn build(self, graph: &mut FilterGraph) -> NodeId {
        let mut src = WaveformSource::new();
        let mut waveforms = Vec::new();
        for (stream, waveform) in self.streams {
            let i = src.add_stream(stream);
            waveforms.push((i, waveform));
        }
        let id = graph.add_node(Box::new(src));
        for (i, w) in waveforms {
            graph.publish(id, i, w).unwrap();
        }
        id
    }
}

/// Add `filter` with input slot `n` bound to `from[n]`
pub fn wire(graph: &mut FilterGraph, filter: Box<dyn Filter>, from: &[StreamDescriptor]) -> NodeId {
    let id = graph.add_node(filter);
    for (slot, &src) in from.iter().enumerate() {
        graph.connect(src, id, slot).unwrap();
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_builder() {
        let mut graph = FilterGraph::new();
        let id = SourceBuilder::new()
            .analog("CH1", vec![1.0, 2.0], 100, 0)
            .digital("D0", &[(0, 5, true)])
            .build(&mut graph);
        let node = graph.node(id).unwrap();
        assert_eq!(node.core().channel.stream_count(), 2);
        assert_eq!(node.core().channel.stream(1).unwrap().name, "D0");
    }
}
