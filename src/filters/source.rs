//! Graph root through which instrument adapters publish channels.

use crate::pipeline::{
    Filter, FilterCategory, FilterCore, PipelineError, PipelineResult, RefreshContext, Stream, StreamType,
};
use crate::types::{Color, Unit};
use crate::waveform::{Waveform, WaveformBase};
use serde_json::{json, Value};

/// A node with no inputs whose streams are written from outside the graph.
///
/// Stream layout is part of the saved session so consumers can be rebound
/// before the instrument delivers its first waveform.
pub struct WaveformSource {
    core: FilterCore,
}

impl WaveformSource {
    pub const PROTOCOL: &'static str = "Waveform Source";

    pub fn new() -> Self {
        let mut core = FilterCore::new(Self::PROTOCOL, FilterCategory::Source, Color::rgb(0xff, 0xff, 0x00));
        core.add_serializer(|core, _ids, section| {
            let streams: Vec<Value> = core
                .channel
                .streams
                .iter()
                .map(|s| {
                    json!({
                        "name": s.name,
                        "type": s.stream_type,
                        "xunit": s.x_unit,
                        "yunit": s.y_unit,
                    })
                })
                .collect();
            section.insert("streams".into(), Value::Array(streams));
        });
        core.add_loader(|core, section, _ids| {
            let Some(streams) = section.get("streams").and_then(Value::as_array) else {
                return Ok(());
            };
            if !core.channel.streams.is_empty() {
                return Ok(());
            }
            for s in streams {
                let field = |key: &str| s.get(key).cloned().unwrap_or(Value::Null);
                let name = s.get("name").and_then(Value::as_str).unwrap_or("CH");
                let stream_type: StreamType = serde_json::from_value(field("type")).unwrap_or_default();
                let x_unit: Unit = serde_json::from_value(field("xunit")).unwrap_or_default();
                let y_unit: Unit = serde_json::from_value(field("yunit")).unwrap_or(Unit::Volts);
                core.add_stream(Stream::new(name, stream_type, x_unit, y_unit));
            }
            Ok(())
        });
        Self { core }
    }

    /// Source with a fixed stream layout.
    pub fn with_streams(streams: impl IntoIterator<Item = Stream>) -> Self {
        let mut src = Self::new();
        for s in streams {
            src.add_stream(s);
        }
        src
    }

    pub fn add_stream(&mut self, stream: Stream) -> usize {
        self.core.add_stream(stream)
    }

    /// Replace the waveform on `stream`.
    ///
    /// The waveform's timing must be set: a non-positive timescale is rejected.
    pub fn publish(&mut self, stream: usize, mut waveform: Waveform) -> PipelineResult<()> {
        let slot = format!("stream {stream}");
        if waveform.header().timescale <= 0 {
            return Err(PipelineError::invalid(
                slot,
                format!("timescale must be positive, got {}", waveform.header().timescale),
            ));
        }
        let target = self
            .core
            .stream_mut(stream)
            .ok_or_else(|| PipelineError::invalid(slot, "no such stream"))?;
        if target.stream_type.is_scalar() {
            return Err(PipelineError::invalid(&target.name, "scalar stream cannot carry a waveform"));
        }
        if waveform.header().start_timestamp == 0 && waveform.header().start_femtoseconds == 0 {
            waveform.header_mut().stamp_now();
        }
        target.set_waveform(Some(waveform));
        Ok(())
    }

    pub fn publish_scalar(&mut self, stream: usize, value: f64) -> PipelineResult<()> {
        let target = self
            .core
            .stream_mut(stream)
            .ok_or_else(|| PipelineError::invalid(format!("stream {stream}"), "no such stream"))?;
        if !target.stream_type.is_scalar() {
            return Err(PipelineError::invalid(&target.name, "not a scalar stream"));
        }
        target.set_scalar(value);
        Ok(())
    }
}

impl Default for WaveformSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for WaveformSource {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn validate_channel(&self, _slot: usize, _stream: &Stream) -> bool {
        false
    }

    fn refresh(&mut self, _ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
        Ok(())
    }

    /// Published data stays until the adapter replaces it.
    fn clear_outputs(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FilterGraph, StreamDescriptor};
    use crate::session::IdTable;
    use crate::waveform::UniformWaveform;

    #[test]
    fn test_publish_rejects_bad_timescale() {
        let mut src = WaveformSource::with_streams([Stream::analog("CH1", Unit::Volts)]);
        let bad = UniformWaveform::from_samples(vec![1.0f32], 0, 0);
        assert!(src.publish(0, bad.into()).is_err());
        let good = UniformWaveform::from_samples(vec![1.0f32], 10, 0);
        assert!(src.publish(0, good.into()).is_ok());
        assert!(src.core().stream(0).unwrap().has_data());
    }

    #[test]
    fn test_publish_unknown_stream() {
        let mut src = WaveformSource::new();
        let w = UniformWaveform::from_samples(vec![1.0f32], 10, 0);
        assert!(src.publish(3, w.into()).is_err());
    }

    #[test]
    fn test_publish_scalar_type_checked() {
        let mut src = WaveformSource::with_streams([
            Stream::analog("CH1", Unit::Volts),
            Stream::scalar("Vrms", Unit::Volts),
        ]);
        assert!(src.publish_scalar(0, 1.0).is_err());
        src.publish_scalar(1, 0.7).unwrap();
        assert_eq!(src.core().stream(1).unwrap().scalar_value(), Some(0.7));
    }

    #[test]
    fn test_graph_publish_marks_dirty() {
        let mut graph = FilterGraph::new();
        let id = graph.add_node(Box::new(WaveformSource::with_streams([Stream::analog(
            "CH1",
            Unit::Volts,
        )])));
        graph.refresh().unwrap();
        let w = UniformWaveform::from_samples(vec![1.0f32, 2.0], 10, 0);
        graph.publish(id, 0, w.into()).unwrap();
        let stats = graph.refresh().unwrap();
        assert_eq!(stats.refreshed, 1);
        let stream = graph.stream(StreamDescriptor::new(id, 0)).unwrap();
        assert_eq!(stream.waveform().unwrap().len(), 2);
    }

    #[test]
    fn test_stream_layout_round_trips() {
        let src = WaveformSource::with_streams([Stream::analog("CH1", Unit::Volts), Stream::digital("D0")]);
        let ids = IdTable::new();
        let section = src.core().serialize(&ids);

        let mut restored = WaveformSource::new();
        restored.core_mut().load(&section, &ids).unwrap();
        let streams = &restored.core().channel.streams;
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].name, "CH1");
        assert_eq!(streams[0].y_unit, Unit::Volts);
        assert_eq!(streams[1].stream_type, StreamType::Digital);
    }
}
