//! Streams, channels and stream descriptors.
//!
//! A node owns one output [`Channel`]; the channel owns one or more
//! [`Stream`]s. Downstream nodes refer to a stream through a
//! [`StreamDescriptor`] rather than holding a reference, so the graph can hand
//! out mutable access to one node while its inputs are read.

use super::id::NodeId;
use super::trend::TrendAccumulator;
use crate::types::{Color, Unit};
use crate::waveform::{Waveform, WaveformBase};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Analog,
    Digital,
    AnalogScalar,
    Protocol,
    Eye,
    Spectrogram,
    Trigger,
    #[default]
    Undefined,
}

impl StreamType {
    /// Scalar streams carry a value instead of a waveform.
    pub fn is_scalar(self) -> bool {
        self == StreamType::AnalogScalar
    }
}

/// One output of a node.
#[derive(Debug)]
pub struct Stream {
    pub name: String,
    pub stream_type: StreamType,
    pub x_unit: Unit,
    pub y_unit: Unit,
    waveform: Option<Waveform>,
    value: Option<f64>,
    change_count: u64,
    trend: Option<TrendAccumulator>,
}

impl Stream {
    pub fn new(name: impl Into<String>, stream_type: StreamType, x_unit: Unit, y_unit: Unit) -> Self {
        Self {
            name: name.into(),
            stream_type,
            x_unit,
            y_unit,
            waveform: None,
            value: None,
            change_count: 0,
            trend: None,
        }
    }

    pub fn analog(name: impl Into<String>, y_unit: Unit) -> Self {
        Self::new(name, StreamType::Analog, Unit::Femtoseconds, y_unit)
    }

    pub fn digital(name: impl Into<String>) -> Self {
        Self::new(name, StreamType::Digital, Unit::Femtoseconds, Unit::Counts)
    }

    pub fn scalar(name: impl Into<String>, y_unit: Unit) -> Self {
        Self::new(name, StreamType::AnalogScalar, Unit::Unitless, y_unit)
    }

    pub fn protocol(name: impl Into<String>) -> Self {
        Self::new(name, StreamType::Protocol, Unit::Femtoseconds, Unit::Unitless)
    }

    pub fn waveform(&self) -> Option<&Waveform> {
        self.waveform.as_ref()
    }

    pub fn waveform_mut(&mut self) -> Option<&mut Waveform> {
        self.waveform.as_mut()
    }

    /// Replace the waveform, bumping its revision and the change counter.
    pub fn set_waveform(&mut self, waveform: Option<Waveform>) {
        self.waveform = waveform;
        if let Some(w) = self.waveform.as_mut() {
            w.header_mut().bump_revision();
        }
        self.change_count += 1;
    }

    pub fn take_waveform(&mut self) -> Option<Waveform> {
        self.waveform.take()
    }

    /// Current scalar value; `None` means undefined.
    pub fn scalar_value(&self) -> Option<f64> {
        self.value
    }

    /// Non-finite values leave the stream undefined.
    pub fn set_scalar(&mut self, value: f64) {
        self.value = value.is_finite().then_some(value);
        self.change_count += 1;
    }

    pub fn clear_scalar(&mut self) {
        if self.value.take().is_some() {
            self.change_count += 1;
        }
    }

    /// Drop the waveform and scalar value.
    pub fn clear(&mut self) {
        let had_data = self.waveform.is_some() || self.value.is_some();
        self.waveform = None;
        self.value = None;
        if had_data {
            self.change_count += 1;
        }
    }

    /// True if the stream holds a waveform or a defined scalar.
    pub fn has_data(&self) -> bool {
        if self.stream_type.is_scalar() {
            self.value.is_some()
        } else {
            self.waveform.is_some()
        }
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    /// Mark the stream as rewritten in place.
    pub fn touch(&mut self) {
        if let Some(w) = self.waveform.as_mut() {
            w.header_mut().bump_revision();
        }
        self.change_count += 1;
    }

    pub fn enable_trend(&mut self, depth: usize) {
        if self.trend.as_ref().map(|t| t.depth()) != Some(depth) {
            self.trend = Some(TrendAccumulator::new(depth));
        }
    }

    pub fn trend(&self) -> Option<&TrendAccumulator> {
        self.trend.as_ref()
    }

    /// Append the current scalar to the trend, if both exist.
    pub fn record_trend(&mut self, time: f64) {
        if let (Some(trend), Some(v)) = (self.trend.as_mut(), self.value) {
            trend.push(time, v);
        }
    }
}

/// A node's named, coloured group of output streams.
#[derive(Debug)]
pub struct Channel {
    pub display_name: String,
    pub color: Color,
    pub streams: Vec<Stream>,
}

impl Channel {
    pub fn new(display_name: impl Into<String>, color: Color) -> Self {
        Self {
            display_name: display_name.into(),
            color,
            streams: Vec::new(),
        }
    }

    pub fn add_stream(&mut self, stream: Stream) -> usize {
        self.streams.push(stream);
        self.streams.len() - 1
    }

    pub fn stream(&self, i: usize) -> Option<&Stream> {
        self.streams.get(i)
    }

    pub fn stream_mut(&mut self, i: usize) -> Option<&mut Stream> {
        self.streams.get_mut(i)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn find_stream(&self, name: &str) -> Option<usize> {
        self.streams.iter().position(|s| s.name == name)
    }

    /// Clear every stream's data.
    pub fn clear(&mut self) {
        for s in &mut self.streams {
            s.clear();
        }
    }
}

/// (producer node, output stream index).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub node: NodeId,
    pub stream: usize,
}

impl StreamDescriptor {
    pub fn new(node: NodeId, stream: usize) -> Self {
        Self { node, stream }
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::UniformWaveform;

    #[test]
    fn test_scalar_undefined_when_not_finite() {
        let mut s = Stream::scalar("duty", Unit::Percent);
        assert!(!s.has_data());
        s.set_scalar(0.5);
        assert_eq!(s.scalar_value(), Some(0.5));
        s.set_scalar(f64::NAN);
        assert_eq!(s.scalar_value(), None);
        assert_eq!(s.change_count(), 2);
    }

    #[test]
    fn test_set_waveform_bumps_revision() {
        let mut s = Stream::analog("ch1", Unit::Volts);
        s.set_waveform(Some(UniformWaveform::from_samples(vec![1.0f32], 10, 0).into()));
        assert_eq!(s.waveform().unwrap().header().revision, 1);
        assert!(s.has_data());
        s.clear();
        assert!(s.waveform().is_none());
        assert_eq!(s.change_count(), 2);
    }

    #[test]
    fn test_trend_records_only_defined_values() {
        let mut s = Stream::scalar("base", Unit::Volts);
        s.enable_trend(4);
        s.record_trend(1.0);
        assert!(s.trend().unwrap().is_empty());
        s.set_scalar(0.25);
        s.record_trend(2.0);
        assert_eq!(s.trend().unwrap().last(), Some((2.0, 0.25)));
    }

    #[test]
    fn test_channel_lookup() {
        let mut ch = Channel::new("DutyCycle1", Color::DEFAULT);
        ch.add_stream(Stream::analog("trend", Unit::Percent));
        let idx = ch.add_stream(Stream::scalar("avg", Unit::Percent));
        assert_eq!(ch.find_stream("avg"), Some(idx));
        assert_eq!(ch.stream_count(), 2);
        assert_eq!(StreamDescriptor::new(NodeId(2), 1).to_string(), "NodeId(2):1");
    }
}
