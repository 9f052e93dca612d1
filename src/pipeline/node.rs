//! Filter abstraction for the graph.
//!
//! Every filter embeds a [`FilterCore`] holding the state the scheduler and
//! the session code need (inputs, output channel, parameters, errors, packets,
//! serialization callbacks) and implements [`Filter`] for its algorithm.
//!
//! During a refresh the scheduler moves the node being refreshed out of the
//! graph and hands it an [`InputView`] over the remaining nodes, so a filter
//! can read (and, for device binding, mutably prepare) its upstream streams
//! while writing its own outputs.

use super::error::{ErrorKind, PipelineError, PipelineResult};
use super::packet::Packet;
use super::parameter::ParameterSet;
use super::stream::{Channel, Stream, StreamDescriptor, StreamType};
use crate::accel::{AccelResult, CommandBuffer, ComputeDevice, ComputeQueue};
use crate::session::IdTable;
use crate::types::Color;
use crate::waveform::Waveform;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::fmt;

/// Where the scheduler should make inputs resident before `refresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLocation {
    Cpu,
    Gpu,
    /// The filter prepares its own inputs.
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterCategory {
    Math,
    Measurement,
    Clock,
    Bus,
    Serial,
    Memory,
    Rf,
    Import,
    Export,
    Source,
    Misc,
}

/// An error recorded on a node during its last refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone)]
pub struct InputSlot {
    pub name: String,
    pub descriptor: Option<StreamDescriptor>,
    /// Unbound optional slots are not an error.
    pub optional: bool,
}

/// Writes a node's state into its section of a session document.
pub type SerializerFn = Box<dyn Fn(&FilterCore, &IdTable, &mut Map<String, Value>)>;
/// Inspects an incoming section and appends warnings about unsafe changes.
pub type PreloaderFn = Box<dyn Fn(&FilterCore, &Map<String, Value>, &mut Vec<String>)>;
/// Applies an incoming section once every node exists.
pub type LoaderFn = Box<dyn Fn(&mut FilterCore, &Map<String, Value>, &IdTable) -> PipelineResult<()>>;

pub struct FilterCore {
    protocol: &'static str,
    pub category: FilterCategory,
    pub inputs: Vec<InputSlot>,
    /// Prefix for slots created on demand, for filters with any number of inputs.
    variadic_prefix: Option<&'static str>,
    pub channel: Channel,
    pub parameters: ParameterSet,
    errors: Vec<FilterError>,
    packets: Vec<Packet>,
    serializers: Vec<SerializerFn>,
    preloaders: Vec<PreloaderFn>,
    loaders: Vec<LoaderFn>,
}

impl FilterCore {
    pub fn new(protocol: &'static str, category: FilterCategory, color: Color) -> Self {
        let mut core = Self {
            protocol,
            category,
            inputs: Vec::new(),
            variadic_prefix: None,
            channel: Channel::new(protocol, color),
            parameters: ParameterSet::new(),
            errors: Vec::new(),
            packets: Vec::new(),
            serializers: Vec::new(),
            preloaders: Vec::new(),
            loaders: Vec::new(),
        };
        core.add_serializer(serialize_parameters_and_inputs);
        core.add_loader(load_parameters);
        core
    }

    /// Registry name.
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn display_name(&self) -> &str {
        &self.channel.display_name
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.channel.display_name = name.into();
    }

    pub fn color(&self) -> Color {
        self.channel.color
    }

    pub fn add_input(&mut self, name: &str) -> usize {
        self.inputs.push(InputSlot {
            name: name.to_string(),
            descriptor: None,
            optional: false,
        });
        self.inputs.len() - 1
    }

    pub fn add_optional_input(&mut self, name: &str) -> usize {
        let i = self.add_input(name);
        self.inputs[i].optional = true;
        i
    }

    /// Allow slots past the declared ones to be created on connect.
    pub fn set_variadic_inputs(&mut self, prefix: &'static str) {
        self.variadic_prefix = Some(prefix);
    }

    /// Make sure slot `i` exists, creating it if inputs are variadic.
    pub fn ensure_input(&mut self, i: usize) -> bool {
        let Some(prefix) = self.variadic_prefix else {
            return i < self.inputs.len();
        };
        while self.inputs.len() <= i {
            let n = self.inputs.len();
            self.add_input(&format!("{prefix}{n}"));
        }
        true
    }

    pub fn input_name(&self, i: usize) -> &str {
        self.inputs.get(i).map_or("?", |s| s.name.as_str())
    }

    pub fn add_stream(&mut self, stream: Stream) -> usize {
        self.channel.add_stream(stream)
    }

    pub fn stream(&self, i: usize) -> Option<&Stream> {
        self.channel.stream(i)
    }

    pub fn stream_mut(&mut self, i: usize) -> Option<&mut Stream> {
        self.channel.stream_mut(i)
    }

    /// Publish a waveform on output `i`.
    pub fn set_output(&mut self, i: usize, waveform: Waveform) {
        if let Some(s) = self.channel.stream_mut(i) {
            s.set_waveform(Some(waveform));
        }
    }

    /// Take output `i`'s previous waveform for reuse.
    pub fn take_output(&mut self, i: usize) -> Option<Waveform> {
        self.channel.stream_mut(i).and_then(Stream::take_waveform)
    }

    pub fn set_scalar(&mut self, i: usize, value: f64) {
        if let Some(s) = self.channel.stream_mut(i) {
            s.set_scalar(value);
        }
    }

    pub fn errors(&self) -> &[FilterError] {
        &self.errors
    }

    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.errors.push(FilterError {
            kind,
            message: message.into(),
        });
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn push_packet(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn clear_packets(&mut self) {
        self.packets.clear();
    }

    pub fn add_serializer(
        &mut self,
        f: impl Fn(&FilterCore, &IdTable, &mut Map<String, Value>) + 'static,
    ) {
        self.serializers.push(Box::new(f));
    }

    pub fn add_preloader(
        &mut self,
        f: impl Fn(&FilterCore, &Map<String, Value>, &mut Vec<String>) + 'static,
    ) {
        self.preloaders.push(Box::new(f));
    }

    pub fn add_loader(
        &mut self,
        f: impl Fn(&mut FilterCore, &Map<String, Value>, &IdTable) -> PipelineResult<()> + 'static,
    ) {
        self.loaders.push(Box::new(f));
    }

    /// Run every serializer in order.
    pub fn serialize(&self, ids: &IdTable) -> Map<String, Value> {
        let mut section = Map::new();
        for s in &self.serializers {
            s(self, ids, &mut section);
        }
        section
    }

    /// Run every pre-loader in order, collecting warnings.
    pub fn preload(&self, section: &Map<String, Value>) -> Vec<String> {
        let mut warnings = Vec::new();
        for p in &self.preloaders {
            p(self, section, &mut warnings);
        }
        warnings
    }

    /// Run every loader in order. Stops at the first failure.
    pub fn load(&mut self, section: &Map<String, Value>, ids: &IdTable) -> PipelineResult<()> {
        let loaders = std::mem::take(&mut self.loaders);
        let result = loaders.iter().try_for_each(|l| l(self, section, ids));
        self.loaders = loaders;
        result
    }
}

impl fmt::Debug for FilterCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterCore")
            .field("protocol", &self.protocol)
            .field("display_name", &self.channel.display_name)
            .field("inputs", &self.inputs)
            .field("streams", &self.channel.stream_count())
            .field("errors", &self.errors)
            .finish()
    }
}

fn serialize_parameters_and_inputs(core: &FilterCore, ids: &IdTable, section: &mut Map<String, Value>) {
    section.insert("parameters".into(), Value::Object(core.parameters.to_json()));
    let inputs = core
        .inputs
        .iter()
        .map(|slot| match slot.descriptor.and_then(|d| ids.saved_id(d.node).map(|id| (id, d))) {
            Some((id, d)) => json!({ "id": id, "stream": d.stream }),
            None => Value::Null,
        })
        .collect();
    section.insert("inputs".into(), Value::Array(inputs));
}

fn load_parameters(core: &mut FilterCore, section: &Map<String, Value>, _ids: &IdTable) -> PipelineResult<()> {
    let Some(params) = section.get("parameters").and_then(Value::as_object) else {
        return Ok(());
    };
    for (name, value) in params {
        match core.parameters.get_mut(name) {
            Some(p) => p.load_json(name, value)?,
            None => tracing::debug!("{}: ignoring unknown parameter '{}'", core.protocol, name),
        }
    }
    Ok(())
}

/// Blanket `Any` access for trait objects.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A node in the filter graph.
pub trait Filter: AsAny {
    fn core(&self) -> &FilterCore;
    fn core_mut(&mut self) -> &mut FilterCore;

    /// Whether `stream` is acceptable for input `slot`.
    fn validate_channel(&self, slot: usize, stream: &Stream) -> bool;

    fn input_location(&self) -> DataLocation {
        DataLocation::Cpu
    }

    /// Compute outputs from the current inputs.
    fn refresh(&mut self, ctx: &mut RefreshContext<'_>) -> PipelineResult<()>;

    /// Called after a recorded error. Clears every output by default.
    fn clear_outputs(&mut self) {
        self.core_mut().channel.clear();
    }
}

impl dyn Filter {
    pub fn downcast_ref<T: Filter>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: Filter>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut()
    }
}

/// Stream types shared by most single-input filters.
pub fn is_analog(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Analog
}

pub fn is_digital(stream: &Stream) -> bool {
    stream.stream_type == StreamType::Digital
}

pub fn is_scalar(stream: &Stream) -> bool {
    stream.stream_type == StreamType::AnalogScalar
}

pub(crate) struct NodeSlot {
    pub filter: Box<dyn Filter>,
    pub dirty: bool,
}

/// Device handles for one refresh pass.
pub struct GpuContext<'a> {
    pub device: &'a ComputeDevice,
    pub cmd: &'a mut CommandBuffer,
    pub queue: &'a ComputeQueue,
}

impl GpuContext<'_> {
    /// Submit the current recording and wait for it.
    pub fn submit(&mut self) -> AccelResult<()> {
        self.queue.submit_and_block(self.cmd)
    }
}

pub struct RefreshContext<'a> {
    pub inputs: InputView<'a>,
    pub gpu: Option<GpuContext<'a>>,
}

impl<'a> RefreshContext<'a> {
    pub fn device(&self) -> Option<&ComputeDevice> {
        self.gpu.as_ref().map(|g| g.device)
    }
}

/// Read access to a node's bound input streams.
pub struct InputView<'a> {
    nodes: &'a mut [Option<NodeSlot>],
    slots: Vec<InputSlot>,
}

impl<'a> InputView<'a> {
    pub(crate) fn new(nodes: &'a mut [Option<NodeSlot>], slots: Vec<InputSlot>) -> Self {
        Self { nodes, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn descriptor(&self, slot: usize) -> Option<StreamDescriptor> {
        self.slots.get(slot).and_then(|s| s.descriptor)
    }

    pub fn is_bound(&self, slot: usize) -> bool {
        self.descriptor(slot).is_some()
    }

    fn slot_name(&self, slot: usize) -> String {
        self.slots
            .get(slot)
            .map_or_else(|| format!("#{slot}"), |s| s.name.clone())
    }

    pub fn stream(&self, slot: usize) -> Option<&Stream> {
        let d = self.descriptor(slot)?;
        self.nodes
            .get(d.node.index())?
            .as_ref()?
            .filter
            .core()
            .channel
            .stream(d.stream)
    }

    pub fn stream_mut(&mut self, slot: usize) -> Option<&mut Stream> {
        let d = self.descriptor(slot)?;
        self.nodes
            .get_mut(d.node.index())?
            .as_mut()?
            .filter
            .core_mut()
            .channel
            .stream_mut(d.stream)
    }

    pub fn waveform(&self, slot: usize) -> Option<&Waveform> {
        self.stream(slot)?.waveform()
    }

    pub fn waveform_mut(&mut self, slot: usize) -> Option<&mut Waveform> {
        self.stream_mut(slot)?.waveform_mut()
    }

    pub fn scalar(&self, slot: usize) -> Option<f64> {
        self.stream(slot)?.scalar_value()
    }

    pub fn require_stream(&self, slot: usize) -> PipelineResult<&Stream> {
        self.stream(slot)
            .ok_or_else(|| PipelineError::missing(self.slot_name(slot), "not connected"))
    }

    pub fn require_waveform(&self, slot: usize) -> PipelineResult<&Waveform> {
        self.waveform(slot)
            .ok_or_else(|| PipelineError::missing(self.slot_name(slot), "no waveform"))
    }

    pub fn require_waveform_mut(&mut self, slot: usize) -> PipelineResult<&mut Waveform> {
        let name = self.slot_name(slot);
        self.waveform_mut(slot)
            .ok_or_else(|| PipelineError::missing(name, "no waveform"))
    }

    pub fn require_scalar(&self, slot: usize) -> PipelineResult<f64> {
        self.scalar(slot)
            .ok_or_else(|| PipelineError::missing(self.slot_name(slot), "scalar undefined"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::parameter::FilterParameter;
    use crate::types::Unit;

    struct Passthrough {
        core: FilterCore,
    }

    impl Filter for Passthrough {
        fn core(&self) -> &FilterCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut FilterCore {
            &mut self.core
        }
        fn validate_channel(&self, _slot: usize, stream: &Stream) -> bool {
            is_analog(stream)
        }
        fn refresh(&mut self, _ctx: &mut RefreshContext<'_>) -> PipelineResult<()> {
            Ok(())
        }
    }

    fn passthrough() -> Passthrough {
        let mut core = FilterCore::new("Passthrough", FilterCategory::Misc, Color::DEFAULT);
        core.add_input("din");
        core.parameters.insert("Gain", FilterParameter::float(2.0, Unit::Unitless));
        Passthrough { core }
    }

    #[test]
    fn test_downcast() {
        let f: Box<dyn Filter> = Box::new(passthrough());
        assert!(f.downcast_ref::<Passthrough>().is_some());
        assert_eq!(f.core().protocol(), "Passthrough");
    }

    #[test]
    fn test_variadic_inputs() {
        let mut core = FilterCore::new("Export", FilterCategory::Export, Color::DEFAULT);
        assert!(!core.ensure_input(0));
        core.set_variadic_inputs("in");
        assert!(core.ensure_input(2));
        assert_eq!(core.inputs.len(), 3);
        assert_eq!(core.input_name(2), "in2");
    }

    #[test]
    fn test_serialize_and_load_parameters() {
        let mut f = passthrough();
        f.core.parameters.set("Gain", 4.0).unwrap();
        let ids = IdTable::new();
        let section = f.core.serialize(&ids);
        assert_eq!(section["parameters"]["Gain"], json!(4.0));
        assert_eq!(section["inputs"], json!([null]));

        let mut g = passthrough();
        g.core.load(&section, &ids).unwrap();
        assert_eq!(g.core.parameters.float("Gain"), 4.0);
    }

    #[test]
    fn test_custom_serializer_and_preloader_order() {
        let mut f = passthrough();
        f.core.add_serializer(|_, _, s| {
            s.insert("extra".into(), json!(1));
        });
        f.core.add_preloader(|core, section, warnings| {
            let new = section["parameters"]["Gain"].as_f64().unwrap_or(0.0);
            if new > core.parameters.float("Gain") {
                warnings.push(format!("Gain will rise to {new}"));
            }
        });
        let ids = IdTable::new();
        let section = f.core.serialize(&ids);
        assert_eq!(section["extra"], json!(1));

        let incoming = json!({ "parameters": { "Gain": 10.0 } });
        let warnings = f.core.preload(incoming.as_object().unwrap());
        assert_eq!(warnings, vec!["Gain will rise to 10".to_string()]);
    }

    #[test]
    fn test_errors_and_packets() {
        let mut core = FilterCore::new("X", FilterCategory::Misc, Color::DEFAULT);
        core.record_error(ErrorKind::Degenerate, "too short");
        core.push_packet(Packet::new(0, 1));
        assert_eq!(core.errors()[0].to_string(), "Degenerate: too short");
        core.clear_errors();
        core.clear_packets();
        assert!(core.errors().is_empty());
        assert!(core.packets().is_empty());
    }
}
