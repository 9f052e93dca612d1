//! Filter graph and its refresh scheduler.
//!
//! `FilterGraph` owns every node, derives edges from the nodes' bound input
//! slots, and runs dependency-ordered refresh passes. One pass owns one
//! command buffer and one queue; recorded work is submitted after each node
//! that recorded any.

use super::compiled_plan::CompiledPlan;
use super::compiler::GraphCompiler;
use super::error::{PipelineError, PipelineResult};
use super::id::NodeId;
use super::node::{DataLocation, Filter, GpuContext, InputView, NodeSlot, RefreshContext};
use super::parameter::ParameterValue;
use super::registry;
use super::stream::{Stream, StreamDescriptor};
use super::trend::DEFAULT_TREND_DEPTH;
use crate::accel::{CommandBuffer, ComputeDevice, ComputeQueue};
use crate::filters::WaveformSource;
use crate::waveform::{Waveform, WaveformBase};
use std::time::Instant;

/// Compute device plus the recording state of the current pass.
struct AccelState {
    device: ComputeDevice,
    cmd: CommandBuffer,
    queue: ComputeQueue,
}

/// Summary of one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub refreshed: usize,
    pub with_errors: usize,
    pub submissions: usize,
}

pub struct FilterGraph {
    nodes: Vec<Option<NodeSlot>>,
    accel: Option<AccelState>,
    compiled_plan: CompiledPlan,
    compiled_plan_dirty: bool,
    graph_generation: u64,
    trend_depth: usize,
    pass_count: u64,
}

impl FilterGraph {
    /// A CPU-only graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            accel: None,
            compiled_plan: CompiledPlan::new(),
            compiled_plan_dirty: true,
            graph_generation: 0,
            trend_depth: DEFAULT_TREND_DEPTH,
            pass_count: 0,
        }
    }

    /// A graph whose filters may offload work to `device`.
    pub fn with_device(device: ComputeDevice) -> Self {
        let mut graph = Self::new();
        graph.accel = Some(AccelState {
            cmd: device.command_buffer(),
            queue: device.queue(),
            device,
        });
        graph
    }

    pub fn device(&self) -> Option<&ComputeDevice> {
        self.accel.as_ref().map(|a| &a.device)
    }

    /// History depth for scalar streams of nodes added from now on.
    /// Zero disables trends.
    pub fn set_trend_depth(&mut self, depth: usize) {
        self.trend_depth = depth;
    }

    pub fn add_node(&mut self, mut filter: Box<dyn Filter>) -> NodeId {
        if self.trend_depth > 0 {
            for stream in &mut filter.core_mut().channel.streams {
                if stream.stream_type.is_scalar() {
                    stream.enable_trend(self.trend_depth);
                }
            }
        }
        let id = NodeId(self.nodes.len() as u32);
        tracing::info!("Added node {:?} ({})", id, filter.core().protocol());
        self.nodes.push(Some(NodeSlot { filter, dirty: true }));
        self.invalidate_compiled_plan();
        id
    }

    /// Create a filter through the registry and add it.
    pub fn add_filter(&mut self, protocol: &str) -> PipelineResult<NodeId> {
        let filter = registry::create_filter(protocol)?;
        Ok(self.add_node(filter))
    }

    /// Remove a node, unbinding every input that referenced it.
    pub fn remove_node(&mut self, id: NodeId) -> PipelineResult<Box<dyn Filter>> {
        let slot = self
            .nodes
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(PipelineError::NodeNotFound(id))?;

        for other in self.nodes.iter_mut().flatten() {
            let mut touched = false;
            for input in &mut other.filter.core_mut().inputs {
                if input.descriptor.is_some_and(|d| d.node == id) {
                    input.descriptor = None;
                    touched = true;
                }
            }
            other.dirty |= touched;
        }

        self.invalidate_compiled_plan();
        tracing::info!("Removed node {:?}", id);
        Ok(slot.filter)
    }

    pub fn len(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| NodeId(i as u32))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> Option<&(dyn Filter + 'static)> {
        self.nodes.get(id.index())?.as_ref().map(|s| s.filter.as_ref())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut (dyn Filter + 'static)> {
        match self.nodes.get_mut(id.index()) {
            Some(Some(slot)) => Some(slot.filter.as_mut()),
            _ => None,
        }
    }

    pub fn filter<T: Filter>(&self, id: NodeId) -> Option<&T> {
        self.node(id)?.downcast_ref()
    }

    /// Typed mutable access. Marks the node dirty.
    pub fn filter_mut<T: Filter>(&mut self, id: NodeId) -> Option<&mut T> {
        let slot = self.nodes.get_mut(id.index())?.as_mut()?;
        slot.dirty = true;
        slot.filter.downcast_mut()
    }

    /// First node with the given display name.
    pub fn find(&self, display_name: &str) -> Option<NodeId> {
        self.node_ids()
            .find(|&id| self.node(id).is_some_and(|n| n.core().display_name() == display_name))
    }

    pub fn stream(&self, d: StreamDescriptor) -> Option<&Stream> {
        self.node(d.node)?.core().stream(d.stream)
    }

    pub fn stream_mut(&mut self, d: StreamDescriptor) -> Option<&mut Stream> {
        self.node_mut(d.node)?.core_mut().stream_mut(d.stream)
    }

    pub fn errors(&self, id: NodeId) -> &[super::node::FilterError] {
        match self.node(id) {
            Some(n) => n.core().errors(),
            None => &[],
        }
    }

    pub fn plan(&mut self) -> &CompiledPlan {
        self.recompile_if_needed();
        &self.compiled_plan
    }

    pub fn generation(&self) -> u64 {
        self.graph_generation
    }

    pub fn pass_count(&self) -> u64 {
        self.pass_count
    }

    pub fn mark_dirty(&mut self, id: NodeId) {
        if let Some(Some(slot)) = self.nodes.get_mut(id.index()) {
            slot.dirty = true;
        }
    }

    pub fn mark_all_dirty(&mut self) {
        for slot in self.nodes.iter_mut().flatten() {
            slot.dirty = true;
        }
    }

    pub fn set_parameter(
        &mut self,
        id: NodeId,
        name: &str,
        value: impl Into<ParameterValue>,
    ) -> PipelineResult<()> {
        let slot = self
            .nodes
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(PipelineError::NodeNotFound(id))?;
        slot.filter.core_mut().parameters.set(name, value)?;
        slot.dirty = true;
        Ok(())
    }

    /// Publish a waveform on stream `stream` of the source node `id`.
    pub fn publish(&mut self, id: NodeId, stream: usize, waveform: Waveform) -> PipelineResult<()> {
        self.source_mut(id)?.publish(stream, waveform)?;
        self.mark_dirty(id);
        Ok(())
    }

    /// Publish a scalar on stream `stream` of the source node `id`.
    pub fn publish_scalar(&mut self, id: NodeId, stream: usize, value: f64) -> PipelineResult<()> {
        self.source_mut(id)?.publish_scalar(stream, value)?;
        self.mark_dirty(id);
        Ok(())
    }

    fn source_mut(&mut self, id: NodeId) -> PipelineResult<&mut WaveformSource> {
        self.node_mut(id)
            .ok_or(PipelineError::NodeNotFound(id))?
            .downcast_mut::<WaveformSource>()
            .ok_or_else(|| PipelineError::InvalidEdge(format!("{:?} is not a waveform source", id)))
    }

    /// Bind input `slot` of `node` to the stream `src`.
    pub fn connect(&mut self, src: StreamDescriptor, node: NodeId, slot: usize) -> PipelineResult<()> {
        if src.node == node {
            return Err(PipelineError::InvalidEdge("Cannot connect node to itself".to_string()));
        }
        if self.stream(src).is_none() {
            return Err(match self.node(src.node) {
                None => PipelineError::NodeNotFound(src.node),
                Some(_) => PipelineError::InvalidEdge(format!("{:?} has no stream {}", src.node, src.stream)),
            });
        }
        let consumer = self.node_mut(node).ok_or(PipelineError::NodeNotFound(node))?;
        if !consumer.core_mut().ensure_input(slot) {
            return Err(PipelineError::InvalidEdge(format!("{:?} has no input slot {}", node, slot)));
        }

        if let (Some(stream), Some(consumer)) = (self.stream(src), self.node(node)) {
            if !consumer.validate_channel(slot, stream) {
                return Err(PipelineError::invalid(
                    consumer.core().input_name(slot),
                    format!("stream '{}' of type {:?} not accepted", stream.name, stream.stream_type),
                ));
            }
        }

        if self.would_create_cycle(src.node, node) {
            return Err(PipelineError::CycleDetected);
        }

        if let Some(Some(s)) = self.nodes.get_mut(node.index()) {
            s.filter.core_mut().inputs[slot].descriptor = Some(src);
            s.dirty = true;
        }
        self.invalidate_compiled_plan();
        tracing::info!("Connected {} -> {:?}[{}]", src, node, slot);
        Ok(())
    }

    pub fn disconnect(&mut self, node: NodeId, slot: usize) -> PipelineResult<()> {
        let s = self
            .nodes
            .get_mut(node.index())
            .and_then(Option::as_mut)
            .ok_or(PipelineError::NodeNotFound(node))?;
        let input = s
            .filter
            .core_mut()
            .inputs
            .get_mut(slot)
            .ok_or_else(|| PipelineError::InvalidEdge(format!("{:?} has no input slot {}", node, slot)))?;
        input.descriptor = None;
        s.dirty = true;
        self.invalidate_compiled_plan();
        tracing::info!("Disconnected {:?}[{}]", node, slot);
        Ok(())
    }

    /// Nodes that read any stream of `id`.
    fn consumers_of(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().enumerate().filter_map(move |(i, s)| {
            let s = s.as_ref()?;
            s.filter
                .core()
                .inputs
                .iter()
                .any(|input| input.descriptor.is_some_and(|d| d.node == id))
                .then_some(NodeId(i as u32))
        })
    }

    /// Check if binding a stream of `from` into `to` would create a cycle.
    fn would_create_cycle(&self, from: NodeId, to: NodeId) -> bool {
        // If `to` can reach `from` through existing bindings, adding from->to creates a cycle.
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![to];

        while let Some(current) = stack.pop() {
            if current == from {
                return true;
            }
            let idx = current.index();
            if idx >= self.nodes.len() || visited[idx] {
                continue;
            }
            visited[idx] = true;
            stack.extend(self.consumers_of(current));
        }
        false
    }

    /// Invalidate the compiled plan (called when graph topology changes).
    fn invalidate_compiled_plan(&mut self) {
        self.compiled_plan_dirty = true;
        self.graph_generation += 1;
    }

    /// Recompile the plan if needed (lazy recompilation).
    fn recompile_if_needed(&mut self) {
        if !self.compiled_plan_dirty {
            return;
        }
        self.compiled_plan = GraphCompiler::compile(&self.nodes, self.graph_generation);
        self.compiled_plan_dirty = false;

        tracing::info!(
            "Filter graph recompiled: {} scheduled / {} total (gen {})",
            self.compiled_plan.stats.scheduled_nodes,
            self.compiled_plan.stats.total_nodes,
            self.compiled_plan.generation,
        );

        if self.compiled_plan.has_cycle {
            tracing::warn!(
                "Filter graph has a cycle! Only {} of {} nodes scheduled.",
                self.compiled_plan.stats.scheduled_nodes,
                self.compiled_plan.stats.total_nodes
            );
        }
        for &idx in &self.compiled_plan.starved_nodes {
            if let Some(slot) = &self.nodes[idx] {
                tracing::debug!(
                    "Node '{}' (idx {}) has no path from a source",
                    slot.filter.core().display_name(),
                    idx
                );
            }
        }
    }

    /// Mark every consumer of a dirty node dirty, in schedule order.
    fn propagate_dirty(&mut self) {
        for &idx in &self.compiled_plan.order {
            if !self.nodes[idx].as_ref().is_some_and(|s| s.dirty) {
                continue;
            }
            for consumer in self.compiled_plan.consumers(idx) {
                if let Some(slot) = self.nodes[consumer].as_mut() {
                    slot.dirty = true;
                }
            }
        }
    }

    /// Refresh every dirty node and everything downstream of one.
    pub fn refresh(&mut self) -> PipelineResult<RefreshStats> {
        self.recompile_if_needed();
        if self.compiled_plan.has_cycle {
            return Err(PipelineError::CycleDetected);
        }
        self.propagate_dirty();

        let start = Instant::now();
        let mut stats = RefreshStats::default();
        let order = self.compiled_plan.order.clone();
        for idx in order {
            if !self.nodes[idx].as_ref().is_some_and(|s| s.dirty) {
                continue;
            }
            let Some(mut slot) = self.nodes[idx].take() else {
                continue;
            };
            let result = self.refresh_node(&mut slot);
            slot.dirty = false;
            let has_errors = !slot.filter.core().errors().is_empty();
            self.nodes[idx] = Some(slot);

            stats.submissions += result?;
            stats.refreshed += 1;
            stats.with_errors += usize::from(has_errors);
        }

        self.pass_count += 1;
        tracing::debug!(
            "Refresh pass {}: {} nodes, {} with errors, {} submissions in {:?}",
            self.pass_count,
            stats.refreshed,
            stats.with_errors,
            stats.submissions,
            start.elapsed()
        );
        Ok(stats)
    }

    /// Refresh every node regardless of dirty state.
    pub fn refresh_all(&mut self) -> PipelineResult<RefreshStats> {
        self.mark_all_dirty();
        self.refresh()
    }

    /// Run one node's refresh contract. Returns the number of submissions.
    fn refresh_node(&mut self, slot: &mut NodeSlot) -> PipelineResult<usize> {
        let filter = slot.filter.as_mut();
        let name = filter.core().display_name().to_string();
        filter.core_mut().clear_errors();
        filter.core_mut().clear_packets();

        let inputs = filter.core().inputs.clone();
        let mut problems = Vec::new();
        for (i, input) in inputs.iter().enumerate() {
            match input.descriptor {
                None if input.optional => {}
                None => problems.push(PipelineError::missing(&input.name, "not connected")),
                Some(d) => match self.stream(d) {
                    None => problems.push(PipelineError::missing(&input.name, format!("{} no longer exists", d))),
                    Some(s) if !filter.validate_channel(i, s) => problems.push(PipelineError::invalid(
                        &input.name,
                        format!("stream '{}' of type {:?} not accepted", s.name, s.stream_type),
                    )),
                    Some(s) if !s.has_data() => problems.push(PipelineError::missing(&input.name, "no data")),
                    Some(_) => {}
                },
            }
        }
        if !problems.is_empty() {
            for p in problems {
                if let Some(kind) = p.kind() {
                    filter.core_mut().record_error(kind, p.to_string());
                }
            }
            filter.clear_outputs();
            tracing::debug!("{}: skipped, inputs not ready", name);
            return Ok(0);
        }

        let bound: Vec<StreamDescriptor> = inputs.iter().filter_map(|i| i.descriptor).collect();
        match filter.input_location() {
            DataLocation::Cpu => {
                for &d in &bound {
                    if let Some(w) = self.stream_mut(d).and_then(Stream::waveform_mut) {
                        w.prepare_for_cpu_access()?;
                    }
                }
            }
            DataLocation::Gpu => {
                for &d in &bound {
                    if let Some(w) = self.stream_mut(d).and_then(Stream::waveform_mut) {
                        w.prepare_for_gpu_access()?;
                    }
                }
            }
            DataLocation::DontCare => {}
        }

        let trend_time = bound
            .iter()
            .find_map(|&d| self.stream(d).and_then(Stream::waveform))
            .map(|w| w.header().start_seconds())
            .unwrap_or_else(|| {
                let now = chrono::Utc::now();
                now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) * 1e-9
            });
        let before: Vec<u64> = filter
            .core()
            .channel
            .streams
            .iter()
            .map(Stream::change_count)
            .collect();

        let start = Instant::now();
        let result = {
            let mut ctx = RefreshContext {
                inputs: InputView::new(&mut self.nodes, inputs),
                gpu: self.accel.as_mut().map(|a| GpuContext {
                    device: &a.device,
                    cmd: &mut a.cmd,
                    queue: &a.queue,
                }),
            };
            filter.refresh(&mut ctx)
        };

        let mut submissions = 0;
        if let Some(a) = self.accel.as_mut() {
            if !a.cmd.is_empty() {
                a.queue.submit_and_block(&mut a.cmd)?;
                submissions += 1;
            }
        }

        match result {
            Ok(()) => {
                for (i, stream) in filter.core_mut().channel.streams.iter_mut().enumerate() {
                    let changed = before.get(i).map_or(true, |&b| b != stream.change_count());
                    if changed && stream.stream_type.is_scalar() {
                        stream.record_trend(trend_time);
                    }
                }
                tracing::debug!("{}: refreshed in {:?}", name, start.elapsed());
            }
            Err(e) => match e.kind() {
                Some(kind) => {
                    tracing::warn!("{}: {}", name, e);
                    filter.core_mut().record_error(kind, e.to_string());
                    filter.clear_outputs();
                }
                None => return Err(e),
            },
        }
        Ok(submissions)
    }
}

impl Default for FilterGraph {
    fn default() -> Self {
        Self::new()
    }
}
