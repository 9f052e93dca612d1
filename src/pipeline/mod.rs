//! Filter graph.
//!
//! Producers publish waveforms on their output streams; filters read upstream
//! streams, compute on the CPU or the compute device, and publish their own
//! streams. The graph refreshes dirty nodes in dependency order.
//!
//! # Architecture
//!
//! ```text
//! [WaveformSource] ──► [Subtract] ──► [DutyCycle] ──► scalar + trend
//!                 └──► [ClockRecovery] ──► [DDJ]
//! ```
//!
//! # Design
//!
//! - **Trait objects for filters**: each filter embeds a `FilterCore` and
//!   implements `Filter`; the registry constructs them by protocol name.
//! - **Descriptor edges**: inputs hold `StreamDescriptor`s, not references;
//!   edges are derived when the plan is compiled.
//! - **Lazy recompilation**: topology changes bump a generation counter and
//!   the Kahn-ordered plan is rebuilt on the next refresh.
//! - **Single-threaded**: one refresh pass at a time, one command buffer per
//!   pass, submitted after each node that recorded work.

pub mod compiled_plan;
pub mod compiler;
pub mod error;
pub mod executor;
pub mod id;
pub mod node;
pub mod packet;
pub mod parameter;
pub mod registry;
pub mod stream;
pub mod trend;

pub use compiled_plan::{CompiledPlan, PlanStats};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use executor::{FilterGraph, RefreshStats};
pub use id::NodeId;
pub use node::{
    is_analog, is_digital, is_scalar, DataLocation, Filter, FilterCategory, FilterCore,
    FilterError, GpuContext, InputSlot, InputView, RefreshContext,
};
pub use packet::Packet;
pub use parameter::{FilterParameter, ParameterKind, ParameterSet, ParameterValue};
pub use registry::{create_filter, register_filter, registered_protocols};
pub use stream::{Channel, Stream, StreamDescriptor, StreamType};
pub use trend::{RunningStats, TrendAccumulator};
