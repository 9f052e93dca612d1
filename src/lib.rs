//! # scopeflow: waveform processing core
//!
//! scopeflow turns captured oscilloscope and logic analyzer data into derived
//! measurements and decoded protocol traffic. Producers publish waveforms
//! into a filter graph; filters compute on the CPU or on a compute device
//! and publish their own streams for renderers and exporters.
//!
//! ## Architecture
//!
//! - **accel**: dual-residency buffers and the compute device, pipelines and queues
//! - **waveform**: uniform, sparse and protocol waveforms with their timing helpers
//! - **pipeline**: the filter graph, its scheduler, parameters and the filter registry
//! - **filters**: measurement, clock, decoder, FFT, import and export filters
//! - **formats**: file codecs (VCD, CSV, WAV, BIN, Siglent BIN, Touchstone)
//! - **session**: JSON session documents and the multi-pass loader
//!
//! ## Configuration
//!
//! Engine settings live in `engine.toml` under the platform config directory
//! (`~/.config/scopeflow/` on Linux); see [`config::EngineConfig`].
//!
//! ## Example
//!
//! ```ignore
//! use scopeflow::{
//!     config::EngineConfig,
//!     filters::{DutyCycleFilter, WaveformSource},
//!     pipeline::{Stream, StreamDescriptor},
//!     types::Unit,
//! };
//!
//! let config = EngineConfig::load_or_default();
//! let mut graph = config.build_graph();
//!
//! let scope = graph.add_node(Box::new(WaveformSource::with_streams([
//!     Stream::analog("CH1", Unit::Volts),
//! ])));
//! let duty = graph.add_node(Box::new(DutyCycleFilter::new()));
//! graph.connect(StreamDescriptor::new(scope, 0), duty, 0)?;
//!
//! graph.publish(scope, 0, capture)?;
//! graph.refresh()?;
//! ```

pub mod accel;
pub mod config;
pub mod error;
pub mod filters;
pub mod formats;
pub mod logging;
pub mod pipeline;
pub mod session;
pub mod types;
pub mod waveform;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{Result, ScopeError};
pub use pipeline::{Filter, FilterGraph, NodeId, Stream, StreamDescriptor};
pub use session::SessionDocument;
pub use types::{Color, Unit};
pub use waveform::Waveform;
