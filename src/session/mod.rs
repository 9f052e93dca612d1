//! Session save and restore.
//!
//! A session captures the connected instruments and the whole filter graph
//! in one JSON document. See [`loader`] for the load passes.
//!
//! # Example
//!
//! ```ignore
//! use scopeflow::session::{load_session, preload_session, SessionDocument};
//!
//! let doc = SessionDocument::load("bench.scopesession")?;
//! for warning in preload_session(&doc, &[]) {
//!     println!("{warning}");
//! }
//! let loaded = load_session(&doc, &mut graph)?;
//! ```

pub mod document;
pub mod id_table;
pub mod instrument;
pub mod loader;

pub use document::{
    ChannelSection, FilterSection, InputRef, InstrumentSection, PowerChannelState, PowerSupplyState,
    SessionDocument, SESSION_VERSION,
};
pub use id_table::IdTable;
pub use instrument::{preload_warnings, PowerSupply};
pub use loader::{load_session, preload_session, save_session, LoadedChannel, LoadedSession};
