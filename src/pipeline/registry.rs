//! Process-wide filter factory keyed by protocol name.
//!
//! The built-in filter library is registered on first use; applications may
//! add their own constructors at startup.

use super::error::{PipelineError, PipelineResult};
use super::node::Filter;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

pub type FilterConstructor = fn() -> Box<dyn Filter>;

static REGISTRY: OnceLock<RwLock<HashMap<String, FilterConstructor>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, FilterConstructor>> {
    REGISTRY.get_or_init(|| {
        let mut map = HashMap::new();
        crate::filters::register_builtins(|name, ctor| {
            map.insert(name.to_string(), ctor);
        });
        tracing::debug!("Filter registry initialized with {} protocols", map.len());
        RwLock::new(map)
    })
}

/// Register or replace a constructor.
pub fn register_filter(protocol: &str, ctor: FilterConstructor) {
    let mut map = registry().write().unwrap_or_else(|e| e.into_inner());
    if map.insert(protocol.to_string(), ctor).is_some() {
        tracing::warn!("Filter protocol '{}' re-registered", protocol);
    }
}

pub fn create_filter(protocol: &str) -> PipelineResult<Box<dyn Filter>> {
    let map = registry().read().unwrap_or_else(|e| e.into_inner());
    map.get(protocol)
        .map(|ctor| ctor())
        .ok_or_else(|| PipelineError::UnknownProtocol(protocol.to_string()))
}

pub fn is_registered(protocol: &str) -> bool {
    registry()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .contains_key(protocol)
}

/// Registered protocol names, sorted.
pub fn registered_protocols() -> Vec<String> {
    let map = registry().read().unwrap_or_else(|e| e.into_inner());
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}
