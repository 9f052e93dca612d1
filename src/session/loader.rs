//! Reading and writing the filter graph through a [`SessionDocument`].
//!
//! Loading runs in passes. Pre-load only inspects the document and reports
//! what applying it would change. Load then creates every node, runs each
//! node's loaders once all nodes exist, and binds inputs last so a consumer
//! can refer to streams an importer only creates while loading.

use super::document::{FilterSection, InputRef, SessionDocument};
use super::id_table::IdTable;
use super::instrument::{preload_warnings, PowerSupply};
use crate::error::{Result, ScopeError};
use crate::pipeline::{registry, FilterGraph, NodeId, StreamDescriptor};

/// An instrument channel resolved to the node that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedChannel {
    pub instrument: String,
    pub index: usize,
    pub hwname: String,
    pub stream: StreamDescriptor,
}

/// Outcome of [`load_session`].
#[derive(Debug, Default)]
pub struct LoadedSession {
    pub ids: IdTable,
    /// Problems that did not stop the load.
    pub warnings: Vec<String>,
    pub channels: Vec<LoadedChannel>,
}

impl LoadedSession {
    pub fn node(&self, saved: u32) -> Option<NodeId> {
        self.ids.node(saved)
    }
}

fn label(section: &FilterSection) -> &str {
    if section.nick.is_empty() {
        &section.protocol
    } else {
        &section.nick
    }
}

/// Warnings for applying `doc`, without touching the graph.
///
/// `supplies` maps instrument nicknames to connected power supplies.
pub fn preload_session(doc: &SessionDocument, supplies: &[(&str, &dyn PowerSupply)]) -> Vec<String> {
    let mut warnings = Vec::new();

    for inst in &doc.instruments {
        let Some(saved) = &inst.power else {
            continue;
        };
        match supplies.iter().find(|(nick, _)| *nick == inst.nickname) {
            Some((_, live)) => warnings.extend(preload_warnings(&inst.nickname, *live, saved)),
            None => tracing::debug!("No live supply for '{}', skipping pre-load checks", inst.nickname),
        }
    }

    for section in &doc.filters {
        // Unknown protocols are reported by the load itself
        if let Ok(filter) = registry::create_filter(&section.protocol) {
            let name = label(section);
            warnings.extend(
                filter
                    .core()
                    .preload(&section.body)
                    .into_iter()
                    .map(|w| format!("{name}: {w}")),
            );
        }
    }
    warnings
}

/// Add every node of `doc` to `graph` and bind their inputs.
///
/// Unknown protocols, bad parameter values and dangling bindings are
/// reported as warnings. A saved ID used twice aborts the load.
pub fn load_session(doc: &SessionDocument, graph: &mut FilterGraph) -> Result<LoadedSession> {
    let mut session = LoadedSession {
        ids: IdTable::new(),
        ..Default::default()
    };

    // Create nodes
    let mut created: Vec<(&FilterSection, NodeId)> = Vec::with_capacity(doc.filters.len());
    for section in &doc.filters {
        let mut filter = match registry::create_filter(&section.protocol) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Skipping node {}: {}", section.id, e);
                session.warnings.push(format!("{}: {}", label(section), e));
                continue;
            }
        };
        if !section.nick.is_empty() {
            filter.core_mut().set_display_name(&section.nick);
        }
        filter.core_mut().channel.color = section.color;
        let node = graph.add_node(filter);
        if !session.ids.insert(section.id, node) {
            // Leave the graph as the caller handed it over
            let _ = graph.remove_node(node);
            for (_, n) in &created {
                let _ = graph.remove_node(*n);
            }
            return Err(ScopeError::Session(format!("saved id {} used more than once", section.id)));
        }
        created.push((section, node));
    }

    // Apply parameters and node-specific state
    for (section, node) in &created {
        if let Some(filter) = graph.node_mut(*node) {
            if let Err(e) = filter.core_mut().load(&section.body, &session.ids) {
                tracing::warn!("Loading '{}': {}", label(section), e);
                session.warnings.push(format!("{}: {}", label(section), e));
            }
        }
    }

    // Bind inputs
    for (section, node) in &created {
        for (slot, input) in section.inputs().into_iter().enumerate() {
            let Some(InputRef { id, stream }) = input else {
                continue;
            };
            let result = match session.ids.node(id) {
                Some(src) => graph
                    .connect(StreamDescriptor::new(src, stream), *node, slot)
                    .map_err(|e| e.to_string()),
                None => Err(format!("no node with saved id {id}")),
            };
            if let Err(e) = result {
                session
                    .warnings
                    .push(format!("{}: input {} not bound: {}", label(section), slot, e));
            }
        }
    }

    for inst in &doc.instruments {
        for ch in &inst.channels {
            match session.ids.node(ch.id) {
                Some(node) => session.channels.push(LoadedChannel {
                    instrument: inst.nickname.clone(),
                    index: ch.index,
                    hwname: ch.hwname.clone(),
                    stream: StreamDescriptor::new(node, ch.index),
                }),
                None => session.warnings.push(format!(
                    "{}: channel {} refers to missing node {}",
                    inst.nickname, ch.index, ch.id
                )),
            }
        }
    }

    tracing::info!(
        "Loaded session: {} nodes, {} warnings",
        created.len(),
        session.warnings.len()
    );
    Ok(session)
}

/// Serialize every node of `graph`.
///
/// The returned table maps live nodes to the saved IDs used in the document,
/// for callers that append instrument sections.
pub fn save_session(graph: &FilterGraph) -> (SessionDocument, IdTable) {
    let mut ids = IdTable::new();
    let nodes: Vec<NodeId> = graph.node_ids().collect();
    for &node in &nodes {
        ids.emplace(node);
    }

    let filters = nodes
        .iter()
        .filter_map(|&node| {
            let core = graph.node(node)?.core();
            Some(FilterSection {
                id: ids.saved_id(node)?,
                protocol: core.protocol().to_string(),
                nick: core.display_name().to_string(),
                color: core.color(),
                body: core.serialize(&ids),
            })
        })
        .collect();

    let doc = SessionDocument {
        filters,
        ..Default::default()
    };
    (doc, ids)
}
