/// Compiled refresh schedule for a filter graph.
/// Every live node appears in `order`; nodes not fed by any source are
/// scheduled too so they can report their missing inputs.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    /// Live node indices in topological order
    pub order: Vec<usize>,

    /// Pre-computed edge routing (producer_idx, consumer_idx)
    pub edges: Vec<(usize, usize)>,

    /// Cache invalidation generation number
    pub generation: u64,

    /// Compilation statistics
    pub stats: PlanStats,

    /// Nodes with no path from any source
    pub starved_nodes: Vec<usize>,

    /// Set when the graph is not a DAG; `order` is then partial
    pub has_cycle: bool,
}

/// Statistics about the compiled plan
#[derive(Debug, Clone, Default)]
pub struct PlanStats {
    /// Number of live nodes in the graph
    pub total_nodes: usize,

    /// Number of nodes in the schedule
    pub scheduled_nodes: usize,

    /// Number of nodes reachable from a source
    pub fed_nodes: usize,

    /// Number of source nodes (no input slots)
    pub source_nodes: usize,

    /// Number of sink nodes (no consumers)
    pub sink_nodes: usize,

    /// Compilation time in microseconds
    pub compile_time_us: u64,
}

impl CompiledPlan {
    /// Create a new empty compiled plan
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            edges: Vec::new(),
            generation: 0,
            stats: PlanStats::default(),
            starved_nodes: Vec::new(),
            has_cycle: false,
        }
    }

    /// Check if the plan has any scheduled nodes
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Consumers of `idx`, in edge order.
    pub fn consumers(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges
            .iter()
            .filter(move |(from, _)| *from == idx)
            .map(|&(_, to)| to)
    }
}

impl Default for CompiledPlan {
    fn default() -> Self {
        Self::new()
    }
}
