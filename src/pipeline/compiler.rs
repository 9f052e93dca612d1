use super::compiled_plan::{CompiledPlan, PlanStats};
use super::node::NodeSlot;
use std::collections::VecDeque;

/// Compiles a filter graph into a refresh schedule
pub struct GraphCompiler;

impl GraphCompiler {
    /// Compile the graph into a topologically ordered schedule.
    ///
    /// Edges are derived from each node's bound input slots. Reachability from
    /// the source nodes is computed for diagnostics only; every live node is
    /// scheduled.
    ///
    /// # Arguments
    /// * `nodes` - Node slots, `None` for removed nodes
    /// * `generation` - Generation counter for cache invalidation
    pub fn compile(nodes: &[Option<NodeSlot>], generation: u64) -> CompiledPlan {
        let start_time = std::time::Instant::now();

        let n = nodes.len();
        let live: Vec<bool> = nodes.iter().map(Option::is_some).collect();
        let total_nodes = live.iter().filter(|&&l| l).count();
        if total_nodes == 0 {
            return CompiledPlan {
                generation,
                ..CompiledPlan::new()
            };
        }

        let edges = Self::collect_edges(nodes);
        let (fwd_adj, bwd_adj) = Self::build_adjacency(&edges, n);

        let sources: Vec<usize> = (0..n)
            .filter(|&i| {
                nodes[i]
                    .as_ref()
                    .is_some_and(|slot| slot.filter.core().inputs.is_empty())
            })
            .collect();
        let sinks: Vec<usize> = (0..n).filter(|&i| live[i] && fwd_adj[i].is_empty()).collect();

        let fed = Self::forward_reachability(&sources, &fwd_adj, n);
        let starved_nodes: Vec<usize> = (0..n).filter(|&i| live[i] && !fed[i]).collect();

        let order = Self::topological_sort(&live, &fwd_adj, &bwd_adj);
        let has_cycle = order.len() < total_nodes;

        let stats = PlanStats {
            total_nodes,
            scheduled_nodes: order.len(),
            fed_nodes: total_nodes - starved_nodes.len(),
            source_nodes: sources.len(),
            sink_nodes: sinks.len(),
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        CompiledPlan {
            order,
            edges,
            generation,
            stats,
            starved_nodes,
            has_cycle,
        }
    }

    /// (producer, consumer) for every bound input whose producer is live.
    fn collect_edges(nodes: &[Option<NodeSlot>]) -> Vec<(usize, usize)> {
        let mut edges = Vec::new();
        for (to, slot) in nodes.iter().enumerate() {
            let Some(slot) = slot else { continue };
            for input in &slot.filter.core().inputs {
                let Some(d) = input.descriptor else { continue };
                let from = d.node.index();
                if nodes.get(from).is_some_and(Option::is_some) && !edges.contains(&(from, to)) {
                    edges.push((from, to));
                }
            }
        }
        edges
    }

    /// Build forward and backward adjacency lists
    fn build_adjacency(edges: &[(usize, usize)], n: usize) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
        let mut fwd_adj = vec![Vec::new(); n];
        let mut bwd_adj = vec![Vec::new(); n];
        for &(from, to) in edges {
            fwd_adj[from].push(to);
            bwd_adj[to].push(from);
        }
        (fwd_adj, bwd_adj)
    }

    /// Forward reachability from sources using DFS
    fn forward_reachability(sources: &[usize], fwd_adj: &[Vec<usize>], n: usize) -> Vec<bool> {
        let mut reachable = vec![false; n];
        let mut stack = Vec::new();

        for &src in sources {
            reachable[src] = true;
            stack.push(src);
        }

        while let Some(node) = stack.pop() {
            for &neighbor in &fwd_adj[node] {
                if !reachable[neighbor] {
                    reachable[neighbor] = true;
                    stack.push(neighbor);
                }
            }
        }

        reachable
    }

    /// Topological sort of live nodes using Kahn's algorithm
    fn topological_sort(live: &[bool], fwd_adj: &[Vec<usize>], bwd_adj: &[Vec<usize>]) -> Vec<usize> {
        let n = live.len();
        let mut in_degree: Vec<usize> = bwd_adj.iter().map(Vec::len).collect();

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| live[i] && in_degree[i] == 0).collect();
        let mut result = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            result.push(node);
            for &neighbor in &fwd_adj[node] {
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    queue.push_back(neighbor);
                }
            }
        }

        result
    }
}
