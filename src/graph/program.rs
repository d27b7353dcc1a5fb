//! Vertex programs: the per-vertex compute functions behind the supported
//! query types. A compute call is a pure function of the vertex, its
//! inbound messages, and the superstep context; it never sees remote state
//! and never blocks.

use crate::graph::{
    Query, QueryType, SuperStepId, Value, Vertex, VertexId, VertexMsg,
};

/// PageRank damping factor.
pub const DAMPING: f64 = 0.85;

/// Read-only context handed to every compute call.
#[derive(Debug, Clone, Copy)]
pub struct ComputeCtx<'a> {
    /// Superstep being computed.
    pub step: SuperStepId,

    /// The running query.
    pub query: &'a Query,

    /// Global vertex count at load time.
    pub total_vertices: u64,
}

/// Runs one superstep of the query's vertex program on `vertex`, consuming
/// `inbound`. Updates the vertex's value and activity flag in place and
/// returns the outbound `(destination, payload)` pairs.
pub fn compute(
    vertex: &mut Vertex,
    inbound: &[VertexMsg],
    ctx: &ComputeCtx,
) -> Vec<(VertexId, Value)> {
    match ctx.query.query_type {
        QueryType::PageRank => compute_page_rank(vertex, inbound, ctx),
        QueryType::ShortestPath => compute_shortest_path(vertex, inbound, ctx),
    }
}

/// PageRank step: `value' = (1-d)/|V| + d * sum(inbound)`, then ship
/// `value'/outdeg` to every neighbor. Vertices stay active; termination is
/// the coordinator's call (fixed step count or convergence threshold).
fn compute_page_rank(
    vertex: &mut Vertex,
    inbound: &[VertexMsg],
    ctx: &ComputeCtx,
) -> Vec<(VertexId, Value)> {
    if ctx.step == 0 {
        // the fleet-wide vertex count is only known at step 0; seed 1/|V|
        // and ship it as-is
        vertex.value = Value::Rank(1.0 / ctx.total_vertices as f64);
    } else {
        let sum: f64 = inbound
            .iter()
            .map(|m| m.value.as_rank().unwrap_or(0.0))
            .sum();
        vertex.value = Value::Rank(
            (1.0 - DAMPING) / ctx.total_vertices as f64 + DAMPING * sum,
        );
    }
    vertex.active = true;

    let rank = vertex.value.as_rank().unwrap_or(0.0);
    if vertex.neighbors.is_empty() {
        return vec![];
    }
    let share = rank / vertex.neighbors.len() as f64;
    vertex
        .neighbors
        .iter()
        .map(|&n| (n, Value::Rank(share)))
        .collect()
}

/// SSSP step: relax the tentative distance with the inbound minimum; on
/// improvement, propagate `value + 1` to every neighbor. The vertex votes
/// to halt afterward and is re-invoked by message arrival. The seeded
/// source (distance 0, active) kicks the computation off at step 0.
fn compute_shortest_path(
    vertex: &mut Vertex,
    inbound: &[VertexMsg],
    ctx: &ComputeCtx,
) -> Vec<(VertexId, Value)> {
    let current = vertex.value.as_dist().unwrap_or(u64::MAX);
    let best = inbound
        .iter()
        .filter_map(|m| m.value.as_dist().ok())
        .min();

    let mut out = vec![];
    match best {
        Some(tentative) if tentative < current => {
            vertex.value = Value::Dist(tentative);
            out = vertex
                .neighbors
                .iter()
                .map(|&n| (n, Value::Dist(tentative + 1)))
                .collect();
        }
        _ => {
            if ctx.step == 0 && vertex.active && current == 0 {
                // seeded source announces distance 1 to its neighbors
                out = vertex
                    .neighbors
                    .iter()
                    .map(|&n| (n, Value::Dist(1)))
                    .collect();
            }
        }
    }

    vertex.active = false; // vote to halt until new mail arrives
    out
}
