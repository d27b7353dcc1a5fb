//! Graph computation data model shared by the coordinator, workers, and
//! clients.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use crate::utils::SteppeError;

use serde::{Deserialize, Serialize};

mod edges;
mod program;

pub use edges::EdgeStore;
pub use program::{compute, ComputeCtx, DAMPING};

/// Vertex ID type.
pub type VertexId = u64;

/// Worker ID type; used for both configured and per-query logical ids.
pub type WorkerId = u8;

/// Superstep number type.
pub type SuperStepId = u64;

/// Distance value representing "unreachable".
pub const INFINITE_DIST: u64 = u64::MAX;

/// Tagged message/vertex value payload, type-checked at deserialization
/// boundaries.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub enum Value {
    /// PageRank rank (or partial rank contribution).
    Rank(f64),

    /// Shortest-path tentative distance in hops.
    Dist(u64),
}

impl Value {
    /// Extracts a rank, erroring on a mistyped payload.
    pub fn as_rank(&self) -> Result<f64, SteppeError> {
        match self {
            Value::Rank(r) => Ok(*r),
            Value::Dist(d) => {
                Err(SteppeError(format!("expected Rank, got Dist({})", d)))
            }
        }
    }

    /// Extracts a distance, erroring on a mistyped payload.
    pub fn as_dist(&self) -> Result<u64, SteppeError> {
        match self {
            Value::Dist(d) => Ok(*d),
            Value::Rank(r) => {
                Err(SteppeError(format!("expected Dist, got Rank({})", r)))
            }
        }
    }
}

/// A vertex-to-vertex message delivered at superstep `step`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct VertexMsg {
    /// Target superstep number.
    pub step: SuperStepId,

    /// Sending vertex.
    pub src: VertexId,

    /// Receiving vertex.
    pub dst: VertexId,

    /// Message payload.
    pub value: Value,
}

/// A vertex and its per-query state. A vertex lives on exactly one worker,
/// determined by `id % num_workers`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Vertex {
    /// Vertex ID.
    pub id: VertexId,

    /// Outgoing neighbors in edge-store order; duplicates preserved.
    pub neighbors: Vec<VertexId>,

    /// Current query-specific value.
    pub value: Value,

    /// Has this vertex voted to halt? Reset to true by message arrival.
    pub active: bool,

    /// Messages delivered for the superstep being computed; drained into
    /// the compute call at the start of each superstep.
    pub inbox: Vec<VertexMsg>,
}

/// Per-vertex slice of a checkpoint.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct VertexCheckpoint {
    /// Vertex value at snapshot time.
    pub value: Value,

    /// Messages buffered for the superstep after the checkpointed one.
    pub inbox: Vec<VertexMsg>,

    /// Activity flag at snapshot time.
    pub active: bool,
}

/// Complete snapshot of every local vertex; partial snapshots never exist.
pub type CheckpointState = HashMap<VertexId, VertexCheckpoint>;

/// Enum of supported query types.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum QueryType {
    PageRank,
    ShortestPath,
}

impl QueryType {
    /// Parse command line string into a QueryType.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "PageRank" => Some(Self::PageRank),
            "ShortestPath" => Some(Self::ShortestPath),
            _ => None,
        }
    }
}

/// A client query over a named graph table.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Client-chosen name, echoed in the result.
    pub client: String,

    /// Type of computation to run.
    pub query_type: QueryType,

    /// Named vertices: 1 seed for PageRank; [source, destination] for
    /// ShortestPath.
    pub nodes: Vec<VertexId>,

    /// Path of the edge-store database file.
    pub graph: String,

    /// Edge table name within the store.
    pub table: String,
}

impl Query {
    /// Checks the node list against the query type.
    pub fn sanitize(&self) -> Result<(), SteppeError> {
        match self.query_type {
            QueryType::PageRank if self.nodes.len() == 1 => Ok(()),
            QueryType::ShortestPath if self.nodes.len() == 2 => Ok(()),
            _ => Err(SteppeError(format!(
                "invalid node count {} for {:?}",
                self.nodes.len(),
                self.query_type
            ))),
        }
    }

    /// The SSSP source, or the PageRank seed.
    pub fn source(&self) -> VertexId {
        self.nodes[0]
    }

    /// The vertex whose final value answers the query.
    pub fn result_vertex(&self) -> VertexId {
        match self.query_type {
            QueryType::PageRank => self.nodes[0],
            QueryType::ShortestPath => self.nodes[1],
        }
    }
}

/// Result returned to the client. `result == None` with no error means the
/// SSSP destination is unreachable.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// The query this result answers.
    pub query: Query,

    /// Final value of the result vertex, if any.
    pub result: Option<Value>,

    /// Failure description; `None` on success.
    pub error: Option<String>,
}

/// Information about a worker node, as reported at join time.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerNode {
    /// The worker's configured id (stable across restarts).
    pub config_id: WorkerId,

    /// Peer-to-peer message listening address.
    pub p2p_addr: SocketAddr,

    /// Failure detector ack responder address.
    pub fcheck_addr: SocketAddr,
}

/// Immutable per-query map from logical worker id (0..N-1) to node info.
pub type WorkerDirectory = BTreeMap<WorkerId, WorkerNode>;

/// The worker responsible for a vertex under a given fleet size.
#[inline]
pub fn home_worker(vertex: VertexId, num_workers: u8) -> WorkerId {
    (vertex % num_workers as u64) as WorkerId
}

#[cfg(test)]
mod graph_tests {
    use super::*;

    #[test]
    fn parse_valid_names() {
        assert_eq!(
            QueryType::parse_name("PageRank"),
            Some(QueryType::PageRank)
        );
        assert_eq!(
            QueryType::parse_name("ShortestPath"),
            Some(QueryType::ShortestPath)
        );
    }

    #[test]
    fn parse_invalid_name() {
        assert_eq!(QueryType::parse_name("InvalidQuery"), None);
    }

    #[test]
    fn value_accessors() {
        assert_eq!(Value::Rank(0.25).as_rank(), Ok(0.25));
        assert_eq!(Value::Dist(7).as_dist(), Ok(7));
        assert!(Value::Rank(0.25).as_dist().is_err());
        assert!(Value::Dist(7).as_rank().is_err());
    }

    #[test]
    fn query_sanitize() {
        let mut query = Query {
            client: "tester".into(),
            query_type: QueryType::ShortestPath,
            nodes: vec![1, 3],
            graph: "/tmp/graph.db".into(),
            table: "graph".into(),
        };
        assert!(query.sanitize().is_ok());
        assert_eq!(query.source(), 1);
        assert_eq!(query.result_vertex(), 3);

        query.query_type = QueryType::PageRank;
        assert!(query.sanitize().is_err());
        query.nodes = vec![1];
        assert!(query.sanitize().is_ok());
        assert_eq!(query.result_vertex(), 1);
    }

    #[test]
    fn vertex_homes() {
        assert_eq!(home_worker(4, 2), 0);
        assert_eq!(home_worker(7, 2), 1);
        assert_eq!(home_worker(7, 3), 1);
        assert_eq!(home_worker(0, 1), 0);
    }
}
