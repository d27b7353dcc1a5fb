//! Steppe client CLI executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use env_logger::Env;

use steppe::{
    pf_error, Query, QueryStub, QueryType, SteppeError, Value, VertexId,
};

use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Coordinator's client-facing API address.
    #[arg(short, long, default_value = "127.0.0.1:52700")]
    coord_addr: SocketAddr,

    /// Name of query type to run.
    #[arg(short, long, default_value_t = String::from("ShortestPath"))]
    query: String,

    /// Named vertices: 1 seed for PageRank, or source and destination for
    /// ShortestPath. Example: '-n 1 -n 3'.
    #[arg(short, long)]
    nodes: Vec<VertexId>,

    /// Path of the edge-store database file.
    #[arg(short, long)]
    graph: String,

    /// Edge table name within the store.
    #[arg(short, long, default_value_t = String::from("graph"))]
    table: String,

    /// Client name echoed in the result.
    #[arg(long, default_value_t = String::from("cli"))]
    name: String,
}

impl CliArgs {
    /// Sanitize command line arguments into a `Query`.
    fn sanitize(&self) -> Result<Query, SteppeError> {
        let query_type =
            QueryType::parse_name(&self.query).ok_or_else(|| {
                SteppeError(format!(
                    "query type name '{}' unrecognized",
                    self.query
                ))
            })?;
        let query = Query {
            client: self.name.clone(),
            query_type,
            nodes: self.nodes.clone(),
            graph: self.graph.clone(),
            table: self.table.clone(),
        };
        query.sanitize()?;
        Ok(query)
    }
}

// Client executable main entrance.
fn client_main() -> Result<(), SteppeError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let query = args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()?;

    // enter tokio runtime, send the query, and block until its result
    runtime.block_on(async move {
        let mut stub = QueryStub::new_by_connect(args.coord_addr).await?;
        let result = stub.query(query).await?;
        stub.leave().await?;

        if let Some(error) = result.error {
            return Err(SteppeError(format!("query failed: {}", error)));
        }
        match (result.query.query_type, result.result) {
            (QueryType::PageRank, Some(Value::Rank(rank))) => {
                println!(
                    "PageRank of vertex {}: {:.6}",
                    result.query.nodes[0], rank
                );
            }
            (QueryType::ShortestPath, Some(Value::Dist(dist))) => {
                println!(
                    "Shortest path {} -> {}: {}",
                    result.query.nodes[0], result.query.nodes[1], dist
                );
            }
            (QueryType::ShortestPath, None) => {
                println!(
                    "Shortest path {} -> {}: unreachable",
                    result.query.nodes[0], result.query.nodes[1]
                );
            }
            (_, result) => {
                return Err(SteppeError(format!(
                    "unexpected result payload: {:?}",
                    result
                )));
            }
        }
        Ok::<(), SteppeError>(())
    })?;

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .init();

    if let Err(e) = client_main() {
        pf_error!("x"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod client_args_tests {
    use super::*;

    fn base_args() -> CliArgs {
        CliArgs {
            coord_addr: "127.0.0.1:52700".parse().unwrap(),
            query: "ShortestPath".into(),
            nodes: vec![1, 3],
            graph: "/tmp/graph.db".into(),
            table: "graph".into(),
            name: "cli".into(),
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), SteppeError> {
        let query = base_args().sanitize()?;
        assert_eq!(query.query_type, QueryType::ShortestPath);
        assert_eq!(query.nodes, vec![1, 3]);
        Ok(())
    }

    #[test]
    fn sanitize_invalid_query_name() {
        let mut args = base_args();
        args.query = "Dijkstra".into();
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_wrong_node_count() {
        let mut args = base_args();
        args.query = "PageRank".into();
        assert!(args.sanitize().is_err());
    }
}
