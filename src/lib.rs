//! Public interface to the Steppe core library, linked by the coordinator,
//! worker, and client executables.

#[macro_use]
pub mod utils;

pub mod client;
pub mod coord;
pub mod fcheck;
pub mod graph;
pub mod worker;

pub use crate::client::QueryStub;
pub use crate::coord::{CoordConfig, Coordinator};
pub use crate::graph::{
    Query, QueryResult, QueryType, SuperStepId, Value, VertexId, WorkerId,
    WorkerNode,
};
pub use crate::utils::SteppeError;
pub use crate::worker::{GraphWorker, WorkerConfig};

// End-to-end scenarios running a coordinator and workers in-process.
#[cfg(test)]
mod scenarios {
    use std::path::PathBuf;

    use crate::{
        Coordinator, GraphWorker, Query, QueryResult, QueryStub, QueryType,
        SteppeError, Value, VertexId, WorkerConfig, WorkerId,
    };

    use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};

    use tokio::sync::watch;
    use tokio::task::JoinHandle;
    use tokio::time::{self, Duration};

    /// Builds a fresh edge table at `path` holding the given edges.
    async fn make_edge_db(
        path: &str,
        edges: &[(u64, u64)],
    ) -> Result<(), SteppeError> {
        let _ = tokio::fs::remove_file(path).await;
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::query(
            "CREATE TABLE graph (srcId INTEGER NOT NULL, dstId INTEGER NOT NULL)",
        )
        .execute(&pool)
        .await?;
        for &(src, dst) in edges {
            sqlx::query("INSERT INTO graph VALUES (?1, ?2)")
                .bind(src as i64)
                .bind(dst as i64)
                .execute(&pool)
                .await?;
        }
        pool.close().await;
        Ok(())
    }

    /// Spawns a coordinator task on the given ports.
    async fn spawn_coord(
        worker_port: u16,
        client_port: u16,
        config_str: &'static str,
    ) -> Result<watch::Sender<bool>, SteppeError> {
        let mut coord = Coordinator::new_and_setup(
            format!("127.0.0.1:{}", worker_port).parse()?,
            format!("127.0.0.1:{}", client_port).parse()?,
            if config_str.is_empty() {
                None
            } else {
                Some(config_str)
            },
        )
        .await?;
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move { coord.run(rx_term).await });
        Ok(tx_term)
    }

    /// A handle to one in-process worker "process".
    struct WorkerProc {
        tx_kill: watch::Sender<bool>,
    }

    impl WorkerProc {
        /// Simulates a worker process crash: every task it owns stops, its
        /// sockets close, and its heartbeats go unanswered.
        fn kill(&self) {
            let _ = self.tx_kill.send(true);
        }
    }

    /// Spawns a worker task with the given identity and ports.
    async fn spawn_worker(
        id: WorkerId,
        coord_port: u16,
        p2p_port: u16,
        fcheck_port: u16,
        checkpoint_path: &str,
    ) -> Result<WorkerProc, SteppeError> {
        let config = WorkerConfig {
            id,
            coord_addr: format!("127.0.0.1:{}", coord_port).parse()?,
            p2p_addr: format!("127.0.0.1:{}", p2p_port).parse()?,
            fcheck_addr: format!("127.0.0.1:{}", fcheck_port).parse()?,
            checkpoint_path: PathBuf::from(checkpoint_path),
        };
        let mut worker = GraphWorker::new_and_setup(config).await?;
        let (tx_kill, mut rx_kill) = watch::channel(false);
        tokio::spawn(async move {
            tokio::select! {
                _ = worker.run() => {},
                _ = rx_kill.changed() => {
                    worker.shutdown();
                },
            }
        });
        Ok(WorkerProc { tx_kill })
    }

    /// Removes a worker's checkpoint database (and its WAL siblings).
    async fn wipe_checkpoints(path: &str) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = tokio::fs::remove_file(format!("{}{}", path, suffix)).await;
        }
    }

    /// Runs a query through a fresh client stub.
    async fn run_query(
        client_port: u16,
        query: Query,
    ) -> Result<QueryResult, SteppeError> {
        let mut stub = QueryStub::new_by_connect(
            format!("127.0.0.1:{}", client_port).parse()?,
        )
        .await?;
        let result = stub.query(query).await?;
        stub.leave().await?;
        Ok(result)
    }

    fn sssp_query(graph: &str, src: VertexId, dst: VertexId) -> Query {
        Query {
            client: "scenario".into(),
            query_type: QueryType::ShortestPath,
            nodes: vec![src, dst],
            graph: graph.into(),
            table: "graph".into(),
        }
    }

    fn pagerank_query(graph: &str, seed: VertexId) -> Query {
        Query {
            client: "scenario".into(),
            query_type: QueryType::PageRank,
            nodes: vec![seed],
            graph: graph.into(),
            table: "graph".into(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn trivial_sssp() -> Result<(), SteppeError> {
        let graph = "/tmp/steppe-e2e-sssp0.db";
        make_edge_db(graph, &[(1, 2), (2, 3)]).await?;
        wipe_checkpoints("/tmp/steppe-e2e-sssp0-ckpt0.db").await;

        let _coord = spawn_coord(31900, 31901, "").await?;
        let _worker = spawn_worker(
            0,
            31900,
            31902,
            31903,
            "/tmp/steppe-e2e-sssp0-ckpt0.db",
        )
        .await?;

        let result = run_query(31901, sssp_query(graph, 1, 3)).await?;
        assert_eq!(result.error, None);
        assert_eq!(result.result, Some(Value::Dist(2)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unreachable_sssp() -> Result<(), SteppeError> {
        let graph = "/tmp/steppe-e2e-sssp1.db";
        make_edge_db(graph, &[(1, 2), (3, 4)]).await?;
        wipe_checkpoints("/tmp/steppe-e2e-sssp1-ckpt0.db").await;

        let _coord = spawn_coord(31910, 31911, "").await?;
        let _worker = spawn_worker(
            0,
            31910,
            31912,
            31913,
            "/tmp/steppe-e2e-sssp1-ckpt0.db",
        )
        .await?;

        let result = run_query(31911, sssp_query(graph, 1, 4)).await?;
        assert_eq!(result.error, None);
        assert_eq!(result.result, None); // destination unreachable
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 6)]
    async fn partitioned_pagerank() -> Result<(), SteppeError> {
        let graph = "/tmp/steppe-e2e-pr0.db";
        make_edge_db(graph, &[(1, 2), (2, 3), (3, 4), (4, 1)]).await?;
        wipe_checkpoints("/tmp/steppe-e2e-pr0-ckpt0.db").await;
        wipe_checkpoints("/tmp/steppe-e2e-pr0-ckpt1.db").await;

        let _coord = spawn_coord(
            31920,
            31921,
            "max_steps = 20\nsteps_between_checkpoints = 5",
        )
        .await?;
        let _worker0 = spawn_worker(
            0,
            31920,
            31922,
            31924,
            "/tmp/steppe-e2e-pr0-ckpt0.db",
        )
        .await?;
        let _worker1 = spawn_worker(
            1,
            31920,
            31923,
            31925,
            "/tmp/steppe-e2e-pr0-ckpt1.db",
        )
        .await?;

        let result = run_query(31921, pagerank_query(graph, 1)).await?;
        assert_eq!(result.error, None);
        // all four vertices of the cycle converge to rank 1/4
        let rank = result.result.unwrap().as_rank()?;
        assert!((rank - 0.25).abs() < 1e-4, "rank {} off 0.25", rank);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 6)]
    async fn fail_restart_pagerank() -> Result<(), SteppeError> {
        let graph = "/tmp/steppe-e2e-pr1.db";
        make_edge_db(graph, &[(1, 2), (2, 3), (3, 4), (4, 1)]).await?;
        let ckpt0 = "/tmp/steppe-e2e-pr1-ckpt0.db";
        let ckpt1 = "/tmp/steppe-e2e-pr1-ckpt1.db";
        wipe_checkpoints(ckpt0).await;
        wipe_checkpoints(ckpt1).await;

        // a long fixed-step run so the failure lands mid-query, well past the
        // first global checkpoint
        let _coord = spawn_coord(
            31930,
            31931,
            "max_steps = 2000\nsteps_between_checkpoints = 5\n\
             lost_msgs_thresh = 3\nheartbeat_interval_ms = 50",
        )
        .await?;
        let _worker0 = spawn_worker(0, 31930, 31932, 31934, ckpt0).await?;
        let worker1 = spawn_worker(1, 31930, 31933, 31935, ckpt1).await?;

        let query_handle: JoinHandle<Result<QueryResult, SteppeError>> =
            tokio::spawn(run_query(31931, pagerank_query(graph, 1)));

        // wait for the first checkpoint to land durably, then lose worker 1
        // mid-query
        wait_for_checkpoint(ckpt1).await;
        time::sleep(Duration::from_millis(150)).await;
        assert!(!query_handle.is_finished());
        worker1.kill();

        // a replacement process for worker 1 shows up a while later; the fleet
        // must roll back to the last global checkpoint and replay to the end
        time::sleep(Duration::from_millis(1200)).await;
        let _worker1b = spawn_worker(1, 31930, 31933, 31935, ckpt1).await?;

        let result = time::timeout(Duration::from_secs(60), query_handle)
            .await
            .expect("query should finish after recovery")??;
        assert_eq!(result.error, None);
        let rank = result.result.unwrap().as_rank()?;
        assert!((rank - 0.25).abs() < 1e-4, "rank {} off 0.25", rank);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn query_blocks_until_worker_joins() -> Result<(), SteppeError> {
        let graph = "/tmp/steppe-e2e-sssp2.db";
        make_edge_db(graph, &[(1, 2), (2, 3)]).await?;
        wipe_checkpoints("/tmp/steppe-e2e-sssp2-ckpt0.db").await;

        let _coord = spawn_coord(31940, 31941, "").await?;

        // the query is issued before any worker has joined; it must block
        let query_handle: JoinHandle<Result<QueryResult, SteppeError>> =
            tokio::spawn(run_query(31941, sssp_query(graph, 1, 3)));
        time::sleep(Duration::from_millis(400)).await;
        assert!(!query_handle.is_finished());

        // the first worker joining unparks the query
        let _worker = spawn_worker(
            0,
            31940,
            31942,
            31943,
            "/tmp/steppe-e2e-sssp2-ckpt0.db",
        )
        .await?;

        let result = time::timeout(Duration::from_secs(30), query_handle)
            .await
            .expect("query should finish once a worker joins")??;
        assert_eq!(result.error, None);
        assert_eq!(result.result, Some(Value::Dist(2)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 6)]
    async fn checkpoint_missing_fails_query() -> Result<(), SteppeError> {
        let graph = "/tmp/steppe-e2e-pr2.db";
        make_edge_db(graph, &[(1, 2), (2, 3), (3, 4), (4, 1)]).await?;
        let ckpt0 = "/tmp/steppe-e2e-pr2-ckpt0.db";
        let ckpt1 = "/tmp/steppe-e2e-pr2-ckpt1.db";
        wipe_checkpoints(ckpt0).await;
        wipe_checkpoints(ckpt1).await;

        let _coord = spawn_coord(
            31950,
            31951,
            "max_steps = 2000\nsteps_between_checkpoints = 5\n\
             lost_msgs_thresh = 3\nheartbeat_interval_ms = 50",
        )
        .await?;
        let _worker0 = spawn_worker(0, 31950, 31952, 31954, ckpt0).await?;
        let worker1 = spawn_worker(1, 31950, 31953, 31955, ckpt1).await?;

        let query_handle: JoinHandle<Result<QueryResult, SteppeError>> =
            tokio::spawn(run_query(31951, pagerank_query(graph, 1)));

        wait_for_checkpoint(ckpt1).await;
        time::sleep(Duration::from_millis(150)).await;
        assert!(!query_handle.is_finished());
        worker1.kill();
        time::sleep(Duration::from_millis(600)).await;

        // the replacement lost its durable state; rollback cannot proceed and
        // the query must fail with a checkpoint-missing error
        wipe_checkpoints(ckpt1).await;
        let _worker1b = spawn_worker(1, 31950, 31953, 31955, ckpt1).await?;

        let result = time::timeout(Duration::from_secs(60), query_handle)
            .await
            .expect("query should fail after recovery attempt")??;
        assert!(result.result.is_none());
        let error = result.error.expect("query should carry an error");
        assert!(
            error.contains("checkpoint missing"),
            "unexpected error: {}",
            error
        );
        Ok(())
    }

    /// Counts rows in a worker's checkpoint table; 0 if the database does not
    /// exist yet.
    async fn checkpoint_rows(path: &str) -> i64 {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let Ok(pool) = SqlitePool::connect_with(options).await else {
            return 0;
        };
        let rows = sqlx::query_as("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(&pool)
            .await
            .map(|row: (i64,)| row.0)
            .unwrap_or(0);
        pool.close().await;
        rows
    }

    /// Polls until a worker's checkpoint database holds at least one snapshot.
    async fn wait_for_checkpoint(path: &str) {
        for _ in 0..1000 {
            if checkpoint_rows(path).await > 0 {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no checkpoint appeared at {}", path);
    }
}
