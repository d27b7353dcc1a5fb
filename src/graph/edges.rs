//! Read-only relational edge store access.
//!
//! The edge store yields `(srcId, dstId)` tuples filterable by
//! `srcId % num_workers = logical_id`; multiple rows per `srcId` form the
//! adjacency list, in row order, duplicates preserved.

use std::collections::BTreeMap;

use crate::graph::{VertexId, WorkerId};
use crate::utils::SteppeError;

use futures::TryStreamExt;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;

/// Handle to an opened edge store database file.
pub struct EdgeStore {
    /// Connection pool over the backing SQLite file.
    pool: SqlitePool,
}

impl EdgeStore {
    /// Opens the edge store file read-only. Erroring here fails the query
    /// for this worker.
    pub async fn open(path: &str) -> Result<Self, SteppeError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .immutable(false);
        let pool = SqlitePool::connect_with(options).await?;
        Ok(EdgeStore { pool })
    }

    /// Streams this worker's partition of the edge table and materializes
    /// the adjacency lists, keyed by source vertex.
    pub async fn load_partition(
        &self,
        table: &str,
        num_workers: u8,
        logical_id: WorkerId,
    ) -> Result<BTreeMap<VertexId, Vec<VertexId>>, SteppeError> {
        // table names cannot be bound as parameters; restrict to identifier
        // characters before interpolating
        if table.is_empty()
            || !table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return logged_err!(logical_id; "invalid table name '{}'", table);
        }

        let sql = format!(
            "SELECT srcId, dstId FROM {} WHERE srcId % ?1 = ?2 \
             ORDER BY rowid",
            table
        );
        let mut rows = sqlx::query(&sql)
            .bind(num_workers as i64)
            .bind(logical_id as i64)
            .fetch(&self.pool);

        let mut adjacency: BTreeMap<VertexId, Vec<VertexId>> = BTreeMap::new();
        while let Some(row) = rows.try_next().await? {
            let src: i64 = row.try_get(0)?;
            let dst: i64 = row.try_get(1)?;
            adjacency
                .entry(src as VertexId)
                .or_default()
                .push(dst as VertexId);
        }

        Ok(adjacency)
    }

    /// Closes the pool.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod edges_tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;

    /// Builds a fresh edge table at `path` holding the given edges.
    pub(crate) async fn make_edge_db(
        path: &str,
        table: &str,
        edges: &[(u64, u64)],
    ) -> Result<(), SteppeError> {
        let _ = tokio::fs::remove_file(path).await;
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        sqlx::query(&format!(
            "CREATE TABLE {} (srcId INTEGER NOT NULL, dstId INTEGER NOT NULL)",
            table
        ))
        .execute(&pool)
        .await?;
        for &(src, dst) in edges {
            sqlx::query(&format!("INSERT INTO {} VALUES (?1, ?2)", table))
                .bind(src as i64)
                .bind(dst as i64)
                .execute(&pool)
                .await?;
        }
        pool.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn load_partitions() -> Result<(), SteppeError> {
        let path = "/tmp/steppe-test-edges-0.db";
        make_edge_db(
            path,
            "graph",
            &[(1, 2), (2, 3), (2, 4), (4, 1), (2, 3)],
        )
        .await?;

        let store = EdgeStore::open(path).await?;
        let part0 = store.load_partition("graph", 2, 0).await?;
        let part1 = store.load_partition("graph", 2, 1).await?;
        store.close().await;

        assert_eq!(part0.len(), 2);
        // duplicates and row order preserved
        assert_eq!(part0[&2], vec![3, 4, 3]);
        assert_eq!(part0[&4], vec![1]);
        assert_eq!(part1.len(), 1);
        assert_eq!(part1[&1], vec![2]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reject_bad_table_name() -> Result<(), SteppeError> {
        let path = "/tmp/steppe-test-edges-1.db";
        make_edge_db(path, "graph", &[(1, 2)]).await?;

        let store = EdgeStore::open(path).await?;
        assert!(store
            .load_partition("graph; DROP TABLE graph", 1, 0)
            .await
            .is_err());
        store.close().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn open_missing_file() {
        assert!(EdgeStore::open("/tmp/steppe-no-such-edges.db")
            .await
            .is_err());
    }
}
