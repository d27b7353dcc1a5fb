//! Worker durable checkpoint storage module.
//!
//! Snapshots are keyed by superstep number in a single-file embedded
//! database private to this worker process. A successful save ack means the
//! bytes are recoverable after a crash.

use std::path::Path;

use crate::graph::{CheckpointState, SuperStepId, WorkerId};
use crate::utils::SteppeError;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous,
};
use sqlx::Row;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Action command to the checkpoint saver.
#[derive(Debug)]
pub(crate) enum CheckpointAction {
    /// Durably store a snapshot under the given superstep number.
    Save {
        step: SuperStepId,
        state: CheckpointState,
    },

    /// Read the snapshot stored under the given superstep number.
    Load { step: SuperStepId },
}

/// Action result returned by the checkpoint saver.
#[derive(Debug)]
pub(crate) enum CheckpointResult {
    /// Snapshot is durable.
    Save { step: SuperStepId },

    /// `state` is `None` if no snapshot exists for the step.
    Load {
        step: SuperStepId,
        state: Option<CheckpointState>,
    },
}

/// Durable checkpoint storage module.
pub(crate) struct CheckpointHub {
    /// My worker ID.
    me: WorkerId,

    /// Sender side of the action channel.
    tx_action: mpsc::UnboundedSender<CheckpointAction>,

    /// Receiver side of the ack channel.
    rx_ack: mpsc::UnboundedReceiver<CheckpointResult>,

    /// Join handle of the saver task.
    saver_handle: JoinHandle<()>,
}

// CheckpointHub public API implementation
impl CheckpointHub {
    /// Creates a new durable checkpoint hub backed by the database file at
    /// `path` (created if missing). Spawns the saver task and creates the
    /// action/ack channel pair.
    pub(crate) async fn new_and_setup(
        me: WorkerId,
        path: &Path,
    ) -> Result<Self, SteppeError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints ( \
               superStepNumber INTEGER NOT NULL PRIMARY KEY, \
               state BLOB NOT NULL \
             )",
        )
        .execute(&pool)
        .await?;

        let (tx_action, rx_action) = mpsc::unbounded_channel();
        let (tx_ack, rx_ack) = mpsc::unbounded_channel();

        let saver_handle =
            tokio::spawn(Self::saver_task(me, pool, rx_action, tx_ack));

        Ok(CheckpointHub {
            me,
            tx_action,
            rx_ack,
            saver_handle,
        })
    }

    /// Submits an action by sending it to the action channel.
    pub(crate) fn submit_action(
        &mut self,
        action: CheckpointAction,
    ) -> Result<(), SteppeError> {
        self.tx_action.send(action).map_err(SteppeError::msg)
    }

    /// Waits for the next action result from the ack channel.
    pub(crate) async fn get_result(
        &mut self,
    ) -> Result<CheckpointResult, SteppeError> {
        match self.rx_ack.recv().await {
            Some(result) => Ok(result),
            None => logged_err!(self.me; "ack channel has been closed"),
        }
    }

    /// Terminates the saver task.
    pub(crate) fn shutdown(&self) {
        self.saver_handle.abort();
    }
}

// CheckpointHub saver task implementation
impl CheckpointHub {
    /// Stores one snapshot, replacing any previous snapshot for the step.
    async fn save_state(
        pool: &SqlitePool,
        step: SuperStepId,
        state: &CheckpointState,
    ) -> Result<(), SteppeError> {
        let blob = encode_to_vec(state)?;
        sqlx::query("INSERT OR REPLACE INTO checkpoints VALUES (?1, ?2)")
            .bind(step as i64)
            .bind(blob)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Reads one snapshot back out, `None` if absent.
    async fn load_state(
        pool: &SqlitePool,
        step: SuperStepId,
    ) -> Result<Option<CheckpointState>, SteppeError> {
        let row = sqlx::query(
            "SELECT state FROM checkpoints WHERE superStepNumber = ?1",
        )
        .bind(step as i64)
        .fetch_optional(pool)
        .await?;

        match row {
            Some(row) => {
                let blob: Vec<u8> = row.try_get(0)?;
                Ok(Some(decode_from_slice(&blob)?))
            }
            None => Ok(None),
        }
    }

    /// Saver task function.
    async fn saver_task(
        me: WorkerId,
        pool: SqlitePool,
        mut rx_action: mpsc::UnboundedReceiver<CheckpointAction>,
        tx_ack: mpsc::UnboundedSender<CheckpointResult>,
    ) {
        pf_debug!(me; "checkpoint saver task spawned");

        while let Some(action) = rx_action.recv().await {
            let result = match action {
                CheckpointAction::Save { step, state } => {
                    Self::save_state(&pool, step, &state)
                        .await
                        .map(|()| CheckpointResult::Save { step })
                }
                CheckpointAction::Load { step } => {
                    Self::load_state(&pool, step)
                        .await
                        .map(|state| CheckpointResult::Load { step, state })
                }
            };

            match result {
                Ok(result) => {
                    if let Err(e) = tx_ack.send(result) {
                        pf_error!(me; "error sending to tx_ack: {}", e);
                    }
                }
                Err(e) => {
                    pf_error!(me; "error during checkpoint action: {}", e);
                }
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "checkpoint saver task exited");
    }
}
