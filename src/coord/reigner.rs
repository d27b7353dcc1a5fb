//! Coordinator worker-facing controller module.

use std::net::SocketAddr;

use crate::graph::{
    Query, SuperStepId, VertexId, Value, WorkerDirectory, WorkerId, WorkerNode,
};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, SteppeError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Arguments of a partition load command, beginning superstep 0. Also sent
/// as the context of a revert so that a restarted worker can reload its
/// partition and reconnect to its peers.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StartSuperStep {
    /// Rollback incarnation number; bumped by the coordinator on every
    /// rollback or restart. Data-plane batches from older incarnations are
    /// dropped by receivers.
    pub epoch: u64,

    /// Fleet size of this query.
    pub num_workers: u8,

    /// Immutable logical id -> node map for this query.
    pub directory: WorkerDirectory,

    /// The receiving worker's logical id under this query.
    pub logical_id: WorkerId,

    /// The query being started.
    pub query: Query,
}

/// Arguments of one superstep's compute command.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressSuperStep {
    /// Superstep number to compute.
    pub step: SuperStepId,

    /// Should this step durably checkpoint.
    pub is_checkpoint: bool,

    /// Global vertex count at load time (PageRank needs `|V|` every step).
    pub total_vertices: u64,
}

/// A worker's reply to one superstep's compute command; its `is_active` is
/// the worker's vote for continuing.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct ProgressSuperStepResult {
    /// Superstep number computed.
    pub step: SuperStepId,

    /// Did this step durably checkpoint.
    pub is_checkpoint: bool,

    /// True unless every local vertex has voted to halt.
    pub is_active: bool,

    /// Number of vertex messages emitted during this step.
    pub messages_sent: u64,

    /// Largest absolute PageRank value change this step (0 for SSSP).
    pub max_delta: f64,
}

/// Control message between coordinator and workers. Control traffic is
/// bidirectional: some initiated by the coordinator and some by workers.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum CtrlMsg {
    /// Worker -> Coordinator: new worker up, reporting its node info.
    Join { node: WorkerNode },

    /// Coordinator -> Worker: load your partition and seed initial state.
    LoadPartition(StartSuperStep),

    /// Worker -> Coordinator: partition loaded; lists the local vertex ids.
    /// Signals readiness; idempotent if the load command is retried before
    /// any compute command.
    PartitionLoaded {
        logical_id: WorkerId,
        vertices: Vec<VertexId>,
    },

    /// Worker -> Coordinator: edge store unreachable or scan failed; the
    /// coordinator aborts the query.
    LoadFailed { reason: String },

    /// Coordinator -> Worker: compute one superstep.
    Compute(ProgressSuperStep),

    /// Worker -> Coordinator: superstep barrier reply.
    StepDone(ProgressSuperStepResult),

    /// Worker -> Coordinator: checkpoint for the step is durable.
    CheckpointSaved { step: SuperStepId },

    /// Coordinator -> Worker: roll back to the given checkpoint. `context`
    /// lets a freshly restarted worker reload its partition and reconnect.
    Revert {
        checkpoint: SuperStepId,
        context: StartSuperStep,
    },

    /// Worker -> Coordinator: rollback applied.
    RevertDone { step: SuperStepId },

    /// Worker -> Coordinator: rollback impossible (checkpoint missing); the
    /// coordinator fails the query.
    RevertFailed { step: SuperStepId, reason: String },

    /// Coordinator -> Worker: report the final value of a local vertex.
    CollectValue { vertex: VertexId },

    /// Worker -> Coordinator: final value reply; `None` if the vertex was
    /// never materialized on this worker.
    ValueCollected {
        vertex: VertexId,
        value: Option<Value>,
    },

    /// Coordinator -> Worker: query over; drop per-query state.
    QueryComplete,
}

/// The worker-facing controller API module.
pub(crate) struct WorkerReigner {
    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(WorkerId, CtrlMsg)>,

    /// Map from worker ID -> sender side of the send channel, shared with
    /// the worker acceptor task.
    tx_sends: flashmap::ReadHandle<WorkerId, mpsc::UnboundedSender<CtrlMsg>>,

    /// Join handle of the worker acceptor task.
    _worker_acceptor_handle: JoinHandle<()>,
}

// WorkerReigner public API implementation
impl WorkerReigner {
    /// Creates a new worker-facing controller module. Spawns the worker
    /// acceptor task. Creates a recv channel for buffering incoming control
    /// messages.
    pub(crate) async fn new_and_setup(
        bind_addr: SocketAddr,
    ) -> Result<Self, SteppeError> {
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();

        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<WorkerId, mpsc::UnboundedSender<CtrlMsg>>();

        let worker_listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let worker_acceptor_handle = tokio::spawn(Self::worker_acceptor_task(
            tx_recv,
            worker_listener,
            tx_sends_write,
        ));

        Ok(WorkerReigner {
            rx_recv,
            tx_sends: tx_sends_read,
            _worker_acceptor_handle: worker_acceptor_handle,
        })
    }

    /// Returns whether a worker ID is currently connected.
    #[allow(dead_code)]
    pub(crate) fn has_worker(&self, worker: WorkerId) -> bool {
        let tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.contains_key(&worker)
    }

    /// Waits for the next control event message from some worker.
    pub(crate) async fn recv_ctrl(
        &mut self,
    ) -> Result<(WorkerId, CtrlMsg), SteppeError> {
        match self.rx_recv.recv().await {
            Some((id, msg)) => Ok((id, msg)),
            None => logged_err!("c"; "recv channel has been closed"),
        }
    }

    /// Sends a control message to a specified worker.
    pub(crate) fn send_ctrl(
        &mut self,
        msg: CtrlMsg,
        worker: WorkerId,
    ) -> Result<(), SteppeError> {
        let tx_sends_guard = self.tx_sends.guard();
        match tx_sends_guard.get(&worker) {
            Some(tx_send) => {
                tx_send.send(msg).map_err(SteppeError::msg)?;
                Ok(())
            }
            None => {
                logged_err!("c"; "worker ID {} not found among active ones",
                                 worker)
            }
        }
    }
}

// WorkerReigner worker_acceptor task implementation
impl WorkerReigner {
    /// Accepts a new worker connection. Workers bring their own configured
    /// id; a restarted worker reclaims its dead predecessor's slot.
    async fn accept_new_worker(
        mut stream: TcpStream,
        addr: SocketAddr,
        tx_recv: mpsc::UnboundedSender<(WorkerId, CtrlMsg)>,
        tx_sends: &mut flashmap::WriteHandle<
            WorkerId,
            mpsc::UnboundedSender<CtrlMsg>,
        >,
        worker_controller_handles: &mut std::collections::HashMap<
            WorkerId,
            JoinHandle<()>,
        >,
        tx_exit: mpsc::UnboundedSender<WorkerId>,
    ) -> Result<(), SteppeError> {
        let id = match stream.read_u8().await {
            Ok(id) => id,
            Err(e) => {
                return logged_err!("c"; "error receiving worker ID: {}", e);
            }
        };

        let mut tx_sends_guard = tx_sends.guard();
        if let Some(sender) = tx_sends_guard.get(&id) {
            if sender.is_closed() {
                // if this worker ID has died before, garbage collect the old
                // connection's handles now
                tx_sends_guard.remove(id);
                worker_controller_handles.remove(&id);
            } else {
                return logged_err!("c"; "duplicate worker ID listened: {}", id);
            }
        }
        pf_debug!("c"; "accepted new worker {}", id);

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);
        tx_sends_guard.publish();

        let worker_controller_handle =
            tokio::spawn(Self::worker_controller_task(
                id, addr, stream, tx_recv, rx_send, tx_exit,
            ));
        worker_controller_handles.insert(id, worker_controller_handle);

        Ok(())
    }

    /// Removes handles of a left worker connection.
    fn remove_left_worker(
        id: WorkerId,
        tx_sends: &mut flashmap::WriteHandle<
            WorkerId,
            mpsc::UnboundedSender<CtrlMsg>,
        >,
        worker_controller_handles: &mut std::collections::HashMap<
            WorkerId,
            JoinHandle<()>,
        >,
    ) {
        let mut tx_sends_guard = tx_sends.guard();
        if tx_sends_guard.contains_key(&id) {
            tx_sends_guard.remove(id);
            tx_sends_guard.publish();
        }
        worker_controller_handles.remove(&id);
    }

    /// Worker acceptor task function.
    async fn worker_acceptor_task(
        tx_recv: mpsc::UnboundedSender<(WorkerId, CtrlMsg)>,
        worker_listener: TcpListener,
        mut tx_sends: flashmap::WriteHandle<
            WorkerId,
            mpsc::UnboundedSender<CtrlMsg>,
        >,
    ) {
        pf_debug!("c"; "worker_acceptor task spawned");

        let local_addr = worker_listener.local_addr().unwrap();
        pf_info!("c"; "accepting workers on '{}'", local_addr);

        let mut worker_controller_handles = std::collections::HashMap::new();

        // create an exit mpsc channel for getting notified about termination
        // of worker controller tasks
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                // new worker connection accepted
                accepted = worker_listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!("c"; "error accepting worker: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = Self::accept_new_worker(
                        stream,
                        addr,
                        tx_recv.clone(),
                        &mut tx_sends,
                        &mut worker_controller_handles,
                        tx_exit.clone(),
                    ).await {
                        pf_error!("c"; "error accepting new worker: {}", e);
                    }
                },

                // a worker controller task exits
                id = rx_exit.recv() => {
                    if let Some(id) = id {
                        Self::remove_left_worker(
                            id,
                            &mut tx_sends,
                            &mut worker_controller_handles,
                        );
                    }
                },
            }
        }
    }

    /// Per-worker controller task function.
    async fn worker_controller_task(
        id: WorkerId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_recv: mpsc::UnboundedSender<(WorkerId, CtrlMsg)>,
        mut rx_send: mpsc::UnboundedReceiver<CtrlMsg>,
        tx_exit: mpsc::UnboundedSender<WorkerId>,
    ) {
        pf_debug!("c"; "worker_controller task for {} '{}' spawned", id, addr);

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a message to send to this worker
                msg = rx_send.recv(), if !retrying => {
                    match msg {
                        Some(msg) => {
                            match Self::write_ctrl(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {
                                    // pf_trace!("c"; "sent ctrl -> {} {:?}",
                                    //                id, msg);
                                }
                                Ok(false) => {
                                    pf_debug!("c"; "should start retrying ctrl send -> {}", id);
                                    retrying = true;
                                }
                                Err(_e) => {
                                    // worker likely lost; the read side will
                                    // notice and exit this task
                                }
                            }
                        },
                        None => break, // channel closed, no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match Self::write_ctrl(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!("c"; "finished retrying last ctrl send -> {}", id);
                            retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!("c"; "still should retry last ctrl send -> {}", id);
                        }
                        Err(_e) => {}
                    }
                },

                // receives control message from this worker
                msg = Self::read_ctrl(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            // pf_trace!("c"; "recv ctrl <- {} {:?}", id, msg);
                            if let Err(e) = tx_recv.send((id, msg)) {
                                pf_error!("c"; "error sending to tx_recv for {}: {}",
                                               id, e);
                            }
                        },
                        Err(_e) => {
                            break; // probably the worker exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = tx_exit.send(id) {
            pf_error!("c"; "error sending exit signal for {}: {}", id, e);
        }
        pf_debug!("c"; "worker_controller task for {} '{}' exited", id, addr);
    }

    /// Reads a worker control message from the given TcpStream.
    async fn read_ctrl(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<CtrlMsg, SteppeError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Writes a control message through the given TcpStream.
    fn write_ctrl(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&CtrlMsg>,
    ) -> Result<bool, SteppeError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }
}

#[cfg(test)]
mod reigner_tests {
    use super::*;
    use crate::worker::control::ControlHub;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn test_node(id: WorkerId) -> WorkerNode {
        WorkerNode {
            config_id: id,
            p2p_addr: format!("127.0.0.1:3070{}", id).parse().unwrap(),
            fcheck_addr: format!("127.0.0.1:3080{}", id).parse().unwrap(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn api_join_and_ctrl() -> Result<(), SteppeError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();
        tokio::spawn(async move {
            // worker 1 side
            barrier1.wait().await;
            let mut hub =
                ControlHub::new_and_setup(1, "127.0.0.1:30200".parse()?).await?;
            hub.send_ctrl(CtrlMsg::Join {
                node: test_node(1),
            })?;
            // expect a value collection command and reply to it
            let msg = hub.recv_ctrl().await?;
            assert_eq!(msg, CtrlMsg::CollectValue { vertex: 77 });
            hub.send_ctrl(CtrlMsg::ValueCollected {
                vertex: 77,
                value: Some(Value::Dist(3)),
            })?;
            Ok::<(), SteppeError>(())
        });
        // coordinator side
        let mut reigner =
            WorkerReigner::new_and_setup("127.0.0.1:30200".parse()?).await?;
        barrier.wait().await;
        let (id, msg) = reigner.recv_ctrl().await?;
        assert_eq!(id, 1);
        assert_eq!(
            msg,
            CtrlMsg::Join {
                node: test_node(1)
            }
        );
        assert!(reigner.has_worker(1));
        reigner.send_ctrl(CtrlMsg::CollectValue { vertex: 77 }, 1)?;
        let (id, msg) = reigner.recv_ctrl().await?;
        assert_eq!(id, 1);
        assert_eq!(
            msg,
            CtrlMsg::ValueCollected {
                vertex: 77,
                value: Some(Value::Dist(3)),
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn worker_rejoin_replaces() -> Result<(), SteppeError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();
        tokio::spawn(async move {
            barrier1.wait().await;
            // first incarnation of worker 2
            let mut hub =
                ControlHub::new_and_setup(2, "127.0.0.1:30201".parse()?).await?;
            hub.send_ctrl(CtrlMsg::Join {
                node: test_node(2),
            })?;
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            hub.shutdown();
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            // second incarnation reclaims the same id
            let mut hub =
                ControlHub::new_and_setup(2, "127.0.0.1:30201".parse()?).await?;
            hub.send_ctrl(CtrlMsg::Join {
                node: test_node(2),
            })?;
            Ok::<(), SteppeError>(())
        });
        let mut reigner =
            WorkerReigner::new_and_setup("127.0.0.1:30201".parse()?).await?;
        barrier.wait().await;
        let (id, _) = reigner.recv_ctrl().await?;
        assert_eq!(id, 2);
        // the same logical worker joins again after "dying"
        let (id, msg) = reigner.recv_ctrl().await?;
        assert_eq!(id, 2);
        assert_eq!(
            msg,
            CtrlMsg::Join {
                node: test_node(2)
            }
        );
        assert!(reigner.has_worker(2));
        Ok(())
    }
}
