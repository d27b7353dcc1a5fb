//! Steppe worker node implementation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::coord::{
    CtrlMsg, ProgressSuperStep, ProgressSuperStepResult, StartSuperStep,
};
use crate::fcheck::AckResponder;
use crate::graph::{
    compute, home_worker, ComputeCtx, EdgeStore, Query, QueryType,
    SuperStepId, Value, Vertex, VertexCheckpoint, VertexId, VertexMsg,
    CheckpointState, WorkerDirectory, WorkerId, WorkerNode, INFINITE_DIST,
};
use crate::utils::SteppeError;
use crate::worker::checkpoint::{
    CheckpointAction, CheckpointHub, CheckpointResult,
};
use crate::worker::control::ControlHub;
use crate::worker::transport::TransportHub;

use serde::{Deserialize, Serialize};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// My configured worker id, stable across restarts.
    pub id: WorkerId,

    /// Coordinator's worker-facing address.
    pub coord_addr: SocketAddr,

    /// My peer-to-peer message listening address.
    pub p2p_addr: SocketAddr,

    /// My failure detector ack responder address.
    pub fcheck_addr: SocketAddr,

    /// Path of my local checkpoint database file.
    pub checkpoint_path: PathBuf,
}

/// Peer-to-peer data plane message.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub(crate) enum PeerMsg {
    /// All vertex messages from the sender to this worker targeting the
    /// given superstep; sent exactly once per peer per superstep, possibly
    /// empty. `epoch` is the sender's rollback incarnation.
    Batch {
        epoch: u64,
        step: SuperStepId,
        msgs: Vec<VertexMsg>,
    },

    /// Receipt acknowledgment echoing the batch's coordinates.
    BatchAck { epoch: u64, step: SuperStepId },
}

/// Tracking state of the superstep currently being computed.
struct StepProgress {
    /// Superstep number being computed.
    step: SuperStepId,

    /// Should this step durably checkpoint.
    is_checkpoint: bool,

    /// Number of vertex messages emitted during this step.
    messages_sent: u64,

    /// Largest absolute rank change this step (0 for SSSP).
    max_delta: f64,

    /// Peers (logical ids) that have not yet acked my batch.
    acks_needed: HashSet<WorkerId>,

    /// Peers (logical ids) whose next-step batch I have not yet received.
    flushes_needed: HashSet<WorkerId>,

    /// Snapshot save submitted, awaiting durability ack.
    save_submitted: bool,
}

/// Per-query worker state; built by `LoadPartition`, dropped at
/// `QueryComplete`.
struct QueryCtx {
    /// The running query.
    query: Query,

    /// Rollback incarnation number.
    epoch: u64,

    /// Fleet size of this query.
    num_workers: u8,

    /// My logical id under this query.
    logical_id: WorkerId,

    /// Immutable logical id -> node map.
    directory: WorkerDirectory,

    /// Global vertex count, told by the coordinator with every compute.
    total_vertices: u64,

    /// My partition's vertex table.
    vertices: HashMap<VertexId, Vertex>,

    /// Next superstep to compute.
    cur_step: SuperStepId,

    /// Buffered messages awaiting delivery at superstep `cur_step + 1`,
    /// bucketed per destination vertex.
    next_bufs: HashMap<VertexId, Vec<VertexMsg>>,

    /// Peers (logical ids) whose batch for a given target step has been
    /// received; consulted when the compute for that step begins.
    flushed: HashMap<SuperStepId, HashSet<WorkerId>>,

    /// In-flight superstep, if any.
    progress: Option<StepProgress>,
}

impl QueryCtx {
    /// Logical id of the peer with the given configured id, if in the
    /// directory.
    fn logical_of(&self, config_id: WorkerId) -> Option<WorkerId> {
        self.directory
            .iter()
            .find(|(_, node)| node.config_id == config_id)
            .map(|(&lid, _)| lid)
    }

    /// Configured id of the peer with the given logical id.
    fn config_of(&self, logical_id: WorkerId) -> Option<WorkerId> {
        self.directory.get(&logical_id).map(|node| node.config_id)
    }

    /// Logical ids of all peers (everyone but me).
    fn peer_logicals(&self) -> HashSet<WorkerId> {
        self.directory
            .keys()
            .copied()
            .filter(|&lid| lid != self.logical_id)
            .collect()
    }

    /// Gets or creates the local vertex `vid`. Destination-only vertices
    /// never appear in the edge scan; they materialize on first delivery.
    fn ensure_vertex(&mut self, vid: VertexId) -> &mut Vertex {
        let query_type = self.query.query_type;
        self.vertices
            .entry(vid)
            .or_insert_with(|| blank_vertex(vid, query_type))
    }

    /// Snapshots every local vertex: post-compute value and activity, plus
    /// the fully-flushed buffer of next-step messages.
    fn snapshot(&self) -> CheckpointState {
        self.vertices
            .iter()
            .map(|(&vid, v)| {
                (
                    vid,
                    VertexCheckpoint {
                        value: v.value,
                        inbox: self
                            .next_bufs
                            .get(&vid)
                            .cloned()
                            .unwrap_or_default(),
                        active: v.active,
                    },
                )
            })
            .collect()
    }

    /// Overwrites local state with a checkpoint taken at `step`: values and
    /// activity restored, buffered messages reloaded for delivery at step
    /// `step + 1`, vertices that did not exist at snapshot time removed,
    /// and any in-flight superstep discarded.
    fn apply_checkpoint(&mut self, step: SuperStepId, state: CheckpointState) {
        self.vertices.retain(|vid, _| state.contains_key(vid));
        self.next_bufs.clear();
        self.flushed.clear();
        self.progress = None;

        for (vid, vckpt) in state {
            let vertex = self.ensure_vertex(vid);
            vertex.value = vckpt.value;
            vertex.active = vckpt.active;
            vertex.inbox.clear();
            if !vckpt.inbox.is_empty() {
                self.next_bufs.insert(vid, vckpt.inbox);
            }
        }

        self.cur_step = step + 1;
    }
}

/// A vertex materialized by message delivery rather than the edge scan.
fn blank_vertex(vid: VertexId, query_type: QueryType) -> Vertex {
    Vertex {
        id: vid,
        neighbors: vec![],
        value: match query_type {
            QueryType::PageRank => Value::Rank(0.0),
            QueryType::ShortestPath => Value::Dist(INFINITE_DIST),
        },
        active: false,
        inbox: vec![],
    }
}

/// Builds and seeds the vertex table from a freshly scanned partition.
fn seed_vertices(
    adjacency: BTreeMap<VertexId, Vec<VertexId>>,
    query: &Query,
) -> HashMap<VertexId, Vertex> {
    let mut vertices: HashMap<VertexId, Vertex> = adjacency
        .into_iter()
        .map(|(vid, neighbors)| {
            let mut vertex = blank_vertex(vid, query.query_type);
            vertex.neighbors = neighbors;
            if query.query_type == QueryType::PageRank {
                // every vertex participates from step 0; the 1/|V| seed
                // value is filled in once the fleet-wide count is known
                vertex.active = true;
            }
            (vid, vertex)
        })
        .collect();

    if query.query_type == QueryType::ShortestPath {
        if let Some(source) = vertices.get_mut(&query.source()) {
            source.value = Value::Dist(0);
            source.active = true;
        }
    }

    vertices
}

/// Standalone Steppe worker node.
pub struct GraphWorker {
    /// This worker's configuration.
    config: WorkerConfig,

    /// ControlHub module for the coordinator link.
    control_hub: ControlHub,

    /// TransportHub module for the peer data plane.
    transport_hub: TransportHub<PeerMsg>,

    /// CheckpointHub module for durable snapshots.
    checkpoint_hub: CheckpointHub,

    /// Failure detector ack responder, so the coordinator can monitor me.
    responder: AckResponder,

    /// State of the query I currently serve, if any.
    query_ctx: Option<QueryCtx>,
}

// GraphWorker public API implementation
impl GraphWorker {
    /// Creates a new worker node, starts the failure detector ack
    /// responder, dials the coordinator, and reports myself for joining.
    /// Any error here is fatal to the worker process.
    pub async fn new_and_setup(
        config: WorkerConfig,
    ) -> Result<Self, SteppeError> {
        let responder =
            AckResponder::start(config.fcheck_addr, rand::random()).await?;

        let transport_hub =
            TransportHub::new_and_setup(config.id, config.p2p_addr).await?;

        let checkpoint_hub =
            CheckpointHub::new_and_setup(config.id, &config.checkpoint_path)
                .await?;

        let mut control_hub =
            ControlHub::new_and_setup(config.id, config.coord_addr).await?;
        control_hub.send_ctrl(CtrlMsg::Join {
            node: WorkerNode {
                config_id: config.id,
                p2p_addr: config.p2p_addr,
                fcheck_addr: config.fcheck_addr,
            },
        })?;
        pf_info!(config.id; "joined coordinator at '{}'", config.coord_addr);

        Ok(GraphWorker {
            config,
            control_hub,
            transport_hub,
            checkpoint_hub,
            responder,
            query_ctx: None,
        })
    }

    /// Main event loop of this worker. At most one superstep computes at a
    /// time; message receipt and checkpoint acks interleave freely.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                // receiving coordinator control message
                ctrl = self.control_hub.recv_ctrl() => {
                    let msg = match ctrl {
                        Ok(msg) => msg,
                        Err(e) => {
                            pf_error!(self.config.id;
                                      "coordinator link lost: {}", e);
                            break;
                        }
                    };
                    if let Err(e) = self.handle_ctrl_msg(msg).await {
                        pf_error!(self.config.id;
                                  "error handling ctrl msg: {}", e);
                    }
                },

                // receiving peer data plane message
                peer_msg = self.transport_hub.recv_msg() => {
                    let (peer, msg) = match peer_msg {
                        Ok(peer_msg) => peer_msg,
                        Err(e) => {
                            pf_error!(self.config.id;
                                      "error receiving peer msg: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_peer_msg(peer, msg) {
                        pf_error!(self.config.id;
                                  "error handling peer msg <- {}: {}",
                                  peer, e);
                    }
                },

                // receiving checkpoint action result
                result = self.checkpoint_hub.get_result() => {
                    let result = match result {
                        Ok(result) => result,
                        Err(e) => {
                            pf_error!(self.config.id;
                                      "error getting checkpoint result: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_checkpoint_result(result) {
                        pf_error!(self.config.id;
                                  "error handling checkpoint result: {}", e);
                    }
                },
            }
        }
    }

    /// Tears down all long-lived tasks owned by this worker. Used by tests
    /// to simulate a worker process crash.
    pub fn shutdown(&self) {
        self.responder.stop();
        self.control_hub.shutdown();
        self.transport_hub.shutdown();
        self.checkpoint_hub.shutdown();
    }
}

// GraphWorker control message handlers
impl GraphWorker {
    /// Dispatches one coordinator control message.
    async fn handle_ctrl_msg(
        &mut self,
        msg: CtrlMsg,
    ) -> Result<(), SteppeError> {
        match msg {
            CtrlMsg::LoadPartition(context) => {
                self.handle_load_partition(context).await
            }
            CtrlMsg::Compute(args) => self.handle_compute(args),
            CtrlMsg::Revert {
                checkpoint,
                context,
            } => self.handle_revert(checkpoint, context).await,
            CtrlMsg::CollectValue { vertex } => {
                self.handle_collect_value(vertex)
            }
            CtrlMsg::QueryComplete => {
                pf_info!(self.config.id; "query complete, dropping partition");
                self.query_ctx = None;
                Ok(())
            }
            _ => {
                logged_err!(self.config.id; "unexpected ctrl msg: {:?}", msg)
            }
        }
    }

    /// Handler of LoadPartition: streams my share of the edge table,
    /// materializes and seeds the vertex table, connects to peers, and
    /// replies readiness with the list of local vertex ids. Rebuilding from
    /// scratch makes a retried load idempotent.
    async fn handle_load_partition(
        &mut self,
        context: StartSuperStep,
    ) -> Result<(), SteppeError> {
        let me = self.config.id;
        pf_info!(me; "loading partition {}/{} of table '{}'",
                     context.logical_id, context.num_workers,
                     context.query.table);

        let adjacency = match Self::scan_partition(&context).await {
            Ok(adjacency) => adjacency,
            Err(e) => {
                pf_error!(me; "edge store scan failed: {}", e);
                self.control_hub.send_ctrl(CtrlMsg::LoadFailed {
                    reason: e.to_string(),
                })?;
                return Ok(());
            }
        };

        let vertices = seed_vertices(adjacency, &context.query);
        let mut vertex_ids: Vec<VertexId> = vertices.keys().copied().collect();
        vertex_ids.sort_unstable();
        pf_info!(me; "materialized {} vertices", vertex_ids.len());

        self.query_ctx = Some(QueryCtx {
            query: context.query,
            epoch: context.epoch,
            num_workers: context.num_workers,
            logical_id: context.logical_id,
            directory: context.directory,
            total_vertices: 0,
            vertices,
            cur_step: 0,
            next_bufs: HashMap::new(),
            flushed: HashMap::new(),
            progress: None,
        });

        self.connect_peers().await?;

        self.control_hub.send_ctrl(CtrlMsg::PartitionLoaded {
            logical_id: self.query_ctx.as_ref().unwrap().logical_id,
            vertices: vertex_ids,
        })?;
        Ok(())
    }

    /// Runs the edge store scan for a load/revert context.
    async fn scan_partition(
        context: &StartSuperStep,
    ) -> Result<BTreeMap<VertexId, Vec<VertexId>>, SteppeError> {
        let store = EdgeStore::open(&context.query.graph).await?;
        let adjacency = store
            .load_partition(
                &context.query.table,
                context.num_workers,
                context.logical_id,
            )
            .await;
        store.close().await;
        adjacency
    }

    /// Establishes any missing peer connections and waits until the whole
    /// directory is connected. The lower configured id initiates, so two
    /// live workers never dial each other simultaneously.
    async fn connect_peers(&mut self) -> Result<(), SteppeError> {
        let ctx = self.query_ctx.as_ref().unwrap();
        let connected: HashSet<WorkerId> =
            self.transport_hub.current_peers().into_iter().collect();

        let mut to_connect = vec![];
        for node in ctx.directory.values() {
            if node.config_id != self.config.id
                && node.config_id > self.config.id
                && !connected.contains(&node.config_id)
            {
                to_connect.push((node.config_id, node.p2p_addr));
            }
        }
        let num_workers = ctx.num_workers;

        for (peer, addr) in to_connect {
            self.transport_hub.connect_to_peer(peer, addr).await?;
        }
        self.transport_hub.wait_for_group(num_workers).await?;
        Ok(())
    }

    /// Handler of Compute: swaps buffered messages into vertex inboxes,
    /// invokes the vertex program on every vertex that has mail or is
    /// active, and routes the outbound messages. The step finishes (and
    /// replies) once the flush/ack round with all peers settles.
    fn handle_compute(
        &mut self,
        args: ProgressSuperStep,
    ) -> Result<(), SteppeError> {
        let me = self.config.id;
        let Some(ctx) = self.query_ctx.as_mut() else {
            return logged_err!(me; "compute command while no query loaded");
        };
        if args.step != ctx.cur_step || ctx.progress.is_some() {
            pf_warn!(me; "ignoring out-of-order compute for step {} (at {})",
                         args.step, ctx.cur_step);
            return Ok(());
        }
        ctx.total_vertices = args.total_vertices;
        pf_debug!(me; "computing superstep {} (checkpoint: {})",
                      args.step, args.is_checkpoint);

        // deliver buffered messages into vertex inboxes; a fast peer may
        // already have flushed mail for the step after this one, which
        // stays buffered
        let mut deliveries: Vec<(VertexId, Vec<VertexMsg>)> = vec![];
        let buffered: Vec<VertexId> = ctx.next_bufs.keys().copied().collect();
        for vid in buffered {
            let bucket = ctx.next_bufs.remove(&vid).unwrap();
            let (now, later): (Vec<VertexMsg>, Vec<VertexMsg>) =
                bucket.into_iter().partition(|m| m.step == args.step);
            if !later.is_empty() {
                ctx.next_bufs.insert(vid, later);
            }
            if !now.is_empty() {
                deliveries.push((vid, now));
            }
        }
        for (vid, msgs) in deliveries {
            ctx.ensure_vertex(vid).inbox = msgs;
        }

        // run the vertex program over the partition
        let mut messages_sent: u64 = 0;
        let mut max_delta: f64 = 0.0;
        let mut local_out: Vec<VertexMsg> = vec![];
        let mut peer_out: HashMap<WorkerId, Vec<VertexMsg>> = HashMap::new();
        let mut outgoing_counts: HashMap<WorkerId, u64> = HashMap::new();
        {
            let QueryCtx {
                ref query,
                num_workers,
                logical_id,
                total_vertices,
                ref mut vertices,
                ..
            } = *ctx;
            let cctx = ComputeCtx {
                step: args.step,
                query,
                total_vertices,
            };

            for vertex in vertices.values_mut() {
                if vertex.inbox.is_empty() && !vertex.active {
                    continue;
                }
                let inbound = std::mem::take(&mut vertex.inbox);
                let old_value = vertex.value;
                let outs = compute(vertex, &inbound, &cctx);

                if let (Value::Rank(old), Value::Rank(new)) =
                    (old_value, vertex.value)
                {
                    max_delta = max_delta.max((new - old).abs());
                }

                for (dst, value) in outs {
                    let msg = VertexMsg {
                        step: args.step + 1,
                        src: vertex.id,
                        dst,
                        value,
                    };
                    let target = home_worker(dst, num_workers);
                    messages_sent += 1;
                    *outgoing_counts.entry(target).or_default() += 1;
                    if target == logical_id {
                        local_out.push(msg);
                    } else {
                        peer_out.entry(target).or_default().push(msg);
                    }
                }
            }
        }
        pf_debug!(me; "superstep {} emitted {} msgs, per-worker {:?}",
                      args.step, messages_sent, outgoing_counts);

        // local deliveries go straight into the next-step buffer
        for msg in local_out {
            let dst = msg.dst;
            ctx.ensure_vertex(dst);
            ctx.next_bufs.entry(dst).or_default().push(msg);
        }

        // flush exactly one batch (possibly empty) to every peer; receipt
        // of all peers' batches plus all acks completes the step
        let peers = ctx.peer_logicals();
        let already_flushed = ctx
            .flushed
            .remove(&(args.step + 1))
            .unwrap_or_default();
        let epoch = ctx.epoch;
        let mut batches = vec![];
        for &lid in &peers {
            let msgs = peer_out.remove(&lid).unwrap_or_default();
            let config_id = ctx.config_of(lid).unwrap();
            batches.push((
                PeerMsg::Batch {
                    epoch,
                    step: args.step + 1,
                    msgs,
                },
                config_id,
            ));
        }

        ctx.progress = Some(StepProgress {
            step: args.step,
            is_checkpoint: args.is_checkpoint,
            messages_sent,
            max_delta,
            acks_needed: peers.clone(),
            flushes_needed: peers
                .difference(&already_flushed)
                .copied()
                .collect(),
            save_submitted: false,
        });

        for (batch, config_id) in batches {
            self.transport_hub.send_msg(batch, config_id)?;
        }

        self.maybe_finish_step()
    }

    /// Handler of Revert: reloads the partition if this is a freshly
    /// restarted process, re-establishes peer connections, overwrites local
    /// state from the durable checkpoint, and acks. A missing checkpoint
    /// fails the query.
    async fn handle_revert(
        &mut self,
        checkpoint: SuperStepId,
        context: StartSuperStep,
    ) -> Result<(), SteppeError> {
        let me = self.config.id;
        pf_warn!(me; "reverting to checkpoint at step {}", checkpoint);

        // a restarted worker (or one that never saw this query) rebuilds
        // its partition skeleton first; the snapshot then overwrites values
        let need_reload = match self.query_ctx.as_ref() {
            Some(ctx) => ctx.query != context.query,
            None => true,
        };
        if need_reload {
            let adjacency = match Self::scan_partition(&context).await {
                Ok(adjacency) => adjacency,
                Err(e) => {
                    pf_error!(me; "edge store scan failed: {}", e);
                    self.control_hub.send_ctrl(CtrlMsg::LoadFailed {
                        reason: e.to_string(),
                    })?;
                    return Ok(());
                }
            };
            let vertices = seed_vertices(adjacency, &context.query);
            self.query_ctx = Some(QueryCtx {
                query: context.query,
                epoch: context.epoch,
                num_workers: context.num_workers,
                logical_id: context.logical_id,
                directory: context.directory,
                total_vertices: 0,
                vertices,
                cur_step: 0,
                next_bufs: HashMap::new(),
                flushed: HashMap::new(),
                progress: None,
            });
        } else {
            let ctx = self.query_ctx.as_mut().unwrap();
            ctx.epoch = context.epoch;
        }

        self.connect_peers().await?;

        // fetch the snapshot; ignore any stale save acks in the channel
        self.checkpoint_hub
            .submit_action(CheckpointAction::Load { step: checkpoint })?;
        let state = loop {
            match self.checkpoint_hub.get_result().await? {
                CheckpointResult::Load { step, state }
                    if step == checkpoint =>
                {
                    break state;
                }
                _ => continue,
            }
        };

        let Some(state) = state else {
            pf_error!(me; "checkpoint missing for step {}", checkpoint);
            self.control_hub.send_ctrl(CtrlMsg::RevertFailed {
                step: checkpoint,
                reason: format!(
                    "checkpoint missing for step {}",
                    checkpoint
                ),
            })?;
            return Ok(());
        };

        let ctx = self.query_ctx.as_mut().unwrap();
        ctx.apply_checkpoint(checkpoint, state);
        pf_info!(me; "reverted to step {}, resuming at {}",
                     checkpoint, ctx.cur_step);

        self.control_hub
            .send_ctrl(CtrlMsg::RevertDone { step: checkpoint })?;
        Ok(())
    }

    /// Handler of CollectValue: reports the final value of a local vertex.
    fn handle_collect_value(
        &mut self,
        vertex: VertexId,
    ) -> Result<(), SteppeError> {
        let value = self
            .query_ctx
            .as_ref()
            .and_then(|ctx| ctx.vertices.get(&vertex))
            .map(|v| v.value);
        self.control_hub
            .send_ctrl(CtrlMsg::ValueCollected { vertex, value })?;
        Ok(())
    }
}

// GraphWorker peer message handlers
impl GraphWorker {
    /// Handler of a peer data plane message.
    fn handle_peer_msg(
        &mut self,
        peer: WorkerId,
        msg: PeerMsg,
    ) -> Result<(), SteppeError> {
        match msg {
            PeerMsg::Batch { epoch, step, msgs } => {
                self.handle_batch(peer, epoch, step, msgs)
            }
            PeerMsg::BatchAck { epoch, step } => {
                self.handle_batch_ack(peer, epoch, step)
            }
        }
    }

    /// Handler of a peer's batch: buffer its messages for the next
    /// superstep and ack receipt. Batches for any other superstep, or from
    /// a previous rollback incarnation, are dropped silently.
    fn handle_batch(
        &mut self,
        peer: WorkerId,
        epoch: u64,
        step: SuperStepId,
        msgs: Vec<VertexMsg>,
    ) -> Result<(), SteppeError> {
        let me = self.config.id;
        let Some(ctx) = self.query_ctx.as_mut() else {
            return Ok(()); // no query loaded, drop
        };
        if epoch != ctx.epoch {
            pf_debug!(me; "dropping batch from old incarnation {}", epoch);
            return Ok(());
        }
        let Some(peer_lid) = ctx.logical_of(peer) else {
            return Ok(()); // not in this query's directory, drop
        };

        if step == ctx.cur_step + 1 {
            for msg in msgs {
                if msg.step != step {
                    continue;
                }
                let dst = msg.dst;
                ctx.ensure_vertex(dst);
                ctx.next_bufs.entry(dst).or_default().push(msg);
            }
            ctx.flushed.entry(step).or_default().insert(peer_lid);
            if let Some(progress) = ctx.progress.as_mut() {
                if progress.step + 1 == step {
                    progress.flushes_needed.remove(&peer_lid);
                }
            }
        } else {
            pf_debug!(me; "dropping batch for step {} (at {})",
                          step, ctx.cur_step);
        }

        let config_id = ctx.config_of(peer_lid).unwrap();
        self.transport_hub
            .send_msg(PeerMsg::BatchAck { epoch, step }, config_id)?;
        self.maybe_finish_step()
    }

    /// Handler of a peer's batch ack.
    fn handle_batch_ack(
        &mut self,
        peer: WorkerId,
        epoch: u64,
        step: SuperStepId,
    ) -> Result<(), SteppeError> {
        let Some(ctx) = self.query_ctx.as_mut() else {
            return Ok(());
        };
        if epoch != ctx.epoch {
            return Ok(());
        }
        let Some(peer_lid) = ctx.logical_of(peer) else {
            return Ok(());
        };
        if let Some(progress) = ctx.progress.as_mut() {
            if progress.step + 1 == step {
                progress.acks_needed.remove(&peer_lid);
            }
        }
        self.maybe_finish_step()
    }
}

// GraphWorker superstep completion
impl GraphWorker {
    /// Completes the in-flight superstep once the flush/ack round with all
    /// peers has settled: snapshot durably if checkpointing, then reply the
    /// barrier with this worker's halt vote.
    fn maybe_finish_step(&mut self) -> Result<(), SteppeError> {
        let me = self.config.id;
        let Some(ctx) = self.query_ctx.as_mut() else {
            return Ok(());
        };
        let Some(progress) = ctx.progress.as_mut() else {
            return Ok(());
        };
        if !progress.acks_needed.is_empty()
            || !progress.flushes_needed.is_empty()
        {
            return Ok(());
        }

        if progress.is_checkpoint && !progress.save_submitted {
            // the next-step buffers are complete now; snapshot and wait for
            // the durability ack before replying
            progress.save_submitted = true;
            let step = progress.step;
            let state = ctx.snapshot();
            pf_info!(me; "checkpointing {} vertices at step {}",
                         state.len(), step);
            self.checkpoint_hub
                .submit_action(CheckpointAction::Save { step, state })?;
            return Ok(());
        }
        if progress.is_checkpoint {
            return Ok(()); // waiting for the durability ack
        }

        self.finish_step()
    }

    /// Replies the superstep barrier and advances the step counter.
    fn finish_step(&mut self) -> Result<(), SteppeError> {
        let me = self.config.id;
        let ctx = self.query_ctx.as_mut().unwrap();
        let progress = ctx.progress.take().unwrap();

        // the fleet may halt only when no vertex is active and no mail is
        // pending anywhere; buffered messages will reawaken their targets
        let all_inactive = ctx.vertices.values().all(|v| !v.active)
            && ctx.next_bufs.is_empty();

        ctx.cur_step = progress.step + 1;
        let cur_step = ctx.cur_step;
        ctx.flushed.retain(|&step, _| step > cur_step);

        pf_debug!(me; "superstep {} done, active: {}",
                      progress.step, !all_inactive);
        self.control_hub.send_ctrl(CtrlMsg::StepDone(
            ProgressSuperStepResult {
                step: progress.step,
                is_checkpoint: progress.is_checkpoint,
                is_active: !all_inactive,
                messages_sent: progress.messages_sent,
                max_delta: progress.max_delta,
            },
        ))?;
        Ok(())
    }

    /// Handler of a checkpoint hub result.
    fn handle_checkpoint_result(
        &mut self,
        result: CheckpointResult,
    ) -> Result<(), SteppeError> {
        let me = self.config.id;
        match result {
            CheckpointResult::Save { step } => {
                let Some(ctx) = self.query_ctx.as_mut() else {
                    return Ok(()); // rolled back meanwhile, ignore
                };
                let matches = ctx
                    .progress
                    .as_ref()
                    .is_some_and(|p| p.save_submitted && p.step == step);
                if !matches {
                    pf_debug!(me; "ignoring stale save ack for step {}", step);
                    return Ok(());
                }

                self.control_hub
                    .send_ctrl(CtrlMsg::CheckpointSaved { step })?;
                self.finish_step()
            }
            CheckpointResult::Load { step, .. } => {
                // revert consumes loads inline; anything here is stale
                pf_debug!(me; "ignoring stale load result for step {}", step);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod worker_tests {
    use super::*;

    fn sssp_query() -> Query {
        Query {
            client: "tester".into(),
            query_type: QueryType::ShortestPath,
            nodes: vec![1, 3],
            graph: "/tmp/none.db".into(),
            table: "graph".into(),
        }
    }

    fn pr_query() -> Query {
        Query {
            client: "tester".into(),
            query_type: QueryType::PageRank,
            nodes: vec![1],
            graph: "/tmp/none.db".into(),
            table: "graph".into(),
        }
    }

    fn test_ctx(query: Query, vertices: HashMap<VertexId, Vertex>) -> QueryCtx {
        QueryCtx {
            query,
            epoch: 0,
            num_workers: 1,
            logical_id: 0,
            directory: BTreeMap::new(),
            total_vertices: vertices.len() as u64,
            vertices,
            cur_step: 0,
            next_bufs: HashMap::new(),
            flushed: HashMap::new(),
            progress: None,
        }
    }

    #[test]
    fn seeding_shortest_path() {
        let mut adjacency = BTreeMap::new();
        adjacency.insert(1, vec![2]);
        adjacency.insert(2, vec![3, 3]);
        let vertices = seed_vertices(adjacency, &sssp_query());

        assert_eq!(vertices.len(), 2);
        assert_eq!(vertices[&1].value, Value::Dist(0));
        assert!(vertices[&1].active);
        assert_eq!(vertices[&2].value, Value::Dist(INFINITE_DIST));
        assert!(!vertices[&2].active);
        assert_eq!(vertices[&2].neighbors, vec![3, 3]);
    }

    #[test]
    fn seeding_page_rank() {
        let mut adjacency = BTreeMap::new();
        adjacency.insert(1, vec![2]);
        adjacency.insert(3, vec![4]);
        let vertices = seed_vertices(adjacency, &pr_query());

        assert!(vertices.values().all(|v| v.active));
        assert!(vertices.values().all(|v| v.value == Value::Rank(0.0)));
    }

    #[test]
    fn snapshot_then_apply_is_identity() {
        let mut adjacency = BTreeMap::new();
        adjacency.insert(1, vec![2]);
        adjacency.insert(2, vec![3]);
        let vertices = seed_vertices(adjacency, &sssp_query());
        let mut ctx = test_ctx(sssp_query(), vertices);

        ctx.vertices.get_mut(&2).unwrap().value = Value::Dist(1);
        ctx.next_bufs.insert(
            2,
            vec![VertexMsg {
                step: 6,
                src: 1,
                dst: 2,
                value: Value::Dist(1),
            }],
        );
        ctx.cur_step = 5;

        let state = ctx.snapshot();

        // tamper, then restore
        ctx.vertices.get_mut(&2).unwrap().value = Value::Dist(9);
        ctx.next_bufs.clear();
        ctx.ensure_vertex(77); // materialized after the snapshot
        ctx.apply_checkpoint(5, state.clone());

        assert_eq!(ctx.cur_step, 6);
        assert!(!ctx.vertices.contains_key(&77));
        assert_eq!(ctx.vertices[&2].value, Value::Dist(1));
        assert_eq!(ctx.next_bufs[&2].len(), 1);
        assert_eq!(ctx.snapshot(), state);
    }

    #[test]
    fn blank_vertices_by_query_type() {
        let v = blank_vertex(9, QueryType::ShortestPath);
        assert_eq!(v.value, Value::Dist(INFINITE_DIST));
        assert!(!v.active);
        let v = blank_vertex(9, QueryType::PageRank);
        assert_eq!(v.value, Value::Rank(0.0));
        assert!(v.neighbors.is_empty());
    }
}
