//! Steppe coordinator oracle implementation.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::client::ClientId;
use crate::coord::{
    ClientReactor, CtrlMsg, ProgressSuperStep, ProgressSuperStepResult,
    QueryReply, QueryRequest, StartSuperStep, WorkerReigner,
};
use crate::fcheck::FailMonitor;
use crate::graph::{
    home_worker, Query, QueryResult, QueryType, SuperStepId, Value, VertexId,
    WorkerDirectory, WorkerId, WorkerNode, INFINITE_DIST,
};
use crate::utils::SteppeError;

use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// Coordinator configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordConfig {
    /// Consecutive heartbeat misses before a worker is declared failed.
    pub lost_msgs_thresh: u8,

    /// Checkpoint at every superstep S where `S % this == 0` (S > 0).
    pub steps_between_checkpoints: u64,

    /// Hard bound on superstep count; the loop exits after computing this
    /// step even if workers still vote active.
    pub max_steps: u64,

    /// PageRank halts early once every worker's largest per-step value
    /// change drops below this; `0.0` disables early halting.
    pub convergence_epsilon: f64,

    /// Failure detector heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for CoordConfig {
    fn default() -> Self {
        CoordConfig {
            lost_msgs_thresh: 5,
            steps_between_checkpoints: 5,
            max_steps: 50,
            convergence_epsilon: 0.0,
            heartbeat_interval_ms: 100,
        }
    }
}

/// Phase of the active query's lifecycle.
enum QueryPhase {
    /// Awaiting the readiness barrier; maps logical id -> local vertex
    /// count for workers that have loaded their partition.
    Loading { ready: HashMap<WorkerId, u64> },

    /// Awaiting the superstep barrier for `QueryRun.step`; `done` holds
    /// configured ids of workers that have replied.
    Stepping {
        done: HashSet<WorkerId>,
        any_active: bool,
        max_delta: f64,
    },

    /// Rolling the fleet back to `QueryRun.last_checkpoint`; `acked` holds
    /// configured ids of workers that have applied the revert.
    Reverting { acked: HashSet<WorkerId> },

    /// Awaiting the final value of the result vertex.
    Collecting,
}

/// State of the one active query.
struct QueryRun {
    /// The client this query answers to.
    client: ClientId,

    /// The query itself.
    query: Query,

    /// Rollback incarnation number, bumped on every rollback/restart.
    epoch: u64,

    /// Fleet size, fixed at query start.
    num_workers: u8,

    /// Immutable logical id -> node map, fixed at query start.
    directory: WorkerDirectory,

    /// Global vertex count, summed at the readiness barrier.
    total_vertices: u64,

    /// Current superstep number.
    step: SuperStepId,

    /// Highest globally-acknowledged checkpoint (0 = none).
    last_checkpoint: SuperStepId,

    /// Per-step checkpoint acks (configured ids); a step becomes the
    /// global checkpoint when every directory member has acked it.
    checkpoint_acks: HashMap<SuperStepId, HashSet<WorkerId>>,

    /// Configured ids of lost directory workers we are waiting to rejoin.
    pending_rejoin: HashSet<WorkerId>,

    /// Lifecycle phase.
    phase: QueryPhase,
}

impl QueryRun {
    /// Configured ids of every directory member.
    fn config_ids(&self) -> HashSet<WorkerId> {
        self.directory.values().map(|node| node.config_id).collect()
    }

    /// The load/revert context for one worker.
    fn context_for(&self, logical_id: WorkerId) -> StartSuperStep {
        StartSuperStep {
            epoch: self.epoch,
            num_workers: self.num_workers,
            directory: self.directory.clone(),
            logical_id,
            query: self.query.clone(),
        }
    }

    /// Logical id of a directory member by configured id.
    fn logical_of(&self, config_id: WorkerId) -> Option<WorkerId> {
        self.directory
            .iter()
            .find(|(_, node)| node.config_id == config_id)
            .map(|(&lid, _)| lid)
    }
}

/// Builds a query directory by assigning logical ids 0..N-1 over the
/// registered configured ids in sorted order.
fn assign_directory(workers: &HashMap<WorkerId, WorkerNode>) -> WorkerDirectory {
    let mut config_ids: Vec<WorkerId> = workers.keys().copied().collect();
    config_ids.sort_unstable();
    config_ids
        .into_iter()
        .enumerate()
        .map(|(lid, cfg)| (lid as WorkerId, workers[&cfg]))
        .collect()
}

/// Standalone coordinator oracle.
pub struct Coordinator {
    /// Configuration parameters.
    config: CoordConfig,

    /// WorkerReigner module.
    reigner: WorkerReigner,

    /// ClientReactor module.
    reactor: ClientReactor,

    /// Registered workers by configured id.
    workers: HashMap<WorkerId, WorkerNode>,

    /// Failure detector monitors by configured id, keyed with their
    /// session nonce so superseded monitors' notifications are discarded.
    monitors: HashMap<WorkerId, (FailMonitor, u64)>,

    /// Sender side of the failure notification channel, cloned into every
    /// monitor.
    tx_failure: mpsc::UnboundedSender<(WorkerId, u64)>,

    /// Receiver side of the failure notification channel.
    rx_failure: mpsc::UnboundedReceiver<(WorkerId, u64)>,

    /// A query admitted before any worker joined, parked until one does.
    pending_query: Option<(ClientId, Query)>,

    /// The active query, if any (one at a time).
    query: Option<QueryRun>,
}

impl Coordinator {
    /// Creates a new standalone coordinator and sets up the worker- and
    /// client-facing modules. `config_str` optionally overrides
    /// `CoordConfig` fields in TOML syntax.
    pub async fn new_and_setup(
        worker_addr: SocketAddr,
        client_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, SteppeError> {
        let config = parsed_config!(config_str => CoordConfig;
                                    lost_msgs_thresh,
                                    steps_between_checkpoints, max_steps,
                                    convergence_epsilon,
                                    heartbeat_interval_ms)?;
        if config.steps_between_checkpoints == 0 {
            return logged_err!("c"; "invalid steps_between_checkpoints 0");
        }
        if config.heartbeat_interval_ms == 0 {
            return logged_err!("c"; "invalid heartbeat_interval_ms 0");
        }

        let reigner = WorkerReigner::new_and_setup(worker_addr).await?;
        let reactor = ClientReactor::new_and_setup(client_addr).await?;
        let (tx_failure, rx_failure) = mpsc::unbounded_channel();

        Ok(Coordinator {
            config,
            reigner,
            reactor,
            workers: HashMap::new(),
            monitors: HashMap::new(),
            tx_failure,
            rx_failure,
            pending_query: None,
            query: None,
        })
    }

    /// Main event loop logic of the coordinator. Breaks out of the loop
    /// only upon catching a termination signal to the process.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), SteppeError> {
        loop {
            tokio::select! {
                // receiving worker control message
                ctrl_msg = self.reigner.recv_ctrl() => {
                    let (worker, msg) = match ctrl_msg {
                        Ok(ctrl_msg) => ctrl_msg,
                        Err(e) => {
                            pf_error!("c"; "error receiving ctrl msg: {}", e);
                            break;
                        }
                    };
                    if let Err(e) = self.handle_ctrl_msg(worker, msg).await {
                        pf_error!("c"; "error handling ctrl msg <- {}: {}",
                                       worker, e);
                    }
                },

                // receiving client query request
                req = self.reactor.recv_req() => {
                    let (client, req) = match req {
                        Ok(req) => req,
                        Err(e) => {
                            pf_error!("c"; "error receiving client req: {}", e);
                            break;
                        }
                    };
                    if let Err(e) = self.handle_client_req(client, req) {
                        pf_error!("c"; "error handling client req <- {}: {}",
                                       client, e);
                    }
                },

                // receiving worker failure notification
                failed = self.rx_failure.recv() => {
                    if let Some((worker, nonce)) = failed {
                        if let Err(e) =
                            self.handle_worker_failure(worker, nonce)
                        {
                            pf_error!("c"; "error handling failure of {}: {}",
                                           worker, e);
                        }
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("c"; "coordinator caught termination signal");
                    break;
                },
            }
        }

        Ok(())
    }
}

// Coordinator worker-initiated control message handlers
impl Coordinator {
    /// Dispatches one worker control message.
    async fn handle_ctrl_msg(
        &mut self,
        worker: WorkerId,
        msg: CtrlMsg,
    ) -> Result<(), SteppeError> {
        match msg {
            CtrlMsg::Join { node } => self.handle_join(worker, node).await,
            CtrlMsg::PartitionLoaded {
                logical_id,
                vertices,
            } => self.handle_partition_loaded(worker, logical_id, vertices),
            CtrlMsg::LoadFailed { reason } => {
                self.handle_load_failed(worker, reason)
            }
            CtrlMsg::StepDone(result) => self.handle_step_done(worker, result),
            CtrlMsg::CheckpointSaved { step } => {
                self.handle_checkpoint_saved(worker, step)
            }
            CtrlMsg::RevertDone { step } => {
                self.handle_revert_done(worker, step)
            }
            CtrlMsg::RevertFailed { step, reason } => {
                self.handle_revert_failed(worker, step, reason)
            }
            CtrlMsg::ValueCollected { vertex, value } => {
                self.handle_value_collected(worker, vertex, value)
            }
            _ => logged_err!("c"; "unexpected ctrl msg <- {}: {:?}",
                                  worker, msg),
        }
    }

    /// Handler of a worker's Join: record the node, begin monitoring it,
    /// and — if it is a recovered member of the active query — immediately
    /// hand it its recovery command. A worker unknown to the active query
    /// is registered for future queries only.
    async fn handle_join(
        &mut self,
        worker: WorkerId,
        node: WorkerNode,
    ) -> Result<(), SteppeError> {
        if node.config_id != worker {
            return logged_err!("c"; "join id mismatch: {} vs {}",
                                    node.config_id, worker);
        }
        pf_info!("c"; "worker {} joined from '{}'", worker, node.p2p_addr);

        self.workers.insert(worker, node);
        self.start_monitor(worker, &node).await?;

        let in_query = self
            .query
            .as_ref()
            .is_some_and(|run| run.config_ids().contains(&worker));
        if in_query {
            // recovered worker of the current query
            let expected = self
                .query
                .as_ref()
                .unwrap()
                .pending_rejoin
                .contains(&worker);
            if !expected {
                // it died and rejoined before the failure detector fired
                pf_warn!("c"; "worker {} rejoined unannounced", worker);
                self.initiate_rollback(worker)?;
            }

            let run = self.query.as_mut().unwrap();
            run.pending_rejoin.remove(&worker);
            let logical_id = run.logical_of(worker).unwrap();
            let command = match run.phase {
                QueryPhase::Loading { .. } => {
                    CtrlMsg::LoadPartition(run.context_for(logical_id))
                }
                _ => CtrlMsg::Revert {
                    checkpoint: run.last_checkpoint,
                    context: run.context_for(logical_id),
                },
            };
            pf_info!("c"; "recovering worker {} as logical {}",
                          worker, logical_id);
            self.reigner.send_ctrl(command, worker)?;
        } else if self.query.is_none() {
            if let Some((client, query)) = self.pending_query.take() {
                // a query was parked waiting for the first worker
                self.start_query(client, query)?;
            }
        }
        Ok(())
    }

    /// Handler of a worker's readiness reply: when every directory member
    /// has loaded, sum up `|V|` and enter the superstep loop at step 0.
    fn handle_partition_loaded(
        &mut self,
        worker: WorkerId,
        logical_id: WorkerId,
        vertices: Vec<VertexId>,
    ) -> Result<(), SteppeError> {
        let Some(run) = self.query.as_mut() else {
            return Ok(());
        };
        let QueryPhase::Loading { ready } = &mut run.phase else {
            pf_debug!("c"; "ignoring stale readiness from {}", worker);
            return Ok(());
        };

        ready.insert(logical_id, vertices.len() as u64);
        pf_info!("c"; "worker {} ready as logical {} with {} vertices",
                      worker, logical_id, vertices.len());

        if ready.len() == run.num_workers as usize {
            run.total_vertices = ready.values().sum();
            run.step = 0;
            pf_info!("c"; "all {} workers ready, {} vertices total",
                          run.num_workers, run.total_vertices);
            self.enter_step()?;
        }
        Ok(())
    }

    /// Handler of a worker's load failure: the query cannot proceed.
    fn handle_load_failed(
        &mut self,
        worker: WorkerId,
        reason: String,
    ) -> Result<(), SteppeError> {
        pf_error!("c"; "worker {} failed to load partition: {}",
                       worker, reason);
        if self.query.is_some() {
            self.finish_query(Err(format!("edge store: {}", reason)))?;
        }
        Ok(())
    }

    /// Handler of a worker's superstep barrier reply. Replies correlating
    /// to any other step (e.g. in-flight across a rollback) are discarded.
    fn handle_step_done(
        &mut self,
        worker: WorkerId,
        result: ProgressSuperStepResult,
    ) -> Result<(), SteppeError> {
        let Some(run) = self.query.as_mut() else {
            return Ok(());
        };
        if result.step != run.step {
            pf_debug!("c"; "discarding reply for step {} from {} (at {})",
                           result.step, worker, run.step);
            return Ok(());
        }
        let QueryPhase::Stepping {
            done,
            any_active,
            max_delta,
        } = &mut run.phase
        else {
            pf_debug!("c"; "discarding step reply from {} out of phase",
                           worker);
            return Ok(());
        };

        done.insert(worker);
        *any_active |= result.is_active;
        *max_delta = max_delta.max(result.max_delta);
        pf_debug!("c"; "worker {} done with step {} ({} msgs, active {})",
                       worker, result.step, result.messages_sent,
                       result.is_active);

        if done.len() == run.num_workers as usize {
            // the barrier for this superstep is complete
            let any_active = *any_active;
            let max_delta = *max_delta;
            let converged = run.query.query_type == QueryType::PageRank
                && self.config.convergence_epsilon > 0.0
                && run.step > 0
                && max_delta < self.config.convergence_epsilon;

            if !any_active || run.step >= self.config.max_steps || converged {
                pf_info!("c"; "halting after step {} (active {}, delta {})",
                              run.step, any_active, max_delta);
                run.phase = QueryPhase::Collecting;
                let vertex = run.query.result_vertex();
                let logical = home_worker(vertex, run.num_workers);
                let target = run.directory[&logical].config_id;
                self.reigner
                    .send_ctrl(CtrlMsg::CollectValue { vertex }, target)?;
            } else {
                run.step += 1;
                self.enter_step()?;
            }
        }
        Ok(())
    }

    /// Handler of a worker's checkpoint durability notification: a step
    /// becomes the global checkpoint once every directory member acked it.
    fn handle_checkpoint_saved(
        &mut self,
        worker: WorkerId,
        step: SuperStepId,
    ) -> Result<(), SteppeError> {
        let Some(run) = self.query.as_mut() else {
            return Ok(());
        };
        if !run.config_ids().contains(&worker) {
            return Ok(());
        }

        run.checkpoint_acks.entry(step).or_default().insert(worker);
        if run.checkpoint_acks[&step] == run.config_ids()
            && step > run.last_checkpoint
        {
            run.last_checkpoint = step;
            pf_info!("c"; "global checkpoint advanced to step {}", step);
        }
        Ok(())
    }

    /// Handler of a worker's rollback ack: once every directory member has
    /// applied the revert (and every lost member has rejoined), resume the
    /// superstep loop right after the checkpoint.
    fn handle_revert_done(
        &mut self,
        worker: WorkerId,
        step: SuperStepId,
    ) -> Result<(), SteppeError> {
        let Some(run) = self.query.as_mut() else {
            return Ok(());
        };
        if step != run.last_checkpoint {
            return Ok(());
        }
        let QueryPhase::Reverting { acked } = &mut run.phase else {
            return Ok(());
        };

        acked.insert(worker);
        if acked.len() == run.num_workers as usize
            && run.pending_rejoin.is_empty()
        {
            run.step = run.last_checkpoint + 1;
            pf_info!("c"; "rollback complete, resuming at step {}", run.step);
            self.enter_step()?;
        }
        Ok(())
    }

    /// Handler of a worker's rollback failure: without the checkpoint the
    /// query cannot be repaired.
    fn handle_revert_failed(
        &mut self,
        worker: WorkerId,
        step: SuperStepId,
        reason: String,
    ) -> Result<(), SteppeError> {
        pf_error!("c"; "worker {} failed to revert to step {}: {}",
                       worker, step, reason);
        if self.query.is_some() {
            self.finish_query(Err(reason))?;
        }
        Ok(())
    }

    /// Handler of the final value reply: translate it into the client's
    /// query result.
    fn handle_value_collected(
        &mut self,
        worker: WorkerId,
        vertex: VertexId,
        value: Option<Value>,
    ) -> Result<(), SteppeError> {
        let Some(run) = self.query.as_ref() else {
            return Ok(());
        };
        if !matches!(run.phase, QueryPhase::Collecting)
            || vertex != run.query.result_vertex()
        {
            pf_debug!("c"; "ignoring stray value from {}", worker);
            return Ok(());
        }

        let result = match run.query.query_type {
            // an absent or still-infinite destination means unreachable
            QueryType::ShortestPath => match value {
                Some(Value::Dist(d)) if d < INFINITE_DIST => {
                    Some(Value::Dist(d))
                }
                _ => None,
            },
            QueryType::PageRank => value,
        };
        self.finish_query(Ok(result))
    }
}

// Coordinator client request handlers
impl Coordinator {
    /// Handler of a client request. `StartQuery` before any worker has
    /// joined parks the query rather than erroring.
    fn handle_client_req(
        &mut self,
        client: ClientId,
        req: QueryRequest,
    ) -> Result<(), SteppeError> {
        match req {
            QueryRequest::Query(query) => {
                if let Err(e) = query.sanitize() {
                    return self.reply_error(client, query, e.to_string());
                }
                if self.query.is_some() || self.pending_query.is_some() {
                    return self.reply_error(
                        client,
                        query,
                        "another query is in progress".into(),
                    );
                }
                if self.workers.is_empty() {
                    pf_info!("c"; "no workers joined yet, parking query");
                    self.pending_query = Some((client, query));
                    Ok(())
                } else {
                    self.start_query(client, query)
                }
            }
            QueryRequest::Leave => {
                self.reactor.send_reply(QueryReply::Leave, client)
            }
        }
    }

    /// Admits a query: snapshot the registered worker set as the immutable
    /// directory, reset per-query state, and fan out partition loads.
    fn start_query(
        &mut self,
        client: ClientId,
        query: Query,
    ) -> Result<(), SteppeError> {
        let directory = assign_directory(&self.workers);
        let num_workers = directory.len() as u8;
        pf_info!("c"; "starting {:?} query over {} workers",
                      query.query_type, num_workers);

        let run = QueryRun {
            client,
            query,
            epoch: 0,
            num_workers,
            directory,
            total_vertices: 0,
            step: 0,
            last_checkpoint: 0,
            checkpoint_acks: HashMap::new(),
            pending_rejoin: HashSet::new(),
            phase: QueryPhase::Loading {
                ready: HashMap::new(),
            },
        };

        for (&logical_id, node) in &run.directory {
            if let Err(e) = self.reigner.send_ctrl(
                CtrlMsg::LoadPartition(run.context_for(logical_id)),
                node.config_id,
            ) {
                pf_error!("c"; "error fanning out load to {}: {}",
                               node.config_id, e);
            }
        }
        self.query = Some(run);
        Ok(())
    }

    /// Replies a failed query admission.
    fn reply_error(
        &mut self,
        client: ClientId,
        query: Query,
        error: String,
    ) -> Result<(), SteppeError> {
        self.reactor.send_reply(
            QueryReply::Done(QueryResult {
                query,
                result: None,
                error: Some(error),
            }),
            client,
        )
    }

    /// Concludes the active query, replying to its client and releasing
    /// the workers.
    fn finish_query(
        &mut self,
        outcome: Result<Option<Value>, String>,
    ) -> Result<(), SteppeError> {
        let run = self.query.take().unwrap();
        let (result, error) = match outcome {
            Ok(result) => (result, None),
            Err(error) => (None, Some(error)),
        };
        pf_info!("c"; "query finished, result {:?}, error {:?}",
                      result, error);

        self.reactor.send_reply(
            QueryReply::Done(QueryResult {
                query: run.query.clone(),
                result,
                error,
            }),
            run.client,
        )?;
        for node in run.directory.values() {
            let _ = self
                .reigner
                .send_ctrl(CtrlMsg::QueryComplete, node.config_id);
        }
        Ok(())
    }
}

// Coordinator superstep loop & failure handling
impl Coordinator {
    /// Fans out the compute command for the current superstep to every
    /// directory member and arms the barrier.
    fn enter_step(&mut self) -> Result<(), SteppeError> {
        let run = self.query.as_mut().unwrap();
        let is_checkpoint = run.step > 0
            && run.step % self.config.steps_between_checkpoints == 0;
        run.phase = QueryPhase::Stepping {
            done: HashSet::new(),
            any_active: false,
            max_delta: 0.0,
        };
        pf_debug!("c"; "fanning out superstep {} (checkpoint: {})",
                       run.step, is_checkpoint);

        let args = ProgressSuperStep {
            step: run.step,
            is_checkpoint,
            total_vertices: run.total_vertices,
        };
        for node in run.directory.values() {
            if let Err(e) = self
                .reigner
                .send_ctrl(CtrlMsg::Compute(args), node.config_id)
            {
                pf_error!("c"; "error fanning out step to {}: {}",
                               node.config_id, e);
            }
        }
        Ok(())
    }

    /// Handler of a failure detector notification. A lost worker outside
    /// the query directory is simply deregistered; a lost directory member
    /// triggers rollback to the last global checkpoint. Notifications from
    /// a monitor superseded by a rejoin are stale and ignored.
    fn handle_worker_failure(
        &mut self,
        worker: WorkerId,
        nonce: u64,
    ) -> Result<(), SteppeError> {
        match self.monitors.get(&worker) {
            Some(&(_, current)) if current == nonce => {}
            _ => {
                pf_debug!("c"; "ignoring stale failure of worker {}", worker);
                return Ok(());
            }
        }

        pf_warn!("c"; "worker {} lost", worker);
        if let Some((monitor, _)) = self.monitors.remove(&worker) {
            monitor.stop();
        }
        self.workers.remove(&worker);

        let in_query = self
            .query
            .as_ref()
            .is_some_and(|run| run.config_ids().contains(&worker));
        if in_query {
            self.initiate_rollback(worker)?;
        }
        Ok(())
    }

    /// Rolls the fleet back after losing `lost`: revert every other
    /// directory member to the last global checkpoint and wait (without
    /// timeout) for the lost worker to rejoin. With no checkpoint taken
    /// yet, the query instead restarts from partition loading.
    fn initiate_rollback(
        &mut self,
        lost: WorkerId,
    ) -> Result<(), SteppeError> {
        let run = self.query.as_mut().unwrap();
        run.pending_rejoin.insert(lost);

        if matches!(run.phase, QueryPhase::Reverting { .. }) {
            // already rolling back; the newly lost worker reverts at rejoin
            if let QueryPhase::Reverting { acked } = &mut run.phase {
                acked.remove(&lost);
            }
            return Ok(());
        }

        run.epoch += 1;
        let last = run.last_checkpoint;
        run.checkpoint_acks.retain(|&step, _| step <= last);

        let mut commands = vec![];
        if last == 0 {
            pf_warn!("c"; "no global checkpoint yet, restarting query");
            run.phase = QueryPhase::Loading {
                ready: HashMap::new(),
            };
            for (&logical_id, node) in &run.directory {
                if run.pending_rejoin.contains(&node.config_id) {
                    continue;
                }
                commands.push((
                    CtrlMsg::LoadPartition(run.context_for(logical_id)),
                    node.config_id,
                ));
            }
        } else {
            pf_warn!("c"; "rolling back to checkpoint at step {}", last);
            run.phase = QueryPhase::Reverting {
                acked: HashSet::new(),
            };
            for (&logical_id, node) in &run.directory {
                if run.pending_rejoin.contains(&node.config_id) {
                    continue;
                }
                commands.push((
                    CtrlMsg::Revert {
                        checkpoint: last,
                        context: run.context_for(logical_id),
                    },
                    node.config_id,
                ));
            }
        }

        for (command, target) in commands {
            if let Err(e) = self.reigner.send_ctrl(command, target) {
                pf_error!("c"; "error sending rollback to {}: {}", target, e);
            }
        }
        Ok(())
    }

    /// Starts (or replaces) the failure detector monitor for a worker.
    async fn start_monitor(
        &mut self,
        worker: WorkerId,
        node: &WorkerNode,
    ) -> Result<(), SteppeError> {
        let nonce: u64 = rand::random();
        let monitor = FailMonitor::start(
            "0.0.0.0:0".parse()?,
            nonce,
            node.fcheck_addr,
            self.config.lost_msgs_thresh,
            Duration::from_millis(self.config.heartbeat_interval_ms),
            worker,
            self.tx_failure.clone(),
        )
        .await?;
        if let Some((old, _)) = self.monitors.insert(worker, (monitor, nonce))
        {
            old.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod coord_tests {
    use super::*;

    #[test]
    fn parse_config_overlay() -> Result<(), SteppeError> {
        let config_str = Some("max_steps = 20\nlost_msgs_thresh = 3");
        let config = parsed_config!(config_str => CoordConfig;
                                    lost_msgs_thresh,
                                    steps_between_checkpoints, max_steps,
                                    convergence_epsilon,
                                    heartbeat_interval_ms)?;
        assert_eq!(config.max_steps, 20);
        assert_eq!(config.lost_msgs_thresh, 3);
        assert_eq!(
            config.steps_between_checkpoints,
            CoordConfig::default().steps_between_checkpoints
        );
        Ok(())
    }

    #[test]
    fn directory_assignment() {
        let node = |cfg: WorkerId| WorkerNode {
            config_id: cfg,
            p2p_addr: "127.0.0.1:1".parse().unwrap(),
            fcheck_addr: "127.0.0.1:2".parse().unwrap(),
        };
        let mut workers = HashMap::new();
        workers.insert(7, node(7));
        workers.insert(2, node(2));
        workers.insert(4, node(4));

        let directory = assign_directory(&workers);
        assert_eq!(directory.len(), 3);
        assert_eq!(directory[&0].config_id, 2);
        assert_eq!(directory[&1].config_id, 4);
        assert_eq!(directory[&2].config_id, 7);
    }
}
