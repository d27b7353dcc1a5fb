//! Worker peer-to-peer TCP transport module.
//!
//! Carries vertex message batches between workers. TCP gives the effect of
//! "every batch a sender wants to send is eventually delivered exactly
//! once" to a live peer; a peer lost mid-delivery is repaired by the
//! coordinator's rollback, not by retries at this layer.
//!
//! The hub lives for the worker process lifetime and addresses peers by
//! their configured (restart-stable) worker id.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::graph::WorkerId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, SteppeError,
};

use bytes::BytesMut;

use serde::{de::DeserializeOwned, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Peer-to-peer transport module.
pub(crate) struct TransportHub<Msg> {
    /// My worker ID.
    me: WorkerId,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(WorkerId, Msg)>,

    /// Map from peer ID -> sender side of the send channel, shared with the
    /// peer acceptor task.
    tx_sends: flashmap::ReadHandle<WorkerId, mpsc::UnboundedSender<Msg>>,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(WorkerId, SocketAddr)>,

    /// Receiver side of the connack channel.
    rx_connack: mpsc::UnboundedReceiver<WorkerId>,

    /// Shutdown signal to the acceptor task (which aborts messengers).
    tx_shutdown: watch::Sender<bool>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a new peer-to-peer transport hub. Spawns the peer acceptor
    /// task. Creates a recv channel for listening on peers' messages.
    pub(crate) async fn new_and_setup(
        me: WorkerId,
        p2p_addr: SocketAddr,
    ) -> Result<Self, SteppeError> {
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();

        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<WorkerId, mpsc::UnboundedSender<Msg>>();

        // the connect & connack channels are used to ask the peer acceptor
        // task to proactively connect to some peer
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();

        let (tx_shutdown, rx_shutdown) = watch::channel(false);

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let mut acceptor = TransportHubAcceptorTask::new(
            me,
            tx_recv,
            peer_listener,
            tx_sends_write,
            rx_connect,
            tx_connack,
            rx_shutdown,
        );
        let peer_acceptor_handle =
            tokio::spawn(async move { acceptor.run().await });

        Ok(TransportHub {
            me,
            rx_recv,
            tx_sends: tx_sends_read,
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
            tx_shutdown,
        })
    }

    /// Connects to a peer worker proactively, spawning the corresponding
    /// messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: WorkerId,
        peer_addr: SocketAddr,
    ) -> Result<(), SteppeError> {
        self.tx_connect.send((id, peer_addr))?;
        match self.rx_connack.recv().await {
            Some(ack_id) if ack_id == id => Ok(()),
            Some(ack_id) => {
                logged_err!(self.me; "peer ID mismatch: expected {}, got {}",
                                     id, ack_id)
            }
            None => logged_err!(self.me; "connack channel closed"),
        }
    }

    /// Waits until enough peers are connected to me to form a group of the
    /// specified size.
    pub(crate) async fn wait_for_group(
        &self,
        group: u8,
    ) -> Result<(), SteppeError> {
        if group == 0 {
            return logged_err!(self.me; "invalid group size {}", group);
        }
        while self.current_peers().len() + 1 < group as usize {
            time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }

    /// Gets the set of currently connected peers.
    pub(crate) fn current_peers(&self) -> Vec<WorkerId> {
        let tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.keys().copied().collect()
    }

    /// Sends a message to a specified peer by sending to the send channel.
    /// A missing peer is silently skipped; the failure detector owns the
    /// consequences of a lost worker.
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        peer: WorkerId,
    ) -> Result<(), SteppeError> {
        let tx_sends_guard = self.tx_sends.guard();
        if let Some(tx_send) = tx_sends_guard.get(&peer) {
            tx_send.send(msg).map_err(SteppeError::msg)?;
        }
        Ok(())
    }

    /// Receives a message from some peer by receiving from the recv channel.
    /// Returns a pair of `(peer_id, msg)` on success.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(WorkerId, Msg), SteppeError> {
        match self.rx_recv.recv().await {
            Some((id, msg)) => Ok((id, msg)),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }

    /// Tears down the acceptor and every peer messenger task. The acceptor
    /// owns the messenger handles, so it must process the signal itself
    /// rather than be aborted.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx_shutdown.send(true);
    }
}

/// TransportHub peer acceptor task.
struct TransportHubAcceptorTask<Msg> {
    me: WorkerId,

    tx_recv: mpsc::UnboundedSender<(WorkerId, Msg)>,
    tx_sends: flashmap::WriteHandle<WorkerId, mpsc::UnboundedSender<Msg>>,

    peer_listener: TcpListener,
    peer_messenger_handles: HashMap<WorkerId, JoinHandle<()>>,

    rx_connect: mpsc::UnboundedReceiver<(WorkerId, SocketAddr)>,
    tx_connack: mpsc::UnboundedSender<WorkerId>,

    rx_shutdown: watch::Receiver<bool>,

    tx_exit: mpsc::UnboundedSender<WorkerId>,
    rx_exit: mpsc::UnboundedReceiver<WorkerId>,
}

impl<Msg> TransportHubAcceptorTask<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates the peer acceptor task.
    fn new(
        me: WorkerId,
        tx_recv: mpsc::UnboundedSender<(WorkerId, Msg)>,
        peer_listener: TcpListener,
        tx_sends: flashmap::WriteHandle<
            WorkerId,
            mpsc::UnboundedSender<Msg>,
        >,
        rx_connect: mpsc::UnboundedReceiver<(WorkerId, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<WorkerId>,
        rx_shutdown: watch::Receiver<bool>,
    ) -> Self {
        // create an exit mpsc channel for getting notified about termination
        // of peer messenger tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        TransportHubAcceptorTask {
            me,
            tx_recv,
            tx_sends,
            peer_listener,
            peer_messenger_handles: HashMap::new(),
            rx_connect,
            tx_connack,
            rx_shutdown,
            tx_exit,
            rx_exit,
        }
    }

    /// Installs a messenger task over an established peer connection.
    fn install_peer(&mut self, id: WorkerId, addr: SocketAddr, stream: TcpStream) {
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let mut tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.insert(id, tx_send);
        tx_sends_guard.publish();

        let mut messenger = TransportHubMessengerTask::new(
            self.me,
            id,
            addr,
            stream,
            rx_send,
            self.tx_recv.clone(),
            self.tx_exit.clone(),
        );
        let peer_messenger_handle =
            tokio::spawn(async move { messenger.run().await });
        self.peer_messenger_handles.insert(id, peer_messenger_handle);
    }

    /// Checks whether a peer slot is reusable, garbage collecting a dead
    /// connection's handles if so.
    fn check_peer_slot(&mut self, id: WorkerId) -> Result<(), SteppeError> {
        let mut tx_sends_guard = self.tx_sends.guard();
        if let Some(sender) = tx_sends_guard.get(&id) {
            if sender.is_closed() {
                // old connection of this peer died; garbage collect it now
                tx_sends_guard.remove(id);
                tx_sends_guard.publish();
                self.peer_messenger_handles.remove(&id);
            } else {
                return logged_err!(self.me; "duplicate peer ID: {}", id);
            }
        }
        Ok(())
    }

    /// Connects to a peer proactively.
    async fn connect_new_peer(
        &mut self,
        id: WorkerId,
        conn_addr: SocketAddr,
    ) -> Result<(), SteppeError> {
        pf_debug!(self.me; "connecting to peer {} '{}'...", id, conn_addr);
        // generous retrying: a lost peer may take a while to be restarted
        let mut stream = tcp_connect_with_retry(conn_addr, 50).await?;
        stream.write_u8(self.me).await?; // send my ID

        self.check_peer_slot(id)?;
        self.install_peer(id, conn_addr, stream);

        pf_debug!(self.me; "connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new peer connection.
    async fn accept_new_peer(
        &mut self,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), SteppeError> {
        let id = match stream.read_u8().await {
            Ok(id) => id,
            Err(e) => {
                return logged_err!(self.me; "error receiving peer ID: {}", e);
            }
        };

        self.check_peer_slot(id)?;
        self.install_peer(id, addr, stream);

        pf_debug!(self.me; "waited on peer {}", id);
        Ok(())
    }

    /// Removes handles of a left peer connection.
    fn remove_left_peer(&mut self, id: WorkerId) {
        let mut tx_sends_guard = self.tx_sends.guard();
        if tx_sends_guard.contains_key(&id) {
            tx_sends_guard.remove(id);
            tx_sends_guard.publish();
        }
        self.peer_messenger_handles.remove(&id);
    }

    /// Starts the peer acceptor task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_acceptor task spawned");

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = self.rx_connect.recv() => {
                    let (peer, conn_addr) = match to_connect {
                        Some(to_connect) => to_connect,
                        None => break, // channel closed, no messages remain
                    };
                    if let Err(e) = self.connect_new_peer(
                        peer,
                        conn_addr,
                    ).await {
                        pf_error!(self.me; "error connecting to new peer: {}", e);
                    } else if let Err(e) = self.tx_connack.send(peer) {
                        pf_error!(self.me; "error sending to tx_connack: {}", e);
                    }
                },

                // new peer connection accepted
                accepted = self.peer_listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!(self.me; "error accepting peer: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.accept_new_peer(stream, addr).await {
                        pf_error!(self.me; "error accepting new peer: {}", e);
                    }
                },

                // a peer messenger task exits
                id = self.rx_exit.recv() => {
                    if let Some(id) = id {
                        self.remove_left_peer(id);
                    }
                },

                // hub shutting down
                _ = self.rx_shutdown.changed() => {
                    for handle in self.peer_messenger_handles.values() {
                        handle.abort();
                    }
                    break;
                },
            }
        }

        pf_debug!(self.me; "peer_acceptor task exited");
    }
}

/// TransportHub per-peer messenger task.
struct TransportHubMessengerTask<Msg> {
    /// My worker ID.
    me: WorkerId,

    /// Corresponding peer's ID.
    id: WorkerId,
    /// Corresponding peer's address.
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    rx_send: mpsc::UnboundedReceiver<Msg>,
    read_buf: BytesMut,

    tx_recv: mpsc::UnboundedSender<(WorkerId, Msg)>,
    write_buf: BytesMut,
    write_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<WorkerId>,
}

// TransportHub peer_messenger task implementation
impl<Msg> TransportHubMessengerTask<Msg>
where
    Msg: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Creates a per-peer messenger task.
    fn new(
        me: WorkerId,
        id: WorkerId,
        addr: SocketAddr,
        conn: TcpStream,
        rx_send: mpsc::UnboundedReceiver<Msg>,
        tx_recv: mpsc::UnboundedSender<(WorkerId, Msg)>,
        tx_exit: mpsc::UnboundedSender<WorkerId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        TransportHubMessengerTask {
            me,
            id,
            addr,
            conn_read,
            conn_write,
            rx_send,
            read_buf: BytesMut::with_capacity(8 + 1024),
            tx_recv,
            write_buf: BytesMut::with_capacity(8 + 1024),
            write_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Writes a message through the given TcpStream write half.
    /// This is a non-method function to ease `tokio::select!` sharing.
    fn write_msg(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&Msg>,
    ) -> Result<bool, SteppeError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }

    /// Reads a message from the given TcpStream read half.
    /// This is a non-method function to ease `tokio::select!` sharing.
    async fn read_msg(
        // first 8 bytes being the message length, and the rest bytes being
        // the message itself
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<Msg, SteppeError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Starts a per-peer messenger task loop.
    async fn run(&mut self) {
        pf_debug!(self.me; "peer_messenger task for {} '{}' spawned",
                          self.id, self.addr);

        loop {
            tokio::select! {
                // gets a message to send out
                msg = self.rx_send.recv(), if !self.retrying => {
                    match msg {
                        Some(msg) => {
                            match Self::write_msg(
                                &mut self.write_buf,
                                &mut self.write_buf_cursor,
                                &self.conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {
                                    // pf_trace!(self.me; "sent -> {} msg {:?}",
                                    //                    self.id, msg);
                                }
                                Ok(false) => {
                                    pf_debug!(self.me;
                                              "should start retrying msg send -> {}",
                                              self.id);
                                    self.retrying = true;
                                }
                                Err(_e) => {
                                    // peer likely lost; let the read side
                                    // notice the broken stream
                                }
                            }
                        },
                        None => break, // channel closed, no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_msg(
                        &mut self.write_buf,
                        &mut self.write_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!(self.me;
                                      "finished retrying last msg send -> {}",
                                      self.id);
                            self.retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!(self.me;
                                      "still should retry last msg send -> {}",
                                      self.id);
                        }
                        Err(_e) => {}
                    }
                },

                // receives new message from peer
                msg = Self::read_msg(&mut self.read_buf, &mut self.conn_read) => {
                    match msg {
                        Ok(msg) => {
                            // pf_trace!(self.me; "recv <- {} msg {:?}",
                            //                    self.id, msg);
                            if let Err(e) = self.tx_recv.send((self.id, msg)) {
                                pf_error!(self.me;
                                          "error sending to tx_recv for {}: {}",
                                          self.id, e);
                            }
                        },
                        Err(_e) => {
                            break; // probably the peer exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!(self.me; "error sending exit signal for {}: {}",
                              self.id, e);
        }
        pf_debug!(self.me; "peer_messenger task for {} '{}' exited",
                          self.id, self.addr);
    }
}
