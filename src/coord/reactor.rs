//! Coordinator client-facing reactor module.

use std::net::SocketAddr;

use crate::client::ClientId;
use crate::graph::{Query, QueryResult};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, SteppeError,
};

use bytes::BytesMut;

use serde::{Deserialize, Serialize};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Request from client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum QueryRequest {
    /// Run a graph query; blocks until the computation finishes or fails.
    Query(Query),

    /// Client leave notification.
    Leave,
}

/// Reply back to client.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum QueryReply {
    /// Outcome of a query.
    Done(QueryResult),

    /// Reply to client leave notification.
    Leave,
}

/// The client-facing reactor API module.
pub(crate) struct ClientReactor {
    /// Receiver side of the req channel.
    rx_req: mpsc::UnboundedReceiver<(ClientId, QueryRequest)>,

    /// Map from client ID -> sender side of the reply channel, shared with
    /// the client acceptor task.
    tx_replies:
        flashmap::ReadHandle<ClientId, mpsc::UnboundedSender<QueryReply>>,

    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,
}

// ClientReactor public API implementation
impl ClientReactor {
    /// Creates a new client-facing reactor module and spawns the client
    /// acceptor task. Creates a req channel for buffering incoming query
    /// requests.
    pub(crate) async fn new_and_setup(
        cli_addr: SocketAddr,
    ) -> Result<Self, SteppeError> {
        let (tx_req, rx_req) = mpsc::unbounded_channel();

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ClientId, mpsc::UnboundedSender<QueryReply>>();

        let client_listener = tcp_bind_with_retry(cli_addr, 10).await?;
        let client_acceptor_handle = tokio::spawn(Self::client_acceptor_task(
            tx_req,
            client_listener,
            tx_replies_write,
        ));

        Ok(ClientReactor {
            rx_req,
            tx_replies: tx_replies_read,
            _client_acceptor_handle: client_acceptor_handle,
        })
    }

    /// Waits for the next query request from some client.
    pub(crate) async fn recv_req(
        &mut self,
    ) -> Result<(ClientId, QueryRequest), SteppeError> {
        match self.rx_req.recv().await {
            Some((id, req)) => Ok((id, req)),
            None => logged_err!("c"; "req channel has been closed"),
        }
    }

    /// Sends a reply to a specified client.
    pub(crate) fn send_reply(
        &mut self,
        reply: QueryReply,
        client: ClientId,
    ) -> Result<(), SteppeError> {
        let tx_replies_guard = self.tx_replies.guard();
        match tx_replies_guard.get(&client) {
            Some(tx_reply) => {
                tx_reply.send(reply).map_err(SteppeError::msg)?;
                Ok(())
            }
            None => {
                logged_err!("c"; "client ID {} not found among active ones",
                                 client)
            }
        }
    }
}

// ClientReactor client_acceptor task implementation
impl ClientReactor {
    /// Accepts a new client connection, assigning a fresh client ID.
    async fn accept_new_client(
        mut stream: TcpStream,
        addr: SocketAddr,
        id: ClientId,
        tx_req: mpsc::UnboundedSender<(ClientId, QueryRequest)>,
        tx_replies: &mut flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<QueryReply>,
        >,
        client_servant_handles: &mut std::collections::HashMap<
            ClientId,
            JoinHandle<()>,
        >,
        tx_exit: mpsc::UnboundedSender<ClientId>,
    ) -> Result<(), SteppeError> {
        // send ID assignment
        if let Err(e) = stream.write_u64(id).await {
            return logged_err!("c"; "error assigning new client ID: {}", e);
        }

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        let mut tx_replies_guard = tx_replies.guard();
        tx_replies_guard.insert(id, tx_reply);
        tx_replies_guard.publish();

        let client_servant_handle = tokio::spawn(Self::client_servant_task(
            id, addr, stream, tx_req, rx_reply, tx_exit,
        ));
        client_servant_handles.insert(id, client_servant_handle);

        pf_debug!("c"; "accepted new client {}", id);
        Ok(())
    }

    /// Removes handles of a left client connection.
    fn remove_left_client(
        id: ClientId,
        tx_replies: &mut flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<QueryReply>,
        >,
        client_servant_handles: &mut std::collections::HashMap<
            ClientId,
            JoinHandle<()>,
        >,
    ) {
        let mut tx_replies_guard = tx_replies.guard();
        if tx_replies_guard.contains_key(&id) {
            tx_replies_guard.remove(id);
            tx_replies_guard.publish();
        }
        client_servant_handles.remove(&id);
    }

    /// Client acceptor task function.
    async fn client_acceptor_task(
        tx_req: mpsc::UnboundedSender<(ClientId, QueryRequest)>,
        client_listener: TcpListener,
        mut tx_replies: flashmap::WriteHandle<
            ClientId,
            mpsc::UnboundedSender<QueryReply>,
        >,
    ) {
        pf_debug!("c"; "client_acceptor task spawned");

        let local_addr = client_listener.local_addr().unwrap();
        pf_info!("c"; "accepting clients on '{}'", local_addr);

        let mut client_servant_handles = std::collections::HashMap::new();

        // maintain a monotonically increasing client ID for new clients;
        // start high to avoid confusion with worker IDs in the logs
        let mut next_client_id: ClientId = 2857;

        // create an exit mpsc channel for getting notified about termination
        // of client servant tasks
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                // new client connection accepted
                accepted = client_listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!("c"; "error accepting client: {}", e);
                            continue;
                        }
                    };
                    let id = next_client_id;
                    next_client_id += 1;
                    if let Err(e) = Self::accept_new_client(
                        stream,
                        addr,
                        id,
                        tx_req.clone(),
                        &mut tx_replies,
                        &mut client_servant_handles,
                        tx_exit.clone(),
                    ).await {
                        pf_error!("c"; "error accepting new client: {}", e);
                    }
                },

                // a client servant task exits
                id = rx_exit.recv() => {
                    if let Some(id) = id {
                        Self::remove_left_client(
                            id,
                            &mut tx_replies,
                            &mut client_servant_handles,
                        );
                    }
                },
            }
        }
    }

    /// Per-client servant task function.
    async fn client_servant_task(
        id: ClientId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_req: mpsc::UnboundedSender<(ClientId, QueryRequest)>,
        mut rx_reply: mpsc::UnboundedReceiver<QueryReply>,
        tx_exit: mpsc::UnboundedSender<ClientId>,
    ) {
        pf_debug!("c"; "client_servant task for {} '{}' spawned", id, addr);

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a reply to send back to this client
                reply = rx_reply.recv(), if !retrying => {
                    match reply {
                        Some(reply) => {
                            let is_leave = reply == QueryReply::Leave;
                            match Self::write_reply(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&reply),
                            ) {
                                Ok(true) => {
                                    if is_leave {
                                        break;
                                    }
                                }
                                Ok(false) => {
                                    pf_debug!("c"; "should start retrying reply send -> {}", id);
                                    retrying = true;
                                }
                                Err(_e) => {}
                            }
                        },
                        None => break, // channel closed, no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match Self::write_reply(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            retrying = false;
                        }
                        Ok(false) => {}
                        Err(_e) => {}
                    }
                },

                // receives request from this client
                req = Self::read_req(&mut read_buf, &mut conn_read) => {
                    match req {
                        Ok(req) => {
                            if let Err(e) = tx_req.send((id, req)) {
                                pf_error!("c"; "error sending to tx_req for {}: {}",
                                               id, e);
                            }
                        },
                        Err(_e) => {
                            break; // probably the client exited
                        }
                    }
                }
            }
        }

        if let Err(e) = tx_exit.send(id) {
            pf_error!("c"; "error sending exit signal for {}: {}", id, e);
        }
        pf_debug!("c"; "client_servant task for {} '{}' exited", id, addr);
    }

    /// Reads a client request from the given TcpStream.
    async fn read_req(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<QueryRequest, SteppeError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Writes a reply through the given TcpStream.
    fn write_reply(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        reply: Option<&QueryReply>,
    ) -> Result<bool, SteppeError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }
}

#[cfg(test)]
mod reactor_tests {
    use super::*;
    use crate::client::QueryStub;
    use crate::graph::{QueryType, Value};
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn test_query() -> Query {
        Query {
            client: "tester".into(),
            query_type: QueryType::ShortestPath,
            nodes: vec![1, 3],
            graph: "/tmp/graph.db".into(),
            table: "graph".into(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn api_query_roundtrip() -> Result<(), SteppeError> {
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = barrier.clone();
        tokio::spawn(async move {
            // client side
            barrier1.wait().await;
            let mut stub =
                QueryStub::new_by_connect("127.0.0.1:30300".parse()?).await?;
            let result = stub.query(test_query()).await?;
            assert_eq!(result.result, Some(Value::Dist(2)));
            assert_eq!(result.error, None);
            stub.leave().await?;
            Ok::<(), SteppeError>(())
        });
        // coordinator side
        let mut reactor =
            ClientReactor::new_and_setup("127.0.0.1:30300".parse()?).await?;
        barrier.wait().await;
        let (client, req) = reactor.recv_req().await?;
        assert_eq!(req, QueryRequest::Query(test_query()));
        reactor.send_reply(
            QueryReply::Done(QueryResult {
                query: test_query(),
                result: Some(Value::Dist(2)),
                error: None,
            }),
            client,
        )?;
        let (_, req) = reactor.recv_req().await?;
        assert_eq!(req, QueryRequest::Leave);
        reactor.send_reply(QueryReply::Leave, client)?;
        Ok(())
    }
}
