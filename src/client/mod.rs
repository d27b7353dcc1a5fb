//! Steppe client library: the query stub used by the client CLI.

use std::net::SocketAddr;

use crate::coord::{QueryReply, QueryRequest};
use crate::graph::{Query, QueryResult};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, SteppeError,
};

use bytes::BytesMut;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

/// Client ID type.
pub type ClientId = u64;

/// Client -> coordinator query API stub. Queries are synchronous: `query()`
/// blocks until the coordinator returns a result or a failure description.
pub struct QueryStub {
    /// My client ID, assigned by the coordinator.
    pub id: ClientId,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Request write buffer for deadlock avoidance.
    req_buf: BytesMut,

    /// Request write buffer cursor at first unwritten byte.
    req_buf_cursor: usize,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Reply read buffer for cancellation safety.
    reply_buf: BytesMut,
}

impl QueryStub {
    /// Creates a new query stub by connecting to the coordinator's client
    /// API address.
    pub async fn new_by_connect(
        coord_addr: SocketAddr,
    ) -> Result<Self, SteppeError> {
        let mut stream = tcp_connect_with_retry(coord_addr, 10).await?;
        let id = stream.read_u64().await?; // receive my client ID
        let (read_half, write_half) = stream.into_split();

        Ok(QueryStub {
            id,
            conn_write: write_half,
            req_buf: BytesMut::with_capacity(8 + 1024),
            req_buf_cursor: 0,
            conn_read: read_half,
            reply_buf: BytesMut::with_capacity(8 + 1024),
        })
    }

    /// Sends a request to the established coordinator connection, retrying
    /// on `WouldBlock`.
    fn send_req_insist(
        &mut self,
        req: &QueryRequest,
    ) -> Result<(), SteppeError> {
        let mut success = safe_tcp_write(
            &mut self.req_buf,
            &mut self.req_buf_cursor,
            &self.conn_write,
            Some(req),
        )?;
        while !success {
            success = safe_tcp_write::<QueryRequest, _>(
                &mut self.req_buf,
                &mut self.req_buf_cursor,
                &self.conn_write,
                None,
            )?;
        }
        Ok(())
    }

    /// Receives a reply from the established coordinator connection.
    async fn recv_reply(&mut self) -> Result<QueryReply, SteppeError> {
        safe_tcp_read(&mut self.reply_buf, &mut self.conn_read).await
    }

    /// Runs a query, blocking until its result (or failure) comes back.
    pub async fn query(
        &mut self,
        query: Query,
    ) -> Result<QueryResult, SteppeError> {
        query.sanitize()?;
        self.send_req_insist(&QueryRequest::Query(query))?;
        match self.recv_reply().await? {
            QueryReply::Done(result) => Ok(result),
            reply => {
                logged_err!(self.id; "unexpected query reply: {:?}", reply)
            }
        }
    }

    /// Notifies the coordinator that this client is leaving.
    pub async fn leave(&mut self) -> Result<(), SteppeError> {
        self.send_req_insist(&QueryRequest::Leave)?;
        match self.recv_reply().await? {
            QueryReply::Leave => Ok(()),
            reply => {
                logged_err!(self.id; "unexpected leave reply: {:?}", reply)
            }
        }
    }
}

// Unit tests are done together with `coord::reactor`.
