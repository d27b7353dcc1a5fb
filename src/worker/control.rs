//! Worker-side coordinator control link module.

use std::net::SocketAddr;

use crate::coord::CtrlMsg;
use crate::graph::WorkerId;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, SteppeError,
};

use bytes::BytesMut;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The coordinator control message handler module.
pub(crate) struct ControlHub {
    /// My worker ID.
    pub(crate) me: WorkerId,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<CtrlMsg>,

    /// Sender side of the send channel.
    tx_send: mpsc::UnboundedSender<CtrlMsg>,

    /// Control messenger task join handle.
    control_messenger_handle: JoinHandle<()>,
}

// ControlHub public API implementation
impl ControlHub {
    /// Creates a new control message handler module by dialing the
    /// coordinator and identifying this worker by its configured id. Spawns
    /// the control messenger task. Failure to dial is fatal to the worker
    /// process.
    pub(crate) async fn new_and_setup(
        me: WorkerId,
        coord_addr: SocketAddr,
    ) -> Result<Self, SteppeError> {
        pf_debug!(me; "connecting to coordinator '{}'...", coord_addr);
        let mut stream = tcp_connect_with_retry(coord_addr, 10).await?;
        stream.write_u8(me).await?; // identify myself

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_send, rx_send) = mpsc::unbounded_channel();

        let control_messenger_handle = tokio::spawn(
            Self::control_messenger_task(me, stream, tx_recv, rx_send),
        );

        Ok(ControlHub {
            me,
            rx_recv,
            tx_send,
            control_messenger_handle,
        })
    }

    /// Waits for the next control event message from the coordinator.
    pub(crate) async fn recv_ctrl(&mut self) -> Result<CtrlMsg, SteppeError> {
        match self.rx_recv.recv().await {
            Some(msg) => Ok(msg),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }

    /// Sends a control message to the coordinator.
    pub(crate) fn send_ctrl(
        &mut self,
        msg: CtrlMsg,
    ) -> Result<(), SteppeError> {
        self.tx_send.send(msg).map_err(SteppeError::msg)
    }

    /// Terminates the control messenger task.
    pub(crate) fn shutdown(&self) {
        self.control_messenger_handle.abort();
    }
}

// ControlHub control_messenger task implementation
impl ControlHub {
    /// Reads a coordinator control message from the given TcpStream.
    async fn read_ctrl(
        // first 8 bytes being the message length, and the rest bytes being
        // the message itself
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

    /// Coordinator control message listener and sender task function.
    async fn control_messenger_task(
        me: WorkerId,
        conn: TcpStream,
        tx_recv: mpsc::UnboundedSender<CtrlMsg>,
        mut rx_send: mpsc::UnboundedReceiver<CtrlMsg>,
    ) {
        pf_debug!(me; "control_messenger task spawned");

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a message to send to the coordinator
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
                                    // pf_trace!(me; "sent ctrl {:?}", msg);
                                }
                                Ok(false) => {
                                    pf_debug!(me; "should start retrying ctrl send");
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!(me; "error sending ctrl: {}", e);
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
                            pf_debug!(me; "finished retrying last ctrl send");
                            retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!(me; "still should retry last ctrl send");
                        }
                        Err(e) => {
                            pf_error!(me; "error retrying last ctrl send: {}", e);
                        }
                    }
                },

                // receives control message from the coordinator
                msg = Self::read_ctrl(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            // pf_trace!(me; "recv ctrl {:?}", msg);
                            if let Err(e) = tx_recv.send(msg) {
                                pf_error!(me; "error sending to tx_recv: {}", e);
                            }
                        },
                        Err(_e) => {
                            break; // coordinator likely exited ungracefully
                        }
                    }
                }
            }
        }

        pf_debug!(me; "control_messenger task exited");
    }
}

// Unit tests are done together with `coord::reigner`.
