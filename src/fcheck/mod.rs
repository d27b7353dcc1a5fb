//! UDP heartbeat failure detector.
//!
//! A monitor sends heartbeats to a remote ack responder on a fixed interval
//! while a hearing timer tracks ack silence; the timer is reset by every
//! valid ack and sized so that it explodes exactly when more than the
//! configured threshold of consecutive heartbeats has gone unanswered. On
//! explosion the monitor emits the monitored peer's id once on the notify
//! channel and stops. Epoch nonces distinguish a restarted peer from the
//! original: the monitor pins the responder nonce carried by the first ack
//! it sees and ignores acks carrying any other nonce.

use std::net::SocketAddr;

use crate::graph::WorkerId;
use crate::utils::{SteppeError, Timer};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Epoch nonce type, renewed on every process start.
pub type EpochNonce = u64;

/// Heartbeat sequence number type.
pub type SeqNum = u64;

/// Failure detector wire datagram.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
enum FcheckMsg {
    /// Monitor -> responder probe; `epoch` is the monitoring session's nonce.
    Heartbeat { epoch: EpochNonce, seq: SeqNum },

    /// Responder -> monitor reply; echoes the heartbeat's `seq` and carries
    /// the responder's own process-lifetime nonce in `epoch`.
    Ack { epoch: EpochNonce, seq: SeqNum },
}

/// Monitor side of the failure detector, watching one remote responder.
pub struct FailMonitor {
    /// Join handle of the monitor task.
    monitor_handle: JoinHandle<()>,
}

impl FailMonitor {
    /// Starts monitoring `remote_addr` from a socket bound at `local_addr`
    /// (typically with port 0). Emits `(peer, epoch)` once on `tx_notify`
    /// when more than `lost_thresh` consecutive heartbeats go unacked, then
    /// stops. The echoed `epoch` lets a receiver discard notifications from
    /// a superseded monitoring session.
    pub async fn start(
        local_addr: SocketAddr,
        epoch: EpochNonce,
        remote_addr: SocketAddr,
        lost_thresh: u8,
        interval: Duration,
        peer: WorkerId,
        tx_notify: mpsc::UnboundedSender<(WorkerId, EpochNonce)>,
    ) -> Result<Self, SteppeError> {
        if interval.is_zero() {
            return logged_err!(peer; "invalid heartbeat interval");
        }

        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(remote_addr).await?;

        let monitor_handle = tokio::spawn(Self::monitor_task(
            socket, epoch, lost_thresh, interval, peer, tx_notify,
        ));

        Ok(FailMonitor { monitor_handle })
    }

    /// Cancels the monitor. No notification will be emitted after this.
    pub fn stop(&self) {
        self.monitor_handle.abort();
    }

    /// Monitor task: probe on every send tick; the hearing timer explodes
    /// once ack silence covers more than `lost_thresh` consecutive
    /// heartbeats.
    async fn monitor_task(
        socket: UdpSocket,
        epoch: EpochNonce,
        lost_thresh: u8,
        interval: Duration,
        peer: WorkerId,
        tx_notify: mpsc::UnboundedSender<(WorkerId, EpochNonce)>,
    ) {
        pf_debug!(peer; "fcheck monitor task spawned");

        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // silence for this long means more than lost_thresh consecutive
        // heartbeats went unanswered
        let hear_timeout = interval * (lost_thresh as u32 + 1);
        let hear_timer = Timer::new();
        if let Err(e) = hear_timer.kickoff(hear_timeout) {
            pf_error!(peer; "error kicking off hear timer: {}", e);
            return;
        }

        let mut seq: SeqNum = 0;
        let mut peer_epoch: Option<EpochNonce> = None;
        let mut buf = [0u8; 64];

        loop {
            tokio::select! {
                // hearing timeout exploded
                () = hear_timer.timeout() => {
                    pf_warn!(peer; "no ack heard for {:?}, \
                                    declaring peer failed", hear_timeout);
                    if let Err(e) = tx_notify.send((peer, epoch)) {
                        pf_error!(peer; "error sending to tx_notify: {}", e);
                    }
                    break;
                },

                // a sending tick
                _ = ticker.tick() => {
                    seq += 1;
                    let hb = FcheckMsg::Heartbeat { epoch, seq };
                    match encode_to_vec(&hb) {
                        // send failures read as silence at the hear timer
                        Ok(bytes) => {
                            let _ = socket.send(&bytes).await;
                        }
                        Err(e) => {
                            pf_error!(peer; "error encoding heartbeat: {}", e);
                        }
                    }
                },

                // an ack coming back
                nread = socket.recv(&mut buf) => {
                    let nread = match nread {
                        Ok(n) => n,
                        Err(_) => continue, // e.g. ICMP port unreachable
                    };
                    if let Ok(FcheckMsg::Ack { epoch: ack_epoch, seq: ack_seq }) =
                        decode_from_slice(&buf[..nread])
                    {
                        match peer_epoch {
                            None => peer_epoch = Some(ack_epoch),
                            Some(pinned) if pinned != ack_epoch => {
                                // a restarted peer is not the peer we watch
                                pf_debug!(peer; "ignoring ack with epoch {:x}",
                                                ack_epoch);
                                continue;
                            }
                            _ => {}
                        }
                        if ack_seq == seq {
                            if let Err(e) = hear_timer.kickoff(hear_timeout) {
                                pf_error!(peer; "error restarting hear timer: {}",
                                                e);
                            }
                        }
                    }
                },
            }
        }

        pf_debug!(peer; "fcheck monitor task exited");
    }
}

/// Responder side of the failure detector, acking heartbeats so that this
/// process can be monitored by its counterpart.
pub struct AckResponder {
    /// Join handle of the responder task.
    responder_handle: JoinHandle<()>,
}

impl AckResponder {
    /// Starts the ack responder on `bind_addr`. `epoch` should be a nonce
    /// freshly drawn at process start.
    pub async fn start(
        bind_addr: SocketAddr,
        epoch: EpochNonce,
    ) -> Result<Self, SteppeError> {
        let socket = UdpSocket::bind(bind_addr).await?;

        let responder_handle =
            tokio::spawn(Self::responder_task(socket, epoch));

        Ok(AckResponder { responder_handle })
    }

    /// Terminates the responder; heartbeats will go unacked afterward.
    pub fn stop(&self) {
        self.responder_handle.abort();
    }

    /// Responder task: echo every heartbeat's seq, stamped with my nonce.
    async fn responder_task(socket: UdpSocket, epoch: EpochNonce) {
        let mut buf = [0u8; 64];
        loop {
            let (nread, from) = match socket.recv_from(&mut buf).await {
                Ok(recved) => recved,
                Err(_) => continue,
            };
            if let Ok(FcheckMsg::Heartbeat { seq, .. }) =
                decode_from_slice(&buf[..nread])
            {
                let ack = FcheckMsg::Ack { epoch, seq };
                if let Ok(bytes) = encode_to_vec(&ack) {
                    let _ = socket.send_to(&bytes, from).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod fcheck_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn responder_echoes_seq() -> Result<(), SteppeError> {
        let responder =
            AckResponder::start("127.0.0.1:31800".parse()?, 0xbeef).await?;

        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        socket.connect("127.0.0.1:31800").await?;
        let hb = FcheckMsg::Heartbeat {
            epoch: 0x1234,
            seq: 42,
        };
        socket.send(&encode_to_vec(&hb)?).await?;

        let mut buf = [0u8; 64];
        let nread = socket.recv(&mut buf).await?;
        let ack: FcheckMsg = decode_from_slice(&buf[..nread])?;
        assert_eq!(
            ack,
            FcheckMsg::Ack {
                epoch: 0xbeef,
                seq: 42
            }
        );

        responder.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn monitor_detects_silence() -> Result<(), SteppeError> {
        // nothing listens on the remote port
        let (tx_notify, mut rx_notify) = mpsc::unbounded_channel();
        let _monitor = FailMonitor::start(
            "127.0.0.1:0".parse()?,
            7777,
            "127.0.0.1:31801".parse()?,
            2,
            Duration::from_millis(30),
            5,
            tx_notify,
        )
        .await?;

        let notified = time::timeout(Duration::from_secs(2), rx_notify.recv())
            .await
            .expect("failure notification should fire");
        assert_eq!(notified, Some((5, 7777)));
        // one-shot: channel closes after the single emission
        assert_eq!(rx_notify.recv().await, None);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn monitor_alive_peer() -> Result<(), SteppeError> {
        let responder =
            AckResponder::start("127.0.0.1:31802".parse()?, 0xaaaa).await?;

        let (tx_notify, mut rx_notify) = mpsc::unbounded_channel();
        let monitor = FailMonitor::start(
            "127.0.0.1:0".parse()?,
            8888,
            "127.0.0.1:31802".parse()?,
            2,
            Duration::from_millis(30),
            3,
            tx_notify,
        )
        .await?;

        time::sleep(Duration::from_millis(500)).await;
        assert!(rx_notify.try_recv().is_err());

        monitor.stop();
        responder.stop();
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn monitor_restarted_peer() -> Result<(), SteppeError> {
        let responder =
            AckResponder::start("127.0.0.1:31803".parse()?, 0x0001).await?;

        let (tx_notify, mut rx_notify) = mpsc::unbounded_channel();
        let _monitor = FailMonitor::start(
            "127.0.0.1:0".parse()?,
            9999,
            "127.0.0.1:31803".parse()?,
            2,
            Duration::from_millis(30),
            1,
            tx_notify,
        )
        .await?;

        // let the monitor pin the original responder epoch
        time::sleep(Duration::from_millis(200)).await;
        assert!(rx_notify.try_recv().is_err());

        // "restart" the responder under a fresh nonce; its acks must now be
        // ignored and the peer declared failed
        responder.stop();
        time::sleep(Duration::from_millis(50)).await;
        let restarted =
            AckResponder::start("127.0.0.1:31803".parse()?, 0x0002).await?;

        let notified = time::timeout(Duration::from_secs(2), rx_notify.recv())
            .await
            .expect("restarted peer should read as failed");
        assert_eq!(notified, Some((1, 9999)));

        restarted.stop();
        Ok(())
    }
}
