//! Heartbeats: liveness of the level above.
//!
//! Leaders announce themselves with small JSON datagrams sent to a
//! multicast or broadcast address. Members run a [`HeartbeatReceiver`]
//! that decodes datagrams into a channel, and a [`HeartbeatHandler`] that
//! watches the channel. When the leader goes silent for longer than the
//! timeout, or a different identity starts announcing, the handler invokes
//! its failure callback once, tears the listener down, and returns the
//! failure. Rejoining or re-electing is up to the caller.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hive_core::ListenSettings;

use crate::error::{ClusterError, ClusterResult};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Wire message announced by a leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub identifier: String,
    pub listen_settings: ListenSettings,
    /// Where the announcer's own members should listen for it.
    pub heartbeat_address: String,
}

impl HeartbeatMessage {
    pub fn new(identifier: &str, listen_settings: ListenSettings, heartbeat_address: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            listen_settings,
            heartbeat_address: heartbeat_address.to_string(),
        }
    }

    pub fn encode(&self) -> ClusterResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> ClusterResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn parse_address(address: &str) -> ClusterResult<SocketAddr> {
    address
        .parse()
        .map_err(|_| ClusterError::InvalidAddress(address.to_string()))
}

/// Periodically sends one heartbeat message to a fixed address.
pub struct HeartbeatAnnouncer {
    message: HeartbeatMessage,
    target: SocketAddr,
    interval: Duration,
}

impl HeartbeatAnnouncer {
    pub fn new(message: HeartbeatMessage, target: &str, interval: Duration) -> ClusterResult<Self> {
        Ok(Self {
            message,
            target: parse_address(target)?,
            interval,
        })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Announce until shutdown. Send errors are logged and retried on the
    /// next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ClusterResult<()> {
        let bind: SocketAddr = if self.target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        if self.target.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        let payload = self.message.encode()?;
        let mut ticker = tokio::time::interval(self.interval);

        info!(
            identifier = %self.message.identifier,
            target = %self.target,
            interval = ?self.interval,
            "heartbeat announcer started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match socket.send_to(&payload, self.target).await {
                        Ok(_) => debug!(target = %self.target, "heartbeat sent"),
                        Err(e) => warn!(target = %self.target, error = %e, "heartbeat send failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!(identifier = %self.message.identifier, "heartbeat announcer stopping");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Listening side: a UDP socket whose datagrams are decoded into a channel.
pub struct HeartbeatReceiver {
    socket: UdpSocket,
}

impl HeartbeatReceiver {
    pub async fn bind(address: &str) -> ClusterResult<Self> {
        let address = parse_address(address)?;
        let socket = UdpSocket::bind(address).await?;
        Ok(Self { socket })
    }

    pub fn join_multicast(&self, group: Ipv4Addr) -> ClusterResult<()> {
        self.socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        Ok(())
    }

    pub fn local_addr(&self) -> ClusterResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Start the reader task. It stops on shutdown or once the returned
    /// receiver is closed or dropped. Malformed datagrams are dropped.
    pub fn spawn(
        self,
        capacity: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<HeartbeatMessage>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    received = self.socket.recv_from(&mut buf) => match received {
                        Ok((len, from)) => match HeartbeatMessage::decode(&buf[..len]) {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!(%from, error = %e, "dropping malformed heartbeat"),
                        },
                        Err(e) => warn!(error = %e, "heartbeat receive failed"),
                    },
                    _ = tx.closed() => break,
                    _ = shutdown.changed() => break,
                }
            }
            debug!("heartbeat listener torn down");
        });
        (rx, handle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeartbeatFailure {
    #[error("no heartbeat from {} for {silence:?}", .identifier.as_deref().unwrap_or("any leader"))]
    Timeout {
        identifier: Option<String>,
        silence: Duration,
    },

    #[error("expected heartbeats from {expected}, received from {received}")]
    IdentityMismatch { expected: String, received: String },

    #[error("heartbeat listener closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Shutdown,
    Failed(HeartbeatFailure),
}

pub type FailureCallback = Box<dyn FnOnce(&HeartbeatFailure) + Send>;
pub type HeartbeatCallback = Box<dyn FnMut(&HeartbeatMessage) + Send>;

/// Failure detector for a single leader.
pub struct HeartbeatHandler {
    expected: Option<String>,
    timeout: Duration,
    on_failure: Option<FailureCallback>,
    on_heartbeat: Option<HeartbeatCallback>,
}

impl HeartbeatHandler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            expected: None,
            timeout,
            on_failure: None,
            on_heartbeat: None,
        }
    }

    /// Only accept heartbeats from `identifier`. Without this the first
    /// sender heard is adopted.
    pub fn expecting(mut self, identifier: &str) -> Self {
        self.expected = Some(identifier.to_string());
        self
    }

    pub fn on_failure(mut self, callback: impl FnOnce(&HeartbeatFailure) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    pub fn on_heartbeat(mut self, callback: impl FnMut(&HeartbeatMessage) + Send + 'static) -> Self {
        self.on_heartbeat = Some(Box::new(callback));
        self
    }

    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<HeartbeatMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> HeartbeatOutcome {
        let mut deadline = Instant::now() + self.timeout;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    messages.close();
                    return HeartbeatOutcome::Shutdown;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let failure = HeartbeatFailure::Timeout {
                        identifier: self.expected.clone(),
                        silence: self.timeout,
                    };
                    return self.fail(failure, &mut messages);
                }
                received = messages.recv() => {
                    let Some(message) = received else {
                        return self.fail(HeartbeatFailure::Closed, &mut messages);
                    };
                    match &self.expected {
                        Some(expected) if *expected != message.identifier => {
                            let failure = HeartbeatFailure::IdentityMismatch {
                                expected: expected.clone(),
                                received: message.identifier.clone(),
                            };
                            return self.fail(failure, &mut messages);
                        }
                        Some(_) => {}
                        None => {
                            info!(leader = %message.identifier, "following heartbeat source");
                            self.expected = Some(message.identifier.clone());
                        }
                    }
                    deadline = Instant::now() + self.timeout;
                    if let Some(callback) = self.on_heartbeat.as_mut() {
                        callback(&message);
                    }
                }
            }
        }
    }

    fn fail(
        &mut self,
        failure: HeartbeatFailure,
        messages: &mut mpsc::Receiver<HeartbeatMessage>,
    ) -> HeartbeatOutcome {
        messages.close();
        warn!(%failure, "heartbeat failure detected");
        if let Some(callback) = self.on_failure.take() {
            callback(&failure);
        }
        HeartbeatOutcome::Failed(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(id: &str) -> HeartbeatMessage {
        HeartbeatMessage::new(
            id,
            ListenSettings {
                control_data_address: format!("{id}:9000"),
                monitoring_data_address: format!("{id}:9001"),
            },
            "239.0.0.1:9500",
        )
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(&HeartbeatFailure) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move |_: &HeartbeatFailure| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn message_wire_format() {
        let bytes = message("gl-1").encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["identifier"], "gl-1");
        assert_eq!(json["listen_settings"]["control_data_address"], "gl-1:9000");
        assert_eq!(HeartbeatMessage::decode(&bytes).unwrap(), message("gl-1"));
        assert!(HeartbeatMessage::decode(b"not json").is_err());
    }

    #[tokio::test]
    async fn silence_triggers_timeout_once() {
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (failures, on_failure) = counter();

        tx.send(message("gl-1")).await.unwrap();
        let outcome = HeartbeatHandler::new(Duration::from_millis(80))
            .on_failure(on_failure)
            .run(rx, shutdown_rx)
            .await;

        assert!(matches!(
            outcome,
            HeartbeatOutcome::Failed(HeartbeatFailure::Timeout { identifier: Some(ref id), .. }) if id == "gl-1"
        ));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn new_identity_is_a_failure() {
        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (failures, on_failure) = counter();

        tx.send(message("gl-1")).await.unwrap();
        tx.send(message("gl-2")).await.unwrap();
        let outcome = HeartbeatHandler::new(Duration::from_secs(5))
            .expecting("gl-1")
            .on_failure(on_failure)
            .run(rx, shutdown_rx)
            .await;

        assert_eq!(
            outcome,
            HeartbeatOutcome::Failed(HeartbeatFailure::IdentityMismatch {
                expected: "gl-1".into(),
                received: "gl-2".into(),
            })
        );
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_is_not_a_failure() {
        let (_tx, rx) = mpsc::channel::<HeartbeatMessage>(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (failures, on_failure) = counter();

        let handle = tokio::spawn(
            HeartbeatHandler::new(Duration::from_secs(5))
                .on_failure(on_failure)
                .run(rx, shutdown_rx),
        );
        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), HeartbeatOutcome::Shutdown);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn announcer_feeds_receiver_over_udp() {
        let receiver = HeartbeatReceiver::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (announcer_tx, announcer_rx) = watch::channel(false);

        let (messages, reader) = receiver.spawn(16, shutdown_rx.clone());
        let announcer =
            HeartbeatAnnouncer::new(message("gl-1"), &target, Duration::from_millis(20)).unwrap();
        let announcing = tokio::spawn(announcer.run(announcer_rx));

        let beats = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&beats);
        let handler = tokio::spawn(
            HeartbeatHandler::new(Duration::from_millis(300))
                .on_heartbeat(move |m| {
                    assert_eq!(m.identifier, "gl-1");
                    seen.fetch_add(1, Ordering::SeqCst);
                })
                .run(messages, shutdown_rx),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(beats.load(Ordering::SeqCst) >= 2);

        announcer_tx.send(true).unwrap();
        announcing.await.unwrap().unwrap();
        let outcome = handler.await.unwrap();
        assert!(matches!(outcome, HeartbeatOutcome::Failed(HeartbeatFailure::Timeout { .. })));

        reader.await.unwrap();
        drop(shutdown_tx);
    }

    #[test]
    fn bad_address_is_rejected() {
        assert!(matches!(
            HeartbeatAnnouncer::new(message("gl-1"), "nowhere", Duration::from_secs(1)),
            Err(ClusterError::InvalidAddress(_))
        ));
    }
}
