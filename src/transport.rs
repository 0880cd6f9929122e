//! Push-channel transport: one WebSocket connection per pipeline.
//!
//! The manager owns connect/send/receive/close plus automatic reconnection
//! with exponential back-off. It has no visibility into snapshot contents:
//! inbound text frames and lifecycle changes are handed to the engine as
//! [`TransportEvent`]s over a channel, and `send` transmits only while
//! connected — there is no implicit queueing, callers treat a dropped send
//! as retryable.
//!
//! Reconnection is a single explicit task; `disconnect()` aborts it, which
//! deterministically cancels any scheduled back-off sleep. Messages lost
//! while disconnected are never replayed: the engine reconciles with a
//! full-state request after every `Connected` event.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::errors::TransportError;

// ── Reconnection policy ──────────────────────────────────────────────

/// Exponential back-off: `base * 2^attempt`, capped at `max_delay_ms`,
/// bounded by `max_attempts`. After the cap is exhausted the manager stops
/// retrying and leaves the connection state for the caller to observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Delay before reconnect attempt number `attempt` (zero-based).
pub fn backoff_delay(attempt: u32, policy: &ReconnectPolicy) -> Duration {
    let factor = 2u64.saturating_pow(attempt.min(31));
    let ms = policy
        .base_delay_ms
        .saturating_mul(factor)
        .min(policy.max_delay_ms);
    Duration::from_millis(ms)
}

// ── Connection state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Owned exclusively by the transport manager; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
        }
    }
}

// ── Events ───────────────────────────────────────────────────────────

/// Lifecycle and data events delivered to the engine, in arrival order
/// within one connection. No ordering holds across a reconnect boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection attempt started (first connect or reconnect).
    Connecting,
    /// A connection was established (first connect or reconnect). The
    /// engine should issue a fresh full-state request on every one.
    Connected,
    /// One inbound text frame.
    Frame(String),
    /// The connection dropped; a reconnect may follow.
    Disconnected,
    /// The reconnect attempt cap was exhausted; the manager has stopped.
    ReconnectsExhausted,
}

// ── Manager ──────────────────────────────────────────────────────────

type OutboundSlot = Arc<RwLock<Option<mpsc::UnboundedSender<String>>>>;

/// Cheap clone for components that only need `send` and state reads.
#[derive(Clone)]
pub struct TransportHandle {
    state: Arc<RwLock<ConnectionState>>,
    outbound: OutboundSlot,
}

impl TransportHandle {
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Transmit a frame. Only succeeds while connected; otherwise the frame
    /// is dropped and the caller gets `NotConnected` to retry later.
    pub async fn send(&self, frame: String) -> Result<(), TransportError> {
        let guard = self.outbound.read().await;
        match guard.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::SendFailed),
            None => Err(TransportError::NotConnected),
        }
    }
}

/// Owns the connection task for one pipeline. At most one live connection
/// exists at any time; `connect` while connected performs a full
/// `disconnect` first.
pub struct TransportManager {
    url: String,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ConnectionState>>,
    outbound: OutboundSlot,
    events: mpsc::UnboundedSender<TransportEvent>,
    task: Option<JoinHandle<()>>,
}

impl TransportManager {
    /// Create a manager for the given WebSocket URL. The returned receiver
    /// carries every [`TransportEvent`] across all reconnects.
    pub fn new(
        url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            url: url.into(),
            policy,
            state: Arc::new(RwLock::new(ConnectionState::default())),
            outbound: Arc::new(RwLock::new(None)),
            events,
            task: None,
        };
        (manager, rx)
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            state: Arc::clone(&self.state),
            outbound: Arc::clone(&self.outbound),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Establish the connection, tearing down any existing one first.
    pub async fn connect(&mut self) {
        self.disconnect().await;

        let url = self.url.clone();
        let policy = self.policy.clone();
        let state = Arc::clone(&self.state);
        let outbound = Arc::clone(&self.outbound);
        let events = self.events.clone();
        self.task = Some(tokio::spawn(async move {
            run_connection(url, policy, state, outbound, events).await;
        }));
    }

    /// Tear down the connection and cancel any scheduled reconnect.
    pub async fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        *self.outbound.write().await = None;
        let mut state = self.state.write().await;
        state.status = ConnectionStatus::Disconnected;
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Connection loop: connect, pump frames until close, back off, repeat
/// until the attempt cap is hit or the task is aborted.
async fn run_connection(
    url: String,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ConnectionState>>,
    outbound: OutboundSlot,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut attempts: u32 = 0;

    loop {
        state.write().await.status = ConnectionStatus::Connecting;
        if events.send(TransportEvent::Connecting).is_err() {
            return;
        }

        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!(url = %url, "push channel connected");
                attempts = 0;
                {
                    let mut s = state.write().await;
                    s.status = ConnectionStatus::Connected;
                    s.reconnect_attempts = 0;
                }

                let (mut sink, mut stream) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                *outbound.write().await = Some(tx);

                if events.send(TransportEvent::Connected).is_err() {
                    return;
                }

                loop {
                    tokio::select! {
                        out = rx.recv() => match out {
                            Some(frame) => {
                                if sink.send(WsMessage::Text(frame)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        msg = stream.next() => match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                if events.send(TransportEvent::Frame(text)).is_err() {
                                    return;
                                }
                            }
                            Some(Ok(WsMessage::Ping(data))) => {
                                if sink.send(WsMessage::Pong(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "push channel receive error");
                                break;
                            }
                        }
                    }
                }

                *outbound.write().await = None;
                state.write().await.status = ConnectionStatus::Disconnected;
                if events.send(TransportEvent::Disconnected).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "push channel connect failed");
                state.write().await.status = ConnectionStatus::Disconnected;
                if events.send(TransportEvent::Disconnected).is_err() {
                    return;
                }
            }
        }

        if attempts >= policy.max_attempts {
            warn!(attempts, "reconnect attempts exhausted; giving up");
            let _ = events.send(TransportEvent::ReconnectsExhausted);
            return;
        }

        let delay = backoff_delay(attempts, &policy);
        attempts += 1;
        state.write().await.reconnect_attempts = attempts;
        debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        // Aborting the task cancels this sleep, so disconnect() also
        // cancels the pending reconnect.
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt_up_to_the_ceiling() {
        let policy = ReconnectPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
        };
        assert_eq!(backoff_delay(0, &policy), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(1, &policy), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(2, &policy), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(4, &policy), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(5, &policy), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(6, &policy), Duration::from_millis(30_000));
    }

    #[test]
    fn backoff_is_non_decreasing_and_bounded() {
        let policy = ReconnectPolicy::default();
        let mut last = Duration::ZERO;
        for attempt in 0..20 {
            let delay = backoff_delay(attempt, &policy);
            assert!(delay >= last);
            assert!(delay <= Duration::from_millis(policy.max_delay_ms));
            last = delay;
        }
    }

    #[test]
    fn backoff_survives_huge_attempt_numbers() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            backoff_delay(u32::MAX, &policy),
            Duration::from_millis(policy.max_delay_ms)
        );
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: ReconnectPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, ReconnectPolicy::default());

        let policy: ReconnectPolicy =
            serde_json::from_str(r#"{"base_delay_ms": 10, "max_attempts": 3}"#).unwrap();
        assert_eq!(policy.base_delay_ms, 10);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.max_delay_ms, default_max_delay_ms());
    }

    #[test]
    fn connection_state_defaults_to_disconnected() {
        let state = ConnectionState::default();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_dropped_with_not_connected() {
        let (manager, _rx) = TransportManager::new("ws://127.0.0.1:1/ws", ReconnectPolicy::default());
        let handle = manager.handle();
        let err = handle.send("{\"type\":\"state_request\"}".to_string()).await;
        assert!(matches!(err, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn connect_failure_emits_disconnected_then_exhausted() {
        // Nothing listens on this port; with a zero-delay policy the task
        // burns through its attempts immediately.
        let policy = ReconnectPolicy {
            base_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts: 2,
        };
        let (mut manager, mut rx) = TransportManager::new("ws://127.0.0.1:9/ws", policy);
        manager.connect().await;

        let mut connecting = 0;
        let mut disconnects = 0;
        loop {
            match rx.recv().await {
                Some(TransportEvent::Connecting) => connecting += 1,
                Some(TransportEvent::Disconnected) => disconnects += 1,
                Some(TransportEvent::ReconnectsExhausted) => break,
                Some(other) => panic!("unexpected event: {:?}", other),
                None => panic!("event channel closed before exhaustion"),
            }
        }
        // Initial attempt + 2 reconnects, then the cap stops everything.
        assert_eq!(connecting, 3);
        assert_eq!(disconnects, 3);
        assert_eq!(manager.state().await.status, ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_cancels_the_scheduled_reconnect() {
        let policy = ReconnectPolicy {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            max_attempts: 10,
        };
        let (mut manager, mut rx) = TransportManager::new("ws://127.0.0.1:9/ws", policy);
        manager.connect().await;

        // First failure arrives, then the task parks in a long back-off.
        assert_eq!(rx.recv().await, Some(TransportEvent::Connecting));
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
        manager.disconnect().await;

        // The aborted task must not produce further events.
        let followup =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(followup.is_err(), "no events expected after disconnect");
        assert_eq!(manager.state().await.status, ConnectionStatus::Disconnected);
    }
}
