//! Upstream session lifecycle: connect, handshake, heartbeat, reconnect.

use std::time::Duration;

use common::unix_now;
use common::upstream::{UpstreamEvent, UpstreamRequest};
use common::OrderId;
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::{SessionError, TransportError};
use crate::transport::{VendorSink, VendorStream, VendorTransport};

/// Phase of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Reconnecting,
    /// Reconnect attempts exhausted; operator intervention required.
    Failed,
}

impl SessionPhase {
    pub fn is_ready(self) -> bool {
        matches!(self, SessionPhase::Ready)
    }
}

/// Timing and sizing knobs for the session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Quiet period before a keepalive ping is sent.
    pub idle_timeout: Duration,
    /// How long after a ping any inbound traffic must arrive.
    pub pong_timeout: Duration,
    /// Deadline for `SessionHandle::send`.
    pub send_deadline: Duration,
    pub outbound_capacity: usize,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_attempts: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            send_deadline: Duration::from_secs(5),
            outbound_capacity: 256,
            event_capacity: 4096,
        }
    }
}

/// Event emitted by the session to its single consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Handshake completed; sends are now permitted.
    ConnectionReady { next_order_id: OrderId },
    /// The connection dropped; a reconnect cycle is starting.
    ConnectionLost { reason: String },
    /// Decoded vendor event, annotated with its receive timestamp
    /// (fractional UNIX seconds).
    Vendor {
        event: UpstreamEvent,
        received_at: f64,
    },
}

/// Cloneable handle through which other components issue upstream requests.
#[derive(Clone)]
pub struct SessionHandle {
    outbound: mpsc::Sender<UpstreamRequest>,
    phase: watch::Receiver<SessionPhase>,
    send_deadline: Duration,
}

impl SessionHandle {
    pub(crate) fn from_parts(
        outbound: mpsc::Sender<UpstreamRequest>,
        phase: watch::Receiver<SessionPhase>,
        send_deadline: Duration,
    ) -> Self {
        Self {
            outbound,
            phase,
            send_deadline,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.phase().is_ready()
    }

    /// Watch channel for phase transitions.
    pub fn phase_watch(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// Non-blocking enqueue. Fails `NotReady` outside the `Ready` phase and
    /// `BackpressureExceeded` when the outbound queue is full.
    pub fn try_send(&self, request: UpstreamRequest) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }
        self.outbound.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::BackpressureExceeded,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Enqueue with the configured send deadline.
    pub async fn send(&self, request: UpstreamRequest) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }
        match timeout(self.send_deadline, self.outbound.send(request)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::Timeout),
        }
    }
}

enum Outcome {
    Shutdown,
    Lost(String),
}

/// Owns the vendor connection. Exactly one of these runs per process.
pub struct UpstreamSession<T: VendorTransport> {
    transport: T,
    config: SessionConfig,
    outbound_rx: mpsc::Receiver<UpstreamRequest>,
    events_tx: mpsc::Sender<SessionEvent>,
    phase_tx: watch::Sender<SessionPhase>,
    shutdown_rx: mpsc::Receiver<()>,
    backoff: Backoff,
    attempts: u32,
}

impl<T: VendorTransport> UpstreamSession<T> {
    /// Build the session together with its public surfaces: the request
    /// handle, the event stream (single consumer), and the shutdown trigger.
    pub fn new(
        transport: T,
        config: SessionConfig,
    ) -> (
        Self,
        SessionHandle,
        mpsc::Receiver<SessionEvent>,
        mpsc::Sender<()>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Disconnected);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let backoff = Backoff::new(config.reconnect_base, config.reconnect_cap);
        let handle = SessionHandle {
            outbound: outbound_tx,
            phase: phase_rx,
            send_deadline: config.send_deadline,
        };
        let session = Self {
            transport,
            config,
            outbound_rx,
            events_tx,
            phase_tx,
            shutdown_rx,
            backoff,
            attempts: 0,
        };
        (session, handle, events_rx, shutdown_tx)
    }

    /// Drive the connection until shutdown, or until the attempt bound trips
    /// the session into `Failed`.
    pub async fn run(mut self) -> Result<(), SessionError> {
        loop {
            self.set_phase(SessionPhase::Connecting);
            let connected = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    self.set_phase(SessionPhase::Disconnected);
                    return Ok(());
                }
                res = timeout(self.config.connect_timeout, self.transport.connect()) => res,
            };

            match connected {
                Ok(Ok((sink, stream))) => match self.drive(sink, stream).await {
                    Outcome::Shutdown => {
                        self.set_phase(SessionPhase::Disconnected);
                        return Ok(());
                    }
                    Outcome::Lost(reason) => {
                        counter!("bridge_upstream_disconnects_total").increment(1);
                        warn!(%reason, "upstream connection lost");
                        self.emit(SessionEvent::ConnectionLost { reason }).await;
                    }
                },
                Ok(Err(e)) => warn!(error = %e, "upstream connect failed"),
                Err(_) => warn!("upstream connect timed out"),
            }

            // Requests queued against the dead connection reference request
            // ids that are meaningless after reconnect.
            while self.outbound_rx.try_recv().is_ok() {}

            self.set_phase(SessionPhase::Reconnecting);
            self.attempts += 1;
            if let Some(max) = self.config.max_attempts {
                if self.attempts >= max {
                    warn!(attempts = self.attempts, "reconnect attempts exhausted");
                    self.set_phase(SessionPhase::Failed);
                    return Err(SessionError::Failed);
                }
            }

            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "backing off before reconnect");
            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    self.set_phase(SessionPhase::Disconnected);
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection's lifetime: handshake, then the ready loop.
    async fn drive(&mut self, mut sink: T::Sink, mut stream: T::Stream) -> Outcome {
        self.set_phase(SessionPhase::Handshaking);

        // Handshake: the first NextOrderId event promotes the session.
        let next_order_id = loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => return Outcome::Shutdown,
                res = timeout(self.config.handshake_timeout, stream.recv()) => res,
            };
            match received {
                Err(_) => return Outcome::Lost("handshake timed out".to_string()),
                Ok(Err(e)) => return Outcome::Lost(format!("handshake failed: {e}")),
                Ok(Ok(None)) => {
                    return Outcome::Lost("connection closed during handshake".to_string())
                }
                Ok(Ok(Some(UpstreamEvent::NextOrderId { order_id }))) => break order_id,
                Ok(Ok(Some(event))) => {
                    debug!(?event, "event before handshake completed");
                }
            }
        };

        self.backoff.reset();
        self.attempts = 0;
        self.set_phase(SessionPhase::Ready);
        counter!("bridge_upstream_connects_total").increment(1);
        info!(next_order_id, "upstream session ready");
        self.emit(SessionEvent::ConnectionReady { next_order_id })
            .await;

        let mut last_inbound = Instant::now();
        let mut ping_sent: Option<Instant> = None;

        loop {
            let heartbeat_at = match ping_sent {
                Some(at) => at + self.config.pong_timeout,
                None => last_inbound + self.config.idle_timeout,
            };

            tokio::select! {
                biased;
                _ = self.shutdown_rx.recv() => {
                    let _ = sink.send(UpstreamRequest::Logoff).await;
                    let _ = sink.close().await;
                    return Outcome::Shutdown;
                }
                request = self.outbound_rx.recv() => {
                    let Some(request) = request else { return Outcome::Shutdown };
                    if let Err(e) = sink.send(request).await {
                        return Outcome::Lost(format!("write failed: {e}"));
                    }
                }
                received = stream.recv() => match received {
                    Ok(Some(event)) => {
                        last_inbound = Instant::now();
                        ping_sent = None;
                        if !matches!(event, UpstreamEvent::Pong) {
                            self.emit(SessionEvent::Vendor {
                                event,
                                received_at: unix_now(),
                            })
                            .await;
                        }
                    }
                    Ok(None) => return Outcome::Lost("connection closed by upstream".to_string()),
                    Err(TransportError::Codec(e)) => {
                        // Malformed frame: drop it, keep the connection.
                        warn!(error = %e, "dropping undecodable frame");
                        counter!("bridge_upstream_decode_errors_total").increment(1);
                        last_inbound = Instant::now();
                    }
                    Err(e) => return Outcome::Lost(format!("read failed: {e}")),
                },
                _ = sleep_until(heartbeat_at) => {
                    if ping_sent.is_some() {
                        return Outcome::Lost("heartbeat timed out".to_string());
                    }
                    if let Err(e) = sink.send(UpstreamRequest::Ping).await {
                        return Outcome::Lost(format!("ping failed: {e}"));
                    }
                    ping_sent = Some(Instant::now());
                }
            }
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        if *self.phase_tx.borrow() != phase {
            debug!(?phase, "session phase change");
            let _ = self.phase_tx.send(phase);
        }
    }

    async fn emit(&self, event: SessionEvent) {
        // The router is the sole consumer; if it is gone we are shutting down.
        let _ = self.events_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;

    async fn recv_ready(events: &mut mpsc::Receiver<SessionEvent>) -> OrderId {
        loop {
            match events.recv().await.expect("event stream ended") {
                SessionEvent::ConnectionReady { next_order_id } => return next_order_id,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_promotes_to_ready_and_emits_connection_ready() {
        let (transport, harness) = ScriptedTransport::new();
        harness.set_next_order_id(501);
        let (session, handle, mut events, shutdown) =
            UpstreamSession::new(transport, SessionConfig::default());
        let task = tokio::spawn(session.run());

        assert_eq!(recv_ready(&mut events).await, 501);
        assert!(handle.is_ready());

        shutdown.send(()).await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sends_are_rejected_until_ready() {
        let (transport, harness) = ScriptedTransport::new();
        harness.hold_handshake();
        let (session, handle, _events, shutdown) =
            UpstreamSession::new(transport, SessionConfig::default());
        let task = tokio::spawn(session.run());

        harness.wait_for_connection().await;
        assert_eq!(
            handle.try_send(UpstreamRequest::Ping),
            Err(SessionError::NotReady)
        );

        shutdown.send(()).await.unwrap();
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn drop_triggers_reconnect_with_fresh_handshake() {
        let (transport, harness) = ScriptedTransport::new();
        harness.set_next_order_id(100);
        let (session, _handle, mut events, shutdown) =
            UpstreamSession::new(transport, SessionConfig::default());
        let task = tokio::spawn(session.run());

        assert_eq!(recv_ready(&mut events).await, 100);

        harness.set_next_order_id(200);
        harness.drop_connection();

        // ConnectionLost precedes the new ConnectionReady.
        let lost = events.recv().await.unwrap();
        assert!(matches!(lost, SessionEvent::ConnectionLost { .. }));
        assert_eq!(recv_ready(&mut events).await, 200);
        assert!(harness.connection_count() >= 2);

        shutdown.send(()).await.unwrap();
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_attempts_fail_the_session() {
        let (transport, harness) = ScriptedTransport::new();
        harness.refuse_connections();
        let config = SessionConfig {
            max_attempts: Some(3),
            connect_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        };
        let (session, handle, _events, _shutdown) = UpstreamSession::new(transport, config);
        let result = session.run().await;
        assert_eq!(result, Err(SessionError::Failed));
        assert_eq!(handle.phase(), SessionPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_forces_reconnect() {
        let (transport, harness) = ScriptedTransport::new();
        harness.set_next_order_id(1);
        harness.swallow_pings();
        let config = SessionConfig {
            idle_timeout: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(2),
            ..SessionConfig::default()
        };
        let (session, _handle, mut events, shutdown) = UpstreamSession::new(transport, config);
        let task = tokio::spawn(session.run());

        recv_ready(&mut events).await;
        // Idle: the session pings, gets nothing back, and reconnects.
        let lost = events.recv().await.unwrap();
        assert!(
            matches!(&lost, SessionEvent::ConnectionLost { reason } if reason.contains("heartbeat")),
            "unexpected event: {lost:?}"
        );

        shutdown.send(()).await.unwrap();
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn vendor_events_are_annotated_and_ordered() {
        let (transport, harness) = ScriptedTransport::new();
        harness.set_next_order_id(1);
        let (session, _handle, mut events, shutdown) =
            UpstreamSession::new(transport, SessionConfig::default());
        let task = tokio::spawn(session.run());

        recv_ready(&mut events).await;
        for price in [1.0, 2.0, 3.0] {
            harness.emit(UpstreamEvent::TickPrice {
                req_id: 1,
                tick: common::upstream::PriceTick::Last,
                price,
            });
        }
        for expected in [1.0, 2.0, 3.0] {
            match events.recv().await.unwrap() {
                SessionEvent::Vendor {
                    event: UpstreamEvent::TickPrice { price, .. },
                    received_at,
                } => {
                    assert_eq!(price, expected);
                    assert!(received_at > 0.0);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        shutdown.send(()).await.unwrap();
        let _ = task.await;
    }
}
