//! Scripted in-memory transport for exercising the session and the
//! components above it without a network.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::upstream::{UpstreamEvent, UpstreamRequest};
use tokio::sync::{mpsc, watch};

use crate::error::TransportError;
use crate::session::{SessionHandle, SessionPhase};
use crate::transport::{VendorSink, VendorStream, VendorTransport};

enum Item {
    Event(UpstreamEvent),
    Eof,
}

struct Shared {
    next_order_id: AtomicI64,
    auto_handshake: AtomicBool,
    refuse: AtomicBool,
    swallow_pings: AtomicBool,
    requests_tx: mpsc::UnboundedSender<UpstreamRequest>,
    live: Mutex<Option<mpsc::UnboundedSender<Item>>>,
    connections: watch::Sender<usize>,
}

/// Transport whose connections are driven by a [`ScriptedHarness`].
///
/// Every `connect` succeeds immediately (unless refused), performs the
/// handshake automatically, and exposes the requests the session writes.
pub struct ScriptedTransport {
    shared: Arc<Shared>,
}

impl ScriptedTransport {
    pub fn new() -> (Self, ScriptedHarness) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (connections, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            next_order_id: AtomicI64::new(1),
            auto_handshake: AtomicBool::new(true),
            refuse: AtomicBool::new(false),
            swallow_pings: AtomicBool::new(false),
            requests_tx,
            live: Mutex::new(None),
            connections,
        });
        let harness = ScriptedHarness {
            shared: shared.clone(),
            requests: requests_rx,
        };
        (Self { shared }, harness)
    }
}

#[async_trait]
impl VendorTransport for ScriptedTransport {
    type Sink = ScriptedSink;
    type Stream = ScriptedStream;

    async fn connect(&self) -> Result<(Self::Sink, Self::Stream), TransportError> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if self.shared.auto_handshake.load(Ordering::SeqCst) {
            let _ = tx.send(Item::Event(UpstreamEvent::NextOrderId {
                order_id: self.shared.next_order_id.load(Ordering::SeqCst),
            }));
        }
        *self.shared.live.lock().unwrap() = Some(tx);
        self.shared.connections.send_modify(|n| *n += 1);
        Ok((
            ScriptedSink {
                shared: self.shared.clone(),
            },
            ScriptedStream { rx },
        ))
    }
}

pub struct ScriptedSink {
    shared: Arc<Shared>,
}

#[async_trait]
impl VendorSink for ScriptedSink {
    async fn send(&mut self, request: UpstreamRequest) -> Result<(), TransportError> {
        if matches!(request, UpstreamRequest::Ping)
            && !self.shared.swallow_pings.load(Ordering::SeqCst)
        {
            if let Some(live) = self.shared.live.lock().unwrap().as_ref() {
                let _ = live.send(Item::Event(UpstreamEvent::Pong));
            }
        }
        let _ = self.shared.requests_tx.send(request);
        Ok(())
    }
}

pub struct ScriptedStream {
    rx: mpsc::UnboundedReceiver<Item>,
}

#[async_trait]
impl VendorStream for ScriptedStream {
    async fn recv(&mut self) -> Result<Option<UpstreamEvent>, TransportError> {
        match self.rx.recv().await {
            Some(Item::Event(event)) => Ok(Some(event)),
            Some(Item::Eof) | None => Ok(None),
        }
    }
}

/// Test-side controls for a [`ScriptedTransport`].
pub struct ScriptedHarness {
    shared: Arc<Shared>,
    /// Requests the session has written, in send order.
    pub requests: mpsc::UnboundedReceiver<UpstreamRequest>,
}

impl ScriptedHarness {
    /// The `next_order_id` delivered by the next handshake.
    pub fn set_next_order_id(&self, id: i64) {
        self.shared.next_order_id.store(id, Ordering::SeqCst);
    }

    /// Connect without completing the handshake, pinning the session in
    /// `Handshaking`.
    pub fn hold_handshake(&self) {
        self.shared.auto_handshake.store(false, Ordering::SeqCst);
    }

    /// Make every subsequent `connect` fail.
    pub fn refuse_connections(&self) {
        self.shared.refuse.store(true, Ordering::SeqCst);
    }

    /// Stop answering protocol pings, so the heartbeat times out.
    pub fn swallow_pings(&self) {
        self.shared.swallow_pings.store(true, Ordering::SeqCst);
    }

    /// Deliver an event on the current connection.
    pub fn emit(&self, event: UpstreamEvent) {
        if let Some(live) = self.shared.live.lock().unwrap().as_ref() {
            let _ = live.send(Item::Event(event));
        }
    }

    /// Close the current connection from the upstream side.
    pub fn drop_connection(&self) {
        if let Some(live) = self.shared.live.lock().unwrap().take() {
            let _ = live.send(Item::Eof);
        }
    }

    pub fn connection_count(&self) -> usize {
        *self.shared.connections.borrow()
    }

    /// Wait until at least one connection has been established.
    pub async fn wait_for_connection(&self) {
        let mut rx = self.shared.connections.subscribe();
        while *rx.borrow() == 0 {
            rx.changed().await.expect("transport dropped");
        }
    }

    /// Next request the session wrote, or `None` if the session is gone.
    pub async fn next_request(&mut self) -> Option<UpstreamRequest> {
        self.requests.recv().await
    }
}

/// Build a detached [`SessionHandle`] for unit tests: requests land in the
/// returned receiver and the phase is controlled by the returned sender.
pub fn manual_handle(
    capacity: usize,
    send_deadline: Duration,
) -> (
    SessionHandle,
    mpsc::Receiver<UpstreamRequest>,
    watch::Sender<SessionPhase>,
) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (phase_tx, phase_rx) = watch::channel(SessionPhase::Ready);
    (
        SessionHandle::from_parts(outbound_tx, phase_rx, send_deadline),
        outbound_rx,
        phase_tx,
    )
}
