//! Connected-client state: outbound queues, registry, broadcast.
//!
//! Each client owns a bounded outbound queue drained by its writer task.
//! Overflow sheds the oldest non-critical message; `order_status`,
//! `connection_status` and `error` messages are never shed. A critical
//! message that cannot be accommodated, or a full queue's worth of drops
//! with no writer progress in between, trips the queue into the
//! slow-consumer state and the writer closes the socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::Message;
use chrono::Utc;
use common::ClientId;
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Why a queue stopped accepting or yielding messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClosed {
    /// The client could not keep up; the socket must be closed with reason
    /// `slow_consumer`.
    SlowConsumer,
    /// Normal teardown.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Open,
    SlowConsumer,
    Closed,
}

struct QueuedMessage {
    frame: Message,
    critical: bool,
}

struct QueueInner {
    items: VecDeque<QueuedMessage>,
    state: QueueState,
    /// Messages dropped since the writer last made progress.
    dropped_streak: usize,
}

/// Bounded per-client outbound queue.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.min(64)),
                state: QueueState::Open,
                dropped_streak: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue a frame, applying the overflow policy.
    pub fn push(&self, frame: Message, critical: bool) -> Result<(), QueueClosed> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        match inner.state {
            QueueState::Open => {}
            QueueState::SlowConsumer => return Err(QueueClosed::SlowConsumer),
            QueueState::Closed => return Err(QueueClosed::Closed),
        }

        if inner.items.len() >= self.capacity {
            if let Some(pos) = inner.items.iter().position(|m| !m.critical) {
                inner.items.remove(pos);
                inner.dropped_streak += 1;
                counter!("bridge_client_messages_dropped_total").increment(1);
                if inner.dropped_streak > self.capacity {
                    return self.trip(inner);
                }
            } else if critical {
                // Nothing droppable and the message may not be shed either.
                return self.trip(inner);
            } else {
                // Queue full of critical messages: shed the incoming frame.
                inner.dropped_streak += 1;
                counter!("bridge_client_messages_dropped_total").increment(1);
                if inner.dropped_streak > self.capacity {
                    return self.trip(inner);
                }
                return Ok(());
            }
        }

        inner.items.push_back(QueuedMessage { frame, critical });
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    fn trip(
        &self,
        mut inner: std::sync::MutexGuard<'_, QueueInner>,
    ) -> Result<(), QueueClosed> {
        inner.state = QueueState::SlowConsumer;
        inner.items.clear();
        drop(inner);
        self.notify.notify_waiters();
        Err(QueueClosed::SlowConsumer)
    }

    /// Await the next frame. An `Err` tells the writer how to close.
    pub async fn pop(&self) -> Result<Message, QueueClosed> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                match inner.state {
                    QueueState::SlowConsumer => return Err(QueueClosed::SlowConsumer),
                    QueueState::Closed if inner.items.is_empty() => {
                        return Err(QueueClosed::Closed)
                    }
                    _ => {}
                }
                if let Some(message) = inner.items.pop_front() {
                    inner.dropped_streak = 0;
                    return Ok(message.frame);
                }
            }
            notified.await;
        }
    }

    /// Stop accepting new frames; queued frames still drain.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.state == QueueState::Open {
            inner.state = QueueState::Closed;
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State for a single connected client.
pub struct ClientState {
    pub id: ClientId,
    pub queue: OutboundQueue,
    pub connected_at: f64,
    last_pong: AtomicI64,
}

impl ClientState {
    fn new(queue_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: OutboundQueue::new(queue_capacity),
            connected_at: common::unix_now(),
            last_pong: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Serialize and enqueue a message for this client.
    pub fn send(&self, message: &ServerMessage) -> Result<(), QueueClosed> {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound message");
                return Ok(());
            }
        };
        self.queue
            .push(Message::Text(json.into()), message.is_critical())
    }

    pub fn touch_pong(&self) {
        self.last_pong
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn millis_since_pong(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_pong.load(Ordering::Relaxed)
    }
}

/// Registry of connected clients.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<ClientState>>,
    queue_capacity: usize,
}

impl ClientRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            queue_capacity,
        }
    }

    pub fn register(&self) -> Arc<ClientState> {
        let client = Arc::new(ClientState::new(self.queue_capacity));
        self.clients.insert(client.id, client.clone());
        gauge!("bridge_clients_connected").set(self.clients.len() as f64);
        info!(client_id = %client.id, "client registered");
        client
    }

    pub fn unregister(&self, client_id: ClientId) -> Option<Arc<ClientState>> {
        let removed = self.clients.remove(&client_id).map(|(_, client)| client);
        if let Some(client) = &removed {
            client.queue.close();
            gauge!("bridge_clients_connected").set(self.clients.len() as f64);
            info!(%client_id, "client unregistered");
        }
        removed
    }

    pub fn get(&self, client_id: ClientId) -> Option<Arc<ClientState>> {
        self.clients.get(&client_id).map(|entry| entry.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Send a message to every connected client; serialization happens once.
    pub fn broadcast(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize broadcast message");
                return;
            }
        };
        let critical = message.is_critical();
        for entry in self.clients.iter() {
            if entry
                .value()
                .queue
                .push(Message::Text(json.clone().into()), critical)
                .is_err()
            {
                // The writer task notices the tripped queue and disconnects.
                debug!(client_id = %entry.key(), "broadcast skipped a closed queue");
            }
        }
    }

    /// Close every queue; writers drain what is left and shut their sockets.
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().queue.close();
        }
    }
}
