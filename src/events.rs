// src/events.rs
// Live event fan-out to SSE subscribers
//
// Subscribers register with optional project/session filters. Broadcasts go
// to the union of clients matching either filter; a broadcast with neither
// set goes to everyone. A failed send means the client hung up, so it is
// removed on the spot. Iteration always happens over a snapshot of the
// registry so removal never invalidates it mid-broadcast.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::utils::now_ms;

/// Heartbeat cadence for connected stream clients.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Typed live events emitted over the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Heartbeat,
    SessionInit,
    SessionStart,
    SessionEnd,
    SessionComplete,
    ObservationAdded,
    UserPrompt,
    MemorySaved,
}

/// Wire format for one stream event.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl StreamEvent {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: now_ms(),
        }
    }
}

struct Subscriber {
    project: Option<String>,
    session_id: Option<String>,
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl Subscriber {
    /// Unfiltered clients hear everything; filtered clients match on either key.
    fn matches(&self, project: Option<&str>, session_id: Option<&str>) -> bool {
        if project.is_none() && session_id.is_none() {
            return true;
        }
        if self.project.is_none() && self.session_id.is_none() {
            return true;
        }
        let project_hit = matches!((self.project.as_deref(), project), (Some(a), Some(b)) if a == b);
        let session_hit =
            matches!((self.session_id.as_deref(), session_id), (Some(a), Some(b)) if a == b);
        project_hit || session_hit
    }
}

/// Registry of stream subscribers with broadcast and heartbeat.
pub struct EventBroadcaster {
    clients: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
}

impl EventBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a client; the returned receiver starts with a `connected` event.
    pub fn subscribe(
        &self,
        project: Option<String>,
        session_id: Option<String>,
    ) -> (u64, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let _ = tx.send(StreamEvent::new(
            EventKind::Connected,
            serde_json::json!({ "clientId": client_id }),
        ));

        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                client_id,
                Subscriber {
                    project,
                    session_id,
                    tx,
                },
            );
        tracing::debug!(client_id, "stream client connected");
        (client_id, rx)
    }

    pub fn unsubscribe(&self, client_id: u64) {
        if self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&client_id)
            .is_some()
        {
            tracing::debug!(client_id, "stream client disconnected");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Send an event to every matching client, dropping clients that hung up.
    pub fn broadcast(
        &self,
        kind: EventKind,
        payload: serde_json::Value,
        project: Option<&str>,
        session_id: Option<&str>,
    ) {
        let event = StreamEvent::new(kind, payload);

        // Snapshot the matching senders so removal never races iteration.
        let targets: Vec<(u64, mpsc::UnboundedSender<StreamEvent>)> = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients
                .iter()
                .filter(|(_, sub)| sub.matches(project, session_id))
                .map(|(id, sub)| (*id, sub.tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (client_id, tx) in targets {
            if tx.send(event.clone()).is_err() {
                dead.push(client_id);
            }
        }
        for client_id in dead {
            self.unsubscribe(client_id);
        }
    }

    /// Periodic heartbeat so idle connections are kept alive and dead ones reaped.
    pub async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.broadcast(EventKind::Heartbeat, serde_json::json!({}), None, None);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
