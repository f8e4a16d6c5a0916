//! The cross-node event bus.
//!
//! One node applies a mutation; every node's subscribers hear about it.
//! Publishing fans out locally through the hub first — synchronously, so
//! same-node subscribers never depend on the log — and then appends the
//! envelope to the shared `ws_events` log. A tail-follower task on every
//! node polls the log in batches, skips envelopes it originated (those
//! were already dispatched inline), and routes the rest by channel.
//!
//! The log is best-effort with a retention horizon; a subscriber that was
//! disconnected across a purge refetches state on reconnect. Ordering is
//! monotonic per session because all game mutations serialize through the
//! store's CAS version and are published in that order.

use crate::hub::{BroadcastLobby, BroadcastSession, NotifyMatchFound, SessionHub};
use crate::model::{now_ms, Channel, EventPayload};
use crate::store::GameStore;
use actix::Addr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Rows read from the log per poll.
const TAIL_BATCH: i64 = 256;

/// Backoff cap after repeated tail failures.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct EventBus {
    store: GameStore,
    /// Absent only in tests that exercise the publish path without an
    /// actor system.
    hub: Option<Addr<SessionHub>>,
    node_id: Uuid,
}

impl EventBus {
    pub fn new(store: GameStore, hub: Option<Addr<SessionHub>>, node_id: Uuid) -> Self {
        Self {
            store,
            hub,
            node_id,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Renders a payload as the frame a push subscriber receives. Every
    /// frame carries `serverTime`, stamped at dispatch, so consecutive
    /// frames to one subscriber carry monotonic clocks.
    pub fn render_frame(payload: &EventPayload) -> Option<String> {
        let mut value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(err) => {
                log::error!("failed to serialize event payload: {}", err);
                return None;
            }
        };
        if let Some(map) = value.as_object_mut() {
            map.insert("serverTime".to_string(), serde_json::json!(now_ms()));
        }
        Some(value.to_string())
    }

    /// Routes one payload to the local hub.
    fn dispatch_local(&self, channel: &Channel, payload: &EventPayload) {
        let Some(hub) = &self.hub else {
            return;
        };
        let Some(frame) = Self::render_frame(payload) else {
            return;
        };
        match channel {
            Channel::Session(session_id) => hub.do_send(BroadcastSession {
                session_id: *session_id,
                frame,
            }),
            Channel::Match(connection_id) => hub.do_send(NotifyMatchFound {
                connection_id: connection_id.clone(),
                frame,
            }),
            Channel::Lobby => hub.do_send(BroadcastLobby { frame }),
        }
    }

    /// Publishes an envelope: local fan-out first, then the shared log.
    /// A failed append is logged and swallowed — same-node subscribers
    /// have already been served.
    pub async fn publish(&self, channel: Channel, payload: EventPayload) {
        self.dispatch_local(&channel, &payload);

        let value = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(err) => {
                log::error!("failed to serialize event for the log: {}", err);
                return;
            }
        };
        if let Err(err) = self
            .store
            .append_ws_event(&channel.to_string(), &value, self.node_id, now_ms())
            .await
        {
            log::error!("failed to append event to {}: {}", channel, err);
        }
    }

    /// Tails the shared log forever, dispatching envelopes other nodes
    /// appended. Sleeps with exponential backoff on read failures.
    pub async fn run_tailer(self: Arc<Self>, poll: Duration) {
        let mut cursor = match self.store.latest_ws_event_id().await {
            Ok(id) => id,
            Err(err) => {
                log::warn!("event tailer starting at the log head failed: {}", err);
                0
            }
        };
        let mut backoff = poll;

        loop {
            tokio::time::sleep(backoff).await;

            match self.store.read_ws_events_since(cursor, TAIL_BATCH).await {
                Ok(events) => {
                    backoff = poll;
                    for event in events {
                        cursor = event.id;
                        if event.origin_node == self.node_id {
                            continue;
                        }
                        let Some(channel) = Channel::parse(&event.channel) else {
                            log::debug!("skipping event on unknown channel {}", event.channel);
                            continue;
                        };
                        // Unknown payload kinds are skipped so old nodes
                        // survive new event types in the log.
                        match serde_json::from_value::<EventPayload>(event.payload) {
                            Ok(payload) => self.dispatch_local(&channel, &payload),
                            Err(err) => {
                                log::debug!("skipping undecodable event {}: {}", event.id, err)
                            }
                        }
                    }
                }
                Err(err) => {
                    log::warn!("event tail read failed, backing off: {}", err);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Periodically purges envelopes older than the retention horizon.
    pub async fn run_retention(self: Arc<Self>, retention_secs: i64) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let cutoff = now_ms() - retention_secs * 1000;
            match self.store.purge_ws_events_before(cutoff).await {
                Ok(0) => {}
                Ok(purged) => log::debug!("purged {} expired events", purged),
                Err(err) => log::warn!("event retention purge failed: {}", err),
            }
        }
    }
}
