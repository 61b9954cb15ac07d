use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use form_pulse_core::{
    ActiveUsers, AnalyticsUpdate, ConnectionId, FormActivity, ServerEvent,
};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::aggregator::MetricsAggregator;
use crate::presence::ActiveUserSet;

pub type Outbound = Arc<ServerEvent>;

/// Connections currently receiving broadcasts for one form type.
#[derive(Default)]
struct Room {
    members: Mutex<HashMap<ConnectionId, mpsc::Sender<Outbound>>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMetrics {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

/// Fans snapshots and activity out to room members.
///
/// Delivery is at-most-once: a member whose queue is full misses the event
/// and catches up on the next cumulative snapshot.
#[derive(Clone)]
pub struct Broadcaster {
    rooms: Arc<DashMap<String, Arc<Room>>>,
    aggregator: MetricsAggregator,
    active_users: ActiveUserSet,
}

impl Broadcaster {
    pub fn new(aggregator: MetricsAggregator, active_users: ActiveUserSet) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            aggregator,
            active_users,
        }
    }

    pub fn subscribe(
        &self,
        form_type: &str,
        connection_id: ConnectionId,
        sender: mpsc::Sender<Outbound>,
    ) {
        loop {
            let room = self
                .rooms
                .entry(form_type.to_string())
                .or_default()
                .clone();
            room.members.lock().insert(connection_id, sender.clone());
            // A concurrent unsubscribe may have dropped the room before the insert.
            if self
                .room(form_type)
                .is_some_and(|current| Arc::ptr_eq(&current, &room))
            {
                return;
            }
        }
    }

    pub fn unsubscribe(&self, form_type: &str, connection_id: ConnectionId) {
        let Some(room) = self.room(form_type) else {
            return;
        };
        let empty = {
            let mut members = room.members.lock();
            members.remove(&connection_id);
            members.is_empty()
        };
        if empty {
            self.rooms.remove_if(form_type, |_, current| {
                Arc::ptr_eq(current, &room) && current.members.lock().is_empty()
            });
        }
    }

    pub fn unsubscribe_all(&self, connection_id: ConnectionId) {
        let forms: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().members.lock().contains_key(&connection_id))
            .map(|entry| entry.key().clone())
            .collect();
        for form_type in forms {
            self.unsubscribe(&form_type, connection_id);
        }
    }

    pub fn room_size(&self, form_type: &str) -> usize {
        self.room(form_type)
            .map(|room| room.members.lock().len())
            .unwrap_or(0)
    }

    pub fn room_sizes(&self) -> Vec<(String, usize)> {
        self.rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().members.lock().len()))
            .collect()
    }

    pub fn broadcast_active_users(&self, form_type: &str) -> BroadcastMetrics {
        let count = self.active_users.count(form_type);
        self.emit(
            form_type,
            ServerEvent::ActiveUsers(ActiveUsers {
                form_type: form_type.to_string(),
                count,
            }),
        )
    }

    /// Emits the current snapshot, or the zero snapshot when the store
    /// cannot be read.
    pub async fn broadcast_metrics_update(&self, form_type: &str) -> BroadcastMetrics {
        if self.room_size(form_type) == 0 {
            return BroadcastMetrics::default();
        }
        let metrics = self.aggregator.snapshot(form_type).await;
        self.emit(
            form_type,
            ServerEvent::AnalyticsUpdate(AnalyticsUpdate {
                form_type: form_type.to_string(),
                metrics,
            }),
        )
    }

    pub fn broadcast_activity(
        &self,
        form_type: &str,
        activity_type: &str,
        data: Value,
    ) -> BroadcastMetrics {
        self.emit(
            form_type,
            ServerEvent::FormActivity(FormActivity {
                form_type: form_type.to_string(),
                activity_type: activity_type.to_string(),
                data,
                timestamp: Utc::now(),
            }),
        )
    }

    pub fn emit(&self, form_type: &str, event: ServerEvent) -> BroadcastMetrics {
        let mut metrics = BroadcastMetrics::default();
        let Some(room) = self.room(form_type) else {
            return metrics;
        };

        let event_name = event.name();
        let outbound: Outbound = Arc::new(event);
        let pending: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = room
            .members
            .lock()
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();

        let mut closed = Vec::new();
        for (connection_id, sender) in pending {
            match sender.try_send(outbound.clone()) {
                Ok(()) => metrics.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    metrics.dropped += 1;
                    counter!(
                        "form_pulse_broadcast_drops_total",
                        1,
                        "event" => event_name
                    );
                    debug!(
                        form_type,
                        connection_id = %connection_id,
                        event = event_name,
                        "outbound queue full; dropping broadcast"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    metrics.closed += 1;
                    closed.push(connection_id);
                }
            }
        }

        if !closed.is_empty() {
            let mut members = room.members.lock();
            for connection_id in closed {
                members.remove(&connection_id);
            }
        }

        if metrics.delivered > 0 {
            counter!(
                "form_pulse_broadcasts_delivered_total",
                metrics.delivered as u64,
                "event" => event_name
            );
        }
        metrics
    }

    fn room(&self, form_type: &str) -> Option<Arc<Room>> {
        self.rooms.get(form_type).map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStore;
    use form_pulse_core::FormMetricsSnapshot;
    use uuid::Uuid;

    fn broadcaster() -> (Arc<MemoryStore>, ActiveUserSet, Broadcaster) {
        let store = Arc::new(MemoryStore::new());
        let aggregator = MetricsAggregator::new(store.clone(), RetryPolicy::none());
        let active = ActiveUserSet::new();
        (store, active.clone(), Broadcaster::new(aggregator, active))
    }

    #[tokio::test]
    async fn emits_only_to_the_form_room() {
        let (_, _, broadcaster) = broadcaster();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        broadcaster.subscribe("intake", Uuid::new_v4(), tx_a);
        broadcaster.subscribe("billing", Uuid::new_v4(), tx_b);

        let metrics = broadcaster.broadcast_activity("intake", "form_completed", Value::Null);
        assert_eq!(metrics.delivered, 1);
        let event = rx_a.recv().await.unwrap();
        assert_eq!(event.name(), "form_activity");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queues_drop_and_closed_queues_are_evicted() {
        let (_, _, broadcaster) = broadcaster();
        let (tx_full, _rx_full) = mpsc::channel(1);
        let (tx_closed, rx_closed) = mpsc::channel(1);
        broadcaster.subscribe("intake", Uuid::new_v4(), tx_full);
        broadcaster.subscribe("intake", Uuid::new_v4(), tx_closed);
        drop(rx_closed);

        let first = broadcaster.broadcast_activity("intake", "a", Value::Null);
        assert_eq!(first.delivered, 1);
        assert_eq!(first.closed, 1);
        assert_eq!(broadcaster.room_size("intake"), 1);

        let second = broadcaster.broadcast_activity("intake", "b", Value::Null);
        assert_eq!(second.dropped, 1);
        assert_eq!(second.delivered, 0);
    }

    #[tokio::test]
    async fn metrics_update_falls_back_to_zero_snapshot() {
        let (store, _, broadcaster) = broadcaster();
        let (tx, mut rx) = mpsc::channel(4);
        broadcaster.subscribe("intake", Uuid::new_v4(), tx);
        store.set_available(false);

        let metrics = broadcaster.broadcast_metrics_update("intake").await;
        assert_eq!(metrics.delivered, 1);
        match rx.recv().await.unwrap().as_ref() {
            ServerEvent::AnalyticsUpdate(update) => {
                assert_eq!(update.form_type, "intake");
                assert_eq!(update.metrics, FormMetricsSnapshot::default());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn active_user_broadcast_reports_set_size() {
        let (_, active, broadcaster) = broadcaster();
        let watcher = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(4);
        broadcaster.subscribe("intake", watcher, tx);
        active.add("intake", Uuid::new_v4());
        active.add("intake", Uuid::new_v4());

        broadcaster.broadcast_active_users("intake");
        match rx.recv().await.unwrap().as_ref() {
            ServerEvent::ActiveUsers(users) => assert_eq!(users.count, 2),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_drops_empty_rooms() {
        let (_, _, broadcaster) = broadcaster();
        let id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(4);
        broadcaster.subscribe("intake", id, tx.clone());
        broadcaster.subscribe("billing", id, tx);
        broadcaster.unsubscribe_all(id);
        assert!(broadcaster.room_sizes().is_empty());
        broadcaster.unsubscribe("intake", id);
    }
}
