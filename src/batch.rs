//! Batch Coalescer (§4.H): a process-wide ticker that drains each session's
//! pending ops every `BATCH_INTERVAL_MS` and emits a single
//! `marker_updates_batch` message. This crate's chosen wire-compatibility
//! mode is batch-only (no immediate per-event messages) — see DESIGN.md.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::hub::Hub;
use crate::model::PendingOp;
use crate::protocol::{ServerMessage, WireMarker};

pub struct BatchCoalescer {
    interval: Duration,
}

impl BatchCoalescer {
    pub fn new(interval: Duration) -> Self {
        BatchCoalescer { interval }
    }

    /// Runs until shutdown is signalled. On shutdown, flushes one final
    /// round within `drain_timeout` before returning, per §5's "in-flight
    /// batches flush (bounded wait, default 500ms)".
    pub async fn run(&self, hub: Arc<Hub>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let drain_timeout = Duration::from_millis(500);
                        let _ = tokio::time::timeout(drain_timeout, self.flush_all(&hub)).await;
                        debug!("{:15.15}[<] {:20} coalescer flushed final batch on shutdown", "coalescer", "shutdown");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.flush_all(&hub).await;
                }
            }
        }
    }

    async fn flush_all(&self, hub: &Hub) {
        let mut flushed = 0u64;
        // Collected rather than acted on inline: `disconnect_session` takes
        // the sessions write lock, which would deadlock against the read
        // lock `for_each_session` holds for the duration of its iteration.
        let mut to_disconnect = Vec::new();
        hub.for_each_session(|key, session| {
            if !session.has_pending_ops() {
                return;
            }
            let pending = session.take_pending_ops();
            if pending.is_empty() {
                return;
            }
            let batch = Self::build_batch(pending);
            match session.outbound.try_send(batch) {
                Ok(()) => {
                    flushed += 1;
                }
                Err(flume::TrySendError::Full(_)) => {
                    hub.metrics
                        .slow_consumer_drops
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    to_disconnect.push((key, session.client_id.clone()));
                }
                Err(flume::TrySendError::Disconnected(_)) => {
                    // Writer task already gone; session cleanup will catch up.
                }
            }
        });
        if flushed > 0 {
            hub.metrics.batches_sent.fetch_add(flushed, std::sync::atomic::Ordering::Relaxed);
            trace!("{:15.15}[>] {:20} flushed {} session batches", "coalescer", "tick", flushed);
        }
        // Disconnect-slow-consumer (§5/§7): outbound queue is saturated, so
        // the session is torn down rather than left to balloon memory; the
        // client reconnects and rehydrates via `initial_markers`.
        for (key, client_id) in to_disconnect {
            let err = crate::Error::SlowConsumer(client_id);
            warn!("{:15.15}[x] {:20} {}", "coalescer", "slow-consumer", err);
            hub.disconnect_session(key);
        }
    }

    fn build_batch(pending: std::collections::HashMap<crate::model::MarkerId, PendingOp>) -> ServerMessage {
        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();
        for (id, op) in pending {
            match op {
                PendingOp::Created(marker) => created.push(WireMarker::from(&marker)),
                PendingOp::Updated(marker) => updated.push(WireMarker::from(&marker)),
                PendingOp::Deleted => deleted.push(id),
            }
        }
        ServerMessage::MarkerUpdatesBatch {
            created,
            updated,
            deleted,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Coordinate, Marker, MarkerId};
    use serde_json::json;

    fn marker(id: &str) -> Marker {
        Marker {
            id: MarkerId::from(id),
            coordinate: Coordinate::new(0.0, 0.0).unwrap(),
            attributes: json!({}),
            version: 1,
        }
    }

    #[test]
    fn build_batch_splits_by_op_kind() {
        let mut pending = std::collections::HashMap::new();
        pending.insert(MarkerId::from("m1"), PendingOp::Created(marker("m1")));
        pending.insert(MarkerId::from("m2"), PendingOp::Updated(marker("m2")));
        pending.insert(MarkerId::from("m3"), PendingOp::Deleted);

        let batch = BatchCoalescer::build_batch(pending);
        match batch {
            ServerMessage::MarkerUpdatesBatch { created, updated, deleted, .. } => {
                assert_eq!(created.len(), 1);
                assert_eq!(updated.len(), 1);
                assert_eq!(deleted.len(), 1);
            }
            _ => panic!("expected batch message"),
        }
    }
}
