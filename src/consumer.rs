//! Pub/Sub Consumer (§4.C): the single task that serialises all writes to
//! the index/store. Parses CREATE/UPDATE/DELETE bus messages, applies them
//! to the `Hub`, and folds the resulting `ChangeEvent` into every live
//! session's pending ops — the Delta Router runs inline here, as the spec
//! requires ("runs as the Consumer's downstream (inline with the write lock
//! release)").
//!
//! On a dropped bus connection, reconnects with the pub/sub client's own
//! backoff and then re-runs the Hydrator's reconcile pass before resuming,
//! so any changes missed during the outage converge within one hydrate
//! cycle (§4.C "Reconnection").

use std::sync::Arc;

use log::{debug, info, warn};

use crate::hub::Hub;
use crate::hydrator::Hydrator;
use crate::model::ChangeKind;
use crate::protocol::{BusMessage, BusOperation};
use crate::pubsub::PubSubClient;

pub struct Consumer {
    client: PubSubClient,
    hydrator: Hydrator,
}

impl Consumer {
    pub fn new(client: PubSubClient, hydrator: Hydrator) -> Self {
        Consumer { client, hydrator }
    }

    /// Runs until the process is asked to shut down. Never returns under
    /// normal operation; reconnects internally on stream end.
    pub async fn run(&self, hub: Arc<Hub>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut reader = self.client.connect_with_retry().await;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("{:15.15}[<] {:20} consumer stopping on shutdown signal", "consumer", "shutdown");
                        return;
                    }
                }
                result = PubSubClient::read_message(&mut reader) => {
                    match result {
                        Ok(Some(msg)) => {
                            hub.metrics.bus_messages_consumed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            self.apply_bus_message(&hub, msg);
                        }
                        Ok(None) => {
                            let err = crate::Error::Transient("pub/sub stream ended".to_string());
                            warn!("{:15.15}[x] {:20} {}, reconnecting", "consumer", "disconnect", err);
                            reader = self.client.connect_with_retry().await;
                            self.reconcile_after_resubscribe(&hub).await;
                        }
                        Err(e) => {
                            let err = crate::Error::Transient(e.to_string());
                            warn!("{:15.15}[x] {:20} {}, reconnecting", "consumer", "read-error", err);
                            reader = self.client.connect_with_retry().await;
                            self.reconcile_after_resubscribe(&hub).await;
                        }
                    }
                }
            }
        }
    }

    /// Re-runs the Hydrator's diff-and-replay pass, then broadcasts every
    /// resulting synthetic event exactly as a live CREATE/UPDATE/DELETE.
    async fn reconcile_after_resubscribe(&self, hub: &Arc<Hub>) {
        let events = self.hydrator.hydrate_reconnect(hub).await;
        for event in &events {
            hub.route_change_to_sessions(event);
        }
        if !events.is_empty() {
            debug!(
                "{:15.15}[>] {:20} reconcile applied {} synthetic events",
                "consumer", "reconcile", events.len()
            );
        }
    }

    /// One bus message: parse/validate, apply under the write lock, fan out.
    /// Malformed records are logged and dropped (§4.C step 1); this is
    /// reached only after `PubSubClient::read_message` already filtered out
    /// JSON that doesn't parse as a `BusMessage` at all, so here we only
    /// need to guard CREATE/UPDATE records missing a coordinate.
    fn apply_bus_message(&self, hub: &Hub, msg: BusMessage) {
        let BusMessage { operation, record } = msg;
        let id = crate::model::MarkerId::from(record.id.clone());

        match operation {
            BusOperation::Create | BusOperation::Insert | BusOperation::Update => {
                let Some(coordinate) = record.coordinate() else {
                    hub.metrics.bus_messages_malformed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let err = crate::Error::MalformedUpstream(format!("record {} missing/invalid coordinate", id));
                    warn!("{:15.15}[x] {:20} dropping {}", "consumer", "malformed", err);
                    return;
                };
                let event = hub.apply_create_or_update(id, coordinate, record.attributes);
                debug!(
                    "{:15.15}[>] {:20} {:?} id={} version={}",
                    "consumer", "apply", event.kind, event.id, event.version
                );
                hub.route_change_to_sessions(&event);
            }
            BusOperation::Delete => {
                if let Some(event) = hub.apply_delete(id.clone()) {
                    debug_assert_eq!(event.kind, ChangeKind::Deleted);
                    hub.route_change_to_sessions(&event);
                }
            }
        }
    }
}
