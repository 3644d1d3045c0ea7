//! The single shared piece of mutable state, the way the teacher's
//! `Router` brackets `connections`/`datalog`/`subscription_map`: one value
//! whose lifecycle spans the process, with all access going through
//! methods that take the right lock.

use std::sync::Arc;

use parking_lot::RwLock;
use slab::Slab;

use crate::config::Config;
use crate::metrics::HubMetrics;
use crate::model::{Attributes, ChangeEvent, ChangeKind, Coordinate, Marker, MarkerId, Viewport};
use crate::spatial::SpatialIndex;
use crate::store::MarkerStore;

use crate::connection::session::ClientSession;

/// Spatial index and marker store, always mutated together under the same
/// write lock (invariant 1: every id in the store has exactly one entry in
/// the index at the same coordinate, and vice versa).
struct Index {
    spatial: SpatialIndex,
    store: MarkerStore,
}

pub struct Hub {
    index: RwLock<Index>,
    sessions: RwLock<Slab<Arc<ClientSession>>>,
    pub metrics: HubMetrics,
    pub config: Arc<Config>,
}

impl Hub {
    pub fn new(config: Arc<Config>) -> Self {
        Hub {
            index: RwLock::new(Index {
                spatial: SpatialIndex::new(),
                store: MarkerStore::new(),
            }),
            sessions: RwLock::new(Slab::new()),
            metrics: HubMetrics::new(),
            config,
        }
    }

    pub fn register_session(&self, session: Arc<ClientSession>) -> usize {
        let key = self.sessions.write().insert(session);
        HubMetrics::inc(&self.metrics.connections_active);
        HubMetrics::inc(&self.metrics.connections_total);
        key
    }

    /// Unregisters a session, returning it if it was still present so the
    /// caller can tear down its tasks. No-op (returns `None`) if already
    /// removed.
    pub fn remove_session(&self, key: usize) -> Option<Arc<ClientSession>> {
        let session = self.sessions.write().try_remove(key);
        if session.is_some() {
            self.metrics
                .connections_active
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }
        session
    }

    /// Disconnect-slow-consumer (§5/§7): unregisters the session and aborts
    /// its reader/writer tasks, forcing the client to reconnect and
    /// rehydrate. Safe to call on an already-removed key.
    pub fn disconnect_session(&self, key: usize) {
        if let Some(session) = self.remove_session(key) {
            session.force_disconnect();
        }
    }

    pub fn for_each_session(&self, mut f: impl FnMut(usize, &Arc<ClientSession>)) {
        for (key, session) in self.sessions.read().iter() {
            f(key, session);
        }
    }

    /// Delta Router (§4.G): fold one change event into every live session's
    /// `pendingOps`, inline with the write lock's release the way the spec
    /// describes ("runs as the Consumer's downstream"). Sessions decide for
    /// themselves whether the event is in view.
    pub fn route_change_to_sessions(&self, event: &ChangeEvent) {
        self.for_each_session(|_key, session| session.route_change(event));
    }

    /// Runs `A.search(bbox)` and joins with the store for full records, the
    /// way the Viewport Tracker answers a `viewport_update`.
    pub fn search_viewport(&self, bbox: &Viewport) -> Vec<(MarkerId, Marker)> {
        let index = self.index.read();
        index
            .spatial
            .search(bbox)
            .filter_map(|(id, _, _)| index.store.get(&id).map(|m| (id, m.clone())))
            .collect()
    }

    /// CREATE or UPDATE, unified: if the id isn't present yet this is a
    /// create, otherwise an update — the distinction the bus draws between
    /// the two operations collapses here exactly as it does for inbound
    /// records.
    pub fn apply_create_or_update(
        &self,
        id: MarkerId,
        coordinate: Coordinate,
        attributes: Attributes,
    ) -> ChangeEvent {
        let mut index = self.index.write();
        let prev = index.store.get(&id).cloned();

        let version = prev.as_ref().map(|m| m.version + 1).unwrap_or(1);
        let next = Marker {
            id: id.clone(),
            coordinate,
            attributes,
            version,
        };

        let kind = match &prev {
            None => {
                index
                    .spatial
                    .insert(id.clone(), coordinate.lng, coordinate.lat)
                    .expect("id absent from store implies absent from index (invariant 1)");
                HubMetrics::inc(&self.metrics.markers_active);
                ChangeKind::Created
            }
            Some(prev_marker) => {
                if prev_marker.coordinate != coordinate {
                    index
                        .spatial
                        .replace(id.clone(), coordinate.lng, coordinate.lat)
                        .expect("replace never fails on finite coordinates");
                }
                ChangeKind::Updated
            }
        };

        index.store.put(next.clone());

        ChangeEvent {
            kind,
            id,
            prev,
            next: Some(next),
            version,
        }
    }

    /// `None` if the id was already absent (no-op per the spec).
    pub fn apply_delete(&self, id: MarkerId) -> Option<ChangeEvent> {
        let mut index = self.index.write();
        let prev = index.store.delete(&id)?;
        index.spatial.remove(&id);
        self.metrics
            .markers_active
            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        let version = prev.version + 1;
        Some(ChangeEvent {
            kind: ChangeKind::Deleted,
            id,
            prev: Some(prev),
            next: None,
            version,
        })
    }

    /// Clears and rebuilds both the index and the store directly, used only
    /// for a true cold start (store empty) where every record is
    /// necessarily a create and there is no one yet listening to diff
    /// against.
    pub fn bulk_load(&self, markers: Vec<Marker>) {
        let mut index = self.index.write();
        let points: Vec<(MarkerId, f64, f64)> = markers
            .iter()
            .map(|m| (m.id.clone(), m.coordinate.lng, m.coordinate.lat))
            .collect();
        index.spatial.bulk_load(points);
        index.store.clear();
        self.metrics
            .markers_active
            .store(markers.len() as u64, std::sync::atomic::Ordering::Relaxed);
        for m in markers {
            index.store.put(m);
        }
    }

    pub fn is_store_empty(&self) -> bool {
        self.index.read().store.is_empty()
    }

    /// Snapshot of every marker currently held, used by the Hydrator to
    /// diff against a fresh upstream fetch.
    pub fn snapshot_markers(&self) -> Vec<Marker> {
        self.index.read().store.iter().cloned().collect()
    }

    /// Single-id lookup, used by the Hydrator to decide whether an upstream
    /// record actually changed before replaying it through
    /// `apply_create_or_update` (reconcile should not bump `version` for
    /// content that didn't move).
    pub fn get_marker(&self, id: &MarkerId) -> Option<Marker> {
        self.index.read().store.get(id).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn cfg() -> Arc<Config> {
        Arc::new(Config {
            listen_port: 8080,
            upstream_events_url: "http://localhost/events".to_string(),
            pubsub_host: "localhost".to_string(),
            pubsub_port: 6379,
            pubsub_password: None,
            batch_interval: std::time::Duration::from_millis(50),
            idle_timeout: std::time::Duration::from_secs(300),
            outbound_queue_cap: 256,
            hydrate_retries: 5,
        })
    }

    #[test]
    fn create_then_update_same_id_increments_version() {
        let hub = Hub::new(cfg());
        let id = MarkerId::from("m1");
        let c1 = Coordinate::new(-73.99, 40.72).unwrap();
        let ev1 = hub.apply_create_or_update(id.clone(), c1, json!({}));
        assert_eq!(ev1.kind, ChangeKind::Created);
        assert_eq!(ev1.version, 1);

        let c2 = Coordinate::new(-73.95, 40.78).unwrap();
        let ev2 = hub.apply_create_or_update(id.clone(), c2, json!({}));
        assert_eq!(ev2.kind, ChangeKind::Updated);
        assert_eq!(ev2.version, 2);
    }

    #[test]
    fn delete_absent_is_noop() {
        let hub = Hub::new(cfg());
        assert!(hub.apply_delete(MarkerId::from("ghost")).is_none());
    }

    #[test]
    fn search_viewport_matches_scenario_s1() {
        let hub = Hub::new(cfg());
        hub.apply_create_or_update(MarkerId::from("m1"), Coordinate::new(-73.99, 40.72).unwrap(), json!({}));
        hub.apply_create_or_update(MarkerId::from("m2"), Coordinate::new(-73.95, 40.78).unwrap(), json!({}));
        hub.apply_create_or_update(MarkerId::from("m3"), Coordinate::new(-74.10, 40.60).unwrap(), json!({}));

        let bbox = Viewport::new(-74.0, 40.70, -73.9, 40.80).unwrap();
        let mut found: Vec<String> = hub.search_viewport(&bbox).into_iter().map(|(id, _)| id.to_string()).collect();
        found.sort();
        assert_eq!(found, vec!["m1".to_string(), "m2".to_string()]);
    }
}
