//! Integration tests driving `Hub` and `ClientSession` directly, no real
//! sockets, covering the concrete scenarios from the testable-properties
//! section of this crate's design document.

use std::sync::Arc;
use std::time::Duration;

use markerhub::config::Config;
use markerhub::connection::session::ClientSession;
use markerhub::hub::Hub;
use markerhub::model::{ChangeKind, Coordinate, MarkerId, PendingOp, Viewport};
use markerhub::protocol::WireViewport;
use serde_json::json;

fn cfg() -> Arc<Config> {
    Arc::new(Config {
        listen_port: 0,
        upstream_events_url: "http://localhost/events".to_string(),
        pubsub_host: "localhost".to_string(),
        pubsub_port: 6379,
        pubsub_password: None,
        batch_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_secs(300),
        outbound_queue_cap: 256,
        hydrate_retries: 5,
    })
}

fn session() -> Arc<ClientSession> {
    let (tx, _rx) = flume::bounded(256);
    Arc::new(ClientSession::new(
        "client-under-test".to_string(),
        "127.0.0.1:0".parse().unwrap(),
        tx,
    ))
}

fn wire(west: f64, south: f64, east: f64, north: f64) -> WireViewport {
    WireViewport { north, south, east, west }
}

fn preload_s1(hub: &Hub) {
    hub.apply_create_or_update(MarkerId::from("m1"), Coordinate::new(-73.99, 40.72).unwrap(), json!({}));
    hub.apply_create_or_update(MarkerId::from("m2"), Coordinate::new(-73.95, 40.78).unwrap(), json!({}));
    hub.apply_create_or_update(MarkerId::from("m3"), Coordinate::new(-74.10, 40.60).unwrap(), json!({}));
}

/// S1 — Basic visibility.
#[test]
fn s1_basic_visibility() {
    let hub = Hub::new(cfg());
    preload_s1(&hub);
    let sess = session();

    sess.handle_viewport_update(wire(-74.0, 40.70, -73.9, 40.80), |bbox| hub.search_viewport(bbox))
        .unwrap();

    let ids = hub.search_viewport(&Viewport::new(-74.0, 40.70, -73.9, 40.80).unwrap());
    let mut found: Vec<String> = ids.into_iter().map(|(id, _)| id.to_string()).collect();
    found.sort();
    assert_eq!(found, vec!["m1".to_string(), "m2".to_string()]);
}

/// S2 — Live create in view.
#[test]
fn s2_live_create_in_view() {
    let hub = Hub::new(cfg());
    preload_s1(&hub);
    let sess = session();
    sess.handle_viewport_update(wire(-74.0, 40.70, -73.9, 40.80), |bbox| hub.search_viewport(bbox))
        .unwrap();

    let event = hub.apply_create_or_update(MarkerId::from("m4"), Coordinate::new(-73.97, 40.75).unwrap(), json!({}));
    assert_eq!(event.kind, ChangeKind::Created);
    sess.route_change(&event);

    let pending = sess.take_pending_ops();
    assert!(matches!(pending.get(&MarkerId::from("m4")), Some(PendingOp::Created(_))));
}

/// S3 — Update out of view: client receives nothing about m3.
#[test]
fn s3_update_out_of_view_yields_nothing() {
    let hub = Hub::new(cfg());
    preload_s1(&hub);
    let sess = session();
    sess.handle_viewport_update(wire(-74.0, 40.70, -73.9, 40.80), |bbox| hub.search_viewport(bbox))
        .unwrap();

    let event = hub.apply_create_or_update(MarkerId::from("m3"), Coordinate::new(-74.09, 40.61).unwrap(), json!({}));
    sess.route_change(&event);

    assert!(!sess.has_pending_ops());
}

/// S4 — Move out of view: deleted, not updated.
#[test]
fn s4_move_out_of_view_yields_deleted() {
    let hub = Hub::new(cfg());
    preload_s1(&hub);
    let sess = session();
    sess.handle_viewport_update(wire(-74.0, 40.70, -73.9, 40.80), |bbox| hub.search_viewport(bbox))
        .unwrap();

    let event = hub.apply_create_or_update(MarkerId::from("m1"), Coordinate::new(-74.50, 40.72).unwrap(), json!({}));
    assert_eq!(event.kind, ChangeKind::Updated);
    sess.route_change(&event);

    let pending = sess.take_pending_ops();
    assert!(matches!(pending.get(&MarkerId::from("m1")), Some(PendingOp::Deleted)));
}

/// S5 — Viewport pan: panning to a new bbox yields exactly its contents.
#[test]
fn s5_viewport_pan() {
    let hub = Hub::new(cfg());
    preload_s1(&hub);
    let sess = session();
    sess.handle_viewport_update(wire(-74.0, 40.70, -73.9, 40.80), |bbox| hub.search_viewport(bbox))
        .unwrap();

    sess.handle_viewport_update(wire(-74.15, 40.55, -74.05, 40.65), |bbox| hub.search_viewport(bbox))
        .unwrap();

    let ids = hub.search_viewport(&Viewport::new(-74.15, 40.55, -74.05, 40.65).unwrap());
    let found: Vec<String> = ids.into_iter().map(|(id, _)| id.to_string()).collect();
    assert_eq!(found, vec!["m3".to_string()]);
}

/// S6 — Delete of unseen: nothing delivered.
#[test]
fn s6_delete_of_unseen_yields_nothing() {
    let hub = Hub::new(cfg());
    preload_s1(&hub);
    let sess = session();
    sess.handle_viewport_update(wire(-74.0, 40.70, -73.9, 40.80), |bbox| hub.search_viewport(bbox))
        .unwrap();

    let event = hub.apply_delete(MarkerId::from("m3")).unwrap();
    sess.route_change(&event);

    assert!(!sess.has_pending_ops());
}

/// Invariant 5 — viewport idempotence.
#[test]
fn viewport_idempotence() {
    let hub = Hub::new(cfg());
    preload_s1(&hub);
    let sess = session();
    let bbox = wire(-74.0, 40.70, -73.9, 40.80);

    sess.handle_viewport_update(bbox, |b| hub.search_viewport(b)).unwrap();
    let first: Vec<String> = hub
        .search_viewport(&Viewport::new(-74.0, 40.70, -73.9, 40.80).unwrap())
        .into_iter()
        .map(|(id, _)| id.to_string())
        .collect();

    sess.handle_viewport_update(bbox, |b| hub.search_viewport(b)).unwrap();
    let second: Vec<String> = hub
        .search_viewport(&Viewport::new(-74.0, 40.70, -73.9, 40.80).unwrap())
        .into_iter()
        .map(|(id, _)| id.to_string())
        .collect();

    assert_eq!(first.len(), second.len());
}

/// Invariant 1 — index/store consistency across a create/update/delete cycle.
#[test]
fn index_store_consistency_across_lifecycle() {
    let hub = Hub::new(cfg());
    let id = MarkerId::from("m1");
    hub.apply_create_or_update(id.clone(), Coordinate::new(1.0, 1.0).unwrap(), json!({}));
    assert_eq!(hub.snapshot_markers().len(), 1);

    hub.apply_create_or_update(id.clone(), Coordinate::new(2.0, 2.0).unwrap(), json!({}));
    let bbox = Viewport::new(1.5, 1.5, 2.5, 2.5).unwrap();
    assert_eq!(hub.search_viewport(&bbox).len(), 1);

    hub.apply_delete(id);
    assert!(hub.is_store_empty());
    assert_eq!(hub.search_viewport(&Viewport::new(-180.0, -90.0, 180.0, 90.0).unwrap()).len(), 0);
}
