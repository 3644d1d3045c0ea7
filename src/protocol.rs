//! Wire protocol: tagged JSON messages exchanged with map-viewing clients.
//!
//! Client/server pairs are separate enums rather than one shared enum so
//! that a session's reader task can never accidentally construct a
//! client-bound variant, and vice versa.

use serde::{Deserialize, Serialize};

use crate::model::{Attributes, Coordinate, Marker, MarkerId};

/// Marker as it appears on the wire: coordinates are always `[lng, lat]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMarker {
    pub id: MarkerId,
    pub coordinate: [f64; 2],
    pub attributes: Attributes,
}

impl From<&Marker> for WireMarker {
    fn from(m: &Marker) -> Self {
        WireMarker {
            id: m.id.clone(),
            coordinate: [m.coordinate.lng, m.coordinate.lat],
            attributes: m.attributes.clone(),
        }
    }
}

/// A client-supplied viewport. Field names follow the wire protocol
/// (`north`/`south`/`east`/`west`), translated to the internal
/// `Viewport`'s `min_lng`/`max_lng`/`min_lat`/`max_lat` on ingress.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WireViewport {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ViewportUpdate { viewport: WireViewport },
    Ping,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        #[serde(rename = "clientId")]
        client_id: String,
        #[serde(rename = "instanceId")]
        instance_id: String,
    },
    InitialMarkers {
        data: Vec<WireMarker>,
    },
    MarkerCreated {
        marker: WireMarker,
    },
    MarkerUpdated {
        marker: WireMarker,
    },
    MarkerDeleted {
        id: MarkerId,
    },
    MarkerUpdatesBatch {
        created: Vec<WireMarker>,
        updated: Vec<WireMarker>,
        deleted: Vec<MarkerId>,
        timestamp: i64,
    },
    DebugEvent {
        payload: serde_json::Value,
    },
    Error {
        reason: String,
    },
}

/// `CREATE` and `INSERT` are synonymous on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BusOperation {
    Create,
    Insert,
    Update,
    Delete,
}

/// Upstream/bus marker shape: `location.coordinates: [lng, lat]`, plus
/// whatever attribute fields the record carries alongside `id`/`location`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamRecord {
    pub id: String,
    pub location: Option<UpstreamLocation>,
    #[serde(flatten)]
    pub attributes: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamLocation {
    pub coordinates: [f64; 2],
}

impl UpstreamRecord {
    pub fn coordinate(&self) -> Option<Coordinate> {
        let loc = self.location.as_ref()?;
        Coordinate::new(loc.coordinates[0], loc.coordinates[1]).ok()
    }
}

/// One message off the pub/sub bus.
#[derive(Debug, Clone, Deserialize)]
pub struct BusMessage {
    pub operation: BusOperation,
    pub record: UpstreamRecord,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn client_message_viewport_update_parses() {
        let raw = r#"{"type":"viewport_update","viewport":{"north":40.8,"south":40.7,"east":-73.9,"west":-74.0}}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::ViewportUpdate { .. }));
    }

    #[test]
    fn unknown_client_message_type_is_ignored_not_an_error() {
        let raw = r#"{"type":"some_future_message","foo":1}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::Unknown));
    }

    #[test]
    fn server_message_batch_serializes_tagged() {
        let msg = ServerMessage::MarkerUpdatesBatch {
            created: vec![],
            updated: vec![],
            deleted: vec![MarkerId::from("m1")],
            timestamp: 0,
        };
        let s = serde_json::to_string(&msg).unwrap();
        assert!(s.contains("\"type\":\"marker_updates_batch\""));
    }

    #[test]
    fn bus_message_create_and_insert_are_synonymous() {
        let a: BusMessage = serde_json::from_str(
            r#"{"operation":"CREATE","record":{"id":"m1","location":{"coordinates":[-73.99,40.72]}}}"#,
        )
        .unwrap();
        let b: BusMessage = serde_json::from_str(
            r#"{"operation":"INSERT","record":{"id":"m1","location":{"coordinates":[-73.99,40.72]}}}"#,
        )
        .unwrap();
        assert_eq!(a.operation == BusOperation::Create, true);
        assert_eq!(b.operation == BusOperation::Insert, true);
    }
}
