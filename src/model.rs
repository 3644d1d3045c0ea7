//! Domain types shared by every component.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque, globally unique marker id. `Arc<str>` so that cloning it into a
/// session's `lastSeenIds`/`pendingOps` never re-allocates the string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerId(Arc<str>);

impl MarkerId {
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        MarkerId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MarkerId {
    fn from(s: String) -> Self {
        MarkerId(s.into())
    }
}

impl From<&str> for MarkerId {
    fn from(s: &str) -> Self {
        MarkerId(Arc::from(s))
    }
}

/// `(lng, lat)` pair, always finite and within range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lng: f64,
    pub lat: f64,
}

impl Coordinate {
    pub fn new(lng: f64, lat: f64) -> Result<Self, CoordinateError> {
        if !lng.is_finite() || !lat.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoordinateError::LngOutOfRange(lng));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatOutOfRange(lat));
        }
        Ok(Coordinate { lng, lat })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinateError {
    #[error("coordinate is not finite")]
    NonFinite,
    #[error("lng {0} out of range [-180, 180]")]
    LngOutOfRange(f64),
    #[error("lat {0} out of range [-90, 90]")]
    LatOutOfRange(f64),
}

/// Opaque display payload. The service never interprets this beyond copying
/// it into outbound messages, so an open JSON value is the correct shape.
pub type Attributes = serde_json::Value;

/// Immutable-by-version marker record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: MarkerId,
    pub coordinate: Coordinate,
    pub attributes: Attributes,
    pub version: u64,
}

impl Marker {
    /// Structural equality used by the Hydrator's diff: same coordinate and
    /// same attributes means "unchanged upstream".
    pub fn same_content(&self, other: &Marker) -> bool {
        self.coordinate == other.coordinate && self.attributes == other.attributes
    }
}

/// Axis-aligned lng/lat rectangle. Antimeridian-crossing viewports are
/// rejected; the client is expected to split them into two requests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl Viewport {
    pub fn new(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> Result<Self, ViewportError> {
        for v in [min_lng, min_lat, max_lng, max_lat] {
            if !v.is_finite() {
                return Err(ViewportError::NonFinite);
            }
        }
        if min_lng > max_lng {
            return Err(ViewportError::AntimeridianOrInverted);
        }
        if min_lat > max_lat {
            return Err(ViewportError::Inverted);
        }
        Ok(Viewport {
            min_lng,
            min_lat,
            max_lng,
            max_lat,
        })
    }

    pub fn contains(&self, c: Coordinate) -> bool {
        c.lng >= self.min_lng && c.lng <= self.max_lng && c.lat >= self.min_lat && c.lat <= self.max_lat
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewportError {
    #[error("viewport bound is not finite")]
    NonFinite,
    #[error("minLat > maxLat")]
    Inverted,
    #[error("minLng > maxLng (antimeridian-crossing viewports are not supported)")]
    AntimeridianOrInverted,
}

/// Kind of a normalized change, as seen by the pub/sub consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Normalized internal representation of a CREATE/UPDATE/DELETE, emitted by
/// the Consumer (and replayed identically by the Hydrator) and consumed by
/// the Delta Router.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub id: MarkerId,
    pub prev: Option<Marker>,
    pub next: Option<Marker>,
    pub version: u64,
}

/// The effective per-session kind the delta router decides for one
/// connection, and what a pending op collapses to.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Created(Marker),
    Updated(Marker),
    Deleted,
}

impl PendingOp {
    /// Fold a new effective op for this id on top of whatever is already
    /// pending, last-write-wins, with fixed terminal-state rules. `None`
    /// means "omit from batch" (created→deleted).
    pub fn collapse(existing: Option<PendingOp>, incoming: PendingOp) -> Option<PendingOp> {
        match (existing, incoming) {
            (None, op) => Some(op),
            (Some(PendingOp::Created(_)), PendingOp::Updated(m)) => Some(PendingOp::Created(m)),
            (Some(PendingOp::Created(_)), PendingOp::Deleted) => None,
            (Some(PendingOp::Updated(_)), PendingOp::Deleted) => Some(PendingOp::Deleted),
            (Some(PendingOp::Deleted), PendingOp::Created(m)) => Some(PendingOp::Updated(m)),
            // deleted -> updated shouldn't occur (updated implies present upstream);
            // treat defensively as updated overwriting deleted.
            (Some(PendingOp::Deleted), PendingOp::Updated(m)) => Some(PendingOp::Updated(m)),
            (_, op) => Some(op),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
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
    fn collapsing_law_follows_fixed_table() {
        let m = marker("m1");

        // created -> updated => created (latest record)
        let c = PendingOp::collapse(Some(PendingOp::Created(m.clone())), PendingOp::Updated(m.clone()));
        assert!(matches!(c, Some(PendingOp::Created(_))));

        // created -> deleted => omit
        let c = PendingOp::collapse(Some(PendingOp::Created(m.clone())), PendingOp::Deleted);
        assert!(c.is_none());

        // updated -> deleted => deleted
        let c = PendingOp::collapse(Some(PendingOp::Updated(m.clone())), PendingOp::Deleted);
        assert!(matches!(c, Some(PendingOp::Deleted)));

        // deleted -> created => updated (id remains seen after flush)
        let c = PendingOp::collapse(Some(PendingOp::Deleted), PendingOp::Created(m.clone()));
        assert!(matches!(c, Some(PendingOp::Updated(_))));
    }

    #[test]
    fn coordinate_rejects_non_finite_and_out_of_range() {
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
        assert!(Coordinate::new(200.0, 0.0).is_err());
        assert!(Coordinate::new(0.0, -95.0).is_err());
        assert!(Coordinate::new(-73.99, 40.72).is_ok());
    }

    #[test]
    fn viewport_rejects_inverted_bounds() {
        assert!(Viewport::new(-74.0, 40.70, -73.9, 40.80).is_ok());
        assert!(Viewport::new(-73.9, 40.70, -74.0, 40.80).is_err());
        assert!(Viewport::new(-74.0, 40.80, -73.9, 40.70).is_err());
    }
}
