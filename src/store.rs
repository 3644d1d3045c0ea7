//! Flat id-keyed store of the full marker records.
//!
//! Kept as a sibling of `SpatialIndex` behind the same lock rather than
//! folded into it: the index only cares about coordinates, the store is
//! the source of truth for the rest of a marker's content.

use std::collections::HashMap;

use crate::model::{Marker, MarkerId};

#[derive(Default)]
pub struct MarkerStore {
    markers: HashMap<MarkerId, Marker>,
}

impl MarkerStore {
    pub fn new() -> Self {
        MarkerStore {
            markers: HashMap::new(),
        }
    }

    pub fn get(&self, id: &MarkerId) -> Option<&Marker> {
        self.markers.get(id)
    }

    pub fn put(&mut self, marker: Marker) -> Option<Marker> {
        self.markers.insert(marker.id.clone(), marker)
    }

    pub fn delete(&mut self, id: &MarkerId) -> Option<Marker> {
        self.markers.remove(id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Marker> {
        self.markers.values()
    }
}
