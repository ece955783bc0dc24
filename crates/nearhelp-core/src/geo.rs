//! In-memory geospatial index over request origins.
//!
//! Answers "within radius" queries for the nearby-matching read path.  The
//! index is a plain scan over a map; queries are restartable (each call
//! re-scans current state, no cursor is persisted) and results come back
//! ordered by ascending great-circle distance.

use std::collections::HashMap;

use crate::types::{Coordinate, RequestId};

/// Index of request origin coordinates.
///
/// Synchronous by design; the server wraps it in a lock the same way it
/// wraps the rest of its shared state.
#[derive(Debug, Clone, Default)]
pub struct GeoIndex {
    entries: HashMap<RequestId, Coordinate>,
}

impl GeoIndex {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert or move an entity.
    pub fn upsert(&mut self, id: RequestId, coordinate: Coordinate) {
        self.entries.insert(id, coordinate);
    }

    /// Drop an entity; unknown ids are ignored.
    pub fn remove(&mut self, id: &RequestId) {
        self.entries.remove(id);
    }

    pub fn coordinate_of(&self, id: &RequestId) -> Option<Coordinate> {
        self.entries.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries within `radius_meters` of `center` that pass `predicate`,
    /// sorted by ascending distance.  Distance uses the same haversine
    /// metric as [`Coordinate::distance_meters`].
    pub fn within_radius<F>(
        &self,
        center: Coordinate,
        radius_meters: f64,
        mut predicate: F,
    ) -> Vec<(RequestId, f64)>
    where
        F: FnMut(&RequestId) -> bool,
    {
        let mut hits: Vec<(RequestId, f64)> = self
            .entries
            .iter()
            .filter_map(|(id, coord)| {
                let d = center.distance_meters(coord);
                if d <= radius_meters && predicate(id) {
                    Some((*id, d))
                } else {
                    None
                }
            })
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        hits
    }
}
