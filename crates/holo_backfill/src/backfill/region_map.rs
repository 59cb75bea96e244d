//! Partition maps from disjoint sub-regions to values.
//!
//! Metainfo is a `RegionMap<R, Version>`: at every instant its pieces must
//! partition the owning replica's responsibility region.

use serde::{Deserialize, Serialize};

use super::types::{Region, Version};

/// Per-sub-region record of the version that explains the stored data.
pub type Metainfo<R> = RegionMap<R, Version>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMap<R, V> {
    pieces: Vec<(R, V)>,
}

impl<R: Region, V: Clone> RegionMap<R, V> {
    pub fn new() -> Self {
        Self { pieces: Vec::new() }
    }

    pub fn from_single(region: R, value: V) -> Self {
        let mut map = Self::new();
        if !region.is_empty() {
            map.pieces.push((region, value));
        }
        map
    }

    /// Build from raw pieces; empty regions are dropped. Disjointness is not
    /// checked here, use [`RegionMap::validate_partition`].
    pub fn from_pieces(pieces: impl IntoIterator<Item = (R, V)>) -> Self {
        Self {
            pieces: pieces
                .into_iter()
                .filter(|(region, _)| !region.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&R, &V)> {
        self.pieces.iter().map(|(region, value)| (region, value))
    }

    pub fn into_pieces(self) -> Vec<(R, V)> {
        self.pieces
    }

    pub fn get(&self, key: &R::Key) -> Option<&V> {
        self.pieces
            .iter()
            .find(|(region, _)| region.contains_key(key))
            .map(|(_, value)| value)
    }

    /// Restrict the map to `region`.
    pub fn mask(&self, region: &R) -> Self {
        Self {
            pieces: self
                .pieces
                .iter()
                .filter_map(|(piece, value)| {
                    let clipped = piece.intersection(region);
                    (!clipped.is_empty()).then(|| (clipped, value.clone()))
                })
                .collect(),
        }
    }

    /// Overwrite `region` with `value`, splitting any piece that straddles it.
    pub fn update(&mut self, region: &R, value: V) {
        self.update_with(region, value, |_, _| true);
    }

    /// Overwrite `region` with `value` except where `replace(existing, new)`
    /// refuses; refused pieces are kept whole. Returns the number of refused
    /// pieces.
    pub fn update_with(
        &mut self,
        region: &R,
        value: V,
        replace: impl Fn(&V, &V) -> bool,
    ) -> usize {
        if region.is_empty() {
            return 0;
        }
        let mut kept = Vec::with_capacity(self.pieces.len() + 2);
        let mut fresh = vec![region.clone()];
        let mut refused = 0;
        for (piece, existing) in self.pieces.drain(..) {
            let overlap = piece.intersection(region);
            if overlap.is_empty() {
                kept.push((piece, existing));
                continue;
            }
            if replace(&existing, &value) {
                for rest in piece.subtract(region) {
                    kept.push((rest, existing.clone()));
                }
            } else {
                refused += 1;
                fresh = fresh
                    .into_iter()
                    .flat_map(|target| target.subtract(&overlap))
                    .collect();
                kept.push((piece, existing));
            }
        }
        for target in fresh {
            kept.push((target, value.clone()));
        }
        self.pieces = kept;
        refused
    }

    /// True when the pieces inside `region` cover it exactly once.
    pub fn covers(&self, region: &R) -> bool {
        let masked = self.mask(region);
        if !pairwise_disjoint(&masked.pieces) {
            return false;
        }
        let mut remaining = vec![region.clone()];
        for (piece, _) in &masked.pieces {
            remaining = remaining
                .into_iter()
                .flat_map(|target| target.subtract(piece))
                .collect();
        }
        remaining.iter().all(Region::is_empty)
    }

    /// Checks that the map is exactly a partition of `region`.
    pub fn validate_partition(&self, region: &R) -> Result<(), String> {
        for (piece, _) in &self.pieces {
            if !region.is_superset(piece) {
                return Err(format!("piece {piece} lies outside {region}"));
            }
        }
        if !pairwise_disjoint(&self.pieces) {
            return Err("pieces overlap".to_string());
        }
        if !self.covers(region) {
            return Err(format!("pieces leave a gap in {region}"));
        }
        Ok(())
    }
}

impl<R: Region, V: Clone + PartialEq> RegionMap<R, V> {
    /// Merge adjacent pieces carrying equal values.
    pub fn coalesce(&mut self) {
        let mut merged: Vec<(R, V)> = Vec::with_capacity(self.pieces.len());
        for (piece, value) in self.pieces.drain(..) {
            let mut current = (piece, value);
            loop {
                let hit = merged.iter().position(|(other, other_value)| {
                    *other_value == current.1 && other.union_adjacent(&current.0).is_some()
                });
                let Some(idx) = hit else { break };
                let (other, _) = merged.swap_remove(idx);
                if let Some(joined) = other.union_adjacent(&current.0) {
                    current.0 = joined;
                }
            }
            merged.push(current);
        }
        self.pieces = merged;
    }
}

impl<R: Region, V: Clone> Default for RegionMap<R, V> {
    fn default() -> Self {
        Self::new()
    }
}

fn pairwise_disjoint<R: Region, V>(pieces: &[(R, V)]) -> bool {
    for (i, (a, _)) in pieces.iter().enumerate() {
        for (b, _) in &pieces[i + 1..] {
            if a.overlaps(b) {
                return false;
            }
        }
    }
    true
}
