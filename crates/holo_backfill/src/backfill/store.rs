//! Region store view: the seam between the protocol and a replica's data.
//!
//! A store view serves consistent snapshots (metainfo plus data frozen at the
//! same instant) to the backfiller and applies whole sub-pieces atomically
//! for the backfillee. Foreground client writes go through the same
//! [`StoreView::apply_chunk`] path so the timestamp rules below hold for both.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::error::StoreError;
use super::region_map::Metainfo;
use super::types::{Entry, Region, StateTimestamp, Version};

/// Delete window for stale data of a divergent lineage: stored keys with
/// `after < ts <= up_to` are removed before the chunk's entries are written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClearSpan {
    pub after: StateTimestamp,
    pub up_to: StateTimestamp,
}

impl ClearSpan {
    pub fn covers(&self, ts: StateTimestamp) -> bool {
        ts > self.after && ts <= self.up_to
    }
}

/// One atomic unit of writes: an optional clear, entries and the metainfo
/// advance for `sub_region`.
#[derive(Clone, Debug)]
pub struct StoreChunk<R: Region> {
    pub sub_region: R,
    pub clear: Option<ClearSpan>,
    pub entries: Vec<Entry<R::Key>>,
    /// Version the metainfo advances to.
    pub version: Version,
    /// Version the writer observed for `sub_region` before producing the chunk.
    pub base: Version,
}

impl<R: Region> StoreChunk<R> {
    /// A foreground write of one key under `version`.
    pub fn single_write(
        sub_region: R,
        base: Version,
        key: R::Key,
        value: Vec<u8>,
        version: Version,
    ) -> Self {
        Self {
            sub_region,
            clear: None,
            entries: vec![Entry::new(key, value, version.timestamp)],
            version,
            base,
        }
    }

    /// Reject the chunk unless every write lands inside `authorized`.
    pub fn check_bounds(&self, authorized: &R) -> Result<(), StoreError> {
        if !authorized.is_superset(&self.sub_region) {
            return Err(StoreError::OutOfBoundsWrite(format!(
                "sub-region {} not within {authorized}",
                self.sub_region
            )));
        }
        if let Some(entry) = self
            .entries
            .iter()
            .find(|entry| !self.sub_region.contains_key(&entry.key))
        {
            return Err(StoreError::OutOfBoundsWrite(format!(
                "key {:?} not within {}",
                entry.key, self.sub_region
            )));
        }
        Ok(())
    }

    /// Metainfo pieces are replaced only if nobody advanced them since the
    /// writer looked, or if they are strictly older than the new version.
    pub fn replaces(&self, existing: &Version) -> bool {
        *existing == self.base || existing.timestamp < self.version.timestamp
    }

    /// Parts of `sub_region` whose metainfo this chunk will replace. Data
    /// written outside them would sit under a version that cannot explain it.
    pub fn accepted_regions(&self, metainfo: &Metainfo<R>) -> Vec<R> {
        let mut accepted = vec![self.sub_region.clone()];
        for (piece, existing) in metainfo.iter() {
            if self.replaces(existing) || !piece.overlaps(&self.sub_region) {
                continue;
            }
            accepted = accepted
                .into_iter()
                .flat_map(|region| region.subtract(piece))
                .collect();
        }
        accepted.retain(|region| !region.is_empty());
        accepted
    }

    /// Whether `entry` should overwrite a key currently stored at `stored`.
    pub fn wins_over(entry: &Entry<R::Key>, stored: Option<StateTimestamp>) -> bool {
        stored.map_or(true, |ts| ts < entry.timestamp)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub written: usize,
    pub skipped_stale: usize,
    pub deleted: usize,
    /// Metainfo pieces kept because a newer write already advanced them.
    pub metainfo_refused: usize,
}

/// Pages through a frozen key range in key order. An empty page means the
/// range is exhausted.
pub trait RangeReader<K>: Send {
    fn next_page(&mut self, limit: usize) -> Result<Vec<Entry<K>>, StoreError>;
}

/// Metainfo and data frozen at the same instant.
pub trait StoreSnapshot<R: Region>: Send + Sync {
    fn metainfo(&self) -> &Metainfo<R>;

    /// Reader over the frozen data inside `region`.
    fn reader(&self, region: &R) -> Result<Box<dyn RangeReader<R::Key>>, StoreError>;
}

#[async_trait]
pub trait StoreView<R: Region>: Send + Sync {
    /// Region this replica keeps metainfo for.
    fn responsibility(&self) -> R;

    async fn snapshot_metainfo(&self, region: &R) -> Result<Metainfo<R>, StoreError>;

    async fn snapshot(&self, region: &R) -> Result<Box<dyn StoreSnapshot<R>>, StoreError>;

    async fn read_range(&self, region: &R) -> Result<Box<dyn RangeReader<R::Key>>, StoreError> {
        self.snapshot(region).await?.reader(region)
    }

    /// Apply `chunk` atomically: either every write and the metainfo advance
    /// become visible together, or none do.
    async fn apply_chunk(
        &self,
        authorized: &R,
        chunk: StoreChunk<R>,
    ) -> Result<ApplyOutcome, StoreError>;
}

/// Reader over an owned, already-sorted list of entries.
pub struct VecRangeReader<K> {
    entries: VecDeque<Entry<K>>,
}

impl<K> VecRangeReader<K> {
    pub fn new(entries: Vec<Entry<K>>) -> Self {
        Self {
            entries: entries.into(),
        }
    }
}

impl<K: Send> RangeReader<K> for VecRangeReader<K> {
    fn next_page(&mut self, limit: usize) -> Result<Vec<Entry<K>>, StoreError> {
        let take = limit.max(1).min(self.entries.len());
        Ok(self.entries.drain(..take).collect())
    }
}

struct MemoryInner<R: Region> {
    data: BTreeMap<R::Key, (Vec<u8>, StateTimestamp)>,
    metainfo: Metainfo<R>,
}

/// In-memory store view. One mutex serializes every apply, which makes each
/// chunk trivially atomic.
pub struct MemoryStoreView<R: Region> {
    responsibility: R,
    inner: Mutex<MemoryInner<R>>,
}

impl<R: Region> MemoryStoreView<R> {
    /// Empty store whose metainfo is the zero version over `responsibility`.
    pub fn new(responsibility: R) -> Self {
        let metainfo = Metainfo::from_single(responsibility.clone(), Version::zero());
        Self {
            responsibility,
            inner: Mutex::new(MemoryInner {
                data: BTreeMap::new(),
                metainfo,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner<R>>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Corrupt("memory store lock poisoned".into()))
    }

    pub fn get(&self, key: &R::Key) -> Option<(Vec<u8>, StateTimestamp)> {
        self.lock().ok()?.data.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored entry, in key order.
    pub fn entries(&self) -> Vec<Entry<R::Key>> {
        self.lock()
            .map(|inner| collect_entries::<R>(&inner.data, None))
            .unwrap_or_default()
    }

    pub fn metainfo(&self) -> Metainfo<R> {
        self.lock()
            .map(|inner| inner.metainfo.clone())
            .unwrap_or_default()
    }
}

fn collect_entries<R: Region>(
    data: &BTreeMap<R::Key, (Vec<u8>, StateTimestamp)>,
    region: Option<&R>,
) -> Vec<Entry<R::Key>> {
    data.iter()
        .filter(|(key, _)| region.map_or(true, |region| region.contains_key(key)))
        .map(|(key, (value, ts))| Entry::new(key.clone(), value.clone(), *ts))
        .collect()
}

struct MemorySnapshot<R: Region> {
    metainfo: Metainfo<R>,
    entries: Arc<Vec<Entry<R::Key>>>,
}

impl<R: Region> StoreSnapshot<R> for MemorySnapshot<R> {
    fn metainfo(&self) -> &Metainfo<R> {
        &self.metainfo
    }

    fn reader(&self, region: &R) -> Result<Box<dyn RangeReader<R::Key>>, StoreError> {
        let entries = self
            .entries
            .iter()
            .filter(|entry| region.contains_key(&entry.key))
            .cloned()
            .collect();
        Ok(Box::new(VecRangeReader::new(entries)))
    }
}

#[async_trait]
impl<R: Region> StoreView<R> for MemoryStoreView<R> {
    fn responsibility(&self) -> R {
        self.responsibility.clone()
    }

    async fn snapshot_metainfo(&self, region: &R) -> Result<Metainfo<R>, StoreError> {
        Ok(self.lock()?.metainfo.mask(region))
    }

    async fn snapshot(&self, region: &R) -> Result<Box<dyn StoreSnapshot<R>>, StoreError> {
        let inner = self.lock()?;
        Ok(Box::new(MemorySnapshot {
            metainfo: inner.metainfo.mask(region),
            entries: Arc::new(collect_entries(&inner.data, Some(region))),
        }))
    }

    async fn apply_chunk(
        &self,
        authorized: &R,
        chunk: StoreChunk<R>,
    ) -> Result<ApplyOutcome, StoreError> {
        chunk.check_bounds(&authorized.intersection(&self.responsibility))?;
        let mut inner = self.lock()?;
        let mut outcome = ApplyOutcome::default();
        let accepted = chunk.accepted_regions(&inner.metainfo);
        let admitted = |key: &R::Key| accepted.iter().any(|region| region.contains_key(key));

        if let Some(span) = chunk.clear {
            let doomed: Vec<R::Key> = inner
                .data
                .iter()
                .filter(|(key, (_, ts))| admitted(*key) && span.covers(*ts))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                inner.data.remove(&key);
                outcome.deleted += 1;
            }
        }

        for entry in &chunk.entries {
            let stored = inner.data.get(&entry.key).map(|(_, ts)| *ts);
            if admitted(&entry.key) && StoreChunk::<R>::wins_over(entry, stored) {
                inner
                    .data
                    .insert(entry.key.clone(), (entry.value.clone(), entry.timestamp));
                outcome.written += 1;
            } else {
                outcome.skipped_stale += 1;
            }
        }

        outcome.metainfo_refused =
            inner
                .metainfo
                .update_with(&chunk.sub_region, chunk.version, |existing, _| {
                    chunk.replaces(existing)
                });
        inner.metainfo.coalesce();
        Ok(outcome)
    }
}
