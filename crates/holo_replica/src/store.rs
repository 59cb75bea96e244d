//! Fjall-backed region store view.
//!
//! Two partitions share one keyspace:
//! - `backfill_data`: user key -> `ts (u64 BE) | value`, latest value only.
//! - `backfill_meta`: a single JSON-encoded metainfo record.
//!
//! Every apply writes data and metainfo in one keyspace batch, so a crash
//! never leaves one without the other.

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use holo_backfill::backfill::{
    ApplyOutcome, Entry, KeyRange, Metainfo, RangeReader, Region, StateTimestamp, StoreChunk,
    StoreError, StoreSnapshot, StoreView, Version,
};

const DATA_PARTITION: &str = "backfill_data";
const META_PARTITION: &str = "backfill_meta";
const METAINFO_KEY: &[u8] = b"metainfo";

pub struct FjallStoreView {
    keyspace: Arc<Keyspace>,
    data: PartitionHandle,
    meta: PartitionHandle,
    responsibility: KeyRange,
    /// Journal persistence after each apply; `None` leaves it to fjall.
    persist: Option<PersistMode>,
    lock: Mutex<()>,
}

impl FjallStoreView {
    /// Open the store partitions, seeding a zero-version metainfo over
    /// `responsibility` on first use.
    pub fn open(
        keyspace: Arc<Keyspace>,
        responsibility: KeyRange,
        persist: Option<PersistMode>,
    ) -> anyhow::Result<Self> {
        let data = keyspace
            .open_partition(DATA_PARTITION, PartitionCreateOptions::default())
            .context("open data partition")?;
        let meta = keyspace
            .open_partition(META_PARTITION, PartitionCreateOptions::default())
            .context("open meta partition")?;
        let store = Self {
            keyspace,
            data,
            meta,
            responsibility,
            persist,
            lock: Mutex::new(()),
        };

        match store.read_metainfo()? {
            Some(metainfo) => {
                if let Err(detail) = metainfo.validate_partition(&store.responsibility) {
                    anyhow::bail!(
                        "stored metainfo does not partition {}: {detail}",
                        store.responsibility
                    );
                }
            }
            None => {
                let metainfo = Metainfo::from_single(store.responsibility.clone(), Version::zero());
                store
                    .meta
                    .insert(METAINFO_KEY, encode_metainfo(&metainfo)?)
                    .context("seed metainfo")?;
                store.persist_journal()?;
            }
        }
        Ok(store)
    }

    fn read_metainfo(&self) -> Result<Option<Metainfo<KeyRange>>, StoreError> {
        let Some(bytes) = self.meta.get(METAINFO_KEY).map_err(backend)? else {
            return Ok(None);
        };
        decode_metainfo(&bytes).map(Some)
    }

    /// Current metainfo over the whole responsibility.
    pub fn metainfo(&self) -> Result<Metainfo<KeyRange>, StoreError> {
        self.read_metainfo()?
            .ok_or_else(|| StoreError::Corrupt("metainfo record missing".into()))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, StateTimestamp)>, StoreError> {
        match self.data.get(key).map_err(backend)? {
            Some(bytes) => {
                let (ts, value) = decode_value(&bytes)?;
                Ok(Some((value, ts)))
            }
            None => Ok(None),
        }
    }

    /// Every stored entry inside `region`, in key order.
    pub fn scan(&self, region: &KeyRange) -> Result<Vec<Entry<Vec<u8>>>, StoreError> {
        if region.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for item in self.data.range(bounds(region)) {
            let (key, bytes) = item.map_err(backend)?;
            let (ts, value) = decode_value(&bytes)?;
            out.push(Entry::new(key.to_vec(), value, ts));
        }
        Ok(out)
    }

    fn persist_journal(&self) -> Result<(), StoreError> {
        if let Some(mode) = self.persist {
            self.keyspace.persist(mode).map_err(backend)?;
        }
        Ok(())
    }

    fn stored_timestamp(&self, key: &[u8]) -> Result<Option<StateTimestamp>, StoreError> {
        Ok(self.get(key)?.map(|(_, ts)| ts))
    }
}

#[async_trait]
impl StoreView<KeyRange> for FjallStoreView {
    fn responsibility(&self) -> KeyRange {
        self.responsibility.clone()
    }

    async fn snapshot_metainfo(&self, region: &KeyRange) -> Result<Metainfo<KeyRange>, StoreError> {
        Ok(self.metainfo()?.mask(region))
    }

    async fn snapshot(
        &self,
        region: &KeyRange,
    ) -> Result<Box<dyn StoreSnapshot<KeyRange>>, StoreError> {
        let instant = self.keyspace.instant();
        let meta = self.meta.snapshot_at(instant);
        let bytes = meta
            .get(METAINFO_KEY)
            .map_err(backend)?
            .ok_or_else(|| StoreError::Corrupt("metainfo record missing".into()))?;
        Ok(Box::new(FjallSnapshot {
            metainfo: decode_metainfo(&bytes)?.mask(region),
            data: Arc::new(self.data.snapshot_at(instant)),
        }))
    }

    async fn apply_chunk(
        &self,
        authorized: &KeyRange,
        chunk: StoreChunk<KeyRange>,
    ) -> Result<ApplyOutcome, StoreError> {
        chunk.check_bounds(&authorized.intersection(&self.responsibility))?;
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Corrupt("fjall store lock poisoned".into()))?;
        let mut metainfo = self.metainfo()?;
        let mut batch = self.keyspace.batch();
        let mut outcome = ApplyOutcome::default();
        // Timestamps as this batch leaves them; `None` means removed.
        let mut pending: HashMap<Vec<u8>, Option<StateTimestamp>> = HashMap::new();
        let accepted = chunk.accepted_regions(&metainfo);

        if let Some(span) = chunk.clear {
            for region in &accepted {
                for item in self.data.range(bounds(region)) {
                    let (key, bytes) = item.map_err(backend)?;
                    let (ts, _) = decode_value(&bytes)?;
                    if span.covers(ts) {
                        batch.remove(&self.data, key.to_vec());
                        pending.insert(key.to_vec(), None);
                        outcome.deleted += 1;
                    }
                }
            }
        }

        for entry in &chunk.entries {
            if !accepted.iter().any(|region| region.contains_key(&entry.key)) {
                outcome.skipped_stale += 1;
                continue;
            }
            let stored = match pending.get(&entry.key) {
                Some(ts) => *ts,
                None => self.stored_timestamp(&entry.key)?,
            };
            if StoreChunk::<KeyRange>::wins_over(entry, stored) {
                batch.insert(
                    &self.data,
                    entry.key.clone(),
                    encode_value(entry.timestamp, &entry.value),
                );
                pending.insert(entry.key.clone(), Some(entry.timestamp));
                outcome.written += 1;
            } else {
                outcome.skipped_stale += 1;
            }
        }

        outcome.metainfo_refused =
            metainfo.update_with(&chunk.sub_region, chunk.version, |existing, _| {
                chunk.replaces(existing)
            });
        metainfo.coalesce();
        batch.insert(&self.meta, METAINFO_KEY, encode_metainfo(&metainfo)?);
        batch.commit().map_err(backend)?;
        self.persist_journal()?;
        Ok(outcome)
    }
}

struct FjallSnapshot {
    metainfo: Metainfo<KeyRange>,
    data: Arc<fjall::Snapshot>,
}

impl StoreSnapshot<KeyRange> for FjallSnapshot {
    fn metainfo(&self) -> &Metainfo<KeyRange> {
        &self.metainfo
    }

    fn reader(&self, region: &KeyRange) -> Result<Box<dyn RangeReader<Vec<u8>>>, StoreError> {
        let (lower, upper) = bounds(region);
        Ok(Box::new(FjallRangeReader {
            data: self.data.clone(),
            lower,
            upper,
            done: region.is_empty(),
        }))
    }
}

/// Paged cursor over a frozen data partition. Each page re-seeks past the
/// last key returned, so no iterator borrows outlive a call.
struct FjallRangeReader {
    data: Arc<fjall::Snapshot>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    done: bool,
}

impl RangeReader<Vec<u8>> for FjallRangeReader {
    fn next_page(&mut self, limit: usize) -> Result<Vec<Entry<Vec<u8>>>, StoreError> {
        if self.done {
            return Ok(Vec::new());
        }
        let limit = limit.max(1);
        let mut page = Vec::with_capacity(limit);
        for item in self
            .data
            .range((self.lower.clone(), self.upper.clone()))
            .take(limit)
        {
            let (key, bytes) = item.map_err(backend)?;
            let (ts, value) = decode_value(&bytes)?;
            page.push(Entry::new(key.to_vec(), value, ts));
        }
        match page.last() {
            Some(last) if page.len() == limit => {
                self.lower = Bound::Excluded(last.key.clone());
            }
            _ => self.done = true,
        }
        Ok(page)
    }
}

fn bounds(region: &KeyRange) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let lower = Bound::Included(region.start().to_vec());
    let upper = if region.end().is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(region.end().to_vec())
    };
    (lower, upper)
}

fn backend<E>(err: E) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::Backend(Box::new(err))
}

fn encode_value(ts: StateTimestamp, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + value.len());
    out.extend_from_slice(&ts.0.to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_value(bytes: &[u8]) -> Result<(StateTimestamp, Vec<u8>), StoreError> {
    if bytes.len() < 8 {
        return Err(StoreError::Corrupt(format!(
            "data record of {} bytes has no timestamp",
            bytes.len()
        )));
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&bytes[..8]);
    Ok((StateTimestamp(u64::from_be_bytes(ts)), bytes[8..].to_vec()))
}

fn encode_metainfo(metainfo: &Metainfo<KeyRange>) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(metainfo).map_err(backend)
}

fn decode_metainfo(bytes: &[u8]) -> Result<Metainfo<KeyRange>, StoreError> {
    serde_json::from_slice(bytes)
        .map_err(|err| StoreError::Corrupt(format!("metainfo record: {err}")))
}
