//! Branch history: the append-only lineage DAG.
//!
//! Records live in an arena indexed by branch id; parent links are arena
//! indexes, so ancestor walks never chase owned pointers. A branch's interval
//! may be closed once and is never rewritten afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use super::error::HistoryError;
use super::types::{Branch, BranchId, Region, StateTimestamp, Version};

/// Cluster-wide lineage record shared by both protocol roles.
///
/// Implementations only need to provide storage; the ancestry queries are
/// derived from [`BranchHistory::lineage`].
pub trait BranchHistory<R: Region>: Send + Sync {
    fn get_branch(&self, id: BranchId) -> Result<Branch<R>, HistoryError>;

    /// Append `branch`. Recording identical content again is a no-op;
    /// recording a closed copy of an open branch closes it.
    fn record_branch(&self, branch: Branch<R>) -> Result<(), HistoryError>;

    fn close_branch(&self, id: BranchId, end: StateTimestamp) -> Result<(), HistoryError>;

    /// `id` followed by each ancestor up to its root.
    fn lineage(&self, id: BranchId) -> Result<Vec<Branch<R>>, HistoryError>;

    fn contains(&self, id: BranchId) -> bool {
        id.is_nil() || self.get_branch(id).is_ok()
    }

    /// Ancestor-or-equal on branch ids. The nil sentinel precedes everything.
    fn is_ancestor(&self, candidate: BranchId, of: BranchId) -> Result<bool, HistoryError> {
        if candidate.is_nil() {
            return Ok(true);
        }
        if of.is_nil() {
            return Ok(false);
        }
        Ok(self.lineage(of)?.iter().any(|branch| branch.id == candidate))
    }

    /// True when every write explained by `a` is also explained by `b`:
    /// `a`'s branch is on `b`'s chain and `a`'s timestamp does not pass the
    /// point where `b`'s chain forked away from it.
    fn version_is_ancestor(&self, a: Version, b: Version) -> Result<bool, HistoryError> {
        if a.branch.is_nil() {
            return Ok(true);
        }
        for (id, limit) in self.chain(b)? {
            if id == a.branch {
                return Ok(a.timestamp <= limit);
            }
        }
        Ok(false)
    }

    /// Latest version both `a` and `b` descend from.
    fn common_ancestor(&self, a: Version, b: Version) -> Result<Version, HistoryError> {
        let theirs: HashMap<BranchId, StateTimestamp> = self.chain(b)?.into_iter().collect();
        for (id, limit) in self.chain(a)? {
            if let Some(other) = theirs.get(&id) {
                return Ok(Version::new(id, limit.min(*other)));
            }
        }
        Ok(Version::zero())
    }

    /// `(branch, highest timestamp reachable on it)` from `v` back to the root.
    fn chain(&self, v: Version) -> Result<Vec<(BranchId, StateTimestamp)>, HistoryError> {
        if v.branch.is_nil() {
            return Ok(Vec::new());
        }
        let mut limit = v.timestamp;
        let mut out = Vec::new();
        for branch in self.lineage(v.branch)? {
            out.push((branch.id, limit));
            limit = limit.min(branch.interval.start);
        }
        Ok(out)
    }

    /// Every record needed to explain `ids`, parents before children.
    fn export_lineage(&self, ids: &[BranchId]) -> Result<Vec<Branch<R>>, HistoryError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in ids.iter().filter(|id| !id.is_nil()) {
            for branch in self.lineage(*id)?.into_iter().rev() {
                if seen.insert(branch.id) {
                    out.push(branch);
                }
            }
        }
        Ok(out)
    }
}

/// Arena of branch records with index-based parent links.
#[derive(Debug)]
pub struct BranchArena<R: Region> {
    records: Vec<Branch<R>>,
    parents: Vec<Option<usize>>,
    index: HashMap<BranchId, usize>,
}

impl<R: Region> BranchArena<R> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            parents: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: BranchId) -> Option<&Branch<R>> {
        self.index.get(&id).map(|idx| &self.records[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch<R>> {
        self.records.iter()
    }

    /// Validate `branch` against the arena. Returns the record to install, or
    /// `None` when the arena already holds it.
    pub fn plan_record(&self, branch: &Branch<R>) -> Result<Option<Branch<R>>, HistoryError> {
        if branch.id.is_nil() {
            return Err(HistoryError::DuplicateBranch(branch.id));
        }
        if let Some(end) = branch.interval.end {
            if end < branch.interval.start {
                return Err(HistoryError::IntervalRewrite {
                    id: branch.id,
                    detail: format!("end {end} precedes start {}", branch.interval.start),
                });
            }
        }
        let Some(existing) = self.get(branch.id) else {
            if let Some(parent) = branch.parent {
                if !self.index.contains_key(&parent) {
                    return Err(HistoryError::UnknownBranch(parent));
                }
            }
            return Ok(Some(branch.clone()));
        };
        let same_shape = existing.parent == branch.parent
            && existing.region == branch.region
            && existing.interval.start == branch.interval.start;
        if !same_shape {
            return Err(HistoryError::DuplicateBranch(branch.id));
        }
        match (existing.interval.end, branch.interval.end) {
            (None, Some(_)) => Ok(Some(branch.clone())),
            (Some(ours), Some(theirs)) if ours != theirs => {
                Err(HistoryError::DuplicateBranch(branch.id))
            }
            _ => Ok(None),
        }
    }

    pub fn plan_close(
        &self,
        id: BranchId,
        end: StateTimestamp,
    ) -> Result<Option<Branch<R>>, HistoryError> {
        let existing = self.get(id).ok_or(HistoryError::UnknownBranch(id))?;
        if end < existing.interval.start {
            return Err(HistoryError::IntervalRewrite {
                id,
                detail: format!("end {end} precedes start {}", existing.interval.start),
            });
        }
        match existing.interval.end {
            Some(current) if current == end => Ok(None),
            Some(current) => Err(HistoryError::IntervalRewrite {
                id,
                detail: format!("already closed at {current}"),
            }),
            None => {
                let mut closed = existing.clone();
                closed.interval.end = Some(end);
                Ok(Some(closed))
            }
        }
    }

    /// Install a record produced by `plan_record` or `plan_close`.
    pub fn install(&mut self, record: Branch<R>) {
        if let Some(idx) = self.index.get(&record.id) {
            self.records[*idx] = record;
            return;
        }
        let parent = record.parent.and_then(|p| self.index.get(&p).copied());
        let idx = self.records.len();
        self.index.insert(record.id, idx);
        self.parents.push(parent);
        self.records.push(record);
    }

    pub fn lineage(&self, id: BranchId) -> Result<Vec<Branch<R>>, HistoryError> {
        let mut cursor = Some(*self.index.get(&id).ok_or(HistoryError::UnknownBranch(id))?);
        let mut out = Vec::new();
        while let Some(idx) = cursor {
            out.push(self.records[idx].clone());
            cursor = self.parents[idx];
        }
        Ok(out)
    }
}

impl<R: Region> Default for BranchArena<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Volatile branch history, suitable for tests and single-process clusters.
#[derive(Debug)]
pub struct MemoryBranchHistory<R: Region> {
    arena: RwLock<BranchArena<R>>,
}

impl<R: Region> Default for MemoryBranchHistory<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Region> MemoryBranchHistory<R> {
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(BranchArena::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.read().map(|arena| arena.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> HistoryError {
    HistoryError::Persist("branch history lock poisoned".into())
}

impl<R: Region> BranchHistory<R> for MemoryBranchHistory<R> {
    fn get_branch(&self, id: BranchId) -> Result<Branch<R>, HistoryError> {
        let arena = self.arena.read().map_err(|_| poisoned())?;
        arena.get(id).cloned().ok_or(HistoryError::UnknownBranch(id))
    }

    fn record_branch(&self, branch: Branch<R>) -> Result<(), HistoryError> {
        let mut arena = self.arena.write().map_err(|_| poisoned())?;
        if let Some(record) = arena.plan_record(&branch)? {
            arena.install(record);
        }
        Ok(())
    }

    fn close_branch(&self, id: BranchId, end: StateTimestamp) -> Result<(), HistoryError> {
        let mut arena = self.arena.write().map_err(|_| poisoned())?;
        if let Some(record) = arena.plan_close(id, end)? {
            arena.install(record);
        }
        Ok(())
    }

    fn lineage(&self, id: BranchId) -> Result<Vec<Branch<R>>, HistoryError> {
        let arena = self.arena.read().map_err(|_| poisoned())?;
        arena.lineage(id)
    }
}
