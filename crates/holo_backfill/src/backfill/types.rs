//! Key space, time and lineage primitives.
//!
//! Both protocol roles and every store-view or transport implementation
//! outside this crate build on these, so the module only depends on serde
//! and uuid.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A subset of the key space used to scope reads, writes and sessions.
///
/// Implementations must be canonical: every empty region compares equal to
/// every other empty region, so that `==` can be used for piece matching.
pub trait Region:
    Clone + fmt::Debug + fmt::Display + PartialEq + Eq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    type Key: Clone + Ord + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static;

    fn is_empty(&self) -> bool;
    fn contains_key(&self, key: &Self::Key) -> bool;
    fn intersection(&self, other: &Self) -> Self;
    fn is_superset(&self, other: &Self) -> bool;
    /// Pieces of `self` not covered by `other`.
    fn subtract(&self, other: &Self) -> Vec<Self>;
    /// Split into (`keys < key`, `keys >= key`), both restricted to `self`.
    fn split_at(&self, key: &Self::Key) -> (Self, Self);
    /// Union of two regions when the union is itself a region.
    fn union_adjacent(&self, other: &Self) -> Option<Self>;

    fn overlaps(&self, other: &Self) -> bool {
        !self.intersection(other).is_empty()
    }
}

/// Lexicographic, end-exclusive byte-key range. An empty `end` means the
/// range is unbounded on the high side.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    start: Vec<u8>,
    end: Vec<u8>,
}

impl KeyRange {
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        let start = start.into();
        let end = end.into();
        if !end.is_empty() && start >= end {
            return Self::empty();
        }
        Self { start, end }
    }

    /// The whole key space.
    pub fn full() -> Self {
        Self {
            start: Vec::new(),
            end: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            start: vec![0],
            end: vec![0],
        }
    }

    /// Range holding exactly `key`.
    pub fn point(key: &[u8]) -> Self {
        let mut end = key.to_vec();
        end.push(0);
        Self::new(key.to_vec(), end)
    }

    pub fn start(&self) -> &[u8] {
        &self.start
    }

    pub fn end(&self) -> &[u8] {
        &self.end
    }

    fn is_unbounded(&self) -> bool {
        self.end.is_empty()
    }
}

/// Compare range ends where an empty end means +infinity.
fn end_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Greater,
        (false, true) => std::cmp::Ordering::Less,
        (false, false) => a.cmp(b),
    }
}

impl Region for KeyRange {
    type Key = Vec<u8>;

    fn is_empty(&self) -> bool {
        !self.end.is_empty() && self.start >= self.end
    }

    fn contains_key(&self, key: &Vec<u8>) -> bool {
        let lower_ok = key.as_slice() >= self.start.as_slice();
        let upper_ok = self.is_unbounded() || key.as_slice() < self.end.as_slice();
        !self.is_empty() && lower_ok && upper_ok
    }

    fn intersection(&self, other: &Self) -> Self {
        if self.is_empty() || other.is_empty() {
            return Self::empty();
        }
        let start = self.start.clone().max(other.start.clone());
        let end = if end_cmp(&self.end, &other.end).is_le() {
            self.end.clone()
        } else {
            other.end.clone()
        };
        Self::new(start, end)
    }

    fn is_superset(&self, other: &Self) -> bool {
        if other.is_empty() {
            return true;
        }
        if self.is_empty() {
            return false;
        }
        self.start <= other.start && end_cmp(&self.end, &other.end).is_ge()
    }

    fn subtract(&self, other: &Self) -> Vec<Self> {
        let overlap = self.intersection(other);
        if overlap.is_empty() {
            return if self.is_empty() {
                Vec::new()
            } else {
                vec![self.clone()]
            };
        }
        let mut out = Vec::with_capacity(2);
        if self.start < overlap.start {
            out.push(Self::new(self.start.clone(), overlap.start.clone()));
        }
        if !overlap.is_unbounded() && end_cmp(&overlap.end, &self.end).is_lt() {
            out.push(Self::new(overlap.end.clone(), self.end.clone()));
        }
        out
    }

    fn split_at(&self, key: &Vec<u8>) -> (Self, Self) {
        if key.is_empty() {
            return (Self::empty(), self.clone());
        }
        let below = self.intersection(&Self::new(Vec::new(), key.clone()));
        let above = self.intersection(&Self::new(key.clone(), Vec::new()));
        (below, above)
    }

    fn union_adjacent(&self, other: &Self) -> Option<Self> {
        if self.is_empty() {
            return Some(other.clone());
        }
        if other.is_empty() {
            return Some(self.clone());
        }
        let (lo, hi) = if self.start <= other.start {
            (self, other)
        } else {
            (other, self)
        };
        // `hi` must start at or before the end of `lo` for the union to be contiguous.
        if !lo.is_unbounded() && hi.start > lo.end {
            return None;
        }
        let end = if end_cmp(&lo.end, &hi.end).is_ge() {
            lo.end.clone()
        } else {
            hi.end.clone()
        };
        Some(Self::new(lo.start.clone(), end))
    }
}

fn write_key(f: &mut fmt::Formatter<'_>, key: &[u8]) -> fmt::Result {
    for byte in key {
        write!(f, "{}", std::ascii::escape_default(*byte))?;
    }
    Ok(())
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("[)");
        }
        f.write_str("[")?;
        write_key(f, &self.start)?;
        f.write_str(", ")?;
        if self.is_unbounded() {
            f.write_str("+inf")?;
        } else {
            write_key(f, &self.end)?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyRange{self}")
    }
}

/// Monotonically comparable version stamp assigned per write. Zero is
/// reserved for "no writes"; every stored entry carries at least one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateTimestamp(pub u64);

impl StateTimestamp {
    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for StateTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Stable identifier of a branch in the lineage DAG.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(pub Uuid);

impl BranchId {
    /// The "no history" sentinel every lineage is rooted at.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            f.write_str("nil")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Caller-generated unique id of one backfill attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point in causal history: a branch and a timestamp on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: StateTimestamp,
}

impl Version {
    pub const fn new(branch: BranchId, timestamp: StateTimestamp) -> Self {
        Self { branch, timestamp }
    }

    pub const fn zero() -> Self {
        Self {
            branch: BranchId::nil(),
            timestamp: StateTimestamp::zero(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.branch.is_nil() && self.timestamp == StateTimestamp::zero()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.timestamp)
    }
}

/// Span of logical time during which a branch was authoritative.
/// `end` is only ever set once, when the branch is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampInterval {
    pub start: StateTimestamp,
    pub end: Option<StateTimestamp>,
}

impl TimestampInterval {
    pub const fn open(start: StateTimestamp) -> Self {
        Self { start, end: None }
    }

    pub fn is_closed(&self) -> bool {
        self.end.is_some()
    }
}

/// One branch of the lineage DAG. The branch forked from `parent` at
/// `interval.start`; a root branch forked from the nil sentinel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Branch<R: Region> {
    pub id: BranchId,
    pub parent: Option<BranchId>,
    pub region: R,
    pub interval: TimestampInterval,
}

impl<R: Region> Branch<R> {
    pub fn root(id: BranchId, region: R, start: StateTimestamp) -> Self {
        Self {
            id,
            parent: None,
            region,
            interval: TimestampInterval::open(start),
        }
    }

    /// Fork a new branch off `origin`. Forking from the zero version yields a root.
    pub fn fork(id: BranchId, origin: Version, region: R) -> Self {
        Self {
            id,
            parent: (!origin.branch.is_nil()).then_some(origin.branch),
            region,
            interval: TimestampInterval::open(origin.timestamp),
        }
    }
}

/// One stored row: key, opaque value and the timestamp that wrote it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<K> {
    pub key: K,
    pub value: Vec<u8>,
    pub timestamp: StateTimestamp,
}

impl<K> Entry<K> {
    pub fn new(key: K, value: impl Into<Vec<u8>>, timestamp: StateTimestamp) -> Self {
        Self {
            key,
            value: value.into(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: &str, end: &str) -> KeyRange {
        KeyRange::new(start.as_bytes(), end.as_bytes())
    }

    #[test]
    fn empty_ranges_are_canonical() {
        assert_eq!(r("c", "a"), KeyRange::empty());
        assert_eq!(r("b", "b"), KeyRange::empty());
        assert!(r("a", "c").intersection(&r("c", "e")).is_empty());
        assert_eq!(r("a", "c").intersection(&r("d", "")), KeyRange::empty());
    }

    #[test]
    fn unbounded_end_contains_high_keys() {
        let tail = r("m", "");
        assert!(tail.contains_key(&b"zzzz".to_vec()));
        assert!(!tail.contains_key(&b"a".to_vec()));
        assert!(KeyRange::full().is_superset(&tail));
        assert!(!tail.is_superset(&KeyRange::full()));
    }

    #[test]
    fn subtract_yields_left_and_right_pieces() {
        let pieces = r("a", "z").subtract(&r("f", "k"));
        assert_eq!(pieces, vec![r("a", "f"), r("k", "z")]);

        let pieces = KeyRange::full().subtract(&r("f", "k"));
        assert_eq!(pieces, vec![r("", "f"), r("k", "")]);

        assert!(r("f", "k").subtract(&r("a", "z")).is_empty());
        assert_eq!(r("a", "c").subtract(&r("x", "z")), vec![r("a", "c")]);
    }

    #[test]
    fn split_at_respects_bounds() {
        let (lo, hi) = r("a", "z").split_at(&b"m".to_vec());
        assert_eq!(lo, r("a", "m"));
        assert_eq!(hi, r("m", "z"));

        let (lo, hi) = r("a", "c").split_at(&b"q".to_vec());
        assert_eq!(lo, r("a", "c"));
        assert!(hi.is_empty());

        let (lo, hi) = r("a", "c").split_at(&Vec::new());
        assert!(lo.is_empty());
        assert_eq!(hi, r("a", "c"));
    }

    #[test]
    fn union_adjacent_only_joins_contiguous_ranges() {
        assert_eq!(r("a", "c").union_adjacent(&r("c", "f")), Some(r("a", "f")));
        assert_eq!(r("c", "").union_adjacent(&r("a", "c")), Some(r("a", "")));
        assert_eq!(r("a", "c").union_adjacent(&r("d", "f")), None);
    }

    #[test]
    fn point_range_holds_single_key() {
        let p = KeyRange::point(b"k");
        assert!(p.contains_key(&b"k".to_vec()));
        assert!(!p.contains_key(&b"k\x01".to_vec()));
        assert!(!p.contains_key(&b"j".to_vec()));
    }

    #[test]
    fn fork_from_zero_is_a_root() {
        let id = BranchId::generate();
        let branch = Branch::fork(id, Version::zero(), KeyRange::full());
        assert_eq!(branch.parent, None);
        assert_eq!(branch.interval.start, StateTimestamp::zero());
    }
}
