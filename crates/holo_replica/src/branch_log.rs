//! Durable branch history.
//!
//! Each accepted append is written as one `len (u32 BE) | crc32 (u32 BE) |
//! json` record before it becomes visible. Replay on open rebuilds the arena
//! and truncates a torn or corrupt tail left by a crash mid-append.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use crc32fast::Hasher;
use holo_backfill::backfill::{
    Branch, BranchArena, BranchHistory, BranchId, HistoryError, Region, StateTimestamp,
};

/// File name of the branch log inside the node data directory.
pub const BRANCH_LOG_FILE: &str = "branches.log";
/// Upper bound on one record's payload. Longer headers are read as a torn tail.
const MAX_RECORD_BYTES: usize = 1 << 20;

struct LogInner<R: Region> {
    arena: BranchArena<R>,
    file: File,
}

pub struct FileBranchLog<R: Region> {
    path: PathBuf,
    sync: bool,
    inner: Mutex<LogInner<R>>,
}

impl<R: Region> FileBranchLog<R> {
    /// Open (or create) the log at `path` and replay it. With `sync`, every
    /// append is fsynced before it is acknowledged.
    pub fn open(path: impl AsRef<Path>, sync: bool) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create branch log dir")?;
        }

        let replay = read_records(&path)?;
        if replay.torn {
            tracing::warn!(
                path = %path.display(),
                valid_bytes = replay.valid_len,
                "discarding torn branch log tail"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .context("open branch log for truncation")?;
            file.set_len(replay.valid_len)
                .context("truncate branch log")?;
            file.sync_all().context("sync truncated branch log")?;
        }

        let mut arena = BranchArena::new();
        for payload in &replay.payloads {
            let branch: Branch<R> =
                serde_json::from_slice(payload).context("decode branch record")?;
            let id = branch.id;
            if let Some(record) = arena
                .plan_record(&branch)
                .with_context(|| format!("replay branch {id}"))?
            {
                arena.install(record);
            }
        }
        tracing::debug!(path = %path.display(), branches = arena.len(), "branch log replayed");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("open branch log for append")?;
        Ok(Self {
            path,
            sync,
            inner: Mutex::new(LogInner { arena, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.arena.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every record, in append order.
    pub fn branches(&self) -> Result<Vec<Branch<R>>, HistoryError> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.arena.iter().cloned().collect())
    }

    fn append(&self, inner: &mut LogInner<R>, record: Branch<R>) -> Result<(), HistoryError> {
        let payload = serde_json::to_vec(&record).map_err(|err| HistoryError::Persist(Box::new(err)))?;
        write_record(&mut inner.file, &payload, self.sync)
            .map_err(|err| HistoryError::Persist(Box::new(err)))?;
        inner.arena.install(record);
        Ok(())
    }
}

fn poisoned() -> HistoryError {
    HistoryError::Persist("branch log lock poisoned".into())
}

impl<R: Region> BranchHistory<R> for FileBranchLog<R> {
    fn get_branch(&self, id: BranchId) -> Result<Branch<R>, HistoryError> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        inner
            .arena
            .get(id)
            .cloned()
            .ok_or(HistoryError::UnknownBranch(id))
    }

    fn record_branch(&self, branch: Branch<R>) -> Result<(), HistoryError> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        match inner.arena.plan_record(&branch)? {
            Some(record) => self.append(&mut inner, record),
            None => Ok(()),
        }
    }

    fn close_branch(&self, id: BranchId, end: StateTimestamp) -> Result<(), HistoryError> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        match inner.arena.plan_close(id, end)? {
            Some(record) => self.append(&mut inner, record),
            None => Ok(()),
        }
    }

    fn lineage(&self, id: BranchId) -> Result<Vec<Branch<R>>, HistoryError> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.arena.lineage(id)
    }
}

/// Write a single length-prefixed record with CRC32 checksum.
fn write_record(file: &mut File, payload: &[u8], sync: bool) -> std::io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= MAX_RECORD_BYTES)
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "branch record too large"))?;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let checksum = hasher.finalize();
    let mut record = Vec::with_capacity(8 + payload.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(&checksum.to_be_bytes());
    record.extend_from_slice(payload);
    file.write_all(&record)?;
    file.flush()?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

struct Replay {
    payloads: Vec<Vec<u8>>,
    valid_len: u64,
    torn: bool,
}

/// Read every intact record; stop at the first short or corrupt one.
fn read_records(path: &Path) -> anyhow::Result<Replay> {
    let mut replay = Replay {
        payloads: Vec::new(),
        valid_len: 0,
        torn: false,
    };
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(replay),
        Err(err) => return Err(err).context("open branch log"),
    };
    let mut reader = BufReader::new(file);
    loop {
        let mut header = [0u8; 8];
        match read_full(&mut reader, &mut header)? {
            0 => break,
            n if n < header.len() => {
                replay.torn = true;
                break;
            }
            _ => {}
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_RECORD_BYTES {
            replay.torn = true;
            break;
        }
        let mut payload = vec![0u8; len];
        if read_full(&mut reader, &mut payload)? < len {
            replay.torn = true;
            break;
        }
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected {
            replay.torn = true;
            break;
        }
        replay.valid_len += (header.len() + len) as u64;
        replay.payloads.push(payload);
    }
    Ok(replay)
}

/// Like `read_exact`, but reports how many bytes arrived before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> anyhow::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("read branch log"),
        }
    }
    Ok(filled)
}
