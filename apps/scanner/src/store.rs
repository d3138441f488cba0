use crate::types::{BlockRange, ChunkResult, EventMap};
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Where chunk results land. Single writer (the controller); the engine only
/// sees this interface, the on-disk layout is an implementation choice.
pub trait Store: Send + Sync {
    /// Declares the starting block of a new scan session. If existing data
    /// already covers past `start_block`, the watermark resumes from there.
    fn setup(&mut self, start_block: u64) -> Result<()>;

    /// Inserts a chunk into the pending list and merges every chunk that now
    /// extends the watermark contiguously. Returns the number of blocks made
    /// durable by this call.
    fn process(&mut self, chunk: ChunkResult) -> Result<u64>;

    /// The sub-ranges of `[from, to]` not yet covered, sorted and disjoint.
    fn check_missing(&self, from: u64, to: u64) -> Result<Vec<BlockRange>>;

    /// Every stored event with `from <= blockNumber <= to`.
    fn get_events(&self, from: u64, to: u64) -> Result<EventMap>;

    /// Persists the durable prefix. Idempotent, safe to call at any point.
    fn save(&mut self) -> Result<()>;

    /// Highest block fully covered this session, `None` before any coverage.
    fn latest(&self) -> Option<u64>;
}

#[derive(Debug, Deserialize)]
struct StoreFile {
    #[allow(dead_code)]
    latest: u64,
    blocks: EventMap,
}

#[derive(Serialize)]
struct StoreFileRef<'a> {
    latest: u64,
    blocks: &'a EventMap,
}

#[derive(Debug)]
struct CurrentFile {
    /// First block this file is responsible for.
    first: u64,
    /// Lowest block not yet merged; the watermark is `next - 1`.
    next: u64,
    blocks: EventMap,
    path: Option<PathBuf>,
}

/// Default store: the event log partitioned into files named
/// `<firstBlock>.<lastBlock>.json`, highest file advancing monotonically.
pub struct FileStore {
    dir: PathBuf,
    max_entries: usize,
    save_interval: Duration,
    /// Disjoint sorted union of everything merged, on disk or in memory.
    coverage: Vec<BlockRange>,
    /// Chunks beyond the watermark, sorted by `range.from`.
    pending: Vec<ChunkResult>,
    current: Option<CurrentFile>,
    last_save: Instant,
}

impl FileStore {
    pub fn open(dir: &Path, max_entries: usize, save_interval: Duration) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create store dir {}", dir.display()))?;
        let mut coverage: Vec<BlockRange> =
            list_files(dir)?.into_iter().map(|(range, _)| range).collect();
        normalize_coverage(&mut coverage);
        if let Some(last) = coverage.last() {
            info!(dir = %dir.display(), covered_to = last.to, "store resumed from disk");
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            max_entries: max_entries.max(1),
            save_interval,
            coverage,
            pending: Vec::new(),
            current: None,
            last_save: Instant::now(),
        })
    }

    fn rotate(&mut self) {
        if let Some(cur) = self.current.as_mut() {
            info!(first = cur.first, next_file_start = cur.next, "store file rotated");
            *cur = CurrentFile {
                first: cur.next,
                next: cur.next,
                blocks: EventMap::new(),
                path: None,
            };
        }
    }
}

impl Store for FileStore {
    fn setup(&mut self, start_block: u64) -> Result<()> {
        self.save()?;
        let next = self
            .coverage
            .iter()
            .find(|seg| seg.contains(start_block))
            .map_or(start_block, |seg| seg.to.saturating_add(1));
        self.pending.retain(|c| c.range.to >= next);
        if self.current.as_ref().map(|c| c.next) == Some(next) {
            return Ok(());
        }
        debug!(start_block, next, "scan session starting");
        self.current = Some(CurrentFile {
            first: next,
            next,
            blocks: EventMap::new(),
            path: None,
        });
        Ok(())
    }

    fn process(&mut self, chunk: ChunkResult) -> Result<u64> {
        if self.current.is_none() {
            bail!("store has no active scan session");
        }
        let at = match self
            .pending
            .binary_search_by_key(&chunk.range.from, |c| c.range.from)
        {
            Ok(i) | Err(i) => i,
        };
        self.pending.insert(at, chunk);

        let mut merged_blocks = 0u64;
        loop {
            let Some(cur) = self.current.as_mut() else {
                break;
            };
            if self.pending.first().is_none_or(|c| c.range.from > cur.next) {
                break;
            }
            let chunk = self.pending.remove(0);
            for (block, events) in chunk.blocks {
                cur.blocks.insert(block, events);
            }
            cur.next = cur.next.max(chunk.range.to.saturating_add(1));
            merged_blocks += chunk.range.len();
            add_coverage(&mut self.coverage, chunk.range);
            debug!(range = %chunk.range, latest = cur.next - 1, "chunk merged");
        }

        if merged_blocks > 0 {
            let over_capacity = self
                .current
                .as_ref()
                .is_some_and(|c| c.blocks.len() >= self.max_entries);
            if over_capacity {
                self.save()?;
                self.rotate();
            } else if self.last_save.elapsed() >= self.save_interval {
                self.save()?;
            }
        }
        Ok(merged_blocks)
    }

    fn check_missing(&self, from: u64, to: u64) -> Result<Vec<BlockRange>> {
        if from > to {
            return Ok(Vec::new());
        }
        let mut missing = Vec::new();
        let mut cursor = from;
        for seg in &self.coverage {
            if seg.to < cursor {
                continue;
            }
            if seg.from > to {
                break;
            }
            if seg.from > cursor {
                missing.push(BlockRange::new(cursor, seg.from - 1));
            }
            cursor = seg.to.saturating_add(1);
            if cursor > to {
                return Ok(missing);
            }
        }
        missing.push(BlockRange::new(cursor, to));
        Ok(missing)
    }

    fn get_events(&self, from: u64, to: u64) -> Result<EventMap> {
        let mut out = EventMap::new();
        for (range, path) in list_files(&self.dir)? {
            if range.to < from || range.from > to {
                continue;
            }
            let text = fs::read_to_string(&path)
                .with_context(|| format!("read store file {}", path.display()))?;
            let file: StoreFile = serde_json::from_str(&text)
                .with_context(|| format!("parse store file {}", path.display()))?;
            for (block, events) in file.blocks {
                if from <= block && block <= to {
                    out.insert(block, events);
                }
            }
        }
        if let Some(cur) = &self.current {
            for (block, events) in &cur.blocks {
                if from <= *block && *block <= to {
                    out.insert(*block, events.clone());
                }
            }
        }
        Ok(out)
    }

    fn save(&mut self) -> Result<()> {
        let Some(cur) = self.current.as_mut() else {
            return Ok(());
        };
        if cur.next == cur.first {
            return Ok(());
        }
        let latest = cur.next - 1;
        let path = self.dir.join(format!("{}.{}.json", cur.first, latest));
        let body = serde_json::to_string_pretty(&StoreFileRef {
            latest,
            blocks: &cur.blocks,
        })
        .context("serialize store file")?;
        fs::write(&path, body).with_context(|| format!("write store file {}", path.display()))?;
        if let Some(old) = cur.path.take() {
            if old != path {
                let _ = fs::remove_file(&old);
            }
        }
        cur.path = Some(path);
        self.last_save = Instant::now();
        debug!(latest, "store saved");
        Ok(())
    }

    fn latest(&self) -> Option<u64> {
        self.current.as_ref()?.next.checked_sub(1)
    }
}

fn list_files(dir: &Path) -> Result<Vec<(BlockRange, PathBuf)>> {
    let mut files = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("read store dir {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };
        let Some((first, last)) = stem.split_once('.') else {
            continue;
        };
        let (Ok(first), Ok(last)) = (first.parse::<u64>(), last.parse::<u64>()) else {
            continue;
        };
        if first > last {
            continue;
        }
        files.push((BlockRange::new(first, last), path));
    }
    files.sort_by_key(|(range, _)| range.from);
    Ok(files)
}

fn add_coverage(coverage: &mut Vec<BlockRange>, range: BlockRange) {
    coverage.push(range);
    normalize_coverage(coverage);
}

fn normalize_coverage(coverage: &mut Vec<BlockRange>) {
    coverage.sort_by_key(|r| r.from);
    let mut out: Vec<BlockRange> = Vec::with_capacity(coverage.len());
    for range in coverage.drain(..) {
        match out.last_mut() {
            Some(last) if range.from <= last.to.saturating_add(1) => {
                last.to = last.to.max(range.to);
            }
            _ => out.push(range),
        }
    }
    *coverage = out;
}
