//! Extent handles: append-only block containers backing one replica.
//!
//! An extent replica is a pair of files: `<id>.ext` holds the raw
//! concatenation of block payloads (exactly the bytes a `CopyExtent` stream
//! ships and the erasure codec stripes), and `<id>.idx` records block
//! boundaries as fixed-size `{offset, len, crc32}` entries behind a small
//! header carrying the seal state. Commit length counts payload bytes only,
//! so append offsets are payload offsets.
//!
//! The index file doubles as the write-ahead log: an append writes payload
//! bytes through a [`SyncingFile`], syncs them, then appends and syncs the
//! index records. A crash between the two steps leaves unindexed payload
//! bytes, which reopening truncates away; those bytes were never
//! acknowledged.
//!
//! Erasure-coded shard replicas are opaque: a bare `<id>.ext` with no
//! sidecar opens as a sealed extent whose length is the file length, serving
//! `CopyExtent` and reconstruction but not block reads.

use crate::error::{BasaltError, Result};
use crate::storage::{SyncingFile, SyncingFileOptions};
use crate::types::{Block, Code, ExtentId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::warn;

const INDEX_MAGIC: u32 = 0x4253_4c54;
const INDEX_VERSION: u32 = 1;
const INDEX_HEADER_SIZE: usize = 16;
const INDEX_RECORD_SIZE: usize = 12;

/// One block boundary record in the index sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub offset: u32,
    pub len: u32,
    pub crc: u32,
}

impl BlockEntry {
    pub fn end(&self) -> u32 {
        self.offset + self.len
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(&self.len.to_be_bytes());
        buf.extend_from_slice(&self.crc.to_be_bytes());
    }

    fn decode(raw: &[u8]) -> Self {
        let field = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&raw[i * 4..i * 4 + 4]);
            u32::from_be_bytes(b)
        };
        Self {
            offset: field(0),
            len: field(1),
            crc: field(2),
        }
    }
}

/// A block read back together with its offset, for WAL-style replay.
#[derive(Debug, Clone)]
pub struct Entry {
    pub offset: u32,
    pub data: Block,
    pub crc: u32,
}

/// Outcome of a block read.
#[derive(Debug)]
pub struct ReadBlocksResult {
    pub blocks: Vec<Block>,
    /// Offset immediately after the last returned block.
    pub end: u32,
    pub code: Code,
}

/// Outcome of an entry read.
#[derive(Debug)]
pub struct ReadEntriesResult {
    pub entries: Vec<Entry>,
    pub end: u32,
    pub code: Code,
}

struct Writer {
    data: SyncingFile,
    index: File,
}

struct ExtentInner {
    writer: Option<Writer>,
    blocks: Vec<BlockEntry>,
}

/// Handle to one extent replica.
///
/// All mutations go through the per-extent [`lock`](Extent::lock); readers
/// that only need the commit length use the atomic snapshot instead.
pub struct Extent {
    id: ExtentId,
    data_path: PathBuf,
    has_index: bool,
    inner: Mutex<ExtentInner>,
    commit: AtomicU32,
    sealed: AtomicBool,
    sealed_length: AtomicU32,
    append_lock: tokio::sync::Mutex<()>,
}

impl Extent {
    /// Create a fresh, open extent at `data_path`.
    pub fn create(id: ExtentId, data_path: &Path, options: SyncingFileOptions) -> Result<Self> {
        let data = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(data_path)?;

        let index_path = index_path_for(data_path);
        let mut index = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&index_path)?;
        index.write_all(&encode_index_header(false, 0))?;
        index.sync_data()?;

        Ok(Self {
            id,
            data_path: data_path.to_path_buf(),
            has_index: true,
            inner: Mutex::new(ExtentInner {
                writer: Some(Writer {
                    data: SyncingFile::new(data, options, 0),
                    index,
                }),
                blocks: Vec::new(),
            }),
            commit: AtomicU32::new(0),
            sealed: AtomicBool::new(false),
            sealed_length: AtomicU32::new(0),
            append_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Open an existing replica. A replica without an index sidecar is an
    /// opaque sealed shard; one with a sidecar replays the index, truncating
    /// unacknowledged payload bytes left by a torn append.
    pub fn open(id: ExtentId, data_path: &Path, options: SyncingFileOptions) -> Result<Self> {
        let index_path = index_path_for(data_path);
        let data_len = std::fs::metadata(data_path)?.len();

        if !index_path.exists() {
            let len = u32::try_from(data_len)
                .map_err(|_| BasaltError::BadState(format!("extent {} exceeds 4 GiB", id)))?;
            return Ok(Self {
                id,
                data_path: data_path.to_path_buf(),
                has_index: false,
                inner: Mutex::new(ExtentInner {
                    writer: None,
                    blocks: Vec::new(),
                }),
                commit: AtomicU32::new(len),
                sealed: AtomicBool::new(true),
                sealed_length: AtomicU32::new(len),
                append_lock: tokio::sync::Mutex::new(()),
            });
        }

        let mut index = OpenOptions::new().read(true).write(true).open(&index_path)?;
        let mut raw = Vec::new();
        index.read_to_end(&mut raw)?;
        let (sealed, sealed_length) = decode_index_header(id, &raw)?;

        // Replay contiguous records covered by the data file.
        let mut blocks = Vec::new();
        let mut end: u32 = 0;
        let records = &raw[INDEX_HEADER_SIZE..];
        for chunk in records.chunks_exact(INDEX_RECORD_SIZE) {
            let entry = BlockEntry::decode(chunk);
            if entry.offset != end || u64::from(entry.end()) > data_len {
                warn!(
                    extent_id = id,
                    offset = entry.offset,
                    "dropping index record past the valid prefix"
                );
                break;
            }
            end = entry.end();
            blocks.push(entry);
        }

        let commit = if sealed {
            data_len.min(u64::from(sealed_length)) as u32
        } else {
            end
        };

        let data = OpenOptions::new().write(true).append(true).open(data_path)?;
        if !sealed && data_len > u64::from(commit) {
            // Torn append: payload bytes beyond the indexed prefix were
            // never acknowledged.
            data.set_len(u64::from(commit))?;
        } else if sealed && data_len > u64::from(sealed_length) {
            data.set_len(u64::from(sealed_length))?;
        }

        // Repair the sidecar if trailing records were dropped.
        let valid_index_len = (INDEX_HEADER_SIZE + blocks.len() * INDEX_RECORD_SIZE) as u64;
        if raw.len() as u64 > valid_index_len {
            index.set_len(valid_index_len)?;
            index.sync_data()?;
        }

        Ok(Self {
            id,
            data_path: data_path.to_path_buf(),
            has_index: true,
            inner: Mutex::new(ExtentInner {
                writer: Some(Writer {
                    data: SyncingFile::new(data, options, u64::from(commit)),
                    index,
                }),
                blocks,
            }),
            commit: AtomicU32::new(commit),
            sealed: AtomicBool::new(sealed),
            sealed_length: AtomicU32::new(sealed_length),
            append_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> ExtentId {
        self.id
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Bytes durably accepted. Lock-free snapshot; monotonically
    /// non-decreasing under the extent lock except through explicit
    /// rollback.
    pub fn commit_length(&self) -> u32 {
        self.commit.load(Ordering::SeqCst)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub fn sealed_length(&self) -> u32 {
        self.sealed_length.load(Ordering::SeqCst)
    }

    /// Acquire the per-extent exclusive lock. Every mutation, and any
    /// sequence that must observe a stable commit length across awaits,
    /// runs under this guard.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.append_lock.lock().await
    }

    /// Append blocks: payload bytes first (synced), then index records
    /// (synced). Returns the offset of each appended block and the commit
    /// length after the batch. Callers serialise through [`lock`](Self::lock).
    pub fn append_with_wal(&self, blocks: &[Block]) -> Result<(Vec<u32>, u32)> {
        if self.is_sealed() {
            return Err(BasaltError::BadState(format!(
                "extent {} is sealed",
                self.id
            )));
        }

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let writer = inner.writer.as_mut().ok_or_else(|| {
            BasaltError::BadState(format!("extent {} has no writable replica", self.id))
        })?;

        let start = self.commit.load(Ordering::SeqCst);
        let total: u64 = blocks.iter().map(|b| b.len() as u64).sum();
        if u64::from(start) + total > u64::from(u32::MAX) {
            return Err(BasaltError::BadState(format!(
                "extent {} would exceed 4 GiB",
                self.id
            )));
        }

        let mut offsets = Vec::with_capacity(blocks.len());
        let mut entries = Vec::with_capacity(blocks.len());
        let mut offset = start;
        for block in blocks {
            writer.data.write(block)?;
            offsets.push(offset);
            entries.push(BlockEntry {
                offset,
                len: block.len() as u32,
                crc: crc32fast::hash(block),
            });
            offset += block.len() as u32;
        }
        writer.data.sync()?;

        let mut buf = Vec::with_capacity(entries.len() * INDEX_RECORD_SIZE);
        for entry in &entries {
            entry.encode_into(&mut buf);
        }
        writer.index.seek(SeekFrom::End(0))?;
        writer.index.write_all(&buf)?;
        writer.index.sync_data()?;

        inner.blocks.extend_from_slice(&entries);
        self.commit.store(offset, Ordering::SeqCst);

        Ok((offsets, offset))
    }

    /// Freeze the extent at `sealed_length`. Idempotent at the same length;
    /// sealing beyond the local commit length is refused (this replica does
    /// not hold the bytes).
    pub fn seal(&self, sealed_length: u32) -> Result<()> {
        if self.is_sealed() {
            if self.sealed_length() == sealed_length {
                return Ok(());
            }
            return Err(BasaltError::BadState(format!(
                "extent {} already sealed at {}",
                self.id,
                self.sealed_length()
            )));
        }
        if sealed_length > self.commit_length() {
            return Err(BasaltError::BadState(format!(
                "cannot seal extent {} at {}: commit length is {}",
                self.id,
                sealed_length,
                self.commit_length()
            )));
        }

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let writer = inner.writer.as_mut().ok_or_else(|| {
            BasaltError::BadState(format!("extent {} has no writable replica", self.id))
        })?;

        writer.data.truncate(u64::from(sealed_length))?;
        inner.blocks.retain(|b| b.end() <= sealed_length);
        rewrite_index(&mut writer.index, true, sealed_length, &inner.blocks)?;

        self.sealed_length.store(sealed_length, Ordering::SeqCst);
        self.sealed.store(true, Ordering::SeqCst);
        self.commit.store(sealed_length, Ordering::SeqCst);
        Ok(())
    }

    /// Roll the extent back to `offset`, discarding later blocks. Used by
    /// the append coordinator when replicas diverge, before the failure is
    /// surfaced; never valid on a sealed extent.
    pub fn truncate_to(&self, offset: u32) -> Result<()> {
        if self.is_sealed() {
            return Err(BasaltError::BadState(format!(
                "extent {} is sealed",
                self.id
            )));
        }

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let writer = inner.writer.as_mut().ok_or_else(|| {
            BasaltError::BadState(format!("extent {} has no writable replica", self.id))
        })?;

        writer.data.truncate(u64::from(offset))?;
        inner.blocks.retain(|b| b.end() <= offset);
        let len = (INDEX_HEADER_SIZE + inner.blocks.len() * INDEX_RECORD_SIZE) as u64;
        writer.index.set_len(len)?;
        writer.index.sync_data()?;

        self.commit.store(offset, Ordering::SeqCst);
        Ok(())
    }

    /// Read up to `num_blocks` whole blocks starting at the block boundary
    /// `offset`, capped at `max_bytes` of payload (the first block is always
    /// returned even when it alone exceeds the cap).
    pub fn read_blocks(&self, offset: u32, num_blocks: u32, max_bytes: u32) -> Result<ReadBlocksResult> {
        let commit = self.commit_length();
        if offset == commit {
            return Ok(ReadBlocksResult {
                blocks: Vec::new(),
                end: offset,
                code: self.end_code(),
            });
        }
        if offset > commit {
            return Err(BasaltError::BadState(format!(
                "offset {} beyond commit length {}",
                offset, commit
            )));
        }

        let picked = self.entries_from(offset, num_blocks as usize, max_bytes)?;
        let end = picked.last().map(|e| e.end()).unwrap_or(offset);

        let mut file = File::open(&self.data_path)?;
        let mut blocks = Vec::with_capacity(picked.len());
        for entry in &picked {
            blocks.push(Bytes::from(read_block_at(&mut file, entry)?));
        }

        let code = if end == commit { self.end_code() } else { Code::Ok };
        Ok(ReadBlocksResult { blocks, end, code })
    }

    /// Read block entries with their payloads starting at `offset`, capped
    /// at `max_bytes`. With `replay` set, every payload is checked against
    /// its recorded crc32 (recovery-mode iteration).
    pub fn read_entries(&self, offset: u32, max_bytes: u32, replay: bool) -> Result<ReadEntriesResult> {
        let commit = self.commit_length();
        if offset == commit {
            return Ok(ReadEntriesResult {
                entries: Vec::new(),
                end: offset,
                code: self.end_code(),
            });
        }
        if offset > commit {
            return Err(BasaltError::BadState(format!(
                "offset {} beyond commit length {}",
                offset, commit
            )));
        }

        let picked = self.entries_from(offset, usize::MAX, max_bytes)?;
        let end = picked.last().map(|e| e.end()).unwrap_or(offset);

        let mut file = File::open(&self.data_path)?;
        let mut entries = Vec::with_capacity(picked.len());
        for entry in &picked {
            let data = read_block_at(&mut file, entry)?;
            if replay && crc32fast::hash(&data) != entry.crc {
                warn!(
                    extent_id = self.id,
                    offset = entry.offset,
                    "block payload does not match recorded checksum"
                );
                return Err(BasaltError::Invariant(format!(
                    "extent {} block at {} fails checksum",
                    self.id, entry.offset
                )));
            }
            entries.push(Entry {
                offset: entry.offset,
                data: Bytes::from(data),
                crc: entry.crc,
            });
        }

        let code = if end == commit { self.end_code() } else { Code::Ok };
        Ok(ReadEntriesResult { entries, end, code })
    }

    /// Fresh read handle over the raw payload bytes, for copy streaming.
    pub fn reader(&self) -> Result<File> {
        Ok(File::open(&self.data_path)?)
    }

    fn end_code(&self) -> Code {
        if self.is_sealed() {
            Code::EndOfExtent
        } else {
            Code::EndOfStream
        }
    }

    fn entries_from(&self, offset: u32, limit: usize, max_bytes: u32) -> Result<Vec<BlockEntry>> {
        let inner = self.inner.lock();
        if !self.has_index {
            return Err(BasaltError::BadState(format!(
                "extent {} holds an opaque shard with no block index",
                self.id
            )));
        }

        let start = inner
            .blocks
            .binary_search_by_key(&offset, |e| e.offset)
            .map_err(|_| {
                BasaltError::BadState(format!("offset {} is not a block boundary", offset))
            })?;

        let mut picked = Vec::new();
        let mut total: u64 = 0;
        for entry in inner.blocks.iter().skip(start).take(limit) {
            if !picked.is_empty() && total + u64::from(entry.len) > u64::from(max_bytes) {
                break;
            }
            total += u64::from(entry.len);
            picked.push(*entry);
        }
        Ok(picked)
    }
}

/// Write a complete index sidecar for a recovered replica.
pub fn write_index(data_path: &Path, entries: &[BlockEntry], sealed_length: u32) -> Result<()> {
    let path = index_path_for(data_path);
    let mut index = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    rewrite_index(&mut index, true, sealed_length, entries)?;
    Ok(())
}

/// Index sidecar path belonging to a data file.
pub fn index_path_for(data_path: &Path) -> PathBuf {
    data_path.with_extension("idx")
}

fn encode_index_header(sealed: bool, sealed_length: u32) -> [u8; INDEX_HEADER_SIZE] {
    let mut header = [0u8; INDEX_HEADER_SIZE];
    header[..4].copy_from_slice(&INDEX_MAGIC.to_be_bytes());
    header[4..8].copy_from_slice(&INDEX_VERSION.to_be_bytes());
    header[8..12].copy_from_slice(&u32::from(sealed).to_be_bytes());
    header[12..16].copy_from_slice(&sealed_length.to_be_bytes());
    header
}

fn decode_index_header(id: ExtentId, raw: &[u8]) -> Result<(bool, u32)> {
    if raw.len() < INDEX_HEADER_SIZE {
        return Err(BasaltError::BadState(format!(
            "extent {} index sidecar is shorter than its header",
            id
        )));
    }
    let field = |i: usize| {
        let mut b = [0u8; 4];
        b.copy_from_slice(&raw[i * 4..i * 4 + 4]);
        u32::from_be_bytes(b)
    };
    if field(0) != INDEX_MAGIC {
        return Err(BasaltError::BadState(format!(
            "extent {} index sidecar has a bad magic",
            id
        )));
    }
    if field(1) != INDEX_VERSION {
        return Err(BasaltError::BadState(format!(
            "extent {} index sidecar has unsupported version {}",
            id,
            field(1)
        )));
    }
    Ok((field(2) != 0, field(3)))
}

fn rewrite_index(index: &mut File, sealed: bool, sealed_length: u32, entries: &[BlockEntry]) -> Result<()> {
    let mut buf = Vec::with_capacity(INDEX_HEADER_SIZE + entries.len() * INDEX_RECORD_SIZE);
    buf.extend_from_slice(&encode_index_header(sealed, sealed_length));
    for entry in entries {
        entry.encode_into(&mut buf);
    }
    index.seek(SeekFrom::Start(0))?;
    index.write_all(&buf)?;
    index.set_len(buf.len() as u64)?;
    index.sync_data()?;
    Ok(())
}

fn read_block_at(file: &mut File, entry: &BlockEntry) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(u64::from(entry.offset)))?;
    let mut data = vec![0u8; entry.len as usize];
    file.read_exact(&mut data)?;
    Ok(data)
}
