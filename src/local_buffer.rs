//! # Durable Buffer - Crash-Safe On-Disk Priority Queue
//!
//! Holds serialized batches that could not be delivered to the central
//! brain. Survives process crashes and reboots: every append and delete is
//! fsync-durable before the call returns, and the in-memory index is
//! rebuilt by scanning the file on open.
//!
//! ## Storage layout
//!
//! A single append-only file of records, each a fixed 40-byte header
//! followed by a JSON body (`{endpoint, payload, timestamp}`):
//!
//! ```text
//! offset  size  field
//! 0       4     magic "SIDB"
//! 4       4     body length (u32 LE)
//! 8       8     record id (u64 LE, monotonically increasing)
//! 16      1     priority (0 critical .. 3 low)
//! 17      1     tombstone flag
//! 18      2     reserved
//! 20      4     retry count (u32 LE)
//! 24      8     created_at epoch seconds (f64 LE bits)
//! 32      8     last_retry epoch seconds (f64 LE bits, 0 = never)
//! ```
//!
//! Deletion and retry marking are in-place header writes; `vacuum` rewrites
//! the live records into a fresh file and atomically renames it over the
//! old one. A torn trailing record from a crash mid-append is truncated
//! away during the open scan.
//!
//! The store does blocking I/O; the async [`DurableBuffer`] facade runs
//! every operation on the blocking worker pool so buffer work never stalls
//! the scheduling loop.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::wire::unix_now;
use crate::{Result, TelemetryError};

const MAGIC: [u8; 4] = *b"SIDB";
const HEADER_LEN: u64 = 40;
/// Maximum low-priority records removed by one over-budget purge.
const PURGE_BATCH: usize = 1000;

/// An undelivered batch as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedItem {
    pub id: u64,
    /// JSON envelope: `{endpoint, payload, timestamp}`
    pub data: String,
    /// 0 critical .. 3 low
    pub priority: u8,
    pub created_at: f64,
    pub retry_count: u32,
}

/// Buffer occupancy statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStats {
    pub total_items: usize,
    pub by_priority: HashMap<u8, usize>,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub max_size_mb: u64,
    pub oldest_item_age: f64,
    pub is_full: bool,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    id: u64,
    offset: u64,
    body_len: u32,
    priority: u8,
    created_at: f64,
    retry_count: u32,
    last_retry: f64,
    live: bool,
}

impl IndexEntry {
    fn record_len(&self) -> u64 {
        HEADER_LEN + self.body_len as u64
    }
}

fn encode_header(entry: &IndexEntry) -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[0..4].copy_from_slice(&MAGIC);
    header[4..8].copy_from_slice(&entry.body_len.to_le_bytes());
    header[8..16].copy_from_slice(&entry.id.to_le_bytes());
    header[16] = entry.priority;
    header[17] = u8::from(!entry.live);
    header[20..24].copy_from_slice(&entry.retry_count.to_le_bytes());
    header[24..32].copy_from_slice(&entry.created_at.to_le_bytes());
    header[32..40].copy_from_slice(&entry.last_retry.to_le_bytes());
    header
}

fn decode_header(header: &[u8; HEADER_LEN as usize], offset: u64) -> Option<IndexEntry> {
    if header[0..4] != MAGIC {
        return None;
    }
    Some(IndexEntry {
        id: u64::from_le_bytes(header[8..16].try_into().ok()?),
        offset,
        body_len: u32::from_le_bytes(header[4..8].try_into().ok()?),
        priority: header[16],
        created_at: f64::from_le_bytes(header[24..32].try_into().ok()?),
        retry_count: u32::from_le_bytes(header[20..24].try_into().ok()?),
        last_retry: f64::from_le_bytes(header[32..40].try_into().ok()?),
        live: header[17] == 0,
    })
}

/// Synchronous log-structured store. Single-writer; callers serialize
/// access (the async facade holds it behind a mutex).
pub struct BufferStore {
    path: PathBuf,
    file: File,
    index: Vec<IndexEntry>,
    by_id: HashMap<u64, usize>,
    next_id: u64,
    max_size_bytes: u64,
    retention_secs: f64,
}

impl BufferStore {
    /// Open or create the buffer file and rebuild the index by scanning.
    pub fn open(path: &Path, max_size_mb: u64, retention_hours: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut store = Self {
            path: path.to_path_buf(),
            file,
            index: Vec::new(),
            by_id: HashMap::new(),
            next_id: 1,
            max_size_bytes: max_size_mb * 1024 * 1024,
            retention_secs: retention_hours as f64 * 3600.0,
        };
        store.rebuild_index()?;
        Ok(store)
    }

    fn rebuild_index(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut offset = 0u64;
        let mut max_id = 0u64;
        self.index.clear();
        self.by_id.clear();

        while offset + HEADER_LEN <= file_len {
            self.file.seek(SeekFrom::Start(offset))?;
            let mut header = [0u8; HEADER_LEN as usize];
            self.file.read_exact(&mut header)?;

            let Some(entry) = decode_header(&header, offset) else {
                warn!(offset, "corrupt buffer record header; truncating tail");
                break;
            };
            let record_len = entry.record_len();
            if offset + record_len > file_len {
                warn!(offset, "torn buffer record from interrupted append; truncating tail");
                break;
            }

            max_id = max_id.max(entry.id);
            offset += record_len;
            if entry.live {
                self.by_id.insert(entry.id, self.index.len());
            }
            self.index.push(entry);
        }

        if offset < file_len {
            self.file.set_len(offset)?;
            self.file.sync_data()?;
        }
        self.next_id = max_id + 1;
        debug!(
            records = self.index.len(),
            live = self.by_id.len(),
            "buffer index rebuilt"
        );
        Ok(())
    }

    /// Append a record; durable before returning.
    pub fn append(&mut self, body: &[u8], priority: u8) -> Result<u64> {
        let offset = self.file.seek(SeekFrom::End(0))?;
        let entry = IndexEntry {
            id: self.next_id,
            offset,
            body_len: body.len() as u32,
            priority,
            created_at: unix_now(),
            retry_count: 0,
            last_retry: 0.0,
            live: true,
        };

        self.file.write_all(&encode_header(&entry))?;
        self.file.write_all(body)?;
        self.file.sync_data()?;

        self.next_id += 1;
        let id = entry.id;
        self.by_id.insert(id, self.index.len());
        self.index.push(entry);

        self.cleanup_if_needed()?;
        Ok(id)
    }

    /// Live items ordered by `(priority asc, created_at asc, id asc)`.
    pub fn peek_batch(&mut self, limit: usize) -> Result<Vec<BufferedItem>> {
        let mut live: Vec<IndexEntry> = self
            .index
            .iter()
            .filter(|e| e.live)
            .cloned()
            .collect();
        live.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.partial_cmp(&b.created_at).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.id.cmp(&b.id))
        });
        live.truncate(limit);

        let mut items = Vec::with_capacity(live.len());
        for entry in live {
            let mut body = vec![0u8; entry.body_len as usize];
            self.file.seek(SeekFrom::Start(entry.offset + HEADER_LEN))?;
            self.file.read_exact(&mut body)?;
            items.push(BufferedItem {
                id: entry.id,
                data: String::from_utf8_lossy(&body).into_owned(),
                priority: entry.priority,
                created_at: entry.created_at,
                retry_count: entry.retry_count,
            });
        }
        Ok(items)
    }

    /// Tombstone delivered records; durable before returning.
    pub fn delete(&mut self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut touched = false;
        for id in ids {
            if let Some(&idx) = self.by_id.get(id) {
                let entry = &mut self.index[idx];
                if entry.live {
                    self.file.seek(SeekFrom::Start(entry.offset + 17))?;
                    self.file.write_all(&[1])?;
                    entry.live = false;
                    touched = true;
                }
                self.by_id.remove(id);
            }
        }
        if touched {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Record a failed redelivery attempt.
    pub fn mark_retry(&mut self, id: u64) -> Result<()> {
        let Some(&idx) = self.by_id.get(&id) else {
            return Ok(());
        };
        let entry = &mut self.index[idx];
        entry.retry_count += 1;
        entry.last_retry = unix_now();

        self.file.seek(SeekFrom::Start(entry.offset + 20))?;
        self.file.write_all(&entry.retry_count.to_le_bytes())?;
        self.file.seek(SeekFrom::Start(entry.offset + 32))?;
        self.file.write_all(&entry.last_retry.to_le_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.by_id.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn live_bytes(&self) -> u64 {
        self.index
            .iter()
            .filter(|e| e.live)
            .map(|e| e.record_len())
            .sum()
    }

    pub fn is_full(&self) -> bool {
        self.size_bytes() >= self.max_size_bytes
    }

    pub fn stats(&self) -> BufferStats {
        let mut by_priority: HashMap<u8, usize> = HashMap::new();
        let mut oldest: Option<f64> = None;
        for entry in self.index.iter().filter(|e| e.live) {
            *by_priority.entry(entry.priority).or_insert(0) += 1;
            oldest = Some(match oldest {
                Some(o) => o.min(entry.created_at),
                None => entry.created_at,
            });
        }
        let size_bytes = self.size_bytes();
        BufferStats {
            total_items: self.by_id.len(),
            by_priority,
            size_bytes,
            size_mb: size_bytes as f64 / (1024.0 * 1024.0),
            max_size_mb: self.max_size_bytes / (1024 * 1024),
            oldest_item_age: oldest.map(|o| unix_now() - o).unwrap_or(0.0),
            is_full: self.is_full(),
        }
    }

    /// Retention pass: expire old records, then purge low-priority records
    /// while still over budget, then reclaim the space.
    fn cleanup_if_needed(&mut self) -> Result<()> {
        if !self.is_full() {
            return Ok(());
        }

        let cutoff = unix_now() - self.retention_secs;
        let expired: Vec<u64> = self
            .index
            .iter()
            .filter(|e| e.live && e.created_at < cutoff)
            .map(|e| e.id)
            .collect();
        if !expired.is_empty() {
            warn!(count = expired.len(), "buffer over budget; expiring items past retention");
            self.delete(&expired)?;
        }

        if self.live_bytes() >= self.max_size_bytes {
            let mut purgeable: Vec<&IndexEntry> = self
                .index
                .iter()
                .filter(|e| e.live && e.priority >= 2)
                .collect();
            purgeable.sort_by(|a, b| {
                a.created_at
                    .partial_cmp(&b.created_at)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let victims: Vec<u64> = purgeable.iter().take(PURGE_BATCH).map(|e| e.id).collect();
            if !victims.is_empty() {
                warn!(count = victims.len(), "buffer still over budget; purging low-priority items");
                self.delete(&victims)?;
            }
        }

        self.vacuum()
    }

    /// Rewrite live records into a fresh file and swap it in.
    pub fn vacuum(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut new_index = Vec::new();
        let mut new_by_id = HashMap::new();
        let mut write_offset = 0u64;

        for entry in self.index.iter().filter(|e| e.live) {
            let mut body = vec![0u8; entry.body_len as usize];
            self.file.seek(SeekFrom::Start(entry.offset + HEADER_LEN))?;
            self.file.read_exact(&mut body)?;

            let mut moved = entry.clone();
            moved.offset = write_offset;
            tmp.write_all(&encode_header(&moved))?;
            tmp.write_all(&body)?;
            write_offset += moved.record_len();

            new_by_id.insert(moved.id, new_index.len());
            new_index.push(moved);
        }
        tmp.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;
        self.file = tmp;
        self.index = new_index;
        self.by_id = new_by_id;
        Ok(())
    }

    /// Drop every record.
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_data()?;
        self.index.clear();
        self.by_id.clear();
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Async facade over [`BufferStore`].
///
/// Shared between the sender and the buffer-flusher task; every operation
/// runs on the blocking worker pool. Higher-level sequences
/// (peek -> send -> delete) are not transactional: a crash between send and
/// delete redelivers the item, which the idempotent sinks absorb.
#[derive(Clone)]
pub struct DurableBuffer {
    store: Arc<Mutex<BufferStore>>,
}

impl DurableBuffer {
    /// Wrap an already-opened store (used at process startup, before the
    /// runtime is busy).
    pub fn from_store(store: BufferStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn open(config: &BufferConfig) -> Result<Self> {
        let path = PathBuf::from(&config.path);
        let max_size_mb = config.max_size_mb;
        let retention_hours = config.retention_hours;
        let store = tokio::task::spawn_blocking(move || {
            BufferStore::open(&path, max_size_mb, retention_hours)
        })
        .await
        .map_err(|e| TelemetryError::Buffer(format!("buffer open task failed: {e}")))??;
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
        })
    }

    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut BufferStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(&mut store.lock()))
            .await
            .map_err(|e| TelemetryError::Buffer(format!("buffer task failed: {e}")))?
    }

    pub async fn append(&self, body: String, priority: u8) -> Result<u64> {
        self.run(move |s| s.append(body.as_bytes(), priority)).await
    }

    pub async fn peek_batch(&self, limit: usize) -> Result<Vec<BufferedItem>> {
        self.run(move |s| s.peek_batch(limit)).await
    }

    pub async fn delete(&self, ids: Vec<u64>) -> Result<()> {
        self.run(move |s| s.delete(&ids)).await
    }

    pub async fn mark_retry(&self, id: u64) -> Result<()> {
        self.run(move |s| s.mark_retry(id)).await
    }

    pub async fn count(&self) -> Result<usize> {
        self.run(|s| Ok(s.count())).await
    }

    pub async fn size_bytes(&self) -> Result<u64> {
        self.run(|s| Ok(s.size_bytes())).await
    }

    pub async fn stats(&self) -> Result<BufferStats> {
        self.run(|s| Ok(s.stats())).await
    }

    pub async fn vacuum(&self) -> Result<()> {
        self.run(|s| s.vacuum()).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.run(|s| s.clear()).await
    }

    pub async fn close(&self) -> Result<()> {
        self.run(|s| s.close()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> BufferStore {
        BufferStore::open(&dir.path().join("buffer.dat"), 100, 24).unwrap()
    }

    #[test]
    fn append_then_peek_returns_the_body() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        let id = store.append(br#"{"endpoint":"/api/v1/ingest/metrics"}"#, 2).unwrap();
        assert_eq!(id, 1);
        assert_eq!(store.count(), 1);

        let items = store.peek_batch(10).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, 1);
        assert_eq!(items[0].priority, 2);
        assert!(items[0].data.contains("ingest/metrics"));
    }

    #[test]
    fn peek_orders_by_priority_then_age_then_id() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);

        store.append(b"low", 3).unwrap(); // id 1
        store.append(b"critical", 0).unwrap(); // id 2
        store.append(b"normal-a", 2).unwrap(); // id 3
        store.append(b"normal-b", 2).unwrap(); // id 4
        store.append(b"high", 1).unwrap(); // id 5

        let order: Vec<u64> = store
            .peek_batch(10)
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(order, vec![2, 5, 3, 4, 1]);
    }

    #[test]
    fn delete_removes_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.dat");
        {
            let mut store = BufferStore::open(&path, 100, 24).unwrap();
            store.append(b"a", 2).unwrap();
            store.append(b"b", 2).unwrap();
            store.delete(&[1]).unwrap();
            assert_eq!(store.count(), 1);
        }
        // reopen simulates a crash-restart
        let mut store = BufferStore::open(&path, 100, 24).unwrap();
        assert_eq!(store.count(), 1);
        let items = store.peek_batch(10).unwrap();
        assert_eq!(items[0].id, 2);
        assert_eq!(items[0].data, "b");
    }

    #[test]
    fn ids_stay_monotonic_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.dat");
        {
            let mut store = BufferStore::open(&path, 100, 24).unwrap();
            store.append(b"a", 2).unwrap();
            store.append(b"b", 2).unwrap();
        }
        let mut store = BufferStore::open(&path, 100, 24).unwrap();
        let id = store.append(b"c", 2).unwrap();
        assert_eq!(id, 3);
    }

    #[test]
    fn mark_retry_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.dat");
        {
            let mut store = BufferStore::open(&path, 100, 24).unwrap();
            store.append(b"a", 2).unwrap();
            store.mark_retry(1).unwrap();
            store.mark_retry(1).unwrap();
        }
        let mut store = BufferStore::open(&path, 100, 24).unwrap();
        let items = store.peek_batch(1).unwrap();
        assert_eq!(items[0].retry_count, 2);
    }

    #[test]
    fn torn_trailing_record_is_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.dat");
        {
            let mut store = BufferStore::open(&path, 100, 24).unwrap();
            store.append(b"complete", 2).unwrap();
        }
        // simulate a crash mid-append: a header claiming more body than exists
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            let bogus = IndexEntry {
                id: 99,
                offset: 0,
                body_len: 4096,
                priority: 2,
                created_at: unix_now(),
                retry_count: 0,
                last_retry: 0.0,
                live: true,
            };
            file.write_all(&encode_header(&bogus)).unwrap();
            file.write_all(b"partial").unwrap();
        }
        let mut store = BufferStore::open(&path, 100, 24).unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.peek_batch(10).unwrap()[0].data, "complete");
        // and the file is usable for further appends
        store.append(b"after-recovery", 2).unwrap();
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn vacuum_reclaims_tombstoned_space() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        for _ in 0..10 {
            store.append(&[b'x'; 512], 2).unwrap();
        }
        let before = store.size_bytes();
        store.delete(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        store.vacuum().unwrap();
        assert!(store.size_bytes() < before);
        assert_eq!(store.count(), 2);
        // surviving records are still readable
        let items = store.peek_batch(10).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, 9);
    }

    #[test]
    fn over_budget_purges_low_priority_but_keeps_criticals() {
        let dir = TempDir::new().unwrap();
        // 0 MB budget: every append triggers the cleanup path
        let mut store = BufferStore::open(&dir.path().join("buffer.dat"), 0, 24).unwrap();
        store.append(b"critical", 0).unwrap();
        store.append(b"normal", 2).unwrap();
        store.append(b"low", 3).unwrap();

        // criticals are never purged by the size budget
        let items = store.peek_batch(10).unwrap();
        assert!(items.iter().any(|i| i.priority == 0));
        assert!(items.iter().all(|i| i.priority == 0));
    }

    #[tokio::test]
    async fn async_facade_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = BufferConfig {
            enabled: true,
            path: dir.path().join("buffer.dat").to_string_lossy().into_owned(),
            max_size_mb: 10,
            retention_hours: 24,
        };
        let buffer = DurableBuffer::open(&config).await.unwrap();

        let id = buffer.append("payload".to_string(), 0).await.unwrap();
        assert_eq!(buffer.count().await.unwrap(), 1);

        let items = buffer.peek_batch(10).await.unwrap();
        assert_eq!(items[0].data, "payload");

        buffer.delete(vec![id]).await.unwrap();
        assert_eq!(buffer.count().await.unwrap(), 0);

        let stats = buffer.stats().await.unwrap();
        assert_eq!(stats.total_items, 0);
        buffer.close().await.unwrap();
    }
}
