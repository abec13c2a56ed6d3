//! Block store abstraction for the backing device and the metadata area.
//!
//! The replication core only needs "read region", "write region" and
//! "flush". [`MemStore`] keeps everything in memory and can inject failures;
//! [`FileStore`] maps the same operations onto a regular file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// Sector size used for all addressing.
pub const SECTOR_SIZE: usize = 512;

/// Flags attached to a write request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Order this write after everything submitted before it.
    pub barrier: bool,
}

impl WriteFlags {
    /// Flags for a barrier write.
    pub fn barrier() -> Self {
        Self { barrier: true }
    }
}

/// I/O statistics of one store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    /// Completed reads.
    pub reads: u64,
    /// Completed writes.
    pub writes: u64,
    /// Completed flushes.
    pub flushes: u64,
    /// Bytes read.
    pub bytes_read: u64,
    /// Bytes written.
    pub bytes_written: u64,
    /// Failed requests.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    errors: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> StoreStats {
        StoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// A sector-addressed block store.
///
/// Methods may be called from the receiver, the worker and admin callers
/// concurrently; implementations synchronise internally.
pub trait BlockStore: Send + Sync + std::fmt::Debug {
    /// Capacity in 512-byte sectors.
    fn capacity_sectors(&self) -> u64;

    /// Fill `buf` from `sector` onwards. `buf.len()` must be a multiple of the sector size.
    fn read_at(&self, sector: u64, buf: &mut [u8]) -> StorageResult<()>;

    /// Write `data` at `sector`.
    fn write_at(&self, sector: u64, data: &[u8], flags: WriteFlags) -> StorageResult<()>;

    /// Make all completed writes durable.
    fn flush(&self) -> StorageResult<()>;

    /// Current I/O statistics.
    fn stats(&self) -> StoreStats;
}

fn check_request(sector: u64, len: usize, capacity: u64) -> StorageResult<()> {
    if len % SECTOR_SIZE != 0 {
        return Err(StorageError::BadLength {
            expected: len.next_multiple_of(SECTOR_SIZE),
            actual: len,
        });
    }
    let end = sector + (len / SECTOR_SIZE) as u64;
    if end > capacity {
        return Err(StorageError::OutOfRange {
            index: end,
            limit: capacity,
        });
    }
    Ok(())
}

/// In-memory block store with failure injection.
#[derive(Debug)]
pub struct MemStore {
    data: Mutex<Vec<u8>>,
    capacity_sectors: u64,
    barriers_supported: bool,
    flush_supported: bool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    stats: StatsInner,
}

impl MemStore {
    /// Create a zero-filled store of `capacity_sectors` sectors.
    pub fn new(capacity_sectors: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; capacity_sectors as usize * SECTOR_SIZE]),
            capacity_sectors,
            barriers_supported: true,
            flush_supported: true,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            stats: StatsInner::default(),
        }
    }

    /// Reject writes that carry the barrier flag.
    pub fn without_barriers(mut self) -> Self {
        self.barriers_supported = false;
        self
    }

    /// Fail every flush.
    pub fn without_flush(mut self) -> Self {
        self.flush_supported = false;
        self
    }

    /// Make subsequent reads fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Copy of the full contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl BlockStore for MemStore {
    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> StorageResult<()> {
        check_request(sector, buf.len(), self.capacity_sectors)?;
        if self.fail_reads.load(Ordering::SeqCst) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::DeviceError {
                sector,
                reason: "injected read failure".to_string(),
            });
        }
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.data.lock()[start..start + buf.len()]);
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn write_at(&self, sector: u64, data: &[u8], flags: WriteFlags) -> StorageResult<()> {
        check_request(sector, data.len(), self.capacity_sectors)?;
        if flags.barrier && !self.barriers_supported {
            return Err(StorageError::Unsupported {
                msg: "barrier writes".to_string(),
            });
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::DeviceError {
                sector,
                reason: "injected write failure".to_string(),
            });
        }
        let start = sector as usize * SECTOR_SIZE;
        self.data.lock()[start..start + data.len()].copy_from_slice(data);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        if !self.flush_supported {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Unsupported {
                msg: "flush".to_string(),
            });
        }
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }
}

/// Block store on top of a regular file.
#[derive(Debug)]
pub struct FileStore {
    file: File,
    capacity_sectors: u64,
    stats: StatsInner,
}

impl FileStore {
    /// Open an existing file; its length determines the capacity.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % SECTOR_SIZE as u64 != 0 {
            warn!(path = %path.display(), len, "file length is not sector aligned, tail ignored");
        }
        debug!(path = %path.display(), sectors = len / SECTOR_SIZE as u64, "opened file store");
        Ok(Self {
            file,
            capacity_sectors: len / SECTOR_SIZE as u64,
            stats: StatsInner::default(),
        })
    }

    /// Create (or truncate) a file of `capacity_sectors` sectors.
    pub fn create(path: &Path, capacity_sectors: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity_sectors * SECTOR_SIZE as u64)?;
        Ok(Self {
            file,
            capacity_sectors,
            stats: StatsInner::default(),
        })
    }
}

impl BlockStore for FileStore {
    fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> StorageResult<()> {
        check_request(sector, buf.len(), self.capacity_sectors)?;
        self.file
            .read_exact_at(buf, sector * SECTOR_SIZE as u64)
            .inspect_err(|_| {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            })?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn write_at(&self, sector: u64, data: &[u8], flags: WriteFlags) -> StorageResult<()> {
        check_request(sector, data.len(), self.capacity_sectors)?;
        if flags.barrier {
            self.file.sync_data()?;
        }
        self.file
            .write_all_at(data, sector * SECTOR_SIZE as u64)
            .inspect_err(|_| {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            })?;
        if flags.barrier {
            self.file.sync_data()?;
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.file.sync_data()?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_store_round_trip() {
        let store = MemStore::new(16);
        let data = vec![0xABu8; 1024];
        store.write_at(2, &data, WriteFlags::default()).unwrap();
        let mut buf = vec![0u8; 1024];
        store.read_at(2, &mut buf).unwrap();
        assert_eq!(buf, data);
        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.bytes_read, 1024);
    }

    #[test]
    fn test_mem_store_bounds() {
        let store = MemStore::new(4);
        let mut buf = vec![0u8; 1024];
        assert!(matches!(
            store.read_at(3, &mut buf),
            Err(StorageError::OutOfRange { .. })
        ));
        assert!(matches!(
            store.write_at(0, &[0u8; 100], WriteFlags::default()),
            Err(StorageError::BadLength { .. })
        ));
    }

    #[test]
    fn test_mem_store_failure_injection() {
        let store = MemStore::new(4);
        store.set_fail_writes(true);
        assert!(store.write_at(0, &[0u8; 512], WriteFlags::default()).is_err());
        store.set_fail_writes(false);
        assert!(store.write_at(0, &[0u8; 512], WriteFlags::default()).is_ok());
        assert_eq!(store.stats().errors, 1);
    }

    #[test]
    fn test_mem_store_rejects_barrier_when_unsupported() {
        let store = MemStore::new(4).without_barriers();
        let res = store.write_at(0, &[0u8; 512], WriteFlags::barrier());
        assert!(matches!(res, Err(StorageError::Unsupported { .. })));
        assert!(store.write_at(0, &[0u8; 512], WriteFlags::default()).is_ok());
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let store = FileStore::create(&path, 8).unwrap();
        store.write_at(1, &[7u8; 512], WriteFlags::barrier()).unwrap();
        store.flush().unwrap();
        drop(store);

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.capacity_sectors(), 8);
        let mut buf = [0u8; 512];
        store.read_at(1, &mut buf).unwrap();
        assert!(buf.iter().all(|b| *b == 7));
    }
}
