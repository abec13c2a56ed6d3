//! Resync bitmap: one bit per 4 KiB block of the replicated device.
//!
//! Two lock tiers protect the bitmap:
//! - a short, non-blocking lock (`parking_lot::Mutex`) taken by every single-bit
//!   and small-range operation, safe to use from I/O completion paths;
//! - a long-held coarse lock (`tokio::sync::Mutex`) acquired through
//!   [`ResyncBitmap::lock`] for whole-bitmap work (resize, read, write,
//!   receiving a peer bitmap). The returned guard records why it was taken.
//!
//! Fine-grained operations never touch the coarse lock.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bitvec::{decode_le_words, BitVector};
use crate::error::{StorageError, StorageResult};
use crate::store::{BlockStore, WriteFlags, SECTOR_SIZE};

/// Bytes of data covered by one bit.
pub const BM_BLOCK_SIZE: u64 = 4096;
/// Sectors covered by one bit.
pub const BM_SECT_PER_BIT: u64 = BM_BLOCK_SIZE / SECTOR_SIZE as u64;
/// Words per resync extent (16 MiB of data).
pub const BM_EXT_WORDS: usize = 64;
/// Words per activity-log extent (4 MiB of data).
pub const AL_EXT_WORDS: usize = 16;

/// Number of bits needed for a device of `capacity_sectors`.
pub fn bits_for_capacity(capacity_sectors: u64) -> u64 {
    capacity_sectors.div_ceil(BM_SECT_PER_BIT)
}

/// Bit covering `sector`.
pub fn sector_to_bit(sector: u64) -> u64 {
    sector / BM_SECT_PER_BIT
}

/// First sector covered by `bit`.
pub fn bit_to_sector(bit: u64) -> u64 {
    bit * BM_SECT_PER_BIT
}

/// Snapshot of the bitmap counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapStats {
    /// Number of bits.
    pub bits: u64,
    /// Number of words.
    pub words: usize,
    /// Out-of-sync bits.
    pub weight: u64,
    /// Device capacity the bitmap was sized for.
    pub capacity_sectors: u64,
}

struct BitmapInner {
    bv: BitVector,
    set: u64,
    find_cursor: u64,
    capacity_sectors: u64,
}

impl BitmapInner {
    fn recount(&mut self) {
        let counted = self.bv.popcount();
        if counted != self.set {
            debug!(cached = self.set, counted, "bitmap weight recomputed");
        }
        self.set = counted;
    }
}

/// The device's out-of-sync bitmap.
pub struct ResyncBitmap {
    inner: Mutex<BitmapInner>,
    coarse: tokio::sync::Mutex<()>,
    owner: Mutex<Option<String>>,
    md_io_error: AtomicBool,
}

impl Default for ResyncBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResyncBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResyncBitmap")
            .field("stats", &self.stats())
            .field("owner", &self.lock_owner())
            .finish()
    }
}

impl ResyncBitmap {
    /// Create a bitmap with zero capacity.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BitmapInner {
                bv: BitVector::new(),
                set: 0,
                find_cursor: 0,
                capacity_sectors: 0,
            }),
            coarse: tokio::sync::Mutex::new(()),
            owner: Mutex::new(None),
            md_io_error: AtomicBool::new(false),
        }
    }

    /// Take the coarse lock, recording `why` for diagnostics.
    ///
    /// Logs a warning when somebody else already holds it, then waits.
    pub async fn lock(&self, why: &str) -> BitmapLockGuard<'_> {
        let guard = match self.coarse.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let holder = self.lock_owner().unwrap_or_else(|| "?".to_string());
                warn!(why, holder = %holder, "bitmap already locked, waiting");
                self.coarse.lock().await
            }
        };
        *self.owner.lock() = Some(why.to_string());
        BitmapLockGuard {
            bitmap: self,
            _guard: guard,
        }
    }

    /// Take the coarse lock only if it is free.
    pub fn try_lock(&self, why: &str) -> Option<BitmapLockGuard<'_>> {
        let guard = self.coarse.try_lock().ok()?;
        *self.owner.lock() = Some(why.to_string());
        Some(BitmapLockGuard {
            bitmap: self,
            _guard: guard,
        })
    }

    /// Reason recorded by the current coarse lock holder.
    pub fn lock_owner(&self) -> Option<String> {
        self.owner.lock().clone()
    }

    /// True once a bitmap read or write has failed.
    pub fn md_io_error(&self) -> bool {
        self.md_io_error.load(Ordering::SeqCst)
    }

    /// Forget a previous metadata I/O error (new backing device attached).
    pub fn clear_md_io_error(&self) {
        self.md_io_error.store(false, Ordering::SeqCst);
    }

    /// Number of bits.
    pub fn bits(&self) -> u64 {
        self.inner.lock().bv.bits()
    }

    /// Number of words.
    pub fn words(&self) -> usize {
        self.inner.lock().bv.words()
    }

    /// Device capacity the bitmap currently covers.
    pub fn capacity_sectors(&self) -> u64 {
        self.inner.lock().capacity_sectors
    }

    /// Current number of out-of-sync bits.
    ///
    /// Only exact while the coarse lock is held; otherwise it may lag
    /// concurrent set/clear calls.
    pub fn total_weight(&self) -> u64 {
        self.inner.lock().set
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> BitmapStats {
        let inner = self.inner.lock();
        BitmapStats {
            bits: inner.bv.bits(),
            words: inner.bv.words(),
            weight: inner.set,
            capacity_sectors: inner.capacity_sectors,
        }
    }

    /// Set bits `s..=e`, returning how many became set.
    pub fn set_bits(&self, s: u64, e: u64) -> u64 {
        let mut inner = self.inner.lock();
        let n = inner.bv.set_range(s, e);
        inner.set += n;
        n
    }

    /// Clear bits `s..=e`, returning how many became clear.
    pub fn clear_bits(&self, s: u64, e: u64) -> u64 {
        let mut inner = self.inner.lock();
        let n = inner.bv.clear_range(s, e);
        inner.set -= n;
        n
    }

    /// Value of `bit`, `None` past the end.
    pub fn test_bit(&self, bit: u64) -> Option<bool> {
        self.inner.lock().bv.test(bit)
    }

    /// Number of set bits in `s..=e`.
    pub fn count_bits(&self, s: u64, e: u64) -> u64 {
        self.inner.lock().bv.count_range(s, e)
    }

    /// Mark a byte range starting at `sector` as out of sync.
    ///
    /// Rounds outwards: every block touched by the range is marked.
    pub fn set_out_of_sync(&self, sector: u64, len: usize) -> u64 {
        if len == 0 {
            return 0;
        }
        let last_sector = sector + (len as u64).div_ceil(SECTOR_SIZE as u64) - 1;
        self.set_bits(sector_to_bit(sector), sector_to_bit(last_sector))
    }

    /// Mark a byte range starting at `sector` as in sync.
    ///
    /// Rounds inwards: only blocks completely covered by the range are cleared.
    /// The last block of the device is cleared if the range reaches the end.
    pub fn set_in_sync(&self, sector: u64, len: usize) -> u64 {
        if len == 0 {
            return 0;
        }
        let end_sector = sector + (len as u64) / SECTOR_SIZE as u64;
        let capacity = self.capacity_sectors();
        let first = sector.div_ceil(BM_SECT_PER_BIT);
        let end_bit = if end_sector >= capacity {
            bits_for_capacity(capacity)
        } else {
            end_sector / BM_SECT_PER_BIT
        };
        if end_bit <= first {
            return 0;
        }
        self.clear_bits(first, end_bit - 1)
    }

    /// Next set bit from the resumable cursor, advancing it.
    ///
    /// Returns `None` at the end without moving the cursor; it only wraps
    /// after [`ResyncBitmap::reset_find`].
    pub fn find_next(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        let found = inner.bv.find_next_set(inner.find_cursor)?;
        inner.find_cursor = found + 1;
        Some(found)
    }

    /// Rewind the cursor to the start.
    pub fn reset_find(&self) {
        self.inner.lock().find_cursor = 0;
    }

    /// Move the cursor to `bit` (clamped to the end).
    pub fn set_find(&self, bit: u64) {
        let mut inner = self.inner.lock();
        inner.find_cursor = bit.min(inner.bv.bits());
    }

    /// True once the cursor has walked past the last bit.
    pub fn rs_done(&self) -> bool {
        let inner = self.inner.lock();
        inner.find_cursor >= inner.bv.bits()
    }

    /// OR words received from the peer into the bitmap.
    ///
    /// Never clears a bit, so the weight never decreases. Returns the weight
    /// added by this chunk.
    pub fn merge_from_peer(&self, word_offset: usize, words: &[u64]) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        let added = inner.bv.merge_words(word_offset, words)?;
        inner.set += added;
        Ok(added)
    }

    /// Copy out words for sending to the peer.
    pub fn chunk(&self, word_offset: usize, count: usize) -> StorageResult<Vec<u64>> {
        self.inner.lock().bv.copy_words(word_offset, count)
    }

    /// Mark every block out of sync (full resync).
    pub fn set_all(&self) {
        let mut inner = self.inner.lock();
        inner.bv.fill(true);
        inner.set = inner.bv.bits();
    }

    /// Mark every block in sync.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.bv.fill(false);
        inner.set = 0;
    }

    /// Out-of-sync bits in resync extent `enr`.
    pub fn extent_weight(&self, enr: u64) -> u64 {
        let inner = self.inner.lock();
        inner
            .bv
            .words_weight(enr as usize * BM_EXT_WORDS, BM_EXT_WORDS)
    }

    /// Mark every block of activity-log extent `al_enr` out of sync.
    ///
    /// Returns the weight added.
    pub fn mark_extent_fully_dirty(&self, al_enr: u64) -> u64 {
        let mut inner = self.inner.lock();
        let added = inner.bv.set_words(al_enr as usize * AL_EXT_WORDS, AL_EXT_WORDS);
        inner.set += added;
        added
    }
}

/// Holder of the coarse bitmap lock.
///
/// Whole-bitmap operations are only reachable through this guard.
pub struct BitmapLockGuard<'a> {
    bitmap: &'a ResyncBitmap,
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

impl std::fmt::Debug for BitmapLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmapLockGuard")
            .field("why", &self.bitmap.lock_owner())
            .finish()
    }
}

impl Drop for BitmapLockGuard<'_> {
    fn drop(&mut self) {
        *self.bitmap.owner.lock() = None;
    }
}

impl<'a> BitmapLockGuard<'a> {
    /// The bitmap this guard protects.
    pub fn bitmap(&self) -> &'a ResyncBitmap {
        self.bitmap
    }

    /// Release the coarse lock.
    pub fn unlock(self) {
        drop(self);
    }

    /// Resize for a device of `capacity_sectors`.
    ///
    /// Growth marks the new blocks out of sync; shrinking recounts. A zero
    /// capacity releases all storage. On allocation failure the old size is
    /// kept and the error is returned.
    pub fn resize(&self, capacity_sectors: u64) -> StorageResult<()> {
        let mut inner = self.bitmap.inner.lock();
        let old_bits = inner.bv.bits();
        let new_bits = bits_for_capacity(capacity_sectors);

        if capacity_sectors == 0 {
            inner.bv.resize(0, false)?;
            inner.set = 0;
            inner.find_cursor = 0;
            inner.capacity_sectors = 0;
            info!(old_bits, "bitmap released");
            return Ok(());
        }

        inner.bv.resize(new_bits, true)?;
        if new_bits > old_bits {
            inner.set += new_bits - old_bits;
        } else {
            inner.recount();
        }
        inner.capacity_sectors = capacity_sectors;
        inner.find_cursor = inner.find_cursor.min(new_bits);
        info!(old_bits, new_bits, weight = inner.set, "bitmap resized");
        Ok(())
    }

    /// Read the whole bitmap from `store` at `bm_sector`.
    ///
    /// The weight is recomputed from scratch. On failure the in-memory bitmap
    /// is left as it was and the metadata I/O error flag is raised.
    pub fn read_from(&self, store: &dyn BlockStore, bm_sector: u64) -> StorageResult<()> {
        let words = self.bitmap.words();
        let len = (words * 8).next_multiple_of(SECTOR_SIZE);
        let mut buf = vec![0u8; len];
        if let Err(e) = store.read_at(bm_sector, &mut buf) {
            return Err(self.io_failed("read", e));
        }
        let decoded = decode_le_words(&buf[..words * 8])?;
        let mut inner = self.bitmap.inner.lock();
        inner.bv.load_words(0, &decoded)?;
        inner.recount();
        info!(weight = inner.set, "bitmap read from stable storage");
        Ok(())
    }

    /// Write the whole bitmap to `store` at `bm_sector`.
    ///
    /// Surplus bits of the last word are written as ones so that blocks past
    /// the known capacity read back as out of sync.
    pub fn write_to(&self, store: &dyn BlockStore, bm_sector: u64, no_md_flush: bool) -> StorageResult<()> {
        let mut image = {
            let mut inner = self.bitmap.inner.lock();
            let words = inner.bv.words();
            inner.bv.set_surplus();
            let image = inner.bv.serialize_range(0, words);
            inner.bv.clear_surplus();
            image?
        };
        image.resize(image.len().next_multiple_of(SECTOR_SIZE), 0);
        if image.is_empty() {
            return Ok(());
        }
        if let Err(e) = store.write_at(bm_sector, &image, WriteFlags::default()) {
            return Err(self.io_failed("write", e));
        }
        if !no_md_flush {
            if let Err(e) = store.flush() {
                return Err(self.io_failed("flush", e));
            }
        }
        debug!(bytes = image.len(), "bitmap written to stable storage");
        Ok(())
    }

    fn io_failed(&self, what: &str, e: StorageError) -> StorageError {
        self.bitmap.md_io_error.store(true, Ordering::SeqCst);
        error!(op = what, error = %e, "bitmap I/O failed");
        StorageError::MetadataIo {
            msg: format!("bitmap {what}: {e}"),
        }
    }
}
