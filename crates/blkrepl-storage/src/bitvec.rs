//! Paged bit vector backing the resync bitmap.
//!
//! Storage is split into fixed 4 KiB pages of 64-bit words so that no single
//! allocation grows with the device size. Every word access goes through
//! `page_of`, which maps a flat word index to its page and offset; bulk
//! operations walk page-sized chunks rather than assuming contiguous memory.
//!
//! Bits past `bits` in the last word ("surplus" bits) are kept clear at all
//! times except while the caller explicitly sets them for persistence.

use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Number of bits in one storage word.
pub const WORD_BITS: u64 = 64;
/// Size of one storage page in bytes.
pub const PAGE_BYTES: usize = 4096;
/// Number of words held by one page.
pub const WORDS_PER_PAGE: usize = PAGE_BYTES / 8;

fn words_for_bits(bits: u64) -> usize {
    bits.div_ceil(WORD_BITS) as usize
}

fn pages_for_words(words: usize) -> usize {
    words.div_ceil(WORDS_PER_PAGE)
}

/// Mask with bits `lo..=hi` set (both in `0..64`).
fn range_mask(lo: u64, hi: u64) -> u64 {
    let width = hi - lo + 1;
    if width == WORD_BITS {
        !0
    } else {
        ((1u64 << width) - 1) << lo
    }
}

/// A bit array stored in fixed-size pages.
#[derive(Debug, Default, Clone)]
pub struct BitVector {
    pages: Vec<Box<[u64]>>,
    bits: u64,
    words: usize,
}

impl BitVector {
    /// Create an empty bit vector with no storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zeroed bit vector holding `bits` bits.
    pub fn with_bits(bits: u64) -> StorageResult<Self> {
        let mut bv = Self::new();
        bv.resize(bits, false)?;
        Ok(bv)
    }

    /// Number of valid bits.
    pub fn bits(&self) -> u64 {
        self.bits
    }

    /// Number of words covering the valid bits.
    pub fn words(&self) -> usize {
        self.words
    }

    /// Number of allocated pages.
    pub fn pages(&self) -> usize {
        self.pages.len()
    }

    /// True if the vector holds no bits.
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    fn page_of(word: usize) -> (usize, usize) {
        (word / WORDS_PER_PAGE, word % WORDS_PER_PAGE)
    }

    fn word(&self, idx: usize) -> u64 {
        let (page, off) = Self::page_of(idx);
        self.pages[page][off]
    }

    fn word_mut(&mut self, idx: usize) -> &mut u64 {
        let (page, off) = Self::page_of(idx);
        &mut self.pages[page][off]
    }

    /// Calls `f(first_word, chunk)` for each page slice overlapping `start..end`.
    fn for_each_chunk<F: FnMut(usize, &[u64])>(&self, start: usize, end: usize, mut f: F) {
        let mut w = start;
        while w < end {
            let (page, off) = Self::page_of(w);
            let n = (WORDS_PER_PAGE - off).min(end - w);
            f(w, &self.pages[page][off..off + n]);
            w += n;
        }
    }

    fn for_each_chunk_mut<F: FnMut(usize, &mut [u64])>(&mut self, start: usize, end: usize, mut f: F) {
        let mut w = start;
        while w < end {
            let (page, off) = Self::page_of(w);
            let n = (WORDS_PER_PAGE - off).min(end - w);
            f(w, &mut self.pages[page][off..off + n]);
            w += n;
        }
    }

    fn fill_words(&mut self, start: usize, end: usize, value: u64) {
        self.for_each_chunk_mut(start, end, |_, chunk| chunk.fill(value));
    }

    fn last_word_mask(&self) -> u64 {
        match self.bits % WORD_BITS {
            0 => !0,
            r => (1u64 << r) - 1,
        }
    }

    /// Clear the bits past `bits` in the last word.
    pub fn clear_surplus(&mut self) {
        if self.words == 0 {
            return;
        }
        let mask = self.last_word_mask();
        *self.word_mut(self.words - 1) &= mask;
    }

    /// Set the bits past `bits` in the last word.
    ///
    /// Only used transiently around persistence; callers must follow up with
    /// [`BitVector::clear_surplus`].
    pub fn set_surplus(&mut self) {
        if self.words == 0 {
            return;
        }
        let mask = self.last_word_mask();
        *self.word_mut(self.words - 1) |= !mask;
    }

    /// Change the number of bits.
    ///
    /// On shrink the prefix is kept. On grow the new tail is filled with ones
    /// when `grow_fill` is set, zeros otherwise. Resizing to zero releases all
    /// pages. If the page table cannot grow, the vector is left untouched.
    pub fn resize(&mut self, new_bits: u64, grow_fill: bool) -> StorageResult<()> {
        if new_bits == 0 {
            if self.bits != 0 {
                debug!(old_bits = self.bits, "releasing bitmap storage");
            }
            self.pages = Vec::new();
            self.bits = 0;
            self.words = 0;
            return Ok(());
        }

        let old_bits = self.bits;
        let old_words = self.words;
        let new_words = words_for_bits(new_bits);
        let new_pages = pages_for_words(new_words);

        if new_pages > self.pages.len() {
            let extra = new_pages - self.pages.len();
            self.pages
                .try_reserve_exact(extra)
                .map_err(|_| StorageError::OutOfMemory { requested_pages: extra })?;
            for _ in 0..extra {
                self.pages.push(vec![0u64; WORDS_PER_PAGE].into_boxed_slice());
            }
        } else if new_pages < self.pages.len() {
            self.pages.truncate(new_pages);
            self.pages.shrink_to_fit();
        }

        if new_bits > old_bits {
            if grow_fill {
                // the old surplus bits become live bits of the new range
                self.set_surplus();
                self.bits = new_bits;
                self.words = new_words;
                self.fill_words(old_words, new_words, !0);
            } else {
                self.bits = new_bits;
                self.words = new_words;
            }
        } else {
            let kept = (new_pages * WORDS_PER_PAGE).min(old_words);
            self.bits = new_bits;
            self.words = new_words;
            if kept > new_words {
                self.fill_words(new_words, kept, 0);
            }
        }
        self.clear_surplus();

        debug!(old_bits, new_bits, pages = self.pages.len(), "bit vector resized");
        Ok(())
    }

    /// Value of one bit, or `None` if `bit` is out of range.
    pub fn test(&self, bit: u64) -> Option<bool> {
        if bit >= self.bits {
            return None;
        }
        let w = self.word((bit / WORD_BITS) as usize);
        Some(w & (1u64 << (bit % WORD_BITS)) != 0)
    }

    fn clip(&self, s: u64, e: u64) -> Option<(u64, u64)> {
        if self.bits == 0 || s > e || s >= self.bits {
            return None;
        }
        Some((s, e.min(self.bits - 1)))
    }

    fn modify_range<F: FnMut(&mut u64, u64) -> u32>(&mut self, s: u64, e: u64, mut op: F) -> u64 {
        let first = (s / WORD_BITS) as usize;
        let last = (e / WORD_BITS) as usize;
        let mut total = 0u64;
        for w in first..=last {
            let lo = if w == first { s % WORD_BITS } else { 0 };
            let hi = if w == last { e % WORD_BITS } else { WORD_BITS - 1 };
            total += op(self.word_mut(w), range_mask(lo, hi)) as u64;
        }
        total
    }

    /// Set bits `s..=e`, returning how many flipped from 0 to 1.
    ///
    /// `e` is clamped to the last valid bit.
    pub fn set_range(&mut self, s: u64, e: u64) -> u64 {
        let Some((s, e)) = self.clip(s, e) else {
            return 0;
        };
        self.modify_range(s, e, |w, mask| {
            let flipped = (!*w & mask).count_ones();
            *w |= mask;
            flipped
        })
    }

    /// Clear bits `s..=e`, returning how many flipped from 1 to 0.
    pub fn clear_range(&mut self, s: u64, e: u64) -> u64 {
        let Some((s, e)) = self.clip(s, e) else {
            return 0;
        };
        self.modify_range(s, e, |w, mask| {
            let flipped = (*w & mask).count_ones();
            *w &= !mask;
            flipped
        })
    }

    /// Count set bits in `s..=e`.
    pub fn count_range(&self, s: u64, e: u64) -> u64 {
        let Some((s, e)) = self.clip(s, e) else {
            return 0;
        };
        let first = (s / WORD_BITS) as usize;
        let last = (e / WORD_BITS) as usize;
        (first..=last)
            .map(|w| {
                let lo = if w == first { s % WORD_BITS } else { 0 };
                let hi = if w == last { e % WORD_BITS } else { WORD_BITS - 1 };
                (self.word(w) & range_mask(lo, hi)).count_ones() as u64
            })
            .sum()
    }

    /// Number of set bits in the valid range.
    pub fn popcount(&self) -> u64 {
        let mut total = 0u64;
        self.for_each_chunk(0, self.words, |_, chunk| {
            total += chunk.iter().map(|w| w.count_ones() as u64).sum::<u64>();
        });
        total
    }

    /// First set bit at or after `from`.
    pub fn find_next_set(&self, from: u64) -> Option<u64> {
        if from >= self.bits {
            return None;
        }
        let mut w = (from / WORD_BITS) as usize;
        let mut mask = !0u64 << (from % WORD_BITS);
        while w < self.words {
            let v = self.word(w) & mask;
            if v != 0 {
                let bit = w as u64 * WORD_BITS + v.trailing_zeros() as u64;
                return (bit < self.bits).then_some(bit);
            }
            mask = !0;
            w += 1;
        }
        None
    }

    /// Set or clear every valid bit.
    pub fn fill(&mut self, value: bool) {
        self.fill_words(0, self.words, if value { !0 } else { 0 });
        self.clear_surplus();
    }

    fn check_words(&self, word_offset: usize, count: usize) -> StorageResult<()> {
        let end = word_offset.saturating_add(count);
        if end > self.words {
            return Err(StorageError::OutOfRange {
                index: end as u64,
                limit: self.words as u64,
            });
        }
        Ok(())
    }

    /// OR `src` into the words starting at `word_offset`.
    ///
    /// Never clears a bit. Returns the number of bits that became set.
    pub fn merge_words(&mut self, word_offset: usize, src: &[u64]) -> StorageResult<u64> {
        self.check_words(word_offset, src.len())?;
        let before = self.words_weight(word_offset, src.len());
        let mut i = 0usize;
        self.for_each_chunk_mut(word_offset, word_offset + src.len(), |_, chunk| {
            for w in chunk.iter_mut() {
                *w |= src[i];
                i += 1;
            }
        });
        self.clear_surplus();
        let after = self.words_weight(word_offset, src.len());
        Ok(after - before)
    }

    /// Overwrite the words starting at `word_offset` with `src`.
    pub fn load_words(&mut self, word_offset: usize, src: &[u64]) -> StorageResult<()> {
        self.check_words(word_offset, src.len())?;
        let mut i = 0usize;
        self.for_each_chunk_mut(word_offset, word_offset + src.len(), |_, chunk| {
            chunk.copy_from_slice(&src[i..i + chunk.len()]);
            i += chunk.len();
        });
        self.clear_surplus();
        Ok(())
    }

    /// Copy out `count` words starting at `word_offset`.
    pub fn copy_words(&self, word_offset: usize, count: usize) -> StorageResult<Vec<u64>> {
        self.check_words(word_offset, count)?;
        let mut out = Vec::with_capacity(count);
        self.for_each_chunk(word_offset, word_offset + count, |_, chunk| {
            out.extend_from_slice(chunk);
        });
        Ok(out)
    }

    /// Serialize `count` words as little-endian bytes.
    pub fn serialize_range(&self, word_offset: usize, count: usize) -> StorageResult<Vec<u8>> {
        self.check_words(word_offset, count)?;
        let mut out = Vec::with_capacity(count * 8);
        self.for_each_chunk(word_offset, word_offset + count, |_, chunk| {
            for w in chunk {
                out.extend_from_slice(&w.to_le_bytes());
            }
        });
        Ok(out)
    }

    /// Decode little-endian words from `bytes` and OR them in at `word_offset`.
    pub fn deserialize_merge(&mut self, word_offset: usize, bytes: &[u8]) -> StorageResult<u64> {
        let words = decode_le_words(bytes)?;
        self.merge_words(word_offset, &words)
    }

    /// Set bits within `count` words starting at `start` (clipped to the vector).
    pub fn words_weight(&self, start: usize, count: usize) -> u64 {
        let end = start.saturating_add(count).min(self.words);
        if start >= end {
            return 0;
        }
        let mut total = 0u64;
        self.for_each_chunk(start, end, |_, chunk| {
            total += chunk.iter().map(|w| w.count_ones() as u64).sum::<u64>();
        });
        total
    }

    /// Set every bit in `count` words starting at `start`, returning how many became set.
    pub fn set_words(&mut self, start: usize, count: usize) -> u64 {
        let end = start.saturating_add(count).min(self.words);
        if start >= end {
            return 0;
        }
        let before = self.words_weight(start, end - start);
        self.fill_words(start, end, !0);
        self.clear_surplus();
        self.words_weight(start, end - start) - before
    }
}

/// Decode a little-endian byte stream into words.
pub fn decode_le_words(bytes: &[u8]) -> StorageResult<Vec<u64>> {
    if bytes.len() % 8 != 0 {
        return Err(StorageError::BadLength {
            expected: bytes.len().next_multiple_of(8),
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            u64::from_le_bytes(b)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_vector() {
        let bv = BitVector::new();
        assert!(bv.is_empty());
        assert_eq!(bv.words(), 0);
        assert_eq!(bv.pages(), 0);
        assert_eq!(bv.test(0), None);
        assert_eq!(bv.find_next_set(0), None);
    }

    #[test]
    fn test_set_and_clear_range() {
        let mut bv = BitVector::with_bits(200).unwrap();
        assert_eq!(bv.set_range(10, 20), 11);
        assert_eq!(bv.set_range(15, 25), 5);
        assert_eq!(bv.popcount(), 16);
        assert_eq!(bv.clear_range(0, 12), 3);
        assert_eq!(bv.popcount(), 13);
        assert_eq!(bv.test(13), Some(true));
        assert_eq!(bv.test(12), Some(false));
    }

    #[test]
    fn test_range_crossing_words_and_clamp() {
        let mut bv = BitVector::with_bits(130).unwrap();
        assert_eq!(bv.set_range(60, 1_000), 70);
        assert_eq!(bv.count_range(0, 129), 70);
        assert_eq!(bv.count_range(64, 127), 64);
        assert_eq!(bv.set_range(200, 300), 0);
    }

    #[test]
    fn test_find_next_set() {
        let mut bv = BitVector::with_bits(5000).unwrap();
        bv.set_range(3, 3);
        bv.set_range(4095, 4097);
        assert_eq!(bv.find_next_set(0), Some(3));
        assert_eq!(bv.find_next_set(4), Some(4095));
        assert_eq!(bv.find_next_set(4098), None);
    }

    #[test]
    fn test_grow_fills_with_ones() {
        let mut bv = BitVector::with_bits(70).unwrap();
        bv.set_range(0, 0);
        bv.resize(100, true).unwrap();
        assert_eq!(bv.popcount(), 31);
        assert_eq!(bv.test(69), Some(false));
        assert_eq!(bv.test(70), Some(true));
        assert_eq!(bv.test(99), Some(true));
    }

    #[test]
    fn test_shrink_keeps_prefix_and_clears_tail() {
        let mut bv = BitVector::with_bits(10_000).unwrap();
        bv.fill(true);
        bv.resize(100, false).unwrap();
        assert_eq!(bv.popcount(), 100);
        assert_eq!(bv.pages(), 1);
        bv.resize(10_000, false).unwrap();
        assert_eq!(bv.popcount(), 100);
    }

    #[test]
    fn test_resize_to_zero_releases_pages() {
        let mut bv = BitVector::with_bits(1 << 20).unwrap();
        assert_eq!(bv.pages(), (1 << 20) / (WORDS_PER_PAGE * 64));
        bv.resize(0, true).unwrap();
        assert_eq!(bv.pages(), 0);
        assert_eq!(bv.bits(), 0);
    }

    #[test]
    fn test_surplus_bits() {
        let mut bv = BitVector::with_bits(65).unwrap();
        bv.fill(true);
        assert_eq!(bv.popcount(), 65);
        bv.set_surplus();
        assert_eq!(bv.copy_words(1, 1).unwrap()[0], !0);
        bv.clear_surplus();
        assert_eq!(bv.copy_words(1, 1).unwrap()[0], 1);
    }

    #[test]
    fn test_merge_words_counts_new_bits_only() {
        let mut bv = BitVector::with_bits(128).unwrap();
        bv.set_range(0, 3);
        let added = bv.merge_words(0, &[0xff, 0x1]).unwrap();
        assert_eq!(added, 5);
        assert_eq!(bv.merge_words(0, &[0xff, 0x1]).unwrap(), 0);
        assert!(bv.merge_words(1, &[0, 0]).is_err());
    }

    #[test]
    fn test_merge_clears_surplus() {
        let mut bv = BitVector::with_bits(66).unwrap();
        let added = bv.merge_words(1, &[!0]).unwrap();
        assert_eq!(added, 2);
        assert_eq!(bv.popcount(), 2);
    }

    #[test]
    fn test_serialize_is_little_endian() {
        let mut bv = BitVector::with_bits(64).unwrap();
        bv.set_range(0, 0);
        bv.set_range(8, 8);
        let bytes = bv.serialize_range(0, 1).unwrap();
        assert_eq!(bytes, vec![1, 1, 0, 0, 0, 0, 0, 0]);
        let mut other = BitVector::with_bits(64).unwrap();
        assert_eq!(other.deserialize_merge(0, &bytes).unwrap(), 2);
        assert!(other.deserialize_merge(0, &bytes[..3]).is_err());
    }

    #[test]
    fn test_operations_across_page_boundary() {
        let bits = (WORDS_PER_PAGE as u64) * 64 * 2;
        let mut bv = BitVector::with_bits(bits).unwrap();
        let boundary = WORDS_PER_PAGE as u64 * 64;
        assert_eq!(bv.set_range(boundary - 10, boundary + 9), 20);
        assert_eq!(bv.words_weight(WORDS_PER_PAGE - 1, 2), 20);
        let words = bv.copy_words(WORDS_PER_PAGE - 1, 2).unwrap();
        assert_eq!(words[0].count_ones() + words[1].count_ones(), 20);
    }

    #[test]
    fn test_set_words() {
        let mut bv = BitVector::with_bits(100).unwrap();
        bv.set_range(0, 9);
        assert_eq!(bv.set_words(0, 4), 90);
        assert_eq!(bv.popcount(), 100);
    }
}
