#![warn(missing_docs)]

//! blkrepl storage subsystem: paged resync bitmap, metadata super block, block stores
//!
//! This crate holds everything that lives on a single node's disks: the
//! backing data store, the metadata super block and the out-of-sync bitmap
//! with its two-tier locking. It knows nothing about peers.

pub mod bitmap;
pub mod bitvec;
pub mod error;
pub mod meta;
pub mod store;

pub use bitmap::{
    bit_to_sector, bits_for_capacity, sector_to_bit, BitmapLockGuard, BitmapStats, ResyncBitmap,
    AL_EXT_WORDS, BM_BLOCK_SIZE, BM_EXT_WORDS, BM_SECT_PER_BIT,
};
pub use bitvec::{BitVector, WORD_BITS};
pub use error::{StorageError, StorageResult};
pub use meta::{read_meta, write_meta, MdFlags, MetaData, MetaLayout, MD_MAGIC, MD_UUID_SLOTS};
pub use store::{BlockStore, FileStore, MemStore, StoreStats, WriteFlags, SECTOR_SIZE};
