//! On-disk metadata super block.
//!
//! The metadata area starts with a 512-byte super block (big-endian fields),
//! followed by the activity-log area and then the bitmap, stored as
//! little-endian 64-bit words.
//!
//! Layout of the super block:
//! - `la_size_sect` u64, `uuid[4]` u64, `device_uuid` u64, reserved u64
//! - `flags`, `magic`, `md_size_sect`, `al_offset`, `al_nr_extents`,
//!   `bm_offset`, `bm_bytes_per_bit` as u32

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::{StorageError, StorageResult};
use crate::store::{BlockStore, WriteFlags, SECTOR_SIZE};

/// Super block magic.
pub const MD_MAGIC: u32 = 0x8374_026B;
/// Size of the super block in bytes.
pub const MD_SUPER_BLOCK_SIZE: usize = SECTOR_SIZE;
/// Activity-log offset from the start of the metadata area, in sectors.
pub const MD_AL_OFFSET: u32 = 8;
/// Maximum activity-log size in sectors.
pub const MD_AL_MAX_SIZE: u32 = 64;
/// Bitmap offset from the start of the metadata area, in sectors.
pub const MD_BM_OFFSET: u32 = MD_AL_OFFSET + MD_AL_MAX_SIZE;
/// Size of a fixed metadata slot (128 MiB) in sectors.
pub const MD_RESERVED_SECT: u32 = 128 << 11;
/// Bytes of data covered by one bitmap bit.
pub const BM_BYTES_PER_BIT: u32 = 4096;
/// Number of identity slots persisted in the super block.
pub const MD_UUID_SLOTS: usize = 4;
/// Activity-log extent count used when the stored one is implausible.
pub const DEFAULT_AL_EXTENTS: u32 = 127;

/// Persistent flag bits of the super block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MdFlags(pub u32);

impl MdFlags {
    /// Local data is consistent.
    pub const CONSISTENT: u32 = 1 << 0;
    /// This node was Primary (crash indicator).
    pub const PRIMARY_IND: u32 = 1 << 1;
    /// This node was connected.
    pub const CONNECTED_IND: u32 = 1 << 2;
    /// A full resync is pending.
    pub const FULL_SYNC: u32 = 1 << 3;
    /// Local data was UpToDate.
    pub const WAS_UP_TO_DATE: u32 = 1 << 4;
    /// The peer's data is known to be outdated.
    pub const PEER_OUT_DATED: u32 = 1 << 5;

    /// True if every bit of `flag` is set.
    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    /// Set `flag`.
    pub fn insert(&mut self, flag: u32) {
        self.0 |= flag;
    }

    /// Clear `flag`.
    pub fn remove(&mut self, flag: u32) {
        self.0 &= !flag;
    }
}

/// Where the metadata lives on its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLayout {
    /// Sector of the super block.
    pub md_offset: u64,
    /// Size of the metadata area in sectors.
    pub md_size_sect: u32,
    /// Activity-log offset relative to `md_offset`.
    pub al_offset: u32,
    /// Bitmap offset relative to `md_offset`.
    pub bm_offset: u32,
}

impl MetaLayout {
    /// Layout for a dedicated metadata store: the whole store is the metadata area.
    pub fn external(md_capacity_sectors: u64) -> Self {
        Self {
            md_offset: 0,
            md_size_sect: md_capacity_sectors.min(u32::MAX as u64) as u32,
            al_offset: MD_AL_OFFSET,
            bm_offset: MD_BM_OFFSET,
        }
    }

    /// Fixed 128 MiB metadata slot starting at `md_offset`.
    pub fn indexed(md_offset: u64) -> Self {
        Self {
            md_offset,
            md_size_sect: MD_RESERVED_SECT,
            al_offset: MD_AL_OFFSET,
            bm_offset: MD_BM_OFFSET,
        }
    }

    /// Absolute sector of the first bitmap word.
    pub fn bm_sector(&self) -> u64 {
        self.md_offset + self.bm_offset as u64
    }

    /// Largest number of bitmap bits the area can hold.
    pub fn max_bitmap_bits(&self) -> u64 {
        let sectors = (self.md_size_sect as u64).saturating_sub(self.bm_offset as u64);
        sectors * SECTOR_SIZE as u64 * 8
    }
}

/// Contents of the super block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    /// Last agreed device size in sectors.
    pub la_size_sect: u64,
    /// Identity history: current, bitmap, history start, history end.
    pub uuids: [u64; MD_UUID_SLOTS],
    /// Persistent flags.
    pub flags: MdFlags,
    /// Size of the metadata area in sectors.
    pub md_size_sect: u32,
    /// Activity-log offset in sectors.
    pub al_offset: u32,
    /// Number of activity-log extents.
    pub al_nr_extents: u32,
    /// Bytes of data covered by one bitmap bit.
    pub bm_bytes_per_bit: u32,
    /// Random identifier of this backing device.
    pub device_uuid: u64,
    /// Bitmap offset in sectors.
    pub bm_offset: u32,
}

impl MetaData {
    /// Metadata of a never-used device: zero identity history, nothing set.
    pub fn fresh(layout: &MetaLayout, device_uuid: u64) -> Self {
        Self {
            la_size_sect: 0,
            uuids: [0; MD_UUID_SLOTS],
            flags: MdFlags::default(),
            md_size_sect: layout.md_size_sect,
            al_offset: layout.al_offset,
            al_nr_extents: DEFAULT_AL_EXTENTS,
            bm_bytes_per_bit: BM_BYTES_PER_BIT,
            device_uuid,
            bm_offset: layout.bm_offset,
        }
    }

    /// Encode into a super block image.
    pub fn encode(&self) -> [u8; MD_SUPER_BLOCK_SIZE] {
        let mut buf = [0u8; MD_SUPER_BLOCK_SIZE];
        let mut pos = 0usize;
        let mut put = |bytes: &[u8]| {
            buf[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        put(&self.la_size_sect.to_be_bytes());
        for uuid in &self.uuids {
            put(&uuid.to_be_bytes());
        }
        put(&self.device_uuid.to_be_bytes());
        put(&0u64.to_be_bytes());
        put(&self.flags.0.to_be_bytes());
        put(&MD_MAGIC.to_be_bytes());
        put(&self.md_size_sect.to_be_bytes());
        put(&self.al_offset.to_be_bytes());
        put(&self.al_nr_extents.to_be_bytes());
        put(&self.bm_offset.to_be_bytes());
        put(&self.bm_bytes_per_bit.to_be_bytes());
        buf
    }

    /// Decode a super block image and validate it against `layout`.
    pub fn decode(buf: &[u8], layout: &MetaLayout) -> StorageResult<Self> {
        if buf.len() < MD_SUPER_BLOCK_SIZE {
            return Err(StorageError::BadLength {
                expected: MD_SUPER_BLOCK_SIZE,
                actual: buf.len(),
            });
        }
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[off..off + 8]);
            u64::from_be_bytes(b)
        };
        let u32_at = |off: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[off..off + 4]);
            u32::from_be_bytes(b)
        };

        let magic = u32_at(60);
        if magic != MD_MAGIC {
            return Err(invalid(format!("magic not found (got {magic:#010x})")));
        }
        let md_size_sect = u32_at(64);
        let al_offset = u32_at(68);
        let mut al_nr_extents = u32_at(72);
        let bm_offset = u32_at(76);
        let bm_bytes_per_bit = u32_at(80);

        if al_offset != layout.al_offset {
            return Err(invalid(format!(
                "unexpected al_offset: {al_offset} (expected {})",
                layout.al_offset
            )));
        }
        if bm_offset != layout.bm_offset {
            return Err(invalid(format!(
                "unexpected bm_offset: {bm_offset} (expected {})",
                layout.bm_offset
            )));
        }
        if md_size_sect != layout.md_size_sect {
            return Err(invalid(format!(
                "unexpected md_size: {md_size_sect} (expected {})",
                layout.md_size_sect
            )));
        }
        if bm_bytes_per_bit != BM_BYTES_PER_BIT {
            return Err(invalid(format!(
                "unexpected bm_bytes_per_bit: {bm_bytes_per_bit} (expected {BM_BYTES_PER_BIT})"
            )));
        }
        if al_nr_extents < 7 {
            al_nr_extents = DEFAULT_AL_EXTENTS;
        }

        Ok(Self {
            la_size_sect: u64_at(0),
            uuids: [u64_at(8), u64_at(16), u64_at(24), u64_at(32)],
            device_uuid: u64_at(40),
            flags: MdFlags(u32_at(56)),
            md_size_sect,
            al_offset,
            al_nr_extents,
            bm_bytes_per_bit,
            bm_offset,
        })
    }
}

fn invalid(reason: String) -> StorageError {
    error!(%reason, "error while reading metadata");
    StorageError::MetadataInvalid { reason }
}

/// Read and validate the super block.
pub fn read_meta(store: &dyn BlockStore, layout: &MetaLayout) -> StorageResult<MetaData> {
    let mut buf = [0u8; MD_SUPER_BLOCK_SIZE];
    store
        .read_at(layout.md_offset, &mut buf)
        .map_err(|e| StorageError::MetadataIo {
            msg: format!("reading super block: {e}"),
        })?;
    MetaData::decode(&buf, layout)
}

/// Write the super block, flushing afterwards unless `no_md_flush`.
pub fn write_meta(
    store: &dyn BlockStore,
    layout: &MetaLayout,
    md: &MetaData,
    no_md_flush: bool,
) -> StorageResult<()> {
    debug!(la_size = md.la_size_sect, flags = md.flags.0, "writing meta data super block");
    let flags = if no_md_flush {
        WriteFlags::default()
    } else {
        WriteFlags::barrier()
    };
    let io = |e: StorageError| StorageError::MetadataIo {
        msg: format!("writing super block: {e}"),
    };
    match store.write_at(layout.md_offset, &md.encode(), flags) {
        Err(StorageError::Unsupported { .. }) => store
            .write_at(layout.md_offset, &md.encode(), WriteFlags::default())
            .map_err(io)?,
        other => other.map_err(io)?,
    }
    if !no_md_flush {
        store.flush().map_err(io)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn layout() -> MetaLayout {
        MetaLayout::external(4096)
    }

    #[test]
    fn test_encode_decode() {
        let mut md = MetaData::fresh(&layout(), 0xDEAD_BEEF);
        md.la_size_sect = 2048;
        md.uuids = [0x11, 0x22, 0x33, 0x44];
        md.flags.insert(MdFlags::CONSISTENT | MdFlags::WAS_UP_TO_DATE);
        let decoded = MetaData::decode(&md.encode(), &layout()).unwrap();
        assert_eq!(decoded, md);
    }

    #[test]
    fn test_magic_checked() {
        let md = MetaData::fresh(&layout(), 1);
        let mut buf = md.encode();
        buf[60] ^= 0xff;
        assert!(matches!(
            MetaData::decode(&buf, &layout()),
            Err(StorageError::MetadataInvalid { .. })
        ));
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let md = MetaData::fresh(&layout(), 1);
        let other = MetaLayout::external(8192);
        let err = MetaData::decode(&md.encode(), &other).unwrap_err();
        assert!(err.to_string().contains("md_size"));
    }

    #[test]
    fn test_small_al_extents_corrected() {
        let mut md = MetaData::fresh(&layout(), 1);
        md.al_nr_extents = 3;
        let decoded = MetaData::decode(&md.encode(), &layout()).unwrap();
        assert_eq!(decoded.al_nr_extents, DEFAULT_AL_EXTENTS);
    }

    #[test]
    fn test_read_write_through_store() {
        let store = MemStore::new(4096);
        let md = MetaData::fresh(&layout(), 7);
        write_meta(&store, &layout(), &md, false).unwrap();
        assert_eq!(read_meta(&store, &layout()).unwrap(), md);
        assert_eq!(store.stats().flushes, 1);
    }

    #[test]
    fn test_write_falls_back_without_barriers() {
        let store = MemStore::new(4096).without_barriers();
        let md = MetaData::fresh(&layout(), 7);
        write_meta(&store, &layout(), &md, false).unwrap();
        assert_eq!(read_meta(&store, &layout()).unwrap(), md);
    }

    #[test]
    fn test_read_io_error() {
        let store = MemStore::new(4096);
        store.set_fail_reads(true);
        assert!(matches!(
            read_meta(&store, &layout()),
            Err(StorageError::MetadataIo { .. })
        ));
    }

    #[test]
    fn test_flags() {
        let mut f = MdFlags::default();
        f.insert(MdFlags::FULL_SYNC);
        assert!(f.contains(MdFlags::FULL_SYNC));
        f.remove(MdFlags::FULL_SYNC);
        assert!(!f.contains(MdFlags::FULL_SYNC));
    }

    #[test]
    fn test_layout_capacity() {
        let l = MetaLayout::external(MD_BM_OFFSET as u64 + 1);
        assert_eq!(l.bm_sector(), 72);
        assert_eq!(l.max_bitmap_bits(), 4096);
    }
}
