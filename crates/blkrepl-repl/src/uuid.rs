//! Data generation identifiers (UUID history).
//!
//! Each node keeps four generation UUIDs in its meta data: the current
//! generation, the generation the bitmap started tracking against, and
//! two history slots. Comparing both nodes' histories tells which side
//! has the newer data and whether a resync can be incremental.

use blkrepl_storage::{MdFlags, MetaData};
use rand::RngCore;
use tracing::{info, warn};

use crate::state::Role;

/// Slot of the current generation.
pub const CURRENT: usize = 0;
/// Slot of the bitmap base generation.
pub const BITMAP: usize = 1;
/// First history slot.
pub const HISTORY_START: usize = 2;
/// Last history slot.
pub const HISTORY_END: usize = 3;
/// Number of UUID slots.
pub const UUID_SLOTS: usize = 4;
/// Index of the bitmap weight in the exchanged array.
pub const UUID_SIZE: usize = 4;
/// Index of the flags in the exchanged array.
pub const UUID_FLAGS: usize = 5;
/// Length of the exchanged array.
pub const EXT_UUID_SLOTS: usize = 6;

/// Current UUID of a device that was never used.
pub const UUID_JUST_CREATED: u64 = 4;

/// Peer asks to lose the split-brain decision.
pub const UUID_FLAG_WANT_LOSE: u64 = 1;
/// Peer was Primary when it crashed.
pub const UUID_FLAG_CRASHED_PRIMARY: u64 = 2;
/// Peer's disk was Inconsistent while negotiating.
pub const UUID_FLAG_INCONSISTENT: u64 = 4;

/// The peer's UUID set as received in `ReportUUIDs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerUuids {
    /// Generation UUIDs.
    pub uuids: [u64; UUID_SLOTS],
    /// Peer's bitmap weight at the time of sending.
    pub bitmap_weight: u64,
    /// `UUID_FLAG_*` bits.
    pub flags: u64,
}

impl PeerUuids {
    /// Encode as the six-word wire array.
    pub fn to_wire(&self) -> [u64; EXT_UUID_SLOTS] {
        let mut out = [0u64; EXT_UUID_SLOTS];
        out[..UUID_SLOTS].copy_from_slice(&self.uuids);
        out[UUID_SIZE] = self.bitmap_weight;
        out[UUID_FLAGS] = self.flags;
        out
    }

    /// Decode the six-word wire array.
    pub fn from_wire(w: &[u64; EXT_UUID_SLOTS]) -> Self {
        let mut uuids = [0u64; UUID_SLOTS];
        uuids.copy_from_slice(&w[..UUID_SLOTS]);
        Self {
            uuids,
            bitmap_weight: w[UUID_SIZE],
            flags: w[UUID_FLAGS],
        }
    }
}

/// Render a UUID set the way it is logged.
pub fn format_uuids(uuids: &[u64]) -> String {
    uuids
        .iter()
        .map(|u| format!("{u:016X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn move_history(md: &mut MetaData) {
    md.uuids[HISTORY_END] = md.uuids[HISTORY_START];
}

/// Store `val` in `idx` without rotating history.
///
/// Bit 0 of the current UUID records whether the node is Primary.
pub fn set_raw(md: &mut MetaData, idx: usize, mut val: u64, role: Role) {
    if idx == CURRENT {
        if role == Role::Primary {
            val |= 1;
        } else {
            val &= !1;
        }
    }
    md.uuids[idx] = val;
}

/// Store `val` in `idx`, pushing the old value into history.
pub fn set(md: &mut MetaData, idx: usize, val: u64, role: Role) {
    if md.uuids[idx] != 0 {
        move_history(md);
        md.uuids[HISTORY_START] = md.uuids[idx];
    }
    set_raw(md, idx, val, role);
}

/// Start a new generation, keeping the old one as bitmap base.
///
/// The next connect only resyncs what the bitmap records.
pub fn new_current(md: &mut MetaData, role: Role) {
    info!("Creating new current UUID");
    if md.uuids[BITMAP] != 0 {
        warn!(
            bitmap = %format_uuids(&md.uuids[BITMAP..=BITMAP]),
            "bitmap UUID already set while creating a new current UUID"
        );
    }
    md.uuids[BITMAP] = md.uuids[CURRENT];
    set_raw(md, CURRENT, rand::thread_rng().next_u64(), role);
}

/// Start a new generation without a bitmap base, forcing a full sync.
///
/// Skipped while a full sync is already pending so that a flapping link
/// does not burn through the history.
pub fn new_current_no_bitmap(md: &mut MetaData, role: Role) {
    if md.flags.contains(MdFlags::FULL_SYNC) {
        return;
    }
    info!("Creating new current UUID [no BitMap]");
    set(md, CURRENT, rand::thread_rng().next_u64(), role);
    md.flags.insert(MdFlags::FULL_SYNC);
}

/// Set or retire the bitmap base UUID.
pub fn set_bitmap(md: &mut MetaData, val: u64) {
    if md.uuids[BITMAP] == 0 && val == 0 {
        return;
    }
    if val == 0 {
        move_history(md);
        md.uuids[HISTORY_START] = md.uuids[BITMAP];
        md.uuids[BITMAP] = 0;
    } else {
        if md.uuids[BITMAP] != 0 {
            warn!("bm UUID already set");
        }
        md.uuids[BITMAP] = val & !1;
    }
}

/// Outcome of comparing two UUID sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UuidVerdict {
    /// Direction: positive means we are ahead, negative means the peer is.
    /// Magnitude 1 is a bitmap-based resync, 2 a full sync, 100 split
    /// brain, and -1000 unrelated data.
    pub hg: i32,
    /// Number of the rule that decided.
    pub rule: u32,
}

/// Compare our UUIDs with the peer's.
///
/// `crashed_primary` is set when we were Primary at the time of a crash;
/// `discard_concurrent` breaks the tie when both were.
pub fn uuid_compare(
    own: &[u64; UUID_SLOTS],
    peer: &PeerUuids,
    crashed_primary: bool,
    discard_concurrent: bool,
) -> UuidVerdict {
    let v = |hg, rule| UuidVerdict { hg, rule };
    let m = |u: u64| u & !1;

    let mut own_u = m(own[CURRENT]);
    let mut peer_u = m(peer.uuids[CURRENT]);

    if own_u == UUID_JUST_CREATED && peer_u == UUID_JUST_CREATED {
        return v(0, 1);
    }
    if (own_u == UUID_JUST_CREATED || own_u == 0) && peer_u != UUID_JUST_CREATED {
        return v(-2, 2);
    }
    if own_u != UUID_JUST_CREATED && (peer_u == UUID_JUST_CREATED || peer_u == 0) {
        return v(2, 3);
    }

    if own_u == peer_u {
        // common power failure; decide by who was Primary at crash time
        let rct = u64::from(crashed_primary) + (peer.flags & UUID_FLAG_CRASHED_PRIMARY);
        return match rct {
            0 => v(0, 4),
            1 => v(1, 4),
            2 => v(-1, 4),
            _ => v(if discard_concurrent { -1 } else { 1 }, 4),
        };
    }

    peer_u = m(peer.uuids[BITMAP]);
    if own_u == peer_u {
        return v(-1, 5);
    }

    for i in HISTORY_START..=HISTORY_END {
        if own_u == m(peer.uuids[i]) {
            return v(-2, 6);
        }
    }

    own_u = m(own[BITMAP]);
    peer_u = m(peer.uuids[CURRENT]);
    if own_u == peer_u {
        return v(1, 7);
    }

    for i in HISTORY_START..=HISTORY_END {
        if m(own[i]) == peer_u {
            return v(2, 8);
        }
    }

    peer_u = m(peer.uuids[BITMAP]);
    if own_u == peer_u && own_u != 0 {
        return v(100, 9);
    }

    for i in HISTORY_START..=HISTORY_END {
        let own_h = m(own[i]);
        if own_h == 0 {
            continue;
        }
        for j in HISTORY_START..=HISTORY_END {
            if own_h == m(peer.uuids[j]) {
                return v(-100, 10);
            }
        }
    }

    v(-1000, 10)
}
