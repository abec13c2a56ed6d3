//! Resync and online verify.
//!
//! The SyncTarget drives a resync: it walks its bitmap with the resumable
//! cursor and asks the SyncSource for every dirty block, keeping at most
//! [`RS_WINDOW`] requests in flight. Online verify is driven by the VerifyS
//! node, which asks VerifyT for a digest of every block and compares it with
//! its own.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use blkrepl_storage::{bit_to_sector, BM_SECT_PER_BIT, SECTOR_SIZE};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::device::Device;
use crate::protocol::{AckKind, BlockAck, BlockReply, BlockRequest, Packet, ID_IN_SYNC, ID_OUT_OF_SYNC, ID_SYNCER};
use crate::state::{ConnState, DiskState, Role, StateChange};
use crate::state_machine::ChgFlags;
use crate::uuid::{self, BITMAP, CURRENT, HISTORY_END};

/// Resync or verify requests in flight at most.
pub const RS_WINDOW: u64 = 64;

fn block_digest(data: &[u8]) -> Bytes {
    Bytes::copy_from_slice(&Sha256::digest(data))
}

impl Device {
    /// Start syncing as `side` (SyncSource or SyncTarget).
    pub(crate) async fn start_resync(self: &Arc<Self>, side: ConnState) {
        info!(minor = self.minor(), "Resync about to start as {}", side.name());

        if side == ConnState::SyncTarget {
            if let Some(code) = self.call_helper("before-resync-target") {
                if code > 0 {
                    warn!(
                        minor = self.minor(),
                        "before-resync-target handler returned {code}, dropping connection."
                    );
                    self.force_state(&StateChange::new().conn(ConnState::Disconnecting));
                    return;
                }
            }
        }

        if self.state().disk < DiskState::Negotiating {
            error!(minor = self.minor(), "no local disk, can not start resync");
            return;
        }

        if side == ConnState::SyncSource {
            let val: u64 = rand::random();
            self.with_md(|md, role| uuid::set(md, BITMAP, val, role));
            self.send_packet(&Packet::ReportSyncUuid(val));
        } else {
            self.bitmap.reset_find();
        }

        let paused = !self.may_sync_now();
        let (rv, ns) = {
            let mut core = self.core.lock();
            let mut ns = core.state;
            ns.aftr_isp = paused;
            ns.conn = side;
            if side == ConnState::SyncTarget {
                ns.disk = DiskState::Inconsistent;
            } else {
                ns.pdsk = DiskState::Inconsistent;
            }
            let rv = self.set_state_locked(&mut core, ns, ChgFlags::VERBOSE, None);
            let ns = core.state;
            if rv.is_success() && ns.conn >= ConnState::Connected {
                core.rs.start(self.bitmap.total_weight());
                if ns.is_paused() {
                    core.rs.pause();
                }
            }
            (rv, ns)
        };
        if !rv.is_success() || ns.conn < ConnState::Connected {
            error!(minor = self.minor(), "could not start resync: {}", rv.message());
            return;
        }

        let bits = self.bitmap.total_weight();
        info!(
            minor = self.minor(),
            "Began resync as {} (will sync {} KB [{bits} bits set]).",
            ns.conn.name(),
            bits * BM_SECT_PER_BIT / 2
        );
        if let Some(reg) = self.registry() {
            reg.suspend_other_sg();
        }

        if bits == 0 {
            self.resync_finished().await;
            return;
        }
        if side == ConnState::SyncTarget {
            let driver = tokio::spawn(Arc::clone(self).run_resync_target());
            self.tasks.lock().push(driver);
        }
        self.md_sync();
    }

    /// Whether no device earlier in our resync-after chain is syncing.
    pub(crate) fn may_sync_now(&self) -> bool {
        match self.registry() {
            Some(reg) => reg.may_sync_now(self.minor()),
            None => true,
        }
    }

    /// Sector and byte length of the block covered by `bit`.
    fn block_of(&self, bit: u64) -> Option<(u64, u32)> {
        let sector = bit_to_sector(bit);
        let capacity = self.capacity_sectors();
        if sector >= capacity {
            return None;
        }
        let sectors = BM_SECT_PER_BIT.min(capacity - sector);
        Some((sector, (sectors as usize * SECTOR_SIZE) as u32))
    }

    fn rs_reply_arrived(&self) {
        let _ = self
            .rs_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.kick_resync();
    }

    async fn run_resync_target(self: Arc<Self>) {
        let mut states = self.subscribe_state();
        let csums = self.sync_config().csums_alg.is_some();
        loop {
            let s = self.state();
            let may_send = match s.conn {
                ConnState::SyncTarget => self.rs_pending.load(Ordering::SeqCst) < RS_WINDOW,
                ConnState::PausedSyncT => false,
                _ => break,
            };

            if may_send {
                if let Some(bit) = self.bitmap.find_next() {
                    let Some((sector, blksize)) = self.block_of(bit) else {
                        continue;
                    };
                    let req = BlockRequest {
                        sector,
                        block_id: ID_SYNCER,
                        blksize,
                    };
                    let packet = match csums.then(|| self.read_local(sector, blksize, DiskState::Inconsistent)) {
                        Some(Some(data)) => Packet::CsumRSRequest {
                            req,
                            digest: block_digest(&data),
                        },
                        _ => Packet::RSDataRequest(req),
                    };
                    self.rs_pending.fetch_add(1, Ordering::SeqCst);
                    if !self.send_packet(&packet) {
                        break;
                    }
                    continue;
                }
                if self.rs_pending.load(Ordering::SeqCst) == 0 {
                    self.resync_finished().await;
                    break;
                }
            }

            tokio::select! {
                _ = self.resync_kick.notified() => {}
                r = states.changed() => if r.is_err() { break },
            }
        }
        debug!(minor = self.minor(), "resync driver terminated");
    }

    /// Source side: answer a resync request with the block.
    pub(crate) fn answer_rs_request(self: &Arc<Self>, req: BlockRequest) {
        match self.read_local(req.sector, req.blksize, DiskState::UpToDate) {
            Some(data) => {
                self.send_packet(&Packet::RSDataReply(BlockReply {
                    sector: req.sector,
                    block_id: req.block_id,
                    data,
                }));
            }
            None => {
                self.core.lock().rs.failed += 1;
                self.send_packet(&Packet::Ack(
                    AckKind::NegRSDReply,
                    BlockAck {
                        sector: req.sector,
                        block_id: req.block_id,
                        blksize: req.blksize,
                        seq_num: 0,
                    },
                ));
                self.check_source_done();
            }
        }
    }

    /// Source side: skip the transfer when the target already has the block.
    pub(crate) fn answer_csum_request(self: &Arc<Self>, req: BlockRequest, digest: &[u8]) {
        let Some(data) = self.read_local(req.sector, req.blksize, DiskState::UpToDate) else {
            self.answer_rs_request(req);
            return;
        };
        if block_digest(&data).as_ref() != digest {
            self.send_packet(&Packet::RSDataReply(BlockReply {
                sector: req.sector,
                block_id: req.block_id,
                data,
            }));
            return;
        }
        self.bitmap.set_in_sync(req.sector, req.blksize as usize);
        self.send_packet(&Packet::Ack(
            AckKind::RSIsInSync,
            BlockAck {
                sector: req.sector,
                block_id: req.block_id,
                blksize: req.blksize,
                seq_num: 0,
            },
        ));
        self.check_source_done();
    }

    /// Target side: write a block from the source.
    pub(crate) async fn receive_rs_reply(&self, reply: BlockReply) {
        let blksize = reply.data.len() as u32;
        let store = {
            let core = self.core.lock();
            core.disk
                .as_ref()
                .filter(|_| core.state.disk >= DiskState::Inconsistent)
                .map(|d| Arc::clone(&d.dev.data))
        };
        let res = match store {
            Some(store) => store
                .write_at(reply.sector, &reply.data, Default::default())
                .map_err(|e| e.to_string()),
            None => Err("no local disk".to_string()),
        };
        let kind = match res {
            Ok(()) => {
                self.bitmap.set_in_sync(reply.sector, reply.data.len());
                AckKind::RSWriteAck
            }
            Err(e) => {
                error!(minor = self.minor(), sector = reply.sector, "resync write failed: {e}");
                self.core.lock().rs.failed += 1;
                self.chk_io_error(false);
                self.io_error(false);
                AckKind::NegAck
            }
        };
        self.send_packet(&Packet::Ack(
            kind,
            BlockAck {
                sector: reply.sector,
                block_id: ID_SYNCER,
                blksize,
                seq_num: 0,
            },
        ));
        self.rs_reply_arrived();
    }

    /// Source side: the target wrote a resync block.
    pub(crate) async fn got_rs_write_ack(self: &Arc<Self>, ack: BlockAck) {
        self.bitmap.set_in_sync(ack.sector, ack.blksize as usize);
        self.check_source_done();
    }

    /// Source side: finish once every dirty block was either written by the
    /// target or counted as failed.
    pub(crate) fn check_source_done(self: &Arc<Self>) {
        let source = matches!(self.state().conn, ConnState::SyncSource | ConnState::PausedSyncS);
        if source && self.bitmap.total_weight() <= self.core.lock().rs.failed {
            let dev = Arc::clone(self);
            tokio::spawn(async move { dev.resync_finished().await });
        }
    }

    /// Target side: the source could not read a block.
    pub(crate) fn got_neg_rs_reply(&self, ack: BlockAck) {
        warn!(minor = self.minor(), sector = ack.sector, "resync read failed on peer");
        self.core.lock().rs.failed += 1;
        self.rs_reply_arrived();
    }

    /// Target side: the block was already identical.
    pub(crate) fn got_is_in_sync(&self, ack: BlockAck) {
        self.bitmap.set_in_sync(ack.sector, ack.blksize as usize);
        self.rs_reply_arrived();
    }

    /// Finish a resync or online verify and go back to Connected.
    pub(crate) async fn resync_finished(&self) {
        let (os, ns, oos) = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            let os = core.state;
            if !(os.conn.is_resync() || os.conn.is_verify()) {
                return;
            }
            let secs = core.rs.elapsed().as_secs().max(1);
            let mut ns = os;
            ns.conn = ConnState::Connected;

            if os.conn.is_verify() {
                info!(
                    minor = self.minor(),
                    "Online verify done (total {secs} sec; paused {} sec)",
                    core.rs.paused.as_secs()
                );
            } else {
                info!(
                    minor = self.minor(),
                    "Resync done (total {secs} sec; paused {} sec; {} K/sec)",
                    core.rs.paused.as_secs(),
                    core.rs.total * BM_SECT_PER_BIT / 2 / secs
                );
                let target = matches!(os.conn, ConnState::SyncTarget | ConnState::PausedSyncT);
                if core.rs.failed > 0 {
                    info!(minor = self.minor(), "            {} failed blocks", core.rs.failed);
                    if target {
                        ns.disk = DiskState::Inconsistent;
                        ns.pdsk = DiskState::UpToDate;
                    } else {
                        ns.disk = DiskState::UpToDate;
                        ns.pdsk = DiskState::Inconsistent;
                    }
                } else {
                    ns.disk = DiskState::UpToDate;
                    ns.pdsk = DiskState::UpToDate;
                    let p_uuid = core.p_uuid;
                    let role = os.role;
                    if let Some(disk) = core.disk.as_mut() {
                        if target {
                            match p_uuid {
                                Some(p) => {
                                    for i in BITMAP..=HISTORY_END {
                                        uuid::set_raw(&mut disk.md, i, p.uuids[i], role);
                                    }
                                    let own = disk.md.uuids[CURRENT];
                                    uuid::set(&mut disk.md, BITMAP, own, role);
                                    uuid::set_raw(&mut disk.md, CURRENT, p.uuids[CURRENT], role);
                                }
                                None => error!(minor = self.minor(), "peer UUIDs unknown at end of resync"),
                            }
                        }
                        uuid::set_bitmap(&mut disk.md, 0);
                        let own = disk.md.uuids;
                        if let Some(p) = core.p_uuid.as_mut() {
                            p.uuids = own;
                        }
                        self.mark_md_dirty();
                    }
                }
            }
            let oos = core.rs.ov_oos;
            let rv = self.set_state_locked(core, ns, ChgFlags::VERBOSE, None);
            if !rv.is_success() {
                return;
            }
            let committed = core.state;
            core.rs = Default::default();
            (os, committed, oos)
        };

        self.kick_resync();
        if let Err(e) = self.bm_write("write from resync_finished").await {
            warn!(minor = self.minor(), error = %e, "could not write bitmap after resync");
        }
        self.md_sync();
        self.send_state();

        if os.conn.is_verify() {
            if oos > 0 {
                warn!(minor = self.minor(), "Online verify found {oos} 4k block out of sync!");
                self.call_helper("out-of-sync");
            }
        } else if matches!(os.conn, ConnState::SyncTarget | ConnState::PausedSyncT)
            && ns.disk == DiskState::UpToDate
        {
            self.call_helper("after-resync-target");
        }
    }

    /// Resync the storage added by an online grow.
    pub(crate) async fn resync_after_online_grow(self: &Arc<Self>) {
        info!(minor = self.minor(), "Resync of new storage after online grow");
        let s = self.state();
        let i_am_source = if s.role != s.peer {
            s.role == Role::Primary
        } else {
            self.flags.discard_concurrent.load(Ordering::SeqCst)
        };
        if i_am_source {
            self.start_resync(ConnState::SyncSource).await;
        } else {
            self.request_state(&StateChange::new().conn(ConnState::WFSyncUUID), ChgFlags::VERBOSE)
                .await;
        }
    }

    // ----- online verify -----

    /// VerifyS: start the walk over all blocks.
    pub(crate) fn start_verify_source(self: &Arc<Self>) {
        let bits = self.bitmap.bits();
        self.core.lock().rs.start_verify(bits);
        info!(minor = self.minor(), "Online Verify start sector: 0 ({bits} blocks)");
        if bits == 0 {
            let dev = Arc::clone(self);
            tokio::spawn(async move { dev.resync_finished().await });
            return;
        }
        let driver = tokio::spawn(Arc::clone(self).run_verify_source());
        self.tasks.lock().push(driver);
    }

    /// VerifyT: count the blocks the source will ask for.
    pub(crate) fn start_verify_target(&self) {
        let bits = self.bitmap.bits();
        self.core.lock().rs.start_verify(bits);
    }

    async fn run_verify_source(self: Arc<Self>) {
        let mut states = self.subscribe_state();
        loop {
            let s = self.state();
            if s.conn != ConnState::VerifyS {
                break;
            }
            if self.rs_pending.load(Ordering::SeqCst) < RS_WINDOW {
                let bit = {
                    let mut core = self.core.lock();
                    core.rs.ov_position += 1;
                    core.rs.ov_position - 1
                };
                let next = self.block_of(bit);
                if let Some((sector, blksize)) = next {
                    self.rs_pending.fetch_add(1, Ordering::SeqCst);
                    if !self.send_packet(&Packet::OVRequest(BlockRequest {
                        sector,
                        block_id: ID_SYNCER,
                        blksize,
                    })) {
                        break;
                    }
                    continue;
                }
            }
            tokio::select! {
                _ = self.resync_kick.notified() => {}
                r = states.changed() => if r.is_err() { break },
            }
        }
        debug!(minor = self.minor(), "verify driver terminated");
    }

    /// VerifyT: answer with a digest of our block.
    pub(crate) fn answer_ov_request(&self, req: BlockRequest) {
        let digest = self
            .read_local(req.sector, req.blksize, DiskState::Inconsistent)
            .map(|d| block_digest(&d))
            .unwrap_or_default();
        self.send_packet(&Packet::OVReply { req, digest });
    }

    /// VerifyS: compare the peer's digest with ours.
    pub(crate) async fn receive_ov_reply(&self, req: BlockRequest, digest: &[u8]) {
        self.rs_reply_arrived();
        let ours = self
            .read_local(req.sector, req.blksize, DiskState::Inconsistent)
            .map(|d| block_digest(&d));
        let in_sync = !digest.is_empty() && ours.as_deref() == Some(digest);
        if !in_sync {
            self.ov_out_of_sync(req.sector, req.blksize);
        }
        self.send_packet(&Packet::Ack(
            AckKind::OVResult,
            BlockAck {
                sector: req.sector,
                block_id: if in_sync { ID_IN_SYNC } else { ID_OUT_OF_SYNC },
                blksize: req.blksize,
                seq_num: 0,
            },
        ));
        self.ov_block_done().await;
    }

    /// VerifyT: the source's verdict for one block.
    pub(crate) async fn got_ov_result(&self, ack: BlockAck) {
        if ack.block_id == ID_OUT_OF_SYNC {
            self.ov_out_of_sync(ack.sector, ack.blksize);
        }
        self.ov_block_done().await;
    }

    fn ov_out_of_sync(&self, sector: u64, blksize: u32) {
        self.bitmap.set_out_of_sync(sector, blksize as usize);
        self.core.lock().rs.ov_oos += 1;
        warn!(minor = self.minor(), sector, "Out of sync: start={sector}, size={}", blksize / 512);
    }

    async fn ov_block_done(&self) {
        let left = {
            let mut core = self.core.lock();
            core.rs.ov_left = core.rs.ov_left.saturating_sub(1);
            core.rs.ov_left
        };
        if left == 0 {
            self.resync_finished().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::NoopHelper;

    #[tokio::test]
    async fn test_block_of_clips_to_capacity() {
        let dev = Device::new(0, "r0", Arc::new(NoopHelper));
        dev.core.lock().capacity = 20;
        assert_eq!(dev.block_of(0), Some((0, 4096)));
        assert_eq!(dev.block_of(2), Some((16, 2048)));
        assert_eq!(dev.block_of(3), None);
    }

    #[tokio::test]
    async fn test_finished_ignored_when_not_syncing() {
        let dev = Device::new(0, "r0", Arc::new(NoopHelper));
        dev.resync_finished().await;
        assert_eq!(dev.state().conn, ConnState::StandAlone);
    }

    #[tokio::test]
    async fn test_rs_reply_counter_saturates() {
        let dev = Device::new(0, "r0", Arc::new(NoopHelper));
        dev.rs_reply_arrived();
        assert_eq!(dev.rs_pending.load(Ordering::SeqCst), 0);
        dev.rs_pending.store(2, Ordering::SeqCst);
        dev.rs_reply_arrived();
        assert_eq!(dev.rs_pending.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_block_digest_is_sha256() {
        assert_eq!(block_digest(b"abc").len(), 32);
        assert_ne!(block_digest(b"abc"), block_digest(b"abd"));
    }
}
