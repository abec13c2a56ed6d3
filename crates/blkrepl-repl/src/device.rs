//! The replicated device.
//!
//! A [`Device`] owns the committed [`DeviceState`], the attached local disk,
//! the resync bitmap, the receive-side epoch tracker and the send-side
//! transfer log. State changes are committed in `state_machine`; whatever a
//! committed change implies that may block (packets, disk I/O, helper
//! programs) runs afterwards on the device's worker task, one job at a time
//! and in commit order.
//!
//! Lock order: the state lock (`core`) is taken before the epoch, transfer
//! log and link locks, and never while the bitmap coarse lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use blkrepl_storage::{
    write_meta, BlockStore, MdFlags, MetaData, MetaLayout, ResyncBitmap, StorageError, WriteFlags,
    SECTOR_SIZE,
};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::conduit::Conduit;
use crate::config::{DiskConfig, FencingPolicy, NetConfig, OnIoError, SyncConfig, WireProtocol};
use crate::epoch::{EpochId, EpochTracker, EpochUpdate, WriteOrdering};
use crate::error::{ReplError, ReplResult, RetCode};
use crate::helper::Helper;
use crate::protocol::{BlockRequest, DataPacket, Packet, DP_RW_SYNC};
use crate::registry::Registry;
use crate::state::{ConnState, DeviceState, DiskState, Role, StateChange, StateEnv};
use crate::state_machine::ChgFlags;
use crate::transfer_log::{PeerAck, TransferLog, WriteOutcome};
use crate::uuid::{self, PeerUuids, BITMAP, CURRENT, UUID_FLAG_CRASHED_PRIMARY};

/// Backing storage handed to [`Device::attach_disk`].
#[derive(Debug, Clone)]
pub struct BackingDev {
    /// Replicated data.
    pub data: Arc<dyn BlockStore>,
    /// Metadata area; may be the same store as `data`.
    pub meta: Arc<dyn BlockStore>,
    /// Where the metadata lives on `meta`.
    pub layout: MetaLayout,
}

/// An attached local disk.
#[derive(Debug, Clone)]
pub(crate) struct LocalDisk {
    pub dev: BackingDev,
    pub md: MetaData,
    pub conf: DiskConfig,
}

/// Resync and online-verify bookkeeping.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResyncProgress {
    pub total: u64,
    pub failed: u64,
    pub started: Option<Instant>,
    paused_since: Option<Instant>,
    pub paused: Duration,
    pub ov_left: u64,
    pub ov_position: u64,
    pub ov_oos: u64,
}

impl ResyncProgress {
    pub fn start(&mut self, total: u64) {
        *self = Self {
            total,
            started: Some(Instant::now()),
            ..Self::default()
        };
    }

    pub fn pause(&mut self) {
        self.paused_since = Some(Instant::now());
    }

    pub fn resume(&mut self) {
        if let Some(t) = self.paused_since.take() {
            self.paused += t.elapsed();
        }
    }

    pub fn start_verify(&mut self, bits: u64) {
        self.start(bits);
        self.ov_left = bits;
    }

    /// Time spent actively syncing.
    pub fn elapsed(&self) -> Duration {
        self.started
            .map(|t| t.elapsed().saturating_sub(self.paused))
            .unwrap_or_default()
    }
}

/// Snapshot of a running or finished resync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncStatus {
    /// Blocks that were out of sync when the resync started.
    pub total: u64,
    /// Blocks still out of sync.
    pub left: u64,
    /// Blocks that could not be synced.
    pub failed: u64,
    /// Blocks online verify still has to compare.
    pub ov_left: u64,
    /// Blocks online verify found out of sync.
    pub ov_oos: u64,
}

/// Mutable device data guarded by the state lock.
#[derive(Debug)]
pub(crate) struct Core {
    pub state: DeviceState,
    pub disk: Option<LocalDisk>,
    pub net: Option<NetConfig>,
    pub sync: SyncConfig,
    pub open_count: u32,
    pub agreed_pro_version: u32,
    pub p_uuid: Option<PeerUuids>,
    /// Peer's backing device size, sectors.
    pub p_size: u64,
    /// Peer's user configured size, sectors.
    pub p_usize: u64,
    /// Size of the replicated device, sectors.
    pub capacity: u64,
    /// Disk state decided while `Negotiating`, committed after the handshake.
    pub new_state_tmp: DeviceState,
    /// Current UUID when the disk last became consistent.
    pub ed_uuid: u64,
    pub rs: ResyncProgress,
    /// Writes sent since the last barrier.
    pub writes_in_epoch: u32,
}

impl Core {
    fn new() -> Self {
        Self {
            state: DeviceState::default(),
            disk: None,
            net: None,
            sync: SyncConfig::default(),
            open_count: 0,
            agreed_pro_version: 0,
            p_uuid: None,
            p_size: 0,
            p_usize: 0,
            capacity: 0,
            new_state_tmp: DeviceState::default(),
            ed_uuid: 0,
            rs: ResyncProgress::default(),
            writes_in_epoch: 0,
        }
    }

    /// What validation needs to know besides the states.
    pub fn state_env(&self) -> StateEnv {
        StateEnv {
            two_primaries: self.net.as_ref().map(|n| n.two_primaries).unwrap_or(false),
            open_count: self.open_count,
            fencing: self.fencing(),
            has_verify_alg: self.sync.verify_alg.is_some(),
            agreed_pro_version: self.agreed_pro_version,
            negotiating_restore: self
                .disk
                .as_ref()
                .filter(|d| d.md.uuids[CURRENT] == self.ed_uuid)
                .map(|_| (self.new_state_tmp.disk, self.new_state_tmp.pdsk)),
        }
    }

    pub fn fencing(&self) -> FencingPolicy {
        self.disk.as_ref().map(|d| d.conf.fencing).unwrap_or_default()
    }

    /// Persistent flags describing state `ns`.
    pub fn md_flags_for(current: MdFlags, ns: &DeviceState, crashed_primary: bool) -> MdFlags {
        let mut mdf = current;
        for f in [
            MdFlags::CONSISTENT,
            MdFlags::PRIMARY_IND,
            MdFlags::CONNECTED_IND,
            MdFlags::WAS_UP_TO_DATE,
            MdFlags::PEER_OUT_DATED,
        ] {
            mdf.remove(f);
        }
        if crashed_primary
            || ns.role == Role::Primary
            || (ns.pdsk < DiskState::Inconsistent && ns.peer == Role::Primary)
        {
            mdf.insert(MdFlags::PRIMARY_IND);
        }
        if ns.conn > ConnState::WFReportParams {
            mdf.insert(MdFlags::CONNECTED_IND);
        }
        if ns.disk > DiskState::Inconsistent {
            mdf.insert(MdFlags::CONSISTENT);
        }
        if ns.disk > DiskState::Outdated {
            mdf.insert(MdFlags::WAS_UP_TO_DATE);
        }
        if ns.pdsk <= DiskState::Outdated && ns.pdsk >= DiskState::Inconsistent {
            mdf.insert(MdFlags::PEER_OUT_DATED);
        }
        mdf
    }
}

/// Per-device flag bits.
#[derive(Debug, Default)]
pub(crate) struct DeviceFlags {
    pub cl_st_chg_success: AtomicBool,
    pub cl_st_chg_fail: AtomicBool,
    /// A cluster-wide change of ours is in flight.
    pub cluster_st_change: AtomicBool,
    /// We initiated the link and win concurrent requests.
    pub discard_concurrent: AtomicBool,
    pub crashed_primary: AtomicBool,
    pub consider_resync: AtomicBool,
    pub md_dirty: AtomicBool,
    pub use_degr_wfc_t: AtomicBool,
    pub resync_after_neg: AtomicBool,
    /// A receiver task owns the link and runs the disconnect cleanup.
    pub receiver_active: AtomicBool,
    /// The receiver was asked to tear the link down.
    pub stop_link: AtomicBool,
    /// A local resize grew the device; resync once the peer agrees.
    pub resize_pending: AtomicBool,
}

/// Jobs for the worker.
#[derive(Debug)]
pub(crate) enum Work {
    /// Side effects of a committed state change.
    AfterStateChange {
        os: DeviceState,
        ns: DeviceState,
        flags: ChgFlags,
        done: Option<oneshot::Sender<()>>,
    },
    /// Flush the backing device for an epoch.
    EpochFlush(EpochId),
}

/// Outcome of a local size recalculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SizeChange {
    Unchanged,
    Shrunk,
    Grew,
}

/// One replicated block device.
pub struct Device {
    minor: u32,
    name: String,
    pub(crate) core: Mutex<Core>,
    /// Woken on every commit and on cluster-wide replies.
    pub(crate) state_wait: Notify,
    state_tx: watch::Sender<DeviceState>,
    /// Serializes cluster-wide state changes.
    pub(crate) state_mutex: tokio::sync::Mutex<()>,
    pub(crate) bitmap: ResyncBitmap,
    pub(crate) epochs: EpochTracker,
    pub(crate) tl: TransferLog,
    pub(crate) helper: Arc<dyn Helper>,
    pub(crate) flags: DeviceFlags,
    work_tx: mpsc::UnboundedSender<Work>,
    link: Mutex<Option<Arc<Conduit>>>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    next_block_id: AtomicU64,
    seq_num: AtomicU32,
    pub(crate) peer_seq: AtomicU32,
    pub(crate) pending_reads: Mutex<HashMap<u64, oneshot::Sender<Option<Bytes>>>>,
    /// Resync requests waiting for their reply.
    pub(crate) rs_pending: AtomicU64,
    /// Woken when the resync or verify walk may continue.
    pub(crate) resync_kick: Notify,
    pub(crate) link_stop: Notify,
    pub(crate) registry: Mutex<Weak<Registry>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("minor", &self.minor)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_worker(dev: Weak<Device>, mut rx: mpsc::UnboundedReceiver<Work>) {
    while let Some(work) = rx.recv().await {
        let Some(dev) = dev.upgrade() else { break };
        match work {
            Work::AfterStateChange { os, ns, flags, done } => {
                dev.after_state_ch(os, ns, flags).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Work::EpochFlush(id) => dev.run_epoch_flush(id),
        }
    }
    debug!("worker terminated");
}

impl Device {
    /// Create an unconfigured device and start its worker.
    ///
    /// # Panics
    ///
    /// The worker is spawned onto the current tokio runtime, so this panics
    /// when called outside of one.
    pub fn new(minor: u32, name: impl Into<String>, helper: Arc<dyn Helper>) -> Arc<Self> {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(DeviceState::default());
        let dev = Arc::new(Self {
            minor,
            name: name.into(),
            core: Mutex::new(Core::new()),
            state_wait: Notify::new(),
            state_tx,
            state_mutex: tokio::sync::Mutex::new(()),
            bitmap: ResyncBitmap::new(),
            epochs: EpochTracker::default(),
            tl: TransferLog::new(),
            helper,
            flags: DeviceFlags::default(),
            work_tx,
            link: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            next_block_id: AtomicU64::new(0),
            seq_num: AtomicU32::new(0),
            peer_seq: AtomicU32::new(0),
            pending_reads: Mutex::new(HashMap::new()),
            rs_pending: AtomicU64::new(0),
            resync_kick: Notify::new(),
            link_stop: Notify::new(),
            registry: Mutex::new(Weak::new()),
        });
        tokio::spawn(run_worker(Arc::downgrade(&dev), work_rx));
        info!(minor, name = %dev.name, "device created");
        dev
    }

    /// Device minor number.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Committed state.
    pub fn state(&self) -> DeviceState {
        self.core.lock().state
    }

    /// Receive every committed state.
    pub fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    /// Wait until the committed state satisfies `pred`.
    pub async fn wait_state(&self, pred: impl Fn(&DeviceState) -> bool) -> DeviceState {
        let mut rx = self.state_tx.subscribe();
        let current = self.state();
        if pred(&current) {
            return current;
        }
        let state = match rx.wait_for(|s| pred(s)).await {
            Ok(s) => *s,
            Err(_) => self.state(),
        };
        state
    }

    /// Our UUID slots, if a disk is attached.
    pub fn uuids(&self) -> Option<[u64; uuid::UUID_SLOTS]> {
        self.core.lock().disk.as_ref().map(|d| d.md.uuids)
    }

    /// Persistent flags, if a disk is attached.
    pub fn md_flags(&self) -> Option<MdFlags> {
        self.core.lock().disk.as_ref().map(|d| d.md.flags)
    }

    /// Last UUIDs the peer reported.
    pub fn peer_uuids(&self) -> Option<PeerUuids> {
        self.core.lock().p_uuid
    }

    /// Size of the replicated device in sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.core.lock().capacity
    }

    /// Disk options, if a disk is attached.
    pub fn disk_config(&self) -> Option<DiskConfig> {
        self.core.lock().disk.as_ref().map(|d| d.conf.clone())
    }

    /// Network options, if configured.
    pub fn net_config(&self) -> Option<NetConfig> {
        self.core.lock().net.clone()
    }

    /// Resync options.
    pub fn sync_config(&self) -> SyncConfig {
        self.core.lock().sync.clone()
    }

    /// Protocol version agreed with the current peer.
    pub fn agreed_pro_version(&self) -> u32 {
        self.core.lock().agreed_pro_version
    }

    /// Whether the degraded wait-for-connection timeout applies: we were
    /// Primary without a peer when we went down.
    pub fn degraded_wfc_timeout(&self) -> bool {
        self.flags.use_degr_wfc_t.load(Ordering::SeqCst)
    }

    /// Current write-ordering method of the receive path.
    pub fn write_ordering(&self) -> WriteOrdering {
        self.epochs.write_ordering()
    }

    /// The out-of-sync bitmap.
    pub fn bitmap(&self) -> &ResyncBitmap {
        &self.bitmap
    }

    /// The send-side transfer log.
    pub fn transfer_log(&self) -> &TransferLog {
        &self.tl
    }

    /// The receive-side epochs.
    pub fn epochs(&self) -> &EpochTracker {
        &self.epochs
    }

    /// Resync progress.
    pub fn resync_status(&self) -> ResyncStatus {
        let core = self.core.lock();
        ResyncStatus {
            total: core.rs.total,
            left: self.bitmap.total_weight(),
            failed: core.rs.failed,
            ov_left: core.rs.ov_left,
            ov_oos: core.rs.ov_oos,
        }
    }

    /// The local data store, if a disk is attached.
    pub fn data_store(&self) -> Option<Arc<dyn BlockStore>> {
        self.core.lock().disk.as_ref().map(|d| Arc::clone(&d.dev.data))
    }

    /// Register a local opener. Secondaries refuse openers.
    pub fn open(&self) -> ReplResult<u32> {
        let mut core = self.core.lock();
        if core.state.role != Role::Primary {
            return Err(ReplError::admin(RetCode::StateNotAllowed, "device is not Primary"));
        }
        core.open_count += 1;
        Ok(core.open_count)
    }

    /// Drop a local opener.
    pub fn close(&self) -> u32 {
        let mut core = self.core.lock();
        core.open_count = core.open_count.saturating_sub(1);
        core.open_count
    }

    pub(crate) fn publish_state(&self, ns: DeviceState) {
        self.state_tx.send_replace(ns);
    }

    pub(crate) fn queue_work(&self, work: Work) {
        if self.work_tx.send(work).is_err() {
            warn!(minor = self.minor, "worker gone, dropping job");
        }
    }

    pub(crate) fn kick_resync(&self) {
        self.resync_kick.notify_one();
    }

    pub(crate) fn mark_md_dirty(&self) {
        self.flags.md_dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn registry(&self) -> Option<Arc<Registry>> {
        self.registry.lock().upgrade()
    }

    /// Change the metadata of the attached disk and mark it dirty.
    pub(crate) fn with_md<R>(&self, f: impl FnOnce(&mut MetaData, Role) -> R) -> Option<R> {
        let mut core = self.core.lock();
        let role = core.state.role;
        let disk = core.disk.as_mut()?;
        let r = f(&mut disk.md, role);
        self.mark_md_dirty();
        Some(r)
    }

    pub(crate) fn next_block_id(&self) -> u64 {
        self.next_block_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ----- link -----

    /// The current link, if connected.
    pub fn link(&self) -> Option<Arc<Conduit>> {
        self.link.lock().clone()
    }

    pub(crate) fn set_link(&self, link: Arc<Conduit>) {
        self.flags
            .discard_concurrent
            .store(link.is_initiator(), Ordering::SeqCst);
        *self.link.lock() = Some(link);
    }

    pub(crate) fn take_link(&self) -> Option<Arc<Conduit>> {
        self.link.lock().take()
    }

    /// Tear the link down. A running receiver does it itself so that
    /// replies already queued still go out first.
    pub(crate) fn shutdown_link(&self) {
        if self.flags.receiver_active.load(Ordering::SeqCst) {
            self.stop_receiver();
        } else if let Some(link) = self.take_link() {
            link.shutdown();
        }
    }

    /// Send `packet` to the peer; false if there is no usable link.
    pub(crate) fn send_packet(&self, packet: &Packet) -> bool {
        let Some(link) = self.link() else {
            debug!(minor = self.minor, cmd = packet.command(), "not connected, packet dropped");
            return false;
        };
        match link.send(packet) {
            Ok(()) => true,
            Err(e) => {
                debug!(minor = self.minor, cmd = packet.command(), error = %e, "send failed");
                false
            }
        }
    }

    // ----- helpers -----

    /// Run helper `name`; `None` when it could not be run.
    pub(crate) fn call_helper(&self, name: &str) -> Option<i32> {
        match self.helper.call(name, self.minor) {
            Ok(code) => Some(code),
            Err(e) => {
                error!(minor = self.minor, helper = name, error = %e, "helper failed");
                None
            }
        }
    }

    // ----- metadata -----

    /// Write the super block if it changed.
    pub(crate) fn md_sync(&self) {
        if !self.flags.md_dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let job = {
            let mut core = self.core.lock();
            let capacity = core.capacity;
            core.disk.as_mut().map(|d| {
                d.md.la_size_sect = capacity;
                (Arc::clone(&d.dev.meta), d.dev.layout, d.md.clone(), d.conf.no_md_flush)
            })
        };
        let Some((store, layout, md, no_md_flush)) = job else {
            return;
        };
        if let Err(e) = write_meta(store.as_ref(), &layout, &md, no_md_flush) {
            error!(minor = self.minor, error = %e, "meta data update failed");
            self.chk_io_error(true);
            self.io_error(true);
        }
    }

    // ----- local I/O errors -----

    /// React to a failed local request according to `on_io_error`.
    pub(crate) fn chk_io_error(&self, forcedetach: bool) {
        let mut core = self.core.lock();
        let Some(eh) = core.disk.as_ref().map(|d| d.conf.on_io_error) else {
            return;
        };
        if eh == OnIoError::PassOn && !forcedetach {
            error!(minor = self.minor, "Local IO failed. Passing error on...");
            return;
        }
        if core.state.disk > DiskState::Failed {
            let ns = StateChange::new().disk(DiskState::Failed).apply(&core.state);
            self.set_state_locked(&mut core, ns, ChgFlags::HARD, None);
            error!(minor = self.minor, "Local IO failed. Detaching...");
        }
    }

    /// Finish detaching a failed disk: persist what we can, go Diskless and
    /// tell the peer.
    pub(crate) fn io_error(&self, forcedetach: bool) {
        let (eh, failed) = {
            let core = self.core.lock();
            let eh = core
                .disk
                .as_ref()
                .filter(|_| core.state.disk >= DiskState::Failed)
                .map(|d| d.conf.on_io_error)
                .unwrap_or(OnIoError::PassOn);
            (eh, core.state.disk == DiskState::Failed)
        };
        if !forcedetach && eh == OnIoError::PassOn {
            return;
        }
        if !failed {
            return;
        }

        // persist the degraded flags while the disk is still there
        self.mark_md_dirty();
        self.md_sync();

        let (detached, connected) = {
            let mut core = self.core.lock();
            if core.state.disk != DiskState::Failed {
                (false, false)
            } else {
                let ns = StateChange::new().disk(DiskState::Diskless).apply(&core.state);
                let rv = self.set_state_locked(&mut core, ns, ChgFlags::HARD, None);
                (rv.is_success(), core.state.conn >= ConnState::Connected)
            }
        };
        if !detached {
            return;
        }
        if connected {
            if self.send_state() {
                warn!(minor = self.minor, "Notified peer that my disk is broken.");
            } else {
                error!(minor = self.minor, "Sending state in io_error() failed");
            }
        }
        if eh == OnIoError::CallHelper {
            self.call_helper("local-io-error");
        }
    }

    // ----- bitmap I/O -----

    fn md_target(&self) -> Option<(Arc<dyn BlockStore>, MetaLayout, bool)> {
        let core = self.core.lock();
        core.disk
            .as_ref()
            .map(|d| (Arc::clone(&d.dev.meta), d.dev.layout, d.conf.no_md_flush))
    }

    fn bm_io_result(&self, res: Result<(), StorageError>) -> ReplResult<()> {
        match res {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(minor = self.minor, error = %e, "bitmap I/O failed");
                self.chk_io_error(true);
                self.io_error(true);
                Err(e.into())
            }
        }
    }

    /// Write the whole bitmap to the metadata area.
    pub(crate) async fn bm_write(&self, why: &str) -> ReplResult<()> {
        let Some((store, layout, no_md_flush)) = self.md_target() else {
            return Err(ReplError::admin(RetCode::HaveNoDiskConfig, "no local disk"));
        };
        let res = {
            let guard = self.bitmap.lock(why).await;
            guard.write_to(store.as_ref(), layout.bm_sector(), no_md_flush)
        };
        self.bm_io_result(res)
    }

    /// Read the whole bitmap from the metadata area.
    pub(crate) async fn bm_read(&self, why: &str) -> ReplResult<()> {
        let Some((store, layout, _)) = self.md_target() else {
            return Err(ReplError::admin(RetCode::HaveNoDiskConfig, "no local disk"));
        };
        let res = {
            let guard = self.bitmap.lock(why).await;
            guard.read_from(store.as_ref(), layout.bm_sector())
        };
        self.bm_io_result(res)
    }

    /// Mark everything out of sync and write the bitmap, with FullSync set
    /// in the super block until the bitmap is on disk.
    pub(crate) async fn bmio_set_n_write(&self) -> ReplResult<()> {
        if self.state().disk < DiskState::Attaching || self.md_target().is_none() {
            return Err(ReplError::admin(RetCode::HaveNoDiskConfig, "no local disk"));
        }
        self.with_md(|md, _| md.flags.insert(MdFlags::FULL_SYNC));
        self.md_sync();

        let Some((store, layout, no_md_flush)) = self.md_target() else {
            return Err(ReplError::admin(RetCode::HaveNoDiskConfig, "no local disk"));
        };
        let res = {
            let guard = self.bitmap.lock("set_n_write").await;
            guard.bitmap().set_all();
            guard.write_to(store.as_ref(), layout.bm_sector(), no_md_flush)
        };
        self.bm_io_result(res)?;

        self.with_md(|md, _| md.flags.remove(MdFlags::FULL_SYNC));
        self.md_sync();
        Ok(())
    }

    async fn abw_start_sync(self: &Arc<Self>, rv: ReplResult<()>) {
        if rv.is_err() {
            error!(minor = self.minor, "Writing the bitmap failed not starting resync.");
            self.request_state(&StateChange::new().conn(ConnState::Connected), ChgFlags::VERBOSE)
                .await;
            return;
        }
        match self.state().conn {
            ConnState::StartingSyncT => {
                self.request_state(
                    &StateChange::new().conn(ConnState::WFSyncUUID),
                    ChgFlags::VERBOSE,
                )
                .await;
            }
            ConnState::StartingSyncS => self.start_resync(ConnState::SyncSource).await,
            _ => {}
        }
    }

    // ----- sizes -----

    /// Device size from local, peer and user sizes.
    pub(crate) fn new_dev_size(core: &Core) -> u64 {
        let Some(disk) = core.disk.as_ref() else {
            return core.p_size;
        };
        let p_size = core.p_size;
        let la_size = disk.md.la_size_sect;
        let m_size = disk.dev.data.capacity_sectors();
        let u_size = disk.conf.size_sect;

        let mut size = if p_size != 0 && m_size != 0 {
            p_size.min(m_size)
        } else if la_size != 0 {
            let mut s = la_size;
            if m_size != 0 && m_size < s {
                s = m_size;
            }
            if p_size != 0 && p_size < s {
                s = p_size;
            }
            s
        } else if p_size != 0 {
            p_size
        } else {
            m_size
        };

        if size == 0 {
            error!("Both nodes diskless!");
        }
        if u_size != 0 {
            if u_size > size {
                error!(u_size, size, "Requested disk size is too big ({u_size} > {size})");
            } else {
                size = u_size;
            }
        }
        let max = disk.dev.layout.max_bitmap_bits() * blkrepl_storage::BM_SECT_PER_BIT;
        size.min(max)
    }

    /// Recompute the device size and resize the bitmap to match.
    pub(crate) async fn determine_dev_size(&self) -> ReplResult<SizeChange> {
        let (old, new) = {
            let core = self.core.lock();
            (core.capacity, Self::new_dev_size(&core))
        };
        if self.core.lock().disk.is_some() {
            let guard = self.bitmap.lock("size changed").await;
            if let Err(e) = guard.resize(new) {
                error!(minor = self.minor, error = %e, "Could not allocate bitmap!");
                return Err(e.into());
            }
        }
        {
            let mut core = self.core.lock();
            core.capacity = new;
            if let Some(disk) = core.disk.as_mut() {
                if disk.md.la_size_sect != new {
                    disk.md.la_size_sect = new;
                    self.mark_md_dirty();
                }
            }
        }
        if old != new {
            info!(minor = self.minor, "size = {} KB ({new} sectors)", new / 2);
        }
        Ok(match new.cmp(&old) {
            std::cmp::Ordering::Greater => SizeChange::Grew,
            std::cmp::Ordering::Less => SizeChange::Shrunk,
            std::cmp::Ordering::Equal => SizeChange::Unchanged,
        })
    }

    // ----- fencing -----

    /// Ask the "outdate-peer" helper to fence the peer and return what it
    /// says the peer's disk now is.
    pub(crate) async fn try_outdate_peer(&self) -> DiskState {
        let (consistent, fp) = {
            let core = self.core.lock();
            (
                core.disk.is_some() && core.state.disk >= DiskState::Consistent,
                core.fencing(),
            )
        };
        if !consistent {
            warn!(minor = self.minor, "Not outdating peer, I'm not even Consistent myself.");
            return self.state().pdsk;
        }

        if fp == FencingPolicy::ResourceAndStonith {
            self.request_state(&StateChange::new().susp(true), ChgFlags::NONE)
                .await;
        }

        let Some(code) = self.call_helper("outdate-peer") else {
            error!(minor = self.minor, "outdate-peer helper broken, could not run it");
            return DiskState::DUnknown;
        };
        let (nps, what) = match code {
            3 => (DiskState::Inconsistent, "peer is inconsistent or worse"),
            4 => (DiskState::Outdated, "peer is outdated"),
            5 => (DiskState::Outdated, "peer is unreachable, assumed to be dead"),
            6 => {
                warn!(minor = self.minor, "Peer is primary, outdating myself.");
                self.request_state(&StateChange::new().disk(DiskState::Outdated), ChgFlags::NONE)
                    .await;
                (DiskState::DUnknown, "peer is active")
            }
            7 => {
                if fp != FencingPolicy::ResourceAndStonith {
                    error!(minor = self.minor, "outdate-peer() = 7 && fencing != Stonith !!!");
                }
                (DiskState::Outdated, "peer was stonithed")
            }
            other => {
                error!(minor = self.minor, "outdate-peer helper broken, returned {other}");
                return DiskState::DUnknown;
            }
        };
        info!(minor = self.minor, "outdate-peer helper returned {code} ({what})");
        nps
    }

    // ----- side effects -----

    pub(crate) fn drop_peer_uuids(&self) {
        self.core.lock().p_uuid = None;
    }

    pub(crate) fn fail_transfer_log(&self) {
        for (sector, size) in self.tl.clear_all() {
            self.bitmap.set_out_of_sync(sector, size as usize);
        }
    }

    /// Everything a committed change implies that may block.
    pub(crate) async fn after_state_ch(self: &Arc<Self>, os: DeviceState, ns: DeviceState, _flags: ChgFlags) {
        use ConnState::*;
        use DiskState::*;

        if os.conn != Connected && ns.conn == Connected {
            self.flags.crashed_primary.store(false, Ordering::SeqCst);
            if let Some(p) = self.core.lock().p_uuid.as_mut() {
                p.flags &= !UUID_FLAG_CRASHED_PRIMARY;
            }
        }

        let fp = self.core.lock().fencing();

        let degraded = |s: &DeviceState| s.role == Role::Primary && s.disk < UpToDate && s.pdsk < UpToDate;
        if !degraded(&os) && degraded(&ns) {
            self.call_helper("pri-on-incon-degr");
        }

        if fp == FencingPolicy::ResourceAndStonith && ns.susp {
            // the peer is fenced, or it came back
            if (os.pdsk > Outdated && ns.pdsk <= Outdated) || (os.conn < Connected && ns.conn >= Connected) {
                self.fail_transfer_log();
                self.change_state(&StateChange::new().susp(false), ChgFlags::VERBOSE);
            }
        }

        // the peer attached its disk
        if os.pdsk == Diskless && ns.pdsk > Diskless {
            self.send_uuids();
            self.send_state();
        }

        if os.conn != WFBitMapS && ns.conn == WFBitMapS {
            if let Err(e) = self.send_bitmap().await {
                error!(minor = self.minor, error = %e, "send_bitmap (WFBitMapS) failed");
            }
        }

        // lost contact to the peer's copy of the data
        let peer_had_data = |s: &DeviceState| s.pdsk >= Inconsistent && s.pdsk != DUnknown && s.pdsk != Outdated;
        if peer_had_data(&os) && !peer_had_data(&ns) {
            self.drop_peer_uuids();
            let rotate = {
                let core = self.core.lock();
                core.disk.as_ref().is_some_and(|d| {
                    core.state.disk >= Inconsistent
                        && (ns.role == Role::Primary || ns.peer == Role::Primary)
                        && d.md.uuids[BITMAP] == 0
                        && ns.disk >= UpToDate
                })
            };
            if rotate {
                self.with_md(|md, role| uuid::new_current(md, role));
                self.send_uuids();
            }
        }

        if ns.pdsk < Inconsistent && ns.peer == Role::Primary {
            let rotate = {
                let core = self.core.lock();
                core.disk
                    .as_ref()
                    .is_some_and(|d| core.state.disk >= Inconsistent && d.md.uuids[BITMAP] == 0)
            };
            if rotate {
                self.with_md(|md, role| uuid::new_current(md, role));
            }
        }

        // last part of attaching while connected
        if ns.conn >= Connected && os.disk == Attaching && ns.disk == Negotiating {
            self.drop_peer_uuids();
            self.send_sizes();
            self.send_uuids();
            self.send_state();
        }

        // pause or resume of the resync, tell the peer
        if ns.conn >= Connected && (os.aftr_isp != ns.aftr_isp || os.user_isp != ns.user_isp) {
            self.send_state();
        }

        if !os.is_paused() && ns.is_paused() {
            if let Some(reg) = self.registry() {
                reg.suspend_other_sg();
            }
        }

        // isp changes we made while in WFReportParams
        if os.conn == WFReportParams && ns.conn >= Connected {
            self.send_state();
        }

        if (os.conn != StartingSyncT && ns.conn == StartingSyncT)
            || (os.conn != StartingSyncS && ns.conn == StartingSyncS)
        {
            let rv = self.bmio_set_n_write().await;
            self.abw_start_sync(rv).await;
        }

        // invalidating ourselves while disconnected
        if os.conn < Connected && ns.conn < Connected && os.disk > Inconsistent && ns.disk == Inconsistent {
            if let Err(e) = self.bmio_set_n_write().await {
                error!(minor = self.minor, error = %e, "set_n_write from invalidate failed");
            }
        }

        if os.disk > Diskless && ns.disk == Diskless {
            let released = self.core.lock().disk.take();
            if released.is_some() {
                self.core.lock().ed_uuid = 0;
                info!(minor = self.minor, "local disk released");
            }
        }

        // the disks grew while detached
        if ns.disk > Negotiating
            && ns.pdsk > Negotiating
            && self.flags.resync_after_neg.swap(false, Ordering::SeqCst)
            && ns.conn == Connected
        {
            self.resync_after_online_grow().await;
        }

        // a resync finished or was aborted, or a pause flag was cleared
        if (os.conn > Connected && ns.conn <= Connected)
            || (os.peer_isp && !ns.peer_isp)
            || (os.user_isp && !ns.user_isp)
        {
            if let Some(reg) = self.registry() {
                reg.resume_next_sg();
            }
        }

        if os.conn == Connected && ns.conn == VerifyS {
            self.start_verify_source();
        }
        if os.conn == Connected && ns.conn == VerifyT {
            self.start_verify_target();
        }

        if os.is_paused() != ns.is_paused() && (ns.conn.is_resync() || os.conn.is_resync()) {
            let mut core = self.core.lock();
            if ns.is_paused() {
                core.rs.pause();
            } else {
                core.rs.resume();
            }
        }
        if !ns.is_paused() {
            self.kick_resync();
        }

        // nobody else finishes the disconnect
        if ns.conn == Disconnecting && !self.flags.receiver_active.load(Ordering::SeqCst) {
            let mut core = self.core.lock();
            if core.state.conn == Disconnecting {
                let ns = StateChange::new().conn(StandAlone).apply(&core.state);
                self.set_state_locked(&mut core, ns, ChgFlags::HARD.verbose(), None);
                core.net = None;
            }
        }

        self.md_sync();
    }

    // ----- data path -----

    fn integrity_digest(&self, data: &[u8]) -> Bytes {
        let wanted = {
            let core = self.core.lock();
            core.agreed_pro_version >= crate::handshake::PRO_VERSION_INTEGRITY
                && core
                    .net
                    .as_ref()
                    .is_some_and(|n| n.integrity_alg.as_deref().is_some_and(|a| !a.is_empty()))
        };
        if wanted {
            Bytes::copy_from_slice(&Sha256::digest(data))
        } else {
            Bytes::new()
        }
    }

    pub(crate) fn verify_integrity(&self, data: &[u8], digest: &[u8]) -> bool {
        digest.is_empty() || Sha256::digest(data).as_slice() == digest
    }

    async fn wait_not_suspended(&self) -> DeviceState {
        self.wait_state(|s| !s.susp).await
    }

    fn check_request(&self, sector: u64, len: usize) -> ReplResult<()> {
        if len == 0 || len % SECTOR_SIZE != 0 {
            return Err(StorageError::BadLength {
                expected: len.next_multiple_of(SECTOR_SIZE).max(SECTOR_SIZE),
                actual: len,
            }
            .into());
        }
        let end = sector + (len / SECTOR_SIZE) as u64;
        let capacity = self.capacity_sectors();
        if end > capacity {
            return Err(StorageError::OutOfRange {
                index: end,
                limit: capacity,
            }
            .into());
        }
        Ok(())
    }

    /// Write `data` at `sector` on a Primary.
    ///
    /// The write goes to the local disk and, when the peer has a disk, to
    /// the peer. With protocol B or C the call waits for the peer's
    /// acknowledgement. Ranges that did not reach the peer are marked out
    /// of sync.
    pub async fn submit_write(&self, sector: u64, data: Bytes) -> ReplResult<WriteOutcome> {
        self.check_request(sector, data.len())?;
        let s = self.wait_not_suspended().await;
        if s.role != Role::Primary {
            return Err(ReplError::admin(RetCode::StateNotAllowed, "device is not Primary"));
        }

        let (store, protocol, max_epoch) = {
            let core = self.core.lock();
            (
                core.disk
                    .as_ref()
                    .filter(|_| core.state.disk >= DiskState::Inconsistent)
                    .map(|d| Arc::clone(&d.dev.data)),
                core.net.as_ref().map(|n| n.protocol).unwrap_or_default(),
                core.net.as_ref().map(|n| n.max_epoch_size).unwrap_or(0),
            )
        };
        let remote = s.conn >= ConnState::Connected && s.pdsk >= DiskState::Inconsistent;
        if store.is_none() && !remote {
            error!(minor = self.minor, sector, "IO ERROR: neither local nor remote disk");
            return Err(StorageError::DeviceError {
                sector,
                reason: "neither local nor remote disk".to_string(),
            }
            .into());
        }

        let mut epoch = None;
        let pending = if remote {
            let id = self.next_block_id();
            let (nr, rx) = self.tl.append_request(id, sector, data.len() as u32);
            epoch = Some(nr);
            let seq_num = self.seq_num.fetch_add(1, Ordering::SeqCst) + 1;
            let packet = Packet::Data(DataPacket {
                sector,
                block_id: id,
                seq_num,
                dp_flags: DP_RW_SYNC,
                digest: self.integrity_digest(&data),
                data: data.clone(),
            });
            if self.send_packet(&packet) {
                let close_epoch = {
                    let mut core = self.core.lock();
                    core.writes_in_epoch += 1;
                    max_epoch != 0 && core.writes_in_epoch >= max_epoch
                };
                if close_epoch {
                    self.issue_barrier();
                }
                Some(rx)
            } else {
                self.tl.ack_request(id, PeerAck::Failed);
                None
            }
        } else {
            None
        };

        let mut local_err = None;
        if let Some(store) = store.as_ref() {
            if let Err(e) = store.write_at(sector, &data, WriteFlags::default()) {
                error!(minor = self.minor, sector, error = %e, "local write failed");
                self.chk_io_error(false);
                self.io_error(false);
                local_err = Some(e);
            }
        }
        // a completed write of the newest epoch closes it
        if epoch.is_some_and(|nr| nr == self.tl.current_barrier()) {
            self.issue_barrier();
        }

        let outcome = match pending {
            Some(_) if protocol == WireProtocol::A => WriteOutcome::Replicated,
            Some(rx) => rx.await.unwrap_or(WriteOutcome::LocalOnly),
            None => WriteOutcome::LocalOnly,
        };
        if outcome == WriteOutcome::LocalOnly {
            if let Some(e) = local_err {
                return Err(e.into());
            }
            self.bitmap.set_out_of_sync(sector, data.len());
        }
        Ok(outcome)
    }

    /// Close the current epoch towards the peer.
    ///
    /// Returns the barrier number sent, `None` when no write was sent since
    /// the last barrier.
    pub fn issue_barrier(&self) -> Option<u32> {
        self.core.lock().writes_in_epoch = 0;
        let nr = self.tl.add_barrier()?;
        if !self.send_packet(&Packet::Barrier(nr)) {
            warn!(minor = self.minor, barrier = nr, "could not send barrier");
        }
        Some(nr)
    }

    fn range_in_sync(&self, sector: u64, len: usize) -> bool {
        let first = blkrepl_storage::sector_to_bit(sector);
        let last = blkrepl_storage::sector_to_bit(sector + (len / SECTOR_SIZE) as u64 - 1);
        self.bitmap.count_bits(first, last) == 0
    }

    /// Read `len` bytes at `sector`, from the local disk when it holds good
    /// data for the range, otherwise from the peer.
    pub async fn submit_read(&self, sector: u64, len: usize) -> ReplResult<Bytes> {
        self.check_request(sector, len)?;
        let s = self.wait_not_suspended().await;
        let store = {
            let core = self.core.lock();
            core.disk.as_ref().map(|d| Arc::clone(&d.dev.data))
        };
        let local_ok = s.disk == DiskState::UpToDate
            || (s.disk >= DiskState::Inconsistent && self.range_in_sync(sector, len));

        if let (true, Some(store)) = (local_ok, store) {
            let mut buf = vec![0u8; len];
            match store.read_at(sector, &mut buf) {
                Ok(()) => return Ok(Bytes::from(buf)),
                Err(e) => {
                    error!(minor = self.minor, sector, error = %e, "local read failed");
                    self.chk_io_error(false);
                    self.io_error(false);
                    if !(s.conn >= ConnState::Connected && s.pdsk == DiskState::UpToDate) {
                        return Err(e.into());
                    }
                }
            }
        }

        let s = self.state();
        if s.conn < ConnState::Connected || s.pdsk < DiskState::UpToDate {
            return Err(StorageError::DeviceError {
                sector,
                reason: "no good copy of the data reachable".to_string(),
            }
            .into());
        }
        let id = self.next_block_id();
        let (tx, rx) = oneshot::channel();
        self.pending_reads.lock().insert(id, tx);
        let sent = self.send_packet(&Packet::DataRequest(BlockRequest {
            sector,
            block_id: id,
            blksize: len as u32,
        }));
        if !sent {
            self.pending_reads.lock().remove(&id);
            return Err(ReplError::ConnectionLost);
        }
        match rx.await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(StorageError::DeviceError {
                sector,
                reason: "peer failed the read".to_string(),
            }
            .into()),
            Err(_) => Err(ReplError::ConnectionLost),
        }
    }

    /// Fail reads waiting for the peer.
    pub(crate) fn fail_pending_reads(&self) {
        let pending: Vec<_> = self.pending_reads.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(None);
        }
    }

    /// Carry out side effects of an epoch event on the receive path.
    pub(crate) fn handle_epoch_update(&self, update: EpochUpdate) {
        for (barrier, set_size) in update.acks {
            if !self.send_packet(&Packet::BarrierAck { barrier, set_size }) {
                debug!(minor = self.minor, barrier, "could not send BarrierAck");
            }
        }
        if let Some(id) = update.schedule_flush {
            self.queue_work(Work::EpochFlush(id));
        }
    }

    fn run_epoch_flush(&self, id: EpochId) {
        let target = {
            let core = self.core.lock();
            core.disk
                .as_ref()
                .map(|d| (Arc::clone(&d.dev.data), d.conf.clone(), core.state.conn >= ConnState::Connected))
        };
        let Some((store, conf, connected)) = target else {
            return;
        };
        let update = self.epochs.run_scheduled_flush(id, store.as_ref(), &conf, connected);
        self.handle_epoch_update(update);
    }

    /// Reset what belongs to one connection.
    pub(crate) fn reset_connection_counters(&self) {
        self.seq_num.store(0, Ordering::SeqCst);
        self.peer_seq.store(0, Ordering::SeqCst);
        self.rs_pending.store(0, Ordering::SeqCst);
        self.core.lock().writes_in_epoch = 0;
    }
}

#[cfg(test)]
mod tests {
    use blkrepl_storage::MemStore;

    use super::*;
    use crate::helper::{NoopHelper, ScriptedHelper};

    fn device_with(helper: Arc<dyn Helper>) -> Arc<Device> {
        Device::new(1, "r1", helper)
    }

    fn attach_mem(dev: &Device, conf: DiskConfig) -> Arc<MemStore> {
        let data = Arc::new(MemStore::new(4096));
        let meta = Arc::new(MemStore::new(1024));
        let layout = MetaLayout::external(1024);
        let mut core = dev.core.lock();
        core.disk = Some(LocalDisk {
            dev: BackingDev {
                data: data.clone(),
                meta: meta.clone(),
                layout,
            },
            md: MetaData::fresh(&layout, 7),
            conf,
        });
        core.capacity = 4096;
        data
    }

    #[test]
    fn test_md_flags_for_states() {
        let ns = DeviceState {
            role: Role::Primary,
            conn: ConnState::Connected,
            disk: DiskState::UpToDate,
            pdsk: DiskState::Outdated,
            ..DeviceState::default()
        };
        let f = Core::md_flags_for(MdFlags(MdFlags::FULL_SYNC), &ns, false);
        assert!(f.contains(MdFlags::FULL_SYNC));
        assert!(f.contains(MdFlags::PRIMARY_IND));
        assert!(f.contains(MdFlags::CONNECTED_IND));
        assert!(f.contains(MdFlags::CONSISTENT));
        assert!(f.contains(MdFlags::WAS_UP_TO_DATE));
        assert!(f.contains(MdFlags::PEER_OUT_DATED));

        let idle = Core::md_flags_for(f, &DeviceState::default(), false);
        assert_eq!(idle, MdFlags(MdFlags::FULL_SYNC));
        let crashed = Core::md_flags_for(MdFlags::default(), &DeviceState::default(), true);
        assert!(crashed.contains(MdFlags::PRIMARY_IND));
    }

    #[test]
    fn test_resync_progress_pause() {
        let mut rs = ResyncProgress::default();
        rs.start(10);
        rs.pause();
        rs.resume();
        assert_eq!(rs.total, 10);
        assert!(rs.started.is_some());
    }

    #[tokio::test]
    async fn test_new_dev_size_rules() {
        let dev = device_with(Arc::new(NoopHelper));
        attach_mem(&dev, DiskConfig::default());
        {
            let mut core = dev.core.lock();
            assert_eq!(Device::new_dev_size(&core), 4096);
            core.p_size = 2048;
            assert_eq!(Device::new_dev_size(&core), 2048);
            core.p_size = 0;
            if let Some(d) = core.disk.as_mut() {
                d.md.la_size_sect = 1000;
                d.conf.size_sect = 512;
            }
            assert_eq!(Device::new_dev_size(&core), 512);
        }
        assert_eq!(dev.determine_dev_size().await.unwrap(), SizeChange::Shrunk);
        assert_eq!(dev.capacity_sectors(), 512);
        assert_eq!(dev.bitmap().bits(), 64);
    }

    #[tokio::test]
    async fn test_md_sync_writes_only_when_dirty() {
        let dev = device_with(Arc::new(NoopHelper));
        attach_mem(&dev, DiskConfig::default());
        let meta = dev.core.lock().disk.as_ref().map(|d| Arc::clone(&d.dev.meta)).unwrap();
        dev.md_sync();
        assert_eq!(meta.stats().writes, 0);
        dev.with_md(|md, _| md.flags.insert(MdFlags::CONSISTENT));
        dev.md_sync();
        assert_eq!(meta.stats().writes, 1);
        let md = blkrepl_storage::read_meta(meta.as_ref(), &MetaLayout::external(1024)).unwrap();
        assert!(md.flags.contains(MdFlags::CONSISTENT));
        assert_eq!(md.la_size_sect, 4096);
    }

    #[tokio::test]
    async fn test_io_error_detach_policy() {
        let dev = device_with(Arc::new(NoopHelper));
        attach_mem(
            &dev,
            DiskConfig {
                on_io_error: OnIoError::Detach,
                ..DiskConfig::default()
            },
        );
        dev.force_state(&StateChange::new().disk(DiskState::UpToDate));
        dev.chk_io_error(false);
        assert_eq!(dev.state().disk, DiskState::Failed);
        dev.io_error(false);
        assert_eq!(dev.state().disk, DiskState::Diskless);
        dev.wait_state(|s| s.disk == DiskState::Diskless).await;
    }

    #[tokio::test]
    async fn test_io_error_pass_on_keeps_disk() {
        let dev = device_with(Arc::new(NoopHelper));
        attach_mem(&dev, DiskConfig::default());
        dev.force_state(&StateChange::new().disk(DiskState::UpToDate));
        dev.chk_io_error(false);
        dev.io_error(false);
        assert_eq!(dev.state().disk, DiskState::UpToDate);
        dev.chk_io_error(true);
        assert_eq!(dev.state().disk, DiskState::Failed);
    }

    #[tokio::test]
    async fn test_io_error_helper_called() {
        let helper = Arc::new(ScriptedHelper::new());
        let dev = device_with(helper.clone());
        attach_mem(
            &dev,
            DiskConfig {
                on_io_error: OnIoError::CallHelper,
                ..DiskConfig::default()
            },
        );
        dev.force_state(&StateChange::new().disk(DiskState::UpToDate));
        dev.chk_io_error(false);
        dev.io_error(false);
        assert!(helper.calls().contains(&"local-io-error".to_string()));
    }

    #[tokio::test]
    async fn test_outdate_peer_exit_codes() {
        for (code, expect) in [
            (3, DiskState::Inconsistent),
            (4, DiskState::Outdated),
            (5, DiskState::Outdated),
            (7, DiskState::Outdated),
            (1, DiskState::DUnknown),
        ] {
            let helper = Arc::new(ScriptedHelper::new().with_code("outdate-peer", code));
            let dev = device_with(helper);
            attach_mem(&dev, DiskConfig::default());
            dev.force_state(&StateChange::new().disk(DiskState::UpToDate));
            assert_eq!(dev.try_outdate_peer().await, expect, "exit code {code}");
        }
    }

    #[tokio::test]
    async fn test_outdate_peer_code_6_outdates_us() {
        let helper = Arc::new(ScriptedHelper::new().with_code("outdate-peer", 6));
        let dev = device_with(helper);
        attach_mem(&dev, DiskConfig::default());
        dev.force_state(&StateChange::new().disk(DiskState::UpToDate));
        assert_eq!(dev.try_outdate_peer().await, DiskState::DUnknown);
        assert_eq!(dev.state().disk, DiskState::Outdated);
    }

    #[tokio::test]
    async fn test_outdate_peer_needs_consistent_disk() {
        let helper = Arc::new(ScriptedHelper::new().with_code("outdate-peer", 4));
        let dev = device_with(helper.clone());
        attach_mem(&dev, DiskConfig::default());
        dev.force_state(&StateChange::new().disk(DiskState::Inconsistent));
        assert_eq!(dev.try_outdate_peer().await, DiskState::DUnknown);
        assert!(helper.calls().is_empty());
    }

    #[tokio::test]
    async fn test_standalone_write_marks_out_of_sync() {
        let dev = device_with(Arc::new(NoopHelper));
        let data = attach_mem(&dev, DiskConfig::default());
        dev.force_state(&StateChange::new().disk(DiskState::UpToDate).role(Role::Primary));
        {
            let guard = dev.bitmap.lock("test").await;
            guard.resize(4096).unwrap();
            guard.bitmap().clear_all();
        }
        let out = dev.submit_write(16, Bytes::from(vec![0xab; 4096])).await.unwrap();
        assert_eq!(out, WriteOutcome::LocalOnly);
        assert_eq!(dev.bitmap().total_weight(), 1);
        assert_eq!(&data.contents()[16 * 512..16 * 512 + 4], &[0xab; 4]);

        let back = dev.submit_read(16, 4096).await.unwrap();
        assert_eq!(back[0], 0xab);
    }

    #[tokio::test]
    async fn test_write_on_secondary_refused() {
        let dev = device_with(Arc::new(NoopHelper));
        attach_mem(&dev, DiskConfig::default());
        dev.force_state(&StateChange::new().disk(DiskState::UpToDate));
        let err = dev.submit_write(0, Bytes::from(vec![0; 512])).await.unwrap_err();
        assert_eq!(err.code(), RetCode::StateNotAllowed as i32);
    }

    #[tokio::test]
    async fn test_write_bad_length() {
        let dev = device_with(Arc::new(NoopHelper));
        attach_mem(&dev, DiskConfig::default());
        assert!(dev.submit_write(0, Bytes::from(vec![0; 100])).await.is_err());
        assert!(dev.submit_write(4095, Bytes::from(vec![0; 1024])).await.is_err());
    }

    #[tokio::test]
    async fn test_set_n_write_sets_every_bit() {
        let dev = device_with(Arc::new(NoopHelper));
        attach_mem(&dev, DiskConfig::default());
        dev.force_state(&StateChange::new().disk(DiskState::Inconsistent));
        dev.determine_dev_size().await.unwrap();
        dev.bitmap().clear_all();
        dev.bmio_set_n_write().await.unwrap();
        assert_eq!(dev.bitmap().total_weight(), dev.bitmap().bits());
        assert!(!dev.md_flags().unwrap().contains(MdFlags::FULL_SYNC));
    }

    #[test]
    #[should_panic]
    fn test_new_needs_a_runtime() {
        let _ = Device::new(0, "r0", Arc::new(NoopHelper));
    }

    #[tokio::test]
    async fn test_issue_barrier_without_writes() {
        let dev = device_with(Arc::new(NoopHelper));
        assert_eq!(dev.issue_barrier(), None);
    }
}
