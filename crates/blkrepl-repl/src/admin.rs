//! Administrative operations on a device.
//!
//! Each operation either succeeds or fails with a [`ReplError`] whose
//! [`ReplError::code`] is the stable result returned to callers: a negative
//! [`SetStateCode`] for refused state changes, a [`RetCode`] otherwise.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use blkrepl_storage::{bits_for_capacity, read_meta, write_meta, MdFlags, MetaData, StorageError, WriteFlags, SECTOR_SIZE};
use tracing::{error, info, warn};

use crate::config::{DeviceConfig, DiskConfig, FencingPolicy, NetConfig, SyncConfig};
use crate::device::{BackingDev, Device, LocalDisk};
use crate::error::{ReplError, ReplResult, RetCode};
use crate::state::{ConnState, DiskState, Role, SetStateCode, StateChange};
use crate::state_machine::ChgFlags;
use crate::uuid::{self, BITMAP, CURRENT, UUID_JUST_CREATED};

const SET_ROLE_TRIES: usize = 4;

/// Write fresh metadata for `backing`: a "just created" identity and an
/// empty bitmap.
pub fn create_md(backing: &BackingDev, device_uuid: u64) -> ReplResult<MetaData> {
    let layout = backing.layout;
    let mut md = MetaData::fresh(&layout, device_uuid);
    md.uuids[CURRENT] = UUID_JUST_CREATED;

    let words = bits_for_capacity(backing.data.capacity_sectors()).div_ceil(64) as usize;
    let len = (words * 8).next_multiple_of(SECTOR_SIZE).max(SECTOR_SIZE);
    backing
        .meta
        .write_at(layout.bm_sector(), &vec![0u8; len], WriteFlags::default())
        .map_err(|e| StorageError::MetadataIo {
            msg: format!("clearing bitmap: {e}"),
        })?;
    write_meta(backing.meta.as_ref(), &layout, &md, false)?;
    info!(device_uuid = %format!("{device_uuid:016X}"), "new meta data initialized");
    Ok(md)
}

fn refused(rv: SetStateCode) -> ReplResult<()> {
    if rv.is_success() {
        Ok(())
    } else {
        Err(ReplError::StateRefused { code: rv })
    }
}

impl Device {
    // ----- role -----

    /// Become Primary or Secondary.
    ///
    /// With `force`, a Primary is allowed on Inconsistent or Outdated data;
    /// the data is then declared UpToDate. Asking for the current role is
    /// not an error.
    pub async fn set_role(&self, new_role: Role, force: bool) -> ReplResult<()> {
        let mut change = StateChange::new().role(new_role);
        let mut forced = false;
        let mut rv = SetStateCode::UnknownError;
        let mut tries = 0;

        while tries < SET_ROLE_TRIES {
            tries += 1;
            rv = self.request_state(&change, ChgFlags::NONE.wait_complete()).await;
            let s = self.state();

            // we first outdated the peer, then the connection came back
            if rv == SetStateCode::CwFailedByPeer && change.pdsk.is_some() {
                change.pdsk = None;
                continue;
            }
            if rv == SetStateCode::NoUpToDateDisk
                && force
                && matches!(s.disk, DiskState::Inconsistent | DiskState::Outdated)
            {
                change.disk = Some(DiskState::UpToDate);
                forced = true;
                continue;
            }
            if rv == SetStateCode::NoUpToDateDisk && s.disk == DiskState::Consistent && change.pdsk.is_none() {
                let nps = self.try_outdate_peer().await;
                if nps == DiskState::Outdated || nps == DiskState::Inconsistent {
                    change.disk = Some(DiskState::UpToDate);
                }
                change.pdsk = Some(nps);
                continue;
            }
            if rv == SetStateCode::NothingToDo {
                info!(minor = self.minor(), "already {}", new_role.name());
                return Ok(());
            }
            if rv == SetStateCode::PrimaryNop && change.pdsk.is_none() {
                let mut nps = self.try_outdate_peer().await;
                if force && nps > DiskState::Outdated {
                    warn!(minor = self.minor(), "Forced into split brain situation!");
                    nps = DiskState::Outdated;
                }
                change.pdsk = Some(nps);
                continue;
            }
            if rv == SetStateCode::TwoPrimaries {
                // the peer may be detected as dead soon, retry once more
                let timeout = self.net_config().map(|n| n.timeout_ms).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(timeout / 10 + 100)).await;
                tries = tries.max(SET_ROLE_TRIES - 1);
                continue;
            }
            if !rv.is_success() {
                rv = self
                    .request_state(&change, ChgFlags::VERBOSE.wait_complete())
                    .await;
            }
            break;
        }
        refused(rv)?;

        if forced {
            warn!(minor = self.minor(), "Forced to consider local data as UpToDate!");
        }

        let s = self.state();
        if new_role == Role::Secondary {
            self.with_md(|md, _| md.uuids[CURRENT] &= !1);
        } else {
            if let Some(net) = self.core.lock().net.as_mut() {
                net.want_lose = false;
            }
            self.with_md(|md, role| {
                if ((s.conn < ConnState::Connected || s.pdsk <= DiskState::Failed) && md.uuids[BITMAP] == 0)
                    || forced
                {
                    uuid::new_current(md, role);
                }
                md.uuids[CURRENT] |= 1;
            });
        }

        if s.conn >= ConnState::WFReportParams {
            if forced {
                self.send_uuids();
            }
            self.send_state();
        }
        self.md_sync();
        Ok(())
    }

    // ----- disk -----

    /// Attach a backing device.
    ///
    /// Reads and checks the metadata, sizes and loads the bitmap and derives
    /// the disk state from the metadata flags. While connected the disk goes
    /// through Negotiating and the handshake decides its final state. Any
    /// failure leaves the device Diskless.
    pub async fn attach_disk(self: &Arc<Self>, backing: BackingDev, conf: DiskConfig) -> ReplResult<()> {
        conf.validate()?;
        if self.state().disk > DiskState::Diskless {
            return Err(ReplError::admin(RetCode::HaveDiskConfig, "a disk is already attached"));
        }
        let data_size = backing.data.capacity_sectors();
        if conf.size_sect > data_size {
            return Err(ReplError::admin(
                RetCode::DeviceTooSmall,
                format!("requested size {} exceeds the backing device ({data_size})", conf.size_sect),
            ));
        }

        let rv = self.change_state(&StateChange::new().disk(DiskState::Attaching), ChgFlags::VERBOSE);
        refused(rv)?;

        match self.attach_inner(backing, conf).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(minor = self.minor(), error = %e, "attach failed");
                self.force_state(&StateChange::new().disk(DiskState::Diskless));
                Err(e)
            }
        }
    }

    async fn attach_inner(self: &Arc<Self>, backing: BackingDev, conf: DiskConfig) -> ReplResult<()> {
        let md = read_meta(backing.meta.as_ref(), &backing.layout)?;
        let flags = md.flags;

        {
            let mut core = self.core.lock();
            core.disk = Some(LocalDisk {
                dev: backing,
                md,
                conf: conf.clone(),
            });
            let new_size = Device::new_dev_size(&core);
            let la_size = core.disk.as_ref().map(|d| d.md.la_size_sect).unwrap_or(0);
            if flags.contains(MdFlags::CONSISTENT) && new_size < la_size {
                warn!(minor = self.minor(), "refusing to truncate a consistent device");
                core.disk = None;
                return Err(ReplError::admin(
                    RetCode::DeviceTooSmall,
                    format!("device would shrink from {la_size} to {new_size} sectors"),
                ));
            }
        }

        let s = self.state();
        let crashed = flags.contains(MdFlags::PRIMARY_IND) && !(s.role == Role::Primary && s.susp);
        self.flags.crashed_primary.store(crashed, Ordering::SeqCst);
        self.flags.use_degr_wfc_t.store(
            flags.contains(MdFlags::PRIMARY_IND) && !flags.contains(MdFlags::CONNECTED_IND),
            Ordering::SeqCst,
        );

        self.determine_dev_size().await?;
        self.epochs.reset_write_ordering(&conf);
        self.bitmap.clear_md_io_error();

        if flags.contains(MdFlags::FULL_SYNC) {
            info!(minor = self.minor(), "Assuming that all blocks are out of sync (aka FullSync)");
            self.bmio_set_n_write().await?;
        } else {
            self.bm_read("read from attaching").await?;
        }

        let (rv, ns) = {
            let mut core = self.core.lock();
            let os = core.state;
            let mut ns = os;
            ns.disk = if !flags.contains(MdFlags::CONSISTENT) {
                DiskState::Inconsistent
            } else if flags.contains(MdFlags::WAS_UP_TO_DATE) {
                DiskState::Consistent
            } else {
                DiskState::Outdated
            };
            if flags.contains(MdFlags::PEER_OUT_DATED) && ns.pdsk == DiskState::DUnknown {
                ns.pdsk = DiskState::Outdated;
            }
            if ns.disk == DiskState::Consistent
                && (ns.pdsk == DiskState::Outdated || conf.fencing == FencingPolicy::DontCare)
            {
                ns.disk = DiskState::UpToDate;
            }
            // decided after the handshake
            if os.conn == ConnState::Connected {
                core.new_state_tmp = ns;
                ns = os;
                ns.disk = DiskState::Negotiating;
            }
            let rv = self.set_state_locked(&mut core, ns, ChgFlags::VERBOSE, None);
            (rv, core.state)
        };
        refused(rv)?;

        let primary = ns.role == Role::Primary;
        self.with_md(|md, _| {
            if primary {
                md.uuids[CURRENT] |= 1;
            } else {
                md.uuids[CURRENT] &= !1;
            }
        });
        self.md_sync();
        info!(
            minor = self.minor(),
            "attached disk, {} KB, {} out-of-sync bits",
            self.capacity_sectors() / 2,
            self.bitmap.total_weight()
        );
        Ok(())
    }

    /// Detach the backing device.
    pub async fn detach_disk(&self) -> ReplResult<()> {
        let rv = self
            .request_state(
                &StateChange::new().disk(DiskState::Diskless),
                ChgFlags::VERBOSE.wait_complete(),
            )
            .await;
        refused(rv)
    }

    /// Recompute the size with `size_sect` as the user size (0 for the
    /// largest possible) and tell the peer.
    pub async fn resize(&self, size_sect: u64) -> ReplResult<()> {
        let s = self.state();
        if s.conn > ConnState::Connected {
            return Err(ReplError::admin(RetCode::NoResizeDuringResync, "resync is running"));
        }
        if s.conn >= ConnState::Connected && s.role == Role::Secondary && s.peer == Role::Secondary {
            return Err(ReplError::admin(RetCode::StateNotAllowed, "resize needs a Primary"));
        }
        {
            let mut core = self.core.lock();
            let Some(disk) = core.disk.as_mut() else {
                return Err(ReplError::admin(RetCode::HaveNoDiskConfig, "no local disk"));
            };
            if size_sect > disk.dev.data.capacity_sectors() {
                return Err(ReplError::admin(RetCode::DeviceTooSmall, "backing device too small"));
            }
            disk.conf.size_sect = size_sect;
        }
        let change = self.determine_dev_size().await?;
        self.md_sync();

        if self.state().conn == ConnState::Connected && change != crate::device::SizeChange::Unchanged {
            if change == crate::device::SizeChange::Grew {
                self.flags.resize_pending.store(true, Ordering::SeqCst);
            }
            self.send_uuids();
            self.send_sizes();
        }
        Ok(())
    }

    // ----- network -----

    /// Configure the peer link and start waiting for a connection.
    pub fn configure_network(&self, net: NetConfig) -> ReplResult<()> {
        net.validate()?;
        let s = self.state();
        if s.conn != ConnState::StandAlone {
            return Err(ReplError::admin(RetCode::HaveNetConfig, "network already configured"));
        }
        if net.want_lose && s.role == Role::Primary {
            return Err(ReplError::admin(RetCode::DiscardNotAllowed, "a Primary can not discard its data"));
        }
        self.core.lock().net = Some(net);
        let rv = self.change_state(&StateChange::new().conn(ConnState::Unconnected), ChgFlags::VERBOSE);
        if !rv.is_success() {
            self.core.lock().net = None;
            return refused(rv);
        }
        let rv = self.change_state(&StateChange::new().conn(ConnState::WFConnection), ChgFlags::VERBOSE);
        refused(rv)
    }

    /// Drop the connection and the network configuration.
    pub async fn disconnect(&self) -> ReplResult<()> {
        let flags = ChgFlags::VERBOSE;
        let mut rv = self
            .request_state(&StateChange::new().conn(ConnState::Disconnecting), ChgFlags::NONE)
            .await;
        match rv {
            SetStateCode::NothingToDo | SetStateCode::AlreadyStandAlone => return Ok(()),
            SetStateCode::PrimaryNop => {
                // the checks want to see the peer outdated
                rv = self
                    .request_state(
                        &StateChange::new()
                            .conn(ConnState::Disconnecting)
                            .pdsk(DiskState::Outdated),
                        flags,
                    )
                    .await;
            }
            SetStateCode::CwFailedByPeer => {
                // the peer probably wants to see us outdated
                rv = self
                    .request_state(
                        &StateChange::new()
                            .conn(ConnState::Disconnecting)
                            .disk(DiskState::Outdated),
                        flags,
                    )
                    .await;
                if rv == SetStateCode::IsDiskLess || rv == SetStateCode::LowerThanOutdated {
                    self.force_state(&StateChange::new().conn(ConnState::Disconnecting));
                    rv = SetStateCode::Success;
                }
            }
            _ => {}
        }
        refused(rv)?;
        self.wait_state(|s| s.conn != ConnState::Disconnecting).await;
        Ok(())
    }

    // ----- resync -----

    /// Apply new resync options.
    pub fn configure_sync(&self, sync: SyncConfig) -> ReplResult<()> {
        sync.validate()?;
        if sync.after == Some(self.minor()) {
            return Err(ReplError::admin(RetCode::SyncAfterCycle, "a device can not sync after itself"));
        }
        let reg = self.registry();
        if let Some(reg) = reg.as_ref() {
            reg.check_sync_config(self.minor(), &sync)?;
        }
        self.core.lock().sync = sync;
        if self.state().conn >= ConnState::Connected {
            self.send_sync_param();
        }
        if let Some(reg) = reg {
            reg.alter_sync_after();
        }
        Ok(())
    }

    /// Throw away local data and fetch everything from the peer. Without a
    /// connection the disk is only marked Inconsistent.
    pub async fn invalidate_local(&self) -> ReplResult<()> {
        if self.state().conn < ConnState::Connected {
            let rv = self.change_state(&StateChange::new().disk(DiskState::Inconsistent), ChgFlags::VERBOSE);
            return refused(rv);
        }
        let change = StateChange::new().conn(ConnState::StartingSyncT);
        let mut rv = self.request_state(&change, ChgFlags::NONE).await;
        if !rv.is_success() {
            rv = self.request_state(&change, ChgFlags::VERBOSE).await;
        }
        // lost the connection in between
        if rv == SetStateCode::NeedConnection || rv == SetStateCode::NothingToDo {
            rv = self.change_state(&StateChange::new().disk(DiskState::Inconsistent), ChgFlags::VERBOSE);
        }
        refused(rv)
    }

    /// Overwrite the peer's data with ours.
    pub async fn invalidate_peer(&self) -> ReplResult<()> {
        if self.state().conn < ConnState::Connected {
            return Err(ReplError::StateRefused {
                code: SetStateCode::NeedConnection,
            });
        }
        let rv = self
            .request_state(&StateChange::new().conn(ConnState::StartingSyncS), ChgFlags::VERBOSE)
            .await;
        refused(rv)
    }

    /// Pause the resync.
    pub async fn pause_sync(&self) -> ReplResult<()> {
        match self
            .request_state(&StateChange::new().user_isp(true), ChgFlags::VERBOSE)
            .await
        {
            SetStateCode::NothingToDo => Err(ReplError::admin(RetCode::PauseFlagAlreadySet, "resync already paused")),
            rv => refused(rv),
        }
    }

    /// Resume a paused resync.
    pub async fn resume_sync(&self) -> ReplResult<()> {
        match self
            .request_state(&StateChange::new().user_isp(false), ChgFlags::VERBOSE)
            .await
        {
            SetStateCode::NothingToDo => Err(ReplError::admin(RetCode::PauseFlagAlreadyClear, "resync not paused")),
            rv => refused(rv),
        }
    }

    /// Start online verify as the VerifyS node.
    pub async fn start_verify(&self) -> ReplResult<()> {
        if self.state().conn.is_verify() {
            return Err(ReplError::admin(RetCode::VerifyIsRunning, "online verify is running"));
        }
        let rv = self
            .request_state(&StateChange::new().conn(ConnState::VerifyS), ChgFlags::VERBOSE)
            .await;
        refused(rv)
    }

    // ----- I/O -----

    /// Block new application I/O.
    pub async fn suspend_io(&self) -> ReplResult<()> {
        let rv = self
            .request_state(&StateChange::new().susp(true), ChgFlags::VERBOSE)
            .await;
        refused(rv)
    }

    /// Let application I/O continue.
    pub async fn resume_io(&self) -> ReplResult<()> {
        let rv = self
            .request_state(&StateChange::new().susp(false), ChgFlags::VERBOSE)
            .await;
        refused(rv)
    }

    /// Mark our data Outdated.
    pub async fn outdate(&self) -> ReplResult<()> {
        let rv = self
            .request_state(&StateChange::new().disk(DiskState::Outdated), ChgFlags::VERBOSE)
            .await;
        refused(rv)
    }

    // ----- queries -----

    /// Current configuration.
    pub fn config(&self) -> DeviceConfig {
        let core = self.core.lock();
        DeviceConfig {
            minor: self.minor(),
            name: self.name().to_string(),
            disk: core.disk.as_ref().map(|d| d.conf.clone()),
            net: core.net.clone(),
            sync: core.sync.clone(),
        }
    }
}
