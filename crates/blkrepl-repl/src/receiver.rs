//! Connection handling.
//!
//! [`Device::connect`] runs the handshake on a fresh [`Conduit`] and then
//! starts two tasks. The receiver works through the data channel: reports,
//! bitmaps, replicated writes, barriers and requests. The asender works
//! through the meta channel: acknowledgements, pings and state change
//! replies. Whatever ends the connection, the receiver runs the cleanup.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use blkrepl_storage::{StorageError, WriteFlags, SECTOR_SIZE};
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::auth::authenticate;
use crate::conduit::Conduit;
use crate::config::{NetConfig, WireProtocol};
use crate::device::Device;
use crate::error::{ReplError, ReplResult, RetCode};
use crate::handshake::{
    check_protocol, negotiate_version, sync_handshake, HandshakeInput, ProtocolParams,
    PRO_VERSION_MAX, PRO_VERSION_MIN,
};
use crate::protocol::{
    AckKind, BlockAck, BlockReply, BlockRequest, Channel, DataPacket, Packet, BM_PACKET_WORDS,
    ID_SYNCER,
};
use crate::split_brain::{AfterSbPolicy, RecoveryHooks};
use crate::state::{ConnState, DeviceState, DiskState, Role, SetStateCode, StateChange};
use crate::state_machine::ChgFlags;
use crate::transfer_log::PeerAck;
use crate::uuid::{
    PeerUuids, CURRENT, UUID_FLAG_CRASHED_PRIMARY, UUID_FLAG_INCONSISTENT, UUID_FLAG_WANT_LOSE,
};
use blkrepl_storage::MdFlags;

/// Lets the split-brain policies demote us or run helpers.
struct DeviceHooks<'a> {
    dev: &'a Device,
}

impl RecoveryHooks for DeviceHooks<'_> {
    fn give_up_primary(&mut self) -> bool {
        self.dev
            .change_state(&StateChange::new().role(Role::Secondary), ChgFlags::VERBOSE)
            .is_success()
    }

    fn call_helper(&mut self, name: &str) {
        self.dev.call_helper(name);
    }
}

/// How the receiver loop ended.
enum LoopEnd {
    /// Local request to stop.
    Stopped,
    /// The link failed.
    Lost,
    /// The peer violated the protocol.
    Protocol,
    /// We refused the peer and are Disconnecting; do not reconnect.
    Refused,
}

fn policy(v: u32) -> ReplResult<AfterSbPolicy> {
    AfterSbPolicy::from_u32(v).ok_or_else(|| ReplError::protocol(format!("unknown after-sb policy {v}")))
}

impl Device {
    // ----- reports -----

    /// Send our state.
    pub(crate) fn send_state(&self) -> bool {
        let s = self.state();
        self.send_packet(&Packet::ReportState(s.pack()))
    }

    /// Send our UUIDs, bitmap weight and flags.
    pub(crate) fn send_uuids(&self) -> bool {
        let report = {
            let core = self.core.lock();
            let Some(disk) = core.disk.as_ref().filter(|_| core.state.disk >= DiskState::Negotiating) else {
                return false;
            };
            let mut flags = 0;
            if core.net.as_ref().is_some_and(|n| n.want_lose) {
                flags |= UUID_FLAG_WANT_LOSE;
            }
            if self.flags.crashed_primary.load(Ordering::SeqCst) {
                flags |= UUID_FLAG_CRASHED_PRIMARY;
            }
            if core.new_state_tmp.disk == DiskState::Inconsistent {
                flags |= UUID_FLAG_INCONSISTENT;
            }
            PeerUuids {
                uuids: disk.md.uuids,
                bitmap_weight: self.bitmap.total_weight(),
                flags,
            }
        };
        self.send_packet(&Packet::ReportUuids(report.to_wire()))
    }

    /// Send our backing, user and current sizes.
    pub(crate) fn send_sizes(&self) -> bool {
        let packet = {
            let core = self.core.lock();
            let (d_size, u_size) = core
                .disk
                .as_ref()
                .map(|d| (d.dev.data.capacity_sectors(), d.conf.size_sect))
                .unwrap_or((0, 0));
            let max_segment_size = core
                .disk
                .as_ref()
                .map(|d| d.conf.max_bio_bvecs.max(1) * blkrepl_storage::BM_BLOCK_SIZE as u32)
                .unwrap_or(blkrepl_storage::BM_BLOCK_SIZE as u32);
            Packet::ReportSizes {
                d_size,
                u_size,
                c_size: core.capacity,
                max_segment_size,
                queue_order_type: self.epochs.write_ordering() as u32,
            }
        };
        self.send_packet(&packet)
    }

    fn send_protocol(&self, net: &NetConfig) -> bool {
        let p = ProtocolParams::from_config(net);
        self.send_packet(&Packet::ReportProtocol {
            protocol: p.protocol as u32,
            after_sb_0p: p.after_sb_0p as u32,
            after_sb_1p: p.after_sb_1p as u32,
            after_sb_2p: p.after_sb_2p as u32,
            want_lose: p.want_lose,
            two_primaries: p.two_primaries,
            integrity_alg: p.integrity_alg,
        })
    }

    /// Send the resync rate and digest algorithms.
    pub(crate) fn send_sync_param(&self) -> bool {
        let sync = self.sync_config();
        self.send_packet(&Packet::SyncParam {
            rate: sync.rate_kbps,
            verify_alg: sync.verify_alg.unwrap_or_default(),
            csums_alg: sync.csums_alg.unwrap_or_default(),
        })
    }

    /// Send our whole bitmap, chunk by chunk, under the coarse lock.
    pub(crate) async fn send_bitmap(&self) -> ReplResult<()> {
        if self.md_flags().is_some_and(|f| f.contains(MdFlags::FULL_SYNC)) {
            info!(minor = self.minor(), "Writing the whole bitmap, MDF_FullSync was set.");
            self.bmio_set_n_write().await?;
        }

        let guard = self.bitmap.lock("send_bitmap").await;
        let words = self.bitmap.words();
        let mut offset = 0;
        while offset < words {
            let count = BM_PACKET_WORDS.min(words - offset);
            let chunk = self.bitmap.chunk(offset, count)?;
            if !self.send_packet(&Packet::ReportBitMap {
                offset: offset as u64,
                words: chunk,
            }) {
                return Err(ReplError::ConnectionLost);
            }
            offset += count;
        }
        // an empty chunk past the end terminates the transfer
        if !self.send_packet(&Packet::ReportBitMap {
            offset: words as u64,
            words: Vec::new(),
        }) {
            return Err(ReplError::ConnectionLost);
        }
        debug!(minor = self.minor(), words, "bitmap sent");
        drop(guard);
        Ok(())
    }

    fn send_ack(&self, kind: AckKind, sector: u64, block_id: u64, blksize: u32, seq_num: u32) -> bool {
        self.send_packet(&Packet::Ack(
            kind,
            BlockAck {
                sector,
                block_id,
                blksize,
                seq_num,
            },
        ))
    }

    // ----- connecting -----

    /// Establish a connection over one end of `link`.
    ///
    /// The device must be waiting for a connection. Runs the marker,
    /// version and optional authentication exchanges, reports our
    /// parameters and starts the receiver and asender tasks. On failure
    /// the link is shut down; authentication and version failures also
    /// drop the network configuration.
    pub async fn connect(self: &Arc<Self>, link: Conduit) -> ReplResult<()> {
        let net = {
            let core = self.core.lock();
            if core.state.conn != ConnState::WFConnection {
                return Err(ReplError::admin(
                    RetCode::StateNotAllowed,
                    format!("not waiting for a connection ({})", core.state.conn.name()),
                ));
            }
            core.net.clone()
        };
        let Some(net) = net else {
            return Err(ReplError::admin(RetCode::StateNotAllowed, "no network configuration"));
        };

        let link = Arc::new(link);
        let timeout = Duration::from_millis(net.timeout_ms.max(1) * 10);
        let handshake = tokio::time::timeout(timeout, self.connect_handshake(&link, &net)).await;
        let agreed = match handshake {
            Ok(Ok(agreed)) => agreed,
            Ok(Err(e)) => {
                link.shutdown();
                if matches!(e, ReplError::Auth { .. } | ReplError::IncompatibleVersion { .. }) {
                    warn!(minor = self.minor(), "Discarding network configuration.");
                    self.go_standalone();
                }
                return Err(e);
            }
            Err(_) => {
                link.shutdown();
                return Err(ReplError::Timeout {
                    what: "connection handshake".to_string(),
                });
            }
        };

        self.core.lock().agreed_pro_version = agreed;
        self.reset_connection_counters();
        self.flags.stop_link.store(false, Ordering::SeqCst);
        self.set_link(Arc::clone(&link));

        let rv = self.change_state(&StateChange::new().conn(ConnState::WFReportParams), ChgFlags::VERBOSE);
        if !rv.is_success() {
            self.take_link();
            link.shutdown();
            return Err(ReplError::StateRefused { code: rv });
        }
        info!(minor = self.minor(), peer = link.name(), "Connection established");

        self.flags.receiver_active.store(true, Ordering::SeqCst);
        let asender = tokio::spawn(Arc::clone(self).run_asender(Arc::clone(&link), net.clone()));
        self.tasks.lock().push(asender);
        tokio::spawn(Arc::clone(self).run_receiver(link));

        self.send_protocol(&net);
        self.send_sync_param();
        self.send_sizes();
        self.send_uuids();
        self.send_state();
        Ok(())
    }

    async fn connect_handshake(&self, link: &Conduit, net: &NetConfig) -> ReplResult<u32> {
        link.send(&Packet::HandShakeS)?;
        link.send(&Packet::HandShakeM)?;
        match link.recv(Channel::Data).await? {
            Packet::HandShakeS => {}
            other => {
                return Err(ReplError::protocol(format!(
                    "expected HandShakeS packet, received: {:#x}",
                    other.command()
                )))
            }
        }
        match link.recv(Channel::Meta).await? {
            Packet::HandShakeM => {}
            other => {
                return Err(ReplError::protocol(format!(
                    "expected HandShakeM packet, received: {:#x}",
                    other.command()
                )))
            }
        }

        link.send(&Packet::HandShake {
            protocol_min: PRO_VERSION_MIN,
            protocol_max: PRO_VERSION_MAX,
        })?;
        let agreed = match link.recv(Channel::Data).await? {
            Packet::HandShake {
                protocol_min,
                protocol_max,
            } => negotiate_version(protocol_min, protocol_max)?,
            other => {
                return Err(ReplError::protocol(format!(
                    "expected HandShake packet, received: {:#x}",
                    other.command()
                )))
            }
        };

        if net.wants_auth() {
            let alg = net.cram_hmac_alg.as_deref().unwrap_or("sha256");
            authenticate(link, &net.shared_secret, alg).await?;
        }
        Ok(agreed)
    }

    // ----- receiver -----

    async fn run_receiver(self: Arc<Self>, link: Arc<Conduit>) {
        let end = loop {
            let stop = self.link_stop.notified();
            if self.flags.stop_link.load(Ordering::SeqCst) {
                break LoopEnd::Stopped;
            }
            let packet = tokio::select! {
                p = link.recv(Channel::Data) => p,
                _ = stop => continue,
            };
            let packet = match packet {
                Ok(p) => p,
                Err(ReplError::Disconnected { msg }) => {
                    if !self.flags.stop_link.load(Ordering::SeqCst) {
                        warn!(minor = self.minor(), "{msg}");
                    }
                    break LoopEnd::Lost;
                }
                Err(e) => {
                    error!(minor = self.minor(), error = %e, "error receiving packet");
                    break LoopEnd::Protocol;
                }
            };
            match self.dispatch_data(packet).await {
                Ok(()) => {}
                Err(e) if self.state().conn == ConnState::Disconnecting => {
                    error!(minor = self.minor(), error = %e, "connection refused");
                    break LoopEnd::Refused;
                }
                Err(ReplError::Disconnected { .. }) | Err(ReplError::ConnectionLost) => break LoopEnd::Lost,
                Err(e) => {
                    error!(minor = self.minor(), error = %e, "error receiving packet");
                    break LoopEnd::Protocol;
                }
            }
        };

        match end {
            LoopEnd::Stopped => {}
            LoopEnd::Lost => {
                self.force_state(&StateChange::new().conn(ConnState::BrokenPipe));
            }
            LoopEnd::Protocol => {
                self.force_state(&StateChange::new().conn(ConnState::ProtocolError));
            }
            LoopEnd::Refused => {}
        }
        link.shutdown();
        self.disconnect_cleanup().await;
    }

    async fn dispatch_data(self: &Arc<Self>, packet: Packet) -> ReplResult<()> {
        match packet {
            Packet::ReportProtocol {
                protocol,
                after_sb_0p,
                after_sb_1p,
                after_sb_2p,
                want_lose,
                two_primaries,
                integrity_alg,
            } => {
                let params = ProtocolParams {
                    protocol: WireProtocol::from_u32(protocol)
                        .ok_or_else(|| ReplError::protocol(format!("unknown wire protocol {protocol}")))?,
                    after_sb_0p: policy(after_sb_0p)?,
                    after_sb_1p: policy(after_sb_1p)?,
                    after_sb_2p: policy(after_sb_2p)?,
                    want_lose,
                    two_primaries,
                    integrity_alg,
                };
                let (net, agreed) = {
                    let core = self.core.lock();
                    (core.net.clone(), core.agreed_pro_version)
                };
                let net = net.ok_or(ReplError::ConnectionLost)?;
                if let Err(e) = check_protocol(&net, &params, agreed) {
                    self.force_state(&StateChange::new().conn(ConnState::Disconnecting));
                    return Err(e);
                }
                Ok(())
            }
            Packet::SyncParam {
                rate,
                verify_alg,
                csums_alg,
            } => {
                let mut core = self.core.lock();
                core.sync.rate_kbps = rate;
                core.sync.verify_alg = Some(verify_alg).filter(|a| !a.is_empty());
                core.sync.csums_alg = Some(csums_alg).filter(|a| !a.is_empty());
                Ok(())
            }
            Packet::ReportSizes {
                d_size,
                u_size,
                c_size,
                ..
            } => self.receive_sizes(d_size, u_size, c_size).await,
            Packet::ReportUuids(wire) => self.receive_uuids(PeerUuids::from_wire(&wire)),
            Packet::ReportState(packed) => self.receive_state(packed).await,
            Packet::ReportSyncUuid(val) => self.receive_sync_uuid(val).await,
            Packet::StateChgRequest { mask, val } => self.receive_req_state(mask, val),
            Packet::ReportBitMap { offset, words } => self.receive_bitmap(offset, words).await,
            Packet::Data(p) => self.receive_data(p),
            Packet::Barrier(nr) => {
                self.receive_barrier(nr);
                Ok(())
            }
            Packet::DataRequest(req) => {
                self.answer_data_request(req);
                Ok(())
            }
            Packet::DataReply(reply) => {
                if let Some(tx) = self.pending_reads.lock().remove(&reply.block_id) {
                    let _ = tx.send(Some(reply.data));
                }
                Ok(())
            }
            Packet::RSDataRequest(req) => {
                self.answer_rs_request(req);
                Ok(())
            }
            Packet::CsumRSRequest { req, digest } => {
                self.answer_csum_request(req, &digest);
                Ok(())
            }
            Packet::RSDataReply(reply) => {
                self.receive_rs_reply(reply).await;
                Ok(())
            }
            Packet::OVRequest(req) => {
                self.answer_ov_request(req);
                Ok(())
            }
            Packet::OVReply { req, digest } => {
                self.receive_ov_reply(req, &digest).await;
                Ok(())
            }
            Packet::UnplugRemote => Ok(()),
            Packet::Ignored(cmd) => {
                debug!(minor = self.minor(), cmd, "ignoring optional packet");
                Ok(())
            }
            other => Err(ReplError::protocol(format!(
                "unexpected packet on data channel: {:#x}",
                other.command()
            ))),
        }
    }

    async fn receive_sizes(self: &Arc<Self>, d_size: u64, u_size: u64, c_size: u64) -> ReplResult<()> {
        let (conn, has_disk) = {
            let mut core = self.core.lock();
            core.p_size = d_size;
            core.p_usize = u_size;
            (core.state.conn, core.disk.is_some())
        };

        if !has_disk {
            // no local disk, the peer decides the size
            self.core.lock().capacity = d_size;
            return Ok(());
        }

        if conn == ConnState::WFReportParams {
            let refuse = {
                let mut core = self.core.lock();
                let disk_state = core.state.disk;
                let capacity = core.capacity;
                let Some(disk) = core.disk.as_mut() else {
                    return Ok(());
                };
                let own = disk.conf.size_sect;
                let agreed = match (own, u_size) {
                    (0, p) => p,
                    (o, 0) => o,
                    (o, p) => o.min(p),
                };
                if agreed != own {
                    info!(minor = self.minor(), "Peer sets u_size to {agreed} sectors (old: {own})");
                    disk.conf.size_sect = agreed;
                }
                let usable = disk_state >= DiskState::Outdated && capacity > 0;
                let new = Device::new_dev_size(&core);
                usable && new < capacity
            };
            if refuse {
                error!(minor = self.minor(), "The peer's disk size is too small!");
                self.force_state(&StateChange::new().conn(ConnState::Disconnecting));
                return Err(ReplError::protocol("peer's disk size is too small"));
            }
        }

        let change = self.determine_dev_size().await?;
        self.md_sync();

        let s = self.state();
        if s.conn > ConnState::WFReportParams {
            if c_size != self.capacity_sectors() || change != crate::device::SizeChange::Unchanged {
                self.send_sizes();
            }
            // we resized locally and this is the peer's answer
            let resized = self.flags.resize_pending.swap(false, Ordering::SeqCst);
            if (resized || change == crate::device::SizeChange::Grew) && s.conn == ConnState::Connected {
                if s.pdsk >= DiskState::Inconsistent && s.disk >= DiskState::Inconsistent {
                    self.resync_after_online_grow().await;
                } else {
                    self.flags.resync_after_neg.store(true, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    fn receive_uuids(&self, peer: PeerUuids) -> ReplResult<()> {
        let mut core = self.core.lock();
        core.p_uuid = Some(peer);
        let s = core.state;
        if s.conn < ConnState::Connected
            && s.disk < DiskState::Inconsistent
            && s.role == Role::Primary
            && (core.ed_uuid & !1) != (peer.uuids[CURRENT] & !1)
        {
            error!(
                minor = self.minor(),
                "Can only connect to data with current UUID={:016X}", core.ed_uuid
            );
            let ns = StateChange::new().conn(ConnState::Disconnecting).apply(&s);
            self.set_state_locked(&mut core, ns, ChgFlags::HARD, None);
            return Err(ReplError::admin(
                RetCode::DataOfWrongCurrent,
                "peer's data belongs to another generation",
            ));
        }
        if s.conn >= ConnState::Connected && s.disk < DiskState::Inconsistent {
            core.ed_uuid = peer.uuids[CURRENT];
        }
        Ok(())
    }

    async fn receive_state(self: &Arc<Self>, packed: u32) -> ReplResult<()> {
        let ps = DeviceState::unpack(packed)?;
        let p_uuid = self.peer_uuids();

        let mut real_peer_disk = ps.disk;
        if ps.disk == DiskState::Negotiating {
            let inconsistent = p_uuid.is_some_and(|p| p.flags & UUID_FLAG_INCONSISTENT != 0);
            real_peer_disk = if inconsistent {
                DiskState::Inconsistent
            } else {
                DiskState::Consistent
            };
            info!(minor = self.minor(), "real peer disk state = {}", real_peer_disk.name());
        }

        let os = self.state();
        let mut nconn = os.conn;
        if nconn == ConnState::WFReportParams {
            nconn = ConnState::Connected;
        }
        let mut peer_disk_override = None;

        let local_disk = self.core.lock().disk.is_some() && os.disk >= DiskState::Negotiating;
        if p_uuid.is_some() && ps.disk >= DiskState::Negotiating && local_disk {
            let consider = os.conn < ConnState::Connected
                || (os.conn == ConnState::Connected
                    && (ps.disk == DiskState::Negotiating || os.disk == DiskState::Negotiating))
                || self.flags.consider_resync.load(Ordering::SeqCst)
                || (os.conn == ConnState::Connected
                    && ps.conn >= ConnState::StartingSyncS
                    && ps.conn <= ConnState::WFBitMapT);

            if consider {
                match self.run_sync_handshake(&os, ps.role, real_peer_disk).await {
                    Ok(conn) => nconn = conn,
                    Err(e) => {
                        nconn = ConnState::Connected;
                        if self.state().disk == DiskState::Negotiating {
                            self.force_state(&StateChange::new().disk(DiskState::Diskless));
                        } else if ps.disk == DiskState::Negotiating {
                            error!(minor = self.minor(), "Disk attach process on the peer node was aborted.");
                            peer_disk_override = Some(DiskState::Diskless);
                        } else {
                            self.force_state(&StateChange::new().conn(ConnState::Disconnecting));
                            return Err(e);
                        }
                    }
                }
            }
        }
        let real_peer_disk = peer_disk_override.unwrap_or(real_peer_disk);

        let rv = {
            let mut core = self.core.lock();
            self.flags.consider_resync.store(false, Ordering::SeqCst);
            let mut ns = core.state;
            ns.conn = nconn;
            ns.peer = ps.role;
            ns.pdsk = real_peer_disk;
            ns.peer_isp = ps.aftr_isp | ps.user_isp;
            if (nconn == ConnState::Connected || nconn == ConnState::WFBitMapS)
                && ns.disk == DiskState::Negotiating
            {
                ns.disk = core.new_state_tmp.disk;
            }
            self.set_state_locked(&mut core, ns, ChgFlags::HARD.verbose(), None)
        };
        if !rv.is_success() {
            self.force_state(&StateChange::new().conn(ConnState::Disconnecting));
            return Err(ReplError::StateRefused { code: rv });
        }

        if os.conn > ConnState::WFReportParams
            && nconn > ConnState::Connected
            && ps.conn <= ConnState::Connected
            && ps.disk != DiskState::Negotiating
        {
            self.send_uuids();
            self.send_state();
        }

        if let Some(net) = self.core.lock().net.as_mut() {
            net.want_lose = false;
        }
        self.md_sync();
        Ok(())
    }

    async fn run_sync_handshake(
        self: &Arc<Self>,
        os: &DeviceState,
        peer_role: Role,
        peer_disk: DiskState,
    ) -> ReplResult<ConnState> {
        let (own_uuids, effective_disk, net, peer) = {
            let core = self.core.lock();
            let own = core.disk.as_ref().map(|d| d.md.uuids).unwrap_or_default();
            let eff = if os.disk == DiskState::Negotiating {
                core.new_state_tmp.disk
            } else {
                os.disk
            };
            (own, eff, core.net.clone(), core.p_uuid)
        };
        let net = net.ok_or(ReplError::ConnectionLost)?;
        let peer = peer.ok_or_else(|| ReplError::protocol("no peer UUIDs before ReportState"))?;

        let input = HandshakeInput {
            own_uuids,
            peer,
            role: os.role,
            disk: os.disk,
            effective_disk,
            peer_role,
            peer_disk,
            crashed_primary: self.flags.crashed_primary.load(Ordering::SeqCst),
            discard_concurrent: self.flags.discard_concurrent.load(Ordering::SeqCst),
            own_weight: self.bitmap.total_weight(),
            net: &net,
        };
        let outcome = {
            let mut hooks = DeviceHooks { dev: self };
            sync_handshake(&input, &mut hooks)?
        };
        if outcome.full_sync {
            self.bmio_set_n_write().await.map_err(|e| ReplError::SplitBrain {
                msg: format!("writing the bitmap failed: {e}"),
            })?;
        }
        Ok(outcome.conn)
    }

    fn receive_req_state(&self, mask: u32, val: u32) -> ReplResult<()> {
        if self.flags.discard_concurrent.load(Ordering::SeqCst)
            && self.flags.cluster_st_change.load(Ordering::SeqCst)
        {
            self.send_packet(&Packet::StateChgReply(SetStateCode::ConcurrentStChg as i32));
            return Ok(());
        }
        let change = StateChange::from_wire(mask, val)?.convert_from_peer();
        let rv = self.change_state(&change, ChgFlags::VERBOSE);
        self.send_packet(&Packet::StateChgReply(rv as i32));
        self.md_sync();
        Ok(())
    }

    async fn receive_sync_uuid(self: &Arc<Self>, val: u64) -> ReplResult<()> {
        let s = self
            .wait_state(|s| s.conn == ConnState::WFSyncUUID || s.conn < ConnState::Connected)
            .await;
        if s.conn < ConnState::Connected {
            return Ok(());
        }
        let updated = self.with_md(|md, role| {
            crate::uuid::set_raw(md, CURRENT, val, role);
            crate::uuid::set_raw(md, crate::uuid::BITMAP, 0, role);
        });
        if updated.is_none() {
            error!(minor = self.minor(), "Ignoring SyncUUID packet!");
            return Ok(());
        }
        self.start_resync(ConnState::SyncTarget).await;
        Ok(())
    }

    async fn receive_bitmap(self: &Arc<Self>, offset: u64, words: Vec<u64>) -> ReplResult<()> {
        let offset = offset as usize;
        if !words.is_empty() {
            let guard = self.bitmap.lock("receive bitmap").await;
            guard.bitmap().merge_from_peer(offset, &words)?;
            return Ok(());
        }
        if offset != self.bitmap.words() {
            return Err(ReplError::protocol(format!(
                "bitmap transfer ended at word {offset}, expected {}",
                self.bitmap.words()
            )));
        }

        match self.state().conn {
            ConnState::WFBitMapT => {
                self.send_bitmap().await?;
                let rv = self.change_state(&StateChange::new().conn(ConnState::WFSyncUUID), ChgFlags::VERBOSE);
                if !rv.is_success() {
                    error!(minor = self.minor(), "could not enter WFSyncUUID: {}", rv.message());
                }
            }
            ConnState::WFBitMapS => self.start_resync(ConnState::SyncSource).await,
            other => {
                warn!(minor = self.minor(), "unexpected cstate ({}) in receive_bitmap", other.name());
            }
        }
        Ok(())
    }

    fn local_target(&self) -> Option<(Arc<dyn blkrepl_storage::BlockStore>, crate::config::DiskConfig)> {
        let core = self.core.lock();
        core.disk
            .as_ref()
            .filter(|_| core.state.disk >= DiskState::Inconsistent)
            .map(|d| (Arc::clone(&d.dev.data), d.conf.clone()))
    }

    fn receive_data(&self, p: DataPacket) -> ReplResult<()> {
        if !self.verify_integrity(&p.data, &p.digest) {
            error!(minor = self.minor(), sector = p.sector, "Digest integrity check FAILED.");
            return Err(ReplError::protocol("data digest mismatch"));
        }
        self.peer_seq.fetch_max(p.seq_num, Ordering::SeqCst);
        let protocol = self.net_config().map(|n| n.protocol).unwrap_or_default();
        let size = p.data.len() as u32;

        let Some((store, conf)) = self.local_target() else {
            error!(minor = self.minor(), sector = p.sector, "Can not write mirrored data block to local disk.");
            let added = self.epochs.note_write_added();
            self.send_ack(AckKind::NegAck, p.sector, p.block_id, size, p.seq_num);
            let update = self.epochs.note_write_completed(added.epoch, false);
            self.handle_epoch_update(update);
            return Ok(());
        };

        if protocol == WireProtocol::B {
            self.send_ack(AckKind::RecvAck, p.sector, p.block_id, size, p.seq_num);
        }

        let added = self.epochs.note_write_added();
        let mut was_barrier = added.barrier;
        let mut res = store.write_at(p.sector, &p.data, WriteFlags { barrier: was_barrier });
        if was_barrier && matches!(res, Err(StorageError::Unsupported { .. })) {
            self.epochs.note_barrier_unsupported(added.epoch, &conf);
            was_barrier = false;
            res = store.write_at(p.sector, &p.data, WriteFlags::default());
        }

        match res {
            Ok(()) => {
                if protocol == WireProtocol::C {
                    let s = self.state();
                    if s.conn.is_resync() {
                        // the block is now identical on both nodes
                        self.bitmap.set_in_sync(p.sector, p.data.len());
                        self.send_ack(AckKind::RSWriteAck, p.sector, p.block_id, size, p.seq_num);
                    } else {
                        self.send_ack(AckKind::WriteAck, p.sector, p.block_id, size, p.seq_num);
                    }
                }
            }
            Err(e) => {
                error!(minor = self.minor(), sector = p.sector, error = %e, "mirrored write failed");
                self.bitmap.set_out_of_sync(p.sector, p.data.len());
                self.chk_io_error(false);
                self.io_error(false);
                if protocol != WireProtocol::A {
                    self.send_ack(AckKind::NegAck, p.sector, p.block_id, size, p.seq_num);
                }
            }
        }

        let update = self.epochs.note_write_completed(added.epoch, was_barrier);
        self.handle_epoch_update(update);
        Ok(())
    }

    fn receive_barrier(&self, nr: u32) {
        match self.local_target() {
            Some((store, conf)) => {
                let update = self.epochs.begin_epoch_on_barrier(nr, store.as_ref(), &conf);
                self.handle_epoch_update(update);
            }
            None => {
                let cur = self.epochs.current();
                let mut update = self.epochs.note_barrier_marker_seen(nr);
                let flushed = self.epochs.note_flush_completed(cur);
                update.acks.extend(flushed.acks);
                self.handle_epoch_update(update);
            }
        }
    }

    /// Read a whole block from the local disk if it holds good data.
    pub(crate) fn read_local(&self, sector: u64, len: u32, min: DiskState) -> Option<Bytes> {
        let store = {
            let core = self.core.lock();
            core.disk
                .as_ref()
                .filter(|_| core.state.disk >= min)
                .map(|d| Arc::clone(&d.dev.data))
        }?;
        let mut buf = vec![0u8; len as usize];
        match store.read_at(sector, &mut buf) {
            Ok(()) => Some(Bytes::from(buf)),
            Err(e) => {
                error!(minor = self.minor(), sector, error = %e, "local read failed");
                self.chk_io_error(false);
                self.io_error(false);
                None
            }
        }
    }

    fn answer_data_request(&self, req: BlockRequest) {
        if req.blksize as usize % SECTOR_SIZE != 0 || req.blksize == 0 {
            self.send_ack(AckKind::NegDReply, req.sector, req.block_id, req.blksize, 0);
            return;
        }
        match self.read_local(req.sector, req.blksize, DiskState::UpToDate) {
            Some(data) => {
                self.send_packet(&Packet::DataReply(BlockReply {
                    sector: req.sector,
                    block_id: req.block_id,
                    data,
                }));
            }
            None => {
                self.send_ack(AckKind::NegDReply, req.sector, req.block_id, req.blksize, 0);
            }
        }
    }

    // ----- asender -----

    async fn run_asender(self: Arc<Self>, link: Arc<Conduit>, net: NetConfig) {
        let ping_int = Duration::from_millis(net.ping_int_ms);
        let ping_timeout = Duration::from_millis(net.timeout_ms.max(1));
        let mut ping_outstanding: Option<tokio::time::Instant> = None;
        let mut ticker = tokio::time::interval(if ping_int.is_zero() {
            Duration::from_secs(3600)
        } else {
            ping_int
        });
        ticker.tick().await;

        loop {
            let packet = tokio::select! {
                p = link.recv(Channel::Meta) => p,
                _ = ticker.tick() => {
                    if let Some(sent) = ping_outstanding {
                        if sent.elapsed() > ping_timeout {
                            error!(minor = self.minor(), "PingAck did not arrive in time.");
                            self.force_state(&StateChange::new().conn(ConnState::NetworkFailure));
                            break;
                        }
                    } else if !ping_int.is_zero() && self.send_packet(&Packet::Ping) {
                        ping_outstanding = Some(tokio::time::Instant::now());
                    }
                    continue;
                }
            };
            let packet = match packet {
                Ok(p) => p,
                Err(_) => break,
            };
            let res = match packet {
                Packet::Ping => {
                    self.send_packet(&Packet::PingAck);
                    Ok(())
                }
                Packet::PingAck => {
                    ping_outstanding = None;
                    Ok(())
                }
                Packet::StateChgReply(code) => {
                    self.got_state_change_reply(code);
                    Ok(())
                }
                Packet::BarrierAck { barrier, set_size } => self.tl.release_barrier(barrier, set_size),
                Packet::Ack(kind, ack) => {
                    self.got_block_ack(kind, ack).await;
                    Ok(())
                }
                Packet::Ignored(_) => Ok(()),
                other => Err(ReplError::protocol(format!(
                    "unexpected packet on meta channel: {:#x}",
                    other.command()
                ))),
            };
            if let Err(e) = res {
                error!(minor = self.minor(), error = %e, "meta channel protocol error");
                self.force_state(&StateChange::new().conn(ConnState::ProtocolError));
                break;
            }
        }
        // the receiver notices and cleans up
        link.shutdown();
        debug!(minor = self.minor(), "asender terminated");
    }

    async fn got_block_ack(self: &Arc<Self>, kind: AckKind, ack: BlockAck) {
        let syncer = ack.block_id == ID_SYNCER;
        match kind {
            AckKind::RecvAck => {
                self.tl.ack_request(ack.block_id, PeerAck::Received);
            }
            AckKind::WriteAck | AckKind::DiscardAck => {
                self.tl.ack_request(ack.block_id, PeerAck::Written);
            }
            AckKind::RSWriteAck if syncer => self.got_rs_write_ack(ack).await,
            AckKind::RSWriteAck => {
                self.tl.ack_request(ack.block_id, PeerAck::Written);
                self.bitmap.set_in_sync(ack.sector, ack.blksize as usize);
            }
            AckKind::NegAck if syncer => {
                warn!(minor = self.minor(), sector = ack.sector, "resync write failed on peer");
                self.core.lock().rs.failed += 1;
                self.check_source_done();
            }
            AckKind::NegAck => {
                if let Some((sector, size)) = self.tl.ack_request(ack.block_id, PeerAck::Failed) {
                    self.bitmap.set_out_of_sync(sector, size as usize);
                }
            }
            AckKind::NegDReply => {
                error!(minor = self.minor(), sector = ack.sector, "Got NegDReply");
                if let Some(tx) = self.pending_reads.lock().remove(&ack.block_id) {
                    let _ = tx.send(None);
                }
            }
            AckKind::NegRSDReply => self.got_neg_rs_reply(ack),
            AckKind::RSIsInSync => self.got_is_in_sync(ack),
            AckKind::OVResult => self.got_ov_result(ack).await,
        }
    }

    // ----- teardown -----

    /// Wake the receiver so it tears the connection down.
    pub(crate) fn stop_receiver(&self) {
        self.flags.stop_link.store(true, Ordering::SeqCst);
        self.link_stop.notify_one();
    }

    /// Forget the network configuration and go StandAlone.
    pub(crate) fn go_standalone(&self) {
        let mut core = self.core.lock();
        let ns = StateChange::new().conn(ConnState::StandAlone).apply(&core.state);
        self.set_state_locked(&mut core, ns, ChgFlags::HARD.verbose(), None);
        core.net = None;
    }

    async fn disconnect_cleanup(self: &Arc<Self>) {
        let os = self.state();
        if os.conn == ConnState::StandAlone {
            self.flags.receiver_active.store(false, Ordering::SeqCst);
            return;
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for t in tasks {
            t.abort();
        }
        self.take_link();
        self.fail_pending_reads();
        self.resync_kick.notify_one();

        self.fail_transfer_log();
        let dropped = self.epochs.cleanup();
        if dropped > 0 {
            info!(minor = self.minor(), "{dropped} epochs dropped with the connection");
        }
        self.drop_peer_uuids();
        self.reset_connection_counters();

        let (fp, role, pdsk) = {
            let core = self.core.lock();
            (core.fencing(), core.state.role, core.state.pdsk)
        };
        if role == Role::Primary
            && fp >= crate::config::FencingPolicy::ResourceOnly
            && pdsk >= DiskState::DUnknown
        {
            let nps = self.try_outdate_peer().await;
            self.request_state(&StateChange::new().pdsk(nps), ChgFlags::VERBOSE).await;
        }

        let os = self.state();
        if os.conn >= ConnState::Unconnected {
            self.change_state(&StateChange::new().conn(ConnState::Unconnected), ChgFlags::VERBOSE);
        }
        info!(minor = self.minor(), "Connection closed");

        self.flags.receiver_active.store(false, Ordering::SeqCst);
        {
            let mut core = self.core.lock();
            match core.state.conn {
                ConnState::Disconnecting => {
                    let ns = StateChange::new().conn(ConnState::StandAlone).apply(&core.state);
                    self.set_state_locked(&mut core, ns, ChgFlags::HARD.verbose(), None);
                    core.net = None;
                }
                ConnState::Unconnected => {
                    let ns = StateChange::new().conn(ConnState::WFConnection).apply(&core.state);
                    self.set_state_locked(&mut core, ns, ChgFlags::VERBOSE, None);
                }
                _ => {}
            }
        }
        self.md_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::NoopHelper;

    fn device(minor: u32) -> Arc<Device> {
        Device::new(minor, format!("r{minor}"), Arc::new(NoopHelper))
    }

    fn configure(dev: &Device, net: NetConfig) {
        dev.core.lock().net = Some(net);
        dev.change_state(&StateChange::new().conn(ConnState::Unconnected), ChgFlags::HARD);
        dev.change_state(&StateChange::new().conn(ConnState::WFConnection), ChgFlags::HARD);
    }

    #[tokio::test]
    async fn test_connect_requires_waiting_state() {
        let dev = device(0);
        let (a, _b) = Conduit::new_pair("a", "b");
        let err = dev.connect(a).await.unwrap_err();
        assert_eq!(err.code(), RetCode::StateNotAllowed as i32);
    }

    #[tokio::test]
    async fn test_diskless_nodes_connect() {
        let x = device(0);
        let y = device(1);
        configure(&x, NetConfig::default());
        configure(&y, NetConfig::default());
        let (a, b) = Conduit::new_pair("x", "y");
        let (rx, ry) = tokio::join!(x.connect(a), y.connect(b));
        rx.unwrap();
        ry.unwrap();
        let s = x.wait_state(|s| s.conn == ConnState::Connected).await;
        assert_eq!(s.pdsk, DiskState::Diskless);
        y.wait_state(|s| s.conn == ConnState::Connected).await;
        assert!(x.agreed_pro_version() >= PRO_VERSION_MIN);
    }

    #[tokio::test]
    async fn test_wrong_secret_goes_standalone() {
        let x = device(0);
        let y = device(1);
        let mut nx = NetConfig::default();
        nx.cram_hmac_alg = Some("sha256".to_string());
        nx.shared_secret = crate::config::SharedSecret::new("one");
        let mut ny = nx.clone();
        ny.shared_secret = crate::config::SharedSecret::new("two");
        configure(&x, nx);
        configure(&y, ny);
        let (a, b) = Conduit::new_pair("x", "y");
        let (rx, ry) = tokio::join!(x.connect(a), y.connect(b));
        assert!(matches!(rx, Err(ReplError::Auth { .. })));
        assert!(ry.is_err());
        assert_eq!(x.state().conn, ConnState::StandAlone);
        assert!(x.net_config().is_none());
    }

    #[tokio::test]
    async fn test_incompatible_protocol_drops_connection() {
        let x = device(0);
        let y = device(1);
        let nx = NetConfig::default();
        let mut ny = NetConfig::default();
        ny.protocol = WireProtocol::A;
        configure(&x, nx);
        configure(&y, ny);
        let (a, b) = Conduit::new_pair("x", "y");
        let (rx, ry) = tokio::join!(x.connect(a), y.connect(b));
        rx.unwrap();
        ry.unwrap();
        x.wait_state(|s| s.conn == ConnState::StandAlone).await;
        y.wait_state(|s| s.conn == ConnState::StandAlone).await;
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let x = device(0);
        let y = device(1);
        let mut net = NetConfig::default();
        net.ping_int_ms = 20;
        configure(&x, net.clone());
        configure(&y, net);
        let (a, b) = Conduit::new_pair("x", "y");
        let (rx, ry) = tokio::join!(x.connect(a), y.connect(b));
        rx.unwrap();
        ry.unwrap();
        x.wait_state(|s| s.conn == ConnState::Connected).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(x.state().conn, ConnState::Connected);
        assert_eq!(y.state().conn, ConnState::Connected);
    }
}
