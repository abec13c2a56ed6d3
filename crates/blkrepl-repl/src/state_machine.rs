//! Committing state changes.
//!
//! Every change of a device's [`DeviceState`] goes through
//! [`Device::set_state_locked`] with the state lock held: sanitize, validate
//! (unless hard), replace, wake waiters and queue the side effects on the
//! worker. [`Device::request_state`] adds the two-phase path for changes the
//! peer has to agree to.

use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::device::{Core, Device, Work};
use crate::protocol::Packet;
use crate::state::{
    is_cluster_wide, is_valid_state, is_valid_state_transition, sanitize_state, ConnState,
    DeviceState, DiskState, SetStateCode, StateChange,
};

/// How a state change is carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChgFlags {
    /// Skip validation.
    pub hard: bool,
    /// Log rejections.
    pub verbose: bool,
    /// Return only after the worker ran the side effects.
    pub wait_complete: bool,
}

impl ChgFlags {
    /// Validated, quiet.
    pub const NONE: ChgFlags = ChgFlags {
        hard: false,
        verbose: false,
        wait_complete: false,
    };
    /// Validated, rejections logged.
    pub const VERBOSE: ChgFlags = ChgFlags {
        hard: false,
        verbose: true,
        wait_complete: false,
    };
    /// Not validated.
    pub const HARD: ChgFlags = ChgFlags {
        hard: true,
        verbose: false,
        wait_complete: false,
    };

    /// Same flags, rejections logged.
    pub fn verbose(mut self) -> Self {
        self.verbose = true;
        self
    }

    /// Same flags, waiting for the side effects.
    pub fn wait_complete(mut self) -> Self {
        self.wait_complete = true;
        self
    }
}

impl Device {
    fn print_st_err(&self, os: &DeviceState, ns: &DeviceState, rv: SetStateCode) {
        error!(minor = self.minor(), code = rv as i32, "State change failed: {}", rv.message());
        error!(minor = self.minor(), " state = {os}");
        error!(minor = self.minor(), "wanted = {ns}");
    }

    /// Commit `ns` with the state lock held.
    ///
    /// `ns` is sanitized first. Unless `flags.hard`, the result must pass
    /// [`is_valid_state`] and [`is_valid_state_transition`]; a state that is
    /// as invalid as the current one only needs a valid transition.
    pub(crate) fn set_state_locked(
        &self,
        core: &mut Core,
        ns: DeviceState,
        flags: ChgFlags,
        done: Option<oneshot::Sender<()>>,
    ) -> SetStateCode {
        let os = core.state;
        let env = core.state_env();
        let sanitized = sanitize_state(&os, &ns, &env);
        let ns = sanitized.ns;

        if ns == os {
            return SetStateCode::NothingToDo;
        }

        let mut rv = SetStateCode::Success;
        if !flags.hard {
            rv = is_valid_state(&ns, &env);
            if !rv.is_success() {
                if is_valid_state(&os, &env) == rv {
                    error!(
                        minor = self.minor(),
                        "Considering state change from bad state. Error would be: '{}'",
                        rv.message()
                    );
                    error!(minor = self.minor(), "old = {os}");
                    error!(minor = self.minor(), "new = {ns}");
                    rv = is_valid_state_transition(&ns, &os);
                }
            } else {
                rv = is_valid_state_transition(&ns, &os);
            }
        }
        if !rv.is_success() {
            if flags.verbose {
                self.print_st_err(&os, &ns, rv);
            }
            return rv;
        }

        for w in &sanitized.warnings {
            warn!(minor = self.minor(), "{w}");
        }
        if !sanitized.overridden.is_empty() {
            warn!(minor = self.minor(), fields = ?sanitized.overridden, "state change sanitized");
        }
        info!(minor = self.minor(), "{}", DeviceState::describe_change(&os, &ns));

        core.state = ns;
        self.state_wait.notify_waiters();
        self.publish_state(ns);

        self.after_commit_locked(core, &os, &ns);

        self.queue_work(Work::AfterStateChange {
            os,
            ns,
            flags,
            done,
        });
        rv
    }

    /// Bookkeeping that must happen atomically with the commit.
    fn after_commit_locked(&self, core: &mut Core, os: &DeviceState, ns: &DeviceState) {
        use ConnState::*;

        if os.conn >= SyncSource && ns.conn <= Connected {
            self.kick_resync();
        }

        if matches!(os.conn, PausedSyncT | PausedSyncS) && matches!(ns.conn, SyncTarget | SyncSource) {
            info!(minor = self.minor(), "Syncer continues.");
            core.rs.resume();
            self.kick_resync();
        }

        if matches!(os.conn, SyncTarget | SyncSource) && matches!(ns.conn, PausedSyncT | PausedSyncS) {
            info!(minor = self.minor(), "Resync suspended");
            core.rs.pause();
        }

        if os.conn == Connected && matches!(ns.conn, VerifyS | VerifyT) {
            let bits = self.bitmap.bits();
            core.rs.start_verify(bits);
        }

        if core.state.disk >= DiskState::Inconsistent {
            let crashed_primary = self.flags.crashed_primary.load(Ordering::SeqCst);
            if let Some(disk) = core.disk.as_mut() {
                let mdf = Core::md_flags_for(disk.md.flags, ns, crashed_primary);
                if mdf != disk.md.flags {
                    disk.md.flags = mdf;
                    self.mark_md_dirty();
                }
                if os.disk < DiskState::Consistent && ns.disk >= DiskState::Consistent {
                    core.ed_uuid = disk.md.uuids[crate::uuid::CURRENT];
                }
            }
        }

        // peer was forced UpToDate and Primary
        if os.disk == DiskState::Inconsistent
            && os.pdsk == DiskState::Inconsistent
            && ns.disk == DiskState::Inconsistent
            && ns.pdsk == DiskState::UpToDate
        {
            self.flags.consider_resync.store(true, Ordering::SeqCst);
        }

        // the receiver cleans up once its link is gone
        if os.conn != Disconnecting && ns.conn == Disconnecting {
            self.shutdown_link();
        }
        if os.conn > TearDown && ns.conn <= TearDown && ns.conn >= Timeout {
            self.shutdown_link();
        }
    }

    /// Apply `change` without asking the peer.
    pub fn change_state(&self, change: &StateChange, flags: ChgFlags) -> SetStateCode {
        let mut core = self.core.lock();
        let ns = change.apply(&core.state);
        self.set_state_locked(&mut core, ns, flags, None)
    }

    /// Apply `change` without validation.
    pub fn force_state(&self, change: &StateChange) -> SetStateCode {
        self.change_state(change, ChgFlags::HARD)
    }

    /// Request `change`, asking the peer first where needed.
    ///
    /// Retries while the device is in a transient state.
    pub async fn request_state(&self, change: &StateChange, flags: ChgFlags) -> SetStateCode {
        loop {
            let notified = self.state_wait.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let rv = self.req_state(change, flags).await;
            if rv != SetStateCode::InTransientState {
                return rv;
            }
            notified.await;
        }
    }

    async fn req_state(&self, change: &StateChange, flags: ChgFlags) -> SetStateCode {
        let (done_tx, done_rx) = if flags.wait_complete {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let cluster_wide = {
            let core = self.core.lock();
            let os = core.state;
            let env = core.state_env();
            // decided on the requested state, before sanitizing
            let ns = change.apply(&os);
            if is_cluster_wide(&os, &ns) {
                let mut rv = is_valid_state(&ns, &env);
                if rv.is_success() {
                    rv = is_valid_state_transition(&ns, &os);
                }
                if !rv.is_success() {
                    if flags.verbose {
                        self.print_st_err(&os, &ns, rv);
                    }
                    return rv;
                }
                true
            } else {
                false
            }
        };

        let rv = if cluster_wide {
            self.cluster_wide_change(change, flags, done_tx).await
        } else {
            let mut core = self.core.lock();
            let ns = change.apply(&core.state);
            self.set_state_locked(&mut core, ns, flags, done_tx)
        };

        if let Some(rx) = done_rx {
            if rv == SetStateCode::Success {
                // the worker drops the sender only when it stops
                let _ = rx.await;
            }
        }
        rv
    }

    async fn cluster_wide_change(
        &self,
        change: &StateChange,
        flags: ChgFlags,
        done: Option<oneshot::Sender<()>>,
    ) -> SetStateCode {
        let _serial = self.state_mutex.lock().await;
        self.flags.cluster_st_change.store(true, Ordering::SeqCst);
        self.flags.cl_st_chg_success.store(false, Ordering::SeqCst);
        self.flags.cl_st_chg_fail.store(false, Ordering::SeqCst);

        let rv = self.cluster_wide_change_serialized(change, flags, done).await;

        self.flags.cluster_st_change.store(false, Ordering::SeqCst);
        rv
    }

    async fn cluster_wide_change_serialized(
        &self,
        change: &StateChange,
        flags: ChgFlags,
        done: Option<oneshot::Sender<()>>,
    ) -> SetStateCode {
        let sent = self.send_packet(&Packet::StateChgRequest {
            mask: change.mask(),
            val: change.val(),
        });
        if !sent {
            let rv = SetStateCode::CwFailedByPeer;
            if flags.verbose {
                let os = self.state();
                self.print_st_err(&os, &change.apply(&os), rv);
            }
            return rv;
        }

        let rv = loop {
            let notified = self.state_wait.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(rv) = self.req_st_cond(change) {
                break rv;
            }
            notified.await;
        };
        if !rv.is_success() {
            if flags.verbose {
                let os = self.state();
                self.print_st_err(&os, &change.apply(&os), rv);
            }
            return rv;
        }

        let mut core = self.core.lock();
        let ns = change.apply(&core.state);
        self.set_state_locked(&mut core, ns, flags, done)
    }

    /// Whether the peer answered our request, or it became moot.
    fn req_st_cond(&self, change: &StateChange) -> Option<SetStateCode> {
        if self.flags.cl_st_chg_success.swap(false, Ordering::SeqCst) {
            return Some(SetStateCode::CwSuccess);
        }
        if self.flags.cl_st_chg_fail.swap(false, Ordering::SeqCst) {
            return Some(SetStateCode::CwFailedByPeer);
        }
        let core = self.core.lock();
        let os = core.state;
        let ns = change.apply(&os);
        if !is_cluster_wide(&os, &ns) {
            return Some(SetStateCode::CwNoNeed);
        }
        let env = core.state_env();
        let mut rv = is_valid_state(&ns, &env);
        if rv.is_success() {
            rv = is_valid_state_transition(&ns, &os);
        }
        if rv.is_success() {
            None
        } else {
            Some(rv)
        }
    }

    /// The peer answered a cluster-wide request with `code`.
    pub(crate) fn got_state_change_reply(&self, code: i32) {
        let ok = SetStateCode::from_i32(code).map(SetStateCode::is_success).unwrap_or(false);
        if ok {
            self.flags.cl_st_chg_success.store(true, Ordering::SeqCst);
        } else {
            error!(
                minor = self.minor(),
                code,
                "Requested state change failed by peer: {}",
                SetStateCode::from_i32(code).map(SetStateCode::message).unwrap_or("unknown error code")
            );
            self.flags.cl_st_chg_fail.store(true, Ordering::SeqCst);
        }
        self.state_wait.notify_waiters();
    }
}
