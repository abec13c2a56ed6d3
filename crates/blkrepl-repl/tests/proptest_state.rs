//! Property-based tests for the state rules using proptest.

use std::sync::Arc;

use blkrepl_repl::state::{is_valid_state, sanitize_state, StateEnv};
use blkrepl_repl::{ChgFlags, ConnState, Device, DeviceState, DiskState, NoopHelper, Role, StateChange};
use proptest::prelude::*;

fn any_role() -> impl Strategy<Value = Role> {
    (0u8..3).prop_map(|v| Role::from_u8(v).unwrap())
}

fn any_conn() -> impl Strategy<Value = ConnState> {
    (0u8..22).prop_map(|v| ConnState::from_u8(v).unwrap())
}

fn any_disk() -> impl Strategy<Value = DiskState> {
    (0u8..9).prop_map(|v| DiskState::from_u8(v).unwrap())
}

prop_compose! {
    fn any_state()(
        role in any_role(),
        peer in any_role(),
        conn in any_conn(),
        disk in any_disk(),
        pdsk in any_disk(),
        flags in 0u8..16,
    ) -> DeviceState {
        DeviceState {
            role,
            peer,
            conn,
            disk,
            pdsk,
            susp: flags & 1 != 0,
            aftr_isp: flags & 2 != 0,
            peer_isp: flags & 4 != 0,
            user_isp: flags & 8 != 0,
        }
    }
}

prop_compose! {
    fn any_change()(
        role in proptest::option::of(any_role()),
        conn in proptest::option::of(any_conn()),
        disk in proptest::option::of(any_disk()),
        pdsk in proptest::option::of(any_disk()),
        user_isp in proptest::option::of(any::<bool>()),
    ) -> StateChange {
        let mut c = StateChange::new();
        c.role = role;
        c.conn = conn;
        c.disk = disk;
        c.pdsk = pdsk;
        c.user_isp = user_isp;
        c
    }
}

proptest! {
    /// Two primaries are only valid when allowed.
    #[test]
    fn test_two_primaries_rejected(mut ns in any_state()) {
        ns.role = Role::Primary;
        ns.peer = Role::Primary;
        let env = StateEnv::default();
        prop_assert!(!is_valid_state(&ns, &env).is_success());
    }

    /// Without a connection the peer is unknown and the peer disk is not
    /// claimed to be anything better than DUnknown.
    #[test]
    fn test_sanitize_disconnected_peer(os in any_state(), ns in any_state()) {
        let out = sanitize_state(&os, &ns, &StateEnv::default()).ns;
        if out.conn < ConnState::Connected {
            prop_assert_eq!(out.peer, Role::Unknown);
            prop_assert!(out.pdsk <= DiskState::DUnknown);
            prop_assert!(out.pdsk >= DiskState::Inconsistent);
            prop_assert!(!out.peer_isp);
        }
    }

    /// A pause flag always shows up in the connection state of a resync.
    #[test]
    fn test_sanitize_paused_sync(os in any_state(), ns in any_state()) {
        let out = sanitize_state(&os, &ns, &StateEnv::default()).ns;
        if out.is_paused() {
            prop_assert!(out.conn != ConnState::SyncSource && out.conn != ConnState::SyncTarget);
        } else {
            prop_assert!(out.conn != ConnState::PausedSyncS && out.conn != ConnState::PausedSyncT);
        }
    }

    /// A refused change leaves the committed state untouched.
    #[test]
    fn test_refused_change_is_not_applied(changes in proptest::collection::vec(any_change(), 1..12)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let dev = Device::new(0, "r0", Arc::new(NoopHelper));
            for change in &changes {
                let before = dev.state();
                let rv = dev.change_state(change, ChgFlags::NONE);
                if !rv.is_success() {
                    prop_assert_eq!(dev.state(), before);
                }
                let s = dev.state();
                prop_assert!(!(s.role == Role::Primary && s.peer == Role::Primary));
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
