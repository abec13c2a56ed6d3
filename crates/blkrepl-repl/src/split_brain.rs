//! Automatic split-brain recovery policies.
//!
//! After both nodes modified their data independently, the sync handshake
//! asks one of the `recover_*` functions for a direction. The answer uses
//! the handshake's sign convention: positive means this node becomes sync
//! source, negative means it becomes sync target, and `-100` means no
//! decision could be made.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::state::Role;

/// Result meaning "no automatic decision".
pub const NO_DECISION: i32 = -100;

/// Policy applied after split brain is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum AfterSbPolicy {
    /// Drop the connection.
    #[default]
    Disconnect = 0,
    /// Discard the node that became Primary last.
    DiscardYoungerPri = 1,
    /// Discard the node that became Primary first.
    DiscardOlderPri = 2,
    /// Discard the node that made no changes, if any.
    DiscardZeroChg = 3,
    /// Discard the node with fewer changed blocks.
    DiscardLeastChg = 4,
    /// Discard the local data.
    DiscardLocal = 5,
    /// Discard the peer's data.
    DiscardRemote = 6,
    /// Follow the zero-primaries decision if it discards the Secondary.
    Consensus = 7,
    /// Discard the Secondary.
    DiscardSecondary = 8,
    /// Follow the zero-primaries decision, demoting a losing Primary.
    CallHelper = 9,
    /// Follow the zero-primaries decision regardless of roles.
    Violently = 10,
}

/// Which policy slot is being consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbSlot {
    /// No node is Primary.
    ZeroPrimaries,
    /// One node is Primary.
    OnePrimary,
    /// Both nodes are Primary.
    TwoPrimaries,
}

impl AfterSbPolicy {
    /// Decode the wire value.
    pub fn from_u32(v: u32) -> Option<Self> {
        use AfterSbPolicy::*;
        Some(match v {
            0 => Disconnect,
            1 => DiscardYoungerPri,
            2 => DiscardOlderPri,
            3 => DiscardZeroChg,
            4 => DiscardLeastChg,
            5 => DiscardLocal,
            6 => DiscardRemote,
            7 => Consensus,
            8 => DiscardSecondary,
            9 => CallHelper,
            10 => Violently,
            _ => return None,
        })
    }

    /// Whether the policy may be configured for `slot`.
    pub fn valid_for(self, slot: SbSlot) -> bool {
        use AfterSbPolicy::*;
        match slot {
            SbSlot::ZeroPrimaries => matches!(
                self,
                Disconnect
                    | DiscardYoungerPri
                    | DiscardOlderPri
                    | DiscardZeroChg
                    | DiscardLeastChg
                    | DiscardLocal
                    | DiscardRemote
            ),
            SbSlot::OnePrimary => matches!(
                self,
                Disconnect | Consensus | Violently | DiscardSecondary | CallHelper
            ),
            SbSlot::TwoPrimaries => matches!(self, Disconnect | Violently | CallHelper),
        }
    }
}

/// Whether the peer's policy is compatible with ours.
///
/// `DiscardLocal` on one side must be matched by `DiscardRemote` on the
/// other; every other policy must be identical.
pub fn cmp_after_sb(peer: AfterSbPolicy, own: AfterSbPolicy) -> bool {
    use AfterSbPolicy::*;
    if (peer == DiscardRemote && own == DiscardLocal)
        || (peer == DiscardLocal && own == DiscardRemote)
    {
        return true;
    }
    if matches!(peer, DiscardRemote | DiscardLocal) || matches!(own, DiscardRemote | DiscardLocal) {
        return false;
    }
    peer == own
}

/// Facts a recovery decision is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbFacts {
    /// Our Bitmap UUID.
    pub self_bitmap_uuid: u64,
    /// The peer's Bitmap UUID.
    pub peer_bitmap_uuid: u64,
    /// Blocks we changed since the split.
    pub ch_self: u64,
    /// Blocks the peer changed since the split.
    pub ch_peer: u64,
    /// We won the connect race and break ties towards the peer.
    pub discard_concurrent: bool,
    /// Our role.
    pub role: Role,
}

/// Side effects a recovery decision may need.
pub trait RecoveryHooks {
    /// Try to demote ourselves to Secondary; true on success.
    fn give_up_primary(&mut self) -> bool;
    /// Run an external helper.
    fn call_helper(&mut self, name: &str);
}

fn tie_break(facts: &SbFacts) -> i32 {
    if facts.discard_concurrent {
        -1
    } else {
        1
    }
}

/// Decide when neither node is Primary.
pub fn recover_0p(policy: AfterSbPolicy, facts: &SbFacts) -> i32 {
    use AfterSbPolicy::*;

    let own = facts.self_bitmap_uuid & 1;
    let peer = facts.peer_bitmap_uuid & 1;

    // the fall-through chain: younger -> older -> zero changes -> least changes
    let mut stage = policy;
    loop {
        match stage {
            Consensus | DiscardSecondary | CallHelper | Violently => {
                error!(?policy, "Configuration error.");
                return NO_DECISION;
            }
            Disconnect => return NO_DECISION,
            DiscardYoungerPri => {
                if own == 0 && peer == 1 {
                    return -1;
                }
                if own == 1 && peer == 0 {
                    return 1;
                }
                stage = DiscardOlderPri;
            }
            DiscardOlderPri => {
                if own == 0 && peer == 1 {
                    return 1;
                }
                if own == 1 && peer == 0 {
                    return -1;
                }
                warn!("Discard younger/older primary did not find a decision, using discard-least-changes instead");
                stage = DiscardZeroChg;
            }
            DiscardZeroChg => {
                if facts.ch_peer == 0 && facts.ch_self == 0 {
                    return tie_break(facts);
                }
                if facts.ch_peer == 0 {
                    return 1;
                }
                if facts.ch_self == 0 {
                    return -1;
                }
                if policy == DiscardZeroChg {
                    return NO_DECISION;
                }
                stage = DiscardLeastChg;
            }
            DiscardLeastChg => {
                return match facts.ch_self.cmp(&facts.ch_peer) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Greater => 1,
                    std::cmp::Ordering::Equal => tie_break(facts),
                };
            }
            DiscardLocal => return -1,
            DiscardRemote => return 1,
        }
    }
}

fn demote_or_give_up(hg: i32, hooks: &mut dyn RecoveryHooks) -> i32 {
    if hooks.give_up_primary() {
        warn!("Successfully gave up primary role.");
        hg
    } else {
        hooks.call_helper("pri-lost-after-sb");
        NO_DECISION
    }
}

/// Decide when exactly one node is Primary.
pub fn recover_1p(
    policy: AfterSbPolicy,
    policy_0p: AfterSbPolicy,
    facts: &SbFacts,
    hooks: &mut dyn RecoveryHooks,
) -> i32 {
    use AfterSbPolicy::*;
    match policy {
        DiscardYoungerPri | DiscardOlderPri | DiscardZeroChg | DiscardLeastChg | DiscardLocal
        | DiscardRemote => {
            error!(?policy, "Configuration error.");
            NO_DECISION
        }
        Disconnect => NO_DECISION,
        Consensus => {
            let hg = recover_0p(policy_0p, facts);
            if (hg == -1 && facts.role == Role::Secondary) || (hg == 1 && facts.role == Role::Primary)
            {
                hg
            } else {
                NO_DECISION
            }
        }
        Violently => recover_0p(policy_0p, facts),
        DiscardSecondary => {
            if facts.role == Role::Primary {
                1
            } else {
                -1
            }
        }
        CallHelper => {
            let hg = recover_0p(policy_0p, facts);
            if hg == -1 && facts.role == Role::Primary {
                demote_or_give_up(hg, hooks)
            } else {
                hg
            }
        }
    }
}

/// Decide when both nodes are Primary.
pub fn recover_2p(
    policy: AfterSbPolicy,
    policy_0p: AfterSbPolicy,
    facts: &SbFacts,
    hooks: &mut dyn RecoveryHooks,
) -> i32 {
    use AfterSbPolicy::*;
    match policy {
        Violently => recover_0p(policy_0p, facts),
        Disconnect => NO_DECISION,
        CallHelper => {
            let hg = recover_0p(policy_0p, facts);
            if hg == -1 {
                demote_or_give_up(hg, hooks)
            } else {
                hg
            }
        }
        _ => {
            error!(?policy, "Configuration error.");
            NO_DECISION
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Hooks {
        demote_ok: bool,
        demoted: u32,
        helpers: Vec<String>,
    }

    impl RecoveryHooks for Hooks {
        fn give_up_primary(&mut self) -> bool {
            self.demoted += 1;
            self.demote_ok
        }
        fn call_helper(&mut self, name: &str) {
            self.helpers.push(name.to_string());
        }
    }

    fn facts(own_bm: u64, peer_bm: u64, ch_self: u64, ch_peer: u64) -> SbFacts {
        SbFacts {
            self_bitmap_uuid: own_bm,
            peer_bitmap_uuid: peer_bm,
            ch_self,
            ch_peer,
            discard_concurrent: false,
            role: Role::Secondary,
        }
    }

    #[test]
    fn test_policy_wire_values() {
        for v in 0..=10 {
            assert_eq!(AfterSbPolicy::from_u32(v).map(|p| p as u32), Some(v));
        }
        assert_eq!(AfterSbPolicy::from_u32(11), None);
    }

    #[test]
    fn test_valid_for_slots() {
        use AfterSbPolicy::*;
        assert!(DiscardLeastChg.valid_for(SbSlot::ZeroPrimaries));
        assert!(!DiscardLeastChg.valid_for(SbSlot::OnePrimary));
        assert!(Consensus.valid_for(SbSlot::OnePrimary));
        assert!(!Consensus.valid_for(SbSlot::TwoPrimaries));
        assert!(Violently.valid_for(SbSlot::TwoPrimaries));
        assert!(Disconnect.valid_for(SbSlot::ZeroPrimaries));
    }

    #[test]
    fn test_cmp_after_sb() {
        use AfterSbPolicy::*;
        assert!(cmp_after_sb(DiscardLocal, DiscardRemote));
        assert!(cmp_after_sb(DiscardRemote, DiscardLocal));
        assert!(!cmp_after_sb(DiscardLocal, DiscardLocal));
        assert!(!cmp_after_sb(DiscardRemote, Disconnect));
        assert!(cmp_after_sb(Consensus, Consensus));
        assert!(!cmp_after_sb(Consensus, Violently));
    }

    #[test]
    fn test_0p_younger_and_older() {
        use AfterSbPolicy::*;
        let f = facts(0, 1, 5, 5);
        assert_eq!(recover_0p(DiscardYoungerPri, &f), -1);
        assert_eq!(recover_0p(DiscardOlderPri, &f), 1);
        let f = facts(1, 0, 5, 5);
        assert_eq!(recover_0p(DiscardYoungerPri, &f), 1);
        assert_eq!(recover_0p(DiscardOlderPri, &f), -1);
    }

    #[test]
    fn test_0p_falls_through_to_least_changes() {
        use AfterSbPolicy::*;
        let f = facts(0, 0, 3, 9);
        assert_eq!(recover_0p(DiscardYoungerPri, &f), -1);
        let f = facts(1, 1, 9, 3);
        assert_eq!(recover_0p(DiscardOlderPri, &f), 1);
    }

    #[test]
    fn test_0p_zero_changes() {
        use AfterSbPolicy::*;
        assert_eq!(recover_0p(DiscardZeroChg, &facts(0, 0, 4, 0)), 1);
        assert_eq!(recover_0p(DiscardZeroChg, &facts(0, 0, 0, 4)), -1);
        assert_eq!(recover_0p(DiscardZeroChg, &facts(0, 0, 4, 4)), NO_DECISION);
        let mut f = facts(0, 0, 0, 0);
        assert_eq!(recover_0p(DiscardZeroChg, &f), 1);
        f.discard_concurrent = true;
        assert_eq!(recover_0p(DiscardZeroChg, &f), -1);
    }

    #[test]
    fn test_0p_least_changes_tie() {
        let mut f = facts(0, 0, 7, 7);
        assert_eq!(recover_0p(AfterSbPolicy::DiscardLeastChg, &f), 1);
        f.discard_concurrent = true;
        assert_eq!(recover_0p(AfterSbPolicy::DiscardLeastChg, &f), -1);
    }

    #[test]
    fn test_0p_fixed_and_invalid() {
        use AfterSbPolicy::*;
        let f = facts(0, 0, 1, 2);
        assert_eq!(recover_0p(DiscardLocal, &f), -1);
        assert_eq!(recover_0p(DiscardRemote, &f), 1);
        assert_eq!(recover_0p(Disconnect, &f), NO_DECISION);
        assert_eq!(recover_0p(Consensus, &f), NO_DECISION);
    }

    #[test]
    fn test_1p_consensus_and_discard_secondary() {
        use AfterSbPolicy::*;
        let mut hooks = Hooks::default();
        let mut f = facts(0, 0, 1, 5);
        // 0p says we lose; we are Secondary, so consensus agrees
        assert_eq!(recover_1p(Consensus, DiscardLeastChg, &f, &mut hooks), -1);
        f.role = Role::Primary;
        assert_eq!(
            recover_1p(Consensus, DiscardLeastChg, &f, &mut hooks),
            NO_DECISION
        );
        assert_eq!(recover_1p(DiscardSecondary, Disconnect, &f, &mut hooks), 1);
        f.role = Role::Secondary;
        assert_eq!(recover_1p(DiscardSecondary, Disconnect, &f, &mut hooks), -1);
        assert_eq!(hooks.demoted, 0);
    }

    #[test]
    fn test_1p_call_helper_demotes_primary() {
        use AfterSbPolicy::*;
        let mut f = facts(0, 0, 1, 5);
        f.role = Role::Primary;

        let mut hooks = Hooks {
            demote_ok: true,
            ..Default::default()
        };
        assert_eq!(recover_1p(CallHelper, DiscardLeastChg, &f, &mut hooks), -1);
        assert_eq!(hooks.demoted, 1);
        assert!(hooks.helpers.is_empty());

        let mut hooks = Hooks::default();
        assert_eq!(
            recover_1p(CallHelper, DiscardLeastChg, &f, &mut hooks),
            NO_DECISION
        );
        assert_eq!(hooks.helpers, vec!["pri-lost-after-sb".to_string()]);
    }

    #[test]
    fn test_2p() {
        use AfterSbPolicy::*;
        let mut hooks = Hooks::default();
        let f = facts(0, 0, 9, 1);
        assert_eq!(recover_2p(Violently, DiscardLeastChg, &f, &mut hooks), 1);
        assert_eq!(recover_2p(Disconnect, DiscardLeastChg, &f, &mut hooks), NO_DECISION);
        assert_eq!(recover_2p(Consensus, DiscardLeastChg, &f, &mut hooks), NO_DECISION);
        let f = facts(0, 0, 1, 9);
        assert_eq!(
            recover_2p(CallHelper, DiscardLeastChg, &f, &mut hooks),
            NO_DECISION
        );
        assert_eq!(hooks.demoted, 1);
    }
}
