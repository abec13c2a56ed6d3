//! Connection-time negotiation: protocol version, option compatibility and
//! the sync handshake that decides the resync direction.

use tracing::{error, info, warn};

use crate::config::{NetConfig, RrConflict, WireProtocol};
use crate::error::{ReplError, ReplResult};
use crate::split_brain::{
    cmp_after_sb, recover_0p, recover_1p, recover_2p, AfterSbPolicy, RecoveryHooks, SbFacts,
    NO_DECISION,
};
use crate::state::{ConnState, DiskState, Role};
use crate::uuid::{format_uuids, uuid_compare, PeerUuids, BITMAP, UUID_FLAG_WANT_LOSE, UUID_SLOTS};

/// Oldest protocol version we speak.
pub const PRO_VERSION_MIN: u32 = 86;
/// Newest protocol version we speak.
pub const PRO_VERSION_MAX: u32 = 88;
/// First version that exchanges the data-integrity digest name.
pub const PRO_VERSION_INTEGRITY: u32 = 87;

/// Pick the protocol version to use with a peer announcing `peer_min..=peer_max`.
///
/// Old peers send a zero maximum, meaning they only speak `peer_min`.
pub fn negotiate_version(peer_min: u32, peer_max: u32) -> ReplResult<u32> {
    let peer_max = if peer_max == 0 { peer_min } else { peer_max };
    if PRO_VERSION_MAX < peer_min || PRO_VERSION_MIN > peer_max {
        error!(
            own_min = PRO_VERSION_MIN,
            own_max = PRO_VERSION_MAX,
            peer_min,
            peer_max,
            "incompatible dialects"
        );
        return Err(ReplError::IncompatibleVersion {
            own_min: PRO_VERSION_MIN,
            own_max: PRO_VERSION_MAX,
            peer_min,
            peer_max,
        });
    }
    let agreed = PRO_VERSION_MAX.min(peer_max);
    info!(agreed, "Handshake successful: Agreed network protocol version {agreed}");
    Ok(agreed)
}

/// Options a peer reports in `ReportProtocol`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolParams {
    /// Replication protocol.
    pub protocol: WireProtocol,
    /// Zero-primaries split-brain policy.
    pub after_sb_0p: AfterSbPolicy,
    /// One-primary split-brain policy.
    pub after_sb_1p: AfterSbPolicy,
    /// Two-primaries split-brain policy.
    pub after_sb_2p: AfterSbPolicy,
    /// The sender volunteers to lose a split brain.
    pub want_lose: bool,
    /// Two primaries allowed.
    pub two_primaries: bool,
    /// Data-integrity digest, empty when unused.
    pub integrity_alg: String,
}

impl ProtocolParams {
    /// Our own options as we report them.
    pub fn from_config(net: &NetConfig) -> Self {
        Self {
            protocol: net.protocol,
            after_sb_0p: net.after_sb_0p,
            after_sb_1p: net.after_sb_1p,
            after_sb_2p: net.after_sb_2p,
            want_lose: net.want_lose,
            two_primaries: net.two_primaries,
            integrity_alg: net.integrity_alg.clone().unwrap_or_default(),
        }
    }
}

/// Check the peer's options against ours, in the order the checks apply.
///
/// Any mismatch means the connection must be torn down.
pub fn check_protocol(own: &NetConfig, peer: &ProtocolParams, agreed_pro_version: u32) -> ReplResult<()> {
    let fail = |msg: &str| {
        error!("{msg}");
        Err(ReplError::protocol(msg))
    };

    if peer.protocol != own.protocol {
        return fail("incompatible communication protocols");
    }
    if !cmp_after_sb(peer.after_sb_0p, own.after_sb_0p) {
        return fail("incompatible after-sb-0pri settings");
    }
    if !cmp_after_sb(peer.after_sb_1p, own.after_sb_1p) {
        return fail("incompatible after-sb-1pri settings");
    }
    if !cmp_after_sb(peer.after_sb_2p, own.after_sb_2p) {
        return fail("incompatible after-sb-2pri settings");
    }
    if peer.want_lose && own.want_lose {
        return fail("both sides have the 'want_lose' flag set");
    }
    if peer.two_primaries != own.two_primaries {
        return fail("incompatible setting of the two-primaries options");
    }
    if agreed_pro_version >= PRO_VERSION_INTEGRITY {
        let mine = own.integrity_alg.as_deref().unwrap_or("");
        if peer.integrity_alg != mine {
            return fail("incompatible setting of the data-integrity-alg");
        }
        info!(
            "data-integrity-alg: {}",
            if mine.is_empty() { "<not-used>" } else { mine }
        );
    }
    Ok(())
}

/// Everything the sync handshake looks at.
#[derive(Debug, Clone)]
pub struct HandshakeInput<'a> {
    /// Our UUID slots.
    pub own_uuids: [u64; UUID_SLOTS],
    /// The peer's UUIDs, weight and flags.
    pub peer: PeerUuids,
    /// Our role.
    pub role: Role,
    /// Our committed disk state.
    pub disk: DiskState,
    /// Our disk state for the decision (the pending one while `Negotiating`).
    pub effective_disk: DiskState,
    /// Peer role.
    pub peer_role: Role,
    /// Peer disk state.
    pub peer_disk: DiskState,
    /// We were Primary when we crashed.
    pub crashed_primary: bool,
    /// We won the connect race.
    pub discard_concurrent: bool,
    /// Our out-of-sync block count.
    pub own_weight: u64,
    /// Our net options.
    pub net: &'a NetConfig,
}

/// A successful handshake decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Connection state to move to: `WFBitMapS`, `WFBitMapT` or `Connected`.
    pub conn: ConnState,
    /// The whole bitmap must be set and written first.
    pub full_sync: bool,
    /// Final direction value.
    pub hg: i32,
    /// UUID rule that decided.
    pub rule: u32,
}

fn dump_uuids(input: &HandshakeInput<'_>) {
    info!(
        self_uuids = %format_uuids(&input.own_uuids),
        peer_uuids = %format_uuids(&input.peer.uuids),
        peer_bits = input.peer.bitmap_weight,
        peer_flags = input.peer.flags,
        "uuid dump"
    );
}

fn abort(msg: &str) -> ReplResult<HandshakeOutcome> {
    Err(ReplError::SplitBrain { msg: msg.to_string() })
}

/// Decide who syncs from whom.
///
/// Returns the connection state to enter or an error when the connection
/// has to be dropped. Helper calls and a possible demotion go through
/// `hooks`; the bitmap write for a full sync is left to the caller.
pub fn sync_handshake(
    input: &HandshakeInput<'_>,
    hooks: &mut dyn RecoveryHooks,
) -> ReplResult<HandshakeOutcome> {
    use DiskState::Inconsistent;

    let verdict = uuid_compare(
        &input.own_uuids,
        &input.peer,
        input.crashed_primary,
        input.discard_concurrent,
    );
    let mut hg = verdict.hg;
    let mydisk = input.effective_disk;
    let peer_disk = input.peer_disk;

    info!("sync handshake:");
    dump_uuids(input);
    info!(hg, rule = verdict.rule, "uuid_compare()={hg} by rule {}", verdict.rule);

    if hg == -1000 {
        error!("Unrelated data, aborting!");
        return abort("unrelated data");
    }

    if (mydisk == Inconsistent && peer_disk > Inconsistent)
        || (peer_disk == Inconsistent && mydisk > Inconsistent)
    {
        let full = hg == NO_DECISION || hg.abs() == 2;
        hg = if mydisk > Inconsistent { 1 } else { -1 };
        if full {
            hg *= 2;
        }
        info!(
            "Becoming sync {} due to disk states.",
            if hg > 0 { "source" } else { "target" }
        );
    }

    if hg == 100 || (hg == NO_DECISION && input.net.always_asbp) {
        let pcount =
            u32::from(input.role == Role::Primary) + u32::from(input.peer_role == Role::Primary);
        let forced = hg == NO_DECISION;
        let facts = SbFacts {
            self_bitmap_uuid: input.own_uuids[BITMAP],
            peer_bitmap_uuid: input.peer.uuids[BITMAP],
            ch_self: input.own_weight,
            ch_peer: input.peer.bitmap_weight,
            discard_concurrent: input.discard_concurrent,
            role: input.role,
        };
        let net = input.net;
        hg = match pcount {
            0 => recover_0p(net.after_sb_0p, &facts),
            1 => recover_1p(net.after_sb_1p, net.after_sb_0p, &facts, hooks),
            _ => recover_2p(net.after_sb_2p, net.after_sb_0p, &facts, hooks),
        };
        if hg.abs() < 100 {
            warn!(
                pcount,
                "Split-Brain detected, {pcount} primaries, automatically solved. Sync from {} node",
                if hg < 0 { "peer" } else { "this" }
            );
            if forced {
                warn!("Doing a full sync, since UUIDs where ambiguous.");
                dump_uuids(input);
                hg *= 2;
            }
        }
    }

    if hg == NO_DECISION {
        let peer_wants_lose = input.peer.flags & UUID_FLAG_WANT_LOSE != 0;
        if input.net.want_lose && !peer_wants_lose {
            hg = -1;
        }
        if !input.net.want_lose && peer_wants_lose {
            hg = 1;
        }
        if hg.abs() < 100 {
            warn!(
                "Split-Brain detected, manually solved. Sync from {} node",
                if hg < 0 { "peer" } else { "this" }
            );
        }
    }

    if hg == NO_DECISION {
        error!("Split-Brain detected, dropping connection!");
        dump_uuids(input);
        hooks.call_helper("split-brain");
        return abort("split brain");
    }

    if hg > 0 && mydisk <= Inconsistent {
        error!("I shall become SyncSource, but I am inconsistent!");
        return abort("sync source would be inconsistent");
    }

    // rr-conflict looks at the committed disk state
    if hg < 0 && input.role == Role::Primary && input.disk >= DiskState::Consistent {
        match input.net.rr_conflict {
            RrConflict::CallHelper | RrConflict::Disconnect => {
                if input.net.rr_conflict == RrConflict::CallHelper {
                    hooks.call_helper("pri-lost");
                }
                error!("I shall become SyncTarget, but I am primary!");
                return abort("primary would become sync target");
            }
            RrConflict::Violently => {
                warn!("Becoming SyncTarget, violating the stable-data assumption");
            }
        }
    }

    let full_sync = hg.abs() >= 2;
    if full_sync {
        info!("Writing the whole bitmap, full sync required after sync handshake.");
    }

    let conn = match hg {
        h if h > 0 => ConnState::WFBitMapS,
        h if h < 0 => ConnState::WFBitMapT,
        _ => {
            if input.own_weight > 0 {
                info!(bits = input.own_weight, "No resync, but {} bits in bitmap!", input.own_weight);
            }
            ConnState::Connected
        }
    };

    Ok(HandshakeOutcome {
        conn,
        full_sync,
        hg,
        rule: verdict.rule,
    })
}
