//! Replicated device state, state-change requests and their validation.
//!
//! [`DeviceState`] is the tuple of role, peer role, connection state, local
//! and peer disk state and the suspend/pause flags. On the wire it travels
//! as a packed 32-bit word; a [`StateChange`] travels as a `(mask, val)`
//! pair in the same packing, with `ns = (os & !mask) | val`.
//!
//! Everything in here is pure: the functions look only at the states and at
//! a [`StateEnv`] snapshot of the configuration bits that validation needs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::FencingPolicy;
use crate::error::{ReplError, ReplResult};

const ROLE_SHIFT: u32 = 0;
const PEER_SHIFT: u32 = 2;
const CONN_SHIFT: u32 = 4;
const DISK_SHIFT: u32 = 9;
const PDSK_SHIFT: u32 = 13;
const SUSP_SHIFT: u32 = 17;
const AFTR_ISP_SHIFT: u32 = 18;
const PEER_ISP_SHIFT: u32 = 19;
const USER_ISP_SHIFT: u32 = 20;

const ROLE_MASK: u32 = 0x3;
const CONN_MASK: u32 = 0x1f;
const DISK_MASK: u32 = 0xf;
const FLAG_MASK: u32 = 0x1;

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    /// Role not known (peer not connected).
    Unknown = 0,
    /// Accepts application writes.
    Primary = 1,
    /// Receives replicated writes.
    Secondary = 2,
}

/// Connection state.
///
/// The numeric order matters: comparisons such as `conn < Connected` are
/// part of the validation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ConnState {
    StandAlone = 0,
    Disconnecting,
    Unconnected,
    Timeout,
    BrokenPipe,
    NetworkFailure,
    ProtocolError,
    TearDown,
    WFConnection,
    WFReportParams,
    Connected,
    StartingSyncS,
    StartingSyncT,
    WFBitMapS,
    WFBitMapT,
    WFSyncUUID,
    SyncSource,
    SyncTarget,
    VerifyS,
    VerifyT,
    PausedSyncS,
    PausedSyncT,
}

/// Disk state, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum DiskState {
    Diskless = 0,
    Attaching,
    Failed,
    Negotiating,
    Inconsistent,
    Outdated,
    DUnknown,
    Consistent,
    UpToDate,
}

impl Role {
    /// Decode from the packed field value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Role::Unknown),
            1 => Some(Role::Primary),
            2 => Some(Role::Secondary),
            _ => None,
        }
    }

    /// Printable name.
    pub fn name(self) -> &'static str {
        match self {
            Role::Unknown => "Unknown",
            Role::Primary => "Primary",
            Role::Secondary => "Secondary",
        }
    }
}

impl ConnState {
    const ALL: [ConnState; 22] = [
        ConnState::StandAlone,
        ConnState::Disconnecting,
        ConnState::Unconnected,
        ConnState::Timeout,
        ConnState::BrokenPipe,
        ConnState::NetworkFailure,
        ConnState::ProtocolError,
        ConnState::TearDown,
        ConnState::WFConnection,
        ConnState::WFReportParams,
        ConnState::Connected,
        ConnState::StartingSyncS,
        ConnState::StartingSyncT,
        ConnState::WFBitMapS,
        ConnState::WFBitMapT,
        ConnState::WFSyncUUID,
        ConnState::SyncSource,
        ConnState::SyncTarget,
        ConnState::VerifyS,
        ConnState::VerifyT,
        ConnState::PausedSyncS,
        ConnState::PausedSyncT,
    ];

    /// Decode from the packed field value.
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Printable name.
    pub fn name(self) -> &'static str {
        match self {
            ConnState::StandAlone => "StandAlone",
            ConnState::Disconnecting => "Disconnecting",
            ConnState::Unconnected => "Unconnected",
            ConnState::Timeout => "Timeout",
            ConnState::BrokenPipe => "BrokenPipe",
            ConnState::NetworkFailure => "NetworkFailure",
            ConnState::ProtocolError => "ProtocolError",
            ConnState::TearDown => "TearDown",
            ConnState::WFConnection => "WFConnection",
            ConnState::WFReportParams => "WFReportParams",
            ConnState::Connected => "Connected",
            ConnState::StartingSyncS => "StartingSyncS",
            ConnState::StartingSyncT => "StartingSyncT",
            ConnState::WFBitMapS => "WFBitMapS",
            ConnState::WFBitMapT => "WFBitMapT",
            ConnState::WFSyncUUID => "WFSyncUUID",
            ConnState::SyncSource => "SyncSource",
            ConnState::SyncTarget => "SyncTarget",
            ConnState::VerifyS => "VerifyS",
            ConnState::VerifyT => "VerifyT",
            ConnState::PausedSyncS => "PausedSyncS",
            ConnState::PausedSyncT => "PausedSyncT",
        }
    }

    /// Timeout, BrokenPipe, NetworkFailure, ProtocolError or TearDown.
    pub fn is_network_error(self) -> bool {
        self >= ConnState::Timeout && self <= ConnState::TearDown
    }

    /// SyncSource/SyncTarget or one of their paused variants.
    pub fn is_resync(self) -> bool {
        matches!(
            self,
            ConnState::SyncSource
                | ConnState::SyncTarget
                | ConnState::PausedSyncS
                | ConnState::PausedSyncT
        )
    }

    /// Online verify in either direction.
    pub fn is_verify(self) -> bool {
        matches!(self, ConnState::VerifyS | ConnState::VerifyT)
    }
}

impl DiskState {
    const ALL: [DiskState; 9] = [
        DiskState::Diskless,
        DiskState::Attaching,
        DiskState::Failed,
        DiskState::Negotiating,
        DiskState::Inconsistent,
        DiskState::Outdated,
        DiskState::DUnknown,
        DiskState::Consistent,
        DiskState::UpToDate,
    ];

    /// Decode from the packed field value.
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    /// Printable name.
    pub fn name(self) -> &'static str {
        match self {
            DiskState::Diskless => "Diskless",
            DiskState::Attaching => "Attaching",
            DiskState::Failed => "Failed",
            DiskState::Negotiating => "Negotiating",
            DiskState::Inconsistent => "Inconsistent",
            DiskState::Outdated => "Outdated",
            DiskState::DUnknown => "DUnknown",
            DiskState::Consistent => "Consistent",
            DiskState::UpToDate => "UpToDate",
        }
    }
}

macro_rules! impl_display_by_name {
    ($($t:ty),*) => {
        $(impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        })*
    };
}

impl_display_by_name!(Role, ConnState, DiskState);

/// The replicated device state tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceState {
    /// Local role.
    pub role: Role,
    /// Peer role.
    pub peer: Role,
    /// Connection state.
    pub conn: ConnState,
    /// Local disk state.
    pub disk: DiskState,
    /// Peer disk state.
    pub pdsk: DiskState,
    /// Application I/O suspended.
    pub susp: bool,
    /// Resync paused because a resync-after dependency is syncing.
    pub aftr_isp: bool,
    /// Resync paused by the peer.
    pub peer_isp: bool,
    /// Resync paused by the administrator.
    pub user_isp: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            role: Role::Secondary,
            peer: Role::Unknown,
            conn: ConnState::StandAlone,
            disk: DiskState::Diskless,
            pdsk: DiskState::DUnknown,
            susp: false,
            aftr_isp: false,
            peer_isp: false,
            user_isp: false,
        }
    }
}

impl DeviceState {
    /// Packed 32-bit representation used on the wire.
    pub fn pack(&self) -> u32 {
        ((self.role as u32) << ROLE_SHIFT)
            | ((self.peer as u32) << PEER_SHIFT)
            | ((self.conn as u32) << CONN_SHIFT)
            | ((self.disk as u32) << DISK_SHIFT)
            | ((self.pdsk as u32) << PDSK_SHIFT)
            | ((self.susp as u32) << SUSP_SHIFT)
            | ((self.aftr_isp as u32) << AFTR_ISP_SHIFT)
            | ((self.peer_isp as u32) << PEER_ISP_SHIFT)
            | ((self.user_isp as u32) << USER_ISP_SHIFT)
    }

    /// Decode a packed state received from the peer.
    pub fn unpack(v: u32) -> ReplResult<Self> {
        let bad = |what: &str| ReplError::protocol(format!("invalid {what} in packed state {v:#x}"));
        Ok(Self {
            role: Role::from_u8(((v >> ROLE_SHIFT) & ROLE_MASK) as u8).ok_or_else(|| bad("role"))?,
            peer: Role::from_u8(((v >> PEER_SHIFT) & ROLE_MASK) as u8).ok_or_else(|| bad("peer"))?,
            conn: ConnState::from_u8(((v >> CONN_SHIFT) & CONN_MASK) as u8)
                .ok_or_else(|| bad("conn"))?,
            disk: DiskState::from_u8(((v >> DISK_SHIFT) & DISK_MASK) as u8)
                .ok_or_else(|| bad("disk"))?,
            pdsk: DiskState::from_u8(((v >> PDSK_SHIFT) & DISK_MASK) as u8)
                .ok_or_else(|| bad("pdsk"))?,
            susp: (v >> SUSP_SHIFT) & FLAG_MASK != 0,
            aftr_isp: (v >> AFTR_ISP_SHIFT) & FLAG_MASK != 0,
            peer_isp: (v >> PEER_ISP_SHIFT) & FLAG_MASK != 0,
            user_isp: (v >> USER_ISP_SHIFT) & FLAG_MASK != 0,
        })
    }

    /// Any of the three resync pause reasons.
    pub fn is_paused(&self) -> bool {
        self.aftr_isp || self.peer_isp || self.user_isp
    }

    /// Names of the fields that differ between `self` and `other`.
    pub fn changed_fields(&self, other: &DeviceState) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.role != other.role {
            out.push("role");
        }
        if self.peer != other.peer {
            out.push("peer");
        }
        if self.conn != other.conn {
            out.push("conn");
        }
        if self.disk != other.disk {
            out.push("disk");
        }
        if self.pdsk != other.pdsk {
            out.push("pdsk");
        }
        if self.susp != other.susp {
            out.push("susp");
        }
        if self.aftr_isp != other.aftr_isp {
            out.push("aftr_isp");
        }
        if self.peer_isp != other.peer_isp {
            out.push("peer_isp");
        }
        if self.user_isp != other.user_isp {
            out.push("user_isp");
        }
        out
    }

    /// One-line summary of the transition from `os` to `ns`, e.g.
    /// `role( Secondary -> Primary ) disk( Inconsistent -> UpToDate )`.
    pub fn describe_change(os: &DeviceState, ns: &DeviceState) -> String {
        fn flag(b: bool) -> &'static str {
            if b {
                "1"
            } else {
                "0"
            }
        }
        let mut parts = Vec::new();
        let mut push = |name: &str, a: &str, b: &str| {
            if a != b {
                parts.push(format!("{name}( {a} -> {b} )"));
            }
        };
        push("role", os.role.name(), ns.role.name());
        push("peer", os.peer.name(), ns.peer.name());
        push("conn", os.conn.name(), ns.conn.name());
        push("disk", os.disk.name(), ns.disk.name());
        push("pdsk", os.pdsk.name(), ns.pdsk.name());
        push("susp", flag(os.susp), flag(ns.susp));
        push("aftr_isp", flag(os.aftr_isp), flag(ns.aftr_isp));
        push("peer_isp", flag(os.peer_isp), flag(ns.peer_isp));
        push("user_isp", flag(os.user_isp), flag(ns.user_isp));
        parts.join(" ")
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ cs:{} ro:{}/{} ds:{}/{} {}{}{}{} }}",
            self.conn,
            self.role,
            self.peer,
            self.disk,
            self.pdsk,
            if self.susp { 's' } else { 'r' },
            if self.aftr_isp { 'a' } else { '-' },
            if self.peer_isp { 'p' } else { '-' },
            if self.user_isp { 'u' } else { '-' },
        )
    }
}

/// A requested change to some fields of the device state.
///
/// Unset fields keep their current value. Equivalent to a `(mask, val)`
/// pair over the packed representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct StateChange {
    pub role: Option<Role>,
    pub peer: Option<Role>,
    pub conn: Option<ConnState>,
    pub disk: Option<DiskState>,
    pub pdsk: Option<DiskState>,
    pub susp: Option<bool>,
    pub aftr_isp: Option<bool>,
    pub peer_isp: Option<bool>,
    pub user_isp: Option<bool>,
}

impl StateChange {
    /// An empty change.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the role.
    pub fn role(mut self, v: Role) -> Self {
        self.role = Some(v);
        self
    }

    /// Set the peer role.
    pub fn peer(mut self, v: Role) -> Self {
        self.peer = Some(v);
        self
    }

    /// Set the connection state.
    pub fn conn(mut self, v: ConnState) -> Self {
        self.conn = Some(v);
        self
    }

    /// Set the local disk state.
    pub fn disk(mut self, v: DiskState) -> Self {
        self.disk = Some(v);
        self
    }

    /// Set the peer disk state.
    pub fn pdsk(mut self, v: DiskState) -> Self {
        self.pdsk = Some(v);
        self
    }

    /// Set the suspend flag.
    pub fn susp(mut self, v: bool) -> Self {
        self.susp = Some(v);
        self
    }

    /// Set the resync-after pause flag.
    pub fn aftr_isp(mut self, v: bool) -> Self {
        self.aftr_isp = Some(v);
        self
    }

    /// Set the peer pause flag.
    pub fn peer_isp(mut self, v: bool) -> Self {
        self.peer_isp = Some(v);
        self
    }

    /// Set the user pause flag.
    pub fn user_isp(mut self, v: bool) -> Self {
        self.user_isp = Some(v);
        self
    }

    /// True if no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Compute `ns` from `os`.
    pub fn apply(&self, os: &DeviceState) -> DeviceState {
        DeviceState {
            role: self.role.unwrap_or(os.role),
            peer: self.peer.unwrap_or(os.peer),
            conn: self.conn.unwrap_or(os.conn),
            disk: self.disk.unwrap_or(os.disk),
            pdsk: self.pdsk.unwrap_or(os.pdsk),
            susp: self.susp.unwrap_or(os.susp),
            aftr_isp: self.aftr_isp.unwrap_or(os.aftr_isp),
            peer_isp: self.peer_isp.unwrap_or(os.peer_isp),
            user_isp: self.user_isp.unwrap_or(os.user_isp),
        }
    }

    /// The packed `mask` word.
    pub fn mask(&self) -> u32 {
        let mut m = 0;
        let mut add = |set: bool, field: u32, shift: u32| {
            if set {
                m |= field << shift;
            }
        };
        add(self.role.is_some(), ROLE_MASK, ROLE_SHIFT);
        add(self.peer.is_some(), ROLE_MASK, PEER_SHIFT);
        add(self.conn.is_some(), CONN_MASK, CONN_SHIFT);
        add(self.disk.is_some(), DISK_MASK, DISK_SHIFT);
        add(self.pdsk.is_some(), DISK_MASK, PDSK_SHIFT);
        add(self.susp.is_some(), FLAG_MASK, SUSP_SHIFT);
        add(self.aftr_isp.is_some(), FLAG_MASK, AFTR_ISP_SHIFT);
        add(self.peer_isp.is_some(), FLAG_MASK, PEER_ISP_SHIFT);
        add(self.user_isp.is_some(), FLAG_MASK, USER_ISP_SHIFT);
        m
    }

    /// The packed `val` word.
    pub fn val(&self) -> u32 {
        let mut v = 0;
        if let Some(r) = self.role {
            v |= (r as u32) << ROLE_SHIFT;
        }
        if let Some(r) = self.peer {
            v |= (r as u32) << PEER_SHIFT;
        }
        if let Some(c) = self.conn {
            v |= (c as u32) << CONN_SHIFT;
        }
        if let Some(d) = self.disk {
            v |= (d as u32) << DISK_SHIFT;
        }
        if let Some(d) = self.pdsk {
            v |= (d as u32) << PDSK_SHIFT;
        }
        for (b, shift) in [
            (self.susp, SUSP_SHIFT),
            (self.aftr_isp, AFTR_ISP_SHIFT),
            (self.peer_isp, PEER_ISP_SHIFT),
            (self.user_isp, USER_ISP_SHIFT),
        ] {
            if b == Some(true) {
                v |= 1 << shift;
            }
        }
        v
    }

    /// Decode a `(mask, val)` pair received from the peer.
    ///
    /// The mask must cover whole fields and `val` must not set bits outside
    /// the mask.
    pub fn from_wire(mask: u32, val: u32) -> ReplResult<Self> {
        if val & !mask != 0 {
            return Err(ReplError::protocol(format!(
                "state change val {val:#x} outside mask {mask:#x}"
            )));
        }
        let decoded = DeviceState::unpack(val)?;
        let field = |width: u32, shift: u32| -> ReplResult<bool> {
            match (mask >> shift) & width {
                0 => Ok(false),
                m if m == width => Ok(true),
                _ => Err(ReplError::protocol(format!(
                    "state change mask {mask:#x} covers a partial field"
                ))),
            }
        };
        let known = ROLE_MASK << ROLE_SHIFT
            | ROLE_MASK << PEER_SHIFT
            | CONN_MASK << CONN_SHIFT
            | DISK_MASK << DISK_SHIFT
            | DISK_MASK << PDSK_SHIFT
            | FLAG_MASK << SUSP_SHIFT
            | FLAG_MASK << AFTR_ISP_SHIFT
            | FLAG_MASK << PEER_ISP_SHIFT
            | FLAG_MASK << USER_ISP_SHIFT;
        if mask & !known != 0 {
            return Err(ReplError::protocol(format!("state change mask {mask:#x} has unknown bits")));
        }
        Ok(Self {
            role: field(ROLE_MASK, ROLE_SHIFT)?.then_some(decoded.role),
            peer: field(ROLE_MASK, PEER_SHIFT)?.then_some(decoded.peer),
            conn: field(CONN_MASK, CONN_SHIFT)?.then_some(decoded.conn),
            disk: field(DISK_MASK, DISK_SHIFT)?.then_some(decoded.disk),
            pdsk: field(DISK_MASK, PDSK_SHIFT)?.then_some(decoded.pdsk),
            susp: field(FLAG_MASK, SUSP_SHIFT)?.then_some(decoded.susp),
            aftr_isp: field(FLAG_MASK, AFTR_ISP_SHIFT)?.then_some(decoded.aftr_isp),
            peer_isp: field(FLAG_MASK, PEER_ISP_SHIFT)?.then_some(decoded.peer_isp),
            user_isp: field(FLAG_MASK, USER_ISP_SHIFT)?.then_some(decoded.user_isp),
        })
    }

    /// Translate a change requested by the peer into our point of view.
    ///
    /// Role and disk swap with their peer counterparts, sync starts swap
    /// direction and a peer disconnect becomes a tear down here.
    pub fn convert_from_peer(&self) -> Self {
        let conn = self.conn.map(|c| match c {
            ConnState::Connected => ConnState::Connected,
            ConnState::StartingSyncS => ConnState::StartingSyncT,
            ConnState::StartingSyncT => ConnState::StartingSyncS,
            ConnState::Disconnecting => ConnState::TearDown,
            ConnState::VerifyS => ConnState::VerifyT,
            _ => ConnState::StandAlone,
        });
        let peer_isp = match (self.aftr_isp, self.user_isp) {
            (None, None) => None,
            (a, u) => Some(a.unwrap_or(false) | u.unwrap_or(false)),
        };
        Self {
            role: self.peer,
            peer: self.role,
            conn,
            disk: self.pdsk,
            pdsk: self.disk,
            susp: self.susp,
            aftr_isp: self.aftr_isp,
            peer_isp,
            user_isp: self.user_isp,
        }
    }
}

/// Result of a state change attempt.
///
/// Negative values are rejections, ordered as the stable codes reported
/// to administrative callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum SetStateCode {
    CwNoNeed = 4,
    CwSuccess = 3,
    NothingToDo = 2,
    Success = 1,
    UnknownError = 0,
    TwoPrimaries = -1,
    NoUpToDateDisk = -2,
    BothInconsistent = -4,
    SyncingDiskless = -5,
    ConnectedOutdates = -6,
    PrimaryNop = -7,
    ResyncRunning = -8,
    AlreadyStandAlone = -9,
    CwFailedByPeer = -10,
    IsDiskLess = -11,
    DeviceInUse = -12,
    NoNetConfig = -13,
    NoVerifyAlg = -14,
    NeedConnection = -15,
    LowerThanOutdated = -16,
    NotSupported = -17,
    InTransientState = -18,
    ConcurrentStChg = -19,
}

impl SetStateCode {
    /// Decode a reply code received from the peer.
    pub fn from_i32(v: i32) -> Option<Self> {
        use SetStateCode::*;
        Some(match v {
            4 => CwNoNeed,
            3 => CwSuccess,
            2 => NothingToDo,
            1 => Success,
            0 => UnknownError,
            -1 => TwoPrimaries,
            -2 => NoUpToDateDisk,
            -4 => BothInconsistent,
            -5 => SyncingDiskless,
            -6 => ConnectedOutdates,
            -7 => PrimaryNop,
            -8 => ResyncRunning,
            -9 => AlreadyStandAlone,
            -10 => CwFailedByPeer,
            -11 => IsDiskLess,
            -12 => DeviceInUse,
            -13 => NoNetConfig,
            -14 => NoVerifyAlg,
            -15 => NeedConnection,
            -16 => LowerThanOutdated,
            -17 => NotSupported,
            -18 => InTransientState,
            -19 => ConcurrentStChg,
            _ => return None,
        })
    }

    /// True for `Success` and the positive variants.
    pub fn is_success(self) -> bool {
        self as i32 >= SetStateCode::Success as i32
    }

    /// Stable human-readable reason.
    pub fn message(self) -> &'static str {
        use SetStateCode::*;
        match self {
            CwNoNeed => "No need for a cluster wide state change",
            CwSuccess => "Cluster wide state change succeeded",
            NothingToDo => "Nothing to do",
            Success => "Success",
            UnknownError => "Unknown error",
            TwoPrimaries => "Multiple primaries not allowed by config",
            NoUpToDateDisk => "Refusing to be Primary without at least one UpToDate disk",
            BothInconsistent => "Refusing to be inconsistent on both nodes",
            SyncingDiskless => "Refusing to be syncing and diskless",
            ConnectedOutdates => "Refusing to be Outdated while Connected",
            PrimaryNop => "Refusing to be Primary while peer is not outdated",
            ResyncRunning => "Can not start OV/resync since it is already active",
            AlreadyStandAlone => "Can not disconnect a StandAlone device",
            CwFailedByPeer => "State changed was refused by peer node",
            IsDiskLess => "Device is diskless, the requested operation requires a disk",
            DeviceInUse => "Device is held open by someone",
            NoNetConfig => "Have no net/connection configuration",
            NoVerifyAlg => "Need a verify algorithm to start online verify",
            NeedConnection => "Need a connection to start verify or resync",
            LowerThanOutdated => "Disk state is lower than outdated",
            NotSupported => "Peer does not support protocol",
            InTransientState => "In transient state, retry after next state change",
            ConcurrentStChg => "Concurrent state changes detected and aborted",
        }
    }

    /// `Ok(self)` for success codes, [`ReplError::StateRefused`] otherwise.
    pub fn into_result(self) -> ReplResult<SetStateCode> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ReplError::StateRefused { code: self })
        }
    }
}

impl fmt::Display for SetStateCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Configuration bits that validation depends on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateEnv {
    /// Two primaries allowed by the net config.
    pub two_primaries: bool,
    /// Number of local openers of the device.
    pub open_count: u32,
    /// Fencing policy of the attached disk (`DontCare` when diskless).
    pub fencing: FencingPolicy,
    /// An online-verify digest is configured.
    pub has_verify_alg: bool,
    /// Protocol version agreed with the peer.
    pub agreed_pro_version: u32,
    /// What to fall back to if the connection breaks while `Negotiating`:
    /// the remembered disk/pdsk when the data generation did not change,
    /// `None` when it did.
    pub negotiating_restore: Option<(DiskState, DiskState)>,
}

/// Outcome of the sanitizing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sanitized {
    /// The state after fix-ups.
    pub ns: DeviceState,
    /// Fields of the requested state that were overridden.
    pub overridden: Vec<&'static str>,
    /// Warnings to log if the change is committed.
    pub warnings: Vec<&'static str>,
}

/// Snap impossible combinations of a proposed state back into shape.
///
/// Pure function of `os`, the proposed `ns` and `env`. The caller learns
/// which requested fields were overridden through [`Sanitized::overridden`].
pub fn sanitize_state(os: &DeviceState, requested: &DeviceState, env: &StateEnv) -> Sanitized {
    use ConnState::*;
    use DiskState::*;

    let mut ns = *requested;
    let mut warnings = Vec::new();

    // an invalidate can not be used to connect
    if (ns.conn == StartingSyncS || ns.conn == StartingSyncT) && os.conn < Connected {
        ns.conn = os.conn;
        ns.pdsk = os.pdsk;
    }

    // network errors can not configure the network part
    if ns.conn.is_network_error() && os.conn <= Disconnecting {
        ns.conn = os.conn;
    }

    // after a network error only Unconnected or Disconnecting may follow
    if os.conn.is_network_error() && ns.conn != Unconnected && ns.conn != Disconnecting {
        ns.conn = os.conn;
    }

    // after Disconnecting only StandAlone may follow
    if os.conn == Disconnecting && ns.conn != StandAlone {
        ns.conn = os.conn;
    }

    if ns.conn < Connected {
        ns.peer_isp = false;
        ns.peer = Role::Unknown;
        if ns.pdsk > DUnknown || ns.pdsk < Inconsistent {
            ns.pdsk = DUnknown;
        }
    }

    if ns.conn <= Disconnecting && ns.disk == Diskless {
        ns.pdsk = DUnknown;
    }

    if os.conn > Connected && ns.conn > Connected && (ns.disk <= Failed || ns.pdsk <= Failed) {
        warnings.push("Resync aborted.");
        ns.conn = Connected;
    }

    if ns.conn >= Connected
        && (ns.disk == Consistent
            || ns.disk == Outdated
            || (ns.disk == Negotiating && ns.conn == WFBitMapT))
    {
        match ns.conn {
            WFBitMapT | PausedSyncT => ns.disk = Outdated,
            Connected | WFBitMapS | SyncSource | PausedSyncS => ns.disk = UpToDate,
            SyncTarget => {
                ns.disk = Inconsistent;
                warnings.push("Implicit set disk state Inconsistent!");
            }
            _ => {}
        }
        if os.disk == Outdated && ns.disk == UpToDate {
            warnings.push("Implicit set disk from Outdate to UpToDate");
        }
    }

    if ns.conn >= Connected && (ns.pdsk == Consistent || ns.pdsk == Outdated) {
        match ns.conn {
            Connected | WFBitMapT | PausedSyncT | SyncTarget => ns.pdsk = UpToDate,
            WFBitMapS | PausedSyncS => ns.pdsk = Outdated,
            SyncSource => {
                ns.pdsk = Inconsistent;
                warnings.push("Implicit set pdsk Inconsistent!");
            }
            _ => {}
        }
        if os.pdsk == Outdated && ns.pdsk == UpToDate {
            warnings.push("Implicit set pdsk from Outdate to UpToDate");
        }
    }

    // connection broke before negotiation finished
    if ns.conn < Connected && ns.disk == Negotiating {
        match env.negotiating_restore {
            Some((disk, pdsk)) => {
                ns.disk = disk;
                ns.pdsk = pdsk;
            }
            None => {
                warnings.push("Connection lost while negotiating, no data!");
                ns.disk = Diskless;
                ns.pdsk = DUnknown;
            }
        }
    }

    if env.fencing == FencingPolicy::ResourceAndStonith
        && ns.role == Role::Primary
        && ns.conn < Connected
        && ns.pdsk > Outdated
    {
        ns.susp = true;
    }

    if ns.is_paused() {
        if ns.conn == SyncSource {
            ns.conn = PausedSyncS;
        }
        if ns.conn == SyncTarget {
            ns.conn = PausedSyncT;
        }
    } else {
        if ns.conn == PausedSyncS {
            ns.conn = SyncSource;
        }
        if ns.conn == PausedSyncT {
            ns.conn = SyncTarget;
        }
    }

    // only report fields the caller asked to change that ended up different
    let overridden = requested
        .changed_fields(&ns)
        .into_iter()
        .filter(|f| requested.changed_fields(os).contains(f))
        .collect();

    Sanitized {
        ns,
        overridden,
        warnings,
    }
}

/// Check a proposed state on its own.
pub fn is_valid_state(ns: &DeviceState, env: &StateEnv) -> SetStateCode {
    use ConnState::*;
    use DiskState::*;
    use SetStateCode as S;

    if !env.two_primaries && ns.role == Role::Primary && ns.peer == Role::Primary {
        return S::TwoPrimaries;
    }

    if ns.role == Role::Secondary && env.open_count > 0 {
        S::DeviceInUse
    } else if ns.role == Role::Primary && ns.conn < Connected && ns.disk < UpToDate {
        S::NoUpToDateDisk
    } else if env.fencing >= FencingPolicy::ResourceOnly
        && ns.role == Role::Primary
        && ns.conn < Connected
        && ns.pdsk >= DUnknown
    {
        S::PrimaryNop
    } else if ns.role == Role::Primary && ns.disk <= Inconsistent && ns.pdsk <= Inconsistent {
        S::NoUpToDateDisk
    } else if ns.conn > Connected && ns.disk < UpToDate && ns.pdsk < UpToDate {
        S::BothInconsistent
    } else if ns.conn > Connected && (ns.disk == Diskless || ns.pdsk == Diskless) {
        S::SyncingDiskless
    } else if matches!(ns.conn, Connected | WFBitMapS | SyncSource | PausedSyncS)
        && ns.disk == Outdated
    {
        S::ConnectedOutdates
    } else if ns.conn.is_verify() && !env.has_verify_alg {
        S::NoVerifyAlg
    } else if ns.conn.is_verify() && env.agreed_pro_version < 88 {
        S::NotSupported
    } else {
        S::Success
    }
}

/// Check the step from `os` to `ns`.
///
/// Later rules take precedence over earlier ones.
pub fn is_valid_state_transition(ns: &DeviceState, os: &DeviceState) -> SetStateCode {
    use ConnState::*;
    use DiskState::*;
    use SetStateCode as S;

    let mut rv = S::Success;

    if (ns.conn == StartingSyncT || ns.conn == StartingSyncS) && os.conn > Connected {
        rv = S::ResyncRunning;
    }
    if ns.conn == Disconnecting && os.conn == StandAlone {
        rv = S::AlreadyStandAlone;
    }
    if ns.disk > Attaching && os.disk == Diskless {
        rv = S::IsDiskLess;
    }
    if ns.conn == WFConnection && os.conn < Unconnected {
        rv = S::NoNetConfig;
    }
    if ns.disk == Outdated && os.disk < Outdated && os.disk != Attaching {
        rv = S::LowerThanOutdated;
    }
    if ns.conn == Disconnecting && os.conn == Unconnected {
        rv = S::InTransientState;
    }
    if ns.conn == os.conn && ns.conn == WFReportParams {
        rv = S::InTransientState;
    }
    if ns.conn.is_verify() && os.conn < Connected {
        rv = S::NeedConnection;
    }
    if ns.conn.is_verify() && ns.conn != os.conn && os.conn > Connected {
        rv = S::ResyncRunning;
    }
    if (ns.conn == StartingSyncS || ns.conn == StartingSyncT) && os.conn < Connected {
        rv = S::NeedConnection;
    }
    rv
}

/// Whether the step from `os` to `ns` needs the peer's agreement.
pub fn is_cluster_wide(os: &DeviceState, ns: &DeviceState) -> bool {
    use ConnState::*;

    (os.conn >= Connected
        && ns.conn >= Connected
        && ((os.role != Role::Primary && ns.role == Role::Primary)
            || (os.conn != StartingSyncT && ns.conn == StartingSyncT)
            || (os.conn != StartingSyncS && ns.conn == StartingSyncS)
            || (os.disk != DiskState::Diskless && ns.disk == DiskState::Diskless)))
        || (os.conn >= Connected && ns.conn == Disconnecting)
        || (os.conn == Connected && ns.conn == VerifyS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> DeviceState {
        DeviceState {
            role: Role::Secondary,
            peer: Role::Secondary,
            conn: ConnState::Connected,
            disk: DiskState::UpToDate,
            pdsk: DiskState::UpToDate,
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_state() {
        let s = DeviceState::default();
        assert_eq!(s.role, Role::Secondary);
        assert_eq!(s.peer, Role::Unknown);
        assert_eq!(s.conn, ConnState::StandAlone);
        assert_eq!(s.disk, DiskState::Diskless);
        assert_eq!(s.pdsk, DiskState::DUnknown);
        assert!(!s.susp);
    }

    #[test]
    fn test_pack_unpack() {
        let s = DeviceState {
            role: Role::Primary,
            peer: Role::Secondary,
            conn: ConnState::PausedSyncT,
            disk: DiskState::Inconsistent,
            pdsk: DiskState::UpToDate,
            susp: true,
            aftr_isp: false,
            peer_isp: true,
            user_isp: false,
        };
        assert_eq!(DeviceState::unpack(s.pack()).unwrap(), s);
        assert_eq!(DeviceState::default().pack() & 0x3, Role::Secondary as u32);
    }

    #[test]
    fn test_unpack_rejects_bad_enum() {
        // conn value 31 does not exist
        assert!(DeviceState::unpack(31 << 4).is_err());
        // role value 3 does not exist
        assert!(DeviceState::unpack(3).is_err());
    }

    #[test]
    fn test_change_mask_val_round_trip() {
        let c = StateChange::new().role(Role::Primary).pdsk(DiskState::Outdated);
        let back = StateChange::from_wire(c.mask(), c.val()).unwrap();
        assert_eq!(back, c);
        let os = connected();
        let packed = (os.pack() & !c.mask()) | c.val();
        assert_eq!(DeviceState::unpack(packed).unwrap(), c.apply(&os));
    }

    #[test]
    fn test_from_wire_rejects_partial_fields() {
        assert!(StateChange::from_wire(0x1, 0x1).is_err());
        assert!(StateChange::from_wire(0x3, 0x4).is_err());
        assert!(StateChange::from_wire(1 << 30, 0).is_err());
    }

    #[test]
    fn test_convert_from_peer() {
        let c = StateChange::new()
            .role(Role::Primary)
            .conn(ConnState::StartingSyncS)
            .disk(DiskState::UpToDate);
        let m = c.convert_from_peer();
        assert_eq!(m.peer, Some(Role::Primary));
        assert_eq!(m.role, None);
        assert_eq!(m.conn, Some(ConnState::StartingSyncT));
        assert_eq!(m.pdsk, Some(DiskState::UpToDate));
        assert_eq!(m.disk, None);

        let d = StateChange::new().conn(ConnState::Disconnecting).convert_from_peer();
        assert_eq!(d.conn, Some(ConnState::TearDown));

        let p = StateChange::new().user_isp(true).convert_from_peer();
        assert_eq!(p.peer_isp, Some(true));
    }

    #[test]
    fn test_two_primaries() {
        let mut ns = connected();
        ns.role = Role::Primary;
        ns.peer = Role::Primary;
        let env = StateEnv::default();
        assert_eq!(is_valid_state(&ns, &env), SetStateCode::TwoPrimaries);
        let env = StateEnv {
            two_primaries: true,
            ..Default::default()
        };
        assert_eq!(is_valid_state(&ns, &env), SetStateCode::Success);
    }

    #[test]
    fn test_primary_needs_up_to_date() {
        let ns = DeviceState {
            role: Role::Primary,
            disk: DiskState::Inconsistent,
            ..Default::default()
        };
        assert_eq!(is_valid_state(&ns, &StateEnv::default()), SetStateCode::NoUpToDateDisk);
    }

    #[test]
    fn test_primary_nop_with_fencing() {
        let ns = DeviceState {
            role: Role::Primary,
            disk: DiskState::UpToDate,
            conn: ConnState::WFConnection,
            ..Default::default()
        };
        let env = StateEnv {
            fencing: FencingPolicy::ResourceOnly,
            ..Default::default()
        };
        assert_eq!(is_valid_state(&ns, &env), SetStateCode::PrimaryNop);
        assert_eq!(is_valid_state(&ns, &StateEnv::default()), SetStateCode::Success);
    }

    #[test]
    fn test_device_in_use() {
        let env = StateEnv {
            open_count: 1,
            ..Default::default()
        };
        assert_eq!(is_valid_state(&connected(), &env), SetStateCode::DeviceInUse);
    }

    #[test]
    fn test_verify_needs_alg_and_version() {
        let mut ns = connected();
        ns.conn = ConnState::VerifyS;
        let mut env = StateEnv {
            agreed_pro_version: 88,
            ..Default::default()
        };
        assert_eq!(is_valid_state(&ns, &env), SetStateCode::NoVerifyAlg);
        env.has_verify_alg = true;
        assert_eq!(is_valid_state(&ns, &env), SetStateCode::Success);
        env.agreed_pro_version = 87;
        assert_eq!(is_valid_state(&ns, &env), SetStateCode::NotSupported);
    }

    #[test]
    fn test_transition_rules() {
        let os = DeviceState::default();
        let ns = StateChange::new().conn(ConnState::Disconnecting).apply(&os);
        assert_eq!(is_valid_state_transition(&ns, &os), SetStateCode::AlreadyStandAlone);

        let ns = StateChange::new().conn(ConnState::WFConnection).apply(&os);
        assert_eq!(is_valid_state_transition(&ns, &os), SetStateCode::NoNetConfig);

        let ns = StateChange::new().disk(DiskState::UpToDate).apply(&os);
        assert_eq!(is_valid_state_transition(&ns, &os), SetStateCode::IsDiskLess);

        let mut os = connected();
        os.conn = ConnState::SyncSource;
        let ns = StateChange::new().conn(ConnState::StartingSyncS).apply(&os);
        assert_eq!(is_valid_state_transition(&ns, &os), SetStateCode::ResyncRunning);

        let os = DeviceState {
            conn: ConnState::Unconnected,
            ..Default::default()
        };
        let ns = StateChange::new().conn(ConnState::Disconnecting).apply(&os);
        assert_eq!(is_valid_state_transition(&ns, &os), SetStateCode::InTransientState);
    }

    #[test]
    fn test_cluster_wide_decision() {
        let os = connected();
        let ns = StateChange::new().role(Role::Primary).apply(&os);
        assert!(is_cluster_wide(&os, &ns));
        let ns = StateChange::new().conn(ConnState::Disconnecting).apply(&os);
        assert!(is_cluster_wide(&os, &ns));
        let ns = StateChange::new().conn(ConnState::VerifyS).apply(&os);
        assert!(is_cluster_wide(&os, &ns));
        let ns = StateChange::new().user_isp(true).apply(&os);
        assert!(!is_cluster_wide(&os, &ns));

        let os = DeviceState {
            disk: DiskState::UpToDate,
            ..Default::default()
        };
        let ns = StateChange::new().role(Role::Primary).apply(&os);
        assert!(!is_cluster_wide(&os, &ns));
    }

    #[test]
    fn test_sanitize_network_error_sequence() {
        let os = DeviceState {
            conn: ConnState::BrokenPipe,
            ..Default::default()
        };
        let req = StateChange::new().conn(ConnState::Connected).apply(&os);
        let s = sanitize_state(&os, &req, &StateEnv::default());
        assert_eq!(s.ns.conn, ConnState::BrokenPipe);
        assert_eq!(s.overridden, vec!["conn"]);

        let req = StateChange::new().conn(ConnState::Unconnected).apply(&os);
        let s = sanitize_state(&os, &req, &StateEnv::default());
        assert_eq!(s.ns.conn, ConnState::Unconnected);
        assert!(s.overridden.is_empty());
    }

    #[test]
    fn test_sanitize_after_disconnecting_only_standalone() {
        let os = DeviceState {
            conn: ConnState::Disconnecting,
            ..Default::default()
        };
        let req = StateChange::new().conn(ConnState::WFConnection).apply(&os);
        assert_eq!(sanitize_state(&os, &req, &StateEnv::default()).ns.conn, ConnState::Disconnecting);
    }

    #[test]
    fn test_sanitize_below_connected_clears_peer() {
        let os = connected();
        let req = StateChange::new().conn(ConnState::NetworkFailure).apply(&os);
        let s = sanitize_state(&os, &req, &StateEnv::default());
        assert_eq!(s.ns.peer, Role::Unknown);
        assert_eq!(s.ns.pdsk, DiskState::DUnknown);
    }

    #[test]
    fn test_sanitize_promotes_consistent_when_connected() {
        let mut os = connected();
        os.disk = DiskState::Outdated;
        os.conn = ConnState::WFReportParams;
        let req = StateChange::new().conn(ConnState::Connected).disk(DiskState::Consistent).apply(&os);
        let s = sanitize_state(&os, &req, &StateEnv::default());
        assert_eq!(s.ns.disk, DiskState::UpToDate);
        assert!(s.warnings.contains(&"Implicit set disk from Outdate to UpToDate"));
        assert_eq!(s.overridden, vec!["disk"]);
    }

    #[test]
    fn test_sanitize_aborts_resync_on_peer_disk_loss() {
        let mut os = connected();
        os.conn = ConnState::SyncSource;
        os.pdsk = DiskState::Inconsistent;
        let req = StateChange::new().pdsk(DiskState::Failed).apply(&os);
        let s = sanitize_state(&os, &req, &StateEnv::default());
        assert_eq!(s.ns.conn, ConnState::Connected);
        assert!(s.warnings.contains(&"Resync aborted."));
    }

    #[test]
    fn test_sanitize_pause_flags() {
        let mut os = connected();
        os.conn = ConnState::SyncTarget;
        os.disk = DiskState::Inconsistent;
        let req = StateChange::new().user_isp(true).apply(&os);
        assert_eq!(sanitize_state(&os, &req, &StateEnv::default()).ns.conn, ConnState::PausedSyncT);

        let mut os = req;
        os.conn = ConnState::PausedSyncT;
        let req = StateChange::new().user_isp(false).apply(&os);
        assert_eq!(sanitize_state(&os, &req, &StateEnv::default()).ns.conn, ConnState::SyncTarget);
    }

    #[test]
    fn test_sanitize_negotiating_lost() {
        let os = DeviceState {
            conn: ConnState::WFReportParams,
            disk: DiskState::Negotiating,
            ..Default::default()
        };
        let req = StateChange::new().conn(ConnState::NetworkFailure).apply(&os);
        let s = sanitize_state(&os, &req, &StateEnv::default());
        assert_eq!(s.ns.disk, DiskState::Diskless);

        let env = StateEnv {
            negotiating_restore: Some((DiskState::UpToDate, DiskState::DUnknown)),
            ..Default::default()
        };
        assert_eq!(sanitize_state(&os, &req, &env).ns.disk, DiskState::UpToDate);
    }

    #[test]
    fn test_sanitize_stonith_suspends() {
        let os = DeviceState {
            role: Role::Primary,
            peer: Role::Secondary,
            conn: ConnState::Connected,
            disk: DiskState::UpToDate,
            pdsk: DiskState::UpToDate,
            ..Default::default()
        };
        let req = StateChange::new().conn(ConnState::NetworkFailure).apply(&os);
        let env = StateEnv {
            fencing: FencingPolicy::ResourceAndStonith,
            ..Default::default()
        };
        let s = sanitize_state(&os, &req, &env);
        // pdsk drops to DUnknown which is above Outdated
        assert!(s.ns.susp);
    }

    #[test]
    fn test_set_state_code_helpers() {
        assert!(SetStateCode::CwSuccess.is_success());
        assert!(!SetStateCode::UnknownError.is_success());
        assert!(SetStateCode::Success.into_result().is_ok());
        assert!(SetStateCode::NothingToDo.into_result().is_ok());
        assert!(SetStateCode::PrimaryNop.into_result().is_err());
        for v in -19..=4 {
            if let Some(c) = SetStateCode::from_i32(v) {
                assert_eq!(c as i32, v);
            }
        }
        assert_eq!(SetStateCode::from_i32(-3), None);
    }

    #[test]
    fn test_describe_change() {
        let os = DeviceState::default();
        let ns = StateChange::new().role(Role::Primary).disk(DiskState::UpToDate).apply(&os);
        assert_eq!(
            DeviceState::describe_change(&os, &ns),
            "role( Secondary -> Primary ) disk( Diskless -> UpToDate )"
        );
        assert_eq!(
            DeviceState::default().to_string(),
            "{ cs:StandAlone ro:Secondary/Unknown ds:Diskless/DUnknown r--- }"
        );
    }
}
