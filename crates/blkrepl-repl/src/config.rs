//! Node, disk, network and sync configuration.
//!
//! Configuration files are TOML or JSON, picked by extension. Every section
//! has a `validate()` that checks ranges before the values reach a device.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ReplError, ReplResult};
use crate::split_brain::{AfterSbPolicy, SbSlot};

/// Digest algorithms available for authentication, verify and checksums.
pub const SUPPORTED_DIGESTS: &[&str] = &["sha256"];

/// Minimum resync rate in KiB/s.
pub const RATE_MIN: u32 = 1;
/// Maximum resync rate in KiB/s.
pub const RATE_MAX: u32 = 4_194_304;
/// Minimum number of activity-log extents.
pub const AL_EXTENTS_MIN: u32 = 7;
/// Maximum number of activity-log extents.
pub const AL_EXTENTS_MAX: u32 = 3833;

/// What to do when the backing device reports an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnIoError {
    /// Report the error upwards and keep the disk.
    #[default]
    PassOn,
    /// Run the "local-io-error" helper and detach.
    CallHelper,
    /// Detach the disk.
    Detach,
}

/// How a Primary deals with losing its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FencingPolicy {
    /// Do nothing.
    #[default]
    DontCare,
    /// Try to outdate the peer before continuing as Primary.
    ResourceOnly,
    /// Suspend I/O until the peer is outdated.
    ResourceAndStonith,
}

/// Write replication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u32)]
pub enum WireProtocol {
    /// Complete once written locally and sent.
    A = 1,
    /// Complete once the peer received the data.
    B = 2,
    /// Complete once the peer wrote the data.
    #[default]
    C = 3,
}

impl WireProtocol {
    /// Decode the wire value.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(WireProtocol::A),
            2 => Some(WireProtocol::B),
            3 => Some(WireProtocol::C),
            _ => None,
        }
    }
}

/// Reaction of a Primary that would have to become sync target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RrConflict {
    /// Drop the connection.
    #[default]
    Disconnect,
    /// Run the "pri-lost" helper, then drop the connection.
    CallHelper,
    /// Become sync target anyway.
    Violently,
}

/// Shared secret for peer authentication, wiped from memory on drop.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SharedSecret(String);

impl SharedSecret {
    /// Wrap a secret.
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Secret bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// True if no secret is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Backing device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Usable size in sectors, 0 for the whole backing device.
    pub size_sect: u64,
    /// Limit on segments per request, 0 for no limit.
    pub max_bio_bvecs: u32,
    /// Local I/O error policy.
    pub on_io_error: OnIoError,
    /// Fencing policy.
    pub fencing: FencingPolicy,
    /// Never use barrier writes.
    pub no_disk_barrier: bool,
    /// Never flush the backing device.
    pub no_disk_flush: bool,
    /// Never drain before completing an epoch.
    pub no_disk_drain: bool,
    /// Do not flush after meta data writes.
    pub no_md_flush: bool,
    /// Backing data file.
    pub data_path: Option<PathBuf>,
    /// Meta data file.
    pub meta_path: Option<PathBuf>,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            size_sect: 0,
            max_bio_bvecs: 0,
            on_io_error: OnIoError::PassOn,
            fencing: FencingPolicy::DontCare,
            no_disk_barrier: false,
            no_disk_flush: false,
            no_disk_drain: false,
            no_md_flush: false,
            data_path: None,
            meta_path: None,
        }
    }
}

impl DiskConfig {
    /// Check values.
    pub fn validate(&self) -> ReplResult<()> {
        if self.data_path.is_some() != self.meta_path.is_some() {
            return Err(config_err("data_path and meta_path must be given together"));
        }
        if self.data_path.is_some() && self.data_path == self.meta_path {
            return Err(config_err("data and meta data must live in different files"));
        }
        Ok(())
    }
}

/// Network and peer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Replication protocol.
    pub protocol: WireProtocol,
    /// Shared secret; authentication is skipped when empty.
    pub shared_secret: SharedSecret,
    /// Digest used for challenge/response authentication.
    pub cram_hmac_alg: Option<String>,
    /// Allow both nodes to be Primary.
    pub two_primaries: bool,
    /// Split-brain policy with no Primary.
    pub after_sb_0p: AfterSbPolicy,
    /// Split-brain policy with one Primary.
    pub after_sb_1p: AfterSbPolicy,
    /// Split-brain policy with two Primaries.
    pub after_sb_2p: AfterSbPolicy,
    /// Reaction of a Primary that would become sync target.
    pub rr_conflict: RrConflict,
    /// Volunteer to be the sync target after split brain.
    pub want_lose: bool,
    /// Apply automatic recovery also when the histories are ambiguous.
    pub always_asbp: bool,
    /// Digest over replicated data blocks.
    pub integrity_alg: Option<String>,
    /// Time to wait for a peer reply.
    pub timeout_ms: u64,
    /// Interval between keep-alive pings.
    pub ping_int_ms: u64,
    /// Writes per epoch before a barrier is issued.
    pub max_epoch_size: u32,
    /// Upper bound on in-flight receive buffers.
    pub max_buffers: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::C,
            shared_secret: SharedSecret::default(),
            cram_hmac_alg: None,
            two_primaries: false,
            after_sb_0p: AfterSbPolicy::Disconnect,
            after_sb_1p: AfterSbPolicy::Disconnect,
            after_sb_2p: AfterSbPolicy::Disconnect,
            rr_conflict: RrConflict::Disconnect,
            want_lose: false,
            always_asbp: false,
            integrity_alg: None,
            timeout_ms: 6_000,
            ping_int_ms: 10_000,
            max_epoch_size: 2048,
            max_buffers: 2048,
        }
    }
}

impl NetConfig {
    /// Check values.
    pub fn validate(&self) -> ReplResult<()> {
        for (slot, policy) in [
            (SbSlot::ZeroPrimaries, self.after_sb_0p),
            (SbSlot::OnePrimary, self.after_sb_1p),
            (SbSlot::TwoPrimaries, self.after_sb_2p),
        ] {
            if !policy.valid_for(slot) {
                return Err(config_err(format!("{policy:?} is not valid for {slot:?}")));
            }
        }
        if self.two_primaries && self.protocol != WireProtocol::C {
            return Err(config_err("two_primaries requires protocol C"));
        }
        check_digest("cram_hmac_alg", self.cram_hmac_alg.as_deref())?;
        check_digest("integrity_alg", self.integrity_alg.as_deref())?;
        if !self.shared_secret.is_empty() && self.cram_hmac_alg.is_none() {
            return Err(config_err("shared_secret needs cram_hmac_alg"));
        }
        check_range("timeout_ms", self.timeout_ms, 100, 60_000)?;
        check_range("ping_int_ms", self.ping_int_ms, 1_000, 120_000)?;
        check_range("max_epoch_size", self.max_epoch_size as u64, 1, 20_000)?;
        check_range("max_buffers", self.max_buffers as u64, 32, 131_072)?;
        Ok(())
    }

    /// True if a challenge/response exchange is configured.
    pub fn wants_auth(&self) -> bool {
        !self.shared_secret.is_empty()
    }
}

/// Resynchronization configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Resync rate in KiB/s.
    pub rate_kbps: u32,
    /// Minor of the device this one syncs after.
    pub after: Option<u32>,
    /// Digest for online verify.
    pub verify_alg: Option<String>,
    /// Digest for checksum-based resync.
    pub csums_alg: Option<String>,
    /// Activity-log size in extents.
    pub al_extents: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rate_kbps: 250,
            after: None,
            verify_alg: None,
            csums_alg: None,
            al_extents: 127,
        }
    }
}

impl SyncConfig {
    /// Check values.
    pub fn validate(&self) -> ReplResult<()> {
        check_range("rate_kbps", self.rate_kbps as u64, RATE_MIN as u64, RATE_MAX as u64)?;
        check_range(
            "al_extents",
            self.al_extents as u64,
            AL_EXTENTS_MIN as u64,
            AL_EXTENTS_MAX as u64,
        )?;
        check_digest("verify_alg", self.verify_alg.as_deref())?;
        check_digest("csums_alg", self.csums_alg.as_deref())?;
        Ok(())
    }
}

/// One replicated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device minor number.
    pub minor: u32,
    /// Resource name.
    #[serde(default)]
    pub name: String,
    /// Backing disk.
    #[serde(default)]
    pub disk: Option<DiskConfig>,
    /// Peer link.
    #[serde(default)]
    pub net: Option<NetConfig>,
    /// Resync settings.
    #[serde(default)]
    pub sync: SyncConfig,
}

impl DeviceConfig {
    /// A device with no disk and no network.
    pub fn new(minor: u32) -> Self {
        Self {
            minor,
            name: format!("r{minor}"),
            disk: None,
            net: None,
            sync: SyncConfig::default(),
        }
    }

    /// Check all sections.
    pub fn validate(&self) -> ReplResult<()> {
        if let Some(disk) = &self.disk {
            disk.validate()?;
        }
        if let Some(net) = &self.net {
            net.validate()?;
        }
        self.sync.validate()?;
        if self.sync.after == Some(self.minor) {
            return Err(config_err(format!("device {} can not sync after itself", self.minor)));
        }
        Ok(())
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's name.
    pub node_name: String,
    /// Program run for helper events, none to skip them.
    pub helper_program: Option<PathBuf>,
    /// Replicated devices.
    pub devices: Vec<DeviceConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: String::from("localhost"),
            helper_program: None,
            devices: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> ReplResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| config_err(e.to_string()))?,
            "json" => serde_json::from_str(&contents).map_err(|e| config_err(e.to_string()))?,
            _ => return Err(config_err(format!("unsupported config file extension: {ext}"))),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every device and the uniqueness of minors.
    pub fn validate(&self) -> ReplResult<()> {
        let mut seen = std::collections::HashSet::new();
        for dev in &self.devices {
            if !seen.insert(dev.minor) {
                return Err(config_err(format!("duplicate minor {}", dev.minor)));
            }
            dev.validate()?;
        }
        Ok(())
    }

    /// Look up a device by minor.
    pub fn device(&self, minor: u32) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.minor == minor)
    }
}

fn config_err(msg: impl Into<String>) -> ReplError {
    ReplError::Config { msg: msg.into() }
}

fn check_range(name: &str, v: u64, min: u64, max: u64) -> ReplResult<()> {
    if v < min || v > max {
        return Err(config_err(format!("{name} = {v} not in {min}..={max}")));
    }
    Ok(())
}

fn check_digest(name: &str, alg: Option<&str>) -> ReplResult<()> {
    match alg {
        Some(a) if !SUPPORTED_DIGESTS.contains(&a) => {
            Err(config_err(format!("{name}: digest {a:?} not available")))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        assert!(DiskConfig::default().validate().is_ok());
        assert!(NetConfig::default().validate().is_ok());
        assert!(SyncConfig::default().validate().is_ok());
        assert!(NodeConfig::default().validate().is_ok());
        assert_eq!(NetConfig::default().protocol, WireProtocol::C);
    }

    #[test]
    fn test_sb_policy_slots_checked() {
        let net = NetConfig {
            after_sb_0p: AfterSbPolicy::Consensus,
            ..Default::default()
        };
        assert!(matches!(net.validate(), Err(ReplError::Config { .. })));
        let net = NetConfig {
            after_sb_1p: AfterSbPolicy::DiscardSecondary,
            after_sb_2p: AfterSbPolicy::CallHelper,
            ..Default::default()
        };
        assert!(net.validate().is_ok());
    }

    #[test]
    fn test_ranges() {
        let sync = SyncConfig {
            al_extents: 3,
            ..Default::default()
        };
        assert!(sync.validate().is_err());
        let sync = SyncConfig {
            verify_alg: Some("md5".into()),
            ..Default::default()
        };
        assert!(sync.validate().is_err());
        let net = NetConfig {
            max_epoch_size: 0,
            ..Default::default()
        };
        assert!(net.validate().is_err());
    }

    #[test]
    fn test_secret_needs_alg_and_is_redacted() {
        let mut net = NetConfig {
            shared_secret: SharedSecret::new("hunter2"),
            ..Default::default()
        };
        assert!(net.validate().is_err());
        net.cram_hmac_alg = Some("sha256".into());
        assert!(net.validate().is_ok());
        assert!(!format!("{net:?}").contains("hunter2"));
    }

    #[test]
    fn test_duplicate_minor_rejected() {
        let cfg = NodeConfig {
            devices: vec![DeviceConfig::new(0), DeviceConfig::new(0)],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
node_name = "alpha"

[[devices]]
minor = 0
name = "r0"

[devices.disk]
on_io_error = "detach"
fencing = "resource_only"

[devices.net]
protocol = "B"
after_sb_1p = "discard_secondary"
shared_secret = "s3cret"
cram_hmac_alg = "sha256"

[devices.sync]
rate_kbps = 10000
verify_alg = "sha256"
            "#
        )
        .unwrap();

        let cfg = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.node_name, "alpha");
        let dev = cfg.device(0).unwrap();
        let disk = dev.disk.as_ref().unwrap();
        assert_eq!(disk.on_io_error, OnIoError::Detach);
        assert_eq!(disk.fencing, FencingPolicy::ResourceOnly);
        let net = dev.net.as_ref().unwrap();
        assert_eq!(net.protocol, WireProtocol::B);
        assert_eq!(net.after_sb_1p, AfterSbPolicy::DiscardSecondary);
        assert_eq!(net.shared_secret.as_bytes(), b"s3cret");
        assert_eq!(dev.sync.rate_kbps, 10000);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{ "node_name": "beta", "devices": [ {{ "minor": 3, "sync": {{ "after": 1 }} }} ] }}"#
        )
        .unwrap();
        let cfg = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.devices[0].sync.after, Some(1));
    }

    #[test]
    fn test_from_file_bad_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            NodeConfig::from_file(file.path()),
            Err(ReplError::Config { .. })
        ));
    }
}
