//! All devices of a node.
//!
//! Devices are keyed by minor. The registry also implements resync-after
//! groups: a device whose `sync.after` names another device only syncs
//! while nothing earlier in that chain is syncing or paused.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::config::{NodeConfig, SyncConfig};
use crate::device::Device;
use crate::error::{ReplError, ReplResult, RetCode};
use crate::helper::{CommandHelper, Helper, NoopHelper};
use crate::state::{ConnState, DiskState, StateChange};

/// Device registry.
#[derive(Debug)]
pub struct Registry {
    devices: DashMap<u32, Arc<Device>>,
    helper: Arc<dyn Helper>,
}

impl Registry {
    /// An empty registry whose devices run helpers through `helper`.
    pub fn new(helper: Arc<dyn Helper>) -> Arc<Self> {
        Arc::new(Self {
            devices: DashMap::new(),
            helper,
        })
    }

    /// Create the devices named in `config`, unconfigured, with their
    /// resync settings applied. Needs a tokio runtime, see [`Device::new`].
    pub fn from_config(config: &NodeConfig) -> ReplResult<Arc<Self>> {
        config.validate()?;
        let helper: Arc<dyn Helper> = match &config.helper_program {
            Some(program) => Arc::new(CommandHelper::new(program)),
            None => Arc::new(NoopHelper),
        };
        let reg = Self::new(helper);
        for dc in &config.devices {
            reg.create_device(dc.minor, dc.name.clone())?;
        }
        for dc in &config.devices {
            reg.get(dc.minor)?.configure_sync(dc.sync.clone())?;
        }
        Ok(reg)
    }

    /// Create and register device `minor`. Needs a tokio runtime, see
    /// [`Device::new`].
    pub fn create_device(self: &Arc<Self>, minor: u32, name: impl Into<String>) -> ReplResult<Arc<Device>> {
        if self.devices.contains_key(&minor) {
            return Err(ReplError::admin(
                RetCode::ConfigInvalid,
                format!("minor {minor} already exists"),
            ));
        }
        let dev = Device::new(minor, name, Arc::clone(&self.helper));
        self.register(Arc::clone(&dev));
        Ok(dev)
    }

    /// Add an existing device.
    pub fn register(self: &Arc<Self>, dev: Arc<Device>) {
        *dev.registry.lock() = Arc::downgrade(self);
        info!(minor = dev.minor(), name = dev.name(), "device registered");
        self.devices.insert(dev.minor(), dev);
    }

    /// Remove device `minor`.
    pub fn remove(&self, minor: u32) -> Option<Arc<Device>> {
        self.devices.remove(&minor).map(|(_, dev)| dev)
    }

    /// Device `minor`.
    pub fn get(&self, minor: u32) -> ReplResult<Arc<Device>> {
        self.devices
            .get(&minor)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ReplError::admin(RetCode::MinorNotKnown, format!("unknown minor {minor}")))
    }

    /// Registered minors, sorted.
    pub fn minors(&self) -> Vec<u32> {
        let mut minors: Vec<u32> = self.devices.iter().map(|e| *e.key()).collect();
        minors.sort_unstable();
        minors
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True without devices.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Device>> {
        let mut devs: Vec<_> = self.devices.iter().map(|e| Arc::clone(e.value())).collect();
        devs.sort_by_key(|d| d.minor());
        devs
    }

    /// Whether no device earlier in `minor`'s resync-after chain is
    /// syncing or paused.
    pub fn may_sync_now(&self, minor: u32) -> bool {
        let Ok(mut dev) = self.get(minor) else {
            return true;
        };
        for _ in 0..=self.devices.len() {
            let Some(after) = dev.sync_config().after else {
                return true;
            };
            let Ok(odev) = self.get(after) else {
                return true;
            };
            let s = odev.state();
            if s.conn.is_resync() || s.is_paused() {
                return false;
            }
            dev = odev;
        }
        true
    }

    /// Check that `minor` may sync after `after`.
    pub fn check_sync_after(&self, minor: u32, after: Option<u32>) -> ReplResult<()> {
        let Some(mut next) = after else {
            return Ok(());
        };
        if self.get(next).is_err() {
            return Err(ReplError::admin(
                RetCode::SyncAfterInvalid,
                format!("resync-after device {next} does not exist"),
            ));
        }
        for _ in 0..=self.devices.len() {
            if next == minor {
                return Err(ReplError::admin(
                    RetCode::SyncAfterCycle,
                    format!("resync-after chain of {minor} is a cycle"),
                ));
            }
            let Some(after) = self.get(next).ok().and_then(|d| d.sync_config().after) else {
                return Ok(());
            };
            next = after;
        }
        Err(ReplError::admin(
            RetCode::SyncAfterCycle,
            format!("resync-after chain of {minor} is a cycle"),
        ))
    }

    fn unused(dev: &Device) -> bool {
        let s = dev.state();
        s.conn == ConnState::StandAlone && s.disk == DiskState::Diskless
    }

    /// Pause devices that may not sync now. Returns whether anything changed.
    pub fn suspend_other_sg(&self) -> bool {
        let mut changed = false;
        for dev in self.snapshot() {
            if Self::unused(&dev) || dev.state().aftr_isp {
                continue;
            }
            if !self.may_sync_now(dev.minor()) {
                debug!(minor = dev.minor(), "pausing resync, waiting for its resync-after device");
                changed |= dev.force_state(&StateChange::new().aftr_isp(true)).is_success();
            }
        }
        changed
    }

    /// Unpause devices that may sync now. Returns whether anything changed.
    pub fn resume_next_sg(&self) -> bool {
        let mut changed = false;
        for dev in self.snapshot() {
            if Self::unused(&dev) || !dev.state().aftr_isp {
                continue;
            }
            if self.may_sync_now(dev.minor()) {
                debug!(minor = dev.minor(), "resync-after device done, resuming");
                changed |= dev.force_state(&StateChange::new().aftr_isp(false)).is_success();
            }
        }
        changed
    }

    /// Re-evaluate all pause flags after a resync-after change.
    pub fn alter_sync_after(&self) {
        for _ in 0..=self.devices.len() {
            let changed = self.suspend_other_sg() | self.resume_next_sg();
            if !changed {
                break;
            }
        }
    }

    /// Validate `sync` for device `minor` against the other devices.
    pub(crate) fn check_sync_config(&self, minor: u32, sync: &SyncConfig) -> ReplResult<()> {
        self.check_sync_after(minor, sync.after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(n: u32) -> Arc<Registry> {
        let reg = Registry::new(Arc::new(NoopHelper));
        for minor in 0..n {
            reg.create_device(minor, format!("r{minor}")).unwrap();
        }
        reg
    }

    fn set_after(reg: &Registry, minor: u32, after: u32) {
        let dev = reg.get(minor).unwrap();
        dev.core.lock().sync.after = Some(after);
    }

    #[tokio::test]
    async fn test_lookup() {
        let reg = registry(3);
        assert_eq!(reg.minors(), vec![0, 1, 2]);
        assert_eq!(reg.get(1).unwrap().minor(), 1);
        assert_eq!(reg.get(7).unwrap_err().code(), RetCode::MinorNotKnown as i32);
        assert!(reg.create_device(1, "dup").is_err());
        assert!(reg.remove(1).is_some());
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn test_registered_device_knows_registry() {
        let reg = registry(1);
        let dev = reg.get(0).unwrap();
        assert!(dev.registry().is_some());
    }

    #[tokio::test]
    async fn test_sync_after_checks() {
        let reg = registry(3);
        assert!(reg.check_sync_after(0, None).is_ok());
        assert!(reg.check_sync_after(0, Some(1)).is_ok());
        assert_eq!(
            reg.check_sync_after(0, Some(9)).unwrap_err().code(),
            RetCode::SyncAfterInvalid as i32
        );
        set_after(&reg, 1, 2);
        set_after(&reg, 2, 0);
        assert_eq!(
            reg.check_sync_after(0, Some(1)).unwrap_err().code(),
            RetCode::SyncAfterCycle as i32
        );
    }

    #[tokio::test]
    async fn test_may_sync_follows_chain() {
        let reg = registry(3);
        set_after(&reg, 2, 1);
        set_after(&reg, 1, 0);
        assert!(reg.may_sync_now(2));

        let first = reg.get(0).unwrap();
        first.force_state(&StateChange::new().user_isp(true));
        assert!(!reg.may_sync_now(1));
        assert!(!reg.may_sync_now(2));
        assert!(reg.may_sync_now(0));
    }

    #[tokio::test]
    async fn test_unused_devices_not_paused() {
        let reg = registry(2);
        set_after(&reg, 1, 0);
        reg.get(0).unwrap().force_state(&StateChange::new().user_isp(true));
        // device 1 is StandAlone and Diskless
        assert!(!reg.suspend_other_sg());
        assert!(!reg.get(1).unwrap().state().aftr_isp);
    }
}
