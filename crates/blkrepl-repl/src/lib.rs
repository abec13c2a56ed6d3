#![warn(missing_docs)]

//! blkrepl replication subsystem: replicated device state machine, peer protocol, resync
//!
//! A [`Device`] mirrors a local block store to one peer. Writes are
//! replicated under protocol A, B or C, state changes are checked locally
//! and, when they involve the peer, agreed in two phases over the link.
//! After a disconnect the resync bitmap and the data generation UUIDs decide
//! which blocks move in which direction.

pub mod admin;
pub mod auth;
pub mod conduit;
pub mod config;
pub mod device;
pub mod epoch;
pub mod error;
pub mod handshake;
pub mod helper;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod resync;
pub mod split_brain;
pub mod state;
pub mod state_machine;
pub mod transfer_log;
pub mod uuid;

pub use admin::create_md;
pub use conduit::{Conduit, ConduitState, ConduitStats};
pub use config::{
    DeviceConfig, DiskConfig, FencingPolicy, NetConfig, NodeConfig, OnIoError, RrConflict, SharedSecret,
    SyncConfig, WireProtocol,
};
pub use device::{BackingDev, Device, ResyncStatus};
pub use epoch::WriteOrdering;
pub use error::{ReplError, ReplResult, RetCode};
pub use helper::{CommandHelper, Helper, NoopHelper, ScriptedHelper};
pub use registry::Registry;
pub use split_brain::AfterSbPolicy;
pub use state::{ConnState, DeviceState, DiskState, Role, SetStateCode, StateChange};
pub use state_machine::ChgFlags;
pub use transfer_log::WriteOutcome;
