//! In-process two-node run.
//!
//! Two devices on memory stores are connected through a conduit pair. The
//! run forces one node Primary, lets the initial full sync finish, writes
//! while connected, drops the link, writes while disconnected, reconnects
//! for a bitmap-based resync and ends with an online verify.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use blkrepl_repl::{
    create_md, BackingDev, Conduit, ConnState, Device, DeviceState, DiskConfig, DiskState, NetConfig,
    NoopHelper, Registry, Role, SyncConfig, WireProtocol,
};
use blkrepl_storage::{BlockStore, MemStore, MetaLayout, BM_SECT_PER_BIT, SECTOR_SIZE};
use bytes::Bytes;
use tracing::info;

const STEP_TIMEOUT: Duration = Duration::from_secs(30);
const META_SECTORS: u64 = 1024;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOpts {
    /// Device size in sectors.
    pub sectors: u64,
    /// Writes per phase.
    pub writes: u32,
    /// Replication protocol.
    pub protocol: WireProtocol,
}

/// What the run observed.
#[derive(Debug, Default)]
pub struct Report {
    /// Blocks copied by the initial full sync.
    pub initial_sync_blocks: u64,
    /// Duration of the initial full sync.
    pub initial_sync: Duration,
    /// Blocks dirtied while disconnected.
    pub dirty_after_disconnect: u64,
    /// Duration of the bitmap resync.
    pub resync: Duration,
    /// Blocks online verify found different.
    pub verify_out_of_sync: u64,
    /// Both data stores compared equal at the end.
    pub identical: bool,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "initial sync:     {} blocks in {:?}",
            self.initial_sync_blocks, self.initial_sync
        )?;
        writeln!(
            f,
            "resync:           {} blocks in {:?}",
            self.dirty_after_disconnect, self.resync
        )?;
        writeln!(f, "verify:           {} blocks out of sync", self.verify_out_of_sync)?;
        write!(f, "data identical:   {}", if self.identical { "yes" } else { "NO" })
    }
}

async fn node(sectors: u64, minor: u32, sync: &SyncConfig) -> Result<(Arc<Registry>, Arc<Device>)> {
    let reg = Registry::new(Arc::new(NoopHelper));
    let dev = reg.create_device(minor, format!("sim{minor}"))?;
    let backing = BackingDev {
        data: Arc::new(MemStore::new(sectors)),
        meta: Arc::new(MemStore::new(META_SECTORS)),
        layout: MetaLayout::external(META_SECTORS),
    };
    create_md(&backing, rand::random())?;
    dev.attach_disk(backing, DiskConfig::default()).await?;
    dev.configure_sync(sync.clone())?;
    Ok((reg, dev))
}

async fn wait(dev: &Device, what: &str, pred: impl Fn(&DeviceState) -> bool) -> Result<DeviceState> {
    match tokio::time::timeout(STEP_TIMEOUT, dev.wait_state(pred)).await {
        Ok(s) => Ok(s),
        Err(_) => bail!("{} did not reach {what} in time, state {:?}", dev.name(), dev.state()),
    }
}

fn synced(s: &DeviceState) -> bool {
    s.conn == ConnState::Connected && s.disk == DiskState::UpToDate && s.pdsk == DiskState::UpToDate
}

async fn connect(x: &Arc<Device>, y: &Arc<Device>) -> Result<()> {
    let (a, b) = Conduit::new_pair("sim0", "sim1");
    let (rx, ry) = tokio::join!(x.connect(a), y.connect(b));
    rx.context("connecting sim0")?;
    ry.context("connecting sim1")?;
    Ok(())
}

async fn write_blocks(dev: &Device, sectors: u64, count: u32, fill: u8) -> Result<()> {
    let blocks = sectors / BM_SECT_PER_BIT;
    for i in 0..count as u64 {
        let block = (i * 7919 + fill as u64) % blocks;
        let data = Bytes::from(vec![fill.wrapping_add(i as u8); BM_SECT_PER_BIT as usize * SECTOR_SIZE]);
        dev.submit_write(block * BM_SECT_PER_BIT, data).await?;
    }
    Ok(())
}

fn stores_equal(x: &Device, y: &Device, sectors: u64) -> Result<bool> {
    let (Some(a), Some(b)) = (x.data_store(), y.data_store()) else {
        bail!("a node lost its disk");
    };
    let chunk = 64u64;
    let mut ba = vec![0u8; chunk as usize * SECTOR_SIZE];
    let mut bb = ba.clone();
    let mut sector = 0;
    while sector < sectors {
        let n = chunk.min(sectors - sector) as usize * SECTOR_SIZE;
        a.read_at(sector, &mut ba[..n])?;
        b.read_at(sector, &mut bb[..n])?;
        if ba[..n] != bb[..n] {
            return Ok(false);
        }
        sector += chunk;
    }
    Ok(true)
}

/// Run the simulation.
pub async fn run(opts: SimulateOpts) -> Result<Report> {
    if opts.sectors < BM_SECT_PER_BIT || opts.sectors % BM_SECT_PER_BIT != 0 {
        bail!("sectors must be a positive multiple of {BM_SECT_PER_BIT}");
    }
    let sync = SyncConfig {
        verify_alg: Some("sha256".to_string()),
        ..SyncConfig::default()
    };
    let net = NetConfig {
        protocol: opts.protocol,
        ..NetConfig::default()
    };
    let mut report = Report::default();

    // devices only hold a weak reference to their registry
    let (_rx, x) = node(opts.sectors, 0, &sync).await?;
    let (_ry, y) = node(opts.sectors, 1, &sync).await?;
    x.set_role(Role::Primary, true).await?;
    write_blocks(&x, opts.sectors, opts.writes, 1).await?;

    info!("initial connect");
    x.configure_network(net.clone())?;
    y.configure_network(net.clone())?;
    let started = Instant::now();
    connect(&x, &y).await?;
    wait(&x, "initial sync", synced).await?;
    wait(&y, "initial sync", synced).await?;
    report.initial_sync = started.elapsed();
    report.initial_sync_blocks = x.bitmap().bits();

    write_blocks(&x, opts.sectors, opts.writes, 40).await?;

    info!("dropping the link");
    y.disconnect().await?;
    wait(&x, "WFConnection", |s| s.conn == ConnState::WFConnection).await?;
    write_blocks(&x, opts.sectors, opts.writes, 80).await?;
    report.dirty_after_disconnect = x.bitmap().total_weight();

    info!("reconnecting");
    y.configure_network(net)?;
    let started = Instant::now();
    connect(&x, &y).await?;
    wait(&x, "resync", synced).await?;
    wait(&y, "resync", synced).await?;
    report.resync = started.elapsed();

    info!("online verify");
    x.start_verify().await?;
    wait(&x, "end of verify", |s| s.conn == ConnState::Connected).await?;
    wait(&y, "end of verify", |s| s.conn == ConnState::Connected).await?;
    report.verify_out_of_sync = x.bitmap().total_weight();

    report.identical = stores_equal(&x, &y, opts.sectors)?;
    x.disconnect().await?;
    y.disconnect().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulation_ends_identical() {
        let report = run(SimulateOpts {
            sectors: 1024,
            writes: 8,
            protocol: WireProtocol::C,
        })
        .await
        .unwrap();
        assert!(report.identical);
        assert_eq!(report.verify_out_of_sync, 0);
        assert_eq!(report.initial_sync_blocks, 128);
        assert!(report.dirty_after_disconnect > 0);
    }

    #[tokio::test]
    async fn test_rejects_unaligned_size() {
        let err = run(SimulateOpts {
            sectors: 100,
            writes: 1,
            protocol: WireProtocol::C,
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }
}
