//! Command line interface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use blkrepl_repl::uuid::format_uuids;
use blkrepl_repl::{create_md, BackingDev, NodeConfig, Registry, WireProtocol};
use blkrepl_storage::{read_meta, BlockStore, FileStore, MdFlags, MetaData, MetaLayout, ResyncBitmap};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::simulate::{self, SimulateOpts};

/// blkrepl command line.
#[derive(Parser, Debug)]
#[command(name = "blkrepl")]
#[command(about = "Block device replication tools", long_about = None)]
pub struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true, env = "BLKREPL_LOG_JSON")]
    pub json: bool,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate a node configuration file (TOML or JSON).
    CheckConfig {
        /// Configuration file.
        config: PathBuf,
    },
    /// Write fresh metadata to an external metadata file.
    InitMeta {
        /// Backing data file.
        #[arg(long)]
        data: PathBuf,
        /// Metadata file.
        #[arg(long)]
        meta: PathBuf,
        /// Create the data file with this many sectors first.
        #[arg(long)]
        data_sectors: Option<u64>,
        /// Create the metadata file with this many sectors first.
        #[arg(long)]
        meta_sectors: Option<u64>,
    },
    /// Print the metadata super block and the bitmap weight.
    ShowMeta {
        /// Metadata file.
        meta: PathBuf,
        /// Print the super block as JSON.
        #[arg(long)]
        raw: bool,
    },
    /// Run two nodes in-process: sync, replicate, reconnect, verify.
    Simulate {
        /// Device size in sectors.
        #[arg(long, default_value = "8192")]
        sectors: u64,
        /// Writes issued in each phase.
        #[arg(long, default_value = "16")]
        writes: u32,
        /// Replication protocol (A, B or C).
        #[arg(long, default_value = "C")]
        protocol: String,
    },
}

impl Cli {
    /// Run the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::CheckConfig { ref config } => check_config(config),
            Command::InitMeta {
                ref data,
                ref meta,
                data_sectors,
                meta_sectors,
            } => init_meta(data, meta, data_sectors, meta_sectors),
            Command::ShowMeta { ref meta, raw } => show_meta(meta, raw).await,
            Command::Simulate {
                sectors,
                writes,
                ref protocol,
            } => {
                let protocol = parse_protocol(protocol)?;
                let report = simulate::run(SimulateOpts {
                    sectors,
                    writes,
                    protocol,
                })
                .await?;
                println!("{report}");
                Ok(())
            }
        }
    }
}

fn parse_protocol(s: &str) -> Result<WireProtocol> {
    match s.to_ascii_uppercase().as_str() {
        "A" => Ok(WireProtocol::A),
        "B" => Ok(WireProtocol::B),
        "C" => Ok(WireProtocol::C),
        other => anyhow::bail!("unknown protocol {other:?}, expected A, B or C"),
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = NodeConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    // builds the devices, which also checks the resync-after chains
    let registry = Registry::from_config(&config)?;
    println!("node {}: {} device(s)", config.node_name, registry.len());
    for dc in &config.devices {
        let net = dc
            .net
            .as_ref()
            .map(|n| format!("protocol {:?}", n.protocol))
            .unwrap_or_else(|| "no network".to_string());
        let disk = if dc.disk.is_some() { "disk" } else { "diskless" };
        let after = dc
            .sync
            .after
            .map(|a| format!(", syncs after {a}"))
            .unwrap_or_default();
        println!("  minor {} {:?}: {disk}, {net}{after}", dc.minor, dc.name);
    }
    Ok(())
}

fn open_or_create(path: &Path, sectors: Option<u64>) -> Result<FileStore> {
    let store = match sectors {
        Some(n) => FileStore::create(path, n),
        None => FileStore::open(path),
    };
    store.with_context(|| format!("opening {}", path.display()))
}

fn init_meta(data: &Path, meta: &Path, data_sectors: Option<u64>, meta_sectors: Option<u64>) -> Result<()> {
    let data_store = open_or_create(data, data_sectors)?;
    let meta_store = open_or_create(meta, meta_sectors)?;
    let layout = MetaLayout::external(meta_store.capacity_sectors());
    let data_cap = data_store.capacity_sectors();
    let backing = BackingDev {
        data: Arc::new(data_store),
        meta: Arc::new(meta_store),
        layout,
    };
    if layout.max_bitmap_bits() * blkrepl_storage::BM_SECT_PER_BIT < data_cap {
        anyhow::bail!(
            "metadata area too small for {} sectors of data, the bitmap covers {}",
            data_cap,
            layout.max_bitmap_bits() * blkrepl_storage::BM_SECT_PER_BIT
        );
    }
    let md = create_md(&backing, rand::random())?;
    info!(data = %data.display(), meta = %meta.display(), "metadata initialized");
    println!("initialized {} ({} sectors of data)", meta.display(), data_cap);
    println!("device uuid {:016X}", md.device_uuid);
    Ok(())
}

fn describe_flags(flags: MdFlags) -> String {
    let names = [
        (MdFlags::CONSISTENT, "Consistent"),
        (MdFlags::PRIMARY_IND, "PrimaryInd"),
        (MdFlags::CONNECTED_IND, "ConnectedInd"),
        (MdFlags::FULL_SYNC, "FullSync"),
        (MdFlags::WAS_UP_TO_DATE, "WasUpToDate"),
        (MdFlags::PEER_OUT_DATED, "PeerOutDated"),
    ];
    let set: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| flags.contains(*bit))
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "-".to_string()
    } else {
        set.join(",")
    }
}

async fn bitmap_weight(store: &dyn BlockStore, layout: &MetaLayout, md: &MetaData) -> Result<u64> {
    let bm = ResyncBitmap::new();
    let guard = bm.lock("show-meta").await;
    guard.resize(md.la_size_sect)?;
    guard.read_from(store, layout.bm_sector())?;
    drop(guard);
    Ok(bm.total_weight())
}

async fn show_meta(path: &Path, raw: bool) -> Result<()> {
    let store = open_or_create(path, None)?;
    let layout = MetaLayout::external(store.capacity_sectors());
    let md = read_meta(&store, &layout).with_context(|| format!("reading {}", path.display()))?;
    if raw {
        println!("{}", serde_json::to_string_pretty(&md)?);
        return Ok(());
    }
    let weight = bitmap_weight(&store, &layout, &md).await?;
    println!("device uuid   {:016X}", md.device_uuid);
    println!("uuids         {}", format_uuids(&md.uuids));
    println!("flags         {}", describe_flags(md.flags));
    println!("size          {} sectors ({} KB)", md.la_size_sect, md.la_size_sect / 2);
    println!("al extents    {}", md.al_nr_extents);
    println!("out of sync   {} KB ({weight} bits)", weight * 4);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simulate_defaults() {
        let cli = Cli::try_parse_from(["blkrepl", "simulate"]).unwrap();
        match cli.command {
            Command::Simulate {
                sectors,
                writes,
                protocol,
            } => {
                assert_eq!(sectors, 8192);
                assert_eq!(writes, 16);
                assert_eq!(protocol, "C");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!cli.json);
    }

    #[test]
    fn test_parse_json_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["blkrepl", "show-meta", "/tmp/md", "--json"]).unwrap();
        assert!(cli.json);
    }

    #[test]
    fn test_parse_protocol() {
        assert_eq!(parse_protocol("b").unwrap(), WireProtocol::B);
        assert!(parse_protocol("D").is_err());
    }

    #[test]
    fn test_describe_flags() {
        let mut f = MdFlags::default();
        assert_eq!(describe_flags(f), "-");
        f.insert(MdFlags::CONSISTENT);
        f.insert(MdFlags::FULL_SYNC);
        assert_eq!(describe_flags(f), "Consistent,FullSync");
    }

    #[tokio::test]
    async fn test_init_then_show_meta() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data.img");
        let meta = dir.path().join("meta.img");
        init_meta(&data, &meta, Some(4096), Some(1024)).unwrap();

        let store = FileStore::open(&meta).unwrap();
        let layout = MetaLayout::external(store.capacity_sectors());
        let md = read_meta(&store, &layout).unwrap();
        assert_eq!(md.uuids[0], blkrepl_repl::uuid::UUID_JUST_CREATED);
        assert_eq!(bitmap_weight(&store, &layout, &md).await.unwrap(), 0);
        show_meta(&meta, false).await.unwrap();
        show_meta(&meta, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_config_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_config(&dir.path().join("nope.toml")).is_err());
    }

    #[tokio::test]
    async fn test_check_config_accepts_example() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(
            &path,
            r#"
node_name = "alpha"

[[devices]]
minor = 0
name = "r0"

[[devices]]
minor = 1
name = "r1"

[devices.sync]
after = 0
"#,
        )
        .unwrap();
        check_config(&path).unwrap();
    }
}
