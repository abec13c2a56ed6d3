//! Two nodes over an in-memory link.

use std::sync::Arc;
use std::time::Duration;

use blkrepl_repl::protocol::Packet;
use blkrepl_repl::{
    create_md, BackingDev, ConnState, Conduit, Device, DeviceState, DiskConfig, DiskState, NetConfig,
    Registry, RetCode, Role, ScriptedHelper, SyncConfig,
};
use blkrepl_storage::{write_meta, BlockStore, MdFlags, MemStore, MetaLayout, WriteFlags, SECTOR_SIZE};
use bytes::Bytes;

const SECTORS: u64 = 2048;

fn backing(device_uuid: u64) -> BackingDev {
    let b = BackingDev {
        data: Arc::new(MemStore::new(SECTORS)),
        meta: Arc::new(MemStore::new(1024)),
        layout: MetaLayout::external(1024),
    };
    create_md(&b, device_uuid).unwrap();
    b
}

async fn node(reg: &Arc<Registry>, minor: u32, device_uuid: u64) -> Arc<Device> {
    let dev = reg.create_device(minor, format!("r{minor}")).unwrap();
    dev.attach_disk(backing(device_uuid), DiskConfig::default())
        .await
        .unwrap();
    dev
}

async fn wait(dev: &Device, what: &str, pred: impl Fn(&DeviceState) -> bool) -> DeviceState {
    match tokio::time::timeout(Duration::from_secs(10), dev.wait_state(pred)).await {
        Ok(s) => s,
        Err(_) => panic!("{} never reached {what}, state {:?}", dev.name(), dev.state()),
    }
}

fn synced(s: &DeviceState) -> bool {
    s.conn == ConnState::Connected && s.disk == DiskState::UpToDate && s.pdsk == DiskState::UpToDate
}

async fn connect(x: &Arc<Device>, y: &Arc<Device>) {
    let (a, b) = Conduit::new_pair("x", "y");
    let (rx, ry) = tokio::join!(x.connect(a), y.connect(b));
    rx.unwrap();
    ry.unwrap();
}

fn pattern(byte: u8, sectors: usize) -> Bytes {
    Bytes::from(vec![byte; sectors * SECTOR_SIZE])
}

fn read(dev: &Device, sector: u64, sectors: usize) -> Vec<u8> {
    let mut buf = vec![0u8; sectors * SECTOR_SIZE];
    dev.data_store().unwrap().read_at(sector, &mut buf).unwrap();
    buf
}

/// A forced Primary and a fresh Secondary: full sync, then replication.
async fn primary_pair(helper: Arc<ScriptedHelper>) -> (Arc<Device>, Arc<Device>) {
    let rx = Registry::new(helper);
    let ry = Registry::new(Arc::new(ScriptedHelper::new()));
    let x = node(&rx, 0, 0xA).await;
    let y = node(&ry, 0, 0xB).await;

    x.set_role(Role::Primary, true).await.unwrap();
    x.submit_write(8, pattern(0x5A, 8)).await.unwrap();

    x.configure_network(NetConfig::default()).unwrap();
    y.configure_network(NetConfig::default()).unwrap();
    connect(&x, &y).await;

    wait(&x, "synced", synced).await;
    wait(&y, "synced", synced).await;
    (x, y)
}

#[tokio::test]
async fn test_initial_full_sync_copies_primary_data() {
    let (x, y) = primary_pair(Arc::new(ScriptedHelper::new())).await;

    assert_eq!(y.state().peer, Role::Primary);
    assert_eq!(read(&y, 8, 8), vec![0x5A; 8 * SECTOR_SIZE]);
    assert_eq!(y.bitmap().total_weight(), 0);
    assert_eq!(x.bitmap().total_weight(), 0);
    // both sides agree on the data generation
    assert_eq!(x.uuids().unwrap()[0] & !1, y.uuids().unwrap()[0] & !1);
}

#[tokio::test]
async fn test_connected_write_is_replicated() {
    let (x, y) = primary_pair(Arc::new(ScriptedHelper::new())).await;

    x.submit_write(64, pattern(0xC3, 16)).await.unwrap();
    // protocol C: the peer has written it when the call returns
    assert_eq!(read(&y, 64, 16), vec![0xC3; 16 * SECTOR_SIZE]);
    assert_eq!(x.bitmap().total_weight(), 0);

    let err = y.submit_write(0, pattern(1, 1)).await.unwrap_err();
    assert_eq!(err.code(), RetCode::StateNotAllowed as i32);
}

#[tokio::test]
async fn test_reconnect_resyncs_only_dirty_blocks() {
    let (x, y) = primary_pair(Arc::new(ScriptedHelper::new())).await;

    y.disconnect().await.unwrap();
    assert_eq!(y.state().conn, ConnState::StandAlone);
    wait(&x, "WFConnection", |s| s.conn == ConnState::WFConnection).await;

    x.submit_write(1024, pattern(0x77, 8)).await.unwrap();
    assert_eq!(x.bitmap().total_weight(), 1);

    y.configure_network(NetConfig::default()).unwrap();
    connect(&x, &y).await;
    wait(&x, "synced", synced).await;
    wait(&y, "synced", synced).await;

    assert_eq!(read(&y, 1024, 8), vec![0x77; 8 * SECTOR_SIZE]);
    assert_eq!(x.bitmap().total_weight(), 0);
    assert_eq!(read(&y, 8, 8), vec![0x5A; 8 * SECTOR_SIZE]);
}

#[tokio::test]
async fn test_online_verify_finds_diverged_block() {
    let helper = Arc::new(ScriptedHelper::new());
    let (x, y) = primary_pair(helper.clone()).await;
    let sync = SyncConfig {
        verify_alg: Some("sha256".to_string()),
        ..SyncConfig::default()
    };
    x.configure_sync(sync.clone()).unwrap();
    y.configure_sync(sync).unwrap();

    // silently corrupt one block below the replication layer
    y.data_store()
        .unwrap()
        .write_at(512, &vec![0xEE; SECTOR_SIZE], WriteFlags::default())
        .unwrap();

    x.start_verify().await.unwrap();
    wait(&x, "end of verify", |s| s.conn == ConnState::Connected).await;
    wait(&y, "end of verify", |s| s.conn == ConnState::Connected).await;

    assert_eq!(x.bitmap().total_weight(), 1);
    assert!(helper.calls().iter().any(|c| c == "out-of-sync"));
}

#[tokio::test]
async fn test_disconnect_both_sides() {
    let (x, y) = primary_pair(Arc::new(ScriptedHelper::new())).await;

    x.disconnect().await.unwrap();
    assert_eq!(x.state().conn, ConnState::StandAlone);
    assert_eq!(x.state().pdsk, DiskState::DUnknown);
    wait(&y, "WFConnection", |s| s.conn == ConnState::WFConnection).await;
    y.disconnect().await.unwrap();
    assert_eq!(y.state().conn, ConnState::StandAlone);
    assert!(y.net_config().is_none());
}

#[tokio::test]
async fn test_failed_resync_writes_keep_source_dirty() {
    let rx = Registry::new(Arc::new(ScriptedHelper::new()));
    let ry = Registry::new(Arc::new(ScriptedHelper::new()));
    let x = node(&rx, 0, 0xA).await;

    // every resync write on the target fails
    let data = Arc::new(MemStore::new(SECTORS));
    data.set_fail_writes(true);
    let b = BackingDev {
        data: data.clone(),
        meta: Arc::new(MemStore::new(1024)),
        layout: MetaLayout::external(1024),
    };
    create_md(&b, 0xB).unwrap();
    let y = ry.create_device(0, "r0").unwrap();
    y.attach_disk(b, DiskConfig::default()).await.unwrap();

    x.set_role(Role::Primary, true).await.unwrap();
    x.configure_network(NetConfig::default()).unwrap();
    y.configure_network(NetConfig::default()).unwrap();
    connect(&x, &y).await;

    let bits = x.bitmap().bits();
    let s = wait(&x, "end of resync", |s| s.conn == ConnState::Connected).await;
    assert_eq!(s.disk, DiskState::UpToDate);
    assert_eq!(s.pdsk, DiskState::Inconsistent);
    assert_eq!(x.bitmap().total_weight(), bits);
    let s = wait(&y, "end of resync", |s| s.conn == ConnState::Connected).await;
    assert_eq!(s.disk, DiskState::Inconsistent);
}

#[tokio::test]
async fn test_completed_writes_close_epochs() {
    let (x, _y) = primary_pair(Arc::new(ScriptedHelper::new())).await;

    for i in 0..5u64 {
        x.submit_write(128 + i * 8, pattern(0x10 + i as u8, 8)).await.unwrap();
    }
    let tl = x.transfer_log();
    let released = async {
        while tl.pending_requests() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(10), released)
        .await
        .expect("barrier acks never released the transfer log");
    assert_eq!(tl.barrier_count(), 1);
    assert_eq!(tl.current_count(), 0);
}

#[tokio::test]
async fn test_unknown_barrier_ack_drops_connection() {
    let (x, y) = primary_pair(Arc::new(ScriptedHelper::new())).await;
    x.submit_write(256, pattern(0x42, 8)).await.unwrap();

    let link = y.link().unwrap();
    link.send(&Packet::BarrierAck {
        barrier: x.transfer_log().current_barrier().wrapping_add(1000),
        set_size: 7,
    })
    .unwrap();

    let s = wait(&x, "WFConnection", |s| s.conn == ConnState::WFConnection).await;
    assert_eq!(s.pdsk, DiskState::DUnknown);
    assert_eq!(s.peer, Role::Unknown);
    wait(&y, "lost connection", |s| s.conn < ConnState::Connected).await;
}

/// Identical data generations on two Secondaries: no resync, and the bitmap
/// is left alone.
#[tokio::test]
async fn test_same_generation_connects_without_sync() {
    async fn consistent_node(reg: &Arc<Registry>, device_uuid: u64) -> Arc<Device> {
        let b = BackingDev {
            data: Arc::new(MemStore::new(SECTORS)),
            meta: Arc::new(MemStore::new(1024)),
            layout: MetaLayout::external(1024),
        };
        let mut md = create_md(&b, device_uuid).unwrap();
        md.uuids[0] = 0x5EED_0000_0000_1000;
        md.la_size_sect = SECTORS;
        md.flags.insert(MdFlags::CONSISTENT);
        md.flags.insert(MdFlags::WAS_UP_TO_DATE);
        write_meta(b.meta.as_ref(), &b.layout, &md, false).unwrap();
        // block 3 is dirty on disk
        let mut word = vec![0u8; SECTOR_SIZE];
        word[0] = 0x08;
        b.meta.write_at(b.layout.bm_sector(), &word, WriteFlags::default()).unwrap();

        let dev = reg.create_device(0, "r0").unwrap();
        dev.attach_disk(b, DiskConfig::default()).await.unwrap();
        dev
    }

    let rx = Registry::new(Arc::new(ScriptedHelper::new()));
    let ry = Registry::new(Arc::new(ScriptedHelper::new()));
    let x = consistent_node(&rx, 0xA).await;
    let y = consistent_node(&ry, 0xB).await;
    assert_eq!(x.bitmap().total_weight(), 1);

    x.configure_network(NetConfig::default()).unwrap();
    y.configure_network(NetConfig::default()).unwrap();
    connect(&x, &y).await;

    for dev in [&x, &y] {
        let s = wait(dev, "synced", synced).await;
        assert_eq!(s.role, Role::Secondary);
        assert_eq!(s.peer, Role::Secondary);
        assert_eq!(dev.bitmap().total_weight(), 1);
        assert_eq!(dev.resync_status().total, 0);
    }
}
