//! End-to-end backup, validate and restore runs against an in-memory server.

use async_trait::async_trait;
use backup_engine::catalog::lock::LOCK_FILE;
use backup_engine::catalog::{BackupMode, BackupStatus, Lsn, TimelineId, MANIFEST_FILE};
use backup_engine::fetch::read_page_at;
use backup_engine::page::{self, BLOCK_SIZE};
use backup_engine::restore::RestoreRequest;
use backup_engine::server::{
    BlockChangeMap, BlockChanges, BlockFetchError, DatabaseServer, ServerError, WalError,
    WalSource,
};
use backup_engine::{BackupEngine, BackupError, CancellationController, Config};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use walkdir::WalkDir;

const RELATION: &str = "base/5/16384";

struct FakeServer {
    data_dir: PathBuf,
    lsn: AtomicU64,
    /// Cancelled as soon as the server enters backup mode
    cancel_on_start: Mutex<Option<CancellationController>>,
    /// Drop this relation when its block is fetched
    drop_on_fetch: Mutex<Option<String>>,
    /// Block-change bitmap, `None` when tracking is off
    tracking: Mutex<Option<BlockChanges>>,
    /// Page written right after the bitmap is read
    write_after_take: Mutex<Option<(String, u32)>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeServer {
    fn new(data_dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            data_dir: data_dir.to_path_buf(),
            lsn: AtomicU64::new(0x1000),
            cancel_on_start: Mutex::new(None),
            drop_on_fetch: Mutex::new(None),
            tracking: Mutex::new(None),
            write_after_take: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn enable_tracking(&self) {
        *self.tracking.lock().unwrap() = Some(BlockChanges {
            tracked_since: self.current_lsn(),
            blocks: BlockChangeMap::new(),
        });
    }

    /// Rewrite one page at a fresh LSN, as a client write would, and record
    /// it in the bitmap. Returns the page LSN.
    fn write_page(&self, rel_path: &str, blkno: u32, fill: u8) -> Lsn {
        let lsn = Lsn(self.lsn.fetch_add(0x10, Ordering::SeqCst) + 0x10);
        rewrite_block(&self.data_dir.join(rel_path), blkno, lsn, fill);
        if let Some(changes) = self.tracking.lock().unwrap().as_mut() {
            changes
                .blocks
                .entry(rel_path.to_string())
                .or_default()
                .insert(blkno);
        }
        lsn
    }

    fn new_epoch(&self) -> Option<BlockChanges> {
        let mut tracking = self.tracking.lock().unwrap();
        let fresh = BlockChanges {
            tracked_since: self.current_lsn(),
            blocks: BlockChangeMap::new(),
        };
        tracking.as_mut().map(|current| std::mem::replace(current, fresh))
    }

    fn called(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }

    fn current_lsn(&self) -> Lsn {
        Lsn(self.lsn.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl DatabaseServer for FakeServer {
    async fn current_timeline(&self) -> Result<TimelineId, ServerError> {
        Ok(TimelineId(1))
    }

    async fn checksums_enabled(&self) -> Result<bool, ServerError> {
        Ok(true)
    }

    async fn start_backup(&self, _label: &str) -> Result<Lsn, ServerError> {
        self.called("start_backup");
        if let Some(controller) = self.cancel_on_start.lock().unwrap().take() {
            controller.request_cancel();
        }
        Ok(Lsn(self.lsn.fetch_add(0x1000, Ordering::SeqCst)))
    }

    async fn stop_backup(&self) -> Result<Lsn, ServerError> {
        Ok(Lsn(self.lsn.fetch_add(0x100, Ordering::SeqCst)))
    }

    async fn fetch_block(&self, rel_path: &str, block: u32) -> Result<Bytes, BlockFetchError> {
        let path = self.data_dir.join(rel_path);
        if self.drop_on_fetch.lock().unwrap().as_deref() == Some(rel_path) {
            fs::remove_file(&path).map_err(|e| BlockFetchError::Failed(e.to_string()))?;
            return Err(BlockFetchError::RelationGone);
        }
        let page = read_page_at(&path, block)
            .await
            .map_err(|_| BlockFetchError::RelationGone)?;
        match page::inspect(&page, block, true) {
            page::PageState::Invalid(_) => Err(BlockFetchError::PageCorrupt),
            _ => Ok(Bytes::from(page)),
        }
    }

    async fn change_tracking_enabled(&self) -> Result<bool, ServerError> {
        Ok(self.tracking.lock().unwrap().is_some())
    }

    async fn take_block_changes(&self) -> Result<BlockChanges, ServerError> {
        self.called("take_block_changes");
        let changes = self
            .new_epoch()
            .ok_or_else(|| ServerError::Unsupported("block change tracking".to_string()))?;
        let pending = self.write_after_take.lock().unwrap().take();
        if let Some((rel_path, blkno)) = pending {
            self.write_page(&rel_path, blkno, 0x77);
        }
        Ok(changes)
    }

    async fn reset_block_changes(&self) -> Result<(), ServerError> {
        self.called("reset_block_changes");
        self.new_epoch();
        Ok(())
    }
}

enum FakeWal {
    Changes(BlockChangeMap),
    Gap,
}

#[async_trait]
impl WalSource for FakeWal {
    async fn changed_blocks(
        &self,
        _timeline: TimelineId,
        from: Lsn,
        to: Lsn,
    ) -> Result<BlockChangeMap, WalError> {
        match self {
            FakeWal::Changes(map) => Ok(map.clone()),
            FakeWal::Gap => Err(WalError::Gap { from, to }),
        }
    }
}

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    data_dir: PathBuf,
    server: Arc<FakeServer>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let data_dir = root.join("data");
        fs::create_dir_all(data_dir.join("base/5")).unwrap();
        fs::create_dir_all(data_dir.join("global")).unwrap();
        fs::create_dir_all(data_dir.join("pg_wal")).unwrap();
        fs::write(data_dir.join("PG_VERSION"), b"16\n").unwrap();
        fs::write(data_dir.join("postgresql.conf"), b"shared_buffers = 128MB\n").unwrap();
        fs::write(data_dir.join("pg_wal/000000010000000000000001"), vec![7u8; 1024]).unwrap();
        write_relation(&data_dir.join(RELATION), &[(0x100, 1), (0x100, 2), (0x100, 3)]);
        write_relation(&data_dir.join("global/1262"), &[(0x100, 9)]);

        let server = FakeServer::new(&data_dir);
        Self {
            _tmp: tmp,
            root,
            data_dir,
            server,
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.catalog.path = self.root.join("catalog");
        config.instance.data_dir = self.data_dir.clone();
        config.backup.jobs = 2;
        config.fetch.local_retries = 2;
        config.fetch.retry_delay_ms = 0;
        config.fetch.query_timeout_secs = 5;
        config
    }

    fn engine(&self) -> BackupEngine {
        BackupEngine::new(self.config(), self.server.clone()).unwrap()
    }

    fn engine_with_wal(&self, wal: FakeWal) -> BackupEngine {
        self.engine().with_wal_source(Arc::new(wal))
    }

    async fn backup(&self, engine: &BackupEngine, mode: BackupMode) -> Result<BackupStatus, BackupError> {
        let controller = CancellationController::new();
        engine.backup(mode, 2, &controller).await.map(|r| r.status)
    }
}

fn write_relation(path: &Path, pages: &[(u64, u8)]) {
    let mut data = Vec::with_capacity(pages.len() * BLOCK_SIZE);
    for (blkno, (lsn, fill)) in pages.iter().enumerate() {
        data.extend(page::new_page(Lsn(*lsn), blkno as u32, *fill));
    }
    fs::write(path, data).unwrap();
}

fn rewrite_block(path: &Path, blkno: u32, lsn: Lsn, fill: u8) {
    let mut data = fs::read(path).unwrap();
    let offset = blkno as usize * BLOCK_SIZE;
    data[offset..offset + BLOCK_SIZE].copy_from_slice(&page::new_page(lsn, blkno, fill));
    fs::write(path, data).unwrap();
}

/// Relative path -> content of every regular file under `root`.
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().to_string();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

/// Live files a restore is expected to reproduce.
fn expected(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut files = snapshot(root);
    files.retain(|path, _| !path.starts_with("pg_wal/"));
    files
}

fn restore_request(id: backup_engine::catalog::BackupId, dest: &Path) -> RestoreRequest {
    RestoreRequest {
        backup_id: id,
        destination: dest.to_path_buf(),
        tablespace_remap: BTreeMap::new(),
        verify: true,
    }
}

#[tokio::test]
async fn full_backup_restores_byte_for_byte() {
    let fx = Fixture::new();
    let engine = fx.engine();

    assert_eq!(fx.backup(&engine, BackupMode::Full).await.unwrap(), BackupStatus::Ok);
    let id = engine.list().await.unwrap()[0].id;

    let report = engine.validate(id).await.unwrap();
    assert_eq!(report.status, BackupStatus::Ok);

    let dest = fx.root.join("restored");
    let summary = engine.restore(&restore_request(id, &dest)).await.unwrap();
    assert_eq!(summary.chain, vec![id]);
    assert_eq!(snapshot(&dest), expected(&fx.data_dir));
    assert!(dest.join("pg_wal").is_dir());
}

#[tokio::test]
async fn delta_chain_restores_latest_state() {
    let fx = Fixture::new();
    let engine = fx.engine();
    fx.backup(&engine, BackupMode::Full).await.unwrap();

    let lsn = fx.server.current_lsn();
    rewrite_block(&fx.data_dir.join(RELATION), 1, lsn, 0x44);
    write_relation(&fx.data_dir.join("base/5/16390"), &[(lsn.0, 5)]);
    fs::remove_file(fx.data_dir.join("global/1262")).unwrap();

    assert_eq!(fx.backup(&engine, BackupMode::Delta).await.unwrap(), BackupStatus::Ok);
    let records = engine.list().await.unwrap();
    let delta = records[1].clone();
    assert_eq!(delta.parent_id, Some(records[0].id));

    let (_, manifest) = engine.show(delta.id).await.unwrap();
    let manifest = manifest.unwrap();
    let rel = manifest.files.iter().find(|e| e.path == RELATION).unwrap();
    assert_eq!(rel.copied_block_count(), 1);
    assert_eq!(rel.inherited_from, Some(records[0].id));
    assert_eq!(manifest.removed, vec!["global/1262".to_string()]);

    let dest = fx.root.join("restored");
    engine.restore(&restore_request(delta.id, &dest)).await.unwrap();
    assert_eq!(snapshot(&dest), expected(&fx.data_dir));
}

#[tokio::test]
async fn page_backup_uses_wal_changes() {
    let fx = Fixture::new();
    fx.backup(&fx.engine(), BackupMode::Full).await.unwrap();

    rewrite_block(&fx.data_dir.join(RELATION), 2, fx.server.current_lsn(), 0x55);
    let changes = BlockChangeMap::from([(RELATION.to_string(), BTreeSet::from([2]))]);
    let engine = fx.engine_with_wal(FakeWal::Changes(changes));

    assert_eq!(fx.backup(&engine, BackupMode::Page).await.unwrap(), BackupStatus::Ok);
    let page_id = engine.list().await.unwrap()[1].id;

    let dest = fx.root.join("restored");
    engine.restore(&restore_request(page_id, &dest)).await.unwrap();
    assert_eq!(snapshot(&dest), expected(&fx.data_dir));
}

#[tokio::test]
async fn incremental_without_parent_leaves_error_record() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let err = fx.backup(&engine, BackupMode::Delta).await.unwrap_err();
    assert!(matches!(err, BackupError::NoValidParent { .. }));

    let records = engine.list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::Error);
    assert!(!engine.catalog().dir().join(LOCK_FILE).exists());
}

#[tokio::test]
async fn wal_gap_fails_page_and_keeps_full() {
    let fx = Fixture::new();
    fx.backup(&fx.engine(), BackupMode::Full).await.unwrap();

    let engine = fx.engine_with_wal(FakeWal::Gap);
    let err = fx.backup(&engine, BackupMode::Page).await.unwrap_err();
    assert!(matches!(err, BackupError::BrokenWalChain { .. }));

    let records = engine.list().await.unwrap();
    assert_eq!(records[0].status, BackupStatus::Ok);
    assert_eq!(records[1].status, BackupStatus::Error);
}

#[tokio::test]
async fn missing_manifest_is_corrupt_and_not_a_parent() {
    let fx = Fixture::new();
    let engine = fx.engine();
    fx.backup(&engine, BackupMode::Full).await.unwrap();
    let id = engine.list().await.unwrap()[0].id;

    fs::remove_file(engine.catalog().backup_dir(id).join(MANIFEST_FILE)).unwrap();
    let report = engine.validate(id).await.unwrap();
    assert_eq!(report.status, BackupStatus::Corrupt);

    let err = fx.backup(&engine, BackupMode::Delta).await.unwrap_err();
    assert!(matches!(err, BackupError::NoValidParent { .. }));
}

#[tokio::test]
async fn corrupt_stored_page_names_the_file() {
    let fx = Fixture::new();
    let engine = fx.engine();
    fx.backup(&engine, BackupMode::Full).await.unwrap();
    let id = engine.list().await.unwrap()[0].id;

    // Flip a byte inside the payload of the second stored block.
    let stored = engine.catalog().database_dir(id).join(RELATION);
    let mut bytes = fs::read(&stored).unwrap();
    let offset = 8 + BLOCK_SIZE + 8 + 100;
    bytes[offset] ^= 0xFF;
    fs::write(&stored, bytes).unwrap();

    let report = engine.validate(id).await.unwrap();
    assert_eq!(report.status, BackupStatus::Corrupt);
    let paths: Vec<&str> = report.issues.iter().map(|i| i.path.as_str()).collect();
    assert_eq!(paths, vec![RELATION]);

    let engine = fx.engine_with_wal(FakeWal::Changes(BlockChangeMap::new()));
    let err = fx.backup(&engine, BackupMode::Page).await.unwrap_err();
    assert!(matches!(err, BackupError::NoValidParent { .. }));
}

#[tokio::test]
async fn cancelled_backup_is_error_and_releases_lock() {
    let fx = Fixture::new();
    let engine = fx.engine();

    let controller = CancellationController::new();
    *fx.server.cancel_on_start.lock().unwrap() = Some(controller.clone());
    let err = engine.backup(BackupMode::Full, 2, &controller).await.unwrap_err();
    assert!(matches!(err, BackupError::Cancelled));

    let records = engine.list().await.unwrap();
    assert_eq!(records[0].status, BackupStatus::Error);
    assert!(!engine.catalog().dir().join(LOCK_FILE).exists());

    assert_eq!(fx.backup(&engine, BackupMode::Full).await.unwrap(), BackupStatus::Ok);
}

#[tokio::test]
async fn relation_dropped_during_delta_is_skipped() {
    let fx = Fixture::new();
    let engine = fx.engine();
    fx.backup(&engine, BackupMode::Full).await.unwrap();

    // A torn page forces the server fetch, which finds the table dropped.
    let dropped = "base/5/16400";
    let mut torn = page::new_page(fx.server.current_lsn(), 0, 1);
    torn[100] ^= 0xFF;
    fs::write(fx.data_dir.join(dropped), torn).unwrap();
    *fx.server.drop_on_fetch.lock().unwrap() = Some(dropped.to_string());

    assert_eq!(fx.backup(&engine, BackupMode::Delta).await.unwrap(), BackupStatus::Ok);
    let delta = engine.list().await.unwrap()[1].id;
    let (_, manifest) = engine.show(delta).await.unwrap();
    assert!(manifest.unwrap().files.iter().all(|e| e.path != dropped));

    let dest = fx.root.join("restored");
    engine.restore(&restore_request(delta, &dest)).await.unwrap();
    assert!(!dest.join(dropped).exists());
    assert_eq!(snapshot(&dest), expected(&fx.data_dir));
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_file_is_fatal() {
    use std::os::unix::fs::PermissionsExt;

    // Root reads anything regardless of mode.
    if nix::unistd::geteuid().is_root() {
        return;
    }
    let fx = Fixture::new();
    let engine = fx.engine();
    let path = fx.data_dir.join("postgresql.conf");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();

    let err = fx.backup(&engine, BackupMode::Full).await.unwrap_err();
    assert!(matches!(err, BackupError::PermissionDenied(_)));
    assert_eq!(engine.list().await.unwrap()[0].status, BackupStatus::Error);

    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
}

#[tokio::test]
async fn ptrack_chain_restores_tracked_writes() {
    let fx = Fixture::new();
    fx.server.enable_tracking();
    let engine = fx.engine();
    fx.backup(&engine, BackupMode::Full).await.unwrap();

    fx.server.write_page(RELATION, 0, 0x61);
    fx.server.write_page(RELATION, 2, 0x62);

    assert_eq!(fx.backup(&engine, BackupMode::Ptrack).await.unwrap(), BackupStatus::Ok);
    let records = engine.list().await.unwrap();
    let ptrack = records[1].clone();
    assert_eq!(ptrack.parent_id, Some(records[0].id));

    let (_, manifest) = engine.show(ptrack.id).await.unwrap();
    let manifest = manifest.unwrap();
    let rel = manifest.files.iter().find(|e| e.path == RELATION).unwrap();
    assert_eq!(rel.copied_block_count(), 2);
    let catalog_rel = manifest.files.iter().find(|e| e.path == "global/1262").unwrap();
    assert!(!catalog_rel.is_stored());

    let dest = fx.root.join("restored");
    engine.restore(&restore_request(ptrack.id, &dest)).await.unwrap();
    assert_eq!(snapshot(&dest), expected(&fx.data_dir));
}

#[tokio::test]
async fn ptrack_reads_bitmap_after_backup_start() {
    let fx = Fixture::new();
    fx.server.enable_tracking();
    let engine = fx.engine();
    fx.backup(&engine, BackupMode::Full).await.unwrap();

    fx.server.write_page(RELATION, 0, 0x61);
    *fx.server.write_after_take.lock().unwrap() = Some((RELATION.to_string(), 1));
    fx.server.calls.lock().unwrap().clear();

    assert_eq!(fx.backup(&engine, BackupMode::Ptrack).await.unwrap(), BackupStatus::Ok);
    let ptrack = engine.list().await.unwrap()[1].clone();

    let calls = fx.server.calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["start_backup", "take_block_changes"]);

    // A write the bitmap missed must be newer than start_lsn, so WAL replay
    // from start_lsn reapplies it.
    let live = read_page_at(&fx.data_dir.join(RELATION), 1).await.unwrap();
    let header = page::PageHeader::parse(&live).unwrap();
    assert!(header.lsn >= ptrack.start_lsn);
}

#[tokio::test]
async fn ptrack_without_tracking_leaves_error_record() {
    let fx = Fixture::new();
    let engine = fx.engine();
    fx.backup(&engine, BackupMode::Full).await.unwrap();

    let err = fx.backup(&engine, BackupMode::Ptrack).await.unwrap_err();
    assert!(matches!(err, BackupError::ChangeTrackingUnavailable(_)));

    let records = engine.list().await.unwrap();
    assert_eq!(records[0].status, BackupStatus::Ok);
    assert_eq!(records[1].status, BackupStatus::Error);
    assert!(!engine.catalog().dir().join(LOCK_FILE).exists());
}
