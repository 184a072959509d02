//! The background indexer thread.
//!
//! A single worker owns every write transaction. It drives the state
//! machine Init → ScanHeaders → ScanBlocks → BuildHistory → Ready,
//! then sleeps on the rendezvous and processes injected blocks, reorging
//! when a longer branch arrives. Database failures stop the machine and
//! surface through the sticky failure flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

use cairn_blockdb::schema::MAX_HEIGHT;
use cairn_blockdb::{BlockDb, DbError, DbMode, StoredHeader, StoredUndoData, NO_TOP_HEIGHT};
use cairn_log::{log_debug, log_error, log_info, log_warn};
use cairn_primitives::block::Block;
use cairn_primitives::encoding::decode;
use cairn_storage::{Column, WriteBatch};

use crate::inject::{FailureKind, Rendezvous};
use crate::progress::{BdmAction, BdmCallback, BdmPhase};
use crate::source::BlockSource;
use crate::viewer::BlockDataViewer;

const IDLE_WAIT: Duration = Duration::from_millis(250);
const HEADER_BATCH_STRIDE: u32 = 1024;
const PROGRESS_STRIDE: u32 = 256;

struct WorkerError {
    kind: FailureKind,
    message: String,
}

impl From<DbError> for WorkerError {
    fn from(err: DbError) -> Self {
        let kind = match &err {
            DbError::Corrupt(_) | DbError::Decode(_) => FailureKind::CorruptDatabase,
            DbError::Invariant(_) => FailureKind::InvariantViolation,
            _ => FailureKind::Io,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

struct Shared {
    db: Arc<BlockDb>,
    source: Arc<dyn BlockSource>,
    callback: Arc<dyn BdmCallback>,
    inject: Arc<Rendezvous>,
    shutdown: AtomicBool,
    ready: AtomicBool,
    block_rx: Receiver<Vec<u8>>,
}

impl Shared {
    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

pub struct BlockDataManagerThread {
    shared: Arc<Shared>,
    block_tx: Sender<Vec<u8>>,
    handle: Option<JoinHandle<()>>,
}

impl BlockDataManagerThread {
    /// Spawn the worker. The database must already be open; the mode is
    /// taken from its configuration.
    pub fn start(
        db: Arc<BlockDb>,
        source: Arc<dyn BlockSource>,
        callback: Arc<dyn BdmCallback>,
        inject: Arc<Rendezvous>,
    ) -> Self {
        let (block_tx, block_rx) = unbounded();
        let shared = Arc::new(Shared {
            db,
            source,
            callback,
            inject,
            shutdown: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            block_rx,
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("cairn-indexer".to_string())
            .spawn(move || run(worker))
            .expect("spawn indexer thread");
        Self {
            shared,
            block_tx,
            handle: Some(handle),
        }
    }

    pub fn db(&self) -> &Arc<BlockDb> {
        &self.shared.db
    }

    pub fn viewer(&self) -> BlockDataViewer {
        BlockDataViewer::new(Arc::clone(&self.shared.db))
    }

    pub fn inject(&self) -> &Arc<Rendezvous> {
        &self.shared.inject
    }

    /// Monotonic: once true, stays true until shutdown.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Hand a serialized block to the worker and wake it.
    pub fn submit_raw_block(&self, raw: Vec<u8>) {
        let _ = self.block_tx.send(raw);
        self.shared.inject.notify();
    }

    /// Non-blocking shutdown request. Returns whether the worker was
    /// still running, i.e. whether the caller should wait for the final
    /// notification.
    pub fn request_shutdown(&self) -> bool {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.inject.notify();
        self.handle.is_some()
    }

    pub fn shutdown_and_wait(&mut self) {
        self.request_shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BlockDataManagerThread {
    fn drop(&mut self) {
        self.shutdown_and_wait();
    }
}

fn run(shared: Arc<Shared>) {
    if let Err(err) = run_inner(&shared) {
        log_error!("indexer stopped: {}", err.message);
        // The dup cache may be ahead of disk after an abandoned batch.
        shared.db.clear_dup_cache();
        shared.inject.set_failure_flag(err.kind);
        shared.callback.run(BdmAction::Failure {
            kind: err.kind,
            message: err.message,
        });
    }
}

fn run_inner(shared: &Shared) -> Result<(), WorkerError> {
    let db = &shared.db;
    let callback = &shared.callback;

    // Init: warm caches and sanity-check the stored top.
    callback.progress(BdmPhase::Init, &[], 0.0, 0, 0);
    db.load_valid_dup_cache()?;
    let top_height = db.get_top_block_height(Column::Headers)?;
    if top_height != NO_TOP_HEIGHT {
        let top_hash = db.get_top_block_hash(Column::Headers)?;
        if db.get_bare_header_by_hash(&top_hash)?.is_none() {
            return Err(DbError::Corrupt("top block hash has no stored header").into());
        }
        if shared.source.header_lookup(&top_hash).is_none() {
            // The feed has moved to a branch that no longer contains our
            // top; the steady-state reorg path will sort it out.
            log_warn!("raw feed does not know the stored top block");
        }
    }
    if let Some(genesis_dup) = db.get_valid_dup_id_for_height(0)? {
        let stored = db.get_bare_header(0, genesis_dup)?;
        let expected = db.config().genesis_block_hash;
        if let (Some(stored), Some(expected)) = (stored, expected) {
            if stored.hash != expected {
                return Err(DbError::Corrupt("stored genesis does not match network").into());
            }
        }
    }

    scan_headers(shared)?;
    scan_blocks(shared)?;
    build_history(shared)?;

    if shared.shutting_down() {
        return Ok(());
    }

    let top_height = db.get_top_block_height(Column::Headers)?;
    let ready_height = if top_height == NO_TOP_HEIGHT {
        0
    } else {
        top_height
    };
    shared.ready.store(true, Ordering::Release);
    callback.run(BdmAction::Ready {
        height: ready_height,
    });
    callback.progress(BdmPhase::Ready, &[], 1.0, 0, ready_height);
    log_info!("indexer ready at height {ready_height}");

    // Steady state: sleep on the rendezvous, drain injected work.
    loop {
        if shared.shutting_down() {
            return Ok(());
        }
        if !shared.inject.wait(IDLE_WAIT) {
            continue;
        }
        if shared.shutting_down() {
            return Ok(());
        }
        let sequence = shared.inject.begin_run();
        drain_injected(shared)?;
        shared.inject.complete_run(sequence);
    }
}

/// Walk the raw feed once, upserting bare headers.
fn scan_headers(shared: &Shared) -> Result<(), WorkerError> {
    let db = &shared.db;
    let Some(source_top) = shared.source.top_height() else {
        return Ok(());
    };
    if source_top > MAX_HEIGHT {
        return Err(DbError::Invariant("source exceeds key space").into());
    }
    let started = Instant::now();
    let mut batch = WriteBatch::new();
    for height in 0..=source_top {
        if shared.shutting_down() {
            break;
        }
        let Some(raw) = shared.source.raw_block(height) else {
            log_warn!("raw feed ended early at height {height}");
            break;
        };
        let block: Block = decode(&raw).map_err(DbError::Decode)?;
        let mut sbh = StoredHeader::from_block(&block, height);
        db.put_bare_header(&mut batch, &mut sbh, true)?;
        if height % HEADER_BATCH_STRIDE == HEADER_BATCH_STRIDE - 1 {
            db.commit_batch(std::mem::take(&mut batch))?;
        }
        if height % PROGRESS_STRIDE == 0 {
            report_progress(
                shared,
                BdmPhase::ScanHeaders,
                height,
                source_top,
                started,
            );
        }
    }
    db.commit_batch(batch)?;
    shared
        .callback
        .progress(BdmPhase::OrganizeChain, &[], 1.0, 0, source_top);
    Ok(())
}

/// Apply every block the feed has beyond the current applied top.
fn scan_blocks(shared: &Shared) -> Result<(), WorkerError> {
    let db = &shared.db;
    let Some(source_top) = shared.source.top_height() else {
        return Ok(());
    };
    let applied_top = db.get_top_block_height(Column::Blkdata)?;
    let start = if applied_top == NO_TOP_HEIGHT {
        0
    } else {
        applied_top + 1
    };
    if start > source_top {
        return Ok(());
    }
    let started = Instant::now();
    for height in start..=source_top {
        if shared.shutting_down() {
            break;
        }
        let Some(raw) = shared.source.raw_block(height) else {
            log_warn!("raw feed ended early at height {height}");
            break;
        };
        let block: Block = decode(&raw).map_err(DbError::Decode)?;
        let mut batch = WriteBatch::new();
        db.apply_block(&mut batch, &block, height)?;
        db.commit_batch(batch)?;
        if height % PROGRESS_STRIDE == 0 {
            report_progress(shared, BdmPhase::BuildDb, height, source_top, started);
        }
    }
    Ok(())
}

/// Bring registered script histories up to the applied top. Supernode
/// builds histories inline during block application and skips this.
fn build_history(shared: &Shared) -> Result<(), WorkerError> {
    let db = &shared.db;
    if db.db_mode() == DbMode::Super {
        return Ok(());
    }
    let top = db.get_top_block_height(Column::Blkdata)?;
    if top == NO_TOP_HEIGHT {
        return Ok(());
    }
    let scripts = db.registered_scr_addrs();
    let total = scripts.len() as u32;
    for (index, (scr_addr, scanned_up_to)) in scripts.into_iter().enumerate() {
        if shared.shutting_down() {
            break;
        }
        // u32::MAX marks a script registered as brand new: nothing before
        // its registration can concern it.
        if scanned_up_to == u32::MAX || scanned_up_to >= top {
            continue;
        }
        let mut batch = WriteBatch::new();
        db.rescan_script_history(&mut batch, &scr_addr, top)?;
        db.commit_batch(batch)?;
        db.set_script_scanned_up_to(&scr_addr, top);
        shared.callback.progress(
            BdmPhase::ScanAddresses,
            &[],
            (index + 1) as f32 / total.max(1) as f32,
            0,
            index as u32 + 1,
        );
    }
    Ok(())
}

fn drain_injected(shared: &Shared) -> Result<(), WorkerError> {
    loop {
        match shared.block_rx.try_recv() {
            Ok(raw) => process_block(shared, &raw)?,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
        }
    }
}

fn process_block(shared: &Shared, raw: &[u8]) -> Result<(), WorkerError> {
    let db = &shared.db;
    let block: Block = match decode(raw) {
        Ok(block) => block,
        Err(err) => {
            // A malformed injected block is the submitter's problem, not
            // a database failure.
            log_warn!("dropping undecodable injected block: {err}");
            return Ok(());
        }
    };
    let hash = block.hash();
    if let Some(existing) = db.get_bare_header_by_hash(&hash)? {
        if existing.block_applied {
            log_debug!("ignoring already-applied block at height {}", existing.height);
            return Ok(());
        }
    }

    let parent = block.header.prev_block;
    let top_height = db.get_top_block_height(Column::Headers)?;
    let top_hash = db.get_top_block_hash(Column::Headers)?;

    if parent == top_hash {
        // Plain main-branch extension.
        let height = if top_height == NO_TOP_HEIGHT {
            0
        } else {
            top_height + 1
        };
        let mut batch = WriteBatch::new();
        db.apply_block(&mut batch, &block, height)?;
        db.commit_batch(batch)?;
        shared.callback.run(BdmAction::NewBlock { height });
        return Ok(());
    }

    let Some(parent_header) = db.get_bare_header_by_hash(&parent)? else {
        // Reorg conflict: the branch cannot be connected yet. Surfaced to
        // the network side, which should feed the missing headers.
        log_warn!("injected block has unknown parent; more headers needed");
        return Ok(());
    };
    let height = parent_header.height + 1;

    if top_height != NO_TOP_HEIGHT && height <= top_height {
        // Side branch that does not outgrow the main chain: store the
        // payload under a fresh dup, leave the valid branch alone.
        let mut batch = WriteBatch::new();
        let mut sbh = StoredHeader::from_block(&block, height);
        db.put_stored_header(&mut batch, &mut sbh, true, false)?;
        db.commit_batch(batch)?;
        log_info!("stored side-branch block at height {height}");
        return Ok(());
    }

    reorg_to_branch(shared, block, height)?;
    Ok(())
}

/// Switch to the branch ending in `tip_block`: unwind the main chain to
/// the fork point, then replay the new branch, all in one batch.
fn reorg_to_branch(
    shared: &Shared,
    tip_block: Block,
    tip_height: u32,
) -> Result<(), WorkerError> {
    let db = &shared.db;
    let Some((fork_height, branch)) = collect_branch(db, tip_block, tip_height)? else {
        log_warn!("reorg branch is not fully connected; more headers needed");
        return Ok(());
    };
    let top_height = db.get_top_block_height(Column::Headers)?;
    log_info!(
        "reorg: unwinding {} block(s) above height {fork_height}, replaying {}",
        top_height.saturating_sub(fork_height),
        branch.len()
    );

    let mut batch = WriteBatch::new();
    let mut height = top_height;
    while height != NO_TOP_HEIGHT && height > fork_height {
        let dup = db
            .get_valid_dup_id_for_height(height)?
            .ok_or(DbError::Invariant("no valid dup on unwound height"))?;
        let sud = undo_for_block(db, height, dup)?;
        db.unapply_block(&mut batch, &sud)?;
        if height == 0 {
            break;
        }
        height -= 1;
    }
    for (height, block) in branch.iter().rev() {
        db.apply_block(&mut batch, block, *height)?;
    }
    db.commit_batch(batch)?;

    let new_top = branch.first().map(|(height, _)| *height).unwrap_or(0);
    shared.callback.run(BdmAction::Refresh);
    shared.callback.run(BdmAction::NewBlock { height: new_top });
    Ok(())
}

/// Collect the new branch tip-down until it meets an applied block on
/// the valid chain. Returns the fork height and the branch blocks
/// (tip first), or None when an ancestor is missing.
fn collect_branch(
    db: &BlockDb,
    tip_block: Block,
    tip_height: u32,
) -> Result<Option<(u32, Vec<(u32, Block)>)>, WorkerError> {
    let mut branch: Vec<(u32, Block)> = Vec::new();
    let mut cursor_parent = tip_block.header.prev_block;
    branch.push((tip_height, tip_block));
    loop {
        let Some(parent) = db.get_bare_header_by_hash(&cursor_parent)? else {
            return Ok(None);
        };
        let on_valid_branch =
            db.get_valid_dup_id_for_height(parent.height)? == Some(parent.dup_id);
        if on_valid_branch && parent.block_applied {
            return Ok(Some((parent.height, branch)));
        }
        // Side-branch ancestor: its payload was stored when it arrived.
        let Some(stored) = db.get_stored_header(parent.height, parent.dup_id, true)? else {
            return Ok(None);
        };
        let Some(block) = stored.to_block() else {
            return Err(DbError::Corrupt("side-branch payload incomplete").into());
        };
        cursor_parent = block.header.prev_block;
        branch.push((parent.height, block));
    }
}

fn undo_for_block(db: &BlockDb, height: u32, dup: u8) -> Result<StoredUndoData, DbError> {
    // Fullnode reads the stored record; supernode reconstructs from the
    // retained outputs.
    if let Some(sud) = db.get_stored_undo_data(height, dup)? {
        return Ok(sud);
    }
    db.compute_undo_data_for_block(height, dup)
}

fn report_progress(
    shared: &Shared,
    phase: BdmPhase,
    done: u32,
    total: u32,
    started: Instant,
) {
    let fraction = if total == 0 {
        1.0
    } else {
        done as f32 / total as f32
    };
    let elapsed = started.elapsed().as_secs_f32();
    let seconds_remaining = if done > 0 && fraction > 0.0 {
        (elapsed / fraction * (1.0 - fraction)) as u32
    } else {
        0
    };
    shared
        .callback
        .progress(phase, &[], fraction, seconds_remaining, done);
}
