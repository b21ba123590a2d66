#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use mpool::checkpoint::CHECKPOINT_RECORD_LEN;
use mpool::{
    CheckpointOutcome, CheckpointRecord, FileHandle, FileOptions, LatchMode, Lsn, LsnRange,
    MpoolError, PinFlags, Pool, PoolOptions, Result, TxnId,
};
use tempfile::tempdir;

const PAGE_SIZE: usize = 4096;

fn options(log_path: Option<PathBuf>) -> PoolOptions {
    PoolOptions {
        page_size: PAGE_SIZE as u32,
        pool_pages: 16,
        io_workers: 2,
        log_path,
        env_id: 42,
        ..PoolOptions::default()
    }
}

fn stamp(pool: &Pool, file: &FileHandle, page_no: u32, value: u8, txn: Option<TxnId>) -> Result<LsnRange> {
    let mut mtr = pool.mtr();
    if let Some(txn) = txn {
        mtr.bind_txn(txn);
    }
    let slot = mtr.get_page(file, page_no, LatchMode::Exclusive, PinFlags::create())?;
    mtr.modify(slot)?[0] = value;
    mtr.append_log(&[0x02, value]);
    mtr.commit()?.ok_or(MpoolError::Invalid("commit wrote no log"))
}

fn on_disk(path: &Path, page_no: usize) -> Result<u8> {
    let raw = fs::read(path)?;
    Ok(raw.get(page_no * PAGE_SIZE).copied().unwrap_or(0))
}

fn completed(outcome: CheckpointOutcome) -> (Lsn, LsnRange, u64) {
    match outcome {
        CheckpointOutcome::Completed {
            ckp_lsn,
            record,
            generation,
        } => (ckp_lsn, record, generation),
        other => panic!("checkpoint did not complete: {other:?}"),
    }
}

#[test]
fn checkpoint_writes_pages_then_advances() -> Result<()> {
    let dir = tempdir()?;
    let data = dir.path().join("f.db");
    let pool = Pool::open(options(Some(dir.path().join("mpool.log"))))?;
    let file = pool.open_file(&data, FileOptions::create())?;

    let mut last = LsnRange::default();
    for page_no in 0..4u32 {
        last = stamp(&pool, &file, page_no, page_no as u8 + 1, None)?;
    }
    assert_eq!(pool.last_checkpoint_lsn(), Lsn(0));
    assert_eq!(pool.flush_list_snapshot().len(), 4);

    let (ckp_lsn, record, generation) = completed(pool.checkpoint(true)?);
    assert!(ckp_lsn >= last.end);
    assert_eq!(record.start, ckp_lsn);
    assert_eq!(record.end.0 - record.start.0, CHECKPOINT_RECORD_LEN as u64);
    assert_eq!(generation, 1);
    assert_eq!(pool.last_checkpoint_lsn(), ckp_lsn);
    assert!(pool.flush_list_snapshot().is_empty());
    for page_no in 0..4usize {
        assert_eq!(on_disk(&data, page_no)?, page_no as u8 + 1);
    }
    assert_eq!(pool.stats().checkpoints, 1);
    drop(file);
    pool.close()
}

#[test]
fn one_mtr_over_four_pages_checkpoints_all_of_them() -> Result<()> {
    let dir = tempdir()?;
    let data = dir.path().join("f.db");
    let pool = Pool::open(options(Some(dir.path().join("mpool.log"))))?;
    let file = pool.open_file(&data, FileOptions::create())?;

    let mut mtr = pool.mtr();
    for page_no in 0..4u32 {
        let slot = mtr.get_page(&file, page_no, LatchMode::Exclusive, PinFlags::create())?;
        mtr.modify(slot)?[0] = page_no as u8 + 1;
        mtr.append_log(&[0x03, page_no as u8]);
    }
    let range = mtr.commit()?.ok_or(MpoolError::Invalid("commit wrote no log"))?;

    let links = pool.flush_list_snapshot();
    assert_eq!(links.len(), 4);
    for entry in &links {
        assert_eq!(entry.oldest, range.start);
        assert_eq!(entry.newest, range.end);
    }
    assert_eq!(pool.last_checkpoint_lsn(), Lsn(0));

    let (ckp_lsn, _, _) = completed(pool.checkpoint(true)?);
    assert_eq!(ckp_lsn, range.end);
    assert!(pool.flush_list_snapshot().is_empty());
    for page_no in 0..4usize {
        assert_eq!(on_disk(&data, page_no)?, page_no as u8 + 1);
    }
    drop(file);
    pool.close()
}

#[test]
fn checkpoints_never_pass_a_committing_transaction() -> Result<()> {
    let dir = tempdir()?;
    let pool = Pool::open(options(Some(dir.path().join("mpool.log"))))?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;

    thread::scope(|scope| -> Result<()> {
        let mut committers = Vec::new();
        for worker in 0..4u32 {
            let (pool, file) = (&pool, &file);
            committers.push(scope.spawn(move || -> Result<()> {
                for round in 0..50u32 {
                    let txn = pool.begin_txn();
                    stamp(pool, file, worker, round as u8, Some(txn))?;
                    stamp(pool, file, worker + 4, round as u8, Some(txn))?;
                    pool.end_txn(txn)?;
                }
                Ok(())
            }));
        }
        while !committers.iter().all(|c| c.is_finished()) {
            if let CheckpointOutcome::Completed { ckp_lsn, .. } = pool.checkpoint(true)? {
                for txn in pool.region_snapshot().active_txns {
                    if let Some(begin) = txn.begin_lsn {
                        assert!(begin >= ckp_lsn, "txn {:?} began at {begin:?} before {ckp_lsn:?}", txn.id);
                    }
                }
            }
        }
        for committer in committers {
            committer.join().expect("committer panicked")?;
        }
        Ok(())
    })?;
    drop(file);
    pool.close()
}

#[test]
fn thresholds_skip_unforced_checkpoints() -> Result<()> {
    let dir = tempdir()?;
    let pool = Pool::open(PoolOptions {
        checkpoint_kbytes: 1024,
        ..options(None)
    })?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;
    stamp(&pool, &file, 0, 1, None)?;
    assert_eq!(pool.checkpoint(false)?, CheckpointOutcome::Skipped);
    assert_eq!(pool.last_checkpoint_lsn(), Lsn(0));
    assert_eq!(pool.flush_list_snapshot().len(), 1);

    completed(pool.checkpoint(true)?);
    assert_eq!(pool.checkpoint(false)?, CheckpointOutcome::Skipped);
    let stats = pool.stats();
    assert_eq!(stats.checkpoints, 1);
    assert_eq!(stats.checkpoints_skipped, 2);
    drop(file);
    pool.close()
}

#[test]
fn nothing_logged_since_last_checkpoint_is_skipped() -> Result<()> {
    let dir = tempdir()?;
    let pool = Pool::open(options(None))?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;
    stamp(&pool, &file, 0, 1, None)?;
    completed(pool.checkpoint(false)?);
    assert_eq!(pool.checkpoint(false)?, CheckpointOutcome::Skipped);
    drop(file);
    pool.close()
}

#[test]
fn active_transaction_holds_back_the_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let pool = Pool::open(options(None))?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;

    stamp(&pool, &file, 0, 1, None)?;
    let txn = pool.begin_txn();
    let begin = stamp(&pool, &file, 1, 2, Some(txn))?;
    stamp(&pool, &file, 1, 3, Some(txn))?;
    stamp(&pool, &file, 2, 4, None)?;
    let snap = pool.region_snapshot();
    assert_eq!(snap.active_txns.len(), 1);
    assert_eq!(snap.active_txns[0].begin_lsn, Some(begin.start));

    let (ckp_lsn, _, _) = completed(pool.checkpoint(true)?);
    assert_eq!(ckp_lsn, begin.start);
    let remaining: Vec<u32> = pool
        .flush_list_snapshot()
        .iter()
        .map(|e| e.page.page_no)
        .collect();
    assert_eq!(remaining, vec![1, 2]);

    stamp(&pool, &file, 3, 5, None)?;
    let (again, _, _) = completed(pool.checkpoint(true)?);
    assert_eq!(again, begin.start);
    assert_eq!(pool.last_checkpoint_lsn(), begin.start);

    pool.end_txn(txn)?;
    assert!(matches!(pool.end_txn(txn), Err(MpoolError::NotFound)));
    let (released, _, _) = completed(pool.checkpoint(true)?);
    assert!(released > begin.start);
    assert_eq!(pool.last_checkpoint_lsn(), released);
    assert!(pool.flush_list_snapshot().is_empty());
    drop(file);
    pool.close()
}

#[test]
fn explicit_begin_lsn_bounds_the_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let pool = Pool::open(options(None))?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;
    let first = stamp(&pool, &file, 0, 1, None)?;
    stamp(&pool, &file, 1, 1, None)?;
    let txn = pool.begin_txn();
    pool.set_txn_begin_lsn(txn, first.end)?;
    let (ckp_lsn, _, _) = completed(pool.checkpoint(true)?);
    assert_eq!(ckp_lsn, first.end);
    assert_eq!(pool.flush_list_snapshot().len(), 1);
    pool.end_txn(txn)?;
    assert!(matches!(
        pool.set_txn_begin_lsn(txn, first.end),
        Err(MpoolError::NotFound)
    ));
    drop(file);
    pool.close()
}

#[test]
fn checkpoint_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    let log_path = dir.path().join("mpool.log");
    let data = dir.path().join("f.db");

    let (ckp_lsn, record) = {
        let pool = Pool::open(options(Some(log_path.clone())))?;
        let file = pool.open_file(&data, FileOptions::create())?;
        stamp(&pool, &file, 0, 9, None)?;
        completed(pool.checkpoint(true)?);
        stamp(&pool, &file, 1, 9, None)?;
        let (ckp_lsn, record, generation) = completed(pool.checkpoint(true)?);
        assert_eq!(generation, 2);
        drop(file);
        pool.close()?;
        (ckp_lsn, record)
    };

    let raw = fs::read(&log_path)?;
    let start = record.start.0 as usize;
    let decoded = CheckpointRecord::decode(&raw[start..start + CHECKPOINT_RECORD_LEN])?;
    assert_eq!(decoded.ckp_lsn, ckp_lsn);
    assert_eq!(decoded.env_id, 42);
    assert_eq!(decoded.generation, 2);
    assert!(decoded.prev_ckp_lsn < ckp_lsn);

    let pool = Pool::open(options(Some(log_path)))?;
    assert_eq!(pool.last_checkpoint_lsn(), ckp_lsn);
    assert!(pool.current_lsn() >= record.end);
    let snap = pool.region_snapshot();
    assert_eq!(snap.generation, 2);
    assert_eq!(snap.env_id, 42);
    let file = pool.open_file(&data, FileOptions::default())?;
    assert_eq!(pool.pin(&file, 1, PinFlags::default())?.read()[0], 9);
    drop(file);
    pool.close()
}

#[test]
fn read_only_pool_only_flushes() -> Result<()> {
    let dir = tempdir()?;
    let data = dir.path().join("f.db");
    let pool = Pool::open(PoolOptions {
        read_only: true,
        ..options(None)
    })?;
    let file = pool.open_file(&data, FileOptions::create())?;
    stamp(&pool, &file, 2, 7, None)?;
    let before = pool.current_lsn();
    assert_eq!(pool.checkpoint(true)?, CheckpointOutcome::FlushedOnly);
    assert_eq!(pool.current_lsn(), before);
    assert_eq!(pool.last_checkpoint_lsn(), Lsn(0));
    assert_eq!(on_disk(&data, 2)?, 7);
    drop(file);
    pool.close()
}

#[test]
fn background_checkpointer_advances() -> Result<()> {
    let dir = tempdir()?;
    let pool = Pool::open(PoolOptions {
        checkpoint_interval_ms: 20,
        ..options(None)
    })?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;
    let range = stamp(&pool, &file, 0, 1, None)?;
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.last_checkpoint_lsn() < range.end {
        assert!(Instant::now() < deadline, "background checkpoint never ran");
        thread::sleep(Duration::from_millis(10));
    }
    assert!(pool.stats().checkpoints >= 1);
    drop(file);
    pool.close()
}

#[test]
fn outcome_serializes_without_the_record_range() -> Result<()> {
    let dir = tempdir()?;
    let pool = Pool::open(options(None))?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;
    stamp(&pool, &file, 0, 1, None)?;
    let outcome = pool.checkpoint(true)?;
    let doc = serde_json::to_value(outcome).expect("outcome json");
    assert_eq!(doc["outcome"], "completed");
    assert_eq!(doc["generation"], 1);
    assert!(doc.get("record").is_none());
    drop(file);
    pool.close()
}
