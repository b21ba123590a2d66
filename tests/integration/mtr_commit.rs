#![allow(missing_docs)]

use std::fs;
use std::sync::Barrier;
use std::thread;

use mpool::{
    FileHandle, FileOptions, LatchMode, Lsn, LsnRange, MpoolError, PinFlags, Pool, PoolOptions,
    Result,
};
use tempfile::tempdir;

const PAGE_SIZE: usize = 4096;

fn open_pool(pool_pages: usize, log_capacity_bytes: u64) -> Result<Pool> {
    Pool::open(PoolOptions {
        page_size: PAGE_SIZE as u32,
        pool_pages,
        io_workers: 2,
        log_capacity_bytes,
        ..PoolOptions::default()
    })
}

fn write_byte(pool: &Pool, file: &FileHandle, page_no: u32, offset: usize, value: u8) -> Result<LsnRange> {
    let mut mtr = pool.mtr();
    let slot = mtr.get_page(file, page_no, LatchMode::Exclusive, PinFlags::create())?;
    mtr.modify(slot)?[offset] = value;
    let mut record = [0u8; 9];
    record[0] = 0x01;
    record[1..5].copy_from_slice(&page_no.to_be_bytes());
    record[5..9].copy_from_slice(&(offset as u32).to_be_bytes());
    mtr.append_log(&record);
    mtr.append_log(&[value]);
    mtr.commit()?.ok_or(MpoolError::Invalid("commit wrote no log"))
}

#[test]
fn flush_list_follows_commit_order_across_threads() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool(16, 0)?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;
    let barrier = Barrier::new(2);

    let ranges: Vec<Vec<LsnRange>> = thread::scope(|scope| {
        let handles: Vec<_> = [0u32, 1]
            .into_iter()
            .map(|base| {
                let (pool, file, barrier) = (&pool, &file, &barrier);
                scope.spawn(move || -> Result<Vec<LsnRange>> {
                    barrier.wait();
                    (0..4)
                        .map(|i| write_byte(pool, file, base * 4 + i, 16, i as u8 + 1))
                        .collect()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("commit thread"))
            .collect::<Result<_>>()
    })?;

    for per_thread in &ranges {
        assert!(per_thread.windows(2).all(|w| w[0].end <= w[1].start));
    }
    let flush = pool.flush_list_snapshot();
    assert_eq!(flush.len(), 8);
    assert!(flush.windows(2).all(|w| w[0].oldest <= w[1].oldest));
    let mut all: Vec<LsnRange> = ranges.into_iter().flatten().collect();
    all.sort_by_key(|r| r.start);
    let oldest: Vec<Lsn> = flush.iter().map(|e| e.oldest).collect();
    let starts: Vec<Lsn> = all.iter().map(|r| r.start).collect();
    assert_eq!(oldest, starts);
    pool.verify()?;
    drop(file);
    pool.close()
}

#[test]
fn repeated_modification_keeps_the_first_lsn() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool(8, 0)?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;
    let first = write_byte(&pool, &file, 3, 0, 1)?;
    let second = write_byte(&pool, &file, 3, 1, 2)?;
    let flush = pool.flush_list_snapshot();
    assert_eq!(flush.len(), 1);
    assert_eq!(flush[0].oldest, first.start);
    assert_eq!(flush[0].newest, second.end);

    let flushes = pool.stats().log.flushes;
    pool.flush_log()?;
    assert_eq!(pool.stats().log.flushes, flushes + 1);
    pool.flush_log()?;
    assert_eq!(pool.stats().log.flushes, flushes + 1);
    drop(file);
    pool.close()
}

#[test]
fn concurrent_commits_keep_the_pool_consistent() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool(8, 0)?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;

    thread::scope(|scope| -> Result<()> {
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let (pool, file) = (&pool, &file);
                scope.spawn(move || -> Result<()> {
                    let mut last = Lsn(0);
                    for i in 0..200u32 {
                        let range = write_byte(pool, file, (t * 7 + i) % 24, t as usize, i as u8)?;
                        assert!(range.start >= last);
                        last = range.end;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("commit thread")?;
        }
        Ok(())
    })?;

    pool.verify()?;
    let stats = pool.stats();
    assert_eq!(stats.log.writes, 800);
    assert!(stats.evictions > 0);
    assert!(stats.dirty_writebacks > 0);
    pool.flush_all()?;
    assert!(pool.flush_list_snapshot().is_empty());
    drop(file);
    pool.close()
}

#[test]
fn evicted_page_is_read_back_with_its_changes() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("f.db");
    let pool = open_pool(4, 0)?;
    let file = pool.open_file(&path, FileOptions::create())?;
    for page_no in 0..12u32 {
        write_byte(&pool, &file, page_no, 100, page_no as u8 + 10)?;
    }
    assert!(pool.stats().dirty_writebacks >= 8);

    for page_no in 0..12u32 {
        let page = pool.pin(&file, page_no, PinFlags::default())?;
        assert_eq!(page.read()[100], page_no as u8 + 10, "page {page_no}");
    }

    pool.flush_all()?;
    let raw = fs::read(&path)?;
    assert_eq!(raw.len(), 12 * PAGE_SIZE);
    for page_no in 0..12usize {
        assert_eq!(raw[page_no * PAGE_SIZE + 100], page_no as u8 + 10);
    }
    drop(file);
    pool.close()
}

#[test]
fn full_log_aborts_until_a_checkpoint_frees_room() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool(8, 128)?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;

    let commit = |value: u8| -> Result<Option<LsnRange>> {
        let mut mtr = pool.mtr();
        let slot = mtr.get_page(&file, 0, LatchMode::Exclusive, PinFlags::create())?;
        mtr.modify(slot)?[0] = value;
        mtr.append_log(&[value; 80]);
        mtr.commit()
    };

    commit(1)?;
    let err = commit(2).unwrap_err();
    assert!(matches!(err, MpoolError::LogFull { needed: 80, .. }), "{err:?}");
    {
        let page = pool.pin(&file, 0, PinFlags::default())?;
        assert_eq!(page.read()[0], 1);
    }
    assert_eq!(pool.flush_list_snapshot().len(), 1);

    pool.checkpoint(true)?;
    assert!(pool.flush_list_snapshot().is_empty());
    commit(3)?;
    let page = pool.pin(&file, 0, PinFlags::default())?;
    assert_eq!(page.read()[0], 3);
    drop(page);
    drop(file);
    pool.close()
}

#[test]
fn file_latch_is_held_until_commit() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool(4, 0)?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;
    let mut mtr = pool.mtr();
    mtr.lock_file(&file)?;
    mtr.lock_file(&file)?;
    assert_eq!(file.file().mutex().depth(), 2);

    let contended = thread::scope(|scope| {
        scope
            .spawn(|| file.file().mutex().try_acquire())
            .join()
            .expect("probe thread")
    })?;
    assert!(!contended);

    assert_eq!(mtr.commit()?, None);
    assert_eq!(file.file().mutex().depth(), 0);
    drop(file);
    pool.close()
}
