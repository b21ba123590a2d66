#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use mpool::{
    FileHandle, FileOptions, LatchMode, Lsn, MpoolError, PageHooks, PinFlags, Pool, PoolOptions,
    Result,
};
use tempfile::tempdir;

const PAGE_SIZE: usize = 4096;
const FLAKY_TYPE: u32 = 7;
const CRC_TYPE: u32 = 8;

fn open_pool() -> Result<Pool> {
    Pool::open(PoolOptions {
        page_size: PAGE_SIZE as u32,
        pool_pages: 8,
        io_workers: 2,
        checkpoint_flush_timeout_ms: 5_000,
        ..PoolOptions::default()
    })
}

fn typed(file_type: u32) -> FileOptions {
    FileOptions {
        file_type,
        ..FileOptions::create()
    }
}

fn stamp(pool: &Pool, file: &FileHandle, page_no: u32, value: u8) -> Result<()> {
    let mut mtr = pool.mtr();
    let slot = mtr.get_page(file, page_no, LatchMode::Exclusive, PinFlags::create())?;
    mtr.modify(slot)?[0] = value;
    mtr.append_log(&[0x03, value]);
    mtr.commit().map(|_| ())
}

fn preallocate(path: &Path, pages: u64) -> Result<()> {
    File::create(path)?.set_len(pages * PAGE_SIZE as u64)?;
    Ok(())
}

#[test]
fn failed_page_in_discards_the_buffer() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("f.db");
    preallocate(&path, 4)?;
    let pool = open_pool()?;
    let failures_left = Arc::new(AtomicUsize::new(1));
    let left = Arc::clone(&failures_left);
    pool.register_file_type(
        FLAKY_TYPE,
        PageHooks::identity().with_pgin(move |_pid, _frame, _cookie| {
            let remaining = left.load(Ordering::SeqCst);
            if remaining > 0 {
                left.store(remaining - 1, Ordering::SeqCst);
                return Err("injected page-in failure".into());
            }
            Ok(())
        }),
    );
    let file = pool.open_file(&path, typed(FLAKY_TYPE))?;

    let err = pool.pin(&file, 2, PinFlags::default()).unwrap_err();
    assert!(matches!(&err, MpoolError::PageHook { page, .. } if *page == file.page_id(2)));
    assert!(pool.resident_pages().is_empty());
    let stats = pool.stats();
    assert_eq!(stats.read_errors, 1);
    assert_eq!(stats.free_frames, 8);

    let page = pool.pin(&file, 2, PinFlags::default())?;
    assert!(page.read().iter().all(|&b| b == 0));
    drop(page);
    assert_eq!(failures_left.load(Ordering::SeqCst), 0);
    pool.verify()?;
    drop(file);
    pool.close()
}

#[test]
fn failed_page_out_aborts_the_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool()?;
    let failing = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&failing);
    pool.register_file_type(
        FLAKY_TYPE,
        PageHooks::identity().with_pgout(move |_pid, _frame, _cookie| {
            if flag.load(Ordering::SeqCst) {
                Err("injected page-out failure".into())
            } else {
                Ok(())
            }
        }),
    );
    let file = pool.open_file(dir.path().join("f.db"), typed(FLAKY_TYPE))?;
    stamp(&pool, &file, 0, 1)?;

    let err = pool.checkpoint(true).unwrap_err();
    assert!(matches!(err, MpoolError::PageHook { .. }), "{err:?}");
    assert_eq!(pool.last_checkpoint_lsn(), Lsn(0));
    let stats = pool.stats();
    assert_eq!(stats.write_errors, 1);
    assert_eq!(stats.checkpoints, 0);
    assert!(pool.flush_list_snapshot().is_empty());
    assert!(pool.resident_pages().is_empty());

    failing.store(false, Ordering::SeqCst);
    stamp(&pool, &file, 1, 2)?;
    pool.checkpoint(true)?;
    assert!(pool.last_checkpoint_lsn() > Lsn(0));
    drop(file);
    pool.close()
}

#[test]
fn checksum_detects_corruption_on_disk() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("f.db");
    {
        let pool = open_pool()?;
        pool.register_file_type(CRC_TYPE, PageHooks::crc32());
        let file = pool.open_file(&path, typed(CRC_TYPE))?;
        stamp(&pool, &file, 0, 0xAB)?;
        stamp(&pool, &file, 1, 0xCD)?;
        drop(file);
        pool.close()?;
    }

    let mut raw = OpenOptions::new().read(true).write(true).open(&path)?;
    let offset = PAGE_SIZE as u64 + 17;
    let mut byte = [0u8; 1];
    raw.seek(SeekFrom::Start(offset))?;
    raw.read_exact(&mut byte)?;
    byte[0] ^= 0xFF;
    raw.seek(SeekFrom::Start(offset))?;
    raw.write_all(&byte)?;
    raw.sync_all()?;
    drop(raw);

    let pool = open_pool()?;
    pool.register_file_type(CRC_TYPE, PageHooks::crc32());
    let file = pool.open_file(&path, typed(CRC_TYPE))?;
    assert_eq!(pool.pin(&file, 0, PinFlags::default())?.read()[0], 0xAB);
    let err = pool.pin(&file, 1, PinFlags::default()).unwrap_err();
    match err {
        MpoolError::PageHook { page, reason } => {
            assert_eq!(page, file.page_id(1));
            assert!(reason.contains("checksum mismatch"), "{reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    drop(file);
    pool.close()
}

#[test]
fn missing_page_without_create_is_a_short_read() -> Result<()> {
    let dir = tempdir()?;
    let pool = open_pool()?;
    let file = pool.open_file(dir.path().join("f.db"), FileOptions::create())?;
    let err = pool.pin(&file, 5, PinFlags::default()).unwrap_err();
    assert!(matches!(err, MpoolError::ShortRead { read: 0, .. }));
    assert!(pool.resident_pages().is_empty());
    pool.pin(&file, 5, PinFlags::create())?.unpin();
    assert_eq!(pool.resident_pages(), vec![file.page_id(5)]);
    drop(file);
    pool.close()
}

#[test]
fn dead_file_drops_dirty_pages() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("f.db");
    let pool = open_pool()?;
    let file = pool.open_file(&path, FileOptions::create())?;
    stamp(&pool, &file, 0, 1)?;
    stamp(&pool, &file, 1, 1)?;
    file.mark_dead();
    assert!(file.file().is_dead());

    pool.flush_all()?;
    let stats = pool.stats();
    assert_eq!(stats.dead_drops, 2);
    assert_eq!(stats.write_errors, 0);
    assert_eq!(stats.writes, 0);
    assert!(pool.resident_pages().is_empty());
    assert_eq!(fs::metadata(&path)?.len(), 0);
    drop(file);
    pool.close()
}

#[test]
fn dirty_page_of_readonly_file_cannot_be_written() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("f.db");
    preallocate(&path, 2)?;
    let pool = open_pool()?;
    let file = pool.open_file(
        &path,
        FileOptions {
            readonly: true,
            ..FileOptions::default()
        },
    )?;
    assert!(file.file().is_readonly());
    stamp(&pool, &file, 0, 5)?;

    let err = pool.sync_file(&file).unwrap_err();
    match err {
        MpoolError::Io(io_err) => assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(pool.stats().write_errors, 1);
    assert!(pool.flush_list_snapshot().is_empty());
    drop(file);
    pool.close()
}
