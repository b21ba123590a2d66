#![allow(missing_docs)]

use std::collections::BTreeMap;

use mpool::{
    CachePriority, FileHandle, FileOptions, LatchMode, PinFlags, Pool, PoolOptions, Result,
};
use proptest::prelude::*;

const PAGES: u32 = 12;
const PAGE_SIZE: usize = 512;

#[derive(Debug, Clone)]
enum Op {
    Read { page: u32 },
    Write { page: u32, offset: usize, value: u8 },
    WriteTwo { a: u32, b: u32, value: u8 },
    Abort { page: u32, value: u8 },
    Priority { page: u32, class: CachePriority },
    Checkpoint,
    FlushAll,
}

fn arb_priority() -> impl Strategy<Value = CachePriority> {
    prop_oneof![
        Just(CachePriority::VeryLow),
        Just(CachePriority::Low),
        Just(CachePriority::Default),
        Just(CachePriority::High),
        Just(CachePriority::VeryHigh),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..PAGES).prop_map(|page| Op::Read { page }),
        4 => (0..PAGES, 0..PAGE_SIZE, any::<u8>())
            .prop_map(|(page, offset, value)| Op::Write { page, offset, value }),
        1 => (0..PAGES, 0..PAGES, any::<u8>())
            .prop_map(|(a, b, value)| Op::WriteTwo { a, b, value }),
        1 => (0..PAGES, any::<u8>()).prop_map(|(page, value)| Op::Abort { page, value }),
        1 => (0..PAGES, arb_priority()).prop_map(|(page, class)| Op::Priority { page, class }),
        1 => Just(Op::Checkpoint),
        1 => Just(Op::FlushAll),
    ]
}

fn write(pool: &Pool, file: &FileHandle, page: u32, offset: usize, value: u8) -> Result<()> {
    let mut mtr = pool.mtr();
    let slot = mtr.get_page(file, page, LatchMode::Exclusive, PinFlags::create())?;
    mtr.modify(slot)?[offset] = value;
    mtr.append_log(&[0x04, value]);
    mtr.commit().map(|_| ())
}

fn run_ops(ops: &[Op]) -> Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = Pool::open(PoolOptions {
        page_size: PAGE_SIZE as u32,
        pool_pages: 4,
        io_workers: 2,
        ..PoolOptions::default()
    })?;
    let file = pool.open_file(dir.path().join("p.db"), FileOptions::create())?;
    let mut model: BTreeMap<(u32, usize), u8> = BTreeMap::new();
    let expect = |model: &BTreeMap<(u32, usize), u8>, page: u32, offset: usize| {
        model.get(&(page, offset)).copied().unwrap_or(0)
    };

    for op in ops {
        match *op {
            Op::Read { page } => {
                let pinned = pool.pin(&file, page, PinFlags::create())?;
                let frame = pinned.read();
                for (&(p, offset), &value) in model.range((page, 0)..(page + 1, 0)) {
                    assert_eq!(p, page);
                    assert_eq!(frame[offset], value, "page {page} offset {offset}");
                }
            }
            Op::Write {
                page,
                offset,
                value,
            } => {
                write(&pool, &file, page, offset, value)?;
                model.insert((page, offset), value);
            }
            Op::WriteTwo { a, b, value } => {
                let mut mtr = pool.mtr();
                let sa = mtr.get_page(&file, a, LatchMode::Exclusive, PinFlags::create())?;
                let sb = mtr.get_page(&file, b, LatchMode::Exclusive, PinFlags::create())?;
                mtr.modify(sa)?[1] = value;
                mtr.modify(sb)?[2] = value;
                mtr.append_log(&[0x05, value]);
                mtr.append_log(&[0x06, value]);
                mtr.commit()?;
                model.insert((a, 1), value);
                model.insert((b, 2), value);
            }
            Op::Abort { page, value } => {
                let mut mtr = pool.mtr();
                let slot = mtr.get_page(&file, page, LatchMode::Exclusive, PinFlags::create())?;
                mtr.modify(slot)?[3] = value.wrapping_add(1);
                mtr.abort();
                let pinned = pool.pin(&file, page, PinFlags::create())?;
                assert_eq!(pinned.read()[3], expect(&model, page, 3));
            }
            Op::Priority { page, class } => {
                let pinned = pool.pin(&file, page, PinFlags::create())?;
                pinned.set_priority(class);
            }
            Op::Checkpoint => {
                pool.checkpoint(true)?;
                let ckp = pool.last_checkpoint_lsn();
                assert!(pool.flush_list_snapshot().iter().all(|e| e.oldest >= ckp));
            }
            Op::FlushAll => {
                pool.flush_all()?;
                assert!(pool.flush_list_snapshot().is_empty());
            }
        }
        pool.verify()?;
        assert!(pool.resident_pages().len() <= 4);
    }

    for page in 0..PAGES {
        let pinned = pool.pin(&file, page, PinFlags::create())?;
        let frame = pinned.read();
        for offset in 0..PAGE_SIZE {
            assert_eq!(frame[offset], expect(&model, page, offset), "page {page} offset {offset}");
        }
    }
    let flush = pool.flush_list_snapshot();
    assert!(flush.windows(2).all(|w| w[0].oldest <= w[1].oldest));
    drop(file);
    pool.close()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn pool_matches_a_flat_model(ops in prop::collection::vec(arb_op(), 1..120)) {
        let outcome = run_ops(&ops);
        prop_assert!(outcome.is_ok(), "{:?}", outcome.err());
    }
}
