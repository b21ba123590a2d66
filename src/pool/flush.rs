#![forbid(unsafe_code)]

//! Flush list: dirty buffers ordered by oldest modification LSN.
//!
//! A doubly linked list threaded through a per-buffer link array, guarded by
//! the flush-order mutex. Commits insert at the tail in LSN order, so the
//! backward walk in [`FlushLinks::insert`] is normally zero steps.

use serde::Serialize;

use crate::primitives::concurrency::{LockRank, RankedGuard, RankedMutex};
use crate::types::{BhId, Lsn, PageId};

/// One dirty buffer as seen in the flush list.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct FlushEntry {
    /// Buffer header slot.
    pub bh: BhId,
    /// Page held by the buffer.
    pub page: PageId,
    /// LSN of the first unwritten modification.
    pub oldest: Lsn,
    /// LSN of the last modification.
    pub newest: Lsn,
}

#[derive(Clone, Copy, Default)]
struct Link {
    prev: Option<BhId>,
    next: Option<BhId>,
    oldest: Lsn,
    linked: bool,
}

pub(crate) struct FlushLinks {
    links: Vec<Link>,
    head: Option<BhId>,
    tail: Option<BhId>,
    len: usize,
}

impl FlushLinks {
    fn new(slots: usize) -> Self {
        Self {
            links: vec![Link::default(); slots],
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Links `id` after the last entry whose LSN does not exceed `oldest`.
    pub fn insert(&mut self, id: BhId, oldest: Lsn) {
        if self.links[id.index()].linked {
            return;
        }
        let mut after = self.tail;
        while let Some(cur) = after {
            if self.links[cur.index()].oldest <= oldest {
                break;
            }
            after = self.links[cur.index()].prev;
        }
        let next = match after {
            Some(a) => self.links[a.index()].next,
            None => self.head,
        };
        self.links[id.index()] = Link {
            prev: after,
            next,
            oldest,
            linked: true,
        };
        match after {
            Some(a) => self.links[a.index()].next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(n) => self.links[n.index()].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    pub fn remove(&mut self, id: BhId) -> bool {
        let link = self.links[id.index()];
        if !link.linked {
            return false;
        }
        match link.prev {
            Some(p) => self.links[p.index()].next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => self.links[n.index()].prev = link.prev,
            None => self.tail = link.prev,
        }
        self.links[id.index()] = Link::default();
        self.len -= 1;
        true
    }

    pub fn contains(&self, id: BhId) -> bool {
        self.links[id.index()].linked
    }

    pub fn head_lsn(&self) -> Option<Lsn> {
        self.head.map(|h| self.links[h.index()].oldest)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = (BhId, Lsn)> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let id = cur?;
            let link = &self.links[id.index()];
            cur = link.next;
            Some((id, link.oldest))
        })
    }
}

pub(crate) struct FlushList {
    inner: RankedMutex<FlushLinks>,
}

impl FlushList {
    pub fn new(slots: usize) -> Self {
        Self {
            inner: RankedMutex::new(LockRank::FlushOrder, FlushLinks::new(slots)),
        }
    }

    /// Takes the flush-order mutex.
    pub fn lock(&self) -> RankedGuard<'_, FlushLinks> {
        self.inner.lock()
    }
}
