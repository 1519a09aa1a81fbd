//! Run queue (component F, §4.6): 32 FIFO lists, one per priority level,
//! plus a 32-bit bitmap of non-empty levels so `get` is a single
//! trailing-zero-count away from the highest-priority ready fiber.
//!
//! Links are intrusive in spirit (O(1) put/get/delete) but kept in a side
//! table here, keyed by the fiber pool's raw slot index, rather than
//! embedded directly in `Fiber` — it lets the run queue stay a free-standing
//! component with its own tests, independent of the fiber representation.

use crate::fiber::FiberId;

const LEVELS: usize = 32;

#[derive(Clone, Copy, Default)]
struct Entry {
    prev: Option<FiberId>,
    next: Option<FiberId>,
    priority: u8,
    linked: bool,
}

pub struct RunQueue {
    bitmap: u32,
    heads: [Option<FiberId>; LEVELS],
    tails: [Option<FiberId>; LEVELS],
    entries: Vec<Entry>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            bitmap: 0,
            heads: [None; LEVELS],
            tails: [None; LEVELS],
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    fn entry(&mut self, id: FiberId) -> &mut Entry {
        let idx = id.raw_index() as usize;
        if idx >= self.entries.len() {
            self.entries.resize(idx + 1, Entry::default());
        }
        &mut self.entries[idx]
    }

    /// Appends `id` to the list for `priority` (0 = highest), setting the
    /// bitmap bit.
    pub fn put(&mut self, id: FiberId, priority: u8) {
        assert!((priority as usize) < LEVELS, "priority out of range");
        let level = priority as usize;
        let tail = self.tails[level];
        {
            let e = self.entry(id);
            debug_assert!(!e.linked, "fiber already linked in run queue");
            e.prev = tail;
            e.next = None;
            e.priority = priority;
            e.linked = true;
        }
        match tail {
            Some(t) => self.entries[t.raw_index() as usize].next = Some(id),
            None => {
                self.heads[level] = Some(id);
                self.bitmap |= 1 << level;
            }
        }
        self.tails[level] = Some(id);
    }

    /// Pops the head of the lowest-numbered (highest-priority) non-empty
    /// list, clearing the bitmap bit if that list becomes empty.
    pub fn get(&mut self) -> Option<FiberId> {
        if self.bitmap == 0 {
            return None;
        }
        let level = self.bitmap.trailing_zeros() as usize;
        let id = self.heads[level].expect("bitmap bit implies non-empty list");
        self.remove(id, level);
        Some(id)
    }

    /// Re-links `id` at `priority`, moving it out of whichever level it is
    /// currently queued at (§4.6 `hoist`). Returns `false` if it was not
    /// currently linked — the caller raised a fiber's priority while it
    /// was running or blocked, which takes effect next time it is queued
    /// instead.
    pub fn reprioritize(&mut self, id: FiberId, priority: u8) -> bool {
        assert!((priority as usize) < LEVELS, "priority out of range");
        if !self.delete(id) {
            return false;
        }
        self.put(id, priority);
        true
    }

    /// Removes a specific fiber from wherever it is linked. Returns `false`
    /// if it was not linked (already scheduled, already removed).
    pub fn delete(&mut self, id: FiberId) -> bool {
        let idx = id.raw_index() as usize;
        if idx >= self.entries.len() || !self.entries[idx].linked {
            return false;
        }
        let level = self.entries[idx].priority as usize;
        self.remove(id, level);
        true
    }

    fn remove(&mut self, id: FiberId, level: usize) {
        let idx = id.raw_index() as usize;
        let (prev, next) = {
            let e = &self.entries[idx];
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.entries[p.raw_index() as usize].next = next,
            None => self.heads[level] = next,
        }
        match next {
            Some(n) => self.entries[n.raw_index() as usize].prev = prev,
            None => self.tails[level] = prev,
        }
        self.entries[idx].linked = false;
        if self.heads[level].is_none() {
            self.bitmap &= !(1 << level);
        }
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    fn ids(n: usize) -> Vec<FiberId> {
        let mut pool: Pool<()> = Pool::new();
        (0..n).map(|_| pool.alloc(())).collect()
    }

    #[test]
    fn fifo_within_a_priority_level() {
        let fibers = ids(3);
        let mut q = RunQueue::new();
        for &f in &fibers {
            q.put(f, 5);
        }
        assert_eq!(q.get(), Some(fibers[0]));
        assert_eq!(q.get(), Some(fibers[1]));
        assert_eq!(q.get(), Some(fibers[2]));
        assert_eq!(q.get(), None);
    }

    #[test]
    fn higher_priority_wins_before_lower() {
        let fibers = ids(2);
        let mut q = RunQueue::new();
        q.put(fibers[0], 10);
        q.put(fibers[1], 2);
        assert_eq!(q.get(), Some(fibers[1]));
        assert_eq!(q.get(), Some(fibers[0]));
    }

    #[test]
    fn delete_removes_from_middle_of_list() {
        let fibers = ids(3);
        let mut q = RunQueue::new();
        for &f in &fibers {
            q.put(f, 1);
        }
        assert!(q.delete(fibers[1]));
        assert_eq!(q.get(), Some(fibers[0]));
        assert_eq!(q.get(), Some(fibers[2]));
        assert_eq!(q.get(), None);
    }

    #[test]
    fn delete_of_unlinked_fiber_is_noop() {
        let fibers = ids(1);
        let mut q = RunQueue::new();
        assert!(!q.delete(fibers[0]));
        q.put(fibers[0], 0);
        assert!(q.delete(fibers[0]));
        assert!(!q.delete(fibers[0]));
    }

    #[test]
    fn reprioritize_moves_a_queued_fiber_to_a_higher_level() {
        let fibers = ids(2);
        let mut q = RunQueue::new();
        q.put(fibers[0], 10);
        q.put(fibers[1], 10);
        assert!(q.reprioritize(fibers[1], 1));
        assert_eq!(q.get(), Some(fibers[1]));
        assert_eq!(q.get(), Some(fibers[0]));
    }

    #[test]
    fn reprioritize_of_unlinked_fiber_is_noop() {
        let fibers = ids(1);
        let mut q = RunQueue::new();
        assert!(!q.reprioritize(fibers[0], 0));
    }

    #[test]
    fn bitmap_clears_when_level_empties() {
        let fibers = ids(1);
        let mut q = RunQueue::new();
        assert!(q.is_empty());
        q.put(fibers[0], 3);
        assert!(!q.is_empty());
        q.get();
        assert!(q.is_empty());
    }
}
