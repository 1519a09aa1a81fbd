//! MPMC ring (component A, §4.1): a bounded lock-free queue of fixed-width
//! slots used by every cross-context path — the async inbox (§4.5) and, in
//! this crate, nothing else reaches across an OS-thread boundary directly.
//!
//! Each node carries a `lock` stamp and a fixed number of word-sized payload
//! slots. A node is empty when its lock stamp equals the producer stamp that
//! would next write it, and full when its lock stamp equals that stamp plus
//! one. Stamps are monotonic `u64`s, so there is no ABA hazard: indices wrap
//! via `stamp & mask`, but the stamp itself never does.

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

/// Word-sized payload slots per node. Matches the "seven in the current
/// encoding" of the distilled spec, enough to bundle a routine pointer plus
/// six `uintptr_t`-sized arguments for an async call (§4.5).
pub const NODE_WIDTH: usize = 7;

struct Node {
    lock: AtomicU64,
    slots: [UnsafeCell<usize>; NODE_WIDTH],
}

// SAFETY: `slots` is only ever written by the producer that just won the CAS
// on `tail`, and only ever read by the consumer that just won the CAS on
// `head` for the matching stamp; the `lock` stamp acts as the handoff fence.
unsafe impl Sync for Node {}

/// A bounded power-of-two-sized MPMC ring of fixed-width slots.
pub struct Ring {
    mask: u64,
    size: u64,
    nodes: Box<[Node]>,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

// SAFETY: all mutable access to node payloads is mediated by the lock stamp
// CAS protocol described above.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Creates a ring with room for `size` slots. `size` must be a power of
    /// two and at least 1.
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        let nodes: Box<[Node]> = (0..size as u64)
            .map(|i| Node {
                lock: AtomicU64::new(i),
                slots: std::array::from_fn(|_| UnsafeCell::new(0)),
            })
            .collect();
        Self {
            mask: size as u64 - 1,
            size: size as u64,
            nodes,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.size as usize
    }

    /// Producer stamp minus consumer stamp; always in `0..=capacity()`.
    pub fn len(&self) -> usize {
        let t = self.tail.load(Ordering::Relaxed);
        let h = self.head.load(Ordering::Relaxed);
        t.saturating_sub(h) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node_at(&self, stamp: u64) -> &Node {
        &self.nodes[(stamp & self.mask) as usize]
    }

    /// Non-blocking producer. Returns `false` if the ring is full or another
    /// producer won the race for the next slot; the caller may retry.
    pub fn put(&self, values: &[usize]) -> bool {
        debug_assert!(values.len() <= NODE_WIDTH);
        loop {
            let t = self.tail.load(Ordering::Relaxed);
            let node = self.node_at(t);
            if node.lock.load(Ordering::Acquire) != t {
                return false;
            }
            match self.tail.compare_exchange_weak(
                t,
                t + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.publish(node, values);
                    node.lock.store(t + 1, Ordering::Release);
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    /// Non-blocking consumer. Returns `false` if the ring is empty or
    /// another consumer won the race for the next slot.
    pub fn get(&self, out: &mut [usize]) -> bool {
        debug_assert!(out.len() <= NODE_WIDTH);
        loop {
            let h = self.head.load(Ordering::Relaxed);
            let node = self.node_at(h);
            if node.lock.load(Ordering::Acquire) != h + 1 {
                return false;
            }
            match self.head.compare_exchange_weak(
                h,
                h + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.collect(node, out);
                    node.lock.store(h + self.size, Ordering::Release);
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    /// Blocking producer: claims the next slot unconditionally via
    /// fetch-add, then busy-waits (with back-off) until it is actually free.
    pub fn enqueue(&self, values: &[usize]) {
        debug_assert!(values.len() <= NODE_WIDTH);
        let t = self.tail.fetch_add(1, Ordering::AcqRel);
        let node = self.node_at(t);
        let backoff = Backoff::new();
        while node.lock.load(Ordering::Acquire) != t {
            backoff.snooze();
        }
        self.publish(node, values);
        node.lock.store(t + 1, Ordering::Release);
    }

    /// Blocking consumer, symmetric to [`Ring::enqueue`].
    pub fn dequeue(&self, out: &mut [usize]) {
        debug_assert!(out.len() <= NODE_WIDTH);
        let h = self.head.fetch_add(1, Ordering::AcqRel);
        let node = self.node_at(h);
        let backoff = Backoff::new();
        while node.lock.load(Ordering::Acquire) != h + 1 {
            backoff.snooze();
        }
        self.collect(node, out);
        node.lock.store(h + self.size, Ordering::Release);
    }

    /// Single-producer fast path: skips the CAS because the caller
    /// guarantees it is the only producer. Still safe to race with any
    /// number of consumers.
    pub fn put_sp(&self, values: &[usize]) -> bool {
        debug_assert!(values.len() <= NODE_WIDTH);
        let t = self.tail.load(Ordering::Relaxed);
        let node = self.node_at(t);
        if node.lock.load(Ordering::Acquire) != t {
            return false;
        }
        self.tail.store(t + 1, Ordering::Relaxed);
        self.publish(node, values);
        node.lock.store(t + 1, Ordering::Release);
        true
    }

    /// Single-consumer fast path: skips the CAS because the caller
    /// guarantees it is the only consumer.
    pub fn get_sc(&self, out: &mut [usize]) -> bool {
        debug_assert!(out.len() <= NODE_WIDTH);
        let h = self.head.load(Ordering::Relaxed);
        let node = self.node_at(h);
        if node.lock.load(Ordering::Acquire) != h + 1 {
            return false;
        }
        self.head.store(h + 1, Ordering::Relaxed);
        self.collect(node, out);
        node.lock.store(h + self.size, Ordering::Release);
        true
    }

    fn publish(&self, node: &Node, values: &[usize]) {
        // SAFETY: we hold exclusive producer rights to `node` until the
        // `lock.store` release below, established by winning the tail CAS.
        unsafe {
            for (slot, value) in node.slots.iter().zip(values) {
                *slot.get() = *value;
            }
        }
        fence(Ordering::Release);
    }

    fn collect(&self, node: &Node, out: &mut [usize]) {
        fence(Ordering::Acquire);
        // SAFETY: we hold exclusive consumer rights to `node` until the
        // `lock.store` release below, established by winning the head CAS.
        unsafe {
            for (slot, value) in node.slots.iter().zip(out.iter_mut()) {
                *value = *slot.get();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_producer_single_consumer_preserves_order() {
        let ring = Ring::new(4);
        for v in [10usize, 20, 30, 40] {
            assert!(ring.put(&[v]));
        }
        let mut out = [0usize; 1];
        for expected in [10usize, 20, 30, 40] {
            assert!(ring.get(&mut out));
            assert_eq!(out[0], expected);
        }
        assert!(!ring.get(&mut out));
    }

    #[test]
    fn full_ring_rejects_then_drains() {
        let ring = Ring::new(2);
        assert!(ring.put(&[1]));
        assert!(ring.put(&[2]));
        assert!(!ring.put(&[3]));

        let mut out = [0usize; 1];
        assert!(ring.get(&mut out));
        assert_eq!(out[0], 1);

        assert!(ring.put(&[3]));
        assert!(ring.get(&mut out));
        assert_eq!(out[0], 2);
        assert!(ring.get(&mut out));
        assert_eq!(out[0], 3);
        assert!(!ring.get(&mut out));
    }

    #[test]
    fn size_one_ring_accepts_one_outstanding_element() {
        let ring = Ring::new(1);
        assert!(ring.put(&[7]));
        assert!(!ring.put(&[8]));
        let mut out = [0usize; 1];
        assert!(ring.get(&mut out));
        assert_eq!(out[0], 7);
        assert!(ring.put(&[8]));
    }

    #[test]
    fn stamps_never_exceed_capacity_apart() {
        let ring = Ring::new(8);
        for i in 0..8 {
            assert!(ring.put(&[i]));
        }
        assert_eq!(ring.len(), 8);
        assert!(!ring.put(&[99]));
    }

    #[test]
    fn concurrent_producers_each_value_delivered_once() {
        let ring = Arc::new(Ring::new(64));
        let producers = 4;
        let per_producer = 2000;
        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        let value = p * per_producer + i;
                        loop {
                            if ring.put(&[value]) {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let total = producers * per_producer;
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut seen = vec![false; total];
                let mut out = [0usize; 1];
                let mut count = 0;
                while count < total {
                    if ring.get(&mut out) {
                        assert!(!seen[out[0]], "value delivered twice");
                        seen[out[0]] = true;
                        count += 1;
                    } else {
                        thread::yield_now();
                    }
                }
                seen
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        let seen = consumer.join().unwrap();
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn blocking_enqueue_dequeue_round_trip() {
        let ring = Arc::new(Ring::new(2));
        let ring2 = Arc::clone(&ring);
        let writer = thread::spawn(move || {
            for v in 0..100usize {
                ring2.enqueue(&[v]);
            }
        });
        let mut out = [0usize; 1];
        for expected in 0..100usize {
            ring.dequeue(&mut out);
            assert_eq!(out[0], expected);
        }
        writer.join().unwrap();
    }
}
