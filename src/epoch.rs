//! Epoch-based reclamation (component D, §4.4): defers sink destruction
//! until every context has observed the retirement.
//!
//! The three per-context buffers (`retire_queue`, `limbo[0]`, `limbo[1]`)
//! rotate on every successful global-epoch advance: the oldest limbo stack
//! is freed, the younger limbo stack becomes the older one, and the retire
//! queue becomes the younger one. That rotation is strictly more
//! conservative than "destroy after two advances since retirement" — an
//! item can sit in the retire queue for an arbitrary time before the first
//! rotation moves it into limbo, so it is safe, just not tight.
//!
//! Per the design notes (§9 "Global mutable state"), there is no
//! thread-local current-context pointer: every entry point here takes an
//! explicit context index into the shared table.

use std::sync::atomic::{AtomicU32, Ordering};

type Destructor = Box<dyn FnOnce() + Send>;

struct LocalState {
    retire_queue: Vec<Destructor>,
    limbo: [Vec<Destructor>; 2],
    count: usize,
    iter_index: usize,
}

impl LocalState {
    fn new() -> Self {
        Self {
            retire_queue: Vec::new(),
            limbo: [Vec::new(), Vec::new()],
            count: 0,
            iter_index: 0,
        }
    }
}

struct LocalEpoch {
    /// 0 when the owning context is outside a critical section, else a
    /// snapshot of the global epoch taken on entry.
    snapshot: AtomicU32,
    state: std::cell::UnsafeCell<LocalState>,
}

// SAFETY: `state` is mutated only by the context that owns this slot's
// index, which is always the calling thread for `enter`/`leave`/`retire`.
// Other contexts only ever read `snapshot` (atomically) while scanning.
unsafe impl Sync for LocalEpoch {}

/// The shared epoch table: one [`LocalEpoch`] slot per context, plus the
/// global atomic counter they coordinate through.
pub struct Reclaimer {
    global: AtomicU32,
    locals: Box<[LocalEpoch]>,
}

impl Reclaimer {
    pub fn new(contexts: usize) -> Self {
        assert!(contexts > 0);
        let locals = (0..contexts)
            .map(|_| LocalEpoch {
                snapshot: AtomicU32::new(0),
                state: std::cell::UnsafeCell::new(LocalState::new()),
            })
            .collect();
        Self {
            global: AtomicU32::new(1),
            locals,
        }
    }

    pub fn contexts(&self) -> usize {
        self.locals.len()
    }

    pub fn global_epoch(&self) -> u32 {
        self.global.load(Ordering::Acquire)
    }

    /// Enters a critical section for context `idx`, a no-op if already
    /// inside one.
    pub fn enter(&self, idx: usize) {
        let local = &self.locals[idx];
        if local.snapshot.load(Ordering::Relaxed) == 0 {
            let g = self.global.load(Ordering::Acquire);
            local.snapshot.store(g, Ordering::Release);
            // SAFETY: only the owning context touches `state`.
            unsafe { (*local.state.get()).iter_index = 0 };
        }
    }

    /// Leaves the critical section for context `idx`. If there is anything
    /// retired, attempts to advance the global epoch and rotate the limbo
    /// buffers before clearing the snapshot.
    pub fn leave(&self, idx: usize) {
        let local = &self.locals[idx];
        // SAFETY: only the owning context touches `state`.
        let state = unsafe { &mut *local.state.get() };
        if state.count == 0 {
            local.snapshot.store(0, Ordering::Release);
            return;
        }
        self.try_advance(local, state);
        local.snapshot.store(0, Ordering::Release);
    }

    /// Retires a destructor for context `idx`. Must be called only while
    /// `idx` is inside a critical section (i.e. between `enter`/`leave`).
    pub fn retire(&self, idx: usize, destructor: Destructor) {
        let local = &self.locals[idx];
        debug_assert!(
            local.snapshot.load(Ordering::Relaxed) != 0,
            "epoch_retire called outside a critical section"
        );
        // SAFETY: only the owning context touches `state`.
        let state = unsafe { &mut *local.state.get() };
        state.retire_queue.push(destructor);
        state.count += 1;
    }

    fn try_advance(&self, local: &LocalEpoch, state: &mut LocalState) {
        let current = self.global.load(Ordering::Acquire);
        let n = self.locals.len();
        let mut i = state.iter_index;
        let mut scanned = 0;
        while scanned < n {
            let other = &self.locals[i];
            let s = other.snapshot.load(Ordering::Acquire);
            if s != 0 && s != current {
                // Another context is mid-critical-section in an older
                // generation; remember where we stopped and bail.
                state.iter_index = i;
                return;
            }
            i = (i + 1) % n;
            scanned += 1;
        }

        let next = match current.wrapping_add(1) {
            0 => 1,
            other => other,
        };
        if self
            .global
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let freed = std::mem::take(&mut state.limbo[0]);
            state.limbo[0] = std::mem::take(&mut state.limbo[1]);
            state.limbo[1] = std::mem::take(&mut state.retire_queue);
            let freed_count = freed.len();
            for destructor in freed {
                destructor();
            }
            state.count -= freed_count;
        }
        state.iter_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn destructor_runs_only_after_advance() {
        let r = Reclaimer::new(1);
        let destroyed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&destroyed);
        r.enter(0);
        r.retire(0, Box::new(move || flag.store(true, Ordering::SeqCst)));
        r.leave(0);
        assert!(!destroyed.load(Ordering::SeqCst));

        // Drive enough cycles to rotate the item through both limbo slots.
        for _ in 0..4 {
            r.enter(0);
            r.leave(0);
        }
        assert!(destroyed.load(Ordering::SeqCst));
    }

    #[test]
    fn destruction_waits_for_busy_peer_context() {
        let r = Arc::new(Reclaimer::new(2));
        let destroyed = Arc::new(AtomicBool::new(false));

        // Context 1 starts a critical section before the retirement.
        r.enter(1);

        let flag = Arc::clone(&destroyed);
        r.enter(0);
        r.retire(0, Box::new(move || flag.store(true, Ordering::SeqCst)));
        r.leave(0);

        // Context 0 alone cannot advance the epoch while context 1 is
        // still snapshotted at an older generation.
        for _ in 0..4 {
            r.enter(0);
            r.leave(0);
        }
        assert!(!destroyed.load(Ordering::SeqCst));

        // Context 1 leaves and re-enters, observing the newer generation.
        r.leave(1);
        r.enter(1);
        r.leave(1);

        for _ in 0..4 {
            r.enter(0);
            r.leave(0);
        }
        assert!(destroyed.load(Ordering::SeqCst));
    }
}
