//! Task list (component E, §4.5): a per-context FIFO queue of runnable
//! tasks, plus the cross-context async-call inbox built on the MPMC ring.
//!
//! The distilled spec models the list as "a linked list of rings" so that
//! growth never needs a single large reallocation. This crate keeps that
//! growth idiom for the object pool (§4.11) but uses `VecDeque` here: the
//! invariant that matters for correctness — single-writer-per-end, FIFO
//! order, O(1) add/get — is exactly what `VecDeque` already guarantees, and
//! the task list is never touched from more than one thread directly (all
//! cross-context mutation goes through a posted async call executed by the
//! owning thread, never through direct access to the queue).

use std::any::Any;
use std::collections::VecDeque;

use crate::context::Context;
use crate::ring::Ring;

pub type TaskValue = Box<dyn Any + Send>;

/// A unit of non-blocking work: `execute` runs first, `complete` runs
/// after with the value `execute` returned, and `reassign` decides (when
/// another context's worker considers stealing this task) whether it may
/// move to that context.
pub trait RunnableTask: Send {
    fn execute(&mut self, ctx: &mut Context) -> TaskValue;
    fn complete(&mut self, ctx: &mut Context, value: TaskValue);

    /// Default: tasks stay put. Sinks override this with the policy in
    /// §4.3 "Reassignment policy", which needs `ctx` to consult (and, on
    /// acceptance, update) the sink table.
    fn reassign(&mut self, _ctx: &mut Context, _target_context: usize) -> bool {
        false
    }
}

/// Per-context FIFO of pending tasks.
pub struct TaskList {
    queue: VecDeque<Box<dyn RunnableTask>>,
    added: u64,
    removed: u64,
}

impl TaskList {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            added: 0,
            removed: 0,
        }
    }

    pub fn add(&mut self, task: Box<dyn RunnableTask>) {
        self.queue.push_back(task);
        self.added += 1;
    }

    pub fn get(&mut self) -> Option<Box<dyn RunnableTask>> {
        let task = self.queue.pop_front();
        if task.is_some() {
            self.removed += 1;
        }
        task
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.added, self.removed)
    }

    /// Walks the list asking each task's `reassign` whether it may migrate
    /// to `target_context`; accepted tasks are posted to that context's
    /// inbox. `ctx` is the context this list belongs to — `reassign` needs
    /// it to consult (and update) the sink table. Returns the number
    /// migrated.
    pub fn reassign_to(
        &mut self,
        ctx: &mut Context,
        target_context: usize,
        target_inbox: &Inbox,
    ) -> usize {
        let mut keep = VecDeque::with_capacity(self.queue.len());
        let mut migrated = 0;
        while let Some(mut task) = self.queue.pop_front() {
            if task.reassign(ctx, target_context) {
                migrated += 1;
                target_inbox.post(Box::new(move |ctx: &mut Context| {
                    ctx.task_list_mut().add(task);
                }));
            } else {
                keep.push_back(task);
            }
        }
        self.queue = keep;
        migrated
    }
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

/// A boxed routine posted from one context into another's inbox. Unlike
/// the C source's "bundle up to six `uintptr_t` arguments into one slot"
/// trick, a Rust closure captures exactly what it needs and costs exactly
/// one ring slot to transport (see [`Inbox::post`]) — strictly better use
/// of the ring's seven-word node width than the C encoding, not a
/// reduction in capability.
pub type AsyncRoutine = Box<dyn FnOnce(&mut Context) + Send>;

/// A context's async-call inbox: an MPMC ring carrying boxed routines.
pub struct Inbox {
    ring: Ring,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Ring::new(capacity),
        }
    }

    /// Non-blocking post; `false` if the inbox is full (§7 "Queue
    /// saturation": the caller retries or falls back to `post`).
    pub fn try_post(&self, routine: AsyncRoutine) -> bool {
        let boxed: Box<AsyncRoutine> = Box::new(routine);
        let ptr = Box::into_raw(boxed) as usize;
        if self.ring.put(&[ptr]) {
            true
        } else {
            // SAFETY: `ptr` was just produced by `Box::into_raw` above and
            // was never handed to the ring (the `put` failed), so we are
            // the sole owner reclaiming it.
            unsafe { drop(Box::from_raw(ptr as *mut AsyncRoutine)) };
            false
        }
    }

    /// Blocking post: busy-waits (via the ring's back-off) until the
    /// inbox has room.
    pub fn post(&self, routine: AsyncRoutine) {
        let boxed: Box<AsyncRoutine> = Box::new(routine);
        let ptr = Box::into_raw(boxed) as usize;
        self.ring.enqueue(&[ptr]);
    }

    /// Drains every currently-available routine, running each against
    /// `ctx` in MPMC stamp order. Returns the number drained.
    pub fn drain(&self, ctx: &mut Context) -> usize {
        let mut out = [0usize; 1];
        let mut n = 0;
        while self.ring.get(&mut out) {
            // SAFETY: `out[0]` is a pointer produced by a matching
            // `Box::into_raw` in `try_post`/`post`, and the ring hands each
            // value to exactly one consumer.
            let boxed = unsafe { Box::from_raw(out[0] as *mut AsyncRoutine) };
            (*boxed)(ctx);
            n += 1;
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Echo(usize);
    impl RunnableTask for Echo {
        fn execute(&mut self, _ctx: &mut Context) -> TaskValue {
            Box::new(self.0)
        }
        fn complete(&mut self, _ctx: &mut Context, value: TaskValue) {
            let v = *value.downcast::<usize>().unwrap();
            assert_eq!(v, self.0);
        }
    }

    #[test]
    fn fifo_add_get() {
        let mut list = TaskList::new();
        list.add(Box::new(Echo(1)));
        list.add(Box::new(Echo(2)));
        let mut ctx = Context::for_test();
        let mut t1 = list.get().unwrap();
        let v = t1.execute(&mut ctx);
        t1.complete(&mut ctx, v);
        let mut t2 = list.get().unwrap();
        let v = t2.execute(&mut ctx);
        t2.complete(&mut ctx, v);
        assert!(list.get().is_none());
    }

    #[test]
    fn execute_result_round_trips_into_complete() {
        struct RoundTrip {
            seen: Arc<AtomicUsize>,
        }
        impl RunnableTask for RoundTrip {
            fn execute(&mut self, _ctx: &mut Context) -> TaskValue {
                Box::new(42usize)
            }
            fn complete(&mut self, _ctx: &mut Context, value: TaskValue) {
                self.seen
                    .store(*value.downcast::<usize>().unwrap(), Ordering::SeqCst);
            }
        }
        let seen = Arc::new(AtomicUsize::new(0));
        let mut task: Box<dyn RunnableTask> = Box::new(RoundTrip {
            seen: Arc::clone(&seen),
        });
        let mut ctx = Context::for_test();
        let value = task.execute(&mut ctx);
        task.complete(&mut ctx, value);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn inbox_non_blocking_post_respects_capacity() {
        let inbox = Inbox::new(1);
        assert!(inbox.try_post(Box::new(|_ctx: &mut Context| {})));
        assert!(!inbox.try_post(Box::new(|_ctx: &mut Context| {})));
    }
}
