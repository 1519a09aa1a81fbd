//! Timer queue (component H, §4.8) and timepiece (§4.9).
//!
//! The queue is a priority queue keyed by absolute monotonic deadline.
//! `BinaryHeap` has no O(1) arbitrary-removal, so `disarm` uses the
//! standard lazy-deletion trick: it removes the timer's record and leaves
//! the stale heap entry to be skipped the next time it surfaces at the
//! top — cheap, and the heap never grows unboundedly because every entry
//! is popped exactly once regardless of whether it was live.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::fiber::FiberId;
use crate::task::RunnableTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

const SENTINEL: u64 = u64::MAX;

pub enum TimerAction {
    ResumeFiber(FiberId),
    EnqueueTask(Box<dyn RunnableTask>),
}

struct Record {
    deadline: Instant,
    action: TimerAction,
    interval: Option<Duration>,
}

/// A timer queue owned by a single context.
pub struct TimerQueue {
    records: HashMap<u64, Record>,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            heap: BinaryHeap::new(),
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> Result<u64> {
        if self.next_id == SENTINEL {
            return Err(Error::TimerIdExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    /// Arms a one-shot timer at `now + timeout`, firing `action`.
    pub fn arm(&mut self, now: Instant, timeout: Duration, action: TimerAction) -> Result<TimerId> {
        self.arm_with_interval(now, timeout, action, None)
    }

    /// Arms a timer at `now + timeout`; if `interval` is `Some`, a
    /// `ResumeFiber` timer is re-armed at `fire_time + interval` each time
    /// it fires. `EnqueueTask` timers are always one-shot — the task is
    /// consumed by firing, so there is nothing to repeat with.
    pub fn arm_with_interval(
        &mut self,
        now: Instant,
        timeout: Duration,
        action: TimerAction,
        interval: Option<Duration>,
    ) -> Result<TimerId> {
        let id = self.alloc_id()?;
        let deadline = now + timeout;
        self.heap.push(Reverse((deadline, id)));
        self.records.insert(
            id,
            Record {
                deadline,
                action,
                interval,
            },
        );
        Ok(TimerId(id))
    }

    /// Disarms a timer. Returns `false` if it already fired or was never
    /// armed; idempotent like `close_fd`.
    pub fn disarm(&mut self, id: TimerId) -> bool {
        self.records.remove(&id.0).is_some()
    }

    fn prune_stale_top(&mut self) {
        while let Some(&Reverse((_, id))) = self.heap.peek() {
            if self.records.contains_key(&id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Absolute time of the next live deadline, if any.
    pub fn peek_min(&mut self) -> Option<Instant> {
        self.prune_stale_top();
        self.heap.peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Pops and returns every timer whose deadline is `<= now`. Repeating
    /// fiber timers are re-armed before being returned.
    pub fn fire_due(&mut self, now: Instant) -> Vec<(TimerId, TimerAction)> {
        let mut fired = Vec::new();
        loop {
            self.prune_stale_top();
            let Some(&Reverse((deadline, id))) = self.heap.peek() else {
                break;
            };
            if deadline > now {
                break;
            }
            self.heap.pop();
            let Some(record) = self.records.remove(&id) else {
                continue;
            };
            if let (Some(interval), TimerAction::ResumeFiber(fiber)) =
                (record.interval, &record.action)
            {
                let fiber = *fiber;
                let next_deadline = now + interval;
                self.heap.push(Reverse((next_deadline, id)));
                self.records.insert(
                    id,
                    Record {
                        deadline: next_deadline,
                        action: TimerAction::ResumeFiber(fiber),
                        interval: Some(interval),
                    },
                );
                fired.push((TimerId(id), TimerAction::ResumeFiber(fiber)));
            } else {
                fired.push((TimerId(id), record.action));
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-context coarse clock cache (§4.9). Time values are refreshed only
/// at well-defined points in the context loop (after waking from the event
/// source), never mid-iteration, so ordering decisions within one
/// iteration stay stable.
pub struct Timepiece {
    now: Instant,
    ticks_since_refresh: u32,
    refresh_every_ticks: u32,
}

impl Timepiece {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            ticks_since_refresh: 0,
            refresh_every_ticks: 64,
        }
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Unconditionally resamples the clock. Called once per context-loop
    /// iteration right after the event source returns.
    pub fn refresh(&mut self) {
        self.now = Instant::now();
        self.ticks_since_refresh = 0;
    }

    /// Called on the fast, non-blocking path (§4.10 `else` branch) where a
    /// full refresh every tick would be wasteful; resamples only every
    /// `refresh_every_ticks` calls.
    pub fn tick(&mut self) {
        self.ticks_since_refresh += 1;
        if self.ticks_since_refresh >= self.refresh_every_ticks {
            self.refresh();
        }
    }
}

impl Default for Timepiece {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    fn fiber_id() -> FiberId {
        let mut pool: Pool<()> = Pool::new();
        pool.alloc(())
    }

    #[test]
    fn zero_timeout_timer_is_immediately_due() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        q.arm(now, Duration::from_millis(0), TimerAction::ResumeFiber(fiber_id()))
            .unwrap();
        let fired = q.fire_due(now);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn disarm_before_deadline_prevents_firing() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let id = q
            .arm(now, Duration::from_millis(10), TimerAction::ResumeFiber(fiber_id()))
            .unwrap();
        assert!(q.disarm(id));
        let fired = q.fire_due(now + Duration::from_millis(20));
        assert!(fired.is_empty());
    }

    #[test]
    fn double_disarm_is_a_noop_the_second_time() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let id = q
            .arm(now, Duration::from_millis(10), TimerAction::ResumeFiber(fiber_id()))
            .unwrap();
        assert!(q.disarm(id));
        assert!(!q.disarm(id));
    }

    #[test]
    fn peek_min_reports_the_earliest_live_deadline() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let far = q
            .arm(now, Duration::from_secs(10), TimerAction::ResumeFiber(fiber_id()))
            .unwrap();
        q.arm(now, Duration::from_secs(1), TimerAction::ResumeFiber(fiber_id()))
            .unwrap();
        let near = q.peek_min().unwrap();
        assert!(near < now + Duration::from_secs(10));
        q.disarm(far);
    }

    #[test]
    fn repeating_fiber_timer_rearms_after_firing() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        q.arm_with_interval(
            now,
            Duration::from_millis(5),
            TimerAction::ResumeFiber(fiber_id()),
            Some(Duration::from_millis(5)),
        )
        .unwrap();
        let first = q.fire_due(now + Duration::from_millis(5));
        assert_eq!(first.len(), 1);
        assert!(!q.is_empty(), "repeating timer should be re-armed");
        let second = q.fire_due(now + Duration::from_millis(10));
        assert_eq!(second.len(), 1);
    }
}
