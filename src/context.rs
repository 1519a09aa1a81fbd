//! Context (component I, §4.10): binds components B..H into one OS thread.
//!
//! Per the design note on global mutable state (§9), there is no persistent
//! thread-local "current context" pointer used by scheduler internals —
//! every method here takes `&mut self` explicitly, and a fiber's start
//! routine is handed `&mut Context` directly at the one place it is needed
//! (see [`crate::fiber::StartRoutine`]) rather than looking it up. The one
//! place a thread-local is unavoidable is the `ucontext` trampoline itself:
//! `makecontext`'s entry point takes no arguments, so [`current`] is set
//! only at the outermost frame of [`Context::run`] and read back once, by
//! the trampoline, to recover `&mut Context` for the fiber it is about to
//! run.

use std::any::Any;
use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::config::RuntimeConfig;
use crate::epoch::Reclaimer;
use crate::error::{Error, Result};
use crate::event::sink::{IoProgress, Sink, SinkFlags, SinkId, IoTasks};
use crate::event::{EventSource, Interest};
use crate::fiber::{Fiber, FiberFlags, FiberId, FiberOutcome, FiberState, StartRoutine};
use crate::pool::Pool;
use crate::runqueue::RunQueue;
use crate::task::{Inbox, RunnableTask, TaskList, TaskValue};
use crate::timer::{TimerAction, TimerId, TimerQueue};

thread_local! {
    static CURRENT: Cell<*mut Context> = Cell::new(std::ptr::null_mut());
}

/// Recovers the context owning the fiber currently executing on this OS
/// thread.
///
/// # Safety
/// Must only be called from the `ucontext` trampoline while a fiber
/// prepared by that same `Context::run` is being entered.
unsafe fn current() -> &'static mut Context {
    CURRENT.with(|c| {
        let ptr = c.get();
        debug_assert!(!ptr.is_null(), "current() called outside Context::run");
        &mut *ptr
    })
}

extern "C" fn fiber_trampoline() {
    // SAFETY: only ever switched into from `Context::schedule_one_fiber`,
    // which runs inside `Context::run` after `CURRENT` has been set.
    let ctx = unsafe { current() };
    ctx.run_current_fiber();
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "fiber panicked with a non-string payload".to_string()
    }
}

/// Context-local bookkeeping counters, exposed read-only for diagnostics.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextStats {
    pub fibers_created: u64,
    pub fibers_reused: u64,
    pub loop_iterations: u64,
    pub async_calls_drained: u64,
    pub timers_fired: u64,
}

/// A single OS-thread worker: owns the run queue, blocked/dead fiber lists,
/// task list, timer queue, the event source, the sink table, and the
/// master (scheduler) fiber.
pub struct Context {
    id: usize,
    config: Arc<RuntimeConfig>,
    reclaimer: Arc<Reclaimer>,
    fibers: Pool<Fiber>,
    run_queue: RunQueue,
    blocked: Vec<FiberId>,
    dead: Vec<FiberId>,
    task_list: TaskList,
    inbox: Arc<Inbox>,
    timers: TimerQueue,
    timepiece: crate::timer::Timepiece,
    event_source: EventSource,
    sinks: Pool<Sink>,
    master: Fiber,
    current: Option<FiberId>,
    stop: Arc<AtomicU32>,
    stats: ContextStats,
    workers: Vec<FiberId>,
    /// Every context's inbox, indexed by context id, including this one's
    /// own — populated once by [`Context::set_peers`] before any context
    /// starts, so an idle worker can post a steal request into a peer's
    /// inbox (§4.5 "cross-context task steal") without `Dispatch` reaching
    /// back into a started context directly.
    peers: Vec<Arc<Inbox>>,
    steal_cursor: usize,
}

impl Context {
    pub fn new(
        id: usize,
        config: Arc<RuntimeConfig>,
        reclaimer: Arc<Reclaimer>,
        inbox: Arc<Inbox>,
        stop: Arc<AtomicU32>,
    ) -> io::Result<Self> {
        Ok(Self {
            id,
            config,
            reclaimer,
            fibers: Pool::new(),
            run_queue: RunQueue::new(),
            blocked: Vec::new(),
            dead: Vec::new(),
            task_list: TaskList::new(),
            inbox,
            timers: TimerQueue::new(),
            timepiece: crate::timer::Timepiece::new(),
            event_source: EventSource::new()?,
            sinks: Pool::new(),
            master: Fiber::master()?,
            current: None,
            stop,
            stats: ContextStats::default(),
            workers: Vec::new(),
            peers: Vec::new(),
            steal_cursor: 0,
        })
    }

    /// Hands this context the full set of per-context inboxes (itself
    /// included) so its idle workers can address a steal request to a
    /// peer. Called once by `Dispatch::new` before any context is started.
    pub fn set_peers(&mut self, peers: Vec<Arc<Inbox>>) {
        self.peers = peers;
    }

    /// A single-context instance with its own private reclaimer, suitable
    /// for unit tests that need `&mut Context` but never start `run`.
    #[cfg(test)]
    pub fn for_test() -> Self {
        let config = Arc::new(RuntimeConfig::default());
        let reclaimer = Arc::new(Reclaimer::new(1));
        let inbox = Arc::new(Inbox::new(64));
        let stop = Arc::new(AtomicU32::new(0));
        Self::new(0, config, reclaimer, inbox, stop).expect("Context::for_test")
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    pub fn task_list_mut(&mut self) -> &mut TaskList {
        &mut self.task_list
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    /// A cross-thread handle that can wake this context out of a blocking
    /// `poll` from any other thread. `Dispatch` takes one per context
    /// before handing the context to its OS thread, so posting to an
    /// inbox can also interrupt an indefinite wait.
    pub fn waker(&self) -> io::Result<crate::event::EventWaker> {
        self.event_source.waker()
    }

    // ---- fiber lifecycle (§4.7) -------------------------------------

    /// Allocates (or reuses from the dead list, per exact stack-size match)
    /// a fiber running `start`, and places it in the run queue at `Pending`.
    pub fn fiber_create(&mut self, priority: u8, start: StartRoutine) -> io::Result<FiberId> {
        let stack_size = self.config.fiber_stack_size;
        if let Some(pos) = self
            .dead
            .iter()
            .position(|&id| self.fibers.get(id).is_some_and(|f| f.stack_len() == stack_size))
        {
            let id = self.dead.remove(pos);
            let fiber = self.fibers.get_mut(id).expect("dead fiber vanished");
            fiber.reset(priority, start);
            // SAFETY: the fiber is not currently switched into by anyone.
            unsafe { fiber.prepare(fiber_trampoline) };
            fiber.state = FiberState::Pending;
            self.run_queue.put(id, priority);
            self.stats.fibers_reused += 1;
            return Ok(id);
        }
        let mut fiber = Fiber::new(stack_size, priority, start)?;
        // SAFETY: freshly allocated stack, never switched into yet.
        unsafe { fiber.prepare(fiber_trampoline) };
        fiber.state = FiberState::Pending;
        let id = self.fibers.alloc(fiber);
        self.run_queue.put(id, priority);
        self.stats.fibers_created += 1;
        Ok(id)
    }

    /// Moves a blocked fiber back into the run queue at `Pending` (§4.7).
    pub fn fiber_run(&mut self, id: FiberId) {
        if let Some(pos) = self.blocked.iter().position(|&b| b == id) {
            self.blocked.remove(pos);
        }
        let priority = match self.fibers.get_mut(id) {
            Some(fiber) => {
                fiber.state = FiberState::Pending;
                fiber.current_priority
            }
            None => return,
        };
        self.run_queue.put(id, priority);
    }

    /// Requests cancellation (§4.7): sets the flag and, if the fiber is
    /// blocked, makes it runnable so it observes the flag at its next
    /// scheduling point.
    pub fn fiber_cancel(&mut self, id: FiberId) {
        let is_blocked = match self.fibers.get_mut(id) {
            Some(fiber) => {
                fiber.request_cancel();
                fiber.state == FiberState::Blocked
            }
            None => return,
        };
        if is_blocked {
            self.fiber_run(id);
        }
    }

    /// Called by fiber code (via `ctx.fiber_yield()`) to give up the
    /// current time slice. Returns once rescheduled; if cancellation was
    /// requested meanwhile, does not return at all — the fiber exits here.
    ///
    /// Requeues at whatever `current_priority` is right now — a level
    /// raised by [`Context::fiber_hoist`] still governs this requeue — and
    /// only then restores `original_priority` (§4.6 `hoist`: "on the next
    /// yield its priority is restored to the original").
    pub fn fiber_yield(&mut self) {
        let id = self.current.expect("fiber_yield called outside a fiber");
        let priority = {
            let fiber = self.fibers.get_mut(id).expect("current fiber missing");
            fiber.state = FiberState::Pending;
            fiber.current_priority
        };
        self.run_queue.put(id, priority);
        {
            let fiber = self.fibers.get_mut(id).expect("current fiber missing");
            fiber.current_priority = fiber.original_priority;
        }
        self.switch_out_to_master(id);
        self.check_cancel_at_scheduling_point(id);
    }

    /// §4.6 `hoist`: temporarily raises `id`'s priority, e.g. to match a
    /// caller blocked waiting on it (priority inheritance). If the fiber is
    /// already queued, re-links it at the new level immediately; if it is
    /// running or blocked, the raised level takes effect the next time it
    /// is placed in the run queue. Restored to `original_priority` on the
    /// fiber's next [`Context::fiber_yield`]. A no-op if `priority` is not
    /// actually higher (numerically lower) than the fiber's current one.
    pub fn fiber_hoist(&mut self, id: FiberId, priority: u8) {
        let was_pending = match self.fibers.get_mut(id) {
            Some(fiber) => {
                if priority >= fiber.current_priority {
                    return;
                }
                fiber.current_priority = priority;
                fiber.state == FiberState::Pending
            }
            None => return,
        };
        if was_pending {
            self.run_queue.reprioritize(id, priority);
        }
    }

    /// Suspends the current fiber until an explicit [`Context::fiber_run`].
    pub fn fiber_block(&mut self) {
        let id = self.current.expect("fiber_block called outside a fiber");
        {
            let fiber = self.fibers.get_mut(id).expect("current fiber missing");
            fiber.state = FiberState::Blocked;
        }
        self.blocked.push(id);
        self.switch_out_to_master(id);
        self.check_cancel_at_scheduling_point(id);
    }

    /// Registers a scoped cleanup handler on the current fiber, run in LIFO
    /// order on exit (§4.7 "Scoped cleanup").
    pub fn fiber_push_cleanup(&mut self, handler: Box<dyn FnOnce() + Send>) {
        let id = self.current.expect("fiber_push_cleanup outside a fiber");
        self.fibers
            .get_mut(id)
            .expect("current fiber missing")
            .push_cleanup(handler);
    }

    fn check_cancel_at_scheduling_point(&mut self, id: FiberId) -> bool {
        let should_cancel = self
            .fibers
            .get(id)
            .is_some_and(|f| f.should_cancel_now());
        if should_cancel {
            self.exit_current_fiber(FiberOutcome::Canceled, true);
        }
        should_cancel
    }

    fn switch_out_to_master(&mut self, id: FiberId) {
        let (fiber, master) = {
            let fibers = &mut self.fibers;
            let master = &mut self.master;
            (fibers.get_mut(id).expect("fiber vanished mid-switch"), master)
        };
        // SAFETY: `fiber` is the currently running fiber on this OS thread;
        // `master` is this context's own stack, last switched out of when
        // this fiber was scheduled.
        unsafe { Fiber::switch(fiber, master) };
    }

    fn run_current_fiber(&mut self) -> ! {
        let id = self.current.expect("run_current_fiber with no current fiber");
        let start = self
            .fibers
            .get_mut(id)
            .expect("current fiber missing")
            .start
            .take()
            .expect("fiber's start routine already consumed");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| start(self)));
        let outcome = match result {
            Ok(value) => FiberOutcome::Finished(value),
            Err(payload) => FiberOutcome::Panicked(panic_message(payload)),
        };
        self.exit_current_fiber(outcome, false)
    }

    /// Common tail for every way a fiber stops running: runs cleanups,
    /// records the outcome, moves it to the dead list, and switches away
    /// to the master fiber permanently (the fiber is resumed only via
    /// `reset`+`prepare` on reuse, never by switching into this exact
    /// machine context again).
    fn exit_current_fiber(&mut self, outcome: FiberOutcome, canceled: bool) -> ! {
        let id = self.current.take().expect("exit with no current fiber");
        {
            let fiber = self.fibers.get_mut(id).expect("current fiber missing");
            if canceled {
                fiber.flags.insert(FiberFlags::CANCEL_OCCURRED);
            }
            fiber.run_cleanups();
            fiber.outcome = Some(outcome);
            fiber.state = FiberState::Invalid;
        }
        self.run_queue.delete(id);
        self.dead.push(id);
        let (fiber, master) = {
            let fibers = &mut self.fibers;
            let master = &mut self.master;
            (fibers.get_mut(id).expect("fiber vanished mid-exit"), master)
        };
        // SAFETY: same as `switch_out_to_master`; this switch is the last
        // thing this fiber's machine context ever does.
        unsafe { Fiber::switch(fiber, master) };
        unreachable!("a dead fiber was resumed")
    }

    // ---- timers (§4.8, §6) --------------------------------------------

    /// §6 `prepare_task_timer` + `arm_timer`: arms a one-shot timer that
    /// enqueues `task` onto this context's task list when it fires.
    pub fn arm_task_timer(&mut self, timeout: Duration, task: Box<dyn RunnableTask>) -> Result<TimerId> {
        let now = self.timepiece.now();
        self.timers.arm(now, timeout, TimerAction::EnqueueTask(task))
    }

    /// §6 `prepare_fiber_timer` + `arm_timer`: arms a timer that resumes
    /// `fiber` when it fires. `interval` repeats it instead of firing once
    /// (used for periodic wakeups; §6 only names one-shot timers, but the
    /// queue already supports repetition for fiber resumption, so it is
    /// exposed here rather than left unreachable).
    pub fn arm_fiber_timer(
        &mut self,
        timeout: Duration,
        fiber: FiberId,
        interval: Option<Duration>,
    ) -> Result<TimerId> {
        let now = self.timepiece.now();
        self.timers
            .arm_with_interval(now, timeout, TimerAction::ResumeFiber(fiber), interval)
    }

    /// §6 `disarm_timer`: idempotent, `false` if already fired or unarmed.
    pub fn disarm_timer(&mut self, timer: TimerId) -> bool {
        self.timers.disarm(timer)
    }

    // ---- scheduler loop (§4.10) --------------------------------------

    /// Runs the context's loop on the current OS thread until
    /// [`Context::request_stop`] is observed. This is the outermost frame
    /// that installs the thread-local used by the `ucontext` trampoline.
    pub fn run(&mut self) {
        CURRENT.with(|c| c.set(self as *mut Context));
        debug!(target: "mainmemory::context", "context {} starting", self.id);
        self.ensure_workers();
        loop {
            if self.stop.load(Ordering::Acquire) != 0 {
                break;
            }
            self.stats.loop_iterations += 1;
            self.drain_async_calls();
            if self.task_list.is_empty() && self.run_queue.is_empty() {
                self.halt_on_event_source();
                self.timepiece.refresh();
                self.fire_due_timers();
                self.deliver_ready_sinks();
            } else {
                self.poll_event_source_nonblocking();
                self.timepiece.tick();
            }
            if !self.task_list.is_empty() {
                self.wake_idle_worker();
            }
            self.schedule_one_fiber();
            self.reap_one_task();
        }
        CURRENT.with(|c| c.set(std::ptr::null_mut()));
        debug!(target: "mainmemory::context", "context {} stopped", self.id);
    }

    /// Tops the worker pool up to `workers.min` (§6). Workers are ordinary
    /// fibers whose body drains the task list (the "worker fibers drain
    /// the task list" step of the per-context data flow, §2); they block
    /// when there is nothing to do and are rescheduled by
    /// [`Context::wake_idle_worker`].
    fn ensure_workers(&mut self) {
        let min = self.config.workers_min as usize;
        while self.workers.len() < min {
            match self.spawn_worker() {
                Ok(id) => self.workers.push(id),
                Err(err) => {
                    warn!(target: "mainmemory::context", "failed to spawn worker fiber: {err}");
                    break;
                }
            }
        }
    }

    fn spawn_worker(&mut self) -> io::Result<FiberId> {
        self.fiber_create(
            16,
            Box::new(|ctx| {
                loop {
                    if ctx.stop.load(Ordering::Acquire) != 0 {
                        break;
                    }
                    match ctx.task_list.get() {
                        Some(mut task) => {
                            let value = task.execute(ctx);
                            task.complete(ctx, value);
                        }
                        None => {
                            ctx.request_steal();
                            ctx.fiber_block();
                        }
                    }
                }
                Box::new(()) as Box<dyn Any + Send>
            }),
        )
    }

    /// §4.5 "cross-context task steal": with nothing left to run locally,
    /// asks the next peer (round-robin) to offer its own pending tasks over
    /// via [`Context::task_list_reassign`]. Migrated tasks arrive back
    /// through this context's own inbox and surface on the next
    /// `drain_async_calls`, which wakes a blocked worker once the list is
    /// non-empty again.
    fn request_steal(&mut self) {
        let n = self.peers.len();
        if n < 2 {
            return;
        }
        let mut victim = (self.steal_cursor + 1) % n;
        if victim == self.id {
            victim = (victim + 1) % n;
        }
        self.steal_cursor = victim;
        let my_id = self.id;
        let my_inbox = Arc::clone(&self.inbox);
        self.peers[victim].post(Box::new(move |ctx: &mut Context| {
            ctx.task_list_reassign(my_id, &my_inbox);
        }));
    }

    /// §4.5 `task_list_reassign`: offers every task currently pending in
    /// this context's list to `target_context`; each migrates only if its
    /// own `reassign` predicate accepts (§4.3's sink reassignment policy
    /// for `InputTask`/`OutputTask`). Returns the number migrated.
    pub fn task_list_reassign(&mut self, target_context: usize, target_inbox: &Inbox) -> usize {
        let mut pending = std::mem::take(&mut self.task_list);
        let migrated = pending.reassign_to(self, target_context, target_inbox);
        self.task_list = pending;
        migrated
    }

    /// Reschedules one blocked worker fiber, if any, so it observes the
    /// task list is non-empty on its next run. A no-op if every worker is
    /// already pending or running.
    fn wake_idle_worker(&mut self) {
        let idle = self
            .workers
            .iter()
            .copied()
            .find(|&id| self.fibers.get(id).is_some_and(|f| f.state == FiberState::Blocked));
        if let Some(id) = idle {
            self.fiber_run(id);
        }
    }

    /// Posts an async call that sets the stop flag (§6 `context_stop`).
    pub fn request_stop(&self) {
        self.stop.store(1, Ordering::Release);
        let _ = self.event_source.notify();
    }

    fn drain_async_calls(&mut self) {
        let inbox = Arc::clone(&self.inbox);
        let n = inbox.drain(self);
        if n > 0 {
            self.stats.async_calls_drained += n as u64;
            trace!(target: "mainmemory::context", "context {} drained {n} async calls", self.id);
        }
    }

    fn schedule_one_fiber(&mut self) {
        let Some(id) = self.run_queue.get() else {
            return;
        };
        {
            let fiber = self.fibers.get_mut(id).expect("scheduled fiber missing");
            fiber.state = FiberState::Running;
        }
        self.current = Some(id);
        let (fiber, master) = {
            let fibers = &mut self.fibers;
            let master = &mut self.master;
            (fibers.get_mut(id).expect("scheduled fiber missing"), master)
        };
        // SAFETY: `master` is this OS thread's own stack; `fiber` was
        // either just prepared (first run) or last switched out of itself
        // (resumed run).
        unsafe { Fiber::switch(master, fiber) };
    }

    /// Drops dead fibers whose outcome has already been observed by
    /// whoever created them; fibers with a stack-size match stay in the
    /// dead list for reuse by `fiber_create` instead of being freed here.
    fn reap_one_task(&mut self) {
        // Dead fibers are retained for reuse (§4.7); nothing to free
        // eagerly here. This hook exists so a future policy (capping the
        // dead list size) has a single place to live.
    }

    fn halt_on_event_source(&mut self) {
        self.reclaimer.enter(self.id);
        let timeout = self.next_timeout();
        match self.event_source.poll(timeout) {
            Ok(ready) => self.handle_ready(ready),
            Err(err) => warn!(target: "mainmemory::context", "poll failed: {err}"),
        }
        self.reclaimer.leave(self.id);
    }

    fn poll_event_source_nonblocking(&mut self) {
        match self.event_source.poll(Some(Duration::ZERO)) {
            Ok(ready) => self.handle_ready(ready),
            Err(err) => warn!(target: "mainmemory::context", "non-blocking poll failed: {err}"),
        }
    }

    fn next_timeout(&mut self) -> Option<Duration> {
        let now = self.timepiece.now();
        self.timers.peek_min().map(|deadline| {
            deadline.saturating_duration_since(now)
        })
    }

    fn fire_due_timers(&mut self) {
        let now = self.timepiece.now();
        let fired = self.timers.fire_due(now);
        self.stats.timers_fired += fired.len() as u64;
        for (_id, action) in fired {
            match action {
                TimerAction::ResumeFiber(fiber) => self.fiber_run(fiber),
                TimerAction::EnqueueTask(task) => self.task_list.add(task),
            }
        }
    }

    fn handle_ready(&mut self, ready: Vec<(u64, crate::event::Readiness)>) {
        for (token, readiness) in ready {
            let id = crate::pool::Handle::from_token(token);
            if readiness.input {
                self.submit_input(id);
            }
            if readiness.output {
                self.submit_output(id);
            }
            if readiness.error || readiness.hup {
                if let Some(sink) = self.sinks.get_mut(id) {
                    sink.flags.insert(SinkFlags::INPUT_ERROR | SinkFlags::OUTPUT_ERROR);
                }
                // Force a task through each direction so the error flag is
                // observed and `close_fd` runs even if no read/write
                // readiness accompanied the error.
                self.submit_input(id);
                self.submit_output(id);
            }
        }
    }

    fn deliver_ready_sinks(&mut self) {
        // `handle_ready` already ran from inside `halt_on_event_source`;
        // nothing further to deliver once `poll` has returned.
    }

    // ---- sink lifecycle (§4.3) ---------------------------------------

    pub fn sink_prepare_fd(
        &mut self,
        fd: std::os::unix::io::RawFd,
        regular_input: bool,
        regular_output: bool,
        tasks: IoTasks,
        destroy: Box<dyn FnOnce() + Send>,
    ) -> SinkId {
        let sink = Sink::prepare_fd(fd, regular_input, regular_output, tasks, destroy);
        self.sinks.alloc(sink)
    }

    /// Binds a detached sink to this context and registers it with the
    /// event source. Must be called from the context that will own it.
    pub fn sink_register_fd(&mut self, id: SinkId) -> Result<()> {
        let (fd, interest) = {
            let sink = self.sinks.get_mut(id).ok_or(Error::SinkClosed)?;
            sink.context = self.id;
            let mut interest = Interest::empty();
            if !sink.flags.contains(SinkFlags::INPUT_CLOSED) {
                interest |= Interest::INPUT;
            }
            if !sink.flags.contains(SinkFlags::OUTPUT_CLOSED) {
                interest |= Interest::OUTPUT;
            }
            if sink.flags.intersects(SinkFlags::ONESHOT_INPUT | SinkFlags::ONESHOT_OUTPUT) {
                interest |= Interest::ONESHOT;
            }
            (sink.fd, interest)
        };
        self.event_source.register(fd, id.to_token(), interest)?;
        Ok(())
    }

    /// Pins `id`'s "regular listener" home context (§4.3 completion step):
    /// once a reassigned regular sink's current task completes cleanly, it
    /// rebinds back to `context` instead of staying wherever it was last
    /// stolen to.
    pub fn sink_pin_home(&mut self, id: SinkId, context: usize) {
        if let Some(sink) = self.sinks.get_mut(id) {
            sink.home_context = Some(context);
        }
    }

    /// Re-arms a one-shot sink for its next event (§4.2/§4.3).
    pub fn sink_trigger_input(&mut self, id: SinkId) -> Result<()> {
        self.sink_trigger(id, Interest::INPUT)
    }

    pub fn sink_trigger_output(&mut self, id: SinkId) -> Result<()> {
        self.sink_trigger(id, Interest::OUTPUT)
    }

    fn sink_trigger(&mut self, id: SinkId, direction: Interest) -> Result<()> {
        let (fd, interest) = {
            let sink = self.sinks.get(id).ok_or(Error::SinkClosed)?;
            (sink.fd, direction | Interest::ONESHOT)
        };
        self.event_source.rearm(fd, id.to_token(), interest)?;
        Ok(())
    }

    /// §4.3 `submit_input`: no-op if input is closed; sets RESTART if a
    /// task is already in flight; otherwise starts a fresh one.
    pub fn submit_input(&mut self, id: SinkId) {
        let should_start = match self.sinks.get_mut(id) {
            Some(sink) => {
                if sink.flags.contains(SinkFlags::INPUT_CLOSED) {
                    false
                } else if sink.flags.contains(SinkFlags::INPUT_STARTED) {
                    sink.flags.insert(SinkFlags::INPUT_RESTART);
                    false
                } else {
                    sink.flags.insert(SinkFlags::INPUT_STARTED);
                    true
                }
            }
            None => false,
        };
        if should_start {
            self.task_list.add(Box::new(InputTask { sink: id }));
        }
    }

    /// Symmetric to [`Context::submit_input`].
    pub fn submit_output(&mut self, id: SinkId) {
        let should_start = match self.sinks.get_mut(id) {
            Some(sink) => {
                if sink.flags.contains(SinkFlags::OUTPUT_CLOSED) {
                    false
                } else if sink.flags.contains(SinkFlags::OUTPUT_STARTED) {
                    sink.flags.insert(SinkFlags::OUTPUT_RESTART);
                    false
                } else {
                    sink.flags.insert(SinkFlags::OUTPUT_STARTED);
                    true
                }
            }
            None => false,
        };
        if should_start {
            self.task_list.add(Box::new(OutputTask { sink: id }));
        }
    }

    /// §4.3 "close_fd": idempotent, marks both directions closed and
    /// unregisters from the backend.
    pub fn close_fd(&mut self, id: SinkId) {
        let fd = match self.sinks.get_mut(id) {
            Some(sink) => {
                if sink.flags.contains(SinkFlags::INPUT_CLOSED | SinkFlags::OUTPUT_CLOSED) {
                    return;
                }
                sink.flags.insert(SinkFlags::INPUT_CLOSED | SinkFlags::OUTPUT_CLOSED);
                sink.fd
            }
            None => return,
        };
        if let Err(err) = self.event_source.unregister(fd) {
            warn!(target: "mainmemory::context", "unregister fd {fd} failed: {err}");
        }
        self.retire_sink(id);
    }

    /// §4.3 "close_broken_fd": `close_fd` plus an immediate zero-timeout
    /// backend flush so the broken state is pushed out before the context
    /// might otherwise sleep.
    pub fn close_broken_fd(&mut self, id: SinkId) {
        if let Some(sink) = self.sinks.get_mut(id) {
            sink.flags.insert(SinkFlags::BROKEN);
        }
        self.close_fd(id);
        let _ = self.event_source.flush();
    }

    fn retire_sink(&mut self, id: SinkId) {
        self.reclaimer.enter(self.id);
        if let Some(mut sink) = self.sinks.free(id) {
            if let Some(destroy) = sink.destroy.take() {
                self.reclaimer.retire(self.id, destroy);
            }
        }
        self.reclaimer.leave(self.id);
    }

    /// §4.3 completion step: resubmit if restart was requested meanwhile;
    /// else close on a pending error; else, for a regular sink pinned to a
    /// home context it has since drifted from (via reassignment), rebind to
    /// that home rather than leaving it wherever it was last stolen to.
    fn sink_complete(&mut self, id: SinkId, direction: Direction) {
        let (should_resubmit, should_close, rebind_to) = match self.sinks.get_mut(id) {
            Some(sink) => {
                let (started, restart, error, closed, regular) = match direction {
                    Direction::Input => (
                        SinkFlags::INPUT_STARTED,
                        SinkFlags::INPUT_RESTART,
                        SinkFlags::INPUT_ERROR,
                        SinkFlags::INPUT_CLOSED,
                        SinkFlags::REGULAR_INPUT,
                    ),
                    Direction::Output => (
                        SinkFlags::OUTPUT_STARTED,
                        SinkFlags::OUTPUT_RESTART,
                        SinkFlags::OUTPUT_ERROR,
                        SinkFlags::OUTPUT_CLOSED,
                        SinkFlags::REGULAR_OUTPUT,
                    ),
                };
                if sink.flags.contains(restart) && !sink.flags.contains(closed) {
                    sink.flags.remove(restart);
                    (true, false, None)
                } else {
                    sink.flags.remove(started);
                    let has_error = sink.flags.contains(error);
                    let should_close = has_error || sink.flags.contains(closed);
                    let rebind_to = if !should_close && sink.flags.contains(regular) {
                        sink.home_context.filter(|&home| home != sink.context)
                    } else {
                        None
                    };
                    (false, should_close, rebind_to)
                }
            }
            None => return,
        };
        if should_resubmit {
            match direction {
                Direction::Input => self.task_list.add(Box::new(InputTask { sink: id })),
                Direction::Output => self.task_list.add(Box::new(OutputTask { sink: id })),
            }
        } else if should_close {
            self.close_fd(id);
        } else if let Some(home) = rebind_to {
            if let Some(sink) = self.sinks.get_mut(id) {
                sink.context = home;
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Input,
    Output,
}

struct InputTask {
    sink: SinkId,
}

impl RunnableTask for InputTask {
    fn execute(&mut self, ctx: &mut Context) -> TaskValue {
        let outcome = match ctx.sinks.get_mut(self.sink) {
            Some(sink) => {
                let mut execute = sink.tasks.input_execute.take();
                let result = execute
                    .as_mut()
                    .map(|f| f(ctx, self.sink))
                    .unwrap_or(IoProgress::Closed);
                if let Some(sink) = ctx.sinks.get_mut(self.sink) {
                    sink.tasks.input_execute = execute;
                }
                result
            }
            None => IoProgress::Closed,
        };
        Box::new(outcome)
    }

    fn complete(&mut self, ctx: &mut Context, value: TaskValue) {
        let outcome = *value
            .downcast::<IoProgress>()
            .expect("InputTask::execute always returns IoProgress");
        if let IoProgress::Error | IoProgress::Closed = outcome {
            if let Some(sink) = ctx.sinks.get_mut(self.sink) {
                sink.flags.insert(SinkFlags::INPUT_ERROR);
            }
        }
        ctx.sink_complete(self.sink, Direction::Input);
    }

    fn reassign(&mut self, ctx: &mut Context, target_context: usize) -> bool {
        match ctx.sinks.get_mut(self.sink) {
            Some(sink) if sink.may_reassign() => {
                sink.context = target_context;
                true
            }
            _ => false,
        }
    }
}

struct OutputTask {
    sink: SinkId,
}

impl RunnableTask for OutputTask {
    fn execute(&mut self, ctx: &mut Context) -> TaskValue {
        let outcome = match ctx.sinks.get_mut(self.sink) {
            Some(sink) => {
                let mut execute = sink.tasks.output_execute.take();
                let result = execute
                    .as_mut()
                    .map(|f| f(ctx, self.sink))
                    .unwrap_or(IoProgress::Closed);
                if let Some(sink) = ctx.sinks.get_mut(self.sink) {
                    sink.tasks.output_execute = execute;
                }
                result
            }
            None => IoProgress::Closed,
        };
        Box::new(outcome)
    }

    fn complete(&mut self, ctx: &mut Context, value: TaskValue) {
        let outcome = *value
            .downcast::<IoProgress>()
            .expect("OutputTask::execute always returns IoProgress");
        if let IoProgress::Error | IoProgress::Closed = outcome {
            if let Some(sink) = ctx.sinks.get_mut(self.sink) {
                sink.flags.insert(SinkFlags::OUTPUT_ERROR);
            }
        }
        ctx.sink_complete(self.sink, Direction::Output);
    }

    fn reassign(&mut self, ctx: &mut Context, target_context: usize) -> bool {
        match ctx.sinks.get_mut(self.sink) {
            Some(sink) if sink.may_reassign() => {
                sink.context = target_context;
                true
            }
            _ => false,
        }
    }
}
