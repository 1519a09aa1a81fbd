//! Dispatch (component J, §6): the set of all contexts and the shared
//! resources they coordinate on.
//!
//! `Dispatch::new` plays the role of `dispatch_prepare(attr)`: it builds
//! `config.contexts` [`Context`]s sharing one [`Reclaimer`] (one epoch slot
//! per context, per §4.4) and hands each its own stop flag, inbox and event
//! waker. A `Context` only exists meaningfully on the OS thread running its
//! loop (§9 "Global mutable state"), so `Dispatch` never reaches back into
//! a started context directly — cross-context effects (`async_call_N`,
//! `context_stop`) go through the inbox each context already drains at the
//! top of its own loop, same as cross-context task reassignment (§4.3).

use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};

use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::epoch::Reclaimer;
use crate::event::EventWaker;
use crate::task::{AsyncRoutine, Inbox};

/// Per-context resources `Dispatch` keeps a handle to even after the
/// `Context` itself has been moved onto its own OS thread.
struct ContextHandle {
    inbox: Arc<Inbox>,
    stop: Arc<AtomicU32>,
    waker: EventWaker,
    context: Option<Context>,
    thread: Option<JoinHandle<()>>,
}

/// Owns every context and the resources they share: the epoch reclaimer,
/// the frozen configuration, and (until each is started) the contexts
/// themselves.
pub struct Dispatch {
    config: Arc<RuntimeConfig>,
    reclaimer: Arc<Reclaimer>,
    handles: Vec<ContextHandle>,
    next_post: AtomicUsize,
}

impl Dispatch {
    /// `dispatch_prepare(attr)`: builds one context per `config.contexts`,
    /// none of them started yet. Returns as soon as every context's event
    /// source (epoll instance + eventfd) is allocated.
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let config = Arc::new(config);
        let n = config.contexts as usize;
        let reclaimer = Arc::new(Reclaimer::new(n));
        let mut handles = Vec::with_capacity(n);
        for id in 0..n {
            let stop = Arc::new(AtomicU32::new(0));
            let inbox = Arc::new(Inbox::new(256));
            let context = Context::new(
                id,
                Arc::clone(&config),
                Arc::clone(&reclaimer),
                Arc::clone(&inbox),
                Arc::clone(&stop),
            )?;
            let waker = context.waker()?;
            handles.push(ContextHandle {
                inbox,
                stop,
                waker,
                context: Some(context),
                thread: None,
            });
        }
        let peer_inboxes: Vec<Arc<Inbox>> = handles.iter().map(|h| Arc::clone(&h.inbox)).collect();
        for handle in &mut handles {
            handle
                .context
                .as_mut()
                .expect("context not yet started")
                .set_peers(peer_inboxes.clone());
        }
        debug!(target: "mainmemory::dispatch", "dispatch prepared with {n} contexts");
        Ok(Self {
            config,
            reclaimer,
            handles,
            next_post: AtomicUsize::new(0),
        })
    }

    pub fn contexts(&self) -> usize {
        self.handles.len()
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn reclaimer(&self) -> &Arc<Reclaimer> {
        &self.reclaimer
    }

    /// `context_start()`: runs context `index`'s loop on the calling OS
    /// thread until it observes its stop flag. Takes ownership of that
    /// context; calling it twice for the same index panics with a clear
    /// message rather than silently doing nothing.
    pub fn context_start(&mut self, index: usize) {
        let mut context = self.handles[index]
            .context
            .take()
            .unwrap_or_else(|| panic!("context {index} already started"));
        context.run();
    }

    /// Convenience beyond the literal §6 surface: spawns every
    /// not-yet-started context on its own OS thread, matching how the
    /// demo binary and the integration tests actually want to drive
    /// several contexts without hand-rolling `thread::spawn` at each call
    /// site.
    pub fn spawn_all(&mut self) -> io::Result<()> {
        for index in 0..self.handles.len() {
            if self.handles[index].context.is_none() {
                continue;
            }
            let mut context = self.handles[index].context.take().unwrap();
            let thread = std::thread::Builder::new()
                .name(format!("mainmemory-ctx-{index}"))
                .spawn(move || context.run())?;
            self.handles[index].thread = Some(thread);
        }
        Ok(())
    }

    /// `context_stop(context)`: flips the shared stop flag and wakes the
    /// context out of a blocking `poll`, mirroring exactly what
    /// `Context::request_stop` does from inside the context itself — the
    /// flag and the waker are the same shared handles, so there is no
    /// functional difference between stopping a context from within and
    /// from `Dispatch`.
    pub fn context_stop(&self, context: usize) {
        let handle = &self.handles[context];
        handle.stop.store(1, Ordering::Release);
        if let Err(err) = handle.waker.notify() {
            warn!(target: "mainmemory::dispatch", "failed to wake context {context} to stop it: {err}");
        }
    }

    /// Stops every context and joins its thread, if it was started via
    /// [`Dispatch::spawn_all`]. `dispatch_cleanup`: safe to call even if
    /// some contexts were started with [`Dispatch::context_start`]
    /// instead (those threads are the caller's to join).
    pub fn dispatch_cleanup(&mut self) {
        for index in 0..self.handles.len() {
            self.context_stop(index);
        }
        for handle in &mut self.handles {
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
        debug!(target: "mainmemory::dispatch", "dispatch cleaned up");
    }

    /// `async_call_N(context, routine, ...)`: a Rust closure already
    /// captures whatever arguments it needs, so there is no arity to
    /// parametrize over (see the note on `task::AsyncRoutine`). Busy-waits
    /// until the target inbox has room.
    pub fn async_call(&self, context: usize, routine: AsyncRoutine) {
        let handle = &self.handles[context];
        handle.inbox.post(routine);
        let _ = handle.waker.notify();
    }

    /// `async_try_call_N`: non-blocking; `false` if the target inbox is
    /// currently full (§7 "Queue saturation").
    pub fn async_try_call(&self, context: usize, routine: AsyncRoutine) -> bool {
        let handle = &self.handles[context];
        let posted = handle.inbox.try_post(routine);
        if posted {
            let _ = handle.waker.notify();
        }
        posted
    }

    /// `async_post_N`: chooses any context. Round-robin, the same
    /// placement policy `place_sink` uses below.
    pub fn async_post(&self, routine: AsyncRoutine) -> usize {
        let context = self.next_round_robin();
        self.async_call(context, routine);
        context
    }

    /// Picks the context that should host a newly-registered sink.
    /// Round-robin: the simplest policy consistent with "contexts are
    /// interchangeable general-purpose workers" (§5); a load-aware policy
    /// is future work, not something the distilled spec specifies (an
    /// Open Question resolved this way, recorded alongside the others).
    ///
    /// Registration itself still has to happen on the chosen context's own
    /// thread (`sink_prepare_fd`/`sink_register_fd` take `&mut Context`),
    /// so callers post an async call to the returned index rather than
    /// calling those methods directly from here.
    pub fn place_sink(&self) -> usize {
        self.next_round_robin()
    }

    fn next_round_robin(&self) -> usize {
        let n = self.handles.len();
        self.next_post.fetch_add(1, Ordering::Relaxed) % n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    #[test]
    fn new_builds_one_context_per_configured_count() {
        let config = RuntimeConfig {
            contexts: 3,
            ..RuntimeConfig::default()
        };
        let dispatch = Dispatch::new(config).unwrap();
        assert_eq!(dispatch.contexts(), 3);
    }

    #[test]
    fn round_robin_placement_cycles_through_contexts() {
        let config = RuntimeConfig {
            contexts: 2,
            ..RuntimeConfig::default()
        };
        let dispatch = Dispatch::new(config).unwrap();
        let picks: Vec<usize> = (0..4).map(|_| dispatch.place_sink()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[test]
    fn async_call_runs_on_the_target_context_after_spawn() {
        let config = RuntimeConfig {
            contexts: 2,
            ..RuntimeConfig::default()
        };
        let mut dispatch = Dispatch::new(config).unwrap();
        dispatch.spawn_all().unwrap();

        let cell = Arc::new(StdAtomicUsize::new(0));
        let cell2 = Arc::clone(&cell);
        dispatch.async_call(
            1,
            Box::new(move |_ctx| {
                cell2.store(12, Ordering::SeqCst);
            }),
        );

        let mut observed = 0;
        for _ in 0..200 {
            observed = cell.load(Ordering::SeqCst);
            if observed == 12 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(observed, 12);

        dispatch.dispatch_cleanup();
    }

    #[test]
    fn context_stop_lets_spawned_threads_join() {
        let config = RuntimeConfig {
            contexts: 2,
            ..RuntimeConfig::default()
        };
        let mut dispatch = Dispatch::new(config).unwrap();
        dispatch.spawn_all().unwrap();
        dispatch.dispatch_cleanup();
        assert!(dispatch.handles.iter().all(|h| h.thread.is_none()));
    }
}
