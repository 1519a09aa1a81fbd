//! Event sink (component C, §4.3): per-file-descriptor state machine with
//! an I/O task pair and a reclamation link.
//!
//! The sink itself only carries state; the scheduling logic that submits,
//! re-submits and completes I/O tasks lives on [`crate::context::Context`]
//! (the "Sink operations" section there), since it needs the task list and
//! event source alongside the sink table — mirroring the design note on
//! cyclic references (§9): the sink never owns a pointer back to its
//! context, only the `usize` index `Context::id` resolves through.

use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::context::Context;
use crate::fiber::FiberId;
use crate::pool::Handle;

pub type SinkId = Handle;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SinkFlags: u32 {
        const INPUT_READY        = 1 << 0;
        const OUTPUT_READY       = 1 << 1;
        const INPUT_ERROR        = 1 << 2;
        const OUTPUT_ERROR       = 1 << 3;
        const INPUT_CLOSED       = 1 << 4;
        const OUTPUT_CLOSED      = 1 << 5;
        const BROKEN             = 1 << 6;
        const INPUT_STARTED      = 1 << 7;
        const OUTPUT_STARTED     = 1 << 8;
        const INPUT_RESTART      = 1 << 9;
        const OUTPUT_RESTART     = 1 << 10;
        const REGULAR_INPUT      = 1 << 11;
        const REGULAR_OUTPUT     = 1 << 12;
        const ONESHOT_INPUT      = 1 << 13;
        const ONESHOT_OUTPUT     = 1 << 14;
        const FIXED_POLLER       = 1 << 15;
        const COMMON_POLLER      = 1 << 16;
        const HAS_PENDING_CHANGE = 1 << 17;
    }
}

/// What one direction's I/O execute closure observed this attempt.
pub enum IoProgress {
    /// Made progress; if more remains, resubmit on the next readiness.
    Progress,
    /// Would block; wait for the next readiness notification.
    WouldBlock,
    Error,
    Closed,
}

pub type IoExecute = Box<dyn FnMut(&mut Context, SinkId) -> IoProgress + Send>;

/// The I/O task pair named in §3/§4.3: an execute closure per direction.
/// `instant_io()` builds the stub pair used for sinks with no real I/O
/// (§6): any event is unexpected and closes the sink.
#[derive(Default)]
pub struct IoTasks {
    pub input_execute: Option<IoExecute>,
    pub output_execute: Option<IoExecute>,
}

impl IoTasks {
    pub fn new(input_execute: IoExecute, output_execute: IoExecute) -> Self {
        Self {
            input_execute: Some(input_execute),
            output_execute: Some(output_execute),
        }
    }

    /// Stub pair: any delivered event is unexpected, so the closures just
    /// report an error, which the completion step turns into `close_fd`.
    pub fn instant() -> Self {
        Self {
            input_execute: Some(Box::new(|_ctx, _sink| IoProgress::Error)),
            output_execute: Some(Box::new(|_ctx, _sink| IoProgress::Error)),
        }
    }
}

/// Per-sink state. Lives in a context's `Pool<Sink>`; the stable `SinkId`
/// handle is what the I/O tasks and timers carry around instead of a raw
/// pointer.
pub struct Sink {
    pub(crate) fd: RawFd,
    pub(crate) flags: SinkFlags,
    pub(crate) context: usize,
    pub(crate) tasks: IoTasks,
    pub(crate) input_fiber: Option<FiberId>,
    pub(crate) output_fiber: Option<FiberId>,
    pub(crate) destroy: Option<Box<dyn FnOnce() + Send>>,
    /// The "pinned regular listener" context named in §4.3's completion
    /// step: a regular-input/output sink whose current `context` has
    /// drifted from this (via reassignment) rebinds back to it once its
    /// task completes cleanly. `None` for sinks with no fixed home.
    pub(crate) home_context: Option<usize>,
}

impl Sink {
    /// Builds a sink in the detached state (§4.3: `prepare_fd`). It is not
    /// yet registered with any event source or bound to a context.
    pub fn prepare_fd(
        fd: RawFd,
        regular_input: bool,
        regular_output: bool,
        tasks: IoTasks,
        destroy: Box<dyn FnOnce() + Send>,
    ) -> Self {
        let mut flags = SinkFlags::empty();
        if regular_input {
            flags |= SinkFlags::REGULAR_INPUT;
        } else {
            flags |= SinkFlags::ONESHOT_INPUT;
        }
        if regular_output {
            flags |= SinkFlags::REGULAR_OUTPUT;
        } else {
            flags |= SinkFlags::ONESHOT_OUTPUT;
        }
        Self {
            fd,
            flags,
            context: usize::MAX,
            tasks,
            input_fiber: None,
            output_fiber: None,
            destroy: Some(destroy),
            home_context: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn flags(&self) -> SinkFlags {
        self.flags
    }

    pub fn is_closed(&self) -> bool {
        self.flags
            .intersects(SinkFlags::INPUT_CLOSED | SinkFlags::OUTPUT_CLOSED)
    }

    pub fn is_broken(&self) -> bool {
        self.flags.contains(SinkFlags::BROKEN)
    }

    /// §4.3 reassignment policy: not fixed-poller, not one-shot in either
    /// direction, and exactly one direction currently has a task in
    /// flight — so two tasks for the same sink never run on two contexts
    /// at once.
    pub fn may_reassign(&self) -> bool {
        if self
            .flags
            .intersects(SinkFlags::FIXED_POLLER | SinkFlags::ONESHOT_INPUT | SinkFlags::ONESHOT_OUTPUT)
        {
            return false;
        }
        let input_active = self.flags.contains(SinkFlags::INPUT_STARTED);
        let output_active = self.flags.contains(SinkFlags::OUTPUT_STARTED);
        input_active ^ output_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_destroy() -> Box<dyn FnOnce() + Send> {
        Box::new(|| {})
    }

    #[test]
    fn prepare_fd_defaults_to_oneshot_when_not_regular() {
        let sink = Sink::prepare_fd(3, false, false, IoTasks::instant(), noop_destroy());
        assert!(sink.flags().contains(SinkFlags::ONESHOT_INPUT));
        assert!(sink.flags().contains(SinkFlags::ONESHOT_OUTPUT));
        assert!(!sink.is_closed());
    }

    #[test]
    fn reassign_requires_exactly_one_active_direction() {
        let mut sink = Sink::prepare_fd(3, true, true, IoTasks::instant(), noop_destroy());
        assert!(!sink.may_reassign(), "neither direction active");
        sink.flags.insert(SinkFlags::INPUT_STARTED);
        assert!(sink.may_reassign());
        sink.flags.insert(SinkFlags::OUTPUT_STARTED);
        assert!(!sink.may_reassign(), "both directions active");
    }

    #[test]
    fn fixed_poller_never_reassigns() {
        let mut sink = Sink::prepare_fd(3, true, true, IoTasks::instant(), noop_destroy());
        sink.flags.insert(SinkFlags::FIXED_POLLER | SinkFlags::INPUT_STARTED);
        assert!(!sink.may_reassign());
    }
}
