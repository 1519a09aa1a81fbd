//! Fiber (component G, §4.7): a stackful cooperative user thread.
//!
//! Stack switching uses POSIX `ucontext` (`getcontext`/`makecontext`/
//! `swapcontext` via `libc`) rather than a compiled state machine — the
//! same family of primitives the distilled spec's C source would use for
//! "swapping machine contexts" (§9 "Coroutines"). The scheduling policy
//! (run queue placement, blocked/dead bookkeeping, the master fiber) lives
//! in [`crate::context`]; this module owns only the fiber's own state and
//! the raw stack-switch primitive.

use std::any::Any;
use std::mem::MaybeUninit;

use bitflags::bitflags;

use crate::context::Context;
use crate::pool::Handle;

/// Identifies a fiber within its owning context's pool. Fibers never
/// migrate between contexts (only tasks and sinks do, per §4.3's
/// reassignment policy), so a `FiberId` is only ever meaningful relative to
/// the context that allocated it.
pub type FiberId = Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Invalid,
    Blocked,
    Pending,
    Running,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FiberFlags: u32 {
        const CANCEL_ENABLE   = 1 << 0;
        const CANCEL_REQUIRED = 1 << 1;
        const CANCEL_OCCURRED = 1 << 2;
        const WAITING         = 1 << 3;
    }
}

/// Result a fiber leaves behind on exit: either the boxed return value of
/// its start routine, or the well-known canceled marker (§4.7
/// Cancellation).
pub enum FiberOutcome {
    Finished(Box<dyn Any + Send>),
    Canceled,
    Panicked(String),
}

/// An mmap-backed stack with a guard page at the low address (stacks grow
/// down on every POSIX target this crate supports).
struct Stack {
    base: *mut u8,
    mapped_len: usize,
    usable_len: usize,
}

// SAFETY: `base` is an exclusively-owned `mmap` region; nothing else ever
// holds a pointer into it concurrently, so moving (and with it, the whole
// owning `Fiber`/`Context`) to another thread is sound. A context's fiber
// pool is moved wholesale onto its own OS thread by `Dispatch::spawn_all`.
unsafe impl Send for Stack {}

impl Stack {
    fn allocate(usable_len: usize) -> std::io::Result<Self> {
        let page = page_size();
        let usable_len = round_up(usable_len, page).max(page);
        let mapped_len = usable_len + page; // + guard page
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        let base = base as *mut u8;
        let rc = unsafe { libc::mprotect(base as *mut libc::c_void, page, libc::PROT_NONE) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(base as *mut libc::c_void, mapped_len) };
            return Err(err);
        }
        Ok(Self {
            base,
            mapped_len,
            usable_len,
        })
    }

    /// Top of the usable region (stacks grow down from here).
    fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped_len).sub(0) }
    }

    /// Start of the usable region, i.e. one page above the guard page.
    fn usable_base(&self) -> *mut u8 {
        unsafe { self.base.add(self.mapped_len - self.usable_len) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mapped_len);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// The boxed start routine, taken exactly once when the fiber is (re)used.
/// It receives the owning [`Context`] directly — the fiber's own scheduling
/// operations (`fiber_yield`, `fiber_block`, sink submission) are methods on
/// `Context`, and this is how fiber bodies reach them without a thread-local
/// lookup on every call (see the "Global mutable state" design note). `Send`
/// because a fiber is created on one context but that context's whole
/// `Fiber` pool — including not-yet-run `start` routines — moves onto its
/// own OS thread via `Dispatch::spawn_all`.
pub type StartRoutine = Box<dyn FnOnce(&mut Context) -> Box<dyn Any + Send> + Send>;

pub struct Fiber {
    stack: Stack,
    ucontext: Box<libc::ucontext_t>,
    pub state: FiberState,
    pub flags: FiberFlags,
    pub original_priority: u8,
    pub current_priority: u8,
    /// `Some` only between `create`/reuse and the first switch into it.
    pub(crate) start: Option<StartRoutine>,
    pub outcome: Option<FiberOutcome>,
    pub(crate) cleanups: Vec<Box<dyn FnOnce() + Send>>,
}

impl Fiber {
    pub fn new(stack_size: usize, priority: u8, start: StartRoutine) -> std::io::Result<Self> {
        let stack = Stack::allocate(stack_size)?;
        Ok(Self {
            stack,
            // SAFETY: zero-initialized `ucontext_t` is only read after
            // `getcontext`/`makecontext` populate it below.
            ucontext: Box::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            state: FiberState::Invalid,
            flags: FiberFlags::CANCEL_ENABLE,
            original_priority: priority,
            current_priority: priority,
            start: Some(start),
            outcome: None,
            cleanups: Vec::new(),
        })
    }

    pub fn stack_len(&self) -> usize {
        self.stack.usable_len
    }

    /// Reuses a fiber from the dead list: the stack is kept, everything
    /// else is reset as if freshly created.
    pub fn reset(&mut self, priority: u8, start: StartRoutine) {
        self.state = FiberState::Invalid;
        self.flags = FiberFlags::CANCEL_ENABLE;
        self.original_priority = priority;
        self.current_priority = priority;
        self.start = Some(start);
        self.outcome = None;
        self.cleanups.clear();
    }

    /// Prepares the saved machine context so that switching into this
    /// fiber for the first time jumps to `trampoline` running on this
    /// fiber's own stack.
    ///
    /// # Safety
    /// `trampoline` must never return; it must hand control back to the
    /// scheduler by switching to another fiber's context instead.
    pub unsafe fn prepare(&mut self, trampoline: extern "C" fn()) {
        libc::getcontext(self.ucontext.as_mut());
        self.ucontext.uc_stack.ss_sp = self.stack.usable_base() as *mut libc::c_void;
        self.ucontext.uc_stack.ss_size = self.stack.usable_len;
        self.ucontext.uc_link = std::ptr::null_mut();
        libc::makecontext(self.ucontext.as_mut(), std::mem::transmute(trampoline), 0);
    }

    /// Raw stack switch: saves the caller's machine context into `from`
    /// and restores `to`'s. Returns once some later switch resumes `from`.
    ///
    /// # Safety
    /// Both fibers must belong to the same OS thread, and `to` must have
    /// been prepared via [`Fiber::prepare`] or previously switched out of.
    pub unsafe fn switch(from: &mut Fiber, to: &mut Fiber) {
        libc::swapcontext(from.ucontext.as_mut(), to.ucontext.as_mut());
    }

    /// Initializes `self` as the "master" fiber representing the context's
    /// own OS thread stack — it is never itself switched *into* via
    /// `prepare`, only switched *out of*/back *to*.
    pub fn master() -> std::io::Result<Self> {
        let stack = Stack::allocate(page_size())?;
        Ok(Self {
            stack,
            ucontext: Box::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            state: FiberState::Running,
            flags: FiberFlags::empty(),
            original_priority: 0,
            current_priority: 0,
            start: None,
            outcome: None,
            cleanups: Vec::new(),
        })
    }

    pub fn request_cancel(&mut self) {
        self.flags.insert(FiberFlags::CANCEL_REQUIRED);
    }

    /// True at a scheduling point where cancellation should take effect
    /// (§4.7 Cancellation).
    pub fn should_cancel_now(&self) -> bool {
        self.flags.contains(FiberFlags::CANCEL_ENABLE)
            && self.flags.contains(FiberFlags::CANCEL_REQUIRED)
            && !self.flags.contains(FiberFlags::CANCEL_OCCURRED)
    }

    pub fn push_cleanup(&mut self, handler: Box<dyn FnOnce() + Send>) {
        self.cleanups.push(handler);
    }

    /// Runs cleanup handlers in LIFO order, as on `fiber_exit`.
    pub fn run_cleanups(&mut self) {
        while let Some(handler) = self.cleanups.pop() {
            handler();
        }
    }

    pub fn top_of_stack(&self) -> *mut u8 {
        self.stack.top()
    }
}
