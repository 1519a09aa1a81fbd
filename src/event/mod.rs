//! Event source (component B, §4.2): the adapter to the OS readiness
//! multiplexer. This crate implements the readiness-set variant on Linux
//! with `epoll`, one-shot sinks re-armed with `EPOLLONESHOT`, regular sinks
//! registered level-triggered, and `notify` backed by `eventfd` — the
//! concrete choice the spec calls out as acceptable alongside an explicit
//! arm/disarm-per-direction multiplexer.

pub mod sink;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// What a registration or re-arm should watch for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interest: u32 {
        const INPUT  = 1 << 0;
        const OUTPUT = 1 << 1;
        /// One-shot: the backend drops interest after the next delivery;
        /// the caller must `rearm` to see another event.
        const ONESHOT = 1 << 2;
    }
}

/// What `poll` observed for one registered token.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub input: bool,
    pub output: bool,
    pub error: bool,
    pub hup: bool,
}

fn interest_to_epoll_events(interest: Interest) -> u32 {
    let mut events = 0u32;
    if interest.contains(Interest::INPUT) {
        events |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::OUTPUT) {
        events |= libc::EPOLLOUT as u32;
    }
    if interest.contains(Interest::ONESHOT) {
        events |= libc::EPOLLONESHOT as u32;
    } else {
        // Regular sinks stay level-triggered (epoll's default); nothing to
        // add here beyond the interest bits themselves.
    }
    events
}

/// The `epoll` + `eventfd` backend. One instance is owned by each
/// [`crate::context::Context`]; tokens are the caller's own identifiers
/// (in practice a sink pool index) stashed in `epoll_event.u64`.
pub struct EventSource {
    epoll_fd: RawFd,
    notify_fd: RawFd,
}

impl EventSource {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let notify_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if notify_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }
        let source = Self {
            epoll_fd,
            notify_fd,
        };
        source.register(notify_fd, 0, Interest::INPUT)?;
        Ok(source)
    }

    pub fn register(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    /// Re-arms a one-shot registration for another delivery.
    pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll_events(interest),
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// This backend has no separate batched-change buffer, so `flush` is a
    /// no-op: every `register`/`rearm`/`unregister` above takes effect
    /// immediately via `epoll_ctl`.
    pub fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    /// Blocks up to `timeout` (or indefinitely if `None`) for readiness.
    /// The notification token `0` is reserved for the internal eventfd and
    /// filtered out of the returned set.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<(u64, Readiness)>> {
        const MAX_EVENTS: usize = 256;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let mut out = Vec::with_capacity(n as usize);
        for event in &events[..n as usize] {
            if event.u64 == 0 {
                self.notify_clean()?;
                continue;
            }
            let bits = event.events as i32;
            out.push((
                event.u64,
                Readiness {
                    input: bits & libc::EPOLLIN != 0,
                    output: bits & libc::EPOLLOUT != 0,
                    error: bits & libc::EPOLLERR != 0,
                    hup: bits & libc::EPOLLHUP != 0,
                },
            ));
        }
        Ok(out)
    }

    /// Wakes a context blocked in `poll` even if no registered fd is ready.
    /// Idempotent until [`EventSource::notify_clean`] is called: repeated
    /// calls before the eventfd is drained coalesce into one wakeup.
    pub fn notify(&self) -> io::Result<()> {
        let value: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.notify_fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // EAGAIN means the counter is already saturated, i.e. a wakeup
            // is already pending — that is success, not failure.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Drains the eventfd counter so a future `notify` produces a fresh
    /// wakeup rather than coalescing into one already consumed.
    pub fn notify_clean(&self) -> io::Result<()> {
        let mut value: u64 = 0;
        let rc = unsafe {
            libc::read(
                self.notify_fd,
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Hands out a cross-thread wakeup handle for this event source's
    /// notify channel. Used by [`crate::dispatch::Dispatch`] so posting to
    /// a context's inbox from another OS thread can also wake it out of a
    /// blocking `poll`, rather than waiting for its next timer deadline.
    pub fn waker(&self) -> io::Result<EventWaker> {
        let fd = unsafe { libc::dup(self.notify_fd) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventWaker { fd })
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.notify_fd);
        }
    }
}

/// A cloneable-by-construction (call [`EventSource::waker`] again for
/// another one), `Send`+`Sync` handle that can poke a context's eventfd
/// from any thread, independent of the [`EventSource`] itself.
pub struct EventWaker {
    fd: RawFd,
}

impl EventWaker {
    pub fn notify(&self) -> io::Result<()> {
        let value: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.fd,
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

// SAFETY: `fd` is a plain dup'd file descriptor; `write(2)` on an eventfd
// is safe to call concurrently from any thread.
unsafe impl Send for EventWaker {}
unsafe impl Sync for EventWaker {}

impl Drop for EventWaker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_with_zero_timeout_returns_promptly_when_idle() {
        let source = EventSource::new().unwrap();
        let events = source.poll(Some(Duration::from_millis(0))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn notify_wakes_a_zero_timeout_poll() {
        let source = EventSource::new().unwrap();
        source.notify().unwrap();
        // The reserved token 0 is filtered internally; the wakeup itself is
        // what matters, so polling with a real timeout must not block.
        let events = source.poll(Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn waker_wakes_a_blocking_poll_from_another_handle() {
        let source = EventSource::new().unwrap();
        let waker = source.waker().unwrap();
        waker.notify().unwrap();
        let events = source.poll(Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());
    }
}
