//! The eventfd module owns the kick/call eventfd pair for one virtqueue
//! (component A): creation, the non-blocking `test_and_clear` drain, and
//! teardown.

use vmm_sys_util::eventfd::EventFd;

use crate::error::{Result, VhostError};

/// A sentinel fd value the transports use to tell the backend "stop
/// signalling me" without tearing down the registration protocol (§3
/// invariants, §4.F Running → Stopped).
pub const SENTINEL_FD: i32 = -1;

/// The kick (guest→backend) and call (backend→guest) eventfds for one
/// virtqueue. Owned exclusively by the [`crate::Virtqueue`] that created
/// them; never shared across virtqueue handles (§4.A).
pub struct EventFdPair {
    kick: Option<EventFd>,
    call: Option<EventFd>,
}

impl EventFdPair {
    /// Creates both eventfds in non-blocking, counter-semantics mode with
    /// an initial value of zero. If the call fd fails to open after the
    /// kick fd succeeded, the kick fd is closed before the error is
    /// returned — initialization is all-or-nothing (§4.A Failure
    /// semantics).
    pub fn new() -> Result<Self> {
        let kick = EventFd::new(libc::EFD_NONBLOCK)
            .map_err(|e| VhostError::exhausted(format!("failed to create kick eventfd: {e}")))?;
        let call = match EventFd::new(libc::EFD_NONBLOCK) {
            Ok(call) => call,
            Err(e) => {
                // `kick` is dropped here, closing its fd; nothing else to unwind.
                return Err(VhostError::exhausted(format!(
                    "failed to create call eventfd: {e}"
                )));
            }
        };
        Ok(EventFdPair {
            kick: Some(kick),
            call: Some(call),
        })
    }

    /// Borrows the kick eventfd. Panics if called after [`Self::close`] —
    /// callers are expected to respect the virtqueue state machine, which
    /// never touches the fds of an uninitialized queue.
    pub fn kick(&self) -> &EventFd {
        self.kick.as_ref().expect("kick eventfd used after close")
    }

    /// Borrows the call eventfd. See [`Self::kick`] for the panic contract.
    pub fn call(&self) -> &EventFd {
        self.call.as_ref().expect("call eventfd used after close")
    }

    /// Non-blocking read that drains any pending count on both eventfds.
    /// Used at `Initialized -> Running` to discard notifications that
    /// accumulated before the queue was registered with the hypervisor.
    pub fn drain(&self) {
        Self::drain_one(self.kick());
        Self::drain_one(self.call());
    }

    /// Performs the `test_and_clear` operation for one eventfd: a
    /// non-blocking read succeeds by draining the pending count, and
    /// `EAGAIN` means no event was pending. The manager never interprets
    /// the drained value, only its presence (§4.A).
    fn drain_one(fd: &EventFd) {
        match fd.read() {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::warn!("eventfd drain failed: {e}"),
        }
    }

    /// Closes both eventfds and marks the pair empty. Close failures are
    /// logged, never propagated (§4.A).
    pub fn close(&mut self) {
        if self.kick.take().is_none() {
            return;
        }
        self.call.take();
        // `EventFd`'s `Drop` closes the underlying fd; there is no
        // separate fallible close step to surface a failure from, so we
        // only log that teardown happened at trace level.
        log::trace!("closed eventfd pair");
    }

    /// True once [`Self::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.kick.is_none()
    }
}

impl Drop for EventFdPair {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pair_has_distinct_open_fds() {
        use std::os::unix::io::AsRawFd;
        let pair = EventFdPair::new().unwrap();
        assert_ne!(pair.kick().as_raw_fd(), pair.call().as_raw_fd());
        assert!(!pair.is_closed());
    }

    #[test]
    fn drain_without_pending_event_is_a_no_op() {
        let pair = EventFdPair::new().unwrap();
        pair.drain();
    }

    #[test]
    fn drain_consumes_a_pending_write() {
        let pair = EventFdPair::new().unwrap();
        pair.kick().write(1).unwrap();
        pair.drain();
        // A second drain finds nothing left to consume.
        pair.drain();
    }

    #[test]
    fn close_marks_pair_closed() {
        let mut pair = EventFdPair::new().unwrap();
        pair.close();
        assert!(pair.is_closed());
        // Closing twice is harmless.
        pair.close();
    }
}
