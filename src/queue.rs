//! The virtqueue state machine (component F): the four transitions between
//! `Uninitialized`, `Initialized`, `Running`, and `Stopped`, with the exact
//! ordering and unwind-on-failure rules spec.md §4.F calls for.

use crate::error::{Result, VhostError};
use crate::eventfd::EventFdPair;
use crate::frontend::{HypervisorLink, MsixEntry, QueueInfo};
use crate::transport::{clear_vring_call, clear_vring_kick, VhostCapability, VringAddrConfig};

/// The four lifecycle states a virtqueue passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
}

/// One virtqueue's runtime state: its eventfd pair, current lifecycle
/// state, and the index it is known by to the transport and the front-end.
pub struct Virtqueue {
    index: u16,
    state: QueueState,
    eventfds: Option<EventFdPair>,
}

impl Virtqueue {
    pub fn new(index: u16) -> Virtqueue {
        Virtqueue {
            index,
            state: QueueState::Uninitialized,
            eventfds: None,
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// `Uninitialized -> Initialized`: creates the eventfd pair. Any
    /// failure closes whatever was partially created and leaves the queue
    /// `Uninitialized` (§4.F).
    pub fn init(&mut self) -> Result<()> {
        if self.state != QueueState::Uninitialized {
            return Err(VhostError::state(format!(
                "queue {}: init called from {:?}, expected Uninitialized",
                self.index, self.state
            )));
        }
        let eventfds = EventFdPair::new()?;
        self.eventfds = Some(eventfds);
        self.state = QueueState::Initialized;
        Ok(())
    }

    /// `Initialized -> Running` or `Stopped -> Running`: drains stale
    /// events, registers with the hypervisor, then publishes queue size,
    /// base offset, ring pointers, the call fd, and finally the kick fd, in
    /// that order. A `Stopped` queue still owns its eventfd pair (only
    /// `deinit` takes it), so resuming one re-runs the same sequence and
    /// picks the ring back up at the available index `stop` last read back
    /// (§4.F "a later start resumes exactly there"). Any step's failure
    /// unwinds in strict reverse: undo the kick set (never attempted if an
    /// earlier step failed), then deregister from the hypervisor (§4.F
    /// "Ordering rules").
    pub fn start(
        &mut self,
        transport: &mut dyn VhostCapability,
        hypervisor: &mut dyn HypervisorLink,
        info: &QueueInfo,
        msix: &MsixEntry,
    ) -> Result<()> {
        if self.state != QueueState::Initialized && self.state != QueueState::Stopped {
            return Err(VhostError::state(format!(
                "queue {}: start called from {:?}, expected Initialized or Stopped",
                self.index, self.state
            )));
        }
        let eventfds = self
            .eventfds
            .as_ref()
            .expect("Initialized or Stopped queue always has an eventfd pair");
        eventfds.drain();

        use std::os::unix::io::AsRawFd;
        let kick_fd = eventfds.kick().as_raw_fd();
        let call_fd = eventfds.call().as_raw_fd();

        hypervisor
            .register_ioeventfd(kick_fd, info.notify_address, 0)
            .map_err(|e| VhostError::io("register_ioeventfd", e))?;
        if let Err(e) = hypervisor.register_irqfd(call_fd, msix.address, msix.data) {
            log::warn!("queue {}: irqfd registration failed, unwinding ioeventfd", self.index);
            let _ = hypervisor.deregister_ioeventfd(kick_fd, info.notify_address);
            return Err(VhostError::io("register_irqfd", e));
        }

        if let Err(e) = self.publish_ring(transport, info, kick_fd, call_fd) {
            log::warn!(
                "queue {}: ring publication failed, unwinding hypervisor bindings",
                self.index
            );
            let _ = hypervisor.deregister_irqfd(call_fd);
            let _ = hypervisor.deregister_ioeventfd(kick_fd, info.notify_address);
            return Err(e);
        }

        self.state = QueueState::Running;
        Ok(())
    }

    fn publish_ring(
        &self,
        transport: &mut dyn VhostCapability,
        info: &QueueInfo,
        kick_fd: i32,
        call_fd: i32,
    ) -> Result<()> {
        transport.set_vring_num(self.index, info.size)?;
        transport.set_vring_base(self.index, info.last_avail_index)?;
        let addr = VringAddrConfig {
            index: self.index,
            size: info.size,
            base: info.last_avail_index,
            desc_table: info.desc_table,
            avail_ring: info.avail_ring,
            used_ring: info.used_ring,
        };
        transport.set_vring_addr(&addr)?;
        // Call fd before kick fd: the backend must be able to signal the
        // guest the instant it starts consuming (§4.F).
        if let Err(e) = transport.set_vring_call(self.index, call_fd) {
            return Err(e);
        }
        if let Err(e) = transport.set_vring_kick(self.index, kick_fd) {
            let _ = clear_vring_call(transport, self.index);
            return Err(e);
        }
        Ok(())
    }

    /// `Running -> Stopped`: detaches kick first to silence guest→backend
    /// traffic, then call; reads back the backend's last-seen available
    /// index before deregistering the hypervisor bindings, so an in-flight
    /// notification is not lost (§4.F "Ordering rules").
    pub fn stop(
        &mut self,
        transport: &mut dyn VhostCapability,
        hypervisor: &mut dyn HypervisorLink,
        info: &mut QueueInfo,
        notify_address: u64,
    ) -> Result<()> {
        if self.state != QueueState::Running {
            return Err(VhostError::state(format!(
                "queue {}: stop called from {:?}, expected Running",
                self.index, self.state
            )));
        }
        let eventfds = self
            .eventfds
            .as_ref()
            .expect("Running queue always has an eventfd pair");
        use std::os::unix::io::AsRawFd;
        let kick_fd = eventfds.kick().as_raw_fd();
        let call_fd = eventfds.call().as_raw_fd();

        clear_vring_kick(transport, self.index)?;
        clear_vring_call(transport, self.index)?;

        let last_avail = transport.get_vring_base(self.index)?;
        info.last_avail_index = last_avail;
        info.saved_used_index = last_avail;

        if let Err(e) = hypervisor.deregister_irqfd(call_fd) {
            log::warn!("queue {}: irqfd deregistration failed: {e}", self.index);
        }
        if let Err(e) = hypervisor.deregister_ioeventfd(kick_fd, notify_address) {
            log::warn!("queue {}: ioeventfd deregistration failed: {e}", self.index);
        }

        self.state = QueueState::Stopped;
        Ok(())
    }

    /// `Any -> Uninitialized`: closes both eventfds.
    pub fn deinit(&mut self) {
        if let Some(mut eventfds) = self.eventfds.take() {
            eventfds.close();
        }
        self.state = QueueState::Uninitialized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::QueueInfo;
    use std::os::unix::io::RawFd;

    struct NullHypervisor {
        fail_irqfd: bool,
    }

    impl HypervisorLink for NullHypervisor {
        fn register_ioeventfd(&mut self, _fd: RawFd, _addr: u64, _value: u64) -> std::io::Result<()> {
            Ok(())
        }
        fn register_irqfd(&mut self, _fd: RawFd, _addr: u64, _data: u32) -> std::io::Result<()> {
            if self.fail_irqfd {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "no irqfd"))
            } else {
                Ok(())
            }
        }
        fn deregister_ioeventfd(&mut self, _fd: RawFd, _addr: u64) -> std::io::Result<()> {
            Ok(())
        }
        fn deregister_irqfd(&mut self, _fd: RawFd) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FakeCapability {
        kick_fd: Option<RawFd>,
        call_fd: Option<RawFd>,
        fail_kick: bool,
        last_vring_base: Option<u16>,
    }

    impl FakeCapability {
        fn new() -> Self {
            FakeCapability {
                kick_fd: None,
                call_fd: None,
                fail_kick: false,
                last_vring_base: None,
            }
        }
    }

    impl VhostCapability for FakeCapability {
        fn init(&mut self, _start_index: u16) -> Result<()> {
            Ok(())
        }
        fn deinit(&mut self) -> Result<()> {
            Ok(())
        }
        fn get_features(&mut self) -> Result<u64> {
            Ok(0)
        }
        fn set_features(&mut self, _features: u64) -> Result<()> {
            Ok(())
        }
        fn set_owner(&mut self) -> Result<()> {
            Ok(())
        }
        fn reset_owner(&mut self) -> Result<()> {
            Ok(())
        }
        fn set_mem_table(&mut self, _regions: &[crate::memory::GuestRegion]) -> Result<()> {
            Ok(())
        }
        fn set_vring_num(&mut self, _index: u16, _num: u16) -> Result<()> {
            Ok(())
        }
        fn set_vring_base(&mut self, _index: u16, base: u16) -> Result<()> {
            self.last_vring_base = Some(base);
            Ok(())
        }
        fn get_vring_base(&mut self, _index: u16) -> Result<u16> {
            Ok(7)
        }
        fn set_vring_addr(&mut self, _config: &VringAddrConfig) -> Result<()> {
            Ok(())
        }
        fn set_vring_kick(&mut self, _index: u16, fd: RawFd) -> Result<()> {
            if self.fail_kick {
                return Err(VhostError::state("kick rejected".to_string()));
            }
            self.kick_fd = Some(fd);
            Ok(())
        }
        fn set_vring_call(&mut self, _index: u16, fd: RawFd) -> Result<()> {
            self.call_fd = Some(fd);
            Ok(())
        }
        fn set_busyloop_timeout(&mut self, _index: u16, _timeout_us: u32) -> Result<()> {
            Ok(())
        }
        fn supports_busyloop_timeout(&self) -> bool {
            false
        }
        fn supports_device_reset(&self) -> bool {
            false
        }
        fn reset_device(&mut self) -> Result<()> {
            Err(VhostError::CapabilityUnavailable { op: "reset_device" })
        }
    }

    fn sample_info() -> QueueInfo {
        QueueInfo {
            size: 256,
            last_avail_index: 0,
            saved_used_index: 0,
            desc_table: 0x1000,
            avail_ring: 0x2000,
            used_ring: 0x3000,
            notify_address: 0x10,
            msix_vector: 0,
        }
    }

    #[test]
    fn full_lifecycle_reaches_stopped_and_resets_to_uninitialized() {
        let mut queue = Virtqueue::new(0);
        let mut transport = FakeCapability::new();
        let mut hypervisor = NullHypervisor { fail_irqfd: false };
        let mut info = sample_info();
        let msix = MsixEntry { address: 0xfee0_0000, data: 0 };

        queue.init().unwrap();
        assert_eq!(queue.state(), QueueState::Initialized);

        queue.start(&mut transport, &mut hypervisor, &info, &msix).unwrap();
        assert_eq!(queue.state(), QueueState::Running);
        assert!(transport.call_fd.is_some());
        assert!(transport.kick_fd.is_some());

        queue.stop(&mut transport, &mut hypervisor, &mut info, 0x10).unwrap();
        assert_eq!(queue.state(), QueueState::Stopped);
        assert_eq!(info.last_avail_index, 7);

        queue.deinit();
        assert_eq!(queue.state(), QueueState::Uninitialized);
    }

    #[test]
    fn start_resumes_a_stopped_queue_at_its_saved_avail_index() {
        let mut queue = Virtqueue::new(0);
        let mut transport = FakeCapability::new();
        let mut hypervisor = NullHypervisor { fail_irqfd: false };
        let mut info = sample_info();
        let msix = MsixEntry { address: 0xfee0_0000, data: 0 };

        queue.init().unwrap();
        queue.start(&mut transport, &mut hypervisor, &info, &msix).unwrap();
        let notify_address = info.notify_address;
        queue.stop(&mut transport, &mut hypervisor, &mut info, notify_address).unwrap();
        assert_eq!(queue.state(), QueueState::Stopped);
        info.last_avail_index = 7;

        queue.start(&mut transport, &mut hypervisor, &info, &msix).unwrap();
        assert_eq!(queue.state(), QueueState::Running);
        assert_eq!(transport.last_vring_base, Some(7));
    }

    #[test]
    fn irqfd_failure_unwinds_ioeventfd_and_stays_initialized() {
        let mut queue = Virtqueue::new(0);
        let mut transport = FakeCapability::new();
        let mut hypervisor = NullHypervisor { fail_irqfd: true };
        let info = sample_info();
        let msix = MsixEntry { address: 0, data: 0 };

        queue.init().unwrap();
        let result = queue.start(&mut transport, &mut hypervisor, &info, &msix);
        assert!(result.is_err());
        assert_eq!(queue.state(), QueueState::Initialized);
    }

    #[test]
    fn kick_failure_clears_call_and_leaves_queue_initialized() {
        let mut queue = Virtqueue::new(0);
        let mut transport = FakeCapability::new();
        transport.fail_kick = true;
        let mut hypervisor = NullHypervisor { fail_irqfd: false };
        let info = sample_info();
        let msix = MsixEntry { address: 0, data: 0 };

        queue.init().unwrap();
        let result = queue.start(&mut transport, &mut hypervisor, &info, &msix);
        assert!(result.is_err());
        assert_eq!(queue.state(), QueueState::Initialized);
    }

    #[test]
    fn start_from_wrong_state_is_rejected() {
        let mut queue = Virtqueue::new(0);
        let mut transport = FakeCapability::new();
        let mut hypervisor = NullHypervisor { fail_irqfd: false };
        let info = sample_info();
        let msix = MsixEntry { address: 0, data: 0 };

        let result = queue.start(&mut transport, &mut hypervisor, &info, &msix);
        match result {
            Err(VhostError::StateViolation { .. }) => {}
            other => panic!("expected StateViolation, got {other:?}"),
        }
    }
}
