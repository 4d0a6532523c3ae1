//! The device lifecycle (component G): turns a front-end's virtio base plus
//! a chosen transport into a set of virtqueues that can be started,
//! stopped, and torn down, ordering every step per spec.md §4.G.

use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use crate::error::{Result, VhostError};
use crate::frontend::{HypervisorLink, MemoryLayout, VirtioDeviceBase, VIRTIO_STATUS_DRIVER_OK};
use crate::memory::MemoryTableBuilder;
use crate::queue::Virtqueue;
use crate::transport::{FeatureSet, KernelTransport, Transport, UserTransport, VhostCapability};

/// Which wire transport a device is backed by, and the parameters needed
/// to construct it. The kernel variant's reset/busyloop support must be
/// supplied by the caller since there is no ioctl to discover either.
pub enum TransportConfig {
    Kernel {
        fd: RawFd,
        supports_device_reset: bool,
        supports_busyloop_timeout: bool,
    },
    User {
        stream: UnixStream,
    },
}

/// A device handle: one front-end base, one backend transport, and the
/// virtqueues between `start_index` and `start_index + queue_count`
/// (spec.md §3, §4.G).
pub struct Device {
    base: Box<dyn VirtioDeviceBase>,
    transport: Transport,
    hypervisor: Box<dyn HypervisorLink>,
    memory: Box<dyn MemoryLayout>,
    start_index: u16,
    queues: Vec<Virtqueue>,
    desired_features: u64,
    extension_features: u64,
    busyloop_us: Option<u32>,
    running: bool,
    /// Set once any transport call returns [`VhostError::ProtocolViolation`]
    /// (§7 "the device is considered unusable"). A poisoned device refuses
    /// every further `start`.
    poisoned: bool,
}

impl Device {
    /// Performs the `§4.G` "On init" sequence: validates the queue window,
    /// constructs and initializes the chosen transport, queries the
    /// backend's feature mask, initializes each virtqueue, and masks the
    /// front-end's advertised device capability down to what the backend
    /// can honor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        base: Box<dyn VirtioDeviceBase>,
        transport_config: TransportConfig,
        start_index: u16,
        queue_count: u16,
        desired_features: u64,
        extension_features: u64,
        busyloop_us: Option<u32>,
        hypervisor: Box<dyn HypervisorLink>,
        memory: Box<dyn MemoryLayout>,
    ) -> Result<Device> {
        let end = start_index
            .checked_add(queue_count)
            .ok_or_else(|| VhostError::state("start_index + queue_count overflows u16".to_string()))?;
        if end > base.queue_count() {
            return Err(VhostError::state(format!(
                "queue window [{start_index}, {end}) exceeds base queue count {}",
                base.queue_count()
            )));
        }

        let mut transport = match transport_config {
            TransportConfig::Kernel {
                fd,
                supports_device_reset,
                supports_busyloop_timeout,
            } => Transport::Kernel(KernelTransport::new(fd, supports_device_reset, supports_busyloop_timeout)),
            TransportConfig::User { stream } => Transport::User(UserTransport::new(stream)),
        };
        transport.as_capability().init(start_index)?;

        let backend_features = transport.as_capability().get_features()?;
        let effective = FeatureSet::effective(backend_features, desired_features, extension_features);
        let mut base = base;
        base.set_device_capability(effective.0);

        let mut queues: Vec<Virtqueue> = Vec::with_capacity(queue_count as usize);
        for i in 0..queue_count {
            let mut queue = Virtqueue::new(start_index + i);
            if let Err(e) = queue.init() {
                log::warn!("device init: queue {} init failed, unwinding earlier queues", queue.index());
                for mut initialized in queues {
                    initialized.deinit();
                }
                let _ = transport.as_capability().deinit();
                return Err(e);
            }
            queues.push(queue);
        }

        Ok(Device {
            base,
            transport,
            hypervisor,
            memory,
            start_index,
            queues,
            desired_features,
            extension_features,
            busyloop_us,
            running: false,
            poisoned: false,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Records whether `result` failed with a protocol violation, poisoning
    /// the device (§7, §8 scenario 5), and passes the result through
    /// unchanged.
    fn note_result<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(VhostError::ProtocolViolation { .. }) = &result {
            self.poisoned = true;
        }
        result
    }

    /// `§4.G` "On start": requires driver-ok and MSI-X, calls `set-owner`,
    /// negotiates and applies the feature mask, publishes the memory
    /// table, applies the busy-loop timeout where supported, then starts
    /// each queue in order. A failed queue start unwinds every
    /// already-started queue in reverse. Calling `start` on an
    /// already-running device is a no-op. A device poisoned by an earlier
    /// protocol violation refuses to start at all (§7, §8 scenario 5).
    pub fn start(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(VhostError::CapabilityUnavailable { op: "start" });
        }
        if self.running {
            return Ok(());
        }
        if self.base.status() & VIRTIO_STATUS_DRIVER_OK == 0 {
            return Err(VhostError::state("driver has not signalled DRIVER_OK".to_string()));
        }
        if !self.base.msix_enabled() {
            return Err(VhostError::state("MSI-X is not enabled on the front-end".to_string()));
        }

        let result = self.transport.as_capability().set_owner();
        self.note_result(result)?;

        let negotiated = FeatureSet::effective(
            self.base.negotiated_features(),
            self.desired_features,
            self.extension_features,
        );
        let result = self.transport.as_capability().set_features(negotiated.0);
        self.note_result(result)?;

        let windows = self.memory.windows();
        let regions = MemoryTableBuilder::build(&windows);
        let result = self.transport.as_capability().set_mem_table(&regions);
        self.note_result(result)?;

        if let Some(timeout) = self.busyloop_us {
            if self.transport.as_capability().supports_busyloop_timeout() {
                for i in 0..self.queues.len() {
                    let index = self.queues[i].index();
                    let result = self.transport.as_capability().set_busyloop_timeout(index, timeout);
                    self.note_result(result)?;
                }
            }
        }

        for started in 0..self.queues.len() {
            let index = self.queues[started].index();
            let info = self.base.queue(index);
            let msix = self.base.msix_entry(info.msix_vector);
            let transport = self.transport.as_capability();
            let result = self.queues[started].start(transport, self.hypervisor.as_mut(), &info, &msix);
            if let Err(e) = self.note_result(result) {
                log::warn!("device start: queue {index} failed to start, unwinding");
                for unwind in (0..started).rev() {
                    let unwind_index = self.queues[unwind].index();
                    let mut info = self.base.queue(unwind_index);
                    let notify_address = info.notify_address;
                    let transport = self.transport.as_capability();
                    let stop_result = self.queues[unwind].stop(
                        transport,
                        self.hypervisor.as_mut(),
                        &mut info,
                        notify_address,
                    );
                    if let Err(stop_err) = self.note_result(stop_result) {
                        log::warn!("device start: unwind stop of queue {unwind_index} failed: {stop_err}");
                    }
                    self.base.set_last_avail_index(unwind_index, info.last_avail_index);
                }
                return Err(e);
            }
        }

        self.running = true;
        Ok(())
    }

    /// `§4.G` "On stop": stops every queue unconditionally in forward
    /// order — one queue's failure does not prevent stopping the rest —
    /// then resets the backend: a device-reset request where the transport
    /// supports one, otherwise the legacy reset-owner request (§4.E "two
    /// reset paths").
    pub fn stop(&mut self) -> Result<()> {
        let mut first_error = None;
        for i in 0..self.queues.len() {
            let index = self.queues[i].index();
            if self.queues[i].state() != crate::queue::QueueState::Running {
                continue;
            }
            let mut info = self.base.queue(index);
            let notify_address = info.notify_address;
            let transport = self.transport.as_capability();
            let result = self.queues[i].stop(transport, self.hypervisor.as_mut(), &mut info, notify_address);
            match self.note_result(result) {
                Ok(()) => self.base.set_last_avail_index(index, info.last_avail_index),
                Err(e) => {
                    log::error!("device stop: queue {index} failed to stop: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let transport = self.transport.as_capability();
        let reset_result = if transport.supports_device_reset() {
            transport.reset_device()
        } else {
            transport.reset_owner()
        };
        if let Err(e) = self.note_result(reset_result) {
            log::warn!("device stop: backend reset failed: {e}");
        }

        self.running = false;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// `§4.G` "On deinit": deinitializes every queue, then the transport.
    pub fn deinit(mut self) -> Result<()> {
        for queue in &mut self.queues {
            queue.deinit();
        }
        self.transport.as_capability().deinit()
    }

    pub fn start_index(&self) -> u16 {
        self.start_index
    }
}
