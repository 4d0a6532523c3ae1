//! The kernel transport implements the vhost capability set by issuing
//! ioctls on a vhost character device (component D). Struct layouts and
//! ioctl numbers match the stable Linux vhost ABI
//! (`include/uapi/linux/vhost.h`) bit-for-bit, built with the same
//! `vmm_sys_util::ioctl_*` macros the rust-vmm `vhost` crate uses for this
//! surface.

use std::os::unix::io::RawFd;

use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref};
use vmm_sys_util::{ioctl_ioc_nr, ioctl_io_nr, ioctl_ior_nr, ioctl_iow_nr, ioctl_iowr_nr};

use crate::error::{Result, VhostError};
use crate::memory::GuestRegion;

use super::{VhostCapability, VringAddrConfig};

const VHOST_VIRTIO: u32 = 0xAF;

ioctl_ior_nr!(VHOST_GET_FEATURES, VHOST_VIRTIO, 0x00, u64);
ioctl_iow_nr!(VHOST_SET_FEATURES, VHOST_VIRTIO, 0x00, u64);
ioctl_io_nr!(VHOST_SET_OWNER, VHOST_VIRTIO, 0x01);
ioctl_io_nr!(VHOST_RESET_OWNER, VHOST_VIRTIO, 0x02);
ioctl_iow_nr!(VHOST_SET_MEM_TABLE, VHOST_VIRTIO, 0x03, VhostMemory);
ioctl_iow_nr!(VHOST_SET_VRING_NUM, VHOST_VIRTIO, 0x10, VhostVringState);
ioctl_iow_nr!(VHOST_SET_VRING_ADDR, VHOST_VIRTIO, 0x11, VhostVringAddr);
ioctl_iow_nr!(VHOST_SET_VRING_BASE, VHOST_VIRTIO, 0x12, VhostVringState);
ioctl_iowr_nr!(VHOST_GET_VRING_BASE, VHOST_VIRTIO, 0x12, VhostVringState);
ioctl_iow_nr!(VHOST_SET_VRING_KICK, VHOST_VIRTIO, 0x20, VhostVringFile);
ioctl_iow_nr!(VHOST_SET_VRING_CALL, VHOST_VIRTIO, 0x21, VhostVringFile);
ioctl_iow_nr!(
    VHOST_SET_VRING_BUSYLOOP_TIMEOUT,
    VHOST_VIRTIO,
    0x23,
    VhostVringState
);
ioctl_io_nr!(VHOST_RESET_DEVICE, VHOST_VIRTIO, 0x25);

#[repr(C)]
#[derive(Default)]
struct VhostVringState {
    index: u32,
    num: u32,
}

#[repr(C)]
struct VhostVringFile {
    index: u32,
    fd: i32,
}

#[repr(C)]
#[derive(Default)]
struct VhostVringAddr {
    index: u32,
    flags: u32,
    desc_user_addr: u64,
    used_user_addr: u64,
    avail_user_addr: u64,
    log_guest_addr: u64,
}

#[repr(C)]
struct VhostMemoryRegion {
    guest_phys_addr: u64,
    memory_size: u64,
    userspace_addr: u64,
    flags_padding: u64,
}

#[repr(C)]
struct VhostMemory {
    nregions: u32,
    padding: u32,
    // Followed by `nregions` `VhostMemoryRegion`s; the ioctl macros only
    // need a type to form the numeric request code, so the trailing
    // flexible-array member is never materialized as a Rust field.
}

/// A vhost character device backend, reached entirely through ioctls.
/// Stateless beyond the fd and the recorded queue start index — no
/// queued messages, no reply machinery (§4.D).
pub struct KernelTransport {
    fd: RawFd,
    start_index: u16,
    reset_owner_supports_device_reset: bool,
    busyloop_supported: bool,
}

impl KernelTransport {
    /// Wraps an already-open vhost character device fd. `supports_device_reset`
    /// and `supports_busyloop_timeout` reflect what the caller knows about the
    /// backend's ioctl surface, since there is no feature-discovery ioctl for
    /// either (§4.D, §8 scenario 6).
    pub fn new(fd: RawFd, supports_device_reset: bool, supports_busyloop_timeout: bool) -> Self {
        KernelTransport {
            fd,
            start_index: 0,
            reset_owner_supports_device_reset: supports_device_reset,
            busyloop_supported: supports_busyloop_timeout,
        }
    }

    fn check(&self, op: &'static str, ret: i32) -> Result<()> {
        if ret == 0 {
            Ok(())
        } else {
            Err(VhostError::io(op, std::io::Error::last_os_error()))
        }
    }
}

impl VhostCapability for KernelTransport {
    fn init(&mut self, start_index: u16) -> Result<()> {
        self.start_index = start_index;
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        // SAFETY: `self.fd` is a valid, owned vhost character device fd for
        // the lifetime of this transport.
        let ret = unsafe { libc::close(self.fd) };
        self.check("deinit", ret)
    }

    fn get_features(&mut self) -> Result<u64> {
        let mut features: u64 = 0;
        // SAFETY: `VHOST_GET_FEATURES` expects a `*mut u64` out-parameter
        // and `self.fd` is a valid vhost device fd.
        let ret = unsafe { ioctl_with_mut_ref(self, VHOST_GET_FEATURES(), &mut features) };
        self.check("get_features", ret)?;
        Ok(features)
    }

    fn set_features(&mut self, features: u64) -> Result<()> {
        // SAFETY: see `get_features`.
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_FEATURES(), &features) };
        self.check("set_features", ret)
    }

    fn set_owner(&mut self) -> Result<()> {
        // SAFETY: `VHOST_SET_OWNER` takes no argument.
        let ret = unsafe { vmm_sys_util::ioctl::ioctl(self, VHOST_SET_OWNER()) };
        self.check("set_owner", ret)
    }

    fn reset_owner(&mut self) -> Result<()> {
        // SAFETY: `VHOST_RESET_OWNER` takes no argument; this is the
        // legacy reset ioctl used when the backend lacks device reset.
        let ret = unsafe { vmm_sys_util::ioctl::ioctl(self, VHOST_RESET_OWNER()) };
        self.check("reset_owner", ret)
    }

    fn set_mem_table(&mut self, regions: &[GuestRegion]) -> Result<()> {
        let header_size = std::mem::size_of::<VhostMemory>();
        let region_size = std::mem::size_of::<VhostMemoryRegion>();
        let mut buf = vec![0u8; header_size + region_size * regions.len()];

        // SAFETY: `buf` is sized to hold exactly one `VhostMemory` header.
        let header = unsafe { &mut *(buf.as_mut_ptr() as *mut VhostMemory) };
        header.nregions = regions.len() as u32;
        header.padding = 0;

        for (i, region) in regions.iter().enumerate() {
            let offset = header_size + i * region_size;
            // SAFETY: `offset` stays within `buf`, which was sized above
            // to hold `regions.len()` entries at that stride.
            let entry = unsafe { &mut *(buf.as_mut_ptr().add(offset) as *mut VhostMemoryRegion) };
            entry.guest_phys_addr = region.guest_phys_addr;
            entry.memory_size = region.len;
            entry.userspace_addr = region.host_virt_addr;
            entry.flags_padding = 0;
        }

        // SAFETY: `buf` holds a `VhostMemory` header followed by exactly
        // `nregions` `VhostMemoryRegion`s, matching the ABI the ioctl expects.
        let ret = unsafe { ioctl_with_ptr(self, VHOST_SET_MEM_TABLE(), buf.as_ptr()) };
        self.check("set_mem_table", ret)
    }

    fn set_vring_num(&mut self, index: u16, num: u16) -> Result<()> {
        let state = VhostVringState {
            index: index as u32,
            num: num as u32,
        };
        // SAFETY: see `get_features`.
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_NUM(), &state) };
        self.check("set_vring_num", ret)
    }

    fn set_vring_base(&mut self, index: u16, base: u16) -> Result<()> {
        let state = VhostVringState {
            index: index as u32,
            num: base as u32,
        };
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_BASE(), &state) };
        self.check("set_vring_base", ret)
    }

    fn get_vring_base(&mut self, index: u16) -> Result<u16> {
        let mut state = VhostVringState {
            index: index as u32,
            num: 0,
        };
        let ret = unsafe { ioctl_with_mut_ref(self, VHOST_GET_VRING_BASE(), &mut state) };
        self.check("get_vring_base", ret)?;
        Ok(state.num as u16)
    }

    fn set_vring_addr(&mut self, config: &VringAddrConfig) -> Result<()> {
        let addr = VhostVringAddr {
            index: config.index as u32,
            flags: 0,
            desc_user_addr: config.desc_table,
            used_user_addr: config.used_ring,
            avail_user_addr: config.avail_ring,
            log_guest_addr: 0,
        };
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_ADDR(), &addr) };
        self.check("set_vring_addr", ret)
    }

    fn set_vring_kick(&mut self, index: u16, fd: RawFd) -> Result<()> {
        let file = VhostVringFile {
            index: index as u32,
            fd,
        };
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_KICK(), &file) };
        self.check("set_vring_kick", ret)
    }

    fn set_vring_call(&mut self, index: u16, fd: RawFd) -> Result<()> {
        let file = VhostVringFile {
            index: index as u32,
            fd,
        };
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_CALL(), &file) };
        self.check("set_vring_call", ret)
    }

    fn set_busyloop_timeout(&mut self, index: u16, timeout_us: u32) -> Result<()> {
        if !self.busyloop_supported {
            return Err(VhostError::CapabilityUnavailable {
                op: "set_busyloop_timeout",
            });
        }
        let state = VhostVringState {
            index: index as u32,
            num: timeout_us,
        };
        let ret = unsafe { ioctl_with_ref(self, VHOST_SET_VRING_BUSYLOOP_TIMEOUT(), &state) };
        self.check("set_busyloop_timeout", ret)
    }

    fn supports_busyloop_timeout(&self) -> bool {
        self.busyloop_supported
    }

    fn supports_device_reset(&self) -> bool {
        self.reset_owner_supports_device_reset
    }

    fn reset_device(&mut self) -> Result<()> {
        if !self.reset_owner_supports_device_reset {
            return Err(VhostError::CapabilityUnavailable {
                op: "reset_device",
            });
        }
        let ret = unsafe { vmm_sys_util::ioctl::ioctl(self, VHOST_RESET_DEVICE()) };
        self.check("reset_device", ret)
    }
}

impl std::os::unix::io::AsRawFd for KernelTransport {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_mem_table_buffer_lays_out_header_then_regions() {
        let regions = vec![
            GuestRegion {
                guest_phys_addr: 0,
                len: 0x1000,
                host_virt_addr: 0x7f00_0000_0000,
                fd_backing: None,
            },
            GuestRegion {
                guest_phys_addr: 0x1000,
                len: 0x2000,
                host_virt_addr: 0x7f00_0000_1000,
                fd_backing: None,
            },
        ];

        let header_size = std::mem::size_of::<VhostMemory>();
        let region_size = std::mem::size_of::<VhostMemoryRegion>();
        let mut buf = vec![0u8; header_size + region_size * regions.len()];
        let header = unsafe { &mut *(buf.as_mut_ptr() as *mut VhostMemory) };
        header.nregions = regions.len() as u32;
        for (i, region) in regions.iter().enumerate() {
            let offset = header_size + i * region_size;
            let entry = unsafe { &mut *(buf.as_mut_ptr().add(offset) as *mut VhostMemoryRegion) };
            entry.guest_phys_addr = region.guest_phys_addr;
            entry.memory_size = region.len;
            entry.userspace_addr = region.host_virt_addr;
        }

        let header = unsafe { &*(buf.as_ptr() as *const VhostMemory) };
        assert_eq!(header.nregions, 2);
        let first = unsafe { &*(buf.as_ptr().add(header_size) as *const VhostMemoryRegion) };
        assert_eq!(first.memory_size, 0x1000);
        let second =
            unsafe { &*(buf.as_ptr().add(header_size + region_size) as *const VhostMemoryRegion) };
        assert_eq!(second.guest_phys_addr, 0x1000);
        assert_eq!(second.memory_size, 0x2000);
    }

    #[test]
    fn reset_device_unsupported_is_capability_unavailable() {
        let mut t = KernelTransport::new(-1, false, false);
        match t.reset_device() {
            Err(VhostError::CapabilityUnavailable { op }) => assert_eq!(op, "reset_device"),
            other => panic!("expected CapabilityUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn busyloop_timeout_unsupported_is_capability_unavailable() {
        let mut t = KernelTransport::new(-1, false, false);
        match t.set_busyloop_timeout(0, 100) {
            Err(VhostError::CapabilityUnavailable { op }) => {
                assert_eq!(op, "set_busyloop_timeout")
            }
            other => panic!("expected CapabilityUnavailable, got {other:?}"),
        }
    }
}
