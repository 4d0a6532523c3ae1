//! The frontend module contains the narrow interfaces this core consumes
//! from its two external collaborators: the virtio front-end device and the
//! hypervisor. Neither is implemented here — §1 of the design places both
//! out of scope, and this core holds only non-owning handles to them.

/// Guest-visible status bit indicating the driver has finished
/// initialization and is ready to drive the device.
pub const VIRTIO_STATUS_DRIVER_OK: u8 = 0x04;

/// One virtqueue's metadata as read from the front-end's queue array.
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    /// Negotiated queue size (power of two).
    pub size: u16,
    /// The available-ring index the front-end last observed; used to
    /// resume a queue exactly where a previous run left off.
    pub last_avail_index: u16,
    /// The used-ring index snapshotted the last time this queue stopped.
    pub saved_used_index: u16,
    /// Host-virtual address of the descriptor table.
    pub desc_table: u64,
    /// Host-virtual address of the available ring.
    pub avail_ring: u64,
    /// Host-virtual address of the used ring.
    pub used_ring: u64,
    /// Guest PIO/MMIO address the driver writes to in order to kick this
    /// queue; this is the address bound into the hypervisor's ioeventfd
    /// fabric, distinct from any of the ring pointers above.
    pub notify_address: u64,
    /// Index into the front-end's MSI-X table this queue signals through.
    pub msix_vector: u16,
}

/// One entry of the front-end's MSI-X table.
#[derive(Debug, Clone, Copy)]
pub struct MsixEntry {
    /// Guest-visible MSI address.
    pub address: u64,
    /// Guest-visible MSI data.
    pub data: u32,
}

/// The slice of the virtio base a device handle needs: feature
/// negotiation results, per-queue metadata, and the guest status byte.
///
/// This core never processes descriptor rings (Non-goals, §1); it reads
/// just enough of the base to drive the lifecycle state machine in §4.G.
pub trait VirtioDeviceBase {
    /// Total number of queues exposed by the base (may be shared across
    /// several [`crate::Device`]s via `start_index`/`queue_count`).
    fn queue_count(&self) -> u16;

    /// Returns queue `index`'s current metadata.
    fn queue(&self, index: u16) -> QueueInfo;

    /// Returns MSI-X table entry `index`.
    fn msix_entry(&self, index: u16) -> MsixEntry;

    /// The guest-written device status byte.
    fn status(&self) -> u8;

    /// True once the guest has enabled MSI-X on this device.
    fn msix_enabled(&self) -> bool;

    /// The feature mask the guest driver has acknowledged.
    fn negotiated_features(&self) -> u64;

    /// Masks off, from the front-end's advertised device capability, any
    /// bits the backend cannot honor.
    fn set_device_capability(&mut self, mask: u64);

    /// Persists queue `index`'s resume point after a stop, so a later
    /// start resumes exactly there (§4.F, §8 round-trip law).
    fn set_last_avail_index(&mut self, index: u16, value: u16);
}

/// One contiguous window of guest-physical memory, as reported by the
/// hypervisor. The low window is conventionally anchored at guest-physical
/// zero; the high window, when present, starts at an architecturally fixed
/// base above it.
#[derive(Debug, Clone)]
pub struct MemoryWindow {
    /// Guest-physical base address of the window.
    pub guest_base: u64,
    /// Length of the window in bytes.
    pub len: u64,
    /// Host-virtual base address the window is mapped at.
    pub host_base: u64,
    /// For the user transport: one memory-fd-backed region per contiguous
    /// mapping within this window. Empty for transports that only need
    /// host-virtual addresses.
    pub fd_regions: Vec<FdRegion>,
}

/// One fd-backed sub-region of a [`MemoryWindow`], used only by the user
/// transport to pass ancillary file descriptors alongside the memory table.
#[derive(Debug, Clone, Copy)]
pub struct FdRegion {
    /// Guest-physical base address of this sub-region.
    pub guest_base: u64,
    /// Length of this sub-region in bytes.
    pub len: u64,
    /// Host-virtual base address, used by callers that also want it.
    pub host_base: u64,
    /// Raw file descriptor of the memfd/file backing this sub-region.
    pub fd: std::os::unix::io::RawFd,
    /// Offset into `fd` at which this sub-region starts.
    pub fd_offset: u64,
}

/// Enumerates the VM's memory windows. An external collaborator (§6):
/// this core never maps or owns guest memory itself.
pub trait MemoryLayout {
    /// Returns every populated memory window, low window first.
    fn windows(&self) -> Vec<MemoryWindow>;
}

/// Binds kick/call eventfds into the hypervisor's ioeventfd/irqfd fabric.
/// An external collaborator (§6); this core only calls through the trait.
pub trait HypervisorLink {
    /// Binds `fd` as an ioeventfd: a guest write of `value` to
    /// `guest_address` signals `fd`.
    fn register_ioeventfd(&mut self, fd: std::os::unix::io::RawFd, guest_address: u64, value: u64) -> std::io::Result<()>;

    /// Binds `fd` as an irqfd: a signal on `fd` delivers an MSI interrupt
    /// with the given address/data to the guest.
    fn register_irqfd(&mut self, fd: std::os::unix::io::RawFd, msi_address: u64, msi_data: u32) -> std::io::Result<()>;

    /// Removes a previously registered ioeventfd binding.
    fn deregister_ioeventfd(&mut self, fd: std::os::unix::io::RawFd, guest_address: u64) -> std::io::Result<()>;

    /// Removes a previously registered irqfd binding.
    fn deregister_irqfd(&mut self, fd: std::os::unix::io::RawFd) -> std::io::Result<()>;
}
