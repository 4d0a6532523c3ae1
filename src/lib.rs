//! Vhost offload device-model core: virtqueue lifecycle, kernel and user
//! transports, and memory table publishing for a virtio front-end that
//! hands descriptor-ring processing off to an out-of-process or in-kernel
//! backend.
//!
//! This crate owns no descriptor rings and no CLI; it is a library
//! consumed by a front-end device implementation and a hypervisor
//! integration, both represented here only as the traits in [`frontend`].

pub mod device;
pub mod error;
pub mod eventfd;
pub mod frontend;
pub mod memory;
pub mod queue;
pub mod transport;

pub use device::{Device, TransportConfig};
pub use error::{Result, VhostError};
pub use queue::{QueueState, Virtqueue};
pub use transport::{FeatureSet, Transport, VhostCapability, VringAddrConfig};
