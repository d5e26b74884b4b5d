//! # gpucs - Userspace GPU Command Submission
//!
//! The command-submission core of a userspace driver for tile-based mobile
//! GPUs (Adreno class), talking to the kernel through a narrow driver
//! boundary.
//!
//! ## Features
//!
//! - **Buffer objects** with a power-of-two slab cache and purgeable idle
//!   memory
//! - **Chunked command streams** of 32-bit packet words spread over
//!   GPU-visible memory
//! - **Command buffers** with a recording state machine, latched errors and
//!   pooled lifetimes
//! - **Submission queues** with sync-object fences, sync-file export and a
//!   sticky device-lost state
//! - **Two kernel backends**: the msm DRM driver, and an in-process null
//!   driver for tests and bring-up
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use gpucs::prelude::*;
//!
//! fn main() -> gpucs::Result<()> {
//!     let device = Device::new(Arc::new(NullKgd::new()), DeviceConfig::default())?;
//!     let mut pool = device.create_command_pool()?;
//!     let handle = pool.allocate(Level::Primary, 1)?[0];
//!
//!     let cb = pool.get_mut(handle)?;
//!     cb.begin(UsageFlags::ONE_TIME_SUBMIT)?;
//!     cb.draw(3, 1, 0, 0);
//!     cb.end()?;
//!
//!     let mut queue = device.create_queue()?;
//!     queue.submit(&mut pool.get_many_mut(&[handle])?, &[], None)?;
//!     queue.wait_idle()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod alloc;
pub mod bo;
pub mod cmd;
pub mod config;
pub mod cs;
pub mod device;
pub mod error;
pub mod kgd;
pub mod queue;
pub mod residency;
pub mod sync;

// Re-export main API for easy access
pub use alloc::{AllocationScope, BudgetAllocator, HostAllocator, Reservation};
pub use bo::{Bo, BoAllocator, BoFlags, BoRef, CachePolicy};
pub use cmd::{
    BarrierFlags, BindPoint, CommandBuffer, CommandBufferHandle, CommandPool, Level, PoolResetFlags, Status,
    UsageFlags,
};
pub use config::DeviceConfig;
pub use cs::{CommandStream, CsEntry};
pub use device::{Device, DeviceInfo};
pub use error::{Error, Result};
pub use kgd::{Kgd, NullKgd, Requirements};
pub use queue::Queue;
pub use residency::{AccessFlags, ResidencyList};
pub use sync::{reset_fences, wait_fences, SyncObject};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Render nodes that may be driven by the msm kernel driver
///
/// # Example
///
/// ```no_run
/// for node in gpucs::scan_devices() {
///     println!("Found render node: {}", node);
/// }
/// ```
pub fn scan_devices() -> Vec<String> {
    #[cfg(all(feature = "msm", any(target_os = "linux", target_os = "android")))]
    {
        kgd::msm::find_render_nodes()
    }
    #[cfg(not(all(feature = "msm", any(target_os = "linux", target_os = "android"))))]
    {
        Vec::new()
    }
}

/// Open the first usable msm render node
///
/// # Example
///
/// ```no_run
/// let device = gpucs::open_default(gpucs::DeviceConfig::default())?;
/// println!("{}", device.info().name());
/// # Ok::<(), gpucs::Error>(())
/// ```
#[cfg(all(feature = "msm", any(target_os = "linux", target_os = "android")))]
pub fn open_default(config: DeviceConfig) -> Result<Device> {
    let kgd = kgd::msm::open_first()?;
    Device::new(std::sync::Arc::new(kgd), config)
}

/// Get library information
///
/// # Example
///
/// ```no_run
/// println!("Using gpucs v{}", gpucs::version());
/// ```
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(version(), VERSION);
    }

    #[test]
    fn test_scan_devices() {
        // Depends on the host; only check that every entry is a render node
        for node in scan_devices() {
            assert!(node.contains("renderD"));
        }
    }
}

/// Prelude module for convenient imports
///
/// # Example
///
/// ```no_run
/// use gpucs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cmd::{BarrierFlags, CommandBuffer, CommandPool, Level, Status, UsageFlags};
    pub use crate::config::DeviceConfig;
    pub use crate::device::Device;
    pub use crate::error::{Error, Result};
    pub use crate::kgd::NullKgd;
    pub use crate::queue::Queue;
    pub use crate::residency::AccessFlags;
    pub use crate::sync::{wait_fences, SyncObject};
    pub use crate::{bo::BoFlags, version};
}
