//! Device handle tying the kernel driver, BO allocator and host allocator
//! together

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};
use serde::Serialize;

use crate::alloc::{BudgetAllocator, HostAllocator};
use crate::bo::{BoAllocator, BoFlags, BoRef};
use crate::cmd::CommandPool;
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::kgd::{Kgd, Param, Requirements};
use crate::queue::Queue;
use crate::sync::SyncObject;

/// Sticky device-lost flag shared by everything that talks to the kernel
#[derive(Debug, Default)]
pub(crate) struct LostState {
    lost: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl LostState {
    /// `Err(DeviceLost)` once the device has been lost
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_lost() {
            return Err(Error::DeviceLost(self.reason().unwrap_or_default()));
        }
        Ok(())
    }

    /// Mark the device lost; the first reason is kept
    pub(crate) fn set(&self, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            error!("device lost: {reason}");
            *slot = Some(reason);
        }
        self.lost.store(true, Ordering::Release);
        Error::DeviceLost(slot.clone().unwrap_or_default())
    }

    /// Mark the device lost because kernel call `op` failed
    pub(crate) fn kernel(&self, op: &str, err: io::Error) -> Error {
        self.set(format!("{op}: {err}"))
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Device constants read at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Kernel driver backend
    pub driver: String,
    /// Packed GPU id, e.g. 630
    pub gpu_id: u32,
    /// Tile memory size in bytes
    pub gmem_size: u64,
    /// GPU address of tile memory
    pub gmem_base: u64,
    /// Chip id, if the kernel reports one
    pub chip_id: Option<u64>,
    /// Maximum core clock in Hz
    pub max_freq: Option<u64>,
    /// Number of queue priorities
    pub priorities: Option<u64>,
}

impl DeviceInfo {
    /// Hardware generation, e.g. 6 for an a630
    pub fn generation(&self) -> u32 {
        self.gpu_id / 100
    }

    /// Marketing name
    pub fn name(&self) -> String {
        format!("Adreno {}", self.gpu_id)
    }
}

struct DeviceInner {
    kgd: Arc<dyn Kgd>,
    bo_allocator: Arc<BoAllocator>,
    host: Arc<dyn HostAllocator>,
    config: DeviceConfig,
    info: DeviceInfo,
    lost: Arc<LostState>,
    next_pool_id: AtomicU32,
}

/// A GPU device
///
/// Cheap to clone; every clone refers to the same kernel connection, BO
/// cache and lost flag.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.inner.info)
            .field("lost", &self.inner.lost.is_lost())
            .finish()
    }
}

fn required_param(kgd: &dyn Kgd, param: Param) -> Result<u64> {
    kgd.get_param(param)
        .map_err(|e| Error::InitializationFailed(format!("could not query {param:?}: {e}")))
}

impl Device {
    /// Bring up a device on `kgd` with the default host allocator
    pub fn new(kgd: Arc<dyn Kgd>, config: DeviceConfig) -> Result<Self> {
        let host: Arc<dyn HostAllocator> = match config.host_memory_limit {
            Some(limit) => Arc::new(BudgetAllocator::new(limit)),
            None => Arc::new(BudgetAllocator::with_physical_memory()),
        };
        Self::with_host_allocator(kgd, config, host)
    }

    /// Bring up a device charging host memory to `host`
    pub fn with_host_allocator(
        kgd: Arc<dyn Kgd>,
        config: DeviceConfig,
        host: Arc<dyn HostAllocator>,
    ) -> Result<Self> {
        config.validate()?;

        let info = DeviceInfo {
            driver: kgd.name().to_string(),
            gpu_id: u32::try_from(required_param(kgd.as_ref(), Param::GpuId)?)
                .map_err(|_| Error::InitializationFailed("GPU id does not fit in 32 bits".into()))?,
            gmem_size: required_param(kgd.as_ref(), Param::GmemSize)?,
            gmem_base: required_param(kgd.as_ref(), Param::GmemBase)?,
            chip_id: kgd.get_param(Param::ChipId).ok(),
            max_freq: kgd.get_param(Param::MaxFreq).ok(),
            priorities: kgd.get_param(Param::Priorities).ok(),
        };

        if config.debug_startup {
            info!(
                "{} on {} driver: gmem {} KiB @ {:#x}, chip id {:?}",
                info.name(),
                info.driver,
                info.gmem_size / 1024,
                info.gmem_base,
                info.chip_id
            );
        } else {
            debug!("opened {} ({})", info.name(), info.driver);
        }

        let lost = Arc::new(LostState::default());
        let bo_allocator = BoAllocator::new(Arc::clone(&kgd), config.bo_cache, Arc::clone(&lost));

        Ok(Self {
            inner: Arc::new(DeviceInner {
                kgd,
                bo_allocator,
                host,
                config,
                info,
                lost,
                next_pool_id: AtomicU32::new(1),
            }),
        })
    }

    /// Open an msm render node
    #[cfg(all(feature = "msm", any(target_os = "linux", target_os = "android")))]
    pub fn open<P: AsRef<std::path::Path>>(path: P, config: DeviceConfig) -> Result<Self> {
        let kgd = crate::kgd::msm::MsmKgd::open(path)?;
        Self::new(Arc::new(kgd), config)
    }

    /// Device constants
    pub fn info(&self) -> &DeviceInfo {
        &self.inner.info
    }

    /// Configuration the device was created with
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Kernel driver
    pub fn kgd(&self) -> &Arc<dyn Kgd> {
        &self.inner.kgd
    }

    /// Buffer object allocator
    pub fn bo_allocator(&self) -> &Arc<BoAllocator> {
        &self.inner.bo_allocator
    }

    /// Default host allocator
    pub fn host_allocator(&self) -> &Arc<dyn HostAllocator> {
        &self.inner.host
    }

    /// Allocate a buffer object
    pub fn create_bo(&self, size: u64, flags: BoFlags) -> Result<BoRef> {
        self.inner.bo_allocator.create(size, flags)
    }

    /// Import a dmabuf descriptor
    pub fn import_bo(&self, fd: RawFd) -> Result<BoRef> {
        self.inner.bo_allocator.import(fd)
    }

    /// Graphics queue at the configured priority
    pub fn create_queue(&self) -> Result<Queue> {
        self.create_queue_with(self.inner.config.queue_priority, Requirements::GRAPHICS)
    }

    /// Queue of a given priority and type
    pub fn create_queue_with(&self, priority: u32, requirements: Requirements) -> Result<Queue> {
        Queue::new(self, priority, requirements)
    }

    /// Command pool charging the device's host allocator
    pub fn create_command_pool(&self) -> Result<CommandPool> {
        CommandPool::new(self, None)
    }

    /// Command pool charging `allocator` instead of the device default
    pub fn create_command_pool_with_allocator(&self, allocator: Arc<dyn HostAllocator>) -> Result<CommandPool> {
        CommandPool::new(self, Some(allocator))
    }

    /// New sync object
    pub fn create_sync(&self, signaled: bool) -> Result<SyncObject> {
        SyncObject::new(self, signaled)
    }

    /// Whether the device has been lost
    pub fn is_lost(&self) -> bool {
        self.inner.lost.is_lost()
    }

    /// Why the device was lost
    pub fn lost_reason(&self) -> Option<String> {
        self.inner.lost.reason()
    }

    /// `Err(DeviceLost)` once the device has been lost
    pub fn check_lost(&self) -> Result<()> {
        self.inner.lost.check()
    }

    /// Mark the device lost and return the error to surface
    pub fn set_lost(&self, reason: impl Into<String>) -> Error {
        self.inner.lost.set(reason)
    }

    /// Translate a failed kernel call: descriptor and memory exhaustion are
    /// host OOM, anything else loses the device
    pub(crate) fn kernel_error(&self, op: &str, err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM) => Error::OutOfHostMemory,
            _ => self.inner.lost.kernel(op, err),
        }
    }

    pub(crate) fn next_pool_id(&self) -> u32 {
        self.inner.next_pool_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether two handles refer to the same device
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kgd::NullKgd;

    #[test]
    fn test_lost_state_first_reason_wins() {
        let lost = LostState::default();
        assert!(lost.check().is_ok());
        assert_eq!(lost.set("first"), Error::DeviceLost("first".into()));
        assert_eq!(lost.set("second"), Error::DeviceLost("first".into()));
        assert!(lost.is_lost());
        assert_eq!(lost.check(), Err(Error::DeviceLost("first".into())));
    }

    #[test]
    fn test_device_info_from_params() {
        let device = Device::new(Arc::new(NullKgd::new()), DeviceConfig::default()).unwrap();
        let info = device.info();
        assert_eq!(info.driver, "null");
        assert_eq!(info.gpu_id, 630);
        assert_eq!(info.generation(), 6);
        assert_eq!(info.name(), "Adreno 630");
        assert_eq!(info.gmem_size, 1024 * 1024);
        assert!(info.chip_id.is_some());
    }

    #[test]
    fn test_missing_required_param() {
        let kgd = NullKgd::new();
        kgd.set_param(Param::GmemSize, None);
        let err = Device::new(Arc::new(kgd), DeviceConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InitializationFailed(_)));
    }

    #[test]
    fn test_oversized_gpu_id_is_rejected() {
        let kgd = NullKgd::new();
        kgd.set_param(Param::GpuId, Some((1 << 40) | 630));
        let err = Device::new(Arc::new(kgd), DeviceConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InitializationFailed(_)));
    }

    #[test]
    fn test_chip_id_is_optional() {
        let kgd = NullKgd::new();
        kgd.set_param(Param::ChipId, None);
        let device = Device::new(Arc::new(kgd), DeviceConfig::default()).unwrap();
        assert_eq!(device.info().chip_id, None);
    }

    #[test]
    fn test_clone_shares_lost_flag() {
        let device = Device::new(Arc::new(NullKgd::new()), DeviceConfig::default()).unwrap();
        let other = device.clone();
        assert!(device.same_device(&other));
        device.set_lost("test");
        assert!(other.is_lost());
        assert_eq!(other.lost_reason().as_deref(), Some("test"));
        assert!(matches!(other.create_bo(4096, BoFlags::empty()), Err(Error::DeviceLost(_))));
    }

    #[test]
    fn test_info_serializes() {
        let device = Device::new(Arc::new(NullKgd::new()), DeviceConfig::default()).unwrap();
        let json = serde_json::to_value(device.info()).unwrap();
        assert_eq!(json["gpu_id"], 630);
    }
}
