//! Error types for the gpucs library

use std::collections::TryReserveError;
use thiserror::Error;

/// Main error type for gpucs operations
///
/// Errors are plain values so a command buffer can latch the first one it
/// hits while recording and hand it back again from `end`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The host allocator refused a request
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// The kernel driver refused a buffer object allocation
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// Mapping a buffer object for CPU access failed
    #[error("Memory map failed")]
    MemoryMapFailed,

    /// The kernel reported a problem while bringing the device up
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// The device node is not driven by a supported kernel driver
    #[error("Incompatible driver: {0}")]
    IncompatibleDriver(String),

    /// An imported file descriptor was rejected
    #[error("Invalid external handle")]
    InvalidExternalHandle,

    /// A kernel call failed unrecoverably; sticky on the device
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// A wait deadline elapsed
    #[error("Timeout")]
    Timeout,

    /// An object was used in a state that does not allow the operation
    #[error("Invalid usage: {0}")]
    InvalidUsage(&'static str),

    /// Configuration could not be loaded
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this error poisons the device
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Error::DeviceLost(_))
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::OutOfHostMemory
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

/// Result type for gpucs operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_reserve_maps_to_host_oom() {
        let mut v: Vec<u64> = Vec::new();
        let err = v.try_reserve(usize::MAX).unwrap_err();
        assert_eq!(Error::from(err), Error::OutOfHostMemory);
    }

    #[test]
    fn test_device_lost_display() {
        let err = Error::DeviceLost("submit: Input/output error".into());
        assert!(err.is_device_lost());
        assert!(err.to_string().starts_with("Device lost: submit"));
        assert!(!Error::Timeout.is_device_lost());
    }

    #[test]
    fn test_json_error_is_invalid_config() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
