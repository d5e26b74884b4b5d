//! ioctl number encoding and the retrying call wrapper

use std::io;
use std::os::fd::RawFd;

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// DRM ioctl type ('d')
pub const DRM_IOCTL_BASE: u32 = 0x64;
/// First driver-private DRM command number
pub const DRM_COMMAND_BASE: u32 = 0x40;

/// Encode an ioctl request number: `(dir << 30) | (size << 16) | (ty << 8) | nr`
pub const fn ioc(dir: u32, ty: u32, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT) | ((size as u32) << IOC_SIZESHIFT) | (ty << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT)
}

/// Write-only DRM request carrying `T`
pub const fn drm_iow<T>(nr: u32) -> u32 {
    ioc(IOC_WRITE, DRM_IOCTL_BASE, nr, std::mem::size_of::<T>())
}

/// Read-write DRM request carrying `T`
pub const fn drm_iowr<T>(nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, DRM_IOCTL_BASE, nr, std::mem::size_of::<T>())
}

/// Issue `request` on `fd`, retrying while the kernel reports EINTR/EAGAIN
pub fn ioctl_retry<T>(fd: RawFd, request: u32, arg: &mut T) -> io::Result<()> {
    loop {
        let ret = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Version {
        _data: [u8; 64],
    }

    #[test]
    fn test_drm_version_request() {
        // DRM_IOCTL_VERSION on 64-bit targets
        assert_eq!(drm_iowr::<Version>(0x00), 0xC040_6400);
    }

    #[test]
    fn test_gem_close_request() {
        #[repr(C)]
        struct GemClose {
            _handle: u32,
            _pad: u32,
        }
        assert_eq!(drm_iow::<GemClose>(0x09), 0x4008_6409);
    }

    #[test]
    fn test_bad_fd_is_reported() {
        let mut arg = 0u64;
        let err = ioctl_retry(-1, drm_iowr::<u64>(0x00), &mut arg).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
