//! msm DRM render-node backend

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Mutex;

use log::{debug, trace, warn};

use super::ioctl::{drm_iow, drm_iowr, ioctl_retry, DRM_COMMAND_BASE};
use super::{CommandTuple, Kgd, Madvise, NewBo, Param, Requirements, ResidencyEntry, WaitStatus};
use crate::bo::BoFlags;
use crate::error::{Error, Result};
use crate::residency::AccessFlags;

/// Oldest msm interface the backend speaks
pub const MIN_VERSION: (i32, i32) = (1, 3);
/// First msm minor version with the `{handle, info, value, len}` GEM_INFO payload
const GEM_INFO_INFO_MINOR: i32 = 4;

const MSM_PIPE_3D0: u32 = 0x10;

const MSM_PARAM_GPU_ID: u32 = 0x01;
const MSM_PARAM_GMEM_SIZE: u32 = 0x02;
const MSM_PARAM_CHIP_ID: u32 = 0x03;
const MSM_PARAM_MAX_FREQ: u32 = 0x04;
const MSM_PARAM_TIMESTAMP: u32 = 0x05;
const MSM_PARAM_GMEM_BASE: u32 = 0x06;
const MSM_PARAM_PRIORITIES: u32 = 0x07;

const MSM_BO_WC: u32 = 0x0002_0000;
const MSM_BO_CACHED_COHERENT: u32 = 0x0008_0000;

const MSM_INFO_GET_OFFSET: u32 = 0x00;
const MSM_INFO_GET_IOVA: u32 = 0x01;
const MSM_INFO_LEGACY_IOVA: u32 = 0x01;

const MSM_SUBMIT_CMD_BUF: u32 = 0x0001;
const MSM_SUBMIT_BO_READ: u32 = 0x0001;
const MSM_SUBMIT_BO_WRITE: u32 = 0x0002;
const MSM_SUBMIT_BO_DUMP: u32 = 0x0004;
const MSM_SUBMIT_FENCE_FD_OUT: u32 = 0x2000_0000;
const MSM_SUBMIT_SYNCOBJ_IN: u32 = 0x0800_0000;
const MSM_SUBMIT_SYNCOBJ_OUT: u32 = 0x0400_0000;

const MSM_MADV_WILLNEED: u32 = 0;
const MSM_MADV_DONTNEED: u32 = 1;

const DRM_SYNCOBJ_CREATE_SIGNALED: u32 = 1 << 0;
const DRM_SYNCOBJ_HANDLE_TO_FD_FLAGS_EXPORT_SYNC_FILE: u32 = 1 << 0;
const DRM_SYNCOBJ_FD_TO_HANDLE_FLAGS_IMPORT_SYNC_FILE: u32 = 1 << 0;
const DRM_SYNCOBJ_WAIT_FLAGS_WAIT_ALL: u32 = 1 << 0;
const DRM_SYNCOBJ_WAIT_FLAGS_WAIT_FOR_SUBMIT: u32 = 1 << 1;

#[repr(C)]
struct DrmVersion {
    version_major: libc::c_int,
    version_minor: libc::c_int,
    version_patchlevel: libc::c_int,
    name_len: usize,
    name: *mut libc::c_char,
    date_len: usize,
    date: *mut libc::c_char,
    desc_len: usize,
    desc: *mut libc::c_char,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct GemCloseArgs {
    handle: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct PrimeHandleArgs {
    handle: u32,
    flags: u32,
    fd: i32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct SyncobjCreateArgs {
    handle: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct SyncobjDestroyArgs {
    handle: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct SyncobjHandleArgs {
    handle: u32,
    flags: u32,
    fd: i32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct SyncobjWaitArgs {
    handles: u64,
    timeout_nsec: i64,
    count_handles: u32,
    flags: u32,
    first_signaled: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct SyncobjArrayArgs {
    handles: u64,
    count_handles: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmParamArgs {
    pipe: u32,
    param: u32,
    value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmGemNewArgs {
    size: u64,
    flags: u32,
    handle: u32,
}

/// GEM_INFO payload on msm >= 1.4
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmGemInfoArgs {
    handle: u32,
    info: u32,
    value: u64,
    len: u32,
    pad: u32,
}

/// GEM_INFO payload on msm 1.3: the flag selects offset or iova
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmGemInfoLegacyArgs {
    handle: u32,
    flags: u32,
    offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmGemSubmitBo {
    flags: u32,
    handle: u32,
    presumed: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmGemSubmitCmd {
    ty: u32,
    submit_idx: u32,
    submit_offset: u32,
    size: u32,
    pad: u32,
    nr_relocs: u32,
    relocs: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmGemSubmitSyncobj {
    handle: u32,
    flags: u32,
    point: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmGemSubmitArgs {
    flags: u32,
    fence: u32,
    nr_bos: u32,
    nr_cmds: u32,
    bos: u64,
    cmds: u64,
    fence_fd: i32,
    queueid: u32,
    in_syncobjs: u64,
    out_syncobjs: u64,
    nr_in_syncobjs: u32,
    nr_out_syncobjs: u32,
    syncobj_stride: u32,
    pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmGemMadviseArgs {
    handle: u32,
    madv: u32,
    retained: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct MsmSubmitqueueArgs {
    flags: u32,
    prio: u32,
    id: u32,
}

const DRM_IOCTL_VERSION: u32 = drm_iowr::<DrmVersion>(0x00);
const DRM_IOCTL_GEM_CLOSE: u32 = drm_iow::<GemCloseArgs>(0x09);
const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 = drm_iowr::<PrimeHandleArgs>(0x2d);
const DRM_IOCTL_PRIME_FD_TO_HANDLE: u32 = drm_iowr::<PrimeHandleArgs>(0x2e);
const DRM_IOCTL_SYNCOBJ_CREATE: u32 = drm_iowr::<SyncobjCreateArgs>(0xBF);
const DRM_IOCTL_SYNCOBJ_DESTROY: u32 = drm_iowr::<SyncobjDestroyArgs>(0xC0);
const DRM_IOCTL_SYNCOBJ_HANDLE_TO_FD: u32 = drm_iowr::<SyncobjHandleArgs>(0xC1);
const DRM_IOCTL_SYNCOBJ_FD_TO_HANDLE: u32 = drm_iowr::<SyncobjHandleArgs>(0xC2);
const DRM_IOCTL_SYNCOBJ_WAIT: u32 = drm_iowr::<SyncobjWaitArgs>(0xC3);
const DRM_IOCTL_SYNCOBJ_RESET: u32 = drm_iowr::<SyncobjArrayArgs>(0xC4);

const DRM_IOCTL_MSM_GET_PARAM: u32 = drm_iowr::<MsmParamArgs>(DRM_COMMAND_BASE + 0x00);
const DRM_IOCTL_MSM_GEM_NEW: u32 = drm_iowr::<MsmGemNewArgs>(DRM_COMMAND_BASE + 0x02);
const DRM_IOCTL_MSM_GEM_INFO: u32 = drm_iowr::<MsmGemInfoArgs>(DRM_COMMAND_BASE + 0x03);
const DRM_IOCTL_MSM_GEM_INFO_LEGACY: u32 =
    drm_iowr::<MsmGemInfoLegacyArgs>(DRM_COMMAND_BASE + 0x03);
const DRM_IOCTL_MSM_GEM_SUBMIT: u32 = drm_iowr::<MsmGemSubmitArgs>(DRM_COMMAND_BASE + 0x06);
const DRM_IOCTL_MSM_GEM_MADVISE: u32 = drm_iowr::<MsmGemMadviseArgs>(DRM_COMMAND_BASE + 0x08);
const DRM_IOCTL_MSM_SUBMITQUEUE_NEW: u32 =
    drm_iowr::<MsmSubmitqueueArgs>(DRM_COMMAND_BASE + 0x0A);
const DRM_IOCTL_MSM_SUBMITQUEUE_CLOSE: u32 = drm_iow::<u32>(DRM_COMMAND_BASE + 0x0B);

/// Which GEM_INFO payload the running kernel expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemInfoLayout {
    /// `{handle, flags, offset}`; flag bit 0 selects the iova
    Legacy,
    /// `{handle, info, value, len, pad}`; `info` selects the query
    Current,
}

impl GemInfoLayout {
    /// Pick the payload decoding for an msm interface version
    pub fn for_version(major: i32, minor: i32) -> Self {
        if major > 1 || minor >= GEM_INFO_INFO_MINOR {
            GemInfoLayout::Current
        } else {
            GemInfoLayout::Legacy
        }
    }
}

/// Kernel driver version as reported by DRM_IOCTL_VERSION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverVersion {
    /// Driver name ("msm")
    pub name: String,
    /// Interface major version
    pub major: i32,
    /// Interface minor version
    pub minor: i32,
    /// Patch level
    pub patch: i32,
}

/// Client for one msm render node
pub struct MsmKgd {
    file: File,
    version: DriverVersion,
    layout: GemInfoLayout,
    iovas: Mutex<HashMap<u32, u64>>,
    out_fences: Mutex<HashMap<u32, (u32, OwnedFd)>>,
}

impl MsmKgd {
    /// Open a render node and check that it is a supported msm driver
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| Error::InitializationFailed(format!("{}: {}", path.display(), e)))?;

        let version = query_version(file.as_raw_fd())
            .map_err(|e| Error::InitializationFailed(format!("DRM_IOCTL_VERSION: {e}")))?;

        if version.name != "msm" {
            return Err(Error::IncompatibleDriver(format!(
                "{} is driven by {}",
                path.display(),
                version.name
            )));
        }
        if version.major != MIN_VERSION.0 || version.minor < MIN_VERSION.1 {
            return Err(Error::IncompatibleDriver(format!(
                "msm {}.{} is older than {}.{}",
                version.major, version.minor, MIN_VERSION.0, MIN_VERSION.1
            )));
        }

        let layout = GemInfoLayout::for_version(version.major, version.minor);
        debug!(
            "opened {} (msm {}.{}.{}, {:?} GEM_INFO)",
            path.display(),
            version.major,
            version.minor,
            version.patch,
            layout
        );

        Ok(Self {
            file,
            version,
            layout,
            iovas: Mutex::new(HashMap::new()),
            out_fences: Mutex::new(HashMap::new()),
        })
    }

    /// Kernel interface version
    pub fn version(&self) -> &DriverVersion {
        &self.version
    }

    /// GEM_INFO decoding picked at open time
    pub fn gem_info_layout(&self) -> GemInfoLayout {
        self.layout
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn gem_offset(&self, handle: u32) -> io::Result<u64> {
        match self.layout {
            GemInfoLayout::Current => {
                let mut req = MsmGemInfoArgs {
                    handle,
                    info: MSM_INFO_GET_OFFSET,
                    ..Default::default()
                };
                ioctl_retry(self.fd(), DRM_IOCTL_MSM_GEM_INFO, &mut req)?;
                Ok(req.value)
            }
            GemInfoLayout::Legacy => {
                let mut req = MsmGemInfoLegacyArgs {
                    handle,
                    flags: 0,
                    offset: 0,
                };
                ioctl_retry(self.fd(), DRM_IOCTL_MSM_GEM_INFO_LEGACY, &mut req)?;
                Ok(req.offset)
            }
        }
    }

    fn gem_iova(&self, handle: u32) -> io::Result<u64> {
        let iova = match self.layout {
            GemInfoLayout::Current => {
                let mut req = MsmGemInfoArgs {
                    handle,
                    info: MSM_INFO_GET_IOVA,
                    ..Default::default()
                };
                ioctl_retry(self.fd(), DRM_IOCTL_MSM_GEM_INFO, &mut req)?;
                req.value
            }
            GemInfoLayout::Legacy => {
                let mut req = MsmGemInfoLegacyArgs {
                    handle,
                    flags: MSM_INFO_LEGACY_IOVA,
                    offset: 0,
                };
                ioctl_retry(self.fd(), DRM_IOCTL_MSM_GEM_INFO_LEGACY, &mut req)?;
                req.offset
            }
        };
        if iova == 0 {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        Ok(iova)
    }

    fn register(&self, handle: u32, size: u64) -> io::Result<NewBo> {
        let gpu_addr = match self.gem_iova(handle) {
            Ok(iova) => iova,
            Err(e) => {
                self.gem_close(handle);
                return Err(e);
            }
        };
        if let Ok(mut iovas) = self.iovas.lock() {
            iovas.insert(handle, gpu_addr);
        }
        Ok(NewBo {
            handle,
            gpu_addr,
            size,
        })
    }

    fn gem_close(&self, handle: u32) {
        let mut req = GemCloseArgs { handle, pad: 0 };
        if let Err(e) = ioctl_retry(self.fd(), DRM_IOCTL_GEM_CLOSE, &mut req) {
            warn!("GEM_CLOSE({handle}) failed: {e}");
        }
    }

    fn iova_of(&self, handle: u32) -> io::Result<u64> {
        self.iovas
            .lock()
            .ok()
            .and_then(|iovas| iovas.get(&handle).copied())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }
}

fn query_version(fd: RawFd) -> io::Result<DriverVersion> {
    let mut name = [0u8; 64];
    let mut req = DrmVersion {
        version_major: 0,
        version_minor: 0,
        version_patchlevel: 0,
        name_len: name.len(),
        name: name.as_mut_ptr() as *mut libc::c_char,
        date_len: 0,
        date: std::ptr::null_mut(),
        desc_len: 0,
        desc: std::ptr::null_mut(),
    };
    ioctl_retry(fd, DRM_IOCTL_VERSION, &mut req)?;

    let len = req.name_len.min(name.len());
    let name = String::from_utf8_lossy(&name[..len])
        .trim_end_matches('\0')
        .to_string();
    Ok(DriverVersion {
        name,
        major: req.version_major,
        minor: req.version_minor,
        patch: req.version_patchlevel,
    })
}

fn access_to_msm(flags: AccessFlags) -> u32 {
    let mut out = 0;
    if flags.contains(AccessFlags::READ) {
        out |= MSM_SUBMIT_BO_READ;
    }
    if flags.contains(AccessFlags::WRITE) {
        out |= MSM_SUBMIT_BO_WRITE;
    }
    if flags.contains(AccessFlags::DUMP) {
        out |= MSM_SUBMIT_BO_DUMP;
    }
    out
}

fn param_id(param: Param) -> u32 {
    match param {
        Param::GpuId => MSM_PARAM_GPU_ID,
        Param::GmemSize => MSM_PARAM_GMEM_SIZE,
        Param::GmemBase => MSM_PARAM_GMEM_BASE,
        Param::ChipId => MSM_PARAM_CHIP_ID,
        Param::MaxFreq => MSM_PARAM_MAX_FREQ,
        Param::Timestamp => MSM_PARAM_TIMESTAMP,
        Param::Priorities => MSM_PARAM_PRIORITIES,
    }
}

fn einval() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

impl Kgd for MsmKgd {
    fn name(&self) -> &'static str {
        "msm"
    }

    fn bo_new(&self, size: u64, flags: BoFlags) -> io::Result<NewBo> {
        let cache = if flags.contains(BoFlags::COHERENT_LOCAL) {
            MSM_BO_CACHED_COHERENT
        } else {
            MSM_BO_WC
        };
        let mut req = MsmGemNewArgs {
            size,
            flags: cache,
            handle: 0,
        };
        ioctl_retry(self.fd(), DRM_IOCTL_MSM_GEM_NEW, &mut req)?;
        trace!("GEM_NEW size={size} -> handle {}", req.handle);
        self.register(req.handle, size)
    }

    fn bo_close(&self, handle: u32) {
        if let Ok(mut iovas) = self.iovas.lock() {
            iovas.remove(&handle);
        }
        self.gem_close(handle);
    }

    fn bo_map(&self, handle: u32, size: u64) -> io::Result<NonNull<u8>> {
        let offset = self.gem_offset(handle)?;
        let len = usize::try_from(size).map_err(|_| einval())?;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr as *mut u8).ok_or_else(einval)
    }

    fn bo_munmap(&self, ptr: NonNull<u8>, size: u64) {
        let ret = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, size as usize) };
        if ret != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }

    fn bo_export(&self, handle: u32) -> io::Result<OwnedFd> {
        let mut req = PrimeHandleArgs {
            handle,
            flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            fd: -1,
        };
        ioctl_retry(self.fd(), DRM_IOCTL_PRIME_HANDLE_TO_FD, &mut req)?;
        Ok(unsafe { OwnedFd::from_raw_fd(req.fd) })
    }

    fn bo_import(&self, fd: RawFd) -> io::Result<NewBo> {
        // lseek() gives the real size of a dmabuf
        let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        if size < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe { libc::lseek(fd, 0, libc::SEEK_SET) };

        let mut req = PrimeHandleArgs {
            handle: 0,
            flags: 0,
            fd,
        };
        ioctl_retry(self.fd(), DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut req)?;
        self.register(req.handle, size as u64)
    }

    fn bo_madvise(&self, handle: u32, advice: Madvise) -> io::Result<bool> {
        let mut req = MsmGemMadviseArgs {
            handle,
            madv: match advice {
                Madvise::WillNeed => MSM_MADV_WILLNEED,
                Madvise::DontNeed => MSM_MADV_DONTNEED,
            },
            retained: 0,
        };
        ioctl_retry(self.fd(), DRM_IOCTL_MSM_GEM_MADVISE, &mut req)?;
        Ok(req.retained != 0)
    }

    fn queue_new(&self, priority: u32, flags: u32) -> io::Result<u32> {
        let mut req = MsmSubmitqueueArgs {
            flags,
            prio: priority,
            id: 0,
        };
        ioctl_retry(self.fd(), DRM_IOCTL_MSM_SUBMITQUEUE_NEW, &mut req)?;
        Ok(req.id)
    }

    fn queue_close(&self, queue_id: u32) {
        if let Ok(mut fences) = self.out_fences.lock() {
            fences.remove(&queue_id);
        }
        let mut id = queue_id;
        if let Err(e) = ioctl_retry(self.fd(), DRM_IOCTL_MSM_SUBMITQUEUE_CLOSE, &mut id) {
            warn!("SUBMITQUEUE_CLOSE({queue_id}) failed: {e}");
        }
    }

    fn submit(
        &self,
        queue_id: u32,
        commands: &[CommandTuple],
        residency: &[ResidencyEntry],
        in_syncs: &[u32],
        out_sync: u32,
        requirements: Requirements,
    ) -> io::Result<u32> {
        let bos: Vec<MsmGemSubmitBo> = residency
            .iter()
            .map(|entry| MsmGemSubmitBo {
                flags: access_to_msm(entry.flags),
                handle: entry.handle,
                presumed: 0,
            })
            .collect();

        let mut cmds = Vec::with_capacity(commands.len());
        for tuple in commands {
            let idx = residency
                .iter()
                .position(|entry| entry.handle == tuple.handle)
                .ok_or_else(einval)?;
            let iova = self.iova_of(tuple.handle)?;
            let offset = tuple.gpu_addr.checked_sub(iova).ok_or_else(einval)?;
            cmds.push(MsmGemSubmitCmd {
                ty: MSM_SUBMIT_CMD_BUF,
                submit_idx: idx as u32,
                submit_offset: u32::try_from(offset).map_err(|_| einval())?,
                size: tuple.size,
                ..Default::default()
            });
        }

        let ins: Vec<MsmGemSubmitSyncobj> = in_syncs
            .iter()
            .map(|&handle| MsmGemSubmitSyncobj {
                handle,
                flags: 0,
                point: 0,
            })
            .collect();
        let out = [MsmGemSubmitSyncobj {
            handle: out_sync,
            flags: 0,
            point: 0,
        }];

        let mut flags = MSM_SUBMIT_FENCE_FD_OUT | MSM_SUBMIT_SYNCOBJ_OUT;
        if !ins.is_empty() {
            flags |= MSM_SUBMIT_SYNCOBJ_IN;
        }

        let mut req = MsmGemSubmitArgs {
            flags,
            nr_bos: bos.len() as u32,
            nr_cmds: cmds.len() as u32,
            bos: bos.as_ptr() as u64,
            cmds: cmds.as_ptr() as u64,
            fence_fd: -1,
            queueid: queue_id,
            in_syncobjs: ins.as_ptr() as u64,
            out_syncobjs: out.as_ptr() as u64,
            nr_in_syncobjs: ins.len() as u32,
            nr_out_syncobjs: 1,
            syncobj_stride: std::mem::size_of::<MsmGemSubmitSyncobj>() as u32,
            ..Default::default()
        };
        ioctl_retry(self.fd(), DRM_IOCTL_MSM_GEM_SUBMIT, &mut req)?;
        trace!(
            "GEM_SUBMIT queue={queue_id} cmds={} bos={} req={:?} -> fence {}",
            cmds.len(),
            bos.len(),
            requirements,
            req.fence
        );

        if req.fence_fd >= 0 {
            let fd = unsafe { OwnedFd::from_raw_fd(req.fence_fd) };
            if let Ok(mut fences) = self.out_fences.lock() {
                fences.insert(queue_id, (req.fence, fd));
            }
        }
        Ok(req.fence)
    }

    fn sync_new(&self, signaled: bool) -> io::Result<u32> {
        let mut req = SyncobjCreateArgs {
            handle: 0,
            flags: if signaled { DRM_SYNCOBJ_CREATE_SIGNALED } else { 0 },
        };
        ioctl_retry(self.fd(), DRM_IOCTL_SYNCOBJ_CREATE, &mut req)?;
        Ok(req.handle)
    }

    fn sync_close(&self, sync_id: u32) {
        let mut req = SyncobjDestroyArgs {
            handle: sync_id,
            pad: 0,
        };
        if let Err(e) = ioctl_retry(self.fd(), DRM_IOCTL_SYNCOBJ_DESTROY, &mut req) {
            warn!("SYNCOBJ_DESTROY({sync_id}) failed: {e}");
        }
    }

    fn sync_wait(&self, sync_ids: &[u32], wait_all: bool, deadline_ns: i64) -> io::Result<WaitStatus> {
        let mut flags = DRM_SYNCOBJ_WAIT_FLAGS_WAIT_FOR_SUBMIT;
        if wait_all {
            flags |= DRM_SYNCOBJ_WAIT_FLAGS_WAIT_ALL;
        }
        let mut req = SyncobjWaitArgs {
            handles: sync_ids.as_ptr() as u64,
            timeout_nsec: deadline_ns,
            count_handles: sync_ids.len() as u32,
            flags,
            ..Default::default()
        };
        match ioctl_retry(self.fd(), DRM_IOCTL_SYNCOBJ_WAIT, &mut req) {
            Ok(()) => Ok(WaitStatus::Signaled),
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => Ok(WaitStatus::TimedOut),
            Err(e) => Err(e),
        }
    }

    fn sync_reset(&self, sync_ids: &[u32]) -> io::Result<()> {
        let mut req = SyncobjArrayArgs {
            handles: sync_ids.as_ptr() as u64,
            count_handles: sync_ids.len() as u32,
            pad: 0,
        };
        ioctl_retry(self.fd(), DRM_IOCTL_SYNCOBJ_RESET, &mut req)
    }

    fn sync_export_file(&self, sync_id: u32) -> io::Result<OwnedFd> {
        let mut req = SyncobjHandleArgs {
            handle: sync_id,
            flags: DRM_SYNCOBJ_HANDLE_TO_FD_FLAGS_EXPORT_SYNC_FILE,
            fd: -1,
            pad: 0,
        };
        ioctl_retry(self.fd(), DRM_IOCTL_SYNCOBJ_HANDLE_TO_FD, &mut req)?;
        Ok(unsafe { OwnedFd::from_raw_fd(req.fd) })
    }

    fn sync_import_file(&self, sync_id: u32, fd: RawFd) -> io::Result<()> {
        let mut req = SyncobjHandleArgs {
            handle: sync_id,
            flags: DRM_SYNCOBJ_FD_TO_HANDLE_FLAGS_IMPORT_SYNC_FILE,
            fd,
            pad: 0,
        };
        ioctl_retry(self.fd(), DRM_IOCTL_SYNCOBJ_FD_TO_HANDLE, &mut req)
    }

    fn sync_signal_from_timestamp(&self, queue_id: u32, timestamp: u32) -> io::Result<OwnedFd> {
        let fences = self
            .out_fences
            .lock()
            .map_err(|_| io::Error::from_raw_os_error(libc::EIO))?;
        match fences.get(&queue_id) {
            Some((fence, fd)) if *fence == timestamp => fd.try_clone(),
            _ => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn get_param(&self, param: Param) -> io::Result<u64> {
        let mut req = MsmParamArgs {
            pipe: MSM_PIPE_3D0,
            param: param_id(param),
            value: 0,
        };
        ioctl_retry(self.fd(), DRM_IOCTL_MSM_GET_PARAM, &mut req)?;
        Ok(req.value)
    }
}

/// List DRM render nodes present on the system
pub fn find_render_nodes() -> Vec<String> {
    let mut nodes = Vec::new();
    for i in 128..192 {
        let path = format!("/dev/dri/renderD{}", i);
        if std::fs::metadata(&path).is_ok() {
            nodes.push(path);
        }
    }
    nodes
}

/// Open the first render node driven by msm
pub fn open_first() -> Result<MsmKgd> {
    let mut last = Error::InitializationFailed("no render node found".to_string());
    for node in find_render_nodes() {
        match MsmKgd::open(&node) {
            Ok(kgd) => return Ok(kgd),
            Err(e) => {
                debug!("skipping {node}: {e}");
                last = e;
            }
        }
    }
    Err(last)
}
