#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::bufmgr::{
    EngineClass, EngineInfo, ExecBuffer, GemDevice, GemHandle, MapKind, Madvise, Tiling,
    TilingState,
};
use crate::drm::ioctl::{
    DRM_CLOEXEC, DRM_I915_QUERY_ENGINE_INFO, DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_GEM_FLINK,
    DRM_IOCTL_GEM_OPEN, DRM_IOCTL_I915_GEM_BUSY, DRM_IOCTL_I915_GEM_CONTEXT_CREATE,
    DRM_IOCTL_I915_GEM_CONTEXT_DESTROY, DRM_IOCTL_I915_GEM_CONTEXT_GETPARAM,
    DRM_IOCTL_I915_GEM_CONTEXT_SETPARAM, DRM_IOCTL_I915_GEM_CREATE,
    DRM_IOCTL_I915_GEM_EXECBUFFER2_WR, DRM_IOCTL_I915_GEM_GET_APERTURE,
    DRM_IOCTL_I915_GEM_GET_TILING, DRM_IOCTL_I915_GEM_MADVISE, DRM_IOCTL_I915_GEM_MMAP,
    DRM_IOCTL_I915_GEM_MMAP_GTT, DRM_IOCTL_I915_GEM_PIN, DRM_IOCTL_I915_GEM_PREAD,
    DRM_IOCTL_I915_GEM_PWRITE, DRM_IOCTL_I915_GEM_SET_DOMAIN, DRM_IOCTL_I915_GEM_SET_TILING,
    DRM_IOCTL_I915_GEM_USERPTR, DRM_IOCTL_I915_GEM_WAIT, DRM_IOCTL_I915_GETPARAM,
    DRM_IOCTL_I915_QUERY, DRM_IOCTL_PRIME_FD_TO_HANDLE, DRM_IOCTL_PRIME_HANDLE_TO_FD, DRM_RDWR,
    EngineInfoEntry, GemBusyArgs, GemCloseArgs, GemContextCreateArgs, GemContextDestroyArgs,
    GemContextParamArgs, GemCreateArgs, GemExecObject2, GemExecbuffer2Args, GemFlinkArgs,
    GemGetTilingArgs, GemMadviseArgs, GemMmapArgs, GemMmapGttArgs, GemOpenArgs, GemPinArgs,
    GemPreadArgs, GemPwriteArgs, GemSetDomainArgs, GemSetTilingArgs, GemUserptrArgs,
    GemWaitArgs, GetApertureArgs, GetParamArgs, I915_MADV_DONTNEED, I915_MADV_WILLNEED,
    I915_EXEC_FENCE_IN, I915_EXEC_FENCE_OUT, I915_EXEC_FENCE_SUBMIT, I915_MMAP_WC,
    I915_PARAM_HAS_EXEC_SOFTPIN, I915_PARAM_NUM_FENCES_AVAIL,
    I915_USERPTR_READ_ONLY, PrimeHandleArgs, QueryArgs, QueryEngineInfoHeader, QueryItem,
};
use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;

/// Default render node of the first GPU.
pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

/// A handle to an i915 DRM device node.
///
/// The file descriptor is wrapped in an `Arc`, so the handle is cheap to clone and can be
/// shared with several buffer managers.
#[derive(Clone, Debug)]
pub struct DrmDevice {
    pub file: Arc<File>,
}

impl DrmDevice {
    /// Opens a DRM device node.
    ///
    /// # Errors
    /// Returns an error if the node cannot be opened (driver not loaded, permissions).
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Opens [`DEFAULT_RENDER_NODE`].
    ///
    /// # Errors
    /// See [`DrmDevice::open`].
    pub fn open_render_node() -> io::Result<Self> {
        Self::open(DEFAULT_RENDER_NODE)
    }

    /// Generic unsafe helper to execute an IOCTL.
    ///
    /// Interrupted calls are restarted.
    ///
    /// # Safety
    /// The caller must ensure that `arg` points to valid memory appropriate for the specific `cmd`.
    unsafe fn ioctl<T>(&self, cmd: u32, arg: &mut T) -> io::Result<()> {
        loop {
            let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), cmd as _, arg as *mut T) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if !matches!(err.raw_os_error(), Some(libc::EINTR | libc::EAGAIN)) {
                return Err(err);
            }
        }
    }

    // ===========================================================================================
    // Parameters
    // ===========================================================================================

    /// Query a driver parameter.
    pub fn get_param(&self, param: i32) -> io::Result<i32> {
        let mut value = 0i32;
        let mut args = GetParamArgs {
            param,
            value: &raw mut value,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GETPARAM, &mut args)?;
        }
        Ok(value)
    }

    /// Whether the kernel accepts caller-chosen object addresses.
    pub fn has_exec_softpin(&self) -> bool {
        self.get_param(I915_PARAM_HAS_EXEC_SOFTPIN)
            .is_ok_and(|v| v > 0)
    }

    fn mmap_offset(&self, offset: u64, size: u64) -> io::Result<NonNull<u8>> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))
    }
}

impl AsRawFd for DrmDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl GemDevice for DrmDevice {
    // ===========================================================================================
    // Object Lifetime
    // ===========================================================================================

    fn create(&self, size: u64) -> io::Result<GemHandle> {
        let mut args = GemCreateArgs {
            size,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_CREATE, &mut args)?;
        }
        Ok(args.handle)
    }

    fn close(&self, handle: GemHandle) -> io::Result<()> {
        let mut args = GemCloseArgs { handle, pad: 0 };
        unsafe { self.ioctl(DRM_IOCTL_GEM_CLOSE, &mut args) }
    }

    fn userptr(&self, ptr: NonNull<u8>, size: u64, read_only: bool) -> io::Result<GemHandle> {
        let mut args = GemUserptrArgs {
            user_ptr: ptr.as_ptr() as u64,
            user_size: size,
            flags: if read_only { I915_USERPTR_READ_ONLY } else { 0 },
            handle: 0,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_USERPTR, &mut args)?;
        }
        Ok(args.handle)
    }

    fn set_tiling(&self, handle: GemHandle, mode: Tiling, stride: u32) -> io::Result<TilingState> {
        let mut args = GemSetTilingArgs {
            handle,
            tiling_mode: mode.to_raw(),
            stride,
            swizzle_mode: 0,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_SET_TILING, &mut args)?;
        }
        Ok(TilingState {
            mode: Tiling::from_raw(args.tiling_mode),
            swizzle: args.swizzle_mode,
            stride: args.stride,
        })
    }

    fn get_tiling(&self, handle: GemHandle) -> io::Result<(Tiling, u32)> {
        let mut args = GemGetTilingArgs {
            handle,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_GET_TILING, &mut args)?;
        }
        Ok((Tiling::from_raw(args.tiling_mode), args.swizzle_mode))
    }

    // ===========================================================================================
    // CPU Access
    // ===========================================================================================

    fn mmap(&self, handle: GemHandle, size: u64, kind: MapKind) -> io::Result<NonNull<u8>> {
        match kind {
            MapKind::Cpu | MapKind::Wc => {
                let mut args = GemMmapArgs {
                    handle,
                    size,
                    flags: if kind == MapKind::Wc { I915_MMAP_WC } else { 0 },
                    ..Default::default()
                };
                unsafe {
                    self.ioctl(DRM_IOCTL_I915_GEM_MMAP, &mut args)?;
                }
                NonNull::new(args.addr_ptr as *mut u8)
                    .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
            }
            MapKind::Gtt => {
                // Fake offset into the device node, mapped with a regular mmap.
                let mut args = GemMmapGttArgs {
                    handle,
                    ..Default::default()
                };
                unsafe {
                    self.ioctl(DRM_IOCTL_I915_GEM_MMAP_GTT, &mut args)?;
                }
                self.mmap_offset(args.offset, size)
            }
        }
    }

    fn munmap(&self, ptr: NonNull<u8>, size: u64) -> io::Result<()> {
        let ret = unsafe { libc::munmap(ptr.as_ptr().cast(), size as usize) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_domain(&self, handle: GemHandle, read_domains: u32, write_domain: u32) -> io::Result<()> {
        let mut args = GemSetDomainArgs {
            handle,
            read_domains,
            write_domain,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_SET_DOMAIN, &mut args) }
    }

    fn pread(&self, handle: GemHandle, offset: u64, out: &mut [u8]) -> io::Result<()> {
        let mut args = GemPreadArgs {
            handle,
            pad: 0,
            offset,
            size: out.len() as u64,
            data_ptr: out.as_mut_ptr() as u64,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_PREAD, &mut args) }
    }

    fn pwrite(&self, handle: GemHandle, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut args = GemPwriteArgs {
            handle,
            pad: 0,
            offset,
            size: data.len() as u64,
            data_ptr: data.as_ptr() as u64,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_PWRITE, &mut args) }
    }

    // ===========================================================================================
    // Residency & Synchronisation
    // ===========================================================================================

    fn busy(&self, handle: GemHandle) -> io::Result<bool> {
        let mut args = GemBusyArgs { handle, busy: 0 };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_BUSY, &mut args)?;
        }
        Ok(args.busy != 0)
    }

    fn madvise(&self, handle: GemHandle, advice: Madvise) -> bool {
        let mut args = GemMadviseArgs {
            handle,
            madv: match advice {
                Madvise::WillNeed => I915_MADV_WILLNEED,
                Madvise::DontNeed => I915_MADV_DONTNEED,
            },
            // A failed ioctl leaves the pages where they were.
            retained: 1,
        };
        if let Err(e) = unsafe { self.ioctl(DRM_IOCTL_I915_GEM_MADVISE, &mut args) } {
            log::debug!("madvise({handle}) failed: {e}");
        }
        args.retained != 0
    }

    fn wait(&self, handle: GemHandle, timeout_ns: i64) -> io::Result<()> {
        let mut args = GemWaitArgs {
            bo_handle: handle,
            flags: 0,
            timeout_ns,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_WAIT, &mut args) }
    }

    fn execbuffer(&self, exec: &mut ExecBuffer<'_>) -> io::Result<()> {
        let mut objects: Vec<GemExecObject2> = exec
            .objects
            .iter()
            .map(|obj| GemExecObject2 {
                handle: obj.handle,
                relocation_count: obj.relocs.len() as u32,
                relocs_ptr: obj.relocs.as_ptr() as u64,
                alignment: obj.alignment,
                offset: obj.offset,
                flags: obj.flags.bits(),
                rsvd1: obj.pad_to_size,
                rsvd2: 0,
            })
            .collect();

        let rsvd2 = match exec.in_fence {
            Some(fd) if exec.flags & (I915_EXEC_FENCE_IN | I915_EXEC_FENCE_SUBMIT) != 0 => {
                u64::from(fd.as_raw_fd() as u32)
            }
            _ => 0,
        };
        let mut args = GemExecbuffer2Args {
            buffers_ptr: objects.as_mut_ptr() as u64,
            buffer_count: objects.len() as u32,
            batch_len: exec.batch_len,
            flags: exec.flags,
            rsvd1: u64::from(exec.ctx_id),
            rsvd2,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_EXECBUFFER2_WR, &mut args)?;
        }

        for (obj, placed) in exec.objects.iter_mut().zip(&objects) {
            obj.offset = placed.offset;
        }
        if exec.flags & I915_EXEC_FENCE_OUT != 0 {
            let fd = (args.rsvd2 >> 32) as RawFd;
            // SAFETY: the kernel installed a new sync-file fd for this process.
            exec.out_fence = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        }
        Ok(())
    }

    fn pin(&self, handle: GemHandle, alignment: u64) -> io::Result<u64> {
        let mut args = GemPinArgs {
            handle,
            alignment,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_PIN, &mut args)?;
        }
        Ok(args.offset)
    }

    // ===========================================================================================
    // Contexts
    // ===========================================================================================

    fn context_create(&self) -> io::Result<u32> {
        let mut args = GemContextCreateArgs::default();
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_CREATE, &mut args)?;
        }
        Ok(args.ctx_id)
    }

    fn context_destroy(&self, ctx_id: u32) -> io::Result<()> {
        let mut args = GemContextDestroyArgs { ctx_id, pad: 0 };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_DESTROY, &mut args) }
    }

    fn context_get_param(&self, ctx_id: u32, param: u64) -> io::Result<u64> {
        let mut args = GemContextParamArgs {
            ctx_id,
            param,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_GETPARAM, &mut args)?;
        }
        Ok(args.value)
    }

    fn context_set_param(&self, ctx_id: u32, param: u64, value: u64) -> io::Result<()> {
        let mut args = GemContextParamArgs {
            ctx_id,
            size: 0,
            param,
            value,
        };
        unsafe { self.ioctl(DRM_IOCTL_I915_GEM_CONTEXT_SETPARAM, &mut args) }
    }

    // ===========================================================================================
    // Sharing
    // ===========================================================================================

    fn flink(&self, handle: GemHandle) -> io::Result<u32> {
        let mut args = GemFlinkArgs { handle, name: 0 };
        unsafe {
            self.ioctl(DRM_IOCTL_GEM_FLINK, &mut args)?;
        }
        Ok(args.name)
    }

    fn open_name(&self, name: u32) -> io::Result<(GemHandle, u64)> {
        let mut args = GemOpenArgs {
            name,
            ..Default::default()
        };
        unsafe {
            self.ioctl(DRM_IOCTL_GEM_OPEN, &mut args)?;
        }
        Ok((args.handle, args.size))
    }

    fn prime_handle_to_fd(&self, handle: GemHandle) -> io::Result<OwnedFd> {
        let mut args = PrimeHandleArgs {
            handle,
            flags: DRM_CLOEXEC | DRM_RDWR,
            fd: -1,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_PRIME_HANDLE_TO_FD, &mut args)?;
            Ok(OwnedFd::from_raw_fd(args.fd))
        }
    }

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> io::Result<GemHandle> {
        let mut args = PrimeHandleArgs {
            handle: 0,
            flags: 0,
            fd: fd.as_raw_fd(),
        };
        unsafe {
            self.ioctl(DRM_IOCTL_PRIME_FD_TO_HANDLE, &mut args)?;
        }
        Ok(args.handle)
    }

    // ===========================================================================================
    // Topology
    // ===========================================================================================

    fn query_engines(&self) -> io::Result<Vec<EngineInfo>> {
        // First pass sizes the blob, second pass fills it.
        let mut item = QueryItem {
            query_id: DRM_I915_QUERY_ENGINE_INFO,
            ..Default::default()
        };
        let mut args = QueryArgs {
            num_items: 1,
            flags: 0,
            items_ptr: &raw mut item as u64,
        };
        unsafe {
            self.ioctl(DRM_IOCTL_I915_QUERY, &mut args)?;
        }
        if item.length <= 0 {
            return Err(io::Error::from_raw_os_error(-item.length.min(-1)));
        }

        // u64 storage keeps the header and entries aligned.
        let len = item.length as usize;
        let mut blob = vec![0u64; len.div_ceil(size_of::<u64>())];
        item.data_ptr = blob.as_mut_ptr() as u64;
        args.items_ptr = &raw mut item as u64;
        unsafe {
            self.ioctl(DRM_IOCTL_I915_QUERY, &mut args)?;
        }
        if item.length <= 0 {
            return Err(io::Error::from_raw_os_error(-item.length.min(-1)));
        }

        let header = unsafe { ptr::read(blob.as_ptr().cast::<QueryEngineInfoHeader>()) };
        let count = (header.num_engines as usize)
            .min(len.saturating_sub(size_of::<QueryEngineInfoHeader>()) / size_of::<EngineInfoEntry>());
        let first = unsafe {
            blob.as_ptr()
                .cast::<u8>()
                .add(size_of::<QueryEngineInfoHeader>())
                .cast::<EngineInfoEntry>()
        };

        Ok((0..count)
            .map(|i| {
                let entry = unsafe { ptr::read_unaligned(first.add(i)) };
                EngineInfo {
                    class: EngineClass::from_raw(entry.engine.engine_class),
                    instance: entry.engine.engine_instance,
                }
            })
            .collect())
    }

    fn aperture_size(&self) -> io::Result<u64> {
        let mut args = GetApertureArgs::default();
        unsafe {
            self.ioctl(DRM_IOCTL_I915_GEM_GET_APERTURE, &mut args)?;
        }
        Ok(args.aper_size)
    }

    fn available_fences(&self) -> io::Result<u32> {
        let fences = self.get_param(I915_PARAM_NUM_FENCES_AVAIL)?;
        Ok(u32::try_from(fences).unwrap_or(0))
    }
}
