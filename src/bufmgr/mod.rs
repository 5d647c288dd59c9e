pub mod aperture;
pub mod batch;
pub mod bo;
pub mod cache;
pub mod context;
pub mod exec;
pub mod manager;
pub mod reloc;
pub mod softpin;
pub mod vma;

#[cfg(test)]
pub(crate) mod mock;

use crate::drm::ioctl::{
    EXEC_OBJECT_ASYNC, EXEC_OBJECT_CAPTURE, EXEC_OBJECT_NEEDS_FENCE, EXEC_OBJECT_PAD_TO_SIZE,
    EXEC_OBJECT_PINNED, EXEC_OBJECT_SUPPORTS_48B_ADDRESS, EXEC_OBJECT_WRITE, GemRelocationEntry,
    I915_ENGINE_CLASS_COMPUTE, I915_ENGINE_CLASS_COPY, I915_ENGINE_CLASS_RENDER,
    I915_ENGINE_CLASS_VIDEO, I915_ENGINE_CLASS_VIDEO_ENHANCE, I915_TILING_NONE, I915_TILING_X,
    I915_TILING_Y,
};
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::Arc;

/// Kernel GEM handle.
pub type GemHandle = u32;

/// Memory layout applied to a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tiling {
    #[default]
    None,
    X,
    Y,
}

impl Tiling {
    #[must_use]
    pub const fn to_raw(self) -> u32 {
        match self {
            Self::None => I915_TILING_NONE,
            Self::X => I915_TILING_X,
            Self::Y => I915_TILING_Y,
        }
    }

    /// Unknown kernel modes are reported as linear.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            I915_TILING_X => Self::X,
            I915_TILING_Y => Self::Y,
            _ => Self::None,
        }
    }
}

/// Tiling state as applied by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TilingState {
    pub mode: Tiling,
    pub swizzle: u32,
    pub stride: u32,
}

/// The three independent CPU mapping kinds of a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapKind {
    /// Cached CPU mapping.
    Cpu,
    /// Write-combined CPU mapping.
    Wc,
    /// Mapping through the GPU aperture.
    Gtt,
}

impl MapKind {
    pub const ALL: [Self; 3] = [Self::Cpu, Self::Wc, Self::Gtt];

    pub(crate) const fn slot(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Wc => 1,
            Self::Gtt => 2,
        }
    }
}

/// Residency advice given to the kernel for cached buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Madvise {
    WillNeed,
    DontNeed,
}

bitflags::bitflags! {
    /// Per-object flags of a validation list entry.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ExecObjectFlags: u64 {
        /// Object needs a fence register.
        const NEEDS_FENCE = EXEC_OBJECT_NEEDS_FENCE;
        /// Object is written by the batch.
        const WRITE = EXEC_OBJECT_WRITE;
        /// Object may be placed above 4 GiB.
        const SUPPORTS_48B_ADDRESS = EXEC_OBJECT_SUPPORTS_48B_ADDRESS;
        /// Object lives at a caller-chosen address.
        const PINNED = EXEC_OBJECT_PINNED;
        /// Object is padded to `pad_to_size` in the address space.
        const PAD_TO_SIZE = EXEC_OBJECT_PAD_TO_SIZE;
        /// Skip implicit synchronisation on this object.
        const ASYNC = EXEC_OBJECT_ASYNC;
        /// Include the object in error captures.
        const CAPTURE = EXEC_OBJECT_CAPTURE;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineClass {
    Render,
    Copy,
    Video,
    VideoEnhance,
    Compute,
    Other(u16),
}

impl EngineClass {
    #[must_use]
    pub const fn from_raw(raw: u16) -> Self {
        match raw {
            I915_ENGINE_CLASS_RENDER => Self::Render,
            I915_ENGINE_CLASS_COPY => Self::Copy,
            I915_ENGINE_CLASS_VIDEO => Self::Video,
            I915_ENGINE_CLASS_VIDEO_ENHANCE => Self::VideoEnhance,
            I915_ENGINE_CLASS_COMPUTE => Self::Compute,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    pub class: EngineClass,
    pub instance: u16,
}

/// One object of a kernel submission.
#[derive(Debug, Clone)]
pub struct ExecObject<'a> {
    pub handle: GemHandle,
    pub relocs: &'a [GemRelocationEntry],
    pub alignment: u64,
    /// Presumed offset on input, placed offset on output.
    pub offset: u64,
    pub flags: ExecObjectFlags,
    pub pad_to_size: u64,
}

/// A kernel submission: the validation list plus batch parameters.
#[derive(Debug, Default)]
pub struct ExecBuffer<'a> {
    /// Validation list; the batches are the last objects.
    pub objects: Vec<ExecObject<'a>>,
    /// Bytes of the batch to run; 0 runs each batch up to its end marker.
    pub batch_len: u32,
    pub ctx_id: u32,
    pub flags: u64,
    /// Sync file to wait on, with `I915_EXEC_FENCE_IN` or `I915_EXEC_FENCE_SUBMIT` set.
    pub in_fence: Option<BorrowedFd<'a>>,
    /// Filled by the device when `I915_EXEC_FENCE_OUT` is set.
    pub out_fence: Option<OwnedFd>,
}

/// The kernel primitives the buffer manager is built on.
///
/// `DrmDevice` implements this over a DRM render node. All methods take `&self`;
/// implementations must be usable from several threads at once.
pub trait GemDevice: Send + Sync {
    /// Create a buffer object of exactly `size` bytes.
    fn create(&self, size: u64) -> io::Result<GemHandle>;

    /// Release a kernel handle.
    fn close(&self, handle: GemHandle) -> io::Result<()>;

    /// Wrap user memory in a buffer object.
    ///
    /// `ptr` must stay valid for `size` bytes until the handle is closed.
    fn userptr(&self, ptr: NonNull<u8>, size: u64, read_only: bool) -> io::Result<GemHandle>;

    /// Apply a tiling layout; returns the layout the kernel actually applied.
    fn set_tiling(&self, handle: GemHandle, mode: Tiling, stride: u32) -> io::Result<TilingState>;

    fn get_tiling(&self, handle: GemHandle) -> io::Result<(Tiling, u32)>;

    /// Create a process-local mapping of `size` bytes.
    fn mmap(&self, handle: GemHandle, size: u64, kind: MapKind) -> io::Result<NonNull<u8>>;

    fn munmap(&self, ptr: NonNull<u8>, size: u64) -> io::Result<()>;

    /// Move the object into the given memory domains, waiting for the GPU as needed.
    fn set_domain(&self, handle: GemHandle, read_domains: u32, write_domain: u32) -> io::Result<()>;

    fn pread(&self, handle: GemHandle, offset: u64, out: &mut [u8]) -> io::Result<()>;

    fn pwrite(&self, handle: GemHandle, offset: u64, data: &[u8]) -> io::Result<()>;

    fn busy(&self, handle: GemHandle) -> io::Result<bool>;

    /// Returns whether the backing pages are still retained.
    fn madvise(&self, handle: GemHandle, advice: Madvise) -> bool;

    /// Wait for the object to become idle. A negative timeout waits forever.
    fn wait(&self, handle: GemHandle, timeout_ns: i64) -> io::Result<()>;

    /// Submit a batch. On success the kernel writes placed offsets back into `exec.objects`.
    fn execbuffer(&self, exec: &mut ExecBuffer<'_>) -> io::Result<()>;

    /// Pin the object into the aperture and return its offset.
    fn pin(&self, handle: GemHandle, alignment: u64) -> io::Result<u64>;

    fn context_create(&self) -> io::Result<u32>;

    fn context_destroy(&self, ctx_id: u32) -> io::Result<()>;

    fn context_get_param(&self, ctx_id: u32, param: u64) -> io::Result<u64>;

    fn context_set_param(&self, ctx_id: u32, param: u64, value: u64) -> io::Result<()>;

    /// Give the object a global name.
    fn flink(&self, handle: GemHandle) -> io::Result<u32>;

    /// Open a globally named object; returns its handle and size.
    fn open_name(&self, name: u32) -> io::Result<(GemHandle, u64)>;

    fn prime_handle_to_fd(&self, handle: GemHandle) -> io::Result<OwnedFd>;

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> io::Result<GemHandle>;

    fn query_engines(&self) -> io::Result<Vec<EngineInfo>>;

    /// Total size of the GPU aperture in bytes.
    fn aperture_size(&self) -> io::Result<u64>;

    /// Number of fence registers available to userspace.
    fn available_fences(&self) -> io::Result<u32>;
}

impl<T: GemDevice + ?Sized> GemDevice for Arc<T> {
    fn create(&self, size: u64) -> io::Result<GemHandle> {
        (**self).create(size)
    }

    fn close(&self, handle: GemHandle) -> io::Result<()> {
        (**self).close(handle)
    }

    fn userptr(&self, ptr: NonNull<u8>, size: u64, read_only: bool) -> io::Result<GemHandle> {
        (**self).userptr(ptr, size, read_only)
    }

    fn set_tiling(&self, handle: GemHandle, mode: Tiling, stride: u32) -> io::Result<TilingState> {
        (**self).set_tiling(handle, mode, stride)
    }

    fn get_tiling(&self, handle: GemHandle) -> io::Result<(Tiling, u32)> {
        (**self).get_tiling(handle)
    }

    fn mmap(&self, handle: GemHandle, size: u64, kind: MapKind) -> io::Result<NonNull<u8>> {
        (**self).mmap(handle, size, kind)
    }

    fn munmap(&self, ptr: NonNull<u8>, size: u64) -> io::Result<()> {
        (**self).munmap(ptr, size)
    }

    fn set_domain(&self, handle: GemHandle, read_domains: u32, write_domain: u32) -> io::Result<()> {
        (**self).set_domain(handle, read_domains, write_domain)
    }

    fn pread(&self, handle: GemHandle, offset: u64, out: &mut [u8]) -> io::Result<()> {
        (**self).pread(handle, offset, out)
    }

    fn pwrite(&self, handle: GemHandle, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).pwrite(handle, offset, data)
    }

    fn busy(&self, handle: GemHandle) -> io::Result<bool> {
        (**self).busy(handle)
    }

    fn madvise(&self, handle: GemHandle, advice: Madvise) -> bool {
        (**self).madvise(handle, advice)
    }

    fn wait(&self, handle: GemHandle, timeout_ns: i64) -> io::Result<()> {
        (**self).wait(handle, timeout_ns)
    }

    fn execbuffer(&self, exec: &mut ExecBuffer<'_>) -> io::Result<()> {
        (**self).execbuffer(exec)
    }

    fn pin(&self, handle: GemHandle, alignment: u64) -> io::Result<u64> {
        (**self).pin(handle, alignment)
    }

    fn context_create(&self) -> io::Result<u32> {
        (**self).context_create()
    }

    fn context_destroy(&self, ctx_id: u32) -> io::Result<()> {
        (**self).context_destroy(ctx_id)
    }

    fn context_get_param(&self, ctx_id: u32, param: u64) -> io::Result<u64> {
        (**self).context_get_param(ctx_id, param)
    }

    fn context_set_param(&self, ctx_id: u32, param: u64, value: u64) -> io::Result<()> {
        (**self).context_set_param(ctx_id, param, value)
    }

    fn flink(&self, handle: GemHandle) -> io::Result<u32> {
        (**self).flink(handle)
    }

    fn open_name(&self, name: u32) -> io::Result<(GemHandle, u64)> {
        (**self).open_name(name)
    }

    fn prime_handle_to_fd(&self, handle: GemHandle) -> io::Result<OwnedFd> {
        (**self).prime_handle_to_fd(handle)
    }

    fn prime_fd_to_handle(&self, fd: BorrowedFd<'_>) -> io::Result<GemHandle> {
        (**self).prime_fd_to_handle(fd)
    }

    fn query_engines(&self) -> io::Result<Vec<EngineInfo>> {
        (**self).query_engines()
    }

    fn aperture_size(&self) -> io::Result<u64> {
        (**self).aperture_size()
    }

    fn available_fences(&self) -> io::Result<u32> {
        (**self).available_fences()
    }
}

// Re-export the main manager for easy access
pub use batch::BatchBuffer;
pub use bo::{BoId, BufferObject};
pub use context::{ContextParam, GpuContext};
pub use exec::{ExecFlags, ExecState, Ring};
pub use manager::{AllocHints, BufferManager, ManagerConfig};
