use crate::utils::{DRM_COMMAND_BASE, drm_ior, drm_iow, drm_iowr};

// ===============================================================================================
// DRM Core
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCloseArgs {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemFlinkArgs {
    pub handle: u32,
    pub name: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemOpenArgs {
    pub name: u32,
    pub handle: u32,
    pub size: u64,
}

pub const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
pub const DRM_RDWR: u32 = libc::O_RDWR as u32;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct PrimeHandleArgs {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

pub const DRM_IOCTL_GEM_CLOSE: u32 = drm_iow::<GemCloseArgs>(0x09);
pub const DRM_IOCTL_GEM_FLINK: u32 = drm_iowr::<GemFlinkArgs>(0x0a);
pub const DRM_IOCTL_GEM_OPEN: u32 = drm_iowr::<GemOpenArgs>(0x0b);
pub const DRM_IOCTL_PRIME_HANDLE_TO_FD: u32 = drm_iowr::<PrimeHandleArgs>(0x2d);
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: u32 = drm_iowr::<PrimeHandleArgs>(0x2e);

// ===============================================================================================
// Parameters & Aperture
// ===============================================================================================

pub const I915_PARAM_NUM_FENCES_AVAIL: i32 = 6;
pub const I915_PARAM_HAS_EXEC_SOFTPIN: i32 = 37;

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct GetParamArgs {
    pub param: i32,
    pub value: *mut i32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GetApertureArgs {
    pub aper_size: u64,
    pub aper_available_size: u64,
}

// ===============================================================================================
// Buffer Objects
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemCreateArgs {
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

pub const I915_USERPTR_READ_ONLY: u32 = 0x1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemUserptrArgs {
    pub user_ptr: u64,
    pub user_size: u64,
    pub flags: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemPinArgs {
    pub handle: u32,
    pub pad: u32,
    pub alignment: u64,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemPreadArgs {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub data_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemPwriteArgs {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub data_ptr: u64,
}

pub const I915_MMAP_WC: u64 = 0x1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemMmapArgs {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub addr_ptr: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemMmapGttArgs {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

pub const I915_GEM_DOMAIN_CPU: u32 = 0x0000_0001;
pub const I915_GEM_DOMAIN_RENDER: u32 = 0x0000_0002;
pub const I915_GEM_DOMAIN_SAMPLER: u32 = 0x0000_0004;
pub const I915_GEM_DOMAIN_COMMAND: u32 = 0x0000_0008;
pub const I915_GEM_DOMAIN_INSTRUCTION: u32 = 0x0000_0010;
pub const I915_GEM_DOMAIN_VERTEX: u32 = 0x0000_0020;
pub const I915_GEM_DOMAIN_GTT: u32 = 0x0000_0040;
pub const I915_GEM_DOMAIN_WC: u32 = 0x0000_0080;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemSetDomainArgs {
    pub handle: u32,
    pub read_domains: u32,
    pub write_domain: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemBusyArgs {
    pub handle: u32,
    pub busy: u32,
}

pub const I915_TILING_NONE: u32 = 0;
pub const I915_TILING_X: u32 = 1;
pub const I915_TILING_Y: u32 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemSetTilingArgs {
    pub handle: u32,
    pub tiling_mode: u32,
    pub stride: u32,
    pub swizzle_mode: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemGetTilingArgs {
    pub handle: u32,
    pub tiling_mode: u32,
    pub swizzle_mode: u32,
    pub phys_swizzle_mode: u32,
}

pub const I915_MADV_WILLNEED: u32 = 0;
pub const I915_MADV_DONTNEED: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemMadviseArgs {
    pub handle: u32,
    pub madv: u32,
    pub retained: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemWaitArgs {
    pub bo_handle: u32,
    pub flags: u32,
    pub timeout_ns: i64,
}

// ===============================================================================================
// Execution
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemRelocationEntry {
    pub target_handle: u32,
    pub delta: u32,
    pub offset: u64,
    pub presumed_offset: u64,
    pub read_domains: u32,
    pub write_domain: u32,
}

pub const EXEC_OBJECT_NEEDS_FENCE: u64 = 1 << 0;
pub const EXEC_OBJECT_NEEDS_GTT: u64 = 1 << 1;
pub const EXEC_OBJECT_WRITE: u64 = 1 << 2;
pub const EXEC_OBJECT_SUPPORTS_48B_ADDRESS: u64 = 1 << 3;
pub const EXEC_OBJECT_PINNED: u64 = 1 << 4;
pub const EXEC_OBJECT_PAD_TO_SIZE: u64 = 1 << 5;
pub const EXEC_OBJECT_ASYNC: u64 = 1 << 6;
pub const EXEC_OBJECT_CAPTURE: u64 = 1 << 7;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemExecObject2 {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,
    pub offset: u64,
    pub flags: u64,
    /// `pad_to_size` when `EXEC_OBJECT_PAD_TO_SIZE` is set.
    pub rsvd1: u64,
    pub rsvd2: u64,
}

pub const I915_EXEC_DEFAULT: u64 = 0;
pub const I915_EXEC_RENDER: u64 = 1;
pub const I915_EXEC_BSD: u64 = 2;
pub const I915_EXEC_BLT: u64 = 3;
pub const I915_EXEC_VEBOX: u64 = 4;
pub const I915_EXEC_RING_MASK: u64 = 0x3f;
pub const I915_EXEC_NO_RELOC: u64 = 1 << 11;
pub const I915_EXEC_HANDLE_LUT: u64 = 1 << 12;
pub const I915_EXEC_FENCE_IN: u64 = 1 << 16;
pub const I915_EXEC_FENCE_OUT: u64 = 1 << 17;
pub const I915_EXEC_FENCE_SUBMIT: u64 = 1 << 20;
pub const I915_EXEC_CONTEXT_ID_MASK: u64 = 0xffff_ffff;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemExecbuffer2Args {
    pub buffers_ptr: u64,
    pub buffer_count: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub dr1: u32,
    pub dr4: u32,
    pub num_cliprects: u32,
    pub cliprects_ptr: u64,
    pub flags: u64,
    /// Context id.
    pub rsvd1: u64,
    /// Sync-file fds: the in-fence in the low half, the out-fence in the high half.
    pub rsvd2: u64,
}

// ===============================================================================================
// Contexts
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemContextCreateArgs {
    pub ctx_id: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemContextDestroyArgs {
    pub ctx_id: u32,
    pub pad: u32,
}

pub const I915_CONTEXT_PARAM_BAN_PERIOD: u64 = 0x1;
pub const I915_CONTEXT_PARAM_NO_ZEROMAP: u64 = 0x2;
pub const I915_CONTEXT_PARAM_GTT_SIZE: u64 = 0x3;
pub const I915_CONTEXT_PARAM_NO_ERROR_CAPTURE: u64 = 0x4;
pub const I915_CONTEXT_PARAM_BANNABLE: u64 = 0x5;
pub const I915_CONTEXT_PARAM_PRIORITY: u64 = 0x6;
pub const I915_CONTEXT_PARAM_RECOVERABLE: u64 = 0x8;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct GemContextParamArgs {
    pub ctx_id: u32,
    pub size: u32,
    pub param: u64,
    pub value: u64,
}

// ===============================================================================================
// Engine Query
// ===============================================================================================

pub const DRM_I915_QUERY_ENGINE_INFO: u64 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct QueryItem {
    pub query_id: u64,
    pub length: i32,
    pub flags: u32,
    pub data_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct QueryArgs {
    pub num_items: u32,
    pub flags: u32,
    pub items_ptr: u64,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EngineClassInstance {
    pub engine_class: u16,
    pub engine_instance: u16,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct EngineInfoEntry {
    pub engine: EngineClassInstance,
    pub rsvd0: u32,
    pub flags: u64,
    pub capabilities: u64,
    pub logical_instance: u16,
    pub rsvd1: [u16; 3],
    pub rsvd2: [u64; 3],
}

/// Header of the `DRM_I915_QUERY_ENGINE_INFO` blob; `num_engines` entries follow.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct QueryEngineInfoHeader {
    pub num_engines: u32,
    pub rsvd: [u32; 3],
}

pub const I915_ENGINE_CLASS_RENDER: u16 = 0;
pub const I915_ENGINE_CLASS_COPY: u16 = 1;
pub const I915_ENGINE_CLASS_VIDEO: u16 = 2;
pub const I915_ENGINE_CLASS_VIDEO_ENHANCE: u16 = 3;
pub const I915_ENGINE_CLASS_COMPUTE: u16 = 4;

const _: () = assert!(std::mem::size_of::<GemExecObject2>() == 56);
const _: () = assert!(std::mem::size_of::<GemRelocationEntry>() == 32);
const _: () = assert!(std::mem::size_of::<GemExecbuffer2Args>() == 64);
const _: () = assert!(std::mem::size_of::<EngineInfoEntry>() == 56);

// ===============================================================================================
// IOCTL Definitions
// ===============================================================================================

const fn i915(nr: u32) -> u32 {
    DRM_COMMAND_BASE + nr
}

pub const DRM_IOCTL_I915_GETPARAM: u32 = drm_iowr::<GetParamArgs>(i915(0x06));
pub const DRM_IOCTL_I915_GEM_PIN: u32 = drm_iowr::<GemPinArgs>(i915(0x15));
pub const DRM_IOCTL_I915_GEM_BUSY: u32 = drm_iowr::<GemBusyArgs>(i915(0x17));
pub const DRM_IOCTL_I915_GEM_CREATE: u32 = drm_iowr::<GemCreateArgs>(i915(0x1b));
pub const DRM_IOCTL_I915_GEM_PREAD: u32 = drm_iow::<GemPreadArgs>(i915(0x1c));
pub const DRM_IOCTL_I915_GEM_PWRITE: u32 = drm_iow::<GemPwriteArgs>(i915(0x1d));
pub const DRM_IOCTL_I915_GEM_MMAP: u32 = drm_iowr::<GemMmapArgs>(i915(0x1e));
pub const DRM_IOCTL_I915_GEM_SET_DOMAIN: u32 = drm_iow::<GemSetDomainArgs>(i915(0x1f));
pub const DRM_IOCTL_I915_GEM_SET_TILING: u32 = drm_iowr::<GemSetTilingArgs>(i915(0x21));
pub const DRM_IOCTL_I915_GEM_GET_TILING: u32 = drm_iowr::<GemGetTilingArgs>(i915(0x22));
pub const DRM_IOCTL_I915_GEM_GET_APERTURE: u32 = drm_ior::<GetApertureArgs>(i915(0x23));
pub const DRM_IOCTL_I915_GEM_MMAP_GTT: u32 = drm_iowr::<GemMmapGttArgs>(i915(0x24));
pub const DRM_IOCTL_I915_GEM_MADVISE: u32 = drm_iowr::<GemMadviseArgs>(i915(0x26));
pub const DRM_IOCTL_I915_GEM_EXECBUFFER2_WR: u32 = drm_iowr::<GemExecbuffer2Args>(i915(0x29));
pub const DRM_IOCTL_I915_GEM_WAIT: u32 = drm_iowr::<GemWaitArgs>(i915(0x2c));
pub const DRM_IOCTL_I915_GEM_CONTEXT_CREATE: u32 =
    drm_iowr::<GemContextCreateArgs>(i915(0x2d));
pub const DRM_IOCTL_I915_GEM_CONTEXT_DESTROY: u32 =
    drm_iow::<GemContextDestroyArgs>(i915(0x2e));
pub const DRM_IOCTL_I915_GEM_USERPTR: u32 = drm_iowr::<GemUserptrArgs>(i915(0x33));
pub const DRM_IOCTL_I915_GEM_CONTEXT_GETPARAM: u32 = drm_iowr::<GemContextParamArgs>(i915(0x34));
pub const DRM_IOCTL_I915_GEM_CONTEXT_SETPARAM: u32 = drm_iowr::<GemContextParamArgs>(i915(0x35));
pub const DRM_IOCTL_I915_QUERY: u32 = drm_iowr::<QueryArgs>(i915(0x39));
