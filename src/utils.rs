#![allow(clippy::cast_possible_truncation)]

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

/// `'d'`, the DRM ioctl type.
pub const DRM_IOCTL_BASE: u32 = 0x64;
/// First driver-private ioctl number.
pub const DRM_COMMAND_BASE: u32 = 0x40;

pub const PAGE_SIZE: u64 = 4096;

#[must_use]
const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | (DRM_IOCTL_BASE << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

#[must_use]
pub const fn drm_ior<T>(nr: u32) -> u32 {
    ioc(IOC_READ, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn drm_iow<T>(nr: u32) -> u32 {
    ioc(IOC_WRITE, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn drm_iowr<T>(nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, nr, std::mem::size_of::<T>())
}

/// Rounds `val` up to a multiple of `align`, which must be a power of two.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// Rounds `val` up to a multiple of `unit`, which need not be a power of two.
#[must_use]
pub const fn round_up_to(val: u64, unit: u64) -> u64 {
    val.div_ceil(unit) * unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_drm_requests() {
        // DRM_IOCTL_GEM_CLOSE is _IOW('d', 0x09, struct { u32, u32 })
        assert_eq!(drm_iow::<[u32; 2]>(0x09), 0x4008_6409);
        // DRM_IOCTL_GEM_FLINK is _IOWR('d', 0x0a, struct { u32, u32 })
        assert_eq!(drm_iowr::<[u32; 2]>(0x0a), 0xc008_640a);
    }

    #[test]
    fn rounds() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(round_up_to(100, 48), 144);
        assert_eq!(round_up_to(0, 48), 0);
    }
}
