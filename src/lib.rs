//! Userspace buffer and command-submission manager for i915 GEM devices.

pub mod bufmgr;
pub mod drm;
pub mod error;
pub mod utils;

pub use bufmgr::{BufferManager, BufferObject, ManagerConfig};
pub use error::{BufmgrError, BufmgrResult};
