use crate::bufmgr::manager::{BufferManager, Shared};
use crate::drm::ioctl::{
    I915_CONTEXT_PARAM_BAN_PERIOD, I915_CONTEXT_PARAM_BANNABLE, I915_CONTEXT_PARAM_GTT_SIZE,
    I915_CONTEXT_PARAM_NO_ERROR_CAPTURE, I915_CONTEXT_PARAM_NO_ZEROMAP,
    I915_CONTEXT_PARAM_PRIORITY, I915_CONTEXT_PARAM_RECOVERABLE,
};
use crate::error::BufmgrResult;
use std::fmt;
use std::sync::Arc;

/// Context parameters understood by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextParam {
    BanPeriod,
    NoZeromap,
    /// Size of the context's address space. Read-only.
    GttSize,
    NoErrorCapture,
    Bannable,
    Priority,
    Recoverable,
    /// A parameter id not listed above.
    Raw(u64),
}

impl ContextParam {
    #[must_use]
    pub const fn raw(self) -> u64 {
        match self {
            Self::BanPeriod => I915_CONTEXT_PARAM_BAN_PERIOD,
            Self::NoZeromap => I915_CONTEXT_PARAM_NO_ZEROMAP,
            Self::GttSize => I915_CONTEXT_PARAM_GTT_SIZE,
            Self::NoErrorCapture => I915_CONTEXT_PARAM_NO_ERROR_CAPTURE,
            Self::Bannable => I915_CONTEXT_PARAM_BANNABLE,
            Self::Priority => I915_CONTEXT_PARAM_PRIORITY,
            Self::Recoverable => I915_CONTEXT_PARAM_RECOVERABLE,
            Self::Raw(raw) => raw,
        }
    }
}

/// A hardware context. Destroyed when dropped.
pub struct GpuContext {
    mgr: Arc<Shared>,
    ctx_id: u32,
}

impl GpuContext {
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.ctx_id
    }

    pub(crate) fn belongs_to(&self, mgr: &Arc<Shared>) -> bool {
        Arc::ptr_eq(&self.mgr, mgr)
    }

    /// # Errors
    /// Propagates the kernel error.
    pub fn get_param(&self, param: ContextParam) -> BufmgrResult<u64> {
        Ok(self.mgr.device.context_get_param(self.ctx_id, param.raw())?)
    }

    /// # Errors
    /// Propagates the kernel error.
    pub fn set_param(&self, param: ContextParam, value: u64) -> BufmgrResult<()> {
        self.mgr
            .device
            .context_set_param(self.ctx_id, param.raw(), value)?;
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if let Err(e) = self.mgr.device.context_destroy(self.ctx_id) {
            log::warn!("failed to destroy context {}: {e}", self.ctx_id);
        }
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext").field("id", &self.ctx_id).finish()
    }
}

impl BufferManager {
    /// Creates a hardware context with its own GPU state.
    ///
    /// # Errors
    /// Propagates the kernel error.
    pub fn create_context(&self) -> BufmgrResult<GpuContext> {
        let ctx_id = self.shared.device.context_create()?;
        log::debug!("created context {ctx_id}");
        Ok(GpuContext {
            mgr: Arc::clone(&self.shared),
            ctx_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufmgr::manager::ManagerConfig;
    use crate::bufmgr::mock::mock_manager;

    #[test]
    fn params_round_trip_and_drop_destroys() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let ctx = mgr.create_context().unwrap();
        let other = mgr.create_context().unwrap();
        assert_ne!(ctx.id(), other.id());

        ctx.set_param(ContextParam::Priority, 512).unwrap();
        assert_eq!(ctx.get_param(ContextParam::Priority).unwrap(), 512);
        assert_eq!(other.get_param(ContextParam::Priority).unwrap(), 0);
        assert_eq!(ctx.get_param(ContextParam::Raw(0x99)).unwrap(), 0);

        let id = ctx.id();
        drop(ctx);
        assert_eq!(device.destroyed_contexts(), vec![id]);
    }

    #[test]
    fn raw_params_pass_through() {
        assert_eq!(ContextParam::Raw(0x42).raw(), 0x42);
        assert_eq!(ContextParam::GttSize.raw(), I915_CONTEXT_PARAM_GTT_SIZE);
    }
}
