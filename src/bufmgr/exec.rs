use crate::bufmgr::aperture::{compute_batch_space, estimate_batch_space};
use crate::bufmgr::bo::{BoId, BufferObject};
use crate::bufmgr::context::GpuContext;
use crate::bufmgr::manager::{BufferManager, ManagerState, Shared};
use crate::bufmgr::reloc::ValidationList;
use crate::bufmgr::{EngineClass, ExecBuffer, ExecObject};
use crate::drm::ioctl::{
    I915_EXEC_BLT, I915_EXEC_BSD, I915_EXEC_DEFAULT, I915_EXEC_FENCE_IN, I915_EXEC_FENCE_OUT,
    I915_EXEC_FENCE_SUBMIT, I915_EXEC_NO_RELOC, I915_EXEC_RENDER, I915_EXEC_VEBOX,
};
use crate::error::{BufmgrError, BufmgrResult};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU8, Ordering};

/// Engine a batch is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ring {
    /// Whatever the kernel picks, normally render.
    #[default]
    Default,
    Render,
    /// Video decode/encode.
    Bsd,
    /// Blitter.
    Blt,
    /// Video enhancement.
    Vebox,
}

impl Ring {
    const fn raw(self) -> u64 {
        match self {
            Self::Default => I915_EXEC_DEFAULT,
            Self::Render => I915_EXEC_RENDER,
            Self::Bsd => I915_EXEC_BSD,
            Self::Blt => I915_EXEC_BLT,
            Self::Vebox => I915_EXEC_VEBOX,
        }
    }

    const fn engine_class(self) -> Option<EngineClass> {
        match self {
            Self::Default => None,
            Self::Render => Some(EngineClass::Render),
            Self::Bsd => Some(EngineClass::Video),
            Self::Blt => Some(EngineClass::Copy),
            Self::Vebox => Some(EngineClass::VideoEnhance),
        }
    }
}

/// Submission flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecFlags {
    pub ring: Ring,
    /// Presumed offsets are trusted; the kernel skips relocation when nothing moved.
    pub no_reloc: bool,
    /// Return a sync file signalled when the submission completes.
    pub fence_out: bool,
    /// The in-fence gates submission only, not execution.
    pub fence_submit: bool,
}

impl ExecFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn ring(mut self, ring: Ring) -> Self {
        self.ring = ring;
        self
    }

    #[must_use]
    pub const fn no_reloc(mut self) -> Self {
        self.no_reloc = true;
        self
    }

    #[must_use]
    pub const fn fence_out(mut self) -> Self {
        self.fence_out = true;
        self
    }

    #[must_use]
    pub const fn fence_submit(mut self) -> Self {
        self.fence_submit = true;
        self
    }

    const fn raw(self, has_in_fence: bool) -> u64 {
        let mut flags = self.ring.raw();
        if self.no_reloc {
            flags |= I915_EXEC_NO_RELOC;
        }
        if has_in_fence {
            flags |= if self.fence_submit {
                I915_EXEC_FENCE_SUBMIT
            } else {
                I915_EXEC_FENCE_IN
            };
        }
        if self.fence_out {
            flags |= I915_EXEC_FENCE_OUT;
        }
        flags
    }
}

/// Progress of the submission currently holding the manager lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExecState {
    #[default]
    Idle = 0,
    BuildingList = 1,
    Submitted = 2,
    Retiring = 3,
}

impl ExecState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::BuildingList,
            2 => Self::Submitted,
            3 => Self::Retiring,
            _ => Self::Idle,
        }
    }
}

/// Lock-free view of [`ExecState`].
#[derive(Debug, Default)]
pub(crate) struct ExecTracker(AtomicU8);

impl ExecTracker {
    pub(crate) fn get(&self) -> ExecState {
        ExecState::from_raw(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ExecState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Shared {
    fn check_engine(&self, ring: Ring) -> BufmgrResult<()> {
        let Some(class) = ring.engine_class() else {
            return Ok(());
        };
        // No engine list means the kernel could not be asked; let it decide.
        if self.engines.is_empty() || self.engines.iter().any(|e| e.class == class) {
            return Ok(());
        }
        Err(BufmgrError::InvalidCombination("engine not present on this device"))
    }

    /// Builds one validation list for `roots` and submits it, all under the manager lock.
    pub(crate) fn submit(
        &self,
        roots: &[&BufferObject],
        sub: Submission<'_>,
    ) -> BufmgrResult<Option<OwnedFd>> {
        if roots.iter().any(|bo| bo.is_poisoned()) {
            return Err(BufmgrError::OutOfMemory);
        }
        self.check_engine(sub.flags.ring)?;

        let ids: Vec<BoId> = roots.iter().map(|bo| bo.id).collect();
        let mut state = self.lock();
        let result = self.submit_locked(&mut state, &ids, sub);
        self.exec_state.set(ExecState::Idle);
        result
    }

    fn submit_locked(
        &self,
        state: &mut ManagerState,
        roots: &[BoId],
        sub: Submission<'_>,
    ) -> BufmgrResult<Option<OwnedFd>> {
        self.exec_state.set(ExecState::BuildingList);
        let list = ValidationList::build_many(&state.arena, roots);
        list.dump(&state.arena);

        // A poisoned target makes every batch above it unusable.
        if let Some(bad) = list.ids().find(|&id| state.arena[id].is_poisoned()) {
            log::debug!(
                "bo {} ({}) is poisoned, submission refused",
                state.arena[bad].handle,
                state.arena[bad].name
            );
            for &root in roots {
                state.arena[root].poison();
            }
            return Err(BufmgrError::OutOfMemory);
        }

        if self.config.check_aperture_on_exec {
            self.check_aperture_locked(&mut state.arena, roots)?;
        }

        let submitted = {
            let mut exec = ExecBuffer {
                objects: list
                    .entries
                    .iter()
                    .map(|item| {
                        let entry = &state.arena[item.id];
                        ExecObject {
                            handle: entry.handle,
                            relocs: &entry.graph.relocs,
                            alignment: entry.align,
                            offset: entry.offset,
                            flags: item.flags,
                            pad_to_size: entry.pad_to_size,
                        }
                    })
                    .collect(),
                batch_len: sub.batch_len,
                ctx_id: sub.ctx_id,
                flags: sub.flags.raw(sub.in_fence.is_some()),
                in_fence: sub.in_fence,
                out_fence: None,
            };

            self.exec_state.set(ExecState::Submitted);
            self.device.execbuffer(&mut exec).map(|()| {
                let placed: Vec<u64> = exec.objects.iter().map(|o| o.offset).collect();
                (placed, exec.out_fence.take())
            })
        };

        let (placed, out_fence) = match submitted {
            Ok(done) => done,
            Err(e) => {
                let err = BufmgrError::from_exec(e);
                if matches!(err, BufmgrError::AddressSpaceExhausted) {
                    let ids: Vec<BoId> = list.ids().collect();
                    log::debug!(
                        "execbuffer fails to pin. estimate {}, actual {}, available {}",
                        estimate_batch_space(&state.arena, &ids),
                        compute_batch_space(&mut state.arena, &ids),
                        self.aperture_size
                    );
                } else {
                    log::warn!("execbuffer of {} objects failed: {err}", list.len());
                }
                return Err(err);
            }
        };

        self.exec_state.set(ExecState::Retiring);
        for (item, offset) in list.entries.iter().zip(placed) {
            let entry = &mut state.arena[item.id];
            if entry.offset != offset {
                if entry.softpin {
                    log::warn!(
                        "pinned bo {} ({}) moved from {:#x} to {offset:#x}",
                        entry.handle,
                        entry.name,
                        entry.offset
                    );
                }
                log::debug!(
                    "bo {} ({}) migrated: {:#x} -> {offset:#x}",
                    entry.handle,
                    entry.name,
                    entry.offset
                );
                entry.offset = offset;
            }
            entry.idle = false;
        }

        // All edges go first so the cascade below never meets a listed object mid-detach.
        let released: Vec<BoId> = list
            .ids()
            .flat_map(|id| state.detach_edges(id, 0))
            .collect();
        let now = self.now();
        self.release_refs(state, &released, now);
        Ok(out_fence)
    }
}

/// Parameters of one kernel submission besides its objects.
pub(crate) struct Submission<'f> {
    pub batch_len: u32,
    pub ctx_id: u32,
    pub flags: ExecFlags,
    pub in_fence: Option<BorrowedFd<'f>>,
}

impl BufferObject {
    /// Submits this object as a batch buffer of `used` bytes on the default context.
    ///
    /// On success every object in the batch is marked busy and all relocation and
    /// softpin edges of the batch are dropped. On failure the edges are kept so the
    /// submission can be retried.
    ///
    /// # Errors
    /// `OutOfMemory` if the batch or anything it references is poisoned, `InvalidCombination`
    /// for an engine the device lacks, `AddressSpaceExhausted` if the batch does not fit,
    /// and `DeviceBusyOrLost` for a hung or busy GPU.
    pub fn exec(&self, used: u32, flags: ExecFlags) -> BufmgrResult<()> {
        let sub = Submission {
            batch_len: used,
            ctx_id: 0,
            flags,
            in_fence: None,
        };
        self.mgr.submit(&[self], sub).map(drop)
    }

    /// Like [`BufferObject::exec`], on a hardware context.
    ///
    /// # Errors
    /// See [`BufferObject::exec`]. `InvalidCombination` if the context belongs to another
    /// manager.
    pub fn context_exec(&self, used: u32, ctx: &GpuContext, flags: ExecFlags) -> BufmgrResult<()> {
        self.context_exec_fenced(used, ctx, flags, None).map(drop)
    }

    /// Like [`BufferObject::context_exec`], synchronised through sync files.
    ///
    /// The GPU waits for `in_fence` before running the batch, or only before submitting it
    /// with [`ExecFlags::fence_submit`]. With [`ExecFlags::fence_out`] the returned sync
    /// file signals when the batch completes.
    ///
    /// # Errors
    /// See [`BufferObject::context_exec`].
    pub fn context_exec_fenced(
        &self,
        used: u32,
        ctx: &GpuContext,
        flags: ExecFlags,
        in_fence: Option<BorrowedFd<'_>>,
    ) -> BufmgrResult<Option<OwnedFd>> {
        if !ctx.belongs_to(&self.mgr) {
            return Err(BufmgrError::InvalidCombination(
                "context belongs to another manager",
            ));
        }
        let sub = Submission {
            batch_len: used,
            ctx_id: ctx.id(),
            flags,
            in_fence,
        };
        self.mgr.submit(&[self], sub)
    }
}

impl BufferManager {
    /// Submits several batch buffers in one kernel call, for contexts that run batches in
    /// parallel.
    ///
    /// The objects the batches reference are listed once, followed by the batches in order.
    /// Each batch runs up to its end marker.
    ///
    /// # Errors
    /// `InvalidCombination` for an empty or repeated batch, or an object or context of
    /// another manager; otherwise see [`BufferObject::context_exec_fenced`].
    pub fn context_exec_batches(
        &self,
        batches: &[&BufferObject],
        ctx: &GpuContext,
        flags: ExecFlags,
        in_fence: Option<BorrowedFd<'_>>,
    ) -> BufmgrResult<Option<OwnedFd>> {
        if batches.is_empty() {
            return Err(BufmgrError::InvalidCombination("no batch to submit"));
        }
        if !ctx.belongs_to(&self.shared) || batches.iter().any(|bo| !bo.same_manager_as(self)) {
            return Err(BufmgrError::InvalidCombination(
                "objects belong to another manager",
            ));
        }
        for (i, bo) in batches.iter().enumerate() {
            if batches[..i].iter().any(|other| other.id == bo.id) {
                return Err(BufmgrError::InvalidCombination("batch submitted twice"));
            }
        }

        let sub = Submission {
            batch_len: 0,
            ctx_id: ctx.id(),
            flags,
            in_fence,
        };
        self.shared.submit(batches, sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufmgr::manager::{AllocHints, BufferManager, ManagerConfig};
    use crate::bufmgr::mock::{MockDevice, mock_manager};
    use crate::bufmgr::ExecObjectFlags;
    use crate::drm::ioctl::{I915_GEM_DOMAIN_RENDER, I915_GEM_DOMAIN_SAMPLER};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn alloc(mgr: &BufferManager, name: &str, size: u64) -> BufferObject {
        mgr.alloc(name, size, AllocHints::new()).unwrap()
    }

    #[test]
    fn validation_list_orders_targets_before_the_batch() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let bo1 = alloc(&mgr, "bo1", 4096);
        let bo2 = alloc(&mgr, "bo2", 4096);
        let bo3 = alloc(&mgr, "bo3", 4096);
        bo3.set_softpin().unwrap();

        bo1.emit_reloc(0, &bo2, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();
        bo2.add_softpin_target(&bo3, false).unwrap();
        bo1.exec(8, ExecFlags::new()).unwrap();

        let execs = device.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].handles, vec![bo3.handle(), bo2.handle(), bo1.handle()]);
        assert_eq!(execs[0].relocs, vec![0, 0, 1]);
        assert!(execs[0].flags[0].contains(ExecObjectFlags::PINNED));
        assert_eq!(execs[0].batch_len, 8);
    }

    #[test]
    fn successful_exec_detaches_edges_and_updates_offsets() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let batch = alloc(&mgr, "batch", 4096);
        let target = alloc(&mgr, "target", 4096);
        batch
            .emit_reloc(0, &target, 0, I915_GEM_DOMAIN_RENDER, I915_GEM_DOMAIN_RENDER)
            .unwrap();

        batch.exec(8, ExecFlags::new().ring(Ring::Render)).unwrap();

        let exec = &device.execs()[0];
        assert_eq!(target.offset(), exec.offsets_out[0]);
        assert_eq!(batch.offset(), exec.offsets_out[1]);
        assert_eq!(batch.reloc_count(), 0);
        assert_eq!(target.ref_count(), 1);
        assert!(target.busy());
        assert_eq!(mgr.exec_state(), ExecState::Idle);
    }

    #[test]
    fn target_released_by_exec_goes_to_cache() {
        let (_device, mgr) = mock_manager(ManagerConfig::default());
        let batch = alloc(&mgr, "batch", 4096);
        let target = alloc(&mgr, "target", 4096);
        batch.emit_reloc(0, &target, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();
        drop(target);

        batch.exec(8, ExecFlags::new()).unwrap();
        assert_eq!(mgr.cached_count(), 1);
    }

    #[test]
    fn failed_exec_keeps_edges_for_retry() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let batch = alloc(&mgr, "batch", 4096);
        let target = alloc(&mgr, "target", 4096);
        batch.emit_reloc(0, &target, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();

        device.fail_next_exec(libc::ENOSPC);
        let err = batch.exec(8, ExecFlags::new());
        assert!(matches!(err, Err(BufmgrError::AddressSpaceExhausted)));
        assert_eq!(batch.reloc_count(), 1);
        assert_eq!(target.ref_count(), 2);

        device.fail_next_exec(libc::EIO);
        let err = batch.exec(8, ExecFlags::new());
        assert!(matches!(err, Err(BufmgrError::DeviceBusyOrLost)));

        batch.exec(8, ExecFlags::new()).unwrap();
        assert_eq!(batch.reloc_count(), 0);
        assert_eq!(device.exec_count(), 1);
    }

    #[test]
    fn poisoned_batch_never_reaches_the_kernel() {
        let (device, mgr) = mock_manager(ManagerConfig::default().max_relocs(1));
        let batch = alloc(&mgr, "batch", 4096);
        let a = alloc(&mgr, "a", 4096);
        let b = alloc(&mgr, "b", 4096);

        batch.emit_reloc(0, &a, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();
        assert!(batch.emit_reloc(8, &b, 0, I915_GEM_DOMAIN_SAMPLER, 0).is_err());
        assert!(matches!(
            batch.emit_reloc(16, &b, 0, I915_GEM_DOMAIN_SAMPLER, 0),
            Err(BufmgrError::OutOfMemory)
        ));
        assert!(matches!(
            batch.exec(8, ExecFlags::new()),
            Err(BufmgrError::OutOfMemory)
        ));
        assert_eq!(device.exec_count(), 0);
    }

    #[test]
    fn missing_engine_is_rejected() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let batch = alloc(&mgr, "batch", 4096);

        let err = batch.exec(8, ExecFlags::new().ring(Ring::Bsd));
        assert!(matches!(err, Err(BufmgrError::InvalidCombination(_))));
        batch.exec(8, ExecFlags::new().ring(Ring::Blt)).unwrap();
        assert_eq!(device.exec_count(), 1);
    }

    #[test]
    fn aperture_check_on_exec() {
        let config = ManagerConfig::default()
            .check_aperture_on_exec()
            .aperture_size(16 * 1024);
        let (device, mgr) = mock_manager(config);
        let batch = alloc(&mgr, "batch", 4096);
        let big = alloc(&mgr, "big", 16 * 1024);
        batch.emit_reloc(0, &big, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();

        let err = batch.exec(8, ExecFlags::new());
        assert!(matches!(err, Err(BufmgrError::AddressSpaceExhausted)));
        assert_eq!(device.exec_count(), 0);
        assert_eq!(batch.reloc_count(), 1);
    }

    #[test]
    fn context_exec_uses_the_context_id() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let (_other_device, other) = mock_manager(ManagerConfig::default());
        let batch = alloc(&mgr, "batch", 4096);

        let ctx = mgr.create_context().unwrap();
        batch.context_exec(8, &ctx, ExecFlags::new()).unwrap();
        assert_eq!(device.execs()[0].ctx_id, ctx.id());

        let foreign = other.create_context().unwrap();
        assert!(matches!(
            batch.context_exec(8, &foreign, ExecFlags::new()),
            Err(BufmgrError::InvalidCombination(_))
        ));
    }

    #[test]
    fn concurrent_submissions_are_serialized() {
        let device = MockDevice::with_exec_delay(Duration::from_millis(5));
        let mgr = BufferManager::new(Arc::clone(&device), ManagerConfig::default()).unwrap();
        let shared = alloc(&mgr, "shared", 4096);

        let workers: Vec<_> = (0..2)
            .map(|t| {
                let mgr = mgr.clone();
                let shared = shared.clone();
                thread::spawn(move || {
                    for i in 0..5 {
                        let batch = alloc(&mgr, &format!("batch{t}.{i}"), 4096);
                        batch
                            .emit_reloc(0, &shared, 0, I915_GEM_DOMAIN_SAMPLER, 0)
                            .unwrap();
                        batch.exec(8, ExecFlags::new()).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(device.overlaps(), 0);
        let execs = device.execs();
        assert_eq!(execs.len(), 10);

        let shared_offset = |exec: &crate::bufmgr::mock::ExecRecord, out: bool| {
            let i = exec.handles.iter().position(|&h| h == shared.handle()).unwrap();
            if out { exec.offsets_out[i] } else { exec.offsets_in[i] }
        };
        for pair in execs.windows(2) {
            assert_eq!(shared_offset(&pair[1], false), shared_offset(&pair[0], true));
        }
        assert_eq!(shared.offset(), shared_offset(&execs[9], true));
        assert_eq!(shared.ref_count(), 1);
    }

    #[test]
    fn poisoned_target_blocks_the_batch() {
        let (device, mgr) = mock_manager(ManagerConfig::default().max_relocs(1));
        let batch = alloc(&mgr, "batch", 4096);
        let middle = alloc(&mgr, "middle", 4096);
        let c = alloc(&mgr, "c", 4096);
        let d = alloc(&mgr, "d", 4096);

        batch.emit_reloc(0, &middle, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();
        middle.emit_reloc(0, &c, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();
        assert!(middle.emit_reloc(8, &d, 0, I915_GEM_DOMAIN_SAMPLER, 0).is_err());
        assert!(middle.is_poisoned());
        assert!(!batch.is_poisoned());

        assert!(matches!(
            batch.exec(8, ExecFlags::new()),
            Err(BufmgrError::OutOfMemory)
        ));
        assert_eq!(device.exec_count(), 0);
        assert!(batch.is_poisoned());
        assert_eq!(batch.reloc_count(), 1);
    }

    #[test]
    fn out_fence_is_returned_on_request() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let batch = alloc(&mgr, "batch", 4096);
        let ctx = mgr.create_context().unwrap();

        let fence = batch
            .context_exec_fenced(8, &ctx, ExecFlags::new().fence_out(), None)
            .unwrap();
        assert!(fence.is_some());
        let none = batch
            .context_exec_fenced(8, &ctx, ExecFlags::new(), None)
            .unwrap();
        assert!(none.is_none());

        let execs = device.execs();
        assert_ne!(execs[0].exec_flags & I915_EXEC_FENCE_OUT, 0);
        assert_eq!(execs[1].exec_flags & I915_EXEC_FENCE_OUT, 0);
    }

    #[test]
    fn in_fence_gates_execution_or_submission() {
        use std::os::fd::AsFd;

        let (device, mgr) = mock_manager(ManagerConfig::default());
        let batch = alloc(&mgr, "batch", 4096);
        let ctx = mgr.create_context().unwrap();
        let file = std::fs::File::open("/dev/null").unwrap();

        batch
            .context_exec_fenced(8, &ctx, ExecFlags::new(), Some(file.as_fd()))
            .unwrap();
        batch
            .context_exec_fenced(8, &ctx, ExecFlags::new().fence_submit(), Some(file.as_fd()))
            .unwrap();
        batch
            .context_exec_fenced(8, &ctx, ExecFlags::new().fence_submit(), None)
            .unwrap();

        let execs = device.execs();
        assert!(execs[0].in_fence);
        assert_ne!(execs[0].exec_flags & I915_EXEC_FENCE_IN, 0);
        assert_eq!(execs[0].exec_flags & I915_EXEC_FENCE_SUBMIT, 0);
        assert!(execs[1].in_fence);
        assert_ne!(execs[1].exec_flags & I915_EXEC_FENCE_SUBMIT, 0);
        assert_eq!(execs[1].exec_flags & I915_EXEC_FENCE_IN, 0);
        assert!(!execs[2].in_fence);
        assert_eq!(
            execs[2].exec_flags & (I915_EXEC_FENCE_IN | I915_EXEC_FENCE_SUBMIT),
            0
        );
    }

    #[test]
    fn batches_share_one_validation_list() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let ctx = mgr.create_context().unwrap();
        let first = alloc(&mgr, "first", 4096);
        let second = alloc(&mgr, "second", 4096);
        let shared = alloc(&mgr, "shared", 4096);
        first.emit_reloc(0, &shared, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();
        second
            .emit_reloc(0, &shared, 0, I915_GEM_DOMAIN_RENDER, I915_GEM_DOMAIN_RENDER)
            .unwrap();

        let fence = mgr
            .context_exec_batches(&[&first, &second], &ctx, ExecFlags::new().fence_out(), None)
            .unwrap();
        assert!(fence.is_some());

        let execs = device.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(
            execs[0].handles,
            vec![shared.handle(), first.handle(), second.handle()]
        );
        assert_eq!(execs[0].batch_len, 0);
        assert_eq!(execs[0].ctx_id, ctx.id());
        assert_eq!(first.reloc_count(), 0);
        assert_eq!(second.reloc_count(), 0);
        assert_eq!(shared.ref_count(), 1);
        assert!(first.busy());
        assert!(second.busy());
    }

    #[test]
    fn batch_referenced_by_another_batch_is_listed_last() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let ctx = mgr.create_context().unwrap();
        let first = alloc(&mgr, "first", 4096);
        let second = alloc(&mgr, "second", 4096);
        first.emit_reloc(0, &second, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();

        mgr.context_exec_batches(&[&first, &second], &ctx, ExecFlags::new(), None)
            .unwrap();
        assert_eq!(
            device.execs()[0].handles,
            vec![first.handle(), second.handle()]
        );
    }

    #[test]
    fn malformed_batch_lists_are_rejected() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let (_other_device, other) = mock_manager(ManagerConfig::default());
        let ctx = mgr.create_context().unwrap();
        let batch = alloc(&mgr, "batch", 4096);
        let foreign = alloc(&other, "foreign", 4096);

        let cases: [&[&BufferObject]; 3] = [&[], &[&batch, &batch], &[&batch, &foreign]];
        for batches in cases {
            assert!(matches!(
                mgr.context_exec_batches(batches, &ctx, ExecFlags::new(), None),
                Err(BufmgrError::InvalidCombination(_))
            ));
        }
        let foreign_ctx = other.create_context().unwrap();
        assert!(matches!(
            mgr.context_exec_batches(&[&batch], &foreign_ctx, ExecFlags::new(), None),
            Err(BufmgrError::InvalidCombination(_))
        ));
        assert_eq!(device.exec_count(), 0);
    }

    #[test]
    fn poisoned_batch_fails_the_whole_submission() {
        let (device, mgr) = mock_manager(ManagerConfig::default().max_relocs(1));
        let ctx = mgr.create_context().unwrap();
        let good = alloc(&mgr, "good", 4096);
        let bad = alloc(&mgr, "bad", 4096);
        let a = alloc(&mgr, "a", 4096);
        let b = alloc(&mgr, "b", 4096);
        bad.emit_reloc(0, &a, 0, I915_GEM_DOMAIN_SAMPLER, 0).unwrap();
        assert!(bad.emit_reloc(8, &b, 0, I915_GEM_DOMAIN_SAMPLER, 0).is_err());

        assert!(matches!(
            mgr.context_exec_batches(&[&good, &bad], &ctx, ExecFlags::new(), None),
            Err(BufmgrError::OutOfMemory)
        ));
        assert_eq!(device.exec_count(), 0);
    }
}
