use crate::bufmgr::bo::{BoArena, BoEntry, BoId, BufferObject};
use crate::bufmgr::cache::BucketCache;
use crate::bufmgr::exec::{ExecState, ExecTracker};
use crate::bufmgr::softpin::PinnedAddressAllocator;
use crate::bufmgr::vma::{self, CpuMapping, VmaCache};
use crate::bufmgr::{EngineInfo, GemDevice, GemHandle, Tiling};
use crate::error::{BufmgrError, BufmgrResult};
use crate::utils::{PAGE_SIZE, align_up, round_up_to};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

// ===============================================================================================
// Configuration
// ===============================================================================================

/// Manager-wide settings, fixed at creation except `bo_reuse`.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    /// Return released objects to the size-class cache.
    pub bo_reuse: bool,
    /// Upper bound on mappings kept for unmapped objects. Negative means unlimited.
    pub vma_max: i32,
    /// Relocation slots reserved per object, further capped at a quarter of its size.
    pub max_relocs: usize,
    /// Give every new object a fixed address.
    pub softpin: bool,
    /// Align fixed addresses to 1 MiB instead of 64 KiB.
    pub softpin_1m_align: bool,
    pub use_48b_address_range: bool,
    /// Run the aperture check on every submission.
    pub check_aperture_on_exec: bool,
    /// Overrides the aperture size reported by the device.
    pub aperture_size: Option<u64>,
    /// Overrides the fence register count reported by the device.
    pub available_fences: Option<u32>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bo_reuse: true,
            vma_max: -1,
            max_relocs: 4096,
            softpin: false,
            softpin_1m_align: false,
            use_48b_address_range: false,
            check_aperture_on_exec: false,
            aperture_size: None,
            available_fences: None,
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn bo_reuse(mut self, enable: bool) -> Self {
        self.bo_reuse = enable;
        self
    }

    #[must_use]
    pub const fn vma_max(mut self, max: i32) -> Self {
        self.vma_max = max;
        self
    }

    #[must_use]
    pub const fn max_relocs(mut self, max: usize) -> Self {
        self.max_relocs = max;
        self
    }

    #[must_use]
    pub const fn softpin(mut self) -> Self {
        self.softpin = true;
        self.use_48b_address_range = true;
        self
    }

    #[must_use]
    pub const fn softpin_1m_align(mut self) -> Self {
        self.softpin_1m_align = true;
        self
    }

    #[must_use]
    pub const fn use_48b_address_range(mut self) -> Self {
        self.use_48b_address_range = true;
        self
    }

    #[must_use]
    pub const fn check_aperture_on_exec(mut self) -> Self {
        self.check_aperture_on_exec = true;
        self
    }

    #[must_use]
    pub const fn aperture_size(mut self, size: u64) -> Self {
        self.aperture_size = Some(size);
        self
    }

    #[must_use]
    pub const fn available_fences(mut self, fences: u32) -> Self {
        self.available_fences = Some(fences);
        self
    }
}

/// How a new buffer object will be used.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocHints {
    pub tiling: Tiling,
    pub stride: u32,
    pub alignment: u64,
    /// The object is a render target: prefer a recently freed, possibly busy, buffer.
    pub for_render: bool,
}

impl AllocHints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn tiling(mut self, tiling: Tiling, stride: u32) -> Self {
        self.tiling = tiling;
        self.stride = stride;
        self
    }

    #[must_use]
    pub const fn alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub const fn for_render(mut self) -> Self {
        self.for_render = true;
        self
    }
}

// ===============================================================================================
// Shared State
// ===============================================================================================

/// Everything guarded by the manager lock.
#[derive(Debug)]
pub(crate) struct ManagerState {
    pub arena: BoArena,
    pub cache: BucketCache,
    pub vma: VmaCache,
    /// Objects with a global name, by name.
    pub named: HashMap<u32, BoId>,
    /// Imported or exported objects, by kernel handle.
    pub handles: HashMap<GemHandle, BoId>,
    pub pinned: PinnedAddressAllocator,
    pub bo_reuse: bool,
}

pub(crate) struct Shared {
    pub device: Box<dyn GemDevice>,
    pub config: ManagerConfig,
    pub aperture_size: u64,
    pub available_fences: u32,
    pub engines: Vec<EngineInfo>,
    pub exec_state: ExecTracker,
    epoch: Instant,
    state: Mutex<ManagerState>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seconds since the manager was created.
    pub(crate) fn now(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Final release of an object whose count reached zero.
    ///
    /// Targets released by its edges are handled in the same pass, so long reference
    /// chains never recurse.
    pub(crate) fn unreference_final(&self, state: &mut ManagerState, id: BoId, now: u64) {
        let mut pending = vec![id];

        while let Some(id) = pending.pop() {
            let targets = state.detach_edges(id, 0);
            pending.extend(state.collect_released(&targets));

            if !self.try_cache(state, id, now) {
                self.destroy(state, id);
            }
        }

        self.cleanup_cache(state, now);
    }

    /// Drops one edge reference on each of `ids`, freeing those that reach zero.
    pub(crate) fn release_refs(&self, state: &mut ManagerState, ids: &[BoId], now: u64) {
        for id in state.collect_released(ids) {
            self.unreference_final(state, id, now);
        }
    }

    /// Closes the kernel handle and forgets the object.
    pub(crate) fn destroy(&self, state: &mut ManagerState, id: BoId) {
        let Some(mut entry) = state.arena.remove(id) else {
            return;
        };

        vma::release(&mut state.vma, &mut entry, self.device.as_ref());
        if entry.global_name != 0 {
            state.named.remove(&entry.global_name);
        }
        if state.handles.get(&entry.handle) == Some(&id) {
            state.handles.remove(&entry.handle);
        }

        if let Err(e) = self.device.close(entry.handle) {
            log::warn!("failed to close bo {} ({}): {e}", entry.handle, entry.name);
        }
        log::debug!("bo_free: {} ({}) {}b", entry.handle, entry.name, entry.size);
    }

    /// Whether the GPU may still be using the object. A failed query counts as idle.
    pub(crate) fn busy_locked(&self, state: &mut ManagerState, id: BoId) -> bool {
        let entry = &mut state.arena[id];
        if entry.reusable && entry.idle {
            return false;
        }

        match self.device.busy(entry.handle) {
            Ok(busy) => {
                entry.idle = !busy;
                busy
            }
            Err(e) => {
                log::debug!("busy query of bo {} failed: {e}", entry.handle);
                false
            }
        }
    }

    pub(crate) fn set_tiling_locked(
        &self,
        state: &mut ManagerState,
        id: BoId,
        mode: Tiling,
        stride: u32,
    ) -> BufmgrResult<()> {
        let entry = &state.arena[id];
        if entry.userptr {
            return Err(BufmgrError::InvalidCombination("tiling a userptr object"));
        }

        let stride = if mode == Tiling::None { 0 } else { stride };
        if entry.global_name == 0 && entry.tiling.mode == mode && entry.tiling.stride == stride {
            return Ok(());
        }

        let applied = self.device.set_tiling(entry.handle, mode, stride)?;
        state.arena[id].tiling = applied;
        state.recompute_tree_size(id);
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let mut state = self.lock();
        let cached = state.cache.len();
        self.purge_cache(&mut state);
        log::debug!("buffer manager torn down, {cached} cached objects freed");
    }
}

// ===============================================================================================
// Manager
// ===============================================================================================

/// Pitch alignment of a surface row.
const fn tile_width(tiling: Tiling) -> u64 {
    match tiling {
        Tiling::None => 64,
        Tiling::X => 512,
        Tiling::Y => 128,
    }
}

/// Rows per tile; linear surfaces are still accessed in 2x2 blocks.
const fn tile_height(tiling: Tiling) -> u64 {
    match tiling {
        Tiling::None => 2,
        Tiling::X => 8,
        Tiling::Y => 32,
    }
}

/// Buffer object manager for one GEM device.
///
/// Cheap to clone; every clone shares the same objects, caches and lock.
#[derive(Clone)]
pub struct BufferManager {
    pub(crate) shared: Arc<Shared>,
}

impl BufferManager {
    /// Creates a manager over `device`.
    ///
    /// # Errors
    /// Propagates a failed aperture size query unless `config` overrides it.
    pub fn new(device: impl GemDevice + 'static, config: ManagerConfig) -> BufmgrResult<Self> {
        let aperture_size = match config.aperture_size {
            Some(size) => size,
            None => device.aperture_size()?,
        };
        let available_fences = match config.available_fences {
            Some(fences) => fences,
            None => device.available_fences().unwrap_or_else(|e| {
                log::warn!("fence count query failed, fence budget disabled: {e}");
                0
            }),
        };
        let engines = device.query_engines().unwrap_or_else(|e| {
            log::debug!("engine query failed: {e}");
            Vec::new()
        });

        log::debug!(
            "buffer manager: aperture {}kb, {available_fences} fences, {} engines",
            aperture_size / 1024,
            engines.len()
        );

        let state = ManagerState {
            arena: BoArena::default(),
            cache: BucketCache::new(),
            vma: VmaCache::new(config.vma_max),
            named: HashMap::new(),
            handles: HashMap::new(),
            pinned: PinnedAddressAllocator::default(),
            bo_reuse: config.bo_reuse,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                device: Box::new(device),
                config,
                aperture_size,
                available_fences,
                engines,
                exec_state: ExecTracker::default(),
                epoch: Instant::now(),
                state: Mutex::new(state),
            }),
        })
    }

    /// Allocates a buffer object of at least `size` bytes, reusing a cached one if possible.
    ///
    /// # Errors
    /// Propagates the kernel error of the allocation or tiling change.
    pub fn alloc(&self, name: &str, size: u64, hints: AllocHints) -> BufmgrResult<BufferObject> {
        let shared = &self.shared;
        let mut state = shared.lock();

        let bucket = state.cache.bucket_for_size(size);
        let alloc_size = match bucket {
            Some(bucket) => state.cache.class_size(bucket),
            None => size.max(PAGE_SIZE),
        };

        if let Some(bucket) = bucket {
            while let Some(id) = shared.take_cached(&mut state, bucket, hints.for_render) {
                if let Err(e) = shared.set_tiling_locked(&mut state, id, hints.tiling, hints.stride)
                {
                    log::debug!("cached bo rejected tiling {:?}: {e}", hints.tiling);
                    shared.destroy(&mut state, id);
                    continue;
                }

                let entry = &mut state.arena[id];
                entry.shared.refs.store(1, Ordering::Release);
                entry.shared.has_error.store(false, Ordering::Release);
                entry.reusable = true;
                entry.align = hints.alignment;
                entry.name = name.to_owned();
                entry.graph.tree_fences = 0;
                state.recompute_tree_size(id);

                let entry = &state.arena[id];
                log::debug!("bo_create: reuse {} ({name}) {size}b", entry.handle);
                let bo = BufferObject::adopt(shared, id, entry);
                drop(state);
                return self.finish_alloc(bo);
            }
        }
        drop(state);

        let handle = shared.device.create(alloc_size)?;
        let mut entry = BoEntry::new(handle, alloc_size, name);
        entry.align = hints.alignment;
        entry.use_48b = shared.config.use_48b_address_range;

        let mut state = shared.lock();
        let id = state.arena.insert(entry);
        state.recompute_tree_size(id);
        if let Err(e) = shared.set_tiling_locked(&mut state, id, hints.tiling, hints.stride) {
            shared.destroy(&mut state, id);
            return Err(e);
        }

        log::debug!("bo_create: buf {handle} ({name}) {size}b");
        let bo = BufferObject::adopt(shared, id, &state.arena[id]);
        drop(state);
        self.finish_alloc(bo)
    }

    fn finish_alloc(&self, bo: BufferObject) -> BufmgrResult<BufferObject> {
        if self.shared.config.softpin {
            bo.set_softpin()?;
        }
        Ok(bo)
    }

    /// Allocates a render target; may hand out a buffer the GPU is still using.
    ///
    /// # Errors
    /// See [`BufferManager::alloc`].
    pub fn alloc_for_render(
        &self,
        name: &str,
        size: u64,
        alignment: u64,
    ) -> BufmgrResult<BufferObject> {
        self.alloc(name, size, AllocHints::new().alignment(alignment).for_render())
    }

    /// Allocates a 2D surface of `x` by `y` elements of `cpp` bytes.
    ///
    /// Returns the object and its row pitch in bytes.
    ///
    /// # Errors
    /// `InvalidCombination` if the surface size overflows; otherwise see
    /// [`BufferManager::alloc`].
    pub fn alloc_tiled(
        &self,
        name: &str,
        x: u32,
        y: u32,
        cpp: u32,
        tiling: Tiling,
    ) -> BufmgrResult<(BufferObject, u32)> {
        const TOO_LARGE: BufmgrError = BufmgrError::InvalidCombination("surface too large");

        let mut tiling = tiling;
        loop {
            let aligned_y = align_up(u64::from(y), tile_height(tiling));
            let pitch = round_up_to(u64::from(x) * u64::from(cpp), tile_width(tiling));
            let mut size = pitch.checked_mul(aligned_y).ok_or(TOO_LARGE)?;
            if tiling != Tiling::None {
                size = align_up(size, PAGE_SIZE);
            }
            let pitch = u32::try_from(pitch).map_err(|_| TOO_LARGE)?;

            let stride = if tiling == Tiling::None { 0 } else { pitch };
            let bo = self.alloc(name, size, AllocHints::new().tiling(tiling, stride))?;

            // The kernel may settle on another layout; size the surface for that one.
            let applied = bo.tiling().mode;
            if applied == tiling {
                return Ok((bo, pitch));
            }
            log::debug!("{name}: requested {tiling:?} tiling, kernel applied {applied:?}");
            tiling = applied;
        }
    }

    /// Wraps caller memory in a buffer object. Userptr objects are never cached.
    ///
    /// # Errors
    /// `InvalidCombination` for any tiling but linear; otherwise the kernel error.
    ///
    /// # Safety
    /// `ptr` must stay valid for `size` bytes for as long as the object exists.
    pub unsafe fn alloc_userptr(
        &self,
        name: &str,
        ptr: NonNull<u8>,
        size: u64,
        tiling: Tiling,
    ) -> BufmgrResult<BufferObject> {
        if tiling != Tiling::None {
            return Err(BufmgrError::InvalidCombination("tiled userptr object"));
        }

        let handle = self.shared.device.userptr(ptr, size, false)?;
        let mut entry = BoEntry::new(handle, size, name);
        entry.userptr = true;
        entry.reusable = false;
        entry.use_48b = self.shared.config.use_48b_address_range;
        entry.maps.user = Some(CpuMapping::new(ptr));

        let mut state = self.shared.lock();
        let id = state.arena.insert(entry);
        log::debug!("bo_create_userptr: ptr {ptr:p} buf {handle} ({name}) {size}b");
        let bo = BufferObject::adopt(&self.shared, id, &state.arena[id]);
        drop(state);
        self.finish_alloc(bo)
    }

    /// Opens an object another process shared by global name.
    ///
    /// A name already open in this manager returns a new reference to the same object.
    ///
    /// # Errors
    /// Propagates the kernel error.
    pub fn create_from_name(&self, name: u32, debug_name: &str) -> BufmgrResult<BufferObject> {
        let shared = &self.shared;
        let mut state = shared.lock();
        if let Some(&id) = state.named.get(&name) {
            return Ok(BufferObject::reference(shared, id, &state.arena[id]));
        }

        let (handle, size) = shared.device.open_name(name).inspect_err(|e| {
            log::debug!("couldn't reference {debug_name} name {name:#010x}: {e}");
        })?;
        if let Some(&id) = state.handles.get(&handle) {
            return Ok(BufferObject::reference(shared, id, &state.arena[id]));
        }

        let (mode, swizzle) = match shared.device.get_tiling(handle) {
            Ok(tiling) => tiling,
            Err(e) => {
                log::debug!("create_from_name: failed to get tiling: {e}");
                if let Err(e) = shared.device.close(handle) {
                    log::warn!("failed to close bo {handle}: {e}");
                }
                return Err(e.into());
            }
        };

        let mut entry = BoEntry::new(handle, size, debug_name);
        entry.global_name = name;
        entry.reusable = false;
        entry.use_48b = shared.config.use_48b_address_range;
        entry.tiling.mode = mode;
        entry.tiling.swizzle = swizzle;

        let id = state.arena.insert(entry);
        state.named.insert(name, id);
        state.handles.insert(handle, id);
        log::debug!("bo_create_from_name: {name} ({debug_name})");
        let bo = BufferObject::adopt(shared, id, &state.arena[id]);
        drop(state);
        self.finish_alloc(bo)
    }

    /// Imports a dma-buf. `size` is used only when the descriptor cannot report its own.
    ///
    /// Importing an object this manager already knows returns a new reference to it.
    ///
    /// # Errors
    /// Propagates the kernel error.
    pub fn create_from_prime(&self, fd: BorrowedFd<'_>, size: u64) -> BufmgrResult<BufferObject> {
        let shared = &self.shared;
        let mut state = shared.lock();
        let handle = shared.device.prime_fd_to_handle(fd)?;
        if let Some(&id) = state.handles.get(&handle) {
            return Ok(BufferObject::reference(shared, id, &state.arena[id]));
        }

        // SAFETY: lseek on a borrowed descriptor does not affect its ownership.
        let end = unsafe { libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_END) };
        let size = u64::try_from(end).ok().filter(|&end| end > 0).unwrap_or(size);

        let (mode, swizzle) = match shared.device.get_tiling(handle) {
            Ok(tiling) => tiling,
            Err(e) => {
                log::debug!("create_from_prime: failed to get tiling: {e}");
                if let Err(e) = shared.device.close(handle) {
                    log::warn!("failed to close bo {handle}: {e}");
                }
                return Err(e.into());
            }
        };

        let mut entry = BoEntry::new(handle, size, "prime");
        entry.reusable = false;
        entry.exported = true;
        entry.use_48b = shared.config.use_48b_address_range;
        entry.tiling.mode = mode;
        entry.tiling.swizzle = swizzle;

        let id = state.arena.insert(entry);
        state.handles.insert(handle, id);
        log::debug!("bo_create_from_prime: {handle} {size}b");
        let bo = BufferObject::adopt(shared, id, &state.arena[id]);
        drop(state);
        self.finish_alloc(bo)
    }

    /// Turns the reuse cache on or off. Turning it off leaves cached objects in place
    /// until they age out.
    pub fn enable_reuse(&self, enable: bool) {
        self.shared.lock().bo_reuse = enable;
    }

    /// Engines reported by the device at creation.
    #[must_use]
    pub fn engines(&self) -> &[EngineInfo] {
        &self.shared.engines
    }

    #[must_use]
    pub fn aperture_size(&self) -> u64 {
        self.shared.aperture_size
    }

    /// Progress of the submission in flight, if any.
    #[must_use]
    pub fn exec_state(&self) -> ExecState {
        self.shared.exec_state.get()
    }

    /// Objects currently sitting in the reuse cache.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.shared.lock().cache.len()
    }

    /// Objects known to the manager, cached ones included.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.shared.lock().arena.len()
    }

    /// Objects with outstanding maps, and mappings held for unmapped objects.
    #[must_use]
    pub fn vma_counts(&self) -> (usize, usize) {
        let state = self.shared.lock();
        (state.vma.open_count(), state.vma.cached_count())
    }

    /// Frees every cached object now.
    pub fn purge_cache(&self) {
        let mut state = self.shared.lock();
        self.shared.purge_cache(&mut state);
    }

    #[cfg(test)]
    pub(crate) fn cleanup_cache_at(&self, now: u64) {
        let mut state = self.shared.lock();
        self.shared.cleanup_cache(&mut state, now);
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("aperture_size", &self.shared.aperture_size)
            .field("available_fences", &self.shared.available_fences)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl BufferObject {
    pub(crate) fn same_manager_as(&self, mgr: &BufferManager) -> bool {
        Arc::ptr_eq(&self.mgr, &mgr.shared)
    }
}
