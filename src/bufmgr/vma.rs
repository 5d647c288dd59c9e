use crate::bufmgr::bo::{BoArena, BoEntry, BoId, BufferObject};
use crate::bufmgr::manager::ManagerState;
use crate::bufmgr::{GemDevice, MapKind};
use crate::drm::ioctl::{I915_GEM_DOMAIN_CPU, I915_GEM_DOMAIN_GTT};
use crate::error::BufmgrResult;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// A live process mapping of a buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CpuMapping(NonNull<u8>);

// The pointer is only dereferenced by callers of `map`, never by the manager.
unsafe impl Send for CpuMapping {}

impl CpuMapping {
    pub(crate) const fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub(crate) const fn as_ptr(self) -> NonNull<u8> {
        self.0
    }
}

/// Per-object mapping state.
#[derive(Debug, Default)]
pub(crate) struct Mappings {
    slots: [Option<CpuMapping>; 3],
    /// Outstanding `map` calls not yet balanced by `unmap`.
    pub map_count: u32,
    /// Position in the closed-mapping LRU while `map_count` is 0 and mappings remain.
    lru_key: Option<u64>,
    /// User memory backing a userptr object.
    pub user: Option<CpuMapping>,
}

impl Mappings {
    pub(crate) fn live(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub(crate) fn get(&self, kind: MapKind) -> Option<CpuMapping> {
        self.slots[kind.slot()]
    }

    fn take_all(&mut self) -> [Option<CpuMapping>; 3] {
        std::mem::take(&mut self.slots)
    }
}

/// Bounds the number of mappings kept alive for objects nobody has mapped.
///
/// Unmapped objects keep their mappings on an LRU so a later `map` is free; the oldest are
/// torn down once the cache grows past `max - 2 * open`.
#[derive(Debug)]
pub(crate) struct VmaCache {
    /// Negative disables the limit.
    max: i32,
    /// Objects with a non-zero `map_count`.
    open: usize,
    /// Mappings held by objects on the LRU.
    cached: usize,
    lru: BTreeMap<u64, BoId>,
    next_key: u64,
}

impl VmaCache {
    pub(crate) const fn new(max: i32) -> Self {
        Self {
            max,
            open: 0,
            cached: 0,
            lru: BTreeMap::new(),
            next_key: 0,
        }
    }

    pub(crate) const fn open_count(&self) -> usize {
        self.open
    }

    pub(crate) const fn cached_count(&self) -> usize {
        self.cached
    }

    /// First `map` of an object: its mappings stop counting as cached.
    fn open(&mut self, maps: &mut Mappings) {
        self.open += 1;
        if let Some(key) = maps.lru_key.take() {
            self.lru.remove(&key);
        }
        self.cached = self.cached.saturating_sub(maps.live());
    }

    /// Last `unmap` of an object: its mappings become reclaimable.
    fn close(&mut self, id: BoId, maps: &mut Mappings) {
        self.open = self.open.saturating_sub(1);
        let key = self.next_key;
        self.next_key += 1;
        self.lru.insert(key, id);
        maps.lru_key = Some(key);
        self.cached += maps.live();
    }

    fn limit(&self) -> Option<usize> {
        let max = usize::try_from(self.max).ok()?;
        Some(max.saturating_sub(2 * self.open))
    }
}

fn unmap_all(device: &dyn GemDevice, entry: &mut BoEntry) {
    for mapping in entry.maps.take_all().into_iter().flatten() {
        if let Err(e) = device.munmap(mapping.as_ptr(), entry.size) {
            log::warn!("munmap of bo {} failed: {e}", entry.handle);
        }
    }
}

/// Tears down closed mappings, oldest first, until the cache is within its limit.
pub(crate) fn purge(vma: &mut VmaCache, arena: &mut BoArena, device: &dyn GemDevice) {
    let Some(limit) = vma.limit() else {
        return;
    };

    while vma.cached > limit {
        let Some((_, id)) = vma.lru.pop_first() else {
            break;
        };
        let Some(entry) = arena.get_mut(id) else {
            continue;
        };
        entry.maps.lru_key = None;
        vma.cached = vma.cached.saturating_sub(entry.maps.live());
        log::trace!("vma cache: unmapping bo {}", entry.handle);
        unmap_all(device, entry);
    }
}

/// Drops every mapping of an object that is being freed or cached.
pub(crate) fn release(vma: &mut VmaCache, entry: &mut BoEntry, device: &dyn GemDevice) {
    if entry.maps.map_count > 0 {
        log::debug!(
            "bo {} ({}) released with map count {}",
            entry.handle,
            entry.name,
            entry.maps.map_count
        );
        entry.maps.map_count = 0;
        vma.open = vma.open.saturating_sub(1);
    } else if let Some(key) = entry.maps.lru_key.take() {
        vma.lru.remove(&key);
        vma.cached = vma.cached.saturating_sub(entry.maps.live());
    }
    unmap_all(device, entry);
}

impl ManagerState {
    fn map_locked(
        &mut self,
        device: &dyn GemDevice,
        id: BoId,
        kind: MapKind,
    ) -> BufmgrResult<NonNull<u8>> {
        let entry = &mut self.arena[id];
        if let Some(user) = entry.maps.user {
            return Ok(user.as_ptr());
        }

        if entry.maps.map_count == 0 {
            self.vma.open(&mut entry.maps);
        }
        entry.maps.map_count += 1;

        let ptr = match entry.maps.get(kind) {
            Some(mapping) => mapping.as_ptr(),
            None => match device.mmap(entry.handle, entry.size, kind) {
                Ok(ptr) => {
                    entry.maps.slots[kind.slot()] = Some(CpuMapping::new(ptr));
                    log::debug!(
                        "bo_map {kind:?}: {} ({}) -> {ptr:p}, map count {}",
                        entry.handle,
                        entry.name,
                        entry.maps.map_count
                    );
                    ptr
                }
                Err(e) => {
                    log::warn!("error mapping bo {} ({}): {e}", entry.handle, entry.name);
                    entry.maps.map_count -= 1;
                    if entry.maps.map_count == 0 {
                        self.vma.close(id, &mut entry.maps);
                    }
                    purge(&mut self.vma, &mut self.arena, device);
                    return Err(e.into());
                }
            },
        };

        purge(&mut self.vma, &mut self.arena, device);
        Ok(ptr)
    }

    fn unmap_locked(&mut self, device: &dyn GemDevice, id: BoId) {
        let entry = &mut self.arena[id];
        if entry.maps.user.is_some() {
            return;
        }
        if entry.maps.map_count == 0 {
            log::warn!("attempted to unmap an unmapped bo {} ({})", entry.handle, entry.name);
            return;
        }

        entry.maps.map_count -= 1;
        if entry.maps.map_count == 0 {
            self.vma.close(id, &mut entry.maps);
            purge(&mut self.vma, &mut self.arena, device);
        }
    }
}

impl BufferObject {
    fn map_inner(&self, kind: MapKind, write: bool, sync: bool) -> BufmgrResult<NonNull<u8>> {
        let ptr = {
            let mut state = self.mgr.lock();
            state.map_locked(self.mgr.device.as_ref(), self.id, kind)?
        };

        if sync {
            let domain = match kind {
                MapKind::Cpu => I915_GEM_DOMAIN_CPU,
                MapKind::Wc | MapKind::Gtt => I915_GEM_DOMAIN_GTT,
            };
            let write_domain = if write { domain } else { 0 };
            if let Err(e) = self.mgr.device.set_domain(self.handle(), domain, write_domain) {
                log::warn!("error moving bo {} to domain {domain:#x}: {e}", self.handle());
            }
        }
        Ok(ptr)
    }

    /// Maps the object into the process and waits until the CPU may access it.
    ///
    /// Mappings are cached per kind; every successful call must be balanced by
    /// [`BufferObject::unmap`]. Userptr objects return their user memory.
    ///
    /// # Errors
    /// Propagates the kernel error of the first mapping.
    pub fn map(&self, kind: MapKind, write: bool) -> BufmgrResult<NonNull<u8>> {
        self.map_inner(kind, write, true)
    }

    /// Maps the object without synchronising with the GPU.
    ///
    /// # Errors
    /// Propagates the kernel error of the first mapping.
    pub fn map_unsynchronized(&self, kind: MapKind) -> BufmgrResult<NonNull<u8>> {
        self.map_inner(kind, true, false)
    }

    /// Balances one [`BufferObject::map`]. The mapping stays cached until evicted.
    ///
    /// An unbalanced call is logged and ignored.
    pub fn unmap(&self, kind: MapKind) {
        let mut state = self.mgr.lock();
        log::trace!("bo_unmap {kind:?}: {}", self.handle());
        state.unmap_locked(self.mgr.device.as_ref(), self.id);
    }

    /// Number of outstanding `map` calls.
    #[must_use]
    pub fn map_count(&self) -> u32 {
        self.mgr.lock().arena[self.id].maps.map_count
    }
}
