use crate::bufmgr::manager::{ManagerState, Shared};
use crate::bufmgr::reloc::RelocGraph;
use crate::bufmgr::vma::Mappings;
use crate::bufmgr::{ExecObjectFlags, GemHandle, Tiling, TilingState};
use crate::drm::ioctl::I915_GEM_DOMAIN_GTT;
use crate::error::{BufmgrError, BufmgrResult};
use std::fmt;
use std::ops::{Index, IndexMut};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

// ===============================================================================================
// Arena
// ===============================================================================================

/// Identity of a buffer object inside its manager.
///
/// Slots are recycled; the generation makes a stale id distinguishable from the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoId {
    index: u32,
    generation: u32,
}

impl BoId {
    pub(crate) const fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for BoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// State visible to handles without taking the manager lock.
#[derive(Debug)]
pub(crate) struct BoShared {
    /// User handles plus incoming relocation and softpin edges.
    pub refs: AtomicU32,
    /// Set when relocation storage could not be grown.
    pub has_error: AtomicBool,
}

/// Per-object bookkeeping owned by the manager.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug)]
pub(crate) struct BoEntry {
    pub handle: GemHandle,
    pub size: u64,
    pub align: u64,
    pub name: String,
    pub shared: Arc<BoShared>,
    pub tiling: TilingState,
    /// Last known GPU address.
    pub offset: u64,
    /// Global (flink) name, 0 if never exported by name.
    pub global_name: u32,
    /// Registered in the handle table after a prime import or export.
    pub exported: bool,
    pub reusable: bool,
    /// Known idle since the last wait; cleared by every submission.
    pub idle: bool,
    pub userptr: bool,
    pub softpin: bool,
    pub exec_async: bool,
    pub exec_capture: bool,
    pub use_48b: bool,
    pub pad_to_size: u64,
    /// Manager clock second at which the object entered a cache bucket.
    pub free_time: Option<u64>,
    pub graph: RelocGraph,
    pub maps: Mappings,
}

impl BoEntry {
    pub(crate) fn new(handle: GemHandle, size: u64, name: &str) -> Self {
        Self {
            handle,
            size,
            align: 0,
            name: name.to_owned(),
            shared: Arc::new(BoShared {
                refs: AtomicU32::new(1),
                has_error: AtomicBool::new(false),
            }),
            tiling: TilingState::default(),
            offset: 0,
            global_name: 0,
            exported: false,
            reusable: true,
            idle: false,
            userptr: false,
            softpin: false,
            exec_async: false,
            exec_capture: false,
            use_48b: false,
            pad_to_size: 0,
            free_time: None,
            graph: RelocGraph::new(size),
            maps: Mappings::default(),
        }
    }

    /// Flags the object contributes to every validation list entry it appears in.
    pub(crate) fn own_flags(&self) -> ExecObjectFlags {
        let mut flags = ExecObjectFlags::empty();
        flags.set(ExecObjectFlags::PINNED, self.softpin);
        flags.set(ExecObjectFlags::PAD_TO_SIZE, self.pad_to_size != 0);
        flags.set(ExecObjectFlags::SUPPORTS_48B_ADDRESS, self.use_48b);
        flags.set(ExecObjectFlags::ASYNC, self.exec_async);
        flags.set(ExecObjectFlags::CAPTURE, self.exec_capture);
        flags
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.shared.has_error.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self) {
        self.shared.has_error.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<BoEntry>,
}

/// Generational slot storage for every live or cached buffer object.
#[derive(Debug, Default)]
pub(crate) struct BoArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl BoArena {
    pub(crate) fn insert(&mut self, entry: BoEntry) -> BoId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return BoId {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        BoId {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, id: BoId) -> Option<&BoEntry> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: BoId) -> Option<&mut BoEntry> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    pub(crate) fn contains(&self, id: BoId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn remove(&mut self, id: BoId) -> Option<BoEntry> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

impl Index<BoId> for BoArena {
    type Output = BoEntry;

    /// Ids reachable from handles or edges are always live.
    fn index(&self, id: BoId) -> &BoEntry {
        match self.get(id) {
            Some(entry) => entry,
            None => panic!("stale buffer object id {id}"),
        }
    }
}

impl IndexMut<BoId> for BoArena {
    fn index_mut(&mut self, id: BoId) -> &mut BoEntry {
        match self.get_mut(id) {
            Some(entry) => entry,
            None => panic!("stale buffer object id {id}"),
        }
    }
}

// ===============================================================================================
// Handles
// ===============================================================================================

/// A counted reference to a buffer object.
///
/// Cloning takes another reference; dropping the last one returns the object to the reuse
/// cache or releases its kernel handle.
pub struct BufferObject {
    pub(crate) mgr: Arc<Shared>,
    pub(crate) id: BoId,
    pub(crate) shared: Arc<BoShared>,
    handle: GemHandle,
    size: u64,
}

impl BufferObject {
    /// Wraps an entry whose count already includes this handle.
    pub(crate) fn adopt(mgr: &Arc<Shared>, id: BoId, entry: &BoEntry) -> Self {
        Self {
            mgr: Arc::clone(mgr),
            id,
            shared: Arc::clone(&entry.shared),
            handle: entry.handle,
            size: entry.size,
        }
    }

    /// Takes a new reference on an entry found through a registry. Requires the manager lock.
    pub(crate) fn reference(mgr: &Arc<Shared>, id: BoId, entry: &BoEntry) -> Self {
        entry.shared.refs.fetch_add(1, Ordering::Relaxed);
        Self::adopt(mgr, id, entry)
    }

    #[must_use]
    pub const fn id(&self) -> BoId {
        self.id
    }

    #[must_use]
    pub const fn handle(&self) -> GemHandle {
        self.handle
    }

    /// Allocated size; at least the requested size.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Current number of references, including incoming edges.
    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.shared.refs.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        self.shared.has_error.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn same_manager(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.mgr, &other.mgr)
    }

    fn with_entry<R>(&self, f: impl FnOnce(&mut BoEntry) -> R) -> R {
        let mut state = self.mgr.lock();
        f(&mut state.arena[self.id])
    }

    /// Last known GPU address.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.with_entry(|e| e.offset)
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.with_entry(|e| e.name.clone())
    }

    #[must_use]
    pub fn tiling(&self) -> TilingState {
        self.with_entry(|e| e.tiling)
    }

    /// Re-reads the tiling mode from the kernel.
    ///
    /// # Errors
    /// Propagates the kernel error.
    pub fn get_tiling(&self) -> BufmgrResult<(Tiling, u32)> {
        let (mode, swizzle) = self.mgr.device.get_tiling(self.handle)?;
        self.with_entry(|e| {
            e.tiling.mode = mode;
            e.tiling.swizzle = swizzle;
        });
        Ok((mode, swizzle))
    }

    /// Changes the tiling layout. Linear always uses stride 0.
    ///
    /// Returns the layout the kernel applied, which may differ from the request.
    ///
    /// # Errors
    /// `InvalidCombination` for userptr objects; otherwise the kernel error.
    pub fn set_tiling(&self, mode: Tiling, stride: u32) -> BufmgrResult<TilingState> {
        let mut state = self.mgr.lock();
        self.mgr.set_tiling_locked(&mut state, self.id, mode, stride)?;
        Ok(state.arena[self.id].tiling)
    }

    // ===========================================================================================
    // Reuse & Submission Flags
    // ===========================================================================================

    /// Prevents the object from entering the reuse cache when released.
    pub fn disable_reuse(&self) {
        self.with_entry(|e| e.reusable = false);
    }

    #[must_use]
    pub fn is_reusable(&self) -> bool {
        self.with_entry(|e| e.reusable)
    }

    /// Reserve `pad_to_size` bytes of address space for the object; 0 disables padding.
    ///
    /// # Errors
    /// `InvalidCombination` if the padding is smaller than the object.
    pub fn pad_to_size(&self, pad_to_size: u64) -> BufmgrResult<()> {
        if pad_to_size != 0 && pad_to_size < self.size {
            return Err(BufmgrError::InvalidCombination("padding smaller than object"));
        }
        self.with_entry(|e| e.pad_to_size = pad_to_size);
        Ok(())
    }

    /// Skip implicit synchronisation whenever this object is submitted.
    pub fn set_object_async(&self) {
        self.with_entry(|e| e.exec_async = true);
    }

    /// Include the object in GPU error captures.
    pub fn set_object_capture(&self) {
        self.with_entry(|e| e.exec_capture = true);
    }

    pub fn use_48b_address_range(&self, enable: bool) {
        self.with_entry(|e| e.use_48b = enable);
    }

    // ===========================================================================================
    // Synchronisation
    // ===========================================================================================

    /// Whether the GPU may still be using the object.
    ///
    /// Advisory only: the answer can be stale by the time it is acted upon.
    #[must_use]
    pub fn busy(&self) -> bool {
        let mut state = self.mgr.lock();
        self.mgr.busy_locked(&mut state, self.id)
    }

    /// Waits for outstanding GPU work on the object. A negative timeout waits forever.
    ///
    /// # Errors
    /// `Timeout` if the object is still busy when the timeout expires.
    pub fn wait(&self, timeout_ns: i64) -> BufmgrResult<()> {
        match self.mgr.device.wait(self.handle, timeout_ns) {
            Ok(()) => {
                self.with_entry(|e| e.idle = true);
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => Err(BufmgrError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocks until rendering to the object has completed.
    ///
    /// # Errors
    /// Propagates the kernel error.
    pub fn wait_rendering(&self) -> BufmgrResult<()> {
        self.mgr
            .device
            .set_domain(self.handle, I915_GEM_DOMAIN_GTT, I915_GEM_DOMAIN_GTT)?;
        self.with_entry(|e| e.idle = true);
        Ok(())
    }

    // ===========================================================================================
    // Data Transfer
    // ===========================================================================================

    fn check_range(&self, offset: u64, len: usize) -> BufmgrResult<()> {
        let end = offset.checked_add(len as u64);
        if end.is_none_or(|end| end > self.size) {
            return Err(BufmgrError::InvalidCombination("access outside the object"));
        }
        Ok(())
    }

    /// Writes `data` at `offset` without mapping the object.
    ///
    /// # Errors
    /// `InvalidCombination` if the range exceeds the object; otherwise the kernel error.
    pub fn subdata(&self, offset: u64, data: &[u8]) -> BufmgrResult<()> {
        self.check_range(offset, data.len())?;
        self.mgr.device.pwrite(self.handle, offset, data)?;
        Ok(())
    }

    /// Reads into `out` from `offset` without mapping the object.
    ///
    /// # Errors
    /// `InvalidCombination` if the range exceeds the object; otherwise the kernel error.
    pub fn get_subdata(&self, offset: u64, out: &mut [u8]) -> BufmgrResult<()> {
        self.check_range(offset, out.len())?;
        self.mgr.device.pread(self.handle, offset, out)?;
        Ok(())
    }

    // ===========================================================================================
    // Sharing
    // ===========================================================================================

    /// Returns the global name of the object, creating one if needed.
    ///
    /// Named objects never return to the reuse cache.
    ///
    /// # Errors
    /// Propagates the kernel error.
    pub fn flink(&self) -> BufmgrResult<u32> {
        let mut state = self.mgr.lock();
        let existing = state.arena[self.id].global_name;
        if existing != 0 {
            return Ok(existing);
        }

        let name = self.mgr.device.flink(self.handle)?;
        let entry = &mut state.arena[self.id];
        entry.global_name = name;
        entry.reusable = false;
        state.named.insert(name, self.id);
        log::debug!("bo {} flinked as {name}", self.handle);
        Ok(name)
    }

    /// Exports the object as a dma-buf file descriptor.
    ///
    /// # Errors
    /// Propagates the kernel error.
    pub fn export_to_prime(&self) -> BufmgrResult<OwnedFd> {
        let mut state = self.mgr.lock();
        let fd = self.mgr.device.prime_handle_to_fd(self.handle)?;
        let entry = &mut state.arena[self.id];
        entry.reusable = false;
        entry.exported = true;
        state.handles.insert(self.handle, self.id);
        Ok(fd)
    }

    // ===========================================================================================
    // Placement
    // ===========================================================================================

    /// Pins the object into the aperture through the kernel and records its offset.
    ///
    /// # Errors
    /// Propagates the kernel error.
    pub fn pin(&self, alignment: u64) -> BufmgrResult<u64> {
        let offset = self.mgr.device.pin(self.handle, alignment)?;
        self.with_entry(|e| e.offset = offset);
        Ok(offset)
    }
}

impl Clone for BufferObject {
    fn clone(&self) -> Self {
        self.shared.refs.fetch_add(1, Ordering::Relaxed);
        Self {
            mgr: Arc::clone(&self.mgr),
            id: self.id,
            shared: Arc::clone(&self.shared),
            handle: self.handle,
            size: self.size,
        }
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        // Only the 1 -> 0 transition needs the lock.
        let dropped = self
            .shared
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 1).then(|| n - 1)
            });
        if dropped.is_ok() {
            return;
        }

        let mut state = self.mgr.lock();
        if self.shared.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            let now = self.mgr.now();
            self.mgr.unreference_final(&mut state, self.id, now);
        }
    }
}

impl fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferObject")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("refs", &self.ref_count())
            .finish()
    }
}

impl PartialEq for BufferObject {
    fn eq(&self, other: &Self) -> bool {
        self.same_manager(other) && self.id == other.id
    }
}

impl Eq for BufferObject {}

impl ManagerState {
    /// Drops one reference on each id and returns the ids that reached zero.
    pub(crate) fn collect_released(&self, ids: &[BoId]) -> Vec<BoId> {
        ids.iter()
            .copied()
            .filter(|&id| self.arena[id].shared.refs.fetch_sub(1, Ordering::AcqRel) == 1)
            .collect()
    }
}
