use crate::bufmgr::ExecObjectFlags;
use crate::bufmgr::bo::{BoArena, BoId, BufferObject};
use crate::bufmgr::manager::{ManagerState, Shared};
use crate::drm::ioctl::GemRelocationEntry;
use crate::error::{BufmgrError, BufmgrResult};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;

// ===============================================================================================
// Relocation Graph
// ===============================================================================================

/// An outgoing relocation or softpin edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Edge {
    pub target: BoId,
    pub flags: ExecObjectFlags,
}

/// Outgoing edges of one buffer object plus its aperture bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct RelocGraph {
    /// Kernel relocation records, parallel to `reloc_edges`.
    pub relocs: Vec<GemRelocationEntry>,
    pub reloc_edges: Vec<Edge>,
    /// Reserved relocation slots; `None` until the first relocation.
    pub capacity: Option<usize>,
    pub softpin_edges: Vec<Edge>,
    /// Sources of incoming edges, one entry per edge.
    pub referrers: Vec<BoId>,
    /// Conservative aperture footprint of the object and everything it references.
    pub tree_size: u64,
    pub tree_fences: u32,
}

impl RelocGraph {
    pub(crate) fn new(size: u64) -> Self {
        Self {
            tree_size: size,
            ..Default::default()
        }
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.reloc_edges.len() + self.softpin_edges.len()
    }

    /// Relocation edges first, then softpin edges.
    pub(crate) fn edge(&self, i: usize) -> Option<Edge> {
        match self.reloc_edges.get(i) {
            Some(edge) => Some(*edge),
            None => self.softpin_edges.get(i - self.reloc_edges.len()).copied(),
        }
    }

    pub(crate) fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        self.reloc_edges.iter().chain(&self.softpin_edges).copied()
    }
}

/// Parameters of a single relocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RelocRequest {
    pub offset: u32,
    pub target: BoId,
    pub delta: u32,
    pub read_domains: u32,
    pub write_domain: u32,
    pub need_fence: bool,
}

/// Adds `delta` to the tree size of `start` and of every object that transitively
/// references it. Each object is visited once, even with several paths to it.
fn propagate_tree_growth(arena: &mut BoArena, start: BoId, delta: u64) {
    let mut visited = HashSet::new();
    let mut pending = vec![start];

    while let Some(id) = pending.pop() {
        if !visited.insert(id) {
            continue;
        }
        let graph = &mut arena[id].graph;
        graph.tree_size = graph.tree_size.saturating_add(delta);
        pending.extend(graph.referrers.iter().copied());
    }
}

fn forget_referrer(arena: &mut BoArena, target: BoId, source: BoId) {
    let referrers = &mut arena[target].graph.referrers;
    if let Some(pos) = referrers.iter().position(|&r| r == source) {
        referrers.swap_remove(pos);
    }
}

impl ManagerState {
    /// Recomputes the tree size of `id` from its remaining direct edges.
    pub(crate) fn recompute_tree_size(&mut self, id: BoId) {
        let entry = &self.arena[id];
        let children: u64 = entry
            .graph
            .edges()
            .filter(|edge| edge.target != id)
            .map(|edge| self.arena[edge.target].graph.tree_size)
            .fold(0, u64::saturating_add);
        let total = (entry.size + entry.align).saturating_add(children);
        self.arena[id].graph.tree_size = total;
    }

    /// Detaches relocation edges from index `reloc_start` on, and every softpin edge.
    ///
    /// Returns the targets whose edge references must be released.
    pub(crate) fn detach_edges(&mut self, id: BoId, reloc_start: usize) -> Vec<BoId> {
        let graph = &mut self.arena[id].graph;
        let start = reloc_start.min(graph.reloc_edges.len());
        graph.relocs.truncate(start);
        let relocs: Vec<Edge> = graph.reloc_edges.drain(start..).collect();
        let softpins: Vec<Edge> = graph.softpin_edges.drain(..).collect();

        let mut released = Vec::with_capacity(relocs.len() + softpins.len());
        for edge in &relocs {
            if edge.target == id {
                continue;
            }
            let fences = self.arena[edge.target].graph.tree_fences;
            let graph = &mut self.arena[id].graph;
            graph.tree_fences = graph.tree_fences.saturating_sub(fences);
            forget_referrer(&mut self.arena, edge.target, id);
            released.push(edge.target);
        }
        for edge in &softpins {
            forget_referrer(&mut self.arena, edge.target, id);
            released.push(edge.target);
        }

        self.recompute_tree_size(id);
        released
    }
}

impl Shared {
    fn check_sources(&self, state: &ManagerState, source: BoId, target: BoId) -> BufmgrResult<()> {
        if state.arena[source].is_poisoned() {
            return Err(BufmgrError::OutOfMemory);
        }
        if state.arena[target].is_poisoned() {
            state.arena[source].poison();
            return Err(BufmgrError::OutOfMemory);
        }
        Ok(())
    }

    fn setup_reloc_list(&self, state: &mut ManagerState, id: BoId) -> BufmgrResult<usize> {
        let entry = &mut state.arena[id];
        if let Some(capacity) = entry.graph.capacity {
            return Ok(capacity);
        }

        let by_size = usize::try_from(entry.size / 4).unwrap_or(usize::MAX);
        let capacity = self.config.max_relocs.min(by_size);
        let graph = &mut entry.graph;
        if capacity == 0
            || graph.relocs.try_reserve_exact(capacity).is_err()
            || graph.reloc_edges.try_reserve_exact(capacity).is_err()
        {
            log::error!("bo {}: failed to reserve {capacity} relocations", entry.handle);
            entry.poison();
            return Err(BufmgrError::OutOfMemory);
        }
        entry.graph.capacity = Some(capacity);
        Ok(capacity)
    }

    /// Records a relocation from `source` and returns the presumed target address.
    pub(crate) fn emit_reloc_locked(
        &self,
        state: &mut ManagerState,
        source: BoId,
        req: RelocRequest,
    ) -> BufmgrResult<u64> {
        self.check_sources(state, source, req.target)?;

        let capacity = self.setup_reloc_list(state, source)?;
        let entry = &state.arena[source];
        if entry.graph.relocs.len() >= capacity {
            log::error!("bo {}: relocation list full ({capacity})", entry.handle);
            entry.poison();
            return Err(BufmgrError::OutOfMemory);
        }
        if u64::from(req.offset) + 4 > entry.size {
            return Err(BufmgrError::InvalidCombination("relocation outside the object"));
        }
        if req.write_domain & req.write_domain.wrapping_sub(1) != 0 {
            return Err(BufmgrError::InvalidCombination("more than one write domain"));
        }

        if req.need_fence {
            state.arena[req.target].graph.tree_fences = 1;
        }

        let target = &state.arena[req.target];
        // Only what belongs to the edge; the target's own flags are read at list build time.
        let mut flags = ExecObjectFlags::empty();
        flags.set(ExecObjectFlags::NEEDS_FENCE, req.need_fence);
        let presumed_offset = target.offset;
        let reloc = GemRelocationEntry {
            target_handle: target.handle,
            delta: req.delta,
            offset: u64::from(req.offset),
            presumed_offset,
            read_domains: req.read_domains,
            write_domain: req.write_domain,
        };

        if req.target != source {
            let (tree_size, tree_fences) = (target.graph.tree_size, target.graph.tree_fences);
            target.shared.refs.fetch_add(1, Ordering::Relaxed);
            state.arena[req.target].graph.referrers.push(source);
            let graph = &mut state.arena[source].graph;
            graph.tree_fences = graph.tree_fences.saturating_add(tree_fences);
            propagate_tree_growth(&mut state.arena, source, tree_size);
        }

        let graph = &mut state.arena[source].graph;
        graph.relocs.push(reloc);
        graph.reloc_edges.push(Edge {
            target: req.target,
            flags,
        });

        Ok(presumed_offset.wrapping_add(u64::from(req.delta)))
    }

    pub(crate) fn add_softpin_target_locked(
        &self,
        state: &mut ManagerState,
        source: BoId,
        target: BoId,
        write: bool,
    ) -> BufmgrResult<()> {
        self.check_sources(state, source, target)?;

        if source == target {
            return Err(BufmgrError::InvalidCombination("softpin edge to itself"));
        }
        let entry = &state.arena[target];
        if !entry.softpin {
            return Err(BufmgrError::InvalidCombination("softpin target is not pinned"));
        }

        let mut flags = ExecObjectFlags::PINNED;
        flags.set(ExecObjectFlags::WRITE, write);
        let tree_size = entry.graph.tree_size;

        if state.arena[source].graph.softpin_edges.try_reserve(1).is_err() {
            return Err(BufmgrError::OutOfMemory);
        }
        state.arena[target].shared.refs.fetch_add(1, Ordering::Relaxed);
        state.arena[target].graph.referrers.push(source);
        state.arena[source]
            .graph
            .softpin_edges
            .push(Edge { target, flags });
        propagate_tree_growth(&mut state.arena, source, tree_size);
        Ok(())
    }

    /// Depth-first search of the edges below `source`.
    pub(crate) fn references_locked(state: &ManagerState, source: BoId, target: BoId) -> bool {
        let mut visited = HashSet::new();
        let mut pending = vec![source];

        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            for edge in state.arena[id].graph.edges() {
                if edge.target == target {
                    return true;
                }
                pending.push(edge.target);
            }
        }
        false
    }
}

// ===============================================================================================
// Validation List
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValidationEntry {
    pub id: BoId,
    pub flags: ExecObjectFlags,
}

/// Deduplicated, dependency-ordered list of the objects a submission touches.
///
/// Every object appears after everything it references; the root is last.
#[derive(Debug, Default)]
pub(crate) struct ValidationList {
    pub entries: Vec<ValidationEntry>,
}

struct Frame {
    id: BoId,
    next_edge: usize,
    flags: ExecObjectFlags,
}

impl ValidationList {
    pub(crate) fn build(arena: &BoArena, root: BoId) -> Self {
        let mut entries: Vec<ValidationEntry> = Vec::new();
        let mut listed: HashMap<BoId, usize> = HashMap::new();
        let mut on_stack: HashSet<BoId> = HashSet::from([root]);
        let mut stack = vec![Frame {
            id: root,
            next_edge: 0,
            flags: arena[root].own_flags(),
        }];

        while let Some(top) = stack.last_mut() {
            let from = top.id;
            top.next_edge += 1;
            let next = arena[from].graph.edge(top.next_edge - 1);

            let Some(edge) = next else {
                // All children listed; the object itself follows them.
                if let Some(done) = stack.pop() {
                    on_stack.remove(&done.id);
                    listed.insert(done.id, entries.len());
                    entries.push(ValidationEntry {
                        id: done.id,
                        flags: done.flags,
                    });
                }
                continue;
            };

            let to = edge.target;
            if to == from {
                continue;
            }
            let flags = edge.flags | arena[to].own_flags();
            if let Some(&index) = listed.get(&to) {
                entries[index].flags |= flags;
                continue;
            }
            if on_stack.contains(&to) {
                // Cycle: the object is already being listed further up.
                if let Some(frame) = stack.iter_mut().find(|f| f.id == to) {
                    frame.flags |= flags;
                }
                continue;
            }

            on_stack.insert(to);
            stack.push(Frame {
                id: to,
                next_edge: 0,
                flags,
            });
        }

        Self { entries }
    }

    /// One list for several roots: shared targets appear once, the roots follow in order.
    pub(crate) fn build_many(arena: &BoArena, roots: &[BoId]) -> Self {
        if let [root] = roots {
            return Self::build(arena, *root);
        }

        let mut root_flags: Vec<ExecObjectFlags> =
            roots.iter().map(|&id| arena[id].own_flags()).collect();
        let mut entries: Vec<ValidationEntry> = Vec::new();
        let mut listed: HashMap<BoId, usize> = HashMap::new();

        for &root in roots {
            for item in Self::build(arena, root).entries {
                if let Some(pos) = roots.iter().position(|&r| r == item.id) {
                    root_flags[pos] |= item.flags;
                } else if let Some(&index) = listed.get(&item.id) {
                    entries[index].flags |= item.flags;
                } else {
                    listed.insert(item.id, entries.len());
                    entries.push(item);
                }
            }
        }

        entries.extend(
            roots
                .iter()
                .zip(root_flags)
                .map(|(&id, flags)| ValidationEntry { id, flags }),
        );
        Self { entries }
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = BoId> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn dump(&self, arena: &BoArena) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        for entry in &self.entries {
            let bo = &arena[entry.id];
            log::debug!(
                "validate {} ({}) size {} offset {:#x} flags {:?} relocs {} softpins {}",
                bo.handle,
                bo.name,
                bo.size,
                bo.offset,
                entry.flags,
                bo.graph.reloc_edges.len(),
                bo.graph.softpin_edges.len(),
            );
        }
    }
}

// ===============================================================================================
// Handle API
// ===============================================================================================

impl BufferObject {
    fn check_peer(&self, target: &Self) -> BufmgrResult<()> {
        if !self.same_manager(target) {
            return Err(BufmgrError::InvalidCombination(
                "objects belong to different managers",
            ));
        }
        Ok(())
    }

    fn emit(&self, req: RelocRequest) -> BufmgrResult<u64> {
        let mut state = self.mgr.lock();
        self.mgr.emit_reloc_locked(&mut state, self.id, req)
    }

    /// Records that the dword at `offset` must hold the address of `target` plus `delta`.
    ///
    /// Returns the presumed address to write at `offset`. A self-relocation takes no
    /// reference on the object.
    ///
    /// # Errors
    /// `OutOfMemory` if either object is poisoned or relocation storage is exhausted, which
    /// poisons this object. `InvalidCombination` for an out-of-range offset or more than one
    /// write domain.
    pub fn emit_reloc(
        &self,
        offset: u32,
        target: &Self,
        delta: u32,
        read_domains: u32,
        write_domain: u32,
    ) -> BufmgrResult<u64> {
        self.check_peer(target)?;
        self.emit(RelocRequest {
            offset,
            target: target.id,
            delta,
            read_domains,
            write_domain,
            need_fence: false,
        })
    }

    /// Like [`BufferObject::emit_reloc`], for a target accessed through a fence register.
    ///
    /// # Errors
    /// See [`BufferObject::emit_reloc`].
    pub fn emit_reloc_fence(
        &self,
        offset: u32,
        target: &Self,
        delta: u32,
        read_domains: u32,
        write_domain: u32,
    ) -> BufmgrResult<u64> {
        self.check_peer(target)?;
        self.emit(RelocRequest {
            offset,
            target: target.id,
            delta,
            read_domains,
            write_domain,
            need_fence: true,
        })
    }

    /// Declares that the next submission using this object also touches the pinned `target`.
    ///
    /// # Errors
    /// `InvalidCombination` if `target` is this object or is not pinned. `OutOfMemory` if
    /// either object is poisoned.
    pub fn add_softpin_target(&self, target: &Self, write: bool) -> BufmgrResult<()> {
        self.check_peer(target)?;
        let mut state = self.mgr.lock();
        self.mgr
            .add_softpin_target_locked(&mut state, self.id, target.id, write)
    }

    /// Drops relocations from index `start` on, and every softpin edge.
    ///
    /// # Errors
    /// `InvalidCombination` if `start` is past the current relocation count.
    pub fn clear_relocs(&self, start: usize) -> BufmgrResult<()> {
        let mut state = self.mgr.lock();
        if start > state.arena[self.id].graph.reloc_edges.len() {
            return Err(BufmgrError::InvalidCombination("relocation index out of range"));
        }
        let released = state.detach_edges(self.id, start);
        let now = self.mgr.now();
        self.mgr.release_refs(&mut state, &released, now);
        Ok(())
    }

    #[must_use]
    pub fn reloc_count(&self) -> usize {
        self.mgr.lock().arena[self.id].graph.reloc_edges.len()
    }

    #[must_use]
    pub fn softpin_target_count(&self) -> usize {
        self.mgr.lock().arena[self.id].graph.softpin_edges.len()
    }

    /// Whether `target` is reachable through this object's relocation or softpin edges.
    #[must_use]
    pub fn references(&self, target: &Self) -> bool {
        if !self.same_manager(target) {
            return false;
        }
        let state = self.mgr.lock();
        Shared::references_locked(&state, self.id, target.id)
    }

    /// Marks the first relocation and softpin edge to `target` as asynchronous.
    pub fn set_exec_object_async(&self, target: &Self) {
        let mut state = self.mgr.lock();
        let graph = &mut state.arena[self.id].graph;
        if let Some(edge) = graph.reloc_edges.iter_mut().find(|e| e.target == target.id) {
            edge.flags |= ExecObjectFlags::ASYNC;
        }
        if let Some(edge) = graph.softpin_edges.iter_mut().find(|e| e.target == target.id) {
            edge.flags |= ExecObjectFlags::ASYNC;
        }
    }
}
