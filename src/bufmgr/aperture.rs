use crate::bufmgr::bo::{BoArena, BoId, BufferObject};
use crate::bufmgr::manager::{BufferManager, Shared};
use crate::error::{BufmgrError, BufmgrResult};
use std::collections::HashSet;

/// Share of the aperture a batch may use before the precise walk is needed.
const APERTURE_THRESHOLD_NUM: u64 = 3;
const APERTURE_THRESHOLD_DEN: u64 = 4;

/// Sum of cached tree sizes. Overcounts objects reachable along several paths.
pub(crate) fn estimate_batch_space(arena: &BoArena, ids: &[BoId]) -> u64 {
    ids.iter()
        .map(|&id| arena[id].graph.tree_size)
        .fold(0, u64::saturating_add)
}

/// Size of every object reachable from `root` that is not yet in `visited`.
fn tree_space(arena: &BoArena, root: BoId, visited: &mut HashSet<BoId>) -> u64 {
    let mut total = 0u64;
    let mut pending = vec![root];

    while let Some(id) = pending.pop() {
        if !visited.insert(id) {
            continue;
        }
        let entry = &arena[id];
        total = total.saturating_add(entry.size);
        pending.extend(entry.graph.edges().map(|edge| edge.target));
    }
    total
}

/// Exact aperture use of the batch, each object counted once.
///
/// The first object's cached tree size is replaced with its exact value, so later
/// estimates starting from it are tighter.
pub(crate) fn compute_batch_space(arena: &mut BoArena, ids: &[BoId]) -> u64 {
    let mut visited = HashSet::new();
    let mut total = 0u64;

    for (i, &id) in ids.iter().enumerate() {
        total = total.saturating_add(tree_space(arena, id, &mut visited));
        if i == 0 {
            arena[id].graph.tree_size = total;
        }
    }
    total
}

pub(crate) fn total_fences(arena: &BoArena, ids: &[BoId]) -> u32 {
    ids.iter()
        .map(|&id| arena[id].graph.tree_fences)
        .fold(0, u32::saturating_add)
}

impl Shared {
    pub(crate) fn aperture_threshold(&self) -> u64 {
        self.aperture_size / APERTURE_THRESHOLD_DEN * APERTURE_THRESHOLD_NUM
    }

    /// Checks whether the objects and everything they reference fit the aperture and
    /// fence budget. Issues no kernel calls.
    pub(crate) fn check_aperture_locked(&self, arena: &mut BoArena, ids: &[BoId]) -> BufmgrResult<()> {
        if self.available_fences > 0 {
            let fences = total_fences(arena, ids);
            if fences > self.available_fences {
                log::debug!(
                    "check_space: {fences} fences needed, {} available",
                    self.available_fences
                );
                return Err(BufmgrError::AddressSpaceExhausted);
            }
        }

        let threshold = self.aperture_threshold();
        let mut total = estimate_batch_space(arena, ids);
        if total > threshold {
            total = compute_batch_space(arena, ids);
        }

        if total > threshold {
            log::debug!(
                "check_space: overflowed available aperture, {}kb vs {}kb",
                total / 1024,
                self.aperture_size / 1024
            );
            return Err(BufmgrError::AddressSpaceExhausted);
        }
        log::trace!(
            "check_space: total {}kb vs {}kb",
            total / 1024,
            self.aperture_size / 1024
        );
        Ok(())
    }
}

impl BufferManager {
    fn ids_of(&self, bos: &[&BufferObject]) -> BufmgrResult<Vec<BoId>> {
        bos.iter()
            .map(|bo| {
                if bo.same_manager_as(self) {
                    Ok(bo.id)
                } else {
                    Err(BufmgrError::InvalidCombination(
                        "object belongs to another manager",
                    ))
                }
            })
            .collect()
    }

    /// Checks whether a batch built from `bos` would fit the aperture.
    ///
    /// Call before emitting relocations into a batch; if it fails, flush first.
    ///
    /// # Errors
    /// `AddressSpaceExhausted` if the batch would not fit or needs more fences than exist.
    pub fn check_aperture_space(&self, bos: &[&BufferObject]) -> BufmgrResult<()> {
        let ids = self.ids_of(bos)?;
        let mut state = self.shared.lock();
        self.shared.check_aperture_locked(&mut state.arena, &ids)
    }

    /// Fast upper bound of the aperture use of `bos`.
    ///
    /// # Errors
    /// `InvalidCombination` if an object belongs to another manager.
    pub fn estimate_batch_space(&self, bos: &[&BufferObject]) -> BufmgrResult<u64> {
        let ids = self.ids_of(bos)?;
        let state = self.shared.lock();
        Ok(estimate_batch_space(&state.arena, &ids))
    }

    /// Exact aperture use of `bos`, counting shared objects once.
    ///
    /// # Errors
    /// `InvalidCombination` if an object belongs to another manager.
    pub fn compute_batch_space(&self, bos: &[&BufferObject]) -> BufmgrResult<u64> {
        let ids = self.ids_of(bos)?;
        let mut state = self.shared.lock();
        Ok(compute_batch_space(&mut state.arena, &ids))
    }
}

impl BufferObject {
    /// Exact aperture use of this object and everything it references.
    #[must_use]
    pub fn get_aperture_space(&self) -> u64 {
        let state = self.mgr.lock();
        tree_space(&state.arena, self.id, &mut HashSet::new())
    }
}
