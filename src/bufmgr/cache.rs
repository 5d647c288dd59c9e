use crate::bufmgr::Madvise;
use crate::bufmgr::bo::BoId;
use crate::bufmgr::manager::{ManagerState, Shared};
use crate::utils::PAGE_SIZE;
use std::collections::VecDeque;

/// Largest power-of-two step with its own bucket group.
pub const CACHE_MAX_SIZE: u64 = 64 * 1024 * 1024;

/// Cached objects older than this many seconds are released.
const CACHE_EXPIRY_SECS: u64 = 1;

/// Freed objects of one size class, oldest at the front.
#[derive(Debug)]
pub(crate) struct Bucket {
    pub size: u64,
    pub free: VecDeque<BoId>,
}

/// Size-class buckets of released, reusable buffer objects.
#[derive(Debug)]
pub(crate) struct BucketCache {
    buckets: Vec<Bucket>,
    /// Clock second of the last expiry sweep.
    last_cleanup: Option<u64>,
}

/// 4K, 8K, 12K, then four classes per power of two from 16K to 64M.
fn bucket_sizes() -> Vec<u64> {
    let mut sizes = vec![PAGE_SIZE, PAGE_SIZE * 2, PAGE_SIZE * 3];
    let mut size = PAGE_SIZE * 4;
    while size <= CACHE_MAX_SIZE {
        sizes.extend([size, size + size / 4, size + size * 2 / 4, size + size * 3 / 4]);
        size *= 2;
    }
    sizes
}

impl BucketCache {
    pub(crate) fn new() -> Self {
        Self {
            buckets: bucket_sizes()
                .into_iter()
                .map(|size| Bucket {
                    size,
                    free: VecDeque::new(),
                })
                .collect(),
            last_cleanup: None,
        }
    }

    /// Smallest bucket whose class size holds `size` bytes.
    pub(crate) fn bucket_for_size(&self, size: u64) -> Option<usize> {
        let index = self.buckets.partition_point(|b| b.size < size);
        (index < self.buckets.len()).then_some(index)
    }

    pub(crate) fn class_size(&self, bucket: usize) -> u64 {
        self.buckets[bucket].size
    }

    pub(crate) fn push(&mut self, bucket: usize, id: BoId) {
        self.buckets[bucket].free.push_back(id);
    }

    /// Most recently freed; likely still hot in the GPU caches.
    pub(crate) fn pop_mru(&mut self, bucket: usize) -> Option<BoId> {
        self.buckets[bucket].free.pop_back()
    }

    /// Least recently freed; most likely idle.
    pub(crate) fn peek_lru(&self, bucket: usize) -> Option<BoId> {
        self.buckets[bucket].free.front().copied()
    }

    pub(crate) fn pop_lru(&mut self, bucket: usize) -> Option<BoId> {
        self.buckets[bucket].free.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.free.len()).sum()
    }

    pub(crate) fn drain_all(&mut self) -> Vec<BoId> {
        self.buckets
            .iter_mut()
            .flat_map(|b| b.free.drain(..))
            .collect()
    }
}

impl Shared {
    /// Releases every object at the front of `bucket` the kernel has already purged.
    pub(crate) fn purge_bucket(&self, state: &mut ManagerState, bucket: usize) {
        while let Some(id) = state.cache.peek_lru(bucket) {
            if self.device.madvise(state.arena[id].handle, Madvise::DontNeed) {
                break;
            }
            state.cache.pop_lru(bucket);
            self.destroy(state, id);
        }
    }

    /// Takes a reusable object for `bucket` out of the cache, if one can be revived.
    ///
    /// With `for_render` the most recently freed object is taken, busy or not; otherwise
    /// only an idle least recently freed object qualifies.
    pub(crate) fn take_cached(
        &self,
        state: &mut ManagerState,
        bucket: usize,
        for_render: bool,
    ) -> Option<BoId> {
        loop {
            let id = if for_render {
                state.cache.pop_mru(bucket)?
            } else {
                let id = state.cache.peek_lru(bucket)?;
                if self.busy_locked(state, id) {
                    return None;
                }
                state.cache.pop_lru(bucket)?
            };

            if !self.device.madvise(state.arena[id].handle, Madvise::WillNeed) {
                // Pages are gone; so are probably those of its neighbours.
                self.destroy(state, id);
                self.purge_bucket(state, bucket);
                continue;
            }

            state.arena[id].free_time = None;
            return Some(id);
        }
    }

    /// Inserts a released object into its bucket, or returns false if it must be freed.
    pub(crate) fn try_cache(&self, state: &mut ManagerState, id: BoId, now: u64) -> bool {
        let entry = &state.arena[id];
        if !state.bo_reuse || !entry.reusable {
            return false;
        }
        let Some(bucket) = state.cache.bucket_for_size(entry.size) else {
            return false;
        };
        if state.cache.class_size(bucket) != entry.size {
            return false;
        }
        if !self.device.madvise(entry.handle, Madvise::DontNeed) {
            return false;
        }

        let entry = &mut state.arena[id];
        crate::bufmgr::vma::release(&mut state.vma, entry, self.device.as_ref());
        entry.free_time = Some(now);
        entry.graph.tree_fences = 0;
        entry.name.clear();
        entry.exec_async = false;
        entry.exec_capture = false;
        entry.pad_to_size = 0;
        state.cache.push(bucket, id);
        log::trace!("bo {} cached in bucket {bucket}", entry.handle);
        true
    }

    /// Releases cached objects that have sat unused for more than a second.
    ///
    /// Runs at most once per clock second.
    pub(crate) fn cleanup_cache(&self, state: &mut ManagerState, now: u64) {
        if state.cache.last_cleanup == Some(now) {
            return;
        }

        for bucket in 0..state.cache.buckets.len() {
            while let Some(id) = state.cache.peek_lru(bucket) {
                let freed_at = state.arena[id].free_time.unwrap_or(now);
                if now.saturating_sub(freed_at) <= CACHE_EXPIRY_SECS {
                    break;
                }
                state.cache.pop_lru(bucket);
                self.destroy(state, id);
            }
        }

        state.cache.last_cleanup = Some(now);
    }

    /// Frees every cached object.
    pub(crate) fn purge_cache(&self, state: &mut ManagerState) {
        for id in state.cache.drain_all() {
            self.destroy(state, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_classes() {
        let sizes = bucket_sizes();
        assert_eq!(&sizes[..7], &[4096, 8192, 12288, 16384, 20480, 24576, 28672]);
        assert_eq!(sizes.len(), 3 + 13 * 4);
        assert_eq!(*sizes.last().unwrap(), CACHE_MAX_SIZE + CACHE_MAX_SIZE * 3 / 4);
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn smallest_fitting_bucket() {
        let cache = BucketCache::new();
        assert_eq!(cache.bucket_for_size(1), Some(0));
        assert_eq!(cache.bucket_for_size(4096), Some(0));
        assert_eq!(cache.bucket_for_size(4097), Some(1));
        let b = cache.bucket_for_size(17 * 1024).unwrap();
        assert_eq!(cache.class_size(b), 20 * 1024);
        assert_eq!(cache.bucket_for_size(CACHE_MAX_SIZE * 2), None);
    }
}
