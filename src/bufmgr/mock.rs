//! In-memory `GemDevice` for unit tests.

use crate::bufmgr::manager::{BufferManager, ManagerConfig};
use crate::bufmgr::{
    EngineClass, EngineInfo, ExecBuffer, ExecObjectFlags, GemDevice, GemHandle, MapKind,
    Madvise, Tiling, TilingState,
};
use crate::drm::ioctl::I915_EXEC_FENCE_OUT;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

pub(crate) const MOCK_APERTURE: u64 = 256 * 1024 * 1024;
pub(crate) const MOCK_FENCES: u32 = 16;

/// One recorded submission.
#[derive(Debug, Clone)]
pub(crate) struct ExecRecord {
    pub handles: Vec<GemHandle>,
    pub flags: Vec<ExecObjectFlags>,
    pub relocs: Vec<usize>,
    pub offsets_in: Vec<u64>,
    pub offsets_out: Vec<u64>,
    pub batch_len: u32,
    pub ctx_id: u32,
    pub exec_flags: u64,
    pub in_fence: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: GemHandle,
    sizes: HashMap<GemHandle, u64>,
    data: HashMap<GemHandle, Vec<u8>>,
    tiling: HashMap<GemHandle, (Tiling, u32)>,
    created: usize,
    closed: Vec<GemHandle>,
    busy: HashSet<GemHandle>,
    reclaimed: HashSet<GemHandle>,
    fail_tiling: bool,
    fail_exec: Option<i32>,
    execs: Vec<ExecRecord>,
    next_offset: u64,
    mappings: HashMap<usize, u64>,
    mmaps: usize,
    munmaps: usize,
    names: HashMap<u32, GemHandle>,
    next_name: u32,
    prime_import: Option<GemHandle>,
    next_ctx: u32,
    destroyed_ctx: Vec<u32>,
    ctx_params: HashMap<(u32, u64), u64>,
}

#[derive(Debug)]
pub(crate) struct MockDevice {
    state: Mutex<MockState>,
    engines: Vec<EngineInfo>,
    exec_delay: Duration,
    in_exec: AtomicBool,
    overlaps: AtomicUsize,
}

impl MockDevice {
    pub(crate) fn new() -> Arc<Self> {
        Self::build(Duration::ZERO)
    }

    /// Each submission sleeps for `delay` inside the kernel call.
    pub(crate) fn with_exec_delay(delay: Duration) -> Arc<Self> {
        Self::build(delay)
    }

    fn build(exec_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                next_offset: 0x10_0000,
                next_name: 1,
                next_ctx: 1,
                ..MockState::default()
            }),
            engines: vec![
                EngineInfo {
                    class: EngineClass::Render,
                    instance: 0,
                },
                EngineInfo {
                    class: EngineClass::Copy,
                    instance: 0,
                },
            ],
            exec_delay,
            in_exec: AtomicBool::new(false),
            overlaps: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    fn new_handle(state: &mut MockState, size: u64) -> GemHandle {
        let handle = state.next_handle;
        state.next_handle += 1;
        state.sizes.insert(handle, size);
        handle
    }

    pub(crate) fn set_busy(&self, handle: GemHandle, busy: bool) {
        let mut state = self.lock();
        if busy {
            state.busy.insert(handle);
        } else {
            state.busy.remove(&handle);
        }
    }

    /// The kernel drops the backing pages of `handle`.
    pub(crate) fn reclaim(&self, handle: GemHandle) {
        self.lock().reclaimed.insert(handle);
    }

    pub(crate) fn fail_set_tiling(&self, fail: bool) {
        self.lock().fail_tiling = fail;
    }

    pub(crate) fn fail_next_exec(&self, errno: i32) {
        self.lock().fail_exec = Some(errno);
    }

    /// The next dma-buf import resolves to `handle`.
    pub(crate) fn set_prime_import(&self, handle: GemHandle) {
        self.lock().prime_import = Some(handle);
    }

    pub(crate) fn execs(&self) -> Vec<ExecRecord> {
        self.lock().execs.clone()
    }

    pub(crate) fn exec_count(&self) -> usize {
        self.lock().execs.len()
    }

    pub(crate) fn created(&self) -> usize {
        self.lock().created
    }

    pub(crate) fn closed(&self) -> Vec<GemHandle> {
        self.lock().closed.clone()
    }

    pub(crate) fn map_calls(&self) -> (usize, usize) {
        let state = self.lock();
        (state.mmaps, state.munmaps)
    }

    pub(crate) fn destroyed_contexts(&self) -> Vec<u32> {
        self.lock().destroyed_ctx.clone()
    }

    pub(crate) fn data(&self, handle: GemHandle) -> Vec<u8> {
        self.lock().data.get(&handle).cloned().unwrap_or_default()
    }

    pub(crate) fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

fn no_such_object() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

impl GemDevice for MockDevice {
    fn create(&self, size: u64) -> io::Result<GemHandle> {
        let mut state = self.lock();
        state.created += 1;
        Ok(Self::new_handle(&mut state, size))
    }

    fn close(&self, handle: GemHandle) -> io::Result<()> {
        let mut state = self.lock();
        state.sizes.remove(&handle).ok_or_else(no_such_object)?;
        state.data.remove(&handle);
        state.closed.push(handle);
        Ok(())
    }

    fn userptr(&self, _ptr: NonNull<u8>, size: u64, _read_only: bool) -> io::Result<GemHandle> {
        Ok(Self::new_handle(&mut self.lock(), size))
    }

    fn set_tiling(&self, handle: GemHandle, mode: Tiling, stride: u32) -> io::Result<TilingState> {
        let mut state = self.lock();
        if state.fail_tiling {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.tiling.insert(handle, (mode, stride));
        Ok(TilingState {
            mode,
            swizzle: 0,
            stride,
        })
    }

    fn get_tiling(&self, handle: GemHandle) -> io::Result<(Tiling, u32)> {
        let state = self.lock();
        Ok((state.tiling.get(&handle).map_or(Tiling::None, |t| t.0), 0))
    }

    fn mmap(&self, handle: GemHandle, size: u64, _kind: MapKind) -> io::Result<NonNull<u8>> {
        let mut state = self.lock();
        if !state.sizes.contains_key(&handle) {
            return Err(no_such_object());
        }
        let len = usize::try_from(size).map_err(|_| io::Error::from_raw_os_error(libc::ENOMEM))?;
        let buf = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(buf).cast::<u8>()).ok_or_else(no_such_object)?;
        state.mappings.insert(ptr.as_ptr() as usize, size);
        state.mmaps += 1;
        Ok(ptr)
    }

    fn munmap(&self, ptr: NonNull<u8>, size: u64) -> io::Result<()> {
        let mut state = self.lock();
        let mapped = state
            .mappings
            .remove(&(ptr.as_ptr() as usize))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        assert_eq!(mapped, size);
        state.munmaps += 1;
        let len = usize::try_from(size).unwrap();
        // SAFETY: the pointer came from a leaked boxed slice of `len` bytes in `mmap`.
        drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)) });
        Ok(())
    }

    fn set_domain(&self, handle: GemHandle, _read: u32, _write: u32) -> io::Result<()> {
        self.lock().busy.remove(&handle);
        Ok(())
    }

    fn pread(&self, handle: GemHandle, offset: u64, out: &mut [u8]) -> io::Result<()> {
        let state = self.lock();
        let start = usize::try_from(offset).unwrap();
        let data = state.data.get(&handle);
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = data.and_then(|d| d.get(start + i)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn pwrite(&self, handle: GemHandle, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        let size = *state.sizes.get(&handle).ok_or_else(no_such_object)?;
        let data = state
            .data
            .entry(handle)
            .or_insert_with(|| vec![0; usize::try_from(size).unwrap()]);
        let start = usize::try_from(offset).unwrap();
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn busy(&self, handle: GemHandle) -> io::Result<bool> {
        Ok(self.lock().busy.contains(&handle))
    }

    fn madvise(&self, handle: GemHandle, _advice: Madvise) -> bool {
        !self.lock().reclaimed.contains(&handle)
    }

    fn wait(&self, handle: GemHandle, timeout_ns: i64) -> io::Result<()> {
        let mut state = self.lock();
        if timeout_ns >= 0 && state.busy.contains(&handle) {
            return Err(io::Error::from_raw_os_error(libc::ETIME));
        }
        state.busy.remove(&handle);
        Ok(())
    }

    fn execbuffer(&self, exec: &mut ExecBuffer<'_>) -> io::Result<()> {
        if self.in_exec.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        if !self.exec_delay.is_zero() {
            thread::sleep(self.exec_delay);
        }

        let mut state = self.lock();
        let result = match state.fail_exec.take() {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => {
                let offsets_in: Vec<u64> = exec.objects.iter().map(|o| o.offset).collect();
                for object in &mut exec.objects {
                    if !object.flags.contains(ExecObjectFlags::PINNED) {
                        object.offset = state.next_offset;
                        state.next_offset += 0x1000;
                    }
                    state.busy.insert(object.handle);
                }
                state.execs.push(ExecRecord {
                    handles: exec.objects.iter().map(|o| o.handle).collect(),
                    flags: exec.objects.iter().map(|o| o.flags).collect(),
                    relocs: exec.objects.iter().map(|o| o.relocs.len()).collect(),
                    offsets_in,
                    offsets_out: exec.objects.iter().map(|o| o.offset).collect(),
                    batch_len: exec.batch_len,
                    ctx_id: exec.ctx_id,
                    exec_flags: exec.flags,
                    in_fence: exec.in_fence.is_some(),
                });
                if exec.flags & I915_EXEC_FENCE_OUT == 0 {
                    Ok(())
                } else {
                    File::open("/dev/null").map(|f| exec.out_fence = Some(f.into()))
                }
            }
        };
        drop(state);

        self.in_exec.store(false, Ordering::SeqCst);
        result
    }

    fn pin(&self, _handle: GemHandle, _alignment: u64) -> io::Result<u64> {
        Ok(0x20_0000)
    }

    fn context_create(&self) -> io::Result<u32> {
        let mut state = self.lock();
        let id = state.next_ctx;
        state.next_ctx += 1;
        Ok(id)
    }

    fn context_destroy(&self, ctx_id: u32) -> io::Result<()> {
        self.lock().destroyed_ctx.push(ctx_id);
        Ok(())
    }

    fn context_get_param(&self, ctx_id: u32, param: u64) -> io::Result<u64> {
        Ok(self
            .lock()
            .ctx_params
            .get(&(ctx_id, param))
            .copied()
            .unwrap_or(0))
    }

    fn context_set_param(&self, ctx_id: u32, param: u64, value: u64) -> io::Result<()> {
        self.lock().ctx_params.insert((ctx_id, param), value);
        Ok(())
    }

    fn flink(&self, handle: GemHandle) -> io::Result<u32> {
        let mut state = self.lock();
        let name = state.next_name;
        state.next_name += 1;
        state.names.insert(name, handle);
        Ok(name)
    }

    fn open_name(&self, name: u32) -> io::Result<(GemHandle, u64)> {
        let mut state = self.lock();
        let original = *state.names.get(&name).ok_or_else(no_such_object)?;
        let size = state.sizes[&original];
        Ok((Self::new_handle(&mut state, size), size))
    }

    fn prime_handle_to_fd(&self, _handle: GemHandle) -> io::Result<OwnedFd> {
        Ok(File::open("/dev/null")?.into())
    }

    fn prime_fd_to_handle(&self, _fd: BorrowedFd<'_>) -> io::Result<GemHandle> {
        let mut state = self.lock();
        match state.prime_import.take() {
            Some(handle) => Ok(handle),
            None => Ok(Self::new_handle(&mut state, 4096)),
        }
    }

    fn query_engines(&self) -> io::Result<Vec<EngineInfo>> {
        Ok(self.engines.clone())
    }

    fn aperture_size(&self) -> io::Result<u64> {
        Ok(MOCK_APERTURE)
    }

    fn available_fences(&self) -> io::Result<u32> {
        Ok(MOCK_FENCES)
    }
}

/// A manager over a fresh mock device, keeping a handle to the device for inspection.
pub(crate) fn mock_manager(config: ManagerConfig) -> (Arc<MockDevice>, BufferManager) {
    let device = MockDevice::new();
    let mgr = BufferManager::new(Arc::clone(&device), config).unwrap();
    (device, mgr)
}
