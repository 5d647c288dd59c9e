#![allow(clippy::cast_possible_truncation)]

use crate::bufmgr::bo::BufferObject;
use crate::bufmgr::context::GpuContext;
use crate::bufmgr::exec::ExecFlags;
use crate::bufmgr::manager::{AllocHints, BufferManager};
use crate::error::{BufmgrError, BufmgrResult};

pub const MI_NOOP: u32 = 0;
pub const MI_BATCH_BUFFER_END: u32 = 0x0A << 23;

/// Dwords kept free for the end marker and its padding.
const TAIL_DWORDS: usize = 2;

/// Accumulates commands in CPU memory and submits them through a batch buffer object.
///
/// Each successful flush moves to a fresh buffer object so the next batch never waits
/// on the one the GPU is still executing.
pub struct BatchBuffer {
    mgr: BufferManager,
    name: String,
    bo: BufferObject,
    commands: Vec<u32>,
    capacity: usize,
}

impl BatchBuffer {
    /// # Errors
    /// Propagates allocation failures.
    pub fn new(mgr: &BufferManager, name: &str, size: u64) -> BufmgrResult<Self> {
        let bo = mgr.alloc(name, size, AllocHints::new())?;
        let capacity = usize::try_from(bo.size() / 4).unwrap_or(usize::MAX);
        Ok(Self {
            mgr: mgr.clone(),
            name: name.to_owned(),
            bo,
            commands: Vec::with_capacity(capacity),
            capacity,
        })
    }

    /// The buffer object the next flush submits.
    #[must_use]
    pub const fn bo(&self) -> &BufferObject {
        &self.bo
    }

    /// Bytes emitted so far.
    #[must_use]
    pub fn used(&self) -> u32 {
        (self.commands.len() * 4) as u32
    }

    fn reserve(&self, dwords: usize) -> BufmgrResult<()> {
        if self.commands.len() + dwords + TAIL_DWORDS > self.capacity {
            return Err(BufmgrError::InvalidCombination("batch buffer full"));
        }
        Ok(())
    }

    /// # Errors
    /// `InvalidCombination` once the batch is full.
    pub fn emit(&mut self, dword: u32) -> BufmgrResult<()> {
        self.reserve(1)?;
        self.commands.push(dword);
        Ok(())
    }

    /// Emits the 64-bit address of `target` plus `delta` and records the relocation.
    ///
    /// # Errors
    /// `InvalidCombination` once the batch is full; otherwise see
    /// [`BufferObject::emit_reloc`].
    pub fn emit_reloc(
        &mut self,
        target: &BufferObject,
        delta: u32,
        read_domains: u32,
        write_domain: u32,
    ) -> BufmgrResult<()> {
        self.reserve(2)?;
        let offset = self.used();
        let address = self
            .bo
            .emit_reloc(offset, target, delta, read_domains, write_domain)?;
        self.commands.push(address as u32);
        self.commands.push((address >> 32) as u32);
        Ok(())
    }

    /// Terminates the batch, uploads it and submits it.
    ///
    /// On failure the batch is rewound to its state before the call, relocations included,
    /// so it can be flushed again.
    ///
    /// # Errors
    /// Propagates upload and submission failures.
    pub fn flush(&mut self, ctx: Option<&GpuContext>, flags: ExecFlags) -> BufmgrResult<()> {
        if self.commands.is_empty() {
            return Ok(());
        }

        let mark = self.commands.len();
        self.commands.push(MI_BATCH_BUFFER_END);
        if self.commands.len() % 2 != 0 {
            self.commands.push(MI_NOOP);
        }

        if let Err(e) = self.submit(ctx, flags) {
            self.commands.truncate(mark);
            return Err(e);
        }

        log::trace!("batch {} flushed, {} bytes", self.name, self.used());
        self.commands.clear();
        self.bo = self.mgr.alloc(&self.name, self.bo.size(), AllocHints::new())?;
        Ok(())
    }

    fn submit(&self, ctx: Option<&GpuContext>, flags: ExecFlags) -> BufmgrResult<()> {
        let bytes: Vec<u8> = self
            .commands
            .iter()
            .flat_map(|dw| dw.to_le_bytes())
            .collect();
        self.bo.subdata(0, &bytes)?;

        match ctx {
            Some(ctx) => self.bo.context_exec(self.used(), ctx, flags),
            None => self.bo.exec(self.used(), flags),
        }
    }
}

impl std::fmt::Debug for BatchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchBuffer")
            .field("name", &self.name)
            .field("bo", &self.bo)
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufmgr::manager::ManagerConfig;
    use crate::bufmgr::mock::mock_manager;
    use crate::drm::ioctl::I915_GEM_DOMAIN_RENDER;

    fn dwords(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn flush_terminates_uploads_and_submits() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let mut batch = BatchBuffer::new(&mgr, "batch", 4096).unwrap();
        let first = batch.bo().handle();

        batch.emit(0x1234_5678).unwrap();
        assert_eq!(batch.used(), 4);
        batch.flush(None, ExecFlags::new()).unwrap();

        let execs = device.execs();
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].batch_len, 8);
        assert_eq!(execs[0].handles, vec![first]);
        assert_eq!(&dwords(&device.data(first))[..2], &[0x1234_5678, MI_BATCH_BUFFER_END]);

        assert_eq!(batch.used(), 0);
        assert_ne!(batch.bo().handle(), first);
        batch.flush(None, ExecFlags::new()).unwrap();
        assert_eq!(device.exec_count(), 1);
    }

    #[test]
    fn odd_batches_are_padded() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let mut batch = BatchBuffer::new(&mgr, "batch", 4096).unwrap();
        let handle = batch.bo().handle();
        batch.emit(1).unwrap();
        batch.emit(2).unwrap();
        batch.flush(None, ExecFlags::new()).unwrap();

        assert_eq!(device.execs()[0].batch_len, 16);
        assert_eq!(
            &dwords(&device.data(handle))[..4],
            &[1, 2, MI_BATCH_BUFFER_END, MI_NOOP]
        );
    }

    #[test]
    fn relocations_emit_presumed_addresses() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let target = mgr.alloc("target", 4096, AllocHints::new()).unwrap();
        target.set_softpin_offset(0x1_2345_0000);

        let mut batch = BatchBuffer::new(&mgr, "batch", 4096).unwrap();
        let handle = batch.bo().handle();
        batch.emit(0xdead).unwrap();
        batch
            .emit_reloc(&target, 0x10, I915_GEM_DOMAIN_RENDER, I915_GEM_DOMAIN_RENDER)
            .unwrap();
        assert_eq!(batch.bo().reloc_count(), 1);
        batch.flush(None, ExecFlags::new()).unwrap();

        assert_eq!(
            &dwords(&device.data(handle))[..3],
            &[0xdead, 0x2345_0010, 0x1]
        );
        assert_eq!(device.execs()[0].relocs, vec![0, 1]);
    }

    #[test]
    fn failed_flush_rewinds() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let target = mgr.alloc("target", 4096, AllocHints::new()).unwrap();
        let mut batch = BatchBuffer::new(&mgr, "batch", 4096).unwrap();
        batch
            .emit_reloc(&target, 0, I915_GEM_DOMAIN_RENDER, 0)
            .unwrap();

        device.fail_next_exec(libc::EIO);
        assert!(matches!(
            batch.flush(None, ExecFlags::new()),
            Err(BufmgrError::DeviceBusyOrLost)
        ));
        assert_eq!(batch.used(), 8);
        assert_eq!(batch.bo().reloc_count(), 1);

        batch.flush(None, ExecFlags::new()).unwrap();
        assert_eq!(device.execs()[0].batch_len, 16);
    }

    #[test]
    fn full_batch_is_refused() {
        let (_device, mgr) = mock_manager(ManagerConfig::default());
        let mut batch = BatchBuffer::new(&mgr, "batch", 4096).unwrap();
        for i in 0..1022 {
            batch.emit(i).unwrap();
        }
        assert!(matches!(
            batch.emit(0),
            Err(BufmgrError::InvalidCombination(_))
        ));
        let target = mgr.alloc("target", 4096, AllocHints::new()).unwrap();
        assert!(batch.emit_reloc(&target, 0, I915_GEM_DOMAIN_RENDER, 0).is_err());
        batch.flush(None, ExecFlags::new()).unwrap();
    }

    #[test]
    fn flush_on_a_context() {
        let (device, mgr) = mock_manager(ManagerConfig::default());
        let ctx = mgr.create_context().unwrap();
        let mut batch = BatchBuffer::new(&mgr, "batch", 4096).unwrap();
        batch.emit(0).unwrap();
        batch.flush(Some(&ctx), ExecFlags::new()).unwrap();
        assert_eq!(device.execs()[0].ctx_id, ctx.id());
    }
}
