use gem_bufmgr::bufmgr::{AllocHints, BatchBuffer, ContextParam, ExecFlags, MapKind, Ring, Tiling};
use gem_bufmgr::drm::DrmDevice;
use gem_bufmgr::drm::ioctl::I915_GEM_DOMAIN_RENDER;
use gem_bufmgr::{BufferManager, ManagerConfig};

const MI_STORE_DWORD_IMM: u32 = (0x20 << 23) | 2;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("============================================================");
    println!("            GEM Buffer Manager - Alloc & Exec Test          ");
    println!("============================================================");

    // 1. Open the render node
    println!("[+] Opening render node...");
    let device = DrmDevice::open_render_node()?;
    let softpin = device.has_exec_softpin();
    println!("    Softpin supported: {softpin}");

    // 2. Initialize the manager
    let mut config = ManagerConfig::new().vma_max(64);
    if softpin {
        config = config.softpin();
    }
    let mgr = BufferManager::new(device, config)
        .map_err(|e| format!("Failed to initialize BufferManager (Err: {e})"))?;
    println!("    Aperture: {} MiB", mgr.aperture_size() >> 20);
    for engine in mgr.engines() {
        println!("    Engine: {:?} #{}", engine.class, engine.instance);
    }

    // 3. Allocate buffers
    println!("[+] Allocating buffers...");
    let target = mgr.alloc("target", 4096, AllocHints::new())?;
    let (surface, pitch) = mgr.alloc_tiled("surface", 256, 64, 4, Tiling::X)?;
    println!(
        "    target: handle {} size {}, surface: handle {} size {} pitch {pitch}",
        target.handle(),
        target.size(),
        surface.handle(),
        surface.size()
    );

    // 4. Write through a CPU mapping
    let ptr = target.map(MapKind::Cpu, true)?;
    // SAFETY: the mapping covers the whole object and nothing else aliases it.
    unsafe { ptr.as_ptr().write_bytes(0, 4096) };
    target.unmap(MapKind::Cpu);

    // 5. Build and submit a batch storing a dword into the target
    println!("[+] Submitting batch...");
    let ctx = mgr.create_context()?;
    println!("    Context {} priority {}", ctx.id(), ctx.get_param(ContextParam::Priority)?);

    let mut batch = BatchBuffer::new(&mgr, "batch", 4096)?;
    mgr.check_aperture_space(&[batch.bo(), &target])?;
    batch.emit(MI_STORE_DWORD_IMM)?;
    batch.emit_reloc(&target, 0, I915_GEM_DOMAIN_RENDER, I915_GEM_DOMAIN_RENDER)?;
    batch.emit(0xC0FF_EE00)?;
    batch.flush(Some(&ctx), ExecFlags::new().ring(Ring::Render))?;

    // 6. Wait and read back
    target.wait_rendering()?;
    let mut out = [0u8; 4];
    target.get_subdata(0, &mut out)?;
    println!("    target[0] = {:#x}", u32::from_le_bytes(out));
    println!("    target offset {:#x}", target.offset());

    drop(surface);
    println!(
        "[+] Done. {} objects live, {} cached",
        mgr.object_count(),
        mgr.cached_count()
    );
    Ok(())
}
