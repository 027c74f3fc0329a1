//! The two allocators that sit above the emulator's own page tables (§4.3):
//! a page-granular map allocator handing out fresh address ranges, and a
//! sub-page allocator carving individual allocations out of those ranges
//! with a coalescing free list. `mem_bind` layers host-memory proxying on
//! top of both.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::trace;

use dbgcore_emulator::{Emulator, HookCallback, HookType, MemAccess, MemProt, MemRegion};

use crate::errors::{DbgError, Result};
use crate::hook::HookManager;

/// Anything that can serialize a closure onto whichever thread owns the
/// emulator. The scheduler is the only implementer; `MemoryManager` is
/// handed one as a trait object so this module never has to depend on
/// `crate::runner` directly.
///
/// §9: on every target the memory manager picks the conservative option
/// and always funnels map/unmap through this, rather than special-casing
/// platforms known to need it and risking a silent bug on ones that
/// weren't tested.
pub trait MainThreadRunner: Send + Sync {
    fn main_thread_run(&self, job: Box<dyn FnOnce() + Send>);
}

const DEFAULT_MAP_BASE: u64 = 0x0040_0000;

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Page-granular allocator. Hands out fresh address ranges from a
/// monotonically-advancing cursor and tracks what is currently mapped so
/// `unmap` can split or shrink overlapping ranges instead of requiring an
/// exact address+size match.
pub struct MapAllocator {
    emu: Arc<dyn Emulator>,
    runner: Arc<dyn MainThreadRunner>,
    cursor: Mutex<u64>,
    directory: Mutex<BTreeMap<u64, MemRegion>>,
}

impl MapAllocator {
    pub fn new(emu: Arc<dyn Emulator>, runner: Arc<dyn MainThreadRunner>, base: Option<u64>) -> Self {
        MapAllocator {
            emu,
            runner,
            cursor: Mutex::new(base.unwrap_or(DEFAULT_MAP_BASE)),
            directory: Mutex::new(BTreeMap::new()),
        }
    }

    fn serialized<T: Send + 'static>(&self, f: impl FnOnce() -> T + Send + 'static) -> T {
        let (tx, rx) = crossbeam::channel::bounded(1);
        self.runner.main_thread_run(Box::new(move || {
            let _ = tx.send(f());
        }));
        rx.recv().expect("main thread run always completes the job")
    }

    /// Maps a fresh, page-aligned range of at least `size` bytes and
    /// returns its base address.
    pub fn map(&self, size: u64, prot: MemProt) -> Result<u64> {
        let page = self.emu.page_size();
        let size = align_up(size.max(1), page);
        let addr = {
            let mut cursor = self.cursor.lock().unwrap();
            let addr = align_up(*cursor, page);
            *cursor = addr + size;
            addr
        };
        let emu = self.emu.clone();
        self.serialized(move || emu.mem_map(addr, size, prot))?;
        self.directory
            .lock()
            .unwrap()
            .insert(addr, MemRegion { addr, size, prot });
        trace!("map allocator: mapped {:#x}+{:#x} prot={:?}", addr, size, prot);
        Ok(addr)
    }

    /// Unmaps `[addr, addr+size)`. Any existing mapping overlapping that
    /// range is split or shrunk in the directory so only the requested
    /// bytes disappear; mappings entirely inside the range are dropped
    /// whole.
    pub fn unmap(&self, addr: u64, size: u64) -> Result<()> {
        let unmap_end = addr + size;
        let overlapping: Vec<MemRegion> = {
            let directory = self.directory.lock().unwrap();
            directory
                .values()
                .filter(|r| r.addr < unmap_end && r.end() > addr)
                .copied()
                .collect()
        };
        if overlapping.is_empty() {
            return Err(DbgError::AddressInvalid(addr));
        }

        for region in overlapping {
            let emu = self.emu.clone();
            self.serialized(move || emu.mem_unmap(region.addr, region.size))?;
            self.directory.lock().unwrap().remove(&region.addr);

            let before_len = addr.saturating_sub(region.addr).min(region.size);
            if before_len > 0 {
                let emu = self.emu.clone();
                let before_addr = region.addr;
                self.serialized(move || emu.mem_map(before_addr, before_len, region.prot))?;
                self.directory.lock().unwrap().insert(
                    before_addr,
                    MemRegion {
                        addr: before_addr,
                        size: before_len,
                        prot: region.prot,
                    },
                );
            }

            if region.end() > unmap_end {
                let after_addr = unmap_end;
                let after_len = region.end() - unmap_end;
                let emu = self.emu.clone();
                self.serialized(move || emu.mem_map(after_addr, after_len, region.prot))?;
                self.directory.lock().unwrap().insert(
                    after_addr,
                    MemRegion {
                        addr: after_addr,
                        size: after_len,
                        prot: region.prot,
                    },
                );
            }
        }
        Ok(())
    }

    pub fn regions(&self) -> Vec<MemRegion> {
        self.directory.lock().unwrap().values().copied().collect()
    }
}

/// One node of the sub-page allocator's ascending, address-ordered free
/// list.
#[derive(Clone, Copy)]
struct MemBlock {
    addr: u64,
    size: u64,
}

/// First-fit allocator with immediate-neighbor coalescing, carving
/// individual allocations out of ranges obtained from a [`MapAllocator`]
/// on exhaustion. Blocks in the free list are kept in ascending address
/// order so coalescing only ever has to look at the node before and after
/// the freed one.
pub struct SubPageAllocator {
    map: Arc<MapAllocator>,
    free: Mutex<Vec<MemBlock>>,
    used: Mutex<BTreeMap<u64, u64>>,
    chunk_size: u64,
}

impl SubPageAllocator {
    pub fn new(map: Arc<MapAllocator>, chunk_size: u64) -> Self {
        SubPageAllocator {
            map,
            free: Mutex::new(Vec::new()),
            used: Mutex::new(BTreeMap::new()),
            chunk_size,
        }
    }

    pub fn alloc(&self, size: u64) -> Result<u64> {
        let size = size.max(1);
        {
            let mut free = self.free.lock().unwrap();
            if let Some(pos) = free.iter().position(|b| b.size >= size) {
                let block = free[pos];
                if block.size == size {
                    free.remove(pos);
                } else {
                    free[pos] = MemBlock {
                        addr: block.addr + size,
                        size: block.size - size,
                    };
                }
                self.used.lock().unwrap().insert(block.addr, size);
                return Ok(block.addr);
            }
        }

        let chunk = self.chunk_size.max(size);
        let addr = self.map.map(chunk, MemProt::READ | MemProt::WRITE)?;
        self.used.lock().unwrap().insert(addr, size);
        if chunk > size {
            self.release_block(MemBlock {
                addr: addr + size,
                size: chunk - size,
            });
        }
        Ok(addr)
    }

    pub fn size_of(&self, addr: u64) -> Result<u64> {
        self.used
            .lock()
            .unwrap()
            .get(&addr)
            .copied()
            .ok_or(DbgError::AddressInvalid(addr))
    }

    pub fn free(&self, addr: u64) -> Result<()> {
        let size = self
            .used
            .lock()
            .unwrap()
            .remove(&addr)
            .ok_or(DbgError::AddressInvalid(addr))?;
        self.release_block(MemBlock { addr, size });
        Ok(())
    }

    fn release_block(&self, block: MemBlock) {
        let mut free = self.free.lock().unwrap();
        let pos = free.partition_point(|b| b.addr < block.addr);

        let merge_next = pos < free.len() && block.addr + block.size == free[pos].addr;
        let merge_prev = pos > 0 && free[pos - 1].addr + free[pos - 1].size == block.addr;

        match (merge_prev, merge_next) {
            (true, true) => {
                let next = free.remove(pos);
                free[pos - 1].size += block.size + next.size;
            }
            (true, false) => {
                free[pos - 1].size += block.size;
            }
            (false, true) => {
                free[pos].addr = block.addr;
                free[pos].size += block.size;
            }
            (false, false) => {
                free.insert(pos, block);
            }
        }
    }

    pub fn total_free(&self) -> u64 {
        self.free.lock().unwrap().iter().map(|b| b.size).sum()
    }

    pub fn total_used(&self) -> u64 {
        self.used.lock().unwrap().values().sum()
    }
}

/// One active `mem_bind`: a guest shadow range whose reads/writes are
/// proxied onto a host memory buffer rather than backed by guest-side
/// storage.
struct BoundRegion {
    host: *mut u8,
    len: usize,
}

// SAFETY: the host pointer is only ever touched from inside the emulator's
// memory hook callbacks, which the scheduler already guarantees run one at
// a time (§5: the emulator itself is serialized by the suspend/resume
// discipline).
unsafe impl Send for BoundRegion {}
unsafe impl Sync for BoundRegion {}

/// Owns both allocators plus the bound-host-memory table for one debugger
/// session.
pub struct MemoryManager {
    emu: Arc<dyn Emulator>,
    map: Arc<MapAllocator>,
    sub: SubPageAllocator,
    bound: DashMap<u64, BoundRegion>,
}

const SUB_PAGE_CHUNK: u64 = 0x10000;

impl MemoryManager {
    pub fn new(
        emu: Arc<dyn Emulator>,
        runner: Arc<dyn MainThreadRunner>,
        hooks: &Arc<HookManager>,
        base: Option<u64>,
    ) -> Arc<MemoryManager> {
        let map = Arc::new(MapAllocator::new(emu.clone(), runner, base));
        let manager = Arc::new(MemoryManager {
            emu: emu.clone(),
            map: map.clone(),
            sub: SubPageAllocator::new(map, SUB_PAGE_CHUNK),
            bound: DashMap::new(),
        });

        let read_after = Arc::clone(&manager);
        hooks
            .add_backend(
                HookType::MEM_READ_AFTER,
                HookCallback::MemValid(Box::new(move |_emu, access, addr, size, _value| {
                    read_after.on_mem_read_after(access, addr, size);
                })),
                0,
                u64::MAX,
            )
            .expect("registering the global bound-memory read hook cannot fail");

        let write_hook = Arc::clone(&manager);
        hooks
            .add_backend(
                HookType::MEM_WRITE,
                HookCallback::MemValid(Box::new(move |_emu, access, addr, size, value| {
                    write_hook.on_mem_write(access, addr, size, value);
                })),
                0,
                u64::MAX,
            )
            .expect("registering the global bound-memory write hook cannot fail");

        manager
    }

    pub fn mem_map(&self, size: u64, prot: MemProt) -> Result<u64> {
        self.map.map(size, prot)
    }

    pub fn mem_unmap(&self, addr: u64, size: u64) -> Result<()> {
        self.map.unmap(addr, size)
    }

    pub fn regions(&self) -> Vec<MemRegion> {
        self.map.regions()
    }

    pub fn mem_alloc(&self, size: u64) -> Result<u64> {
        self.sub.alloc(size)
    }

    pub fn mem_free(&self, addr: u64) -> Result<()> {
        self.sub.free(addr)
    }

    pub fn mem_size(&self, addr: u64) -> Result<u64> {
        self.sub.size_of(addr)
    }

    pub fn total_free(&self) -> u64 {
        self.sub.total_free()
    }

    pub fn total_used(&self) -> u64 {
        self.sub.total_used()
    }

    /// Allocates a guest shadow range covering `host[..len]` and installs
    /// the read/write proxying. Reads from the guest range are filled from
    /// `host` just after the access completes (`MEM_READ_AFTER`, since the
    /// value isn't known until the backend has already serviced the read
    /// against its own backing page); writes are mirrored into `host`
    /// immediately (`MEM_WRITE`).
    pub fn mem_bind(&self, host: *mut u8, len: usize) -> Result<u64> {
        let addr = self.map.map(len as u64, MemProt::READ | MemProt::WRITE)?;
        self.bound.insert(addr, BoundRegion { host, len });
        Ok(addr)
    }

    pub fn mem_unbind(&self, addr: u64) -> Result<()> {
        let (_, region) = self
            .bound
            .remove(&addr)
            .ok_or(DbgError::AddressInvalid(addr))?;
        self.map.unmap(addr, region.len as u64)
    }

    fn find_bound(&self, addr: u64) -> Option<(u64, usize)> {
        self.bound
            .iter()
            .find(|entry| {
                let base = *entry.key();
                addr >= base && addr < base + entry.value().len as u64
            })
            .map(|entry| (*entry.key(), entry.value().len))
    }

    fn on_mem_read_after(&self, access: MemAccess, addr: u64, size: usize) {
        if access != MemAccess::Read {
            return;
        }
        if let Some((base, len)) = self.find_bound(addr) {
            let offset = (addr - base) as usize;
            if offset + size > len {
                return;
            }
            let region = self.bound.get(&base).expect("bound region exists");
            let src = unsafe { std::slice::from_raw_parts(region.host.add(offset), size) };
            let _ = self.emu.mem_write(addr, src);
        }
    }

    fn on_mem_write(&self, access: MemAccess, addr: u64, size: usize, value: i64) {
        if access != MemAccess::Write {
            return;
        }
        if let Some((base, len)) = self.find_bound(addr) {
            let offset = (addr - base) as usize;
            if offset + size > len {
                return;
            }
            let region = self.bound.get(&base).expect("bound region exists");
            let bytes = value.to_le_bytes();
            let dst = unsafe { std::slice::from_raw_parts_mut(region.host.add(offset), size) };
            dst.copy_from_slice(&bytes[..size]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbgcore_emulator::mock::MockEmulator;
    use dbgcore_emulator::Arch;

    struct InlineRunner;
    impl MainThreadRunner for InlineRunner {
        fn main_thread_run(&self, job: Box<dyn FnOnce() + Send>) {
            job();
        }
    }

    fn new_manager() -> (Arc<MemoryManager>, Arc<dyn Emulator>) {
        let emu: Arc<dyn Emulator> = Arc::new(MockEmulator::new(Arch::Arm64));
        let hooks = HookManager::new(emu.clone()).unwrap();
        let mgr = MemoryManager::new(emu.clone(), Arc::new(InlineRunner), &hooks, Some(0x1000_0000));
        (mgr, emu)
    }

    #[test]
    fn alloc_then_free_returns_block_to_free_list_exactly_once() {
        let (mgr, _emu) = new_manager();
        let addr = mgr.mem_alloc(64).unwrap();
        assert_eq!(mgr.mem_size(addr).unwrap(), 64);
        mgr.mem_free(addr).unwrap();
        assert!(mgr.mem_free(addr).is_err());
    }

    #[test]
    fn free_plus_used_matches_mapped_total() {
        let (mgr, _emu) = new_manager();
        let _a = mgr.mem_alloc(100).unwrap();
        let _b = mgr.mem_alloc(200).unwrap();
        let mapped: u64 = mgr.regions().iter().map(|r| r.size).sum();
        assert_eq!(mgr.total_free() + mgr.total_used(), mapped);
    }

    #[test]
    fn coalesces_three_adjacent_blocks_freed_out_of_order() {
        let (mgr, _emu) = new_manager();
        let a = mgr.mem_alloc(64).unwrap();
        let b = mgr.mem_alloc(64).unwrap();
        let c = mgr.mem_alloc(64).unwrap();
        assert_eq!(b, a + 64);
        assert_eq!(c, b + 64);
        mgr.mem_free(b).unwrap();
        mgr.mem_free(a).unwrap();
        mgr.mem_free(c).unwrap();
        let free = mgr.sub.free.lock().unwrap();
        let merged = free.iter().find(|blk| blk.addr == a).expect("merged block at a");
        assert_eq!(merged.size, 192);
    }

    #[test]
    fn partial_unmap_splits_existing_region() {
        let (mgr, _emu) = new_manager();
        let base = mgr.mem_map(0x3000, MemProt::READ | MemProt::WRITE).unwrap();
        mgr.mem_unmap(base + 0x1000, 0x1000).unwrap();
        let regions = mgr.regions();
        assert!(regions.iter().any(|r| r.addr == base && r.size == 0x1000));
        assert!(regions.iter().any(|r| r.addr == base + 0x2000 && r.size == 0x1000));
        assert!(!regions.iter().any(|r| r.addr <= base + 0x1500 && r.end() > base + 0x1500));
    }
}
