//! A cooperative debugger runtime built on top of an external ARM/ARM64
//! CPU emulator backend (§1). The emulator itself, the ELF/Mach-O loader,
//! and the guest filesystem/socket facades are all supplied by the
//! embedder; this crate multiplexes guest execution across logical tasks,
//! dispatches the backend's hook classes to task-scoped callbacks, manages
//! guest memory, and marshals host values into guest ABI layouts.
//!
//! [`Debugger`] is the entry point. Everything else - [`task::Task`]
//! handles, hook registration, memory allocation - is reached through it.

pub mod arch;
pub mod context;
pub mod control;
pub mod errors;
pub mod hook;
pub mod mem;
pub mod module;
pub mod runner;
pub mod task;

use std::sync::Arc;

use log::info;

use dbgcore_emulator::{Emulator, HookCallback, HookType, MemAccess, MemProt, MemRegion};
use dbgcore_filesystem::FileSystem;
use dbgcore_socket::SocketTable;

pub use arch::CallConv;
pub use context::ContextPool;
pub use control::ControlAddressPool;
pub use errors::{DbgError, ExceptionKind, PcLocation, Result, SimulateException};
pub use hook::{HookHandle, HookManager, UnhandledEvent};
pub use mem::MemoryManager;
pub use module::{Module, ModuleId, ModuleManager, Symbol};
pub use runner::Scheduler;
pub use task::{Task, TaskCause, TaskId, TaskStatus};

const DEFAULT_CONTEXT_POOL_CAPACITY: usize = 8;
const DEFAULT_TASK_STACK_SIZE: u64 = 0x0004_0000;
const DEFAULT_CONTROL_POOL_CAPACITY: u64 = 256;

/// Tunables for [`Debugger::new`]; `Default` matches what a single
/// ordinary debugging session needs.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub context_pool_capacity: usize,
    pub task_stack_size: u64,
    pub control_pool_capacity: u64,
    pub mem_base: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            context_pool_capacity: DEFAULT_CONTEXT_POOL_CAPACITY,
            task_stack_size: DEFAULT_TASK_STACK_SIZE,
            control_pool_capacity: DEFAULT_CONTROL_POOL_CAPACITY,
            mem_base: None,
        }
    }
}

/// Host-side facades for guest-visible I/O. Implementing the guest
/// syscall ABI that actually drives them is an embedder concern (§1's
/// Non-goals); `Debugger` only keeps them alive alongside the rest of a
/// session so a syscall-trapping layer built on top has them to hand.
pub struct Facades {
    pub filesystem: Arc<dyn FileSystem>,
    pub sockets: Arc<SocketTable>,
}

impl Facades {
    pub fn new(filesystem: Arc<dyn FileSystem>, sockets: Arc<SocketTable>) -> Self {
        Facades { filesystem, sockets }
    }
}

/// The session handle an embedder constructs once per emulator instance.
///
/// Owns every sub-manager in construction order - context pool, control
/// address pool, module manager, scheduler (which owns hook dispatch),
/// memory manager - and the `Arc`s are dropped in the reverse of that
/// order, so the scheduler's engine thread (and the hooks it has
/// registered with the emulator) is gone before the pools it depended on
/// are torn down.
pub struct Debugger {
    emu: Arc<dyn Emulator>,
    scheduler: Arc<Scheduler>,
    memory: Arc<MemoryManager>,
    modules: Arc<ModuleManager>,
    control: Arc<ControlAddressPool>,
    contexts: Arc<ContextPool>,
    pub facades: Facades,
}

impl Debugger {
    pub fn new(emu: Arc<dyn Emulator>, config: Config, facades: Facades) -> Result<Arc<Debugger>> {
        let contexts = Arc::new(ContextPool::new(
            emu.clone(),
            config.context_pool_capacity,
            config.task_stack_size,
        )?);
        let control = Arc::new(ControlAddressPool::new(emu.clone(), config.control_pool_capacity)?);
        let modules = Arc::new(ModuleManager::new());
        let scheduler = Scheduler::new(emu.clone(), contexts.clone(), control.clone(), modules.clone())?;
        let memory = MemoryManager::new(emu.clone(), scheduler.clone(), scheduler.hooks(), config.mem_base);

        info!("dbgcore session ready: arch={:?}, page_size={:#x}", emu.arch(), emu.page_size());

        Ok(Arc::new(Debugger {
            emu,
            scheduler,
            memory,
            modules,
            control,
            contexts,
            facades,
        }))
    }

    pub fn emulator(&self) -> &Arc<dyn Emulator> {
        &self.emu
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn modules(&self) -> &Arc<ModuleManager> {
        &self.modules
    }

    pub fn main_task(&self) -> Arc<Task> {
        self.scheduler.main_task()
    }

    /// Runs the guest from `entry` on the reusable main task and blocks
    /// until it stops, for any reason (§4.6).
    pub fn run(&self, entry: u64) -> Result<()> {
        self.scheduler.start_main(entry)
    }

    pub fn spawn_task(&self) -> Arc<Task> {
        self.scheduler.spawn_task(None)
    }

    // -- Modules (§1: loading/relocating is the embedder's loader; this
    // crate only tracks what got loaded) --------------------------------

    pub fn load_module(&self, module: Arc<dyn Module>) -> ModuleId {
        self.modules.load(module)
    }

    pub fn unload_module(&self, id: ModuleId) -> Result<()> {
        self.modules.unload(id)
    }

    pub fn find_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.find_module(name)
    }

    pub fn find_module_by_addr(&self, addr: u64) -> Option<Arc<dyn Module>> {
        self.modules.find_module_by_addr(addr)
    }

    pub fn find_symbol(&self, name: &str) -> Result<Symbol> {
        self.modules.find_symbol(name)
    }

    // -- Memory (§4.3) ----------------------------------------------------

    pub fn mem_map(&self, size: u64, prot: MemProt) -> Result<u64> {
        self.memory.mem_map(size, prot)
    }

    pub fn mem_unmap(&self, addr: u64, size: u64) -> Result<()> {
        self.memory.mem_unmap(addr, size)
    }

    pub fn mem_regions(&self) -> Vec<MemRegion> {
        self.memory.regions()
    }

    pub fn mem_alloc(&self, size: u64) -> Result<u64> {
        self.memory.mem_alloc(size)
    }

    pub fn mem_free(&self, addr: u64) -> Result<()> {
        self.memory.mem_free(addr)
    }

    pub fn mem_bind(&self, host: *mut u8, len: usize) -> Result<u64> {
        self.memory.mem_bind(host, len)
    }

    pub fn mem_unbind(&self, addr: u64) -> Result<()> {
        self.memory.mem_unbind(addr)
    }

    // -- Hooks (§4.4) -------------------------------------------------------

    pub fn add_interrupt_hook(
        &self,
        begin: u64,
        end: u64,
        callback: impl Fn(&dyn Emulator, u32) -> bool + Send + 'static,
    ) -> HookHandle {
        self.scheduler.hooks().add_interrupt(begin, end, callback)
    }

    pub fn add_insn_invalid_hook(
        &self,
        begin: u64,
        end: u64,
        callback: impl Fn(&dyn Emulator) -> bool + Send + 'static,
    ) -> HookHandle {
        self.scheduler.hooks().add_insn_invalid(begin, end, callback)
    }

    pub fn add_mem_invalid_hook(
        &self,
        begin: u64,
        end: u64,
        callback: impl Fn(&dyn Emulator, MemAccess, u64, usize, i64) -> bool + Send + 'static,
    ) -> HookHandle {
        self.scheduler.hooks().add_mem_invalid(begin, end, callback)
    }

    pub fn add_code_hook(
        &self,
        callback: HookCallback,
        begin: u64,
        end: u64,
    ) -> Result<()> {
        self.scheduler.hooks().add_backend(HookType::CODE, callback, begin, end)
    }

    pub fn remove_hook(&self, handle: HookHandle) {
        self.scheduler.hooks().remove(handle)
    }

    // -- Sub-calls (§4.5) ---------------------------------------------------

    /// Calls a guest function on behalf of the host and blocks until it
    /// returns. `setup` marshals arguments onto the callee task before it
    /// starts, typically through an [`arch::RegisterStream`] built from
    /// the returned task.
    pub fn call_guest(
        &self,
        on: &Arc<Task>,
        func_addr: u64,
        setup: impl FnOnce(&Arc<Task>) -> Result<()>,
    ) -> Result<Arc<Task>> {
        self.scheduler.call_task_of(on, func_addr, setup)
    }

    pub fn async_call_guest(
        &self,
        on: &Arc<Task>,
        func_addr: u64,
        setup: impl FnOnce(&Arc<Task>) -> Result<()>,
    ) -> Result<Arc<Task>> {
        self.scheduler.async_call_task_of(on, func_addr, setup)
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbgcore_emulator::mock::MockEmulator;
    use dbgcore_emulator::Arch;
    use dbgcore_filesystem::VirtualFs;
    use dbgcore_socket::SocketTable;

    fn new_debugger() -> Arc<Debugger> {
        let emu: Arc<dyn Emulator> = Arc::new(MockEmulator::new(Arch::Arm));
        let facades = Facades::new(Arc::new(VirtualFs::new()), Arc::new(SocketTable::new(3)));
        Debugger::new(emu, Config::default(), facades).unwrap()
    }

    #[test]
    fn constructs_and_exposes_a_reusable_main_task() {
        let dbg = new_debugger();
        let main = dbg.main_task();
        assert_eq!(main.id(), TaskId(0));
        assert_eq!(main.status(), TaskStatus::Pending);
    }

    #[test]
    fn mem_map_then_alloc_round_trips_an_address() {
        let dbg = new_debugger();
        let base = dbg.mem_map(0x10000, MemProt::READ | MemProt::WRITE).unwrap();
        assert_eq!(base % dbg.emulator().page_size(), 0);
        let addr = dbg.mem_alloc(64).unwrap();
        assert!(addr >= base);
        dbg.mem_free(addr).unwrap();
    }
}
