use std::sync::Arc;
use std::sync::Mutex;

use dbgcore_emulator::{Emulator, HookCallback as BackendHookCallback, HookToken, HookType, MemAccess};

use crate::errors::Result;

/// One registered internal hook: `begin > end` means "match every address",
/// the wildcard form the spec calls for interrupt/invalid-instruction/
/// invalid-memory hooks that were never given an explicit range.
struct Entry<F> {
    begin: u64,
    end: u64,
    callback: F,
}

impl<F> Entry<F> {
    /// `is_ctrl` gates wildcard entries: a user interrupt hook registered
    /// without an explicit range is meant to catch guest-raised
    /// interrupts, not the control-address traps the sub-call mechanism
    /// plants itself, so a wildcard never matches while the PC sits inside
    /// a control page. A hook given an explicit range (including one
    /// deliberately covering a control address, as `add_control` does)
    /// always matches by range regardless of `is_ctrl`.
    fn matches(&self, addr: u64, is_ctrl: bool) -> bool {
        if self.begin > self.end {
            !is_ctrl
        } else {
            addr >= self.begin && addr < self.end
        }
    }
}

/// An insertion-ordered set of hooks sharing one [`HookType`] class.
///
/// `Interrupt`, `InsnInvalid` and `MemInvalid` hooks are never handed
/// straight to the backend: the backend only supports one global callback
/// per class, so this registry plays dispatcher, trying each hook in
/// registration order and stopping at the first one that both matches the
/// address range and reports it handled the event.
///
/// Entries are keyed by a monotonic id rather than their position in the
/// backing `Vec`: removing one entry must never change the id any other
/// still-live entry is addressed by, since a caller may be holding onto a
/// `HookHandle` for a hook registered later and not yet have removed it.
struct Registry<F> {
    entries: Vec<(u64, Entry<F>)>,
    next_id: u64,
}

impl<F> Registry<F> {
    fn new() -> Self {
        Registry {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    fn insert(&mut self, begin: u64, end: u64, callback: F) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((
            id,
            Entry {
                begin,
                end,
                callback,
            },
        ));
        id
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    fn iter(&self) -> impl Iterator<Item = &Entry<F>> {
        self.entries.iter().map(|(_, entry)| entry)
    }
}

type InterruptFn = Box<dyn Fn(&dyn Emulator, u32) -> bool + Send>;
type InvalidInsnFn = Box<dyn Fn(&dyn Emulator) -> bool + Send>;
type MemInvalidFn = Box<dyn Fn(&dyn Emulator, MemAccess, u64, usize, i64) -> bool + Send>;

#[derive(Default)]
struct Registries {
    interrupt: Registry<InterruptFn>,
    insn_invalid: Registry<InvalidInsnFn>,
    mem_invalid: Registry<MemInvalidFn>,
}

impl<F> Default for Registry<F> {
    fn default() -> Self {
        Registry::new()
    }
}

/// What the interrupt/invalid-instruction/invalid-memory dispatch paths
/// saw when no registered hook claimed the event - everything the
/// scheduler needs to manufacture the task-cancelling exception (§3, §4.4)
/// without this module knowing anything about tasks itself.
pub enum UnhandledEvent {
    Interrupt(u32),
    InvalidInsn,
    InvalidMemory {
        access: MemAccess,
        addr: u64,
        size: usize,
        value: i64,
    },
}

type Fallback = Box<dyn Fn(&dyn Emulator, UnhandledEvent) + Send>;
type ControlPredicate = Box<dyn Fn(u64) -> bool + Send>;

/// Dispatches hook callbacks for a single emulator, splitting them between
/// an in-process registry (interrupt/invalid-instruction/invalid-memory,
/// where the backend only ever calls one global handler) and direct
/// backend registration (code/block/valid-memory/read-after, which the
/// backend already demultiplexes by address range internally).
pub struct HookManager {
    emu: Arc<dyn Emulator>,
    registries: Mutex<Registries>,
    backend_tokens: Mutex<Vec<Box<dyn HookToken>>>,
    fallback: Mutex<Option<Fallback>>,
    is_control: Mutex<Option<ControlPredicate>>,
}

/// A handle identifying one hook registered through a [`HookManager`], used
/// only to remove it again. The wrapped id is stable for the life of the
/// hook: removing any other hook, in any order, never invalidates it.
pub enum HookHandle {
    Interrupt(u64),
    InsnInvalid(u64),
    MemInvalid(u64),
    Backend,
}

impl HookManager {
    pub fn new(emu: Arc<dyn Emulator>) -> Result<Arc<HookManager>> {
        let manager = Arc::new(HookManager {
            emu: emu.clone(),
            registries: Mutex::new(Registries::default()),
            backend_tokens: Mutex::new(Vec::new()),
            fallback: Mutex::new(None),
            is_control: Mutex::new(None),
        });

        {
            let weak_interrupt = Arc::clone(&manager);
            emu.hook(
                HookType::INTR,
                BackendHookCallback::Interrupt(Box::new(move |e, intno| {
                    weak_interrupt.dispatch_interrupt(e, intno);
                })),
                1,
                0,
            )?;

            let weak_insn = Arc::clone(&manager);
            emu.hook(
                HookType::INSN_INVALID,
                BackendHookCallback::InvalidInsn(Box::new(move |e| {
                    weak_insn.dispatch_insn_invalid(e)
                })),
                1,
                0,
            )?;

            let weak_mem = Arc::clone(&manager);
            emu.hook(
                HookType::MEM_INVALID,
                BackendHookCallback::MemInvalid(Box::new(move |e, access, addr, size, value| {
                    weak_mem.dispatch_mem_invalid(e, access, addr, size, value)
                })),
                1,
                0,
            )?;
        }

        Ok(manager)
    }

    /// Installed once by the scheduler: invoked when no registered
    /// interrupt/invalid-instruction/invalid-memory hook claims an event,
    /// so the scheduler can cancel the owning task with the manufactured
    /// exception (§4.4's dispatch algorithm, step 3).
    pub fn set_fallback(&self, f: impl Fn(&dyn Emulator, UnhandledEvent) + Send + 'static) {
        *self.fallback.lock().unwrap() = Some(Box::new(f));
    }

    /// Installed once by the scheduler so the interrupt dispatch path can
    /// tell a guest-raised interrupt apart from a control-address trap
    /// (§4.4 step 1).
    pub fn set_control_predicate(&self, f: impl Fn(u64) -> bool + Send + 'static) {
        *self.is_control.lock().unwrap() = Some(Box::new(f));
    }

    pub fn add_interrupt(
        &self,
        begin: u64,
        end: u64,
        callback: impl Fn(&dyn Emulator, u32) -> bool + Send + 'static,
    ) -> HookHandle {
        let mut registries = self.registries.lock().unwrap();
        HookHandle::Interrupt(registries.interrupt.insert(begin, end, Box::new(callback)))
    }

    pub fn add_insn_invalid(
        &self,
        begin: u64,
        end: u64,
        callback: impl Fn(&dyn Emulator) -> bool + Send + 'static,
    ) -> HookHandle {
        let mut registries = self.registries.lock().unwrap();
        HookHandle::InsnInvalid(registries.insn_invalid.insert(begin, end, Box::new(callback)))
    }

    pub fn add_mem_invalid(
        &self,
        begin: u64,
        end: u64,
        callback: impl Fn(&dyn Emulator, MemAccess, u64, usize, i64) -> bool + Send + 'static,
    ) -> HookHandle {
        let mut registries = self.registries.lock().unwrap();
        HookHandle::MemInvalid(registries.mem_invalid.insert(begin, end, Box::new(callback)))
    }

    pub fn remove(&self, handle: HookHandle) {
        let mut registries = self.registries.lock().unwrap();
        match handle {
            HookHandle::Interrupt(i) => registries.interrupt.remove(i),
            HookHandle::InsnInvalid(i) => registries.insn_invalid.remove(i),
            HookHandle::MemInvalid(i) => registries.mem_invalid.remove(i),
            HookHandle::Backend => {}
        }
    }

    /// Registers a code/block/valid-memory/read-after hook directly with
    /// the backend; these are cheap enough per-range that there is no
    /// point funnelling them through an in-process registry.
    pub fn add_backend(
        &self,
        kind: HookType,
        callback: BackendHookCallback,
        begin: u64,
        end: u64,
    ) -> Result<()> {
        let token = self.emu.hook(kind, callback, begin, end)?;
        self.backend_tokens.lock().unwrap().push(token);
        Ok(())
    }

    fn is_ctrl(&self, pc: u64) -> bool {
        self.is_control
            .lock()
            .unwrap()
            .as_ref()
            .map(|f| f(pc))
            .unwrap_or(false)
    }

    fn dispatch_interrupt(&self, emu: &dyn Emulator, intno: u32) {
        let pc = emu.pc().unwrap_or(0);
        let is_ctrl = self.is_ctrl(pc);
        let handled = {
            let registries = self.registries.lock().unwrap();
            registries
                .interrupt
                .iter()
                .filter(|e| e.matches(pc, is_ctrl))
                .any(|e| (e.callback)(emu, intno))
        };
        if !handled {
            if let Some(f) = self.fallback.lock().unwrap().as_ref() {
                f(emu, UnhandledEvent::Interrupt(intno));
            }
        }
    }

    fn dispatch_insn_invalid(&self, emu: &dyn Emulator) -> bool {
        let pc = emu.pc().unwrap_or(0);
        let handled = {
            let registries = self.registries.lock().unwrap();
            registries
                .insn_invalid
                .iter()
                .filter(|e| e.matches(pc, false))
                .any(|e| (e.callback)(emu))
        };
        if !handled {
            if let Some(f) = self.fallback.lock().unwrap().as_ref() {
                f(emu, UnhandledEvent::InvalidInsn);
            }
        }
        handled
    }

    fn dispatch_mem_invalid(
        &self,
        emu: &dyn Emulator,
        access: MemAccess,
        addr: u64,
        size: usize,
        value: i64,
    ) -> bool {
        let handled = {
            let registries = self.registries.lock().unwrap();
            registries
                .mem_invalid
                .iter()
                .filter(|e| e.matches(addr, false))
                .any(|e| (e.callback)(emu, access, addr, size, value))
        };
        if !handled {
            if let Some(f) = self.fallback.lock().unwrap().as_ref() {
                f(emu, UnhandledEvent::InvalidMemory { access, addr, size, value });
            }
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbgcore_emulator::mock::MockEmulator;
    use dbgcore_emulator::Arch;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn closing_one_handle_does_not_affect_another() {
        let emu: Arc<dyn Emulator> = Arc::new(MockEmulator::new(Arch::Arm));
        let manager = HookManager::new(emu).unwrap();
        let a_called = Arc::new(AtomicBool::new(false));
        let b_called = Arc::new(AtomicBool::new(false));

        let a_flag = Arc::clone(&a_called);
        let a = manager.add_interrupt(0, 0x1000, move |_e, _n| {
            a_flag.store(true, Ordering::SeqCst);
            true
        });
        let b_flag = Arc::clone(&b_called);
        let _b = manager.add_interrupt(0, 0x1000, move |_e, _n| {
            b_flag.store(true, Ordering::SeqCst);
            true
        });

        manager.remove(a);
        manager.dispatch_interrupt(&*manager.emu.clone(), 7);
        assert!(!a_called.load(Ordering::SeqCst));
        assert!(b_called.load(Ordering::SeqCst));
    }

    #[test]
    fn removing_an_earlier_handle_does_not_renumber_a_later_one() {
        // Regression for a positional-index handle scheme: removing entry 0
        // used to shift entry 1 down to index 0, so a later `remove` against
        // the handle that used to name entry 1 would silently miss (or hit
        // whatever had been reinserted at that slot).
        let emu: Arc<dyn Emulator> = Arc::new(MockEmulator::new(Arch::Arm));
        let manager = HookManager::new(emu.clone()).unwrap();
        let c_called = Arc::new(AtomicBool::new(false));

        let a = manager.add_interrupt(0, 0x1000, |_e, _n| true);
        let b = manager.add_interrupt(0, 0x1000, |_e, _n| true);
        let c_flag = Arc::clone(&c_called);
        let c = manager.add_interrupt(0, 0x1000, move |_e, _n| {
            c_flag.store(true, Ordering::SeqCst);
            true
        });

        manager.remove(a);
        manager.remove(b);
        manager.dispatch_interrupt(&*emu, 7);
        assert!(c_called.load(Ordering::SeqCst), "hook c must still fire after a and b are removed");

        manager.remove(c);
        c_called.store(false, Ordering::SeqCst);
        manager.dispatch_interrupt(&*emu, 7);
        assert!(!c_called.load(Ordering::SeqCst), "hook c must not fire once removed");
    }

    #[test]
    fn wildcard_interrupt_hook_does_not_fire_on_control_address() {
        let emu: Arc<dyn Emulator> = Arc::new(MockEmulator::new(Arch::Arm));
        let manager = HookManager::new(emu.clone()).unwrap();
        manager.set_control_predicate(|pc| pc == 0x9000);
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        // begin > end => wildcard
        manager.add_interrupt(1, 0, move |_e, _n| {
            flag.store(true, Ordering::SeqCst);
            true
        });
        emu.reg_write(dbgcore_emulator::Reg(15), 0x9000).unwrap();
        manager.dispatch_interrupt(&*emu, 0x35);
        assert!(!called.load(Ordering::SeqCst));
    }
}
