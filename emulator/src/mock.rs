//! A synthetic, non-decoding [`Emulator`] used only by `dbgcore`'s own test
//! suite. It does not execute guest instructions; `start` simply blocks
//! until `stop` is called (or a step budget is exhausted), which is enough
//! to drive scheduler and hook-dispatch tests without a real CPU backend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use hashbrown::HashMap;

use crate::{
    Arch, Context, Emulator, EmulatorError, Endian, HookCallback, HookToken, HookType, MemProt,
    MemRegion, Reg, Result,
};

#[derive(Default)]
struct State {
    regs: HashMap<u32, u64>,
    pages: HashMap<u64, Vec<u8>>,
    regions: Vec<MemRegion>,
}

pub struct MockEmulator {
    arch: Arch,
    page_size: u64,
    state: Mutex<State>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    cycles: AtomicU64,
    wake: Condvar,
}

impl MockEmulator {
    pub fn new(arch: Arch) -> Self {
        MockEmulator {
            arch,
            page_size: 0x1000,
            state: Mutex::new(State::default()),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            wake: Condvar::new(),
        }
    }

    fn page_of(&self, addr: u64) -> u64 {
        addr & !(self.page_size - 1)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }
}

struct MockContext {
    regs: HashMap<u32, u64>,
}

impl Context for MockContext {
    fn save(&mut self) -> Result<()> {
        Ok(())
    }

    fn restore(&mut self) -> Result<()> {
        Ok(())
    }

    fn clone_context(&self) -> Result<Box<dyn Context>> {
        Ok(Box::new(MockContext {
            regs: self.regs.clone(),
        }))
    }

    fn reg_read(&self, reg: Reg) -> Result<u64> {
        Ok(*self.regs.get(&reg.0).unwrap_or(&0))
    }

    fn reg_write(&mut self, reg: Reg, value: u64) -> Result<()> {
        self.regs.insert(reg.0, value);
        Ok(())
    }
}

struct NoopHookToken;

impl HookToken for NoopHookToken {
    fn remove(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl Emulator for MockEmulator {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn endian(&self) -> Endian {
        Endian::Little
    }

    fn reg_read(&self, reg: Reg) -> Result<u64> {
        let state = self.state.lock().unwrap();
        Ok(*state.regs.get(&reg.0).unwrap_or(&0))
    }

    fn reg_write(&self, reg: Reg, value: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.regs.insert(reg.0, value);
        Ok(())
    }

    fn pc(&self) -> Result<u64> {
        self.reg_read(Reg(15))
    }

    fn mem_map(&self, addr: u64, size: u64, prot: MemProt) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.regions.iter().any(|r| r.contains(addr)) {
            return Err(EmulatorError::AlreadyMapped { addr, size });
        }
        let mut off = 0u64;
        while off < size {
            state
                .pages
                .entry(self.page_of(addr + off))
                .or_insert_with(|| vec![0u8; self.page_size as usize]);
            off += self.page_size;
        }
        state.regions.push(MemRegion { addr, size, prot });
        Ok(())
    }

    fn mem_unmap(&self, addr: u64, size: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.regions.len();
        state.regions.retain(|r| r.addr != addr || r.size != size);
        if state.regions.len() == before {
            return Err(EmulatorError::Unmapped { addr, size });
        }
        Ok(())
    }

    fn mem_protect(&self, addr: u64, size: u64, prot: MemProt) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let region = state
            .regions
            .iter_mut()
            .find(|r| r.addr == addr && r.size == size)
            .ok_or(EmulatorError::Unmapped { addr, size })?;
        region.prot = prot;
        Ok(())
    }

    fn mem_read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock().unwrap();
        if !state.regions.iter().any(|r| r.contains(addr)) {
            return Err(EmulatorError::Unmapped {
                addr,
                size: buf.len() as u64,
            });
        }
        for (i, b) in buf.iter_mut().enumerate() {
            let cur = addr + i as u64;
            let page = state.pages.get(&self.page_of(cur));
            *b = page.map(|p| p[(cur % self.page_size) as usize]).unwrap_or(0);
        }
        Ok(())
    }

    fn mem_write(&self, addr: u64, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.regions.iter().any(|r| r.contains(addr)) {
            return Err(EmulatorError::Unmapped {
                addr,
                size: buf.len() as u64,
            });
        }
        for (i, &b) in buf.iter().enumerate() {
            let cur = addr + i as u64;
            let page_size = self.page_size;
            let page = state
                .pages
                .entry(self.page_of(cur))
                .or_insert_with(|| vec![0u8; page_size as usize]);
            page[(cur % page_size) as usize] = b;
        }
        Ok(())
    }

    fn mem_regions(&self) -> Result<Vec<MemRegion>> {
        Ok(self.state.lock().unwrap().regions.clone())
    }

    fn context_alloc(&self) -> Result<Box<dyn Context>> {
        let state = self.state.lock().unwrap();
        Ok(Box::new(MockContext {
            regs: state.regs.clone(),
        }))
    }

    fn hook(
        &self,
        _kind: HookType,
        _callback: HookCallback,
        _begin: u64,
        _end: u64,
    ) -> Result<Box<dyn HookToken>> {
        Ok(Box::new(NoopHookToken))
    }

    fn start(&self, pc: u64, until: u64) -> Result<()> {
        self.reg_write(Reg(15), pc).ok();
        self.running.store(true, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);

        let lock = Mutex::new(());
        let mut guard = lock.lock().unwrap();
        while !self.stop_requested.load(Ordering::SeqCst) {
            let ran = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
            if until != u64::MAX && ran >= until {
                break;
            }
            let (g, timeout) = self
                .wake
                .wait_timeout(guard, std::time::Duration::from_millis(5))
                .unwrap();
            guard = g;
            let _ = timeout;
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake.notify_all();
        Ok(())
    }
}
