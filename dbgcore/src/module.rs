//! The ELF/Mach-O module loader is an external collaborator (§1); this
//! module only defines the interface it must satisfy and the bookkeeping
//! `Debugger` does over whatever loader instances that collaborator hands
//! back - tracking load order, resolving an address to its owning module,
//! and looking up symbols.

use std::sync::{Arc, RwLock};

use dbgcore_emulator::MemRegion;

use crate::errors::{DbgError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u64);

/// One resolved symbol: its name, the address it was loaded at, and size
/// if the loader knows it (debug info doesn't always carry one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

/// The contract an ELF/Mach-O loader must satisfy to be tracked by
/// `Debugger::load`. Loading and relocating the binary itself is entirely
/// the loader's job; this crate only ever reads the result.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;
    fn region(&self) -> MemRegion;
    fn base(&self) -> u64;
    fn entry(&self) -> u64;
    fn init_addrs(&self) -> &[u64];
    fn find_symbol(&self, name: &str) -> Option<Symbol>;
    /// Not every loader can enumerate symbols cheaply (stripped binaries,
    /// lazily-parsed symbol tables); `None` means "ask `find_symbol`
    /// instead of iterating".
    fn symbols(&self) -> Option<Vec<Symbol>> {
        None
    }
}

struct Entry {
    id: ModuleId,
    module: Arc<dyn Module>,
}

/// Tracks the modules a debugger session has loaded, in load order, so a
/// PC can be mapped back to "module X, offset Y" for exception reporting
/// (§6) and so callers can resolve symbols without holding onto the
/// loader's own handle.
pub struct ModuleManager {
    entries: RwLock<Vec<Entry>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl ModuleManager {
    pub fn new() -> ModuleManager {
        ModuleManager {
            entries: RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub fn load(&self, module: Arc<dyn Module>) -> ModuleId {
        let id = ModuleId(self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst));
        self.entries.write().unwrap().push(Entry { id, module });
        id
    }

    pub fn unload(&self, id: ModuleId) -> Result<()> {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Err(DbgError::UnknownModule(id));
        }
        Ok(())
    }

    pub fn get_module(&self, id: ModuleId) -> Result<Arc<dyn Module>> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.module.clone())
            .ok_or(DbgError::UnknownModule(id))
    }

    pub fn find_module(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|e| e.module.name() == name)
            .map(|e| e.module.clone())
    }

    pub fn find_module_by_addr(&self, addr: u64) -> Option<Arc<dyn Module>> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|e| e.module.region().contains(addr))
            .map(|e| e.module.clone())
    }

    /// Resolves `addr` to `(module name, offset from base)` for exception
    /// formatting (§6); `None` when no loaded module's region covers it.
    pub fn locate(&self, addr: u64) -> Option<(String, u64)> {
        self.find_module_by_addr(addr)
            .map(|m| (m.name().to_string(), addr.saturating_sub(m.base())))
    }

    pub fn find_symbol(&self, name: &str) -> Result<Symbol> {
        for entry in self.entries.read().unwrap().iter() {
            if let Some(sym) = entry.module.find_symbol(name) {
                return Ok(sym);
            }
        }
        Err(DbgError::SymbolNotFound(name.to_string()))
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbgcore_emulator::MemProt;

    struct FakeModule {
        name: String,
        base: u64,
        size: u64,
        symbols: Vec<Symbol>,
    }

    impl Module for FakeModule {
        fn name(&self) -> &str {
            &self.name
        }
        fn region(&self) -> MemRegion {
            MemRegion {
                addr: self.base,
                size: self.size,
                prot: MemProt::READ | MemProt::EXEC,
            }
        }
        fn base(&self) -> u64 {
            self.base
        }
        fn entry(&self) -> u64 {
            self.base
        }
        fn init_addrs(&self) -> &[u64] {
            &[]
        }
        fn find_symbol(&self, name: &str) -> Option<Symbol> {
            self.symbols.iter().find(|s| s.name == name).cloned()
        }
    }

    #[test]
    fn locates_address_inside_loaded_module() {
        let manager = ModuleManager::new();
        manager.load(Arc::new(FakeModule {
            name: "libc.so".into(),
            base: 0x1000,
            size: 0x2000,
            symbols: vec![Symbol { name: "malloc".into(), addr: 0x1100, size: 16 }],
        }));
        let (name, offset) = manager.locate(0x1100).unwrap();
        assert_eq!(name, "libc.so");
        assert_eq!(offset, 0x100);
        assert!(manager.locate(0x5000).is_none());
        assert_eq!(manager.find_symbol("malloc").unwrap().addr, 0x1100);
        assert!(manager.find_symbol("free").is_err());
    }
}
