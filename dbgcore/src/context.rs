use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use dbgcore_emulator::{Context, Emulator, MemProt, MemRegion};
use log::trace;

use crate::errors::Result;

/// A saved CPU context and the guest stack region it runs on, recycled as
/// a pair so a task reusing a slot always gets a stack sized for it.
pub struct TaskContextEntry {
    pub context: Box<dyn Context>,
    pub stack: MemRegion,
}

/// A ring of pre-allocated [`TaskContextEntry`] slots. Allocating a guest
/// stack and an emulator context is too expensive to do per call, so tasks
/// borrow a slot from this pool for the duration of one run and return it
/// afterward.
///
/// Reclaiming a slot is handed off to a dedicated collector thread rather
/// than being done inline by whichever thread finishes a task, so a task's
/// caller is never blocked on pool bookkeeping it doesn't care about.
pub struct ContextPool {
    free_rx: Receiver<TaskContextEntry>,
    reclaim_tx: Option<Sender<TaskContextEntry>>,
    collector: Option<JoinHandle<()>>,
}

impl ContextPool {
    pub fn new(emu: Arc<dyn Emulator>, capacity: usize, stack_size: u64) -> Result<ContextPool> {
        let (free_tx, free_rx) = unbounded();
        let (reclaim_tx, reclaim_rx) = unbounded::<TaskContextEntry>();

        for i in 0..capacity {
            let stack_addr = 0x7000_0000u64 + (i as u64) * (stack_size + emu.page_size());
            emu.mem_map(stack_addr, stack_size, MemProt::READ | MemProt::WRITE)?;
            let entry = TaskContextEntry {
                context: emu.context_alloc()?,
                stack: MemRegion {
                    addr: stack_addr,
                    size: stack_size,
                    prot: MemProt::READ | MemProt::WRITE,
                },
            };
            free_tx.send(entry).expect("free channel has a live receiver");
        }

        let collector_free_tx = free_tx.clone();
        let collector = std::thread::spawn(move || {
            while let Ok(mut entry) = reclaim_rx.recv() {
                // Context state from the previous occupant must not leak
                // into whichever task claims this slot next.
                let _ = entry.context.restore();
                trace!("context pool: reclaimed slot at stack {:#x}", entry.stack.addr);
                if collector_free_tx.send(entry).is_err() {
                    break;
                }
            }
        });

        Ok(ContextPool {
            free_rx,
            reclaim_tx: Some(reclaim_tx),
            collector: Some(collector),
        })
    }

    /// Blocks until a slot is available.
    pub fn acquire(&self) -> Option<TaskContextEntry> {
        self.free_rx.recv().ok()
    }

    pub fn try_acquire(&self) -> Option<TaskContextEntry> {
        self.free_rx.try_recv().ok()
    }

    pub fn release(&self, entry: TaskContextEntry) {
        if let Some(tx) = &self.reclaim_tx {
            let _ = tx.send(entry);
        }
    }
}

impl Drop for ContextPool {
    fn drop(&mut self) {
        self.reclaim_tx.take();
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
    }
}
