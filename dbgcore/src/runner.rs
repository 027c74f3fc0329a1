//! The scheduler (§4.6) multiplexes logical [`Task`]s on top of a single
//! emulator instance. Exactly one thread - the engine thread - ever calls
//! [`Emulator::start`]; every other caller hands its task to the scheduler
//! and either blocks on it ([`Task::sync_run`]) or lets it run in the
//! background.
//!
//! A host-initiated call into guest code (§4.5's control addresses) is the
//! one exception: it runs inline on the calling thread rather than through
//! the dispatch queue, since it may itself be invoked from inside a hook
//! callback already running on the engine thread, and queueing it there
//! would deadlock against itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use log::{debug, trace, warn};

use dbgcore_emulator::{Arch, Emulator};

use crate::arch;
use crate::context::ContextPool;
use crate::control::ControlAddressPool;
use crate::errors::{DbgError, ExceptionKind, Result};
use crate::hook::{HookHandle, HookManager, UnhandledEvent};
use crate::mem::MainThreadRunner;
use crate::module::ModuleManager;
use crate::task::{locate_exception, Task, TaskCause, TaskId, TaskStatus};

type Job = Box<dyn FnOnce() + Send>;

/// Drives a single emulator instance, multiplexing [`Task`]s over it.
/// Created once per `Debugger` (§3's data model) alongside the other
/// sub-managers it coordinates with: hook dispatch routes unhandled events
/// back into task cancellation, and memory mapping serializes through
/// [`MainThreadRunner::main_thread_run`].
pub struct Scheduler {
    emu: Arc<dyn Emulator>,
    arch: Arch,
    hooks: Arc<HookManager>,
    contexts: Arc<ContextPool>,
    control: Arc<ControlAddressPool>,
    modules: Arc<ModuleManager>,
    tasks: DashMap<TaskId, Arc<Task>>,
    next_task_id: AtomicU64,
    current: Mutex<Option<TaskId>>,
    running_thread: Mutex<Option<std::thread::ThreadId>>,
    dispatch_tx: Sender<TaskId>,
    exec_tx: Sender<Job>,
    exec_rx: Receiver<Job>,
    main_task: Arc<Task>,
}

impl Scheduler {
    pub fn new(
        emu: Arc<dyn Emulator>,
        contexts: Arc<ContextPool>,
        control: Arc<ControlAddressPool>,
        modules: Arc<ModuleManager>,
    ) -> Result<Arc<Scheduler>> {
        let arch = emu.arch();
        let hooks = HookManager::new(emu.clone())?;
        let (dispatch_tx, dispatch_rx) = unbounded::<TaskId>();
        let (exec_tx, exec_rx) = unbounded::<Job>();
        let tasks: DashMap<TaskId, Arc<Task>> = DashMap::new();
        let main_id = TaskId(0);

        let scheduler = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let fallback_weak = weak.clone();
            hooks.set_fallback(move |emu, event| {
                if let Some(scheduler) = fallback_weak.upgrade() {
                    scheduler.on_unhandled(emu, event);
                }
            });

            let control_for_predicate = Arc::clone(&control);
            hooks.set_control_predicate(move |pc| control_for_predicate.owns(pc));

            let main_task = Task::new(main_id, None, weak.clone());
            tasks.insert(main_id, main_task.clone());

            Scheduler {
                emu: emu.clone(),
                arch,
                hooks: hooks.clone(),
                contexts,
                control,
                modules,
                tasks,
                next_task_id: AtomicU64::new(main_id.0 + 1),
                current: Mutex::new(None),
                running_thread: Mutex::new(None),
                dispatch_tx,
                exec_tx,
                exec_rx,
                main_task,
            }
        });

        let engine_weak = Arc::downgrade(&scheduler);
        std::thread::Builder::new()
            .name("dbgcore-engine".into())
            .spawn(move || engine_loop(engine_weak, dispatch_rx))
            .expect("spawning the scheduler engine thread");

        Ok(scheduler)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn emulator(&self) -> &Arc<dyn Emulator> {
        &self.emu
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    pub fn main_task(&self) -> Arc<Task> {
        self.main_task.clone()
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.get(&id).map(|entry| entry.clone())
    }

    /// Allocates a fresh task id and registers it, but does not start it
    /// running - the caller still has to bind a context (directly, or
    /// implicitly through [`Task::fork`]) and call [`Task::run`].
    pub fn spawn_task(self: &Arc<Self>, parent: Option<TaskId>) -> Arc<Task> {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst));
        let task = Task::new(id, parent, Arc::downgrade(self));
        self.tasks.insert(id, task.clone());
        task
    }

    /// Enqueues `task` onto the dispatch channel the engine thread reads
    /// from. Called by [`Task::run`]; never called directly.
    pub(crate) fn dispatch(&self, task: Arc<Task>) {
        if self.dispatch_tx.send(task.id()).is_err() {
            warn!("task {:?}: engine thread is gone, dropping dispatch", task.id());
        }
    }

    /// Runs the guest from `pc` on the reusable main task and blocks until
    /// it reaches `Done` - the one bootstrap path that does not go through
    /// [`Scheduler::call_task_of`] (§4.6).
    pub fn start_main(self: &Arc<Self>, pc: u64) -> Result<()> {
        arch::init_cpu(self.emu.as_ref(), self.arch)?;
        if matches!(self.main_task.status(), TaskStatus::Done | TaskStatus::Close) {
            self.main_task.reset();
        }
        self.main_task.reg_write(arch::pc_reg(self.arch), pc)?;
        self.main_task.sync_run()
    }

    /// Calls a guest function on behalf of the host and blocks until it
    /// returns (§4.5). The callee runs on a task forked from `on`'s
    /// register state, with a pooled control address installed as the
    /// link register so its return can be told apart from any other
    /// interrupt the guest might legitimately raise.
    ///
    /// Runs inline on the calling thread rather than through the dispatch
    /// queue: a caller already running on the engine thread (from inside a
    /// hook callback) would otherwise deadlock waiting for its own
    /// dispatch to be picked up by the thread it is blocking.
    ///
    /// `setup` runs after the control address is installed as the link
    /// register but before the callee starts, so callers can marshal
    /// arguments onto the forked task's registers/stack (typically via a
    /// [`crate::arch::RegisterStream`]) without racing the call itself.
    pub fn call_task_of(
        self: &Arc<Self>,
        on: &Arc<Task>,
        func_addr: u64,
        setup: impl FnOnce(&Arc<Task>) -> Result<()>,
    ) -> Result<Arc<Task>> {
        let control_addr = self.control.acquire()?;
        let task = on.fork()?;
        task.mark_running();
        task.reg_write(arch::lr_reg(self.arch), control_addr)?;
        task.reg_write(arch::pc_reg(self.arch), func_addr)?;
        setup(&task)?;

        self.install_return_hook(&task, control_addr);

        trace!("task {:?}: calling guest function {:#x} inline", task.id(), func_addr);
        self.run_inline(&task)?;
        if let Some(exception) = task.cause() {
            return Err(DbgError::Simulate(exception));
        }
        Ok(task)
    }

    /// Like `call_task_of`, but the callee runs through the dispatch queue
    /// on the engine thread instead of inline, so the caller does not
    /// block waiting for it (§4.6's async dispatch path).
    pub fn async_call_task_of(
        self: &Arc<Self>,
        on: &Arc<Task>,
        func_addr: u64,
        setup: impl FnOnce(&Arc<Task>) -> Result<()>,
    ) -> Result<Arc<Task>> {
        let control_addr = self.control.acquire()?;
        let task = on.fork()?;
        task.reg_write(arch::lr_reg(self.arch), control_addr)?;
        task.reg_write(arch::pc_reg(self.arch), func_addr)?;
        setup(&task)?;

        self.install_return_hook(&task, control_addr);
        task.run()?;
        Ok(task)
    }

    /// Registers the one-shot interrupt hook that recognizes `task`'s
    /// return to `control_addr`, finishes it, frees the control address,
    /// and unregisters itself.
    fn install_return_hook(&self, task: &Arc<Task>, control_addr: u64) {
        let hooks_weak = Arc::downgrade(&self.hooks);
        let control = Arc::clone(&self.control);
        let handle_slot: Arc<Mutex<Option<HookHandle>>> = Arc::new(Mutex::new(None));
        let handle_slot_cb = Arc::clone(&handle_slot);
        let target = Arc::clone(task);

        let handle = self.hooks.add_interrupt(control_addr, control_addr + 1, move |emu, _intno| {
            target.finish(TaskCause::Done);
            control.release(control_addr);
            if let Some(handle) = handle_slot_cb.lock().unwrap().take() {
                if let Some(hooks) = hooks_weak.upgrade() {
                    hooks.remove(handle);
                }
            }
            let _ = emu.stop();
            true
        });
        *handle_slot.lock().unwrap() = Some(handle);
    }

    /// Drives `task` to completion on the calling thread: restores its
    /// context, runs the emulator from its current PC, and saves the
    /// context back out once `start` returns.
    fn run_inline(&self, task: &Arc<Task>) -> Result<()> {
        task.context_restore()?;
        let previous = self.current.lock().unwrap().replace(task.id());
        let previous_thread = self
            .running_thread
            .lock()
            .unwrap()
            .replace(std::thread::current().id());
        let pc = task.reg_read(arch::pc_reg(self.arch))?;
        let result = self.emu.start(pc, u64::MAX);
        let _ = task.context_save();
        *self.running_thread.lock().unwrap() = previous_thread;
        *self.current.lock().unwrap() = previous;
        result.map_err(DbgError::from)
    }

    /// Runs one dispatched task to completion; called only from the
    /// engine thread.
    fn run_slice(&self, task_id: TaskId) {
        let task = match self.tasks.get(&task_id) {
            Some(entry) => entry.clone(),
            None => return,
        };

        if !task.has_context() {
            match self.contexts.acquire() {
                Some(entry) => task.bind_context(entry),
                None => {
                    task.finish(TaskCause::Exception(locate_exception(
                        &self.modules,
                        ExceptionKind::Panic,
                        0,
                        "no free task context available".into(),
                    )));
                    return;
                }
            }
        }

        if let Err(e) = task.context_restore() {
            task.finish(TaskCause::Exception(locate_exception(
                &self.modules,
                ExceptionKind::Panic,
                0,
                format!("context restore failed: {e}"),
            )));
            return;
        }

        *self.current.lock().unwrap() = Some(task_id);
        *self.running_thread.lock().unwrap() = Some(std::thread::current().id());
        let pc = task.reg_read(arch::pc_reg(self.arch)).unwrap_or(0);
        trace!("task {:?}: engine thread starting emulator at {:#x}", task_id, pc);

        if let Err(e) = self.emu.start(pc, u64::MAX) {
            task.finish(TaskCause::Exception(locate_exception(
                &self.modules,
                ExceptionKind::Panic,
                pc,
                format!("emulator stopped: {e}"),
            )));
        }

        *self.running_thread.lock().unwrap() = None;
        let _ = task.context_save();
        *self.current.lock().unwrap() = None;

        // Anything queued through `main_thread_run` while the emulator was
        // busy, and that wasn't already run inline as a re-entrant call
        // from a hook callback on this same thread, can only safely touch
        // it now, between one task's slice and the next dispatch.
        while let Ok(job) = self.exec_rx.try_recv() {
            job();
        }

        if !matches!(task.status(), TaskStatus::Done) {
            // The emulator only ever stops because a hook decided the
            // task's episode was over; if nothing marked it `Done`, treat
            // the stop itself as the cancellation cause.
            task.finish(TaskCause::Cancelled);
        }

        if let Some(entry) = task.take_context() {
            self.contexts.release(entry);
        }
    }

    /// Invoked through [`HookManager::set_fallback`] when no registered
    /// interrupt/invalid-instruction/invalid-memory hook claims an event:
    /// manufactures the matching exception, cancels whichever task is
    /// currently bound to the emulator, and stops it so the engine thread
    /// regains control (§4.4 step 3).
    fn on_unhandled(&self, emu: &dyn Emulator, event: UnhandledEvent) {
        let pc = emu.pc().unwrap_or(0);
        let (kind, detail) = match event {
            UnhandledEvent::Interrupt(intno) => {
                (ExceptionKind::Interrupt, format!("unhandled interrupt {intno:#x}"))
            }
            UnhandledEvent::InvalidInsn => (ExceptionKind::InvalidInstruction, "invalid instruction".to_string()),
            UnhandledEvent::InvalidMemory { access, addr, size, .. } => (
                ExceptionKind::InvalidMemory,
                format!("{access:?} access to {addr:#x} ({size} bytes)"),
            ),
        };
        let exception = locate_exception(&self.modules, kind, pc, detail);
        debug!("unhandled event: {exception}");

        if let Some(task_id) = *self.current.lock().unwrap() {
            if let Some(task) = self.tasks.get(&task_id) {
                task.cancel(TaskCause::Exception(exception));
            }
        }
        let _ = emu.stop();
    }

    /// Cancels every task that has not already finished and stops the
    /// emulator. Called when the owning `Debugger` is torn down.
    pub fn shutdown(&self) {
        for entry in self.tasks.iter() {
            if !matches!(entry.value().status(), TaskStatus::Done) {
                entry.value().cancel(TaskCause::Cancelled);
            }
        }
        let _ = self.emu.stop();
    }
}

impl MainThreadRunner for Scheduler {
    /// Runs `job` immediately if nothing is currently bound to the
    /// emulator, or if the calling thread is the very thread currently
    /// blocked inside `emu.start` (i.e. this call came from a hook callback
    /// running synchronously on top of `run_inline`/`run_slice`);
    /// otherwise queues it for the engine thread to drain the next time a
    /// task's slice ends (§9: map/unmap always funnels through here, even
    /// on targets where it happens to be safe to call directly).
    ///
    /// The re-entrant branch matters because a `MemInvalid` hook handling a
    /// fault by mapping the faulting page runs on top of `emu.start` on
    /// whichever thread called it - the engine thread for a dispatched
    /// task, or a host thread blocked in `run_inline` for a sub-call.
    /// Queuing that job onto `exec` would deadlock: it would wait for a
    /// drain point that only runs after `emu.start` returns, and `start`
    /// cannot return until the hook (which is waiting on this very job)
    /// does.
    fn main_thread_run(&self, job: Job) {
        let on_running_thread = self
            .running_thread
            .lock()
            .unwrap()
            .map(|id| id == std::thread::current().id())
            .unwrap_or(false);

        if self.current.lock().unwrap().is_none() || on_running_thread {
            job();
        } else {
            let _ = self.exec_tx.send(job);
        }
    }
}

/// The engine thread body. Holds only a [`Weak`] reference to the
/// scheduler so a dropped `Debugger` doesn't keep this thread - and
/// therefore the scheduler it would otherwise keep alive - running
/// forever; it notices within one poll interval and exits.
fn engine_loop(scheduler: Weak<Scheduler>, dispatch_rx: Receiver<TaskId>) {
    loop {
        match dispatch_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(task_id) => match scheduler.upgrade() {
                Some(scheduler) => scheduler.run_slice(task_id),
                None => break,
            },
            Err(RecvTimeoutError::Timeout) => {
                if scheduler.upgrade().is_none() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("scheduler engine thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbgcore_emulator::mock::MockEmulator;

    fn new_scheduler() -> (Arc<Scheduler>, Arc<dyn Emulator>) {
        let emu: Arc<dyn Emulator> = Arc::new(MockEmulator::new(Arch::Arm));
        let contexts = Arc::new(ContextPool::new(emu.clone(), 2, 0x1000).unwrap());
        let control = Arc::new(ControlAddressPool::new(emu.clone(), 4).unwrap());
        let modules = Arc::new(ModuleManager::new());
        let scheduler = Scheduler::new(emu.clone(), contexts, control, modules).unwrap();
        (scheduler, emu)
    }

    #[test]
    fn spawned_tasks_get_distinct_increasing_ids() {
        let (scheduler, _emu) = new_scheduler();
        let a = scheduler.spawn_task(None);
        let b = scheduler.spawn_task(Some(a.id()));
        assert!(b.id().0 > a.id().0);
        assert_eq!(b.parent_id(), Some(a.id()));
        assert!(scheduler.task(a.id()).is_some());
        assert!(scheduler.task(b.id()).is_some());
    }

    #[test]
    fn main_thread_run_executes_inline_when_called_from_the_running_thread() {
        // S3: a MemInvalid hook callback calling mem_map runs synchronously
        // on top of emu.start, on whichever thread is blocked in it. That
        // must not be queued onto `exec`, or it deadlocks waiting for a
        // drain point that can only run after `emu.start` returns.
        let (scheduler, _emu) = new_scheduler();
        let task = scheduler.spawn_task(None);
        *scheduler.current.lock().unwrap() = Some(task.id());
        *scheduler.running_thread.lock().unwrap() = Some(std::thread::current().id());

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);
        scheduler.main_thread_run(Box::new(move || {
            ran_flag.store(true, Ordering::SeqCst);
        }));

        assert!(ran.load(Ordering::SeqCst), "job should run inline, not queue onto exec");
        assert!(scheduler.exec_rx.try_recv().is_err(), "nothing should have been queued");
    }

    #[test]
    fn main_thread_run_queues_when_a_different_task_owns_the_emulator() {
        let (scheduler, _emu) = new_scheduler();
        let task = scheduler.spawn_task(None);
        *scheduler.current.lock().unwrap() = Some(task.id());
        // running_thread left None: nobody is inside emu.start on this
        // thread, so a call from here must queue rather than run inline.

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);
        scheduler.main_thread_run(Box::new(move || {
            ran_flag.store(true, Ordering::SeqCst);
        }));

        assert!(!ran.load(Ordering::SeqCst));
        assert!(scheduler.exec_rx.try_recv().is_ok());
    }

    #[test]
    fn unhandled_event_cancels_the_running_task_and_start_main_returns() {
        let (scheduler, emu) = new_scheduler();

        let sched = Arc::clone(&scheduler);
        let handle = std::thread::spawn(move || sched.start_main(0x1000));

        let mut dispatched = false;
        for _ in 0..200 {
            if scheduler.current.lock().unwrap().is_some() {
                dispatched = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(dispatched, "engine thread never picked up the main task");
        assert_eq!(*scheduler.current.lock().unwrap(), Some(TaskId(0)));

        scheduler.on_unhandled(emu.as_ref(), UnhandledEvent::Interrupt(0x35));

        let result = handle.join().unwrap();
        assert!(result.is_err());
        assert_eq!(scheduler.main_task().status(), TaskStatus::Done);
    }
}
