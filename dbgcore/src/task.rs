//! Tasks are the unit of guest execution the scheduler (§4.6) multiplexes
//! over the single emulator. Everything here is deliberately dumb about
//! *when* it runs - a `Task` never drives the emulator itself, only
//! records what should happen to its registers/context and hands
//! continuations to its own worker, which in turn asks the scheduler to
//! run it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::trace;

use dbgcore_emulator::{Context, Emulator, Reg};

use crate::context::TaskContextEntry;
use crate::errors::{DbgError, ExceptionKind, PcLocation, Result, SimulateException};
use crate::runner::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// A task's lifecycle is monotone except for the reusable main task, which
/// alone can reach [`TaskStatus::Close`] and be handed back out as
/// `Pending` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Close,
}

/// Why a task stopped running. `Done` itself doubles as the "no error"
/// sentinel so the scheduler has a uniform cause to carry out of the
/// suspend/resume channel even on the success path; callers only ever see
/// it turned into `Ok(())` by [`TaskCause::into_result`].
#[derive(Debug, Clone)]
pub enum TaskCause {
    Done,
    Exception(SimulateException),
    Cancelled,
}

impl TaskCause {
    pub fn into_result(self) -> Result<()> {
        match self {
            TaskCause::Done => Ok(()),
            TaskCause::Exception(e) => Err(DbgError::Simulate(e)),
            TaskCause::Cancelled => Err(DbgError::Simulate(SimulateException {
                kind: ExceptionKind::Panic,
                location: PcLocation { pc: 0, module: None },
                detail: "task cancelled".into(),
            })),
        }
    }

    pub fn as_exception(&self) -> Option<SimulateException> {
        match self {
            TaskCause::Done => None,
            TaskCause::Exception(e) => Some(e.clone()),
            TaskCause::Cancelled => Some(SimulateException {
                kind: ExceptionKind::Panic,
                location: PcLocation { pc: 0, module: None },
                detail: "task cancelled".into(),
            }),
        }
    }
}

pub type Continuation = Box<dyn FnOnce(&Arc<Task>) + Send>;

const STATUS_PENDING: u32 = 0;
const STATUS_RUNNING: u32 = 1;
const STATUS_DONE: u32 = 2;
const STATUS_CLOSE: u32 = 3;

fn decode_status(s: u32) -> TaskStatus {
    match s {
        STATUS_PENDING => TaskStatus::Pending,
        STATUS_RUNNING => TaskStatus::Running,
        STATUS_DONE => TaskStatus::Done,
        _ => TaskStatus::Close,
    }
}

struct Inner {
    context: Option<TaskContextEntry>,
    regs: HashMap<u32, u64>,
    sp: u64,
    locals: HashMap<String, Box<dyn Any + Send>>,
    cause: Option<TaskCause>,
}

struct Done {
    tx: Option<Sender<()>>,
    rx: Receiver<()>,
}

/// One cooperatively-scheduled unit of guest execution.
///
/// The register cache plus `change` flag implements §9's batching
/// discipline: every `reg_write` only touches the cache, and
/// `context_restore` is the single place that flushes it to the emulator
/// context, using a batched write when more than one register is dirty.
pub struct Task {
    id: TaskId,
    parent: Option<TaskId>,
    status: AtomicU32,
    generation: AtomicU64,
    change: AtomicBool,
    inner: Mutex<Inner>,
    done: Mutex<Done>,
    scheduler: Weak<Scheduler>,
    continuation_tx: Sender<Continuation>,
    continuation_rx: Receiver<Continuation>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    pub fn new(id: TaskId, parent: Option<TaskId>, scheduler: Weak<Scheduler>) -> Arc<Task> {
        let (tx, rx) = bounded(0);
        let (continuation_tx, continuation_rx) = unbounded();
        let task = Arc::new(Task {
            id,
            parent,
            status: AtomicU32::new(STATUS_PENDING),
            generation: AtomicU64::new(0),
            change: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                context: None,
                regs: HashMap::new(),
                sp: 0,
                locals: HashMap::new(),
                cause: None,
            }),
            done: Mutex::new(Done { tx: Some(tx), rx }),
            scheduler,
            continuation_tx,
            continuation_rx,
            worker: Mutex::new(None),
        });
        task.spawn_worker();
        task
    }

    fn spawn_worker(self: &Arc<Task>) {
        let task = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("task-{}-worker", self.id.0))
            .spawn(move || loop {
                let job = match task.continuation_rx.recv() {
                    Ok(job) => job,
                    Err(_) => break,
                };
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job(&task)));
                if result.is_err() {
                    task.finish(TaskCause::Exception(SimulateException {
                        kind: ExceptionKind::Panic,
                        location: PcLocation { pc: 0, module: None },
                        detail: "panic in task continuation".into(),
                    }));
                    break;
                }
                if matches!(task.status(), TaskStatus::Done) {
                    break;
                }
            })
            .expect("spawning a task worker thread");
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn parent_id(&self) -> Option<TaskId> {
        self.parent
    }

    pub fn status(&self) -> TaskStatus {
        decode_status(self.status.load(Ordering::SeqCst))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn change(&self) -> bool {
        self.change.load(Ordering::SeqCst)
    }

    pub fn bind_context(&self, entry: TaskContextEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.sp = entry.stack.addr + entry.stack.size;
        inner.context = Some(entry);
    }

    pub fn take_context(&self) -> Option<TaskContextEntry> {
        self.inner.lock().unwrap().context.take()
    }

    pub fn has_context(&self) -> bool {
        self.inner.lock().unwrap().context.is_some()
    }

    /// Marks the task `Running` without enqueuing it on the scheduler's
    /// dispatch channel, for callers (the inline host-call path) that
    /// drive it directly on the calling thread instead.
    pub fn mark_running(&self) {
        self.status.store(STATUS_RUNNING, Ordering::SeqCst);
    }

    /// Enqueues a continuation for the task's private worker, which will
    /// eventually call back into the scheduler to run it. Used by the
    /// async-dispatch path (§4.6) to hand guest-triggered work off the
    /// emulator thread.
    pub fn post(&self, job: Continuation) {
        let _ = self.continuation_tx.send(job);
    }

    /// Returns the cached value for `reg`, populating the cache from the
    /// bound context on a miss.
    pub fn reg_read(&self, reg: Reg) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(v) = inner.regs.get(&reg.0) {
            return Ok(*v);
        }
        let context = inner.context.as_ref().ok_or(DbgError::ContextInvalid)?;
        let value = context.context.reg_read(reg)?;
        inner.regs.insert(reg.0, value);
        Ok(value)
    }

    pub fn reg_write(&self, reg: Reg, value: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.regs.insert(reg.0, value);
        self.change.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn context_save(&self) -> Result<()> {
        self.status.store(STATUS_RUNNING, Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        let context = inner.context.as_mut().ok_or(DbgError::ContextInvalid)?;
        context.context.save()?;
        Ok(())
    }

    /// Flushes the dirty register cache to the bound emulator context (as
    /// a single batched write when more than one register changed) and
    /// restores it, per §9's rule that the cache must be fully flushed on
    /// every suspension that may hand the emulator thread to another task.
    pub fn context_restore(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let context = inner.context.as_mut().ok_or(DbgError::ContextInvalid)?;
        if self.change.swap(false, Ordering::SeqCst) {
            let regs: Vec<Reg> = inner.regs.keys().map(|&id| Reg(id)).collect();
            if regs.len() > 1 {
                let vals: Vec<u64> = regs.iter().map(|r| inner.regs[&r.0]).collect();
                context.context.reg_write_batch(&regs, &vals)?;
            } else if let Some(reg) = regs.first() {
                context.context.reg_write(*reg, inner.regs[&reg.0])?;
            }
        }
        context.context.restore()?;
        inner.regs.clear();
        Ok(())
    }

    pub fn stack_alloc(&self, size: u64, align: u64) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.context.is_none() {
            return Err(DbgError::ContextInvalid);
        }
        let aligned = size.max(1).next_multiple_of(align.max(1));
        inner.sp -= aligned;
        inner.sp &= !(align.max(1) - 1);
        Ok(inner.sp)
    }

    pub fn stack_free(&self, size: u64, align: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.sp += size.max(1).next_multiple_of(align.max(1));
    }

    pub fn sp(&self) -> u64 {
        self.inner.lock().unwrap().sp
    }

    pub fn set_local(&self, key: impl Into<String>, value: Box<dyn Any + Send>) {
        self.inner.lock().unwrap().locals.insert(key.into(), value);
    }

    pub fn get_local<T: 'static + Clone>(&self, key: &str) -> Option<T> {
        self.inner
            .lock()
            .unwrap()
            .locals
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Legal only in `Pending`: transitions to `Running` and enqueues
    /// itself on the scheduler's dispatch channel. A second `run()` on an
    /// already-started task returns its current status as an error rather
    /// than re-enqueuing it (§9 open question, resolved explicitly).
    pub fn run(self: &Arc<Task>) -> Result<()> {
        match self.status.compare_exchange(
            STATUS_PENDING,
            STATUS_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                trace!("task {:?}: run() enqueued", self.id);
                let scheduler = self.scheduler.upgrade().ok_or(DbgError::TaskInvalid)?;
                scheduler.dispatch(self.clone());
                Ok(())
            }
            Err(_) => Err(DbgError::TaskNotPending(self.id)),
        }
    }

    /// Runs the task and blocks until it reaches `Done`, mapping the
    /// `Done` cause to success and every other cause to `Err`.
    pub fn sync_run(self: &Arc<Task>) -> Result<()> {
        self.run()?;
        self.wait_done();
        let cause = self
            .inner
            .lock()
            .unwrap()
            .cause
            .clone()
            .unwrap_or(TaskCause::Done);
        cause.into_result()
    }

    /// Blocks until the task's done channel closes. Safe to call
    /// concurrently (recv on a closed channel returns immediately to every
    /// caller) and safe to call again after `reset()` picks up a fresh
    /// channel.
    pub fn wait_done(&self) {
        let rx = self.done.lock().unwrap().rx.clone();
        let _ = rx.recv();
    }

    /// Clones this task's bound context and spawns a sibling task sharing
    /// the same register state at the moment of the fork, with
    /// `parent_id` set to this task's id. The two tasks' register caches
    /// are independent from that point on (S5: isolation).
    pub fn fork(self: &Arc<Task>) -> Result<Arc<Task>> {
        let scheduler = self.scheduler.upgrade().ok_or(DbgError::TaskInvalid)?;
        let mut inner = self.inner.lock().unwrap();
        let context = inner.context.as_ref().ok_or(DbgError::ContextInvalid)?;
        if self.change.swap(false, Ordering::SeqCst) {
            for (&id, &value) in inner.regs.iter() {
                context.context.reg_write(Reg(id), value)?;
            }
        }
        let cloned_context = context.context.clone_context()?;
        let sibling_entry = TaskContextEntry {
            context: cloned_context,
            stack: context.stack,
        };
        let regs = inner.regs.clone();
        drop(inner);

        let sibling = scheduler.spawn_task(Some(self.id));
        sibling.bind_context(sibling_entry);
        sibling.inner.lock().unwrap().regs = regs;
        Ok(sibling)
    }

    /// Marks the task `Done` with `cause` and closes its done channel.
    /// Idempotent: a cancel racing a just-finished run is a silent no-op,
    /// since by the time a caller observes the task it may have already
    /// raced to completion.
    pub fn finish(&self, cause: TaskCause) {
        if self.status.swap(STATUS_DONE, Ordering::SeqCst) == STATUS_DONE {
            return;
        }
        self.inner.lock().unwrap().cause = Some(cause);
        self.done.lock().unwrap().tx.take();
    }

    pub fn cancel(&self, cause: TaskCause) {
        self.finish(cause);
    }

    pub fn cause(&self) -> Option<SimulateException> {
        self.inner
            .lock()
            .unwrap()
            .cause
            .as_ref()
            .and_then(TaskCause::as_exception)
    }

    /// Recycles a finished reusable task (the scheduler's main task) back
    /// to `Pending`, bumping its generation so in-flight cancels addressed
    /// to the old generation are ignored, and installing a fresh done
    /// channel for the new run.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().unwrap().cause = None;
        let (tx, rx) = bounded(0);
        *self.done.lock().unwrap() = Done { tx: Some(tx), rx };
        self.status.store(STATUS_PENDING, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.status.store(STATUS_CLOSE, Ordering::SeqCst);
    }
}

/// Resolves a program-counter value into a [`SimulateException`] location,
/// consulting the module manager so the error surface follows §6's
/// `"module: NAME, offset: HHHHHHHH"` / `"pc: HHHHHHHHHHHHHHHH"` split.
pub fn locate_exception(
    modules: &crate::module::ModuleManager,
    kind: ExceptionKind,
    pc: u64,
    detail: String,
) -> SimulateException {
    SimulateException {
        kind,
        location: PcLocation {
            pc,
            module: modules.locate(pc),
        },
        detail,
    }
}

#[allow(dead_code)]
fn _assert_emulator_trait_object_safe(_: &dyn Emulator) {}
#[allow(dead_code)]
fn _assert_context_trait_object_safe(_: &dyn Context) {}
