//! One isolate instance: the engine under its lock, the scheduler, memory
//! accounting, lifecycle, and the bookkeeping that keeps cross-isolate
//! handles honest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use islet_engine as engine;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::executor;
use crate::host_loop::HostLoop;
use crate::lockable::Lockable;
use crate::module::ModuleInfo;
use crate::pool::ThreadPool;
use crate::scheduler::{Runnable, RunScope, Scheduler, Status};
use crate::timer::TimerHolder;
use crate::transfer::Instance;

/// The minimum accepted `memory_limit` in MiB.
pub const MIN_MEMORY_LIMIT_MB: usize = 8;

/// Slack on top of the configured limit for engine bookkeeping.
const MISC_MEMORY: usize = 2 * 1024 * 1024;

/// Small allocations the engine cannot survive failing; admitted even over
/// the limit, paired with immediate termination.
const OVERSHOOT_GRACE: usize = 64;

/// Options for creating an isolate.
pub struct IsolateOptions {
    /// Heap cap in MiB; at least [`MIN_MEMORY_LIMIT_MB`].
    pub memory_limit_mb: usize,
    /// Snapshot blob to boot from.
    pub snapshot: Option<Vec<u8>>,
    /// Reserve an inspector agent for this isolate.
    pub inspector: bool,
    /// Invoked once if the isolate dies to a memory-limit breach.
    pub on_catastrophic_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl Default for IsolateOptions {
    fn default() -> Self {
        IsolateOptions {
            memory_limit_mb: 128,
            snapshot: None,
            inspector: false,
            on_catastrophic_error: None,
        }
    }
}

/// Process-wide runtime state shared by every environment.
pub(crate) struct RuntimeShared {
    pub pool: ThreadPool,
    pub host: Arc<HostLoop>,
    pub registry: DashMap<u64, Weak<IsolateEnvironment>>,
    pub next_env_id: AtomicU64,
    /// The root environment, set once at runtime startup.
    pub root: OnceLock<Weak<IsolateEnvironment>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Normal,
    Disposing,
    Disposed,
}

/// Array-buffer allocator that enforces the isolate's memory limit on
/// externally allocated bytes. Allocations up to [`OVERSHOOT_GRACE`] are
/// admitted even at the limit (refusing them would crash the engine mid
/// typed-array materialization); the isolate is terminated instead.
pub(crate) struct LimitedAllocator {
    limit: usize,
    extra: AtomicUsize,
    failures: AtomicUsize,
    hooks: OnceLock<AllocatorHooks>,
}

struct AllocatorHooks {
    engine: engine::IsolateHandle,
    hit_limit: Arc<AtomicBool>,
}

impl LimitedAllocator {
    fn new(limit: usize) -> Arc<LimitedAllocator> {
        Arc::new(LimitedAllocator {
            limit,
            extra: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            hooks: OnceLock::new(),
        })
    }

    fn install_hooks(&self, engine: engine::IsolateHandle, hit_limit: Arc<AtomicBool>) {
        let _ = self.hooks.set(AllocatorHooks { engine, hit_limit });
    }

    pub fn extra_allocated(&self) -> usize {
        self.extra.load(Ordering::Acquire)
    }

    fn fail_hard(&self) {
        if let Some(hooks) = self.hooks.get() {
            hooks.hit_limit.store(true, Ordering::Release);
            hooks.engine.terminate_execution();
        }
    }

    /// Two-stage admission check: on a first failure, ask the isolate to
    /// shed memory and re-check before giving up.
    fn check(&self, len: usize) -> bool {
        let fits =
            |used: usize| used.saturating_add(len) <= self.limit + MISC_MEMORY;
        if fits(self.extra.load(Ordering::Acquire)) {
            return true;
        }
        if let Some(hooks) = self.hooks.get() {
            hooks.engine.low_memory_notification();
        }
        fits(self.extra.load(Ordering::Acquire))
    }
}

impl engine::ArrayBufferAllocator for LimitedAllocator {
    fn allocate(&self, len: usize) -> bool {
        if self.check(len) {
            self.extra.fetch_add(len, Ordering::AcqRel);
            return true;
        }
        self.failures.fetch_add(1, Ordering::AcqRel);
        if len <= OVERSHOOT_GRACE {
            self.extra.fetch_add(len, Ordering::AcqRel);
            self.fail_hard();
            true
        } else {
            false
        }
    }

    fn free(&self, len: usize) {
        self.extra.fetch_sub(len, Ordering::AcqRel);
    }
}

/// Owner-facing handle slot for an environment; cleared on disposal so every
/// later operation observes "Isolate is disposed".
pub struct IsolateHolder {
    env: Mutex<Option<Arc<IsolateEnvironment>>>,
}

impl IsolateHolder {
    pub(crate) fn new(env: Arc<IsolateEnvironment>) -> Arc<IsolateHolder> {
        let holder = Arc::new(IsolateHolder {
            env: Mutex::new(Some(Arc::clone(&env))),
        });
        env.attach_holder(&holder);
        holder
    }

    pub(crate) fn get(&self) -> Option<Arc<IsolateEnvironment>> {
        self.env.lock().clone()
    }

    pub(crate) fn expect(&self) -> RuntimeResult<Arc<IsolateEnvironment>> {
        self.get().ok_or_else(RuntimeError::disposed)
    }

    pub(crate) fn clear(&self) {
        *self.env.lock() = None;
    }

    /// Queue a regular task; errors if the isolate is disposed (the caller
    /// owns orphan semantics via the task's `Drop`).
    pub(crate) fn schedule_task(&self, task: Box<dyn Runnable>) -> RuntimeResult<()> {
        let env = self.expect()?;
        env.schedule_task(task);
        Ok(())
    }

    /// Queue a handle task; silently dropped when the isolate is gone, since
    /// the engine values it would touch no longer exist.
    pub(crate) fn schedule_handle_task(&self, task: Box<dyn Runnable>) {
        if let Some(env) = self.get() {
            env.schedule_handle_task(task);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.get().is_none()
    }

    /// Dispose the isolate: `Normal → Disposing → Disposed`. Idempotent once
    /// started. Refused from inside the isolate itself and for the root.
    pub fn dispose(&self) -> RuntimeResult<()> {
        let env = match self.get() {
            Some(env) => env,
            None => return Ok(()),
        };
        env.dispose()
    }
}

pub struct IsolateEnvironment {
    pub(crate) id: u64,
    pub(crate) shared: Arc<RuntimeShared>,
    engine: Mutex<Option<engine::Isolate>>,
    pub(crate) engine_handle: engine::IsolateHandle,
    pub(crate) scheduler: Scheduler,
    root: bool,
    pub(crate) memory_limit: usize,
    pub(crate) allocator: Arc<LimitedAllocator>,
    pub(crate) hit_memory_limit: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    pub(crate) remotes_count: AtomicUsize,
    pub(crate) terminate_depth: AtomicUsize,
    pub(crate) terminated: AtomicBool,
    pub(crate) timer_holder: TimerHolder,
    timing: Lockable<(Duration, Duration)>,
    claimed_thread: Mutex<Option<std::thread::ThreadId>>,
    holder_ref: OnceLock<Weak<IsolateHolder>>,
    /// Objects inside this isolate that are runtime handles (references,
    /// dereferences, external-copy handles). Touched only under the engine
    /// lock.
    pub(crate) instances: Mutex<HashMap<usize, Instance>>,
    /// Module registry: persistent identity → module info.
    pub(crate) module_registry: Mutex<HashMap<u64, Arc<ModuleInfo>>>,
    /// Cleanup callbacks fired exactly once at forced disposal for state
    /// that outlives individual handles (external string accounting etc.).
    weak_callbacks: Mutex<HashMap<u64, Box<dyn FnOnce() + Send>>>,
    next_weak_id: AtomicU64,
    catastrophic: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    pub(crate) inspector_enabled: bool,
    pub(crate) inspector_sessions: Mutex<Vec<Weak<crate::inspector::SessionShared>>>,
    /// Back-reference to the owning `Arc`, for scheduling closures that
    /// need a strong handle.
    self_ref: Weak<IsolateEnvironment>,
}

impl IsolateEnvironment {
    /// Create a non-root environment.
    pub(crate) fn new(
        shared: &Arc<RuntimeShared>,
        options: IsolateOptions,
    ) -> RuntimeResult<Arc<IsolateEnvironment>> {
        if options.memory_limit_mb < MIN_MEMORY_LIMIT_MB {
            return Err(RuntimeError::generic(format!(
                "memoryLimit must be at least {}",
                MIN_MEMORY_LIMIT_MB
            )));
        }
        let memory_limit = options.memory_limit_mb * 1024 * 1024;
        Self::build(shared, memory_limit, options, false)
    }

    /// Create the root environment the host process itself runs as.
    pub(crate) fn new_root(shared: &Arc<RuntimeShared>) -> RuntimeResult<Arc<IsolateEnvironment>> {
        Self::build(shared, 512 * 1024 * 1024, IsolateOptions::default(), true)
    }

    fn build(
        shared: &Arc<RuntimeShared>,
        memory_limit: usize,
        options: IsolateOptions,
        root: bool,
    ) -> RuntimeResult<Arc<IsolateEnvironment>> {
        let allocator = LimitedAllocator::new(memory_limit);
        let engine_iso = engine::Isolate::new(engine::CreateParams {
            heap_limit: memory_limit,
            snapshot: options.snapshot,
            allocator: Some(Arc::clone(&allocator) as Arc<dyn engine::ArrayBufferAllocator>),
        })
        .map_err(|e| RuntimeError::generic(format!("failed to create isolate: {}", e)))?;

        let engine_handle = engine_iso.handle();
        let hit_memory_limit = Arc::new(AtomicBool::new(false));
        allocator.install_hooks(engine_handle.clone(), Arc::clone(&hit_memory_limit));
        {
            // Heap-limit breach inside the engine: flag the isolate and
            // terminate; the task epilogue turns this into a fatal error.
            let hit = Arc::clone(&hit_memory_limit);
            let handle = engine_handle.clone();
            engine_iso.set_near_heap_limit_callback(Box::new(move |_used| {
                hit.store(true, Ordering::Release);
                handle.terminate_execution();
            }));
        }

        let id = shared.next_env_id.fetch_add(1, Ordering::AcqRel);
        let env = Arc::new_cyclic(|self_ref| IsolateEnvironment {
            id,
            shared: Arc::clone(shared),
            engine: Mutex::new(Some(engine_iso)),
            engine_handle: engine_handle.clone(),
            scheduler: Scheduler::new(),
            root,
            memory_limit,
            allocator: Arc::clone(&allocator),
            hit_memory_limit: Arc::clone(&hit_memory_limit),
            lifecycle: Mutex::new(Lifecycle::Normal),
            remotes_count: AtomicUsize::new(0),
            terminate_depth: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            timer_holder: TimerHolder::new(),
            timing: Lockable::new((Duration::ZERO, Duration::ZERO)),
            claimed_thread: Mutex::new(None),
            holder_ref: OnceLock::new(),
            instances: Mutex::new(HashMap::new()),
            module_registry: Mutex::new(HashMap::new()),
            weak_callbacks: Mutex::new(HashMap::new()),
            next_weak_id: AtomicU64::new(1),
            catastrophic: Mutex::new(options.on_catastrophic_error),
            inspector_enabled: options.inspector,
            inspector_sessions: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });
        shared.registry.insert(id, Arc::downgrade(&env));
        debug!(isolate = id, root, limit = memory_limit, "isolate created");
        Ok(env)
    }

    fn attach_holder(&self, holder: &Arc<IsolateHolder>) {
        let _ = self.holder_ref.set(Arc::downgrade(holder));
    }

    /// The holder owning this environment. Present from creation until the
    /// last external reference dies.
    pub(crate) fn holder(&self) -> Option<Arc<IsolateHolder>> {
        self.holder_ref.get().and_then(Weak::upgrade)
    }

    /// Strong handle to this environment.
    fn arc(&self) -> Arc<IsolateEnvironment> {
        match self.self_ref.upgrade() {
            Some(env) => env,
            None => unreachable!("environment accessed after its last reference dropped"),
        }
    }

    pub(crate) fn engine_mutex(&self) -> &Mutex<Option<engine::Isolate>> {
        &self.engine
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    // ---- Thread claims (executor support) ----

    pub(crate) fn claim_thread(&self) -> RuntimeResult<()> {
        let mut claimed = self.claimed_thread.lock();
        let current = std::thread::current().id();
        match *claimed {
            Some(owner) if owner != current => Err(RuntimeError::generic(
                "Isolate is entered on another thread",
            )),
            _ => {
                *claimed = Some(current);
                Ok(())
            }
        }
    }

    pub(crate) fn release_thread(&self) {
        *self.claimed_thread.lock() = None;
    }

    // ---- Time accounting ----

    pub(crate) fn accumulate_cpu(&self, delta: Duration) {
        self.timing.write().0 += delta;
    }

    pub(crate) fn accumulate_wall(&self, delta: Duration) {
        self.timing.write().1 += delta;
    }

    pub fn cpu_time(&self) -> Duration {
        self.timing.read().0
    }

    pub fn wall_time(&self) -> Duration {
        self.timing.read().1
    }

    // ---- Weak callbacks ----

    pub(crate) fn add_weak_callback(&self, callback: Box<dyn FnOnce() + Send>) -> u64 {
        let id = self.next_weak_id.fetch_add(1, Ordering::AcqRel);
        self.weak_callbacks.lock().insert(id, callback);
        id
    }

    pub(crate) fn remove_weak_callback(&self, id: u64) -> Option<Box<dyn FnOnce() + Send>> {
        self.weak_callbacks.lock().remove(&id)
    }

    // ---- Scheduling ----

    fn wake_locked(&self, state: &mut crate::scheduler::SchedulerState) -> bool {
        if state.status == Status::Running {
            return false;
        }
        state.status = Status::Running;
        self.shared.host.increment_ref();
        if self.root {
            self.shared.host.send_wake();
        } else {
            let env = self.arc();
            self.shared.pool.exec(
                &mut state.affinity,
                Box::new(move |pool_thread| env.async_entry(pool_thread)),
            );
        }
        true
    }

    pub(crate) fn schedule_task(&self, task: Box<dyn Runnable>) {
        let mut state = self.scheduler.lock();
        state.tasks.push_back(task);
        self.wake_locked(&mut state);
    }

    pub(crate) fn schedule_handle_task(&self, task: Box<dyn Runnable>) {
        let mut state = self.scheduler.lock();
        state.handle_tasks.push_back(task);
        self.wake_locked(&mut state);
    }

    /// Queue an interrupt and ask the engine to service it at the next safe
    /// point inside running JS.
    pub(crate) fn schedule_interrupt(&self, task: Box<dyn Runnable>) {
        {
            let mut state = self.scheduler.lock();
            state.interrupts.push_back(task);
        }
        let env = self.arc();
        self.engine_handle.request_interrupt(Box::new(move |iso| {
            let scope = RunScope { env: &env, iso };
            for task in env.scheduler.take_interrupts() {
                task.run(&scope);
            }
        }));
    }

    /// Interrupt identity for the root isolate's synchronous path.
    pub(crate) fn schedule_sync_interrupt(&self, task: Box<dyn Runnable>) {
        {
            let mut state = self.scheduler.lock();
            state.sync_interrupts.push_back(task);
        }
        let env = self.arc();
        self.engine_handle.request_interrupt(Box::new(move |iso| {
            let scope = RunScope { env: &env, iso };
            for task in env.scheduler.take_sync_interrupts() {
                task.run(&scope);
            }
        }));
    }

    /// Dispatch entry invoked by the worker pool or the host loop.
    pub(crate) fn async_entry(&self, _pool_thread: bool) {
        // The loop ref taken by wake_locked is released however this exits.
        let host = Arc::clone(&self.shared.host);
        let _loop_ref = scopeguard::guard((), move |()| host.decrement_ref());
        let this = self.arc();
        match executor::Lock::enter(&this) {
            Ok(lock) => {
                let scope = RunScope {
                    env: &this,
                    iso: lock.isolate(),
                };
                loop {
                    if self.scheduler.done_if_drained() {
                        break;
                    }
                    let (handle_tasks, interrupts, tasks) = self.scheduler.take_all();
                    for task in handle_tasks {
                        task.run(&scope);
                    }
                    for task in interrupts {
                        task.run(&scope);
                    }
                    if self.hit_memory_limit.load(Ordering::Acquire)
                        || self.lifecycle() != Lifecycle::Normal
                    {
                        // Dropping the remaining tasks fires their orphan
                        // paths (rejections back into their source isolates).
                        drop(tasks);
                        continue;
                    }
                    for task in tasks {
                        task.run(&scope);
                    }
                }
            }
            Err(_) => {
                // Disposed under us: orphan everything that was queued.
                loop {
                    let (handle_tasks, interrupts, tasks) = self.scheduler.take_all();
                    drop((handle_tasks, interrupts, tasks));
                    if self.scheduler.done_if_drained() {
                        break;
                    }
                }
            }
        }
    }

    /// Post-task bookkeeping: drain microtasks, surface a memory-limit
    /// breach as fatal, rethrow a recorded unhandled rejection.
    pub(crate) fn task_epilogue(&self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        scope
            .iso
            .run_microtasks()
            .map_err(|e| crate::external_copy::runtime_error_from_engine(scope, e))?;
        if self.hit_memory_limit.load(Ordering::Acquire) {
            self.fail_catastrophically();
            return Err(RuntimeError::fatal(
                "Isolate was disposed during execution due to memory limit",
            ));
        }
        if let Some(rejection) = scope.iso.take_unhandled_rejection() {
            let copy = crate::external_copy::copy_thrown_value(scope, &rejection);
            return Err(RuntimeError::Js(copy));
        }
        Ok(())
    }

    /// Cooperative termination request from outside the isolate.
    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.engine_handle.terminate_execution();
        self.scheduler.cancel_async();
    }

    /// Memory-limit breach: notify the embedder and queue disposal on the
    /// host thread (an isolate cannot dispose itself).
    pub(crate) fn fail_catastrophically(&self) {
        let callback = self.catastrophic.lock().take();
        if let Some(callback) = callback {
            callback("Isolate was disposed during execution due to memory limit");
        }
        if let Some(holder) = self.holder() {
            self.shared.host.post(Box::new(move || {
                if let Err(e) = holder.dispose() {
                    warn!(error = %e, "catastrophic disposal failed");
                }
            }));
        }
    }

    fn dispose(&self) -> RuntimeResult<()> {
        if self.root {
            return Err(RuntimeError::generic("Cannot dispose the root isolate"));
        }
        if executor::is_inside(self) {
            return Err(RuntimeError::generic(
                "Cannot dispose an isolate from within itself",
            ));
        }
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Normal => *lifecycle = Lifecycle::Disposing,
                // Disposal is idempotent once started.
                Lifecycle::Disposing | Lifecycle::Disposed => return Ok(()),
            }
        }
        debug!(isolate = self.id, "disposing isolate");
        self.terminate();
        self.scheduler.cancel_async();

        let this = self.arc();
        {
            let lock = executor::Lock::enter(&this)?;
            let scope = RunScope {
                env: &this,
                iso: lock.isolate(),
            };
            // Handle tasks run even during disposal preparation; regular
            // tasks are orphaned.
            loop {
                let (handle_tasks, interrupts, tasks) = self.scheduler.take_all();
                if handle_tasks.is_empty() && interrupts.is_empty() && tasks.is_empty() {
                    break;
                }
                for task in handle_tasks {
                    task.run(&scope);
                }
                drop((interrupts, tasks));
            }
            let callbacks: Vec<_> = {
                let mut map = self.weak_callbacks.lock();
                map.drain().map(|(_, f)| f).collect()
            };
            for callback in callbacks {
                callback();
            }
            self.instances.lock().clear();
            self.module_registry.lock().clear();
        }

        crate::inspector::close_sessions(self);
        *self.engine.lock() = None;
        *self.lifecycle.lock() = Lifecycle::Disposed;
        if let Some(holder) = self.holder() {
            holder.clear();
        }
        self.shared.registry.remove(&self.id);
        debug!(isolate = self.id, "isolate disposed");
        Ok(())
    }

    /// Heap usage snapshot: engine-internal bytes plus externally allocated
    /// buffer bytes.
    pub fn heap_statistics(&self) -> RuntimeResult<HeapStatistics> {
        let guard = self.engine.lock();
        let engine = guard.as_ref().ok_or_else(RuntimeError::disposed)?;
        Ok(HeapStatistics {
            used: engine.heap_used(),
            external: self.allocator.extra_allocated(),
            limit: self.memory_limit,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HeapStatistics {
    pub used: usize,
    pub external: usize,
    pub limit: usize,
}
