//! The host-facing surface: a [`Runtime`] multiplexing many isolates over
//! one worker pool and one host loop.
//!
//! The host process itself plays the root isolate: every operation starts
//! from the root side, crosses into a target isolate via a three-phase
//! task, and lands its result back where the call began.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::environment::{
    HeapStatistics, IsolateEnvironment, IsolateHolder, IsolateOptions, RuntimeShared,
};
use crate::error::{RuntimeError, RuntimeResult};
use crate::host_loop::HostLoop;
use crate::inspector::{InspectorSession, SessionCallbacks};
use crate::module::Module;
use crate::pool::ThreadPool;
use crate::reference::Reference;
use crate::remote::RemoteHandle;
use crate::scheduler::RunScope;
use crate::script::Script;
use crate::three_phase::{self, ThreePhase};
use crate::transfer::Transferable;

pub(crate) fn root_env(
    shared: &Arc<RuntimeShared>,
) -> RuntimeResult<Arc<IsolateEnvironment>> {
    shared
        .root
        .get()
        .and_then(Weak::upgrade)
        .ok_or_else(|| RuntimeError::generic("Runtime has been disposed"))
}

/// The process-wide isolate runtime.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    // The holder keeps the root environment alive for the runtime's
    // lifetime.
    root_holder: Arc<IsolateHolder>,
    disposed: AtomicBool,
}

impl Runtime {
    pub fn new() -> RuntimeResult<Runtime> {
        let host = HostLoop::start();
        let shared = Arc::new(RuntimeShared {
            pool: ThreadPool::new(num_cpus::get() + 1),
            host: Arc::clone(&host),
            registry: DashMap::new(),
            next_env_id: AtomicU64::new(1),
            root: OnceLock::new(),
        });
        let root_env = IsolateEnvironment::new_root(&shared)?;
        let root_holder = IsolateHolder::new(Arc::clone(&root_env));
        let _ = shared.root.set(Arc::downgrade(&root_env));
        host.set_root(Arc::downgrade(&root_env));
        debug!("runtime started");
        Ok(Runtime {
            shared,
            root_holder,
            disposed: AtomicBool::new(false),
        })
    }

    /// Create a new isolate with its own heap and task queue.
    pub fn create_isolate(&self, options: IsolateOptions) -> RuntimeResult<IsolateRef> {
        let env = IsolateEnvironment::new(&self.shared, options)?;
        let holder = IsolateHolder::new(env);
        Ok(IsolateRef { holder })
    }

    /// Tear down: disposes every isolate, drains outstanding work, stops
    /// the host loop.
    pub fn dispose(mut self) {
        self.dispose_inner();
    }

    fn dispose_inner(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let envs: Vec<Arc<IsolateEnvironment>> = self
            .shared
            .registry
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .filter(|env| !env.is_root())
            .collect();
        for env in envs {
            if let Some(holder) = env.holder() {
                let _ = holder.dispose();
            }
        }
        self.shared.host.wait_idle();
        self.shared.host.shutdown();
        self.root_holder.clear();
        debug!("runtime disposed");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}

/// A handle to one isolate.
#[derive(Clone)]
pub struct IsolateRef {
    holder: Arc<IsolateHolder>,
}

impl IsolateRef {
    pub(crate) fn holder(&self) -> &Arc<IsolateHolder> {
        &self.holder
    }

    /// Whether disposal has begun (or completed).
    pub fn is_disposed(&self) -> bool {
        self.holder.is_disposed()
    }

    /// Dispose the isolate. Refused from inside the isolate itself.
    pub fn dispose(&self) -> RuntimeResult<()> {
        self.holder.dispose()
    }

    /// Create an execution context inside the isolate.
    pub fn create_context(&self) -> RuntimeResult<ContextRef> {
        let slot: Arc<parking_lot::Mutex<Option<(RemoteHandle, Reference)>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let task = CreateContextRunner {
            slot: Arc::clone(&slot),
        };
        three_phase::run_sync(task, &self.holder)?;
        let (global_handle, global_ref) = slot
            .lock()
            .take()
            .ok_or_else(|| RuntimeError::generic("context creation produced nothing"))?;
        Ok(ContextRef {
            isolate: Arc::clone(&self.holder),
            global_handle,
            global_ref,
        })
    }

    /// Compile source into a script owned by this isolate.
    pub fn compile_script(&self, code: &str, filename: &str) -> RuntimeResult<Script> {
        crate::script::compile(&self.holder, code, filename)
    }

    /// Compile source as a module owned by this isolate.
    pub fn compile_module(&self, code: &str, filename: &str) -> RuntimeResult<Module> {
        crate::module::compile(&self.holder, code, filename)
    }

    /// Heap usage snapshot for this isolate.
    pub fn heap_statistics(&self) -> RuntimeResult<HeapStatistics> {
        self.holder.expect()?.heap_statistics()
    }

    /// CPU time accumulated executing inside this isolate.
    pub fn cpu_time(&self) -> RuntimeResult<Duration> {
        Ok(self.holder.expect()?.cpu_time())
    }

    /// Wall-clock time spent entered into this isolate.
    pub fn wall_time(&self) -> RuntimeResult<Duration> {
        Ok(self.holder.expect()?.wall_time())
    }

    /// Outstanding remote handles into this isolate.
    pub fn remotes_count(&self) -> RuntimeResult<usize> {
        Ok(self
            .holder
            .expect()?
            .remotes_count
            .load(Ordering::Acquire))
    }

    /// Open an inspector session against this isolate. Responses arrive on
    /// the root side.
    pub fn create_inspector_session(
        &self,
        callbacks: SessionCallbacks,
    ) -> RuntimeResult<InspectorSession> {
        let env = self.holder.expect()?;
        let root = root_env(&env.shared)?;
        let source = root
            .holder()
            .ok_or_else(|| RuntimeError::generic("Runtime has been disposed"))?;
        InspectorSession::create(Arc::clone(&self.holder), source, callbacks)
    }
}

impl std::fmt::Debug for IsolateRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IsolateRef(disposed: {})", self.is_disposed())
    }
}

/// A context within an isolate, exposed through its global object.
pub struct ContextRef {
    isolate: Arc<IsolateHolder>,
    global_handle: RemoteHandle,
    global_ref: Reference,
}

impl ContextRef {
    /// Reference to the context's global object.
    pub fn global(&self) -> &Reference {
        &self.global_ref
    }

    pub(crate) fn global_handle(&self) -> &RemoteHandle {
        &self.global_handle
    }

    pub(crate) fn isolate(&self) -> &Arc<IsolateHolder> {
        &self.isolate
    }

    /// Release the context's handles; later operations through it fail.
    pub fn release(&self) -> RuntimeResult<()> {
        self.global_ref.release()
    }
}

impl std::fmt::Debug for ContextRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ContextRef")
    }
}

struct CreateContextRunner {
    slot: Arc<parking_lot::Mutex<Option<(RemoteHandle, Reference)>>>,
}

impl ThreePhase for CreateContextRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let context = scope
            .iso
            .create_context()
            .map_err(|e| crate::external_copy::runtime_error_from_engine(scope, e))?;
        let global = islet_engine::Value::Object(context.global().clone());
        let handle = RemoteHandle::new(scope, &global)?;
        let reference = Reference::from_value(scope, &global, false, false)?;
        *self.slot.lock() = Some((handle, reference));
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::copy(crate::external_copy::ExternalCopy::undefined()))
    }
}
