//! The three-phase protocol every cross-isolate operation follows.
//!
//! Phase 1 extracts data in the source isolate (the task's constructor),
//! phase 2 runs entered into the target isolate, phase 3 injects the result
//! back in the source. The same task type drives the synchronous, the
//! asynchronous (promise-completing) and the ignored (fire-and-forget)
//! variants, plus the promise-bridged synchronous variant used when the
//! target returns a promise the caller must wait out.

use std::sync::Arc;

use islet_engine as engine;
use tokio::sync::oneshot;

use crate::environment::{IsolateEnvironment, IsolateHolder};
use crate::error::{RuntimeError, RuntimeResult};
use crate::executor;
use crate::external_copy::materialize_error;
use crate::scheduler::{RunScope, Runnable};
use crate::transfer::Transferable;

/// A cross-isolate operation decomposed into its target-side and
/// source-side halves.
pub(crate) trait ThreePhase: Send + 'static {
    /// Runs entered into the target isolate.
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()>;

    /// Promise-bridged variant of phase 2: return `Ok(true)` to suspend the
    /// caller until the wait handle fires.
    fn phase2_async(
        &mut self,
        scope: &RunScope<'_>,
        wait: &AsyncWaitHandle,
    ) -> RuntimeResult<bool> {
        let _ = wait;
        self.phase2(scope).map(|()| false)
    }

    /// Runs back in the source isolate; yields the transferable result.
    fn phase3(&mut self, scope: &RunScope<'_>) -> RuntimeResult<Transferable>;
}

/// Wakes a suspended promise-bridged call.
#[derive(Clone)]
pub(crate) struct AsyncWaitHandle {
    env: Arc<IsolateEnvironment>,
}

impl AsyncWaitHandle {
    pub fn wake(&self) {
        self.env.scheduler.wake_async_wait();
    }
}

/// Where an async task reports its completion.
pub(crate) enum Resolver {
    /// Host caller: a future completed with the transferable result.
    Host(oneshot::Sender<RuntimeResult<Transferable>>),
    /// Isolate caller: an engine promise to settle in the source isolate.
    Engine { promise: crate::remote::RemoteHandle },
    /// Fire-and-forget.
    Ignored,
}

/// The source isolate for host-initiated async work: the caller's isolate
/// when inside one, the root otherwise.
pub(crate) fn source_of(target: &Arc<IsolateHolder>) -> Arc<IsolateHolder> {
    if let Some(current) = executor::current_env() {
        if let Some(holder) = current.holder() {
            return holder;
        }
    }
    if let Some(env) = target.get() {
        if let Ok(root) = crate::runtime::root_env(&env.shared) {
            if let Some(holder) = root.holder() {
                return holder;
            }
        }
    }
    Arc::clone(target)
}

fn deadlock_guard() -> RuntimeResult<()> {
    if executor::is_host_thread() {
        Ok(())
    } else {
        Err(RuntimeError::generic(
            "A synchronous call into another isolate is not allowed from inside an isolate",
        ))
    }
}

/// Enter the source isolate (the current one, or the root for plain host
/// threads) and run `f` there.
fn with_source_scope<R>(
    shared: &Arc<crate::environment::RuntimeShared>,
    f: impl FnOnce(&RunScope<'_>) -> RuntimeResult<R>,
) -> RuntimeResult<R> {
    if let Some(current) = executor::current_env() {
        return executor::with_entered_engine(&current, |iso| {
            f(&RunScope {
                env: &current,
                iso,
            })
        })
        .unwrap_or_else(|| Err(RuntimeError::disposed()));
    }
    let root = crate::runtime::root_env(shared)?;
    let lock = executor::Lock::enter(&root)?;
    f(&RunScope {
        env: &root,
        iso: lock.isolate(),
    })
}

/// Synchronous variant: runs phase 2 on the calling thread under the
/// target's lock, then phase 3 back in the source.
pub(crate) fn run_sync<T: ThreePhase>(
    mut task: T,
    target: &Arc<IsolateHolder>,
) -> RuntimeResult<Transferable> {
    let target_env = target.expect()?;

    // Shortcut: a sync call into the currently entered isolate needs no
    // locking and no deadlock guard.
    if let Some(current) = executor::current_env() {
        if Arc::ptr_eq(&current, &target_env) {
            return executor::with_entered_engine(&current, |iso| {
                let scope = RunScope {
                    env: &current,
                    iso,
                };
                task.phase2(&scope)?;
                task.phase3(&scope)
            })
            .unwrap_or_else(|| Err(RuntimeError::disposed()));
        }
    }

    deadlock_guard()?;

    {
        let lock = executor::Lock::enter(&target_env)?;
        let scope = RunScope {
            env: &target_env,
            iso: lock.isolate(),
        };
        task.phase2(&scope)?;
        target_env.task_epilogue(&scope)?;
    }

    with_source_scope(&target_env.shared, |scope| task.phase3(scope))
}

/// Promise-bridged synchronous variant: like [`run_sync`], but phase 2 may
/// suspend until the target settles a promise.
pub(crate) fn run_sync_promise<T: ThreePhase>(
    mut task: T,
    target: &Arc<IsolateHolder>,
) -> RuntimeResult<Transferable> {
    let target_env = target.expect()?;
    deadlock_guard()?;

    target_env.scheduler.begin_async_wait();
    let suspended = {
        let lock = match executor::Lock::enter(&target_env) {
            Ok(lock) => lock,
            Err(e) => {
                target_env.scheduler.end_async_wait();
                return Err(e);
            }
        };
        let scope = RunScope {
            env: &target_env,
            iso: lock.isolate(),
        };
        let wait = AsyncWaitHandle {
            env: Arc::clone(&target_env),
        };
        let result = task
            .phase2_async(&scope, &wait)
            .and_then(|suspended| target_env.task_epilogue(&scope).map(|()| suspended));
        match result {
            Ok(suspended) => suspended,
            Err(e) => {
                target_env.scheduler.end_async_wait();
                return Err(e);
            }
        }
    };
    if suspended {
        target_env.scheduler.async_wait();
    }
    target_env.scheduler.end_async_wait();

    with_source_scope(&target_env.shared, |scope| task.phase3(scope))
}

/// Asynchronous variant: phase 2 is queued into the target's scheduler;
/// phase 3 is queued back into `source` and reports through `resolver`.
pub(crate) fn run_async<T: ThreePhase>(
    task: T,
    target: &Arc<IsolateHolder>,
    source: Arc<IsolateHolder>,
    resolver: Resolver,
) -> RuntimeResult<()> {
    let runner = Phase2Runner {
        task: Some(task),
        source,
        resolver: Some(resolver),
        did_run: false,
    };
    target.schedule_task(Box::new(runner))
}

/// Host-facing async entry: returns a future for the transferable result.
pub(crate) fn run_async_for_host<T: ThreePhase>(
    task: T,
    target: &Arc<IsolateHolder>,
    source: Arc<IsolateHolder>,
) -> ResponseFuture {
    let (tx, rx) = oneshot::channel();
    match run_async(task, target, source, Resolver::Host(tx)) {
        Ok(()) => ResponseFuture { rx },
        Err(e) => {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(e));
            ResponseFuture { rx }
        }
    }
}

/// Future for an asynchronous cross-isolate operation.
pub struct ResponseFuture {
    rx: oneshot::Receiver<RuntimeResult<Transferable>>,
}

impl ResponseFuture {
    pub async fn wait(self) -> RuntimeResult<Transferable> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(RuntimeError::disposed()))
    }

    /// Block the current (host) thread for the result. Must not be called
    /// from inside an async runtime.
    pub fn wait_blocking(self) -> RuntimeResult<Transferable> {
        self.rx
            .blocking_recv()
            .unwrap_or_else(|_| Err(RuntimeError::disposed()))
    }
}

struct Phase2Runner<T: ThreePhase> {
    task: Option<T>,
    source: Arc<IsolateHolder>,
    resolver: Option<Resolver>,
    did_run: bool,
}

impl<T: ThreePhase> Runnable for Phase2Runner<T> {
    fn run(mut self: Box<Self>, scope: &RunScope<'_>) {
        self.did_run = true;
        let Some(mut task) = self.task.take() else {
            return;
        };
        let resolver = match self.resolver.take() {
            Some(resolver) => resolver,
            None => Resolver::Ignored,
        };
        let outcome = task
            .phase2(scope)
            .and_then(|()| scope.env.task_epilogue(scope));
        match outcome {
            Ok(()) => {
                let success = Phase3Success {
                    task,
                    resolver: Some(resolver),
                };
                deliver_phase3(&self.source, Box::new(success));
            }
            Err(error) => {
                let failure = Phase3Failure {
                    error,
                    resolver: Some(resolver),
                };
                deliver_phase3(&self.source, Box::new(failure));
            }
        }
    }
}

impl<T: ThreePhase> Drop for Phase2Runner<T> {
    fn drop(&mut self) {
        if self.did_run {
            return;
        }
        // The task never ran: the target isolate was disposed out from
        // under it. Reject back in the source isolate.
        if let Some(resolver) = self.resolver.take() {
            let failure = Phase3Failure {
                error: RuntimeError::disposed(),
                resolver: Some(resolver),
            };
            deliver_phase3(&self.source, Box::new(failure));
        }
    }
}

/// Schedule a phase-3 task in the source isolate; if the source is gone,
/// complete host resolvers directly (engine resolvers die with the engine).
fn deliver_phase3(source: &Arc<IsolateHolder>, task: Box<dyn Runnable + 'static>) {
    if source.schedule_task(task).is_err() {
        // schedule_task only fails when the source isolate is disposed; the
        // task's Drop settles host resolvers with the disposed error.
    }
}

struct Phase3Success<T: ThreePhase> {
    task: T,
    resolver: Option<Resolver>,
}

impl<T: ThreePhase> Runnable for Phase3Success<T> {
    fn run(mut self: Box<Self>, scope: &RunScope<'_>) {
        let Some(resolver) = self.resolver.take() else {
            return;
        };
        match self.task.phase3(scope) {
            Ok(transferable) => settle(scope, resolver, Ok(transferable)),
            Err(error) => settle(scope, resolver, Err(error)),
        }
    }
}

impl<T: ThreePhase> Drop for Phase3Success<T> {
    fn drop(&mut self) {
        if let Some(Resolver::Host(tx)) = self.resolver.take() {
            let _ = tx.send(Err(RuntimeError::disposed()));
        }
    }
}

struct Phase3Failure {
    error: RuntimeError,
    resolver: Option<Resolver>,
}

impl Runnable for Phase3Failure {
    fn run(mut self: Box<Self>, scope: &RunScope<'_>) {
        let Some(resolver) = self.resolver.take() else {
            return;
        };
        settle(scope, resolver, Err(self.error.clone()));
    }
}

impl Drop for Phase3Failure {
    fn drop(&mut self) {
        if let Some(Resolver::Host(tx)) = self.resolver.take() {
            let _ = tx.send(Err(self.error.clone()));
        }
    }
}

fn settle(scope: &RunScope<'_>, resolver: Resolver, result: RuntimeResult<Transferable>) {
    match resolver {
        Resolver::Ignored => {}
        Resolver::Host(tx) => {
            let _ = tx.send(result);
        }
        Resolver::Engine { promise } => {
            let Ok(promise_value) = promise.deref(scope) else {
                return;
            };
            let Some(promise_obj) = promise_value.as_object().cloned() else {
                return;
            };
            match result {
                Ok(transferable) => match transferable.transfer_in(scope) {
                    Ok(value) => {
                        engine::settle_promise(scope.iso, &promise_obj, true, value);
                    }
                    Err(error) => reject_with(scope, &promise_obj, &error),
                },
                Err(error) => reject_with(scope, &promise_obj, &error),
            }
            let _ = scope.iso.run_microtasks();
        }
    }
}

fn reject_with(scope: &RunScope<'_>, promise: &engine::Object, error: &RuntimeError) {
    let value = error_to_engine_value(scope, error);
    engine::settle_promise(scope.iso, promise, false, value);
}

/// Materialize a runtime error as an engine error value for rejection or
/// rethrow inside an isolate.
pub(crate) fn error_to_engine_value(
    scope: &RunScope<'_>,
    error: &RuntimeError,
) -> engine::Value {
    let build = |kind: engine::ErrorKind, message: &str, stack: Option<&str>| {
        match scope.iso.new_error(kind, message) {
            Ok(obj) => {
                if let Some(stack) = stack {
                    if let Ok(s) = scope.iso.alloc_string(stack) {
                        obj.set_hidden("stack", engine::Value::String(s));
                    }
                }
                engine::Value::Object(obj)
            }
            Err(_) => engine::Value::Undefined,
        }
    };
    match error {
        RuntimeError::Js(copy) => match materialize_error(scope, copy) {
            Ok(obj) => engine::Value::Object(obj),
            Err(_) => engine::Value::Undefined,
        },
        RuntimeError::Generic(d) => build(engine::ErrorKind::Error, &d.message, d.stack.as_deref()),
        RuntimeError::Type(d) => {
            build(engine::ErrorKind::TypeError, &d.message, d.stack.as_deref())
        }
        RuntimeError::Range(d) => {
            build(engine::ErrorKind::RangeError, &d.message, d.stack.as_deref())
        }
        RuntimeError::Fatal(message) => build(engine::ErrorKind::Error, message, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::IsolateOptions;
    use crate::external_copy::ExternalCopy;
    use crate::runtime::Runtime;
    use parking_lot::Mutex;

    struct Noop;

    impl ThreePhase for Noop {
        fn phase2(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<()> {
            Ok(())
        }

        fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
            Ok(Transferable::copy(ExternalCopy::undefined()))
        }
    }

    /// Runs a closure as phase 2 inside a target isolate.
    struct Probe<F: FnMut(&RunScope<'_>) -> RuntimeResult<()> + Send + 'static> {
        f: F,
    }

    impl<F: FnMut(&RunScope<'_>) -> RuntimeResult<()> + Send + 'static> ThreePhase for Probe<F> {
        fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
            (self.f)(scope)
        }

        fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
            Ok(Transferable::copy(ExternalCopy::undefined()))
        }
    }

    #[test]
    fn sync_entry_from_inside_an_isolate_is_refused() {
        let runtime = Runtime::new().unwrap();
        let first = runtime.create_isolate(IsolateOptions::default()).unwrap();
        let second = runtime.create_isolate(IsolateOptions::default()).unwrap();
        let second_holder = Arc::clone(second.holder());

        let observed: Arc<Mutex<Option<RuntimeError>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let probe = Probe {
            f: move |_scope: &RunScope<'_>| {
                // We are entered into `first`; a sync hop into `second`
                // must be refused to prevent lock cycles.
                let result = run_sync(Noop, &second_holder);
                *sink.lock() = result.err();
                Ok(())
            },
        };
        run_sync(probe, first.holder()).unwrap();

        let error = observed.lock().take().expect("nested call should error");
        assert!(
            error.message().contains("not allowed from inside an isolate"),
            "unexpected: {}",
            error
        );
        runtime.dispose();
    }

    #[test]
    fn isolate_cannot_dispose_itself() {
        let runtime = Runtime::new().unwrap();
        let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();

        let observed: Arc<Mutex<Option<RuntimeError>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let probe = Probe {
            f: move |scope: &RunScope<'_>| {
                if let Some(holder) = scope.env.holder() {
                    *sink.lock() = holder.dispose().err();
                }
                Ok(())
            },
        };
        run_sync(probe, isolate.holder()).unwrap();

        let error = observed.lock().take().expect("self-dispose should error");
        assert!(
            error.message().contains("within itself"),
            "unexpected: {}",
            error
        );
        assert!(!isolate.is_disposed());
        runtime.dispose();
    }

    #[test]
    fn orphaned_async_task_rejects_with_disposed() {
        let runtime = Runtime::new().unwrap();
        let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
        let holder = Arc::clone(isolate.holder());
        isolate.dispose().unwrap();
        let future = run_async_for_host(Noop, &holder, source_of(&holder));
        let err = future.wait_blocking().unwrap_err();
        assert_eq!(err.message(), "Isolate is disposed");
        runtime.dispose();
    }
}
