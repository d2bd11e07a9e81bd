//! Executor: tracks which isolate the current thread is inside, and owns the
//! engine-lock discipline plus CPU/wall time accounting.
//!
//! Each thread keeps a stack of entered environments; a [`Lock`] holds the
//! engine mutex, making engine values safe to touch. Both CPU and wall time
//! accumulate per isolate. The CPU timer stops while a thread blocks
//! acquiring another isolate's engine lock, and a nested entry pauses only
//! the outer isolate's CPU timer — never its wall clock — so an isolate's
//! CPU time is strictly its own while its wall time spans everything that
//! happened while it was entered.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use crate::environment::IsolateEnvironment;
use crate::error::{RuntimeError, RuntimeResult};

struct CpuState {
    env: Arc<IsolateEnvironment>,
    started: Option<Instant>,
    accumulated: Duration,
}

impl CpuState {
    fn pause(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    fn resume(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }
}

struct ExecutorEntry {
    env: Arc<IsolateEnvironment>,
    /// Set while a `Lock` is active: the engine is exclusively ours. Only
    /// dereferenced by this thread while the entry is on the stack.
    engine: Option<*const islet_engine::Isolate>,
}

thread_local! {
    static STACK: RefCell<Vec<ExecutorEntry>> = const { RefCell::new(Vec::new()) };
    static CPU_STACK: RefCell<Vec<Rc<RefCell<CpuState>>>> = const { RefCell::new(Vec::new()) };
}

/// The environment the current thread is inside, if any.
pub(crate) fn current_env() -> Option<Arc<IsolateEnvironment>> {
    STACK.with(|stack| stack.borrow().last().map(|e| Arc::clone(&e.env)))
}

/// Whether the current thread is anywhere inside `env` (nested scopes count).
pub(crate) fn is_inside(env: &IsolateEnvironment) -> bool {
    STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .any(|e| std::ptr::eq(Arc::as_ptr(&e.env), env))
    })
}

/// Whether the current thread currently holds `env`'s engine lock.
pub(crate) fn holds_engine_lock(env: &IsolateEnvironment) -> bool {
    STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .any(|e| std::ptr::eq(Arc::as_ptr(&e.env), env) && e.engine.is_some())
    })
}

/// Synchronous cross-isolate entries are only allowed from host threads
/// (threads not currently executing inside a non-root isolate); anything
/// else risks a lock cycle between isolates.
pub(crate) fn is_host_thread() -> bool {
    STACK.with(|stack| {
        stack
            .borrow()
            .last()
            .map(|e| e.env.is_root())
            .unwrap_or(true)
    })
}

/// Run `f` against `env`'s engine if this thread holds its lock somewhere up
/// the stack. Used by remote-handle disposal to reset inline.
pub(crate) fn with_entered_engine<R>(
    env: &IsolateEnvironment,
    f: impl FnOnce(&islet_engine::Isolate) -> R,
) -> Option<R> {
    STACK.with(|stack| {
        let stack = stack.borrow();
        let entry = stack
            .iter()
            .find(|e| std::ptr::eq(Arc::as_ptr(&e.env), env))?;
        let engine = entry.engine?;
        // SAFETY: `engine` was stored by a `Lock` on this same thread which
        // is still alive (it is below us on the stack), so the engine mutex
        // is held and the pointer is valid for the duration of `f`.
        Some(f(unsafe { &*engine }))
    })
}

/// Full executor lock: scope + engine mutex + timers. While this exists the
/// thread may freely use engine values belonging to `env`.
pub(crate) struct Lock<'a> {
    env: &'a Arc<IsolateEnvironment>,
    guard: MutexGuard<'a, Option<islet_engine::Isolate>>,
    cpu: Rc<RefCell<CpuState>>,
    wall_start: Instant,
}

impl<'a> Lock<'a> {
    pub fn enter(env: &'a Arc<IsolateEnvironment>) -> RuntimeResult<Lock<'a>> {
        if holds_engine_lock(env) {
            return Err(RuntimeError::generic(
                "Isolate is already entered on this thread",
            ));
        }

        // Time spent blocked on the engine lock is nobody's CPU time.
        let outer = CPU_STACK.with(|stack| stack.borrow().last().cloned());
        if let Some(outer) = &outer {
            outer.borrow_mut().pause();
        }
        let wall_start = Instant::now();

        let guard = env.engine_mutex().lock();
        if guard.is_none() {
            if let Some(outer) = &outer {
                outer.borrow_mut().resume();
            }
            return Err(RuntimeError::disposed());
        }

        if let Err(e) = env.claim_thread() {
            drop(guard);
            if let Some(outer) = &outer {
                outer.borrow_mut().resume();
            }
            return Err(e);
        }

        let cpu = Rc::new(RefCell::new(CpuState {
            env: Arc::clone(env),
            started: Some(Instant::now()),
            accumulated: Duration::ZERO,
        }));
        CPU_STACK.with(|stack| stack.borrow_mut().push(Rc::clone(&cpu)));

        let engine_ptr: *const islet_engine::Isolate = match guard.as_ref() {
            Some(engine) => engine,
            None => unreachable!("engine checked above while holding the lock"),
        };
        STACK.with(|stack| {
            stack.borrow_mut().push(ExecutorEntry {
                env: Arc::clone(env),
                engine: Some(engine_ptr),
            })
        });

        Ok(Lock {
            env,
            guard,
            cpu,
            wall_start,
        })
    }

    pub fn isolate(&self) -> &islet_engine::Isolate {
        match self.guard.as_ref() {
            Some(engine) => engine,
            None => unreachable!("engine cannot be disposed while its lock is held"),
        }
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        self.env.release_thread();
        STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
        CPU_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
        {
            let mut cpu = self.cpu.borrow_mut();
            cpu.pause();
            cpu.env.accumulate_cpu(cpu.accumulated);
        }
        if let Some(outer) = CPU_STACK.with(|stack| stack.borrow().last().cloned()) {
            outer.borrow_mut().resume();
        }
        self.env.accumulate_wall(self.wall_start.elapsed());
    }
}
