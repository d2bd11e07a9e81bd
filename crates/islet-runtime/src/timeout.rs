//! Timeout supervision for engine execution.
//!
//! A timer fires an interrupt that captures the runaway stack and requests
//! engine termination; `terminate_depth` tracks nesting so the sticky
//! terminate state is cancelled exactly when the outermost supervised call
//! unwinds. Memory-limit breaches and disposal-driven termination outrank a
//! plain timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use islet_engine as engine;
use parking_lot::Mutex;

use crate::error::{ErrorDetail, RuntimeError, RuntimeResult};
use crate::external_copy::runtime_error_from_engine;
use crate::scheduler::RunScope;
use crate::timer::Timer;

struct TimeoutState {
    did_timeout: AtomicBool,
    stack: Mutex<Option<String>>,
}

/// Run `f` against the entered isolate, terminating it after `timeout_ms`
/// milliseconds (0 disables the timeout).
pub(crate) fn run_with_timeout<F>(
    scope: &RunScope<'_>,
    timeout_ms: u64,
    f: F,
) -> RuntimeResult<engine::Value>
where
    F: FnOnce() -> engine::Completion<engine::Value>,
{
    let env = scope.env;
    let state = Arc::new(TimeoutState {
        did_timeout: AtomicBool::new(false),
        stack: Mutex::new(None),
    });

    let timer = if timeout_ms != 0 {
        let timer_env = Arc::clone(env);
        let timer_state = Arc::clone(&state);
        Some(Timer::new(
            Duration::from_millis(timeout_ms),
            Some(&env.timer_holder),
            move || {
                timer_state.did_timeout.store(true, Ordering::Release);
                timer_env.terminate_depth.fetch_add(1, Ordering::AcqRel);
                // Grab the offending stack at a safe point, then pull the
                // plug. The interrupt keeps its logic trivial.
                let stack_state = Arc::clone(&timer_state);
                timer_env.schedule_interrupt(Box::new(move |scope: &RunScope<'_>| {
                    *stack_state.stack.lock() = Some(scope.iso.capture_stack());
                    scope.iso.handle().terminate_execution();
                }));
                timer_env.engine_handle.terminate_execution();
                timer_env.scheduler.cancel_async();
            },
        ))
    } else {
        None
    };

    let result = f();
    // Cancels, waiting out a mid-flight callback; then discard any interrupt
    // the timer enqueued but execution never serviced.
    drop(timer);
    if state.did_timeout.load(Ordering::Acquire) {
        drop(env.scheduler.take_interrupts());
        drop(env.scheduler.take_sync_interrupts());
    }

    if env.hit_memory_limit.load(Ordering::Acquire) {
        env.fail_catastrophically();
        return Err(RuntimeError::fatal(
            "Isolate was disposed during execution due to memory limit",
        ));
    }
    if env.terminated.load(Ordering::Acquire) {
        return Err(RuntimeError::fatal("Isolate was disposed during execution"));
    }
    if state.did_timeout.load(Ordering::Acquire) {
        if env.terminate_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            env.engine_handle.cancel_terminate();
        }
        return Err(RuntimeError::Generic(ErrorDetail {
            message: "Script execution timed out.".to_string(),
            stack: state.stack.lock().take(),
        }));
    }
    result.map_err(|e| runtime_error_from_engine(scope, e))
}
