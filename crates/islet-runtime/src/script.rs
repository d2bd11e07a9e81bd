//! Compiled-script handles: run an unbound script in a chosen context under
//! a timeout, transferring the completion value back.

use std::sync::Arc;

use islet_engine as engine;

use crate::environment::IsolateHolder;
use crate::error::{RuntimeError, RuntimeResult};
use crate::external_copy::runtime_error_from_engine;
use crate::remote::RemoteHandle;
use crate::runtime::ContextRef;
use crate::scheduler::RunScope;
use crate::three_phase::{self, ResponseFuture, ThreePhase};
use crate::timeout::run_with_timeout;
use crate::transfer::{transfer_out, Transferable, TransferOptions, TransferType};

/// Options for [`Script::run`].
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Milliseconds before execution is terminated; 0 disables.
    pub timeout: u64,
    /// How the completion value travels back. Defaults to copying.
    pub result: TransferOptions,
}

/// A compiled, unbound script owned by an isolate.
pub struct Script {
    isolate: Arc<IsolateHolder>,
    unbound: RemoteHandle,
}

impl Script {
    pub(crate) fn new(isolate: Arc<IsolateHolder>, unbound: RemoteHandle) -> Script {
        Script { isolate, unbound }
    }

    /// Bind to `context` and run asynchronously.
    pub fn run(&self, context: &ContextRef, options: RunOptions) -> ResponseFuture {
        let task = self.run_task(context, options);
        three_phase::run_async_for_host(task, &self.isolate, three_phase::source_of(&self.isolate))
    }

    /// Bind to `context` and run on the calling thread.
    pub fn run_sync(&self, context: &ContextRef, options: RunOptions) -> RuntimeResult<Transferable> {
        three_phase::run_sync(self.run_task(context, options), &self.isolate)
    }

    fn run_task(&self, context: &ContextRef, options: RunOptions) -> RunRunner {
        RunRunner {
            unbound: self.unbound.clone(),
            context: context.global_handle().clone(),
            timeout: options.timeout,
            result_options: options.result,
            result: None,
        }
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Script")
    }
}

struct RunRunner {
    unbound: RemoteHandle,
    context: RemoteHandle,
    timeout: u64,
    result_options: TransferOptions,
    result: Option<Transferable>,
}

impl ThreePhase for RunRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let script = self.unbound.deref(scope)?;
        let Some(script_obj) = script.as_object().cloned() else {
            return Err(RuntimeError::type_error("Script has been released"));
        };
        let global = self.context.deref(scope)?;
        let Some(global_obj) = global.as_object().cloned() else {
            return Err(RuntimeError::type_error("Context has been released"));
        };
        let context = engine::Context::from_global(global_obj);
        let value = run_with_timeout(scope, self.timeout, || {
            scope.iso.run_script(&script_obj, &context)
        })?;
        let options = TransferOptions {
            transfer: self.result_options.transfer,
            fallback: self.result_options.fallback.or(Some(TransferType::Copy)),
            promise: self.result_options.promise,
        };
        self.result = Some(transfer_out(scope, &value, options)?);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        self.result
            .take()
            .ok_or_else(|| RuntimeError::generic("script produced no result"))
    }
}

/// Compile source text into a [`Script`] owned by `isolate`.
pub(crate) fn compile(
    isolate: &Arc<IsolateHolder>,
    code: &str,
    filename: &str,
) -> RuntimeResult<Script> {
    let slot: Arc<parking_lot::Mutex<Option<RemoteHandle>>> = Arc::new(parking_lot::Mutex::new(None));
    let task = CompileRunner {
        code: code.to_string(),
        filename: filename.to_string(),
        slot: Arc::clone(&slot),
    };
    three_phase::run_sync(task, isolate)?;
    let unbound = slot
        .lock()
        .take()
        .ok_or_else(|| RuntimeError::generic("compilation produced no script"))?;
    Ok(Script::new(Arc::clone(isolate), unbound))
}

struct CompileRunner {
    code: String,
    filename: String,
    slot: Arc<parking_lot::Mutex<Option<RemoteHandle>>>,
}

impl ThreePhase for CompileRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let script = scope
            .iso
            .compile(&self.code, &self.filename)
            .map_err(|e| runtime_error_from_engine(scope, e))?;
        let handle = RemoteHandle::new(scope, &engine::Value::Object(script))?;
        *self.slot.lock() = Some(handle);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::copy(crate::external_copy::ExternalCopy::undefined()))
    }
}
