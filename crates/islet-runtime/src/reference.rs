//! Reference handles: userland operations over a value owned by another
//! isolate — `get`, `set`, `delete`, `apply`, `copy` and their sync /
//! ignored / promise-bridged variants. Every operation is a three-phase
//! task into the owning isolate.

use std::sync::Arc;

use islet_engine as engine;
use parking_lot::Mutex;

use crate::environment::IsolateHolder;
use crate::error::{RuntimeError, RuntimeResult};
use crate::external_copy::{runtime_error_from_engine, ExternalCopy};
use crate::remote::RemoteHandle;
use crate::scheduler::RunScope;
use crate::three_phase::{self, source_of, AsyncWaitHandle, ResponseFuture, Resolver, ThreePhase};
use crate::timeout::run_with_timeout;
use crate::transfer::{transfer_out, Transferable, TransferOptions, TransferType};

/// The `typeof` tag captured when the reference was created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeTag {
    Null,
    Undefined,
    Number,
    String,
    Boolean,
    Object,
    Function,
}

impl TypeTag {
    pub fn as_str(self) -> &'static str {
        match self {
            TypeTag::Null => "null",
            TypeTag::Undefined => "undefined",
            TypeTag::Number => "number",
            TypeTag::String => "string",
            TypeTag::Boolean => "boolean",
            TypeTag::Object => "object",
            TypeTag::Function => "function",
        }
    }

    fn infer(value: &engine::Value) -> TypeTag {
        match value {
            engine::Value::Null => TypeTag::Null,
            engine::Value::Undefined => TypeTag::Undefined,
            engine::Value::Number(_) | engine::Value::BigInt(_) => TypeTag::Number,
            engine::Value::String(_) => TypeTag::String,
            engine::Value::Bool(_) => TypeTag::Boolean,
            engine::Value::Object(o) => {
                if o.is_function() {
                    TypeTag::Function
                } else {
                    TypeTag::Object
                }
            }
        }
    }
}

/// Options for property access through a reference.
#[derive(Clone, Copy, Debug, Default)]
pub struct AccessOptions {
    /// Invoke getters/setters instead of reading data slots.
    pub accessors: bool,
    /// Walk the prototype chain.
    pub inherit: bool,
}

/// Options for `apply` and friends.
#[derive(Debug, Default)]
pub struct ApplyOptions {
    /// Milliseconds before the call is terminated; 0 disables.
    pub timeout: u64,
    /// How the return value travels back.
    pub result: TransferOptions,
}

pub(crate) struct ReferenceState {
    isolate: Arc<IsolateHolder>,
    handle: Mutex<Option<RemoteHandle>>,
    type_of: TypeTag,
    accessors: bool,
    inherit: bool,
}

/// A handle to a value living in another isolate.
#[derive(Clone)]
pub struct Reference {
    state: Arc<ReferenceState>,
}

impl Reference {
    /// Capture a reference to a local value of the entered isolate. The
    /// `accessors` and `inherit` flags become the reference's defaults for
    /// property access.
    pub(crate) fn from_value(
        scope: &RunScope<'_>,
        value: &engine::Value,
        accessors: bool,
        inherit: bool,
    ) -> RuntimeResult<Reference> {
        let holder = scope.env.holder().ok_or_else(RuntimeError::disposed)?;
        let handle = RemoteHandle::new(scope, value)?;
        Ok(Reference {
            state: Arc::new(ReferenceState {
                isolate: holder,
                handle: Mutex::new(Some(handle)),
                type_of: TypeTag::infer(value),
                accessors,
                inherit,
            }),
        })
    }

    /// The cached type tag from creation time.
    pub fn type_of(&self) -> TypeTag {
        self.state.type_of
    }

    fn live_handle(&self) -> RuntimeResult<RemoteHandle> {
        self.state
            .handle
            .lock()
            .clone()
            .ok_or_else(|| RuntimeError::generic("Reference has been released"))
    }

    /// Release the reference. A second release fails.
    pub fn release(&self) -> RuntimeResult<()> {
        self.state
            .handle
            .lock()
            .take()
            .map(|_| ())
            .ok_or_else(|| RuntimeError::generic("Reference has been released"))
    }

    /// A one-shot transferable that dereferences when it reaches the owning
    /// isolate.
    pub fn deref_into(&self) -> RuntimeResult<Transferable> {
        let handle = self.live_handle()?;
        Ok(Transferable::Dereference(DereferenceState::from_handle(
            Arc::clone(&self.state.isolate),
            handle,
        )))
    }

    /// Materialize the referenced value inside its own isolate.
    pub(crate) fn deref_in(&self, scope: &RunScope<'_>) -> RuntimeResult<engine::Value> {
        self.live_handle()?.deref(scope)
    }

    // ---- copy ----

    /// Copy the referenced value out, structured-clone style. With
    /// `transfer_out`, array buffers move instead of copying, detaching the
    /// source.
    pub fn copy(&self, transfer_out: bool) -> ResponseFuture {
        let task = CopyRunner {
            reference: self.clone(),
            transfer_out,
            result: None,
        };
        three_phase::run_async_for_host(task, &self.state.isolate, source_of(&self.state.isolate))
    }

    pub fn copy_sync(&self, transfer_out: bool) -> RuntimeResult<ExternalCopy> {
        let task = CopyRunner {
            reference: self.clone(),
            transfer_out,
            result: None,
        };
        let transferable = three_phase::run_sync(task, &self.state.isolate)?;
        copy_result(transferable)
    }

    // ---- get / set / delete ----

    pub fn get(&self, key: &str, options: AccessOptions) -> ResponseFuture {
        let task = self.get_task(key, options);
        three_phase::run_async_for_host(task, &self.state.isolate, source_of(&self.state.isolate))
    }

    pub fn get_sync(&self, key: &str, options: AccessOptions) -> RuntimeResult<Transferable> {
        three_phase::run_sync(self.get_task(key, options), &self.state.isolate)
    }

    fn get_task(&self, key: &str, options: AccessOptions) -> GetRunner {
        GetRunner {
            reference: self.clone(),
            key: key.to_string(),
            accessors: options.accessors || self.state.accessors,
            inherit: options.inherit || self.state.inherit,
            result: None,
        }
    }

    pub fn set(&self, key: &str, value: Transferable, options: AccessOptions) -> ResponseFuture {
        let task = self.set_task(key, value, options);
        three_phase::run_async_for_host(task, &self.state.isolate, source_of(&self.state.isolate))
    }

    pub fn set_sync(
        &self,
        key: &str,
        value: Transferable,
        options: AccessOptions,
    ) -> RuntimeResult<bool> {
        let result = three_phase::run_sync(self.set_task(key, value, options), &self.state.isolate)?;
        Ok(bool_result(&result))
    }

    /// Fire-and-forget set.
    pub fn set_ignored(&self, key: &str, value: Transferable, options: AccessOptions) {
        let task = self.set_task(key, value, options);
        let _ = three_phase::run_async(
            task,
            &self.state.isolate,
            source_of(&self.state.isolate),
            Resolver::Ignored,
        );
    }

    fn set_task(&self, key: &str, value: Transferable, options: AccessOptions) -> SetRunner {
        SetRunner {
            reference: self.clone(),
            key: key.to_string(),
            value: Some(value),
            accessors: options.accessors || self.state.accessors,
        }
    }

    pub fn delete(&self, key: &str) -> ResponseFuture {
        let task = DeleteRunner {
            reference: self.clone(),
            key: key.to_string(),
        };
        three_phase::run_async_for_host(task, &self.state.isolate, source_of(&self.state.isolate))
    }

    pub fn delete_sync(&self, key: &str) -> RuntimeResult<bool> {
        let task = DeleteRunner {
            reference: self.clone(),
            key: key.to_string(),
        };
        let result = three_phase::run_sync(task, &self.state.isolate)?;
        Ok(bool_result(&result))
    }

    pub fn delete_ignored(&self, key: &str) {
        let task = DeleteRunner {
            reference: self.clone(),
            key: key.to_string(),
        };
        let _ = three_phase::run_async(
            task,
            &self.state.isolate,
            source_of(&self.state.isolate),
            Resolver::Ignored,
        );
    }

    // ---- apply ----

    pub fn apply(
        &self,
        recv: Option<Transferable>,
        args: Vec<Transferable>,
        options: ApplyOptions,
    ) -> ResponseFuture {
        let task = self.apply_task(recv, args, options);
        three_phase::run_async_for_host(task, &self.state.isolate, source_of(&self.state.isolate))
    }

    pub fn apply_sync(
        &self,
        recv: Option<Transferable>,
        args: Vec<Transferable>,
        options: ApplyOptions,
    ) -> RuntimeResult<Transferable> {
        three_phase::run_sync(self.apply_task(recv, args, options), &self.state.isolate)
    }

    /// Discard the result entirely.
    pub fn apply_ignored(
        &self,
        recv: Option<Transferable>,
        args: Vec<Transferable>,
        options: ApplyOptions,
    ) {
        let task = self.apply_task(recv, args, options);
        let _ = three_phase::run_async(
            task,
            &self.state.isolate,
            source_of(&self.state.isolate),
            Resolver::Ignored,
        );
    }

    /// Synchronous apply that bridges a returned promise: blocks until the
    /// promise settles in the target isolate.
    pub fn apply_sync_promise(
        &self,
        recv: Option<Transferable>,
        args: Vec<Transferable>,
        options: ApplyOptions,
    ) -> RuntimeResult<Transferable> {
        if options.result.transfer.is_some() || options.result.promise {
            return Err(RuntimeError::type_error(
                "`result` options are not available for `applySyncPromise`",
            ));
        }
        let task = self.apply_task(recv, args, options);
        three_phase::run_sync_promise(task, &self.state.isolate)
    }

    fn apply_task(
        &self,
        recv: Option<Transferable>,
        args: Vec<Transferable>,
        options: ApplyOptions,
    ) -> ApplyRunner {
        ApplyRunner {
            reference: self.clone(),
            recv,
            args: Some(args),
            timeout: options.timeout,
            return_options: options.result,
            result: None,
            bridge: None,
        }
    }
}

impl std::fmt::Debug for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reference({})", self.state.type_of.as_str())
    }
}

fn bool_result(t: &Transferable) -> bool {
    t.as_copy().and_then(ExternalCopy::as_bool).unwrap_or(false)
}

fn copy_result(t: Transferable) -> RuntimeResult<ExternalCopy> {
    match t {
        Transferable::Copy(c) | Transferable::ExternalCopyHandle(c) => {
            Arc::try_unwrap(c).map_err(|_| RuntimeError::generic("copy is shared"))
        }
        _ => Err(RuntimeError::type_error("expected a copied value")),
    }
}

/// Walk the receiver and its prototype chain; any proxy along the way makes
/// the traversal unsafe from another isolate.
fn check_for_proxies(obj: &engine::Object) -> RuntimeResult<()> {
    let mut cursor = Some(obj.clone());
    while let Some(current) = cursor {
        if current.is_proxy() {
            return Err(RuntimeError::type_error(
                "Object is or has inherited from a Proxy and cannot be accessed remotely",
            ));
        }
        cursor = current.prototype();
    }
    Ok(())
}

/// Data-only property read: own slots, optionally up the prototype chain,
/// never invoking getters.
fn read_data_property(obj: &engine::Object, key: &str, inherit: bool) -> engine::Value {
    let mut cursor = Some(obj.clone());
    while let Some(current) = cursor {
        match current.get_own(key) {
            Some(engine::Property::Data { value, .. }) => return value,
            Some(engine::Property::Accessor { .. }) => return engine::Value::Undefined,
            None => {}
        }
        if !inherit {
            break;
        }
        cursor = current.prototype();
    }
    engine::Value::Undefined
}

// ---- Task runners ----

struct CopyRunner {
    reference: Reference,
    transfer_out: bool,
    result: Option<Transferable>,
}

impl ThreePhase for CopyRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let value = self.reference.deref_in(scope)?;
        let copy = ExternalCopy::copy(scope, &value, self.transfer_out, &[])?;
        self.result = Some(Transferable::Copy(Arc::new(copy)));
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        self.result
            .take()
            .ok_or_else(|| RuntimeError::generic("copy produced no result"))
    }
}

struct GetRunner {
    reference: Reference,
    key: String,
    accessors: bool,
    inherit: bool,
    result: Option<Transferable>,
}

impl ThreePhase for GetRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let value = self.reference.deref_in(scope)?;
        let Some(obj) = value.as_object() else {
            return Err(RuntimeError::type_error("Reference is not an object"));
        };
        check_for_proxies(obj)?;
        let found = if self.accessors {
            engine::get_member(scope.iso, &value, &self.key)
                .map_err(|e| runtime_error_from_engine(scope, e))?
        } else {
            read_data_property(obj, &self.key, self.inherit)
        };
        let options = TransferOptions {
            transfer: None,
            fallback: Some(TransferType::Reference),
            promise: false,
        };
        self.result = Some(transfer_out(scope, &found, options)?);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        self.result
            .take()
            .ok_or_else(|| RuntimeError::generic("get produced no result"))
    }
}

struct SetRunner {
    reference: Reference,
    key: String,
    value: Option<Transferable>,
    accessors: bool,
}

impl ThreePhase for SetRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let target = self.reference.deref_in(scope)?;
        let Some(obj) = target.as_object() else {
            return Err(RuntimeError::type_error("Reference is not an object"));
        };
        check_for_proxies(obj)?;
        let value = self
            .value
            .take()
            .ok_or_else(|| RuntimeError::generic("set value already consumed"))?
            .transfer_in(scope)?;
        if self.accessors {
            engine::set_member(scope.iso, &target, &self.key, value)
                .map_err(|e| runtime_error_from_engine(scope, e))?;
        } else {
            obj.set_data(&self.key, value);
        }
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::Copy(Arc::new(ExternalCopy::boolean(true))))
    }
}

struct DeleteRunner {
    reference: Reference,
    key: String,
}

impl ThreePhase for DeleteRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let target = self.reference.deref_in(scope)?;
        let Some(obj) = target.as_object() else {
            return Err(RuntimeError::type_error("Reference is not an object"));
        };
        check_for_proxies(obj)?;
        obj.delete(&self.key);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::Copy(Arc::new(ExternalCopy::boolean(true))))
    }
}

struct SyncPromiseSlot {
    finished: bool,
    outcome: Option<RuntimeResult<Transferable>>,
}

struct ApplyRunner {
    reference: Reference,
    recv: Option<Transferable>,
    args: Option<Vec<Transferable>>,
    timeout: u64,
    return_options: TransferOptions,
    result: Option<Transferable>,
    bridge: Option<Arc<Mutex<SyncPromiseSlot>>>,
}

impl ApplyRunner {
    fn invoke(&mut self, scope: &RunScope<'_>) -> RuntimeResult<engine::Value> {
        let function = self.reference.deref_in(scope)?;
        if !function.is_function() {
            return Err(RuntimeError::type_error("Reference is not a function"));
        }
        let recv = match self.recv.take() {
            Some(t) => t.transfer_in(scope)?,
            None => engine::Value::Undefined,
        };
        let args = self.args.take().unwrap_or_default();
        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            values.push(arg.transfer_in(scope)?);
        }
        run_with_timeout(scope, self.timeout, || {
            scope.iso.call(&function, &recv, &values)
        })
    }

    fn return_options(&self) -> TransferOptions {
        TransferOptions {
            transfer: self.return_options.transfer,
            fallback: self
                .return_options
                .fallback
                .or(Some(TransferType::Reference)),
            promise: self.return_options.promise,
        }
    }
}

impl ThreePhase for ApplyRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let result = self.invoke(scope)?;
        self.result = Some(transfer_out(scope, &result, self.return_options())?);
        Ok(())
    }

    fn phase2_async(
        &mut self,
        scope: &RunScope<'_>,
        wait: &AsyncWaitHandle,
    ) -> RuntimeResult<bool> {
        let result = self.invoke(scope)?;
        let Some(promise) = result.as_object().filter(|_| result.is_promise()).cloned() else {
            self.result = Some(transfer_out(scope, &result, self.return_options())?);
            return Ok(false);
        };

        let slot = Arc::new(Mutex::new(SyncPromiseSlot {
            finished: false,
            outcome: None,
        }));
        self.bridge = Some(Arc::clone(&slot));
        let make_handler = |fulfilled: bool| {
            let slot = Arc::clone(&slot);
            let wait = wait.clone();
            let env = Arc::clone(scope.env);
            scope.iso.new_native_function("", 1, move |iso, _this, args| {
                let scope = RunScope { env: &env, iso };
                let mut slot = slot.lock();
                if slot.finished {
                    // The call already timed out; the settlement is moot.
                    return Ok(engine::Value::Undefined);
                }
                slot.finished = true;
                let settlement = args.first().cloned().unwrap_or_default();
                let outcome = if fulfilled {
                    transfer_out(&scope, &settlement, TransferOptions::default())
                } else {
                    Err(rejection_error(&scope, &settlement))
                };
                slot.outcome = Some(outcome);
                drop(slot);
                wait.wake();
                Ok(engine::Value::Undefined)
            })
        };
        let on_fulfilled = make_handler(true)
            .map_err(|e| runtime_error_from_engine(scope, e))?;
        let on_rejected = make_handler(false)
            .map_err(|e| runtime_error_from_engine(scope, e))?;
        engine::promise_then(scope.iso, &promise, Some(on_fulfilled), Some(on_rejected))
            .map_err(|e| runtime_error_from_engine(scope, e))?;
        Ok(true)
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        if let Some(bridge) = self.bridge.take() {
            let mut slot = bridge.lock();
            if !slot.finished {
                // Timeout preempted the settlement; make sure a late
                // settlement is dropped on the floor.
                slot.finished = true;
                return Err(RuntimeError::generic("Script execution timed out."));
            }
            return slot
                .outcome
                .take()
                .unwrap_or_else(|| Err(RuntimeError::generic("Script execution timed out.")));
        }
        self.result
            .take()
            .ok_or_else(|| RuntimeError::generic("apply produced no result"))
    }
}

/// A rejected bridged promise surfaces as the copied rejection value.
fn rejection_error(scope: &RunScope<'_>, settlement: &engine::Value) -> RuntimeError {
    RuntimeError::Js(crate::external_copy::copy_thrown_value(scope, settlement))
}

// ---- Dereference ----

struct DerefData {
    isolate: Arc<IsolateHolder>,
    reference: RemoteHandle,
}

/// The payload of `derefInto()`: a one-shot transferable that resolves to
/// the raw value once it reaches the isolate that owns it.
#[derive(Clone)]
pub struct DereferenceState {
    inner: Arc<Mutex<Option<DerefData>>>,
}

impl DereferenceState {
    pub(crate) fn new(scope: &RunScope<'_>, value: &engine::Value) -> RuntimeResult<DereferenceState> {
        let holder = scope.env.holder().ok_or_else(RuntimeError::disposed)?;
        let handle = RemoteHandle::new(scope, value)?;
        Ok(DereferenceState::from_handle(holder, handle))
    }

    pub(crate) fn from_handle(
        isolate: Arc<IsolateHolder>,
        reference: RemoteHandle,
    ) -> DereferenceState {
        DereferenceState {
            inner: Arc::new(Mutex::new(Some(DerefData { isolate, reference }))),
        }
    }

    pub(crate) fn ensure_live(&self) -> RuntimeResult<()> {
        if self.inner.lock().is_some() {
            Ok(())
        } else {
            Err(RuntimeError::generic(
                "The return value of `derefInto()` should only be used once",
            ))
        }
    }

    pub(crate) fn transfer_in(&self, scope: &RunScope<'_>) -> RuntimeResult<engine::Value> {
        let data = self.inner.lock().take().ok_or_else(|| {
            RuntimeError::generic("The return value of `derefInto()` should only be used once")
        })?;
        let current = scope.env.holder().ok_or_else(RuntimeError::disposed)?;
        if !Arc::ptr_eq(&data.isolate, &current) {
            return Err(RuntimeError::type_error(
                "Cannot dereference this into the target isolate",
            ));
        }
        data.reference.deref(scope)
    }
}
