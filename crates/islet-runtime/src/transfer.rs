//! The transfer layer: how a JS value crosses an isolate boundary.
//!
//! `transfer_out` resolves a value to one [`Transferable`] — an external
//! copy, a reference, a self-dereferencing handle, a wrapped callback, or a
//! promise bridge — and `transfer_in` materializes it in the destination.
//! The round trip either succeeds or raises a typed error; it never smuggles
//! a raw engine value between isolates.

use std::sync::Arc;

use islet_engine as engine;
use parking_lot::Mutex;

use crate::environment::IsolateHolder;
use crate::error::{RuntimeError, RuntimeResult};
use crate::external_copy::ExternalCopy;
use crate::reference::{DereferenceState, Reference};
use crate::remote::RemoteHandle;
use crate::scheduler::RunScope;
use crate::three_phase::{self, Resolver, ThreePhase};

/// Explicit transfer strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    /// Materialize a copy directly in the destination.
    Copy,
    /// Produce an external-copy handle the destination can materialize later.
    ExternalCopy,
    /// A reference back into the owning isolate.
    Reference,
    /// A handle that dereferences itself when it reaches its owning isolate.
    DeepReference,
}

/// How a value should be transferred. `promise` wraps the result in a
/// promise on the destination side; the inner transfer then uses the same
/// options without the promise flag.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransferOptions {
    pub transfer: Option<TransferType>,
    pub fallback: Option<TransferType>,
    pub promise: bool,
}

impl TransferOptions {
    pub fn copy() -> TransferOptions {
        TransferOptions {
            transfer: Some(TransferType::Copy),
            fallback: None,
            promise: false,
        }
    }

    pub fn reference() -> TransferOptions {
        TransferOptions {
            transfer: Some(TransferType::Reference),
            fallback: None,
            promise: false,
        }
    }

    /// Default for callback/apply arguments: whatever transfers naturally,
    /// copying as a last resort.
    pub fn fallback_copy() -> TransferOptions {
        TransferOptions {
            transfer: None,
            fallback: Some(TransferType::Copy),
            promise: false,
        }
    }

    fn without_promise(self) -> TransferOptions {
        TransferOptions {
            promise: false,
            ..self
        }
    }
}

/// A moveable, isolate-independent representation of a JS value.
#[derive(Clone)]
pub enum Transferable {
    /// Materializes as a copy.
    Copy(Arc<ExternalCopy>),
    /// Materializes as an external-copy handle object.
    ExternalCopyHandle(Arc<ExternalCopy>),
    /// Materializes as a reference handle object.
    Reference(Reference),
    /// Dereferences itself in its owning isolate; one-shot.
    Dereference(DereferenceState),
    /// A function callable across the boundary.
    Callback(Arc<CallbackData>),
    /// A promise settled from another isolate's promise.
    PromiseBridge(Arc<PromiseBridge>),
}

impl Transferable {
    pub fn copy(copy: ExternalCopy) -> Transferable {
        Transferable::Copy(Arc::new(copy))
    }

    pub fn external_copy(copy: ExternalCopy) -> Transferable {
        Transferable::ExternalCopyHandle(Arc::new(copy))
    }

    pub fn reference(reference: Reference) -> Transferable {
        Transferable::Reference(reference)
    }

    /// The external copy behind a copy-style result.
    pub fn as_copy(&self) -> Option<&ExternalCopy> {
        match self {
            Transferable::Copy(c) | Transferable::ExternalCopyHandle(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Transferable::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_reference(self) -> Option<Reference> {
        match self {
            Transferable::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Materialize in the entered isolate.
    pub(crate) fn transfer_in(&self, scope: &RunScope<'_>) -> RuntimeResult<engine::Value> {
        match self {
            Transferable::Copy(copy) => copy.copy_into(scope, false),
            Transferable::ExternalCopyHandle(copy) => {
                let obj = new_instance_object(scope)?;
                register_instance(scope, &obj, Instance::ExternalCopy(Arc::clone(copy)));
                Ok(engine::Value::Object(obj))
            }
            Transferable::Reference(reference) => {
                let obj = new_instance_object(scope)?;
                register_instance(scope, &obj, Instance::Reference(reference.clone()));
                Ok(engine::Value::Object(obj))
            }
            Transferable::Dereference(state) => state.transfer_in(scope),
            Transferable::Callback(data) => callback_transfer_in(scope, Arc::clone(data)),
            Transferable::PromiseBridge(bridge) => bridge.transfer_in(scope),
        }
    }
}

impl std::fmt::Debug for Transferable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transferable::Copy(c) => write!(f, "Transferable::Copy({:?})", c),
            Transferable::ExternalCopyHandle(c) => {
                write!(f, "Transferable::ExternalCopyHandle({:?})", c)
            }
            Transferable::Reference(_) => f.write_str("Transferable::Reference"),
            Transferable::Dereference(_) => f.write_str("Transferable::Dereference"),
            Transferable::Callback(_) => f.write_str("Transferable::Callback"),
            Transferable::PromiseBridge(_) => f.write_str("Transferable::PromiseBridge"),
        }
    }
}

/// Resolve a value to a transferable, per the dispatch rules.
pub(crate) fn transfer_out(
    scope: &RunScope<'_>,
    value: &engine::Value,
    options: TransferOptions,
) -> RuntimeResult<Transferable> {
    if options.promise {
        return Ok(Transferable::PromiseBridge(PromiseBridge::from_value(
            scope,
            value,
            options.without_promise(),
        )?));
    }
    if let Some(ty) = options.transfer {
        return transfer_out_explicit(scope, value, ty);
    }
    // A runtime handle object transfers as itself.
    if let Some(obj) = value.as_object() {
        let instance = scope.env.instances.lock().get(&obj.id()).cloned();
        if let Some(instance) = instance {
            return instance.transfer_out_nested();
        }
        if obj.is_function() {
            return Ok(Transferable::Callback(CallbackData::wrap(scope, obj)?));
        }
    }
    if let Some(copy) = ExternalCopy::copy_if_primitive(value) {
        return Ok(Transferable::Copy(Arc::new(copy)));
    }
    match options.fallback {
        Some(ty) => transfer_out_explicit(scope, value, ty),
        None => Err(RuntimeError::type_error(
            "A non-transferable value was passed",
        )),
    }
}

fn transfer_out_explicit(
    scope: &RunScope<'_>,
    value: &engine::Value,
    ty: TransferType,
) -> RuntimeResult<Transferable> {
    match ty {
        TransferType::Copy => Ok(Transferable::Copy(Arc::new(ExternalCopy::copy(
            scope,
            value,
            false,
            &[],
        )?))),
        TransferType::ExternalCopy => Ok(Transferable::ExternalCopyHandle(Arc::new(
            ExternalCopy::copy(scope, value, false, &[])?,
        ))),
        TransferType::Reference => Ok(Transferable::Reference(Reference::from_value(
            scope, value, false, false,
        )?)),
        TransferType::DeepReference => Ok(Transferable::Dereference(DereferenceState::new(
            scope, value,
        )?)),
    }
}

// ---- Runtime handle instances inside an isolate ----

/// What a runtime-created object inside an isolate stands for.
#[derive(Clone)]
pub(crate) enum Instance {
    Reference(Reference),
    Dereference(DereferenceState),
    ExternalCopy(Arc<ExternalCopy>),
}

impl Instance {
    /// Transfer the handle itself onward to another isolate.
    pub(crate) fn transfer_out_nested(&self) -> RuntimeResult<Transferable> {
        match self {
            Instance::Reference(r) => Ok(Transferable::Reference(r.clone())),
            Instance::Dereference(d) => {
                d.ensure_live()?;
                Ok(Transferable::Dereference(d.clone()))
            }
            Instance::ExternalCopy(c) => Ok(Transferable::ExternalCopyHandle(Arc::clone(c))),
        }
    }
}

fn new_instance_object(scope: &RunScope<'_>) -> RuntimeResult<engine::Object> {
    scope
        .iso
        .alloc_object(engine::ObjectKind::Plain)
        .map_err(|e| crate::external_copy::runtime_error_from_engine(scope, e))
}

pub(crate) fn register_instance(
    scope: &RunScope<'_>,
    object: &engine::Object,
    instance: Instance,
) {
    scope.env.instances.lock().insert(object.id(), instance);
}

// ---- Callbacks ----

/// A function wrapped for cross-isolate invocation.
pub struct CallbackData {
    isolate: Arc<IsolateHolder>,
    function: RemoteHandle,
    name: String,
    length: u32,
}

impl CallbackData {
    fn wrap(scope: &RunScope<'_>, function: &engine::Object) -> RuntimeResult<Arc<CallbackData>> {
        let (name, length) = {
            let data = function.borrow();
            match &data.kind {
                engine::ObjectKind::Function(f) => (f.name.clone(), f.length),
                _ => return Err(RuntimeError::type_error("not a function")),
            }
        };
        let holder = scope.env.holder().ok_or_else(RuntimeError::disposed)?;
        let handle = RemoteHandle::new(scope, &engine::Value::Object(function.clone()))?;
        Ok(Arc::new(CallbackData {
            isolate: holder,
            function: handle,
            name,
            length,
        }))
    }
}

/// Build the native function that forwards invocations back to the owner.
fn callback_transfer_in(
    scope: &RunScope<'_>,
    data: Arc<CallbackData>,
) -> RuntimeResult<engine::Value> {
    let env = Arc::clone(scope.env);
    let name = data.name.clone();
    let length = data.length;
    scope
        .iso
        .new_native_function(&name, length, move |iso, _this, args| {
            let scope = RunScope { env: &env, iso };
            let mut transferred = Vec::with_capacity(args.len());
            for arg in args {
                match transfer_out(&scope, arg, TransferOptions::fallback_copy()) {
                    Ok(t) => transferred.push(t),
                    Err(e) => {
                        return Err(engine::EngineError::Thrown(
                            three_phase::error_to_engine_value(&scope, &e),
                        ))
                    }
                }
            }
            let source = match scope.env.holder() {
                Some(holder) => holder,
                None => return Err(iso.throw_type_error("Isolate is disposed")),
            };
            let task = CallbackApply {
                function: Arc::clone(&data),
                args: Some(transferred),
                result: None,
            };
            let promise = iso.new_promise()?;
            let promise_value = engine::Value::Object(promise.clone());
            let remote = match RemoteHandle::new(&scope, &promise_value) {
                Ok(remote) => remote,
                Err(e) => {
                    return Err(engine::EngineError::Thrown(
                        three_phase::error_to_engine_value(&scope, &e),
                    ))
                }
            };
            match three_phase::run_async(
                task,
                &data.isolate,
                source,
                Resolver::Engine { promise: remote },
            ) {
                Ok(()) => Ok(promise_value),
                Err(e) => Err(engine::EngineError::Thrown(
                    three_phase::error_to_engine_value(&scope, &e),
                )),
            }
        })
        .map_err(|e| crate::external_copy::runtime_error_from_engine(scope, e))
}

struct CallbackApply {
    function: Arc<CallbackData>,
    args: Option<Vec<Transferable>>,
    result: Option<Transferable>,
}

impl ThreePhase for CallbackApply {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let function = self.function.function.deref(scope)?;
        let args = self.args.take().unwrap_or_default();
        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            values.push(arg.transfer_in(scope)?);
        }
        let result = scope
            .iso
            .call(&function, &engine::Value::Undefined, &values)
            .map_err(|e| crate::external_copy::runtime_error_from_engine(scope, e))?;
        self.result = Some(transfer_out(
            scope,
            &result,
            TransferOptions::fallback_copy(),
        )?);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        self.result
            .take()
            .ok_or_else(|| RuntimeError::generic("callback produced no result"))
    }
}

// ---- Promise bridging ----

enum BridgeState {
    Pending {
        resolvers: Vec<PendingResolver>,
    },
    Settled {
        fulfilled: bool,
        value: Transferable,
    },
}

struct PendingResolver {
    isolate: Arc<IsolateHolder>,
    promise: RemoteHandle,
}

/// Shared state between a source promise and every destination promise that
/// mirrors it.
pub struct PromiseBridge {
    state: Mutex<BridgeState>,
}

impl PromiseBridge {
    /// Wrap `value` so the destination observes a promise. A non-promise
    /// settles immediately; a promise is bridged via `.then` in the source.
    fn from_value(
        scope: &RunScope<'_>,
        value: &engine::Value,
        inner_options: TransferOptions,
    ) -> RuntimeResult<Arc<PromiseBridge>> {
        if let Some(obj) = value.as_object() {
            if value.is_promise() {
                let bridge = Arc::new(PromiseBridge {
                    state: Mutex::new(BridgeState::Pending {
                        resolvers: Vec::new(),
                    }),
                });
                attach_bridge(scope, obj, &bridge, inner_options)?;
                return Ok(bridge);
            }
        }
        let settled = transfer_out(scope, value, inner_options)?;
        Ok(Arc::new(PromiseBridge {
            state: Mutex::new(BridgeState::Settled {
                fulfilled: true,
                value: settled,
            }),
        }))
    }

    fn settle(&self, fulfilled: bool, value: Transferable) {
        let resolvers = {
            let mut state = self.state.lock();
            match &mut *state {
                BridgeState::Settled { .. } => return,
                BridgeState::Pending { resolvers } => {
                    let pending = std::mem::take(resolvers);
                    *state = BridgeState::Settled {
                        fulfilled,
                        value: value.clone(),
                    };
                    pending
                }
            }
        };
        for resolver in resolvers {
            deliver_settlement(resolver, fulfilled, value.clone());
        }
    }

    /// Create the mirroring promise in the entered isolate.
    fn transfer_in(&self, scope: &RunScope<'_>) -> RuntimeResult<engine::Value> {
        let map = |e| crate::external_copy::runtime_error_from_engine(scope, e);
        let promise = scope.iso.new_promise().map_err(map)?;
        let mut state = self.state.lock();
        match &*state {
            BridgeState::Settled { fulfilled, value } => {
                let settled = value.transfer_in(scope)?;
                engine::settle_promise(scope.iso, &promise, *fulfilled, settled);
            }
            BridgeState::Pending { .. } => {
                let holder = scope.env.holder().ok_or_else(RuntimeError::disposed)?;
                let remote = RemoteHandle::new(scope, &engine::Value::Object(promise.clone()))?;
                if let BridgeState::Pending { resolvers } = &mut *state {
                    resolvers.push(PendingResolver {
                        isolate: holder,
                        promise: remote,
                    });
                }
            }
        }
        Ok(engine::Value::Object(promise))
    }
}

/// Attach `.then` handlers in the source isolate that report settlement
/// through the bridge.
fn attach_bridge(
    scope: &RunScope<'_>,
    promise: &engine::Object,
    bridge: &Arc<PromiseBridge>,
    inner_options: TransferOptions,
) -> RuntimeResult<()> {
    let make_handler = |fulfilled: bool| -> RuntimeResult<engine::Value> {
        let bridge = Arc::clone(bridge);
        let env = Arc::clone(scope.env);
        scope
            .iso
            .new_native_function("", 1, move |iso, _this, args| {
                let scope = RunScope { env: &env, iso };
                let settlement = args.first().cloned().unwrap_or_default();
                let transferable =
                    match transfer_out(&scope, &settlement, inner_options) {
                        Ok(t) => t,
                        Err(e) => Transferable::Copy(Arc::new(ExternalCopy::string(
                            e.message(),
                        ))),
                    };
                bridge.settle(fulfilled, transferable);
                Ok(engine::Value::Undefined)
            })
            .map_err(|e| crate::external_copy::runtime_error_from_engine(scope, e))
    };
    let on_fulfilled = make_handler(true)?;
    let on_rejected = make_handler(false)?;
    engine::promise_then(scope.iso, promise, Some(on_fulfilled), Some(on_rejected))
        .map_err(|e| crate::external_copy::runtime_error_from_engine(scope, e))?;
    Ok(())
}

/// Settle a remote promise in its owning isolate.
fn deliver_settlement(resolver: PendingResolver, fulfilled: bool, value: Transferable) {
    let PendingResolver { isolate, promise } = resolver;
    isolate.schedule_handle_task(Box::new(move |scope: &RunScope<'_>| {
        let Ok(promise_value) = promise.deref(scope) else {
            return;
        };
        let Some(promise_obj) = promise_value.as_object().cloned() else {
            return;
        };
        match value.transfer_in(scope) {
            Ok(settled) => {
                engine::settle_promise(scope.iso, &promise_obj, fulfilled, settled);
            }
            Err(error) => {
                let rejection = three_phase::error_to_engine_value(scope, &error);
                engine::settle_promise(scope.iso, &promise_obj, false, rejection);
            }
        }
        let _ = scope.iso.run_microtasks();
    }));
}
