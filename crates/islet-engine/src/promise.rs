//! Promise objects and the per-isolate microtask queue.
//!
//! Reactions run as microtasks drained by the embedder (typically in its
//! task epilogue). A rejection that settles with no reaction attached is
//! recorded on the isolate as the pending unhandled rejection.

use crate::error::{Completion, EngineError};
use crate::isolate::Isolate;
use crate::value::{Object, ObjectKind, Value};

#[derive(Debug)]
pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

pub struct PromiseData {
    pub state: PromiseState,
    pub reactions: Vec<Reaction>,
    /// True once any reaction has ever been attached; suppresses the
    /// unhandled-rejection record.
    pub handled: bool,
}

impl PromiseData {
    pub fn new() -> Self {
        PromiseData {
            state: PromiseState::Pending,
            reactions: Vec::new(),
            handled: false,
        }
    }
}

impl Default for PromiseData {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Reaction {
    pub on_fulfilled: Option<Value>,
    pub on_rejected: Option<Value>,
    /// The promise derived by `.then`, settled from the reaction's result.
    pub derived: Object,
}

/// Read a promise's settlement state without consuming it.
pub fn promise_state(promise: &Object) -> Option<(bool, Value)> {
    match &promise.borrow().kind {
        ObjectKind::Promise(data) => match &data.state {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(v) => Some((true, v.clone())),
            PromiseState::Rejected(v) => Some((false, v.clone())),
        },
        _ => None,
    }
}

/// Settle a pending promise and schedule its reactions. Settling an already
/// settled promise is a no-op, matching JS resolver semantics.
pub fn settle_promise(iso: &Isolate, promise: &Object, fulfilled: bool, value: Value) {
    let reactions = {
        let mut data = promise.borrow_mut();
        let ObjectKind::Promise(promise_data) = &mut data.kind else {
            return;
        };
        if !matches!(promise_data.state, PromiseState::Pending) {
            return;
        }
        promise_data.state = if fulfilled {
            PromiseState::Fulfilled(value.clone())
        } else {
            PromiseState::Rejected(value.clone())
        };
        std::mem::take(&mut promise_data.reactions)
    };
    if !fulfilled && reactions.is_empty() && !promise_handled(promise) {
        iso.record_unhandled_rejection(promise, value.clone());
    }
    for reaction in reactions {
        schedule_reaction(iso, reaction, fulfilled, value.clone());
    }
}

fn promise_handled(promise: &Object) -> bool {
    match &promise.borrow().kind {
        ObjectKind::Promise(data) => data.handled,
        _ => false,
    }
}

/// Attach `.then(on_fulfilled, on_rejected)` handlers, returning the derived
/// promise.
pub fn then(
    iso: &Isolate,
    promise: &Object,
    on_fulfilled: Option<Value>,
    on_rejected: Option<Value>,
) -> Completion<Object> {
    let derived = iso.new_promise()?;
    let reaction = Reaction {
        on_fulfilled,
        on_rejected,
        derived: derived.clone(),
    };
    let settled = {
        let mut data = promise.borrow_mut();
        let ObjectKind::Promise(promise_data) = &mut data.kind else {
            return Err(iso.throw_type_error("Receiver is not a promise"));
        };
        promise_data.handled = true;
        match &promise_data.state {
            PromiseState::Pending => {
                promise_data.reactions.push(reaction);
                None
            }
            PromiseState::Fulfilled(v) => Some((true, v.clone(), reaction)),
            PromiseState::Rejected(v) => Some((false, v.clone(), reaction)),
        }
    };
    if let Some((fulfilled, value, reaction)) = settled {
        schedule_reaction(iso, reaction, fulfilled, value);
    }
    iso.clear_unhandled_rejection_for(promise);
    Ok(derived)
}

fn schedule_reaction(iso: &Isolate, reaction: Reaction, fulfilled: bool, value: Value) {
    iso.enqueue_microtask(Box::new(move |iso: &Isolate| {
        let handler = if fulfilled {
            reaction.on_fulfilled.clone()
        } else {
            reaction.on_rejected.clone()
        };
        match handler {
            Some(f) if f.is_function() => match iso.call(&f, &Value::Undefined, &[value]) {
                Ok(result) => resolve_promise(iso, &reaction.derived, result),
                Err(EngineError::Thrown(err)) => {
                    settle_promise(iso, &reaction.derived, false, err);
                }
                Err(other) => return Err(other),
            },
            _ => {
                // Pass-through: propagate the settlement unchanged.
                settle_promise(iso, &reaction.derived, fulfilled, value);
            }
        }
        Ok(())
    }));
}

/// Resolve a promise with a value, flattening promise chaining: a promise
/// result adopts that promise's eventual settlement.
pub fn resolve_promise(iso: &Isolate, derived: &Object, result: Value) {
    if let Value::Object(obj) = &result {
        if matches!(obj.borrow().kind, ObjectKind::Promise(_)) {
            let derived = derived.clone();
            let inner = obj.clone();
            // Chain: settle `derived` when `result` settles.
            let derived_fulfill = derived.clone();
            let on_fulfilled = iso.new_native_function("", 1, {
                move |iso: &Isolate, _this: &Value, args: &[Value]| {
                    let v = args.first().cloned().unwrap_or_default();
                    settle_promise(iso, &derived_fulfill, true, v);
                    Ok(Value::Undefined)
                }
            });
            let derived_reject = derived.clone();
            let on_rejected = iso.new_native_function("", 1, {
                move |iso: &Isolate, _this: &Value, args: &[Value]| {
                    let v = args.first().cloned().unwrap_or_default();
                    settle_promise(iso, &derived_reject, false, v);
                    Ok(Value::Undefined)
                }
            });
            match (on_fulfilled, on_rejected) {
                (Ok(f), Ok(r)) => {
                    let _ = then(iso, &inner, Some(f), Some(r));
                }
                _ => settle_promise(iso, &derived, false, Value::Undefined),
            }
            return;
        }
    }
    settle_promise(iso, derived, true, result);
}
