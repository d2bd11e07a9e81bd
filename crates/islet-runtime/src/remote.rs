//! Remote handles: owning references to engine values living in another
//! isolate.
//!
//! Handles are shared (clones reference one underlying persistent); the
//! engine persistent is only created and reset while the owning isolate is
//! entered. Dropping the last clone never touches the engine directly: it
//! resets inline when the current thread already holds the owner's lock,
//! and otherwise enqueues a handle task performing the reset in-isolate.
//! `remotes_count` tracks outstanding handles so an isolate is never fully
//! released while any remain.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use islet_engine as engine;
use parking_lot::Mutex;

use crate::environment::IsolateHolder;
use crate::error::{RuntimeError, RuntimeResult};
use crate::executor;
use crate::scheduler::RunScope;

#[derive(Clone)]
pub struct RemoteHandle {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    holder: Arc<IsolateHolder>,
    persistent: Mutex<Option<engine::Persistent>>,
}

impl RemoteHandle {
    /// Promote a local value of the currently entered isolate.
    pub(crate) fn new(scope: &RunScope<'_>, value: &engine::Value) -> RuntimeResult<RemoteHandle> {
        let holder = scope.env.holder().ok_or_else(RuntimeError::disposed)?;
        let persistent = scope.iso.make_persistent(value);
        scope.env.remotes_count.fetch_add(1, Ordering::AcqRel);
        Ok(RemoteHandle {
            inner: Arc::new(RemoteInner {
                holder,
                persistent: Mutex::new(Some(persistent)),
            }),
        })
    }

    pub(crate) fn holder(&self) -> Arc<IsolateHolder> {
        Arc::clone(&self.inner.holder)
    }

    /// True when the handle's owner is the entered isolate.
    pub(crate) fn same_isolate(&self, scope: &RunScope<'_>) -> bool {
        match scope.env.holder() {
            Some(holder) => Arc::ptr_eq(&self.inner.holder, &holder),
            None => false,
        }
    }

    /// Materialize the value. Only valid while entered into the owning
    /// isolate.
    pub(crate) fn deref(&self, scope: &RunScope<'_>) -> RuntimeResult<engine::Value> {
        if !self.same_isolate(scope) {
            return Err(RuntimeError::type_error(
                "Cannot dereference this from the current isolate",
            ));
        }
        let guard = self.inner.persistent.lock();
        let persistent = guard
            .as_ref()
            .ok_or_else(|| RuntimeError::generic("handle has been released"))?;
        scope
            .iso
            .deref_persistent(persistent)
            .map_err(|_| RuntimeError::generic("handle has been released"))
    }
}

impl Drop for RemoteInner {
    fn drop(&mut self) {
        let Some(persistent) = self.persistent.get_mut().take() else {
            return;
        };
        let Some(env) = self.holder.get() else {
            // Isolate already disposed; the engine and its persistents are
            // gone with it.
            return;
        };
        if executor::holds_engine_lock(&env) {
            // Fast path: we are inside the owning isolate right now.
            executor::with_entered_engine(&env, |iso| iso.reset_persistent(persistent));
            env.remotes_count.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let reset_env = Arc::clone(&env);
        self.holder
            .schedule_handle_task(Box::new(move |scope: &RunScope<'_>| {
                scope.iso.reset_persistent(persistent);
                reset_env.remotes_count.fetch_sub(1, Ordering::AcqRel);
            }));
    }
}

impl std::fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.persistent.lock().as_ref() {
            Some(_) => f.write_str("RemoteHandle(live)"),
            None => f.write_str("RemoteHandle(released)"),
        }
    }
}
