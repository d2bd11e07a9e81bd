//! Inspector sessions: a channel that pumps protocol messages into a target
//! isolate and routes responses and notifications back to the session
//! owner's side.
//!
//! Message transport and the protocol payloads themselves are the
//! embedder's business; this layer owns only session lifecycle and the
//! handle-task plumbing in both directions.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::environment::{IsolateEnvironment, IsolateHolder};
use crate::error::{RuntimeError, RuntimeResult};
use crate::scheduler::RunScope;

/// Callbacks invoked on the session owner's side.
pub struct SessionCallbacks {
    /// Called with (call id, response JSON) for replies to dispatched
    /// messages.
    pub on_response: Box<dyn FnMut(u64, String) + Send>,
    /// Called with notification JSON for agent-initiated events.
    pub on_notification: Box<dyn FnMut(String) + Send>,
}

pub(crate) struct SessionShared {
    target: Arc<IsolateHolder>,
    source: Arc<IsolateHolder>,
    callbacks: Mutex<Option<SessionCallbacks>>,
}

/// One inspector session against an isolate's agent.
pub struct InspectorSession {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for InspectorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InspectorSession").finish()
    }
}

impl InspectorSession {
    pub(crate) fn create(
        target: Arc<IsolateHolder>,
        source: Arc<IsolateHolder>,
        callbacks: SessionCallbacks,
    ) -> RuntimeResult<InspectorSession> {
        let env = target.expect()?;
        if !env.inspector_enabled {
            return Err(RuntimeError::generic(
                "Isolate was not created with inspector enabled",
            ));
        }
        let shared = Arc::new(SessionShared {
            target,
            source,
            callbacks: Mutex::new(Some(callbacks)),
        });
        env.inspector_sessions.lock().push(Arc::downgrade(&shared));
        debug!(isolate = env.id, "inspector session opened");
        Ok(InspectorSession { shared })
    }

    /// Dispatch one protocol message into the target isolate. The reply (or
    /// error) is delivered to `on_response` via the owner's queues.
    pub fn dispatch_protocol_message(&self, message: &str) -> RuntimeResult<()> {
        if self.shared.callbacks.lock().is_none() {
            return Err(RuntimeError::generic("Session has been released"));
        }
        let env = self.shared.target.expect()?;
        let shared = Arc::clone(&self.shared);
        let message = message.to_string();
        env.schedule_handle_task(Box::new(move |_scope: &RunScope<'_>| {
            let (call_id, response) = agent_dispatch(&message);
            deliver_response(&shared, call_id, response);
        }));
        Ok(())
    }

    /// Close the session; further dispatches fail.
    pub fn dispose(&self) {
        *self.shared.callbacks.lock() = None;
    }
}

impl Drop for InspectorSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// The trivial per-isolate agent: acknowledges any well-formed call. Real
/// protocol domains live behind the engine boundary and are out of reach
/// for this engine; session plumbing behaves identically either way.
fn agent_dispatch(message: &str) -> (u64, String) {
    match serde_json::from_str::<JsonValue>(message) {
        Ok(value) => {
            let id = value.get("id").and_then(JsonValue::as_u64).unwrap_or(0);
            let response = serde_json::json!({ "id": id, "result": {} });
            (id, response.to_string())
        }
        Err(e) => {
            let response = serde_json::json!({
                "id": 0,
                "error": { "code": -32700, "message": format!("Parse error: {}", e) },
            });
            (0, response.to_string())
        }
    }
}

/// Route a response back through the owner's isolate as a handle task.
fn deliver_response(shared: &Arc<SessionShared>, call_id: u64, response: String) {
    let session = Arc::clone(shared);
    shared
        .source
        .schedule_handle_task(Box::new(move |_scope: &RunScope<'_>| {
            let mut callbacks = session.callbacks.lock();
            if let Some(callbacks) = callbacks.as_mut() {
                (callbacks.on_response)(call_id, response);
            }
        }));
}

/// Tear down every session attached to `env`; called during disposal.
pub(crate) fn close_sessions(env: &IsolateEnvironment) {
    let sessions = std::mem::take(&mut *env.inspector_sessions.lock());
    for weak in sessions {
        if let Some(session) = Weak::upgrade(&weak) {
            *session.callbacks.lock() = None;
        }
    }
}
