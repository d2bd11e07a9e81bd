//! islet-runtime — a multi-tenant JavaScript isolate runtime.
//!
//! A [`Runtime`] lets one host process run many isolated JS environments,
//! each with its own heap cap and cooperative task queue, and move values
//! and code between them with explicit copy / reference / transfer
//! semantics. It is the substrate for running untrusted scripts, building
//! sandboxes, or multiplexing many small JS workloads in one process.
//!
//! Four subsystems make up the core:
//!
//! - **Scheduling & execution** — per-isolate task queues dispatched over a
//!   bounded worker pool, single-writer engine locking, memory-limit
//!   enforcement, cooperative termination (environment, scheduler,
//!   executor, pool, timer).
//! - **The cross-isolate handle graph** — remote handles whose disposal is
//!   always performed inside their owning isolate (remote, reference).
//! - **The three-phase protocol** — extract in the caller, execute in the
//!   target, inject back in the caller; synchronous, asynchronous and
//!   fire-and-forget drivers over the same task type (three-phase tasks).
//! - **The value transfer layer** — deep copies, external copies,
//!   references, callbacks, promise bridges and structured-clone payloads
//!   (external copies, transferables).
//!
//! # Example
//!
//! ```no_run
//! use islet_runtime::{IsolateOptions, Runtime, RunOptions};
//!
//! let runtime = Runtime::new().unwrap();
//! let isolate = runtime.create_isolate(IsolateOptions::default()).unwrap();
//! let context = isolate.create_context().unwrap();
//! let script = isolate.compile_script("40 + 2", "answer.js").unwrap();
//! let result = script.run_sync(&context, RunOptions::default()).unwrap();
//! assert_eq!(result.as_copy().and_then(|c| c.as_number()), Some(42.0));
//! runtime.dispose();
//! ```

mod environment;
mod error;
mod executor;
mod external_copy;
mod host_loop;
mod inspector;
mod lockable;
mod module;
mod native;
mod pool;
mod reference;
mod remote;
mod runtime;
mod scheduler;
mod script;
mod snapshot;
mod three_phase;
mod timeout;
mod timer;
mod transfer;

pub use environment::{HeapStatistics, IsolateHolder, IsolateOptions, MIN_MEMORY_LIMIT_MB};
pub use error::{ErrorDetail, JsErrorCopy, RuntimeError, RuntimeResult};
pub use external_copy::{total_external_size, ExternalCopy};
pub use inspector::{InspectorSession, SessionCallbacks};
pub use lockable::{Lockable, Waitable};
pub use module::{Module, ModuleResolver};
pub use native::{NativeModule, NativeModuleContext, NATIVE_MODULE_ENTRY};
pub use reference::{AccessOptions, ApplyOptions, Reference, TypeTag};
pub use runtime::{ContextRef, IsolateRef, Runtime};
pub use script::{RunOptions, Script};
pub use snapshot::{create_snapshot, SnapshotScript};
pub use three_phase::ResponseFuture;
pub use timer::{Timer, TimerHolder};
pub use transfer::{Transferable, TransferOptions, TransferType};

pub use islet_engine::ErrorKind;
