//! islet-engine — an embeddable JavaScript engine core.
//!
//! This crate provides the engine half of islet: isolates with heap
//! accounting and cooperative termination, contexts, a compact interpreter
//! over a practical JavaScript subset, promises with a microtask queue,
//! persistent handles, module records, structured clone with embedder
//! delegates, and snapshot blobs.
//!
//! It is deliberately small where a production engine is large (no JIT, no
//! moving GC, a language subset rather than the full spec); what it keeps
//! faithful is the *embedding contract* the runtime layer is built against:
//!
//! - `Isolate` is `Send` but not `Sync`; one thread inside at a time.
//! - `IsolateHandle` (`Send + Sync`) delivers interrupts and termination at
//!   safe points inside running JS.
//! - Local [`Value`]s never leave the embedder's lock scope; [`Persistent`]
//!   handles are created and reset only while entered.
//! - Heap allocations are charged against a limit, with a near-limit
//!   callback and a pluggable array-buffer allocator.
//!
//! # Example
//!
//! ```
//! use islet_engine::{CreateParams, Isolate};
//!
//! let iso = Isolate::new(CreateParams::default()).unwrap();
//! let ctx = iso.default_context().clone();
//! let value = iso.eval("40 + 2", "example.js", &ctx).unwrap();
//! assert_eq!(value.as_number(), Some(42.0));
//! ```

mod ast;
mod builtins;
mod error;
mod heap;
mod interp;
mod lexer;
mod module;
mod parser;
mod promise;
mod snapshot;
mod structured_clone;
mod value;

pub mod isolate;

pub use error::{Completion, EngineError};
pub use heap::NearHeapLimitCallback;
pub use num_bigint::BigInt as JsBigInt;
pub use isolate::{
    AllocationTicket, ArrayBufferAllocator, Context, CreateParams, InterruptCallback, Isolate,
    IsolateHandle, Persistent, UnlimitedAllocator,
};
pub use value::{
    number_to_string, BackingStore, BufferData, ErrorKind, FnKind, FunctionData, JsString, Object,
    ObjectKind, ParsedScript, Property, ProxyData, StringData, Value, ViewData, ViewType,
};

pub use interp::{call_function, construct, get_member, set_member, value_to_display};
pub use module::{
    evaluate as evaluate_module, instantiate as instantiate_module, module_namespace,
    module_record, requests as module_requests, set_resolution, ModuleRecord, ModuleStatus,
};
pub use promise::{promise_state, resolve_promise, settle_promise, then as promise_then};
pub use snapshot::{apply_snapshot, create_snapshot};
pub use structured_clone::{
    deserialize, serialize, DenyDelegate, DeserializerDelegate, SerializerDelegate,
    ValueDeserializer, ValueSerializer,
};
