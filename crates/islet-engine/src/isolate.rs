//! The isolate: one engine instance with its own heap, contexts and
//! microtask queue.
//!
//! # Thread model
//!
//! `Isolate` is `Send` but not `Sync`: it can move between threads but only
//! one thread may touch it at a time. The embedder enforces exclusivity (a
//! mutex plus an entered-thread check); within the engine everything is
//! single-threaded interior mutability. `IsolateHandle` is the `Send + Sync`
//! face used for cross-thread interruption and termination.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::ast::Program;
use crate::builtins;
use crate::error::{Completion, EngineError};
use crate::heap::{Heap, NearHeapLimitCallback};
use crate::interp;
use crate::module::ModuleRecord;
use crate::value::{
    throw_error, BackingStore, BufferData, ErrorKind, FnKind, FunctionData, JsString, Object,
    ObjectKind, ParsedScript, StringData, Value,
};

/// Accounting hook for `ArrayBuffer` backing memory, the engine-boundary
/// equivalent of a pluggable array-buffer allocator. The engine owns the
/// bytes; the allocator only admits or refuses the accounting.
pub trait ArrayBufferAllocator: Send + Sync {
    /// Admit `len` bytes. Returning `false` fails the allocation with a
    /// RangeError in JS.
    fn allocate(&self, len: usize) -> bool;
    fn free(&self, len: usize);
}

/// Default allocator: everything is admitted.
pub struct UnlimitedAllocator;

impl ArrayBufferAllocator for UnlimitedAllocator {
    fn allocate(&self, _len: usize) -> bool {
        true
    }

    fn free(&self, _len: usize) {}
}

/// RAII record of bytes admitted by an [`ArrayBufferAllocator`].
pub struct AllocationTicket {
    allocator: Arc<dyn ArrayBufferAllocator>,
    len: usize,
}

impl Drop for AllocationTicket {
    fn drop(&mut self) {
        self.allocator.free(self.len);
    }
}

/// Parameters for [`Isolate::new`].
pub struct CreateParams {
    /// Heap cap in bytes for engine-internal allocations.
    pub heap_limit: usize,
    /// Snapshot blob produced by [`crate::snapshot::create_snapshot`].
    pub snapshot: Option<Vec<u8>>,
    /// Array-buffer accounting hook.
    pub allocator: Option<Arc<dyn ArrayBufferAllocator>>,
}

impl Default for CreateParams {
    fn default() -> Self {
        CreateParams {
            heap_limit: 512 * 1024 * 1024,
            snapshot: None,
            allocator: None,
        }
    }
}

/// A global-object scope; code always runs in some context.
#[derive(Clone)]
pub struct Context {
    global: Object,
}

impl Context {
    /// Wrap an existing global object as a context.
    pub fn from_global(global: Object) -> Context {
        Context { global }
    }

    pub fn global(&self) -> &Object {
        &self.global
    }
}

/// Owning id of a value kept alive across embedder lock scopes. Created and
/// reset only while the isolate is entered.
#[derive(Debug)]
pub struct Persistent {
    id: u64,
}

impl Persistent {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub(crate) type Microtask = Box<dyn FnOnce(&Isolate) -> Completion<()>>;

/// Cross-thread interrupt callback.
pub type InterruptCallback = Box<dyn FnOnce(&Isolate) + Send>;

struct IsolateShared {
    terminated: AtomicBool,
    interrupt: AtomicBool,
    interrupts: Mutex<VecDeque<InterruptCallback>>,
}

/// `Send + Sync` handle for cross-thread operations on an isolate.
#[derive(Clone)]
pub struct IsolateHandle {
    shared: Arc<IsolateShared>,
}

impl IsolateHandle {
    /// Queue `callback` to run at the isolate's next safe point.
    pub fn request_interrupt(&self, callback: InterruptCallback) {
        self.shared.interrupts.lock().push_back(callback);
        self.shared.interrupt.store(true, Ordering::Release);
    }

    /// Request cooperative termination: the running script unwinds at the
    /// next safe point. Sticky until [`cancel_terminate`](Self::cancel_terminate).
    pub fn terminate_execution(&self) {
        self.shared.terminated.store(true, Ordering::Release);
        self.shared.interrupt.store(true, Ordering::Release);
    }

    pub fn cancel_terminate(&self) {
        self.shared.terminated.store(false, Ordering::Release);
    }

    /// Advisory request for the isolate to shed memory, safe from any
    /// thread. This engine frees eagerly via reference counting, so there
    /// is nothing queued to reclaim; the hook exists for allocator retry
    /// protocols.
    pub fn low_memory_notification(&self) {}

    pub fn is_terminating(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }
}

struct Frame {
    name: String,
}

pub struct Isolate {
    heap: Rc<Heap>,
    shared: Arc<IsolateShared>,
    allocator: Arc<dyn ArrayBufferAllocator>,
    default_context: Context,
    /// Retained so later contexts boot from the same snapshot.
    snapshot: Option<Vec<u8>>,
    persistents: RefCell<FxHashMap<u64, Value>>,
    next_persistent: Cell<u64>,
    microtasks: RefCell<VecDeque<Microtask>>,
    unhandled_rejection: RefCell<Option<(usize, Value)>>,
    call_stack: Rc<RefCell<Vec<Frame>>>,
}

// SAFETY: the embedder guarantees exclusive access (one thread inside the
// isolate at a time); the isolate is moved between threads, never shared.
// All interior Rc/RefCell state is only touched while entered.
unsafe impl Send for Isolate {}

impl Isolate {
    pub fn new(params: CreateParams) -> Completion<Isolate> {
        let heap = Heap::new(params.heap_limit);
        let allocator = params
            .allocator
            .unwrap_or_else(|| Arc::new(UnlimitedAllocator));
        let default_context = builtins::create_context(&heap)?;
        let iso = Isolate {
            heap,
            shared: Arc::new(IsolateShared {
                terminated: AtomicBool::new(false),
                interrupt: AtomicBool::new(false),
                interrupts: Mutex::new(VecDeque::new()),
            }),
            allocator,
            default_context,
            snapshot: params.snapshot,
            persistents: RefCell::new(FxHashMap::default()),
            next_persistent: Cell::new(1),
            microtasks: RefCell::new(VecDeque::new()),
            unhandled_rejection: RefCell::new(None),
            call_stack: Rc::new(RefCell::new(Vec::new())),
        };
        if let Some(blob) = iso.snapshot.clone() {
            let context = iso.default_context.clone();
            crate::snapshot::apply_snapshot(&iso, &context, &blob)?;
        }
        Ok(iso)
    }

    pub fn handle(&self) -> IsolateHandle {
        IsolateHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn heap(&self) -> &Rc<Heap> {
        &self.heap
    }

    /// Bytes currently booked against the engine heap.
    pub fn heap_used(&self) -> usize {
        self.heap.used()
    }

    pub fn heap_limit(&self) -> usize {
        self.heap.limit()
    }

    /// True once any allocation has failed against the limit.
    pub fn hit_heap_limit(&self) -> bool {
        self.heap.tripped()
    }

    /// Install the callback invoked (once) when an allocation first fails
    /// against the heap limit.
    pub fn set_near_heap_limit_callback(&self, callback: NearHeapLimitCallback) {
        self.heap.set_limit_callback(callback);
    }

    /// Advisory: ask the engine to shed memory. This engine frees eagerly via
    /// reference counting, so there is nothing to reclaim.
    pub fn low_memory_notification(&self) {}

    pub fn is_terminating(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    // ---- Contexts, compilation, execution ----

    pub fn create_context(&self) -> Completion<Context> {
        let context = builtins::create_context(&self.heap)?;
        if let Some(blob) = &self.snapshot {
            crate::snapshot::apply_snapshot(self, &context, blob)?;
        }
        Ok(context)
    }

    pub fn default_context(&self) -> &Context {
        &self.default_context
    }

    /// Compile source into an unbound script object. Parse failures surface
    /// as thrown `SyntaxError`s.
    pub fn compile(&self, source: &str, origin: &str) -> Completion<Object> {
        let program = self.parse(source)?;
        self.alloc_object(ObjectKind::Script(Rc::new(ParsedScript {
            program: Rc::new(program),
            origin: origin.to_string(),
        })))
    }

    /// Compile source as a module; dependency specifiers are collected from
    /// top-level `import` declarations.
    pub fn compile_module(&self, source: &str, origin: &str) -> Completion<Object> {
        let program = self.parse(source)?;
        let record = ModuleRecord::new(Rc::new(program), origin);
        self.alloc_object(ObjectKind::Module(Rc::new(RefCell::new(record))))
    }

    fn parse(&self, source: &str) -> Completion<Program> {
        match crate::parser::parse_program(source) {
            Ok(program) => Ok(program),
            Err(EngineError::Syntax(message)) => {
                Err(self.throw_error(ErrorKind::SyntaxError, &message))
            }
            Err(other) => Err(other),
        }
    }

    /// Bind an unbound script to `context` and run it.
    pub fn run_script(&self, script: &Object, context: &Context) -> Completion {
        let parsed = match &script.borrow().kind {
            ObjectKind::Script(parsed) => Rc::clone(parsed),
            _ => return Err(self.throw_type_error("not a script")),
        };
        interp::run_program(self, context.global(), &parsed.program, &parsed.origin)
    }

    /// Compile and run in one step.
    pub fn eval(&self, source: &str, origin: &str, context: &Context) -> Completion {
        let script = self.compile(source, origin)?;
        self.run_script(&script, context)
    }

    /// Invoke a callable value.
    pub fn call(&self, callee: &Value, this: &Value, args: &[Value]) -> Completion {
        interp::call_function(self, callee, this, args)
    }

    /// Cooperative safe point: drains pending interrupts, then honors a
    /// termination request.
    pub fn check_safepoint(&self) -> Completion<()> {
        if self.shared.interrupt.swap(false, Ordering::AcqRel) {
            loop {
                let callback = self.shared.interrupts.lock().pop_front();
                match callback {
                    Some(callback) => callback(self),
                    None => break,
                }
            }
        }
        if self.shared.terminated.load(Ordering::Acquire) {
            return Err(EngineError::Terminated);
        }
        Ok(())
    }

    // ---- Microtasks & rejections ----

    pub(crate) fn enqueue_microtask(&self, task: Microtask) {
        self.microtasks.borrow_mut().push_back(task);
    }

    pub fn has_pending_microtasks(&self) -> bool {
        !self.microtasks.borrow().is_empty()
    }

    /// Drain the microtask queue to quiescence.
    pub fn run_microtasks(&self) -> Completion<()> {
        loop {
            let task = self.microtasks.borrow_mut().pop_front();
            match task {
                Some(task) => task(self)?,
                None => return Ok(()),
            }
        }
    }

    pub(crate) fn record_unhandled_rejection(&self, promise: &Object, value: Value) {
        let mut slot = self.unhandled_rejection.borrow_mut();
        if slot.is_none() {
            *slot = Some((promise.id(), value));
        }
    }

    pub(crate) fn clear_unhandled_rejection_for(&self, promise: &Object) {
        let mut slot = self.unhandled_rejection.borrow_mut();
        if matches!(&*slot, Some((id, _)) if *id == promise.id()) {
            *slot = None;
        }
    }

    /// Take the most recent unhandled promise rejection, if any.
    pub fn take_unhandled_rejection(&self) -> Option<Value> {
        self.unhandled_rejection.borrow_mut().take().map(|(_, v)| v)
    }

    // ---- Persistent handles ----

    /// Promote a local value to a persistent handle.
    pub fn make_persistent(&self, value: &Value) -> Persistent {
        let id = self.next_persistent.get();
        self.next_persistent.set(id + 1);
        self.persistents.borrow_mut().insert(id, value.clone());
        Persistent { id }
    }

    /// Materialize a persistent handle as a local value.
    pub fn deref_persistent(&self, handle: &Persistent) -> Completion {
        self.persistents
            .borrow()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| self.throw_error(ErrorKind::Error, "persistent handle was reset"))
    }

    /// Release a persistent handle, dropping the engine's reference.
    pub fn reset_persistent(&self, handle: Persistent) {
        self.persistents.borrow_mut().remove(&handle.id);
    }

    pub fn persistent_count(&self) -> usize {
        self.persistents.borrow().len()
    }

    // ---- Allocation ----

    pub fn alloc_string(&self, text: &str) -> Completion<JsString> {
        JsString::alloc(&self.heap, text)
    }

    pub fn alloc_string_data(&self, data: StringData) -> Completion<JsString> {
        JsString::alloc_data(&self.heap, data)
    }

    pub fn alloc_object(&self, kind: ObjectKind) -> Completion<Object> {
        Object::alloc(&self.heap, kind, None)
    }

    pub fn alloc_object_with_proto(
        &self,
        kind: ObjectKind,
        proto: Option<Object>,
    ) -> Completion<Object> {
        Object::alloc(&self.heap, kind, proto)
    }

    /// Build an error object of `kind` with a captured stack.
    pub fn new_error(&self, kind: ErrorKind, message: &str) -> Completion<Object> {
        let error = crate::value::alloc_error(&self.heap, kind, message)?;
        let stack_text = format!(
            "{}{}",
            crate::interp::value_to_display(&Value::Object(error.clone())),
            self.capture_stack()
        );
        let stack = self.alloc_string(&stack_text)?;
        error.set_hidden("stack", Value::String(stack));
        Ok(error)
    }

    pub fn new_native_function(
        &self,
        name: &str,
        length: u32,
        f: impl Fn(&Isolate, &Value, &[Value]) -> Completion + 'static,
    ) -> Completion<Value> {
        let obj = self.alloc_object(ObjectKind::Function(FunctionData {
            name: name.to_string(),
            length,
            kind: FnKind::Native(Rc::new(f)),
        }))?;
        Ok(Value::Object(obj))
    }

    pub fn new_promise(&self) -> Completion<Object> {
        self.alloc_object(ObjectKind::Promise(crate::promise::PromiseData::new()))
    }

    /// Allocate a fresh zeroed `ArrayBuffer` through the allocator hook.
    pub fn new_array_buffer(&self, len: usize) -> Completion<Object> {
        self.new_buffer(builtins::new_backing_store(len), false)
    }

    pub fn new_shared_array_buffer(&self, len: usize) -> Completion<Object> {
        self.new_buffer(builtins::new_backing_store(len), true)
    }

    /// Wrap an existing backing store, charging this isolate's allocator for
    /// its length.
    pub fn wrap_backing_store(&self, store: BackingStore, shared: bool) -> Completion<Object> {
        self.new_buffer(store, shared)
    }

    fn new_buffer(&self, store: BackingStore, shared: bool) -> Completion<Object> {
        let len = store.read().len();
        if !self.allocator.allocate(len) {
            return Err(self.throw_range_error("Array buffer allocation failed"));
        }
        let ticket = AllocationTicket {
            allocator: Arc::clone(&self.allocator),
            len,
        };
        self.alloc_object(ObjectKind::ArrayBuffer(BufferData {
            store: Some(store),
            shared,
            allocation: Some(ticket),
        }))
    }

    /// Detach an `ArrayBuffer`, returning its backing store. The buffer's
    /// `byteLength` becomes 0 and the allocator accounting is released.
    pub fn detach_array_buffer(&self, buffer: &Object) -> Completion<BackingStore> {
        let mut data = buffer.borrow_mut();
        let ObjectKind::ArrayBuffer(buf) = &mut data.kind else {
            return Err(self.throw_type_error("not an ArrayBuffer"));
        };
        if buf.shared {
            return Err(self.throw_type_error("SharedArrayBuffer cannot be detached"));
        }
        let store = buf
            .store
            .take()
            .ok_or_else(|| self.throw_type_error("ArrayBuffer is already detached"))?;
        buf.allocation = None;
        Ok(store)
    }

    // ---- Errors & stack traces ----

    pub fn throw_error(&self, kind: ErrorKind, message: &str) -> EngineError {
        match self.new_error(kind, message) {
            Ok(obj) => EngineError::Thrown(Value::Object(obj)),
            Err(_) => throw_error(&self.heap, kind, message),
        }
    }

    pub fn throw_type_error(&self, message: &str) -> EngineError {
        self.throw_error(ErrorKind::TypeError, message)
    }

    pub fn throw_range_error(&self, message: &str) -> EngineError {
        self.throw_error(ErrorKind::RangeError, message)
    }

    pub fn throw_reference_error(&self, message: &str) -> EngineError {
        self.throw_error(ErrorKind::ReferenceError, message)
    }

    pub fn throw_syntax_error(&self, message: &str) -> EngineError {
        self.throw_error(ErrorKind::SyntaxError, message)
    }

    pub(crate) fn push_frame(&self, name: &str, max_depth: usize) -> Completion<FrameGuard> {
        {
            let mut stack = self.call_stack.borrow_mut();
            if stack.len() >= max_depth {
                drop(stack);
                return Err(self.throw_range_error("Maximum call stack size exceeded"));
            }
            stack.push(Frame {
                name: if name.is_empty() {
                    "<anonymous>".to_string()
                } else {
                    name.to_string()
                },
            });
        }
        Ok(FrameGuard {
            stack: Rc::clone(&self.call_stack),
        })
    }

    /// Render the current JS call stack, innermost frame first.
    pub fn capture_stack(&self) -> String {
        let stack = self.call_stack.borrow();
        let mut out = String::new();
        for frame in stack.iter().rev() {
            out.push_str("\n    at ");
            out.push_str(&frame.name);
        }
        out
    }
}

pub(crate) struct FrameGuard {
    stack: Rc<RefCell<Vec<Frame>>>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolate() -> Isolate {
        Isolate::new(CreateParams::default()).unwrap()
    }

    #[test]
    fn eval_arithmetic() {
        let iso = isolate();
        let ctx = iso.default_context().clone();
        let result = iso.eval("40 + 2", "test.js", &ctx).unwrap();
        assert_eq!(result.as_number(), Some(42.0));
    }

    #[test]
    fn eval_string_method() {
        let iso = isolate();
        let ctx = iso.default_context().clone();
        let f = iso.eval("(x) => x.toUpperCase()", "test.js", &ctx).unwrap();
        let arg = Value::String(iso.alloc_string("hello").unwrap());
        let result = iso.call(&f, &Value::Undefined, &[arg]).unwrap();
        assert_eq!(result.as_string().map(|s| s.to_rust_string()).as_deref(), Some("HELLO"));
    }

    #[test]
    fn closures_and_loops() {
        let iso = isolate();
        let ctx = iso.default_context().clone();
        let result = iso
            .eval(
                "let total = 0; for (let i = 0; i < 5; i++) { total += i; } total",
                "test.js",
                &ctx,
            )
            .unwrap();
        assert_eq!(result.as_number(), Some(10.0));
    }

    #[test]
    fn try_catch_catches_thrown() {
        let iso = isolate();
        let ctx = iso.default_context().clone();
        let result = iso
            .eval(
                "let got = ''; try { throw new TypeError('boom'); } catch (e) { got = e.message; } got",
                "test.js",
                &ctx,
            )
            .unwrap();
        assert_eq!(
            result.as_string().map(|s| s.to_rust_string()).as_deref(),
            Some("boom")
        );
    }

    #[test]
    fn termination_unwinds_loops() {
        let iso = isolate();
        let handle = iso.handle();
        handle.terminate_execution();
        let ctx = iso.default_context().clone();
        let result = iso.eval("while (true) {}", "test.js", &ctx);
        assert!(matches!(result, Err(EngineError::Terminated)));
        handle.cancel_terminate();
        let result = iso.eval("1 + 1", "test.js", &ctx).unwrap();
        assert_eq!(result.as_number(), Some(2.0));
    }

    #[test]
    fn heap_limit_stops_runaway_strings() {
        let iso = Isolate::new(CreateParams {
            heap_limit: 256 * 1024,
            ..Default::default()
        })
        .unwrap();
        let ctx = iso.default_context().clone();
        let result = iso.eval("let s = 'a'; while (true) { s += s; }", "test.js", &ctx);
        assert!(matches!(result, Err(EngineError::OutOfMemory)));
        assert!(iso.hit_heap_limit());
    }

    #[test]
    fn async_function_settles_synchronously() {
        let iso = isolate();
        let ctx = iso.default_context().clone();
        let f = iso.eval("async () => 7", "test.js", &ctx).unwrap();
        let result = iso.call(&f, &Value::Undefined, &[]).unwrap();
        let promise = result.as_object().cloned().unwrap();
        let state = crate::promise::promise_state(&promise).unwrap();
        assert!(state.0);
        assert_eq!(state.1.as_number(), Some(7.0));
    }

    #[test]
    fn unhandled_rejection_recorded() {
        let iso = isolate();
        let ctx = iso.default_context().clone();
        iso.eval("Promise.reject(new Error('lost'))", "test.js", &ctx)
            .unwrap();
        iso.run_microtasks().unwrap();
        assert!(iso.take_unhandled_rejection().is_some());
    }

    #[test]
    fn persistent_round_trip() {
        let iso = isolate();
        let value = Value::Number(99.0);
        let handle = iso.make_persistent(&value);
        assert_eq!(iso.persistent_count(), 1);
        let back = iso.deref_persistent(&handle).unwrap();
        assert_eq!(back.as_number(), Some(99.0));
        iso.reset_persistent(handle);
        assert_eq!(iso.persistent_count(), 0);
    }

    #[test]
    fn interrupt_runs_at_safepoint() {
        let iso = isolate();
        let handle = iso.handle();
        handle.request_interrupt(Box::new(|iso| {
            // Terminate from inside the interrupt, like a timeout runner.
            iso.handle().terminate_execution();
        }));
        let ctx = iso.default_context().clone();
        let result = iso.eval("let i = 0; while (true) { i += 1; }", "test.js", &ctx);
        assert!(matches!(result, Err(EngineError::Terminated)));
    }

    #[test]
    fn buffers_and_views() {
        let iso = isolate();
        let ctx = iso.default_context().clone();
        let result = iso
            .eval(
                "let b = new ArrayBuffer(4); let v = new Uint8Array(b); v[0] = 7; v[3] = 255; v[3]",
                "test.js",
                &ctx,
            )
            .unwrap();
        assert_eq!(result.as_number(), Some(255.0));
    }

    #[test]
    fn detach_zeroes_length() {
        let iso = isolate();
        let buffer = iso.new_array_buffer(8).unwrap();
        let store = iso.detach_array_buffer(&buffer).unwrap();
        assert_eq!(store.read().len(), 8);
        match &buffer.borrow().kind {
            ObjectKind::ArrayBuffer(b) => assert_eq!(b.byte_length(), 0),
            _ => panic!("expected buffer"),
        }
    }
}
