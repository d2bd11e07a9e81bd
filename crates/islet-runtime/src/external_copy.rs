//! External copies: isolate-independent, out-of-heap representations of JS
//! values.
//!
//! Every copy records its payload size in a process-wide counter for
//! observability. Strings keep a shared backing vector so repeated
//! materializations reuse one host allocation; array buffers either copy
//! bytes or move their backing store outright (`transfer`), detaching the
//! source. Arbitrary object graphs go through the engine's structured-clone
//! serializer with side tables for nested transferables, transferred
//! buffers and shared buffers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use islet_engine as engine;
use parking_lot::Mutex;

use crate::error::{JsErrorCopy, RuntimeError, RuntimeResult};
use crate::scheduler::RunScope;
use crate::transfer::Transferable;

static TOTAL_EXTERNAL_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Total bytes currently held by external copies, process-wide.
pub fn total_external_size() -> usize {
    TOTAL_EXTERNAL_SIZE.load(Ordering::Acquire)
}

pub struct ExternalCopy {
    value: CopyValue,
    size: usize,
}

enum CopyValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Date(f64),
    BigInt(engine::JsBigInt),
    String(Arc<engine::StringData>),
    ArrayBuffer(ExternalBytes),
    SharedArrayBuffer(engine::BackingStore),
    View {
        buffer: Box<ExternalCopy>,
        ty: engine::ViewType,
        byte_offset: usize,
        byte_length: usize,
    },
    Serialized(SerializedCopy),
    Error(JsErrorCopy),
}

/// Backing bytes for an `ArrayBuffer` copy. `transfer_in` consumes the
/// store; plain copies clone it.
struct ExternalBytes {
    store: Mutex<Option<engine::BackingStore>>,
    length: usize,
}

struct SerializedCopy {
    bytes: Vec<u8>,
    references: Vec<Transferable>,
    array_buffers: Vec<ExternalCopy>,
    shared_buffers: Vec<ExternalCopy>,
}

impl ExternalCopy {
    fn new(value: CopyValue, size: usize) -> ExternalCopy {
        TOTAL_EXTERNAL_SIZE.fetch_add(size, Ordering::AcqRel);
        ExternalCopy { value, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    // ---- Host-side constructors ----

    pub fn undefined() -> ExternalCopy {
        ExternalCopy::new(CopyValue::Undefined, 0)
    }

    pub fn null() -> ExternalCopy {
        ExternalCopy::new(CopyValue::Null, 0)
    }

    pub fn boolean(value: bool) -> ExternalCopy {
        ExternalCopy::new(CopyValue::Bool(value), 0)
    }

    pub fn number(value: f64) -> ExternalCopy {
        ExternalCopy::new(CopyValue::Number(value), 8)
    }

    pub fn string(text: &str) -> ExternalCopy {
        let data = engine::StringData::from_str(text);
        let size = data.byte_len();
        ExternalCopy::new(CopyValue::String(Arc::new(data)), size)
    }

    /// An `ArrayBuffer` copy over host bytes.
    pub fn array_buffer(bytes: Vec<u8>) -> ExternalCopy {
        let length = bytes.len();
        ExternalCopy::new(
            CopyValue::ArrayBuffer(ExternalBytes {
                store: Mutex::new(Some(Arc::new(parking_lot::RwLock::new(bytes)))),
                length,
            }),
            length,
        )
    }

    // ---- Host-side accessors ----

    pub fn as_number(&self) -> Option<f64> {
        match &self.value {
            CopyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.value {
            CopyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match &self.value {
            CopyValue::String(data) => Some(match &**data {
                engine::StringData::OneByte(b) => b.iter().map(|&c| c as char).collect(),
                engine::StringData::TwoByte(u) => String::from_utf16_lossy(u),
            }),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.value, CopyValue::Undefined)
    }

    /// Length of an `ArrayBuffer` copy as created; survives a later
    /// transfer-out of the backing store.
    pub fn byte_length(&self) -> Option<usize> {
        match &self.value {
            CopyValue::ArrayBuffer(bytes) => Some(bytes.length),
            CopyValue::SharedArrayBuffer(store) => Some(store.read().len()),
            CopyValue::View { byte_length, .. } => Some(*byte_length),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Option<Vec<u8>> {
        match &self.value {
            CopyValue::ArrayBuffer(bytes) => {
                bytes.store.lock().as_ref().map(|s| s.read().clone())
            }
            CopyValue::SharedArrayBuffer(store) => Some(store.read().clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JsErrorCopy> {
        match &self.value {
            CopyValue::Error(copy) => Some(copy),
            _ => None,
        }
    }

    // ---- Copy out of an isolate ----

    /// Copy a value out of the entered isolate. `transfer_out` moves every
    /// array buffer; `transfer_list` moves just the listed ones.
    pub(crate) fn copy(
        scope: &RunScope<'_>,
        value: &engine::Value,
        transfer_out: bool,
        transfer_list: &[engine::Object],
    ) -> RuntimeResult<ExternalCopy> {
        if let Some(copy) = Self::copy_if_primitive(value) {
            return Ok(copy);
        }
        let Some(obj) = value.as_object() else {
            return Err(RuntimeError::type_error("A non-copyable value was passed"));
        };
        let shape = classify(obj);
        match shape {
            Classified::ArrayBuffer { shared: true } => {
                let store = shared_store(scope, obj)?;
                let size = store.read().len();
                Ok(ExternalCopy::new(CopyValue::SharedArrayBuffer(store), size))
            }
            Classified::ArrayBuffer { shared: false } => {
                let wants_transfer =
                    transfer_out || transfer_list.iter().any(|o| o.ptr_eq(obj));
                Self::copy_array_buffer(scope, obj, wants_transfer)
            }
            Classified::View {
                buffer,
                ty,
                byte_offset,
                byte_length,
            } => {
                let wants_transfer =
                    transfer_out || transfer_list.iter().any(|o| o.ptr_eq(&buffer));
                let buffer_copy = if buffer.is_shared_array_buffer() {
                    let store = shared_store(scope, &buffer)?;
                    let size = store.read().len();
                    ExternalCopy::new(CopyValue::SharedArrayBuffer(store), size)
                } else {
                    Self::copy_array_buffer(scope, &buffer, wants_transfer)?
                };
                Ok(ExternalCopy::new(
                    CopyValue::View {
                        buffer: Box::new(buffer_copy),
                        ty,
                        byte_offset,
                        byte_length,
                    },
                    byte_length,
                ))
            }
            Classified::Error => {
                let copy = copy_thrown_value(scope, value);
                Ok(ExternalCopy::new(CopyValue::Error(copy), 128))
            }
            Classified::Other => Self::copy_serialized(scope, value, transfer_list),
        }
    }

    /// Perfectly movable values: primitives, dates, bigints, strings.
    pub(crate) fn copy_if_primitive(value: &engine::Value) -> Option<ExternalCopy> {
        match value {
            engine::Value::Undefined => Some(ExternalCopy::undefined()),
            engine::Value::Null => Some(ExternalCopy::null()),
            engine::Value::Bool(b) => Some(ExternalCopy::boolean(*b)),
            engine::Value::Number(n) => Some(ExternalCopy::number(*n)),
            engine::Value::BigInt(b) => Some(ExternalCopy::new(
                CopyValue::BigInt(b.clone()),
                (b.bits() as usize) / 8 + 1,
            )),
            engine::Value::String(s) => {
                let data = s.data().clone();
                let size = data.byte_len();
                Some(ExternalCopy::new(
                    CopyValue::String(Arc::new(data)),
                    size,
                ))
            }
            engine::Value::Object(obj) => match &obj.borrow().kind {
                engine::ObjectKind::Date(ms) => {
                    Some(ExternalCopy::new(CopyValue::Date(*ms), 8))
                }
                _ => None,
            },
        }
    }

    fn copy_array_buffer(
        scope: &RunScope<'_>,
        buffer: &engine::Object,
        transfer: bool,
    ) -> RuntimeResult<ExternalCopy> {
        if transfer {
            let store = scope
                .iso
                .detach_array_buffer(buffer)
                .map_err(|e| runtime_error_from_engine(scope, e))?;
            let length = store.read().len();
            return Ok(ExternalCopy::new(
                CopyValue::ArrayBuffer(ExternalBytes {
                    store: Mutex::new(Some(store)),
                    length,
                }),
                length,
            ));
        }
        let bytes = {
            let data = buffer.borrow();
            let engine::ObjectKind::ArrayBuffer(b) = &data.kind else {
                return Err(RuntimeError::type_error("not an ArrayBuffer"));
            };
            match &b.store {
                Some(store) => store.read().clone(),
                None => {
                    return Err(RuntimeError::type_error(
                        "ArrayBuffer is detached",
                    ))
                }
            }
        };
        Ok(ExternalCopy::array_buffer(bytes))
    }

    fn copy_serialized(
        scope: &RunScope<'_>,
        value: &engine::Value,
        transfer_list: &[engine::Object],
    ) -> RuntimeResult<ExternalCopy> {
        let mut delegate = CopyOutDelegate {
            scope,
            transfer_list,
            references: Vec::new(),
            array_buffers: Vec::new(),
            shared_buffers: Vec::new(),
            error: None,
        };
        let bytes = engine::serialize(scope.iso, &mut delegate, value).map_err(|e| {
            delegate
                .error
                .take()
                .unwrap_or_else(|| runtime_error_from_engine(scope, e))
        })?;
        let size = bytes.len();
        Ok(ExternalCopy::new(
            CopyValue::Serialized(SerializedCopy {
                bytes,
                references: delegate.references,
                array_buffers: delegate.array_buffers,
                shared_buffers: delegate.shared_buffers,
            }),
            size,
        ))
    }

    // ---- Copy into an isolate ----

    /// Materialize the copy in the entered isolate. `transfer_in` moves the
    /// backing store of an `ArrayBuffer` copy instead of cloning bytes.
    pub(crate) fn copy_into(
        &self,
        scope: &RunScope<'_>,
        transfer_in: bool,
    ) -> RuntimeResult<engine::Value> {
        let map = |e| runtime_error_from_engine(scope, e);
        match &self.value {
            CopyValue::Undefined => Ok(engine::Value::Undefined),
            CopyValue::Null => Ok(engine::Value::Null),
            CopyValue::Bool(b) => Ok(engine::Value::Bool(*b)),
            CopyValue::Number(n) => Ok(engine::Value::Number(*n)),
            CopyValue::BigInt(b) => Ok(engine::Value::BigInt(b.clone())),
            CopyValue::Date(ms) => Ok(engine::Value::Object(
                scope
                    .iso
                    .alloc_object(engine::ObjectKind::Date(*ms))
                    .map_err(map)?,
            )),
            CopyValue::String(data) => Ok(engine::Value::String(
                scope.iso.alloc_string_data((**data).clone()).map_err(map)?,
            )),
            CopyValue::ArrayBuffer(bytes) => {
                let store = if transfer_in {
                    bytes.store.lock().take().ok_or_else(|| {
                        RuntimeError::generic("ArrayBuffer has already been transferred")
                    })?
                } else {
                    let guard = bytes.store.lock();
                    let store = guard.as_ref().ok_or_else(|| {
                        RuntimeError::generic("ArrayBuffer has already been transferred")
                    })?;
                    Arc::new(parking_lot::RwLock::new(store.read().clone()))
                };
                Ok(engine::Value::Object(
                    scope.iso.wrap_backing_store(store, false).map_err(map)?,
                ))
            }
            CopyValue::SharedArrayBuffer(store) => Ok(engine::Value::Object(
                scope
                    .iso
                    .wrap_backing_store(Arc::clone(store), true)
                    .map_err(map)?,
            )),
            CopyValue::View {
                buffer,
                ty,
                byte_offset,
                byte_length,
            } => {
                let inner = buffer.copy_into(scope, transfer_in)?;
                let Some(buffer_obj) = inner.as_object().cloned() else {
                    return Err(RuntimeError::type_error("view buffer did not materialize"));
                };
                Ok(engine::Value::Object(
                    scope
                        .iso
                        .alloc_object(engine::ObjectKind::View(engine::ViewData {
                            buffer: buffer_obj,
                            ty: *ty,
                            byte_offset: *byte_offset,
                            byte_length: *byte_length,
                        }))
                        .map_err(map)?,
                ))
            }
            CopyValue::Serialized(serialized) => {
                let mut delegate = CopyInDelegate {
                    outer: scope,
                    serialized,
                    error: None,
                };
                engine::deserialize(scope.iso, &mut delegate, &serialized.bytes).map_err(|e| {
                    delegate
                        .error
                        .take()
                        .unwrap_or_else(|| runtime_error_from_engine(scope, e))
                })
            }
            CopyValue::Error(copy) => {
                Ok(engine::Value::Object(materialize_error(scope, copy)?))
            }
        }
    }
}

impl Drop for ExternalCopy {
    fn drop(&mut self) {
        TOTAL_EXTERNAL_SIZE.fetch_sub(self.size, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ExternalCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.value {
            CopyValue::Undefined => "undefined",
            CopyValue::Null => "null",
            CopyValue::Bool(_) => "boolean",
            CopyValue::Number(_) => "number",
            CopyValue::Date(_) => "date",
            CopyValue::BigInt(_) => "bigint",
            CopyValue::String(_) => "string",
            CopyValue::ArrayBuffer(_) => "ArrayBuffer",
            CopyValue::SharedArrayBuffer(_) => "SharedArrayBuffer",
            CopyValue::View { .. } => "ArrayBufferView",
            CopyValue::Serialized(_) => "object",
            CopyValue::Error(_) => "error",
        };
        write!(f, "ExternalCopy({}, {} bytes)", kind, self.size)
    }
}

enum Classified {
    ArrayBuffer {
        shared: bool,
    },
    View {
        buffer: engine::Object,
        ty: engine::ViewType,
        byte_offset: usize,
        byte_length: usize,
    },
    Error,
    Other,
}

fn classify(obj: &engine::Object) -> Classified {
    let data = obj.borrow();
    match &data.kind {
        engine::ObjectKind::ArrayBuffer(b) => Classified::ArrayBuffer { shared: b.shared },
        engine::ObjectKind::View(v) => Classified::View {
            buffer: v.buffer.clone(),
            ty: v.ty,
            byte_offset: v.byte_offset,
            byte_length: v.byte_length,
        },
        engine::ObjectKind::Error(_) => Classified::Error,
        _ => Classified::Other,
    }
}

fn shared_store(
    scope: &RunScope<'_>,
    obj: &engine::Object,
) -> RuntimeResult<engine::BackingStore> {
    let _ = scope;
    let data = obj.borrow();
    let engine::ObjectKind::ArrayBuffer(b) = &data.kind else {
        return Err(RuntimeError::type_error("not a SharedArrayBuffer"));
    };
    b.store
        .clone()
        .ok_or_else(|| RuntimeError::type_error("SharedArrayBuffer is detached"))
}

/// Build an engine error object from a copied error, `stack` installed as a
/// non-enumerable property.
pub(crate) fn materialize_error(
    scope: &RunScope<'_>,
    copy: &JsErrorCopy,
) -> RuntimeResult<engine::Object> {
    let error = scope
        .iso
        .new_error(copy.kind, &copy.message)
        .map_err(|e| runtime_error_from_engine(scope, e))?;
    if copy.name != copy.kind.name() {
        let name = scope
            .iso
            .alloc_string(&copy.name)
            .map_err(|e| runtime_error_from_engine(scope, e))?;
        error.set_data("name", engine::Value::String(name));
    }
    if let Some(stack) = &copy.stack {
        let stack = scope
            .iso
            .alloc_string(stack)
            .map_err(|e| runtime_error_from_engine(scope, e))?;
        error.set_hidden("stack", engine::Value::String(stack));
    }
    Ok(error)
}

/// Copy a thrown value out of an isolate, preserving class, message and
/// stack when it is a real error.
pub(crate) fn copy_thrown_value(scope: &RunScope<'_>, value: &engine::Value) -> JsErrorCopy {
    let _ = scope;
    if let Some(obj) = value.as_object() {
        let kind = match &obj.borrow().kind {
            engine::ObjectKind::Error(kind) => Some(*kind),
            _ => None,
        };
        if let Some(kind) = kind {
            let read = |key: &str| -> Option<String> {
                match obj.get_own(key) {
                    Some(engine::Property::Data {
                        value: engine::Value::String(s),
                        ..
                    }) => Some(s.to_rust_string()),
                    _ => None,
                }
            };
            return JsErrorCopy {
                kind,
                name: read("name").unwrap_or_else(|| kind.name().to_string()),
                message: read("message").unwrap_or_default(),
                stack: read("stack"),
            };
        }
        return JsErrorCopy {
            kind: engine::ErrorKind::Error,
            name: "Error".to_string(),
            message: "An object was thrown from supplied code, but that object was not an \
                      instance of `Error`."
                .to_string(),
            stack: None,
        };
    }
    JsErrorCopy {
        kind: engine::ErrorKind::Error,
        name: "Error".to_string(),
        message: engine::value_to_display(value),
        stack: None,
    }
}

/// Translate an engine failure observed inside an isolate into the runtime
/// error taxonomy.
pub(crate) fn runtime_error_from_engine(
    scope: &RunScope<'_>,
    error: engine::EngineError,
) -> RuntimeError {
    match error {
        engine::EngineError::Thrown(value) => {
            RuntimeError::Js(copy_thrown_value(scope, &value))
        }
        engine::EngineError::Terminated => {
            if scope
                .env
                .hit_memory_limit
                .load(std::sync::atomic::Ordering::Acquire)
            {
                RuntimeError::fatal("Isolate was disposed during execution due to memory limit")
            } else {
                RuntimeError::fatal("Isolate was disposed during execution")
            }
        }
        engine::EngineError::OutOfMemory => {
            scope
                .env
                .hit_memory_limit
                .store(true, std::sync::atomic::Ordering::Release);
            RuntimeError::fatal("Isolate was disposed during execution due to memory limit")
        }
        engine::EngineError::Syntax(message) => RuntimeError::Js(JsErrorCopy {
            kind: engine::ErrorKind::SyntaxError,
            name: "SyntaxError".to_string(),
            message,
            stack: None,
        }),
        engine::EngineError::DataClone(message) => RuntimeError::type_error(message),
    }
}

// ---- Structured-clone delegates ----

struct CopyOutDelegate<'a, 'b> {
    scope: &'a RunScope<'b>,
    transfer_list: &'a [engine::Object],
    references: Vec<Transferable>,
    array_buffers: Vec<ExternalCopy>,
    shared_buffers: Vec<ExternalCopy>,
    error: Option<RuntimeError>,
}

impl engine::SerializerDelegate for CopyOutDelegate<'_, '_> {
    fn write_host_object(
        &mut self,
        _iso: &engine::Isolate,
        object: &engine::Object,
    ) -> engine::Completion<Option<u32>> {
        let instance = self.scope.env.instances.lock().get(&object.id()).cloned();
        match instance {
            Some(instance) => match instance.transfer_out_nested() {
                Ok(transferable) => {
                    self.references.push(transferable);
                    Ok(Some(self.references.len() as u32 - 1))
                }
                Err(e) => {
                    self.error = Some(e);
                    Err(engine::EngineError::DataClone(
                        "handle could not be transferred".to_string(),
                    ))
                }
            },
            None => Ok(None),
        }
    }

    fn array_buffer_transfer_id(
        &mut self,
        iso: &engine::Isolate,
        object: &engine::Object,
    ) -> Option<u32> {
        if !self.transfer_list.iter().any(|o| o.ptr_eq(object)) {
            return None;
        }
        match iso.detach_array_buffer(object) {
            Ok(store) => {
                let length = store.read().len();
                self.array_buffers.push(ExternalCopy::new(
                    CopyValue::ArrayBuffer(ExternalBytes {
                        store: Mutex::new(Some(store)),
                        length,
                    }),
                    length,
                ));
                Some(self.array_buffers.len() as u32 - 1)
            }
            Err(_) => None,
        }
    }

    fn shared_array_buffer_id(
        &mut self,
        iso: &engine::Isolate,
        object: &engine::Object,
    ) -> engine::Completion<u32> {
        match shared_store(self.scope, object) {
            Ok(store) => {
                let size = store.read().len();
                self.shared_buffers
                    .push(ExternalCopy::new(CopyValue::SharedArrayBuffer(store), size));
                Ok(self.shared_buffers.len() as u32 - 1)
            }
            Err(_) => Err(iso.throw_type_error("SharedArrayBuffer is detached")),
        }
    }
}

struct CopyInDelegate<'a, 'b> {
    outer: &'a RunScope<'b>,
    serialized: &'a SerializedCopy,
    error: Option<RuntimeError>,
}

impl engine::DeserializerDelegate for CopyInDelegate<'_, '_> {
    fn read_host_object(
        &mut self,
        iso: &engine::Isolate,
        index: u32,
    ) -> engine::Completion<engine::Value> {
        match self.serialized.references.get(index as usize) {
            Some(transferable) => match transferable.transfer_in(self.outer) {
                Ok(value) => Ok(value),
                Err(e) => {
                    self.error = Some(e);
                    Err(iso.throw_type_error("nested handle failed to transfer"))
                }
            },
            None => Err(iso.throw_type_error("malformed serialized data")),
        }
    }

    fn transferred_array_buffer(
        &mut self,
        iso: &engine::Isolate,
        index: u32,
    ) -> engine::Completion<engine::Value> {
        match self.serialized.array_buffers.get(index as usize) {
            Some(copy) => match copy.copy_into(self.outer, true) {
                Ok(value) => Ok(value),
                Err(e) => {
                    self.error = Some(e);
                    Err(iso.throw_type_error("transferred ArrayBuffer failed to materialize"))
                }
            },
            None => Err(iso.throw_type_error("malformed serialized data")),
        }
    }

    fn shared_array_buffer(
        &mut self,
        iso: &engine::Isolate,
        index: u32,
    ) -> engine::Completion<engine::Value> {
        match self.serialized.shared_buffers.get(index as usize) {
            Some(copy) => match copy.copy_into(self.outer, false) {
                Ok(value) => Ok(value),
                Err(e) => {
                    self.error = Some(e);
                    Err(iso.throw_type_error("SharedArrayBuffer failed to materialize"))
                }
            },
            None => Err(iso.throw_type_error("malformed serialized data")),
        }
    }
}
