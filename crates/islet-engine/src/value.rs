//! JavaScript values and the object representation.
//!
//! Values are local to the isolate that allocated them and are deliberately
//! `!Send`; cross-isolate movement goes through persistent handles and the
//! embedder's transfer layer. Identity for objects is `Rc` pointer identity.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use num_bigint::BigInt;
use parking_lot::RwLock;

use crate::ast::{FunctionLiteral, Program};
use crate::error::{Completion, EngineError};
use crate::heap::{Heap, HeapCharge};
use crate::interp::ScopeRef;
use crate::module::ModuleRecord;
use crate::promise::PromiseData;

/// A JavaScript value.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(BigInt),
    String(JsString),
    Object(Object),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&JsString> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Object(o) if o.is_function())
    }

    pub fn is_promise(&self) -> bool {
        matches!(self, Value::Object(o) if matches!(o.borrow().kind, ObjectKind::Promise(_)))
    }

    /// The `typeof` operator.
    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Object(o) => {
                if o.is_function() {
                    "function"
                } else {
                    "object"
                }
            }
        }
    }

    /// Strict (`===`) equality.
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// ToBoolean.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::BigInt(b) => *b != BigInt::from(0),
            Value::String(s) => s.len_units() != 0,
            Value::Object(_) => true,
        }
    }
}

/// Format a number the way JS `String(n)` does, near enough: integers render
/// without a fraction, everything else uses the shortest round-trip form.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        let mut buf = itoa::Buffer::new();
        return buf.format(n as i64).to_string();
    }
    let mut buf = ryu::Buffer::new();
    buf.format(n).to_string()
}

/// An immutable JS string with width-aware storage: latin-1 when every code
/// unit fits in a byte, UTF-16 otherwise. Clones share one allocation.
#[derive(Clone)]
pub struct JsString {
    repr: Rc<StringRepr>,
}

pub(crate) struct StringRepr {
    pub data: StringData,
    pub(crate) _charge: Option<HeapCharge>,
}

#[derive(Clone, Debug)]
pub enum StringData {
    OneByte(Vec<u8>),
    TwoByte(Vec<u16>),
}

impl JsString {
    pub(crate) fn alloc(heap: &Rc<Heap>, text: &str) -> Completion<JsString> {
        let data = StringData::from_str(text);
        Self::alloc_data(heap, data)
    }

    pub(crate) fn alloc_data(heap: &Rc<Heap>, data: StringData) -> Completion<JsString> {
        let bytes = data.byte_len();
        let charge = heap.charge(bytes)?;
        Ok(JsString {
            repr: Rc::new(StringRepr {
                data,
                _charge: Some(charge),
            }),
        })
    }

    pub fn data(&self) -> &StringData {
        &self.repr.data
    }

    pub fn is_one_byte(&self) -> bool {
        matches!(self.repr.data, StringData::OneByte(_))
    }

    /// Number of UTF-16 code units (JS `length`).
    pub fn len_units(&self) -> usize {
        match &self.repr.data {
            StringData::OneByte(b) => b.len(),
            StringData::TwoByte(u) => u.len(),
        }
    }

    pub fn to_rust_string(&self) -> String {
        match &self.repr.data {
            StringData::OneByte(b) => b.iter().map(|&c| c as char).collect(),
            StringData::TwoByte(u) => String::from_utf16_lossy(u),
        }
    }

    /// Code units as u16, regardless of storage width.
    pub fn code_units(&self) -> Vec<u16> {
        match &self.repr.data {
            StringData::OneByte(b) => b.iter().map(|&c| c as u16).collect(),
            StringData::TwoByte(u) => u.clone(),
        }
    }
}

impl StringData {
    pub fn from_str(text: &str) -> StringData {
        if text.chars().all(|c| (c as u32) < 0x100) {
            StringData::OneByte(text.chars().map(|c| c as u8).collect())
        } else {
            StringData::TwoByte(text.encode_utf16().collect())
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            StringData::OneByte(b) => b.len(),
            StringData::TwoByte(u) => u.len() * 2,
        }
    }
}

impl PartialEq for JsString {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.repr, &other.repr) {
            return true;
        }
        self.code_units() == other.code_units()
    }
}

impl Eq for JsString {}

impl fmt::Debug for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_rust_string())
    }
}

impl fmt::Display for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rust_string())
    }
}

/// A heap object. Cheap to clone; identity is pointer identity.
#[derive(Clone)]
pub struct Object {
    inner: Rc<RefCell<ObjectData>>,
}

impl Object {
    pub(crate) fn alloc(heap: &Rc<Heap>, kind: ObjectKind, prototype: Option<Object>) -> Completion<Object> {
        // Flat cost per object; property storage is charged to the same
        // account lazily via the IndexMap's own growth being tiny in practice.
        let charge = heap.charge(64 + kind.extra_bytes())?;
        Ok(Object {
            inner: Rc::new(RefCell::new(ObjectData {
                kind,
                properties: IndexMap::new(),
                prototype,
                extensible: true,
                _charge: Some(charge),
            })),
        })
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable identity for maps keyed by object.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    pub fn borrow(&self) -> Ref<'_, ObjectData> {
        self.inner.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, ObjectData> {
        self.inner.borrow_mut()
    }

    pub fn is_function(&self) -> bool {
        matches!(self.borrow().kind, ObjectKind::Function(_))
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.borrow().kind, ObjectKind::Proxy(_))
    }

    pub fn is_array_buffer(&self) -> bool {
        matches!(self.borrow().kind, ObjectKind::ArrayBuffer(ref b) if !b.shared)
    }

    pub fn is_shared_array_buffer(&self) -> bool {
        matches!(self.borrow().kind, ObjectKind::ArrayBuffer(ref b) if b.shared)
    }

    pub fn prototype(&self) -> Option<Object> {
        self.borrow().prototype.clone()
    }

    /// Own property lookup, data and accessor alike.
    pub fn get_own(&self, key: &str) -> Option<Property> {
        self.borrow().properties.get(key).cloned()
    }

    pub fn has_own(&self, key: &str) -> bool {
        self.borrow().properties.contains_key(key)
    }

    /// Define or overwrite a plain enumerable data property.
    pub fn set_data(&self, key: &str, value: Value) {
        self.borrow_mut().properties.insert(
            key.to_string(),
            Property::Data {
                value,
                enumerable: true,
            },
        );
    }

    /// Define a non-enumerable data property (used for `stack` on errors).
    pub fn set_hidden(&self, key: &str, value: Value) {
        self.borrow_mut().properties.insert(
            key.to_string(),
            Property::Data {
                value,
                enumerable: false,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.borrow_mut().properties.shift_remove(key).is_some()
    }

    /// Enumerable own data-property keys, in insertion order.
    pub fn own_keys(&self) -> Vec<String> {
        self.borrow()
            .properties
            .iter()
            .filter(|(_, p)| matches!(p, Property::Data { enumerable: true, .. }))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(data) => write!(f, "Object({:p}, {})", Rc::as_ptr(&self.inner), data.kind.name()),
            Err(_) => write!(f, "Object({:p}, <borrowed>)", Rc::as_ptr(&self.inner)),
        }
    }
}

pub struct ObjectData {
    pub kind: ObjectKind,
    pub properties: IndexMap<String, Property>,
    pub prototype: Option<Object>,
    pub extensible: bool,
    pub(crate) _charge: Option<HeapCharge>,
}

#[derive(Clone, Debug)]
pub enum Property {
    Data { value: Value, enumerable: bool },
    Accessor { get: Option<Value>, set: Option<Value> },
}

/// What an object *is*, beyond its named properties.
pub enum ObjectKind {
    Plain,
    Array(Vec<Value>),
    Function(FunctionData),
    Error(ErrorKind),
    Date(f64),
    Promise(PromiseData),
    ArrayBuffer(BufferData),
    View(ViewData),
    Proxy(ProxyData),
    Module(Rc<RefCell<ModuleRecord>>),
    Script(Rc<ParsedScript>),
}

impl ObjectKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObjectKind::Plain => "Object",
            ObjectKind::Array(_) => "Array",
            ObjectKind::Function(_) => "Function",
            ObjectKind::Error(_) => "Error",
            ObjectKind::Date(_) => "Date",
            ObjectKind::Promise(_) => "Promise",
            ObjectKind::ArrayBuffer(b) => {
                if b.shared {
                    "SharedArrayBuffer"
                } else {
                    "ArrayBuffer"
                }
            }
            ObjectKind::View(_) => "TypedArray",
            ObjectKind::Proxy(_) => "Proxy",
            ObjectKind::Module(_) => "Module",
            ObjectKind::Script(_) => "Script",
        }
    }

    fn extra_bytes(&self) -> usize {
        match self {
            ObjectKind::Array(items) => items.len() * 16,
            _ => 0,
        }
    }
}

impl fmt::Debug for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A compiled-but-unbound script: a parsed program plus its origin name.
#[derive(Debug)]
pub struct ParsedScript {
    pub program: Rc<Program>,
    pub origin: String,
}

pub struct FunctionData {
    pub name: String,
    pub length: u32,
    pub kind: FnKind,
}

pub enum FnKind {
    Script(ScriptFnData),
    Native(NativeFn),
}

pub struct ScriptFnData {
    pub literal: Rc<FunctionLiteral>,
    pub env: ScopeRef,
    /// The global object of the context the function was created in.
    pub global: Object,
    /// Arrows capture the `this` of their defining scope.
    pub captured_this: Option<Box<Value>>,
}

/// Host-implemented function. Receives the isolate, the receiver, and the
/// argument list.
pub type NativeFn = Rc<dyn Fn(&crate::isolate::Isolate, &Value, &[Value]) -> Completion>;

impl fmt::Debug for FnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FnKind::Script(_) => f.write_str("FnKind::Script"),
            FnKind::Native(_) => f.write_str("FnKind::Native"),
        }
    }
}

/// Error classes the engine knows how to construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    Custom,
}

impl ErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error | ErrorKind::Custom => "Error",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::TypeError => "TypeError",
        }
    }

    pub fn from_name(name: &str) -> Option<ErrorKind> {
        match name {
            "Error" => Some(ErrorKind::Error),
            "RangeError" => Some(ErrorKind::RangeError),
            "ReferenceError" => Some(ErrorKind::ReferenceError),
            "SyntaxError" => Some(ErrorKind::SyntaxError),
            "TypeError" => Some(ErrorKind::TypeError),
            _ => None,
        }
    }
}

/// Raw bytes behind an `ArrayBuffer` / `SharedArrayBuffer`. The store is
/// host-shareable so external copies and other isolates can hold it without
/// touching this isolate's heap. `store == None` means detached.
pub struct BufferData {
    pub store: Option<BackingStore>,
    pub shared: bool,
    /// Accounting ticket against the embedder's array-buffer allocator;
    /// dropped when the buffer is detached or collected.
    pub(crate) allocation: Option<crate::isolate::AllocationTicket>,
}

pub type BackingStore = Arc<RwLock<Vec<u8>>>;

impl BufferData {
    pub fn byte_length(&self) -> usize {
        self.store.as_ref().map(|s| s.read().len()).unwrap_or(0)
    }
}

/// Typed-array view classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewType {
    Uint8,
    Uint8Clamped,
    Int8,
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Float64,
    DataView,
}

impl ViewType {
    pub fn element_size(self) -> usize {
        match self {
            ViewType::Uint8 | ViewType::Uint8Clamped | ViewType::Int8 | ViewType::DataView => 1,
            ViewType::Uint16 | ViewType::Int16 => 2,
            ViewType::Uint32 | ViewType::Int32 | ViewType::Float32 => 4,
            ViewType::Float64 => 8,
        }
    }
}

pub struct ViewData {
    pub buffer: Object,
    pub ty: ViewType,
    pub byte_offset: usize,
    pub byte_length: usize,
}

pub struct ProxyData {
    pub target: Value,
    pub handler: Object,
}

/// Convenience: build an error object outside the isolate API. Used by the
/// isolate itself and by builtins.
pub(crate) fn alloc_error(
    heap: &Rc<Heap>,
    kind: ErrorKind,
    message: &str,
) -> Result<Object, EngineError> {
    let obj = Object::alloc(heap, ObjectKind::Error(kind), None)?;
    let name = JsString::alloc(heap, kind.name())?;
    let msg = JsString::alloc(heap, message)?;
    obj.set_data("name", Value::String(name));
    obj.set_data("message", Value::String(msg));
    Ok(obj)
}

/// Build an `EngineError::Thrown` with a fresh error object, falling back to
/// the out-of-memory condition when even the error cannot be allocated.
pub(crate) fn throw_error(heap: &Rc<Heap>, kind: ErrorKind, message: &str) -> EngineError {
    match alloc_error(heap, kind, message) {
        Ok(obj) => EngineError::Thrown(Value::Object(obj)),
        Err(e) => e,
    }
}
