//! Structured clone: a tag-based serializer/deserializer over value graphs.
//!
//! Cycles are preserved through back-references. Array buffers, shared
//! buffers and host objects are delegated to the embedder through side
//! tables, mirroring the serializer-delegate contract of engine embeddings.

use rustc_hash::FxHashMap;

use crate::error::{Completion, EngineError};
use crate::isolate::Isolate;
use crate::value::{
    ErrorKind, Object, ObjectKind, Property, StringData, Value, ViewData, ViewType,
};

const TAG_UNDEFINED: u8 = 0;
const TAG_NULL: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_FALSE: u8 = 3;
const TAG_NUMBER: u8 = 4;
const TAG_BIGINT: u8 = 5;
const TAG_STRING_ONE_BYTE: u8 = 6;
const TAG_STRING_TWO_BYTE: u8 = 7;
const TAG_OBJECT: u8 = 8;
const TAG_BACKREF: u8 = 9;
const TAG_ARRAY: u8 = 10;
const TAG_DATE: u8 = 11;
const TAG_ERROR: u8 = 12;
const TAG_ARRAY_BUFFER: u8 = 13;
const TAG_TRANSFERRED_BUFFER: u8 = 14;
const TAG_SHARED_BUFFER: u8 = 15;
const TAG_VIEW: u8 = 16;
const TAG_HOST_OBJECT: u8 = 17;

/// Embedder hooks consulted while serializing.
pub trait SerializerDelegate {
    /// First crack at any object the structural walk does not own. Return
    /// `Some(index)` to encode a host-object reference.
    fn write_host_object(&mut self, iso: &Isolate, object: &Object) -> Completion<Option<u32>>;

    /// Return the transfer-list index for an `ArrayBuffer` being moved
    /// rather than copied, or `None` to copy its bytes inline.
    fn array_buffer_transfer_id(&mut self, iso: &Isolate, object: &Object) -> Option<u32>;

    /// Register a `SharedArrayBuffer` and return its side-table index.
    fn shared_array_buffer_id(&mut self, iso: &Isolate, object: &Object) -> Completion<u32>;
}

/// Embedder hooks consulted while deserializing.
pub trait DeserializerDelegate {
    fn read_host_object(&mut self, iso: &Isolate, index: u32) -> Completion<Value>;
    fn transferred_array_buffer(&mut self, iso: &Isolate, index: u32) -> Completion<Value>;
    fn shared_array_buffer(&mut self, iso: &Isolate, index: u32) -> Completion<Value>;
}

/// A delegate that refuses host objects and buffer side-channels; useful for
/// self-contained blobs such as snapshots.
pub struct DenyDelegate;

impl SerializerDelegate for DenyDelegate {
    fn write_host_object(&mut self, _iso: &Isolate, _object: &Object) -> Completion<Option<u32>> {
        Ok(None)
    }

    fn array_buffer_transfer_id(&mut self, _iso: &Isolate, _object: &Object) -> Option<u32> {
        None
    }

    fn shared_array_buffer_id(&mut self, iso: &Isolate, _object: &Object) -> Completion<u32> {
        Err(iso.throw_type_error("SharedArrayBuffer cannot be serialized here"))
    }
}

impl DeserializerDelegate for DenyDelegate {
    fn read_host_object(&mut self, iso: &Isolate, _index: u32) -> Completion<Value> {
        Err(iso.throw_type_error("unexpected host object"))
    }

    fn transferred_array_buffer(&mut self, iso: &Isolate, _index: u32) -> Completion<Value> {
        Err(iso.throw_type_error("unexpected transferred ArrayBuffer"))
    }

    fn shared_array_buffer(&mut self, iso: &Isolate, _index: u32) -> Completion<Value> {
        Err(iso.throw_type_error("unexpected SharedArrayBuffer"))
    }
}

pub struct ValueSerializer<'a, D: SerializerDelegate + ?Sized> {
    iso: &'a Isolate,
    delegate: &'a mut D,
    out: Vec<u8>,
    seen: FxHashMap<usize, u32>,
    next_id: u32,
}

impl<'a, D: SerializerDelegate + ?Sized> ValueSerializer<'a, D> {
    pub fn new(iso: &'a Isolate, delegate: &'a mut D) -> Self {
        ValueSerializer {
            iso,
            delegate,
            out: Vec::new(),
            seen: FxHashMap::default(),
            next_id: 0,
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }

    fn put_u32(&mut self, n: u32) {
        self.out.extend_from_slice(&n.to_le_bytes());
    }

    fn put_utf8(&mut self, text: &str) {
        self.put_u32(text.len() as u32);
        self.out.extend_from_slice(text.as_bytes());
    }

    pub fn write_value(&mut self, value: &Value) -> Completion<()> {
        match value {
            Value::Undefined => self.out.push(TAG_UNDEFINED),
            Value::Null => self.out.push(TAG_NULL),
            Value::Bool(true) => self.out.push(TAG_TRUE),
            Value::Bool(false) => self.out.push(TAG_FALSE),
            Value::Number(n) => {
                self.out.push(TAG_NUMBER);
                self.out.extend_from_slice(&n.to_le_bytes());
            }
            Value::BigInt(b) => {
                self.out.push(TAG_BIGINT);
                let (sign, bytes) = b.to_bytes_le();
                self.out.push(match sign {
                    num_bigint::Sign::Minus => 0,
                    _ => 1,
                });
                self.put_u32(bytes.len() as u32);
                self.out.extend_from_slice(&bytes);
            }
            Value::String(s) => match s.data() {
                StringData::OneByte(bytes) => {
                    self.out.push(TAG_STRING_ONE_BYTE);
                    self.put_u32(bytes.len() as u32);
                    self.out.extend_from_slice(bytes);
                }
                StringData::TwoByte(units) => {
                    self.out.push(TAG_STRING_TWO_BYTE);
                    self.put_u32(units.len() as u32);
                    for unit in units {
                        self.out.extend_from_slice(&unit.to_le_bytes());
                    }
                }
            },
            Value::Object(obj) => self.write_object(obj)?,
        }
        Ok(())
    }

    fn write_object(&mut self, obj: &Object) -> Completion<()> {
        if let Some(id) = self.seen.get(&obj.id()) {
            let id = *id;
            self.out.push(TAG_BACKREF);
            self.put_u32(id);
            return Ok(());
        }

        enum Shape {
            Plain,
            Array(Vec<Value>),
            Date(f64),
            Error(ErrorKind),
            Buffer { shared: bool },
            View(Object, ViewType, usize, usize),
            Other,
        }
        let shape = {
            let data = obj.borrow();
            match &data.kind {
                ObjectKind::Plain => Shape::Plain,
                ObjectKind::Array(items) => Shape::Array(items.clone()),
                ObjectKind::Date(ms) => Shape::Date(*ms),
                ObjectKind::Error(kind) => Shape::Error(*kind),
                ObjectKind::ArrayBuffer(b) => Shape::Buffer { shared: b.shared },
                ObjectKind::View(ViewData {
                    buffer,
                    ty,
                    byte_offset,
                    byte_length,
                }) => Shape::View(buffer.clone(), *ty, *byte_offset, *byte_length),
                _ => Shape::Other,
            }
        };

        match shape {
            Shape::Buffer { shared: true } => {
                let index = self.delegate.shared_array_buffer_id(self.iso, obj)?;
                self.out.push(TAG_SHARED_BUFFER);
                self.put_u32(index);
                Ok(())
            }
            Shape::Buffer { shared: false } => {
                if let Some(index) = self.delegate.array_buffer_transfer_id(self.iso, obj) {
                    self.out.push(TAG_TRANSFERRED_BUFFER);
                    self.put_u32(index);
                    return Ok(());
                }
                let bytes = {
                    let data = obj.borrow();
                    let ObjectKind::ArrayBuffer(b) = &data.kind else {
                        return Err(self.iso.throw_type_error("buffer changed shape"));
                    };
                    match &b.store {
                        Some(store) => store.read().clone(),
                        None => {
                            return Err(self
                                .iso
                                .throw_type_error("An ArrayBuffer is detached and was not transferred"))
                        }
                    }
                };
                self.out.push(TAG_ARRAY_BUFFER);
                self.put_u32(bytes.len() as u32);
                self.out.extend_from_slice(&bytes);
                Ok(())
            }
            Shape::View(buffer, ty, byte_offset, byte_length) => {
                self.out.push(TAG_VIEW);
                self.out.push(view_type_code(ty));
                self.put_u32(byte_offset as u32);
                self.put_u32(byte_length as u32);
                self.write_object(&buffer)
            }
            Shape::Plain => {
                if let Some(index) = self.delegate.write_host_object(self.iso, obj)? {
                    self.out.push(TAG_HOST_OBJECT);
                    self.put_u32(index);
                    return Ok(());
                }
                let id = self.assign_id(obj);
                self.out.push(TAG_OBJECT);
                self.put_u32(id);
                let entries = own_data_entries(obj);
                self.put_u32(entries.len() as u32);
                for (key, value) in entries {
                    self.put_utf8(&key);
                    self.write_value(&value)?;
                }
                Ok(())
            }
            Shape::Array(items) => {
                let id = self.assign_id(obj);
                self.out.push(TAG_ARRAY);
                self.put_u32(id);
                self.put_u32(items.len() as u32);
                for item in &items {
                    self.write_value(item)?;
                }
                let entries = own_data_entries(obj);
                self.put_u32(entries.len() as u32);
                for (key, value) in entries {
                    self.put_utf8(&key);
                    self.write_value(&value)?;
                }
                Ok(())
            }
            Shape::Date(ms) => {
                self.out.push(TAG_DATE);
                self.out.extend_from_slice(&ms.to_le_bytes());
                Ok(())
            }
            Shape::Error(kind) => {
                self.out.push(TAG_ERROR);
                self.out.push(error_kind_code(kind));
                for key in ["name", "message", "stack"] {
                    match obj.get_own(key) {
                        Some(Property::Data {
                            value: Value::String(s),
                            ..
                        }) => {
                            self.out.push(1);
                            self.put_utf8(&s.to_rust_string());
                        }
                        _ => self.out.push(0),
                    }
                }
                Ok(())
            }
            Shape::Other => {
                if let Some(index) = self.delegate.write_host_object(self.iso, obj)? {
                    self.out.push(TAG_HOST_OBJECT);
                    self.put_u32(index);
                    return Ok(());
                }
                let name = obj.borrow().kind.name();
                Err(EngineError::DataClone(format!(
                    "{} could not be cloned",
                    name
                )))
            }
        }
    }

    fn assign_id(&mut self, obj: &Object) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.seen.insert(obj.id(), id);
        id
    }
}

fn own_data_entries(obj: &Object) -> Vec<(String, Value)> {
    obj.borrow()
        .properties
        .iter()
        .filter_map(|(k, p)| match p {
            Property::Data {
                value,
                enumerable: true,
            } => Some((k.clone(), value.clone())),
            _ => None,
        })
        .collect()
}

fn view_type_code(ty: ViewType) -> u8 {
    match ty {
        ViewType::Uint8 => 0,
        ViewType::Uint8Clamped => 1,
        ViewType::Int8 => 2,
        ViewType::Uint16 => 3,
        ViewType::Int16 => 4,
        ViewType::Uint32 => 5,
        ViewType::Int32 => 6,
        ViewType::Float32 => 7,
        ViewType::Float64 => 8,
        ViewType::DataView => 9,
    }
}

fn view_type_from_code(code: u8) -> Option<ViewType> {
    Some(match code {
        0 => ViewType::Uint8,
        1 => ViewType::Uint8Clamped,
        2 => ViewType::Int8,
        3 => ViewType::Uint16,
        4 => ViewType::Int16,
        5 => ViewType::Uint32,
        6 => ViewType::Int32,
        7 => ViewType::Float32,
        8 => ViewType::Float64,
        9 => ViewType::DataView,
        _ => return None,
    })
}

fn error_kind_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Error => 0,
        ErrorKind::RangeError => 1,
        ErrorKind::ReferenceError => 2,
        ErrorKind::SyntaxError => 3,
        ErrorKind::TypeError => 4,
        ErrorKind::Custom => 5,
    }
}

fn error_kind_from_code(code: u8) -> ErrorKind {
    match code {
        1 => ErrorKind::RangeError,
        2 => ErrorKind::ReferenceError,
        3 => ErrorKind::SyntaxError,
        4 => ErrorKind::TypeError,
        5 => ErrorKind::Custom,
        _ => ErrorKind::Error,
    }
}

pub struct ValueDeserializer<'a, D: DeserializerDelegate + ?Sized> {
    iso: &'a Isolate,
    delegate: &'a mut D,
    bytes: &'a [u8],
    pos: usize,
    objects: FxHashMap<u32, Object>,
}

impl<'a, D: DeserializerDelegate + ?Sized> ValueDeserializer<'a, D> {
    pub fn new(iso: &'a Isolate, delegate: &'a mut D, bytes: &'a [u8]) -> Self {
        ValueDeserializer {
            iso,
            delegate,
            bytes,
            pos: 0,
            objects: FxHashMap::default(),
        }
    }

    fn corrupt(&self) -> EngineError {
        self.iso.throw_type_error("malformed serialized data")
    }

    fn take(&mut self, n: usize) -> Completion<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(self.corrupt());
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Completion<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Completion<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_f64(&mut self) -> Completion<f64> {
        let b = self.take(8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn take_utf8(&mut self) -> Completion<String> {
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.corrupt())
    }

    pub fn read_value(&mut self) -> Completion<Value> {
        match self.take_u8()? {
            TAG_UNDEFINED => Ok(Value::Undefined),
            TAG_NULL => Ok(Value::Null),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_NUMBER => Ok(Value::Number(self.take_f64()?)),
            TAG_BIGINT => {
                let sign = if self.take_u8()? == 0 {
                    num_bigint::Sign::Minus
                } else {
                    num_bigint::Sign::Plus
                };
                let len = self.take_u32()? as usize;
                let bytes = self.take(len)?;
                let magnitude = num_bigint::BigInt::from_bytes_le(num_bigint::Sign::Plus, bytes);
                let value = match sign {
                    num_bigint::Sign::Minus => -magnitude,
                    _ => magnitude,
                };
                Ok(Value::BigInt(value))
            }
            TAG_STRING_ONE_BYTE => {
                let len = self.take_u32()? as usize;
                let bytes = self.take(len)?.to_vec();
                Ok(Value::String(
                    self.iso.alloc_string_data(StringData::OneByte(bytes))?,
                ))
            }
            TAG_STRING_TWO_BYTE => {
                let len = self.take_u32()? as usize;
                let raw = self.take(len * 2)?;
                let units = raw
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                Ok(Value::String(
                    self.iso.alloc_string_data(StringData::TwoByte(units))?,
                ))
            }
            TAG_BACKREF => {
                let id = self.take_u32()?;
                self.objects
                    .get(&id)
                    .cloned()
                    .map(Value::Object)
                    .ok_or_else(|| self.corrupt())
            }
            TAG_OBJECT => {
                let id = self.take_u32()?;
                let obj = self.iso.alloc_object(ObjectKind::Plain)?;
                self.objects.insert(id, obj.clone());
                let count = self.take_u32()?;
                for _ in 0..count {
                    let key = self.take_utf8()?;
                    let value = self.read_value()?;
                    obj.set_data(&key, value);
                }
                Ok(Value::Object(obj))
            }
            TAG_ARRAY => {
                let id = self.take_u32()?;
                let len = self.take_u32()? as usize;
                let obj = self.iso.alloc_object(ObjectKind::Array(Vec::new()))?;
                self.objects.insert(id, obj.clone());
                for _ in 0..len {
                    let item = self.read_value()?;
                    if let ObjectKind::Array(items) = &mut obj.borrow_mut().kind {
                        items.push(item);
                    }
                }
                let count = self.take_u32()?;
                for _ in 0..count {
                    let key = self.take_utf8()?;
                    let value = self.read_value()?;
                    obj.set_data(&key, value);
                }
                Ok(Value::Object(obj))
            }
            TAG_DATE => {
                let ms = self.take_f64()?;
                Ok(Value::Object(self.iso.alloc_object(ObjectKind::Date(ms))?))
            }
            TAG_ERROR => {
                let kind = error_kind_from_code(self.take_u8()?);
                let mut parts: [Option<String>; 3] = [None, None, None];
                for slot in parts.iter_mut() {
                    if self.take_u8()? == 1 {
                        *slot = Some(self.take_utf8()?);
                    }
                }
                let [name, message, stack] = parts;
                let error = crate::value::alloc_error(
                    self.iso.heap(),
                    kind,
                    message.as_deref().unwrap_or(""),
                )?;
                if let Some(name) = name {
                    error.set_data("name", Value::String(self.iso.alloc_string(&name)?));
                }
                if let Some(stack) = stack {
                    error.set_hidden("stack", Value::String(self.iso.alloc_string(&stack)?));
                }
                Ok(Value::Object(error))
            }
            TAG_ARRAY_BUFFER => {
                let len = self.take_u32()? as usize;
                let bytes = self.take(len)?.to_vec();
                let store = std::sync::Arc::new(parking_lot::RwLock::new(bytes));
                Ok(Value::Object(self.iso.wrap_backing_store(store, false)?))
            }
            TAG_TRANSFERRED_BUFFER => {
                let index = self.take_u32()?;
                self.delegate.transferred_array_buffer(self.iso, index)
            }
            TAG_SHARED_BUFFER => {
                let index = self.take_u32()?;
                self.delegate.shared_array_buffer(self.iso, index)
            }
            TAG_VIEW => {
                let ty = view_type_from_code(self.take_u8()?).ok_or_else(|| self.corrupt())?;
                let byte_offset = self.take_u32()? as usize;
                let byte_length = self.take_u32()? as usize;
                let buffer = match self.read_value()? {
                    Value::Object(obj)
                        if matches!(obj.borrow().kind, ObjectKind::ArrayBuffer(_)) =>
                    {
                        obj
                    }
                    _ => return Err(self.corrupt()),
                };
                let view = self.iso.alloc_object(ObjectKind::View(ViewData {
                    buffer,
                    ty,
                    byte_offset,
                    byte_length,
                }))?;
                Ok(Value::Object(view))
            }
            TAG_HOST_OBJECT => {
                let index = self.take_u32()?;
                self.delegate.read_host_object(self.iso, index)
            }
            _ => Err(self.corrupt()),
        }
    }
}

/// Serialize one value with the given delegate.
pub fn serialize<D: SerializerDelegate + ?Sized>(
    iso: &Isolate,
    delegate: &mut D,
    value: &Value,
) -> Completion<Vec<u8>> {
    let mut serializer = ValueSerializer::new(iso, delegate);
    serializer.write_value(value)?;
    Ok(serializer.finish())
}

/// Deserialize one value with the given delegate.
pub fn deserialize<D: DeserializerDelegate + ?Sized>(
    iso: &Isolate,
    delegate: &mut D,
    bytes: &[u8],
) -> Completion<Value> {
    let mut deserializer = ValueDeserializer::new(iso, delegate, bytes);
    deserializer.read_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolate::CreateParams;

    fn isolate() -> Isolate {
        Isolate::new(CreateParams::default()).unwrap()
    }

    #[test]
    fn primitives_round_trip() {
        let iso = isolate();
        for source in ["42", "'hi'", "true", "null", "undefined", "10n"] {
            let ctx = iso.default_context().clone();
            let value = iso.eval(source, "t.js", &ctx).unwrap();
            let bytes = serialize(&iso, &mut DenyDelegate, &value).unwrap();
            let back = deserialize(&iso, &mut DenyDelegate, &bytes).unwrap();
            assert!(back.strict_eq(&value) || (value.is_undefined() && back.is_undefined()));
        }
    }

    #[test]
    fn object_graph_with_cycle() {
        let iso = isolate();
        let ctx = iso.default_context().clone();
        let value = iso
            .eval(
                "let o = { a: 1, list: [1, 2, 3] }; o.self = o; o",
                "t.js",
                &ctx,
            )
            .unwrap();
        let bytes = serialize(&iso, &mut DenyDelegate, &value).unwrap();
        let back = deserialize(&iso, &mut DenyDelegate, &bytes).unwrap();
        let obj = back.as_object().unwrap();
        // Cycle preserved: o.self === o
        match obj.get_own("self") {
            Some(Property::Data {
                value: Value::Object(inner),
                ..
            }) => assert!(inner.ptr_eq(obj)),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn functions_refuse_to_clone() {
        let iso = isolate();
        let ctx = iso.default_context().clone();
        let value = iso.eval("() => 1", "t.js", &ctx).unwrap();
        assert!(matches!(
            serialize(&iso, &mut DenyDelegate, &value),
            Err(EngineError::DataClone(_))
        ));
    }

    #[test]
    fn string_width_preserved() {
        let iso = isolate();
        let narrow = Value::String(iso.alloc_string("plain").unwrap());
        let wide = Value::String(iso.alloc_string("日本語").unwrap());
        for (value, one_byte) in [(&narrow, true), (&wide, false)] {
            let bytes = serialize(&iso, &mut DenyDelegate, value).unwrap();
            let back = deserialize(&iso, &mut DenyDelegate, &bytes).unwrap();
            let s = back.as_string().unwrap();
            assert_eq!(s.is_one_byte(), one_byte);
            assert_eq!(s, value.as_string().unwrap());
        }
    }
}
