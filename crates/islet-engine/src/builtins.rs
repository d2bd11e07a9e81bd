//! Native constructors and primitive methods installed into every context.

use std::rc::Rc;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::error::Completion;
use crate::heap::Heap;
use crate::interp::{call_function, value_to_display};
use crate::isolate::{Context, Isolate};
use crate::promise;
use crate::value::{
    ErrorKind, FnKind, FunctionData, JsString, Object, ObjectKind, Value, ViewData, ViewType,
};

/// Build a native function object directly over the heap (used during
/// context creation, before an `Isolate` exists).
pub(crate) fn native_fn(
    heap: &Rc<Heap>,
    name: &str,
    length: u32,
    f: impl Fn(&Isolate, &Value, &[Value]) -> Completion + 'static,
) -> Completion<Object> {
    Object::alloc(
        heap,
        ObjectKind::Function(FunctionData {
            name: name.to_string(),
            length,
            kind: FnKind::Native(Rc::new(f)),
        }),
        None,
    )
}

/// Create a context: a fresh global object with the default constructors.
pub(crate) fn create_context(heap: &Rc<Heap>) -> Completion<Context> {
    let global = Object::alloc(heap, ObjectKind::Plain, None)?;
    global.set_hidden("globalThis", Value::Object(global.clone()));

    for kind in [
        ErrorKind::Error,
        ErrorKind::TypeError,
        ErrorKind::RangeError,
        ErrorKind::ReferenceError,
        ErrorKind::SyntaxError,
    ] {
        let ctor = native_fn(heap, kind.name(), 1, move |iso, _this, args| {
            let message = args.first().map(value_to_display).unwrap_or_default();
            let error = iso.new_error(kind, &message)?;
            Ok(Value::Object(error))
        })?;
        global.set_hidden(kind.name(), Value::Object(ctor));
    }

    let promise_ctor = native_fn(heap, "Promise", 1, |iso, _this, args| {
        let executor = args.first().cloned().unwrap_or_default();
        if !executor.is_function() {
            return Err(iso.throw_type_error("Promise resolver is not a function"));
        }
        let promise = iso.new_promise()?;
        let resolve_target = promise.clone();
        let resolve = iso.new_native_function("resolve", 1, move |iso, _this, args| {
            let value = args.first().cloned().unwrap_or_default();
            promise::resolve_promise(iso, &resolve_target, value);
            Ok(Value::Undefined)
        })?;
        let reject_target = promise.clone();
        let reject = iso.new_native_function("reject", 1, move |iso, _this, args| {
            let value = args.first().cloned().unwrap_or_default();
            promise::settle_promise(iso, &reject_target, false, value);
            Ok(Value::Undefined)
        })?;
        match call_function(iso, &executor, &Value::Undefined, &[resolve, reject]) {
            Ok(_) => {}
            Err(crate::error::EngineError::Thrown(err)) => {
                promise::settle_promise(iso, &promise, false, err);
            }
            Err(fatal) => return Err(fatal),
        }
        Ok(Value::Object(promise))
    })?;
    let resolve_static = native_fn(heap, "resolve", 1, |iso, _this, args| {
        let promise = iso.new_promise()?;
        promise::resolve_promise(iso, &promise, args.first().cloned().unwrap_or_default());
        Ok(Value::Object(promise))
    })?;
    let reject_static = native_fn(heap, "reject", 1, |iso, _this, args| {
        let promise = iso.new_promise()?;
        promise::settle_promise(
            iso,
            &promise,
            false,
            args.first().cloned().unwrap_or_default(),
        );
        Ok(Value::Object(promise))
    })?;
    promise_ctor.set_hidden("resolve", Value::Object(resolve_static));
    promise_ctor.set_hidden("reject", Value::Object(reject_static));
    global.set_hidden("Promise", Value::Object(promise_ctor));

    let array_buffer = native_fn(heap, "ArrayBuffer", 1, |iso, _this, args| {
        let len = args.first().map(crate::interp::to_number).unwrap_or(0.0);
        if !(0.0..=u32::MAX as f64).contains(&len) {
            return Err(iso.throw_range_error("Invalid array buffer length"));
        }
        let buffer = iso.new_array_buffer(len as usize)?;
        Ok(Value::Object(buffer))
    })?;
    global.set_hidden("ArrayBuffer", Value::Object(array_buffer));

    let shared_buffer = native_fn(heap, "SharedArrayBuffer", 1, |iso, _this, args| {
        let len = args.first().map(crate::interp::to_number).unwrap_or(0.0);
        if !(0.0..=u32::MAX as f64).contains(&len) {
            return Err(iso.throw_range_error("Invalid array buffer length"));
        }
        let buffer = iso.new_shared_array_buffer(len as usize)?;
        Ok(Value::Object(buffer))
    })?;
    global.set_hidden("SharedArrayBuffer", Value::Object(shared_buffer));

    for (name, ty) in [
        ("Uint8Array", ViewType::Uint8),
        ("Uint8ClampedArray", ViewType::Uint8Clamped),
        ("Int8Array", ViewType::Int8),
        ("Uint16Array", ViewType::Uint16),
        ("Int16Array", ViewType::Int16),
        ("Uint32Array", ViewType::Uint32),
        ("Int32Array", ViewType::Int32),
        ("Float32Array", ViewType::Float32),
        ("Float64Array", ViewType::Float64),
        ("DataView", ViewType::DataView),
    ] {
        let ctor = native_fn(heap, name, 1, move |iso, _this, args| {
            new_typed_array(iso, ty, args)
        })?;
        global.set_hidden(name, Value::Object(ctor));
    }

    let date_ctor = native_fn(heap, "Date", 1, |iso, _this, args| {
        let ms = match args.first() {
            Some(v) => crate::interp::to_number(v),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as f64)
                .unwrap_or(0.0),
        };
        let date = iso.alloc_object(ObjectKind::Date(ms))?;
        Ok(Value::Object(date))
    })?;
    global.set_hidden("Date", Value::Object(date_ctor));

    let proxy_ctor = native_fn(heap, "Proxy", 2, |iso, _this, args| {
        let target = args.first().cloned().unwrap_or_default();
        let handler = match args.get(1).and_then(|v| v.as_object()) {
            Some(h) => h.clone(),
            None => {
                return Err(iso.throw_type_error(
                    "Cannot create proxy with a non-object as target or handler",
                ))
            }
        };
        if target.as_object().is_none() {
            return Err(iso.throw_type_error(
                "Cannot create proxy with a non-object as target or handler",
            ));
        }
        let proxy = iso.alloc_object(ObjectKind::Proxy(crate::value::ProxyData {
            target,
            handler,
        }))?;
        Ok(Value::Object(proxy))
    })?;
    global.set_hidden("Proxy", Value::Object(proxy_ctor));

    Ok(Context::from_global(global))
}

fn new_typed_array(iso: &Isolate, ty: ViewType, args: &[Value]) -> Completion {
    match args.first() {
        Some(Value::Object(obj)) if matches!(obj.borrow().kind, ObjectKind::ArrayBuffer(_)) => {
            let byte_length = match &obj.borrow().kind {
                ObjectKind::ArrayBuffer(b) => b.byte_length(),
                _ => 0,
            };
            let byte_offset = args.get(1).map(crate::interp::to_number).unwrap_or(0.0) as usize;
            let len = match args.get(2) {
                Some(v) => crate::interp::to_number(v) as usize * ty.element_size(),
                None => byte_length.saturating_sub(byte_offset),
            };
            if byte_offset + len > byte_length {
                return Err(iso.throw_range_error("Invalid typed array length"));
            }
            let view = iso.alloc_object(ObjectKind::View(ViewData {
                buffer: obj.clone(),
                ty,
                byte_offset,
                byte_length: len,
            }))?;
            Ok(Value::Object(view))
        }
        Some(v) => {
            let count = crate::interp::to_number(v) as usize;
            let buffer = iso.new_array_buffer(count * ty.element_size())?;
            let view = iso.alloc_object(ObjectKind::View(ViewData {
                buffer,
                ty,
                byte_offset: 0,
                byte_length: count * ty.element_size(),
            }))?;
            Ok(Value::Object(view))
        }
        None => {
            let buffer = iso.new_array_buffer(0)?;
            let view = iso.alloc_object(ObjectKind::View(ViewData {
                buffer,
                ty,
                byte_offset: 0,
                byte_length: 0,
            }))?;
            Ok(Value::Object(view))
        }
    }
}

/// Method lookup for string receivers.
pub(crate) fn string_method(iso: &Isolate, key: &str) -> Completion {
    let method: Option<fn(&Isolate, &JsString, &[Value]) -> Completion> = match key {
        "toUpperCase" => Some(|iso, s, _| {
            Ok(Value::String(iso.alloc_string(&s.to_rust_string().to_uppercase())?))
        }),
        "toLowerCase" => Some(|iso, s, _| {
            Ok(Value::String(iso.alloc_string(&s.to_rust_string().to_lowercase())?))
        }),
        "indexOf" => Some(|_iso, s, args| {
            let needle = args.first().map(value_to_display).unwrap_or_default();
            let haystack = s.to_rust_string();
            let index = haystack
                .find(&needle)
                .map(|byte| haystack[..byte].encode_utf16().count() as f64)
                .unwrap_or(-1.0);
            Ok(Value::Number(index))
        }),
        "includes" => Some(|_iso, s, args| {
            let needle = args.first().map(value_to_display).unwrap_or_default();
            Ok(Value::Bool(s.to_rust_string().contains(&needle)))
        }),
        "charAt" => Some(|iso, s, args| {
            let index = args.first().map(crate::interp::to_number).unwrap_or(0.0) as usize;
            let units = s.code_units();
            let text = units
                .get(index)
                .map(|&u| String::from_utf16_lossy(&[u]))
                .unwrap_or_default();
            Ok(Value::String(iso.alloc_string(&text)?))
        }),
        "charCodeAt" => Some(|_iso, s, args| {
            let index = args.first().map(crate::interp::to_number).unwrap_or(0.0) as usize;
            let units = s.code_units();
            Ok(Value::Number(
                units.get(index).map(|&u| u as f64).unwrap_or(f64::NAN),
            ))
        }),
        "slice" => Some(|iso, s, args| {
            let units = s.code_units();
            let len = units.len() as f64;
            let norm = |v: f64| -> usize {
                if v < 0.0 {
                    (len + v).max(0.0) as usize
                } else {
                    v.min(len) as usize
                }
            };
            let start = norm(args.first().map(crate::interp::to_number).unwrap_or(0.0));
            let end = norm(args.get(1).map(crate::interp::to_number).unwrap_or(len));
            let text = if start < end {
                String::from_utf16_lossy(&units[start..end])
            } else {
                String::new()
            };
            Ok(Value::String(iso.alloc_string(&text)?))
        }),
        _ => None,
    };
    match method {
        Some(f) => iso.new_native_function(key, 1, move |iso, this, args| {
            let Some(s) = this.as_string() else {
                return Err(iso.throw_type_error("String method called on a non-string"));
            };
            f(iso, s, args)
        }),
        None => Ok(Value::Undefined),
    }
}

pub(crate) fn is_array_method(key: &str) -> bool {
    matches!(key, "push" | "pop" | "join" | "indexOf" | "slice")
}

/// Method lookup for array receivers.
pub(crate) fn array_method(iso: &Isolate, key: &str) -> Completion {
    let name = key.to_string();
    iso.new_native_function(key, 1, move |iso, this, args| {
        let Some(obj) = this.as_object() else {
            return Err(iso.throw_type_error("Array method called on a non-array"));
        };
        match name.as_str() {
            "push" => {
                let mut data = obj.borrow_mut();
                let ObjectKind::Array(items) = &mut data.kind else {
                    return Err(iso.throw_type_error("Array method called on a non-array"));
                };
                items.extend(args.iter().cloned());
                Ok(Value::Number(items.len() as f64))
            }
            "pop" => {
                let mut data = obj.borrow_mut();
                let ObjectKind::Array(items) = &mut data.kind else {
                    return Err(iso.throw_type_error("Array method called on a non-array"));
                };
                Ok(items.pop().unwrap_or_default())
            }
            "join" => {
                let separator = args
                    .first()
                    .map(value_to_display)
                    .unwrap_or_else(|| ",".to_string());
                let items = match &obj.borrow().kind {
                    ObjectKind::Array(items) => items.clone(),
                    _ => Vec::new(),
                };
                let text = items
                    .iter()
                    .map(value_to_display)
                    .collect::<Vec<_>>()
                    .join(&separator);
                Ok(Value::String(iso.alloc_string(&text)?))
            }
            "indexOf" => {
                let needle = args.first().cloned().unwrap_or_default();
                let items = match &obj.borrow().kind {
                    ObjectKind::Array(items) => items.clone(),
                    _ => Vec::new(),
                };
                let index = items
                    .iter()
                    .position(|v| v.strict_eq(&needle))
                    .map(|i| i as f64)
                    .unwrap_or(-1.0);
                Ok(Value::Number(index))
            }
            "slice" => {
                let items = match &obj.borrow().kind {
                    ObjectKind::Array(items) => items.clone(),
                    _ => Vec::new(),
                };
                let len = items.len() as f64;
                let norm = |v: f64| -> usize {
                    if v < 0.0 {
                        (len + v).max(0.0) as usize
                    } else {
                        v.min(len) as usize
                    }
                };
                let start = norm(args.first().map(crate::interp::to_number).unwrap_or(0.0));
                let end = norm(args.get(1).map(crate::interp::to_number).unwrap_or(len));
                let slice = if start < end {
                    items[start..end].to_vec()
                } else {
                    Vec::new()
                };
                let array = iso.alloc_object(ObjectKind::Array(slice))?;
                Ok(Value::Object(array))
            }
            _ => Ok(Value::Undefined),
        }
    })
}

/// Method lookup for promise receivers.
pub(crate) fn promise_method(iso: &Isolate, key: &str) -> Completion {
    let name = key.to_string();
    iso.new_native_function(key, 2, move |iso, this, args| {
        let Some(obj) = this.as_object().filter(|o| {
            matches!(o.borrow().kind, ObjectKind::Promise(_))
        }) else {
            return Err(iso.throw_type_error("Promise method called on a non-promise"));
        };
        let derived = match name.as_str() {
            "then" => promise::then(
                iso,
                obj,
                args.first().cloned(),
                args.get(1).cloned(),
            )?,
            "catch" => promise::then(iso, obj, None, args.first().cloned())?,
            // `finally` observes settlement without changing it.
            _ => {
                let callback = args.first().cloned();
                promise::then(iso, obj, callback.clone(), callback)?
            }
        };
        Ok(Value::Object(derived))
    })
}

/// Decode one little-endian element from a typed-array backing slice.
pub(crate) fn decode_element(bytes: &[u8], ty: ViewType) -> f64 {
    match ty {
        ViewType::Uint8 | ViewType::Uint8Clamped | ViewType::DataView => bytes[0] as f64,
        ViewType::Int8 => bytes[0] as i8 as f64,
        ViewType::Uint16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
        ViewType::Int16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
        ViewType::Uint32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        ViewType::Int32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        ViewType::Float32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        ViewType::Float64 => f64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]),
    }
}

/// Encode one little-endian element into a typed-array backing slice.
pub(crate) fn encode_element(out: &mut [u8], ty: ViewType, value: f64) {
    match ty {
        ViewType::Uint8 | ViewType::DataView => out[0] = value as i64 as u8,
        ViewType::Uint8Clamped => out[0] = value.clamp(0.0, 255.0) as u8,
        ViewType::Int8 => out[0] = value as i64 as i8 as u8,
        ViewType::Uint16 => out.copy_from_slice(&(value as i64 as u16).to_le_bytes()),
        ViewType::Int16 => out.copy_from_slice(&(value as i64 as i16).to_le_bytes()),
        ViewType::Uint32 => out.copy_from_slice(&(value as i64 as u32).to_le_bytes()),
        ViewType::Int32 => out.copy_from_slice(&(value as i64 as i32).to_le_bytes()),
        ViewType::Float32 => out.copy_from_slice(&(value as f32).to_le_bytes()),
        ViewType::Float64 => out.copy_from_slice(&value.to_le_bytes()),
    }
}

/// Allocate a backing store for `len` zeroed bytes.
pub(crate) fn new_backing_store(len: usize) -> Arc<RwLock<Vec<u8>>> {
    Arc::new(RwLock::new(vec![0u8; len]))
}
