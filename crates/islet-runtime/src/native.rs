//! Native modules: dynamically loaded shared objects that install bindings
//! into a target isolate.
//!
//! The ABI is intentionally tiny: the library exports one entry point,
//!
//! ```c
//! void islet_native_module_init(IsletNativeModuleContext *ctx);
//! ```
//!
//! and uses the function pointers on the context to register named values
//! on the module's target object. Only the root (host) side may load
//! libraries; once instantiated into an isolate, that isolate keeps the
//! library alive for its entire lifetime.

use std::ffi::{c_char, c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use islet_engine as engine;
use libloading::Library;
use parking_lot::Mutex;

use crate::error::{RuntimeError, RuntimeResult};
use crate::executor;
use crate::reference::Reference;
use crate::scheduler::RunScope;
use crate::three_phase::{self, ThreePhase};
use crate::transfer::Transferable;

/// The exported entry symbol.
pub const NATIVE_MODULE_ENTRY: &[u8] = b"islet_native_module_init";

type InitFn = unsafe extern "C" fn(*mut NativeModuleContext);

/// The `repr(C)` context handed to the library's init function.
#[repr(C)]
pub struct NativeModuleContext {
    data: *mut c_void,
    /// Register `name` as a numeric property on the module target.
    pub register_number: unsafe extern "C" fn(*mut NativeModuleContext, *const c_char, f64),
    /// Register `name` as a string property on the module target.
    pub register_string:
        unsafe extern "C" fn(*mut NativeModuleContext, *const c_char, *const c_char),
}

struct Registrar<'a, 'b> {
    scope: &'a RunScope<'b>,
    target: engine::Object,
    failed: bool,
}

unsafe extern "C" fn register_number(
    ctx: *mut NativeModuleContext,
    name: *const c_char,
    value: f64,
) {
    // SAFETY: `ctx.data` points at the Registrar for the duration of init.
    let registrar = unsafe { &mut *((*ctx).data as *mut Registrar<'_, '_>) };
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
        registrar.failed = true;
        return;
    };
    registrar
        .target
        .set_data(name, engine::Value::Number(value));
}

unsafe extern "C" fn register_string(
    ctx: *mut NativeModuleContext,
    name: *const c_char,
    value: *const c_char,
) {
    let registrar = unsafe { &mut *((*ctx).data as *mut Registrar<'_, '_>) };
    let (Ok(name), Ok(value)) = (
        unsafe { CStr::from_ptr(name) }.to_str(),
        unsafe { CStr::from_ptr(value) }.to_str(),
    ) else {
        registrar.failed = true;
        return;
    };
    match registrar.scope.iso.alloc_string(value) {
        Ok(s) => registrar.target.set_data(name, engine::Value::String(s)),
        Err(_) => registrar.failed = true,
    }
}

/// A loaded shared object, shareable across instantiations.
pub struct NativeModule {
    path: PathBuf,
    library: Arc<Library>,
}

impl NativeModule {
    /// Load a shared object. Refused from inside a non-root isolate.
    pub fn new(path: &Path) -> RuntimeResult<NativeModule> {
        if !executor::is_host_thread() {
            return Err(RuntimeError::generic(
                "Native modules may only be loaded by the root isolate",
            ));
        }
        // SAFETY: loading a library runs its initializers; the caller vouches
        // for the library, same as any dlopen-based plugin system.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            RuntimeError::generic(format!("failed to load native module: {}", e))
        })?;
        // Fail fast when the entry symbol is missing.
        // SAFETY: symbol type is the documented ABI.
        unsafe {
            library.get::<InitFn>(NATIVE_MODULE_ENTRY).map_err(|e| {
                RuntimeError::generic(format!("native module entry not found: {}", e))
            })?;
        }
        Ok(NativeModule {
            path: path.to_path_buf(),
            library: Arc::new(library),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Instantiate into `isolate`: creates the target object, runs the
    /// library's init against it, and returns a reference to it. The
    /// isolate keeps the library alive until disposal.
    pub fn create(&self, isolate: &crate::runtime::IsolateRef) -> RuntimeResult<Reference> {
        let slot: Arc<Mutex<Option<Reference>>> = Arc::new(Mutex::new(None));
        let task = CreateRunner {
            library: Arc::clone(&self.library),
            slot: Arc::clone(&slot),
        };
        three_phase::run_sync(task, isolate.holder())?;
        let reference = slot.lock().take();
        reference.ok_or_else(|| RuntimeError::generic("native module produced no instance"))
    }
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeModule({})", self.path.display())
    }
}

struct CreateRunner {
    library: Arc<Library>,
    slot: Arc<Mutex<Option<Reference>>>,
}

impl ThreePhase for CreateRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let target = scope
            .iso
            .alloc_object(engine::ObjectKind::Plain)
            .map_err(|e| crate::external_copy::runtime_error_from_engine(scope, e))?;

        let mut registrar = Registrar {
            scope,
            target: target.clone(),
            failed: false,
        };
        let mut context = NativeModuleContext {
            data: (&mut registrar) as *mut Registrar<'_, '_> as *mut c_void,
            register_number,
            register_string,
        };
        // SAFETY: the symbol was validated at load time; the context only
        // lives for this call.
        unsafe {
            let init = self
                .library
                .get::<InitFn>(NATIVE_MODULE_ENTRY)
                .map_err(|e| RuntimeError::generic(format!("native module entry lost: {}", e)))?;
            init(&mut context);
        }
        if registrar.failed {
            return Err(RuntimeError::generic(
                "native module registered malformed bindings",
            ));
        }

        // The isolate owns the library for its remaining lifetime.
        let library = Arc::clone(&self.library);
        scope.env.add_weak_callback(Box::new(move || {
            drop(library);
        }));

        let reference =
            Reference::from_value(scope, &engine::Value::Object(target), false, false)?;
        *self.slot.lock() = Some(reference);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::copy(crate::external_copy::ExternalCopy::undefined()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_fails() {
        let result = NativeModule::new(Path::new("/nonexistent/libislet_test.so"));
        assert!(result.is_err());
    }
}
