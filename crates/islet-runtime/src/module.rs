//! Module handles: compiled modules, the dependency linker, and evaluation.
//!
//! The linker walks the dependency graph depth-first, claiming each module's
//! link slot before invoking the host resolver, so at most one linker works
//! a module at a time; any failure resets the slot for a retry.

use std::sync::Arc;

use islet_engine as engine;
use parking_lot::Mutex;

use crate::environment::IsolateHolder;
use crate::error::{RuntimeError, RuntimeResult};
use crate::external_copy::runtime_error_from_engine;
use crate::reference::Reference;
use crate::remote::RemoteHandle;
use crate::runtime::ContextRef;
use crate::scheduler::RunScope;
use crate::three_phase::{self, ThreePhase};
use crate::timeout::run_with_timeout;
use crate::transfer::{transfer_out, Transferable, TransferOptions, TransferType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkStatus {
    None,
    Linking,
    Linked,
}

/// Shared bookkeeping for one compiled module.
pub(crate) struct ModuleInfo {
    pub handle: RemoteHandle,
    pub identity: u64,
    pub link: Mutex<LinkStatus>,
    pub namespace: Mutex<Option<RemoteHandle>>,
}

/// A compiled module owned by an isolate.
pub struct Module {
    isolate: Arc<IsolateHolder>,
    info: Arc<ModuleInfo>,
}

/// Resolves an import specifier to another compiled module.
pub type ModuleResolver<'a> = dyn FnMut(&str, &Module) -> RuntimeResult<Module> + 'a;

impl Module {
    /// The dependency specifiers requested by this module's source.
    pub fn dependency_specifiers(&self) -> RuntimeResult<Vec<String>> {
        let slot: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let task = SpecifiersRunner {
            info: Arc::clone(&self.info),
            slot: Arc::clone(&slot),
        };
        three_phase::run_sync(task, &self.isolate)?;
        let out = slot.lock().clone();
        Ok(out)
    }

    /// Link the module graph: claims this module, resolves every specifier
    /// through `resolver`, links dependencies recursively, then instantiates.
    pub fn instantiate(
        &self,
        context: &ContextRef,
        resolver: &mut ModuleResolver<'_>,
    ) -> RuntimeResult<()> {
        {
            let mut link = self.info.link.lock();
            match *link {
                LinkStatus::Linked => return Ok(()),
                LinkStatus::Linking => {
                    return Err(RuntimeError::generic("Module is already being linked"))
                }
                LinkStatus::None => *link = LinkStatus::Linking,
            }
        }
        let result = self.instantiate_inner(context, resolver);
        let mut link = self.info.link.lock();
        *link = match result {
            Ok(()) => LinkStatus::Linked,
            // Reset so a later linker can retry.
            Err(_) => LinkStatus::None,
        };
        result
    }

    fn instantiate_inner(
        &self,
        context: &ContextRef,
        resolver: &mut ModuleResolver<'_>,
    ) -> RuntimeResult<()> {
        let specifiers = self.dependency_specifiers()?;
        for specifier in &specifiers {
            let dependency = resolver(specifier, self)?;
            if !Arc::ptr_eq(&dependency.isolate, &self.isolate) {
                return Err(RuntimeError::type_error(
                    "Resolved module belongs to a different isolate",
                ));
            }
            {
                let task = ResolveRunner {
                    info: Arc::clone(&self.info),
                    specifier: specifier.clone(),
                    dependency: Arc::clone(&dependency.info),
                };
                three_phase::run_sync(task, &self.isolate)?;
            }
            // Recurse unless something (possibly us, via a cycle) already
            // holds the dependency's link slot.
            let claim = {
                let mut link = dependency.info.link.lock();
                match *link {
                    LinkStatus::None => {
                        *link = LinkStatus::Linking;
                        true
                    }
                    LinkStatus::Linking | LinkStatus::Linked => false,
                }
            };
            if claim {
                let result = dependency.instantiate_inner(context, resolver);
                let mut link = dependency.info.link.lock();
                *link = match result {
                    Ok(()) => LinkStatus::Linked,
                    Err(_) => LinkStatus::None,
                };
                result?;
            }
        }
        let task = InstantiateRunner {
            info: Arc::clone(&self.info),
        };
        three_phase::run_sync(task, &self.isolate)?;
        Ok(())
    }

    /// Evaluate the module, capturing its namespace. Returns the completion
    /// value, copied by default.
    pub fn evaluate(&self, context: &ContextRef, timeout: u64) -> RuntimeResult<Transferable> {
        let task = EvaluateRunner {
            info: Arc::clone(&self.info),
            context: context.global_handle().clone(),
            timeout,
            result: None,
        };
        three_phase::run_sync(task, &self.isolate)
    }

    /// Reference to the module namespace; available after evaluation.
    pub fn namespace(&self) -> RuntimeResult<Reference> {
        let namespace = self.info.namespace.lock().clone();
        let handle =
            namespace.ok_or_else(|| RuntimeError::generic("Module has not been evaluated"))?;
        let slot: Arc<Mutex<Option<Reference>>> = Arc::new(Mutex::new(None));
        let task = NamespaceRunner {
            handle,
            slot: Arc::clone(&slot),
        };
        three_phase::run_sync(task, &self.isolate)?;
        let reference = slot.lock().take();
        reference.ok_or_else(|| RuntimeError::generic("Module has not been evaluated"))
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Module")
    }
}

/// Compile source text as a module owned by `isolate`.
pub(crate) fn compile(
    isolate: &Arc<IsolateHolder>,
    code: &str,
    filename: &str,
) -> RuntimeResult<Module> {
    let slot: Arc<Mutex<Option<Arc<ModuleInfo>>>> = Arc::new(Mutex::new(None));
    let task = CompileModuleRunner {
        code: code.to_string(),
        filename: filename.to_string(),
        slot: Arc::clone(&slot),
    };
    three_phase::run_sync(task, isolate)?;
    let info = slot
        .lock()
        .take()
        .ok_or_else(|| RuntimeError::generic("compilation produced no module"))?;
    Ok(Module {
        isolate: Arc::clone(isolate),
        info,
    })
}

struct CompileModuleRunner {
    code: String,
    filename: String,
    slot: Arc<Mutex<Option<Arc<ModuleInfo>>>>,
}

impl ThreePhase for CompileModuleRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let module = scope
            .iso
            .compile_module(&self.code, &self.filename)
            .map_err(|e| runtime_error_from_engine(scope, e))?;
        let identity = module.id() as u64;
        let value = engine::Value::Object(module);
        let handle = RemoteHandle::new(scope, &value)?;
        let info = Arc::new(ModuleInfo {
            handle,
            identity,
            link: Mutex::new(LinkStatus::None),
            namespace: Mutex::new(None),
        });
        scope
            .env
            .module_registry
            .lock()
            .insert(info.identity, Arc::clone(&info));
        *self.slot.lock() = Some(info);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::copy(crate::external_copy::ExternalCopy::undefined()))
    }
}

struct SpecifiersRunner {
    info: Arc<ModuleInfo>,
    slot: Arc<Mutex<Vec<String>>>,
}

impl ThreePhase for SpecifiersRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let module = module_object(scope, &self.info)?;
        *self.slot.lock() = engine::module_requests(&module);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::copy(crate::external_copy::ExternalCopy::undefined()))
    }
}

struct ResolveRunner {
    info: Arc<ModuleInfo>,
    specifier: String,
    dependency: Arc<ModuleInfo>,
}

impl ThreePhase for ResolveRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let module = module_object(scope, &self.info)?;
        let dependency = module_object(scope, &self.dependency)?;
        engine::set_resolution(scope.iso, &module, &self.specifier, &dependency)
            .map_err(|e| runtime_error_from_engine(scope, e))
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::copy(crate::external_copy::ExternalCopy::undefined()))
    }
}

struct InstantiateRunner {
    info: Arc<ModuleInfo>,
}

impl ThreePhase for InstantiateRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let module = module_object(scope, &self.info)?;
        engine::instantiate_module(scope.iso, &module)
            .map_err(|e| runtime_error_from_engine(scope, e))
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::copy(crate::external_copy::ExternalCopy::undefined()))
    }
}

struct EvaluateRunner {
    info: Arc<ModuleInfo>,
    context: RemoteHandle,
    timeout: u64,
    result: Option<Transferable>,
}

impl ThreePhase for EvaluateRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let module = module_object(scope, &self.info)?;
        let global = self.context.deref(scope)?;
        let Some(global_obj) = global.as_object().cloned() else {
            return Err(RuntimeError::type_error("Context has been released"));
        };
        let context = engine::Context::from_global(global_obj);
        let namespace = run_with_timeout(scope, self.timeout, || {
            engine::evaluate_module(scope.iso, &module, &context)
                .map(engine::Value::Object)
        })?;
        if let engine::Value::Object(_) = &namespace {
            let handle = RemoteHandle::new(scope, &namespace)?;
            *self.info.namespace.lock() = Some(handle);
        }
        let options = TransferOptions {
            transfer: None,
            fallback: Some(TransferType::Copy),
            promise: false,
        };
        self.result = Some(transfer_out(scope, &engine::Value::Undefined, options)?);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        self.result
            .take()
            .ok_or_else(|| RuntimeError::generic("evaluation produced no result"))
    }
}

struct NamespaceRunner {
    handle: RemoteHandle,
    slot: Arc<Mutex<Option<Reference>>>,
}

impl ThreePhase for NamespaceRunner {
    fn phase2(&mut self, scope: &RunScope<'_>) -> RuntimeResult<()> {
        let value = self.handle.deref(scope)?;
        // Namespace exports are live bindings; reads must go through
        // accessors.
        let reference = Reference::from_value(scope, &value, true, false)?;
        *self.slot.lock() = Some(reference);
        Ok(())
    }

    fn phase3(&mut self, _scope: &RunScope<'_>) -> RuntimeResult<Transferable> {
        Ok(Transferable::copy(crate::external_copy::ExternalCopy::undefined()))
    }
}

fn module_object(
    scope: &RunScope<'_>,
    info: &Arc<ModuleInfo>,
) -> RuntimeResult<engine::Object> {
    let value = info.handle.deref(scope)?;
    value
        .as_object()
        .cloned()
        .ok_or_else(|| RuntimeError::type_error("Module has been released"))
}
