//! Module records: compiled module bodies, their dependency requests, and
//! the instantiate/evaluate lifecycle.
//!
//! Resolution policy lives with the embedder: it maps each specifier to
//! another compiled module via [`set_resolution`], then calls
//! [`instantiate`]. Evaluation is depth-first over resolved dependencies.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ast::{Program, Stmt};
use crate::error::Completion;
use crate::interp::{self, ExecCtx, ModuleCtx, ScopeData};
use crate::isolate::{Context, Isolate};
use crate::value::{Object, ObjectKind, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleStatus {
    Uninstantiated,
    Instantiated,
    Evaluating,
    Evaluated,
}

pub struct ModuleRecord {
    pub program: Rc<Program>,
    pub origin: String,
    pub requests: Vec<String>,
    pub status: ModuleStatus,
    pub resolutions: FxHashMap<String, Object>,
    pub namespace: Option<Object>,
}

impl ModuleRecord {
    pub fn new(program: Rc<Program>, origin: &str) -> ModuleRecord {
        let mut requests = Vec::new();
        for stmt in &program.body {
            if let Stmt::Import { source, .. } = stmt {
                if !requests.contains(source) {
                    requests.push(source.clone());
                }
            }
        }
        ModuleRecord {
            program,
            origin: origin.to_string(),
            requests,
            status: ModuleStatus::Uninstantiated,
            resolutions: FxHashMap::default(),
            namespace: None,
        }
    }
}

pub fn module_record(module: &Object) -> Option<Rc<RefCell<ModuleRecord>>> {
    match &module.borrow().kind {
        ObjectKind::Module(record) => Some(Rc::clone(record)),
        _ => None,
    }
}

/// The evaluated namespace of a module object, if evaluation has happened.
pub fn module_namespace(module: &Object) -> Option<Object> {
    module_record(module).and_then(|r| r.borrow().namespace.clone())
}

/// Dependency specifiers, in first-occurrence order.
pub fn requests(module: &Object) -> Vec<String> {
    module_record(module)
        .map(|r| r.borrow().requests.clone())
        .unwrap_or_default()
}

/// Record the module object resolved for `specifier`.
pub fn set_resolution(
    iso: &Isolate,
    module: &Object,
    specifier: &str,
    dependency: &Object,
) -> Completion<()> {
    let record = module_record(module)
        .ok_or_else(|| iso.throw_type_error("not a module"))?;
    if module_record(dependency).is_none() {
        return Err(iso.throw_type_error("resolver returned a non-module"));
    }
    record
        .borrow_mut()
        .resolutions
        .insert(specifier.to_string(), dependency.clone());
    Ok(())
}

/// Mark a module instantiated once every request has a resolution.
pub fn instantiate(iso: &Isolate, module: &Object) -> Completion<()> {
    let record = module_record(module)
        .ok_or_else(|| iso.throw_type_error("not a module"))?;
    let mut record = record.borrow_mut();
    for request in &record.requests {
        if !record.resolutions.contains_key(request) {
            return Err(iso.throw_reference_error(&format!(
                "Module \"{}\" was not resolved",
                request
            )));
        }
    }
    if record.status == ModuleStatus::Uninstantiated {
        record.status = ModuleStatus::Instantiated;
    }
    Ok(())
}

/// Evaluate the module (dependencies first), producing its namespace.
/// Re-evaluation returns the cached namespace; cycles are tolerated by
/// returning the partially populated namespace.
pub fn evaluate(iso: &Isolate, module: &Object, context: &Context) -> Completion<Object> {
    let record_rc = module_record(module)
        .ok_or_else(|| iso.throw_type_error("not a module"))?;

    let (status, deps, namespace) = {
        let record = record_rc.borrow();
        (
            record.status,
            record.resolutions.values().cloned().collect::<Vec<_>>(),
            record.namespace.clone(),
        )
    };
    match status {
        ModuleStatus::Uninstantiated => {
            return Err(iso.throw_type_error("Module must be instantiated before evaluation"))
        }
        ModuleStatus::Evaluated | ModuleStatus::Evaluating => {
            if let Some(ns) = namespace {
                return Ok(ns);
            }
        }
        ModuleStatus::Instantiated => {}
    }

    let namespace = iso.alloc_object(ObjectKind::Plain)?;
    {
        let mut record = record_rc.borrow_mut();
        record.status = ModuleStatus::Evaluating;
        record.namespace = Some(namespace.clone());
    }

    for dep in deps {
        evaluate(iso, &dep, context)?;
    }

    let (program, origin) = {
        let record = record_rc.borrow();
        (Rc::clone(&record.program), record.origin.clone())
    };
    let mut cx = ExecCtx {
        global: context.global().clone(),
        scope: ScopeData::new(None),
        this: Value::Undefined,
        origin: Rc::from(origin.as_str()),
        module: Some(ModuleCtx {
            record: Rc::clone(&record_rc),
            namespace: namespace.clone(),
        }),
    };
    let outcome = interp::run_module_body(iso, &mut cx, &program.body);
    match outcome {
        Ok(()) => {
            record_rc.borrow_mut().status = ModuleStatus::Evaluated;
            Ok(namespace)
        }
        Err(e) => {
            // Failed evaluation resets so a retry is possible.
            let mut record = record_rc.borrow_mut();
            record.status = ModuleStatus::Instantiated;
            record.namespace = None;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolate::CreateParams;

    #[test]
    fn module_requests_collected() {
        let iso = Isolate::new(CreateParams::default()).unwrap();
        let module = iso
            .compile_module(
                "import { a } from 'dep'; import * as ns from 'other'; export const x = a;",
                "mod.js",
            )
            .unwrap();
        assert_eq!(requests(&module), vec!["dep".to_string(), "other".to_string()]);
    }

    #[test]
    fn link_and_evaluate() {
        let iso = Isolate::new(CreateParams::default()).unwrap();
        let ctx = iso.default_context().clone();
        let dep = iso
            .compile_module("export const a = 20;", "dep.js")
            .unwrap();
        instantiate(&iso, &dep).unwrap();
        let module = iso
            .compile_module("import { a } from 'dep'; export const x = a + 22;", "mod.js")
            .unwrap();
        set_resolution(&iso, &module, "dep", &dep).unwrap();
        instantiate(&iso, &module).unwrap();
        let namespace = evaluate(&iso, &module, &ctx).unwrap();
        let x = namespace.get_own("x").and_then(|p| match p {
            crate::value::Property::Data { value, .. } => value.as_number(),
            _ => None,
        });
        assert_eq!(x, Some(42.0));
    }

    #[test]
    fn unresolved_request_fails_instantiate() {
        let iso = Isolate::new(CreateParams::default()).unwrap();
        let module = iso
            .compile_module("import { a } from 'missing';", "mod.js")
            .unwrap();
        assert!(instantiate(&iso, &module).is_err());
    }
}
