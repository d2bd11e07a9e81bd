//! Tree-walking evaluator.
//!
//! Cooperative interruption and termination are checked at statement
//! boundaries and loop back-edges; heap charges happen at every string and
//! object allocation, so runaway scripts fail deterministically against the
//! isolate's limit.

use std::cell::RefCell;
use std::rc::Rc;

use num_bigint::BigInt;
use rustc_hash::FxHashMap;

use crate::ast::*;
use crate::error::{Completion, EngineError};
use crate::isolate::Isolate;
use crate::promise;
use crate::value::{
    number_to_string, FnKind, FunctionData, Object, ObjectKind, Property, ScriptFnData, Value,
};

pub type ScopeRef = Rc<RefCell<ScopeData>>;

pub struct ScopeData {
    vars: FxHashMap<String, Binding>,
    parent: Option<ScopeRef>,
}

struct Binding {
    value: Value,
    mutable: bool,
}

impl ScopeData {
    pub fn new(parent: Option<ScopeRef>) -> ScopeRef {
        Rc::new(RefCell::new(ScopeData {
            vars: FxHashMap::default(),
            parent,
        }))
    }
}

/// Evaluation context: the active global object, scope chain, receiver and
/// (for module evaluation) the export collector.
pub struct ExecCtx {
    pub global: Object,
    pub scope: ScopeRef,
    pub this: Value,
    pub origin: Rc<str>,
    pub module: Option<ModuleCtx>,
}

#[derive(Clone)]
pub struct ModuleCtx {
    pub record: Rc<RefCell<crate::module::ModuleRecord>>,
    pub namespace: Object,
}

enum Flow {
    Normal(Value),
    Return(Value),
    Break,
    Continue,
}

const MAX_CALL_DEPTH: usize = 512;

/// Run a whole program in a fresh script scope over `global`. Returns the
/// completion value of the last expression statement.
pub fn run_program(
    iso: &Isolate,
    global: &Object,
    program: &Rc<Program>,
    origin: &str,
) -> Completion {
    let mut cx = ExecCtx {
        global: global.clone(),
        scope: ScopeData::new(None),
        this: Value::Object(global.clone()),
        origin: Rc::from(origin),
        module: None,
    };
    match exec_stmts(iso, &mut cx, &program.body)? {
        Flow::Normal(v) | Flow::Return(v) => Ok(v),
        _ => Ok(Value::Undefined),
    }
}

/// Run a module body, binding imports and collecting exports. `cx.module`
/// must be set.
pub fn run_module_body(iso: &Isolate, cx: &mut ExecCtx, body: &[Stmt]) -> Completion<()> {
    match exec_stmts(iso, cx, body)? {
        Flow::Normal(_) | Flow::Return(_) => Ok(()),
        _ => Ok(()),
    }
}

fn exec_stmts(iso: &Isolate, cx: &mut ExecCtx, stmts: &[Stmt]) -> Result<Flow, EngineError> {
    // Hoist function declarations so forward calls work.
    for stmt in stmts {
        if let Stmt::Func(literal) = stmt {
            let f = instantiate_function(iso, cx, literal)?;
            if let Some(name) = &literal.name {
                declare(cx, name, f, true);
            }
        }
    }
    let mut last = Value::Undefined;
    for stmt in stmts {
        match exec_stmt(iso, cx, stmt)? {
            Flow::Normal(v) => last = v,
            other => return Ok(other),
        }
    }
    Ok(Flow::Normal(last))
}

fn exec_stmt(iso: &Isolate, cx: &mut ExecCtx, stmt: &Stmt) -> Result<Flow, EngineError> {
    iso.check_safepoint()?;
    match stmt {
        Stmt::Empty | Stmt::Func(_) => Ok(Flow::Normal(Value::Undefined)),
        Stmt::Expr(expr) => Ok(Flow::Normal(eval_expr(iso, cx, expr)?)),
        Stmt::VarDecl { kind, name, init } => {
            let value = match init {
                Some(expr) => eval_expr(iso, cx, expr)?,
                None => Value::Undefined,
            };
            declare(cx, name, value, *kind != DeclKind::Const);
            Ok(Flow::Normal(Value::Undefined))
        }
        Stmt::Multi(decls) => {
            for decl in decls {
                match exec_stmt(iso, cx, decl)? {
                    Flow::Normal(_) => {}
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal(Value::Undefined))
        }
        Stmt::Return(expr) => {
            let value = match expr {
                Some(e) => eval_expr(iso, cx, e)?,
                None => Value::Undefined,
            };
            Ok(Flow::Return(value))
        }
        Stmt::If { cond, cons, alt } => {
            if eval_expr(iso, cx, cond)?.truthy() {
                exec_stmt(iso, cx, cons)
            } else if let Some(alt) = alt {
                exec_stmt(iso, cx, alt)
            } else {
                Ok(Flow::Normal(Value::Undefined))
            }
        }
        Stmt::While { cond, body } => {
            loop {
                iso.check_safepoint()?;
                if !eval_expr(iso, cx, cond)?.truthy() {
                    break;
                }
                match exec_stmt(iso, cx, body)? {
                    Flow::Break => break,
                    Flow::Continue | Flow::Normal(_) => {}
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal(Value::Undefined))
        }
        Stmt::For {
            init,
            cond,
            update,
            body,
        } => {
            let parent = cx.scope.clone();
            cx.scope = ScopeData::new(Some(parent.clone()));
            let result = (|| {
                if let Some(init) = init {
                    exec_stmt(iso, cx, init)?;
                }
                loop {
                    iso.check_safepoint()?;
                    if let Some(cond) = cond {
                        if !eval_expr(iso, cx, cond)?.truthy() {
                            break;
                        }
                    }
                    match exec_stmt(iso, cx, body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal(_) => {}
                        other => return Ok(other),
                    }
                    if let Some(update) = update {
                        eval_expr(iso, cx, update)?;
                    }
                }
                Ok(Flow::Normal(Value::Undefined))
            })();
            cx.scope = parent;
            result
        }
        Stmt::Block(body) => {
            let parent = cx.scope.clone();
            cx.scope = ScopeData::new(Some(parent.clone()));
            let result = exec_stmts(iso, cx, body);
            cx.scope = parent;
            result
        }
        Stmt::Throw(expr) => {
            let value = eval_expr(iso, cx, expr)?;
            attach_stack_if_error(iso, &value);
            Err(EngineError::Thrown(value))
        }
        Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        } => {
            let parent = cx.scope.clone();
            cx.scope = ScopeData::new(Some(parent.clone()));
            let mut outcome = exec_stmts(iso, cx, block);
            cx.scope = parent.clone();
            if let (Err(EngineError::Thrown(exception)), Some(handler)) = (&outcome, handler) {
                let exception = exception.clone();
                cx.scope = ScopeData::new(Some(parent.clone()));
                if let Some(param) = param {
                    declare(cx, param, exception, true);
                }
                outcome = exec_stmts(iso, cx, handler);
                cx.scope = parent.clone();
            }
            if let Some(finalizer) = finalizer {
                cx.scope = ScopeData::new(Some(parent.clone()));
                let fin = exec_stmts(iso, cx, finalizer);
                cx.scope = parent;
                match fin? {
                    Flow::Normal(_) => {}
                    other => return Ok(other),
                }
            }
            outcome
        }
        Stmt::Break => Ok(Flow::Break),
        Stmt::Continue => Ok(Flow::Continue),
        Stmt::Import {
            named,
            namespace,
            source,
        } => {
            let Some(module) = cx.module.clone() else {
                return Err(iso.throw_syntax_error("Cannot use import statement outside a module"));
            };
            let dep_namespace = {
                let record = module.record.borrow();
                match record.resolutions.get(source) {
                    Some(dep) => crate::module::module_namespace(dep)
                        .ok_or_else(|| iso.throw_reference_error(&format!(
                            "Module \"{}\" has not been evaluated",
                            source
                        )))?,
                    None => {
                        return Err(iso.throw_reference_error(&format!(
                            "Module \"{}\" was not resolved",
                            source
                        )))
                    }
                }
            };
            if let Some(local) = namespace {
                declare(cx, local, Value::Object(dep_namespace.clone()), false);
            }
            for (imported, local) in named {
                let value = match dep_namespace.get_own(imported) {
                    Some(Property::Data { value, .. }) => value,
                    _ => {
                        return Err(iso.throw_syntax_error(&format!(
                            "The requested module '{}' does not provide an export named '{}'",
                            source, imported
                        )))
                    }
                };
                declare(cx, local, value, false);
            }
            Ok(Flow::Normal(Value::Undefined))
        }
        Stmt::ExportDecl(inner) => {
            let Some(module) = cx.module.clone() else {
                return Err(iso.throw_syntax_error("Cannot use export statement outside a module"));
            };
            // Hoisted function exports need their binding before execution.
            if let Stmt::Func(literal) = inner.as_ref() {
                let f = instantiate_function(iso, cx, literal)?;
                if let Some(name) = &literal.name {
                    declare(cx, name, f.clone(), true);
                    module.namespace.set_data(name, f);
                }
                return Ok(Flow::Normal(Value::Undefined));
            }
            let flow = exec_stmt(iso, cx, inner)?;
            if let Stmt::VarDecl { name, .. } = inner.as_ref() {
                if let Some(value) = lookup(cx, name) {
                    module.namespace.set_data(name, value);
                }
            }
            Ok(flow)
        }
        Stmt::ExportNamed(names) => {
            let Some(module) = cx.module.clone() else {
                return Err(iso.throw_syntax_error("Cannot use export statement outside a module"));
            };
            for (local, exported) in names {
                let value = lookup(cx, local).ok_or_else(|| {
                    iso.throw_reference_error(&format!("{} is not defined", local))
                })?;
                module.namespace.set_data(exported, value);
            }
            Ok(Flow::Normal(Value::Undefined))
        }
    }
}

fn declare(cx: &ExecCtx, name: &str, value: Value, mutable: bool) {
    cx.scope
        .borrow_mut()
        .vars
        .insert(name.to_string(), Binding { value, mutable });
}

fn lookup(cx: &ExecCtx, name: &str) -> Option<Value> {
    let mut scope = Some(cx.scope.clone());
    while let Some(s) = scope {
        if let Some(binding) = s.borrow().vars.get(name) {
            return Some(binding.value.clone());
        }
        scope = s.borrow().parent.clone();
    }
    // Fall back to the global object.
    if name == "globalThis" {
        return Some(Value::Object(cx.global.clone()));
    }
    match cx.global.get_own(name) {
        Some(Property::Data { value, .. }) => Some(value),
        _ => None,
    }
}

/// Assign through the scope chain; undeclared targets land on the global.
fn assign_ident(iso: &Isolate, cx: &ExecCtx, name: &str, value: Value) -> Completion<()> {
    let mut scope = Some(cx.scope.clone());
    while let Some(s) = scope {
        let mut data = s.borrow_mut();
        if let Some(binding) = data.vars.get_mut(name) {
            if !binding.mutable {
                drop(data);
                return Err(iso.throw_type_error("Assignment to constant variable."));
            }
            binding.value = value;
            return Ok(());
        }
        let parent = data.parent.clone();
        drop(data);
        scope = parent;
    }
    cx.global.set_data(name, value);
    Ok(())
}

fn instantiate_function(
    iso: &Isolate,
    cx: &ExecCtx,
    literal: &Rc<FunctionLiteral>,
) -> Completion {
    let captured_this = if literal.is_arrow {
        Some(Box::new(cx.this.clone()))
    } else {
        None
    };
    let data = FunctionData {
        name: literal.name.clone().unwrap_or_default(),
        length: literal.params.len() as u32,
        kind: FnKind::Script(ScriptFnData {
            literal: Rc::clone(literal),
            env: cx.scope.clone(),
            global: cx.global.clone(),
            captured_this,
        }),
    };
    let obj = iso.alloc_object(ObjectKind::Function(data))?;
    if !literal.is_arrow {
        let prototype = iso.alloc_object(ObjectKind::Plain)?;
        prototype.set_hidden("constructor", Value::Object(obj.clone()));
        obj.set_hidden("prototype", Value::Object(prototype));
    }
    Ok(Value::Object(obj))
}

pub fn eval_expr(iso: &Isolate, cx: &mut ExecCtx, expr: &Expr) -> Completion {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::BigInt(b) => Ok(Value::BigInt(b.clone())),
        Expr::Str(s) => Ok(Value::String(iso.alloc_string(s)?)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::This => Ok(cx.this.clone()),
        Expr::Ident(name) => {
            if name == "undefined" {
                return Ok(Value::Undefined);
            }
            if name == "NaN" {
                return Ok(Value::Number(f64::NAN));
            }
            if name == "Infinity" {
                return Ok(Value::Number(f64::INFINITY));
            }
            lookup(cx, name)
                .ok_or_else(|| iso.throw_reference_error(&format!("{} is not defined", name)))
        }
        Expr::Array(items) => {
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                elements.push(eval_expr(iso, cx, item)?);
            }
            let obj = iso.alloc_object(ObjectKind::Array(elements))?;
            Ok(Value::Object(obj))
        }
        Expr::ObjectLit(props) => {
            let obj = iso.alloc_object(ObjectKind::Plain)?;
            for (key, value_expr) in props {
                let value = eval_expr(iso, cx, value_expr)?;
                obj.set_data(key, value);
            }
            Ok(Value::Object(obj))
        }
        Expr::Func(literal) => instantiate_function(iso, cx, literal),
        Expr::Unary { op, expr } => match op {
            UnaryOp::TypeOf => {
                // `typeof missing` is "undefined", not a ReferenceError.
                if let Expr::Ident(name) = expr.as_ref() {
                    if lookup(cx, name).is_none() {
                        return Ok(Value::String(iso.alloc_string("undefined")?));
                    }
                }
                let value = eval_expr(iso, cx, expr)?;
                Ok(Value::String(iso.alloc_string(value.type_of())?))
            }
            UnaryOp::Delete => {
                if let Expr::Member { object, property } = expr.as_ref() {
                    let target = eval_expr(iso, cx, object)?;
                    let key = member_key_string(iso, cx, property)?;
                    if let Value::Object(obj) = target {
                        return Ok(Value::Bool(obj.delete(&key)));
                    }
                }
                Ok(Value::Bool(true))
            }
            UnaryOp::Void => {
                eval_expr(iso, cx, expr)?;
                Ok(Value::Undefined)
            }
            UnaryOp::Not => Ok(Value::Bool(!eval_expr(iso, cx, expr)?.truthy())),
            UnaryOp::Neg => {
                let value = eval_expr(iso, cx, expr)?;
                if let Value::BigInt(b) = value {
                    return Ok(Value::BigInt(-b));
                }
                Ok(Value::Number(-to_number(&value)))
            }
            UnaryOp::Plus => Ok(Value::Number(to_number(&eval_expr(iso, cx, expr)?))),
        },
        Expr::Binary { op, left, right } => {
            let l = eval_expr(iso, cx, left)?;
            let r = eval_expr(iso, cx, right)?;
            binary_op(iso, *op, l, r)
        }
        Expr::Logical { op, left, right } => {
            let l = eval_expr(iso, cx, left)?;
            match op {
                LogicalOp::And => {
                    if l.truthy() {
                        eval_expr(iso, cx, right)
                    } else {
                        Ok(l)
                    }
                }
                LogicalOp::Or => {
                    if l.truthy() {
                        Ok(l)
                    } else {
                        eval_expr(iso, cx, right)
                    }
                }
                LogicalOp::Nullish => {
                    if l.is_nullish() {
                        eval_expr(iso, cx, right)
                    } else {
                        Ok(l)
                    }
                }
            }
        }
        Expr::Assign { op, target, value } => {
            let rhs = eval_expr(iso, cx, value)?;
            let final_value = if *op == AssignOp::Assign {
                rhs
            } else {
                let current = eval_expr(iso, cx, target)?;
                let bin = match op {
                    AssignOp::Add => BinaryOp::Add,
                    AssignOp::Sub => BinaryOp::Sub,
                    AssignOp::Mul => BinaryOp::Mul,
                    AssignOp::Div => BinaryOp::Div,
                    AssignOp::Rem => BinaryOp::Rem,
                    AssignOp::Assign => BinaryOp::Add,
                };
                binary_op(iso, bin, current, rhs)?
            };
            match target.as_ref() {
                Expr::Ident(name) => assign_ident(iso, cx, name, final_value.clone())?,
                Expr::Member { object, property } => {
                    let obj = eval_expr(iso, cx, object)?;
                    let key = member_key_string(iso, cx, property)?;
                    set_member(iso, &obj, &key, final_value.clone())?;
                }
                _ => return Err(iso.throw_syntax_error("Invalid assignment target")),
            }
            Ok(final_value)
        }
        Expr::Update {
            prefix,
            increment,
            target,
        } => {
            let current = to_number(&eval_expr(iso, cx, target)?);
            let next = if *increment {
                current + 1.0
            } else {
                current - 1.0
            };
            match target.as_ref() {
                Expr::Ident(name) => assign_ident(iso, cx, name, Value::Number(next))?,
                Expr::Member { object, property } => {
                    let obj = eval_expr(iso, cx, object)?;
                    let key = member_key_string(iso, cx, property)?;
                    set_member(iso, &obj, &key, Value::Number(next))?;
                }
                _ => return Err(iso.throw_syntax_error("Invalid update target")),
            }
            Ok(Value::Number(if *prefix { next } else { current }))
        }
        Expr::Cond { test, cons, alt } => {
            if eval_expr(iso, cx, test)?.truthy() {
                eval_expr(iso, cx, cons)
            } else {
                eval_expr(iso, cx, alt)
            }
        }
        Expr::Call { callee, args } => {
            let (f, this) = match callee.as_ref() {
                Expr::Member { object, property } => {
                    let receiver = eval_expr(iso, cx, object)?;
                    let key = member_key_string(iso, cx, property)?;
                    let f = get_member(iso, &receiver, &key)?;
                    (f, receiver)
                }
                _ => (eval_expr(iso, cx, callee)?, Value::Undefined),
            };
            let mut argv = Vec::with_capacity(args.len());
            for arg in args {
                argv.push(eval_expr(iso, cx, arg)?);
            }
            call_function(iso, &f, &this, &argv)
        }
        Expr::New { callee, args } => {
            let f = eval_expr(iso, cx, callee)?;
            let mut argv = Vec::with_capacity(args.len());
            for arg in args {
                argv.push(eval_expr(iso, cx, arg)?);
            }
            construct(iso, &f, &argv)
        }
        Expr::Member { object, property } => {
            let target = eval_expr(iso, cx, object)?;
            let key = member_key_string(iso, cx, property)?;
            get_member(iso, &target, &key)
        }
    }
}

fn member_key_string(iso: &Isolate, cx: &mut ExecCtx, key: &MemberKey) -> Completion<String> {
    match key {
        MemberKey::Static(name) => Ok(name.clone()),
        MemberKey::Computed(expr) => {
            let value = eval_expr(iso, cx, expr)?;
            Ok(value_to_display(&value))
        }
    }
}

/// ToString for property keys and string concatenation.
pub fn value_to_display(value: &Value) -> String {
    match value {
        Value::Undefined => "undefined".to_string(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => number_to_string(*n),
        Value::BigInt(b) => b.to_string(),
        Value::String(s) => s.to_rust_string(),
        Value::Object(o) => {
            let data = o.borrow();
            match &data.kind {
                ObjectKind::Array(items) => {
                    let items = items.clone();
                    drop(data);
                    items
                        .iter()
                        .map(value_to_display)
                        .collect::<Vec<_>>()
                        .join(",")
                }
                ObjectKind::Error(_) => {
                    let name = match data.properties.get("name") {
                        Some(Property::Data { value, .. }) => value_to_display_shallow(value),
                        _ => "Error".to_string(),
                    };
                    let message = match data.properties.get("message") {
                        Some(Property::Data { value, .. }) => value_to_display_shallow(value),
                        _ => String::new(),
                    };
                    if message.is_empty() {
                        name
                    } else {
                        format!("{}: {}", name, message)
                    }
                }
                ObjectKind::Function(f) => format!("function {}() {{ [native code] }}", f.name),
                _ => "[object Object]".to_string(),
            }
        }
    }
}

fn value_to_display_shallow(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_rust_string(),
        other => value_to_display(other),
    }
}

/// ToNumber.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => *n,
        Value::Bool(true) => 1.0,
        Value::Bool(false) | Value::Null => 0.0,
        Value::Undefined => f64::NAN,
        Value::BigInt(_) => f64::NAN,
        Value::String(s) => {
            let text = s.to_rust_string();
            let trimmed = text.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse().unwrap_or(f64::NAN)
            }
        }
        Value::Object(o) => match &o.borrow().kind {
            ObjectKind::Date(ms) => *ms,
            _ => f64::NAN,
        },
    }
}

fn binary_op(iso: &Isolate, op: BinaryOp, l: Value, r: Value) -> Completion {
    match op {
        BinaryOp::Add => {
            if let (Value::BigInt(a), Value::BigInt(b)) = (&l, &r) {
                return Ok(Value::BigInt(a + b));
            }
            if matches!(l, Value::String(_) | Value::Object(_))
                || matches!(r, Value::String(_) | Value::Object(_))
            {
                let text = format!("{}{}", value_to_display(&l), value_to_display(&r));
                return Ok(Value::String(iso.alloc_string(&text)?));
            }
            if matches!(l, Value::BigInt(_)) || matches!(r, Value::BigInt(_)) {
                return Err(iso.throw_type_error("Cannot mix BigInt and other types"));
            }
            Ok(Value::Number(to_number(&l) + to_number(&r)))
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem | BinaryOp::Pow => {
            if let (Value::BigInt(a), Value::BigInt(b)) = (&l, &r) {
                let result = match op {
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => {
                        if *b == BigInt::from(0) {
                            return Err(iso.throw_range_error("Division by zero"));
                        }
                        a / b
                    }
                    BinaryOp::Rem => {
                        if *b == BigInt::from(0) {
                            return Err(iso.throw_range_error("Division by zero"));
                        }
                        a % b
                    }
                    _ => return Err(iso.throw_type_error("Unsupported BigInt operation")),
                };
                return Ok(Value::BigInt(result));
            }
            if matches!(l, Value::BigInt(_)) || matches!(r, Value::BigInt(_)) {
                return Err(iso.throw_type_error("Cannot mix BigInt and other types"));
            }
            let a = to_number(&l);
            let b = to_number(&r);
            let result = match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                BinaryOp::Pow => a.powf(b),
                _ => f64::NAN,
            };
            Ok(Value::Number(result))
        }
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
            let result = if let (Value::String(a), Value::String(b)) = (&l, &r) {
                let (a, b) = (a.code_units(), b.code_units());
                match op {
                    BinaryOp::Lt => a < b,
                    BinaryOp::Gt => a > b,
                    BinaryOp::Le => a <= b,
                    _ => a >= b,
                }
            } else {
                let a = to_number(&l);
                let b = to_number(&r);
                if a.is_nan() || b.is_nan() {
                    false
                } else {
                    match op {
                        BinaryOp::Lt => a < b,
                        BinaryOp::Gt => a > b,
                        BinaryOp::Le => a <= b,
                        _ => a >= b,
                    }
                }
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::EqStrict => Ok(Value::Bool(l.strict_eq(&r))),
        BinaryOp::NeStrict => Ok(Value::Bool(!l.strict_eq(&r))),
        BinaryOp::EqLoose => Ok(Value::Bool(loose_eq(&l, &r))),
        BinaryOp::NeLoose => Ok(Value::Bool(!loose_eq(&l, &r))),
        BinaryOp::InstanceOf => instance_of(iso, &l, &r),
        BinaryOp::In => {
            let key = value_to_display(&l);
            match &r {
                Value::Object(obj) => Ok(Value::Bool(has_property(obj, &key))),
                _ => Err(iso.throw_type_error("Cannot use 'in' operator on a non-object")),
            }
        }
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    if l.strict_eq(r) {
        return true;
    }
    match (l, r) {
        (Value::Null, Value::Undefined) | (Value::Undefined, Value::Null) => true,
        (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_))
        | (Value::Bool(_), _)
        | (_, Value::Bool(_)) => {
            let (a, b) = (to_number(l), to_number(r));
            !a.is_nan() && a == b
        }
        _ => false,
    }
}

fn instance_of(iso: &Isolate, l: &Value, r: &Value) -> Completion {
    let Some(ctor) = r.as_object().filter(|o| o.is_function()) else {
        return Err(iso.throw_type_error("Right-hand side of 'instanceof' is not callable"));
    };
    let ctor_name = match &ctor.borrow().kind {
        ObjectKind::Function(f) => f.name.clone(),
        _ => String::new(),
    };
    // Error classes are matched structurally; other functions by prototype.
    if let Some(obj) = l.as_object() {
        if let ObjectKind::Error(kind) = &obj.borrow().kind {
            let matches = ctor_name == "Error" || ctor_name == kind.name();
            return Ok(Value::Bool(matches));
        }
        if let ObjectKind::Promise(_) = &obj.borrow().kind {
            return Ok(Value::Bool(ctor_name == "Promise"));
        }
        if let Some(Property::Data {
            value: Value::Object(proto),
            ..
        }) = ctor.get_own("prototype")
        {
            let mut cursor = obj.prototype();
            while let Some(p) = cursor {
                if p.ptr_eq(&proto) {
                    return Ok(Value::Bool(true));
                }
                cursor = p.prototype();
            }
        }
    }
    Ok(Value::Bool(false))
}

fn has_property(obj: &Object, key: &str) -> bool {
    if obj.has_own(key) {
        return true;
    }
    let mut cursor = obj.prototype();
    while let Some(p) = cursor {
        if p.has_own(key) {
            return true;
        }
        cursor = p.prototype();
    }
    false
}

/// Property read with full semantics: exotic kinds, own properties,
/// accessors, prototype chain, primitive methods.
pub fn get_member(iso: &Isolate, target: &Value, key: &str) -> Completion {
    match target {
        Value::Undefined | Value::Null => Err(iso.throw_type_error(&format!(
            "Cannot read properties of {} (reading '{}')",
            value_to_display(target),
            key
        ))),
        Value::String(s) => {
            if key == "length" {
                return Ok(Value::Number(s.len_units() as f64));
            }
            if let Ok(index) = key.parse::<usize>() {
                let units = s.code_units();
                return match units.get(index) {
                    Some(&unit) => {
                        let text = String::from_utf16_lossy(&[unit]);
                        Ok(Value::String(iso.alloc_string(&text)?))
                    }
                    None => Ok(Value::Undefined),
                };
            }
            crate::builtins::string_method(iso, key)
        }
        Value::Object(obj) => {
            // Exotic slots first.
            {
                let data = obj.borrow();
                match &data.kind {
                    ObjectKind::Array(items) => {
                        if key == "length" {
                            return Ok(Value::Number(items.len() as f64));
                        }
                        if let Ok(index) = key.parse::<usize>() {
                            return Ok(items.get(index).cloned().unwrap_or_default());
                        }
                        if crate::builtins::is_array_method(key) {
                            drop(data);
                            return crate::builtins::array_method(iso, key);
                        }
                    }
                    ObjectKind::ArrayBuffer(buffer) => {
                        if key == "byteLength" {
                            return Ok(Value::Number(buffer.byte_length() as f64));
                        }
                    }
                    ObjectKind::View(view) => match key {
                        "byteLength" => return Ok(Value::Number(view.byte_length as f64)),
                        "byteOffset" => return Ok(Value::Number(view.byte_offset as f64)),
                        "buffer" => return Ok(Value::Object(view.buffer.clone())),
                        "length" => {
                            return Ok(Value::Number(
                                (view.byte_length / view.ty.element_size()) as f64,
                            ))
                        }
                        _ => {
                            if let Ok(index) = key.parse::<usize>() {
                                drop(data);
                                return read_view_index(iso, obj, index);
                            }
                        }
                    },
                    ObjectKind::Promise(_) => {
                        if key == "then" || key == "catch" || key == "finally" {
                            drop(data);
                            return crate::builtins::promise_method(iso, key);
                        }
                    }
                    ObjectKind::Function(f) => {
                        if key == "name" && !data.properties.contains_key("name") {
                            let name = f.name.clone();
                            drop(data);
                            return Ok(Value::String(iso.alloc_string(&name)?));
                        }
                        if key == "length" && !data.properties.contains_key("length") {
                            return Ok(Value::Number(f.length as f64));
                        }
                    }
                    ObjectKind::Date(ms) => {
                        if key == "getTime" || key == "valueOf" {
                            let ms = *ms;
                            drop(data);
                            return Ok(iso.new_native_function("getTime", 0, move |_, _, _| {
                                Ok(Value::Number(ms))
                            })?);
                        }
                    }
                    ObjectKind::Proxy(proxy) => {
                        // In-isolate access forwards to the target.
                        let target = proxy.target.clone();
                        drop(data);
                        return get_member(iso, &target, key);
                    }
                    _ => {}
                }
            }
            // Own properties, then the prototype chain.
            let mut cursor = Some(obj.clone());
            while let Some(current) = cursor {
                match current.get_own(key) {
                    Some(Property::Data { value, .. }) => return Ok(value),
                    Some(Property::Accessor { get, .. }) => {
                        return match get {
                            Some(getter) => call_function(iso, &getter, target, &[]),
                            None => Ok(Value::Undefined),
                        }
                    }
                    None => cursor = current.prototype(),
                }
            }
            Ok(Value::Undefined)
        }
        _ => Ok(Value::Undefined),
    }
}

fn read_view_index(iso: &Isolate, view_obj: &Object, index: usize) -> Completion {
    let data = view_obj.borrow();
    let ObjectKind::View(view) = &data.kind else {
        return Ok(Value::Undefined);
    };
    let element = view.ty.element_size();
    let offset = view.byte_offset + index * element;
    if offset + element > view.byte_offset + view.byte_length {
        return Ok(Value::Undefined);
    }
    let buffer = view.buffer.clone();
    let ty = view.ty;
    drop(data);
    let bytes = {
        let data = buffer.borrow();
        let ObjectKind::ArrayBuffer(buf) = &data.kind else {
            return Ok(Value::Undefined);
        };
        let Some(store) = &buf.store else {
            return Err(iso.throw_type_error("Cannot perform operation on a detached ArrayBuffer"));
        };
        let bytes = store.read();
        if offset + element > bytes.len() {
            return Ok(Value::Undefined);
        }
        bytes[offset..offset + element].to_vec()
    };
    Ok(Value::Number(crate::builtins::decode_element(&bytes, ty)))
}

/// Property write with array/view/accessor handling.
pub fn set_member(iso: &Isolate, target: &Value, key: &str, value: Value) -> Completion<()> {
    let Value::Object(obj) = target else {
        // Writes to primitives are silently dropped, as in sloppy mode.
        return Ok(());
    };
    {
        let mut data = obj.borrow_mut();
        match &mut data.kind {
            ObjectKind::Array(items) => {
                if let Ok(index) = key.parse::<usize>() {
                    if index >= items.len() {
                        items.resize(index + 1, Value::Undefined);
                    }
                    items[index] = value;
                    return Ok(());
                }
            }
            ObjectKind::View(view) => {
                if let Ok(index) = key.parse::<usize>() {
                    let element = view.ty.element_size();
                    let offset = view.byte_offset + index * element;
                    let in_range = offset + element <= view.byte_offset + view.byte_length;
                    let buffer = view.buffer.clone();
                    let ty = view.ty;
                    drop(data);
                    if in_range {
                        write_view_index(iso, &buffer, ty, offset, &value)?;
                    }
                    return Ok(());
                }
            }
            ObjectKind::Proxy(proxy) => {
                let target = proxy.target.clone();
                drop(data);
                return set_member(iso, &target, key, value);
            }
            _ => {}
        }
    }
    // Accessor on the receiver or its chain?
    let mut cursor = Some(obj.clone());
    while let Some(current) = cursor {
        if let Some(Property::Accessor { set, .. }) = current.get_own(key) {
            return match set {
                Some(setter) => {
                    call_function(iso, &setter, target, &[value])?;
                    Ok(())
                }
                None => Ok(()),
            };
        }
        if current.has_own(key) {
            break;
        }
        cursor = current.prototype();
    }
    obj.set_data(key, value);
    Ok(())
}

fn write_view_index(
    iso: &Isolate,
    buffer: &Object,
    ty: crate::value::ViewType,
    offset: usize,
    value: &Value,
) -> Completion<()> {
    let data = buffer.borrow();
    let ObjectKind::ArrayBuffer(buf) = &data.kind else {
        return Ok(());
    };
    let Some(store) = &buf.store else {
        return Err(iso.throw_type_error("Cannot perform operation on a detached ArrayBuffer"));
    };
    let mut bytes = store.write();
    let element = ty.element_size();
    if offset + element > bytes.len() {
        return Ok(());
    }
    crate::builtins::encode_element(&mut bytes[offset..offset + element], ty, to_number(value));
    Ok(())
}

/// Invoke a callable value.
pub fn call_function(iso: &Isolate, callee: &Value, this: &Value, args: &[Value]) -> Completion {
    let Some(obj) = callee.as_object().filter(|o| o.is_function()) else {
        return Err(iso.throw_type_error(&format!(
            "{} is not a function",
            value_to_display(callee)
        )));
    };
    let (name, kind) = {
        let data = obj.borrow();
        let ObjectKind::Function(f) = &data.kind else {
            return Err(iso.throw_type_error("callee is not a function"));
        };
        let kind = match &f.kind {
            FnKind::Native(native) => FnInvoke::Native(native.clone()),
            FnKind::Script(script) => FnInvoke::Script(
                Rc::clone(&script.literal),
                script.env.clone(),
                script.global.clone(),
                script.captured_this.as_deref().cloned(),
            ),
        };
        (f.name.clone(), kind)
    };
    match kind {
        FnInvoke::Native(native) => native(iso, this, args),
        FnInvoke::Script(literal, env, global, captured_this) => {
            let _frame = iso.push_frame(&name, MAX_CALL_DEPTH)?;
            let scope = ScopeData::new(Some(env));
            {
                let mut data = scope.borrow_mut();
                for (i, param) in literal.params.iter().enumerate() {
                    data.vars.insert(
                        param.clone(),
                        Binding {
                            value: args.get(i).cloned().unwrap_or_default(),
                            mutable: true,
                        },
                    );
                }
                // `arguments` object, array-flavored.
                if !literal.is_arrow {
                    drop(data);
                    let args_obj = iso.alloc_object(ObjectKind::Array(args.to_vec()))?;
                    scope.borrow_mut().vars.insert(
                        "arguments".to_string(),
                        Binding {
                            value: Value::Object(args_obj),
                            mutable: true,
                        },
                    );
                }
            }
            let this_value = match captured_this {
                Some(v) => v,
                None => this.clone(),
            };
            let mut cx = ExecCtx {
                global,
                scope,
                this: this_value,
                origin: Rc::from("<function>"),
                module: None,
            };
            if literal.is_async {
                let promise = iso.new_promise()?;
                match exec_stmts(iso, &mut cx, &literal.body) {
                    Ok(Flow::Return(v)) | Ok(Flow::Normal(v)) => {
                        promise::resolve_promise(iso, &promise, v);
                    }
                    Ok(_) => promise::settle_promise(iso, &promise, true, Value::Undefined),
                    Err(EngineError::Thrown(err)) => {
                        promise::settle_promise(iso, &promise, false, err);
                    }
                    Err(fatal) => return Err(fatal),
                }
                Ok(Value::Object(promise))
            } else {
                match exec_stmts(iso, &mut cx, &literal.body)? {
                    Flow::Return(v) => Ok(v),
                    _ => Ok(Value::Undefined),
                }
            }
        }
    }
}

enum FnInvoke {
    Native(crate::value::NativeFn),
    Script(Rc<FunctionLiteral>, ScopeRef, Object, Option<Value>),
}

/// The `new` operator.
pub fn construct(iso: &Isolate, callee: &Value, args: &[Value]) -> Completion {
    let Some(obj) = callee.as_object().filter(|o| o.is_function()) else {
        return Err(iso.throw_type_error("not a constructor"));
    };
    let is_native = matches!(
        &obj.borrow().kind,
        ObjectKind::Function(FunctionData {
            kind: FnKind::Native(_),
            ..
        })
    );
    if is_native {
        // Native constructors build and return their own instance.
        return call_function(iso, callee, &Value::Undefined, args);
    }
    let proto = match obj.get_own("prototype") {
        Some(Property::Data {
            value: Value::Object(p),
            ..
        }) => Some(p),
        _ => None,
    };
    let instance = iso.alloc_object_with_proto(ObjectKind::Plain, proto)?;
    let result = call_function(iso, callee, &Value::Object(instance.clone()), args)?;
    match result {
        Value::Object(o) => Ok(Value::Object(o)),
        _ => Ok(Value::Object(instance)),
    }
}

/// Attach a `stack` property to error objects at throw sites that lack one.
pub fn attach_stack_if_error(iso: &Isolate, value: &Value) {
    if let Value::Object(obj) = value {
        let is_error = matches!(obj.borrow().kind, ObjectKind::Error(_));
        if is_error && !obj.has_own("stack") {
            if let Ok(stack) = iso.alloc_string(&iso.capture_stack()) {
                obj.set_hidden("stack", Value::String(stack));
            }
        }
    }
}

