//! Tree-walking evaluator for lowered programs.
//!
//! The namespace holds the module's own bindings plus the builtins in
//! `builtins`; nothing else is reachable. Every statement, loop iteration
//! and call ticks the meter, so cancellation is observed promptly.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use super::builtins::{self, Builtin};
use super::methods;
use super::error::{ExcClass, Fault, Flow, Raised};
use super::meter::{Charge, Meter};
use super::ops;
use super::value::{self, Dict, DictObj, ListObj, Range, StrObj, TupleObj, Value, DICT_ENTRY, SLOT, STR_HEADER};
use crate::lang::ast::{
    BinOp, BoolOp, Clause, Expr, FPart, FormatSpec, FunctionDef, Literal, Program, Stmt, StmtKind,
    Target,
};
use crate::policy::ENTRY_POINT;

/// Bytes charged for each active call frame.
const FRAME_BYTES: usize = 256;
/// Bytes charged for each function object.
const CLOSURE_BYTES: usize = 64;

/// A variable scope. Assignment always binds in the innermost scope;
/// lookup walks outwards.
pub struct Scope {
    vars: RefCell<HashMap<String, Value>>,
    parent: Option<Rc<Scope>>,
    tracked: Cell<bool>,
}

impl Scope {
    pub fn root() -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent: None,
            tracked: Cell::new(false),
        })
    }

    pub fn child(parent: &Rc<Scope>) -> Rc<Self> {
        Rc::new(Self {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
            tracked: Cell::new(false),
        })
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.vars.borrow().get(name) {
            return Some(value.clone());
        }
        let mut current = self.parent.clone();
        while let Some(scope) = current {
            if let Some(value) = scope.vars.borrow().get(name) {
                return Some(value.clone());
            }
            current = scope.parent.clone();
        }
        None
    }

    pub fn set(&self, name: &str, value: Value) {
        // drop the old binding outside the borrow
        let old = self.vars.borrow_mut().insert(name.to_string(), value);
        drop(old);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.vars.borrow_mut().remove(name)
    }

    pub(crate) fn take_all(&self) -> HashMap<String, Value> {
        std::mem::take(&mut *self.vars.borrow_mut())
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        value::release(self.vars.get_mut().drain().map(|(_, v)| v).collect());
    }
}

/// A `def` or `lambda` together with the scope it was created in.
pub struct Closure {
    pub def: Arc<FunctionDef>,
    pub env: Rc<Scope>,
    _charge: Charge,
}

enum Signal {
    Next,
    Break,
    Continue,
    Return(Value),
}

/// Lazy iteration state over an iterable value.
pub enum Iter {
    List(Rc<ListObj>, usize),
    Tuple(Rc<TupleObj>, usize),
    Chars(Rc<StrObj>, usize),
    /// Live view over a dict's keys with the length it started at.
    Dict(Rc<DictObj>, usize, usize),
    Range(Range, usize),
}

enum Produce<'e> {
    Item(&'e Expr),
    Pair(&'e Expr, &'e Expr),
}

struct Collector {
    items: Vec<Value>,
    dict: Dict,
    charge: Charge,
}

pub struct Interp {
    meter: Rc<Meter>,
    depth: usize,
    max_depth: usize,
}

impl Interp {
    pub fn new(meter: Rc<Meter>, max_depth: usize) -> Self {
        Self {
            meter,
            depth: 0,
            max_depth,
        }
    }

    pub fn meter(&self) -> &Rc<Meter> {
        &self.meter
    }

    /// Execute the module body, then call the entry point with `argument`.
    pub fn run(&mut self, program: &Program, argument: Value) -> Flow<Value> {
        let module = Scope::root();
        self.track(&module);
        self.exec_block(&program.body, &module)?;
        let entry = module.lookup(ENTRY_POINT).ok_or_else(|| {
            Fault::raise(
                ExcClass::NameError,
                format!("name '{ENTRY_POINT}' is not defined"),
            )
        })?;
        self.call(&entry, vec![argument], Vec::new())
    }

    fn track(&self, scope: &Rc<Scope>) {
        if !scope.tracked.replace(true) {
            self.meter.track_scope(scope);
        }
    }

    // ── statements ──────────────────────────────────────────────────

    fn exec_block(&mut self, body: &[Stmt], scope: &Rc<Scope>) -> Flow<Signal> {
        for stmt in body {
            match self.exec(stmt, scope).map_err(|f| f.at_line(stmt.line))? {
                Signal::Next => {}
                other => return Ok(other),
            }
        }
        Ok(Signal::Next)
    }

    fn exec(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> Flow<Signal> {
        self.meter.tick()?;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope)?;
                for target in targets {
                    self.assign(target, value.clone(), scope)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, scope)?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::None,
                };
                return Ok(Signal::Return(value));
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test, scope)?.truthy() {
                        return self.exec_block(body, scope);
                    }
                }
                return self.exec_block(orelse, scope);
            }
            StmtKind::While { test, body } => {
                while self.eval(test, scope)?.truthy() {
                    self.meter.tick()?;
                    match self.exec_block(body, scope)? {
                        Signal::Break => break,
                        Signal::Return(value) => return Ok(Signal::Return(value)),
                        Signal::Next | Signal::Continue => {}
                    }
                }
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter, scope)?;
                let mut it = self.iter(&iterable)?;
                while let Some(item) = self.next(&mut it)? {
                    self.assign(target, item, scope)?;
                    match self.exec_block(body, scope)? {
                        Signal::Break => break,
                        Signal::Return(value) => return Ok(Signal::Return(value)),
                        Signal::Next | Signal::Continue => {}
                    }
                }
            }
            StmtKind::Break => return Ok(Signal::Break),
            StmtKind::Continue => return Ok(Signal::Continue),
            StmtKind::Pass => {}
            StmtKind::FunctionDef(def) => {
                let function = self.closure(def, scope)?;
                scope.set(&def.name, function);
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete(target, scope)?;
                }
            }
            StmtKind::Raise(expr) => return Err(self.raise(expr.as_ref(), scope)?),
            StmtKind::Assert { test, message } => {
                if !self.eval(test, scope)?.truthy() {
                    let message = match message {
                        Some(expr) => self.eval(expr, scope)?.to_text(&self.meter)?,
                        None => String::new(),
                    };
                    return Err(Fault::raise(ExcClass::AssertionError, message));
                }
            }
        }
        Ok(Signal::Next)
    }

    /// Build the fault a `raise` statement propagates.
    fn raise(&mut self, expr: Option<&Expr>, scope: &Rc<Scope>) -> Flow<Fault> {
        let Some(expr) = expr else {
            return Ok(Fault::raise(
                ExcClass::RuntimeError,
                "No active exception to reraise",
            ));
        };
        Ok(match self.eval(expr, scope)? {
            Value::Exception(exc) => Fault::Raised(Raised {
                class: exc.class,
                message: exc.message.clone(),
                line: None,
            }),
            Value::Builtin(Builtin::Exception(class)) => Fault::raise(class, ""),
            _ => Fault::type_error("exceptions must derive from BaseException"),
        })
    }

    fn assign(&mut self, target: &Target, value: Value, scope: &Rc<Scope>) -> Flow<()> {
        match target {
            Target::Name(name) => {
                scope.set(name, value);
                Ok(())
            }
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container, scope)?;
                let index = self.eval(index, scope)?;
                ops::set_item(&self.meter, &container, &index, value)
            }
            Target::Unpack(targets) => {
                let mut it = self.iter(&value)?;
                let mut items = Vec::with_capacity(targets.len());
                while let Some(item) = self.next(&mut it)? {
                    if items.len() == targets.len() {
                        return Err(Fault::value_error(format!(
                            "too many values to unpack (expected {})",
                            targets.len()
                        )));
                    }
                    items.push(item);
                }
                if items.len() < targets.len() {
                    return Err(Fault::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    )));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, scope)?;
                }
                Ok(())
            }
        }
    }

    fn aug_assign(
        &mut self,
        target: &Target,
        op: BinOp,
        value: &Expr,
        scope: &Rc<Scope>,
    ) -> Flow<()> {
        match target {
            Target::Name(name) => {
                let current = self.lookup(name, scope)?;
                let rhs = self.eval(value, scope)?;
                let updated = self.in_place(op, &current, &rhs)?;
                scope.set(name, updated);
                Ok(())
            }
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container, scope)?;
                let index = self.eval(index, scope)?;
                let current = ops::get_item(&self.meter, &container, &index)?;
                let rhs = self.eval(value, scope)?;
                let updated = self.in_place(op, &current, &rhs)?;
                ops::set_item(&self.meter, &container, &index, updated)
            }
            Target::Unpack(_) => Err(Fault::type_error(
                "illegal expression for augmented assignment",
            )),
        }
    }

    /// `+=` extends lists in place; every other operator rebinds.
    fn in_place(&mut self, op: BinOp, current: &Value, rhs: &Value) -> Flow<Value> {
        if let (BinOp::Add, Value::List(list)) = (op, current) {
            let items = self.collect(rhs)?;
            list.edit(|v| v.extend(items))?;
            return Ok(current.clone());
        }
        ops::binary(&self.meter, op, current, rhs)
    }

    fn delete(&mut self, target: &Target, scope: &Rc<Scope>) -> Flow<()> {
        match target {
            Target::Name(name) => match scope.remove(name) {
                Some(_) => Ok(()),
                None => Err(Fault::raise(
                    ExcClass::NameError,
                    format!("name '{name}' is not defined"),
                )),
            },
            Target::Subscript {
                value: container,
                index,
            } => {
                let container = self.eval(container, scope)?;
                let index = self.eval(index, scope)?;
                ops::del_item(&self.meter, &container, &index)
            }
            Target::Unpack(targets) => {
                for target in targets {
                    self.delete(target, scope)?;
                }
                Ok(())
            }
        }
    }

    fn closure(&mut self, def: &Arc<FunctionDef>, scope: &Rc<Scope>) -> Flow<Value> {
        let charge = self.meter.charge(CLOSURE_BYTES)?;
        self.track(scope);
        Ok(Value::Function(Rc::new(Closure {
            def: Arc::clone(def),
            env: Rc::clone(scope),
            _charge: charge,
        })))
    }

    // ── expressions ─────────────────────────────────────────────────

    fn lookup(&self, name: &str, scope: &Scope) -> Flow<Value> {
        if let Some(value) = scope.lookup(name) {
            return Ok(value);
        }
        Builtin::lookup(name).map(Value::Builtin).ok_or_else(|| {
            Fault::raise(ExcClass::NameError, format!("name '{name}' is not defined"))
        })
    }

    fn eval_all(&mut self, exprs: &[Expr], scope: &Rc<Scope>) -> Flow<Vec<Value>> {
        exprs.iter().map(|e| self.eval(e, scope)).collect()
    }

    fn eval_opt(&mut self, expr: &Option<Box<Expr>>, scope: &Rc<Scope>) -> Flow<Value> {
        match expr {
            Some(expr) => self.eval(expr, scope),
            None => Ok(Value::None),
        }
    }

    pub fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Flow<Value> {
        match expr {
            Expr::Literal(literal) => Ok(match literal {
                Literal::None => Value::None,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(i) => Value::Int(*i),
                Literal::Float(f) => Value::Float(*f),
                Literal::Str(s) => Value::str(&self.meter, s.as_str())?,
            }),
            Expr::Name(name) => self.lookup(name, scope),
            Expr::FString(parts) => self.fstring(parts, scope),
            Expr::List(items) => {
                let items = self.eval_all(items, scope)?;
                Value::list(&self.meter, items)
            }
            Expr::Tuple(items) => {
                let items = self.eval_all(items, scope)?;
                Value::tuple(&self.meter, items)
            }
            Expr::Dict(pairs) => {
                let mut dict = Dict::default();
                for (key, value) in pairs {
                    let key = self.eval(key, scope)?;
                    let value = self.eval(value, scope)?;
                    dict.insert(key.hash_key()?, key, value);
                }
                Value::dict(&self.meter, dict)
            }
            Expr::Unary(op, operand) => {
                let operand = self.eval(operand, scope)?;
                ops::unary(*op, &operand)
            }
            Expr::Not(operand) => Ok(Value::Bool(!self.eval(operand, scope)?.truthy())),
            Expr::Binary(left, op, right) => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                ops::binary(&self.meter, *op, &left, &right)
            }
            Expr::Bool(op, left, right) => {
                let left = self.eval(left, scope)?;
                let short_circuit = match op {
                    BoolOp::And => !left.truthy(),
                    BoolOp::Or => left.truthy(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first, scope)?;
                for (op, right) in rest {
                    let right = self.eval(right, scope)?;
                    if !ops::compare(&self.meter, *op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfElse { test, body, orelse } => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
            Expr::Call { func, args, kwargs } => {
                let callee = self.eval(func, scope)?;
                let args = self.eval_all(args, scope)?;
                let kwargs = self.eval_kwargs(kwargs, scope)?;
                self.call(&callee, args, kwargs)
            }
            Expr::Method {
                receiver,
                name,
                args,
                kwargs,
            } => {
                let receiver = self.eval(receiver, scope)?;
                let args = self.eval_all(args, scope)?;
                let kwargs = self.eval_kwargs(kwargs, scope)?;
                methods::call_method(self, &receiver, name, args, kwargs)
            }
            Expr::Subscript(container, index) => {
                let container = self.eval(container, scope)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let lower = self.eval_opt(lower, scope)?;
                    let upper = self.eval_opt(upper, scope)?;
                    let step = self.eval_opt(step, scope)?;
                    return ops::get_slice(&self.meter, &container, &lower, &upper, &step);
                }
                let index = self.eval(index, scope)?;
                ops::get_item(&self.meter, &container, &index)
            }
            Expr::Slice { .. } => Err(Fault::type_error("slice outside a subscript")),
            Expr::Lambda(def) => self.closure(def, scope),
            Expr::ListComp { element, clauses } => {
                let mut out = self.collector()?;
                let inner = Scope::child(scope);
                self.comprehension(clauses, &inner, &Produce::Item(element), &mut out)?;
                Value::list(&self.meter, out.items)
            }
            Expr::DictComp {
                key,
                value,
                clauses,
            } => {
                let mut out = self.collector()?;
                let inner = Scope::child(scope);
                self.comprehension(clauses, &inner, &Produce::Pair(key, value), &mut out)?;
                Value::dict(&self.meter, out.dict)
            }
        }
    }

    fn eval_kwargs(
        &mut self,
        kwargs: &[(String, Expr)],
        scope: &Rc<Scope>,
    ) -> Flow<Vec<(String, Value)>> {
        kwargs
            .iter()
            .map(|(name, expr)| Ok((name.clone(), self.eval(expr, scope)?)))
            .collect()
    }

    fn collector(&self) -> Flow<Collector> {
        Ok(Collector {
            items: Vec::new(),
            dict: Dict::default(),
            charge: self.meter.charge(0)?,
        })
    }

    fn comprehension(
        &mut self,
        clauses: &[Clause],
        scope: &Rc<Scope>,
        produce: &Produce<'_>,
        out: &mut Collector,
    ) -> Flow<()> {
        let Some((first, rest)) = clauses.split_first() else {
            self.meter.tick()?;
            match produce {
                Produce::Item(element) => {
                    let value = self.eval(element, scope)?;
                    out.charge.grow(SLOT)?;
                    out.items.push(value);
                }
                Produce::Pair(key, value) => {
                    let key = self.eval(key, scope)?;
                    let value = self.eval(value, scope)?;
                    out.charge.grow(DICT_ENTRY)?;
                    out.dict.insert(key.hash_key()?, key, value);
                }
            }
            return Ok(());
        };
        match first {
            Clause::If(test) => {
                if self.eval(test, scope)?.truthy() {
                    self.comprehension(rest, scope, produce, out)?;
                }
            }
            Clause::For { target, iter } => {
                let iterable = self.eval(iter, scope)?;
                let mut it = self.iter(&iterable)?;
                while let Some(item) = self.next(&mut it)? {
                    self.assign(target, item, scope)?;
                    self.comprehension(rest, scope, produce, out)?;
                }
            }
        }
        Ok(())
    }

    fn fstring(&mut self, parts: &[FPart], scope: &Rc<Scope>) -> Flow<Value> {
        let mut out = String::new();
        for part in parts {
            match part {
                FPart::Text(text) => out.push_str(text),
                FPart::Value { expr, spec } => {
                    let value = self.eval(expr, scope)?;
                    out.push_str(&self.format(&value, *spec)?);
                }
            }
            self.meter.ensure(STR_HEADER + out.len())?;
        }
        Value::str(&self.meter, out)
    }

    /// Render one f-string replacement field.
    pub fn format(&self, value: &Value, spec: FormatSpec) -> Flow<String> {
        match spec {
            FormatSpec::Plain => value.to_text(&self.meter),
            FormatSpec::Fixed(precision) => match value.as_float() {
                Some(f) if f.is_finite() => Ok(format!("{:.*}", usize::from(precision), f)),
                Some(f) => Ok(super::value::float_repr(f)),
                None => Err(Fault::value_error(format!(
                    "Unknown format code 'f' for object of type '{}'",
                    value.type_name()
                ))),
            },
            FormatSpec::Integer => match value.as_int() {
                Some(i) => Ok(i.to_string()),
                None => Err(Fault::value_error(format!(
                    "Unknown format code 'd' for object of type '{}'",
                    value.type_name()
                ))),
            },
        }
    }

    // ── calls ───────────────────────────────────────────────────────

    pub fn call(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Flow<Value> {
        self.meter.tick()?;
        match callee {
            Value::Function(closure) => self.call_closure(closure, args, kwargs),
            Value::Builtin(builtin) => builtins::call(self, *builtin, args, kwargs),
            other => Err(Fault::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_closure(
        &mut self,
        closure: &Rc<Closure>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Flow<Value> {
        let def = &closure.def;
        if self.depth >= self.max_depth {
            return Err(Fault::raise(
                ExcClass::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        if args.len() > def.params.len() {
            return Err(Fault::type_error(format!(
                "{}() takes {} positional argument(s) but {} were given",
                def.name,
                def.params.len(),
                args.len()
            )));
        }
        let frame = Scope::child(&closure.env);
        let mut bound = vec![false; def.params.len()];
        for (i, value) in args.into_iter().enumerate() {
            frame.set(&def.params[i], value);
            bound[i] = true;
        }
        for (name, value) in kwargs {
            match def.params.iter().position(|p| *p == name) {
                None => {
                    return Err(Fault::type_error(format!(
                        "{}() got an unexpected keyword argument '{name}'",
                        def.name
                    )))
                }
                Some(i) if bound[i] => {
                    return Err(Fault::type_error(format!(
                        "{}() got multiple values for argument '{name}'",
                        def.name
                    )))
                }
                Some(i) => {
                    frame.set(&name, value);
                    bound[i] = true;
                }
            }
        }
        if let Some(missing) = bound.iter().position(|b| !b) {
            return Err(Fault::type_error(format!(
                "{}() missing required argument: '{}'",
                def.name, def.params[missing]
            )));
        }

        let _frame = self.meter.charge(FRAME_BYTES)?;
        self.depth += 1;
        let result = self.exec_block(&def.body, &frame);
        self.depth -= 1;
        Ok(match result? {
            Signal::Return(value) => value,
            _ => Value::None,
        })
    }

    // ── iteration ───────────────────────────────────────────────────

    pub fn iter(&self, value: &Value) -> Flow<Iter> {
        Ok(match value {
            Value::List(list) => Iter::List(Rc::clone(list), 0),
            Value::Tuple(tuple) => Iter::Tuple(Rc::clone(tuple), 0),
            Value::Str(text) => Iter::Chars(Rc::clone(text), 0),
            Value::Dict(dict) => Iter::Dict(Rc::clone(dict), 0, dict.len()),
            Value::Range(range) => Iter::Range(*range, 0),
            other => {
                return Err(Fault::type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        })
    }

    pub fn next(&self, it: &mut Iter) -> Flow<Option<Value>> {
        self.meter.tick()?;
        Ok(match it {
            Iter::List(list, i) => {
                let item = list.get(*i);
                *i += 1;
                item
            }
            Iter::Tuple(tuple, i) => {
                let item = tuple.items().get(*i).cloned();
                *i += 1;
                item
            }
            Iter::Dict(dict, i, len) => {
                if dict.len() != *len {
                    return Err(Fault::raise(
                        ExcClass::RuntimeError,
                        "dictionary changed size during iteration",
                    ));
                }
                let item = dict.map().entries().get(*i).map(|(k, _)| k.clone());
                *i += 1;
                item
            }
            Iter::Range(range, i) => {
                let item = range.get(*i).map(Value::Int);
                *i += 1;
                item
            }
            Iter::Chars(text, pos) => match text.as_str()[*pos..].chars().next() {
                Some(c) => {
                    *pos += c.len_utf8();
                    Some(Value::str(&self.meter, c.to_string())?)
                }
                None => None,
            },
        })
    }

    /// Drain an iterable into a vector, charging as it grows.
    pub fn collect(&self, value: &Value) -> Flow<Vec<Value>> {
        let mut it = self.iter(value)?;
        let charge = self.meter.charge(0)?;
        let mut out = Vec::new();
        while let Some(item) = self.next(&mut it)? {
            charge.grow(SLOT)?;
            out.push(item);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Validator, Verdict};
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn run_with(source: &str, argument: serde_json::Value, limit: usize) -> Flow<serde_json::Value> {
        let program = match Validator::default().validate(source) {
            Verdict::Accepted(program) => program,
            Verdict::Rejected(v) => panic!("rejected: {v:?}"),
        };
        let meter = Meter::new(
            limit,
            Arc::new(AtomicBool::new(false)),
            Instant::now() + Duration::from_secs(30),
        );
        let mut interp = Interp::new(Rc::clone(&meter), 200);
        let argument = super::super::value::from_json(&meter, &argument)?;
        let result = interp
            .run(&program, argument)
            .and_then(|v| super::super::value::to_json(&v, &meter));
        meter.sweep();
        result
    }

    fn run(source: &str, argument: serde_json::Value) -> Flow<serde_json::Value> {
        run_with(source, argument, 64 << 20)
    }

    fn ok(source: &str, argument: serde_json::Value) -> serde_json::Value {
        run(source, argument).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn squares_a_number() {
        let out = ok(
            "def process(parameters):\n    n = parameters['number']\n    return n * n\n",
            serde_json::json!({"number": 5}),
        );
        assert_eq!(out, serde_json::json!(25));
    }

    #[test]
    fn loops_and_control_flow() {
        let source = "\
def process(p):
    total = 0
    for i in range(10):
        if i % 2 == 0:
            continue
        if i > 7:
            break
        total += i
    while total > 10:
        total -= 3
    return total
";
        // 1 + 3 + 5 + 7 = 16 -> 13 -> 10
        assert_eq!(ok(source, serde_json::json!({})), serde_json::json!(10));
    }

    #[test]
    fn helpers_closures_and_lambdas() {
        let source = "\
SCALE = 3

def make_adder(k):
    def add(x):
        return x + k
    return add

def process(p):
    add = make_adder(SCALE)
    pairs = sorted([(2, 'b'), (1, 'a'), (3, 'c')], key=lambda t: -t[0])
    return [add(p['x']), [name for _, name in pairs]]
";
        assert_eq!(
            ok(source, serde_json::json!({"x": 4})),
            serde_json::json!([7, ["c", "b", "a"]])
        );
    }

    #[test]
    fn comprehensions_and_fstrings() {
        let source = "\
def process(p):
    squares = {n: n * n for n in range(4) if n}
    label = f\"{len(squares)} items, mean {sum(squares.values()) / len(squares):.2f}\"
    return [squares, label]
";
        assert_eq!(
            ok(source, serde_json::json!({})),
            serde_json::json!([{"1": 1, "2": 4, "3": 9}, "3 items, mean 4.67"])
        );
    }

    #[test]
    fn unpacking_and_augmented_subscripts() {
        let source = "\
def process(p):
    a, (b, c) = 1, [2, 3]
    counts = {}
    for word in p['words']:
        counts[word] = counts.get(word, 0) + 1
    xs = [1]
    xs += [2, 3]
    xs[0] *= 10
    del xs[1]
    return [a + b + c, counts, xs]
";
        assert_eq!(
            ok(source, serde_json::json!({"words": ["a", "b", "a"]})),
            serde_json::json!([6, {"a": 2, "b": 1}, [10, 3]])
        );
    }

    #[test]
    fn raised_exception_reports_class_and_line() {
        let source = "def process(p):\n    x = 1\n    raise ValueError('bad input')\n";
        let err = run(source, serde_json::json!({})).unwrap_err();
        assert_eq!(err.to_string(), "ValueError: bad input (line 3)");
    }

    #[test]
    fn error_line_is_innermost() {
        let source = "def helper(d):\n    return d['missing']\n\ndef process(p):\n    return helper(p)\n";
        let err = run(source, serde_json::json!({})).unwrap_err();
        assert_eq!(err.to_string(), "KeyError: 'missing' (line 2)");
    }

    #[test]
    fn runaway_recursion_is_stopped() {
        let source = "def f(n):\n    return f(n + 1)\n\ndef process(p):\n    return f(0)\n";
        let err = run(source, serde_json::json!({})).unwrap_err();
        assert!(err.to_string().starts_with("RecursionError"), "{err}");
    }

    #[test]
    fn memory_ceiling_is_enforced() {
        let source = "def process(p):\n    xs = []\n    while True:\n        xs.append('x' * 1000)\n";
        let err = run_with(source, serde_json::json!({}), 1 << 20).unwrap_err();
        assert!(matches!(err, Fault::Memory { .. }));
    }

    #[test]
    fn assertion_failure() {
        let err = run("def process(p):\n    assert p, 'need input'\n", serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.to_string(), "AssertionError: need input (line 2)");
    }

    #[test]
    fn unknown_name_is_a_name_error() {
        let err = run("def process(p):\n    return undefined_thing\n", serde_json::json!({}))
            .unwrap_err();
        assert!(err.to_string().starts_with("NameError"));
    }

    #[test]
    fn cyclic_structures_are_swept() {
        let source = "def process(p):\n    a = []\n    a.append(a)\n    return len(a)\n";
        assert_eq!(ok(source, serde_json::json!({})), serde_json::json!(1));
    }

    #[test]
    fn growing_a_dict_while_iterating_it_fails() {
        let source = "\
def process(p):
    d = {'a': 1}
    for k in d:
        d[k + k] = 2
    return len(d)
";
        let err = run(source, serde_json::json!({})).unwrap_err();
        assert!(
            err.to_string()
                .starts_with("RuntimeError: dictionary changed size during iteration"),
            "{err}"
        );

        let source = "\
def process(p):
    d = {'a': 1, 'b': 2}
    for k in d:
        d[k] = d[k] * 10
    return d
";
        assert_eq!(ok(source, serde_json::json!({})), serde_json::json!({"a": 10, "b": 20}));
    }

    #[test]
    fn deep_chains_drop_on_a_small_stack() {
        // runs on the default test thread stack
        let source = "\
def process(p):
    a = []
    d = {}
    for i in range(100000):
        a = [a]
        d = {'next': d}
    a = None
    return 1
";
        assert_eq!(ok(source, serde_json::json!({})), serde_json::json!(1));
    }

    #[test]
    fn non_json_result_is_an_error() {
        let err = run("def process(p):\n    return len\n", serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("not JSON serializable"));
    }
}
