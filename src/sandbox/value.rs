//! Runtime values of the sandbox interpreter.
//!
//! Heap values are reference counted and each holds a [`Charge`] against
//! the invocation's [`Meter`]. Values never leave the sandbox thread:
//! parameters come in as JSON and results go out as JSON.

use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use super::builtins::Builtin;
use super::error::{ExcClass, Fault, Flow, Raised};
use super::interp::Closure;
use super::meter::{Charge, Meter};

/// Bytes charged per element slot of a list or tuple.
pub const SLOT: usize = std::mem::size_of::<Value>();
pub const STR_HEADER: usize = 32;
pub const LIST_HEADER: usize = 48;
pub const DICT_HEADER: usize = 64;
/// Bytes charged per dict entry (key, value and index).
pub const DICT_ENTRY: usize = 2 * SLOT + 32;
/// Nesting beyond which structural operations give up.
pub const MAX_DEPTH: usize = 200;
/// Tuples are immutable and never swept, so their direct nesting is capped
/// to keep teardown from recursing without bound.
pub const MAX_TUPLE_NESTING: usize = 10_000;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<StrObj>),
    List(Rc<ListObj>),
    Tuple(Rc<TupleObj>),
    Dict(Rc<DictObj>),
    Range(Range),
    Function(Rc<Closure>),
    Builtin(Builtin),
    Exception(Rc<Raised>),
}

pub struct StrObj {
    text: String,
    _charge: Charge,
}

impl StrObj {
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

pub struct TupleObj {
    items: Vec<Value>,
    nesting: usize,
    _charge: Charge,
}

impl TupleObj {
    pub fn items(&self) -> &[Value] {
        &self.items
    }
}

pub struct ListObj {
    items: RefCell<Vec<Value>>,
    charge: Charge,
}

impl ListObj {
    pub fn items(&self) -> Ref<'_, Vec<Value>> {
        self.items.borrow()
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.borrow().get(index).cloned()
    }

    /// Copy of the current items, for iterating while user code may run.
    pub fn snapshot(&self) -> Vec<Value> {
        self.items.borrow().clone()
    }

    pub fn push(&self, value: Value) -> Flow<()> {
        self.charge.grow(SLOT)?;
        self.items.borrow_mut().push(value);
        Ok(())
    }

    /// Apply an in-place edit, then re-charge for the new length.
    pub fn edit<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> Flow<R> {
        let (result, len) = {
            let mut items = self.items.borrow_mut();
            let result = f(&mut items);
            (result, items.len())
        };
        self.charge.set(LIST_HEADER + len * SLOT)?;
        Ok(result)
    }

    pub(crate) fn take_all(&self) -> Vec<Value> {
        std::mem::take(&mut *self.items.borrow_mut())
    }
}

pub struct DictObj {
    map: RefCell<Dict>,
    charge: Charge,
}

impl DictObj {
    pub fn map(&self) -> Ref<'_, Dict> {
        self.map.borrow()
    }

    pub fn len(&self) -> usize {
        self.map.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.borrow().is_empty()
    }

    pub fn lookup(&self, key: &HashKey) -> Option<Value> {
        self.map.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: Value, value: Value) -> Flow<()> {
        let hk = key.hash_key()?;
        let len = {
            let mut map = self.map.borrow_mut();
            map.insert(hk, key, value);
            map.len()
        };
        self.charge.set(DICT_HEADER + len * DICT_ENTRY)
    }

    pub fn remove(&self, key: &HashKey) -> Flow<Option<(Value, Value)>> {
        let (removed, len) = {
            let mut map = self.map.borrow_mut();
            let removed = map.remove(key);
            (removed, map.len())
        };
        self.charge.set(DICT_HEADER + len * DICT_ENTRY)?;
        Ok(removed)
    }

    pub fn clear(&self) -> Flow<()> {
        drop(self.take_all());
        self.charge.set(DICT_HEADER)
    }

    pub fn snapshot(&self) -> Dict {
        self.map.borrow().clone()
    }

    pub(crate) fn take_all(&self) -> Dict {
        std::mem::take(&mut *self.map.borrow_mut())
    }
}

impl Drop for ListObj {
    fn drop(&mut self) {
        release(std::mem::take(self.items.get_mut()));
    }
}

impl Drop for DictObj {
    fn drop(&mut self) {
        release(std::mem::take(self.map.get_mut()).into_values());
    }
}

impl Drop for TupleObj {
    fn drop(&mut self) {
        release(std::mem::take(&mut self.items));
    }
}

/// Drop `values` without recursing into nested containers.
///
/// A container whose last handle is on the worklist is emptied onto the
/// worklist before it is dropped, so its own `Drop` finds nothing left to
/// release. Stack depth stays constant however deep the nesting.
pub(crate) fn release(values: Vec<Value>) {
    let mut pending = values;
    while let Some(value) = pending.pop() {
        match value {
            Value::List(list) if Rc::strong_count(&list) == 1 => {
                pending.extend(list.take_all());
            }
            Value::Dict(dict) if Rc::strong_count(&dict) == 1 => {
                pending.extend(dict.take_all().into_values());
            }
            Value::Tuple(mut tuple) => {
                if let Some(tuple) = Rc::get_mut(&mut tuple) {
                    pending.append(&mut tuple.items);
                }
            }
            Value::Function(closure)
                if Rc::strong_count(&closure) == 1 && Rc::strong_count(&closure.env) == 1 =>
            {
                pending.extend(closure.env.take_all().into_values());
            }
            _ => {}
        }
    }
}

/// Insertion-ordered mapping.
#[derive(Clone, Default)]
pub struct Dict {
    entries: Vec<(Value, Value)>,
    index: HashMap<HashKey, usize>,
}

impl Dict {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &HashKey) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, key: &HashKey) -> bool {
        self.index.contains_key(key)
    }

    /// Insert or overwrite. An existing key keeps its original position.
    pub fn insert(&mut self, hk: HashKey, key: Value, value: Value) {
        match self.index.get(&hk) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(hk, self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn remove(&mut self, hk: &HashKey) -> Option<(Value, Value)> {
        let i = self.index.remove(hk)?;
        let removed = self.entries.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter().map(|(k, _)| k)
    }

    /// Keys and values, flattened.
    pub(crate) fn into_values(self) -> Vec<Value> {
        self.entries.into_iter().flat_map(|(k, v)| [k, v]).collect()
    }
}

/// Hashable projection of a value, used as the dict index key.
///
/// Numbers that compare equal hash equal: `True`, `1` and `1.0` are the
/// same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(String),
    Tuple(Vec<HashKey>),
}

/// Lazy `range(start, stop, step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn len(&self) -> usize {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let n = if step > 0 && start < stop {
            (stop - start - 1) / step + 1
        } else if step < 0 && start > stop {
            (start - stop - 1) / (-step) + 1
        } else {
            0
        };
        usize::try_from(n).unwrap_or(usize::MAX)
    }

    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let value = self.start as i128 + self.step as i128 * index as i128;
        i64::try_from(value).ok()
    }

    pub fn contains(&self, value: i64) -> bool {
        let (v, start, step) = (value as i128, self.start as i128, self.step as i128);
        let in_bounds = if step > 0 {
            v >= start && v < self.stop as i128
        } else {
            v <= start && v > self.stop as i128
        };
        in_bounds && (v - start) % step == 0
    }
}

impl Value {
    pub fn str(meter: &Rc<Meter>, text: impl Into<String>) -> Flow<Value> {
        let text = text.into();
        let charge = meter.charge(STR_HEADER + text.len())?;
        Ok(Value::Str(Rc::new(StrObj {
            text,
            _charge: charge,
        })))
    }

    pub fn list(meter: &Rc<Meter>, items: Vec<Value>) -> Flow<Value> {
        let charge = meter.charge(LIST_HEADER + items.len() * SLOT)?;
        let list = Rc::new(ListObj {
            items: RefCell::new(items),
            charge,
        });
        meter.track_list(&list);
        Ok(Value::List(list))
    }

    pub fn tuple(meter: &Rc<Meter>, items: Vec<Value>) -> Flow<Value> {
        let charge = meter.charge(LIST_HEADER + items.len() * SLOT)?;
        let nesting = 1 + items
            .iter()
            .map(|item| match item {
                Value::Tuple(t) => t.nesting,
                _ => 0,
            })
            .max()
            .unwrap_or(0);
        if nesting > MAX_TUPLE_NESTING {
            return Err(Fault::raise(
                ExcClass::RecursionError,
                "tuples nested too deeply",
            ));
        }
        Ok(Value::Tuple(Rc::new(TupleObj {
            items,
            nesting,
            _charge: charge,
        })))
    }

    pub fn dict(meter: &Rc<Meter>, map: Dict) -> Flow<Value> {
        let charge = meter.charge(DICT_HEADER + map.len() * DICT_ENTRY)?;
        let dict = Rc::new(DictObj {
            map: RefCell::new(map),
            charge,
        });
        meter.track_dict(&dict);
        Ok(Value::Dict(dict))
    }

    pub fn exception(class: ExcClass, message: String) -> Value {
        Value::Exception(Rc::new(Raised {
            class,
            message,
            line: None,
        }))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range(_) => "range",
            Value::Function(_) => "function",
            Value::Builtin(Builtin::Exception(_)) => "type",
            Value::Builtin(b) if b.is_type() => "type",
            Value::Builtin(_) => "builtin_function_or_method",
            Value::Exception(e) => e.class.name(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.text.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Tuple(t) => !t.items.is_empty(),
            Value::Dict(d) => !d.is_empty(),
            Value::Range(r) => r.len() > 0,
            Value::Function(_) | Value::Builtin(_) | Value::Exception(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(&s.text),
            _ => None,
        }
    }

    /// Integer view: `bool` and `int` only.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: `bool`, `int` and `float`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn hash_key(&self) -> Flow<HashKey> {
        Ok(match self {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(i64::from(*b)),
            Value::Int(i) => HashKey::Int(*i),
            Value::Float(f) => float_key(*f),
            Value::Str(s) => HashKey::Str(s.text.clone()),
            Value::Tuple(t) => HashKey::Tuple(
                t.items
                    .iter()
                    .map(Value::hash_key)
                    .collect::<Flow<Vec<_>>>()?,
            ),
            other => {
                return Err(Fault::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )))
            }
        })
    }

    /// Identity for heap values, equality for scalars.
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b) || a.text == b.text,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `str(value)`.
    pub fn to_text(&self, meter: &Meter) -> Flow<String> {
        match self {
            Value::Str(s) => Ok(s.text.clone()),
            Value::Exception(e) => Ok(e.message.clone()),
            other => other.repr(meter),
        }
    }

    /// `repr(value)`. Self-referencing containers print as `[...]`.
    pub fn repr(&self, meter: &Meter) -> Flow<String> {
        let mut out = String::new();
        let mut active = Vec::new();
        write_repr(self, &mut out, &mut active, 0, meter)?;
        Ok(out)
    }
}

fn float_key(f: f64) -> HashKey {
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        HashKey::Int(f as i64)
    } else {
        HashKey::Float(f.to_bits())
    }
}

fn write_repr(
    value: &Value,
    out: &mut String,
    active: &mut Vec<*const ()>,
    depth: usize,
    meter: &Meter,
) -> Flow<()> {
    meter.tick()?;
    if depth > MAX_DEPTH {
        return Err(Fault::raise(
            ExcClass::RecursionError,
            "maximum recursion depth exceeded while getting the repr of an object",
        ));
    }
    if out.len() > meter.headroom() {
        return Err(Fault::Memory {
            limit: meter.limit(),
        });
    }
    match value {
        Value::None => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(f) => out.push_str(&float_repr(*f)),
        Value::Str(s) => out.push_str(&quote(&s.text)),
        Value::List(list) => {
            let ptr = Rc::as_ptr(list) as *const ();
            if active.contains(&ptr) {
                out.push_str("[...]");
                return Ok(());
            }
            active.push(ptr);
            let items = list.snapshot();
            write_seq(&items, ("[", "]"), false, out, active, depth, meter)?;
            active.pop();
        }
        Value::Tuple(t) => {
            let single = t.items.len() == 1;
            write_seq(&t.items, ("(", ")"), single, out, active, depth, meter)?
        }
        Value::Dict(dict) => {
            let ptr = Rc::as_ptr(dict) as *const ();
            if active.contains(&ptr) {
                out.push_str("{...}");
                return Ok(());
            }
            active.push(ptr);
            let map = dict.snapshot();
            out.push('{');
            for (i, (k, v)) in map.entries().iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_repr(k, out, active, depth + 1, meter)?;
                out.push_str(": ");
                write_repr(v, out, active, depth + 1, meter)?;
            }
            out.push('}');
            active.pop();
        }
        Value::Range(r) => {
            if r.step == 1 {
                out.push_str(&format!("range({}, {})", r.start, r.stop));
            } else {
                out.push_str(&format!("range({}, {}, {})", r.start, r.stop, r.step));
            }
        }
        Value::Function(f) => out.push_str(&format!("<function {}>", f.def.name)),
        Value::Builtin(Builtin::Exception(class)) => {
            out.push_str(&format!("<class '{}'>", class.name()))
        }
        Value::Builtin(b) if b.is_type() => out.push_str(&format!("<class '{}'>", b.name())),
        Value::Builtin(b) => out.push_str(&format!("<built-in function {}>", b.name())),
        Value::Exception(e) => {
            out.push_str(&format!("{}({})", e.class.name(), quote(&e.message)))
        }
    }
    Ok(())
}

fn write_seq(
    items: &[Value],
    (open, close): (&str, &str),
    trailing_comma: bool,
    out: &mut String,
    active: &mut Vec<*const ()>,
    depth: usize,
    meter: &Meter,
) -> Flow<()> {
    out.push_str(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_repr(item, out, active, depth + 1, meter)?;
    }
    if trailing_comma {
        out.push(',');
    }
    out.push_str(close);
    Ok(())
}

/// Shortest round-trip float text, in Python's spelling.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    let abs = f.abs();
    if abs != 0.0 && !(1e-4..1e16).contains(&abs) {
        let text = format!("{f:e}");
        let (mantissa, exp) = text.split_once('e').unwrap_or((text.as_str(), "0"));
        let exp: i32 = exp.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{mantissa}e{sign}{:02}", exp.abs());
    }
    let text = f.to_string();
    if text.contains('.') {
        text
    } else {
        format!("{text}.0")
    }
}

/// Quote a string the way `repr` does.
pub fn quote(text: &str) -> String {
    let delim = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(delim);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == delim => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(delim);
    out
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => f.write_str(&float_repr(*x)),
            Value::Str(s) => f.write_str(&quote(&s.text)),
            Value::List(l) => write!(f, "<list len={}>", l.len()),
            Value::Tuple(t) => write!(f, "<tuple len={}>", t.items.len()),
            Value::Dict(d) => write!(f, "<dict len={}>", d.len()),
            Value::Range(r) => write!(f, "range({}, {}, {})", r.start, r.stop, r.step),
            Value::Function(c) => write!(f, "<function {}>", c.def.name),
            Value::Builtin(b) => write!(f, "<builtin {}>", b.name()),
            Value::Exception(e) => write!(f, "{e}"),
        }
    }
}

// ── JSON boundary ───────────────────────────────────────────────────

/// Build a value from a JSON parameter.
pub fn from_json(meter: &Rc<Meter>, json: &serde_json::Value) -> Flow<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::str(meter, s.as_str())?,
        serde_json::Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| from_json(meter, item))
                .collect::<Flow<Vec<_>>>()?;
            Value::list(meter, items)?
        }
        serde_json::Value::Object(map) => {
            let mut dict = Dict::default();
            for (k, v) in map {
                let key = Value::str(meter, k.as_str())?;
                dict.insert(HashKey::Str(k.clone()), key, from_json(meter, v)?);
            }
            Value::dict(meter, dict)?
        }
    })
}

/// Convert a result to JSON. Tuples become arrays; dict keys must be
/// strings, numbers, booleans or `None`.
pub fn to_json(value: &Value, meter: &Meter) -> Flow<serde_json::Value> {
    let mut budget = meter.headroom();
    to_json_at(value, meter, 0, &mut budget)
}

fn to_json_at(
    value: &Value,
    meter: &Meter,
    depth: usize,
    budget: &mut usize,
) -> Flow<serde_json::Value> {
    meter.tick()?;
    if depth > MAX_DEPTH {
        return Err(Fault::value_error(
            "result nests too deeply to serialize (circular reference?)",
        ));
    }
    let cost = match value {
        Value::Str(s) => STR_HEADER + s.text.len(),
        _ => SLOT,
    };
    *budget = budget.checked_sub(cost).ok_or(Fault::Memory {
        limit: meter.limit(),
    })?;
    Ok(match value {
        Value::None => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => match serde_json::Number::from_f64(*f) {
            Some(n) => serde_json::Value::Number(n),
            None => {
                return Err(Fault::value_error(format!(
                    "out of range float value {} is not JSON serializable",
                    float_repr(*f)
                )))
            }
        },
        Value::Str(s) => serde_json::Value::String(s.text.clone()),
        Value::List(l) => serde_json::Value::Array(
            l.snapshot()
                .iter()
                .map(|v| to_json_at(v, meter, depth + 1, budget))
                .collect::<Flow<_>>()?,
        ),
        Value::Tuple(t) => serde_json::Value::Array(
            t.items
                .iter()
                .map(|v| to_json_at(v, meter, depth + 1, budget))
                .collect::<Flow<_>>()?,
        ),
        Value::Dict(d) => {
            let mut map = serde_json::Map::new();
            for (k, v) in d.snapshot().entries() {
                let key = match k {
                    Value::Str(s) => s.text.clone(),
                    Value::None => "null".into(),
                    Value::Bool(b) => b.to_string(),
                    Value::Int(i) => i.to_string(),
                    Value::Float(f) => float_repr(*f),
                    other => {
                        return Err(Fault::type_error(format!(
                            "keys must be str, int, float, bool or None, not {}",
                            other.type_name()
                        )))
                    }
                };
                map.insert(key, to_json_at(v, meter, depth + 1, budget)?);
            }
            serde_json::Value::Object(map)
        }
        other => {
            return Err(Fault::type_error(format!(
                "Object of type {} is not JSON serializable",
                other.type_name()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn meter() -> Rc<Meter> {
        Meter::new(
            1 << 20,
            Arc::new(AtomicBool::new(false)),
            Instant::now() + Duration::from_secs(60),
        )
    }

    #[test]
    fn float_repr_matches_python_spelling() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(-0.0), "-0.0");
        assert_eq!(float_repr(2.5e-7), "2.5e-07");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(123456.5), "123456.5");
    }

    #[test]
    fn quote_picks_delimiter() {
        assert_eq!(quote("it's"), "\"it's\"");
        assert_eq!(quote("a\nb"), "'a\\nb'");
    }

    #[test]
    fn equal_numbers_share_a_key() {
        assert_eq!(Value::Bool(true).hash_key().unwrap(), HashKey::Int(1));
        assert_eq!(Value::Float(1.0).hash_key().unwrap(), HashKey::Int(1));
        assert_ne!(Value::Float(1.5).hash_key().unwrap(), HashKey::Int(1));
    }

    #[test]
    fn lists_are_unhashable() {
        let m = meter();
        let list = Value::list(&m, vec![]).unwrap();
        assert!(list.hash_key().is_err());
    }

    #[test]
    fn dict_keeps_insertion_order_across_removal() {
        let m = meter();
        let mut dict = Dict::default();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            dict.insert(
                HashKey::Str(name.to_string()),
                Value::str(&m, *name).unwrap(),
                Value::Int(i as i64),
            );
        }
        dict.remove(&HashKey::Str("a".into()));
        dict.insert(HashKey::Str("a".into()), Value::str(&m, "a").unwrap(), Value::Int(9));
        let keys: Vec<String> = dict.keys().map(|k| k.as_str().unwrap().to_string()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
        assert!(matches!(dict.get(&HashKey::Str("c".into())), Some(Value::Int(2))));
    }

    #[test]
    fn range_arithmetic() {
        let r = Range { start: 10, stop: 0, step: -3 };
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(3), Some(1));
        assert!(r.contains(4));
        assert!(!r.contains(5));
        assert_eq!(Range { start: 0, stop: i64::MAX, step: 1 }.len(), i64::MAX as usize);
    }

    #[test]
    fn self_referencing_list_reprs_and_fails_json() {
        let m = meter();
        let list = Value::list(&m, vec![Value::Int(1)]).unwrap();
        if let Value::List(l) = &list {
            l.push(list.clone()).unwrap();
        }
        assert_eq!(list.repr(&m).unwrap(), "[1, [...]]");
        assert!(to_json(&list, &m).is_err());
        m.sweep();
    }

    #[test]
    fn json_round_trip_through_values() {
        let m = meter();
        let json = serde_json::json!({"n": 5, "xs": [1.5, "a", null, true]});
        let value = from_json(&m, &json).unwrap();
        assert_eq!(to_json(&value, &m).unwrap(), json);
    }

    #[test]
    fn charges_follow_values() {
        let m = meter();
        let s = Value::str(&m, "hello").unwrap();
        assert_eq!(m.used(), STR_HEADER + 5);
        drop(s);
        assert_eq!(m.used(), 0);
    }
}
