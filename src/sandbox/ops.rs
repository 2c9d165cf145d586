//! Operators: arithmetic, comparison, membership, indexing and slicing.

use std::cmp::Ordering;
use std::rc::Rc;

use super::error::{ExcClass, Fault, Flow};
use super::meter::Meter;
use super::value::{Range, Value, LIST_HEADER, MAX_DEPTH, SLOT, STR_HEADER};
use crate::lang::ast::{BinOp, CmpOp, UnaryOp};

enum Num {
    Int(i64),
    Float(f64),
}

fn num(value: &Value) -> Option<Num> {
    match value {
        Value::Bool(b) => Some(Num::Int(i64::from(*b))),
        Value::Int(i) => Some(Num::Int(*i)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

fn unsupported(op: &str, l: &Value, r: &Value) -> Fault {
    Fault::type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        l.type_name(),
        r.type_name()
    ))
}

pub fn unary(op: UnaryOp, operand: &Value) -> Flow<Value> {
    match (op, num(operand)) {
        (UnaryOp::Neg, Some(Num::Int(i))) => i.checked_neg().map(Value::Int).ok_or_else(Fault::overflow),
        (UnaryOp::Neg, Some(Num::Float(f))) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Some(Num::Int(i))) => Ok(Value::Int(i)),
        (UnaryOp::Pos, Some(Num::Float(f))) => Ok(Value::Float(f)),
        (UnaryOp::Invert, Some(Num::Int(i))) => Ok(Value::Int(!i)),
        _ => {
            let symbol = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Pos => "+",
                UnaryOp::Invert => "~",
            };
            Err(Fault::type_error(format!(
                "bad operand type for unary {symbol}: '{}'",
                operand.type_name()
            )))
        }
    }
}

pub fn binary(meter: &Rc<Meter>, op: BinOp, l: &Value, r: &Value) -> Flow<Value> {
    if let (Some(a), Some(b)) = (num(l), num(r)) {
        if let (Value::Bool(x), Value::Bool(y)) = (l, r) {
            match op {
                BinOp::BitAnd => return Ok(Value::Bool(x & y)),
                BinOp::BitOr => return Ok(Value::Bool(x | y)),
                BinOp::BitXor => return Ok(Value::Bool(x ^ y)),
                _ => {}
            }
        }
        return match (a, b) {
            (Num::Int(a), Num::Int(b)) => int_op(op, a, b),
            (a, b) => {
                let to_f = |n: Num| match n {
                    Num::Int(i) => i as f64,
                    Num::Float(f) => f,
                };
                float_op(op, to_f(a), to_f(b)).map_err(|f| match f {
                    Some(f) => f,
                    None => unsupported(op.symbol(), l, r),
                })
            }
        };
    }
    match (op, l, r) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            meter.ensure(STR_HEADER + a.as_str().len() + b.as_str().len())?;
            let mut text = String::with_capacity(a.as_str().len() + b.as_str().len());
            text.push_str(a.as_str());
            text.push_str(b.as_str());
            Value::str(meter, text)
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.snapshot();
            meter.ensure(LIST_HEADER + (items.len() + b.len()) * SLOT)?;
            items.extend(b.snapshot());
            Value::list(meter, items)
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            meter.ensure(LIST_HEADER + (a.items().len() + b.items().len()) * SLOT)?;
            let items = a.items().iter().chain(b.items()).cloned().collect();
            Value::tuple(meter, items)
        }
        (BinOp::Mul, seq, Value::Int(_) | Value::Bool(_))
            if matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_)) =>
        {
            repeat(meter, seq, r.as_int().unwrap_or(0))
        }
        (BinOp::Mul, Value::Int(_) | Value::Bool(_), seq)
            if matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_)) =>
        {
            repeat(meter, seq, l.as_int().unwrap_or(0))
        }
        _ => Err(unsupported(op.symbol(), l, r)),
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Flow<Value> {
    let checked = |v: Option<i64>| v.map(Value::Int).ok_or_else(Fault::overflow);
    match op {
        BinOp::Add => checked(a.checked_add(b)),
        BinOp::Sub => checked(a.checked_sub(b)),
        BinOp::Mul => checked(a.checked_mul(b)),
        BinOp::Div => {
            if b == 0 {
                return Err(Fault::zero_division("division by zero"));
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(Fault::zero_division("integer division or modulo by zero"));
            }
            let q = a.checked_div(b).ok_or_else(Fault::overflow)?;
            let adjust = (a % b != 0) && ((a < 0) != (b < 0));
            Ok(Value::Int(if adjust { q - 1 } else { q }))
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(Fault::zero_division("integer division or modulo by zero"));
            }
            let r = a.checked_rem(b).unwrap_or(0);
            Ok(Value::Int(if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }))
        }
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(Fault::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| Fault::overflow())?;
            checked(a.checked_pow(exp))
        }
        BinOp::BitAnd => Ok(Value::Int(a & b)),
        BinOp::BitOr => Ok(Value::Int(a | b)),
        BinOp::BitXor => Ok(Value::Int(a ^ b)),
        BinOp::Shl => {
            if b < 0 {
                return Err(Fault::value_error("negative shift count"));
            }
            if a == 0 {
                return Ok(Value::Int(0));
            }
            if b >= 63 {
                return Err(Fault::overflow());
            }
            let shifted = a << b;
            if shifted >> b != a {
                return Err(Fault::overflow());
            }
            Ok(Value::Int(shifted))
        }
        BinOp::Shr => {
            if b < 0 {
                return Err(Fault::value_error("negative shift count"));
            }
            Ok(Value::Int(a >> b.min(63)))
        }
    }
}

/// `Err(None)` means the operator does not apply to floats.
fn float_op(op: BinOp, a: f64, b: f64) -> Result<Value, Option<Fault>> {
    let zero = |what: &str| Err(Some(Fault::zero_division(what.to_string())));
    let value = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return zero("float division by zero");
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return zero("float floor division by zero");
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return zero("float modulo");
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return zero("0.0 cannot be raised to a negative power");
            }
            if a < 0.0 && b.fract() != 0.0 {
                return Err(Some(Fault::value_error(
                    "negative number cannot be raised to a fractional power",
                )));
            }
            a.powf(b)
        }
        _ => return Err(None),
    };
    Ok(Value::Float(value))
}

fn repeat(meter: &Rc<Meter>, seq: &Value, times: i64) -> Flow<Value> {
    let times = usize::try_from(times.max(0)).unwrap_or(0);
    match seq {
        Value::Str(s) => {
            let len = s.as_str().len().checked_mul(times).ok_or(Fault::Memory {
                limit: meter.limit(),
            })?;
            meter.ensure(STR_HEADER + len)?;
            Value::str(meter, s.as_str().repeat(times))
        }
        Value::List(_) | Value::Tuple(_) => {
            let items = match seq {
                Value::List(l) => l.snapshot(),
                Value::Tuple(t) => t.items().to_vec(),
                _ => Vec::new(),
            };
            let len = items.len().checked_mul(times).ok_or(Fault::Memory {
                limit: meter.limit(),
            })?;
            meter.ensure(LIST_HEADER + len * SLOT)?;
            let mut out = Vec::with_capacity(len);
            for _ in 0..times {
                meter.tick()?;
                out.extend(items.iter().cloned());
            }
            if matches!(seq, Value::List(_)) {
                Value::list(meter, out)
            } else {
                Value::tuple(meter, out)
            }
        }
        _ => Err(Fault::type_error(format!(
            "can't multiply sequence of type '{}'",
            seq.type_name()
        ))),
    }
}

// ── comparison ──────────────────────────────────────────────────────

pub fn equals(meter: &Meter, a: &Value, b: &Value) -> Flow<bool> {
    equals_at(meter, a, b, 0)
}

fn too_deep() -> Fault {
    Fault::raise(
        ExcClass::RecursionError,
        "maximum recursion depth exceeded in comparison",
    )
}

fn equals_at(meter: &Meter, a: &Value, b: &Value, depth: usize) -> Flow<bool> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }
    if let (Some(x), Some(y)) = (num(a), num(b)) {
        return Ok(match (x, y) {
            (Num::Int(x), Num::Int(y)) => x == y,
            (Num::Int(x), Num::Float(y)) | (Num::Float(y), Num::Int(x)) => x as f64 == y,
            (Num::Float(x), Num::Float(y)) => x == y,
        });
    }
    match (a, b) {
        (Value::None, Value::None) => Ok(true),
        (Value::Str(x), Value::Str(y)) => Ok(x.as_str() == y.as_str()),
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            seq_equals(meter, &x.snapshot(), &y.snapshot(), depth)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_equals(meter, x.items(), y.items(), depth),
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.snapshot(), y.snapshot());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (k, v) in x.entries() {
                let Some(other) = y.get(&k.hash_key()?) else {
                    return Ok(false);
                };
                if !equals_at(meter, v, other, depth + 1)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        (Value::Range(x), Value::Range(y)) => Ok(x.len() == y.len()
            && (x.len() == 0 || (x.start == y.start && (x.len() == 1 || x.step == y.step)))),
        _ => Ok(a.is(b)),
    }
}

fn seq_equals(meter: &Meter, x: &[Value], y: &[Value], depth: usize) -> Flow<bool> {
    if x.len() != y.len() {
        return Ok(false);
    }
    for (a, b) in x.iter().zip(y) {
        meter.tick()?;
        if !equals_at(meter, a, b, depth + 1)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Ordering for `<`-family operators and sorting. `None` means unordered
/// (a NaN was involved).
pub fn order(meter: &Meter, a: &Value, b: &Value, symbol: &str) -> Flow<Option<Ordering>> {
    order_at(meter, a, b, symbol, 0)
}

fn order_at(
    meter: &Meter,
    a: &Value,
    b: &Value,
    symbol: &str,
    depth: usize,
) -> Flow<Option<Ordering>> {
    if depth > MAX_DEPTH {
        return Err(too_deep());
    }
    if let (Some(x), Some(y)) = (num(a), num(b)) {
        return Ok(match (x, y) {
            (Num::Int(x), Num::Int(y)) => Some(x.cmp(&y)),
            (Num::Int(x), Num::Float(y)) => (x as f64).partial_cmp(&y),
            (Num::Float(x), Num::Int(y)) => x.partial_cmp(&(y as f64)),
            (Num::Float(x), Num::Float(y)) => x.partial_cmp(&y),
        });
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(Some(x.as_str().cmp(y.as_str()))),
        (Value::List(x), Value::List(y)) => {
            seq_order(meter, &x.snapshot(), &y.snapshot(), symbol, depth)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_order(meter, x.items(), y.items(), symbol, depth),
        _ => Err(Fault::type_error(format!(
            "'{symbol}' not supported between instances of '{}' and '{}'",
            a.type_name(),
            b.type_name()
        ))),
    }
}

fn seq_order(
    meter: &Meter,
    x: &[Value],
    y: &[Value],
    symbol: &str,
    depth: usize,
) -> Flow<Option<Ordering>> {
    for (a, b) in x.iter().zip(y) {
        meter.tick()?;
        if !equals_at(meter, a, b, depth + 1)? {
            return order_at(meter, a, b, symbol, depth + 1);
        }
    }
    Ok(Some(x.len().cmp(&y.len())))
}

pub fn compare(meter: &Meter, op: CmpOp, a: &Value, b: &Value) -> Flow<bool> {
    let ordered = |symbol: &str, test: fn(Ordering) -> bool| -> Flow<bool> {
        Ok(order(meter, a, b, symbol)?.is_some_and(test))
    };
    match op {
        CmpOp::Eq => equals(meter, a, b),
        CmpOp::Ne => Ok(!equals(meter, a, b)?),
        CmpOp::Lt => ordered("<", Ordering::is_lt),
        CmpOp::Le => ordered("<=", Ordering::is_le),
        CmpOp::Gt => ordered(">", Ordering::is_gt),
        CmpOp::Ge => ordered(">=", Ordering::is_ge),
        CmpOp::In => contains(meter, b, a),
        CmpOp::NotIn => Ok(!contains(meter, b, a)?),
        CmpOp::Is => Ok(a.is(b)),
        CmpOp::IsNot => Ok(!a.is(b)),
    }
}

/// `item in container`.
pub fn contains(meter: &Meter, container: &Value, item: &Value) -> Flow<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.as_str().contains(needle.as_str())),
            other => Err(Fault::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(l) => any_equal(meter, &l.snapshot(), item),
        Value::Tuple(t) => any_equal(meter, t.items(), item),
        Value::Dict(d) => Ok(d.map().contains(&item.hash_key()?)),
        Value::Range(r) => match item {
            Value::Float(f) if f.fract() == 0.0 => Ok(r.contains(*f as i64)),
            other => Ok(other.as_int().is_some_and(|i| r.contains(i))),
        },
        other => Err(Fault::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn any_equal(meter: &Meter, items: &[Value], item: &Value) -> Flow<bool> {
    for candidate in items {
        meter.tick()?;
        if equals(meter, candidate, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

// ── indexing ────────────────────────────────────────────────────────

fn index_of(index: &Value, container: &str) -> Flow<i64> {
    index.as_int().ok_or_else(|| {
        Fault::type_error(format!(
            "{container} indices must be integers or slices, not {}",
            index.type_name()
        ))
    })
}

/// Resolve a possibly negative index against `len`.
pub fn normalize(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let i = if index < 0 { index + len } else { index };
    (0..len).contains(&i).then_some(i as usize)
}

pub fn get_item(meter: &Rc<Meter>, container: &Value, index: &Value) -> Flow<Value> {
    match container {
        Value::List(l) => {
            let i = index_of(index, "list")?;
            normalize(i, l.len())
                .and_then(|i| l.get(i))
                .ok_or_else(|| Fault::index_error("list index out of range"))
        }
        Value::Tuple(t) => {
            let i = index_of(index, "tuple")?;
            normalize(i, t.items().len())
                .map(|i| t.items()[i].clone())
                .ok_or_else(|| Fault::index_error("tuple index out of range"))
        }
        Value::Str(s) => {
            let i = index_of(index, "string")?;
            let text = s.as_str();
            let c = if text.is_ascii() {
                normalize(i, text.len()).map(|i| text[i..i + 1].to_string())
            } else {
                let chars: Vec<char> = text.chars().collect();
                normalize(i, chars.len()).map(|i| chars[i].to_string())
            };
            match c {
                Some(c) => Value::str(meter, c),
                None => Err(Fault::index_error("string index out of range")),
            }
        }
        Value::Range(r) => {
            let i = index_of(index, "range object")?;
            normalize(i, r.len())
                .and_then(|i| r.get(i))
                .map(Value::Int)
                .ok_or_else(|| Fault::index_error("range object index out of range"))
        }
        Value::Dict(d) => d
            .lookup(&index.hash_key()?)
            .ok_or_else(|| key_error(meter, index)),
        other => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub fn key_error(meter: &Meter, key: &Value) -> Fault {
    let text = key.repr(meter).unwrap_or_else(|_| key.type_name().to_string());
    Fault::raise(ExcClass::KeyError, text)
}

pub fn set_item(meter: &Rc<Meter>, container: &Value, index: &Value, value: Value) -> Flow<()> {
    match container {
        Value::List(l) => {
            let i = index_of(index, "list")?;
            let i = normalize(i, l.len())
                .ok_or_else(|| Fault::index_error("list assignment index out of range"))?;
            l.edit(|items| items[i] = value)
        }
        Value::Dict(d) => {
            meter.tick()?;
            d.insert(index.clone(), value)
        }
        other => Err(Fault::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

pub fn del_item(meter: &Rc<Meter>, container: &Value, index: &Value) -> Flow<()> {
    match container {
        Value::List(l) => {
            let i = index_of(index, "list")?;
            let i = normalize(i, l.len())
                .ok_or_else(|| Fault::index_error("list assignment index out of range"))?;
            l.edit(|items| drop(items.remove(i)))
        }
        Value::Dict(d) => match d.remove(&index.hash_key()?)? {
            Some(_) => Ok(()),
            None => Err(key_error(meter, index)),
        },
        other => Err(Fault::type_error(format!(
            "'{}' object doesn't support item deletion",
            other.type_name()
        ))),
    }
}

// ── slicing ─────────────────────────────────────────────────────────

fn slice_bound(value: &Value) -> Flow<Option<i64>> {
    match value {
        Value::None => Ok(None),
        other => other.as_int().map(Some).ok_or_else(|| {
            Fault::type_error("slice indices must be integers or None")
        }),
    }
}

/// Positions selected by `[lower:upper:step]` on a sequence of `len`.
struct Span {
    start: i64,
    step: i64,
    count: usize,
}

impl Span {
    fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).map(move |k| (self.start + self.step * k as i64) as usize)
    }
}

fn slice_span(len: usize, lower: &Value, upper: &Value, step: &Value) -> Flow<Span> {
    let step = slice_bound(step)?.unwrap_or(1);
    if step == 0 {
        return Err(Fault::value_error("slice step cannot be zero"));
    }
    let len = i64::try_from(len).map_err(|_| Fault::overflow())?;
    let clamp = |bound: Option<i64>, default: i64| -> i64 {
        match bound {
            None => default,
            Some(b) => {
                let b = if b < 0 { b.saturating_add(len) } else { b };
                if b < 0 {
                    if step < 0 {
                        -1
                    } else {
                        0
                    }
                } else if b >= len {
                    if step < 0 {
                        len - 1
                    } else {
                        len
                    }
                } else {
                    b
                }
            }
        }
    };
    let (start, stop) = if step > 0 {
        (clamp(slice_bound(lower)?, 0), clamp(slice_bound(upper)?, len))
    } else {
        (clamp(slice_bound(lower)?, len - 1), clamp(slice_bound(upper)?, -1))
    };
    let (s, e, st) = (start as i128, stop as i128, step as i128);
    let count = if st > 0 && s < e {
        (e - s - 1) / st + 1
    } else if st < 0 && s > e {
        (s - e - 1) / (-st) + 1
    } else {
        0
    };
    Ok(Span {
        start,
        step,
        count: count as usize,
    })
}

pub fn get_slice(
    meter: &Rc<Meter>,
    container: &Value,
    lower: &Value,
    upper: &Value,
    step: &Value,
) -> Flow<Value> {
    match container {
        Value::List(l) => {
            let items = l.snapshot();
            let span = slice_span(items.len(), lower, upper, step)?;
            let picked = span.positions().map(|i| items[i].clone()).collect();
            Value::list(meter, picked)
        }
        Value::Tuple(t) => {
            let span = slice_span(t.items().len(), lower, upper, step)?;
            let picked = span.positions().map(|i| t.items()[i].clone()).collect();
            Value::tuple(meter, picked)
        }
        Value::Str(s) => {
            let text = s.as_str();
            let picked: String = if text.is_ascii() {
                let bytes = text.as_bytes();
                let span = slice_span(bytes.len(), lower, upper, step)?;
                span.positions().map(|i| bytes[i] as char).collect()
            } else {
                let chars: Vec<char> = text.chars().collect();
                let span = slice_span(chars.len(), lower, upper, step)?;
                span.positions().map(|i| chars[i]).collect()
            };
            Value::str(meter, picked)
        }
        Value::Range(r) => {
            let span = slice_span(r.len(), lower, upper, step)?;
            let new_step = r.step.checked_mul(span.step).ok_or_else(Fault::overflow)?;
            match span.count {
                0 => Ok(Value::Range(Range {
                    start: 0,
                    stop: 0,
                    step: 1,
                })),
                count => {
                    let start = r.get(span.start as usize).ok_or_else(Fault::overflow)?;
                    let count = count as i128;
                    let stop = start as i128 + count * new_step as i128;
                    let stop = i64::try_from(stop).map_err(|_| Fault::overflow())?;
                    Ok(Value::Range(Range {
                        start,
                        stop,
                        step: new_step,
                    }))
                }
            }
        }
        other => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}
