//! The builtin namespace visible to submitted code.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

use super::error::{ExcClass, Fault, Flow};
use super::interp::Interp;
use super::ops;
use super::value::{Dict, Range, Value, SLOT};
use crate::lang::ast::BinOp;

/// Longest single wait inside `sleep` before the deadline is re-checked.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Len,
    Range,
    Int,
    Float,
    Str,
    Bool,
    List,
    Dict,
    Tuple,
    Abs,
    Min,
    Max,
    Sum,
    Round,
    Sorted,
    Reversed,
    Enumerate,
    Zip,
    Any,
    All,
    Isinstance,
    Sleep,
    /// Constructor for an exception class.
    Exception(ExcClass),
}

impl Builtin {
    const FUNCTIONS: [Builtin; 22] = [
        Builtin::Len,
        Builtin::Range,
        Builtin::Int,
        Builtin::Float,
        Builtin::Str,
        Builtin::Bool,
        Builtin::List,
        Builtin::Dict,
        Builtin::Tuple,
        Builtin::Abs,
        Builtin::Min,
        Builtin::Max,
        Builtin::Sum,
        Builtin::Round,
        Builtin::Sorted,
        Builtin::Reversed,
        Builtin::Enumerate,
        Builtin::Zip,
        Builtin::Any,
        Builtin::All,
        Builtin::Isinstance,
        Builtin::Sleep,
    ];

    pub fn lookup(name: &str) -> Option<Self> {
        if let Some(class) = ExcClass::lookup(name) {
            return Some(Builtin::Exception(class));
        }
        Self::FUNCTIONS.into_iter().find(|b| b.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Range => "range",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Str => "str",
            Builtin::Bool => "bool",
            Builtin::List => "list",
            Builtin::Dict => "dict",
            Builtin::Tuple => "tuple",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Round => "round",
            Builtin::Sorted => "sorted",
            Builtin::Reversed => "reversed",
            Builtin::Enumerate => "enumerate",
            Builtin::Zip => "zip",
            Builtin::Any => "any",
            Builtin::All => "all",
            Builtin::Isinstance => "isinstance",
            Builtin::Sleep => "sleep",
            Builtin::Exception(class) => class.name(),
        }
    }

    /// Whether the builtin is a type usable with `isinstance`.
    pub fn is_type(self) -> bool {
        matches!(
            self,
            Builtin::Int
                | Builtin::Float
                | Builtin::Str
                | Builtin::Bool
                | Builtin::List
                | Builtin::Dict
                | Builtin::Tuple
                | Builtin::Range
                | Builtin::Exception(_)
        )
    }
}

/// Positional and keyword arguments of one builtin or method call.
pub(crate) struct Args {
    name: &'static str,
    positional: Vec<Value>,
    kwargs: Vec<(String, Value)>,
}

impl Args {
    pub(crate) fn new(name: &'static str, positional: Vec<Value>, kwargs: Vec<(String, Value)>) -> Self {
        Self {
            name,
            positional,
            kwargs,
        }
    }

    /// Require between `min` and `max` positional arguments.
    pub(crate) fn arity(&self, min: usize, max: usize) -> Flow<()> {
        let given = self.positional.len();
        if (min..=max).contains(&given) {
            return Ok(());
        }
        let expected = if min == max {
            format!("exactly {min}")
        } else if given < min {
            format!("at least {min}")
        } else {
            format!("at most {max}")
        };
        Err(Fault::type_error(format!(
            "{}() takes {expected} argument(s) ({given} given)",
            self.name
        )))
    }

    pub(crate) fn len(&self) -> usize {
        self.positional.len()
    }

    pub(crate) fn get(&self, i: usize) -> Option<&Value> {
        self.positional.get(i)
    }

    pub(crate) fn take(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.positional)
    }

    /// Remove and return a keyword argument.
    pub(crate) fn keyword(&mut self, name: &str) -> Option<Value> {
        let at = self.kwargs.iter().position(|(k, _)| k == name)?;
        Some(self.kwargs.remove(at).1)
    }

    /// Fail on any keyword argument not consumed by [`Args::keyword`].
    pub(crate) fn finish(&self) -> Flow<()> {
        match self.kwargs.first() {
            Some((name, _)) => Err(Fault::type_error(format!(
                "{}() got an unexpected keyword argument '{name}'",
                self.name
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn int(&self, i: usize) -> Flow<i64> {
        let value = self.positional.get(i).unwrap_or(&Value::None);
        value.as_int().ok_or_else(|| {
            Fault::type_error(format!(
                "{}() argument {} must be int, not {}",
                self.name,
                i + 1,
                value.type_name()
            ))
        })
    }

    pub(crate) fn string(&self, i: usize) -> Flow<&str> {
        let value = self.positional.get(i).unwrap_or(&Value::None);
        value.as_str().ok_or_else(|| {
            Fault::type_error(format!(
                "{}() argument {} must be str, not {}",
                self.name,
                i + 1,
                value.type_name()
            ))
        })
    }
}

pub fn call(
    interp: &mut Interp,
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Flow<Value> {
    let mut args = Args::new(builtin.name(), args, kwargs);
    let takes_keywords = matches!(
        builtin,
        Builtin::Min | Builtin::Max | Builtin::Sorted | Builtin::Sum | Builtin::Enumerate | Builtin::Dict
    );
    if !takes_keywords {
        args.finish()?;
    }
    let meter = interp.meter().clone();
    match builtin {
        Builtin::Min | Builtin::Max => min_max(interp, builtin, args),
        Builtin::Sorted => sorted(interp, args),
        Builtin::Sum => sum(interp, args),
        Builtin::Enumerate => enumerate(interp, args),
        Builtin::Dict => dict(interp, args),
        Builtin::Len => {
            args.arity(1, 1)?;
            len(&args.take()[0]).map(Value::Int)
        }
        Builtin::Range => {
            args.arity(1, 3)?;
            let (start, stop, step) = match args.len() {
                1 => (0, args.int(0)?, 1),
                2 => (args.int(0)?, args.int(1)?, 1),
                _ => (args.int(0)?, args.int(1)?, args.int(2)?),
            };
            if step == 0 {
                return Err(Fault::value_error("range() arg 3 must not be zero"));
            }
            Ok(Value::Range(Range { start, stop, step }))
        }
        Builtin::Int => {
            args.arity(0, 1)?;
            match args.get(0) {
                None => Ok(Value::Int(0)),
                Some(value) => to_int(value).map(Value::Int),
            }
        }
        Builtin::Float => {
            args.arity(0, 1)?;
            match args.get(0) {
                None => Ok(Value::Float(0.0)),
                Some(value) => to_float(value).map(Value::Float),
            }
        }
        Builtin::Str => {
            args.arity(0, 1)?;
            let text = match args.get(0) {
                None => String::new(),
                Some(value) => value.to_text(&meter)?,
            };
            Value::str(&meter, text)
        }
        Builtin::Bool => {
            args.arity(0, 1)?;
            Ok(Value::Bool(args.get(0).is_some_and(Value::truthy)))
        }
        Builtin::List => {
            args.arity(0, 1)?;
            let items = match args.get(0) {
                None => Vec::new(),
                Some(value) => interp.collect(value)?,
            };
            Value::list(&meter, items)
        }
        Builtin::Tuple => {
            args.arity(0, 1)?;
            let items = match args.get(0) {
                None => Vec::new(),
                Some(Value::Tuple(t)) => return Ok(Value::Tuple(t.clone())),
                Some(value) => interp.collect(value)?,
            };
            Value::tuple(&meter, items)
        }
        Builtin::Abs => {
            args.arity(1, 1)?;
            match &args.take()[0] {
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => match other.as_int() {
                    Some(i) => i.checked_abs().map(Value::Int).ok_or_else(Fault::overflow),
                    None => Err(Fault::type_error(format!(
                        "bad operand type for abs(): '{}'",
                        other.type_name()
                    ))),
                },
            }
        }
        Builtin::Round => {
            args.arity(1, 2)?;
            let digits = match args.get(1) {
                None | Some(Value::None) => None,
                Some(_) => Some(args.int(1)?),
            };
            round(&args.take()[0], digits)
        }
        Builtin::Reversed => {
            args.arity(1, 1)?;
            let mut items = match &args.take()[0] {
                Value::Range(r) => {
                    meter.ensure(r.len().saturating_mul(SLOT))?;
                    (0..r.len()).filter_map(|i| r.get(i)).map(Value::Int).collect()
                }
                value @ (Value::List(_) | Value::Tuple(_) | Value::Str(_) | Value::Dict(_)) => {
                    interp.collect(value)?
                }
                other => {
                    return Err(Fault::type_error(format!(
                        "'{}' object is not reversible",
                        other.type_name()
                    )))
                }
            };
            items.reverse();
            Value::list(&meter, items)
        }
        Builtin::Zip => {
            let sources = args
                .take()
                .iter()
                .map(|value| interp.collect(value))
                .collect::<Flow<Vec<_>>>()?;
            let shortest = sources.iter().map(Vec::len).min().unwrap_or(0);
            let mut rows = Vec::with_capacity(shortest);
            for i in 0..shortest {
                meter.tick()?;
                let row = sources.iter().map(|s| s[i].clone()).collect();
                rows.push(Value::tuple(&meter, row)?);
            }
            Value::list(&meter, rows)
        }
        Builtin::Any | Builtin::All => {
            args.arity(1, 1)?;
            let want = builtin == Builtin::Any;
            let mut it = interp.iter(&args.take()[0])?;
            while let Some(item) = interp.next(&mut it)? {
                if item.truthy() == want {
                    return Ok(Value::Bool(want));
                }
            }
            Ok(Value::Bool(!want))
        }
        Builtin::Isinstance => {
            args.arity(2, 2)?;
            let mut taken = args.take();
            let classes = taken.pop().unwrap_or(Value::None);
            let value = taken.pop().unwrap_or(Value::None);
            isinstance(&value, &classes).map(Value::Bool)
        }
        Builtin::Sleep => {
            args.arity(1, 1)?;
            let seconds = args.get(0).and_then(Value::as_float).ok_or_else(|| {
                Fault::type_error("sleep() argument must be a number")
            })?;
            sleep(interp, seconds)?;
            Ok(Value::None)
        }
        Builtin::Exception(class) => {
            let message = match args.take().as_slice() {
                [] => String::new(),
                [only] => only.to_text(&meter)?,
                many => {
                    let parts = many
                        .iter()
                        .map(|v| v.repr(&meter))
                        .collect::<Flow<Vec<_>>>()?;
                    format!("({})", parts.join(", "))
                }
            };
            Ok(Value::exception(class, message))
        }
    }
}

pub fn len(value: &Value) -> Flow<i64> {
    let n = match value {
        Value::Str(s) => s.as_str().chars().count(),
        Value::List(l) => l.len(),
        Value::Tuple(t) => t.items().len(),
        Value::Dict(d) => d.len(),
        Value::Range(r) => r.len(),
        other => {
            return Err(Fault::type_error(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )))
        }
    };
    i64::try_from(n).map_err(|_| Fault::overflow())
}

fn to_int(value: &Value) -> Flow<i64> {
    match value {
        Value::Float(f) => {
            if f.is_nan() {
                return Err(Fault::value_error("cannot convert float NaN to integer"));
            }
            let truncated = f.trunc();
            if truncated < -(2f64.powi(63)) || truncated >= 2f64.powi(63) {
                return Err(Fault::overflow());
            }
            Ok(truncated as i64)
        }
        Value::Str(s) => {
            let text = s.as_str().trim();
            let digits = text.replace('_', "");
            if text.starts_with('_') || text.ends_with('_') || text.contains("__") {
                return Err(invalid_int(s.as_str()));
            }
            digits.parse::<i64>().map_err(|e| match e.kind() {
                std::num::IntErrorKind::PosOverflow | std::num::IntErrorKind::NegOverflow => {
                    Fault::overflow()
                }
                _ => invalid_int(s.as_str()),
            })
        }
        other => other.as_int().ok_or_else(|| {
            Fault::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn invalid_int(text: &str) -> Fault {
    Fault::value_error(format!(
        "invalid literal for int() with base 10: {}",
        super::value::quote(text)
    ))
}

fn to_float(value: &Value) -> Flow<f64> {
    match value {
        Value::Str(s) => {
            let text = s.as_str().trim();
            let lowered = text.to_ascii_lowercase();
            let unsigned = lowered.trim_start_matches(['+', '-']);
            let special = matches!(unsigned, "inf" | "infinity" | "nan");
            if !special && !text.chars().all(|c| c.is_ascii_digit() || "+-.eE_".contains(c)) {
                return Err(invalid_float(s.as_str()));
            }
            text.replace('_', "")
                .parse::<f64>()
                .map_err(|_| invalid_float(s.as_str()))
        }
        other => other.as_float().ok_or_else(|| {
            Fault::type_error(format!(
                "float() argument must be a string or a number, not '{}'",
                other.type_name()
            ))
        }),
    }
}

fn invalid_float(text: &str) -> Fault {
    Fault::value_error(format!(
        "could not convert string to float: {}",
        super::value::quote(text)
    ))
}

/// `round()` with banker's rounding, like the host language it imitates.
fn round(value: &Value, digits: Option<i64>) -> Flow<Value> {
    match (value, digits) {
        (Value::Float(f), None) => {
            if !f.is_finite() {
                return Err(if f.is_nan() {
                    Fault::value_error("cannot convert float NaN to integer")
                } else {
                    Fault::overflow()
                });
            }
            to_int(&Value::Float(f.round_ties_even()))
                .map(Value::Int)
        }
        (Value::Float(f), Some(digits)) => {
            let digits = i32::try_from(digits.clamp(-400, 400)).unwrap_or(0);
            let scale = 10f64.powi(digits);
            let scaled = f * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(*f));
            }
            Ok(Value::Float(scaled.round_ties_even() / scale))
        }
        (other, digits) => {
            let i = other.as_int().ok_or_else(|| {
                Fault::type_error(format!(
                    "type {} doesn't define __round__ method",
                    other.type_name()
                ))
            })?;
            match digits {
                Some(d) if d < 0 => {
                    let Some(unit) = u32::try_from(-d).ok().and_then(|e| 10i64.checked_pow(e)) else {
                        return Ok(Value::Int(0));
                    };
                    let rem = i.rem_euclid(unit);
                    let base = i - rem;
                    let half = unit / 2;
                    let up = rem > half || (rem == half && (base / unit) % 2 != 0);
                    let rounded = if up { base.checked_add(unit) } else { Some(base) };
                    rounded.map(Value::Int).ok_or_else(Fault::overflow)
                }
                _ => Ok(Value::Int(i)),
            }
        }
    }
}

fn isinstance(value: &Value, classes: &Value) -> Flow<bool> {
    match classes {
        Value::Tuple(t) => {
            for class in t.items() {
                if isinstance(value, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Builtin(b) if b.is_type() => Ok(match (b, value) {
            (Builtin::Int, Value::Int(_) | Value::Bool(_)) => true,
            (Builtin::Float, Value::Float(_)) => true,
            (Builtin::Str, Value::Str(_)) => true,
            (Builtin::Bool, Value::Bool(_)) => true,
            (Builtin::List, Value::List(_)) => true,
            (Builtin::Dict, Value::Dict(_)) => true,
            (Builtin::Tuple, Value::Tuple(_)) => true,
            (Builtin::Range, Value::Range(_)) => true,
            (Builtin::Exception(class), Value::Exception(e)) => e.class.is_subclass_of(*class),
            _ => false,
        }),
        _ => Err(Fault::type_error(
            "isinstance() arg 2 must be a type or tuple of types",
        )),
    }
}

/// Block for `seconds`, waking often enough to honor the deadline.
fn sleep(interp: &Interp, seconds: f64) -> Flow<()> {
    if seconds.is_nan() || seconds < 0.0 {
        return Err(Fault::value_error("sleep length must be non-negative"));
    }
    let meter = interp.meter();
    let wake = Duration::try_from_secs_f64(seconds)
        .ok()
        .and_then(|d| Instant::now().checked_add(d))
        .unwrap_or_else(|| meter.deadline());
    loop {
        if meter.expired() {
            return Err(Fault::Timeout);
        }
        let now = Instant::now();
        if now >= wake {
            return Ok(());
        }
        std::thread::sleep((wake - now).min(SLEEP_SLICE));
    }
}

fn min_max(interp: &mut Interp, builtin: Builtin, mut args: Args) -> Flow<Value> {
    let key = args.keyword("key").filter(|k| !matches!(k, Value::None));
    let default = args.keyword("default");
    args.finish()?;
    args.arity(1, usize::MAX)?;
    let candidates = if args.len() == 1 {
        interp.collect(&args.take()[0])?
    } else {
        if default.is_some() {
            return Err(Fault::type_error(format!(
                "Cannot specify a default for {}() with multiple positional arguments",
                builtin.name()
            )));
        }
        args.take()
    };
    let wanted = if builtin == Builtin::Max {
        Ordering::Greater
    } else {
        Ordering::Less
    };
    let symbol = if builtin == Builtin::Max { ">" } else { "<" };
    let mut best: Option<(Value, Value)> = None;
    for candidate in candidates {
        let rank = match &key {
            Some(key) => interp.call(key, vec![candidate.clone()], Vec::new())?,
            None => candidate.clone(),
        };
        best = match best {
            None => Some((candidate, rank)),
            Some((kept, kept_rank)) => {
                if ops::order(interp.meter(), &rank, &kept_rank, symbol)? == Some(wanted) {
                    Some((candidate, rank))
                } else {
                    Some((kept, kept_rank))
                }
            }
        };
    }
    match (best, default) {
        (Some((value, _)), _) => Ok(value),
        (None, Some(default)) => Ok(default),
        (None, None) => Err(Fault::value_error(format!(
            "{}() arg is an empty sequence",
            builtin.name()
        ))),
    }
}

fn sorted(interp: &mut Interp, mut args: Args) -> Flow<Value> {
    let key = args.keyword("key").filter(|k| !matches!(k, Value::None));
    let reverse = args.keyword("reverse").is_some_and(|r| r.truthy());
    args.finish()?;
    args.arity(1, 1)?;
    let items = interp.collect(&args.take()[0])?;
    let sorted = sort_values(interp, items, key.as_ref(), reverse)?;
    Value::list(interp.meter(), sorted)
}

/// Stable merge sort with a fallible comparison. Keys are computed once.
pub fn sort_values(
    interp: &mut Interp,
    items: Vec<Value>,
    key: Option<&Value>,
    reverse: bool,
) -> Flow<Vec<Value>> {
    let keys = match key {
        Some(key) => items
            .iter()
            .map(|item| interp.call(key, vec![item.clone()], Vec::new()))
            .collect::<Flow<Vec<_>>>()?,
        None => items.clone(),
    };
    let meter = interp.meter().clone();
    meter.ensure(items.len().saturating_mul(2 * SLOT))?;
    // `after(a, b)`: must element `a` be placed after `b`?
    let after = |a: &Value, b: &Value| -> Flow<bool> {
        meter.tick()?;
        let ord = if reverse {
            ops::order(&meter, b, a, "<")?
        } else {
            ops::order(&meter, a, b, "<")?
        };
        Ok(ord == Some(Ordering::Greater))
    };
    let mut order: Vec<usize> = (0..items.len()).collect();
    let mut scratch = Vec::with_capacity(order.len());
    let mut width = 1;
    while width < order.len() {
        scratch.clear();
        for start in (0..order.len()).step_by(2 * width) {
            let mid = (start + width).min(order.len());
            let end = (start + 2 * width).min(order.len());
            let (mut i, mut j) = (start, mid);
            while i < mid && j < end {
                if after(&keys[order[i]], &keys[order[j]])? {
                    scratch.push(order[j]);
                    j += 1;
                } else {
                    scratch.push(order[i]);
                    i += 1;
                }
            }
            scratch.extend_from_slice(&order[i..mid]);
            scratch.extend_from_slice(&order[j..end]);
        }
        std::mem::swap(&mut order, &mut scratch);
        width *= 2;
    }
    let mut slots: Vec<Option<Value>> = items.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

fn sum(interp: &mut Interp, mut args: Args) -> Flow<Value> {
    let start = args.keyword("start");
    args.finish()?;
    args.arity(1, 2)?;
    let mut taken = args.take();
    let mut total = match (taken.len(), start) {
        (2, _) => taken.pop().unwrap_or(Value::Int(0)),
        (_, Some(start)) => start,
        _ => Value::Int(0),
    };
    if matches!(total, Value::Str(_)) {
        return Err(Fault::type_error(
            "sum() can't sum strings [use ''.join(seq) instead]",
        ));
    }
    let meter = interp.meter().clone();
    let mut it = interp.iter(&taken[0])?;
    while let Some(item) = interp.next(&mut it)? {
        total = ops::binary(&meter, BinOp::Add, &total, &item)?;
    }
    Ok(total)
}

fn enumerate(interp: &mut Interp, mut args: Args) -> Flow<Value> {
    let start_kw = args.keyword("start");
    args.finish()?;
    args.arity(1, 2)?;
    let start = match (args.len(), start_kw) {
        (2, _) => args.int(1)?,
        (_, Some(v)) => v
            .as_int()
            .ok_or_else(|| Fault::type_error("enumerate() start must be an integer"))?,
        _ => 0,
    };
    let meter = interp.meter().clone();
    let items = interp.collect(&args.take()[0])?;
    let mut rows = Vec::with_capacity(items.len());
    for (offset, item) in items.into_iter().enumerate() {
        let index = i64::try_from(offset)
            .ok()
            .and_then(|o| start.checked_add(o))
            .ok_or_else(Fault::overflow)?;
        rows.push(Value::tuple(&meter, vec![Value::Int(index), item])?);
    }
    Value::list(&meter, rows)
}

fn dict(interp: &mut Interp, mut args: Args) -> Flow<Value> {
    args.arity(0, 1)?;
    let meter = interp.meter().clone();
    let mut map = Dict::default();
    if let Some(source) = args.take().into_iter().next() {
        match &source {
            Value::Dict(d) => map = d.snapshot(),
            other => {
                for pair in interp.collect(other)? {
                    let mut pair_items = interp.collect(&pair)?;
                    if pair_items.len() != 2 {
                        return Err(Fault::value_error(format!(
                            "dictionary update sequence element has length {}; 2 is required",
                            pair_items.len()
                        )));
                    }
                    let value = pair_items.pop().unwrap_or(Value::None);
                    let key = pair_items.pop().unwrap_or(Value::None);
                    map.insert(key.hash_key()?, key, value);
                }
            }
        }
    }
    for (name, value) in std::mem::take(&mut args.kwargs) {
        let key = Value::str(&meter, name.as_str())?;
        map.insert(super::value::HashKey::Str(name), key, value);
    }
    Value::dict(&meter, map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::meter::Meter;
    use std::rc::Rc;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn interp() -> Interp {
        let meter = Meter::new(
            1 << 20,
            Arc::new(AtomicBool::new(false)),
            Instant::now() + Duration::from_secs(60),
        );
        Interp::new(meter, 50)
    }

    fn call_with(interp: &mut Interp, builtin: Builtin, args: Vec<Value>) -> Flow<Value> {
        call(interp, builtin, args, Vec::new())
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Int).collect()
    }

    fn as_ints(value: &Value) -> Vec<i64> {
        match value {
            Value::List(l) => l.snapshot().iter().filter_map(Value::as_int).collect(),
            other => panic!("not a list: {other:?}"),
        }
    }

    #[test]
    fn lookup_covers_functions_and_exceptions() {
        assert_eq!(Builtin::lookup("len"), Some(Builtin::Len));
        assert_eq!(
            Builtin::lookup("ValueError"),
            Some(Builtin::Exception(ExcClass::ValueError))
        );
        assert_eq!(Builtin::lookup("open"), None);
        assert_eq!(Builtin::lookup("print"), None);
    }

    #[test]
    fn sorted_is_stable_and_reversible() {
        let mut it = interp();
        let meter = Rc::clone(it.meter());
        let list = Value::list(&meter, ints(&[3, 1, 2, 1])).unwrap();
        let out = call_with(&mut it, Builtin::Sorted, vec![list.clone()]).unwrap();
        assert_eq!(as_ints(&out), vec![1, 1, 2, 3]);

        let out = call(
            &mut it,
            Builtin::Sorted,
            vec![list],
            vec![("reverse".into(), Value::Bool(true))],
        )
        .unwrap();
        assert_eq!(as_ints(&out), vec![3, 2, 1, 1]);
    }

    #[test]
    fn sorting_mixed_types_fails() {
        let mut it = interp();
        let meter = Rc::clone(it.meter());
        let mixed = vec![Value::Int(1), Value::str(&meter, "a").unwrap()];
        let list = Value::list(&meter, mixed).unwrap();
        let err = call_with(&mut it, Builtin::Sorted, vec![list]).unwrap_err();
        assert!(err.to_string().contains("not supported between"));
    }

    #[test]
    fn min_max_and_defaults() {
        let mut it = interp();
        assert_eq!(
            call_with(&mut it, Builtin::Max, ints(&[4, 9, 2])).unwrap().as_int(),
            Some(9)
        );
        assert_eq!(
            call_with(&mut it, Builtin::Min, ints(&[4, 9, 2])).unwrap().as_int(),
            Some(2)
        );
        let meter = Rc::clone(it.meter());
        let empty = Value::list(&meter, Vec::new()).unwrap();
        assert!(call_with(&mut it, Builtin::Max, vec![empty.clone()]).is_err());
        let out = call(
            &mut it,
            Builtin::Max,
            vec![empty],
            vec![("default".into(), Value::Int(-1))],
        )
        .unwrap();
        assert_eq!(out.as_int(), Some(-1));
    }

    #[test]
    fn rounding_is_bankers() {
        assert_eq!(round(&Value::Float(2.5), None).unwrap().as_int(), Some(2));
        assert_eq!(round(&Value::Float(3.5), None).unwrap().as_int(), Some(4));
        assert_eq!(round(&Value::Int(1250), Some(-2)).unwrap().as_int(), Some(1200));
        match round(&Value::Float(1.23456), Some(2)).unwrap() {
            Value::Float(f) => assert!((f - 1.23).abs() < 1e-9),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn int_and_float_conversions() {
        let it = interp();
        let meter = Rc::clone(it.meter());
        assert_eq!(to_int(&Value::str(&meter, " 42 ").unwrap()).unwrap(), 42);
        assert_eq!(to_int(&Value::Float(-3.9)).unwrap(), -3);
        assert!(to_int(&Value::str(&meter, "4x").unwrap()).is_err());
        assert_eq!(to_float(&Value::str(&meter, "2.5").unwrap()).unwrap(), 2.5);
        assert!(to_float(&Value::str(&meter, "nan").unwrap()).unwrap().is_nan());
        assert!(to_float(&Value::str(&meter, "abc").unwrap()).is_err());
    }

    #[test]
    fn isinstance_follows_bool_is_int() {
        let int = Value::Builtin(Builtin::Int);
        assert!(isinstance(&Value::Bool(true), &int).unwrap());
        assert!(!isinstance(&Value::Float(1.0), &int).unwrap());
        let exc = Value::exception(ExcClass::KeyError, String::new());
        let base = Value::Builtin(Builtin::Exception(ExcClass::Exception));
        assert!(isinstance(&exc, &base).unwrap());
        assert!(isinstance(&Value::Int(1), &Value::Int(1)).is_err());
    }

    #[test]
    fn sleep_respects_the_deadline() {
        let meter = Meter::new(
            1 << 20,
            Arc::new(AtomicBool::new(false)),
            Instant::now() + Duration::from_millis(30),
        );
        let it = Interp::new(meter, 10);
        let started = Instant::now();
        assert_eq!(sleep(&it, 10.0), Err(Fault::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(sleep(&it, -1.0).is_err());
    }

    #[test]
    fn zip_and_enumerate_build_tuples() {
        let mut it = interp();
        let meter = Rc::clone(it.meter());
        let a = Value::list(&meter, ints(&[1, 2, 3])).unwrap();
        let b = Value::list(&meter, ints(&[10, 20])).unwrap();
        let zipped = call_with(&mut it, Builtin::Zip, vec![a.clone(), b]).unwrap();
        assert_eq!(zipped.repr(&meter).unwrap(), "[(1, 10), (2, 20)]");
        let numbered = call(
            &mut it,
            Builtin::Enumerate,
            vec![a],
            vec![("start".into(), Value::Int(1))],
        )
        .unwrap();
        assert_eq!(numbered.repr(&meter).unwrap(), "[(1, 1), (2, 2), (3, 3)]");
    }
}
