//! Methods on builtin values: `text.split(",")`, `items.append(x)`, ...

use std::rc::Rc;

use super::builtins::{sort_values, Args};
use super::error::{ExcClass, Fault, Flow};
use super::interp::Interp;
use super::meter::Meter;
use super::ops;
use super::value::{DictObj, ListObj, StrObj, Value, SLOT, STR_HEADER};

pub fn call_method(
    interp: &mut Interp,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Flow<Value> {
    interp.meter().tick()?;
    let Some(method) = resolve(receiver, name) else {
        return Err(Fault::raise(
            ExcClass::AttributeError,
            format!(
                "'{}' object has no attribute '{name}'",
                receiver.type_name()
            ),
        ));
    };
    let mut args = Args::new(method, args, kwargs);
    match receiver {
        Value::Str(s) => {
            args.finish()?;
            str_method(interp.meter(), s, method, args)
        }
        Value::List(l) => list_method(interp, l, method, args),
        Value::Tuple(t) => {
            args.finish()?;
            seq_method(interp.meter(), t.items(), method, args)
        }
        Value::Dict(d) => {
            args.finish()?;
            dict_method(interp.meter(), d, method, args)
        }
        _ => Err(Fault::type_error(format!("{method}() is unsupported"))),
    }
}

const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "join", "replace", "startswith",
    "endswith", "find", "index", "count", "title", "capitalize", "isdigit", "isalpha", "isalnum",
    "isspace", "isupper", "islower", "zfill",
];
const LIST_METHODS: &[&str] = &[
    "append", "extend", "insert", "pop", "remove", "index", "count", "sort", "reverse", "copy",
    "clear",
];
const TUPLE_METHODS: &[&str] = &["index", "count"];
const DICT_METHODS: &[&str] = &[
    "get", "keys", "values", "items", "update", "setdefault", "pop", "copy", "clear",
];

/// The method's static name, if the receiver's type has it.
fn resolve(receiver: &Value, name: &str) -> Option<&'static str> {
    let table = match receiver {
        Value::Str(_) => STR_METHODS,
        Value::List(_) => LIST_METHODS,
        Value::Tuple(_) => TUPLE_METHODS,
        Value::Dict(_) => DICT_METHODS,
        _ => return None,
    };
    table.iter().copied().find(|m| *m == name)
}

fn str_method(meter: &Rc<Meter>, s: &StrObj, method: &'static str, mut args: Args) -> Flow<Value> {
    let text = s.as_str();
    let predicate = |test: fn(&str) -> bool| -> Flow<Value> { Ok(Value::Bool(test(text))) };
    match method {
        "upper" => {
            args.arity(0, 0)?;
            Value::str(meter, text.to_uppercase())
        }
        "lower" => {
            args.arity(0, 0)?;
            Value::str(meter, text.to_lowercase())
        }
        "strip" | "lstrip" | "rstrip" => {
            args.arity(0, 1)?;
            let chars: Option<Vec<char>> = match args.get(0) {
                None | Some(Value::None) => None,
                Some(_) => Some(args.string(0)?.chars().collect()),
            };
            let matches = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            let out = match method {
                "strip" => text.trim_matches(matches),
                "lstrip" => text.trim_start_matches(matches),
                _ => text.trim_end_matches(matches),
            };
            Value::str(meter, out)
        }
        "split" => {
            args.arity(0, 2)?;
            let limit = match args.get(1) {
                Some(_) => args.int(1)?,
                None => -1,
            };
            let parts: Vec<&str> = match args.get(0) {
                None | Some(Value::None) => split_whitespace(text, limit),
                Some(_) => {
                    let sep = args.string(0)?;
                    if sep.is_empty() {
                        return Err(Fault::value_error("empty separator"));
                    }
                    match usize::try_from(limit) {
                        Ok(n) => text.splitn(n + 1, sep).collect(),
                        Err(_) => text.split(sep).collect(),
                    }
                }
            };
            meter.ensure(parts.iter().map(|p| STR_HEADER + SLOT + p.len()).sum())?;
            let items = parts
                .into_iter()
                .map(|p| Value::str(meter, p))
                .collect::<Flow<Vec<_>>>()?;
            Value::list(meter, items)
        }
        "join" => {
            args.arity(1, 1)?;
            let items = match &args.take()[0] {
                Value::List(l) => l.snapshot(),
                Value::Tuple(t) => t.items().to_vec(),
                Value::Str(s) => s.as_str().chars().map(|c| Value::str(meter, c.to_string())).collect::<Flow<_>>()?,
                Value::Dict(d) => d.map().keys().cloned().collect(),
                other => {
                    return Err(Fault::type_error(format!(
                        "can only join an iterable, not '{}'",
                        other.type_name()
                    )))
                }
            };
            let mut total = text.len().saturating_mul(items.len());
            for (i, item) in items.iter().enumerate() {
                let part = item.as_str().ok_or_else(|| {
                    Fault::type_error(format!(
                        "sequence item {i}: expected str instance, {} found",
                        item.type_name()
                    ))
                })?;
                total = total.saturating_add(part.len());
            }
            meter.ensure(STR_HEADER + total)?;
            let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            Value::str(meter, parts.join(text))
        }
        "replace" => {
            args.arity(2, 3)?;
            let (old, new) = (args.string(0)?, args.string(1)?);
            let count = match args.get(2) {
                Some(_) => args.int(2)?,
                None => -1,
            };
            let hits = if old.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(old).count()
            };
            let hits = usize::try_from(count).map_or(hits, |c| c.min(hits));
            let grown = text.len() + hits.saturating_mul(new.len());
            meter.ensure(STR_HEADER + grown)?;
            let out = match usize::try_from(count) {
                Ok(n) => text.replacen(old, new, n),
                Err(_) => text.replace(old, new),
            };
            Value::str(meter, out)
        }
        "startswith" | "endswith" => {
            args.arity(1, 1)?;
            let test = |prefix: &str| {
                if method == "startswith" {
                    text.starts_with(prefix)
                } else {
                    text.ends_with(prefix)
                }
            };
            match &args.take()[0] {
                Value::Str(p) => Ok(Value::Bool(test(p.as_str()))),
                Value::Tuple(t) => Ok(Value::Bool(
                    t.items().iter().filter_map(Value::as_str).any(test),
                )),
                other => Err(Fault::type_error(format!(
                    "{method} first arg must be str or a tuple of str, not {}",
                    other.type_name()
                ))),
            }
        }
        "find" | "index" => {
            args.arity(1, 1)?;
            let needle = args.string(0)?;
            match text.find(needle) {
                Some(byte) => Ok(Value::Int(char_index(text, byte))),
                None if method == "find" => Ok(Value::Int(-1)),
                None => Err(Fault::value_error("substring not found")),
            }
        }
        "count" => {
            args.arity(1, 1)?;
            let needle = args.string(0)?;
            let n = if needle.is_empty() {
                text.chars().count() + 1
            } else {
                text.matches(needle).count()
            };
            Ok(Value::Int(i64::try_from(n).map_err(|_| Fault::overflow())?))
        }
        "title" => {
            args.arity(0, 0)?;
            let mut out = String::with_capacity(text.len());
            let mut boundary = true;
            for c in text.chars() {
                if c.is_alphabetic() {
                    if boundary {
                        out.extend(c.to_uppercase());
                    } else {
                        out.extend(c.to_lowercase());
                    }
                    boundary = false;
                } else {
                    out.push(c);
                    boundary = true;
                }
            }
            Value::str(meter, out)
        }
        "capitalize" => {
            args.arity(0, 0)?;
            let mut chars = text.chars();
            let out = match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            };
            Value::str(meter, out)
        }
        "isdigit" => predicate(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit())),
        "isalpha" => predicate(|t| !t.is_empty() && t.chars().all(char::is_alphabetic)),
        "isalnum" => predicate(|t| !t.is_empty() && t.chars().all(char::is_alphanumeric)),
        "isspace" => predicate(|t| !t.is_empty() && t.chars().all(char::is_whitespace)),
        "isupper" => predicate(|t| {
            t.chars().any(char::is_uppercase) && !t.chars().any(char::is_lowercase)
        }),
        "islower" => predicate(|t| {
            t.chars().any(char::is_lowercase) && !t.chars().any(char::is_uppercase)
        }),
        "zfill" => {
            args.arity(1, 1)?;
            let width = usize::try_from(args.int(0)?).unwrap_or(0);
            let len = text.chars().count();
            if width <= len {
                return Value::str(meter, text);
            }
            meter.ensure(STR_HEADER + text.len() + (width - len))?;
            let (sign, digits) = match text.strip_prefix(['+', '-']) {
                Some(rest) => (&text[..1], rest),
                None => ("", text),
            };
            Value::str(meter, format!("{sign}{}{digits}", "0".repeat(width - len)))
        }
        _ => Err(Fault::type_error(format!("str.{method}() is unsupported"))),
    }
}

fn split_whitespace(text: &str, limit: i64) -> Vec<&str> {
    let Ok(limit) = usize::try_from(limit) else {
        return text.split_whitespace().collect();
    };
    let mut parts = Vec::new();
    let mut rest = text.trim_start();
    while !rest.is_empty() {
        if parts.len() == limit {
            parts.push(rest);
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(end) => {
                parts.push(&rest[..end]);
                rest = rest[end..].trim_start();
            }
            None => {
                parts.push(rest);
                break;
            }
        }
    }
    parts
}

fn char_index(text: &str, byte: usize) -> i64 {
    i64::try_from(text[..byte].chars().count()).unwrap_or(i64::MAX)
}

/// `count` and `index`, shared by lists and tuples.
fn seq_method(meter: &Meter, items: &[Value], method: &'static str, args: Args) -> Flow<Value> {
    args.arity(1, 1)?;
    let needle = args.get(0).unwrap_or(&Value::None);
    match method {
        "count" => {
            let mut n = 0;
            for item in items {
                meter.tick()?;
                if ops::equals(meter, item, needle)? {
                    n += 1;
                }
            }
            Ok(Value::Int(n))
        }
        "index" => {
            for (i, item) in items.iter().enumerate() {
                meter.tick()?;
                if ops::equals(meter, item, needle)? {
                    return Ok(Value::Int(i64::try_from(i).map_err(|_| Fault::overflow())?));
                }
            }
            Err(Fault::value_error(format!(
                "{} is not in list",
                needle.repr(meter)?
            )))
        }
        _ => Err(Fault::type_error(format!("{method}() is unsupported"))),
    }
}

fn list_method(
    interp: &mut Interp,
    list: &Rc<ListObj>,
    method: &'static str,
    mut args: Args,
) -> Flow<Value> {
    let meter = Rc::clone(interp.meter());
    if method == "sort" {
        let key = args.keyword("key").filter(|k| !matches!(k, Value::None));
        let reverse = args.keyword("reverse").is_some_and(|r| r.truthy());
        args.finish()?;
        args.arity(0, 0)?;
        let sorted = sort_values(interp, list.snapshot(), key.as_ref(), reverse)?;
        list.edit(|items| *items = sorted)?;
        return Ok(Value::None);
    }
    args.finish()?;
    match method {
        "append" => {
            args.arity(1, 1)?;
            let value = args.take().pop().unwrap_or(Value::None);
            list.push(value)?;
            Ok(Value::None)
        }
        "extend" => {
            args.arity(1, 1)?;
            let items = interp.collect(&args.take()[0])?;
            meter.ensure(items.len().saturating_mul(SLOT))?;
            list.edit(|v| v.extend(items))?;
            Ok(Value::None)
        }
        "insert" => {
            args.arity(2, 2)?;
            let at = args.int(0)?;
            let value = args.take().pop().unwrap_or(Value::None);
            let len = list.len() as i64;
            let at = if at < 0 { (len + at).max(0) } else { at.min(len) };
            list.edit(|v| v.insert(at as usize, value))?;
            Ok(Value::None)
        }
        "pop" => {
            args.arity(0, 1)?;
            let at = match args.get(0) {
                Some(_) => args.int(0)?,
                None => -1,
            };
            if list.is_empty() {
                return Err(Fault::index_error("pop from empty list"));
            }
            let at = ops::normalize(at, list.len())
                .ok_or_else(|| Fault::index_error("pop index out of range"))?;
            list.edit(|v| v.remove(at))
        }
        "remove" => {
            args.arity(1, 1)?;
            let needle = args.take().pop().unwrap_or(Value::None);
            for (i, item) in list.snapshot().iter().enumerate() {
                meter.tick()?;
                if ops::equals(&meter, item, &needle)? {
                    if i < list.len() {
                        list.edit(|v| v.remove(i))?;
                    }
                    return Ok(Value::None);
                }
            }
            Err(Fault::value_error("list.remove(x): x not in list"))
        }
        "index" | "count" => seq_method(&meter, &list.snapshot(), method, args),
        "reverse" => {
            args.arity(0, 0)?;
            list.edit(|v| v.reverse())?;
            Ok(Value::None)
        }
        "copy" => {
            args.arity(0, 0)?;
            Value::list(&meter, list.snapshot())
        }
        "clear" => {
            args.arity(0, 0)?;
            let old = list.edit(std::mem::take)?;
            drop(old);
            Ok(Value::None)
        }
        _ => Err(Fault::type_error(format!("list.{method}() is unsupported"))),
    }
}

fn dict_method(
    meter: &Rc<Meter>,
    dict: &Rc<DictObj>,
    method: &'static str,
    mut args: Args,
) -> Flow<Value> {
    match method {
        "get" => {
            args.arity(1, 2)?;
            let mut taken = args.take();
            let default = if taken.len() == 2 {
                taken.pop().unwrap_or(Value::None)
            } else {
                Value::None
            };
            Ok(dict.lookup(&taken[0].hash_key()?).unwrap_or(default))
        }
        "keys" | "values" | "items" => {
            args.arity(0, 0)?;
            let snapshot = dict.snapshot();
            meter.ensure(snapshot.len().saturating_mul(SLOT))?;
            let items = snapshot
                .entries()
                .iter()
                .map(|(k, v)| match method {
                    "keys" => Ok(k.clone()),
                    "values" => Ok(v.clone()),
                    _ => Value::tuple(meter, vec![k.clone(), v.clone()]),
                })
                .collect::<Flow<Vec<_>>>()?;
            Value::list(meter, items)
        }
        "update" => {
            args.arity(1, 1)?;
            match &args.take()[0] {
                Value::Dict(other) => {
                    for (k, v) in other.snapshot().entries() {
                        meter.tick()?;
                        dict.insert(k.clone(), v.clone())?;
                    }
                    Ok(Value::None)
                }
                other => Err(Fault::type_error(format!(
                    "'{}' object is not a mapping",
                    other.type_name()
                ))),
            }
        }
        "setdefault" => {
            args.arity(1, 2)?;
            let mut taken = args.take();
            let default = if taken.len() == 2 {
                taken.pop().unwrap_or(Value::None)
            } else {
                Value::None
            };
            let key = taken.pop().unwrap_or(Value::None);
            if let Some(existing) = dict.lookup(&key.hash_key()?) {
                return Ok(existing);
            }
            dict.insert(key, default.clone())?;
            Ok(default)
        }
        "pop" => {
            args.arity(1, 2)?;
            let mut taken = args.take();
            let default = (taken.len() == 2).then(|| taken.pop()).flatten();
            let key = taken.pop().unwrap_or(Value::None);
            match (dict.remove(&key.hash_key()?)?, default) {
                (Some((_, value)), _) => Ok(value),
                (None, Some(default)) => Ok(default),
                (None, None) => Err(ops::key_error(meter, &key)),
            }
        }
        "copy" => {
            args.arity(0, 0)?;
            Value::dict(meter, dict.snapshot())
        }
        "clear" => {
            args.arity(0, 0)?;
            dict.clear()?;
            Ok(Value::None)
        }
        _ => Err(Fault::type_error(format!("dict.{method}() is unsupported"))),
    }
}
