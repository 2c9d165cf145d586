//! Checking and converting call parameters against a declared schema.

use serde_json::{Map, Number, Value};

use crate::config::UnknownParameters;
use crate::registry::types::{ParameterSchema, ParameterType};

/// Check `parameters` against `schema`, converting declared values to their
/// declared types. On failure every problem is reported, in name order.
pub fn check(
    schema: &ParameterSchema,
    parameters: &Value,
    unknown: UnknownParameters,
) -> Result<Map<String, Value>, Vec<String>> {
    let Value::Object(given) = parameters else {
        return Err(vec![format!(
            "parameters must be a JSON object, got {}",
            json_type(parameters)
        )]);
    };

    let mut problems = Vec::new();
    let mut out = Map::new();
    for (name, spec) in schema.iter() {
        match given.get(name) {
            None if spec.required => {
                problems.push(format!("missing required parameter '{name}'"));
            }
            None => {}
            Some(Value::Null) if spec.required => {
                problems.push(format!("required parameter '{name}' must not be null"));
            }
            Some(Value::Null) => {
                out.insert(name.to_string(), Value::Null);
            }
            Some(value) => match convert(value, spec.kind) {
                Some(converted) => {
                    out.insert(name.to_string(), converted);
                }
                None => problems.push(format!(
                    "parameter '{name}' expects {}, got {}",
                    spec.kind,
                    describe(value)
                )),
            },
        }
    }

    let mut extra: Vec<&String> = given.keys().filter(|k| !schema.contains(k)).collect();
    extra.sort();
    for name in extra {
        match unknown {
            UnknownParameters::Ignore => {
                out.insert(name.clone(), given[name.as_str()].clone());
            }
            UnknownParameters::Reject => problems.push(format!("unknown parameter '{name}'")),
        }
    }

    if problems.is_empty() {
        Ok(out)
    } else {
        Err(problems)
    }
}

/// Convert one value, or `None` when it has no reading as `kind`.
pub fn convert(value: &Value, kind: ParameterType) -> Option<Value> {
    match kind {
        ParameterType::Integer => match value {
            Value::Number(n) => integral(n).map(Value::from),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral_float))
                    .map(Value::from)
            }
            _ => None,
        },
        ParameterType::Float => {
            let f = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }?;
            Number::from_f64(f).map(Value::Number)
        }
        ParameterType::Boolean => match value {
            Value::Bool(b) => Some(Value::Bool(*b)),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Some(Value::Bool(true)),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Some(Value::Bool(false)),
            _ => None,
        },
        ParameterType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
        ParameterType::List => value.is_array().then(|| value.clone()),
        ParameterType::Mapping => value.is_object().then(|| value.clone()),
    }
}

fn integral(n: &Number) -> Option<i64> {
    n.as_i64().or_else(|| n.as_f64().and_then(integral_float))
}

fn integral_float(f: f64) -> Option<i64> {
    let in_range = f >= -(2f64.powi(63)) && f < 2f64.powi(63);
    (f.is_finite() && f.fract() == 0.0 && in_range).then_some(f as i64)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) if s.chars().count() <= 32 => format!("string {s:?}"),
        Value::Number(n) => format!("number {n}"),
        Value::Bool(b) => format!("boolean {b}"),
        other => json_type(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::types::ParameterSpec;
    use serde_json::json;

    fn schema() -> ParameterSchema {
        ParameterSchema::new()
            .with("number", ParameterSpec::required(ParameterType::Integer))
            .with("scale", ParameterSpec::optional(ParameterType::Float))
            .with("verbose", ParameterSpec::optional(ParameterType::Boolean))
    }

    #[test]
    fn converts_declared_values() {
        let out = check(
            &schema(),
            &json!({"number": "42", "scale": "0.5", "verbose": "TRUE"}),
            UnknownParameters::Ignore,
        )
        .unwrap();
        assert_eq!(Value::Object(out), json!({"number": 42, "scale": 0.5, "verbose": true}));
    }

    #[test]
    fn integral_floats_are_integers() {
        assert_eq!(convert(&json!(5.0), ParameterType::Integer), Some(json!(5)));
        assert_eq!(convert(&json!(5.5), ParameterType::Integer), None);
        assert_eq!(convert(&json!("7.0"), ParameterType::Integer), Some(json!(7)));
        assert_eq!(convert(&json!(true), ParameterType::Integer), None);
    }

    #[test]
    fn strings_accept_scalars() {
        assert_eq!(convert(&json!(3), ParameterType::String), Some(json!("3")));
        assert_eq!(convert(&json!(false), ParameterType::String), Some(json!("false")));
        assert_eq!(convert(&json!([1]), ParameterType::String), None);
    }

    #[test]
    fn every_problem_is_reported() {
        let problems = check(
            &schema(),
            &json!({"scale": "fast", "verbose": 3}),
            UnknownParameters::Ignore,
        )
        .unwrap_err();
        assert_eq!(problems.len(), 3);
        assert!(problems[0].contains("missing required parameter 'number'"));
        assert!(problems[1].contains("'scale' expects float"));
        assert!(problems[2].contains("'verbose' expects boolean"));
    }

    #[test]
    fn null_optional_passes_through() {
        let out = check(
            &schema(),
            &json!({"number": 1, "scale": null}),
            UnknownParameters::Ignore,
        )
        .unwrap();
        assert_eq!(out.get("scale"), Some(&Value::Null));
        assert!(check(&schema(), &json!({"number": null}), UnknownParameters::Ignore).is_err());
    }

    #[test]
    fn unknown_parameters_follow_policy() {
        let given = json!({"number": 1, "extra": [1, 2]});
        let out = check(&schema(), &given, UnknownParameters::Ignore).unwrap();
        assert_eq!(out.get("extra"), Some(&json!([1, 2])));
        let problems = check(&schema(), &given, UnknownParameters::Reject).unwrap_err();
        assert_eq!(problems, vec!["unknown parameter 'extra'".to_string()]);
    }

    #[test]
    fn parameters_must_be_an_object() {
        let problems = check(&schema(), &json!([1]), UnknownParameters::Ignore).unwrap_err();
        assert!(problems[0].contains("must be a JSON object"));
    }
}
