//! Policy validator: static inspection of submitted source.
//!
//! A submission is accepted only when it parses, references nothing on the
//! deny lists, lowers completely into the supported subset and defines the
//! `process` entry point. Every violation found is reported, not just the
//! first.

pub mod deny;
pub mod violation;

use tree_sitter::Node;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::lang::{self, for_each_node, lower, named_children, node_text, Program};

pub use violation::{Violation, ViolationKind};

/// Name of the function a submission must define.
pub const ENTRY_POINT: &str = "process";

/// Outcome of validating one submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(Program),
    Rejected(Vec<Violation>),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }

    /// Violations of a rejected submission; empty when accepted.
    pub fn violations(&self) -> &[Violation] {
        match self {
            Verdict::Accepted(_) => &[],
            Verdict::Rejected(v) => v,
        }
    }
}

/// Deterministic, side-effect free source validator.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: PolicyConfig,
}

impl Validator {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn validate(&self, source: &str) -> Verdict {
        if source.len() > self.config.max_source_bytes {
            return Verdict::Rejected(vec![Violation::whole(
                ViolationKind::SourceTooLarge,
                format!(
                    "source is {} bytes, limit is {}",
                    source.len(),
                    self.config.max_source_bytes
                ),
            )]);
        }

        let tree = match lang::parse(source) {
            Ok(tree) => tree,
            Err(e) => {
                return Verdict::Rejected(vec![Violation::whole(
                    ViolationKind::Syntax,
                    e.to_string(),
                )])
            }
        };
        let root = tree.root_node();

        let mut violations = syntax_violations(root, source);
        let syntax_clean = violations.is_empty();
        violations.extend(deny::scan(root, source));

        let mut program = None;
        if syntax_clean {
            let lowering = lower::lower(root, source);
            violations.extend(lowering.violations);
            violations.extend(entry_point_violations(
                root,
                source,
                self.config.allow_helpers,
            ));
            program = Some(lowering.program);
        }

        match program {
            Some(program) if violations.is_empty() => {
                debug!(bytes = source.len(), "submission accepted");
                Verdict::Accepted(program)
            }
            _ => {
                violations.sort_by(|a, b| {
                    (a.line, a.column, a.kind as u8).cmp(&(b.line, b.column, b.kind as u8))
                });
                violations.dedup();
                debug!(
                    bytes = source.len(),
                    violations = violations.len(),
                    "submission rejected"
                );
                Verdict::Rejected(violations)
            }
        }
    }
}

fn syntax_violations(root: Node<'_>, source: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    if !root.has_error() {
        return violations;
    }
    for_each_node(root, |node| {
        if node.is_error() {
            violations.push(Violation::at(
                ViolationKind::Syntax,
                node,
                source,
                "invalid syntax",
            ));
        } else if node.is_missing() {
            violations.push(Violation::at(
                ViolationKind::Syntax,
                node,
                source,
                format!("missing `{}`", node.kind()),
            ));
        }
    });
    if violations.is_empty() {
        violations.push(Violation::whole(ViolationKind::Syntax, "invalid syntax"));
    }
    violations
}

/// Check the module-level shape: one `process(x)` plus, when allowed,
/// helper definitions, assignments and docstrings.
fn entry_point_violations(root: Node<'_>, source: &str, allow_helpers: bool) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut entry_points = Vec::new();

    for stmt in named_children(root) {
        match stmt.kind() {
            "function_definition" => {
                let name = stmt
                    .child_by_field_name("name")
                    .map(|n| node_text(n, source))
                    .unwrap_or_default();
                if name == ENTRY_POINT {
                    entry_points.push(stmt);
                } else if !allow_helpers {
                    violations.push(Violation::at(
                        ViolationKind::EntryPoint,
                        stmt,
                        source,
                        format!("helper function `{name}` is not allowed; only `{ENTRY_POINT}` may be defined"),
                    ));
                }
            }
            "decorated_definition" => {
                let is_entry = stmt
                    .child_by_field_name("definition")
                    .and_then(|d| d.child_by_field_name("name"))
                    .is_some_and(|n| node_text(n, source) == ENTRY_POINT);
                if is_entry {
                    entry_points.push(stmt);
                }
            }
            "expression_statement" => {
                let children = named_children(stmt);
                let docstring = matches!(children.as_slice(), [only] if only.kind() == "string");
                let assignment = matches!(children.as_slice(), [only] if only.kind() == "assignment");
                if docstring || (assignment && allow_helpers) {
                    continue;
                }
                let message = if assignment {
                    "top-level assignments are not allowed when helpers are disabled".to_string()
                } else {
                    "top-level expressions are not allowed; code runs only inside functions".to_string()
                };
                violations.push(Violation::at(ViolationKind::EntryPoint, stmt, source, message));
            }
            // reported by the deny-list walk
            "import_statement" | "import_from_statement" | "future_import_statement" => {}
            other => {
                let allowed = if allow_helpers {
                    "function definitions and assignments".to_string()
                } else {
                    format!("the `{ENTRY_POINT}` definition")
                };
                violations.push(Violation::at(
                    ViolationKind::EntryPoint,
                    stmt,
                    source,
                    format!("top-level `{other}` is not allowed; only {allowed} may appear at module level"),
                ));
            }
        }
    }

    let Some((first, extra)) = entry_points.split_first() else {
        violations.push(Violation::whole(
            ViolationKind::EntryPoint,
            format!("missing entry point: define `def {ENTRY_POINT}(parameters):` at top level"),
        ));
        return violations;
    };
    for dup in extra {
        violations.push(Violation::at(
            ViolationKind::EntryPoint,
            *dup,
            source,
            format!("`{ENTRY_POINT}` is defined more than once"),
        ));
    }
    if first.kind() == "function_definition" {
        let params = first
            .child_by_field_name("parameters")
            .map(named_children)
            .unwrap_or_default();
        let single_positional = matches!(
            params.as_slice(),
            [p] if matches!(p.kind(), "identifier" | "typed_parameter")
        );
        if !single_positional {
            violations.push(Violation::at(
                ViolationKind::EntryPoint,
                *first,
                source,
                format!("`{ENTRY_POINT}` must take exactly one positional parameter"),
            ));
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(source: &str) -> Verdict {
        Validator::default().validate(source)
    }

    fn kinds(verdict: &Verdict) -> Vec<ViolationKind> {
        verdict.violations().iter().map(|v| v.kind).collect()
    }

    #[test]
    fn accepts_square() {
        let verdict = validate("def process(parameters):\n    return parameters['n'] ** 2\n");
        assert!(verdict.is_accepted(), "{:?}", verdict.violations());
    }

    #[test]
    fn rejects_import_with_message() {
        let verdict =
            validate("import os\n\ndef process(parameters):\n    return os.listdir('.')\n");
        assert!(!verdict.is_accepted());
        let v = verdict.violations();
        assert_eq!(v[0].kind, ViolationKind::Import);
        assert!(v[0].message.contains("import"));
        assert_eq!(v[0].line, 1);
        assert!(kinds(&verdict).contains(&ViolationKind::HostAccess));
    }

    #[test]
    fn rejects_missing_entry_point() {
        let verdict = validate("def helper(x):\n    return x\n");
        assert_eq!(kinds(&verdict), vec![ViolationKind::EntryPoint]);
        assert!(verdict.violations()[0].message.contains("process"));
    }

    #[test]
    fn rejects_empty_source() {
        assert_eq!(kinds(&validate("")), vec![ViolationKind::EntryPoint]);
    }

    #[test]
    fn rejects_wrong_arity() {
        let verdict = validate("def process(a, b):\n    return a\n");
        assert_eq!(kinds(&verdict), vec![ViolationKind::EntryPoint]);
    }

    #[test]
    fn rejects_duplicate_entry_point() {
        let verdict = validate("def process(a):\n    return 1\n\ndef process(b):\n    return 2\n");
        assert_eq!(kinds(&verdict), vec![ViolationKind::EntryPoint]);
        assert_eq!(verdict.violations()[0].line, 4);
    }

    #[test]
    fn helpers_allowed_by_default() {
        let source = "\"\"\"Doubles.\"\"\"\nFACTOR = 2\n\ndef double(x):\n    return x * FACTOR\n\ndef process(p):\n    return double(p['n'])\n";
        assert!(validate(source).is_accepted());

        let strict = Validator::new(PolicyConfig {
            allow_helpers: false,
            ..PolicyConfig::default()
        });
        let verdict = strict.validate(source);
        assert_eq!(
            kinds(&verdict),
            vec![ViolationKind::EntryPoint, ViolationKind::EntryPoint]
        );
    }

    #[test]
    fn rejects_top_level_code() {
        let verdict = validate("def process(p):\n    return 1\n\nprocess(1)\n");
        assert_eq!(kinds(&verdict), vec![ViolationKind::EntryPoint]);
    }

    #[test]
    fn syntax_errors_skip_later_checks() {
        let verdict = validate("def process(p:\n    return\n");
        assert!(!verdict.is_accepted());
        assert!(kinds(&verdict).iter().all(|k| *k == ViolationKind::Syntax));
    }

    #[test]
    fn oversized_source_is_rejected_outright() {
        let validator = Validator::new(PolicyConfig {
            max_source_bytes: 16,
            ..PolicyConfig::default()
        });
        let verdict = validator.validate("def process(p):\n    return 1\n");
        assert_eq!(kinds(&verdict), vec![ViolationKind::SourceTooLarge]);
    }

    #[test]
    fn violations_are_sorted_by_position() {
        let verdict = validate("def process(p):\n    x = eval('1')\n    f = open\n    return exec\n");
        let lines: Vec<usize> = verdict.violations().iter().map(|v| v.line).collect();
        assert_eq!(lines, vec![2, 3, 4]);
    }

    #[test]
    fn validation_is_idempotent() {
        let source = "import sys\ndef process(p):\n    class A: pass\n    return sys.argv\n";
        assert_eq!(validate(source), validate(source));
    }
}
