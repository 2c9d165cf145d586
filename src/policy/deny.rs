//! Deny-list walk over the raw syntax tree.
//!
//! Runs over every CST node, including those inside constructs the lowering
//! would reject anyway, so the report names each forbidden reference.

use tree_sitter::Node;

use super::violation::{Violation, ViolationKind};
use crate::lang::{for_each_node, node_text};

/// Names that reach the file system, the process table, the network or the
/// interpreter's host. Referencing them at all is a violation, so aliasing
/// (`f = open`) is caught as well as calling.
pub const HOST_NAMES: &[&str] = &[
    "open",
    "input",
    "exit",
    "quit",
    "help",
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "pathlib",
    "io",
    "builtins",
    "importlib",
    "ctypes",
    "signal",
    "threading",
    "multiprocessing",
    "urllib",
    "requests",
];

/// Dynamic-evaluation and reflection builtins.
pub const DYNAMIC_EVAL_NAMES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
    "dir",
    "breakpoint",
    "memoryview",
    "__builtins__",
];

/// Attribute names belonging to OS, file, process and socket APIs.
pub const HOST_ATTRIBUTES: &[&str] = &[
    "system",
    "popen",
    "fork",
    "kill",
    "open",
    "unlink",
    "rmdir",
    "mkdir",
    "makedirs",
    "chmod",
    "chown",
    "rename",
    "listdir",
    "walk",
    "socket",
    "connect",
    "bind",
    "listen",
    "accept",
    "urlopen",
    "getenv",
    "environ",
    "putenv",
    "delete",
    "call",
    "run",
    "check_call",
    "check_output",
    "_exit",
    "modules",
    "path",
];

const HOST_ATTRIBUTE_PREFIXES: &[&str] = &["spawn", "exec", "read", "write", "send", "recv"];

/// Methods the sandbox implements on strings, lists and dicts. Any other
/// attribute is unreachable at run time and rejected up front.
pub const ALLOWED_METHODS: &[&str] = &[
    // str
    "upper",
    "lower",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "join",
    "replace",
    "startswith",
    "endswith",
    "find",
    "count",
    "title",
    "capitalize",
    "isdigit",
    "isalpha",
    "isalnum",
    "isspace",
    "isupper",
    "islower",
    "zfill",
    // list
    "append",
    "extend",
    "insert",
    "pop",
    "remove",
    "index",
    "sort",
    "reverse",
    "copy",
    "clear",
    // dict
    "get",
    "keys",
    "values",
    "items",
    "update",
    "setdefault",
];

/// Walk every node of `root` and report deny-list matches.
pub fn scan(root: Node<'_>, source: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    for_each_node(root, |node| match node.kind() {
        "import_statement" | "import_from_statement" | "future_import_statement" => {
            violations.push(Violation::at(
                ViolationKind::Import,
                node,
                source,
                format!(
                    "import not allowed: `{}`",
                    node_text(node, source).lines().next().unwrap_or_default()
                ),
            ));
        }
        "identifier" if is_reference(node) => {
            if let Some((kind, message)) = classify_name(node_text(node, source)) {
                violations.push(Violation::at(kind, node, source, message));
            }
        }
        "attribute" => {
            if let Some(attr) = node.child_by_field_name("attribute") {
                if let Some((kind, message)) = classify_attribute(node_text(attr, source)) {
                    violations.push(Violation::at(kind, attr, source, message));
                }
            }
        }
        _ => {}
    });
    violations
}

/// Identifiers that name a value, as opposed to attribute names, keyword
/// argument names and the module paths of import statements.
fn is_reference(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return true;
    };
    let is_field = |field: &str| parent.child_by_field_name(field).map(|n| n.id()) == Some(node.id());
    match parent.kind() {
        "dotted_name" | "aliased_import" => false,
        "attribute" => !is_field("attribute"),
        "keyword_argument" => !is_field("name"),
        _ => true,
    }
}

pub fn classify_name(name: &str) -> Option<(ViolationKind, String)> {
    if HOST_NAMES.contains(&name) {
        return Some((
            ViolationKind::HostAccess,
            format!("`{name}` reaches the host (file system, process or network)"),
        ));
    }
    if DYNAMIC_EVAL_NAMES.contains(&name) {
        return Some((
            ViolationKind::DynamicEval,
            format!("dynamic evaluation builtin `{name}` is not allowed"),
        ));
    }
    if name.starts_with("__") {
        return Some((
            ViolationKind::DynamicEval,
            format!("dunder name `{name}` is not allowed"),
        ));
    }
    None
}

pub fn classify_attribute(name: &str) -> Option<(ViolationKind, String)> {
    if name.starts_with('_') && name != "_exit" {
        return Some((
            ViolationKind::ForbiddenAttribute,
            format!("private or dunder attribute `{name}` is not allowed"),
        ));
    }
    let host = HOST_ATTRIBUTES.contains(&name)
        || HOST_ATTRIBUTE_PREFIXES.iter().any(|p| name.starts_with(p));
    if host {
        return Some((
            ViolationKind::HostAccess,
            format!("attribute `{name}` reaches the host (file system, process or network)"),
        ));
    }
    if !ALLOWED_METHODS.contains(&name) {
        return Some((
            ViolationKind::ForbiddenAttribute,
            format!("attribute `{name}` is not an allowed value method"),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse;

    fn scan_source(source: &str) -> Vec<Violation> {
        let tree = parse(source).unwrap();
        scan(tree.root_node(), source)
    }

    #[test]
    fn import_forms_are_reported_once_each() {
        let v = scan_source("import os\nfrom sys import path as p\nimport a.b as c\n");
        assert_eq!(v.len(), 3, "{v:?}");
        assert!(v.iter().all(|v| v.kind == ViolationKind::Import));
        assert!(v.iter().all(|v| v.message.contains("import")));
    }

    #[test]
    fn aliasing_a_host_primitive_is_caught() {
        let v = scan_source("f = open\n");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ViolationKind::HostAccess);
        assert_eq!(v[0].construct, "open");
    }

    #[test]
    fn dynamic_eval_builtins_are_caught() {
        let v = scan_source("x = eval('1')\ny = getattr(x, 'y')\n");
        let kinds: Vec<_> = v.iter().map(|v| v.kind).collect();
        assert_eq!(kinds, vec![ViolationKind::DynamicEval, ViolationKind::DynamicEval]);
    }

    #[test]
    fn host_attribute_chain_is_caught() {
        let v = scan_source("x = p.system('ls')\n");
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].kind, ViolationKind::HostAccess);
        assert_eq!(v[0].construct, "system");
    }

    #[test]
    fn dunder_attribute_is_caught() {
        let v = scan_source("x = p.__class__\n");
        assert_eq!(v[0].kind, ViolationKind::ForbiddenAttribute);
    }

    #[test]
    fn unknown_attribute_is_caught() {
        let v = scan_source("x = p.frobnicate()\n");
        assert_eq!(v[0].kind, ViolationKind::ForbiddenAttribute);
    }

    #[test]
    fn allowed_methods_and_keyword_names_pass() {
        let v = scan_source("x = p.get('a', 0)\ny = sorted(x, reverse=True)\nz = s.upper().strip()\n");
        assert!(v.is_empty(), "{v:?}");
    }

    #[test]
    fn keyword_argument_named_like_host_name_is_not_a_reference() {
        let v = scan_source("x = f(open=1)\n");
        assert!(v.is_empty(), "{v:?}");
    }

    #[test]
    fn method_allow_list_has_no_host_attributes() {
        for method in ALLOWED_METHODS {
            assert!(classify_attribute(method).is_none(), "{method} should be allowed");
        }
    }
}
