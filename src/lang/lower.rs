//! Lowering from the tree-sitter CST into `ast`.
//!
//! The lowering is total: constructs outside the accepted subset are
//! recorded as `Unsupported` violations and replaced by a placeholder, so a
//! single pass reports every problem in the submission.

use std::collections::HashSet;
use std::sync::Arc;

use tree_sitter::Node;

use super::ast::{
    BinOp, BoolOp, Clause, CmpOp, Expr, FPart, FormatSpec, FunctionDef, Literal, Program, Stmt,
    StmtKind, Target, UnaryOp,
};
use super::{all_children, named_children, node_text};
use crate::policy::violation::{Violation, ViolationKind};

/// Deepest statement/expression nesting accepted.
pub const MAX_NESTING: usize = 100;

/// Result of lowering a module.
#[derive(Debug)]
pub struct Lowering {
    pub program: Program,
    pub violations: Vec<Violation>,
}

/// Lower a parsed module. `root` must be the `module` node of `source`.
pub fn lower(root: Node<'_>, source: &str) -> Lowering {
    let mut lowerer = Lowerer {
        source,
        violations: Vec::new(),
        depth: 0,
        too_deep: false,
    };
    let body = lowerer.block_children(root);
    Lowering {
        program: Program { body },
        violations: lowerer.violations,
    }
}

struct Lowerer<'s> {
    source: &'s str,
    violations: Vec<Violation>,
    depth: usize,
    too_deep: bool,
}

fn placeholder() -> Expr {
    Expr::Literal(Literal::None)
}

fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

fn has_token(node: Node<'_>, token: &str) -> bool {
    all_children(node)
        .iter()
        .any(|c| !c.is_named() && c.kind() == token)
}

fn field_children<'t>(node: Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children_by_field_name(field, &mut cursor).collect()
}

impl<'s> Lowerer<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        node_text(node, self.source)
    }

    fn unsupported(&mut self, node: Node<'_>, what: &str) {
        self.violations.push(Violation::at(
            ViolationKind::Unsupported,
            node,
            self.source,
            format!("{what} is not supported"),
        ));
    }

    fn enter(&mut self, node: Node<'_>) -> bool {
        self.depth += 1;
        if self.depth <= MAX_NESTING {
            return true;
        }
        if !self.too_deep {
            self.too_deep = true;
            self.violations.push(Violation::at(
                ViolationKind::NestingTooDeep,
                node,
                self.source,
                format!("nesting deeper than {MAX_NESTING} levels"),
            ));
        }
        false
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // ── statements ──────────────────────────────────────────────────

    fn block(&mut self, node: Option<Node<'_>>) -> Vec<Stmt> {
        match node {
            Some(node) => self.block_children(node),
            None => Vec::new(),
        }
    }

    fn block_children(&mut self, node: Node<'_>) -> Vec<Stmt> {
        let mut out = Vec::new();
        if self.enter(node) {
            for child in named_children(node) {
                if let Some(stmt) = self.stmt(child) {
                    out.push(stmt);
                }
            }
        }
        self.leave();
        out
    }

    fn stmt(&mut self, node: Node<'_>) -> Option<Stmt> {
        let kind = match node.kind() {
            "expression_statement" => self.expression_statement(node)?,
            "return_statement" => {
                StmtKind::Return(named_children(node).first().map(|n| self.expr(*n)))
            }
            "pass_statement" => StmtKind::Pass,
            "break_statement" => StmtKind::Break,
            "continue_statement" => StmtKind::Continue,
            "if_statement" => self.if_statement(node),
            "while_statement" => self.while_statement(node),
            "for_statement" => self.for_statement(node)?,
            "function_definition" => StmtKind::FunctionDef(Arc::new(self.function_def(node)?)),
            "delete_statement" => self.delete_statement(node),
            "raise_statement" => self.raise_statement(node),
            "assert_statement" => self.assert_statement(node)?,
            // reported by the deny-list walk
            "import_statement" | "import_from_statement" | "future_import_statement" | "ERROR" => {
                return None
            }
            "class_definition" => return self.unsupported_stmt(node, "class definition"),
            "decorated_definition" => return self.unsupported_stmt(node, "decorator"),
            "try_statement" => return self.unsupported_stmt(node, "try statement"),
            "with_statement" => return self.unsupported_stmt(node, "with statement"),
            "global_statement" => return self.unsupported_stmt(node, "global declaration"),
            "nonlocal_statement" => return self.unsupported_stmt(node, "nonlocal declaration"),
            "match_statement" => return self.unsupported_stmt(node, "match statement"),
            other => return self.unsupported_stmt(node, &format!("`{other}`")),
        };
        Some(Stmt {
            line: line_of(node),
            kind,
        })
    }

    fn unsupported_stmt(&mut self, node: Node<'_>, what: &str) -> Option<Stmt> {
        self.unsupported(node, what);
        None
    }

    fn expression_statement(&mut self, node: Node<'_>) -> Option<StmtKind> {
        let children = named_children(node);
        match children.as_slice() {
            [single] if single.kind() == "assignment" => self.assignment(*single),
            [single] if single.kind() == "augmented_assignment" => self.aug_assignment(*single),
            [single] => Some(StmtKind::Expr(self.expr(*single))),
            many => Some(StmtKind::Expr(Expr::Tuple(
                many.iter().map(|n| self.expr(*n)).collect(),
            ))),
        }
    }

    fn assignment(&mut self, node: Node<'_>) -> Option<StmtKind> {
        let mut targets = Vec::new();
        let mut current = node;
        loop {
            let left = current.child_by_field_name("left")?;
            targets.push(self.target(left));
            match current.child_by_field_name("right") {
                Some(right) if right.kind() == "assignment" => current = right,
                Some(right) => {
                    let value = self.expr(right);
                    return Some(StmtKind::Assign { targets, value });
                }
                // bare annotation: `x: int`
                None => return Some(StmtKind::Pass),
            }
        }
    }

    fn aug_assignment(&mut self, node: Node<'_>) -> Option<StmtKind> {
        let left = node.child_by_field_name("left")?;
        let right = node.child_by_field_name("right")?;
        let op_node = node.child_by_field_name("operator")?;
        let symbol = self.text(op_node);
        let Some(op) = BinOp::from_symbol(symbol.trim_end_matches('=')) else {
            self.unsupported(op_node, &format!("`{symbol}` operator"));
            return None;
        };
        let target = self.target(left);
        if matches!(target, Target::Unpack(_)) {
            self.unsupported(left, "augmented assignment to several targets");
            return None;
        }
        let value = self.expr(right);
        Some(StmtKind::AugAssign { target, op, value })
    }

    fn if_statement(&mut self, node: Node<'_>) -> StmtKind {
        let test = self.expr_field(node, "condition");
        let body = self.block(node.child_by_field_name("consequence"));
        let mut branches = vec![(test, body)];
        let mut orelse = Vec::new();
        for alt in field_children(node, "alternative") {
            match alt.kind() {
                "elif_clause" => {
                    let test = self.expr_field(alt, "condition");
                    let body = self.block(alt.child_by_field_name("consequence"));
                    branches.push((test, body));
                }
                "else_clause" => orelse = self.block(alt.child_by_field_name("body")),
                _ => {}
            }
        }
        StmtKind::If { branches, orelse }
    }

    fn while_statement(&mut self, node: Node<'_>) -> StmtKind {
        if let Some(alt) = node.child_by_field_name("alternative") {
            self.unsupported(alt, "`else` on a loop");
        }
        let test = self.expr_field(node, "condition");
        let body = self.block(node.child_by_field_name("body"));
        StmtKind::While { test, body }
    }

    fn for_statement(&mut self, node: Node<'_>) -> Option<StmtKind> {
        if has_token(node, "async") {
            self.unsupported(node, "async for");
            return None;
        }
        if let Some(alt) = node.child_by_field_name("alternative") {
            self.unsupported(alt, "`else` on a loop");
        }
        let target = self.target(node.child_by_field_name("left")?);
        let iter = self.expr_field(node, "right");
        let body = self.block(node.child_by_field_name("body"));
        Some(StmtKind::For { target, iter, body })
    }

    fn function_def(&mut self, node: Node<'_>) -> Option<FunctionDef> {
        if has_token(node, "async") {
            self.unsupported(node, "async function");
            return None;
        }
        let name = self.text(node.child_by_field_name("name")?).to_string();
        let params = self.parameters(node.child_by_field_name("parameters"));
        let body = self.block(node.child_by_field_name("body"));
        Some(FunctionDef {
            name,
            params,
            body,
            line: line_of(node),
        })
    }

    fn parameters(&mut self, node: Option<Node<'_>>) -> Vec<String> {
        let Some(node) = node else {
            return Vec::new();
        };
        let mut params = Vec::new();
        let mut seen = HashSet::new();
        for param in named_children(node) {
            let ident = match param.kind() {
                "identifier" => Some(param),
                "typed_parameter" => named_children(param)
                    .into_iter()
                    .next()
                    .filter(|n| n.kind() == "identifier"),
                "default_parameter" | "typed_default_parameter" => {
                    self.unsupported(param, "default parameter value");
                    continue;
                }
                _ => None,
            };
            let Some(ident) = ident else {
                self.unsupported(param, "star, separator or pattern parameter");
                continue;
            };
            let name = self.text(ident).to_string();
            if !seen.insert(name.clone()) {
                self.violations.push(Violation::at(
                    ViolationKind::Syntax,
                    ident,
                    self.source,
                    format!("duplicate parameter `{name}`"),
                ));
            }
            params.push(name);
        }
        params
    }

    fn delete_statement(&mut self, node: Node<'_>) -> StmtKind {
        let targets = match named_children(node).first() {
            Some(list) if list.kind() == "expression_list" => named_children(*list)
                .into_iter()
                .map(|n| self.target(n))
                .collect(),
            Some(single) => vec![self.target(*single)],
            None => Vec::new(),
        };
        StmtKind::Delete(targets)
    }

    fn raise_statement(&mut self, node: Node<'_>) -> StmtKind {
        let cause = node.child_by_field_name("cause");
        if let Some(cause) = cause {
            self.unsupported(cause, "`raise ... from`");
        }
        let exc = named_children(node)
            .into_iter()
            .find(|n| Some(n.id()) != cause.map(|c| c.id()));
        StmtKind::Raise(exc.map(|n| self.expr(n)))
    }

    fn assert_statement(&mut self, node: Node<'_>) -> Option<StmtKind> {
        let children = named_children(node);
        let test = self.expr(*children.first()?);
        let message = children.get(1).map(|n| self.expr(*n));
        Some(StmtKind::Assert { test, message })
    }

    fn target(&mut self, node: Node<'_>) -> Target {
        match node.kind() {
            "identifier" => Target::Name(self.text(node).to_string()),
            "subscript" => {
                let value = self.expr_field(node, "value");
                let subs = field_children(node, "subscript");
                if subs.iter().any(|s| s.kind() == "slice") {
                    self.unsupported(node, "slice assignment");
                }
                let index = self.subscript_index(&subs);
                Target::Subscript {
                    value: Box::new(value),
                    index: Box::new(index),
                }
            }
            "pattern_list" | "tuple_pattern" | "list_pattern" | "tuple" | "list"
            | "expression_list" => Target::Unpack(
                named_children(node)
                    .into_iter()
                    .map(|n| self.target(n))
                    .collect(),
            ),
            "parenthesized_expression" => match named_children(node).as_slice() {
                [inner] => self.target(*inner),
                _ => Target::Unpack(Vec::new()),
            },
            "attribute" => {
                self.unsupported(node, "attribute assignment");
                Target::Unpack(Vec::new())
            }
            "list_splat_pattern" | "list_splat" => {
                self.unsupported(node, "starred target");
                Target::Unpack(Vec::new())
            }
            "ERROR" => Target::Unpack(Vec::new()),
            other => {
                self.unsupported(node, &format!("`{other}` as an assignment target"));
                Target::Unpack(Vec::new())
            }
        }
    }

    // ── expressions ─────────────────────────────────────────────────

    fn expr_field(&mut self, node: Node<'_>, field: &str) -> Expr {
        match node.child_by_field_name(field) {
            Some(child) => self.expr(child),
            None => placeholder(),
        }
    }

    fn exprs(&mut self, nodes: Vec<Node<'_>>) -> Vec<Expr> {
        nodes.into_iter().map(|n| self.expr(n)).collect()
    }

    fn expr(&mut self, node: Node<'_>) -> Expr {
        let expr = if self.enter(node) {
            self.expr_inner(node)
        } else {
            placeholder()
        };
        self.leave();
        expr
    }

    fn expr_inner(&mut self, node: Node<'_>) -> Expr {
        match node.kind() {
            "identifier" => Expr::Name(self.text(node).to_string()),
            "integer" => self.integer(node),
            "float" => self.float(node),
            "true" => Expr::Literal(Literal::Bool(true)),
            "false" => Expr::Literal(Literal::Bool(false)),
            "none" => Expr::Literal(Literal::None),
            "string" => self.string(node),
            "concatenated_string" => self.concatenated_string(node),
            "parenthesized_expression" => match named_children(node).as_slice() {
                [inner] => self.expr(*inner),
                _ => placeholder(),
            },
            "tuple" | "expression_list" => Expr::Tuple(self.exprs(named_children(node))),
            "list" => Expr::List(self.exprs(named_children(node))),
            "dictionary" => self.dictionary(node),
            "unary_operator" => self.unary(node),
            "not_operator" => Expr::Not(Box::new(self.expr_field(node, "argument"))),
            "binary_operator" => self.binary(node),
            "boolean_operator" => self.boolean(node),
            "comparison_operator" => self.comparison(node),
            "conditional_expression" => match named_children(node).as_slice() {
                [body, test, orelse] => Expr::IfElse {
                    body: Box::new(self.expr(*body)),
                    test: Box::new(self.expr(*test)),
                    orelse: Box::new(self.expr(*orelse)),
                },
                _ => placeholder(),
            },
            "call" => self.call(node),
            "subscript" => {
                let value = self.expr_field(node, "value");
                let subs = field_children(node, "subscript");
                let index = self.subscript_index(&subs);
                Expr::Subscript(Box::new(value), Box::new(index))
            }
            "slice" => self.slice(node),
            "lambda" => self.lambda(node),
            "list_comprehension" | "generator_expression" => {
                let element = self.expr_field(node, "body");
                let clauses = self.clauses(node);
                Expr::ListComp {
                    element: Box::new(element),
                    clauses,
                }
            }
            "dictionary_comprehension" => {
                let Some(pair) = node.child_by_field_name("body") else {
                    return placeholder();
                };
                let key = self.expr_field(pair, "key");
                let value = self.expr_field(pair, "value");
                let clauses = self.clauses(node);
                Expr::DictComp {
                    key: Box::new(key),
                    value: Box::new(value),
                    clauses,
                }
            }
            "ERROR" => placeholder(),
            "attribute" => self.unsupported_expr(node, "attribute access outside a method call"),
            "set" | "set_comprehension" => self.unsupported_expr(node, "set"),
            "list_splat" | "dictionary_splat" | "parenthesized_list_splat" => {
                self.unsupported_expr(node, "unpacking")
            }
            "named_expression" => self.unsupported_expr(node, "assignment expression (`:=`)"),
            "yield" => self.unsupported_expr(node, "yield"),
            "await" => self.unsupported_expr(node, "await"),
            "ellipsis" => self.unsupported_expr(node, "ellipsis"),
            other => self.unsupported_expr(node, &format!("`{other}` expression")),
        }
    }

    fn unsupported_expr(&mut self, node: Node<'_>, what: &str) -> Expr {
        self.unsupported(node, what);
        placeholder()
    }

    fn integer(&mut self, node: Node<'_>) -> Expr {
        let text = self.text(node).replace('_', "").to_ascii_lowercase();
        if text.ends_with('j') {
            return self.unsupported_expr(node, "complex number");
        }
        let parsed = if let Some(hex) = text.strip_prefix("0x") {
            i64::from_str_radix(hex, 16)
        } else if let Some(oct) = text.strip_prefix("0o") {
            i64::from_str_radix(oct, 8)
        } else if let Some(bin) = text.strip_prefix("0b") {
            i64::from_str_radix(bin, 2)
        } else {
            text.parse::<i64>()
        };
        match parsed {
            Ok(value) => Expr::Literal(Literal::Int(value)),
            Err(_) => self.unsupported_expr(node, "integer literal outside the 64-bit range"),
        }
    }

    fn float(&mut self, node: Node<'_>) -> Expr {
        let text = self.text(node).replace('_', "").to_ascii_lowercase();
        if text.ends_with('j') {
            return self.unsupported_expr(node, "complex number");
        }
        match text.parse::<f64>() {
            Ok(value) => Expr::Literal(Literal::Float(value)),
            Err(_) => self.unsupported_expr(node, "float literal"),
        }
    }

    fn string(&mut self, node: Node<'_>) -> Expr {
        let mut parts = Vec::new();
        let mut formatted = false;
        let mut raw = false;
        for child in all_children(node) {
            match child.kind() {
                "string_start" => {
                    let prefix = self
                        .text(child)
                        .trim_end_matches(['"', '\''])
                        .to_ascii_lowercase();
                    if prefix.contains('b') {
                        return self.unsupported_expr(node, "bytes literal");
                    }
                    formatted = prefix.contains('f');
                    raw = prefix.contains('r');
                }
                "string_content" => {
                    let text = self.text(child);
                    let mut text = if raw { text.to_string() } else { unescape(text) };
                    if formatted {
                        text = text.replace("{{", "{").replace("}}", "}");
                    }
                    push_text(&mut parts, text);
                }
                "interpolation" => {
                    let part = self.interpolation(child);
                    parts.push(part);
                }
                _ => {}
            }
        }
        if formatted {
            Expr::FString(parts)
        } else {
            Expr::Literal(Literal::Str(join_text(parts)))
        }
    }

    fn interpolation(&mut self, node: Node<'_>) -> FPart {
        let expr = self.expr_field(node, "expression");
        if node.child_by_field_name("type_conversion").is_some() {
            self.unsupported(node, "f-string conversion (`!r`, `!s`)");
        }
        if has_token(node, "=") {
            self.unsupported(node, "self-documenting f-string field");
        }
        let spec = match node.child_by_field_name("format_specifier") {
            Some(spec_node) => self.format_spec(spec_node),
            None => FormatSpec::Plain,
        };
        FPart::Value { expr, spec }
    }

    fn format_spec(&mut self, node: Node<'_>) -> FormatSpec {
        let spec = self.text(node).trim_start_matches(':');
        if spec.is_empty() {
            return FormatSpec::Plain;
        }
        if spec == "d" {
            return FormatSpec::Integer;
        }
        let precision = spec
            .strip_prefix('.')
            .and_then(|s| s.strip_suffix('f'))
            .and_then(|digits| digits.parse::<u8>().ok())
            .filter(|p| *p <= 20);
        match precision {
            Some(p) => FormatSpec::Fixed(p),
            None => {
                self.unsupported(node, &format!("format specifier `{spec}`"));
                FormatSpec::Plain
            }
        }
    }

    fn concatenated_string(&mut self, node: Node<'_>) -> Expr {
        let mut parts = Vec::new();
        let mut formatted = false;
        for child in named_children(node) {
            match self.expr(child) {
                Expr::Literal(Literal::Str(text)) => push_text(&mut parts, text),
                Expr::FString(inner) => {
                    formatted = true;
                    for part in inner {
                        match part {
                            FPart::Text(text) => push_text(&mut parts, text),
                            value => parts.push(value),
                        }
                    }
                }
                _ => {}
            }
        }
        if formatted {
            Expr::FString(parts)
        } else {
            Expr::Literal(Literal::Str(join_text(parts)))
        }
    }

    fn dictionary(&mut self, node: Node<'_>) -> Expr {
        let mut entries = Vec::new();
        for child in named_children(node) {
            if child.kind() == "pair" {
                let key = self.expr_field(child, "key");
                let value = self.expr_field(child, "value");
                entries.push((key, value));
            } else {
                self.unsupported(child, "dictionary unpacking");
            }
        }
        Expr::Dict(entries)
    }

    fn unary(&mut self, node: Node<'_>) -> Expr {
        let operand = self.expr_field(node, "argument");
        let op = match node.child_by_field_name("operator").map(|n| n.kind()) {
            Some("-") => UnaryOp::Neg,
            Some("+") => UnaryOp::Pos,
            Some("~") => UnaryOp::Invert,
            _ => return placeholder(),
        };
        Expr::Unary(op, Box::new(operand))
    }

    fn binary(&mut self, node: Node<'_>) -> Expr {
        let left = self.expr_field(node, "left");
        let right = self.expr_field(node, "right");
        let Some(op_node) = node.child_by_field_name("operator") else {
            return placeholder();
        };
        match BinOp::from_symbol(op_node.kind()) {
            Some(op) => Expr::Binary(Box::new(left), op, Box::new(right)),
            None => self.unsupported_expr(op_node, &format!("`{}` operator", op_node.kind())),
        }
    }

    fn boolean(&mut self, node: Node<'_>) -> Expr {
        let left = self.expr_field(node, "left");
        let right = self.expr_field(node, "right");
        let op = match node.child_by_field_name("operator").map(|n| n.kind()) {
            Some("and") => BoolOp::And,
            Some("or") => BoolOp::Or,
            _ => return placeholder(),
        };
        Expr::Bool(op, Box::new(left), Box::new(right))
    }

    fn comparison(&mut self, node: Node<'_>) -> Expr {
        let mut children = all_children(node).into_iter();
        let Some(first) = children.next() else {
            return placeholder();
        };
        let left = self.expr(first);
        let mut rest = Vec::new();
        let mut pending = None;
        for child in children {
            if child.is_named() {
                if let Some(op) = pending.take() {
                    rest.push((op, self.expr(child)));
                }
            } else {
                pending = CmpOp::from_symbol(child.kind());
                if pending.is_none() {
                    self.unsupported(child, &format!("`{}` comparison", child.kind()));
                }
            }
        }
        Expr::Compare(Box::new(left), rest)
    }

    fn call(&mut self, node: Node<'_>) -> Expr {
        let Some(func) = node.child_by_field_name("function") else {
            return placeholder();
        };
        let (args, kwargs) = match node.child_by_field_name("arguments") {
            Some(gen) if gen.kind() == "generator_expression" => (vec![self.expr(gen)], Vec::new()),
            Some(list) => self.arguments(list),
            None => (Vec::new(), Vec::new()),
        };
        if func.kind() == "attribute" {
            let receiver = self.expr_field(func, "object");
            let name = func
                .child_by_field_name("attribute")
                .map(|n| self.text(n).to_string())
                .unwrap_or_default();
            return Expr::Method {
                receiver: Box::new(receiver),
                name,
                args,
                kwargs,
            };
        }
        Expr::Call {
            func: Box::new(self.expr(func)),
            args,
            kwargs,
        }
    }

    fn arguments(&mut self, node: Node<'_>) -> (Vec<Expr>, Vec<(String, Expr)>) {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        for child in named_children(node) {
            match child.kind() {
                "keyword_argument" => {
                    let name = child
                        .child_by_field_name("name")
                        .map(|n| self.text(n).to_string())
                        .unwrap_or_default();
                    let value = self.expr_field(child, "value");
                    kwargs.push((name, value));
                }
                "list_splat" | "dictionary_splat" | "parenthesized_list_splat" => {
                    self.unsupported(child, "argument unpacking");
                }
                _ => {
                    if !kwargs.is_empty() {
                        self.violations.push(Violation::at(
                            ViolationKind::Syntax,
                            child,
                            self.source,
                            "positional argument follows keyword argument",
                        ));
                    }
                    args.push(self.expr(child));
                }
            }
        }
        (args, kwargs)
    }

    fn subscript_index(&mut self, subs: &[Node<'_>]) -> Expr {
        match subs {
            [single] => self.expr(*single),
            many => Expr::Tuple(many.iter().map(|n| self.expr(*n)).collect()),
        }
    }

    fn slice(&mut self, node: Node<'_>) -> Expr {
        let mut parts: [Option<Box<Expr>>; 3] = [None, None, None];
        let mut slot = 0;
        for child in all_children(node) {
            if !child.is_named() {
                if child.kind() == ":" {
                    slot += 1;
                }
                continue;
            }
            if slot < parts.len() {
                parts[slot] = Some(Box::new(self.expr(child)));
            }
        }
        let [lower, upper, step] = parts;
        Expr::Slice { lower, upper, step }
    }

    fn lambda(&mut self, node: Node<'_>) -> Expr {
        let params = self.parameters(node.child_by_field_name("parameters"));
        let body = self.expr_field(node, "body");
        let line = line_of(node);
        Expr::Lambda(Arc::new(FunctionDef {
            name: "<lambda>".into(),
            params,
            body: vec![Stmt {
                line,
                kind: StmtKind::Return(Some(body)),
            }],
            line,
        }))
    }

    fn clauses(&mut self, node: Node<'_>) -> Vec<Clause> {
        let body_id = node.child_by_field_name("body").map(|n| n.id());
        let mut clauses = Vec::new();
        for child in named_children(node) {
            if Some(child.id()) == body_id {
                continue;
            }
            match child.kind() {
                "for_in_clause" => {
                    if has_token(child, "async") {
                        self.unsupported(child, "async comprehension");
                        continue;
                    }
                    let Some(left) = child.child_by_field_name("left") else {
                        continue;
                    };
                    let target = self.target(left);
                    let rights = field_children(child, "right");
                    let iter = match rights.as_slice() {
                        [single] => self.expr(*single),
                        many => Expr::Tuple(many.iter().map(|n| self.expr(*n)).collect()),
                    };
                    clauses.push(Clause::For { target, iter });
                }
                "if_clause" => {
                    if let Some(test) = named_children(child).first() {
                        let test = self.expr(*test);
                        clauses.push(Clause::If(test));
                    }
                }
                _ => {}
            }
        }
        clauses
    }
}

fn push_text(parts: &mut Vec<FPart>, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(FPart::Text(last)) = parts.last_mut() {
        last.push_str(&text);
    } else {
        parts.push(FPart::Text(text));
    }
}

fn join_text(parts: Vec<FPart>) -> String {
    parts
        .into_iter()
        .filter_map(|p| match p {
            FPart::Text(text) => Some(text),
            FPart::Value { .. } => None,
        })
        .collect()
}

/// Decode backslash escapes of a non-raw string literal body.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('v') => out.push('\x0b'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some('x') => out.push(take_hex(&mut chars, 2)),
            Some('u') => out.push(take_hex(&mut chars, 4)),
            Some('U') => out.push(take_hex(&mut chars, 8)),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn take_hex(chars: &mut std::str::Chars<'_>, digits: usize) -> char {
    let hex: String = chars.by_ref().take(digits).collect();
    u32::from_str_radix(&hex, 16)
        .ok()
        .and_then(char::from_u32)
        .unwrap_or(char::REPLACEMENT_CHARACTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::parse;

    fn lower_source(source: &str) -> Lowering {
        let tree = parse(source).unwrap();
        lower(tree.root_node(), source)
    }

    fn process_body(source: &str) -> Vec<Stmt> {
        let lowered = lower_source(source);
        assert!(lowered.violations.is_empty(), "{:?}", lowered.violations);
        lowered.program.entry_point().unwrap().body.clone()
    }

    #[test]
    fn lowers_square_function() {
        let body = process_body("def process(parameters):\n    return parameters['n'] * parameters['n']\n");
        assert_eq!(body.len(), 1);
        match &body[0].kind {
            StmtKind::Return(Some(Expr::Binary(_, BinOp::Mul, _))) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn lowers_chained_assignment_and_unpacking() {
        let body = process_body("def process(p):\n    a = b = 1\n    x, y = 1, 2\n    return a\n");
        match &body[0].kind {
            StmtKind::Assign { targets, .. } => assert_eq!(targets.len(), 2),
            other => panic!("unexpected: {other:?}"),
        }
        match &body[1].kind {
            StmtKind::Assign { targets, value } => {
                assert!(matches!(&targets[0], Target::Unpack(t) if t.len() == 2));
                assert!(matches!(value, Expr::Tuple(v) if v.len() == 2));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn lowers_chained_comparison() {
        let body = process_body("def process(p):\n    return 1 < 2 <= 3 not in [4]\n");
        match &body[0].kind {
            StmtKind::Return(Some(Expr::Compare(_, rest))) => {
                let ops: Vec<CmpOp> = rest.iter().map(|(op, _)| *op).collect();
                assert_eq!(ops, vec![CmpOp::Lt, CmpOp::Le, CmpOp::NotIn]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn lowers_method_calls_with_keywords() {
        let body = process_body("def process(p):\n    return sorted(p.items(), reverse=True)\n");
        match &body[0].kind {
            StmtKind::Return(Some(Expr::Call { args, kwargs, .. })) => {
                assert!(matches!(&args[0], Expr::Method { name, .. } if name == "items"));
                assert_eq!(kwargs[0].0, "reverse");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn lowers_fstring_with_precision() {
        let body = process_body("def process(p):\n    return f\"total {{x}}: {p['x']:.2f}!\"\n");
        match &body[0].kind {
            StmtKind::Return(Some(Expr::FString(parts))) => {
                assert_eq!(parts[0], FPart::Text("total {x}: ".into()));
                assert!(matches!(&parts[1], FPart::Value { spec: FormatSpec::Fixed(2), .. }));
                assert_eq!(parts[2], FPart::Text("!".into()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_escapes() {
        assert_eq!(unescape(r"a\nb\t\x41\u00e9\q"), "a\nb\tAé\\q");
    }

    #[test]
    fn lowers_slices_and_comprehensions() {
        let body = process_body(
            "def process(p):\n    xs = [i * 2 for i in range(10) if i % 2]\n    return xs[1:-1:2]\n",
        );
        assert!(matches!(&body[0].kind, StmtKind::Assign { value: Expr::ListComp { clauses, .. }, .. } if clauses.len() == 2));
        match &body[1].kind {
            StmtKind::Return(Some(Expr::Subscript(_, index))) => {
                assert!(matches!(**index, Expr::Slice { lower: Some(_), upper: Some(_), step: Some(_) }));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn reports_every_unsupported_construct() {
        let lowered = lower_source(
            "class A:\n    pass\n\ndef process(p):\n    try:\n        pass\n    except Exception:\n        pass\n    return {1, 2}\n",
        );
        let messages: Vec<&str> = lowered.violations.iter().map(|v| v.message.as_str()).collect();
        assert_eq!(lowered.violations.len(), 3, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("class")));
        assert!(messages.iter().any(|m| m.contains("try")));
        assert!(messages.iter().any(|m| m.contains("set")));
        assert!(lowered
            .violations
            .iter()
            .all(|v| v.kind == ViolationKind::Unsupported));
    }

    #[test]
    fn rejects_default_parameters_and_star_args() {
        let lowered = lower_source("def helper(a, b=2, *rest):\n    return a\n");
        assert_eq!(lowered.violations.len(), 2);
    }

    #[test]
    fn integer_literal_forms() {
        let body = process_body("def process(p):\n    return [0x1F, 0o17, 0b101, 1_000]\n");
        match &body[0].kind {
            StmtKind::Return(Some(Expr::List(items))) => {
                let values: Vec<i64> = items
                    .iter()
                    .map(|e| match e {
                        Expr::Literal(Literal::Int(v)) => *v,
                        other => panic!("unexpected: {other:?}"),
                    })
                    .collect();
                assert_eq!(values, vec![31, 15, 5, 1000]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn deep_nesting_is_reported_once() {
        let depth = MAX_NESTING + 20;
        let source = format!("x = {}1{}\n", "(".repeat(depth), ")".repeat(depth));
        let lowered = lower_source(&source);
        let deep: Vec<_> = lowered
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::NestingTooDeep)
            .collect();
        assert_eq!(deep.len(), 1);
    }
}
