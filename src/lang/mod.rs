//! Front end for submitted functions.
//!
//! Source text is parsed with tree-sitter-python, then lowered into the
//! crate's own AST (`ast`). The lowering only knows the accepted subset, so
//! it doubles as the policy allow-list.

pub mod ast;
pub mod lower;

use tree_sitter::{Node, Parser, Tree};

pub use ast::Program;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to load the Python grammar: {0}")]
    Language(String),
    #[error("parser produced no tree")]
    NoTree,
}

/// Parse Python source into a concrete syntax tree.
pub fn parse(source: &str) -> Result<Tree, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| ParseError::Language(e.to_string()))?;
    parser.parse(source, None).ok_or(ParseError::NoTree)
}

/// Pre-order walk over every node under `root`, including anonymous tokens.
///
/// Iterative, so hostile nesting cannot exhaust the host stack.
pub fn for_each_node<'t>(root: Node<'t>, mut visit: impl FnMut(Node<'t>)) {
    let mut cursor = root.walk();
    loop {
        visit(cursor.node());
        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
        }
    }
}

/// Named children of `node`, with comments and line continuations dropped.
pub(crate) fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|n| !is_extra(*n))
        .collect()
}

/// Every child of `node` (named and anonymous), extras dropped.
pub(crate) fn all_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children(&mut cursor).filter(|n| !is_extra(*n)).collect()
}

fn is_extra(node: Node<'_>) -> bool {
    matches!(node.kind(), "comment" | "line_continuation")
}

pub(crate) fn node_text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_function() {
        let tree = parse("def process(parameters):\n    return 1\n").unwrap();
        let root = tree.root_node();
        assert_eq!(root.kind(), "module");
        assert!(!root.has_error());
        let children = named_children(root);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind(), "function_definition");
    }

    #[test]
    fn broken_source_has_error() {
        let tree = parse("def process(:\n").unwrap();
        assert!(tree.root_node().has_error());
    }

    #[test]
    fn walk_visits_every_identifier() {
        let source = "a = b + c\n";
        let tree = parse(source).unwrap();
        let mut names = Vec::new();
        for_each_node(tree.root_node(), |n| {
            if n.kind() == "identifier" {
                names.push(node_text(n, source).to_string());
            }
        });
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn comments_are_not_children() {
        let source = "# header\nx = 1  # trailing\n";
        let tree = parse(source).unwrap();
        let children = named_children(tree.root_node());
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind(), "expression_statement");
    }
}
