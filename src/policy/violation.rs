//! Policy violations: one entry per offending construct.

use serde::{Deserialize, Serialize};
use tree_sitter::Node;

/// Why a submission was rejected. Each rule of the policy has its own kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Syntax,
    SourceTooLarge,
    Import,
    HostAccess,
    DynamicEval,
    ForbiddenAttribute,
    Unsupported,
    NestingTooDeep,
    EntryPoint,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::Syntax => "syntax",
            ViolationKind::SourceTooLarge => "source-too-large",
            ViolationKind::Import => "import",
            ViolationKind::HostAccess => "host-access",
            ViolationKind::DynamicEval => "dynamic-eval",
            ViolationKind::ForbiddenAttribute => "forbidden-attribute",
            ViolationKind::Unsupported => "unsupported",
            ViolationKind::NestingTooDeep => "nesting-too-deep",
            ViolationKind::EntryPoint => "entry-point",
        };
        f.write_str(s)
    }
}

/// A single policy violation, positioned in the submitted source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Source text of the offending construct (truncated).
    pub construct: String,
    /// 1-based line.
    pub line: usize,
    /// 1-based column.
    pub column: usize,
    pub message: String,
}

const MAX_CONSTRUCT_CHARS: usize = 60;

impl Violation {
    /// Build a violation located at `node`.
    pub fn at(kind: ViolationKind, node: Node<'_>, source: &str, message: impl Into<String>) -> Self {
        let pos = node.start_position();
        Self {
            kind,
            construct: excerpt(node.utf8_text(source.as_bytes()).unwrap_or_default()),
            line: pos.row + 1,
            column: pos.column + 1,
            message: message.into(),
        }
    }

    /// A violation that concerns the whole submission rather than one node.
    pub fn whole(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            construct: String::new(),
            line: 1,
            column: 1,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}:{}: {}", self.line, self.column, self.message)
    }
}

/// First line of `text`, capped at `MAX_CONSTRUCT_CHARS` characters.
fn excerpt(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or_default().trim_end();
    if first_line.chars().count() > MAX_CONSTRUCT_CHARS {
        let cut: String = first_line.chars().take(MAX_CONSTRUCT_CHARS).collect();
        format!("{cut}...")
    } else if first_line.len() < text.trim_end().len() {
        format!("{first_line} ...")
    } else {
        first_line.to_string()
    }
}
