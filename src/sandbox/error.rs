//! Faults raised inside the sandbox interpreter.

use std::fmt;

/// Exception classes visible to submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExcClass {
    Exception,
    ValueError,
    TypeError,
    KeyError,
    IndexError,
    ZeroDivisionError,
    RuntimeError,
    NameError,
    AttributeError,
    AssertionError,
    OverflowError,
    RecursionError,
}

impl ExcClass {
    /// Classes a submission may name (and construct) directly.
    pub const CONSTRUCTIBLE: [ExcClass; 7] = [
        ExcClass::Exception,
        ExcClass::ValueError,
        ExcClass::TypeError,
        ExcClass::KeyError,
        ExcClass::IndexError,
        ExcClass::ZeroDivisionError,
        ExcClass::RuntimeError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExcClass::Exception => "Exception",
            ExcClass::ValueError => "ValueError",
            ExcClass::TypeError => "TypeError",
            ExcClass::KeyError => "KeyError",
            ExcClass::IndexError => "IndexError",
            ExcClass::ZeroDivisionError => "ZeroDivisionError",
            ExcClass::RuntimeError => "RuntimeError",
            ExcClass::NameError => "NameError",
            ExcClass::AttributeError => "AttributeError",
            ExcClass::AssertionError => "AssertionError",
            ExcClass::OverflowError => "OverflowError",
            ExcClass::RecursionError => "RecursionError",
        }
    }

    pub fn lookup(name: &str) -> Option<Self> {
        Self::CONSTRUCTIBLE.into_iter().find(|c| c.name() == name)
    }

    /// Every class derives from `Exception`; there is no deeper hierarchy.
    pub fn is_subclass_of(self, other: ExcClass) -> bool {
        self == other || other == ExcClass::Exception
    }
}

/// An exception instance, raised or held as a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Raised {
    pub class: ExcClass,
    pub message: String,
    /// Source line of the innermost statement that raised it.
    pub line: Option<usize>,
}

impl fmt::Display for Raised {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class.name())?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(line) = self.line {
            write!(f, " (line {line})")?;
        }
        Ok(())
    }
}

/// Why evaluation stopped early.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Fault {
    #[error("{0}")]
    Raised(Raised),
    #[error("execution exceeded its time limit")]
    Timeout,
    #[error("memory limit of {limit} bytes exceeded")]
    Memory { limit: usize },
}

pub type Flow<T> = Result<T, Fault>;

impl Fault {
    pub fn raise(class: ExcClass, message: impl Into<String>) -> Self {
        Fault::Raised(Raised {
            class,
            message: message.into(),
            line: None,
        })
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::raise(ExcClass::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::raise(ExcClass::ValueError, message)
    }

    pub fn index_error(message: impl Into<String>) -> Self {
        Self::raise(ExcClass::IndexError, message)
    }

    pub fn overflow() -> Self {
        Self::raise(ExcClass::OverflowError, "integer overflow (values are 64-bit)")
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::raise(ExcClass::ZeroDivisionError, message)
    }

    /// Attach a source line unless an inner statement already did.
    pub fn at_line(self, line: usize) -> Self {
        match self {
            Fault::Raised(mut raised) if raised.line.is_none() => {
                raised.line = Some(line);
                Fault::Raised(raised)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn innermost_line_wins() {
        let fault = Fault::value_error("bad").at_line(7).at_line(3);
        assert_eq!(fault.to_string(), "ValueError: bad (line 7)");
    }

    #[test]
    fn lookup_only_constructible_classes() {
        assert_eq!(ExcClass::lookup("KeyError"), Some(ExcClass::KeyError));
        assert_eq!(ExcClass::lookup("RecursionError"), None);
    }

    #[test]
    fn everything_is_an_exception() {
        assert!(ExcClass::KeyError.is_subclass_of(ExcClass::Exception));
        assert!(!ExcClass::KeyError.is_subclass_of(ExcClass::ValueError));
    }
}
