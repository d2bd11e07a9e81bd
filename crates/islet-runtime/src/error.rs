//! Error taxonomy for cross-isolate operations.
//!
//! Two layers: *fatal* means the isolate is no longer usable (memory-limit
//! breach, unrecoverable termination); *runtime* errors are recoverable and
//! typed (`Generic | Type | Range`), or carry a JS error copied across the
//! boundary with its name, message and stack preserved. Stacks compose
//! outer-to-inner as an error crosses boundaries.

use islet_engine::ErrorKind;
use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Clone, Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Generic(ErrorDetail),

    #[error("{0}")]
    Type(ErrorDetail),

    #[error("{0}")]
    Range(ErrorDetail),

    /// A JS error that crossed an isolate boundary, class and stack intact.
    #[error("{}: {}", .0.name, .0.message)]
    Js(JsErrorCopy),

    /// The isolate is gone or unusable.
    #[error("{0}")]
    Fatal(String),
}

#[derive(Clone, Debug)]
pub struct ErrorDetail {
    pub message: String,
    pub stack: Option<String>,
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Clone, Debug)]
pub struct JsErrorCopy {
    pub kind: ErrorKind,
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl RuntimeError {
    pub fn generic(message: impl Into<String>) -> RuntimeError {
        RuntimeError::Generic(ErrorDetail {
            message: message.into(),
            stack: None,
        })
    }

    pub fn type_error(message: impl Into<String>) -> RuntimeError {
        RuntimeError::Type(ErrorDetail {
            message: message.into(),
            stack: None,
        })
    }

    pub fn range_error(message: impl Into<String>) -> RuntimeError {
        RuntimeError::Range(ErrorDetail {
            message: message.into(),
            stack: None,
        })
    }

    pub fn fatal(message: impl Into<String>) -> RuntimeError {
        RuntimeError::Fatal(message.into())
    }

    /// The fixed error every operation raises against a disposed isolate.
    pub fn disposed() -> RuntimeError {
        RuntimeError::generic("Isolate is disposed")
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Fatal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            RuntimeError::Generic(d) | RuntimeError::Type(d) | RuntimeError::Range(d) => {
                &d.message
            }
            RuntimeError::Js(j) => &j.message,
            RuntimeError::Fatal(m) => m,
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            RuntimeError::Generic(d) | RuntimeError::Type(d) | RuntimeError::Range(d) => {
                d.stack.as_deref()
            }
            RuntimeError::Js(j) => j.stack.as_deref(),
            RuntimeError::Fatal(_) => None,
        }
    }

    /// Append a caller-side stack below the existing one, producing the
    /// composite outer-to-inner trace seen across boundaries.
    pub fn chain_stack(mut self, outer: &str) -> RuntimeError {
        if outer.is_empty() {
            return self;
        }
        let slot = match &mut self {
            RuntimeError::Generic(d) | RuntimeError::Type(d) | RuntimeError::Range(d) => {
                &mut d.stack
            }
            RuntimeError::Js(j) => &mut j.stack,
            RuntimeError::Fatal(_) => return self,
        };
        *slot = Some(match slot.take() {
            Some(existing) => format!("{}\n    at (<isolated>)\n{}", existing, outer),
            None => outer.to_string(),
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposed_text_is_fixed() {
        assert_eq!(RuntimeError::disposed().message(), "Isolate is disposed");
    }

    #[test]
    fn chain_stack_composes_outer_to_inner() {
        let err = RuntimeError::Js(JsErrorCopy {
            kind: ErrorKind::TypeError,
            name: "TypeError".into(),
            message: "boom".into(),
            stack: Some("    at inner".into()),
        })
        .chain_stack("    at outer");
        let stack = err.stack().unwrap();
        let inner = stack.find("inner").unwrap();
        let outer = stack.find("outer").unwrap();
        assert!(inner < outer);
    }

    #[test]
    fn fatal_keeps_no_stack() {
        let err = RuntimeError::fatal("gone").chain_stack("    at x");
        assert!(err.stack().is_none());
        assert!(err.is_fatal());
    }
}
