//! Engine error types.

use crate::value::Value;
use thiserror::Error;

/// Errors produced while parsing or executing JavaScript.
///
/// `Thrown` carries the actual JS exception value and therefore must never
/// leave the isolate it was produced in; embedders copy the value out before
/// crossing threads.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A JavaScript value was thrown and not caught.
    #[error("uncaught JavaScript exception")]
    Thrown(Value),

    /// Execution was cooperatively terminated via [`IsolateHandle::terminate_execution`].
    ///
    /// [`IsolateHandle::terminate_execution`]: crate::IsolateHandle::terminate_execution
    #[error("execution terminated")]
    Terminated,

    /// A heap allocation would exceed the isolate's memory limit.
    #[error("isolate heap limit exceeded")]
    OutOfMemory,

    /// The source text failed to parse.
    #[error("SyntaxError: {0}")]
    Syntax(String),

    /// Structured clone encountered a value that cannot be serialized.
    #[error("DataCloneError: {0}")]
    DataClone(String),
}

/// Result of a JavaScript evaluation step.
pub type Completion<T = Value> = Result<T, EngineError>;
