use std::rc::Rc;

use crate::global::Tag;

/// A user exception in flight: the tag it was thrown with and the raw
/// payload bytes captured from the throwing frame (laid out per the
/// tag's parameter types).
#[derive(Debug, Clone)]
pub struct Exception {
    pub(crate) tag: Rc<Tag>,
    pub(crate) payload: Vec<u8>,
}

impl Exception {
    pub fn tag(&self) -> &Rc<Tag> {
        &self.tag
    }
}

/// Abnormal termination of interpretation.
///
/// Traps and uncaught user exceptions propagate through the interpreter
/// as a single error type; a `catch` whose tag matches consumes the
/// `Exception` variant before it reaches the host.
#[derive(Debug, Clone)]
pub enum Trap {
    Unreachable,
    DivideByZero,
    IntegerOverflow,
    InvalidConversion,
    MemoryOutOfBounds,
    TableOutOfBounds,
    UndefinedElement,
    UninitializedElement,
    IndirectCallTypeMismatch,
    CallStackExhausted,
    HostError(String),
    Exception(Exception),
}

impl Trap {
    pub fn message(&self) -> &str {
        match self {
            Trap::Unreachable => "unreachable executed",
            Trap::DivideByZero => "integer divide by zero",
            Trap::IntegerOverflow => "integer overflow",
            Trap::InvalidConversion => "invalid conversion to integer",
            Trap::MemoryOutOfBounds => "out of bounds memory access",
            Trap::TableOutOfBounds => "out of bounds table access",
            Trap::UndefinedElement => "undefined element",
            Trap::UninitializedElement => "uninitialized element",
            Trap::IndirectCallTypeMismatch => "indirect call type mismatch",
            Trap::CallStackExhausted => "call stack exhausted",
            Trap::HostError(msg) => msg,
            Trap::Exception(_) => "uncaught exception",
        }
    }
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "trap: {}", self.message())
    }
}

impl std::error::Error for Trap {}
