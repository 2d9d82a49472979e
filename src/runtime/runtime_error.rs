use crate::bytecode::constant::Expectation;
use crate::bytecode::op::Opcode;

/// Errors raised while interpreting grammar bytecode.
///
/// Everything except `Syntax` is a machine fault: malformed bytecode, an
/// exhausted limit, or an action host error. `Syntax` is an ordinary parse
/// failure of the input.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime error: bad opcode {word} at ip={ip} in rule '{rule}'")]
    BadOpcode { rule: String, ip: usize, word: u32 },

    #[error("runtime error: truncated operands for {op} at ip={ip} in rule '{rule}'")]
    Truncated { rule: String, ip: usize, op: Opcode },

    #[error("runtime error: {op} bodies overrun the enclosing span at ip={ip} in rule '{rule}'")]
    SpanOverrun { rule: String, ip: usize, op: Opcode },

    #[error("runtime error: stack underflow: needed {needed} items, have {have}")]
    StackUnderflow { needed: usize, have: usize },

    #[error("runtime error: type error: expected {expected}, got {got}")]
    TypeError {
        expected: &'static str,
        got: &'static str,
    },

    #[error("runtime error: constant {index} is missing or not {expected}")]
    BadConstant { index: u32, expected: &'static str },

    #[error("runtime error: rule index {0} out of range")]
    RuleIndex(usize),

    #[error("runtime error: no rule named '{0}'")]
    UnknownRule(String),

    #[error("runtime error: execution step limit exceeded ({0})")]
    StepLimit(usize),

    #[error("runtime error: call depth limit exceeded ({limit}) - possible left recursion in '{rule}'")]
    CallDepth { limit: usize, rule: String },

    #[error("runtime error: stack size limit exceeded ({0})")]
    StackLimit(usize),

    #[error("runtime error: action failed: {0}")]
    Host(String),

    #[error(transparent)]
    Syntax(#[from] ParseFailure),
}

pub fn stack_underflow(needed: usize, have: usize) -> RuntimeError {
    RuntimeError::StackUnderflow { needed, have }
}

pub fn type_error(expected: &'static str, got: &'static str) -> RuntimeError {
    RuntimeError::TypeError { expected, got }
}

/// The input did not match the start rule.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", failure_message(.expected, .found))]
pub struct ParseFailure {
    /// Furthest character offset at which matching failed.
    pub offset: usize,

    /// Everything that could have matched at `offset`, in recording order.
    pub expected: Vec<Expectation>,

    /// Character at `offset`, or `None` at end of input.
    pub found: Option<char>,
}

/// `Expected "a", [0-9], or end of input but "x" found.`
fn failure_message(expected: &[Expectation], found: &Option<char>) -> String {
    let mut descriptions: Vec<&str> = expected.iter().map(|e| e.description()).collect();
    descriptions.sort_unstable();
    descriptions.dedup();

    let expected = match descriptions.as_slice() {
        [] => "nothing".to_string(),
        [one] => one.to_string(),
        [first, second] => format!("{} or {}", first, second),
        [init @ .., last] => format!("{}, or {}", init.join(", "), last),
    };

    let found = match found {
        Some(c) => format!("{:?}", c.to_string()),
        None => "end of input".to_string(),
    };

    format!("Expected {} but {} found.", expected, found)
}
