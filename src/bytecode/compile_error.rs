use crate::bytecode::stack_check::StackCheckError;

/// Errors raised while generating bytecode.
///
/// Grammar-shape problems (missing or duplicate rules) are reported by the
/// validation passes before generation; `UndefinedRule` only surfaces when
/// those passes were skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("compile error: rule '{name}' is referenced but not defined")]
    UndefinedRule { name: String },

    /// A length, count or index that does not fit a 32-bit operand.
    #[error("compile error: {what} {value} does not fit in a bytecode operand")]
    OperandOverflow { what: &'static str, value: usize },

    /// A stack slot referenced below the bottom of the rule's stack.
    #[error("compile error: label '{label}' refers to slot {slot} above stack pointer {sp}")]
    InvalidSlot { label: String, slot: i32, sp: i32 },

    #[error("compile error: rule '{rule}' failed verification: {source}")]
    StackCheck {
        rule: String,
        #[source]
        source: StackCheckError,
    },
}

impl CompileError {
    pub fn undefined_rule(name: &str) -> Self {
        CompileError::UndefinedRule {
            name: name.to_string(),
        }
    }

    pub fn overflow(what: &'static str, value: usize) -> Self {
        CompileError::OperandOverflow { what, value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            CompileError::undefined_rule("expr").to_string(),
            "compile error: rule 'expr' is referenced but not defined"
        );
        assert_eq!(
            CompileError::overflow("span length", 5_000_000_000).to_string(),
            "compile error: span length 5000000000 does not fit in a bytecode operand"
        );
    }
}
