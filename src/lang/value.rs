use serde::{Deserialize, Serialize};

/// Runtime value held on the interpreter stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// The failure sentinel: "this expression did not match".
    Failed,

    /// Matched, but produced no meaningful value (lookahead predicates).
    Undefined,

    /// Optional expression that did not match.
    Null,

    /// Input position saved by `PUSH_CURR_POS`.
    Pos(usize),

    /// Matched text or string constant.
    String(String),

    /// Repetition results or sequence elements.
    Array(Vec<Value>),

    /// Repetition bound pushed for `IF_ARRLEN_MIN` / `IF_ARRLEN_MAX`.
    Bound(Option<u32>),

    /// Values produced by user actions.
    Bool(bool),
    Integer(i64),
}

impl Value {
    pub fn is_failed(&self) -> bool {
        matches!(self, Value::Failed)
    }

    /// Truthiness used by `IF` after a semantic predicate call.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Failed | Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Integer(n) => *n != 0,
            Value::String(s) => !s.is_empty(),
            Value::Pos(_) | Value::Array(_) | Value::Bound(_) => true,
        }
    }

    /// Short name of the value kind, for runtime errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Failed => "failed",
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Pos(_) => "position",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Bound(_) => "bound",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Failed => write!(f, "<failed>"),
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Pos(p) => write!(f, "@{}", p),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Bound(Some(n)) => write!(f, "{}", n),
            Value::Bound(None) => write!(f, "unbounded"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}", n),
        }
    }
}
