use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::bytecode::compile_error::CompileError;
use crate::lang::node::ClassPart;

/// Entry of the constant pool.
///
/// Instructions refer to constants by index only; the compiler never looks
/// inside action code or interprets descriptors beyond deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constant {
    /// The failure sentinel.
    Failed,
    /// The absent-value marker pushed by successful predicates.
    Undefined,
    /// Value of an optional expression that did not match.
    Null,
    /// Fresh empty array, the accumulator of repetitions.
    EmptyArray,
    /// Literal text. Lower-cased when used by `MATCH_STRING_IC`.
    String(String),
    Class(CharClass),
    Expectation(Expectation),
    Function(ActionFn),
    /// Repetition bound; `None` is unbounded.
    Bound(Option<u32>),
}

/// Compiled character class descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharClass {
    pub parts: Vec<ClassPart>,
    pub inverted: bool,
    pub ignore_case: bool,
}

impl CharClass {
    /// Whether `c` is accepted by this class.
    ///
    /// A class with no parts accepts nothing, or everything when inverted.
    pub fn matches(&self, c: char) -> bool {
        let hit = if self.ignore_case {
            c.to_lowercase()
                .chain(c.to_uppercase())
                .chain(std::iter::once(c))
                .any(|candidate| self.contains(candidate))
        } else {
            self.contains(c)
        };
        hit != self.inverted
    }

    fn contains(&self, c: char) -> bool {
        self.parts.iter().any(|part| match *part {
            ClassPart::Char(p) => p == c,
            ClassPart::Range(lo, hi) => lo <= c && c <= hi,
        })
    }
}

/// What the parser expected at a failure point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expectation {
    Literal { value: String, description: String },
    Class { value: String, description: String },
    Any { description: String },
    Other { description: String },
}

impl Expectation {
    pub fn literal(value: &str) -> Self {
        Expectation::Literal {
            value: value.to_string(),
            description: format!("{:?}", value),
        }
    }

    pub fn class(raw_text: &str) -> Self {
        Expectation::Class {
            value: raw_text.to_string(),
            description: raw_text.to_string(),
        }
    }

    pub fn any() -> Self {
        Expectation::Any {
            description: "any character".to_string(),
        }
    }

    pub fn other(description: &str) -> Self {
        Expectation::Other {
            description: description.to_string(),
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Expectation::Literal { description, .. }
            | Expectation::Class { description, .. }
            | Expectation::Any { description }
            | Expectation::Other { description } => description,
        }
    }
}

/// User action or semantic predicate body.
///
/// `params` are the label names visible at the call site, in declaration
/// order; `code` is opaque to the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionFn {
    pub params: Vec<String>,
    pub code: String,
}

/// Deduplicating constant table.
///
/// Indices are assigned in first-insertion order and never change.
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    consts: Vec<Constant>,
    index: HashMap<Constant, u32>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `value`, appending it if no equal constant exists yet.
    pub fn intern(&mut self, value: Constant) -> Result<u32, CompileError> {
        if let Some(&existing) = self.index.get(&value) {
            return Ok(existing);
        }

        let index = u32::try_from(self.consts.len())
            .map_err(|_| CompileError::overflow("constant index", self.consts.len()))?;

        tracing::trace!(index, constant = ?value, "new constant");
        self.consts.push(value.clone());
        self.index.insert(value, index);
        Ok(index)
    }

    pub fn get(&self, index: u32) -> Option<&Constant> {
        self.consts.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.consts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consts.is_empty()
    }

    pub fn as_slice(&self) -> &[Constant] {
        &self.consts
    }

    pub fn into_vec(self) -> Vec<Constant> {
        self.consts
    }
}
