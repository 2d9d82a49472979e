use serde::{Deserialize, Serialize};

use crate::bytecode::constant::Constant;

/// A compiled grammar: per-rule bytecode plus the shared constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledGrammar {
    /// Rules in declaration order. `RULE r` refers to `rules[r]`.
    pub rules: Vec<CompiledRule>,

    /// Constant pool, indexed by `PUSH`, `MATCH_*`, `FAIL` and `CALL`.
    pub consts: Vec<Constant>,
}

/// A single rule's instruction stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub name: String,
    pub bytecode: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("cannot encode compiled grammar: {0}")]
    Encode(#[source] postcard::Error),
    #[error("cannot decode compiled grammar: {0}")]
    Decode(#[source] postcard::Error),
}

impl CompiledGrammar {
    pub fn rule_index(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == name)
    }

    pub fn constant(&self, index: u32) -> Option<&Constant> {
        self.consts.get(index as usize)
    }

    /// Serialize with postcard for shipping to an interpreter.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        postcard::to_allocvec(self).map_err(FormatError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        postcard::from_bytes(bytes).map_err(FormatError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::constant::{ActionFn, Expectation};

    #[test]
    fn test_postcard_keeps_pool_order() {
        let grammar = CompiledGrammar {
            rules: vec![CompiledRule {
                name: "start".into(),
                bytecode: vec![16, 0, 2, 2, 20, 0, 21, 1],
            }],
            consts: vec![
                Constant::String("ab".into()),
                Constant::Expectation(Expectation::literal("ab")),
                Constant::Function(ActionFn {
                    params: vec!["x".into()],
                    code: "return x;".into(),
                }),
                Constant::Bound(None),
            ],
        };

        let bytes = grammar.to_bytes().unwrap();
        let decoded = CompiledGrammar::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, grammar);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = CompiledGrammar::from_bytes(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(err.to_string().starts_with("cannot decode compiled grammar"));
    }
}
