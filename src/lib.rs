//! Bytecode generation for parsing expression grammars.
//!
//! A validated [`Grammar`](lang::node::Grammar) is translated into one flat
//! `u32` instruction stream per rule plus a shared, deduplicated constant
//! pool. Control flow is encoded as length-prefixed relative spans, so the
//! output needs no label resolution or patching.
//!
//! ```ignore
//! use pegbc::lang::node::{Expr, Grammar, Rule};
//! use pegbc::runtime::{NoActions, VmBc};
//!
//! let grammar = Grammar::new(vec![Rule::new("start", Expr::literal("abc"))]);
//! let compiled = pegbc::compile(&grammar, &Default::default())?;
//!
//! pegbc::bytecode::disasm::print_bc(&compiled);
//! let value = VmBc::new(&compiled, NoActions).parse("start", "abc")?;
//! ```
//!
//! The [`runtime`] module holds a reference interpreter for the generated
//! code; it is the oracle the generator's tests run against.

pub mod bytecode;
pub mod lang;
pub mod passes;
pub mod runtime;

use crate::bytecode::{CompileError, CompileOptions, CompiledGrammar, Compiler};
use crate::lang::node::Grammar;
use crate::passes::GrammarError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Validate `grammar` and generate its bytecode.
pub fn compile(grammar: &Grammar, options: &CompileOptions) -> Result<CompiledGrammar, Error> {
    passes::report_missing_rules(grammar)?;
    passes::report_duplicate_rules(grammar)?;

    let compiled = Compiler::with_options(options.clone()).compile_grammar(grammar)?;
    Ok(compiled)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::node::{Expr, Rule};
    use crate::lang::value::Value;
    use crate::runtime::{NoActions, VmBc};

    #[test]
    fn test_compile_runs_validation_first() {
        let grammar = Grammar::new(vec![Rule::new("start", Expr::rule_ref("missing"))]);

        let err = compile(&grammar, &CompileOptions::default()).unwrap_err();
        assert_eq!(
            err,
            Error::Grammar(GrammarError::MissingRule {
                name: "missing".into()
            })
        );
    }

    #[test]
    fn test_compile_rejects_duplicates() {
        let grammar = Grammar::new(vec![
            Rule::new("start", Expr::Any),
            Rule::new("start", Expr::Any),
        ]);

        let err = compile(&grammar, &CompileOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), r#"Rule "start" is already defined."#);
    }

    #[test]
    fn test_compile_then_run_after_serialization() {
        test_utils::init_test_logging();

        let grammar = Grammar::new(vec![
            Rule::new(
                "start",
                Expr::Sequence(vec![Expr::rule_ref("word"), Expr::literal_ic("!")]),
            ),
            Rule::new("word", Expr::text(Expr::one_or_more(Expr::literal("ha")))),
        ]);
        let options = CompileOptions { verify_stack: true };

        let compiled = compile(&grammar, &options).unwrap();
        let shipped = CompiledGrammar::from_bytes(&compiled.to_bytes().unwrap()).unwrap();
        assert_eq!(shipped, compiled);

        let value = VmBc::new(&shipped, NoActions).parse("start", "hahaha!").unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::String("hahaha".into()),
                Value::String("!".into()),
            ])
        );
    }
}
