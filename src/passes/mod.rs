//! Grammar checks that must pass before bytecode generation.
//!
//! The generator assumes every rule reference resolves and every rule name
//! is unique; these passes report the first violation instead.

use std::collections::HashMap;

use crate::lang::node::{Expr, Grammar};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GrammarError {
    #[error("Referenced rule \"{name}\" does not exist.")]
    MissingRule { name: String },

    /// `first` is the index of the earlier definition.
    #[error("Rule \"{name}\" is already defined.")]
    DuplicateRule { name: String, first: usize },
}

/// Fails on the first rule reference, in declaration order, that names no
/// rule. Range delimiters are checked too.
pub fn report_missing_rules(grammar: &Grammar) -> Result<(), GrammarError> {
    for rule in &grammar.rules {
        check_refs(grammar, &rule.expression)?;
    }
    Ok(())
}

fn check_refs(grammar: &Grammar, expr: &Expr) -> Result<(), GrammarError> {
    if let Expr::RuleRef(name) = expr {
        if grammar.rule_index(name).is_none() {
            return Err(GrammarError::MissingRule { name: name.clone() });
        }
    }

    expr.children()
        .into_iter()
        .try_for_each(|child| check_refs(grammar, child))
}

/// Fails on the first rule whose name was declared before it.
pub fn report_duplicate_rules(grammar: &Grammar) -> Result<(), GrammarError> {
    let mut seen: HashMap<&str, usize> = HashMap::new();

    for (index, rule) in grammar.rules.iter().enumerate() {
        if let Some(&first) = seen.get(rule.name.as_str()) {
            return Err(GrammarError::DuplicateRule {
                name: rule.name.clone(),
                first,
            });
        }
        seen.insert(&rule.name, index);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::node::Rule;

    #[test]
    fn test_missing_rule_in_delimiter() {
        let grammar = Grammar::new(vec![Rule::new(
            "list",
            Expr::range(Expr::Any, None, None, Some(Expr::rule_ref("comma"))),
        )]);

        let err = report_missing_rules(&grammar).unwrap_err();
        assert_eq!(err.to_string(), r#"Referenced rule "comma" does not exist."#);
    }

    #[test]
    fn test_first_missing_rule_is_reported() {
        let grammar = Grammar::new(vec![
            Rule::new("a", Expr::Sequence(vec![Expr::rule_ref("b"), Expr::rule_ref("x")])),
            Rule::new("b", Expr::action(Expr::rule_ref("y"), "f")),
        ]);

        assert_eq!(
            report_missing_rules(&grammar),
            Err(GrammarError::MissingRule { name: "x".into() })
        );
    }

    #[test]
    fn test_resolved_references_pass() {
        let grammar = Grammar::new(vec![
            Rule::new("start", Expr::zero_or_more(Expr::rule_ref("item"))),
            Rule::new("item", Expr::named("item", Expr::literal("i"))),
        ]);

        assert_eq!(report_missing_rules(&grammar), Ok(()));
        assert_eq!(report_duplicate_rules(&grammar), Ok(()));
    }

    #[test]
    fn test_duplicate_rule() {
        let grammar = Grammar::new(vec![
            Rule::new("start", Expr::Any),
            Rule::new("other", Expr::Any),
            Rule::new("start", Expr::literal("s")),
        ]);

        let err = report_duplicate_rules(&grammar).unwrap_err();
        assert_eq!(
            err,
            GrammarError::DuplicateRule {
                name: "start".into(),
                first: 0,
            }
        );
        assert_eq!(err.to_string(), r#"Rule "start" is already defined."#);
    }
}
