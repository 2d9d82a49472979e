use serde::{Deserialize, Serialize};

/// A validated grammar: an ordered list of rules.
///
/// Rule order matters. A rule's position is its index in the `RULE`
/// instruction, and rules are generated in declaration order so constant
/// pool indices are reproducible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grammar {
    pub rules: Vec<Rule>,
}

impl Grammar {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Index of the first rule named `name`.
    pub fn rule_index(&self, name: &str) -> Option<usize> {
        self.rules.iter().position(|r| r.name == name)
    }
}

/// A named rule with its top-level expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub expression: Expr,
}

impl Rule {
    pub fn new(name: impl Into<String>, expression: Expr) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

/// One member of a character class: a single character or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassPart {
    Char(char),
    Range(char, char),
}

/// Expression node of a parsing expression grammar.
///
/// Every node compiles to code that leaves exactly one new stack entry:
/// the matched value or the failure sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    // ───────────────────────────── Structure ────────────────────────────
    /// Human-readable name reported instead of the inner expectations.
    Named { name: String, expression: Box<Expr> },

    /// Ordered choice: first alternative that matches wins.
    ///
    /// Stack effect: `( -- value|FAILED )`
    Choice(Vec<Expr>),

    /// User code run on the value(s) of `expression`.
    ///
    /// Labels declared inside a direct child sequence become parameters.
    Action { expression: Box<Expr>, code: String },

    /// All elements in order; yields an array of their values.
    Sequence(Vec<Expr>),

    /// Binds the value of `expression` to `label` for the enclosing action.
    Labeled { label: String, expression: Box<Expr> },

    /// Yields the matched input slice instead of the structural value.
    Text(Box<Expr>),

    // ───────────────────────────── Predicates ───────────────────────────
    /// `&e`: succeeds without consuming when `e` matches.
    SimpleAnd(Box<Expr>),

    /// `!e`: succeeds without consuming when `e` does not match.
    SimpleNot(Box<Expr>),

    /// `&{ code }`: succeeds when the code returns a true-like value.
    SemanticAnd(String),

    /// `!{ code }`: succeeds when the code returns a false-like value.
    SemanticNot(String),

    // ──────────────────────────── Repetition ────────────────────────────
    /// `e?`
    Optional(Box<Expr>),

    /// `e*`
    ZeroOrMore(Box<Expr>),

    /// `e+`
    OneOrMore(Box<Expr>),

    /// `e|min..max, delimiter|`: bounded repetition with optional delimiter.
    Range {
        expression: Box<Expr>,
        min: Option<u32>,
        max: Option<u32>,
        delimiter: Option<Box<Expr>>,
    },

    // ────────────────────────────── Atoms ───────────────────────────────
    /// Call another rule by name.
    RuleRef(String),

    /// Literal text, optionally matched case-insensitively.
    Literal { value: String, ignore_case: bool },

    /// Single character from a set.
    ///
    /// `raw_text` is the class as written in the grammar and is used for
    /// failure reporting.
    Class {
        parts: Vec<ClassPart>,
        inverted: bool,
        ignore_case: bool,
        raw_text: String,
    },

    /// `.`: any single character.
    Any,
}

impl Expr {
    /// Short node kind name used in logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Named { .. } => "named",
            Expr::Choice(_) => "choice",
            Expr::Action { .. } => "action",
            Expr::Sequence(_) => "sequence",
            Expr::Labeled { .. } => "labeled",
            Expr::Text(_) => "text",
            Expr::SimpleAnd(_) => "simple_and",
            Expr::SimpleNot(_) => "simple_not",
            Expr::SemanticAnd(_) => "semantic_and",
            Expr::SemanticNot(_) => "semantic_not",
            Expr::Optional(_) => "optional",
            Expr::ZeroOrMore(_) => "zero_or_more",
            Expr::OneOrMore(_) => "one_or_more",
            Expr::Range { .. } => "range",
            Expr::RuleRef(_) => "rule_ref",
            Expr::Literal { .. } => "literal",
            Expr::Class { .. } => "class",
            Expr::Any => "any",
        }
    }

    /// Direct sub-expressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Named { expression, .. }
            | Expr::Action { expression, .. }
            | Expr::Labeled { expression, .. } => vec![expression],
            Expr::Text(e)
            | Expr::SimpleAnd(e)
            | Expr::SimpleNot(e)
            | Expr::Optional(e)
            | Expr::ZeroOrMore(e)
            | Expr::OneOrMore(e) => vec![e],
            Expr::Choice(items) | Expr::Sequence(items) => items.iter().collect(),
            Expr::Range {
                expression,
                delimiter,
                ..
            } => {
                let mut out: Vec<&Expr> = vec![expression];
                if let Some(d) = delimiter {
                    out.push(d);
                }
                out
            }
            Expr::SemanticAnd(_)
            | Expr::SemanticNot(_)
            | Expr::RuleRef(_)
            | Expr::Literal { .. }
            | Expr::Class { .. }
            | Expr::Any => Vec::new(),
        }
    }

    // Constructors

    pub fn literal(value: impl Into<String>) -> Self {
        Expr::Literal {
            value: value.into(),
            ignore_case: false,
        }
    }

    pub fn literal_ic(value: impl Into<String>) -> Self {
        Expr::Literal {
            value: value.into(),
            ignore_case: true,
        }
    }

    /// Class built from parts; `raw_text` is rendered in bracket syntax.
    pub fn class(parts: Vec<ClassPart>, inverted: bool, ignore_case: bool) -> Self {
        let raw_text = render_class(&parts, inverted, ignore_case);
        Expr::Class {
            parts,
            inverted,
            ignore_case,
            raw_text,
        }
    }

    pub fn rule_ref(name: impl Into<String>) -> Self {
        Expr::RuleRef(name.into())
    }

    pub fn named(name: impl Into<String>, expression: Expr) -> Self {
        Expr::Named {
            name: name.into(),
            expression: Box::new(expression),
        }
    }

    pub fn action(expression: Expr, code: impl Into<String>) -> Self {
        Expr::Action {
            expression: Box::new(expression),
            code: code.into(),
        }
    }

    pub fn labeled(label: impl Into<String>, expression: Expr) -> Self {
        Expr::Labeled {
            label: label.into(),
            expression: Box::new(expression),
        }
    }

    pub fn text(expression: Expr) -> Self {
        Expr::Text(Box::new(expression))
    }

    pub fn optional(expression: Expr) -> Self {
        Expr::Optional(Box::new(expression))
    }

    pub fn zero_or_more(expression: Expr) -> Self {
        Expr::ZeroOrMore(Box::new(expression))
    }

    pub fn one_or_more(expression: Expr) -> Self {
        Expr::OneOrMore(Box::new(expression))
    }

    pub fn simple_and(expression: Expr) -> Self {
        Expr::SimpleAnd(Box::new(expression))
    }

    pub fn simple_not(expression: Expr) -> Self {
        Expr::SimpleNot(Box::new(expression))
    }

    pub fn range(
        expression: Expr,
        min: Option<u32>,
        max: Option<u32>,
        delimiter: Option<Expr>,
    ) -> Self {
        Expr::Range {
            expression: Box::new(expression),
            min,
            max,
            delimiter: delimiter.map(Box::new),
        }
    }
}

/// Bracket syntax for a class, e.g. `[^a-z_]i`.
pub(crate) fn render_class(parts: &[ClassPart], inverted: bool, ignore_case: bool) -> String {
    let mut out = String::from("[");
    if inverted {
        out.push('^');
    }
    for part in parts {
        match part {
            ClassPart::Char(c) => push_class_char(&mut out, *c),
            ClassPart::Range(lo, hi) => {
                push_class_char(&mut out, *lo);
                out.push('-');
                push_class_char(&mut out, *hi);
            }
        }
    }
    out.push(']');
    if ignore_case {
        out.push('i');
    }
    out
}

fn push_class_char(out: &mut String, c: char) {
    match c {
        '\\' | ']' | '^' | '-' => {
            out.push('\\');
            out.push(c);
        }
        _ => out.extend(c.escape_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_raw_text() {
        let e = Expr::class(
            vec![ClassPart::Range('a', 'z'), ClassPart::Char('_')],
            true,
            true,
        );
        match e {
            Expr::Class { raw_text, .. } => assert_eq!(raw_text, "[^a-z_]i"),
            other => panic!("expected class, got {:?}", other),
        }
    }

    #[test]
    fn test_class_raw_text_escapes_specials() {
        let e = Expr::class(vec![ClassPart::Char(']'), ClassPart::Char('-')], false, false);
        match e {
            Expr::Class { raw_text, .. } => assert_eq!(raw_text, r"[\]\-]"),
            other => panic!("expected class, got {:?}", other),
        }
    }

    #[test]
    fn test_range_children_include_delimiter() {
        let e = Expr::range(Expr::Any, None, None, Some(Expr::literal(",")));
        let kinds: Vec<_> = e.children().iter().map(|c| c.kind()).collect();
        assert_eq!(kinds, vec!["any", "literal"]);
    }

    #[test]
    fn test_rule_index_finds_first() {
        let g = Grammar::new(vec![
            Rule::new("start", Expr::Any),
            Rule::new("other", Expr::Any),
        ]);
        assert_eq!(g.rule_index("other"), Some(1));
        assert_eq!(g.rule_index("missing"), None);
    }
}
