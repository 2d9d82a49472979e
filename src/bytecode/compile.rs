use std::collections::HashMap;

use crate::{
    bytecode::{
        compile_error::CompileError,
        constant::{ActionFn, CharClass, ConstPool, Constant, Expectation},
        context::{Context, Env},
        emit::{self, Code, condition, looped, op, op1, operand, seq},
        ir::{CompiledGrammar, CompiledRule},
        op::Opcode::{self, *},
        stack_check::check_rule,
    },
    lang::node::{ClassPart, Expr, Grammar, Rule},
};

#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Run the stack checker on every generated rule.
    pub verify_stack: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            verify_stack: cfg!(debug_assertions),
        }
    }
}

/// Translates a validated grammar into per-rule bytecode.
///
/// Every generator leaves exactly one new value on the stack: the match
/// result or FAILED. Rules are generated in declaration order so constant
/// indices are reproducible.
pub struct Compiler {
    /// Shared constant pool, filled in generation order
    consts: ConstPool,

    /// Rule name -> index for `RULE`
    rule_indices: HashMap<String, u32>,

    options: CompileOptions,
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_options(CompileOptions::default())
    }

    pub fn with_options(options: CompileOptions) -> Self {
        Self {
            consts: ConstPool::new(),
            rule_indices: HashMap::new(),
            options,
        }
    }

    /// Generate bytecode for every rule and attach the finished pool.
    ///
    /// Assumes the grammar passed the validation passes.
    pub fn compile_grammar(mut self, grammar: &Grammar) -> Result<CompiledGrammar, CompileError> {
        self.rule_indices.clear();
        for (index, rule) in grammar.rules.iter().enumerate() {
            let index = operand("rule index", index)?;
            self.rule_indices.entry(rule.name.clone()).or_insert(index);
        }

        let mut rules = Vec::with_capacity(grammar.rules.len());
        for (index, rule) in grammar.rules.iter().enumerate() {
            let bytecode = self.compile_rule(rule)?;
            tracing::debug!(rule = %rule.name, index, len = bytecode.len(), "generated rule");
            rules.push(CompiledRule {
                name: rule.name.clone(),
                bytecode,
            });
        }

        tracing::debug!(
            rules = rules.len(),
            consts = self.consts.len(),
            "generated grammar bytecode"
        );

        Ok(CompiledGrammar {
            rules,
            consts: self.consts.into_vec(),
        })
    }

    fn compile_rule(&mut self, rule: &Rule) -> Result<Code, CompileError> {
        let code = self.generate(&rule.expression, Context::rule(), &mut Env::new())?;

        if self.options.verify_stack {
            check_rule(&code).map_err(|source| CompileError::StackCheck {
                rule: rule.name.clone(),
                source,
            })?;
        }

        Ok(code)
    }

    fn intern(&mut self, value: Constant) -> Result<u32, CompileError> {
        self.consts.intern(value)
    }

    fn intern_function(&mut self, env: &Env, code: &str) -> Result<u32, CompileError> {
        self.intern(Constant::Function(ActionFn {
            params: env.names(),
            code: code.to_string(),
        }))
    }

    // =========================================================================
    // Node generators
    // =========================================================================

    fn generate<'e>(
        &mut self,
        expr: &'e Expr,
        ctx: Context<'e>,
        env: &mut Env,
    ) -> Result<Code, CompileError> {
        tracing::trace!(kind = expr.kind(), sp = ctx.sp, "generate");

        match expr {
            Expr::Named { name, expression } => self.gen_named(name, expression, ctx, env),
            Expr::Choice(alternatives) => self.gen_choice(alternatives, ctx),
            Expr::Action { expression, code } => self.gen_action(expression, code, ctx),
            Expr::Sequence(elements) => self.gen_sequence(elements, ctx, env),

            Expr::Labeled { label, expression } => {
                env.bind(label, ctx.sp + 1);
                self.generate(expression, ctx.push(0), &mut Env::new())
            }

            Expr::Text(expression) => {
                let inner = self.generate(expression, ctx.push(1), &mut Env::new())?;

                Ok(seq![
                    op(PushCurrPos),
                    inner,
                    condition(op(IfNotError), op(Text), vec![])?,
                    op(Nip),
                ])
            }

            Expr::SimpleAnd(expression) => self.gen_simple_predicate(expression, false, ctx),
            Expr::SimpleNot(expression) => self.gen_simple_predicate(expression, true, ctx),
            Expr::SemanticAnd(code) => self.gen_semantic_predicate(code, false, ctx, env),
            Expr::SemanticNot(code) => self.gen_semantic_predicate(code, true, ctx, env),

            Expr::Optional(expression) => {
                let null = self.intern(Constant::Null)?;
                let inner = self.generate(expression, ctx.push(0), &mut Env::new())?;

                Ok(seq![
                    inner,
                    condition(op(IfError), seq![op(Pop), op1(Push, null)], vec![])?,
                ])
            }

            Expr::ZeroOrMore(expression) => {
                let empty = self.intern(Constant::EmptyArray)?;
                let inner = self.generate(expression, ctx.push(1), &mut Env::new())?;

                Ok(seq![
                    op1(Push, empty),
                    inner.clone(),
                    append_loop(inner)?,
                    op(Pop),
                ])
            }

            Expr::OneOrMore(expression) => {
                let empty = self.intern(Constant::EmptyArray)?;
                let failed = self.intern(Constant::Failed)?;
                let inner = self.generate(expression, ctx.push(1), &mut Env::new())?;

                Ok(seq![
                    op1(Push, empty),
                    inner.clone(),
                    condition(
                        op(IfNotError),
                        seq![append_loop(inner)?, op(Pop)],
                        seq![op(Pop), op(Pop), op1(Push, failed)],
                    )?,
                ])
            }

            Expr::Range {
                expression,
                min,
                max,
                delimiter,
            } => self.gen_range(expression, *min, *max, delimiter.as_deref(), ctx),

            Expr::RuleRef(name) => {
                let index = *self
                    .rule_indices
                    .get(name)
                    .ok_or_else(|| CompileError::undefined_rule(name))?;
                Ok(op1(Opcode::Rule, index))
            }

            Expr::Literal { value, ignore_case } => self.gen_literal(value, *ignore_case),

            Expr::Class {
                parts,
                inverted,
                ignore_case,
                raw_text,
            } => self.gen_class(parts, *inverted, *ignore_case, raw_text),

            Expr::Any => {
                let expected = self.intern(Constant::Expectation(Expectation::any()))?;

                condition(op(MatchAny), op1(AcceptN, 1), op1(Fail, expected))
            }
        }
    }

    /// Silences inner expectations and reports `name` instead on failure.
    fn gen_named<'e>(
        &mut self,
        name: &str,
        expression: &'e Expr,
        ctx: Context<'e>,
        env: &mut Env,
    ) -> Result<Code, CompileError> {
        let expected = self.intern(Constant::Expectation(Expectation::other(name)))?;
        let inner = self.generate(expression, ctx, env)?;

        // FAIL pushes its own sentinel, so the inner one is dropped first.
        Ok(seq![
            op(SilentFailsOn),
            inner,
            op(SilentFailsOff),
            condition(op(IfError), seq![op(Pop), op1(Fail, expected)], vec![])?,
        ])
    }

    /// Alternatives share the entry stack pointer but never labels.
    fn gen_choice(&mut self, alternatives: &[Expr], ctx: Context<'_>) -> Result<Code, CompileError> {
        let Some((first, rest)) = alternatives.split_first() else {
            let failed = self.intern(Constant::Failed)?;
            return Ok(op1(Push, failed));
        };

        let first_code = self.generate(first, ctx.push(0), &mut Env::new())?;
        if rest.is_empty() {
            return Ok(first_code);
        }

        let rest_code = self.gen_choice(rest, ctx)?;
        Ok(seq![
            first_code,
            condition(op(IfError), seq![op(Pop), rest_code], vec![])?,
        ])
    }

    fn gen_action<'e>(
        &mut self,
        expression: &'e Expr,
        code: &'e str,
        ctx: Context<'e>,
    ) -> Result<Code, CompileError> {
        let mut env = Env::new();

        // A non-empty sequence emits the call itself so that labels from all
        // of its elements are in scope.
        if matches!(expression, Expr::Sequence(elements) if !elements.is_empty()) {
            return self.generate(expression, ctx.push(0).with_action(code), &mut env);
        }

        let expression_code = self.generate(expression, ctx.push(1), &mut env)?;
        let function = self.intern_function(&env, code)?;

        Ok(seq![
            op(PushCurrPos),
            expression_code,
            condition(
                op(IfNotError),
                seq![
                    op1(ReportSavedPos, 1),
                    emit::call(function, 1, &env, ctx.sp + 2)?,
                ],
                vec![],
            )?,
            op(Nip),
        ])
    }

    fn gen_sequence<'e>(
        &mut self,
        elements: &'e [Expr],
        ctx: Context<'e>,
        env: &Env,
    ) -> Result<Code, CompileError> {
        // Outer labels stay visible inside; this sequence's own labels end
        // with it, since their slots are popped when it returns.
        let mut scope = env.clone();
        let failed = self.intern(Constant::Failed)?;
        let body = self.gen_elements(elements, 0, ctx.step(1), &mut scope, failed)?;

        Ok(seq![op(PushCurrPos), body])
    }

    /// Code for `elements[index..]`; `ctx.sp` is the slot of the last value
    /// pushed so far (the saved position when `index == 0`).
    fn gen_elements<'e>(
        &mut self,
        elements: &'e [Expr],
        index: usize,
        ctx: Context<'e>,
        env: &mut Env,
        failed: u32,
    ) -> Result<Code, CompileError> {
        let total = elements.len();

        if let Some(element) = elements.get(index) {
            let element_code = self.generate(element, ctx.push(0), env)?;
            let rest = self.gen_elements(elements, index + 1, ctx.step(1), env, failed)?;

            let processed = index + 1;
            let discard = if processed > 1 {
                op1(PopN, operand("element count", processed)?)
            } else {
                op(Pop)
            };

            return Ok(seq![
                element_code,
                condition(
                    op(IfNotError),
                    rest,
                    seq![discard, op(PopCurrPos), op1(Push, failed)],
                )?,
            ]);
        }

        let count = operand("element count", total)?;
        match ctx.action {
            Some(code) => {
                let function = self.intern_function(env, code)?;

                Ok(seq![
                    op1(ReportSavedPos, count),
                    emit::call(function, total, env, ctx.sp)?,
                    op(Nip),
                ])
            }
            None => Ok(seq![op1(Wrap, count), op(Nip)]),
        }
    }

    fn gen_simple_predicate(
        &mut self,
        expression: &Expr,
        negative: bool,
        ctx: Context<'_>,
    ) -> Result<Code, CompileError> {
        let undefined = self.intern(Constant::Undefined)?;
        let failed = self.intern(Constant::Failed)?;
        let inner = self.generate(expression, ctx.push(1), &mut Env::new())?;

        let (test, on_match, on_miss) = if negative {
            (IfError, Pop, PopCurrPos)
        } else {
            (IfNotError, PopCurrPos, Pop)
        };

        Ok(seq![
            op(PushCurrPos),
            op(SilentFailsOn),
            inner,
            op(SilentFailsOff),
            condition(
                op(test),
                seq![op(Pop), op(on_match), op1(Push, undefined)],
                seq![op(Pop), op(on_miss), op1(Push, failed)],
            )?,
        ])
    }

    fn gen_semantic_predicate(
        &mut self,
        code: &str,
        negative: bool,
        ctx: Context<'_>,
        env: &Env,
    ) -> Result<Code, CompileError> {
        let function = self.intern_function(env, code)?;
        let undefined = self.intern(Constant::Undefined)?;
        let failed = self.intern(Constant::Failed)?;

        let (on_true, on_false) = if negative {
            (failed, undefined)
        } else {
            (undefined, failed)
        };

        Ok(seq![
            op(ReportCurrPos),
            emit::call(function, 0, env, ctx.sp)?,
            condition(
                op(If),
                seq![op(Pop), op1(Push, on_true)],
                seq![op(Pop), op1(Push, on_false)],
            )?,
        ])
    }

    /// Bounded repetition with an optional delimiter.
    ///
    /// ```text
    ///   PUSH []                       stack: [ arr ]
    ///   <element>                            [ arr, elem ]
    ///   WHILE_NOT_ERROR {
    ///     APPEND                             [ arr ]
    ///     PUSH max
    ///     IF_ARRLEN_MAX { PUSH FAILED }      [ arr, FAILED ]
    ///     else          { <next element> }   [ arr, elem ]
    ///   }
    ///   POP                                  [ arr ]
    ///   PUSH min
    ///   IF_ARRLEN_MIN { POP; PUSH FAILED }   [ arr | FAILED ]
    /// ```
    fn gen_range(
        &mut self,
        expression: &Expr,
        min: Option<u32>,
        max: Option<u32>,
        delimiter: Option<&Expr>,
        ctx: Context<'_>,
    ) -> Result<Code, CompileError> {
        let empty = self.intern(Constant::EmptyArray)?;
        let failed = self.intern(Constant::Failed)?;
        let element = self.generate(expression, ctx.push(1), &mut Env::new())?;

        let next_element = match delimiter {
            Some(delimiter) => {
                let delimiter_code = self.generate(delimiter, ctx.push(2), &mut Env::new())?;

                // A failed element after a matched delimiter rewinds to before
                // the delimiter.
                seq![
                    op(PushCurrPos),
                    delimiter_code,
                    condition(
                        op(IfNotError),
                        seq![
                            op(Pop),
                            element.clone(),
                            condition(
                                op(IfError),
                                seq![op(Pop), op(PopCurrPos), op1(Push, failed)],
                                op(Nip),
                            )?,
                        ],
                        op(Nip),
                    )?,
                ]
            }
            None => element.clone(),
        };

        let min_index = self.intern(Constant::Bound(min))?;
        let max_index = self.intern(Constant::Bound(max))?;

        Ok(seq![
            op1(Push, empty),
            element,
            looped(
                op(WhileNotError),
                seq![
                    op(Append),
                    op1(Push, max_index),
                    condition(op(IfArrlenMax), op1(Push, failed), next_element)?,
                ],
            )?,
            op(Pop),
            op1(Push, min_index),
            condition(
                op(IfArrlenMin),
                seq![op(Pop), op1(Push, failed)],
                vec![],
            )?,
        ])
    }

    fn gen_literal(&mut self, value: &str, ignore_case: bool) -> Result<Code, CompileError> {
        if value.is_empty() {
            let empty = self.intern(Constant::String(String::new()))?;
            return Ok(op1(Push, empty));
        }

        let text = if ignore_case {
            value.to_lowercase()
        } else {
            value.to_string()
        };
        let string = self.intern(Constant::String(text))?;
        let expected = self.intern(Constant::Expectation(Expectation::literal(value)))?;

        // Case-sensitive matches push the constant itself; case-insensitive
        // ones must copy the input as written.
        if ignore_case {
            let len = operand("literal length", value.chars().count())?;
            condition(op1(MatchStringIc, string), op1(AcceptN, len), op1(Fail, expected))
        } else {
            condition(op1(MatchString, string), op1(AcceptString, string), op1(Fail, expected))
        }
    }

    fn gen_class(
        &mut self,
        parts: &[ClassPart],
        inverted: bool,
        ignore_case: bool,
        raw_text: &str,
    ) -> Result<Code, CompileError> {
        let class = self.intern(Constant::Class(CharClass {
            parts: parts.to_vec(),
            inverted,
            // Case folding is irrelevant for an empty set.
            ignore_case: ignore_case && !parts.is_empty(),
        }))?;
        let expected = self.intern(Constant::Expectation(Expectation::class(raw_text)))?;

        condition(op1(MatchRegexp, class), op1(AcceptN, 1), op1(Fail, expected))
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

fn append_loop(expression_code: Code) -> Result<Code, CompileError> {
    looped(op(WhileNotError), seq![op(Append), expression_code])
}
