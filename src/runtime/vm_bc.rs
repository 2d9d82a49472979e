use crate::bytecode::constant::{ActionFn, CharClass, Constant, Expectation};
use crate::bytecode::ir::CompiledGrammar;
use crate::bytecode::op::{Opcode, Shape};
use crate::lang::value::Value;
use crate::runtime::runtime_error::{ParseFailure, RuntimeError, stack_underflow, type_error};

#[derive(Debug, Clone)]
pub struct VmBcConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    pub max_stack_size: usize,
}

impl Default for VmBcConfig {
    fn default() -> Self {
        VmBcConfig {
            max_call_depth: 1000,
            max_steps: None,
            max_stack_size: 10_000,
        }
    }
}

/// What an action or semantic predicate sees besides its arguments.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub input: &'a str,
    /// Start of the text the action reports on (`REPORT_*_POS`).
    pub reported_pos: usize,
    pub pos: usize,
}

impl CallContext<'_> {
    /// Input between the reported position and the current position.
    pub fn text(&self) -> String {
        self.input
            .chars()
            .skip(self.reported_pos)
            .take(self.pos.saturating_sub(self.reported_pos))
            .collect()
    }
}

/// Runs user code for `CALL`.
///
/// `args` are the values of the labels in `action.params`, in order.
pub trait ActionHost {
    fn call(
        &mut self,
        action: &ActionFn,
        ctx: &CallContext<'_>,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError>;
}

/// Host for grammars without actions or semantic predicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoActions;

impl ActionHost for NoActions {
    fn call(
        &mut self,
        action: &ActionFn,
        _ctx: &CallContext<'_>,
        _args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        Err(RuntimeError::Host(format!(
            "no action host for {{ {} }}",
            action.code
        )))
    }
}

/// Result of running one rule over an input.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub value: Value,
    pub pos: usize,
    pub max_fail_pos: usize,
    /// Expectations recorded at `max_fail_pos`, in recording order.
    pub expected: Vec<Expectation>,
}

/// Instruction stream of the rule being executed.
#[derive(Clone, Copy)]
struct RuleCode<'g> {
    name: &'g str,
    words: &'g [u32],
}

/// Bytecode interpreter for compiled grammars.
///
/// Each rule invocation gets its own value stack; condition and loop bodies
/// are executed by recursing over their spans.
pub struct VmBc<'g, H> {
    grammar: &'g CompiledGrammar,
    host: H,
    config: VmBcConfig,

    input: String,
    chars: Vec<char>,
    pos: usize,
    reported_pos: usize,
    silent_fails: usize,
    max_fail_pos: usize,
    max_fail_expected: Vec<Expectation>,

    // Safety limits
    call_depth: usize,
    steps: usize,
}

impl<'g, H: ActionHost> VmBc<'g, H> {
    pub fn new(grammar: &'g CompiledGrammar, host: H) -> Self {
        Self::with_config(grammar, host, VmBcConfig::default())
    }

    pub fn with_config(grammar: &'g CompiledGrammar, host: H, config: VmBcConfig) -> Self {
        Self {
            grammar,
            host,
            config,
            input: String::new(),
            chars: Vec::new(),
            pos: 0,
            reported_pos: 0,
            silent_fails: 0,
            max_fail_pos: 0,
            max_fail_expected: Vec::new(),
            call_depth: 0,
            steps: 0,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn into_host(self) -> H {
        self.host
    }

    fn reset_execution_state(&mut self, input: &str) {
        self.input = input.to_string();
        self.chars = input.chars().collect();
        self.pos = 0;
        self.reported_pos = 0;
        self.silent_fails = 0;
        self.max_fail_pos = 0;
        self.max_fail_expected.clear();
        self.call_depth = 0;
        self.steps = 0;
    }

    /// Run rule `index` from the start of `input` without requiring that
    /// all of it is consumed.
    pub fn run_rule(&mut self, index: usize, input: &str) -> Result<Outcome, RuntimeError> {
        self.reset_execution_state(input);

        let value = self.exec_rule(index)?;

        Ok(Outcome {
            value,
            pos: self.pos,
            max_fail_pos: self.max_fail_pos,
            expected: self.max_fail_expected.clone(),
        })
    }

    /// Parse all of `input` with the rule named `start`.
    pub fn parse(&mut self, start: &str, input: &str) -> Result<Value, RuntimeError> {
        let index = self
            .grammar
            .rule_index(start)
            .ok_or_else(|| RuntimeError::UnknownRule(start.to_string()))?;

        let outcome = self.run_rule(index, input)?;
        if !outcome.value.is_failed() && outcome.pos == self.chars.len() {
            return Ok(outcome.value);
        }

        if !outcome.value.is_failed() {
            self.record_failure(&Expectation::other("end of input"));
        }

        Err(ParseFailure {
            offset: self.max_fail_pos,
            expected: self.max_fail_expected.clone(),
            found: self.chars.get(self.max_fail_pos).copied(),
        }
        .into())
    }

    // Execution

    fn check_limits(&mut self, stack_len: usize) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(RuntimeError::StepLimit(max));
            }
        }

        if stack_len > self.config.max_stack_size {
            return Err(RuntimeError::StackLimit(self.config.max_stack_size));
        }

        Ok(())
    }

    fn exec_rule(&mut self, index: usize) -> Result<Value, RuntimeError> {
        let grammar = self.grammar;
        let rule = grammar
            .rules
            .get(index)
            .ok_or(RuntimeError::RuleIndex(index))?;

        self.call_depth += 1;
        if self.call_depth > self.config.max_call_depth {
            return Err(RuntimeError::CallDepth {
                limit: self.config.max_call_depth,
                rule: rule.name.clone(),
            });
        }

        tracing::trace!(rule = %rule.name, pos = self.pos, "enter rule");

        let code = RuleCode {
            name: &rule.name,
            words: &rule.bytecode,
        };
        let mut stack = Vec::new();
        let result = self.exec_span(code, 0, code.words.len(), &mut stack);
        self.call_depth -= 1;
        result?;

        let value = stack.pop().ok_or_else(|| stack_underflow(1, 0))?;
        tracing::trace!(rule = %rule.name, pos = self.pos, failed = value.is_failed(), "exit rule");

        Ok(value)
    }

    fn exec_span(
        &mut self,
        code: RuleCode<'g>,
        start: usize,
        end: usize,
        stack: &mut Vec<Value>,
    ) -> Result<(), RuntimeError> {
        let mut ip = start;

        while ip < end {
            self.check_limits(stack.len())?;

            let word = code.words[ip];
            let op = Opcode::from_u32(word).ok_or_else(|| RuntimeError::BadOpcode {
                rule: code.name.to_string(),
                ip,
                word,
            })?;

            let operand = |offset: usize| -> Result<u32, RuntimeError> {
                if ip + offset < end {
                    Ok(code.words[ip + offset])
                } else {
                    Err(RuntimeError::Truncated {
                        rule: code.name.to_string(),
                        ip,
                        op,
                    })
                }
            };

            match op.shape() {
                Shape::Condition { leading } => {
                    let arg = if leading > 0 { Some(operand(1)?) } else { None };
                    let then_len = operand(leading + 1)? as usize;
                    let else_len = operand(leading + 2)? as usize;
                    let then_start = ip + leading + 3;
                    let else_start = then_start + then_len;
                    let next = else_start + else_len;
                    if next > end {
                        return Err(RuntimeError::SpanOverrun {
                            rule: code.name.to_string(),
                            ip,
                            op,
                        });
                    }

                    if self.test(op, arg, stack)? {
                        self.exec_span(code, then_start, else_start, stack)?;
                    } else {
                        self.exec_span(code, else_start, next, stack)?;
                    }
                    ip = next;
                }

                Shape::Loop => {
                    let body_start = ip + 2;
                    let next = body_start + operand(1)? as usize;
                    if next > end {
                        return Err(RuntimeError::SpanOverrun {
                            rule: code.name.to_string(),
                            ip,
                            op,
                        });
                    }

                    // WHILE_NOT_ERROR
                    while !top(stack)?.is_failed() {
                        self.exec_span(code, body_start, next, stack)?;
                    }
                    ip = next;
                }

                Shape::Call => {
                    let function = operand(1)?;
                    let pop_count = operand(2)? as usize;
                    let param_count = operand(3)? as usize;

                    let mut args = Vec::with_capacity(param_count);
                    for i in 0..param_count {
                        let offset = operand(4 + i)? as usize;
                        args.push(peek(stack, offset)?.clone());
                    }

                    let result = self.call(function, args)?;
                    pop_n(stack, pop_count)?;
                    stack.push(result);
                    ip += 4 + param_count;
                }

                Shape::Plain(count) => {
                    let arg = if count == 1 { operand(1)? } else { 0 };
                    self.exec_plain(op, arg, stack)?;
                    ip += 1 + count;
                }
            }
        }

        Ok(())
    }

    /// Evaluates the test of a condition opcode.
    fn test(&mut self, op: Opcode, arg: Option<u32>, stack: &mut Vec<Value>) -> Result<bool, RuntimeError> {
        use Opcode::*;

        Ok(match op {
            If => top(stack)?.is_truthy(),
            IfError => top(stack)?.is_failed(),
            IfNotError => !top(stack)?.is_failed(),

            IfArrlenMin | IfArrlenMax => {
                let bound = match pop(stack)? {
                    Value::Bound(bound) => bound,
                    other => return Err(type_error("bound", other.type_name())),
                };
                let len = match top(stack)? {
                    Value::Array(items) => items.len(),
                    other => return Err(type_error("array", other.type_name())),
                };

                match (op, bound) {
                    (IfArrlenMin, Some(min)) => len < min as usize,
                    (IfArrlenMax, Some(max)) => len >= max as usize,
                    _ => false,
                }
            }

            MatchAny => self.pos < self.chars.len(),

            MatchString => {
                let expected = self.const_string(arg)?;
                let n = expected.chars().count();
                self.chars
                    .get(self.pos..self.pos + n)
                    .is_some_and(|window| window.iter().copied().eq(expected.chars()))
            }

            MatchStringIc => {
                // Folding may change the character count, so input is
                // lowered one character at a time until the constant ends.
                let expected = self.const_string(arg)?;
                let rest = self.chars.get(self.pos..).unwrap_or_default();
                let mut folded = rest.iter().flat_map(|c| c.to_lowercase());
                expected.chars().all(|e| folded.next() == Some(e))
            }

            MatchRegexp => {
                let class = self.const_class(arg)?;
                self.chars
                    .get(self.pos)
                    .is_some_and(|&c| class.matches(c))
            }

            _ => false,
        })
    }

    fn exec_plain(&mut self, op: Opcode, arg: u32, stack: &mut Vec<Value>) -> Result<(), RuntimeError> {
        use Opcode::*;

        match op {
            Push => {
                let value = self.const_value(arg)?;
                stack.push(value);
            }
            PushCurrPos => stack.push(Value::Pos(self.pos)),
            Pop => {
                pop(stack)?;
            }
            PopCurrPos => {
                self.pos = pop_pos(stack)?;
            }
            PopN => pop_n(stack, arg as usize)?,
            Nip => {
                let b = pop(stack)?;
                pop(stack)?;
                stack.push(b);
            }
            Append => {
                let item = pop(stack)?;
                match stack.last_mut() {
                    Some(Value::Array(items)) => items.push(item),
                    Some(other) => return Err(type_error("array", other.type_name())),
                    None => return Err(stack_underflow(2, 1)),
                }
            }
            Wrap => {
                let n = arg as usize;
                if stack.len() < n {
                    return Err(stack_underflow(n, stack.len()));
                }
                let items = stack.split_off(stack.len() - n);
                stack.push(Value::Array(items));
            }
            Text => {
                pop(stack)?;
                let start = match top(stack)? {
                    Value::Pos(p) => *p,
                    other => return Err(type_error("position", other.type_name())),
                };
                stack.push(Value::String(self.slice(start, self.pos)));
            }

            AcceptN => {
                let end = (self.pos + arg as usize).min(self.chars.len());
                stack.push(Value::String(self.slice(self.pos, end)));
                self.pos = end;
            }
            AcceptString => {
                let text = self.const_string(Some(arg))?.to_string();
                self.pos += text.chars().count();
                stack.push(Value::String(text));
            }
            Fail => {
                let grammar = self.grammar;
                let expected = match grammar.constant(arg) {
                    Some(Constant::Expectation(e)) => e,
                    _ => {
                        return Err(RuntimeError::BadConstant {
                            index: arg,
                            expected: "an expectation",
                        });
                    }
                };
                stack.push(Value::Failed);
                if self.silent_fails == 0 {
                    self.record_failure(expected);
                }
            }

            ReportSavedPos => {
                self.reported_pos = match peek(stack, arg as usize)? {
                    Value::Pos(p) => *p,
                    other => return Err(type_error("position", other.type_name())),
                };
            }
            ReportCurrPos => self.reported_pos = self.pos,

            Rule => {
                let value = self.exec_rule(arg as usize)?;
                stack.push(value);
            }

            SilentFailsOn => self.silent_fails += 1,
            SilentFailsOff => self.silent_fails = self.silent_fails.saturating_sub(1),

            // Structured opcodes are dispatched by shape.
            If | IfError | IfNotError | IfArrlenMin | IfArrlenMax | WhileNotError | MatchAny
            | MatchString | MatchStringIc | MatchRegexp | Call => {}
        }

        Ok(())
    }

    fn call(&mut self, function: u32, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let grammar = self.grammar;
        let action = match grammar.constant(function) {
            Some(Constant::Function(action)) => action,
            _ => {
                return Err(RuntimeError::BadConstant {
                    index: function,
                    expected: "a function",
                });
            }
        };

        let ctx = CallContext {
            input: &self.input,
            reported_pos: self.reported_pos,
            pos: self.pos,
        };
        self.host.call(action, &ctx, args)
    }

    fn record_failure(&mut self, expected: &Expectation) {
        if self.pos < self.max_fail_pos {
            return;
        }

        if self.pos > self.max_fail_pos {
            self.max_fail_pos = self.pos;
            self.max_fail_expected.clear();
        }

        tracing::debug!(pos = self.pos, expected = expected.description(), "recorded expectation");
        self.max_fail_expected.push(expected.clone());
    }

    fn slice(&self, start: usize, end: usize) -> String {
        self.chars
            .get(start..end)
            .map(|chars| chars.iter().collect())
            .unwrap_or_default()
    }

    // Constants

    fn const_value(&self, index: u32) -> Result<Value, RuntimeError> {
        Ok(match self.grammar.constant(index) {
            Some(Constant::Failed) => Value::Failed,
            Some(Constant::Undefined) => Value::Undefined,
            Some(Constant::Null) => Value::Null,
            Some(Constant::EmptyArray) => Value::Array(Vec::new()),
            Some(Constant::String(s)) => Value::String(s.clone()),
            Some(Constant::Bound(b)) => Value::Bound(*b),
            _ => {
                return Err(RuntimeError::BadConstant {
                    index,
                    expected: "a pushable value",
                });
            }
        })
    }

    fn const_string(&self, index: Option<u32>) -> Result<&'g str, RuntimeError> {
        let grammar = self.grammar;
        let index = index.unwrap_or(u32::MAX);
        match grammar.constant(index) {
            Some(Constant::String(s)) => Ok(s),
            _ => Err(RuntimeError::BadConstant {
                index,
                expected: "a string",
            }),
        }
    }

    fn const_class(&self, index: Option<u32>) -> Result<&'g CharClass, RuntimeError> {
        let grammar = self.grammar;
        let index = index.unwrap_or(u32::MAX);
        match grammar.constant(index) {
            Some(Constant::Class(class)) => Ok(class),
            _ => Err(RuntimeError::BadConstant {
                index,
                expected: "a character class",
            }),
        }
    }
}

// Stack operations

fn pop(stack: &mut Vec<Value>) -> Result<Value, RuntimeError> {
    stack.pop().ok_or_else(|| stack_underflow(1, 0))
}

fn pop_n(stack: &mut Vec<Value>, n: usize) -> Result<(), RuntimeError> {
    if stack.len() < n {
        return Err(stack_underflow(n, stack.len()));
    }
    stack.truncate(stack.len() - n);
    Ok(())
}

fn pop_pos(stack: &mut Vec<Value>) -> Result<usize, RuntimeError> {
    match pop(stack)? {
        Value::Pos(p) => Ok(p),
        other => Err(type_error("position", other.type_name())),
    }
}

fn top(stack: &[Value]) -> Result<&Value, RuntimeError> {
    stack.last().ok_or_else(|| stack_underflow(1, 0))
}

/// Value `offset` slots below the top (0 = top).
fn peek(stack: &[Value], offset: usize) -> Result<&Value, RuntimeError> {
    stack
        .len()
        .checked_sub(offset + 1)
        .map(|i| &stack[i])
        .ok_or_else(|| stack_underflow(offset + 1, stack.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::{CompileOptions, Compiler};
    use crate::lang::node::{ClassPart, Expr, Grammar, Rule};
    use pretty_assertions::assert_eq;

    // ============================================================
    // Test Helpers
    // ============================================================

    fn compile(rules: Vec<Rule>) -> CompiledGrammar {
        crate::test_utils::init_test_logging();
        Compiler::with_options(CompileOptions { verify_stack: true })
            .compile_grammar(&Grammar::new(rules))
            .expect("grammar should compile")
    }

    fn single(expr: Expr) -> CompiledGrammar {
        compile(vec![Rule::new("start", expr)])
    }

    fn run(grammar: &CompiledGrammar, input: &str) -> Outcome {
        VmBc::new(grammar, NoActions)
            .run_rule(0, input)
            .expect("execution should succeed")
    }

    fn digit() -> Expr {
        Expr::class(vec![ClassPart::Range('0', '9')], false, false)
    }

    fn s(text: &str) -> Value {
        Value::String(text.to_string())
    }

    /// Records every call and answers with the arguments as an array.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<(String, Vec<Value>, String)>,
    }

    impl ActionHost for Recorder {
        fn call(
            &mut self,
            action: &ActionFn,
            ctx: &CallContext<'_>,
            args: Vec<Value>,
        ) -> Result<Value, RuntimeError> {
            self.calls
                .push((action.code.clone(), args.clone(), ctx.text()));

            Ok(match action.code.as_str() {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                "is_a" => Value::Bool(args.first() == Some(&s("a"))),
                _ => Value::Array(args),
            })
        }
    }

    /// Integer arithmetic over labels `l`, `r`, `d` and `e`.
    struct Calc;

    impl ActionHost for Calc {
        fn call(
            &mut self,
            action: &ActionFn,
            _ctx: &CallContext<'_>,
            args: Vec<Value>,
        ) -> Result<Value, RuntimeError> {
            let int = |v: &Value| match v {
                Value::Integer(n) => Ok(*n),
                other => Err(RuntimeError::Host(format!("not a number: {}", other))),
            };

            match (action.code.as_str(), args.as_slice()) {
                ("add", [l, r]) => Ok(Value::Integer(int(l)? + int(r)?)),
                ("mul", [l, r]) => Ok(Value::Integer(int(l)? * int(r)?)),
                ("int", [Value::String(d)]) => d
                    .parse()
                    .map(Value::Integer)
                    .map_err(|e| RuntimeError::Host(format!("{}", e))),
                ("paren", [e]) => Ok(e.clone()),
                (code, args) => Err(RuntimeError::Host(format!("{} {:?}", code, args))),
            }
        }
    }

    // ============================================================
    // Atoms
    // ============================================================

    #[test]
    fn test_literal_consumes_exactly_its_length() {
        let grammar = single(Expr::literal("abc"));

        let outcome = run(&grammar, "abcd");
        assert_eq!(outcome.value, s("abc"));
        assert_eq!(outcome.pos, 3);
    }

    #[test]
    fn test_literal_failure_records_expectation() {
        let grammar = single(Expr::literal("abc"));

        let outcome = run(&grammar, "xyz");
        assert_eq!(outcome.value, Value::Failed);
        assert_eq!(outcome.pos, 0);
        assert_eq!(outcome.max_fail_pos, 0);
        assert_eq!(outcome.expected, vec![Expectation::literal("abc")]);
    }

    #[test]
    fn test_literal_ignore_case_returns_input_text() {
        let grammar = single(Expr::literal_ic("select"));

        let outcome = run(&grammar, "SeLeCt *");
        assert_eq!(outcome.value, s("SeLeCt"));
        assert_eq!(outcome.pos, 6);
    }

    #[test]
    fn test_literal_ignore_case_with_expanding_lowercase() {
        // 'İ' lowers to two characters.
        let grammar = single(Expr::literal_ic("İx"));

        let outcome = run(&grammar, "İXy");
        assert_eq!(outcome.value, s("İX"));
        assert_eq!(outcome.pos, 2);
        assert_eq!(run(&grammar, "Ix").value, Value::Failed);
    }

    #[test]
    fn test_any_at_end_of_input_fails() {
        let grammar = single(Expr::Any);

        assert_eq!(run(&grammar, "é").value, s("é"));
        assert_eq!(run(&grammar, "").value, Value::Failed);
    }

    #[test]
    fn test_empty_literal_matches_without_consuming() {
        let grammar = single(Expr::literal(""));

        let outcome = run(&grammar, "abc");
        assert_eq!(outcome.value, s(""));
        assert_eq!(outcome.pos, 0);
    }

    // ============================================================
    // Combinators
    // ============================================================

    #[test]
    fn test_sequence_failure_restores_position() {
        let grammar = single(Expr::Sequence(vec![Expr::literal("a"), Expr::literal("b")]));

        let outcome = run(&grammar, "ac");
        assert_eq!(outcome.value, Value::Failed);
        assert_eq!(outcome.pos, 0);
        assert_eq!(outcome.max_fail_pos, 1);
        assert_eq!(outcome.expected, vec![Expectation::literal("b")]);

        let outcome = run(&grammar, "ab");
        assert_eq!(outcome.value, Value::Array(vec![s("a"), s("b")]));
    }

    #[test]
    fn test_choice_takes_first_match() {
        let grammar = single(Expr::Choice(vec![
            Expr::literal("ab"),
            Expr::literal("a"),
        ]));

        assert_eq!(run(&grammar, "ab").value, s("ab"));
        assert_eq!(run(&grammar, "ac").value, s("a"));
    }

    #[test]
    fn test_optional_yields_null() {
        let grammar = single(Expr::optional(Expr::literal("x")));

        let outcome = run(&grammar, "y");
        assert_eq!(outcome.value, Value::Null);
        assert_eq!(outcome.pos, 0);
    }

    #[test]
    fn test_repetitions() {
        let many = single(Expr::zero_or_more(digit()));
        assert_eq!(run(&many, "12a").value, Value::Array(vec![s("1"), s("2")]));
        assert_eq!(run(&many, "a").value, Value::Array(vec![]));

        let some = single(Expr::one_or_more(digit()));
        assert_eq!(run(&some, "7").value, Value::Array(vec![s("7")]));
        assert_eq!(run(&some, "a").value, Value::Failed);
    }

    #[test]
    fn test_text_returns_matched_slice() {
        let grammar = single(Expr::text(Expr::Sequence(vec![
            Expr::one_or_more(digit()),
            Expr::literal("."),
            Expr::one_or_more(digit()),
        ])));

        let outcome = run(&grammar, "3.14;");
        assert_eq!(outcome.value, s("3.14"));
        assert_eq!(outcome.pos, 4);
    }

    #[test]
    fn test_predicates_never_consume() {
        let and = single(Expr::Sequence(vec![
            Expr::simple_and(Expr::literal("ab")),
            Expr::literal("a"),
        ]));
        let outcome = run(&and, "ab");
        assert_eq!(outcome.value, Value::Array(vec![Value::Undefined, s("a")]));
        assert_eq!(outcome.pos, 1);
        assert_eq!(run(&and, "ac").value, Value::Failed);

        let not = single(Expr::simple_not(Expr::literal("x")));
        let outcome = run(&not, "ab");
        assert_eq!(outcome.value, Value::Undefined);
        assert_eq!(outcome.pos, 0);

        let outcome = run(&not, "xb");
        assert_eq!(outcome.value, Value::Failed);
        assert_eq!(outcome.pos, 0);
    }

    #[test]
    fn test_predicate_failures_are_silent() {
        let grammar = single(Expr::Sequence(vec![
            Expr::simple_not(Expr::literal("x")),
            Expr::literal("y"),
        ]));

        let outcome = run(&grammar, "z");
        assert_eq!(outcome.expected, vec![Expectation::literal("y")]);
    }

    // ============================================================
    // Range
    // ============================================================

    #[test]
    fn test_range_stops_at_max() {
        let grammar = single(Expr::range(Expr::literal("a"), Some(2), Some(4), None));

        let outcome = run(&grammar, "aaaaaa");
        assert_eq!(outcome.value, Value::Array(vec![s("a"); 4]));
        assert_eq!(outcome.pos, 4);
    }

    #[test]
    fn test_range_below_min_fails() {
        let grammar = single(Expr::range(Expr::literal("a"), Some(2), Some(4), None));

        assert_eq!(run(&grammar, "a").value, Value::Failed);
        assert_eq!(
            run(&grammar, "aa").value,
            Value::Array(vec![s("a"), s("a")])
        );
    }

    #[test]
    fn test_range_delimiter_is_not_consumed_without_element() {
        let grammar = single(Expr::range(digit(), None, None, Some(Expr::literal(","))));

        let outcome = run(&grammar, "1,2,x");
        assert_eq!(outcome.value, Value::Array(vec![s("1"), s("2")]));
        assert_eq!(outcome.pos, 3);
    }

    #[test]
    fn test_range_exact_count() {
        let grammar = single(Expr::range(digit(), Some(3), Some(3), None));

        let outcome = run(&grammar, "12345");
        assert_eq!(outcome.value, Value::Array(vec![s("1"), s("2"), s("3")]));
        assert_eq!(outcome.pos, 3);
    }

    // ============================================================
    // Actions
    // ============================================================

    #[test]
    fn test_action_receives_labels_in_order() {
        let grammar = single(Expr::action(
            Expr::Sequence(vec![
                Expr::labeled("a", digit()),
                Expr::literal("-"),
                Expr::labeled("b", digit()),
            ]),
            "pair",
        ));

        let mut vm = VmBc::new(&grammar, Recorder::default());
        let outcome = vm.run_rule(0, "1-2").unwrap();

        assert_eq!(outcome.value, Value::Array(vec![s("1"), s("2")]));
        assert_eq!(
            vm.into_host().calls,
            vec![("pair".to_string(), vec![s("1"), s("2")], "1-2".to_string())]
        );
    }

    #[test]
    fn test_action_is_skipped_on_failure() {
        let grammar = single(Expr::action(
            Expr::Sequence(vec![Expr::labeled("a", digit()), Expr::literal("!")]),
            "never",
        ));

        let mut vm = VmBc::new(&grammar, Recorder::default());
        let outcome = vm.run_rule(0, "1?").unwrap();

        assert_eq!(outcome.value, Value::Failed);
        assert!(vm.host().calls.is_empty());
    }

    #[test]
    fn test_action_over_empty_sequence_runs_once() {
        let grammar = single(Expr::action(Expr::Sequence(vec![]), "unit"));

        let mut vm = VmBc::new(&grammar, Recorder::default());
        vm.run_rule(0, "").unwrap();

        assert_eq!(vm.host().calls.len(), 1);
    }

    #[test]
    fn test_semantic_predicate_sees_label() {
        let grammar = single(Expr::Sequence(vec![
            Expr::labeled("c", Expr::Any),
            Expr::SemanticAnd("is_a".into()),
        ]));

        let mut vm = VmBc::new(&grammar, Recorder::default());
        assert_eq!(
            vm.run_rule(0, "a").unwrap().value,
            Value::Array(vec![s("a"), Value::Undefined])
        );
        assert_eq!(vm.run_rule(0, "b").unwrap().value, Value::Failed);
    }

    #[test]
    fn test_action_ignores_labels_of_nested_sequence() {
        let grammar = single(Expr::action(
            Expr::Sequence(vec![
                Expr::Sequence(vec![Expr::labeled("l", Expr::Any), Expr::literal("b")]),
                Expr::labeled("m", Expr::literal("c")),
            ]),
            "outer",
        ));

        let params: Vec<_> = grammar
            .consts
            .iter()
            .filter_map(|c| match c {
                Constant::Function(f) => Some(f.params.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(params, vec![vec!["m".to_string()]]);

        let mut vm = VmBc::new(&grammar, Recorder::default());
        let outcome = vm.run_rule(0, "abc").unwrap();

        assert_eq!(outcome.value, Value::Array(vec![s("c")]));
        assert_eq!(
            vm.into_host().calls,
            vec![("outer".to_string(), vec![s("c")], "abc".to_string())]
        );
    }

    #[test]
    fn test_predicate_after_nested_sequence_compiles() {
        let grammar = single(Expr::Sequence(vec![
            Expr::Sequence(vec![Expr::labeled("l", Expr::Any), Expr::literal("b")]),
            Expr::SemanticAnd("true".into()),
        ]));

        let mut vm = VmBc::new(&grammar, Recorder::default());
        assert_eq!(
            vm.run_rule(0, "ab").unwrap().value,
            Value::Array(vec![Value::Array(vec![s("a"), s("b")]), Value::Undefined])
        );
        assert_eq!(vm.into_host().calls[0].1, Vec::<Value>::new());
    }

    #[test]
    fn test_nested_predicate_sees_outer_label() {
        let grammar = single(Expr::Sequence(vec![
            Expr::labeled("c", Expr::Any),
            Expr::Sequence(vec![Expr::literal("b"), Expr::SemanticAnd("is_a".into())]),
        ]));

        let mut vm = VmBc::new(&grammar, Recorder::default());
        assert_eq!(
            vm.run_rule(0, "ab").unwrap().value,
            Value::Array(vec![
                s("a"),
                Value::Array(vec![s("b"), Value::Undefined]),
            ])
        );
        assert_eq!(vm.host().calls[0].1, vec![s("a")]);
        assert_eq!(vm.run_rule(0, "bb").unwrap().value, Value::Failed);
    }

    #[test]
    fn test_semantic_not() {
        let grammar = single(Expr::SemanticNot("false".into()));
        let mut vm = VmBc::new(&grammar, Recorder::default());

        assert_eq!(vm.run_rule(0, "").unwrap().value, Value::Undefined);
    }

    #[test]
    fn test_missing_host_is_an_error() {
        let grammar = single(Expr::action(Expr::Any, "x"));
        let err = VmBc::new(&grammar, NoActions).run_rule(0, "a").unwrap_err();

        assert_eq!(err.to_string(), "runtime error: action failed: no action host for { x }");
    }

    #[test]
    fn test_arithmetic_grammar() {
        let grammar = compile(vec![
            Rule::new(
                "additive",
                Expr::Choice(vec![
                    Expr::action(
                        Expr::Sequence(vec![
                            Expr::labeled("l", Expr::rule_ref("multiplicative")),
                            Expr::literal("+"),
                            Expr::labeled("r", Expr::rule_ref("additive")),
                        ]),
                        "add",
                    ),
                    Expr::rule_ref("multiplicative"),
                ]),
            ),
            Rule::new(
                "multiplicative",
                Expr::Choice(vec![
                    Expr::action(
                        Expr::Sequence(vec![
                            Expr::labeled("l", Expr::rule_ref("primary")),
                            Expr::literal("*"),
                            Expr::labeled("r", Expr::rule_ref("multiplicative")),
                        ]),
                        "mul",
                    ),
                    Expr::rule_ref("primary"),
                ]),
            ),
            Rule::new(
                "primary",
                Expr::Choice(vec![
                    Expr::action(
                        Expr::labeled("d", Expr::text(Expr::one_or_more(digit()))),
                        "int",
                    ),
                    Expr::action(
                        Expr::Sequence(vec![
                            Expr::literal("("),
                            Expr::labeled("e", Expr::rule_ref("additive")),
                            Expr::literal(")"),
                        ]),
                        "paren",
                    ),
                ]),
            ),
        ]);

        let mut vm = VmBc::new(&grammar, Calc);
        assert_eq!(vm.parse("additive", "2*(3+4)").unwrap(), Value::Integer(14));
        assert_eq!(vm.parse("additive", "1+2*3").unwrap(), Value::Integer(7));

        let err = vm.parse("additive", "1+").unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"Expected "(" or [0-9] but end of input found."#
        );
    }

    // ============================================================
    // Failure reporting
    // ============================================================

    #[test]
    fn test_named_replaces_inner_expectations() {
        let grammar = single(Expr::named("digit", digit()));

        let err = VmBc::new(&grammar, NoActions).parse("start", "x").unwrap_err();
        match err {
            RuntimeError::Syntax(failure) => {
                assert_eq!(failure.offset, 0);
                assert_eq!(failure.expected, vec![Expectation::other("digit")]);
                assert_eq!(failure.found, Some('x'));
            }
            other => panic!("expected syntax error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_requires_full_consumption() {
        let grammar = single(Expr::literal("abc"));
        let mut vm = VmBc::new(&grammar, NoActions);

        assert_eq!(vm.parse("start", "abc").unwrap(), s("abc"));
        assert_eq!(
            vm.parse("start", "abcd").unwrap_err().to_string(),
            r#"Expected end of input but "d" found."#
        );
    }

    #[test]
    fn test_expectations_kept_only_at_furthest_position() {
        let grammar = single(Expr::Choice(vec![
            Expr::Sequence(vec![Expr::literal("a"), Expr::literal("b")]),
            Expr::Sequence(vec![Expr::literal("a"), Expr::literal("c")]),
            Expr::literal("d"),
        ]));

        let outcome = run(&grammar, "ax");
        assert_eq!(outcome.max_fail_pos, 1);
        assert_eq!(
            outcome.expected,
            vec![Expectation::literal("b"), Expectation::literal("c")]
        );
    }

    #[test]
    fn test_unknown_start_rule() {
        let grammar = single(Expr::Any);
        let err = VmBc::new(&grammar, NoActions).parse("nope", "a").unwrap_err();

        assert_eq!(err, RuntimeError::UnknownRule("nope".into()));
    }

    // ============================================================
    // Limits and malformed code
    // ============================================================

    #[test]
    fn test_left_recursion_hits_call_depth_limit() {
        let grammar = single(Expr::rule_ref("start"));
        let config = VmBcConfig {
            max_call_depth: 50,
            ..VmBcConfig::default()
        };

        let err = VmBc::with_config(&grammar, NoActions, config)
            .run_rule(0, "a")
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::CallDepth {
                limit: 50,
                rule: "start".into(),
            }
        );
    }

    #[test]
    fn test_step_limit() {
        let grammar = single(Expr::zero_or_more(Expr::Any));
        let config = VmBcConfig {
            max_steps: Some(10),
            ..VmBcConfig::default()
        };

        let err = VmBc::with_config(&grammar, NoActions, config)
            .run_rule(0, "aaaaaaaaaa")
            .unwrap_err();
        assert_eq!(err, RuntimeError::StepLimit(10));
    }

    #[test]
    fn test_bad_opcode() {
        let grammar = CompiledGrammar {
            rules: vec![crate::bytecode::ir::CompiledRule {
                name: "broken".into(),
                bytecode: vec![1, 42],
            }],
            consts: vec![],
        };

        let err = VmBc::new(&grammar, NoActions).run_rule(0, "").unwrap_err();
        assert_eq!(
            err,
            RuntimeError::BadOpcode {
                rule: "broken".into(),
                ip: 1,
                word: 42,
            }
        );
    }

    #[test]
    fn test_stack_underflow() {
        let grammar = CompiledGrammar {
            rules: vec![crate::bytecode::ir::CompiledRule {
                name: "broken".into(),
                bytecode: vec![Opcode::Nip.word()],
            }],
            consts: vec![],
        };

        let err = VmBc::new(&grammar, NoActions).run_rule(0, "").unwrap_err();
        assert!(matches!(err, RuntimeError::StackUnderflow { .. }));
    }
}
