//! Instruction sequence builders.
//!
//! Control flow is encoded as length-prefixed spans, so every construct is
//! complete as soon as its bodies are generated and no patching pass is
//! needed.

use crate::bytecode::compile_error::CompileError;
use crate::bytecode::context::Env;
use crate::bytecode::op::Opcode;

pub type Code = Vec<u32>;

/// Concatenate instruction sequences.
macro_rules! seq {
    ($($part:expr),* $(,)?) => {{
        let mut out: $crate::bytecode::emit::Code = Vec::new();
        $( out.extend($part); )*
        out
    }};
}
pub(crate) use seq;

/// Operand-less instruction.
pub fn op(op: Opcode) -> Code {
    vec![op.word()]
}

/// Instruction with a single operand.
pub fn op1(op: Opcode, operand: u32) -> Code {
    vec![op.word(), operand]
}

pub fn operand(what: &'static str, value: usize) -> Result<u32, CompileError> {
    u32::try_from(value).map_err(|_| CompileError::overflow(what, value))
}

/// `test ++ [len(then), len(else)] ++ then ++ else`
pub fn condition(test: Code, then_code: Code, else_code: Code) -> Result<Code, CompileError> {
    let then_len = operand("span length", then_code.len())?;
    let else_len = operand("span length", else_code.len())?;

    Ok(seq![test, [then_len, else_len], then_code, else_code])
}

/// `test ++ [len(body)] ++ body`
pub fn looped(test: Code, body: Code) -> Result<Code, CompileError> {
    let body_len = operand("span length", body.len())?;

    Ok(seq![test, [body_len], body])
}

/// `CALL f, delta, pc, p1..pc` with parameters bound from `env` at `sp`.
pub fn call(function: u32, delta: usize, env: &Env, sp: i32) -> Result<Code, CompileError> {
    let params = env.offsets(sp)?;
    let delta = operand("pop count", delta)?;
    let count = operand("parameter count", params.len())?;

    Ok(seq![[Opcode::Call.word(), function, delta, count], params])
}
