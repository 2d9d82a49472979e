pub mod compile;
pub mod compile_error;
pub mod constant;
pub mod context;
pub mod disasm;
pub mod emit;
pub mod ir;
pub mod op;
pub mod stack_check;

pub use compile::{CompileOptions, Compiler};
pub use compile_error::CompileError;
pub use constant::{ActionFn, CharClass, Constant, Expectation};
pub use ir::{CompiledGrammar, CompiledRule};
pub use op::Opcode;
