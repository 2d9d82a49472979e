pub mod runtime_error;
pub mod vm_bc;

pub use runtime_error::{ParseFailure, RuntimeError};
pub use vm_bc::{ActionHost, CallContext, NoActions, Outcome, VmBc, VmBcConfig};
