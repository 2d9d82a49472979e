use crate::bytecode::op::{Opcode, Shape};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stack-check error at ip={ip}: {message}")]
pub struct StackCheckError {
    pub ip: usize,
    pub message: String,
}

impl StackCheckError {
    fn new(ip: usize, message: impl Into<String>) -> Self {
        Self {
            ip,
            message: message.into(),
        }
    }
}

/// Returns (pops, pushes) for an instruction with plain operands.
fn effect(op: Opcode, operand: Option<u32>) -> (i32, i32) {
    use Opcode::*;
    let n = operand.unwrap_or(0) as i32;
    match op {
        Push | PushCurrPos => (0, 1),
        Pop | PopCurrPos => (1, 0),
        PopN => (n, 0),
        Nip => (2, 1),
        Append => (2, 1),
        Wrap => (n, 1),
        // ( pos x -- pos text )
        Text => (2, 2),

        AcceptN | AcceptString | Fail | Rule => (0, 1),

        // Reads stack[top - p] without popping.
        ReportSavedPos => (n + 1, n + 1),
        ReportCurrPos | SilentFailsOn | SilentFailsOff => (0, 0),

        // Structured opcodes are handled by the walker.
        If | IfError | IfNotError | IfArrlenMin | IfArrlenMax | WhileNotError | MatchAny
        | MatchString | MatchStringIc | MatchRegexp | Call => (0, 0),
    }
}

/// Walks `code` from an initial stack height and returns the final height.
///
/// Both bodies of every condition are followed and must leave the same
/// height; loop bodies must leave the height unchanged. Jumps are spans, so
/// the walk is a single structural pass.
pub fn stack_effect(code: &[u32], initial_height: i32) -> Result<i32, StackCheckError> {
    walk(code, 0, code.len(), initial_height)
}

/// Checks the rule contract: from an empty frame, exactly one value is left.
pub fn check_rule(code: &[u32]) -> Result<(), StackCheckError> {
    let height = stack_effect(code, 0)?;
    if height != 1 {
        return Err(StackCheckError::new(
            code.len(),
            format!("rule leaves {} values on the stack, expected 1", height),
        ));
    }
    Ok(())
}

fn walk(code: &[u32], start: usize, end: usize, initial_height: i32) -> Result<i32, StackCheckError> {
    let mut h = initial_height;
    let mut ip = start;

    while ip < end {
        let op = Opcode::from_u32(code[ip])
            .ok_or_else(|| StackCheckError::new(ip, format!("unknown opcode {}", code[ip])))?;

        let operand_at = |offset: usize| -> Result<u32, StackCheckError> {
            if ip + offset < end {
                Ok(code[ip + offset])
            } else {
                Err(StackCheckError::new(ip, format!("truncated operands for {}", op)))
            }
        };

        match op.shape() {
            Shape::Plain(count) => {
                let operand = if count == 1 { Some(operand_at(1)?) } else { None };
                let (pops, pushes) = effect(op, operand);
                h -= pops;
                if h < 0 {
                    return Err(StackCheckError::new(
                        ip,
                        format!("stack underflow at {}, needed {} items", op, pops),
                    ));
                }
                h += pushes;
                ip += 1 + count;
            }

            Shape::Condition { leading } => {
                match op {
                    Opcode::If | Opcode::IfError | Opcode::IfNotError => need(ip, op, h, 1)?,
                    Opcode::IfArrlenMin | Opcode::IfArrlenMax => {
                        need(ip, op, h, 2)?;
                        h -= 1;
                    }
                    _ => {}
                }

                let then_len = operand_at(leading + 1)? as usize;
                let else_len = operand_at(leading + 2)? as usize;
                let then_start = ip + leading + 3;
                let else_start = then_start + then_len;
                let next = else_start + else_len;
                if next > end {
                    return Err(StackCheckError::new(
                        ip,
                        format!("{} bodies overrun the enclosing span", op),
                    ));
                }

                let then_h = walk(code, then_start, else_start, h)?;
                let else_h = walk(code, else_start, next, h)?;
                if then_h != else_h {
                    return Err(StackCheckError::new(
                        ip,
                        format!(
                            "{} branches disagree: then leaves {}, else leaves {}",
                            op, then_h, else_h
                        ),
                    ));
                }

                h = then_h;
                ip = next;
            }

            Shape::Loop => {
                need(ip, op, h, 1)?;
                let body_len = operand_at(1)? as usize;
                let body_start = ip + 2;
                let next = body_start + body_len;
                if next > end {
                    return Err(StackCheckError::new(
                        ip,
                        format!("{} body overruns the enclosing span", op),
                    ));
                }

                let body_h = walk(code, body_start, next, h)?;
                if body_h != h {
                    return Err(StackCheckError::new(
                        ip,
                        format!("loop body changes stack height from {} to {}", h, body_h),
                    ));
                }
                ip = next;
            }

            Shape::Call => {
                let pop_count = operand_at(2)? as i32;
                let param_count = operand_at(3)? as usize;
                for i in 0..param_count {
                    let slot = operand_at(4 + i)? as i32;
                    if slot >= h {
                        return Err(StackCheckError::new(
                            ip,
                            format!("parameter slot {} outside stack of height {}", slot, h),
                        ));
                    }
                }
                need(ip, op, h, pop_count)?;
                h = h - pop_count + 1;
                ip += 4 + param_count;
            }
        }
    }

    Ok(h)
}

fn need(ip: usize, op: Opcode, h: i32, n: i32) -> Result<(), StackCheckError> {
    if h < n {
        return Err(StackCheckError::new(
            ip,
            format!("stack underflow at {}, needed {} items, have {}", op, n, h),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use Opcode::*;

    fn w(ops: &[Opcode]) -> Vec<u32> {
        ops.iter().map(|op| op.word()).collect()
    }

    #[test]
    fn test_simple_ops() {
        let code = vec![Push.word(), 0, Push.word(), 1, Nip.word()];
        assert_eq!(stack_effect(&code, 0), Ok(1));
    }

    #[test]
    fn test_underflow() {
        let result = stack_effect(&w(&[Pop]), 0);
        assert!(result.unwrap_err().message.contains("underflow"));
    }

    #[test]
    fn test_pop_n_uses_operand() {
        let code = vec![PushCurrPos.word(), PushCurrPos.word(), PopN.word(), 2];
        assert_eq!(stack_effect(&code, 0), Ok(0));
    }

    #[test]
    fn test_balanced_condition() {
        // MATCH_ANY [ACCEPT_N 1] [FAIL 0]
        let code = vec![MatchAny.word(), 2, 2, AcceptN.word(), 1, Fail.word(), 0];
        assert_eq!(check_rule(&code), Ok(()));
    }

    #[test]
    fn test_unbalanced_branches() {
        // IF_ERROR [POP] []
        let code = vec![Push.word(), 0, IfError.word(), 1, 0, Pop.word()];
        let err = stack_effect(&code, 0).unwrap_err();
        assert_eq!(err.ip, 2);
        assert!(err.message.contains("branches disagree"));
    }

    #[test]
    fn test_loop_must_be_height_neutral() {
        let code = vec![Push.word(), 0, WhileNotError.word(), 2, Push.word(), 0];
        let err = stack_effect(&code, 0).unwrap_err();
        assert!(err.message.contains("loop body"));
    }

    #[test]
    fn test_span_overrun() {
        let code = vec![MatchAny.word(), 5, 0, AcceptN.word(), 1];
        let err = stack_effect(&code, 0).unwrap_err();
        assert!(err.message.contains("overrun"));
    }

    #[test]
    fn test_call_slot_outside_stack() {
        // CALL 0, 0, 1, [3] with only one value on the stack
        let code = vec![PushCurrPos.word(), Call.word(), 0, 0, 1, 3];
        let err = stack_effect(&code, 0).unwrap_err();
        assert!(err.message.contains("parameter slot 3"));
    }

    #[test]
    fn test_truncated_operand() {
        let err = stack_effect(&[Push.word()], 0).unwrap_err();
        assert!(err.message.contains("truncated"));
    }

    #[test]
    fn test_unknown_opcode() {
        let err = stack_effect(&[99], 0).unwrap_err();
        assert_eq!(err.message, "unknown opcode 99");
    }

    #[test]
    fn test_rule_must_leave_one_value() {
        let err = check_rule(&w(&[PushCurrPos, PushCurrPos])).unwrap_err();
        assert!(err.message.contains("leaves 2 values"));
    }
}
