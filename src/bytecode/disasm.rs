use std::collections::HashMap;

use crate::bytecode::constant::Constant;
use crate::bytecode::ir::CompiledGrammar;
use crate::bytecode::op::{Opcode, Shape};
use crate::lang::node::render_class;

/// Print disassembly of a compiled grammar
pub fn print_bc(grammar: &CompiledGrammar) {
    print!("{}", disassemble(grammar));
}

/// Return disassembly as a String
///
/// Lists the constant pool, then every rule with condition and loop bodies
/// indented under their instruction.
pub fn disassemble(grammar: &CompiledGrammar) -> String {
    let mut out = String::new();

    out.push_str(&format!("=== CONSTANTS ({}) ===\n", grammar.consts.len()));
    for (i, constant) in grammar.consts.iter().enumerate() {
        out.push_str(&format!("  [{:>3}] {}\n", i, format_constant(constant)));
    }
    out.push('\n');

    for (index, rule) in grammar.rules.iter().enumerate() {
        out.push_str("════════════════════════════════════════\n");
        out.push_str(&format!(" rule[{}] {}\n", index, rule.name));
        out.push_str(&format!(" {} words\n", rule.bytecode.len()));
        out.push_str("════════════════════════════════════════\n");
        write_span(
            &mut out,
            &rule.bytecode,
            0,
            rule.bytecode.len(),
            &grammar.consts,
            0,
        );
        out.push('\n');
    }

    out
}

/// Disassemble one instruction stream against a constant pool.
pub fn disassemble_code(code: &[u32], consts: &[Constant]) -> String {
    let mut out = String::new();
    write_span(&mut out, code, 0, code.len(), consts, 0);
    out
}

fn write_span(
    out: &mut String,
    code: &[u32],
    start: usize,
    end: usize,
    consts: &[Constant],
    indent: usize,
) {
    let prefix = "  ".repeat(indent);
    let mut ip = start;

    while ip < end {
        let Some(op) = Opcode::from_u32(code[ip]) else {
            out.push_str(&format!("{}{:04}  <bad opcode {}>\n", prefix, ip, code[ip]));
            return;
        };

        // Operand words of this instruction, bounded by the enclosing span.
        let operands = |count: usize| {
            let last = ip + 1 + count;
            if last <= end { code.get(ip + 1..last) } else { None }
        };

        match op.shape() {
            Shape::Plain(count) => {
                let Some(args) = operands(count) else {
                    return truncated(out, &prefix, ip, op);
                };
                let note = args.first().and_then(|&c| preview(op, c, consts));
                push_line(out, &prefix, ip, op, &join(args), note);
                ip += 1 + count;
            }

            Shape::Condition { leading } => {
                let Some(args) = operands(leading + 2) else {
                    return truncated(out, &prefix, ip, op);
                };
                let then_len = args[leading] as usize;
                let else_len = args[leading + 1] as usize;
                let then_start = ip + 1 + leading + 2;
                let else_start = then_start + then_len;
                let next = else_start + else_len;

                let mut text = join(&args[..leading]);
                if leading > 0 {
                    text.push_str(", ");
                }
                text.push_str(&format!("then {}, else {}", then_len, else_len));
                let note = args[..leading].first().and_then(|&c| preview(op, c, consts));
                push_line(out, &prefix, ip, op, &text, note);

                if next > end {
                    out.push_str(&format!("{}      <bodies overrun span>\n", prefix));
                    return;
                }

                out.push_str(&format!("{}      then:\n", prefix));
                write_span(out, code, then_start, else_start, consts, indent + 1);
                if else_len > 0 {
                    out.push_str(&format!("{}      else:\n", prefix));
                    write_span(out, code, else_start, next, consts, indent + 1);
                }
                ip = next;
            }

            Shape::Loop => {
                let Some(args) = operands(1) else {
                    return truncated(out, &prefix, ip, op);
                };
                let body_start = ip + 2;
                let next = body_start + args[0] as usize;
                push_line(out, &prefix, ip, op, &format!("body {}", args[0]), None);

                if next > end {
                    out.push_str(&format!("{}      <body overruns span>\n", prefix));
                    return;
                }
                write_span(out, code, body_start, next, consts, indent + 1);
                ip = next;
            }

            Shape::Call => {
                let Some(head) = operands(3) else {
                    return truncated(out, &prefix, ip, op);
                };
                let (function, pop_count, param_count) = (head[0], head[1], head[2] as usize);
                let Some(all) = operands(3 + param_count) else {
                    return truncated(out, &prefix, ip, op);
                };

                let text = format!("{}, pop {}, [{}]", function, pop_count, join(&all[3..]));
                push_line(out, &prefix, ip, op, &text, preview(op, function, consts));
                ip += 4 + param_count;
            }
        }
    }
}

fn push_line(
    out: &mut String,
    prefix: &str,
    ip: usize,
    op: Opcode,
    operands: &str,
    note: Option<String>,
) {
    let mut line = format!("{}{:04}  {:<18}{}", prefix, ip, op.mnemonic(), operands);
    if let Some(note) = note {
        line.push_str("  ; ");
        line.push_str(&note);
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

fn truncated(out: &mut String, prefix: &str, ip: usize, op: Opcode) {
    out.push_str(&format!("{}{:04}  {} <truncated>\n", prefix, ip, op));
}

fn join(words: &[u32]) -> String {
    words
        .iter()
        .map(|w| w.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Constant referenced by the first operand, for opcodes that take one.
fn preview(op: Opcode, index: u32, consts: &[Constant]) -> Option<String> {
    use Opcode::*;
    match op {
        Push | MatchString | MatchStringIc | MatchRegexp | AcceptString | Fail | Call => Some(
            consts
                .get(index as usize)
                .map(format_constant)
                .unwrap_or_else(|| format!("<missing constant {}>", index)),
        ),
        _ => None,
    }
}

fn format_constant(constant: &Constant) -> String {
    match constant {
        Constant::Failed => "FAILED".to_string(),
        Constant::Undefined => "undefined".to_string(),
        Constant::Null => "null".to_string(),
        Constant::EmptyArray => "[]".to_string(),
        Constant::String(s) => format!("{:?}", s),
        Constant::Class(class) => render_class(&class.parts, class.inverted, class.ignore_case),
        Constant::Expectation(e) => format!("expect {}", e.description()),
        Constant::Function(f) => format!("fn({}) {{ {} }}", f.params.join(", "), f.code),
        Constant::Bound(Some(n)) => n.to_string(),
        Constant::Bound(None) => "unbounded".to_string(),
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Print bytecode statistics
pub fn print_bc_stats(grammar: &CompiledGrammar) {
    println!("=== BYTECODE STATISTICS ===\n");

    let total_words: usize = grammar.rules.iter().map(|r| r.bytecode.len()).sum();

    println!("Rules:     {}", grammar.rules.len());
    println!("Constants: {}", grammar.consts.len());
    println!("Words:     {}", total_words);
    println!();

    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for rule in &grammar.rules {
        count_ops(&rule.bytecode, &mut counts);
    }
    let total_ops: usize = counts.values().sum();

    println!("Op frequency:");
    let mut counts: Vec<_> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    for (op, count) in counts.iter().take(10) {
        let pct = (*count as f64 / total_ops.max(1) as f64) * 100.0;
        println!("  {:<18} {:>4} ({:>5.1}%)", op, count, pct);
    }
}

/// Counts instructions by mnemonic, including those inside bodies.
///
/// Bodies follow their header inline, so a linear walk over headers
/// reaches every instruction.
fn count_ops(code: &[u32], counts: &mut HashMap<&'static str, usize>) {
    let mut ip = 0;

    while let Some(op) = code.get(ip).and_then(|&w| Opcode::from_u32(w)) {
        *counts.entry(op.mnemonic()).or_insert(0) += 1;

        ip += match op.shape() {
            Shape::Plain(count) => 1 + count,
            Shape::Condition { leading } => 1 + leading + 2,
            Shape::Loop => 2,
            Shape::Call => match code.get(ip + 3) {
                Some(&param_count) => 4 + param_count as usize,
                None => return,
            },
        };
    }
}
