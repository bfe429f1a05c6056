//! Evaluation of STACK CFI unwinding rules.
//!
//! A STACK CFI INIT record gives the register-recovery rules for an
//! address range; STACK CFI records apply incremental updates to those
//! rules at later addresses within the range. Each rule is a
//! `REG: EXPR` pair where EXPR is a whitespace-tokenized postfix
//! expression over integer literals, callee register values, the
//! pseudo-register `.cfa`, memory dereference `^`, and the usual
//! arithmetic operators.
//!
//! `.cfa` (the canonical frame address) and `.ra` (the return address)
//! must both be recoverable or the record is useless for unwinding.
//! `.cfa` is evaluated first, without access to itself, and its value is
//! then available to every other rule.

use super::types::CfiRules;
use crate::FrameWalker;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, trace};

pub fn walk_with_stack_cfi(
    init: &CfiRules,
    additional: &[CfiRules],
    walker: &mut dyn FrameWalker,
) -> Option<()> {
    trace!("unwinding with STACK CFI rules");

    // Collect up all the `REG: EXPR` pairs in these lines. If a REG
    // occurs twice, the later one wins; that's how the incremental
    // updates are expressed.
    let mut exprs = HashMap::new();
    parse_cfi_exprs(&init.rules, &mut exprs)?;
    for line in additional {
        parse_cfi_exprs(&line.rules, &mut exprs)?;
    }

    // These two must always be present.
    let cfa_expr = exprs.remove(&CfiReg::Cfa)?;
    let ra_expr = exprs.remove(&CfiReg::Ra)?;

    // Evaluating the CFA cannot itself use the CFA.
    let cfa = eval_cfi_expr(cfa_expr, walker, None)?;
    let ra = eval_cfi_expr(ra_expr, walker, Some(cfa))?;

    walker.set_cfa(cfa)?;
    walker.set_ra(ra)?;

    for (reg, expr) in exprs {
        if let CfiReg::Other(reg) = reg {
            // If an individual register fails to evaluate, just drop it
            // from the caller's context. Make sure it's cleared so it
            // isn't implicitly forwarded from the callee either.
            match eval_cfi_expr(expr, walker, Some(cfa)) {
                Some(val) => {
                    walker.set_caller_register(reg, val);
                }
                None => {
                    trace!("optional register {} failed to evaluate, dropping it", reg);
                    walker.clear_caller_register(reg);
                }
            }
        } else {
            // .cfa and .ra were removed above.
            unreachable!()
        }
    }

    Some(())
}

fn parse_cfi_exprs<'a>(input: &'a str, output: &mut HashMap<CfiReg<'a>, &'a str>) -> Option<()> {
    // The format is ascii, so chars == bytes.
    let base_addr = input.as_ptr() as usize;
    let mut cur_reg = None;
    let mut expr_first: Option<&str> = None;
    let mut expr_last: Option<&str> = None;
    for token in input.split_ascii_whitespace() {
        if let Some(token) = token.strip_suffix(':') {
            // A "REG:" token ends the previous EXPR and starts the next.
            // Commit the pending register, if any.
            if let Some(reg) = cur_reg {
                // Substrings point into the original string, so the
                // first/last token addresses give us the expression
                // substring without any copying.
                let min_addr = expr_first?.as_ptr() as usize;
                let max_addr = expr_last?.as_ptr() as usize + expr_last?.len();
                let expr = &input[min_addr - base_addr..max_addr - base_addr];

                // Later entries intentionally overwrite earlier ones.
                output.insert(reg, expr);

                expr_first = None;
                expr_last = None;
            }

            cur_reg = if token == ".cfa" {
                Some(CfiReg::Cfa)
            } else if token == ".ra" {
                Some(CfiReg::Ra)
            } else if let Some(token) = token.strip_prefix('$') {
                Some(CfiReg::Other(token))
            } else {
                // arm-style register with no $ prefix
                Some(CfiReg::Other(token))
            };
        } else {
            // The first token must be a register.
            cur_reg.as_ref()?;

            if expr_first.is_none() {
                expr_first = Some(token);
            }
            expr_last = Some(token);
        }
    }

    // Commit the final rule.
    let min_addr = expr_first?.as_ptr() as usize;
    let max_addr = expr_last?.as_ptr() as usize + expr_last?.len();
    let expr = &input[min_addr - base_addr..max_addr - base_addr];

    output.insert(cur_reg?, expr);

    Some(())
}

fn eval_cfi_expr(expr: &str, walker: &mut dyn FrameWalker, cfa: Option<u64>) -> Option<u64> {
    let mut stack: Vec<u64> = Vec::new();
    for token in expr.split_ascii_whitespace() {
        match token {
            "+" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_add(rhs));
            }
            "-" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_sub(rhs));
            }
            "*" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(lhs.wrapping_mul(rhs));
            }
            "/" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    return None;
                }
                stack.push(lhs.wrapping_div(rhs));
            }
            "%" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 {
                    return None;
                }
                stack.push(lhs.wrapping_rem(rhs));
            }
            "@" => {
                // Truncate lhs down to a multiple of rhs. The mask trick
                // only makes sense for powers of two.
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                if rhs == 0 || !rhs.is_power_of_two() {
                    return None;
                }
                stack.push(lhs & (-1i64 as u64 ^ (rhs - 1)))
            }
            "^" => {
                let ptr = stack.pop()?;
                stack.push(walker.get_register_at_address(ptr)?);
            }
            ".cfa" => {
                // The CFA must not be used to compute itself; when
                // evaluating the .cfa rule, `cfa` is None here.
                stack.push(cfa?);
            }
            ".undef" => {
                // The register is explicitly unrecoverable.
                return None;
            }
            _ => {
                if let Some((_, reg)) = token.split_once('$') {
                    stack.push(walker.get_callee_register(reg)?);
                } else if let Ok(value) = i64::from_str(token) {
                    stack.push(value as u64)
                } else if let Some(reg) = walker.get_callee_register(token) {
                    // arm-style register with no $ prefix
                    stack.push(reg);
                } else {
                    debug!("STACK CFI expression eval failed, unknown token: {}", token);
                    return None;
                }
            }
        }
    }

    if stack.len() == 1 {
        stack.pop()
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CfiReg<'a> {
    Cfa,
    Ra,
    Other(&'a str),
}
