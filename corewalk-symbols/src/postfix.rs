//! A postfix (reverse Polish) expression evaluator.
//!
//! Windows debug info encodes caller-recovery rules as small "program
//! strings": whitespace-tokenized postfix expressions evaluated against a
//! dictionary of named values, optionally backed by stack memory for
//! dereferences. The x86 unwinder seeds the dictionary with the callee's
//! registers and frame-shape constants, runs the program string, and
//! reads the caller's registers back out of the dictionary.
//!
//! Identifiers are pushed onto the operand stack unresolved and only
//! looked up in the dictionary when popped. This is deliberate: the `=`
//! operator needs the unresolved name on the stack, and a token can't be
//! classified as value-or-assignment-target until an operator consumes
//! it.

use corewalk_common::StackMemory;
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// An entry on the evaluator's operand stack.
///
/// Identifiers resolve against the dictionary at pop time, not push time.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PostfixValue {
    Literal(u64),
    Identifier(String),
}

/// Evaluates postfix program strings against a dictionary of named
/// values.
///
/// Operators: `+ - * / %` (wrapping integer arithmetic, division and
/// remainder fail on zero), `@` (truncate the left operand down to a
/// multiple of the right operand, which must be a power of two), `^`
/// (dereference a 32-bit little-endian word from stack memory), and `=`
/// (assign the popped value to the popped `$`-prefixed variable).
///
/// The same evaluator may be reused across expressions; a failed
/// evaluation always leaves the operand stack empty.
pub struct PostfixEvaluator<'a> {
    /// Named values the expression reads and writes.
    pub dictionary: HashMap<String, u64>,
    memory: Option<&'a StackMemory<'a>>,
    stack: Vec<PostfixValue>,
    assigned: HashSet<String>,
}

impl<'a> PostfixEvaluator<'a> {
    /// Create an evaluator, optionally backed by stack memory for the
    /// dereference operator.
    pub fn new(memory: Option<&'a StackMemory<'a>>) -> PostfixEvaluator<'a> {
        PostfixEvaluator {
            dictionary: HashMap::new(),
            memory,
            stack: Vec::new(),
            assigned: HashSet::new(),
        }
    }

    /// Evaluate `expr` for its side effects on the dictionary.
    ///
    /// Returns true only if every token evaluated and the operand stack
    /// ended up empty; leftover values mean a malformed expression.
    pub fn evaluate(&mut self, expr: &str) -> bool {
        self.assigned.clear();
        let ok = self.eval_tokens(expr).is_some() && self.stack.is_empty();
        self.stack.clear();
        ok
    }

    /// Evaluate `expr` and return the single value it leaves on the
    /// operand stack. Zero or multiple leftover values is a failure.
    pub fn evaluate_for_value(&mut self, expr: &str) -> Option<u64> {
        self.assigned.clear();
        let result = if self.eval_tokens(expr).is_some() && self.stack.len() == 1 {
            let top = self.stack.pop();
            top.and_then(|val| self.resolve(val))
        } else {
            None
        };
        self.stack.clear();
        result
    }

    /// The dictionary keys written by the most recent evaluation.
    pub fn assigned(&self) -> &HashSet<String> {
        &self.assigned
    }

    fn eval_tokens(&mut self, expr: &str) -> Option<()> {
        // Some Windows toolchains emit "=NEXT_TOKEN" where "= NEXT_TOKEN"
        // is meant; split those tokens apart.
        let tokens = expr
            .split_ascii_whitespace()
            .flat_map(|x| {
                if x.starts_with('=') && x.len() > 1 {
                    [Some(&x[0..1]), Some(&x[1..])]
                } else {
                    [Some(x), None]
                }
            })
            .flatten();

        for token in tokens {
            match token {
                "+" => {
                    let rhs = self.pop_value()?;
                    let lhs = self.pop_value()?;
                    self.stack.push(PostfixValue::Literal(lhs.wrapping_add(rhs)));
                }
                "-" => {
                    let rhs = self.pop_value()?;
                    let lhs = self.pop_value()?;
                    self.stack.push(PostfixValue::Literal(lhs.wrapping_sub(rhs)));
                }
                "*" => {
                    let rhs = self.pop_value()?;
                    let lhs = self.pop_value()?;
                    self.stack.push(PostfixValue::Literal(lhs.wrapping_mul(rhs)));
                }
                "/" => {
                    let rhs = self.pop_value()?;
                    let lhs = self.pop_value()?;
                    if rhs == 0 {
                        return None;
                    }
                    self.stack.push(PostfixValue::Literal(lhs.wrapping_div(rhs)));
                }
                "%" => {
                    let rhs = self.pop_value()?;
                    let lhs = self.pop_value()?;
                    if rhs == 0 {
                        return None;
                    }
                    self.stack.push(PostfixValue::Literal(lhs.wrapping_rem(rhs)));
                }
                "@" => {
                    // Truncate lhs down to a multiple of rhs. The mask
                    // only performs a true alignment truncation for
                    // powers of two, and symbol data never supplies
                    // anything else.
                    let rhs = self.pop_value()?;
                    let lhs = self.pop_value()?;
                    if rhs == 0 || !rhs.is_power_of_two() {
                        return None;
                    }
                    self.stack
                        .push(PostfixValue::Literal(lhs & (-1i64 as u64 ^ (rhs - 1))));
                }
                "^" => {
                    let ptr = self.pop_value()?;
                    let memory = self.memory?;
                    let val = memory.get_memory_at_address::<u32>(ptr)?;
                    self.stack.push(PostfixValue::Literal(val as u64));
                }
                "=" => {
                    let rhs = self.stack.pop()?;
                    let lhs = match self.stack.pop()? {
                        PostfixValue::Identifier(id) => id,
                        PostfixValue::Literal(_) => return None,
                    };
                    // Only variables may be assigned.
                    if !lhs.starts_with('$') {
                        return None;
                    }
                    if let PostfixValue::Identifier(id) = &rhs {
                        if id == ".undef" {
                            // Assigning .undef deletes the variable.
                            self.dictionary.remove(&lhs);
                            self.assigned.insert(lhs);
                            continue;
                        }
                    }
                    let val = self.resolve(rhs)?;
                    self.dictionary.insert(lhs.clone(), val);
                    self.assigned.insert(lhs);
                }
                _ => {
                    self.stack.push(classify_token(token));
                }
            }
        }
        Some(())
    }

    fn pop_value(&mut self) -> Option<u64> {
        let top = self.stack.pop()?;
        self.resolve(top)
    }

    fn resolve(&self, val: PostfixValue) -> Option<u64> {
        match val {
            PostfixValue::Literal(v) => Some(v),
            PostfixValue::Identifier(id) => {
                let found = self.dictionary.get(&id).copied();
                if found.is_none() {
                    trace!("program string references unknown identifier: {}", id);
                }
                found
            }
        }
    }
}

/// A token is a literal if all of it parses as an integer, with a leading
/// `-` handled explicitly; anything else is an identifier.
fn classify_token(token: &str) -> PostfixValue {
    if let Ok(value) = token.parse::<u64>() {
        PostfixValue::Literal(value)
    } else if let Some(rest) = token.strip_prefix('-') {
        match rest.parse::<u64>() {
            Ok(value) => PostfixValue::Literal(value.wrapping_neg()),
            Err(_) => PostfixValue::Identifier(token.to_string()),
        }
    } else {
        PostfixValue::Identifier(token.to_string())
    }
}
