//! Event argument expression evaluator.
//!
//! Expressions appear in trigger arguments and control-variable bindings.
//! The grammar has infix operators with the usual precedence (`|` lowest,
//! `^` highest), unary `-` and `!`, parentheses, and three functions:
//! `ts(beats, rem)`, `rand(max)` and `pat(num, inst)`. Literals are
//! integers, decimal floats, quoted strings, `true`/`false`, `$` (the meta
//! value supplied by the caller) and environment variable names.
//!
//! Evaluation runs over a pair of fixed-depth stacks; nested parentheses
//! and function arguments recurse with a shared depth budget. All failures
//! are reported through the [`Streader`] error state and yield no value.

use crate::limits::{VAR_CHARS, VAR_INIT_CHARS, VAR_NAME_MAX};
use crate::random::Random;
use crate::streader::Streader;
use crate::tstamp::Tstamp;
use crate::value::{PatInstRef, Value, ValueType};
use std::collections::HashMap;

const STACK_SIZE: usize = 32;
const FUNC_ARGS_MAX: usize = 4;

/// Runtime values of the environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvState {
    values: HashMap<String, Value>,
}

impl EnvState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Evaluate a complete expression string.
///
/// `meta` is bound to `$`. On failure the returned error carries the
/// position inside `input`.
pub fn evaluate(
    input: &str,
    env: &EnvState,
    meta: &Value,
    rand: &mut Random,
) -> Result<Value, crate::streader::StreaderError> {
    let mut sr = Streader::new(input);
    match evaluate_expr(&mut sr, env, meta, rand) {
        Some(value) => Ok(value),
        None => Err(sr.take_error().unwrap_or_else(|| crate::streader::StreaderError {
            pos: 0,
            message: "Invalid expression".to_string(),
        })),
    }
}

/// Evaluate an expression read from a [`Streader`].
pub fn evaluate_expr(
    sr: &mut Streader,
    env: &EnvState,
    meta: &Value,
    rand: &mut Random,
) -> Option<Value> {
    evaluate_expr_rec(sr, env, meta, rand, 0, false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Or,
    And,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl Op {
    fn precedence(self) -> u8 {
        match self {
            Op::Or => 0,
            Op::And => 1,
            Op::Eq | Op::Neq => 2,
            Op::Lt | Op::Leq | Op::Gt | Op::Geq | Op::Not => 3,
            Op::Add | Op::Sub => 4,
            Op::Mul | Op::Div | Op::Mod => 5,
            Op::Pow => 6,
        }
    }

    fn from_token(token: &str) -> Option<Op> {
        match token {
            "|" => Some(Op::Or),
            "&" => Some(Op::And),
            "=" => Some(Op::Eq),
            "!=" => Some(Op::Neq),
            "<" => Some(Op::Lt),
            "<=" => Some(Op::Leq),
            ">" => Some(Op::Gt),
            ">=" => Some(Op::Geq),
            "!" => Some(Op::Not),
            "+" => Some(Op::Add),
            "-" => Some(Op::Sub),
            "*" => Some(Op::Mul),
            "/" => Some(Op::Div),
            "%" => Some(Op::Mod),
            "^" => Some(Op::Pow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Ts,
    Rand,
    Pat,
}

impl Func {
    fn from_name(name: &str) -> Option<Func> {
        match name {
            "ts" => Some(Func::Ts),
            "rand" => Some(Func::Rand),
            "pat" => Some(Func::Pat),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum Token {
    Open,
    Close,
    Comma,
    Literal(Value),
    Var(String),
    Op(Op),
}

fn evaluate_expr_rec(
    sr: &mut Streader,
    env: &EnvState,
    meta: &Value,
    rand: &mut Random,
    depth: usize,
    func_arg: bool,
) -> Option<Value> {
    if sr.is_error_set() {
        return None;
    }
    if depth >= STACK_SIZE {
        sr.set_error("Maximum recursion depth exceeded");
        return None;
    }

    let mut val_stack: Vec<Value> = Vec::with_capacity(8);
    let mut op_stack: Vec<Op> = Vec::with_capacity(4);
    let mut expect_operand = true;
    let mut found_not = false;
    let mut found_minus = false;
    let mut terminated_by_close = false;

    loop {
        sr.skip_whitespace();
        let prev_pos = sr.pos();
        let token = match read_token(sr) {
            Some(token) => token,
            None => {
                if sr.is_error_set() {
                    return None;
                }
                break;
            }
        };

        match token {
            Token::Close => {
                if func_arg {
                    // The caller owns the terminator
                    sr.set_pos(prev_pos);
                } else {
                    terminated_by_close = true;
                }
                break;
            }
            Token::Comma if func_arg => {
                sr.set_pos(prev_pos);
                break;
            }
            Token::Comma => {
                sr.set_error("Unrecognised token");
                return None;
            }
            Token::Open => {
                if !expect_operand {
                    sr.set_error("Unexpected operand");
                    return None;
                }
                check_stack(sr, val_stack.len())?;
                let inner = evaluate_expr_rec(sr, env, meta, rand, depth + 1, false)?;
                let operand = handle_unary(sr, inner, found_not, found_minus)?;
                found_not = false;
                found_minus = false;
                val_stack.push(operand);
                expect_operand = false;
            }
            Token::Var(name) => {
                if let Some(func) = Func::from_name(&name) {
                    if !expect_operand {
                        sr.set_error("Unexpected function");
                        return None;
                    }
                    check_stack(sr, val_stack.len())?;
                    let result = eval_func(sr, env, meta, rand, depth, func)?;
                    found_not = false;
                    found_minus = false;
                    val_stack.push(result);
                    expect_operand = false;
                } else {
                    if !expect_operand {
                        sr.set_error("Unexpected operand");
                        return None;
                    }
                    let value = match env.get(&name) {
                        Some(value) => value.clone(),
                        None => {
                            sr.set_error("Unrecognised token");
                            return None;
                        }
                    };
                    let operand = handle_unary(sr, value, found_not, found_minus)?;
                    found_not = false;
                    found_minus = false;
                    check_stack(sr, val_stack.len())?;
                    val_stack.push(operand);
                    expect_operand = false;
                }
            }
            Token::Literal(value) => {
                if !expect_operand {
                    sr.set_error("Unexpected operand");
                    return None;
                }
                let value = if matches!(value, Value::None) {
                    meta.clone()
                } else {
                    value
                };
                let operand = handle_unary(sr, value, found_not, found_minus)?;
                found_not = false;
                found_minus = false;
                check_stack(sr, val_stack.len())?;
                val_stack.push(operand);
                expect_operand = false;
            }
            Token::Op(op) => {
                if expect_operand {
                    match op {
                        Op::Not => found_not = true,
                        Op::Sub => found_minus = true,
                        _ => {
                            sr.set_error("Unexpected binary operator");
                            return None;
                        }
                    }
                    continue;
                }

                if op == Op::Not {
                    sr.set_error("Unexpected boolean not");
                    return None;
                }

                while let Some(&top) = op_stack.last() {
                    if op.precedence() > top.precedence() {
                        break;
                    }
                    apply_top_op(sr, &mut val_stack, &mut op_stack)?;
                }

                check_stack(sr, op_stack.len())?;
                op_stack.push(op);
                expect_operand = true;
            }
        }
    }

    if sr.is_error_set() {
        return None;
    }

    if val_stack.is_empty() {
        sr.set_error("Empty expression");
        return None;
    }

    // A top-level expression must consume its whole input; a nested one must
    // have been stopped by its closing parenthesis
    if depth == 0 && terminated_by_close {
        sr.set_error("Unmatched right parenthesis");
        return None;
    }
    if depth > 0 && !func_arg && !terminated_by_close {
        sr.set_error("Unmatched left parenthesis");
        return None;
    }

    while !op_stack.is_empty() {
        apply_top_op(sr, &mut val_stack, &mut op_stack)?;
    }

    if val_stack.len() != 1 {
        sr.set_error("Not enough operands");
        return None;
    }

    val_stack.pop()
}

fn check_stack(sr: &mut Streader, len: usize) -> Option<()> {
    if len >= STACK_SIZE {
        sr.set_error("Stack overflow");
        return None;
    }
    Some(())
}

fn apply_top_op(sr: &mut Streader, val_stack: &mut Vec<Value>, op_stack: &mut Vec<Op>) -> Option<()> {
    let op = op_stack.pop()?;
    if val_stack.len() < 2 {
        sr.set_error("Not enough operands");
        return None;
    }
    let rhs = val_stack.pop()?;
    let lhs = val_stack.pop()?;
    let result = apply_op(sr, op, &lhs, &rhs)?;
    val_stack.push(result);
    Some(())
}

fn handle_unary(sr: &mut Streader, value: Value, found_not: bool, found_minus: bool) -> Option<Value> {
    if sr.is_error_set() {
        return None;
    }
    if !found_not && !found_minus {
        return Some(value);
    }

    if found_not {
        return match value {
            Value::Bool(b) => Some(Value::Bool(!b)),
            _ => {
                sr.set_error("Non-boolean operand for boolean not");
                None
            }
        };
    }

    match value {
        Value::Int(i) => Some(Value::Int(-i)),
        Value::Float(f) => Some(Value::Float(-f)),
        _ => {
            sr.set_error("Non-number operand for unary minus");
            None
        }
    }
}

fn read_token(sr: &mut Streader) -> Option<Token> {
    if sr.is_error_set() {
        return None;
    }
    sr.skip_whitespace();
    let next = sr.peek()?;

    if next.is_ascii_digit() || next == '.' {
        return read_number(sr).map(Token::Literal);
    }
    if next == '\'' || next == '"' {
        return read_quoted(sr).map(Token::Literal);
    }
    if sr.try_match_char('$') {
        // The meta value is substituted by the evaluator
        return Some(Token::Literal(Value::None));
    }
    if sr.try_match_char(',') {
        return Some(Token::Comma);
    }
    if sr.try_match_char('(') {
        return Some(Token::Open);
    }
    if sr.try_match_char(')') {
        return Some(Token::Close);
    }
    if VAR_INIT_CHARS.contains(next) {
        return read_name(sr).map(|name| {
            if name == "true" {
                Token::Literal(Value::Bool(true))
            } else if name == "false" {
                Token::Literal(Value::Bool(false))
            } else {
                Token::Var(name)
            }
        });
    }

    read_op(sr)
}

fn read_number(sr: &mut Streader) -> Option<Value> {
    let rest = sr.rest();
    let is_float = {
        let mut end = 0;
        let bytes = rest.as_bytes();
        while end < bytes.len()
            && (bytes[end].is_ascii_digit()
                || bytes[end] == b'.'
                || bytes[end] == b'e'
                || bytes[end] == b'E'
                || ((bytes[end] == b'+' || bytes[end] == b'-')
                    && end > 0
                    && (bytes[end - 1] == b'e' || bytes[end - 1] == b'E')))
        {
            end += 1;
        }
        rest[..end].contains(['.', 'e', 'E'])
    };

    if is_float {
        sr.read_float().map(Value::Float)
    } else {
        sr.read_int().map(Value::Int)
    }
}

fn read_quoted(sr: &mut Streader) -> Option<Value> {
    let quote = sr.peek()?;
    sr.advance(1);
    let rest = sr.rest();
    match rest.find(quote) {
        Some(end) => {
            let content = &rest[..end];
            if content.len() >= VAR_NAME_MAX {
                sr.set_error("Exceeded maximum token length");
                return None;
            }
            sr.advance(end + 1);
            Some(Value::String(content.to_string()))
        }
        None => {
            sr.set_error("Unterminated string");
            None
        }
    }
}

fn read_name(sr: &mut Streader) -> Option<String> {
    let rest = sr.rest();
    let len = rest
        .bytes()
        .take_while(|&b| VAR_CHARS.contains(b as char))
        .count();
    if len >= VAR_NAME_MAX {
        sr.set_error("Exceeded maximum token length");
        return None;
    }
    let name = rest[..len].to_string();
    sr.advance(len);
    Some(name)
}

fn read_op(sr: &mut Streader) -> Option<Token> {
    const OP_CHARS: &str = "!=<>+-*/%^|&";
    let rest = sr.rest();
    let len = rest
        .bytes()
        .take_while(|&b| OP_CHARS.contains(b as char))
        .count();
    if len == 0 {
        sr.set_error("Unrecognised token");
        return None;
    }
    match Op::from_token(&rest[..len]) {
        Some(op) => {
            sr.advance(len);
            Some(Token::Op(op))
        }
        None => {
            sr.set_error("Unrecognised token");
            None
        }
    }
}

/// Promote two arithmetic operands to their common type
/// (`Int < Tstamp < Float`).
fn promote_pair(sr: &mut Streader, lhs: &Value, rhs: &Value) -> Option<(Value, Value)> {
    if !lhs.is_arithmetic() || !rhs.is_arithmetic() {
        sr.set_error("Non-arithmetic type used in arithmetic expression");
        return None;
    }

    fn rank(v: &Value) -> u8 {
        match v {
            Value::Int(_) => 1,
            Value::Tstamp(_) => 2,
            Value::Float(_) => 3,
            _ => 0,
        }
    }

    let (lr, rr) = (rank(lhs), rank(rhs));
    if lr == rr {
        return Some((lhs.clone(), rhs.clone()));
    }
    let target = if lr < rr {
        rhs.value_type()
    } else {
        lhs.value_type()
    };
    let promoted_lhs = lhs.convert(target);
    let promoted_rhs = rhs.convert(target);
    match (promoted_lhs, promoted_rhs) {
        (Some(a), Some(b)) => Some((a, b)),
        _ => {
            sr.set_error("Could not promote operand type");
            None
        }
    }
}

fn apply_op(sr: &mut Streader, op: Op, lhs: &Value, rhs: &Value) -> Option<Value> {
    if sr.is_error_set() {
        return None;
    }
    match op {
        Op::Or | Op::And => {
            let (a, b) = match (lhs, rhs) {
                (Value::Bool(a), Value::Bool(b)) => (*a, *b),
                _ => {
                    sr.set_error(if op == Op::Or {
                        "Boolean OR with non-booleans"
                    } else {
                        "Boolean AND with non-booleans"
                    });
                    return None;
                }
            };
            Some(Value::Bool(if op == Op::Or { a || b } else { a && b }))
        }
        Op::Eq => op_eq(sr, lhs, rhs),
        Op::Neq => op_eq(sr, lhs, rhs).map(|v| match v {
            Value::Bool(b) => Value::Bool(!b),
            other => other,
        }),
        Op::Lt => op_lt(sr, lhs, rhs),
        Op::Gt => op_lt(sr, rhs, lhs),
        Op::Leq => {
            let lt = op_lt(sr, lhs, rhs)?;
            if lt == Value::Bool(true) {
                return Some(lt);
            }
            op_eq(sr, lhs, rhs)
        }
        Op::Geq => {
            let gt = op_lt(sr, rhs, lhs)?;
            if gt == Value::Bool(true) {
                return Some(gt);
            }
            op_eq(sr, lhs, rhs)
        }
        Op::Add => op_add(sr, lhs, rhs),
        Op::Sub => {
            let neg = match rhs {
                Value::Int(i) => Value::Int(-i),
                Value::Float(f) => Value::Float(-f),
                Value::Tstamp(ts) => Value::Tstamp(-*ts),
                _ => {
                    sr.set_error("Subtraction with non-numbers");
                    return None;
                }
            };
            op_add(sr, lhs, &neg)
        }
        Op::Mul => op_mul(sr, lhs, rhs),
        Op::Div => op_div(sr, lhs, rhs),
        Op::Mod => op_mod(sr, lhs, rhs),
        Op::Pow => op_pow(sr, lhs, rhs),
        Op::Not => {
            sr.set_error("Unexpected boolean not");
            None
        }
    }
}

fn op_eq(sr: &mut Streader, lhs: &Value, rhs: &Value) -> Option<Value> {
    match (lhs, rhs) {
        (Value::Bool(a), Value::Bool(b)) => Some(Value::Bool(a == b)),
        (Value::Bool(_), _) | (_, Value::Bool(_)) => {
            sr.set_error("Comparison between boolean and non-boolean");
            None
        }
        (Value::String(a), Value::String(b)) => Some(Value::Bool(a == b)),
        (Value::String(_), _) | (_, Value::String(_)) => {
            sr.set_error("Comparison between string and non-string");
            None
        }
        _ => {
            let (a, b) = promote_pair(sr, lhs, rhs)?;
            let equal = match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => x == y,
                (Value::Float(x), Value::Float(y)) => x == y,
                (Value::Tstamp(x), Value::Tstamp(y)) => x == y,
                _ => unreachable!("promotion yields matching arithmetic types"),
            };
            Some(Value::Bool(equal))
        }
    }
}

fn op_lt(sr: &mut Streader, lhs: &Value, rhs: &Value) -> Option<Value> {
    if !lhs.is_arithmetic() || !rhs.is_arithmetic() {
        sr.set_error("Ordinal comparison between non-arithmetic types");
        return None;
    }
    let (a, b) = promote_pair(sr, lhs, rhs)?;
    let less = match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => x < y,
        (Value::Float(x), Value::Float(y)) => x < y,
        (Value::Tstamp(x), Value::Tstamp(y)) => x < y,
        _ => unreachable!("promotion yields matching arithmetic types"),
    };
    Some(Value::Bool(less))
}

fn op_add(sr: &mut Streader, lhs: &Value, rhs: &Value) -> Option<Value> {
    let (a, b) = promote_pair(sr, lhs, rhs)?;
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(x + y)),
        (Value::Float(x), Value::Float(y)) => Some(Value::Float(x + y)),
        (Value::Tstamp(x), Value::Tstamp(y)) => Some(Value::Tstamp(*x + *y)),
        _ => unreachable!("promotion yields matching arithmetic types"),
    }
}

fn op_mul(sr: &mut Streader, lhs: &Value, rhs: &Value) -> Option<Value> {
    let (a, b) = promote_pair(sr, lhs, rhs)?;
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => Some(Value::Int(x * y)),
        (Value::Float(x), Value::Float(y)) => Some(Value::Float(x * y)),
        // Multiplying timestamps has no exact meaning; degrade to floats
        (Value::Tstamp(x), Value::Tstamp(y)) => {
            Some(Value::Float(x.to_beats() * y.to_beats()))
        }
        _ => unreachable!("promotion yields matching arithmetic types"),
    }
}

fn op_div(sr: &mut Streader, lhs: &Value, rhs: &Value) -> Option<Value> {
    let (a, b) = promote_pair(sr, lhs, rhs)?;
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                sr.set_error("Division by zero");
                return None;
            }
            if x % y == 0 {
                Some(Value::Int(x / y))
            } else {
                Some(Value::Float(*x as f64 / *y as f64))
            }
        }
        (Value::Float(x), Value::Float(y)) => {
            if *y == 0.0 {
                sr.set_error("Division by zero");
                return None;
            }
            Some(Value::Float(x / y))
        }
        (Value::Tstamp(x), Value::Tstamp(y)) => {
            let divisor = y.to_beats();
            if divisor == 0.0 {
                sr.set_error("Division by zero");
                return None;
            }
            Some(Value::Float(x.to_beats() / divisor))
        }
        _ => unreachable!("promotion yields matching arithmetic types"),
    }
}

fn op_mod(sr: &mut Streader, lhs: &Value, rhs: &Value) -> Option<Value> {
    let (a, b) = promote_pair(sr, lhs, rhs)?;
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => {
            if *y == 0 {
                sr.set_error("Modulo by zero");
                return None;
            }
            // The result takes the sign of the divisor
            let mut rem = x % y;
            if rem < 0 {
                rem += y;
            }
            Some(Value::Int(rem))
        }
        (Value::Float(x), Value::Float(y)) => {
            if *y == 0.0 {
                sr.set_error("Modulo by zero");
                return None;
            }
            let mut rem = x % y;
            if rem < 0.0 {
                rem += y;
            }
            Some(Value::Float(rem))
        }
        (Value::Tstamp(x), Value::Tstamp(y)) => {
            let divisor = y.to_beats();
            if divisor == 0.0 {
                sr.set_error("Modulo by zero");
                return None;
            }
            let mut rem = x.to_beats() % divisor;
            if rem < 0.0 {
                rem += divisor;
            }
            Some(Value::Float(rem))
        }
        _ => unreachable!("promotion yields matching arithmetic types"),
    }
}

fn ipowi(base: i64, exp: i64) -> i64 {
    let mut result: i64 = 1;
    let mut base = base;
    let mut exp = exp;
    while exp > 0 {
        if exp & 1 == 1 {
            result = result.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    result
}

fn float_pow(sr: &mut Streader, base: f64, exp: f64) -> Option<Value> {
    if base == 0.0 && exp == 0.0 {
        sr.set_error("0 ^ 0 is undefined");
        return None;
    }
    Some(Value::Float(base.powf(exp)))
}

fn op_pow(sr: &mut Streader, lhs: &Value, rhs: &Value) -> Option<Value> {
    let (a, b) = promote_pair(sr, lhs, rhs)?;
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => {
            if *y >= 0 {
                if *x == 0 && *y == 0 {
                    sr.set_error("0 ^ 0 is undefined");
                    return None;
                }
                Some(Value::Int(ipowi(*x, *y)))
            } else {
                float_pow(sr, *x as f64, *y as f64)
            }
        }
        (Value::Float(x), Value::Float(y)) => float_pow(sr, *x, *y),
        (Value::Tstamp(x), Value::Tstamp(y)) => float_pow(sr, x.to_beats(), y.to_beats()),
        _ => unreachable!("promotion yields matching arithmetic types"),
    }
}

fn eval_func(
    sr: &mut Streader,
    env: &EnvState,
    meta: &Value,
    rand: &mut Random,
    depth: usize,
    func: Func,
) -> Option<Value> {
    if !sr.match_char('(') {
        return None;
    }

    let mut args: Vec<Value> = Vec::new();
    if !sr.try_match_char(')') {
        loop {
            if args.len() >= FUNC_ARGS_MAX {
                sr.set_error("Too many function arguments");
                return None;
            }
            let arg = evaluate_expr_rec(sr, env, meta, rand, depth + 1, true)?;
            args.push(arg);
            if sr.try_match_char(')') {
                break;
            }
            if !sr.match_char(',') {
                return None;
            }
        }
    }

    match func {
        Func::Ts => func_ts(sr, &args),
        Func::Rand => func_rand(sr, &args, rand),
        Func::Pat => func_pat(sr, &args),
    }
}

fn func_ts(sr: &mut Streader, args: &[Value]) -> Option<Value> {
    let mut result = Tstamp::zero();

    match args.first() {
        None => return Some(Value::Tstamp(result)),
        Some(Value::Tstamp(ts)) => return Some(Value::Tstamp(*ts)),
        Some(Value::Int(beats)) => result = Tstamp::new(*beats, 0),
        Some(Value::Float(beats)) => result = Tstamp::from_beats(*beats),
        Some(_) => {
            sr.set_error("Invalid beat type");
            return None;
        }
    }

    match args.get(1) {
        None => Some(Value::Tstamp(result)),
        Some(Value::Int(rem)) => {
            if *rem < 0 || *rem >= crate::limits::TSTAMP_BEAT {
                sr.set_error("Invalid beat value");
                return None;
            }
            Some(Value::Tstamp(result + Tstamp::new(0, *rem)))
        }
        Some(Value::Float(rem)) => {
            if *rem < 0.0 || *rem >= crate::limits::TSTAMP_BEAT as f64 {
                sr.set_error("Invalid beat value");
                return None;
            }
            Some(Value::Tstamp(result + Tstamp::new(0, *rem as i64)))
        }
        Some(_) => {
            sr.set_error("Invalid remainder type");
            None
        }
    }
}

fn func_rand(sr: &mut Streader, args: &[Value], rand: &mut Random) -> Option<Value> {
    let unit = rand.next_f64();
    match args.first() {
        None => Some(Value::Float(unit)),
        Some(Value::Float(max)) => Some(Value::Float(unit * max)),
        Some(Value::Int(max)) => Some(Value::Float(unit * *max as f64)),
        Some(_) => {
            sr.set_error("Invalid argument");
            None
        }
    }
}

fn func_pat(sr: &mut Streader, args: &[Value]) -> Option<Value> {
    let mut result = PatInstRef::new(0, 0);

    match args.first() {
        None => return Some(Value::PatInstRef(result)),
        Some(Value::PatInstRef(p)) => return Some(Value::PatInstRef(*p)),
        Some(Value::Int(pat)) => {
            if *pat < 0 || *pat >= crate::limits::PATTERNS_MAX as i64 {
                sr.set_error("Invalid pattern number");
                return None;
            }
            result.pat = *pat as i16;
        }
        Some(_) => {
            sr.set_error("Invalid pattern value type");
            return None;
        }
    }

    match args.get(1) {
        None => Some(Value::PatInstRef(result)),
        Some(Value::Int(inst)) => {
            if *inst < 0 || *inst >= crate::limits::PAT_INSTANCES_MAX as i64 {
                sr.set_error("Invalid pattern instance number");
                return None;
            }
            result.inst = *inst as i16;
            Some(Value::PatInstRef(result))
        }
        Some(_) => {
            sr.set_error("Invalid instance value type");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(input: &str) -> Result<Value, crate::streader::StreaderError> {
        let env = EnvState::new();
        let mut rand = Random::from_seed(42);
        evaluate(input, &env, &Value::None, &mut rand)
    }

    #[test]
    fn arithmetic_with_parentheses() {
        assert_eq!(eval("(1 + 2) * 3").unwrap(), Value::Int(9));
    }

    #[test]
    fn precedence_orders_operators() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval("2 ^ 3 * 2").unwrap(), Value::Int(16));
    }

    #[test]
    fn ts_function_builds_timestamps() {
        assert_eq!(eval("ts(1, 0)").unwrap(), Value::Tstamp(Tstamp::new(1, 0)));
        assert_eq!(eval("ts()").unwrap(), Value::Tstamp(Tstamp::zero()));
    }

    #[test]
    fn rand_is_seeded_and_bounded() {
        let env = EnvState::new();
        let mut a = Random::from_seed(42);
        let mut b = Random::from_seed(42);
        let va = evaluate("rand(1.0)", &env, &Value::None, &mut a).unwrap();
        let vb = evaluate("rand(1.0)", &env, &Value::None, &mut b).unwrap();
        assert_eq!(va, vb);
        match va {
            Value::Float(x) => assert!((0.0..1.0).contains(&x)),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = eval("1 / 0").unwrap_err();
        assert!(err.message.contains("zero"));
    }

    #[test]
    fn integer_division_promotes_only_when_inexact() {
        assert_eq!(eval("6 / 3").unwrap(), Value::Int(2));
        assert_eq!(eval("7 / 2").unwrap(), Value::Float(3.5));
    }

    #[test]
    fn modulo_takes_sign_of_divisor() {
        assert_eq!(eval("-1 % 3").unwrap(), Value::Int(2));
        assert_eq!(eval("7 % 3").unwrap(), Value::Int(1));
    }

    #[test]
    fn zero_to_the_zero_is_an_error() {
        assert!(eval("0 ^ 0").is_err());
        assert!(eval("0.0 ^ 0.0").is_err());
    }

    #[test]
    fn boolean_operators_require_booleans() {
        assert_eq!(eval("true & false").unwrap(), Value::Bool(false));
        assert_eq!(eval("true | false").unwrap(), Value::Bool(true));
        assert_eq!(eval("!true").unwrap(), Value::Bool(false));
        assert!(eval("true & 1").is_err());
    }

    #[test]
    fn comparisons_promote_arithmetic_types() {
        assert_eq!(eval("1 < 1.5").unwrap(), Value::Bool(true));
        assert_eq!(eval("ts(2, 0) = 2").unwrap(), Value::Bool(true));
        assert_eq!(eval("2 >= 2").unwrap(), Value::Bool(true));
    }

    #[test]
    fn environment_variables_resolve() {
        let mut env = EnvState::new();
        env.set("vol", Value::Float(0.5));
        let mut rand = Random::from_seed(1);
        let result = evaluate("vol * 2", &env, &Value::None, &mut rand).unwrap();
        assert_eq!(result, Value::Float(1.0));
    }

    #[test]
    fn meta_value_binds_to_dollar() {
        let env = EnvState::new();
        let mut rand = Random::from_seed(1);
        let result = evaluate("$ + 1", &env, &Value::Int(41), &mut rand).unwrap();
        assert_eq!(result, Value::Int(42));
    }

    #[test]
    fn strings_compare_for_equality() {
        assert_eq!(eval("'abc' = 'abc'").unwrap(), Value::Bool(true));
        assert_eq!(eval("'abc' != 'abd'").unwrap(), Value::Bool(true));
        assert!(eval("'abc' < 'abd'").is_err());
    }

    #[test]
    fn unmatched_parentheses_are_errors() {
        assert!(eval("(1 + 2").is_err());
        assert!(eval("1 + 2)").is_err());
    }

    #[test]
    fn empty_expression_is_an_error() {
        assert!(eval("").is_err());
        assert!(eval("()").is_err());
    }

    #[test]
    fn deep_nesting_overflows_the_stack() {
        let open = "(".repeat(40);
        let close = ")".repeat(40);
        let expr = format!("{}1{}", open, close);
        let err = eval(&expr).unwrap_err();
        assert!(err.message.contains("recursion depth"));
    }

    #[test]
    fn pat_function_builds_references() {
        assert_eq!(
            eval("pat(3, 1)").unwrap(),
            Value::PatInstRef(PatInstRef::new(3, 1))
        );
        assert!(eval("pat(99999)").is_err());
    }
}
