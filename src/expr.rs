//! Expression resolver for block parameters.
//!
//! Parameter fields in a diagram may hold literal numbers or small textual
//! expressions (`"2*pi*fc"`, `"\\tau"`, `"clamp(k, 0, 10)"`). This module
//! tokenizes such text, converts it to RPN with the shunting-yard algorithm,
//! and evaluates it against the run's variable environment merged over a
//! fixed set of built-in functions and constants. Evaluation never fails
//! hard: malformed input, unknown identifiers, and degenerate math all
//! collapse to `NaN`, and the `resolve_*` wrappers map non-finite results
//! to safe defaults.

use std::collections::HashMap;

use crate::diagram::ParamValue;

/// A token produced by the expression tokenizer.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    OpenParen,
    CloseParen,
    Comma,
}

/// Binary/unary operators ordered by the shunting-yard precedence table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Pow,
    Neg,
    Mul,
    Div,
    Add,
    Sub,
}

impl Op {
    fn precedence(self) -> u8 {
        match self {
            Op::Pow => 4,
            Op::Neg => 3,
            Op::Mul | Op::Div => 2,
            Op::Add | Op::Sub => 1,
        }
    }

    fn right_associative(self) -> bool {
        matches!(self, Op::Pow | Op::Neg)
    }

    fn from_char(ch: char) -> Option<Self> {
        match ch {
            '^' => Some(Op::Pow),
            '*' => Some(Op::Mul),
            '/' => Some(Op::Div),
            '+' => Some(Op::Add),
            '-' => Some(Op::Sub),
            _ => None,
        }
    }
}

/// An RPN output item.
#[derive(Debug, Clone, PartialEq)]
enum RpnItem {
    Number(f64),
    Ident(String),
    Op(Op),
    Func { name: String, argc: usize },
}

/// Strip LaTeX-style command prefixes: `\tau` becomes `tau`.
fn strip_latex_commands(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut chars = expr.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' && chars.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            continue;
        }
        out.push(ch);
    }
    out
}

/// Tokenize an expression. Any character outside the grammar rejects the
/// whole input.
fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch.is_ascii_digit() || ch == '.' {
            chars.next();
            let mut end = start + ch.len_utf8();
            while let Some(&(pos, c)) = chars.peek() {
                if c.is_ascii_digit() || c == '.' {
                    chars.next();
                    end = pos + c.len_utf8();
                } else {
                    break;
                }
            }
            if let Some(&(pos, c)) = chars.peek() {
                if c == 'e' || c == 'E' {
                    chars.next();
                    end = pos + c.len_utf8();
                    if let Some(&(pos, sign)) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            chars.next();
                            end = pos + sign.len_utf8();
                        }
                    }
                    while let Some(&(pos, c)) = chars.peek() {
                        if c.is_ascii_digit() {
                            chars.next();
                            end = pos + c.len_utf8();
                        } else {
                            break;
                        }
                    }
                }
            }
            let text = &input[start..end];
            tokens.push(Token::Number(text.parse::<f64>().unwrap_or(f64::NAN)));
            continue;
        }
        if ch.is_ascii_alphabetic() || ch == '_' {
            chars.next();
            let mut end = start + ch.len_utf8();
            while let Some(&(pos, c)) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    chars.next();
                    end = pos + c.len_utf8();
                } else {
                    break;
                }
            }
            tokens.push(Token::Ident(input[start..end].to_string()));
            continue;
        }
        match ch {
            '(' => tokens.push(Token::OpenParen),
            ')' => tokens.push(Token::CloseParen),
            ',' => tokens.push(Token::Comma),
            '+' | '-' | '*' | '/' | '^' => tokens.push(Token::Op(ch)),
            _ => return None,
        }
        chars.next();
    }
    Some(tokens)
}

/// What the previous token was, for unary-minus detection and function
/// argument counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prev {
    Start,
    Value,
    Operator,
    OpenParen,
    Comma,
    Func,
}

#[derive(Debug)]
enum StackItem {
    Op(Op),
    OpenParen,
    Func(String),
}

struct ParenFrame {
    is_func: bool,
    argc: usize,
}

/// Convert a token stream to RPN. Returns `None` on malformed input
/// (unbalanced parens, stray commas, zero-argument calls).
fn to_rpn(tokens: &[Token]) -> Option<Vec<RpnItem>> {
    let mut output = Vec::new();
    let mut op_stack: Vec<StackItem> = Vec::new();
    let mut paren_stack: Vec<ParenFrame> = Vec::new();
    let mut prev = Prev::Start;

    // An operand directly after a function's `(` or a `,` begins a new
    // argument of the innermost call.
    fn bump_argc(paren_stack: &mut [ParenFrame], prev: Prev) {
        if matches!(prev, Prev::OpenParen | Prev::Comma) {
            if let Some(frame) = paren_stack.last_mut() {
                if frame.is_func {
                    frame.argc += 1;
                }
            }
        }
    }

    for (idx, token) in tokens.iter().enumerate() {
        match token {
            Token::Number(value) => {
                output.push(RpnItem::Number(*value));
                bump_argc(&mut paren_stack, prev);
                prev = Prev::Value;
            }
            Token::Ident(name) => {
                if matches!(tokens.get(idx + 1), Some(Token::OpenParen)) {
                    bump_argc(&mut paren_stack, prev);
                    op_stack.push(StackItem::Func(name.to_lowercase()));
                    prev = Prev::Func;
                } else {
                    output.push(RpnItem::Ident(name.clone()));
                    bump_argc(&mut paren_stack, prev);
                    prev = Prev::Value;
                }
            }
            Token::Op(ch) => {
                let op = if *ch == '-'
                    && matches!(prev, Prev::Start | Prev::Operator | Prev::OpenParen | Prev::Comma)
                {
                    bump_argc(&mut paren_stack, prev);
                    Op::Neg
                } else {
                    Op::from_char(*ch)?
                };
                while let Some(StackItem::Op(top)) = op_stack.last() {
                    let yield_top = if op.right_associative() {
                        op.precedence() < top.precedence()
                    } else {
                        op.precedence() <= top.precedence()
                    };
                    if !yield_top {
                        break;
                    }
                    output.push(RpnItem::Op(*top));
                    op_stack.pop();
                }
                op_stack.push(StackItem::Op(op));
                prev = Prev::Operator;
            }
            Token::OpenParen => {
                bump_argc(&mut paren_stack, prev);
                let is_func = matches!(op_stack.last(), Some(StackItem::Func(_)));
                op_stack.push(StackItem::OpenParen);
                paren_stack.push(ParenFrame { is_func, argc: 0 });
                prev = Prev::OpenParen;
            }
            Token::Comma => {
                loop {
                    match op_stack.last() {
                        Some(StackItem::Op(op)) => {
                            output.push(RpnItem::Op(*op));
                            op_stack.pop();
                        }
                        Some(_) => break,
                        None => return None,
                    }
                }
                prev = Prev::Comma;
            }
            Token::CloseParen => {
                loop {
                    match op_stack.last() {
                        Some(StackItem::Op(op)) => {
                            output.push(RpnItem::Op(*op));
                            op_stack.pop();
                        }
                        Some(StackItem::OpenParen) => break,
                        _ => return None,
                    }
                }
                op_stack.pop();
                let frame = paren_stack.pop()?;
                if frame.is_func {
                    match op_stack.pop() {
                        Some(StackItem::Func(name)) => {
                            if frame.argc == 0 {
                                return None;
                            }
                            output.push(RpnItem::Func {
                                name,
                                argc: frame.argc,
                            });
                        }
                        _ => return None,
                    }
                }
                prev = Prev::Value;
            }
        }
    }

    while let Some(item) = op_stack.pop() {
        match item {
            StackItem::Op(op) => output.push(RpnItem::Op(op)),
            _ => return None,
        }
    }
    Some(output)
}

/// Built-in constants visible to every expression unless shadowed by a
/// variable of the same name.
fn builtin_constant(name: &str) -> Option<f64> {
    match name {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        "inf" | "infinity" => Some(f64::INFINITY),
        _ => None,
    }
}

fn is_builtin_function(name: &str) -> bool {
    matches!(
        name,
        "abs" | "acos" | "asin" | "atan" | "atan2" | "ceil" | "clamp" | "cos" | "cosh" | "exp"
            | "floor" | "log" | "log10" | "log2" | "max" | "min" | "pow" | "round" | "sign"
            | "sin" | "sinc" | "sinh" | "sqrt" | "tan" | "tanh"
    )
}

/// Apply a built-in function. Missing arguments behave as `NaN`; surplus
/// arguments are ignored; `min`/`max` are variadic and NaN-contaminating.
fn apply_function(name: &str, args: &[f64]) -> f64 {
    let arg = |i: usize| args.get(i).copied().unwrap_or(f64::NAN);
    match name {
        "abs" => arg(0).abs(),
        "acos" => arg(0).acos(),
        "asin" => arg(0).asin(),
        "atan" => arg(0).atan(),
        "atan2" => arg(0).atan2(arg(1)),
        "ceil" => arg(0).ceil(),
        "clamp" => arg(0).max(arg(1)).min(arg(2)),
        "cos" => arg(0).cos(),
        "cosh" => arg(0).cosh(),
        "exp" => arg(0).exp(),
        "floor" => arg(0).floor(),
        "log" => arg(0).ln(),
        "log10" => arg(0).log10(),
        "log2" => arg(0).log2(),
        "max" => {
            if args.iter().any(|v| v.is_nan()) {
                f64::NAN
            } else {
                args.iter().copied().fold(f64::NEG_INFINITY, f64::max)
            }
        }
        "min" => {
            if args.iter().any(|v| v.is_nan()) {
                f64::NAN
            } else {
                args.iter().copied().fold(f64::INFINITY, f64::min)
            }
        }
        "pow" => arg(0).powf(arg(1)),
        // Rounds half toward positive infinity.
        "round" => (arg(0) + 0.5).floor(),
        "sign" => {
            let x = arg(0);
            if x.is_nan() || x == 0.0 {
                x
            } else if x > 0.0 {
                1.0
            } else {
                -1.0
            }
        }
        "sin" => arg(0).sin(),
        "sinc" => {
            let x = arg(0);
            if x == 0.0 {
                1.0
            } else {
                let px = std::f64::consts::PI * x;
                px.sin() / px
            }
        }
        "sinh" => arg(0).sinh(),
        "sqrt" => arg(0).sqrt(),
        "tan" => arg(0).tan(),
        "tanh" => arg(0).tanh(),
        _ => f64::NAN,
    }
}

fn eval_rpn(rpn: &[RpnItem], variables: &HashMap<String, f64>) -> f64 {
    let mut stack: Vec<f64> = Vec::new();
    for item in rpn {
        match item {
            RpnItem::Number(value) => stack.push(*value),
            RpnItem::Ident(name) => {
                let value = variables
                    .get(name)
                    .copied()
                    .or_else(|| builtin_constant(name));
                match value {
                    Some(v) => stack.push(v),
                    None => return f64::NAN,
                }
            }
            RpnItem::Op(op) => {
                if *op == Op::Neg {
                    match stack.pop() {
                        Some(a) => stack.push(-a),
                        None => return f64::NAN,
                    }
                    continue;
                }
                let (b, a) = match (stack.pop(), stack.pop()) {
                    (Some(b), Some(a)) => (b, a),
                    _ => return f64::NAN,
                };
                stack.push(match op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    Op::Div => a / b,
                    Op::Pow => a.powf(b),
                    Op::Neg => unreachable!(),
                });
            }
            RpnItem::Func { name, argc } => {
                // A variable shadowing a function name makes the call
                // unresolvable, same as an unknown function.
                if variables.contains_key(name) || !is_builtin_function(name) {
                    return f64::NAN;
                }
                if stack.len() < *argc {
                    return f64::NAN;
                }
                let args: Vec<f64> = stack.split_off(stack.len() - argc);
                stack.push(apply_function(name, &args));
            }
        }
    }
    if stack.len() != 1 {
        return f64::NAN;
    }
    stack[0]
}

/// Evaluate a textual expression against a variable environment.
///
/// Returns `NaN` for malformed syntax, unknown identifiers, or characters
/// outside the grammar. Plain numeric literals short-circuit the parser.
pub fn eval_expression(expr: &str, variables: &HashMap<String, f64>) -> f64 {
    let stripped = strip_latex_commands(expr);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return f64::NAN;
    }
    if let Ok(direct) = trimmed.parse::<f64>() {
        return direct;
    }
    let tokens = match tokenize(trimmed) {
        Some(tokens) if !tokens.is_empty() => tokens,
        _ => return f64::NAN,
    };
    let rpn = match to_rpn(&tokens) {
        Some(rpn) if !rpn.is_empty() => rpn,
        _ => return f64::NAN,
    };
    eval_rpn(&rpn, variables)
}

/// Resolve a raw parameter value to a single finite number, falling back
/// to 0 for anything unresolvable.
pub fn resolve_numeric(value: &ParamValue, variables: &HashMap<String, f64>) -> f64 {
    match value {
        ParamValue::Null => 0.0,
        ParamValue::Number(v) => {
            if v.is_finite() {
                *v
            } else {
                0.0
            }
        }
        ParamValue::Bool(_) => 0.0,
        ParamValue::Text(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return 0.0;
            }
            if let Ok(direct) = trimmed.parse::<f64>() {
                if direct.is_finite() {
                    return direct;
                }
            }
            // Bare identifiers resolve straight from the environment (and
            // its pi/e built-ins) before the full parser gets involved.
            if let Some(v) = lookup_bare(trimmed, variables) {
                return v;
            }
            let stripped = trimmed.strip_prefix('\\').unwrap_or(trimmed);
            if let Some(v) = lookup_bare(stripped, variables) {
                return v;
            }
            let evaluated = eval_expression(trimmed, variables);
            if evaluated.is_finite() {
                evaluated
            } else {
                0.0
            }
        }
        ParamValue::List(items) => {
            if items.len() == 1 {
                resolve_numeric(&items[0], variables)
            } else {
                0.0
            }
        }
        ParamValue::Subsystem(_) => 0.0,
    }
}

fn lookup_bare(name: &str, variables: &HashMap<String, f64>) -> Option<f64> {
    let value = variables.get(name).copied().or(match name {
        "pi" => Some(std::f64::consts::PI),
        "e" => Some(std::f64::consts::E),
        _ => None,
    })?;
    Some(if value.is_finite() { value } else { 0.0 })
}

/// Resolve a raw parameter value to a numeric array: arrays resolve
/// element-wise, strings split on commas, everything else is empty.
pub fn resolve_array(value: &ParamValue, variables: &HashMap<String, f64>) -> Vec<f64> {
    match value {
        ParamValue::List(items) => items
            .iter()
            .map(|item| resolve_numeric(item, variables))
            .collect(),
        ParamValue::Text(text) => text
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| resolve_numeric(&ParamValue::Text(part.to_string()), variables))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn vars(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect()
    }

    #[test]
    fn evaluates_arithmetic_with_precedence() {
        let env = HashMap::new();
        assert_relative_eq!(eval_expression("2+3*4", &env), 14.0);
        assert_relative_eq!(eval_expression("(2+3)*4", &env), 20.0);
        assert_relative_eq!(eval_expression("2^3^2", &env), 512.0);
        assert_relative_eq!(eval_expression("-2^2", &env), -4.0);
        assert_relative_eq!(eval_expression("10/4", &env), 2.5);
    }

    #[test]
    fn evaluates_unary_minus_in_calls() {
        let env = HashMap::new();
        assert_relative_eq!(eval_expression("max(-1, -5)", &env), -1.0);
        assert_relative_eq!(eval_expression("abs(-3)", &env), 3.0);
        assert_relative_eq!(eval_expression("-(1+2)", &env), -3.0);
    }

    #[test]
    fn evaluates_functions_and_constants() {
        let env = HashMap::new();
        assert_relative_eq!(eval_expression("sin(pi/2)", &env), 1.0, epsilon = 1e-12);
        assert_relative_eq!(eval_expression("clamp(5, 0, 2)", &env), 2.0);
        assert_relative_eq!(eval_expression("min(3, 1, 2)", &env), 1.0);
        assert_relative_eq!(eval_expression("sinc(0)", &env), 1.0);
        assert_relative_eq!(eval_expression("pow(2, 10)", &env), 1024.0);
        assert_relative_eq!(eval_expression("log(e)", &env), 1.0, epsilon = 1e-12);
        assert!(eval_expression("inf", &env).is_infinite());
    }

    #[test]
    fn resolves_variables_and_latex_names() {
        let env = vars(&[("tau", 2.0), ("mg", 9.0)]);
        assert_relative_eq!(eval_expression("2*tau", &env), 4.0);
        assert_relative_eq!(eval_expression("\\tau + 1", &env), 3.0);
        assert_relative_eq!(eval_expression("-mg", &env), -9.0);
    }

    #[test]
    fn variables_shadow_builtins() {
        let env = vars(&[("pi", 3.0), ("sin", 5.0)]);
        assert_relative_eq!(eval_expression("pi", &env), 3.0);
        assert_relative_eq!(eval_expression("sin", &env), 5.0);
        assert!(eval_expression("sin(1)", &env).is_nan());
    }

    #[test]
    fn malformed_input_is_nan() {
        let env = HashMap::new();
        assert!(eval_expression("", &env).is_nan());
        assert!(eval_expression("2$3", &env).is_nan());
        assert!(eval_expression("(1+2", &env).is_nan());
        assert!(eval_expression("1,2", &env).is_nan());
        assert!(eval_expression("max()", &env).is_nan());
        assert!(eval_expression("nosuchvar", &env).is_nan());
    }

    #[test]
    fn numeric_literals_short_circuit() {
        let env = HashMap::new();
        assert_relative_eq!(eval_expression("1e-3", &env), 0.001);
        assert_relative_eq!(eval_expression("  2.5 ", &env), 2.5);
        assert_relative_eq!(eval_expression("-4", &env), -4.0);
    }

    #[test]
    fn resolve_numeric_maps_unresolvable_to_zero() {
        let env = vars(&[("k", 2.0)]);
        assert_relative_eq!(resolve_numeric(&ParamValue::Number(5.0), &env), 5.0);
        assert_relative_eq!(
            resolve_numeric(&ParamValue::Text("k*3".into()), &env),
            6.0
        );
        assert_relative_eq!(resolve_numeric(&ParamValue::Text("junk!".into()), &env), 0.0);
        assert_relative_eq!(resolve_numeric(&ParamValue::Text("inf".into()), &env), 0.0);
        assert_relative_eq!(resolve_numeric(&ParamValue::Number(f64::NAN), &env), 0.0);
        assert_relative_eq!(resolve_numeric(&ParamValue::Null, &env), 0.0);
        assert_relative_eq!(
            resolve_numeric(&ParamValue::List(vec![ParamValue::Number(7.0)]), &env),
            7.0
        );
    }

    #[test]
    fn resolve_array_accepts_lists_and_csv_strings() {
        let env = vars(&[("I", 1.0), ("mg", 1.0)]);
        let list = ParamValue::List(vec![
            ParamValue::Text("I".into()),
            ParamValue::Number(0.0),
            ParamValue::Text("-mg".into()),
        ]);
        assert_eq!(resolve_array(&list, &env), vec![1.0, 0.0, -1.0]);
        assert_eq!(
            resolve_array(&ParamValue::Text("1, 2,3".into()), &env),
            vec![1.0, 2.0, 3.0]
        );
        assert_eq!(resolve_array(&ParamValue::Number(5.0), &env), Vec::<f64>::new());
    }
}
