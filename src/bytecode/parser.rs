//! Text format for bytecode functions.
//!
//! ```text
//! ; comments start with ';' or '#'
//! .func sum_to args=1 returns=1
//!     imm 0           ; acc
//! loop:
//!     pull 0
//!     imm 0
//!     beq done
//!     ...
//!     jump loop
//! done:
//!     shove 0
//!     ret
//! ```
//!
//! Parsing also checks the stack shape of every function: no underflow,
//! in-range `pull`/`shove`/`drop` operands, one depth per label and the
//! declared result count at every return.

use super::ops::{BinaryOp, Compare, Function, FunctionShape, Insn, Module, UnaryOp, binary_name};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into() }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

struct Header {
    name: String,
    args: usize,
    returns: usize,
    tail_call: bool,
    line: usize,
    /// (line number, text) of each body line.
    body: Vec<(usize, String)>,
}

fn strip_comment(line: &str) -> &str {
    let end = line.find([';', '#']).unwrap_or(line.len());
    line[..end].trim()
}

/// Parse a decimal, negative or `0x`-prefixed integer.
pub fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}

fn parse_count(text: &str, line: usize, what: &str) -> Result<usize, ParseError> {
    text.parse::<usize>()
        .map_err(|_| ParseError::new(line, format!("invalid {} '{}'", what, text)))
}

fn parse_header(rest: &str, line: usize) -> Result<Header, ParseError> {
    let mut parts = rest.split_whitespace();
    let name = parts
        .next()
        .ok_or_else(|| ParseError::new(line, ".func needs a name"))?
        .to_string();
    let mut header = Header { name, args: 0, returns: 0, tail_call: false, line, body: Vec::new() };
    for part in parts {
        if let Some(n) = part.strip_prefix("args=") {
            header.args = parse_count(n, line, "argument count")?;
        } else if let Some(n) = part.strip_prefix("returns=") {
            header.returns = parse_count(n, line, "return count")?;
        } else if part == "tailcall" {
            header.tail_call = true;
        } else {
            return Err(ParseError::new(line, format!("unknown function attribute '{}'", part)));
        }
    }
    Ok(header)
}

/// Parse a source file into a module of shape-checked functions.
pub fn parse(source: &str) -> Result<Module, ParseError> {
    let mut headers: Vec<Header> = Vec::new();
    for (i, raw) in source.lines().enumerate() {
        let line = i + 1;
        let text = strip_comment(raw);
        if text.is_empty() {
            continue;
        }
        if let Some(rest) = text.strip_prefix(".func") {
            let header = parse_header(rest, line)?;
            if headers.iter().any(|h| h.name == header.name) {
                return Err(ParseError::new(line, format!("function '{}' defined twice", header.name)));
            }
            headers.push(header);
        } else {
            match headers.last_mut() {
                Some(header) => header.body.push((line, text.to_string())),
                None => return Err(ParseError::new(line, "instruction outside of a function")),
            }
        }
    }

    let signatures: HashMap<&str, (usize, usize, usize)> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.name.as_str(), (i, h.args, h.returns)))
        .collect();

    let mut functions = Vec::with_capacity(headers.len());
    for header in &headers {
        functions.push(parse_function(header, &signatures)?);
    }
    Ok(Module { functions })
}

fn parse_function(
    header: &Header,
    signatures: &HashMap<&str, (usize, usize, usize)>,
) -> Result<Function, ParseError> {
    let mut labels: HashMap<&str, usize> = HashMap::new();
    for (line, text) in &header.body {
        if let Some(name) = text.strip_suffix(':') {
            let name = name.trim();
            if labels.insert(name, labels.len()).is_some() {
                return Err(ParseError::new(*line, format!("label '{}' defined twice", name)));
            }
        }
    }

    let mut code = Vec::with_capacity(header.body.len());
    let mut lines = Vec::with_capacity(header.body.len());
    for (line, text) in &header.body {
        let line = *line;
        let insn = if text.ends_with(':') {
            Insn::Label
        } else {
            parse_insn(text, line, &labels, signatures)?
        };
        code.push(insn);
        lines.push(line);
    }

    let mut shape = FunctionShape {
        args: header.args,
        returns: header.returns,
        labels: labels.len(),
        max_depth: header.args,
        tail_call: header.tail_call,
    };
    shape.max_depth = check_shape(&shape, &code, &lines, header.line)?;
    Ok(Function { name: header.name.clone(), shape, code })
}

fn parse_insn(
    text: &str,
    line: usize,
    labels: &HashMap<&str, usize>,
    signatures: &HashMap<&str, (usize, usize, usize)>,
) -> Result<Insn, ParseError> {
    let mut parts = text.split_whitespace();
    let op = parts.next().unwrap_or_default();
    let operand = parts.next();
    if let Some(extra) = parts.next() {
        return Err(ParseError::new(line, format!("unexpected '{}' after {}", extra, op)));
    }
    let need = |what: &str| {
        operand.ok_or_else(|| ParseError::new(line, format!("{} needs {}", op, what)))
    };
    let label = |name: &str| {
        labels
            .get(name)
            .copied()
            .ok_or_else(|| ParseError::new(line, format!("undefined label '{}'", name)))
    };

    if let Some(bin) = BinaryOp::ALL.iter().find(|b| binary_name(**b) == op) {
        return no_operand(operand, line, op).map(|_| Insn::Binary(*bin));
    }
    if let Some(cond) = op
        .strip_prefix('b')
        .and_then(|c| Compare::ALL.iter().find(|cmp| cmp.name() == c))
    {
        let target = label(need("a label")?)?;
        return Ok(Insn::CompareBranch { cond: *cond, label: target });
    }

    let insn = match op {
        "imm" => {
            let text = need("a value")?;
            let value = parse_int(text)
                .filter(|v| (i32::MIN as i64..=u32::MAX as i64).contains(v))
                .ok_or_else(|| ParseError::new(line, format!("invalid immediate '{}'", text)))?;
            Insn::Immediate(value as u32 as i32)
        }
        "neg" => no_operand(operand, line, op).map(|_| Insn::Unary(UnaryOp::Neg))?,
        "not" => no_operand(operand, line, op).map(|_| Insn::Unary(UnaryOp::Not))?,
        "jump" => Insn::Jump(label(need("a label")?)?),
        "pull" => Insn::Pull(parse_count(need("a slot")?, line, "slot")?),
        "shove" => Insn::Shove(parse_count(need("a slot")?, line, "slot")?),
        "drop" => Insn::Drop(parse_count(need("a count")?, line, "count")?),
        "call" => {
            let name = need("a function name")?;
            let &(function, args, returns) = signatures
                .get(name)
                .ok_or_else(|| ParseError::new(line, format!("undefined function '{}'", name)))?;
            Insn::Call { function, args, returns }
        }
        "ret" => no_operand(operand, line, op).map(|_| Insn::Return)?,
        _ => return Err(ParseError::new(line, format!("unknown instruction '{}'", op))),
    };
    Ok(insn)
}

fn no_operand(operand: Option<&str>, line: usize, op: &str) -> Result<(), ParseError> {
    match operand {
        Some(extra) => Err(ParseError::new(line, format!("{} takes no operand, got '{}'", op, extra))),
        None => Ok(()),
    }
}

/// Walk the code tracking stack depth; returns the deepest point reached.
///
/// Code after a jump or return keeps the depth it had, so a label that is
/// only reached by later backward branches starts from there.
fn check_shape(
    shape: &FunctionShape,
    code: &[Insn],
    lines: &[usize],
    header_line: usize,
) -> Result<usize, ParseError> {
    let mut depth = shape.args;
    let mut max_depth = depth;
    let mut reachable = true;
    let mut label_depth: Vec<Option<usize>> = vec![None; shape.labels];
    let mut next_label = 0;

    for (insn, &line) in code.iter().zip(lines) {
        let need = move |n: usize| underflow(insn, depth, n, line);
        match *insn {
            Insn::Immediate(_) => depth += 1,
            Insn::Binary(_) => {
                need(2)?;
                depth -= 1;
            }
            Insn::Unary(_) => need(1)?,
            Insn::CompareBranch { label, .. } => {
                need(2)?;
                depth -= 2;
                join(&mut label_depth, label, depth, line)?;
            }
            Insn::Jump(label) => {
                join(&mut label_depth, label, depth, line)?;
                reachable = false;
            }
            Insn::Label => {
                if reachable {
                    join(&mut label_depth, next_label, depth, line)?;
                } else {
                    match label_depth[next_label] {
                        Some(known) => depth = known,
                        None => label_depth[next_label] = Some(depth),
                    }
                }
                next_label += 1;
                reachable = true;
            }
            Insn::Pull(slot) => {
                if slot >= depth {
                    return Err(ParseError::new(line, format!("pull {} at depth {}", slot, depth)));
                }
                depth += 1;
            }
            Insn::Shove(slot) => {
                if depth < 2 || slot >= depth - 1 {
                    return Err(ParseError::new(line, format!("shove {} at depth {}", slot, depth)));
                }
                depth -= 1;
            }
            Insn::Drop(n) => {
                need(n)?;
                depth -= n;
            }
            Insn::Call { args, returns, .. } => {
                need(args)?;
                depth = depth - args + returns;
            }
            Insn::Return => {
                if depth != shape.returns {
                    return Err(ParseError::new(
                        line,
                        format!("ret at depth {}, function returns {}", depth, shape.returns),
                    ));
                }
                reachable = false;
            }
        }
        max_depth = max_depth.max(depth);
    }

    if reachable && depth != shape.returns {
        let line = lines.last().copied().unwrap_or(header_line);
        return Err(ParseError::new(
            line,
            format!("function ends at depth {}, but returns {}", depth, shape.returns),
        ));
    }
    Ok(max_depth)
}

fn underflow(insn: &Insn, depth: usize, n: usize, line: usize) -> Result<(), ParseError> {
    if depth < n {
        Err(ParseError::new(
            line,
            format!("stack underflow: {} needs {} values, depth is {}", insn, n, depth),
        ))
    } else {
        Ok(())
    }
}

/// Record the depth a label is entered with, or check it against the
/// depth recorded earlier.
fn join(
    label_depth: &mut [Option<usize>],
    label: usize,
    depth: usize,
    line: usize,
) -> Result<(), ParseError> {
    match label_depth[label] {
        Some(expected) if expected != depth => Err(ParseError::new(
            line,
            format!("stack depth {} at branch, label expects {}", depth, expected),
        )),
        Some(_) => Ok(()),
        None => {
            label_depth[label] = Some(depth);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_square() {
        let module = parse(".func square args=1 returns=1\n  pull 0\n  mul\n  ret\n").unwrap();
        let f = &module.functions[0];
        assert_eq!(f.name, "square");
        assert_eq!(f.code, vec![Insn::Pull(0), Insn::Binary(BinaryOp::Mul), Insn::Return]);
        assert_eq!(f.shape.max_depth, 2);
        assert_eq!(f.shape.labels, 0);
    }

    #[test]
    fn test_labels_numbered_in_declaration_order() {
        let src = "
            .func f args=1 returns=1
                jump second
            first:
                jump first
            second:
                ret
        ";
        let f = &parse(src).unwrap().functions[0];
        assert_eq!(f.code[0], Insn::Jump(1));
        assert_eq!(f.code[2], Insn::Jump(0));
        assert_eq!(f.shape.labels, 2);
    }

    #[test]
    fn test_calls_resolve_signatures() {
        let src = "
            .func main returns=1
                imm 2
                imm 3
                call add2   # forward reference
                ret
            .func add2 args=2 returns=1 tailcall
                add
        ";
        let module = parse(src).unwrap();
        assert_eq!(
            module.functions[0].code[2],
            Insn::Call { function: 1, args: 2, returns: 1 }
        );
        assert!(module.functions[1].shape.tail_call);
        assert_eq!(module.find("add2"), Some(1));
    }

    #[test]
    fn test_immediates() {
        let f = &parse(".func f returns=3\nimm -5\nimm 0xffffffff\nimm 0x10\n").unwrap().functions[0];
        assert_eq!(f.code, vec![Insn::Immediate(-5), Insn::Immediate(-1), Insn::Immediate(16)]);
        let err = parse(".func f returns=1\nimm 0x100000000\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_shape_errors() {
        let err = parse(".func f\nadd\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("underflow"));

        let err = parse(".func f args=1 returns=1\npull 1\nret\n").unwrap_err();
        assert!(err.message.contains("pull 1"));

        let err = parse(".func f args=2 returns=1\nret\n").unwrap_err();
        assert!(err.message.contains("ret at depth 2"));

        let err = parse(".func f args=2\nl:\nimm 1\njump l\n").unwrap_err();
        assert_eq!(err.line, 4);
        assert!(err.message.contains("label expects 2"));

        let err = parse(".func f args=1\nbeq nowhere\n").unwrap_err();
        assert!(err.message.contains("undefined label"));
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(parse("add\n").unwrap_err().message, "instruction outside of a function");
        assert!(parse(".func f\nfrob\n").unwrap_err().message.contains("unknown instruction"));
        assert!(parse(".func f\n.func f\n").unwrap_err().message.contains("defined twice"));
        assert!(parse(".func f args=x\n").unwrap_err().message.contains("argument count"));
        assert!(parse(".func f args=1\nneg 3\n").unwrap_err().message.contains("no operand"));
    }

    #[test]
    fn test_falling_off_the_end() {
        assert!(parse(".func f args=1 returns=1\npull 0\n").is_err());
        assert!(parse(".func f args=1 returns=1\nimm 1\nadd\n").is_ok());
    }
}
