//! Restricted arithmetic evaluator for model-produced math expressions.
//!
//! Grammar:
//!
//! ```text
//! expr  := term (('+' | '-') term)*
//! term  := unary (('*' | '/' | '%') unary)*
//! unary := '-' unary | power
//! power := atom ('**' unary)?
//! atom  := number | '(' expr ')'
//! ```
//!
//! Anything else (names, calls, strings, unary plus) is rejected before any
//! value is computed. Nesting deeper than [`MAX_DEPTH`] is rejected too.

use thiserror::Error;

/// Bound on nested `unary` productions (parentheses, signs, exponent chains).
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected token {0:?} at {1}")]
    UnexpectedToken(String, usize),
    #[error("unsupported syntax {0:?}")]
    Unsupported(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("trailing input at {0}")]
    Trailing(usize),
}

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Num(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<(Tok, usize)>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let tok = match c {
            '0'..='9' | '.' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
                    i += 1;
                }
                // scientific notation: 1e3, 2.5E-2
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let lit: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                let n = lit
                    .parse::<f64>()
                    .map_err(|_| EvalError::UnexpectedToken(lit.clone(), start))?;
                out.push((Tok::Num(n), start));
                continue;
            }
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' if chars.get(i + 1) == Some(&'*') => {
                i += 1;
                Tok::Pow
            }
            '*' => Tok::Star,
            '/' if chars.get(i + 1) == Some(&'/') => {
                return Err(EvalError::Unsupported("//".into()));
            }
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            _ => {
                let rest: String = chars[start..].iter().take_while(|c| !c.is_whitespace()).collect();
                return Err(EvalError::Unsupported(rest));
            }
        };
        i += 1;
        out.push((tok, start));
    }
    Ok(out)
}

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.toks.get(self.pos).map(|(_, o)| *o).unwrap_or(usize::MAX)
    }

    fn unexpected(&self) -> EvalError {
        match self.toks.get(self.pos) {
            Some((t, o)) => EvalError::UnexpectedToken(format!("{:?}", t), *o),
            None => EvalError::UnexpectedToken("end of input".into(), self.offset()),
        }
    }

    fn expr(&mut self) -> Result<f64, EvalError> {
        let mut acc = self.term()?;
        loop {
            match self.peek() {
                Some(Tok::Plus) => {
                    self.pos += 1;
                    acc += self.term()?;
                }
                Some(Tok::Minus) => {
                    self.pos += 1;
                    acc -= self.term()?;
                }
                _ => return Ok(acc),
            }
        }
    }

    fn term(&mut self) -> Result<f64, EvalError> {
        let mut acc = self.unary()?;
        loop {
            match self.peek() {
                Some(Tok::Star) => {
                    self.pos += 1;
                    acc *= self.unary()?;
                }
                Some(Tok::Slash) => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    if rhs == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    acc /= rhs;
                }
                Some(Tok::Percent) => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    if rhs == 0.0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    // sign follows the divisor
                    acc = acc - rhs * (acc / rhs).floor();
                }
                _ => return Ok(acc),
            }
        }
    }

    /// Every recursive path goes through here, so the depth check lives here.
    fn unary(&mut self) -> Result<f64, EvalError> {
        if self.depth >= MAX_DEPTH {
            return Err(EvalError::Unsupported("nesting too deep".into()));
        }
        self.depth += 1;
        let v = self.signed();
        self.depth -= 1;
        v
    }

    fn signed(&mut self) -> Result<f64, EvalError> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Tok::Plus) => Err(EvalError::Unsupported("unary +".into())),
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<f64, EvalError> {
        let base = self.atom()?;
        if self.peek() == Some(&Tok::Pow) {
            self.pos += 1;
            let exp = self.unary()?;
            if base == 0.0 && exp < 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64, EvalError> {
        match self.peek().cloned() {
            Some(Tok::Num(n)) => {
                self.pos += 1;
                Ok(n)
            }
            Some(Tok::LParen) => {
                self.pos += 1;
                let v = self.expr()?;
                if self.peek() != Some(&Tok::RParen) {
                    return Err(self.unexpected());
                }
                self.pos += 1;
                Ok(v)
            }
            _ => Err(self.unexpected()),
        }
    }
}

/// Evaluates `src`, failing closed on anything outside the grammar.
pub fn evaluate(src: &str) -> Result<f64, EvalError> {
    let toks = tokenize(src)?;
    if toks.is_empty() {
        return Err(EvalError::Empty);
    }
    let mut p = Parser { toks, pos: 0, depth: 0 };
    let v = p.expr()?;
    if p.pos != p.toks.len() {
        return Err(EvalError::Trailing(p.offset()));
    }
    if !v.is_finite() {
        return Err(EvalError::Unsupported(format!("non-finite result {}", v)));
    }
    Ok(v)
}

/// Renders a result the way it should be typed or matched: integers without
/// a fractional part.
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        let s = format!("{:.10}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}
