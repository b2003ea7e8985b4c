//! Arithmetic used by the `concurrency` and `max_memory` settings, e.g. `max(1,min(3,MAX-1))`.
//!
//! Grammar: numbers, the `MAX` variable, `+ - * /`, parentheses, unary minus and the
//! variadic functions `min(...)` and `max(...)`.

use anyhow::{anyhow, bail, Context};

/// Rewrites the legacy lowercase `max` variable to `MAX`. A `max` followed by `(` is the
/// function and stays as is.
pub fn max_to_upper(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut rest = expr;
    while let Some(pos) = rest.find("max") {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 3..];
        if after.trim_start().starts_with('(') {
            out.push_str("max");
        } else {
            out.push_str("MAX");
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

pub fn evaluate(expr: &str, max: f64) -> anyhow::Result<f64> {
    let mut parser = Parser {
        input: expr.as_bytes(),
        pos: 0,
        max,
    };
    let value = parser
        .expression()
        .with_context(|| format!("Unable to parse expression '{expr}'"))?;
    parser.skip_whitespace();
    if parser.pos != parser.input.len() {
        bail!(
            "Unable to parse expression '{expr}': unexpected input at offset {}",
            parser.pos
        );
    }
    if !value.is_finite() {
        bail!("Expression '{expr}' does not evaluate to a finite number");
    }
    Ok(value)
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    max: f64,
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while self.input.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.input.get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> anyhow::Result<()> {
        if self.eat(byte) {
            Ok(())
        } else {
            bail!("expected '{}' at offset {}", byte as char, self.pos)
        }
    }

    fn expression(&mut self) -> anyhow::Result<f64> {
        let mut value = self.term()?;
        loop {
            if self.eat(b'+') {
                value += self.term()?;
            } else if self.eat(b'-') {
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> anyhow::Result<f64> {
        let mut value = self.unary()?;
        loop {
            if self.eat(b'*') {
                value *= self.unary()?;
            } else if self.eat(b'/') {
                let divisor = self.unary()?;
                if divisor == 0.0 {
                    bail!("division by zero");
                }
                value /= divisor;
            } else {
                return Ok(value);
            }
        }
    }

    fn unary(&mut self) -> anyhow::Result<f64> {
        if self.eat(b'-') {
            Ok(-self.unary()?)
        } else if self.eat(b'+') {
            self.unary()
        } else {
            self.primary()
        }
    }

    fn primary(&mut self) -> anyhow::Result<f64> {
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let value = self.expression()?;
                self.expect(b')')?;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == b'.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.identifier(),
            Some(c) => bail!("unexpected '{}' at offset {}", c as char, self.pos),
            None => bail!("unexpected end of expression"),
        }
    }

    fn number(&mut self) -> anyhow::Result<f64> {
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_digit() || *c == b'.')
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.pos])?;
        text.parse::<f64>()
            .map_err(|_| anyhow!("invalid number '{text}'"))
    }

    fn identifier(&mut self) -> anyhow::Result<f64> {
        let start = self.pos;
        while self
            .input
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_')
        {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.input[start..self.pos])?;
        match name {
            "MAX" => Ok(self.max),
            "min" | "max" => {
                let args = self.arguments()?;
                let fold: fn(f64, f64) -> f64 = if name == "min" { f64::min } else { f64::max };
                args.into_iter()
                    .reduce(fold)
                    .ok_or_else(|| anyhow!("{name}() needs at least one argument"))
            }
            _ => bail!("unknown name '{name}'"),
        }
    }

    fn arguments(&mut self) -> anyhow::Result<Vec<f64>> {
        self.expect(b'(')?;
        let mut args = vec![self.expression()?];
        while self.eat(b',') {
            args.push(self.expression()?);
        }
        self.expect(b')')?;
        Ok(args)
    }
}

#[cfg(test)]
mod expression_tests {
    use super::*;

    #[test]
    fn test_default_concurrency() {
        let expr = "max(1,min(3,MAX-1))";
        assert_eq!(evaluate(expr, 16.0).unwrap(), 3.0);
        assert_eq!(evaluate(expr, 3.0).unwrap(), 2.0);
        assert_eq!(evaluate(expr, 1.0).unwrap(), 1.0);
    }

    #[test]
    fn test_precedence_and_unary_minus() {
        assert_eq!(evaluate("MAX/2", 8192.0).unwrap(), 4096.0);
        assert_eq!(evaluate("2 + 3 * 4", 0.0).unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4", 0.0).unwrap(), 20.0);
        assert_eq!(evaluate("-MAX + 10", 4.0).unwrap(), 6.0);
        assert_eq!(evaluate("min(MAX, 4, 2.5)", 8.0).unwrap(), 2.5);
        assert_eq!(evaluate(" 7 ", 0.0).unwrap(), 7.0);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(evaluate("", 4.0).is_err());
        assert!(evaluate("MAX -", 4.0).is_err());
        assert!(evaluate("cores", 4.0).is_err());
        assert!(evaluate("min()", 4.0).is_err());
        assert!(evaluate("4 / 0", 4.0).is_err());
        assert!(evaluate("(1 + 2", 4.0).is_err());
        assert!(evaluate("1 2", 4.0).is_err());
    }

    #[test]
    fn test_max_to_upper() {
        assert_eq!(max_to_upper("max-1"), "MAX-1");
        assert_eq!(max_to_upper("max"), "MAX");
        assert_eq!(max_to_upper("max(1, max - 1)"), "max(1, MAX - 1)");
        assert_eq!(max_to_upper("max (1,2)"), "max (1,2)");
        assert_eq!(max_to_upper("MAX/2"), "MAX/2");
    }
}
