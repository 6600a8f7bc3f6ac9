//! A small integer expression grammar for generator handlers.
//!
//! `accu` updates its accumulator with an expression over the previous
//! value `A`, e.g. `A*0x5DEECE66D+11`. Supported: decimal and hex
//! literals, parentheses, unary minus, and the binary operators
//! `* / % + - << >> & ^ |` with conventional precedence. All arithmetic
//! is wrapping 64-bit.

use crate::error::{Error, Result};

/// Parses a decimal or `0x` hex integer literal
pub(crate) fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()? as i64
    } else {
        s.parse::<u64>().ok()? as i64
    };
    Some(if neg { value.wrapping_neg() } else { value })
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    /// Value of the free variable `A`
    a: i64,
}

impl<'a> Parser<'a> {
    fn peek(&mut self) -> Option<u8> {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, token: &[u8]) -> bool {
        self.peek();
        if self.input[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn fail(&self, what: &str) -> Error {
        Error::argument(format!(
            "bad expression near offset {}: {what}",
            self.pos
        ))
    }

    fn atom(&mut self) -> Result<i64> {
        match self.peek() {
            Some(b'(') => {
                self.bump();
                let value = self.bitor()?;
                if self.bump() != Some(b')') {
                    return Err(self.fail("expected closing parenthesis"));
                }
                Ok(value)
            }
            Some(b'-') => {
                self.bump();
                Ok(self.atom()?.wrapping_neg())
            }
            Some(b'A') | Some(b'a') => {
                self.bump();
                Ok(self.a)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self
                    .input
                    .get(self.pos)
                    .is_some_and(|c| c.is_ascii_alphanumeric())
                {
                    self.pos += 1;
                }
                let text = std::str::from_utf8(&self.input[start..self.pos])
                    .expect("ascii digits are utf-8");
                parse_int(text).ok_or_else(|| self.fail("invalid number"))
            }
            _ => Err(self.fail("expected a value")),
        }
    }

    fn muldiv(&mut self) -> Result<i64> {
        let mut value = self.atom()?;
        loop {
            if self.eat(b"*") {
                value = value.wrapping_mul(self.atom()?);
            } else if self.eat(b"/") {
                let rhs = self.atom()?;
                if rhs == 0 {
                    return Err(self.fail("division by zero"));
                }
                value = value.wrapping_div(rhs);
            } else if self.eat(b"%") {
                let rhs = self.atom()?;
                if rhs == 0 {
                    return Err(self.fail("division by zero"));
                }
                value = value.wrapping_rem(rhs);
            } else {
                return Ok(value);
            }
        }
    }

    fn addsub(&mut self) -> Result<i64> {
        let mut value = self.muldiv()?;
        loop {
            if self.eat(b"+") {
                value = value.wrapping_add(self.muldiv()?);
            } else if self.peek() == Some(b'-') {
                self.bump();
                value = value.wrapping_sub(self.muldiv()?);
            } else {
                return Ok(value);
            }
        }
    }

    fn shift(&mut self) -> Result<i64> {
        let mut value = self.addsub()?;
        loop {
            if self.eat(b"<<") {
                value = value.wrapping_shl(self.addsub()? as u32);
            } else if self.eat(b">>") {
                value = ((value as u64) >> (self.addsub()? as u32 & 63)) as i64;
            } else {
                return Ok(value);
            }
        }
    }

    fn bitand(&mut self) -> Result<i64> {
        let mut value = self.shift()?;
        while self.peek() == Some(b'&') {
            self.bump();
            value &= self.shift()?;
        }
        Ok(value)
    }

    fn bitxor(&mut self) -> Result<i64> {
        let mut value = self.bitand()?;
        while self.peek() == Some(b'^') {
            self.bump();
            value ^= self.bitand()?;
        }
        Ok(value)
    }

    fn bitor(&mut self) -> Result<i64> {
        let mut value = self.bitxor()?;
        while self.peek() == Some(b'|') {
            self.bump();
            value |= self.bitxor()?;
        }
        Ok(value)
    }
}

/// Evaluates an update expression with `A` bound to `a`
pub(crate) fn eval_expr(expr: &str, a: i64) -> Result<i64> {
    let mut parser = Parser {
        input: expr.as_bytes(),
        pos: 0,
        a,
    };
    let value = parser.bitor()?;
    if parser.peek().is_some() {
        return Err(parser.fail("trailing input"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        assert_eq!(eval_expr("1+2*3", 0).unwrap(), 7);
        assert_eq!(eval_expr("(1+2)*3", 0).unwrap(), 9);
        assert_eq!(eval_expr("1+4>>1", 0).unwrap(), 2);
    }

    #[test]
    fn test_variable_and_hex() {
        assert_eq!(eval_expr("A*2+1", 20).unwrap(), 41);
        assert_eq!(eval_expr("0x10|1", 0).unwrap(), 17);
        assert_eq!(eval_expr("A^0xFF", 0x0F).unwrap(), 0xF0);
    }

    #[test]
    fn test_wrapping() {
        assert_eq!(
            eval_expr("A*2", i64::MAX).unwrap(),
            i64::MAX.wrapping_mul(2)
        );
    }

    #[test]
    fn test_errors() {
        assert!(eval_expr("1/0", 0).is_err());
        assert!(eval_expr("(1", 0).is_err());
        assert!(eval_expr("1 2", 0).is_err());
        assert!(eval_expr("", 0).is_err());
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("-42"), Some(-42));
        assert_eq!(parse_int("0xFF"), Some(255));
        assert_eq!(parse_int("x"), None);
    }
}
