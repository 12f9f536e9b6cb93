//! Grammar and parser for the RSE-expression language (spec.md §4.2, §6):
//! atoms `key` / `key=value` / `key<value` / `key>value`, composed with
//! `&` (intersection), `|` (union), `\` (difference), with parentheses.
//!
//! The parser is pure: it has no notion of RSEs or attributes, only text.
//! Resolving atoms into RSE-id sets is the evaluator's job.

use crate::error::RseExprError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Atom {
    Exists(String),
    Eq(String, String),
    Lt(String, String),
    Gt(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Atom(Atom),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Diff(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    LParen,
    RParen,
    And,
    Or,
    Diff,
    Word(&'a str),
}

fn tokenize(input: &str) -> Result<Vec<Token<'_>>, RseExprError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                tokens.push(Token::And);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Or);
                i += 1;
            }
            '\\' => {
                tokens.push(Token::Diff);
                i += 1;
            }
            _ => {
                let start = i;
                while i < bytes.len() && !matches!(bytes[i] as char, ' ' | '\t' | '\n' | '\r' | '(' | ')' | '&' | '|' | '\\') {
                    i += 1;
                }
                tokens.push(Token::Word(&input[start..i]));
            }
        }
    }
    Ok(tokens)
}

fn parse_atom(word: &str) -> Result<Atom, RseExprError> {
    if word.is_empty() {
        return Err(RseExprError::InvalidRSEExpression("empty atom".into()));
    }
    for (idx, ch) in word.char_indices() {
        match ch {
            '=' | '<' | '>' => {
                let key = &word[..idx];
                let value = &word[idx + ch.len_utf8()..];
                if key.is_empty() || value.is_empty() {
                    return Err(RseExprError::InvalidRSEExpression(format!("malformed atom '{word}'")));
                }
                return Ok(match ch {
                    '=' => Atom::Eq(key.to_string(), value.to_string()),
                    '<' => Atom::Lt(key.to_string(), value.to_string()),
                    '>' => Atom::Gt(key.to_string(), value.to_string()),
                    _ => unreachable!(),
                });
            }
            _ => {}
        }
    }
    Ok(Atom::Exists(word.to_string()))
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<Token<'a>> {
        let t = self.peek();
        self.pos += 1;
        t
    }

    /// `expr := term ((& | \) term)*`, left-associative, no precedence
    /// distinction between the three operators (spec.md §4.2 lists them
    /// as a flat set of composition operators).
    fn parse_expr(&mut self) -> Result<Expr, RseExprError> {
        let mut lhs = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    lhs = Expr::And(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Or) => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Diff) => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    lhs = Expr::Diff(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, RseExprError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(RseExprError::InvalidRSEExpression("unbalanced parentheses".into())),
                }
            }
            Some(Token::Word(w)) => Ok(Expr::Atom(parse_atom(w)?)),
            other => Err(RseExprError::InvalidRSEExpression(format!("unexpected token {other:?}"))),
        }
    }
}

/// Parses an RSE-expression string into an [`Expr`] tree. Fails with
/// `InvalidRSEExpression` on any malformed input, never panics.
pub fn parse(input: &str) -> Result<Expr, RseExprError> {
    if input.trim().is_empty() {
        return Err(RseExprError::InvalidRSEExpression("empty expression".into()));
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(RseExprError::InvalidRSEExpression(format!("trailing tokens in '{input}'")));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_atom() {
        assert_eq!(parse("tier").unwrap(), Expr::Atom(Atom::Exists("tier".into())));
    }

    #[test]
    fn parses_equality_atom() {
        assert_eq!(parse("tier=2").unwrap(), Expr::Atom(Atom::Eq("tier".into(), "2".into())));
    }

    #[test]
    fn parses_intersection() {
        let expr = parse("tier=2&type=DATADISK").unwrap();
        assert_eq!(
            expr,
            Expr::And(Box::new(Expr::Atom(Atom::Eq("tier".into(), "2".into()))), Box::new(Expr::Atom(Atom::Eq("type".into(), "DATADISK".into()))))
        );
    }

    #[test]
    fn parses_parenthesized_difference() {
        let expr = parse("(tier=1|tier=2)\\blacklisted").unwrap();
        assert_eq!(
            expr,
            Expr::Diff(
                Box::new(Expr::Or(Box::new(Expr::Atom(Atom::Eq("tier".into(), "1".into()))), Box::new(Expr::Atom(Atom::Eq("tier".into(), "2".into()))))),
                Box::new(Expr::Atom(Atom::Exists("blacklisted".into())))
            )
        );
    }

    #[test]
    fn rejects_unbalanced_parens() {
        assert!(parse("(tier=2").is_err());
    }

    #[test]
    fn rejects_empty_expression() {
        assert!(parse("").is_err());
    }

    #[test]
    fn rejects_dangling_operator() {
        assert!(parse("tier=2&").is_err());
    }
}
