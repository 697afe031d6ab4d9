//! Job-sort formula evaluator (§9 Open Question: "ship a small fixed
//! evaluator, fall back to the configured multi-key sort if no formula
//! file is configured").
//!
//! Supports `+ - * /`, parenthesized grouping, numeric literals, and a
//! fixed set of identifiers drawn from the job and its fairshare node:
//! `eligible_time`, `queue_priority`, `job_priority`, `fairshare_perc`,
//! `fairshare_factor`, `accrue_type`, and any consumable resource name in
//! the job's `resreq` (its requested amount). This is deliberately not a
//! general expression language — just enough to express the formulas
//! sites actually write.

use crate::entities::job::{AccrueType, Job};
use std::collections::HashMap;
use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, Default)]
pub struct FormulaContext {
    pub queue_priority: f64,
    pub fairshare_perc: f64,
    pub fairshare_factor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormulaError {
    UnexpectedChar(char),
    UnexpectedEnd,
    UnknownIdentifier(String),
    TrailingTokens,
}

impl std::fmt::Display for FormulaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormulaError::UnexpectedChar(c) => write!(f, "unexpected character '{c}' in formula"),
            FormulaError::UnexpectedEnd => write!(f, "unexpected end of formula"),
            FormulaError::UnknownIdentifier(id) => write!(f, "unknown formula identifier '{id}'"),
            FormulaError::TrailingTokens => write!(f, "trailing tokens after formula expression"),
        }
    }
}

impl std::error::Error for FormulaError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>, FormulaError> {
    let mut chars: Peekable<Chars<'_>> = src.chars().peekable();
    let mut tokens = Vec::new();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = s.parse().map_err(|_| FormulaError::UnexpectedChar(c))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(s));
            }
            other => return Err(FormulaError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    job: &'a Job,
    ctx: &'a FormulaContext,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self) -> Result<f64, FormulaError> {
        let mut value = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.next();
                    value += self.parse_term()?;
                }
                Some(Token::Minus) => {
                    self.next();
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_term(&mut self) -> Result<f64, FormulaError> {
        let mut value = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.next();
                    value *= self.parse_unary()?;
                }
                Some(Token::Slash) => {
                    self.next();
                    let rhs = self.parse_unary()?;
                    value /= rhs;
                }
                _ => break,
            }
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> Result<f64, FormulaError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.next();
            return Ok(-self.parse_unary()?);
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<f64, FormulaError> {
        match self.next().cloned() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::Ident(name)) => self.resolve(&name),
            Some(Token::LParen) => {
                let value = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some(_) => Err(FormulaError::UnexpectedEnd),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    fn resolve(&self, name: &str) -> Result<f64, FormulaError> {
        match name {
            "eligible_time" => Ok(self.job.eligible_time as f64),
            "queue_priority" => Ok(self.ctx.queue_priority),
            "job_priority" => Ok(self.job.preempt as f64),
            "fairshare_perc" => Ok(self.ctx.fairshare_perc),
            "fairshare_factor" => Ok(self.ctx.fairshare_factor),
            "accrue_type" => Ok(match self.job.accrue_type {
                AccrueType::Ineligible => 0.0,
                AccrueType::Eligible => 1.0,
                AccrueType::Running => 2.0,
            }),
            _ => self
                .job
                .resreq
                .get(name)
                .and_then(|v| v.as_f64())
                .ok_or_else(|| FormulaError::UnknownIdentifier(name.to_string())),
        }
    }
}

/// Evaluate `formula` against `job` and `ctx`. Sites that never configure
/// a formula should never call this; the orchestrator falls back to
/// `sort_key` multi-key ordering instead (§9).
pub fn evaluate(formula: &str, job: &Job, ctx: &FormulaContext) -> Result<f64, FormulaError> {
    let tokens = tokenize(formula)?;
    let mut parser = Parser { tokens: &tokens, pos: 0, job, ctx };
    let value = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(FormulaError::TrailingTokens);
    }
    Ok(value)
}

/// Fallback ordering when no formula is configured: queue priority first,
/// then earlier eligible time, then job rank for stability (§9).
pub fn sort_key(job: &Job, ctx: &FormulaContext) -> (std::cmp::Reverse<i64>, i64, u64) {
    (std::cmp::Reverse(ctx.queue_priority as i64), job.eligible_time, job.rank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceValue;

    fn job_with(eligible_time: i64, ncpus: i64) -> Job {
        let mut job = Job::new("1.host", 1, "workq");
        job.eligible_time = eligible_time;
        job.resreq.insert("ncpus".to_string(), ResourceValue::Long(ncpus));
        job
    }

    #[test]
    fn evaluates_simple_weighted_sum() {
        let job = job_with(100, 4);
        let ctx = FormulaContext { queue_priority: 10.0, fairshare_perc: 0.5, fairshare_factor: 2.0 };
        let value = evaluate("2*fairshare_perc + queue_priority", &job, &ctx).unwrap();
        assert_eq!(value, 11.0);
    }

    #[test]
    fn resolves_resource_requests_by_name() {
        let job = job_with(0, 8);
        let ctx = FormulaContext::default();
        let value = evaluate("ncpus * 10", &job, &ctx).unwrap();
        assert_eq!(value, 80.0);
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let job = job_with(0, 1);
        let ctx = FormulaContext::default();
        assert_eq!(
            evaluate("bogus_field", &job, &ctx),
            Err(FormulaError::UnknownIdentifier("bogus_field".to_string()))
        );
    }

    #[test]
    fn respects_precedence_and_parens() {
        let job = job_with(0, 1);
        let ctx = FormulaContext::default();
        assert_eq!(evaluate("2 + 3 * 4", &job, &ctx).unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4", &job, &ctx).unwrap(), 20.0);
    }
}
