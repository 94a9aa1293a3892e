//! Arithmetic expressions for constraint right-hand sides.
//!
//! The grammar is deliberately small: numeric literals (with SI
//! suffixes), names, `+ - * /`, unary sign and parentheses.

use std::collections::HashMap;
use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::take_while,
    character::complete::{alphanumeric0, char, digit1, multispace0, one_of, satisfy},
    combinator::{all_consuming, map, opt, recognize},
    multi::many0,
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::error::{FitError, Result};
use crate::parser::parse_value_with_unit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

impl Op {
    fn from_char(c: char) -> Self {
        match c {
            '+' => Op::Add,
            '-' => Op::Sub,
            '*' => Op::Mul,
            _ => Op::Div,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Op::Add => '+',
            Op::Sub => '-',
            Op::Mul => '*',
            Op::Div => '/',
        };
        write!(f, "{}", symbol)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Name(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, Op, Box<Expr>),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr> {
        match all_consuming(expression)(input) {
            Ok((_, expr)) => Ok(expr),
            Err(_) => Err(FitError::Expression(format!(
                "cannot parse expression '{}'",
                input.trim()
            ))),
        }
    }

    /// Evaluate with `lookup` resolving names
    pub fn eval<F>(&self, lookup: &F) -> Result<f64>
    where
        F: Fn(&str) -> Option<f64>,
    {
        match self {
            Expr::Number(value) => Ok(*value),
            Expr::Name(name) => lookup(name)
                .ok_or_else(|| FitError::Expression(format!("unknown name '{}'", name))),
            Expr::Neg(inner) => Ok(-inner.eval(lookup)?),
            Expr::Binary(lhs, op, rhs) => {
                let a = lhs.eval(lookup)?;
                let b = rhs.eval(lookup)?;
                let value = match op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    Op::Div => {
                        if b == 0.0 {
                            return Err(FitError::Expression("division by zero".to_string()));
                        }
                        a / b
                    }
                };
                Ok(value)
            }
        }
    }
}

/// Parse and evaluate against a namespace keyed by upper-cased name.
pub fn evaluate(input: &str, namespace: &HashMap<String, f64>) -> Result<f64> {
    let expr = Expr::parse(input)?;
    let value = expr.eval(&|name: &str| namespace.get(&name.to_uppercase()).copied())?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(FitError::Expression(format!(
            "'{}' evaluates to a non-finite value",
            input.trim()
        )))
    }
}

fn fold_binary(first: Expr, rest: Vec<(char, Expr)>) -> Expr {
    rest.into_iter().fold(first, |lhs, (op, rhs)| {
        Expr::Binary(Box::new(lhs), Op::from_char(op), Box::new(rhs))
    })
}

fn expression(input: &str) -> IResult<&str, Expr> {
    let (input, first) = term(input)?;
    let (input, rest) = many0(pair(
        delimited(multispace0, one_of("+-"), multispace0),
        term,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn term(input: &str) -> IResult<&str, Expr> {
    let (input, first) = factor(input)?;
    let (input, rest) = many0(pair(
        delimited(multispace0, one_of("*/"), multispace0),
        factor,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn factor(input: &str) -> IResult<&str, Expr> {
    delimited(
        multispace0,
        alt((
            map(preceded(char('-'), factor), |inner| Expr::Neg(Box::new(inner))),
            preceded(char('+'), factor),
            delimited(char('('), expression, preceded(multispace0, char(')'))),
            number,
            name,
        )),
        multispace0,
    )(input)
}

fn mantissa(input: &str) -> IResult<&str, &str> {
    alt((
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        recognize(pair(char('.'), digit1)),
    ))(input)
}

fn exponent(input: &str) -> IResult<&str, &str> {
    recognize(tuple((one_of("eE"), opt(one_of("+-")), digit1)))(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    let (rest, literal) = recognize(tuple((mantissa, opt(exponent), alphanumeric0)))(input)?;
    match parse_value_with_unit(literal) {
        Some(value) => Ok((rest, Expr::Number(value))),
        None => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Float,
        ))),
    }
}

fn name(input: &str) -> IResult<&str, Expr> {
    map(
        recognize(pair(
            satisfy(|c: char| c.is_ascii_alphabetic() || c == '_'),
            take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        )),
        |s: &str| Expr::Name(s.to_string()),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace() -> HashMap<String, f64> {
        let mut ns = HashMap::new();
        ns.insert("R1".to_string(), 100.0);
        ns.insert("C_LOAD".to_string(), 1e-9);
        ns
    }

    #[test]
    fn test_precedence_and_grouping() {
        let ns = HashMap::new();
        assert_eq!(evaluate("1 + 2 * 3", &ns).unwrap(), 7.0);
        assert_eq!(evaluate("(1 + 2) * 3", &ns).unwrap(), 9.0);
        assert_eq!(evaluate("8 / 4 / 2", &ns).unwrap(), 1.0);
        assert_eq!(evaluate("10 - 4 - 3", &ns).unwrap(), 3.0);
        assert_eq!(evaluate("-(2 + 3)", &ns).unwrap(), -5.0);
        assert_eq!(evaluate("2 - -3", &ns).unwrap(), 5.0);
    }

    #[test]
    fn test_literals_with_suffixes() {
        let ns = HashMap::new();
        assert_eq!(evaluate("4.7k", &ns).unwrap(), 4700.0);
        assert_eq!(evaluate("1e3", &ns).unwrap(), 1000.0);
        assert!((evaluate("2.5e-3 * 2", &ns).unwrap() - 5e-3).abs() < 1e-15);
        assert_eq!(evaluate("1Meg / 2", &ns).unwrap(), 5e5);
        assert!(evaluate("3xyz", &ns).is_err());
    }

    #[test]
    fn test_names_are_case_insensitive() {
        let ns = namespace();
        assert_eq!(evaluate("R1*2", &ns).unwrap(), 200.0);
        assert_eq!(evaluate("r1 + 1", &ns).unwrap(), 101.0);
        assert!((evaluate("c_load * 2", &ns).unwrap() - 2e-9).abs() < 1e-24);

        assert_eq!(evaluate("R1 * (r1 + 1)", &ns).unwrap(), 10100.0);
    }

    #[test]
    fn test_rejects_everything_else() {
        let ns = namespace();
        for bad in ["", "R1 **", "__import__('os')", "R1; R1", "2 ^ 3", "R9 + 1", "1 / 0", "(1 + 2"] {
            assert!(
                matches!(evaluate(bad, &ns), Err(FitError::Expression(_))),
                "accepted '{}'",
                bad
            );
        }
    }
}
