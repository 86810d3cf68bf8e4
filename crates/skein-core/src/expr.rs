//! Condition expression parser
//!
//! Condition expressions are deliberately small: a left-associative
//! conjunction of `property cmp literal` clauses. Disjunction, grouping and
//! precedence are not part of the language.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("invalid expression: {0}")]
    Invalid(String),

    #[error("invalid comparator in expression: {0}")]
    InvalidComparator(String),

    #[error("invalid literal in expression: {0}")]
    InvalidLiteral(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        };
        write!(f, "{}", s)
    }
}

/// Literal operand of a clause, tagged by its written form.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprLiteral {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// One `property cmp literal` clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub property: String,
    pub op: CompareOp,
    pub literal: ExprLiteral,
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Const(bool),
    /// Conjunction of clauses; empty never occurs.
    Clauses(Vec<Clause>),
}

/// Parses a condition expression.
///
/// The bare booleans `true` and `false` pass through untransformed;
/// everything else must be `ident cmp literal` clauses joined with `&&`.
pub fn parse_expression(input: &str) -> Result<Expression, ExprError> {
    let trimmed = input.trim();
    if trimmed == "true" {
        return Ok(Expression::Const(true));
    }
    if trimmed == "false" {
        return Ok(Expression::Const(false));
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        clauses.push(parse_clause(part)?);
    }
    Ok(Expression::Clauses(clauses))
}

fn parse_clause(input: &str) -> Result<Clause, ExprError> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return Err(ExprError::Invalid(input.to_string()));
    }

    // Identifier: \w+
    let ident_end = rest
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(i, _)| i)
        .unwrap_or(rest.len());
    if ident_end == 0 {
        return Err(ExprError::Invalid(input.to_string()));
    }
    let property = rest[..ident_end].to_string();
    rest = rest[ident_end..].trim_start();

    // Comparator. Two-character forms have to be tried first.
    let (op, op_len) = if rest.starts_with("==") {
        (CompareOp::Eq, 2)
    } else if rest.starts_with("!=") {
        (CompareOp::Ne, 2)
    } else if rest.starts_with(">=") {
        (CompareOp::Ge, 2)
    } else if rest.starts_with("<=") {
        (CompareOp::Le, 2)
    } else if rest.starts_with('>') {
        (CompareOp::Gt, 1)
    } else if rest.starts_with('<') {
        (CompareOp::Lt, 1)
    } else {
        return Err(ExprError::InvalidComparator(input.to_string()));
    };
    rest = rest[op_len..].trim();

    let literal = parse_literal(rest).ok_or_else(|| ExprError::InvalidLiteral(input.to_string()))?;
    Ok(Clause {
        property,
        op,
        literal,
    })
}

fn parse_literal(input: &str) -> Option<ExprLiteral> {
    if input.len() >= 2 {
        for quote in ['"', '\''] {
            if input.starts_with(quote) && input.ends_with(quote) {
                let inner = &input[1..input.len() - 1];
                if inner.contains(quote) {
                    return None;
                }
                return Some(ExprLiteral::Str(inner.to_string()));
            }
        }
    }
    if input == "true" {
        return Some(ExprLiteral::Bool(true));
    }
    if input == "false" {
        return Some(ExprLiteral::Bool(false));
    }
    if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit() || c == '.') {
        if input.contains('.') {
            return input.parse::<f64>().ok().map(ExprLiteral::Float);
        }
        return input.parse::<i64>().ok().map(ExprLiteral::Int);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const() {
        assert_eq!(parse_expression("true").unwrap(), Expression::Const(true));
        assert_eq!(parse_expression(" false ").unwrap(), Expression::Const(false));
    }

    #[test]
    fn test_single_clause_string() {
        let expr = parse_expression(r#"name == "john""#).unwrap();
        assert_eq!(
            expr,
            Expression::Clauses(vec![Clause {
                property: "name".into(),
                op: CompareOp::Eq,
                literal: ExprLiteral::Str("john".into()),
            }])
        );
    }

    #[test]
    fn test_single_quotes() {
        let expr = parse_expression("name != 'jane'").unwrap();
        assert_eq!(
            expr,
            Expression::Clauses(vec![Clause {
                property: "name".into(),
                op: CompareOp::Ne,
                literal: ExprLiteral::Str("jane".into()),
            }])
        );
    }

    #[test]
    fn test_numeric_literals() {
        let expr = parse_expression("price >= 10").unwrap();
        assert_eq!(
            expr,
            Expression::Clauses(vec![Clause {
                property: "price".into(),
                op: CompareOp::Ge,
                literal: ExprLiteral::Int(10),
            }])
        );

        let expr = parse_expression("ratio < 0.5").unwrap();
        assert_eq!(
            expr,
            Expression::Clauses(vec![Clause {
                property: "ratio".into(),
                op: CompareOp::Lt,
                literal: ExprLiteral::Float(0.5),
            }])
        );
    }

    #[test]
    fn test_boolean_literal() {
        let expr = parse_expression("active == true").unwrap();
        assert_eq!(
            expr,
            Expression::Clauses(vec![Clause {
                property: "active".into(),
                op: CompareOp::Eq,
                literal: ExprLiteral::Bool(true),
            }])
        );
    }

    #[test]
    fn test_conjunction() {
        let expr = parse_expression(r#"action == "signup" && count > 3"#).unwrap();
        match expr {
            Expression::Clauses(clauses) => {
                assert_eq!(clauses.len(), 2);
                assert_eq!(clauses[0].property, "action");
                assert_eq!(clauses[1].property, "count");
            }
            other => panic!("expected clauses, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_expression("name =").is_err());
        assert!(parse_expression("== 3").is_err());
        assert!(parse_expression("name == ").is_err());
        assert!(parse_expression(r#"name == "unterminated"#).is_err());
        assert!(parse_expression("a == 1 || b == 2").is_err());
        assert!(parse_expression("price == -1").is_err());
    }
}
