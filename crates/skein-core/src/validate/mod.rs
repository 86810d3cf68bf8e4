//! Query validation
//!
//! Validation resolves every identifier against the table schema and the
//! query's variable declarations, checks selection and condition shape, and
//! type-checks condition expressions. It runs before compilation; the mapper
//! assumes a validated query.

pub mod scope;

use crate::ast::{Aggregation, Literal, Query, Statement};
use crate::expr::{parse_expression, ExprError, ExprLiteral, Expression};
use crate::schema::{DataType, Table};
use rustc_hash::FxHashSet;
use thiserror::Error;

pub use scope::Symtable;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("selection: {0} variables cannot be used as dimensions: {1}")]
    NonCategoricalDimension(DataType, String),

    #[error("selection: field name already used: {0}")]
    DuplicateFieldName(String),

    #[error("unsupported aggregation: {0}")]
    UnsupportedAggregation(String),

    #[error("sum() requires a numeric variable: {0}")]
    NonNumericSum(String),

    #[error("condition: invalid 'within' range: {0}..{1}")]
    InvalidWithinRange(i64, i64),

    #[error("condition: {0}")]
    Expr(#[from] ExprError),

    #[error("condition: expression value must be a {expected} literal for {data_type} properties: {property}")]
    LiteralTypeMismatch {
        property: String,
        data_type: DataType,
        expected: &'static str,
    },

    #[error("assignment: literal does not fit {data_type} variable: {target}")]
    AssignmentTypeMismatch { target: String, data_type: DataType },
}

/// Validates a query against a table's property catalog.
pub fn validate(query: &Query, table: &Table) -> Result<(), ValidationError> {
    let mut root = Symtable::new();
    for property in &table.properties {
        root.declare(&property.name, property.data_type);
    }
    for decl in &query.variables {
        root.declare(&decl.name, decl.data_type);
        if let Some(association) = &decl.association {
            if root.find(association).is_none() {
                return Err(ValidationError::UnknownIdentifier(association.clone()));
            }
        }
    }

    validate_statements(&query.statements, &root)
}

fn validate_statements(
    statements: &[Statement],
    scope: &Symtable<'_>,
) -> Result<(), ValidationError> {
    for statement in statements {
        match statement {
            Statement::Selection {
                dimensions, fields, ..
            } => validate_selection(dimensions, fields, scope)?,
            Statement::Condition {
                expression,
                within,
                statements,
                ..
            } => {
                validate_condition(expression, *within, scope)?;
                let child = scope.child();
                validate_statements(statements, &child)?;
            }
            Statement::Assignment { target, expression } => {
                validate_assignment(target, expression, scope)?
            }
        }
    }
    Ok(())
}

fn validate_selection(
    dimensions: &[String],
    fields: &[crate::ast::Field],
    scope: &Symtable<'_>,
) -> Result<(), ValidationError> {
    for dimension in dimensions {
        let info = scope
            .find(dimension)
            .ok_or_else(|| ValidationError::UnknownIdentifier(dimension.clone()))?;
        if !info.data_type.is_categorical() {
            return Err(ValidationError::NonCategoricalDimension(
                info.data_type,
                dimension.clone(),
            ));
        }
    }

    let mut identifiers = FxHashSet::default();
    for field in fields {
        if !identifiers.insert(field.identifier().to_string()) {
            return Err(ValidationError::DuplicateFieldName(
                field.identifier().to_string(),
            ));
        }
        match field.aggregation() {
            Some(Aggregation::Count) => {}
            Some(Aggregation::Sum(arg)) => {
                let info = scope
                    .find(&arg)
                    .ok_or_else(|| ValidationError::UnknownIdentifier(arg.clone()))?;
                if !matches!(info.data_type, DataType::Integer | DataType::Float) {
                    return Err(ValidationError::NonNumericSum(arg));
                }
            }
            None => {
                return Err(ValidationError::UnsupportedAggregation(
                    field.expression.clone(),
                ))
            }
        }
    }
    Ok(())
}

fn validate_condition(
    expression: &str,
    within: [i64; 2],
    scope: &Symtable<'_>,
) -> Result<(), ValidationError> {
    let [lo, hi] = within;
    if lo < 0 || lo > hi {
        return Err(ValidationError::InvalidWithinRange(lo, hi));
    }

    let parsed = parse_expression(expression)?;
    let clauses = match parsed {
        Expression::Const(_) => return Ok(()),
        Expression::Clauses(clauses) => clauses,
    };

    for clause in &clauses {
        let info = scope
            .find(&clause.property)
            .ok_or_else(|| ValidationError::UnknownIdentifier(clause.property.clone()))?;
        let ok = match info.data_type {
            DataType::Factor | DataType::String => matches!(clause.literal, ExprLiteral::Str(_)),
            DataType::Integer | DataType::Float => {
                matches!(clause.literal, ExprLiteral::Int(_) | ExprLiteral::Float(_))
            }
            DataType::Boolean => matches!(clause.literal, ExprLiteral::Bool(_)),
        };
        if !ok {
            let expected = match info.data_type {
                DataType::Factor | DataType::String => "string",
                DataType::Integer | DataType::Float => "numeric",
                DataType::Boolean => "boolean",
            };
            return Err(ValidationError::LiteralTypeMismatch {
                property: clause.property.clone(),
                data_type: info.data_type,
                expected,
            });
        }
    }
    Ok(())
}

fn validate_assignment(
    target: &str,
    expression: &Literal,
    scope: &Symtable<'_>,
) -> Result<(), ValidationError> {
    let info = scope
        .find(target)
        .ok_or_else(|| ValidationError::UnknownIdentifier(target.to_string()))?;
    let ok = match info.data_type {
        DataType::Factor => matches!(expression, Literal::Str(_) | Literal::Int(_)),
        DataType::String => matches!(expression, Literal::Str(_)),
        DataType::Integer => matches!(expression, Literal::Int(_)),
        DataType::Float => matches!(expression, Literal::Int(_) | Literal::Float(_)),
        DataType::Boolean => matches!(expression, Literal::Bool(_)),
    };
    if !ok {
        return Err(ValidationError::AssignmentTypeMismatch {
            target: target.to_string(),
            data_type: info.data_type,
        });
    }
    Ok(())
}
