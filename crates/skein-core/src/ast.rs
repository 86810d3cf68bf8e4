//! Query AST
//!
//! Queries arrive as JSON documents. The wire shape is a list of typed
//! statements: selections (grouped aggregates), conditions (windowed
//! predicates with nested statements), and assignments, optionally preceded
//! by variable declarations.

use crate::schema::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Windowing unit for a condition's `within` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WithinUnits {
    #[default]
    Steps,
    Sessions,
    Seconds,
}

impl fmt::Display for WithinUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WithinUnits::Steps => "steps",
            WithinUnits::Sessions => "sessions",
            WithinUnits::Seconds => "seconds",
        };
        write!(f, "{}", s)
    }
}

/// A declared query variable.
///
/// A variable either shadows a table property (its `association` names the
/// property whose values flow into it) or is query-local scratch state
/// written by assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    #[serde(rename = "dataType")]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association: Option<String>,
}

/// Literal right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// An aggregate field inside a selection, e.g. `{"name":"total","expression":"sum(price)"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(default)]
    pub name: String,
    pub expression: String,
}

/// Parsed form of a field expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    Count,
    Sum(String),
}

impl Field {
    /// Name the field reduces under; falls back to the expression text.
    pub fn identifier(&self) -> &str {
        if self.name.is_empty() {
            &self.expression
        } else {
            &self.name
        }
    }

    /// Parses `count()` / `sum(x)`. Anything else is unsupported.
    pub fn aggregation(&self) -> Option<Aggregation> {
        let expression = self.expression.trim();
        let open = expression.find('(')?;
        if !expression.ends_with(')') {
            return None;
        }
        let func = expression[..open].trim();
        let arg = expression[open + 1..expression.len() - 1].trim();
        match (func, arg.is_empty()) {
            ("count", true) => Some(Aggregation::Count),
            ("sum", false) => Some(Aggregation::Sum(arg.to_string())),
            _ => None,
        }
    }
}

fn default_expression() -> String {
    "true".to_string()
}

fn default_within() -> [i64; 2] {
    [0, 0]
}

/// A query statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Statement {
    Selection {
        #[serde(default)]
        name: String,
        #[serde(default)]
        dimensions: Vec<String>,
        #[serde(default)]
        fields: Vec<Field>,
    },
    Condition {
        #[serde(default = "default_expression")]
        expression: String,
        #[serde(default = "default_within")]
        within: [i64; 2],
        #[serde(rename = "withinUnits", default)]
        within_units: WithinUnits,
        #[serde(default)]
        statements: Vec<Statement>,
    },
    Assignment {
        target: String,
        expression: Literal,
    },
}

/// A complete query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Query {
    /// Restricts the scan to objects whose id starts with this prefix.
    #[serde(default)]
    pub prefix: String,
    /// Idle gap, in seconds, that splits an object's stream into sessions.
    #[serde(rename = "sessionIdleTime", default)]
    pub session_idle_time: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VarDecl>,
    #[serde(default)]
    pub statements: Vec<Statement>,
}

impl Query {
    pub fn from_json(body: &str) -> Result<Query, serde_json::Error> {
        serde_json::from_str(body)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
