//! Composable restriction over named entity fields.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Strict and non-strict comparisons supported by [`Filter::Compare`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl CompareOp {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            CompareOp::Less => "<",
            CompareOp::LessOrEqual => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterOrEqual => ">=",
        }
    }

    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Less => ordering == Ordering::Less,
            CompareOp::LessOrEqual => ordering != Ordering::Greater,
            CompareOp::Greater => ordering == Ordering::Greater,
            CompareOp::GreaterOrEqual => ordering != Ordering::Less,
        }
    }
}

/// Immutable filter tree. Fields are logical property names, never backend columns.
///
/// Composite variants must hold at least one child; [`Filter::and`] and [`Filter::or`]
/// enforce this, and the query builder re-checks trees built by hand or deserialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Equal {
        field: String,
        value: Value,
    },
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// Inclusive on both ends.
    Interval {
        field: String,
        start: Value,
        end: Value,
    },
    IsNull {
        field: String,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equal {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn compare(field: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Less, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::LessOrEqual, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Greater, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::GreaterOrEqual, value)
    }

    pub fn between(
        field: impl Into<String>,
        start: impl Into<Value>,
        end: impl Into<Value>,
    ) -> Self {
        Self::Interval {
            field: field.into(),
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::IsNull {
            field: field.into(),
        }
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::negate(Self::is_null(field))
    }

    pub fn negate(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    pub fn and(filters: Vec<Filter>) -> Result<Self> {
        if filters.is_empty() {
            return Err(Error::contract("conjunction requires at least one filter"));
        }
        Ok(Self::And(filters))
    }

    pub fn or(filters: Vec<Filter>) -> Result<Self> {
        if filters.is_empty() {
            return Err(Error::contract("disjunction requires at least one filter"));
        }
        Ok(Self::Or(filters))
    }

    /// Conjunction of `self` and `other`, in that order.
    pub fn conjoin(self, other: Filter) -> Self {
        Self::And(vec![self, other])
    }

    /// Check the non-empty invariant of every composite node in the tree.
    pub fn validate(&self) -> Result<()> {
        match self {
            Filter::Equal { .. }
            | Filter::Compare { .. }
            | Filter::Interval { .. }
            | Filter::IsNull { .. } => Ok(()),
            Filter::And(children) | Filter::Or(children) => {
                if children.is_empty() {
                    return Err(Error::contract("composite filter with no children"));
                }
                children.iter().try_for_each(Filter::validate)
            }
            Filter::Not(inner) => inner.validate(),
        }
    }

    /// Evaluate against a property lookup using SQL three-valued logic: any comparison
    /// involving a null operand is unknown, and unknown is treated as "no match".
    pub fn matches<'a, F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<&'a Value> + Copy,
    {
        self.evaluate(lookup).unwrap_or(false)
    }

    fn evaluate<'a, F>(&self, lookup: F) -> Option<bool>
    where
        F: Fn(&str) -> Option<&'a Value> + Copy,
    {
        let present = |field: &str| lookup(field).filter(|v| !v.is_null());
        match self {
            Filter::Equal { field, value } => {
                let actual = present(field.as_str())?;
                if value.is_null() {
                    return None;
                }
                Some(total_order(actual, value) == Ordering::Equal)
            }
            Filter::Compare { field, op, value } => {
                let actual = present(field.as_str())?;
                if value.is_null() {
                    return None;
                }
                Some(op.accepts(total_order(actual, value)))
            }
            Filter::Interval { field, start, end } => {
                let actual = present(field.as_str())?;
                if start.is_null() || end.is_null() {
                    return None;
                }
                Some(
                    total_order(actual, start) != Ordering::Less
                        && total_order(actual, end) != Ordering::Greater,
                )
            }
            Filter::IsNull { field } => Some(present(field.as_str()).is_none()),
            Filter::Not(inner) => inner.evaluate(lookup).map(|b| !b),
            Filter::And(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(lookup) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown { None } else { Some(true) }
            }
            Filter::Or(children) => {
                let mut unknown = false;
                for child in children {
                    match child.evaluate(lookup) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown { None } else { Some(false) }
            }
        }
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::String(_) => 0,
        Value::Number(_) => 1,
        Value::Bool(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
        Value::Null => 5,
    }
}

/// Total order over property values used for sorting and comparisons.
///
/// Values of different JSON types order by type (string, number, boolean, array, object),
/// matching Postgres' `jsonb` ordering, and null sorts after everything else.
pub fn total_order(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.total_cmp(&y)
            }
        },
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = total_order(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()).then_with(|| {
            Value::Object(x.clone())
                .to_string()
                .cmp(&Value::Object(y.clone()).to_string())
        }),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
