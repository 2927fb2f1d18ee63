//! Index filters for list/count queries

use crate::record::IndexValue;

/// Comparison operator for a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl FilterOp {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A filter on one indexed field
///
/// Records that do not carry the field never match, whatever the operator.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Equality filter shorthand
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Filter with an explicit operator
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }
}
