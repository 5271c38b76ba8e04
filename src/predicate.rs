//! # Temporal Predicate Builder
//!
//! Typed where-clause expressions handed to the feature store, and the active-window clause
//! that every default read path is intersected with.

use crate::model::AttrValue;
use crate::temporal::Instant;
use std::fmt;

/// Comparison operator of a [`Predicate::Compare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    pub fn holds(&self, left: f64, right: f64) -> bool {
        match self {
            CompareOp::Lt => left < right,
            CompareOp::Le => left <= right,
            CompareOp::Gt => left > right,
            CompareOp::Ge => left >= right,
        }
    }
}

/// Right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// The store's current timestamp, evaluated at query time
    Now,
    Value(AttrValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every row (`1=1`)
    True,
    In {
        field: String,
        values: Vec<AttrValue>,
    },
    Eq {
        field: String,
        value: AttrValue,
    },
    IsNull(String),
    Compare {
        field: String,
        op: CompareOp,
        operand: Operand,
    },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Caller-supplied where-clause passed through verbatim
    Raw(String),
}

impl Predicate {
    pub fn in_values<V: Into<AttrValue>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Predicate::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Predicate::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Render in the store's SQL-92 where dialect.
    pub fn to_where_clause(&self) -> String {
        match self {
            Predicate::True => "1=1".to_string(),
            Predicate::In { field, values } => {
                if values.is_empty() {
                    return "1=0".to_string();
                }
                let rendered: Vec<String> = values.iter().map(render_literal).collect();
                format!("{field} IN ({})", rendered.join(", "))
            }
            Predicate::Eq { field, value } => format!("{field} = {}", render_literal(value)),
            Predicate::IsNull(field) => format!("{field} IS NULL"),
            Predicate::Compare { field, op, operand } => {
                let rhs = match operand {
                    Operand::Now => "CURRENT_TIMESTAMP".to_string(),
                    Operand::Value(value) => render_literal(value),
                };
                format!("{field} {} {rhs}", op.symbol())
            }
            Predicate::And(clauses) => join_clauses(clauses, " AND "),
            Predicate::Or(clauses) => join_clauses(clauses, " OR "),
            Predicate::Raw(text) => format!("({text})"),
        }
    }

    /// Whether this predicate, as a conjunction, contains the given clause.
    pub fn implies(&self, clause: &Predicate) -> bool {
        if self == clause {
            return true;
        }
        match self {
            Predicate::And(clauses) => clauses.iter().any(|inner| inner.implies(clause)),
            _ => false,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_where_clause())
    }
}

fn join_clauses(clauses: &[Predicate], separator: &str) -> String {
    if clauses.is_empty() {
        return "1=1".to_string();
    }
    let rendered: Vec<String> = clauses
        .iter()
        .map(|clause| match clause {
            Predicate::And(_) | Predicate::Or(_) => format!("({})", clause.to_where_clause()),
            _ => clause.to_where_clause(),
        })
        .collect();
    rendered.join(separator)
}

fn render_literal(value: &AttrValue) -> String {
    match value {
        AttrValue::Null => "NULL".to_string(),
        AttrValue::Bool(flag) => if *flag { "1" } else { "0" }.to_string(),
        AttrValue::Int(number) => number.to_string(),
        AttrValue::Float(number) => number.to_string(),
        AttrValue::String(text) => format!("'{}'", text.replace('\'', "''")),
        AttrValue::Timestamp(instant) => timestamp_literal(*instant),
    }
}

fn timestamp_literal(instant: Instant) -> String {
    match crate::temporal::from_instant(instant) {
        Some(datetime) => format!(
            "TIMESTAMP '{:04}-{:02}-{:02} {:02}:{:02}:{:02}'",
            datetime.year(),
            u8::from(datetime.month()),
            datetime.day(),
            datetime.hour(),
            datetime.minute(),
            datetime.second()
        ),
        None => instant.to_string(),
    }
}

/// `(start IS NULL OR start < NOW) AND (end IS NULL OR end > NOW)`
pub fn active_window(start_field: &str, end_field: &str) -> Predicate {
    Predicate::And(vec![
        Predicate::Or(vec![
            Predicate::IsNull(start_field.to_string()),
            Predicate::Compare {
                field: start_field.to_string(),
                op: CompareOp::Lt,
                operand: Operand::Now,
            },
        ]),
        Predicate::Or(vec![
            Predicate::IsNull(end_field.to_string()),
            Predicate::Compare {
                field: end_field.to_string(),
                op: CompareOp::Gt,
                operand: Operand::Now,
            },
        ]),
    ])
}

/// Intersect a caller predicate with the active-window clause.
pub fn build(base: Predicate, start_field: &str, end_field: &str) -> Predicate {
    Predicate::And(vec![base, active_window(start_field, end_field)])
}

/// Which records a read path may see
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Active records only; the default of every read path
    #[default]
    Active,
    /// Retired and not-yet-valid records too; audit reads only
    IncludeInactive,
}

/// Apply the read mode to a caller predicate.
pub fn scoped(base: Predicate, mode: ReadMode, start_field: &str, end_field: &str) -> Predicate {
    match mode {
        ReadMode::Active => build(base, start_field, end_field),
        ReadMode::IncludeInactive => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_window_rendering() {
        assert_eq!(
            active_window("START_DATE", "END_DATE").to_where_clause(),
            "(START_DATE IS NULL OR START_DATE < CURRENT_TIMESTAMP) AND \
             (END_DATE IS NULL OR END_DATE > CURRENT_TIMESTAMP)"
        );
    }

    #[test]
    fn test_build_appends_window() {
        let base = Predicate::in_values("BRIDGE_ID", ["4000068", "4000069"]);
        let built = build(base.clone(), "START_DATE", "END_DATE");

        assert!(built.implies(&base));
        assert!(built.implies(&active_window("START_DATE", "END_DATE")));
        assert_eq!(
            built.to_where_clause(),
            "BRIDGE_ID IN ('4000068', '4000069') AND \
             ((START_DATE IS NULL OR START_DATE < CURRENT_TIMESTAMP) AND \
             (END_DATE IS NULL OR END_DATE > CURRENT_TIMESTAMP))"
        );
    }

    #[test]
    fn test_window_uses_configured_columns() {
        let built = build(Predicate::True, "FROMDATE", "TODATE");
        let text = built.to_where_clause();
        assert!(text.starts_with("1=1 AND "));
        assert!(text.contains("FROMDATE < CURRENT_TIMESTAMP"));
        assert!(text.contains("TODATE > CURRENT_TIMESTAMP"));
        assert!(!built.implies(&active_window("START_DATE", "END_DATE")));
    }

    #[test]
    fn test_include_inactive_skips_window() {
        let base = Predicate::equals("LINKID", "01001");
        assert_eq!(
            scoped(base.clone(), ReadMode::IncludeInactive, "FROMDATE", "TODATE"),
            base
        );
        assert!(scoped(base, ReadMode::default(), "FROMDATE", "TODATE")
            .implies(&active_window("FROMDATE", "TODATE")));
    }

    #[test]
    fn test_string_literals_are_escaped() {
        let predicate = Predicate::equals("BRIDGE_NAME", "O'Hara");
        assert_eq!(predicate.to_where_clause(), "BRIDGE_NAME = 'O''Hara'");
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let predicate = Predicate::in_values::<&str>("LINKID", []);
        assert_eq!(predicate.to_where_clause(), "1=0");
    }

    #[test]
    fn test_raw_is_parenthesized() {
        let predicate = build(Predicate::Raw("A = 1 OR B = 2".to_string()), "S", "E");
        assert!(predicate.to_where_clause().starts_with("(A = 1 OR B = 2) AND "));
    }

    #[test]
    fn test_timestamp_literal() {
        let predicate = Predicate::Compare {
            field: "END_DATE".to_string(),
            op: CompareOp::Le,
            operand: Operand::Value(AttrValue::Timestamp(1_704_164_645_000)),
        };
        assert_eq!(
            predicate.to_where_clause(),
            "END_DATE <= TIMESTAMP '2024-01-02 03:04:05'"
        );
    }
}
