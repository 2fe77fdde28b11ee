//! Typed query plans and their canonical text form.

use crate::core::UnitOfTime;
use std::fmt;

/// What a query does.
///
/// `select data` plans have kind `Data`; `delete data` plans have kind `Delete`
/// with a data clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Select,
    Delete,
    Set,
    Data,
    Apply,
}

/// WHERE clause tree. Tag names are canonical.
#[derive(Debug, Clone, PartialEq)]
pub enum WhereNode {
    Eq { tag: String, value: String },
    Neq { tag: String, value: String },
    Like { tag: String, pattern: String },
    Has(String),
    In { tag: String, values: Vec<String> },
    And(Box<WhereNode>, Box<WhereNode>),
    Or(Box<WhereNode>, Box<WhereNode>),
    Not(Box<WhereNode>),
}

impl WhereNode {
    pub fn and(left: WhereNode, right: WhereNode) -> Self {
        WhereNode::And(Box::new(left), Box::new(right))
    }

    pub fn or(left: WhereNode, right: WhereNode) -> Self {
        WhereNode::Or(Box::new(left), Box::new(right))
    }

    pub fn negate(inner: WhereNode) -> Self {
        WhereNode::Not(Box::new(inner))
    }

    /// Every tag the predicate mentions.
    pub fn tags(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_tags(&mut out);
        out
    }

    fn collect_tags<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            WhereNode::Eq { tag, .. }
            | WhereNode::Neq { tag, .. }
            | WhereNode::Like { tag, .. }
            | WhereNode::In { tag, .. }
            | WhereNode::Has(tag) => out.push(tag),
            WhereNode::And(l, r) | WhereNode::Or(l, r) => {
                l.collect_tags(out);
                r.collect_tags(out);
            }
            WhereNode::Not(inner) => inner.collect_tags(out),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            WhereNode::Or(..) => 1,
            WhereNode::And(..) => 2,
            _ => 3,
        }
    }
}

/// A point in time inside a data clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeValue {
    /// Nanoseconds since the epoch.
    Absolute(u64),
    /// A bare number whose unit the archiver infers from its magnitude.
    Raw(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRange {
    Range { start: TimeValue, end: TimeValue },
    Before(TimeValue),
    After(TimeValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataQuery {
    pub range: DataRange,
    pub limit: Option<u64>,
    pub stream_limit: Option<u64>,
    /// Unit the returned timestamps are converted to.
    pub timeconv: UnitOfTime,
}

impl DataQuery {
    pub fn new(range: DataRange) -> Self {
        Self { range, limit: None, stream_limit: None, timeconv: UnitOfTime::Milliseconds }
    }
}

/// Tag list entry selecting every tag.
pub const ALL_TAGS: &str = "*";

/// A parsed query. `querystring` is its canonical form and its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub kind: QueryKind,
    pub distinct: bool,
    pub tags: Vec<String>,
    pub where_clause: Option<WhereNode>,
    pub set: Vec<(String, String)>,
    pub data: Option<DataQuery>,
    pub apply: Option<String>,
    pub querystring: String,
}

impl ParsedQuery {
    pub(crate) fn new(kind: QueryKind) -> Self {
        Self {
            kind,
            distinct: false,
            tags: Vec::new(),
            where_clause: None,
            set: Vec::new(),
            data: None,
            apply: None,
            querystring: String::new(),
        }
    }

    pub fn selects_all_tags(&self) -> bool {
        self.tags.iter().any(|t| t == ALL_TAGS)
    }

    /// Renders the canonical text form.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        match self.kind {
            QueryKind::Select if self.distinct => {
                out.push_str("select distinct ");
                out.push_str(&self.tags.join(", "));
            }
            QueryKind::Select => {
                out.push_str("select ");
                out.push_str(&self.tags.join(", "));
            }
            QueryKind::Data => {
                out.push_str("select data ");
                if let Some(data) = &self.data {
                    out.push_str(&data.to_string());
                }
            }
            QueryKind::Delete => {
                out.push_str("delete");
                if let Some(data) = &self.data {
                    out.push_str(" data ");
                    out.push_str(&data.to_string());
                } else if !self.tags.is_empty() {
                    out.push(' ');
                    out.push_str(&self.tags.join(", "));
                }
            }
            QueryKind::Set => {
                out.push_str("set ");
                let assignments: Vec<String> =
                    self.set.iter().map(|(k, v)| format!("{} = {}", k, quote(v))).collect();
                out.push_str(&assignments.join(", "));
            }
            QueryKind::Apply => {
                out.push_str("apply ");
                out.push_str(self.apply.as_deref().unwrap_or_default());
            }
        }
        if let Some(pred) = &self.where_clause {
            out.push_str(" where ");
            out.push_str(&pred.to_string());
        }
        out.push(';');
        out
    }
}

impl fmt::Display for ParsedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.querystring)
    }
}

/// Double-quotes a value, escaping `"` and `\`.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl fmt::Display for WhereNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhereNode::Eq { tag, value } => write!(f, "{} = {}", tag, quote(value)),
            WhereNode::Neq { tag, value } => write!(f, "{} != {}", tag, quote(value)),
            WhereNode::Like { tag, pattern } => write!(f, "{} like {}", tag, quote(pattern)),
            WhereNode::Has(tag) => write!(f, "has {}", tag),
            WhereNode::In { tag, values } if values.len() == 1 => {
                write!(f, "{} in {}", quote(&values[0]), tag)
            }
            WhereNode::In { tag, values } => {
                let quoted: Vec<String> = values.iter().map(|v| quote(v)).collect();
                write!(f, "[{}] in {}", quoted.join(", "), tag)
            }
            WhereNode::And(l, r) => write_binary(f, self, l, r, "and"),
            WhereNode::Or(l, r) => write_binary(f, self, l, r, "or"),
            WhereNode::Not(inner) if inner.precedence() < 3 => write!(f, "not ({})", inner),
            WhereNode::Not(inner) => write!(f, "not {}", inner),
        }
    }
}

// Operators are left-associative, so a right operand of equal precedence needs parentheses.
fn write_binary(
    f: &mut fmt::Formatter<'_>,
    node: &WhereNode,
    left: &WhereNode,
    right: &WhereNode,
    op: &str,
) -> fmt::Result {
    let p = node.precedence();
    if left.precedence() < p {
        write!(f, "({})", left)?;
    } else {
        write!(f, "{}", left)?;
    }
    write!(f, " {} ", op)?;
    if right.precedence() <= p {
        write!(f, "({})", right)
    } else {
        write!(f, "{}", right)
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeValue::Absolute(ns) => write!(f, "{} ns", ns),
            TimeValue::Raw(n) => write!(f, "{}", n),
        }
    }
}

impl fmt::Display for DataQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.range {
            DataRange::Range { start, end } => write!(f, "in ({}, {})", start, end)?,
            DataRange::Before(t) => write!(f, "before {}", t)?,
            DataRange::After(t) => write!(f, "after {}", t)?,
        }
        if let Some(limit) = self.limit {
            write!(f, " limit {}", limit)?;
        }
        if let Some(stream_limit) = self.stream_limit {
            write!(f, " streamlimit {}", stream_limit)?;
        }
        write!(f, " as {}", self.timeconv)
    }
}
