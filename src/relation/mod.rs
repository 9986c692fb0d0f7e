//! Relation trees: the engine-independent form of a query.
//!
//! A query is planned into a [`Relation`] tree. Everything below the
//! outermost [`Relation::Transfer`] can be rendered as one SQL statement by
//! [`render_sql`]; operations above it are post-processing. The iteration
//! engine in [`execute`] evaluates whole trees in-process against a
//! [`RelationSource`], so both halves share a single definition of every
//! operation.

mod engine;
mod sql;

pub use engine::{RelationSource, execute};
pub use sql::{SqlQuery, render_sql};

use crate::dimensions::{DataIdValue, FieldValue};
use crate::time::{AstroTime, Timespan};
use geo::{Intersects, Polygon};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Per-dataset-type columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DatasetField {
    DatasetId,
    Run,
    IngestDate,
    /// Position of the collection in the search path.
    Rank,
}

impl DatasetField {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetField::DatasetId => "dataset_id",
            DatasetField::Run => "run",
            DatasetField::IngestDate => "ingest_date",
            DatasetField::Rank => "rank",
        }
    }
}

/// Identifies a column of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnTag {
    DimensionKey(String),
    /// A record field; `timespan` and `region` name the special columns.
    DimensionRecord { element: String, field: String },
    Dataset {
        dataset_type: String,
        field: DatasetField,
    },
}

impl ColumnTag {
    pub fn key(dimension: impl Into<String>) -> Self {
        ColumnTag::DimensionKey(dimension.into())
    }

    pub fn record(element: impl Into<String>, field: impl Into<String>) -> Self {
        ColumnTag::DimensionRecord {
            element: element.into(),
            field: field.into(),
        }
    }

    pub fn dataset(dataset_type: impl Into<String>, field: DatasetField) -> Self {
        ColumnTag::Dataset {
            dataset_type: dataset_type.into(),
            field,
        }
    }

    /// Column name used in rendered SQL.
    pub fn qualified_name(&self) -> String {
        match self {
            ColumnTag::DimensionKey(name) => name.clone(),
            ColumnTag::DimensionRecord { element, field } => format!("{}.{}", element, field),
            ColumnTag::Dataset {
                dataset_type,
                field,
            } => format!("{}.{}", dataset_type, field.as_str()),
        }
    }

    pub fn is_timespan(&self) -> bool {
        matches!(self, ColumnTag::DimensionRecord { field, .. } if field == "timespan")
    }

    pub fn is_region(&self) -> bool {
        matches!(self, ColumnTag::DimensionRecord { field, .. } if field == "region")
    }
}

impl fmt::Display for ColumnTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name())
    }
}

/// A single column value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Time(AstroTime),
    Timespan(Timespan),
    Uuid(Uuid),
    Region(Polygon<f64>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Time(_) => "time",
            Value::Timespan(_) => "timespan",
            Value::Uuid(_) => "uuid",
            Value::Region(_) => "region",
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// SQL-style comparison: `None` if either side is null or the types are
    /// not comparable. Integers and floats compare numerically.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Timespan(a), Value::Timespan(b)) if a == b => Some(Ordering::Equal),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Total order used for sorting; nulls sort first.
    pub(crate) fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Timespan(a), Value::Timespan(b)) => a
                .begin_nsec()
                .cmp(&b.begin_nsec())
                .then(a.end_nsec().cmp(&b.end_nsec())),
            (a, b) => a
                .compare(b)
                .unwrap_or_else(|| a.type_name().cmp(b.type_name())),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Timespan(a), Value::Timespan(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (Value::Region(a), Value::Region(b)) => region_bits(a) == region_bits(b),
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Str(v) => v.hash(state),
            Value::Time(v) => v.hash(state),
            Value::Timespan(v) => v.hash(state),
            Value::Uuid(v) => v.hash(state),
            Value::Region(v) => region_bits(v).hash(state),
        }
    }
}

fn region_bits(polygon: &Polygon<f64>) -> Vec<(u64, u64)> {
    polygon
        .exterior()
        .coords()
        .chain(polygon.interiors().iter().flat_map(|ring| ring.coords()))
        .map(|c| (c.x.to_bits(), c.y.to_bits()))
        .collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "'{}'", v),
            Value::Time(v) => write!(f, "T'{}'", v),
            Value::Timespan(v) => write!(f, "{}", v),
            Value::Uuid(v) => write!(f, "{}", v),
            Value::Region(v) => write!(f, "<region with {} vertices>", v.exterior().0.len()),
        }
    }
}

impl From<&DataIdValue> for Value {
    fn from(value: &DataIdValue) -> Self {
        match value {
            DataIdValue::Int(v) => Value::Int(*v),
            DataIdValue::Str(v) => Value::Str(v.clone()),
        }
    }
}

impl From<&FieldValue> for Value {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Int(v) => Value::Int(*v),
            FieldValue::Float(v) => Value::Float(*v),
            FieldValue::Str(v) => Value::Str(v.clone()),
            FieldValue::Bool(v) => Value::Bool(*v),
            FieldValue::Null => Value::Null,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<AstroTime> for Value {
    fn from(v: AstroTime) -> Self {
        Value::Time(v)
    }
}

impl From<Timespan> for Value {
    fn from(v: Timespan) -> Self {
        Value::Timespan(v)
    }
}

impl Value {
    /// Convert a dimension key value back, if this is one.
    pub fn to_data_id_value(&self) -> Option<DataIdValue> {
        match self {
            Value::Int(v) => Some(DataIdValue::Int(*v)),
            Value::Str(v) => Some(DataIdValue::Str(v.clone())),
            _ => None,
        }
    }
}

/// One row: a value per column.
pub type Row = BTreeMap<ColumnTag, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }
}

/// A scalar expression over the columns of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnExpr {
    Literal(Value),
    Column(ColumnTag),
    Neg(Box<ColumnExpr>),
    Arith {
        op: ArithOp,
        lhs: Box<ColumnExpr>,
        rhs: Box<ColumnExpr>,
    },
    TimespanBegin(Box<ColumnExpr>),
    TimespanEnd(Box<ColumnExpr>),
    /// `[begin, end)` built from two time expressions.
    MakeTimespan(Box<ColumnExpr>, Box<ColumnExpr>),
}

impl ColumnExpr {
    pub fn column(tag: ColumnTag) -> Self {
        ColumnExpr::Column(tag)
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ColumnExpr::Literal(value.into())
    }

    pub fn columns(&self, out: &mut BTreeSet<ColumnTag>) {
        match self {
            ColumnExpr::Literal(_) => {}
            ColumnExpr::Column(tag) => {
                out.insert(tag.clone());
            }
            ColumnExpr::Neg(inner)
            | ColumnExpr::TimespanBegin(inner)
            | ColumnExpr::TimespanEnd(inner) => inner.columns(out),
            ColumnExpr::Arith { lhs, rhs, .. } | ColumnExpr::MakeTimespan(lhs, rhs) => {
                lhs.columns(out);
                rhs.columns(out);
            }
        }
    }

    pub fn evaluate(&self, row: &Row) -> Value {
        match self {
            ColumnExpr::Literal(value) => value.clone(),
            ColumnExpr::Column(tag) => row.get(tag).cloned().unwrap_or(Value::Null),
            ColumnExpr::Neg(inner) => match inner.evaluate(row) {
                Value::Int(v) => Value::Int(v.wrapping_neg()),
                Value::Float(v) => Value::Float(-v),
                _ => Value::Null,
            },
            ColumnExpr::Arith { op, lhs, rhs } => {
                arithmetic(*op, &lhs.evaluate(row), &rhs.evaluate(row))
            }
            ColumnExpr::TimespanBegin(inner) => match inner.evaluate(row) {
                Value::Timespan(ts) => ts.begin().map_or(Value::Null, Value::Time),
                _ => Value::Null,
            },
            ColumnExpr::TimespanEnd(inner) => match inner.evaluate(row) {
                Value::Timespan(ts) => ts.end().map_or(Value::Null, Value::Time),
                _ => Value::Null,
            },
            ColumnExpr::MakeTimespan(begin, end) => {
                let bound = |v: Value| match v {
                    Value::Time(t) => Some(t),
                    _ => None,
                };
                Value::Timespan(Timespan::new(
                    bound(begin.evaluate(row)),
                    bound(end.evaluate(row)),
                ))
            }
        }
    }
}

fn arithmetic(op: ArithOp, lhs: &Value, rhs: &Value) -> Value {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let result = match op {
                ArithOp::Add => a.checked_add(*b),
                ArithOp::Sub => a.checked_sub(*b),
                ArithOp::Mul => a.checked_mul(*b),
                ArithOp::Div => a.checked_div(*b),
                ArithOp::Mod => a.checked_rem(*b),
            };
            result.map_or(Value::Null, Value::Int)
        }
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => {
                let result = match op {
                    ArithOp::Add => x + y,
                    ArithOp::Sub => x - y,
                    ArithOp::Mul => x * y,
                    ArithOp::Div => x / y,
                    ArithOp::Mod => x % y,
                };
                if result.is_finite() {
                    Value::Float(result)
                } else {
                    Value::Null
                }
            }
            _ => Value::Null,
        },
    }
}

impl fmt::Display for ColumnExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnExpr::Literal(value) => write!(f, "{}", value),
            ColumnExpr::Column(tag) => write!(f, "{}", tag),
            ColumnExpr::Neg(inner) => write!(f, "-{}", inner),
            ColumnExpr::Arith { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.as_str(), rhs),
            ColumnExpr::TimespanBegin(inner) => write!(f, "{}.begin", inner),
            ColumnExpr::TimespanEnd(inner) => write!(f, "{}.end", inner),
            ColumnExpr::MakeTimespan(a, b) => write!(f, "({}, {})", a, b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// One entry of an `IN` list.
#[derive(Debug, Clone, PartialEq)]
pub enum InItem {
    Expr(ColumnExpr),
    /// Inclusive integer range with a positive stride.
    Range { start: i64, stop: i64, stride: i64 },
}

/// A boolean condition on rows, with SQL three-valued semantics.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Literal(bool),
    Compare {
        lhs: ColumnExpr,
        op: CompareOp,
        rhs: ColumnExpr,
    },
    In {
        lhs: ColumnExpr,
        items: Vec<InItem>,
        negated: bool,
    },
    /// Timespan overlap; either side may also be a single time.
    Overlaps { lhs: ColumnExpr, rhs: ColumnExpr },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// Sky-region overlap; only evaluated in post-processing.
    RegionOverlaps {
        column: ColumnTag,
        region: Polygon<f64>,
    },
}

impl Predicate {
    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Predicate {
        let mut terms = Vec::new();
        for predicate in predicates {
            match predicate {
                Predicate::Literal(true) => {}
                Predicate::And(inner) => terms.extend(inner),
                other => terms.push(other),
            }
        }
        match terms.len() {
            0 => Predicate::Literal(true),
            1 => terms.remove(0),
            _ => Predicate::And(terms),
        }
    }

    pub fn eq(column: ColumnTag, value: impl Into<Value>) -> Predicate {
        Predicate::Compare {
            lhs: ColumnExpr::Column(column),
            op: CompareOp::Eq,
            rhs: ColumnExpr::Literal(value.into()),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::Literal(true))
    }

    /// Top-level conjuncts.
    pub fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Predicate::And(terms) => terms.iter().flat_map(|t| t.conjuncts()).collect(),
            Predicate::Literal(true) => Vec::new(),
            other => vec![other],
        }
    }

    pub fn columns(&self) -> BTreeSet<ColumnTag> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<ColumnTag>) {
        match self {
            Predicate::Literal(_) => {}
            Predicate::Compare { lhs, rhs, .. } | Predicate::Overlaps { lhs, rhs } => {
                lhs.columns(out);
                rhs.columns(out);
            }
            Predicate::In { lhs, items, .. } => {
                lhs.columns(out);
                for item in items {
                    if let InItem::Expr(expr) = item {
                        expr.columns(out);
                    }
                }
            }
            Predicate::And(terms) | Predicate::Or(terms) => {
                for term in terms {
                    term.collect_columns(out);
                }
            }
            Predicate::Not(inner) => inner.collect_columns(out),
            Predicate::RegionOverlaps { column, .. } => {
                out.insert(column.clone());
            }
        }
    }

    /// True if this predicate can be rendered as SQL.
    pub fn is_sql_compatible(&self) -> bool {
        match self {
            Predicate::RegionOverlaps { .. } => false,
            Predicate::And(terms) | Predicate::Or(terms) => {
                terms.iter().all(Predicate::is_sql_compatible)
            }
            Predicate::Not(inner) => inner.is_sql_compatible(),
            _ => true,
        }
    }

    /// Three-valued evaluation; `None` is SQL `NULL`.
    pub fn evaluate(&self, row: &Row) -> Option<bool> {
        match self {
            Predicate::Literal(v) => Some(*v),
            Predicate::Compare { lhs, op, rhs } => {
                let (l, r) = (lhs.evaluate(row), rhs.evaluate(row));
                l.compare(&r).map(|ordering| op.holds(ordering))
            }
            Predicate::In {
                lhs,
                items,
                negated,
            } => {
                let value = lhs.evaluate(row);
                if value.is_null() {
                    return None;
                }
                let mut unknown = false;
                let mut found = false;
                for item in items {
                    match item {
                        InItem::Expr(expr) => match value.compare(&expr.evaluate(row)) {
                            Some(Ordering::Equal) => found = true,
                            Some(_) => {}
                            None => unknown = true,
                        },
                        InItem::Range {
                            start,
                            stop,
                            stride,
                        } => {
                            if let Value::Int(v) = value {
                                if v >= *start && v <= *stop && (v - start) % stride == 0 {
                                    found = true;
                                }
                            }
                        }
                    }
                    if found {
                        break;
                    }
                }
                if found {
                    Some(!negated)
                } else if unknown {
                    None
                } else {
                    Some(*negated)
                }
            }
            Predicate::Overlaps { lhs, rhs } => {
                let as_span = |v: Value| match v {
                    Value::Timespan(ts) => Some(ts),
                    Value::Time(t) => Some(Timespan::from_instant(t)),
                    _ => None,
                };
                let l = as_span(lhs.evaluate(row))?;
                let r = as_span(rhs.evaluate(row))?;
                Some(l.overlaps(&r))
            }
            Predicate::And(terms) => {
                let mut result = Some(true);
                for term in terms {
                    match term.evaluate(row) {
                        Some(false) => return Some(false),
                        None => result = None,
                        Some(true) => {}
                    }
                }
                result
            }
            Predicate::Or(terms) => {
                let mut result = Some(false);
                for term in terms {
                    match term.evaluate(row) {
                        Some(true) => return Some(true),
                        None => result = None,
                        Some(false) => {}
                    }
                }
                result
            }
            Predicate::Not(inner) => inner.evaluate(row).map(|v| !v),
            Predicate::RegionOverlaps { column, region } => match row.get(column) {
                Some(Value::Region(stored)) => Some(stored.intersects(region)),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Literal(v) => write!(f, "{}", v),
            Predicate::Compare { lhs, op, rhs } => write!(f, "{} {} {}", lhs, op.as_str(), rhs),
            Predicate::In {
                lhs,
                items,
                negated,
            } => {
                let rendered: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        InItem::Expr(expr) => expr.to_string(),
                        InItem::Range {
                            start,
                            stop,
                            stride,
                        } => format!("{}..{}:{}", start, stop, stride),
                    })
                    .collect();
                let keyword = if *negated { "NOT IN" } else { "IN" };
                write!(f, "{} {} ({})", lhs, keyword, rendered.join(", "))
            }
            Predicate::Overlaps { lhs, rhs } => write!(f, "{} OVERLAPS {}", lhs, rhs),
            Predicate::And(terms) | Predicate::Or(terms) => {
                let joiner = if matches!(self, Predicate::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                let parts: Vec<String> = terms.iter().map(|t| format!("({})", t)).collect();
                f.write_str(&parts.join(joiner))
            }
            Predicate::Not(inner) => write!(f, "NOT ({})", inner),
            Predicate::RegionOverlaps { column, .. } => write!(f, "{} OVERLAPS <region>", column),
        }
    }
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct SortTerm {
    pub expr: ColumnExpr,
    pub descending: bool,
}

impl SortTerm {
    pub fn ascending(expr: ColumnExpr) -> Self {
        Self {
            expr,
            descending: false,
        }
    }
}

/// Leaf relations, produced by a [`RelationSource`].
#[derive(Debug, Clone, PartialEq)]
pub enum LeafRelation {
    /// Rows of one dimension element's records.
    DimensionTable {
        element: String,
        columns: Vec<ColumnTag>,
    },
    /// Datasets of one type in one RUN or TAGGED collection.
    DatasetSearch {
        dataset_type: String,
        collection: String,
        rank: usize,
        columns: Vec<ColumnTag>,
    },
}

impl LeafRelation {
    pub fn columns(&self) -> &[ColumnTag] {
        match self {
            LeafRelation::DimensionTable { columns, .. }
            | LeafRelation::DatasetSearch { columns, .. } => columns,
        }
    }
}

/// A relation tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    Leaf(LeafRelation),
    /// Natural join on shared columns.
    Join(Box<Relation>, Box<Relation>),
    Selection {
        input: Box<Relation>,
        predicate: Predicate,
    },
    Projection {
        input: Box<Relation>,
        columns: Vec<ColumnTag>,
    },
    Distinct(Box<Relation>),
    /// Concatenation of relations with identical columns.
    Union(Vec<Relation>),
    /// For each distinct combination of all columns other than those of
    /// `dataset_type`, keep the row with the lowest rank.
    FindFirst {
        input: Box<Relation>,
        dataset_type: String,
    },
    Sort {
        input: Box<Relation>,
        terms: Vec<SortTerm>,
    },
    Slice {
        input: Box<Relation>,
        offset: usize,
        limit: Option<usize>,
    },
    /// Boundary between the SQL-renderable part and post-processing.
    Transfer(Box<Relation>),
}

impl Relation {
    pub fn join(self, other: Relation) -> Relation {
        Relation::Join(Box::new(self), Box::new(other))
    }

    pub fn select(self, predicate: Predicate) -> Relation {
        if predicate.is_true() {
            return self;
        }
        Relation::Selection {
            input: Box::new(self),
            predicate,
        }
    }

    /// Output columns, in a stable order.
    pub fn columns(&self) -> Vec<ColumnTag> {
        match self {
            Relation::Leaf(leaf) => leaf.columns().to_vec(),
            Relation::Join(a, b) => {
                let mut columns = a.columns();
                for column in b.columns() {
                    if !columns.contains(&column) {
                        columns.push(column);
                    }
                }
                columns
            }
            Relation::Projection { columns, .. } => columns.clone(),
            Relation::Union(branches) => branches.first().map(|b| b.columns()).unwrap_or_default(),
            Relation::Selection { input, .. }
            | Relation::Distinct(input)
            | Relation::FindFirst { input, .. }
            | Relation::Sort { input, .. }
            | Relation::Slice { input, .. }
            | Relation::Transfer(input) => input.columns(),
        }
    }

    /// The subtree evaluated by SQL: below the outermost transfer, or the
    /// whole tree if there is none.
    pub fn sql_part(&self) -> &Relation {
        self.find_transfer().unwrap_or(self)
    }

    fn find_transfer(&self) -> Option<&Relation> {
        match self {
            Relation::Transfer(input) => Some(input),
            Relation::Leaf(_) => None,
            Relation::Join(a, b) => a.find_transfer().or_else(|| b.find_transfer()),
            Relation::Union(branches) => branches.iter().find_map(Relation::find_transfer),
            Relation::Selection { input, .. }
            | Relation::Projection { input, .. }
            | Relation::Distinct(input)
            | Relation::FindFirst { input, .. }
            | Relation::Sort { input, .. }
            | Relation::Slice { input, .. } => input.find_transfer(),
        }
    }

    /// Descriptions of the operations above the outermost transfer,
    /// innermost first.
    pub fn postprocessing(&self) -> Vec<String> {
        let mut steps = Vec::new();
        let mut node = self;
        loop {
            let (description, input) = match node {
                Relation::Transfer(_) | Relation::Leaf(_) => break,
                Relation::Selection { input, predicate } => (format!("filter {}", predicate), input),
                Relation::Projection { input, columns } => {
                    let names: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
                    (format!("project [{}]", names.join(", ")), input)
                }
                Relation::Distinct(input) => ("deduplicate".to_string(), input),
                Relation::FindFirst {
                    input,
                    dataset_type,
                } => (format!("find first {}", dataset_type), input),
                Relation::Sort { input, terms } => (format!("sort by {} terms", terms.len()), input),
                Relation::Slice {
                    input,
                    offset,
                    limit,
                } => (format!("slice offset={} limit={:?}", offset, limit), input),
                Relation::Join(..) | Relation::Union(..) => break,
            };
            steps.push(description);
            node = input;
        }
        if self.find_transfer().is_none() {
            steps.clear();
        }
        steps.reverse();
        steps
    }

    /// Indented tree dump.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_into(0, &mut out);
        out
    }

    fn explain_into(&self, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        let line = match self {
            Relation::Leaf(LeafRelation::DimensionTable { element, .. }) => {
                format!("table {}", element)
            }
            Relation::Leaf(LeafRelation::DatasetSearch {
                dataset_type,
                collection,
                rank,
                ..
            }) => format!("datasets {} in {} (rank {})", dataset_type, collection, rank),
            Relation::Join(..) => "join".to_string(),
            Relation::Selection { predicate, .. } => format!("select {}", predicate),
            Relation::Projection { columns, .. } => format!("project {} columns", columns.len()),
            Relation::Distinct(_) => "distinct".to_string(),
            Relation::Union(branches) => format!("union of {}", branches.len()),
            Relation::FindFirst { dataset_type, .. } => format!("find_first {}", dataset_type),
            Relation::Sort { terms, .. } => format!("sort ({} terms)", terms.len()),
            Relation::Slice { offset, limit, .. } => {
                format!("slice offset={} limit={:?}", offset, limit)
            }
            Relation::Transfer(_) => "transfer".to_string(),
        };
        out.push_str(&pad);
        out.push_str(&line);
        out.push('\n');
        match self {
            Relation::Leaf(_) => {}
            Relation::Join(a, b) => {
                a.explain_into(depth + 1, out);
                b.explain_into(depth + 1, out);
            }
            Relation::Union(branches) => {
                for branch in branches {
                    branch.explain_into(depth + 1, out);
                }
            }
            Relation::Selection { input, .. }
            | Relation::Projection { input, .. }
            | Relation::Distinct(input)
            | Relation::FindFirst { input, .. }
            | Relation::Sort { input, .. }
            | Relation::Slice { input, .. }
            | Relation::Transfer(input) => input.explain_into(depth + 1, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (ColumnTag::key(*k), v.clone()))
            .collect()
    }

    #[test]
    fn test_numeric_comparison_across_types() {
        assert_eq!(Value::Int(2).compare(&Value::Float(2.0)), Some(Ordering::Equal));
        assert_eq!(Value::Int(1).compare(&Value::Str("1".into())), None);
        assert_eq!(Value::Null.compare(&Value::Null), None);
        assert_ne!(Value::Int(2), Value::Float(2.0));
    }

    #[test]
    fn test_three_valued_logic() {
        let r = row(&[("a", Value::Int(1)), ("b", Value::Null)]);
        let a_is_1 = Predicate::eq(ColumnTag::key("a"), 1);
        let b_is_1 = Predicate::eq(ColumnTag::key("b"), 1);
        assert_eq!(a_is_1.evaluate(&r), Some(true));
        assert_eq!(b_is_1.evaluate(&r), None);
        assert_eq!(Predicate::Not(Box::new(b_is_1.clone())).evaluate(&r), None);
        assert_eq!(
            Predicate::Or(vec![a_is_1.clone(), b_is_1.clone()]).evaluate(&r),
            Some(true)
        );
        assert_eq!(Predicate::And(vec![a_is_1, b_is_1]).evaluate(&r), None);
    }

    #[test]
    fn test_in_with_ranges() {
        let r = row(&[("visit", Value::Int(7))]);
        let pred = |negated| Predicate::In {
            lhs: ColumnExpr::column(ColumnTag::key("visit")),
            items: vec![
                InItem::Expr(ColumnExpr::literal(1)),
                InItem::Range {
                    start: 1,
                    stop: 9,
                    stride: 2,
                },
            ],
            negated,
        };
        assert_eq!(pred(false).evaluate(&r), Some(true));
        assert_eq!(pred(true).evaluate(&r), Some(false));
        let even = row(&[("visit", Value::Int(8))]);
        assert_eq!(pred(false).evaluate(&even), Some(false));
    }

    #[test]
    fn test_overlaps_with_instant() {
        let t = |s: &str| AstroTime::parse_literal(s).unwrap();
        let span = Timespan::new(Some(t("2020-01-01")), Some(t("2020-01-02")));
        let mut r = Row::new();
        r.insert(ColumnTag::record("visit", "timespan"), Value::Timespan(span));
        let pred = |time: AstroTime| Predicate::Overlaps {
            lhs: ColumnExpr::column(ColumnTag::record("visit", "timespan")),
            rhs: ColumnExpr::literal(time),
        };
        assert_eq!(pred(t("2020-01-01T12:00:00")).evaluate(&r), Some(true));
        assert_eq!(pred(t("2020-01-02")).evaluate(&r), Some(false));
    }

    #[test]
    fn test_and_flattens() {
        let p = Predicate::and([
            Predicate::Literal(true),
            Predicate::And(vec![
                Predicate::eq(ColumnTag::key("a"), 1),
                Predicate::eq(ColumnTag::key("b"), 2),
            ]),
            Predicate::eq(ColumnTag::key("c"), 3),
        ]);
        assert_eq!(p.conjuncts().len(), 3);
        assert!(Predicate::and([]).is_true());
    }

    #[test]
    fn test_postprocessing_lists_ops_above_transfer() {
        let leaf = Relation::Leaf(LeafRelation::DimensionTable {
            element: "detector".into(),
            columns: vec![ColumnTag::key("instrument"), ColumnTag::key("detector")],
        });
        let tree = Relation::Slice {
            input: Box::new(
                Relation::Transfer(Box::new(leaf.clone()))
                    .select(Predicate::eq(ColumnTag::key("detector"), 1)),
            ),
            offset: 0,
            limit: Some(1),
        };
        assert_eq!(tree.postprocessing().len(), 2);
        assert_eq!(tree.sql_part(), &leaf);
        assert!(leaf.postprocessing().is_empty());
    }
}
