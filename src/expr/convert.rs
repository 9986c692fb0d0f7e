//! Conversion of parsed expressions into relation predicates.

use super::tree::{BinaryOperator, Node, UnaryOperator};
use crate::dimensions::{DataIdValue, DimensionUniverse, FieldType, KeyType};
use crate::error::{ButlerError, Result};
use crate::time::{AstroTime, Timespan};
use crate::relation::{
    ArithOp, ColumnExpr, ColumnTag, CompareOp, DatasetField, InItem, Predicate, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A value bound to an identifier in an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Scalar(Value),
    /// Only valid inside an `IN` list.
    List(Vec<Value>),
}

macro_rules! scalar_bind {
    ($($ty:ty),*) => {
        $(impl From<$ty> for BindValue {
            fn from(value: $ty) -> Self {
                BindValue::Scalar(value.into())
            }
        })*
    };
}

scalar_bind!(i64, f64, &str, String, AstroTime, Timespan, Value);

impl BindValue {
    pub fn list<T: Into<Value>>(values: impl IntoIterator<Item = T>) -> Self {
        BindValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// Everything identifiers can resolve against.
pub struct ConversionContext<'a> {
    pub universe: &'a Arc<DimensionUniverse>,
    pub bind: &'a BTreeMap<String, BindValue>,
    /// Dataset types joined into the query; `ingest_date` and `run` refer to
    /// these.
    pub dataset_types: &'a [String],
}

/// Result of converting an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedExpression {
    pub predicate: Predicate,
    /// Dimensions whose keys or records are referenced.
    pub dimensions: BTreeSet<String>,
    /// Elements whose record fields are referenced.
    pub elements: BTreeSet<String>,
    /// Dataset types whose columns are referenced.
    pub dataset_types: BTreeSet<String>,
    /// Governor values fixed by `=` or `IN` in the top-level conjunction.
    pub governor_constraints: BTreeMap<String, BTreeSet<DataIdValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Int,
    Float,
    Str,
    Bool,
    Time,
    Timespan,
}

impl Ty {
    fn name(&self) -> &'static str {
        match self {
            Ty::Int => "integer",
            Ty::Float => "float",
            Ty::Str => "string",
            Ty::Bool => "boolean",
            Ty::Time => "time",
            Ty::Timespan => "timespan",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Ty::Int | Ty::Float)
    }

    fn comparable(&self, other: &Ty) -> bool {
        self == other || (self.is_numeric() && other.is_numeric())
    }

    fn of_value(value: &Value) -> Result<Ty> {
        Ok(match value {
            Value::Int(_) => Ty::Int,
            Value::Float(_) => Ty::Float,
            Value::Str(_) => Ty::Str,
            Value::Bool(_) => Ty::Bool,
            Value::Time(_) => Ty::Time,
            Value::Timespan(_) => Ty::Timespan,
            other => {
                return Err(ButlerError::expression(format!(
                    "bind values of type {} are not supported",
                    other.type_name()
                )));
            }
        })
    }
}

enum Operand {
    Scalar(ColumnExpr, Ty),
    Bool(Predicate),
    Tuple(ColumnExpr, ColumnExpr),
    List(Vec<Value>),
}

struct Converter<'a, 'c> {
    context: &'c ConversionContext<'a>,
    dimensions: BTreeSet<String>,
    elements: BTreeSet<String>,
    dataset_types: BTreeSet<String>,
}

/// Resolve and type-check `tree` into a predicate.
pub fn convert(tree: &Node, context: &ConversionContext<'_>) -> Result<ConvertedExpression> {
    let mut converter = Converter {
        context,
        dimensions: BTreeSet::new(),
        elements: BTreeSet::new(),
        dataset_types: BTreeSet::new(),
    };
    let predicate = match converter.node(tree)? {
        Operand::Bool(predicate) => predicate,
        Operand::Scalar(expr, Ty::Bool) => Predicate::Compare {
            lhs: expr,
            op: CompareOp::Eq,
            rhs: ColumnExpr::Literal(Value::Bool(true)),
        },
        _ => {
            return Err(ButlerError::expression(format!(
                "expression '{}' is not a boolean condition",
                tree
            )));
        }
    };
    let governor_constraints = governor_constraints(&predicate, context.universe);
    Ok(ConvertedExpression {
        predicate,
        dimensions: converter.dimensions,
        elements: converter.elements,
        dataset_types: converter.dataset_types,
        governor_constraints,
    })
}

fn governor_constraints(
    predicate: &Predicate,
    universe: &DimensionUniverse,
) -> BTreeMap<String, BTreeSet<DataIdValue>> {
    let is_governor = |tag: &ColumnTag| match tag {
        ColumnTag::DimensionKey(name) => universe.get(name).is_some_and(|e| e.is_governor()),
        _ => false,
    };
    let mut out: BTreeMap<String, BTreeSet<DataIdValue>> = BTreeMap::new();
    for conjunct in predicate.conjuncts() {
        match conjunct {
            Predicate::Compare {
                lhs,
                op: CompareOp::Eq,
                rhs,
            } => {
                let pair = match (lhs, rhs) {
                    (ColumnExpr::Column(tag), ColumnExpr::Literal(value))
                    | (ColumnExpr::Literal(value), ColumnExpr::Column(tag)) => Some((tag, value)),
                    _ => None,
                };
                if let Some((tag, value)) = pair.filter(|(tag, _)| is_governor(tag)) {
                    if let Some(v) = value.to_data_id_value() {
                        out.entry(tag.qualified_name()).or_default().insert(v);
                    }
                }
            }
            Predicate::In {
                lhs: ColumnExpr::Column(tag),
                items,
                negated: false,
            } if is_governor(tag) => {
                let values: Option<BTreeSet<DataIdValue>> = items
                    .iter()
                    .map(|item| match item {
                        InItem::Expr(ColumnExpr::Literal(value)) => value.to_data_id_value(),
                        _ => None,
                    })
                    .collect();
                if let Some(values) = values {
                    out.entry(tag.qualified_name()).or_default().extend(values);
                }
            }
            _ => {}
        }
    }
    out
}

impl<'a, 'c> Converter<'a, 'c> {
    fn node(&mut self, node: &Node) -> Result<Operand> {
        match node {
            Node::Parens(inner) => self.node(inner),
            Node::Identifier(name) => self.identifier(name),
            Node::NumericLiteral(text) => {
                if let Ok(v) = text.parse::<i64>() {
                    Ok(Operand::Scalar(ColumnExpr::literal(v), Ty::Int))
                } else {
                    let v: f64 = text.parse().map_err(|_| {
                        ButlerError::expression(format!("invalid numeric literal '{}'", text))
                    })?;
                    Ok(Operand::Scalar(ColumnExpr::literal(v), Ty::Float))
                }
            }
            Node::StringLiteral(text) => {
                Ok(Operand::Scalar(ColumnExpr::literal(text.as_str()), Ty::Str))
            }
            Node::TimeLiteral(time) => Ok(Operand::Scalar(ColumnExpr::literal(*time), Ty::Time)),
            Node::RangeLiteral { .. } => Err(ButlerError::expression(format!(
                "range '{}' is only allowed inside an IN list",
                node
            ))),
            Node::Tuple(begin, end) => {
                let begin = self.time_scalar(begin)?;
                let end = self.time_scalar(end)?;
                Ok(Operand::Tuple(begin, end))
            }
            Node::UnaryOp { op, operand } => {
                let operand_value = self.node(operand)?;
                match (op, operand_value) {
                    (UnaryOperator::Not, Operand::Bool(p)) => {
                        Ok(Operand::Bool(Predicate::Not(Box::new(p))))
                    }
                    (UnaryOperator::Minus, Operand::Scalar(expr, ty)) if ty.is_numeric() => {
                        Ok(Operand::Scalar(ColumnExpr::Neg(Box::new(expr)), ty))
                    }
                    (UnaryOperator::Plus, Operand::Scalar(expr, ty)) if ty.is_numeric() => {
                        Ok(Operand::Scalar(expr, ty))
                    }
                    _ => Err(ButlerError::expression(format!(
                        "invalid operand for unary operator in '{}'",
                        node
                    ))),
                }
            }
            Node::BinaryOp { lhs, op, rhs } => self.binary(node, lhs, *op, rhs),
            Node::IsIn {
                lhs,
                values,
                not_in,
            } => self.is_in(node, lhs, values, *not_in),
        }
    }

    fn time_scalar(&mut self, node: &Node) -> Result<ColumnExpr> {
        match self.node(node)? {
            Operand::Scalar(expr, Ty::Time) => Ok(expr),
            _ => Err(ButlerError::expression(format!(
                "'{}' is not a time value",
                node
            ))),
        }
    }

    fn binary(&mut self, node: &Node, lhs: &Node, op: BinaryOperator, rhs: &Node) -> Result<Operand> {
        let left = self.node(lhs)?;
        let right = self.node(rhs)?;
        let mismatch = |l: &str, r: &str| {
            ButlerError::expression(format!(
                "operator {} is not defined for {} and {} operands in '{}'",
                op.as_str(),
                l,
                r,
                node
            ))
        };
        let describe = |operand: &Operand| match operand {
            Operand::Scalar(_, ty) => ty.name(),
            Operand::Bool(_) => "boolean",
            Operand::Tuple(..) => "tuple",
            Operand::List(_) => "list",
        };

        match op {
            BinaryOperator::And | BinaryOperator::Or => match (left, right) {
                (Operand::Bool(a), Operand::Bool(b)) => Ok(Operand::Bool(if op == BinaryOperator::And {
                    Predicate::and([a, b])
                } else {
                    Predicate::Or(vec![a, b])
                })),
                (l, r) => Err(mismatch(describe(&l), describe(&r))),
            },
            BinaryOperator::Overlaps => {
                let l_desc = describe(&left);
                let r_desc = describe(&right);
                let as_span = |operand: Operand| match operand {
                    Operand::Scalar(expr, Ty::Timespan | Ty::Time) => Some(expr),
                    Operand::Tuple(begin, end) => {
                        Some(ColumnExpr::MakeTimespan(Box::new(begin), Box::new(end)))
                    }
                    _ => None,
                };
                match (as_span(left), as_span(right)) {
                    (Some(lhs), Some(rhs)) => Ok(Operand::Bool(Predicate::Overlaps { lhs, rhs })),
                    _ => Err(mismatch(l_desc, r_desc)),
                }
            }
            _ if op.is_comparison() => match (left, right) {
                (Operand::Scalar(a, ta), Operand::Scalar(b, tb))
                    if ta.comparable(&tb) && ta != Ty::Timespan =>
                {
                    let op = match op {
                        BinaryOperator::Eq => CompareOp::Eq,
                        BinaryOperator::Ne => CompareOp::Ne,
                        BinaryOperator::Lt => CompareOp::Lt,
                        BinaryOperator::Le => CompareOp::Le,
                        BinaryOperator::Gt => CompareOp::Gt,
                        _ => CompareOp::Ge,
                    };
                    Ok(Operand::Bool(Predicate::Compare { lhs: a, op, rhs: b }))
                }
                (l, r) => Err(mismatch(describe(&l), describe(&r))),
            },
            _ => match (left, right) {
                (Operand::Scalar(a, ta), Operand::Scalar(b, tb))
                    if ta.is_numeric() && tb.is_numeric() =>
                {
                    let arith = match op {
                        BinaryOperator::Add => ArithOp::Add,
                        BinaryOperator::Sub => ArithOp::Sub,
                        BinaryOperator::Mul => ArithOp::Mul,
                        BinaryOperator::Div => ArithOp::Div,
                        _ => ArithOp::Mod,
                    };
                    let ty = if ta == Ty::Int && tb == Ty::Int {
                        Ty::Int
                    } else {
                        Ty::Float
                    };
                    Ok(Operand::Scalar(
                        ColumnExpr::Arith {
                            op: arith,
                            lhs: Box::new(a),
                            rhs: Box::new(b),
                        },
                        ty,
                    ))
                }
                (l, r) => Err(mismatch(describe(&l), describe(&r))),
            },
        }
    }

    fn is_in(&mut self, node: &Node, lhs: &Node, values: &[Node], negated: bool) -> Result<Operand> {
        let (column, ty) = match self.node(lhs)? {
            Operand::Scalar(expr, ty) if ty != Ty::Timespan => (expr, ty),
            _ => {
                return Err(ButlerError::expression(format!(
                    "left operand of IN must be a scalar in '{}'",
                    node
                )));
            }
        };
        let check = |item_ty: Ty| {
            if ty.comparable(&item_ty) {
                Ok(())
            } else {
                Err(ButlerError::expression(format!(
                    "IN list item of type {} cannot match {} values in '{}'",
                    item_ty.name(),
                    ty.name(),
                    node
                )))
            }
        };

        let mut items = Vec::with_capacity(values.len());
        for value in values {
            if let Node::RangeLiteral {
                start,
                stop,
                stride,
            } = value
            {
                if ty != Ty::Int {
                    return Err(ButlerError::expression(format!(
                        "range '{}' requires an integer operand",
                        value
                    )));
                }
                items.push(InItem::Range {
                    start: *start,
                    stop: *stop,
                    stride: stride.unwrap_or(1),
                });
                continue;
            }
            match self.node(value)? {
                Operand::Scalar(expr, item_ty) => {
                    check(item_ty)?;
                    items.push(InItem::Expr(expr));
                }
                Operand::List(list) => {
                    for v in list {
                        check(Ty::of_value(&v)?)?;
                        items.push(InItem::Expr(ColumnExpr::Literal(v)));
                    }
                }
                _ => {
                    return Err(ButlerError::expression(format!(
                        "invalid IN list item '{}'",
                        value
                    )));
                }
            }
        }
        Ok(Operand::Bool(Predicate::In {
            lhs: column,
            items,
            negated,
        }))
    }

    fn identifier(&mut self, name: &str) -> Result<Operand> {
        if let Some(bound) = self.context.bind.get(name) {
            return Ok(match bound {
                BindValue::Scalar(value) => {
                    Operand::Scalar(ColumnExpr::Literal(value.clone()), Ty::of_value(value)?)
                }
                BindValue::List(values) => Operand::List(values.clone()),
            });
        }

        let parts: Vec<&str> = name.split('.').collect();
        if let Some(operand) = self.dataset_column(&parts)? {
            return Ok(operand);
        }

        let universe = self.context.universe;
        let Some(element) = universe.get(parts[0]) else {
            return Err(ButlerError::expression(format!(
                "unrecognized identifier '{}'",
                name
            )));
        };
        let element_name = element.name().to_string();
        let key_dimensions: Vec<String> = element
            .key_dimensions()
            .iter()
            .map(|d| d.to_string())
            .collect();

        match parts.as_slice() {
            [_] | [_, _] if element.is_dimension() && (parts.len() == 1 || parts[1] == element.primary_key()) => {
                let ty = match element.key_type() {
                    Some(KeyType::Str) => Ty::Str,
                    _ => Ty::Int,
                };
                self.dimensions.insert(element_name.clone());
                Ok(Operand::Scalar(
                    ColumnExpr::column(ColumnTag::DimensionKey(element_name)),
                    ty,
                ))
            }
            [_, "timespan", rest @ ..] if element.has_timespan() && rest.len() <= 1 => {
                let column = ColumnExpr::column(ColumnTag::record(element_name.as_str(), "timespan"));
                self.note_record(element_name, key_dimensions);
                match rest {
                    [] => Ok(Operand::Scalar(column, Ty::Timespan)),
                    ["begin"] => Ok(Operand::Scalar(ColumnExpr::TimespanBegin(Box::new(column)), Ty::Time)),
                    ["end"] => Ok(Operand::Scalar(ColumnExpr::TimespanEnd(Box::new(column)), Ty::Time)),
                    _ => Err(ButlerError::expression(format!(
                        "unrecognized identifier '{}'",
                        name
                    ))),
                }
            }
            [_, "region"] if element.has_region() => Err(ButlerError::expression(format!(
                "region '{}' cannot be used in expressions; pass a region to the query instead",
                name
            ))),
            [_, field] => {
                let Some(spec) = element.field(field) else {
                    return Err(ButlerError::expression(format!(
                        "element '{}' has no field '{}'",
                        element_name, field
                    )));
                };
                let ty = match spec.dtype {
                    FieldType::Int => Ty::Int,
                    FieldType::Float => Ty::Float,
                    FieldType::Str => Ty::Str,
                    FieldType::Bool => Ty::Bool,
                };
                let column = ColumnExpr::column(ColumnTag::record(element_name.as_str(), *field));
                self.note_record(element_name, key_dimensions);
                Ok(Operand::Scalar(column, ty))
            }
            _ => Err(ButlerError::expression(format!(
                "unrecognized identifier '{}'",
                name
            ))),
        }
    }

    fn note_record(&mut self, element: String, key_dimensions: Vec<String>) {
        self.dimensions.extend(key_dimensions);
        self.elements.insert(element);
    }

    /// `ingest_date`, `<type>.ingest_date` and `<type>.run`.
    fn dataset_column(&mut self, parts: &[&str]) -> Result<Option<Operand>> {
        let known = self.context.dataset_types;
        let (dataset_type, field) = match parts {
            ["ingest_date"] => match known {
                [only] => (only.clone(), "ingest_date"),
                [] => {
                    return Err(ButlerError::expression(
                        "'ingest_date' requires a dataset type in the query",
                    ));
                }
                _ => {
                    return Err(ButlerError::expression(format!(
                        "'ingest_date' is ambiguous between dataset types {:?}; qualify it as '<type>.ingest_date'",
                        known
                    )));
                }
            },
            [dt, field @ ("ingest_date" | "run")] if known.iter().any(|k| k.as_str() == *dt) => {
                (dt.to_string(), *field)
            }
            _ => return Ok(None),
        };
        self.dataset_types.insert(dataset_type.clone());
        let (field, ty) = if field == "run" {
            (DatasetField::Run, Ty::Str)
        } else {
            (DatasetField::IngestDate, Ty::Time)
        };
        Ok(Some(Operand::Scalar(
            ColumnExpr::column(ColumnTag::dataset(dataset_type, field)),
            ty,
        )))
    }
}
