//! Rendering of relation trees as SQL.

use super::{
    ColumnExpr, ColumnTag, DatasetField, InItem, LeafRelation, Predicate, Relation, SortTerm,
    Value,
};
use crate::error::{ButlerError, Result};
use std::fmt;

/// A rendered `SELECT` statement with positional `?` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl fmt::Display for SqlQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self.params.iter().map(|p| p.to_string()).collect();
            write!(f, " -- params: [{}]", params.join(", "))?;
        }
        Ok(())
    }
}

/// Render the part of `relation` below its outermost transfer (or all of it).
///
/// Times are passed as TAI nanoseconds. Timespan columns become a pair of
/// `<name>_begin`/`<name>_end` columns.
pub fn render_sql(relation: &Relation) -> Result<SqlQuery> {
    let mut renderer = Renderer::default();
    let sql = renderer.relation(relation.sql_part())?;
    Ok(SqlQuery {
        sql,
        params: renderer.params,
    })
}

/// Sort terms of a sort directly below `relation`, looking through a slice.
fn sorted_by(relation: &Relation) -> Option<&[SortTerm]> {
    match relation {
        Relation::Sort { terms, .. } => Some(terms),
        Relation::Slice { input, .. } => sorted_by(input),
        _ => None,
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Output column names of one tag.
fn output_names(tag: &ColumnTag) -> Vec<String> {
    let name = tag.qualified_name();
    if tag.is_timespan() {
        vec![format!("{}_begin", name), format!("{}_end", name)]
    } else {
        vec![name]
    }
}

/// Physical column names of a tag inside its table.
fn physical_names(tag: &ColumnTag) -> Vec<String> {
    match tag {
        ColumnTag::DimensionKey(name) => vec![name.clone()],
        ColumnTag::DimensionRecord { field, .. } if tag.is_timespan() => {
            vec![format!("{}_begin", field), format!("{}_end", field)]
        }
        ColumnTag::DimensionRecord { field, .. } => vec![field.clone()],
        ColumnTag::Dataset { field, .. } => vec![field.as_str().to_string()],
    }
}

#[derive(Default)]
struct Renderer {
    params: Vec<Value>,
    aliases: usize,
}

impl Renderer {
    fn alias(&mut self) -> String {
        self.aliases += 1;
        format!("t{}", self.aliases)
    }

    fn param(&mut self, value: &Value) -> Result<String> {
        let value = match value {
            Value::Time(time) => Value::Int(time.tai_nsec()),
            Value::Region(_) | Value::Timespan(_) => {
                return Err(ButlerError::InvalidQuery(format!(
                    "a {} value cannot be passed as a single SQL parameter",
                    value.type_name()
                )));
            }
            other => other.clone(),
        };
        self.params.push(value);
        Ok("?".to_string())
    }

    fn select_list(columns: &[ColumnTag]) -> String {
        columns
            .iter()
            .flat_map(output_names)
            .map(|n| quote(&n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn relation(&mut self, relation: &Relation) -> Result<String> {
        match relation {
            Relation::Leaf(leaf) => self.leaf(leaf),
            Relation::Join(lhs, rhs) => {
                let rhs_columns = rhs.columns();
                let shared: Vec<String> = lhs
                    .columns()
                    .iter()
                    .filter(|c| rhs_columns.contains(c))
                    .flat_map(output_names)
                    .map(|n| quote(&n))
                    .collect();
                let left = self.relation(lhs)?;
                let right = self.relation(rhs)?;
                let (a, b) = (self.alias(), self.alias());
                let columns = Self::select_list(&relation.columns());
                if shared.is_empty() {
                    Ok(format!(
                        "SELECT {} FROM ({}) AS {} CROSS JOIN ({}) AS {}",
                        columns, left, a, right, b
                    ))
                } else {
                    Ok(format!(
                        "SELECT {} FROM ({}) AS {} JOIN ({}) AS {} USING ({})",
                        columns,
                        left,
                        a,
                        right,
                        b,
                        shared.join(", ")
                    ))
                }
            }
            Relation::Selection { input, predicate } => {
                let inner = self.relation(input)?;
                let alias = self.alias();
                let condition = self.predicate(predicate)?;
                Ok(format!(
                    "SELECT * FROM ({}) AS {} WHERE {}",
                    inner, alias, condition
                ))
            }
            Relation::Projection { input, columns } => {
                let inner = self.relation(input)?;
                let alias = self.alias();
                let mut sql = format!(
                    "SELECT {} FROM ({}) AS {}",
                    Self::select_list(columns),
                    inner,
                    alias
                );
                // Subquery order is not kept, so restate it.
                if let Some(terms) = sorted_by(input) {
                    sql.push_str(&self.order_by(terms)?);
                }
                Ok(sql)
            }
            Relation::Distinct(input) => {
                let inner = self.relation(input)?;
                let alias = self.alias();
                Ok(format!("SELECT DISTINCT * FROM ({}) AS {}", inner, alias))
            }
            Relation::Union(branches) => {
                if branches.is_empty() {
                    return Err(ButlerError::InvalidQuery(
                        "cannot render an empty union".to_string(),
                    ));
                }
                let mut parts = Vec::with_capacity(branches.len());
                for branch in branches {
                    parts.push(self.relation(branch)?);
                }
                if parts.len() == 1 {
                    return Ok(parts.remove(0));
                }
                let alias = self.alias();
                Ok(format!(
                    "SELECT * FROM ({}) AS {}",
                    parts.join(" UNION ALL "),
                    alias
                ))
            }
            Relation::FindFirst {
                input,
                dataset_type,
            } => {
                let columns = input.columns();
                let partition: Vec<String> = columns
                    .iter()
                    .filter(|c| {
                        !matches!(c, ColumnTag::Dataset { dataset_type: dt, .. } if dt == dataset_type)
                    })
                    .flat_map(output_names)
                    .map(|n| quote(&n))
                    .collect();
                let rank = quote(&ColumnTag::dataset(dataset_type.as_str(), DatasetField::Rank).qualified_name());
                let inner = self.relation(input)?;
                let (a, b) = (self.alias(), self.alias());
                let window = if partition.is_empty() {
                    format!("ROW_NUMBER() OVER (ORDER BY {})", rank)
                } else {
                    format!(
                        "ROW_NUMBER() OVER (PARTITION BY {} ORDER BY {})",
                        partition.join(", "),
                        rank
                    )
                };
                Ok(format!(
                    "SELECT {} FROM (SELECT *, {} AS \"_rownum\" FROM ({}) AS {}) AS {} WHERE \"_rownum\" = 1",
                    Self::select_list(&columns),
                    window,
                    inner,
                    a,
                    b
                ))
            }
            Relation::Sort { input, terms } => {
                let inner = self.relation(input)?;
                let alias = self.alias();
                let order = self.order_by(terms)?;
                Ok(format!("SELECT * FROM ({}) AS {}{}", inner, alias, order))
            }
            Relation::Slice {
                input,
                offset,
                limit,
            } => {
                // LIMIT must share a SELECT with the ORDER BY it depends on.
                let mut sql = match input.as_ref() {
                    Relation::Sort { input, terms } => {
                        let inner = self.relation(input)?;
                        let alias = self.alias();
                        let order = self.order_by(terms)?;
                        format!("SELECT * FROM ({}) AS {}{}", inner, alias, order)
                    }
                    other => {
                        let inner = self.relation(other)?;
                        let alias = self.alias();
                        format!("SELECT * FROM ({}) AS {}", inner, alias)
                    }
                };
                if let Some(limit) = limit {
                    sql.push_str(&format!(" LIMIT {}", limit));
                }
                if *offset > 0 {
                    sql.push_str(&format!(" OFFSET {}", offset));
                }
                Ok(sql)
            }
            Relation::Transfer(input) => self.relation(input),
        }
    }

    fn order_by(&mut self, terms: &[SortTerm]) -> Result<String> {
        let mut rendered = Vec::with_capacity(terms.len());
        for term in terms {
            let expr = self.scalar(&term.expr)?;
            rendered.push(if term.descending {
                format!("{} DESC", expr)
            } else {
                expr
            });
        }
        Ok(format!(" ORDER BY {}", rendered.join(", ")))
    }

    fn leaf(&mut self, leaf: &LeafRelation) -> Result<String> {
        match leaf {
            LeafRelation::DimensionTable { element, columns } => {
                let mut select = Vec::new();
                for tag in columns {
                    for (physical, output) in physical_names(tag).iter().zip(output_names(tag)) {
                        select.push(format!("{} AS {}", quote(physical), quote(&output)));
                    }
                }
                Ok(format!("SELECT {} FROM {}", select.join(", "), quote(element)))
            }
            LeafRelation::DatasetSearch {
                dataset_type,
                collection,
                rank,
                columns,
            } => {
                let mut select = Vec::new();
                for tag in columns {
                    if matches!(tag, ColumnTag::Dataset { field: DatasetField::Rank, .. }) {
                        let param = self.param(&Value::Int(*rank as i64))?;
                        select.push(format!("{} AS {}", param, quote(&tag.qualified_name())));
                        continue;
                    }
                    for (physical, output) in physical_names(tag).iter().zip(output_names(tag)) {
                        select.push(format!("{} AS {}", quote(physical), quote(&output)));
                    }
                }
                let type_param = self.param(&Value::Str(dataset_type.clone()))?;
                let collection_param = self.param(&Value::Str(collection.clone()))?;
                Ok(format!(
                    "SELECT {} FROM \"dataset\" WHERE \"dataset_type\" = {} AND \"collection\" = {}",
                    select.join(", "),
                    type_param,
                    collection_param
                ))
            }
        }
    }

    fn scalar(&mut self, expr: &ColumnExpr) -> Result<String> {
        match expr {
            ColumnExpr::Literal(value) => self.param(value),
            ColumnExpr::Column(tag) => {
                if tag.is_timespan() || tag.is_region() {
                    return Err(ButlerError::InvalidQuery(format!(
                        "column '{}' cannot be used as a scalar in SQL",
                        tag
                    )));
                }
                Ok(quote(&tag.qualified_name()))
            }
            ColumnExpr::Neg(inner) => Ok(format!("-({})", self.scalar(inner)?)),
            ColumnExpr::Arith { op, lhs, rhs } => Ok(format!(
                "({} {} {})",
                self.scalar(lhs)?,
                op.as_str(),
                self.scalar(rhs)?
            )),
            ColumnExpr::TimespanBegin(inner) => Ok(self.bounds(inner)?.0),
            ColumnExpr::TimespanEnd(inner) => Ok(self.bounds(inner)?.1),
            ColumnExpr::MakeTimespan(..) => Err(ButlerError::InvalidQuery(
                "a timespan cannot be used as a scalar in SQL".to_string(),
            )),
        }
    }

    /// `(begin, end)` SQL expressions of a timespan or time expression.
    fn bounds(&mut self, expr: &ColumnExpr) -> Result<(String, String)> {
        match expr {
            ColumnExpr::Column(tag) if tag.is_timespan() => {
                let names = output_names(tag);
                Ok((quote(&names[0]), quote(&names[1])))
            }
            ColumnExpr::Literal(Value::Timespan(span)) => {
                let begin = self.param(&Value::Int(span.begin_nsec()))?;
                let end = self.param(&Value::Int(span.end_nsec()))?;
                Ok((begin, end))
            }
            ColumnExpr::MakeTimespan(begin, end) => Ok((self.scalar(begin)?, self.scalar(end)?)),
            other => {
                let instant = self.scalar(other)?;
                Ok((instant.clone(), format!("({} + 1)", instant)))
            }
        }
    }

    fn predicate(&mut self, predicate: &Predicate) -> Result<String> {
        match predicate {
            Predicate::Literal(true) => Ok("1 = 1".to_string()),
            Predicate::Literal(false) => Ok("1 = 0".to_string()),
            Predicate::Compare { lhs, op, rhs } => Ok(format!(
                "{} {} {}",
                self.scalar(lhs)?,
                op.as_str(),
                self.scalar(rhs)?
            )),
            Predicate::In {
                lhs,
                items,
                negated,
            } => {
                let column = self.scalar(lhs)?;
                let mut values = Vec::new();
                let mut terms = Vec::new();
                for item in items {
                    match item {
                        InItem::Expr(expr) => values.push(self.scalar(expr)?),
                        InItem::Range {
                            start,
                            stop,
                            stride,
                        } => {
                            let range = if *stride == 1 {
                                format!("{} BETWEEN {} AND {}", column, start, stop)
                            } else {
                                format!(
                                    "({} BETWEEN {} AND {} AND ({} - {}) % {} = 0)",
                                    column, start, stop, column, start, stride
                                )
                            };
                            terms.push(range);
                        }
                    }
                }
                if !values.is_empty() {
                    terms.insert(0, format!("{} IN ({})", column, values.join(", ")));
                }
                let body = if terms.is_empty() {
                    "1 = 0".to_string()
                } else {
                    terms.join(" OR ")
                };
                Ok(if *negated {
                    format!("NOT ({})", body)
                } else {
                    format!("({})", body)
                })
            }
            Predicate::Overlaps { lhs, rhs } => {
                let (lb, le) = self.bounds(lhs)?;
                let (rb, re) = self.bounds(rhs)?;
                Ok(format!(
                    "({lb} < {le} AND {rb} < {re} AND {lb} < {re} AND {rb} < {le})"
                ))
            }
            Predicate::And(terms) | Predicate::Or(terms) => {
                let joiner = if matches!(predicate, Predicate::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                let mut parts = Vec::with_capacity(terms.len());
                for term in terms {
                    parts.push(format!("({})", self.predicate(term)?));
                }
                Ok(parts.join(joiner))
            }
            Predicate::Not(inner) => Ok(format!("NOT ({})", self.predicate(inner)?)),
            Predicate::RegionOverlaps { column, .. } => Err(ButlerError::InvalidQuery(format!(
                "region overlap on '{}' cannot be evaluated in SQL",
                column
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::CompareOp;
    use crate::time::AstroTime;

    fn raw_search(collection: &str, rank: usize) -> Relation {
        Relation::Leaf(LeafRelation::DatasetSearch {
            dataset_type: "raw".into(),
            collection: collection.into(),
            rank,
            columns: vec![
                ColumnTag::key("instrument"),
                ColumnTag::key("exposure"),
                ColumnTag::dataset("raw", DatasetField::IngestDate),
                ColumnTag::dataset("raw", DatasetField::Rank),
            ],
        })
    }

    #[test]
    fn test_time_params_are_tai_nanoseconds() {
        let time = AstroTime::parse_literal("2020-01-01T00:00:00").unwrap();
        let tree = raw_search("run", 0).select(Predicate::Compare {
            lhs: ColumnExpr::column(ColumnTag::dataset("raw", DatasetField::IngestDate)),
            op: CompareOp::Eq,
            rhs: ColumnExpr::literal(time),
        });
        let query = render_sql(&tree).unwrap();
        assert!(query.sql.contains("WHERE \"raw.ingest_date\" = ?"));
        assert_eq!(query.params.last(), Some(&Value::Int(time.tai_nsec())));
    }

    #[test]
    fn test_find_first_uses_window_function() {
        let tree = Relation::FindFirst {
            input: Box::new(Relation::Union(vec![raw_search("a", 0), raw_search("b", 1)])),
            dataset_type: "raw".into(),
        };
        let sql = render_sql(&tree).unwrap().sql;
        assert!(sql.contains(
            "ROW_NUMBER() OVER (PARTITION BY \"instrument\", \"exposure\" ORDER BY \"raw.rank\")"
        ));
        assert!(sql.contains("UNION ALL"));
    }

    #[test]
    fn test_sort_and_slice_render_as_one_select() {
        let exposure = ColumnExpr::column(ColumnTag::key("exposure"));
        let tree = Relation::Projection {
            input: Box::new(Relation::Slice {
                input: Box::new(Relation::Sort {
                    input: Box::new(raw_search("run", 0)),
                    terms: vec![SortTerm {
                        expr: exposure,
                        descending: true,
                    }],
                }),
                offset: 1,
                limit: Some(2),
            }),
            columns: vec![ColumnTag::key("instrument")],
        };
        let sql = render_sql(&tree).unwrap().sql;
        assert!(
            sql.contains(") AS t1 ORDER BY \"exposure\" DESC LIMIT 2 OFFSET 1) AS t2 ORDER BY \"exposure\" DESC"),
            "{}",
            sql
        );
    }

    #[test]
    fn test_only_renders_below_transfer() {
        let inner = raw_search("run", 0);
        let tree = Relation::Transfer(Box::new(inner.clone())).select(Predicate::RegionOverlaps {
            column: ColumnTag::record("visit", "region"),
            region: geo::Polygon::new(geo::LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]), vec![]),
        });
        assert_eq!(render_sql(&tree).unwrap(), render_sql(&inner).unwrap());

        let bad = inner.select(Predicate::RegionOverlaps {
            column: ColumnTag::record("visit", "region"),
            region: geo::Polygon::new(geo::LineString::from(vec![(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]), vec![]),
        });
        assert!(render_sql(&bad).is_err());
    }
}
