//! Lazily evaluated query results.
//!
//! Results hold the registry and the query arguments; every call that
//! produces rows plans and executes the query afresh, so `order_by` and
//! `limit` can be applied after the fact.

use super::builder::dataset_search_columns;
use super::{Query, QueryArgs, QueryBuilder, QuerySummary};
use crate::datasets::{DatasetRef, DatasetType};
use crate::dimensions::{DataCoordinate, DataIdValue, DimensionGroup, DimensionRecord, DimensionUniverse};
use crate::error::{ButlerError, Result};
use crate::registry::{Registry, RegistryInner};
use crate::relation::{ColumnTag, DatasetField, LeafRelation, RelationSource, Row, SqlQuery, Value};
use crate::time::AstroTime;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

fn key_columns(names: &[String]) -> Vec<ColumnTag> {
    names.iter().map(|d| ColumnTag::key(d.as_str())).collect()
}

pub(crate) fn row_values(row: &Row) -> BTreeMap<String, DataIdValue> {
    row.iter()
        .filter_map(|(column, value)| match column {
            ColumnTag::DimensionKey(d) => value.to_data_id_value().map(|v| (d.clone(), v)),
            _ => None,
        })
        .collect()
}

fn row_data_id(universe: &Arc<DimensionUniverse>, group: &DimensionGroup, row: &Row) -> Result<DataCoordinate> {
    let values = row_values(row)
        .into_iter()
        .filter(|(name, _)| group.contains(name));
    DataCoordinate::standardize(universe, values, Some(group))
}

pub(crate) fn row_dataset_id(row: &Row, dataset_type: &str) -> Result<Uuid> {
    match row.get(&ColumnTag::dataset(dataset_type, DatasetField::DatasetId)) {
        Some(Value::Uuid(id)) => Ok(*id),
        other => Err(ButlerError::InvalidQuery(format!(
            "row has no dataset ID for '{}' (found {:?})",
            dataset_type, other
        ))),
    }
}

/// Reasons a query returned no rows, derived from its leaves.
fn explain(inner: &RegistryInner, summary: &QuerySummary, query: &Query) -> Result<Vec<String>> {
    if !query.execute(inner)?.is_empty() {
        return Ok(Vec::new());
    }
    let mut messages = Vec::new();

    for (name, value) in &summary.where_clause.data_id {
        let is_governor = inner.universe.get(name).is_some_and(|e| e.is_governor());
        if is_governor && inner.record(name, std::slice::from_ref(value)).is_none() {
            messages.push(format!("No {} record for {}={}.", name, name, value));
        }
    }

    for leaf in query.leaves() {
        if !inner.leaf_rows(leaf)?.is_empty() {
            continue;
        }
        match leaf {
            LeafRelation::DimensionTable { element, .. } => {
                messages.push(format!("No dimension records for element '{}'.", element));
            }
            LeafRelation::DatasetSearch {
                dataset_type,
                collection,
                ..
            } => {
                messages.push(format!(
                    "No datasets of type '{}' in collection '{}'.",
                    dataset_type, collection
                ));
            }
        }
    }

    if messages.is_empty() {
        messages.push(format!(
            "No rows satisfy the query constraints: {}",
            summary.where_clause.predicate
        ));
    }
    Ok(messages)
}

/// Data IDs returned by [`Registry::query_data_ids`].
pub struct DataCoordinateQueryResults<'r> {
    registry: &'r Registry,
    dimensions: DimensionGroup,
    args: QueryArgs,
    expanded: bool,
}

impl<'r> DataCoordinateQueryResults<'r> {
    pub(crate) fn new(registry: &'r Registry, dimensions: DimensionGroup, args: QueryArgs) -> Self {
        Self {
            registry,
            dimensions,
            args,
            expanded: false,
        }
    }

    pub fn dimensions(&self) -> &DimensionGroup {
        &self.dimensions
    }

    pub fn summary(&self) -> Result<QuerySummary> {
        self.registry
            .inner
            .summarize(self.dimensions.clone(), &self.args, None)
    }

    pub fn query(&self) -> Result<Query> {
        let summary = self.summary()?;
        QueryBuilder::new(&summary).build(key_columns(self.dimensions.names()), self.args.placement)
    }

    pub fn sql(&self) -> Result<SqlQuery> {
        self.query()?.sql()
    }

    pub fn to_vec(&self) -> Result<Vec<DataCoordinate>> {
        let inner = &self.registry.inner;
        let rows = self.query()?.execute(inner)?;
        rows.iter()
            .map(|row| {
                let data_id = row_data_id(&inner.universe, &self.dimensions, row)?;
                if self.expanded {
                    inner.expand(&data_id)
                } else {
                    Ok(data_id)
                }
            })
            .collect()
    }

    pub fn iter(&self) -> Result<std::vec::IntoIter<DataCoordinate>> {
        Ok(self.to_vec()?.into_iter())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.query()?.execute(&self.registry.inner)?.len())
    }

    pub fn any(&self) -> Result<bool> {
        Ok(self.count()? > 0)
    }

    pub fn explain_no_results(&self) -> Result<Vec<String>> {
        let summary = self.summary()?;
        let query = QueryBuilder::new(&summary)
            .build(key_columns(self.dimensions.names()), self.args.placement)?;
        explain(&self.registry.inner, &summary, &query)
    }

    pub fn order_by<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = self.args.order_by(terms);
        self
    }

    pub fn limit(mut self, limit: usize, offset: Option<usize>) -> Self {
        self.args = self.args.limit(limit, offset);
        self
    }

    /// Attach implied values and dimension records to every data ID.
    pub fn expanded(mut self) -> Self {
        self.expanded = true;
        self
    }

    /// Datasets of `dataset_type` matching these data IDs.
    ///
    /// `collections` defaults to the collections of this query, and then to
    /// the configured defaults.
    pub fn find_datasets<S: AsRef<str>>(
        &self,
        dataset_type: &str,
        collections: Option<&[S]>,
        find_first: bool,
    ) -> Result<DatasetQueryResults<'r>> {
        let dataset_type = self.registry.inner.dataset_type(dataset_type)?;
        let mut args = self.args.clone().find_first(find_first);
        if let Some(collections) = collections {
            args = args.collections(collections.iter().map(|c| c.as_ref().to_string()));
        }
        args.order_by.clear();
        args.limit = None;
        args.offset = 0;
        Ok(DatasetQueryResults::new(
            self.registry,
            dataset_type,
            args,
            Some(self.dimensions.clone()),
        ))
    }
}

/// Dataset refs returned by [`Registry::query_datasets`].
pub struct DatasetQueryResults<'r> {
    registry: &'r Registry,
    dataset_type: DatasetType,
    args: QueryArgs,
    extra_dimensions: Option<DimensionGroup>,
}

impl<'r> DatasetQueryResults<'r> {
    pub(crate) fn new(
        registry: &'r Registry,
        dataset_type: DatasetType,
        args: QueryArgs,
        extra_dimensions: Option<DimensionGroup>,
    ) -> Self {
        Self {
            registry,
            dataset_type,
            args,
            extra_dimensions,
        }
    }

    pub fn dataset_type(&self) -> &DatasetType {
        &self.dataset_type
    }

    pub fn summary(&self) -> Result<QuerySummary> {
        let name = self.dataset_type.name();
        let mut requested = self.dataset_type.dimensions().clone();
        if let Some(extra) = &self.extra_dimensions {
            requested = requested.union(extra)?;
        }
        let mut args = self.args.clone();
        args.datasets.retain(|d| d != name);
        args.datasets.insert(0, name.to_string());

        let mut summary = self.registry.inner.summarize(requested, &args, None)?;
        summary.find_first = if args.find_first {
            vec![name.to_string()]
        } else {
            Vec::new()
        };
        Ok(summary)
    }

    fn output(&self) -> Vec<ColumnTag> {
        dataset_search_columns(&self.dataset_type)
            .into_iter()
            .filter(|c| !matches!(c, ColumnTag::Dataset { field: DatasetField::Rank, .. }))
            .collect()
    }

    pub fn query(&self) -> Result<Query> {
        let summary = self.summary()?;
        QueryBuilder::new(&summary).build(self.output(), self.args.placement)
    }

    pub fn sql(&self) -> Result<SqlQuery> {
        self.query()?.sql()
    }

    fn rows(&self) -> Result<Vec<Row>> {
        self.query()?.execute(&self.registry.inner)
    }

    pub fn to_vec(&self) -> Result<Vec<DatasetRef>> {
        let inner = &self.registry.inner;
        self.rows()?
            .iter()
            .map(|row| inner.dataset_ref(row_dataset_id(row, self.dataset_type.name())?))
            .collect()
    }

    pub fn iter(&self) -> Result<std::vec::IntoIter<DatasetRef>> {
        Ok(self.to_vec()?.into_iter())
    }

    /// Refs paired with the instant each dataset was registered.
    pub fn with_ingest_dates(&self) -> Result<Vec<(DatasetRef, AstroTime)>> {
        let inner = &self.registry.inner;
        let name = self.dataset_type.name();
        self.rows()?
            .iter()
            .map(|row| {
                let id = row_dataset_id(row, name)?;
                let ingest_date = match row.get(&ColumnTag::dataset(name, DatasetField::IngestDate)) {
                    Some(Value::Time(t)) => *t,
                    _ => inner.ingest_date(id)?,
                };
                Ok((inner.dataset_ref(id)?, ingest_date))
            })
            .collect()
    }

    /// Distinct data IDs of the matching datasets, in result order.
    pub fn data_ids(&self) -> Result<Vec<DataCoordinate>> {
        let mut seen = BTreeSet::new();
        Ok(self
            .to_vec()?
            .into_iter()
            .map(|r| r.data_id().clone())
            .filter(|d| seen.insert(d.clone()))
            .collect())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.rows()?.len())
    }

    pub fn any(&self) -> Result<bool> {
        Ok(self.count()? > 0)
    }

    pub fn explain_no_results(&self) -> Result<Vec<String>> {
        let summary = self.summary()?;
        let query = QueryBuilder::new(&summary).build(self.output(), self.args.placement)?;
        explain(&self.registry.inner, &summary, &query)
    }
}

/// Records returned by [`Registry::query_dimension_records`].
pub struct DimensionRecordQueryResults<'r> {
    registry: &'r Registry,
    element: String,
    args: QueryArgs,
}

impl<'r> DimensionRecordQueryResults<'r> {
    pub(crate) fn new(registry: &'r Registry, element: String, args: QueryArgs) -> Self {
        Self {
            registry,
            element,
            args,
        }
    }

    fn key_names(&self) -> Result<Vec<String>> {
        let element = self.registry.inner.universe.element(&self.element)?;
        Ok(element.key_dimensions().into_iter().map(str::to_string).collect())
    }

    pub fn summary(&self) -> Result<QuerySummary> {
        let inner = &self.registry.inner;
        let group = DimensionGroup::new(&inner.universe, self.key_names()?)?;
        let mut summary = inner.summarize(group, &self.args, Some(&self.element))?;
        summary.where_clause.elements.insert(self.element.clone());
        Ok(summary)
    }

    pub fn query(&self) -> Result<Query> {
        let summary = self.summary()?;
        QueryBuilder::new(&summary).build(key_columns(&self.key_names()?), self.args.placement)
    }

    pub fn to_vec(&self) -> Result<Vec<DimensionRecord>> {
        let inner = &self.registry.inner;
        let rows = self.query()?.execute(inner)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let key = inner.key_tuple(&self.element, &row_values(row))?;
            let record = inner.record(&self.element, &key).ok_or_else(|| {
                ButlerError::MissingDimensionRecord {
                    element: self.element.clone(),
                    data_id: format!("{:?}", key),
                }
            })?;
            records.push(record.clone());
        }
        Ok(records)
    }

    pub fn iter(&self) -> Result<std::vec::IntoIter<DimensionRecord>> {
        Ok(self.to_vec()?.into_iter())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.query()?.execute(&self.registry.inner)?.len())
    }

    pub fn any(&self) -> Result<bool> {
        Ok(self.count()? > 0)
    }

    pub fn order_by<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = self.args.order_by(terms);
        self
    }

    pub fn limit(mut self, limit: usize, offset: Option<usize>) -> Self {
        self.args = self.args.limit(limit, offset);
        self
    }
}
