//! Embedded registry for astronomical datasets, with a dimension data model,
//! collections, a query language planned into SQL-renderable relations, a
//! file datastore and quantum graph generation.
//!
//! ```rust
//! use butlerdb::{DimensionRecord, QueryArgs, Registry};
//!
//! let mut registry = Registry::memory()?;
//! let universe = registry.universe().clone();
//! registry.insert_dimension_records(vec![
//!     DimensionRecord::builder("instrument").key("instrument", "HSC").build(&universe)?,
//! ])?;
//!
//! let instruments = registry
//!     .query_data_ids(&["instrument"], QueryArgs::new().where_clause("instrument = 'HSC'"))?
//!     .count()?;
//! assert_eq!(instruments, 1);
//! # Ok::<(), butlerdb::ButlerError>(())
//! ```

pub mod builder;
pub mod butler;
pub mod collections;
pub mod config;
pub mod datasets;
pub mod datastore;
pub mod dimensions;
pub mod error;
pub mod expr;
pub mod graph;
pub mod logging;
pub mod query;
pub mod registry;
pub mod relation;
pub mod storage;
pub mod time;

pub use builder::RegistryBuilder;
pub use butler::Butler;
pub use error::{ButlerError, Result};
pub use registry::{Registry, RegistryStats};

#[cfg(feature = "sync")]
pub use registry::SyncRegistry;

pub use config::Config;

pub use collections::CollectionType;

pub use datasets::{DatasetIdGen, DatasetRef, DatasetType, RefContainer, StorageClass};

pub use dimensions::{
    DataCoordinate, DataIdValue, DimensionConfig, DimensionGroup, DimensionRecord,
    DimensionUniverse, FieldValue,
};

pub use time::{AstroTime, TimeScale, Timespan};

pub use query::{
    DataCoordinateQueryResults, DatasetQueryResults, DimensionRecordQueryResults, Placement,
    Query, QueryArgs,
};

pub use datastore::{ArtifactIndex, FileDatastore, JsonFormatter, TransferMode};

pub use logging::{CaptureLogger, CapturedRecord, LogRecords, Mdc};

pub use graph::{Connection, GraphBuilder, Pipeline, Quantum, QuantumGraph, TaskDef};

pub use geo::Polygon;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common imports
pub mod prelude {

    pub use crate::{Butler, ButlerError, Registry, RegistryBuilder, Result};

    pub use crate::{Config, QueryArgs};

    pub use crate::{CollectionType, DatasetRef, DatasetType};

    pub use crate::{DataCoordinate, DataIdValue, DimensionGroup, DimensionRecord};

    pub use crate::{AstroTime, Timespan};

    pub use crate::{GraphBuilder, Pipeline, TaskDef};

    #[cfg(feature = "sync")]
    pub use crate::SyncRegistry;
}
