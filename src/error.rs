//! Error types for butlerdb.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ButlerError>;

#[derive(Debug, Error)]
pub enum ButlerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Registry is closed")]
    RegistryClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid dimension configuration: {0}")]
    InvalidUniverse(String),

    #[error("Unknown dimension element '{0}'")]
    UnknownElement(String),

    #[error("Invalid data ID: {0}")]
    InvalidDataId(String),

    #[error("No {element} record for data ID {data_id}")]
    MissingDimensionRecord { element: String, data_id: String },

    #[error("Conflicting {element} record for data ID {data_id}")]
    ConflictingDimensionRecord { element: String, data_id: String },

    #[error("Invalid dataset type name '{0}'")]
    InvalidDatasetTypeName(String),

    #[error("Dataset type '{0}' is not registered")]
    MissingDatasetType(String),

    #[error("Dataset type '{name}' conflicts with an existing definition: {reason}")]
    ConflictingDatasetType { name: String, reason: String },

    #[error("Collection '{0}' does not exist")]
    MissingCollection(String),

    #[error("Collection '{name}' is a {actual} collection, expected {expected}")]
    CollectionTypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Chain '{parent}' would contain a cycle through '{child}'")]
    ChainCycle { parent: String, child: String },

    #[error("Collection '{name}' cannot be removed: {reason}")]
    CollectionInUse { name: String, reason: String },

    #[error("Dataset {0} does not exist")]
    MissingDataset(uuid::Uuid),

    #[error("No dataset found for {0}")]
    DatasetNotFound(String),

    #[error("Conflicting dataset: {0}")]
    ConflictingDataset(String),

    #[error("{0}")]
    Parse(#[from] crate::expr::ParseError),

    #[error("Invalid query expression: {0}")]
    Expression(String),

    #[error(
        "No value(s) for governor dimensions {governors:?} in expression that references dependent dimensions; \
         pass allow_orphans to suppress this check"
    )]
    MissingGovernor { governors: Vec<String> },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid time: {0}")]
    InvalidTime(String),

    #[error("Invalid timestamp")]
    InvalidTimestamp,

    #[error("Serialization error: {0}")]
    SerializationErrorWithContext(String),

    #[error("Invalid snapshot format")]
    InvalidFormat,

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("{0}")]
    Other(String),
}

impl ButlerError {
    pub(crate) fn expression(message: impl Into<String>) -> Self {
        ButlerError::Expression(message.into())
    }
}
