//! Error types for the exporter
//!
//! Startup problems are [`ConfigError`]s and abort the process. Everything
//! that can go wrong while a document is being collected is a
//! [`CollectError`], which is logged and only marks that document as failed.

use thiserror::Error;

/// Result type alias for startup operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Fatal errors raised while loading configuration and building collectors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("unable to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid YAML or has the wrong shape
    #[error("unable to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Expression failed to parse or compile
    #[error("unable to compile expression `{code}`: {reason}")]
    Expression { code: String, reason: String },

    /// Two metrics share a fully qualified name
    #[error("metrics name must be unique, duplicate found collector:{collector} namespace:{namespace} metric:{metric}")]
    DuplicateMetric {
        collector: String,
        namespace: String,
        metric: String,
    },

    /// Webhook definition is not usable
    #[error("invalid webhook {webhook}: {reason}")]
    Webhook { webhook: String, reason: String },

    /// Webhook binds to a collector that does not exist
    #[error("webhook {webhook} references unknown collector {collector}")]
    UnknownCollector { webhook: String, collector: String },

    /// Metric vector could not be created or registered
    #[error("unable to register metric {name}: {source}")]
    Registration {
        name: String,
        #[source]
        source: prometheus::Error,
    },
}

/// Outcome of a single expression evaluation step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The expression tried to iterate over null: the selected field is
    /// absent from the document.
    #[error("attempted to iterate over a null value")]
    NullIteration,

    /// Evaluation ran past its deadline
    #[error("evaluation deadline exceeded")]
    Timeout,

    /// Any other evaluation failure reported by the engine
    #[error("{0}")]
    Failed(String),
}

/// Filter, label or value expression failed for a candidate record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("unable to get filter value err:{0}")]
    Filter(#[source] EvalError),

    #[error("unable to get label value label:{label} err:{source}")]
    Label {
        label: String,
        #[source]
        source: EvalError,
    },

    #[error("unable to get value err:{0}")]
    Value(#[source] EvalError),
}

/// Extracted value cannot become a metric observation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    /// String that is neither a number, a boolean nor `<nil>`
    #[error("{0}")]
    Unparsable(String),

    /// Arrays and objects have no numeric meaning
    #[error("unknown value {value} type '{kind}'")]
    UnsupportedType { value: String, kind: &'static str },

    /// Counters only move forward
    #[error("counter cannot decrease in value, got {0}")]
    CounterDecrease(f64),
}

/// Per-document collection failure for one metric
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollectError {
    #[error("unable to get json objects err:{0}")]
    Path(#[source] EvalError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("unable to sanitize value err:{0}")]
    Value(#[from] ValueError),

    #[error("unable to update metric err:{0}")]
    Update(String),
}

/// Document could not be handed to a collector
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The collector's dispatch loop is no longer accepting documents
    #[error("collector {0} is not accepting documents")]
    Stopped(String),
}
