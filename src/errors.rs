/*!
 * Error types for the prepline engine.
 *
 * This module contains custom error types for the different stages of the
 * engine, using the thiserror crate for ergonomic error definitions.
 * Configuration errors are raised while assembling a pipeline, before any
 * batch is processed; process errors surface during a run.
 */

use thiserror::Error;

/// Errors raised while resolving configuration and assembling a pipeline
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read or parsed
    #[error("Failed to load configuration from '{path}': {message}")]
    ConfigFile {
        /// Path of the configuration file
        path: String,
        /// The underlying I/O or parse error, rendered
        message: String,
    },

    /// An operator entry has no `op` field
    #[error("Missing 'op' field in operator configuration: {0}")]
    MissingOperatorType(String),

    /// The `op` field names a type that is not registered
    #[error("Unknown operator '{0}'")]
    UnknownOperator(String),

    /// Two factories were registered under the same type name
    #[error("An operator with name '{0}' is already registered")]
    DuplicateRegistration(String),

    /// Two operators in one pipeline resolved to the same instance name
    #[error("Duplicate operator name '{0}' in pipeline")]
    DuplicateOperatorName(String),

    /// More than one active label matches the override map of one operator
    #[error("One corpus requires different overrides ({labels:?}) for the same operator ({operator})")]
    AmbiguousOverride {
        /// Operator type name
        operator: String,
        /// The labels that all matched an override key
        labels: Vec<String>,
    },

    /// A mandatory operator parameter is missing or has the wrong shape
    #[error("Invalid parameters for operator '{operator}': {message}")]
    InvalidParameters {
        /// Operator type name
        operator: String,
        /// What was wrong with the parameters
        message: String,
    },
}

/// Errors raised while running a pipeline or driving batches through it
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Error from pipeline assembly
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Runtime options were supplied to an operator that forbids them
    #[error("Operator {0} does not accept runtime options")]
    UnsupportedOptions(String),

    /// An operator without a reverse transform was reached in postprocess.
    /// The operator should have declared itself inapplicable to postprocess.
    #[error("Operator {0} has no reverse transform but was applied in postprocess")]
    NoReverse(String),

    /// An error inside a worker, annotated with the worker identity and,
    /// when known, the source name of the batch it was processing
    #[error("An error occurred {}in worker {worker}: {message}", .corpus.as_ref().map(|c| format!("when processing '{c}' ")).unwrap_or_default())]
    Worker {
        /// Name of the worker thread
        worker: String,
        /// Source/corpus name of the failing batch, if known
        corpus: Option<String>,
        /// The underlying error, rendered
        message: String,
    },

    /// Any other error
    #[error("Process error: {0}")]
    Other(String),
}

impl From<anyhow::Error> for ProcessError {
    fn from(error: anyhow::Error) -> Self {
        Self::Other(error.to_string())
    }
}
