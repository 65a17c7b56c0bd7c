/*!
 * # prepline - operator pipelines for parallel-corpus preparation
 *
 * A Rust library for preparing parallel-text corpora for machine-translation
 * training and serving: each example runs through a configurable, ordered
 * chain of text-transformation operators, inline or across a fixed pool of
 * workers with ordered, backpressured delivery.
 *
 * ## Features
 *
 * - Dynamic composition of heterogeneous operators from configuration,
 *   with per-corpus parameter overrides
 * - Directional pipelines: forward for training/inference, reversed for
 *   postprocessing, with swapped start/end state
 * - Parallel batch processing that preserves loader order and bounds
 *   queue growth
 * - A cross-worker cache for heavyweight shared resources
 *
 * ## Architecture
 *
 * The library is organized in these main modules:
 * - `config`: Configuration model and parameter merging
 * - `unit`: Translation units, batches and export forms
 * - `operator`: Operator contract, registry/resolver and built-ins
 * - `pipeline`: Directional pipeline assembly and invocation
 * - `shared`: Shared resource cache
 * - `processor`: Batch orchestration, inline or across a worker pool
 * - `errors`: Custom error types for the engine
 *
 * ## License
 *
 * This project is licensed under the MIT License
 */

// Global lints configuration
#![allow(clippy::uninlined_format_args)]

// Public modules
pub mod config;
pub mod errors;
pub mod operator;
pub mod pipeline;
pub mod processor;
pub mod shared;
pub mod unit;

// Re-export main types for easier usage
pub use config::{OperatorConfig, RootConfig};
pub use errors::{ConfigError, ProcessError};
pub use operator::registry::{OperatorFactory, OperatorRegistry};
pub use operator::{Operator, ProcessType};
pub use pipeline::{BuildState, OptionsMap, Pipeline};
pub use processor::{BatchConsumer, BatchLoader, BatchProcessor};
pub use shared::{SharedResource, SharedResourceCache};
pub use unit::{Batch, BatchMeta, ProcessedBatch, TranslationUnit, UnitExport};
