/*!
 * Common test utilities for the prepline test suite.
 */

use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use prepline::config::RootConfig;
use prepline::errors::{ConfigError, ProcessError};
use prepline::operator::registry::{OperatorContext, OperatorFactory, OperatorRegistry};
use prepline::operator::Operator;
use prepline::unit::{Batch, BatchMeta, TranslationUnit};

/// A small but realistic preprocessing configuration.
pub fn base_config() -> RootConfig {
    serde_json::from_value(json!({
        "source": "en",
        "target": "fr",
        "preprocess": [
            {"op": "case_normalization", "source": {"mode": "lower"}, "target": {"mode": "lower"}},
            {"op": "tokenization", "source": {"mode": "space"}, "target": {"mode": "space"}},
            {"op": "length_filter", "source": {"max_words": 50}}
        ]
    }))
    .expect("valid test configuration")
}

/// Registry with the built-in operators plus the test-only ones.
pub fn test_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::with_builtins();
    registry
        .register("jitter", Arc::new(JitterFactory))
        .expect("jitter not registered twice");
    registry
        .register("fail_marker", Arc::new(FailMarkerFactory))
        .expect("fail_marker not registered twice");
    registry
}

/// Batch of simple numbered sentence pairs, tagged with a sequence id.
pub fn numbered_batch(seq: usize, units: usize) -> Batch {
    let units = (0..units)
        .map(|i| {
            TranslationUnit::from_pair(
                &format!("source sentence {} {}", seq, i),
                &format!("phrase cible {} {}", seq, i),
            )
        })
        .collect();
    let mut meta = BatchMeta::default();
    meta.extra.insert("seq".to_string(), json!(seq));
    meta.base_name = Some(format!("corpus-{}", seq));
    Batch::with_meta(units, meta)
}

/// Sequence id stashed in the batch metadata by `numbered_batch`.
pub fn seq_of(meta: &BatchMeta) -> usize {
    meta.extra
        .get("seq")
        .and_then(|v| v.as_u64())
        .expect("batch carries a seq id") as usize
}

/// Operator sleeping a few random milliseconds, so parallel workers finish
/// out of submission order.
pub struct JitterFactory;

struct JitterOp {
    name: String,
    max_millis: u64,
}

impl OperatorFactory for JitterFactory {
    fn build(&self, ctx: OperatorContext<'_>) -> Result<Box<dyn Operator>, ConfigError> {
        let max_millis = ctx
            .params
            .get("max_millis")
            .and_then(|v| v.as_u64())
            .unwrap_or(15);
        Ok(Box::new(JitterOp {
            name: ctx.name,
            max_millis,
        }))
    }
}

impl Operator for JitterOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, batch: Batch, _options: Option<&Value>) -> Result<Batch, ProcessError> {
        let millis = rand::rng().random_range(1..=self.max_millis);
        thread::sleep(Duration::from_millis(millis));
        Ok(batch)
    }
}

/// Operator failing on any unit whose source text contains `BOOM`.
pub struct FailMarkerFactory;

struct FailMarkerOp {
    name: String,
}

impl OperatorFactory for FailMarkerFactory {
    fn build(&self, ctx: OperatorContext<'_>) -> Result<Box<dyn Operator>, ConfigError> {
        Ok(Box::new(FailMarkerOp { name: ctx.name }))
    }
}

impl Operator for FailMarkerOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, batch: Batch, _options: Option<&Value>) -> Result<Batch, ProcessError> {
        for tu in &batch.units {
            if tu.source.detok().contains("BOOM") {
                return Err(ProcessError::Other("poisoned unit".to_string()));
            }
        }
        Ok(batch)
    }
}
