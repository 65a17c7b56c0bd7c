/*!
 * Configuration model for the prepline engine.
 *
 * The engine is driven by a declarative configuration: two ordered operator
 * lists (`preprocess`, applied forward or reversed depending on the process
 * type, and `postprocess`, applied only in postprocess), the language pair,
 * and optional vocabulary hints. Operator-specific fields are kept as an
 * open JSON map; each operator deserializes its own typed parameter struct
 * from the resolved map.
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::errors::ConfigError;

/// Open parameter map handed to operators after resolution
pub type Params = serde_json::Map<String, Value>;

/// Top-level engine configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RootConfig {
    /// Source language code (ISO)
    #[serde(default)]
    pub source: String,

    /// Target language code (ISO)
    #[serde(default)]
    pub target: String,

    /// Ordered operator chain applied forward in training/inference and
    /// reversed in postprocess
    #[serde(default)]
    pub preprocess: Vec<OperatorConfig>,

    /// Ordered operator chain applied only in postprocess, after the
    /// reversed preprocess block, in original order
    #[serde(default)]
    pub postprocess: Vec<OperatorConfig>,

    /// Known vocabulary paths, exposed to operators through the build state
    #[serde(default)]
    pub vocabulary: VocabularyConfig,
}

impl RootConfig {
    /// Loads a configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let display = path.as_ref().display().to_string();
        let file = File::open(&path).map_err(|e| ConfigError::ConfigFile {
            path: display.clone(),
            message: e.to_string(),
        })?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| ConfigError::ConfigFile {
            path: display,
            message: e.to_string(),
        })
    }
}

/// Vocabulary hints for both sides of the language pair
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct VocabularyConfig {
    /// Source-side vocabulary
    #[serde(default)]
    pub source: Option<VocabularySide>,

    /// Target-side vocabulary
    #[serde(default)]
    pub target: Option<VocabularySide>,
}

/// Vocabulary description for one side
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct VocabularySide {
    /// Path to the vocabulary file
    #[serde(default)]
    pub path: Option<String>,
}

impl VocabularyConfig {
    /// Path of the given side, if configured
    pub fn path(&self, side: &str) -> Option<String> {
        let side = match side {
            "source" => self.source.as_ref(),
            "target" => self.target.as_ref(),
            _ => None,
        };
        side.and_then(|v| v.path.clone())
    }
}

/// One entry of a configured operator chain
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct OperatorConfig {
    /// Operator type name. Required; validated at resolution so that a
    /// missing field surfaces as a configuration error with context.
    #[serde(default)]
    pub op: Option<String>,

    /// Skip this entry when building a pipeline
    #[serde(default)]
    pub disabled: bool,

    /// Explicit operator instance name; defaults to `"{op}_{index}"`
    #[serde(default)]
    pub name: Option<String>,

    /// Per-label parameter overrides, deep-merged over the base parameters
    /// when exactly one active label matches a key
    #[serde(default)]
    pub overrides: Option<BTreeMap<String, Value>>,

    /// Operator-specific parameters
    #[serde(flatten)]
    pub params: Params,
}

impl OperatorConfig {
    /// Shorthand used by tests and config builders
    pub fn new(op: &str) -> Self {
        Self {
            op: Some(op.to_string()),
            ..Default::default()
        }
    }
}

/// Deep-merges `overlay` into `base`: the overlay wins on scalar and array
/// conflicts and the merge recurses into nested objects.
pub fn merge_params(base: &mut Params, overlay: &Params) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(base_map)), Value::Object(overlay_map)) => {
                merge_params(base_map, overlay_map);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Propagates the language code of one side into operator parameters.
///
/// When the parameters have a `source`/`target` sub-map, the code is written
/// as `lang` inside it; otherwise it is written as `source_lang`/`target_lang`
/// at the top level.
pub fn add_lang_info(params: &mut Params, config: &RootConfig, side: &str) {
    let lang = match side {
        "source" => config.source.clone(),
        _ => config.target.clone(),
    };
    match params.get_mut(side) {
        Some(Value::Object(side_params)) => {
            side_params.insert("lang".to_string(), Value::String(lang));
        }
        _ => {
            params.insert(format!("{}_lang", side), Value::String(lang));
        }
    }
}
