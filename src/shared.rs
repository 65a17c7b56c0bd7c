/*!
 * Shared resource cache.
 *
 * Some operators need expensive objects (large tables, loaded models) that
 * should be built once per distinct configuration variant rather than once
 * per worker. The cache is two-level: the outer key is the canonicalized
 * override label (with the no-label default computed eagerly at
 * construction), the inner key combines operator index, resource class
 * identity and constructor arguments. Workers receive `Arc` handles to the
 * same instances; a resource that mutates state guards it internally.
 */

use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::RootConfig;
use crate::errors::ConfigError;
use crate::operator::registry::{resolve_operators, OperatorRegistry};
use crate::operator::ProcessType;

/// A heavyweight object shared between pipeline variants and workers
pub trait SharedResource: Send + Sync {
    /// Downcast support for operators retrieving their concrete resource
    fn as_any(&self) -> &dyn Any;
}

/// How to build one shared resource: class identity plus constructor
/// arguments, declared by an operator factory
pub struct SharedBuilderSpec {
    /// Name under which the operator retrieves the instance
    pub name: String,
    /// Resource class identity
    pub class: &'static str,
    /// Constructor arguments, part of the cache key
    pub args: Vec<Value>,
    /// Constructor
    pub build: fn(&[Value]) -> Result<Arc<dyn SharedResource>, ConfigError>,
}

impl SharedBuilderSpec {
    fn key(&self) -> String {
        format!(
            "{}_{}",
            self.class,
            serde_json::to_string(&self.args).unwrap_or_default()
        )
    }
}

/// Shared instances for one label: operator index -> builder name -> instance
pub type SharedMap = HashMap<usize, HashMap<String, Arc<dyn SharedResource>>>;

/// Immutable snapshot of the shared map for one label
pub type SharedSnapshot = Arc<SharedMap>;

/// Builds and caches shared resources, keyed by override label and
/// (operator index, class, constructor arguments)
pub struct SharedResourceCache {
    registry: Arc<OperatorRegistry>,
    config: Arc<RootConfig>,
    process_type: ProcessType,
    exit_step: Option<usize>,
    // Instances already built, per operator index; reused across labels
    // whose operators construct with the same arguments.
    built: Mutex<HashMap<usize, HashMap<String, Arc<dyn SharedResource>>>>,
    snapshots: RwLock<HashMap<String, SharedSnapshot>>,
    default_snapshot: SharedSnapshot,
}

impl SharedResourceCache {
    /// Creates the cache and eagerly computes the default (no label)
    /// snapshot so the steady-state path never pays a first-call cost.
    pub fn new(
        registry: Arc<OperatorRegistry>,
        config: Arc<RootConfig>,
        process_type: ProcessType,
        exit_step: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let mut cache = Self {
            registry,
            config,
            process_type,
            exit_step,
            built: Mutex::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            default_snapshot: Arc::new(HashMap::new()),
        };
        cache.default_snapshot = cache.get(None)?;
        Ok(cache)
    }

    /// The eagerly cached no-label snapshot, also returned for label shapes
    /// that select no override (e.g. mappings)
    pub fn default_snapshot(&self) -> SharedSnapshot {
        self.default_snapshot.clone()
    }

    /// Returns the shared snapshot for this label, building any missing
    /// instance. Two calls with the same label return identical instances.
    pub fn get(&self, label: Option<&BTreeSet<String>>) -> Result<SharedSnapshot, ConfigError> {
        let key = canonical_label(label);
        if let Some(snapshot) = self.snapshots.read().get(&key) {
            debug!("Shared state cache hit for label {}", key);
            return Ok(snapshot.clone());
        }

        let resolved = resolve_operators(
            &self.registry,
            &self.config.preprocess,
            self.process_type,
            label,
            self.exit_step,
            true,
        )?;

        let mut snapshot: SharedMap = HashMap::new();
        let mut built = self.built.lock();
        for operator in resolved {
            let builders = operator
                .factory
                .shared_builders(&operator.params, self.process_type);
            if builders.is_empty() {
                continue;
            }
            let existing = built.entry(operator.index).or_default();
            let mut by_name = HashMap::new();
            for spec in builders {
                let build_key = spec.key();
                let instance = match existing.get(&build_key) {
                    Some(instance) => instance.clone(),
                    None => {
                        info!(
                            "Building {}({})",
                            spec.class,
                            spec.args
                                .iter()
                                .map(|a| a.to_string())
                                .collect::<Vec<_>>()
                                .join(", ")
                        );
                        let instance = (spec.build)(&spec.args)?;
                        existing.insert(build_key, instance.clone());
                        instance
                    }
                };
                by_name.insert(spec.name, instance);
            }
            snapshot.insert(operator.index, by_name);
        }

        let snapshot = Arc::new(snapshot);
        self.snapshots.write().insert(key, snapshot.clone());
        Ok(snapshot)
    }
}

fn canonical_label(label: Option<&BTreeSet<String>>) -> String {
    match label {
        None => "<default>".to_string(),
        Some(set) => set.iter().cloned().collect::<Vec<_>>().join(","),
    }
}
