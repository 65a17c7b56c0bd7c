/*!
 * Operator registry and configuration resolver.
 *
 * The registry is an explicit factory map built from a fixed list of
 * built-in implementations supplied at startup; nothing is registered as an
 * import-time side effect. Factories carry the type-level capabilities
 * (applicability per process type, shared resource declarations) consulted
 * during resolution, before any operator is constructed.
 */

use log::debug;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::config::{merge_params, OperatorConfig, Params};
use crate::errors::ConfigError;
use crate::operator::{builtin, Operator, ProcessType};
use crate::pipeline::BuildState;
use crate::shared::{SharedBuilderSpec, SharedResource};

/// Everything a factory needs to construct one bound operator
pub struct OperatorContext<'a> {
    /// Operator instance name, unique within the pipeline
    pub name: String,
    /// Fully resolved parameters (overrides merged, languages injected)
    pub params: Params,
    /// Process type of the pipeline under construction
    pub process_type: ProcessType,
    /// Cross-operator construction state; earlier operators of the same
    /// build pass may have written fields this operator reads
    pub build_state: &'a mut BuildState,
    /// Shared resources built for this operator's index, keyed by builder name
    pub shared: Option<&'a HashMap<String, Arc<dyn SharedResource>>>,
}

/// Builds operators of one registered type and declares their type-level
/// capabilities
pub trait OperatorFactory: Send + Sync {
    /// Whether operators of this type participate in the given process type
    fn applies_to(&self, _process_type: ProcessType) -> bool {
        true
    }

    /// Shared-resource builder specs for the given resolved parameters
    fn shared_builders(
        &self,
        _params: &Params,
        _process_type: ProcessType,
    ) -> Vec<SharedBuilderSpec> {
        Vec::new()
    }

    /// Construct a bound operator
    fn build(&self, ctx: OperatorContext<'_>) -> Result<Box<dyn Operator>, ConfigError>;
}

/// Explicit map from operator type name to factory
pub struct OperatorRegistry {
    factories: HashMap<String, Arc<dyn OperatorFactory>>,
}

impl OperatorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding the fixed built-in operator set
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Bind a type name to a factory; registering an already-used name is
    /// an error
    pub fn register(
        &mut self,
        name: &str,
        factory: Arc<dyn OperatorFactory>,
    ) -> Result<(), ConfigError> {
        if self.factories.contains_key(name) {
            return Err(ConfigError::DuplicateRegistration(name.to_string()));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn OperatorFactory>> {
        self.factories.get(name)
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// One configuration entry resolved against a registry: the factory plus the
/// merged parameters, ready for construction
pub struct ResolvedOperator {
    /// Position in the configured chain
    pub index: usize,
    /// Operator type name
    pub op_type: String,
    /// Explicit instance name from the configuration, if any
    pub name: Option<String>,
    /// Parameters after override merging
    pub params: Params,
    /// Factory that constructs this operator
    pub factory: Arc<dyn OperatorFactory>,
}

impl ResolvedOperator {
    /// Instance name: explicit, or `"{op}_{index}"`
    pub fn instance_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.op_type, self.index))
    }
}

/// Resolves an ordered operator chain for one process type.
///
/// Honors an inclusive exit step, skips operator types that do not apply to
/// the process type, optionally skips disabled entries, and performs
/// per-label override merging: exactly one matching label deep-merges its
/// override over the base parameters, more than one match is an ambiguity
/// error, zero matches leaves the parameters unchanged.
pub fn resolve_operators(
    registry: &OperatorRegistry,
    entries: &[OperatorConfig],
    process_type: ProcessType,
    override_label: Option<&BTreeSet<String>>,
    exit_step: Option<usize>,
    ignore_disabled: bool,
) -> Result<Vec<ResolvedOperator>, ConfigError> {
    let mut resolved = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if let Some(exit) = exit_step {
            if index > exit {
                break;
            }
        }
        let op_type = entry.op.clone().ok_or_else(|| {
            ConfigError::MissingOperatorType(
                serde_json::to_string(entry).unwrap_or_else(|_| format!("entry {}", index)),
            )
        })?;
        let factory = registry
            .get(&op_type)
            .ok_or_else(|| ConfigError::UnknownOperator(op_type.clone()))?
            .clone();
        if !factory.applies_to(process_type) {
            debug!(
                "Skipping operator {} at step {}: not applied for {}",
                op_type, index, process_type
            );
            continue;
        }
        let mut params = resolve_params(entry, &op_type, override_label)?;
        // Routing fields may arrive through a label override, in which case
        // the merged value wins over the entry-level one.
        let disabled = match params.remove("disabled") {
            Some(Value::Bool(flag)) => flag,
            _ => entry.disabled,
        };
        let name = match params.remove("name") {
            Some(Value::String(name)) => Some(name),
            _ => entry.name.clone(),
        };
        if ignore_disabled && disabled {
            continue;
        }
        resolved.push(ResolvedOperator {
            index,
            op_type,
            name,
            params,
            factory,
        });
    }
    Ok(resolved)
}

fn resolve_params(
    entry: &OperatorConfig,
    op_type: &str,
    override_label: Option<&BTreeSet<String>>,
) -> Result<Params, ConfigError> {
    let mut params = entry.params.clone();
    let (Some(labels), Some(overrides)) = (override_label, entry.overrides.as_ref()) else {
        return Ok(params);
    };
    let matching: Vec<String> = labels
        .iter()
        .filter(|label| overrides.contains_key(*label))
        .cloned()
        .collect();
    if matching.len() > 1 {
        return Err(ConfigError::AmbiguousOverride {
            operator: op_type.to_string(),
            labels: matching,
        });
    }
    if let Some(label) = matching.first() {
        match overrides.get(label) {
            Some(Value::Object(overlay)) => merge_params(&mut params, overlay),
            _ => {
                return Err(ConfigError::InvalidParameters {
                    operator: op_type.to_string(),
                    message: format!("override for label '{}' must be a mapping", label),
                });
            }
        }
    }
    Ok(params)
}
