/*!
 * Directional pipeline assembly and invocation.
 *
 * A pipeline is an ordered chain of bound operators assembled from
 * configuration. For training and inference the preprocess chain runs in
 * configuration order; for postprocess the constructed chain is reversed,
 * the start and build states are swapped (the forward pass's end state
 * becomes postprocess's starting assumption), and a separately configured
 * postprocess-only chain is appended in its original order.
 */

use log::debug;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use crate::config::{add_lang_info, OperatorConfig, RootConfig};
use crate::errors::{ConfigError, ProcessError};
use crate::operator::registry::{resolve_operators, OperatorContext, OperatorRegistry};
use crate::operator::{Operator, ProcessType};
use crate::shared::SharedMap;
use crate::unit::Batch;

/// Per-call runtime options, keyed by operator name
pub type OptionsMap = HashMap<String, Value>;

/// Construction-time side channel threaded through operator construction
/// within one pipeline build.
///
/// Later operators may read fields written by earlier ones in the same build
/// pass; the state is immutable once the pipeline is assembled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildState {
    /// Tokenizer mode selected for the source side, if any
    pub src_tokenizer: Option<String>,
    /// Tokenizer mode selected for the target side, if any
    pub tgt_tokenizer: Option<String>,
    /// Whether construction is running in the postprocess-only block
    pub postprocess_only: bool,
    /// Known source vocabulary path
    pub src_vocabulary: Option<String>,
    /// Known target vocabulary path
    pub tgt_vocabulary: Option<String>,
}

impl BuildState {
    /// Initial state from configuration-level hints
    pub fn from_config(config: &RootConfig) -> Self {
        Self {
            src_tokenizer: None,
            tgt_tokenizer: None,
            postprocess_only: false,
            src_vocabulary: config.vocabulary.path("source"),
            tgt_vocabulary: config.vocabulary.path("target"),
        }
    }
}

/// An assembled, directional, ordered chain of bound operators
pub struct Pipeline {
    ops: Vec<Box<dyn Operator>>,
    process_type: ProcessType,
    override_label: Option<BTreeSet<String>>,
    start_state: BuildState,
    build_state: BuildState,
}

impl Pipeline {
    /// Assembles a pipeline from configuration.
    ///
    /// `exit_step` truncates the preprocess chain after the given step
    /// (inclusive), used to build partial pipelines for staged
    /// vocabulary/subword extraction. `shared` carries per-operator-index
    /// shared resources fetched from the cache for the active label.
    pub fn new(
        registry: &OperatorRegistry,
        config: &RootConfig,
        process_type: ProcessType,
        exit_step: Option<usize>,
        override_label: Option<BTreeSet<String>>,
        shared: Option<&SharedMap>,
    ) -> Result<Self, ConfigError> {
        let mut start_state = BuildState::from_config(config);
        let mut build_state = start_state.clone();

        let mut ops = Vec::new();
        add_op_list(
            &mut ops,
            registry,
            &config.preprocess,
            config,
            process_type,
            exit_step,
            override_label.as_ref(),
            &mut build_state,
            shared,
        )?;

        if process_type.is_postprocess() {
            // The forward chain runs backwards, starting from the forward
            // pass's end state.
            ops.reverse();
            std::mem::swap(&mut start_state, &mut build_state);
            build_state.postprocess_only = true;

            add_op_list(
                &mut ops,
                registry,
                &config.postprocess,
                config,
                process_type,
                None,
                override_label.as_ref(),
                &mut build_state,
                None,
            )?;
        }

        let mut seen = HashSet::new();
        for op in &ops {
            if !seen.insert(op.name().to_string()) {
                return Err(ConfigError::DuplicateOperatorName(op.name().to_string()));
            }
        }

        Ok(Self {
            ops,
            process_type,
            override_label,
            start_state,
            build_state,
        })
    }

    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    /// Label this pipeline variant was built for
    pub fn override_label(&self) -> Option<&BTreeSet<String>> {
        self.override_label.as_ref()
    }

    /// State describing the pipeline's input, used by loaders to know the
    /// input tokenization
    pub fn start_state(&self) -> &BuildState {
        &self.start_state
    }

    /// State after the last constructed operator
    pub fn build_state(&self) -> &BuildState {
        &self.build_state
    }

    /// Bound operator names, in execution order
    pub fn operator_names(&self) -> Vec<&str> {
        self.ops.iter().map(|op| op.name()).collect()
    }

    /// Runs the batch through every bound operator in order, then finalizes
    /// each unit for the process type.
    ///
    /// Runtime options are rejected with an error if the addressed operator
    /// does not declare option support. For training, wall-clock time per
    /// operator accumulates into the batch ops profile.
    pub fn run(&self, mut batch: Batch, options: Option<&OptionsMap>) -> Result<Batch, ProcessError> {
        let profiling = self.process_type == ProcessType::Training;

        for op in &self.ops {
            let op_options = options.and_then(|all| all.get(op.name()));
            if op_options.is_some() && !op.accepts_options() {
                return Err(ProcessError::UnsupportedOptions(op.name().to_string()));
            }

            debug!("Applying operator {}", op.name());
            let start = profiling.then(Instant::now);
            batch = op.run(self.process_type, batch, op_options)?;
            if let Some(start) = start {
                *batch
                    .meta
                    .ops_profile
                    .entry(op.name().to_string())
                    .or_insert(0.0) += start.elapsed().as_secs_f64();
            }
        }

        for tu in &mut batch.units {
            tu.finalize(self.process_type);
        }
        Ok(batch)
    }
}

#[allow(clippy::too_many_arguments)]
fn add_op_list(
    ops: &mut Vec<Box<dyn Operator>>,
    registry: &OperatorRegistry,
    entries: &[OperatorConfig],
    config: &RootConfig,
    process_type: ProcessType,
    exit_step: Option<usize>,
    override_label: Option<&BTreeSet<String>>,
    build_state: &mut BuildState,
    shared: Option<&SharedMap>,
) -> Result<(), ConfigError> {
    for resolved in resolve_operators(
        registry,
        entries,
        process_type,
        override_label,
        exit_step,
        true,
    )? {
        let mut params = resolved.params.clone();
        add_lang_info(&mut params, config, "source");
        add_lang_info(&mut params, config, "target");

        let name = resolved.instance_name();
        debug!("Building operator {}", name);
        let ctx = OperatorContext {
            name,
            params,
            process_type,
            build_state,
            shared: shared.and_then(|map| map.get(&resolved.index)),
        };
        ops.push(resolved.factory.build(ctx)?);
    }
    Ok(())
}
