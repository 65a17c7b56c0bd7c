/*!
 * Operator contract and standard specializations.
 *
 * An operator is one configured transformation step of a pipeline. The trait
 * is explicit about capabilities: forward/reverse transforms, runtime option
 * support. Type-level capabilities (applicability per process type, shared
 * resource declarations) live on the factory in the registry, so they can be
 * consulted before any operator is constructed.
 *
 * Two standard specializations are provided: `FilterOp` (ordered predicate
 * list dropping units) and `MonolingualOp` (a per-side process applied across
 * every part of a multipart segment).
 */

use log::debug;
use serde_json::Value;
use std::fmt;

use crate::errors::ProcessError;
use crate::unit::{Batch, Part, TranslationUnit};

pub mod builtin;
pub mod registry;

/// Type of processing pipeline.
///
/// Governs pipeline direction and which operators participate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessType {
    /// Corpus preparation for training
    Training,
    /// Forward processing of inference input
    Inference,
    /// Reverse processing of translation output
    Postprocess,
}

impl ProcessType {
    pub fn is_postprocess(self) -> bool {
        self == ProcessType::Postprocess
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessType::Training => "training",
            ProcessType::Inference => "inference",
            ProcessType::Postprocess => "postprocess",
        };
        write!(f, "{}", name)
    }
}

/// A bound transformation step.
///
/// `run` dispatches to the forward transform for training/inference and to
/// the reverse transform for postprocess. The default reverse transform is a
/// programming error: an operator reachable in postprocess must either
/// override `reverse` or have its factory declare it inapplicable to
/// postprocess.
pub trait Operator: Send + Sync {
    /// Unique name of this operator instance within its pipeline
    fn name(&self) -> &str;

    /// Whether this operator accepts per-call runtime options
    fn accepts_options(&self) -> bool {
        false
    }

    /// Forward transform (training/inference)
    fn forward(&self, batch: Batch, options: Option<&Value>) -> Result<Batch, ProcessError>;

    /// Reverse transform (postprocess)
    fn reverse(&self, _batch: Batch, _options: Option<&Value>) -> Result<Batch, ProcessError> {
        Err(ProcessError::NoReverse(self.name().to_string()))
    }

    /// Apply the transform matching the process type
    fn run(
        &self,
        process_type: ProcessType,
        batch: Batch,
        options: Option<&Value>,
    ) -> Result<Batch, ProcessError> {
        if process_type.is_postprocess() {
            self.reverse(batch, options)
        } else {
            self.forward(batch, options)
        }
    }
}

/// Applies a per-unit forward action over a batch.
///
/// The action yields zero, one or several units, supporting both splitting
/// and dropping.
pub fn map_units<F>(mut batch: Batch, mut action: F) -> Result<Batch, ProcessError>
where
    F: FnMut(TranslationUnit, &mut crate::unit::BatchMeta) -> Result<Vec<TranslationUnit>, ProcessError>,
{
    let units = std::mem::take(&mut batch.units);
    let mut kept = Vec::with_capacity(units.len());
    for tu in units {
        kept.extend(action(tu, &mut batch.meta)?);
    }
    batch.units = kept;
    Ok(batch)
}

/// Applies a per-unit in-place action over a batch (one unit in, the same
/// unit out), the shape of reverse transforms.
pub fn map_units_in_place<F>(mut batch: Batch, mut action: F) -> Result<Batch, ProcessError>
where
    F: FnMut(&mut TranslationUnit) -> Result<(), ProcessError>,
{
    for tu in &mut batch.units {
        action(tu)?;
    }
    Ok(batch)
}

/// Boolean predicate over a translation unit; a matching predicate drops
/// the unit
pub type Predicate = Box<dyn Fn(&TranslationUnit) -> bool + Send + Sync>;

/// Training-only filter holding an ordered list of predicates.
///
/// A unit is dropped as soon as any predicate matches. The number of dropped
/// units is accumulated into the batch filter summary under this operator's
/// name; filtering a batch down to zero units is a normal outcome.
pub struct FilterOp {
    name: String,
    criteria: Vec<Predicate>,
}

impl FilterOp {
    pub fn new(name: String, criteria: Vec<Predicate>) -> Self {
        Self { name, criteria }
    }
}

impl Operator for FilterOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, batch: Batch, _options: Option<&Value>) -> Result<Batch, ProcessError> {
        let before = batch.units.len();
        let mut batch = map_units(batch, |tu, _meta| {
            if self.criteria.iter().any(|criterion| criterion(&tu)) {
                Ok(Vec::new())
            } else {
                Ok(vec![tu])
            }
        })?;
        let dropped = before - batch.units.len();
        *batch
            .meta
            .filter_summary
            .entry(self.name.clone())
            .or_insert(0) += dropped;
        if dropped > 0 {
            debug!("Filter {} dropped {} of {} units", self.name, dropped, before);
        }
        Ok(batch)
    }
}

/// A process applied independently to the parts of one side of a unit.
///
/// The implementation decides the granularity it works at by reading and
/// writing either the detokenized or the tokenized form of the part.
pub trait SideProcess: Send + Sync {
    fn apply(&self, part: &mut Part, options: Option<&Value>) -> Result<(), ProcessError>;
}

/// Monolingual side-processor: applies a configured sub-process to the
/// source and/or target side of each unit, across every part.
///
/// In a postprocess-only pipeline only the target side runs, so the reverse
/// transform is the identity unless the operator was built in postprocess-only
/// mode.
pub struct MonolingualOp<P> {
    name: String,
    source: Option<P>,
    target: Option<P>,
    postprocess_only: bool,
    accepts_options: bool,
}

impl<P: SideProcess> MonolingualOp<P> {
    pub fn new(name: String, source: Option<P>, target: Option<P>, postprocess_only: bool) -> Self {
        Self {
            name,
            source,
            target,
            postprocess_only,
            accepts_options: false,
        }
    }

    /// Declare runtime option support
    pub fn with_options(mut self, accepts: bool) -> Self {
        self.accepts_options = accepts;
        self
    }
}

impl<P: SideProcess> Operator for MonolingualOp<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn accepts_options(&self) -> bool {
        self.accepts_options
    }

    fn forward(&self, batch: Batch, options: Option<&Value>) -> Result<Batch, ProcessError> {
        map_units_in_place(batch, |tu| {
            if let Some(process) = &self.source {
                for part in tu.source.parts_mut() {
                    process.apply(part, options)?;
                }
            }
            if let Some(process) = &self.target {
                if let Some(target) = tu.target.as_mut() {
                    for part in target.parts_mut() {
                        process.apply(part, options)?;
                    }
                }
            }
            Ok(())
        })
    }

    fn reverse(&self, batch: Batch, options: Option<&Value>) -> Result<Batch, ProcessError> {
        if !self.postprocess_only {
            return Ok(batch);
        }
        map_units_in_place(batch, |tu| {
            if let Some(process) = &self.target {
                if let Some(target) = tu.target.as_mut() {
                    for part in target.parts_mut() {
                        process.apply(part, options)?;
                    }
                }
            }
            Ok(())
        })
    }
}
