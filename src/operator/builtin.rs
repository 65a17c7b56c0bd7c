/*!
 * Built-in operators.
 *
 * A deliberately small set covering every engine seam: `tokenization`
 * (reversible, writes the build state read by later steps), `length_filter`
 * (training-only filter), `case_normalization` (monolingual side-processor
 * with runtime option support) and `alignment` (declares a shared resource).
 * Production deployments register heavier implementations next to these.
 */

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::Params;
use crate::errors::{ConfigError, ProcessError};
use crate::operator::registry::{OperatorContext, OperatorFactory, OperatorRegistry};
use crate::operator::{
    map_units_in_place, FilterOp, MonolingualOp, Operator, Predicate, ProcessType, SideProcess,
};
use crate::shared::{SharedBuilderSpec, SharedResource};
use crate::unit::{Batch, Part, TranslationUnit};

/// Registers the fixed built-in operator set.
pub fn register_builtins(registry: &mut OperatorRegistry) {
    let factories: [(&str, Arc<dyn OperatorFactory>); 4] = [
        ("tokenization", Arc::new(TokenizationFactory)),
        ("length_filter", Arc::new(LengthFilterFactory)),
        ("case_normalization", Arc::new(CaseNormalizationFactory)),
        ("alignment", Arc::new(AlignmentFactory)),
    ];
    for (name, factory) in factories {
        registry
            .register(name, factory)
            .expect("built-in operator names are unique");
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(
    operator: &str,
    params: &Params,
) -> Result<T, ConfigError> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| {
        ConfigError::InvalidParameters {
            operator: operator.to_string(),
            message: e.to_string(),
        }
    })
}

// ---------------------------------------------------------------------------
// tokenization

#[derive(Debug, Deserialize, Default)]
struct TokenizationParams {
    #[serde(default)]
    source: TokenizationSide,
    #[serde(default)]
    target: TokenizationSide,
}

#[derive(Debug, Deserialize)]
struct TokenizationSide {
    #[serde(default = "TokenizationSide::default_mode")]
    mode: String,
}

impl TokenizationSide {
    fn default_mode() -> String {
        "space".to_string()
    }
}

impl Default for TokenizationSide {
    fn default() -> Self {
        Self {
            mode: Self::default_mode(),
        }
    }
}

static AGGRESSIVE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\w+|[^\w\s]").expect("valid token pattern"));
static SPACE_BEFORE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+([^\w\s])").expect("valid punctuation pattern"));

fn tokenize(text: &str, mode: &str) -> Vec<String> {
    match mode {
        "aggressive" => AGGRESSIVE_TOKEN
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect(),
        _ => text.split_whitespace().map(|t| t.to_string()).collect(),
    }
}

fn detokenize(tokens: &[String], mode: &str) -> String {
    let joined = tokens.join(" ");
    match mode {
        "aggressive" => SPACE_BEFORE_PUNCT.replace_all(&joined, "$1").into_owned(),
        _ => joined,
    }
}

struct TokenizationFactory;

impl OperatorFactory for TokenizationFactory {
    fn build(&self, ctx: OperatorContext<'_>) -> Result<Box<dyn Operator>, ConfigError> {
        let params: TokenizationParams = parse_params("tokenization", &ctx.params)?;
        // Later operators and loaders read the selected modes from the
        // build state.
        ctx.build_state.src_tokenizer = Some(params.source.mode.clone());
        ctx.build_state.tgt_tokenizer = Some(params.target.mode.clone());
        Ok(Box::new(TokenizationOp {
            name: ctx.name,
            src_mode: params.source.mode,
            tgt_mode: params.target.mode,
        }))
    }
}

struct TokenizationOp {
    name: String,
    src_mode: String,
    tgt_mode: String,
}

impl Operator for TokenizationOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, batch: Batch, _options: Option<&Value>) -> Result<Batch, ProcessError> {
        map_units_in_place(batch, |tu| {
            for part in tu.source.parts_mut() {
                part.set_tokens(tokenize(&part.detok(), &self.src_mode));
            }
            if let Some(target) = tu.target.as_mut() {
                for part in target.parts_mut() {
                    part.set_tokens(tokenize(&part.detok(), &self.tgt_mode));
                }
            }
            Ok(())
        })
    }

    fn reverse(&self, batch: Batch, _options: Option<&Value>) -> Result<Batch, ProcessError> {
        map_units_in_place(batch, |tu| {
            for part in tu.source.parts_mut() {
                part.set_detok(detokenize(&part.tokens(), &self.src_mode));
            }
            if let Some(target) = tu.target.as_mut() {
                for part in target.parts_mut() {
                    part.set_detok(detokenize(&part.tokens(), &self.tgt_mode));
                }
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// length_filter

#[derive(Debug, Deserialize, Default)]
struct LengthFilterParams {
    #[serde(default)]
    source: LengthFilterSide,
    #[serde(default)]
    target: LengthFilterSide,
    /// Maximum allowed ratio between source and target word counts,
    /// whichever side is longer
    #[serde(default)]
    max_length_ratio: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct LengthFilterSide {
    #[serde(default)]
    min_words: Option<usize>,
    #[serde(default)]
    max_words: Option<usize>,
}

fn word_count(tu: &TranslationUnit, target: bool) -> usize {
    if target {
        tu.target
            .as_ref()
            .map(|side| side.token_parts().iter().map(|p| p.len()).sum())
            .unwrap_or(0)
    } else {
        tu.source.token_parts().iter().map(|p| p.len()).sum()
    }
}

fn side_criteria(side: LengthFilterSide, target: bool, criteria: &mut Vec<Predicate>) {
    if let Some(min) = side.min_words {
        criteria.push(Box::new(move |tu| word_count(tu, target) < min));
    }
    if let Some(max) = side.max_words {
        criteria.push(Box::new(move |tu| word_count(tu, target) > max));
    }
}

struct LengthFilterFactory;

impl OperatorFactory for LengthFilterFactory {
    fn applies_to(&self, process_type: ProcessType) -> bool {
        process_type == ProcessType::Training
    }

    fn build(&self, ctx: OperatorContext<'_>) -> Result<Box<dyn Operator>, ConfigError> {
        let params: LengthFilterParams = parse_params("length_filter", &ctx.params)?;
        let mut criteria: Vec<Predicate> = Vec::new();
        side_criteria(params.source, false, &mut criteria);
        side_criteria(params.target, true, &mut criteria);
        if let Some(ratio) = params.max_length_ratio {
            criteria.push(Box::new(move |tu| {
                let src = word_count(tu, false) as f64;
                let tgt = word_count(tu, true) as f64;
                if src == 0.0 || tgt == 0.0 {
                    return true;
                }
                (src / tgt).max(tgt / src) > ratio
            }));
        }
        Ok(Box::new(FilterOp::new(ctx.name, criteria)))
    }
}

// ---------------------------------------------------------------------------
// case_normalization

#[derive(Debug, Deserialize, Default)]
struct CaseParams {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    source: Option<CaseSide>,
    #[serde(default)]
    target: Option<CaseSide>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct CaseSide {
    #[serde(default)]
    mode: Option<String>,
}

struct CaseProcess {
    /// `None` means the side is not configured; it only acts when a per-call
    /// option payload supplies a mode.
    mode: Option<String>,
}

impl CaseProcess {
    fn configured(side: CaseSide, fallback: Option<&str>) -> Self {
        Self {
            mode: Some(
                side.mode
                    .or_else(|| fallback.map(|m| m.to_string()))
                    .unwrap_or_else(|| "lower".to_string()),
            ),
        }
    }

    fn unconfigured() -> Self {
        Self { mode: None }
    }
}

impl SideProcess for CaseProcess {
    fn apply(&self, part: &mut Part, options: Option<&Value>) -> Result<(), ProcessError> {
        // A per-call option payload overrides the configured mode.
        let mode = options
            .and_then(|o| o.get("mode"))
            .and_then(|m| m.as_str())
            .or(self.mode.as_deref());
        let Some(mode) = mode else {
            return Ok(());
        };
        let text = part.detok();
        let normalized = match mode {
            "upper" => text.to_uppercase(),
            "lower" => text.to_lowercase(),
            _ => return Ok(()),
        };
        part.set_detok(normalized);
        Ok(())
    }
}

struct CaseNormalizationFactory;

impl OperatorFactory for CaseNormalizationFactory {
    fn build(&self, ctx: OperatorContext<'_>) -> Result<Box<dyn Operator>, ConfigError> {
        let params: CaseParams = parse_params("case_normalization", &ctx.params)?;
        let fallback = params.mode.as_deref();
        let op = if ctx.build_state.postprocess_only {
            // In the postprocess-only block the configuration applies to
            // the target side, falling back to the top-level mode.
            let side = params.target.clone().unwrap_or_default();
            MonolingualOp::new(
                ctx.name,
                None,
                Some(CaseProcess::configured(side, fallback)),
                true,
            )
        } else {
            // Unconfigured sides still get a process so a per-call option
            // payload can act on them.
            let source = Some(match params.source {
                Some(side) => CaseProcess::configured(side, fallback),
                None => CaseProcess::unconfigured(),
            });
            let target = Some(match params.target {
                Some(side) => CaseProcess::configured(side, fallback),
                None => CaseProcess::unconfigured(),
            });
            MonolingualOp::new(ctx.name, source, target, false)
        };
        Ok(Box::new(op.with_options(true)))
    }
}

// ---------------------------------------------------------------------------
// alignment

/// A heavyweight alignment model, built once per distinct model path and
/// shared across pipeline variants and workers.
pub struct AlignmentModel {
    model_path: String,
    invocations: AtomicUsize,
}

impl AlignmentModel {
    pub fn new(model_path: &str) -> Self {
        Self {
            model_path: model_path.to_string(),
            invocations: AtomicUsize::new(0),
        }
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    /// Number of units aligned through this instance
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Monotone diagonal alignment between token sequences
    pub fn align(&self, src_len: usize, tgt_len: usize) -> Vec<(usize, usize)> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if src_len == 0 || tgt_len == 0 {
            return Vec::new();
        }
        (0..src_len)
            .map(|i| (i, i * tgt_len / src_len))
            .collect()
    }
}

impl SharedResource for AlignmentModel {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Deserialize)]
struct AlignmentParams {
    #[serde(default = "AlignmentParams::default_model")]
    model_path: String,
}

impl AlignmentParams {
    fn default_model() -> String {
        "identity".to_string()
    }
}

impl Default for AlignmentParams {
    fn default() -> Self {
        Self {
            model_path: Self::default_model(),
        }
    }
}

fn build_alignment_model(args: &[Value]) -> Result<Arc<dyn SharedResource>, ConfigError> {
    let path = args.first().and_then(|a| a.as_str()).ok_or_else(|| {
        ConfigError::InvalidParameters {
            operator: "alignment".to_string(),
            message: "model_path argument must be a string".to_string(),
        }
    })?;
    Ok(Arc::new(AlignmentModel::new(path)))
}

struct AlignmentFactory;

impl OperatorFactory for AlignmentFactory {
    fn applies_to(&self, process_type: ProcessType) -> bool {
        process_type == ProcessType::Training
    }

    fn shared_builders(&self, params: &Params, _process_type: ProcessType) -> Vec<SharedBuilderSpec> {
        let params: AlignmentParams = parse_params("alignment", params).unwrap_or_default();
        vec![SharedBuilderSpec {
            name: "aligner".to_string(),
            class: "AlignmentModel",
            args: vec![json!(params.model_path)],
            build: build_alignment_model,
        }]
    }

    fn build(&self, ctx: OperatorContext<'_>) -> Result<Box<dyn Operator>, ConfigError> {
        let params: AlignmentParams = parse_params("alignment", &ctx.params)?;
        // With a cache snapshot the model is shared; without one (plain
        // pipeline construction) a private instance is built.
        let model = match ctx.shared.and_then(|shared| shared.get("aligner")) {
            Some(model) => model.clone(),
            None => Arc::new(AlignmentModel::new(&params.model_path)),
        };
        Ok(Box::new(AlignmentOp {
            name: ctx.name,
            model,
        }))
    }
}

struct AlignmentOp {
    name: String,
    model: Arc<dyn SharedResource>,
}

impl Operator for AlignmentOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, batch: Batch, _options: Option<&Value>) -> Result<Batch, ProcessError> {
        let model = self
            .model
            .as_any()
            .downcast_ref::<AlignmentModel>()
            .ok_or_else(|| {
                ProcessError::Other("alignment operator received a foreign shared resource".into())
            })?;
        map_units_in_place(batch, |tu| {
            let src_len = word_count(tu, false);
            let tgt_len = word_count(tu, true);
            tu.alignment = Some(model.align(src_len, tgt_len));
            Ok(())
        })
    }
}
