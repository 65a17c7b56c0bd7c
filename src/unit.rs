/*!
 * Translation units and batches.
 *
 * A `TranslationUnit` is one parallel example carrying its source and target
 * sides in tokenized and detokenized form, each possibly split into several
 * named parts (multipart segments). Operators mutate units in place as a
 * batch flows through the pipeline; a unit is finalized into its exported
 * form only after the last operator has run.
 */

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::Params;
use crate::operator::ProcessType;

/// One part of a multipart segment.
///
/// A part holds the detokenized text, the token list, or both; whichever
/// form is absent is derived on demand with whitespace splitting/joining.
/// Setting one form invalidates the other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Part {
    /// Part name, when the segment is multipart
    pub name: Option<String>,
    detok: Option<String>,
    tok: Option<Vec<String>>,
}

impl Part {
    /// Create a part from detokenized text
    pub fn from_text(text: &str) -> Self {
        Self {
            name: None,
            detok: Some(text.to_string()),
            tok: None,
        }
    }

    /// Create a part from a token list
    pub fn from_tokens(tokens: Vec<String>) -> Self {
        Self {
            name: None,
            detok: None,
            tok: Some(tokens),
        }
    }

    /// Create a named part from detokenized text
    pub fn named(name: &str, text: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            detok: Some(text.to_string()),
            tok: None,
        }
    }

    /// Detokenized form, derived from the tokens when not stored
    pub fn detok(&self) -> String {
        match (&self.detok, &self.tok) {
            (Some(text), _) => text.clone(),
            (None, Some(tokens)) => tokens.join(" "),
            (None, None) => String::new(),
        }
    }

    /// Tokenized form, derived from the text when not stored
    pub fn tokens(&self) -> Vec<String> {
        match (&self.tok, &self.detok) {
            (Some(tokens), _) => tokens.clone(),
            (None, Some(text)) => text.split_whitespace().map(|t| t.to_string()).collect(),
            (None, None) => Vec::new(),
        }
    }

    /// Replace the detokenized form, invalidating stale tokens
    pub fn set_detok(&mut self, text: String) {
        self.detok = Some(text);
        self.tok = None;
    }

    /// Replace the tokenized form, invalidating stale text
    pub fn set_tokens(&mut self, tokens: Vec<String>) {
        self.tok = Some(tokens);
        self.detok = None;
    }

    fn finalize(&mut self, process_type: ProcessType) {
        // Lock the exported form in place so export is a cheap read.
        if process_type == ProcessType::Postprocess {
            self.detok = Some(self.detok());
        } else {
            self.tok = Some(self.tokens());
        }
    }
}

/// One side (source or target) of a translation unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Side {
    parts: Vec<Part>,
}

impl Side {
    /// Single-part side from detokenized text
    pub fn from_text(text: &str) -> Self {
        Self {
            parts: vec![Part::from_text(text)],
        }
    }

    /// Multipart side
    pub fn from_parts(parts: Vec<Part>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn parts_mut(&mut self) -> &mut [Part] {
        &mut self.parts
    }

    /// Detokenized text of the whole side, parts joined with a space
    pub fn detok(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.detok())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Token lists, one per part
    pub fn token_parts(&self) -> Vec<Vec<String>> {
        self.parts.iter().map(|p| p.tokens()).collect()
    }
}

/// One parallel example flowing through the pipeline
#[derive(Debug, Clone, Default)]
pub struct TranslationUnit {
    /// Source side
    pub source: Side,
    /// Target side; absent for monolingual inference input
    pub target: Option<Side>,
    /// Free-form unit metadata carried through the pipeline
    pub metadata: Params,
    /// Word alignment between source and target tokens, when computed
    pub alignment: Option<Vec<(usize, usize)>>,
}

impl TranslationUnit {
    /// Unit with a source side only
    pub fn from_source(text: &str) -> Self {
        Self {
            source: Side::from_text(text),
            ..Default::default()
        }
    }

    /// Unit with both sides
    pub fn from_pair(source: &str, target: &str) -> Self {
        Self {
            source: Side::from_text(source),
            target: Some(Side::from_text(target)),
            ..Default::default()
        }
    }

    /// Lock every part into the form exported for this process type
    pub fn finalize(&mut self, process_type: ProcessType) {
        for part in self.source.parts_mut() {
            part.finalize(process_type);
        }
        if let Some(target) = self.target.as_mut() {
            for part in target.parts_mut() {
                part.finalize(process_type);
            }
        }
    }

    /// Externally consumed form: token parts for forward processing,
    /// detokenized target text for postprocess
    pub fn export(&self, process_type: ProcessType) -> UnitExport {
        if process_type == ProcessType::Postprocess {
            UnitExport::Text {
                target: self.target.as_ref().map(|t| t.detok()).unwrap_or_default(),
            }
        } else {
            UnitExport::Tokens {
                source: self.source.token_parts(),
                target: self.target.as_ref().map(|t| t.token_parts()),
                metadata: self.metadata.clone(),
            }
        }
    }
}

/// Exported form of one unit
#[derive(Debug, Clone, PartialEq)]
pub enum UnitExport {
    /// Forward processing output
    Tokens {
        /// Source token lists, one per part
        source: Vec<Vec<String>>,
        /// Target token lists, one per part
        target: Option<Vec<Vec<String>>>,
        /// Unit metadata
        metadata: Params,
    },
    /// Postprocess output
    Text {
        /// Detokenized target text
        target: String,
    },
}

/// Batch metadata accumulated while the batch flows through the pipeline
#[derive(Debug, Clone, Default)]
pub struct BatchMeta {
    /// Corpus label selecting configuration overrides: absent, a string,
    /// or a list of strings. Other shapes are treated as "no label".
    pub label: Option<Value>,
    /// Source/corpus name supplied by the loader
    pub base_name: Option<String>,
    /// Per-filter drop counts, keyed by operator name
    pub filter_summary: BTreeMap<String, usize>,
    /// Per-operator wall-clock seconds, recorded for training only
    pub ops_profile: BTreeMap<String, f64>,
    /// Any other metadata supplied by the loader
    pub extra: Params,
}

impl BatchMeta {
    /// Canonical label set for override matching.
    ///
    /// Absent labels and non-string/list shapes (notably mappings) yield
    /// `None`, selecting the default configuration and shared state.
    pub fn label_set(&self) -> Option<BTreeSet<String>> {
        match &self.label {
            Some(Value::String(label)) => {
                let mut set = BTreeSet::new();
                set.insert(label.clone());
                Some(set)
            }
            Some(Value::Array(labels)) => {
                let set: BTreeSet<String> = labels
                    .iter()
                    .filter_map(|l| l.as_str().map(|s| s.to_string()))
                    .collect();
                if set.is_empty() { None } else { Some(set) }
            }
            _ => None,
        }
    }
}

/// (ordered unit list, metadata) pair, the unit of pipeline execution
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub units: Vec<TranslationUnit>,
    pub meta: BatchMeta,
}

impl Batch {
    pub fn new(units: Vec<TranslationUnit>) -> Self {
        Self {
            units,
            meta: BatchMeta::default(),
        }
    }

    pub fn with_meta(units: Vec<TranslationUnit>, meta: BatchMeta) -> Self {
        Self { units, meta }
    }
}

/// Pipeline output handed to a consumer, in strict loader order
#[derive(Debug, Clone)]
pub struct ProcessedBatch {
    /// Exported units
    pub outputs: Vec<UnitExport>,
    /// Metadata after the pipeline ran (filter summary, profile, ...)
    pub meta: BatchMeta,
}
