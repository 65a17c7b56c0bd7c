/*!
 * Tests for configuration resolution: operator lookup, override matching
 * and label-driven pipeline variants.
 */

use serde_json::json;
use std::collections::BTreeSet;

use prepline::config::OperatorConfig;
use prepline::errors::ConfigError;
use prepline::operator::registry::{resolve_operators, OperatorRegistry};
use prepline::operator::ProcessType;
use prepline::pipeline::Pipeline;

use crate::common::test_registry;

fn entries(value: serde_json::Value) -> Vec<OperatorConfig> {
    serde_json::from_value(value).expect("valid operator entries")
}

#[test]
fn test_resolve_entryWithoutType_shouldFailWithConfigError() {
    let registry = OperatorRegistry::with_builtins();
    let entries = entries(json!([{"source": {"mode": "space"}}]));
    let result = resolve_operators(&registry, &entries, ProcessType::Training, None, None, true);
    assert!(matches!(result, Err(ConfigError::MissingOperatorType(_))));
}

#[test]
fn test_resolve_unregisteredType_shouldFailWithConfigError() {
    let registry = OperatorRegistry::with_builtins();
    let entries = entries(json!([{"op": "quantum_filter"}]));
    let result = resolve_operators(&registry, &entries, ProcessType::Training, None, None, true);
    assert!(matches!(
        result,
        Err(ConfigError::UnknownOperator(name)) if name == "quantum_filter"
    ));
}

#[test]
fn test_resolve_overrideMatching_zeroOneAndManyLabels() {
    let registry = OperatorRegistry::with_builtins();
    let entries = entries(json!([{
        "op": "tokenization",
        "source": {"mode": "space"},
        "overrides": {
            "A": {"source": {"mode": "aggressive"}},
            "B": {"source": {"mode": "space"}}
        }
    }]));

    // Empty label set leaves base parameters unmodified.
    let labels = BTreeSet::new();
    let resolved = resolve_operators(
        &registry,
        &entries,
        ProcessType::Training,
        Some(&labels),
        None,
        true,
    )
    .unwrap();
    assert_eq!(
        resolved[0].params.get("source").unwrap().get("mode"),
        Some(&json!("space"))
    );

    // A single matching label merges its override.
    let labels: BTreeSet<String> = ["A".to_string()].into();
    let resolved = resolve_operators(
        &registry,
        &entries,
        ProcessType::Training,
        Some(&labels),
        None,
        true,
    )
    .unwrap();
    assert_eq!(
        resolved[0].params.get("source").unwrap().get("mode"),
        Some(&json!("aggressive"))
    );

    // Two matching labels are ambiguous.
    let labels: BTreeSet<String> = ["A".to_string(), "B".to_string()].into();
    let result = resolve_operators(
        &registry,
        &entries,
        ProcessType::Training,
        Some(&labels),
        None,
        true,
    );
    assert!(matches!(
        result,
        Err(ConfigError::AmbiguousOverride { operator, labels })
            if operator == "tokenization" && labels.len() == 2
    ));
}

#[test]
fn test_resolve_overriddenDisabled_shouldSkipOperatorForLabel() {
    let registry = OperatorRegistry::with_builtins();
    let entries = entries(json!([{
        "op": "tokenization",
        "overrides": {"IT": {"disabled": true}}
    }]));

    let labels: BTreeSet<String> = ["IT".to_string()].into();
    let resolved = resolve_operators(
        &registry,
        &entries,
        ProcessType::Training,
        Some(&labels),
        None,
        true,
    )
    .unwrap();
    assert!(resolved.is_empty());

    let resolved =
        resolve_operators(&registry, &entries, ProcessType::Training, None, None, true).unwrap();
    assert_eq!(resolved.len(), 1);
}

#[test]
fn test_pipeline_overrideLabel_shouldReachBuildState() {
    let registry = test_registry();
    let config = serde_json::from_value(json!({
        "source": "en",
        "target": "fr",
        "preprocess": [{
            "op": "tokenization",
            "source": {"mode": "space"},
            "target": {"mode": "space"},
            "overrides": {"IT": {"source": {"mode": "aggressive"}}}
        }]
    }))
    .unwrap();

    let label: BTreeSet<String> = ["IT".to_string()].into();
    let pipeline = Pipeline::new(
        &registry,
        &config,
        ProcessType::Training,
        None,
        Some(label.clone()),
        None,
    )
    .unwrap();
    assert_eq!(
        pipeline.build_state().src_tokenizer,
        Some("aggressive".to_string())
    );
    assert_eq!(pipeline.override_label(), Some(&label));

    let default_pipeline =
        Pipeline::new(&registry, &config, ProcessType::Training, None, None, None).unwrap();
    assert_eq!(
        default_pipeline.build_state().src_tokenizer,
        Some("space".to_string())
    );
}
