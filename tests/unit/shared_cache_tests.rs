/*!
 * Tests for the shared resource cache: instance identity per label and
 * rebuild behavior for distinct constructor arguments.
 */

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

use prepline::config::RootConfig;
use prepline::operator::registry::OperatorRegistry;
use prepline::operator::ProcessType;
use prepline::shared::SharedResourceCache;

fn aligned_config() -> Arc<RootConfig> {
    Arc::new(
        serde_json::from_value(json!({
            "source": "en",
            "target": "fr",
            "preprocess": [
                {"op": "tokenization"},
                {
                    "op": "alignment",
                    "model_path": "models/base.align",
                    "overrides": {"IT": {"model_path": "models/it.align"}}
                }
            ]
        }))
        .unwrap(),
    )
}

fn cache() -> SharedResourceCache {
    SharedResourceCache::new(
        Arc::new(OperatorRegistry::with_builtins()),
        aligned_config(),
        ProcessType::Training,
        None,
    )
    .unwrap()
}

#[test]
fn test_sharedCache_sameLabelTwice_returnsIdenticalInstances() {
    let cache = cache();
    let label: BTreeSet<String> = ["IT".to_string()].into();

    let first = cache.get(Some(&label)).unwrap();
    let second = cache.get(Some(&label)).unwrap();

    let a = first.get(&1).unwrap().get("aligner").unwrap();
    let b = second.get(&1).unwrap().get("aligner").unwrap();
    assert!(Arc::ptr_eq(a, b));
}

#[test]
fn test_sharedCache_differentConstructorArgs_yieldDistinctInstances() {
    let cache = cache();
    let label: BTreeSet<String> = ["IT".to_string()].into();

    let default_state = cache.get(None).unwrap();
    let labelled_state = cache.get(Some(&label)).unwrap();

    let base = default_state.get(&1).unwrap().get("aligner").unwrap();
    let overridden = labelled_state.get(&1).unwrap().get("aligner").unwrap();
    assert!(!Arc::ptr_eq(base, overridden));
}

#[test]
fn test_sharedCache_sameArgsUnderDifferentLabel_reusesInstance() {
    let cache = cache();
    // A label with no matching override resolves to the base arguments, so
    // the default instance is reused rather than rebuilt.
    let label: BTreeSet<String> = ["LEGAL".to_string()].into();

    let default_state = cache.get(None).unwrap();
    let labelled_state = cache.get(Some(&label)).unwrap();

    let base = default_state.get(&1).unwrap().get("aligner").unwrap();
    let same = labelled_state.get(&1).unwrap().get("aligner").unwrap();
    assert!(Arc::ptr_eq(base, same));
}

#[test]
fn test_sharedCache_defaultSnapshot_isEagerlyCached() {
    let cache = cache();
    let default_state = cache.default_snapshot();
    let fetched = cache.get(None).unwrap();
    assert!(Arc::ptr_eq(&default_state, &fetched));
    // Operators without shared builders contribute no entry.
    assert!(!default_state.contains_key(&0));
    assert!(default_state.contains_key(&1));
}
