//! Property-based tests for the override merge.

use std::collections::BTreeMap;

use proptest::prelude::*;

use expbuddy::overrides::apply_args;
use expbuddy::{BuddyError, HyperparameterSet, ParamValue};

fn set_from(values: &BTreeMap<String, i64>) -> HyperparameterSet {
    values
        .iter()
        .fold(HyperparameterSet::new(), |set, (k, v)| set.with(k.as_str(), *v))
}

/// Parameter names plus, for some of them, a replacement value.
fn params_and_overrides() -> impl Strategy<Value = (BTreeMap<String, i64>, BTreeMap<String, i64>)> {
    prop::collection::btree_map("[a-z][a-z0-9_]{0,8}", any::<i64>(), 1..12).prop_flat_map(|params| {
        let keys: Vec<String> = params.keys().cloned().collect();
        let picked = prop::sample::subsequence(keys.clone(), 0..=keys.len());
        let news = prop::collection::vec(any::<i64>(), keys.len());
        (Just(params), picked, news).prop_map(|(params, picked, news)| {
            let overrides = picked.into_iter().zip(news).collect();
            (params, overrides)
        })
    })
}

proptest! {
    #[test]
    fn overridden_keys_take_new_values_and_others_keep_theirs(
        (params, overrides) in params_and_overrides(),
        escape in any::<bool>(),
    ) {
        let set = set_from(&params);
        let prefix = if escape { "--^" } else { "--" };
        let args: Vec<String> = overrides.iter().map(|(k, v)| format!("{prefix}{k}={v}")).collect();

        let merged = apply_args(&set, &args).unwrap();
        prop_assert_eq!(merged.keys(), set.keys());
        for (name, original) in &params {
            let expected = overrides.get(name).unwrap_or(original);
            prop_assert_eq!(merged.get(name), Some(&ParamValue::Int(*expected)));
        }
    }

    #[test]
    fn unknown_key_anywhere_rejects_the_whole_merge(
        (params, overrides) in params_and_overrides(),
        position in any::<prop::sample::Index>(),
    ) {
        let set = set_from(&params);
        let mut args: Vec<String> = overrides.iter().map(|(k, v)| format!("--{k}={v}")).collect();
        // upper case never matches a generated name
        args.insert(position.index(args.len() + 1), "--UNKNOWN=1".to_string());

        let err = apply_args(&set, &args).unwrap_err();
        let is_unknown = matches!(err, BuddyError::UnknownParameter { ref name, .. } if name == "UNKNOWN");
        prop_assert!(is_unknown);
        prop_assert_eq!(set, set_from(&params));
    }
}
